//! 明文通道在任意分段、任意窗口下的字节流完整性。
//!
//! - **核心目标 (Why)**：引擎按 MSS、窗口与分段计划切分数据，适配层按需暂存与重投；
//!   无论切分方式如何，接收方看到的字节序列都必须与发送方写入的完全一致，且窗口最终全部归还；
//! - **设计手法 (How)**：随机生成载荷、分段计划与窗口大小，接收方每收到一段只确认、不拒收。

use std::cell::RefCell;
use std::rc::Rc;

use proptest::prelude::*;
use spark_altcp::{Stack, WriteFlags};
use spark_altcp_tcp::{LoopbackNet, LoopbackOptions, new_conn};

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_stream_survives_arbitrary_segmentation(
        payload in prop::collection::vec(any::<u8>(), 1..6000),
        plan in prop::collection::vec(1usize..300, 0..12),
        window in 64usize..4096,
        mss in 16u16..1460,
    ) {
        let net = LoopbackNet::new(LoopbackOptions { mss, sndbuf: 8192, window });
        let mut stack = Stack::new();
        let listener = new_conn(&mut stack, Box::new(net.open()));
        stack.listen(listener, 1).expect("监听");
        let addr = stack.local_addr(listener).expect("监听地址");

        let received = Rc::new(RefCell::new(Vec::new()));
        let accepted = Rc::new(RefCell::new(None));
        {
            let received = received.clone();
            let accepted = accepted.clone();
            stack.set_accept(listener, move |stack, _, new| {
                *accepted.borrow_mut() = Some(new);
                let received = received.clone();
                stack.set_recv(new, move |stack, id, data| {
                    if let Some(bytes) = data {
                        received.borrow_mut().extend_from_slice(&bytes);
                        stack.recved(id, bytes.len());
                    }
                    Ok(())
                })
            }).expect("注册 accept");
        }

        let client = new_conn(&mut stack, Box::new(net.open()));
        stack.connect(client, addr).expect("连接");
        net.run(&mut stack);
        prop_assert!(net.split_next(client, &plan));
        stack.write(client, &payload, WriteFlags::COPY).expect("写入");
        net.run(&mut stack);

        prop_assert_eq!(&*received.borrow(), &payload);
        let server = accepted.borrow().expect("已接受连接");
        let stats = net.stats(server).expect("服务端 PCB");
        prop_assert_eq!(stats.received, payload.len());
        prop_assert_eq!(stats.acked, stats.received);
    }
}
