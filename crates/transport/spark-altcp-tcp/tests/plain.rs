//! 明文适配层在回环引擎上的端到端行为。
//!
//! # 测试目标（Why）
//! - 建连、收发、关闭与中止都必须经由通用连接 API 完成，适配层不能泄漏引擎细节；
//! - 应用拒收的数据要原样重投，FIN 不能越过尚未被接受的数据；
//! - 关闭失败后连接仍能收到回调，调用方可以稍后重试。

use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;

use spark_altcp::{ConnId, ShutdownDirection, Stack, TcpState, TransportError, WriteFlags};
use spark_altcp_tcp::{LoopbackNet, LoopbackOptions, TcpLayer, new_conn};
use tracing_test::traced_test;

type Log = Rc<RefCell<Vec<String>>>;

fn listener(net: &LoopbackNet, stack: &mut Stack) -> (ConnId, SocketAddr) {
    let id = new_conn(stack, Box::new(net.open()));
    stack
        .bind(id, "127.0.0.1:0".parse().expect("地址字面量"))
        .expect("绑定");
    stack.listen(id, 4).expect("监听");
    let addr = stack.local_addr(id).expect("监听地址");
    (id, addr)
}

/// 服务端：接受的每个连接都把收到的数据记到 `log` 并立即确认。
fn recording_server(
    stack: &mut Stack,
    listener: ConnId,
    log: Log,
    accepted: Rc<RefCell<Vec<ConnId>>>,
) {
    stack
        .set_accept(listener, move |stack, _, new| {
            accepted.borrow_mut().push(new);
            let log = log.clone();
            stack.set_recv(new, move |stack, id, data| {
                match data {
                    Some(bytes) => {
                        log.borrow_mut()
                            .push(String::from_utf8_lossy(&bytes).into_owned());
                        stack.recved(id, bytes.len());
                    }
                    None => log.borrow_mut().push("<eof>".into()),
                }
                Ok(())
            })
        })
        .expect("注册 accept");
}

fn client(net: &LoopbackNet, stack: &mut Stack, addr: SocketAddr) -> (ConnId, Rc<RefCell<u32>>) {
    let id = new_conn(stack, Box::new(net.open()));
    let connected = Rc::new(RefCell::new(0));
    let counter = connected.clone();
    stack
        .connect_with(id, addr, move |_, _, result| {
            assert_eq!(result, Ok(()));
            *counter.borrow_mut() += 1;
        })
        .expect("发起连接");
    (id, connected)
}

#[test]
fn data_flows_end_to_end() {
    let net = LoopbackNet::default();
    let mut stack = Stack::new();
    let (server, addr) = listener(&net, &mut stack);
    let log = Log::default();
    let accepted = Rc::new(RefCell::new(Vec::new()));
    recording_server(&mut stack, server, log.clone(), accepted.clone());

    let (conn, connected) = client(&net, &mut stack, addr);
    net.run(&mut stack);
    assert_eq!(*connected.borrow(), 1);
    assert_eq!(accepted.borrow().len(), 1);
    assert_eq!(stack.tcp_state(conn), TcpState::Established);
    assert_eq!(stack.remote_addr(conn), Some(addr));
    assert_eq!(stack.mss(conn), 1460);

    stack.write(conn, b"ping", WriteFlags::COPY).expect("写入");
    stack.output(conn).expect("推送");
    net.run(&mut stack);
    assert_eq!(*log.borrow(), vec!["ping"]);

    stack.close(conn).expect("关闭");
    net.run(&mut stack);
    assert_eq!(*log.borrow(), vec!["ping", "<eof>"]);
    let server_conn = accepted.borrow()[0];
    assert_eq!(stack.tcp_state(server_conn), TcpState::CloseWait);
}

#[test]
fn sent_callback_reports_acknowledged_bytes() {
    let net = LoopbackNet::new(LoopbackOptions {
        mss: 100,
        ..LoopbackOptions::default()
    });
    let mut stack = Stack::new();
    let (server, addr) = listener(&net, &mut stack);
    recording_server(&mut stack, server, Log::default(), Rc::default());
    let (conn, _) = client(&net, &mut stack, addr);
    net.run(&mut stack);

    let sent = Rc::new(RefCell::new(Vec::new()));
    let sink = sent.clone();
    stack
        .set_sent(conn, move |_, _, len| sink.borrow_mut().push(len))
        .expect("注册 sent");
    stack.write(conn, &[7u8; 250], WriteFlags::COPY).expect("写入");
    net.run(&mut stack);
    assert_eq!(*sent.borrow(), vec![100, 100, 50]);
    assert_eq!(stack.sndbuf(conn), 8192);
}

#[test]
fn refused_data_is_redelivered_on_poll() {
    let net = LoopbackNet::default();
    let mut stack = Stack::new();
    let (server, addr) = listener(&net, &mut stack);
    let seen = Log::default();
    let accepting = Rc::new(RefCell::new(false));
    {
        let seen = seen.clone();
        let accepting = accepting.clone();
        stack
            .set_accept(server, move |stack, _, new| {
                let seen = seen.clone();
                let accepting = accepting.clone();
                stack.set_poll(new, 1, |_, _| {})?;
                stack.set_recv(new, move |stack, id, data| {
                    let Some(bytes) = data else {
                        seen.borrow_mut().push("<eof>".into());
                        return Ok(());
                    };
                    let text = String::from_utf8_lossy(&bytes).into_owned();
                    if !*accepting.borrow() {
                        seen.borrow_mut().push(format!("refused {text}"));
                        return Err(TransportError::WouldBlock);
                    }
                    seen.borrow_mut().push(text);
                    stack.recved(id, bytes.len());
                    Ok(())
                })
            })
            .expect("注册 accept");
    }
    let (conn, _) = client(&net, &mut stack, addr);
    net.run(&mut stack);
    stack.write(conn, b"hello", WriteFlags::COPY).expect("写入");
    net.run(&mut stack);
    assert_eq!(*seen.borrow(), vec!["refused hello"]);

    *accepting.borrow_mut() = true;
    net.tick(&mut stack);
    net.run(&mut stack);
    assert_eq!(*seen.borrow(), vec!["refused hello", "hello"]);
}

#[test]
fn fin_waits_behind_refused_data() {
    let net = LoopbackNet::default();
    let mut stack = Stack::new();
    let (server, addr) = listener(&net, &mut stack);
    let seen = Log::default();
    let accepting = Rc::new(RefCell::new(false));
    let accepted = Rc::new(RefCell::new(None));
    {
        let seen = seen.clone();
        let accepting = accepting.clone();
        let accepted = accepted.clone();
        stack
            .set_accept(server, move |stack, _, new| {
                *accepted.borrow_mut() = Some(new);
                let seen = seen.clone();
                let accepting = accepting.clone();
                stack.set_poll(new, 1, |_, _| {})?;
                stack.set_recv(new, move |stack, id, data| match data {
                    None => {
                        seen.borrow_mut().push("<eof>".into());
                        Ok(())
                    }
                    Some(_) if !*accepting.borrow() => Err(TransportError::WouldBlock),
                    Some(bytes) => {
                        seen.borrow_mut()
                            .push(String::from_utf8_lossy(&bytes).into_owned());
                        stack.recved(id, bytes.len());
                        Ok(())
                    }
                })
            })
            .expect("注册 accept");
    }
    let (conn, _) = client(&net, &mut stack, addr);
    net.run(&mut stack);
    stack.write(conn, b"tail", WriteFlags::COPY).expect("写入");
    stack.close(conn).expect("关闭");
    net.run(&mut stack);
    assert!(seen.borrow().is_empty(), "FIN 不得越过被拒收的数据");
    let server_conn = accepted.borrow().expect("已接受连接");
    assert_eq!(
        stack.layer::<TcpLayer>(server_conn).map(TcpLayer::pending_rx),
        Some(4)
    );

    *accepting.borrow_mut() = true;
    net.tick(&mut stack);
    net.run(&mut stack);
    assert_eq!(*seen.borrow(), vec!["tail", "<eof>"]);
}

#[test]
#[traced_test]
fn failed_close_rearms_callbacks() {
    let net = LoopbackNet::default();
    let mut stack = Stack::new();
    let (server, addr) = listener(&net, &mut stack);
    let accepted = Rc::new(RefCell::new(Vec::new()));
    recording_server(&mut stack, server, Log::default(), accepted.clone());
    let (conn, _) = client(&net, &mut stack, addr);
    stack.set_poll(conn, 3, |_, _| {}).expect("注册 poll");
    net.run(&mut stack);

    let received = Log::default();
    let sink = received.clone();
    stack
        .set_recv(conn, move |stack, id, data| {
            if let Some(bytes) = data {
                sink.borrow_mut()
                    .push(String::from_utf8_lossy(&bytes).into_owned());
                stack.recved(id, bytes.len());
            }
            Ok(())
        })
        .expect("注册 recv");

    assert!(net.fail_next_closes(conn, 1));
    assert_eq!(stack.close(conn), Err(TransportError::OutOfMemory));
    assert!(stack.is_alive(conn));
    assert!(logs_contain("tcp close failed"));

    let server_conn = accepted.borrow()[0];
    stack
        .write(server_conn, b"still here", WriteFlags::COPY)
        .expect("服务端写入");
    net.run(&mut stack);
    assert_eq!(*received.borrow(), vec!["still here"]);

    stack.close(conn).expect("重试关闭");
    assert!(!stack.is_alive(conn));
}

#[test]
fn refused_connection_reports_reset() {
    let net = LoopbackNet::default();
    let mut stack = Stack::new();
    let conn = new_conn(&mut stack, Box::new(net.open()));
    let errors = Rc::new(RefCell::new(Vec::new()));
    let sink = errors.clone();
    stack
        .set_err(conn, move |_, reason| sink.borrow_mut().push(reason))
        .expect("注册 err");
    stack
        .connect_with(
            conn,
            "127.0.0.1:9".parse().expect("地址字面量"),
            |_, _, _| panic!("连接被拒绝时不应回调 connected"),
        )
        .expect("发起连接");
    net.run(&mut stack);
    assert_eq!(*errors.borrow(), vec![TransportError::Reset]);
    assert!(!stack.is_alive(conn));
}

#[test]
fn abort_resets_the_peer() {
    let net = LoopbackNet::default();
    let mut stack = Stack::new();
    let (server, addr) = listener(&net, &mut stack);
    let peer_errors = Rc::new(RefCell::new(Vec::new()));
    {
        let peer_errors = peer_errors.clone();
        stack
            .set_accept(server, move |stack, _, new| {
                let peer_errors = peer_errors.clone();
                stack.set_err(new, move |_, reason| peer_errors.borrow_mut().push(reason))
            })
            .expect("注册 accept");
    }
    let (conn, _) = client(&net, &mut stack, addr);
    let local_errors = Rc::new(RefCell::new(Vec::new()));
    let sink = local_errors.clone();
    stack
        .set_err(conn, move |_, reason| sink.borrow_mut().push(reason))
        .expect("注册 err");
    net.run(&mut stack);

    stack.abort(conn);
    assert_eq!(*local_errors.borrow(), vec![TransportError::Aborted]);
    net.run(&mut stack);
    assert_eq!(*peer_errors.borrow(), vec![TransportError::Reset]);
}

#[test]
fn refused_accept_resets_the_client() {
    let net = LoopbackNet::default();
    let mut stack = Stack::new();
    let (server, addr) = listener(&net, &mut stack);
    stack
        .set_accept(server, |_, _, _| Err(TransportError::OutOfMemory))
        .expect("注册 accept");
    let (conn, connected) = client(&net, &mut stack, addr);
    let errors = Rc::new(RefCell::new(Vec::new()));
    let sink = errors.clone();
    stack
        .set_err(conn, move |_, reason| sink.borrow_mut().push(reason))
        .expect("注册 err");
    net.run(&mut stack);
    assert_eq!(*connected.borrow(), 1);
    assert_eq!(*errors.borrow(), vec![TransportError::Reset]);
    assert_eq!(stack.len(), 1);
}

#[test]
fn read_shutdown_acknowledges_and_drops() {
    let net = LoopbackNet::default();
    let mut stack = Stack::new();
    let (server, addr) = listener(&net, &mut stack);
    let log = Log::default();
    let accepted = Rc::new(RefCell::new(Vec::new()));
    recording_server(&mut stack, server, log.clone(), accepted.clone());
    let (conn, _) = client(&net, &mut stack, addr);
    net.run(&mut stack);

    let server_conn = accepted.borrow()[0];
    stack
        .shutdown(server_conn, ShutdownDirection::Read)
        .expect("关闭读方向");
    stack.write(conn, b"ignored", WriteFlags::COPY).expect("写入");
    net.run(&mut stack);
    assert!(log.borrow().is_empty());
    let stats = net.stats(server_conn).expect("服务端 PCB");
    assert_eq!(stats.received, 7);
    assert_eq!(stats.acked, 7);
}

#[test]
fn nagle_and_priority_reach_the_engine() {
    let net = LoopbackNet::default();
    let mut stack = Stack::new();
    let conn = new_conn(&mut stack, Box::new(net.open()));
    assert!(!stack.nagle_disabled(conn));
    stack.nagle_disable(conn);
    assert!(stack.nagle_disabled(conn));
    stack.nagle_enable(conn);
    assert!(!stack.nagle_disabled(conn));
    stack.setprio(conn, 7);
    assert_eq!(stack.tcp_state(conn), TcpState::Closed);
    assert_eq!(
        stack.write(conn, b"early", WriteFlags::COPY),
        Err(TransportError::Closed)
    );
}
