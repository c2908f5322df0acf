use std::fmt;
use std::net::SocketAddr;

use bytes::Bytes;
use spark_altcp::{
    ConnId, Event, Layer, Result, ShutdownDirection, Stack, TcpState, TransportError, WriteFlags,
};
use tracing::debug;

use crate::layer::TcpLayer;

/// TCP 引擎对单个协议控制块（PCB）暴露的能力契约。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 明文适配层不关心拥塞控制与重传，只需要一个“能收发字节、能回调事件”的引擎句柄；
///   把这组能力收敛成 trait，嵌入式 TCP 引擎、内存回环引擎与测试桩都可以替换进来。
///
/// ## 契约（What）
/// - `write` 要么全部接收，要么返回 [`TransportError::WouldBlock`]（发送缓冲不足），不存在部分写入；
/// - `close` 可失败（例如引擎内存不足）；失败时 PCB 保持原状，调用方稍后重试；
/// - `abort` 立即释放 PCB 并向对端发送 RST，之后引擎不得再为其回调任何事件；
/// - `attach(id)` 之后引擎通过 [`dispatch`] 把事件送往 `id`；`detach` 之后引擎不再回调。
///
/// ## 注意事项（Trade-offs）
/// - `shutdown` 只会收到 `Read` 或 `Write`，双向关闭由适配层转换为 `close`。
pub trait TcpPcb {
    fn bind(&mut self, addr: SocketAddr) -> Result<()>;
    fn connect(&mut self, addr: SocketAddr) -> Result<()>;
    fn listen(&mut self, backlog: u8) -> Result<()>;
    fn write(&mut self, data: &[u8], flags: WriteFlags) -> Result<()>;
    fn output(&mut self) -> Result<()>;
    /// 应用已消费 `len` 字节，引擎据此扩大接收窗口。
    fn recved(&mut self, len: usize);
    fn close(&mut self) -> Result<()>;
    fn shutdown(&mut self, direction: ShutdownDirection) -> Result<()>;
    fn abort(&mut self);
    fn mss(&self) -> u16;
    /// 发送缓冲剩余可写字节数。
    fn sndbuf(&self) -> usize;
    fn sndqueuelen(&self) -> usize;
    fn set_nagle(&mut self, disabled: bool);
    fn nagle_disabled(&self) -> bool;
    fn set_prio(&mut self, prio: u8);
    fn local_addr(&self) -> Option<SocketAddr>;
    fn remote_addr(&self) -> Option<SocketAddr>;
    fn state(&self) -> TcpState;
    fn set_poll_interval(&mut self, interval: u8);
    fn attach(&mut self, id: ConnId);
    fn detach(&mut self);
}

/// TCP 引擎回送给适配层的事件。
pub enum TcpEvent {
    /// 监听 PCB 接受了新的对端，携带新 PCB。
    Accept(Box<dyn TcpPcb>),
    Connected(Result<()>),
    /// `None` 表示对端 FIN。
    Recv(Option<Bytes>),
    Sent(usize),
    Poll,
    /// 致命错误：引擎在回调前已经释放了 PCB。
    Error(TransportError),
}

impl fmt::Debug for TcpEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TcpEvent::Accept(_) => f.write_str("Accept(..)"),
            TcpEvent::Connected(result) => f.debug_tuple("Connected").field(result).finish(),
            TcpEvent::Recv(data) => f
                .debug_tuple("Recv")
                .field(&data.as_ref().map(Bytes::len))
                .finish(),
            TcpEvent::Sent(len) => f.debug_tuple("Sent").field(len).finish(),
            TcpEvent::Poll => f.write_str("Poll"),
            TcpEvent::Error(reason) => f.debug_tuple("Error").field(reason).finish(),
        }
    }
}

/// 用一个已经建立（或尚未使用）的 PCB 创建明文连接。
pub fn new_conn(stack: &mut Stack, mut pcb: Box<dyn TcpPcb>) -> ConnId {
    stack.insert_with(move |id| {
        pcb.attach(id);
        Box::new(TcpLayer::new(pcb)) as Box<dyn Layer>
    })
}

/// 引擎回调入口：把 PCB 事件交给句柄 `id` 对应的明文连接。
///
/// `Accept` 会先为新 PCB 分配连接，再通知监听连接；监听连接已失效或拒绝时新 PCB 被中止。
pub fn dispatch(stack: &mut Stack, id: ConnId, event: TcpEvent) -> Result<()> {
    let event = match event {
        TcpEvent::Accept(mut pcb) => {
            if !stack.is_alive(id) {
                debug!(listener = %id, "listener gone, resetting accepted pcb");
                pcb.abort();
                return Err(TransportError::InvalidArgument);
            }
            let new = new_conn(stack, pcb);
            if let Err(err) = stack.inject(id, Event::Accept(new)) {
                stack.abort(new);
                return Err(err);
            }
            return Ok(());
        }
        TcpEvent::Connected(result) => Event::Connected(result),
        TcpEvent::Recv(data) => Event::Recv(data),
        TcpEvent::Sent(len) => Event::Sent(len),
        TcpEvent::Poll => Event::Poll,
        TcpEvent::Error(reason) => Event::Error(reason),
    };
    stack.inject(id, event)
}
