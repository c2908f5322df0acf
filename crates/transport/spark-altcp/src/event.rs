use std::ops::BitOr;

use bytes::Bytes;

use crate::{ConnId, error::TransportError};

/// 自下而上流动的连接事件。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 同一组事件既描述“TCP 引擎 → 明文适配器”，也描述“内层连接 → 外层适配器 → 应用”，
///   让每一层只需实现一个 [`Layer::on_lower`](crate::Layer::on_lower) 入口；
/// - 事件不直接调用应用代码，而是进入 [`Stack`](crate::Stack) 的队列，由事件泵顺序投递，
///   从而把“回调中重入并销毁连接”转化为顺序处理。
///
/// ## 契约（What）
/// - `Accept(new)`：监听连接收到新的对端，`new` 是已分配好的同层连接；
/// - `Connected(result)`：主动打开完成（TLS 层在握手完成后才上抛成功）；
/// - `Recv(Some(bytes))`：有序数据，接收方返回 `Err` 表示“暂不接收”，数据留在发出方；
/// - `Recv(None)`：对端半关闭（end-of-stream），每个连接至多一次；
/// - `Sent(len)`：下层确认了 `len` 字节，TLS 层以 `0` 表示“可以继续写”；
/// - `Poll`：周期性轮询；
/// - `Error(reason)`：终止事件，发出方在投递后即不可用。
#[derive(Debug)]
#[non_exhaustive]
pub enum Event {
    Accept(ConnId),
    Connected(Result<(), TransportError>),
    Recv(Option<Bytes>),
    Sent(usize),
    Poll,
    Error(TransportError),
}

impl Event {
    pub(crate) fn label(&self) -> &'static str {
        match self {
            Event::Accept(_) => "accept",
            Event::Connected(_) => "connected",
            Event::Recv(Some(_)) => "recv",
            Event::Recv(None) => "eof",
            Event::Sent(_) => "sent",
            Event::Poll => "poll",
            Event::Error(_) => "error",
        }
    }
}

/// 写入标志，语义与 TCP 引擎的写 API 保持一致。
///
/// - `COPY`：引擎必须复制数据，调用返回后调用方可立即复用缓冲；
/// - `MORE`：提示后续还有数据，引擎可以推迟推送（PSH）。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct WriteFlags(u8);

impl WriteFlags {
    pub const NONE: Self = Self(0);
    pub const COPY: Self = Self(0x01);
    pub const MORE: Self = Self(0x02);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn bits(self) -> u8 {
        self.0
    }
}

impl BitOr for WriteFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// 半关闭方向。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ShutdownDirection {
    /// 关闭读方向，后续到达的数据被确认并丢弃。
    Read,
    /// 关闭写方向，向对端发送 FIN。
    Write,
    /// 同时关闭两个方向，等价于 `close`。
    Both,
}

/// TCP 状态机的十一个状态，用于调试查询。
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TcpState {
    Closed,
    Listen,
    SynSent,
    SynReceived,
    Established,
    FinWait1,
    FinWait2,
    CloseWait,
    Closing,
    LastAck,
    TimeWait,
}

impl TcpState {
    /// 本端或对端已发起关闭。
    pub fn is_closing(self) -> bool {
        self >= TcpState::FinWait1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_flags_combine() {
        let flags = WriteFlags::COPY | WriteFlags::MORE;
        assert!(flags.contains(WriteFlags::COPY));
        assert!(flags.contains(WriteFlags::MORE));
        assert!(!WriteFlags::COPY.contains(WriteFlags::MORE));
        assert_eq!(flags.bits(), 0x03);
    }

    #[test]
    fn closing_states_are_ordered_after_established() {
        assert!(!TcpState::Established.is_closing());
        assert!(TcpState::CloseWait.is_closing());
        assert!(TcpState::TimeWait.is_closing());
    }
}
