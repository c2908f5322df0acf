use std::fmt;

use bytes::Bytes;

use crate::{ConnId, Stack, error::TransportError};

/// 新连接回调：`(stack, listener, accepted)`；返回 `Err` 时新连接被中止。
pub type AcceptFn = Box<dyn FnMut(&mut Stack, ConnId, ConnId) -> Result<(), TransportError>>;
/// 主动打开结果回调。
pub type ConnectedFn = Box<dyn FnMut(&mut Stack, ConnId, Result<(), TransportError>)>;
/// 数据回调：`None` 表示对端半关闭；返回 `Err` 表示暂不接收，数据会被原样重新递交。
pub type RecvFn = Box<dyn FnMut(&mut Stack, ConnId, Option<Bytes>) -> Result<(), TransportError>>;
/// 发送确认回调。
pub type SentFn = Box<dyn FnMut(&mut Stack, ConnId, usize)>;
/// 周期轮询回调。
pub type PollFn = Box<dyn FnMut(&mut Stack, ConnId)>;
/// 终止回调：连接已经不存在，因此只拿到原因。
pub type ErrFn = Box<dyn FnOnce(&mut Stack, TransportError)>;

/// 应用层注册的回调槽位，每个槽位单值，重复注册即替换。
///
/// 应用上下文通过闭包捕获携带，不再需要单独的 `arg` 指针。
#[derive(Default)]
pub(crate) struct Callbacks {
    pub(crate) accept: Option<AcceptFn>,
    pub(crate) connected: Option<ConnectedFn>,
    pub(crate) recv: Option<RecvFn>,
    pub(crate) sent: Option<SentFn>,
    pub(crate) poll: Option<PollFn>,
    pub(crate) err: Option<ErrFn>,
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks")
            .field("accept", &self.accept.is_some())
            .field("connected", &self.connected.is_some())
            .field("recv", &self.recv.is_some())
            .field("sent", &self.sent.is_some())
            .field("poll", &self.poll.is_some())
            .field("err", &self.err.is_some())
            .finish()
    }
}
