use std::any::Any;
use std::net::SocketAddr;

use crate::{
    ConnId, Stack,
    error::{Result, TransportError},
    event::{Event, ShutdownDirection, TcpState, WriteFlags},
};

/// 传输层变体的多态分派契约。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 明文 TCP、TLS 以及未来的代理层都实现同一组操作，应用协议只面向 [`Stack`] 编程，
///   在建连时才决定实际使用哪种（或哪几层）传输；
/// - 分派完全经由 trait 对象完成，栈从不检查层的具体类型。
///
/// ## 逻辑（How）
/// - 每个操作都带默认实现：通过 [`LayerCx::inner`] 把调用原样转发给内层连接。
///   因此一个只关心日志的中间层可以只覆写 [`Layer::name`]，其余全部透传；
/// - 下层事件统一经 [`Layer::on_lower`] 进入，默认实现把事件继续上抛；
/// - 层不能直接调用应用回调，只能通过 [`LayerCx::emit`] 入队。
///
/// ## 契约（What）
/// - `close`/`shutdown` 可失败：失败时连接保持原样，调用方应稍后（通常在 `poll` 中）重试；
/// - `abort` 不可失败：返回后由栈负责投递唯一一次 `Error(Aborted)` 并释放连接；
/// - `dealloc` 在连接被释放前恰好调用一次，用于提前销毁层私有状态。
///
/// ## 注意事项（Trade-offs）
/// - 默认的 `on_lower` 会把 `Recv(Some)` 直接上抛，但默认的 [`Layer::on_recv_result`] 什么也不做：
///   纯透传层若需要“应用拒收后重投”语义，必须自行缓存数据。
pub trait Layer: Any {
    /// 层名称，仅用于日志。
    fn name(&self) -> &'static str;

    fn on_lower(&mut self, cx: &mut LayerCx<'_>, event: Event) -> Result<()> {
        match event {
            Event::Error(reason) => cx.fail(reason),
            other => cx.emit(other),
        }
        Ok(())
    }

    /// 本层上抛的 `Recv(Some)` 被接收方处理后的结果。
    fn on_recv_result(&mut self, _cx: &mut LayerCx<'_>, _result: Result<()>) {}

    fn set_poll(&mut self, cx: &mut LayerCx<'_>, interval: u8) {
        if let Some(inner) = cx.inner() {
            cx.stack().set_poll_interval(inner, interval);
        }
    }

    fn recved(&mut self, cx: &mut LayerCx<'_>, len: usize) {
        if let Some(inner) = cx.inner() {
            cx.stack().recved(inner, len);
        }
    }

    fn bind(&mut self, cx: &mut LayerCx<'_>, addr: SocketAddr) -> Result<()> {
        let inner = cx.require_inner()?;
        cx.stack().bind(inner, addr)
    }

    fn connect(&mut self, cx: &mut LayerCx<'_>, addr: SocketAddr) -> Result<()> {
        let inner = cx.require_inner()?;
        cx.stack().connect(inner, addr)
    }

    fn listen(&mut self, cx: &mut LayerCx<'_>, backlog: u8) -> Result<()> {
        let inner = cx.require_inner()?;
        cx.stack().listen(inner, backlog)
    }

    fn abort(&mut self, cx: &mut LayerCx<'_>) {
        if let Some(inner) = cx.inner() {
            cx.stack().abort(inner);
        }
    }

    fn close(&mut self, cx: &mut LayerCx<'_>) -> Result<()> {
        let inner = cx.require_inner()?;
        cx.stack().close(inner)?;
        cx.release();
        Ok(())
    }

    fn shutdown(&mut self, cx: &mut LayerCx<'_>, direction: ShutdownDirection) -> Result<()> {
        let inner = cx.require_inner()?;
        cx.stack().shutdown(inner, direction)
    }

    fn write(&mut self, cx: &mut LayerCx<'_>, data: &[u8], flags: WriteFlags) -> Result<()> {
        let inner = cx.require_inner()?;
        cx.stack().write(inner, data, flags)
    }

    fn output(&mut self, cx: &mut LayerCx<'_>) -> Result<()> {
        let inner = cx.require_inner()?;
        cx.stack().output(inner)
    }

    fn mss(&mut self, cx: &mut LayerCx<'_>) -> u16 {
        match cx.inner() {
            Some(inner) => cx.stack().mss(inner),
            None => 0,
        }
    }

    fn sndbuf(&mut self, cx: &mut LayerCx<'_>) -> usize {
        match cx.inner() {
            Some(inner) => cx.stack().sndbuf(inner),
            None => 0,
        }
    }

    fn sndqueuelen(&mut self, cx: &mut LayerCx<'_>) -> usize {
        match cx.inner() {
            Some(inner) => cx.stack().sndqueuelen(inner),
            None => 0,
        }
    }

    fn nagle_disable(&mut self, cx: &mut LayerCx<'_>) {
        if let Some(inner) = cx.inner() {
            cx.stack().nagle_disable(inner);
        }
    }

    fn nagle_enable(&mut self, cx: &mut LayerCx<'_>) {
        if let Some(inner) = cx.inner() {
            cx.stack().nagle_enable(inner);
        }
    }

    fn nagle_disabled(&mut self, cx: &mut LayerCx<'_>) -> bool {
        match cx.inner() {
            Some(inner) => cx.stack().nagle_disabled(inner),
            None => false,
        }
    }

    fn setprio(&mut self, cx: &mut LayerCx<'_>, prio: u8) {
        if let Some(inner) = cx.inner() {
            cx.stack().setprio(inner, prio);
        }
    }

    fn local_addr(&mut self, cx: &mut LayerCx<'_>) -> Option<SocketAddr> {
        let inner = cx.inner()?;
        cx.stack().local_addr(inner)
    }

    fn remote_addr(&mut self, cx: &mut LayerCx<'_>) -> Option<SocketAddr> {
        let inner = cx.inner()?;
        cx.stack().remote_addr(inner)
    }

    fn tcp_state(&mut self, cx: &mut LayerCx<'_>) -> TcpState {
        match cx.inner() {
            Some(inner) => cx.stack().tcp_state(inner),
            None => TcpState::Closed,
        }
    }

    fn dealloc(&mut self, _cx: &mut LayerCx<'_>) {}
}

/// 层执行期间可用的上下文。
///
/// 层对象在调用期间被“借出”槽位，因此这里只暴露句柄与栈：层对自身的再次调用会得到
/// [`TransportError::InvalidState`]，而对内层连接的调用照常进行。
pub struct LayerCx<'a> {
    stack: &'a mut Stack,
    id: ConnId,
    release: bool,
}

impl<'a> LayerCx<'a> {
    pub(crate) fn new(stack: &'a mut Stack, id: ConnId) -> Self {
        Self {
            stack,
            id,
            release: false,
        }
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    /// 当前内层连接；释放或尚未包裹时为 `None`。
    pub fn inner(&self) -> Option<ConnId> {
        self.stack.inner_of(self.id)
    }

    pub fn require_inner(&self) -> Result<ConnId> {
        self.inner().ok_or(TransportError::InvalidArgument)
    }

    pub fn poll_interval(&self) -> u8 {
        self.stack.poll_interval(self.id)
    }

    pub fn stack(&mut self) -> &mut Stack {
        &mut *self.stack
    }

    /// 把事件排入投递队列；应用回调会在最外层操作返回后被调用。
    pub fn emit(&mut self, event: Event) {
        self.stack.enqueue(self.id, event);
    }

    /// 本次调用返回后释放连接（会先调用 [`Layer::dealloc`]）。
    pub fn release(&mut self) {
        self.release = true;
    }

    /// 投递终止事件并在本次调用返回后释放连接。
    pub fn fail(&mut self, reason: TransportError) {
        self.stack.enqueue(self.id, Event::Error(reason));
        self.release = true;
    }

    pub(crate) fn release_requested(&self) -> bool {
        self.release
    }
}
