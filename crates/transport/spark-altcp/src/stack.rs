use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::net::{IpAddr, SocketAddr};

use bytes::Bytes;
use tracing::{debug, trace, warn};

use crate::{
    ConnId,
    callbacks::{Callbacks, ErrFn},
    error::{Result, TransportError},
    event::{Event, ShutdownDirection, TcpState, WriteFlags},
    layer::{Layer, LayerCx},
};

/// 取出回调，同时记下当前的回调纪元。
macro_rules! take_callback {
    ($stack:expr, $id:expr, $slot:ident) => {
        $stack.entry_mut($id).and_then(|entry| {
            let epoch = entry.callback_epoch;
            entry.callbacks.$slot.take().map(|callback| (callback, epoch))
        })
    };
}

/// 把回调放回槽位；若回调执行期间应用重新注册过或清空过回调，则以应用的操作为准。
macro_rules! restore_callback {
    ($stack:expr, $id:expr, $epoch:expr, $slot:ident, $callback:expr) => {
        if let Some(entry) = $stack.entry_mut($id)
            && entry.callback_epoch == $epoch
            && entry.callbacks.$slot.is_none()
        {
            entry.callbacks.$slot = Some($callback);
        }
    };
}

struct Entry {
    layer: Option<Box<dyn Layer>>,
    name: &'static str,
    inner: Option<ConnId>,
    outer: Option<ConnId>,
    callbacks: Callbacks,
    /// `clear_callbacks` 每次调用加一，借出中的回调据此判断是否还能放回。
    callback_epoch: u32,
    poll_interval: u8,
}

#[derive(Default)]
struct Slot {
    generation: u32,
    entry: Option<Entry>,
}

enum Route {
    /// 投递时再根据发出方当前的 `outer` 决定去向。
    Resolve,
    /// 终止事件在入队时即确定去向：发出方随后就会被释放。
    Layer(ConnId),
    ErrorSink(Option<ErrFn>),
}

struct Queued {
    source: ConnId,
    event: Event,
    route: Route,
}

/// 分层传输连接的竞技场与事件泵。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 应用协议只面对一个稳定的 API 面（`bind`/`connect`/`listen`/`write`/`output`/`close`/
///   `shutdown`/`abort`/`recved` 与属性查询），由栈经 [`Layer`] trait 对象转发给实际的传输变体；
/// - 连接之间“外层拥有内层”的链式所有权、回调中的重入与销毁，都集中在这里处理，
///   各层实现只需关心自己的状态机。
///
/// ## 逻辑（How）
/// 1. **句柄竞技场**：连接存放在带代数的槽位中，[`ConnId`] 失效后所有操作变为无副作用的
///    `InvalidArgument`；
/// 2. **借出执行**：调用某层时先把层对象从槽位取出，执行完毕再放回；层在执行期间可以
///    调用内层连接，但不能直接调用应用代码；
/// 3. **事件泵**：层通过 [`LayerCx::emit`] 入队事件；最外层操作返回前按 FIFO 顺序投递。
///    应用回调执行时没有任何层处于借出状态，因此回调可以安全地重入（确认、写入、关闭、中止），
///    重入产生的新事件排在当前事件之后；
/// 4. **终止事件**：`Error` 在入队时就摘下应用的 `err` 回调，发出方随即释放，
///    因而“连接已不存在”与“错误仍然送达”可以同时成立。
///
/// ## 契约（What）
/// - 所有操作首先校验句柄，失败返回 [`TransportError::InvalidArgument`] 或中性值；
/// - `close`/`shutdown` 失败时连接保持可用，调用方负责稍后重试；
/// - `abort` 返回后句柄立即失效，应用的 `err` 回调恰好收到一次 [`TransportError::Aborted`]；
/// - 对同一连接，`Recv` 数据按产生顺序投递；应用拒收（返回 `Err`）的数据由发出层保留并在后续
///   `recv`/`poll`/`sent` 时机重新递交。
///
/// ## 注意事项（Trade-offs）
/// - 单线程、协作式：`Stack` 不是 `Send`，也没有任何锁；所有事件必须在同一逻辑线程内注入；
/// - 事件泵不嵌套：回调内重入产生的事件不会“插队”，调用方看到的是顺序化后的结果。
#[derive(Default)]
pub struct Stack {
    slots: Vec<Slot>,
    free: Vec<u32>,
    queue: VecDeque<Queued>,
    depth: u32,
    pumping: bool,
    live: usize,
}

impl fmt::Debug for Stack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stack")
            .field("live", &self.live)
            .field("slots", &self.slots.len())
            .field("queued", &self.queue.len())
            .finish()
    }
}

impl Stack {
    pub fn new() -> Self {
        Self::default()
    }

    /// 分配一个新连接并装入给定层。
    pub fn insert(&mut self, layer: Box<dyn Layer>) -> ConnId {
        self.insert_with(|_| layer)
    }

    /// 先确定句柄，再构造层对象；适用于层需要在构造时知道自身句柄的场景
    /// （例如把句柄登记到 TCP 引擎，以便引擎回送事件）。
    pub fn insert_with(&mut self, build: impl FnOnce(ConnId) -> Box<dyn Layer>) -> ConnId {
        let id = match self.free.pop() {
            Some(index) => ConnId {
                index,
                generation: self.slots[index as usize].generation,
            },
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot::default());
                ConnId {
                    index,
                    generation: 0,
                }
            }
        };
        let layer = build(id);
        let name = layer.name();
        self.slots[id.index as usize].entry = Some(Entry {
            layer: Some(layer),
            name,
            inner: None,
            outer: None,
            callbacks: Callbacks::default(),
            callback_epoch: 0,
            poll_interval: 0,
        });
        self.live += 1;
        trace!(conn = %id, layer = name, "connection allocated");
        id
    }

    /// 在 `inner` 之上叠加一层，返回外层句柄；外层从此拥有内层。
    pub fn wrap(&mut self, inner: ConnId, layer: Box<dyn Layer>) -> Result<ConnId> {
        match self.entry(inner) {
            None => return Err(TransportError::InvalidArgument),
            Some(entry) if entry.outer.is_some() => {
                return Err(TransportError::InvalidState("inner connection already wrapped"));
            }
            Some(_) => {}
        }
        let outer = self.insert(layer);
        if let Some(entry) = self.entry_mut(outer) {
            entry.inner = Some(inner);
        }
        if let Some(entry) = self.entry_mut(inner) {
            entry.outer = Some(outer);
        }
        debug!(conn = %outer, inner = %inner, "layer stacked");
        Ok(outer)
    }

    pub fn is_alive(&self, id: ConnId) -> bool {
        self.entry(id).is_some()
    }

    /// 存活连接数（含各层）。
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn inner_of(&self, id: ConnId) -> Option<ConnId> {
        self.entry(id)?.inner
    }

    pub fn outer_of(&self, id: ConnId) -> Option<ConnId> {
        self.entry(id)?.outer
    }

    pub fn layer_name(&self, id: ConnId) -> Option<&'static str> {
        self.entry(id).map(|entry| entry.name)
    }

    pub fn poll_interval(&self, id: ConnId) -> u8 {
        self.entry(id).map_or(0, |entry| entry.poll_interval)
    }

    /// 以具体类型只读访问某个连接的层对象；层正在执行时返回 `None`。
    pub fn layer<T: Layer>(&self, id: ConnId) -> Option<&T> {
        let layer: &dyn Layer = self.entry(id)?.layer.as_deref()?;
        (layer as &dyn Any).downcast_ref::<T>()
    }

    pub fn layer_mut<T: Layer>(&mut self, id: ConnId) -> Option<&mut T> {
        let layer: &mut dyn Layer = self.entry_mut(id)?.layer.as_deref_mut()?;
        (layer as &mut dyn Any).downcast_mut::<T>()
    }

    // ---- 回调注册 ----

    pub fn set_accept<F>(&mut self, id: ConnId, callback: F) -> Result<()>
    where
        F: FnMut(&mut Stack, ConnId, ConnId) -> Result<()> + 'static,
    {
        self.callbacks_mut(id)?.accept = Some(Box::new(callback));
        Ok(())
    }

    pub fn set_connected<F>(&mut self, id: ConnId, callback: F) -> Result<()>
    where
        F: FnMut(&mut Stack, ConnId, Result<()>) + 'static,
    {
        self.callbacks_mut(id)?.connected = Some(Box::new(callback));
        Ok(())
    }

    pub fn set_recv<F>(&mut self, id: ConnId, callback: F) -> Result<()>
    where
        F: FnMut(&mut Stack, ConnId, Option<Bytes>) -> Result<()> + 'static,
    {
        self.callbacks_mut(id)?.recv = Some(Box::new(callback));
        Ok(())
    }

    pub fn set_sent<F>(&mut self, id: ConnId, callback: F) -> Result<()>
    where
        F: FnMut(&mut Stack, ConnId, usize) + 'static,
    {
        self.callbacks_mut(id)?.sent = Some(Box::new(callback));
        Ok(())
    }

    /// 注册轮询回调并设置轮询间隔（单位由 TCP 引擎定义）。
    pub fn set_poll<F>(&mut self, id: ConnId, interval: u8, callback: F) -> Result<()>
    where
        F: FnMut(&mut Stack, ConnId) + 'static,
    {
        self.callbacks_mut(id)?.poll = Some(Box::new(callback));
        self.set_poll_interval(id, interval);
        Ok(())
    }

    pub fn set_err<F>(&mut self, id: ConnId, callback: F) -> Result<()>
    where
        F: FnOnce(&mut Stack, TransportError) + 'static,
    {
        self.callbacks_mut(id)?.err = Some(Box::new(callback));
        Ok(())
    }

    /// 移除全部应用回调；之后的事件按“无人接收”处理。
    ///
    /// 在回调内部调用同样生效：正在执行的回调返回后不会被放回槽位。
    pub fn clear_callbacks(&mut self, id: ConnId) {
        if let Some(entry) = self.entry_mut(id) {
            entry.callbacks = Callbacks::default();
            entry.callback_epoch = entry.callback_epoch.wrapping_add(1);
        }
    }

    /// 缓存轮询间隔并交给层转发；重新建立内层回调时沿用同一节奏。
    pub fn set_poll_interval(&mut self, id: ConnId, interval: u8) {
        match self.entry_mut(id) {
            Some(entry) => entry.poll_interval = interval,
            None => return,
        }
        self.query(id, (), |layer, cx| layer.set_poll(cx, interval));
    }

    // ---- 转发操作 ----

    pub fn bind(&mut self, id: ConnId, addr: SocketAddr) -> Result<()> {
        self.call(id, |layer, cx| layer.bind(cx, addr))
    }

    pub fn connect(&mut self, id: ConnId, addr: SocketAddr) -> Result<()> {
        self.call(id, |layer, cx| layer.connect(cx, addr))
    }

    /// 注册 `connected` 回调并发起主动打开。
    pub fn connect_with<F>(&mut self, id: ConnId, addr: SocketAddr, on_connected: F) -> Result<()>
    where
        F: FnMut(&mut Stack, ConnId, Result<()>) + 'static,
    {
        self.set_connected(id, on_connected)?;
        self.connect(id, addr)
    }

    pub fn listen(&mut self, id: ConnId, backlog: u8) -> Result<()> {
        self.call(id, |layer, cx| layer.listen(cx, backlog))
    }

    pub fn write(&mut self, id: ConnId, data: &[u8], flags: WriteFlags) -> Result<()> {
        self.call(id, |layer, cx| layer.write(cx, data, flags))
    }

    pub fn output(&mut self, id: ConnId) -> Result<()> {
        self.call(id, |layer, cx| layer.output(cx))
    }

    pub fn close(&mut self, id: ConnId) -> Result<()> {
        self.call(id, |layer, cx| layer.close(cx))
    }

    pub fn shutdown(&mut self, id: ConnId, direction: ShutdownDirection) -> Result<()> {
        self.call(id, |layer, cx| layer.shutdown(cx, direction))
    }

    /// 应用确认已消费 `len` 字节，用于推进接收窗口。
    pub fn recved(&mut self, id: ConnId, len: usize) {
        self.query(id, (), |layer, cx| layer.recved(cx, len));
    }

    /// 立即中止连接并丢弃两个方向上的缓冲数据。
    ///
    /// 先由层把中止转发给内层链，再由栈投递唯一一次 `Error(Aborted)` 并释放句柄。
    pub fn abort(&mut self, id: ConnId) {
        if !self.is_alive(id) {
            return;
        }
        debug!(conn = %id, "abort requested");
        let _ = self.with_layer(id, |layer, cx| layer.abort(cx));
        if self.is_alive(id) {
            self.enqueue(id, Event::Error(TransportError::Aborted));
            self.free_entry(id);
        }
        self.pump();
    }

    /// TCP 引擎（或测试驱动）把下层事件注入句柄 `id` 的最底层。
    pub fn inject(&mut self, id: ConnId, event: Event) -> Result<()> {
        trace!(conn = %id, event = event.label(), "lower event injected");
        self.call(id, |layer, cx| layer.on_lower(cx, event))
    }

    // ---- 属性查询 ----

    pub fn mss(&mut self, id: ConnId) -> u16 {
        self.query(id, 0, |layer, cx| layer.mss(cx))
    }

    pub fn sndbuf(&mut self, id: ConnId) -> usize {
        self.query(id, 0, |layer, cx| layer.sndbuf(cx))
    }

    pub fn sndqueuelen(&mut self, id: ConnId) -> usize {
        self.query(id, 0, |layer, cx| layer.sndqueuelen(cx))
    }

    pub fn nagle_disable(&mut self, id: ConnId) {
        self.query(id, (), |layer, cx| layer.nagle_disable(cx));
    }

    pub fn nagle_enable(&mut self, id: ConnId) {
        self.query(id, (), |layer, cx| layer.nagle_enable(cx));
    }

    pub fn nagle_disabled(&mut self, id: ConnId) -> bool {
        self.query(id, false, |layer, cx| layer.nagle_disabled(cx))
    }

    pub fn setprio(&mut self, id: ConnId, prio: u8) {
        self.query(id, (), |layer, cx| layer.setprio(cx, prio));
    }

    pub fn local_addr(&mut self, id: ConnId) -> Option<SocketAddr> {
        self.query(id, None, |layer, cx| layer.local_addr(cx))
    }

    pub fn remote_addr(&mut self, id: ConnId) -> Option<SocketAddr> {
        self.query(id, None, |layer, cx| layer.remote_addr(cx))
    }

    /// 本端（`local = true`）或对端地址。
    pub fn addr(&mut self, id: ConnId, local: bool) -> Option<SocketAddr> {
        if local {
            self.local_addr(id)
        } else {
            self.remote_addr(id)
        }
    }

    pub fn ip(&mut self, id: ConnId, local: bool) -> Option<IpAddr> {
        self.addr(id, local).map(|addr| addr.ip())
    }

    pub fn port(&mut self, id: ConnId, local: bool) -> u16 {
        self.addr(id, local).map_or(0, |addr| addr.port())
    }

    pub fn tcp_state(&mut self, id: ConnId) -> TcpState {
        self.query(id, TcpState::Closed, |layer, cx| layer.tcp_state(cx))
    }

    // ---- 内部机制 ----

    fn entry(&self, id: ConnId) -> Option<&Entry> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.entry.as_ref()
    }

    fn entry_mut(&mut self, id: ConnId) -> Option<&mut Entry> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.entry.as_mut()
    }

    fn callbacks_mut(&mut self, id: ConnId) -> Result<&mut Callbacks> {
        self.entry_mut(id)
            .map(|entry| &mut entry.callbacks)
            .ok_or(TransportError::InvalidArgument)
    }

    fn call<R>(
        &mut self,
        id: ConnId,
        f: impl FnOnce(&mut dyn Layer, &mut LayerCx<'_>) -> Result<R>,
    ) -> Result<R> {
        let result = self.with_layer(id, f).and_then(|inner| inner);
        self.pump();
        result
    }

    fn query<R>(
        &mut self,
        id: ConnId,
        fallback: R,
        f: impl FnOnce(&mut dyn Layer, &mut LayerCx<'_>) -> R,
    ) -> R {
        let result = self.with_layer(id, f).unwrap_or(fallback);
        self.pump();
        result
    }

    /// 借出层对象执行 `f`，执行完毕归还；若层请求释放则随后释放连接。
    fn with_layer<R>(
        &mut self,
        id: ConnId,
        f: impl FnOnce(&mut dyn Layer, &mut LayerCx<'_>) -> R,
    ) -> Result<R> {
        let entry = self.entry_mut(id).ok_or(TransportError::InvalidArgument)?;
        let mut layer = entry
            .layer
            .take()
            .ok_or(TransportError::InvalidState("layer re-entered while running"))?;
        self.depth += 1;
        let (output, release) = {
            let mut cx = LayerCx::new(self, id);
            let output = f(layer.as_mut(), &mut cx);
            (output, cx.release_requested())
        };
        self.depth -= 1;
        match self.entry_mut(id) {
            Some(entry) => entry.layer = Some(layer),
            None => {
                warn!(conn = %id, "connection vanished while its layer was running");
                return Ok(output);
            }
        }
        if release {
            self.free_entry(id);
        }
        Ok(output)
    }

    pub(crate) fn enqueue(&mut self, source: ConnId, event: Event) {
        let route = match &event {
            Event::Error(_) => match self.entry_mut(source) {
                Some(entry) => match entry.outer {
                    Some(outer) => Route::Layer(outer),
                    None => Route::ErrorSink(entry.callbacks.err.take()),
                },
                None => return,
            },
            _ => Route::Resolve,
        };
        self.queue.push_back(Queued {
            source,
            event,
            route,
        });
    }

    /// 释放连接：先调用层的 `dealloc`，再解除与外层的链接，并拆除仍挂在其下的内层。
    fn free_entry(&mut self, id: ConnId) {
        if let Some(mut layer) = self.entry_mut(id).and_then(|entry| entry.layer.take()) {
            self.depth += 1;
            let mut cx = LayerCx::new(self, id);
            layer.dealloc(&mut cx);
            self.depth -= 1;
        }
        let Some(slot) = self.slots.get_mut(id.index as usize) else {
            return;
        };
        if slot.generation != id.generation {
            return;
        }
        let Some(entry) = slot.entry.take() else {
            return;
        };
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.live -= 1;

        if let Some(outer) = entry.outer
            && let Some(outer_entry) = self.entry_mut(outer)
            && outer_entry.inner == Some(id)
        {
            outer_entry.inner = None;
        }
        if let Some(inner) = entry.inner
            && self
                .entry(inner)
                .is_some_and(|inner_entry| inner_entry.outer == Some(id))
        {
            if let Some(inner_entry) = self.entry_mut(inner) {
                inner_entry.outer = None;
            }
            self.clear_callbacks(inner);
            let _ = self.with_layer(inner, |layer, cx| layer.abort(cx));
            self.free_entry(inner);
        }
        trace!(conn = %id, layer = entry.name, "connection freed");
    }

    fn pump(&mut self) {
        if self.depth > 0 || self.pumping {
            return;
        }
        self.pumping = true;
        while let Some(item) = self.queue.pop_front() {
            self.deliver(item);
        }
        self.pumping = false;
    }

    fn deliver(&mut self, item: Queued) {
        let Queued {
            source,
            event,
            route,
        } = item;
        match route {
            Route::ErrorSink(sink) => {
                if let Event::Error(reason) = event {
                    debug!(conn = %source, error = %reason, code = reason.code(), "connection terminated");
                    if let Some(sink) = sink {
                        sink(self, reason);
                    }
                }
            }
            Route::Layer(outer) => self.deliver_to_layer(outer, source, event),
            Route::Resolve => {
                let Some(entry) = self.entry(source) else {
                    trace!(conn = %source, event = event.label(), "event dropped, connection already freed");
                    return;
                };
                match entry.outer {
                    Some(outer) => self.deliver_to_layer(outer, source, event),
                    None => self.deliver_to_app(source, event),
                }
            }
        }
    }

    fn deliver_to_layer(&mut self, outer: ConnId, source: ConnId, event: Event) {
        let accepted = match &event {
            Event::Accept(new) => Some(*new),
            _ => None,
        };
        let carries_data = matches!(event, Event::Recv(Some(_)));
        let result = self
            .with_layer(outer, |layer, cx| layer.on_lower(cx, event))
            .and_then(|inner| inner);
        if let Some(new) = accepted {
            if let Err(err) = result {
                warn!(listener = %outer, conn = %new, error = %err, "outer layer refused accepted connection");
                self.abort(new);
            }
            return;
        }
        if carries_data {
            self.settle_recv(source, result);
        }
    }

    fn deliver_to_app(&mut self, id: ConnId, event: Event) {
        match event {
            Event::Accept(new) => {
                let result = match take_callback!(self, id, accept) {
                    Some((mut callback, epoch)) => {
                        let result = callback(self, id, new);
                        restore_callback!(self, id, epoch, accept, callback);
                        result
                    }
                    None => Err(TransportError::InvalidArgument),
                };
                if let Err(err) = result {
                    warn!(listener = %id, conn = %new, error = %err, "accept refused, aborting new connection");
                    self.abort(new);
                }
            }
            Event::Connected(result) => {
                if let Some((mut callback, epoch)) = take_callback!(self, id, connected) {
                    callback(self, id, result);
                    restore_callback!(self, id, epoch, connected, callback);
                }
            }
            Event::Recv(data) => {
                let len = data.as_ref().map(Bytes::len);
                let result = match take_callback!(self, id, recv) {
                    Some((mut callback, epoch)) => {
                        let result = callback(self, id, data);
                        restore_callback!(self, id, epoch, recv, callback);
                        result
                    }
                    None => {
                        if let Some(len) = len {
                            trace!(conn = %id, len, "no recv callback, acknowledging and dropping");
                            self.recved(id, len);
                        }
                        Ok(())
                    }
                };
                if len.is_some() {
                    self.settle_recv(id, result);
                }
            }
            Event::Sent(len) => {
                if let Some((mut callback, epoch)) = take_callback!(self, id, sent) {
                    callback(self, id, len);
                    restore_callback!(self, id, epoch, sent, callback);
                }
            }
            Event::Poll => {
                if let Some((mut callback, epoch)) = take_callback!(self, id, poll) {
                    callback(self, id);
                    restore_callback!(self, id, epoch, poll, callback);
                }
            }
            Event::Error(reason) => {
                if let Some(sink) = self.entry_mut(id).and_then(|e| e.callbacks.err.take()) {
                    sink(self, reason);
                }
            }
        }
    }

    fn settle_recv(&mut self, source: ConnId, result: Result<()>) {
        let _ = self.with_layer(source, |layer, cx| layer.on_recv_result(cx, result));
    }
}
