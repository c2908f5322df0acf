use std::net::SocketAddr;

use bytes::BytesMut;
use rustls_pki_types::ServerName;
use spark_altcp::{
    ConnId, Event, Layer, LayerCx, Result, SegmentChain, ShutdownDirection, TransportError,
    WriteFlags,
};
use tracing::{debug, error, trace, warn};

use crate::config::TlsConfig;
use crate::engine::{Decrypted, HandshakeStatus, RecordIo, SessionInfo, TlsEngine};

/// TLS 连接的生命周期阶段。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TlsPhase {
    /// 握手进行中（含客户端尚未发起连接的阶段）。
    Handshaking,
    Established,
    /// 握手或记录层失败，会话已销毁，等待应用关闭。
    Failed,
    /// 监听连接，不持有会话。
    Listening,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RxState {
    Open,
    /// 对端已关闭，但仍有明文或密文待交付。
    EofQueued,
    Closed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TxState {
    Open,
    Closed,
}

/// 单条连接的私有 TLS 状态，两个方向都关闭后销毁。
struct Session {
    engine: Box<dyn TlsEngine>,
    /// 尚未被引擎读取的密文。
    rx: SegmentChain,
    /// 已解密、等待应用接受的明文。
    rx_app: SegmentChain,
    /// 当前记录已读取的密文字节数。
    bio_bytes_read: usize,
    /// 当前记录已解出的明文字节数。
    bio_bytes_appl: usize,
    /// 已交给应用、但应用尚未 `recved` 的明文字节数。
    rx_passed_unrecved: usize,
    in_flight: Option<usize>,
    appldata_sent: bool,
    close_notify_sent: bool,
}

impl Session {
    fn new(engine: Box<dyn TlsEngine>) -> Self {
        Self {
            engine,
            rx: SegmentChain::new(),
            rx_app: SegmentChain::new(),
            bio_bytes_read: 0,
            bio_bytes_appl: 0,
            rx_passed_unrecved: 0,
            in_flight: None,
            appldata_sent: false,
            close_notify_sent: false,
        }
    }

    /// 拆出引擎与字节通道，两者借用会话的不同字段。
    fn io<'s, 'a>(
        &'s mut self,
        cx: &'s mut LayerCx<'a>,
    ) -> (&'s mut (dyn TlsEngine + 'static), Bio<'s, 'a>) {
        (
            self.engine.as_mut(),
            Bio {
                cx,
                rx: &mut self.rx,
                pulled: &mut self.bio_bytes_read,
            },
        )
    }
}

/// 引擎看到的字节通道：密文从接收链拉取，写往内层连接。
struct Bio<'s, 'a> {
    cx: &'s mut LayerCx<'a>,
    rx: &'s mut SegmentChain,
    pulled: &'s mut usize,
}

impl RecordIo for Bio<'_, '_> {
    fn available(&self) -> usize {
        self.rx.len()
    }

    fn peek(&self, dst: &mut [u8]) -> usize {
        self.rx.peek_into(dst)
    }

    fn pull(&mut self, dst: &mut [u8]) -> usize {
        let read = self.rx.read_into(dst);
        *self.pulled += read;
        read
    }

    fn push(&mut self, data: &[u8]) -> Result<usize> {
        let inner = self.cx.inner().ok_or(TransportError::Closed)?;
        let stack = self.cx.stack();
        let len = stack.sndbuf(inner).min(data.len());
        if len == 0 {
            return Ok(0);
        }
        match stack.write(inner, &data[..len], WriteFlags::COPY) {
            Ok(()) => Ok(len),
            Err(TransportError::WouldBlock) => Ok(0),
            Err(err) => Err(err),
        }
    }
}

/// TLS 适配层：在任意内层连接之上提供加密的字节流。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 应用协议无需感知加密：握手、记录封装、告警都在本层完成，应用看到的仍是
///   `connected`/`recv`/`sent`/`poll`/`err` 五类事件；
/// - 内层窗口按“密文字节”记账，应用按“明文字节”确认，本层负责两者之间的换算。
///
/// ## 逻辑（How）
/// 1. **握手期**：每个密文段追加到接收链并推进握手，随后把握手期读取的密文全部向内层确认；
///    握手完成后主动打开的连接才收到 `Connected(Ok)`；
/// 2. **数据期**：按 `rx_chunk_size` 分块解密，同一时刻至多一个 `Recv` 在途；
///    一条记录被完整消费时，把 `读取密文 - 解出明文` 的协议开销向内层确认，
///    明文部分等应用 `recved` 后再转发，保证内层确认总量恰好等于收到的密文量；
/// 3. **背压**：写入前先冲刷上次未写完的密文，冲不完即返回 `WouldBlock`；
///    内层的 `Sent`/`Poll` 总是先重试冲刷，再通知应用；
/// 4. **关闭**：对端 EOF 排在未交付明文之后；`shutdown` 关闭的两个方向都结束后销毁会话，
///    连接本身留给应用的 `close` 释放。
///
/// ## 契约（What）
/// - 握手完成前 `write` 返回 `InvalidState`；
/// - 握手或解密失败不重试：应用收到一次 `Recv(None)`，内层被关闭（关闭失败则中止）；
/// - 握手完成前对端关闭属于异常拆除，经 `err` 回调报告 `Closed`；
/// - `close` 总是把关闭转发给内层：成功后本连接立即释放，不等待对端的 EOF；
///   内层关闭失败时状态保持不变，调用方可以重试。
///
/// ## 注意事项（Trade-offs）
/// - 内层接收窗口必须能容纳一整条 TLS 记录，否则记录永远凑不齐，连接会停滞；
/// - 被拒收的明文停留在 `rx_app` 时不会继续解密后续记录，避免无界缓冲。
pub struct TlsLayer {
    config: TlsConfig,
    phase: TlsPhase,
    rx_state: RxState,
    tx_state: TxState,
    session: Option<Session>,
    server_name: Option<String>,
    connecting: bool,
}

impl TlsLayer {
    /// 按配置角色创建一层 TLS：服务端立即创建会话，客户端在已知服务器名称时创建。
    pub(crate) fn new(config: TlsConfig, server_name: Option<String>) -> Result<Self> {
        let server_name = server_name.or_else(|| config.options().server_name.clone());
        let session = if config.is_server() {
            Some(Session::new(config.new_engine(None)?))
        } else {
            match &server_name {
                Some(name) => {
                    let name = ServerName::try_from(name.clone())
                        .map_err(|_| TransportError::InvalidArgument)?;
                    Some(Session::new(config.new_engine(Some(name))?))
                }
                None => None,
            }
        };
        Ok(Self {
            config,
            phase: TlsPhase::Handshaking,
            rx_state: RxState::Open,
            tx_state: TxState::Open,
            session,
            server_name,
            connecting: false,
        })
    }

    pub fn phase(&self) -> TlsPhase {
        self.phase
    }

    /// 客户端请求的服务器名称；服务端与尚未确定名称的客户端为 `None`。
    pub fn server_name(&self) -> Option<&str> {
        self.server_name.as_deref()
    }

    /// 协商结果；会话已销毁（失败或双向关闭）时为 `None`。
    pub fn session_info(&self) -> Option<SessionInfo> {
        self.session
            .as_ref()
            .map(|session| session.engine.session_info())
    }

    /// 已交给应用但尚未被确认的明文字节数。
    pub fn unacknowledged(&self) -> usize {
        self.session
            .as_ref()
            .map_or(0, |session| session.rx_passed_unrecved)
    }

    /// 已解密、等待应用接受的明文字节数。
    pub fn pending_plaintext(&self) -> usize {
        self.session
            .as_ref()
            .map_or(0, |session| session.rx_app.len())
    }

    pub fn is_rx_closed(&self) -> bool {
        self.rx_state == RxState::Closed
    }

    pub fn is_tx_closed(&self) -> bool {
        self.tx_state == TxState::Closed
    }

    fn ack_lower(cx: &mut LayerCx<'_>, len: usize) {
        if len == 0 {
            return;
        }
        if let Some(inner) = cx.inner() {
            cx.stack().recved(inner, len);
        }
    }

    fn output_lower(cx: &mut LayerCx<'_>) {
        if let Some(inner) = cx.inner()
            && let Err(err) = cx.stack().output(inner)
        {
            trace!(conn = %cx.id(), error = %err, "lower output failed");
        }
    }

    /// 冲刷引擎中的待发密文；返回 `true` 表示已全部交给内层。
    fn flush(&mut self, cx: &mut LayerCx<'_>) -> Result<bool> {
        let Some(session) = self.session.as_mut() else {
            return Ok(true);
        };
        let drained = {
            let (engine, mut bio) = session.io(cx);
            engine.flush(&mut bio)?
        };
        Self::output_lower(cx);
        Ok(drained)
    }

    /// 新密文到达或连接建立后推进：握手期推进握手，数据期解密交付。
    fn recv_process(&mut self, cx: &mut LayerCx<'_>) {
        if self.phase == TlsPhase::Handshaking {
            let Some(session) = self.session.as_mut() else {
                return;
            };
            let status = {
                let (engine, mut bio) = session.io(cx);
                engine.drive_handshake(&mut bio)
            };
            Self::output_lower(cx);
            let consumed = std::mem::take(&mut session.bio_bytes_read);
            Self::ack_lower(cx, consumed);
            match status {
                Ok(HandshakeStatus::InProgress) => return,
                Ok(HandshakeStatus::Done) => {}
                Err(err) => {
                    self.fail_session(cx, err);
                    return;
                }
            }
            self.phase = TlsPhase::Established;
            let info = self.session_info().unwrap_or_default();
            debug!(
                conn = %cx.id(),
                version = info.protocol_version.as_deref().unwrap_or("-"),
                suite = info.cipher_suite.as_deref().unwrap_or("-"),
                "tls handshake complete"
            );
            if self.connecting {
                self.connecting = false;
                cx.emit(Event::Connected(Ok(())));
            }
        }
        self.handle_rx_appldata(cx);
    }

    /// 解密并交付明文，直到没有完整记录、应用拒收或出现在途交付。
    fn handle_rx_appldata(&mut self, cx: &mut LayerCx<'_>) {
        if self.phase != TlsPhase::Established || self.rx_state == RxState::Closed {
            return;
        }
        let chunk = self.config.options().rx_chunk_size;
        loop {
            let Some(session) = self.session.as_mut() else {
                return;
            };
            if session.in_flight.is_some() {
                return;
            }
            if !session.rx_app.is_empty() {
                let data = session.rx_app.to_bytes();
                session.rx_passed_unrecved += data.len();
                session.in_flight = Some(data.len());
                cx.emit(Event::Recv(Some(data)));
                return;
            }
            let mut buf = BytesMut::zeroed(chunk);
            let outcome = {
                let (engine, mut bio) = session.io(cx);
                engine.decrypt(&mut bio, &mut buf)
            };
            match outcome {
                Ok(Decrypted::Data(len)) => {
                    buf.truncate(len);
                    session.rx_app.push(buf.freeze());
                    session.bio_bytes_appl += len;
                    if session.engine.bytes_buffered_for_current_record() == 0 {
                        Self::ack_record_overhead(session, cx);
                    }
                }
                Ok(Decrypted::WouldBlock) => {
                    if session.engine.bytes_buffered_for_current_record() == 0 {
                        Self::ack_record_overhead(session, cx);
                    }
                    if self.rx_state == RxState::EofQueued {
                        self.deliver_eof(cx);
                    }
                    return;
                }
                Ok(Decrypted::PeerClosed) => {
                    Self::ack_record_overhead(session, cx);
                    trace!(conn = %cx.id(), "close_notify received");
                    self.deliver_eof(cx);
                    return;
                }
                Err(err) => {
                    self.fail_session(cx, err);
                    return;
                }
            }
        }
    }

    /// 一条记录消费完毕：向内层确认协议开销（密文减明文）。
    fn ack_record_overhead(session: &mut Session, cx: &mut LayerCx<'_>) {
        let overhead = session
            .bio_bytes_read
            .saturating_sub(session.bio_bytes_appl);
        if session.bio_bytes_read < session.bio_bytes_appl {
            error!(
                conn = %cx.id(),
                read = session.bio_bytes_read,
                plain = session.bio_bytes_appl,
                "plaintext exceeds ciphertext in record accounting"
            );
        }
        session.bio_bytes_read = 0;
        session.bio_bytes_appl = 0;
        if overhead > 0 {
            trace!(conn = %cx.id(), overhead, "record overhead acknowledged");
            Self::ack_lower(cx, overhead);
        }
    }

    fn deliver_eof(&mut self, cx: &mut LayerCx<'_>) {
        if self.rx_state == RxState::Closed {
            return;
        }
        self.rx_state = RxState::Closed;
        debug!(conn = %cx.id(), "end of stream delivered");
        cx.emit(Event::Recv(None));
        self.after_rx_closed(cx);
    }

    /// 读方向关闭后，若写方向也已关闭则销毁会话；连接本身仍等应用 `close`。
    fn after_rx_closed(&mut self, cx: &mut LayerCx<'_>) {
        if self.tx_state == TxState::Closed && self.session.take().is_some() {
            trace!(conn = %cx.id(), "both directions shut, tls session state dropped");
        }
    }

    /// 握手或记录层失败：通知应用 EOF，关闭（或中止）内层；本连接留待应用关闭。
    fn fail_session(&mut self, cx: &mut LayerCx<'_>, err: TransportError) {
        warn!(conn = %cx.id(), error = %err, code = err.code(), "tls session failed");
        self.phase = TlsPhase::Failed;
        self.connecting = false;
        self.session = None;
        if self.rx_state != RxState::Closed {
            self.rx_state = RxState::Closed;
            cx.emit(Event::Recv(None));
        }
        if let Some(inner) = cx.inner()
            && cx.stack().close(inner).is_err()
        {
            cx.stack().abort(inner);
        }
    }

    fn handle_eof(&mut self, cx: &mut LayerCx<'_>) {
        match self.phase {
            TlsPhase::Established => {
                if self.rx_state != RxState::Open {
                    return;
                }
                self.rx_state = RxState::EofQueued;
                trace!(
                    conn = %cx.id(),
                    pending = self.pending_plaintext(),
                    "peer fin queued behind pending data"
                );
                self.handle_rx_appldata(cx);
            }
            TlsPhase::Handshaking => {
                debug!(conn = %cx.id(), "peer closed before tls handshake completed");
                self.session = None;
                if let Some(inner) = cx.inner()
                    && cx.stack().close(inner).is_err()
                {
                    cx.stack().abort(inner);
                }
                cx.fail(TransportError::Closed);
            }
            TlsPhase::Failed | TlsPhase::Listening => {}
        }
    }

    fn accept(&mut self, cx: &mut LayerCx<'_>, inner: ConnId) -> Result<()> {
        let layer = TlsLayer::new(self.config.clone(), None)?;
        let conn = cx.stack().wrap(inner, Box::new(layer))?;
        debug!(listener = %cx.id(), conn = %conn, inner = %inner, "tls connection accepted");
        cx.emit(Event::Accept(conn));
        Ok(())
    }

    fn send_close_notify(&mut self, cx: &mut LayerCx<'_>) {
        if self.phase != TlsPhase::Established {
            return;
        }
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.close_notify_sent {
            return;
        }
        session.close_notify_sent = true;
        session.engine.send_close_notify();
        if let Err(err) = self.flush(cx) {
            trace!(conn = %cx.id(), error = %err, "close_notify not flushed");
        }
    }
}

impl Layer for TlsLayer {
    fn name(&self) -> &'static str {
        "tls"
    }

    fn on_lower(&mut self, cx: &mut LayerCx<'_>, event: Event) -> Result<()> {
        match event {
            Event::Accept(inner) => {
                if self.phase != TlsPhase::Listening {
                    return Err(TransportError::InvalidState("accept on a non-listening tls layer"));
                }
                return self.accept(cx, inner);
            }
            Event::Connected(Ok(())) => {
                trace!(conn = %cx.id(), "inner connected, starting tls handshake");
                self.recv_process(cx);
            }
            Event::Connected(Err(err)) => {
                self.connecting = false;
                cx.emit(Event::Connected(Err(err)));
            }
            Event::Recv(Some(data)) => {
                let dropped = match self.session.as_mut() {
                    Some(session) if self.rx_state != RxState::Closed => {
                        session.rx.push(data);
                        None
                    }
                    _ => Some(data.len()),
                };
                match dropped {
                    Some(len) => {
                        trace!(conn = %cx.id(), len, "ciphertext after rx close acknowledged and dropped");
                        Self::ack_lower(cx, len);
                    }
                    None => self.recv_process(cx),
                }
            }
            Event::Recv(None) => self.handle_eof(cx),
            Event::Sent(len) => {
                trace!(conn = %cx.id(), len, "inner sent");
                if let Err(err) = self.flush(cx) {
                    debug!(conn = %cx.id(), error = %err, "flush on sent failed");
                }
                if self
                    .session
                    .as_ref()
                    .is_some_and(|session| session.appldata_sent)
                {
                    cx.emit(Event::Sent(0));
                }
            }
            Event::Poll => {
                if let Err(err) = self.flush(cx) {
                    debug!(conn = %cx.id(), error = %err, "flush on poll failed");
                }
                self.handle_rx_appldata(cx);
                cx.emit(Event::Poll);
            }
            Event::Error(reason) => {
                debug!(conn = %cx.id(), error = %reason, "inner connection failed");
                self.session = None;
                cx.fail(reason);
            }
            other => cx.emit(other),
        }
        Ok(())
    }

    fn on_recv_result(&mut self, cx: &mut LayerCx<'_>, result: Result<()>) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let Some(len) = session.in_flight.take() else {
            return;
        };
        match result {
            Ok(()) => {
                session.rx_app.advance(len);
                self.handle_rx_appldata(cx);
            }
            Err(err) => {
                session.rx_passed_unrecved = session.rx_passed_unrecved.saturating_sub(len);
                trace!(conn = %cx.id(), len, error = %err, "plaintext refused, kept for redelivery");
            }
        }
    }

    fn recved(&mut self, cx: &mut LayerCx<'_>, len: usize) {
        if self.phase != TlsPhase::Established {
            return;
        }
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let mut lower = len;
        if lower > session.rx_passed_unrecved {
            warn!(
                conn = %cx.id(),
                len,
                unrecved = session.rx_passed_unrecved,
                "bogus recved count, clamped"
            );
            lower = session.rx_passed_unrecved;
        }
        session.rx_passed_unrecved -= lower;
        Self::ack_lower(cx, lower);
    }

    fn connect(&mut self, cx: &mut LayerCx<'_>, addr: SocketAddr) -> Result<()> {
        if self.config.is_server() {
            return Err(TransportError::InvalidState("server configuration cannot connect"));
        }
        if self.session.is_none() {
            let name = ServerName::IpAddress(addr.ip().into());
            self.session = Some(Session::new(self.config.new_engine(Some(name))?));
            self.server_name = Some(addr.ip().to_string());
        }
        let inner = cx.require_inner()?;
        self.connecting = true;
        if let Err(err) = cx.stack().connect(inner, addr) {
            self.connecting = false;
            return Err(err);
        }
        Ok(())
    }

    fn listen(&mut self, cx: &mut LayerCx<'_>, backlog: u8) -> Result<()> {
        if !self.config.is_server() {
            return Err(TransportError::InvalidState("client configuration cannot listen"));
        }
        let inner = cx.require_inner()?;
        cx.stack().listen(inner, backlog)?;
        self.phase = TlsPhase::Listening;
        self.session = None;
        Ok(())
    }

    fn abort(&mut self, cx: &mut LayerCx<'_>) {
        self.session = None;
        if let Some(inner) = cx.inner() {
            cx.stack().abort(inner);
        }
        debug!(conn = %cx.id(), "tls connection aborted");
    }

    fn close(&mut self, cx: &mut LayerCx<'_>) -> Result<()> {
        self.send_close_notify(cx);
        if let Some(inner) = cx.inner() {
            cx.stack().close(inner)?;
        }
        debug!(
            conn = %cx.id(),
            rx_closed = self.rx_state == RxState::Closed,
            "tls connection closed"
        );
        self.session = None;
        self.tx_state = TxState::Closed;
        self.rx_state = RxState::Closed;
        cx.release();
        Ok(())
    }

    fn shutdown(&mut self, cx: &mut LayerCx<'_>, direction: ShutdownDirection) -> Result<()> {
        match direction {
            ShutdownDirection::Both => self.close(cx),
            ShutdownDirection::Write => {
                if self.tx_state == TxState::Closed {
                    return Ok(());
                }
                self.send_close_notify(cx);
                let inner = cx.require_inner()?;
                cx.stack().shutdown(inner, ShutdownDirection::Write)?;
                self.tx_state = TxState::Closed;
                if self.rx_state == RxState::Closed {
                    self.after_rx_closed(cx);
                }
                Ok(())
            }
            ShutdownDirection::Read => {
                let inner = cx.require_inner()?;
                cx.stack().shutdown(inner, ShutdownDirection::Read)?;
                if let Some(session) = self.session.as_mut() {
                    // 丢弃的密文、未交付的明文与当前记录的剩余部分都由本层代为确认。
                    if let Some(len) = session.in_flight.take() {
                        session.rx_passed_unrecved = session.rx_passed_unrecved.saturating_sub(len);
                    }
                    let dropped = session.rx.len()
                        + session.rx_app.len()
                        + session.bio_bytes_read.saturating_sub(session.bio_bytes_appl);
                    session.rx.clear();
                    session.rx_app.clear();
                    session.bio_bytes_read = 0;
                    session.bio_bytes_appl = 0;
                    trace!(conn = %cx.id(), dropped, "rx shut, pending tls input acknowledged");
                    Self::ack_lower(cx, dropped);
                }
                self.rx_state = RxState::Closed;
                self.after_rx_closed(cx);
                Ok(())
            }
        }
    }

    fn write(&mut self, cx: &mut LayerCx<'_>, data: &[u8], _flags: WriteFlags) -> Result<()> {
        match self.phase {
            TlsPhase::Established => {}
            TlsPhase::Handshaking => {
                return Err(TransportError::InvalidState("tls handshake not complete"));
            }
            TlsPhase::Failed | TlsPhase::Listening => return Err(TransportError::Closed),
        }
        if self.tx_state == TxState::Closed {
            return Err(TransportError::InvalidState("write half already closed"));
        }
        if data.is_empty() {
            return Ok(());
        }
        let backlog = self
            .session
            .as_ref()
            .is_some_and(|session| session.engine.wants_write());
        if backlog && !self.flush(cx)? {
            trace!(conn = %cx.id(), len = data.len(), "previous ciphertext pending, write refused");
            return Err(TransportError::WouldBlock);
        }
        let session = self.session.as_mut().ok_or(TransportError::Closed)?;
        let accepted = session.engine.encrypt(data)?;
        if accepted != data.len() {
            error!(conn = %cx.id(), accepted, len = data.len(), "tls engine accepted a partial write");
            return Err(TransportError::Internal("tls engine accepted a partial write"));
        }
        session.appldata_sent = true;
        self.flush(cx)?;
        Ok(())
    }

    fn output(&mut self, cx: &mut LayerCx<'_>) -> Result<()> {
        self.flush(cx)?;
        Ok(())
    }

    fn dealloc(&mut self, cx: &mut LayerCx<'_>) {
        if self.session.take().is_some() {
            trace!(conn = %cx.id(), "tls session state dropped");
        }
    }
}
