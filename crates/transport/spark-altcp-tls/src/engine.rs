use std::fmt;
use std::io::{self, Read, Write};
use std::sync::Arc;

use rustls::{ClientConfig, ClientConnection, Connection, ServerConfig, ServerConnection};
use rustls_pki_types::ServerName;
use spark_altcp::{Result, TransportError};
use tracing::{debug, trace};

use crate::error::{failure_class, map_io_error, map_rustls_error};

/// TLS 记录头长度：类型（1）+ 版本（2）+ 长度（2）。
const RECORD_HEADER_LEN: usize = 5;
/// 单条记录在线路上的最大长度（明文上限 16 KiB 加上加密扩展余量）。
const MAX_RECORD_LEN: usize = RECORD_HEADER_LEN + 16_384 + 2_048;

/// 握手推进的结果。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeStatus {
    /// 需要更多输入，或待发数据尚未写完。
    InProgress,
    Done,
}

/// 单次解密的结果。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decrypted {
    /// 写入目标缓冲的明文字节数（大于 0）。
    Data(usize),
    /// 没有完整记录可解。
    WouldBlock,
    /// 对端发送了 `close_notify`。
    PeerClosed,
}

/// 引擎与连接之间的字节通道：从接收链拉取密文，向内层连接推送密文。
///
/// - `pull` 从接收链头部移除字节，实现方据此累计“已读密文”，用于窗口记账；
/// - `push` 返回内层实际接受的字节数，`0` 表示内层发送缓冲已满。
pub trait RecordIo {
    /// 接收链中尚未被引擎读取的字节数。
    fn available(&self) -> usize;
    fn peek(&self, dst: &mut [u8]) -> usize;
    fn pull(&mut self, dst: &mut [u8]) -> usize;
    fn push(&mut self, data: &[u8]) -> Result<usize>;
}

/// 握手与记录层引擎的能力契约。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 适配层的状态机（半关闭、延迟 EOF、窗口记账）与具体的 TLS 实现无关，
///   引擎只需回答“握手是否推进”“能解出多少明文”“密文是否写完”；
/// - 契约以同步、非阻塞的方式表达：任何调用都不会等待网络。
///
/// ## 契约（What）
/// - `drive_handshake`：消费已到达的握手记录并尽量写出响应；`InProgress` 不是错误；
/// - `decrypt`：每次至多写满 `buf`；当前记录的剩余明文由 [`TlsEngine::bytes_buffered_for_current_record`] 报告，
///   返回 `0` 的时刻即“一条记录被完整消费”，适配层以此计算协议开销；
/// - `encrypt`：把明文排入发送队列，返回接受的字节数，要么全部接受要么报错；
/// - `flush`：返回 `true` 表示待发密文已全部交给内层。
///
/// ## 注意事项（Trade-offs）
/// - 引擎内部的发送队列不设上限，背压由适配层“先冲刷、冲不完就拒绝新写入”的规则承担。
pub trait TlsEngine {
    fn is_handshaking(&self) -> bool;
    fn drive_handshake(&mut self, io: &mut dyn RecordIo) -> Result<HandshakeStatus>;
    fn decrypt(&mut self, io: &mut dyn RecordIo, buf: &mut [u8]) -> Result<Decrypted>;
    fn encrypt(&mut self, data: &[u8]) -> Result<usize>;
    fn flush(&mut self, io: &mut dyn RecordIo) -> Result<bool>;
    fn wants_write(&self) -> bool;
    fn bytes_buffered_for_current_record(&self) -> usize;
    fn send_close_notify(&mut self);
    fn session_info(&self) -> SessionInfo;
}

/// 协商结果的只读视图。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SessionInfo {
    /// 例如 `TLSv1_3`。
    pub protocol_version: Option<String>,
    pub cipher_suite: Option<String>,
    pub alpn_protocol: Option<Vec<u8>>,
    /// 服务端为客户端发送的 SNI，客户端为自己请求的名称。
    pub server_name: Option<String>,
    pub handshake_complete: bool,
}

/// 基于 `rustls` 无 I/O 连接对象的引擎实现。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - `rustls::Connection` 本身不做 I/O，正好契合事件驱动的分层模型：
///   密文由本层喂入，响应由本层取出，全程不阻塞；
///
/// ## 逻辑（How）
/// 1. 只向 `rustls` 喂入**完整记录**：先窥视 5 字节记录头，接收链中凑齐整条记录才拉取；
///    因此每次 `process_new_packets` 之后，缓冲的明文恰好属于刚喂入的那条记录；
/// 2. `pending_plain` 记录当前记录尚未读出的明文，读空后才喂下一条；
/// 3. 冲刷时把 `RecordIo` 包装成 [`io::Write`]，内层返回 `0` 时转换为 `WouldBlock` 让 `rustls` 保留剩余密文。
///
/// ## 注意事项（Trade-offs）
/// - 移除了 `rustls` 的缓冲上限（`set_buffer_limit(None)`），使 `encrypt` 成为全有或全无；
///   代价是内存占用由适配层的写入闸门约束，而非引擎自身。
pub struct RustlsEngine {
    conn: Connection,
    server_name: Option<String>,
    pending_plain: usize,
    peer_closed: bool,
    record: Vec<u8>,
}

impl fmt::Debug for RustlsEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RustlsEngine")
            .field("handshaking", &self.conn.is_handshaking())
            .field("server_name", &self.server_name)
            .field("pending_plain", &self.pending_plain)
            .field("peer_closed", &self.peer_closed)
            .finish()
    }
}

impl RustlsEngine {
    pub fn client(config: Arc<ClientConfig>, server_name: ServerName<'static>) -> Result<Self> {
        let requested = match &server_name {
            ServerName::DnsName(name) => Some(name.as_ref().to_owned()),
            _ => None,
        };
        let conn = ClientConnection::new(config, server_name)
            .map_err(|err| map_rustls_error(&err, true))?;
        Ok(Self::with_connection(conn.into(), requested))
    }

    pub fn server(config: Arc<ServerConfig>) -> Result<Self> {
        let conn = ServerConnection::new(config).map_err(|err| map_rustls_error(&err, true))?;
        Ok(Self::with_connection(conn.into(), None))
    }

    fn with_connection(mut conn: Connection, server_name: Option<String>) -> Self {
        conn.set_buffer_limit(None);
        Self {
            conn,
            server_name,
            pending_plain: 0,
            peer_closed: false,
            record: Vec::new(),
        }
    }

    /// 喂入一条完整记录；接收链中不足一条记录时返回 `false`。
    fn feed_record(&mut self, io: &mut dyn RecordIo) -> Result<bool> {
        let handshaking = self.conn.is_handshaking();
        let mut header = [0u8; RECORD_HEADER_LEN];
        if io.peek(&mut header) < RECORD_HEADER_LEN {
            return Ok(false);
        }
        let total = RECORD_HEADER_LEN + usize::from(u16::from_be_bytes([header[3], header[4]]));
        if total > MAX_RECORD_LEN {
            let message = format!("record of {total} bytes exceeds protocol limit");
            return Err(if handshaking {
                TransportError::Handshake(message)
            } else {
                TransportError::Tls(message)
            });
        }
        if io.available() < total {
            return Ok(false);
        }
        self.record.resize(total, 0);
        let pulled = io.pull(&mut self.record);
        let mut cursor = &self.record[..pulled];
        while !cursor.is_empty() {
            let read = self
                .conn
                .read_tls(&mut cursor)
                .map_err(|err| map_io_error(&err, handshaking))?;
            if read == 0 {
                break;
            }
        }
        let state = match self.conn.process_new_packets() {
            Ok(state) => state,
            Err(err) => {
                debug!(class = failure_class(&err), error = %err, "rustls rejected record");
                return Err(map_rustls_error(&err, handshaking));
            }
        };
        self.pending_plain = state.plaintext_bytes_to_read();
        self.peer_closed = state.peer_has_closed();
        trace!(record = total, plain = self.pending_plain, "tls record consumed");
        Ok(true)
    }

    /// 喂入失败后尽量把 `rustls` 已生成的告警送出，再返回原错误。
    fn fail_with_alert(&mut self, io: &mut dyn RecordIo, err: TransportError) -> TransportError {
        if let Err(flush_err) = self.flush(io) {
            trace!(error = %flush_err, "alert could not be sent");
        }
        err
    }
}

impl TlsEngine for RustlsEngine {
    fn is_handshaking(&self) -> bool {
        self.conn.is_handshaking()
    }

    fn drive_handshake(&mut self, io: &mut dyn RecordIo) -> Result<HandshakeStatus> {
        while self.conn.is_handshaking() {
            self.flush(io)?;
            match self.feed_record(io) {
                Ok(true) => {}
                Ok(false) => break,
                Err(err) => return Err(self.fail_with_alert(io, err)),
            }
        }
        self.flush(io)?;
        Ok(if self.conn.is_handshaking() {
            HandshakeStatus::InProgress
        } else {
            HandshakeStatus::Done
        })
    }

    fn decrypt(&mut self, io: &mut dyn RecordIo, buf: &mut [u8]) -> Result<Decrypted> {
        if buf.is_empty() {
            return Err(TransportError::InvalidArgument);
        }
        loop {
            if self.pending_plain > 0 {
                return match self.conn.reader().read(buf) {
                    Ok(0) => {
                        self.pending_plain = 0;
                        self.peer_closed = true;
                        Ok(Decrypted::PeerClosed)
                    }
                    Ok(read) => {
                        self.pending_plain = self.pending_plain.saturating_sub(read);
                        Ok(Decrypted::Data(read))
                    }
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                        self.pending_plain = 0;
                        Ok(Decrypted::WouldBlock)
                    }
                    Err(err) => Err(map_io_error(&err, false)),
                };
            }
            if self.peer_closed {
                return Ok(Decrypted::PeerClosed);
            }
            match self.feed_record(io) {
                Ok(true) => {}
                Ok(false) => return Ok(Decrypted::WouldBlock),
                Err(err) => return Err(self.fail_with_alert(io, err)),
            }
            // 握手后消息（KeyUpdate 等）可能要求立即回应。
            if self.conn.wants_write() {
                self.flush(io)?;
            }
        }
    }

    fn encrypt(&mut self, data: &[u8]) -> Result<usize> {
        self.conn
            .writer()
            .write(data)
            .map_err(|err| map_io_error(&err, false))
    }

    fn flush(&mut self, io: &mut dyn RecordIo) -> Result<bool> {
        let mut sink = IoSink { io, failure: None };
        while self.conn.wants_write() {
            match self.conn.write_tls(&mut sink) {
                Ok(0) => return Ok(false),
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(err) => {
                    return Err(sink
                        .failure
                        .take()
                        .unwrap_or_else(|| map_io_error(&err, self.conn.is_handshaking())));
                }
            }
        }
        Ok(true)
    }

    fn wants_write(&self) -> bool {
        self.conn.wants_write()
    }

    fn bytes_buffered_for_current_record(&self) -> usize {
        self.pending_plain
    }

    fn send_close_notify(&mut self) {
        self.conn.send_close_notify();
    }

    fn session_info(&self) -> SessionInfo {
        let server_name = match &self.conn {
            Connection::Server(server) => server.server_name().map(str::to_owned),
            Connection::Client(_) => self.server_name.clone(),
        };
        SessionInfo {
            protocol_version: self.conn.protocol_version().map(|version| format!("{version:?}")),
            cipher_suite: self
                .conn
                .negotiated_cipher_suite()
                .map(|suite| format!("{:?}", suite.suite())),
            alpn_protocol: self.conn.alpn_protocol().map(<[u8]>::to_vec),
            server_name,
            handshake_complete: !self.conn.is_handshaking(),
        }
    }
}

/// 把 [`RecordIo::push`] 适配为 `rustls::Connection::write_tls` 需要的写端。
struct IoSink<'a> {
    io: &'a mut dyn RecordIo,
    failure: Option<TransportError>,
}

impl Write for IoSink<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.io.push(buf) {
            Ok(0) => Err(io::ErrorKind::WouldBlock.into()),
            Ok(written) => Ok(written),
            Err(err) => {
                self.failure = Some(err.clone());
                Err(io::Error::other(err))
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 内存管道：`rx` 供引擎读取，`tx` 收集引擎写出的密文；`room` 模拟内层发送缓冲。
    #[derive(Default)]
    struct Pipe {
        rx: Vec<u8>,
        tx: Vec<u8>,
        room: Option<usize>,
        pulled: usize,
    }

    impl RecordIo for Pipe {
        fn available(&self) -> usize {
            self.rx.len()
        }

        fn peek(&self, dst: &mut [u8]) -> usize {
            let len = dst.len().min(self.rx.len());
            dst[..len].copy_from_slice(&self.rx[..len]);
            len
        }

        fn pull(&mut self, dst: &mut [u8]) -> usize {
            let len = self.peek(dst);
            self.rx.drain(..len);
            self.pulled += len;
            len
        }

        fn push(&mut self, data: &[u8]) -> Result<usize> {
            let len = self.room.map_or(data.len(), |room| room.min(data.len()));
            if let Some(room) = self.room.as_mut() {
                *room -= len;
            }
            self.tx.extend_from_slice(&data[..len]);
            Ok(len)
        }
    }

    #[test]
    fn partial_record_is_not_fed() {
        let mut pipe = Pipe {
            rx: vec![0x16, 0x03, 0x03, 0x00, 0x10, 1, 2, 3],
            ..Pipe::default()
        };
        let config = Arc::new(
            ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
                .with_safe_default_protocol_versions()
                .expect("协议版本")
                .with_no_client_auth()
                .with_cert_resolver(Arc::new(rustls::server::ResolvesServerCertUsingSni::new())),
        );
        let mut engine = RustlsEngine::server(config).expect("服务端引擎");
        assert_eq!(
            engine.drive_handshake(&mut pipe),
            Ok(HandshakeStatus::InProgress)
        );
        assert_eq!(pipe.pulled, 0, "不完整的记录必须留在接收链中");
        assert_eq!(pipe.rx.len(), 8);
    }

    #[test]
    fn oversized_record_header_is_rejected() {
        let mut pipe = Pipe {
            rx: vec![0x17, 0x03, 0x03, 0xff, 0xff],
            ..Pipe::default()
        };
        let config = Arc::new(
            ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
                .with_safe_default_protocol_versions()
                .expect("协议版本")
                .with_no_client_auth()
                .with_cert_resolver(Arc::new(rustls::server::ResolvesServerCertUsingSni::new())),
        );
        let mut engine = RustlsEngine::server(config).expect("服务端引擎");
        assert!(matches!(
            engine.drive_handshake(&mut pipe),
            Err(TransportError::Handshake(_))
        ));
    }

    #[test]
    fn blocked_sink_keeps_ciphertext_queued() {
        let roots = rustls::RootCertStore::empty();
        let config = Arc::new(
            ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
                .with_safe_default_protocol_versions()
                .expect("协议版本")
                .with_root_certificates(roots)
                .with_no_client_auth(),
        );
        let name = ServerName::try_from("example.test").expect("域名");
        let mut engine = RustlsEngine::client(config, name).expect("客户端引擎");
        let mut pipe = Pipe {
            room: Some(10),
            ..Pipe::default()
        };
        assert_eq!(engine.flush(&mut pipe), Ok(false));
        assert_eq!(pipe.tx.len(), 10);
        assert!(engine.wants_write(), "ClientHello 剩余部分应留在引擎中");
        pipe.room = None;
        assert_eq!(engine.flush(&mut pipe), Ok(true));
        assert_eq!(pipe.tx[0], 0x16, "首字节应为握手记录类型");
        assert_eq!(
            engine.session_info().server_name.as_deref(),
            Some("example.test")
        );
    }
}
