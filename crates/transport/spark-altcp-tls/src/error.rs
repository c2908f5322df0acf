use std::io;

use rustls::{AlertDescription, Error as RustlsError};
use spark_altcp::{TransportError, error::OperationKind};
use thiserror::Error;

/// TLS 引擎错误到 [`TransportError`] 的翻译。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 上层只需要区分“握手失败”“记录层失败”“流控繁忙”三种处理方式，
///   不应依赖 `rustls` 的错误枚举（其变体随版本演进）；
/// - 日志中额外输出一个粗粒度的失败类别，运维可以据此区分证书问题与对端异常。
///
/// ## 逻辑（How）
/// - 握手未完成时统一映射为 [`TransportError::Handshake`]，否则映射为 [`TransportError::Tls`]；
/// - [`failure_class`] 把证书类、告警类与完整性类错误分开，仅用于结构化日志。
///
/// ## 注意事项（Trade-offs）
/// - 错误文本保留 `rustls` 的 `Display` 输出，便于排障，但不承诺稳定；稳定的是错误码。
pub(crate) fn map_rustls_error(error: &RustlsError, handshaking: bool) -> TransportError {
    let message = format!("{}: {error}", stage(handshaking).message);
    if handshaking {
        TransportError::Handshake(message)
    } else {
        TransportError::Tls(message)
    }
}

/// `rustls` 的 I/O 接口（`read_tls`/`reader`）返回的错误。
pub(crate) fn map_io_error(error: &io::Error, handshaking: bool) -> TransportError {
    if let Some(source) = error.get_ref()
        && let Some(rustls_error) = source.downcast_ref::<RustlsError>()
    {
        return map_rustls_error(rustls_error, handshaking);
    }
    let message = format!("{}: {error}", stage(handshaking).message);
    if handshaking {
        TransportError::Handshake(message)
    } else {
        TransportError::Tls(message)
    }
}

fn stage(handshaking: bool) -> OperationKind {
    if handshaking {
        spark_altcp::error::HANDSHAKE
    } else {
        spark_altcp::error::RECORD
    }
}

/// 失败类别，只用于日志字段。
pub(crate) fn failure_class(error: &RustlsError) -> &'static str {
    use RustlsError::*;
    match error {
        NoCertificatesPresented | InvalidCertificate(_) | UnsupportedNameType => "authentication",
        InappropriateMessage { .. }
        | InappropriateHandshakeMessage { .. }
        | InvalidMessage(_)
        | PeerMisbehaved(_)
        | DecryptError
        | PeerSentOversizedRecord => "integrity",
        AlertReceived(alert) => alert_class(alert),
        PeerIncompatible(_) | NoApplicationProtocol => "negotiation",
        _ => "local",
    }
}

fn alert_class(alert: &AlertDescription) -> &'static str {
    use AlertDescription::*;
    match alert {
        BadCertificate
        | UnsupportedCertificate
        | CertificateRevoked
        | CertificateExpired
        | CertificateUnknown
        | UnknownCA
        | CertificateRequired => "peer_rejected_certificate",
        HandshakeFailure | ProtocolVersion | InsufficientSecurity | NoApplicationProtocol => {
            "negotiation"
        }
        _ => "peer_alert",
    }
}

/// 会话配置构造失败。
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("PEM 解析失败：{0}")]
    Pem(String),
    #[error("PEM 输入中没有任何证书")]
    NoCertificates,
    #[error("rustls 拒绝了该配置：{0}")]
    Rustls(#[from] RustlsError),
    #[error("TLS 选项解析失败：{0}")]
    Toml(#[from] toml::de::Error),
    #[error("TLS 选项非法：{0}")]
    Invalid(&'static str),
    #[error("配置角色不匹配：期望{expected}端配置")]
    SideMismatch { expected: &'static str },
}

pub const CONFIG_INVALID: OperationKind = OperationKind {
    code: "spark.altcp.tls.config_invalid",
    message: "tls session configuration",
};

impl ConfigError {
    pub fn code(&self) -> &'static str {
        CONFIG_INVALID.code
    }
}
