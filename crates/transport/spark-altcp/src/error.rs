use thiserror::Error;

/// 分层传输错误的稳定错误码与默认文案。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 上层协议（HTTP、MQTT、SMTP 客户端）只关心“能否重试、是否需要告警”，不应解析底层
///   TCP 引擎或 TLS 引擎的错误细节；
/// - 稳定错误码让日志检索与测试断言不依赖 `Display` 文案。
///
/// ## 契约（What）
/// - `code` 以 `spark.altcp.` 为前缀，发布后不可修改；
/// - `message` 为简短英文短语，用于结构化日志中的 `operation` 字段。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OperationKind {
    pub code: &'static str,
    pub message: &'static str,
}

pub const INVALID_ARGUMENT: OperationKind = OperationKind {
    code: "spark.altcp.invalid_argument",
    message: "invalid handle or argument",
};

pub const INVALID_STATE: OperationKind = OperationKind {
    code: "spark.altcp.invalid_state",
    message: "operation not allowed in current state",
};

pub const WOULD_BLOCK: OperationKind = OperationKind {
    code: "spark.altcp.would_block",
    message: "lower send buffer full",
};

pub const OUT_OF_MEMORY: OperationKind = OperationKind {
    code: "spark.altcp.out_of_memory",
    message: "allocation failed",
};

pub const CLOSED: OperationKind = OperationKind {
    code: "spark.altcp.closed",
    message: "connection closed",
};

pub const ABORTED: OperationKind = OperationKind {
    code: "spark.altcp.aborted",
    message: "connection aborted",
};

pub const RESET: OperationKind = OperationKind {
    code: "spark.altcp.reset",
    message: "connection reset by peer",
};

pub const HANDSHAKE: OperationKind = OperationKind {
    code: "spark.altcp.tls.handshake_failed",
    message: "tls handshake",
};

pub const RECORD: OperationKind = OperationKind {
    code: "spark.altcp.tls.record_failed",
    message: "tls record processing",
};

pub const ENGINE: OperationKind = OperationKind {
    code: "spark.altcp.tcp.engine_failed",
    message: "tcp engine",
};

pub const INTERNAL: OperationKind = OperationKind {
    code: "spark.altcp.internal",
    message: "internal invariant violated",
};

/// 错误分类，对应“瞬时流控 / 协议失败 / 资源耗尽 / 对端关闭 / 契约违背 / 连接终止”六类。
///
/// - `FlowControl` 是唯一会被层内部自动重试的类别（由 `sent`/`poll` 事件驱动）；
/// - 其余类别对单次操作而言都是终态，是否重建连接由应用决定。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorCategory {
    FlowControl,
    Protocol,
    ResourceExhausted,
    PeerClosed,
    ContractViolation,
    Terminated,
}

/// 分层传输的统一错误类型。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 每一层都把下层错误“翻译”为本类型后再上抛，而不是原样透传：TLS 层在仍有未交付明文时
///   需要暂时屏蔽下层的关闭信号；
/// - 同步返回值与异步回调（`err` 回调）使用同一套变体，便于应用统一处理。
///
/// ## 契约（What）
/// - [`TransportError::WouldBlock`]：下层缓冲已满，非致命，调用方应等待 `sent`/`poll` 后重试；
/// - [`TransportError::InvalidArgument`]：句柄失效、已销毁或该层不支持此操作，调用无副作用；
/// - [`TransportError::InvalidState`]：调用时机错误（例如握手完成前写入）；
/// - [`TransportError::Aborted`] / [`TransportError::Reset`]：连接已被本端中止或对端重置；
/// - [`TransportError::Internal`]：实现自身的不变量被破坏，只应出现在缺陷报告里。
///
/// ## 注意事项（Trade-offs）
/// - 变体携带 `String` 而非底层错误对象，以保持 `Clone + PartialEq`，方便测试断言与事件复制；
///   代价是丢失底层错误链，必要的上下文应在产生处通过 `tracing` 记录。
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum TransportError {
    #[error("无效的连接句柄或参数")]
    InvalidArgument,
    #[error("当前状态不允许该操作：{0}")]
    InvalidState(&'static str),
    #[error("下层发送缓冲已满，需稍后重试")]
    WouldBlock,
    #[error("资源不足，无法完成本次操作")]
    OutOfMemory,
    #[error("连接已关闭")]
    Closed,
    #[error("连接已中止")]
    Aborted,
    #[error("连接被对端重置")]
    Reset,
    #[error("TLS 握手失败：{0}")]
    Handshake(String),
    #[error("TLS 记录处理失败：{0}")]
    Tls(String),
    #[error("TCP 引擎错误：{0}")]
    Engine(String),
    #[error("内部不变量被破坏：{0}")]
    Internal(&'static str),
}

impl TransportError {
    /// 返回该错误对应的稳定错误码描述。
    pub fn kind(&self) -> OperationKind {
        match self {
            Self::InvalidArgument => INVALID_ARGUMENT,
            Self::InvalidState(_) => INVALID_STATE,
            Self::WouldBlock => WOULD_BLOCK,
            Self::OutOfMemory => OUT_OF_MEMORY,
            Self::Closed => CLOSED,
            Self::Aborted => ABORTED,
            Self::Reset => RESET,
            Self::Handshake(_) => HANDSHAKE,
            Self::Tls(_) => RECORD,
            Self::Engine(_) => ENGINE,
            Self::Internal(_) => INTERNAL,
        }
    }

    /// 稳定错误码，等价于 `self.kind().code`。
    pub fn code(&self) -> &'static str {
        self.kind().code
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::WouldBlock => ErrorCategory::FlowControl,
            Self::Handshake(_) | Self::Tls(_) => ErrorCategory::Protocol,
            Self::OutOfMemory => ErrorCategory::ResourceExhausted,
            Self::Closed => ErrorCategory::PeerClosed,
            Self::InvalidArgument | Self::InvalidState(_) | Self::Internal(_) => {
                ErrorCategory::ContractViolation
            }
            Self::Aborted | Self::Reset | Self::Engine(_) => ErrorCategory::Terminated,
        }
    }

    /// 仅流控类错误允许调用方原样重试。
    pub fn is_retryable(&self) -> bool {
        self.category() == ErrorCategory::FlowControl
    }
}

/// 本 crate 的结果别名。
pub type Result<T, E = TransportError> = core::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_flow_control_is_retryable() {
        assert!(TransportError::WouldBlock.is_retryable());
        for err in [
            TransportError::InvalidArgument,
            TransportError::OutOfMemory,
            TransportError::Closed,
            TransportError::Aborted,
            TransportError::Handshake("bad".into()),
        ] {
            assert!(!err.is_retryable(), "{err:?} 不应被视为可重试");
        }
    }

    #[test]
    fn codes_are_namespaced() {
        let samples = [
            TransportError::InvalidState("x"),
            TransportError::Reset,
            TransportError::Tls("x".into()),
            TransportError::Engine("x".into()),
            TransportError::Internal("x"),
        ];
        for err in samples {
            assert!(err.code().starts_with("spark.altcp."), "{}", err.code());
        }
        assert_eq!(
            TransportError::Handshake("x".into()).code(),
            "spark.altcp.tls.handshake_failed"
        );
    }

    #[test]
    fn categories_follow_taxonomy() {
        assert_eq!(
            TransportError::Closed.category(),
            ErrorCategory::PeerClosed
        );
        assert_eq!(
            TransportError::OutOfMemory.category(),
            ErrorCategory::ResourceExhausted
        );
        assert_eq!(
            TransportError::InvalidArgument.category(),
            ErrorCategory::ContractViolation
        );
        assert_eq!(
            TransportError::Aborted.category(),
            ErrorCategory::Terminated
        );
    }
}
