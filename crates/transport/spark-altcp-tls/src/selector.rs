use spark_altcp::{ConnId, Result, Stack};
use spark_altcp_tcp::TcpPcb;
use tracing::debug;

use crate::config::TlsConfig;
use crate::engine::SessionInfo;
use crate::layer::TlsLayer;

/// 在已有连接之上叠加 TLS；客户端使用配置中的默认服务器名称（若有）。
pub fn wrap(stack: &mut Stack, config: &TlsConfig, inner: ConnId) -> Result<ConnId> {
    let layer = TlsLayer::new(config.clone(), None)?;
    stack.wrap(inner, Box::new(layer))
}

/// 与 [`wrap`] 相同，但显式指定 SNI 与证书校验使用的服务器名称。
pub fn wrap_with_server_name(
    stack: &mut Stack,
    config: &TlsConfig,
    inner: ConnId,
    server_name: &str,
) -> Result<ConnId> {
    let layer = TlsLayer::new(config.clone(), Some(server_name.to_owned()))?;
    stack.wrap(inner, Box::new(layer))
}

/// 用 PCB 创建“TLS over TCP”连接；叠加失败时明文连接被中止，不留下孤儿。
pub fn new_tls(stack: &mut Stack, config: &TlsConfig, pcb: Box<dyn TcpPcb>) -> Result<ConnId> {
    let tcp = spark_altcp_tcp::new_conn(stack, pcb);
    match wrap(stack, config, tcp) {
        Ok(id) => Ok(id),
        Err(err) => {
            debug!(conn = %tcp, error = %err, "tls layer refused, aborting tcp connection");
            stack.abort(tcp);
            Err(err)
        }
    }
}

/// 读取 TLS 连接的协商结果；非 TLS 连接或会话已销毁时为 `None`。
pub fn tls_context(stack: &Stack, id: ConnId) -> Option<SessionInfo> {
    stack.layer::<TlsLayer>(id)?.session_info()
}

/// 连接工厂：应用在建连前选择明文或 TLS，之后只面向通用连接 API 编程。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 应用协议（HTTP 客户端、MQTT 等）通常由一个配置项决定是否加密，
///   选择器把“是否叠加 TLS”收敛到一处，其余代码对变体无感知。
///
/// ## 契约（What）
/// - `Plain`：直接返回明文连接；
/// - `Tls(config)`：返回叠加在明文连接之上的 TLS 连接，配置按引用计数共享。
#[derive(Clone, Debug)]
pub enum TransportSelector {
    Plain,
    Tls(TlsConfig),
}

impl TransportSelector {
    pub fn new_conn(&self, stack: &mut Stack, pcb: Box<dyn TcpPcb>) -> Result<ConnId> {
        match self {
            TransportSelector::Plain => Ok(spark_altcp_tcp::new_conn(stack, pcb)),
            TransportSelector::Tls(config) => new_tls(stack, config, pcb),
        }
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, TransportSelector::Tls(_))
    }
}
