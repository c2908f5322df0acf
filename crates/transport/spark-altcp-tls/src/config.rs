use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwap;
use rustls::client::Resumption;
use rustls::crypto::CryptoProvider;
use rustls::server::{NoServerSessionStorage, ServerSessionMemoryCache, StoresServerSessions};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use serde::{Deserialize, Serialize};
use spark_altcp::{Result, TransportError};
use tracing::debug;

use crate::engine::{RustlsEngine, TlsEngine};
use crate::error::ConfigError;

/// 单条记录明文的上限；接收分块不应超过它。
const MAX_PLAINTEXT: usize = 16_384;

/// TLS 会话参数，可从 TOML 反序列化。
///
/// - `rx_chunk_size`：每次解密的明文分块大小，也是单次 `Recv` 的最大长度；
/// - `session_cache_entries`：会话缓存条目数，`0` 表示关闭会话复用；
/// - `alpn_protocols`：按优先级排列的 ALPN 协议名；
/// - `server_name`：客户端默认请求的服务器名称（SNI 与证书校验）。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TlsOptions {
    pub rx_chunk_size: usize,
    pub session_cache_entries: usize,
    pub alpn_protocols: Vec<String>,
    pub server_name: Option<String>,
}

impl Default for TlsOptions {
    fn default() -> Self {
        Self {
            rx_chunk_size: 1536,
            session_cache_entries: 30,
            alpn_protocols: Vec::new(),
            server_name: None,
        }
    }
}

impl TlsOptions {
    pub fn from_toml_str(source: &str) -> std::result::Result<Self, ConfigError> {
        let options: Self = toml::from_str(source)?;
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.rx_chunk_size == 0 {
            return Err(ConfigError::Invalid("rx_chunk_size must be positive"));
        }
        if self.rx_chunk_size > MAX_PLAINTEXT {
            return Err(ConfigError::Invalid("rx_chunk_size exceeds one tls record"));
        }
        if self.alpn_protocols.iter().any(|proto| proto.is_empty() || proto.len() > 255) {
            return Err(ConfigError::Invalid("alpn protocol names must be 1..=255 bytes"));
        }
        if let Some(name) = &self.server_name
            && ServerName::try_from(name.as_str()).is_err()
        {
            return Err(ConfigError::Invalid("server_name is not a valid dns name or ip"));
        }
        Ok(())
    }

    fn alpn(&self) -> Vec<Vec<u8>> {
        self.alpn_protocols
            .iter()
            .map(|proto| proto.as_bytes().to_vec())
            .collect()
    }
}

enum Side {
    Server(ArcSwap<ServerConfig>),
    Client(ArcSwap<ClientConfig>),
}

struct Shared {
    side: Side,
    options: TlsOptions,
}

/// TLS 会话配置：证书、私钥、信任根与会话缓存，被任意多条连接共享。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 证书解析、会话缓存等昂贵资源只构造一次，所有连接共享同一份只读配置；
/// - 证书轮换不应打断现有连接：通过 [`ArcSwap`] 原子替换，新连接读取最新快照，
///   旧连接继续持有创建时的那一份。
///
/// ## 逻辑（How）
/// - 内部以 `Arc` 共享；克隆配置只增加引用计数，配置在最后一个持有者（包括连接）释放后才销毁；
/// - `server_from_pem`/`client_from_pem` 使用 `ring` 加密提供者与安全默认协议版本，
///   并按 [`TlsOptions`] 设置会话缓存与 ALPN。
///
/// ## 契约（What）
/// - 服务端配置只能包裹监听连接或被接受的连接，客户端配置只能用于主动打开；
/// - `replace_*` 只影响之后创建的连接。
///
/// ## 注意事项（Trade-offs）
/// - 私钥必须是未加密的 PEM（PKCS#1/PKCS#8/SEC1）；加密私钥需由调用方先解密。
#[derive(Clone)]
pub struct TlsConfig {
    shared: Arc<Shared>,
}

impl fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConfig")
            .field("side", &self.side_label())
            .field("options", &self.shared.options)
            .finish()
    }
}

impl TlsConfig {
    /// 使用现成的 `rustls` 服务端配置。
    pub fn server(
        config: Arc<ServerConfig>,
        options: TlsOptions,
    ) -> std::result::Result<Self, ConfigError> {
        options.validate()?;
        Ok(Self {
            shared: Arc::new(Shared {
                side: Side::Server(ArcSwap::new(config)),
                options,
            }),
        })
    }

    /// 使用现成的 `rustls` 客户端配置。
    pub fn client(
        config: Arc<ClientConfig>,
        options: TlsOptions,
    ) -> std::result::Result<Self, ConfigError> {
        options.validate()?;
        Ok(Self {
            shared: Arc::new(Shared {
                side: Side::Client(ArcSwap::new(config)),
                options,
            }),
        })
    }

    /// 由 PEM 证书链与私钥构造服务端配置。
    pub fn server_from_pem(
        cert_chain_pem: &[u8],
        key_pem: &[u8],
        options: TlsOptions,
    ) -> std::result::Result<Self, ConfigError> {
        options.validate()?;
        let certs = CertificateDer::pem_slice_iter(cert_chain_pem)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|err| ConfigError::Pem(err.to_string()))?;
        if certs.is_empty() {
            return Err(ConfigError::NoCertificates);
        }
        let key = PrivateKeyDer::from_pem_slice(key_pem)
            .map_err(|err| ConfigError::Pem(err.to_string()))?;
        let mut config = ServerConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(certs, key)?;
        let storage: Arc<dyn StoresServerSessions> = match options.session_cache_entries {
            0 => Arc::new(NoServerSessionStorage {}),
            entries => ServerSessionMemoryCache::new(entries),
        };
        config.session_storage = storage;
        config.alpn_protocols = options.alpn();
        debug!(
            cache = options.session_cache_entries,
            alpn = options.alpn_protocols.len(),
            "tls server configuration built"
        );
        Self::server(Arc::new(config), options)
    }

    /// 由 PEM 信任根（CA 证书束）构造客户端配置。
    pub fn client_from_pem(
        ca_pem: &[u8],
        options: TlsOptions,
    ) -> std::result::Result<Self, ConfigError> {
        options.validate()?;
        let mut roots = RootCertStore::empty();
        for cert in CertificateDer::pem_slice_iter(ca_pem) {
            let cert = cert.map_err(|err| ConfigError::Pem(err.to_string()))?;
            roots.add(cert)?;
        }
        if roots.is_empty() {
            return Err(ConfigError::NoCertificates);
        }
        let mut config = ClientConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()?
            .with_root_certificates(roots)
            .with_no_client_auth();
        config.resumption = match options.session_cache_entries {
            0 => Resumption::disabled(),
            entries => Resumption::in_memory_sessions(entries),
        };
        config.alpn_protocols = options.alpn();
        Self::client(Arc::new(config), options)
    }

    pub fn is_server(&self) -> bool {
        matches!(self.shared.side, Side::Server(_))
    }

    pub fn options(&self) -> &TlsOptions {
        &self.shared.options
    }

    /// 替换服务端配置，通常用于证书热更新。
    pub fn replace_server_config(
        &self,
        config: Arc<ServerConfig>,
    ) -> std::result::Result<(), ConfigError> {
        match &self.shared.side {
            Side::Server(current) => {
                current.store(config);
                debug!("tls server configuration replaced");
                Ok(())
            }
            Side::Client(_) => Err(ConfigError::SideMismatch { expected: "服务" }),
        }
    }

    pub fn replace_client_config(
        &self,
        config: Arc<ClientConfig>,
    ) -> std::result::Result<(), ConfigError> {
        match &self.shared.side {
            Side::Client(current) => {
                current.store(config);
                debug!("tls client configuration replaced");
                Ok(())
            }
            Side::Server(_) => Err(ConfigError::SideMismatch { expected: "客户" }),
        }
    }

    pub fn server_snapshot(&self) -> Option<Arc<ServerConfig>> {
        match &self.shared.side {
            Side::Server(current) => Some(current.load_full()),
            Side::Client(_) => None,
        }
    }

    pub fn client_snapshot(&self) -> Option<Arc<ClientConfig>> {
        match &self.shared.side {
            Side::Client(current) => Some(current.load_full()),
            Side::Server(_) => None,
        }
    }

    /// 以当前快照创建一个引擎；客户端必须给出服务器名称。
    pub(crate) fn new_engine(
        &self,
        server_name: Option<ServerName<'static>>,
    ) -> Result<Box<dyn TlsEngine>> {
        match &self.shared.side {
            Side::Server(current) => Ok(Box::new(RustlsEngine::server(current.load_full())?)),
            Side::Client(current) => {
                let name = server_name.ok_or(TransportError::InvalidArgument)?;
                Ok(Box::new(RustlsEngine::client(current.load_full(), name)?))
            }
        }
    }

    fn side_label(&self) -> &'static str {
        match self.shared.side {
            Side::Server(_) => "server",
            Side::Client(_) => "client",
        }
    }
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}
