#![doc = r#"
# spark-altcp-tls

## 设计动机（Why）
- **TLS 只是另一层传输**：TLS 连接叠加在任意内层连接之上，对应用暴露与明文连接完全相同的
  操作与回调，应用协议在建连时才决定是否加密；
- **会话配置可共享、可热更新**：同一份证书与参数服务成百上千条连接，证书轮换不影响存量连接。

## 核心契约（What）
- [`TlsLayer`]：握手推进、记录解密、窗口换算与关闭状态机；
- [`TlsEngine`] / [`RecordIo`]：密码学引擎的能力契约，[`RustlsEngine`] 为默认实现；
- [`TlsConfig`] / [`TlsOptions`]：会话配置（PEM 证书、CA、会话缓存、ALPN）与 TOML 参数；
- [`wrap`]、[`new_tls`]、[`tls_context`]、[`TransportSelector`]：建连入口与协商结果查询。

## 实现策略（How）
- 引擎只接收完整记录，记录完成时把协议开销向内层确认，明文部分等应用确认后再转发；
- 配置通过 `ArcSwap` 保存 rustls 配置快照，新连接在创建时读取当前快照。

## 风险与考量（Trade-offs）
- 内层接收窗口必须能容纳一整条 TLS 记录；
- 仅提供 `ring` 密码学后端，不支持加密私钥与会话缓存超时。
"#]
#![deny(unsafe_code)]

mod config;
mod engine;
pub mod error;
mod layer;
mod selector;

pub use config::{TlsConfig, TlsOptions};
pub use engine::{Decrypted, HandshakeStatus, RecordIo, RustlsEngine, SessionInfo, TlsEngine};
pub use error::ConfigError;
pub use layer::{TlsLayer, TlsPhase};
pub use selector::{TransportSelector, new_tls, tls_context, wrap, wrap_with_server_name};
