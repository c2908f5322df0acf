#![doc = r#"
# spark-altcp-tcp

## 设计动机（Why）
- **默认传输变体**：把通用连接契约一对一映射到 TCP 引擎，零额外拷贝、零额外状态机；
- **引擎可替换**：TCP 引擎只通过 [`TcpPcb`] 能力契约接入，嵌入式协议栈、测试桩与
  [`loopback::LoopbackNet`] 都可以驱动同一套适配层。

## 核心契约（What）
- [`TcpPcb`]：引擎对单个 PCB 暴露的能力（写入全有或全无、关闭可失败、中止不可失败）；
- [`TcpEvent`] + [`dispatch`]：引擎回调入口，`Accept` 会先为新 PCB 分配连接再通知监听者；
- [`TcpLayer`]：明文适配层，负责拒收数据的暂存重投与 FIN 延后；
- [`new_conn`]：用 PCB 创建一个明文连接。

## 实现策略（How）
- 适配层只持有 `Option<Box<dyn TcpPcb>>`：引擎报告致命错误时 PCB 已被释放，适配层丢弃引用后上抛；
- 关闭前先解除回调，失败时重新挂回回调与轮询间隔，保证连接不会“静默失联”。

## 风险与考量（Trade-offs）
- 回环引擎不模拟丢包与重传，只用于验证分层逻辑的顺序、窗口与关闭语义。
"#]
#![deny(unsafe_code)]

mod layer;
pub mod loopback;
mod pcb;

pub use layer::TcpLayer;
pub use loopback::{LoopbackNet, LoopbackOptions, LoopbackPcb, PcbStats};
pub use pcb::{TcpEvent, TcpPcb, dispatch, new_conn};
