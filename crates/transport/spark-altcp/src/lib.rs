#![doc = r#"
# spark-altcp

## 设计动机（Why）
- **统一 API 面**：应用协议（HTTP、MQTT、SMTP 客户端等）只面向一组连接操作编程，
  在建连时才决定底层是明文 TCP、TLS，还是 TLS 之上再叠一层代理；
- **可叠加**：任何层都可以包裹另一个连接，外层拥有内层，事件沿链自下而上冒泡，
  操作沿链自上而下转发；
- **回调安全**：回调中可以重入调用确认、写入、关闭甚至中止，当前连接被销毁也不会留下悬垂引用。

## 核心契约（What）
- [`Stack`]：连接竞技场与事件泵，对外暴露全部连接操作与回调注册；
- [`Layer`]：传输变体的分派契约，每个操作都有“转发给内层”的默认实现；
- [`ConnId`]：带代数的连接句柄，失效后所有操作返回 [`TransportError::InvalidArgument`] 或中性值；
- [`Event`]：自下而上流动的连接事件；
- [`SegmentChain`]：接收方向的有序字节片段链。

## 实现策略（How）
- 连接存放在槽位竞技场中，层对象在调用期间被借出，执行完再归还；
- 层只能通过 [`LayerCx::emit`] 入队事件，最外层操作返回前由事件泵顺序投递给外层或应用；
- 终止事件在入队时即确定接收者，发出方随后释放，保证“对象已销毁但错误仍然送达”。

## 风险与考量（Trade-offs）
- 单线程协作式模型：`Stack` 不实现 `Send`/`Sync`，与嵌入式 TCP 引擎的回调模型一致；
- 回调中重入产生的事件排在当前事件之后处理，调用方看到的是顺序化后的结果，而非嵌套调用。
"#]
#![deny(unsafe_code)]

mod callbacks;
pub mod error;
mod event;
mod handle;
mod layer;
mod segment;
mod stack;

pub use callbacks::{AcceptFn, ConnectedFn, ErrFn, PollFn, RecvFn, SentFn};
pub use error::{ErrorCategory, OperationKind, Result, TransportError};
pub use event::{Event, ShutdownDirection, TcpState, WriteFlags};
pub use handle::ConnId;
pub use layer::{Layer, LayerCx};
pub use segment::SegmentChain;
pub use stack::Stack;
