//! 确定性内存回环 TCP 引擎。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 分层传输的核心逻辑（TLS 握手推进、窗口记账、半关闭）需要一个真实会“分段、限窗、回压”的下层，
//!   但又不能依赖操作系统套接字与时间：测试必须逐步可控、可重放；
//! - 回环引擎把两端 PCB 放在同一张表里，按固定顺序推进，任何一次运行的事件序列都完全相同。
//!
//! ## 逻辑（How）
//! 1. `write` 把数据复制进发送方的未发送队列；发送缓冲容量即 `sndbuf - unsent`；
//! 2. [`LoopbackNet::step`] 每次只做一件事：优先处理控制动作（建连、接受、RST、发送确认），
//!    否则按 PCB 下标顺序投递一个数据段；段长取 `min(未发送, MSS, 对端窗口, 分段计划)`；
//! 3. 对端窗口 = `window - (已交付 - 已确认)`，应用调用 `recved` 后窗口重新打开；
//! 4. 数据段到达即视为被对端 TCP 确认，发送方随后收到 `Sent(len)`。
//!
//! ## 契约（What）
//! - 引擎状态借用只在计算下一步时持有，分派事件前已释放，因此回调中可以随意调用 PCB；
//! - `run` 推进到没有任何可做的事情为止；`tick` 模拟一次粗粒度定时器，触发到期的 `Poll`。
//!
//! ## 注意事项（Trade-offs）
//! - 不模拟丢包、乱序与重传：这些属于真实 TCP 引擎的职责；
//! - 释放的 PCB 下标不复用，长时间运行的测试会线性增长，但换来了可读的调试输出。

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::rc::Rc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use spark_altcp::{
    ConnId, Result, SegmentChain, ShutdownDirection, Stack, TcpState, TransportError, WriteFlags,
};
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::pcb::{TcpEvent, TcpPcb, dispatch};

const EPHEMERAL_START: u16 = 49152;
const STEP_LIMIT: usize = 1 << 20;

/// 回环引擎参数，可从 TOML 反序列化。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoopbackOptions {
    pub mss: u16,
    /// 每个 PCB 的发送缓冲容量（字节）。
    pub sndbuf: usize,
    /// 每个 PCB 的接收窗口（字节）。
    pub window: usize,
}

impl Default for LoopbackOptions {
    fn default() -> Self {
        Self {
            mss: 1460,
            sndbuf: 8192,
            window: 65535,
        }
    }
}

#[derive(Debug, Error)]
pub enum OptionsError {
    #[error("回环引擎配置解析失败：{0}")]
    Toml(#[from] toml::de::Error),
    #[error("回环引擎配置非法：{0}")]
    Invalid(&'static str),
}

impl LoopbackOptions {
    pub fn from_toml_str(source: &str) -> std::result::Result<Self, OptionsError> {
        let options: Self = toml::from_str(source)?;
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> std::result::Result<(), OptionsError> {
        if self.mss == 0 {
            return Err(OptionsError::Invalid("mss must be positive"));
        }
        if self.sndbuf == 0 {
            return Err(OptionsError::Invalid("sndbuf must be positive"));
        }
        if self.window == 0 {
            return Err(OptionsError::Invalid("window must be positive"));
        }
        Ok(())
    }
}

/// 单个 PCB 的计数快照。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PcbStats {
    pub state: Option<TcpState>,
    /// 应用成功写入的字节数。
    pub written: usize,
    /// 本端收到（已交付给适配层）的字节数。
    pub received: usize,
    /// 本端应用通过 `recved` 确认的字节数。
    pub acked: usize,
    /// 本端收到的数据段个数。
    pub segments_received: usize,
    /// 尚未发出的字节数。
    pub unsent: usize,
    pub fin_received: bool,
}

#[derive(Debug)]
struct PcbState {
    owner: Option<ConnId>,
    state: TcpState,
    local: Option<SocketAddr>,
    remote: Option<SocketAddr>,
    peer: Option<usize>,
    unsent: SegmentChain,
    fin_queued: bool,
    fin_sent: bool,
    rx_closed: bool,
    split_plan: VecDeque<usize>,
    close_failures: u32,
    poll_interval: u8,
    poll_elapsed: u8,
    nagle_disabled: bool,
    prio: u8,
    stats: PcbStats,
}

impl PcbState {
    fn new() -> Self {
        Self {
            owner: None,
            state: TcpState::Closed,
            local: None,
            remote: None,
            peer: None,
            unsent: SegmentChain::new(),
            fin_queued: false,
            fin_sent: false,
            rx_closed: false,
            split_plan: VecDeque::new(),
            close_failures: 0,
            poll_interval: 0,
            poll_elapsed: 0,
            nagle_disabled: false,
            prio: 0,
            stats: PcbStats::default(),
        }
    }

    fn outstanding(&self) -> usize {
        self.stats.received - self.stats.acked
    }
}

#[derive(Debug)]
enum Action {
    Connected(usize),
    Accept { listener: usize, new: usize },
    Reset(usize),
    Sent(usize, usize),
}

#[derive(Debug)]
struct Net {
    options: LoopbackOptions,
    pcbs: Vec<PcbState>,
    listeners: HashMap<u16, usize>,
    next_port: u16,
    actions: VecDeque<Action>,
    cursor: usize,
}

impl Net {
    fn alloc_port(&mut self) -> u16 {
        loop {
            let port = self.next_port;
            self.next_port = self.next_port.checked_add(1).unwrap_or(EPHEMERAL_START);
            if !self.listeners.contains_key(&port) {
                return port;
            }
        }
    }

    fn release(&mut self, index: usize) {
        let pcb = &mut self.pcbs[index];
        pcb.state = TcpState::Closed;
        pcb.owner = None;
        pcb.unsent.clear();
        pcb.split_plan.clear();
        if let Some(port) = pcb.local.map(|addr| addr.port())
            && self.listeners.get(&port) == Some(&index)
        {
            self.listeners.remove(&port);
        }
    }

    /// 选出下一件要做的事；返回的事件在借用释放后分派。
    fn next_step(&mut self) -> Option<(usize, Delivery)> {
        if let Some(action) = self.actions.pop_front() {
            return Some(self.apply(action));
        }
        let count = self.pcbs.len();
        for offset in 0..count {
            let index = (self.cursor + offset) % count;
            if let Some(delivery) = self.transmit(index) {
                self.cursor = (index + 1) % count;
                return Some(delivery);
            }
        }
        None
    }

    fn apply(&mut self, action: Action) -> (usize, Delivery) {
        match action {
            Action::Connected(index) => {
                self.pcbs[index].state = TcpState::Established;
                (index, Delivery::Event(TcpEvent::Connected(Ok(()))))
            }
            Action::Accept { listener, new } => (listener, Delivery::Accept(new)),
            Action::Reset(index) => {
                let was_open = self.pcbs[index].state != TcpState::Closed;
                let owner = self.pcbs[index].owner;
                self.release(index);
                self.pcbs[index].owner = owner;
                let delivery = if was_open {
                    Delivery::Reset
                } else {
                    Delivery::Nothing
                };
                (index, delivery)
            }
            Action::Sent(index, len) => (index, Delivery::Event(TcpEvent::Sent(len))),
        }
    }

    fn transmit(&mut self, index: usize) -> Option<(usize, Delivery)> {
        let peer = self.pcbs[index].peer?;
        if self.pcbs[index].state == TcpState::Closed {
            return None;
        }
        let mss = usize::from(self.options.mss);
        let window = self.options.window;
        let sender = &self.pcbs[index];
        if !sender.unsent.is_empty() {
            let receiver = &self.pcbs[peer];
            let receiver_gone = receiver.state == TcpState::Closed || receiver.rx_closed;
            let open = if receiver_gone {
                usize::MAX
            } else {
                window.saturating_sub(receiver.outstanding())
            };
            let planned = sender.split_plan.front().copied().unwrap_or(usize::MAX);
            let chunk = sender.unsent.len().min(mss).min(open).min(planned);
            if chunk == 0 {
                return None;
            }
            let sender = &mut self.pcbs[index];
            if let Some(front) = sender.split_plan.front_mut() {
                *front -= chunk;
                if *front == 0 {
                    sender.split_plan.pop_front();
                }
            }
            let mut segment = vec![0u8; chunk];
            sender.unsent.read_into(&mut segment);
            self.actions.push_back(Action::Sent(index, chunk));

            let receiver = &mut self.pcbs[peer];
            receiver.stats.received += chunk;
            receiver.stats.segments_received += 1;
            if receiver_gone {
                receiver.stats.acked += chunk;
                trace!(from = index, to = peer, len = chunk, "segment to closed receiver dropped");
                return Some((peer, Delivery::Nothing));
            }
            trace!(from = index, to = peer, len = chunk, "segment delivered");
            return Some((peer, Delivery::Event(TcpEvent::Recv(Some(Bytes::from(segment))))));
        }
        if sender.fin_queued && !sender.fin_sent {
            let sender = &mut self.pcbs[index];
            sender.fin_sent = true;
            sender.state = match sender.state {
                TcpState::FinWait1 => TcpState::FinWait2,
                TcpState::LastAck | TcpState::Closing => TcpState::Closed,
                other => other,
            };
            if sender.state == TcpState::Closed {
                sender.owner = None;
            }
            let receiver = &mut self.pcbs[peer];
            receiver.stats.fin_received = true;
            receiver.state = match receiver.state {
                TcpState::Established => TcpState::CloseWait,
                TcpState::FinWait1 => TcpState::Closing,
                TcpState::FinWait2 => TcpState::TimeWait,
                other => other,
            };
            if receiver.rx_closed || receiver.owner.is_none() {
                return Some((peer, Delivery::Nothing));
            }
            trace!(from = index, to = peer, "fin delivered");
            return Some((peer, Delivery::Event(TcpEvent::Recv(None))));
        }
        None
    }
}

enum Delivery {
    Event(TcpEvent),
    Accept(usize),
    Reset,
    Nothing,
}

/// 回环网络：所有 PCB 与待处理动作的共享表。
#[derive(Clone, Debug)]
pub struct LoopbackNet {
    net: Rc<RefCell<Net>>,
}

impl Default for LoopbackNet {
    fn default() -> Self {
        Self::new(LoopbackOptions::default())
    }
}

impl LoopbackNet {
    pub fn new(options: LoopbackOptions) -> Self {
        Self {
            net: Rc::new(RefCell::new(Net {
                options,
                pcbs: Vec::new(),
                listeners: HashMap::new(),
                next_port: EPHEMERAL_START,
                actions: VecDeque::new(),
                cursor: 0,
            })),
        }
    }

    pub fn options(&self) -> LoopbackOptions {
        self.net.borrow().options.clone()
    }

    /// 分配一个未绑定的 PCB。
    pub fn open(&self) -> LoopbackPcb {
        let mut net = self.net.borrow_mut();
        net.pcbs.push(PcbState::new());
        LoopbackPcb {
            net: self.net.clone(),
            index: net.pcbs.len() - 1,
        }
    }

    /// 推进一步；没有可做的事情时返回 `false`。
    pub fn step(&self, stack: &mut Stack) -> bool {
        let next = self.net.borrow_mut().next_step();
        let Some((index, delivery)) = next else {
            return false;
        };
        let owner = self.net.borrow().pcbs[index].owner;
        match delivery {
            Delivery::Nothing => {}
            Delivery::Accept(new) => {
                let pcb = LoopbackPcb {
                    net: self.net.clone(),
                    index: new,
                };
                match owner {
                    Some(listener) => {
                        let _ = dispatch(stack, listener, TcpEvent::Accept(Box::new(pcb)));
                    }
                    None => {
                        let mut pcb = pcb;
                        pcb.abort();
                    }
                }
            }
            Delivery::Reset => {
                self.net.borrow_mut().pcbs[index].owner = None;
                if let Some(id) = owner {
                    debug!(conn = %id, "connection reset");
                    let _ = dispatch(stack, id, TcpEvent::Error(TransportError::Reset));
                }
            }
            Delivery::Event(event) => match owner {
                Some(id) => {
                    if let Err(err) = dispatch(stack, id, event) {
                        trace!(conn = %id, error = %err, "event not delivered");
                    }
                }
                None => {
                    if let TcpEvent::Recv(Some(data)) = event {
                        let mut net = self.net.borrow_mut();
                        net.pcbs[index].stats.acked += data.len();
                    }
                }
            },
        }
        true
    }

    /// 推进直到静止，返回执行的步数。
    pub fn run(&self, stack: &mut Stack) -> usize {
        let mut steps = 0;
        while self.step(stack) {
            steps += 1;
            if steps == STEP_LIMIT {
                warn!(steps, "loopback did not settle, giving up");
                break;
            }
        }
        steps
    }

    /// 模拟一次粗粒度定时器：轮询计数到期的 PCB 收到 `Poll`。
    pub fn tick(&self, stack: &mut Stack) {
        let due: Vec<ConnId> = {
            let mut net = self.net.borrow_mut();
            net.pcbs
                .iter_mut()
                .filter(|pcb| pcb.poll_interval > 0 && pcb.state != TcpState::Closed)
                .filter_map(|pcb| {
                    pcb.poll_elapsed += 1;
                    if pcb.poll_elapsed < pcb.poll_interval {
                        return None;
                    }
                    pcb.poll_elapsed = 0;
                    pcb.owner
                })
                .collect()
        };
        for id in due {
            let _ = dispatch(stack, id, TcpEvent::Poll);
        }
    }

    /// 让 `conn` 接下来发出的数据段依次不超过给定长度。
    pub fn split_next(&self, conn: ConnId, sizes: &[usize]) -> bool {
        self.with_owned(conn, |pcb| {
            pcb.split_plan
                .extend(sizes.iter().copied().filter(|size| *size > 0));
        })
    }

    /// 让 `conn` 接下来的 `count` 次 `close` 失败。
    pub fn fail_next_closes(&self, conn: ConnId, count: u32) -> bool {
        self.with_owned(conn, |pcb| pcb.close_failures = count)
    }

    pub fn stats(&self, conn: ConnId) -> Option<PcbStats> {
        let net = self.net.borrow();
        net.pcbs
            .iter()
            .find(|pcb| pcb.owner == Some(conn))
            .map(|pcb| PcbStats {
                state: Some(pcb.state),
                unsent: pcb.unsent.len(),
                ..pcb.stats
            })
    }

    /// 按下标读取 PCB 计数，连接释放后仍可查询。
    pub fn stats_of(&self, pcb: &LoopbackPcb) -> PcbStats {
        let net = self.net.borrow();
        let state = &net.pcbs[pcb.index];
        PcbStats {
            state: Some(state.state),
            unsent: state.unsent.len(),
            ..state.stats
        }
    }

    /// `conn` 所在 PCB 的下标，用于在连接释放后继续观测。
    pub fn pcb_index(&self, conn: ConnId) -> Option<usize> {
        self.net
            .borrow()
            .pcbs
            .iter()
            .position(|pcb| pcb.owner == Some(conn))
    }

    pub fn stats_at(&self, index: usize) -> Option<PcbStats> {
        let net = self.net.borrow();
        net.pcbs.get(index).map(|pcb| PcbStats {
            state: Some(pcb.state),
            unsent: pcb.unsent.len(),
            ..pcb.stats
        })
    }

    fn with_owned(&self, conn: ConnId, f: impl FnOnce(&mut PcbState)) -> bool {
        let mut net = self.net.borrow_mut();
        match net.pcbs.iter_mut().find(|pcb| pcb.owner == Some(conn)) {
            Some(pcb) => {
                f(pcb);
                true
            }
            None => false,
        }
    }
}

/// 回环网络中的一个 PCB 句柄。
#[derive(Debug)]
pub struct LoopbackPcb {
    net: Rc<RefCell<Net>>,
    index: usize,
}

impl LoopbackPcb {
    pub fn index(&self) -> usize {
        self.index
    }

    fn with<R>(&self, f: impl FnOnce(&mut Net, usize) -> R) -> R {
        f(&mut self.net.borrow_mut(), self.index)
    }
}

impl TcpPcb for LoopbackPcb {
    fn bind(&mut self, addr: SocketAddr) -> Result<()> {
        self.with(|net, index| {
            let port = match addr.port() {
                0 => net.alloc_port(),
                port if net.listeners.contains_key(&port) => {
                    return Err(TransportError::InvalidState("address in use"));
                }
                port => port,
            };
            net.pcbs[index].local = Some(SocketAddr::new(addr.ip(), port));
            Ok(())
        })
    }

    fn connect(&mut self, addr: SocketAddr) -> Result<()> {
        self.with(|net, index| {
            if net.pcbs[index].state != TcpState::Closed || net.pcbs[index].peer.is_some() {
                return Err(TransportError::InvalidState("pcb already in use"));
            }
            if net.pcbs[index].local.is_none() {
                let port = net.alloc_port();
                net.pcbs[index].local = Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port));
            }
            net.pcbs[index].remote = Some(addr);
            net.pcbs[index].state = TcpState::SynSent;
            let Some(&listener) = net.listeners.get(&addr.port()) else {
                debug!(%addr, "no listener, connection will be refused");
                net.actions.push_back(Action::Reset(index));
                return Ok(());
            };
            let mut accepted = PcbState::new();
            accepted.state = TcpState::Established;
            accepted.local = net.pcbs[listener].local;
            accepted.remote = net.pcbs[index].local;
            accepted.peer = Some(index);
            accepted.poll_interval = net.pcbs[listener].poll_interval;
            net.pcbs.push(accepted);
            let new = net.pcbs.len() - 1;
            net.pcbs[index].peer = Some(new);
            net.actions.push_back(Action::Connected(index));
            net.actions.push_back(Action::Accept { listener, new });
            debug!(%addr, client = index, server = new, "loopback connection established");
            Ok(())
        })
    }

    fn listen(&mut self, _backlog: u8) -> Result<()> {
        self.with(|net, index| {
            let local = match net.pcbs[index].local {
                Some(local) => local,
                None => {
                    let port = net.alloc_port();
                    let local = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);
                    net.pcbs[index].local = Some(local);
                    local
                }
            };
            if net.listeners.contains_key(&local.port()) {
                return Err(TransportError::InvalidState("address in use"));
            }
            net.listeners.insert(local.port(), index);
            net.pcbs[index].state = TcpState::Listen;
            Ok(())
        })
    }

    fn write(&mut self, data: &[u8], _flags: WriteFlags) -> Result<()> {
        self.with(|net, index| {
            let sndbuf = net.options.sndbuf;
            let pcb = &mut net.pcbs[index];
            if !matches!(pcb.state, TcpState::Established | TcpState::CloseWait) || pcb.fin_queued {
                return Err(TransportError::Closed);
            }
            if data.is_empty() {
                return Ok(());
            }
            if data.len() > sndbuf.saturating_sub(pcb.unsent.len()) {
                return Err(TransportError::WouldBlock);
            }
            pcb.unsent.push(Bytes::copy_from_slice(data));
            pcb.stats.written += data.len();
            Ok(())
        })
    }

    fn output(&mut self) -> Result<()> {
        Ok(())
    }

    fn recved(&mut self, len: usize) {
        self.with(|net, index| {
            let stats = &mut net.pcbs[index].stats;
            stats.acked = (stats.acked + len).min(stats.received);
        });
    }

    fn close(&mut self) -> Result<()> {
        self.with(|net, index| {
            let pcb = &mut net.pcbs[index];
            if pcb.close_failures > 0 {
                pcb.close_failures -= 1;
                return Err(TransportError::OutOfMemory);
            }
            pcb.rx_closed = true;
            let state = pcb.state;
            match state {
                TcpState::Established | TcpState::SynReceived => {
                    pcb.fin_queued = true;
                    pcb.state = TcpState::FinWait1;
                }
                TcpState::CloseWait => {
                    pcb.fin_queued = true;
                    pcb.state = TcpState::LastAck;
                }
                TcpState::FinWait1
                | TcpState::FinWait2
                | TcpState::Closing
                | TcpState::LastAck
                | TcpState::TimeWait => {}
                TcpState::Closed | TcpState::Listen | TcpState::SynSent => {
                    if let Some(peer) = net.pcbs[index].peer
                        && net.pcbs[peer].state != TcpState::Closed
                    {
                        net.actions.push_back(Action::Reset(peer));
                    }
                    net.release(index);
                }
            }
            Ok(())
        })
    }

    fn shutdown(&mut self, direction: ShutdownDirection) -> Result<()> {
        self.with(|net, index| {
            let pcb = &mut net.pcbs[index];
            if matches!(direction, ShutdownDirection::Read | ShutdownDirection::Both) {
                pcb.rx_closed = true;
            }
            if matches!(direction, ShutdownDirection::Write | ShutdownDirection::Both) {
                match pcb.state {
                    TcpState::Established => {
                        pcb.fin_queued = true;
                        pcb.state = TcpState::FinWait1;
                    }
                    TcpState::CloseWait => {
                        pcb.fin_queued = true;
                        pcb.state = TcpState::LastAck;
                    }
                    _ => return Err(TransportError::InvalidState("write half not open")),
                }
            }
            Ok(())
        })
    }

    fn abort(&mut self) {
        self.with(|net, index| {
            if let Some(peer) = net.pcbs[index].peer
                && net.pcbs[peer].state != TcpState::Closed
            {
                net.actions.push_back(Action::Reset(peer));
            }
            net.release(index);
        });
    }

    fn mss(&self) -> u16 {
        self.with(|net, _| net.options.mss)
    }

    fn sndbuf(&self) -> usize {
        self.with(|net, index| net.options.sndbuf.saturating_sub(net.pcbs[index].unsent.len()))
    }

    fn sndqueuelen(&self) -> usize {
        self.with(|net, index| net.pcbs[index].unsent.segment_count())
    }

    fn set_nagle(&mut self, disabled: bool) {
        self.with(|net, index| net.pcbs[index].nagle_disabled = disabled);
    }

    fn nagle_disabled(&self) -> bool {
        self.with(|net, index| net.pcbs[index].nagle_disabled)
    }

    fn set_prio(&mut self, prio: u8) {
        self.with(|net, index| net.pcbs[index].prio = prio);
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.with(|net, index| net.pcbs[index].local)
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.with(|net, index| net.pcbs[index].remote)
    }

    fn state(&self) -> TcpState {
        self.with(|net, index| net.pcbs[index].state)
    }

    fn set_poll_interval(&mut self, interval: u8) {
        self.with(|net, index| {
            net.pcbs[index].poll_interval = interval;
            net.pcbs[index].poll_elapsed = 0;
        });
    }

    fn attach(&mut self, id: ConnId) {
        self.with(|net, index| {
            if net.pcbs[index].state != TcpState::Closed || net.pcbs[index].peer.is_none() {
                net.pcbs[index].owner = Some(id);
            }
        });
    }

    fn detach(&mut self) {
        self.with(|net, index| net.pcbs[index].owner = None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pcb::new_conn;

    #[test]
    fn options_parse_from_toml_with_defaults() {
        let options = LoopbackOptions::from_toml_str("sndbuf = 1200\n").expect("解析 TOML");
        assert_eq!(options.sndbuf, 1200);
        assert_eq!(options.mss, 1460);
        assert_eq!(options.window, 65535);
    }

    #[test]
    fn options_reject_unknown_and_zero_fields() {
        assert!(matches!(
            LoopbackOptions::from_toml_str("mss = 0"),
            Err(OptionsError::Invalid(_))
        ));
        assert!(matches!(
            LoopbackOptions::from_toml_str("bogus = 1"),
            Err(OptionsError::Toml(_))
        ));
    }

    #[test]
    fn write_is_all_or_nothing() {
        let net = LoopbackNet::new(LoopbackOptions {
            sndbuf: 10,
            ..LoopbackOptions::default()
        });
        let mut stack = Stack::new();
        let listener = new_conn(&mut stack, Box::new(net.open()));
        stack.listen(listener, 1).expect("监听");
        stack
            .set_accept(listener, |_, _, _| Ok(()))
            .expect("注册 accept");
        let port = stack.port(listener, true);
        let mut client = net.open();
        client
            .connect(SocketAddr::from(([127, 0, 0, 1], port)))
            .expect("连接");
        net.run(&mut stack);
        assert_eq!(client.state(), TcpState::Established);
        assert_eq!(client.write(&[0; 11], WriteFlags::COPY), Err(TransportError::WouldBlock));
        client.write(&[0; 6], WriteFlags::COPY).expect("写入");
        assert_eq!(client.sndbuf(), 4);
        assert_eq!(client.write(&[0; 5], WriteFlags::COPY), Err(TransportError::WouldBlock));
    }

    #[test]
    fn connect_without_listener_is_reset() {
        let net = LoopbackNet::default();
        let mut client = net.open();
        client
            .connect(SocketAddr::from(([127, 0, 0, 1], 9)))
            .expect("发起连接");
        assert_eq!(client.state(), TcpState::SynSent);
        let mut stack = Stack::new();
        net.run(&mut stack);
        assert_eq!(client.state(), TcpState::Closed);
    }
}
