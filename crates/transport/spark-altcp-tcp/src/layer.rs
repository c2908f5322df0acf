use std::net::SocketAddr;

use spark_altcp::{
    Event, Layer, LayerCx, Result, SegmentChain, ShutdownDirection, TcpState, TransportError,
    WriteFlags,
};
use tracing::{debug, trace, warn};

use crate::pcb::TcpPcb;

/// 明文 TCP 适配层：把通用连接契约一对一映射到 TCP 引擎的 PCB 上。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 作为默认、零额外开销的传输变体，所有操作直接落到 [`TcpPcb`]；
/// - 同时承担“应用拒收数据”的暂存：引擎已经交付的字节不能退回，只能留在本层等待重投。
///
/// ## 逻辑 (How)
/// - `rx` 保存尚未被上层接受的数据；同一时刻至多一次 `Recv` 在途（`in_flight`），
///   上层的处理结果经 `on_recv_result` 回到本层：接受则消费，拒收则保留，等下一次 recv/poll 重试；
/// - 对端 FIN 若落在拒收数据之后，则延后到数据被接受后再上抛；
/// - 引擎报告致命错误时 PCB 已被引擎释放，本层只丢弃引用并上抛终止事件。
///
/// ## 契约 (What)
/// - `close` 先解除回调再调用引擎关闭；失败时重新挂回回调与轮询间隔，再把失败返回给调用方；
/// - `shutdown(Both)` 等价于 `close`；`shutdown(Read)` 之后到达的数据被确认并丢弃。
///
/// ## 注意事项 (Trade-offs)
/// - 多片段重投时 `to_bytes` 会拼接一次；拒收本就是慢路径，换取上层一次拿到全部待处理数据。
pub struct TcpLayer {
    pcb: Option<Box<dyn TcpPcb>>,
    rx: SegmentChain,
    in_flight: Option<usize>,
    fin_pending: bool,
    fin_delivered: bool,
    rx_shut: bool,
}

impl TcpLayer {
    pub fn new(pcb: Box<dyn TcpPcb>) -> Self {
        Self {
            pcb: Some(pcb),
            rx: SegmentChain::new(),
            in_flight: None,
            fin_pending: false,
            fin_delivered: false,
            rx_shut: false,
        }
    }

    /// 等待上层接受的字节数。
    pub fn pending_rx(&self) -> usize {
        self.rx.len()
    }

    pub fn has_pcb(&self) -> bool {
        self.pcb.is_some()
    }

    fn pcb(&mut self) -> Result<&mut Box<dyn TcpPcb>> {
        self.pcb.as_mut().ok_or(TransportError::Closed)
    }

    fn offer(&mut self, cx: &mut LayerCx<'_>) {
        if self.in_flight.is_some() {
            return;
        }
        if self.rx_shut {
            let dropped = self.rx.len();
            if dropped > 0 {
                self.rx.clear();
                if let Some(pcb) = self.pcb.as_mut() {
                    pcb.recved(dropped);
                }
                trace!(conn = %cx.id(), len = dropped, "rx shut, data acknowledged and dropped");
            }
            return;
        }
        if !self.rx.is_empty() {
            let data = self.rx.to_bytes();
            self.in_flight = Some(data.len());
            cx.emit(Event::Recv(Some(data)));
        } else if self.fin_pending && !self.fin_delivered {
            self.fin_delivered = true;
            cx.emit(Event::Recv(None));
        }
    }
}

impl Layer for TcpLayer {
    fn name(&self) -> &'static str {
        "tcp"
    }

    fn on_lower(&mut self, cx: &mut LayerCx<'_>, event: Event) -> Result<()> {
        match event {
            Event::Recv(Some(data)) => {
                self.rx.push(data);
                self.offer(cx);
            }
            Event::Recv(None) => {
                trace!(conn = %cx.id(), held = self.rx.len(), "peer fin");
                self.fin_pending = true;
                self.offer(cx);
            }
            Event::Poll => {
                self.offer(cx);
                cx.emit(Event::Poll);
            }
            Event::Error(reason) => {
                debug!(conn = %cx.id(), error = %reason, "tcp engine reported fatal error");
                self.pcb = None;
                self.rx.clear();
                cx.fail(reason);
            }
            other => cx.emit(other),
        }
        Ok(())
    }

    fn on_recv_result(&mut self, cx: &mut LayerCx<'_>, result: Result<()>) {
        let Some(len) = self.in_flight.take() else {
            return;
        };
        match result {
            Ok(()) => {
                self.rx.advance(len);
                self.offer(cx);
            }
            Err(err) => {
                trace!(conn = %cx.id(), len, error = %err, "data refused, kept for redelivery");
            }
        }
    }

    fn set_poll(&mut self, _cx: &mut LayerCx<'_>, interval: u8) {
        if let Some(pcb) = self.pcb.as_mut() {
            pcb.set_poll_interval(interval);
        }
    }

    fn recved(&mut self, _cx: &mut LayerCx<'_>, len: usize) {
        if let Some(pcb) = self.pcb.as_mut() {
            pcb.recved(len);
        }
    }

    fn bind(&mut self, _cx: &mut LayerCx<'_>, addr: SocketAddr) -> Result<()> {
        self.pcb()?.bind(addr)
    }

    fn connect(&mut self, _cx: &mut LayerCx<'_>, addr: SocketAddr) -> Result<()> {
        self.pcb()?.connect(addr)
    }

    fn listen(&mut self, _cx: &mut LayerCx<'_>, backlog: u8) -> Result<()> {
        self.pcb()?.listen(backlog)
    }

    fn abort(&mut self, cx: &mut LayerCx<'_>) {
        if let Some(mut pcb) = self.pcb.take() {
            pcb.detach();
            pcb.abort();
            debug!(conn = %cx.id(), "tcp pcb aborted");
        }
        self.rx.clear();
    }

    fn close(&mut self, cx: &mut LayerCx<'_>) -> Result<()> {
        let Some(pcb) = self.pcb.as_mut() else {
            cx.release();
            return Ok(());
        };
        pcb.detach();
        match pcb.close() {
            Ok(()) => {
                self.pcb = None;
                cx.release();
                Ok(())
            }
            Err(err) => {
                pcb.attach(cx.id());
                pcb.set_poll_interval(cx.poll_interval());
                warn!(conn = %cx.id(), error = %err, "tcp close failed, callbacks re-armed");
                Err(err)
            }
        }
    }

    fn shutdown(&mut self, cx: &mut LayerCx<'_>, direction: ShutdownDirection) -> Result<()> {
        if direction == ShutdownDirection::Both {
            return self.close(cx);
        }
        self.pcb()?.shutdown(direction)?;
        if direction == ShutdownDirection::Read {
            self.rx_shut = true;
            self.offer(cx);
        }
        Ok(())
    }

    fn write(&mut self, _cx: &mut LayerCx<'_>, data: &[u8], flags: WriteFlags) -> Result<()> {
        self.pcb()?.write(data, flags)
    }

    fn output(&mut self, _cx: &mut LayerCx<'_>) -> Result<()> {
        self.pcb()?.output()
    }

    fn mss(&mut self, _cx: &mut LayerCx<'_>) -> u16 {
        self.pcb.as_ref().map_or(0, |pcb| pcb.mss())
    }

    fn sndbuf(&mut self, _cx: &mut LayerCx<'_>) -> usize {
        self.pcb.as_ref().map_or(0, |pcb| pcb.sndbuf())
    }

    fn sndqueuelen(&mut self, _cx: &mut LayerCx<'_>) -> usize {
        self.pcb.as_ref().map_or(0, |pcb| pcb.sndqueuelen())
    }

    fn nagle_disable(&mut self, _cx: &mut LayerCx<'_>) {
        if let Some(pcb) = self.pcb.as_mut() {
            pcb.set_nagle(true);
        }
    }

    fn nagle_enable(&mut self, _cx: &mut LayerCx<'_>) {
        if let Some(pcb) = self.pcb.as_mut() {
            pcb.set_nagle(false);
        }
    }

    fn nagle_disabled(&mut self, _cx: &mut LayerCx<'_>) -> bool {
        self.pcb.as_ref().is_some_and(|pcb| pcb.nagle_disabled())
    }

    fn setprio(&mut self, _cx: &mut LayerCx<'_>, prio: u8) {
        if let Some(pcb) = self.pcb.as_mut() {
            pcb.set_prio(prio);
        }
    }

    fn local_addr(&mut self, _cx: &mut LayerCx<'_>) -> Option<SocketAddr> {
        self.pcb.as_ref()?.local_addr()
    }

    fn remote_addr(&mut self, _cx: &mut LayerCx<'_>) -> Option<SocketAddr> {
        self.pcb.as_ref()?.remote_addr()
    }

    fn tcp_state(&mut self, _cx: &mut LayerCx<'_>) -> TcpState {
        self.pcb.as_ref().map_or(TcpState::Closed, |pcb| pcb.state())
    }

    fn dealloc(&mut self, cx: &mut LayerCx<'_>) {
        if let Some(mut pcb) = self.pcb.take() {
            warn!(conn = %cx.id(), "tcp layer freed with live pcb, aborting it");
            pcb.detach();
            pcb.abort();
        }
    }
}
