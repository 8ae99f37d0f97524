//! Frame transceiver: one framed, bidirectional connection.
//!
//! A [`Transceiver`] splits a byte stream into a read half and a write half
//! and runs one pipeline task on each:
//!
//! ```text
//!                 ┌──────────── Transceiver ────────────┐
//! frame_transmit ─┼─► TX queue ─► TX task ─► write half ─┼─► peer
//! frame_receive  ◄┼── RX queue ◄─ RX task ◄─ read half  ◄┼── peer
//!   (or FrameHandler::on_frame in push mode)            │
//!                 └──────────────────────────────────────┘
//! ```
//!
//! Both queues are bounded. Graceful close enqueues a shutdown sentinel behind
//! the queued frames and leaves reading running until the peer ends; forced
//! close tears both pipelines down at once. The stream is dropped once both
//! pipelines have exited, which is what [`Transceiver::wait`] observes.

mod rx;
mod tx;

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use crate::cancel::CancelToken;
use crate::defect;
use crate::error::{MbapError, Result};
use crate::protocol::Frame;

use rx::{rx_loop, RxEnd, RxSink};
use tx::{tx_loop, Outbound, OutboundFrame, TxEnd};

/// Default depth of the inbound queue in pull mode.
pub const DEFAULT_RX_CAPACITY: usize = 16;

/// Default depth of the outbound queue.
pub const DEFAULT_TX_CAPACITY: usize = 16;

/// Transceiver tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransceiverConfig {
    /// Inbound queue depth (pull mode).
    pub rx_capacity: usize,
    /// Outbound queue depth.
    pub tx_capacity: usize,
    /// End reading after this long without any bytes read or written.
    pub idle_timeout: Option<Duration>,
}

impl Default for TransceiverConfig {
    fn default() -> Self {
        Self {
            rx_capacity: DEFAULT_RX_CAPACITY,
            tx_capacity: DEFAULT_TX_CAPACITY,
            idle_timeout: None,
        }
    }
}

impl TransceiverConfig {
    pub fn with_rx_capacity(mut self, capacity: usize) -> Self {
        self.rx_capacity = capacity;
        self
    }

    pub fn with_tx_capacity(mut self, capacity: usize) -> Self {
        self.tx_capacity = capacity;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }
}

/// Push-mode consumer of received frames.
///
/// Both callbacks run on the RX pipeline task and must not block.
pub trait FrameHandler: Send + 'static {
    /// A complete frame arrived.
    fn on_frame(&mut self, frame: Frame);

    /// The RX pipeline ended. Called exactly once, after the last frame.
    fn on_end(&mut self) {}
}

/// How received frames are consumed.
pub enum ReceiveMode {
    /// Frames are queued for [`Transceiver::frame_receive`].
    Pull,
    /// Frames are handed to the handler as they arrive.
    Push(Box<dyn FrameHandler>),
}

impl fmt::Debug for ReceiveMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReceiveMode::Pull => f.write_str("Pull"),
            ReceiveMode::Push(_) => f.write_str("Push"),
        }
    }
}

/// Time of the last read or write, shared by both pipelines.
#[derive(Debug, Clone)]
pub(crate) struct Activity {
    last: Arc<Mutex<Instant>>,
    limit: Option<Duration>,
}

impl Activity {
    pub(crate) fn new() -> Self {
        Self::with_idle(None)
    }

    pub(crate) fn with_idle(limit: Option<Duration>) -> Self {
        Self {
            last: Arc::new(Mutex::new(Instant::now())),
            limit,
        }
    }

    fn last(&self) -> Instant {
        *self.last.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub(crate) fn touch(&self) {
        *self.last.lock().unwrap_or_else(|p| p.into_inner()) = Instant::now();
    }

    /// Resolve once the idle limit has passed without activity.
    pub(crate) async fn idle(&self) {
        let Some(limit) = self.limit else {
            return std::future::pending().await;
        };
        loop {
            let deadline = self.last() + limit;
            if Instant::now() >= deadline {
                return;
            }
            tokio::time::sleep_until(deadline).await;
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Status {
    rx_ended: bool,
    tx_ended: bool,
}

/// Framed connection over any async byte stream.
///
/// Dropping the last handle closes the transceiver forcibly.
pub struct Transceiver {
    outbound: mpsc::Sender<Outbound>,
    /// Present in pull mode only.
    inbound: Option<tokio::sync::Mutex<mpsc::Receiver<Frame>>>,
    abort: Arc<watch::Sender<bool>>,
    status: Arc<watch::Sender<Status>>,
    closing: AtomicBool,
    peer: Option<SocketAddr>,
}

impl Transceiver {
    /// Start both pipelines over `stream`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new<S>(stream: S, mode: ReceiveMode, config: &TransceiverConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::start(stream, mode, config, None)
    }

    /// Start a transceiver over a TCP stream with `TCP_NODELAY` set.
    pub fn tcp(stream: TcpStream, mode: ReceiveMode, config: &TransceiverConfig) -> Self {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("failed to set TCP_NODELAY: {}", e);
        }
        let peer = stream.peer_addr().ok();
        Self::start(stream, mode, config, peer)
    }

    fn start<S>(
        stream: S,
        mode: ReceiveMode,
        config: &TransceiverConfig,
        peer: Option<SocketAddr>,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (outbound, outbound_rx) = mpsc::channel(config.tx_capacity.max(1));
        let (abort, abort_rx) = watch::channel(false);
        let abort = Arc::new(abort);
        let (status, _) = watch::channel(Status::default());
        let status = Arc::new(status);
        let activity = Activity::with_idle(config.idle_timeout);

        let (sink, inbound) = match mode {
            ReceiveMode::Pull => {
                let (queue_tx, queue_rx) = mpsc::channel(config.rx_capacity.max(1));
                (
                    RxSink::Queue(queue_tx),
                    Some(tokio::sync::Mutex::new(queue_rx)),
                )
            }
            ReceiveMode::Push(handler) => (RxSink::Handler(handler), None),
        };

        let rx_task = {
            let abort_rx = abort_rx.clone();
            let activity = activity.clone();
            async move {
                match rx_loop(reader, sink, abort_rx, activity).await {
                    RxEnd::Failed(e) => tracing::debug!(?peer, "read failed: {}", e),
                    RxEnd::ShortRead => tracing::debug!(?peer, "peer closed mid-frame"),
                    RxEnd::Idle => tracing::debug!(?peer, "idle timeout"),
                    end => tracing::trace!(?peer, ?end, "read pipeline ended"),
                }
            }
        };
        let rx_status = Arc::clone(&status);
        defect::spawn_supervised("transceiver rx", rx_task, move || {
            rx_status.send_modify(|s| s.rx_ended = true);
        });

        let tx_task = {
            let abort = Arc::clone(&abort);
            async move {
                match tx_loop(outbound_rx, writer, abort_rx, activity).await {
                    TxEnd::Failed(e) => {
                        tracing::debug!(?peer, "write failed: {}", e);
                        abort.send_replace(true);
                    }
                    end => tracing::trace!(?peer, ?end, "write pipeline ended"),
                }
            }
        };
        let tx_status = Arc::clone(&status);
        defect::spawn_supervised("transceiver tx", tx_task, move || {
            tx_status.send_modify(|s| s.tx_ended = true);
        });

        Self {
            outbound,
            inbound,
            abort,
            status,
            closing: AtomicBool::new(false),
            peer,
        }
    }

    /// Receive the next frame; `None` means end of stream.
    ///
    /// Fails with invalid-operation in push mode.
    pub async fn frame_receive(&self) -> Result<Option<Frame>> {
        self.receive(None).await
    }

    /// [`frame_receive`](Self::frame_receive) with a cancellation input.
    pub async fn frame_receive_cancellable(&self, cancel: &CancelToken) -> Result<Option<Frame>> {
        self.receive(Some(cancel)).await
    }

    pub(crate) async fn receive(&self, cancel: Option<&CancelToken>) -> Result<Option<Frame>> {
        let inbound = self.inbound.as_ref().ok_or_else(|| {
            MbapError::InvalidOperation("frame_receive is unavailable in push mode".to_string())
        })?;
        if let Some(token) = cancel {
            token.check()?;
        }

        let mut queue = tokio::select! {
            biased;
            _ = crate::cancel::cancelled(cancel) => return Err(MbapError::Cancelled),
            queue = inbound.lock() => queue,
        };
        tokio::select! {
            biased;
            _ = crate::cancel::cancelled(cancel) => Err(MbapError::Cancelled),
            frame = queue.recv() => Ok(frame),
        }
    }

    /// Queue a frame for transmission, waiting while the TX queue is full.
    pub async fn frame_transmit(&self, frame: Frame) -> Result<()> {
        self.transmit(frame, None).await
    }

    /// [`frame_transmit`](Self::frame_transmit) with a cancellation input.
    pub async fn frame_transmit_cancellable(&self, frame: Frame, cancel: &CancelToken) -> Result<()> {
        self.transmit(frame, Some(cancel)).await
    }

    pub(crate) async fn transmit(&self, frame: Frame, cancel: Option<&CancelToken>) -> Result<()> {
        if self.is_closing() {
            return Err(MbapError::closed("transceiver"));
        }
        if let Some(token) = cancel {
            token.check()?;
        }

        let item = Outbound::Frame(OutboundFrame::new(&frame));
        tokio::select! {
            biased;
            _ = crate::cancel::cancelled(cancel) => Err(MbapError::Cancelled),
            sent = self.outbound.send(item) => sent.map_err(|_| {
                if self.is_closing() {
                    MbapError::closed("transceiver")
                } else {
                    MbapError::Communication("connection lost".to_string())
                }
            }),
        }
    }

    /// Close the transceiver.
    ///
    /// Graceful close writes every frame queued so far, then shuts down the
    /// write side; reading continues until the peer ends. Forced close stops
    /// both pipelines immediately. Later calls may escalate graceful to forced.
    pub fn close(&self, forcibly: bool) {
        let first = !self.closing.swap(true, Ordering::AcqRel);
        if forcibly {
            tracing::debug!(peer = ?self.peer, "closing transceiver forcibly");
            self.abort.send_replace(true);
            return;
        }
        if !first {
            return;
        }

        tracing::debug!(peer = ?self.peer, "closing transceiver");
        match self.outbound.try_send(Outbound::Shutdown) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(sentinel)) => {
                let outbound = self.outbound.clone();
                tokio::spawn(async move {
                    let _ = outbound.send(sentinel).await;
                });
            }
        }
    }

    /// Wait until the RX pipeline has ended.
    pub async fn ended(&self) {
        let mut status = self.status.subscribe();
        let _ = status.wait_for(|s| s.rx_ended).await;
    }

    /// Wait until both pipelines have exited and the stream is closed.
    pub async fn wait(&self) {
        let mut status = self.status.subscribe();
        let _ = status.wait_for(|s| s.rx_ended && s.tx_ended).await;
    }

    /// [`wait`](Self::wait) with a cancellation input.
    pub async fn wait_cancellable(&self, cancel: &CancelToken) -> Result<()> {
        cancel.check()?;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(MbapError::Cancelled),
            _ = self.wait() => Ok(()),
        }
    }

    /// Check whether the RX pipeline has ended.
    pub fn is_ended(&self) -> bool {
        self.status.borrow().rx_ended
    }

    /// Check whether both pipelines have exited.
    pub fn is_closed(&self) -> bool {
        let status = *self.status.borrow();
        status.rx_ended && status.tx_ended
    }

    /// Check whether `close` has been called.
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Remote address, when the stream is TCP.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }
}

impl Drop for Transceiver {
    fn drop(&mut self) {
        self.abort.send_replace(true);
    }
}

impl fmt::Debug for Transceiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transceiver")
            .field("peer", &self.peer)
            .field("pull", &self.inbound.is_some())
            .field("closing", &self.is_closing())
            .field("status", &*self.status.borrow())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use bytes::Bytes;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    const WAIT: Duration = Duration::from_secs(1);

    fn frame(tid: u16) -> Frame {
        Frame::modbus(tid, Bytes::from_static(&[0x01, 0x03, 0x00])).unwrap()
    }

    fn pair() -> (Transceiver, Transceiver) {
        let (a, b) = duplex(4096);
        let config = TransceiverConfig::default();
        (
            Transceiver::new(a, ReceiveMode::Pull, &config),
            Transceiver::new(b, ReceiveMode::Pull, &config),
        )
    }

    #[test]
    fn test_config_default() {
        let config = TransceiverConfig::default();
        assert_eq!(config.rx_capacity, DEFAULT_RX_CAPACITY);
        assert_eq!(config.tx_capacity, DEFAULT_TX_CAPACITY);
        assert_eq!(config.idle_timeout, None);

        let config = config.with_rx_capacity(1).with_idle_timeout(Some(WAIT));
        assert_eq!(config.rx_capacity, 1);
        assert_eq!(config.idle_timeout, Some(WAIT));
    }

    #[tokio::test]
    async fn test_transmit_order_is_receive_order() {
        let (a, b) = pair();
        for tid in 0..20 {
            a.frame_transmit(frame(tid)).await.unwrap();
        }
        for tid in 0..20 {
            let received = b.frame_receive().await.unwrap().unwrap();
            assert_eq!(received, frame(tid));
        }
    }

    #[tokio::test]
    async fn test_receive_in_push_mode_rejected() {
        struct Sink;
        impl FrameHandler for Sink {
            fn on_frame(&mut self, _frame: Frame) {}
        }

        let (a, _b) = duplex(64);
        let t = Transceiver::new(a, ReceiveMode::Push(Box::new(Sink)), &TransceiverConfig::default());
        let err = t.frame_receive().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidOperation);
    }

    #[tokio::test]
    async fn test_graceful_close_flushes_then_ends_peer() {
        let (a, b) = pair();
        a.frame_transmit(frame(1)).await.unwrap();
        a.frame_transmit(frame(2)).await.unwrap();
        a.close(false);

        let err = a.frame_transmit(frame(3)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidOperation);

        assert_eq!(b.frame_receive().await.unwrap().unwrap().transaction_id(), 1);
        assert_eq!(b.frame_receive().await.unwrap().unwrap().transaction_id(), 2);
        assert!(b.frame_receive().await.unwrap().is_none());
        assert!(b.is_ended());

        // `a` keeps reading until `b` finishes too.
        assert!(!a.is_ended());
        b.close(false);
        tokio::time::timeout(WAIT, a.wait()).await.unwrap();
        assert!(a.is_closed());
    }

    #[tokio::test]
    async fn test_forced_close_ends_both_pipelines() {
        let (a, _b) = pair();
        a.close(true);
        tokio::time::timeout(WAIT, a.wait()).await.unwrap();
        assert!(a.is_ended());
        assert!(a.is_closed());
        assert!(a.frame_receive().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_wait_cancellable() {
        let (a, _b) = pair();
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = a.wait_cancellable(&cancel).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert!(!a.is_closed());

        a.close(true);
        tokio::time::timeout(WAIT, a.wait_cancellable(&CancelToken::new()))
            .await
            .unwrap()
            .unwrap();
        assert!(a.is_closed());
    }

    #[tokio::test]
    async fn test_ended_resolves_when_peer_drops() {
        let (a, b) = pair();
        drop(b);
        tokio::time::timeout(WAIT, a.ended()).await.unwrap();
        assert!(a.is_ended());
    }

    #[tokio::test]
    async fn test_receive_cancelled() {
        let (a, _b) = pair();
        let cancel = CancelToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });
        let err = a.frame_receive_cancellable(&cancel).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
    }

    #[tokio::test]
    async fn test_oversized_frame_dropped_connection_survives() {
        let (raw, peer) = duplex(4096);
        let t = Transceiver::new(peer, ReceiveMode::Pull, &TransceiverConfig::default());
        let (mut reader, mut writer) = tokio::io::split(raw);

        let mut oversized = vec![0x00, 0x05, 0x00, 0x00, 0x01, 0x00];
        oversized.extend(std::iter::repeat(0xAA).take(256));
        writer.write_all(&oversized).await.unwrap();
        writer.write_all(&frame(6).to_bytes()).await.unwrap();

        let received = t.frame_receive().await.unwrap().unwrap();
        assert_eq!(received.transaction_id(), 6);

        t.frame_transmit(frame(9)).await.unwrap();
        let mut echoed = vec![0u8; frame(9).wire_size()];
        reader.read_exact(&mut echoed).await.unwrap();
        assert_eq!(echoed, frame(9).to_bytes());
    }

    #[tokio::test]
    async fn test_idle_timeout_ends_connection() {
        let (a, _b) = duplex(64);
        let config = TransceiverConfig::default().with_idle_timeout(Some(Duration::from_millis(30)));
        let t = Transceiver::new(a, ReceiveMode::Pull, &config);
        assert!(tokio::time::timeout(WAIT, t.frame_receive())
            .await
            .unwrap()
            .unwrap()
            .is_none());
    }
}
