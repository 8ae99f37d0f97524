//! Slave transport: accepted connections feed one globally ordered queue.
//!
//! ```text
//! acceptor ──► connection handler ─┐
//!          ──► connection handler ─┼─► arrivals ─► dispatcher ─► pending queue ─► poll()
//!          ──► connection handler ─┘                  │
//!                                          permit + transaction task
//! ```
//!
//! Every handler forwards parsed queries to a single dispatcher in arrival
//! order. The dispatcher takes one of the `parallel` permits for each, spawns
//! the task that will carry out the application's decision, and queues the
//! transaction. Because only the dispatcher takes permits, queue order is
//! arrival order across all connections.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinSet;

use super::config::SlaveConfig;
use super::listener;
use super::transaction::{transaction, Transaction, TransactionState};
use crate::cancel::CancelToken;
use crate::defect;
use crate::error::{MbapError, Result};
use crate::protocol::{is_valid_pdu_len, Query};
use crate::transceiver::{ReceiveMode, Transceiver, TransceiverConfig};

/// Pause after a failed accept before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Counts one query of a connection until its transaction finishes.
pub(crate) struct InFlight {
    count: Arc<watch::Sender<usize>>,
}

impl InFlight {
    fn new(count: &Arc<watch::Sender<usize>>) -> Self {
        count.send_modify(|n| *n += 1);
        Self {
            count: Arc::clone(count),
        }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.count.send_modify(|n| *n -= 1);
    }
}

/// A parsed query on its way to the dispatcher.
struct Arrival {
    transaction_id: u16,
    query: Query,
    transceiver: Arc<Transceiver>,
    in_flight: InFlight,
}

struct Shared {
    /// Set by any close: stop accepting, reading and polling.
    stop: watch::Sender<bool>,
    /// Set by a forcible close: tear everything down now.
    abort: watch::Sender<bool>,
    closed: watch::Sender<bool>,
    pending: tokio::sync::Mutex<mpsc::UnboundedReceiver<Transaction>>,
    local_addr: SocketAddr,
}

/// Server side of the transport.
///
/// Dropping the transport closes it forcibly.
pub struct SlaveTransport {
    shared: Arc<Shared>,
}

impl SlaveTransport {
    /// Bind the listening socket and start accepting connections.
    pub async fn bind(config: SlaveConfig) -> Result<Self> {
        config.validate()?;
        let listener = listener::bind(&config).await?;
        let local_addr = listener.local_addr()?;
        tracing::debug!(%local_addr, parallel = config.parallel, "slave transport listening");

        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (stop, _) = watch::channel(false);
        let (abort, _) = watch::channel(false);
        let (closed, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            stop,
            abort,
            closed,
            pending: tokio::sync::Mutex::new(queue_rx),
            local_addr,
        });

        let on_exit = Arc::clone(&shared);
        defect::spawn_supervised(
            "slave acceptor",
            run(listener, config, Arc::clone(&shared), queue_tx),
            move || {
                on_exit.stop.send_replace(true);
                on_exit.closed.send_replace(true);
            },
        );

        Ok(Self { shared })
    }

    /// Bind from a JSON configuration dictionary.
    pub async fn from_json(value: &Value) -> Result<Self> {
        Self::bind(SlaveConfig::from_json(value)?).await
    }

    /// Take the next pending transaction, waiting for one if necessary.
    ///
    /// Fails with invalid-operation once the transport is closing.
    pub async fn poll(&self) -> Result<Transaction> {
        self.next(None).await
    }

    /// [`poll`](Self::poll) with a cancellation input.
    pub async fn poll_cancellable(&self, cancel: &CancelToken) -> Result<Transaction> {
        self.next(Some(cancel)).await
    }

    async fn next(&self, cancel: Option<&CancelToken>) -> Result<Transaction> {
        let mut stop = self.shared.stop.subscribe();
        if *stop.borrow() {
            return Err(MbapError::closed("slave transport"));
        }
        if let Some(token) = cancel {
            token.check()?;
        }

        let mut queue = tokio::select! {
            biased;
            _ = crate::cancel::cancelled(cancel) => return Err(MbapError::Cancelled),
            _ = stop.wait_for(|s| *s) => return Err(MbapError::closed("slave transport")),
            queue = self.shared.pending.lock() => queue,
        };
        tokio::select! {
            biased;
            _ = crate::cancel::cancelled(cancel) => Err(MbapError::Cancelled),
            _ = stop.wait_for(|s| *s) => Err(MbapError::closed("slave transport")),
            transaction = queue.recv() => {
                transaction.ok_or_else(|| MbapError::closed("slave transport"))
            }
        }
    }

    /// Close the transport.
    ///
    /// Graceful close stops accepting and reading, cancels transactions that
    /// were never polled, and lets each connection finish the transactions it
    /// already handed out. Forcible close drops every connection and cancels
    /// all outstanding transactions.
    pub fn close(&self, forcibly: bool) {
        tracing::debug!(local_addr = %self.shared.local_addr, forcibly, "closing slave transport");
        self.shared.stop.send_replace(true);
        if forcibly {
            self.shared.abort.send_replace(true);
        }
    }

    /// Wait until every connection has been closed.
    pub async fn wait(&self) {
        let mut closed = self.shared.closed.subscribe();
        let _ = closed.wait_for(|c| *c).await;
    }

    pub fn is_closed(&self) -> bool {
        *self.shared.closed.borrow()
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }
}

impl Drop for SlaveTransport {
    fn drop(&mut self) {
        self.close(true);
    }
}

async fn run(
    listener: TcpListener,
    config: SlaveConfig,
    shared: Arc<Shared>,
    queue: mpsc::UnboundedSender<Transaction>,
) {
    let (arrivals_tx, arrivals_rx) = mpsc::unbounded_channel();
    let permits = Arc::new(Semaphore::new(config.parallel));
    let dispatcher = tokio::spawn(dispatch(
        arrivals_rx,
        permits,
        queue,
        shared.stop.subscribe(),
        shared.abort.subscribe(),
    ));

    let transceiver_config = config.transceiver_config();
    let mut connections = JoinSet::new();
    let mut stop = shared.stop.subscribe();

    loop {
        // The select output is dropped before any await below.
        let accepted = tokio::select! {
            biased;
            _ = stop.wait_for(|s| *s) => break,
            Some(joined) = connections.join_next(), if !connections.is_empty() => {
                if let Err(e) = joined {
                    defect::report_join_error("slave connection", e);
                }
                continue;
            }
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                if config.max_connections.is_some_and(|max| connections.len() >= max) {
                    tracing::warn!(%peer, "connection limit reached, closing connection");
                    drop(stream);
                    continue;
                }
                tracing::debug!(%peer, "accepted connection");
                connections.spawn(serve(
                    open(stream, &transceiver_config),
                    arrivals_tx.clone(),
                    shared.stop.subscribe(),
                    shared.abort.subscribe(),
                ));
            }
            Err(e) => {
                tracing::warn!("accept failed: {}", e);
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }

    drop(listener);
    drop(arrivals_tx);
    if let Err(e) = dispatcher.await {
        defect::report_join_error("slave dispatcher", e);
    }

    // Nobody can poll any more: cancel what was never handed out.
    {
        let mut pending = shared.pending.lock().await;
        let mut cancelled = 0usize;
        while let Ok(transaction) = pending.try_recv() {
            if transaction.cancel() {
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            tracing::debug!(cancelled, "cancelled unpolled transactions");
        }
    }

    while let Some(joined) = connections.join_next().await {
        if let Err(e) = joined {
            defect::report_join_error("slave connection", e);
        }
    }
    tracing::debug!(local_addr = %shared.local_addr, "slave transport closed");
}

fn open(stream: TcpStream, config: &TransceiverConfig) -> Arc<Transceiver> {
    Arc::new(Transceiver::tcp(stream, ReceiveMode::Pull, config))
}

/// Serve one connection: read queries until closed, then drain.
async fn serve(
    transceiver: Arc<Transceiver>,
    arrivals: mpsc::UnboundedSender<Arrival>,
    mut stop: watch::Receiver<bool>,
    mut abort: watch::Receiver<bool>,
) {
    let peer = transceiver.peer_addr();
    let (in_flight, _) = watch::channel(0usize);
    let in_flight = Arc::new(in_flight);

    loop {
        let received = tokio::select! {
            biased;
            _ = stop.wait_for(|s| *s) => break,
            received = transceiver.frame_receive() => received,
        };
        let frame = match received {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                defect::report("slave connection", e.to_string());
                break;
            }
        };

        if !frame.is_modbus() || !is_valid_pdu_len(frame.payload_len()) {
            tracing::debug!(
                ?peer,
                transaction_id = frame.transaction_id(),
                protocol_id = frame.protocol_id(),
                length = frame.payload_len(),
                "dropping invalid request"
            );
            continue;
        }
        let query = match Query::from_payload(&frame.payload_bytes()) {
            Ok(query) => query,
            Err(_) => continue,
        };

        let arrival = Arrival {
            transaction_id: frame.transaction_id(),
            query,
            transceiver: Arc::clone(&transceiver),
            in_flight: InFlight::new(&in_flight),
        };
        if arrivals.send(arrival).is_err() {
            break;
        }
    }
    drop(arrivals);

    // Requests still arriving are read and discarded so the RX pipeline keeps
    // reaching the peer's end of stream.
    let mut outstanding = in_flight.subscribe();
    let finish = async {
        let _ = outstanding.wait_for(|n| *n == 0).await;
        transceiver.close(false);
        transceiver.wait().await;
    };
    tokio::pin!(finish);
    let mut reading = true;

    loop {
        tokio::select! {
            biased;
            _ = abort.wait_for(|a| *a) => {
                transceiver.close(true);
                return;
            }
            _ = &mut finish => break,
            received = transceiver.frame_receive(), if reading => match received {
                Ok(Some(frame)) => tracing::trace!(
                    ?peer,
                    transaction_id = frame.transaction_id(),
                    "discarding request received while closing"
                ),
                _ => reading = false,
            },
        }
    }
    tracing::debug!(?peer, "connection closed");
}

/// Turn arrivals into queued transactions, in order.
async fn dispatch(
    mut arrivals: mpsc::UnboundedReceiver<Arrival>,
    permits: Arc<Semaphore>,
    queue: mpsc::UnboundedSender<Transaction>,
    mut stop: watch::Receiver<bool>,
    abort: watch::Receiver<bool>,
) {
    loop {
        let arrival = tokio::select! {
            biased;
            _ = stop.wait_for(|s| *s) => break,
            arrival = arrivals.recv() => match arrival {
                Some(arrival) => arrival,
                None => break,
            },
        };

        let permit = tokio::select! {
            biased;
            _ = stop.wait_for(|s| *s) => break,
            permit = Arc::clone(&permits).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => {
                    defect::report("slave dispatcher", "permit semaphore closed");
                    break;
                }
            },
        };

        let Arrival {
            transaction_id,
            query,
            transceiver,
            in_flight,
        } = arrival;
        let (transaction, pending) = transaction(transaction_id, query);

        let state = Arc::clone(&pending.state);
        defect::spawn_supervised(
            "slave transaction",
            pending.run(transceiver, abort.clone(), permit, in_flight),
            move || {
                state.send_if_modified(|s| {
                    let unfinished = *s == TransactionState::Incomplete;
                    if unfinished {
                        *s = TransactionState::CompleteWithError;
                    }
                    unfinished
                });
            },
        );

        if queue.send(transaction).is_err() {
            break;
        }
    }
}
