//! Reconnecting connection manager.
//!
//! One driver task owns the connection lifecycle:
//!
//! ```text
//!            demand                 connected
//! Disconnected ───► Connecting ─────────────► Connected
//!      ▲               │ failed                  │ transceiver ended
//!      │               ▼                         │
//!      └──────────── Retry ◄─────────────────────┘ (back to Disconnected)
//!
//! any state ──close──► Closing ──► Closed
//! ```
//!
//! Callers never touch the socket directly. They call
//! [`ConnectionManager::get`], which registers demand while it waits, so a
//! connection is only attempted while somebody needs one.

use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::sync::watch;

use super::config::MasterConfig;
use super::router::ResponseRouter;
use crate::allocator::BoundedIdAllocator;
use crate::cancel::CancelToken;
use crate::defect;
use crate::error::{MbapError, Result};
use crate::transceiver::{ReceiveMode, Transceiver};

/// Lifecycle state of the master connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection and no attempt in progress.
    Disconnected,
    /// A connect attempt is in progress.
    Connecting,
    /// A connection is established and published.
    Connected,
    /// The last attempt failed; waiting before the next one.
    Retry,
    /// Graceful close in progress; the connection drains.
    Closing,
    /// Terminal.
    Closed,
}

impl ConnectionState {
    /// Check whether the manager no longer hands out connections.
    pub fn is_shutting_down(self) -> bool {
        matches!(self, ConnectionState::Closing | ConnectionState::Closed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseRequest {
    None,
    Graceful,
    Forcible,
}

/// One live socket with its transaction id space and response table.
#[derive(Debug)]
pub(crate) struct Connection {
    pub(crate) transceiver: Transceiver,
    pub(crate) allocator: Arc<BoundedIdAllocator>,
    pub(crate) router: ResponseRouter,
}

impl Connection {
    fn open(stream: TcpStream, config: &MasterConfig) -> Result<Self> {
        let allocator = Arc::new(BoundedIdAllocator::new(config.parallel)?);
        let router = ResponseRouter::new();
        let transceiver = Transceiver::tcp(
            stream,
            ReceiveMode::Push(Box::new(router.clone())),
            &config.transceiver_config(),
        );
        Ok(Self {
            transceiver,
            allocator,
            router,
        })
    }
}

struct Shared {
    config: MasterConfig,
    state: watch::Sender<ConnectionState>,
    active: watch::Sender<Option<Arc<Connection>>>,
    /// Number of callers currently waiting in `get`.
    wanted: watch::Sender<usize>,
    close: watch::Sender<CloseRequest>,
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!(
                host = %self.config.host,
                port = self.config.port,
                "connection {:?} -> {:?}",
                previous,
                state
            );
        }
    }
}

/// Demand registered by a waiting `get` call.
struct DemandGuard<'a> {
    shared: &'a Shared,
}

impl<'a> DemandGuard<'a> {
    fn new(shared: &'a Shared) -> Self {
        shared.wanted.send_modify(|wanted| *wanted += 1);
        Self { shared }
    }
}

impl Drop for DemandGuard<'_> {
    fn drop(&mut self) {
        self.shared.wanted.send_modify(|wanted| *wanted -= 1);
    }
}

/// Handle to the connection driver.
pub(crate) struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    /// Start the driver task. Must be called within a tokio runtime.
    pub(crate) fn spawn(config: MasterConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (active, _) = watch::channel(None);
        let (wanted, _) = watch::channel(0);
        let (close, _) = watch::channel(CloseRequest::None);
        let shared = Arc::new(Shared {
            config,
            state,
            active,
            wanted,
            close,
        });

        let on_exit = Arc::clone(&shared);
        defect::spawn_supervised("connection driver", drive(Arc::clone(&shared)), move || {
            on_exit.close.send_replace(CloseRequest::Forcible);
            if let Some(connection) = on_exit.active.send_replace(None) {
                connection.transceiver.close(true);
            }
            on_exit.set_state(ConnectionState::Closed);
        });

        Self { shared }
    }

    /// Get the active connection, waiting for one if necessary.
    ///
    /// Returns `None` once the manager is closing or closed.
    pub(crate) async fn get(&self, cancel: Option<&CancelToken>) -> Result<Option<Arc<Connection>>> {
        if let Some(token) = cancel {
            token.check()?;
        }

        let mut active = self.shared.active.subscribe();
        let mut close = self.shared.close.subscribe();
        let mut demand = None;

        loop {
            if *close.borrow_and_update() != CloseRequest::None {
                return Ok(None);
            }
            let current = active.borrow_and_update().clone();
            if let Some(connection) = current {
                if !connection.transceiver.is_ended() {
                    return Ok(Some(connection));
                }
            }
            if demand.is_none() {
                demand = Some(DemandGuard::new(&self.shared));
            }

            tokio::select! {
                biased;
                _ = crate::cancel::cancelled(cancel) => return Err(MbapError::Cancelled),
                _ = close.changed() => {}
                _ = active.changed() => {}
            }
        }
    }

    /// Request closing. A forcible request overrides a pending graceful one.
    pub(crate) fn close(&self, forcibly: bool) {
        self.shared.close.send_modify(|request| {
            *request = match (*request, forcibly) {
                (_, true) => CloseRequest::Forcible,
                (CloseRequest::None, false) => CloseRequest::Graceful,
                (current, false) => current,
            };
        });
    }

    pub(crate) async fn wait(&self) {
        let mut state = self.shared.state.subscribe();
        let _ = state.wait_for(|s| *s == ConnectionState::Closed).await;
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub(crate) fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }
}

async fn connect(config: &MasterConfig) -> Result<TcpStream> {
    let address = (config.host.as_str(), config.port);
    match tokio::time::timeout(config.establish_timeout, TcpStream::connect(address)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(MbapError::Io(e)),
        Err(_) => Err(MbapError::Communication(format!(
            "connect to {}:{} timed out after {:?}",
            config.host, config.port, config.establish_timeout
        ))),
    }
}

async fn drive(shared: Arc<Shared>) {
    let config = &shared.config;
    let mut wanted = shared.wanted.subscribe();
    let mut close = shared.close.subscribe();

    'driver: loop {
        shared.set_state(ConnectionState::Disconnected);
        tokio::select! {
            biased;
            _ = close.wait_for(|c| *c != CloseRequest::None) => break 'driver,
            _ = wanted.wait_for(|w| *w > 0) => {}
        }

        shared.set_state(ConnectionState::Connecting);
        let attempt = tokio::select! {
            biased;
            _ = close.wait_for(|c| *c != CloseRequest::None) => break 'driver,
            attempt = connect(config) => attempt.and_then(|stream| Connection::open(stream, config)),
        };

        let connection = match attempt {
            Ok(connection) => Arc::new(connection),
            Err(e) => {
                tracing::warn!(
                    host = %config.host,
                    port = config.port,
                    "connect failed, retrying in {:?}: {}",
                    config.retry_delay,
                    e
                );
                shared.set_state(ConnectionState::Retry);
                tokio::select! {
                    biased;
                    _ = close.wait_for(|c| *c != CloseRequest::None) => break 'driver,
                    _ = tokio::time::sleep(config.retry_delay) => continue 'driver,
                }
            }
        };

        tracing::debug!(peer = ?connection.transceiver.peer_addr(), "connected");
        shared.active.send_replace(Some(Arc::clone(&connection)));
        shared.set_state(ConnectionState::Connected);

        let request = tokio::select! {
            biased;
            request = close.wait_for(|c| *c != CloseRequest::None) => request.map(|r| *r).ok(),
            _ = connection.transceiver.ended() => None,
        };

        match request {
            None => {
                tracing::debug!(peer = ?connection.transceiver.peer_addr(), "connection ended");
                shared.active.send_replace(None);
                connection.transceiver.close(true);
            }
            Some(CloseRequest::Graceful) => {
                shared.set_state(ConnectionState::Closing);
                connection.transceiver.close(false);
                tokio::select! {
                    biased;
                    _ = close.wait_for(|c| *c == CloseRequest::Forcible) => connection.transceiver.close(true),
                    _ = connection.transceiver.wait() => {}
                }
                break 'driver;
            }
            Some(_) => {
                connection.transceiver.close(true);
                break 'driver;
            }
        }
    }
    // The supervisor publishes Closed once this task is gone.
}
