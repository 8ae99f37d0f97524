//! Slave (server) side of the transport.
//!
//! - [`SlaveTransport`] - accepts connections and queues inbound transactions
//! - [`Transaction`] - one received query awaiting answer or ignore
//! - [`SlaveConfig`] - listening socket, limits and timeouts

mod config;
mod listener;
mod transaction;
mod transport;

pub use config::{
    SlaveConfig, DEFAULT_BIND_ADDRESS, DEFAULT_BIND_PORT, DEFAULT_IDLE_TIMEOUT, DEFAULT_PARALLEL,
};
pub use transaction::{Transaction, TransactionState};
pub use transport::SlaveTransport;
