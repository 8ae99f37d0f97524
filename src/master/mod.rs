//! Master (client) side of the transport.
//!
//! - [`MasterTransport`] - query orchestration, the public entry point
//! - [`MasterConfig`] - slave endpoint, timeouts and parallelism
//! - [`ConnectionState`] - lifecycle of the managed connection

mod config;
mod connection;
mod router;
mod transport;

pub use config::{
    MasterConfig, DEFAULT_ESTABLISH_TIMEOUT, DEFAULT_IDLE_TIMEOUT, DEFAULT_PORT,
    DEFAULT_RETRY_DELAY,
};
pub use connection::ConnectionState;
pub use transport::MasterTransport;
