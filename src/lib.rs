//! # mbap-transport
//!
//! TCP transport layer for Modbus-style request/response protocols.
//!
//! Every message on the wire is a frame with a 6-byte header (transaction id,
//! protocol id, payload length, all big-endian) followed by the payload.
//! The crate owns everything between the byte stream and the protocol data
//! units: framing, connection management, request/response correlation and
//! bounded concurrency. Function codes and register data are never
//! interpreted.
//!
//! ## Architecture
//!
//! - **Master**: [`MasterTransport`] keeps one connection to a slave alive,
//!   reconnecting on demand, and correlates concurrent queries by
//!   transaction id.
//! - **Slave**: [`SlaveTransport`] accepts connections and turns inbound
//!   queries into one globally ordered queue of [`Transaction`]s.
//! - **Transceiver**: [`Transceiver`] is the per-connection framing engine
//!   both sides build on.
//!
//! ## Example
//!
//! ```ignore
//! use mbap_transport::{Answer, MasterConfig, MasterTransport, Query, SlaveConfig, SlaveTransport};
//!
//! #[tokio::main]
//! async fn main() -> mbap_transport::Result<()> {
//!     let slave = SlaveTransport::bind(SlaveConfig::new().with_address("127.0.0.1").with_port(0)).await?;
//!     let master = MasterTransport::new(
//!         MasterConfig::new("127.0.0.1").with_port(slave.local_addr().port()),
//!     )?;
//!
//!     tokio::spawn(async move {
//!         while let Ok(transaction) = slave.poll().await {
//!             transaction.answer(Answer::new(0x03, vec![0x02, 0x00, 0x2A]));
//!         }
//!     });
//!
//!     let answer = master.query(&Query::new(1, 0x03, vec![0, 0, 0, 1]), false).await?;
//!     println!("{:?}", answer);
//!     Ok(())
//! }
//! ```

pub mod allocator;
pub mod cancel;
pub mod defect;
pub mod error;
pub mod master;
pub mod protocol;
pub mod slave;
pub mod transceiver;

mod config;

pub use cancel::CancelToken;
pub use defect::{set_defect_reporter, DefectReporter, TracingReporter};
pub use error::{ErrorKind, MbapError, Result};
pub use master::{ConnectionState, MasterConfig, MasterTransport};
pub use protocol::{Answer, Frame, Query};
pub use slave::{SlaveConfig, SlaveTransport, Transaction, TransactionState};
pub use transceiver::{FrameHandler, ReceiveMode, Transceiver, TransceiverConfig};
