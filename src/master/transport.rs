//! Master transport: query orchestration over the managed connection.

use serde_json::Value;
use tokio::sync::watch;

use super::config::MasterConfig;
use super::connection::{ConnectionManager, ConnectionState};
use crate::cancel::CancelToken;
use crate::error::{MbapError, Result};
use crate::protocol::{Answer, Frame, Query};

/// Client side of the transport.
///
/// Queries from many tasks share one connection; each gets its own
/// transaction id, so responses may arrive in any order.
///
/// Dropping the transport closes it forcibly.
pub struct MasterTransport {
    manager: ConnectionManager,
}

impl MasterTransport {
    /// Validate `config` and start the connection driver.
    ///
    /// No connection is attempted until the first query.
    pub fn new(config: MasterConfig) -> Result<Self> {
        config.validate()?;
        tracing::debug!(host = %config.host, port = config.port, "starting master transport");
        Ok(Self {
            manager: ConnectionManager::spawn(config),
        })
    }

    /// Build from a JSON configuration dictionary.
    pub fn from_json(value: &Value) -> Result<Self> {
        Self::new(MasterConfig::from_json(value)?)
    }

    /// Send `query` and wait for its answer.
    ///
    /// With `no_answer`, returns `Ok(None)` as soon as the request is queued
    /// for transmission.
    pub async fn query(&self, query: &Query, no_answer: bool) -> Result<Option<Answer>> {
        self.exchange(query, no_answer, None).await
    }

    /// [`query`](Self::query) with a cancellation input.
    pub async fn query_cancellable(
        &self,
        query: &Query,
        no_answer: bool,
        cancel: &CancelToken,
    ) -> Result<Option<Answer>> {
        self.exchange(query, no_answer, Some(cancel)).await
    }

    async fn exchange(
        &self,
        query: &Query,
        no_answer: bool,
        cancel: Option<&CancelToken>,
    ) -> Result<Option<Answer>> {
        if self.manager.state().is_shutting_down() {
            return Err(MbapError::closed("master transport"));
        }

        // A connection that ends while we wait for an id is replaced.
        let (connection, lease) = loop {
            let connection = self
                .manager
                .get(cancel)
                .await?
                .ok_or_else(|| MbapError::closed("master transport"))?;

            let lease = tokio::select! {
                biased;
                _ = crate::cancel::cancelled(cancel) => return Err(MbapError::Cancelled),
                _ = connection.transceiver.ended() => continue,
                lease = connection.allocator.acquire() => lease?,
            };
            break (connection, lease);
        };

        let transaction_id = lease.id();
        let request = Frame::modbus(transaction_id, query.to_payload())?;
        // Declared after the lease so it is unregistered before the id is freed.
        let mut matcher = if no_answer {
            None
        } else {
            Some(connection.router.register(transaction_id)?)
        };

        connection.transceiver.transmit(request, cancel).await?;
        tracing::trace!(transaction_id, unit_id = query.unit_id, "query sent");

        let Some(matcher) = matcher.as_mut() else {
            return Ok(None);
        };

        let response = tokio::select! {
            biased;
            response = matcher.response() => response,
            _ = crate::cancel::cancelled(cancel) => return Err(MbapError::Cancelled),
            _ = connection.transceiver.ended() => None,
        };
        let response =
            response.ok_or_else(|| MbapError::Communication("no response".to_string()))?;

        let (unit_id, answer) = Answer::from_payload(&response.payload_bytes())?;
        if unit_id != query.unit_id {
            return Err(MbapError::Communication(
                "mismatched unit identifier".to_string(),
            ));
        }
        Ok(Some(answer))
    }

    /// Close the transport.
    ///
    /// Graceful close stops reconnecting and lets the current connection
    /// drain; forcible close drops it at once, failing in-flight queries.
    pub fn close(&self, forcibly: bool) {
        self.manager.close(forcibly);
    }

    /// Wait until the transport is closed.
    pub async fn wait(&self) {
        self.manager.wait().await;
    }

    pub fn is_closed(&self) -> bool {
        self.manager.state() == ConnectionState::Closed
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.manager.state()
    }

    /// Observe connection state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.manager.subscribe_state()
    }
}

impl Drop for MasterTransport {
    fn drop(&mut self) {
        self.manager.close(true);
    }
}
