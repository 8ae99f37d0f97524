//! Inbound transactions awaiting a decision from the application.
//!
//! A [`Transaction`] is handed out by
//! [`SlaveTransport::poll`](super::SlaveTransport::poll). The application
//! decides once, with [`Transaction::answer`] or [`Transaction::ignore`]; a
//! background task owned by the transport carries the decision out and
//! publishes the final [`TransactionState`].

use std::fmt;
use std::sync::{Arc, Mutex};

use tokio::sync::{oneshot, watch, OwnedSemaphorePermit};

use super::transport::InFlight;
use crate::cancel::CancelToken;
use crate::error::{MbapError, Result};
use crate::protocol::{Answer, Frame, Query};
use crate::transceiver::Transceiver;

/// Outcome of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Not decided yet, or the decision is being carried out.
    Incomplete,
    /// The transport shut down before a decision took effect.
    Cancelled,
    /// Answered and transmitted, or ignored.
    Complete,
    /// Answered, but the response could not be transmitted.
    CompleteWithError,
}

impl TransactionState {
    #[inline]
    pub fn is_finished(self) -> bool {
        self != TransactionState::Incomplete
    }
}

/// The single decision a transaction accepts.
#[derive(Debug)]
pub(crate) enum Reply {
    Answer(Answer),
    Ignore,
    Cancel,
}

struct Inner {
    query: Query,
    state: Arc<watch::Sender<TransactionState>>,
    reply: Mutex<Option<oneshot::Sender<Reply>>>,
}

/// A query received by the slave.
///
/// Clones refer to the same transaction. Dropping every clone without a
/// decision counts as [`ignore`](Self::ignore).
#[derive(Clone)]
pub struct Transaction {
    inner: Arc<Inner>,
}

impl Transaction {
    /// The received query.
    pub fn query(&self) -> &Query {
        &self.inner.query
    }

    /// Current state.
    pub fn state(&self) -> TransactionState {
        *self.inner.state.borrow()
    }

    /// Wait until the transaction has finished and return its final state.
    pub async fn wait(&self) -> TransactionState {
        let mut state = self.inner.state.subscribe();
        // The sender lives in `self`.
        let result = state.wait_for(|s| s.is_finished()).await;
        result.map(|s| *s).unwrap_or(TransactionState::Cancelled)
    }

    /// [`wait`](Self::wait) with a cancellation input.
    pub async fn wait_cancellable(&self, cancel: &CancelToken) -> Result<TransactionState> {
        cancel.check()?;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(MbapError::Cancelled),
            state = self.wait() => Ok(state),
        }
    }

    /// Send `answer` to the master.
    ///
    /// Returns `false` if a decision was already made.
    pub fn answer(&self, answer: Answer) -> bool {
        self.decide(Reply::Answer(answer))
    }

    /// Complete without responding.
    ///
    /// Returns `false` if a decision was already made.
    pub fn ignore(&self) -> bool {
        self.decide(Reply::Ignore)
    }

    pub(crate) fn cancel(&self) -> bool {
        self.decide(Reply::Cancel)
    }

    fn decide(&self, reply: Reply) -> bool {
        let sender = self
            .inner
            .reply
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        match sender {
            // A send error means the transport already cancelled the task.
            Some(sender) => sender.send(reply).is_ok(),
            None => false,
        }
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("query", &self.inner.query)
            .field("state", &self.state())
            .finish()
    }
}

/// Transport-side half of a transaction.
pub(crate) struct Pending {
    pub(crate) transaction_id: u16,
    pub(crate) unit_id: u8,
    pub(crate) state: Arc<watch::Sender<TransactionState>>,
    reply: oneshot::Receiver<Reply>,
}

/// Create a transaction and the half that carries out its decision.
pub(crate) fn transaction(transaction_id: u16, query: Query) -> (Transaction, Pending) {
    let (state, _) = watch::channel(TransactionState::Incomplete);
    let state = Arc::new(state);
    let (reply_tx, reply_rx) = oneshot::channel();
    let unit_id = query.unit_id;

    let transaction = Transaction {
        inner: Arc::new(Inner {
            query,
            state: Arc::clone(&state),
            reply: Mutex::new(Some(reply_tx)),
        }),
    };
    let pending = Pending {
        transaction_id,
        unit_id,
        state,
        reply: reply_rx,
    };
    (transaction, pending)
}

impl Pending {
    /// Wait for the decision and carry it out.
    ///
    /// The permit and in-flight guard are released when this returns.
    pub(crate) async fn run(
        self,
        transceiver: Arc<Transceiver>,
        mut abort: watch::Receiver<bool>,
        _permit: OwnedSemaphorePermit,
        _in_flight: InFlight,
    ) {
        let Pending {
            transaction_id,
            unit_id,
            state,
            reply,
        } = self;

        let reply = tokio::select! {
            biased;
            _ = abort.wait_for(|aborted| *aborted) => Reply::Cancel,
            // All handles dropped without a decision.
            reply = reply => reply.unwrap_or(Reply::Ignore),
        };

        let outcome = match reply {
            Reply::Cancel => TransactionState::Cancelled,
            Reply::Ignore => TransactionState::Complete,
            Reply::Answer(answer) => {
                let sent = match Frame::modbus(transaction_id, answer.to_payload(unit_id)) {
                    Ok(frame) => transceiver.frame_transmit(frame).await,
                    Err(e) => Err(e),
                };
                match sent {
                    Ok(()) => TransactionState::Complete,
                    Err(e) => {
                        tracing::debug!(transaction_id, "answer not transmitted: {}", e);
                        TransactionState::CompleteWithError
                    }
                }
            }
        };
        tracing::trace!(transaction_id, ?outcome, "transaction finished");
        state.send_replace(outcome);
    }
}
