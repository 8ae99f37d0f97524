//! Cancellation input for blocking operations.
//!
//! A [`CancelToken`] is a level-triggered flag: once cancelled it stays
//! cancelled, and every current or future [`CancelToken::cancelled`] wait
//! resolves immediately. Clones share the same flag.
//!
//! # Example
//!
//! ```ignore
//! let cancel = CancelToken::new();
//! let waiter = cancel.clone();
//! tokio::spawn(async move { transport.poll_cancellable(&waiter).await });
//! cancel.cancel(); // the poll returns MbapError::Cancelled
//! ```

use std::sync::Arc;

use tokio::sync::watch;

use crate::error::{MbapError, Result};

/// Shared cancellation flag.
#[derive(Debug, Clone)]
pub struct CancelToken {
    flag: Arc<watch::Sender<bool>>,
}

impl CancelToken {
    /// Create a token that is not cancelled.
    pub fn new() -> Self {
        let (flag, _) = watch::channel(false);
        Self {
            flag: Arc::new(flag),
        }
    }

    /// Fire the cancellation. Idempotent.
    pub fn cancel(&self) {
        self.flag.send_replace(true);
    }

    /// Check whether the token has been cancelled.
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        *self.flag.borrow()
    }

    /// Wait until the token is cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.flag.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }

    /// Fail fast with [`MbapError::Cancelled`] if already cancelled.
    pub(crate) fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(MbapError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Wait on an optional token; without one, never resolve.
pub(crate) async fn cancelled(cancel: Option<&CancelToken>) {
    match cancel {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}
