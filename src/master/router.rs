//! Response routing for one master connection.
//!
//! Each in-flight query registers a [`ResponseMatcher`] under its transaction
//! id. The router is the connection's push-mode [`FrameHandler`]: every
//! received frame is looked up by transaction id and handed to the matching
//! oneshot. When the connection ends, all pending matchers are released and
//! observe `None`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::oneshot;

use crate::error::{MbapError, Result};
use crate::protocol::Frame;
use crate::transceiver::FrameHandler;

type Pending = HashMap<u16, oneshot::Sender<Frame>>;

/// Transaction-id keyed table of waiting queries.
#[derive(Debug, Clone, Default)]
pub(crate) struct ResponseRouter {
    pending: Arc<Mutex<Pending>>,
}

impl ResponseRouter {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Register interest in the response carrying `transaction_id`.
    pub(crate) fn register(&self, transaction_id: u16) -> Result<ResponseMatcher> {
        let (tx, rx) = oneshot::channel();
        let mut pending = self.lock();
        if pending.contains_key(&transaction_id) {
            return Err(MbapError::Bug(format!(
                "transaction identifier {} registered twice",
                transaction_id
            )));
        }
        pending.insert(transaction_id, tx);
        Ok(ResponseMatcher {
            router: self.clone(),
            transaction_id,
            response: rx,
        })
    }

    /// Number of registered matchers.
    pub(crate) fn pending_count(&self) -> usize {
        self.lock().len()
    }

    fn dispatch(&self, frame: Frame) {
        if !frame.is_modbus() {
            tracing::debug!(
                transaction_id = frame.transaction_id(),
                protocol_id = frame.protocol_id(),
                "discarding response with foreign protocol"
            );
            return;
        }

        let waiter = self.lock().remove(&frame.transaction_id());
        match waiter {
            Some(waiter) => {
                // The query may have been cancelled in the meantime.
                let _ = waiter.send(frame);
            }
            None => tracing::debug!(
                transaction_id = frame.transaction_id(),
                "discarding unsolicited response"
            ),
        }
    }
}

impl FrameHandler for ResponseRouter {
    fn on_frame(&mut self, frame: Frame) {
        self.dispatch(frame);
    }

    fn on_end(&mut self) {
        self.lock().clear();
    }
}

/// A registered wait for one response. Unregisters itself on drop.
#[derive(Debug)]
pub(crate) struct ResponseMatcher {
    router: ResponseRouter,
    transaction_id: u16,
    response: oneshot::Receiver<Frame>,
}

impl ResponseMatcher {
    /// Wait for the response; `None` if the connection ended first.
    pub(crate) async fn response(&mut self) -> Option<Frame> {
        (&mut self.response).await.ok()
    }
}

impl Drop for ResponseMatcher {
    fn drop(&mut self) {
        self.router.lock().remove(&self.transaction_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn response(tid: u16) -> Frame {
        Frame::modbus(tid, Bytes::from_static(&[0x01, 0x03, 0x02, 0x00, 0x2A])).unwrap()
    }

    #[tokio::test]
    async fn test_routes_by_transaction_id() {
        let mut router = ResponseRouter::new();
        let mut first = router.register(1).unwrap();
        let mut second = router.register(2).unwrap();

        router.on_frame(response(2));
        router.on_frame(response(1));

        assert_eq!(first.response().await.unwrap().transaction_id(), 1);
        assert_eq!(second.response().await.unwrap().transaction_id(), 2);
    }

    #[test]
    fn test_duplicate_registration_is_bug() {
        let router = ResponseRouter::new();
        let _held = router.register(9).unwrap();
        let err = router.register(9).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Bug);
    }

    #[test]
    fn test_matcher_drop_unregisters() {
        let router = ResponseRouter::new();
        {
            let _matcher = router.register(3).unwrap();
            assert_eq!(router.pending_count(), 1);
        }
        assert_eq!(router.pending_count(), 0);
        assert!(router.register(3).is_ok());
    }

    #[tokio::test]
    async fn test_unsolicited_and_foreign_frames_discarded() {
        let mut router = ResponseRouter::new();
        let mut matcher = router.register(4).unwrap();

        router.on_frame(response(99));
        router.on_frame(Frame::new(4, 7, Bytes::from_static(&[1, 2, 3])).unwrap());
        assert_eq!(router.pending_count(), 1);

        router.on_frame(response(4));
        assert_eq!(matcher.response().await.unwrap().protocol_id(), 0);
    }

    #[tokio::test]
    async fn test_end_releases_waiters() {
        let mut router = ResponseRouter::new();
        let mut matcher = router.register(5).unwrap();
        router.on_end();
        assert!(matcher.response().await.is_none());
    }
}
