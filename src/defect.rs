//! Defect reporting for background tasks.
//!
//! Pipelines, drivers and acceptors run detached from any caller, so an
//! invariant violation inside them has nobody to return an error to. They hand
//! it to the process-wide [`DefectReporter`] instead and keep going (or let the
//! offending task end). The default reporter logs through `tracing`.

use std::future::Future;
use std::sync::{Arc, OnceLock};

/// Sink for invariant violations detected in background tasks.
pub trait DefectReporter: Send + Sync + 'static {
    /// Report a defect. `origin` names the component that detected it.
    fn report(&self, origin: &'static str, detail: &str);
}

/// Reporter that logs defects at `error` level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl DefectReporter for TracingReporter {
    fn report(&self, origin: &'static str, detail: &str) {
        tracing::error!(origin, "defect: {}", detail);
    }
}

static REPORTER: OnceLock<Arc<dyn DefectReporter>> = OnceLock::new();

/// Install the process-wide defect reporter.
///
/// Only the first call takes effect; returns `false` if a reporter was
/// already installed. Until then defects go to [`TracingReporter`].
pub fn set_defect_reporter(reporter: Arc<dyn DefectReporter>) -> bool {
    REPORTER.set(reporter).is_ok()
}

pub(crate) fn report(origin: &'static str, detail: impl AsRef<str>) {
    match REPORTER.get() {
        Some(reporter) => reporter.report(origin, detail.as_ref()),
        None => TracingReporter.report(origin, detail.as_ref()),
    }
}

/// Report a failed join of a background task, ignoring plain cancellation.
pub(crate) fn report_join_error(origin: &'static str, err: tokio::task::JoinError) {
    if err.is_panic() {
        report(origin, format!("background task panicked: {}", err));
    }
}

/// Spawn a background task and run `on_exit` once it is gone, whether it
/// returned or panicked. A panic is reported as a defect and absorbed.
pub(crate) fn spawn_supervised<F, E>(origin: &'static str, task: F, on_exit: E)
where
    F: Future<Output = ()> + Send + 'static,
    E: FnOnce() + Send + 'static,
{
    let handle = tokio::spawn(task);
    tokio::spawn(async move {
        if let Err(e) = handle.await {
            report_join_error(origin, e);
        }
        on_exit();
    });
}
