pub mod attachment;
pub mod audit;
pub mod schema;

/// Receives the outcome of real store traffic so health metrics reflect more
/// than synthetic probes.
pub trait OperationObserver: Send + Sync {
    fn record_success(&self, response_time_ms: Option<u64>);
    fn record_failure(&self);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl OperationObserver for NoopObserver {
    fn record_success(&self, _response_time_ms: Option<u64>) {}

    fn record_failure(&self) {}
}
