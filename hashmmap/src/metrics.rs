/// Receives the store's statistics after each mutation.
///
/// Mirrors a counter/gauge/histogram facility kept elsewhere, possibly in shared memory of its own.
/// All methods default to doing nothing.
pub trait Metrics: Send {
    /// Add to a monotonic counter.
    fn counter(&mut self, _name: &'static str, _increment: u64) {}

    /// Set a gauge to its current value.
    fn gauge(&mut self, _name: &'static str, _value: u64) {}

    /// Record one sample of a distribution.
    fn histogram(&mut self, _name: &'static str, _sample: u64) {}
}

/// Discards everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoMetrics;

impl Metrics for NoMetrics {}
