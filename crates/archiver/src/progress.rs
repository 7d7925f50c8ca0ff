//! Progress reporting shared between concurrently reporting stages.
//!
//! Stages (stream muxing, caption downloads) report fractions through a
//! [`ProgressSink`]. [`ConcurrentProgress`] serialises the render callback
//! behind a mutex so two reports never render at the same time. Ordering is
//! only guaranteed per reporting stage, not across stages.

use std::sync::Mutex;

/// Receiver of fractional progress values in `[0, 1]`.
pub trait ProgressSink: Send + Sync {
    /// Report the completed fraction of the current stage.
    fn report(&self, fraction: f64);
}

/// Clamp a raw fraction into `[0, 1]`; NaN reports as 0.
pub fn clamp_fraction(fraction: f64) -> f64 {
    if fraction.is_nan() {
        0.0
    } else {
        fraction.clamp(0.0, 1.0)
    }
}

/// Lock-guarded render callback.
///
/// The callback runs while the lock is held, which makes every render atomic
/// with respect to the others.
pub struct ConcurrentProgress<F> {
    handler: Mutex<F>,
}

impl<F> ConcurrentProgress<F>
where
    F: FnMut(f64) + Send,
{
    /// Wrap a render callback.
    pub fn new(handler: F) -> Self {
        Self {
            handler: Mutex::new(handler),
        }
    }
}

impl<F> ProgressSink for ConcurrentProgress<F>
where
    F: FnMut(f64) + Send,
{
    fn report(&self, fraction: f64) {
        // A panicking renderer must not silence every later report.
        let mut handler = self
            .handler
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        (*handler)(clamp_fraction(fraction));
    }
}

impl<F> std::fmt::Debug for ConcurrentProgress<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrentProgress").finish_non_exhaustive()
    }
}

/// Sink that drops every report.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn report(&self, _fraction: f64) {}
}
