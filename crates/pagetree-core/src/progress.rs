//! Progress channel: an optional callback invoked at phase boundaries.
//!
//! The contract is deliberately narrow: `(phase_name, message, fraction)`
//! with monotone phase names and no delivery guarantees beyond that. Callers
//! use it for UI updates; the pipeline never depends on it.

/// Callback invoked at phase boundaries.
pub type ProgressCallback = Box<dyn Fn(&str, &str, f32) + Send + Sync>;

/// Wrapper that makes reporting a no-op when no callback is installed.
#[derive(Default)]
pub struct ProgressReporter {
    callback: Option<ProgressCallback>,
}

impl std::fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("installed", &self.callback.is_some())
            .finish()
    }
}

impl ProgressReporter {
    pub fn new(callback: Option<ProgressCallback>) -> Self {
        Self { callback }
    }

    pub fn report(&self, phase: &str, message: &str, fraction: f32) {
        if let Some(cb) = &self.callback {
            cb(phase, message, fraction.clamp(0.0, 1.0));
        }
    }
}
