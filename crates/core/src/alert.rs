use std::sync::{Arc, Mutex};
use tracing::error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alert {
    pub consecutive_failures: u32,
    pub last_error: String,
}

/// Told when a run of failed cycles crosses the configured threshold.
pub trait Alerter: Send + Sync {
    fn alert(&self, alert: &Alert);
}

/// Default sink: one `error!` event.
pub struct LogAlerter;

impl Alerter for LogAlerter {
    fn alert(&self, alert: &Alert) {
        error!(
            failures = alert.consecutive_failures,
            last_error = %alert.last_error,
            "sync keeps failing"
        );
    }
}

/// Remembers every alert; used to observe the orchestrator.
#[derive(Clone, Default)]
pub struct RecordingAlerter {
    seen: Arc<Mutex<Vec<Alert>>>,
}

impl RecordingAlerter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.seen.lock().map(|v| v.clone()).unwrap_or_default()
    }
}

impl Alerter for RecordingAlerter {
    fn alert(&self, alert: &Alert) {
        if let Ok(mut seen) = self.seen.lock() {
            seen.push(alert.clone());
        }
    }
}
