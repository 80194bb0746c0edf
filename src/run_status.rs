use serde::Serialize;
use std::sync::{Arc, Mutex};

/// Shared progress of a batch run, cheap to clone into workers.
#[derive(Clone, Default)]
pub struct RunStatus {
    inner: Arc<Mutex<RunStatusData>>,
}

#[derive(Default)]
struct RunStatusData {
    phase: String,
    total: usize,
    completed: usize,
    failed: usize,
    skipped: usize,
    last_error: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RunStatusSnapshot {
    pub phase: String,
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub last_error: Option<String>,
}

impl RunStatus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(RunStatusData {
                phase: "Initializing".to_string(),
                ..Default::default()
            })),
        }
    }

    pub fn set_phase<S: Into<String>>(&self, phase: S) {
        if let Ok(mut data) = self.inner.lock() {
            data.phase = phase.into();
        }
    }

    /// Starts a new unit count; the previous counters are cleared.
    pub fn start(&self, phase: impl Into<String>, total: usize) {
        if let Ok(mut data) = self.inner.lock() {
            data.phase = phase.into();
            data.total = total;
            data.completed = 0;
            data.failed = 0;
            data.skipped = 0;
        }
    }

    pub fn record_completed(&self) {
        if let Ok(mut data) = self.inner.lock() {
            data.completed += 1;
        }
    }

    pub fn record_failed<S: Into<String>>(&self, error: S) {
        if let Ok(mut data) = self.inner.lock() {
            data.failed += 1;
            data.last_error = Some(error.into());
        }
    }

    pub fn record_skipped<S: Into<String>>(&self, reason: S) {
        if let Ok(mut data) = self.inner.lock() {
            data.skipped += 1;
            data.last_error = Some(reason.into());
        }
    }

    pub fn snapshot(&self) -> RunStatusSnapshot {
        if let Ok(data) = self.inner.lock() {
            RunStatusSnapshot {
                phase: data.phase.clone(),
                total: data.total,
                completed: data.completed,
                failed: data.failed,
                skipped: data.skipped,
                last_error: data.last_error.clone(),
            }
        } else {
            RunStatusSnapshot {
                phase: "Status unavailable".to_string(),
                total: 0,
                completed: 0,
                failed: 0,
                skipped: 0,
                last_error: None,
            }
        }
    }
}
