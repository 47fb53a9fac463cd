//! Cooperative per-job stop signals.
//!
//! A stop request is a flag with the time it was first raised. Stages poll it
//! between files, between components and between stages; the LLM queue also
//! waits on it so a caller queued behind a long lane can give up its turn.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    inner: Arc<SignalInner>,
}

#[derive(Debug, Default)]
struct SignalInner {
    token: CancellationToken,
    requested_at: OnceLock<DateTime<Utc>>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raises the flag. Only the first call records a timestamp; returns
    /// whether this call was that first one.
    pub fn request_stop(&self) -> bool {
        let first = self.inner.requested_at.set(Utc::now()).is_ok();
        self.inner.token.cancel();
        first
    }

    pub fn is_stop_requested(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    pub fn requested_at(&self) -> Option<DateTime<Utc>> {
        self.inner.requested_at.get().copied()
    }

    /// Check point: `Err(Cancelled)` once a stop was requested.
    pub fn check(&self) -> Result<()> {
        if self.is_stop_requested() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolves when a stop is requested.
    pub async fn stopped(&self) {
        self.inner.token.cancelled().await
    }

    pub fn token(&self) -> &CancellationToken {
        &self.inner.token
    }
}

/// Registry of stop signals for the jobs this process is driving.
#[derive(Debug, Default)]
pub struct CancellationController {
    signals: Mutex<HashMap<Uuid, StopSignal>>,
}

impl CancellationController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the job's signal, creating it on first use.
    pub fn register(&self, job_id: Uuid) -> StopSignal {
        let mut signals = self.signals.lock().unwrap_or_else(|e| e.into_inner());
        signals.entry(job_id).or_default().clone()
    }

    pub fn get(&self, job_id: Uuid) -> Option<StopSignal> {
        let signals = self.signals.lock().unwrap_or_else(|e| e.into_inner());
        signals.get(&job_id).cloned()
    }

    /// Idempotent. Returns `false` when the job has no live signal.
    pub fn request_stop(&self, job_id: Uuid) -> bool {
        match self.get(job_id) {
            Some(signal) => {
                signal.request_stop();
                true
            }
            None => false,
        }
    }

    pub fn is_stop_requested(&self, job_id: Uuid) -> bool {
        self.get(job_id).is_some_and(|s| s.is_stop_requested())
    }

    pub fn release(&self, job_id: Uuid) {
        let mut signals = self.signals.lock().unwrap_or_else(|e| e.into_inner());
        signals.remove(&job_id);
    }
}
