//! Process-wide LLM lanes.
//!
//! One lane exists per credential and is shared by every job that submits
//! with that credential. A lane admits one call at a time; waiters are served
//! in arrival order because `tokio::sync::Mutex` hands out the lock FIFO. With
//! N distinct credentials at most N calls are in flight across the process.
//!
//! A lane no job holds is dropped, with its credential, the next time lanes
//! are resolved.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use super::{Credential, LlmAdapter, LlmError, LlmProvider, Prompt, QueueLimits};
use crate::cancel::StopSignal;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AnalysisError {
    #[error("analysis failed: {0}")]
    Failed(#[from] LlmError),

    #[error("analysis timed out after {}ms", elapsed.as_millis())]
    Timeout { elapsed: Duration },

    #[error("analysis cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuePhase {
    /// Waiting for the lane; `ahead` units were queued or running before it.
    Queued { ahead: usize },
    Dispatched,
    Completed,
    /// Given up before dispatch because the job was stopped.
    Dropped,
}

/// Receives queue transitions for one submitted unit.
#[async_trait]
pub trait QueueObserver: Send + Sync {
    async fn on_phase(&self, lane: usize, phase: QueuePhase);
}

pub struct NoopObserver;

#[async_trait]
impl QueueObserver for NoopObserver {
    async fn on_phase(&self, _lane: usize, _phase: QueuePhase) {}
}

struct Lane {
    id: usize,
    adapter: Arc<dyn LlmAdapter>,
    /// Held for the whole call; stores the last dispatch instant.
    turn: tokio::sync::Mutex<Option<Instant>>,
    pending: AtomicUsize,
}

struct PendingGuard<'a>(&'a AtomicUsize);

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// The lanes one job may use, in credential order.
#[derive(Clone)]
pub struct LaneSet {
    lanes: Vec<Arc<Lane>>,
}

impl LaneSet {
    pub fn len(&self) -> usize {
        self.lanes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lanes.is_empty()
    }

    pub fn ids(&self) -> Vec<usize> {
        self.lanes.iter().map(|l| l.id).collect()
    }

    /// Lane at `hint` (wrapping), else the one with the fewest waiting units.
    fn pick(&self, hint: Option<usize>) -> Option<&Arc<Lane>> {
        match hint {
            Some(index) if !self.lanes.is_empty() => self.lanes.get(index % self.lanes.len()),
            _ => self
                .lanes
                .iter()
                .min_by_key(|lane| lane.pending.load(Ordering::SeqCst)),
        }
    }
}

pub struct LlmQueue {
    provider: Arc<dyn LlmProvider>,
    limits: QueueLimits,
    lanes: Mutex<HashMap<Credential, Arc<Lane>>>,
    next_id: AtomicUsize,
}

impl LlmQueue {
    pub fn new(provider: Arc<dyn LlmProvider>, limits: QueueLimits) -> Self {
        Self {
            provider,
            limits,
            lanes: Mutex::new(HashMap::new()),
            next_id: AtomicUsize::new(0),
        }
    }

    /// Resolves credentials to their process-wide lanes, creating missing ones
    /// and dropping lanes no [`LaneSet`] refers to any more.
    pub fn lanes_for(&self, credentials: &[Credential]) -> LaneSet {
        let mut lanes = self.lanes.lock().unwrap_or_else(|e| e.into_inner());
        // The map holds the only reference to an idle lane.
        lanes.retain(|_, lane| {
            let live = Arc::strong_count(lane) > 1;
            if !live {
                debug!(lane = lane.id, "idle lane dropped");
            }
            live
        });

        let mut selected: Vec<Arc<Lane>> = Vec::with_capacity(credentials.len());
        for credential in credentials {
            let lane = lanes
                .entry(credential.clone())
                .or_insert_with(|| {
                    let id = self.next_id.fetch_add(1, Ordering::SeqCst);
                    debug!(lane = id, provider = self.provider.name(), "lane opened");
                    Arc::new(Lane {
                        id,
                        adapter: self.provider.connect(credential),
                        turn: tokio::sync::Mutex::new(None),
                        pending: AtomicUsize::new(0),
                    })
                })
                .clone();
            if !selected.iter().any(|l| l.id == lane.id) {
                selected.push(lane);
            }
        }
        LaneSet { lanes: selected }
    }

    pub fn lane_count(&self) -> usize {
        self.lanes.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Waits for a turn on a lane and runs one provider call on it.
    ///
    /// A stop observed while waiting drops the unit without dispatching it. A
    /// stop during the call abandons it and the result is discarded.
    #[instrument(skip_all, fields(model = %prompt.model))]
    pub async fn submit(
        &self,
        lanes: &LaneSet,
        hint: Option<usize>,
        prompt: &Prompt,
        signal: &StopSignal,
        observer: &dyn QueueObserver,
    ) -> Result<String, AnalysisError> {
        let lane = lanes
            .pick(hint)
            .ok_or_else(|| AnalysisError::Failed(LlmError::Provider("no LLM lane available".into())))?;

        let ahead = lane.pending.fetch_add(1, Ordering::SeqCst);
        let _pending = PendingGuard(&lane.pending);
        observer.on_phase(lane.id, QueuePhase::Queued { ahead }).await;

        if signal.is_stop_requested() {
            observer.on_phase(lane.id, QueuePhase::Dropped).await;
            return Err(AnalysisError::Cancelled);
        }

        let mut turn = tokio::select! {
            turn = lane.turn.lock() => turn,
            _ = signal.stopped() => {
                observer.on_phase(lane.id, QueuePhase::Dropped).await;
                return Err(AnalysisError::Cancelled);
            }
        };
        if signal.is_stop_requested() {
            observer.on_phase(lane.id, QueuePhase::Dropped).await;
            return Err(AnalysisError::Cancelled);
        }

        if let Some(last) = *turn {
            let wait = self.limits.request_delay.saturating_sub(last.elapsed());
            if !wait.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = signal.stopped() => {
                        observer.on_phase(lane.id, QueuePhase::Dropped).await;
                        return Err(AnalysisError::Cancelled);
                    }
                }
            }
        }

        let started = Instant::now();
        *turn = Some(started);
        observer.on_phase(lane.id, QueuePhase::Dispatched).await;
        debug!(lane = lane.id, "dispatched");

        let outcome = tokio::select! {
            outcome = tokio::time::timeout(self.limits.call_timeout, lane.adapter.complete(prompt)) => outcome,
            _ = signal.stopped() => {
                debug!(lane = lane.id, "in-flight call abandoned");
                drop(turn);
                observer.on_phase(lane.id, QueuePhase::Completed).await;
                return Err(AnalysisError::Cancelled);
            }
        };
        drop(turn);
        observer.on_phase(lane.id, QueuePhase::Completed).await;

        match outcome {
            Ok(Ok(text)) => Ok(text),
            Ok(Err(LlmError::Timeout)) | Err(_) => {
                let elapsed = started.elapsed();
                warn!(lane = lane.id, elapsed_ms = elapsed.as_millis() as u64, "LLM call timed out");
                Err(AnalysisError::Timeout { elapsed })
            }
            Ok(Err(e)) => {
                warn!(lane = lane.id, error = %e, "LLM call failed");
                Err(AnalysisError::Failed(e))
            }
        }
    }
}
