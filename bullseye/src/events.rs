//! Per-job publish/subscribe of status changes.
//!
//! Publishing never blocks the executor: each job gets a bounded broadcast
//! channel, a send with no attached receiver is simply dropped, and a slow
//! subscriber loses the oldest events rather than applying back-pressure. The
//! `status_updates` log stays the durable record for replay.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::model::{Job, JobStatus, StatusUpdate};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    pub job_id: Uuid,
    /// Sequence number of the `status_updates` row this event mirrors; `None`
    /// for snapshots synthesised from the job row.
    pub seq: Option<i64>,
    pub status: JobStatus,
    pub progress: u32,
    pub message: Option<String>,
    pub detail: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl From<&StatusUpdate> for JobEvent {
    fn from(update: &StatusUpdate) -> Self {
        Self {
            job_id: update.job_id,
            seq: Some(update.seq),
            status: update.status,
            progress: update.progress,
            message: Some(update.message.clone()),
            detail: update.detail.clone(),
            timestamp: update.timestamp,
        }
    }
}

impl JobEvent {
    pub fn snapshot(job: &Job) -> Self {
        Self {
            job_id: job.id,
            seq: None,
            status: job.status,
            progress: job.progress,
            message: job.status_message.clone(),
            detail: job.progress_detail.clone(),
            timestamp: Utc::now(),
        }
    }
}

/// Finite stream of one job's events, ending after the terminal event.
pub type EventStream = BoxStream<'static, JobEvent>;

#[derive(Debug)]
pub struct EventHub {
    capacity: usize,
    channels: Mutex<HashMap<Uuid, broadcast::Sender<JobEvent>>>,
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Best-effort delivery to the job's current subscribers. A terminal event
    /// also closes the channel so every subscriber stream ends.
    pub fn publish(&self, event: JobEvent) {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        let terminal = event.status.is_terminal();
        let job_id = event.job_id;

        match channels.get(&job_id) {
            Some(sender) => {
                if sender.send(event).is_err() {
                    debug!(job_id = %job_id, "no live observers; event dropped");
                }
            }
            None => debug!(job_id = %job_id, "no channel; event dropped"),
        }

        if terminal {
            channels.remove(&job_id);
        }
    }

    /// Attaches a new observer. Only events published after this call are
    /// delivered; callers wanting history read the status log first.
    pub fn subscribe(&self, job_id: Uuid) -> EventStream {
        let receiver = {
            let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
            channels
                .entry(job_id)
                .or_insert_with(|| broadcast::channel(self.capacity).0)
                .subscribe()
        };

        stream::unfold(Some(receiver), move |state| async move {
            let mut receiver = state?;
            loop {
                match receiver.recv().await {
                    Ok(event) => {
                        let next = if event.status.is_terminal() {
                            None
                        } else {
                            Some(receiver)
                        };
                        return Some((event, next));
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(job_id = %job_id, skipped, "observer lagged; events dropped");
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        })
        .boxed()
    }

    /// Drops the job's channel, ending any open subscriber streams.
    pub fn close(&self, job_id: Uuid) {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels.remove(&job_id);
    }

    pub fn subscriber_count(&self, job_id: Uuid) -> usize {
        let channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels.get(&job_id).map_or(0, |s| s.receiver_count())
    }
}
