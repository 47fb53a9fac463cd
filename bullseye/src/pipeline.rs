use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, instrument, warn};

use crate::context::JobContext;
use crate::error::{Error, Result};
use crate::model::JobStatus;
use crate::stages::Stage;

const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(3600);
const DEFAULT_DRAIN_GRACE: Duration = Duration::from_secs(10);

/// Drives one job through its stages and into a terminal state.
#[derive(Clone)]
pub struct Pipeline {
    stages: Arc<Vec<Box<dyn Stage>>>,
    job_timeout: Duration,
    drain_grace: Duration,
}

impl Pipeline {
    /// Runs every stage in order, records the terminal transition and removes
    /// the job's checkout. Returns the terminal status.
    #[instrument(skip(self, ctx), fields(job_id = %ctx.job.id, stage_count = self.stages.len()))]
    pub async fn run_one(&self, ctx: &mut JobContext) -> JobStatus {
        let signal = ctx.signal.clone();
        let result = {
            let run = self.run_stages(ctx);
            tokio::pin!(run);
            match tokio::time::timeout(self.job_timeout, &mut run).await {
                Ok(result) => result,
                Err(_) => {
                    // Stages wind down through the stop signal so in-flight
                    // scanners and LLM calls record how they ended.
                    warn!(timeout_secs = self.job_timeout.as_secs(), "job timed out, draining stages");
                    signal.request_stop();
                    if tokio::time::timeout(self.drain_grace, &mut run).await.is_err() {
                        warn!(grace_secs = self.drain_grace.as_secs(), "stages did not drain in time");
                    }
                    Err(Error::Timeout {
                        what: "job".to_string(),
                        elapsed: self.job_timeout,
                    })
                }
            }
        };
        let status = self.finish(ctx, result).await;

        if ctx.checkout.exists()
            && let Err(e) = tokio::fs::remove_dir_all(&ctx.checkout).await
        {
            warn!(path = %ctx.checkout.display(), error = %e, "failed to remove checkout");
        }
        status
    }

    async fn run_stages(&self, ctx: &mut JobContext) -> Result<()> {
        for stage in self.stages.iter() {
            ctx.signal.check()?;
            ctx.reporter
                .enter(stage.status(), stage.band().0, stage_message(stage.status()), None, None)
                .await?;

            if let Err(e) = stage.run(ctx).await {
                if !e.is_cancelled() {
                    warn!(stage = stage.name(), error = %e, "stage failed");
                }
                return Err(e);
            }
            debug!(stage = stage.name(), "stage complete");
            ctx.last_completed_stage = Some(stage.name());
            ctx.signal.check()?;
        }
        Ok(())
    }

    async fn finish(&self, ctx: &mut JobContext, result: Result<()>) -> JobStatus {
        let progress = ctx.reporter.progress().await;
        let last_stage = ctx.last_completed_stage.unwrap_or("none");
        let (status, progress, message, detail, error) = match result {
            Ok(()) => (
                JobStatus::Completed,
                100,
                "Analysis completed".to_string(),
                Some(format!("{} findings from LLM analysis", ctx.analysis.findings)),
                None,
            ),
            Err(e @ Error::Timeout { .. }) => (
                JobStatus::Failed,
                progress,
                format!("Analysis failed: {e}"),
                Some(format!("last completed stage: {last_stage}")),
                Some(e.to_string()),
            ),
            Err(e) if e.is_cancelled() || ctx.signal.is_stop_requested() => (
                JobStatus::Cancelled,
                progress,
                "Analysis cancelled".to_string(),
                Some(format!("last completed stage: {last_stage}")),
                None,
            ),
            Err(e) => (
                JobStatus::Failed,
                progress,
                format!("Analysis failed: {e}"),
                Some(format!("last completed stage: {last_stage}")),
                Some(e.to_string()),
            ),
        };

        if status != JobStatus::Completed {
            let reason = match status {
                JobStatus::Cancelled => "cancelled",
                _ => error.as_deref().unwrap_or("job failed"),
            };
            if let Err(e) = ctx.store.abandon_open_work(ctx.job.id, reason).await {
                error!(error = %e, "open work not closed");
            }
        }

        match ctx.reporter.enter(status, progress, message, detail, error).await {
            Ok(_) => info!(status = %status, "job finished"),
            Err(e) => error!(status = %status, error = %e, "terminal transition not recorded"),
        }
        ctx.job.status = status;
        status
    }

    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    pub fn job_timeout(&self) -> Duration {
        self.job_timeout
    }

    pub fn drain_grace(&self) -> Duration {
        self.drain_grace
    }
}

fn stage_message(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Cloning => "Cloning repository",
        JobStatus::DetectingComponents => "Detecting components",
        JobStatus::Scanning => "Running scanners",
        JobStatus::Analyzing => "Analyzing code with LLM",
        JobStatus::GeneratingReport => "Generating report",
        _ => "Working",
    }
}

pub struct PipelineBuilder {
    stages: Vec<Box<dyn Stage>>,
    job_timeout: Duration,
    drain_grace: Duration,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self {
            stages: vec![],
            job_timeout: DEFAULT_JOB_TIMEOUT,
            drain_grace: DEFAULT_DRAIN_GRACE,
        }
    }

    pub fn stage(mut self, stage: impl Stage + 'static) -> Self {
        self.stages.push(Box::new(stage));
        self
    }

    pub fn job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    /// How long stages get to wind down after the job timeout fires.
    pub fn drain_grace(mut self, grace: Duration) -> Self {
        self.drain_grace = grace;
        self
    }

    pub fn build(self) -> Pipeline {
        Pipeline {
            stages: Arc::new(self.stages),
            job_timeout: self.job_timeout,
            drain_grace: self.drain_grace,
        }
    }
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}
