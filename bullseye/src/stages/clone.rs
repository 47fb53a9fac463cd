use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, instrument};

use crate::context::JobContext;
use crate::error::{Error, Result};
use crate::model::JobStatus;
use crate::repo::RepoFetcher;

use super::Stage;

pub struct CloneStage {
    fetcher: Arc<dyn RepoFetcher>,
}

impl CloneStage {
    pub fn new(fetcher: Arc<dyn RepoFetcher>) -> Self {
        Self { fetcher }
    }
}

#[async_trait]
impl Stage for CloneStage {
    #[instrument(skip(self, ctx), fields(job_id = %ctx.job.id, repo = %ctx.job.repo_url))]
    async fn run(&self, ctx: &mut JobContext) -> Result<()> {
        let commit = self
            .fetcher
            .fetch(&ctx.job.repo_url, &ctx.job.branch, &ctx.checkout, &ctx.signal)
            .await
            .map_err(|e| match e {
                Error::Cancelled => Error::Cancelled,
                Error::Timeout { .. } => e,
                other => Error::stage(self.name(), other.to_string()),
            })?;

        ctx.store.set_commit(ctx.job.id, &commit).await?;
        ctx.job.commit_hash = Some(commit.clone());
        info!(commit = %commit, "repository ready");

        let short = commit.get(..8).unwrap_or(&commit);
        ctx.reporter
            .advance(self.band().1, format!("Cloned {} at {short}", ctx.job.branch), None)
            .await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "clone"
    }

    fn status(&self) -> JobStatus {
        JobStatus::Cloning
    }

    fn band(&self) -> (u32, u32) {
        (0, 5)
    }
}
