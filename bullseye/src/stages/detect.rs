use async_trait::async_trait;
use tracing::{info, instrument, warn};

use crate::context::JobContext;
use crate::detect::ComponentDetector;
use crate::error::{Error, Result};
use crate::model::JobStatus;

use super::Stage;

pub struct DetectStage {
    detector: ComponentDetector,
}

impl DetectStage {
    pub fn new(detector: ComponentDetector) -> Self {
        Self { detector }
    }
}

#[async_trait]
impl Stage for DetectStage {
    #[instrument(skip(self, ctx), fields(job_id = %ctx.job.id))]
    async fn run(&self, ctx: &mut JobContext) -> Result<()> {
        let detector = self.detector.clone();
        let checkout = ctx.checkout.clone();
        let root_name = ctx.job.name.clone();
        let detected = tokio::task::spawn_blocking(move || detector.detect(&checkout, &root_name))
            .await
            .map_err(|e| Error::stage(self.name(), format!("detection task failed: {e}")))?
            .map_err(|e| Error::stage(self.name(), format!("{e:#}")))?;

        if detected.is_empty() {
            warn!("no analyzable files found");
        }

        ctx.components = ctx.store.insert_components(ctx.job.id, &detected).await?;
        let files: usize = ctx.components.iter().map(|(_, f)| f.len()).sum();
        info!(components = ctx.components.len(), files, "components recorded");

        ctx.reporter
            .advance(
                self.band().1,
                format!("Detected {} components", ctx.components.len()),
                Some(format!("{files} files")),
            )
            .await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "detect"
    }

    fn status(&self) -> JobStatus {
        JobStatus::DetectingComponents
    }

    fn band(&self) -> (u32, u32) {
        (5, 15)
    }
}
