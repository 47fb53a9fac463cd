use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use futures::future::join_all;
use tracing::{info, instrument};

use crate::context::{JobContext, band_point};
use crate::coordinator::{ComponentScan, ScanCoordinator};
use crate::error::Result;
use crate::model::{ComponentStatus, JobStatus};

use super::Stage;

/// Runs the scanner fan-out over every component. Scanner failures are
/// recorded per scanner and never fail the stage.
pub struct ScanStage {
    coordinator: Arc<ScanCoordinator>,
}

impl ScanStage {
    pub fn new(coordinator: Arc<ScanCoordinator>) -> Self {
        Self { coordinator }
    }
}

#[async_trait]
impl Stage for ScanStage {
    #[instrument(skip(self, ctx), fields(job_id = %ctx.job.id, components = ctx.components.len()))]
    async fn run(&self, ctx: &mut JobContext) -> Result<()> {
        let total = ctx.components.len();
        let band = self.band();
        let limiter = self.coordinator.limiter();
        let done = AtomicUsize::new(0);

        let ctx_ref = &*ctx;
        let scans = join_all(ctx_ref.components.iter().map(|(component, files)| {
            let limiter = &limiter;
            let done = &done;
            async move {
                ctx_ref
                    .store
                    .set_component_status(component.id, ComponentStatus::Scanning)
                    .await?;
                let scan = self
                    .coordinator
                    .scan_component(
                        ctx_ref.job.id,
                        component,
                        files,
                        &ctx_ref.checkout,
                        limiter,
                        &ctx_ref.signal,
                    )
                    .await?;
                ctx_ref
                    .store
                    .set_component_status(component.id, ComponentStatus::Scanned)
                    .await?;

                let finished = done.fetch_add(1, Ordering::SeqCst) + 1;
                ctx_ref
                    .reporter
                    .advance(
                        band_point(band, finished, total),
                        format!("Scanned {finished} of {total} components"),
                        Some(format!("component {}: {} new findings", component.name, scan.inserted)),
                    )
                    .await?;
                Ok::<ComponentScan, crate::Error>(scan)
            }
        }))
        .await;

        let mut inserted = 0;
        let mut duplicates = 0;
        let mut failed = 0;
        for scan in scans {
            let scan = scan?;
            inserted += scan.inserted;
            duplicates += scan.duplicates;
            failed += scan.failed_scanners.len();
        }
        info!(inserted, duplicates, failed_scanners = failed, "scan complete");

        ctx.reporter
            .advance(
                band.1,
                format!("Scan complete: {inserted} findings"),
                (failed > 0).then(|| format!("{failed} scanner runs failed")),
            )
            .await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "scan"
    }

    fn status(&self) -> JobStatus {
        JobStatus::Scanning
    }

    fn band(&self) -> (u32, u32) {
        (15, 45)
    }
}
