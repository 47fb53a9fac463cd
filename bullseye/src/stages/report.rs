use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tracing::{info, instrument, warn};

use crate::context::{DetailObserver, JobContext};
use crate::error::{Error, Result};
use crate::llm::{AnalysisError, LlmQueue, prompts};
use crate::model::{FindingFilter, JobStatus};

use super::Stage;

pub const FULL_REPORT: &str = "full";
pub const SUMMARY_FALLBACK: &str = "Executive summary generation failed.";

pub struct ReportStage {
    queue: Arc<LlmQueue>,
}

impl ReportStage {
    pub fn new(queue: Arc<LlmQueue>) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl Stage for ReportStage {
    #[instrument(skip(self, ctx), fields(job_id = %ctx.job.id))]
    async fn run(&self, ctx: &mut JobContext) -> Result<()> {
        let job_id = ctx.job.id;
        let components = ctx.store.list_components(job_id).await?;
        let summary = ctx.store.findings_summary(job_id).await?;

        let lanes = self.queue.lanes_for(&ctx.credentials);
        let prompt = prompts::executive_prompt(&ctx.job, &summary, &components);
        let observer = DetailObserver {
            reporter: ctx.reporter.clone(),
            label: "writing executive summary".to_string(),
        };
        let executive_summary = match self
            .queue
            .submit(&lanes, None, &prompt, &ctx.signal, &observer)
            .await
        {
            Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
            Ok(_) => SUMMARY_FALLBACK.to_string(),
            Err(AnalysisError::Cancelled) => return Err(Error::Cancelled),
            Err(e) => {
                warn!(error = %e, "executive summary failed");
                SUMMARY_FALLBACK.to_string()
            }
        };
        ctx.signal.check()?;

        let findings = ctx.store.list_findings(job_id, &FindingFilter::default()).await?;
        let job = ctx.store.get_job(job_id).await?.unwrap_or_else(|| ctx.job.clone());
        let document = json!({
            "generated_at": Utc::now(),
            "job": job,
            "executive_summary": executive_summary,
            "summary": summary,
            "components": components,
            "findings": findings,
        });
        let content = serde_json::to_string_pretty(&document)
            .map_err(|e| Error::stage(self.name(), format!("report serialization failed: {e}")))?;
        let report = ctx.store.save_report(job_id, FULL_REPORT, "json", &content).await?;
        info!(report_id = %report.id, bytes = content.len(), findings = findings.len(), "report saved");

        ctx.reporter
            .advance(
                self.band().1,
                "Report generated",
                Some(format!("{} findings in {} components", summary.total, components.len())),
            )
            .await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "report"
    }

    fn status(&self) -> JobStatus {
        JobStatus::GeneratingReport
    }

    fn band(&self) -> (u32, u32) {
        (90, 100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::llm::{LlmError, QueueLimits};
    use crate::stages::fixtures::{ScriptedProvider, job_context};

    fn queue(provider: ScriptedProvider) -> Arc<LlmQueue> {
        Arc::new(LlmQueue::new(
            Arc::new(provider),
            QueueLimits {
                call_timeout: Duration::from_secs(5),
                request_delay: Duration::ZERO,
            },
        ))
    }

    #[tokio::test]
    async fn report_carries_the_executive_summary() {
        let (mut ctx, _dir) = job_context(&[("src/core/lib.rs", "pub fn f() {}\n")]).await;
        let provider = ScriptedProvider::replying(|_| Ok("  All good.  ".to_string()));

        ReportStage::new(queue(provider)).run(&mut ctx).await.unwrap();

        let report = ctx.store.get_report(ctx.job.id, FULL_REPORT).await.unwrap().unwrap();
        assert_eq!(report.format, "json");
        let doc: serde_json::Value = serde_json::from_str(&report.content).unwrap();
        assert_eq!(doc["executive_summary"], "All good.");
        assert_eq!(doc["components"].as_array().unwrap().len(), 1);
        assert_eq!(doc["summary"]["total"], 0);
        assert!(doc["findings"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn summary_failure_falls_back() {
        let (mut ctx, _dir) = job_context(&[("src/core/lib.rs", "pub fn f() {}\n")]).await;
        let provider = ScriptedProvider::replying(|_| Err(LlmError::InvalidCredential));

        ReportStage::new(queue(provider)).run(&mut ctx).await.unwrap();

        let report = ctx.store.get_report(ctx.job.id, FULL_REPORT).await.unwrap().unwrap();
        let doc: serde_json::Value = serde_json::from_str(&report.content).unwrap();
        assert_eq!(doc["executive_summary"], SUMMARY_FALLBACK);
    }
}
