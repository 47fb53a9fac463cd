//! LLM review of every code file, one component at a time.
//!
//! Files of a component are submitted to the job's lanes with at most one
//! outstanding unit per lane. A unit that fails is recorded on its file and
//! the stage moves on; the stage only fails when every dispatched unit did.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt, stream};
use tracing::{debug, info, instrument, warn};

use crate::context::{DetailObserver, JobContext, band_point};
use crate::detect::is_code_language;
use crate::error::{Error, Result};
use crate::fingerprint::{fingerprint, slug};
use crate::llm::parse::{LlmIssue, parse_component_analysis, parse_file_analysis};
use crate::llm::{AnalysisError, LaneSet, LlmQueue, prompts};
use crate::model::{Component, ComponentStatus, FileStatus, JobStatus, NewFinding, Severity, SourceFile};

use super::Stage;

const MIN_CODE_CHARS: usize = 50;
const PARSE_FAILED_SUMMARY: &str = "Analysis completed but response parsing failed";

#[derive(Debug)]
enum FileOutcome {
    Skipped,
    Analyzed { findings: u32, summary: String },
    Failed(AnalysisError),
}

pub struct AnalyzeStage {
    queue: Arc<LlmQueue>,
    max_code_chars: usize,
}

impl AnalyzeStage {
    pub fn new(queue: Arc<LlmQueue>, max_code_chars: usize) -> Self {
        Self {
            queue,
            max_code_chars: max_code_chars.max(1),
        }
    }

    #[instrument(skip_all, fields(file = %file.path))]
    async fn analyze_file(
        &self,
        ctx: &JobContext,
        lanes: &LaneSet,
        component: &Component,
        file: &SourceFile,
        position: usize,
        count: usize,
    ) -> Result<FileOutcome> {
        ctx.signal.check()?;

        let language = file.language.as_deref().unwrap_or("unknown");
        if !is_code_language(language) {
            ctx.store.set_file_status(file.id, FileStatus::Skipped, None).await?;
            return Ok(FileOutcome::Skipped);
        }
        let code = match tokio::fs::read(ctx.checkout.join(&file.path)).await {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) => {
                warn!(error = %e, "file unreadable; skipped");
                ctx.store.set_file_status(file.id, FileStatus::Skipped, None).await?;
                return Ok(FileOutcome::Skipped);
            }
        };
        if code.trim().chars().count() < MIN_CODE_CHARS {
            ctx.store.set_file_status(file.id, FileStatus::Skipped, None).await?;
            return Ok(FileOutcome::Skipped);
        }

        let prompt = prompts::file_prompt(&ctx.job.model, &file.path, language, &code, self.max_code_chars);
        let observer = DetailObserver {
            reporter: ctx.reporter.clone(),
            label: format!(
                "analyzing file {} of {count} in component {}",
                position + 1,
                component.name
            ),
        };
        let reply = match self
            .queue
            .submit(lanes, Some(position), &prompt, &ctx.signal, &observer)
            .await
        {
            Ok(reply) => reply,
            Err(AnalysisError::Cancelled) => return Err(Error::Cancelled),
            Err(e) => {
                warn!(error = %e, "file analysis failed");
                ctx.store
                    .set_file_status(file.id, FileStatus::Failed, Some(&e.to_string()))
                    .await?;
                return Ok(FileOutcome::Failed(e));
            }
        };
        // A reply that lands after a stop is discarded.
        ctx.signal.check()?;

        let Some(analysis) = parse_file_analysis(&reply) else {
            debug!(chars = reply.len(), "unparseable analysis reply");
            ctx.store
                .set_file_status(file.id, FileStatus::Analyzed, Some(PARSE_FAILED_SUMMARY))
                .await?;
            return Ok(FileOutcome::Analyzed {
                findings: 0,
                summary: PARSE_FAILED_SUMMARY.to_string(),
            });
        };

        let mut inserted = 0;
        let groups = [
            ("security", Severity::Medium, &analysis.security_issues),
            ("quality", Severity::Low, &analysis.quality_issues),
        ];
        for (category, default, issues) in groups {
            for issue in issues {
                ctx.signal.check()?;
                let finding = issue_finding(component, file, category, default, issue);
                if ctx.store.insert_finding(ctx.job.id, &finding).await? {
                    inserted += 1;
                }
            }
        }

        let summary = match analysis.summary.trim() {
            "" => "No summary provided".to_string(),
            text => text.to_string(),
        };
        ctx.store
            .set_file_status(file.id, FileStatus::Analyzed, Some(&summary))
            .await?;
        Ok(FileOutcome::Analyzed {
            findings: inserted,
            summary,
        })
    }

    /// One queued call per component; a failure leaves the summary empty.
    async fn summarize_component(
        &self,
        ctx: &JobContext,
        lanes: &LaneSet,
        component: &Component,
        file_summaries: &[(String, String)],
    ) -> Result<()> {
        if file_summaries.is_empty() {
            return Ok(());
        }
        let prompt = prompts::component_prompt(&ctx.job.model, component, file_summaries);
        let observer = DetailObserver {
            reporter: ctx.reporter.clone(),
            label: format!("summarizing component {}", component.name),
        };
        match self.queue.submit(lanes, None, &prompt, &ctx.signal, &observer).await {
            Ok(reply) => {
                ctx.signal.check()?;
                let text = match parse_component_analysis(&reply) {
                    Some(analysis) if !analysis.summary.trim().is_empty() => {
                        match analysis.security_posture.as_deref().map(str::trim) {
                            Some(posture) if !posture.is_empty() => {
                                format!("{}\n\nSecurity posture: {posture}", analysis.summary.trim())
                            }
                            _ => analysis.summary.trim().to_string(),
                        }
                    }
                    _ => reply.trim().chars().take(2000).collect(),
                };
                ctx.store.set_component_summary(component.id, &text).await?;
            }
            Err(AnalysisError::Cancelled) => return Err(Error::Cancelled),
            Err(e) => warn!(component = %component.name, error = %e, "component summary failed"),
        }
        Ok(())
    }
}

pub(crate) fn issue_finding(
    component: &Component,
    file: &SourceFile,
    category: &str,
    default: Severity,
    issue: &LlmIssue,
) -> NewFinding {
    let title = issue
        .title
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .unwrap_or("Untitled finding")
        .to_string();
    let rule_id = format!("llm/{category}/{}", slug(&title));
    let line = issue.line();
    let severity = issue
        .severity
        .as_deref()
        .filter(|s| !s.trim().is_empty())
        .map_or(default, Severity::normalize);

    NewFinding {
        component_id: Some(component.id),
        file_id: Some(file.id),
        scanner: "llm".to_string(),
        fingerprint: fingerprint(&rule_id, Some(&file.path), line, line, None),
        rule_id: Some(rule_id),
        severity,
        category: Some(category.to_string()),
        title,
        description: issue.description.clone(),
        file_path: Some(file.path.clone()),
        line_start: line,
        line_end: line,
        code_snippet: None,
        suggestion: issue.recommendation.clone(),
        llm_explanation: None,
    }
}

#[async_trait]
impl Stage for AnalyzeStage {
    #[instrument(skip(self, ctx), fields(job_id = %ctx.job.id))]
    async fn run(&self, ctx: &mut JobContext) -> Result<()> {
        let lanes = self.queue.lanes_for(&ctx.credentials);
        let width = lanes.len().max(1);
        let band = self.band();
        let total_files: usize = ctx.components.iter().map(|(_, f)| f.len()).sum();
        let component_count = ctx.components.len();
        let done = AtomicUsize::new(0);
        let mut tally = ctx.analysis;
        let mut last_error: Option<AnalysisError> = None;
        info!(lanes = lanes.len(), files = total_files, "analysis started");

        let ctx_ref = &*ctx;
        for (index, (component, files)) in ctx_ref.components.iter().enumerate() {
            ctx_ref.signal.check()?;
            ctx_ref
                .store
                .set_component_status(component.id, ComponentStatus::Analyzing)
                .await?;
            let message = format!(
                "Analyzing component {} ({} of {component_count})",
                component.name,
                index + 1
            );
            ctx_ref
                .reporter
                .advance(band_point(band, done.load(Ordering::SeqCst), total_files), message.clone(), None)
                .await?;

            let lanes = &lanes;
            let done = &done;
            let message = &message;
            let pending: Vec<_> = files
                .iter()
                .enumerate()
                .map(|(position, file)| async move {
                    let outcome = self
                        .analyze_file(ctx_ref, lanes, component, file, position, files.len())
                        .await?;
                    let finished = done.fetch_add(1, Ordering::SeqCst) + 1;
                    ctx_ref
                        .reporter
                        .advance(band_point(band, finished, total_files), message.clone(), None)
                        .await?;
                    Ok::<_, Error>((position, outcome))
                })
                .collect();
            let mut outcomes: Vec<(usize, FileOutcome)> = stream::iter(pending)
                .buffer_unordered(width)
                .try_collect()
                .await?;
            outcomes.sort_by_key(|(position, _)| *position);

            let mut summaries = Vec::new();
            for (position, outcome) in outcomes {
                match outcome {
                    FileOutcome::Skipped => tally.skipped += 1,
                    FileOutcome::Analyzed { findings, summary } => {
                        tally.dispatched += 1;
                        tally.findings += findings;
                        summaries.push((files[position].path.clone(), summary));
                    }
                    FileOutcome::Failed(e) => {
                        tally.dispatched += 1;
                        tally.failed += 1;
                        last_error = Some(e);
                    }
                }
            }

            self.summarize_component(ctx_ref, lanes, component, &summaries)
                .await?;
            let summary = ctx_ref.store.component_findings_summary(component.id).await?;
            ctx_ref
                .store
                .set_component_health(component.id, summary.total, summary.health_score())
                .await?;
            ctx_ref
                .store
                .set_component_status(component.id, ComponentStatus::Completed)
                .await?;
        }

        ctx.analysis = tally;
        info!(
            dispatched = tally.dispatched,
            failed = tally.failed,
            skipped = tally.skipped,
            findings = tally.findings,
            "analysis complete"
        );

        if tally.dispatched > 0 && tally.failed == tally.dispatched {
            let reason = last_error.map_or_else(|| "unknown error".to_string(), |e| e.to_string());
            return Err(Error::stage(
                self.name(),
                format!("all {} file analyses failed; last error: {reason}", tally.dispatched),
            ));
        }

        ctx.reporter
            .advance(
                band.1,
                format!("Analysis complete: {} findings", tally.findings),
                Some(format!(
                    "{} files analyzed, {} skipped, {} failed",
                    tally.dispatched - tally.failed,
                    tally.skipped,
                    tally.failed
                )),
            )
            .await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "analyze"
    }

    fn status(&self) -> JobStatus {
        JobStatus::Analyzing
    }

    fn band(&self) -> (u32, u32) {
        (45, 90)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmError, QueueLimits};
    use crate::model::FindingFilter;
    use crate::stages::fixtures::{ScriptedProvider, job_context};
    use std::time::Duration;

    const REPLY: &str = r#"```json
{
  "summary": "Serves the index page.",
  "security_issues": [
    {"severity": "high", "title": "SQL injection", "description": "query built by concatenation", "line_hint": 3, "recommendation": "bind parameters"}
  ],
  "quality_issues": [
    {"title": "Missing error handling"}
  ]
}
```"#;

    fn queue(provider: ScriptedProvider) -> Arc<LlmQueue> {
        Arc::new(LlmQueue::new(
            Arc::new(provider),
            QueueLimits {
                call_timeout: Duration::from_secs(5),
                request_delay: Duration::ZERO,
            },
        ))
    }

    const LONG_CODE: &str = "import db\n\ndef index(user):\n    return db.query('SELECT * FROM t WHERE u=' + user)\n";

    #[tokio::test]
    async fn code_files_become_findings_and_others_are_skipped() {
        let (mut ctx, _dir) = job_context(&[
            ("src/web/app.py", LONG_CODE),
            ("src/web/tiny.py", "x = 1\n"),
            ("src/web/README.md", &"words ".repeat(40)),
        ])
        .await;
        let provider = ScriptedProvider::replying(|_| Ok(REPLY.to_string()));
        let calls = provider.calls.clone();

        AnalyzeStage::new(queue(provider), 12_000).run(&mut ctx).await.unwrap();

        // one file unit plus one component summary
        assert_eq!(calls.lock().unwrap().len(), 2);
        assert_eq!(ctx.analysis.dispatched, 1);
        assert_eq!(ctx.analysis.skipped, 2);
        assert_eq!(ctx.analysis.findings, 2);

        let findings = ctx.store.list_findings(ctx.job.id, &FindingFilter::default()).await.unwrap();
        assert_eq!(findings.len(), 2);
        let sql = findings.iter().find(|f| f.title == "SQL injection").unwrap();
        assert_eq!(sql.severity, Severity::High);
        assert_eq!(sql.rule_id.as_deref(), Some("llm/security/sql-injection"));
        assert_eq!(sql.line_start, Some(3));
        assert_eq!(sql.file_path.as_deref(), Some("src/web/app.py"));
        let quality = findings.iter().find(|f| f.category.as_deref() == Some("quality")).unwrap();
        assert_eq!(quality.severity, Severity::Low);

        let components = ctx.store.list_components(ctx.job.id).await.unwrap();
        assert_eq!(components[0].status, ComponentStatus::Completed);
        assert_eq!(components[0].health_score, Some(89));
    }

    #[tokio::test]
    async fn unparseable_reply_is_not_a_failure() {
        let (mut ctx, _dir) = job_context(&[("src/web/app.py", LONG_CODE)]).await;
        let provider = ScriptedProvider::replying(|_| Ok("I cannot help with that.".to_string()));

        AnalyzeStage::new(queue(provider), 12_000).run(&mut ctx).await.unwrap();

        let (_, files) = &ctx.components[0];
        let stored = ctx.store.list_files(files[0].component_id).await.unwrap();
        assert_eq!(stored[0].status, FileStatus::Analyzed);
        assert_eq!(stored[0].analysis_summary.as_deref(), Some(PARSE_FAILED_SUMMARY));
    }

    #[tokio::test]
    async fn all_units_failing_fails_the_stage() {
        let (mut ctx, _dir) = job_context(&[
            ("src/web/app.py", LONG_CODE),
            ("src/web/other.py", LONG_CODE),
        ])
        .await;
        let provider = ScriptedProvider::replying(|_| Err(LlmError::RateLimited("slow down".into())));

        let err = AnalyzeStage::new(queue(provider), 12_000).run(&mut ctx).await.unwrap_err();
        assert!(matches!(err, Error::Stage { stage: "analyze", .. }), "{err}");
        assert!(err.to_string().contains("rate limited"));
        assert_eq!(ctx.analysis.failed, 2);
    }

    #[tokio::test]
    async fn partial_failures_are_absorbed() {
        let (mut ctx, _dir) = job_context(&[
            ("src/web/app.py", LONG_CODE),
            ("src/web/bad.py", LONG_CODE),
        ])
        .await;
        let provider = ScriptedProvider::replying(|prompt| {
            if prompt.user.contains("bad.py") {
                Err(LlmError::Provider("HTTP 500".into()))
            } else {
                Ok(REPLY.to_string())
            }
        });

        AnalyzeStage::new(queue(provider), 12_000).run(&mut ctx).await.unwrap();
        assert_eq!(ctx.analysis.dispatched, 2);
        assert_eq!(ctx.analysis.failed, 1);
    }

    #[tokio::test]
    async fn stopped_job_dispatches_nothing() {
        let (mut ctx, _dir) = job_context(&[("src/web/app.py", LONG_CODE)]).await;
        let provider = ScriptedProvider::replying(|_| Ok(REPLY.to_string()));
        let calls = provider.calls.clone();
        ctx.signal.request_stop();

        let err = AnalyzeStage::new(queue(provider), 12_000).run(&mut ctx).await.unwrap_err();
        assert!(err.is_cancelled());
        assert!(calls.lock().unwrap().is_empty());
    }

    #[test]
    fn issue_defaults() {
        let component = Component {
            id: uuid::Uuid::new_v4(),
            job_id: uuid::Uuid::new_v4(),
            name: "web".into(),
            path: "src/web".into(),
            component_type: "module".into(),
            language: Some("python".into()),
            file_count: 1,
            line_count: 1,
            status: ComponentStatus::Analyzing,
            findings_count: 0,
            health_score: None,
            analysis_summary: None,
        };
        let file = SourceFile {
            id: uuid::Uuid::new_v4(),
            component_id: component.id,
            job_id: component.job_id,
            path: "src/web/app.py".into(),
            language: Some("python".into()),
            size_bytes: 1,
            line_count: 1,
            status: FileStatus::Pending,
            analysis_summary: None,
        };
        let finding = issue_finding(&component, &file, "security", Severity::Medium, &LlmIssue::default());
        assert_eq!(finding.title, "Untitled finding");
        assert_eq!(finding.severity, Severity::Medium);
        assert_eq!(finding.rule_id.as_deref(), Some("llm/security/untitled-finding"));
        assert_eq!(finding.scanner, "llm");

        let again = issue_finding(&component, &file, "security", Severity::Medium, &LlmIssue::default());
        assert_eq!(finding.fingerprint, again.fingerprint);
    }
}
