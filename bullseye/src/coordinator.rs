//! Fan-out of scanner adapters over one component at a time.
//!
//! Every applicable adapter runs concurrently, bounded by a semaphore the scan
//! stage shares across all components of the job. An adapter that errors,
//! panics or overruns its time box leaves a `failed` scanner result behind and
//! the remaining adapters carry on.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use futures::future::join_all;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::cancel::StopSignal;
use crate::error::{Error, Result};
use crate::fingerprint::{fingerprint, normalize_path, slug};
use crate::model::{Component, FindingsSummary, NewFinding, ScannerStatus, Severity, SourceFile};
use crate::scanners::{RawFinding, ScanTarget, ScannerAdapter, ScannerRegistry};
use crate::store::Store;

const MAX_RAW_OUTPUT: usize = 256 * 1024;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ComponentScan {
    pub inserted: u32,
    pub duplicates: u32,
    pub failed_scanners: Vec<String>,
    pub summary: FindingsSummary,
}

#[derive(Debug, Default)]
struct AdapterOutcome {
    inserted: u32,
    duplicates: u32,
    failed: Option<String>,
}

pub struct ScanCoordinator {
    registry: ScannerRegistry,
    store: Arc<dyn Store>,
    timeout: Duration,
    concurrency: usize,
}

impl ScanCoordinator {
    pub fn new(
        registry: ScannerRegistry,
        store: Arc<dyn Store>,
        timeout: Duration,
        concurrency: usize,
    ) -> Self {
        Self {
            registry,
            store,
            timeout,
            concurrency: concurrency.max(1),
        }
    }

    /// A fresh limiter for one job's scan stage.
    pub fn limiter(&self) -> Arc<Semaphore> {
        Arc::new(Semaphore::new(self.concurrency))
    }

    #[instrument(skip_all, fields(job_id = %job_id, component = %component.name))]
    pub async fn scan_component(
        &self,
        job_id: Uuid,
        component: &Component,
        files: &[SourceFile],
        repo_root: &Path,
        limiter: &Arc<Semaphore>,
        signal: &StopSignal,
    ) -> Result<ComponentScan> {
        signal.check()?;

        let target = Arc::new(ScanTarget {
            component: component.name.clone(),
            repo_root: repo_root.to_path_buf(),
            root: repo_root.join(&component.path),
            language: component.language.clone(),
            files: files.iter().map(|f| f.path.clone()).collect(),
        });
        let file_ids: HashMap<&str, Uuid> = files.iter().map(|f| (f.path.as_str(), f.id)).collect();

        let adapters = self.registry.applicable(component.language.as_deref());
        debug!(count = adapters.len(), "dispatching scanners");

        let outcomes = join_all(adapters.into_iter().map(|adapter| {
            self.run_adapter(job_id, component, &file_ids, adapter, target.clone(), limiter, signal)
        }))
        .await;

        let mut scan = ComponentScan::default();
        for outcome in outcomes {
            let outcome = outcome?;
            scan.inserted += outcome.inserted;
            scan.duplicates += outcome.duplicates;
            if let Some(name) = outcome.failed {
                scan.failed_scanners.push(name);
            }
        }

        scan.summary = self.store.component_findings_summary(component.id).await?;
        self.store
            .set_component_health(component.id, scan.summary.total, scan.summary.health_score())
            .await?;
        Ok(scan)
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_adapter(
        &self,
        job_id: Uuid,
        component: &Component,
        file_ids: &HashMap<&str, Uuid>,
        adapter: Arc<dyn ScannerAdapter>,
        target: Arc<ScanTarget>,
        limiter: &Arc<Semaphore>,
        signal: &StopSignal,
    ) -> Result<AdapterOutcome> {
        let name = adapter.name().to_string();
        let _permit = tokio::select! {
            permit = limiter.clone().acquire_owned() => {
                permit.map_err(|_| anyhow!("scanner limiter closed"))?
            }
            _ = signal.stopped() => return Err(Error::Cancelled),
        };
        signal.check()?;

        let result_id = self
            .store
            .start_scanner_result(job_id, Some(component.id), &name)
            .await?;

        let mut task = AbortOnDrop(tokio::spawn({
            let adapter = adapter.clone();
            let target = target.clone();
            async move { adapter.run(&target).await }
        }));

        let joined = tokio::select! {
            joined = tokio::time::timeout(self.timeout, &mut task.0) => joined,
            _ = signal.stopped() => {
                task.0.abort();
                self.store
                    .finish_scanner_result(result_id, ScannerStatus::Failed, 0, None, Some("cancelled"))
                    .await?;
                return Err(Error::Cancelled);
            }
        };

        let raw = match joined {
            Ok(Ok(Ok(raw))) => raw,
            Ok(Ok(Err(e))) => return self.record_failure(result_id, &name, component, format!("{e:#}")).await,
            Ok(Err(join_error)) => {
                let message = format!("scanner task aborted: {join_error}");
                return self.record_failure(result_id, &name, component, message).await;
            }
            Err(_) => {
                task.0.abort();
                let message = format!("timed out after {}s", self.timeout.as_secs());
                return self.record_failure(result_id, &name, component, message).await;
            }
        };

        if signal.is_stop_requested() {
            self.store
                .finish_scanner_result(result_id, ScannerStatus::Failed, 0, None, Some("cancelled"))
                .await?;
            return Err(Error::Cancelled);
        }

        let mut outcome = AdapterOutcome::default();
        for finding in &raw.findings {
            let new = normalize(&name, component, &target, file_ids, finding);
            if self.store.insert_finding(job_id, &new).await? {
                outcome.inserted += 1;
            } else {
                outcome.duplicates += 1;
            }
        }

        let raw_output = raw.raw_output.as_deref().map(|o| truncate(o, MAX_RAW_OUTPUT));
        self.store
            .finish_scanner_result(
                result_id,
                ScannerStatus::Completed,
                u32::try_from(raw.findings.len()).unwrap_or(u32::MAX),
                raw_output,
                None,
            )
            .await?;
        debug!(
            scanner = %name,
            inserted = outcome.inserted,
            duplicates = outcome.duplicates,
            "scanner complete"
        );
        Ok(outcome)
    }

    async fn record_failure(
        &self,
        result_id: Uuid,
        name: &str,
        component: &Component,
        message: String,
    ) -> Result<AdapterOutcome> {
        warn!(scanner = %name, component = %component.name, error = %message, "scanner failed");
        self.store
            .finish_scanner_result(result_id, ScannerStatus::Failed, 0, None, Some(&message))
            .await?;
        Ok(AdapterOutcome {
            failed: Some(name.to_string()),
            ..Default::default()
        })
    }
}

/// Aborts the adapter task when the scan future is dropped mid-flight.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn truncate(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Maps a tool-reported path onto the repository-relative path of a known
/// file where possible.
fn resolve_path(raw: &str, target: &ScanTarget, component_path: &str) -> String {
    let path = Path::new(raw);
    let relative = match path.strip_prefix(&target.repo_root) {
        Ok(stripped) => stripped.to_string_lossy().into_owned(),
        Err(_) => raw.to_string(),
    };
    let normalized = normalize_path(&relative);
    if target.files.iter().any(|f| f == &normalized) {
        return normalized;
    }
    let joined = normalize_path(&format!("{component_path}/{normalized}"));
    if target.files.iter().any(|f| f == &joined) {
        joined
    } else {
        normalized
    }
}

pub(crate) fn normalize(
    scanner: &str,
    component: &Component,
    target: &ScanTarget,
    file_ids: &HashMap<&str, Uuid>,
    raw: &RawFinding,
) -> NewFinding {
    let title = if raw.title.trim().is_empty() {
        "Untitled finding".to_string()
    } else {
        raw.title.trim().to_string()
    };
    let rule_id = raw
        .rule_id
        .as_deref()
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| slug(&title));
    let file_path = raw
        .file_path
        .as_deref()
        .map(|p| resolve_path(p, target, &component.path));
    let line_end = raw.line_end.or(raw.line_start);

    NewFinding {
        component_id: Some(component.id),
        file_id: file_path.as_deref().and_then(|p| file_ids.get(p).copied()),
        scanner: scanner.to_string(),
        fingerprint: fingerprint(
            &rule_id,
            file_path.as_deref(),
            raw.line_start,
            line_end,
            raw.code_snippet.as_deref(),
        ),
        rule_id: Some(rule_id),
        severity: Severity::normalize(&raw.severity),
        category: raw.category.clone(),
        title,
        description: raw.description.clone(),
        file_path,
        line_start: raw.line_start,
        line_end,
        code_snippet: raw.code_snippet.clone(),
        suggestion: raw.suggestion.clone(),
        llm_explanation: None,
    }
}
