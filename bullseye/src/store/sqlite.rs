use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use tracing::{debug, instrument};
use uuid::Uuid;

use super::Store;
use crate::error::{Error, Result};
use crate::model::{
    Component, ComponentStatus, DetectedComponent, FileStatus, Finding, FindingFilter,
    FindingsSummary, Job, JobCounts, JobStatus, NewFinding, NewJob, Page, Report, ScannerResult,
    ScannerStatus, Severity, SourceFile, Stats, StatusUpdate, Transition,
};

#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Opens (creating if needed) a database file in WAL mode and applies migrations.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(30));
        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        Self::migrate(pool).await
    }

    /// A private in-memory database on a single long-lived connection.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Self::migrate(pool).await
    }

    async fn migrate(pool: SqlitePool) -> Result<Self> {
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn uuid_col(row: &SqliteRow, col: &str) -> Result<Uuid> {
    let raw: String = row.try_get(col)?;
    Uuid::parse_str(&raw).map_err(|e| Error::Other(anyhow!("invalid uuid in {col}: {e}")))
}

fn opt_uuid_col(row: &SqliteRow, col: &str) -> Result<Option<Uuid>> {
    let raw: Option<String> = row.try_get(col)?;
    raw.map(|r| Uuid::parse_str(&r).map_err(|e| Error::Other(anyhow!("invalid uuid in {col}: {e}"))))
        .transpose()
}

fn u32_col(row: &SqliteRow, col: &str) -> Result<u32> {
    let raw: i64 = row.try_get(col)?;
    Ok(u32::try_from(raw.max(0)).unwrap_or(u32::MAX))
}

fn opt_u32_col(row: &SqliteRow, col: &str) -> Result<Option<u32>> {
    let raw: Option<i64> = row.try_get(col)?;
    Ok(raw.map(|v| u32::try_from(v.max(0)).unwrap_or(u32::MAX)))
}

fn u64_col(row: &SqliteRow, col: &str) -> Result<u64> {
    let raw: i64 = row.try_get(col)?;
    Ok(raw.max(0) as u64)
}

fn map_job(row: &SqliteRow) -> Result<Job> {
    let status: String = row.try_get("status")?;
    let config: String = row.try_get("config")?;
    Ok(Job {
        id: uuid_col(row, "id")?,
        name: row.try_get("name")?,
        repo_url: row.try_get("repo_url")?,
        branch: row.try_get("branch")?,
        commit_hash: row.try_get("commit_hash")?,
        status: status.parse()?,
        status_message: row.try_get("status_message")?,
        progress: u32_col(row, "progress")?,
        progress_total: u32_col(row, "progress_total")?,
        progress_detail: row.try_get("progress_detail")?,
        model: row.try_get("model")?,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        error_message: row.try_get("error_message")?,
        config: serde_json::from_str(&config).context("invalid job config JSON")?,
    })
}

fn map_component(row: &SqliteRow) -> Result<Component> {
    let status: String = row.try_get("status")?;
    Ok(Component {
        id: uuid_col(row, "id")?,
        job_id: uuid_col(row, "job_id")?,
        name: row.try_get("name")?,
        path: row.try_get("path")?,
        component_type: row.try_get("component_type")?,
        language: row.try_get("language")?,
        file_count: u32_col(row, "file_count")?,
        line_count: u64_col(row, "line_count")?,
        status: status.parse()?,
        findings_count: u32_col(row, "findings_count")?,
        health_score: opt_u32_col(row, "health_score")?,
        analysis_summary: row.try_get("analysis_summary")?,
    })
}

fn map_file(row: &SqliteRow) -> Result<SourceFile> {
    let status: String = row.try_get("status")?;
    Ok(SourceFile {
        id: uuid_col(row, "id")?,
        component_id: uuid_col(row, "component_id")?,
        job_id: uuid_col(row, "job_id")?,
        path: row.try_get("path")?,
        language: row.try_get("language")?,
        size_bytes: u64_col(row, "size_bytes")?,
        line_count: u64_col(row, "line_count")?,
        status: status.parse()?,
        analysis_summary: row.try_get("analysis_summary")?,
    })
}

fn map_finding(row: &SqliteRow) -> Result<Finding> {
    let severity: String = row.try_get("severity")?;
    Ok(Finding {
        id: uuid_col(row, "id")?,
        job_id: uuid_col(row, "job_id")?,
        component_id: opt_uuid_col(row, "component_id")?,
        file_id: opt_uuid_col(row, "file_id")?,
        scanner: row.try_get("scanner")?,
        rule_id: row.try_get("rule_id")?,
        severity: severity.parse()?,
        category: row.try_get("category")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        file_path: row.try_get("file_path")?,
        line_start: opt_u32_col(row, "line_start")?,
        line_end: opt_u32_col(row, "line_end")?,
        code_snippet: row.try_get("code_snippet")?,
        suggestion: row.try_get("suggestion")?,
        llm_explanation: row.try_get("llm_explanation")?,
        fingerprint: row.try_get("fingerprint")?,
        created_at: row.try_get("created_at")?,
    })
}

fn map_scanner_result(row: &SqliteRow) -> Result<ScannerResult> {
    let status: String = row.try_get("status")?;
    Ok(ScannerResult {
        id: uuid_col(row, "id")?,
        job_id: uuid_col(row, "job_id")?,
        component_id: opt_uuid_col(row, "component_id")?,
        scanner: row.try_get("scanner")?,
        status: status.parse()?,
        findings_count: u32_col(row, "findings_count")?,
        raw_output: row.try_get("raw_output")?,
        error_message: row.try_get("error_message")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

fn map_status_update(row: &SqliteRow) -> Result<StatusUpdate> {
    let status: String = row.try_get("status")?;
    Ok(StatusUpdate {
        seq: row.try_get("seq")?,
        job_id: uuid_col(row, "job_id")?,
        status: status.parse()?,
        message: row.try_get("message")?,
        progress: u32_col(row, "progress")?,
        detail: row.try_get("detail")?,
        timestamp: row.try_get("timestamp")?,
    })
}

fn map_report(row: &SqliteRow) -> Result<Report> {
    Ok(Report {
        id: uuid_col(row, "id")?,
        job_id: uuid_col(row, "job_id")?,
        report_type: row.try_get("report_type")?,
        format: row.try_get("format")?,
        content: row.try_get("content")?,
        created_at: row.try_get("created_at")?,
    })
}

fn summary_from_rows(rows: &[SqliteRow]) -> Result<FindingsSummary> {
    let mut summary = FindingsSummary::default();
    for row in rows {
        let severity: String = row.try_get("severity")?;
        let count = u32_col(row, "count")?;
        summary.add(severity.parse::<Severity>()?, count);
    }
    Ok(summary)
}

/// Statuses from which `next` may be entered, as a JSON array for `json_each`.
fn predecessors_json(next: JobStatus) -> String {
    let allowed: Vec<&str> = JobStatus::ALL
        .iter()
        .filter(|s| s.can_transition_to(next))
        .map(|s| s.as_str())
        .collect();
    serde_json::Value::from(allowed).to_string()
}

const JOB_COLUMNS: &str = "id, name, repo_url, branch, commit_hash, status, status_message, \
     progress, progress_total, progress_detail, model, created_at, started_at, completed_at, \
     error_message, config";

#[async_trait]
impl Store for SqliteStore {
    #[instrument(skip(self, job), fields(repo = %job.repo_url))]
    async fn create_job(&self, job: NewJob) -> Result<(Job, StatusUpdate)> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let message = format!("Job created: {}", job.name);
        let mut tx = self.pool().begin().await?;

        sqlx::query(
            r#"
            INSERT INTO jobs (id, name, repo_url, branch, model, config, status, status_message,
                              progress, progress_total, created_at)
            VALUES (?, ?, ?, ?, ?, ?, 'pending', ?, 0, 100, ?)
            "#,
        )
        .bind(id.to_string())
        .bind(&job.name)
        .bind(&job.repo_url)
        .bind(&job.branch)
        .bind(&job.model)
        .bind(job.config.to_string())
        .bind(&message)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let seq = sqlx::query(
            r#"
            INSERT INTO status_updates (job_id, status, message, progress, detail, timestamp)
            VALUES (?, 'pending', ?, 0, NULL, ?)
            "#,
        )
        .bind(id.to_string())
        .bind(&message)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?"))
            .bind(id.to_string())
            .fetch_one(&mut *tx)
            .await?;
        let created = map_job(&row)?;
        tx.commit().await?;

        let update = StatusUpdate {
            seq,
            job_id: id,
            status: JobStatus::Pending,
            message,
            progress: 0,
            detail: None,
            timestamp: now,
        };
        Ok((created, update))
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(self.pool())
            .await?;
        row.as_ref().map(map_job).transpose()
    }

    async fn list_jobs(&self, status: Option<JobStatus>, page: Page) -> Result<Vec<Job>> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs \
             WHERE (?1 IS NULL OR status = ?1) \
             ORDER BY created_at DESC LIMIT ?2 OFFSET ?3"
        ))
        .bind(status.map(|s| s.as_str()))
        .bind(i64::from(page.limit))
        .bind(i64::from(page.offset))
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(map_job).collect()
    }

    #[instrument(skip(self, transition), fields(status = %transition.status, progress = transition.progress))]
    async fn record_transition(&self, job_id: Uuid, transition: &Transition) -> Result<StatusUpdate> {
        let now = Utc::now();
        let started_at: Option<DateTime<Utc>> =
            (transition.status == JobStatus::Cloning).then_some(now);
        let completed_at: Option<DateTime<Utc>> =
            transition.status.is_terminal().then_some(now);

        let mut tx = self.pool().begin().await?;

        // Write first so the transaction takes the write lock up front.
        let updated = sqlx::query(
            r#"
            UPDATE jobs
            SET status = ?,
                status_message = ?,
                progress = ?,
                progress_detail = COALESCE(?, progress_detail),
                error_message = COALESCE(?, error_message),
                started_at = COALESCE(started_at, ?),
                completed_at = COALESCE(completed_at, ?)
            WHERE id = ? AND status IN (SELECT value FROM json_each(?))
            "#,
        )
        .bind(transition.status.as_str())
        .bind(&transition.message)
        .bind(i64::from(transition.progress))
        .bind(transition.detail.as_deref())
        .bind(transition.error.as_deref())
        .bind(started_at)
        .bind(completed_at)
        .bind(job_id.to_string())
        .bind(predecessors_json(transition.status))
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            let current: Option<String> = sqlx::query_scalar("SELECT status FROM jobs WHERE id = ?")
                .bind(job_id.to_string())
                .fetch_optional(&mut *tx)
                .await?;
            tx.rollback().await?;
            return Err(match current {
                None => Error::NotFound(format!("job {job_id}")),
                Some(current) => Error::Conflict(format!(
                    "job {job_id} cannot move from {current} to {}",
                    transition.status
                )),
            });
        }

        let seq = sqlx::query(
            r#"
            INSERT INTO status_updates (job_id, status, message, progress, detail, timestamp)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(job_id.to_string())
        .bind(transition.status.as_str())
        .bind(&transition.message)
        .bind(i64::from(transition.progress))
        .bind(transition.detail.as_deref())
        .bind(now)
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        tx.commit().await?;
        debug!(job_id = %job_id, seq, "transition committed");

        Ok(StatusUpdate {
            seq,
            job_id,
            status: transition.status,
            message: transition.message.clone(),
            progress: transition.progress,
            detail: transition.detail.clone(),
            timestamp: now,
        })
    }

    async fn set_commit(&self, job_id: Uuid, commit_hash: &str) -> Result<()> {
        sqlx::query("UPDATE jobs SET commit_hash = ? WHERE id = ?")
            .bind(commit_hash)
            .bind(job_id.to_string())
            .execute(self.pool())
            .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_job(&self, job_id: Uuid) -> Result<bool> {
        let id = job_id.to_string();
        let mut tx = self.pool().begin().await?;
        for table in ["status_updates", "reports", "scanner_results", "findings", "files", "components"] {
            sqlx::query(&format!("DELETE FROM {table} WHERE job_id = ?"))
                .bind(&id)
                .execute(&mut *tx)
                .await?;
        }
        let deleted = sqlx::query("DELETE FROM jobs WHERE id = ?")
            .bind(&id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        Ok(deleted > 0)
    }

    #[instrument(skip(self))]
    async fn abandon_open_work(&self, job_id: Uuid, reason: &str) -> Result<u64> {
        let id = job_id.to_string();
        let mut tx = self.pool().begin().await?;
        let mut touched = sqlx::query(
            r#"
            UPDATE scanner_results
            SET status = 'failed', error_message = COALESCE(error_message, ?), completed_at = ?
            WHERE job_id = ? AND status = 'running'
            "#,
        )
        .bind(reason)
        .bind(Utc::now())
        .bind(&id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        touched += sqlx::query("UPDATE files SET status = 'skipped' WHERE job_id = ? AND status = 'pending'")
            .bind(&id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        touched += sqlx::query(
            "UPDATE components SET status = 'failed' WHERE job_id = ? AND status IN ('scanning', 'analyzing')",
        )
        .bind(&id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        tx.commit().await?;
        debug!(job_id = %job_id, touched, "open work abandoned");
        Ok(touched)
    }

    async fn unfinished_jobs(&self) -> Result<Vec<Job>> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs \
             WHERE status NOT IN ('completed', 'failed', 'cancelled') ORDER BY created_at"
        ))
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(map_job).collect()
    }

    #[instrument(skip(self, components), fields(count = components.len()))]
    async fn insert_components(
        &self,
        job_id: Uuid,
        components: &[DetectedComponent],
    ) -> Result<Vec<(Component, Vec<SourceFile>)>> {
        let mut tx = self.pool().begin().await?;
        let mut inserted = Vec::with_capacity(components.len());

        for detected in components {
            let component = Component {
                id: Uuid::new_v4(),
                job_id,
                name: detected.name.clone(),
                path: detected.path.clone(),
                component_type: detected.component_type.clone(),
                language: Some(detected.language.clone()),
                file_count: u32::try_from(detected.files.len()).unwrap_or(u32::MAX),
                line_count: detected.line_count,
                status: ComponentStatus::Pending,
                findings_count: 0,
                health_score: None,
                analysis_summary: None,
            };
            sqlx::query(
                r#"
                INSERT INTO components (id, job_id, name, path, component_type, language,
                                        file_count, line_count, status)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(component.id.to_string())
            .bind(job_id.to_string())
            .bind(&component.name)
            .bind(&component.path)
            .bind(&component.component_type)
            .bind(component.language.as_deref())
            .bind(i64::from(component.file_count))
            .bind(i64::try_from(component.line_count).unwrap_or(i64::MAX))
            .bind(component.status.as_str())
            .execute(&mut *tx)
            .await?;

            let mut files = Vec::with_capacity(detected.files.len());
            for detected_file in &detected.files {
                let file = SourceFile {
                    id: Uuid::new_v4(),
                    component_id: component.id,
                    job_id,
                    path: detected_file.path.clone(),
                    language: Some(detected_file.language.clone()),
                    size_bytes: detected_file.size_bytes,
                    line_count: detected_file.line_count,
                    status: FileStatus::Pending,
                    analysis_summary: None,
                };
                sqlx::query(
                    r#"
                    INSERT INTO files (id, component_id, job_id, path, language, size_bytes,
                                       line_count, status)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(file.id.to_string())
                .bind(component.id.to_string())
                .bind(job_id.to_string())
                .bind(&file.path)
                .bind(file.language.as_deref())
                .bind(i64::try_from(file.size_bytes).unwrap_or(i64::MAX))
                .bind(i64::try_from(file.line_count).unwrap_or(i64::MAX))
                .bind(file.status.as_str())
                .execute(&mut *tx)
                .await?;
                files.push(file);
            }
            inserted.push((component, files));
        }

        tx.commit().await?;
        Ok(inserted)
    }

    async fn list_components(&self, job_id: Uuid) -> Result<Vec<Component>> {
        let rows = sqlx::query("SELECT * FROM components WHERE job_id = ? ORDER BY path")
            .bind(job_id.to_string())
            .fetch_all(self.pool())
            .await?;
        rows.iter().map(map_component).collect()
    }

    async fn list_files(&self, component_id: Uuid) -> Result<Vec<SourceFile>> {
        let rows = sqlx::query("SELECT * FROM files WHERE component_id = ? ORDER BY path")
            .bind(component_id.to_string())
            .fetch_all(self.pool())
            .await?;
        rows.iter().map(map_file).collect()
    }

    async fn set_component_status(&self, component_id: Uuid, status: ComponentStatus) -> Result<()> {
        sqlx::query("UPDATE components SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(component_id.to_string())
            .execute(self.pool())
            .await?;
        Ok(())
    }

    async fn set_component_health(
        &self,
        component_id: Uuid,
        findings_count: u32,
        health_score: u32,
    ) -> Result<()> {
        sqlx::query("UPDATE components SET findings_count = ?, health_score = ? WHERE id = ?")
            .bind(i64::from(findings_count))
            .bind(i64::from(health_score))
            .bind(component_id.to_string())
            .execute(self.pool())
            .await?;
        Ok(())
    }

    async fn set_component_summary(&self, component_id: Uuid, summary: &str) -> Result<()> {
        sqlx::query("UPDATE components SET analysis_summary = ? WHERE id = ?")
            .bind(summary)
            .bind(component_id.to_string())
            .execute(self.pool())
            .await?;
        Ok(())
    }

    async fn set_file_status(
        &self,
        file_id: Uuid,
        status: FileStatus,
        summary: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE files SET status = ?, analysis_summary = COALESCE(?, analysis_summary) WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(summary)
        .bind(file_id.to_string())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn insert_finding(&self, job_id: Uuid, finding: &NewFinding) -> Result<bool> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO findings (
                id, job_id, component_id, file_id, scanner, rule_id, severity, category, title,
                description, file_path, line_start, line_end, code_snippet, suggestion,
                llm_explanation, fingerprint, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (job_id, fingerprint) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(job_id.to_string())
        .bind(finding.component_id.map(|id| id.to_string()))
        .bind(finding.file_id.map(|id| id.to_string()))
        .bind(&finding.scanner)
        .bind(finding.rule_id.as_deref())
        .bind(finding.severity.as_str())
        .bind(finding.category.as_deref())
        .bind(&finding.title)
        .bind(finding.description.as_deref())
        .bind(finding.file_path.as_deref())
        .bind(finding.line_start.map(i64::from))
        .bind(finding.line_end.map(i64::from))
        .bind(finding.code_snippet.as_deref())
        .bind(finding.suggestion.as_deref())
        .bind(finding.llm_explanation.as_deref())
        .bind(&finding.fingerprint)
        .bind(Utc::now())
        .execute(self.pool())
        .await?
        .rows_affected();
        Ok(inserted == 1)
    }

    async fn list_findings(&self, job_id: Uuid, filter: &FindingFilter) -> Result<Vec<Finding>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM findings
            WHERE job_id = ?1
              AND (?2 IS NULL OR severity = ?2)
              AND (?3 IS NULL OR scanner = ?3)
              AND (?4 IS NULL OR component_id = ?4)
            ORDER BY CASE severity
                WHEN 'critical' THEN 1
                WHEN 'high' THEN 2
                WHEN 'medium' THEN 3
                WHEN 'low' THEN 4
                ELSE 5
            END, created_at, id
            "#,
        )
        .bind(job_id.to_string())
        .bind(filter.severity.map(|s| s.as_str()))
        .bind(filter.scanner.as_deref())
        .bind(filter.component_id.map(|id| id.to_string()))
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(map_finding).collect()
    }

    async fn findings_summary(&self, job_id: Uuid) -> Result<FindingsSummary> {
        let rows = sqlx::query(
            "SELECT severity, COUNT(*) AS count FROM findings WHERE job_id = ? GROUP BY severity",
        )
        .bind(job_id.to_string())
        .fetch_all(self.pool())
        .await?;
        summary_from_rows(&rows)
    }

    async fn component_findings_summary(&self, component_id: Uuid) -> Result<FindingsSummary> {
        let rows = sqlx::query(
            "SELECT severity, COUNT(*) AS count FROM findings WHERE component_id = ? GROUP BY severity",
        )
        .bind(component_id.to_string())
        .fetch_all(self.pool())
        .await?;
        summary_from_rows(&rows)
    }

    async fn start_scanner_result(
        &self,
        job_id: Uuid,
        component_id: Option<Uuid>,
        scanner: &str,
    ) -> Result<Uuid> {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO scanner_results (id, job_id, component_id, scanner, status, started_at)
            VALUES (?, ?, ?, ?, 'running', ?)
            "#,
        )
        .bind(id.to_string())
        .bind(job_id.to_string())
        .bind(component_id.map(|c| c.to_string()))
        .bind(scanner)
        .bind(Utc::now())
        .execute(self.pool())
        .await?;
        Ok(id)
    }

    async fn finish_scanner_result(
        &self,
        result_id: Uuid,
        status: ScannerStatus,
        findings_count: u32,
        raw_output: Option<&str>,
        error_message: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE scanner_results
            SET status = ?, findings_count = ?, raw_output = ?, error_message = ?, completed_at = ?
            WHERE id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(i64::from(findings_count))
        .bind(raw_output)
        .bind(error_message)
        .bind(Utc::now())
        .bind(result_id.to_string())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn list_scanner_results(&self, job_id: Uuid) -> Result<Vec<ScannerResult>> {
        let rows = sqlx::query("SELECT * FROM scanner_results WHERE job_id = ? ORDER BY started_at, scanner")
            .bind(job_id.to_string())
            .fetch_all(self.pool())
            .await?;
        rows.iter().map(map_scanner_result).collect()
    }

    async fn status_updates(&self, job_id: Uuid, page: Page) -> Result<Vec<StatusUpdate>> {
        let rows = sqlx::query(
            "SELECT * FROM status_updates WHERE job_id = ? ORDER BY seq LIMIT ? OFFSET ?",
        )
        .bind(job_id.to_string())
        .bind(i64::from(page.limit))
        .bind(i64::from(page.offset))
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(map_status_update).collect()
    }

    async fn save_report(
        &self,
        job_id: Uuid,
        report_type: &str,
        format: &str,
        content: &str,
    ) -> Result<Report> {
        let row = sqlx::query(
            r#"
            INSERT INTO reports (id, job_id, report_type, format, content, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(job_id.to_string())
        .bind(report_type)
        .bind(format)
        .bind(content)
        .bind(Utc::now())
        .fetch_one(self.pool())
        .await?;
        map_report(&row)
    }

    async fn get_report(&self, job_id: Uuid, report_type: &str) -> Result<Option<Report>> {
        let row = sqlx::query("SELECT * FROM reports WHERE job_id = ? AND report_type = ?")
            .bind(job_id.to_string())
            .bind(report_type)
            .fetch_optional(self.pool())
            .await?;
        row.as_ref().map(map_report).transpose()
    }

    async fn stats(&self) -> Result<Stats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS total,
                COALESCE(SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END), 0) AS completed,
                COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0) AS failed,
                COALESCE(SUM(CASE WHEN status = 'cancelled' THEN 1 ELSE 0 END), 0) AS cancelled
            FROM jobs
            "#,
        )
        .fetch_one(self.pool())
        .await?;
        let total = u32_col(&row, "total")?;
        let completed = u32_col(&row, "completed")?;
        let failed = u32_col(&row, "failed")?;
        let cancelled = u32_col(&row, "cancelled")?;

        let severity_rows =
            sqlx::query("SELECT severity, COUNT(*) AS count FROM findings GROUP BY severity")
                .fetch_all(self.pool())
                .await?;

        Ok(Stats {
            jobs: JobCounts {
                total,
                completed,
                failed,
                cancelled,
                running: total.saturating_sub(completed + failed + cancelled),
            },
            findings: summary_from_rows(&severity_rows)?,
        })
    }
}
