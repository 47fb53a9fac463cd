use bullseye::{Finding, FindingsSummary, Job, JobEvent};

pub struct AnalysisOutput<'a> {
    pub job: &'a Job,
    pub summary: &'a FindingsSummary,
    pub findings: &'a [Finding],
    /// Stored report document, when the job produced one.
    pub report: Option<&'a str>,
}

pub trait OutputFormatter {
    fn write_results(&self, output: &AnalysisOutput, writer: &mut dyn std::io::Write) -> std::io::Result<()>;
}

pub struct TextOutput;

impl OutputFormatter for TextOutput {
    fn write_results(&self, output: &AnalysisOutput, writer: &mut dyn std::io::Write) -> std::io::Result<()> {
        let job = output.job;
        writeln!(writer, "{} ({})", job.name, job.repo_url)?;
        writeln!(writer, "  status: {}", job.status)?;
        if let Some(commit) = &job.commit_hash {
            writeln!(writer, "  commit: {commit}")?;
        }
        if let Some(error) = &job.error_message {
            writeln!(writer, "  error: {error}")?;
        }

        let s = output.summary;
        writeln!(
            writer,
            "  findings: {} (critical {}, high {}, medium {}, low {}, info {})",
            s.total, s.critical, s.high, s.medium, s.low, s.info
        )?;
        writeln!(writer, "  health: {}", s.health_score())?;

        for finding in output.findings {
            let location = match (finding.file_path.as_deref(), finding.line_start) {
                (Some(path), Some(line)) => format!("{path}:{line}"),
                (Some(path), None) => path.to_string(),
                _ => "-".to_string(),
            };
            writeln!(
                writer,
                "  [{}] {} {} ({})",
                finding.severity, finding.title, location, finding.scanner
            )?;
        }
        Ok(())
    }
}

pub struct JsonOutput;

impl OutputFormatter for JsonOutput {
    fn write_results(&self, output: &AnalysisOutput, writer: &mut dyn std::io::Write) -> std::io::Result<()> {
        match output.report {
            Some(report) => writer.write_all(report.as_bytes())?,
            None => {
                let fallback = serde_json::json!({
                    "job": output.job,
                    "summary": output.summary,
                    "findings": output.findings,
                });
                serde_json::to_writer_pretty(&mut *writer, &fallback)?;
            }
        }
        writeln!(writer)?;
        Ok(())
    }
}

pub fn formatter(json: bool) -> Box<dyn OutputFormatter> {
    if json { Box::new(JsonOutput) } else { Box::new(TextOutput) }
}

/// One line of live progress.
pub fn progress_line(event: &JobEvent) -> String {
    let mut line = format!("[{:>3}%] {}", event.progress, event.status);
    if let Some(message) = &event.message {
        line.push_str(": ");
        line.push_str(message);
    }
    if let Some(detail) = &event.detail {
        line.push_str(&format!(" ({detail})"));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use bullseye::JobStatus;

    fn event(progress: u32, message: Option<&str>, detail: Option<&str>) -> JobEvent {
        serde_json::from_value(serde_json::json!({
            "job_id": "00000000-0000-0000-0000-000000000001",
            "seq": 3,
            "status": "analyzing",
            "progress": progress,
            "message": message,
            "detail": detail,
            "timestamp": "2026-01-01T00:00:00Z",
        }))
        .unwrap()
    }

    #[test]
    fn progress_line_includes_detail() {
        let line = progress_line(&event(52, Some("Analyzing code with LLM"), Some("lane 0")));
        assert_eq!(line, "[ 52%] analyzing: Analyzing code with LLM (lane 0)");
    }

    #[test]
    fn progress_line_without_message() {
        let e = event(7, None, None);
        assert_eq!(e.status, JobStatus::Analyzing);
        assert_eq!(progress_line(&e), "[  7%] analyzing");
    }
}
