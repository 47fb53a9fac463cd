//! Prompt builders for the three kinds of queued work.

use crate::model::{Component, FindingsSummary, Job};

use super::Prompt;

const TRUNCATION_MARKER: &str = "\n\n... [TRUNCATED - file too large] ...";

const FILE_SYSTEM: &str = "You are an expert code security analyst and software engineer.
Analyze the provided code thoroughly for:
1. Security vulnerabilities (injection, auth issues, data exposure, etc.)
2. Code quality issues (complexity, maintainability, error handling)
3. Performance concerns
4. Best practice violations

Be specific and actionable. Focus on real issues, not stylistic preferences.
Always respond with valid JSON.";

const FILE_SCHEMA: &str = r#"{
    "summary": "Brief 1-2 sentence description of what this file does",
    "purpose": "Main responsibility/purpose of this code",
    "complexity": "low|medium|high",
    "security_issues": [
        {
            "severity": "critical|high|medium|low",
            "title": "Issue title",
            "description": "Detailed description",
            "line_hint": "approximate line or code pattern",
            "recommendation": "How to fix it"
        }
    ],
    "quality_issues": [
        {
            "severity": "high|medium|low",
            "title": "Issue title",
            "description": "Detailed description",
            "recommendation": "How to fix it"
        }
    ]
}"#;

const COMPONENT_SYSTEM: &str = "You are an expert software architect.
Analyze the component structure and provide high-level insights.
Focus on architecture, security posture, and overall code health.
Always respond with valid JSON.";

const EXECUTIVE_SYSTEM: &str = "You are a security consultant writing an executive summary for a \
codebase analysis report. Be professional and concise.";

/// Cuts `code` to at most `max_chars` characters, marking the cut.
pub fn truncate_code(code: &str, max_chars: usize) -> String {
    match code.char_indices().nth(max_chars) {
        Some((end, _)) => format!("{}{TRUNCATION_MARKER}", &code[..end]),
        None => code.to_string(),
    }
}

pub fn file_prompt(model: &str, path: &str, language: &str, code: &str, max_chars: usize) -> Prompt {
    let code = truncate_code(code, max_chars);
    Prompt {
        model: model.to_string(),
        system: FILE_SYSTEM.to_string(),
        user: format!(
            "Analyze this {language} file: `{path}`\n\n```{language}\n{code}\n```\n\n\
             Respond with JSON in this exact format:\n{FILE_SCHEMA}"
        ),
    }
}

pub fn component_prompt(model: &str, component: &Component, file_summaries: &[(String, String)]) -> Prompt {
    let files: Vec<String> = file_summaries
        .iter()
        .take(20)
        .map(|(path, summary)| format!("- {path}: {summary}"))
        .collect();
    let language = component.language.as_deref().unwrap_or("mixed");
    Prompt {
        model: model.to_string(),
        system: COMPONENT_SYSTEM.to_string(),
        user: format!(
            "Analyze this {language} component: `{}` at path `{}`\n\n\
             Files in this component:\n{}\n\nTotal files: {}\n\n\
             Respond with JSON:\n{{\n    \"summary\": \"2-3 sentence description of this component's purpose\",\n    \
             \"security_posture\": \"Brief assessment of security practices\",\n    \
             \"recommendations\": [\"prioritized list of improvements\"]\n}}",
            component.name,
            component.path,
            files.join("\n"),
            file_summaries.len(),
        ),
    }
}

pub fn executive_prompt(job: &Job, summary: &FindingsSummary, components: &[Component]) -> Prompt {
    let lines: Vec<String> = components
        .iter()
        .take(10)
        .map(|c| {
            let text = c.analysis_summary.as_deref().unwrap_or("No summary");
            let short: String = text.chars().take(100).collect();
            format!("- {}: {short}", c.name)
        })
        .collect();
    let components_text = if lines.is_empty() {
        "No components analyzed".to_string()
    } else {
        lines.join("\n")
    };
    Prompt {
        model: job.model.clone(),
        system: EXECUTIVE_SYSTEM.to_string(),
        user: format!(
            "Write an executive summary for this codebase analysis:\n\n\
             Analysis: {}\nRepository: {}\n\n\
             Findings Summary:\n- Critical: {}\n- High: {}\n- Medium: {}\n- Low: {}\n- Info: {}\n- Total: {}\n\n\
             Components Analyzed:\n{components_text}\n\n\
             Write a 2-3 paragraph executive summary covering:\n\
             1. Overall security posture\n2. Key concerns requiring immediate attention\n3. General recommendations\n\n\
             Keep it professional and actionable.",
            job.name,
            job.repo_url,
            summary.critical,
            summary.high,
            summary.medium,
            summary.low,
            summary.info,
            summary.total,
        ),
    }
}
