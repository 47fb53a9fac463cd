//! Lenient extraction of JSON objects from model replies.
//!
//! Models wrap JSON in markdown fences, prepend prose, leave trailing commas
//! and sometimes bold their keys (`**"key**":`). A strict parse is tried
//! first; the cleanup pass only runs when it fails.

use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseMethod {
    Direct,
    Sanitized,
}

/// The first JSON object in `text`, if one can be recovered.
pub fn extract_json(text: &str) -> Option<(Value, ParseMethod)> {
    let body = strip_fences(text);
    let candidate = object_span(body).unwrap_or(body);

    if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(candidate) {
        return Some((value, ParseMethod::Direct));
    }

    let cleaned = remove_trailing_commas(&candidate.replace("**", ""));
    match serde_json::from_str::<Value>(&cleaned) {
        Ok(value @ Value::Object(_)) => Some((value, ParseMethod::Sanitized)),
        _ => None,
    }
}

fn strip_fences(text: &str) -> &str {
    let Some(start) = text.find("```") else {
        return text.trim();
    };
    let after = &text[start + 3..];
    // Skip the info string (`json`, `JSON`, ...) up to the end of the line.
    let after = match after.find('\n') {
        Some(nl) if after[..nl].chars().all(|c| c.is_ascii_alphanumeric()) => &after[nl + 1..],
        _ => after,
    };
    match after.find("```") {
        Some(end) => after[..end].trim(),
        None => after.trim(),
    }
}

fn object_span(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

/// Drops commas that directly precede `}` or `]`, ignoring string contents.
fn remove_trailing_commas(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escaped = false;

    for (i, &c) in chars.iter().enumerate() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            ',' => {
                let next = chars[i + 1..].iter().find(|n| !n.is_whitespace());
                if !matches!(next, Some('}') | Some(']')) {
                    out.push(c);
                }
            }
            _ => out.push(c),
        }
    }
    out
}

/// Severity arrives as free text; `line_hint` is either a number or a pattern.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LlmIssue {
    pub severity: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub line_hint: Option<Value>,
    #[serde(alias = "suggestion")]
    pub recommendation: Option<String>,
}

impl LlmIssue {
    pub fn line(&self) -> Option<u32> {
        match self.line_hint.as_ref()? {
            Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
            Value::String(s) => s
                .split(|c: char| !c.is_ascii_digit())
                .find(|part| !part.is_empty())
                .and_then(|digits| digits.parse().ok()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FileAnalysis {
    pub summary: String,
    pub purpose: Option<String>,
    pub complexity: Option<String>,
    pub security_issues: Vec<LlmIssue>,
    pub quality_issues: Vec<LlmIssue>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ComponentAnalysis {
    pub summary: String,
    pub security_posture: Option<String>,
    pub recommendations: Vec<String>,
}

pub fn parse_file_analysis(text: &str) -> Option<FileAnalysis> {
    let (value, _) = extract_json(text)?;
    serde_json::from_value(value).ok()
}

pub fn parse_component_analysis(text: &str) -> Option<ComponentAnalysis> {
    let (value, _) = extract_json(text)?;
    serde_json::from_value(value).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bold_keys_are_repaired() {
        let reply = r#"
{
  **"purpose**": "fine-tune model",
  "summary": "Trains a model.",
  "security_issues": [],
  "quality_issues": []
}
"#;
        let (value, method) = extract_json(reply).unwrap();
        assert_eq!(value["purpose"], "fine-tune model");
        assert_eq!(method, ParseMethod::Sanitized);
    }

    #[test]
    fn fences_and_trailing_commas() {
        let reply = "Here you go:\n```json\n{\n  \"summary\": \"Valid JSON after cleanup.\",\n  \"security_issues\": [],\n}\n```\n";
        let (value, method) = extract_json(reply).unwrap();
        assert_eq!(value["summary"], "Valid JSON after cleanup.");
        assert_eq!(method, ParseMethod::Sanitized);
    }

    #[test]
    fn inline_object_between_prose() {
        let reply = r#"prefix {"summary":"ok","security_issues":[]} suffix"#;
        let (value, method) = extract_json(reply).unwrap();
        assert_eq!(value["summary"], "ok");
        assert_eq!(method, ParseMethod::Direct);
    }

    #[test]
    fn commas_inside_strings_survive() {
        let cleaned = remove_trailing_commas(r#"{"a": "x, }", "b": [1, 2,],}"#);
        assert_eq!(cleaned, r#"{"a": "x, }", "b": [1, 2]}"#);
    }

    #[test]
    fn garbage_yields_none() {
        assert!(extract_json("I could not analyze this file.").is_none());
        assert!(extract_json("[1, 2, 3]").is_none());
    }

    #[test]
    fn file_analysis_defaults_missing_lists() {
        let analysis = parse_file_analysis(
            r#"{"summary": "Parses config", "security_issues": [
                {"severity": "HIGH", "title": "Hardcoded key", "line_hint": "line 12: KEY = ...",
                 "recommendation": "Load from env"}
            ]}"#,
        )
        .unwrap();
        assert_eq!(analysis.summary, "Parses config");
        assert!(analysis.quality_issues.is_empty());
        let issue = &analysis.security_issues[0];
        assert_eq!(issue.line(), Some(12));
        assert_eq!(issue.recommendation.as_deref(), Some("Load from env"));
    }

    #[test]
    fn numeric_line_hint() {
        let issue: LlmIssue = serde_json::from_str(r#"{"line_hint": 7}"#).unwrap();
        assert_eq!(issue.line(), Some(7));
        let issue: LlmIssue = serde_json::from_str(r#"{"line_hint": "eval(user_input)"}"#).unwrap();
        assert_eq!(issue.line(), None);
    }
}
