//! Extracting SQL from model replies.
//!
//! Models answer either with the requested JSON object (SQL plus a
//! self-assessed classification) or with a markdown code block.

use serde::Deserialize;

use crate::safety::{Classification, OperationKind, RiskLevel};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedResponse {
    /// Explanation or any text around the SQL.
    pub text: String,
    pub sql: Option<String>,
    /// The model's own classification, when it gave a valid one.
    pub reported: Option<Classification>,
}

impl ParsedResponse {
    pub fn text_only(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            sql: None,
            reported: None,
        }
    }

    pub fn with_sql(text: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            sql: Some(sql.into()),
            reported: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct JsonAnswer {
    sql: String,
    #[serde(default)]
    query_type: Option<String>,
    #[serde(default)]
    risk_level: Option<String>,
    #[serde(default)]
    explanation: String,
}

/// Parses an LLM response into SQL, explanation and self-reported class.
///
/// Tried in order: a JSON object (bare or in a ```json block), a ```sql
/// block, then a bare ``` block. Anything else is text only.
pub fn parse_llm_response(response: &str) -> ParsedResponse {
    if let Some(parsed) = parse_json_answer(response) {
        return parsed;
    }

    if let Some(sql) = extract_code_block(response, "sql") {
        let text = remove_code_block(response, "sql");
        return ParsedResponse::with_sql(text.trim(), sql.trim());
    }

    if let Some(sql) = extract_code_block(response, "") {
        let text = remove_code_block(response, "");
        return ParsedResponse::with_sql(text.trim(), sql.trim());
    }

    ParsedResponse::text_only(response.trim())
}

fn parse_json_answer(response: &str) -> Option<ParsedResponse> {
    let candidate = extract_code_block(response, "json").unwrap_or_else(|| {
        let start = response.find('{');
        let end = response.rfind('}');
        match (start, end) {
            (Some(s), Some(e)) if e > s => response[s..=e].to_string(),
            _ => String::new(),
        }
    });

    let answer: JsonAnswer = serde_json::from_str(candidate.trim()).ok()?;
    if answer.sql.trim().is_empty() {
        return None;
    }

    let reported = match (answer.query_type, answer.risk_level) {
        (Some(kind), Some(risk)) => match (kind.parse::<OperationKind>(), risk.parse::<RiskLevel>()) {
            (Ok(kind), Ok(risk)) => Some(Classification::new(kind, risk)),
            _ => None,
        },
        _ => None,
    };

    Some(ParsedResponse {
        text: answer.explanation.trim().to_string(),
        sql: Some(answer.sql.trim().to_string()),
        reported,
    })
}

/// Extracts the first fenced block tagged `lang`; an empty `lang` matches
/// only untagged fences.
fn extract_code_block(text: &str, lang: &str) -> Option<String> {
    let (_, content_start) = find_fence(text, lang)?;
    let end_idx = text[content_start..].find("```")?;
    Some(text[content_start..content_start + end_idx].to_string())
}

/// Returns (fence start, content start) of the first matching fence.
fn find_fence(text: &str, lang: &str) -> Option<(usize, usize)> {
    let start_pattern = format!("```{}", lang);
    let mut search_from = 0;

    while let Some(offset) = text[search_from..].find(&start_pattern) {
        let start_idx = search_from + offset;
        let after = start_idx + start_pattern.len();
        let newline = text[after..].find('\n')? + after;
        let tag = text[start_idx + 3..newline].trim();

        if tag.eq_ignore_ascii_case(lang) {
            return Some((start_idx, newline + 1));
        }
        // Skip the whole non-matching block so its closing fence is not
        // mistaken for an opening one.
        let close = text[newline..].find("```")? + newline;
        search_from = close + 3;
    }
    None
}

fn remove_code_block(text: &str, lang: &str) -> String {
    let Some((start_idx, content_start)) = find_fence(text, lang) else {
        return text.to_string();
    };
    let Some(end_offset) = text[content_start..].find("```") else {
        return text.to_string();
    };
    let end_idx = content_start + end_offset + 3;

    let before = text[..start_idx].trim_end();
    let after = text[end_idx..].trim_start();
    match (before.is_empty(), after.is_empty()) {
        (true, _) => after.to_string(),
        (_, true) => before.to_string(),
        _ => format!("{before}\n\n{after}"),
    }
}
