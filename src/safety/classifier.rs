//! Lexical SQL classification, impact estimation and validation.
//!
//! Classification is deliberately heuristic: the statement is never parsed
//! into an AST. Comments are removed with the sqlparser tokenizer (so comment
//! markers inside string literals survive) and the operative keyword plus a
//! handful of WHERE-clause patterns decide the outcome.

use std::sync::LazyLock;

use regex::Regex;
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::keywords::Keyword;
use sqlparser::tokenizer::{Location, Token, TokenWithLocation, Tokenizer, Whitespace};
use tracing::debug;

use super::{Classification, OperationKind, RiskLevel, ValidationReport};

const READ_KEYWORDS: &[&str] = &["SELECT", "SHOW", "DESCRIBE", "EXPLAIN"];
const ADMIN_KEYWORDS: &[&str] = &[
    "CREATE", "DROP", "ALTER", "GRANT", "REVOKE", "EXEC", "EXECUTE",
];

static LINE_COMMENT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"--[^\n]*").unwrap());

static BLOCK_COMMENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)/\*.*?\*/").unwrap());

/// Text after WHERE up to the next ORDER BY / GROUP BY / `;` / end.
static WHERE_CLAUSE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)^\s*(.+?)(?:\bORDER\s+BY\b|\bGROUP\s+BY\b|;|$)").unwrap()
});

static TAUTOLOGY_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b1\s*=\s*1\b").unwrap());

static BARE_NOT_NULL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\(?\s*[\w.]+\s+IS\s+NOT\s+NULL\s*\)?$").unwrap()
});

static BARE_POSITIVE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\(?\s*[\w.]+\s*>\s*0\s*\)?$").unwrap());

/// `=` not part of `>=`, `<=`, `!=`, compared against a quoted string or bare word/number.
static EQUALITY_LITERAL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?:^|[^<>!=])=\s*('[^']*'|"[^"]*"|[+-]?[\w.]+)"#).unwrap()
});

static TABLE_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\b(?:FROM|UPDATE|INTO|TABLE)\s+(?:IF\s+(?:NOT\s+)?EXISTS\s+)?("[^"]+"|[\w.]+)"#)
        .unwrap()
});

static STACKED_DROP_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r";\s*DROP\b").unwrap());

static STACKED_DELETE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r";\s*DELETE\b").unwrap());

static WHERE_TAUTOLOGY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bWHERE\s+1\s*=\s*1\b").unwrap());

static SELECT_TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\bSELECT\b").unwrap());

/// Comment-free SQL plus which kinds of comments were removed.
struct Lexed {
    text: String,
    line_comment: bool,
    block_comment: bool,
}

/// Classifies a SQL statement by operation kind and risk level.
///
/// Total over any input: empty or unrecognised statements fail closed to
/// `WRITE_RISKY`/`HIGH`.
pub fn classify(sql: &str) -> Classification {
    classify_stripped(&strip_comments(sql))
}

/// Removes `--` line comments and `/* */` block comments.
///
/// Each comment is replaced by a single space so adjacent tokens stay apart.
pub fn strip_comments(sql: &str) -> String {
    lex(sql).text
}

/// Returns true if the statement contains a `WHERE` keyword.
///
/// Only keyword tokens count: `where` inside a string literal or a quoted
/// identifier does not. Text the tokenizer rejects has no WHERE clause.
pub fn has_where_clause(sql: &str) -> bool {
    where_keyword_end(sql).is_some()
}

/// Byte offset just past the first `WHERE` keyword token.
fn where_keyword_end(sql: &str) -> Option<usize> {
    let dialect = PostgreSqlDialect {};
    let tokens = Tokenizer::new(&dialect, sql)
        .tokenize_with_location()
        .map_err(|e| debug!(error = %e, "Tokenizer failed, assuming no WHERE clause"))
        .ok()?;
    let index = LineIndex::new(sql);
    tokens
        .iter()
        .find(|tok| is_where_keyword(tok))
        .map(|tok| index.offset(tok.location) + "WHERE".len())
}

fn is_where_keyword(tok: &TokenWithLocation) -> bool {
    matches!(&tok.token, Token::Word(word) if word.keyword == Keyword::WHERE && word.quote_style.is_none())
}

/// Derives the target table from the first `FROM`/`UPDATE`/`INTO`/`TABLE` token.
pub fn extract_table_name(sql: &str) -> String {
    TABLE_NAME_RE
        .captures(sql)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim_matches('"').to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Human-readable description of what a statement will touch.
pub fn estimate_impact(sql: &str, kind: OperationKind) -> String {
    let text = strip_comments(sql);
    let table = extract_table_name(&text);
    let keyword = operative_keyword(&text);

    match kind {
        OperationKind::Read => "Read operation - no data will be modified".to_string(),
        OperationKind::WriteRisky => {
            if has_where_clause(&text) {
                format!("HIGH RISK: Will modify multiple rows in table '{}'", table)
            } else {
                format!("CRITICAL: Will affect ALL rows in table '{}'", table)
            }
        }
        OperationKind::WriteSafe => {
            if keyword == "INSERT" {
                format!("Will insert new row(s) into table '{}'", table)
            } else {
                format!("Will modify specific row(s) in table '{}'", table)
            }
        }
        OperationKind::Admin => match keyword.as_str() {
            "DROP" => format!("CRITICAL: Will permanently delete {}", table),
            "CREATE" => format!("Will create new database object: {}", table),
            "ALTER" => format!("Will modify structure of {}", table),
            _ => "Administrative operation".to_string(),
        },
    }
}

/// Checks a statement for lexical red flags.
///
/// Comments and stacked statements produce warnings only. Empty input and
/// reads without a `SELECT` token are rejected.
pub fn validate(sql: &str, kind: OperationKind) -> ValidationReport {
    if sql.trim().is_empty() {
        return ValidationReport::rejected("Empty query");
    }

    let lexed = lex(sql);
    let upper = lexed.text.to_uppercase();
    if upper.trim().is_empty() {
        return ValidationReport::rejected("Empty query");
    }

    let mut warnings = Vec::new();

    if STACKED_DROP_RE.is_match(&upper) {
        warnings.push("Possible SQL injection: DROP after semicolon".to_string());
    }
    if STACKED_DELETE_RE.is_match(&upper) {
        warnings.push("Multiple statements detected with DELETE".to_string());
    }
    if lexed.line_comment {
        warnings.push("SQL comment detected".to_string());
    }
    if lexed.block_comment {
        warnings.push("Block comment detected".to_string());
    }

    if kind == OperationKind::WriteRisky && !has_where_clause(&upper) {
        warnings.push("WARNING: No WHERE clause - will affect ALL rows!".to_string());
    }

    if WHERE_TAUTOLOGY_RE.is_match(&upper) {
        warnings.push("WHERE 1=1 detected - effectively no filtering".to_string());
    }

    if kind == OperationKind::Read && !SELECT_TOKEN_RE.is_match(&upper) {
        return ValidationReport::rejected("Invalid SELECT query");
    }

    ValidationReport::passed(warnings)
}

fn classify_stripped(text: &str) -> Classification {
    let keyword = operative_keyword(text);

    match keyword.as_str() {
        k if READ_KEYWORDS.contains(&k) => {
            Classification::new(OperationKind::Read, RiskLevel::Low)
        }
        "WITH" => classify_cte(text),
        k if ADMIN_KEYWORDS.contains(&k) => {
            Classification::new(OperationKind::Admin, RiskLevel::Critical)
        }
        "UPDATE" | "DELETE" => classify_filtered_write(text),
        "TRUNCATE" | "MERGE" => Classification::new(OperationKind::WriteRisky, RiskLevel::High),
        "INSERT" => Classification::new(OperationKind::WriteSafe, RiskLevel::Medium),
        other => {
            debug!(keyword = other, "Unknown SQL operation, treating as risky");
            Classification::new(OperationKind::WriteRisky, RiskLevel::High)
        }
    }
}

fn classify_filtered_write(text: &str) -> Classification {
    if !has_where_clause(text) {
        Classification::new(OperationKind::WriteRisky, RiskLevel::Critical)
    } else if where_clause_is_specific(text) {
        Classification::new(OperationKind::WriteSafe, RiskLevel::Medium)
    } else {
        Classification::new(OperationKind::WriteRisky, RiskLevel::High)
    }
}

fn where_clause_is_specific(text: &str) -> bool {
    let Some(rest) = where_keyword_end(text).and_then(|end| text.get(end..)) else {
        return false;
    };
    let Some(clause) = WHERE_CLAUSE_RE.captures(rest).and_then(|caps| caps.get(1)) else {
        return false;
    };
    let clause = clause.as_str().trim();

    if TAUTOLOGY_RE.is_match(clause)
        || BARE_NOT_NULL_RE.is_match(clause)
        || BARE_POSITIVE_RE.is_match(clause)
    {
        return false;
    }

    EQUALITY_LITERAL_RE.is_match(clause)
}

/// A `WITH` statement takes the highest-risk classification among its
/// terminal statement and its CTE bodies, so a data-modifying CTE is never
/// waved through as a read.
fn classify_cte(text: &str) -> Classification {
    let parts = split_cte(text);

    let Some(terminal) = parts.terminal else {
        return Classification::new(OperationKind::WriteRisky, RiskLevel::High);
    };

    parts
        .bodies
        .iter()
        .fold(classify_stripped(terminal), |acc, body| {
            let body_class = if operative_keyword(body) == "VALUES" {
                Classification::new(OperationKind::Read, RiskLevel::Low)
            } else {
                classify_stripped(body)
            };
            acc.escalate(body_class)
        })
}

struct CteParts<'a> {
    bodies: Vec<&'a str>,
    terminal: Option<&'a str>,
}

/// Splits `WITH a AS (...), b AS (...) <terminal>` into bodies and terminal.
fn split_cte(text: &str) -> CteParts<'_> {
    let mut bodies = Vec::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut body_start: Option<usize> = None;
    let mut after_body = false;
    let mut word = String::new();
    let mut last_word = String::new();

    // Skip the WITH keyword itself.
    let start = text
        .trim_start()
        .find(char::is_whitespace)
        .map(|i| i + (text.len() - text.trim_start().len()))
        .unwrap_or(text.len());

    for (offset, c) in text[start..].char_indices() {
        let i = start + offset;

        if let Some(q) = quote {
            if c == q {
                quote = None;
            }
            continue;
        }

        if depth == 0 {
            if after_body && !c.is_whitespace() {
                if c == ',' {
                    after_body = false;
                    continue;
                }
                return CteParts {
                    bodies,
                    terminal: Some(text[i..].trim()),
                };
            }
            if c.is_alphanumeric() || c == '_' {
                word.push(c);
                continue;
            }
            if !word.is_empty() {
                last_word = std::mem::take(&mut word).to_uppercase();
            }
        }

        match c {
            '\'' | '"' => quote = Some(c),
            '(' => {
                if depth == 0 && matches!(last_word.as_str(), "AS" | "MATERIALIZED") {
                    body_start = Some(i + 1);
                }
                depth += 1;
            }
            ')' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    if let Some(s) = body_start.take() {
                        bodies.push(text[s..i].trim());
                        after_body = true;
                    }
                }
            }
            _ => {}
        }
    }

    CteParts {
        bodies,
        terminal: None,
    }
}

/// First whitespace-delimited token, upper-cased, without surrounding punctuation.
fn operative_keyword(text: &str) -> String {
    text.split_whitespace()
        .next()
        .map(|token| {
            token
                .trim_matches(|c: char| !c.is_alphanumeric() && c != '_')
                .to_uppercase()
        })
        .unwrap_or_default()
}

fn lex(sql: &str) -> Lexed {
    let dialect = PostgreSqlDialect {};
    let tokens = match Tokenizer::new(&dialect, sql).tokenize_with_location() {
        Ok(tokens) => tokens,
        Err(e) => {
            debug!(error = %e, "Tokenizer failed, stripping comments with patterns");
            return lex_with_patterns(sql);
        }
    };

    let index = LineIndex::new(sql);
    let mut lexed = Lexed {
        text: String::with_capacity(sql.len()),
        line_comment: false,
        block_comment: false,
    };
    let mut cursor = 0;

    for (pos, tok) in tokens.iter().enumerate() {
        match &tok.token {
            Token::Whitespace(Whitespace::SingleLineComment { .. }) => lexed.line_comment = true,
            Token::Whitespace(Whitespace::MultiLineComment(_)) => lexed.block_comment = true,
            _ => continue,
        }

        let start = index.offset(tok.location).max(cursor);
        let end = tokens
            .get(pos + 1)
            .map(|next| index.offset(next.location))
            .unwrap_or(sql.len())
            .max(start);

        lexed.text.push_str(&sql[cursor..start]);
        lexed.text.push(' ');
        cursor = end;
    }

    lexed.text.push_str(&sql[cursor..]);
    lexed
}

/// Fallback for input the tokenizer rejects (e.g. an unterminated literal).
fn lex_with_patterns(sql: &str) -> Lexed {
    let block_comment = BLOCK_COMMENT_RE.is_match(sql);
    let without_blocks = BLOCK_COMMENT_RE.replace_all(sql, " ");
    let line_comment = LINE_COMMENT_RE.is_match(&without_blocks);
    let text = LINE_COMMENT_RE.replace_all(&without_blocks, " ").into_owned();

    Lexed {
        text,
        line_comment,
        block_comment,
    }
}

/// Maps tokenizer locations (1-based line, 1-based char column) to byte offsets.
struct LineIndex<'a> {
    sql: &'a str,
    line_starts: Vec<usize>,
}

impl<'a> LineIndex<'a> {
    fn new(sql: &'a str) -> Self {
        let line_starts = std::iter::once(0)
            .chain(sql.match_indices('\n').map(|(i, _)| i + 1))
            .collect();
        Self { sql, line_starts }
    }

    fn offset(&self, location: Location) -> usize {
        let line = (location.line as usize).saturating_sub(1);
        let Some(&line_start) = self.line_starts.get(line) else {
            return self.sql.len();
        };
        let column = (location.column as usize).saturating_sub(1);

        self.sql[line_start..]
            .char_indices()
            .nth(column)
            .map(|(i, _)| line_start + i)
            .unwrap_or(self.sql.len())
    }
}
