//! Keyword-pattern SQL generation.
//!
//! Answers the common question shapes (counts, sums, averages, listings,
//! "most recent") without a model call. Tables and columns are resolved
//! against the introspected schema; extra vocabulary (for example Hebrew
//! table names) is supplied through aliases.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use tracing::debug;

use super::generator::{GeneratedSql, SqlGenerator};
use crate::db::{Schema, Table};
use crate::error::{GatewayError, Result};
use crate::language::Language;

const DEFAULT_LIST_LIMIT: u64 = 100;
const DEFAULT_RECENT_LIMIT: u64 = 10;
const MIN_PATTERN_SCORE: f32 = 0.5;

static NUMBER_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b(\d{1,6})\b").unwrap());

static PLAIN_IDENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z_][a-z0-9_]*$").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PatternKind {
    Count,
    Sum,
    Average,
    List,
    Recent,
}

struct Pattern {
    kind: PatternKind,
    keywords: &'static [&'static str],
    confidence: f32,
}

const PATTERNS: &[Pattern] = &[
    Pattern {
        kind: PatternKind::Count,
        keywords: &["how many", "count", "number of", "כמה", "ספור", "מספר"],
        confidence: 0.9,
    },
    Pattern {
        kind: PatternKind::Sum,
        keywords: &["total", "sum", "סכום", "סה\"כ"],
        confidence: 0.85,
    },
    Pattern {
        kind: PatternKind::Average,
        keywords: &["average", "mean", "avg", "ממוצע"],
        confidence: 0.85,
    },
    Pattern {
        kind: PatternKind::List,
        keywords: &["list", "show", "get", "display", "רשימה", "הצג", "הראה"],
        confidence: 0.8,
    },
    Pattern {
        kind: PatternKind::Recent,
        keywords: &["recent", "latest", "newest", "אחרונים", "לאחרונה"],
        confidence: 0.75,
    },
];

/// A relative time window mentioned in the question.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Period {
    Today,
    Interval(String),
}

/// Lower-cased question with ASCII words padded for whole-word matching.
struct Question<'a> {
    raw: &'a str,
    words: String,
}

impl<'a> Question<'a> {
    fn new(raw: &'a str) -> Self {
        let words: Vec<String> = raw
            .split(|c: char| !(c.is_alphanumeric() || c == '_' || c == '"'))
            .filter(|w| !w.is_empty())
            .map(str::to_lowercase)
            .collect();
        Self {
            raw,
            words: format!(" {} ", words.join(" ")),
        }
    }

    /// ASCII phrases match whole words; Hebrew matches as a substring so
    /// attached prefixes (ה, ב, ל) do not hide the stem.
    fn mentions(&self, phrase: &str) -> bool {
        if phrase.is_ascii() {
            self.words.contains(&format!(" {} ", phrase.to_lowercase()))
        } else {
            self.raw.contains(phrase)
        }
    }

    fn first_number(&self) -> Option<u64> {
        NUMBER_RE
            .captures(self.raw)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse().ok())
    }
}

/// Pattern-matching generator.
#[derive(Debug, Clone, Default)]
pub struct PatternGenerator {
    aliases: Vec<(String, String)>,
}

impl PatternGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps an extra word (any language) to a table name.
    pub fn with_alias(mut self, word: impl Into<String>, table: impl Into<String>) -> Self {
        self.aliases.push((word.into(), table.into()));
        self
    }

    fn detect_pattern(question: &Question<'_>) -> Option<PatternKind> {
        let mut best: Option<(PatternKind, f32)> = None;

        for pattern in PATTERNS {
            let matches = pattern
                .keywords
                .iter()
                .filter(|kw| question.mentions(kw))
                .count();
            let score = matches as f32 * pattern.confidence;
            if score > best.map(|(_, s)| s).unwrap_or(0.0) {
                best = Some((pattern.kind, score));
            }
        }

        best.filter(|(_, score)| *score > MIN_PATTERN_SCORE)
            .map(|(kind, _)| kind)
    }

    /// Resolves the table: aliases first, then schema names (plural,
    /// singular, underscores read as spaces), longest match wins.
    fn resolve_table<'s>(&self, question: &Question<'_>, schema: &'s Schema) -> Option<TableRef<'s>> {
        for (word, table) in &self.aliases {
            if question.mentions(word) {
                return Some(match schema.find_table(table) {
                    Some(found) => TableRef::Known(found),
                    None => TableRef::Named(table.clone()),
                });
            }
        }

        let mut best: Option<(&Table, usize)> = None;
        for table in &schema.tables {
            for candidate in table_candidates(&table.name) {
                if question.mentions(&candidate)
                    && candidate.len() > best.map(|(_, len)| len).unwrap_or(0)
                {
                    best = Some((table, candidate.len()));
                }
            }
        }
        best.map(|(table, _)| TableRef::Known(table))
    }

    fn detect_period(question: &Question<'_>) -> Option<Period> {
        let number = question.first_number();

        if question.mentions("today") || question.mentions("היום") {
            return Some(Period::Today);
        }

        for (phrases, unit) in [
            (&["day", "days", "ימים", "יום"][..], "day"),
            (&["week", "weeks", "שבוע", "שבועות"][..], "week"),
            (&["month", "months", "חודש", "חודשים"][..], "month"),
            (&["year", "years", "שנה", "שנים"][..], "year"),
        ] {
            if phrases.iter().any(|p| question.mentions(p)) {
                let value = number.unwrap_or(1);
                let suffix = if value == 1 { "" } else { "s" };
                return Some(Period::Interval(format!("{value} {unit}{suffix}")));
            }
        }
        None
    }

    fn build(
        &self,
        kind: PatternKind,
        question: &Question<'_>,
        table: &TableRef<'_>,
        language: Language,
    ) -> Result<GeneratedSql> {
        let table_sql = quote_ident(table.name());
        let period = Self::detect_period(question);
        let date_column = table.date_column();

        let where_clause = match (&period, date_column) {
            (Some(period), Some(column)) => format!(" WHERE {}", period_predicate(period, column)),
            _ => String::new(),
        };

        let (sql, explanation) = match kind {
            PatternKind::Count => (
                format!("SELECT COUNT(*) AS count FROM {table_sql}{where_clause}"),
                describe(language, "Counts rows in", "ספירת רשומות בטבלה", table.name()),
            ),
            PatternKind::Sum | PatternKind::Average => {
                let column = table.numeric_column(question).ok_or_else(|| {
                    GatewayError::generation(format!(
                        "Could not find a numeric column to aggregate in table '{}'",
                        table.name()
                    ))
                })?;
                let (func, alias, en, he) = if kind == PatternKind::Sum {
                    ("SUM", "total", "Sums a column of", "סכום עמודה בטבלה")
                } else {
                    ("AVG", "average", "Averages a column of", "ממוצע עמודה בטבלה")
                };
                (
                    format!(
                        "SELECT {func}({}) AS {alias} FROM {table_sql}{where_clause}",
                        quote_ident(column)
                    ),
                    describe(language, en, he, table.name()),
                )
            }
            PatternKind::List => {
                let limit = match period {
                    Some(_) => DEFAULT_LIST_LIMIT,
                    None => question.first_number().unwrap_or(DEFAULT_LIST_LIMIT),
                };
                (
                    format!("SELECT * FROM {table_sql}{where_clause} LIMIT {limit}"),
                    describe(language, "Lists rows of", "הצגת רשומות מהטבלה", table.name()),
                )
            }
            PatternKind::Recent => {
                let Some(column) = date_column else {
                    return self.build(PatternKind::List, question, table, language);
                };
                let limit = match period {
                    Some(_) => DEFAULT_LIST_LIMIT,
                    None => question.first_number().unwrap_or(DEFAULT_RECENT_LIMIT),
                };
                (
                    format!(
                        "SELECT * FROM {table_sql}{where_clause} ORDER BY {} DESC LIMIT {limit}",
                        quote_ident(column)
                    ),
                    describe(language, "Most recent rows of", "הרשומות האחרונות בטבלה", table.name()),
                )
            }
        };

        Ok(GeneratedSql::new(sql, explanation, "pattern_matching"))
    }
}

#[async_trait]
impl SqlGenerator for PatternGenerator {
    async fn generate(
        &self,
        question: &str,
        schema: &Schema,
        language: Language,
    ) -> Result<GeneratedSql> {
        let question = Question::new(question);

        let kind = Self::detect_pattern(&question).ok_or_else(|| {
            GatewayError::generation(
                "Could not understand the question. Try something like \"How many companies were created last month?\"",
            )
        })?;

        let table = self.resolve_table(&question, schema).ok_or_else(|| {
            GatewayError::generation(
                "Could not identify which table to query. Please mention a table name.",
            )
        })?;

        debug!(pattern = ?kind, table = table.name(), "Pattern matched");
        self.build(kind, &question, &table, language)
    }

    fn name(&self) -> &str {
        "pattern"
    }
}

/// A resolved table: either one from the schema or a bare alias target.
enum TableRef<'s> {
    Known(&'s Table),
    Named(String),
}

impl TableRef<'_> {
    fn name(&self) -> &str {
        match self {
            Self::Known(table) => &table.name,
            Self::Named(name) => name,
        }
    }

    fn date_column(&self) -> Option<&str> {
        let Self::Known(table) = self else {
            return None;
        };
        let preferred = ["created_at", "createdat", "creation_date", "created", "date"];
        preferred
            .iter()
            .find_map(|p| {
                table
                    .columns
                    .iter()
                    .find(|c| c.name.eq_ignore_ascii_case(p))
            })
            .or_else(|| {
                table.columns.iter().find(|c| {
                    let ty = c.data_type.to_lowercase();
                    ty.contains("timestamp") || ty == "date"
                })
            })
            .map(|c| c.name.as_str())
    }

    /// Numeric column named in the question, else the first numeric
    /// column that is not part of the primary key.
    fn numeric_column(&self, question: &Question<'_>) -> Option<&str> {
        let Self::Known(table) = self else {
            return None;
        };
        let numeric: Vec<_> = table
            .columns
            .iter()
            .filter(|c| is_numeric_type(&c.data_type))
            .collect();

        numeric
            .iter()
            .copied()
            .find(|c| {
                question.mentions(&c.name.to_lowercase())
                    || question.mentions(&c.name.to_lowercase().replace('_', " "))
            })
            .or_else(|| {
                numeric
                    .iter()
                    .copied()
                    .find(|c| !c.primary_key)
            })
            .map(|c| c.name.as_str())
    }
}

fn table_candidates(name: &str) -> Vec<String> {
    let lower = name.to_lowercase();
    let bare = lower.rsplit('.').next().unwrap_or(&lower).to_string();
    let spaced = bare.replace('_', " ");
    let mut candidates = vec![bare.clone(), spaced.clone()];
    if let Some(singular) = spaced.strip_suffix("ies") {
        candidates.push(format!("{singular}y"));
    } else if let Some(singular) = spaced.strip_suffix('s') {
        candidates.push(singular.to_string());
    }
    candidates.dedup();
    candidates
}

fn is_numeric_type(data_type: &str) -> bool {
    let ty = data_type.to_lowercase();
    ["int", "numeric", "decimal", "real", "double", "float", "money", "serial"]
        .iter()
        .any(|n| ty.contains(n))
}

fn period_predicate(period: &Period, column: &str) -> String {
    let column = quote_ident(column);
    match period {
        Period::Today => format!("{column} >= date_trunc('day', NOW())"),
        Period::Interval(interval) => format!("{column} >= NOW() - INTERVAL '{interval}'"),
    }
}

/// Quotes identifiers that PostgreSQL would otherwise fold to lower case.
fn quote_ident(name: &str) -> String {
    name.split('.')
        .map(|part| {
            if PLAIN_IDENT_RE.is_match(part) {
                part.to_string()
            } else {
                format!("\"{}\"", part.replace('"', "\"\""))
            }
        })
        .collect::<Vec<_>>()
        .join(".")
}

fn describe(language: Language, en: &str, he: &str, table: &str) -> String {
    match language {
        Language::En => format!("{en} {table}"),
        Language::He => format!("{he} {table}"),
    }
}
