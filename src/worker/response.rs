//! Localized plain-language replies for finished jobs.

use serde_json::Value as JsonValue;

use crate::db::QueryResult;
use crate::language::Language;
use crate::safety::OperationKind;

/// Reply for a statement that ran successfully.
pub fn success_message(language: Language, kind: OperationKind, result: &QueryResult) -> String {
    match kind {
        OperationKind::Read => read_message(language, result),
        OperationKind::WriteSafe | OperationKind::WriteRisky => {
            let n = result.effective_row_count();
            match language {
                Language::En => format!("Operation completed successfully. {n} rows affected."),
                Language::He => format!("הפעולה הושלמה בהצלחה. {n} שורות הושפעו."),
            }
        }
        OperationKind::Admin => match language {
            Language::En => "Administrative operation completed successfully.".to_string(),
            Language::He => "פעולת ניהול הושלמה בהצלחה.".to_string(),
        },
    }
}

fn read_message(language: Language, result: &QueryResult) -> String {
    if result.rows.is_empty() {
        return match language {
            Language::En => "No results found matching your criteria.".to_string(),
            Language::He => "לא נמצאו תוצאות התואמות את הקריטריונים שלך.".to_string(),
        };
    }

    if let Some(scalar) = aggregate_scalar(result) {
        return match language {
            Language::En => format!("Found {scalar} results."),
            Language::He => format!("נמצאו {scalar} תוצאות."),
        };
    }

    let n = result.row_count;
    match language {
        Language::En => format!("Found {n} results. Here are the details."),
        Language::He => format!("נמצאו {n} תוצאות. הנה הפרטים."),
    }
}

/// The value of a single-row, single-column result whose column looks like
/// a count or total.
fn aggregate_scalar(result: &QueryResult) -> Option<String> {
    if result.rows.len() != 1 || result.columns.len() != 1 {
        return None;
    }
    let name = result.columns[0].name.to_lowercase();
    if !name.contains("count") && !name.contains("total") {
        return None;
    }
    let value = result.rows[0].first()?.to_json();
    Some(match value {
        JsonValue::String(s) => s,
        other => other.to_string(),
    })
}

/// Reply for a statement the environment policy refused.
pub fn blocked_message(language: Language, kind: OperationKind) -> String {
    match language {
        Language::En => format!(
            "This {kind} operation is not allowed in production. Only SELECT queries are permitted in the production environment for safety."
        ),
        Language::He => format!(
            "פעולת {kind} זו אינה מותרת בסביבת ייצור. רק שאילתות SELECT מותרות בסביבת הייצור למען הבטיחות."
        ),
    }
}

/// Reply for an ADMIN statement refused because admin operations are off.
pub fn admin_disabled_message(language: Language) -> String {
    match language {
        Language::En => "Administrative operations (CREATE, DROP, ALTER and similar) are disabled on this system, so the statement was not run.".to_string(),
        Language::He => "פעולות ניהול (CREATE, DROP, ALTER וכדומה) מושבתות במערכת זו, ולכן ההוראה לא הורצה.".to_string(),
    }
}

/// Reply for a job that failed.
pub fn error_message(language: Language, error: &str) -> String {
    match language {
        Language::En => format!("An error occurred while processing your request: {error}"),
        Language::He => format!("אירעה שגיאה בעיבוד בקשתך: {error}"),
    }
}
