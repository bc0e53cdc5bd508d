//! Query safety classification module.
//!
//! Classifies SQL text by effect (operation kind) and blast radius (risk level),
//! validates it for lexical red flags, and evaluates the per-environment
//! execution policy. Everything here is pure: no I/O, no shared state.

mod classifier;
mod policy;

pub use classifier::{
    classify, estimate_impact, extract_table_name, has_where_clause, strip_comments, validate,
};
pub use policy::{evaluate_policy, Environment, PolicyDecision};

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::GatewayError;

/// Coarse classification of a statement's effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationKind {
    /// SELECT, SHOW, DESCRIBE, EXPLAIN and read-only CTEs.
    Read,
    /// Inserts and targeted updates/deletes.
    WriteSafe,
    /// Unfiltered or broadly filtered writes, TRUNCATE, MERGE, unknown statements.
    WriteRisky,
    /// DDL, privilege changes and procedure execution.
    Admin,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "READ",
            Self::WriteSafe => "WRITE_SAFE",
            Self::WriteRisky => "WRITE_RISKY",
            Self::Admin => "ADMIN",
        }
    }

    pub fn is_read(&self) -> bool {
        matches!(self, Self::Read)
    }

    pub fn is_write(&self) -> bool {
        matches!(self, Self::WriteSafe | Self::WriteRisky)
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "READ" => Ok(Self::Read),
            "WRITE_SAFE" => Ok(Self::WriteSafe),
            "WRITE_RISKY" => Ok(Self::WriteRisky),
            "ADMIN" => Ok(Self::Admin),
            _ => Err(GatewayError::internal(format!(
                "Unknown operation kind: {}",
                s
            ))),
        }
    }
}

/// Ordered severity of a statement. `Low < Medium < High < Critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RiskLevel {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            _ => Err(GatewayError::internal(format!("Unknown risk level: {}", s))),
        }
    }
}

/// Result of classifying a SQL statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub kind: OperationKind,
    pub risk: RiskLevel,
}

impl Classification {
    pub fn new(kind: OperationKind, risk: RiskLevel) -> Self {
        Self { kind, risk }
    }

    /// Keeps whichever assessment carries the higher risk.
    ///
    /// On a tie the receiver wins, so an independent re-classification is
    /// never replaced by an equally rated self-report.
    pub fn escalate(self, other: Classification) -> Classification {
        if other.risk > self.risk {
            other
        } else {
            self
        }
    }

    /// Whether this statement needs an explicit confirmation when the global
    /// confirmation toggle is on. Only plain low-risk reads are exempt.
    pub fn needs_confirmation(&self) -> bool {
        !(self.kind.is_read() && self.risk == RiskLevel::Low)
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.kind, self.risk)
    }
}

/// Outcome of lexical validation.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ValidationReport {
    pub ok: bool,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn passed(warnings: Vec<String>) -> Self {
        Self { ok: true, warnings }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            ok: false,
            warnings: vec![reason.into()],
        }
    }
}
