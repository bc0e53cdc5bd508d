//! Per-environment execution policy.
//!
//! Production targets are read-only; every other environment permits all
//! operation kinds. The table is a closed match so adding an environment or
//! kind forces a decision here.

use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::OperationKind;

/// Deployment target of a query or job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Environment {
    Production,
    NonProduction,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Production => "prod",
            Self::NonProduction => "non-prod",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `prod` and `production` (any case) select the production policy.
/// Any other tag is a non-production environment.
impl FromStr for Environment {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "prod" | "production" => Ok(Self::Production),
            _ => Ok(Self::NonProduction),
        }
    }
}

/// Whether an operation may run, and why not if it may not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub allowed: bool,
    pub reason: Option<String>,
}

impl PolicyDecision {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    fn deny(reason: String) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
        }
    }
}

/// Evaluates the environment policy table.
pub fn evaluate_policy(kind: OperationKind, environment: Environment) -> PolicyDecision {
    match (environment, kind) {
        (Environment::Production, OperationKind::Read) => PolicyDecision::allow(),
        (
            Environment::Production,
            OperationKind::WriteSafe | OperationKind::WriteRisky | OperationKind::Admin,
        ) => PolicyDecision::deny(format!(
            "{} operations are not allowed in production. Only SELECT queries are permitted.",
            kind
        )),
        (Environment::NonProduction, _) => PolicyDecision::allow(),
    }
}
