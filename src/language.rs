//! Question/response language.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Languages the generators and responders understand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[default]
    En,
    He,
}

impl Language {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::En => "en",
            Self::He => "he",
        }
    }

    /// Hebrew if any character falls in the Hebrew block (U+0590..U+05FF).
    pub fn detect(text: &str) -> Self {
        if text.chars().any(|c| ('\u{0590}'..='\u{05FF}').contains(&c)) {
            Self::He
        } else {
            Self::En
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Language {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "en" | "english" => Ok(Self::En),
            "he" | "hebrew" | "iw" => Ok(Self::He),
            other => Err(format!("Unsupported language: {other}")),
        }
    }
}
