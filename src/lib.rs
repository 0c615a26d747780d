//! Constituent hub: ingests email, SMS, and voice communications, deduplicates
//! them against SQLite, classifies each one with an LLM, and rolls the results
//! up into periodic strategic situation reports.

pub mod analysis;
pub mod api;
pub mod communications;
pub mod config;
pub mod db;
pub mod error;
pub mod hub;
pub mod ingestion;
pub mod llm;
pub mod normalize;
pub mod providers;
pub mod retry;
pub mod strategic;

pub use error::{Error, Result};
pub use hub::{Hub, HubDeps};

use serde::{Deserialize, Serialize};

/// Identifier of the user who owns an inbox and everything ingested into it.
pub type UserId = String;

/// External system a communication was ingested from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    Gmail,
    Twilio,
}

impl Provider {
    pub const ALL: [Provider; 2] = [Provider::Gmail, Provider::Twilio];

    pub fn as_str(self) -> &'static str {
        match self {
            Provider::Gmail => "gmail",
            Provider::Twilio => "twilio",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "gmail" => Some(Provider::Gmail),
            "twilio" => Some(Provider::Twilio),
            _ => None,
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
