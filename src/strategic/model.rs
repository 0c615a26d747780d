//! Strategic snapshot types and rollup reply validation.

use crate::error::ValidationError;
use crate::llm::json::{NumberLike, decode_reply, optional_string, string_list};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Critical,
    High,
    Medium,
    Low,
}

impl Urgency {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "critical" => Some(Urgency::Critical),
            "high" => Some(Urgency::High),
            "medium" | "moderate" => Some(Urgency::Medium),
            "low" => Some(Urgency::Low),
            _ => None,
        }
    }
}

/// A real communication attached to a critical issue as evidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleCommunication {
    pub communication_id: String,
    pub sender: String,
    pub subject: Option<String>,
    pub summary: String,
    pub priority: i64,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriticalIssue {
    pub category: String,
    pub description: String,
    pub urgency: Urgency,
    pub affected_area: String,
    /// Recomputed from the rollup input, never taken from the model.
    pub count: i64,
    pub samples: Vec<SampleCommunication>,
}

/// Append-only rollup snapshot. The newest per user is "latest".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategicAnalysis {
    pub id: String,
    pub user_id: String,
    pub generated_at: DateTime<Utc>,
    pub summary: String,
    pub critical_issues: Vec<CriticalIssue>,
    pub recommended_actions: Vec<String>,
    pub monitoring_priorities: Vec<String>,
    pub new_communications_count: i64,
}

/// Critical issue as proposed by the model, before cross-referencing.
#[derive(Debug, Clone, PartialEq)]
pub struct ProposedIssue {
    pub category: String,
    pub description: String,
    pub urgency: Urgency,
    pub affected_area: String,
    pub reported_count: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RollupReply {
    pub situation_overview: String,
    pub critical_issues: Vec<ProposedIssue>,
    pub recommended_actions: Vec<String>,
    pub monitoring_priorities: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RollupWire {
    #[serde(default, deserialize_with = "optional_string")]
    situation_overview: Option<String>,
    #[serde(default)]
    critical_issues: Option<Vec<IssueWire>>,
    #[serde(default, deserialize_with = "string_list")]
    recommended_actions: Vec<String>,
    #[serde(default, deserialize_with = "string_list")]
    monitoring_priorities: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IssueWire {
    #[serde(default, deserialize_with = "optional_string")]
    category: Option<String>,
    #[serde(default, deserialize_with = "optional_string")]
    description: Option<String>,
    #[serde(default, deserialize_with = "optional_string")]
    urgency: Option<String>,
    #[serde(default, deserialize_with = "optional_string")]
    affected_area: Option<String>,
    count: Option<NumberLike>,
}

impl RollupReply {
    pub fn parse(text: &str) -> Result<Self, ValidationError> {
        let malformed = |reason: String| ValidationError::MalformedRollupOutput(reason);
        let wire: RollupWire = decode_reply(text).map_err(malformed)?;

        let situation_overview = wire
            .situation_overview
            .ok_or_else(|| malformed("situationOverview is missing".into()))?;

        let issues = wire.critical_issues.unwrap_or_default();
        let mut critical_issues = Vec::with_capacity(issues.len());
        for (index, issue) in issues.into_iter().enumerate() {
            let category = issue
                .category
                .map(|category| category.to_lowercase())
                .ok_or_else(|| malformed(format!("criticalIssues[{index}].category is missing")))?;
            let description = issue.description.ok_or_else(|| {
                malformed(format!("criticalIssues[{index}].description is missing"))
            })?;
            let urgency_value = issue.urgency.as_deref().unwrap_or("medium");
            let urgency = Urgency::parse(urgency_value).ok_or_else(|| {
                malformed(format!("criticalIssues[{index}].urgency is invalid: {urgency_value}"))
            })?;

            critical_issues.push(ProposedIssue {
                category,
                description,
                urgency,
                affected_area: issue.affected_area.unwrap_or_default(),
                reported_count: issue
                    .count
                    .and_then(|count| count.value())
                    .map(|count| count as i64),
            });
        }

        Ok(Self {
            situation_overview,
            critical_issues,
            recommended_actions: wire.recommended_actions,
            monitoring_priorities: wire.monitoring_priorities,
        })
    }
}
