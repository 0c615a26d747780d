//! Canonical communication record and its lifecycle.

use crate::error::ValidationError;
use crate::{Provider, UserId};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CommunicationKind {
    Email,
    Sms,
    Call,
}

impl CommunicationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CommunicationKind::Email => "email",
            CommunicationKind::Sms => "sms",
            CommunicationKind::Call => "call",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "email" => Some(CommunicationKind::Email),
            "sms" => Some(CommunicationKind::Sms),
            "call" => Some(CommunicationKind::Call),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "inbound" => Some(Direction::Inbound),
            "outbound" => Some(Direction::Outbound),
            _ => None,
        }
    }
}

/// Classification lifecycle of a communication.
///
/// ```text
/// pending ──claim──▶ processing ──▶ processed
///    ▲                 │    │
///    │                 │    └──────▶ failed
///    ├──── requeue ◀───┘ (content replaced mid-classification)
///    └──── reanalysis reset ◀──── processed | failed
/// ```
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CommunicationStatus {
    Pending,
    Processing,
    Processed,
    Failed,
}

impl CommunicationStatus {
    pub const ALL: [CommunicationStatus; 4] = [
        CommunicationStatus::Pending,
        CommunicationStatus::Processing,
        CommunicationStatus::Processed,
        CommunicationStatus::Failed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CommunicationStatus::Pending => "pending",
            CommunicationStatus::Processing => "processing",
            CommunicationStatus::Processed => "processed",
            CommunicationStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(CommunicationStatus::Pending),
            "processing" => Some(CommunicationStatus::Processing),
            "processed" => Some(CommunicationStatus::Processed),
            "failed" => Some(CommunicationStatus::Failed),
            _ => None,
        }
    }

    /// Transitions driven by classification. Operator-initiated returns to
    /// `Pending` go through [`CommunicationStatus::can_reset`] instead.
    pub fn can_transition_to(self, next: CommunicationStatus) -> bool {
        matches!(
            (self, next),
            (CommunicationStatus::Pending, CommunicationStatus::Processing)
                | (CommunicationStatus::Processing, CommunicationStatus::Processed)
                | (CommunicationStatus::Processing, CommunicationStatus::Failed)
                | (CommunicationStatus::Processing, CommunicationStatus::Pending)
        )
    }

    pub fn validate_transition(self, next: CommunicationStatus) -> Result<(), ValidationError> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(ValidationError::InvalidTransition {
                from: self.to_string(),
                to: next.to_string(),
            })
        }
    }

    /// Every status `next` may be entered from.
    pub fn sources_of(next: CommunicationStatus) -> Vec<CommunicationStatus> {
        Self::ALL
            .into_iter()
            .filter(|from| from.can_transition_to(next))
            .collect()
    }

    /// Reanalysis may reset anything that is not currently being classified.
    pub fn can_reset(self) -> bool {
        self != CommunicationStatus::Processing
    }

    pub fn resettable() -> Vec<CommunicationStatus> {
        Self::ALL.into_iter().filter(|status| status.can_reset()).collect()
    }
}

impl std::fmt::Display for CommunicationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Who produced the communication. Only `Human` is ever analysed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    Human,
    Automated,
    System,
}

impl Origin {
    pub fn as_str(self) -> &'static str {
        match self {
            Origin::Human => "human",
            Origin::Automated => "automated",
            Origin::System => "system",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "human" => Some(Origin::Human),
            "automated" => Some(Origin::Automated),
            "system" => Some(Origin::System),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TranscriptionStatus {
    Pending,
    Completed,
    Failed,
}

/// Provider metadata. Fields the pipeline reads are typed; anything else a
/// provider sends is kept in `extra` so nothing is lost across upserts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommunicationMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
    /// False when the body could not be extracted and `content` is the snippet.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_full_content: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recording_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recording_sid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recording_duration_secs: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcription_status: Option<TranscriptionStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CommunicationMetadata {
    /// Overlay `patch` onto `self`. Present fields in the patch win; absent
    /// ones keep the current value.
    pub fn merge(&mut self, patch: CommunicationMetadata) {
        macro_rules! overlay {
            ($($field:ident),*) => {
                $(if patch.$field.is_some() { self.$field = patch.$field; })*
            };
        }
        overlay!(
            thread_id,
            to,
            date,
            snippet,
            has_full_content,
            call_status,
            recording_url,
            recording_sid,
            recording_duration_secs,
            transcription_status,
            last_error
        );
        if !patch.labels.is_empty() {
            self.labels = patch.labels;
        }
        self.extra.extend(patch.extra);
    }

    pub fn parse(value: &str) -> Self {
        serde_json::from_str(value).unwrap_or_default()
    }
}

/// A persisted communication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Communication {
    pub id: String,
    pub user_id: UserId,
    pub source: Provider,
    pub source_id: String,
    pub kind: CommunicationKind,
    pub direction: Direction,
    pub subject: Option<String>,
    pub sender: String,
    pub content: String,
    pub raw_content: Option<String>,
    pub metadata: CommunicationMetadata,
    pub status: CommunicationStatus,
    pub origin: Origin,
    pub exclude_from_analysis: bool,
    pub parent_communication_id: Option<String>,
    pub received_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Communication {
    /// Whether classification must leave this record alone.
    pub fn is_excluded_from_analysis(&self) -> bool {
        self.exclude_from_analysis || self.origin != Origin::Human
    }

    /// Voice calls are created before their recording or transcription
    /// arrives; there is nothing to classify until then.
    pub fn awaiting_content(&self) -> bool {
        self.content.trim().is_empty()
    }
}

/// Normalized provider message, ready to be inserted as `Pending`.
#[derive(Debug, Clone, PartialEq)]
pub struct CommunicationDraft {
    pub source: Provider,
    pub source_id: String,
    pub kind: CommunicationKind,
    pub direction: Direction,
    pub subject: Option<String>,
    pub sender: String,
    pub content: String,
    pub raw_content: Option<String>,
    pub metadata: CommunicationMetadata,
    pub origin: Origin,
    pub received_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_transitions() {
        use CommunicationStatus::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Processed));
        assert!(Processing.can_transition_to(Failed));
        assert!(Processing.can_transition_to(Pending));

        assert!(!Pending.can_transition_to(Processed));
        assert!(!Processed.can_transition_to(Pending));
        assert!(!Failed.can_transition_to(Processing));
        assert!(Processed.validate_transition(Pending).is_err());
    }

    #[test]
    fn reset_refuses_in_flight_rows() {
        assert!(CommunicationStatus::Processed.can_reset());
        assert!(CommunicationStatus::Failed.can_reset());
        assert!(!CommunicationStatus::Processing.can_reset());
    }

    #[test]
    fn sources_follow_the_transition_table() {
        use CommunicationStatus::*;
        assert_eq!(CommunicationStatus::sources_of(Processing), vec![Pending]);
        assert_eq!(CommunicationStatus::sources_of(Processed), vec![Processing]);
        assert_eq!(CommunicationStatus::sources_of(Pending), vec![Processing]);
        assert_eq!(
            CommunicationStatus::resettable(),
            vec![Pending, Processed, Failed]
        );
    }

    #[test]
    fn metadata_merge_keeps_unknown_fields() {
        let mut current: CommunicationMetadata = serde_json::from_value(serde_json::json!({
            "call_status": "ringing",
            "caller_city": "Springfield"
        }))
        .unwrap();

        current.merge(CommunicationMetadata {
            recording_url: Some("https://api.twilio.com/rec/RE1".into()),
            recording_duration_secs: Some(42),
            ..Default::default()
        });

        assert_eq!(current.call_status.as_deref(), Some("ringing"));
        assert_eq!(current.recording_duration_secs, Some(42));
        assert_eq!(current.extra["caller_city"], "Springfield");

        let round_trip = serde_json::to_value(&current).unwrap();
        assert_eq!(round_trip["caller_city"], "Springfield");
        assert!(round_trip.get("thread_id").is_none());
    }

    #[test]
    fn metadata_parse_tolerates_garbage() {
        assert_eq!(
            CommunicationMetadata::parse("not json"),
            CommunicationMetadata::default()
        );
    }
}
