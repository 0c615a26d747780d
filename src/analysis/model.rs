//! Analysis record and classifier output validation.

use crate::error::ValidationError;
use crate::llm::json::{NumberLike, decode_reply, optional_string, string_list};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Bumped whenever the classification prompt or output contract changes.
pub const ANALYSIS_SCHEMA_VERSION: &str = "2";

/// Confidence recorded when the model omits one.
const DEFAULT_CONFIDENCE: f64 = 0.8;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SentimentLabel {
    Positive,
    Neutral,
    Negative,
}

impl SentimentLabel {
    pub fn as_str(self) -> &'static str {
        match self {
            SentimentLabel::Positive => "positive",
            SentimentLabel::Neutral => "neutral",
            SentimentLabel::Negative => "negative",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "positive" => Some(SentimentLabel::Positive),
            "neutral" => Some(SentimentLabel::Neutral),
            "negative" => Some(SentimentLabel::Negative),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sentiment {
    pub label: SentimentLabel,
    pub score: f64,
    pub reasoning: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Categories {
    pub primary: String,
    pub secondary: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Entities {
    #[serde(default, deserialize_with = "string_list")]
    pub locations: Vec<String>,
    #[serde(default, deserialize_with = "string_list")]
    pub organizations: Vec<String>,
    #[serde(default, deserialize_with = "string_list")]
    pub people: Vec<String>,
    #[serde(default, deserialize_with = "string_list")]
    pub issues: Vec<String>,
}

/// Persisted analysis of one communication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Analysis {
    pub id: String,
    pub communication_id: String,
    pub sentiment: Sentiment,
    pub categories: Categories,
    /// 5 critical/safety, 4 high/state-wide, 3 moderate/local, 2 routine, 1 low.
    pub priority: i64,
    pub entities: Entities,
    pub intentions: Vec<String>,
    pub summary: String,
    pub confidence: f64,
    pub processing_time_ms: i64,
    pub version: String,
    pub created_at: DateTime<Utc>,
}

impl Analysis {
    pub fn from_classification(
        communication_id: &str,
        classification: Classification,
        processing_time_ms: i64,
        version: String,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            communication_id: communication_id.to_string(),
            sentiment: classification.sentiment,
            categories: classification.categories,
            priority: classification.priority,
            entities: classification.entities,
            intentions: classification.intentions,
            summary: classification.summary,
            confidence: classification.confidence,
            processing_time_ms,
            version,
            created_at: Utc::now(),
        }
    }

    pub fn is_high_priority(&self) -> bool {
        self.priority >= 4
    }
}

/// Validated classifier output. Priority reasoning is advisory and is not
/// persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub sentiment: Sentiment,
    pub categories: Categories,
    pub priority: i64,
    pub priority_reasoning: String,
    pub entities: Entities,
    pub intentions: Vec<String>,
    pub summary: String,
    pub confidence: f64,
}

/// Classifier reply as the model sends it. Everything is optional here;
/// [`Classification::parse`] decides what is required.
#[derive(Debug, Deserialize)]
struct ClassificationReply {
    sentiment: Option<SentimentReply>,
    categories: Option<CategoriesReply>,
    priority: Option<PriorityReply>,
    #[serde(default, deserialize_with = "optional_string")]
    summary: Option<String>,
    entities: Option<Entities>,
    #[serde(default, deserialize_with = "string_list")]
    intentions: Vec<String>,
    confidence: Option<NumberLike>,
}

#[derive(Debug, Deserialize)]
struct SentimentReply {
    #[serde(default, deserialize_with = "optional_string")]
    label: Option<String>,
    score: Option<NumberLike>,
    #[serde(default, deserialize_with = "optional_string")]
    reasoning: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CategoriesReply {
    #[serde(default, deserialize_with = "optional_string")]
    primary: Option<String>,
    #[serde(default, deserialize_with = "string_list")]
    secondary: Vec<String>,
}

/// Accept both `{"priority": {"score": 4}}` and a bare `{"priority": 4}`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PriorityReply {
    Detailed {
        score: Option<NumberLike>,
        #[serde(default, deserialize_with = "optional_string")]
        reasoning: Option<String>,
    },
    Bare(NumberLike),
}

impl Classification {
    /// Parse and validate a raw model reply.
    pub fn parse(text: &str) -> Result<Self, ValidationError> {
        let reply: ClassificationReply = decode_reply(text).map_err(malformed)?;

        let sentiment = validate_sentiment(reply.sentiment)?;
        let categories = validate_categories(reply.categories)?;
        let (priority, priority_reasoning) = validate_priority(reply.priority)?;
        let summary = reply.summary.ok_or_else(|| malformed("summary is missing"))?;

        let confidence = reply
            .confidence
            .and_then(|confidence| confidence.value())
            .filter(|value| value.is_finite())
            .map(|value| value.clamp(0.0, 1.0))
            .unwrap_or(DEFAULT_CONFIDENCE);

        Ok(Self {
            sentiment,
            categories,
            priority,
            priority_reasoning,
            entities: reply.entities.unwrap_or_default(),
            intentions: reply.intentions,
            summary,
            confidence,
        })
    }
}

fn malformed(reason: impl Into<String>) -> ValidationError {
    ValidationError::MalformedClassifierOutput(reason.into())
}

fn validate_sentiment(reply: Option<SentimentReply>) -> Result<Sentiment, ValidationError> {
    let reply = reply.ok_or_else(|| malformed("sentiment is missing"))?;

    let label_value = reply
        .label
        .ok_or_else(|| malformed("sentiment.label is missing"))?;
    let label = SentimentLabel::parse(&label_value)
        .ok_or_else(|| malformed(format!("sentiment.label is invalid: {label_value}")))?;

    let score = reply
        .score
        .and_then(|score| score.value())
        .filter(|score| score.is_finite())
        .ok_or_else(|| malformed("sentiment.score is missing"))?;
    if !(-1.0..=1.0).contains(&score) {
        return Err(malformed(format!("sentiment.score out of range: {score}")));
    }

    Ok(Sentiment {
        label,
        score,
        reasoning: reply.reasoning.unwrap_or_default(),
    })
}

fn validate_categories(reply: Option<CategoriesReply>) -> Result<Categories, ValidationError> {
    let reply = reply.ok_or_else(|| malformed("categories is missing"))?;

    let primary = reply
        .primary
        .map(|primary| primary.to_lowercase())
        .ok_or_else(|| malformed("categories.primary is missing"))?;

    let secondary = reply
        .secondary
        .into_iter()
        .map(|category| category.to_lowercase())
        .filter(|category| *category != primary)
        .collect();

    Ok(Categories { primary, secondary })
}

fn validate_priority(reply: Option<PriorityReply>) -> Result<(i64, String), ValidationError> {
    let (score, reasoning) = match reply {
        Some(PriorityReply::Detailed { score, reasoning }) => {
            (score.and_then(|score| score.value()), reasoning)
        }
        Some(PriorityReply::Bare(score)) => (score.value(), None),
        None => (None, None),
    };

    let score = score.ok_or_else(|| malformed("priority.score is missing"))?;
    if score.fract() != 0.0 || !(1.0..=5.0).contains(&score) {
        return Err(malformed(format!("priority.score must be an integer 1-5, got {score}")));
    }

    Ok((score as i64, reasoning.unwrap_or_default()))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const POSITIVE_REPLY: &str = r#"{
        "sentiment": {"score": 0.9, "label": "positive", "reasoning": "Expresses gratitude."},
        "categories": {"primary": "Constituent Services", "secondary": ["other"]},
        "priority": {"score": 1, "reasoning": "Thank-you note."},
        "entities": {"locations": [], "organizations": [], "people": [], "issues": []},
        "intentions": ["express thanks"],
        "summary": "Constituent thanks the office for its help.",
        "confidence": 0.95
    }"#;

    #[test]
    fn parses_complete_reply() {
        let classification = Classification::parse(POSITIVE_REPLY).unwrap();
        assert_eq!(classification.sentiment.label, SentimentLabel::Positive);
        assert_eq!(classification.categories.primary, "constituent services");
        assert_eq!(classification.priority, 1);
        assert_eq!(classification.priority_reasoning, "Thank-you note.");
        assert_eq!(classification.intentions, vec!["express thanks"]);
        assert!((classification.confidence - 0.95).abs() < f64::EPSILON);
    }

    #[test]
    fn accepts_bare_priority_and_missing_optionals() {
        let reply = r#"{
            "sentiment": {"score": -0.6, "label": "Negative"},
            "categories": {"primary": "infrastructure"},
            "priority": 4,
            "summary": "Bridge closure is hurting commuters."
        }"#;
        let classification = Classification::parse(reply).unwrap();
        assert_eq!(classification.sentiment.label, SentimentLabel::Negative);
        assert_eq!(classification.priority, 4);
        assert!(classification.entities.locations.is_empty());
        assert!((classification.confidence - DEFAULT_CONFIDENCE).abs() < f64::EPSILON);
    }

    #[test]
    fn rejects_out_of_range_priority() {
        let reply = POSITIVE_REPLY.replace(r#""score": 1,"#, r#""score": 7,"#);
        let error = Classification::parse(&reply).unwrap_err();
        assert!(error.to_string().contains("priority.score"));
    }

    #[test]
    fn rejects_unknown_sentiment_label() {
        let reply = POSITIVE_REPLY.replace(r#""label": "positive""#, r#""label": "ecstatic""#);
        assert!(Classification::parse(&reply).is_err());
    }

    #[test]
    fn rejects_missing_summary() {
        let reply = POSITIVE_REPLY.replace("\"summary\"", "\"synopsis\"");
        assert!(Classification::parse(&reply).is_err());
    }

    #[test]
    fn rejects_prose() {
        assert!(Classification::parse("I think this message is positive.").is_err());
    }

    #[test]
    fn tolerates_quoted_numbers_and_junk_lists() {
        let reply = r#"{
            "sentiment": {"score": "-0.2", "label": "neutral"},
            "categories": {"primary": "Transportation", "secondary": ["transportation", 7, "Safety"]},
            "priority": {"score": "3"},
            "entities": {"locations": ["Elm St", null], "people": "nobody"},
            "summary": "Asks about bus routes."
        }"#;
        let classification = Classification::parse(reply).unwrap();
        assert_eq!(classification.priority, 3);
        assert_eq!(classification.categories.secondary, vec!["safety"]);
        assert_eq!(classification.entities.locations, vec!["Elm St"]);
        assert!(classification.entities.people.is_empty());
    }
}
