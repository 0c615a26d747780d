//! Provider payloads → [`CommunicationDraft`].
//!
//! Pure functions. Nothing here sees credentials or webhook signatures, so
//! nothing sensitive can leak into stored content.

use crate::communications::{
    CommunicationDraft, CommunicationKind, CommunicationMetadata, Direction, Origin,
    TranscriptionStatus,
};
use crate::providers::RawMailMessage;
use crate::providers::twilio::{RecordingEvent, SmsEvent, TranscriptionEvent, VoiceCallEvent};
use crate::Provider;

use chrono::{DateTime, TimeZone as _, Utc};
use regex::Regex;

use std::sync::LazyLock;

const UNKNOWN_CALLER: &str = "unknown caller";

/// Column width html2text wraps rendered mail bodies at.
const HTML_WRAP_WIDTH: usize = 80;

static NO_REPLY_SENDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(no[-_.]?reply|do[-_.]?not[-_.]?reply|notifications?|newsletter)@")
        .expect("hardcoded regex")
});

static SYSTEM_SENDER: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"(?i)\b(mailer-daemon|postmaster)@").expect("hardcoded regex"),
        Regex::new(r"(?i)^(undeliverable|delivery status notification|mail delivery (failed|subsystem)|returned mail)")
            .expect("hardcoded regex"),
    ]
});

/// Gmail labels the provider itself assigns to bulk mail.
const AUTOMATED_LABELS: &[&str] = &["CATEGORY_PROMOTIONS", "CATEGORY_SOCIAL", "CATEGORY_UPDATES", "SPAM"];

/// Normalize one fetched mail message.
pub fn normalize_mail(message: &RawMailMessage) -> CommunicationDraft {
    let text_body = message
        .body_text
        .as_deref()
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_string);
    let html_body = message
        .body_html
        .as_deref()
        .map(|html| html_to_text(&message.id, html))
        .filter(|text| !text.is_empty());
    let body = text_body.or(html_body);
    let has_full_content = body.is_some();
    let content = body.unwrap_or_else(|| message.snippet.clone().unwrap_or_default());

    if !has_full_content {
        tracing::debug!(message_id = %message.id, "mail body unavailable, using snippet");
    }

    let date = message.header("Date").map(str::to_string);
    let received_at = date
        .as_deref()
        .and_then(|value| DateTime::parse_from_rfc2822(value.trim()).ok())
        .map(|value| value.with_timezone(&Utc))
        .or_else(|| {
            message
                .internal_date_ms
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        })
        .unwrap_or_else(Utc::now);

    CommunicationDraft {
        source: Provider::Gmail,
        source_id: message.id.clone(),
        kind: CommunicationKind::Email,
        direction: Direction::Inbound,
        subject: message
            .header("Subject")
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string),
        sender: message.header("From").unwrap_or_default().trim().to_string(),
        content,
        raw_content: message.body_html.clone().or_else(|| message.body_text.clone()),
        metadata: CommunicationMetadata {
            thread_id: message.thread_id.clone(),
            to: message.header("To").map(str::to_string),
            date,
            snippet: message.snippet.clone(),
            has_full_content: Some(has_full_content),
            labels: message.label_ids.clone(),
            ..Default::default()
        },
        origin: classify_mail_origin(message),
        received_at,
    }
}

/// Decide whether a person wrote this mail. Bulk senders, auto-responders,
/// and bounces are stored but never analysed.
pub fn classify_mail_origin(message: &RawMailMessage) -> Origin {
    let from = message.header("From").unwrap_or_default();
    let subject = message.header("Subject").unwrap_or_default().trim();

    if SYSTEM_SENDER[0].is_match(from) || SYSTEM_SENDER[1].is_match(subject) {
        return Origin::System;
    }

    let bulk_precedence = message.header("Precedence").is_some_and(|value| {
        matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "bulk" | "list" | "junk"
        )
    });
    let auto_submitted = message
        .header("Auto-Submitted")
        .is_some_and(|value| !value.trim().eq_ignore_ascii_case("no"));
    let automated_label = message
        .label_ids
        .iter()
        .any(|label| AUTOMATED_LABELS.contains(&label.as_str()));

    if message.header("List-Unsubscribe").is_some()
        || message.header("List-Id").is_some()
        || bulk_precedence
        || auto_submitted
        || automated_label
        || NO_REPLY_SENDER.is_match(from)
    {
        Origin::Automated
    } else {
        Origin::Human
    }
}

/// Render markup as readable text. A body html2text cannot parse is treated
/// as missing so the snippet fallback applies.
fn html_to_text(message_id: &str, html: &str) -> String {
    match html2text::from_read(html.as_bytes(), HTML_WRAP_WIDTH) {
        Ok(text) => text.trim().to_string(),
        Err(error) => {
            tracing::warn!(%message_id, %error, "failed to render html body");
            String::new()
        }
    }
}

fn voice_draft(call_sid: &str, from: Option<&str>, content: String) -> CommunicationDraft {
    CommunicationDraft {
        source: Provider::Twilio,
        source_id: call_sid.to_string(),
        kind: CommunicationKind::Call,
        direction: Direction::Inbound,
        subject: None,
        sender: from.unwrap_or(UNKNOWN_CALLER).to_string(),
        content,
        raw_content: None,
        metadata: CommunicationMetadata::default(),
        origin: Origin::Human,
        received_at: Utc::now(),
    }
}

/// First phase of a voice call: the row exists, content arrives later.
pub fn normalize_call_started(event: &VoiceCallEvent) -> CommunicationDraft {
    let mut draft = voice_draft(&event.call_sid, Some(&event.from), String::new());
    draft.subject = Some(format!("Voice call from {}", event.from));
    draft.metadata.to = event.to.clone();
    draft.metadata.call_status = event.call_status.clone();
    draft.metadata.transcription_status = Some(TranscriptionStatus::Pending);
    for (key, value) in [("caller_city", &event.caller_city), ("caller_state", &event.caller_state)] {
        if let Some(value) = value {
            draft
                .metadata
                .extra
                .insert(key.to_string(), serde_json::Value::String(value.clone()));
        }
    }
    draft
}

/// Recording finished. Gives the row classifiable placeholder content until
/// the transcription lands.
pub fn normalize_recording(event: &RecordingEvent) -> CommunicationDraft {
    let content = match event.recording_duration_secs {
        Some(secs) => format!("Voicemail recording ({secs} seconds). Transcription not yet available."),
        None => "Voicemail recording. Transcription not yet available.".to_string(),
    };
    let mut draft = voice_draft(&event.call_sid, event.from.as_deref(), content);
    draft.raw_content = Some(event.recording_url.clone());
    draft.metadata.to = event.to.clone();
    draft.metadata.call_status = Some("completed".into());
    draft.metadata.recording_url = Some(event.recording_url.clone());
    draft.metadata.recording_sid = event.recording_sid.clone();
    draft.metadata.recording_duration_secs = event.recording_duration_secs;
    draft
}

/// Transcription callback. A failed transcription leaves content untouched
/// and only records the status.
pub fn normalize_transcription(event: &TranscriptionEvent) -> CommunicationDraft {
    let completed = event.is_completed();
    let content = if completed {
        event
            .transcription_text
            .as_deref()
            .unwrap_or_default()
            .trim()
            .to_string()
    } else {
        String::new()
    };
    let mut draft = voice_draft(&event.call_sid, event.from.as_deref(), content);
    draft.metadata.to = event.to.clone();
    draft.metadata.recording_url = event.recording_url.clone();
    draft.metadata.transcription_status = Some(if completed {
        TranscriptionStatus::Completed
    } else {
        TranscriptionStatus::Failed
    });
    draft
}

pub fn normalize_sms(event: &SmsEvent) -> CommunicationDraft {
    let mut metadata = CommunicationMetadata {
        to: event.to.clone(),
        ..Default::default()
    };
    if event.num_media > 0 {
        metadata
            .extra
            .insert("num_media".into(), serde_json::Value::from(event.num_media));
    }

    CommunicationDraft {
        source: Provider::Twilio,
        source_id: event.message_sid.clone(),
        kind: CommunicationKind::Sms,
        direction: Direction::Inbound,
        subject: None,
        sender: event.from.clone(),
        content: event.body.trim().to_string(),
        raw_content: Some(event.body.clone()),
        metadata,
        origin: Origin::Human,
        received_at: Utc::now(),
    }
}
