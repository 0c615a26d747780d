//! Twilio webhooks: signature verification, typed payloads, and TwiML
//! responses.

use crate::error::{Result, ValidationError};

use base64::Engine as _;
use hmac::{Hmac, Mac};
use sha1::Sha1;

type HmacSha1 = Hmac<Sha1>;

/// Header carrying the request signature.
pub const SIGNATURE_HEADER: &str = "x-twilio-signature";

/// Validates `X-Twilio-Signature` against the account auth token.
///
/// The signature is base64(HMAC-SHA1(auth_token, url + sorted key/value
/// pairs of the form body)).
#[derive(Clone)]
pub struct TwilioWebhookVerifier {
    auth_token: String,
}

impl std::fmt::Debug for TwilioWebhookVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TwilioWebhookVerifier").finish_non_exhaustive()
    }
}

impl TwilioWebhookVerifier {
    pub fn new(auth_token: impl Into<String>) -> Self {
        Self {
            auth_token: auth_token.into(),
        }
    }

    fn mac(&self, url: &str, params: &FormParams) -> Option<HmacSha1> {
        let mut mac = HmacSha1::new_from_slice(self.auth_token.as_bytes()).ok()?;
        mac.update(url.as_bytes());

        let mut pairs: Vec<&(String, String)> = params.0.iter().collect();
        pairs.sort();
        for (key, value) in pairs {
            mac.update(key.as_bytes());
            mac.update(value.as_bytes());
        }
        Some(mac)
    }

    /// Signature Twilio would send for this request.
    pub fn sign(&self, url: &str, params: &FormParams) -> Option<String> {
        let mac = self.mac(url, params)?;
        Some(base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes()))
    }

    /// Constant-time check of a form-encoded webhook.
    pub fn verify(&self, expected_url: &str, raw_body: &[u8], signature: Option<&str>) -> bool {
        let Some(signature) = signature.map(str::trim).filter(|s| !s.is_empty()) else {
            return false;
        };
        let Ok(provided) = base64::engine::general_purpose::STANDARD.decode(signature) else {
            return false;
        };
        let params = FormParams::parse(raw_body);
        match self.mac(expected_url, &params) {
            Some(mac) => mac.verify_slice(&provided).is_ok(),
            None => false,
        }
    }
}

/// Decoded `application/x-www-form-urlencoded` body, order preserved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FormParams(pub Vec<(String, String)>);

impl FormParams {
    pub fn parse(raw_body: &[u8]) -> Self {
        Self(url::form_urlencoded::parse(raw_body).into_owned().collect())
    }

    pub fn from_pairs<K: Into<String>, V: Into<String>>(pairs: impl IntoIterator<Item = (K, V)>) -> Self {
        Self(pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }

    pub fn encode(&self) -> String {
        url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(self.0.iter())
            .finish()
    }

    /// First non-empty value for `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, v)| k == key && !v.trim().is_empty())
            .map(|(_, v)| v.as_str())
    }

    pub fn require(&self, key: &str) -> std::result::Result<&str, ValidationError> {
        self.get(key)
            .ok_or_else(|| ValidationError::MissingField(key.to_string()))
    }
}

/// The webhook endpoint a payload arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookKind {
    Voice,
    Recording,
    Transcription,
    Sms,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceCallEvent {
    pub call_sid: String,
    pub from: String,
    pub to: Option<String>,
    pub call_status: Option<String>,
    pub caller_city: Option<String>,
    pub caller_state: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingEvent {
    pub call_sid: String,
    pub from: Option<String>,
    pub to: Option<String>,
    pub recording_sid: Option<String>,
    pub recording_url: String,
    pub recording_duration_secs: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptionEvent {
    pub call_sid: String,
    pub from: Option<String>,
    pub to: Option<String>,
    pub transcription_text: Option<String>,
    /// `completed` or `failed`.
    pub transcription_status: Option<String>,
    pub recording_url: Option<String>,
}

impl TranscriptionEvent {
    pub fn is_completed(&self) -> bool {
        self.transcription_status
            .as_deref()
            .is_none_or(|status| status.eq_ignore_ascii_case("completed"))
            && self.transcription_text.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmsEvent {
    pub message_sid: String,
    pub from: String,
    pub to: Option<String>,
    pub body: String,
    pub num_media: u32,
}

/// A verified inbound webhook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TwilioEvent {
    CallStarted(VoiceCallEvent),
    RecordingCompleted(RecordingEvent),
    TranscriptionCompleted(TranscriptionEvent),
    SmsReceived(SmsEvent),
}

impl TwilioEvent {
    pub fn parse(kind: WebhookKind, params: &FormParams) -> std::result::Result<Self, ValidationError> {
        let owned = |key: &str| params.get(key).map(str::to_string);

        Ok(match kind {
            WebhookKind::Voice => TwilioEvent::CallStarted(VoiceCallEvent {
                call_sid: params.require("CallSid")?.to_string(),
                from: params.require("From")?.to_string(),
                to: owned("To"),
                call_status: owned("CallStatus"),
                caller_city: owned("CallerCity"),
                caller_state: owned("CallerState"),
            }),
            WebhookKind::Recording => TwilioEvent::RecordingCompleted(RecordingEvent {
                call_sid: params.require("CallSid")?.to_string(),
                from: owned("From"),
                to: owned("To"),
                recording_sid: owned("RecordingSid"),
                recording_url: params.require("RecordingUrl")?.to_string(),
                recording_duration_secs: params
                    .get("RecordingDuration")
                    .and_then(|value| value.parse().ok()),
            }),
            WebhookKind::Transcription => {
                TwilioEvent::TranscriptionCompleted(TranscriptionEvent {
                    call_sid: params.require("CallSid")?.to_string(),
                    from: owned("From"),
                    to: owned("To"),
                    transcription_text: owned("TranscriptionText"),
                    transcription_status: owned("TranscriptionStatus"),
                    recording_url: owned("RecordingUrl"),
                })
            }
            WebhookKind::Sms => TwilioEvent::SmsReceived(SmsEvent {
                message_sid: params
                    .get("MessageSid")
                    .or_else(|| params.get("SmsSid"))
                    .ok_or_else(|| ValidationError::MissingField("MessageSid".into()))?
                    .to_string(),
                from: params.require("From")?.to_string(),
                to: owned("To"),
                body: params.get("Body").unwrap_or_default().to_string(),
                num_media: params
                    .get("NumMedia")
                    .and_then(|value| value.parse().ok())
                    .unwrap_or(0),
            }),
        })
    }
}

// TwiML.

fn xml_escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}

const XML_PROLOGUE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>"#;

/// Answer an inbound call: play the greeting and record a message.
pub fn voice_twiml(
    greeting: &str,
    recording_action_url: &str,
    transcribe_callback_url: Option<&str>,
    max_length_secs: u32,
) -> String {
    let transcribe = match transcribe_callback_url {
        Some(url) => format!(
            r#" transcribe="true" transcribeCallback="{}""#,
            xml_escape(url)
        ),
        None => String::new(),
    };
    format!(
        r#"{XML_PROLOGUE}<Response><Say>{}</Say><Record action="{}" method="POST" maxLength="{max_length_secs}" playBeep="true"{transcribe}/><Say>We did not receive a recording. Goodbye.</Say></Response>"#,
        xml_escape(greeting),
        xml_escape(recording_action_url),
    )
}

/// Sent after the recording completes.
pub fn recording_ack_twiml() -> String {
    format!("{XML_PROLOGUE}<Response><Say>Thank you. Your message has been received. Goodbye.</Say><Hangup/></Response>")
}

/// Empty acknowledgement for SMS and status callbacks.
pub fn empty_twiml() -> String {
    format!("{XML_PROLOGUE}<Response></Response>")
}

/// Helper for tests and tooling that need a signed request body.
pub fn signed_form(verifier: &TwilioWebhookVerifier, url: &str, params: &FormParams) -> Result<(String, String)> {
    let signature = verifier
        .sign(url, params)
        .ok_or_else(|| anyhow::anyhow!("failed to compute webhook signature"))?;
    Ok((params.encode(), signature))
}

#[cfg(test)]
mod tests {
    use super::*;

    const URL: &str = "https://hub.example.org/webhooks/twilio/sms";

    fn sms_params() -> FormParams {
        FormParams::from_pairs([
            ("MessageSid", "SM1"),
            ("From", "+15551234567"),
            ("To", "+15559999999"),
            ("Body", "Thanks for your help!"),
        ])
    }

    #[test]
    fn signed_body_verifies() {
        let verifier = TwilioWebhookVerifier::new("token");
        let (body, signature) = signed_form(&verifier, URL, &sms_params()).unwrap();
        assert!(verifier.verify(URL, body.as_bytes(), Some(&signature)));
    }

    #[test]
    fn param_order_does_not_matter() {
        let verifier = TwilioWebhookVerifier::new("token");
        let mut reversed = sms_params();
        reversed.0.reverse();
        assert_eq!(verifier.sign(URL, &sms_params()), verifier.sign(URL, &reversed));
    }

    #[test]
    fn tampering_is_detected() {
        let verifier = TwilioWebhookVerifier::new("token");
        let (_, signature) = signed_form(&verifier, URL, &sms_params()).unwrap();

        let mut tampered = sms_params();
        tampered.0[3].1 = "Send money".into();
        assert!(!verifier.verify(URL, tampered.encode().as_bytes(), Some(&signature)));

        let body = sms_params().encode();
        assert!(!verifier.verify("https://evil.example/sms", body.as_bytes(), Some(&signature)));
        assert!(!TwilioWebhookVerifier::new("other").verify(URL, body.as_bytes(), Some(&signature)));
        assert!(!verifier.verify(URL, body.as_bytes(), None));
        assert!(!verifier.verify(URL, body.as_bytes(), Some("not base64!")));
    }

    #[test]
    fn parses_sms_event() {
        let event = TwilioEvent::parse(WebhookKind::Sms, &sms_params()).unwrap();
        let TwilioEvent::SmsReceived(sms) = event else {
            panic!("expected sms event");
        };
        assert_eq!(sms.message_sid, "SM1");
        assert_eq!(sms.body, "Thanks for your help!");
        assert_eq!(sms.num_media, 0);
    }

    #[test]
    fn recording_requires_url() {
        let params = FormParams::from_pairs([("CallSid", "CA1")]);
        let error = TwilioEvent::parse(WebhookKind::Recording, &params).unwrap_err();
        assert!(error.to_string().contains("RecordingUrl"));
    }

    #[test]
    fn failed_transcription_is_not_completed() {
        let params = FormParams::from_pairs([
            ("CallSid", "CA1"),
            ("TranscriptionStatus", "failed"),
        ]);
        let TwilioEvent::TranscriptionCompleted(event) =
            TwilioEvent::parse(WebhookKind::Transcription, &params).unwrap()
        else {
            panic!("expected transcription event");
        };
        assert!(!event.is_completed());
    }

    #[test]
    fn voice_twiml_escapes_and_records() {
        let twiml = voice_twiml(
            "Hi & welcome",
            "https://hub.example.org/webhooks/twilio/recording?a=1&b=2",
            Some("https://hub.example.org/webhooks/twilio/transcription"),
            120,
        );
        assert!(twiml.contains("<Say>Hi &amp; welcome</Say>"));
        assert!(twiml.contains("recording?a=1&amp;b=2"));
        assert!(twiml.contains(r#"maxLength="120""#));
        assert!(twiml.contains(r#"transcribe="true""#));
        assert_eq!(empty_twiml(), r#"<?xml version="1.0" encoding="UTF-8"?><Response></Response>"#);
    }
}
