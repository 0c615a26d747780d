//! Authenticated clients for the mail and telephony providers.

pub mod gmail;
pub mod token_store;
pub mod twilio;

pub use gmail::{GmailClient, GmailTokens, MailSource, MessageRef, RawMailMessage};
pub use token_store::TokenStore;
pub use twilio::{TwilioEvent, TwilioWebhookVerifier};
