//! Reconciles provider-side messages and webhook events against stored
//! communications.

pub mod owner;
pub mod reconciler;

pub use owner::{InboxOwnerResolver, SingleTenantOwner};
pub use reconciler::{ItemFailure, Reconciler, SyncReport, WebhookOutcome};
