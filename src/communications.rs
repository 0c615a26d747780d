//! Communication data model and storage.

pub mod model;
pub mod store;

pub use model::{
    Communication, CommunicationDraft, CommunicationKind, CommunicationMetadata,
    CommunicationStatus, Direction, Origin, TranscriptionStatus,
};
pub use store::{CommunicationStore, InsertOutcome, UpsertOutcome};
