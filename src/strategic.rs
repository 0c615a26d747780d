//! Strategic rollups: periodic situation reports aggregated over analysed
//! communications, gated by a new-communication counter.

pub mod engine;
pub mod model;
pub mod store;

pub use engine::{CategoryBucket, RollupEngine, RollupTrigger};
pub use model::{CriticalIssue, SampleCommunication, StrategicAnalysis, Urgency};
pub use store::StrategicStore;
