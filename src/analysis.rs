//! Per-communication LLM analysis: data model, storage, and the
//! classification pipeline that produces it.

pub mod classifier;
pub mod model;
pub mod store;

pub use classifier::{
    BatchOutcome, ClassifyOutcome, Classifier, FailedItem, ReanalyzeOutcome, SkipReason,
    SkippedItem,
};
pub use model::{Analysis, Categories, Classification, Entities, Sentiment, SentimentLabel};
pub use store::{AnalysisStore, AnalyzedCommunication};
