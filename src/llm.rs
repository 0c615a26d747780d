//! LLM completion client, prompt templates, and response parsing helpers.

pub mod client;
pub mod json;
pub mod prompts;

pub use client::{CompletionRequest, LlmClient, OpenAiCompatibleClient};
pub use prompts::PromptEngine;
