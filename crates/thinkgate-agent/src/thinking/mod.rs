//! The recursive thinking engine: generate, critique, score, repeat.

mod engine;
/// Prompt construction for generate and critique calls.
pub mod prompts;
pub mod score;
mod types;

pub use engine::RecursiveThinkingEngine;
pub use score::{parse_assessment, Assessment};
pub use types::{StopReason, ThinkingRequest, ThinkingResult, ThinkingRound};
