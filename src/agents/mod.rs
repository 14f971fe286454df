//! Analysis agents run by the background workers.
//!
//! Each job payload maps to one prompt and one model call. The extraction
//! modules ask for JSON and validate it before it becomes a job result.

pub mod analyzer;
pub mod extraction;
pub mod prompts;

pub use analyzer::{Analyzer, LlmAnalyzer};
pub use extraction::{CompletenessReport, HealthMetrics};
