//! # archer
//!
//! An iterative prompt-optimization engine. Archer improves a population of
//! prompts for a text-generation task by running cycles of:
//!
//! ```text
//! generate outputs → score against a rubric → (human correction) →
//! synthesize prompt variants → evolutionary selection → next generation
//! ```
//!
//! ## Architecture
//!
//! - [`llm`] — uniform LLM transport with retries, timeouts, and budgets
//! - [`prompt`] — the prompt entity and its parent/child lineage
//! - [`store`] — SQLite persistence of prompts, outputs, evaluations, and
//!   performance snapshots
//! - [`generator`] — applies one prompt to one input (pluggable)
//! - [`evaluator`] — rubric scoring with a tolerant response parser
//! - [`optimizer`] — feedback-driven variant synthesis
//! - [`knowledge`] — knowledge-base loading for evaluator context
//! - [`tracker`] — per-generation metrics and lineage series
//! - [`engine`] — the control loop tying it all together

pub mod config;
pub mod engine;
pub mod evaluator;
pub mod generator;
pub mod knowledge;
pub mod llm;
pub mod optimizer;
pub mod prompt;
pub mod store;
pub mod tracker;

// Re-exports
pub use config::ArcherConfig;
pub use engine::{Archer, CancellationToken, CycleReport, HumanGate, InputSampler};
pub use evaluator::{EvaluationResult, RubricEvaluator};
pub use generator::{ContentGenerator, LlmContentGenerator};
pub use llm::{LlmCaller, LlmClient, OpenRouterClient, ScriptedClient};
pub use optimizer::PromptOptimizer;
pub use prompt::Prompt;
pub use store::Store;
pub use tracker::PerformanceTracker;

/// Initialise tracing with env-filter support. Call once at binary startup.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .try_init();
}
