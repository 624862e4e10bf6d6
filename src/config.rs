//! # Engine configuration
//!
//! ## Responsibility
//! One explicit configuration record constructed at startup and passed into
//! every component. Components hold a reference; nothing reads process-wide
//! state after construction.
//!
//! ## Guarantees
//! - Every field has a documented default
//! - `validate` collects *all* violations before returning (no short-circuit)
//! - Deserializable from JSON/TOML fragments with partial overrides
//!
//! ## NOT Responsible For
//! - Reading config files from disk (callers decide the source)
//! - Provider credentials (injected into the LLM client constructor)

use serde::{Deserialize, Serialize};

// ── Default value functions ──────────────────────────────────────────────

/// Default content-generation temperature.
fn default_generator_temperature() -> f64 {
    0.7
}

/// Default scoring temperature; low for determinism.
fn default_evaluator_temperature() -> f64 {
    0.2
}

/// Default variant-synthesis temperature; high for diversity.
fn default_optimizer_temperature() -> f64 {
    0.9
}

/// Default inputs drawn per prompt per cycle.
fn default_num_simulations_per_prompt() -> usize {
    3
}

/// Default truncation bound for the active prompt set.
fn default_max_prompts_per_cycle() -> usize {
    4
}

/// Default variants requested per surviving prompt.
fn default_num_variants_per_survivor() -> usize {
    3
}

/// Default top fraction of active prompts marked survived.
fn default_survivor_fraction() -> f64 {
    0.5
}

/// Default LLM attempt budget per call.
fn default_llm_max_attempts() -> usize {
    3
}

/// Default per-attempt LLM timeout in seconds.
fn default_llm_per_attempt_timeout_seconds() -> u64 {
    60
}

/// Default overall LLM budget across retries in seconds.
fn default_llm_overall_budget_seconds() -> u64 {
    180
}

/// Default bound on concurrent LLM calls per cycle.
fn default_max_concurrent_llm_calls() -> usize {
    8
}

/// Default improvement epsilon for early stopping; 0.0 disables it.
fn default_epsilon() -> f64 {
    0.0
}

/// Default maximum knowledge passages passed to the evaluator.
fn default_max_context_passages() -> usize {
    5
}

/// Default character bound on the evaluator context window.
fn default_max_context_chars() -> usize {
    8000
}

/// Default traits the optimizer steers variations toward.
fn default_variation_traits() -> Vec<String> {
    ["clarity", "creativity", "specificity", "directness"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_model() -> String {
    "openai/gpt-4-turbo".to_string()
}

// ── Config record ────────────────────────────────────────────────────────

/// Root configuration for an engine instance.
///
/// Every field has a serde default, so a partial JSON object deserializes
/// into a fully populated config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArcherConfig {
    /// Model id used for content generation.
    #[serde(default = "default_model")]
    pub generator_model: String,
    /// Model id used for rubric evaluation.
    #[serde(default = "default_model")]
    pub evaluator_model: String,
    /// Model id used for prompt-variant synthesis.
    #[serde(default = "default_model")]
    pub optimizer_model: String,

    /// Creativity of content generation.
    #[serde(default = "default_generator_temperature")]
    pub generator_temperature: f64,
    /// Determinism of scoring.
    #[serde(default = "default_evaluator_temperature")]
    pub evaluator_temperature: f64,
    /// Diversity of variants.
    #[serde(default = "default_optimizer_temperature")]
    pub optimizer_temperature: f64,

    /// Inputs drawn per prompt per cycle.
    #[serde(default = "default_num_simulations_per_prompt")]
    pub num_simulations_per_prompt: usize,
    /// Truncation bound for the active prompt set.
    #[serde(default = "default_max_prompts_per_cycle")]
    pub max_prompts_per_cycle: usize,
    /// Variants requested per surviving prompt.
    #[serde(default = "default_num_variants_per_survivor")]
    pub num_variants_per_survivor: usize,
    /// Top fraction of active prompts marked survived, in (0, 1].
    #[serde(default = "default_survivor_fraction")]
    pub survivor_fraction: f64,

    /// Whether the cycle suspends for human annotation after the forward pass.
    #[serde(default)]
    pub human_gate: bool,
    /// Average multiple human evaluations per output instead of latest-wins.
    #[serde(default)]
    pub human_eval_averaging: bool,

    /// Optional wall-clock budget for a whole cycle, in seconds.
    #[serde(default)]
    pub cycle_wall_budget_seconds: Option<u64>,

    /// Attempt budget per LLM call.
    #[serde(default = "default_llm_max_attempts")]
    pub llm_max_attempts: usize,
    /// Per-attempt LLM timeout in seconds.
    #[serde(default = "default_llm_per_attempt_timeout_seconds")]
    pub llm_per_attempt_timeout_seconds: u64,
    /// Overall LLM budget across retries in seconds.
    #[serde(default = "default_llm_overall_budget_seconds")]
    pub llm_overall_budget_seconds: u64,
    /// Bound on concurrent LLM calls per cycle.
    #[serde(default = "default_max_concurrent_llm_calls")]
    pub max_concurrent_llm_calls: usize,

    /// Best-score improvement below which the training loop stops early.
    /// 0.0 disables early stopping.
    #[serde(default = "default_epsilon")]
    pub epsilon: f64,

    /// Maximum knowledge passages concatenated into the evaluator context.
    #[serde(default = "default_max_context_passages")]
    pub max_context_passages: usize,
    /// Character bound on the evaluator context window.
    #[serde(default = "default_max_context_chars")]
    pub max_context_chars: usize,

    /// Traits the optimizer steers variant calls toward.
    #[serde(default = "default_variation_traits")]
    pub variation_traits: Vec<String>,
}

impl Default for ArcherConfig {
    fn default() -> Self {
        Self {
            generator_model: default_model(),
            evaluator_model: default_model(),
            optimizer_model: default_model(),
            generator_temperature: default_generator_temperature(),
            evaluator_temperature: default_evaluator_temperature(),
            optimizer_temperature: default_optimizer_temperature(),
            num_simulations_per_prompt: default_num_simulations_per_prompt(),
            max_prompts_per_cycle: default_max_prompts_per_cycle(),
            num_variants_per_survivor: default_num_variants_per_survivor(),
            survivor_fraction: default_survivor_fraction(),
            human_gate: false,
            human_eval_averaging: false,
            cycle_wall_budget_seconds: None,
            llm_max_attempts: default_llm_max_attempts(),
            llm_per_attempt_timeout_seconds: default_llm_per_attempt_timeout_seconds(),
            llm_overall_budget_seconds: default_llm_overall_budget_seconds(),
            max_concurrent_llm_calls: default_max_concurrent_llm_calls(),
            epsilon: default_epsilon(),
            max_context_passages: default_max_context_passages(),
            max_context_chars: default_max_context_chars(),
            variation_traits: default_variation_traits(),
        }
    }
}

/// A semantic violation in an [`ArcherConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A field carries an out-of-range or contradictory value.
    #[error("field '{field}' has invalid value {value}: {reason}")]
    InvalidField {
        /// Field name as written in the config.
        field: String,
        /// String rendering of the invalid value.
        value: String,
        /// The violated constraint.
        reason: String,
    },
}

impl ArcherConfig {
    /// Validate all semantic constraints, collecting every violation.
    pub fn validate(&self) -> Result<(), Vec<ConfigError>> {
        let mut errors = Vec::new();

        let temp_fields = [
            ("generator_temperature", self.generator_temperature),
            ("evaluator_temperature", self.evaluator_temperature),
            ("optimizer_temperature", self.optimizer_temperature),
        ];
        for (field, value) in temp_fields {
            if !(0.0..=2.0).contains(&value) {
                errors.push(ConfigError::InvalidField {
                    field: field.to_string(),
                    value: value.to_string(),
                    reason: "temperature must be within [0.0, 2.0]".to_string(),
                });
            }
        }

        if !(self.survivor_fraction > 0.0 && self.survivor_fraction <= 1.0) {
            errors.push(ConfigError::InvalidField {
                field: "survivor_fraction".to_string(),
                value: self.survivor_fraction.to_string(),
                reason: "must be within (0, 1]".to_string(),
            });
        }

        let positive_fields = [
            ("num_simulations_per_prompt", self.num_simulations_per_prompt),
            ("max_prompts_per_cycle", self.max_prompts_per_cycle),
            ("num_variants_per_survivor", self.num_variants_per_survivor),
            ("llm_max_attempts", self.llm_max_attempts),
            ("max_concurrent_llm_calls", self.max_concurrent_llm_calls),
        ];
        for (field, value) in positive_fields {
            if value == 0 {
                errors.push(ConfigError::InvalidField {
                    field: field.to_string(),
                    value: "0".to_string(),
                    reason: "must be at least 1".to_string(),
                });
            }
        }

        if self.llm_per_attempt_timeout_seconds == 0 {
            errors.push(ConfigError::InvalidField {
                field: "llm_per_attempt_timeout_seconds".to_string(),
                value: "0".to_string(),
                reason: "must be at least 1 second".to_string(),
            });
        }
        if self.llm_overall_budget_seconds < self.llm_per_attempt_timeout_seconds {
            errors.push(ConfigError::InvalidField {
                field: "llm_overall_budget_seconds".to_string(),
                value: self.llm_overall_budget_seconds.to_string(),
                reason: "must cover at least one full attempt".to_string(),
            });
        }

        if self.epsilon < 0.0 {
            errors.push(ConfigError::InvalidField {
                field: "epsilon".to_string(),
                value: self.epsilon.to_string(),
                reason: "must be non-negative".to_string(),
            });
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
