//! Content generation: applies one prompt to one input.
//!
//! [`ContentGenerator`] is the narrow seam domain-specific generators plug
//! into; the control loop holds one instance and swapping is dependency
//! injection. The default [`LlmContentGenerator`] substitutes the `{input}`
//! slot and forwards the filled prompt to the LLM caller.

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use crate::llm::{CompletionRequest, LlmCaller, LlmError};
use crate::prompt::INPUT_SLOT;

/// Errors from content generation.
#[derive(Debug, Error)]
pub enum GeneratorError {
    /// The prompt does not contain exactly one `{input}` slot. Raised before
    /// any LLM call.
    #[error("prompt is missing the {{input}} slot (found {found} occurrences)")]
    SlotMissing {
        /// Number of slot occurrences actually present.
        found: usize,
    },

    /// The underlying LLM call failed.
    #[error(transparent)]
    Llm(#[from] LlmError),
}

impl GeneratorError {
    /// Stable kind string for failure accounting in reports.
    pub fn kind(&self) -> &'static str {
        match self {
            GeneratorError::SlotMissing { .. } => "SLOT_MISSING",
            GeneratorError::Llm(e) => e.kind(),
        }
    }
}

/// Trait for content generators.
///
/// A domain generator may take structured input instead of a plain string;
/// it must expose this same signature externally and document its own slot
/// contract.
#[async_trait]
pub trait ContentGenerator: Send + Sync {
    /// Produce content by applying `prompt_content` to `input_data`.
    async fn generate(
        &self,
        prompt_content: &str,
        input_data: &str,
    ) -> Result<String, GeneratorError>;
}

/// Default generator: fills the `{input}` slot and calls the LLM.
pub struct LlmContentGenerator {
    caller: LlmCaller,
    model_id: String,
    temperature: f64,
}

impl LlmContentGenerator {
    pub fn new(caller: LlmCaller, model_id: impl Into<String>, temperature: f64) -> Self {
        Self {
            caller,
            model_id: model_id.into(),
            temperature,
        }
    }
}

#[async_trait]
impl ContentGenerator for LlmContentGenerator {
    async fn generate(
        &self,
        prompt_content: &str,
        input_data: &str,
    ) -> Result<String, GeneratorError> {
        let found = prompt_content.matches(INPUT_SLOT).count();
        if found != 1 {
            return Err(GeneratorError::SlotMissing { found });
        }

        let filled = prompt_content.replace(INPUT_SLOT, input_data);
        debug!(prompt_len = filled.len(), "generating content");

        let request = CompletionRequest::new(&self.model_id, filled, self.temperature);
        let text = self.caller.call(&request).await?;
        Ok(text.trim_end().to_string())
    }
}
