//! Prompt entity: an immutable-identity record carrying content, score,
//! feedback, and parent linkage across generations.
//!
//! A prompt at generation g > 0 can only be created through
//! [`Prompt::derive_child`], which stamps the parent id and bumps the
//! generation. Score and feedback attachments are last-writer-wins in
//! memory; every attachment is also persisted by the control loop as a
//! fresh `prompt_performance` row so history stays recoverable.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The substring every generator prompt must contain exactly once.
pub const INPUT_SLOT: &str = "{input}";

/// A prompt template under optimization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prompt {
    /// Stable unique identifier.
    pub id: String,
    /// The template text, containing exactly one `{input}` slot.
    pub content: String,
    /// Generation index; 0 for seeded prompts.
    pub generation: u32,
    /// Mean score over this prompt's evaluated outputs, once known.
    pub score: Option<f64>,
    /// Aggregated evaluator feedback, once known.
    pub feedback: Option<String>,
    /// Whether this prompt advances into the next generation's candidate set.
    pub survived: bool,
    /// Id of the prompt this one was derived from, if any.
    pub parent_id: Option<String>,
    /// Model the prompt is written for.
    pub model_id: String,
    /// Declared purpose, carried verbatim into derived children.
    pub purpose: String,
    /// RFC 3339 creation timestamp.
    pub created_at: String,
}

impl Prompt {
    /// Construct a generation-0 prompt with a fresh id.
    pub fn new(
        content: impl Into<String>,
        model_id: impl Into<String>,
        purpose: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            content: content.into(),
            generation: 0,
            score: None,
            feedback: None,
            survived: false,
            parent_id: None,
            model_id: model_id.into(),
            purpose: purpose.into(),
            created_at: Utc::now().to_rfc3339(),
        }
    }

    /// Attach a score and feedback, replacing any previous attachment.
    pub fn attach_score(&mut self, score: f64, feedback: impl Into<String>) {
        self.score = Some(score);
        self.feedback = Some(feedback.into());
    }

    /// Set the survival flag.
    pub fn mark_survived(&mut self, survived: bool) {
        self.survived = survived;
    }

    /// Derive a child prompt with new content, `parent_id` set to this
    /// prompt's id, and generation incremented by one.
    ///
    /// This is the only way to create a prompt at generation > 0.
    pub fn derive_child(&self, new_content: impl Into<String>) -> Prompt {
        Prompt {
            id: Uuid::new_v4().to_string(),
            content: new_content.into(),
            generation: self.generation + 1,
            score: None,
            feedback: None,
            survived: false,
            parent_id: Some(self.id.clone()),
            model_id: self.model_id.clone(),
            purpose: self.purpose.clone(),
            created_at: Utc::now().to_rfc3339(),
        }
    }

    /// Number of `{input}` slot occurrences in the content.
    pub fn slot_count(&self) -> usize {
        self.content.matches(INPUT_SLOT).count()
    }

    /// True when the content carries exactly one `{input}` slot.
    pub fn has_single_slot(&self) -> bool {
        self.slot_count() == 1
    }

    /// A bounded excerpt of the content for logs and history rows.
    pub fn content_excerpt(&self, max_chars: usize) -> String {
        if self.content.chars().count() <= max_chars {
            return self.content.clone();
        }
        let head: String = self.content.chars().take(max_chars).collect();
        format!("{head}...")
    }
}
