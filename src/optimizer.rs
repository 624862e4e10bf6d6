//! # Prompt optimization
//!
//! ## Responsibility
//! Synthesize new prompt variants from a parent prompt plus its aggregated
//! evaluation feedback, while preserving the `{input}` slot and the parent's
//! declared purpose.
//!
//! ## Guarantees
//! - One independent LLM call per variant, each steered toward different
//!   variation traits, so variants diverge
//! - Every emitted variant carries exactly one `{input}` slot; violators get
//!   one repair attempt and are then discarded
//! - Near-duplicates of the parent or of an accepted sibling are discarded
//!   (heuristic: normalized edit distance below 0.05)
//!
//! ## NOT Responsible For
//! - Persisting variants (control loop + store)
//! - Deciding which prompts survive (control loop)

use rand::seq::SliceRandom;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::llm::{CompletionRequest, LlmCaller, LlmError};
use crate::prompt::{Prompt, INPUT_SLOT};

/// Errors from variant synthesis.
#[derive(Debug, Error)]
pub enum OptimizerError {
    /// The underlying LLM call failed.
    #[error(transparent)]
    Llm(#[from] LlmError),
}

/// Result of one optimization round for a single parent.
#[derive(Debug, Default)]
pub struct OptimizeOutcome {
    /// Accepted variants, already linked to the parent (generation + 1).
    pub variants: Vec<Prompt>,
    /// Variant texts discarded because the slot invariant could not be
    /// repaired.
    pub slot_discards: usize,
    /// Variant texts discarded as near-duplicates.
    pub duplicate_discards: usize,
}

/// Variant synthesizer over an [`LlmCaller`].
pub struct PromptOptimizer {
    caller: LlmCaller,
    model_id: String,
    temperature: f64,
    variation_traits: Vec<String>,
}

impl PromptOptimizer {
    pub fn new(caller: LlmCaller, model_id: impl Into<String>, temperature: f64) -> Self {
        Self {
            caller,
            model_id: model_id.into(),
            temperature,
            variation_traits: Vec::new(),
        }
    }

    /// Traits to steer variation calls toward; two are drawn per variant.
    pub fn with_variation_traits(mut self, traits: Vec<String>) -> Self {
        self.variation_traits = traits;
        self
    }

    /// Produce up to `num_variants` children of `parent`.
    ///
    /// Feedback strings are deduplicated before being summarized into the
    /// optimizer prompt. Each variant comes from an independent LLM call.
    ///
    /// # Errors
    ///
    /// Only transport-level failures surface as `Err`; slot violations and
    /// duplicates are counted in the returned [`OptimizeOutcome`].
    pub async fn optimize(
        &self,
        parent: &Prompt,
        aggregated_feedback: &[String],
        num_variants: usize,
    ) -> Result<OptimizeOutcome, OptimizerError> {
        let feedback_summary = dedup_feedback(aggregated_feedback);
        let mut outcome = OptimizeOutcome::default();

        for index in 0..num_variants {
            let traits = self.draw_traits();
            let prompt = self.build_variant_prompt(parent, &feedback_summary, &traits);
            let request = CompletionRequest::new(&self.model_id, prompt, self.temperature);
            let text = match self.caller.call(&request).await {
                Ok(text) => clean_variant_text(&text),
                Err(e) if e.is_retriable() => {
                    // The caller already exhausted its retries; skip this slot.
                    warn!(index, error = %e, "variant call failed, skipping");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let text = match self.ensure_slot(&text).await? {
                Some(text) => text,
                None => {
                    warn!(index, "variant lost the input slot and repair failed, discarding");
                    outcome.slot_discards += 1;
                    continue;
                }
            };

            if is_near_duplicate(&text, parent, &outcome.variants) {
                debug!(index, "variant is a near-duplicate, discarding");
                outcome.duplicate_discards += 1;
                continue;
            }

            outcome.variants.push(parent.derive_child(text));
        }

        info!(
            parent = %parent.id,
            accepted = outcome.variants.len(),
            slot_discards = outcome.slot_discards,
            duplicate_discards = outcome.duplicate_discards,
            "variant synthesis complete"
        );
        Ok(outcome)
    }

    fn draw_traits(&self) -> Vec<&str> {
        let mut rng = rand::thread_rng();
        self.variation_traits
            .choose_multiple(&mut rng, 2.min(self.variation_traits.len()))
            .map(String::as_str)
            .collect()
    }

    fn build_variant_prompt(&self, parent: &Prompt, feedback: &str, traits: &[&str]) -> String {
        let mut prompt = String::new();
        prompt.push_str("Improve the following prompt based on feedback.\n\n");
        prompt.push_str("Original Prompt: ");
        prompt.push_str(&parent.content);
        prompt.push_str("\n\n");
        if !feedback.is_empty() {
            prompt.push_str("Feedback: ");
            prompt.push_str(feedback);
            prompt.push('\n');
        }
        match parent.score {
            Some(score) => {
                prompt.push_str(&format!("Score: {score:.2} out of 5.\n"));
            }
            None => prompt.push_str("Score: not yet evaluated.\n"),
        }
        prompt.push_str("\nRequirements:\n");
        prompt.push_str("- Keep exactly one {input} placeholder.\n");
        prompt.push_str(&format!("- Keep the prompt's purpose: {}.\n", parent.purpose));
        if !traits.is_empty() {
            prompt.push_str(&format!(
                "- Focus the variation on {}.\n",
                traits.join(" and ")
            ));
        }
        prompt.push_str("\nImproved Prompt:");
        prompt
    }

    /// Verify the slot invariant, issuing one repair call if violated.
    /// Returns `None` when the repaired text still violates it.
    async fn ensure_slot(&self, text: &str) -> Result<Option<String>, OptimizerError> {
        if text.matches(INPUT_SLOT).count() == 1 {
            return Ok(Some(text.to_string()));
        }

        let repair = CompletionRequest::new(
            &self.model_id,
            format!(
                "The following prompt must contain the placeholder {{input}} exactly \
                 once. Rewrite it so it does, changing nothing else:\n\n{text}"
            ),
            self.temperature,
        );
        match self.caller.call(&repair).await {
            Ok(repaired) => {
                let repaired = clean_variant_text(&repaired);
                if repaired.matches(INPUT_SLOT).count() == 1 {
                    Ok(Some(repaired))
                } else {
                    Ok(None)
                }
            }
            Err(e) if e.is_retriable() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Concatenate feedback strings, dropping exact duplicates in order.
fn dedup_feedback(feedback: &[String]) -> String {
    let mut seen = Vec::new();
    for item in feedback {
        let trimmed = item.trim();
        if trimmed.is_empty() || seen.iter().any(|s: &&str| *s == trimmed) {
            continue;
        }
        seen.push(trimmed);
    }
    seen.join("; ")
}

/// Strip a leading echo of the "Improved Prompt:" label and trim.
fn clean_variant_text(text: &str) -> String {
    let trimmed = text.trim();
    for label in ["Improved Prompt:", "Varied Prompt:"] {
        if let Some(head) = trimmed.get(..label.len()) {
            if head.eq_ignore_ascii_case(label) {
                return trimmed[label.len()..].trim().to_string();
            }
        }
    }
    trimmed.to_string()
}

fn is_near_duplicate(candidate: &str, parent: &Prompt, accepted: &[Prompt]) -> bool {
    if near(candidate, &parent.content) {
        return true;
    }
    accepted.iter().any(|v| near(candidate, &v.content))
}

fn near(a: &str, b: &str) -> bool {
    let a = collapse_whitespace(a);
    let b = collapse_whitespace(b);
    if a == b {
        return true;
    }
    normalized_edit_distance(&a, &b) < 0.05
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Levenshtein distance divided by the longer length, in [0, 1].
fn normalized_edit_distance(a: &str, b: &str) -> f64 {
    let a_chars: Vec<char> = a.chars().collect();
    let b_chars: Vec<char> = b.chars().collect();
    let longest = a_chars.len().max(b_chars.len());
    if longest == 0 {
        return 0.0;
    }
    levenshtein(&a_chars, &b_chars) as f64 / longest as f64
}

fn levenshtein(a: &[char], b: &[char]) -> usize {
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }
    let mut previous: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0usize; b.len() + 1];
    for (i, &ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, &cb) in b.iter().enumerate() {
            let substitution = previous[j] + usize::from(ca != cb);
            current[j + 1] = substitution
                .min(previous[j + 1] + 1)
                .min(current[j] + 1);
        }
        std::mem::swap(&mut previous, &mut current);
    }
    previous[b.len()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedClient;
    use std::sync::Arc;

    fn parent() -> Prompt {
        let mut p = Prompt::new("Summarize: {input}", "gpt-4", "summary");
        p.attach_score(3.5, "too wordy");
        p
    }

    fn optimizer_with(client: Arc<ScriptedClient>) -> PromptOptimizer {
        PromptOptimizer::new(LlmCaller::new(client), "opt-model", 0.9).with_variation_traits(
            ["clarity", "specificity"].into_iter().map(String::from).collect(),
        )
    }

    #[tokio::test]
    async fn test_optimize_creates_linked_variants() {
        let client = Arc::new(ScriptedClient::new());
        client.push_text("Summarize in one sentence: {input}");
        client.push_text("Write a terse summary of: {input}");
        let optimizer = optimizer_with(client.clone());
        let parent = parent();

        let outcome = optimizer
            .optimize(&parent, &["too wordy".to_string()], 2)
            .await
            .unwrap();
        assert_eq!(outcome.variants.len(), 2);
        for variant in &outcome.variants {
            assert_eq!(variant.parent_id.as_deref(), Some(parent.id.as_str()));
            assert_eq!(variant.generation, parent.generation + 1);
            assert_eq!(variant.content.matches("{input}").count(), 1);
        }
        assert_eq!(client.received().len(), 2, "one independent call per variant");
    }

    #[tokio::test]
    async fn test_optimizer_prompt_carries_feedback_and_requirements() {
        let client = Arc::new(ScriptedClient::new());
        client.push_text("Condense: {input}");
        let optimizer = optimizer_with(client.clone());
        let parent = parent();

        let _ = optimizer
            .optimize(&parent, &["too wordy".to_string(), "misses key facts".to_string()], 1)
            .await
            .unwrap();

        let prompt = &client.received()[0].prompt_text;
        assert!(prompt.contains("Summarize: {input}"));
        assert!(prompt.contains("too wordy; misses key facts"));
        assert!(prompt.contains("exactly one {input}"));
        assert!(prompt.contains("purpose: summary"));
        assert!(prompt.contains("Score: 3.50 out of 5"));
    }

    #[tokio::test]
    async fn test_feedback_deduplicated() {
        let client = Arc::new(ScriptedClient::new());
        client.push_text("Condense: {input}");
        let optimizer = optimizer_with(client.clone());

        let feedback = vec!["too wordy".to_string(), "too wordy".to_string()];
        let _ = optimizer.optimize(&parent(), &feedback, 1).await.unwrap();
        let prompt = &client.received()[0].prompt_text;
        assert_eq!(prompt.matches("too wordy").count(), 1);
    }

    #[tokio::test]
    async fn test_uses_optimizer_temperature() {
        let client = Arc::new(ScriptedClient::new());
        client.push_text("Condense: {input}");
        let optimizer = optimizer_with(client.clone());
        let _ = optimizer.optimize(&parent(), &[], 1).await.unwrap();
        assert!((client.received()[0].temperature - 0.9).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_slot_violation_repaired_once() {
        let client = Arc::new(ScriptedClient::new());
        client.push_text("Summarize the text briefly.");
        client.push_text("Summarize the text briefly: {input}");
        let optimizer = optimizer_with(client.clone());

        let outcome = optimizer.optimize(&parent(), &[], 1).await.unwrap();
        assert_eq!(outcome.variants.len(), 1);
        assert_eq!(outcome.slot_discards, 0);
        let requests = client.received();
        assert_eq!(requests.len(), 2);
        assert!(requests[1].prompt_text.contains("exactly"));
    }

    #[tokio::test]
    async fn test_unrepairable_slot_violation_discarded() {
        let client = Arc::new(ScriptedClient::new());
        client.push_text("Summarize the text briefly.");
        client.push_text("Still no slot.");
        let optimizer = optimizer_with(client.clone());

        let outcome = optimizer.optimize(&parent(), &[], 1).await.unwrap();
        assert!(outcome.variants.is_empty());
        assert_eq!(outcome.slot_discards, 1);
    }

    #[tokio::test]
    async fn test_near_duplicate_of_parent_discarded() {
        let client = Arc::new(ScriptedClient::new());
        client.push_text("Summarize:   {input}");
        let optimizer = optimizer_with(client.clone());

        let outcome = optimizer.optimize(&parent(), &[], 1).await.unwrap();
        assert!(outcome.variants.is_empty());
        assert_eq!(outcome.duplicate_discards, 1);
    }

    #[tokio::test]
    async fn test_near_duplicate_of_sibling_discarded() {
        let client = Arc::new(ScriptedClient::new());
        client.push_text("Write one concise factual summary sentence about: {input}");
        client.push_text("Write one concise factual summary sentence about: {input} ");
        let optimizer = optimizer_with(client.clone());

        let outcome = optimizer.optimize(&parent(), &[], 2).await.unwrap();
        assert_eq!(outcome.variants.len(), 1);
        assert_eq!(outcome.duplicate_discards, 1);
    }

    #[tokio::test]
    async fn test_variant_label_echo_stripped() {
        let client = Arc::new(ScriptedClient::new());
        client.push_text("Improved Prompt: Condense this: {input}");
        let optimizer = optimizer_with(client.clone());

        let outcome = optimizer.optimize(&parent(), &[], 1).await.unwrap();
        assert_eq!(outcome.variants[0].content, "Condense this: {input}");
    }

    #[tokio::test]
    async fn test_failed_variant_call_skips_slot() {
        let client = Arc::new(ScriptedClient::new());
        // exhausted script == Malformed errors, which are retriable and
        // therefore skipped rather than fatal
        let optimizer = PromptOptimizer::new(
            LlmCaller::new(client).with_policy(crate::llm::RetryPolicy::exponential(
                1,
                std::time::Duration::from_millis(1),
            )),
            "opt-model",
            0.9,
        );
        let outcome = optimizer.optimize(&parent(), &[], 2).await.unwrap();
        assert!(outcome.variants.is_empty());
    }

    #[test]
    fn test_normalized_edit_distance() {
        assert!(normalized_edit_distance("abcd", "abcd") < f64::EPSILON);
        assert!((normalized_edit_distance("abcd", "abce") - 0.25).abs() < f64::EPSILON);
        assert!((normalized_edit_distance("", "ab") - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_whitespace_only_difference_is_duplicate() {
        let p = Prompt::new("Summarize: {input}", "m", "p");
        assert!(is_near_duplicate("Summarize:    {input}", &p, &[]));
    }

    #[test]
    fn test_dedup_feedback_drops_blanks_and_repeats() {
        let feedback = vec![
            "a".to_string(),
            " ".to_string(),
            "a".to_string(),
            "b".to_string(),
        ];
        assert_eq!(dedup_feedback(&feedback), "a; b");
    }
}
