//! # Control loop
//!
//! ## Responsibility
//! Orchestrate one full optimization cycle:
//! ```text
//! SELECT_ACTIVE → FORWARD_PASS → (optional) HUMAN_GATE → BACKWARD_PASS → COMMIT_GENERATION
//! ```
//! and the outer training loop that repeats cycles until the budget, input
//! exhaustion, cancellation, or an improvement-epsilon stop.
//!
//! ## Guarantees
//! - Forward-pass pairs fan out under a bounded semaphore; within a pair,
//!   generation happens-before evaluation by data dependency
//! - Per-pair failures are isolated and counted in the [`CycleReport`];
//!   nothing is lost silently
//! - A cycle commits atomically (survivor flags + variants + generation
//!   bump) or commits nothing
//! - A cancelled or budget-stopped cycle never advances the generation
//!   counter and never marks a prompt survived
//!
//! ## NOT Responsible For
//! - Scoring semantics (evaluator) or variant synthesis (optimizer)
//! - Aggregate SQL (store)

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ArcherConfig;
use crate::evaluator::{EvaluationResult, EvaluatorError, RubricEvaluator};
use crate::generator::{ContentGenerator, LlmContentGenerator};
use crate::knowledge;
use crate::llm::{LlmCaller, LlmClient, RetryPolicy};
use crate::optimizer::PromptOptimizer;
use crate::prompt::Prompt;
use crate::store::{AnnotationItem, PerformanceSnapshot, Store, StoreError};

/// Source of simulated inputs. May be finite; exhaustion ends the training
/// loop.
pub trait InputSampler: Send {
    /// Draw the next input record, or `None` when the source is exhausted.
    fn next_input(&mut self) -> Option<String>;
}

impl<F> InputSampler for F
where
    F: FnMut() -> Option<String> + Send,
{
    fn next_input(&mut self) -> Option<String> {
        (self)()
    }
}

/// Suspension point for human annotation.
///
/// When the gate is enabled the cycle hands over the round's outputs and
/// resumes only after this call returns; human feedback is expected to have
/// been recorded out-of-band via [`Store::store_human_feedback`].
#[async_trait]
pub trait HumanGate: Send + Sync {
    async fn annotate(&self, round_num: u32, items: Vec<AnnotationItem>) -> Result<(), EngineError>;
}

/// Cooperative cancellation token wrapping an `AtomicBool`.
///
/// Cancellation takes effect between (prompt, input) pairs; in-flight LLM
/// calls finish and their results are kept, but no generation is committed.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }
}

/// Pipeline stage a failure was observed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CycleStage {
    SelectActive,
    ForwardPass,
    HumanGate,
    BackwardPass,
    Commit,
}

/// Count of one failure kind at one stage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StageFailure {
    pub stage: CycleStage,
    pub kind: String,
    pub count: usize,
}

/// Summary of one cycle, successes and failures alike.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleReport {
    /// Round number this cycle operated on.
    pub generation: u32,
    /// Active prompts that received at least one recorded evaluation.
    pub prompts_evaluated: usize,
    /// Output rows persisted this cycle.
    pub outputs_produced: usize,
    /// Evaluation rows persisted this cycle (parse failures included).
    pub evaluations_recorded: usize,
    /// Mean of the active prompts' mean scores; `None` with no scored data.
    pub mean_score: Option<f64>,
    /// Best active prompt mean; `None` with no scored data.
    pub best_score: Option<f64>,
    /// Prompts marked survived.
    pub survivors: usize,
    /// Variant prompts persisted for the next generation.
    pub new_variants: usize,
    /// Failure counts by stage and kind.
    pub failures: Vec<StageFailure>,
}

/// Errors that abort a cycle outright.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A seeded prompt lacks the `{input}` slot: misconfiguration, fatal.
    #[error("seeded prompt {prompt_id} does not contain exactly one {{input}} slot")]
    SlotMissing { prompt_id: String },

    /// No candidate prompts exist for the current generation.
    #[error("no candidate prompts available for generation {generation}")]
    NoCandidates { generation: u32 },

    /// The input sampler was exhausted before any pair could run.
    #[error("input sampler exhausted")]
    InputExhausted,

    /// Persistence failed at a point the cycle cannot isolate.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The human annotation surface failed.
    #[error("human gate failed: {0}")]
    HumanGate(String),
}

// ── Internal bookkeeping ─────────────────────────────────────────────────

#[derive(Default)]
struct FailureTally {
    counts: BTreeMap<(CycleStage, String), usize>,
}

impl FailureTally {
    fn record(&mut self, stage: CycleStage, kind: impl Into<String>) {
        *self.counts.entry((stage, kind.into())).or_insert(0) += 1;
    }

    fn into_failures(self) -> Vec<StageFailure> {
        self.counts
            .into_iter()
            .map(|((stage, kind), count)| StageFailure { stage, kind, count })
            .collect()
    }
}

struct PairResult {
    prompt_id: String,
    output_stored: bool,
    evaluation_recorded: bool,
    parse_error: bool,
    failure_kind: Option<String>,
}

struct ForwardOutcome {
    results: Vec<PairResult>,
    sampler_exhausted: bool,
}

/// Retry a store write with linear backoff, three attempts total.
async fn retry_store<T>(mut op: impl FnMut() -> Result<T, StoreError>) -> Result<T, StoreError> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if attempt < 3 => {
                warn!(attempt, error = %e, "store write failed, retrying");
                tokio::time::sleep(Duration::from_millis(50 * attempt as u64)).await;
            }
            Err(e) => return Err(e),
        }
    }
}

// ── Engine ───────────────────────────────────────────────────────────────

/// The optimization engine: owns the components and the generation counter.
pub struct Archer {
    config: ArcherConfig,
    store: Store,
    generator: Arc<dyn ContentGenerator>,
    evaluator: Arc<RubricEvaluator>,
    optimizer: Arc<PromptOptimizer>,
    human_gate: Option<Arc<dyn HumanGate>>,
    cancel: CancellationToken,
    generation: u32,
}

impl Archer {
    pub fn new(
        config: ArcherConfig,
        store: Store,
        generator: Arc<dyn ContentGenerator>,
        evaluator: Arc<RubricEvaluator>,
        optimizer: Arc<PromptOptimizer>,
    ) -> Self {
        Self {
            config,
            store,
            generator,
            evaluator,
            optimizer,
            human_gate: None,
            cancel: CancellationToken::new(),
            generation: 0,
        }
    }

    /// Build an engine with the standard component wiring: one shared
    /// transport, and generator/evaluator/optimizer configured from `config`.
    ///
    /// `knowledge` documents are bounded into the evaluator's context window;
    /// pass an empty slice when no knowledge base is available.
    pub fn with_client(
        config: ArcherConfig,
        store: Store,
        client: Arc<dyn LlmClient>,
        rubric: impl Into<String>,
        knowledge_docs: &[String],
    ) -> Self {
        let caller = LlmCaller::new(client)
            .with_policy(RetryPolicy {
                max_attempts: config.llm_max_attempts,
                ..RetryPolicy::default()
            })
            .with_per_attempt_timeout(Duration::from_secs(config.llm_per_attempt_timeout_seconds))
            .with_overall_budget(Duration::from_secs(config.llm_overall_budget_seconds));

        let generator = Arc::new(LlmContentGenerator::new(
            caller.clone(),
            config.generator_model.clone(),
            config.generator_temperature,
        ));
        let passages = knowledge::select_context(
            knowledge_docs,
            config.max_context_passages,
            config.max_context_chars,
        );
        let evaluator = Arc::new(
            RubricEvaluator::new(
                caller.clone(),
                config.evaluator_model.clone(),
                config.evaluator_temperature,
                rubric,
            )
            .with_context_passages(passages)
            .with_context_bounds(config.max_context_passages, config.max_context_chars),
        );
        let optimizer = Arc::new(
            PromptOptimizer::new(
                caller,
                config.optimizer_model.clone(),
                config.optimizer_temperature,
            )
            .with_variation_traits(config.variation_traits.clone()),
        );
        let store = store.with_human_averaging(config.human_eval_averaging);
        Self::new(config, store, generator, evaluator, optimizer)
    }

    /// Install the human annotation gate; effective when
    /// `config.human_gate` is set.
    pub fn with_human_gate(mut self, gate: Arc<dyn HumanGate>) -> Self {
        self.human_gate = Some(gate);
        self
    }

    /// Token external code can use to cancel a running cycle.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Current generation counter.
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Validate and persist the generation-0 prompts.
    ///
    /// # Errors
    ///
    /// [`EngineError::SlotMissing`] when a seed lacks exactly one `{input}`
    /// slot — seeding a malformed prompt is a misconfiguration.
    pub fn seed_prompts(&self, seeds: &[Prompt]) -> Result<(), EngineError> {
        for seed in seeds {
            if !seed.has_single_slot() {
                return Err(EngineError::SlotMissing {
                    prompt_id: seed.id.clone(),
                });
            }
        }
        for seed in seeds {
            self.store.store_prompt(seed)?;
        }
        info!(count = seeds.len(), "seeded initial prompts");
        Ok(())
    }

    /// Run one full cycle. See the module docs for the state machine.
    ///
    /// Cancellation and wall-budget exhaustion do not return `Err`: the cycle
    /// stops gracefully, keeps what it persisted, skips the commit, and
    /// reports the condition under `failures`.
    pub async fn run_cycle(
        &mut self,
        sampler: &mut dyn InputSampler,
    ) -> Result<CycleReport, EngineError> {
        let round = self.generation;
        let deadline = self
            .config
            .cycle_wall_budget_seconds
            .map(|secs| Instant::now() + Duration::from_secs(secs));
        let mut tally = FailureTally::default();

        info!(round, "cycle start: SELECT_ACTIVE");
        let active = self.select_active()?;
        debug!(round, active = active.len(), "active prompt set selected");

        let ForwardOutcome {
            results,
            sampler_exhausted,
        } = self
            .forward_pass(&active, sampler, round, deadline, &mut tally)
            .await;

        let outputs_produced = results.iter().filter(|r| r.output_stored).count();
        let evaluations_recorded = results.iter().filter(|r| r.evaluation_recorded).count();
        let prompts_evaluated = results
            .iter()
            .filter(|r| r.evaluation_recorded)
            .map(|r| r.prompt_id.as_str())
            .collect::<HashSet<_>>()
            .len();
        if sampler_exhausted && results.is_empty() {
            // The sampler never produced an input: end-of-loop.
            return Err(EngineError::InputExhausted);
        }

        let cancelled = self.cancel.is_cancelled();
        let out_of_budget = deadline.is_some_and(|d| Instant::now() >= d);
        if cancelled {
            tally.record(CycleStage::ForwardPass, "CANCELLED");
        } else if out_of_budget {
            tally.record(CycleStage::ForwardPass, "BUDGET_EXCEEDED");
        }

        // Aggregate scores for the report even when the cycle will not commit.
        let mut scored: Vec<(Prompt, Option<f64>, usize)> = Vec::with_capacity(active.len());
        for prompt in &active {
            let (mean, count) = self.store.prompt_mean_score(&prompt.id)?;
            scored.push((prompt.clone(), mean, count));
        }
        let means: Vec<f64> = scored.iter().filter_map(|(_, mean, _)| *mean).collect();
        let mean_score = if means.is_empty() {
            None
        } else {
            Some(round2(means.iter().sum::<f64>() / means.len() as f64))
        };
        let best_score = means
            .iter()
            .copied()
            .fold(None::<f64>, |best, m| Some(best.map_or(m, |b| b.max(m))))
            .map(round2);

        if cancelled || out_of_budget {
            info!(round, cancelled, out_of_budget, "graceful stop: no commit");
            return Ok(CycleReport {
                generation: round,
                prompts_evaluated,
                outputs_produced,
                evaluations_recorded,
                mean_score,
                best_score,
                survivors: 0,
                new_variants: 0,
                failures: tally.into_failures(),
            });
        }

        if self.config.human_gate {
            if let Some(gate) = self.human_gate.clone() {
                info!(round, "HUMAN_GATE: suspending for annotation");
                let limit = active.len() * self.config.num_simulations_per_prompt;
                let items = self.store.get_current_data_for_annotation(round, limit)?;
                gate.annotate(round, items).await?;
                // Human feedback may have changed the effective scores.
                for (prompt, mean, count) in scored.iter_mut() {
                    let (new_mean, new_count) = self.store.prompt_mean_score(&prompt.id)?;
                    *mean = new_mean;
                    *count = new_count;
                }
            }
        }

        info!(round, "BACKWARD_PASS");
        let (snapshots, survivors, variants) =
            self.backward_pass(&scored, &mut tally).await?;

        info!(round, survivors, variants = variants.len(), "COMMIT_GENERATION");
        self.store.commit_generation(&snapshots, &variants)?;
        self.generation += 1;

        Ok(CycleReport {
            generation: round,
            prompts_evaluated,
            outputs_produced,
            evaluations_recorded,
            mean_score,
            best_score,
            survivors,
            new_variants: variants.len(),
            failures: tally.into_failures(),
        })
    }

    /// Run up to `num_cycles` cycles, stopping early on sampler exhaustion,
    /// cancellation, graceful stop, or when the best score fails to improve
    /// on the previous cycle's best by more than `epsilon` (when epsilon is
    /// positive).
    pub async fn run_training_loop(
        &mut self,
        sampler: &mut dyn InputSampler,
        num_cycles: usize,
    ) -> Result<Vec<CycleReport>, EngineError> {
        let mut reports = Vec::new();
        let mut previous_best: Option<f64> = None;

        for cycle in 0..num_cycles {
            if self.cancel.is_cancelled() {
                info!(cycle, "training loop cancelled");
                break;
            }
            let report = match self.run_cycle(sampler).await {
                Ok(report) => report,
                Err(EngineError::InputExhausted) => {
                    info!(cycle, "input sampler exhausted, ending training loop");
                    break;
                }
                Err(e) => return Err(e),
            };

            let stopped = report
                .failures
                .iter()
                .any(|f| f.kind == "CANCELLED" || f.kind == "BUDGET_EXCEEDED");
            let best = report.best_score;
            reports.push(report);
            if stopped {
                break;
            }

            if self.config.epsilon > 0.0 {
                if let (Some(previous), Some(current)) = (previous_best, best) {
                    if current - previous <= self.config.epsilon {
                        info!(cycle, previous, current, "no sufficient improvement, stopping");
                        break;
                    }
                }
            }
            previous_best = best.or(previous_best);
        }
        Ok(reports)
    }

    // ── Stages ───────────────────────────────────────────────────────────────

    /// SELECT_ACTIVE: seeded prompts at generation 0; afterwards the
    /// committed candidate set — surviving parents first (by score, then
    /// age), then not-yet-evaluated variants — truncated to the cycle bound.
    fn select_active(&self) -> Result<Vec<Prompt>, EngineError> {
        let mut candidates = if self.generation == 0 {
            let seeds = self.store.load_prompts_for_generation(0)?;
            for seed in &seeds {
                if !seed.has_single_slot() {
                    return Err(EngineError::SlotMissing {
                        prompt_id: seed.id.clone(),
                    });
                }
            }
            seeds
        } else {
            let mut parents = self.store.load_current_survivors()?;
            parents.sort_by(|a, b| {
                compare_scores_desc(a.score, b.score).then_with(|| a.created_at.cmp(&b.created_at))
            });
            let mut set = parents;
            set.extend(self.store.load_pending_candidates()?);
            set
        };

        if candidates.is_empty() {
            return Err(EngineError::NoCandidates {
                generation: self.generation,
            });
        }
        candidates.truncate(self.config.max_prompts_per_cycle);
        Ok(candidates)
    }

    /// FORWARD_PASS: fan (prompt, input) pairs out under the concurrency
    /// bound; each pair generates, persists the output, evaluates, and
    /// persists the evaluation.
    async fn forward_pass(
        &self,
        active: &[Prompt],
        sampler: &mut dyn InputSampler,
        round: u32,
        deadline: Option<Instant>,
        tally: &mut FailureTally,
    ) -> ForwardOutcome {
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_llm_calls));
        let mut handles = Vec::new();
        let mut sampler_exhausted = false;

        'launch: for prompt in active {
            for _ in 0..self.config.num_simulations_per_prompt {
                if self.cancel.is_cancelled() {
                    break 'launch;
                }
                if deadline.is_some_and(|d| Instant::now() >= d) {
                    break 'launch;
                }
                let Some(input) = sampler.next_input() else {
                    sampler_exhausted = true;
                    break 'launch;
                };

                let semaphore = semaphore.clone();
                let generator = self.generator.clone();
                let evaluator = self.evaluator.clone();
                let store = self.store.clone();
                let prompt_id = prompt.id.clone();
                let prompt_content = prompt.content.clone();
                let evaluator_id = self.config.evaluator_model.clone();

                handles.push(tokio::spawn(async move {
                    let _permit = match semaphore.acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => {
                            return PairResult {
                                prompt_id,
                                output_stored: false,
                                evaluation_recorded: false,
                                parse_error: false,
                                failure_kind: Some("CANCELLED".to_string()),
                            }
                        }
                    };
                    run_pair(
                        generator,
                        evaluator,
                        store,
                        prompt_id,
                        prompt_content,
                        input,
                        round,
                        evaluator_id,
                    )
                    .await
                }));
            }
        }

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(result) => {
                    if let Some(kind) = &result.failure_kind {
                        tally.record(CycleStage::ForwardPass, kind.clone());
                    }
                    if result.parse_error {
                        tally.record(CycleStage::ForwardPass, "PARSE");
                    }
                    results.push(result);
                }
                Err(e) => {
                    warn!(error = %e, "forward-pass task panicked or was aborted");
                    tally.record(CycleStage::ForwardPass, "TASK_FAILED");
                }
            }
        }
        ForwardOutcome {
            results,
            sampler_exhausted,
        }
    }

    /// BACKWARD_PASS: mark survivors, synthesize variants, build the next
    /// generation's candidate set.
    async fn backward_pass(
        &self,
        scored: &[(Prompt, Option<f64>, usize)],
        tally: &mut FailureTally,
    ) -> Result<(Vec<PerformanceSnapshot>, usize, Vec<Prompt>), EngineError> {
        // Rank: score desc (None below any number), more evaluations wins,
        // then older wins.
        let mut ranked: Vec<&(Prompt, Option<f64>, usize)> = scored.iter().collect();
        ranked.sort_by(|a, b| {
            compare_scores_desc(a.1, b.1)
                .then_with(|| b.2.cmp(&a.2))
                .then_with(|| a.0.created_at.cmp(&b.0.created_at))
        });

        let survivor_count = ((scored.len() as f64) * self.config.survivor_fraction).ceil() as usize;
        let survivor_ids: HashSet<String> = ranked
            .iter()
            .filter(|(_, mean, _)| mean.is_some())
            .take(survivor_count)
            .map(|(prompt, _, _)| prompt.id.clone())
            .collect();

        let mut snapshots = Vec::with_capacity(scored.len());
        for (prompt, mean, _) in scored {
            snapshots.push(PerformanceSnapshot {
                prompt_id: prompt.id.clone(),
                avg_score: *mean,
                survived: survivor_ids.contains(&prompt.id),
            });
        }

        // Variants for each survivor, best parents first.
        let mut parent_count = 0usize;
        let mut variants: Vec<Prompt> = Vec::new();
        for (prompt, mean, _) in &ranked {
            if !survivor_ids.contains(&prompt.id) {
                continue;
            }
            parent_count += 1;
            let feedback = self.store.feedback_for_prompt(&prompt.id)?;
            let mut parent = prompt.clone();
            if let Some(mean) = mean {
                parent.attach_score(*mean, feedback.join("; "));
            }
            parent.mark_survived(true);

            match self
                .optimizer
                .optimize(&parent, &feedback, self.config.num_variants_per_survivor)
                .await
            {
                Ok(outcome) => {
                    for _ in 0..outcome.slot_discards {
                        tally.record(CycleStage::BackwardPass, "SLOT_MISSING");
                    }
                    variants.extend(outcome.variants);
                }
                Err(e) => {
                    warn!(parent = %parent.id, error = %e, "variant synthesis failed");
                    tally.record(CycleStage::BackwardPass, "TRANSPORT");
                }
            }
        }

        // Next candidate set is {surviving parents} ∪ {variants}, parents
        // preferred; only the variants that fit the cycle bound are persisted.
        let variant_slots = self
            .config
            .max_prompts_per_cycle
            .saturating_sub(parent_count);
        variants.truncate(variant_slots);
        let survivors = survivor_ids.len();

        Ok((snapshots, survivors, variants))
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_pair(
    generator: Arc<dyn ContentGenerator>,
    evaluator: Arc<RubricEvaluator>,
    store: Store,
    prompt_id: String,
    prompt_content: String,
    input: String,
    round: u32,
    evaluator_id: String,
) -> PairResult {
    let mut result = PairResult {
        prompt_id: prompt_id.clone(),
        output_stored: false,
        evaluation_recorded: false,
        parse_error: false,
        failure_kind: None,
    };

    let content = match generator.generate(&prompt_content, &input).await {
        Ok(content) => content,
        Err(e) => {
            warn!(prompt = %prompt_id, kind = e.kind(), "generation failed");
            result.failure_kind = Some(e.kind().to_string());
            return result;
        }
    };

    let output_id =
        match retry_store(|| store.store_generated_content(&input, &content, &prompt_id, round))
            .await
        {
            Ok(id) => id,
            Err(e) => {
                warn!(prompt = %prompt_id, error = %e, "output write failed, pair abandoned");
                result.failure_kind = Some("STORE".to_string());
                return result;
            }
        };
    result.output_stored = true;

    let evaluation = match evaluator.evaluate(&input, &content).await {
        Ok(evaluation) => evaluation,
        Err(EvaluatorError::Llm(e)) => {
            warn!(prompt = %prompt_id, kind = e.kind(), "evaluation failed");
            result.failure_kind = Some(e.kind().to_string());
            return result;
        }
    };

    let stored = match &evaluation {
        EvaluationResult::ParseError { .. } => {
            result.parse_error = true;
            retry_store(|| {
                store.store_evaluation(
                    &output_id,
                    None,
                    "parse_error",
                    "",
                    false,
                    false,
                    &evaluator_id,
                )
            })
            .await
        }
        other => {
            let score = other.score().map(i64::from);
            retry_store(|| {
                store.store_evaluation(
                    &output_id,
                    score,
                    other.feedback(),
                    other.improved_output(),
                    false,
                    other.is_coerced(),
                    &evaluator_id,
                )
            })
            .await
        }
    };
    match stored {
        Ok(_) => result.evaluation_recorded = true,
        Err(e) => {
            warn!(prompt = %prompt_id, error = %e, "evaluation write failed, pair abandoned");
            result.failure_kind = Some("STORE".to_string());
        }
    }
    result
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Descending by score; `None` ranks below any number.
fn compare_scores_desc(a: Option<f64>, b: Option<f64>) -> std::cmp::Ordering {
    match (a, b) {
        (Some(a), Some(b)) => b.partial_cmp(&a).unwrap_or(std::cmp::Ordering::Equal),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => std::cmp::Ordering::Equal,
    }
}
