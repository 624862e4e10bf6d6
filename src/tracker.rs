//! Performance tracking: read-only views over persisted evaluations.
//!
//! Derives per-generation aggregates and per-prompt lineage series. No I/O
//! beyond reading through the store.

use serde::{Deserialize, Serialize};

use crate::store::{GenerationMetrics, Store, StoreError};

/// One point in a prompt's ancestry, root first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineagePoint {
    pub prompt_id: String,
    pub generation: u32,
    pub content_excerpt: String,
    pub mean_score: Option<f64>,
}

/// Read-only aggregate views over the store.
pub struct PerformanceTracker {
    store: Store,
}

impl PerformanceTracker {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Aggregates for every generation, in generation order.
    pub fn per_generation_metrics(&self) -> Result<Vec<GenerationMetrics>, StoreError> {
        self.store.get_performance_metrics(usize::MAX)
    }

    /// Ancestor chain from the generation-0 root to `prompt_id`, with each
    /// ancestor's mean score.
    pub fn lineage_series(&self, prompt_id: &str) -> Result<Vec<LineagePoint>, StoreError> {
        let chain = self.store.lineage(prompt_id)?;
        Ok(chain
            .into_iter()
            .map(|prompt| LineagePoint {
                content_excerpt: prompt.content_excerpt(80),
                prompt_id: prompt.id,
                generation: prompt.generation,
                mean_score: prompt.score,
            })
            .collect())
    }
}
