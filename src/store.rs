//! # Persistence adapter
//!
//! ## Responsibility
//! Exclusive owner of durable state: prompts, generated outputs, evaluations
//! (AI and human), and append-only performance snapshots. Exposes the
//! aggregate queries the control loop uses for selection.
//!
//! ## Guarantees
//! - Writes are serialized through the connection mutex
//! - `commit_generation` is a single transaction: survivors + variants land
//!   together or not at all
//! - Aggregates prefer human evaluations (latest-wins) and never report an
//!   empty set as zero — empty is `None`
//! - Parse-failed evaluations (`score = NULL`) are stored but excluded from
//!   every aggregate
//!
//! ## NOT Responsible For
//! - Retrying failed writes (the control loop owns the retry policy)
//! - Deciding survivors or building variants (control loop / optimizer)

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::prompt::Prompt;

/// Schema for the four persisted tables.
pub const DDL: &str = r#"
CREATE TABLE IF NOT EXISTS prompts (
  id TEXT PRIMARY KEY,
  content TEXT NOT NULL,
  generation INTEGER NOT NULL,
  model TEXT NOT NULL,
  purpose TEXT NOT NULL,
  parent_id TEXT REFERENCES prompts(id),
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS prompt_performance (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  prompt_id TEXT NOT NULL REFERENCES prompts(id),
  avg_score REAL,
  survived INTEGER NOT NULL,
  recorded_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS outputs (
  id TEXT PRIMARY KEY,
  prompt_id TEXT NOT NULL REFERENCES prompts(id),
  input_data TEXT NOT NULL,
  content TEXT NOT NULL,
  round_num INTEGER NOT NULL,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS evaluations (
  id TEXT PRIMARY KEY,
  output_id TEXT NOT NULL REFERENCES outputs(id),
  score INTEGER,
  feedback TEXT NOT NULL,
  improved_output TEXT NOT NULL,
  is_human INTEGER NOT NULL DEFAULT 0,
  coerced INTEGER NOT NULL DEFAULT 0,
  evaluator_id TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_prompts_generation ON prompts(generation);
CREATE INDEX IF NOT EXISTS idx_performance_prompt ON prompt_performance(prompt_id);
CREATE INDEX IF NOT EXISTS idx_outputs_prompt ON outputs(prompt_id);
CREATE INDEX IF NOT EXISTS idx_outputs_round ON outputs(round_num);
CREATE INDEX IF NOT EXISTS idx_evaluations_output ON evaluations(output_id);
"#;

/// The effective evaluation per output: latest human if any human exists,
/// otherwise the latest AI evaluation. NULL scores never qualify.
const EFFECTIVE_LATEST: &str = r#"
effective AS (
  SELECT e.output_id AS output_id, CAST(e.score AS REAL) AS score
  FROM evaluations e
  WHERE e.score IS NOT NULL
    AND e.rowid = (
      SELECT e2.rowid FROM evaluations e2
      WHERE e2.output_id = e.output_id AND e2.score IS NOT NULL
      ORDER BY e2.is_human DESC, e2.created_at DESC, e2.rowid DESC
      LIMIT 1
    )
)
"#;

/// Averaging variant: mean over human scores when any human evaluation
/// exists for the output, otherwise the latest AI score.
const EFFECTIVE_AVERAGED: &str = r#"
human_avg AS (
  SELECT output_id, AVG(score) AS score
  FROM evaluations
  WHERE is_human = 1 AND score IS NOT NULL
  GROUP BY output_id
),
ai_latest AS (
  SELECT e.output_id AS output_id, CAST(e.score AS REAL) AS score
  FROM evaluations e
  WHERE e.is_human = 0 AND e.score IS NOT NULL
    AND e.rowid = (
      SELECT e2.rowid FROM evaluations e2
      WHERE e2.output_id = e.output_id AND e2.is_human = 0 AND e2.score IS NOT NULL
      ORDER BY e2.created_at DESC, e2.rowid DESC
      LIMIT 1
    )
),
effective AS (
  SELECT o.id AS output_id, COALESCE(h.score, a.score) AS score
  FROM outputs o
  LEFT JOIN human_avg h ON h.output_id = o.id
  LEFT JOIN ai_latest a ON a.output_id = o.id
  WHERE COALESCE(h.score, a.score) IS NOT NULL
)
"#;

/// Errors from the persistence layer.
#[derive(Debug, Error)]
pub enum StoreError {
    /// SQLite failure.
    #[error("database failure: {0}")]
    Database(#[from] rusqlite::Error),

    /// The connection mutex was poisoned by a panicking task.
    #[error("store lock poisoned")]
    LockPoisoned,

    /// A referenced row does not exist.
    #[error("not found: {0}")]
    NotFound(String),
}

/// One stored evaluation row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationRow {
    pub id: String,
    pub output_id: String,
    /// `None` marks a parse-failed evaluation; excluded from aggregates.
    pub score: Option<i64>,
    pub feedback: String,
    pub improved_output: String,
    pub is_human: bool,
    /// The raw score was clamped or rounded before storage.
    pub coerced: bool,
    pub evaluator_id: String,
    pub created_at: String,
}

/// One output offered to the human annotation surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnnotationItem {
    pub output_id: String,
    pub input_data: String,
    pub content: String,
    pub prompt_id: String,
    /// Latest AI evaluation for the output, when one exists.
    pub ai_evaluation: Option<EvaluationRow>,
}

/// Per-generation aggregate row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationMetrics {
    pub generation: u32,
    pub mean_score: Option<f64>,
    pub best_score: Option<f64>,
    pub survival_ratio: Option<f64>,
    pub prompt_count: usize,
}

/// One row of the full prompt history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptHistoryRow {
    pub generation: u32,
    pub prompt_id: String,
    pub parent_id: Option<String>,
    pub content_excerpt: String,
    pub mean_score: Option<f64>,
}

/// A performance snapshot for one active prompt, written at commit.
#[derive(Debug, Clone)]
pub struct PerformanceSnapshot {
    pub prompt_id: String,
    pub avg_score: Option<f64>,
    pub survived: bool,
}

/// SQLite-backed store. Cheap to clone — clones share one connection.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
    human_eval_averaging: bool,
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

impl Store {
    /// Open (or create) an on-disk store and initialize the schema.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            human_eval_averaging: false,
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Open an in-memory store (tests, demos) and initialize the schema.
    pub fn memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            human_eval_averaging: false,
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Average multiple human evaluations per output instead of latest-wins.
    pub fn with_human_averaging(mut self, enabled: bool) -> Self {
        self.human_eval_averaging = enabled;
        self
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute_batch(DDL)?;
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }

    fn effective_cte(&self) -> &'static str {
        if self.human_eval_averaging {
            EFFECTIVE_AVERAGED
        } else {
            EFFECTIVE_LATEST
        }
    }

    // ── Writes ───────────────────────────────────────────────────────────────

    /// Insert a prompt row; returns the prompt id.
    pub fn store_prompt(&self, prompt: &Prompt) -> Result<String, StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO prompts(id, content, generation, model, purpose, parent_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                prompt.id,
                prompt.content,
                prompt.generation,
                prompt.model_id,
                prompt.purpose,
                prompt.parent_id,
                prompt.created_at,
            ],
        )?;
        Ok(prompt.id.clone())
    }

    /// Append a performance snapshot. Never updates in place; the latest row
    /// per prompt is the one aggregates consult.
    pub fn update_prompt_performance(
        &self,
        prompt_id: &str,
        avg_score: Option<f64>,
        survived: bool,
    ) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO prompt_performance(prompt_id, avg_score, survived, recorded_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![prompt_id, avg_score, survived, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Insert a generated output; returns the output id.
    pub fn store_generated_content(
        &self,
        input_data: &str,
        content: &str,
        prompt_id: &str,
        round_num: u32,
    ) -> Result<String, StoreError> {
        let id = Uuid::new_v4().to_string();
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO outputs(id, prompt_id, input_data, content, round_num, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![id, prompt_id, input_data, content, round_num, Utc::now().to_rfc3339()],
        )?;
        Ok(id)
    }

    /// Insert an evaluation row; returns the evaluation id.
    ///
    /// `score = None` records a parse failure; the row is kept for audit but
    /// excluded from every aggregate.
    #[allow(clippy::too_many_arguments)]
    pub fn store_evaluation(
        &self,
        output_id: &str,
        score: Option<i64>,
        feedback: &str,
        improved_output: &str,
        is_human: bool,
        coerced: bool,
        evaluator_id: &str,
    ) -> Result<String, StoreError> {
        let id = Uuid::new_v4().to_string();
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO evaluations(id, output_id, score, feedback, improved_output,
                                     is_human, coerced, evaluator_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                id,
                output_id,
                score,
                feedback,
                improved_output,
                is_human,
                coerced,
                evaluator_id,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(id)
    }

    /// Record a human judgement for an output.
    pub fn store_human_feedback(
        &self,
        output_id: &str,
        score: i64,
        feedback: &str,
        improved_output: &str,
    ) -> Result<String, StoreError> {
        self.store_evaluation(output_id, Some(score), feedback, improved_output, true, false, "human")
    }

    /// Persist one generation atomically: performance snapshots for every
    /// active prompt plus the accepted variant rows. Either everything lands
    /// or nothing does.
    pub fn commit_generation(
        &self,
        snapshots: &[PerformanceSnapshot],
        variants: &[Prompt],
    ) -> Result<(), StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let now = Utc::now().to_rfc3339();
        for snapshot in snapshots {
            tx.execute(
                "INSERT INTO prompt_performance(prompt_id, avg_score, survived, recorded_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![snapshot.prompt_id, snapshot.avg_score, snapshot.survived, now],
            )?;
        }
        for variant in variants {
            tx.execute(
                "INSERT INTO prompts(id, content, generation, model, purpose, parent_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    variant.id,
                    variant.content,
                    variant.generation,
                    variant.model_id,
                    variant.purpose,
                    variant.parent_id,
                    variant.created_at,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    // ── Reads ────────────────────────────────────────────────────────────────

    /// Load one prompt by id, with its latest survival flag and mean score.
    pub fn get_prompt(&self, prompt_id: &str) -> Result<Option<Prompt>, StoreError> {
        let sql = format!(
            "WITH {cte}
             SELECT p.id, p.content, p.generation, p.model, p.purpose, p.parent_id, p.created_at,
                    (SELECT pp.survived FROM prompt_performance pp
                     WHERE pp.prompt_id = p.id ORDER BY pp.id DESC LIMIT 1),
                    (SELECT AVG(eff.score) FROM outputs o
                     JOIN effective eff ON eff.output_id = o.id
                     WHERE o.prompt_id = p.id)
             FROM prompts p WHERE p.id = ?1",
            cte = self.effective_cte()
        );
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&sql)?;
        let row = stmt
            .query_row(params![prompt_id], Self::prompt_from_row)
            .optional()?;
        Ok(row)
    }

    fn prompt_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Prompt> {
        let survived: Option<bool> = row.get(7)?;
        let mean: Option<f64> = row.get(8)?;
        Ok(Prompt {
            id: row.get(0)?,
            content: row.get(1)?,
            generation: row.get(2)?,
            model_id: row.get(3)?,
            purpose: row.get(4)?,
            parent_id: row.get(5)?,
            created_at: row.get(6)?,
            survived: survived.unwrap_or(false),
            score: mean.map(round2),
            feedback: None,
        })
    }

    /// All prompts at one generation, oldest first.
    pub fn load_prompts_for_generation(&self, generation: u32) -> Result<Vec<Prompt>, StoreError> {
        let sql = format!(
            "WITH {cte}
             SELECT p.id, p.content, p.generation, p.model, p.purpose, p.parent_id, p.created_at,
                    (SELECT pp.survived FROM prompt_performance pp
                     WHERE pp.prompt_id = p.id ORDER BY pp.id DESC LIMIT 1),
                    (SELECT AVG(eff.score) FROM outputs o
                     JOIN effective eff ON eff.output_id = o.id
                     WHERE o.prompt_id = p.id)
             FROM prompts p WHERE p.generation = ?1
             ORDER BY p.created_at ASC, p.rowid ASC",
            cte = self.effective_cte()
        );
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![generation], |row| Self::prompt_from_row(row))?;
        let mut prompts = Vec::new();
        for row in rows {
            prompts.push(row?);
        }
        Ok(prompts)
    }

    /// Prompts whose latest performance snapshot marks them survived —
    /// the parents carried into the next cycle's candidate set. Oldest first.
    pub fn load_current_survivors(&self) -> Result<Vec<Prompt>, StoreError> {
        let sql = format!(
            "WITH {cte}
             SELECT p.id, p.content, p.generation, p.model, p.purpose, p.parent_id, p.created_at,
                    (SELECT pp.survived FROM prompt_performance pp
                     WHERE pp.prompt_id = p.id ORDER BY pp.id DESC LIMIT 1),
                    (SELECT AVG(eff.score) FROM outputs o
                     JOIN effective eff ON eff.output_id = o.id
                     WHERE o.prompt_id = p.id)
             FROM prompts p
             WHERE (SELECT pp.survived FROM prompt_performance pp
                    WHERE pp.prompt_id = p.id ORDER BY pp.id DESC LIMIT 1) = 1
             ORDER BY p.created_at ASC, p.rowid ASC",
            cte = self.effective_cte()
        );
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], Self::prompt_from_row)?;
        let mut prompts = Vec::new();
        for row in rows {
            prompts.push(row?);
        }
        Ok(prompts)
    }

    /// Prompts that have no performance snapshot yet — committed variants (and
    /// dormant seeds) awaiting their first cycle. Oldest first.
    pub fn load_pending_candidates(&self) -> Result<Vec<Prompt>, StoreError> {
        let sql = format!(
            "WITH {cte}
             SELECT p.id, p.content, p.generation, p.model, p.purpose, p.parent_id, p.created_at,
                    NULL,
                    (SELECT AVG(eff.score) FROM outputs o
                     JOIN effective eff ON eff.output_id = o.id
                     WHERE o.prompt_id = p.id)
             FROM prompts p
             WHERE NOT EXISTS (
               SELECT 1 FROM prompt_performance pp WHERE pp.prompt_id = p.id
             )
             ORDER BY p.created_at ASC, p.rowid ASC",
            cte = self.effective_cte()
        );
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], Self::prompt_from_row)?;
        let mut prompts = Vec::new();
        for row in rows {
            prompts.push(row?);
        }
        Ok(prompts)
    }

    /// Feedback strings from the scored evaluations of a prompt's outputs,
    /// oldest first. Parse-failed evaluations contribute nothing.
    pub fn feedback_for_prompt(&self, prompt_id: &str) -> Result<Vec<String>, StoreError> {
        let sql = "SELECT e.feedback
             FROM outputs o
             JOIN evaluations e ON e.output_id = o.id
             WHERE o.prompt_id = ?1 AND e.score IS NOT NULL
             ORDER BY e.created_at ASC, e.rowid ASC";
        let conn = self.lock()?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params![prompt_id], |row| row.get::<_, String>(0))?;
        let mut feedback = Vec::new();
        for row in rows {
            feedback.push(row?);
        }
        Ok(feedback)
    }

    /// Mean effective score and qualifying evaluation count for one prompt.
    ///
    /// Returns `(None, 0)` when no scored evaluation exists — never zero.
    pub fn prompt_mean_score(&self, prompt_id: &str) -> Result<(Option<f64>, usize), StoreError> {
        let sql = format!(
            "WITH {cte}
             SELECT AVG(eff.score), COUNT(eff.score)
             FROM outputs o JOIN effective eff ON eff.output_id = o.id
             WHERE o.prompt_id = ?1",
            cte = self.effective_cte()
        );
        let conn = self.lock()?;
        let (mean, count): (Option<f64>, i64) =
            conn.query_row(&sql, params![prompt_id], |row| Ok((row.get(0)?, row.get(1)?)))?;
        Ok((mean.map(round2), count as usize))
    }

    /// Top prompts across the whole store, ordered by mean score descending,
    /// ties broken by evaluation count (more wins) then created_at (older wins).
    pub fn get_current_best_prompts(&self, top_n: usize) -> Result<Vec<Prompt>, StoreError> {
        self.best_prompts_filtered(top_n, None)
    }

    /// Top prompts restricted to one generation; same ordering contract.
    pub fn get_best_prompts_for_generation(
        &self,
        generation: u32,
        top_n: usize,
    ) -> Result<Vec<Prompt>, StoreError> {
        self.best_prompts_filtered(top_n, Some(generation))
    }

    fn best_prompts_filtered(
        &self,
        top_n: usize,
        generation: Option<u32>,
    ) -> Result<Vec<Prompt>, StoreError> {
        let filter = match generation {
            Some(_) => "WHERE p.generation = ?2",
            None => "",
        };
        let sql = format!(
            "WITH {cte},
             stats AS (
               SELECT o.prompt_id AS prompt_id,
                      AVG(eff.score) AS mean_score,
                      COUNT(eff.score) AS eval_count
               FROM outputs o JOIN effective eff ON eff.output_id = o.id
               GROUP BY o.prompt_id
             )
             SELECT p.id, p.content, p.generation, p.model, p.purpose, p.parent_id, p.created_at,
                    (SELECT pp.survived FROM prompt_performance pp
                     WHERE pp.prompt_id = p.id ORDER BY pp.id DESC LIMIT 1),
                    s.mean_score, s.eval_count
             FROM stats s JOIN prompts p ON p.id = s.prompt_id
             {filter}
             ORDER BY s.mean_score DESC, s.eval_count DESC, p.created_at ASC, p.rowid ASC
             LIMIT ?1",
            cte = self.effective_cte(),
            filter = filter
        );
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&sql)?;
        let map_row = |row: &rusqlite::Row<'_>| -> rusqlite::Result<Prompt> {
            let survived: Option<bool> = row.get(7)?;
            let mean: Option<f64> = row.get(8)?;
            Ok(Prompt {
                id: row.get(0)?,
                content: row.get(1)?,
                generation: row.get(2)?,
                model_id: row.get(3)?,
                purpose: row.get(4)?,
                parent_id: row.get(5)?,
                created_at: row.get(6)?,
                survived: survived.unwrap_or(false),
                score: mean.map(round2),
                feedback: None,
            })
        };
        let mut prompts = Vec::new();
        match generation {
            Some(g) => {
                let rows = stmt.query_map(params![top_n as i64, g], map_row)?;
                for row in rows {
                    prompts.push(row?);
                }
            }
            None => {
                let rows = stmt.query_map(params![top_n as i64], map_row)?;
                for row in rows {
                    prompts.push(row?);
                }
            }
        }
        Ok(prompts)
    }

    /// Outputs of one round for the annotation surface, each with its latest
    /// AI evaluation when one exists.
    pub fn get_current_data_for_annotation(
        &self,
        round_num: u32,
        limit: usize,
    ) -> Result<Vec<AnnotationItem>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT o.id, o.input_data, o.content, o.prompt_id
             FROM outputs o
             WHERE o.round_num = ?1
             ORDER BY o.created_at ASC, o.rowid ASC
             LIMIT ?2",
        )?;
        let base_rows = stmt
            .query_map(params![round_num, limit as i64], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut eval_stmt = conn.prepare(
            "SELECT id, output_id, score, feedback, improved_output, is_human, coerced,
                    evaluator_id, created_at
             FROM evaluations
             WHERE output_id = ?1 AND is_human = 0
             ORDER BY created_at DESC, rowid DESC
             LIMIT 1",
        )?;

        let mut items = Vec::with_capacity(base_rows.len());
        for (output_id, input_data, content, prompt_id) in base_rows {
            let ai_evaluation = eval_stmt
                .query_row(params![output_id], Self::evaluation_from_row)
                .optional()?;
            items.push(AnnotationItem {
                output_id,
                input_data,
                content,
                prompt_id,
                ai_evaluation,
            });
        }
        Ok(items)
    }

    fn evaluation_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<EvaluationRow> {
        Ok(EvaluationRow {
            id: row.get(0)?,
            output_id: row.get(1)?,
            score: row.get(2)?,
            feedback: row.get(3)?,
            improved_output: row.get(4)?,
            is_human: row.get(5)?,
            coerced: row.get(6)?,
            evaluator_id: row.get(7)?,
            created_at: row.get(8)?,
        })
    }

    /// All evaluations for one output, oldest first.
    pub fn evaluations_for_output(&self, output_id: &str) -> Result<Vec<EvaluationRow>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, output_id, score, feedback, improved_output, is_human, coerced,
                    evaluator_id, created_at
             FROM evaluations WHERE output_id = ?1
             ORDER BY created_at ASC, rowid ASC",
        )?;
        let rows = stmt.query_map(params![output_id], Self::evaluation_from_row)?;
        let mut evals = Vec::new();
        for row in rows {
            evals.push(row?);
        }
        Ok(evals)
    }

    /// Most recent human evaluations, newest first.
    pub fn get_validated_evaluations(&self, limit: usize) -> Result<Vec<EvaluationRow>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, output_id, score, feedback, improved_output, is_human, coerced,
                    evaluator_id, created_at
             FROM evaluations WHERE is_human = 1
             ORDER BY created_at DESC, rowid DESC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], Self::evaluation_from_row)?;
        let mut evals = Vec::new();
        for row in rows {
            evals.push(row?);
        }
        Ok(evals)
    }

    /// Per-generation aggregates, in generation order, at most `max_rounds`
    /// most recent generations.
    pub fn get_performance_metrics(
        &self,
        max_rounds: usize,
    ) -> Result<Vec<GenerationMetrics>, StoreError> {
        let sql = format!(
            "WITH {cte},
             prompt_stats AS (
               SELECT o.prompt_id AS prompt_id, AVG(eff.score) AS mean_score
               FROM outputs o JOIN effective eff ON eff.output_id = o.id
               GROUP BY o.prompt_id
             ),
             latest_perf AS (
               SELECT pp.prompt_id AS prompt_id, pp.survived AS survived
               FROM prompt_performance pp
               WHERE pp.id = (
                 SELECT pp2.id FROM prompt_performance pp2
                 WHERE pp2.prompt_id = pp.prompt_id
                 ORDER BY pp2.id DESC LIMIT 1
               )
             )
             SELECT p.generation,
                    AVG(ps.mean_score),
                    MAX(ps.mean_score),
                    SUM(CASE WHEN lp.survived = 1 THEN 1 ELSE 0 END),
                    COUNT(p.id)
             FROM prompts p
             LEFT JOIN prompt_stats ps ON ps.prompt_id = p.id
             LEFT JOIN latest_perf lp ON lp.prompt_id = p.id
             GROUP BY p.generation
             ORDER BY p.generation ASC",
            cte = self.effective_cte()
        );
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], |row| {
            let generation: u32 = row.get(0)?;
            let mean: Option<f64> = row.get(1)?;
            let best: Option<f64> = row.get(2)?;
            let survivors: i64 = row.get(3)?;
            let count: i64 = row.get(4)?;
            Ok(GenerationMetrics {
                generation,
                mean_score: mean.map(round2),
                best_score: best.map(round2),
                survival_ratio: if count > 0 {
                    Some(round2(survivors as f64 / count as f64))
                } else {
                    None
                },
                prompt_count: count as usize,
            })
        })?;
        let mut metrics = Vec::new();
        for row in rows {
            metrics.push(row?);
        }
        if metrics.len() > max_rounds {
            metrics.drain(..metrics.len() - max_rounds);
        }
        Ok(metrics)
    }

    /// Every prompt with its lineage fields, ordered by generation then age.
    pub fn get_prompt_history(&self) -> Result<Vec<PromptHistoryRow>, StoreError> {
        let sql = format!(
            "WITH {cte},
             prompt_stats AS (
               SELECT o.prompt_id AS prompt_id, AVG(eff.score) AS mean_score
               FROM outputs o JOIN effective eff ON eff.output_id = o.id
               GROUP BY o.prompt_id
             )
             SELECT p.generation, p.id, p.parent_id, p.content, ps.mean_score
             FROM prompts p
             LEFT JOIN prompt_stats ps ON ps.prompt_id = p.id
             ORDER BY p.generation ASC, p.created_at ASC, p.rowid ASC",
            cte = self.effective_cte()
        );
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], |row| {
            let content: String = row.get(3)?;
            let mean: Option<f64> = row.get(4)?;
            let excerpt = if content.chars().count() > 80 {
                format!("{}...", content.chars().take(80).collect::<String>())
            } else {
                content
            };
            Ok(PromptHistoryRow {
                generation: row.get(0)?,
                prompt_id: row.get(1)?,
                parent_id: row.get(2)?,
                content_excerpt: excerpt,
                mean_score: mean.map(round2),
            })
        })?;
        let mut history = Vec::new();
        for row in rows {
            history.push(row?);
        }
        Ok(history)
    }

    /// Ancestor chain from the generation-0 root down to `prompt_id`.
    ///
    /// Walks `parent_id` references; the walk is bounded by the prompt's
    /// generation depth, so cyclic data cannot loop it.
    pub fn lineage(&self, prompt_id: &str) -> Result<Vec<Prompt>, StoreError> {
        let mut chain = Vec::new();
        let mut current = self
            .get_prompt(prompt_id)?
            .ok_or_else(|| StoreError::NotFound(format!("prompt {prompt_id}")))?;
        let mut remaining = current.generation as usize + 1;
        loop {
            let parent_id = current.parent_id.clone();
            chain.push(current);
            remaining -= 1;
            match parent_id {
                Some(pid) if remaining > 0 => {
                    current = self
                        .get_prompt(&pid)?
                        .ok_or_else(|| StoreError::NotFound(format!("parent {pid}")))?;
                }
                _ => break,
            }
        }
        chain.reverse();
        Ok(chain)
    }

    /// Latest performance snapshot for one prompt, if any.
    pub fn latest_performance(
        &self,
        prompt_id: &str,
    ) -> Result<Option<(Option<f64>, bool)>, StoreError> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT avg_score, survived FROM prompt_performance
                 WHERE prompt_id = ?1 ORDER BY id DESC LIMIT 1",
                params![prompt_id],
                |row| Ok((row.get::<_, Option<f64>>(0)?, row.get::<_, bool>(1)?)),
            )
            .optional()?;
        Ok(row)
    }

    /// Row count for one of the persisted tables (tests, reporting).
    pub fn count_rows(&self, table: &str) -> Result<i64, StoreError> {
        if !["prompts", "prompt_performance", "outputs", "evaluations"].contains(&table) {
            return Err(StoreError::NotFound(format!("unknown table {table}")));
        }
        let conn = self.lock()?;
        let sql = format!("SELECT COUNT(*) FROM {table}");
        let n: i64 = conn.query_row(&sql, [], |row| row.get(0))?;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompt::Prompt;

    fn seeded(store: &Store) -> Prompt {
        let prompt = Prompt::new("Summarize: {input}", "gpt-4", "summary");
        store.store_prompt(&prompt).unwrap();
        prompt
    }

    fn output_with_score(store: &Store, prompt: &Prompt, score: i64) -> String {
        let output_id = store
            .store_generated_content("in", "out", &prompt.id, 0)
            .unwrap();
        store
            .store_evaluation(&output_id, Some(score), "fb", "better", false, false, "eval-model")
            .unwrap();
        output_id
    }

    #[test]
    fn test_store_and_get_prompt_round_trip() {
        let store = Store::memory().unwrap();
        let prompt = seeded(&store);
        let loaded = store.get_prompt(&prompt.id).unwrap().unwrap();
        assert_eq!(loaded.content, "Summarize: {input}");
        assert_eq!(loaded.generation, 0);
        assert!(loaded.parent_id.is_none());
        assert!(loaded.score.is_none(), "no evaluations yet");
    }

    #[test]
    fn test_get_missing_prompt_returns_none() {
        let store = Store::memory().unwrap();
        assert!(store.get_prompt("nope").unwrap().is_none());
    }

    #[test]
    fn test_lineage_round_trip() {
        let store = Store::memory().unwrap();
        let root = seeded(&store);
        let child = root.derive_child("Briefly summarize: {input}");
        store.store_prompt(&child).unwrap();
        let grandchild = child.derive_child("Tersely summarize: {input}");
        store.store_prompt(&grandchild).unwrap();

        let chain = store.lineage(&grandchild.id).unwrap();
        let ids: Vec<&str> = chain.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec![root.id.as_str(), child.id.as_str(), grandchild.id.as_str()]);
        assert_eq!(chain[0].generation, 0);
        assert_eq!(chain[2].generation, 2);
    }

    #[test]
    fn test_performance_updates_are_append_only() {
        let store = Store::memory().unwrap();
        let prompt = seeded(&store);
        store.update_prompt_performance(&prompt.id, Some(3.0), false).unwrap();
        store.update_prompt_performance(&prompt.id, Some(3.0), false).unwrap();
        store.update_prompt_performance(&prompt.id, Some(4.5), true).unwrap();
        assert_eq!(store.count_rows("prompt_performance").unwrap(), 3);
        let latest = store.latest_performance(&prompt.id).unwrap().unwrap();
        assert_eq!(latest, (Some(4.5), true));
    }

    #[test]
    fn test_mean_score_over_ai_evaluations() {
        let store = Store::memory().unwrap();
        let prompt = seeded(&store);
        output_with_score(&store, &prompt, 4);
        output_with_score(&store, &prompt, 5);
        output_with_score(&store, &prompt, 4);
        let (mean, count) = store.prompt_mean_score(&prompt.id).unwrap();
        assert_eq!(mean, Some(4.33));
        assert_eq!(count, 3);
    }

    #[test]
    fn test_empty_aggregate_is_none_not_zero() {
        let store = Store::memory().unwrap();
        let prompt = seeded(&store);
        let (mean, count) = store.prompt_mean_score(&prompt.id).unwrap();
        assert_eq!(mean, None);
        assert_eq!(count, 0);
    }

    #[test]
    fn test_null_score_evaluations_excluded_from_aggregates() {
        let store = Store::memory().unwrap();
        let prompt = seeded(&store);
        let output_id = store
            .store_generated_content("in", "out", &prompt.id, 0)
            .unwrap();
        store
            .store_evaluation(&output_id, None, "parse_error", "", false, false, "eval-model")
            .unwrap();
        let (mean, count) = store.prompt_mean_score(&prompt.id).unwrap();
        assert_eq!(mean, None, "parse errors must not count as zero");
        assert_eq!(count, 0);
    }

    #[test]
    fn test_human_evaluation_overrides_ai() {
        let store = Store::memory().unwrap();
        let prompt = seeded(&store);
        let output_id = store
            .store_generated_content("in", "out", &prompt.id, 0)
            .unwrap();
        store
            .store_evaluation(&output_id, Some(5), "great", "", false, false, "eval-model")
            .unwrap();
        store
            .store_human_feedback(&output_id, 2, "actually wrong", "fixed")
            .unwrap();
        let (mean, _) = store.prompt_mean_score(&prompt.id).unwrap();
        assert_eq!(mean, Some(2.0), "human score must dominate");
    }

    #[test]
    fn test_latest_human_evaluation_wins() {
        let store = Store::memory().unwrap();
        let prompt = seeded(&store);
        let output_id = store
            .store_generated_content("in", "out", &prompt.id, 0)
            .unwrap();
        store.store_human_feedback(&output_id, 1, "bad", "").unwrap();
        store.store_human_feedback(&output_id, 4, "on reflection, fine", "").unwrap();
        let (mean, _) = store.prompt_mean_score(&prompt.id).unwrap();
        assert_eq!(mean, Some(4.0));
    }

    #[test]
    fn test_human_averaging_option() {
        let store = Store::memory().unwrap().with_human_averaging(true);
        let prompt = seeded(&store);
        let output_id = store
            .store_generated_content("in", "out", &prompt.id, 0)
            .unwrap();
        store.store_human_feedback(&output_id, 2, "a", "").unwrap();
        store.store_human_feedback(&output_id, 4, "b", "").unwrap();
        let (mean, _) = store.prompt_mean_score(&prompt.id).unwrap();
        assert_eq!(mean, Some(3.0));
    }

    #[test]
    fn test_best_prompts_sorted_by_mean_then_count_then_age() {
        let store = Store::memory().unwrap();
        let low = Prompt::new("low {input}", "m", "p");
        store.store_prompt(&low).unwrap();
        let high_few = Prompt::new("high-few {input}", "m", "p");
        store.store_prompt(&high_few).unwrap();
        let high_many = Prompt::new("high-many {input}", "m", "p");
        store.store_prompt(&high_many).unwrap();

        output_with_score(&store, &low, 2);
        output_with_score(&store, &high_few, 4);
        output_with_score(&store, &high_many, 4);
        output_with_score(&store, &high_many, 4);

        let best = store.get_current_best_prompts(3).unwrap();
        assert_eq!(best.len(), 3);
        assert_eq!(best[0].id, high_many.id, "more evaluations wins the tie");
        assert_eq!(best[1].id, high_few.id);
        assert_eq!(best[2].id, low.id);
        assert_eq!(best[0].score, Some(4.0));
    }

    #[test]
    fn test_best_prompts_limit_respected() {
        let store = Store::memory().unwrap();
        for i in 0..5 {
            let p = Prompt::new(format!("p{i} {{input}}"), "m", "p");
            store.store_prompt(&p).unwrap();
            output_with_score(&store, &p, 3);
        }
        assert_eq!(store.get_current_best_prompts(2).unwrap().len(), 2);
    }

    #[test]
    fn test_unevaluated_prompts_excluded_from_best() {
        let store = Store::memory().unwrap();
        let evaluated = seeded(&store);
        output_with_score(&store, &evaluated, 3);
        let bare = Prompt::new("bare {input}", "m", "p");
        store.store_prompt(&bare).unwrap();
        let best = store.get_current_best_prompts(10).unwrap();
        assert_eq!(best.len(), 1);
        assert_eq!(best[0].id, evaluated.id);
    }

    #[test]
    fn test_annotation_items_include_latest_ai_evaluation() {
        let store = Store::memory().unwrap();
        let prompt = seeded(&store);
        let output_id = store
            .store_generated_content("the input", "the output", &prompt.id, 2)
            .unwrap();
        store
            .store_evaluation(&output_id, Some(3), "ok", "better", false, false, "eval-model")
            .unwrap();

        let items = store.get_current_data_for_annotation(2, 10).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].output_id, output_id);
        assert_eq!(items[0].input_data, "the input");
        let ai = items[0].ai_evaluation.as_ref().unwrap();
        assert_eq!(ai.score, Some(3));
    }

    #[test]
    fn test_annotation_items_for_other_round_empty() {
        let store = Store::memory().unwrap();
        let prompt = seeded(&store);
        store
            .store_generated_content("in", "out", &prompt.id, 1)
            .unwrap();
        assert!(store.get_current_data_for_annotation(0, 10).unwrap().is_empty());
    }

    #[test]
    fn test_performance_metrics_per_generation() {
        let store = Store::memory().unwrap();
        let parent = seeded(&store);
        output_with_score(&store, &parent, 4);
        store.update_prompt_performance(&parent.id, Some(4.0), true).unwrap();

        let child = parent.derive_child("child {input}");
        store.store_prompt(&child).unwrap();
        output_with_score(&store, &child, 2);
        store.update_prompt_performance(&child.id, Some(2.0), false).unwrap();

        let metrics = store.get_performance_metrics(10).unwrap();
        assert_eq!(metrics.len(), 2);
        assert_eq!(metrics[0].generation, 0);
        assert_eq!(metrics[0].mean_score, Some(4.0));
        assert_eq!(metrics[0].best_score, Some(4.0));
        assert_eq!(metrics[0].survival_ratio, Some(1.0));
        assert_eq!(metrics[0].prompt_count, 1);
        assert_eq!(metrics[1].generation, 1);
        assert_eq!(metrics[1].survival_ratio, Some(0.0));
    }

    #[test]
    fn test_performance_metrics_respects_max_rounds() {
        let store = Store::memory().unwrap();
        let mut prompt = seeded(&store);
        output_with_score(&store, &prompt, 3);
        for _ in 0..3 {
            let child = prompt.derive_child(format!("{} more", prompt.content));
            store.store_prompt(&child).unwrap();
            output_with_score(&store, &child, 3);
            prompt = child;
        }
        let metrics = store.get_performance_metrics(2).unwrap();
        assert_eq!(metrics.len(), 2);
        assert_eq!(metrics[0].generation, 2, "keeps the most recent rounds");
        assert_eq!(metrics[1].generation, 3);
    }

    #[test]
    fn test_prompt_history_lists_lineage_fields() {
        let store = Store::memory().unwrap();
        let parent = seeded(&store);
        let child = parent.derive_child("child {input}");
        store.store_prompt(&child).unwrap();
        let history = store.get_prompt_history().unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].generation, 0);
        assert!(history[0].parent_id.is_none());
        assert_eq!(history[1].parent_id.as_deref(), Some(parent.id.as_str()));
    }

    #[test]
    fn test_commit_generation_writes_snapshots_and_variants() {
        let store = Store::memory().unwrap();
        let parent = seeded(&store);
        let variant = parent.derive_child("variant {input}");
        store
            .commit_generation(
                &[PerformanceSnapshot {
                    prompt_id: parent.id.clone(),
                    avg_score: Some(4.0),
                    survived: true,
                }],
                &[variant.clone()],
            )
            .unwrap();
        assert_eq!(store.count_rows("prompt_performance").unwrap(), 1);
        let stored = store.get_prompt(&variant.id).unwrap().unwrap();
        assert_eq!(stored.parent_id.as_deref(), Some(parent.id.as_str()));
        assert_eq!(stored.generation, 1);
    }

    #[test]
    fn test_commit_generation_rejects_unknown_parent_atomically() {
        let store = Store::memory().unwrap();
        let parent = seeded(&store);
        let mut orphan = parent.derive_child("orphan {input}");
        orphan.parent_id = Some("missing-parent".to_string());
        let result = store.commit_generation(
            &[PerformanceSnapshot {
                prompt_id: parent.id.clone(),
                avg_score: Some(4.0),
                survived: true,
            }],
            &[orphan],
        );
        assert!(result.is_err(), "foreign key violation must fail the commit");
        assert_eq!(
            store.count_rows("prompt_performance").unwrap(),
            0,
            "nothing from the failed transaction may persist"
        );
    }

    #[test]
    fn test_get_validated_evaluations_returns_human_rows_only() {
        let store = Store::memory().unwrap();
        let prompt = seeded(&store);
        let output_id = store
            .store_generated_content("in", "out", &prompt.id, 0)
            .unwrap();
        store
            .store_evaluation(&output_id, Some(5), "ai", "", false, false, "eval-model")
            .unwrap();
        store.store_human_feedback(&output_id, 3, "human", "").unwrap();
        let validated = store.get_validated_evaluations(10).unwrap();
        assert_eq!(validated.len(), 1);
        assert!(validated[0].is_human);
        assert_eq!(validated[0].evaluator_id, "human");
    }

    #[test]
    fn test_load_current_survivors_follows_latest_snapshot() {
        let store = Store::memory().unwrap();
        let kept = seeded(&store);
        let dropped = Prompt::new("dropped {input}", "m", "p");
        store.store_prompt(&dropped).unwrap();
        store.update_prompt_performance(&kept.id, Some(4.0), true).unwrap();
        store.update_prompt_performance(&dropped.id, Some(2.0), true).unwrap();
        store.update_prompt_performance(&dropped.id, Some(2.0), false).unwrap();

        let survivors = store.load_current_survivors().unwrap();
        assert_eq!(survivors.len(), 1);
        assert_eq!(survivors[0].id, kept.id);
        assert!(survivors[0].survived);
    }

    #[test]
    fn test_load_pending_candidates_excludes_snapshotted_prompts() {
        let store = Store::memory().unwrap();
        let tried = seeded(&store);
        store.update_prompt_performance(&tried.id, Some(3.0), false).unwrap();
        let fresh = tried.derive_child("fresh {input}");
        store.store_prompt(&fresh).unwrap();

        let pending = store.load_pending_candidates().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, fresh.id);
    }

    #[test]
    fn test_feedback_for_prompt_collects_effective_feedback() {
        let store = Store::memory().unwrap();
        let prompt = seeded(&store);
        let first = store
            .store_generated_content("in1", "out1", &prompt.id, 0)
            .unwrap();
        store
            .store_evaluation(&first, Some(4), "too long", "", false, false, "eval-model")
            .unwrap();
        let second = store
            .store_generated_content("in2", "out2", &prompt.id, 0)
            .unwrap();
        store
            .store_evaluation(&second, None, "parse_error", "", false, false, "eval-model")
            .unwrap();

        let feedback = store.feedback_for_prompt(&prompt.id).unwrap();
        assert_eq!(feedback, vec!["too long".to_string()]);
    }

    #[test]
    fn test_count_rows_rejects_unknown_table() {
        let store = Store::memory().unwrap();
        assert!(store.count_rows("sqlite_master").is_err());
    }

    #[test]
    fn test_on_disk_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("archer.db");
        let prompt_id;
        {
            let store = Store::open(&path).unwrap();
            let prompt = Prompt::new("persisted {input}", "m", "p");
            prompt_id = store.store_prompt(&prompt).unwrap();
        }
        let store = Store::open(&path).unwrap();
        let loaded = store.get_prompt(&prompt_id).unwrap().unwrap();
        assert_eq!(loaded.content, "persisted {input}");
    }
}
