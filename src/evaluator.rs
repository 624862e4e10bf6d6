//! # Rubric evaluation
//!
//! ## Responsibility
//! Score one generated output against the rubric via the LLM, parsing the
//! semi-structured response into a typed [`EvaluationResult`]. Tolerates
//! sloppy responses: prose around the labels, colon or dash separators,
//! `N/5` scores, spelled-out digits.
//!
//! ## Guarantees
//! - One repair call on parse failure, then a recorded `ParseError` — never
//!   an invented score
//! - Scores outside 1..=5 are clamped, non-integers rounded to nearest, and
//!   both flagged as coerced
//!
//! ## NOT Responsible For
//! - Persisting evaluations (control loop + store)
//! - Selecting knowledge passages (external collaborator; this module only
//!   bounds what it is given)

use thiserror::Error;
use tracing::{debug, warn};

use crate::llm::{CompletionRequest, LlmCaller, LlmError};

/// Outcome of evaluating one output.
#[derive(Debug, Clone, PartialEq)]
pub enum EvaluationResult {
    /// The response parsed cleanly into an in-range integer score.
    Scored {
        score: u8,
        feedback: String,
        improved_output: String,
    },
    /// A score was extracted but had to be clamped or rounded.
    Coerced {
        score: u8,
        feedback: String,
        improved_output: String,
        /// The raw score text as the model produced it.
        raw: String,
    },
    /// Neither the original response nor the repair attempt parsed.
    ParseError {
        /// The unparseable response, kept for audit.
        raw: String,
    },
}

impl EvaluationResult {
    /// The usable score, when one exists.
    pub fn score(&self) -> Option<u8> {
        match self {
            EvaluationResult::Scored { score, .. } | EvaluationResult::Coerced { score, .. } => {
                Some(*score)
            }
            EvaluationResult::ParseError { .. } => None,
        }
    }

    /// Feedback text; `"parse_error"` for unparseable responses.
    pub fn feedback(&self) -> &str {
        match self {
            EvaluationResult::Scored { feedback, .. }
            | EvaluationResult::Coerced { feedback, .. } => feedback,
            EvaluationResult::ParseError { .. } => "parse_error",
        }
    }

    /// Suggested improved output; empty for unparseable responses.
    pub fn improved_output(&self) -> &str {
        match self {
            EvaluationResult::Scored { improved_output, .. }
            | EvaluationResult::Coerced { improved_output, .. } => improved_output,
            EvaluationResult::ParseError { .. } => "",
        }
    }

    /// Whether the score was clamped or rounded.
    pub fn is_coerced(&self) -> bool {
        matches!(self, EvaluationResult::Coerced { .. })
    }
}

/// Errors from the evaluator. Parse failures are not errors — they are the
/// [`EvaluationResult::ParseError`] variant.
#[derive(Debug, Error)]
pub enum EvaluatorError {
    /// The underlying LLM call failed.
    #[error(transparent)]
    Llm(#[from] LlmError),
}

/// Fields extracted from a labeled response.
#[derive(Debug, Clone)]
struct ParsedSections {
    score_raw: String,
    feedback: String,
    improved_output: String,
}

/// Rubric evaluator over an [`LlmCaller`].
pub struct RubricEvaluator {
    caller: LlmCaller,
    model_id: String,
    temperature: f64,
    rubric: String,
    context_passages: Vec<String>,
    max_context_passages: usize,
    max_context_chars: usize,
}

impl RubricEvaluator {
    pub fn new(
        caller: LlmCaller,
        model_id: impl Into<String>,
        temperature: f64,
        rubric: impl Into<String>,
    ) -> Self {
        Self {
            caller,
            model_id: model_id.into(),
            temperature,
            rubric: rubric.into(),
            context_passages: Vec::new(),
            max_context_passages: 5,
            max_context_chars: 8000,
        }
    }

    /// Provide knowledge passages for evaluation context.
    pub fn with_context_passages(mut self, passages: Vec<String>) -> Self {
        self.context_passages = passages;
        self
    }

    /// Bound the number of passages and the total context characters.
    pub fn with_context_bounds(mut self, max_passages: usize, max_chars: usize) -> Self {
        self.max_context_passages = max_passages;
        self.max_context_chars = max_chars;
        self
    }

    /// Evaluate one generated output against the rubric.
    ///
    /// # Errors
    ///
    /// Only transport-level failures surface as `Err`; an unparseable
    /// response becomes `Ok(EvaluationResult::ParseError { .. })`.
    pub async fn evaluate(
        &self,
        input_data: &str,
        generated_content: &str,
    ) -> Result<EvaluationResult, EvaluatorError> {
        let prompt = self.build_prompt(input_data, generated_content);
        let request = CompletionRequest::new(&self.model_id, prompt, self.temperature);
        let response = self.caller.call(&request).await?;

        if let Some(result) = try_parse(&response) {
            return Ok(result);
        }

        warn!("evaluation response unparseable, attempting repair call");
        let repair = CompletionRequest::new(
            &self.model_id,
            build_repair_prompt(&response),
            self.temperature,
        );
        let repaired = self.caller.call(&repair).await?;

        match parse_sections(&repaired) {
            Some(sections) => Ok(result_from_sections(sections)),
            None => {
                warn!("repair response still unparseable, recording parse error");
                Ok(EvaluationResult::ParseError { raw: repaired })
            }
        }
    }

    fn build_prompt(&self, input_data: &str, generated_content: &str) -> String {
        let mut prompt = String::new();
        prompt.push_str(
            "You are an expert evaluator. Assess the generated content against \
             the rubric and the input data.\n\n",
        );
        prompt.push_str("Rubric:\n");
        prompt.push_str(&self.rubric);
        prompt.push_str("\n\n");

        let context = self.bounded_context();
        if !context.is_empty() {
            prompt.push_str("Reference material:\n");
            prompt.push_str(&context);
            prompt.push_str("\n\n");
        }

        prompt.push_str("Input data:\n");
        prompt.push_str(input_data);
        prompt.push_str("\n\nGenerated content:\n");
        prompt.push_str(generated_content);
        prompt.push_str("\n\nRespond using exactly this template:\n");
        prompt.push_str("SCORE: <integer from 1 to 5>\n");
        prompt.push_str("FEEDBACK: <specific guidance on how to improve>\n");
        prompt.push_str("IMPROVED_OUTPUT: <a better version of the output>\n");
        prompt
    }

    fn bounded_context(&self) -> String {
        let mut context = String::new();
        for passage in self.context_passages.iter().take(self.max_context_passages) {
            if !context.is_empty() {
                context.push_str("\n---\n");
            }
            let budget = self.max_context_chars.saturating_sub(context.len());
            if budget == 0 {
                break;
            }
            if passage.len() <= budget {
                context.push_str(passage);
            } else {
                let mut cut = budget;
                while cut > 0 && !passage.is_char_boundary(cut) {
                    cut -= 1;
                }
                context.push_str(&passage[..cut]);
            }
        }
        context
    }
}

fn build_repair_prompt(raw: &str) -> String {
    format!(
        "Your previous evaluation could not be parsed. Restate it using exactly \
         this template and nothing else:\n\
         SCORE: <integer from 1 to 5>\n\
         FEEDBACK: <specific guidance on how to improve>\n\
         IMPROVED_OUTPUT: <a better version of the output>\n\n\
         Previous response:\n{raw}"
    )
}

/// Parse a response into a usable result; `None` when the labels are absent
/// or the score value is unusable, so the caller can attempt a repair.
fn try_parse(raw: &str) -> Option<EvaluationResult> {
    let sections = parse_sections(raw)?;
    parse_score_value(&sections.score_raw)?;
    Some(result_from_sections(sections))
}

fn result_from_sections(sections: ParsedSections) -> EvaluationResult {
    let parsed = parse_score_value(&sections.score_raw);
    match parsed {
        Some(value) => {
            let rounded = value.round();
            let clamped = rounded.clamp(1.0, 5.0);
            let exact = (value - clamped).abs() < f64::EPSILON;
            let score = clamped as u8;
            if exact {
                EvaluationResult::Scored {
                    score,
                    feedback: sections.feedback,
                    improved_output: sections.improved_output,
                }
            } else {
                debug!(raw = %sections.score_raw, score, "score coerced into range");
                EvaluationResult::Coerced {
                    score,
                    feedback: sections.feedback,
                    improved_output: sections.improved_output,
                    raw: sections.score_raw,
                }
            }
        }
        None => EvaluationResult::ParseError {
            raw: format!("SCORE: {}", sections.score_raw),
        },
    }
}

/// Split a response into the three labeled sections.
///
/// Labels match case-insensitively at line starts, with `:` or `-` as the
/// separator. Prose before the first label and after the last section is
/// ignored. FEEDBACK and IMPROVED_OUTPUT may span multiple lines.
fn parse_sections(raw: &str) -> Option<ParsedSections> {
    #[derive(Clone, Copy, PartialEq)]
    enum Section {
        None,
        Feedback,
        Improved,
    }

    let mut score_raw: Option<String> = None;
    let mut feedback = String::new();
    let mut improved = String::new();
    let mut current = Section::None;

    for line in raw.lines() {
        if let Some(value) = match_label(line, "score") {
            if score_raw.is_none() {
                score_raw = Some(value.to_string());
            }
            current = Section::None;
        } else if let Some(value) = match_label(line, "feedback") {
            if !feedback.is_empty() {
                feedback.push('\n');
            }
            feedback.push_str(value);
            current = Section::Feedback;
        } else if let Some(value) = match_label(line, "improved_output")
            .or_else(|| match_label(line, "improved output"))
        {
            if !improved.is_empty() {
                improved.push('\n');
            }
            improved.push_str(value);
            current = Section::Improved;
        } else {
            match current {
                Section::Feedback => {
                    feedback.push('\n');
                    feedback.push_str(line);
                }
                Section::Improved => {
                    improved.push('\n');
                    improved.push_str(line);
                }
                Section::None => {}
            }
        }
    }

    let score_raw = score_raw?;
    Some(ParsedSections {
        score_raw,
        feedback: feedback.trim().to_string(),
        improved_output: improved.trim().to_string(),
    })
}

/// Match `label` at the start of a trimmed line, returning the text after the
/// `:` or `-` separator.
fn match_label<'a>(line: &'a str, label: &str) -> Option<&'a str> {
    let trimmed = line.trim_start();
    let head = trimmed.get(..label.len())?;
    if !head.eq_ignore_ascii_case(label) {
        return None;
    }
    let rest = trimmed[label.len()..].trim_start();
    let rest = rest.strip_prefix(':').or_else(|| rest.strip_prefix('-'))?;
    Some(rest.trim())
}

/// Parse a score value: bare number, `N/5`, or a spelled-out digit 1..5.
fn parse_score_value(raw: &str) -> Option<f64> {
    let cleaned = raw.trim().trim_end_matches(['.', ',']);
    if cleaned.is_empty() {
        return None;
    }
    let lowered = cleaned.to_ascii_lowercase();

    if let Some(prefix) = lowered.strip_suffix("/5") {
        if let Ok(value) = prefix.trim().parse::<f64>() {
            return Some(value);
        }
    }

    let first = lowered.split_whitespace().next()?;
    let first = first.trim_end_matches(['.', ',', '/']);
    if let Ok(value) = first.parse::<f64>() {
        return Some(value);
    }

    match first {
        "one" => Some(1.0),
        "two" => Some(2.0),
        "three" => Some(3.0),
        "four" => Some(4.0),
        "five" => Some(5.0),
        _ => None,
    }
}
