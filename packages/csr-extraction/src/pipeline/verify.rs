//! Verification stage: raw LLM records in, warehouse-ready records out.
//!
//! Applies the validation rules in a fixed order (value, unit, year,
//! quote), expands multi-year records into one row per year, and scores
//! each surviving record with a confidence in `[0, 1]`. Unknown units get
//! one constrained LLM re-prompt against the indicator's vocabulary
//! before rejection.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::catalogue::{Catalogue, IndicatorDef};
use crate::error::{PipelineError, Result};
use crate::locate::{year_occurrences, MIN_YEAR};
use crate::numeric::{num_from_str, safe_eval};
use crate::pipeline::extract::{RawRecord, RawValue, TokenBudget};
use crate::pipeline::prompts::{format_unit_prompt, UNIT_SYSTEM_PROMPT};
use crate::text::ExtractedDoc;
use crate::traits::llm::{ChatModel, ChatRequest};
use crate::traits::warehouse::NewIndicatorRow;

/// Why a raw record (or one expanded year of it) was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    UnparseableValue,
    UnknownUnit,
    YearAmbiguous,
    HallucinatedQuote,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UnparseableValue => "unparseable_value",
            Self::UnknownUnit => "unknown_unit",
            Self::YearAmbiguous => "year_ambiguous",
            Self::HallucinatedQuote => "hallucinated_quote",
        }
    }
}

/// One rejected record, kept for lineage reason counts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rejection {
    pub indicator: String,
    pub year: Option<i32>,
    pub reason: RejectReason,
}

/// Everything the verification stage produced for one report.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct VerifyOutcome {
    pub verified: Vec<NewIndicatorRow>,
    pub rejections: Vec<Rejection>,
    /// Tokens spent on constrained unit re-prompts.
    pub tokens_spent: u64,
}

/// Derivation path of the canonical unit, reflected in confidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UnitPath {
    Catalogue,
    Reprompt,
}

/// Derivation path of the year, reflected in confidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum YearPath {
    Explicit,
    Inferred,
}

/// Year of one expanded row before the range check.
#[derive(Debug, Clone, Copy)]
enum RowYear {
    Explicit(i32),
    /// No year stated anywhere; infer from the passage.
    Infer,
    /// A multi-year key that did not parse as any year form.
    Invalid,
}

impl RowYear {
    fn explicit(self) -> Option<i32> {
        match self {
            RowYear::Explicit(y) => Some(y),
            _ => None,
        }
    }
}

/// Verify every raw record against the report it came from.
///
/// Unit re-prompts go through the same request slots, token budget and
/// cancellation token as the extraction stage. Output rows are sorted by
/// `(indicator_name, year, source_page)`, the order the ingestor writes
/// them in.
pub async fn verify_records(
    llm: Arc<dyn ChatModel>,
    catalogue: &Catalogue,
    doc: &ExtractedDoc,
    records: &[RawRecord],
    slots: Arc<Semaphore>,
    budget: Option<Arc<TokenBudget>>,
    cancel: &CancellationToken,
) -> Result<VerifyOutcome> {
    let mut outcome = VerifyOutcome::default();

    for raw in records {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        let Some(def) = catalogue.indicator(&raw.indicator) else {
            debug!(indicator = %raw.indicator, "record for unknown indicator, dropping");
            continue;
        };
        verify_one(
            &*llm,
            catalogue,
            def,
            doc,
            raw,
            &slots,
            budget.as_deref(),
            cancel,
            &mut outcome,
        )
        .await?;
    }

    outcome.verified.sort_by(|a, b| {
        (a.indicator_name.as_str(), a.year, a.source_page)
            .cmp(&(b.indicator_name.as_str(), b.year, b.source_page))
    });
    // one row per (indicator, year): keep the highest-confidence record
    outcome.verified.dedup_by(|b, a| {
        a.indicator_name == b.indicator_name && a.year == b.year && {
            if b.confidence > a.confidence {
                std::mem::swap(a, b);
            }
            true
        }
    });
    Ok(outcome)
}

#[allow(clippy::too_many_arguments)]
async fn verify_one(
    llm: &dyn ChatModel,
    catalogue: &Catalogue,
    def: &IndicatorDef,
    doc: &ExtractedDoc,
    raw: &RawRecord,
    slots: &Semaphore,
    budget: Option<&TokenBudget>,
    cancel: &CancellationToken,
    outcome: &mut VerifyOutcome,
) -> Result<()> {
    let reject = |year: Option<i32>, reason: RejectReason| Rejection {
        indicator: raw.indicator.clone(),
        year,
        reason,
    };

    // rule 1 precursor: a record with no value at all cannot parse
    let Some(value) = &raw.value else {
        outcome.rejections.push(reject(None, RejectReason::UnparseableValue));
        return Ok(());
    };

    // expand multi-year records before the per-row rules
    let explicit_year = raw
        .year_text
        .as_deref()
        .and_then(|t| parse_year_text(catalogue, t));
    let rows: Vec<(RowYear, &str)> = match value {
        RawValue::Single(text) => match explicit_year {
            Some(year) => vec![(RowYear::Explicit(year), text.as_str())],
            None => vec![(RowYear::Infer, text.as_str())],
        },
        RawValue::PerYear(pairs) => pairs
            .iter()
            .map(|(key, text)| match parse_year_text(catalogue, key) {
                Some(year) => (RowYear::Explicit(year), text.as_str()),
                None => (RowYear::Invalid, text.as_str()),
            })
            .collect(),
    };

    // rule 1: numeric coercion, arithmetic as fallback (thousand
    // separators stripped first; safe_eval itself rejects them)
    let mut coerced: Vec<(RowYear, f64)> = Vec::new();
    for (row_year, value_text) in rows {
        let parsed = num_from_str(value_text)
            .or_else(|| safe_eval(&value_text.replace(',', "")))
            .filter(|v| v.is_finite());
        match parsed {
            Some(value_numeric) => coerced.push((row_year, value_numeric)),
            None => outcome
                .rejections
                .push(reject(row_year.explicit(), RejectReason::UnparseableValue)),
        }
    }
    if coerced.is_empty() {
        return Ok(());
    }

    // rule 2: unit, shared by every row that still stands
    let (unit_canonical, unit_path) = match canonicalise_unit(
        llm,
        def,
        raw.unit_text.as_deref(),
        slots,
        budget,
        cancel,
        outcome,
    )
    .await?
    {
        Some(found) => found,
        None => {
            for (row_year, _) in &coerced {
                outcome
                    .rejections
                    .push(reject(row_year.explicit(), RejectReason::UnknownUnit));
            }
            return Ok(());
        }
    };

    // rule 4 precursor: locate the quote once; shared by every row
    let quote_page = raw
        .source_quote
        .as_deref()
        .and_then(|q| find_quote_page(doc, q, raw.page_index));

    for (row_year, value_numeric) in coerced {
        // rule 3: year range, inferring from the passage when missing
        let (year, year_path) = match row_year {
            RowYear::Explicit(y) if (MIN_YEAR..=crate::locate::max_year()).contains(&y) => {
                (y, YearPath::Explicit)
            }
            RowYear::Explicit(y) => {
                outcome.rejections.push(reject(Some(y), RejectReason::YearAmbiguous));
                continue;
            }
            RowYear::Invalid => {
                outcome.rejections.push(reject(None, RejectReason::YearAmbiguous));
                continue;
            }
            RowYear::Infer => match dominant_year(&raw.passage_text) {
                Some(y) => (y, YearPath::Inferred),
                None => {
                    outcome.rejections.push(reject(None, RejectReason::YearAmbiguous));
                    continue;
                }
            },
        };

        // rule 4: the quote must exist verbatim on some page
        let Some((source_page, source_quote)) = quote_page.clone() else {
            outcome
                .rejections
                .push(reject(Some(year), RejectReason::HallucinatedQuote));
            continue;
        };

        outcome.verified.push(NewIndicatorRow {
            indicator_name: raw.indicator.clone(),
            year,
            value_numeric,
            unit_canonical: unit_canonical.clone(),
            source_page,
            source_quote,
            confidence: confidence(raw.passage_score, raw.attempt, unit_path, year_path),
        });
    }
    Ok(())
}

/// Rule 2: catalogue lookup first, then one constrained LLM re-prompt.
///
/// The re-prompt is an LLM call like any other: it takes a request slot,
/// draws on the token budget, and stops at cancellation.
#[allow(clippy::too_many_arguments)]
async fn canonicalise_unit(
    llm: &dyn ChatModel,
    def: &IndicatorDef,
    unit_text: Option<&str>,
    slots: &Semaphore,
    budget: Option<&TokenBudget>,
    cancel: &CancellationToken,
    outcome: &mut VerifyOutcome,
) -> Result<Option<(String, UnitPath)>> {
    let Some(raw_unit) = unit_text.map(str::trim).filter(|u| !u.is_empty()) else {
        return Ok(None);
    };

    if let Some(canon) = def.canonical_unit(raw_unit) {
        return Ok(Some((canon, UnitPath::Catalogue)));
    }

    let mut request = ChatRequest::new(UNIT_SYSTEM_PROMPT, format_unit_prompt(def, raw_unit));
    request.json_response = false;
    request.max_tokens = 32;

    let _permit = tokio::select! {
        _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
        permit = slots.acquire() => permit.expect("request semaphore never closed"),
    };

    let estimate = request.estimated_tokens();
    if let Some(budget) = budget {
        tokio::select! {
            _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
            res = budget.acquire(estimate) => res?,
        }
    }

    let response = tokio::select! {
        _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
        res = llm.chat(&request) => res,
    };

    match response {
        Ok(response) => {
            let actual = response.total_tokens();
            outcome.tokens_spent += actual as u64;
            if let Some(budget) = budget {
                budget.reconcile(estimate, actual);
            }
            let reply = response.content.trim().trim_matches('"');
            if reply != "UNKNOWN" {
                if let Some(canon) = def.canonical_unit(reply) {
                    return Ok(Some((canon, UnitPath::Reprompt)));
                }
            }
            Ok(None)
        }
        Err(err) => {
            if let Some(budget) = budget {
                budget.reconcile(estimate, 0);
            }
            debug!(indicator = %def.name, error = %err, "unit re-prompt failed");
            Ok(None)
        }
    }
}

/// `"2023"`, `"FY23"` and `"FY2023"` forms.
fn parse_year_text(catalogue: &Catalogue, text: &str) -> Option<i32> {
    let trimmed = text.trim();
    if let Ok(year) = trimmed.parse::<i32>() {
        return Some(year);
    }
    let digits = trimmed
        .strip_prefix("FY")
        .or_else(|| trimmed.strip_prefix("fy"))?
        .trim();
    match digits.len() {
        2 => digits.parse::<u32>().ok().map(|fy| catalogue.resolve_fiscal_year(fy)),
        4 => digits.parse::<i32>().ok(),
        _ => None,
    }
}

/// Mode of the passage's year occurrences; `None` on a tie or no years.
fn dominant_year(passage: &str) -> Option<i32> {
    let occurrences = year_occurrences(passage);
    let mut counts: Vec<(i32, usize)> = Vec::new();
    for year in occurrences {
        match counts.iter_mut().find(|(y, _)| *y == year) {
            Some((_, n)) => *n += 1,
            None => counts.push((year, 1)),
        }
    }
    counts.sort_by(|a, b| b.1.cmp(&a.1));
    match counts.as_slice() {
        [] => None,
        [(year, _)] => Some(*year),
        [(year, n1), (_, n2), ..] if n1 > n2 => Some(*year),
        _ => None,
    }
}

/// Whitespace-insensitive substring search for the quote, starting at the
/// page the candidate came from. Returns the page and the quote as it
/// appears after normalisation.
fn find_quote_page(doc: &ExtractedDoc, quote: &str, preferred_page: u32) -> Option<(u32, String)> {
    let needle = squash_whitespace(quote);
    if needle.is_empty() {
        return None;
    }

    let matches_page = |text: &str| squash_whitespace(text).contains(&needle);

    if let Some(page) = doc.page(preferred_page) {
        if matches_page(&page.text) {
            return Some((page.index, needle));
        }
    }
    doc.pages
        .iter()
        .find(|p| matches_page(&p.text))
        .map(|p| (p.index, needle))
}

fn squash_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Weighted confidence: passage relevance, attempts spent, and how the
/// unit and year were derived.
fn confidence(passage_score: u32, attempt: u32, unit_path: UnitPath, year_path: YearPath) -> f64 {
    let passage = f64::from(passage_score.min(200)) / 200.0;
    let attempts = 1.0 / f64::from(attempt.max(1));
    let unit = match unit_path {
        UnitPath::Catalogue => 1.0,
        UnitPath::Reprompt => 0.6,
    };
    let year = match year_path {
        YearPath::Explicit => 1.0,
        YearPath::Inferred => 0.7,
    };
    let score = 0.4 * passage + 0.2 * attempts + 0.2 * unit + 0.2 * year;
    (score * 1000.0).round() / 1000.0
}
