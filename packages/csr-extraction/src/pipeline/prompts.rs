//! LLM prompts for structured indicator extraction.
//!
//! The extraction contract is schema-first: the model must return a
//! single JSON object with fixed keys, or the literal `NOT_FOUND`.
//! A strict reminder is appended when a previous reply failed to parse.

use sha2::{Digest, Sha256};

use crate::catalogue::IndicatorDef;

/// Maximum passage characters sent to the model.
pub const MAX_PASSAGE_CHARS: usize = 3000;

/// System instruction demanding strict JSON output.
pub const EXTRACT_SYSTEM_PROMPT: &str = r#"You extract quantitative ESG indicators from corporate sustainability report passages.

Given an indicator definition and a passage, reply with EXACTLY ONE of:

1. A single JSON object of this shape, and nothing else:
{
    "value": "<the reported number, as printed, e.g. \"32,400\">",
    "unit": "<the unit as printed, e.g. \"metric tons CO2e\">",
    "year": <four-digit reporting year, or null>,
    "source_quote": "<the exact sentence from the passage containing the value>"
}

2. The literal string NOT_FOUND when the passage does not report a value
   for this indicator.

Rules:
- "value" must come from the passage. Never compute or invent a number.
- When the passage reports the indicator for several years, set "value" to
  an object keyed by year, e.g. {"2021": "10,000", "2022": "12,500"}, and
  set "year" to null.
- "source_quote" must be copied verbatim from the passage.
- Do not wrap the JSON in code fences or prose."#;

/// Reminder appended after a malformed reply.
pub const STRICT_JSON_REMINDER: &str = "\n\nREMINDER: your previous reply was not valid. Reply with ONLY the JSON object described above (keys: value, unit, year, source_quote) or the literal string NOT_FOUND. No code fences, no commentary.";

/// System instruction for the verifier's constrained unit re-prompt.
pub const UNIT_SYSTEM_PROMPT: &str = r#"You map a reported measurement unit onto a fixed vocabulary.
Reply with exactly one vocabulary entry, verbatim, or UNKNOWN if none applies.
No punctuation, no explanation."#;

/// Compose the per-candidate user message.
pub fn format_extract_prompt(def: &IndicatorDef, passage: &str) -> String {
    format!(
        "Indicator: {name}\nGroup: {group}\nExpected unit: {unit}\n\nPassage:\n{passage}",
        name = def.name,
        group = def.group,
        unit = def.unit,
        passage = truncate_passage(passage, MAX_PASSAGE_CHARS),
    )
}

/// Compose the constrained unit-mapping user message.
pub fn format_unit_prompt(def: &IndicatorDef, raw_unit: &str) -> String {
    format!(
        "Indicator: {name}\nReported unit: {raw_unit}\nVocabulary: {vocab}",
        name = def.name,
        vocab = def.unit_vocabulary.join(", "),
    )
}

/// Truncate a passage to `limit` characters, cutting on a paragraph
/// boundary where one exists in the back half of the window.
pub fn truncate_passage(passage: &str, limit: usize) -> &str {
    if passage.len() <= limit {
        return passage;
    }
    let mut end = limit;
    while end > 0 && !passage.is_char_boundary(end) {
        end -= 1;
    }
    let window = &passage[..end];
    if let Some(cut) = window.rfind('\n') {
        if cut >= limit / 2 {
            return &passage[..cut];
        }
    }
    window
}

/// Hash of the extraction prompt template, recorded in lineage so a
/// prompt change invalidates cached comparisons.
pub fn extract_prompt_hash() -> String {
    let mut hasher = Sha256::new();
    hasher.update(EXTRACT_SYSTEM_PROMPT.as_bytes());
    format!("{:x}", hasher.finalize())
}
