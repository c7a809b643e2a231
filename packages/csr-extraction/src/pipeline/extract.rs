//! LLM extraction stage: candidate passages in, raw records out.
//!
//! Issues bounded-concurrency chat requests with retry, backoff and a
//! token budget, then parses each reply into a `RawRecord`. Output order
//! is deterministic: sorted by `(indicator_name, page_index)`.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::catalogue::Catalogue;
use crate::error::{LlmError, PipelineError, Result};
use crate::locate::CandidatePassage;
use crate::pipeline::prompts::{
    format_extract_prompt, EXTRACT_SYSTEM_PROMPT, STRICT_JSON_REMINDER,
};
use crate::traits::llm::{ChatModel, ChatRequest};

/// Bounds and retry policy for the extraction stage.
#[derive(Debug, Clone)]
pub struct ExtractorConfig {
    /// Concurrent LLM requests (C_llm).
    pub concurrency: usize,
    /// Attempts per candidate, including the first.
    pub max_attempts: u32,
    /// First backoff delay.
    pub backoff_base: Duration,
    /// Multiplier per further attempt.
    pub backoff_factor: f64,
    /// Relative jitter applied to each delay (0.2 = ±20%).
    pub jitter: f64,
    /// Completion token cap per request.
    pub max_tokens: u32,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            concurrency: 8,
            max_attempts: 4,
            backoff_base: Duration::from_secs(1),
            backoff_factor: 2.0,
            jitter: 0.2,
            max_tokens: 1024,
        }
    }
}

impl ExtractorConfig {
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = self.backoff_base.as_secs_f64() * self.backoff_factor.powi(attempt as i32 - 1);
        let spread = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        Duration::from_secs_f64((exp * (1.0 + spread)).max(0.0))
    }
}

/// Aggregate token budget for one run.
///
/// Each request acquires its estimate before sending (back-pressure, not
/// cancellation); the unused part is returned once the provider reports
/// actual usage, so waiting prompts resume as earlier calls settle.
pub struct TokenBudget {
    semaphore: Semaphore,
    capacity: u32,
}

impl TokenBudget {
    pub fn new(tokens: u32) -> Arc<Self> {
        Arc::new(Self {
            semaphore: Semaphore::new(tokens as usize),
            capacity: tokens,
        })
    }

    pub(crate) async fn acquire(&self, estimate: u32) -> Result<()> {
        // an estimate the whole budget cannot cover would wait forever;
        // that is a configuration error, not back-pressure
        if estimate > self.capacity {
            return Err(PipelineError::BudgetExhausted {
                estimate,
                budget: self.capacity,
            });
        }
        // permits are consumed, not held: the budget is a spending cap,
        // so tokens only come back when actual usage undershoots the
        // estimate
        self.semaphore
            .acquire_many(estimate)
            .await
            .expect("budget semaphore never closed")
            .forget();
        Ok(())
    }

    pub(crate) fn reconcile(&self, estimate: u32, actual: u32) {
        if actual < estimate {
            self.semaphore.add_permits((estimate - actual) as usize);
        }
    }

    /// Tokens still available (for logging).
    pub fn remaining(&self) -> usize {
        self.semaphore.available_permits()
    }
}

/// The model's value field: a single number-as-text, or one per year.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RawValue {
    Single(String),
    /// Year keys exactly as the model printed them (`"2021"`, `"FY23"`);
    /// interpretation belongs to the verifier, which knows the
    /// catalogue's fiscal-year mapping.
    PerYear(Vec<(String, String)>),
}

/// One unverified extraction result. May be invalid; the verifier decides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawRecord {
    pub indicator: String,
    pub page_index: u32,
    /// Passage the model saw, kept so checkpointed runs can re-verify
    /// without re-locating.
    pub passage_text: String,
    pub passage_score: u32,
    pub value: Option<RawValue>,
    pub unit_text: Option<String>,
    /// Year as the model printed it (`"2023"`, `"FY23"`); interpretation
    /// belongs to the verifier.
    pub year_text: Option<String>,
    pub source_quote: Option<String>,
    pub attempt: u32,
}

/// Per-indicator terminal failure surfaced to the driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndicatorFailure {
    pub indicator: String,
    pub class: String,
}

/// Everything the extraction stage produced for one report.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ExtractOutcome {
    pub records: Vec<RawRecord>,
    pub failures: Vec<IndicatorFailure>,
    pub tokens_spent: u64,
}

/// Run the LLM over every candidate passage.
///
/// `slots` is the process-wide LLM request semaphore (C_llm), shared so a
/// batch of reports stays within one global bound.
pub async fn extract_records(
    llm: Arc<dyn ChatModel>,
    catalogue: &Catalogue,
    candidates: Vec<CandidatePassage>,
    cfg: &ExtractorConfig,
    slots: Arc<Semaphore>,
    budget: Option<Arc<TokenBudget>>,
    cancel: &CancellationToken,
) -> Result<ExtractOutcome> {
    let mut handles = Vec::with_capacity(candidates.len());

    for candidate in candidates {
        let def = match catalogue.indicator(&candidate.indicator) {
            Some(def) => def,
            None => {
                // locator output always comes from this catalogue
                warn!(indicator = %candidate.indicator, "candidate for unknown indicator, skipping");
                continue;
            }
        };
        let user = format_extract_prompt(def, &candidate.text);

        let llm = Arc::clone(&llm);
        let slots = Arc::clone(&slots);
        let budget = budget.clone();
        let cancel = cancel.clone();
        let cfg = cfg.clone();

        handles.push(tokio::spawn(async move {
            let _permit = slots
                .acquire()
                .await
                .expect("extractor semaphore never closed");
            extract_one(&*llm, &candidate, user, &cfg, budget.as_deref(), &cancel).await
        }));
    }

    let mut outcome = ExtractOutcome::default();
    for handle in handles {
        let (result, spent) = handle
            .await
            .map_err(|e| PipelineError::Storage(Box::new(e)))??;
        outcome.tokens_spent += spent;
        match result {
            Ok(Some(record)) => outcome.records.push(record),
            Ok(None) => {}
            Err(failure) => outcome.failures.push(failure),
        }
    }

    if cancel.is_cancelled() {
        return Err(PipelineError::Cancelled);
    }

    outcome.records.sort_by(|a, b| {
        (a.indicator.as_str(), a.page_index).cmp(&(b.indicator.as_str(), b.page_index))
    });
    outcome.failures.sort_by(|a, b| a.indicator.cmp(&b.indicator));
    Ok(outcome)
}

/// Drive one candidate to a terminal state. Returns the tokens spent
/// alongside the result so the caller can aggregate cost. The outer
/// `Result` carries run-fatal errors (a budget no request can fit in).
async fn extract_one(
    llm: &dyn ChatModel,
    candidate: &CandidatePassage,
    user: String,
    cfg: &ExtractorConfig,
    budget: Option<&TokenBudget>,
    cancel: &CancellationToken,
) -> Result<(
    std::result::Result<Option<RawRecord>, IndicatorFailure>,
    u64,
)> {
    let mut spent: u64 = 0;
    let mut reminded = false;
    let mut request = ChatRequest::new(EXTRACT_SYSTEM_PROMPT, user);
    request.max_tokens = cfg.max_tokens;

    let mut attempt = 1;
    loop {
        if cancel.is_cancelled() {
            return Ok((Ok(None), spent));
        }

        let estimate = request.estimated_tokens();
        if let Some(budget) = budget {
            tokio::select! {
                _ = cancel.cancelled() => return Ok((Ok(None), spent)),
                res = budget.acquire(estimate) => res?,
            }
        }

        let response = tokio::select! {
            _ = cancel.cancelled() => return Ok((Ok(None), spent)),
            res = llm.chat(&request) => res,
        };

        match response {
            Ok(response) => {
                let actual = response.total_tokens();
                spent += actual as u64;
                if let Some(budget) = budget {
                    budget.reconcile(estimate, actual);
                }

                match parse_llm_reply(&response.content) {
                    Ok(None) => {
                        debug!(indicator = %candidate.indicator, page = candidate.page_index, "NOT_FOUND");
                        return Ok((Ok(None), spent));
                    }
                    Ok(Some(payload)) => {
                        return Ok((Ok(Some(payload.into_record(candidate, attempt))), spent));
                    }
                    Err(reason) => {
                        // one strict re-prompt, then give up on this reply shape
                        if reminded || attempt >= cfg.max_attempts {
                            warn!(indicator = %candidate.indicator, %reason, "persistently malformed output");
                            return Ok((
                                Ok(Some(RawRecord {
                                    indicator: candidate.indicator.clone(),
                                    page_index: candidate.page_index,
                                    passage_text: candidate.text.clone(),
                                    passage_score: candidate.score,
                                    value: None,
                                    unit_text: None,
                                    year_text: None,
                                    source_quote: None,
                                    attempt: cfg.max_attempts,
                                })),
                                spent,
                            ));
                        }
                        reminded = true;
                        request.user.push_str(STRICT_JSON_REMINDER);
                    }
                }
            }
            Err(err) => {
                if let Some(budget) = budget {
                    budget.reconcile(estimate, 0);
                }
                if matches!(err, LlmError::PolicyBlocked) {
                    return Ok((
                        Err(IndicatorFailure {
                            indicator: candidate.indicator.clone(),
                            class: err.class().to_string(),
                        }),
                        spent,
                    ));
                }
                if !err.is_transient() || attempt >= cfg.max_attempts {
                    warn!(indicator = %candidate.indicator, error = %err, attempt, "LLM extraction failed");
                    return Ok((
                        Err(IndicatorFailure {
                            indicator: candidate.indicator.clone(),
                            class: err.class().to_string(),
                        }),
                        spent,
                    ));
                }
                debug!(indicator = %candidate.indicator, error = %err, attempt, "transient LLM failure, backing off");
            }
        }

        let delay = cfg.backoff_delay(attempt);
        tokio::select! {
            _ = cancel.cancelled() => return Ok((Ok(None), spent)),
            _ = tokio::time::sleep(delay) => {}
        }
        attempt += 1;
    }
}

/// Parsed shape of a well-formed model reply.
struct LlmPayload {
    value: RawValue,
    unit: Option<String>,
    year: Option<String>,
    source_quote: Option<String>,
}

impl LlmPayload {
    fn into_record(self, candidate: &CandidatePassage, attempt: u32) -> RawRecord {
        RawRecord {
            indicator: candidate.indicator.clone(),
            page_index: candidate.page_index,
            passage_text: candidate.text.clone(),
            passage_score: candidate.score,
            value: Some(self.value),
            unit_text: self.unit,
            year_text: self.year,
            source_quote: self.source_quote,
            attempt,
        }
    }
}

/// Parse a model reply: `NOT_FOUND`, or the first balanced JSON object.
///
/// `Ok(None)` is the terminal not-found outcome; `Err` is a malformed
/// reply (wrong shape, missing keys, no JSON at all).
fn parse_llm_reply(content: &str) -> std::result::Result<Option<LlmPayload>, String> {
    let stripped = strip_code_fences(content.trim());
    let trimmed = stripped.trim().trim_matches('"');
    if trimmed == "NOT_FOUND" {
        return Ok(None);
    }

    let json = first_balanced_object(stripped).ok_or("no JSON object in reply")?;
    let value: serde_json::Value =
        serde_json::from_str(json).map_err(|e| format!("invalid JSON: {e}"))?;
    let obj = value.as_object().ok_or("reply is not a JSON object")?;

    for key in ["value", "unit", "year", "source_quote"] {
        if !obj.contains_key(key) {
            return Err(format!("missing key {key:?}"));
        }
    }

    let raw_value = match &obj["value"] {
        serde_json::Value::String(s) => RawValue::Single(s.clone()),
        serde_json::Value::Number(n) => RawValue::Single(n.to_string()),
        serde_json::Value::Object(map) => {
            let mut per_year = Vec::new();
            for (k, v) in map {
                if !is_year_key(k) {
                    return Err(format!("non-year key {k:?} in value object"));
                }
                let text = match v {
                    serde_json::Value::String(s) => s.clone(),
                    serde_json::Value::Number(n) => n.to_string(),
                    other => return Err(format!("non-numeric value for {k:?}: {other}")),
                };
                per_year.push((k.clone(), text));
            }
            per_year.sort_by_cached_key(|(k, _)| year_key_rank(k));
            if per_year.is_empty() {
                return Err("empty multi-year value object".to_string());
            }
            RawValue::PerYear(per_year)
        }
        serde_json::Value::Null => return Err("null value".to_string()),
        other => return Err(format!("unexpected value shape: {other}")),
    };

    let as_opt_string = |v: &serde_json::Value| -> Option<String> {
        match v {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    };

    Ok(Some(LlmPayload {
        value: raw_value,
        unit: as_opt_string(&obj["unit"]),
        year: as_opt_string(&obj["year"]),
        source_quote: as_opt_string(&obj["source_quote"]),
    }))
}

/// A value-object key is a four-digit year or an `FY`-prefixed two- or
/// four-digit one. Anything else makes the reply malformed.
fn is_year_key(key: &str) -> bool {
    let all_digits = |s: &str| s.bytes().all(|b| b.is_ascii_digit());
    match key.strip_prefix("FY").or_else(|| key.strip_prefix("fy")) {
        Some(digits) => matches!(digits.len(), 2 | 4) && all_digits(digits),
        None => key.len() == 4 && all_digits(key),
    }
}

/// Ordering key for multi-year entries; mapping of fiscal shorthands to
/// calendar years is deferred to the verifier.
fn year_key_rank(key: &str) -> i32 {
    let digits = key
        .strip_prefix("FY")
        .or_else(|| key.strip_prefix("fy"))
        .unwrap_or(key);
    let n: i32 = digits.parse().unwrap_or(0);
    if digits.len() == 2 {
        2000 + n
    } else {
        n
    }
}

/// Remove a surrounding markdown code fence, if present.
fn strip_code_fences(content: &str) -> &str {
    let trimmed = content.trim();
    if !trimmed.starts_with("```") {
        return trimmed;
    }
    let without_open = match trimmed.find('\n') {
        Some(nl) => &trimmed[nl + 1..],
        None => return trimmed,
    };
    without_open
        .rfind("```")
        .map(|end| without_open[..end].trim())
        .unwrap_or(without_open)
}

/// Slice out the first balanced `{...}` block, string-aware.
fn first_balanced_object(content: &str) -> Option<&str> {
    let start = content.find('{')?;
    let bytes = content.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&content[start..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalogue::Catalogue;
    use crate::testing::MockChatModel;

    fn catalogue() -> Catalogue {
        Catalogue::from_toml(
            r#"
[[groups]]
group_name = "Emissions"
[[groups.indicators]]
name = "Scope 1 Emissions"
unit = "tCO2e"
keywords = ["Scope 1"]
"#,
        )
        .unwrap()
    }

    fn candidate(text: &str) -> CandidatePassage {
        CandidatePassage {
            indicator: "Scope 1 Emissions".to_string(),
            page_index: 1,
            start_offset: 0,
            text: text.to_string(),
            score: 120,
        }
    }

    fn fast_config() -> ExtractorConfig {
        ExtractorConfig {
            backoff_base: Duration::from_millis(1),
            ..Default::default()
        }
    }

    fn slots() -> Arc<Semaphore> {
        Arc::new(Semaphore::new(8))
    }

    #[test]
    fn parses_plain_json_reply() {
        let reply = r#"{"value": "32,400", "unit": "metric tons CO2e", "year": 2023, "source_quote": "totaled 32,400"}"#;
        let payload = parse_llm_reply(reply).unwrap().unwrap();
        assert_eq!(payload.value, RawValue::Single("32,400".to_string()));
        assert_eq!(payload.year.as_deref(), Some("2023"));
    }

    #[test]
    fn parses_fenced_reply_with_prose() {
        let reply = "Here you go:\n```json\n{\"value\": \"100\", \"unit\": \"%\", \"year\": null, \"source_quote\": \"q\"}\n```";
        let payload = parse_llm_reply(reply).unwrap().unwrap();
        assert_eq!(payload.value, RawValue::Single("100".to_string()));
        assert_eq!(payload.year, None);
    }

    #[test]
    fn parses_multi_year_value_object() {
        let reply = r#"{"value": {"2021": "10,000", "2022": "12,500"}, "unit": "tCO2e", "year": null, "source_quote": "q"}"#;
        let payload = parse_llm_reply(reply).unwrap().unwrap();
        assert_eq!(
            payload.value,
            RawValue::PerYear(vec![
                ("2021".to_string(), "10,000".to_string()),
                ("2022".to_string(), "12,500".to_string())
            ])
        );
    }

    #[test]
    fn fiscal_year_keys_are_kept_verbatim() {
        // mapping FY shorthands to calendar years is the verifier's job
        let reply = r#"{"value": {"FY23": "100", "FY22": "90"}, "unit": "tCO2e", "year": null, "source_quote": "q"}"#;
        let payload = parse_llm_reply(reply).unwrap().unwrap();
        assert_eq!(
            payload.value,
            RawValue::PerYear(vec![
                ("FY22".to_string(), "90".to_string()),
                ("FY23".to_string(), "100".to_string())
            ])
        );
    }

    #[test]
    fn non_year_value_keys_are_malformed() {
        let reply = r#"{"value": {"total": "100"}, "unit": "tCO2e", "year": null, "source_quote": "q"}"#;
        assert!(parse_llm_reply(reply).is_err());
    }

    #[test]
    fn not_found_is_terminal_not_error() {
        assert!(parse_llm_reply("NOT_FOUND").unwrap().is_none());
        assert!(parse_llm_reply("\"NOT_FOUND\"").unwrap().is_none());
    }

    #[test]
    fn missing_keys_are_malformed() {
        let reply = r#"{"value": "100", "unit": "%"}"#;
        assert!(parse_llm_reply(reply).is_err());
    }

    #[test]
    fn balanced_object_respects_strings() {
        let content = r#"noise {"a": "brace } in string", "b": {"c": 1}} tail"#;
        let json = first_balanced_object(content).unwrap();
        assert!(serde_json::from_str::<serde_json::Value>(json).is_ok());
    }

    #[tokio::test]
    async fn extracts_and_sorts_records() {
        let llm = MockChatModel::new().with_reply(
            "Scope 1",
            r#"{"value": "32,400", "unit": "tCO2e", "year": 2023, "source_quote": "q"}"#,
        );
        let outcome = extract_records(
            Arc::new(llm),
            &catalogue(),
            vec![candidate("Scope 1 Emissions in 2023 totaled 32,400 tCO2e.")],
            &fast_config(),
            slots(),
            None,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(outcome.records.len(), 1);
        assert_eq!(outcome.records[0].attempt, 1);
        assert!(outcome.failures.is_empty());
        assert!(outcome.tokens_spent > 0);
    }

    #[tokio::test]
    async fn retries_transient_failures_with_backoff() {
        let llm = MockChatModel::new()
            .failing_times(2, || LlmError::RateLimited)
            .with_reply(
                "Scope 1",
                r#"{"value": "1", "unit": "tCO2e", "year": 2023, "source_quote": "q"}"#,
            );
        let outcome = extract_records(
            Arc::new(llm),
            &catalogue(),
            vec![candidate("Scope 1: 1 tCO2e in 2023")],
            &fast_config(),
            slots(),
            None,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(outcome.records.len(), 1);
        assert_eq!(outcome.records[0].attempt, 3);
    }

    #[tokio::test]
    async fn persistent_failure_surfaces_class() {
        let llm = MockChatModel::new().failing_times(10, || LlmError::Timeout);
        let outcome = extract_records(
            Arc::new(llm),
            &catalogue(),
            vec![candidate("Scope 1")],
            &fast_config(),
            slots(),
            None,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert!(outcome.records.is_empty());
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].class, "timeout");
    }

    #[tokio::test]
    async fn malformed_reply_gets_one_strict_reminder() {
        let llm = MockChatModel::new()
            .with_reply_sequence(
                "Scope 1",
                vec![
                    "sorry, here is prose".to_string(),
                    r#"{"value": "5", "unit": "tCO2e", "year": 2023, "source_quote": "q"}"#
                        .to_string(),
                ],
            );
        let outcome = extract_records(
            Arc::new(llm.clone()),
            &catalogue(),
            vec![candidate("Scope 1")],
            &fast_config(),
            slots(),
            None,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(outcome.records.len(), 1);
        assert_eq!(outcome.records[0].value, Some(RawValue::Single("5".to_string())));
        let prompts = llm.seen_prompts();
        assert!(prompts.last().unwrap().contains("REMINDER"));
    }

    #[tokio::test]
    async fn persistently_malformed_yields_empty_record() {
        let llm = MockChatModel::new().with_reply("Scope 1", "still just prose");
        let outcome = extract_records(
            Arc::new(llm),
            &catalogue(),
            vec![candidate("Scope 1")],
            &fast_config(),
            slots(),
            None,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(outcome.records.len(), 1);
        let record = &outcome.records[0];
        assert!(record.value.is_none());
        assert_eq!(record.attempt, 4);
    }

    #[tokio::test]
    async fn policy_block_skips_indicator() {
        let llm = MockChatModel::new().failing_times(1, || LlmError::PolicyBlocked);
        let outcome = extract_records(
            Arc::new(llm),
            &catalogue(),
            vec![candidate("Scope 1")],
            &fast_config(),
            slots(),
            None,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(outcome.failures[0].class, "policy_blocked");
    }

    #[tokio::test]
    async fn budget_reconciles_unused_estimate() {
        let budget = TokenBudget::new(100_000);
        let llm = MockChatModel::new().with_reply(
            "Scope 1",
            r#"{"value": "1", "unit": "tCO2e", "year": 2023, "source_quote": "q"}"#,
        );
        let before = budget.remaining();
        let outcome = extract_records(
            Arc::new(llm),
            &catalogue(),
            vec![candidate("Scope 1: 1 tCO2e in 2023")],
            &fast_config(),
            slots(),
            Some(Arc::clone(&budget)),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        let spent = before - budget.remaining();
        assert_eq!(spent as u64, outcome.tokens_spent);
    }

    #[tokio::test]
    async fn budget_below_any_estimate_fails_instead_of_waiting() {
        // a 10-token budget cannot cover even one request; the run must
        // error out rather than park on the semaphore forever
        let budget = TokenBudget::new(10);
        let llm = MockChatModel::new().with_reply(
            "Scope 1",
            r#"{"value": "1", "unit": "tCO2e", "year": 2023, "source_quote": "q"}"#,
        );
        let err = extract_records(
            Arc::new(llm),
            &catalogue(),
            vec![candidate("Scope 1: 1 tCO2e in 2023")],
            &fast_config(),
            slots(),
            Some(budget),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, PipelineError::BudgetExhausted { budget: 10, .. }));
    }

    #[tokio::test]
    async fn cancellation_discards_pending_results() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let llm = MockChatModel::new().with_reply(
            "Scope 1",
            r#"{"value": "1", "unit": "tCO2e", "year": 2023, "source_quote": "q"}"#,
        );
        let err = extract_records(
            Arc::new(llm),
            &catalogue(),
            vec![candidate("Scope 1")],
            &fast_config(),
            slots(),
            None,
            &cancel,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled));
    }
}
