//! Passage locator: finds indicator-bearing paragraphs in page text.
//!
//! Combines keyword hits, unit regex presence, year occurrences and a
//! token-set fuzzy score into a single ranking, returning the top-K
//! candidates per indicator.

use std::sync::OnceLock;

use chrono::Datelike;
use regex::Regex;

use crate::catalogue::IndicatorDef;
use crate::text::Page;

/// Earliest year a CSR report can plausibly cover.
pub const MIN_YEAR: i32 = 1990;

/// A paragraph believed to mention one indicator's value.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CandidatePassage {
    pub indicator: String,
    pub page_index: u32,
    /// Byte offset of the paragraph within its page's text.
    pub start_offset: usize,
    pub text: String,
    /// 0 marks the fallback passage emitted when nothing qualified.
    pub score: u32,
}

/// Locator bounds.
#[derive(Debug, Clone)]
pub struct LocateConfig {
    /// Candidates returned per indicator (K).
    pub max_candidates: usize,
    /// Character window around the best partial match when nothing
    /// qualifies outright.
    pub fallback_window: usize,
}

impl Default for LocateConfig {
    fn default() -> Self {
        Self {
            max_candidates: 5,
            fallback_window: 2000,
        }
    }
}

fn year_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b(19|20)\d{2}\b").unwrap())
}

/// Upper bound for a plausible reporting year.
pub fn max_year() -> i32 {
    chrono::Utc::now().year() + 1
}

/// Count distinct in-range four-digit years in a paragraph.
pub fn distinct_years(text: &str) -> Vec<i32> {
    let max = max_year();
    let mut years: Vec<i32> = year_re()
        .find_iter(text)
        .filter_map(|m| m.as_str().parse().ok())
        .filter(|y| (MIN_YEAR..=max).contains(y))
        .collect();
    years.sort_unstable();
    years.dedup();
    years
}

/// All in-range years in order of appearance (with repeats), for mode
/// computation by the verifier.
pub fn year_occurrences(text: &str) -> Vec<i32> {
    let max = max_year();
    year_re()
        .find_iter(text)
        .filter_map(|m| m.as_str().parse().ok())
        .filter(|y| (MIN_YEAR..=max).contains(y))
        .collect()
}

/// Token-set fuzzy similarity between two strings, 0-100.
///
/// Tokens are lowercased, deduplicated and sorted before comparison so
/// word order and repetition do not matter.
pub fn token_set_ratio(a: &str, b: &str) -> u32 {
    let key = |s: &str| {
        let mut tokens: Vec<String> = s
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(str::to_lowercase)
            .collect();
        tokens.sort_unstable();
        tokens.dedup();
        tokens.join(" ")
    };
    let (ka, kb) = (key(a), key(b));
    if ka.is_empty() || kb.is_empty() {
        return 0;
    }
    (strsim::normalized_levenshtein(&ka, &kb) * 100.0).round() as u32
}

/// Best fuzzy score of the indicator name against any sliding 6-token
/// window of the paragraph.
fn window_fuzzy_score(name: &str, paragraph: &str) -> u32 {
    const WINDOW: usize = 6;
    let tokens: Vec<&str> = paragraph.split_whitespace().collect();
    if tokens.is_empty() {
        return 0;
    }
    if tokens.len() <= WINDOW {
        return token_set_ratio(name, paragraph);
    }
    let mut best = 0;
    for window in tokens.windows(WINDOW) {
        best = best.max(token_set_ratio(name, &window.join(" ")));
        if best == 100 {
            break;
        }
    }
    best
}

struct ScoredParagraph {
    page_index: u32,
    start_offset: usize,
    text: String,
    keyword_hits: usize,
    unit_hit: bool,
    year_hits: usize,
    fuzzy: u32,
}

impl ScoredParagraph {
    fn qualifies(&self, def: &IndicatorDef) -> bool {
        self.keyword_hits >= def.min_keyword_hits
            && self.unit_hit
            && (!def.require_multiyear || self.year_hits >= 2)
    }

    fn score(&self) -> u32 {
        let unit = if self.unit_hit { 100 } else { 0 };
        unit + 10 * self.keyword_hits as u32 + self.fuzzy + 5 * self.year_hits.min(3) as u32
    }

    /// Partial relevance used to pick the fallback window.
    fn partial_score(&self) -> u32 {
        10 * self.keyword_hits as u32 + self.fuzzy
    }
}

/// Locate candidate passages for one indicator, ranked by descending score.
pub fn locate(pages: &[Page], def: &IndicatorDef, cfg: &LocateConfig) -> Vec<CandidatePassage> {
    let mut scored = Vec::new();

    for page in pages {
        let mut offset = 0;
        for paragraph in page.text.split('\n') {
            let start_offset = offset;
            offset += paragraph.len() + 1;
            if paragraph.trim().is_empty() {
                continue;
            }

            let keyword_hits = def
                .keyword_res
                .iter()
                .filter(|re| re.is_match(paragraph))
                .count();
            scored.push(ScoredParagraph {
                page_index: page.index,
                start_offset,
                text: paragraph.to_string(),
                keyword_hits,
                unit_hit: def.unit_re.is_match(paragraph),
                year_hits: distinct_years(paragraph).len(),
                fuzzy: window_fuzzy_score(&def.name, paragraph),
            });
        }
    }

    let mut candidates: Vec<&ScoredParagraph> =
        scored.iter().filter(|p| p.qualifies(def)).collect();

    if candidates.is_empty() {
        return vec![fallback_passage(&scored, def, cfg)];
    }

    // stable tie-break: (page_index, start_offset) order survives the
    // sort for equal scores
    candidates.sort_by(|a, b| {
        b.score()
            .cmp(&a.score())
            .then(a.page_index.cmp(&b.page_index))
            .then(a.start_offset.cmp(&b.start_offset))
    });

    let mut out: Vec<CandidatePassage> = Vec::new();
    for p in candidates {
        if out.iter().any(|c| c.text == p.text) {
            continue;
        }
        out.push(CandidatePassage {
            indicator: def.name.clone(),
            page_index: p.page_index,
            start_offset: p.start_offset,
            text: p.text.clone(),
            score: p.score(),
        });
        if out.len() == cfg.max_candidates {
            break;
        }
    }
    out
}

/// When nothing qualifies, hand the LLM a bounded window around the most
/// promising partial match so it still receives context. Flagged with
/// `score = 0`.
fn fallback_passage(
    scored: &[ScoredParagraph],
    def: &IndicatorDef,
    cfg: &LocateConfig,
) -> CandidatePassage {
    let best = scored
        .iter()
        .max_by_key(|p| p.partial_score())
        .filter(|p| p.partial_score() > 0);

    match best {
        Some(p) => {
            let mut text = p.text.clone();
            text.truncate(truncation_boundary(&text, cfg.fallback_window));
            CandidatePassage {
                indicator: def.name.clone(),
                page_index: p.page_index,
                start_offset: p.start_offset,
                text,
                score: 0,
            }
        }
        None => {
            // no signal anywhere: first page, bounded
            let (page_index, text) = scored
                .first()
                .map(|p| (p.page_index, p.text.clone()))
                .unwrap_or((1, String::new()));
            let mut text = text;
            text.truncate(truncation_boundary(&text, cfg.fallback_window));
            CandidatePassage {
                indicator: def.name.clone(),
                page_index,
                start_offset: 0,
                text,
                score: 0,
            }
        }
    }
}

/// Largest char boundary not exceeding `limit`.
fn truncation_boundary(text: &str, limit: usize) -> usize {
    if text.len() <= limit {
        return text.len();
    }
    let mut end = limit;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    end
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalogue::Catalogue;
    use crate::text::ExtractedDoc;

    fn scope1_def() -> crate::catalogue::IndicatorDef {
        let toml = r#"
[[groups]]
group_name = "Emissions"
[[groups.indicators]]
name = "Scope 1 Emissions"
unit = "tCO2e"
keywords = ["Scope 1"]
unit_pattern = "tCO2e|metric tons"
"#;
        Catalogue::from_toml(toml)
            .unwrap()
            .indicator("Scope 1 Emissions")
            .unwrap()
            .clone()
    }

    fn pages(texts: &[&str]) -> Vec<Page> {
        ExtractedDoc::from_pages(
            texts
                .iter()
                .enumerate()
                .map(|(i, t)| (i as u32 + 1, t.to_string())),
        )
        .pages
    }

    #[test]
    fn finds_matching_paragraph() {
        let pages = pages(&[
            "Our people are our greatest asset.",
            "Scope 1 Emissions in 2023 totaled 32,400 metric tons CO2e.",
        ]);
        let found = locate(&pages, &scope1_def(), &LocateConfig::default());
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].page_index, 2);
        assert!(found[0].score >= 100, "score {}", found[0].score);
    }

    #[test]
    fn returns_at_most_k_with_non_increasing_scores() {
        let texts: Vec<String> = (0..8)
            .map(|i| format!("Scope 1 Emissions in 202{} were 1,00{} tCO2e.", i % 4, i))
            .collect();
        let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
        let pages = pages(&refs);
        let cfg = LocateConfig::default();
        let found = locate(&pages, &scope1_def(), &cfg);
        assert_eq!(found.len(), cfg.max_candidates);
        for pair in found.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
    }

    #[test]
    fn dedupes_identical_spans() {
        let text = "Scope 1 Emissions in 2023 totaled 32,400 tCO2e.";
        let pages = pages(&[text, text]);
        let found = locate(&pages, &scope1_def(), &LocateConfig::default());
        assert_eq!(found.len(), 1);
    }

    #[test]
    fn multiyear_requirement_filters_single_year_paragraphs() {
        let toml = r#"
[[groups]]
group_name = "Emissions"
[[groups.indicators]]
name = "Scope 2 Emissions"
unit = "tCO2e"
keywords = ["Scope 2"]
require_multiyear = true
"#;
        let cat = Catalogue::from_toml(toml).unwrap();
        let def = cat.indicator("Scope 2 Emissions").unwrap();

        let single = pages(&["Scope 2 Emissions in 2023: 9,000 tCO2e."]);
        let found = locate(&single, def, &LocateConfig::default());
        assert_eq!(found[0].score, 0); // fallback only

        let multi = pages(&["Scope 2 Emissions: 2021: 10,000 tCO2e; 2022: 12,500 tCO2e."]);
        let found = locate(&multi, def, &LocateConfig::default());
        assert!(found[0].score > 0);
    }

    #[test]
    fn fallback_targets_best_partial_match() {
        // keyword present but no unit anywhere
        let pages = pages(&[
            "Board composition and governance.",
            "Scope 1 performance improved substantially this year.",
        ]);
        let found = locate(&pages, &scope1_def(), &LocateConfig::default());
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].score, 0);
        assert_eq!(found[0].page_index, 2);
    }

    #[test]
    fn token_set_ratio_ignores_order_and_case() {
        assert_eq!(token_set_ratio("Scope 1 Emissions", "emissions SCOPE 1"), 100);
        assert!(token_set_ratio("Scope 1 Emissions", "water withdrawal") < 40);
    }

    #[test]
    fn distinct_years_respects_range() {
        let years = distinct_years("from 1985 through 2021 and 2022, and 2023 again 2023");
        assert_eq!(years, vec![2021, 2022, 2023]);
    }
}
