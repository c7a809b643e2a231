//! Indicator catalogue: groups of indicators with their match rules.
//!
//! The catalogue is loaded once at pipeline start, validated in full
//! (every malformed entry reported, not just the first), compiled into
//! regexes, and shared immutably across the run.

use std::fs;
use std::path::Path;

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::ConfigError;

/// How `FY23`-style shorthand maps onto calendar years.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FiscalYearMapping {
    /// `FY23` means calendar year 2023.
    #[default]
    Calendar,
    /// `FY23` means the fiscal year ending in 2023 (reported as 2022).
    Ending,
}

/// On-disk catalogue shape. Unknown keys are rejected.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CatalogueFile {
    #[serde(default)]
    fiscal_year_mapping: FiscalYearMapping,
    groups: Vec<GroupFile>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct GroupFile {
    group_name: String,
    indicators: Vec<IndicatorFile>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct IndicatorFile {
    #[serde(default)]
    name: String,
    #[serde(default)]
    unit: String,
    keywords: Option<Vec<String>>,
    unit_pattern: Option<String>,
    min_keyword_hits: Option<usize>,
    require_multiyear: Option<bool>,
    /// Closed vocabulary of canonical units accepted for this indicator.
    unit_vocabulary: Option<Vec<String>>,
    /// Surface spellings mapped onto vocabulary entries, e.g.
    /// `"metric tons CO2e" = "tCO2e"`.
    aliases: Option<indexmap::IndexMap<String, String>>,
}

/// A compiled indicator definition, immutable for the run.
#[derive(Debug, Clone)]
pub struct IndicatorDef {
    pub group: String,
    pub name: String,
    pub unit: String,
    pub keywords: Vec<String>,
    pub keyword_res: Vec<Regex>,
    pub unit_re: Regex,
    pub min_keyword_hits: usize,
    pub require_multiyear: bool,
    pub unit_vocabulary: Vec<String>,
    pub aliases: Vec<(String, String)>,
}

impl IndicatorDef {
    /// True when `unit` (after trimming) is one of the canonical units.
    pub fn vocabulary_contains(&self, unit: &str) -> bool {
        let needle = normalize_unit(unit);
        self.unit_vocabulary
            .iter()
            .any(|u| normalize_unit(u) == needle)
    }

    /// Resolve a surface unit spelling to its canonical form, if known.
    pub fn canonical_unit(&self, raw: &str) -> Option<String> {
        let needle = normalize_unit(raw);
        if let Some(canon) = self
            .unit_vocabulary
            .iter()
            .find(|u| normalize_unit(u) == needle)
        {
            return Some(canon.clone());
        }
        self.aliases
            .iter()
            .find(|(alias, _)| normalize_unit(alias) == needle)
            .map(|(_, canon)| canon.clone())
    }
}

/// Case/spacing-insensitive comparison key for unit spellings.
fn normalize_unit(unit: &str) -> String {
    unit.chars()
        .filter(|c| !c.is_whitespace() && *c != '_' && *c != '-')
        .flat_map(|c| c.to_lowercase())
        .collect()
}

/// A group of indicators (e.g. "Emissions").
#[derive(Debug, Clone)]
pub struct GroupDef {
    pub group_name: String,
    pub indicators: Vec<IndicatorDef>,
}

/// The loaded, validated catalogue.
#[derive(Debug, Clone)]
pub struct Catalogue {
    pub fiscal_year_mapping: FiscalYearMapping,
    pub groups: Vec<GroupDef>,
    /// SHA-256 of the source document; recorded in lineage.
    pub hash: String,
}

impl Catalogue {
    /// Load and validate a catalogue from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|e| {
            ConfigError::single(format!("cannot read catalogue {}: {e}", path.display()))
        })?;
        Self::from_toml(&raw)
    }

    /// Parse and validate a catalogue from TOML text.
    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        let file: CatalogueFile = toml::from_str(raw)
            .map_err(|e| ConfigError::single(format!("catalogue parse error: {e}")))?;

        let mut issues = Vec::new();
        let mut groups = Vec::new();

        for group in &file.groups {
            if group.group_name.trim().is_empty() {
                issues.push("group with empty group_name".to_string());
            }
            let mut indicators = Vec::new();
            for ind in &group.indicators {
                match compile_indicator(&group.group_name, ind) {
                    Ok(def) => indicators.push(def),
                    Err(mut errs) => issues.append(&mut errs),
                }
            }
            groups.push(GroupDef {
                group_name: group.group_name.clone(),
                indicators,
            });
        }

        if groups.is_empty() {
            issues.push("catalogue has no groups".to_string());
        }

        if !issues.is_empty() {
            return Err(ConfigError::new(issues));
        }

        let mut hasher = Sha256::new();
        hasher.update(raw.as_bytes());

        Ok(Self {
            fiscal_year_mapping: file.fiscal_year_mapping,
            groups,
            hash: format!("{:x}", hasher.finalize()),
        })
    }

    /// Iterate all indicators across groups in catalogue order.
    pub fn indicators(&self) -> impl Iterator<Item = &IndicatorDef> {
        self.groups.iter().flat_map(|g| g.indicators.iter())
    }

    /// Look up an indicator by name.
    pub fn indicator(&self, name: &str) -> Option<&IndicatorDef> {
        self.indicators().find(|i| i.name == name)
    }

    /// Map a two-digit fiscal-year shorthand (`FY23`) to a calendar year.
    pub fn resolve_fiscal_year(&self, fy: u32) -> i32 {
        let year = 2000 + fy as i32;
        match self.fiscal_year_mapping {
            FiscalYearMapping::Calendar => year,
            FiscalYearMapping::Ending => year - 1,
        }
    }
}

fn compile_indicator(group: &str, ind: &IndicatorFile) -> Result<IndicatorDef, Vec<String>> {
    let mut issues = Vec::new();
    let label = if ind.name.trim().is_empty() {
        format!("{group}/<unnamed>")
    } else {
        format!("{group}/{}", ind.name)
    };

    if ind.name.trim().is_empty() {
        issues.push(format!("{label}: missing name"));
    }
    if ind.unit.trim().is_empty() {
        issues.push(format!("{label}: missing unit"));
    }

    let keywords = match &ind.keywords {
        Some(ks) if ks.iter().all(|k| !k.trim().is_empty()) => ks.clone(),
        Some(_) => {
            issues.push(format!("{label}: empty keyword"));
            Vec::new()
        }
        None => ind.name.split_whitespace().map(str::to_string).collect(),
    };

    let mut keyword_res = Vec::new();
    for keyword in &keywords {
        match word_boundary_regex(keyword) {
            Ok(re) => keyword_res.push(re),
            Err(e) => issues.push(format!("{label}: bad keyword {keyword:?}: {e}")),
        }
    }

    let unit_pattern = ind
        .unit_pattern
        .clone()
        .unwrap_or_else(|| regex::escape(&ind.unit));
    let unit_re = RegexBuilder::new(&unit_pattern)
        .case_insensitive(true)
        .build();
    let unit_re = match unit_re {
        Ok(re) => Some(re),
        Err(e) => {
            issues.push(format!("{label}: bad unit_pattern: {e}"));
            None
        }
    };

    let min_keyword_hits = ind.min_keyword_hits.unwrap_or(1);
    if min_keyword_hits == 0 {
        issues.push(format!("{label}: min_keyword_hits must be >= 1"));
    }

    let unit_vocabulary = ind
        .unit_vocabulary
        .clone()
        .unwrap_or_else(|| vec![ind.unit.clone()]);
    if unit_vocabulary.iter().any(|u| u.trim().is_empty()) {
        issues.push(format!("{label}: empty entry in unit_vocabulary"));
    }

    let aliases: Vec<(String, String)> = ind
        .aliases
        .as_ref()
        .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        .unwrap_or_default();
    for (alias, canon) in &aliases {
        if !unit_vocabulary
            .iter()
            .any(|u| normalize_unit(u) == normalize_unit(canon))
        {
            issues.push(format!(
                "{label}: alias {alias:?} maps to {canon:?} which is not in unit_vocabulary"
            ));
        }
    }

    if !issues.is_empty() {
        return Err(issues);
    }

    Ok(IndicatorDef {
        group: group.to_string(),
        name: ind.name.clone(),
        unit: ind.unit.clone(),
        keywords,
        keyword_res,
        unit_re: unit_re.expect("validated above"),
        min_keyword_hits,
        require_multiyear: ind.require_multiyear.unwrap_or(false),
        unit_vocabulary,
        aliases,
    })
}

/// Compile one keyword into a case-insensitive, word-bounded regex.
fn word_boundary_regex(keyword: &str) -> Result<Regex, regex::Error> {
    RegexBuilder::new(&format!(r"\b{}\b", regex::escape(keyword)))
        .case_insensitive(true)
        .build()
}
