//! Object store collaborator: where downloaded CSR PDFs live.
//!
//! Keys follow `<year>/<company>.pdf`, written by the downloader that
//! sits upstream of this pipeline.

use async_trait::async_trait;

use crate::error::{PipelineError, Result};

/// Read-only object store access.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch an object's bytes.
    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>>;

    /// List keys under a prefix.
    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>>;
}

/// Parsed `<year>/<company>.pdf` object key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportKey {
    pub report_year: i32,
    pub company: String,
}

impl ReportKey {
    /// Parse an object key of the form `2024/NVIDIA.pdf`.
    pub fn parse(key: &str) -> Result<Self> {
        let invalid = || PipelineError::InvalidReportKey {
            key: key.to_string(),
        };

        let (year_part, rest) = key.split_once('/').ok_or_else(invalid)?;
        let company = rest.strip_suffix(".pdf").ok_or_else(invalid)?;
        if company.is_empty() || company.contains('/') {
            return Err(invalid());
        }
        let report_year: i32 = year_part.parse().map_err(|_| invalid())?;
        if !(1990..=2100).contains(&report_year) {
            return Err(invalid());
        }

        Ok(Self {
            report_year,
            company: company.to_string(),
        })
    }

    /// Lowercased company identifier used as the warehouse key.
    pub fn company_id(&self) -> String {
        self.company.to_lowercase().replace([' ', '.'], "_")
    }

    /// Stable report identifier, e.g. `nvidia:2024`.
    pub fn report_id(&self) -> String {
        format!("{}:{}", self.company_id(), self.report_year)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_keys() {
        let key = ReportKey::parse("2024/NVIDIA.pdf").unwrap();
        assert_eq!(key.report_year, 2024);
        assert_eq!(key.company, "NVIDIA");
        assert_eq!(key.company_id(), "nvidia");
        assert_eq!(key.report_id(), "nvidia:2024");
    }

    #[test]
    fn rejects_malformed_keys() {
        for bad in ["NVIDIA.pdf", "2024/NVIDIA.txt", "20xx/NVIDIA.pdf", "2024/.pdf", "2024/a/b.pdf"] {
            assert!(ReportKey::parse(bad).is_err(), "{bad}");
        }
    }
}
