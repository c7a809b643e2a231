//! In-memory storage implementations for testing and development.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::{PipelineError, Result};
use crate::traits::object_store::ObjectStore;
use crate::traits::warehouse::{
    IndicatorRow, IngestStats, LineageRecord, LineageStore, NewIndicatorRow, ReportRow, Warehouse,
};

/// In-memory warehouse.
///
/// Implements the same upsert and revision semantics as the PostgreSQL
/// backend. Not suitable for production as data is lost on restart.
#[derive(Default)]
pub struct MemoryWarehouse {
    reports: RwLock<Vec<ReportRow>>,
    indicators: RwLock<Vec<IndicatorRow>>,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total indicator rows across all reports.
    pub fn row_count(&self) -> usize {
        self.indicators.read().unwrap().len()
    }

    pub fn report_count(&self) -> usize {
        self.reports.read().unwrap().len()
    }
}

#[async_trait]
impl Warehouse for MemoryWarehouse {
    async fn upsert_report(&self, report: &ReportRow) -> Result<()> {
        let mut reports = self.reports.write().unwrap();
        match reports
            .iter_mut()
            .find(|r| r.company_id == report.company_id && r.report_year == report.report_year)
        {
            Some(existing) => *existing = report.clone(),
            None => reports.push(report.clone()),
        }
        Ok(())
    }

    async fn ingest_report(
        &self,
        company_id: &str,
        report_year: i32,
        rows: &[NewIndicatorRow],
    ) -> Result<IngestStats> {
        let mut indicators = self.indicators.write().unwrap();
        let mut stats = IngestStats::default();
        let now = Utc::now();

        for row in rows {
            match indicators.iter_mut().find(|r| {
                r.company_id == company_id
                    && r.report_year == report_year
                    && r.indicator_name == row.indicator_name
                    && r.year == row.year
            }) {
                Some(existing) => {
                    existing.value_numeric = row.value_numeric;
                    existing.unit_canonical = row.unit_canonical.clone();
                    existing.source_page = row.source_page;
                    existing.source_quote = row.source_quote.clone();
                    existing.confidence = row.confidence;
                    existing.revision += 1;
                    existing.updated_at = now;
                    stats.updated += 1;
                }
                None => {
                    indicators.push(IndicatorRow {
                        company_id: company_id.to_string(),
                        report_year,
                        indicator_name: row.indicator_name.clone(),
                        year: row.year,
                        value_numeric: row.value_numeric,
                        unit_canonical: row.unit_canonical.clone(),
                        source_page: row.source_page,
                        source_quote: row.source_quote.clone(),
                        confidence: row.confidence,
                        revision: 1,
                        updated_at: now,
                    });
                    stats.inserted += 1;
                }
            }
        }
        Ok(stats)
    }

    async fn fetch_indicators(
        &self,
        company_id: &str,
        report_year: i32,
    ) -> Result<Vec<IndicatorRow>> {
        let mut rows: Vec<IndicatorRow> = self
            .indicators
            .read()
            .unwrap()
            .iter()
            .filter(|r| r.company_id == company_id && r.report_year == report_year)
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            (a.indicator_name.as_str(), a.year).cmp(&(b.indicator_name.as_str(), b.year))
        });
        Ok(rows)
    }
}

/// In-memory append-only lineage store.
#[derive(Default)]
pub struct MemoryLineage {
    records: RwLock<Vec<LineageRecord>>,
}

impl MemoryLineage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<LineageRecord> {
        self.records.read().unwrap().clone()
    }

    pub fn record_count(&self) -> usize {
        self.records.read().unwrap().len()
    }
}

#[async_trait]
impl LineageStore for MemoryLineage {
    async fn append(&self, record: &LineageRecord) -> Result<()> {
        self.records.write().unwrap().push(record.clone());
        Ok(())
    }
}

/// In-memory object store keyed by `(bucket, key)`.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: RwLock<HashMap<(String, String), Vec<u8>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_object(
        self,
        bucket: impl Into<String>,
        key: impl Into<String>,
        bytes: Vec<u8>,
    ) -> Self {
        self.objects
            .write()
            .unwrap()
            .insert((bucket.into(), key.into()), bytes);
        self
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        self.objects
            .read()
            .unwrap()
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| {
                PipelineError::ObjectStore(format!("no such object: {bucket}/{key}").into())
            })
    }

    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self
            .objects
            .read()
            .unwrap()
            .keys()
            .filter(|(b, k)| b == bucket && k.starts_with(prefix))
            .map(|(_, k)| k.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(indicator: &str, year: i32, value: f64) -> NewIndicatorRow {
        NewIndicatorRow {
            indicator_name: indicator.to_string(),
            year,
            value_numeric: value,
            unit_canonical: "tCO2e".to_string(),
            source_page: 1,
            source_quote: "q".to_string(),
            confidence: 0.9,
        }
    }

    #[tokio::test]
    async fn ingest_inserts_then_updates_with_revision_bump() {
        let warehouse = MemoryWarehouse::new();

        let stats = warehouse
            .ingest_report("acme", 2024, &[row("Scope 1 Emissions", 2023, 100.0)])
            .await
            .unwrap();
        assert_eq!(stats, IngestStats { inserted: 1, updated: 0 });

        let stats = warehouse
            .ingest_report("acme", 2024, &[row("Scope 1 Emissions", 2023, 120.0)])
            .await
            .unwrap();
        assert_eq!(stats, IngestStats { inserted: 0, updated: 1 });

        let rows = warehouse.fetch_indicators("acme", 2024).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].value_numeric, 120.0);
        assert_eq!(rows[0].revision, 2);
    }

    #[tokio::test]
    async fn rows_are_keyed_per_year() {
        let warehouse = MemoryWarehouse::new();
        warehouse
            .ingest_report(
                "acme",
                2024,
                &[
                    row("Scope 1 Emissions", 2022, 90.0),
                    row("Scope 1 Emissions", 2023, 100.0),
                ],
            )
            .await
            .unwrap();
        assert_eq!(warehouse.row_count(), 2);
    }

    #[tokio::test]
    async fn object_store_lists_by_prefix() {
        let store = MemoryObjectStore::new()
            .with_object("reports", "2024/acme.pdf", vec![1])
            .with_object("reports", "2024/globex.pdf", vec![2])
            .with_object("reports", "2023/acme.pdf", vec![3]);

        let keys = store.list("reports", "2024/").await.unwrap();
        assert_eq!(keys, vec!["2024/acme.pdf", "2024/globex.pdf"]);
        assert!(store.get("reports", "2022/none.pdf").await.is_err());
    }
}
