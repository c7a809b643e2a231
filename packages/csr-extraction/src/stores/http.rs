//! HTTP object store gateway.
//!
//! Speaks to the downloader's object store over its plain HTTP surface:
//! `GET {base}/{bucket}/{key}` for bytes, `GET {base}/{bucket}?prefix=`
//! for a JSON array of keys.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use crate::error::{ConfigError, PipelineError, Result};
use crate::traits::object_store::ObjectStore;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

pub struct HttpObjectStore {
    base_url: String,
    client: Client,
}

impl HttpObjectStore {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| PipelineError::ObjectStore(Box::new(e)))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    /// Build from `OBJECT_STORE_URL`.
    pub fn from_env() -> Result<Self> {
        let base_url = std::env::var("OBJECT_STORE_URL")
            .map_err(|_| ConfigError::single("OBJECT_STORE_URL is not set"))?;
        Self::new(base_url)
    }

    fn object_url(&self, bucket: &str, key: &str) -> String {
        format!("{}/{bucket}/{key}", self.base_url)
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        let url = self.object_url(bucket, key);
        debug!(%url, "fetching object");
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| PipelineError::ObjectStore(Box::new(e)))?;

        if !response.status().is_success() {
            return Err(PipelineError::ObjectStore(
                format!("GET {url} returned {}", response.status()).into(),
            ));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| PipelineError::ObjectStore(Box::new(e)))?;
        Ok(bytes.to_vec())
    }

    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        let url = format!("{}/{bucket}", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[("prefix", prefix)])
            .send()
            .await
            .map_err(|e| PipelineError::ObjectStore(Box::new(e)))?;

        if !response.status().is_success() {
            return Err(PipelineError::ObjectStore(
                format!("GET {url} returned {}", response.status()).into(),
            ));
        }
        let keys: Vec<String> = response
            .json()
            .await
            .map_err(|e| PipelineError::ObjectStore(Box::new(e)))?;
        Ok(keys)
    }
}
