//! External lookups the scorer depends on: the listed-security reference feed
//! and the optional natural-language classifier. Both are behind traits so the
//! scorer can be exercised without a network.

use crate::types::PipelineError;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Deserialize)]
pub struct Listing {
    pub symbol: String,
    pub exchange: String,
}

/// Is this symbol a listed security on a recognized exchange?
#[async_trait]
pub trait ReferenceData: Send + Sync {
    async fn is_listed(&self, symbol: &str) -> Result<Option<Listing>, PipelineError>;
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClassifierVerdict {
    pub confidence: f64,
    #[serde(default)]
    pub explanation: String,
}

/// Natural-language judgment: "is this symbol used as a stock in context?"
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, symbol: &str, samples: &[String]) -> Result<ClassifierVerdict, PipelineError>;
}

pub struct HttpReferenceData {
    client: Client,
    url: String,
    api_key: String,
}

impl HttpReferenceData {
    pub fn new(url: &str, api_key: &str, timeout: Duration) -> Self {
        Self {
            client: Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_else(|_| Client::new()),
            url: url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        }
    }
}

#[async_trait]
impl ReferenceData for HttpReferenceData {
    async fn is_listed(&self, symbol: &str) -> Result<Option<Listing>, PipelineError> {
        let response = self
            .client
            .get(format!("{}/v1/symbols/{}", self.url, symbol))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = response.error_for_status().map_err(|e| {
            warn!("[RefData] Lookup failed for {}: {}", symbol, e);
            e
        })?;
        let listing: Listing = response.json().await?;
        Ok(Some(listing))
    }
}

pub struct HttpClassifier {
    client: Client,
    url: String,
    api_key: String,
}

impl HttpClassifier {
    pub fn new(url: &str, api_key: &str, timeout: Duration) -> Self {
        Self {
            client: Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_else(|_| Client::new()),
            url: url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        }
    }
}

#[async_trait]
impl Classifier for HttpClassifier {
    async fn classify(&self, symbol: &str, samples: &[String]) -> Result<ClassifierVerdict, PipelineError> {
        let response = self
            .client
            .post(format!("{}/v1/classify", self.url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&serde_json::json!({
                "symbol": symbol,
                "samples": samples,
            }))
            .send()
            .await?
            .error_for_status()
            .map_err(|e| {
                warn!("[Classifier] Call failed for {}: {}", symbol, e);
                e
            })?;

        let verdict: ClassifierVerdict = response.json().await?;
        Ok(verdict)
    }
}
