//! Optional external classifier that votes on the next move

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::models::{Candle, Signal};

/// Classifier output: expected direction of the next move
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClassifierVote {
    Down,
    Neutral,
    Up,
}

impl ClassifierVote {
    pub fn from_label(label: i64) -> Option<Self> {
        match label {
            -1 => Some(ClassifierVote::Down),
            0 => Some(ClassifierVote::Neutral),
            1 => Some(ClassifierVote::Up),
            _ => None,
        }
    }

    pub fn label(self) -> i64 {
        match self {
            ClassifierVote::Down => -1,
            ClassifierVote::Neutral => 0,
            ClassifierVote::Up => 1,
        }
    }

    /// Signal this vote agrees with
    pub fn as_signal(self) -> Signal {
        match self {
            ClassifierVote::Down => Signal::Short,
            ClassifierVote::Neutral => Signal::Flat,
            ClassifierVote::Up => Signal::Long,
        }
    }
}

/// How a vote combines with the indicator signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClassifierMode {
    /// Vote is logged but has no effect
    Ignore,
    /// An opposing vote cancels the signal
    #[default]
    Veto,
    /// The vote must agree with the signal
    Require,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClassifierConfig {
    #[serde(default)]
    pub mode: ClassifierMode,
    /// Scoring endpoint; no classifier is consulted when unset
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    5
}

impl ClassifierConfig {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.mode == ClassifierMode::Require && self.url.is_none() {
            return Err("classifier.mode = require needs classifier.url".to_string());
        }
        Ok(())
    }
}

/// Model input: the newest candle's OHLCV
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FeatureRow {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl From<&Candle> for FeatureRow {
    fn from(candle: &Candle) -> Self {
        Self {
            open: candle.open,
            high: candle.high,
            low: candle.low,
            close: candle.close,
            volume: candle.volume,
        }
    }
}

#[async_trait]
pub trait SignalClassifier: Send + Sync {
    async fn classify(&self, features: &FeatureRow) -> Result<ClassifierVote>;
}

#[derive(Debug, Deserialize)]
struct VoteResponse {
    vote: i64,
}

/// Classifier served over HTTP: POSTs the feature row as JSON and expects
/// `{"vote": -1 | 0 | 1}`
pub struct RemoteClassifier {
    url: String,
    client: reqwest::Client,
}

impl RemoteClassifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build classifier HTTP client")?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }

    pub fn from_config(config: &ClassifierConfig) -> Result<Option<Self>> {
        config
            .url
            .as_ref()
            .map(|url| Self::new(url.clone(), Duration::from_secs(config.timeout_secs)))
            .transpose()
    }
}

#[async_trait]
impl SignalClassifier for RemoteClassifier {
    async fn classify(&self, features: &FeatureRow) -> Result<ClassifierVote> {
        let response = self
            .client
            .post(&self.url)
            .json(features)
            .send()
            .await
            .context("Classifier request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Classifier returned {}: {}", status, body);
        }

        let body: VoteResponse = response
            .json()
            .await
            .context("Classifier response is not a vote")?;
        ClassifierVote::from_label(body.vote)
            .with_context(|| format!("Classifier vote {} out of range", body.vote))
    }
}
