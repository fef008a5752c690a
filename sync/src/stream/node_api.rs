//! # Node HTTP Client
//!
//! Two small HTTP surfaces of the upstream node back the machine: the
//! version endpoint (fetched once at init for the reward-spend distance)
//! and the event-by-id endpoint (the missed-event probe). The probe is
//! advisory, so its failures are retried with exponential backoff and then
//! surfaced softly; the version fetch is load-bearing and fails hard.
//!
//! The trait exists so the machine can be driven by a fake in tests —
//! transport is the caller's problem, same as everywhere else in this crate.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::warn;

use super::StreamError;
use crate::config::{PROBE_BASE_DELAY, PROBE_MAX_ATTEMPTS, PROBE_MAX_DELAY, PROBE_PAGE_SIZE};

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Node metadata advertised by the version endpoint.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct VersionInfo {
    /// Network name the node is running on. Checked against settings when
    /// present.
    #[serde(default)]
    pub network: Option<String>,
    /// Blocks that must be found on top of a reward before it can be spent.
    #[serde(default)]
    pub reward_spend_min_blocks: Option<u64>,
}

/// The machine's view of the node's HTTP API.
#[async_trait]
pub trait NodeApiClient: Send + Sync + 'static {
    /// Fetches node metadata. Called once, from `INITIALIZING`.
    async fn version(&self) -> Result<VersionInfo, StreamError>;

    /// `true` if the upstream has events after `last_ack_event_id`. Used
    /// only for loss detection.
    async fn has_events_after(&self, last_ack_event_id: Option<u64>)
        -> Result<bool, StreamError>;
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct EventsPage {
    #[serde(default)]
    events: Vec<serde_json::Value>,
}

/// reqwest-backed [`NodeApiClient`].
pub struct HttpNodeClient {
    base_url: String,
    http: reqwest::Client,
}

impl HttpNodeClient {
    /// Builds a client for the node at `base_url` (scheme and host, no
    /// trailing slash required).
    pub fn new(base_url: &str) -> Result<Self, StreamError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    fn version_url(&self) -> String {
        format!("{}/v1a/version", self.base_url)
    }

    fn events_url(&self, last_ack_event_id: Option<u64>) -> String {
        match last_ack_event_id {
            Some(id) => format!(
                "{}/v1a/event?size={}&last_ack_event_id={}",
                self.base_url, PROBE_PAGE_SIZE, id
            ),
            None => format!("{}/v1a/event?size={}", self.base_url, PROBE_PAGE_SIZE),
        }
    }

    async fn fetch_events_once(&self, url: &str) -> Result<bool, StreamError> {
        let page: EventsPage = self
            .http
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(!page.events.is_empty())
    }
}

/// Delay before retry `attempt` (1-based): exponential from the base,
/// capped.
pub(crate) fn probe_delay(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    let delay = PROBE_BASE_DELAY.saturating_mul(1u32 << exp);
    delay.min(PROBE_MAX_DELAY)
}

#[async_trait]
impl NodeApiClient for HttpNodeClient {
    async fn version(&self) -> Result<VersionInfo, StreamError> {
        let info = self
            .http
            .get(self.version_url())
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(info)
    }

    async fn has_events_after(
        &self,
        last_ack_event_id: Option<u64>,
    ) -> Result<bool, StreamError> {
        let url = self.events_url(last_ack_event_id);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.fetch_events_once(&url).await {
                Ok(has_events) => return Ok(has_events),
                Err(error) if attempt >= PROBE_MAX_ATTEMPTS => return Err(error),
                Err(error) => {
                    let delay = probe_delay(attempt);
                    warn!(
                        attempt,
                        %error,
                        "missed-event probe failed, retrying in {delay:?}"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
