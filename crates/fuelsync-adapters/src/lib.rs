//! Upstream fuel price feed contract + the Service NSW FuelCheck client.
//!
//! This crate is the network boundary only: it authenticates, builds requests,
//! maps HTTP failures and decodes JSON. It never touches the relational store.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fuelsync_core::{format_feed_timestamp, FlexString, PriceSnapshot, ReferenceData};
use reqwest::header::CONTENT_TYPE;
use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "fuelsync-adapters";

pub const TOKEN_PATH: &str = "/oauth/client_credential/accesstoken";
pub const REFERENCE_PATH: &str = "/FuelCheckRefData/v2/fuel/lovs";
pub const ALL_PRICES_PATH: &str = "/FuelPriceCheck/v2/fuel/prices";
pub const NEW_PRICES_PATH: &str = "/FuelPriceCheck/v2/fuel/prices/new";

const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(30);
const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(10 * 60);
const MAX_ERROR_BODY_BYTES: usize = 2048;

#[derive(Debug, Error)]
pub enum FeedError {
    /// Conditional request answered with 304; the caller treats this as success.
    #[error("upstream reports no changes (not modified)")]
    NotModified,
    #[error("upstream request failed: status={status} body={body}")]
    Status { status: u16, body: String },
    #[error("upstream token request failed: status={status} body={body}")]
    TokenStatus { status: u16, body: String },
    #[error("upstream token response missing access_token")]
    MissingToken,
    #[error("upstream transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("failed to decode upstream response: {0}")]
    Decode(String),
    #[error("invalid upstream URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
}

impl FeedError {
    pub fn is_not_modified(&self) -> bool {
        matches!(self, Self::NotModified)
    }
}

/// The three upstream reads the sync orchestrator sequences.
#[async_trait]
pub trait PriceFeed: Send + Sync {
    /// Fuel type taxonomy, conditional on `if_modified_since`.
    async fn reference_data(
        &self,
        if_modified_since: DateTime<Utc>,
    ) -> Result<ReferenceData, FeedError>;

    async fn all_current_prices(&self) -> Result<PriceSnapshot, FeedError>;

    async fn new_current_prices(&self) -> Result<PriceSnapshot, FeedError>;
}

#[derive(Debug, Clone)]
pub struct ServiceNswConfig {
    pub base_url: String,
    pub api_key: String,
    pub api_secret: String,
    /// Pipe-delimited state filter, e.g. `NSW|TAS`. Empty means no filter.
    pub states: String,
    pub timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: String,
    #[serde(default)]
    expires_in: FlexString,
}

#[derive(Debug, Clone)]
struct AccessToken {
    value: String,
    expires_at: Instant,
}

impl AccessToken {
    fn is_fresh(&self, now: Instant) -> bool {
        now + TOKEN_REFRESH_MARGIN < self.expires_at
    }
}

/// OAuth client-credentials client for the FuelCheck v2 API.
#[derive(Debug)]
pub struct ServiceNswClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    api_secret: String,
    states: String,
    token: Mutex<Option<AccessToken>>,
}

impl ServiceNswClient {
    pub fn new(config: ServiceNswConfig) -> Result<Self, FeedError> {
        let http = reqwest::Client::builder()
            .gzip(true)
            .timeout(config.timeout)
            .build()?;
        Ok(Self {
            http,
            base_url: config.base_url.trim().trim_end_matches('/').to_string(),
            api_key: config.api_key,
            api_secret: config.api_secret,
            states: config.states.trim().to_string(),
            token: Mutex::new(None),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> Result<Url, FeedError> {
        let raw = format!("{}{}", self.base_url, path);
        Url::parse(&raw).map_err(|err| FeedError::InvalidUrl {
            url: raw,
            reason: err.to_string(),
        })
    }

    /// Cached bearer token, refreshed when it expires within 30 seconds.
    pub async fn access_token(&self) -> Result<String, FeedError> {
        if let Some(token) = self.cached_token().await {
            return Ok(token);
        }

        // Held across the exchange so concurrent callers wait for one refresh.
        let mut guard = self.token.lock().await;
        if let Some(token) = guard.as_ref().filter(|t| t.is_fresh(Instant::now())) {
            return Ok(token.value.clone());
        }

        let token = self.request_token().await?;
        let value = token.value.clone();
        *guard = Some(token);
        Ok(value)
    }

    async fn cached_token(&self) -> Option<String> {
        let guard = self.token.lock().await;
        guard
            .as_ref()
            .filter(|t| t.is_fresh(Instant::now()))
            .map(|t| t.value.clone())
    }

    async fn request_token(&self) -> Result<AccessToken, FeedError> {
        let mut url = self.endpoint(TOKEN_PATH)?;
        url.query_pairs_mut()
            .append_pair("grant_type", "client_credentials");

        let response = self
            .http
            .get(url)
            .basic_auth(&self.api_key, Some(&self.api_secret))
            .send()
            .await?;
        let status = response.status();
        let body = response.bytes().await?;
        if !status.is_success() {
            return Err(FeedError::TokenStatus {
                status: status.as_u16(),
                body: truncate_body(&body),
            });
        }

        let parsed: TokenResponse = serde_json::from_slice(&body)
            .map_err(|err| FeedError::Decode(format!("token response: {err}")))?;
        if parsed.access_token.trim().is_empty() {
            return Err(FeedError::MissingToken);
        }
        let ttl = parse_expires_in(parsed.expires_in.as_str());
        let now = Instant::now();
        let expires_at = now
            .checked_add(ttl)
            .unwrap_or_else(|| now + DEFAULT_TOKEN_TTL);
        debug!(ttl_secs = ttl.as_secs(), "fetched upstream access token");
        Ok(AccessToken {
            value: parsed.access_token,
            expires_at,
        })
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        if_modified_since: Option<DateTime<Utc>>,
    ) -> Result<T, FeedError> {
        let transaction_id = Uuid::new_v4();
        let span = info_span!("feed_request", path, %transaction_id);
        async move {
            let token = self.access_token().await?;
            let mut request = self
                .http
                .get(self.endpoint(path)?)
                .bearer_auth(token)
                .header(CONTENT_TYPE, "application/json; charset=utf-8")
                .header("apikey", &self.api_key)
                .header("transactionid", transaction_id.to_string())
                .header("requesttimestamp", format_feed_timestamp(Utc::now()));
            if let Some(since) = if_modified_since {
                request = request.header("if-modified-since", format_feed_timestamp(since));
            }
            if !self.states.is_empty() {
                request = request.query(&[("states", self.states.as_str())]);
            }

            let response = request.send().await?;
            let status = response.status();
            if status == StatusCode::NOT_MODIFIED {
                debug!("upstream not modified");
                return Err(FeedError::NotModified);
            }
            let body = response.bytes().await?;
            if !status.is_success() {
                return Err(FeedError::Status {
                    status: status.as_u16(),
                    body: truncate_body(&body),
                });
            }
            debug!(bytes = body.len(), "upstream response received");
            serde_json::from_slice(&body).map_err(|err| FeedError::Decode(err.to_string()))
        }
        .instrument(span)
        .await
    }
}

#[async_trait]
impl PriceFeed for ServiceNswClient {
    async fn reference_data(
        &self,
        if_modified_since: DateTime<Utc>,
    ) -> Result<ReferenceData, FeedError> {
        self.get_json(REFERENCE_PATH, Some(if_modified_since)).await
    }

    async fn all_current_prices(&self) -> Result<PriceSnapshot, FeedError> {
        self.get_json(ALL_PRICES_PATH, None).await
    }

    async fn new_current_prices(&self) -> Result<PriceSnapshot, FeedError> {
        self.get_json(NEW_PRICES_PATH, None).await
    }
}

/// Token lifetime from the upstream's string `expires_in`; anything unusable
/// or out of `Duration` range falls back to ten minutes.
fn parse_expires_in(raw: &str) -> Duration {
    match raw.trim().parse::<f64>() {
        Ok(secs) if secs > 0.0 => Duration::try_from_secs_f64(secs).unwrap_or(DEFAULT_TOKEN_TTL),
        _ => DEFAULT_TOKEN_TTL,
    }
}

fn truncate_body(body: &[u8]) -> String {
    let end = body.len().min(MAX_ERROR_BODY_BYTES);
    String::from_utf8_lossy(&body[..end]).trim().to_string()
}
