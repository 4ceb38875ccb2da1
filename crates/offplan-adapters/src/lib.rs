//! Estaty listings API client, wire decoding and fallback merge.

pub mod decode;
pub mod merge;
pub mod retry;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use offplan_core::{ListingId, ListingPage, Lookup, ReferenceData};
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::StatusCode;
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, debug_span, warn, Instrument};

pub use decode::{decode_listing, decode_reference_data, decode_summary, RecordError};
pub use merge::{merge_fields, merge_records, merge_units, record_id};
pub use retry::{BackoffPolicy, RateLimit, RequestBudget};

use retry::{classify_reqwest_error, classify_status, RetryDisposition};

pub const CRATE_NAME: &str = "offplan-adapters";
pub const DEFAULT_BASE_URL: &str = "https://panel.estaty.app/api/v1";

/// Upstream record as received, before merge and decoding.
pub type RawRecord = serde_json::Map<String, JsonValue>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    ListPage,
    Detail,
    Search,
    Filters,
}

impl Endpoint {
    pub fn path(&self) -> &'static str {
        match self {
            Endpoint::ListPage => "getProperties",
            Endpoint::Detail => "getProperty",
            Endpoint::Search => "filter",
            Endpoint::Filters => "getFilters",
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path())
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("{endpoint} request failed after {attempts} attempt(s): {source}")]
    Transient {
        endpoint: Endpoint,
        attempts: usize,
        #[source]
        source: reqwest::Error,
    },
    #[error("{endpoint} returned http {status} after {attempts} attempt(s)")]
    Status {
        endpoint: Endpoint,
        status: u16,
        attempts: usize,
    },
    #[error("{endpoint} rejected the api key (http {status})")]
    Unauthorized { endpoint: Endpoint, status: u16 },
    #[error("{endpoint} response could not be decoded: {source}")]
    Decode {
        endpoint: Endpoint,
        #[source]
        source: serde_json::Error,
    },
}

impl FetchError {
    /// Errors no retry or later listing can recover from.
    pub fn is_fatal(&self) -> bool {
        matches!(self, FetchError::Unauthorized { .. })
    }

    pub fn endpoint(&self) -> Endpoint {
        match self {
            FetchError::Transient { endpoint, .. }
            | FetchError::Status { endpoint, .. }
            | FetchError::Unauthorized { endpoint, .. }
            | FetchError::Decode { endpoint, .. } => *endpoint,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub base_url: String,
    pub api_key: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    /// Upper bound on in-flight requests across all endpoints.
    pub concurrency: usize,
    pub backoff: BackoffPolicy,
    /// `None` sends as fast as `concurrency` allows.
    pub rate_limit: Option<RateLimit>,
}

impl ApiConfig {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            timeout: Duration::from_secs(20),
            user_agent: None,
            concurrency: 8,
            backoff: BackoffPolicy::default(),
            rate_limit: None,
        }
    }
}

/// Read-only view of the upstream catalog.
#[async_trait]
pub trait ListingSource: Send + Sync {
    async fn list_page(&self, page: u32) -> Result<ListingPage, FetchError>;

    async fn get_detail(&self, id: ListingId) -> Result<Lookup<RawRecord>, FetchError>;

    async fn search_by_name(&self, name: &str) -> Result<Lookup<RawRecord>, FetchError>;

    async fn get_reference_data(&self) -> Result<ReferenceData, FetchError>;
}

#[async_trait]
impl<T: ListingSource + ?Sized> ListingSource for Arc<T> {
    async fn list_page(&self, page: u32) -> Result<ListingPage, FetchError> {
        (**self).list_page(page).await
    }

    async fn get_detail(&self, id: ListingId) -> Result<Lookup<RawRecord>, FetchError> {
        (**self).get_detail(id).await
    }

    async fn search_by_name(&self, name: &str) -> Result<Lookup<RawRecord>, FetchError> {
        (**self).search_by_name(name).await
    }

    async fn get_reference_data(&self) -> Result<ReferenceData, FetchError> {
        (**self).get_reference_data().await
    }
}

#[derive(Debug)]
pub struct EstatyClient {
    client: reqwest::Client,
    base_url: String,
    limit: Arc<Semaphore>,
    budget: Option<RequestBudget>,
    backoff: BackoffPolicy,
}

impl EstatyClient {
    pub fn new(config: ApiConfig) -> anyhow::Result<Self> {
        let mut key = HeaderValue::from_str(&config.api_key)
            .context("api key is not a valid header value")?;
        key.set_sensitive(true);
        let mut headers = HeaderMap::new();
        headers.insert("App-key", key);

        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .default_headers(headers);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let budget = config.rate_limit.map(RequestBudget::new);

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            limit: Arc::new(Semaphore::new(config.concurrency.max(1))),
            budget,
            backoff: config.backoff,
        })
    }

    async fn post_json(
        &self,
        endpoint: Endpoint,
        query: &[(&str, String)],
        body: &JsonValue,
    ) -> Result<JsonValue, FetchError> {
        // The semaphore is never closed; a failed acquire just runs unthrottled.
        let _permit = self.limit.acquire().await.ok();
        if let Some(budget) = &self.budget {
            budget.acquire().await;
        }

        let url = format!("{}/{}", self.base_url, endpoint.path());
        let span = debug_span!("estaty_request", %endpoint, ?query);
        let max_attempts = self.backoff.max_attempts();

        async move {
            let mut attempt = 0usize;
            loop {
                attempt += 1;
                let result = self
                    .client
                    .post(&url)
                    .query(query)
                    .json(body)
                    .send()
                    .await;

                let err = match result {
                    Ok(resp) => {
                        let status = resp.status();
                        if status.is_success() {
                            let bytes = resp.bytes().await.map_err(|source| FetchError::Transient {
                                endpoint,
                                attempts: attempt,
                                source,
                            })?;
                            debug!(attempt, bytes = bytes.len(), "response received");
                            return serde_json::from_slice(&bytes)
                                .map_err(|source| FetchError::Decode { endpoint, source });
                        }
                        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                            return Err(FetchError::Unauthorized {
                                endpoint,
                                status: status.as_u16(),
                            });
                        }
                        if classify_status(status) == RetryDisposition::NonRetryable
                            || attempt >= max_attempts
                        {
                            return Err(FetchError::Status {
                                endpoint,
                                status: status.as_u16(),
                                attempts: attempt,
                            });
                        }
                        format!("http {status}")
                    }
                    Err(source) => {
                        if classify_reqwest_error(&source) == RetryDisposition::NonRetryable
                            || attempt >= max_attempts
                        {
                            return Err(FetchError::Transient {
                                endpoint,
                                attempts: attempt,
                                source,
                            });
                        }
                        source.to_string()
                    }
                };

                let delay = self.backoff.delay_for_attempt(attempt - 1);
                warn!(attempt, error = %err, delay_ms = delay.as_millis() as u64, "retrying upstream request");
                tokio::time::sleep(delay).await;
            }
        }
        .instrument(span)
        .await
    }
}

fn shape_error(message: &str) -> serde_json::Error {
    <serde_json::Error as serde::de::Error>::custom(message)
}

#[async_trait]
impl ListingSource for EstatyClient {
    async fn list_page(&self, page: u32) -> Result<ListingPage, FetchError> {
        let body = self
            .post_json(Endpoint::ListPage, &[("page", page.to_string())], &json!({}))
            .await?;
        parse_listing_page(page, &body).map_err(|source| FetchError::Decode {
            endpoint: Endpoint::ListPage,
            source,
        })
    }

    async fn get_detail(&self, id: ListingId) -> Result<Lookup<RawRecord>, FetchError> {
        let body = match self
            .post_json(Endpoint::Detail, &[], &json!({ "id": id }))
            .await
        {
            Ok(body) => body,
            Err(FetchError::Status { status: 404, .. }) => return Ok(Lookup::NotFound),
            Err(err) => return Err(err),
        };
        Ok(body
            .get("property")
            .and_then(JsonValue::as_object)
            .cloned()
            .into())
    }

    async fn search_by_name(&self, name: &str) -> Result<Lookup<RawRecord>, FetchError> {
        let body = self
            .post_json(Endpoint::Search, &[], &json!({ "property_name": name }))
            .await?;
        let results = match body.get("properties") {
            Some(JsonValue::Array(items)) => items.as_slice(),
            Some(JsonValue::Object(page)) => page
                .get("data")
                .and_then(JsonValue::as_array)
                .map(Vec::as_slice)
                .unwrap_or_default(),
            _ => &[][..],
        };
        Ok(results
            .iter()
            .find_map(JsonValue::as_object)
            .cloned()
            .into())
    }

    async fn get_reference_data(&self) -> Result<ReferenceData, FetchError> {
        let body = self
            .post_json(Endpoint::Filters, &[], &json!({}))
            .await?;
        let filters = match body.get("data") {
            Some(data @ JsonValue::Object(_)) => data,
            _ => &body,
        };
        if !filters.is_object() {
            return Err(FetchError::Decode {
                endpoint: Endpoint::Filters,
                source: shape_error("filters response is not an object"),
            });
        }
        Ok(decode_reference_data(filters))
    }
}

/// `{"properties": {"data": [...], "next_page_url": ...}}`.
pub fn parse_listing_page(page: u32, body: &JsonValue) -> Result<ListingPage, serde_json::Error> {
    let envelope = body
        .get("properties")
        .and_then(JsonValue::as_object)
        .ok_or_else(|| shape_error("missing `properties` object"))?;
    let items = envelope
        .get("data")
        .and_then(JsonValue::as_array)
        .ok_or_else(|| shape_error("missing `properties.data` array"))?;

    let summaries: Vec<_> = items
        .iter()
        .filter_map(|item| match decode_summary(item) {
            Ok(summary) => Some(summary),
            Err(err) => {
                warn!(page, error = %err, "skipping malformed listing summary");
                None
            }
        })
        .collect();

    let has_next = !items.is_empty()
        && match envelope.get("next_page_url") {
            Some(JsonValue::String(next)) => !next.is_empty(),
            Some(JsonValue::Null) => false,
            _ => true,
        };

    Ok(ListingPage {
        page,
        summaries,
        has_next,
    })
}
