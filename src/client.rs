use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::config::Config;
use crate::model::{PageRequest, PageResponse, Partition, SchemaVersion};
use crate::retry::{Attempt, RetryError, RetryPolicy};

const USER_AGENT: &str = concat!("opensea-tap/", env!("CARGO_PKG_VERSION"));
const API_KEY_HEADER: &str = "X-API-KEY";

/// Terminal outcome of fetching one page. Anything that reaches the driver
/// fails the partition.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("unauthorized ({status}) for {url}")]
    Unauthorized { url: String, status: u16 },
    #[error("client error {status} for {url}: {body}")]
    Client {
        url: String,
        status: u16,
        body: String,
    },
    #[error("gave up on {url} after {attempts} attempts (last status {status:?}): {message}")]
    RetriesExhausted {
        url: String,
        status: Option<u16>,
        attempts: u32,
        message: String,
    },
    #[error("invalid JSON from {url}: {message}")]
    Decode { url: String, message: String },
    #[error("failed to build request: {0}")]
    Request(String),
}

impl FetchError {
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::Unauthorized { status, .. } | FetchError::Client { status, .. } => {
                Some(*status)
            }
            FetchError::RetriesExhausted { status, .. } => *status,
            FetchError::Decode { .. } | FetchError::Request(_) => None,
        }
    }

    pub fn url(&self) -> Option<&str> {
        match self {
            FetchError::Unauthorized { url, .. }
            | FetchError::Client { url, .. }
            | FetchError::RetriesExhausted { url, .. }
            | FetchError::Decode { url, .. } => Some(url),
            FetchError::Request(_) => None,
        }
    }
}

/// Where a partition's events live for a given payload generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub path: String,
    pub fixed_query: Vec<(String, String)>,
}

impl Endpoint {
    pub fn for_partition(version: SchemaVersion, partition: &Partition) -> Self {
        let event_type = ("event_type".to_string(), version.sale_event_type().to_string());
        match version {
            SchemaVersion::V2 => Self {
                path: format!("events/collection/{}", partition.collection_id),
                fixed_query: vec![event_type],
            },
            SchemaVersion::V1 => Self {
                path: "events".to_string(),
                fixed_query: vec![
                    ("collection_slug".to_string(), partition.collection_id.clone()),
                    event_type,
                ],
            },
        }
    }
}

/// Source of event pages. The driver only ever sees a decoded page or a
/// terminal failure; retries happen behind this trait.
#[async_trait]
pub trait EventSource: Send + Sync {
    async fn fetch_page(
        &self,
        endpoint: &Endpoint,
        request: &PageRequest,
    ) -> Result<PageResponse, FetchError>;
}

#[derive(Clone)]
pub struct MarketplaceClient {
    http: Client,
    base_url: Url,
    token: String,
    retry: RetryPolicy,
}

impl fmt::Debug for MarketplaceClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MarketplaceClient")
            .field("base_url", &self.base_url)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl MarketplaceClient {
    pub fn from_config(cfg: &Config) -> anyhow::Result<Self> {
        let base_url = parse_base_url(&cfg.api.api_url)?;
        let http = Client::builder()
            .user_agent(cfg.api.user_agent.as_deref().unwrap_or(USER_AGENT))
            .timeout(Duration::from_secs(cfg.api.request_timeout_seconds))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url,
            token: cfg.api.auth_token.clone(),
            retry: cfg.retry_policy(),
        })
    }

    pub fn with_base_url(token: String, base_url: Url, retry: RetryPolicy) -> anyhow::Result<Self> {
        let http = Client::builder()
            .user_agent(USER_AGENT)
            .no_proxy()
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url,
            token,
            retry,
        })
    }

    pub fn build_request(
        &self,
        endpoint: &Endpoint,
        page: &PageRequest,
    ) -> Result<reqwest::Request, FetchError> {
        let url = self
            .base_url
            .join(&endpoint.path)
            .map_err(|e| FetchError::Request(format!("invalid endpoint {}: {e}", endpoint.path)))?;
        self.http
            .get(url)
            .header(API_KEY_HEADER, &self.token)
            .header("Accept", "application/json")
            .query(&endpoint.fixed_query)
            .query(&page.params)
            .build()
            .map_err(|e| FetchError::Request(e.to_string()))
    }

    async fn execute_once(&self, request: reqwest::Request) -> Attempt<Value, AttemptFailure> {
        let url = request.url().to_string();
        debug!(url = %url, "GET {} [{}: REDACTED]", url, API_KEY_HEADER);

        let res = match self.http.execute(request).await {
            Ok(res) => res,
            Err(err) => {
                return Attempt::Retry(AttemptFailure {
                    url,
                    status: None,
                    message: err.to_string(),
                })
            }
        };

        let status = res.status();
        debug!(status = status.as_u16(), "response received");
        if status.is_success() {
            return match res.json::<Value>().await {
                Ok(body) => Attempt::Done(body),
                Err(err) if err.is_decode() => Attempt::Fatal(AttemptFailure {
                    url,
                    status: Some(status.as_u16()),
                    message: format!("decode: {err}"),
                }),
                Err(err) => Attempt::Retry(AttemptFailure {
                    url,
                    status: Some(status.as_u16()),
                    message: err.to_string(),
                }),
            };
        }

        let body = res.text().await.unwrap_or_default();
        let failure = AttemptFailure {
            url,
            status: Some(status.as_u16()),
            message: body,
        };
        if RetryPolicy::is_retryable(status.as_u16()) {
            Attempt::Retry(failure)
        } else {
            Attempt::Fatal(failure)
        }
    }
}

#[async_trait]
impl EventSource for MarketplaceClient {
    async fn fetch_page(
        &self,
        endpoint: &Endpoint,
        request: &PageRequest,
    ) -> Result<PageResponse, FetchError> {
        // Built once up front so a malformed URL never burns retry attempts.
        let template = self.build_request(endpoint, request)?;
        let outcome = self
            .retry
            .run(|_| {
                let attempt_request = template.try_clone();
                async move {
                    match attempt_request {
                        Some(req) => self.execute_once(req).await,
                        None => Attempt::Fatal(AttemptFailure {
                            url: String::new(),
                            status: None,
                            message: "request body is not clonable".into(),
                        }),
                    }
                }
            })
            .await;

        match outcome {
            Ok(body) => Ok(PageResponse::from_body(body)),
            Err(RetryError::Fatal(failure)) => Err(failure.into_fatal()),
            Err(RetryError::Exhausted { attempts, last }) => Err(FetchError::RetriesExhausted {
                url: last.url,
                status: last.status,
                attempts,
                message: last.message,
            }),
        }
    }
}

#[derive(Debug)]
struct AttemptFailure {
    url: String,
    status: Option<u16>,
    message: String,
}

impl fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "{} returned {}: {}", self.url, status, self.message),
            None => write!(f, "{}: {}", self.url, self.message),
        }
    }
}

impl AttemptFailure {
    fn into_fatal(self) -> FetchError {
        match self.status {
            Some(status @ (401 | 403)) => FetchError::Unauthorized {
                url: self.url,
                status,
            },
            Some(status) if (200..300).contains(&status) => FetchError::Decode {
                url: self.url,
                message: self.message,
            },
            Some(status) => FetchError::Client {
                url: self.url,
                status,
                body: self.message,
            },
            None => FetchError::Request(self.message),
        }
    }
}

/// `Url::join` drops the last path segment unless the base ends with `/`.
fn parse_base_url(raw: &str) -> anyhow::Result<Url> {
    let trimmed = raw.trim();
    let with_slash = if trimmed.ends_with('/') {
        trimmed.to_string()
    } else {
        format!("{}/", trimmed)
    };
    Url::parse(&with_slash).with_context(|| format!("invalid api_url {}", raw))
}
