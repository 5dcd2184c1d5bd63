//! Identity service client.
//!
//! Fetches a subject's permission-group memberships from the external
//! identity service. The membership cache wraps every call.

use async_trait::async_trait;
use reqwest::StatusCode;
use service_core::observability::TracedClientExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tracing::instrument;

use crate::config::IdentityConfig;
use crate::models::GroupMemberships;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("Identity service request timed out")]
    Timeout,

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Unexpected response status: {0}")]
    UnexpectedStatus(u16),

    #[error("Invalid response body: {0}")]
    InvalidBody(String),
}

/// Outbound contract to the identity service.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Look up group memberships for `subject`.
    ///
    /// `Ok(None)` means the identity service does not know the subject.
    async fn fetch_groups(&self, subject: &str) -> Result<Option<GroupMemberships>, IdentityError>;
}

/// HTTP implementation of [`IdentityProvider`].
#[derive(Clone)]
pub struct HttpIdentityClient {
    client: reqwest::Client,
    base_url: String,
    api_token: Option<String>,
    request_timeout: Duration,
}

impl HttpIdentityClient {
    pub fn new(config: &IdentityConfig) -> Result<Self, anyhow::Error> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build identity HTTP client: {}", e))?;

        tracing::info!(
            base_url = %config.base_url,
            timeout_ms = config.request_timeout_ms,
            "Identity service client configured"
        );

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_token: config.api_token.clone(),
            request_timeout: config.request_timeout(),
        })
    }

    /// `None` when the subject cannot name a single path segment. URL parsing
    /// treats `.` and `..` as dot segments even when percent-encoded.
    fn groups_url(&self, subject: &str) -> Option<String> {
        if matches!(subject, "" | "." | "..") {
            return None;
        }
        Some(format!(
            "{}/users/{}/groups",
            self.base_url,
            urlencoding::encode(subject)
        ))
    }
}

#[async_trait]
impl IdentityProvider for HttpIdentityClient {
    #[instrument(skip(self), fields(subject = %subject))]
    async fn fetch_groups(&self, subject: &str) -> Result<Option<GroupMemberships>, IdentityError> {
        let Some(url) = self.groups_url(subject) else {
            tracing::warn!("Subject is not a valid path segment, treating as unknown");
            return Ok(None);
        };

        let mut request = self
            .client
            .traced_get(&url)
            .timeout(self.request_timeout);
        if let Some(token) = &self.api_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                IdentityError::Timeout
            } else {
                IdentityError::Connection(e.to_string())
            }
        })?;

        match response.status() {
            StatusCode::NOT_FOUND => {
                tracing::debug!("Identity service does not know subject");
                Ok(None)
            }
            status if status.is_success() => {
                let groups = response.json::<GroupMemberships>().await.map_err(|e| {
                    if e.is_timeout() {
                        IdentityError::Timeout
                    } else {
                        IdentityError::InvalidBody(e.to_string())
                    }
                })?;
                Ok(Some(groups))
            }
            status => {
                tracing::warn!(status = %status, "Identity service returned unexpected status");
                Err(IdentityError::UnexpectedStatus(status.as_u16()))
            }
        }
    }
}

/// In-memory identity provider for tests.
///
/// Counts upstream invocations and can simulate latency or outages.
pub struct MockIdentityProvider {
    pub groups: Mutex<HashMap<String, GroupMemberships>>,
    pub delay: Mutex<Option<Duration>>,
    pub failing: Mutex<bool>,
    calls: AtomicUsize,
}

impl Default for MockIdentityProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MockIdentityProvider {
    pub fn new() -> Self {
        Self {
            groups: Mutex::new(HashMap::new()),
            delay: Mutex::new(None),
            failing: Mutex::new(false),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_groups(self, subject: &str, groups: GroupMemberships) -> Self {
        self.set_groups(subject, groups);
        self
    }

    pub fn with_delay(self, delay: Duration) -> Self {
        self.set_delay(Some(delay));
        self
    }

    pub fn set_groups(&self, subject: &str, groups: GroupMemberships) {
        if let Ok(mut map) = self.groups.lock() {
            map.insert(subject.to_string(), groups);
        }
    }

    pub fn set_delay(&self, delay: Option<Duration>) {
        if let Ok(mut guard) = self.delay.lock() {
            *guard = delay;
        }
    }

    pub fn set_failing(&self, failing: bool) {
        if let Ok(mut guard) = self.failing.lock() {
            *guard = failing;
        }
    }

    /// Number of upstream calls received so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IdentityProvider for MockIdentityProvider {
    async fn fetch_groups(&self, subject: &str) -> Result<Option<GroupMemberships>, IdentityError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let delay = *self
            .delay
            .lock()
            .map_err(|e| IdentityError::Connection(format!("Mock delay mutex poisoned: {}", e)))?;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let failing = *self
            .failing
            .lock()
            .map_err(|e| IdentityError::Connection(format!("Mock flag mutex poisoned: {}", e)))?;
        if failing {
            return Err(IdentityError::Connection("simulated outage".to_string()));
        }

        let groups = self
            .groups
            .lock()
            .map_err(|e| IdentityError::Connection(format!("Mock groups mutex poisoned: {}", e)))?
            .get(subject)
            .cloned();
        Ok(groups)
    }
}
