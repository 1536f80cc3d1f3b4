//! SprintHub CRM client: fetches one page of opportunities for a
//! funnel/stage pair.
//!
//! Pagination is driven by the caller (see `sync::stage`) so that page N+1 is
//! only requested once page N has been filtered and written.

pub mod error;
pub mod types;

pub use error::CrmError;
pub use types::ExternalRecord;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::retry::{self, RetryConfig};

/// Source of opportunity pages. Implemented by [`SprintHubClient`] and by
/// in-memory fakes in tests.
#[async_trait]
pub trait OpportunitySource: Send + Sync {
    /// Fetch page `page` (zero-based) of `stage_id` in `funnel_id`.
    ///
    /// An out-of-range page yields `Ok(vec![])`. `Err` means retries were
    /// exhausted or the failure is not retryable.
    async fn fetch_page(
        &self,
        funnel_id: u32,
        stage_id: u32,
        page: u32,
    ) -> Result<Vec<ExternalRecord>, CrmError>;

    /// Number of records a full page holds.
    fn page_size(&self) -> usize;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PageRequest {
    page: u32,
    limit: usize,
    column_id: u32,
}

/// HTTP client for `POST /crm/opportunities/{funnelId}`.
pub struct SprintHubClient {
    client: Client,
    base_url: String,
    instance: String,
    token: String,
    page_size: usize,
    retry: RetryConfig,
}

impl std::fmt::Debug for SprintHubClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SprintHubClient")
            .field("base_url", &self.base_url)
            .field("instance", &self.instance)
            .field("token", &"<redacted>")
            .field("page_size", &self.page_size)
            .finish_non_exhaustive()
    }
}

impl SprintHubClient {
    pub fn new(
        client: Client,
        base_url: &str,
        instance: &str,
        token: &str,
        page_size: usize,
        retry: RetryConfig,
    ) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            instance: instance.to_string(),
            token: token.to_string(),
            page_size,
            retry,
        }
    }

    /// Single request with no retry. 400 is how the API says "past the last
    /// page", so it maps to an empty page rather than an error.
    async fn attempt_fetch(
        &self,
        funnel_id: u32,
        stage_id: u32,
        page: u32,
    ) -> Result<Vec<ExternalRecord>, CrmError> {
        let url = format!("{}/crm/opportunities/{}", self.base_url, funnel_id);
        let body = PageRequest {
            page,
            limit: self.page_size,
            column_id: stage_id,
        };
        let response = self
            .client
            .post(&url)
            .query(&[("apitoken", self.token.as_str()), ("i", self.instance.as_str())])
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::BAD_REQUEST {
            debug!(funnel_id, stage_id, page, "SprintHub answered 400, treating as end of data");
            return Ok(Vec::new());
        }
        if !status.is_success() {
            return Err(CrmError::HttpStatus {
                status: status.as_u16(),
                stage_id,
                page,
            });
        }

        let payload: Value = response.json().await?;
        decode_page(payload, stage_id, page)
    }
}

/// Decode a page body. Individual records that fail to decode are logged
/// and dropped so one malformed opportunity cannot hide its siblings.
fn decode_page(payload: Value, stage_id: u32, page: u32) -> Result<Vec<ExternalRecord>, CrmError> {
    let items = match payload {
        Value::Array(items) => items,
        Value::Null => return Ok(Vec::new()),
        other => {
            return Err(CrmError::Decode(format!(
                "expected an array for stage {stage_id} page {page}, got {}",
                type_name(&other)
            )))
        }
    };

    let mut records = Vec::with_capacity(items.len());
    for item in items {
        match serde_json::from_value::<ExternalRecord>(item) {
            Ok(record) => records.push(record),
            Err(e) => warn!(stage_id, page, "Skipping undecodable opportunity: {}", e),
        }
    }
    Ok(records)
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[async_trait]
impl OpportunitySource for SprintHubClient {
    async fn fetch_page(
        &self,
        funnel_id: u32,
        stage_id: u32,
        page: u32,
    ) -> Result<Vec<ExternalRecord>, CrmError> {
        let records = retry::retry_with_backoff(
            &self.retry,
            CrmError::retry_action,
            || self.attempt_fetch(funnel_id, stage_id, page),
        )
        .await?;
        debug!(funnel_id, stage_id, page, count = records.len(), "Fetched page");
        Ok(records)
    }

    fn page_size(&self) -> usize {
        self.page_size
    }
}
