use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::Deserialize;
use tracing::debug;

use super::{Destination, DestinationError, ExistingRow, MissingField, SyncLogEntry};
use crate::mapper::DestinationRow;
use crate::recency::parse_timestamp;
use crate::retry::{self, RetryConfig};

const EXISTENCE_SELECT: &str = "id,update_date,create_date";

#[derive(Debug, Deserialize)]
struct ExistenceRow {
    id: i64,
    #[serde(default)]
    update_date: Option<String>,
    #[serde(default)]
    create_date: Option<String>,
}

/// Supabase/PostgREST client for `{url}/rest/v1`.
///
/// The schema is selected with `Accept-Profile` on reads and
/// `Content-Profile` on writes.
pub struct PostgrestClient {
    client: Client,
    rest_url: String,
    key: String,
    schema: String,
    table: String,
    log_table: String,
    retry: RetryConfig,
}

impl std::fmt::Debug for PostgrestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgrestClient")
            .field("rest_url", &self.rest_url)
            .field("key", &"<redacted>")
            .field("schema", &self.schema)
            .field("table", &self.table)
            .field("log_table", &self.log_table)
            .finish_non_exhaustive()
    }
}

impl PostgrestClient {
    pub fn new(
        client: Client,
        supabase_url: &str,
        key: &str,
        schema: &str,
        table: &str,
        log_table: &str,
        retry: RetryConfig,
    ) -> Self {
        Self {
            client,
            rest_url: format!("{}/rest/v1", supabase_url.trim_end_matches('/')),
            key: key.to_string(),
            schema: schema.to_string(),
            table: table.to_string(),
            log_table: log_table.to_string(),
            retry,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.rest_url, path)
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .header("apikey", &self.key)
            .header("Authorization", format!("Bearer {}", self.key))
    }

    fn read(&self, path: &str) -> RequestBuilder {
        self.authorized(self.client.get(self.url(path)))
            .header("Accept-Profile", &self.schema)
    }

    fn write(&self, builder: RequestBuilder) -> RequestBuilder {
        self.authorized(builder)
            .header("Content-Profile", &self.schema)
            .header("Prefer", "return=minimal")
    }

    async fn attempt_fetch_existing(
        &self,
        filter: &str,
    ) -> Result<HashMap<i64, ExistingRow>, DestinationError> {
        let response = self
            .read(&self.table)
            .query(&[("select", EXISTENCE_SELECT), ("or", filter)])
            .send()
            .await?;
        let rows: Vec<ExistenceRow> = check(response)
            .await?
            .json()
            .await
            .map_err(|e| DestinationError::Decode(e.to_string()))?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let existing = ExistingRow {
                    update_date: row.update_date.as_deref().and_then(parse_timestamp),
                    create_date: row.create_date.as_deref().and_then(parse_timestamp),
                };
                (row.id, existing)
            })
            .collect())
    }

    async fn attempt_insert(
        &self,
        rows: &[DestinationRow],
        columns: &str,
    ) -> Result<(), DestinationError> {
        let response = self
            .write(self.client.post(self.url(&self.table)))
            .query(&[("columns", columns)])
            .json(rows)
            .send()
            .await?;
        check(response).await.map(drop)
    }

    async fn attempt_update(&self, row: &DestinationRow) -> Result<(), DestinationError> {
        let id_filter = format!("eq.{}", row.id);
        let response = self
            .write(self.client.patch(self.url(&self.table)))
            .query(&[("id", id_filter.as_str())])
            .json(row)
            .send()
            .await?;
        check(response).await.map(drop)
    }

    async fn attempt_record_run(&self, entry: &SyncLogEntry) -> Result<(), DestinationError> {
        let response = self
            .write(self.client.post(self.url(&self.log_table)))
            .json(entry)
            .send()
            .await?;
        check(response).await.map(drop)
    }
}

/// Turn a non-success response into [`DestinationError::HttpStatus`],
/// keeping the PostgREST error body for the log.
async fn check(response: Response) -> Result<Response, DestinationError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(DestinationError::HttpStatus {
        status: status.as_u16(),
        body,
    })
}

/// Union of the keys across `rows`, for PostgREST's `columns` parameter.
///
/// PostgREST rejects a bulk body whose objects have different keys unless the
/// column list is given; keys a row lacks then take the column default.
fn insert_columns(rows: &[DestinationRow]) -> String {
    let mut columns: BTreeSet<&str> = rows.iter().flat_map(|row| row.columns()).collect();
    columns.insert("id");
    columns.into_iter().collect::<Vec<_>>().join(",")
}

/// `(id.eq.1,id.eq.2)` for PostgREST's `or` filter.
fn id_filter(ids: &[i64]) -> String {
    let terms: Vec<String> = ids.iter().map(|id| format!("id.eq.{id}")).collect();
    format!("({})", terms.join(","))
}

#[async_trait]
impl Destination for PostgrestClient {
    async fn fetch_existing(
        &self,
        ids: &[i64],
    ) -> Result<HashMap<i64, ExistingRow>, DestinationError> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let filter = id_filter(ids);
        let found = retry::retry_with_backoff(&self.retry, DestinationError::retry_action, || {
            self.attempt_fetch_existing(&filter)
        })
        .await?;
        debug!(requested = ids.len(), found = found.len(), "Existence check");
        Ok(found)
    }

    async fn insert_rows(&self, rows: &[DestinationRow]) -> Result<(), DestinationError> {
        if rows.is_empty() {
            return Ok(());
        }
        let columns = insert_columns(rows);
        retry::retry_with_backoff(&self.retry, DestinationError::retry_action, || {
            self.attempt_insert(rows, &columns)
        })
        .await
    }

    async fn update_row(&self, row: &DestinationRow) -> Result<(), DestinationError> {
        retry::retry_with_backoff(&self.retry, DestinationError::retry_action, || {
            self.attempt_update(row)
        })
        .await
    }

    async fn log_missing_field(&self, field: &MissingField) -> Result<(), DestinationError> {
        let response = self
            .write(self.client.post(self.url("rpc/log_missing_field")))
            .json(field)
            .send()
            .await?;
        check(response).await.map(drop)
    }

    async fn record_sync_run(&self, entry: &SyncLogEntry) -> Result<(), DestinationError> {
        retry::retry_with_backoff(&self.retry, DestinationError::retry_action, || {
            self.attempt_record_run(entry)
        })
        .await
    }
}
