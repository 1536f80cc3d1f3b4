//! Destination store: the opportunities table, the missing-field RPC and the
//! sync audit table, all behind one trait.

pub mod error;
mod postgrest;

pub use error::DestinationError;
pub use postgrest::PostgrestClient;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::mapper::DestinationRow;

/// Timestamps of a row that already exists in the destination.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExistingRow {
    /// `None` when the stored value is missing or unparseable.
    pub update_date: Option<DateTime<Utc>>,
    pub create_date: Option<DateTime<Utc>>,
}

/// Payload of `rpc/log_missing_field`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MissingField {
    pub resource: String,
    pub field_name: String,
    pub sample: Value,
}

/// One row of the sync audit table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncLogEntry {
    pub created_at: DateTime<Utc>,
    /// When the run started.
    pub data: DateTime<Utc>,
    pub descricao: String,
}

/// Everything the pipeline writes to or reads from. Implemented by
/// [`PostgrestClient`] and by in-memory fakes in tests.
#[async_trait]
pub trait Destination: Send + Sync {
    /// One batched lookup. IDs absent from the result do not exist.
    async fn fetch_existing(
        &self,
        ids: &[i64],
    ) -> Result<HashMap<i64, ExistingRow>, DestinationError>;

    /// Bulk insert in a single request.
    async fn insert_rows(&self, rows: &[DestinationRow]) -> Result<(), DestinationError>;

    async fn update_row(&self, row: &DestinationRow) -> Result<(), DestinationError>;

    async fn log_missing_field(&self, field: &MissingField) -> Result<(), DestinationError>;

    async fn record_sync_run(&self, entry: &SyncLogEntry) -> Result<(), DestinationError>;
}
