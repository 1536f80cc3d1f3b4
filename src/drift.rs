//! Schema-drift side channel: custom-field labels the mapper does not know.
//!
//! Observation runs next to mapping, never inside it. Each distinct label is
//! kept once per run with the first value seen, then flushed to the
//! destination's `log_missing_field` RPC after the run.

use std::collections::BTreeMap;
use std::sync::Mutex;

use serde_json::Value;

use crate::crm::ExternalRecord;
use crate::destination::{Destination, MissingField};
use crate::mapper::is_known_label;

/// `resource` value sent with every missing-field report.
pub const RESOURCE: &str = "oportunidade";

#[derive(Debug, Default)]
pub struct FieldDriftRecorder {
    unknown: Mutex<BTreeMap<String, Value>>,
}

impl FieldDriftRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Note every unknown label in `record.fields`.
    pub fn observe(&self, record: &ExternalRecord) {
        let mut unknown = self
            .unknown
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        for (label, value) in &record.fields {
            if !is_known_label(label) && !unknown.contains_key(label) {
                tracing::debug!(label = %label, id = record.id, "Unknown custom field");
                unknown.insert(label.clone(), value.clone());
            }
        }
    }

    /// Take the observations, leaving the recorder empty.
    pub fn drain(&self) -> Vec<MissingField> {
        let mut unknown = self
            .unknown
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        std::mem::take(&mut *unknown)
            .into_iter()
            .map(|(field_name, sample)| MissingField {
                resource: RESOURCE.to_string(),
                field_name,
                sample,
            })
            .collect()
    }

    /// Send every observation. Failures are logged and swallowed; returns how
    /// many reports were accepted.
    pub async fn flush(&self, destination: &dyn Destination) -> usize {
        let mut sent = 0;
        for field in self.drain() {
            match destination.log_missing_field(&field).await {
                Ok(()) => sent += 1,
                Err(e) => tracing::warn!(
                    field = %field.field_name,
                    "Failed to report unknown field: {}",
                    e
                ),
            }
        }
        if sent > 0 {
            tracing::info!(count = sent, "Reported unknown custom fields");
        }
        sent
    }
}
