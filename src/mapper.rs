//! Opportunity → destination row mapping.
//!
//! Pure: no I/O and no shared state. Unknown custom-field labels are picked
//! up separately by [`crate::drift`] so mapping never depends on them.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::crm::ExternalRecord;
use crate::recency::{parse_date, parse_timestamp};
use crate::topology::Topology;

/// Columns the destination table accepts. Anything else is dropped before a
/// write.
pub const DESTINATION_COLUMNS: &[&str] = &[
    "id",
    "title",
    "value",
    "crm_column",
    "funil_id",
    "lead_id",
    "sequence",
    "status",
    "loss_reason",
    "gain_reason",
    "expected_close_date",
    "sale_channel",
    "campaign",
    "user_id",
    "last_column_change",
    "last_status_change",
    "gain_date",
    "lost_date",
    "reopen_date",
    "create_date",
    "update_date",
    "archived",
    "lead_firstname",
    "lead_lastname",
    "lead_email",
    "lead_whatsapp",
    "lead_city",
    "lead_state",
    "origem_oportunidade",
    "qualificacao",
    "status_orcamento",
    "valor_orcado",
    "forma_pagamento",
    "tipo_compra",
    "numero_pedido",
    "requisicao",
    "frete",
    "desconto",
    "valor_final",
    "data_fechamento",
    "data_recompra",
    "data_entrega",
    "status_entrega",
    "primeira_compra",
    "cliente_ativo",
    "quantidade_itens",
    "produto",
    "prescritor",
    "vendedor",
    "unidade",
    "canal_venda",
    "cupom",
    "observacoes",
    "utm_source",
    "utm_medium",
    "utm_campaign",
    "synced_at",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    Decimal,
    Integer,
    Boolean,
    Date,
    Timestamp,
}

/// One custom-field label and the column it lands in.
#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub label: &'static str,
    pub column: &'static str,
    pub kind: FieldKind,
}

const fn field(label: &'static str, column: &'static str, kind: FieldKind) -> FieldSpec {
    FieldSpec {
        label,
        column,
        kind,
    }
}

/// Custom-field labels as they appear in SprintHub. Labels are display text,
/// so a rename on the CRM side shows up as an unknown label in the drift log.
pub const CUSTOM_FIELDS: &[FieldSpec] = &[
    field("ORIGEM DA OPORTUNIDADE", "origem_oportunidade", FieldKind::Text),
    field("Qualificação", "qualificacao", FieldKind::Text),
    field("Status Orçamento", "status_orcamento", FieldKind::Text),
    field("Valor Orçado", "valor_orcado", FieldKind::Decimal),
    field("Forma Pagamento", "forma_pagamento", FieldKind::Text),
    field("Tipo de Compra", "tipo_compra", FieldKind::Text),
    field("Número do Pedido", "numero_pedido", FieldKind::Text),
    field("Requisição", "requisicao", FieldKind::Text),
    field("Frete", "frete", FieldKind::Decimal),
    field("Desconto", "desconto", FieldKind::Decimal),
    field("Valor Final", "valor_final", FieldKind::Decimal),
    field("Data Fechamento", "data_fechamento", FieldKind::Date),
    field("Data Recompra", "data_recompra", FieldKind::Date),
    field("Data de Entrega", "data_entrega", FieldKind::Date),
    field("Status de Entrega", "status_entrega", FieldKind::Text),
    field("Primeira Compra", "primeira_compra", FieldKind::Boolean),
    field("Cliente Ativo", "cliente_ativo", FieldKind::Boolean),
    field("Quantidade de Itens", "quantidade_itens", FieldKind::Integer),
    field("Produto", "produto", FieldKind::Text),
    field("Prescritor", "prescritor", FieldKind::Text),
    field("Vendedor", "vendedor", FieldKind::Text),
    field("Unidade", "unidade", FieldKind::Text),
    field("Canal de Venda", "canal_venda", FieldKind::Text),
    field("Cupom", "cupom", FieldKind::Text),
    field("Observações", "observacoes", FieldKind::Text),
    field("utm_source", "utm_source", FieldKind::Text),
    field("utm_medium", "utm_medium", FieldKind::Text),
    field("utm_campaign", "utm_campaign", FieldKind::Text),
];

/// Labels we know about but deliberately do not store.
const IGNORED_LABELS: &[&str] = &["Telefone", "Email", "WhatsApp", "CPF", "Endereço"];

pub fn is_known_label(label: &str) -> bool {
    CUSTOM_FIELDS.iter().any(|f| f.label == label) || IGNORED_LABELS.contains(&label)
}

/// Flat row written to the destination table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DestinationRow {
    pub id: i64,
    #[serde(flatten)]
    columns: Map<String, Value>,
}

impl DestinationRow {
    pub fn new(id: i64) -> Self {
        Self {
            id,
            columns: Map::new(),
        }
    }

    pub fn set(&mut self, column: &str, value: Value) {
        self.columns.insert(column.to_string(), value);
    }

    #[cfg(test)]
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns.get(column)
    }

    /// Names of the columns set on this row, `id` excluded.
    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(String::as_str)
    }

    /// The source `updateDate` carried by this row.
    pub fn update_date(&self) -> Option<DateTime<Utc>> {
        self.columns
            .get("update_date")
            .and_then(Value::as_str)
            .and_then(parse_timestamp)
    }

    /// Drop every column outside [`DESTINATION_COLUMNS`], returning the
    /// dropped names.
    pub fn retain_allowed(&mut self) -> Vec<String> {
        let dropped: Vec<String> = self
            .columns
            .keys()
            .filter(|c| !DESTINATION_COLUMNS.contains(&c.as_str()))
            .cloned()
            .collect();
        for column in &dropped {
            self.columns.remove(column);
        }
        dropped
    }
}

/// Parse `1234.56`, `1.234,56`, `1,234.56`, `12,5` or `1.500` into a number.
///
/// A lone dot followed by exactly three digits is a pt-BR thousands
/// separator, so `1.500` is 1500; `0.500` and `1.50` stay decimals.
pub fn parse_decimal(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .trim()
        .trim_start_matches("R$")
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    if cleaned.is_empty() {
        return None;
    }

    let last_comma = cleaned.rfind(',');
    let last_dot = cleaned.rfind('.');
    let normalized = match (last_comma, last_dot) {
        // 1.234,56
        (Some(c), Some(d)) if c > d => cleaned.replace('.', "").replace(',', "."),
        // 1,234.56
        (Some(_), Some(_)) => cleaned.replace(',', ""),
        // 12,5
        (Some(_), None) => cleaned.replace(',', "."),
        // 1.234.567
        (None, Some(_)) if cleaned.matches('.').count() > 1 => cleaned.replace('.', ""),
        // 1.500
        (None, Some(d)) if is_thousands_group(&cleaned, d) => cleaned.replace('.', ""),
        _ => cleaned,
    };

    normalized.parse::<f64>().ok().filter(|f| f.is_finite())
}

fn is_thousands_group(cleaned: &str, dot: usize) -> bool {
    let (whole, fraction) = (&cleaned[..dot], &cleaned[dot + 1..]);
    let digits = whole.trim_start_matches('-');
    fraction.len() == 3
        && fraction.bytes().all(|b| b.is_ascii_digit())
        && !digits.is_empty()
        && digits.bytes().all(|b| b.is_ascii_digit())
        && digits.bytes().any(|b| b != b'0')
}

pub fn value_as_decimal(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => parse_decimal(s),
        _ => None,
    }
}

/// Monetary value: unparseable becomes 0 so sums stay defined.
pub fn parse_money(value: &Value) -> f64 {
    value_as_decimal(value).unwrap_or(0.0)
}

/// `true/false/1/0/yes/no/sim/não`, case-insensitive. Anything else is
/// ambiguous and yields `None`.
pub fn parse_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => match n.as_i64() {
            Some(1) => Some(true),
            Some(0) => Some(false),
            _ => None,
        },
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" | "sim" => Some(true),
            "false" | "0" | "no" | "não" | "nao" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn value_as_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().filter_map(value_as_text).collect();
            (!parts.is_empty()).then(|| parts.join(", "))
        }
        Value::Object(_) => Some(value.to_string()),
    }
}

fn value_as_integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        _ => value_as_decimal(value)
            .filter(|f| f.fract() == 0.0)
            .map(|f| f as i64),
    }
}

fn text_value(raw: Option<&str>) -> Value {
    raw.map(str::trim)
        .filter(|s| !s.is_empty())
        .map_or(Value::Null, |s| Value::String(s.to_string()))
}

fn timestamp_value(raw: Option<&str>) -> Value {
    raw.and_then(parse_timestamp).map_or(Value::Null, |ts| {
        Value::String(ts.to_rfc3339_opts(SecondsFormat::Secs, true))
    })
}

fn date_value(raw: Option<&str>) -> Value {
    raw.and_then(parse_date)
        .map_or(Value::Null, |d| Value::String(d.format("%Y-%m-%d").to_string()))
}

/// Convert a custom-field value according to its declared kind.
pub fn convert(kind: FieldKind, value: &Value) -> Value {
    match kind {
        FieldKind::Text => value_as_text(value).map_or(Value::Null, Value::String),
        FieldKind::Decimal => value_as_decimal(value).map_or(Value::Null, Value::from),
        FieldKind::Integer => value_as_integer(value).map_or(Value::Null, Value::from),
        FieldKind::Boolean => parse_bool(value).map_or(Value::Null, Value::Bool),
        FieldKind::Date => date_value(value_as_text(value).as_deref()),
        FieldKind::Timestamp => timestamp_value(value_as_text(value).as_deref()),
    }
}

/// Map one opportunity to its destination row.
///
/// The funnel id is derived from the stage through `topology`; an unknown
/// stage leaves `funil_id` null. The result is already allow-list filtered.
pub fn map_record(record: &ExternalRecord, topology: &Topology) -> DestinationRow {
    let mut row = DestinationRow::new(record.id);

    row.set("title", text_value(record.title.as_deref()));
    row.set("value", Value::from(parse_money(&record.value)));
    row.set("crm_column", record.crm_column.map_or(Value::Null, Value::from));
    let funnel = record
        .crm_column
        .and_then(|c| u32::try_from(c).ok())
        .and_then(|c| topology.funnel_for_stage(c));
    row.set("funil_id", funnel.map_or(Value::Null, Value::from));
    row.set("lead_id", record.lead_id.map_or(Value::Null, Value::from));
    row.set("sequence", record.sequence.map_or(Value::Null, Value::from));
    row.set("status", text_value(record.status.as_deref()));
    row.set("loss_reason", text_value(record.loss_reason.as_deref()));
    row.set("gain_reason", text_value(record.gain_reason.as_deref()));
    row.set("expected_close_date", date_value(record.expected_close_date.as_deref()));
    row.set("sale_channel", convert(FieldKind::Text, record.sale_channel.as_ref().unwrap_or(&Value::Null)));
    row.set("campaign", convert(FieldKind::Text, record.campaign.as_ref().unwrap_or(&Value::Null)));
    row.set("user_id", record.user.map_or(Value::Null, Value::from));
    row.set("last_column_change", timestamp_value(record.last_column_change.as_deref()));
    row.set("last_status_change", timestamp_value(record.last_status_change.as_deref()));
    row.set("gain_date", timestamp_value(record.gain_date.as_deref()));
    row.set("lost_date", timestamp_value(record.lost_date.as_deref()));
    row.set("reopen_date", timestamp_value(record.reopen_date.as_deref()));
    row.set("create_date", timestamp_value(record.create_date.as_deref()));
    row.set("update_date", timestamp_value(record.update_date.as_deref()));
    row.set(
        "archived",
        record
            .archived
            .as_ref()
            .and_then(parse_bool)
            .map_or(Value::Null, Value::Bool),
    );

    if let Some(lead) = &record.lead {
        row.set("lead_firstname", text_value(lead.firstname.as_deref()));
        row.set("lead_lastname", text_value(lead.lastname.as_deref()));
        row.set("lead_email", text_value(lead.email.as_deref()));
        let phone = [&lead.whatsapp, &lead.mobile, &lead.phone]
            .into_iter()
            .find_map(|p| p.as_deref().filter(|s| !s.trim().is_empty()));
        row.set("lead_whatsapp", text_value(phone));
        row.set("lead_city", text_value(lead.city.as_deref()));
        row.set("lead_state", text_value(lead.state.as_deref()));
    }

    for spec in CUSTOM_FIELDS {
        if let Some(raw) = record.fields.get(spec.label) {
            row.set(spec.column, convert(spec.kind, raw));
        }
    }

    let dropped = row.retain_allowed();
    if !dropped.is_empty() {
        tracing::warn!(id = record.id, ?dropped, "Dropped columns outside the destination schema");
    }
    row
}
