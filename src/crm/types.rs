use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};

/// One SprintHub opportunity as returned by a funnel/stage page.
///
/// Only `id` is required. Everything else is optional because the API omits
/// or nulls fields freely, and `value` may arrive as a number or as a
/// localized string such as `"1.234,56"`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExternalRecord {
    #[serde(deserialize_with = "lenient_i64")]
    pub id: i64,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub value: Value,
    #[serde(default, deserialize_with = "lenient_opt_i64")]
    pub crm_column: Option<i64>,
    #[serde(default, deserialize_with = "lenient_opt_i64")]
    pub lead_id: Option<i64>,
    #[serde(default, deserialize_with = "lenient_opt_i64")]
    pub sequence: Option<i64>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub loss_reason: Option<String>,
    #[serde(default)]
    pub gain_reason: Option<String>,
    #[serde(default, rename = "expectedCloseDate")]
    pub expected_close_date: Option<String>,
    #[serde(default)]
    pub sale_channel: Option<Value>,
    #[serde(default)]
    pub campaign: Option<Value>,
    #[serde(default, deserialize_with = "lenient_opt_i64")]
    pub user: Option<i64>,
    #[serde(default)]
    pub last_column_change: Option<String>,
    #[serde(default)]
    pub last_status_change: Option<String>,
    #[serde(default)]
    pub gain_date: Option<String>,
    #[serde(default)]
    pub lost_date: Option<String>,
    #[serde(default)]
    pub reopen_date: Option<String>,
    #[serde(default, rename = "createDate")]
    pub create_date: Option<String>,
    #[serde(default, rename = "updateDate")]
    pub update_date: Option<String>,
    #[serde(default)]
    pub archived: Option<Value>,
    /// Custom fields keyed by their human-readable label.
    #[serde(default, deserialize_with = "null_as_empty_map")]
    pub fields: Map<String, Value>,
    #[serde(default, rename = "dataLead")]
    pub lead: Option<Lead>,
}

/// Contact sub-record embedded in an opportunity.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Lead {
    #[serde(default)]
    pub firstname: Option<String>,
    #[serde(default)]
    pub lastname: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub whatsapp: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub mobile: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
}

fn value_as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn lenient_i64<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    value_as_i64(&value)
        .ok_or_else(|| serde::de::Error::custom(format!("expected an integer id, got {value}")))
}

fn lenient_opt_i64<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(value_as_i64(&value))
}

fn null_as_empty_map<'de, D>(deserializer: D) -> Result<Map<String, Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Object(map) => map,
        _ => Map::new(),
    })
}
