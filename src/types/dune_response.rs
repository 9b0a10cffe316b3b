use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};

/// One record of a query result. The cache never looks inside it.
pub type Row = Map<String, Value>;

#[derive(Debug, Deserialize)]
pub struct ExecuteResponse {
    #[serde(deserialize_with = "string_or_number")]
    pub execution_id: String,
    pub state: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ExecutionResults {
    #[serde(default, deserialize_with = "optional_string_or_number")]
    pub execution_id: Option<String>,
    pub state: String,
    pub execution_ended_at: Option<DateTime<Utc>>,
    pub result: Option<ResultSet>,
}

#[derive(Debug, Deserialize)]
pub struct ResultSet {
    #[serde(default)]
    pub rows: Vec<Row>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionState {
    Completed,
    Failed,
    Cancelled,
    Running(String),
}

impl From<&str> for ExecutionState {
    fn from(state: &str) -> Self {
        match state {
            "QUERY_STATE_COMPLETED" => ExecutionState::Completed,
            "QUERY_STATE_FAILED" => ExecutionState::Failed,
            "QUERY_STATE_CANCELLED" => ExecutionState::Cancelled,
            other => ExecutionState::Running(other.to_owned()),
        }
    }
}

impl ExecutionResults {
    pub fn execution_state(&self) -> ExecutionState {
        ExecutionState::from(self.state.as_str())
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StringOrNumber {
    String(String),
    Number(serde_json::Number),
}

impl From<StringOrNumber> for String {
    fn from(value: StringOrNumber) -> Self {
        match value {
            StringOrNumber::String(s) => s,
            StringOrNumber::Number(n) => n.to_string(),
        }
    }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    StringOrNumber::deserialize(deserializer).map(String::from)
}

fn optional_string_or_number<'de, D>(
    deserializer: D,
) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<StringOrNumber>::deserialize(deserializer)
        .map(|value| value.map(String::from))
}
