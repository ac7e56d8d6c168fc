use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Reserved sensor kinds that never run as workers; their `config_id`s are
/// retained for log/notification routing instead.
pub const RESERVED_ERROR_SENSOR: &str = "_error";
pub const RESERVED_CONFIG_APPLIED_SENSOR: &str = "_conf_applied";

/// Per-sensor stream that every sensor kind carries implicitly.
pub const IMPLICIT_ERROR_STREAM: &str = "error";

/// Closed primitive registry for stream values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Bool,
    Float,
    Integer,
    String,
    Datetime,
    Duration,
    Blob,
}

impl DataType {
    pub fn schema_name(self) -> &'static str {
        match self {
            DataType::Bool => "bool",
            DataType::Float => "float",
            DataType::Integer => "integer",
            DataType::String => "string",
            DataType::Datetime => "datetime",
            DataType::Duration => "duration",
            DataType::Blob => "blob",
        }
    }

    pub fn matches(self, value: &Value) -> bool {
        matches!(
            (self, value),
            (DataType::Bool, Value::Bool(_))
                | (DataType::Float, Value::Float(_))
                | (DataType::Integer, Value::Integer(_))
                | (DataType::String, Value::String(_))
                | (DataType::Datetime, Value::Datetime(_))
                | (DataType::Duration, Value::Duration(_))
                | (DataType::Blob, Value::Blob(_))
        )
    }
}

/// Runtime payload for a DataPoint, tagged by the primitive it was produced as.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Float(f64),
    Integer(i64),
    String(String),
    Datetime(i64),
    Duration(i64),
    Blob(Vec<u8>),
}

impl Value {
    pub fn datatype(&self) -> DataType {
        match self {
            Value::Bool(_) => DataType::Bool,
            Value::Float(_) => DataType::Float,
            Value::Integer(_) => DataType::Integer,
            Value::String(_) => DataType::String,
            Value::Datetime(_) => DataType::Datetime,
            Value::Duration(_) => DataType::Duration,
            Value::Blob(_) => DataType::Blob,
        }
    }
}

/// The unit of telemetry produced by a sensor (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataPoint {
    pub config_id: String,
    pub stream_name: String,
    pub datatype: DataType,
    pub value: Value,
    /// UTC instant, millisecond precision.
    pub timestamp_ms: i64,
}

/// Static metadata for one sensor stream.
#[derive(Debug, Clone)]
pub struct StreamDecl {
    pub datatype: DataType,
    pub description: &'static str,
}

/// Shared config keys every sensor kind recognizes (spec.md §3).
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct CommonSensorConfig {
    pub sampling_period: Option<u64>,
    pub run_timeout: Option<u64>,
    pub memory_limit: Option<u64>,
}

impl CommonSensorConfig {
    pub fn from_json(value: &serde_json::Value) -> Self {
        Self {
            sampling_period: value.get("sampling_period").and_then(|v| v.as_u64()),
            run_timeout: value.get("run_timeout").and_then(|v| v.as_u64()),
            memory_limit: value.get("memory_limit").and_then(|v| v.as_u64()),
        }
    }
}

/// One entry in an AgentConfig document (spec.md §3, §6). Unknown
/// per-sensor properties are rejected by `deny_unknown_fields`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SensorDescriptor {
    pub sensor: String,
    pub config_id: String,
    pub target: String,
    pub target_id: String,
    pub config: serde_json::Value,
}

impl SensorDescriptor {
    /// `sensor`/`config_id`/`target`/`target_id` must each be at least two
    /// characters (spec.md §6).
    pub fn validate(&self) -> Result<(), String> {
        for (field, value) in [
            ("sensor", &self.sensor),
            ("config_id", &self.config_id),
            ("target", &self.target),
            ("target_id", &self.target_id),
        ] {
            if value.chars().count() < 2 {
                return Err(format!("`{field}` must be at least 2 characters"));
            }
        }
        Ok(())
    }
}

/// The full remote configuration document, minus the reserved sensors which
/// are split out at load time (spec.md §3). Unknown top-level properties
/// are rejected by `deny_unknown_fields`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    pub sensors: Vec<SensorDescriptor>,
}

impl AgentConfig {
    /// Validates every descriptor and rejects duplicate `config_id`s
    /// (spec.md §3: AgentConfig is unique by config_id).
    pub fn validate(&self) -> Result<(), String> {
        let mut seen = std::collections::HashSet::new();
        for d in &self.sensors {
            d.validate()?;
            if !seen.insert(d.config_id.as_str()) {
                return Err(format!("duplicate config_id `{}`", d.config_id));
            }
        }
        Ok(())
    }

    /// Splits reserved internal sensors (`_error`, `_conf_applied`) out of the
    /// sensor list, returning their config_ids.
    pub fn extract_reserved(&mut self) -> ReservedSensors {
        let mut reserved = ReservedSensors::default();
        self.sensors.retain(|d| match d.sensor.as_str() {
            RESERVED_ERROR_SENSOR => {
                reserved.error_id = Some(d.config_id.clone());
                false
            }
            RESERVED_CONFIG_APPLIED_SENSOR => {
                reserved.config_applied_id = Some(d.config_id.clone());
                false
            }
            _ => true,
        });
        reserved
    }

    pub fn by_config_id(&self) -> HashMap<&str, &SensorDescriptor> {
        self.sensors
            .iter()
            .map(|d| (d.config_id.as_str(), d))
            .collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReservedSensors {
    pub error_id: Option<String>,
    pub config_applied_id: Option<String>,
}
