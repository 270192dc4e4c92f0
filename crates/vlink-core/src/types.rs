//! Shared types returned to callers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::connection::ConnectionState;
use crate::error::{LinkError, Result};
use crate::transport::Advertisement;

/// Parsed result of a state query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleState {
    /// VIN of the vehicle that answered.
    pub vin: String,
    /// When the state was fetched.
    pub fetched_at: DateTime<Utc>,
    /// The state document as reported by the vehicle.
    pub data: Map<String, Value>,
}

impl VehicleState {
    /// Parses a state blob returned by the transport.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::InvalidResponse`] if the blob is not a JSON object.
    pub fn from_blob(vin: &str, blob: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(blob)
            .map_err(|err| LinkError::InvalidResponse(format!("state is not JSON: {err}")))?;
        match value {
            Value::Object(data) => Ok(Self {
                vin: vin.to_owned(),
                fetched_at: Utc::now(),
                data,
            }),
            other => Err(LinkError::InvalidResponse(format!(
                "expected a JSON object, got {}",
                json_kind(&other)
            ))),
        }
    }

    /// Looks up a top-level field.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Looks up a boolean field.
    #[must_use]
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(Value::as_bool)
    }

    /// Looks up a numeric field.
    #[must_use]
    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(Value::as_f64)
    }
}

const fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Snapshot of a connection for status reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    /// VIN the connection targets.
    pub vin: String,
    /// Lifecycle state.
    pub state: ConnectionState,
    /// Whether a session is open.
    pub session_active: bool,
    /// When the current session became active.
    pub connected_at: Option<DateTime<Utc>>,
    /// Most recent connection failure.
    pub last_error: Option<String>,
    /// The device found by the last successful scan.
    pub device: Option<Advertisement>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_from_object() {
        let state =
            VehicleState::from_blob("5YJ3E1EA4KF000001", br#"{"is_climate_on":true,"inside_temp":19.5}"#)
                .unwrap();
        assert_eq!(state.vin, "5YJ3E1EA4KF000001");
        assert_eq!(state.get_bool("is_climate_on"), Some(true));
        assert_eq!(state.get_f64("inside_temp"), Some(19.5));
        assert!(state.get("missing").is_none());
    }

    #[test]
    fn test_state_rejects_non_objects() {
        let err = VehicleState::from_blob("VIN", b"[1,2]").unwrap_err();
        assert!(matches!(err, LinkError::InvalidResponse(ref msg) if msg.contains("an array")));

        let err = VehicleState::from_blob("VIN", b"not json").unwrap_err();
        assert_eq!(err.error_code(), "INVALID_RESPONSE");
    }
}
