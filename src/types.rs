//! Core types for the attendance monitor.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Outcome of a biometric scan.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessResult {
    Granted,
    Denied,
}

impl AccessResult {
    /// Stable token used in fingerprint input and display.
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessResult::Granted => "granted",
            AccessResult::Denied => "denied",
        }
    }

    /// Map the backend's numeric `AccessResult` field (1 = granted).
    pub fn from_backend_code(code: i64) -> Self {
        if code == 1 {
            AccessResult::Granted
        } else {
            AccessResult::Denied
        }
    }
}

impl fmt::Display for AccessResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One biometric check-in/out event. Immutable once constructed; produced by
/// the snapshot collaborator from raw backend payloads, never by the core.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AttendanceEvent {
    /// Scan instant, source clock.
    pub timestamp: DateTime<Utc>,
    pub employee_id: String,
    pub employee_name: String,
    pub temperature: Option<f64>,
    /// Scanner device name as reported by the backend.
    pub device_id: String,
    pub result: AccessResult,
}

impl AttendanceEvent {
    /// Digest identifying the physical scan this event represents.
    ///
    /// Derived from `(employee_id, timestamp, result)` only, so two events
    /// for the same scan fingerprint identically even when temperature or
    /// device formatting differs between fetches.
    pub fn fingerprint(&self) -> Fingerprint {
        let key = format!(
            "{}\n{}\n{}",
            self.employee_id.trim(),
            self.timestamp.timestamp_millis(),
            self.result.as_str(),
        );
        Fingerprint::from_bytes(key.as_bytes())
    }

    /// Build an event from one backend JSON record (DataTables row shape).
    ///
    /// Returns `None` when required fields are absent; callers treat such
    /// rows as noise, not as errors.
    pub fn from_backend_record(record: &serde_json::Value) -> Option<Self> {
        let timestamp = parse_net_date(record.get("DateTimeStamp")?.as_str()?)?;
        let result = AccessResult::from_backend_code(record.get("AccessResult")?.as_i64()?);
        Some(Self {
            timestamp,
            employee_id: record.get("EmployeeID")?.as_str()?.to_string(),
            employee_name: record.get("Name")?.as_str()?.to_string(),
            temperature: record.get("Temperature").and_then(|t| t.as_f64()),
            device_id: record
                .get("MachineName")
                .and_then(|m| m.as_str())
                .unwrap_or_default()
                .to_string(),
            result,
        })
    }
}

/// Parse the backend's .NET date format, e.g. `/Date(1634567890123)/`.
pub fn parse_net_date(s: &str) -> Option<DateTime<Utc>> {
    let start = s.find("/Date(")? + "/Date(".len();
    let end = s[start..].find(')')? + start;
    let millis: i64 = s[start..end].parse().ok()?;
    Utc.timestamp_millis_opt(millis).single()
}

/// Fixed-width digest identifying one physical scan (SHA-256).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint(pub [u8; 32]);

impl Fingerprint {
    /// Compute fingerprint from canonical key bytes.
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Fingerprint(hasher.finalize().into())
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex string.
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(Fingerprint(arr))
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({}...)", &self.to_hex()[..8])
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}
