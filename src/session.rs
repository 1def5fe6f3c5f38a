//! Boundary traits for the external collaborators.
//!
//! Credential acquisition and snapshot parsing live outside this crate; the
//! monitor consumes them through these traits and never sees login forms or
//! raw HTML.

use crate::error::Result;
use crate::types::AttendanceEvent;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Login credentials for the backend.
#[derive(Clone)]
pub struct Credentials {
    pub employee_id: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("employee_id", &self.employee_id)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl Credentials {
    /// Non-secret identification passed through reauth notifications.
    pub fn hint(&self) -> CredentialsHint {
        CredentialsHint {
            employee_id: self.employee_id.clone(),
        }
    }
}

/// Non-secret credential hint surfaced with reauth notifications.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CredentialsHint {
    pub employee_id: String,
}

/// Authenticated transport context: whatever cookie state the realtime
/// channel and snapshot fetches need to pass the backend's checks.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuthContext {
    /// Backend origin, e.g. `https://attendance.example.gov`.
    pub base_url: String,
    cookies: Vec<(String, String)>,
}

impl AuthContext {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            cookies: Vec::new(),
        }
    }

    pub fn with_cookie(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.cookies.push((name.into(), value.into()));
        self
    }

    pub fn cookies(&self) -> &[(String, String)] {
        &self.cookies
    }

    /// `Cookie:` header value for outgoing requests.
    pub fn cookie_header(&self) -> String {
        self.cookies
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Supplies an authenticated transport context on demand.
///
/// `login` may be slow (seconds); the supervisor always invokes it off the
/// channel's receive thread.
pub trait SessionProvider: Send {
    fn login(&mut self, credentials: &Credentials) -> Result<AuthContext>;
}

/// Fetches the authoritative event list.
///
/// Used by the polling fallback and as the response to every realtime
/// refresh signal. Implementations return `MonitorError::AuthExpired` when
/// the backend rejects the session, which escalates to a full reauth.
pub trait SnapshotSource: Send {
    fn fetch_snapshot(&mut self, auth: &AuthContext) -> Result<Vec<AttendanceEvent>>;
}
