//! Authenticated sessions.
//!
//! A session is bound to exactly one connection and replaced wholesale on
//! re-login.  Expiry is lazy: it is detected on use, never by a timer.

use gate_protocol::Tier;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const ROLE_SUPERADMIN: &str = "superadmin";
pub const ROLE_ADMIN: &str = "admin";
pub const ROLE_WRITER: &str = "writer";
pub const ROLE_READER: &str = "reader";

/// An authenticated identity bound to a connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub user_id: String,
    pub roles: Vec<String>,
    /// Epoch milliseconds; `None` means the session does not expire.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl Session {
    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at.is_some_and(|at| at <= now_ms)
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    /// Highest tier granted by the built-in roles, or `None` when the
    /// session carries only custom roles (which bypass tier gating).
    pub fn builtin_ceiling(&self) -> Option<Tier> {
        if self.has_role(ROLE_ADMIN) {
            Some(Tier::Admin)
        } else if self.has_role(ROLE_WRITER) {
            Some(Tier::Write)
        } else if self.has_role(ROLE_READER) {
            Some(Tier::Read)
        } else {
            None
        }
    }
}
