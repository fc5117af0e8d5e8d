use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::models::session::SessionKind;

/// JWT claims embedded in every session token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    pub user_id: String,
    pub role: String,
    pub device: String,
    #[serde(default)]
    pub session_purpose: String,
    #[serde(default)]
    pub is_temp: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra_data: BTreeMap<String, String>,
    pub iss: String,
    pub aud: String,
    /// Expiration time (UTC Unix timestamp).
    pub exp: i64,
    /// Issued-at time (UTC Unix timestamp).
    pub iat: i64,
    /// Unique token identifier, so two tokens issued in the same second differ.
    pub jti: String,
}

impl Claims {
    pub fn session_kind(&self) -> SessionKind {
        SessionKind::from_temp(self.is_temp)
    }
}
