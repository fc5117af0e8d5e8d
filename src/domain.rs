use std::fmt;

use serde::{Deserialize, Serialize};

/// A trust domain. Each domain has its own signing keys, issuer/audience
/// and session table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Domain {
    User,
    Partner,
    Admin,
}

impl Domain {
    /// Order in which verifiers are tried when resolving a credential.
    /// If two domains ever share signing material, the earlier one wins.
    pub const RESOLUTION_ORDER: [Domain; 3] = [Domain::User, Domain::Partner, Domain::Admin];

    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::User => "user",
            Domain::Partner => "partner",
            Domain::Admin => "admin",
        }
    }

    /// The domain a request path belongs to. Paths without a domain prefix
    /// belong to `User`.
    pub fn from_path(path: &str) -> Domain {
        if path.starts_with("/admin/") {
            Domain::Admin
        } else if path.starts_with("/partner/") {
            Domain::Partner
        } else {
            Domain::User
        }
    }

    /// The table holding this domain's sessions.
    pub fn sessions_table(&self) -> &'static str {
        match self {
            Domain::User => "user_sessions",
            Domain::Partner => "partner_sessions",
            Domain::Admin => "admin_sessions",
        }
    }

    /// Prefix used for this domain's environment variables.
    pub fn env_prefix(&self) -> &'static str {
        match self {
            Domain::User => "USER",
            Domain::Partner => "PARTNER",
            Domain::Admin => "ADMIN",
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
