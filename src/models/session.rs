use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::Domain;

/// Sentinel stored when the client did not report a device or address.
pub const UNKNOWN: &str = "unknown";

/// Whether a session is long-lived or TTL-bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    Main,
    Temp,
}

impl SessionKind {
    pub fn from_temp(is_temp: bool) -> Self {
        if is_temp { SessionKind::Temp } else { SessionKind::Main }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionKind::Main => "main",
            SessionKind::Temp => "temp",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "main" => Some(SessionKind::Main),
            "temp" => Some(SessionKind::Temp),
            _ => None,
        }
    }
}

/// Represents a persisted (user, device) login.
///
/// Main sessions never expire on their own (`expires_at` is `None`); temp
/// sessions always carry an expiry. A row is unique per
/// `(user_id, device_id, is_temp)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub user_id: String,
    pub auth_token: String,
    pub device_id: String,
    pub ip_address: String,
    pub user_agent: String,
    pub geo_location: String,
    /// Client-reported device details, stored as JSON text.
    pub device_meta: String,
    pub is_active: bool,
    pub is_single_use: bool,
    pub is_temp: bool,
    pub is_used: bool,
    pub purpose: String,
    pub last_seen_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Session {
    /// The id of the row a `(domain, user, device, class)` slot maps to.
    /// Re-issuing into the same slot keeps the id, so the id handed out
    /// with the newest token always addresses the stored row.
    pub fn stable_id(domain: Domain, user_id: &str, device_id: &str, is_temp: bool) -> Uuid {
        // The length prefix keeps `("a:b", "c")` and `("a", "b:c")` apart.
        let name = format!(
            "{}:{}:{}:{}:{}",
            domain,
            user_id.len(),
            user_id,
            device_id,
            SessionKind::from_temp(is_temp).as_str()
        );
        Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes())
    }

    pub fn kind(&self) -> SessionKind {
        SessionKind::from_temp(self.is_temp)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// Active and not past its expiry.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.is_active && !self.is_expired(now)
    }

    /// Applies an incoming upsert onto an existing row.
    ///
    /// Empty strings never replace stored values; flags and timestamps
    /// always take the incoming value. The row keeps its `id` and
    /// `created_at`.
    pub fn merge_from(&mut self, incoming: Session) {
        fn keep_or_replace(current: &mut String, incoming: String) {
            if !incoming.is_empty() {
                *current = incoming;
            }
        }

        keep_or_replace(&mut self.auth_token, incoming.auth_token);
        keep_or_replace(&mut self.ip_address, incoming.ip_address);
        keep_or_replace(&mut self.user_agent, incoming.user_agent);
        keep_or_replace(&mut self.geo_location, incoming.geo_location);
        keep_or_replace(&mut self.device_meta, incoming.device_meta);
        keep_or_replace(&mut self.purpose, incoming.purpose);

        self.is_active = incoming.is_active;
        self.is_single_use = incoming.is_single_use;
        self.is_used = incoming.is_used;
        self.last_seen_at = incoming.last_seen_at;
        self.expires_at = incoming.expires_at;
    }
}

#[cfg(test)]
pub(crate) fn sample(user_id: &str, device_id: &str, is_temp: bool) -> Session {
    let now = Utc::now();
    Session {
        id: Uuid::new_v4(),
        user_id: user_id.to_string(),
        auth_token: format!("token-{}", Uuid::new_v4()),
        device_id: device_id.to_string(),
        ip_address: "10.0.0.1".to_string(),
        user_agent: "test-agent".to_string(),
        geo_location: String::new(),
        device_meta: String::new(),
        is_active: true,
        is_single_use: false,
        is_temp,
        is_used: false,
        purpose: String::new(),
        last_seen_at: now,
        created_at: now,
        expires_at: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_keeps_existing_strings_when_incoming_is_empty() {
        let mut existing = sample("7", "phone", false);
        existing.geo_location = "Nairobi".to_string();
        let original_id = existing.id;

        let mut incoming = sample("7", "phone", false);
        incoming.user_agent = String::new();
        incoming.geo_location = String::new();
        incoming.is_active = false;

        existing.merge_from(incoming.clone());

        assert_eq!(existing.id, original_id);
        assert_eq!(existing.user_agent, "test-agent");
        assert_eq!(existing.geo_location, "Nairobi");
        assert_eq!(existing.auth_token, incoming.auth_token);
        assert!(!existing.is_active);
    }

    #[test]
    fn stable_id_depends_on_every_part_of_the_slot() {
        let id = Session::stable_id(Domain::User, "42", "phone", false);
        assert_eq!(id, Session::stable_id(Domain::User, "42", "phone", false));
        assert_ne!(id, Session::stable_id(Domain::Admin, "42", "phone", false));
        assert_ne!(id, Session::stable_id(Domain::User, "42", "phone", true));
        assert_ne!(id, Session::stable_id(Domain::User, "43", "phone", false));
        assert_ne!(
            Session::stable_id(Domain::User, "a:b", "c", false),
            Session::stable_id(Domain::User, "a", "b:c", false)
        );
    }

    #[test]
    fn expiry_only_applies_when_set() {
        let now = Utc::now();
        let mut session = sample("1", "d", true);
        assert!(!session.is_expired(now));

        session.expires_at = Some(now - chrono::Duration::seconds(1));
        assert!(session.is_expired(now));
        assert!(!session.is_live(now));
    }
}
