use std::collections::BTreeMap;

use serde::Serialize;

use crate::domain::Domain;
use crate::models::session::SessionKind;

/// What the gateway learned about the caller, available to handlers
/// through `Extension<RequestContext>`.
#[derive(Debug, Clone, Serialize)]
pub struct RequestContext {
    pub user_id: String,
    #[serde(skip_serializing)]
    pub token: String,
    pub device_id: String,
    pub role: String,
    pub user_type: Domain,
    pub session_type: SessionKind,
    pub session_purpose: String,
    pub extra_data: BTreeMap<String, String>,
}
