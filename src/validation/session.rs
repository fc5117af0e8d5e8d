use std::collections::BTreeMap;

use garde::Validate;
use serde::Deserialize;

use crate::error::{AppError, Result};
use crate::services::orchestrator::CreateSessionParams;

/// Body of the internal create-session call.
#[derive(Debug, Deserialize, Validate)]
pub struct CreateSessionRequest {
    #[garde(length(min = 1, max = 128), custom(no_surrounding_whitespace))]
    pub user_id: String,
    #[serde(default)]
    #[garde(length(max = 255))]
    pub device_id: String,
    #[serde(default)]
    #[garde(length(max = 64))]
    pub ip_address: String,
    #[serde(default)]
    #[garde(length(max = 512))]
    pub user_agent: String,
    #[serde(default)]
    #[garde(length(max = 255))]
    pub geo_location: String,
    #[serde(default)]
    #[garde(length(max = 4096))]
    pub device_meta: String,
    #[serde(default)]
    #[garde(length(max = 64))]
    pub purpose: String,
    #[serde(default)]
    #[garde(skip)]
    pub is_temp: bool,
    #[serde(default)]
    #[garde(skip)]
    pub is_single_use: bool,
    #[serde(default)]
    #[garde(custom(bounded_extra_data))]
    pub extra_data: BTreeMap<String, String>,
}

/// Body of the internal validate call.
#[derive(Debug, Deserialize, Validate)]
pub struct ValidateSessionRequest {
    #[garde(length(min = 1, max = 8192))]
    pub token: String,
}

fn no_surrounding_whitespace(value: &str, _: &()) -> garde::Result {
    if value.trim() != value {
        return Err(garde::Error::new("must not start or end with whitespace"));
    }
    Ok(())
}

fn bounded_extra_data(value: &BTreeMap<String, String>, _: &()) -> garde::Result {
    if value.len() > 32 {
        return Err(garde::Error::new("at most 32 extra_data entries"));
    }
    if value.iter().any(|(k, v)| k.len() > 64 || v.len() > 1024) {
        return Err(garde::Error::new("extra_data entry too long"));
    }
    Ok(())
}

/// Runs the derived checks, mapping the report onto a validation error.
///
/// # Arguments
///
/// * `payload` - The deserialized request body.
///
/// # Returns
///
/// A `Result<()>` indicating whether the payload is valid.
pub fn validate<T: Validate<Context = ()>>(payload: &T) -> Result<()> {
    payload
        .validate()
        .map_err(|report| AppError::Validation(report.to_string()))
}

impl From<CreateSessionRequest> for CreateSessionParams {
    fn from(req: CreateSessionRequest) -> Self {
        Self {
            user_id: req.user_id,
            device_id: req.device_id,
            ip_address: req.ip_address,
            user_agent: req.user_agent,
            geo_location: req.geo_location,
            device_meta: req.device_meta,
            purpose: req.purpose,
            is_temp: req.is_temp,
            is_single_use: req.is_single_use,
            extra_data: req.extra_data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(user_id: &str) -> CreateSessionRequest {
        serde_json::from_value(serde_json::json!({ "user_id": user_id })).unwrap()
    }

    #[test]
    fn minimal_body_is_accepted() {
        let req = request("42");
        assert!(validate(&req).is_ok());
        assert!(!req.is_temp);
        assert!(req.device_id.is_empty());
    }

    #[test]
    fn empty_or_padded_user_id_is_rejected() {
        assert!(matches!(validate(&request("")), Err(AppError::Validation(_))));
        assert!(matches!(validate(&request(" 42")), Err(AppError::Validation(_))));
    }

    #[test]
    fn oversized_fields_are_rejected() {
        let mut req = request("42");
        req.device_id = "d".repeat(256);
        assert!(validate(&req).is_err());
    }

    #[test]
    fn empty_token_is_rejected() {
        let req = ValidateSessionRequest { token: String::new() };
        assert!(validate(&req).is_err());
    }
}
