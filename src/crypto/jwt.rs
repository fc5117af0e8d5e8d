//! Session token issuance and verification.
//!
//! Every domain signs with its own key and stamps its own issuer and
//! audience, so a token only verifies against the domain that issued it.
//! [`VerifierSet::resolve`] discovers the domain of an incoming token by
//! trying each domain's verifier in [`Domain::RESOLUTION_ORDER`].

use std::collections::BTreeMap;
use std::time::Duration;

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use uuid::Uuid;

use crate::config::{JwtConfig, KeyMaterial};
use crate::domain::Domain;
use crate::error::Result;
use crate::models::claims::Claims;

/// A freshly signed token and its lifetime.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub ttl: Duration,
}

/// Signs session tokens for one domain.
pub struct TokenIssuer {
    domain: Domain,
    header: Header,
    key: EncodingKey,
    issuer: String,
    audience: String,
    access_ttl: Duration,
    temp_ttl: Duration,
}

impl TokenIssuer {
    pub fn new(
        domain: Domain,
        config: &JwtConfig,
        access_ttl: Duration,
        temp_ttl: Duration,
    ) -> Result<Self> {
        let (algorithm, key) = match &config.keys {
            KeyMaterial::Hmac(secret) => (Algorithm::HS256, EncodingKey::from_secret(secret)),
            KeyMaterial::Ed25519 { private_pem, .. } => {
                (Algorithm::EdDSA, EncodingKey::from_ed_pem(private_pem)?)
            }
        };

        Ok(Self {
            domain,
            header: Header::new(algorithm),
            key,
            issuer: config.issuer.clone(),
            audience: config.audience.clone(),
            access_ttl,
            temp_ttl,
        })
    }

    pub fn domain(&self) -> Domain {
        self.domain
    }

    /// Signs a token for `user_id`. Temp tokens live for the temp-session
    /// TTL, all others for the access TTL.
    pub fn generate(
        &self,
        user_id: &str,
        role: &str,
        device: &str,
        purpose: &str,
        is_temp: bool,
        extra_data: &BTreeMap<String, String>,
    ) -> Result<IssuedToken> {
        let ttl = if is_temp { self.temp_ttl } else { self.access_ttl };
        let now = chrono::Utc::now().timestamp();

        let claims = Claims {
            user_id: user_id.to_string(),
            role: role.to_string(),
            device: device.to_string(),
            session_purpose: purpose.to_string(),
            is_temp,
            extra_data: extra_data.clone(),
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
            exp: now + ttl.as_secs() as i64,
            iat: now,
            jti: Uuid::new_v4().to_string(),
        };

        let token = encode(&self.header, &claims, &self.key)?;
        tracing::debug!(domain = %self.domain, user_id, is_temp, "🔏 Token issued");

        Ok(IssuedToken { token, ttl })
    }
}

/// Verifies tokens for one domain against a fixed key, issuer and audience.
pub struct TokenVerifier {
    domain: Domain,
    key: DecodingKey,
    validation: Validation,
}

impl TokenVerifier {
    pub fn new(domain: Domain, config: &JwtConfig) -> Result<Self> {
        let (algorithm, key) = match &config.keys {
            KeyMaterial::Hmac(secret) => (Algorithm::HS256, DecodingKey::from_secret(secret)),
            KeyMaterial::Ed25519 { public_pem, .. } => {
                (Algorithm::EdDSA, DecodingKey::from_ed_pem(public_pem)?)
            }
        };

        let mut validation = Validation::new(algorithm);
        validation.set_issuer(&[config.issuer.as_str()]);
        validation.set_audience(&[config.audience.as_str()]);
        validation.set_required_spec_claims(&["exp", "iss", "aud"]);

        Ok(Self {
            domain,
            key,
            validation,
        })
    }

    pub fn domain(&self) -> Domain {
        self.domain
    }

    /// Checks signature, expiry, issuer and audience.
    pub fn parse_and_validate(
        &self,
        token: &str,
    ) -> std::result::Result<Claims, jsonwebtoken::errors::Error> {
        decode::<Claims>(token, &self.key, &self.validation).map(|data| data.claims)
    }
}

/// The verifiers of every domain, tried in resolution order.
pub struct VerifierSet {
    verifiers: Vec<TokenVerifier>,
}

impl VerifierSet {
    /// Orders `verifiers` by [`Domain::RESOLUTION_ORDER`].
    pub fn new(mut verifiers: Vec<TokenVerifier>) -> Self {
        verifiers.sort_by_key(|v| {
            Domain::RESOLUTION_ORDER
                .iter()
                .position(|d| *d == v.domain)
                .unwrap_or(usize::MAX)
        });
        Self { verifiers }
    }

    /// Returns the first domain whose verifier accepts `token`.
    pub fn resolve(&self, token: &str) -> Option<(Domain, Claims)> {
        self.verifiers.iter().find_map(|verifier| {
            match verifier.parse_and_validate(token) {
                Ok(claims) => Some((verifier.domain, claims)),
                Err(e) => {
                    tracing::trace!(domain = %verifier.domain, "Token rejected: {}", e);
                    None
                }
            }
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn jwt_config(domain: Domain) -> JwtConfig {
        let secret = format!("{}-secret-that-is-long-enough-for-hmac", domain);
        JwtConfig::hmac(
            secret.as_bytes(),
            format!("{}-auth", domain),
            format!("{}-api", domain),
        )
    }

    pub(crate) fn issuer(domain: Domain) -> TokenIssuer {
        TokenIssuer::new(
            domain,
            &jwt_config(domain),
            Duration::from_secs(3600),
            Duration::from_secs(900),
        )
        .unwrap()
    }

    pub(crate) fn verifiers() -> VerifierSet {
        VerifierSet::new(
            Domain::RESOLUTION_ORDER
                .iter()
                .map(|d| TokenVerifier::new(*d, &jwt_config(*d)).unwrap())
                .collect(),
        )
    }

    #[test]
    fn issued_token_round_trips_its_claims() {
        let mut extra = BTreeMap::new();
        extra.insert("order_id".to_string(), "o-1".to_string());

        let issued = issuer(Domain::User)
            .generate("42", "trader", "phone", "login", false, &extra)
            .unwrap();
        assert_eq!(issued.ttl, Duration::from_secs(3600));

        let verifier = TokenVerifier::new(Domain::User, &jwt_config(Domain::User)).unwrap();
        let claims = verifier.parse_and_validate(&issued.token).unwrap();
        assert_eq!(claims.user_id, "42");
        assert_eq!(claims.role, "trader");
        assert_eq!(claims.extra_data.get("order_id").map(String::as_str), Some("o-1"));
        assert!(!claims.is_temp);
    }

    #[test]
    fn temp_tokens_use_the_temp_ttl() {
        let issued = issuer(Domain::User)
            .generate("42", "any", "phone", "password_reset", true, &BTreeMap::new())
            .unwrap();
        assert_eq!(issued.ttl, Duration::from_secs(900));
    }

    #[test]
    fn resolution_finds_the_issuing_domain() {
        let set = verifiers();
        for domain in Domain::RESOLUTION_ORDER {
            let issued = issuer(domain)
                .generate("7", "any", "d", "", false, &BTreeMap::new())
                .unwrap();
            let (resolved, claims) = set.resolve(&issued.token).unwrap();
            assert_eq!(resolved, domain);
            assert_eq!(claims.user_id, "7");
        }
    }

    #[test]
    fn foreign_and_garbage_tokens_do_not_resolve() {
        let foreign = JwtConfig::hmac(b"someone-else-entirely-different-key", "x", "y");
        let token = TokenIssuer::new(
            Domain::User,
            &foreign,
            Duration::from_secs(60),
            Duration::from_secs(60),
        )
        .unwrap()
        .generate("1", "any", "d", "", false, &BTreeMap::new())
        .unwrap()
        .token;

        let set = verifiers();
        assert!(set.resolve(&token).is_none());
        assert!(set.resolve("not-a-token").is_none());
    }

    #[test]
    fn expired_token_fails() {
        let config = jwt_config(Domain::User);
        let now = chrono::Utc::now().timestamp();
        let claims = Claims {
            user_id: "1".into(),
            role: "any".into(),
            device: "d".into(),
            session_purpose: String::new(),
            is_temp: false,
            extra_data: BTreeMap::new(),
            iss: config.issuer.clone(),
            aud: config.audience.clone(),
            // well past the default 60-second leeway
            exp: now - 300,
            iat: now - 600,
            jti: Uuid::new_v4().to_string(),
        };
        let KeyMaterial::Hmac(secret) = &config.keys else {
            unreachable!()
        };
        let token = encode(&Header::default(), &claims, &EncodingKey::from_secret(secret)).unwrap();

        let verifier = TokenVerifier::new(Domain::User, &config).unwrap();
        assert!(verifier.parse_and_validate(&token).is_err());
    }
}
