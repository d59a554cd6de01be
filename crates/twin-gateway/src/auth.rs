//! Authorization context and access token validation.

use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde_json::{Map, Value};
use twin_proto::DeviceId;

use crate::error::{GatewayError, GatewayResult};

/// Proof that a connection belongs to an authenticated device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationContext {
    /// Signed-in device.
    pub device_id: DeviceId,
    /// Owner of the device.
    pub user_id: String,
    /// Access token the device signed in with.
    pub access_token: String,
    /// When the access token expires; `None` for non-expiring tokens.
    pub expires_at: Option<DateTime<Utc>>,
}

impl AuthorizationContext {
    /// Create a context.
    #[must_use]
    pub fn new(
        device_id: DeviceId,
        user_id: impl Into<String>,
        access_token: impl Into<String>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            device_id,
            user_id: user_id.into(),
            access_token: access_token.into(),
            expires_at,
        }
    }

    /// True when the token is set and not expired at `now`.
    #[must_use]
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        !self.access_token.is_empty() && self.expires_at.is_none_or(|at| now <= at)
    }

    /// Check validity against the current time.
    ///
    /// # Errors
    ///
    /// Returns `Unauthenticated` when the token is empty or expired.
    pub fn validate(&self) -> GatewayResult<()> {
        if self.access_token.is_empty() {
            return Err(GatewayError::Unauthenticated("invalid access token".to_string()));
        }
        if !self.is_valid_at(Utc::now()) {
            return Err(GatewayError::Unauthenticated("token is expired".to_string()));
        }
        Ok(())
    }
}

/// Claims carried by a validated access token.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Claims(Map<String, Value>);

impl Claims {
    /// Wrap a claim map.
    #[must_use]
    pub const fn new(claims: Map<String, Value>) -> Self {
        Self(claims)
    }

    /// String value of a claim.
    #[must_use]
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.0.get(name).and_then(Value::as_str)
    }

    /// Expiry from the `exp` claim.
    #[must_use]
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        let exp = self.0.get("exp")?.as_i64()?;
        Utc.timestamp_opt(exp, 0).single()
    }

    /// Check the owner and (optionally) device ID claims.
    ///
    /// # Errors
    ///
    /// Returns `Unauthorized` if the owner claim is missing or differs from
    /// `user_id` (when given), or the device ID claim differs from `device_id`.
    pub fn check_owner_and_device(
        &self,
        owner_claim: &str,
        device_id_claim: Option<&str>,
        user_id: Option<&str>,
        device_id: &DeviceId,
    ) -> GatewayResult<String> {
        let owner = self
            .get_str(owner_claim)
            .filter(|o| !o.is_empty())
            .ok_or_else(|| {
                GatewayError::Unauthorized(format!("claim '{owner_claim}' was not found"))
            })?;
        if let Some(user_id) = user_id.filter(|u| !u.is_empty()) {
            if user_id != owner {
                return Err(GatewayError::Unauthorized(format!(
                    "invalid owner: expected '{owner}', got '{user_id}'"
                )));
            }
        }
        if let Some(claim) = device_id_claim {
            let claimed = self.get_str(claim).unwrap_or_default();
            if claimed != device_id.as_str() {
                return Err(GatewayError::Unauthorized(format!(
                    "claim '{claim}' ('{claimed}') does not match device ID '{device_id}'"
                )));
            }
        }
        Ok(owner.to_string())
    }

    /// Underlying claim map.
    #[must_use]
    pub const fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }
}

/// Validates access tokens presented by devices.
pub trait TokenValidator: Send + Sync {
    /// Validate a token and return its claims.
    ///
    /// # Errors
    ///
    /// Returns `Unauthorized` if the token is invalid or expired.
    fn validate(&self, token: &str) -> GatewayResult<Claims>;
}

/// HMAC-SHA256 JWT validator.
pub struct JwtValidator {
    key: DecodingKey,
    issuer: Option<String>,
}

impl JwtValidator {
    /// Create a validator for tokens signed with `secret`.
    #[must_use]
    pub fn new(secret: &[u8]) -> Self {
        Self {
            key: DecodingKey::from_secret(secret),
            issuer: None,
        }
    }

    /// Require the `iss` claim to equal `issuer`.
    #[must_use]
    pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.issuer = Some(issuer.into());
        self
    }

    fn validation(&self) -> Validation {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_required_spec_claims::<&str>(&[]);
        validation.validate_aud = false;
        if let Some(ref issuer) = self.issuer {
            validation.set_issuer(&[issuer]);
        }
        validation
    }
}

impl std::fmt::Debug for JwtValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtValidator")
            .field("issuer", &self.issuer)
            .field("key", &"[REDACTED]")
            .finish()
    }
}

impl TokenValidator for JwtValidator {
    fn validate(&self, token: &str) -> GatewayResult<Claims> {
        if token.is_empty() {
            return Err(GatewayError::Unauthorized("empty access token".to_string()));
        }
        let data = decode::<Map<String, Value>>(token, &self.key, &self.validation())
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                    GatewayError::Unauthorized("token is expired".to_string())
                }
                _ => GatewayError::Unauthorized(format!("invalid token: {e}")),
            })?;
        Ok(Claims::new(data.claims))
    }
}

/// Mints HMAC-SHA256 JWTs; used by the local identity provider.
pub struct JwtSigner {
    key: EncodingKey,
    issuer: Option<String>,
}

impl JwtSigner {
    /// Create a signer using `secret`.
    #[must_use]
    pub fn new(secret: &[u8]) -> Self {
        Self {
            key: EncodingKey::from_secret(secret),
            issuer: None,
        }
    }

    /// Stamp tokens with an `iss` claim.
    #[must_use]
    pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.issuer = Some(issuer.into());
        self
    }

    /// Sign a claim set.
    ///
    /// # Errors
    ///
    /// Returns an internal error if encoding fails.
    pub fn sign(&self, mut claims: Map<String, Value>) -> GatewayResult<String> {
        if let Some(ref issuer) = self.issuer {
            claims.insert("iss".to_string(), Value::String(issuer.clone()));
        }
        encode(&Header::new(Algorithm::HS256), &claims, &self.key)
            .map_err(|e| GatewayError::Internal(format!("cannot sign token: {e}")))
    }
}

impl std::fmt::Debug for JwtSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtSigner")
            .field("issuer", &self.issuer)
            .field("key", &"[REDACTED]")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    const SECRET: &[u8] = b"test-secret";

    fn claims(value: serde_json::Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    // ==================== AuthorizationContext Tests ====================

    #[test]
    fn test_context_without_expiry_is_valid() {
        let ctx = AuthorizationContext::new(DeviceId::new("d"), "u", "tok", None);
        assert!(ctx.validate().is_ok());
    }

    #[test]
    fn test_context_empty_token_invalid() {
        let ctx = AuthorizationContext::new(DeviceId::new("d"), "u", "", None);
        assert!(matches!(ctx.validate(), Err(GatewayError::Unauthenticated(_))));
    }

    #[test]
    fn test_context_expired() {
        let now = Utc::now();
        let ctx = AuthorizationContext::new(
            DeviceId::new("d"),
            "u",
            "tok",
            Some(now - Duration::seconds(1)),
        );
        assert!(!ctx.is_valid_at(now));
        assert!(ctx.is_valid_at(now - Duration::seconds(5)));
    }

    // ==================== Claims Tests ====================

    #[test]
    fn test_claims_owner_and_device() {
        let c = Claims::new(claims(json!({"sub": "owner", "di": "dev"})));
        let owner = c
            .check_owner_and_device("sub", Some("di"), Some("owner"), &DeviceId::new("dev"))
            .unwrap();
        assert_eq!(owner, "owner");
    }

    #[test]
    fn test_claims_owner_mismatch() {
        let c = Claims::new(claims(json!({"sub": "owner"})));
        let err = c
            .check_owner_and_device("sub", None, Some("other"), &DeviceId::new("dev"))
            .unwrap_err();
        assert!(matches!(err, GatewayError::Unauthorized(_)));
    }

    #[test]
    fn test_claims_device_mismatch() {
        let c = Claims::new(claims(json!({"sub": "owner", "di": "dev-a"})));
        assert!(c
            .check_owner_and_device("sub", Some("di"), None, &DeviceId::new("dev-b"))
            .is_err());
    }

    #[test]
    fn test_claims_missing_owner() {
        let c = Claims::new(claims(json!({"di": "dev"})));
        assert!(c
            .check_owner_and_device("sub", None, None, &DeviceId::new("dev"))
            .is_err());
    }

    // ==================== JWT Tests ====================

    #[test]
    fn test_jwt_sign_and_validate() {
        let exp = (Utc::now() + Duration::hours(1)).timestamp();
        let token = JwtSigner::new(SECRET)
            .with_issuer("local")
            .sign(claims(json!({"sub": "owner", "exp": exp})))
            .unwrap();
        let validated = JwtValidator::new(SECRET)
            .with_issuer("local")
            .validate(&token)
            .unwrap();
        assert_eq!(validated.get_str("sub"), Some("owner"));
        assert_eq!(validated.expires_at().map(|t| t.timestamp()), Some(exp));
    }

    #[test]
    fn test_jwt_without_exp_is_accepted() {
        let token = JwtSigner::new(SECRET)
            .sign(claims(json!({"sub": "owner"})))
            .unwrap();
        let validated = JwtValidator::new(SECRET).validate(&token).unwrap();
        assert!(validated.expires_at().is_none());
    }

    #[test]
    fn test_jwt_wrong_secret_rejected() {
        let token = JwtSigner::new(SECRET)
            .sign(claims(json!({"sub": "owner"})))
            .unwrap();
        assert!(JwtValidator::new(b"other").validate(&token).is_err());
    }

    #[test]
    fn test_jwt_expired_rejected() {
        let exp = (Utc::now() - Duration::hours(1)).timestamp();
        let token = JwtSigner::new(SECRET)
            .sign(claims(json!({"sub": "owner", "exp": exp})))
            .unwrap();
        let err = JwtValidator::new(SECRET).validate(&token).unwrap_err();
        assert!(err.to_string().contains("expired"));
    }

    #[test]
    fn test_jwt_debug_redacts_key() {
        let debug = format!("{:?}", JwtValidator::new(SECRET));
        assert!(debug.contains("REDACTED"));
    }
}
