//! Local OAuth identity provider issuing signed JWTs.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::auth::JwtSigner;
use crate::backend::{BoxFuture, IdentityProvider, TokenGrant};
use crate::config::DEFAULT_OWNER_CLAIM;
use crate::error::{GatewayError, GatewayResult};

/// Identity provider that mints tokens itself.
///
/// Authorization codes and refresh tokens are single use.
pub struct LocalIdentityProvider {
    name: String,
    signer: JwtSigner,
    owner_claim: String,
    token_ttl: Option<Duration>,
    codes: Mutex<HashMap<String, String>>,
    refresh_tokens: Mutex<HashMap<String, String>>,
}

impl LocalIdentityProvider {
    /// Create a provider minting tokens with `signer`; tokens never expire.
    #[must_use]
    pub fn new(name: impl Into<String>, signer: JwtSigner) -> Self {
        Self {
            name: name.into(),
            signer,
            owner_claim: DEFAULT_OWNER_CLAIM.to_string(),
            token_ttl: None,
            codes: Mutex::new(HashMap::new()),
            refresh_tokens: Mutex::new(HashMap::new()),
        }
    }

    /// Put the owner into `claim` instead of `sub`.
    #[must_use]
    pub fn with_owner_claim(mut self, claim: impl Into<String>) -> Self {
        self.owner_claim = claim.into();
        self
    }

    /// Expire access tokens after `ttl`.
    #[must_use]
    pub const fn with_token_ttl(mut self, ttl: Duration) -> Self {
        self.token_ttl = Some(ttl);
        self
    }

    /// Issue a single-use authorization code for `user_id`.
    #[must_use]
    pub fn issue_code(&self, user_id: impl Into<String>) -> String {
        let code = Uuid::new_v4().simple().to_string();
        self.codes.lock().insert(code.clone(), user_id.into());
        code
    }

    /// Sign an access token for `user_id` with `extra` claims.
    ///
    /// # Errors
    ///
    /// Returns an internal error if signing fails.
    pub fn access_token(&self, user_id: &str, extra: Map<String, Value>) -> GatewayResult<String> {
        let mut claims = extra;
        claims.insert(self.owner_claim.clone(), Value::String(user_id.to_string()));
        if let Some(ttl) = self.token_ttl {
            let ttl = chrono::Duration::from_std(ttl)
                .map_err(|e| GatewayError::Internal(format!("invalid token ttl: {e}")))?;
            claims.insert("exp".to_string(), Value::from((Utc::now() + ttl).timestamp()));
        }
        self.signer.sign(claims)
    }

    fn grant(&self, user_id: &str) -> GatewayResult<TokenGrant> {
        let access_token = self.access_token(user_id, Map::new())?;
        let refresh_token = Uuid::new_v4().simple().to_string();
        self.refresh_tokens
            .lock()
            .insert(refresh_token.clone(), user_id.to_string());
        let expires_at = self
            .token_ttl
            .and_then(|ttl| chrono::Duration::from_std(ttl).ok())
            .map(|ttl| Utc::now() + ttl);
        Ok(TokenGrant::new(access_token, refresh_token, user_id).with_expires_at(expires_at))
    }
}

impl IdentityProvider for LocalIdentityProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn exchange<'a>(&'a self, code: &'a str) -> BoxFuture<'a, GatewayResult<TokenGrant>> {
        Box::pin(async move {
            let user_id = self
                .codes
                .lock()
                .remove(code)
                .ok_or_else(|| GatewayError::Unauthorized("invalid authorization code".to_string()))?;
            self.grant(&user_id)
        })
    }

    fn refresh<'a>(&'a self, refresh_token: &'a str) -> BoxFuture<'a, GatewayResult<TokenGrant>> {
        Box::pin(async move {
            let user_id = self
                .refresh_tokens
                .lock()
                .remove(refresh_token)
                .ok_or_else(|| GatewayError::Unauthorized("invalid refresh token".to_string()))?;
            self.grant(&user_id)
        })
    }
}

impl std::fmt::Debug for LocalIdentityProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalIdentityProvider")
            .field("name", &self.name)
            .field("owner_claim", &self.owner_claim)
            .field("token_ttl", &self.token_ttl)
            .finish_non_exhaustive()
    }
}
