//! Standalone wiring: the gateway core on top of the in-memory backend.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;
use twin_gateway::memory::{InMemoryBackend, LocalIdentityProvider};
use twin_gateway::{Backends, IdentityProvider, JwtSigner, JwtValidator, Service};

use crate::config::FileConfig;
use crate::error::ServerResult;

/// A gateway core together with the backend it runs against.
#[derive(Debug)]
pub struct Standalone {
    /// The in-memory backend.
    pub backend: Arc<InMemoryBackend>,
    /// Identity providers, in configuration order.
    pub providers: Vec<Arc<LocalIdentityProvider>>,
    /// The gateway core.
    pub service: Arc<Service>,
}

impl Standalone {
    /// Find a provider by name.
    #[must_use]
    pub fn provider(&self, name: &str) -> Option<&Arc<LocalIdentityProvider>> {
        self.providers.iter().find(|p| p.name() == name)
    }
}

/// Build the gateway core from a file configuration.
///
/// Every configured provider mints HMAC tokens with the shared secret, so
/// one validator accepts them all. Must be called inside a tokio runtime.
///
/// # Errors
///
/// Returns an error if the configuration is invalid.
pub fn standalone(config: &FileConfig) -> ServerResult<Standalone> {
    config.validate()?;
    let auth = &config.auth;
    let secret = auth.jwt_secret.as_bytes();

    let backend = InMemoryBackend::new(auth.service_token.clone());
    let providers: Vec<Arc<LocalIdentityProvider>> = auth
        .providers
        .iter()
        .map(|section| {
            let mut signer = JwtSigner::new(secret);
            if let Some(ref issuer) = auth.issuer {
                signer = signer.with_issuer(issuer.clone());
            }
            let mut provider = LocalIdentityProvider::new(section.name.clone(), signer)
                .with_owner_claim(config.gateway.owner_claim.clone());
            if let Some(ttl) = section.token_ttl_secs {
                provider = provider.with_token_ttl(Duration::from_secs(ttl));
            }
            Arc::new(provider)
        })
        .collect();
    let mut validator = JwtValidator::new(secret);
    if let Some(ref issuer) = auth.issuer {
        validator = validator.with_issuer(issuer.clone());
    }

    let backends = Backends {
        aggregate: backend.clone(),
        directory: backend.clone(),
        bus: backend.clone(),
        identity_store: backend.clone(),
        providers: providers
            .iter()
            .map(|p| Arc::clone(p) as Arc<dyn IdentityProvider>)
            .collect(),
        validator: Arc::new(validator),
        service_tokens: backend.clone(),
    };
    let service = Arc::new(Service::new(config.service_config(), backends)?);
    info!(
        providers = auth.providers.len(),
        instance_id = %service.context().config.instance_id,
        "standalone gateway assembled"
    );
    Ok(Standalone {
        backend,
        providers,
        service,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==================== Standalone Tests ====================

    #[tokio::test]
    async fn test_standalone_registers_providers() {
        let config = FileConfig::from_toml(
            r#"
            [gateway]
            instance_id = "gw-1"
            [auth]
            jwt_secret = "secret"
            providers = [{ name = "local" }, { name = "partner", token_ttl_secs = 60 }]
            "#,
        )
        .unwrap();

        let standalone = standalone(&config).unwrap();
        let ctx = standalone.service.context();
        let names: Vec<&str> = ctx.backends.providers.iter().map(|p| p.name()).collect();
        assert_eq!(names, vec!["local", "partner"]);
        assert_eq!(ctx.config.instance_id, "gw-1");
        assert!(standalone.provider("partner").is_some());
        assert!(standalone.provider("other").is_none());
    }

    #[tokio::test]
    async fn test_standalone_rejects_invalid_config() {
        let config = FileConfig::default();
        assert!(standalone(&config).is_err());
    }
}
