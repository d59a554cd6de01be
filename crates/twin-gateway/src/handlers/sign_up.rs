//! Device enrollment and removal.

use std::sync::Arc;

use chrono::Utc;
use tracing::info;
use twin_proto::messages::{expires_in, SignUpRequest, SignUpResponse};
use twin_proto::{Code, Command, DeviceId, Message};

use super::HandlerResult;
use crate::backend::IdentityProvider;
use crate::error::{GatewayError, GatewayResult};
use crate::service::ServiceContext;
use crate::session::Session;

/// Pick the provider a device named; an unnamed request is fine while only
/// one provider is configured.
fn find_provider(
    providers: &[Arc<dyn IdentityProvider>],
    name: &str,
) -> GatewayResult<Arc<dyn IdentityProvider>> {
    if name.is_empty() && providers.len() == 1 {
        return Ok(Arc::clone(&providers[0]));
    }
    providers
        .iter()
        .find(|p| p.name() == name)
        .cloned()
        .ok_or_else(|| GatewayError::Unauthorized(format!("unknown authorization provider '{name}'")))
}

pub(super) async fn sign_up(
    ctx: &Arc<ServiceContext>,
    session: &Arc<Session>,
    request: &Message,
) -> HandlerResult {
    let body: SignUpRequest = request.decode_json()?;
    let device_id = DeviceId::parse(&body.device_id)?;
    if body.authorization_code.is_empty() {
        return Err(GatewayError::BadRequest("missing authorization code".to_string()));
    }
    let provider = find_provider(&ctx.backends.providers, &body.authorization_provider)?;
    let grant = session
        .exchange(&provider, &body.authorization_code)
        .await
        .map_err(|e| GatewayError::ServiceUnavailable(format!("cannot exchange authorization code: {e}")))?;

    let claims = ctx.backends.validator.validate(&grant.access_token)?;
    let owner = claims.check_owner_and_device(
        &ctx.config.owner_claim,
        ctx.config.device_id_claim.as_deref(),
        Some(&grant.user_id),
        &device_id,
    )?;
    ctx.backends
        .identity_store
        .add_device(&owner, &device_id)
        .await?;

    let expires_at = claims.expires_at().or(grant.expires_at);
    info!(%device_id, %owner, provider = provider.name(), "device signed up");
    Ok(Some(
        Message::response(Code::Changed, request.token.clone()).with_json(&SignUpResponse {
            access_token: grant.access_token,
            user_id: owner,
            refresh_token: grant.refresh_token,
            redirect_uri: grant.redirect_uri,
            expires_in: expires_in(expires_at, Utc::now()),
        })?,
    ))
}

/// Remove the device from the backend.
///
/// Credentials come from the `di`, `accesstoken` and `uid` queries, falling
/// back to the signed-in context.
pub(super) async fn sign_off(
    ctx: &Arc<ServiceContext>,
    session: &Arc<Session>,
    request: &Message,
) -> HandlerResult {
    let auth = session.authorization_context().ok();
    let device_id = match request.query("di") {
        Some(di) => DeviceId::parse(di)?,
        None => auth
            .as_ref()
            .map(|a| a.device_id.clone())
            .ok_or_else(|| GatewayError::BadRequest("missing device ID".to_string()))?,
    };
    let access_token = request
        .query("accesstoken")
        .map(str::to_string)
        .or_else(|| auth.as_ref().map(|a| a.access_token.clone()))
        .ok_or_else(|| GatewayError::Unauthorized("missing access token".to_string()))?;
    let user_id = request
        .query("uid")
        .map(str::to_string)
        .or_else(|| auth.as_ref().map(|a| a.user_id.clone()));

    let claims = ctx.backends.validator.validate(&access_token)?;
    let owner = claims.check_owner_and_device(
        &ctx.config.owner_claim,
        ctx.config.device_id_claim.as_deref(),
        user_id.as_deref(),
        &device_id,
    )?;

    ctx.backends
        .aggregate
        .submit(
            &access_token,
            Command::DeleteDevices {
                device_ids: vec![device_id.clone()],
            },
        )
        .await?;
    let removed = ctx
        .backends
        .identity_store
        .delete_devices(&owner, std::slice::from_ref(&device_id))
        .await?;
    if !removed.contains(&device_id) {
        return Err(GatewayError::Forbidden(format!(
            "device '{device_id}' is not owned by '{owner}'"
        )));
    }

    session.clean_up(true);
    ctx.expiration.remove(&device_id, session.id());
    info!(%device_id, %owner, "device signed off");
    Ok(Some(Message::response(Code::Deleted, request.token.clone())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BoxFuture, TokenGrant};

    struct NamedProvider(&'static str);

    impl IdentityProvider for NamedProvider {
        fn name(&self) -> &str {
            self.0
        }

        fn exchange<'a>(&'a self, _code: &'a str) -> BoxFuture<'a, GatewayResult<TokenGrant>> {
            Box::pin(async { Err(GatewayError::Unauthorized("unused".to_string())) })
        }

        fn refresh<'a>(&'a self, _token: &'a str) -> BoxFuture<'a, GatewayResult<TokenGrant>> {
            Box::pin(async { Err(GatewayError::Unauthorized("unused".to_string())) })
        }
    }

    #[test]
    fn test_single_provider_is_default() {
        let providers: Vec<Arc<dyn IdentityProvider>> = vec![Arc::new(NamedProvider("plgd"))];
        assert_eq!(find_provider(&providers, "").unwrap().name(), "plgd");
    }

    #[test]
    fn test_provider_by_name() {
        let providers: Vec<Arc<dyn IdentityProvider>> =
            vec![Arc::new(NamedProvider("a")), Arc::new(NamedProvider("b"))];
        assert_eq!(find_provider(&providers, "b").unwrap().name(), "b");
        assert!(matches!(
            find_provider(&providers, ""),
            Err(GatewayError::Unauthorized(_))
        ));
        assert!(matches!(
            find_provider(&providers, "c"),
            Err(GatewayError::Unauthorized(_))
        ));
    }
}
