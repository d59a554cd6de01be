//! Sign-in and sign-out.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};
use twin_proto::messages::{expires_in, SignInRequest, SignInResponse};
use twin_proto::{Code, DeviceId, Message};

use super::HandlerResult;
use crate::auth::AuthorizationContext;
use crate::error::GatewayError;
use crate::service::ServiceContext;
use crate::session::Session;

pub(super) async fn handle(
    ctx: &Arc<ServiceContext>,
    session: &Arc<Session>,
    request: &Message,
) -> HandlerResult {
    let body: SignInRequest = request.decode_json()?;
    if body.login {
        sign_in(ctx, session, request, body).await
    } else {
        sign_out(ctx, session, request, &body).await
    }
}

async fn sign_in(
    ctx: &Arc<ServiceContext>,
    session: &Arc<Session>,
    request: &Message,
    body: SignInRequest,
) -> HandlerResult {
    let device_id = DeviceId::parse(&body.device_id)?;
    if body.access_token.is_empty() {
        return Err(GatewayError::Unauthorized("missing access token".to_string()));
    }
    let claims = ctx.backends.validator.validate(&body.access_token)?;
    let owner = claims.check_owner_and_device(
        &ctx.config.owner_claim,
        ctx.config.device_id_claim.as_deref(),
        Some(&body.user_id),
        &device_id,
    )?;
    let expires_at = claims.expires_at();
    let auth = AuthorizationContext::new(device_id.clone(), owner, body.access_token, expires_at);
    auth.validate()?;

    session.authorize(auth.clone()).await?;
    ctx.status
        .update_online(&auth, session.connected_at())
        .await
        .map_err(|e| GatewayError::ServiceUnavailable(format!("cannot update device status: {e}")))?;
    ctx.expiration.set(device_id.clone(), session.id(), expires_at, session);

    let response = Message::response(Code::Changed, request.token.clone()).with_json(&SignInResponse {
        expires_in: expires_in(expires_at, Utc::now()),
    })?;
    session.send(response);
    info!(%device_id, user_id = %auth.user_id, "device signed in");

    ctx.projection.trigger_sign_in(ctx, &device_id);
    Ok(None)
}

async fn sign_out(
    ctx: &Arc<ServiceContext>,
    session: &Arc<Session>,
    request: &Message,
    body: &SignInRequest,
) -> HandlerResult {
    let old = session.clean_up(true);
    let device_id = match old.as_ref() {
        Some(auth) => auth.device_id.clone(),
        None => DeviceId::parse(&body.device_id)?,
    };
    ctx.expiration.remove(&device_id, session.id());

    let token = match ctx.backends.service_tokens.service_token().await {
        Ok(token) => Some(token),
        Err(e) => {
            warn!(%device_id, error = %e, "cannot get service token");
            old.map(|auth| auth.access_token)
        }
    };
    if let Some(token) = token {
        if let Err(e) = ctx.status.update_offline(&device_id, &token).await {
            warn!(%device_id, error = %e, "cannot report device offline");
        }
    }
    info!(%device_id, "device signed out");
    Ok(Some(
        Message::response(Code::Changed, request.token.clone())
            .with_json(&serde_json::Map::new())?,
    ))
}
