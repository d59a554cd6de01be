//! Access token refresh.

use std::sync::Arc;

use chrono::Utc;
use tracing::debug;
use twin_proto::messages::{expires_in, RefreshTokenRequest, RefreshTokenResponse};
use twin_proto::{Code, DeviceId, Message};

use super::HandlerResult;
use crate::error::GatewayError;
use crate::service::ServiceContext;
use crate::session::Session;

pub(super) async fn handle(
    ctx: &Arc<ServiceContext>,
    session: &Arc<Session>,
    request: &Message,
) -> HandlerResult {
    let body: RefreshTokenRequest = request.decode_json()?;
    let device_id = DeviceId::parse(&body.device_id)?;
    if body.refresh_token.is_empty() {
        return Err(GatewayError::Unauthorized("missing refresh token".to_string()));
    }
    let grant = session
        .refresh(&ctx.backends.providers, &body.refresh_token)
        .await
        .map_err(|e| GatewayError::Unauthorized(format!("cannot refresh token: {e}")))?;

    let claims = ctx.backends.validator.validate(&grant.access_token)?;
    claims.check_owner_and_device(
        &ctx.config.owner_claim,
        ctx.config.device_id_claim.as_deref(),
        Some(&body.user_id),
        &device_id,
    )?;
    let expires_at = claims.expires_at().or(grant.expires_at);
    if session.device_id().as_ref() == Some(&device_id) {
        ctx.expiration.set(device_id.clone(), session.id(), expires_at, session);
    }
    debug!(%device_id, ?expires_at, "token refreshed");

    Ok(Some(
        Message::response(Code::Changed, request.token.clone()).with_json(&RefreshTokenResponse {
            access_token: grant.access_token,
            refresh_token: grant.refresh_token,
            expires_in: expires_in(expires_at, Utc::now()),
        })?,
    ))
}
