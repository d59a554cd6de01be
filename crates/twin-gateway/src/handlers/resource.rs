//! Requests for resources of other devices, routed through the backend.
//!
//! `/oic/route/{deviceID}/{href}` retrieves, updates, creates and deletes
//! device-twin resources, and observes them with the observe option. Commands
//! complete asynchronously: the handler waits for the completion event the
//! projection delivers under the command's correlation ID.

use std::sync::Arc;

use tracing::debug;
use twin_proto::{
    status_to_coap_code, uri, Code, Command, Content, CorrelationId, Message, Operation,
    ResourceId, Status,
};

use super::HandlerResult;
use crate::auth::AuthorizationContext;
use crate::backend::ResourceFilter;
use crate::error::{GatewayError, GatewayResult};
use crate::projection::ProjectionGuard;
use crate::service::ServiceContext;
use crate::session::{content_of, Session};
use crate::subscription::ResourceSubscription;

/// Route part of `path`, `None` if `path` is not a routed resource.
pub(super) fn route_of(path: &str) -> Option<&str> {
    path.strip_prefix(uri::RESOURCE_ROUTE)
        .filter(|rest| rest.starts_with('/'))
}

pub(super) async fn handle(
    ctx: &Arc<ServiceContext>,
    session: &Arc<Session>,
    request: &Message,
    route: &str,
) -> HandlerResult {
    let auth = session.authorization_context()?;
    let resource_id = ResourceId::parse_route(route)?;
    let owned = ctx
        .backends
        .identity_store
        .is_owner(&auth.user_id, &resource_id.device_id)
        .await?;
    if !owned {
        return Err(GatewayError::Unauthorized(format!(
            "'{}' cannot access device '{}'",
            auth.user_id, resource_id.device_id
        )));
    }

    match (request.code, request.observe) {
        (Code::Get, Some(0)) => start_observation(ctx, session, &auth, request, resource_id).await,
        (Code::Get, Some(1)) => stop_observation(session, request),
        (Code::Get, Some(other)) => Err(GatewayError::BadRequest(format!(
            "invalid observe value {other}"
        ))),
        (Code::Get, None) if request.query("if").is_none() => {
            retrieve_latest(ctx, &auth, request, &resource_id).await
        }
        (Code::Get, None) => issue(ctx, &auth, request, resource_id, Operation::Retrieve).await,
        (Code::Post, _) if request.query("if") == Some(uri::CREATE_INTERFACE) => {
            issue(ctx, &auth, request, resource_id, Operation::Create).await
        }
        (Code::Post, _) => issue(ctx, &auth, request, resource_id, Operation::Update).await,
        (Code::Delete, _) => issue(ctx, &auth, request, resource_id, Operation::Delete).await,
        _ => Ok(Some(Message::response(
            Code::MethodNotAllowed,
            request.token.clone(),
        ))),
    }
}

fn response_for(
    request: &Message,
    operation: Operation,
    status: Status,
    content: &Content,
) -> GatewayResult<Message> {
    let mut response = Message::response(status_to_coap_code(status, operation), request.token.clone());
    if let Some(media_type) = content.media_type()? {
        response = response.with_payload(media_type, content.data.clone());
    }
    Ok(response)
}

/// Answer a plain GET from the device twin without bothering the device.
async fn retrieve_latest(
    ctx: &Arc<ServiceContext>,
    auth: &AuthorizationContext,
    request: &Message,
    resource_id: &ResourceId,
) -> HandlerResult {
    let snapshots = ctx
        .backends
        .directory
        .get_resources(&auth.access_token, &ResourceFilter::resource(resource_id.clone()))
        .await?;
    let latest = snapshots
        .into_iter()
        .find(|s| s.resource.href == resource_id.href)
        .and_then(|s| s.latest)
        .ok_or_else(|| GatewayError::NotFound(format!("cannot find resource '{resource_id}'")))?;
    response_for(request, Operation::Retrieve, latest.status, &latest.content).map(Some)
}

fn command_for(
    operation: Operation,
    resource_id: ResourceId,
    correlation_id: CorrelationId,
    request: &Message,
) -> Command {
    let interface = request.query("if").map(str::to_string);
    match operation {
        Operation::Retrieve => Command::RetrieveResource {
            resource_id,
            correlation_id,
            interface,
        },
        Operation::Create => Command::CreateResource {
            resource_id,
            correlation_id,
            content: content_of(request),
        },
        Operation::Delete => Command::DeleteResource {
            resource_id,
            correlation_id,
        },
        Operation::Update => Command::UpdateResource {
            resource_id,
            correlation_id,
            content: content_of(request),
            interface,
        },
    }
}

/// Submit a resource command and wait for its completion.
async fn issue(
    ctx: &Arc<ServiceContext>,
    auth: &AuthorizationContext,
    request: &Message,
    resource_id: ResourceId,
    operation: Operation,
) -> HandlerResult {
    let correlation_id = CorrelationId::generate();
    let _projection = ProjectionGuard::acquire(ctx, resource_id.device_id.clone()).await?;
    let waiter = ctx.waiters.register(correlation_id.clone());
    let command = command_for(operation, resource_id.clone(), correlation_id.clone(), request);
    ctx.backends
        .aggregate
        .submit(&auth.access_token, command)
        .await?;
    debug!(%resource_id, %correlation_id, %operation, "command submitted");

    let (_, completed) = waiter.wait(ctx.config.keepalive_timeout).await?;
    response_for(request, operation, completed.status, &completed.content).map(Some)
}

async fn start_observation(
    ctx: &Arc<ServiceContext>,
    session: &Arc<Session>,
    auth: &AuthorizationContext,
    request: &Message,
    resource_id: ResourceId,
) -> HandlerResult {
    let token = request.token.clone();
    ctx.projection.register(ctx, &resource_id.device_id).await?;
    let subscription = Arc::new(ResourceSubscription::new(
        session,
        resource_id.clone(),
        token.clone(),
    ));
    if let Err(e) = session.add_subscription(Arc::clone(&subscription)) {
        ctx.projection.unregister(&resource_id.device_id);
        return Err(e);
    }
    // From here on the subscription owns the projection registration.

    let snapshots = match ctx
        .backends
        .directory
        .get_resources(&auth.access_token, &ResourceFilter::resource(resource_id.clone()))
        .await
    {
        Ok(snapshots) => snapshots,
        Err(e) => {
            session.take_subscription(&token);
            subscription.close();
            return Err(GatewayError::BadRequest(format!(
                "cannot initialize observation of '{resource_id}': {e}"
            )));
        }
    };
    debug!(%resource_id, %token, "observation started");
    if let Some(snapshot) = snapshots
        .into_iter()
        .find(|s| s.resource.href == resource_id.href)
    {
        if let Some(latest) = snapshot.latest {
            subscription.notify(snapshot.version, &latest);
        }
    }
    Ok(None)
}

fn stop_observation(session: &Arc<Session>, request: &Message) -> HandlerResult {
    let token = request.token.clone();
    if !session.cancel_subscription(&token) {
        return Err(GatewayError::BadRequest(format!(
            "cannot find observation with token {token}"
        )));
    }
    Ok(Some(
        Message::response(Code::Content, token).with_observe(1),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use twin_proto::{DeviceId, MediaType};

    #[test]
    fn test_route_of() {
        assert_eq!(route_of("/oic/route/dev/light"), Some("/dev/light"));
        assert_eq!(route_of("/oic/routes/dev/light"), None);
        assert_eq!(route_of("/oic/rd"), None);
    }

    #[test]
    fn test_command_for_create() {
        let request = Message::request(Code::Post, "/oic/route/dev/switches")
            .with_query("if=oic.if.create")
            .with_payload(MediaType::AppJson, b"{}".to_vec());
        let id = ResourceId::new(DeviceId::new("dev"), "/switches");
        let command = command_for(Operation::Create, id, CorrelationId::new("c1"), &request);
        assert!(matches!(command, Command::CreateResource { content, .. } if content.data == b"{}"));
    }

    #[test]
    fn test_command_for_retrieve_keeps_interface() {
        let request = Message::request(Code::Get, "/oic/route/dev/light").with_query("if=oic.if.baseline");
        let id = ResourceId::new(DeviceId::new("dev"), "/light");
        let command = command_for(Operation::Retrieve, id, CorrelationId::new("c1"), &request);
        assert!(matches!(
            command,
            Command::RetrieveResource { interface: Some(i), .. } if i == "oic.if.baseline"
        ));
    }

    #[test]
    fn test_response_for_maps_status() {
        let request = Message::request(Code::Post, "/oic/route/dev/light");
        let response = response_for(
            &request,
            Operation::Update,
            Status::Ok,
            &Content::new(MediaType::AppJson, b"{\"on\":true}".to_vec()),
        )
        .unwrap();
        assert_eq!(response.code, Code::Changed);
        assert_eq!(response.token, request.token);
        assert_eq!(response.content_format, Some(MediaType::AppJson));
    }
}
