//! Resource directory: publish, unpublish and discovery selector.

use std::sync::Arc;

use tracing::info;
use twin_proto::messages::{PublishPayload, Selector};
use twin_proto::{normalize_href, Code, Command, DeviceId, Message, ResourceLink};

use super::HandlerResult;
use crate::error::{GatewayError, GatewayResult};
use crate::service::ServiceContext;
use crate::session::Session;

pub(super) async fn publish(
    ctx: &Arc<ServiceContext>,
    session: &Arc<Session>,
    request: &Message,
) -> HandlerResult {
    let auth = session.authorization_context()?;
    let body: PublishPayload = request.decode_json()?;
    let device_id = DeviceId::parse(&body.device_id)?;
    if device_id != auth.device_id {
        return Err(GatewayError::BadRequest(format!(
            "cannot publish resources of device '{device_id}' as '{}'",
            auth.device_id
        )));
    }
    if body.links.is_empty() {
        return Err(GatewayError::BadRequest("empty links".to_string()));
    }
    let links: Vec<ResourceLink> = body
        .links
        .into_iter()
        .map(|mut link| {
            link.href = normalize_href(&link.href);
            link.device_id = device_id.clone();
            link
        })
        .collect();

    ctx.backends
        .aggregate
        .submit(
            &auth.access_token,
            Command::PublishResourceLinks {
                device_id: device_id.clone(),
                links: links.clone(),
                ttl: body.ttl,
            },
        )
        .await?;
    info!(%device_id, count = links.len(), "resources published");

    let response = Message::response(Code::Changed, request.token.clone()).with_json(&PublishPayload {
        device_id: device_id.to_string(),
        links: links.clone(),
        ttl: body.ttl,
    })?;
    session.send(response);
    session.observe_published(links);
    Ok(None)
}

fn instance_ids(request: &Message) -> GatewayResult<Vec<i64>> {
    request
        .query_all("ins")
        .map(|v| {
            v.parse::<i64>()
                .map_err(|e| GatewayError::BadRequest(format!("invalid instance ID '{v}': {e}")))
        })
        .collect()
}

pub(super) async fn unpublish(session: &Arc<Session>, request: &Message) -> HandlerResult {
    let auth = session.authorization_context()?;
    if let Some(di) = request.query("di") {
        let device_id = DeviceId::parse(di)?;
        if device_id != auth.device_id {
            return Err(GatewayError::BadRequest(format!(
                "cannot unpublish resources of device '{device_id}' as '{}'",
                auth.device_id
            )));
        }
    }
    let instance_ids = instance_ids(request)?;
    let unpublished = session
        .try_unpublish_resource_links(Vec::new(), instance_ids)
        .await?;
    info!(device_id = %auth.device_id, count = unpublished.len(), "resources unpublished");
    Ok(Some(Message::response(Code::Deleted, request.token.clone())))
}

pub(super) fn selector(request: &Message) -> HandlerResult {
    Ok(Some(
        Message::response(Code::Content, request.token.clone()).with_json(&Selector { sel: 0 })?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_ids() {
        let request = Message::request(Code::Delete, "/oic/rd")
            .with_query("di=dev")
            .with_query("ins=1")
            .with_query("ins=42");
        assert_eq!(instance_ids(&request).unwrap(), vec![1, 42]);
    }

    #[test]
    fn test_invalid_instance_id() {
        let request = Message::request(Code::Delete, "/oic/rd").with_query("ins=x");
        assert!(matches!(instance_ids(&request), Err(GatewayError::BadRequest(_))));
    }

    #[test]
    fn test_selector() {
        let request = Message::request(Code::Get, "/oic/rd");
        let response = selector(&request).unwrap().unwrap();
        assert_eq!(response.code, Code::Content);
        assert_eq!(response.decode_json::<Selector>().unwrap(), Selector { sel: 0 });
    }
}
