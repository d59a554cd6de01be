//! Keepalive ping. The transport refreshes its inactivity timer on every
//! message, so the handler only acknowledges.

use twin_proto::{Code, Message};

use super::HandlerResult;

pub(super) fn handle(request: &Message) -> HandlerResult {
    let code = if request.code == Code::Post {
        Code::Valid
    } else {
        Code::Content
    };
    Ok(Some(Message::response(code, request.token.clone())))
}
