//! Cloud time for devices without a clock source.

use chrono::Utc;
use twin_proto::messages::TimeResponse;
use twin_proto::{Code, Message};

use super::HandlerResult;

pub(super) fn handle(request: &Message) -> HandlerResult {
    Ok(Some(
        Message::response(Code::Content, request.token.clone())
            .with_json(&TimeResponse { time: Utc::now() })?,
    ))
}
