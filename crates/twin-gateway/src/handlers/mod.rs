//! Device request routing.
//!
//! Every request except enrollment, sign-in, token refresh and time needs a
//! valid authorization context; a session without one is answered
//! `Unauthorized` and closed.

mod ping;
mod resource;
mod resource_directory;
mod sign_in;
mod sign_up;
mod time;
mod token_refresh;

use std::sync::Arc;

use tracing::{debug, warn};
use twin_proto::{uri, Code, Message};

use crate::error::GatewayResult;
use crate::service::ServiceContext;
use crate::session::Session;

/// `Some` carries the response; `None` means the handler already answered.
pub(crate) type HandlerResult = GatewayResult<Option<Message>>;

/// Paths served without an authorization context.
const PUBLIC_PATHS: [&str; 4] = [uri::SIGN_UP, uri::SIGN_IN, uri::REFRESH_TOKEN, uri::TIME];

/// Paths whose failures close the connection.
const SESSION_PATHS: [&str; 3] = [uri::SIGN_UP, uri::SIGN_IN, uri::REFRESH_TOKEN];

fn requires_authorization(path: &str) -> bool {
    !PUBLIC_PATHS.contains(&path)
}

/// Handle one device message.
pub async fn handle(ctx: &Arc<ServiceContext>, session: &Arc<Session>, request: Message) {
    let token = request.token.clone();
    if request.code == Code::Empty {
        // A reset answering a notification cancels the observation.
        if !token.is_empty() && !session.reset_subscription(&token) {
            debug!(remote_addr = %session.remote_addr(), %token, "reset for unknown observation");
        }
        return;
    }
    if !request.code.is_request() {
        debug!(remote_addr = %session.remote_addr(), code = %request.code, "unexpected response");
        return;
    }

    let path = uri::canonical_path(&request.path);
    if requires_authorization(&path) {
        if let Err(e) = session.authorization_context() {
            warn!(remote_addr = %session.remote_addr(), %path, error = %e, "unauthorized request");
            session.send_error(token, &e);
            session.close();
            return;
        }
    }

    match route(ctx, session, &path, &request).await {
        Ok(Some(response)) => session.send(response),
        Ok(None) => {}
        Err(e) => {
            debug!(remote_addr = %session.remote_addr(), %path, code = %request.code, error = %e, "request failed");
            session.send_error(token, &e);
            if SESSION_PATHS.contains(&path.as_str()) {
                session.close();
            }
        }
    }
}

async fn route(
    ctx: &Arc<ServiceContext>,
    session: &Arc<Session>,
    path: &str,
    request: &Message,
) -> HandlerResult {
    match (path, request.code) {
        (uri::SIGN_UP, Code::Post) => sign_up::sign_up(ctx, session, request).await,
        (uri::SIGN_UP, Code::Delete) => sign_up::sign_off(ctx, session, request).await,
        (uri::SIGN_IN, Code::Post) => sign_in::handle(ctx, session, request).await,
        (uri::REFRESH_TOKEN, Code::Post) => token_refresh::handle(ctx, session, request).await,
        (uri::RESOURCE_DIRECTORY, Code::Post) => {
            resource_directory::publish(ctx, session, request).await
        }
        (uri::RESOURCE_DIRECTORY, Code::Delete) => {
            resource_directory::unpublish(session, request).await
        }
        (uri::RESOURCE_DIRECTORY, Code::Get) => resource_directory::selector(request),
        (uri::PING, Code::Get | Code::Post) => ping::handle(request),
        (uri::TIME, Code::Get) => time::handle(request),
        (uri::SIGN_UP | uri::SIGN_IN | uri::REFRESH_TOKEN | uri::RESOURCE_DIRECTORY | uri::PING | uri::TIME, _) => {
            Ok(Some(Message::response(Code::MethodNotAllowed, request.token.clone())))
        }
        _ => match resource::route_of(path) {
            Some(route) => resource::handle(ctx, session, request, route).await,
            None => Ok(Some(Message::response(Code::NotFound, request.token.clone()))),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_paths() {
        assert!(!requires_authorization(uri::SIGN_UP));
        assert!(!requires_authorization(uri::SIGN_IN));
        assert!(!requires_authorization(uri::REFRESH_TOKEN));
        assert!(!requires_authorization(uri::TIME));
    }

    #[test]
    fn test_protected_paths() {
        assert!(requires_authorization(uri::RESOURCE_DIRECTORY));
        assert!(requires_authorization(uri::PING));
        assert!(requires_authorization("/oic/route/dev/light"));
        assert!(requires_authorization("/unknown"));
    }
}
