//! Well-known resource paths served by the gateway.

/// Device enrollment (sign-up, sign-off).
pub const SIGN_UP: &str = "/oic/sec/account";
/// Session lifecycle (sign-in, sign-out).
pub const SIGN_IN: &str = "/oic/sec/session";
/// Access token refresh.
pub const REFRESH_TOKEN: &str = "/oic/sec/tokenrefresh";
/// Resource directory.
pub const RESOURCE_DIRECTORY: &str = "/oic/rd";
/// Prefix of routed resource requests, followed by `/{deviceID}/{href}`.
pub const RESOURCE_ROUTE: &str = "/oic/route";
/// Keepalive ping.
pub const PING: &str = "/oic/ping";
/// Cloud time, reachable without authorization.
pub const TIME: &str = "/x.plgd.dev/time";
/// Gateway-maintained status resource; never forwarded to the device.
pub const STATUS_HREF: &str = "/plgd/s";
/// Interface query used for create requests.
pub const CREATE_INTERFACE: &str = "oic.if.create";

/// Normalize a request path: leading slash, no trailing slash.
#[must_use]
pub fn canonical_path(path: &str) -> String {
    let trimmed = path.trim_matches('/');
    format!("/{trimmed}")
}
