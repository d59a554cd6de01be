//! Payloads devices exchange with the gateway's well-known resources.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::events::ResourceLink;

/// Sign-up (enrollment) request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignUpRequest {
    /// Device ID.
    #[serde(rename = "di", default)]
    pub device_id: String,
    /// Authorization code; older firmware sends it as `authcode`.
    #[serde(rename = "accesstoken", alias = "authcode", default)]
    pub authorization_code: String,
    /// Name of the identity provider to exchange the code with.
    #[serde(rename = "authprovider", default)]
    pub authorization_provider: String,
}

/// Sign-up response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignUpResponse {
    /// Access token.
    #[serde(rename = "accesstoken")]
    pub access_token: String,
    /// Owner of the device.
    #[serde(rename = "uid")]
    pub user_id: String,
    /// Refresh token.
    #[serde(rename = "refreshtoken")]
    pub refresh_token: String,
    /// Redirect URI, when the provider returns one.
    #[serde(rename = "redirecturi", default, skip_serializing_if = "String::is_empty")]
    pub redirect_uri: String,
    /// Seconds until expiry, -1 for non-expiring tokens.
    #[serde(rename = "expiresin")]
    pub expires_in: i64,
}

/// Sign-in or sign-out request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignInRequest {
    /// Device ID.
    #[serde(rename = "di", default)]
    pub device_id: String,
    /// Owner of the device.
    #[serde(rename = "uid", default)]
    pub user_id: String,
    /// Access token.
    #[serde(rename = "accesstoken", default)]
    pub access_token: String,
    /// `true` to sign in, `false` to sign out.
    #[serde(default)]
    pub login: bool,
}

/// Sign-in response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignInResponse {
    /// Seconds until the session expires, -1 for never.
    #[serde(rename = "expiresin")]
    pub expires_in: i64,
}

/// Token refresh request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshTokenRequest {
    /// Device ID.
    #[serde(rename = "di", default)]
    pub device_id: String,
    /// Owner of the device.
    #[serde(rename = "uid", default)]
    pub user_id: String,
    /// Refresh token.
    #[serde(rename = "refreshtoken", default)]
    pub refresh_token: String,
}

/// Token refresh response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshTokenResponse {
    /// New access token.
    #[serde(rename = "accesstoken")]
    pub access_token: String,
    /// New refresh token.
    #[serde(rename = "refreshtoken")]
    pub refresh_token: String,
    /// Seconds until expiry, -1 for never.
    #[serde(rename = "expiresin")]
    pub expires_in: i64,
}

/// Resource directory publish request and response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishPayload {
    /// Publishing device.
    #[serde(rename = "di", default)]
    pub device_id: String,
    /// Links to publish.
    #[serde(default)]
    pub links: Vec<ResourceLink>,
    /// Link lifetime in seconds; `lt` is accepted for older firmware.
    #[serde(alias = "lt", default)]
    pub ttl: i64,
}

/// Resource directory selector returned to discovery.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selector {
    /// Selection criteria.
    pub sel: i64,
}

/// Cloud time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeResponse {
    /// Current gateway time.
    pub time: DateTime<Utc>,
}

/// Seconds from `now` until `expires_at`, or -1 when there is no expiry.
#[must_use]
pub fn expires_in(expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> i64 {
    expires_at.map_or(-1, |at| (at - now).num_seconds().max(0))
}
