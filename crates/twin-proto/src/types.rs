//! Core identifier types for the device-twin protocol.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::ProtoError;

/// Identifier of a device, as carried in the `di` field of device payloads.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    /// Create a `DeviceId` without validation.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Parse a `DeviceId` from device input.
    ///
    /// # Errors
    ///
    /// Returns an error if the identifier is empty or contains a path separator.
    pub fn parse(s: &str) -> Result<Self, ProtoError> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(ProtoError::Validation("invalid device ID: empty".to_string()));
        }
        if trimmed.contains('/') {
            return Err(ProtoError::Validation(format!(
                "invalid device ID '{trimmed}': contains '/'"
            )));
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Borrow the identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True when the identifier is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Normalize a resource href so it starts with exactly one `/`.
#[must_use]
pub fn normalize_href(href: &str) -> String {
    format!("/{}", href.trim_start_matches('/'))
}

/// Identity of one resource: the owning device plus the resource href.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceId {
    /// Owning device.
    pub device_id: DeviceId,
    /// Normalized href, always with a single leading slash.
    pub href: String,
}

impl ResourceId {
    /// Create a resource ID, normalizing the href.
    #[must_use]
    pub fn new(device_id: DeviceId, href: &str) -> Self {
        Self {
            device_id,
            href: normalize_href(href),
        }
    }

    /// Parse a `{deviceID}/{href}` route path (without the route prefix).
    ///
    /// # Errors
    ///
    /// Returns an error if the path has no device segment or no href.
    pub fn parse_route(path: &str) -> Result<Self, ProtoError> {
        let trimmed = path.trim_start_matches('/');
        let (device, href) = trimmed
            .split_once('/')
            .ok_or_else(|| ProtoError::Validation(format!("invalid resource path '{path}'")))?;
        if href.is_empty() {
            return Err(ProtoError::Validation(format!(
                "invalid resource path '{path}': missing href"
            )));
        }
        Ok(Self::new(DeviceId::parse(device)?, href))
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}{}", self.device_id, self.href)
    }
}

/// Correlates a backend command with its eventual confirmation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Generate a fresh random correlation ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Wrap an existing correlation ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// CoAP message token pairing a request with its response or notifications.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Token(Vec<u8>);

impl Token {
    /// Maximum token length allowed by CoAP.
    pub const MAX_LEN: usize = 8;

    /// Generate a random 8-byte token.
    #[must_use]
    pub fn generate() -> Self {
        let id = Uuid::new_v4();
        Self(id.as_bytes()[..Self::MAX_LEN].to_vec())
    }

    /// Wrap raw token bytes.
    #[must_use]
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Raw token bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// True for the zero-length token.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}
