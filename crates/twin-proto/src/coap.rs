//! CoAP message model exchanged with devices.
//!
//! Messages travel as JSON documents over the device connection; the fields
//! mirror the CoAP options the gateway relies on (token, URI path and query,
//! observe, content format) plus the raw payload.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ProtoError;
use crate::types::Token;

/// CoAP method and response codes used by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Code {
    /// 0.00, used for pings and resets.
    Empty,
    /// 0.01
    Get,
    /// 0.02
    Post,
    /// 0.03
    Put,
    /// 0.04
    Delete,
    /// 2.01
    Created,
    /// 2.02
    Deleted,
    /// 2.03
    Valid,
    /// 2.04
    Changed,
    /// 2.05
    Content,
    /// 4.00
    BadRequest,
    /// 4.01
    Unauthorized,
    /// 4.02
    BadOption,
    /// 4.03
    Forbidden,
    /// 4.04
    NotFound,
    /// 4.05
    MethodNotAllowed,
    /// 4.06
    NotAcceptable,
    /// 4.12
    PreconditionFailed,
    /// 4.13
    RequestEntityTooLarge,
    /// 4.15
    UnsupportedMediaType,
    /// 5.00
    InternalServerError,
    /// 5.01
    NotImplemented,
    /// 5.02
    BadGateway,
    /// 5.03
    ServiceUnavailable,
    /// 5.04
    GatewayTimeout,
}

impl Code {
    /// Class and detail digits of the code.
    #[must_use]
    pub const fn class_detail(self) -> (u8, u8) {
        match self {
            Self::Empty => (0, 0),
            Self::Get => (0, 1),
            Self::Post => (0, 2),
            Self::Put => (0, 3),
            Self::Delete => (0, 4),
            Self::Created => (2, 1),
            Self::Deleted => (2, 2),
            Self::Valid => (2, 3),
            Self::Changed => (2, 4),
            Self::Content => (2, 5),
            Self::BadRequest => (4, 0),
            Self::Unauthorized => (4, 1),
            Self::BadOption => (4, 2),
            Self::Forbidden => (4, 3),
            Self::NotFound => (4, 4),
            Self::MethodNotAllowed => (4, 5),
            Self::NotAcceptable => (4, 6),
            Self::PreconditionFailed => (4, 12),
            Self::RequestEntityTooLarge => (4, 13),
            Self::UnsupportedMediaType => (4, 15),
            Self::InternalServerError => (5, 0),
            Self::NotImplemented => (5, 1),
            Self::BadGateway => (5, 2),
            Self::ServiceUnavailable => (5, 3),
            Self::GatewayTimeout => (5, 4),
        }
    }

    /// True for request methods (GET, POST, PUT, DELETE).
    #[must_use]
    pub const fn is_request(self) -> bool {
        matches!(self, Self::Get | Self::Post | Self::Put | Self::Delete)
    }

    /// True for any response code (class 2, 4 or 5).
    #[must_use]
    pub const fn is_response(self) -> bool {
        self.class_detail().0 >= 2
    }

    /// True for 2.xx codes.
    #[must_use]
    pub const fn is_success(self) -> bool {
        self.class_detail().0 == 2
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (class, detail) = self.class_detail();
        write!(f, "{class}.{detail:02} {self:?}")
    }
}

/// Content formats the gateway forwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MediaType {
    /// `text/plain`
    #[serde(rename = "text/plain")]
    TextPlain,
    /// `application/json`
    #[serde(rename = "application/json")]
    AppJson,
    /// `application/cbor`
    #[serde(rename = "application/cbor")]
    AppCbor,
    /// `application/vnd.ocf+cbor`
    #[serde(rename = "application/vnd.ocf+cbor")]
    AppOcfCbor,
}

impl MediaType {
    /// MIME string of the media type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TextPlain => "text/plain",
            Self::AppJson => "application/json",
            Self::AppCbor => "application/cbor",
            Self::AppOcfCbor => "application/vnd.ocf+cbor",
        }
    }

    /// CoAP content-format number.
    #[must_use]
    pub const fn content_format(self) -> u16 {
        match self {
            Self::TextPlain => 0,
            Self::AppJson => 50,
            Self::AppCbor => 60,
            Self::AppOcfCbor => 10000,
        }
    }

    /// Parse a MIME string.
    ///
    /// # Errors
    ///
    /// Returns an error for media types the gateway cannot forward.
    pub fn parse(s: &str) -> Result<Self, ProtoError> {
        match s {
            "text/plain" => Ok(Self::TextPlain),
            "application/json" => Ok(Self::AppJson),
            "application/cbor" => Ok(Self::AppCbor),
            "application/vnd.ocf+cbor" => Ok(Self::AppOcfCbor),
            other => Err(ProtoError::UnsupportedMediaType(other.to_string())),
        }
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A CoAP request, response or notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Method or response code.
    pub code: Code,
    /// Correlation token.
    #[serde(default)]
    pub token: Token,
    /// URI path, empty for responses.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
    /// URI query segments, each `key=value` or a bare key.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub queries: Vec<String>,
    /// Observe option.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observe: Option<u32>,
    /// Content-format option.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_format: Option<MediaType>,
    /// Payload bytes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub payload: Vec<u8>,
}

impl Message {
    /// Build a request with a fresh token.
    #[must_use]
    pub fn request(code: Code, path: impl Into<String>) -> Self {
        Self {
            code,
            token: Token::generate(),
            path: path.into(),
            queries: Vec::new(),
            observe: None,
            content_format: None,
            payload: Vec::new(),
        }
    }

    /// Build a response carrying the token of the request it answers.
    #[must_use]
    pub fn response(code: Code, token: Token) -> Self {
        Self {
            code,
            token,
            path: String::new(),
            queries: Vec::new(),
            observe: None,
            content_format: None,
            payload: Vec::new(),
        }
    }

    /// Build an empty message, used as a keepalive ping.
    #[must_use]
    pub fn empty() -> Self {
        Self::response(Code::Empty, Token::default())
    }

    /// Append a URI query segment.
    #[must_use]
    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.queries.push(query.into());
        self
    }

    /// Set the observe option.
    #[must_use]
    pub const fn with_observe(mut self, observe: u32) -> Self {
        self.observe = Some(observe);
        self
    }

    /// Set the token.
    #[must_use]
    pub fn with_token(mut self, token: Token) -> Self {
        self.token = token;
        self
    }

    /// Set payload and content format.
    #[must_use]
    pub fn with_payload(mut self, media_type: MediaType, payload: impl Into<Vec<u8>>) -> Self {
        self.content_format = Some(media_type);
        self.payload = payload.into();
        self
    }

    /// Set a JSON payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be serialized.
    pub fn with_json<T: Serialize>(self, value: &T) -> Result<Self, ProtoError> {
        let data =
            serde_json::to_vec(value).map_err(|e| ProtoError::Encoding(e.to_string()))?;
        Ok(self.with_payload(MediaType::AppJson, data))
    }

    /// Decode the JSON payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is not valid JSON for `T` or the
    /// content format is not JSON.
    pub fn decode_json<'a, T: Deserialize<'a>>(&'a self) -> Result<T, ProtoError> {
        match self.content_format {
            Some(MediaType::AppJson) | None => {}
            Some(other) => return Err(ProtoError::UnsupportedMediaType(other.to_string())),
        }
        Ok(serde_json::from_slice(&self.payload)?)
    }

    /// Value of the first `key=value` query matching `key`.
    #[must_use]
    pub fn query(&self, key: &str) -> Option<&str> {
        self.queries.iter().find_map(|q| {
            let (k, v) = q.split_once('=')?;
            (k == key).then_some(v)
        })
    }

    /// All values of `key=value` queries matching `key`.
    pub fn query_all<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.queries.iter().filter_map(move |q| {
            let (k, v) = q.split_once('=')?;
            (k == key).then_some(v)
        })
    }

    /// Payload as UTF-8 text, lossy.
    #[must_use]
    pub fn payload_text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    // ==================== Code Tests ====================

    #[test_case(Code::Get, true, false ; "get is request")]
    #[test_case(Code::Content, false, true ; "content is response")]
    #[test_case(Code::NotFound, false, true ; "not found is response")]
    #[test_case(Code::Empty, false, false ; "empty is neither")]
    fn test_code_classes(code: Code, request: bool, response: bool) {
        assert_eq!(code.is_request(), request);
        assert_eq!(code.is_response(), response);
    }

    #[test]
    fn test_code_display() {
        assert_eq!(Code::Content.to_string(), "2.05 Content");
        assert_eq!(Code::UnsupportedMediaType.to_string(), "4.15 UnsupportedMediaType");
    }

    // ==================== MediaType Tests ====================

    #[test_case("text/plain", MediaType::TextPlain)]
    #[test_case("application/json", MediaType::AppJson)]
    #[test_case("application/cbor", MediaType::AppCbor)]
    #[test_case("application/vnd.ocf+cbor", MediaType::AppOcfCbor)]
    fn test_media_type_parse(s: &str, expected: MediaType) {
        assert_eq!(MediaType::parse(s).unwrap(), expected);
        assert_eq!(expected.as_str(), s);
    }

    #[test]
    fn test_media_type_parse_unknown() {
        assert!(matches!(
            MediaType::parse("image/png"),
            Err(ProtoError::UnsupportedMediaType(_))
        ));
    }

    // ==================== Message Tests ====================

    #[test]
    fn test_message_query_lookup() {
        let msg = Message::request(Code::Delete, "/oic/rd")
            .with_query("di=dev-1")
            .with_query("ins=1")
            .with_query("ins=2")
            .with_query("flag");
        assert_eq!(msg.query("di"), Some("dev-1"));
        assert_eq!(msg.query("flag"), None);
        assert_eq!(msg.query_all("ins").collect::<Vec<_>>(), vec!["1", "2"]);
    }

    #[test]
    fn test_message_json_payload() {
        let msg = Message::response(Code::Content, Token::generate())
            .with_json(&serde_json::json!({"sel": 0}))
            .unwrap();
        let value: serde_json::Value = msg.decode_json().unwrap();
        assert_eq!(value["sel"], 0);
        assert_eq!(msg.content_format, Some(MediaType::AppJson));
    }

    #[test]
    fn test_message_decode_rejects_cbor() {
        let msg = Message::response(Code::Content, Token::generate())
            .with_payload(MediaType::AppCbor, vec![0xa0]);
        assert!(msg.decode_json::<serde_json::Value>().is_err());
    }

    #[test]
    fn test_message_wire_skips_empty_fields() {
        let msg = Message::response(Code::Valid, Token::from_bytes(vec![1]));
        let json = serde_json::to_string(&msg).unwrap();
        assert!(!json.contains("path"));
        assert!(!json.contains("observe"));
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }
}
