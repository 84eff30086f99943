use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{BusError, Result};

/// Reserved envelope type names and suffixes.
pub mod types {
    /// Suffix appended to a command type for its successful reply
    pub const RESPONSE_SUFFIX: &str = "_response";
    /// Suffix appended to a command type for its failed reply
    pub const ERROR_SUFFIX: &str = "_error";
    /// Type of the synthetic envelope published when a transport faults
    pub const SYSTEM_ERROR: &str = "system_error";
}

/// Builds the reply type carrying a successful result for `command_type`.
pub fn response_type(command_type: &str) -> String {
    format!("{command_type}{}", types::RESPONSE_SUFFIX)
}

/// Builds the reply type carrying a failure for `command_type`.
pub fn error_type(command_type: &str) -> String {
    format!("{command_type}{}", types::ERROR_SUFFIX)
}

/// Generates a fresh correlation id for one `execute` call.
pub fn new_correlation_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Role an envelope plays on the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeKind {
    /// Fire-and-forget event (no correlation id)
    Event,
    /// Command awaiting exactly one terminal reply
    Request,
    /// Successful terminal reply (`{type}_response`)
    Response,
    /// Failed terminal reply (`{type}_error`)
    Error,
}

/// Unit of communication exchanged on a channel.
///
/// Wire form (JSON) when relayed through a broker:
///
/// ```text
/// { "type": string, "payload": any, "correlationId"?: string }
/// ```
///
/// The payload is opaque to the bus. `correlation_id` is only present on
/// requests and their replies.
///
/// # Examples
///
/// ```
/// use busline_core::{Envelope, EnvelopeKind};
/// use serde_json::json;
///
/// let req = Envelope::request("ping", json!({"n": 1}), "c-1");
/// assert_eq!(req.kind(), EnvelopeKind::Request);
///
/// let reply = Envelope::response("ping", json!("pong"), "c-1");
/// assert_eq!(reply.r#type, "ping_response");
/// assert!(reply.is_reply_to("ping", "c-1"));
/// assert!(!reply.is_reply_to("ping", "c-2"));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Event or command name
    pub r#type: String,
    /// Arbitrary serializable payload
    #[serde(default)]
    pub payload: Value,
    /// Links a request to its terminal reply
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl Envelope {
    /// Envelope with an explicit correlation id, or none.
    pub fn new(r#type: impl Into<String>, payload: Value, correlation_id: Option<String>) -> Self {
        Self {
            r#type: r#type.into(),
            payload,
            correlation_id,
        }
    }

    /// Fire-and-forget event without correlation id.
    pub fn event(r#type: impl Into<String>, payload: Value) -> Self {
        Self::new(r#type, payload, None)
    }

    /// Command expecting a `_response` or `_error` reply.
    pub fn request(
        r#type: impl Into<String>,
        payload: Value,
        correlation_id: impl Into<String>,
    ) -> Self {
        Self::new(r#type, payload, Some(correlation_id.into()))
    }

    /// Successful reply to `command_type`.
    pub fn response(command_type: &str, payload: Value, correlation_id: impl Into<String>) -> Self {
        Self::new(
            response_type(command_type),
            payload,
            Some(correlation_id.into()),
        )
    }

    /// Failed reply to `command_type`.
    pub fn error(command_type: &str, payload: Value, correlation_id: impl Into<String>) -> Self {
        Self::new(error_type(command_type), payload, Some(correlation_id.into()))
    }

    /// Synthetic fault notification published by transports.
    pub fn system_error(message: impl Into<String>) -> Self {
        Self::event(types::SYSTEM_ERROR, Value::String(message.into()))
    }

    pub fn kind(&self) -> EnvelopeKind {
        match self.correlation_id {
            None => EnvelopeKind::Event,
            Some(_) if self.r#type.ends_with(types::RESPONSE_SUFFIX) => EnvelopeKind::Response,
            Some(_) if self.r#type.ends_with(types::ERROR_SUFFIX) => EnvelopeKind::Error,
            Some(_) => EnvelopeKind::Request,
        }
    }

    /// True when this envelope is a terminal reply (`_response` or `_error`)
    /// of `command_type` carrying `correlation_id`.
    pub fn is_reply_to(&self, command_type: &str, correlation_id: &str) -> bool {
        if self.correlation_id.as_deref() != Some(correlation_id) {
            return false;
        }
        self.r#type
            .strip_prefix(command_type)
            .map(|rest| rest == types::RESPONSE_SUFFIX || rest == types::ERROR_SUFFIX)
            .unwrap_or(false)
    }

    /// Name of the command this envelope replies to, if it is a reply.
    pub fn command_type(&self) -> Option<&str> {
        match self.kind() {
            EnvelopeKind::Response => self.r#type.strip_suffix(types::RESPONSE_SUFFIX),
            EnvelopeKind::Error => self.r#type.strip_suffix(types::ERROR_SUFFIX),
            _ => None,
        }
    }
}

/// Encodes an envelope into its JSON wire form.
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(envelope)?)
}

/// Decodes a raw broker message into an envelope.
///
/// Anything that is not a JSON object with a string `type` is rejected with
/// [`BusError::Decode`].
///
/// ```
/// use busline_core::envelope::decode;
///
/// let env = decode(br#"{"type":"greet","payload":"hi"}"#).unwrap();
/// assert_eq!(env.r#type, "greet");
/// assert!(env.correlation_id.is_none());
///
/// assert!(decode(b"not json").is_err());
/// assert!(decode(br#"{"payload":1}"#).is_err());
/// ```
pub fn decode(raw: &[u8]) -> Result<Envelope> {
    serde_json::from_slice::<Envelope>(raw).map_err(|e| {
        let preview: String = String::from_utf8_lossy(raw).chars().take(64).collect();
        BusError::Decode(format!("{e} (message starts with {preview:?})"))
    })
}
