// Command handlers and their failure values
use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};

use crate::BusError;

/// Failure raised by a handler and carried back to the caller in an
/// `{type}_error` reply.
///
/// A handler failure is either a plain error with a message, or an
/// HTTP-style error that also carries a status code. Both survive the trip
/// through the `_error` envelope and are rebuilt on the calling side.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    #[error("{message}")]
    Failed { message: String },

    #[error("{status}: {message}")]
    Status { status: u16, message: String },
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        HandlerError::Failed {
            message: message.into(),
        }
    }

    pub fn status(status: u16, message: impl Into<String>) -> Self {
        HandlerError::Status {
            status,
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        match self {
            HandlerError::Failed { message } | HandlerError::Status { message, .. } => message,
        }
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            HandlerError::Status { status, .. } => Some(*status),
            HandlerError::Failed { .. } => None,
        }
    }

    /// Payload of the `_error` reply.
    ///
    /// ```
    /// use busline_core::HandlerError;
    /// use serde_json::json;
    ///
    /// assert_eq!(
    ///     HandlerError::status(404, "missing").to_payload(),
    ///     json!({"message": "missing", "status": 404}),
    /// );
    /// assert_eq!(
    ///     HandlerError::new("boom").to_payload(),
    ///     json!({"name": "Error", "message": "boom"}),
    /// );
    /// ```
    pub fn to_payload(&self) -> Value {
        match self {
            HandlerError::Failed { message } => json!({ "name": "Error", "message": message }),
            HandlerError::Status { status, message } => {
                json!({ "message": message, "status": status })
            }
        }
    }

    /// Rebuild the error from an `_error` reply payload.
    ///
    /// Objects with a numeric `status` become [`HandlerError::Status`];
    /// objects with a `message` and bare strings become
    /// [`HandlerError::Failed`]. Anything else is kept verbatim as a 500.
    pub fn from_payload(payload: &Value) -> Self {
        match payload {
            Value::Object(map) => {
                let message = map.get("message").and_then(Value::as_str);
                let status = map
                    .get("status")
                    .and_then(Value::as_u64)
                    .and_then(|s| u16::try_from(s).ok());
                match (status, message) {
                    (Some(status), message) => HandlerError::Status {
                        status,
                        message: message.map(str::to_string).unwrap_or_default(),
                    },
                    (None, Some(message)) => HandlerError::new(message),
                    (None, None) => HandlerError::status(500, payload.to_string()),
                }
            }
            Value::String(message) => HandlerError::new(message.clone()),
            other => HandlerError::status(500, other.to_string()),
        }
    }
}

impl From<BusError> for HandlerError {
    fn from(err: BusError) -> Self {
        match err {
            BusError::Handler(inner) => inner,
            other => HandlerError::new(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        HandlerError::new(err.to_string())
    }
}

/// Type-erased command/event handler registered on a [`Bus`](crate::Bus).
#[async_trait]
pub trait Handler: Send + Sync {
    async fn call(&self, payload: Value) -> Result<Value, HandlerError>;
}

/// Adapts a typed async closure into a [`Handler`].
///
/// The payload is deserialized into `T` (failing with status 400 if it does
/// not fit) and the returned `R` serialized back into the reply payload.
pub struct FnHandler<F, T, R> {
    f: F,
    _marker: PhantomData<fn(T) -> R>,
}

impl<F, T, R> FnHandler<F, T, R> {
    pub fn new(f: F) -> Self {
        Self {
            f,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<F, Fut, T, R> Handler for FnHandler<F, T, R>
where
    F: Fn(T) -> Fut + Send + Sync,
    Fut: Future<Output = Result<R, HandlerError>> + Send,
    T: DeserializeOwned + Send,
    R: Serialize + Send,
{
    async fn call(&self, payload: Value) -> Result<Value, HandlerError> {
        let input: T = serde_json::from_value(payload)
            .map_err(|e| HandlerError::status(400, format!("invalid payload: {e}")))?;
        let output = (self.f)(input).await?;
        Ok(serde_json::to_value(output)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[test]
    fn payload_round_trip_keeps_variant() {
        for err in [
            HandlerError::new("plain"),
            HandlerError::status(409, "conflict"),
        ] {
            assert_eq!(HandlerError::from_payload(&err.to_payload()), err);
        }
    }

    #[test]
    fn foreign_payload_shapes() {
        assert_eq!(
            HandlerError::from_payload(&json!("just text")),
            HandlerError::new("just text")
        );
        assert_eq!(
            HandlerError::from_payload(&json!({"status": 503})),
            HandlerError::status(503, "")
        );
        assert_eq!(
            HandlerError::from_payload(&json!(42)),
            HandlerError::status(500, "42")
        );
        assert_eq!(
            HandlerError::from_payload(&json!({"code": "E1"})).status_code(),
            Some(500)
        );
    }

    #[derive(Deserialize)]
    struct Add {
        a: i64,
        b: i64,
    }

    #[tokio::test]
    async fn fn_handler_decodes_and_encodes() {
        let handler = FnHandler::new(|add: Add| async move { Ok::<_, HandlerError>(add.a + add.b) });
        assert_eq!(handler.call(json!({"a": 2, "b": 3})).await.unwrap(), json!(5));

        let err = handler.call(json!("nope")).await.unwrap_err();
        assert_eq!(err.status_code(), Some(400));
    }
}
