use serde::{Deserialize, Serialize};

use crate::constants::{EventName, WS_MAX_MESSAGE_SIZE};

/// Errors produced while encoding or decoding a [`Frame`].
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame too large ({0} bytes)")]
    TooLarge(usize),

    #[error("empty event name")]
    EmptyEvent,
}

/// Envelope for all channel traffic: a named event plus an optional
/// JSON payload.
///
/// The event is kept as a plain string so frames with names outside
/// [`EventName`] still route to subscribers by name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl Frame {
    /// Creates a frame carrying `payload` serialized as JSON.
    pub fn new<T: Serialize>(
        event: impl Into<String>,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            event: event.into(),
            data: Some(serde_json::to_value(payload)?),
        })
    }

    /// Creates a frame without payload.
    pub fn bare(event: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            data: None,
        }
    }

    /// Decodes a text message received from the wire.
    pub fn decode(text: &str) -> Result<Self, FrameError> {
        if text.len() > WS_MAX_MESSAGE_SIZE {
            return Err(FrameError::TooLarge(text.len()));
        }
        let frame: Frame = serde_json::from_str(text)?;
        if frame.event.is_empty() {
            return Err(FrameError::EmptyEvent);
        }
        Ok(frame)
    }

    /// Encodes the frame as a JSON text message.
    pub fn encode(&self) -> Result<String, FrameError> {
        if self.event.is_empty() {
            return Err(FrameError::EmptyEvent);
        }
        let json = serde_json::to_string(self)?;
        if json.len() > WS_MAX_MESSAGE_SIZE {
            return Err(FrameError::TooLarge(json.len()));
        }
        Ok(json)
    }

    /// Returns the catalogued name of this frame's event.
    pub fn name(&self) -> EventName {
        EventName::from_wire(&self.event)
    }

    /// Returns the payload, or JSON `null` when the frame has none.
    pub fn data_or_null(&self) -> serde_json::Value {
        self.data.clone().unwrap_or(serde_json::Value::Null)
    }

    /// Deserializes the payload into the given type.
    pub fn parse_data<T: for<'de> Deserialize<'de>>(
        &self,
    ) -> Result<Option<T>, serde_json::Error> {
        match &self.data {
            Some(value) => Ok(Some(T::deserialize(value)?)),
            None => Ok(None),
        }
    }

    /// Extracts a correlation key from the payload field `field`.
    ///
    /// String values are returned as-is; numeric keys are stringified so a
    /// server echoing `order_number: 42` still matches key `"42"`.
    pub fn correlation_key(&self, field: &str) -> Option<String> {
        match self.data.as_ref()?.get(field)? {
            serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}
