//! `topic:payload` message framing

use serde::{de::DeserializeOwned, Serialize};

use crate::errors::CommonError;
use crate::topics::Topics;

const DELIMITER: u8 = b':';

/// A routed message. The payload is opaque bytes; every message the system
/// itself sends carries JSON.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }

    /// Build a message carrying `value` serialized as JSON
    pub fn json<T: Serialize>(topic: impl Into<String>, value: &T) -> Result<Self, CommonError> {
        Ok(Self::new(topic, serde_json::to_vec(value)?))
    }

    pub fn parse_json<T: DeserializeOwned>(&self) -> Result<T, CommonError> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    /// Encode as a single frame
    pub fn encode(&self) -> Result<Vec<u8>, CommonError> {
        Topics::validate(&self.topic)?;
        let mut frame = Vec::with_capacity(self.topic.len() + 1 + self.payload.len());
        frame.extend_from_slice(self.topic.as_bytes());
        frame.push(DELIMITER);
        frame.extend_from_slice(&self.payload);
        Ok(frame)
    }

    /// Split a frame on its first delimiter. Only the topic has to be text.
    pub fn decode(frame: &[u8]) -> Result<Self, CommonError> {
        let split = frame.iter().position(|b| *b == DELIMITER).ok_or_else(|| {
            CommonError::FrameError(format!("missing topic delimiter in {} byte frame", frame.len()))
        })?;
        let topic = std::str::from_utf8(&frame[..split])
            .map_err(|e| CommonError::FrameError(format!("topic is not utf-8: {}", e)))?;
        if topic.is_empty() {
            return Err(CommonError::FrameError("empty topic".to_string()));
        }
        Ok(Self::new(topic, &frame[split + 1..]))
    }
}
