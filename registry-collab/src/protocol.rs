//! Wire messages exchanged between editing sites.
//!
//! [`CollabMessage`] is what sessions publish on a document channel.
//! [`RelayFrame`] wraps encoded messages for the WebSocket relay.
//!
//! Both are bincode-encoded (standard config). JSON helpers exist for the UI
//! layer, which speaks the same shapes.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::operation::Operation;
use crate::presence::CursorColor;

/// Message kinds, as named on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Operation,
    CursorUpdate,
    SelectionUpdate,
    SectionLocked,
    SectionUnlocked,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Operation => "operation",
            MessageType::CursorUpdate => "cursor_update",
            MessageType::SelectionUpdate => "selection_update",
            MessageType::SectionLocked => "section_locked",
            MessageType::SectionUnlocked => "section_unlocked",
        }
    }
}

/// A message published on a document channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollabMessage {
    Operation {
        document_id: String,
        site_id: String,
        operation: Operation,
    },
    CursorUpdate {
        document_id: String,
        site_id: String,
        position: usize,
        color: CursorColor,
    },
    SelectionUpdate {
        document_id: String,
        site_id: String,
        start: usize,
        end: usize,
        color: CursorColor,
    },
    SectionLocked {
        document_id: String,
        site_id: String,
        /// Actor holding the lock.
        holder: String,
        start: usize,
        end: usize,
    },
    SectionUnlocked {
        document_id: String,
        site_id: String,
        holder: String,
        start: usize,
        end: usize,
    },
}

impl CollabMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            CollabMessage::Operation { .. } => MessageType::Operation,
            CollabMessage::CursorUpdate { .. } => MessageType::CursorUpdate,
            CollabMessage::SelectionUpdate { .. } => MessageType::SelectionUpdate,
            CollabMessage::SectionLocked { .. } => MessageType::SectionLocked,
            CollabMessage::SectionUnlocked { .. } => MessageType::SectionUnlocked,
        }
    }

    pub fn document_id(&self) -> &str {
        match self {
            CollabMessage::Operation { document_id, .. }
            | CollabMessage::CursorUpdate { document_id, .. }
            | CollabMessage::SelectionUpdate { document_id, .. }
            | CollabMessage::SectionLocked { document_id, .. }
            | CollabMessage::SectionUnlocked { document_id, .. } => document_id,
        }
    }

    /// Site that published the message.
    pub fn site_id(&self) -> &str {
        match self {
            CollabMessage::Operation { site_id, .. }
            | CollabMessage::CursorUpdate { site_id, .. }
            | CollabMessage::SelectionUpdate { site_id, .. }
            | CollabMessage::SectionLocked { site_id, .. }
            | CollabMessage::SectionUnlocked { site_id, .. } => site_id,
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(json).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

/// Frames spoken between [`crate::relay::WsTransport`] and
/// [`crate::relay::RelayServer`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelayFrame {
    /// Start receiving everything published on `channel`.
    Subscribe { channel: String },
    /// An encoded [`CollabMessage`] for `channel`. The relay forwards the frame
    /// unchanged to every subscriber, the publisher included.
    Publish { channel: String, payload: Vec<u8> },
}

impl RelayFrame {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(frame)
    }

    pub fn channel(&self) -> &str {
        match self {
            RelayFrame::Subscribe { channel } | RelayFrame::Publish { channel, .. } => channel,
        }
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
}
