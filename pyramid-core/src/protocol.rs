//! Wire format spoken between room sessions and rendezvous relays
//!
//! Frames are JSON text messages tagged by `type`. Clients subscribe to a topic
//! (`<app_id>@<room>`) and publish signal messages to it; the relay forwards
//! each published message to the other subscribers of that topic.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::PeerId;

/// Envelope exchanged with the relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayFrame {
    /// Client asks to receive messages published to `topic`
    Subscribe { topic: String },
    Unsubscribe { topic: String },
    /// Client publishes a message to every other subscriber of `topic`
    Publish { topic: String, message: SignalMessage },
    /// Relay delivers a message published by someone else
    Message { topic: String, message: SignalMessage },
    /// Relay diagnostic (limits exceeded, malformed frame, ...)
    Notice { message: String },
}

impl RelayFrame {
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    #[must_use]
    pub fn topic(&self) -> Option<&str> {
        match self {
            Self::Subscribe { topic }
            | Self::Unsubscribe { topic }
            | Self::Publish { topic, .. }
            | Self::Message { topic, .. } => Some(topic),
            Self::Notice { .. } => None,
        }
    }
}

/// Membership and setup messages exchanged inside a room
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalMessage {
    /// Presence. Broadcast when `reply_to` is empty, otherwise a directed answer
    /// to a broadcast announce from `reply_to`.
    Announce {
        peer_id: PeerId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply_to: Option<PeerId>,
    },
    Leave { peer_id: PeerId },
    /// Opaque media transport setup payload for a single peer
    Signal {
        id: String,
        from: PeerId,
        to: PeerId,
        payload: serde_json::Value,
    },
}

impl SignalMessage {
    #[must_use]
    pub fn announce(peer_id: PeerId) -> Self {
        Self::Announce {
            peer_id,
            reply_to: None,
        }
    }

    #[must_use]
    pub fn reply(peer_id: PeerId, to: PeerId) -> Self {
        Self::Announce {
            peer_id,
            reply_to: Some(to),
        }
    }

    /// Peer that produced the message
    #[must_use]
    pub const fn sender(&self) -> &PeerId {
        match self {
            Self::Announce { peer_id, .. } | Self::Leave { peer_id } => peer_id,
            Self::Signal { from, .. } => from,
        }
    }

    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Announce { .. } => "announce",
            Self::Leave { .. } => "leave",
            Self::Signal { .. } => "signal",
        }
    }
}
