//! Boundary to the peer-to-peer media transport
//!
//! Media negotiation itself (ICE, SDP, codecs) happens behind
//! [`MediaTransport`]. A room session drives the transport with membership
//! changes and inbound setup payloads; the transport talks back through its
//! [`TransportLink`].

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::types::{PeerId, RoomName, StreamId};

/// Opaque handle to a media stream owned by the transport
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MediaStream {
    pub id: StreamId,
}

impl MediaStream {
    pub fn new(id: impl Into<StreamId>) -> Self {
        Self { id: id.into() }
    }
}

/// What a transport reports back to its session
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Setup payload that must reach `to` over the signaling channel
    Signal {
        to: PeerId,
        payload: serde_json::Value,
    },
    StreamReceived { from: PeerId, stream: MediaStream },
    /// The media connection to `peer` is gone
    PeerLost { peer: PeerId },
}

/// Channel a transport uses to talk to its room session
#[derive(Debug, Clone)]
pub struct TransportLink {
    tx: mpsc::UnboundedSender<TransportEvent>,
}

impl TransportLink {
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn send_signal(&self, to: &PeerId, payload: serde_json::Value) {
        self.emit(TransportEvent::Signal {
            to: to.clone(),
            payload,
        });
    }

    pub fn stream_received(&self, from: &PeerId, stream: MediaStream) {
        self.emit(TransportEvent::StreamReceived {
            from: from.clone(),
            stream,
        });
    }

    pub fn peer_lost(&self, peer: &PeerId) {
        self.emit(TransportEvent::PeerLost { peer: peer.clone() });
    }

    fn emit(&self, event: TransportEvent) {
        // Send fails only after the session is gone
        let _ = self.tx.send(event);
    }
}

/// Media transport for a single room
pub trait MediaTransport: Send {
    /// Offer `stream` to `target`, or to every currently connected peer
    fn add_stream(&mut self, stream: &MediaStream, target: Option<&PeerId>);

    /// A peer entered the room and may be negotiated with
    fn peer_joined(&mut self, peer: &PeerId);

    /// Setup payload sent by `from`
    fn handle_signal(&mut self, from: &PeerId, payload: serde_json::Value);

    fn remove_peer(&mut self, peer: &PeerId);

    fn close(&mut self);
}

/// Creates one transport per room session
pub trait MediaTransportFactory: Send + Sync {
    fn create(&self, room: &RoomName, local_peer: &PeerId, link: TransportLink)
        -> Box<dyn MediaTransport>;
}
