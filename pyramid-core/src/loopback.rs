//! Reference media transport that carries stream handles over signaling
//!
//! No media is moved. Offering a stream sends a small setup payload naming the
//! stream; the receiving side reports it as a received stream. Useful for
//! development shells and for exercising room sessions end to end.

use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::transport::{MediaStream, MediaTransport, MediaTransportFactory, TransportLink};
use crate::types::{PeerId, RoomName, StreamId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum LoopbackPayload {
    Stream { stream_id: StreamId },
}

pub struct LoopbackTransport {
    room: RoomName,
    link: TransportLink,
    peers: IndexSet<PeerId>,
    closed: bool,
}

impl LoopbackTransport {
    #[must_use]
    pub fn new(room: RoomName, link: TransportLink) -> Self {
        Self {
            room,
            link,
            peers: IndexSet::new(),
            closed: false,
        }
    }

    fn offer(&self, stream: &MediaStream, peer: &PeerId) {
        let payload = LoopbackPayload::Stream {
            stream_id: stream.id.clone(),
        };
        match serde_json::to_value(&payload) {
            Ok(value) => self.link.send_signal(peer, value),
            Err(e) => warn!(room = %self.room, error = %e, "Failed to encode stream offer"),
        }
    }
}

impl MediaTransport for LoopbackTransport {
    fn add_stream(&mut self, stream: &MediaStream, target: Option<&PeerId>) {
        if self.closed {
            return;
        }
        match target {
            Some(peer) => self.offer(stream, peer),
            None => {
                for peer in &self.peers {
                    self.offer(stream, peer);
                }
            }
        }
    }

    fn peer_joined(&mut self, peer: &PeerId) {
        self.peers.insert(peer.clone());
    }

    fn handle_signal(&mut self, from: &PeerId, payload: serde_json::Value) {
        if self.closed {
            return;
        }
        match serde_json::from_value::<LoopbackPayload>(payload) {
            Ok(LoopbackPayload::Stream { stream_id }) => {
                debug!(room = %self.room, peer_id = %from, stream_id = %stream_id, "Stream offered");
                self.link.stream_received(from, MediaStream::new(stream_id));
            }
            Err(e) => warn!(room = %self.room, peer_id = %from, error = %e, "Ignoring unknown setup payload"),
        }
    }

    fn remove_peer(&mut self, peer: &PeerId) {
        self.peers.shift_remove(peer);
    }

    fn close(&mut self) {
        self.closed = true;
        self.peers.clear();
    }
}

/// Factory handing out [`LoopbackTransport`]s
#[derive(Debug, Clone, Copy, Default)]
pub struct LoopbackTransportFactory;

impl MediaTransportFactory for LoopbackTransportFactory {
    fn create(
        &self,
        room: &RoomName,
        _local_peer: &PeerId,
        link: TransportLink,
    ) -> Box<dyn MediaTransport> {
        Box::new(LoopbackTransport::new(room.clone(), link))
    }
}
