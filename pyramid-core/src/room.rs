//! Membership state of one room session
//!
//! `RoomState` is a synchronous state machine. The session driver feeds it
//! observations from relays and the media transport and acts on the events it
//! returns, so every ordering rule of a room lives here and can be tested
//! without sockets.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::Serialize;

use crate::transport::MediaStream;
use crate::types::{PeerId, RelayEndpoint, RoomName};

/// Errors kept for inspection per session
const MAX_RECORDED_ERRORS: usize = 32;

/// Lifecycle of a room session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Idle,
    Joining,
    Joined,
    Leaving,
    Left,
}

/// One remote participant
#[derive(Debug, Clone, Serialize)]
pub struct PeerRecord {
    pub peer_id: PeerId,
    pub streams: Vec<MediaStream>,
    pub joined_at: DateTime<Utc>,
}

impl PeerRecord {
    fn new(peer_id: PeerId) -> Self {
        Self {
            peer_id,
            streams: Vec::new(),
            joined_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn has_stream(&self) -> bool {
        !self.streams.is_empty()
    }
}

/// Observation fed into the state machine
#[derive(Debug, Clone)]
pub enum RoomInput {
    RelayOpened(RelayEndpoint),
    /// Any message proving the peer is present in the room
    PeerSeen(PeerId),
    PeerLeft(PeerId),
    StreamReceived { from: PeerId, stream: MediaStream },
}

/// Transition the driver must act on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomEvent {
    Joined,
    PeerJoined(PeerId),
    PeerLeft(PeerId),
    StreamReceived { from: PeerId, stream: MediaStream },
}

#[derive(Debug, Clone, Serialize)]
pub struct RecordedError {
    pub at: DateTime<Utc>,
    pub message: String,
}

#[derive(Debug)]
pub struct RoomState {
    room: RoomName,
    local_peer: PeerId,
    phase: SessionPhase,
    peers: IndexMap<PeerId, PeerRecord>,
    local_stream: Option<MediaStream>,
    errors: VecDeque<RecordedError>,
}

impl RoomState {
    #[must_use]
    pub fn new(room: RoomName, local_peer: PeerId) -> Self {
        Self {
            room,
            local_peer,
            phase: SessionPhase::Idle,
            peers: IndexMap::new(),
            local_stream: None,
            errors: VecDeque::new(),
        }
    }

    #[must_use]
    pub const fn room(&self) -> &RoomName {
        &self.room
    }

    #[must_use]
    pub const fn local_peer(&self) -> &PeerId {
        &self.local_peer
    }

    #[must_use]
    pub const fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// Remote peers in the order they were first seen
    pub fn peers(&self) -> impl Iterator<Item = &PeerRecord> {
        self.peers.values()
    }

    #[must_use]
    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.peers.keys().cloned().collect()
    }

    #[must_use]
    pub fn contains_peer(&self, peer: &PeerId) -> bool {
        self.peers.contains_key(peer)
    }

    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Every received stream, keyed by the peer it came from
    #[must_use]
    pub fn received_streams(&self) -> Vec<(PeerId, MediaStream)> {
        self.peers
            .values()
            .flat_map(|record| {
                record
                    .streams
                    .iter()
                    .map(move |stream| (record.peer_id.clone(), stream.clone()))
            })
            .collect()
    }

    #[must_use]
    pub const fn local_stream(&self) -> Option<&MediaStream> {
        self.local_stream.as_ref()
    }

    pub fn set_local_stream(&mut self, stream: MediaStream) {
        self.local_stream = Some(stream);
    }

    pub fn errors(&self) -> impl Iterator<Item = &RecordedError> {
        self.errors.iter()
    }

    /// Keep an error visible to callers; the oldest entries are dropped first
    pub fn record_error(&mut self, message: impl Into<String>) {
        if self.errors.len() == MAX_RECORDED_ERRORS {
            self.errors.pop_front();
        }
        self.errors.push_back(RecordedError {
            at: Utc::now(),
            message: message.into(),
        });
    }

    /// `Idle -> Joining`
    pub fn begin_join(&mut self) -> bool {
        if self.phase == SessionPhase::Idle {
            self.phase = SessionPhase::Joining;
            true
        } else {
            false
        }
    }

    /// `Joining | Joined -> Leaving`. Returns false when already leaving or left.
    pub fn begin_leave(&mut self) -> bool {
        match self.phase {
            SessionPhase::Leaving | SessionPhase::Left => false,
            _ => {
                self.phase = SessionPhase::Leaving;
                true
            }
        }
    }

    /// Terminal state: peers and received streams are discarded
    pub fn finish_leave(&mut self) {
        self.phase = SessionPhase::Left;
        self.peers.clear();
        self.local_stream = None;
    }

    pub fn apply(&mut self, input: RoomInput) -> Vec<RoomEvent> {
        match input {
            RoomInput::RelayOpened(_) => {
                if self.phase == SessionPhase::Joining {
                    self.phase = SessionPhase::Joined;
                    vec![RoomEvent::Joined]
                } else {
                    Vec::new()
                }
            }
            // Peer events are only produced once joined
            _ if self.phase != SessionPhase::Joined => Vec::new(),
            RoomInput::PeerSeen(peer) => self.admit(peer).into_iter().collect(),
            RoomInput::PeerLeft(peer) => match self.peers.shift_remove(&peer) {
                Some(_) => vec![RoomEvent::PeerLeft(peer)],
                None => Vec::new(),
            },
            RoomInput::StreamReceived { from, stream } => {
                if from == self.local_peer {
                    return Vec::new();
                }
                let mut events: Vec<RoomEvent> = self.admit(from.clone()).into_iter().collect();
                if let Some(record) = self.peers.get_mut(&from) {
                    if !record.streams.contains(&stream) {
                        record.streams.push(stream.clone());
                        events.push(RoomEvent::StreamReceived { from, stream });
                    }
                }
                events
            }
        }
    }

    fn admit(&mut self, peer: PeerId) -> Option<RoomEvent> {
        if peer == self.local_peer || self.peers.contains_key(&peer) {
            return None;
        }
        self.peers.insert(peer.clone(), PeerRecord::new(peer.clone()));
        Some(RoomEvent::PeerJoined(peer))
    }
}
