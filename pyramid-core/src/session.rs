//! Room sessions
//!
//! A [`RoomSession`] is a handle to one room. Joining spawns a driver task that
//! owns the room's relay connections, its media transport and its observers.
//! Everything that happens in the room (relay frames, transport events, handle
//! commands) is processed by that task one item at a time, so observers never
//! run concurrently and see transitions in delivery order.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use lru::LruCache;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SignalConfig;
use crate::error::Result;
use crate::protocol::{RelayFrame, SignalMessage};
use crate::relay::{ConnectionState, RelayConnection, RelayEvent, RelayEventKind, RelayMonitor, RelayStatus};
use crate::room::{RecordedError, RoomEvent, RoomInput, RoomState, SessionPhase};
use crate::transport::{MediaStream, MediaTransport, MediaTransportFactory, TransportEvent, TransportLink};
use crate::types::{topic_path, PeerId, RoomName, StreamId};

/// Signal message ids remembered for duplicate suppression
const SEEN_SIGNAL_CAPACITY: usize = 512;

/// Callback for peer join and leave transitions
pub type PeerCallback = Box<dyn FnMut(&mut RoomContext<'_>, &PeerId) + Send>;

/// Callback for received streams
pub type StreamCallback = Box<dyn FnMut(&mut RoomContext<'_>, &PeerId, &MediaStream) + Send>;

/// What an observer may do while it runs
pub struct RoomContext<'a> {
    room: &'a RoomName,
    local_peer: &'a PeerId,
    state: &'a RwLock<RoomState>,
    transport: &'a mut dyn MediaTransport,
}

impl RoomContext<'_> {
    #[must_use]
    pub const fn room(&self) -> &RoomName {
        self.room
    }

    #[must_use]
    pub const fn local_peer(&self) -> &PeerId {
        self.local_peer
    }

    #[must_use]
    pub fn peers(&self) -> Vec<PeerId> {
        self.state.read().peer_ids()
    }

    /// Same as [`RoomSession::attach_stream`], applied immediately
    pub fn attach_stream(&mut self, stream: &MediaStream, target: Option<&PeerId>) {
        attach(self.state, self.transport, stream, target);
    }
}

fn attach(
    state: &RwLock<RoomState>,
    transport: &mut dyn MediaTransport,
    stream: &MediaStream,
    target: Option<&PeerId>,
) {
    if target.is_none() {
        state.write().set_local_stream(stream.clone());
    }
    transport.add_stream(stream, target);
}

#[derive(Default)]
struct Observers {
    peer_join: Vec<PeerCallback>,
    peer_leave: Vec<PeerCallback>,
    stream: Vec<StreamCallback>,
}

enum Command {
    OnPeerJoin(PeerCallback),
    OnPeerLeave(PeerCallback),
    OnStream(StreamCallback),
    AttachStream {
        stream: MediaStream,
        target: Option<PeerId>,
    },
    Leave(oneshot::Sender<()>),
}

/// Serialisable view of a session for debugging surfaces
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub room: RoomName,
    pub topic: String,
    pub local_peer: PeerId,
    pub phase: SessionPhase,
    pub peers: Vec<PeerSnapshot>,
    pub local_stream: Option<StreamId>,
    pub relays: Vec<RelayStatus>,
    pub errors: Vec<RecordedError>,
    pub captured_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PeerSnapshot {
    pub peer_id: PeerId,
    pub streams: Vec<StreamId>,
    pub joined_at: DateTime<Utc>,
}

/// Builder used to register observers before any room event can fire
pub struct RoomSessionBuilder {
    config: SignalConfig,
    room: RoomName,
    local_peer: Option<PeerId>,
    observers: Observers,
}

impl RoomSessionBuilder {
    #[must_use]
    pub fn peer_id(mut self, peer: PeerId) -> Self {
        self.local_peer = Some(peer);
        self
    }

    #[must_use]
    pub fn on_peer_join<F>(mut self, callback: F) -> Self
    where
        F: FnMut(&mut RoomContext<'_>, &PeerId) + Send + 'static,
    {
        self.observers.peer_join.push(Box::new(callback));
        self
    }

    #[must_use]
    pub fn on_peer_leave<F>(mut self, callback: F) -> Self
    where
        F: FnMut(&mut RoomContext<'_>, &PeerId) + Send + 'static,
    {
        self.observers.peer_leave.push(Box::new(callback));
        self
    }

    #[must_use]
    pub fn on_stream<F>(mut self, callback: F) -> Self
    where
        F: FnMut(&mut RoomContext<'_>, &PeerId, &MediaStream) + Send + 'static,
    {
        self.observers.stream.push(Box::new(callback));
        self
    }

    /// Open relay connections and start announcing. Returns without waiting
    /// for any relay; must be called inside a tokio runtime.
    pub fn join(self, transports: &dyn MediaTransportFactory) -> Result<RoomSession> {
        let endpoints = self.config.relay_endpoints()?;
        let local_peer = self.local_peer.unwrap_or_else(PeerId::generate);
        let topic = topic_path(&[&self.config.app_id, self.room.as_str()]);

        let state = Arc::new(RwLock::new(RoomState::new(self.room.clone(), local_peer.clone())));
        state.write().begin_join();

        let (relay_tx, relay_rx) = mpsc::unbounded_channel();
        let policy = self.config.retry_policy();
        let relays: Vec<RelayConnection> = endpoints
            .into_iter()
            .map(|endpoint| RelayConnection::open(endpoint, policy, relay_tx.clone()))
            .collect();
        let monitors = relays.iter().map(RelayConnection::monitor).collect();

        let (link, transport_rx) = TransportLink::channel();
        let transport = transports.create(&self.room, &local_peer, link);

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let cancel_token = CancellationToken::new();

        info!(
            room = %self.room,
            topic = %topic,
            peer_id = %local_peer,
            relays = relays.len(),
            "Joining room"
        );

        let driver = SessionDriver {
            room: self.room.clone(),
            topic: topic.clone(),
            local_peer: local_peer.clone(),
            config: self.config,
            relays,
            transport,
            state: state.clone(),
            observers: self.observers,
            last_seen: HashMap::new(),
            seen_signals: LruCache::new(
                NonZeroUsize::new(SEEN_SIGNAL_CAPACITY).unwrap_or(NonZeroUsize::MIN),
            ),
            signal_seq: 0,
            commands: command_rx,
            relay_events: relay_rx,
            transport_events: transport_rx,
            cancel_token: cancel_token.clone(),
        };
        tokio::spawn(driver.run());

        Ok(RoomSession {
            room: self.room,
            topic,
            local_peer,
            state,
            monitors,
            commands: command_tx,
            cancel_token,
        })
    }
}

/// Handle to a joined room. Dropping it tears the room down.
pub struct RoomSession {
    room: RoomName,
    topic: String,
    local_peer: PeerId,
    state: Arc<RwLock<RoomState>>,
    monitors: Vec<RelayMonitor>,
    commands: mpsc::UnboundedSender<Command>,
    cancel_token: CancellationToken,
}

impl RoomSession {
    #[must_use]
    pub fn builder(config: SignalConfig, room: impl Into<RoomName>) -> RoomSessionBuilder {
        RoomSessionBuilder {
            config,
            room: room.into(),
            local_peer: None,
            observers: Observers::default(),
        }
    }

    /// Join `room` with a generated peer id and no observers yet
    pub fn join(
        config: SignalConfig,
        room: impl Into<RoomName>,
        transports: &dyn MediaTransportFactory,
    ) -> Result<Self> {
        Self::builder(config, room).join(transports)
    }

    #[must_use]
    pub const fn room(&self) -> &RoomName {
        &self.room
    }

    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    #[must_use]
    pub const fn local_peer(&self) -> &PeerId {
        &self.local_peer
    }

    #[must_use]
    pub fn phase(&self) -> SessionPhase {
        self.state.read().phase()
    }

    #[must_use]
    pub fn peers(&self) -> Vec<PeerId> {
        self.state.read().peer_ids()
    }

    #[must_use]
    pub fn received_streams(&self) -> Vec<(PeerId, MediaStream)> {
        self.state.read().received_streams()
    }

    #[must_use]
    pub fn relay_states(&self) -> Vec<ConnectionState> {
        self.monitors.iter().map(RelayMonitor::state).collect()
    }

    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        let state = self.state.read();
        SessionSnapshot {
            room: self.room.clone(),
            topic: self.topic.clone(),
            local_peer: self.local_peer.clone(),
            phase: state.phase(),
            peers: state
                .peers()
                .map(|record| PeerSnapshot {
                    peer_id: record.peer_id.clone(),
                    streams: record.streams.iter().map(|s| s.id.clone()).collect(),
                    joined_at: record.joined_at,
                })
                .collect(),
            local_stream: state.local_stream().map(|s| s.id.clone()),
            relays: self.monitors.iter().map(RelayMonitor::status).collect(),
            errors: state.errors().cloned().collect(),
            captured_at: Utc::now(),
        }
    }

    pub fn on_peer_join<F>(&self, callback: F)
    where
        F: FnMut(&mut RoomContext<'_>, &PeerId) + Send + 'static,
    {
        self.command(Command::OnPeerJoin(Box::new(callback)));
    }

    pub fn on_peer_leave<F>(&self, callback: F)
    where
        F: FnMut(&mut RoomContext<'_>, &PeerId) + Send + 'static,
    {
        self.command(Command::OnPeerLeave(Box::new(callback)));
    }

    pub fn on_stream<F>(&self, callback: F)
    where
        F: FnMut(&mut RoomContext<'_>, &PeerId, &MediaStream) + Send + 'static,
    {
        self.command(Command::OnStream(Box::new(callback)));
    }

    /// Offer `stream` to one peer, or to every current and future peer when
    /// `target` is `None`
    pub fn attach_stream(&self, stream: MediaStream, target: Option<PeerId>) {
        self.command(Command::AttachStream { stream, target });
    }

    /// Leave the room and wait for teardown. Safe to call more than once.
    pub async fn leave(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Leave(tx)).is_err() {
            return;
        }
        let _ = rx.await;
    }

    fn command(&self, command: Command) {
        if self.commands.send(command).is_err() {
            debug!(room = %self.room, "Room session already left, ignoring command");
        }
    }
}

impl Drop for RoomSession {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

struct SessionDriver {
    room: RoomName,
    topic: String,
    local_peer: PeerId,
    config: SignalConfig,
    relays: Vec<RelayConnection>,
    transport: Box<dyn MediaTransport>,
    state: Arc<RwLock<RoomState>>,
    observers: Observers,
    last_seen: HashMap<PeerId, Instant>,
    seen_signals: LruCache<String, ()>,
    signal_seq: u64,
    commands: mpsc::UnboundedReceiver<Command>,
    relay_events: mpsc::UnboundedReceiver<RelayEvent>,
    transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    cancel_token: CancellationToken,
}

impl SessionDriver {
    async fn run(mut self) {
        let mut announce = tokio::time::interval(self.config.announce_interval());
        announce.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; relays announce on open instead
        announce.tick().await;

        let leave_ack = loop {
            tokio::select! {
                biased;

                () = self.cancel_token.cancelled() => break None,
                command = self.commands.recv() => match command {
                    Some(Command::Leave(ack)) => break Some(ack),
                    Some(command) => self.handle_command(command),
                    None => break None,
                },
                Some(event) = self.relay_events.recv() => self.handle_relay_event(event),
                Some(event) = self.transport_events.recv() => self.handle_transport_event(event),
                _ = announce.tick() => {
                    self.broadcast(&SignalMessage::announce(self.local_peer.clone()));
                    self.expire_silent_peers();
                }
            }
        };

        self.teardown();
        if let Some(ack) = leave_ack {
            let _ = ack.send(());
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::OnPeerJoin(callback) => self.observers.peer_join.push(callback),
            Command::OnPeerLeave(callback) => self.observers.peer_leave.push(callback),
            Command::OnStream(callback) => self.observers.stream.push(callback),
            Command::AttachStream { stream, target } => {
                debug!(
                    room = %self.room,
                    stream_id = %stream.id,
                    target = ?target.as_ref().map(PeerId::as_str),
                    "Attaching stream"
                );
                attach(&self.state, self.transport.as_mut(), &stream, target.as_ref());
            }
            // Handled by the run loop
            Command::Leave(_) => {}
        }
    }

    fn handle_relay_event(&mut self, event: RelayEvent) {
        match event.kind {
            RelayEventKind::Opened => {
                let events = self.state.write().apply(RoomInput::RelayOpened(event.endpoint.clone()));
                self.dispatch(events);

                let Some(relay) = self.relays.iter().find(|r| r.endpoint() == &event.endpoint) else {
                    return;
                };
                let subscribe = RelayFrame::Subscribe {
                    topic: self.topic.clone(),
                };
                let announce = RelayFrame::Publish {
                    topic: self.topic.clone(),
                    message: SignalMessage::announce(self.local_peer.clone()),
                };
                for frame in [subscribe, announce] {
                    match frame.encode() {
                        Ok(text) => {
                            relay.send(text);
                        }
                        Err(e) => warn!(room = %self.room, error = %e, "Failed to encode relay frame"),
                    }
                }
            }
            RelayEventKind::Closed { error } => {
                if let Some(error) = error {
                    self.state
                        .write()
                        .record_error(format!("relay {}: {error}", event.endpoint));
                }
            }
            RelayEventKind::Message(text) => match RelayFrame::decode(&text) {
                Ok(RelayFrame::Message { topic, message }) if topic == self.topic => {
                    self.handle_signal_message(message);
                }
                Ok(RelayFrame::Message { topic, .. }) => {
                    debug!(room = %self.room, topic = %topic, "Ignoring message for another topic");
                }
                Ok(RelayFrame::Notice { message }) => {
                    warn!(room = %self.room, relay = %event.endpoint, notice = %message, "Relay notice");
                    self.state
                        .write()
                        .record_error(format!("relay {} notice: {message}", event.endpoint));
                }
                Ok(other) => {
                    debug!(
                        room = %self.room,
                        topic = other.topic().unwrap_or_default(),
                        "Ignoring client-side frame from relay"
                    );
                }
                Err(e) => {
                    warn!(room = %self.room, relay = %event.endpoint, error = %e, "Malformed relay frame");
                    self.state
                        .write()
                        .record_error(format!("relay {} sent a malformed frame: {e}", event.endpoint));
                }
            },
        }
    }

    fn handle_signal_message(&mut self, message: SignalMessage) {
        if message.sender() == &self.local_peer {
            return;
        }

        match message {
            SignalMessage::Announce { peer_id, reply_to } => {
                if reply_to.as_ref().is_some_and(|to| to != &self.local_peer) {
                    return;
                }
                self.last_seen.insert(peer_id.clone(), Instant::now());
                let joined = self.observe(RoomInput::PeerSeen(peer_id.clone()));
                if joined && reply_to.is_none() {
                    self.broadcast(&SignalMessage::reply(self.local_peer.clone(), peer_id));
                }
            }
            SignalMessage::Leave { peer_id } => {
                self.observe(RoomInput::PeerLeft(peer_id));
            }
            SignalMessage::Signal { id, from, to, payload } => {
                if to != self.local_peer || self.seen_signals.put(id, ()).is_some() {
                    return;
                }
                self.last_seen.insert(from.clone(), Instant::now());
                self.observe(RoomInput::PeerSeen(from.clone()));
                if self.state.read().contains_peer(&from) {
                    self.transport.handle_signal(&from, payload);
                }
            }
        }
    }

    fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Signal { to, payload } => {
                self.signal_seq += 1;
                let message = SignalMessage::Signal {
                    id: format!("{}-{}", self.local_peer, self.signal_seq),
                    from: self.local_peer.clone(),
                    to,
                    payload,
                };
                if self.broadcast(&message) == 0 {
                    debug!(room = %self.room, "No open relay, setup message dropped");
                }
            }
            TransportEvent::StreamReceived { from, stream } => {
                self.observe(RoomInput::StreamReceived { from, stream });
            }
            TransportEvent::PeerLost { peer } => {
                self.observe(RoomInput::PeerLeft(peer));
            }
        }
    }

    /// Apply an input and dispatch its events. Returns whether a peer joined.
    fn observe(&mut self, input: RoomInput) -> bool {
        let events = self.state.write().apply(input);
        let joined = events.iter().any(|e| matches!(e, RoomEvent::PeerJoined(_)));
        self.dispatch(events);
        joined
    }

    fn dispatch(&mut self, events: Vec<RoomEvent>) {
        for event in events {
            match event {
                RoomEvent::Joined => {
                    info!(room = %self.room, peer_id = %self.local_peer, "Room joined");
                }
                RoomEvent::PeerJoined(peer) => {
                    info!(room = %self.room, peer_id = %peer, "Peer joined");
                    self.last_seen.entry(peer.clone()).or_insert_with(Instant::now);
                    self.transport.peer_joined(&peer);
                    let local_stream = self.state.read().local_stream().cloned();
                    if let Some(stream) = local_stream {
                        self.transport.add_stream(&stream, Some(&peer));
                    }

                    for callback in &mut self.observers.peer_join {
                        let mut ctx = RoomContext {
                            room: &self.room,
                            local_peer: &self.local_peer,
                            state: &self.state,
                            transport: self.transport.as_mut(),
                        };
                        callback(&mut ctx, &peer);
                    }
                }
                RoomEvent::PeerLeft(peer) => {
                    info!(room = %self.room, peer_id = %peer, "Peer left");
                    self.last_seen.remove(&peer);
                    self.transport.remove_peer(&peer);

                    for callback in &mut self.observers.peer_leave {
                        let mut ctx = RoomContext {
                            room: &self.room,
                            local_peer: &self.local_peer,
                            state: &self.state,
                            transport: self.transport.as_mut(),
                        };
                        callback(&mut ctx, &peer);
                    }
                }
                RoomEvent::StreamReceived { from, stream } => {
                    info!(room = %self.room, peer_id = %from, stream_id = %stream.id, "Stream received");

                    for callback in &mut self.observers.stream {
                        let mut ctx = RoomContext {
                            room: &self.room,
                            local_peer: &self.local_peer,
                            state: &self.state,
                            transport: self.transport.as_mut(),
                        };
                        callback(&mut ctx, &from, &stream);
                    }
                }
            }
        }
    }

    fn expire_silent_peers(&mut self) {
        let timeout = self.config.peer_timeout();
        let expired: Vec<PeerId> = self
            .last_seen
            .iter()
            .filter(|(_, seen)| seen.elapsed() > timeout)
            .map(|(peer, _)| peer.clone())
            .collect();

        for peer in expired {
            warn!(room = %self.room, peer_id = %peer, "Peer went silent, treating as left");
            self.last_seen.remove(&peer);
            self.observe(RoomInput::PeerLeft(peer));
        }
    }

    /// Publish to every open relay. Returns how many relays accepted the frame.
    fn broadcast(&self, message: &SignalMessage) -> usize {
        let frame = RelayFrame::Publish {
            topic: self.topic.clone(),
            message: message.clone(),
        };
        let text = match frame.encode() {
            Ok(text) => text,
            Err(e) => {
                warn!(room = %self.room, error = %e, "Failed to encode relay frame");
                return 0;
            }
        };
        self.relays.iter().filter(|relay| relay.send(text.clone())).count()
    }

    fn teardown(&mut self) {
        if !self.state.write().begin_leave() {
            return;
        }
        info!(room = %self.room, peer_id = %self.local_peer, "Leaving room");

        // Best effort, peers also expire us once announcements stop
        self.broadcast(&SignalMessage::Leave {
            peer_id: self.local_peer.clone(),
        });
        if let Ok(text) = (RelayFrame::Unsubscribe {
            topic: self.topic.clone(),
        })
        .encode()
        {
            for relay in &self.relays {
                relay.send(text.clone());
            }
        }
        for relay in &self.relays {
            relay.close();
        }
        self.transport.close();
        self.last_seen.clear();
        self.state.write().finish_leave();
        info!(room = %self.room, "Room left");
    }
}
