//! Hierarchy manager
//!
//! Owns at most two room sessions: the primary one (broadcasting an original
//! stream or watching a descriptor) and an optional rebroadcast session that
//! forwards the streams received in the primary room to its own viewers.

use std::sync::Arc;

use chrono::Utc;
use indexmap::IndexMap;
use nanoid::nanoid;
use parking_lot::{Mutex, RwLock};
use pyramid_core::{
    DescriptorId, Error, HierarchyConfig, MediaStream, MediaTransportFactory, PeerId,
    PyramidConfig, Result, RoomName, RoomSession, SignalConfig, StreamId,
};
use serde::Serialize;
use tracing::{debug, info};

use crate::chain::{self, StreamChain};
use crate::debug::{DebugSnapshot, IncomingStream, RoomDebug};
use crate::descriptor::{DescriptorDraft, StreamDescriptor};
use crate::store::DescriptorStore;

const ROOM_TOKEN_ALPHABET: [char; 36] = [
    '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', 'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h',
    'i', 'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r', 's', 't', 'u', 'v', 'w', 'x', 'y', 'z',
];

const ROOM_TOKEN_LEN: usize = 9;

/// Streams received in the primary room, keyed by sender and stream
type IncomingCache = Arc<RwLock<IndexMap<(PeerId, StreamId), MediaStream>>>;

/// What the local participant is doing in a room
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomRole {
    Broadcasting,
    Watching,
    Rebroadcasting,
}

/// Result of a rebroadcast request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebroadcastOutcome {
    Started(StreamDescriptor),
    /// No incoming stream was cached; nothing was published or joined
    NothingToRebroadcast,
}

struct ActiveRoom {
    role: RoomRole,
    descriptor: StreamDescriptor,
    session: RoomSession,
}

impl ActiveRoom {
    fn debug(&self) -> RoomDebug {
        RoomDebug {
            role: self.role,
            descriptor: self.descriptor.clone(),
            session: self.session.snapshot(),
        }
    }
}

/// Publishes, watches and rebroadcasts streams in a pyramid
pub struct HierarchyManager {
    signal: SignalConfig,
    hierarchy: HierarchyConfig,
    store: Arc<dyn DescriptorStore>,
    transports: Arc<dyn MediaTransportFactory>,
    local_peer: PeerId,
    incoming: IncomingCache,
    /// Serialises room-changing operations
    ops: tokio::sync::Mutex<()>,
    primary: Mutex<Option<ActiveRoom>>,
    rebroadcast: Mutex<Option<ActiveRoom>>,
}

impl HierarchyManager {
    pub fn new(
        config: &PyramidConfig,
        store: Arc<dyn DescriptorStore>,
        transports: Arc<dyn MediaTransportFactory>,
    ) -> Self {
        Self {
            signal: config.signal.clone(),
            hierarchy: config.hierarchy.clone(),
            store,
            transports,
            local_peer: PeerId::generate(),
            incoming: Arc::new(RwLock::new(IndexMap::new())),
            ops: tokio::sync::Mutex::new(()),
            primary: Mutex::new(None),
            rebroadcast: Mutex::new(None),
        }
    }

    /// Use a fixed peer id in every room instead of a generated one
    #[must_use]
    pub fn with_peer_id(mut self, peer: PeerId) -> Self {
        self.local_peer = peer;
        self
    }

    #[must_use]
    pub const fn local_peer(&self) -> &PeerId {
        &self.local_peer
    }

    /// Publish a draft through the store. Failures are returned as
    /// [`Error::Publish`] and never retried.
    pub async fn publish_descriptor(&self, draft: DescriptorDraft) -> Result<StreamDescriptor> {
        let record = self.store.publish(draft).await.map_err(|e| match e {
            Error::Publish(_) => e,
            other => Error::Publish(other.to_string()),
        })?;
        let descriptor = StreamDescriptor::from_record(&record)?;
        info!(
            id = %descriptor.id,
            depth = descriptor.depth,
            room = %descriptor.room,
            "Descriptor published"
        );
        Ok(descriptor)
    }

    /// Look a descriptor up, waiting at most the configured fetch timeout
    pub async fn fetch_descriptor(&self, id: &DescriptorId) -> Result<Option<StreamDescriptor>> {
        chain::fetch_descriptor(self.store.as_ref(), id, self.hierarchy.fetch_timeout()).await
    }

    /// Root-first chain ending at `leaf`
    pub async fn stream_chain(&self, leaf: &DescriptorId) -> StreamChain {
        chain::walk_chain(
            self.store.as_ref(),
            leaf,
            self.hierarchy.fetch_timeout(),
            self.hierarchy.max_chain_hops,
        )
        .await
    }

    /// Publish an original stream and offer `stream` to everyone in its room
    pub async fn go_live(&self, title: &str, stream: MediaStream) -> Result<StreamDescriptor> {
        let _guard = self.ops.lock().await;
        self.ensure_no_primary()?;

        let descriptor = self.publish_descriptor(DescriptorDraft::root(title)?).await?;
        let session = RoomSession::builder(self.signal.clone(), descriptor.room.clone())
            .peer_id(self.local_peer.clone())
            .join(self.transports.as_ref())?;
        session.attach_stream(stream, None);

        *self.primary.lock() = Some(ActiveRoom {
            role: RoomRole::Broadcasting,
            descriptor: descriptor.clone(),
            session,
        });
        Ok(descriptor)
    }

    /// Join the room of descriptor `id` and cache every stream received there
    pub async fn watch(&self, id: &DescriptorId) -> Result<StreamDescriptor> {
        let _guard = self.ops.lock().await;
        self.ensure_no_primary()?;

        let descriptor = self
            .fetch_descriptor(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("descriptor {id}")))?;

        self.incoming.write().clear();
        let on_stream = self.incoming.clone();
        let on_leave = self.incoming.clone();
        let session = RoomSession::builder(self.signal.clone(), descriptor.room.clone())
            .peer_id(self.local_peer.clone())
            .on_stream(move |ctx, peer, stream| {
                on_stream
                    .write()
                    .insert((peer.clone(), stream.id.clone()), stream.clone());
                debug!(room = %ctx.room(), peer_id = %peer, stream_id = %stream.id, "Incoming stream cached");
            })
            .on_peer_leave(move |_ctx, peer| {
                on_leave.write().retain(|(from, _), _| from != peer);
            })
            .join(self.transports.as_ref())?;

        info!(id = %descriptor.id, room = %descriptor.room, depth = descriptor.depth, "Watching stream");
        *self.primary.lock() = Some(ActiveRoom {
            role: RoomRole::Watching,
            descriptor: descriptor.clone(),
            session,
        });
        Ok(descriptor)
    }

    /// Start a rebroadcast of the watched stream in a new room.
    ///
    /// Every viewer joining the new room is offered each cached incoming
    /// stream individually.
    pub async fn rebroadcast(&self, title: Option<&str>) -> Result<RebroadcastOutcome> {
        let _guard = self.ops.lock().await;

        if self.incoming.read().is_empty() {
            info!("No incoming streams, nothing to rebroadcast");
            return Ok(RebroadcastOutcome::NothingToRebroadcast);
        }
        if self.rebroadcast.lock().is_some() {
            return Err(Error::InvalidState("already rebroadcasting".to_string()));
        }
        let parent = self
            .primary
            .lock()
            .as_ref()
            .filter(|room| room.role == RoomRole::Watching)
            .map(|room| room.descriptor.clone())
            .ok_or_else(|| Error::InvalidState("not watching any stream".to_string()))?;

        let chain = self.stream_chain(&parent.id).await;
        let root = chain
            .root()
            .map_or_else(|| parent.root.clone(), |root| root.id.clone());

        let room = RoomName::new(format!(
            "restream-{}-{}",
            Utc::now().timestamp_millis(),
            nanoid!(ROOM_TOKEN_LEN, &ROOM_TOKEN_ALPHABET)
        ));
        let title = title.map_or_else(|| format!("Rebroadcast: {}", parent.title), str::to_string);

        let draft = DescriptorDraft::rebroadcast(&title, &room, &parent, &root)?;
        let descriptor = self.publish_descriptor(draft).await?;

        let cache = self.incoming.clone();
        let session = RoomSession::builder(self.signal.clone(), room)
            .peer_id(self.local_peer.clone())
            .on_peer_join(move |ctx, peer| {
                let streams: Vec<MediaStream> = cache.read().values().cloned().collect();
                for stream in &streams {
                    ctx.attach_stream(stream, Some(peer));
                }
                info!(room = %ctx.room(), peer_id = %peer, streams = streams.len(), "Fanned out cached streams");
            })
            .join(self.transports.as_ref())?;

        info!(
            id = %descriptor.id,
            parent = %parent.id,
            root = %descriptor.root,
            depth = descriptor.depth,
            "Rebroadcast started"
        );
        *self.rebroadcast.lock() = Some(ActiveRoom {
            role: RoomRole::Rebroadcasting,
            descriptor: descriptor.clone(),
            session,
        });
        Ok(RebroadcastOutcome::Started(descriptor))
    }

    /// Leave the rebroadcast room, keeping the primary one. Returns whether a
    /// rebroadcast was running.
    pub async fn stop_rebroadcast(&self) -> bool {
        let _guard = self.ops.lock().await;
        self.stop_rebroadcast_locked().await
    }

    /// Leave every room and forget cached streams
    pub async fn leave(&self) {
        let _guard = self.ops.lock().await;
        self.stop_rebroadcast_locked().await;

        let primary = self.primary.lock().take();
        if let Some(active) = primary {
            active.session.leave().await;
            info!(id = %active.descriptor.id, "Left primary room");
        }
        self.incoming.write().clear();
    }

    async fn stop_rebroadcast_locked(&self) -> bool {
        let active = self.rebroadcast.lock().take();
        match active {
            Some(active) => {
                active.session.leave().await;
                info!(id = %active.descriptor.id, "Rebroadcast stopped");
                true
            }
            None => false,
        }
    }

    fn ensure_no_primary(&self) -> Result<()> {
        match self.primary.lock().as_ref() {
            Some(active) => Err(Error::InvalidState(format!(
                "already in room {}, leave it first",
                active.descriptor.room
            ))),
            None => Ok(()),
        }
    }

    #[must_use]
    pub fn incoming_streams(&self) -> Vec<(PeerId, MediaStream)> {
        self.incoming
            .read()
            .iter()
            .map(|((peer, _), stream)| (peer.clone(), stream.clone()))
            .collect()
    }

    #[must_use]
    pub fn role(&self) -> Option<RoomRole> {
        self.primary.lock().as_ref().map(|active| active.role)
    }

    /// Descriptor of the stream being broadcast or watched
    #[must_use]
    pub fn current_descriptor(&self) -> Option<StreamDescriptor> {
        self.primary.lock().as_ref().map(|active| active.descriptor.clone())
    }

    #[must_use]
    pub fn rebroadcast_descriptor(&self) -> Option<StreamDescriptor> {
        self.rebroadcast
            .lock()
            .as_ref()
            .map(|active| active.descriptor.clone())
    }

    #[must_use]
    pub fn is_rebroadcasting(&self) -> bool {
        self.rebroadcast.lock().is_some()
    }

    #[must_use]
    pub fn debug_snapshot(&self) -> DebugSnapshot {
        DebugSnapshot {
            local_peer: self.local_peer.clone(),
            primary: self.primary.lock().as_ref().map(ActiveRoom::debug),
            rebroadcast: self.rebroadcast.lock().as_ref().map(ActiveRoom::debug),
            incoming: self
                .incoming
                .read()
                .keys()
                .map(|(peer, stream)| IncomingStream {
                    peer_id: peer.clone(),
                    stream_id: stream.clone(),
                })
                .collect(),
            captured_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{SignedRecord, STREAM_KIND};
    use crate::store::{MemoryDescriptorStore, MockDescriptorStore};
    use async_trait::async_trait;
    use pyramid_core::LoopbackTransportFactory;
    use std::time::Duration;

    /// Signal settings pointing at a port nothing listens on
    fn offline_config() -> PyramidConfig {
        let mut config = PyramidConfig::default();
        config.signal.relay_urls = vec!["ws://127.0.0.1:9".to_string()];
        config.signal.retry_base_ms = 50;
        config
    }

    fn manager(store: Arc<dyn DescriptorStore>) -> HierarchyManager {
        HierarchyManager::new(&offline_config(), store, Arc::new(LoopbackTransportFactory))
            .with_peer_id(PeerId::from("local"))
    }

    fn seed_incoming(manager: &HierarchyManager, peer: &str, stream: &str) {
        manager.incoming.write().insert(
            (PeerId::from(peer), StreamId::from(stream)),
            MediaStream::new(stream),
        );
    }

    #[tokio::test]
    async fn test_publish_errors_surface_as_publish() {
        let mut store = MockDescriptorStore::new();
        store
            .expect_publish()
            .times(1)
            .returning(|_| Err(Error::Transport("signing relay down".to_string())));
        let manager = manager(Arc::new(store));

        let err = manager
            .publish_descriptor(DescriptorDraft::root("t").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Publish(msg) if msg.contains("signing relay down")));
    }

    #[tokio::test]
    async fn test_fetch_errors_surface_as_fetch() {
        let mut store = MockDescriptorStore::new();
        store
            .expect_fetch_by_id()
            .returning(|_, _| Err(Error::Internal("boom".to_string())));
        let manager = manager(Arc::new(store));

        let err = manager.fetch_descriptor(&DescriptorId::from("x")).await.unwrap_err();
        assert!(matches!(err, Error::Fetch(_)));
    }

    struct SlowStore;

    #[async_trait]
    impl DescriptorStore for SlowStore {
        async fn publish(&self, _draft: DescriptorDraft) -> Result<SignedRecord> {
            Err(Error::Publish("read only".to_string()))
        }

        async fn fetch_by_id(&self, id: &DescriptorId, _max_wait: Duration) -> Result<Option<SignedRecord>> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Some(SignedRecord {
                id: id.to_string(),
                pubkey: "pk".to_string(),
                created_at: 0,
                kind: STREAM_KIND,
                tags: vec![],
                content: r#"{"title":"late","status":"live","stream_depth":0}"#.to_string(),
                sig: None,
            }))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_fetch_resolves_to_none() {
        let manager = manager(Arc::new(SlowStore));
        let started = tokio::time::Instant::now();

        let fetched = manager.fetch_descriptor(&DescriptorId::from("x")).await.unwrap();
        assert!(fetched.is_none());
        assert_eq!(started.elapsed(), Duration::from_millis(5000));
    }

    #[tokio::test]
    async fn test_rebroadcast_without_streams_has_no_side_effects() {
        let mut store = MockDescriptorStore::new();
        store.expect_publish().never();
        store.expect_fetch_by_id().never();
        let manager = manager(Arc::new(store));

        let outcome = manager.rebroadcast(None).await.unwrap();
        assert_eq!(outcome, RebroadcastOutcome::NothingToRebroadcast);
        assert!(!manager.is_rebroadcasting());
        assert!(manager.debug_snapshot().rebroadcast.is_none());
    }

    #[tokio::test]
    async fn test_rebroadcast_requires_watching() {
        let manager = manager(Arc::new(MemoryDescriptorStore::new("pk")));
        seed_incoming(&manager, "a", "a-cam");

        let err = manager.rebroadcast(None).await.unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_watch_unknown_descriptor() {
        let manager = manager(Arc::new(MemoryDescriptorStore::new("pk")));
        let err = manager.watch(&DescriptorId::from("missing")).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert!(manager.role().is_none());
    }

    #[tokio::test]
    async fn test_rebroadcast_descriptor_links_to_parent_and_root() {
        let store = Arc::new(MemoryDescriptorStore::new("pk"));
        let manager = manager(store.clone());

        let root = manager
            .publish_descriptor(DescriptorDraft::root("Original").unwrap())
            .await
            .unwrap();
        manager.watch(&root.id).await.unwrap();
        seed_incoming(&manager, "a", "a-cam");

        let RebroadcastOutcome::Started(child) = manager.rebroadcast(None).await.unwrap() else {
            panic!("rebroadcast did not start");
        };
        assert_eq!(child.parent.as_ref(), Some(&root.id));
        assert_eq!(child.root, root.id);
        assert_eq!(child.depth, 1);
        assert_eq!(child.title, "Rebroadcast: Original");
        assert!(child.room.as_str().starts_with("restream-"));
        assert_eq!(manager.rebroadcast_descriptor(), Some(child.clone()));

        // A second rebroadcast while one is running is refused
        assert!(matches!(
            manager.rebroadcast(Some("again")).await,
            Err(Error::InvalidState(_))
        ));

        assert!(manager.stop_rebroadcast().await);
        assert!(!manager.stop_rebroadcast().await);
        assert_eq!(manager.role(), Some(RoomRole::Watching));

        manager.leave().await;
        assert!(manager.role().is_none());
        assert!(manager.incoming_streams().is_empty());
    }

    #[tokio::test]
    async fn test_go_live_then_go_live_again_is_refused() {
        let manager = manager(Arc::new(MemoryDescriptorStore::new("pk")));
        let descriptor = manager.go_live("Live", MediaStream::new("cam")).await.unwrap();

        assert!(descriptor.is_root());
        assert_eq!(descriptor.room.as_str(), descriptor.id.as_str());
        assert_eq!(manager.role(), Some(RoomRole::Broadcasting));
        assert!(matches!(
            manager.go_live("Again", MediaStream::new("cam")).await,
            Err(Error::InvalidState(_))
        ));

        // The attach is applied by the session task
        let mut primary = manager.debug_snapshot().primary.unwrap();
        for _ in 0..100 {
            if primary.session.local_stream.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            primary = manager.debug_snapshot().primary.unwrap();
        }
        assert_eq!(primary.role, RoomRole::Broadcasting);
        assert_eq!(primary.session.local_stream, Some(StreamId::from("cam")));

        manager.leave().await;
    }
}
