//! Pyramid Stream signaling core
//!
//! Rendezvous signaling for live stream rooms: persistent relay connections
//! with exponential reconnect, room sessions that track who is present, and the
//! boundary to the peer-to-peer media transport.
//!
//! ## Architecture
//!
//! - **`RelayConnection`**: one WebSocket to one relay, reconnecting with backoff
//! - **`RoomSession`**: one room, announced on one or more relays; owns its relay
//!   connections and media transport
//! - **`RoomState`**: the membership state machine each session runs
//! - **`MediaTransport`**: narrow interface to the media layer
//!
//! ## Usage
//!
//! ```rust,ignore
//! use pyramid_core::{LoopbackTransportFactory, MediaStream, RoomSession, SignalConfig};
//!
//! let session = RoomSession::builder(SignalConfig::default(), "my-room")
//!     .on_peer_join(|_ctx, peer| println!("{peer} joined"))
//!     .join(&LoopbackTransportFactory)?;
//! session.attach_stream(MediaStream::new("camera"), None);
//! ```

pub mod backoff;
pub mod config;
pub mod error;
pub mod logging;
pub mod loopback;
pub mod protocol;
pub mod relay;
pub mod room;
pub mod session;
pub mod transport;
pub mod types;

pub use config::{HierarchyConfig, LoggingConfig, PyramidConfig, RelayServerConfig, RetryPolicy, SignalConfig};
pub use error::{Error, Result};
pub use loopback::{LoopbackTransport, LoopbackTransportFactory};
pub use protocol::{RelayFrame, SignalMessage};
pub use relay::{ConnectionState, RelayConnection, RelayEvent, RelayEventKind, RelayStatus};
pub use room::{PeerRecord, SessionPhase};
pub use session::{RoomContext, RoomSession, RoomSessionBuilder, SessionSnapshot};
pub use transport::{MediaStream, MediaTransport, MediaTransportFactory, TransportEvent, TransportLink};
pub use types::{DescriptorId, PeerId, RelayEndpoint, RoomName, StreamId};
