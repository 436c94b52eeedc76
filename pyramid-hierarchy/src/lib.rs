//! Pyramid Stream hierarchy
//!
//! Streams form a pyramid: an original broadcast at the top, rebroadcasts of it
//! one level down, rebroadcasts of those below. Each node is described by a
//! signed descriptor record pointing at its parent and at the root.
//!
//! - [`descriptor`]: descriptor records and their tag contract
//! - [`store`]: where descriptors are published and fetched
//! - [`chain`]: walking parent links back to the root
//! - [`manager`]: going live, watching, and rebroadcasting with fan-out
//!
//! ```rust,ignore
//! let manager = HierarchyManager::new(&config, store, Arc::new(LoopbackTransportFactory));
//! manager.watch(&descriptor_id).await?;
//! if let RebroadcastOutcome::Started(descriptor) = manager.rebroadcast(None).await? {
//!     println!("share {}", descriptor.id);
//! }
//! ```

pub mod chain;
pub mod debug;
pub mod descriptor;
pub mod manager;
pub mod store;

pub use chain::{ChainEnd, StreamChain};
pub use debug::{DebugSnapshot, IncomingStream, RoomDebug};
pub use descriptor::{DescriptorContent, DescriptorDraft, SignedRecord, StreamDescriptor, STREAM_KIND};
pub use manager::{HierarchyManager, RebroadcastOutcome, RoomRole};
pub use store::{DescriptorStore, MemoryDescriptorStore};
