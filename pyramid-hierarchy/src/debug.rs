//! Serialisable view of everything a hierarchy manager holds

use chrono::{DateTime, Utc};
use pyramid_core::{PeerId, SessionSnapshot, StreamId};
use serde::Serialize;

use crate::descriptor::StreamDescriptor;
use crate::manager::RoomRole;

#[derive(Debug, Clone, Serialize)]
pub struct DebugSnapshot {
    pub local_peer: PeerId,
    pub primary: Option<RoomDebug>,
    pub rebroadcast: Option<RoomDebug>,
    /// Streams available for fan-out, in arrival order
    pub incoming: Vec<IncomingStream>,
    pub captured_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RoomDebug {
    pub role: RoomRole,
    pub descriptor: StreamDescriptor,
    pub session: SessionSnapshot,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IncomingStream {
    pub peer_id: PeerId,
    pub stream_id: StreamId,
}

impl DebugSnapshot {
    /// Pretty JSON for logs and debug panels
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pyramid_core::{DescriptorId, RoomName};

    #[test]
    fn test_snapshot_serialises() {
        let snapshot = DebugSnapshot {
            local_peer: PeerId::from("me"),
            primary: None,
            rebroadcast: None,
            incoming: vec![IncomingStream {
                peer_id: PeerId::from("a"),
                stream_id: StreamId::from("a-cam"),
            }],
            captured_at: Utc::now(),
        };
        let value: serde_json::Value = serde_json::from_str(&snapshot.to_json().unwrap()).unwrap();
        assert_eq!(value["local_peer"], "me");
        assert!(value["primary"].is_null());
        assert_eq!(value["incoming"][0]["stream_id"], "a-cam");

        // Descriptors keep their ids as plain strings
        let descriptor = StreamDescriptor {
            id: DescriptorId::from("e1"),
            title: "t".to_string(),
            status: "live".to_string(),
            depth: 0,
            parent: None,
            root: DescriptorId::from("e1"),
            room: RoomName::from("e1"),
            pubkey: "pk".to_string(),
            created_at: Utc::now(),
        };
        let value = serde_json::to_value(&descriptor).unwrap();
        assert_eq!(value["root"], "e1");
        assert!(value["parent"].is_null());
    }
}
