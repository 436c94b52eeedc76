//! Stream descriptors and their signed-record encoding
//!
//! A descriptor is published as a kind `30078` record. The JSON content carries
//! the title, status and depth; the parent and root references travel as
//! `e` and `original` tags so relays can index them.

use chrono::{DateTime, Utc};
use pyramid_core::{DescriptorId, Error, Result, RoomName};
use serde::{Deserialize, Serialize};

/// Record kind used for every stream descriptor
pub const STREAM_KIND: u32 = 30078;

pub const LIVE_STATUS: &str = "live";

const ROOT_D_TAG_PREFIX: &str = "com.pyramidstream.stream.";
const REBROADCAST_D_TAG_PREFIX: &str = "com.pyramidstream.rebroadcast.";

const PARENT_TAG: &str = "e";
const ROOT_TAG: &str = "original";
const D_TAG: &str = "d";

/// A record as it travels through the descriptor network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedRecord {
    pub id: String,
    pub pubkey: String,
    /// Unix seconds
    pub created_at: i64,
    pub kind: u32,
    pub tags: Vec<Vec<String>>,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sig: Option<String>,
}

impl SignedRecord {
    /// Value of the first tag named `name`
    #[must_use]
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|tag| tag.first().is_some_and(|n| n == name))
            .and_then(|tag| tag.get(1))
            .map(String::as_str)
    }
}

/// JSON content of a descriptor record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescriptorContent {
    pub title: String,
    pub status: String,
    pub stream_depth: u32,
    #[serde(default, alias = "trystero_room", skip_serializing_if = "Option::is_none")]
    pub room: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_stream: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original: Option<String>,
}

/// Unsigned record handed to a [`DescriptorStore`](crate::store::DescriptorStore) for publishing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorDraft {
    pub kind: u32,
    pub content: String,
    pub tags: Vec<Vec<String>>,
}

impl DescriptorDraft {
    /// Draft for an original stream. Its room is the id the record ends up with.
    pub fn root(title: &str) -> Result<Self> {
        let content = DescriptorContent {
            title: title.to_string(),
            status: LIVE_STATUS.to_string(),
            stream_depth: 0,
            room: None,
            parent_stream: None,
            original: None,
        };
        Ok(Self {
            kind: STREAM_KIND,
            content: serde_json::to_string(&content)?,
            tags: vec![tag(
                D_TAG,
                &format!("{ROOT_D_TAG_PREFIX}{}", Utc::now().timestamp_millis()),
            )],
        })
    }

    /// Draft for a rebroadcast of `parent`, served in `room`
    pub fn rebroadcast(
        title: &str,
        room: &RoomName,
        parent: &StreamDescriptor,
        root: &DescriptorId,
    ) -> Result<Self> {
        let stream_depth = parent.depth.checked_add(1).ok_or_else(|| {
            Error::protocol_violation(
                parent.id.as_str(),
                format!("depth {} cannot be extended", parent.depth),
            )
        })?;
        let content = DescriptorContent {
            title: title.to_string(),
            status: LIVE_STATUS.to_string(),
            stream_depth,
            room: Some(room.to_string()),
            parent_stream: Some(parent.id.to_string()),
            original: None,
        };
        Ok(Self {
            kind: STREAM_KIND,
            content: serde_json::to_string(&content)?,
            tags: vec![
                tag(D_TAG, &format!("{REBROADCAST_D_TAG_PREFIX}{room}")),
                tag(PARENT_TAG, parent.id.as_str()),
                tag(ROOT_TAG, root.as_str()),
            ],
        })
    }
}

fn tag(name: &str, value: &str) -> Vec<String> {
    vec![name.to_string(), value.to_string()]
}

/// One node of a pyramid, parsed from a published record
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamDescriptor {
    pub id: DescriptorId,
    pub title: String,
    pub status: String,
    pub depth: u32,
    pub parent: Option<DescriptorId>,
    pub root: DescriptorId,
    /// Room viewers join to receive this node's media
    pub room: RoomName,
    pub pubkey: String,
    pub created_at: DateTime<Utc>,
}

impl StreamDescriptor {
    /// Parse and check a record. Anything that cannot be a descriptor is a
    /// [`Error::ProtocolViolation`].
    pub fn from_record(record: &SignedRecord) -> Result<Self> {
        let violation = |reason: String| Error::protocol_violation(&record.id, reason);

        if record.kind != STREAM_KIND {
            return Err(violation(format!("unexpected record kind {}", record.kind)));
        }

        let content: DescriptorContent = serde_json::from_str(&record.content)
            .map_err(|e| violation(format!("unparsable content: {e}")))?;

        let parent = record
            .tag_value(PARENT_TAG)
            .map(str::to_string)
            .or_else(|| content.parent_stream.clone())
            .map(DescriptorId::from);

        let root = record
            .tag_value(ROOT_TAG)
            .map(str::to_string)
            .or_else(|| content.original.clone())
            .map(DescriptorId::from);

        let root = match (content.stream_depth, &parent, root) {
            (0, Some(_), _) => {
                return Err(violation("depth 0 descriptor has a parent reference".to_string()))
            }
            (0, None, _) => DescriptorId::new(record.id.clone()),
            (_, None, _) => {
                return Err(violation(format!(
                    "depth {} descriptor has no parent reference",
                    content.stream_depth
                )))
            }
            (_, Some(_), Some(root)) => root,
            (_, Some(_), None) => {
                return Err(violation(format!(
                    "depth {} descriptor has no root reference",
                    content.stream_depth
                )))
            }
        };

        let created_at = DateTime::from_timestamp(record.created_at, 0)
            .ok_or_else(|| violation(format!("invalid timestamp {}", record.created_at)))?;

        let room = content
            .room
            .map_or_else(|| RoomName::new(record.id.clone()), RoomName::from);

        Ok(Self {
            id: DescriptorId::new(record.id.clone()),
            title: content.title,
            status: content.status,
            depth: content.stream_depth,
            parent,
            root,
            room,
            pubkey: record.pubkey.clone(),
            created_at,
        })
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }
}
