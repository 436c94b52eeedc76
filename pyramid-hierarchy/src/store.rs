//! Descriptor publishing and lookup
//!
//! [`DescriptorStore`] is the seam to whatever network signs and distributes
//! descriptor records. [`MemoryDescriptorStore`] keeps them in process and
//! derives ids the same way the record network does.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use pyramid_core::{DescriptorId, Result};
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::descriptor::{DescriptorDraft, SignedRecord};

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DescriptorStore: Send + Sync {
    /// Sign and publish a draft, returning the record with its assigned id
    async fn publish(&self, draft: DescriptorDraft) -> Result<SignedRecord>;

    /// Look up a record by id, giving up after `max_wait`
    async fn fetch_by_id(&self, id: &DescriptorId, max_wait: Duration) -> Result<Option<SignedRecord>>;
}

/// Content-derived record id: lowercase hex SHA-256 of
/// `[0, pubkey, created_at, kind, tags, content]` serialised as compact JSON
#[must_use]
pub fn record_id(pubkey: &str, created_at: i64, kind: u32, tags: &[Vec<String>], content: &str) -> String {
    let canonical = json!([0, pubkey, created_at, kind, tags, content]).to_string();
    hex::encode(Sha256::digest(canonical.as_bytes()))
}

/// In-process descriptor store
pub struct MemoryDescriptorStore {
    pubkey: String,
    records: DashMap<DescriptorId, SignedRecord>,
}

impl MemoryDescriptorStore {
    pub fn new(pubkey: impl Into<String>) -> Self {
        Self {
            pubkey: pubkey.into(),
            records: DashMap::new(),
        }
    }

    #[must_use]
    pub fn pubkey(&self) -> &str {
        &self.pubkey
    }

    /// Store a record as-is, without assigning an id
    pub fn insert_raw(&self, record: SignedRecord) {
        self.records.insert(DescriptorId::new(record.id.clone()), record);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl Default for MemoryDescriptorStore {
    fn default() -> Self {
        let seed = nanoid::nanoid!();
        Self::new(hex::encode(Sha256::digest(seed.as_bytes())))
    }
}

#[async_trait]
impl DescriptorStore for MemoryDescriptorStore {
    async fn publish(&self, draft: DescriptorDraft) -> Result<SignedRecord> {
        let created_at = Utc::now().timestamp();
        let id = record_id(&self.pubkey, created_at, draft.kind, &draft.tags, &draft.content);
        let record = SignedRecord {
            id,
            pubkey: self.pubkey.clone(),
            created_at,
            kind: draft.kind,
            tags: draft.tags,
            content: draft.content,
            sig: None,
        };
        debug!(id = %record.id, kind = record.kind, "Descriptor stored");
        self.insert_raw(record.clone());
        Ok(record)
    }

    async fn fetch_by_id(&self, id: &DescriptorId, _max_wait: Duration) -> Result<Option<SignedRecord>> {
        Ok(self.records.get(id).map(|record| record.clone()))
    }
}
