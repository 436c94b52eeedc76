//! Reconstruction of a pyramid from one of its nodes

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use pyramid_core::{DescriptorId, Error, Result};
use serde::Serialize;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::descriptor::StreamDescriptor;
use crate::store::DescriptorStore;

/// Why a chain walk stopped
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "end", rename_all = "snake_case")]
pub enum ChainEnd {
    /// Reached a descriptor without a parent
    Root,
    /// No record for `id` within the fetch wait
    Missing { id: DescriptorId },
    Malformed { id: DescriptorId, reason: String },
    FetchFailed { id: DescriptorId, error: String },
    HopLimit,
    /// `id` was already part of the chain
    Cycle { id: DescriptorId },
}

/// Descriptors from the root (or as far up as could be resolved) down to a leaf
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamChain {
    pub descriptors: Vec<StreamDescriptor>,
    pub end: ChainEnd,
}

impl StreamChain {
    /// The root descriptor, if the walk got all the way up
    #[must_use]
    pub fn root(&self) -> Option<&StreamDescriptor> {
        match self.end {
            ChainEnd::Root => self.descriptors.first(),
            _ => None,
        }
    }

    #[must_use]
    pub fn leaf(&self) -> Option<&StreamDescriptor> {
        self.descriptors.last()
    }

    #[must_use]
    pub fn ids(&self) -> Vec<DescriptorId> {
        self.descriptors.iter().map(|d| d.id.clone()).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.end == ChainEnd::Root
    }
}

/// Fetch and parse one descriptor, waiting at most `max_wait`.
///
/// A miss or a timeout is `Ok(None)`. Store failures become [`Error::Fetch`],
/// records that are not descriptors become [`Error::ProtocolViolation`].
pub async fn fetch_descriptor(
    store: &dyn DescriptorStore,
    id: &DescriptorId,
    max_wait: Duration,
) -> Result<Option<StreamDescriptor>> {
    let record = match timeout(max_wait, store.fetch_by_id(id, max_wait)).await {
        Err(_) => {
            debug!(id = %id, wait_ms = max_wait.as_millis() as u64, "Descriptor fetch timed out");
            return Ok(None);
        }
        Ok(Ok(Some(record))) => record,
        Ok(Ok(None)) => return Ok(None),
        Ok(Err(e)) => {
            warn!(id = %id, error = %e, transient = e.is_transient(), "Descriptor fetch failed");
            return Err(match e {
                Error::Fetch(_) => e,
                other => Error::Fetch(other.to_string()),
            });
        }
    };

    if record.id != id.as_str() {
        return Err(Error::protocol_violation(
            id.as_str(),
            format!("store returned record {}", record.id),
        ));
    }

    StreamDescriptor::from_record(&record).map(Some)
}

/// Follow parent links from `leaf` up to the root.
///
/// Never fails: the walk stops at the first problem and records it in
/// [`StreamChain::end`]. At most `max_hops` descriptors are collected.
pub async fn walk_chain(
    store: &dyn DescriptorStore,
    leaf: &DescriptorId,
    max_wait: Duration,
    max_hops: usize,
) -> StreamChain {
    let mut descriptors = VecDeque::new();
    let mut visited = HashSet::new();
    let mut next = leaf.clone();

    let end = loop {
        if descriptors.len() >= max_hops {
            break ChainEnd::HopLimit;
        }
        if !visited.insert(next.clone()) {
            break ChainEnd::Cycle { id: next };
        }

        match fetch_descriptor(store, &next, max_wait).await {
            Ok(Some(descriptor)) => {
                let parent = descriptor.parent.clone();
                descriptors.push_front(descriptor);
                match parent {
                    Some(parent) => next = parent,
                    None => break ChainEnd::Root,
                }
            }
            Ok(None) => break ChainEnd::Missing { id: next },
            Err(Error::ProtocolViolation { reason, .. }) => {
                break ChainEnd::Malformed { id: next, reason }
            }
            Err(e) => break ChainEnd::FetchFailed {
                id: next,
                error: e.to_string(),
            },
        }
    };

    match &end {
        ChainEnd::Root => debug!(leaf = %leaf, hops = descriptors.len(), "Chain reconstructed"),
        other => warn!(leaf = %leaf, hops = descriptors.len(), end = ?other, "Chain ended early"),
    }

    StreamChain {
        descriptors: descriptors.into(),
        end,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{DescriptorDraft, SignedRecord, STREAM_KIND};
    use crate::store::{MemoryDescriptorStore, MockDescriptorStore};
    use pyramid_core::RoomName;

    const WAIT: Duration = Duration::from_millis(100);

    fn record(id: &str, depth: u32, parent: Option<&str>) -> SignedRecord {
        let mut tags = Vec::new();
        if let Some(parent) = parent {
            tags.push(vec!["e".to_string(), parent.to_string()]);
            tags.push(vec!["original".to_string(), "root".to_string()]);
        }
        SignedRecord {
            id: id.to_string(),
            pubkey: "pk".to_string(),
            created_at: 1_700_000_000,
            kind: STREAM_KIND,
            tags,
            content: format!(r#"{{"title":"{id}","status":"live","stream_depth":{depth}}}"#),
            sig: None,
        }
    }

    /// `n0 <- n1 <- ... <- n{len-1}`
    fn linear_store(len: usize) -> MemoryDescriptorStore {
        let store = MemoryDescriptorStore::new("pk");
        for i in 0..len {
            let parent = (i > 0).then(|| format!("n{}", i - 1));
            store.insert_raw(record(&format!("n{i}"), i as u32, parent.as_deref()));
        }
        store
    }

    #[tokio::test]
    async fn test_root_only_chain() {
        let store = linear_store(1);
        let chain = walk_chain(&store, &DescriptorId::from("n0"), WAIT, 10).await;
        assert_eq!(chain.ids(), vec![DescriptorId::from("n0")]);
        assert!(chain.is_complete());
        assert_eq!(chain.root(), chain.leaf());
    }

    #[tokio::test]
    async fn test_chain_is_root_first() {
        let store = linear_store(4);
        let chain = walk_chain(&store, &DescriptorId::from("n3"), WAIT, 10).await;
        let ids: Vec<String> = chain.ids().into_iter().map(DescriptorId::into_inner).collect();
        assert_eq!(ids, vec!["n0", "n1", "n2", "n3"]);
        assert_eq!(chain.end, ChainEnd::Root);
    }

    #[tokio::test]
    async fn test_hop_limit_bounds_length() {
        let store = linear_store(25);
        for leaf in [9, 10, 11, 24] {
            let chain = walk_chain(&store, &DescriptorId::new(format!("n{leaf}")), WAIT, 10).await;
            assert!(chain.len() <= 10);
            if leaf < 10 {
                assert_eq!(chain.end, ChainEnd::Root);
                assert_eq!(chain.len(), leaf + 1);
            } else {
                assert_eq!(chain.end, ChainEnd::HopLimit);
                assert_eq!(chain.len(), 10);
                assert_eq!(chain.leaf().unwrap().id.as_str(), format!("n{leaf}"));
            }
        }
    }

    #[tokio::test]
    async fn test_cycle_is_detected() {
        let store = MemoryDescriptorStore::new("pk");
        store.insert_raw(record("a", 2, Some("b")));
        store.insert_raw(record("b", 1, Some("a")));

        let chain = walk_chain(&store, &DescriptorId::from("a"), WAIT, 10).await;
        assert_eq!(chain.end, ChainEnd::Cycle { id: DescriptorId::from("a") });
        let ids: Vec<String> = chain.ids().into_iter().map(DescriptorId::into_inner).collect();
        assert_eq!(ids, vec!["b", "a"]);
        assert!(chain.root().is_none());
    }

    #[tokio::test]
    async fn test_missing_parent_ends_chain() {
        let store = MemoryDescriptorStore::new("pk");
        store.insert_raw(record("child", 1, Some("gone")));

        let chain = walk_chain(&store, &DescriptorId::from("child"), WAIT, 10).await;
        assert_eq!(chain.end, ChainEnd::Missing { id: DescriptorId::from("gone") });
        assert_eq!(chain.len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_parent_ends_chain() {
        let store = MemoryDescriptorStore::new("pk");
        store.insert_raw(record("child", 1, Some("bad")));
        store.insert_raw(SignedRecord {
            content: "garbage".to_string(),
            ..record("bad", 0, None)
        });

        let chain = walk_chain(&store, &DescriptorId::from("child"), WAIT, 10).await;
        assert!(matches!(&chain.end, ChainEnd::Malformed { id, .. } if id.as_str() == "bad"));
        assert_eq!(chain.len(), 1);
    }

    #[tokio::test]
    async fn test_fetch_failure_ends_chain() {
        let mut store = MockDescriptorStore::new();
        store
            .expect_fetch_by_id()
            .returning(|_, _| Err(Error::Transport("relay unreachable".to_string())));

        let chain = walk_chain(&store, &DescriptorId::from("leaf"), WAIT, 10).await;
        match &chain.end {
            ChainEnd::FetchFailed { id, error } => {
                assert_eq!(id.as_str(), "leaf");
                assert!(error.contains("relay unreachable"));
            }
            other => panic!("unexpected end {other:?}"),
        }
        assert!(chain.is_empty());
    }

    #[tokio::test]
    async fn test_fetch_rejects_mismatched_record() {
        let mut store = MockDescriptorStore::new();
        store
            .expect_fetch_by_id()
            .returning(|_, _| Ok(Some(record("other", 0, None))));

        let result = fetch_descriptor(&store, &DescriptorId::from("wanted"), WAIT).await;
        assert!(matches!(result, Err(Error::ProtocolViolation { .. })));
    }

    #[tokio::test]
    async fn test_full_drafts_walk() {
        let store = MemoryDescriptorStore::new("pk");
        let e1 = StreamDescriptor::from_record(
            &store.publish(DescriptorDraft::root("E1").unwrap()).await.unwrap(),
        )
        .unwrap();
        let e2 = StreamDescriptor::from_record(
            &store
                .publish(DescriptorDraft::rebroadcast("E2", &RoomName::from("r2"), &e1, &e1.id).unwrap())
                .await
                .unwrap(),
        )
        .unwrap();

        let chain = walk_chain(&store, &e2.id, WAIT, 10).await;
        assert_eq!(chain.ids(), vec![e1.id.clone(), e2.id.clone()]);
        assert_eq!(chain.root().unwrap().id, e1.id);
    }

    #[tokio::test]
    async fn test_chain_serialises_with_end_reason() {
        let store = MemoryDescriptorStore::new("pk");
        store.insert_raw(record("child", 1, Some("bad")));
        store.insert_raw(SignedRecord {
            content: "garbage".to_string(),
            ..record("bad", 0, None)
        });

        let chain = walk_chain(&store, &DescriptorId::from("child"), WAIT, 10).await;
        let value = serde_json::to_value(&chain).unwrap();
        assert_eq!(value["end"]["end"], "malformed");
        assert_eq!(value["end"]["id"], "bad");
        assert!(value["end"]["reason"].as_str().unwrap().contains("unparsable"));
        assert_eq!(value["descriptors"][0]["id"], "child");

        let complete = walk_chain(&linear_store(2), &DescriptorId::from("n1"), WAIT, 10).await;
        let value = serde_json::to_value(&complete).unwrap();
        assert_eq!(value["end"], serde_json::json!({ "end": "root" }));
    }
}
