use async_trait::async_trait;
use ipnet::IpNet;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{AllocError, Result};
use crate::models::*;
use crate::utils;
use super::{BlockStore, PoolChanges};

/// In-process block store. Clones share the same blocks and lock.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    blocks: RwLock<HashMap<Uuid, AddressBlock>>,
    lock: Mutex<()>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.blocks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn validate(blocks: &HashMap<Uuid, AddressBlock>, changes: &PoolChanges) -> Result<()> {
    let mut ranges: HashSet<IpNet> = blocks.values().map(|b| b.network).collect();
    for block in &changes.inserted {
        if blocks.contains_key(&block.id) {
            return Err(AllocError::InvalidRequest(format!("duplicate block id {}", block.id)));
        }
        if !ranges.insert(block.network) {
            return Err(AllocError::Overlap {
                requested: block.network,
                existing: block.network,
            });
        }
        if let Some(parent_id) = block.parent_id {
            let known = blocks.contains_key(&parent_id)
                || changes.inserted.iter().any(|b| b.id == parent_id);
            if !known {
                return Err(AllocError::not_found("Parent block", parent_id));
            }
        }
    }

    for block in &changes.updated {
        if !blocks.contains_key(&block.id) {
            return Err(AllocError::not_found("Address block", block.id));
        }
    }

    for id in &changes.removed {
        if !blocks.contains_key(id) {
            return Err(AllocError::not_found("Address block", id));
        }
        let has_children = blocks
            .values()
            .any(|b| b.parent_id == Some(*id) && !changes.removed.contains(&b.id));
        if has_children {
            return Err(AllocError::InvalidRequest(format!("block {} still has children", id)));
        }
    }

    Ok(())
}

#[async_trait]
impl BlockStore for MemoryStore {
    fn allocation_lock(&self) -> &Mutex<()> {
        &self.inner.lock
    }

    async fn load_pool(&self, family: AddressFamily) -> Result<Vec<AddressBlock>> {
        let mut blocks: Vec<AddressBlock> = self
            .inner
            .blocks
            .read()
            .values()
            .filter(|b| b.family() == family)
            .cloned()
            .collect();
        blocks.sort_by_key(|b| (utils::bounds(&b.network).0, b.prefix_len()));
        Ok(blocks)
    }

    async fn commit(&self, changes: &PoolChanges) -> Result<()> {
        let mut blocks = self.inner.blocks.write();
        validate(&blocks, changes)?;

        for block in &changes.inserted {
            blocks.insert(block.id, block.clone());
        }
        for block in &changes.updated {
            blocks.insert(block.id, block.clone());
        }
        for id in &changes.removed {
            blocks.remove(id);
        }
        Ok(())
    }

    async fn get_block(&self, id: Uuid) -> Result<Option<AddressBlock>> {
        Ok(self.inner.blocks.read().get(&id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(cidr: &str) -> AddressBlock {
        AddressBlock::new(cidr.parse().unwrap(), BlockStatus::Container)
    }

    #[tokio::test]
    async fn test_load_pool_is_ordered_and_family_scoped() {
        let store = MemoryStore::new();
        let changes = PoolChanges {
            inserted: vec![
                block("10.1.0.0/16"),
                block("10.0.0.0/16"),
                block("10.0.0.0/8"),
                block("2001:db8::/32"),
            ],
            ..Default::default()
        };
        store.commit(&changes).await.unwrap();

        let v4 = store.load_pool(AddressFamily::V4).await.unwrap();
        let order: Vec<String> = v4.iter().map(|b| b.network.to_string()).collect();
        assert_eq!(order, vec!["10.0.0.0/8", "10.0.0.0/16", "10.1.0.0/16"]);
        assert_eq!(store.load_pool(AddressFamily::V6).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_commit_is_all_or_nothing() {
        let store = MemoryStore::new();
        let existing = block("10.0.0.0/16");
        store
            .commit(&PoolChanges { inserted: vec![existing.clone()], ..Default::default() })
            .await
            .unwrap();

        let changes = PoolChanges {
            inserted: vec![block("10.1.0.0/16"), block("10.0.0.0/16")],
            ..Default::default()
        };
        let err = store.commit(&changes).await.unwrap_err();
        assert!(matches!(err, AllocError::Overlap { .. }));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_remove_with_children_rejected() {
        let store = MemoryStore::new();
        let parent = block("10.0.0.0/16");
        let child = AddressBlock::new("10.0.0.0/24".parse().unwrap(), BlockStatus::Network)
            .with_parent(Some(parent.id));
        store
            .commit(&PoolChanges { inserted: vec![parent.clone(), child], ..Default::default() })
            .await
            .unwrap();

        let err = store
            .commit(&PoolChanges { removed: vec![parent.id], ..Default::default() })
            .await
            .unwrap_err();
        assert!(matches!(err, AllocError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let store = MemoryStore::new();
        let other = store.clone();
        store
            .commit(&PoolChanges { inserted: vec![block("10.0.0.0/8")], ..Default::default() })
            .await
            .unwrap();
        assert_eq!(other.len(), 1);
    }
}
