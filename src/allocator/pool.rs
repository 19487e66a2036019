use ipnet::IpNet;
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

use crate::db::PoolChanges;
use crate::error::{AllocError, Result};
use crate::models::*;
use crate::utils;

/// (network address, prefix length): numeric order, larger block first
type BlockKey = (u128, u8);

fn key_of(net: &IpNet) -> BlockKey {
    (utils::bounds(net).0, net.prefix_len())
}

/// Ordered in-memory view of one family's pool, recording every change made
/// to it so the store can commit them as one unit.
pub(crate) struct PoolSnapshot {
    family: AddressFamily,
    blocks: BTreeMap<BlockKey, AddressBlock>,
    keys: HashMap<Uuid, BlockKey>,
    changes: PoolChanges,
}

impl PoolSnapshot {
    pub fn new(family: AddressFamily, blocks: Vec<AddressBlock>) -> Self {
        let mut snapshot = Self {
            family,
            blocks: BTreeMap::new(),
            keys: HashMap::new(),
            changes: PoolChanges::default(),
        };
        for block in blocks.into_iter().filter(|b| b.family() == family) {
            let key = key_of(&block.network);
            snapshot.keys.insert(block.id, key);
            snapshot.blocks.insert(key, block);
        }
        snapshot
    }

    pub fn family(&self) -> AddressFamily {
        self.family
    }

    /// All blocks in numeric address order
    pub fn iter(&self) -> impl Iterator<Item = &AddressBlock> {
        self.blocks.values()
    }

    pub fn get(&self, id: Uuid) -> Option<&AddressBlock> {
        self.keys.get(&id).and_then(|key| self.blocks.get(key))
    }

    pub fn require(&self, id: Uuid) -> Result<&AddressBlock> {
        self.get(id).ok_or_else(|| AllocError::not_found("Address block", id))
    }

    pub fn find_exact(&self, net: &IpNet) -> Option<&AddressBlock> {
        self.blocks.get(&key_of(&net.trunc()))
    }

    /// Blocks lying strictly inside `net`, in address order
    pub fn inside<'a>(&'a self, net: &IpNet) -> impl Iterator<Item = &'a AddressBlock> + 'a {
        let (lo, hi) = utils::bounds(net);
        let len = net.prefix_len();
        self.blocks
            .range((lo, 0)..=(hi, u8::MAX))
            .map(|(_, b)| b)
            .filter(move |b| b.prefix_len() > len)
    }

    /// Blocks covering `net`, including an exact match, outermost first
    pub fn containing(&self, net: &IpNet) -> Vec<&AddressBlock> {
        (0..=net.prefix_len())
            .filter_map(|len| IpNet::new(net.addr(), len).ok())
            .filter_map(|sup| self.blocks.get(&key_of(&sup.trunc())))
            .collect()
    }

    pub fn children_of(&self, id: Uuid) -> impl Iterator<Item = &AddressBlock> {
        self.blocks.values().filter(move |b| b.parent_id == Some(id))
    }

    /// Lowest free subnet of `prefix_len` inside `within`.
    ///
    /// Unbound containers larger than the requested size do not block a
    /// candidate; every other block inside `within` does.
    pub fn first_free_subnet(&self, within: &IpNet, prefix_len: u8) -> Option<IpNet> {
        let taken: Vec<(u128, u128)> = self
            .inside(within)
            .filter(|b| !(b.is_free_container() && b.prefix_len() < prefix_len))
            .map(|b| utils::bounds(&b.network))
            .collect();
        let mask = utils::hostmask(self.family, prefix_len);
        let start = utils::first_fit(utils::bounds(within), mask, &taken)?;
        utils::net_from(self.family, start, prefix_len)
    }

    pub fn insert(&mut self, block: AddressBlock) -> Result<()> {
        let key = key_of(&block.network);
        if let Some(existing) = self.blocks.get(&key) {
            return Err(AllocError::Overlap {
                requested: block.network,
                existing: existing.network,
            });
        }
        self.keys.insert(block.id, key);
        self.blocks.insert(key, block.clone());
        self.changes.inserted.push(block);
        Ok(())
    }

    pub fn update(&mut self, block: AddressBlock) -> Result<()> {
        let key = *self
            .keys
            .get(&block.id)
            .ok_or_else(|| AllocError::not_found("Address block", block.id))?;
        self.blocks.insert(key, block.clone());

        if let Some(pending) = self.changes.inserted.iter_mut().find(|b| b.id == block.id) {
            *pending = block;
        } else if let Some(pending) = self.changes.updated.iter_mut().find(|b| b.id == block.id) {
            *pending = block;
        } else {
            self.changes.updated.push(block);
        }
        Ok(())
    }

    pub fn remove(&mut self, id: Uuid) -> Result<AddressBlock> {
        let key = self
            .keys
            .remove(&id)
            .ok_or_else(|| AllocError::not_found("Address block", id))?;
        let block = self
            .blocks
            .remove(&key)
            .ok_or_else(|| AllocError::not_found("Address block", id))?;

        let before = self.changes.inserted.len();
        self.changes.inserted.retain(|b| b.id != id);
        if self.changes.inserted.len() == before {
            self.changes.updated.retain(|b| b.id != id);
            self.changes.removed.push(id);
        }
        Ok(block)
    }

    pub fn into_changes(self) -> PoolChanges {
        self.changes
    }
}
