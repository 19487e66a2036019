//! Hierarchical address space allocator.
//!
//! Turns top-level containers into role-scoped subnets and finally into
//! individual host addresses. Every operation runs against an ordered
//! snapshot of the pool taken under the store's allocation lock and commits
//! its complete change set at once, so a failed call leaves nothing behind.

mod pool;

use ipnet::IpNet;
use std::net::IpAddr;
use uuid::Uuid;

use crate::db::BlockStore;
use crate::error::{AllocError, Result};
use crate::models::*;
use crate::utils;
use pool::PoolSnapshot;

/// Tuning knobs for the allocator
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllocatorOptions {
    /// How many ancestor levels `allocate_container` may carve from when no
    /// free block of the requested size exists. `None` searches every level,
    /// `Some(0)` never carves.
    pub ancestor_search_depth: Option<usize>,
}

pub struct AddressSpaceAllocator<S> {
    store: S,
    options: AllocatorOptions,
}

impl<S: BlockStore> AddressSpaceAllocator<S> {
    pub fn new(store: S) -> Self {
        Self::with_options(store, AllocatorOptions::default())
    }

    pub fn with_options(store: S, options: AllocatorOptions) -> Self {
        Self { store, options }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn options(&self) -> &AllocatorOptions {
        &self.options
    }

    /// Load a snapshot under the allocation lock, run `op` on it and commit
    /// whatever it changed. Nothing is written if `op` fails.
    async fn transact<T>(
        &self,
        family: AddressFamily,
        op: impl FnOnce(&mut PoolSnapshot) -> Result<T>,
    ) -> Result<T> {
        let _guard = self.store.allocation_lock().lock().await;
        let mut snapshot = PoolSnapshot::new(family, self.store.load_pool(family).await?);
        let out = op(&mut snapshot)?;
        let changes = snapshot.into_changes();
        if !changes.is_empty() {
            self.store.commit(&changes).await?;
        }
        Ok(out)
    }

    async fn family_of(&self, id: Uuid) -> Result<AddressFamily> {
        self.store
            .get_block(id)
            .await?
            .map(|b| b.family())
            .ok_or_else(|| AllocError::not_found("Address block", id))
    }

    /// Register a top-level container. Registering the same range again
    /// returns the existing block.
    pub async fn register_container(
        &self,
        cidr: IpNet,
        role: Option<Role>,
        description: Option<String>,
    ) -> Result<AddressBlock> {
        let cidr = cidr.trunc();
        self.transact(AddressFamily::of(&cidr), |pool| {
            if let Some(existing) = pool.find_exact(&cidr) {
                if existing.status != BlockStatus::Container {
                    return Err(AllocError::Overlap {
                        requested: cidr,
                        existing: existing.network,
                    });
                }
                return Ok(existing.clone());
            }
            if let Some(inner) = pool.inside(&cidr).next() {
                return Err(AllocError::Overlap {
                    requested: cidr,
                    existing: inner.network,
                });
            }

            let parent = match pool.containing(&cidr).last() {
                Some(p) if p.status != BlockStatus::Container => {
                    return Err(AllocError::Overlap {
                        requested: cidr,
                        existing: p.network,
                    });
                }
                Some(p) => Some(p.id),
                None => None,
            };

            let block = AddressBlock::new(cidr, BlockStatus::Container)
                .with_role(role)
                .with_parent(parent)
                .with_description(description);
            pool.insert(block.clone())?;
            tracing::info!("Registered container {}", block.network);
            Ok(block)
        })
        .await
    }

    /// Find or carve a container of the requested size.
    ///
    /// With a binding this is get-or-create: a container already bound to the
    /// same role and binding is returned as is. Otherwise the lowest free
    /// container of exactly the requested size is claimed, and failing that a
    /// new one is carved from the nearest ancestor level with room.
    pub async fn allocate_container(&self, req: &AllocationRequest) -> Result<AddressBlock> {
        check_prefix_len(req.family, req.prefix_length)?;
        let depth = self.options.ancestor_search_depth;
        self.transact(req.family, |pool| claim_or_carve(pool, req, depth)).await
    }

    /// Split a block into consecutive role subnets, in the order given.
    /// Re-running the same layout returns the subnets created the first time.
    pub async fn subdivide(&self, block_id: Uuid, layout: &[(Role, u8)]) -> Result<Vec<AddressBlock>> {
        let family = self.family_of(block_id).await?;
        self.transact(family, |pool| carve_layout(pool, block_id, layout)).await
    }

    /// Next available subnet of the requested size inside `parent_id`,
    /// recorded as a network with the request's role and binding.
    pub async fn allocate_subnet(&self, parent_id: Uuid, req: &AllocationRequest) -> Result<AddressBlock> {
        let family = self.family_of(parent_id).await?;
        check_prefix_len(family, req.prefix_length)?;
        self.transact(family, |pool| next_subnet(pool, parent_id, req)).await
    }

    /// Hand out the lowest unassigned address of a network block
    pub async fn allocate_host(&self, block_id: Uuid, binding: &str) -> Result<IpAddr> {
        let host = self.allocate_host_with(block_id, &HostRequest::new(binding)).await?;
        Ok(host.address())
    }

    /// As `allocate_host`, returning the full host record
    pub async fn allocate_host_with(&self, block_id: Uuid, req: &HostRequest) -> Result<AddressBlock> {
        if req.binding.trim().is_empty() {
            return Err(AllocError::InvalidRequest("host binding must not be empty".to_string()));
        }
        let family = self.family_of(block_id).await?;
        self.transact(family, |pool| next_host(pool, block_id, req)).await
    }

    /// Return an assigned host address to its network
    pub async fn release_host(&self, addr: IpAddr) -> Result<()> {
        let net = IpNet::from(addr);
        self.transact(AddressFamily::of(&net), |pool| {
            let id = match pool.find_exact(&net) {
                Some(b) if b.status == BlockStatus::Assigned => b.id,
                _ => return Err(AllocError::not_found("Host address", addr)),
            };
            pool.remove(id)?;
            tracing::info!("Released host {}", addr);
            Ok(())
        })
        .await
    }

    /// Delete a block that has nothing carved out of it
    pub async fn release_block(&self, block_id: Uuid) -> Result<()> {
        let family = self.family_of(block_id).await?;
        self.transact(family, |pool| {
            if pool.children_of(block_id).next().is_some() {
                return Err(AllocError::InvalidRequest(format!(
                    "block {} still has child blocks",
                    block_id
                )));
            }
            let block = pool.remove(block_id)?;
            tracing::info!("Released block {}", block.network);
            Ok(())
        })
        .await
    }

    pub async fn utilization(&self, block_id: Uuid) -> Result<SubnetUtilization> {
        let family = self.family_of(block_id).await?;
        let blocks = self.store.load_pool(family).await?;
        let pool = PoolSnapshot::new(family, blocks);
        let block = pool.require(block_id)?;

        let total = match block.status {
            BlockStatus::Network => utils::usable_host_count(&block.network),
            _ => utils::address_count(family, block.prefix_len()),
        };
        let used = pool
            .children_of(block_id)
            .map(|c| utils::address_count(family, c.prefix_len()))
            .fold(0u128, |acc, n| acc.saturating_add(n))
            .min(total);
        let percent = if total == 0 {
            0.0
        } else {
            used as f64 / total as f64 * 100.0
        };

        Ok(SubnetUtilization {
            prefix: block.network,
            total,
            used,
            percent,
        })
    }

    pub async fn get_block(&self, id: Uuid) -> Result<Option<AddressBlock>> {
        self.store.get_block(id).await
    }

    pub async fn find_by_cidr(&self, cidr: &IpNet) -> Result<Option<AddressBlock>> {
        let family = AddressFamily::of(cidr);
        let pool = PoolSnapshot::new(family, self.store.load_pool(family).await?);
        Ok(pool.find_exact(cidr).cloned())
    }

    /// Lowest-addressed block carrying both the role and the binding
    pub async fn find_bound(
        &self,
        family: AddressFamily,
        role: &Role,
        binding: &str,
    ) -> Result<Option<AddressBlock>> {
        let blocks = self.store.load_pool(family).await?;
        Ok(blocks
            .into_iter()
            .find(|b| b.role.as_ref() == Some(role) && b.binding.as_deref() == Some(binding)))
    }

    pub async fn list_children(&self, block_id: Uuid) -> Result<Vec<AddressBlock>> {
        let family = self.family_of(block_id).await?;
        let pool = PoolSnapshot::new(family, self.store.load_pool(family).await?);
        Ok(pool.children_of(block_id).cloned().collect())
    }

    pub async fn list_pool(&self, family: AddressFamily) -> Result<Vec<AddressBlock>> {
        self.store.load_pool(family).await
    }
}

fn check_prefix_len(family: AddressFamily, prefix_len: u8) -> Result<()> {
    if prefix_len > family.max_prefix_len() {
        return Err(AllocError::InvalidRequest(format!(
            "prefix length /{} is out of range for {}",
            prefix_len, family
        )));
    }
    Ok(())
}

/// Networks hand out host addresses, so they must be shorter than a host
fn check_network_len(family: AddressFamily, prefix_len: u8) -> Result<()> {
    if prefix_len >= family.max_prefix_len() {
        return Err(AllocError::InvalidRequest(format!(
            "a /{} {} network has no room for host addresses",
            prefix_len, family
        )));
    }
    Ok(())
}

fn claim_or_carve(
    pool: &mut PoolSnapshot,
    req: &AllocationRequest,
    depth: Option<usize>,
) -> Result<AddressBlock> {
    let len = req.prefix_length;

    if let Some(binding) = req.binding.as_deref() {
        let existing = pool.iter().find(|b| {
            b.status == BlockStatus::Container
                && b.prefix_len() == len
                && b.binding.as_deref() == Some(binding)
                && b.role.as_ref() == Some(&req.role)
        });
        if let Some(existing) = existing {
            return Ok(existing.clone());
        }
    }

    let free = pool
        .iter()
        .find(|b| {
            b.is_free_container()
                && b.prefix_len() == len
                && b.role.as_ref().map_or(true, |r| r == &req.role)
        })
        .cloned();
    if let Some(mut block) = free {
        if let Some(binding) = &req.binding {
            block.binding = Some(binding.clone());
            block.role = Some(req.role.clone());
            if req.description.is_some() {
                block.description = req.description.clone();
            }
            block.touch();
            pool.update(block.clone())?;
            tracing::info!("Assigned {} to {} ({})", block.network, binding, req.role);
        }
        return Ok(block);
    }

    let mut levels: Vec<u8> = pool
        .iter()
        .filter(|b| b.is_free_container() && b.prefix_len() < len)
        .map(|b| b.prefix_len())
        .collect();
    levels.sort_unstable_by(|a, b| b.cmp(a));
    levels.dedup();
    if let Some(depth) = depth {
        levels.truncate(depth);
    }

    if levels.is_empty() {
        return Err(AllocError::Exhaustion {
            family: pool.family(),
            prefix_length: len,
            scope: format!("{} pool", pool.family()),
        });
    }

    tracing::warn!("No free /{} containers found, carving one from an ancestor", len);

    let mut searched = Vec::new();
    for level in levels {
        let ancestors: Vec<IpNet> = pool
            .iter()
            .filter(|b| b.is_free_container() && b.prefix_len() == level)
            .map(|b| b.network)
            .collect();

        for ancestor in ancestors {
            let Some(candidate) = pool.first_free_subnet(&ancestor, len) else {
                searched.push(ancestor.to_string());
                continue;
            };
            let parent = pool.containing(&candidate).last().map(|b| b.id);
            let block = AddressBlock::new(candidate, BlockStatus::Container)
                .with_role(Some(req.role.clone()))
                .with_binding(req.binding.clone())
                .with_parent(parent)
                .with_description(req.description.clone());
            pool.insert(block.clone())?;
            tracing::info!("Allocated new {} from {} ({})", block.network, ancestor, req.role);
            return Ok(block);
        }
    }

    Err(AllocError::Exhaustion {
        family: pool.family(),
        prefix_length: len,
        scope: searched.join(", "),
    })
}

fn carve_layout(pool: &mut PoolSnapshot, block_id: Uuid, layout: &[(Role, u8)]) -> Result<Vec<AddressBlock>> {
    let parent = pool.require(block_id)?.clone();
    let family = pool.family();
    if parent.status == BlockStatus::Assigned {
        return Err(AllocError::InvalidRequest(format!(
            "{} is a host address and cannot be subdivided",
            parent.network
        )));
    }

    for (_, len) in layout {
        check_prefix_len(family, *len)?;
        check_network_len(family, *len)?;
    }

    let capacity = utils::address_count(family, parent.prefix_len());
    let requested = layout
        .iter()
        .map(|(_, len)| utils::address_count(family, *len))
        .fold(0u128, |acc, n| acc.saturating_add(n));
    let too_large = layout.iter().any(|(_, len)| *len < parent.prefix_len());
    if too_large || requested > capacity {
        return Err(AllocError::Size {
            parent: parent.network,
            requested,
            capacity,
        });
    }

    let masks: Vec<u128> = layout.iter().map(|(_, len)| utils::hostmask(family, *len)).collect();
    let (lo, hi) = utils::bounds(&parent.network);
    let starts = match utils::layout_consecutive(lo, hi, &masks) {
        Some(starts) => starts,
        None => {
            // alignment padding pushed the layout past the parent's end
            let span = utils::layout_consecutive(lo, u128::MAX, &masks)
                .and_then(|s| s.last().zip(masks.last()).map(|(start, mask)| (start + mask - lo).saturating_add(1)))
                .unwrap_or(u128::MAX);
            return Err(AllocError::Size {
                parent: parent.network,
                requested: span,
                capacity,
            });
        }
    };

    let mut children = Vec::with_capacity(layout.len());
    for ((role, len), start) in layout.iter().zip(starts) {
        let net = utils::net_from(family, start, *len).ok_or_else(|| {
            AllocError::InvalidRequest(format!("cannot build /{} at offset {:#x}", len, start))
        })?;

        if let Some(existing) = pool.find_exact(&net) {
            if existing.parent_id == Some(parent.id) && existing.role.as_ref() == Some(role) {
                children.push(existing.clone());
                continue;
            }
            return Err(AllocError::Overlap {
                requested: net,
                existing: existing.network,
            });
        }
        let conflict = pool
            .inside(&net)
            .next()
            .or_else(|| {
                pool.containing(&net)
                    .into_iter()
                    .find(|b| b.prefix_len() > parent.prefix_len())
            })
            .map(|b| b.network);
        if let Some(existing) = conflict {
            return Err(AllocError::Overlap {
                requested: net,
                existing,
            });
        }

        let child = AddressBlock::new(net, BlockStatus::Network)
            .with_role(Some(role.clone()))
            .with_binding(parent.binding.clone())
            .with_parent(Some(parent.id));
        pool.insert(child.clone())?;
        tracing::info!("'{}' assigned to '{}'", child.network, role);
        children.push(child);
    }

    Ok(children)
}

fn next_subnet(pool: &mut PoolSnapshot, parent_id: Uuid, req: &AllocationRequest) -> Result<AddressBlock> {
    let parent = pool.require(parent_id)?.clone();
    let family = pool.family();
    let len = req.prefix_length;

    if parent.status == BlockStatus::Assigned {
        return Err(AllocError::InvalidRequest(format!(
            "{} is a host address and cannot hold subnets",
            parent.network
        )));
    }
    if len < parent.prefix_len() {
        return Err(AllocError::Size {
            parent: parent.network,
            requested: utils::address_count(family, len),
            capacity: utils::address_count(family, parent.prefix_len()),
        });
    }
    if len == parent.prefix_len() {
        return Err(AllocError::InvalidRequest(format!(
            "a /{} subnet would be {} itself",
            len, parent.network
        )));
    }
    check_network_len(family, len)?;

    let existing = pool.inside(&parent.network).find(|b| {
        b.status == BlockStatus::Network
            && b.prefix_len() == len
            && b.role.as_ref() == Some(&req.role)
            && b.binding == req.binding
    });
    if let Some(existing) = existing {
        return Ok(existing.clone());
    }

    let net = pool
        .first_free_subnet(&parent.network, len)
        .ok_or_else(|| AllocError::Exhaustion {
            family,
            prefix_length: len,
            scope: parent.network.to_string(),
        })?;
    let container = pool.containing(&net).last().map(|b| b.id);
    let block = AddressBlock::new(net, BlockStatus::Network)
        .with_role(Some(req.role.clone()))
        .with_binding(req.binding.clone())
        .with_parent(container)
        .with_description(req.description.clone());
    pool.insert(block.clone())?;
    tracing::info!("Allocated subnet {} in {} ({})", block.network, parent.network, req.role);
    Ok(block)
}

fn next_host(pool: &mut PoolSnapshot, block_id: Uuid, req: &HostRequest) -> Result<AddressBlock> {
    let network = pool.require(block_id)?.clone();
    let family = pool.family();
    if network.status != BlockStatus::Network {
        return Err(AllocError::InvalidRequest(format!(
            "{} is a {} block; hosts come from network blocks",
            network.network, network.status
        )));
    }
    check_network_len(family, network.prefix_len())?;

    let taken: Vec<(u128, u128)> = pool
        .inside(&network.network)
        .map(|b| utils::bounds(&b.network))
        .collect();
    let value = utils::first_fit(utils::usable_host_range(&network.network), 0, &taken).ok_or_else(|| {
        AllocError::Exhaustion {
            family,
            prefix_length: family.max_prefix_len(),
            scope: network.network.to_string(),
        }
    })?;

    let addr = utils::addr_from(family, value);
    let mut host = AddressBlock::new(IpNet::from(addr), BlockStatus::Assigned)
        .with_role(network.role.clone())
        .with_binding(Some(req.binding.clone()))
        .with_parent(Some(network.id))
        .with_description(req.description.clone());
    host.dns_name = req.dns_name.clone().or_else(|| {
        req.dns_zone
            .as_ref()
            .map(|zone| format!("{}.{}", utils::dns_label(addr), zone))
    });
    pool.insert(host.clone())?;
    tracing::info!("Assigned {} in {} to {}", addr, network.network, req.binding);
    Ok(host)
}
