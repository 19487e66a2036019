//! POP provisioning job.
//!
//! Claims a POP container for a site, splits it into role networks, gives
//! every device a loopback and carves per-rack VLAN subnets with a gateway
//! address each. Every step is get-or-create, so re-running the job for the
//! same site converges on the same allocation.

use anyhow::{bail, Context, Result};
use ipnet::IpNet;
use serde::Serialize;
use std::net::IpAddr;

use crate::allocator::AddressSpaceAllocator;
use crate::config::Config;
use crate::db::BlockStore;
use crate::models::*;

/// Sizes, layout and naming used when provisioning a POP
#[derive(Debug, Clone)]
pub struct PopPlan {
    pub pop_prefix_size: u8,
    pub role_prefix_size: u8,
    pub vlan_prefix_size: u8,
    pub role_layout: Vec<Role>,
    pub vlan_roles: Vec<(Role, u16)>,
    pub dns_suffix: String,
}

impl From<&Config> for PopPlan {
    fn from(cfg: &Config) -> Self {
        Self {
            pop_prefix_size: cfg.pop_prefix_size,
            role_prefix_size: cfg.role_prefix_size,
            vlan_prefix_size: cfg.vlan_prefix_size,
            role_layout: cfg.role_layout.clone(),
            vlan_roles: cfg.vlan_roles.clone(),
            dns_suffix: cfg.dns_suffix.clone(),
        }
    }
}

impl Default for PopPlan {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RoleSubnet {
    pub role: Role,
    pub prefix: IpNet,
}

#[derive(Debug, Clone, Serialize)]
pub struct HostAssignment {
    pub device: String,
    pub address: IpAddr,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns_name: Option<String>,
}

/// Result of provisioning one site
#[derive(Debug, Clone, Serialize)]
pub struct PopAllocation {
    pub site: String,
    pub container: IpNet,
    pub subnets: Vec<RoleSubnet>,
    pub loopbacks: Vec<HostAssignment>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RackVlan {
    pub name: String,
    pub role: Role,
    pub vlan_id: u16,
    pub prefix: IpNet,
    pub gateway: IpAddr,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns_name: Option<String>,
}

pub struct PopProvisioner<S> {
    allocator: AddressSpaceAllocator<S>,
    plan: PopPlan,
}

impl<S: BlockStore> PopProvisioner<S> {
    pub fn new(allocator: AddressSpaceAllocator<S>, plan: PopPlan) -> Self {
        Self { allocator, plan }
    }

    pub fn allocator(&self) -> &AddressSpaceAllocator<S> {
        &self.allocator
    }

    pub fn plan(&self) -> &PopPlan {
        &self.plan
    }

    /// Allocate the POP container for `site`, lay out its role networks and
    /// assign a loopback to each device.
    pub async fn provision_site(&self, site: &str, devices: &[String]) -> Result<PopAllocation> {
        let site = site.trim();
        if site.is_empty() {
            bail!("site code must not be empty");
        }
        tracing::info!("Provisioning POP {} ({} devices)", site, devices.len());

        let req = AllocationRequest::new(Role::Pop, self.plan.pop_prefix_size)
            .with_binding(site)
            .with_description(format!("POP {}", site));
        let container = self
            .allocator
            .allocate_container(&req)
            .await
            .with_context(|| format!("Failed to allocate POP container for {}", site))?;
        tracing::info!("POP {} uses {}", site, container.network);

        let layout: Vec<(Role, u8)> = self
            .plan
            .role_layout
            .iter()
            .map(|role| (role.clone(), self.plan.role_prefix_size))
            .collect();
        let networks = self
            .allocator
            .subdivide(container.id, &layout)
            .await
            .with_context(|| format!("Failed to subdivide {}", container.network))?;

        let mut loopbacks = Vec::with_capacity(devices.len());
        if !devices.is_empty() {
            let loopback = networks
                .iter()
                .find(|n| n.role == Some(Role::Loopback))
                .context("Role layout has no loopback network")?;
            for device in devices {
                loopbacks.push(self.assign_loopback(site, loopback, device).await?);
            }
        }

        Ok(PopAllocation {
            site: site.to_string(),
            container: container.network,
            subnets: networks
                .into_iter()
                .filter_map(|n| n.role.map(|role| RoleSubnet { role, prefix: n.network }))
                .collect(),
            loopbacks,
        })
    }

    async fn assign_loopback(&self, site: &str, loopback: &AddressBlock, device: &str) -> Result<HostAssignment> {
        let existing = self
            .allocator
            .list_children(loopback.id)
            .await?
            .into_iter()
            .find(|b| b.status == BlockStatus::Assigned && b.binding.as_deref() == Some(device));

        let host = match existing {
            Some(host) => {
                tracing::info!("Device {} already has loopback {}", device, host.network.addr());
                host
            }
            None => {
                let req = HostRequest::new(device)
                    .with_dns_name(format!("{}.{}.{}", device, site, self.plan.dns_suffix))
                    .with_description("Loopback0");
                self.allocator
                    .allocate_host_with(loopback.id, &req)
                    .await
                    .with_context(|| format!("Failed to assign loopback for {}", device))?
            }
        };

        Ok(HostAssignment {
            device: device.to_string(),
            address: host.address(),
            dns_name: host.dns_name,
        })
    }

    /// Carve one VLAN subnet per VLAN role for `rack` and give each a
    /// gateway address.
    pub async fn allocate_rack_vlans(&self, site: &str, rack: &str) -> Result<Vec<RackVlan>> {
        let container = self
            .allocator
            .find_bound(AddressFamily::V4, &Role::Pop, site)
            .await?
            .with_context(|| format!("POP {} has not been provisioned", site))?;
        let networks = self.allocator.list_children(container.id).await?;
        let binding = format!("{}/{}", site, rack);

        let mut vlans = Vec::with_capacity(self.plan.vlan_roles.len());
        for (role, vlan_id) in &self.plan.vlan_roles {
            let network = networks
                .iter()
                .find(|n| n.role.as_ref() == Some(role))
                .with_context(|| format!("POP {} has no {} network", site, role))?;

            let name = format!("{}-{}", rack, role);
            let req = AllocationRequest::new(role.clone(), self.plan.vlan_prefix_size)
                .with_binding(binding.clone())
                .with_description(name.clone());
            let subnet = self
                .allocator
                .allocate_subnet(network.id, &req)
                .await
                .with_context(|| format!("Failed to allocate {} VLAN for {}", role, rack))?;

            let existing = self
                .allocator
                .list_children(subnet.id)
                .await?
                .into_iter()
                .find(|b| b.status == BlockStatus::Assigned && b.binding.as_deref() == Some(binding.as_str()));
            let gateway = match existing {
                Some(host) => host,
                None => {
                    let req = HostRequest::new(binding.clone())
                        .with_dns_zone(format!("{}.{}.{}", role, site, self.plan.dns_suffix))
                        .with_description(format!("vlan{}", vlan_id));
                    self.allocator
                        .allocate_host_with(subnet.id, &req)
                        .await
                        .with_context(|| format!("Failed to assign {} gateway for {}", role, rack))?
                }
            };
            tracing::info!("Rack {} {} VLAN {} uses {}", rack, role, vlan_id, subnet.network);

            vlans.push(RackVlan {
                name,
                role: role.clone(),
                vlan_id: *vlan_id,
                prefix: subnet.network,
                gateway: gateway.address(),
                dns_name: gateway.dns_name,
            });
        }
        Ok(vlans)
    }
}
