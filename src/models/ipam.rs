use chrono::{DateTime, Utc};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use uuid::Uuid;

/// Address family of a pool. Blocks of different families never interact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AddressFamily {
    #[default]
    V4,
    V6,
}

impl AddressFamily {
    pub fn of(net: &IpNet) -> Self {
        match net {
            IpNet::V4(_) => AddressFamily::V4,
            IpNet::V6(_) => AddressFamily::V6,
        }
    }

    /// Number of bits in an address of this family
    pub fn max_prefix_len(self) -> u8 {
        match self {
            AddressFamily::V4 => 32,
            AddressFamily::V6 => 128,
        }
    }

    /// Value stored in the `family` column
    pub fn as_i64(self) -> i64 {
        match self {
            AddressFamily::V4 => 4,
            AddressFamily::V6 => 6,
        }
    }

    pub fn from_i64(v: i64) -> Option<Self> {
        match v {
            4 => Some(AddressFamily::V4),
            6 => Some(AddressFamily::V6),
            _ => None,
        }
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressFamily::V4 => write!(f, "IPv4"),
            AddressFamily::V6 => write!(f, "IPv6"),
        }
    }
}

/// Role tag classifying what a block is used for.
///
/// The well-known roles come from the POP layout; anything else is kept
/// verbatim as `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Role {
    Pop,
    Server,
    Mgmt,
    Loopback,
    P2p,
    Other(String),
}

impl Role {
    pub fn as_str(&self) -> &str {
        match self {
            Role::Pop => "pop",
            Role::Server => "server",
            Role::Mgmt => "mgmt",
            Role::Loopback => "loopback",
            Role::P2p => "p2p",
            Role::Other(name) => name,
        }
    }
}

impl From<&str> for Role {
    fn from(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "pop" => Role::Pop,
            "server" => Role::Server,
            "mgmt" | "management" => Role::Mgmt,
            "loopback" => Role::Loopback,
            "p2p" | "point-to-point" | "point_to_point" => Role::P2p,
            other => Role::Other(other.to_string()),
        }
    }
}

impl From<String> for Role {
    fn from(s: String) -> Self {
        Role::from(s.as_str())
    }
}

impl From<Role> for String {
    fn from(role: Role) -> Self {
        role.as_str().to_string()
    }
}

impl FromStr for Role {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Role::from(s))
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a block.
///
/// A block with no binding is free; there is no separate "free" status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockStatus {
    /// Reserved for further subdivision, never handed to hosts directly
    Container,
    /// Role subnet that individual addresses are drawn from
    Network,
    /// A single host address
    Assigned,
}

impl BlockStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BlockStatus::Container => "container",
            BlockStatus::Network => "network",
            BlockStatus::Assigned => "assigned",
        }
    }
}

impl FromStr for BlockStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "container" => Ok(BlockStatus::Container),
            "network" => Ok(BlockStatus::Network),
            "assigned" => Ok(BlockStatus::Assigned),
            other => Err(format!("unknown block status: {}", other)),
        }
    }
}

impl fmt::Display for BlockStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A contiguous range of addresses tracked by the pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddressBlock {
    pub id: Uuid,
    pub network: IpNet,
    pub status: BlockStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub binding: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AddressBlock {
    /// Create a new, unbound, parentless block. The network is truncated to
    /// its canonical form.
    pub fn new(network: IpNet, status: BlockStatus) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            network: network.trunc(),
            status,
            role: None,
            binding: None,
            parent_id: None,
            dns_name: None,
            description: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_role(mut self, role: Option<Role>) -> Self {
        self.role = role;
        self
    }

    pub fn with_binding(mut self, binding: Option<String>) -> Self {
        self.binding = binding;
        self
    }

    pub fn with_parent(mut self, parent_id: Option<Uuid>) -> Self {
        self.parent_id = parent_id;
        self
    }

    pub fn with_description(mut self, description: Option<String>) -> Self {
        self.description = description;
        self
    }

    pub fn family(&self) -> AddressFamily {
        AddressFamily::of(&self.network)
    }

    pub fn prefix_len(&self) -> u8 {
        self.network.prefix_len()
    }

    /// Unbound container: a candidate for claiming or carving
    pub fn is_free_container(&self) -> bool {
        self.status == BlockStatus::Container && self.binding.is_none()
    }

    /// Host address of an assigned record
    pub fn address(&self) -> IpAddr {
        self.network.addr()
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// A request for a block of a given size and role
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationRequest {
    pub role: Role,
    pub prefix_length: u8,
    #[serde(default)]
    pub binding: Option<String>,
    #[serde(default)]
    pub family: AddressFamily,
    #[serde(default)]
    pub description: Option<String>,
}

impl AllocationRequest {
    pub fn new(role: Role, prefix_length: u8) -> Self {
        Self {
            role,
            prefix_length,
            binding: None,
            family: AddressFamily::V4,
            description: None,
        }
    }

    pub fn with_binding(mut self, binding: impl Into<String>) -> Self {
        self.binding = Some(binding.into());
        self
    }

    pub fn with_family(mut self, family: AddressFamily) -> Self {
        self.family = family;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// A request for a single host address
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostRequest {
    pub binding: String,
    #[serde(default)]
    pub dns_name: Option<String>,
    /// Zone for a name derived from the assigned address, e.g.
    /// "ip-10-0-128-1.<zone>". Ignored when `dns_name` is set.
    #[serde(default)]
    pub dns_zone: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

impl HostRequest {
    pub fn new(binding: impl Into<String>) -> Self {
        Self {
            binding: binding.into(),
            dns_name: None,
            dns_zone: None,
            description: None,
        }
    }

    pub fn with_dns_zone(mut self, zone: impl Into<String>) -> Self {
        self.dns_zone = Some(zone.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_dns_name(mut self, dns_name: impl Into<String>) -> Self {
        self.dns_name = Some(dns_name.into());
        self
    }
}

/// Used/total address counts for a block
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubnetUtilization {
    pub prefix: IpNet,
    pub total: u128,
    pub used: u128,
    pub percent: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_parsing() {
        assert_eq!(Role::from("POP"), Role::Pop);
        assert_eq!(Role::from("point-to-point"), Role::P2p);
        assert_eq!(Role::from("management"), Role::Mgmt);
        assert_eq!(Role::from("storage"), Role::Other("storage".to_string()));
        assert_eq!(Role::P2p.to_string(), "p2p");
    }

    #[test]
    fn test_role_serde_as_string() {
        let json = serde_json::to_string(&Role::Loopback).unwrap();
        assert_eq!(json, "\"loopback\"");
        let role: Role = serde_json::from_str("\"p2p\"").unwrap();
        assert_eq!(role, Role::P2p);
    }

    #[test]
    fn test_new_block_is_canonical() {
        let block = AddressBlock::new("10.1.2.3/16".parse().unwrap(), BlockStatus::Container);
        assert_eq!(block.network.to_string(), "10.1.0.0/16");
        assert!(block.is_free_container());
        assert_eq!(block.family(), AddressFamily::V4);
    }

    #[test]
    fn test_status_round_trip_text() {
        for status in [BlockStatus::Container, BlockStatus::Network, BlockStatus::Assigned] {
            assert_eq!(status.as_str().parse::<BlockStatus>().unwrap(), status);
        }
        assert!("free".parse::<BlockStatus>().is_err());
    }
}
