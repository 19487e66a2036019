use ipnet::IpNet;
use std::env;

use crate::models::Role;
use crate::utils;

/// Config holds all job configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: String,
    pub db_max_connections: u32,
    /// None searches every ancestor level
    pub ancestor_search_depth: Option<usize>,
    pub pop_prefix_size: u8,
    pub role_prefix_size: u8,
    pub vlan_prefix_size: u8,
    pub role_layout: Vec<Role>,
    /// (role, VLAN id) pairs carved per rack
    pub vlan_roles: Vec<(Role, u16)>,
    pub global_pools: Vec<IpNet>,
    pub dns_suffix: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: "/data/ipam.db".to_string(),
            db_max_connections: 5,
            ancestor_search_depth: None,
            pop_prefix_size: 16,
            role_prefix_size: 18,
            vlan_prefix_size: 24,
            role_layout: vec![Role::Server, Role::Mgmt, Role::Loopback, Role::P2p],
            vlan_roles: vec![(Role::Server, 1000), (Role::Mgmt, 99)],
            global_pools: "10.0.0.0/8".parse::<IpNet>().into_iter().collect(),
            dns_suffix: "dc.example.net".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables with defaults
    pub fn load() -> Self {
        let defaults = Self::default();
        Self {
            db_path: get_env("DB_PATH", &defaults.db_path),
            db_max_connections: get_env("DB_MAX_CONNECTIONS", "5")
                .parse()
                .unwrap_or(defaults.db_max_connections),
            ancestor_search_depth: env::var("ANCESTOR_SEARCH_DEPTH")
                .ok()
                .and_then(|v| parse_depth(&v)),
            pop_prefix_size: get_env("POP_PREFIX_SIZE", "16")
                .parse()
                .unwrap_or(defaults.pop_prefix_size),
            role_prefix_size: get_env("ROLE_PREFIX_SIZE", "18")
                .parse()
                .unwrap_or(defaults.role_prefix_size),
            vlan_prefix_size: get_env("VLAN_PREFIX_SIZE", "24")
                .parse()
                .unwrap_or(defaults.vlan_prefix_size),
            role_layout: env::var("ROLE_LAYOUT")
                .map(|v| parse_roles(&v))
                .ok()
                .filter(|roles| !roles.is_empty())
                .unwrap_or(defaults.role_layout),
            vlan_roles: env::var("VLAN_ROLES")
                .map(|v| parse_vlan_roles(&v))
                .ok()
                .filter(|roles| !roles.is_empty())
                .unwrap_or(defaults.vlan_roles),
            global_pools: env::var("GLOBAL_POOLS")
                .map(|v| parse_pools(&v))
                .ok()
                .filter(|pools| !pools.is_empty())
                .unwrap_or(defaults.global_pools),
            dns_suffix: get_env("DNS_SUFFIX", &defaults.dns_suffix),
        }
    }
}

fn get_env(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Unset or unparseable means unlimited; the latter is logged
fn parse_depth(value: &str) -> Option<usize> {
    match value.trim().parse() {
        Ok(depth) => Some(depth),
        Err(_) => {
            tracing::warn!(
                "Ignoring ANCESTOR_SEARCH_DEPTH '{}': not a number, ancestor search is unlimited",
                value.trim()
            );
            None
        }
    }
}

/// "server,mgmt,loopback,p2p"
fn parse_roles(value: &str) -> Vec<Role> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(Role::from)
        .collect()
}

/// "server:1000,mgmt:99"
fn parse_vlan_roles(value: &str) -> Vec<(Role, u16)> {
    value
        .split(',')
        .filter_map(|entry| {
            let (role, vid) = entry.split_once(':')?;
            match vid.trim().parse() {
                Ok(vid) => Some((Role::from(role), vid)),
                Err(_) => {
                    tracing::warn!("Ignoring VLAN role entry '{}': bad VLAN id", entry.trim());
                    None
                }
            }
        })
        .collect()
}

fn parse_pools(value: &str) -> Vec<IpNet> {
    value
        .split(',')
        .filter(|s| !s.trim().is_empty())
        .filter_map(|s| match utils::parse_cidr(s) {
            Ok(net) => Some(net),
            Err(e) => {
                tracing::warn!("Ignoring global pool: {}", e);
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_pop_layout() {
        let cfg = Config::default();
        assert_eq!(cfg.pop_prefix_size, 16);
        assert_eq!(cfg.role_prefix_size, 18);
        assert_eq!(cfg.role_layout.len(), 4);
        assert_eq!(cfg.global_pools, vec!["10.0.0.0/8".parse::<IpNet>().unwrap()]);
    }

    #[test]
    fn test_parse_depth() {
        assert_eq!(parse_depth(" 2 "), Some(2));
        assert_eq!(parse_depth("0"), Some(0));
        assert_eq!(parse_depth("two"), None);
        assert_eq!(parse_depth("-1"), None);
    }

    #[test]
    fn test_parse_roles() {
        assert_eq!(
            parse_roles("server, management ,,loopback"),
            vec![Role::Server, Role::Mgmt, Role::Loopback]
        );
    }

    #[test]
    fn test_parse_vlan_roles_skips_bad_entries() {
        assert_eq!(
            parse_vlan_roles("server:1000,mgmt:abc,storage:300"),
            vec![(Role::Server, 1000), (Role::Other("storage".into()), 300)]
        );
    }

    #[test]
    fn test_parse_pools() {
        let pools = parse_pools("10.0.0.0/8, bogus, 2001:db8::/32");
        assert_eq!(pools.len(), 2);
        assert_eq!(pools[1].to_string(), "2001:db8::/32");
    }
}
