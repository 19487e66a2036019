//! CIDR arithmetic shared by the allocator and the stores.
//!
//! Addresses of both families are handled as `u128` so one set of routines
//! covers IPv4 and IPv6. IPv4 values simply never exceed `u32::MAX`.

use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::models::AddressFamily;

/// Parse a CIDR string (e.g. "10.0.0.0/16") into its canonical network.
/// A bare address is treated as a full-length prefix.
pub fn parse_cidr(cidr: &str) -> Result<IpNet, String> {
    let cidr = cidr.trim();
    if cidr.is_empty() {
        return Err("Empty CIDR".to_string());
    }
    if cidr.contains('/') {
        cidr.parse::<IpNet>()
            .map(|net| net.trunc())
            .map_err(|e| format!("Invalid CIDR {}: {}", cidr, e))
    } else {
        cidr.parse::<IpAddr>()
            .map(IpNet::from)
            .map_err(|e| format!("Invalid address {}: {}", cidr, e))
    }
}

/// First and last address of a network as integers
pub fn bounds(net: &IpNet) -> (u128, u128) {
    match net {
        IpNet::V4(n) => (u32::from(n.network()) as u128, u32::from(n.broadcast()) as u128),
        IpNet::V6(n) => (u128::from(n.network()), u128::from(n.broadcast())),
    }
}

/// Host bits of a prefix as a mask, e.g. 0xff for an IPv4 /24
pub fn hostmask(family: AddressFamily, prefix_len: u8) -> u128 {
    let host_bits = family.max_prefix_len().saturating_sub(prefix_len) as u32;
    if host_bits >= 128 {
        u128::MAX
    } else {
        (1u128 << host_bits) - 1
    }
}

/// Number of addresses in a prefix, saturating for the whole IPv6 space
pub fn address_count(family: AddressFamily, prefix_len: u8) -> u128 {
    hostmask(family, prefix_len).saturating_add(1)
}

pub fn addr_from(family: AddressFamily, value: u128) -> IpAddr {
    match family {
        AddressFamily::V4 => IpAddr::V4(Ipv4Addr::from(value as u32)),
        AddressFamily::V6 => IpAddr::V6(Ipv6Addr::from(value)),
    }
}

pub fn addr_value(addr: IpAddr) -> u128 {
    match addr {
        IpAddr::V4(a) => u32::from(a) as u128,
        IpAddr::V6(a) => u128::from(a),
    }
}

/// Build the network starting at `start` with the given prefix length
pub fn net_from(family: AddressFamily, start: u128, prefix_len: u8) -> Option<IpNet> {
    match family {
        AddressFamily::V4 => {
            let start = u32::try_from(start).ok()?;
            Ipv4Net::new(Ipv4Addr::from(start), prefix_len).ok().map(IpNet::V4)
        }
        AddressFamily::V6 => Ipv6Net::new(Ipv6Addr::from(start), prefix_len).ok().map(IpNet::V6),
    }
}

/// Round `value` up to the next boundary of a block with the given hostmask.
/// Returns None when that boundary lies past the end of the address space.
pub fn align_up(value: u128, hostmask: u128) -> Option<u128> {
    if value & hostmask == 0 {
        Some(value)
    } else {
        (value | hostmask).checked_add(1)
    }
}

/// Lowest aligned block of size `hostmask + 1` inside `range` that does not
/// touch any of the `taken` ranges. `taken` must be sorted by start address;
/// nested and overlapping entries are fine.
pub fn first_fit(range: (u128, u128), hostmask: u128, taken: &[(u128, u128)]) -> Option<u128> {
    let (start, end) = range;
    let mut cursor = align_up(start, hostmask)?;

    for &(lo, hi) in taken {
        let last = cursor.checked_add(hostmask)?;
        if last > end {
            return None;
        }
        if hi < cursor {
            continue;
        }
        if last < lo {
            return Some(cursor);
        }
        cursor = align_up(hi.checked_add(1)?, hostmask)?;
    }

    let last = cursor.checked_add(hostmask)?;
    (last <= end).then_some(cursor)
}

/// Lay blocks out back to back from `start`, each aligned to its own size.
/// Returns the start of every block, or None if the layout runs past `end`.
pub fn layout_consecutive(start: u128, end: u128, hostmasks: &[u128]) -> Option<Vec<u128>> {
    let mut starts = Vec::with_capacity(hostmasks.len());
    let mut cursor = Some(start);

    for &mask in hostmasks {
        let at = align_up(cursor?, mask)?;
        let last = at.checked_add(mask)?;
        if last > end {
            return None;
        }
        starts.push(at);
        cursor = last.checked_add(1);
    }

    Some(starts)
}

/// Range of addresses that may be handed to hosts.
///
/// IPv4 networks shorter than /31 lose their network and broadcast address,
/// IPv6 networks shorter than /127 lose the subnet-router anycast address.
pub fn usable_host_range(net: &IpNet) -> (u128, u128) {
    let (lo, hi) = bounds(net);
    let len = net.prefix_len();
    match net {
        IpNet::V4(_) if len < 31 => (lo + 1, hi - 1),
        IpNet::V6(_) if len < 127 => (lo + 1, hi),
        _ => (lo, hi),
    }
}

/// Number of addresses `usable_host_range` yields
pub fn usable_host_count(net: &IpNet) -> u128 {
    let (lo, hi) = usable_host_range(net);
    (hi - lo).saturating_add(1)
}

/// DNS-safe label for an address, e.g. "ip-10-0-0-1"
pub fn dns_label(addr: IpAddr) -> String {
    let text = match addr {
        IpAddr::V4(a) => a.to_string().replace('.', "-"),
        IpAddr::V6(a) => a.to_string().replace("::", "-0-").replace(':', "-"),
    };
    format!("ip-{}", text.trim_matches('-'))
}

/// Zero-padded hex key whose text ordering matches numeric ordering
pub fn sort_key(value: u128) -> String {
    format!("{:032x}", value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> IpNet {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_cidr() {
        assert_eq!(parse_cidr("10.1.2.3/16").unwrap(), net("10.1.0.0/16"));
        assert_eq!(parse_cidr(" 10.0.0.1 ").unwrap(), net("10.0.0.1/32"));
        assert_eq!(parse_cidr("2001:db8::/32").unwrap(), net("2001:db8::/32"));
        assert!(parse_cidr("").is_err());
        assert!(parse_cidr("10.0.0.0/33").is_err());
        assert!(parse_cidr("not-a-cidr").is_err());
    }

    #[test]
    fn test_bounds_and_counts() {
        assert_eq!(bounds(&net("10.0.0.0/24")), (0x0a00_0000, 0x0a00_00ff));
        assert_eq!(address_count(AddressFamily::V4, 16), 65536);
        assert_eq!(address_count(AddressFamily::V4, 32), 1);
        assert_eq!(hostmask(AddressFamily::V6, 0), u128::MAX);
        assert_eq!(address_count(AddressFamily::V6, 0), u128::MAX);
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 0xff), Some(0));
        assert_eq!(align_up(1, 0xff), Some(0x100));
        assert_eq!(align_up(0x100, 0xff), Some(0x100));
        assert_eq!(align_up(u128::MAX, 0xff), None);
    }

    #[test]
    fn test_first_fit_empty() {
        assert_eq!(first_fit((0, 0xffff), 0xff, &[]), Some(0));
    }

    #[test]
    fn test_first_fit_skips_taken() {
        let taken = [(0, 0xff), (0x100, 0x1ff), (0x300, 0x3ff)];
        assert_eq!(first_fit((0, 0xffff), 0xff, &taken), Some(0x200));
    }

    #[test]
    fn test_first_fit_nested_taken() {
        // a /20 holding a /24, then a separate /24
        let taken = [(0, 0xfff), (0, 0xff), (0x1000, 0x10ff)];
        assert_eq!(first_fit((0, 0xffff), 0xfff, &taken), Some(0x2000));
    }

    #[test]
    fn test_first_fit_alignment_after_small_block() {
        // one /32 used at the start pushes a /24 to the next boundary
        let taken = [(0, 0)];
        assert_eq!(first_fit((0, 0xffff), 0xff, &taken), Some(0x100));
    }

    #[test]
    fn test_first_fit_exhausted() {
        let taken = [(0, 0xff)];
        assert_eq!(first_fit((0, 0xff), 0xff, &taken), None);
        assert_eq!(first_fit((0, 0x7f), 0xff, &[]), None);
    }

    #[test]
    fn test_first_fit_single_addresses() {
        let taken = [(1, 1), (2, 2), (4, 4)];
        assert_eq!(first_fit((1, 6), 0, &taken), Some(3));
    }

    #[test]
    fn test_layout_consecutive() {
        let q = hostmask(AddressFamily::V4, 18);
        let starts = layout_consecutive(0, 0xffff, &[q, q, q, q]).unwrap();
        assert_eq!(starts, vec![0, 0x4000, 0x8000, 0xc000]);

        // /24 then /17: the /17 lands on its own boundary
        let starts = layout_consecutive(0, 0xffff, &[0xff, 0x7fff]).unwrap();
        assert_eq!(starts, vec![0, 0x8000]);

        // /24, /17, /18 runs off the end once aligned
        assert!(layout_consecutive(0, 0xffff, &[0xff, 0x7fff, 0x3fff]).is_none());
    }

    #[test]
    fn test_usable_host_range() {
        let (lo, hi) = usable_host_range(&net("10.0.0.0/29"));
        assert_eq!(hi - lo + 1, 6);
        assert_eq!(usable_host_count(&net("10.0.0.0/31")), 2);
        assert_eq!(usable_host_count(&net("10.0.0.1/32")), 1);
        assert_eq!(usable_host_count(&net("2001:db8::/126")), 3);
        assert_eq!(usable_host_count(&net("2001:db8::/127")), 2);
    }

    #[test]
    fn test_net_from() {
        assert_eq!(net_from(AddressFamily::V4, 0x0a00_4000, 18), Some(net("10.0.64.0/18")));
        assert_eq!(net_from(AddressFamily::V4, 1u128 << 40, 18), None);
    }

    #[test]
    fn test_dns_label() {
        assert_eq!(dns_label("10.0.128.1".parse().unwrap()), "ip-10-0-128-1");
        assert_eq!(dns_label("2001:db8::1".parse().unwrap()), "ip-2001-db8-0-1");
    }

    #[test]
    fn test_sort_key_orders_numerically() {
        assert!(sort_key(9) < sort_key(10));
        assert!(sort_key(0x0a00_0000) < sort_key(0xc0a8_0000));
    }
}
