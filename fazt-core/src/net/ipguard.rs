//! SSRF IP validation
//!
//! Every egress connection target is validated after DNS resolution and
//! before connect. Blocked ranges: loopback, RFC1918, CGNAT, link-local
//! (including the cloud metadata range), IPv6 loopback/ULA/link-local, and
//! unspecified addresses. URLs carrying IP literals are rejected before any
//! DNS work.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Why an address was rejected, for logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    Loopback,
    Private,
    CarrierGradeNat,
    LinkLocal,
    UniqueLocal,
    Unspecified,
    Multicast,
}

impl std::fmt::Display for BlockReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Loopback => write!(f, "loopback"),
            Self::Private => write!(f, "private range"),
            Self::CarrierGradeNat => write!(f, "carrier-grade NAT"),
            Self::LinkLocal => write!(f, "link-local"),
            Self::UniqueLocal => write!(f, "unique-local"),
            Self::Unspecified => write!(f, "unspecified"),
            Self::Multicast => write!(f, "multicast"),
        }
    }
}

/// Check one resolved address. `None` means allowed.
pub fn check_ip(ip: IpAddr) -> Option<BlockReason> {
    match ip {
        IpAddr::V4(v4) => check_v4(v4),
        IpAddr::V6(v6) => {
            // IPv4-mapped addresses are validated as their inner V4.
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return check_v4(mapped);
            }
            check_v6(v6)
        }
    }
}

fn check_v4(ip: Ipv4Addr) -> Option<BlockReason> {
    let octets = ip.octets();
    if ip.is_unspecified() {
        return Some(BlockReason::Unspecified);
    }
    if ip.is_loopback() {
        return Some(BlockReason::Loopback);
    }
    if ip.is_private() {
        return Some(BlockReason::Private);
    }
    // 100.64.0.0/10
    if octets[0] == 100 && (octets[1] & 0xC0) == 64 {
        return Some(BlockReason::CarrierGradeNat);
    }
    // 169.254.0.0/16 covers the 169.254.169.254 metadata endpoint.
    if ip.is_link_local() {
        return Some(BlockReason::LinkLocal);
    }
    if ip.is_multicast() || ip.is_broadcast() {
        return Some(BlockReason::Multicast);
    }
    None
}

fn check_v6(ip: Ipv6Addr) -> Option<BlockReason> {
    if ip.is_unspecified() {
        return Some(BlockReason::Unspecified);
    }
    if ip.is_loopback() {
        return Some(BlockReason::Loopback);
    }
    let segments = ip.segments();
    // fc00::/7 unique-local
    if (segments[0] & 0xFE00) == 0xFC00 {
        return Some(BlockReason::UniqueLocal);
    }
    // fe80::/10 link-local
    if (segments[0] & 0xFFC0) == 0xFE80 {
        return Some(BlockReason::LinkLocal);
    }
    if ip.is_multicast() {
        return Some(BlockReason::Multicast);
    }
    None
}

/// Whether a hostname is an IP literal (rejected before DNS).
pub fn is_ip_literal(host: &str) -> bool {
    host.parse::<IpAddr>().is_ok()
        || host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .map(|h| h.parse::<Ipv6Addr>().is_ok())
            .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blocked(addr: &str) -> bool {
        check_ip(addr.parse().unwrap()).is_some()
    }

    #[test]
    fn test_blocks_loopback() {
        assert!(blocked("127.0.0.1"));
        assert!(blocked("127.8.8.8"));
        assert!(blocked("::1"));
    }

    #[test]
    fn test_blocks_private_ranges() {
        assert!(blocked("10.0.0.1"));
        assert!(blocked("172.16.0.1"));
        assert!(blocked("172.31.255.255"));
        assert!(blocked("192.168.1.1"));
    }

    #[test]
    fn test_blocks_cgnat() {
        assert!(blocked("100.64.0.1"));
        assert!(blocked("100.127.255.255"));
        assert!(!blocked("100.63.0.1"));
        assert!(!blocked("100.128.0.1"));
    }

    #[test]
    fn test_blocks_metadata_endpoint() {
        assert!(blocked("169.254.169.254"));
    }

    #[test]
    fn test_blocks_ipv6_local() {
        assert!(blocked("fc00::1"));
        assert!(blocked("fd12:3456::1"));
        assert!(blocked("fe80::1"));
    }

    #[test]
    fn test_blocks_mapped_v4() {
        assert!(blocked("::ffff:127.0.0.1"));
        assert!(blocked("::ffff:10.0.0.1"));
    }

    #[test]
    fn test_allows_public() {
        assert!(!blocked("93.184.216.34"));
        assert!(!blocked("1.1.1.1"));
        assert!(!blocked("2606:4700:4700::1111"));
    }

    #[test]
    fn test_ip_literal_detection() {
        assert!(is_ip_literal("127.0.0.1"));
        assert!(is_ip_literal("::1"));
        assert!(is_ip_literal("[::1]"));
        assert!(!is_ip_literal("example.com"));
    }
}
