//! Pre-compiled IPv4/IPv6 CIDR membership test.

use std::net::{Ipv4Addr, Ipv6Addr};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IpMatcherError {
    #[error("invalid IP address or CIDR block '{0}'")]
    InvalidEntry(String),
}

#[derive(Debug, Clone, Copy)]
struct Range {
    start: u128,
    end: u128,
}

impl Range {
    fn contains(&self, value: u128) -> bool {
        value >= self.start && value < self.end
    }
}

/// A compiled set of IPv4 and IPv6 ranges. Membership is a linear scan; the
/// lists involved are small (typically a single `/8`), so no tree is needed.
#[derive(Debug, Clone, Default)]
pub struct IpMatcher {
    v4: Vec<Range>,
    v6: Vec<Range>,
}

impl IpMatcher {
    pub fn new<I, S>(entries: I) -> Result<Self, IpMatcherError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut v4 = Vec::new();
        let mut v6 = Vec::new();
        for entry in entries {
            let entry = entry.as_ref();
            let (addr_part, prefix_part) = match entry.split_once('/') {
                Some((a, p)) => (a, Some(p)),
                None => (entry, None),
            };

            if addr_part.contains(':') {
                let addr: Ipv6Addr = addr_part
                    .parse()
                    .map_err(|_| IpMatcherError::InvalidEntry(entry.to_string()))?;
                let prefix = match prefix_part {
                    Some(p) => p
                        .parse::<u32>()
                        .map_err(|_| IpMatcherError::InvalidEntry(entry.to_string()))?,
                    None => 128,
                };
                if prefix > 128 {
                    return Err(IpMatcherError::InvalidEntry(entry.to_string()));
                }
                let base = u128::from(addr);
                let width = 128 - prefix;
                let start = if width == 128 { 0 } else { base & !((1u128 << width) - 1) };
                let end = start + (1u128 << width);
                v6.push(Range { start, end });
            } else {
                let addr: Ipv4Addr = addr_part
                    .parse()
                    .map_err(|_| IpMatcherError::InvalidEntry(entry.to_string()))?;
                let prefix = match prefix_part {
                    Some(p) => p
                        .parse::<u32>()
                        .map_err(|_| IpMatcherError::InvalidEntry(entry.to_string()))?,
                    None => 32,
                };
                if prefix > 32 {
                    return Err(IpMatcherError::InvalidEntry(entry.to_string()));
                }
                let base = u32::from(addr) as u128;
                let width = 32 - prefix;
                let start = if width == 32 { 0 } else { base & !((1u128 << width) - 1) };
                let end = start + (1u128 << width);
                v4.push(Range { start, end });
            }
        }
        Ok(Self { v4, v6 })
    }

    /// Auto-detects family by presence of `:`.
    pub fn matches(&self, ip: &str) -> bool {
        if ip.contains(':') {
            match ip.parse::<Ipv6Addr>() {
                Ok(addr) => self.matches_v6(addr.octets()),
                Err(_) => false,
            }
        } else {
            match ip.parse::<Ipv4Addr>() {
                Ok(addr) => self.matches_v4(addr.octets()),
                Err(_) => false,
            }
        }
    }

    pub fn matches_v4(&self, bytes: [u8; 4]) -> bool {
        let value = u32::from_be_bytes(bytes) as u128;
        self.v4.iter().any(|r| r.contains(value))
    }

    pub fn matches_v6(&self, bytes: [u8; 16]) -> bool {
        let value = u128::from_be_bytes(bytes);
        self.v6.iter().any(|r| r.contains(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_address_is_a_singleton_range() {
        let m = IpMatcher::new(["10.0.0.5"]).unwrap();
        assert!(m.matches("10.0.0.5"));
        assert!(!m.matches("10.0.0.6"));
    }

    #[test]
    fn cidr_block_covers_every_address() {
        let m = IpMatcher::new(["192.168.1.0/30"]).unwrap();
        for last in 0..4u8 {
            assert!(m.matches(&format!("192.168.1.{}", last)));
        }
        assert!(!m.matches("192.168.1.4"));
        assert!(!m.matches("192.168.0.255"));
    }

    #[test]
    fn loopback_slash_8() {
        let m = IpMatcher::new(["127.0.0.0/8"]).unwrap();
        assert!(m.matches("127.0.0.1"));
        assert!(m.matches("127.255.255.255"));
        assert!(!m.matches("128.0.0.0"));
    }

    #[test]
    fn ipv6_cidr() {
        let m = IpMatcher::new(["fe80::/10"]).unwrap();
        assert!(m.matches("fe80::1"));
        assert!(!m.matches("2001:db8::1"));
    }

    #[test]
    fn invalid_entry_is_an_error() {
        assert!(IpMatcher::new(["not-an-ip"]).is_err());
        assert!(IpMatcher::new(["10.0.0.0/33"]).is_err());
    }
}
