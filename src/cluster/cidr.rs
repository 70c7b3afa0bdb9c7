//! CIDR parsing and overlap checks.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    addr: IpAddr,
    prefix: u8,
}

impl Cidr {
    fn bits(self) -> (u128, u8) {
        match self.addr {
            IpAddr::V4(v4) => (u128::from(u32::from(v4)), 32),
            IpAddr::V6(v6) => (u128::from(v6), 128),
        }
    }

    fn network(self) -> u128 {
        let (value, width) = self.bits();
        value & mask(width, self.prefix)
    }

    /// True when the two ranges share at least one address.
    pub fn overlaps(&self, other: &Self) -> bool {
        if self.addr.is_ipv4() != other.addr.is_ipv4() {
            return false;
        }
        let (_, width) = self.bits();
        let prefix = self.prefix.min(other.prefix);
        let m = mask(width, prefix);
        self.network() & m == other.network() & m
    }
}

/// Netmask with the top `prefix` bits of a `width`-bit address set.
fn mask(width: u8, prefix: u8) -> u128 {
    if prefix == 0 {
        return 0;
    }
    let all = if width == 128 {
        u128::MAX
    } else {
        (1u128 << width) - 1
    };
    all & !((1u128 << (width - prefix)) - 1)
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid CIDR `{0}`")]
pub struct CidrParseError(String);

impl FromStr for Cidr {
    type Err = CidrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || CidrParseError(s.to_string());
        let (addr, prefix) = s.trim().split_once('/').ok_or_else(err)?;
        let addr: IpAddr = addr.parse().map_err(|_| err())?;
        let prefix: u8 = prefix.parse().map_err(|_| err())?;
        let max = if addr.is_ipv4() { 32 } else { 128 };
        if prefix > max {
            return Err(err());
        }
        Ok(Self { addr, prefix })
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cidr(s: &str) -> Cidr {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse() {
        assert_eq!(cidr("10.128.0.0/14").to_string(), "10.128.0.0/14");
        assert!("10.0.0.0".parse::<Cidr>().is_err());
        assert!("10.0.0.0/33".parse::<Cidr>().is_err());
        assert!("fd00::/129".parse::<Cidr>().is_err());
        assert!("bogus/8".parse::<Cidr>().is_err());
    }

    #[test]
    fn test_overlap_v4() {
        assert!(cidr("10.128.0.0/14").overlaps(&cidr("10.130.0.0/16")));
        assert!(cidr("10.130.0.0/16").overlaps(&cidr("10.128.0.0/14")));
        assert!(!cidr("100.64.0.0/16").overlaps(&cidr("10.128.0.0/14")));
        assert!(!cidr("100.64.0.0/16").overlaps(&cidr("100.65.0.0/16")));
        assert!(cidr("0.0.0.0/0").overlaps(&cidr("172.30.0.0/16")));
    }

    #[test]
    fn test_overlap_host_bits_ignored() {
        assert!(cidr("100.64.12.7/16").overlaps(&cidr("100.64.200.0/24")));
    }

    #[test]
    fn test_overlap_v6_and_mixed() {
        assert!(cidr("fd01::/48").overlaps(&cidr("fd01:0:0:1::/64")));
        assert!(!cidr("fd01::/48").overlaps(&cidr("fd02::/48")));
        assert!(!cidr("fd01::/48").overlaps(&cidr("10.0.0.0/8")));
    }
}
