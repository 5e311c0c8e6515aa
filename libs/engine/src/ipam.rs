//! IP and MAC address management for logical switches with dynamic
//! addressing enabled.
//!
//! Each switch with a subnet owns an [`Ipam`] pool; a process-wide
//! [`MacSet`] tracks every MAC ever handed out under the configured 24-bit
//! prefix so reallocation across passes never collides.

use crate::addresses::Ipv4Net;
use northd_model::EthAddr;
use rand::Rng;
use rangemap::RangeInclusiveSet;
use std::collections::HashSet;
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// The 24-bit prefix under which dynamic MACs are allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MacPrefix([u8; 3]);

impl MacPrefix {
    /// Generates a random prefix: locally administered, unicast.
    pub(crate) fn random(rng: &mut impl Rng) -> Self {
        let mut bytes = [0u8; 3];
        rng.fill(&mut bytes);
        bytes[0] = (bytes[0] | 0x02) & 0xfe;

        Self(bytes)
    }

    pub(crate) fn matches(&self, mac: EthAddr) -> bool {
        mac.octets()[..3] == self.0
    }

    /// Composes a full address from this prefix and a 24-bit suffix.
    pub(crate) fn with_suffix(&self, suffix: u32) -> EthAddr {
        let [p0, p1, p2] = self.0;

        EthAddr::new([
            p0,
            p1,
            p2,
            (suffix >> 16) as u8,
            (suffix >> 8) as u8,
            suffix as u8,
        ])
    }
}

impl FromStr for MacPrefix {
    type Err = northd_model::ParseEthAddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Parsed by appending a zero suffix, so the prefix reuses the
        // canonical MAC syntax.
        let mac = format!("{s}:00:00:00").parse::<EthAddr>()?;
        let o = mac.octets();

        Ok(Self([o[0], o[1], o[2]]))
    }
}

impl fmt::Display for MacPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}:{:02x}:{:02x}", self.0[0], self.0[1], self.0[2])
    }
}

/// Every MAC observed or allocated under the dynamic prefix, process-wide.
#[derive(Debug, Default)]
pub(crate) struct MacSet {
    macs: HashSet<EthAddr>,
}

impl MacSet {
    /// Records `mac` if it belongs to `prefix`. Returns `false` when the
    /// address was already present (a duplicate worth warning about when the
    /// caller expected a fresh one).
    pub(crate) fn insert(&mut self, prefix: MacPrefix, mac: EthAddr) -> bool {
        if !prefix.matches(mac) {
            return true;
        }

        self.macs.insert(mac)
    }

    pub(crate) fn contains(&self, mac: EthAddr) -> bool {
        self.macs.contains(&mac)
    }

    /// Allocates an unused MAC under `prefix`.
    ///
    /// The probe starts at the suffix derived from `ip_hint` so that the
    /// common case yields a MAC that encodes the port's IPv4 address, and
    /// scans linearly over the whole suffix space before giving up.
    pub(crate) fn allocate(
        &mut self,
        prefix: MacPrefix,
        ip_hint: Option<Ipv4Addr>,
    ) -> Option<EthAddr> {
        const SUFFIX_MASK: u32 = 0xff_ffff;

        let base = ip_hint.map(|ip| u32::from(ip) & SUFFIX_MASK).unwrap_or(1);

        for probe in 0..=SUFFIX_MASK {
            let suffix = (base.wrapping_add(probe)) & SUFFIX_MASK;

            // All-zeros and all-ones suffixes are not valid assignments.
            if suffix == 0 || suffix == SUFFIX_MASK {
                continue;
            }

            let mac = prefix.with_suffix(suffix);

            if self.macs.insert(mac) {
                return Some(mac);
            }
        }

        None
    }
}

/// The dynamic IPv4 pool of one logical switch.
#[derive(Debug, Clone)]
pub(crate) struct Ipam {
    /// First allocatable host address, in host order.
    start: u32,
    /// Number of host addresses covered by the bitmap.
    total: u32,
    allocated: Vec<u64>,
}

impl Ipam {
    /// Builds the pool for `subnet`.
    ///
    /// The first host address is reserved up front (it conventionally
    /// belongs to the attached router); excluded addresses outside the
    /// subnet are returned for the caller to report.
    pub(crate) fn new(subnet: Ipv4Net, exclude_ips: Option<&str>) -> (Self, Vec<String>) {
        let size = 1u64 << (32 - subnet.plen);
        let total = size.saturating_sub(2).min(u64::from(u32::MAX)) as u32;
        let start = u32::from(subnet.network()).wrapping_add(1);

        let mut ipam = Self {
            start,
            total,
            allocated: vec![0; total.div_ceil(64) as usize],
        };

        // The first address is never handed out dynamically.
        ipam.set(0);

        let mut bad = Vec::new();

        if let Some(spec) = exclude_ips {
            let (ranges, malformed) = parse_exclude_ips(spec, subnet);
            bad = malformed;

            for range in ranges.iter() {
                for ip in range.clone() {
                    ipam.insert_ip(Ipv4Addr::from(ip));
                }
            }
        }

        (ipam, bad)
    }

    fn index(&self, ip: Ipv4Addr) -> Option<u32> {
        let offset = u32::from(ip).wrapping_sub(self.start);

        (offset < self.total).then_some(offset)
    }

    fn set(&mut self, index: u32) {
        self.allocated[(index / 64) as usize] |= 1 << (index % 64);
    }

    fn get(&self, index: u32) -> bool {
        self.allocated[(index / 64) as usize] & (1 << (index % 64)) != 0
    }

    /// Whether `ip` lies in the allocatable range of the subnet.
    pub(crate) fn contains(&self, ip: Ipv4Addr) -> bool {
        self.index(ip).is_some()
    }

    pub(crate) fn is_taken(&self, ip: Ipv4Addr) -> bool {
        self.index(ip).is_some_and(|ix| self.get(ix))
    }

    /// Marks `ip` as in use. Out-of-range addresses are ignored.
    pub(crate) fn insert_ip(&mut self, ip: Ipv4Addr) {
        if let Some(ix) = self.index(ip) {
            self.set(ix);
        }
    }

    /// First-free-bit scan over the pool.
    pub(crate) fn allocate(&mut self) -> Option<Ipv4Addr> {
        for ix in 0..self.total {
            if !self.get(ix) {
                self.set(ix);

                return Some(Ipv4Addr::from(self.start.wrapping_add(ix)));
            }
        }

        None
    }
}

/// Parses an `exclude_ips` specification: whitespace-separated single
/// addresses and `A..B` ranges.
///
/// Addresses outside the subnet are collected into the second return value
/// so the caller can report them.
fn parse_exclude_ips(spec: &str, subnet: Ipv4Net) -> (RangeInclusiveSet<u32>, Vec<String>) {
    let mut ranges = RangeInclusiveSet::new();
    let mut bad = Vec::new();

    for token in spec.split_whitespace() {
        let parsed = match token.split_once("..") {
            Some((lo, hi)) => lo
                .parse::<Ipv4Addr>()
                .and_then(|lo| hi.parse::<Ipv4Addr>().map(|hi| (lo, hi)))
                .ok()
                .filter(|(lo, hi)| u32::from(*lo) <= u32::from(*hi)),
            None => token.parse::<Ipv4Addr>().map(|ip| (ip, ip)).ok(),
        };

        match parsed {
            Some((lo, hi)) if subnet.contains(lo) && subnet.contains(hi) => {
                ranges.insert(u32::from(lo)..=u32::from(hi));
            }
            _ => bad.push(token.to_owned()),
        }
    }

    (ranges, bad)
}

/// Requested dynamic components of one switch port, extracted from an
/// `addresses` entry mentioning `dynamic`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct DynamicRequest {
    /// A statically configured MAC (`"<mac> dynamic"`).
    pub mac: Option<EthAddr>,
    /// A statically requested IPv4 (`"dynamic <ip>"`).
    pub ip4: Option<Ipv4Addr>,
    /// A statically requested IPv6 (`"dynamic <ip6>"`).
    pub ip6: Option<Ipv6Addr>,
}

/// Interprets one `addresses` entry. Returns `None` when the entry does not
/// request dynamic addressing at all.
pub(crate) fn parse_dynamic_request(entry: &str) -> Option<DynamicRequest> {
    let tokens = entry.split_whitespace().collect::<Vec<_>>();

    match tokens.as_slice() {
        ["dynamic"] => Some(DynamicRequest::default()),
        ["dynamic", rest @ ..] if !rest.is_empty() => {
            let mut request = DynamicRequest::default();

            for token in rest {
                if let Ok(v4) = token.parse::<Ipv4Addr>() {
                    request.ip4 = Some(v4);
                } else if let Ok(v6) = token.parse::<Ipv6Addr>() {
                    request.ip6 = Some(v6);
                } else {
                    return None;
                }
            }

            Some(request)
        }
        [mac, "dynamic"] => Some(DynamicRequest {
            mac: mac.parse().ok(),
            ..Default::default()
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn subnet() -> Ipv4Net {
        Ipv4Net {
            addr: "10.0.0.0".parse().unwrap(),
            plen: 24,
        }
    }

    #[test]
    fn first_address_is_reserved() {
        let (mut ipam, bad) = Ipam::new(subnet(), None);

        assert!(bad.is_empty());
        assert_eq!(ipam.allocate(), Some("10.0.0.2".parse().unwrap()));
    }

    #[test]
    fn exclusions_are_skipped() {
        let (mut ipam, _) = Ipam::new(subnet(), Some("10.0.0.2 10.0.0.3..10.0.0.5"));

        assert_eq!(ipam.allocate(), Some("10.0.0.6".parse().unwrap()));
    }

    #[test]
    fn out_of_subnet_exclusions_are_reported() {
        let (_, bad) = Ipam::new(subnet(), Some("10.0.1.7 10.0.0.4"));

        assert_eq!(bad, vec!["10.0.1.7".to_owned()]);
    }

    #[test]
    fn pool_exhaustion_returns_none() {
        let small = Ipv4Net {
            addr: "10.0.0.0".parse().unwrap(),
            plen: 30,
        };
        let (mut ipam, _) = Ipam::new(small, None);

        // /30 has two hosts; the first is reserved.
        assert_eq!(ipam.allocate(), Some("10.0.0.2".parse().unwrap()));
        assert_eq!(ipam.allocate(), None);
    }

    #[test]
    fn network_and_broadcast_are_outside_the_pool() {
        let (ipam, _) = Ipam::new(subnet(), None);

        assert!(!ipam.contains("10.0.0.0".parse().unwrap()));
        assert!(ipam.contains("10.0.0.1".parse().unwrap()));
        assert!(ipam.contains("10.0.0.254".parse().unwrap()));
        assert!(!ipam.contains("10.0.0.255".parse().unwrap()));
    }

    #[test]
    fn mac_allocation_prefers_the_ip_suffix() {
        let mut macs = MacSet::default();
        let prefix = "0a:00:02".parse::<MacPrefix>().unwrap();

        let mac = macs
            .allocate(prefix, Some("10.0.0.50".parse().unwrap()))
            .unwrap();

        assert_eq!(mac.to_string(), "0a:00:02:00:00:32");

        // The same hint now probes to the next free suffix.
        let next = macs
            .allocate(prefix, Some("10.0.0.50".parse().unwrap()))
            .unwrap();

        assert_eq!(next.to_string(), "0a:00:02:00:00:33");
    }

    #[test]
    fn foreign_prefixes_are_not_tracked() {
        let mut macs = MacSet::default();
        let prefix = "0a:00:02".parse::<MacPrefix>().unwrap();

        assert!(macs.insert(prefix, "02:99:99:00:00:01".parse().unwrap()));
        assert!(!macs.contains("02:99:99:00:00:01".parse().unwrap()));
    }

    #[test]
    fn dynamic_request_forms() {
        assert_eq!(
            parse_dynamic_request("dynamic"),
            Some(DynamicRequest::default())
        );
        assert_eq!(
            parse_dynamic_request("dynamic 10.0.0.9"),
            Some(DynamicRequest {
                ip4: Some("10.0.0.9".parse().unwrap()),
                ..Default::default()
            })
        );
        assert_eq!(
            parse_dynamic_request("02:00:00:00:00:01 dynamic"),
            Some(DynamicRequest {
                mac: Some("02:00:00:00:00:01".parse().unwrap()),
                ..Default::default()
            })
        );
        assert_eq!(parse_dynamic_request("02:00:00:00:00:01 10.0.0.4"), None);
    }

    proptest! {
        #[test]
        fn allocations_stay_in_subnet_and_never_repeat(n in 1usize..300) {
            let (mut ipam, _) = Ipam::new(subnet(), Some("10.0.0.4"));
            let mut seen = std::collections::HashSet::new();

            for _ in 0..n {
                match ipam.allocate() {
                    Some(ip) => {
                        prop_assert!(ipam.contains(ip));
                        prop_assert!(ip != "10.0.0.1".parse::<Ipv4Addr>().unwrap());
                        prop_assert!(ip != "10.0.0.4".parse::<Ipv4Addr>().unwrap());
                        prop_assert!(seen.insert(ip));
                    }
                    None => break,
                }
            }
        }
    }
}
