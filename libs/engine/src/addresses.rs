//! Parsing of the textual address forms used by the northbound schema.
//!
//! Switch ports carry `"<mac> [<ip>[/plen]]..."` strings (plus the `unknown`,
//! `router` and `dynamic` keywords, which the port reconciler interprets);
//! router ports carry a MAC column and a list of `<ip>/<plen>` networks.

use northd_model::EthAddr;
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub(crate) enum AddressError {
    #[error("invalid ethernet address `{0}`")]
    BadMac(String),
    #[error("invalid IP address `{0}`")]
    BadIp(String),
    #[error("invalid prefix length `{0}`")]
    BadPrefix(String),
    #[error("no ethernet address")]
    NoMac,
}

/// An IPv4 address with its prefix length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Ipv4Net {
    pub addr: Ipv4Addr,
    pub plen: u8,
}

impl Ipv4Net {
    pub(crate) fn host(addr: Ipv4Addr) -> Self {
        Self { addr, plen: 32 }
    }

    pub(crate) fn mask(&self) -> u32 {
        match self.plen {
            0 => 0,
            plen => u32::MAX << (32 - plen),
        }
    }

    pub(crate) fn network(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.addr) & self.mask())
    }

    pub(crate) fn bcast(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.addr) | !self.mask())
    }

    pub(crate) fn contains(&self, other: Ipv4Addr) -> bool {
        u32::from(other) & self.mask() == u32::from(self.network())
    }
}

impl fmt::Display for Ipv4Net {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.plen)
    }
}

/// An IPv6 address with its prefix length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Ipv6Net {
    pub addr: Ipv6Addr,
    pub plen: u8,
}

impl Ipv6Net {
    pub(crate) fn host(addr: Ipv6Addr) -> Self {
        Self { addr, plen: 128 }
    }

    pub(crate) fn mask(&self) -> u128 {
        match self.plen {
            0 => 0,
            plen => u128::MAX << (128 - plen),
        }
    }

    pub(crate) fn network(&self) -> Ipv6Addr {
        Ipv6Addr::from(u128::from(self.addr) & self.mask())
    }

    pub(crate) fn contains(&self, other: Ipv6Addr) -> bool {
        u128::from(other) & self.mask() == u128::from(self.network())
    }

    /// The solicited-node multicast address for this address.
    pub(crate) fn solicited_node(&self) -> Ipv6Addr {
        solicited_node(self.addr)
    }

    pub(crate) fn is_link_local(&self) -> bool {
        // fe80::/10
        u128::from(self.addr) >> 118 == 0x3fa
    }
}

impl fmt::Display for Ipv6Net {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.plen)
    }
}

pub(crate) fn solicited_node(addr: Ipv6Addr) -> Ipv6Addr {
    let low24 = u128::from(addr) & 0xff_ffff;

    Ipv6Addr::from(0xff02_0000_0000_0000_0000_0001_ff00_0000u128 | low24)
}

/// The multicast MAC corresponding to a solicited-node address.
pub(crate) fn solicited_node_mac(addr: Ipv6Addr) -> EthAddr {
    let o = addr.octets();

    EthAddr::new([0x33, 0x33, 0xff, o[13], o[14], o[15]])
}

/// The link-local address a router port derives from its MAC.
pub(crate) fn link_local_from_mac(mac: EthAddr) -> Ipv6Addr {
    Ipv6Addr::from(0xfe80_0000_0000_0000u128 << 64 | u128::from(mac.interface_id()))
}

/// An address built from a /64 prefix and the EUI-64 interface id of a MAC.
pub(crate) fn ipv6_from_eui64(prefix: Ipv6Addr, mac: EthAddr) -> Ipv6Addr {
    let net = u128::from(prefix) & (u128::MAX << 64);

    Ipv6Addr::from(net | u128::from(mac.interface_id()))
}

/// The resolved L2/L3 addresses of one logical port.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub(crate) struct LportAddresses {
    pub ea: EthAddr,
    pub ipv4: Vec<Ipv4Net>,
    pub ipv6: Vec<Ipv6Net>,
}

impl LportAddresses {
    pub(crate) fn has_ip(&self) -> bool {
        !self.ipv4.is_empty() || !self.ipv6.is_empty()
    }
}

/// Parses a switch-port address entry: a MAC followed by any number of
/// addresses, each with an optional prefix length.
pub(crate) fn parse_lsp_addresses(s: &str) -> Result<LportAddresses, AddressError> {
    parse_addresses(s.split_whitespace(), false)
}

/// Parses a router port's MAC plus `ip/plen` networks. The prefix length is
/// mandatory here; a bare address is rejected.
pub(crate) fn parse_lrp_networks(
    mac: &str,
    networks: &[String],
) -> Result<LportAddresses, AddressError> {
    parse_addresses(
        std::iter::once(mac).chain(networks.iter().map(String::as_str)),
        true,
    )
}

fn parse_addresses<'a>(
    mut tokens: impl Iterator<Item = &'a str>,
    require_plen: bool,
) -> Result<LportAddresses, AddressError> {
    let mac = tokens.next().ok_or(AddressError::NoMac)?;
    let ea = mac
        .parse::<EthAddr>()
        .map_err(|_| AddressError::BadMac(mac.to_owned()))?;

    let mut addresses = LportAddresses {
        ea,
        ..Default::default()
    };

    for token in tokens {
        let (addr, plen) = match token.split_once('/') {
            Some((addr, plen)) => (
                addr,
                Some(
                    plen.parse::<u8>()
                        .map_err(|_| AddressError::BadPrefix(token.to_owned()))?,
                ),
            ),
            None if require_plen => return Err(AddressError::BadPrefix(token.to_owned())),
            None => (token, None),
        };

        if let Ok(v4) = addr.parse::<Ipv4Addr>() {
            let plen = plen.unwrap_or(32);

            if plen > 32 {
                return Err(AddressError::BadPrefix(token.to_owned()));
            }

            addresses.ipv4.push(Ipv4Net { addr: v4, plen });
        } else if let Ok(v6) = addr.parse::<Ipv6Addr>() {
            let plen = plen.unwrap_or(128);

            if plen > 128 {
                return Err(AddressError::BadPrefix(token.to_owned()));
            }

            addresses.ipv6.push(Ipv6Net { addr: v6, plen });
        } else {
            return Err(AddressError::BadIp(token.to_owned()));
        }
    }

    Ok(addresses)
}

/// Renders `name` as a JSON string literal, quotes included.
///
/// Port names flow into match expressions verbatim; the escaped form is the
/// only one the emitters are allowed to interpolate.
pub(crate) fn json_string(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 2);

    out.push('"');

    for c in name.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            c if (c as u32) < 0x20 => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }

    out.push('"');

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn parses_mac_only() {
        let a = parse_lsp_addresses("02:00:00:00:00:10").unwrap();

        assert_eq!(a.ea.to_string(), "02:00:00:00:00:10");
        assert!(!a.has_ip());
    }

    #[test]
    fn parses_mixed_families() {
        let a = parse_lsp_addresses("02:00:00:00:00:10 10.0.0.50 fd00::5").unwrap();

        assert_eq!(a.ipv4, vec![Ipv4Net::host("10.0.0.50".parse().unwrap())]);
        assert_eq!(a.ipv6, vec![Ipv6Net::host("fd00::5".parse().unwrap())]);
    }

    #[test]
    fn lrp_networks_require_plen() {
        assert_eq!(
            parse_lrp_networks("40:00:00:00:00:01", &["10.0.0.1".to_owned()]),
            Err(AddressError::BadPrefix("10.0.0.1".to_owned()))
        );

        let a = parse_lrp_networks("40:00:00:00:00:01", &["10.0.0.1/24".to_owned()]).unwrap();

        assert_eq!(a.ipv4[0].network(), "10.0.0.0".parse::<Ipv4Addr>().unwrap());
        assert_eq!(a.ipv4[0].bcast(), "10.0.0.255".parse::<Ipv4Addr>().unwrap());
    }

    #[test_case("not-a-mac 10.0.0.1" => matches Err(AddressError::BadMac(_)); "bad mac")]
    #[test_case("02:00:00:00:00:01 999.0.0.1" => matches Err(AddressError::BadIp(_)); "bad ip")]
    #[test_case("02:00:00:00:00:01 10.0.0.1/33" => matches Err(AddressError::BadPrefix(_)); "bad plen")]
    #[test_case("" => matches Err(AddressError::NoMac); "empty")]
    fn rejects_malformed(s: &str) -> Result<LportAddresses, AddressError> {
        parse_lsp_addresses(s)
    }

    #[test]
    fn solicited_node_address() {
        let sn = solicited_node("fd00::2:af".parse().unwrap());

        assert_eq!(sn, "ff02::1:ff02:af".parse::<Ipv6Addr>().unwrap());
    }

    #[test]
    fn link_local_derivation() {
        let lla = link_local_from_mac("40:00:00:00:00:01".parse().unwrap());

        assert_eq!(lla, "fe80::4200:ff:fe00:1".parse::<Ipv6Addr>().unwrap());
    }

    #[test]
    fn json_escaping() {
        assert_eq!(json_string("p1"), r#""p1""#);
        assert_eq!(json_string(r#"a"b\c"#), r#""a\"b\\c""#);
    }
}
