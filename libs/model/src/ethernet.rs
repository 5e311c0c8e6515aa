use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// A 48-bit Ethernet address.
///
/// Formats and parses as the canonical colon-separated lowercase hex form.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct EthAddr([u8; 6]);

impl EthAddr {
    pub const ZERO: EthAddr = EthAddr([0; 6]);

    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    pub const fn octets(&self) -> [u8; 6] {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0; 6]
    }

    /// Multicast (and broadcast) addresses have the group bit set.
    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 != 0
    }

    pub fn is_broadcast(&self) -> bool {
        self.0 == [0xff; 6]
    }

    /// The low 24 bits, i.e. the NIC-specific part under a 24-bit prefix.
    pub fn suffix(&self) -> u32 {
        u32::from(self.0[3]) << 16 | u32::from(self.0[4]) << 8 | u32::from(self.0[5])
    }

    /// The modified EUI-64 interface identifier derived from this address.
    ///
    /// The universal/local bit is inverted and `ff:fe` is inserted in the
    /// middle, per RFC 4291 appendix A.
    pub fn interface_id(&self) -> u64 {
        let o = self.0;

        u64::from(o[0] ^ 0x02) << 56
            | u64::from(o[1]) << 48
            | u64::from(o[2]) << 40
            | 0xff << 32
            | 0xfe << 24
            | u64::from(o[3]) << 16
            | u64::from(o[4]) << 8
            | u64::from(o[5])
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid ethernet address")]
pub struct ParseEthAddrError;

impl FromStr for EthAddr {
    type Err = ParseEthAddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut octets = [0u8; 6];
        let mut parts = s.split(':');

        for octet in &mut octets {
            let part = parts.next().ok_or(ParseEthAddrError)?;

            if part.len() != 2 {
                return Err(ParseEthAddrError);
            }

            *octet = u8::from_str_radix(part, 16).map_err(|_| ParseEthAddrError)?;
        }

        if parts.next().is_some() {
            return Err(ParseEthAddrError);
        }

        Ok(Self(octets))
    }
}

impl fmt::Display for EthAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = self.0;

        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

impl fmt::Debug for EthAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl Serialize for EthAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for EthAddr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;

        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_formats_canonically() {
        let addr = "AA:bb:00:01:02:FF".parse::<EthAddr>().unwrap();

        assert_eq!(addr.to_string(), "aa:bb:00:01:02:ff");
    }

    #[test]
    fn rejects_malformed() {
        assert!("aa:bb:cc:dd:ee".parse::<EthAddr>().is_err());
        assert!("aa:bb:cc:dd:ee:ff:00".parse::<EthAddr>().is_err());
        assert!("aa:bb:cc:dd:ee:fg".parse::<EthAddr>().is_err());
        assert!("aabb.ccdd.eeff".parse::<EthAddr>().is_err());
    }

    #[test]
    fn broadcast_is_multicast() {
        let bcast = "ff:ff:ff:ff:ff:ff".parse::<EthAddr>().unwrap();

        assert!(bcast.is_broadcast());
        assert!(bcast.is_multicast());
    }

    #[test]
    fn eui64_flips_local_bit_and_inserts_fffe() {
        let addr = "02:00:00:00:00:10".parse::<EthAddr>().unwrap();

        assert_eq!(addr.interface_id(), 0x0000_00ff_fe00_0010);
    }
}
