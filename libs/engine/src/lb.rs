//! Shared load-balancer VIP handling for the pipeline generators.

use northd_model::nb::{LbProtocol, LoadBalancer};
use northd_model::LbId;
use std::net::IpAddr;

/// One VIP of one load balancer, with its raw backend list.
#[derive(Debug, Clone)]
pub(crate) struct Vip {
    pub lb: LbId,
    pub ip: IpAddr,
    pub port: Option<u16>,
    /// The comma-separated `ip:port` backend list, emitted verbatim.
    pub backends: String,
    pub protocol: LbProtocol,
}

impl Vip {
    pub(crate) fn is_v6(&self) -> bool {
        self.ip.is_ipv6()
    }

    pub(crate) fn protocol_name(&self) -> &'static str {
        match self.protocol {
            LbProtocol::Tcp => "tcp",
            LbProtocol::Udp => "udp",
        }
    }

    /// The VIP as it was keyed northbound.
    pub(crate) fn key(&self) -> String {
        match (self.ip, self.port) {
            (IpAddr::V6(ip), Some(port)) => format!("[{ip}]:{port}"),
            (ip, Some(port)) => format!("{ip}:{port}"),
            (IpAddr::V6(ip), None) => ip.to_string(),
            (ip, None) => ip.to_string(),
        }
    }
}

/// Parses a VIP key: `ip`, `ip:port` or `[ip6]:port`.
pub(crate) fn parse_vip_key(key: &str) -> Option<(IpAddr, Option<u16>)> {
    if let Some(rest) = key.strip_prefix('[') {
        let (ip, port) = rest.split_once("]:")?;

        return Some((
            IpAddr::V6(ip.parse().ok()?),
            Some(port.parse().ok()?),
        ));
    }

    if let Ok(ip) = key.parse::<IpAddr>() {
        return Some((ip, None));
    }

    let (ip, port) = key.rsplit_once(':')?;

    Some((
        IpAddr::V4(ip.parse().ok()?),
        Some(port.parse().ok()?),
    ))
}

/// Expands the VIP map of every referenced load balancer, skipping (and
/// reporting) unparsable keys via the returned list.
pub(crate) fn collect_vips<'a>(
    lbs: impl Iterator<Item = &'a LoadBalancer>,
) -> (Vec<Vip>, Vec<String>) {
    let mut vips = Vec::new();
    let mut bad = Vec::new();

    for lb in lbs {
        for (key, backends) in &lb.vips {
            match parse_vip_key(key) {
                Some((ip, port)) => vips.push(Vip {
                    lb: lb.id,
                    ip,
                    port,
                    backends: backends.clone(),
                    protocol: lb.protocol.unwrap_or(LbProtocol::Tcp),
                }),
                None => bad.push(key.clone()),
            }
        }
    }

    (vips, bad)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("10.0.0.100" => Some(("10.0.0.100".parse().unwrap(), None)); "bare v4")]
    #[test_case("10.0.0.100:80" => Some(("10.0.0.100".parse().unwrap(), Some(80))); "v4 with port")]
    #[test_case("fd00::1" => Some(("fd00::1".parse().unwrap(), None)); "bare v6")]
    #[test_case("[fd00::1]:443" => Some(("fd00::1".parse().unwrap(), Some(443))); "v6 with port")]
    #[test_case("10.0.0.100:" => None; "missing port")]
    #[test_case("[fd00::1]" => None; "unclosed bracket form")]
    #[test_case("pancakes" => None; "garbage")]
    fn vip_keys(key: &str) -> Option<(IpAddr, Option<u16>)> {
        parse_vip_key(key)
    }
}
