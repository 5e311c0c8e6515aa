//! Mirroring of northbound collections into the southbound database:
//! address sets, port groups, meters, DNS, the DHCP option catalogs and
//! per-switch IP multicast configuration.

use crate::datapath::{Datapaths, DpKind};
use crate::port::Ports;
use northd_model::nb::Northbound;
use northd_model::sb::{DhcpOptRow, DnsRow, IpMulticastRow, SbAddressSet, SbMeter, SbPortGroup};
use northd_model::LspId;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Address sets: user-defined sets plus two synthetic per-port-group sets
/// holding the IPv4 and IPv6 addresses of the member ports. A user set with
/// the same name overrides the synthetic one.
pub(crate) fn address_sets(nb: &Northbound, ports: &Ports) -> Vec<SbAddressSet> {
    let mut sets: BTreeMap<String, Vec<String>> = BTreeMap::new();

    let port_by_lsp: HashMap<LspId, usize> = ports
        .items
        .iter()
        .enumerate()
        .filter_map(|(ix, p)| p.lsp(nb).map(|lsp| (lsp.id, ix)))
        .collect();

    for pg in &nb.port_groups {
        let mut v4 = BTreeSet::new();
        let mut v6 = BTreeSet::new();

        for lsp in &pg.ports {
            let Some(&port_ix) = port_by_lsp.get(lsp) else {
                continue;
            };

            for addrs in &ports.items[port_ix].addresses {
                v4.extend(addrs.ipv4.iter().map(|n| n.addr.to_string()));
                v6.extend(addrs.ipv6.iter().map(|n| n.addr.to_string()));
            }
        }

        sets.insert(format!("{}_ip4", pg.name), v4.into_iter().collect());
        sets.insert(format!("{}_ip6", pg.name), v6.into_iter().collect());
    }

    for set in &nb.address_sets {
        sets.insert(set.name.clone(), set.addresses.clone());
    }

    sets.into_iter()
        .map(|(name, addresses)| SbAddressSet { name, addresses })
        .collect()
}

/// Port groups mirror by name with the current member-port names.
pub(crate) fn port_groups(nb: &Northbound, ports: &Ports) -> Vec<SbPortGroup> {
    let name_by_lsp: HashMap<LspId, &str> = ports
        .items
        .iter()
        .filter_map(|p| p.lsp(nb).map(|lsp| (lsp.id, p.name.as_str())))
        .collect();

    nb.port_groups
        .iter()
        .map(|pg| SbPortGroup {
            name: pg.name.clone(),
            ports: pg
                .ports
                .iter()
                .filter_map(|lsp| name_by_lsp.get(lsp).map(|n| (*n).to_owned()))
                .collect(),
        })
        .collect()
}

/// Meters mirror wholesale; band order is canonicalized so equality means
/// equal sorted `(rate, burst, action)` tuples.
pub(crate) fn meters(nb: &Northbound) -> Vec<SbMeter> {
    nb.meters
        .iter()
        .map(|meter| {
            let mut bands = meter.bands.clone();
            bands.sort();

            SbMeter {
                name: meter.name.clone(),
                unit: meter.unit.clone(),
                bands,
            }
        })
        .collect()
}

/// DNS records aggregate per record row; each row lists the datapaths of
/// every switch referencing it. Rows with no records or no referents are
/// not mirrored.
pub(crate) fn dns(nb: &Northbound, datapaths: &Datapaths) -> Vec<DnsRow> {
    let mut rows = Vec::new();

    for dns in &nb.dns {
        if dns.records.is_empty() {
            continue;
        }

        let mut referents = Vec::new();

        for ls in &nb.switches {
            if !ls.dns_records.contains(&dns.id) {
                continue;
            }

            if let Some(dp) = datapaths.get(northd_model::sb::DpKey::Switch(ls.id)) {
                referents.push(dp.key.uuid());
            }
        }

        if referents.is_empty() {
            continue;
        }

        referents.sort();

        let mut external_ids = BTreeMap::new();
        external_ids.insert("dns_id".to_owned(), dns.id.to_string());

        rows.push(DnsRow {
            datapaths: referents,
            records: dns.records.clone(),
            external_ids,
        });
    }

    rows
}

/// The DHCPv4 options this engine knows how to offer.
const DHCPV4_OPTIONS: &[(&str, u8, &str)] = &[
    ("netmask", 1, "ipv4"),
    ("router", 3, "ipv4"),
    ("dns_server", 6, "ipv4"),
    ("log_server", 7, "ipv4"),
    ("lpr_server", 9, "ipv4"),
    ("domain_name", 15, "str"),
    ("swap_server", 16, "ipv4"),
    ("ip_forward_enable", 19, "bool"),
    ("policy_filter", 21, "ipv4"),
    ("default_ttl", 23, "uint8"),
    ("mtu", 26, "uint16"),
    ("router_discovery", 31, "bool"),
    ("router_solicitation", 32, "ipv4"),
    ("ethernet_encap", 36, "bool"),
    ("tcp_ttl", 37, "uint8"),
    ("nis_server", 41, "ipv4"),
    ("ntp_server", 42, "ipv4"),
    ("server_id", 54, "ipv4"),
    ("tftp_server", 66, "ipv4"),
    ("bootfile_name", 67, "str"),
    ("classless_static_route", 121, "static_routes"),
    ("tftp_server_address", 150, "ipv4"),
    ("path_prefix", 210, "str"),
    ("ms_classless_static_route", 249, "static_routes"),
    ("wpad", 252, "str"),
    ("lease_time", 51, "uint32"),
    ("T1", 58, "uint32"),
    ("T2", 59, "uint32"),
];

/// The DHCPv6 options this engine knows how to offer.
const DHCPV6_OPTIONS: &[(&str, u8, &str)] = &[
    ("server_id", 2, "mac"),
    ("ia_addr", 5, "ipv6"),
    ("dns_server", 23, "ipv6"),
    ("domain_search", 24, "str"),
];

fn catalog(rows: &[(&str, u8, &str)]) -> Vec<DhcpOptRow> {
    rows.iter()
        .map(|&(name, code, opt_type)| DhcpOptRow {
            name: name.to_owned(),
            code,
            opt_type: opt_type.to_owned(),
        })
        .collect()
}

pub(crate) fn dhcp_option_catalog() -> Vec<DhcpOptRow> {
    catalog(DHCPV4_OPTIONS)
}

pub(crate) fn dhcpv6_option_catalog() -> Vec<DhcpOptRow> {
    catalog(DHCPV6_OPTIONS)
}

/// One IP-multicast configuration row per switch datapath.
pub(crate) fn ip_multicast(datapaths: &Datapaths) -> Vec<IpMulticastRow> {
    datapaths
        .iter()
        .filter(|dp| dp.kind == DpKind::Switch)
        .filter_map(|dp| {
            let mcast = dp.mcast_sw.as_ref()?;

            Some(IpMulticastRow {
                datapath: dp.key.uuid(),
                enabled: mcast.enabled,
                querier: mcast.querier,
                table_size: mcast.table_size,
                idle_timeout: mcast.idle_timeout,
                query_interval: mcast.query_interval,
                query_max_resp: mcast.query_max_resp,
                eth_src: mcast.eth_src.clone(),
                ip4_src: mcast.ipv4_src.clone(),
            })
        })
        .collect()
}

/// Router-type switch ports publish the NAT and load-balancer addresses of
/// their peer router so the hypervisors can answer for them externally.
pub(crate) fn fill_nat_addresses(
    nb: &Northbound,
    datapaths: &Datapaths,
    ports: &mut Ports,
    lbs: &HashMap<northd_model::LbId, &northd_model::nb::LoadBalancer>,
) {
    for ix in 0..ports.items.len() {
        let Some(peer_ix) = ports.items[ix].peer else {
            continue;
        };

        if ports.items[ix].lsp(nb).is_none() {
            continue;
        }

        let router_dp_ix = ports.items[peer_ix].dp;
        let router_dp = &datapaths.items[router_dp_ix];

        if router_dp.kind != DpKind::Router {
            continue;
        }

        let lr = &nb.routers[router_dp.nb_index];
        let Some(networks) = ports.items[peer_ix].networks() else {
            continue;
        };
        let mac = networks.ea;

        let mut addresses = BTreeSet::new();

        for nat in &lr.nat {
            match nat.nat_type {
                northd_model::nb::NatType::Snat | northd_model::nb::NatType::DnatAndSnat => {
                    if nat.external_ip.parse::<std::net::Ipv4Addr>().is_ok() {
                        addresses.insert(nat.external_ip.clone());
                    }
                }
                northd_model::nb::NatType::Dnat => {}
            }
        }

        // Gateway routers also announce their load-balancer VIPs.
        if lr.options.contains_key("chassis") {
            let (vips, _) = crate::lb::collect_vips(
                lr.load_balancer.iter().filter_map(|id| lbs.get(id).copied()),
            );

            for vip in vips {
                if let std::net::IpAddr::V4(v4) = vip.ip {
                    addresses.insert(v4.to_string());
                }
            }
        }

        if addresses.is_empty() {
            continue;
        }

        let mut entry = mac.to_string();
        for address in addresses {
            entry.push(' ');
            entry.push_str(&address);
        }

        if let Some(redirect_ix) = router_dp.l3redirect_port {
            if router_dp.l3dgw_port == Some(peer_ix) {
                entry.push_str(&format!(
                    " is_chassis_resident({})",
                    ports.items[redirect_ix].json_name
                ));
            }
        }

        ports.items[ix].nat_addresses = vec![entry];
    }
}
