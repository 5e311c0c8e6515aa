//! Multicast state: switch snooping configuration, IGMP aggregation, router
//! relay and the reserved southbound multicast groups.

use crate::alloc::{KeySpace, MAX_IP_MULTICAST_KEY, MIN_IP_MULTICAST_KEY, MIN_MULTICAST_KEY};
use crate::datapath::{Datapaths, DpKind};
use crate::port::{Ports, PortSource};
use crate::ratelimit::warn_rl;
use crate::Warnings;
use northd_model::nb::{LogicalSwitchPort, Northbound};
use northd_model::sb::{IgmpGroupRow, MulticastGroupRow, Southbound};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::Instant;

pub(crate) const MC_FLOOD: &str = "_MC_flood";
pub(crate) const MC_UNKNOWN: &str = "_MC_unknown";
pub(crate) const MC_MROUTER_FLOOD: &str = "_MC_mrouter_flood";
pub(crate) const MC_MROUTER_STATIC: &str = "_MC_mrouter_static";
pub(crate) const MC_STATIC: &str = "_MC_static";

const MC_FLOOD_KEY: u32 = MIN_MULTICAST_KEY;
const MC_UNKNOWN_KEY: u32 = MIN_MULTICAST_KEY + 1;
const MC_MROUTER_FLOOD_KEY: u32 = MIN_MULTICAST_KEY + 2;
const MC_MROUTER_STATIC_KEY: u32 = MIN_MULTICAST_KEY + 3;
const MC_STATIC_KEY: u32 = MIN_MULTICAST_KEY + 4;

const DEFAULT_TABLE_SIZE: i64 = 2048;
const MIN_IDLE_TIMEOUT: i64 = 15;
const MAX_IDLE_TIMEOUT: i64 = 3600;
const DEFAULT_IDLE_TIMEOUT: i64 = 300;
const MIN_QUERY_INTERVAL: i64 = 1;
const MAX_QUERY_INTERVAL: i64 = 3600;
const DEFAULT_QUERY_MAX_RESPONSE: i64 = 1;

/// Clamped multicast-snooping configuration of one switch.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct McastSwitch {
    pub enabled: bool,
    pub querier: bool,
    pub flood_unregistered: bool,
    pub table_size: i64,
    pub idle_timeout: i64,
    pub query_interval: i64,
    pub query_max_resp: i64,
    pub eth_src: String,
    pub ipv4_src: String,
}

impl McastSwitch {
    pub(crate) fn from_config(config: &BTreeMap<String, String>) -> Self {
        let flag = |key: &str| config.get(key).is_some_and(|v| v == "true");
        let int = |key: &str| config.get(key).and_then(|v| v.parse::<i64>().ok());

        let idle_timeout = int("mcast_idle_timeout")
            .unwrap_or(DEFAULT_IDLE_TIMEOUT)
            .clamp(MIN_IDLE_TIMEOUT, MAX_IDLE_TIMEOUT);
        let query_interval = int("mcast_query_interval")
            .unwrap_or(idle_timeout / 2)
            .clamp(MIN_QUERY_INTERVAL, MAX_QUERY_INTERVAL);

        Self {
            enabled: flag("mcast_snoop"),
            querier: config.get("mcast_querier").is_none_or(|v| v != "false"),
            flood_unregistered: flag("mcast_flood_unregistered"),
            table_size: int("mcast_table_size").unwrap_or(DEFAULT_TABLE_SIZE),
            idle_timeout,
            query_interval,
            query_max_resp: int("mcast_query_max_response")
                .unwrap_or(DEFAULT_QUERY_MAX_RESPONSE),
            eth_src: config.get("mcast_eth_src").cloned().unwrap_or_default(),
            ipv4_src: config.get("mcast_ip4_src").cloned().unwrap_or_default(),
        }
    }
}

/// Multicast configuration of one router.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct McastRouter {
    pub relay: bool,
    pub flood_static: bool,
}

impl McastRouter {
    pub(crate) fn from_config(options: &BTreeMap<String, String>) -> Self {
        Self {
            relay: options.get("mcast_relay").is_some_and(|v| v == "true"),
            flood_static: options
                .get("mcast_flood_static")
                .is_some_and(|v| v == "true"),
        }
    }
}

pub(crate) fn lsp_mcast_flood(lsp: &LogicalSwitchPort) -> bool {
    lsp.options.get("mcast_flood").is_some_and(|v| v == "true")
}

pub(crate) fn lsp_mcast_flood_reports(lsp: &LogicalSwitchPort) -> bool {
    lsp.options
        .get("mcast_flood_reports")
        .is_some_and(|v| v == "true")
}

fn lrp_mcast_flood(options: &BTreeMap<String, String>) -> bool {
    options.get("mcast_flood").is_some_and(|v| v == "true")
}

/// One aggregated IGMP group, keyed per datapath by the normalized address.
#[derive(Debug)]
pub(crate) struct LearntGroup {
    pub dp: usize,
    /// The group address as it appears in match expressions and as the
    /// southbound group name.
    pub name: String,
    pub v4: Option<Ipv4Addr>,
    pub ports: BTreeSet<usize>,
    pub key: u32,
}

/// Per-datapath multicast port sets consumed by the pipeline generators.
#[derive(Debug, Default)]
pub(crate) struct DpMcast {
    pub flood_report_ports: Vec<usize>,
    pub flood_ports: Vec<usize>,
    /// Switch ports peered to multicast-relay routers.
    pub mrouter_ports: Vec<usize>,
    /// Indexes into [`Mcast::groups`].
    pub groups: Vec<usize>,
}

#[derive(Debug, Default)]
pub(crate) struct Mcast {
    pub per_dp: Vec<DpMcast>,
    pub groups: Vec<LearntGroup>,
    pub igmp_deletes: Vec<IgmpGroupRow>,
}

/// Normalizes a group address: IPv4 groups key as IPv6-mapped addresses so
/// one map covers both families.
fn normalize(address: &str) -> Option<(Ipv6Addr, Option<Ipv4Addr>)> {
    if let Ok(v4) = address.parse::<Ipv4Addr>() {
        return Some((v4.to_ipv6_mapped(), Some(v4)));
    }

    address.parse::<Ipv6Addr>().ok().map(|v6| (v6, None))
}

/// Selects the ports of one contributing IGMP row.
///
/// Ports set to flood and ports whose peer router relays are excluded; they
/// receive the traffic through the flood groups anyway.
fn igmp_group_ports(
    row: &IgmpGroupRow,
    nb: &Northbound,
    datapaths: &Datapaths,
    ports: &Ports,
) -> BTreeSet<usize> {
    row.ports
        .iter()
        .filter_map(|name| ports.index_of(name))
        .filter(|&ix| {
            let port = &ports.items[ix];

            if port.lsp(nb).is_some_and(lsp_mcast_flood) {
                return false;
            }

            let relay_peer = port
                .peer
                .map(|peer| ports.items[peer].dp)
                .and_then(|dp| datapaths.items[dp].mcast_rtr)
                .is_some_and(|m| m.relay);

            !relay_peer
        })
        .collect()
}

pub(crate) fn build_mcast(
    nb: &Northbound,
    sb: &Southbound,
    datapaths: &Datapaths,
    ports: &Ports,
    warn: &Warnings,
    now: Instant,
) -> Mcast {
    let mut mcast = Mcast {
        per_dp: (0..datapaths.items.len()).map(|_| DpMcast::default()).collect(),
        ..Default::default()
    };

    // Port flag sets.
    for (ix, port) in ports.items.iter().enumerate() {
        match port.source {
            PortSource::Lsp { .. } => {
                let lsp = port.lsp(nb).expect("switch port");

                if lsp_mcast_flood(lsp) {
                    mcast.per_dp[port.dp].flood_ports.push(ix);
                }
                if lsp_mcast_flood_reports(lsp) {
                    mcast.per_dp[port.dp].flood_report_ports.push(ix);
                }

                let peer_relays = port
                    .peer
                    .map(|peer| ports.items[peer].dp)
                    .and_then(|dp| datapaths.items[dp].mcast_rtr)
                    .is_some_and(|m| m.relay);

                if peer_relays {
                    mcast.per_dp[port.dp].mrouter_ports.push(ix);
                }
            }
            PortSource::Lrp { .. } => {
                let lrp = port.lrp(nb).expect("router port");

                if lrp_mcast_flood(&lrp.options) {
                    mcast.per_dp[port.dp].flood_ports.push(ix);
                }
            }
            PortSource::Redirect { .. } => {}
        }
    }

    // Fold the observed IGMP rows into per-datapath aggregates.
    let dp_by_uuid: HashMap<_, _> = datapaths
        .iter()
        .enumerate()
        .map(|(ix, dp)| (dp.key.uuid(), ix))
        .collect();

    let mut aggregates: BTreeMap<(usize, Ipv6Addr), usize> = BTreeMap::new();

    for row in &sb.igmp_groups {
        let Some(&dp_ix) = dp_by_uuid.get(&row.datapath) else {
            mcast.igmp_deletes.push(row.clone());
            continue;
        };

        let enabled = datapaths.items[dp_ix]
            .mcast_sw
            .as_ref()
            .is_some_and(|m| m.enabled);

        if !enabled {
            continue;
        }

        let Some((key_addr, v4)) = normalize(&row.address) else {
            warn_rl!(
                warn.cfg,
                now,
                address = %row.address,
                "deleting IGMP group with unparsable address"
            );
            mcast.igmp_deletes.push(row.clone());
            continue;
        };

        let selected = igmp_group_ports(row, nb, datapaths, ports);

        let group_ix = *aggregates.entry((dp_ix, key_addr)).or_insert_with(|| {
            mcast.groups.push(LearntGroup {
                dp: dp_ix,
                name: row.address.clone(),
                v4,
                ports: BTreeSet::new(),
                key: 0,
            });

            mcast.groups.len() - 1
        });

        mcast.groups[group_ix].ports.extend(selected);
    }

    // Mirror each switch aggregate onto attached relay routers so multicast
    // crosses the router.
    let switch_groups = mcast.groups.len();

    for group_ix in 0..switch_groups {
        let (dp_ix, name, v4) = {
            let g = &mcast.groups[group_ix];
            (g.dp, g.name.clone(), g.v4)
        };

        for port in ports.on_dp(dp_ix) {
            let Some(peer) = port.peer else { continue };
            let peer_port = &ports.items[peer];
            let router_dp = peer_port.dp;

            let relays = datapaths.items[router_dp]
                .mcast_rtr
                .is_some_and(|m| m.relay);

            if !relays || peer_port.derived {
                continue;
            }

            let key_addr = match v4 {
                Some(v4) => v4.to_ipv6_mapped(),
                None => match name.parse::<Ipv6Addr>() {
                    Ok(v6) => v6,
                    Err(_) => continue,
                },
            };

            let mirror_ix = *aggregates.entry((router_dp, key_addr)).or_insert_with(|| {
                mcast.groups.push(LearntGroup {
                    dp: router_dp,
                    name: name.clone(),
                    v4,
                    ports: BTreeSet::new(),
                    key: 0,
                });

                mcast.groups.len() - 1
            });

            mcast.groups[mirror_ix].ports.insert(peer);
        }
    }

    // Key allocation, reusing observed keys per (datapath, name) and
    // honoring the per-switch table-size cap.
    let observed_keys: HashMap<(uuid::Uuid, &str), u32> = sb
        .multicast_groups
        .iter()
        .map(|row| ((row.datapath, row.name.as_str()), u32::from(row.tunnel_key)))
        .collect();

    let mut keyspaces: HashMap<usize, KeySpace> = HashMap::new();
    let mut entries_per_dp: HashMap<usize, i64> = HashMap::new();

    for group_ix in 0..mcast.groups.len() {
        let dp_ix = mcast.groups[group_ix].dp;
        let dp = &datapaths.items[dp_ix];

        if dp.kind == DpKind::Switch {
            let cap = dp
                .mcast_sw
                .as_ref()
                .map(|m| m.table_size)
                .unwrap_or(DEFAULT_TABLE_SIZE);
            let count = entries_per_dp.entry(dp_ix).or_insert(0);

            if *count >= cap {
                warn_rl!(
                    warn.cfg,
                    now,
                    datapath = %dp.key,
                    group = %mcast.groups[group_ix].name,
                    "multicast table size exceeded; dropping group"
                );
                continue;
            }

            *count += 1;
        }

        let keys = keyspaces.entry(dp_ix).or_insert_with(|| {
            KeySpace::new(MIN_IP_MULTICAST_KEY, MAX_IP_MULTICAST_KEY)
        });

        let observed = observed_keys
            .get(&(dp.key.uuid(), mcast.groups[group_ix].name.as_str()))
            .copied()
            .filter(|&k| (MIN_IP_MULTICAST_KEY..=MAX_IP_MULTICAST_KEY).contains(&k));

        let key = match observed {
            Some(key) if keys.mark(key) => key,
            _ => match keys.allocate() {
                Some(key) => key,
                None => {
                    warn_rl!(
                        warn.alloc,
                        now,
                        datapath = %dp.key,
                        group = %mcast.groups[group_ix].name,
                        "multicast group keys exhausted; dropping group"
                    );
                    continue;
                }
            },
        };

        mcast.groups[group_ix].key = key;
        mcast.per_dp[dp_ix].groups.push(group_ix);
    }

    mcast
}

/// Builds the target southbound multicast-group rows: the reserved groups of
/// every datapath plus the keyed learnt groups.
pub(crate) fn target_groups(
    nb: &Northbound,
    datapaths: &Datapaths,
    ports: &Ports,
    mcast: &Mcast,
) -> Vec<MulticastGroupRow> {
    let mut rows = Vec::new();

    let mut push = |dp: usize, name: &str, key: u32, members: Vec<usize>| {
        if members.is_empty() {
            return;
        }

        let names: BTreeSet<String> = members
            .into_iter()
            .map(|ix| ports.items[ix].name.clone())
            .collect();

        rows.push(MulticastGroupRow {
            datapath: datapaths.items[dp].key.uuid(),
            name: name.to_owned(),
            tunnel_key: key as u16,
            ports: names.into_iter().collect(),
        });
    };

    for (dp_ix, dp) in datapaths.iter().enumerate() {
        let flood: Vec<usize> = ports
            .items
            .iter()
            .enumerate()
            .filter(|(_, p)| p.dp == dp_ix && !p.derived && p.is_enabled(nb))
            .map(|(ix, _)| ix)
            .collect();

        push(dp_ix, MC_FLOOD, MC_FLOOD_KEY, flood);

        let info = &mcast.per_dp[dp_ix];

        match dp.kind {
            DpKind::Switch => {
                push(dp_ix, MC_STATIC, MC_STATIC_KEY, info.flood_ports.clone());
                push(
                    dp_ix,
                    MC_MROUTER_FLOOD,
                    MC_MROUTER_FLOOD_KEY,
                    info.mrouter_ports.clone(),
                );
                push(
                    dp_ix,
                    MC_MROUTER_STATIC,
                    MC_MROUTER_STATIC_KEY,
                    info.flood_report_ports.clone(),
                );

                let unknown: Vec<usize> = ports
                    .items
                    .iter()
                    .enumerate()
                    .filter(|(_, p)| p.dp == dp_ix && p.has_unknown)
                    .map(|(ix, _)| ix)
                    .collect();

                push(dp_ix, MC_UNKNOWN, MC_UNKNOWN_KEY, unknown);
            }
            DpKind::Router => {
                push(dp_ix, MC_STATIC, MC_STATIC_KEY, info.flood_ports.clone());
            }
        }
    }

    for group in &mcast.groups {
        if group.key == 0 || group.ports.is_empty() {
            continue;
        }

        push(
            group.dp,
            &group.name,
            group.key,
            group.ports.iter().copied().collect(),
        );
    }

    rows
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_timeout_is_clamped() {
        let mut config = BTreeMap::new();
        config.insert("mcast_idle_timeout".to_owned(), "5".to_owned());

        assert_eq!(McastSwitch::from_config(&config).idle_timeout, 15);

        config.insert("mcast_idle_timeout".to_owned(), "90000".to_owned());

        assert_eq!(McastSwitch::from_config(&config).idle_timeout, 3600);
    }

    #[test]
    fn query_interval_defaults_to_half_the_idle_timeout() {
        let mut config = BTreeMap::new();
        config.insert("mcast_idle_timeout".to_owned(), "600".to_owned());

        assert_eq!(McastSwitch::from_config(&config).query_interval, 300);
    }

    #[test]
    fn querier_defaults_on() {
        assert!(McastSwitch::from_config(&BTreeMap::new()).querier);
    }

    #[test]
    fn normalize_maps_ipv4() {
        let (key, v4) = normalize("239.0.0.1").unwrap();

        assert_eq!(v4, Some("239.0.0.1".parse().unwrap()));
        assert_eq!(key, "::ffff:239.0.0.1".parse::<Ipv6Addr>().unwrap());
    }
}
