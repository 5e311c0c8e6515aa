//! Reconciliation of northbound switches/routers with southbound datapath
//! bindings, including tunnel-key allocation.

use crate::alloc::{KeySpace, MAX_DP_KEY};
use crate::ipam::Ipam;
use crate::mcast::{McastRouter, McastSwitch};
use crate::ratelimit::warn_rl;
use crate::Warnings;
use northd_model::nb::Northbound;
use northd_model::sb::{DatapathBinding, DpKey, Southbound};
use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum DpKind {
    Switch,
    Router,
}

/// Per-pass state of one datapath.
///
/// Relationships to ports are held as indexes into the port arena; they are
/// filled in by the port reconciler.
#[derive(Debug)]
pub(crate) struct Datapath {
    pub key: DpKey,
    pub kind: DpKind,
    /// Index into `nb.switches` or `nb.routers`.
    pub nb_index: usize,
    pub tunnel_key: u32,

    // Switch state.
    pub ipam: Option<Ipam>,
    pub mcast_sw: Option<McastSwitch>,
    pub has_unknown: bool,
    pub localnet_ports: Vec<usize>,

    // Router state.
    pub mcast_rtr: Option<McastRouter>,
    /// The distributed gateway port (an index into the port arena).
    pub l3dgw_port: Option<usize>,
    /// The derived chassis-redirect port shadowing the gateway port.
    pub l3redirect_port: Option<usize>,
    /// Name of the southbound HA chassis group backing the gateway port.
    pub ha_group_name: Option<String>,
    pub router_group: Option<usize>,
}

impl Datapath {
    fn new(key: DpKey, kind: DpKind, nb_index: usize) -> Self {
        Self {
            key,
            kind,
            nb_index,
            tunnel_key: 0,
            ipam: None,
            mcast_sw: None,
            has_unknown: false,
            localnet_ports: Vec::new(),
            mcast_rtr: None,
            l3dgw_port: None,
            l3redirect_port: None,
            ha_group_name: None,
            router_group: None,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct Datapaths {
    pub items: Vec<Datapath>,
    by_key: HashMap<DpKey, usize>,
}

impl Datapaths {
    pub(crate) fn index_of(&self, key: DpKey) -> Option<usize> {
        self.by_key.get(&key).copied()
    }

    pub(crate) fn get(&self, key: DpKey) -> Option<&Datapath> {
        self.index_of(key).map(|ix| &self.items[ix])
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Datapath> {
        self.items.iter()
    }

    fn push(&mut self, dp: Datapath) -> bool {
        if self.by_key.contains_key(&dp.key) {
            return false;
        }

        self.by_key.insert(dp.key, self.items.len());
        self.items.push(dp);

        true
    }
}

/// Joins northbound switches and enabled routers against the observed
/// southbound bindings.
///
/// Keys of persisting datapaths never move; fresh datapaths allocate above
/// the process-wide hint. Exhaustion leaves `tunnel_key == 0`, which keeps
/// the datapath out of the target binding set for this pass.
pub(crate) fn build_datapaths(
    nb: &Northbound,
    sb: &Southbound,
    key_hint: u32,
    warn: &Warnings,
    now: Instant,
) -> (Datapaths, u32) {
    let mut datapaths = Datapaths::default();

    for (ix, ls) in nb.switches.iter().enumerate() {
        let dp = Datapath {
            ipam: build_switch_ipam(ls, warn, now),
            mcast_sw: Some(McastSwitch::from_config(&ls.other_config)),
            ..Datapath::new(DpKey::Switch(ls.id), DpKind::Switch, ix)
        };

        if !datapaths.push(dp) {
            warn_rl!(
                warn.cfg,
                now,
                switch = %ls.name,
                id = %ls.id,
                "duplicate logical switch identity; keeping the first"
            );
        }
    }

    for (ix, lr) in nb.routers.iter().enumerate() {
        if !lr.is_enabled() {
            continue;
        }

        let dp = Datapath {
            mcast_rtr: Some(McastRouter::from_config(&lr.options)),
            ..Datapath::new(DpKey::Router(lr.id), DpKind::Router, ix)
        };

        if !datapaths.push(dp) {
            warn_rl!(
                warn.cfg,
                now,
                router = %lr.name,
                id = %lr.id,
                "logical router shares its identity with another datapath; skipping"
            );
        }
    }

    // Adopt observed tunnel keys. The first binding claiming a key wins;
    // colliding or keyless rows are left out of the target set and thereby
    // garbage-collected.
    let mut observed = BTreeMap::new();

    for binding in &sb.datapaths {
        let Some(key) = binding.nb_key() else {
            warn_rl!(
                warn.cfg,
                now,
                tunnel_key = binding.tunnel_key,
                "deleting datapath binding with no usable external key"
            );
            continue;
        };

        if observed.insert(key, binding.tunnel_key).is_some() {
            warn_rl!(
                warn.cfg,
                now,
                datapath = %key,
                "deleting duplicate datapath binding"
            );
        }
    }

    let mut keys = KeySpace::with_hint(1, MAX_DP_KEY, key_hint);

    for dp in &mut datapaths.items {
        if let Some(&tunnel_key) = observed.get(&dp.key) {
            if (1..=MAX_DP_KEY).contains(&tunnel_key) && keys.mark(tunnel_key) {
                dp.tunnel_key = tunnel_key;
            } else {
                warn_rl!(
                    warn.cfg,
                    now,
                    datapath = %dp.key,
                    tunnel_key,
                    "tunnel key collides with another datapath; reallocating"
                );
            }
        }
    }

    for dp in &mut datapaths.items {
        if dp.tunnel_key != 0 {
            continue;
        }

        match keys.allocate() {
            Some(key) => dp.tunnel_key = key,
            None => {
                warn_rl!(
                    warn.alloc,
                    now,
                    datapath = %dp.key,
                    "all datapath tunnel keys exhausted"
                );
            }
        }
    }

    (datapaths, keys.hint())
}

fn build_switch_ipam(
    ls: &northd_model::nb::LogicalSwitch,
    warn: &Warnings,
    now: Instant,
) -> Option<Ipam> {
    let subnet = ls.other_config.get("subnet")?;

    let Ok(net) = subnet.parse::<ip_network::Ipv4Network>() else {
        warn_rl!(
            warn.cfg,
            now,
            switch = %ls.name,
            subnet = %subnet,
            "invalid subnet; dynamic addressing disabled"
        );
        return None;
    };

    let subnet = crate::addresses::Ipv4Net {
        addr: net.network_address(),
        plen: net.netmask(),
    };

    let (ipam, bad) = Ipam::new(subnet, ls.other_config.get("exclude_ips").map(String::as_str));

    for excluded in bad {
        warn_rl!(
            warn.cfg,
            now,
            switch = %ls.name,
            excluded = %excluded,
            "exclude_ips entry is not inside the subnet"
        );
    }

    Some(ipam)
}

/// The target southbound binding rows for the reconciled datapaths.
pub(crate) fn target_bindings(nb: &Northbound, datapaths: &Datapaths) -> Vec<DatapathBinding> {
    datapaths
        .iter()
        .filter(|dp| dp.tunnel_key != 0)
        .map(|dp| {
            let mut external_ids = BTreeMap::new();

            match dp.kind {
                DpKind::Switch => {
                    let ls = &nb.switches[dp.nb_index];
                    external_ids.insert("logical-switch".to_owned(), ls.id.to_string());
                    external_ids.insert("name".to_owned(), ls.name.clone());
                }
                DpKind::Router => {
                    let lr = &nb.routers[dp.nb_index];
                    external_ids.insert("logical-router".to_owned(), lr.id.to_string());
                    external_ids.insert("name".to_owned(), lr.name.clone());
                }
            }

            DatapathBinding {
                tunnel_key: dp.tunnel_key,
                external_ids,
            }
        })
        .collect()
}
