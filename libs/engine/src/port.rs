//! Reconciliation of logical ports with southbound port bindings: peering,
//! derived chassis-redirect ports, tunnel keys, tags, dynamic addressing and
//! queue ids.

use crate::addresses::{self, json_string, LportAddresses};
use crate::alloc::{KeySpace, QueueIds, Tags, MAX_PORT_KEY};
use crate::datapath::{Datapaths, DpKind};
use crate::ipam::{parse_dynamic_request, DynamicRequest, MacPrefix, MacSet};
use crate::ratelimit::warn_rl;
use crate::Warnings;
use northd_model::nb::{LogicalRouterPort, LogicalSwitchPort, LspType, Northbound};
use northd_model::ops::NbOp;
use northd_model::sb::{PortBinding, Southbound};
use northd_model::EthAddr;
use std::collections::{BTreeMap, HashMap};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PortSource {
    Lsp { ls: usize, lsp: usize },
    Lrp { lr: usize, lrp: usize },
    /// The derived `cr-` port shadowing a distributed gateway port.
    Redirect { lr: usize, lrp: usize },
}

/// Per-pass state of one logical port.
#[derive(Debug)]
pub(crate) struct Port {
    pub name: String,
    /// The JSON-escaped name, quotes included; the only form the flow
    /// emitters may interpolate into match strings.
    pub json_name: String,
    pub dp: usize,
    pub source: PortSource,
    pub tunnel_key: u32,
    pub peer: Option<usize>,
    pub derived: bool,
    /// Resolved L2/L3 address sets (static plus dynamic).
    pub addresses: Vec<LportAddresses>,
    /// Port-security constraints.
    pub ps: Vec<LportAddresses>,
    pub has_unknown: bool,
    pub dynamic: Option<LportAddresses>,
    pub tag: Option<u16>,
    pub queue_id: Option<u32>,
    pub sb_chassis: Option<String>,
    /// Written by the hypervisor binding a virtual port; preserved verbatim.
    pub sb_virtual_parent: Option<String>,
    /// Externally announced NAT addresses; filled once routers are built.
    pub nat_addresses: Vec<String>,
}

impl Port {
    fn new(name: &str, dp: usize, source: PortSource) -> Self {
        Self {
            name: name.to_owned(),
            json_name: json_string(name),
            dp,
            source,
            tunnel_key: 0,
            peer: None,
            derived: matches!(source, PortSource::Redirect { .. }),
            addresses: Vec::new(),
            ps: Vec::new(),
            has_unknown: false,
            dynamic: None,
            tag: None,
            queue_id: None,
            sb_chassis: None,
            sb_virtual_parent: None,
            nat_addresses: Vec::new(),
        }
    }

    pub(crate) fn lsp<'a>(&self, nb: &'a Northbound) -> Option<&'a LogicalSwitchPort> {
        match self.source {
            PortSource::Lsp { ls, lsp } => Some(&nb.switches[ls].ports[lsp]),
            _ => None,
        }
    }

    pub(crate) fn lrp<'a>(&self, nb: &'a Northbound) -> Option<&'a LogicalRouterPort> {
        match self.source {
            PortSource::Lrp { lr, lrp } | PortSource::Redirect { lr, lrp } => {
                Some(&nb.routers[lr].ports[lrp])
            }
            PortSource::Lsp { .. } => None,
        }
    }

    pub(crate) fn is_enabled(&self, nb: &Northbound) -> bool {
        match self.source {
            PortSource::Lsp { .. } => self.lsp(nb).is_some_and(|lsp| lsp.is_enabled()),
            _ => self.lrp(nb).is_some_and(|lrp| lrp.is_enabled()),
        }
    }

    pub(crate) fn lsp_type(&self, nb: &Northbound) -> Option<LspType> {
        self.lsp(nb).map(|lsp| lsp.port_type)
    }

    /// The router-port networks, for LRPs and their derived redirect ports.
    pub(crate) fn networks(&self) -> Option<&LportAddresses> {
        match self.source {
            PortSource::Lrp { .. } | PortSource::Redirect { .. } => self.addresses.first(),
            PortSource::Lsp { .. } => None,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct Ports {
    pub items: Vec<Port>,
    pub by_name: HashMap<String, usize>,
}

impl Ports {
    pub(crate) fn get(&self, name: &str) -> Option<&Port> {
        self.by_name.get(name).map(|&ix| &self.items[ix])
    }

    pub(crate) fn index_of(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Port> {
        self.items.iter()
    }

    /// All ports of one datapath, in arena order.
    pub(crate) fn on_dp(&self, dp: usize) -> impl Iterator<Item = &Port> {
        self.items.iter().filter(move |p| p.dp == dp)
    }

    fn push(&mut self, port: Port) -> Option<usize> {
        if self.by_name.contains_key(&port.name) {
            return None;
        }

        let ix = self.items.len();
        self.by_name.insert(port.name.clone(), ix);
        self.items.push(port);

        Some(ix)
    }
}

pub(crate) struct PortsOutcome {
    pub ports: Ports,
    pub nb_ops: Vec<NbOp>,
}

/// Builds the port arena: creation, derived redirect ports, peering, key and
/// tag allocation, dynamic addressing, queue ids.
pub(crate) fn build_ports(
    nb: &Northbound,
    sb: &Southbound,
    datapaths: &mut Datapaths,
    mac_set: &mut MacSet,
    mac_prefix: MacPrefix,
    warn: &Warnings,
    now: Instant,
) -> PortsOutcome {
    let mut ports = Ports::default();
    let mut nb_ops = Vec::new();

    create_switch_ports(nb, datapaths, &mut ports, warn, now);
    create_router_ports(nb, datapaths, &mut ports, warn, now);
    create_redirect_ports(nb, datapaths, &mut ports, warn, now);
    resolve_peers(nb, &mut ports, warn, now);
    adopt_sb_state(sb, &mut ports);
    allocate_tunnel_keys(sb, datapaths, &mut ports, warn, now);
    allocate_tags(nb, &mut ports, &mut nb_ops);
    run_ipam(nb, datapaths, &mut ports, mac_set, mac_prefix, &mut nb_ops, warn, now);
    allocate_queue_ids(nb, sb, &mut ports, warn, now);

    PortsOutcome { ports, nb_ops }
}

fn create_switch_ports(
    nb: &Northbound,
    datapaths: &mut Datapaths,
    ports: &mut Ports,
    warn: &Warnings,
    now: Instant,
) {
    for (ls_ix, ls) in nb.switches.iter().enumerate() {
        let Some(dp) = datapaths.index_of(northd_model::sb::DpKey::Switch(ls.id)) else {
            continue;
        };

        for (lsp_ix, lsp) in ls.ports.iter().enumerate() {
            let mut port = Port::new(
                &lsp.name,
                dp,
                PortSource::Lsp {
                    ls: ls_ix,
                    lsp: lsp_ix,
                },
            );

            for entry in &lsp.addresses {
                match entry.as_str() {
                    "unknown" => port.has_unknown = true,
                    // Resolved once the peer router port is known.
                    "router" => {}
                    entry if parse_dynamic_request(entry).is_some() => {}
                    entry => match addresses::parse_lsp_addresses(entry) {
                        Ok(parsed) => port.addresses.push(parsed),
                        Err(e) => {
                            warn_rl!(
                                warn.cfg,
                                now,
                                port = %lsp.name,
                                entry,
                                "ignoring unparsable address: {e}"
                            );
                        }
                    },
                }
            }

            for entry in &lsp.port_security {
                match addresses::parse_lsp_addresses(entry) {
                    Ok(parsed) => port.ps.push(parsed),
                    Err(e) => {
                        warn_rl!(
                            warn.cfg,
                            now,
                            port = %lsp.name,
                            entry = %entry,
                            "ignoring unparsable port security entry: {e}"
                        );
                    }
                }
            }

            let ix = ports.push(port);

            match ix {
                None => {
                    warn_rl!(
                        warn.cfg,
                        now,
                        port = %lsp.name,
                        "duplicate logical port name; keeping the first"
                    );
                }
                Some(ix) => {
                    if lsp.port_type == LspType::Localnet {
                        datapaths.items[dp].localnet_ports.push(ix);
                    }
                    if ports.items[ix].has_unknown {
                        datapaths.items[dp].has_unknown = true;
                    }
                }
            }
        }
    }
}

fn create_router_ports(
    nb: &Northbound,
    datapaths: &mut Datapaths,
    ports: &mut Ports,
    warn: &Warnings,
    now: Instant,
) {
    for (lr_ix, lr) in nb.routers.iter().enumerate() {
        let Some(dp) = datapaths.index_of(northd_model::sb::DpKey::Router(lr.id)) else {
            continue;
        };

        for (lrp_ix, lrp) in lr.ports.iter().enumerate() {
            let networks = match addresses::parse_lrp_networks(&lrp.mac, &lrp.networks) {
                Ok(networks) => networks,
                Err(e) => {
                    warn_rl!(
                        warn.cfg,
                        now,
                        port = %lrp.name,
                        "skipping router port: {e}"
                    );
                    continue;
                }
            };

            let mut port = Port::new(
                &lrp.name,
                dp,
                PortSource::Lrp {
                    lr: lr_ix,
                    lrp: lrp_ix,
                },
            );
            port.addresses.push(networks);

            if ports.push(port).is_none() {
                warn_rl!(
                    warn.cfg,
                    now,
                    port = %lrp.name,
                    "duplicate logical port name; keeping the first"
                );
            }
        }
    }
}

/// The three gateway declaration forms, strongest first.
fn declares_gateway(lrp: &LogicalRouterPort) -> bool {
    lrp.ha_chassis_group.is_some()
        || !lrp.gateway_chassis.is_empty()
        || lrp.options.contains_key("redirect-chassis")
}

fn create_redirect_ports(
    nb: &Northbound,
    datapaths: &mut Datapaths,
    ports: &mut Ports,
    warn: &Warnings,
    now: Instant,
) {
    for (lr_ix, lr) in nb.routers.iter().enumerate() {
        let Some(dp) = datapaths.index_of(northd_model::sb::DpKey::Router(lr.id)) else {
            continue;
        };

        for (lrp_ix, lrp) in lr.ports.iter().enumerate() {
            if !declares_gateway(lrp) {
                continue;
            }

            let Some(lrp_port) = ports.index_of(&lrp.name) else {
                continue;
            };

            if datapaths.items[dp].l3dgw_port.is_some() {
                warn_rl!(
                    warn.cfg,
                    now,
                    router = %lr.name,
                    port = %lrp.name,
                    "router already has a distributed gateway port; ignoring"
                );
                continue;
            }

            let name = format!("cr-{}", lrp.name);
            let mut port = Port::new(
                &name,
                dp,
                PortSource::Redirect {
                    lr: lr_ix,
                    lrp: lrp_ix,
                },
            );
            port.addresses = ports.items[lrp_port].addresses.clone();

            match ports.push(port) {
                Some(redirect) => {
                    datapaths.items[dp].l3dgw_port = Some(lrp_port);
                    datapaths.items[dp].l3redirect_port = Some(redirect);
                }
                None => {
                    warn_rl!(
                        warn.cfg,
                        now,
                        port = %name,
                        "derived redirect port collides with an existing port"
                    );
                }
            }
        }
    }
}

fn resolve_peers(nb: &Northbound, ports: &mut Ports, warn: &Warnings, now: Instant) {
    for ix in 0..ports.items.len() {
        let port = &ports.items[ix];

        match port.source {
            PortSource::Lsp { .. } => {
                let lsp = port.lsp(nb).expect("switch port has an nb row");

                if lsp.port_type != LspType::Router {
                    continue;
                }

                let Some(peer_name) = lsp.options.get("router-port") else {
                    warn_rl!(
                        warn.cfg,
                        now,
                        port = %port.name,
                        "router-type port without options:router-port"
                    );
                    continue;
                };

                let Some(peer_ix) = ports.index_of(peer_name) else {
                    warn_rl!(
                        warn.cfg,
                        now,
                        port = %port.name,
                        peer = %peer_name,
                        "options:router-port names a nonexistent router port"
                    );
                    continue;
                };

                if ports.items[peer_ix].lrp(nb).is_none() || ports.items[peer_ix].derived {
                    warn_rl!(
                        warn.cfg,
                        now,
                        port = %ports.items[ix].name,
                        peer = %peer_name,
                        "options:router-port must name a logical router port"
                    );
                    continue;
                }

                ports.items[ix].peer = Some(peer_ix);
                ports.items[peer_ix].peer = Some(ix);

                // `router`-addressed ports answer for the peer's networks.
                let lsp = ports.items[ix].lsp(nb).expect("still a switch port");
                if lsp.addresses.iter().any(|a| a == "router") {
                    let networks = ports.items[peer_ix].addresses.clone();
                    ports.items[ix].addresses.extend(networks);
                }
            }
            PortSource::Lrp { .. } => {
                let lrp = port.lrp(nb).expect("router port has an nb row");

                let Some(peer_name) = &lrp.peer else {
                    continue;
                };

                let Some(peer_ix) = ports.index_of(peer_name) else {
                    continue;
                };

                if ports.items[peer_ix].lrp(nb).is_none() {
                    warn_rl!(
                        warn.cfg,
                        now,
                        port = %ports.items[ix].name,
                        peer = %peer_name,
                        "peer must name a router port, not a switch port"
                    );
                    continue;
                }

                ports.items[ix].peer = Some(peer_ix);
                ports.items[peer_ix].peer = Some(ix);
            }
            PortSource::Redirect { .. } => {}
        }
    }
}

fn adopt_sb_state(sb: &Southbound, ports: &mut Ports) {
    for binding in &sb.port_bindings {
        if let Some(&ix) = ports.by_name.get(&binding.logical_port) {
            ports.items[ix].sb_chassis = binding.chassis.clone();
            ports.items[ix].sb_virtual_parent = binding.virtual_parent.clone();
        }
    }
}

fn allocate_tunnel_keys(
    sb: &Southbound,
    datapaths: &Datapaths,
    ports: &mut Ports,
    warn: &Warnings,
    now: Instant,
) {
    for dp_ix in 0..datapaths.items.len() {
        let dp = &datapaths.items[dp_ix];
        let dp_uuid = dp.key.uuid();

        // Seed from everything observed southbound so keys of persisting
        // ports never move and the hint starts above the highest key.
        let mut observed = BTreeMap::new();
        let mut max_key = 0;

        for binding in sb.port_bindings.iter().filter(|b| b.datapath == dp_uuid) {
            observed.insert(binding.logical_port.clone(), u32::from(binding.tunnel_key));
            max_key = max_key.max(u32::from(binding.tunnel_key));
        }

        let mut keys = KeySpace::with_hint(1, MAX_PORT_KEY, max_key);

        for ix in 0..ports.items.len() {
            if ports.items[ix].dp != dp_ix {
                continue;
            }

            if let Some(&key) = observed.get(&ports.items[ix].name) {
                if (1..=MAX_PORT_KEY).contains(&key) && keys.mark(key) {
                    ports.items[ix].tunnel_key = key;
                }
            }
        }

        for ix in 0..ports.items.len() {
            if ports.items[ix].dp != dp_ix || ports.items[ix].tunnel_key != 0 {
                continue;
            }

            match keys.allocate() {
                Some(key) => ports.items[ix].tunnel_key = key,
                None => {
                    warn_rl!(
                        warn.alloc,
                        now,
                        port = %ports.items[ix].name,
                        datapath = %dp.key,
                        "all port tunnel keys exhausted on this datapath"
                    );
                }
            }
        }
    }
}

fn allocate_tags(nb: &Northbound, ports: &mut Ports, nb_ops: &mut Vec<NbOp>) {
    // Tags are scoped to the parent port; pre-mark everything configured.
    let mut tags_by_parent: HashMap<&str, Tags> = HashMap::new();

    for port in &ports.items {
        let Some(lsp) = port.lsp(nb) else { continue };
        let Some(parent) = lsp.parent_name.as_deref() else {
            continue;
        };

        let tags = tags_by_parent.entry(parent).or_default();

        match (lsp.tag_request, lsp.tag) {
            (Some(req), _) if req > 0 => tags.mark(req),
            (_, Some(tag)) if tag > 0 => tags.mark(tag),
            _ => {}
        }
    }

    for ix in 0..ports.items.len() {
        let Some(lsp) = ports.items[ix].lsp(nb) else {
            continue;
        };
        let id = lsp.id;

        let effective = match (lsp.parent_name.as_deref(), lsp.tag_request, lsp.tag) {
            (Some(parent), Some(0), existing) => {
                match existing {
                    // An earlier pass already committed a tag.
                    Some(tag) if tag > 0 => Some(tag),
                    _ => {
                        let allocated = tags_by_parent
                            .get_mut(parent)
                            .and_then(|tags| tags.allocate());

                        if let Some(tag) = allocated {
                            nb_ops.push(NbOp::SetTag { port: id, tag });
                        }

                        allocated
                    }
                }
            }
            (_, Some(req), _) if req > 0 => Some(req),
            (_, _, tag) => tag,
        };

        ports.items[ix].tag = effective;
    }
}

/// Which components of a dynamic assignment need work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Update {
    /// The component is absent and stays absent.
    None,
    /// Keep the current value.
    Keep,
    /// Use the statically requested value.
    Static,
    /// Drop the current value.
    Remove,
    /// Allocate a fresh value.
    Dynamic,
}

struct PendingPort {
    port: usize,
    request: DynamicRequest,
    mac: Update,
    ip4: Update,
    ip6: Update,
    current: LportAddresses,
}

fn run_ipam(
    nb: &Northbound,
    datapaths: &mut Datapaths,
    ports: &mut Ports,
    mac_set: &mut MacSet,
    mac_prefix: MacPrefix,
    nb_ops: &mut Vec<NbOp>,
    warn: &Warnings,
    now: Instant,
) {
    // Statically configured addresses reserve pool space first, so dynamic
    // allocation can never collide with them.
    for port in &ports.items {
        let dp = &mut datapaths.items[port.dp];

        for addrs in &port.addresses {
            mac_set.insert(mac_prefix, addrs.ea);

            if let Some(ipam) = dp.ipam.as_mut() {
                for ip in &addrs.ipv4 {
                    ipam.insert_ip(ip.addr);
                }
            }
        }

        // Router port addresses reserve space in the peer switch's pool.
        if let (Some(peer), PortSource::Lrp { .. }) = (port.peer, port.source) {
            let peer_dp = ports.items[peer].dp;
            let dp = &mut datapaths.items[peer_dp];

            if let Some(ipam) = dp.ipam.as_mut() {
                for addrs in &port.addresses {
                    for ip in &addrs.ipv4 {
                        ipam.insert_ip(ip.addr);
                    }
                }
            }
        }
    }

    let mut pending = Vec::new();

    for ix in 0..ports.items.len() {
        let port = &ports.items[ix];
        let Some(lsp) = port.lsp(nb) else { continue };

        if port.peer.is_some() {
            continue;
        }

        let mut request = None;

        for entry in &lsp.addresses {
            let Some(parsed) = parse_dynamic_request(entry) else {
                continue;
            };

            match request {
                None => request = Some(parsed),
                Some(_) => {
                    warn_rl!(
                        warn.cfg,
                        now,
                        port = %port.name,
                        "duplicate dynamic address request; ignoring all but the first"
                    );
                }
            }
        }

        let Some(request) = request else { continue };

        let dp = &mut datapaths.items[port.dp];
        let ls = &nb.switches[dp.nb_index];
        let mac_only = ls
            .other_config
            .get("mac_only")
            .is_some_and(|v| v == "true");
        let ipv6_prefix = ls
            .other_config
            .get("ipv6_prefix")
            .and_then(|p| p.parse::<Ipv6Addr>().ok());

        let current = lsp
            .dynamic_addresses
            .as_deref()
            .and_then(|s| addresses::parse_lsp_addresses(s).ok())
            .unwrap_or_default();

        // MAC component.
        let mac = match request.mac {
            Some(requested) if current.ea == requested => Update::Keep,
            Some(_) => Update::Static,
            None if !current.ea.is_zero() && mac_prefix.matches(current.ea) => Update::Keep,
            None => Update::Dynamic,
        };

        // IPv4 component.
        let have_subnet = dp.ipam.is_some() && !mac_only;
        let current_ip4 = current.ipv4.first().map(|n| n.addr);
        let ip4 = match (have_subnet, request.ip4, current_ip4) {
            (false, _, Some(_)) => Update::Remove,
            (false, _, None) => Update::None,
            (true, Some(requested), current_ip4) => {
                let ipam = dp.ipam.as_ref().expect("have_subnet checked");

                if !ipam.contains(requested) {
                    warn_rl!(
                        warn.cfg,
                        now,
                        port = %ports.items[ix].name,
                        ip = %requested,
                        "requested address is outside the subnet; allocating dynamically"
                    );
                    Update::Dynamic
                } else if current_ip4 == Some(requested) {
                    Update::Keep
                } else if ipam.is_taken(requested) {
                    warn_rl!(
                        warn.cfg,
                        now,
                        port = %ports.items[ix].name,
                        ip = %requested,
                        "requested address is already in use; allocating dynamically"
                    );
                    Update::Dynamic
                } else {
                    Update::Static
                }
            }
            (true, None, Some(current_ip4)) => {
                let ipam = dp.ipam.as_ref().expect("have_subnet checked");

                if ipam.contains(current_ip4) {
                    Update::Keep
                } else {
                    Update::Dynamic
                }
            }
            (true, None, None) => Update::Dynamic,
        };

        // IPv6 component: always derived from the (possibly new) MAC.
        let current_ip6 = current.ipv6.first().map(|n| n.addr);
        let ip6 = match (ipv6_prefix, current_ip6) {
            (None, Some(_)) => Update::Remove,
            (None, None) => Update::None,
            (Some(prefix), current_ip6) => {
                let stable_mac = matches!(mac, Update::Keep);
                let expected = addresses::ipv6_from_eui64(prefix, current.ea);

                if stable_mac && current_ip6 == Some(expected) {
                    Update::Keep
                } else {
                    Update::Dynamic
                }
            }
        };

        // Values that survive are inserted now so reallocation avoids them.
        if matches!(mac, Update::Keep) {
            mac_set.insert(mac_prefix, current.ea);
        }
        if matches!(ip4, Update::Keep) {
            if let (Some(ipam), Some(ip)) = (dp.ipam.as_mut(), current_ip4) {
                ipam.insert_ip(ip);
            }
        }

        if [mac, ip4, ip6]
            .iter()
            .all(|u| matches!(u, Update::None | Update::Keep))
        {
            let assigned = current.clone();
            ports.items[ix].dynamic = Some(assigned.clone());
            ports.items[ix].addresses.push(assigned);
            continue;
        }

        pending.push(PendingPort {
            port: ix,
            request,
            mac,
            ip4,
            ip6,
            current,
        });
    }

    // Second pass: allocate in dependency order. IPv4 first (it seeds the
    // MAC suffix), then the MAC, then the EUI-64 IPv6.
    for p in pending {
        let port_name = ports.items[p.port].name.clone();
        let dp = &mut datapaths.items[ports.items[p.port].dp];
        let ls = &nb.switches[dp.nb_index];
        let lsp_id = ports.items[p.port]
            .lsp(nb)
            .map(|lsp| lsp.id)
            .expect("pending ports are switch ports");

        let ip4 = match p.ip4 {
            Update::Keep => ports_current_ip4(&p.current),
            Update::Static => {
                let requested = p.request.ip4.expect("static implies a request");
                if let Some(ipam) = dp.ipam.as_mut() {
                    ipam.insert_ip(requested);
                }
                Some(requested)
            }
            Update::Dynamic => {
                let allocated = dp.ipam.as_mut().and_then(|ipam| ipam.allocate());

                if allocated.is_none() {
                    warn_rl!(
                        warn.alloc,
                        now,
                        port = %port_name,
                        switch = %ls.name,
                        "subnet exhausted; no address assigned"
                    );
                }

                allocated
            }
            Update::None | Update::Remove => None,
        };

        let mac = match p.mac {
            Update::Keep => p.current.ea,
            Update::Static => {
                let requested = p.request.mac.expect("static implies a request");
                if !mac_set.insert(mac_prefix, requested) {
                    warn_rl!(
                        warn.cfg,
                        now,
                        port = %port_name,
                        mac = %requested,
                        "statically requested MAC is already in use"
                    );
                }
                requested
            }
            _ => match mac_set.allocate(mac_prefix, ip4) {
                Some(mac) => mac,
                None => {
                    warn_rl!(
                        warn.alloc,
                        now,
                        port = %port_name,
                        "dynamic MAC space exhausted; no address assigned"
                    );
                    continue;
                }
            },
        };

        let ip6 = match p.ip6 {
            Update::Keep => p.current.ipv6.first().map(|n| n.addr),
            Update::Dynamic => {
                let prefix = ls
                    .other_config
                    .get("ipv6_prefix")
                    .and_then(|p| p.parse::<Ipv6Addr>().ok())
                    .expect("dynamic ip6 implies a prefix");

                Some(addresses::ipv6_from_eui64(prefix, mac))
            }
            Update::None | Update::Remove | Update::Static => None,
        };

        let mut assigned = LportAddresses {
            ea: mac,
            ..Default::default()
        };
        if let Some(ip4) = ip4 {
            assigned.ipv4.push(crate::addresses::Ipv4Net::host(ip4));
        }
        if let Some(ip6) = ip6 {
            assigned.ipv6.push(crate::addresses::Ipv6Net::host(ip6));
        }

        let text = dynamic_addresses_string(&assigned);
        let lsp = ports.items[p.port].lsp(nb).expect("switch port");

        if lsp.dynamic_addresses.as_deref() != Some(text.as_str()) {
            nb_ops.push(NbOp::SetDynamicAddresses {
                port: lsp_id,
                addresses: Some(text),
            });
        }

        ports.items[p.port].dynamic = Some(assigned.clone());
        ports.items[p.port].addresses.push(assigned);
    }
}

fn ports_current_ip4(current: &LportAddresses) -> Option<Ipv4Addr> {
    current.ipv4.first().map(|n| n.addr)
}

/// The canonical `"<mac>[ <ipv4>][ <ipv6>]"` form written back northbound.
pub(crate) fn dynamic_addresses_string(addrs: &LportAddresses) -> String {
    let mut out = addrs.ea.to_string();

    if let Some(ip4) = addrs.ipv4.first() {
        out.push(' ');
        out.push_str(&ip4.addr.to_string());
    }

    if let Some(ip6) = addrs.ipv6.first() {
        out.push(' ');
        out.push_str(&ip6.addr.to_string());
    }

    out
}

fn allocate_queue_ids(
    nb: &Northbound,
    sb: &Southbound,
    ports: &mut Ports,
    warn: &Warnings,
    now: Instant,
) {
    // Seed per-chassis pools from everything already committed southbound.
    let mut queues_by_chassis: HashMap<String, QueueIds> = HashMap::new();

    for binding in &sb.port_bindings {
        let (Some(chassis), Some(id)) = (
            binding.chassis.as_deref(),
            binding
                .options
                .get("qdisc_queue_id")
                .and_then(|v| v.parse::<u32>().ok()),
        ) else {
            continue;
        };

        queues_by_chassis
            .entry(chassis.to_owned())
            .or_default()
            .mark(id);
    }

    let observed: HashMap<&str, u32> = sb
        .port_bindings
        .iter()
        .filter_map(|b| {
            let id = b.options.get("qdisc_queue_id")?.parse::<u32>().ok()?;
            Some((b.logical_port.as_str(), id))
        })
        .collect();

    for ix in 0..ports.items.len() {
        let port = &ports.items[ix];
        let Some(lsp) = port.lsp(nb) else { continue };

        let wants_queue =
            lsp.options.contains_key("qos_max_rate") || lsp.options.contains_key("qos_burst");

        if !wants_queue {
            continue;
        }

        let Some(chassis) = port.sb_chassis.clone() else {
            continue;
        };

        if let Some(&id) = observed.get(port.name.as_str()) {
            ports.items[ix].queue_id = Some(id);
            continue;
        }

        match queues_by_chassis.entry(chassis).or_default().allocate() {
            Some(id) => ports.items[ix].queue_id = Some(id),
            None => {
                warn_rl!(
                    warn.alloc,
                    now,
                    port = %ports.items[ix].name,
                    "all queue ids on the hosting chassis are exhausted"
                );
            }
        }
    }
}

/// Builds the target southbound binding rows.
pub(crate) fn target_bindings(
    nb: &Northbound,
    datapaths: &Datapaths,
    ports: &Ports,
) -> Vec<PortBinding> {
    let mut rows = Vec::new();

    for port in ports.iter() {
        if port.tunnel_key == 0 {
            continue;
        }

        let dp = &datapaths.items[port.dp];
        let tunnel_key = port.tunnel_key as u16;

        let row = match port.source {
            PortSource::Lsp { .. } => {
                let lsp = port.lsp(nb).expect("switch port");
                let mut options = BTreeMap::new();
                let mut port_type = match lsp.port_type {
                    LspType::Vif => String::new(),
                    LspType::Router => "patch".to_owned(),
                    LspType::Localnet => "localnet".to_owned(),
                    LspType::L2Gateway => "l2gateway".to_owned(),
                    LspType::Vtep => "vtep".to_owned(),
                    LspType::Virtual => "virtual".to_owned(),
                    LspType::External => "external".to_owned(),
                };

                match lsp.port_type {
                    LspType::Router => {
                        if let Some(peer) = lsp.options.get("router-port") {
                            options.insert("peer".to_owned(), peer.clone());
                        }
                    }
                    _ => {
                        options.extend(
                            lsp.options
                                .iter()
                                .map(|(k, v)| (k.clone(), v.clone())),
                        );
                    }
                }

                if let Some(queue) = port.queue_id {
                    options.insert("qdisc_queue_id".to_owned(), queue.to_string());
                }

                // A VIF whose parent is set is a nested container port; the
                // SB type stays empty but parent and tag are published.
                if lsp.port_type == LspType::Vif && lsp.parent_name.is_some() {
                    port_type = String::new();
                }

                let mut mac: Vec<String> = lsp
                    .addresses
                    .iter()
                    .filter(|a| parse_dynamic_request(a).is_none())
                    .cloned()
                    .collect();

                if let Some(dynamic) = &port.dynamic {
                    mac.push(dynamic_addresses_string(dynamic));
                }

                PortBinding {
                    logical_port: port.name.clone(),
                    datapath: dp.key.uuid(),
                    tunnel_key,
                    port_type,
                    parent_port: lsp.parent_name.clone(),
                    tag: port.tag,
                    chassis: port.sb_chassis.clone(),
                    ha_chassis_group: None,
                    virtual_parent: port.sb_virtual_parent.clone(),
                    mac,
                    nat_addresses: port.nat_addresses.clone(),
                    options,
                    external_ids: lsp.external_ids.clone(),
                }
            }
            PortSource::Lrp { .. } => {
                let lrp = port.lrp(nb).expect("router port");
                let lr = &nb.routers[match port.source {
                    PortSource::Lrp { lr, .. } => lr,
                    _ => unreachable!(),
                }];
                let mut options = BTreeMap::new();

                if let Some(peer) = port.peer {
                    options.insert("peer".to_owned(), ports.items[peer].name.clone());
                }

                let port_type = match lr.options.contains_key("chassis") {
                    true => "l3gateway".to_owned(),
                    false => "patch".to_owned(),
                };

                PortBinding {
                    logical_port: port.name.clone(),
                    datapath: dp.key.uuid(),
                    tunnel_key,
                    port_type,
                    parent_port: None,
                    tag: None,
                    chassis: port.sb_chassis.clone(),
                    ha_chassis_group: None,
                    virtual_parent: None,
                    mac: vec![format!(
                        "{} {}",
                        lrp.mac,
                        lrp.networks.join(" ")
                    )
                    .trim_end()
                    .to_owned()],
                    nat_addresses: Vec::new(),
                    options,
                    external_ids: lrp.external_ids.clone(),
                }
            }
            PortSource::Redirect { .. } => {
                let lrp = port.lrp(nb).expect("redirect shadows a router port");
                let mut options = BTreeMap::new();
                options.insert("distributed-port".to_owned(), lrp.name.clone());

                PortBinding {
                    logical_port: port.name.clone(),
                    datapath: dp.key.uuid(),
                    tunnel_key,
                    port_type: "chassisredirect".to_owned(),
                    parent_port: None,
                    tag: None,
                    chassis: port.sb_chassis.clone(),
                    ha_chassis_group: dp.ha_group_name.clone(),
                    virtual_parent: None,
                    mac: Vec::new(),
                    nat_addresses: Vec::new(),
                    options,
                    external_ids: BTreeMap::new(),
                }
            }
        };

        rows.push(row);
    }

    rows
}
