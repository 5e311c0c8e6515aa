//! The logical-router pipeline generator: 16 ingress and 4 egress stages
//! per router datapath, dominated by NAT, load balancing and routing.

use crate::addresses::{self, LportAddresses};
use crate::datapath::{Datapath, DpKind};
use crate::lb::Vip;
use crate::lflow::{
    value_list, Ds, LflowSet, Stage, REGBIT_EGRESS_LOOPBACK, REGBIT_LOOKUP_NEIGHBOR_RESULT,
    REGBIT_ND_RA_OPTS_RESULT, REGBIT_NAT_REDIRECT, REGBIT_PKT_LARGER,
};
use crate::mcast::MC_STATIC;
use crate::port::{Port, PortSource};
use crate::ratelimit::warn_rl;
use crate::Ctx;
use northd_model::nb::{LogicalRouter, NatRule, NatType, PolicyAction, RoutePolicy};
use northd_model::sb::DpKey;
use northd_model::EthAddr;
use std::fmt::Write as _;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Ethernet "unknown" placeholder tested before ARP resolution.
const ETH_ZERO: &str = "00:00:00:00:00:00";

/// A validated NAT rule, ready for emission.
#[derive(Debug)]
struct Nat<'a> {
    rule: &'a NatRule,
    external_ip: IpAddr,
    external_mac: Option<EthAddr>,
    logical_ip: IpAddr,
    logical_plen: u8,
    /// Set when both `external_mac` and `logical_port` are present: the NAT
    /// is handled on the chassis hosting the logical port.
    distributed: bool,
}

impl Nat<'_> {
    fn is_v6(&self) -> bool {
        self.external_ip.is_ipv6()
    }

    fn family(&self) -> &'static str {
        if self.is_v6() { "ip6" } else { "ip4" }
    }

    /// The logical prefix as it appears in match expressions.
    fn logical_prefix(&self) -> String {
        let host = match self.logical_ip {
            IpAddr::V4(_) => self.logical_plen == 32,
            IpAddr::V6(_) => self.logical_plen == 128,
        };

        match host {
            true => self.logical_ip.to_string(),
            false => format!("{}/{}", self.logical_ip, self.logical_plen),
        }
    }

    fn snat_priority(&self) -> u16 {
        u16::from(self.logical_plen) + 1
    }
}

/// Per-router context shared by the stage emitters.
struct Router<'a> {
    dp: &'a Datapath,
    dp_ix: usize,
    lr: &'a LogicalRouter,
    /// A gateway router is pinned to one chassis via `options:chassis`.
    is_gateway: bool,
    l3dgw: Option<&'a Port>,
    redirect: Option<&'a Port>,
    nats: Vec<Nat<'a>>,
    vips: Vec<Vip>,
    dnat_force_snat: Option<IpAddr>,
    lb_force_snat: Option<IpAddr>,
    learn_from_arp_request: bool,
}

impl<'a> Router<'a> {
    fn new(ctx: &'a Ctx, dp: &'a Datapath, dp_ix: usize) -> Self {
        let lr = ctx.lr(dp);

        let nats = lr
            .nat
            .iter()
            .filter_map(|rule| parse_nat(ctx, lr, rule))
            .collect();

        let (vips, bad_vips) = crate::lb::collect_vips(
            lr.load_balancer
                .iter()
                .filter_map(|id| ctx.lbs.get(id).copied()),
        );

        for key in bad_vips {
            warn_rl!(ctx.warn.cfg, ctx.now, router = %lr.name, vip = %key, "ignoring unparsable VIP");
        }

        Self {
            dp,
            dp_ix,
            lr,
            is_gateway: lr.options.contains_key("chassis"),
            l3dgw: dp.l3dgw_port.map(|ix| &ctx.ports.items[ix]),
            redirect: dp.l3redirect_port.map(|ix| &ctx.ports.items[ix]),
            nats,
            vips,
            dnat_force_snat: lr
                .options
                .get("dnat_force_snat_ip")
                .and_then(|ip| ip.parse().ok()),
            lb_force_snat: lr
                .options
                .get("lb_force_snat_ip")
                .and_then(|ip| ip.parse().ok()),
            learn_from_arp_request: lr
                .options
                .get("always_learn_from_arp_request")
                .is_none_or(|v| v != "false"),
        }
    }

    fn key(&self) -> DpKey {
        self.dp.key
    }

    /// NAT rules apply on gateway routers and on distributed routers owning
    /// a gateway port.
    fn does_nat(&self) -> bool {
        self.is_gateway || self.l3dgw.is_some()
    }

    /// The residency clause pinning centralized NAT to the gateway chassis.
    fn redirect_residency(&self) -> String {
        match self.redirect {
            Some(redirect) => format!(" && is_chassis_resident({})", redirect.json_name),
            None => String::new(),
        }
    }

    /// The residency clause for one NAT rule: the NAT's own logical port for
    /// distributed rules, the redirect port otherwise.
    fn nat_residency(&self, nat: &Nat) -> String {
        match (&nat.rule.logical_port, nat.distributed) {
            (Some(port), true) => {
                format!(" && is_chassis_resident({})", addresses::json_string(port))
            }
            _ => self.redirect_residency(),
        }
    }

    /// All addresses the router must keep receiving: SNAT externals and
    /// force-SNAT addresses.
    fn snat_ips(&self) -> Vec<IpAddr> {
        let mut ips: Vec<IpAddr> = self
            .nats
            .iter()
            .filter(|nat| {
                matches!(nat.rule.nat_type, NatType::Snat | NatType::DnatAndSnat)
            })
            .map(|nat| nat.external_ip)
            .collect();

        ips.extend(self.dnat_force_snat);
        ips.extend(self.lb_force_snat);
        ips
    }
}

fn parse_nat<'a>(ctx: &Ctx, lr: &LogicalRouter, rule: &'a NatRule) -> Option<Nat<'a>> {
    let Ok(external_ip) = rule.external_ip.parse::<IpAddr>() else {
        warn_rl!(
            ctx.warn.cfg,
            ctx.now,
            router = %lr.name,
            external_ip = %rule.external_ip,
            "NAT rule with unparsable external IP; skipping"
        );
        return None;
    };

    let (logical_ip, logical_plen) = match rule.logical_ip.split_once('/') {
        Some((ip, plen)) => {
            let parsed = ip
                .parse::<IpAddr>()
                .ok()
                .zip(plen.parse::<u8>().ok());

            match parsed {
                Some(ok) => ok,
                None => {
                    warn_rl!(
                        ctx.warn.cfg,
                        ctx.now,
                        router = %lr.name,
                        logical_ip = %rule.logical_ip,
                        "NAT rule with unparsable logical prefix; skipping"
                    );
                    return None;
                }
            }
        }
        None => match rule.logical_ip.parse::<IpAddr>() {
            Ok(ip @ IpAddr::V4(_)) => (ip, 32),
            Ok(ip @ IpAddr::V6(_)) => (ip, 128),
            Err(_) => {
                warn_rl!(
                    ctx.warn.cfg,
                    ctx.now,
                    router = %lr.name,
                    logical_ip = %rule.logical_ip,
                    "NAT rule with unparsable logical IP; skipping"
                );
                return None;
            }
        },
    };

    if external_ip.is_ipv4() != logical_ip.is_ipv4() {
        warn_rl!(
            ctx.warn.cfg,
            ctx.now,
            router = %lr.name,
            "NAT rule mixes address families; skipping"
        );
        return None;
    }

    // SNAT may cover a prefix; DNAT needs a single logical address.
    if rule.nat_type != NatType::Snat {
        let host = match logical_ip {
            IpAddr::V4(_) => logical_plen == 32,
            IpAddr::V6(_) => logical_plen == 128,
        };

        if !host {
            warn_rl!(
                ctx.warn.cfg,
                ctx.now,
                router = %lr.name,
                logical_ip = %rule.logical_ip,
                "DNAT rule must name a single logical IP; skipping"
            );
            return None;
        }
    }

    let external_mac = rule
        .external_mac
        .as_deref()
        .and_then(|m| m.parse::<EthAddr>().ok());
    let distributed = rule.nat_type == NatType::DnatAndSnat
        && external_mac.is_some()
        && rule.logical_port.is_some();

    Some(Nat {
        rule,
        external_ip,
        external_mac,
        logical_ip,
        logical_plen,
        distributed,
    })
}

pub(crate) fn build_lrouter_flows(ctx: &Ctx, lflows: &mut LflowSet) {
    for (dp_ix, dp) in ctx.datapaths.items.iter().enumerate() {
        if dp.kind != DpKind::Router {
            continue;
        }

        let rtr = Router::new(ctx, dp, dp_ix);

        admission(ctx, &rtr, lflows);
        neighbor_lookup_and_learn(&rtr, lflows);
        ip_input(ctx, &rtr, lflows);
        nat_and_lb(ctx, &rtr, lflows);
        nd_ra(ctx, &rtr, lflows);
        routing(ctx, &rtr, lflows);
        policies(ctx, &rtr, lflows);
        arp_resolve(ctx, &rtr, lflows);
        packet_length(ctx, &rtr, lflows);
        gateway_redirect(&rtr, lflows);
        arp_request(&rtr, lflows);
        delivery(ctx, &rtr, lflows);
    }
}

/// Ingress table 0: L2 admission.
fn admission(ctx: &Ctx, rtr: &Router, lflows: &mut LflowSet) {
    lflows.add(
        rtr.key(),
        Stage::LrInAdmission,
        100,
        "vlan.present || eth.src[40]",
        "drop;",
    );

    for port in ctx.ports.on_dp(rtr.dp_ix) {
        if port.derived || !port.is_enabled(ctx.nb) {
            continue;
        }

        let Some(networks) = port.networks() else { continue };
        let hint = port.lrp(ctx.nb).map(|lrp| lrp.id.hint()).unwrap_or(0);

        // The distributed gateway port only admits on the chassis where it
        // is resident.
        let residency = match rtr.l3dgw.map(|p| std::ptr::eq(p, port)).unwrap_or(false) {
            true => rtr.redirect_residency(),
            false => String::new(),
        };

        lflows.add_hint(
            rtr.key(),
            Stage::LrInAdmission,
            50,
            format!("eth.mcast && inport == {}{residency}", port.json_name),
            "next;",
            hint,
        );
        lflows.add_hint(
            rtr.key(),
            Stage::LrInAdmission,
            50,
            format!(
                "eth.dst == {} && inport == {}{residency}",
                networks.ea, port.json_name
            ),
            "next;",
            hint,
        );
    }

    // Packets addressed to a distributed NAT's external MAC enter on the
    // chassis hosting the NAT's logical port.
    if let Some(l3dgw) = rtr.l3dgw {
        for nat in rtr.nats.iter().filter(|nat| nat.distributed) {
            let mac = nat.external_mac.expect("distributed implies a MAC");
            let port = nat.rule.logical_port.as_deref().expect("and a port");

            lflows.add(
                rtr.key(),
                Stage::LrInAdmission,
                50,
                format!(
                    "eth.dst == {mac} && inport == {} && is_chassis_resident({})",
                    l3dgw.json_name,
                    addresses::json_string(port)
                ),
                "next;",
            );
        }
    }
}

/// Ingress tables 1-2: neighbor lookup and learning.
fn neighbor_lookup_and_learn(rtr: &Router, lflows: &mut LflowSet) {
    let dp = rtr.key();

    lflows.add(
        dp,
        Stage::LrInLookupNeighbor,
        100,
        "arp.op == 2",
        format!("{REGBIT_LOOKUP_NEIGHBOR_RESULT} = lookup_arp(inport, arp.spa, arp.sha); next;"),
    );
    lflows.add(
        dp,
        Stage::LrInLookupNeighbor,
        100,
        "nd_na",
        format!("{REGBIT_LOOKUP_NEIGHBOR_RESULT} = lookup_nd(inport, nd.target, nd.tll); next;"),
    );
    lflows.add(
        dp,
        Stage::LrInLookupNeighbor,
        100,
        "nd_ns",
        format!("{REGBIT_LOOKUP_NEIGHBOR_RESULT} = lookup_nd(inport, ip6.src, nd.sll); next;"),
    );

    // Whether gratuitous ARP requests may populate the cache.
    let arp_req_actions = match rtr.learn_from_arp_request {
        true => format!("{REGBIT_LOOKUP_NEIGHBOR_RESULT} = lookup_arp(inport, arp.spa, arp.sha); next;"),
        false => format!("{REGBIT_LOOKUP_NEIGHBOR_RESULT} = lookup_arp_ip(inport, arp.spa); next;"),
    };
    lflows.add(dp, Stage::LrInLookupNeighbor, 100, "arp.op == 1", arp_req_actions);

    lflows.add(
        dp,
        Stage::LrInLookupNeighbor,
        0,
        "1",
        format!("{REGBIT_LOOKUP_NEIGHBOR_RESULT} = 1; next;"),
    );

    lflows.add(
        dp,
        Stage::LrInLearnNeighbor,
        100,
        format!("arp && {REGBIT_LOOKUP_NEIGHBOR_RESULT} == 0"),
        "put_arp(inport, arp.spa, arp.sha); next;",
    );
    lflows.add(
        dp,
        Stage::LrInLearnNeighbor,
        100,
        format!("nd_na && {REGBIT_LOOKUP_NEIGHBOR_RESULT} == 0"),
        "put_nd(inport, nd.target, nd.tll); next;",
    );
    lflows.add(
        dp,
        Stage::LrInLearnNeighbor,
        100,
        format!("nd_ns && {REGBIT_LOOKUP_NEIGHBOR_RESULT} == 0"),
        "put_nd(inport, ip6.src, nd.sll); next;",
    );
    lflows.add(dp, Stage::LrInLearnNeighbor, 0, "1", "next;");
}

/// Ingress table 3: IP input - malformed classes, self-addressed traffic,
/// ICMP errors and NAT address ownership.
fn ip_input(ctx: &Ctx, rtr: &Router, lflows: &mut LflowSet) {
    let dp = rtr.key();

    lflows.add(
        dp,
        Stage::LrInIpInput,
        100,
        "ip4.src_mcast || ip4.src == 255.255.255.255 || ip4.src == 127.0.0.0/8 || \
         ip4.dst == 127.0.0.0/8 || ip4.src == 0.0.0.0/8 || ip4.dst == 0.0.0.0/8",
        "drop;",
    );
    lflows.add(
        dp,
        Stage::LrInIpInput,
        100,
        "ip6.src == ::1 || ip6.dst == ::1",
        "drop;",
    );

    // Only the dedicated handlers above and below answer ARP/ND.
    lflows.add(dp, Stage::LrInIpInput, 85, "arp || nd", "drop;");

    // TTL discard below the per-port ICMP errors.
    lflows.add(dp, Stage::LrInIpInput, 30, "ip4 && ip.ttl == {0, 1}", "drop;");

    let snat_ips = rtr.snat_ips();

    for port in ctx.ports.on_dp(rtr.dp_ix) {
        if port.derived || !port.is_enabled(ctx.nb) {
            continue;
        }

        let Some(networks) = port.networks() else { continue };
        let hint = port.lrp(ctx.nb).map(|lrp| lrp.id.hint()).unwrap_or(0);
        let is_dgw = rtr.l3dgw.map(|p| std::ptr::eq(p, port)).unwrap_or(false);
        let residency = match is_dgw {
            true => rtr.redirect_residency(),
            false => String::new(),
        };

        if !networks.ipv4.is_empty() {
            let addrs = value_list(networks.ipv4.iter().map(|n| n.addr));

            // ICMP echo.
            lflows.add_hint(
                dp,
                Stage::LrInIpInput,
                90,
                format!(
                    "inport == {} && ip4.dst == {addrs} && icmp4.type == 8 && icmp4.code == 0",
                    port.json_name
                ),
                "ip4.dst <-> ip4.src; ip.ttl = 255; icmp4.type = 0; flags.loopback = 1; next; ",
                hint,
            );

            // ARP for the port's own addresses, restricted to senders on the
            // connected networks.
            for net in &networks.ipv4 {
                lflows.add_hint(
                    dp,
                    Stage::LrInIpInput,
                    90,
                    format!(
                        "inport == {} && arp.spa == {}/{} && arp.tpa == {} && arp.op == 1{residency}",
                        port.json_name,
                        net.network(),
                        net.plen,
                        net.addr
                    ),
                    format!(
                        "eth.dst = eth.src; eth.src = {mac}; arp.op = 2; /* ARP reply */ \
                         arp.tha = arp.sha; arp.sha = {mac}; arp.tpa = arp.spa; \
                         arp.spa = {ip}; outport = inport; flags.loopback = 1; output;",
                        mac = networks.ea,
                        ip = net.addr
                    ),
                    hint,
                );
            }

            // ICMP time exceeded, sourced from the port's first address.
            if let Some(net) = networks.ipv4.first() {
                lflows.add_hint(
                    dp,
                    Stage::LrInIpInput,
                    40,
                    format!(
                        "inport == {} && ip4 && ip.ttl == {{0, 1}} && !ip.later_frag",
                        port.json_name
                    ),
                    format!(
                        "icmp4 {{ eth.dst <-> eth.src; icmp4.type = 11; icmp4.code = 0; \
                         ip4.dst = ip4.src; ip4.src = {}; ip.ttl = 255; next; }};",
                        net.addr
                    ),
                    hint,
                );
            }
        }

        if !networks.ipv6.is_empty() {
            let addrs = value_list(networks.ipv6.iter().map(|n| n.addr));

            lflows.add_hint(
                dp,
                Stage::LrInIpInput,
                90,
                format!(
                    "inport == {} && ip6.dst == {addrs} && icmp6.type == 128 && icmp6.code == 0",
                    port.json_name
                ),
                "ip6.dst <-> ip6.src; ip.ttl = 255; icmp6.type = 129; flags.loopback = 1; next; ",
                hint,
            );

            for net in &networks.ipv6 {
                lflows.add_hint(
                    dp,
                    Stage::LrInIpInput,
                    90,
                    format!(
                        "inport == {} && nd_ns && ip6.dst == {{{}, {}}} && nd.target == {}{residency}",
                        port.json_name,
                        net.addr,
                        net.solicited_node(),
                        net.addr
                    ),
                    format!(
                        "nd_na_router {{ eth.src = {mac}; ip6.src = {ip}; nd.target = {ip}; \
                         nd.tll = {mac}; outport = inport; flags.loopback = 1; output; }};",
                        mac = networks.ea,
                        ip = net.addr
                    ),
                    hint,
                );
            }
        }

        // TCP/UDP unreachable for traffic at the router itself; gateway
        // routers and distributed gateways handle this through NAT instead.
        if !rtr.is_gateway && rtr.l3dgw.is_none() && !networks.ipv4.is_empty() {
            let addrs = value_list(networks.ipv4.iter().map(|n| n.addr));

            lflows.add_hint(
                dp,
                Stage::LrInIpInput,
                80,
                format!(
                    "inport == {} && ip4.dst == {addrs} && !ip.later_frag && udp",
                    port.json_name
                ),
                "icmp4 { eth.dst <-> eth.src; ip4.dst <-> ip4.src; ip.ttl = 255; \
                 icmp4.type = 3; icmp4.code = 3; next; };",
                hint,
            );
            lflows.add_hint(
                dp,
                Stage::LrInIpInput,
                80,
                format!(
                    "inport == {} && ip4.dst == {addrs} && !ip.later_frag && tcp",
                    port.json_name
                ),
                "tcp_reset { eth.dst <-> eth.src; ip4.dst <-> ip4.src; next; };",
                hint,
            );
            lflows.add_hint(
                dp,
                Stage::LrInIpInput,
                70,
                format!(
                    "inport == {} && ip4.dst == {addrs} && !ip.later_frag",
                    port.json_name
                ),
                "icmp4 { eth.dst <-> eth.src; ip4.dst <-> ip4.src; ip.ttl = 255; \
                 icmp4.type = 3; icmp4.code = 2; next; };",
                hint,
            );
        }

        // Drop other traffic addressed to the router, keeping SNAT
        // addresses receivable.
        let keep: Vec<Ipv4Addr> = snat_ips
            .iter()
            .filter_map(|ip| match ip {
                IpAddr::V4(v4) => Some(*v4),
                IpAddr::V6(_) => None,
            })
            .collect();
        let own4: Vec<String> = networks
            .ipv4
            .iter()
            .filter(|n| !keep.contains(&n.addr))
            .map(|n| n.addr.to_string())
            .collect();

        if !own4.is_empty() {
            lflows.add_hint(
                dp,
                Stage::LrInIpInput,
                60,
                format!("ip4.dst == {}", value_list(own4)),
                "drop;",
                hint,
            );
        }

        let keep6: Vec<Ipv6Addr> = snat_ips
            .iter()
            .filter_map(|ip| match ip {
                IpAddr::V6(v6) => Some(*v6),
                IpAddr::V4(_) => None,
            })
            .collect();
        let own6: Vec<String> = networks
            .ipv6
            .iter()
            .filter(|n| !keep6.contains(&n.addr))
            .map(|n| n.addr.to_string())
            .collect();

        if !own6.is_empty() {
            lflows.add_hint(
                dp,
                Stage::LrInIpInput,
                60,
                format!("ip6.dst == {}", value_list(own6)),
                "drop;",
                hint,
            );
        }
    }

    // ARP/ND responders for NAT external addresses, pinned to the chassis
    // that owns the translation.
    if rtr.does_nat() {
        for nat in &rtr.nats {
            if !matches!(nat.rule.nat_type, NatType::Dnat | NatType::DnatAndSnat) {
                continue;
            }

            nat_arp_responder(ctx, rtr, nat, lflows);
        }
    }
}

fn nat_arp_responder(ctx: &Ctx, rtr: &Router, nat: &Nat, lflows: &mut LflowSet) {
    let dp = rtr.key();

    let reply_mac = |port: &Port| match nat.distributed {
        true => nat.external_mac.expect("distributed implies a MAC"),
        false => port.networks().map(|n| n.ea).unwrap_or(EthAddr::ZERO),
    };

    let ports: Vec<&Port> = match rtr.l3dgw {
        Some(l3dgw) => vec![l3dgw],
        None => ctx
            .ports
            .on_dp(rtr.dp_ix)
            .filter(|p| !p.derived && p.is_enabled(ctx.nb))
            .collect(),
    };

    for port in ports {
        let residency = match rtr.l3dgw.is_some() {
            true => rtr.nat_residency(nat),
            false => String::new(),
        };
        let mac = reply_mac(port);

        match nat.external_ip {
            IpAddr::V4(external) => {
                lflows.add(
                    dp,
                    Stage::LrInIpInput,
                    90,
                    format!(
                        "inport == {} && arp.tpa == {external} && arp.op == 1{residency}",
                        port.json_name
                    ),
                    format!(
                        "eth.dst = eth.src; eth.src = {mac}; arp.op = 2; /* ARP reply */ \
                         arp.tha = arp.sha; arp.sha = {mac}; arp.tpa = arp.spa; \
                         arp.spa = {external}; outport = inport; flags.loopback = 1; output;"
                    ),
                );
            }
            IpAddr::V6(external) => {
                lflows.add(
                    dp,
                    Stage::LrInIpInput,
                    90,
                    format!(
                        "inport == {} && nd_ns && ip6.dst == {{{external}, {}}} && \
                         nd.target == {external}{residency}",
                        port.json_name,
                        addresses::solicited_node(external)
                    ),
                    format!(
                        "nd_na {{ eth.src = {mac}; ip6.src = {external}; \
                         nd.target = {external}; nd.tll = {mac}; outport = inport; \
                         flags.loopback = 1; output; }};"
                    ),
                );
            }
        }
    }
}

/// Ingress tables 4-6 and egress tables 0-2: NAT and load balancing.
fn nat_and_lb(ctx: &Ctx, rtr: &Router, lflows: &mut LflowSet) {
    let dp = rtr.key();

    for stage in [
        Stage::LrInDefrag,
        Stage::LrInUnsnat,
        Stage::LrInDnat,
        Stage::LrOutUndnat,
        Stage::LrOutSnat,
        Stage::LrOutEgrLoop,
    ] {
        lflows.add(dp, stage, 0, "1", "next;");
    }

    if !rtr.does_nat() {
        return;
    }

    for nat in &rtr.nats {
        if nat.rule.stateless && nat.rule.nat_type == NatType::DnatAndSnat {
            stateless_nat(rtr, nat, lflows);
            continue;
        }

        if matches!(nat.rule.nat_type, NatType::Snat | NatType::DnatAndSnat) {
            unsnat_and_snat(rtr, nat, lflows);
        }

        if matches!(nat.rule.nat_type, NatType::Dnat | NatType::DnatAndSnat) {
            dnat_and_undnat(rtr, nat, lflows);
        }

        if nat.distributed {
            egress_loopback(rtr, nat, lflows);
        }
    }

    // Force-SNAT receivers and producers.
    if rtr.is_gateway {
        for (force_ip, flag) in [
            (rtr.dnat_force_snat, "force_snat_for_dnat"),
            (rtr.lb_force_snat, "force_snat_for_lb"),
        ] {
            let Some(ip) = force_ip else { continue };
            let family = if ip.is_ipv6() { "ip6" } else { "ip4" };

            lflows.add(
                dp,
                Stage::LrInUnsnat,
                110,
                format!("ip && {family}.dst == {ip}"),
                "ct_snat;",
            );
            lflows.add(
                dp,
                Stage::LrOutSnat,
                100,
                format!("flags.{flag} == 1 && ip"),
                format!("ct_snat({ip});"),
            );
        }

        // Established and related traffic echoes back through conntrack.
        lflows.add(dp, Stage::LrInDnat, 50, "ip", "flags.loopback = 1; ct_dnat;");
    }

    load_balancers(ctx, rtr, lflows);
}

fn unsnat_and_snat(rtr: &Router, nat: &Nat, lflows: &mut LflowSet) {
    let dp = rtr.key();
    let family = nat.family();
    let external = nat.external_ip;

    match rtr.l3dgw {
        None => {
            lflows.add(
                dp,
                Stage::LrInUnsnat,
                90,
                format!("ip && {family}.dst == {external}"),
                "ct_snat;",
            );
            lflows.add(
                dp,
                Stage::LrOutSnat,
                nat.snat_priority(),
                format!("ip && {family}.src == {}", nat.logical_prefix()),
                format!("ct_snat({external});"),
            );
        }
        Some(l3dgw) => {
            let residency = rtr.nat_residency(nat);

            lflows.add(
                dp,
                Stage::LrInUnsnat,
                100,
                format!(
                    "ip && {family}.dst == {external} && inport == {}{residency}",
                    l3dgw.json_name
                ),
                "ct_snat;",
            );

            // Traffic entering elsewhere must reach the gateway first.
            lflows.add(
                dp,
                Stage::LrInUnsnat,
                50,
                format!("ip && {family}.dst == {external}"),
                format!("{REGBIT_NAT_REDIRECT} = 1; next;"),
            );

            let eth_src = match nat.distributed {
                true => format!("eth.src = {}; ", nat.external_mac.expect("distributed")),
                false => String::new(),
            };

            lflows.add(
                dp,
                Stage::LrOutSnat,
                nat.snat_priority(),
                format!(
                    "ip && {family}.src == {} && outport == {}{residency}",
                    nat.logical_prefix(),
                    l3dgw.json_name
                ),
                format!("{eth_src}ct_snat({external});"),
            );
        }
    }
}

fn dnat_and_undnat(rtr: &Router, nat: &Nat, lflows: &mut LflowSet) {
    let dp = rtr.key();
    let family = nat.family();
    let external = nat.external_ip;
    let logical = nat.logical_ip;

    match rtr.l3dgw {
        None => {
            let actions = match rtr.dnat_force_snat.is_some() {
                true => format!("flags.force_snat_for_dnat = 1; ct_dnat({logical});"),
                false => format!("flags.loopback = 1; ct_dnat({logical});"),
            };

            lflows.add(
                dp,
                Stage::LrInDnat,
                100,
                format!("ip && {family}.dst == {external}"),
                actions,
            );
        }
        Some(l3dgw) => {
            let residency = rtr.nat_residency(nat);

            lflows.add(
                dp,
                Stage::LrInDnat,
                100,
                format!(
                    "ip && {family}.dst == {external} && inport == {}{residency}",
                    l3dgw.json_name
                ),
                format!("ct_dnat({logical});"),
            );
            lflows.add(
                dp,
                Stage::LrInDnat,
                50,
                format!("ip && {family}.dst == {external}"),
                format!("{REGBIT_NAT_REDIRECT} = 1; next;"),
            );

            // Replies reverse the translation on the way out.
            let eth_src = match nat.distributed {
                true => format!("eth.src = {}; ", nat.external_mac.expect("distributed")),
                false => String::new(),
            };

            lflows.add(
                dp,
                Stage::LrOutUndnat,
                100,
                format!(
                    "ip && {family}.src == {logical} && outport == {}{residency}",
                    l3dgw.json_name
                ),
                format!("{eth_src}ct_dnat;"),
            );
        }
    }
}

/// Stateless `dnat_and_snat`: plain header rewrites, no conntrack.
fn stateless_nat(rtr: &Router, nat: &Nat, lflows: &mut LflowSet) {
    let dp = rtr.key();
    let family = nat.family();
    let external = nat.external_ip;
    let logical = nat.logical_ip;

    match rtr.l3dgw {
        None => {
            lflows.add(
                dp,
                Stage::LrInDnat,
                100,
                format!("ip && {family}.dst == {external}"),
                format!("flags.loopback = 1; {family}.dst = {logical}; next;"),
            );
            lflows.add(
                dp,
                Stage::LrOutSnat,
                nat.snat_priority(),
                format!("ip && {family}.src == {logical}"),
                format!("{family}.src = {external}; next;"),
            );
        }
        Some(l3dgw) => {
            let residency = rtr.nat_residency(nat);
            let eth_src = match nat.distributed {
                true => format!("eth.src = {}; ", nat.external_mac.expect("distributed")),
                false => String::new(),
            };

            lflows.add(
                dp,
                Stage::LrInDnat,
                100,
                format!(
                    "ip && {family}.dst == {external} && inport == {}{residency}",
                    l3dgw.json_name
                ),
                format!("flags.loopback = 1; {family}.dst = {logical}; next;"),
            );
            lflows.add(
                dp,
                Stage::LrInDnat,
                50,
                format!("ip && {family}.dst == {external}"),
                format!("{REGBIT_NAT_REDIRECT} = 1; next;"),
            );
            lflows.add(
                dp,
                Stage::LrOutUndnat,
                100,
                format!(
                    "ip && {family}.src == {logical} && outport == {}{residency}",
                    l3dgw.json_name
                ),
                format!("{eth_src}{family}.src = {external}; next;"),
            );
        }
    }
}

/// Cross-NAT hairpin: when one NATed workload addresses another NAT's
/// external IP, recirculate into ingress instead of leaving the chassis.
fn egress_loopback(rtr: &Router, nat: &Nat, lflows: &mut LflowSet) {
    let Some(l3dgw) = rtr.l3dgw else { return };
    let port = nat.rule.logical_port.as_deref().expect("distributed NAT");
    let family = nat.family();

    let mut actions = Ds::new();
    actions.put("clone { ct_clear; inport = outport; outport = \"\"; flags = 0; flags.loopback = 1; ");
    for reg in 0..10 {
        let _ = write!(actions, "reg{reg} = 0; ");
    }
    let _ = write!(actions, "{REGBIT_EGRESS_LOOPBACK} = 1; next(pipeline=ingress, table=0); }};");

    lflows.add(
        rtr.key(),
        Stage::LrOutEgrLoop,
        100,
        format!(
            "{family}.dst == {} && outport == {} && is_chassis_resident({})",
            nat.external_ip,
            l3dgw.json_name,
            addresses::json_string(port)
        ),
        actions.into_string(),
    );
}

fn load_balancers(ctx: &Ctx, rtr: &Router, lflows: &mut LflowSet) {
    let dp = rtr.key();
    let controller_event = ctx
        .nb
        .global
        .options
        .get("controller_event")
        .is_some_and(|v| v == "true");

    for vip in &rtr.vips {
        let family = if vip.is_v6() { "ip6" } else { "ip4" };
        let hint = vip.lb.hint();

        lflows.add_hint(
            dp,
            Stage::LrInDefrag,
            100,
            format!("ip && {family}.dst == {}", vip.ip),
            "ct_next;",
            hint,
        );

        let mut vip_match = format!("ip && {family}.dst == {}", vip.ip);
        if let Some(port) = vip.port {
            let _ = write!(vip_match, " && {}.dst == {port}", vip.protocol_name());
        }

        let gateway_gate = match rtr.l3dgw {
            Some(l3dgw) => format!(
                " && inport == {}{}",
                l3dgw.json_name,
                rtr.redirect_residency()
            ),
            None => String::new(),
        };

        if vip.backends.is_empty() && controller_event {
            lflows.add_hint(
                dp,
                Stage::LrInDnat,
                130,
                format!("ct.new && {vip_match}{gateway_gate}"),
                format!(
                    "trigger_event(event = \"empty_lb_backends\", vip = \"{}\", \
                     protocol = \"{}\", load_balancer = \"{}\");",
                    vip.key(),
                    vip.protocol_name(),
                    vip.lb
                ),
                hint,
            );
            continue;
        }

        let priority = if vip.port.is_some() { 120 } else { 110 };
        let force_snat = match rtr.lb_force_snat.is_some() {
            true => "flags.force_snat_for_lb = 1; ",
            false => "",
        };

        lflows.add_hint(
            dp,
            Stage::LrInDnat,
            priority,
            format!("ct.new && {vip_match}{gateway_gate}"),
            format!("{force_snat}ct_lb({});", vip.backends),
            hint,
        );
        lflows.add_hint(
            dp,
            Stage::LrInDnat,
            priority,
            format!("ct.est && {vip_match}{gateway_gate}"),
            format!("{force_snat}ct_dnat;"),
            hint,
        );

        // On distributed routers, replies reverse the load-balancer NAT on
        // the gateway chassis.
        if let Some(l3dgw) = rtr.l3dgw {
            let mut backends = Ds::new();

            for backend in vip.backends.split(',').map(str::trim) {
                let Some((ip, port)) = crate::lb::parse_vip_key(backend) else {
                    continue;
                };

                match port {
                    Some(port) => {
                        let _ = write!(
                            backends,
                            "({family}.src == {ip} && {}.src == {port}) || ",
                            vip.protocol_name()
                        );
                    }
                    None => {
                        let _ = write!(backends, "{family}.src == {ip} || ");
                    }
                }
            }

            backends.chomp(" || ");

            if !backends.is_empty() {
                lflows.add_hint(
                    dp,
                    Stage::LrOutUndnat,
                    120,
                    format!(
                        "ip && ({backends}) && outport == {}{}",
                        l3dgw.json_name,
                        rtr.redirect_residency()
                    ),
                    format!("{force_snat}ct_dnat;"),
                    hint,
                );
            }
        }
    }
}

/// Ingress tables 7-8: IPv6 router advertisements.
fn nd_ra(ctx: &Ctx, rtr: &Router, lflows: &mut LflowSet) {
    let dp = rtr.key();

    lflows.add(dp, Stage::LrInNdRaOptions, 0, "1", "next;");
    lflows.add(dp, Stage::LrInNdRaResponse, 0, "1", "next;");

    for port in ctx.ports.on_dp(rtr.dp_ix) {
        if port.derived || !port.is_enabled(ctx.nb) {
            continue;
        }

        let Some(lrp) = port.lrp(ctx.nb) else { continue };
        let Some(networks) = port.networks() else { continue };

        let Some(mode) = lrp.ipv6_ra_configs.get("address_mode") else {
            continue;
        };

        if !["slaac", "dhcpv6_stateful", "dhcpv6_stateless"].contains(&mode.as_str()) {
            warn_rl!(
                ctx.warn.cfg,
                ctx.now,
                port = %port.name,
                mode = %mode,
                "unknown ipv6_ra_configs address_mode; skipping"
            );
            continue;
        }

        let globals: Vec<_> = networks
            .ipv6
            .iter()
            .filter(|n| !n.is_link_local())
            .collect();

        if globals.is_empty() {
            continue;
        }

        let hint = lrp.id.hint();
        let mut opts = Ds::new();
        let _ = write!(
            opts,
            "addr_mode = \"{mode}\", slla = {}",
            networks.ea
        );

        if let Some(mtu) = lrp
            .ipv6_ra_configs
            .get("mtu")
            .and_then(|m| m.parse::<u32>().ok())
            .filter(|&m| m >= 1280)
        {
            let _ = write!(opts, ", mtu = {mtu}");
        }

        // Prefixes are advertised unless addresses are centrally assigned.
        if mode != "dhcpv6_stateful" {
            for net in &globals {
                let _ = write!(opts, ", prefix = {}/{}", net.network(), net.plen);
            }
        }

        lflows.add_hint(
            dp,
            Stage::LrInNdRaOptions,
            50,
            format!(
                "inport == {} && ip6.dst == ff02::2 && nd_rs",
                port.json_name
            ),
            format!("{REGBIT_ND_RA_OPTS_RESULT} = put_nd_ra_opts({opts}); next;"),
            hint,
        );

        let lla = addresses::link_local_from_mac(networks.ea);

        lflows.add_hint(
            dp,
            Stage::LrInNdRaResponse,
            50,
            format!(
                "inport == {} && ip6.dst == ff02::2 && nd_rs && {REGBIT_ND_RA_OPTS_RESULT}",
                port.json_name
            ),
            format!(
                "eth.dst = eth.src; eth.src = {mac}; ip6.dst = ip6.src; ip6.src = {lla}; \
                 outport = inport; flags.loopback = 1; output;",
                mac = networks.ea
            ),
            hint,
        );
    }
}

/// One routing entry: destination (or source) prefix, next hop, output port.
struct Route {
    prefix: IpAddr,
    plen: u8,
    /// `None` for connected routes: the packet's own destination is the
    /// next hop.
    nexthop: Option<IpAddr>,
    out_port: usize,
    src_policy: bool,
    hint: u32,
}

impl Route {
    fn priority(&self) -> u16 {
        u16::from(self.plen) * 2 + if self.src_policy { 0 } else { 1 }
    }
}

/// Ingress table 9: longest-prefix-match routing, priority encoded.
fn routing(ctx: &Ctx, rtr: &Router, lflows: &mut LflowSet) {
    let dp = rtr.key();
    let mut routes = Vec::new();

    // Connected routes from every port's networks.
    for port in ctx.ports.on_dp(rtr.dp_ix) {
        if port.derived || !port.is_enabled(ctx.nb) {
            continue;
        }

        let Some(networks) = port.networks() else { continue };
        let Some(out_port) = ctx.ports.index_of(&port.name) else {
            continue;
        };
        let hint = port.lrp(ctx.nb).map(|lrp| lrp.id.hint()).unwrap_or(0);

        for net in &networks.ipv4 {
            routes.push(Route {
                prefix: IpAddr::V4(net.network()),
                plen: net.plen,
                nexthop: None,
                out_port,
                src_policy: false,
                hint,
            });
        }

        for net in &networks.ipv6 {
            routes.push(Route {
                prefix: IpAddr::V6(net.network()),
                plen: net.plen,
                nexthop: None,
                out_port,
                src_policy: false,
                hint,
            });
        }
    }

    // Static routes.
    for route in &rtr.lr.static_routes {
        let Some((prefix, plen)) = parse_prefix(&route.ip_prefix) else {
            warn_rl!(
                ctx.warn.cfg,
                ctx.now,
                router = %rtr.lr.name,
                prefix = %route.ip_prefix,
                "static route with unparsable prefix; skipping"
            );
            continue;
        };

        let Ok(nexthop) = route.nexthop.parse::<IpAddr>() else {
            warn_rl!(
                ctx.warn.cfg,
                ctx.now,
                router = %rtr.lr.name,
                nexthop = %route.nexthop,
                "static route with unparsable next hop; skipping"
            );
            continue;
        };

        if prefix.is_ipv4() != nexthop.is_ipv4() {
            warn_rl!(
                ctx.warn.cfg,
                ctx.now,
                router = %rtr.lr.name,
                prefix = %route.ip_prefix,
                "static route mixes address families; skipping"
            );
            continue;
        }

        let out_port = match &route.output_port {
            Some(name) => {
                let found = ctx
                    .ports
                    .index_of(name)
                    .filter(|&ix| ctx.ports.items[ix].dp == rtr.dp_ix);

                match found {
                    Some(ix) => Some(ix),
                    None => {
                        warn_rl!(
                            ctx.warn.cfg,
                            ctx.now,
                            router = %rtr.lr.name,
                            output_port = %name,
                            "static route names a nonexistent output port; skipping"
                        );
                        None
                    }
                }
            }
            None => find_port_for_nexthop(ctx, rtr, nexthop).or_else(|| {
                warn_rl!(
                    ctx.warn.cfg,
                    ctx.now,
                    router = %rtr.lr.name,
                    nexthop = %route.nexthop,
                    "no router port covers the next hop; skipping route"
                );
                None
            }),
        };

        let Some(out_port) = out_port else { continue };

        routes.push(Route {
            prefix,
            plen,
            nexthop: Some(nexthop),
            out_port,
            src_policy: route.policy == Some(RoutePolicy::SrcIp),
            hint: 0,
        });
    }

    for route in &routes {
        emit_route(ctx, rtr, route, lflows);
    }

    // Multicast relay bypasses the LPM layer.
    let relays = rtr.dp.mcast_rtr.is_some_and(|m| m.relay);

    if relays {
        for &group_ix in &ctx.mcast.per_dp[rtr.dp_ix].groups {
            let group = &ctx.mcast.groups[group_ix];
            let match_ = match group.v4 {
                Some(v4) => format!("ip4 && ip4.dst == {v4}"),
                None => format!("ip6 && ip6.dst == {}", group.name),
            };

            lflows.add(
                dp,
                Stage::LrInIpRouting,
                500,
                match_,
                format!("ip.ttl--; outport = \"{}\"; output;", group.name),
            );
        }

        let flood_static = rtr.dp.mcast_rtr.is_some_and(|m| m.flood_static);

        if flood_static && !ctx.mcast.per_dp[rtr.dp_ix].flood_ports.is_empty() {
            lflows.add(
                dp,
                Stage::LrInIpRouting,
                450,
                "ip4.mcast || ip6.mcast",
                format!("ip.ttl--; outport = \"{MC_STATIC}\"; output;"),
            );
        }
    }
}

fn parse_prefix(s: &str) -> Option<(IpAddr, u8)> {
    match s.split_once('/') {
        Some((ip, plen)) => {
            let ip = ip.parse::<IpAddr>().ok()?;
            let plen = plen.parse::<u8>().ok()?;
            let max = if ip.is_ipv4() { 32 } else { 128 };

            (plen <= max).then_some((mask_prefix(ip, plen), plen))
        }
        None => {
            let ip = s.parse::<IpAddr>().ok()?;
            let plen = if ip.is_ipv4() { 32 } else { 128 };

            Some((ip, plen))
        }
    }
}

fn mask_prefix(ip: IpAddr, plen: u8) -> IpAddr {
    match ip {
        IpAddr::V4(v4) => {
            let mask = if plen == 0 { 0 } else { u32::MAX << (32 - plen) };
            IpAddr::V4(Ipv4Addr::from(u32::from(v4) & mask))
        }
        IpAddr::V6(v6) => {
            let mask = if plen == 0 { 0 } else { u128::MAX << (128 - plen) };
            IpAddr::V6(Ipv6Addr::from(u128::from(v6) & mask))
        }
    }
}

/// The router port whose connected networks contain `nexthop`.
fn find_port_for_nexthop(ctx: &Ctx, rtr: &Router, nexthop: IpAddr) -> Option<usize> {
    ctx.ports
        .on_dp(rtr.dp_ix)
        .filter(|p| !p.derived)
        .find_map(|p| {
            let networks = p.networks()?;

            let covered = match nexthop {
                IpAddr::V4(v4) => networks.ipv4.iter().any(|n| n.contains(v4)),
                IpAddr::V6(v6) => networks.ipv6.iter().any(|n| n.contains(v6)),
            };

            covered.then(|| ctx.ports.index_of(&p.name))?
        })
}

/// The port address used as the source of ARP requests for this route.
fn route_src_address(networks: &LportAddresses, gateway: Option<IpAddr>) -> Option<String> {
    match gateway {
        Some(IpAddr::V4(v4)) => networks
            .ipv4
            .iter()
            .find(|n| n.contains(v4))
            .or(networks.ipv4.first())
            .map(|n| n.addr.to_string()),
        Some(IpAddr::V6(v6)) => networks
            .ipv6
            .iter()
            .find(|n| n.contains(v6))
            .or(networks.ipv6.first())
            .map(|n| n.addr.to_string()),
        None => None,
    }
}

fn emit_route(ctx: &Ctx, rtr: &Router, route: &Route, lflows: &mut LflowSet) {
    let port = &ctx.ports.items[route.out_port];
    let Some(networks) = port.networks() else { return };

    let is_v6 = route.prefix.is_ipv6();
    let (field, reg_next, reg_src) = match is_v6 {
        false => ("ip4", "reg0", "reg1"),
        true => ("ip6", "xxreg0", "xxreg1"),
    };
    let dir = if route.src_policy { "src" } else { "dst" };

    let mut match_ = String::new();

    // Link-local destinations are only meaningful relative to the ingress
    // port.
    let link_local = matches!(route.prefix, IpAddr::V6(v6) if (u128::from(v6) >> 118) == 0x3fa);

    if link_local {
        let _ = write!(match_, "inport == {} && ", port.json_name);
    }

    let _ = write!(match_, "{field}.{dir} == {}/{}", route.prefix, route.plen);

    let src_addr = match route.nexthop {
        Some(nexthop) => route_src_address(networks, Some(nexthop)),
        None => route_src_address(
            networks,
            Some(match is_v6 {
                false => IpAddr::V4(match route.prefix {
                    IpAddr::V4(v4) => v4,
                    IpAddr::V6(_) => unreachable!(),
                }),
                true => route.prefix,
            }),
        ),
    };

    let Some(src_addr) = src_addr else { return };

    let next = match route.nexthop {
        Some(nexthop) => nexthop.to_string(),
        None => format!("{field}.dst"),
    };

    lflows.add_hint(
        rtr.key(),
        Stage::LrInIpRouting,
        route.priority(),
        match_,
        format!(
            "ip.ttl--; {reg_next} = {next}; {reg_src} = {src_addr}; eth.src = {}; \
             outport = {}; flags.loopback = 1; next;",
            networks.ea, port.json_name
        ),
        route.hint,
    );
}

/// Ingress table 10: policy-based routing.
fn policies(ctx: &Ctx, rtr: &Router, lflows: &mut LflowSet) {
    let dp = rtr.key();

    lflows.add(dp, Stage::LrInPolicy, 0, "1", "next;");

    for policy in &rtr.lr.policies {
        if !(0..=32767).contains(&policy.priority) {
            warn_rl!(
                ctx.warn.cfg,
                ctx.now,
                router = %rtr.lr.name,
                priority = policy.priority,
                "routing policy priority out of range; skipping"
            );
            continue;
        }

        let priority = policy.priority as u16;

        match policy.action {
            PolicyAction::Allow => {
                lflows.add(dp, Stage::LrInPolicy, priority, policy.match_.clone(), "next;");
            }
            PolicyAction::Drop => {
                lflows.add(dp, Stage::LrInPolicy, priority, policy.match_.clone(), "drop;");
            }
            PolicyAction::Reroute => {
                let Some(nexthop) = policy
                    .nexthop
                    .as_deref()
                    .and_then(|n| n.parse::<IpAddr>().ok())
                else {
                    warn_rl!(
                        ctx.warn.cfg,
                        ctx.now,
                        router = %rtr.lr.name,
                        "reroute policy without a valid next hop; skipping"
                    );
                    continue;
                };

                // The next hop must be reachable through one of the router's
                // own networks.
                let Some(out_port) = find_port_for_nexthop(ctx, rtr, nexthop) else {
                    warn_rl!(
                        ctx.warn.cfg,
                        ctx.now,
                        router = %rtr.lr.name,
                        nexthop = %nexthop,
                        "reroute next hop is not on a connected network; skipping"
                    );
                    continue;
                };

                let port = &ctx.ports.items[out_port];
                let networks = port.networks().expect("router ports have networks");
                let Some(src_addr) = route_src_address(networks, Some(nexthop)) else {
                    continue;
                };
                let (reg_next, reg_src) = match nexthop.is_ipv6() {
                    false => ("reg0", "reg1"),
                    true => ("xxreg0", "xxreg1"),
                };

                lflows.add(
                    dp,
                    Stage::LrInPolicy,
                    priority,
                    policy.match_.clone(),
                    format!(
                        "{reg_next} = {nexthop}; {reg_src} = {src_addr}; eth.src = {}; \
                         outport = {}; flags.loopback = 1; next;",
                        networks.ea, port.json_name
                    ),
                );
            }
        }
    }
}

/// Ingress table 11: ARP/ND resolution from the mac-binding cache, with
/// static shortcuts for neighbors known at build time.
fn arp_resolve(ctx: &Ctx, rtr: &Router, lflows: &mut LflowSet) {
    let dp = rtr.key();

    lflows.add(dp, Stage::LrInArpResolve, 500, "ip4.mcast || ip6.mcast", "next;");
    lflows.add(dp, Stage::LrInArpResolve, 0, "ip4", "get_arp(outport, reg0); next;");
    lflows.add(dp, Stage::LrInArpResolve, 0, "ip6", "get_nd(outport, xxreg0); next;");

    for port in ctx.ports.on_dp(rtr.dp_ix) {
        if port.derived {
            continue;
        }

        let Some(peer_ix) = port.peer else { continue };
        let peer = &ctx.ports.items[peer_ix];

        match peer.source {
            // Router-to-router links resolve to the peer port directly.
            PortSource::Lrp { .. } => {
                let Some(peer_networks) = peer.networks() else {
                    continue;
                };

                for net in &peer_networks.ipv4 {
                    lflows.add(
                        dp,
                        Stage::LrInArpResolve,
                        100,
                        format!("outport == {} && reg0 == {}", port.json_name, net.addr),
                        format!("eth.dst = {}; next;", peer_networks.ea),
                    );
                }

                for net in &peer_networks.ipv6 {
                    lflows.add(
                        dp,
                        Stage::LrInArpResolve,
                        100,
                        format!("outport == {} && xxreg0 == {}", port.json_name, net.addr),
                        format!("eth.dst = {}; next;", peer_networks.ea),
                    );
                }
            }
            // Addresses known on the attached switch at build time resolve
            // without ARPing: static hosts and the other routers' ports.
            PortSource::Lsp { .. } => {
                for lsp_port in ctx.ports.on_dp(peer.dp) {
                    if std::ptr::eq(lsp_port, peer) {
                        continue;
                    }

                    for addrs in &lsp_port.addresses {
                        for net in &addrs.ipv4 {
                            lflows.add(
                                dp,
                                Stage::LrInArpResolve,
                                100,
                                format!("outport == {} && reg0 == {}", port.json_name, net.addr),
                                format!("eth.dst = {}; next;", addrs.ea),
                            );
                        }

                        for net in &addrs.ipv6 {
                            lflows.add(
                                dp,
                                Stage::LrInArpResolve,
                                100,
                                format!(
                                    "outport == {} && xxreg0 == {}",
                                    port.json_name, net.addr
                                ),
                                format!("eth.dst = {}; next;", addrs.ea),
                            );
                        }
                    }
                }
            }
            PortSource::Redirect { .. } => {}
        }
    }
}

/// Ingress tables 12-13: oversized-packet handling toward the gateway.
fn packet_length(ctx: &Ctx, rtr: &Router, lflows: &mut LflowSet) {
    let dp = rtr.key();

    lflows.add(dp, Stage::LrInChkPktLen, 0, "1", "next;");
    lflows.add(dp, Stage::LrInLargerPkts, 0, "1", "next;");

    let Some(l3dgw) = rtr.l3dgw else { return };
    let Some(mtu) = l3dgw
        .lrp(ctx.nb)
        .and_then(|lrp| lrp.options.get("gateway_mtu"))
        .and_then(|m| m.parse::<u32>().ok())
    else {
        return;
    };

    lflows.add(
        dp,
        Stage::LrInChkPktLen,
        50,
        format!("outport == {}", l3dgw.json_name),
        format!("{REGBIT_PKT_LARGER} = check_pkt_larger({mtu}); next;"),
    );

    // Ethernet plus VLAN overhead.
    let frag_mtu = mtu.saturating_sub(18);

    for port in ctx.ports.on_dp(rtr.dp_ix) {
        if port.derived || std::ptr::eq(port, l3dgw) || !port.is_enabled(ctx.nb) {
            continue;
        }

        let Some(networks) = port.networks() else { continue };
        let Some(src) = networks.ipv4.first() else { continue };

        lflows.add(
            dp,
            Stage::LrInLargerPkts,
            50,
            format!(
                "inport == {} && outport == {} && ip4 && {REGBIT_PKT_LARGER}",
                port.json_name, l3dgw.json_name
            ),
            format!(
                "icmp4 {{ icmp4.type = 3; icmp4.code = 4; icmp4.frag_mtu = {frag_mtu}; \
                 eth.dst = {mac}; ip4.dst = ip4.src; ip4.src = {src}; ip.ttl = 255; \
                 {REGBIT_EGRESS_LOOPBACK} = 1; next(pipeline=ingress, table=0); }};",
                mac = networks.ea,
                src = src.addr
            ),
        );
    }
}

/// Ingress table 14: steer gateway-bound traffic to the redirect port.
fn gateway_redirect(rtr: &Router, lflows: &mut LflowSet) {
    let dp = rtr.key();

    lflows.add(dp, Stage::LrInGwRedirect, 0, "1", "next;");

    let (Some(l3dgw), Some(redirect)) = (rtr.l3dgw, rtr.redirect) else {
        return;
    };

    lflows.add(
        dp,
        Stage::LrInGwRedirect,
        200,
        format!("{REGBIT_NAT_REDIRECT} == 1"),
        format!("outport = {}; next;", redirect.json_name),
    );

    // Unresolved destinations centralize so ARP is emitted on the gateway.
    lflows.add(
        dp,
        Stage::LrInGwRedirect,
        150,
        format!(
            "outport == {} && eth.dst == {ETH_ZERO}",
            l3dgw.json_name
        ),
        format!("outport = {}; next;", redirect.json_name),
    );

    // Distributed NAT traffic stays on the chassis owning the NAT.
    for nat in rtr.nats.iter().filter(|nat| nat.distributed) {
        lflows.add(
            dp,
            Stage::LrInGwRedirect,
            100,
            format!(
                "{}.src == {} && outport == {}",
                nat.family(),
                nat.logical_ip,
                l3dgw.json_name
            ),
            "next;",
        );
    }

    lflows.add(
        dp,
        Stage::LrInGwRedirect,
        50,
        format!("outport == {}", l3dgw.json_name),
        format!("outport = {}; next;", redirect.json_name),
    );
}

/// Ingress table 15: originate ARP/ND for unresolved next hops.
fn arp_request(rtr: &Router, lflows: &mut LflowSet) {
    let dp = rtr.key();

    lflows.add(dp, Stage::LrInArpRequest, 0, "1", "output;");

    // Static-route next hops get a properly targeted solicitation.
    for route in &rtr.lr.static_routes {
        let Ok(IpAddr::V6(nexthop)) = route.nexthop.parse::<IpAddr>() else {
            continue;
        };

        let sn = addresses::solicited_node(nexthop);

        lflows.add(
            dp,
            Stage::LrInArpRequest,
            200,
            format!("eth.dst == {ETH_ZERO} && ip6 && xxreg0 == {nexthop}"),
            format!(
                "nd_ns {{ eth.dst = {}; ip6.dst = {sn}; nd.target = {nexthop}; output; }};",
                addresses::solicited_node_mac(nexthop)
            ),
        );
    }

    lflows.add(
        dp,
        Stage::LrInArpRequest,
        100,
        format!("eth.dst == {ETH_ZERO} && ip4"),
        "arp { eth.dst = ff:ff:ff:ff:ff:ff; arp.spa = reg1; arp.tpa = reg0; arp.op = 1; \
         output; };",
    );
    lflows.add(
        dp,
        Stage::LrInArpRequest,
        100,
        format!("eth.dst == {ETH_ZERO} && ip6"),
        "nd_ns { nd.target = xxreg0; output; };",
    );
}

/// Egress table 3: delivery.
fn delivery(ctx: &Ctx, rtr: &Router, lflows: &mut LflowSet) {
    let dp = rtr.key();
    let relays = rtr.dp.mcast_rtr.is_some_and(|m| m.relay);

    for port in ctx.ports.on_dp(rtr.dp_ix) {
        // Chassis-redirect ports never receive egress traffic.
        if port.derived || !port.is_enabled(ctx.nb) {
            continue;
        }

        let hint = port.lrp(ctx.nb).map(|lrp| lrp.id.hint()).unwrap_or(0);

        if relays {
            let mac = port.networks().map(|n| n.ea).unwrap_or(EthAddr::ZERO);

            lflows.add_hint(
                dp,
                Stage::LrOutDelivery,
                110,
                format!(
                    "(ip4.mcast || ip6.mcast) && outport == {}",
                    port.json_name
                ),
                format!("eth.src = {mac}; output;"),
                hint,
            );
        }

        lflows.add_hint(
            dp,
            Stage::LrOutDelivery,
            100,
            format!("outport == {}", port.json_name),
            "output;",
            hint,
        );
    }
}
