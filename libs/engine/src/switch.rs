//! The logical-switch pipeline generator: 18 ingress and 10 egress stages
//! per switch datapath.

use crate::addresses::LportAddresses;
use crate::datapath::{Datapath, DpKind};
use crate::lb::Vip;
use crate::lflow::{
    value_list, Ds, LflowSet, Stage, REGBIT_CONNTRACK_COMMIT, REGBIT_CONNTRACK_DEFRAG,
    REGBIT_CONNTRACK_NAT, REGBIT_DHCP_OPTS_RESULT, REGBIT_DNS_LOOKUP_RESULT,
};
use crate::mcast::{MC_FLOOD, MC_MROUTER_FLOOD, MC_STATIC, MC_UNKNOWN};
use crate::port::Port;
use crate::ratelimit::warn_rl;
use crate::Ctx;
use itertools::Itertools as _;
use northd_model::nb::{Acl, AclAction, AclDirection, LogicalSwitch, LspType};
use std::fmt::Write as _;

/// User ACL priorities are offset so engine-reserved priorities stay above
/// them.
const ACL_PRIORITY_OFFSET: u16 = 1000;

pub(crate) fn build_lswitch_flows(ctx: &Ctx, lflows: &mut LflowSet) {
    for (dp_ix, dp) in ctx.datapaths.items.iter().enumerate() {
        if dp.kind != DpKind::Switch {
            continue;
        }

        let ls = ctx.ls(dp);
        let acls = ctx.switch_acls(dp_ix, ls);
        let has_stateful = acls.iter().any(|a| a.action == AclAction::AllowRelated);
        let (vips, bad_vips) = crate::lb::collect_vips(
            ls.load_balancer.iter().filter_map(|id| ctx.lbs.get(id).copied()),
        );

        for key in bad_vips {
            warn_rl!(ctx.warn.cfg, ctx.now, switch = %ls.name, vip = %key, "ignoring unparsable VIP");
        }

        admission(ctx, dp, dp_ix, lflows);
        port_security(ctx, dp, dp_ix, lflows);
        pre_acls(ctx, dp, dp_ix, has_stateful, lflows);
        pre_lb(dp, &vips, lflows);
        pre_stateful(dp, lflows);
        build_acls(ctx, dp, ls, &acls, has_stateful, lflows);
        qos(ctx, dp, ls, lflows);
        lb(dp, &vips, lflows);
        stateful(ctx, dp, &vips, lflows);
        arp_nd_responder(ctx, dp, dp_ix, lflows);
        dhcp(ctx, dp, dp_ix, lflows);
        dns_lookup(ctx, dp, ls, lflows);
        external_ports(ctx, dp, dp_ix, lflows);
        l2_lookup(ctx, dp, dp_ix, lflows);
    }
}

/// Ingress table 0: admission control and L2 port security.
fn admission(ctx: &Ctx, dp: &Datapath, dp_ix: usize, lflows: &mut LflowSet) {
    lflows.add(dp.key, Stage::LsInPortSecL2, 100, "vlan.present", "drop;");
    lflows.add(dp.key, Stage::LsInPortSecL2, 100, "eth.src[40]", "drop;");

    for port in ctx.ports.on_dp(dp_ix) {
        let Some(lsp) = port.lsp(ctx.nb) else { continue };

        if !lsp.is_enabled() || lsp.port_type == LspType::External {
            continue;
        }

        let mut match_ = format!("inport == {}", port.json_name);

        if !port.ps.is_empty() {
            let macs = value_list(port.ps.iter().map(|a| a.ea));
            let _ = write!(match_, " && eth.src == {macs}");
        }

        let actions = match port.queue_id {
            Some(queue) => format!("set_queue({queue}); next;"),
            None => "next;".to_owned(),
        };

        lflows.add_hint(dp.key, Stage::LsInPortSecL2, 50, match_, actions, lsp.id.hint());
    }
}

fn ipv4_src_list(addrs: &LportAddresses) -> String {
    value_list(addrs.ipv4.iter().map(|net| match net.plen {
        32 => net.addr.to_string(),
        _ => net.to_string(),
    }))
}

/// Ingress tables 1-2 and egress table 8: L3 and ND port security.
fn port_security(ctx: &Ctx, dp: &Datapath, dp_ix: usize, lflows: &mut LflowSet) {
    lflows.add(dp.key, Stage::LsInPortSecIp, 0, "1", "next;");
    lflows.add(dp.key, Stage::LsInPortSecNd, 0, "1", "next;");
    lflows.add(dp.key, Stage::LsOutPortSecIp, 0, "1", "next;");

    for port in ctx.ports.on_dp(dp_ix) {
        let Some(lsp) = port.lsp(ctx.nb) else { continue };

        if !lsp.is_enabled() || port.ps.is_empty() {
            continue;
        }

        let hint = lsp.id.hint();

        // ND security applies to every entry, address-restricted or not.
        for entry in &port.ps {
            let mut arp = format!(
                "inport == {} && eth.src == {} && arp.sha == {}",
                port.json_name, entry.ea, entry.ea
            );

            if !entry.ipv4.is_empty() {
                let _ = write!(arp, " && arp.spa == {}", ipv4_src_list(entry));
            }

            lflows.add_hint(dp.key, Stage::LsInPortSecNd, 90, arp, "next;", hint);

            let mut nd = format!(
                "inport == {} && eth.src == {} && ip6 && nd && \
                 ((nd.sll == 00:00:00:00:00:00 || nd.sll == {}) || \
                 ((nd.tll == 00:00:00:00:00:00 || nd.tll == {})))",
                port.json_name, entry.ea, entry.ea, entry.ea
            );

            if !entry.ipv6.is_empty() {
                let lla = crate::addresses::link_local_from_mac(entry.ea);
                let targets = value_list(
                    std::iter::once(lla.to_string())
                        .chain(entry.ipv6.iter().map(|n| n.addr.to_string())),
                );
                let _ = write!(nd, " && (nd.target == {targets})");
            }

            lflows.add_hint(dp.key, Stage::LsInPortSecNd, 90, nd, "next;", hint);
        }

        lflows.add_hint(
            dp.key,
            Stage::LsInPortSecNd,
            80,
            format!("inport == {} && (arp || nd)", port.json_name),
            "drop;",
            hint,
        );

        // IP security only for entries that restrict addresses.
        if !port.ps.iter().any(|e| e.has_ip()) {
            continue;
        }

        for entry in port.ps.iter().filter(|e| e.has_ip()) {
            if !entry.ipv4.is_empty() {
                lflows.add_hint(
                    dp.key,
                    Stage::LsInPortSecIp,
                    90,
                    format!(
                        "inport == {} && eth.src == {} && ip4.src == {}",
                        port.json_name,
                        entry.ea,
                        ipv4_src_list(entry)
                    ),
                    "next;",
                    hint,
                );

                // DHCP discovery is sent from the unspecified address.
                lflows.add_hint(
                    dp.key,
                    Stage::LsInPortSecIp,
                    90,
                    format!(
                        "inport == {} && eth.src == {} && ip4.src == 0.0.0.0 && \
                         ip4.dst == 255.255.255.255 && udp.src == 68 && udp.dst == 67",
                        port.json_name, entry.ea
                    ),
                    "next;",
                    hint,
                );

                let dsts = value_list(
                    ["255.255.255.255".to_owned(), "224.0.0.0/4".to_owned()]
                        .into_iter()
                        .chain(entry.ipv4.iter().map(|n| match n.plen {
                            32 => n.addr.to_string(),
                            _ => n.to_string(),
                        })),
                );

                lflows.add_hint(
                    dp.key,
                    Stage::LsOutPortSecIp,
                    90,
                    format!(
                        "outport == {} && eth.dst == {} && ip4.dst == {dsts}",
                        port.json_name, entry.ea
                    ),
                    "next;",
                    hint,
                );
            }

            if !entry.ipv6.is_empty() {
                let lla = crate::addresses::link_local_from_mac(entry.ea);
                let srcs = value_list(
                    ["::".to_owned(), lla.to_string()]
                        .into_iter()
                        .chain(entry.ipv6.iter().map(|n| match n.plen {
                            128 => n.addr.to_string(),
                            _ => n.to_string(),
                        })),
                );

                lflows.add_hint(
                    dp.key,
                    Stage::LsInPortSecIp,
                    90,
                    format!(
                        "inport == {} && eth.src == {} && ip6.src == {srcs}",
                        port.json_name, entry.ea
                    ),
                    "next;",
                    hint,
                );

                let dsts = value_list(
                    ["ff00::/8".to_owned(), lla.to_string()]
                        .into_iter()
                        .chain(entry.ipv6.iter().map(|n| match n.plen {
                            128 => n.addr.to_string(),
                            _ => n.to_string(),
                        })),
                );

                lflows.add_hint(
                    dp.key,
                    Stage::LsOutPortSecIp,
                    90,
                    format!(
                        "outport == {} && eth.dst == {} && ip6.dst == {dsts}",
                        port.json_name, entry.ea
                    ),
                    "next;",
                    hint,
                );
            }
        }

        let macs = value_list(port.ps.iter().map(|e| e.ea));

        lflows.add_hint(
            dp.key,
            Stage::LsInPortSecIp,
            80,
            format!("inport == {} && eth.src == {macs} && ip", port.json_name),
            "drop;",
            hint,
        );
        lflows.add_hint(
            dp.key,
            Stage::LsOutPortSecIp,
            80,
            format!("outport == {} && eth.dst == {macs} && ip", port.json_name),
            "drop;",
            hint,
        );
    }
}

/// Ingress table 3, egress table 1: conntrack-defrag marking ahead of
/// stateful ACLs.
fn pre_acls(ctx: &Ctx, dp: &Datapath, dp_ix: usize, has_stateful: bool, lflows: &mut LflowSet) {
    lflows.add(dp.key, Stage::LsInPreAcl, 0, "1", "next;");
    lflows.add(dp.key, Stage::LsOutPreAcl, 0, "1", "next;");

    if !has_stateful {
        return;
    }

    // Traffic entering or leaving through a router or localnet port would
    // otherwise be conntracked in two zones.
    for port in ctx.ports.on_dp(dp_ix) {
        if !matches!(
            port.lsp_type(ctx.nb),
            Some(LspType::Router | LspType::Localnet)
        ) {
            continue;
        }

        lflows.add(
            dp.key,
            Stage::LsInPreAcl,
            110,
            format!("ip && inport == {}", port.json_name),
            "next;",
        );
        lflows.add(
            dp.key,
            Stage::LsOutPreAcl,
            110,
            format!("ip && outport == {}", port.json_name),
            "next;",
        );
    }

    lflows.add(dp.key, Stage::LsInPreAcl, 110, "nd || nd_rs || nd_ra", "next;");
    lflows.add(dp.key, Stage::LsOutPreAcl, 110, "nd || nd_rs || nd_ra", "next;");

    let mark = format!("{REGBIT_CONNTRACK_DEFRAG} = 1; next;");
    lflows.add(dp.key, Stage::LsInPreAcl, 100, "ip", mark.clone());
    lflows.add(dp.key, Stage::LsOutPreAcl, 100, "ip", mark);
}

/// Ingress table 4, egress table 0: defrag marking for load-balanced
/// traffic.
fn pre_lb(dp: &Datapath, vips: &[Vip], lflows: &mut LflowSet) {
    lflows.add(dp.key, Stage::LsInPreLb, 0, "1", "next;");
    lflows.add(dp.key, Stage::LsOutPreLb, 0, "1", "next;");

    lflows.add(dp.key, Stage::LsInPreLb, 110, "nd || nd_rs || nd_ra", "next;");
    lflows.add(dp.key, Stage::LsOutPreLb, 110, "nd || nd_rs || nd_ra", "next;");

    let mark = format!("{REGBIT_CONNTRACK_DEFRAG} = 1; next;");

    for vip in vips {
        let field = if vip.is_v6() { "ip6" } else { "ip4" };

        lflows.add_hint(
            dp.key,
            Stage::LsInPreLb,
            100,
            format!("ip && {field}.dst == {}", vip.ip),
            mark.clone(),
            vip.lb.hint(),
        );
    }

    if !vips.is_empty() {
        lflows.add(dp.key, Stage::LsOutPreLb, 100, "ip", mark);
    }
}

/// Ingress table 5, egress table 2: send marked traffic through conntrack.
fn pre_stateful(dp: &Datapath, lflows: &mut LflowSet) {
    lflows.add(dp.key, Stage::LsInPreStateful, 0, "1", "next;");
    lflows.add(dp.key, Stage::LsOutPreStateful, 0, "1", "next;");

    let match_ = format!("{REGBIT_CONNTRACK_DEFRAG} == 1");
    lflows.add(dp.key, Stage::LsInPreStateful, 100, match_.clone(), "ct_next;");
    lflows.add(dp.key, Stage::LsOutPreStateful, 100, match_, "ct_next;");
}

fn acl_log_prefix(acl: &Acl) -> String {
    if !acl.log {
        return String::new();
    }

    let mut log = Ds::new();
    log.put("log(");

    if let Some(name) = &acl.name {
        let _ = write!(log, "name=\"{name}\", ");
    }

    let verdict = match acl.action {
        AclAction::Allow | AclAction::AllowRelated => "allow",
        AclAction::Drop => "drop",
        AclAction::Reject => "reject",
    };
    let _ = write!(log, "verdict={verdict}, ");

    if let Some(severity) = &acl.severity {
        let _ = write!(log, "severity={severity}, ");
    }

    if let Some(meter) = &acl.meter {
        let _ = write!(log, "meter=\"{meter}\", ");
    }

    log.chomp(", ");
    log.put("); ");

    log.into_string()
}

/// Ingress table 6, egress table 4: user ACLs plus the reserved stateful
/// plumbing at the top of the priority space.
fn build_acls(
    ctx: &Ctx,
    dp: &Datapath,
    ls: &LogicalSwitch,
    acls: &[&Acl],
    has_stateful: bool,
    lflows: &mut LflowSet,
) {
    lflows.add(dp.key, Stage::LsInAcl, 0, "1", "next;");
    lflows.add(dp.key, Stage::LsOutAcl, 0, "1", "next;");

    if has_stateful {
        for stage in [Stage::LsInAcl, Stage::LsOutAcl] {
            // Commit new connections so replies are recognized even before
            // any allow-related ACL matches them.
            lflows.add(
                dp.key,
                stage,
                1,
                "ip && (!ct.est || (ct.est && ct_label.blocked == 1))",
                format!("{REGBIT_CONNTRACK_COMMIT} = 1; next;"),
            );

            // Universal patterns at the top of the priority space.
            lflows.add(
                dp.key,
                stage,
                u16::MAX,
                "ct.inv || (ct.est && ct.rpl && ct_label.blocked == 1)",
                "drop;",
            );
            lflows.add(
                dp.key,
                stage,
                u16::MAX,
                "ct.est && !ct.rel && !ct.new && !ct.inv && ct.rpl && ct_label.blocked == 0",
                "next;",
            );
            lflows.add(
                dp.key,
                stage,
                u16::MAX,
                "!ct.est && ct.rel && !ct.new && !ct.inv && ct_label.blocked == 0",
                "next;",
            );
            lflows.add(dp.key, stage, u16::MAX, "nd || nd_ra || nd_rs", "next;");
        }
    }

    for acl in acls {
        consider_acl(ctx, dp, ls, acl, has_stateful, lflows);
    }
}

fn consider_acl(
    ctx: &Ctx,
    dp: &Datapath,
    ls: &LogicalSwitch,
    acl: &Acl,
    has_stateful: bool,
    lflows: &mut LflowSet,
) {
    if !(0..=32767).contains(&acl.priority) {
        warn_rl!(
            ctx.warn.cfg,
            ctx.now,
            switch = %ls.name,
            priority = acl.priority,
            "ACL priority out of range; skipping"
        );
        return;
    }

    let stage = match acl.direction {
        AclDirection::FromLport => Stage::LsInAcl,
        AclDirection::ToLport => Stage::LsOutAcl,
    };
    let priority = acl.priority as u16 + ACL_PRIORITY_OFFSET;
    let log = acl_log_prefix(acl);
    let hint = acl.id.hint();

    match acl.action {
        AclAction::Allow | AclAction::AllowRelated if !has_stateful => {
            lflows.add_hint(dp.key, stage, priority, acl.match_.clone(), format!("{log}next;"), hint);
        }
        AclAction::Allow | AclAction::AllowRelated => {
            // Commit on new (or previously blocked) connections; pass
            // established traffic of this ACL straight through.
            lflows.add_hint(
                dp.key,
                stage,
                priority,
                format!(
                    "((ct.new && !ct.est) || (!ct.new && ct.est && !ct.rpl && \
                     ct_label.blocked == 1)) && ({})",
                    acl.match_
                ),
                format!("{log}{REGBIT_CONNTRACK_COMMIT} = 1; next;"),
                hint,
            );
            lflows.add_hint(
                dp.key,
                stage,
                priority,
                format!(
                    "(!ct.new && ct.est && !ct.rpl && ct_label.blocked == 0) && ({})",
                    acl.match_
                ),
                format!("{log}next;"),
                hint,
            );
        }
        AclAction::Drop | AclAction::Reject if !has_stateful => {
            if acl.action == AclAction::Reject {
                reject_flows(dp, stage, priority, acl, &log, "", lflows);
            } else {
                lflows.add_hint(dp.key, stage, priority, acl.match_.clone(), format!("{log}drop;"), hint);
            }
        }
        AclAction::Drop | AclAction::Reject => {
            let new_match = format!(
                "((ct.new && !ct.est) || (!ct.new && ct.est && !ct.rpl && \
                 ct_label.blocked == 1)) && ({})",
                acl.match_
            );

            if acl.action == AclAction::Reject {
                reject_flows(dp, stage, priority, acl, &log, "ct_commit(ct_label=1/1); ", lflows);
            } else {
                lflows.add_hint(dp.key, stage, priority, new_match, format!("{log}drop;"), hint);
            }

            // Block the established connection so replies stop flowing.
            lflows.add_hint(
                dp.key,
                stage,
                priority,
                format!("ct.est && ct_label.blocked == 0 && ({})", acl.match_),
                format!("{log}ct_commit(ct_label=1/1);"),
                hint,
            );
        }
    }
}

/// `reject` synthesizes a TCP reset for TCP traffic and an ICMP unreachable
/// for everything else, swapping L2/L3 addresses and inverting the ports.
fn reject_flows(
    dp: &Datapath,
    stage: Stage,
    priority: u16,
    acl: &Acl,
    log: &str,
    commit: &str,
    lflows: &mut LflowSet,
) {
    let hint = acl.id.hint();

    let stateful_guard = match commit.is_empty() {
        true => String::new(),
        false => "((ct.new && !ct.est) || (!ct.new && ct.est && !ct.rpl && \
                  ct_label.blocked == 1)) && "
            .to_owned(),
    };

    for ip in ["ip4", "ip6"] {
        lflows.add_hint(
            dp.key,
            stage,
            priority + 10,
            format!("{stateful_guard}{ip} && tcp && ({})", acl.match_),
            format!(
                "{log}{commit}tcp_reset {{ eth.dst <-> eth.src; {ip}.src <-> {ip}.dst; \
                 tcp.src <-> tcp.dst; outport <-> inport; flags.loopback = 1; output; }};"
            ),
            hint,
        );
    }

    lflows.add_hint(
        dp.key,
        stage,
        priority,
        format!("{stateful_guard}ip4 && ({})", acl.match_),
        format!(
            "{log}{commit}icmp4 {{ eth.dst <-> eth.src; ip4.src <-> ip4.dst; \
             icmp4.type = 3; icmp4.code = 1; outport <-> inport; flags.loopback = 1; output; }};"
        ),
        hint,
    );
    lflows.add_hint(
        dp.key,
        stage,
        priority,
        format!("{stateful_guard}ip6 && ({})", acl.match_),
        format!(
            "{log}{commit}icmp6 {{ eth.dst <-> eth.src; ip6.src <-> ip6.dst; \
             icmp6.type = 1; icmp6.code = 4; outport <-> inport; flags.loopback = 1; output; }};"
        ),
        hint,
    );
}

/// Ingress tables 7-8, egress tables 5-6: DSCP marking and metering.
fn qos(ctx: &Ctx, dp: &Datapath, ls: &LogicalSwitch, lflows: &mut LflowSet) {
    for stage in [
        Stage::LsInQosMark,
        Stage::LsInQosMeter,
        Stage::LsOutQosMark,
        Stage::LsOutQosMeter,
    ] {
        lflows.add(dp.key, stage, 0, "1", "next;");
    }

    for rule in ls.qos_rules.iter().filter_map(|id| ctx.qos.get(id)) {
        if !(0..=32767).contains(&rule.priority) {
            warn_rl!(
                ctx.warn.cfg,
                ctx.now,
                switch = %ls.name,
                priority = rule.priority,
                "QoS priority out of range; skipping"
            );
            continue;
        }

        let hint = rule.id.hint();

        if let Some(dscp) = rule.dscp {
            let stage = match rule.direction {
                AclDirection::FromLport => Stage::LsInQosMark,
                AclDirection::ToLport => Stage::LsOutQosMark,
            };

            lflows.add_hint(
                dp.key,
                stage,
                rule.priority as u16,
                rule.match_.clone(),
                format!("ip.dscp = {dscp}; next;"),
                hint,
            );
        }

        if let Some(rate) = rule.bandwidth_rate {
            let stage = match rule.direction {
                AclDirection::FromLport => Stage::LsInQosMeter,
                AclDirection::ToLport => Stage::LsOutQosMeter,
            };
            let actions = match rule.bandwidth_burst {
                Some(burst) => format!("set_meter({rate}, {burst}); next;"),
                None => format!("set_meter({rate}); next;"),
            };

            lflows.add_hint(
                dp.key,
                stage,
                rule.priority as u16,
                rule.match_.clone(),
                actions,
                hint,
            );
        }
    }
}

/// Ingress table 9, egress table 3: pre-NAT recognition of load-balanced
/// sessions.
fn lb(dp: &Datapath, vips: &[Vip], lflows: &mut LflowSet) {
    lflows.add(dp.key, Stage::LsInLb, 0, "1", "next;");
    lflows.add(dp.key, Stage::LsOutLb, 0, "1", "next;");

    if vips.is_empty() {
        return;
    }

    let actions = format!("{REGBIT_CONNTRACK_NAT} = 1; next;");
    let match_ = "ct.est && !ct.rel && !ct.new && !ct.inv";

    lflows.add(dp.key, Stage::LsInLb, u16::MAX, match_, actions.clone());
    lflows.add(dp.key, Stage::LsOutLb, u16::MAX, match_, actions);
}

/// Ingress table 10, egress table 7: conntrack commit and load-balancer
/// session establishment.
fn stateful(ctx: &Ctx, dp: &Datapath, vips: &[Vip], lflows: &mut LflowSet) {
    lflows.add(dp.key, Stage::LsInStateful, 0, "1", "next;");
    lflows.add(dp.key, Stage::LsOutStateful, 0, "1", "next;");

    let commit = format!("{REGBIT_CONNTRACK_COMMIT} == 1");
    for stage in [Stage::LsInStateful, Stage::LsOutStateful] {
        lflows.add(
            dp.key,
            stage,
            100,
            commit.clone(),
            "ct_commit(ct_label=0/1); next;",
        );
        lflows.add(
            dp.key,
            stage,
            100,
            format!("{REGBIT_CONNTRACK_NAT} == 1"),
            "ct_lb;",
        );
    }

    let controller_event = ctx
        .nb
        .global
        .options
        .get("controller_event")
        .is_some_and(|v| v == "true");

    for vip in vips {
        let field = if vip.is_v6() { "ip6" } else { "ip4" };
        let mut match_ = format!("ct.new && {field}.dst == {}", vip.ip);

        if vip.backends.is_empty() && controller_event {
            if let Some(port) = vip.port {
                let _ = write!(match_, " && {}.dst == {port}", vip.protocol_name());
            }

            lflows.add_hint(
                dp.key,
                Stage::LsInStateful,
                130,
                match_,
                format!(
                    "trigger_event(event = \"empty_lb_backends\", vip = \"{}\", \
                     protocol = \"{}\", load_balancer = \"{}\");",
                    vip.key(),
                    vip.protocol_name(),
                    vip.lb
                ),
                vip.lb.hint(),
            );
            continue;
        }

        let priority = match vip.port {
            Some(port) => {
                let _ = write!(match_, " && {}.dst == {port}", vip.protocol_name());
                120
            }
            None => 110,
        };

        lflows.add_hint(
            dp.key,
            Stage::LsInStateful,
            priority,
            match_,
            format!("ct_lb({});", vip.backends),
            vip.lb.hint(),
        );
    }
}

/// Ingress table 11: ARP and ND responder.
fn arp_nd_responder(ctx: &Ctx, dp: &Datapath, dp_ix: usize, lflows: &mut LflowSet) {
    lflows.add(dp.key, Stage::LsInArpNdRsp, 0, "1", "next;");

    for port in ctx.ports.on_dp(dp_ix) {
        let Some(lsp) = port.lsp(ctx.nb) else { continue };

        if !lsp.is_enabled() {
            continue;
        }

        match lsp.port_type {
            // Traffic from physical networks answers for itself.
            LspType::Localnet | LspType::Vtep | LspType::External => continue,
            LspType::Virtual => {
                virtual_port_responder(ctx, dp, port, lflows);
                continue;
            }
            _ => {}
        }

        let is_router = lsp.port_type == LspType::Router;
        let hint = lsp.id.hint();

        for addrs in &port.addresses {
            for ip in &addrs.ipv4 {
                // The owner itself is exempt so address conflict detection
                // still works.
                lflows.add_hint(
                    dp.key,
                    Stage::LsInArpNdRsp,
                    100,
                    format!(
                        "arp.tpa == {} && arp.op == 1 && inport == {}",
                        ip.addr, port.json_name
                    ),
                    "next;",
                    hint,
                );

                lflows.add_hint(
                    dp.key,
                    Stage::LsInArpNdRsp,
                    50,
                    format!("arp.tpa == {} && arp.op == 1", ip.addr),
                    format!(
                        "eth.dst = eth.src; eth.src = {mac}; arp.op = 2; /* ARP reply */ \
                         arp.tha = arp.sha; arp.sha = {mac}; arp.tpa = arp.spa; \
                         arp.spa = {ip}; outport = inport; flags.loopback = 1; output;",
                        mac = addrs.ea,
                        ip = ip.addr
                    ),
                    hint,
                );
            }

            for ip in &addrs.ipv6 {
                let reply = if is_router { "nd_na_router" } else { "nd_na" };

                lflows.add_hint(
                    dp.key,
                    Stage::LsInArpNdRsp,
                    100,
                    format!(
                        "nd_ns && ip6.dst == {{{}, {}}} && nd.target == {} && inport == {}",
                        ip.addr,
                        ip.solicited_node(),
                        ip.addr,
                        port.json_name
                    ),
                    "next;",
                    hint,
                );

                lflows.add_hint(
                    dp.key,
                    Stage::LsInArpNdRsp,
                    50,
                    format!(
                        "nd_ns && ip6.dst == {{{}, {}}} && nd.target == {}",
                        ip.addr,
                        ip.solicited_node(),
                        ip.addr
                    ),
                    format!(
                        "{reply} {{ eth.src = {mac}; ip6.src = {ip}; nd.target = {ip}; \
                         nd.tll = {mac}; outport = inport; flags.loopback = 1; output; }};",
                        mac = addrs.ea,
                        ip = ip.addr
                    ),
                    hint,
                );
            }
        }
    }
}

/// Virtual ports bind to whichever parent answers for the virtual address.
fn virtual_port_responder(ctx: &Ctx, dp: &Datapath, port: &Port, lflows: &mut LflowSet) {
    let lsp = port.lsp(ctx.nb).expect("virtual port is a switch port");

    let (Some(vip), Some(parents)) = (
        lsp.options.get("virtual-ip"),
        lsp.options.get("virtual-parents"),
    ) else {
        warn_rl!(
            ctx.warn.cfg,
            ctx.now,
            port = %port.name,
            "virtual port without virtual-ip or virtual-parents"
        );
        return;
    };

    if vip.parse::<std::net::Ipv4Addr>().is_err() {
        warn_rl!(
            ctx.warn.cfg,
            ctx.now,
            port = %port.name,
            vip = %vip,
            "virtual-ip is not an IPv4 address"
        );
        return;
    }

    for parent in parents.split(',').map(str::trim) {
        let Some(parent_port) = ctx.ports.get(parent) else {
            warn_rl!(
                ctx.warn.cfg,
                ctx.now,
                port = %port.name,
                parent,
                "unknown virtual parent; skipping"
            );
            continue;
        };

        lflows.add_hint(
            dp.key,
            Stage::LsInArpNdRsp,
            100,
            format!(
                "inport == {} && ((arp.op == 1 && arp.spa == {vip} && arp.tpa == {vip}) || \
                 (arp.op == 2 && arp.spa == {vip}))",
                parent_port.json_name
            ),
            format!("bind_vport({}, inport); next;", port.json_name),
            lsp.id.hint(),
        );
    }
}

/// Ingress tables 12-13: DHCPv4/v6 option injection and replies.
fn dhcp(ctx: &Ctx, dp: &Datapath, dp_ix: usize, lflows: &mut LflowSet) {
    lflows.add(dp.key, Stage::LsInDhcpOptions, 0, "1", "next;");
    lflows.add(dp.key, Stage::LsInDhcpResponse, 0, "1", "next;");

    for port in ctx.ports.on_dp(dp_ix) {
        let Some(lsp) = port.lsp(ctx.nb) else { continue };

        if !lsp.is_enabled() || lsp.port_type == LspType::Router {
            continue;
        }

        // External ports are serviced on the chassis that hosts them, with
        // the request arriving through the localnet port.
        let external = lsp.port_type == LspType::External;
        let localnets: Vec<&Port> = match external {
            true => dp
                .localnet_ports
                .iter()
                .map(|&ix| &ctx.ports.items[ix])
                .collect(),
            false => Vec::new(),
        };

        if external && localnets.is_empty() {
            continue;
        }

        for addrs in &port.addresses {
            dhcpv4_flows(ctx, dp, port, lsp, addrs, &localnets, lflows);
            dhcpv6_flows(ctx, dp, port, lsp, addrs, &localnets, lflows);
        }
    }
}

fn dhcp_inport_clauses(port: &Port, localnets: &[&Port]) -> Vec<(String, String)> {
    // (inport clause, residency suffix) pairs to instantiate the flow on.
    match localnets.is_empty() {
        true => vec![(port.json_name.clone(), String::new())],
        false => localnets
            .iter()
            .map(|l| {
                (
                    l.json_name.clone(),
                    format!(" && is_chassis_resident({})", port.json_name),
                )
            })
            .collect(),
    }
}

fn dhcpv4_flows(
    ctx: &Ctx,
    dp: &Datapath,
    port: &Port,
    lsp: &northd_model::nb::LogicalSwitchPort,
    addrs: &LportAddresses,
    localnets: &[&Port],
    lflows: &mut LflowSet,
) {
    let Some(opts) = lsp.dhcpv4_options.and_then(|id| ctx.dhcp_opts.get(&id)) else {
        return;
    };

    let Ok(cidr) = opts.cidr.parse::<ip_network::Ipv4Network>() else {
        warn_rl!(
            ctx.warn.cfg,
            ctx.now,
            port = %port.name,
            cidr = %opts.cidr,
            "DHCPv4 options with unparsable CIDR"
        );
        return;
    };

    let (Some(server_ip), Some(server_mac), Some(_lease)) = (
        opts.options.get("server_id"),
        opts.options.get("server_mac"),
        opts.options.get("lease_time"),
    ) else {
        warn_rl!(
            ctx.warn.cfg,
            ctx.now,
            port = %port.name,
            "DHCPv4 options missing server_id, server_mac or lease_time"
        );
        return;
    };

    let hint = lsp.id.hint();

    for ip in &addrs.ipv4 {
        if !cidr.contains(ip.addr) {
            continue;
        }

        let mut options = Ds::new();
        let _ = write!(options, "offerip = {}, ", ip.addr);

        for (key, value) in &opts.options {
            if key == "server_mac" {
                continue;
            }

            let _ = write!(options, "{key} = {value}, ");
        }

        options.chomp(", ");

        let offer_actions = format!(
            "{REGBIT_DHCP_OPTS_RESULT} = put_dhcp_opts({options}); next;"
        );
        let reply_actions = format!(
            "eth.dst = eth.src; eth.src = {server_mac}; ip4.dst = {offer}; \
             ip4.src = {server_ip}; udp.src = 67; udp.dst = 68; outport = inport; \
             flags.loopback = 1; output;",
            offer = ip.addr
        );

        for (inport, residency) in dhcp_inport_clauses(port, localnets) {
            let discover = format!(
                "inport == {inport} && eth.src == {mac} && ip4.src == 0.0.0.0 && \
                 ip4.dst == 255.255.255.255 && udp.src == 68 && udp.dst == 67{residency}",
                mac = addrs.ea
            );
            let renew = format!(
                "inport == {inport} && eth.src == {mac} && ip4.src == {offer} && \
                 ip4.dst == {{{offer}, 255.255.255.255}} && udp.src == 68 && \
                 udp.dst == 67{residency}",
                mac = addrs.ea,
                offer = ip.addr
            );
            let response = format!(
                "inport == {inport} && eth.src == {mac} && ip4 && udp.src == 68 && \
                 udp.dst == 67 && {REGBIT_DHCP_OPTS_RESULT}{residency}",
                mac = addrs.ea
            );

            lflows.add_hint(dp.key, Stage::LsInDhcpOptions, 100, discover, offer_actions.clone(), hint);
            lflows.add_hint(dp.key, Stage::LsInDhcpOptions, 100, renew, offer_actions.clone(), hint);
            lflows.add_hint(dp.key, Stage::LsInDhcpResponse, 100, response, reply_actions.clone(), hint);
        }
    }
}

fn dhcpv6_flows(
    ctx: &Ctx,
    dp: &Datapath,
    port: &Port,
    lsp: &northd_model::nb::LogicalSwitchPort,
    addrs: &LportAddresses,
    localnets: &[&Port],
    lflows: &mut LflowSet,
) {
    let Some(opts) = lsp.dhcpv6_options.and_then(|id| ctx.dhcp_opts.get(&id)) else {
        return;
    };

    let Some(server_mac) = opts
        .options
        .get("server_id")
        .and_then(|m| m.parse::<northd_model::EthAddr>().ok())
    else {
        warn_rl!(
            ctx.warn.cfg,
            ctx.now,
            port = %port.name,
            "DHCPv6 options without a server_id MAC"
        );
        return;
    };

    let stateless = opts
        .options
        .get("dhcpv6_stateless")
        .is_some_and(|v| v == "true");
    let server_lla = crate::addresses::link_local_from_mac(server_mac);
    let hint = lsp.id.hint();

    for ip in &addrs.ipv6 {
        let mut options = Ds::new();

        if !stateless {
            let _ = write!(options, "ia_addr = {}, ", ip.addr);
        }

        for (key, value) in &opts.options {
            if key == "dhcpv6_stateless" {
                continue;
            }

            let _ = write!(options, "{key} = {value}, ");
        }

        options.chomp(", ");

        let offer_actions = format!(
            "{REGBIT_DHCP_OPTS_RESULT} = put_dhcpv6_opts({options}); next;"
        );
        let reply_actions = format!(
            "eth.dst = eth.src; eth.src = {server_mac}; ip6.dst = ip6.src; \
             ip6.src = {server_lla}; udp.src = 547; udp.dst = 546; outport = inport; \
             flags.loopback = 1; output;"
        );

        for (inport, residency) in dhcp_inport_clauses(port, localnets) {
            let solicit = format!(
                "inport == {inport} && eth.src == {mac} && ip6.dst == ff02::1:2 && \
                 udp.src == 546 && udp.dst == 547{residency}",
                mac = addrs.ea
            );
            let response = format!(
                "inport == {inport} && eth.src == {mac} && ip6 && udp.src == 546 && \
                 udp.dst == 547 && {REGBIT_DHCP_OPTS_RESULT}{residency}",
                mac = addrs.ea
            );

            lflows.add_hint(dp.key, Stage::LsInDhcpOptions, 100, solicit, offer_actions.clone(), hint);
            lflows.add_hint(dp.key, Stage::LsInDhcpResponse, 100, response, reply_actions.clone(), hint);
        }
    }
}

/// Ingress tables 14-15: distributed DNS resolution.
fn dns_lookup(ctx: &Ctx, dp: &Datapath, ls: &LogicalSwitch, lflows: &mut LflowSet) {
    lflows.add(dp.key, Stage::LsInDnsLookup, 0, "1", "next;");
    lflows.add(dp.key, Stage::LsInDnsResponse, 0, "1", "next;");

    let has_records = ls
        .dns_records
        .iter()
        .filter_map(|id| ctx.dns.get(id))
        .any(|dns| !dns.records.is_empty());

    if !has_records {
        return;
    }

    lflows.add(
        dp.key,
        Stage::LsInDnsLookup,
        100,
        "udp.dst == 53",
        format!("{REGBIT_DNS_LOOKUP_RESULT} = dns_lookup(); next;"),
    );

    lflows.add(
        dp.key,
        Stage::LsInDnsResponse,
        100,
        format!("udp.dst == 53 && {REGBIT_DNS_LOOKUP_RESULT} && ip4"),
        "eth.dst <-> eth.src; ip4.src <-> ip4.dst; udp.dst = udp.src; udp.src = 53; \
         outport = inport; flags.loopback = 1; output;",
    );
    lflows.add(
        dp.key,
        Stage::LsInDnsResponse,
        100,
        format!("udp.dst == 53 && {REGBIT_DNS_LOOKUP_RESULT} && ip6"),
        "eth.dst <-> eth.src; ip6.src <-> ip6.dst; udp.dst = udp.src; udp.src = 53; \
         outport = inport; flags.loopback = 1; output;",
    );
}

/// Ingress table 16: pin external-port ARP/ND handling to the hosting
/// chassis.
fn external_ports(ctx: &Ctx, dp: &Datapath, dp_ix: usize, lflows: &mut LflowSet) {
    lflows.add(dp.key, Stage::LsInExternalPort, 0, "1", "next;");

    // The router addresses reachable through this switch.
    let mut router_ip4 = Vec::new();
    let mut router_ip6 = Vec::new();

    for port in ctx.ports.on_dp(dp_ix) {
        if port.lsp_type(ctx.nb) != Some(LspType::Router) {
            continue;
        }

        for addrs in &port.addresses {
            router_ip4.extend(addrs.ipv4.iter().map(|n| n.addr));
            router_ip6.extend(addrs.ipv6.iter().map(|n| n.addr));
        }
    }

    if router_ip4.is_empty() && router_ip6.is_empty() {
        return;
    }

    for port in ctx.ports.on_dp(dp_ix) {
        let Some(lsp) = port.lsp(ctx.nb) else { continue };

        if lsp.port_type != LspType::External || !lsp.is_enabled() {
            continue;
        }

        let hint = lsp.id.hint();

        for localnet in &dp.localnet_ports {
            let localnet = &ctx.ports.items[*localnet];

            for addrs in &port.addresses {
                if !router_ip4.is_empty() {
                    lflows.add_hint(
                        dp.key,
                        Stage::LsInExternalPort,
                        100,
                        format!(
                            "inport == {} && eth.src == {} && !is_chassis_resident({}) && \
                             arp.tpa == {} && arp.op == 1",
                            localnet.json_name,
                            addrs.ea,
                            port.json_name,
                            value_list(router_ip4.iter())
                        ),
                        "drop;",
                        hint,
                    );
                }

                if !router_ip6.is_empty() {
                    lflows.add_hint(
                        dp.key,
                        Stage::LsInExternalPort,
                        100,
                        format!(
                            "inport == {} && eth.src == {} && !is_chassis_resident({}) && \
                             nd_ns && nd.target == {}",
                            localnet.json_name,
                            addrs.ea,
                            port.json_name,
                            value_list(router_ip6.iter())
                        ),
                        "drop;",
                        hint,
                    );
                }
            }
        }
    }
}

/// Ingress table 17: destination lookup.
fn l2_lookup(ctx: &Ctx, dp: &Datapath, dp_ix: usize, lflows: &mut LflowSet) {
    let info = &ctx.mcast.per_dp[dp_ix];
    let snooping = dp.mcast_sw.as_ref().is_some_and(|m| m.enabled);

    if snooping {
        let mcast = dp.mcast_sw.as_ref().expect("snooping checked");

        // Reports and queries go to the controller.
        lflows.add(dp.key, Stage::LsInL2Lkup, 100, "ip4 && ip.proto == 2", "igmp;");

        // Link-local multicast always floods.
        lflows.add(
            dp.key,
            Stage::LsInL2Lkup,
            85,
            "ip4 && ip4.dst == 224.0.0.0/24",
            format!("outport = \"{MC_FLOOD}\"; output;"),
        );

        if !mcast.flood_unregistered {
            let mut actions = Ds::new();

            if !info.mrouter_ports.is_empty() {
                let _ = write!(
                    actions,
                    "clone {{ outport = \"{MC_MROUTER_FLOOD}\"; output; }}; "
                );
            }

            if !info.flood_ports.is_empty() {
                let _ = write!(actions, "outport = \"{MC_STATIC}\"; output;");
            } else {
                actions.put("drop;");
            }

            lflows.add(
                dp.key,
                Stage::LsInL2Lkup,
                80,
                "ip4 && ip4.mcast",
                actions.into_string(),
            );
        }

        // Learnt groups.
        for &group_ix in &info.groups {
            let group = &ctx.mcast.groups[group_ix];
            let Some(v4) = group.v4 else {
                continue;
            };

            let mut actions = Ds::new();

            if !info.mrouter_ports.is_empty() {
                let _ = write!(
                    actions,
                    "clone {{ outport = \"{MC_MROUTER_FLOOD}\"; output; }}; "
                );
            }
            if !info.flood_ports.is_empty() {
                let _ = write!(actions, "clone {{ outport = \"{MC_STATIC}\"; output; }}; ");
            }

            let _ = write!(actions, "outport = \"{}\"; output;", group.name);

            lflows.add(
                dp.key,
                Stage::LsInL2Lkup,
                90,
                format!("eth.mcast && ip4 && ip4.dst == {v4}"),
                actions.into_string(),
            );
        }
    }

    // Everything else multicast floods.
    lflows.add(
        dp.key,
        Stage::LsInL2Lkup,
        70,
        "eth.mcast",
        format!("outport = \"{MC_FLOOD}\"; output;"),
    );

    // Known unicast addresses.
    for port in ctx.ports.on_dp(dp_ix) {
        let Some(lsp) = port.lsp(ctx.nb) else { continue };

        if !lsp.is_enabled() {
            continue;
        }

        let hint = lsp.id.hint();
        let is_router = lsp.port_type == LspType::Router;

        for addrs in &port.addresses {
            let mut match_ = format!("eth.dst == {}", addrs.ea);

            if is_router {
                // Learning on a distributed gateway prefers the chassis
                // where the gateway is resident.
                let redirect = port
                    .peer
                    .map(|peer| ctx.ports.items[peer].dp)
                    .and_then(|router_dp| {
                        let router = &ctx.datapaths.items[router_dp];

                        (router.l3dgw_port == port.peer)
                            .then_some(router.l3redirect_port)
                            .flatten()
                    });

                if let Some(redirect) = redirect {
                    let _ = write!(
                        match_,
                        " && is_chassis_resident({})",
                        ctx.ports.items[redirect].json_name
                    );
                }
            }

            lflows.add_hint(
                dp.key,
                Stage::LsInL2Lkup,
                50,
                match_,
                format!("outport = {}; output;", port.json_name),
                hint,
            );
        }
    }

    if dp.has_unknown {
        lflows.add(
            dp.key,
            Stage::LsInL2Lkup,
            0,
            "1",
            format!("outport = \"{MC_UNKNOWN}\"; output;"),
        );
    }

    // Egress admission: multicast out, per-port delivery, disabled ports
    // never receive flood traffic.
    lflows.add(dp.key, Stage::LsOutPortSecL2, 100, "eth.mcast", "output;");

    for port in ctx.ports.on_dp(dp_ix) {
        let Some(lsp) = port.lsp(ctx.nb) else { continue };
        let hint = lsp.id.hint();

        if !lsp.is_enabled() {
            lflows.add_hint(
                dp.key,
                Stage::LsOutPortSecL2,
                150,
                format!("outport == {}", port.json_name),
                "drop;",
                hint,
            );
            continue;
        }

        let mut match_ = format!("outport == {}", port.json_name);

        if !port.ps.is_empty() {
            let macs = port.ps.iter().map(|e| e.ea).collect_vec();
            let _ = write!(match_, " && eth.dst == {}", value_list(macs));
        }

        lflows.add_hint(dp.key, Stage::LsOutPortSecL2, 50, match_, "output;", hint);
    }
}
