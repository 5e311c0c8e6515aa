//! End-to-end scenarios driving [`Engine::run_pass`] on hand-built
//! snapshots, plus the cross-cutting invariants of the translation.

use crate::Engine;
use northd_model::nb::*;
use northd_model::ops::{apply_nb_ops, apply_sb_ops, SbOp};
use northd_model::sb::*;
use northd_model::*;
use std::collections::BTreeMap;
use std::time::Instant;

fn options(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
        .collect()
}

fn switch(name: &str) -> LogicalSwitch {
    LogicalSwitch {
        id: LsId::random(),
        name: name.to_owned(),
        ports: Vec::new(),
        acls: Vec::new(),
        qos_rules: Vec::new(),
        load_balancer: Vec::new(),
        dns_records: Vec::new(),
        other_config: BTreeMap::new(),
        external_ids: BTreeMap::new(),
    }
}

fn lsp(name: &str, addresses: &[&str]) -> LogicalSwitchPort {
    LogicalSwitchPort {
        id: LspId::random(),
        name: name.to_owned(),
        port_type: LspType::Vif,
        addresses: addresses.iter().map(|s| (*s).to_owned()).collect(),
        dynamic_addresses: None,
        port_security: Vec::new(),
        enabled: None,
        up: None,
        parent_name: None,
        tag_request: None,
        tag: None,
        options: BTreeMap::new(),
        dhcpv4_options: None,
        dhcpv6_options: None,
        ha_chassis_group: None,
        external_ids: BTreeMap::new(),
    }
}

fn router(name: &str) -> LogicalRouter {
    LogicalRouter {
        id: LrId::random(),
        name: name.to_owned(),
        ports: Vec::new(),
        static_routes: Vec::new(),
        policies: Vec::new(),
        nat: Vec::new(),
        load_balancer: Vec::new(),
        enabled: None,
        options: BTreeMap::new(),
        external_ids: BTreeMap::new(),
    }
}

fn lrp(name: &str, mac: &str, networks: &[&str]) -> LogicalRouterPort {
    LogicalRouterPort {
        id: LrpId::random(),
        name: name.to_owned(),
        mac: mac.to_owned(),
        networks: networks.iter().map(|s| (*s).to_owned()).collect(),
        peer: None,
        enabled: None,
        ipv6_ra_configs: BTreeMap::new(),
        options: BTreeMap::new(),
        gateway_chassis: Vec::new(),
        ha_chassis_group: None,
        external_ids: BTreeMap::new(),
    }
}

fn nb_with(switches: Vec<LogicalSwitch>, routers: Vec<LogicalRouter>) -> Northbound {
    Northbound {
        global: NbGlobal {
            options: options(&[("mac_prefix", "0a:00:02")]),
            ..Default::default()
        },
        switches,
        routers,
        ..Default::default()
    }
}

/// Runs one pass and applies its writes to both snapshots.
fn converge(engine: &mut Engine, nb: &mut Northbound, sb: &mut Southbound) -> crate::PassOutcome {
    let outcome = engine.run_pass(nb, sb, Instant::now());

    apply_sb_ops(sb, &outcome.sb_ops);
    apply_nb_ops(nb, &outcome.nb_ops);

    outcome
}

fn find_flows<'a>(
    sb: &'a Southbound,
    stage_name: &str,
    priority: u16,
) -> impl Iterator<Item = &'a LogicalFlowRow> {
    let stage_name = stage_name.to_owned();

    sb.lflows.iter().filter(move |f| {
        f.priority == priority
            && f.external_ids.get("stage-name").map(String::as_str) == Some(stage_name.as_str())
    })
}

fn has_flow(sb: &Southbound, stage_name: &str, priority: u16, match_: &str) -> bool {
    find_flows(sb, stage_name, priority).any(|f| f.match_ == match_)
}

fn flow_actions<'a>(
    sb: &'a Southbound,
    stage_name: &str,
    priority: u16,
    match_: &str,
) -> Option<&'a str> {
    find_flows(sb, stage_name, priority)
        .find(|f| f.match_ == match_)
        .map(|f| f.actions.as_str())
}

#[test]
fn s1_switch_with_two_ports() {
    let mut ls = switch("ls0");
    ls.other_config = options(&[("subnet", "10.0.0.0/24"), ("exclude_ips", "10.0.0.4")]);
    ls.ports.push(lsp("p1", &["dynamic"]));
    ls.ports.push(lsp("p2", &["02:00:00:00:00:10 10.0.0.50"]));

    let mut nb = nb_with(vec![ls], vec![]);
    let mut sb = Southbound::default();
    let mut engine = Engine::new();

    converge(&mut engine, &mut nb, &mut sb);

    // p1 gets the first free address: .1 is reserved, .4 excluded, .2 free.
    assert_eq!(
        nb.switches[0].ports[0].dynamic_addresses.as_deref(),
        Some("0a:00:02:00:00:02 10.0.0.2")
    );

    assert!(has_flow(&sb, "ls_in_port_sec_l2", 100, "vlan.present"));
    assert!(has_flow(&sb, "ls_in_port_sec_l2", 50, "inport == \"p1\""));
    assert!(has_flow(&sb, "ls_in_port_sec_l2", 50, "inport == \"p2\""));

    assert_eq!(
        flow_actions(&sb, "ls_in_l2_lkup", 50, "eth.dst == 02:00:00:00:00:10"),
        Some("outport = \"p2\"; output;")
    );
    assert_eq!(
        flow_actions(&sb, "ls_in_l2_lkup", 50, "eth.dst == 0a:00:02:00:00:02"),
        Some("outport = \"p1\"; output;")
    );
}

#[test]
fn s2_router_with_static_route() {
    let mut lr = router("lr0");
    lr.ports.push(lrp("lr0-a", "40:00:00:00:00:01", &["10.0.0.1/24"]));
    lr.ports.push(lrp("lr0-b", "40:00:00:00:00:02", &["10.0.1.1/24"]));
    lr.static_routes.push(StaticRoute {
        ip_prefix: "10.0.2.0/24".to_owned(),
        nexthop: "10.0.1.2".to_owned(),
        output_port: None,
        policy: None,
    });

    let mut nb = nb_with(vec![], vec![lr]);
    let mut sb = Southbound::default();

    converge(&mut Engine::new(), &mut nb, &mut sb);

    assert_eq!(
        flow_actions(&sb, "lr_in_ip_routing", 49, "ip4.dst == 10.0.2.0/24"),
        Some(
            "ip.ttl--; reg0 = 10.0.1.2; reg1 = 10.0.1.1; eth.src = 40:00:00:00:00:02; \
             outport = \"lr0-b\"; flags.loopback = 1; next;"
        )
    );

    // Connected routes sit at 2 * 24 + 1 as well.
    assert!(has_flow(&sb, "lr_in_ip_routing", 49, "ip4.dst == 10.0.0.0/24"));
    assert!(has_flow(&sb, "lr_in_ip_routing", 49, "ip4.dst == 10.0.1.0/24"));
}

#[test]
fn s3_distributed_gateway_with_dnat_and_snat() {
    let mut lr = router("lr0");
    let mut ext = lrp("lr0-ext", "40:00:00:00:00:01", &["172.16.0.1/24"]);
    ext.gateway_chassis.push(GatewayChassis {
        chassis_name: "hv1".to_owned(),
        priority: 0,
    });
    lr.ports.push(ext);
    lr.nat.push(NatRule {
        nat_type: NatType::DnatAndSnat,
        external_ip: "172.16.0.10".to_owned(),
        external_mac: Some("aa:aa:aa:aa:aa:aa".to_owned()),
        logical_ip: "10.0.0.5".to_owned(),
        logical_port: Some("vm1".to_owned()),
        stateless: false,
    });

    let mut nb = nb_with(vec![], vec![lr]);
    let mut sb = Southbound::default();

    converge(&mut Engine::new(), &mut nb, &mut sb);

    let redirect = sb
        .port_bindings
        .iter()
        .find(|b| b.logical_port == "cr-lr0-ext")
        .expect("derived redirect port exists");
    assert_eq!(redirect.port_type, "chassisredirect");
    assert_eq!(
        redirect.options.get("distributed-port").map(String::as_str),
        Some("lr0-ext")
    );
    assert_eq!(redirect.ha_chassis_group.as_deref(), Some("lr0-ext"));

    let group = sb
        .ha_chassis_groups
        .iter()
        .find(|g| g.name == "lr0-ext")
        .expect("gateway HA group exists");
    assert_eq!(
        group.ha_chassis,
        vec![SbHaChassis {
            chassis_name: "hv1".to_owned(),
            priority: 0,
        }]
    );

    assert!(has_flow(
        &sb,
        "lr_in_admission",
        50,
        "eth.dst == aa:aa:aa:aa:aa:aa && inport == \"lr0-ext\" && is_chassis_resident(\"vm1\")"
    ));
    assert_eq!(
        flow_actions(
            &sb,
            "lr_in_dnat",
            100,
            "ip && ip4.dst == 172.16.0.10 && inport == \"lr0-ext\" && \
             is_chassis_resident(\"vm1\")"
        ),
        Some("ct_dnat(10.0.0.5);")
    );
    assert_eq!(
        flow_actions(
            &sb,
            "lr_out_undnat",
            100,
            "ip && ip4.src == 10.0.0.5 && outport == \"lr0-ext\" && \
             is_chassis_resident(\"vm1\")"
        ),
        Some("eth.src = aa:aa:aa:aa:aa:aa; ct_dnat;")
    );
}

#[test]
fn s4_load_balancer() {
    let lb = LoadBalancer {
        id: LbId::random(),
        name: "lb0".to_owned(),
        vips: options(&[("10.0.0.100:80", "10.0.0.5:8080,10.0.0.6:8080")])
            .into_iter()
            .collect(),
        protocol: Some(LbProtocol::Tcp),
    };

    let mut ls = switch("ls0");
    ls.load_balancer.push(lb.id);
    ls.ports.push(lsp("p1", &["02:00:00:00:00:01 10.0.0.5"]));

    let mut nb = nb_with(vec![ls], vec![]);
    nb.load_balancers.push(lb);

    let mut sb = Southbound::default();

    converge(&mut Engine::new(), &mut nb, &mut sb);

    assert!(has_flow(&sb, "ls_in_pre_lb", 100, "ip && ip4.dst == 10.0.0.100"));
    assert_eq!(
        flow_actions(
            &sb,
            "ls_in_stateful",
            120,
            "ct.new && ip4.dst == 10.0.0.100 && tcp.dst == 80"
        ),
        Some("ct_lb(10.0.0.5:8080,10.0.0.6:8080);")
    );
    assert!(has_flow(
        &sb,
        "ls_in_lb",
        u16::MAX,
        "ct.est && !ct.rel && !ct.new && !ct.inv"
    ));
}

#[test]
fn s5_port_group_address_sets() {
    let mut ls = switch("ls0");
    ls.ports.push(lsp("p1", &["02:00:00:00:00:01 10.0.0.2"]));
    ls.ports.push(lsp("p2", &["02:00:00:00:00:02 10.0.0.50"]));

    let pg = PortGroup {
        id: PortGroupId::random(),
        name: "pg0".to_owned(),
        ports: vec![ls.ports[0].id, ls.ports[1].id],
        acls: Vec::new(),
    };

    let mut nb = nb_with(vec![ls], vec![]);
    nb.port_groups.push(pg);

    let mut sb = Southbound::default();

    converge(&mut Engine::new(), &mut nb, &mut sb);

    let ip4 = sb
        .address_sets
        .iter()
        .find(|s| s.name == "pg0_ip4")
        .expect("synthetic v4 set");
    assert_eq!(ip4.addresses, vec!["10.0.0.2", "10.0.0.50"]);

    let ip6 = sb
        .address_sets
        .iter()
        .find(|s| s.name == "pg0_ip6")
        .expect("synthetic v6 set");
    assert!(ip6.addresses.is_empty());

    let sb_pg = sb.port_groups.iter().find(|g| g.name == "pg0").unwrap();
    assert_eq!(sb_pg.ports, vec!["p1", "p2"]);
}

#[test]
fn s6_failover_converges_without_rekeying() {
    let mut ls = switch("ls0");
    ls.ports.push(lsp("p1", &["02:00:00:00:00:01 10.0.0.2"]));
    let mut lr = router("lr0");
    lr.ports.push(lrp("lr0-a", "40:00:00:00:00:01", &["10.0.0.1/24"]));

    let mut nb = nb_with(vec![ls], vec![lr]);
    let mut sb = Southbound::default();

    // Instance A converges the database, then dies.
    converge(&mut Engine::new(), &mut nb, &mut sb);

    let keys_before: Vec<(String, u16)> = sb
        .port_bindings
        .iter()
        .map(|b| (b.logical_port.clone(), b.tunnel_key))
        .collect();
    let dp_keys_before: Vec<u32> = sb.datapaths.iter().map(|d| d.tunnel_key).collect();

    // Instance B takes over with no shared in-memory state.
    let outcome = converge(&mut Engine::new(), &mut nb, &mut sb);

    assert!(
        outcome.sb_ops.is_empty(),
        "standby takeover rewrote rows: {:?}",
        outcome.sb_ops
    );

    let keys_after: Vec<(String, u16)> = sb
        .port_bindings
        .iter()
        .map(|b| (b.logical_port.clone(), b.tunnel_key))
        .collect();
    assert_eq!(keys_before, keys_after);
    assert_eq!(
        dp_keys_before,
        sb.datapaths.iter().map(|d| d.tunnel_key).collect::<Vec<_>>()
    );
}

#[test]
fn bijection_and_key_ranges() {
    let mut ls = switch("ls0");
    for i in 0..10 {
        ls.ports.push(lsp(
            &format!("p{i}"),
            &[&format!("02:00:00:00:00:{i:02x} 10.0.0.{}", i + 10)],
        ));
    }
    let mut lr = router("lr0");
    lr.ports.push(lrp("lr0-a", "40:00:00:00:00:01", &["10.0.0.1/24"]));

    let mut nb = nb_with(vec![ls], vec![lr]);
    let mut sb = Southbound::default();

    converge(&mut Engine::new(), &mut nb, &mut sb);

    // One binding per datapath, one per port, no orphans.
    assert_eq!(sb.datapaths.len(), 2);
    assert_eq!(sb.port_bindings.len(), 11);

    let mut dp_keys: Vec<u32> = sb.datapaths.iter().map(|d| d.tunnel_key).collect();
    dp_keys.sort_unstable();
    dp_keys.dedup();
    assert_eq!(dp_keys.len(), 2);
    assert!(dp_keys.iter().all(|&k| (1..1u32 << 24).contains(&k)));

    for dp in &sb.datapaths {
        let mut port_keys: Vec<u16> = sb
            .port_bindings
            .iter()
            .filter(|b| Some(b.datapath) == dp.nb_key().map(|k| k.uuid()))
            .map(|b| b.tunnel_key)
            .collect();
        let total = port_keys.len();
        port_keys.sort_unstable();
        port_keys.dedup();

        assert_eq!(port_keys.len(), total);
        assert!(port_keys.iter().all(|&k| (1..1u16 << 15).contains(&k)));
    }
}

#[test]
fn idempotence_second_pass_writes_nothing() {
    let mut ls = switch("ls0");
    ls.other_config = options(&[("subnet", "10.0.0.0/24")]);
    ls.ports.push(lsp("p1", &["dynamic"]));
    ls.ports.push(lsp("p2", &["02:00:00:00:00:10 10.0.0.50"]));

    let mut lr = router("lr0");
    lr.ports.push(lrp("lr0-a", "40:00:00:00:00:01", &["10.0.0.1/24"]));

    let mut nb = nb_with(vec![ls], vec![lr]);
    let mut sb = Southbound::default();
    let mut engine = Engine::new();

    converge(&mut engine, &mut nb, &mut sb);

    let before = nb.switches[0].ports[0].dynamic_addresses.clone();
    let second = converge(&mut engine, &mut nb, &mut sb);

    assert!(second.sb_ops.is_empty(), "unexpected writes: {:?}", second.sb_ops);
    assert!(second.nb_ops.is_empty(), "unexpected writes: {:?}", second.nb_ops);
    assert_eq!(nb.switches[0].ports[0].dynamic_addresses, before);
}

#[test]
fn flow_set_is_deterministic() {
    let mut ls = switch("ls0");
    ls.other_config = options(&[("subnet", "10.0.0.0/24")]);
    ls.ports.push(lsp("p1", &["02:00:00:00:00:01 10.0.0.2"]));
    let mut lr = router("lr0");
    lr.ports.push(lrp("lr0-a", "40:00:00:00:00:01", &["10.0.0.1/24"]));

    let nb = nb_with(vec![ls], vec![lr]);

    let flows = |nb: &Northbound| {
        let mut sb = Southbound::default();
        let mut nb = nb.clone();
        converge(&mut Engine::new(), &mut nb, &mut sb);

        let mut rows: Vec<(uuid::Uuid, Pipeline, u8, u16, String, String)> = sb
            .lflows
            .iter()
            .map(|f| {
                (
                    f.datapath,
                    f.pipeline,
                    f.table_id,
                    f.priority,
                    f.match_.clone(),
                    f.actions.clone(),
                )
            })
            .collect();
        rows.sort();
        rows
    };

    assert_eq!(flows(&nb), flows(&nb));
}

#[test]
fn longest_prefix_wins_by_priority() {
    let mut lr = router("lr0");
    lr.ports.push(lrp("lr0-a", "40:00:00:00:00:01", &["10.0.0.1/8"]));
    lr.static_routes.push(StaticRoute {
        ip_prefix: "10.1.0.0/16".to_owned(),
        nexthop: "10.0.0.2".to_owned(),
        output_port: None,
        policy: None,
    });
    lr.static_routes.push(StaticRoute {
        ip_prefix: "10.1.2.0/24".to_owned(),
        nexthop: "10.0.0.2".to_owned(),
        output_port: None,
        policy: None,
    });
    lr.static_routes.push(StaticRoute {
        ip_prefix: "10.1.2.0/24".to_owned(),
        nexthop: "10.0.0.3".to_owned(),
        output_port: None,
        policy: Some(RoutePolicy::SrcIp),
    });

    let mut nb = nb_with(vec![], vec![lr]);
    let mut sb = Southbound::default();

    converge(&mut Engine::new(), &mut nb, &mut sb);

    assert!(has_flow(&sb, "lr_in_ip_routing", 33, "ip4.dst == 10.1.0.0/16"));
    assert!(has_flow(&sb, "lr_in_ip_routing", 49, "ip4.dst == 10.1.2.0/24"));
    // Same prefix length: the dst-policy route beats the src-policy one by
    // exactly 1.
    assert!(has_flow(&sb, "lr_in_ip_routing", 48, "ip4.src == 10.1.2.0/24"));
}

#[test]
fn reject_acl_synthesizes_resets_and_unreachables() {
    let acl = Acl {
        id: AclId::random(),
        direction: AclDirection::ToLport,
        priority: 1000,
        match_: "outport == \"p1\" && ip".to_owned(),
        action: AclAction::Reject,
        log: false,
        name: None,
        severity: None,
        meter: None,
    };

    let mut ls = switch("ls0");
    ls.acls.push(acl.id);
    ls.ports.push(lsp("p1", &["02:00:00:00:00:01 10.0.0.2"]));

    let mut nb = nb_with(vec![ls], vec![]);
    nb.acls.push(acl);

    let mut sb = Southbound::default();

    converge(&mut Engine::new(), &mut nb, &mut sb);

    // TCP resets at priority + 1010, unreachables at priority + 1000.
    let resets: Vec<_> = find_flows(&sb, "ls_out_acl", 2010)
        .filter(|f| f.actions.contains("tcp_reset"))
        .collect();
    assert_eq!(resets.len(), 2, "one reset per address family");

    let unreachable: Vec<_> = find_flows(&sb, "ls_out_acl", 2000)
        .filter(|f| f.actions.contains("icmp4") || f.actions.contains("icmp6"))
        .collect();
    assert_eq!(unreachable.len(), 2);
}

#[test]
fn stateful_acl_closure() {
    let acl = Acl {
        id: AclId::random(),
        direction: AclDirection::FromLport,
        priority: 100,
        match_: "ip4".to_owned(),
        action: AclAction::AllowRelated,
        log: false,
        name: None,
        severity: None,
        meter: None,
    };

    let mut ls = switch("ls0");
    ls.acls.push(acl.id);
    ls.ports.push(lsp("p1", &["02:00:00:00:00:01 10.0.0.2"]));

    let mut nb = nb_with(vec![ls], vec![]);
    nb.acls.push(acl);

    let mut sb = Southbound::default();

    converge(&mut Engine::new(), &mut nb, &mut sb);

    // Every IP packet through PRE_ACL is marked for defragmentation.
    assert_eq!(
        flow_actions(&sb, "ls_in_pre_acl", 100, "ip"),
        Some("reg0[0] = 1; next;")
    );

    // The universal drop pair exists in both directions.
    for stage in ["ls_in_acl", "ls_out_acl"] {
        assert!(has_flow(
            &sb,
            stage,
            u16::MAX,
            "ct.inv || (ct.est && ct.rpl && ct_label.blocked == 1)"
        ));
    }
}

#[test]
fn ha_group_update_is_idempotent() {
    let mut lr = router("lr0");
    let mut ext = lrp("lr0-ext", "40:00:00:00:00:01", &["172.16.0.1/24"]);
    ext.gateway_chassis.push(GatewayChassis {
        chassis_name: "hv1".to_owned(),
        priority: 10,
    });
    ext.gateway_chassis.push(GatewayChassis {
        chassis_name: "hv2".to_owned(),
        priority: 5,
    });
    lr.ports.push(ext);

    let mut nb = nb_with(vec![], vec![lr]);
    let mut sb = Southbound::default();
    let mut engine = Engine::new();

    converge(&mut engine, &mut nb, &mut sb);

    let second = converge(&mut engine, &mut nb, &mut sb);
    let rewrites = second
        .sb_ops
        .iter()
        .filter(|op| matches!(op, SbOp::PutHaChassisGroup(_)))
        .count();

    assert_eq!(rewrites, 0);
}

#[test]
fn rbac_drift_is_corrected() {
    let mut nb = nb_with(vec![switch("ls0")], vec![]);
    let mut sb = Southbound::default();
    let mut engine = Engine::new();

    converge(&mut engine, &mut nb, &mut sb);

    let role = sb
        .rbac_roles
        .iter()
        .find(|r| r.name == "ovn-controller")
        .expect("role synthesized");
    assert_eq!(role.permissions.len(), 4);

    // Manual drift: someone grants Port_Binding inserts.
    sb.rbac_roles[0].permissions[2].insert_delete = true;

    converge(&mut engine, &mut nb, &mut sb);

    let role = sb
        .rbac_roles
        .iter()
        .find(|r| r.name == "ovn-controller")
        .unwrap();
    let pb = role
        .permissions
        .iter()
        .find(|p| p.table == "Port_Binding")
        .unwrap();
    assert!(!pb.insert_delete);
}

#[test]
fn dhcp_catalogs_are_synced_exactly() {
    let mut nb = nb_with(vec![switch("ls0")], vec![]);
    let mut sb = Southbound::default();

    // A stale row the engine does not know.
    sb.dhcp_options.push(DhcpOptRow {
        name: "bogus".to_owned(),
        code: 200,
        opt_type: "str".to_owned(),
    });

    converge(&mut Engine::new(), &mut nb, &mut sb);

    assert!(sb.dhcp_options.iter().all(|r| r.name != "bogus"));
    assert!(sb.dhcp_options.iter().any(|r| r.name == "router" && r.code == 3));
    assert!(sb.dhcpv6_options.iter().any(|r| r.name == "ia_addr" && r.code == 5));
}

#[test]
fn keys_are_stable_when_entities_persist() {
    let mut ls = switch("ls0");
    ls.ports.push(lsp("p1", &["02:00:00:00:00:01 10.0.0.2"]));
    ls.ports.push(lsp("p2", &["02:00:00:00:00:02 10.0.0.3"]));

    let mut nb = nb_with(vec![ls], vec![]);
    let mut sb = Southbound::default();
    let mut engine = Engine::new();

    converge(&mut engine, &mut nb, &mut sb);

    let p2_key = sb
        .port_bindings
        .iter()
        .find(|b| b.logical_port == "p2")
        .unwrap()
        .tunnel_key;

    // Deleting p1 must not move p2's key.
    nb.switches[0].ports.remove(0);
    converge(&mut engine, &mut nb, &mut sb);

    assert!(sb.port_bindings.iter().all(|b| b.logical_port != "p1"));
    assert_eq!(
        sb.port_bindings
            .iter()
            .find(|b| b.logical_port == "p2")
            .unwrap()
            .tunnel_key,
        p2_key
    );

    // A port added later does not reuse p2's key either.
    nb.switches[0].ports.push(lsp("p3", &["02:00:00:00:00:03 10.0.0.4"]));
    converge(&mut engine, &mut nb, &mut sb);

    let p3_key = sb
        .port_bindings
        .iter()
        .find(|b| b.logical_port == "p3")
        .unwrap()
        .tunnel_key;
    assert_ne!(p3_key, p2_key);
}

#[test]
fn deleted_ports_purge_their_mac_bindings() {
    let mut ls = switch("ls0");
    ls.ports.push(lsp("p1", &["02:00:00:00:00:01 10.0.0.2"]));

    let mut nb = nb_with(vec![ls], vec![]);
    let mut sb = Southbound::default();
    let mut engine = Engine::new();

    converge(&mut engine, &mut nb, &mut sb);

    let dp_uuid = sb.datapaths[0]
        .nb_key()
        .map(|k| k.uuid())
        .expect("datapath is keyed");

    sb.mac_bindings.push(MacBindingRow {
        logical_port: "p1".to_owned(),
        ip: "10.0.0.9".to_owned(),
        mac: "02:00:00:00:00:09".to_owned(),
        datapath: dp_uuid,
    });

    nb.switches[0].ports.clear();
    converge(&mut engine, &mut nb, &mut sb);

    assert!(sb.mac_bindings.is_empty());
}

#[test]
fn ipv6_ra_flows_for_configured_ports() {
    let mut lr = router("lr0");
    let mut port = lrp("lr0-a", "40:00:00:00:00:01", &["fd00::1/64"]);
    port.ipv6_ra_configs = options(&[("address_mode", "slaac"), ("mtu", "1500")]);
    lr.ports.push(port);

    let mut nb = nb_with(vec![], vec![lr]);
    let mut sb = Southbound::default();

    converge(&mut Engine::new(), &mut nb, &mut sb);

    let opts = flow_actions(
        &sb,
        "lr_in_nd_ra_options",
        50,
        "inport == \"lr0-a\" && ip6.dst == ff02::2 && nd_rs",
    )
    .expect("RA options flow");

    assert!(opts.contains("put_nd_ra_opts(addr_mode = \"slaac\""));
    assert!(opts.contains("mtu = 1500"));
    assert!(opts.contains("prefix = fd00::/64"));

    assert!(find_flows(&sb, "lr_in_nd_ra_response", 50).next().is_some());
}

#[test]
fn empty_lb_backends_trigger_controller_event() {
    let lb = LoadBalancer {
        id: LbId::random(),
        name: "lb0".to_owned(),
        vips: options(&[("10.0.0.100:80", "")]).into_iter().collect(),
        protocol: Some(LbProtocol::Tcp),
    };

    let mut ls = switch("ls0");
    ls.load_balancer.push(lb.id);
    ls.ports.push(lsp("p1", &["02:00:00:00:00:01 10.0.0.5"]));

    let mut nb = nb_with(vec![ls], vec![]);
    nb.global
        .options
        .insert("controller_event".to_owned(), "true".to_owned());
    nb.load_balancers.push(lb);

    let mut sb = Southbound::default();

    converge(&mut Engine::new(), &mut nb, &mut sb);

    let event = find_flows(&sb, "ls_in_stateful", 130)
        .next()
        .expect("trigger_event flow");
    assert!(event.actions.contains("trigger_event(event = \"empty_lb_backends\""));
    assert!(event.actions.contains("vip = \"10.0.0.100:80\""));
}
