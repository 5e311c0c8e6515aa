//! Partitioning of routers into connected components.
//!
//! Two routers are adjacent when some logical switch has router-type ports
//! peered to both. The component determines which chassis can reach a
//! gateway and therefore feeds `ref_chassis` on HA chassis groups.

use crate::datapath::{Datapaths, DpKind};
use crate::port::{Ports, PortSource};
use northd_model::nb::{LspType, Northbound};
use northd_model::sb::Southbound;
use std::collections::{BTreeSet, HashMap, HashSet};

/// Assigns every router datapath to a connected component and records the
/// component index on the datapath.
pub(crate) fn build_router_groups(nb: &Northbound, datapaths: &mut Datapaths, ports: &Ports) {
    // Adjacency via switches: collect the routers attached to each switch.
    let mut routers_by_switch: HashMap<usize, Vec<usize>> = HashMap::new();

    for port in ports.iter() {
        let PortSource::Lsp { .. } = port.source else {
            continue;
        };

        if port.lsp_type(nb) != Some(LspType::Router) {
            continue;
        }

        let Some(peer) = port.peer else { continue };
        let router_dp = ports.items[peer].dp;

        routers_by_switch.entry(port.dp).or_default().push(router_dp);
    }

    let mut adjacency: HashMap<usize, HashSet<usize>> = HashMap::new();

    for routers in routers_by_switch.values() {
        for &a in routers {
            for &b in routers {
                if a != b {
                    adjacency.entry(a).or_default().insert(b);
                }
            }
        }
    }

    let mut visited = HashSet::new();
    let mut group = 0;

    for start in 0..datapaths.items.len() {
        if datapaths.items[start].kind != DpKind::Router || visited.contains(&start) {
            continue;
        }

        let mut queue = vec![start];
        visited.insert(start);

        while let Some(dp) = queue.pop() {
            datapaths.items[dp].router_group = Some(group);

            if let Some(neighbors) = adjacency.get(&dp) {
                for &next in neighbors {
                    if visited.insert(next) {
                        queue.push(next);
                    }
                }
            }
        }

        group += 1;
    }
}

/// The chassis hosting any port on any switch reachable from the component.
///
/// Reachable switches are those with a router-type port peered into a router
/// of the component (transit switches connect components by construction).
pub(crate) fn component_chassis(
    nb: &Northbound,
    sb: &Southbound,
    datapaths: &Datapaths,
    ports: &Ports,
    group: usize,
) -> BTreeSet<String> {
    let mut switches = HashSet::new();

    for port in ports.iter() {
        let PortSource::Lsp { .. } = port.source else {
            continue;
        };

        if port.lsp_type(nb) != Some(LspType::Router) {
            continue;
        }

        let Some(peer) = port.peer else { continue };

        if datapaths.items[ports.items[peer].dp].router_group == Some(group) {
            switches.insert(port.dp);
        }
    }

    let mut chassis = BTreeSet::new();
    let switch_uuids: HashSet<_> = switches
        .iter()
        .map(|&dp| datapaths.items[dp].key.uuid())
        .collect();

    for binding in &sb.port_bindings {
        if let Some(name) = &binding.chassis {
            if switch_uuids.contains(&binding.datapath) {
                chassis.insert(name.clone());
            }
        }
    }

    chassis
}
