//! Diffing of the computed target state against the observed southbound
//! database, producing the minimal write batch.
//!
//! Rows present on both sides cost nothing; rows only observed are deleted;
//! rows only computed are inserted. Updates are upserts keyed by each
//! table's natural key. Operations are emitted in a deterministic order so
//! identical passes produce identical batches.

use crate::lflow::LflowSet;
use northd_model::ops::SbOp;
use northd_model::sb::{
    DatapathBinding, DnsRow, HaChassisGroupRow, IpMulticastRow, LogicalFlowRow,
    MulticastGroupRow, PortBinding, RbacRole, SbAddressSet, SbMeter, SbPortGroup, Southbound,
};
use northd_model::DnsId;
use std::collections::{BTreeMap, HashMap, HashSet};
use uuid::Uuid;

/// Everything a pass computes, ready to be compared against the database.
#[derive(Debug, Default)]
pub(crate) struct Target {
    pub datapaths: Vec<DatapathBinding>,
    pub port_bindings: Vec<PortBinding>,
    pub lflows: LflowSet,
    pub multicast_groups: Vec<MulticastGroupRow>,
    pub igmp_deletes: Vec<northd_model::sb::IgmpGroupRow>,
    pub ha_chassis_groups: Vec<HaChassisGroupRow>,
    pub address_sets: Vec<SbAddressSet>,
    pub port_groups: Vec<SbPortGroup>,
    pub meters: Vec<SbMeter>,
    pub dns: Vec<DnsRow>,
    pub dhcp_options: Vec<northd_model::sb::DhcpOptRow>,
    pub dhcpv6_options: Vec<northd_model::sb::DhcpOptRow>,
    pub ip_multicast: Vec<IpMulticastRow>,
    pub rbac: Option<RbacRole>,
}

pub(crate) fn diff(target: &Target, sb: &Southbound) -> Vec<SbOp> {
    let mut ops = Vec::new();

    diff_datapaths(target, sb, &mut ops);
    diff_port_bindings(target, sb, &mut ops);
    diff_lflows(target, sb, &mut ops);
    diff_multicast(target, sb, &mut ops);
    ops.extend(target.igmp_deletes.iter().cloned().map(SbOp::DeleteIgmpGroup));
    diff_ha_groups(target, sb, &mut ops);
    diff_named(
        &target.address_sets,
        &sb.address_sets,
        |r| r.name.clone(),
        SbOp::PutAddressSet,
        |name| SbOp::DeleteAddressSet { name },
        &mut ops,
    );
    diff_named(
        &target.port_groups,
        &sb.port_groups,
        |r| r.name.clone(),
        SbOp::PutPortGroup,
        |name| SbOp::DeletePortGroup { name },
        &mut ops,
    );
    diff_named(
        &target.meters,
        &sb.meters,
        |r| r.name.clone(),
        SbOp::PutMeter,
        |name| SbOp::DeleteMeter { name },
        &mut ops,
    );
    diff_dns(target, sb, &mut ops);
    diff_dhcp_catalog(&target.dhcp_options, &sb.dhcp_options, false, &mut ops);
    diff_dhcp_catalog(&target.dhcpv6_options, &sb.dhcpv6_options, true, &mut ops);
    diff_ip_multicast(target, sb, &mut ops);

    if let Some(role) = &target.rbac {
        let observed = sb.rbac_roles.iter().find(|r| r.name == role.name);

        // Any drift rewrites the whole role.
        if observed != Some(role) {
            ops.push(SbOp::PutRbacRole(role.clone()));
        }
    }

    ops
}

fn diff_datapaths(target: &Target, sb: &Southbound, ops: &mut Vec<SbOp>) {
    let mut wanted: BTreeMap<Uuid, &DatapathBinding> = BTreeMap::new();

    for row in &target.datapaths {
        if let Some(key) = row.nb_key() {
            wanted.insert(key.uuid(), row);
        }
    }

    // One observed row may keep each key; everything else goes.
    let mut kept: HashSet<Uuid> = HashSet::new();

    for row in &sb.datapaths {
        let keep = row
            .nb_key()
            .map(|k| k.uuid())
            .filter(|uuid| wanted.contains_key(uuid) && kept.insert(*uuid));

        if keep.is_none() {
            ops.push(SbOp::DeleteDatapath(row.clone()));
        }
    }

    for (uuid, row) in &wanted {
        let observed = sb
            .datapaths
            .iter()
            .find(|r| r.nb_key().map(|k| k.uuid()) == Some(*uuid));

        if observed != Some(*row) {
            ops.push(SbOp::PutDatapath((*row).clone()));
        }
    }
}

fn diff_port_bindings(target: &Target, sb: &Southbound, ops: &mut Vec<SbOp>) {
    let wanted: BTreeMap<&str, &PortBinding> = target
        .port_bindings
        .iter()
        .map(|r| (r.logical_port.as_str(), r))
        .collect();

    let mut deleted = Vec::new();

    for row in &sb.port_bindings {
        if !wanted.contains_key(row.logical_port.as_str()) {
            deleted.push(row.logical_port.clone());
            ops.push(SbOp::DeletePortBinding {
                logical_port: row.logical_port.clone(),
            });
        }
    }

    let observed: HashMap<&str, &PortBinding> = sb
        .port_bindings
        .iter()
        .map(|r| (r.logical_port.as_str(), r))
        .collect();

    for (name, row) in &wanted {
        if observed.get(name) != Some(row) {
            ops.push(SbOp::PutPortBinding((*row).clone()));
        }
    }

    // Bindings that disappeared take their neighbor-cache entries along.
    if !deleted.is_empty() {
        let deleted: HashSet<String> = deleted.into_iter().collect();

        for row in &sb.mac_bindings {
            if deleted.contains(&row.logical_port) {
                ops.push(SbOp::DeleteMacBinding(row.clone()));
            }
        }
    }
}

/// The identity of a logical flow for set comparison.
type FlowKey = (Uuid, northd_model::sb::Pipeline, u8, u16, String, String);

fn flow_key(row: &LogicalFlowRow) -> FlowKey {
    (
        row.datapath,
        row.pipeline,
        row.table_id,
        row.priority,
        row.match_.clone(),
        row.actions.clone(),
    )
}

fn diff_lflows(target: &Target, sb: &Southbound, ops: &mut Vec<SbOp>) {
    let mut computed: BTreeMap<FlowKey, LogicalFlowRow> = target
        .lflows
        .iter()
        .map(|f| {
            let row = f.to_row();
            (flow_key(&row), row)
        })
        .collect();

    for row in &sb.lflows {
        if computed.remove(&flow_key(row)).is_none() {
            ops.push(SbOp::DeleteLflow(row.clone()));
        }
    }

    // Whatever survived the probe above is new.
    for (_, row) in computed {
        ops.push(SbOp::InsertLflow(row));
    }
}

fn diff_multicast(target: &Target, sb: &Southbound, ops: &mut Vec<SbOp>) {
    let wanted: BTreeMap<(Uuid, &str), &MulticastGroupRow> = target
        .multicast_groups
        .iter()
        .map(|r| ((r.datapath, r.name.as_str()), r))
        .collect();

    for row in &sb.multicast_groups {
        if !wanted.contains_key(&(row.datapath, row.name.as_str())) {
            ops.push(SbOp::DeleteMulticastGroup {
                datapath: row.datapath,
                name: row.name.clone(),
            });
        }
    }

    let observed: HashMap<(Uuid, &str), &MulticastGroupRow> = sb
        .multicast_groups
        .iter()
        .map(|r| ((r.datapath, r.name.as_str()), r))
        .collect();

    for (key, row) in &wanted {
        if observed.get(key) != Some(row) {
            ops.push(SbOp::PutMulticastGroup((*row).clone()));
        }
    }
}

fn diff_ha_groups(target: &Target, sb: &Southbound, ops: &mut Vec<SbOp>) {
    diff_named(
        &target.ha_chassis_groups,
        &sb.ha_chassis_groups,
        |r| r.name.clone(),
        SbOp::PutHaChassisGroup,
        |name| SbOp::DeleteHaChassisGroup { name },
        ops,
    );
}

fn diff_named<T: Clone + PartialEq>(
    target: &[T],
    observed: &[T],
    key: impl Fn(&T) -> String,
    put: impl Fn(T) -> SbOp,
    delete: impl Fn(String) -> SbOp,
    ops: &mut Vec<SbOp>,
) {
    let wanted: BTreeMap<String, &T> = target.iter().map(|r| (key(r), r)).collect();

    for row in observed {
        if !wanted.contains_key(&key(row)) {
            ops.push(delete(key(row)));
        }
    }

    let have: HashMap<String, &T> = observed.iter().map(|r| (key(r), r)).collect();

    for (name, row) in &wanted {
        if have.get(name) != Some(row) {
            ops.push(put((*row).clone()));
        }
    }
}

fn diff_dns(target: &Target, sb: &Southbound, ops: &mut Vec<SbOp>) {
    let wanted: BTreeMap<DnsId, &DnsRow> = target
        .dns
        .iter()
        .filter_map(|r| r.dns_id().map(|id| (id, r)))
        .collect();

    for row in &sb.dns {
        match row.dns_id() {
            Some(id) if wanted.contains_key(&id) => {}
            Some(id) => ops.push(SbOp::DeleteDns { dns_id: id }),
            // Rows we cannot attribute are foreign; leave them alone.
            None => {}
        }
    }

    let observed: HashMap<DnsId, &DnsRow> = sb
        .dns
        .iter()
        .filter_map(|r| r.dns_id().map(|id| (id, r)))
        .collect();

    for (id, row) in &wanted {
        if observed.get(id) != Some(row) {
            ops.push(SbOp::PutDns((*row).clone()));
        }
    }
}

fn diff_dhcp_catalog(
    target: &[northd_model::sb::DhcpOptRow],
    observed: &[northd_model::sb::DhcpOptRow],
    v6: bool,
    ops: &mut Vec<SbOp>,
) {
    let wanted: BTreeMap<&str, &northd_model::sb::DhcpOptRow> =
        target.iter().map(|r| (r.name.as_str(), r)).collect();
    let have: BTreeMap<&str, &northd_model::sb::DhcpOptRow> =
        observed.iter().map(|r| (r.name.as_str(), r)).collect();

    for (name, row) in &have {
        if wanted.get(name) != Some(row) {
            ops.push(SbOp::DeleteDhcpOption {
                v6,
                name: (*name).to_owned(),
            });
        }
    }

    for (name, row) in &wanted {
        if have.get(name) != Some(row) {
            ops.push(SbOp::InsertDhcpOption {
                v6,
                row: (*row).clone(),
            });
        }
    }
}

fn diff_ip_multicast(target: &Target, sb: &Southbound, ops: &mut Vec<SbOp>) {
    let wanted: BTreeMap<Uuid, &IpMulticastRow> =
        target.ip_multicast.iter().map(|r| (r.datapath, r)).collect();

    for row in &sb.ip_multicast {
        if !wanted.contains_key(&row.datapath) {
            ops.push(SbOp::DeleteIpMulticast {
                datapath: row.datapath,
            });
        }
    }

    let observed: HashMap<Uuid, &IpMulticastRow> =
        sb.ip_multicast.iter().map(|r| (r.datapath, r)).collect();

    for (uuid, row) in &wanted {
        if observed.get(uuid) != Some(row) {
            ops.push(SbOp::PutIpMulticast((*row).clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_catalogs_produce_no_ops() {
        let rows = vec![northd_model::sb::DhcpOptRow {
            name: "router".to_owned(),
            code: 3,
            opt_type: "ipv4".to_owned(),
        }];

        let mut ops = Vec::new();
        diff_dhcp_catalog(&rows, &rows, false, &mut ops);

        assert!(ops.is_empty());
    }

    #[test]
    fn changed_catalog_row_is_replaced() {
        let wanted = vec![northd_model::sb::DhcpOptRow {
            name: "mtu".to_owned(),
            code: 26,
            opt_type: "uint16".to_owned(),
        }];
        let observed = vec![northd_model::sb::DhcpOptRow {
            name: "mtu".to_owned(),
            code: 99,
            opt_type: "uint16".to_owned(),
        }];

        let mut ops = Vec::new();
        diff_dhcp_catalog(&wanted, &observed, false, &mut ops);

        assert_eq!(ops.len(), 2);
        assert!(matches!(ops[0], SbOp::DeleteDhcpOption { .. }));
        assert!(matches!(ops[1], SbOp::InsertDhcpOption { .. }));
    }
}
