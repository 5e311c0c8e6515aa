//! Write batches produced by a translation pass.
//!
//! A pass is sans-IO: it returns the minimal set of operations required to
//! converge both databases and the caller applies them in one transaction.

use crate::sb::{
    DatapathBinding, DhcpOptRow, DnsRow, HaChassisGroupRow, IgmpGroupRow, IpMulticastRow,
    LogicalFlowRow, MacBindingRow, MulticastGroupRow, PortBinding, RbacRole, SbAddressSet,
    SbMeter, SbPortGroup,
};
use crate::{DnsId, LspId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// One write against the southbound database.
///
/// `Put*` operations upsert on the table's natural key; `Delete*` operations
/// carrying a full row delete by value so that keyless garbage rows can be
/// removed too.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SbOp {
    PutDatapath(DatapathBinding),
    DeleteDatapath(DatapathBinding),
    PutPortBinding(PortBinding),
    DeletePortBinding { logical_port: String },
    DeleteMacBinding(MacBindingRow),
    InsertLflow(LogicalFlowRow),
    DeleteLflow(LogicalFlowRow),
    PutMulticastGroup(MulticastGroupRow),
    DeleteMulticastGroup { datapath: Uuid, name: String },
    DeleteIgmpGroup(IgmpGroupRow),
    PutHaChassisGroup(HaChassisGroupRow),
    DeleteHaChassisGroup { name: String },
    PutAddressSet(SbAddressSet),
    DeleteAddressSet { name: String },
    PutPortGroup(SbPortGroup),
    DeletePortGroup { name: String },
    PutMeter(SbMeter),
    DeleteMeter { name: String },
    PutDns(DnsRow),
    DeleteDns { dns_id: DnsId },
    InsertDhcpOption { v6: bool, row: DhcpOptRow },
    DeleteDhcpOption { v6: bool, name: String },
    PutIpMulticast(IpMulticastRow),
    DeleteIpMulticast { datapath: Uuid },
    PutRbacRole(RbacRole),
    SetNbCfg(i64),
    SetIpsec(bool),
    SetOptions(BTreeMap<String, String>),
}

/// One write back into the northbound database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NbOp {
    SetDynamicAddresses {
        port: LspId,
        addresses: Option<String>,
    },
    SetTag {
        port: LspId,
        tag: u16,
    },
    SetMacPrefix(String),
    SetSbCfg(i64),
    SetHvCfg(i64),
}

/// Applies a batch of southbound operations to a snapshot.
///
/// Upserts match on the table's natural key; value deletes remove the first
/// equal row.
pub fn apply_sb_ops(sb: &mut crate::sb::Southbound, ops: &[SbOp]) {
    fn upsert<T: Clone, K: Eq>(rows: &mut Vec<T>, key: impl Fn(&T) -> K, row: &T) {
        let k = key(row);

        match rows.iter_mut().find(|r| key(r) == k) {
            Some(existing) => *existing = row.clone(),
            None => rows.push(row.clone()),
        }
    }

    fn delete_value<T: PartialEq>(rows: &mut Vec<T>, row: &T) {
        if let Some(ix) = rows.iter().position(|r| r == row) {
            rows.remove(ix);
        }
    }

    for op in ops {
        match op {
            SbOp::PutDatapath(row) => match row.nb_key() {
                // Only keyed rows can be upserted; garbage rows are inserted
                // verbatim (and reaped by the next pass).
                Some(_) => upsert(&mut sb.datapaths, |r| r.nb_key(), row),
                None => sb.datapaths.push(row.clone()),
            },
            SbOp::DeleteDatapath(row) => delete_value(&mut sb.datapaths, row),
            SbOp::PutPortBinding(row) => {
                upsert(&mut sb.port_bindings, |r| r.logical_port.clone(), row)
            }
            SbOp::DeletePortBinding { logical_port } => {
                sb.port_bindings.retain(|r| &r.logical_port != logical_port)
            }
            SbOp::DeleteMacBinding(row) => delete_value(&mut sb.mac_bindings, row),
            SbOp::InsertLflow(row) => sb.lflows.push(row.clone()),
            SbOp::DeleteLflow(row) => {
                if let Some(ix) = sb.lflows.iter().position(|r| {
                    r.datapath == row.datapath
                        && r.pipeline == row.pipeline
                        && r.table_id == row.table_id
                        && r.priority == row.priority
                        && r.match_ == row.match_
                        && r.actions == row.actions
                }) {
                    sb.lflows.remove(ix);
                }
            }
            SbOp::PutMulticastGroup(row) => upsert(
                &mut sb.multicast_groups,
                |r| (r.datapath, r.name.clone()),
                row,
            ),
            SbOp::DeleteMulticastGroup { datapath, name } => sb
                .multicast_groups
                .retain(|r| !(r.datapath == *datapath && &r.name == name)),
            SbOp::DeleteIgmpGroup(row) => delete_value(&mut sb.igmp_groups, row),
            SbOp::PutHaChassisGroup(row) => {
                upsert(&mut sb.ha_chassis_groups, |r| r.name.clone(), row)
            }
            SbOp::DeleteHaChassisGroup { name } => {
                sb.ha_chassis_groups.retain(|r| &r.name != name)
            }
            SbOp::PutAddressSet(row) => upsert(&mut sb.address_sets, |r| r.name.clone(), row),
            SbOp::DeleteAddressSet { name } => sb.address_sets.retain(|r| &r.name != name),
            SbOp::PutPortGroup(row) => upsert(&mut sb.port_groups, |r| r.name.clone(), row),
            SbOp::DeletePortGroup { name } => sb.port_groups.retain(|r| &r.name != name),
            SbOp::PutMeter(row) => upsert(&mut sb.meters, |r| r.name.clone(), row),
            SbOp::DeleteMeter { name } => sb.meters.retain(|r| &r.name != name),
            SbOp::PutDns(row) => upsert(&mut sb.dns, |r| r.dns_id(), row),
            SbOp::DeleteDns { dns_id } => sb.dns.retain(|r| r.dns_id() != Some(*dns_id)),
            SbOp::InsertDhcpOption { v6, row } => match v6 {
                false => sb.dhcp_options.push(row.clone()),
                true => sb.dhcpv6_options.push(row.clone()),
            },
            SbOp::DeleteDhcpOption { v6, name } => match v6 {
                false => sb.dhcp_options.retain(|r| &r.name != name),
                true => sb.dhcpv6_options.retain(|r| &r.name != name),
            },
            SbOp::PutIpMulticast(row) => upsert(&mut sb.ip_multicast, |r| r.datapath, row),
            SbOp::DeleteIpMulticast { datapath } => {
                sb.ip_multicast.retain(|r| r.datapath != *datapath)
            }
            SbOp::PutRbacRole(row) => upsert(&mut sb.rbac_roles, |r| r.name.clone(), row),
            SbOp::SetNbCfg(v) => sb.global.nb_cfg = *v,
            SbOp::SetIpsec(v) => sb.global.ipsec = *v,
            SbOp::SetOptions(options) => sb.global.options = options.clone(),
        }
    }
}

/// Applies a batch of northbound write-backs to a snapshot.
pub fn apply_nb_ops(nb: &mut crate::nb::Northbound, ops: &[NbOp]) {
    for op in ops {
        match op {
            NbOp::SetDynamicAddresses { port, addresses } => {
                for lsp in nb.switches.iter_mut().flat_map(|ls| ls.ports.iter_mut()) {
                    if lsp.id == *port {
                        lsp.dynamic_addresses = addresses.clone();
                    }
                }
            }
            NbOp::SetTag { port, tag } => {
                for lsp in nb.switches.iter_mut().flat_map(|ls| ls.ports.iter_mut()) {
                    if lsp.id == *port {
                        lsp.tag = Some(*tag);
                    }
                }
            }
            NbOp::SetMacPrefix(prefix) => {
                nb.global
                    .options
                    .insert("mac_prefix".to_owned(), prefix.clone());
            }
            NbOp::SetSbCfg(v) => nb.global.sb_cfg = *v,
            NbOp::SetHvCfg(v) => nb.global.hv_cfg = *v,
        }
    }
}
