//! The southbound schema: the materialized state consumed by the
//! per-hypervisor agents.

use crate::nb::MeterBand;
use crate::{DnsId, LrId, LsId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// A consistent snapshot of the southbound database.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Southbound {
    #[serde(default)]
    pub global: SbGlobal,
    #[serde(default)]
    pub chassis: Vec<Chassis>,
    #[serde(default)]
    pub datapaths: Vec<DatapathBinding>,
    #[serde(default)]
    pub port_bindings: Vec<PortBinding>,
    #[serde(default)]
    pub lflows: Vec<LogicalFlowRow>,
    #[serde(default)]
    pub multicast_groups: Vec<MulticastGroupRow>,
    #[serde(default)]
    pub igmp_groups: Vec<IgmpGroupRow>,
    #[serde(default)]
    pub ha_chassis_groups: Vec<HaChassisGroupRow>,
    #[serde(default)]
    pub mac_bindings: Vec<MacBindingRow>,
    #[serde(default)]
    pub dns: Vec<DnsRow>,
    #[serde(default)]
    pub address_sets: Vec<SbAddressSet>,
    #[serde(default)]
    pub port_groups: Vec<SbPortGroup>,
    #[serde(default)]
    pub meters: Vec<SbMeter>,
    #[serde(default)]
    pub dhcp_options: Vec<DhcpOptRow>,
    #[serde(default)]
    pub dhcpv6_options: Vec<DhcpOptRow>,
    #[serde(default)]
    pub rbac_roles: Vec<RbacRole>,
    #[serde(default)]
    pub ip_multicast: Vec<IpMulticastRow>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SbGlobal {
    /// Monotonically increasing commit sequence number of the store itself.
    #[serde(default)]
    pub cfg: i64,
    #[serde(default)]
    pub nb_cfg: i64,
    #[serde(default)]
    pub ipsec: bool,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Encap {
    #[serde(rename = "type")]
    pub encap_type: String,
    pub ip: String,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chassis {
    pub name: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub nb_cfg: i64,
    #[serde(default)]
    pub encaps: Vec<Encap>,
    #[serde(default)]
    pub external_ids: BTreeMap<String, String>,
}

/// The northbound identity a datapath binding mirrors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, derive_more::From)]
pub enum DpKey {
    Switch(LsId),
    Router(LrId),
}

impl DpKey {
    pub fn uuid(&self) -> Uuid {
        match *self {
            DpKey::Switch(id) => id.into(),
            DpKey::Router(id) => id.into(),
        }
    }
}

impl fmt::Display for DpKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DpKey::Switch(id) => write!(f, "switch {id}"),
            DpKey::Router(id) => write!(f, "router {id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatapathBinding {
    /// 24-bit, unique across all datapaths, stable while the identity persists.
    pub tunnel_key: u32,
    /// Carries `logical-switch` or `logical-router` plus diagnostic names.
    #[serde(default)]
    pub external_ids: BTreeMap<String, String>,
}

impl DatapathBinding {
    /// The northbound identity recorded in `external_ids`, if it is well formed.
    ///
    /// A row carrying both keys (or an unparsable one) has no identity and is
    /// garbage-collected by the reconciler.
    pub fn nb_key(&self) -> Option<DpKey> {
        let ls = self.external_ids.get("logical-switch");
        let lr = self.external_ids.get("logical-router");

        match (ls, lr) {
            (Some(ls), None) => ls.parse().ok().map(DpKey::Switch),
            (None, Some(lr)) => lr.parse().ok().map(DpKey::Router),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortBinding {
    pub logical_port: String,
    /// The northbound identity of the owning datapath.
    pub datapath: Uuid,
    /// 15-bit, scoped to the datapath.
    pub tunnel_key: u16,
    #[serde(default, rename = "type")]
    pub port_type: String,
    #[serde(default)]
    pub parent_port: Option<String>,
    #[serde(default)]
    pub tag: Option<u16>,
    /// Written by the hosting hypervisor, read here for `ref_chassis` and
    /// queue accounting.
    #[serde(default)]
    pub chassis: Option<String>,
    #[serde(default)]
    pub ha_chassis_group: Option<String>,
    #[serde(default)]
    pub virtual_parent: Option<String>,
    #[serde(default)]
    pub mac: Vec<String>,
    #[serde(default)]
    pub nat_addresses: Vec<String>,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
    #[serde(default)]
    pub external_ids: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Pipeline {
    Ingress,
    Egress,
}

impl fmt::Display for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pipeline::Ingress => "ingress".fmt(f),
            Pipeline::Egress => "egress".fmt(f),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogicalFlowRow {
    /// The northbound identity of the owning datapath.
    pub datapath: Uuid,
    pub pipeline: Pipeline,
    pub table_id: u8,
    pub priority: u16,
    #[serde(rename = "match")]
    pub match_: String,
    pub actions: String,
    #[serde(default)]
    pub external_ids: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MulticastGroupRow {
    /// The northbound identity of the owning datapath.
    pub datapath: Uuid,
    pub name: String,
    pub tunnel_key: u16,
    #[serde(default)]
    pub ports: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IgmpGroupRow {
    pub address: String,
    /// The northbound identity of the owning datapath.
    pub datapath: Uuid,
    pub chassis: String,
    #[serde(default)]
    pub ports: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SbHaChassis {
    pub chassis_name: String,
    pub priority: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HaChassisGroupRow {
    pub name: String,
    #[serde(default)]
    pub ha_chassis: Vec<SbHaChassis>,
    #[serde(default)]
    pub ref_chassis: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MacBindingRow {
    pub logical_port: String,
    pub ip: String,
    pub mac: String,
    /// The northbound identity of the owning datapath.
    pub datapath: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DnsRow {
    #[serde(default)]
    pub datapaths: Vec<Uuid>,
    #[serde(default)]
    pub records: BTreeMap<String, String>,
    /// Carries `dns_id`, the northbound record identity.
    #[serde(default)]
    pub external_ids: BTreeMap<String, String>,
}

impl DnsRow {
    pub fn dns_id(&self) -> Option<DnsId> {
        self.external_ids.get("dns_id")?.parse().ok()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SbAddressSet {
    pub name: String,
    #[serde(default)]
    pub addresses: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SbPortGroup {
    pub name: String,
    #[serde(default)]
    pub ports: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SbMeter {
    pub name: String,
    pub unit: String,
    #[serde(default)]
    pub bands: Vec<MeterBand>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DhcpOptRow {
    pub name: String,
    pub code: u8,
    #[serde(rename = "type")]
    pub opt_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RbacPermission {
    pub table: String,
    #[serde(default)]
    pub authorization: Vec<String>,
    #[serde(default)]
    pub insert_delete: bool,
    #[serde(default)]
    pub update: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RbacRole {
    pub name: String,
    #[serde(default)]
    pub permissions: Vec<RbacPermission>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpMulticastRow {
    /// The northbound identity of the owning datapath.
    pub datapath: Uuid,
    pub enabled: bool,
    pub querier: bool,
    #[serde(default)]
    pub table_size: i64,
    #[serde(default)]
    pub idle_timeout: i64,
    #[serde(default)]
    pub query_interval: i64,
    #[serde(default)]
    pub query_max_resp: i64,
    #[serde(default)]
    pub eth_src: String,
    #[serde(default)]
    pub ip4_src: String,
}
