//! The northbound schema: the desired state declared by the CMS.
//!
//! Rows reference each other by 128-bit identifiers assigned northbound;
//! the translator owns no identifiers of its own except tunnel keys and
//! dynamic MAC/IPv4 assignments.

use crate::{AclId, AddressSetId, DhcpOptionsId, DnsId, HaGroupId, LbId, LspId, MeterId, QosId};
use crate::{LrId, LrpId, LsId, PortGroupId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A consistent snapshot of the northbound database.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Northbound {
    #[serde(default)]
    pub global: NbGlobal,
    #[serde(default)]
    pub switches: Vec<LogicalSwitch>,
    #[serde(default)]
    pub routers: Vec<LogicalRouter>,
    #[serde(default)]
    pub acls: Vec<Acl>,
    #[serde(default)]
    pub qos_rules: Vec<QosRule>,
    #[serde(default)]
    pub load_balancers: Vec<LoadBalancer>,
    #[serde(default)]
    pub dhcp_options: Vec<DhcpOptions>,
    #[serde(default)]
    pub dns: Vec<DnsRecords>,
    #[serde(default)]
    pub address_sets: Vec<AddressSet>,
    #[serde(default)]
    pub port_groups: Vec<PortGroup>,
    #[serde(default)]
    pub meters: Vec<Meter>,
    #[serde(default)]
    pub ha_chassis_groups: Vec<HaChassisGroup>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NbGlobal {
    #[serde(default)]
    pub nb_cfg: i64,
    #[serde(default)]
    pub sb_cfg: i64,
    #[serde(default)]
    pub hv_cfg: i64,
    #[serde(default)]
    pub ipsec: bool,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogicalSwitch {
    pub id: LsId,
    pub name: String,
    #[serde(default)]
    pub ports: Vec<LogicalSwitchPort>,
    #[serde(default)]
    pub acls: Vec<AclId>,
    #[serde(default)]
    pub qos_rules: Vec<QosId>,
    #[serde(default)]
    pub load_balancer: Vec<LbId>,
    #[serde(default)]
    pub dns_records: Vec<DnsId>,
    #[serde(default)]
    pub other_config: BTreeMap<String, String>,
    #[serde(default)]
    pub external_ids: BTreeMap<String, String>,
}

/// The type of a logical switch port.
///
/// The empty string (a plain VIF) is `Vif`; everything else matches the
/// northbound `type` column verbatim.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LspType {
    #[default]
    #[serde(rename = "")]
    Vif,
    Router,
    Localnet,
    L2Gateway,
    Vtep,
    Virtual,
    External,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogicalSwitchPort {
    pub id: LspId,
    pub name: String,
    #[serde(default, rename = "type")]
    pub port_type: LspType,
    #[serde(default)]
    pub addresses: Vec<String>,
    #[serde(default)]
    pub dynamic_addresses: Option<String>,
    #[serde(default)]
    pub port_security: Vec<String>,
    /// `None` means enabled.
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub up: Option<bool>,
    #[serde(default)]
    pub parent_name: Option<String>,
    /// 0 requests dynamic allocation of a tag.
    #[serde(default)]
    pub tag_request: Option<u16>,
    #[serde(default)]
    pub tag: Option<u16>,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
    #[serde(default)]
    pub dhcpv4_options: Option<DhcpOptionsId>,
    #[serde(default)]
    pub dhcpv6_options: Option<DhcpOptionsId>,
    #[serde(default)]
    pub ha_chassis_group: Option<HaGroupId>,
    #[serde(default)]
    pub external_ids: BTreeMap<String, String>,
}

impl LogicalSwitchPort {
    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogicalRouter {
    pub id: LrId,
    pub name: String,
    #[serde(default)]
    pub ports: Vec<LogicalRouterPort>,
    #[serde(default)]
    pub static_routes: Vec<StaticRoute>,
    #[serde(default)]
    pub policies: Vec<RoutingPolicy>,
    #[serde(default)]
    pub nat: Vec<NatRule>,
    #[serde(default)]
    pub load_balancer: Vec<LbId>,
    /// `None` means enabled.
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
    #[serde(default)]
    pub external_ids: BTreeMap<String, String>,
}

impl LogicalRouter {
    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogicalRouterPort {
    pub id: LrpId,
    pub name: String,
    pub mac: String,
    /// `ip/plen` strings, IPv4 and IPv6 mixed.
    #[serde(default)]
    pub networks: Vec<String>,
    /// Names another LRP for router-to-router peering.
    #[serde(default)]
    pub peer: Option<String>,
    /// `None` means enabled.
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub ipv6_ra_configs: BTreeMap<String, String>,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
    #[serde(default)]
    pub gateway_chassis: Vec<GatewayChassis>,
    #[serde(default)]
    pub ha_chassis_group: Option<HaGroupId>,
    #[serde(default)]
    pub external_ids: BTreeMap<String, String>,
}

impl LogicalRouterPort {
    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayChassis {
    pub chassis_name: String,
    #[serde(default)]
    pub priority: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RoutePolicy {
    #[default]
    DstIp,
    SrcIp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticRoute {
    pub ip_prefix: String,
    pub nexthop: String,
    #[serde(default)]
    pub output_port: Option<String>,
    #[serde(default)]
    pub policy: Option<RoutePolicy>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyAction {
    Allow,
    Drop,
    Reroute,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingPolicy {
    pub priority: i64,
    #[serde(rename = "match")]
    pub match_: String,
    pub action: PolicyAction,
    #[serde(default)]
    pub nexthop: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NatType {
    Snat,
    Dnat,
    DnatAndSnat,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NatRule {
    #[serde(rename = "type")]
    pub nat_type: NatType,
    pub external_ip: String,
    #[serde(default)]
    pub external_mac: Option<String>,
    /// An address or a CIDR.
    pub logical_ip: String,
    #[serde(default)]
    pub logical_port: Option<String>,
    #[serde(default)]
    pub stateless: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AclDirection {
    FromLport,
    ToLport,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AclAction {
    Allow,
    AllowRelated,
    Drop,
    Reject,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Acl {
    pub id: AclId,
    pub direction: AclDirection,
    /// 0..=32767; offset by 1000 before emission.
    pub priority: i64,
    #[serde(rename = "match")]
    pub match_: String,
    pub action: AclAction,
    #[serde(default)]
    pub log: bool,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub severity: Option<String>,
    #[serde(default)]
    pub meter: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QosRule {
    pub id: QosId,
    pub direction: AclDirection,
    pub priority: i64,
    #[serde(rename = "match")]
    pub match_: String,
    #[serde(default)]
    pub dscp: Option<u8>,
    #[serde(default)]
    pub bandwidth_rate: Option<u64>,
    #[serde(default)]
    pub bandwidth_burst: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LbProtocol {
    Tcp,
    Udp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadBalancer {
    pub id: LbId,
    #[serde(default)]
    pub name: String,
    /// `ip` or `ip:port` to a comma-separated `ip:port` backend list.
    #[serde(default)]
    pub vips: BTreeMap<String, String>,
    #[serde(default)]
    pub protocol: Option<LbProtocol>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DhcpOptions {
    pub id: DhcpOptionsId,
    pub cidr: String,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
    #[serde(default)]
    pub external_ids: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsRecords {
    pub id: DnsId,
    #[serde(default)]
    pub records: BTreeMap<String, String>,
    #[serde(default)]
    pub external_ids: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddressSet {
    pub id: AddressSetId,
    pub name: String,
    #[serde(default)]
    pub addresses: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortGroup {
    pub id: PortGroupId,
    pub name: String,
    #[serde(default)]
    pub ports: Vec<LspId>,
    #[serde(default)]
    pub acls: Vec<AclId>,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MeterBand {
    pub action: String,
    pub rate: i64,
    #[serde(default)]
    pub burst_size: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Meter {
    pub id: MeterId,
    pub name: String,
    pub unit: String,
    #[serde(default)]
    pub bands: Vec<MeterBand>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HaChassis {
    pub chassis_name: String,
    #[serde(default)]
    pub priority: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HaChassisGroup {
    pub id: HaGroupId,
    pub name: String,
    #[serde(default)]
    pub ha_chassis: Vec<HaChassis>,
}
