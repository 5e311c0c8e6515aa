//! The translation engine: turns a consistent snapshot of the northbound
//! database plus the observed southbound database into the write batch that
//! converges both.
//!
//! A pass is pure CPU once the snapshots are in hand: no I/O, no clocks
//! beyond the `Instant` the caller passes in for warn rate-limiting. Tests
//! drive the engine by feeding snapshots and asserting on the output.

#![cfg_attr(test, allow(clippy::unwrap_used))]

mod addresses;
mod alloc;
mod datapath;
mod diff;
mod ha;
mod ipam;
mod lb;
mod lflow;
mod mcast;
mod port;
mod ratelimit;
mod rbac;
mod router;
mod router_group;
mod switch;
mod sync;

#[cfg(test)]
mod tests;

use crate::datapath::{Datapath, Datapaths};
use crate::ipam::{MacPrefix, MacSet};
use crate::mcast::Mcast;
use crate::port::Ports;
use crate::ratelimit::RateLimit;
use northd_model::nb::{
    Acl, DhcpOptions, DnsRecords, LoadBalancer, LogicalRouter, LogicalSwitch, Northbound,
    PortGroup, QosRule,
};
use northd_model::ops::{NbOp, SbOp};
use northd_model::sb::Southbound;
use northd_model::{AclId, DhcpOptionsId, DnsId, LbId, QosId};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// The engine's warn limiters: configuration errors at 1/s, allocator
/// exhaustion at 1/5s.
pub(crate) struct Warnings {
    pub cfg: RateLimit,
    pub alloc: RateLimit,
}

impl Default for Warnings {
    fn default() -> Self {
        Self {
            cfg: RateLimit::new(Duration::from_secs(1)),
            alloc: RateLimit::new(Duration::from_secs(5)),
        }
    }
}

/// Read-only pass context shared by the pipeline generators.
pub(crate) struct Ctx<'a> {
    pub nb: &'a Northbound,
    pub sb: &'a Southbound,
    pub datapaths: &'a Datapaths,
    pub ports: &'a Ports,
    pub mcast: &'a Mcast,
    pub warn: &'a Warnings,
    pub now: Instant,
    pub acls: HashMap<AclId, &'a Acl>,
    pub qos: HashMap<QosId, &'a QosRule>,
    pub lbs: HashMap<LbId, &'a LoadBalancer>,
    pub dhcp_opts: HashMap<DhcpOptionsId, &'a DhcpOptions>,
    pub dns: HashMap<DnsId, &'a DnsRecords>,
    /// Port groups whose members touch each switch datapath.
    pub pgs_by_switch: HashMap<usize, Vec<&'a PortGroup>>,
}

impl<'a> Ctx<'a> {
    fn new(
        nb: &'a Northbound,
        sb: &'a Southbound,
        datapaths: &'a Datapaths,
        ports: &'a Ports,
        mcast: &'a Mcast,
        warn: &'a Warnings,
        now: Instant,
    ) -> Self {
        let mut pgs_by_switch: HashMap<usize, Vec<&'a PortGroup>> = HashMap::new();

        for pg in &nb.port_groups {
            let mut switches: Vec<usize> = pg
                .ports
                .iter()
                .filter_map(|lsp| {
                    ports
                        .items
                        .iter()
                        .find(|p| p.lsp(nb).is_some_and(|l| l.id == *lsp))
                        .map(|p| p.dp)
                })
                .collect();

            switches.sort_unstable();
            switches.dedup();

            for dp in switches {
                pgs_by_switch.entry(dp).or_default().push(pg);
            }
        }

        Self {
            nb,
            sb,
            datapaths,
            ports,
            mcast,
            warn,
            now,
            acls: nb.acls.iter().map(|a| (a.id, a)).collect(),
            qos: nb.qos_rules.iter().map(|q| (q.id, q)).collect(),
            lbs: nb.load_balancers.iter().map(|lb| (lb.id, lb)).collect(),
            dhcp_opts: nb.dhcp_options.iter().map(|d| (d.id, d)).collect(),
            dns: nb.dns.iter().map(|d| (d.id, d)).collect(),
            pgs_by_switch,
        }
    }

    pub(crate) fn ls(&self, dp: &Datapath) -> &'a LogicalSwitch {
        &self.nb.switches[dp.nb_index]
    }

    pub(crate) fn lr(&self, dp: &Datapath) -> &'a LogicalRouter {
        &self.nb.routers[dp.nb_index]
    }

    /// The ACLs applying to a switch: its own plus those of every port
    /// group touching it.
    pub(crate) fn switch_acls(&self, dp_ix: usize, ls: &LogicalSwitch) -> Vec<&'a Acl> {
        let mut acls: Vec<&'a Acl> = ls
            .acls
            .iter()
            .filter_map(|id| self.acls.get(id).copied())
            .collect();

        if let Some(pgs) = self.pgs_by_switch.get(&dp_ix) {
            for pg in pgs {
                acls.extend(pg.acls.iter().filter_map(|id| self.acls.get(id).copied()));
            }
        }

        acls
    }
}

/// The writes required to converge both databases after one pass.
#[derive(Debug, Default)]
pub struct PassOutcome {
    pub sb_ops: Vec<SbOp>,
    pub nb_ops: Vec<NbOp>,
}

/// The translation engine.
///
/// Only the MAC bookkeeping and the datapath key hint survive across
/// passes; everything else is rebuilt from the snapshots each time.
pub struct Engine {
    mac_set: MacSet,
    mac_prefix: Option<MacPrefix>,
    dp_key_hint: u32,
    warn: Warnings,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    pub fn new() -> Self {
        Self {
            mac_set: MacSet::default(),
            mac_prefix: None,
            dp_key_hint: 0,
            warn: Warnings::default(),
        }
    }

    /// Runs one full reconciliation pass.
    pub fn run_pass(&mut self, nb: &Northbound, sb: &Southbound, now: Instant) -> PassOutcome {
        let mut nb_ops = Vec::new();
        let mac_prefix = self.resolve_mac_prefix(nb, &mut nb_ops);

        let (mut datapaths, key_hint) =
            datapath::build_datapaths(nb, sb, self.dp_key_hint, &self.warn, now);
        self.dp_key_hint = key_hint;

        let outcome = port::build_ports(
            nb,
            sb,
            &mut datapaths,
            &mut self.mac_set,
            mac_prefix,
            &self.warn,
            now,
        );
        let mut ports = outcome.ports;
        nb_ops.extend(outcome.nb_ops);

        router_group::build_router_groups(nb, &mut datapaths, &ports);

        let ha_chassis_groups =
            ha::build_ha_chassis_groups(nb, sb, &mut datapaths, &ports, &self.warn, now);
        let mcast = mcast::build_mcast(nb, sb, &datapaths, &ports, &self.warn, now);

        let lbs: HashMap<LbId, &LoadBalancer> =
            nb.load_balancers.iter().map(|lb| (lb.id, lb)).collect();
        sync::fill_nat_addresses(nb, &datapaths, &mut ports, &lbs);

        let ctx = Ctx::new(nb, sb, &datapaths, &ports, &mcast, &self.warn, now);

        let mut lflows = lflow::LflowSet::default();
        switch::build_lswitch_flows(&ctx, &mut lflows);
        router::build_lrouter_flows(&ctx, &mut lflows);

        let target = diff::Target {
            datapaths: datapath::target_bindings(nb, &datapaths),
            port_bindings: port::target_bindings(nb, &datapaths, &ports),
            lflows,
            multicast_groups: mcast::target_groups(nb, &datapaths, &ports, &mcast),
            igmp_deletes: mcast.igmp_deletes.clone(),
            ha_chassis_groups,
            address_sets: sync::address_sets(nb, &ports),
            port_groups: sync::port_groups(nb, &ports),
            meters: sync::meters(nb),
            dns: sync::dns(nb, &datapaths),
            dhcp_options: sync::dhcp_option_catalog(),
            dhcpv6_options: sync::dhcpv6_option_catalog(),
            ip_multicast: sync::ip_multicast(&datapaths),
            rbac: Some(rbac::controller_role()),
        };

        let mut sb_ops = diff::diff(&target, sb);

        // Global-row bookkeeping.
        if sb.global.nb_cfg != nb.global.nb_cfg {
            sb_ops.push(SbOp::SetNbCfg(nb.global.nb_cfg));
        }
        if sb.global.ipsec != nb.global.ipsec {
            sb_ops.push(SbOp::SetIpsec(nb.global.ipsec));
        }
        if sb.global.options != nb.global.options {
            sb_ops.push(SbOp::SetOptions(nb.global.options.clone()));
        }

        // The hypervisors have caught up to the oldest nb_cfg any of them
        // reports.
        let hv_cfg = sb
            .chassis
            .iter()
            .map(|c| c.nb_cfg)
            .min()
            .unwrap_or(nb.global.nb_cfg);

        if nb.global.hv_cfg != hv_cfg {
            nb_ops.push(NbOp::SetHvCfg(hv_cfg));
        }

        PassOutcome { sb_ops, nb_ops }
    }

    /// The dynamic MAC prefix: configured northbound, or generated once per
    /// process and persisted northbound.
    fn resolve_mac_prefix(&mut self, nb: &Northbound, nb_ops: &mut Vec<NbOp>) -> MacPrefix {
        let configured = nb
            .global
            .options
            .get("mac_prefix")
            .and_then(|s| s.parse::<MacPrefix>().ok());

        match configured {
            Some(prefix) => {
                self.mac_prefix = Some(prefix);
                prefix
            }
            None => {
                let prefix = *self
                    .mac_prefix
                    .get_or_insert_with(|| MacPrefix::random(&mut rand::thread_rng()));

                nb_ops.push(NbOp::SetMacPrefix(prefix.to_string()));

                prefix
            }
        }
    }
}
