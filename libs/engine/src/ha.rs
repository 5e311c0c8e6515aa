//! HA chassis group synthesis for distributed gateway ports.
//!
//! A gateway can be declared three ways on a router port; the strongest
//! form wins and determines the name and membership of the southbound
//! group. Groups referenced by external switch ports are mirrored too.

use crate::datapath::Datapaths;
use crate::port::{Ports, PortSource};
use crate::ratelimit::warn_rl;
use crate::router_group::component_chassis;
use crate::Warnings;
use northd_model::nb::{LogicalRouterPort, LspType, Northbound};
use northd_model::sb::{HaChassisGroupRow, SbHaChassis, Southbound};
use northd_model::HaGroupId;
use std::collections::BTreeMap;
use std::time::Instant;

/// The priority given to the single member of a legacy
/// `options:redirect-chassis` declaration.
const REDIRECT_CHASSIS_PRIORITY: i64 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GatewayForm {
    HaChassisGroup(HaGroupId),
    GatewayChassis,
    RedirectChassis,
}

/// Picks the winning declaration form; concurrent declarations are malformed
/// and reported, the preference order decides which one populates the group.
fn gateway_form(
    lrp: &LogicalRouterPort,
    warn: &Warnings,
    now: Instant,
) -> Option<GatewayForm> {
    let forms = [
        lrp.ha_chassis_group.map(GatewayForm::HaChassisGroup),
        (!lrp.gateway_chassis.is_empty()).then_some(GatewayForm::GatewayChassis),
        lrp.options
            .contains_key("redirect-chassis")
            .then_some(GatewayForm::RedirectChassis),
    ];

    let mut declared = forms.into_iter().flatten();
    let winner = declared.next()?;

    if declared.next().is_some() {
        warn_rl!(
            warn.cfg,
            now,
            port = %lrp.name,
            "multiple gateway declarations on one router port; using the strongest"
        );
    }

    Some(winner)
}

/// Builds the target HA chassis group rows and records the backing group
/// name on each gateway router.
pub(crate) fn build_ha_chassis_groups(
    nb: &Northbound,
    sb: &Southbound,
    datapaths: &mut Datapaths,
    ports: &Ports,
    warn: &Warnings,
    now: Instant,
) -> Vec<HaChassisGroupRow> {
    let nb_groups: BTreeMap<HaGroupId, &northd_model::nb::HaChassisGroup> =
        nb.ha_chassis_groups.iter().map(|g| (g.id, g)).collect();

    // Group name -> (members, owning router group for ref_chassis).
    let mut targets: BTreeMap<String, (Vec<SbHaChassis>, Option<usize>)> = BTreeMap::new();

    for dp_ix in 0..datapaths.items.len() {
        let Some(l3dgw) = datapaths.items[dp_ix].l3dgw_port else {
            continue;
        };

        let port = &ports.items[l3dgw];
        let lrp = port.lrp(nb).expect("gateway port is a router port");

        let Some(form) = gateway_form(lrp, warn, now) else {
            continue;
        };

        let (name, members) = match form {
            GatewayForm::HaChassisGroup(id) => {
                let Some(group) = nb_groups.get(&id) else {
                    warn_rl!(
                        warn.cfg,
                        now,
                        port = %lrp.name,
                        "ha_chassis_group reference points at no group"
                    );
                    continue;
                };

                (
                    group.name.clone(),
                    group
                        .ha_chassis
                        .iter()
                        .map(|c| SbHaChassis {
                            chassis_name: c.chassis_name.clone(),
                            priority: c.priority,
                        })
                        .collect(),
                )
            }
            GatewayForm::GatewayChassis => (
                lrp.name.clone(),
                lrp.gateway_chassis
                    .iter()
                    .map(|c| SbHaChassis {
                        chassis_name: c.chassis_name.clone(),
                        priority: c.priority,
                    })
                    .collect(),
            ),
            GatewayForm::RedirectChassis => {
                let chassis = lrp
                    .options
                    .get("redirect-chassis")
                    .expect("form implies the option")
                    .clone();

                (
                    format!("{}_{}", lrp.name, chassis),
                    vec![SbHaChassis {
                        chassis_name: chassis,
                        priority: REDIRECT_CHASSIS_PRIORITY,
                    }],
                )
            }
        };

        datapaths.items[dp_ix].ha_group_name = Some(name.clone());
        targets.insert(name, (members, datapaths.items[dp_ix].router_group));
    }

    // Groups referenced by external switch ports exist southbound too, so
    // the scheduler on the chassis can elect one of them.
    for port in ports.iter() {
        let PortSource::Lsp { .. } = port.source else {
            continue;
        };
        let lsp = port.lsp(nb).expect("switch port");

        if lsp.port_type != LspType::External {
            continue;
        }

        let Some(group) = lsp.ha_chassis_group.and_then(|id| nb_groups.get(&id)) else {
            continue;
        };

        targets.entry(group.name.clone()).or_insert_with(|| {
            (
                group
                    .ha_chassis
                    .iter()
                    .map(|c| SbHaChassis {
                        chassis_name: c.chassis_name.clone(),
                        priority: c.priority,
                    })
                    .collect(),
                None,
            )
        });
    }

    targets
        .into_iter()
        .map(|(name, (ha_chassis, router_group))| {
            let ref_chassis = router_group
                .map(|g| {
                    component_chassis(nb, sb, datapaths, ports, g)
                        .into_iter()
                        .collect()
                })
                .unwrap_or_default();

            HaChassisGroupRow {
                name,
                ha_chassis,
                ref_chassis,
            }
        })
        .collect()
}
