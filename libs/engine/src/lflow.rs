//! Logical flows: stage encoding, flow identity and the computed flow set.
//!
//! A flow's identity is the full `(datapath, stage, priority, match,
//! actions)` tuple. The tuple is long, so the hash is computed once at
//! construction and field comparison only runs on hash collision.

use crate::datapath::DpKind;
use northd_model::sb::{DpKey, LogicalFlowRow, Pipeline};
use std::collections::BTreeMap;
use std::collections::HashSet;
use std::fmt;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::panic::Location;

/// Register bits carrying control between stages.
pub(crate) const REGBIT_CONNTRACK_DEFRAG: &str = "reg0[0]";
pub(crate) const REGBIT_CONNTRACK_COMMIT: &str = "reg0[1]";
pub(crate) const REGBIT_CONNTRACK_NAT: &str = "reg0[2]";
pub(crate) const REGBIT_DHCP_OPTS_RESULT: &str = "reg0[3]";
pub(crate) const REGBIT_DNS_LOOKUP_RESULT: &str = "reg0[4]";
pub(crate) const REGBIT_ND_RA_OPTS_RESULT: &str = "reg0[5]";
pub(crate) const REGBIT_NAT_REDIRECT: &str = "reg9[0]";
pub(crate) const REGBIT_EGRESS_LOOPBACK: &str = "reg9[1]";
pub(crate) const REGBIT_PKT_LARGER: &str = "reg9[2]";
pub(crate) const REGBIT_LOOKUP_NEIGHBOR_RESULT: &str = "reg9[3]";

macro_rules! stages {
    ($( $variant:ident => ($kind:ident, $pipeline:ident, $table:expr, $name:literal), )+) => {
        /// A (datapath kind, pipeline, table) triple.
        ///
        /// Names and table numbers are externally visible: downstream agents
        /// key their physical tables off them.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub(crate) enum Stage {
            $($variant,)+
        }

        impl Stage {
            pub(crate) fn dp_kind(self) -> DpKind {
                match self {
                    $(Stage::$variant => DpKind::$kind,)+
                }
            }

            pub(crate) fn pipeline(self) -> Pipeline {
                match self {
                    $(Stage::$variant => Pipeline::$pipeline,)+
                }
            }

            pub(crate) fn table(self) -> u8 {
                match self {
                    $(Stage::$variant => $table,)+
                }
            }

            pub(crate) fn name(self) -> &'static str {
                match self {
                    $(Stage::$variant => $name,)+
                }
            }
        }
    };
}

stages! {
    // Logical switch, ingress.
    LsInPortSecL2 => (Switch, Ingress, 0, "ls_in_port_sec_l2"),
    LsInPortSecIp => (Switch, Ingress, 1, "ls_in_port_sec_ip"),
    LsInPortSecNd => (Switch, Ingress, 2, "ls_in_port_sec_nd"),
    LsInPreAcl => (Switch, Ingress, 3, "ls_in_pre_acl"),
    LsInPreLb => (Switch, Ingress, 4, "ls_in_pre_lb"),
    LsInPreStateful => (Switch, Ingress, 5, "ls_in_pre_stateful"),
    LsInAcl => (Switch, Ingress, 6, "ls_in_acl"),
    LsInQosMark => (Switch, Ingress, 7, "ls_in_qos_mark"),
    LsInQosMeter => (Switch, Ingress, 8, "ls_in_qos_meter"),
    LsInLb => (Switch, Ingress, 9, "ls_in_lb"),
    LsInStateful => (Switch, Ingress, 10, "ls_in_stateful"),
    LsInArpNdRsp => (Switch, Ingress, 11, "ls_in_arp_rsp"),
    LsInDhcpOptions => (Switch, Ingress, 12, "ls_in_dhcp_options"),
    LsInDhcpResponse => (Switch, Ingress, 13, "ls_in_dhcp_response"),
    LsInDnsLookup => (Switch, Ingress, 14, "ls_in_dns_lookup"),
    LsInDnsResponse => (Switch, Ingress, 15, "ls_in_dns_response"),
    LsInExternalPort => (Switch, Ingress, 16, "ls_in_external_port"),
    LsInL2Lkup => (Switch, Ingress, 17, "ls_in_l2_lkup"),

    // Logical switch, egress.
    LsOutPreLb => (Switch, Egress, 0, "ls_out_pre_lb"),
    LsOutPreAcl => (Switch, Egress, 1, "ls_out_pre_acl"),
    LsOutPreStateful => (Switch, Egress, 2, "ls_out_pre_stateful"),
    LsOutLb => (Switch, Egress, 3, "ls_out_lb"),
    LsOutAcl => (Switch, Egress, 4, "ls_out_acl"),
    LsOutQosMark => (Switch, Egress, 5, "ls_out_qos_mark"),
    LsOutQosMeter => (Switch, Egress, 6, "ls_out_qos_meter"),
    LsOutStateful => (Switch, Egress, 7, "ls_out_stateful"),
    LsOutPortSecIp => (Switch, Egress, 8, "ls_out_port_sec_ip"),
    LsOutPortSecL2 => (Switch, Egress, 9, "ls_out_port_sec_l2"),

    // Logical router, ingress.
    LrInAdmission => (Router, Ingress, 0, "lr_in_admission"),
    LrInLookupNeighbor => (Router, Ingress, 1, "lr_in_lookup_neighbor"),
    LrInLearnNeighbor => (Router, Ingress, 2, "lr_in_learn_neighbor"),
    LrInIpInput => (Router, Ingress, 3, "lr_in_ip_input"),
    LrInDefrag => (Router, Ingress, 4, "lr_in_defrag"),
    LrInUnsnat => (Router, Ingress, 5, "lr_in_unsnat"),
    LrInDnat => (Router, Ingress, 6, "lr_in_dnat"),
    LrInNdRaOptions => (Router, Ingress, 7, "lr_in_nd_ra_options"),
    LrInNdRaResponse => (Router, Ingress, 8, "lr_in_nd_ra_response"),
    LrInIpRouting => (Router, Ingress, 9, "lr_in_ip_routing"),
    LrInPolicy => (Router, Ingress, 10, "lr_in_policy"),
    LrInArpResolve => (Router, Ingress, 11, "lr_in_arp_resolve"),
    LrInChkPktLen => (Router, Ingress, 12, "lr_in_chk_pkt_len"),
    LrInLargerPkts => (Router, Ingress, 13, "lr_in_larger_pkts"),
    LrInGwRedirect => (Router, Ingress, 14, "lr_in_gw_redirect"),
    LrInArpRequest => (Router, Ingress, 15, "lr_in_arp_request"),

    // Logical router, egress.
    LrOutUndnat => (Router, Egress, 0, "lr_out_undnat"),
    LrOutSnat => (Router, Egress, 1, "lr_out_snat"),
    LrOutEgrLoop => (Router, Egress, 2, "lr_out_egr_loop"),
    LrOutDelivery => (Router, Egress, 3, "lr_out_delivery"),
}

/// One computed logical flow.
#[derive(Debug, Clone)]
pub(crate) struct Lflow {
    pub dp: DpKey,
    pub stage: Stage,
    pub priority: u16,
    pub match_: String,
    pub actions: String,
    /// First 32 bits of the originating northbound identity; diagnostics only.
    pub stage_hint: u32,
    /// The emitting source location; diagnostics only.
    pub source: &'static Location<'static>,
    hash: u64,
}

impl Lflow {
    fn identity_hash(
        dp: DpKey,
        stage: Stage,
        priority: u16,
        match_: &str,
        actions: &str,
    ) -> u64 {
        let mut hasher = DefaultHasher::new();
        dp.hash(&mut hasher);
        stage.hash(&mut hasher);
        priority.hash(&mut hasher);
        match_.hash(&mut hasher);
        actions.hash(&mut hasher);

        hasher.finish()
    }

    pub(crate) fn to_row(&self) -> LogicalFlowRow {
        let mut external_ids = BTreeMap::new();
        external_ids.insert("stage-name".to_owned(), self.stage.name().to_owned());
        external_ids.insert(
            "source".to_owned(),
            format!("{}:{}", self.source.file(), self.source.line()),
        );

        if self.stage_hint != 0 {
            external_ids.insert("stage-hint".to_owned(), format!("{:08x}", self.stage_hint));
        }

        LogicalFlowRow {
            datapath: self.dp.uuid(),
            pipeline: self.stage.pipeline(),
            table_id: self.stage.table(),
            priority: self.priority,
            match_: self.match_.clone(),
            actions: self.actions.clone(),
            external_ids,
        }
    }
}

impl PartialEq for Lflow {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
            && self.dp == other.dp
            && self.stage == other.stage
            && self.priority == other.priority
            && self.match_ == other.match_
            && self.actions == other.actions
    }
}

impl Eq for Lflow {}

impl Hash for Lflow {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

/// The set of flows computed by one pass.
///
/// Identical emissions from different sites collapse into one flow.
#[derive(Debug, Default)]
pub(crate) struct LflowSet {
    flows: HashSet<Lflow>,
}

impl LflowSet {
    #[track_caller]
    pub(crate) fn add(
        &mut self,
        dp: DpKey,
        stage: Stage,
        priority: u16,
        match_: impl Into<String>,
        actions: impl Into<String>,
    ) {
        self.add_at(dp, stage, priority, match_, actions, 0, Location::caller());
    }

    #[track_caller]
    pub(crate) fn add_hint(
        &mut self,
        dp: DpKey,
        stage: Stage,
        priority: u16,
        match_: impl Into<String>,
        actions: impl Into<String>,
        hint: u32,
    ) {
        self.add_at(dp, stage, priority, match_, actions, hint, Location::caller());
    }

    fn add_at(
        &mut self,
        dp: DpKey,
        stage: Stage,
        priority: u16,
        match_: impl Into<String>,
        actions: impl Into<String>,
        stage_hint: u32,
        source: &'static Location<'static>,
    ) {
        let match_ = match_.into();
        let actions = actions.into();
        let hash = Lflow::identity_hash(dp, stage, priority, &match_, &actions);

        self.flows.insert(Lflow {
            dp,
            stage,
            priority,
            match_,
            actions,
            stage_hint,
            source,
            hash,
        });
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Lflow> {
        self.flows.iter()
    }

    pub(crate) fn len(&self) -> usize {
        self.flows.len()
    }
}

/// An accumulating string builder for match and action expressions.
#[derive(Debug, Default)]
pub(crate) struct Ds {
    buf: String,
}

impl Ds {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn put(&mut self, s: &str) {
        self.buf.push_str(s);
    }

    /// Drops a trailing `suffix` if present; used to strip list separators
    /// before closing a brace.
    pub(crate) fn chomp(&mut self, suffix: &str) {
        if let Some(stripped) = self.buf.strip_suffix(suffix) {
            self.buf.truncate(stripped.len());
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub(crate) fn into_string(self) -> String {
        self.buf
    }
}

impl fmt::Write for Ds {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.buf.push_str(s);

        Ok(())
    }
}

impl fmt::Display for Ds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.buf.fmt(f)
    }
}

/// Renders a value list for a match expression: a single element stays
/// bare, several are braced.
pub(crate) fn value_list<I>(items: I) -> String
where
    I: IntoIterator,
    I::Item: fmt::Display,
{
    let items = items.into_iter().map(|i| i.to_string()).collect::<Vec<_>>();

    match items.as_slice() {
        [single] => single.clone(),
        _ => format!("{{{}}}", items.join(", ")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use northd_model::LsId;

    fn dp() -> DpKey {
        DpKey::Switch(LsId::from_u128(1))
    }

    #[test]
    fn identical_emissions_deduplicate() {
        let mut flows = LflowSet::default();

        flows.add(dp(), Stage::LsInAcl, 100, "ip4", "next;");
        flows.add(dp(), Stage::LsInAcl, 100, "ip4", "next;");

        assert_eq!(flows.len(), 1);
    }

    #[test]
    fn identity_covers_all_five_fields() {
        let mut flows = LflowSet::default();

        flows.add(dp(), Stage::LsInAcl, 100, "ip4", "next;");
        flows.add(dp(), Stage::LsInAcl, 100, "ip4", "drop;");
        flows.add(dp(), Stage::LsInAcl, 101, "ip4", "next;");
        flows.add(dp(), Stage::LsOutAcl, 100, "ip4", "next;");

        assert_eq!(flows.len(), 4);
    }

    #[test]
    fn stage_names_and_tables_are_fixed() {
        assert_eq!(Stage::LsInL2Lkup.table(), 17);
        assert_eq!(Stage::LsInL2Lkup.name(), "ls_in_l2_lkup");
        assert_eq!(Stage::LsOutPortSecL2.table(), 9);
        assert_eq!(Stage::LrInArpRequest.table(), 15);
        assert_eq!(Stage::LrOutDelivery.table(), 3);
        assert_eq!(Stage::LrInIpRouting.name(), "lr_in_ip_routing");
    }

    #[test]
    fn ds_chomps_list_separators() {
        let mut ds = Ds::new();
        ds.put("a, b, ");
        ds.chomp(", ");

        assert_eq!(ds.into_string(), "a, b");
    }

    #[test]
    fn value_list_braces_only_multiples() {
        assert_eq!(value_list(["10.0.0.1"]), "10.0.0.1");
        assert_eq!(value_list(["a", "b"]), "{a, b}");
    }
}
