//! The RBAC role handed to the downstream agents.
//!
//! The `ovn-controller` role must expose exactly this permission matrix;
//! any drift is corrected by rewriting the whole role.

use northd_model::sb::{RbacPermission, RbacRole};

pub(crate) const CONTROLLER_ROLE: &str = "ovn-controller";

fn permission(
    table: &str,
    authorization: &[&str],
    insert_delete: bool,
    update: &[&str],
) -> RbacPermission {
    RbacPermission {
        table: table.to_owned(),
        authorization: authorization.iter().map(|s| (*s).to_owned()).collect(),
        insert_delete,
        update: update.iter().map(|s| (*s).to_owned()).collect(),
    }
}

/// The target role row.
pub(crate) fn controller_role() -> RbacRole {
    RbacRole {
        name: CONTROLLER_ROLE.to_owned(),
        permissions: vec![
            permission(
                "Chassis",
                &["name"],
                true,
                &["nb_cfg", "external_ids", "encaps", "vtep_logical_switches"],
            ),
            permission("Encap", &["chassis_name"], true, &["type", "options", "ip"]),
            permission("Port_Binding", &[""], false, &["chassis"]),
            permission(
                "MAC_Binding",
                &[""],
                true,
                &["logical_port", "ip", "mac", "datapath"],
            ),
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_has_exactly_four_permissions() {
        let role = controller_role();

        assert_eq!(role.name, "ovn-controller");
        assert_eq!(role.permissions.len(), 4);
    }

    #[test]
    fn port_binding_is_update_only() {
        let role = controller_role();
        let pb = role
            .permissions
            .iter()
            .find(|p| p.table == "Port_Binding")
            .unwrap();

        assert!(!pb.insert_delete);
        assert_eq!(pb.update, vec!["chassis".to_owned()]);
        assert_eq!(pb.authorization, vec![String::new()]);
    }
}
