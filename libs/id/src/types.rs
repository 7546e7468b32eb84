//! Typed ID definitions.
//!
//! Each ID type has a unique prefix that identifies what it names.

use crate::define_id;

// =============================================================================
// Fleet Nodes
// =============================================================================

define_id!(ControllerId, "ctl");
define_id!(HostId, "host");
define_id!(SiteId, "site");

// =============================================================================
// Messages and Requests
// =============================================================================

define_id!(CommandId, "cmd");
define_id!(MessageId, "msg");
define_id!(RequestId, "req");

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_controller_id_roundtrip() {
        let id = ControllerId::new();
        let parsed: ControllerId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!(id.to_string().starts_with("ctl_"));
    }

    #[test]
    fn test_invalid_prefix() {
        let result: Result<ControllerId, _> = "host_01HV4Z2WQXKJNM8GPQY6VBKC3D".parse();
        assert!(matches!(
            result.unwrap_err(),
            crate::IdError::InvalidPrefix { .. }
        ));
    }

    #[test]
    fn test_missing_separator() {
        let result: Result<HostId, _> = "host01HV4Z2WQXKJNM8GPQY6VBKC3D".parse();
        assert!(matches!(
            result.unwrap_err(),
            crate::IdError::MissingSeparator
        ));
    }

    #[test]
    fn test_empty_and_bad_ulid() {
        assert!(matches!(
            "".parse::<SiteId>().unwrap_err(),
            crate::IdError::Empty
        ));
        assert!(matches!(
            "site_nope".parse::<SiteId>().unwrap_err(),
            crate::IdError::InvalidUlid(_)
        ));
    }

    #[test]
    fn test_command_id_json_is_string() {
        let id = CommandId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
        let parsed: CommandId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_all_id_prefixes_unique() {
        let prefixes = [
            ControllerId::PREFIX,
            HostId::PREFIX,
            SiteId::PREFIX,
            CommandId::PREFIX,
            MessageId::PREFIX,
            RequestId::PREFIX,
        ];

        let unique: std::collections::HashSet<_> = prefixes.iter().collect();
        assert_eq!(prefixes.len(), unique.len(), "Duplicate ID prefixes found!");
    }

    proptest! {
        #[test]
        fn prop_host_id_parse_display(raw in any::<u128>()) {
            let id = HostId::from_ulid(crate::Ulid::from(raw));
            prop_assert_eq!(id.to_string().parse::<HostId>().unwrap(), id);
        }
    }
}
