use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::flags::flag_models::{Flag, FlagType};
use crate::flags::override_models::Override;

/// The value a requester actually sees for one flag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EffectiveFlag {
    pub key: String,
    #[serde(rename = "type")]
    pub flag_type: FlagType,
    pub value: String,
    pub is_overridden: bool,
    pub description: Option<String>,
}

pub type EffectiveFlags = BTreeMap<String, EffectiveFlag>;

/// Merges flag defaults with the requester's overrides.
///
/// Overrides belonging to other users, or to flags not in `flags`, are ignored. Values are
/// passed through as stored; interpreting them according to `flag_type` is up to the consumer.
/// Flags are expected to come from a single owner scope, where keys are unique.
pub fn resolve(flags: &[Flag], overrides: &[Override], for_user: Uuid) -> EffectiveFlags {
    let flags_by_id: HashMap<Uuid, &Flag> = flags.iter().map(|flag| (flag.id, flag)).collect();

    let user_overrides: HashMap<Uuid, &Override> = overrides
        .iter()
        .filter(|o| o.user_id == for_user && flags_by_id.contains_key(&o.flag_id))
        .map(|o| (o.flag_id, o))
        .collect();

    flags
        .iter()
        .map(|flag| {
            let matching = user_overrides.get(&flag.id);
            let effective = EffectiveFlag {
                key: flag.key.clone(),
                flag_type: flag.flag_type,
                value: matching
                    .map(|o| o.value.clone())
                    .unwrap_or_else(|| flag.default_value.clone()),
                is_overridden: matching.is_some(),
                description: flag.description.clone(),
            };
            (flag.key.clone(), effective)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::flag_models::OwnerScope;
    use chrono::Utc;

    fn flag(key: &str, flag_type: FlagType, default_value: &str) -> Flag {
        Flag {
            id: Uuid::now_v7(),
            key: key.to_string(),
            flag_type,
            default_value: default_value.to_string(),
            description: Some(format!("{key} description")),
            owner: OwnerScope::Organization {
                organization_id: Uuid::nil(),
            },
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn override_for(flag: &Flag, user_id: Uuid, value: &str) -> Override {
        Override {
            flag_id: flag.id,
            user_id,
            value: value.to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_resolve_without_overrides_uses_defaults() {
        let beta = flag("beta", FlagType::Boolean, "false");
        let user = Uuid::now_v7();

        let resolved = resolve(&[beta], &[], user);

        let effective = resolved.get("beta").unwrap();
        assert_eq!(effective.value, "false");
        assert!(!effective.is_overridden);
        assert_eq!(effective.flag_type, FlagType::Boolean);
        assert_eq!(effective.description.as_deref(), Some("beta description"));
    }

    #[test]
    fn test_resolve_applies_override_only_to_its_user() {
        let beta = flag("beta", FlagType::Boolean, "false");
        let user_u = Uuid::now_v7();
        let user_v = Uuid::now_v7();
        let overrides = vec![override_for(&beta, user_u, "true")];
        let flags = vec![beta];

        let for_u = resolve(&flags, &overrides, user_u);
        assert_eq!(for_u["beta"].value, "true");
        assert!(for_u["beta"].is_overridden);

        let for_v = resolve(&flags, &overrides, user_v);
        assert_eq!(for_v["beta"].value, "false");
        assert!(!for_v["beta"].is_overridden);
    }

    #[test]
    fn test_resolve_ignores_overrides_for_unknown_flags() {
        let beta = flag("beta", FlagType::String, "control");
        let other = flag("other", FlagType::String, "a");
        let user = Uuid::now_v7();
        let overrides = vec![override_for(&other, user, "b")];

        let resolved = resolve(&[beta], &overrides, user);

        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved["beta"].value, "control");
        assert!(!resolved["beta"].is_overridden);
    }

    #[test]
    fn test_resolve_passes_values_through_uncoerced() {
        let limits = flag("limits", FlagType::Json, r#"{"max": 10}"#);
        let ratio = flag("ratio", FlagType::Number, "0.5");
        let user = Uuid::now_v7();
        let overrides = vec![override_for(&ratio, user, "not-a-number")];

        let resolved = resolve(&[limits, ratio], &overrides, user);

        assert_eq!(resolved["limits"].value, r#"{"max": 10}"#);
        assert_eq!(resolved["ratio"].value, "not-a-number");
        assert!(resolved["ratio"].is_overridden);
    }

    #[test]
    fn test_resolve_is_deterministic() {
        let flags = vec![
            flag("a", FlagType::Boolean, "true"),
            flag("b", FlagType::Boolean, "false"),
            flag("c", FlagType::String, "x"),
        ];
        let user = Uuid::now_v7();
        let overrides = vec![override_for(&flags[1], user, "true")];

        let first = resolve(&flags, &overrides, user);
        let second = resolve(&flags, &overrides, user);

        assert_eq!(first, second);
        assert_eq!(
            first.keys().cloned().collect::<Vec<_>>(),
            vec!["a".to_string(), "b".to_string(), "c".to_string()]
        );
    }

    #[test]
    fn test_resolve_empty_inputs() {
        assert!(resolve(&[], &[], Uuid::now_v7()).is_empty());
    }
}
