use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::errors::FlagError;
use crate::flags::flag_models::{FlagType, FlagUpdate, NewFlag, OwnerScope};
use crate::service::MutationOutcome;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateFlagRequest {
    pub key: String,
    // Kept as a string so an unknown tag is a validation failure, not a body parse error
    #[serde(rename = "type")]
    pub flag_type: String,
    pub default_value: String,
    #[serde(default)]
    pub description: Option<String>,
    pub owner: OwnerScope,
}

impl CreateFlagRequest {
    pub fn into_new_flag(self) -> Result<NewFlag, FlagError> {
        Ok(NewFlag {
            key: self.key,
            flag_type: self.flag_type.parse::<FlagType>()?,
            default_value: self.default_value,
            description: self.description,
            owner: self.owner,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateFlagRequest {
    pub key: String,
    #[serde(rename = "type")]
    pub flag_type: String,
    pub default_value: String,
    #[serde(default)]
    pub description: Option<String>,
}

impl UpdateFlagRequest {
    pub fn into_update(self) -> Result<FlagUpdate, FlagError> {
        Ok(FlagUpdate {
            key: self.key,
            flag_type: self.flag_type.parse::<FlagType>()?,
            default_value: self.default_value,
            description: self.description,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SetOverrideRequest {
    pub value: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOverrideRequest {
    pub user_id: Uuid,
    pub value: String,
}

/// `?user_id=` for personal flags or `?organization_id=` for organization flags,
/// optionally narrowed to one `key`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScopeQuery {
    pub user_id: Option<Uuid>,
    pub organization_id: Option<Uuid>,
    pub key: Option<String>,
}

impl ScopeQuery {
    pub fn scope(&self) -> Result<OwnerScope, FlagError> {
        owner_scope(self.user_id, self.organization_id, "user_id")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EffectiveQuery {
    pub user_id: Uuid,
    pub owner_user_id: Option<Uuid>,
    pub organization_id: Option<Uuid>,
}

impl EffectiveQuery {
    pub fn scope(&self) -> Result<OwnerScope, FlagError> {
        owner_scope(self.owner_user_id, self.organization_id, "owner_user_id")
    }
}

fn owner_scope(
    user_id: Option<Uuid>,
    organization_id: Option<Uuid>,
    user_param: &str,
) -> Result<OwnerScope, FlagError> {
    match (user_id, organization_id) {
        (Some(user_id), None) => Ok(OwnerScope::Personal { user_id }),
        (None, Some(organization_id)) => Ok(OwnerScope::Organization { organization_id }),
        _ => Err(FlagError::ValidationFailed(format!(
            "exactly one of {user_param} or organization_id is required"
        ))),
    }
}

/// Body of every successful mutation. `warnings` carries secondary failures, such as a
/// lost audit entry, that did not undo the change.
#[derive(Debug, Serialize)]
pub struct MutationResponse<T> {
    pub data: T,
    pub warnings: Vec<String>,
}

impl<T> From<MutationOutcome<T>> for MutationResponse<T> {
    fn from(outcome: MutationOutcome<T>) -> Self {
        let warnings = outcome.warnings();
        MutationResponse {
            data: outcome.value,
            warnings,
        }
    }
}
