use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::errors::FlagError;

/// The declared type of a flag. Values are always stored as strings; this tag tells
/// consumers how to interpret them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlagType {
    Boolean,
    String,
    Number,
    Json,
}

impl FlagType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlagType::Boolean => "boolean",
            FlagType::String => "string",
            FlagType::Number => "number",
            FlagType::Json => "json",
        }
    }
}

impl fmt::Display for FlagType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FlagType {
    type Err = FlagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "boolean" => Ok(FlagType::Boolean),
            "string" => Ok(FlagType::String),
            "number" => Ok(FlagType::Number),
            "json" => Ok(FlagType::Json),
            invalid => Err(FlagError::ValidationFailed(format!(
                "{invalid} is not a valid flag type"
            ))),
        }
    }
}

/// Who a flag belongs to: exactly one user, or exactly one organization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum OwnerScope {
    Personal { user_id: Uuid },
    Organization { organization_id: Uuid },
}

impl OwnerScope {
    pub fn owner_user_id(&self) -> Option<Uuid> {
        match self {
            OwnerScope::Personal { user_id } => Some(*user_id),
            OwnerScope::Organization { .. } => None,
        }
    }

    pub fn owner_organization_id(&self) -> Option<Uuid> {
        match self {
            OwnerScope::Personal { .. } => None,
            OwnerScope::Organization { organization_id } => Some(*organization_id),
        }
    }

    /// Rebuilds a scope from the two nullable owner columns. Exactly one must be set.
    pub fn from_columns(
        owner_user_id: Option<Uuid>,
        owner_organization_id: Option<Uuid>,
    ) -> Result<Self, FlagError> {
        match (owner_user_id, owner_organization_id) {
            (Some(user_id), None) => Ok(OwnerScope::Personal { user_id }),
            (None, Some(organization_id)) => Ok(OwnerScope::Organization { organization_id }),
            (Some(_), Some(_)) => Err(FlagError::ValidationFailed(
                "a flag can be owned by a user or an organization, not both".to_string(),
            )),
            (None, None) => Err(FlagError::ValidationFailed(
                "a flag must be owned by a user or an organization".to_string(),
            )),
        }
    }
}

impl fmt::Display for OwnerScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OwnerScope::Personal { user_id } => write!(f, "user:{user_id}"),
            OwnerScope::Organization { organization_id } => {
                write!(f, "organization:{organization_id}")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Flag {
    pub id: Uuid,
    pub key: String,
    #[serde(rename = "type")]
    pub flag_type: FlagType,
    pub default_value: String,
    pub description: Option<String>,
    pub owner: OwnerScope,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
pub struct FlagRow {
    pub id: Uuid,
    pub key: String,
    pub flag_type: String,
    pub default_value: String,
    pub description: Option<String>,
    pub owner_user_id: Option<Uuid>,
    pub owner_organization_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<FlagRow> for Flag {
    type Error = FlagError;

    fn try_from(row: FlagRow) -> Result<Self, Self::Error> {
        let flag_type = row.flag_type.parse().map_err(|_| {
            FlagError::Internal(format!(
                "flag {} has unknown stored type {}",
                row.id, row.flag_type
            ))
        })?;
        let owner = OwnerScope::from_columns(row.owner_user_id, row.owner_organization_id)
            .map_err(|e| FlagError::Internal(format!("flag {} has invalid owner: {e}", row.id)))?;

        Ok(Flag {
            id: row.id,
            key: row.key,
            flag_type,
            default_value: row.default_value,
            description: row.description,
            owner,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// A flag definition that hasn't been persisted yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewFlag {
    pub key: String,
    pub flag_type: FlagType,
    pub default_value: String,
    pub description: Option<String>,
    pub owner: OwnerScope,
}

impl NewFlag {
    pub fn validate(&self) -> Result<(), FlagError> {
        validate_definition(&self.key, &self.default_value)
    }
}

/// Replacement attributes for an existing flag. The owner scope never changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlagUpdate {
    pub key: String,
    pub flag_type: FlagType,
    pub default_value: String,
    pub description: Option<String>,
}

impl FlagUpdate {
    pub fn validate(&self) -> Result<(), FlagError> {
        validate_definition(&self.key, &self.default_value)
    }

    pub fn apply_to(self, flag: &mut Flag, updated_at: DateTime<Utc>) {
        flag.key = self.key;
        flag.flag_type = self.flag_type;
        flag.default_value = self.default_value;
        flag.description = self.description;
        flag.updated_at = updated_at;
    }
}

fn validate_definition(key: &str, default_value: &str) -> Result<(), FlagError> {
    if key.trim().is_empty() {
        return Err(FlagError::ValidationFailed(
            "flag key must not be empty".to_string(),
        ));
    }
    if default_value.is_empty() {
        return Err(FlagError::ValidationFailed(
            "flag default value must not be empty".to_string(),
        ));
    }
    Ok(())
}
