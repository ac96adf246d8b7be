use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::errors::FlagError;

/// A per-user exception to a flag's default value. At most one exists per (flag, user).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Override {
    pub flag_id: Uuid,
    pub user_id: Uuid,
    pub value: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub fn validate_override_value(value: &str) -> Result<(), FlagError> {
    if value.is_empty() {
        return Err(FlagError::ValidationFailed(
            "override value must not be empty".to_string(),
        ));
    }
    Ok(())
}
