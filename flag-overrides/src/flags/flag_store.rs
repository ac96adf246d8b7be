use async_trait::async_trait;
use uuid::Uuid;

use crate::api::errors::FlagError;
use crate::flags::flag_models::{Flag, FlagUpdate, NewFlag, OwnerScope};
use crate::flags::override_models::Override;

/// Persistence boundary for flag definitions and their overrides.
///
/// Implementations own the uniqueness invariants: `(key, owner)` for flags and
/// `(flag, user)` for overrides. Definitions and override values are validated before
/// any storage work happens.
#[async_trait]
pub trait FlagStore {
    /// Fails with `Conflict` if the owner already has a flag with this key.
    async fn create_flag(&self, new_flag: NewFlag) -> Result<Flag, FlagError>;

    async fn get_flag(&self, id: Uuid) -> Result<Option<Flag>, FlagError>;

    async fn get_flag_by_key(
        &self,
        key: &str,
        owner: &OwnerScope,
    ) -> Result<Option<Flag>, FlagError>;

    async fn list_flags(&self, owner: &OwnerScope) -> Result<Vec<Flag>, FlagError>;

    /// Re-checks key uniqueness within the flag's owner when the key changes.
    async fn update_flag(&self, id: Uuid, update: FlagUpdate) -> Result<Flag, FlagError>;

    /// Removes the flag along with its overrides and audit entries. Deleting a flag that
    /// doesn't exist (including one already deleted) fails with `NotFound`.
    async fn delete_flag(&self, id: Uuid) -> Result<(), FlagError>;

    /// Upsert: creates the override or replaces the value of the existing one.
    async fn set_override(
        &self,
        flag_id: Uuid,
        user_id: Uuid,
        value: String,
    ) -> Result<Override, FlagError>;

    /// Insert-only: fails with `Conflict` if the user already has an override for this flag.
    async fn create_override(
        &self,
        flag_id: Uuid,
        user_id: Uuid,
        value: String,
    ) -> Result<Override, FlagError>;

    async fn delete_override(&self, flag_id: Uuid, user_id: Uuid) -> Result<(), FlagError>;

    async fn list_overrides(&self, flag_id: Uuid) -> Result<Vec<Override>, FlagError>;

    /// All overrides `user_id` holds on flags belonging to `owner`.
    async fn list_user_overrides(
        &self,
        owner: &OwnerScope,
        user_id: Uuid,
    ) -> Result<Vec<Override>, FlagError>;
}
