use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::OwnedMutexGuard;
use tracing::instrument;
use uuid::Uuid;

use crate::api::errors::FlagError;
use crate::audit::audit_models::{AuditEntryType, AuditLogEntry};
use crate::audit::recorder::AuditRecorder;
use crate::flags::flag_models::{Flag, FlagUpdate, NewFlag, OwnerScope};
use crate::flags::flag_store::FlagStore;
use crate::flags::override_models::Override;
use crate::flags::resolver::{resolve, EffectiveFlags};
use crate::metrics_consts::{EFFECTIVE_FLAGS_REQUESTS_COUNTER, FLAG_MUTATIONS_COUNTER};
use crate::metrics_utils::inc;
use crate::sse::broadcaster::{BroadcastTicket, ChangeBroadcaster};

// Idle per-flag locks are dropped once the map grows past this.
const FLAG_LOCKS_PRUNE_THRESHOLD: usize = 1024;

/// A committed mutation.
///
/// `audit_warning` is set when the audit append failed after the change was committed.
/// `broadcast` resolves once the change event has been offered to every connection.
#[derive(Debug)]
pub struct MutationOutcome<T> {
    pub value: T,
    pub audit_warning: Option<FlagError>,
    pub broadcast: BroadcastTicket,
}

impl<T> MutationOutcome<T> {
    pub fn warnings(&self) -> Vec<String> {
        self.audit_warning
            .iter()
            .map(|warning| warning.to_string())
            .collect()
    }
}

/// Serializes mutations of the same flag from store write through broadcast enqueue, so
/// the event order a subscriber sees matches the commit order.
#[derive(Default)]
struct FlagLocks {
    locks: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
}

impl FlagLocks {
    async fn acquire(&self, flag_id: Uuid) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            if locks.len() >= FLAG_LOCKS_PRUNE_THRESHOLD {
                locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            }
            locks.entry(flag_id).or_default().clone()
        };
        lock.lock_owned().await
    }
}

/// Entry point for every flag operation: store, then audit, then broadcast.
///
/// Rejected mutations return before the audit or broadcast step runs.
#[derive(Clone)]
pub struct FlagService {
    store: Arc<dyn FlagStore + Send + Sync>,
    audit: AuditRecorder,
    broadcaster: ChangeBroadcaster,
    flag_locks: Arc<FlagLocks>,
}

impl FlagService {
    pub fn new(
        store: Arc<dyn FlagStore + Send + Sync>,
        audit: AuditRecorder,
        broadcaster: ChangeBroadcaster,
    ) -> Self {
        Self {
            store,
            audit,
            broadcaster,
            flag_locks: Arc::new(FlagLocks::default()),
        }
    }

    pub fn broadcaster(&self) -> &ChangeBroadcaster {
        &self.broadcaster
    }

    #[instrument(skip(self, new_flag), fields(key = %new_flag.key, owner = %new_flag.owner))]
    pub async fn create_flag(
        &self,
        new_flag: NewFlag,
        actor_user_id: Uuid,
    ) -> Result<MutationOutcome<Flag>, FlagError> {
        // A fresh id can't be contended, so there is nothing to lock yet.
        let flag = self
            .store
            .create_flag(new_flag)
            .await
            .inspect_err(|e| count_mutation("create_flag", Err(e)))?;
        count_mutation("create_flag", Ok(()));

        let audit_warning = self
            .audit(
                AuditEntryType::Created,
                format!("Created flag {}", flag.key),
                flag.id,
                actor_user_id,
            )
            .await;
        let broadcast = self.broadcaster.broadcast_flag_created(&flag, actor_user_id);

        tracing::info!(flag_id = %flag.id, "Created flag");
        Ok(MutationOutcome {
            value: flag,
            audit_warning,
            broadcast,
        })
    }

    #[instrument(skip(self, update))]
    pub async fn update_flag(
        &self,
        id: Uuid,
        update: FlagUpdate,
        actor_user_id: Uuid,
    ) -> Result<MutationOutcome<Flag>, FlagError> {
        let _guard = self.flag_locks.acquire(id).await;

        let flag = self
            .store
            .update_flag(id, update)
            .await
            .inspect_err(|e| count_mutation("update_flag", Err(e)))?;
        count_mutation("update_flag", Ok(()));

        let audit_warning = self
            .audit(
                AuditEntryType::Updated,
                format!("Updated flag {}", flag.key),
                flag.id,
                actor_user_id,
            )
            .await;
        let broadcast = self.broadcaster.broadcast_flag_updated(&flag, actor_user_id);

        tracing::info!(flag_id = %flag.id, "Updated flag");
        Ok(MutationOutcome {
            value: flag,
            audit_warning,
            broadcast,
        })
    }

    /// Deletes the flag with its overrides and stored audit history. The deletion itself
    /// is recorded on the audit log stream only, since nothing stored survives it.
    #[instrument(skip(self))]
    pub async fn delete_flag(
        &self,
        id: Uuid,
        actor_user_id: Uuid,
    ) -> Result<MutationOutcome<()>, FlagError> {
        let _guard = self.flag_locks.acquire(id).await;

        let key = self.store.get_flag(id).await?.map(|flag| flag.key);
        self.store
            .delete_flag(id)
            .await
            .inspect_err(|e| count_mutation("delete_flag", Err(e)))?;
        count_mutation("delete_flag", Ok(()));

        let message = match key {
            Some(key) => format!("Deleted flag {key}"),
            None => format!("Deleted flag {id}"),
        };
        self.audit.record_deletion(message, id, actor_user_id);
        let broadcast = self.broadcaster.broadcast_flag_deleted(id, actor_user_id);

        tracing::info!(flag_id = %id, "Deleted flag");
        Ok(MutationOutcome {
            value: (),
            audit_warning: None,
            broadcast,
        })
    }

    #[instrument(skip(self, value))]
    pub async fn set_override(
        &self,
        flag_id: Uuid,
        user_id: Uuid,
        value: String,
        actor_user_id: Uuid,
    ) -> Result<MutationOutcome<Override>, FlagError> {
        let _guard = self.flag_locks.acquire(flag_id).await;

        let stored = self
            .store
            .set_override(flag_id, user_id, value)
            .await
            .inspect_err(|e| count_mutation("set_override", Err(e)))?;
        count_mutation("set_override", Ok(()));

        self.finish_override_write(stored, actor_user_id).await
    }

    /// Like `set_override`, but fails with `Conflict` instead of replacing a value.
    #[instrument(skip(self, value))]
    pub async fn create_override(
        &self,
        flag_id: Uuid,
        user_id: Uuid,
        value: String,
        actor_user_id: Uuid,
    ) -> Result<MutationOutcome<Override>, FlagError> {
        let _guard = self.flag_locks.acquire(flag_id).await;

        let stored = self
            .store
            .create_override(flag_id, user_id, value)
            .await
            .inspect_err(|e| count_mutation("create_override", Err(e)))?;
        count_mutation("create_override", Ok(()));

        self.finish_override_write(stored, actor_user_id).await
    }

    async fn finish_override_write(
        &self,
        stored: Override,
        actor_user_id: Uuid,
    ) -> Result<MutationOutcome<Override>, FlagError> {
        let audit_warning = self
            .audit(
                AuditEntryType::OverrideSet,
                format!(
                    "Set override for user {} to {}",
                    stored.user_id, stored.value
                ),
                stored.flag_id,
                actor_user_id,
            )
            .await;
        let broadcast = self
            .broadcaster
            .broadcast_override_set(&stored, actor_user_id);

        tracing::info!(flag_id = %stored.flag_id, user_id = %stored.user_id, "Set override");
        Ok(MutationOutcome {
            value: stored,
            audit_warning,
            broadcast,
        })
    }

    #[instrument(skip(self))]
    pub async fn delete_override(
        &self,
        flag_id: Uuid,
        user_id: Uuid,
        actor_user_id: Uuid,
    ) -> Result<MutationOutcome<()>, FlagError> {
        let _guard = self.flag_locks.acquire(flag_id).await;

        self.store
            .delete_override(flag_id, user_id)
            .await
            .inspect_err(|e| count_mutation("delete_override", Err(e)))?;
        count_mutation("delete_override", Ok(()));

        let audit_warning = self
            .audit(
                AuditEntryType::OverrideRemoved,
                format!("Removed override for user {user_id}"),
                flag_id,
                actor_user_id,
            )
            .await;
        let broadcast = self
            .broadcaster
            .broadcast_override_removed(flag_id, user_id, actor_user_id);

        tracing::info!(flag_id = %flag_id, user_id = %user_id, "Removed override");
        Ok(MutationOutcome {
            value: (),
            audit_warning,
            broadcast,
        })
    }

    pub async fn get_flag(&self, id: Uuid) -> Result<Flag, FlagError> {
        self.store
            .get_flag(id)
            .await?
            .ok_or_else(|| FlagError::flag_not_found(id))
    }

    pub async fn get_flag_by_key(&self, key: &str, owner: &OwnerScope) -> Result<Flag, FlagError> {
        self.store
            .get_flag_by_key(key, owner)
            .await?
            .ok_or_else(|| FlagError::flag_not_found(format!("{owner}/{key}")))
    }

    pub async fn list_flags(&self, owner: &OwnerScope) -> Result<Vec<Flag>, FlagError> {
        self.store.list_flags(owner).await
    }

    pub async fn list_overrides(&self, flag_id: Uuid) -> Result<Vec<Override>, FlagError> {
        self.get_flag(flag_id).await?;
        self.store.list_overrides(flag_id).await
    }

    pub async fn list_audit_entries(&self, flag_id: Uuid) -> Result<Vec<AuditLogEntry>, FlagError> {
        self.get_flag(flag_id).await?;
        self.audit.list_audit_entries(flag_id).await
    }

    /// Effective values of every flag `owner` has, as seen by `for_user`. No side effects.
    #[instrument(skip(self))]
    pub async fn get_effective_flags(
        &self,
        for_user: Uuid,
        owner: &OwnerScope,
    ) -> Result<EffectiveFlags, FlagError> {
        let flags = self.store.list_flags(owner).await?;
        let overrides = self.store.list_user_overrides(owner, for_user).await?;
        let effective = resolve(&flags, &overrides, for_user);

        inc(
            EFFECTIVE_FLAGS_REQUESTS_COUNTER,
            &[("overridden".to_string(), has_override(&effective).to_string())],
            1,
        );
        Ok(effective)
    }

    async fn audit(
        &self,
        entry_type: AuditEntryType,
        message: String,
        flag_id: Uuid,
        actor_user_id: Uuid,
    ) -> Option<FlagError> {
        self.audit
            .record(entry_type, message, flag_id, actor_user_id)
            .await
            .err()
    }
}

fn has_override(effective: &EffectiveFlags) -> bool {
    effective.values().any(|flag| flag.is_overridden)
}

fn count_mutation(operation: &str, result: Result<(), &FlagError>) {
    let outcome = match result {
        Ok(()) => "ok",
        Err(e) => e.error_code(),
    };
    inc(
        FLAG_MUTATIONS_COUNTER,
        &[
            ("operation".to_string(), operation.to_string()),
            ("outcome".to_string(), outcome.to_string()),
        ],
        1,
    );
}
