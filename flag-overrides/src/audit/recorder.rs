use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::api::errors::FlagError;
use crate::audit::audit_models::{AuditEntryType, AuditLogEntry, NewAuditEntry};
use crate::metrics_consts::{AUDIT_ENTRIES_WRITTEN_COUNTER, AUDIT_WRITE_FAILURES_COUNTER};
use crate::metrics_utils::inc;

/// Structured log target every audit record is mirrored to.
pub const AUDIT_LOG_TARGET: &str = "flag_overrides::audit";

/// Append-only storage for audit entries.
#[async_trait]
pub trait AuditLog {
    async fn append_audit_entry(&self, entry: NewAuditEntry) -> Result<AuditLogEntry, FlagError>;

    /// Entries for one flag, oldest first.
    async fn list_audit_entries(&self, flag_id: Uuid) -> Result<Vec<AuditLogEntry>, FlagError>;
}

#[derive(Clone)]
pub struct AuditRecorder {
    log: Arc<dyn AuditLog + Send + Sync>,
}

impl AuditRecorder {
    pub fn new(log: Arc<dyn AuditLog + Send + Sync>) -> Self {
        Self { log }
    }

    /// Appends one entry for a committed mutation.
    ///
    /// A failed append comes back as `AuditWriteFailure`. The mutation it describes has
    /// already been committed and stays committed; callers report the failure next to the
    /// successful result.
    pub async fn record(
        &self,
        entry_type: AuditEntryType,
        message: impl Into<String>,
        flag_id: Uuid,
        actor_user_id: Uuid,
    ) -> Result<AuditLogEntry, FlagError> {
        let entry = NewAuditEntry {
            entry_type,
            message: message.into(),
            flag_id,
            user_id: actor_user_id,
        };
        emit(&entry);

        let labels = [("type".to_string(), entry_type.to_string())];
        match self.log.append_audit_entry(entry).await {
            Ok(stored) => {
                inc(AUDIT_ENTRIES_WRITTEN_COUNTER, &labels, 1);
                Ok(stored)
            }
            Err(e) => {
                tracing::warn!(
                    flag_id = %flag_id,
                    entry_type = %entry_type,
                    error = %e,
                    "Failed to append audit entry"
                );
                inc(AUDIT_WRITE_FAILURES_COUNTER, &labels, 1);
                Err(FlagError::AuditWriteFailure(e.to_string()))
            }
        }
    }

    /// Records a flag deletion. The flag's stored history is removed by the same delete,
    /// so the entry only goes to the structured audit stream.
    pub fn record_deletion(&self, message: impl Into<String>, flag_id: Uuid, actor_user_id: Uuid) {
        emit(&NewAuditEntry {
            entry_type: AuditEntryType::Deleted,
            message: message.into(),
            flag_id,
            user_id: actor_user_id,
        });
        inc(
            AUDIT_ENTRIES_WRITTEN_COUNTER,
            &[("type".to_string(), AuditEntryType::Deleted.to_string())],
            1,
        );
    }

    pub async fn list_audit_entries(&self, flag_id: Uuid) -> Result<Vec<AuditLogEntry>, FlagError> {
        self.log.list_audit_entries(flag_id).await
    }
}

fn emit(entry: &NewAuditEntry) {
    tracing::info!(
        target: AUDIT_LOG_TARGET,
        entry_type = %entry.entry_type,
        flag_id = %entry.flag_id,
        user_id = %entry.user_id,
        message = %entry.message,
        "audit"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::flag_models::{FlagType, NewFlag, OwnerScope};
    use crate::flags::flag_store::FlagStore;
    use crate::flags::memory_store::MemoryFlagStore;

    async fn setup() -> (Arc<MemoryFlagStore>, AuditRecorder, Uuid) {
        let store = Arc::new(MemoryFlagStore::new());
        let flag = store
            .create_flag(NewFlag {
                key: "beta".to_string(),
                flag_type: FlagType::Boolean,
                default_value: "false".to_string(),
                description: None,
                owner: OwnerScope::Personal {
                    user_id: Uuid::now_v7(),
                },
            })
            .await
            .unwrap();
        let recorder = AuditRecorder::new(store.clone());
        (store, recorder, flag.id)
    }

    #[tokio::test]
    async fn test_record_appends_entries_in_order() {
        let (_store, recorder, flag_id) = setup().await;
        let actor = Uuid::now_v7();

        recorder
            .record(AuditEntryType::Created, "created beta", flag_id, actor)
            .await
            .unwrap();
        recorder
            .record(AuditEntryType::Updated, "updated beta", flag_id, actor)
            .await
            .unwrap();

        let entries = recorder.list_audit_entries(flag_id).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].entry_type(), AuditEntryType::Created);
        assert_eq!(entries[1].entry_type(), AuditEntryType::Updated);
        assert_eq!(entries[1].message(), "updated beta");
        assert_eq!(entries[1].user_id(), actor);
        assert!(entries[0].created_at() <= entries[1].created_at());
    }

    #[tokio::test]
    async fn test_failed_append_is_reported_as_audit_write_failure() {
        let (store, recorder, flag_id) = setup().await;
        store.fail_audit_writes(true);

        match recorder
            .record(AuditEntryType::Updated, "updated beta", flag_id, Uuid::now_v7())
            .await
        {
            Err(FlagError::AuditWriteFailure(_)) => (),
            other => panic!("Expected AuditWriteFailure, got {:?}", other),
        }

        store.fail_audit_writes(false);
        assert!(recorder.list_audit_entries(flag_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_record_deletion_does_not_persist() {
        let (_store, recorder, flag_id) = setup().await;

        recorder.record_deletion("deleted beta", flag_id, Uuid::now_v7());

        assert!(recorder.list_audit_entries(flag_id).await.unwrap().is_empty());
    }
}
