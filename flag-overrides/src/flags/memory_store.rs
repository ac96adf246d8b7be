use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::api::errors::FlagError;
use crate::audit::audit_models::{AuditLogEntry, NewAuditEntry};
use crate::audit::recorder::AuditLog;
use crate::flags::flag_models::{Flag, FlagUpdate, NewFlag, OwnerScope};
use crate::flags::flag_store::FlagStore;
use crate::flags::override_models::{validate_override_value, Override};

#[derive(Default)]
struct MemoryState {
    flags: HashMap<Uuid, Flag>,
    overrides: HashMap<(Uuid, Uuid), Override>,
    audit_log: Vec<AuditLogEntry>,
    fail_audit_writes: bool,
}

impl MemoryState {
    fn key_taken(&self, key: &str, owner: &OwnerScope, except: Option<Uuid>) -> bool {
        self.flags
            .values()
            .any(|f| f.key == key && &f.owner == owner && Some(f.id) != except)
    }

    fn insert_override(&mut self, flag_id: Uuid, user_id: Uuid, value: String) -> Override {
        let now = Utc::now();
        let stored = Override {
            flag_id,
            user_id,
            value,
            created_at: now,
            updated_at: now,
        };
        self.overrides.insert((flag_id, user_id), stored.clone());
        stored
    }
}

/// Process-local store. Every operation holds one lock for its whole duration, which
/// makes each one atomic the way a transaction would be.
#[derive(Default)]
pub struct MemoryFlagStore {
    state: Mutex<MemoryState>,
}

impl MemoryFlagStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes subsequent audit appends fail, to exercise the non-fatal audit path.
    pub fn fail_audit_writes(&self, fail: bool) {
        self.lock().fail_audit_writes = fail;
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl FlagStore for MemoryFlagStore {
    async fn create_flag(&self, new_flag: NewFlag) -> Result<Flag, FlagError> {
        new_flag.validate()?;
        let mut state = self.lock();

        if state.key_taken(&new_flag.key, &new_flag.owner, None) {
            return Err(FlagError::Conflict(format!(
                "flag key {} already exists for {}",
                new_flag.key, new_flag.owner
            )));
        }

        let now = Utc::now();
        let flag = Flag {
            id: Uuid::now_v7(),
            key: new_flag.key,
            flag_type: new_flag.flag_type,
            default_value: new_flag.default_value,
            description: new_flag.description,
            owner: new_flag.owner,
            created_at: now,
            updated_at: now,
        };
        state.flags.insert(flag.id, flag.clone());
        Ok(flag)
    }

    async fn get_flag(&self, id: Uuid) -> Result<Option<Flag>, FlagError> {
        Ok(self.lock().flags.get(&id).cloned())
    }

    async fn get_flag_by_key(
        &self,
        key: &str,
        owner: &OwnerScope,
    ) -> Result<Option<Flag>, FlagError> {
        Ok(self
            .lock()
            .flags
            .values()
            .find(|f| f.key == key && &f.owner == owner)
            .cloned())
    }

    async fn list_flags(&self, owner: &OwnerScope) -> Result<Vec<Flag>, FlagError> {
        let mut flags: Vec<Flag> = self
            .lock()
            .flags
            .values()
            .filter(|f| &f.owner == owner)
            .cloned()
            .collect();
        flags.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(flags)
    }

    async fn update_flag(&self, id: Uuid, update: FlagUpdate) -> Result<Flag, FlagError> {
        update.validate()?;
        let mut state = self.lock();

        let owner = match state.flags.get(&id) {
            Some(flag) => flag.owner,
            None => return Err(FlagError::flag_not_found(id)),
        };
        if state.key_taken(&update.key, &owner, Some(id)) {
            return Err(FlagError::Conflict(format!(
                "flag key {} already exists for {}",
                update.key, owner
            )));
        }

        let flag = state
            .flags
            .get_mut(&id)
            .ok_or_else(|| FlagError::flag_not_found(id))?;
        update.apply_to(flag, Utc::now());
        Ok(flag.clone())
    }

    async fn delete_flag(&self, id: Uuid) -> Result<(), FlagError> {
        let mut state = self.lock();
        if !state.flags.contains_key(&id) {
            return Err(FlagError::flag_not_found(id));
        }

        state.overrides.retain(|(flag_id, _), _| *flag_id != id);
        state.audit_log.retain(|entry| entry.flag_id() != id);
        state.flags.remove(&id);
        Ok(())
    }

    async fn set_override(
        &self,
        flag_id: Uuid,
        user_id: Uuid,
        value: String,
    ) -> Result<Override, FlagError> {
        validate_override_value(&value)?;
        let mut state = self.lock();
        if !state.flags.contains_key(&flag_id) {
            return Err(FlagError::flag_not_found(flag_id));
        }

        if let Some(existing) = state.overrides.get_mut(&(flag_id, user_id)) {
            existing.value = value;
            existing.updated_at = Utc::now();
            return Ok(existing.clone());
        }
        Ok(state.insert_override(flag_id, user_id, value))
    }

    async fn create_override(
        &self,
        flag_id: Uuid,
        user_id: Uuid,
        value: String,
    ) -> Result<Override, FlagError> {
        validate_override_value(&value)?;
        let mut state = self.lock();
        if !state.flags.contains_key(&flag_id) {
            return Err(FlagError::flag_not_found(flag_id));
        }
        if state.overrides.contains_key(&(flag_id, user_id)) {
            return Err(FlagError::Conflict(format!(
                "user {user_id} already has an override for flag {flag_id}"
            )));
        }
        Ok(state.insert_override(flag_id, user_id, value))
    }

    async fn delete_override(&self, flag_id: Uuid, user_id: Uuid) -> Result<(), FlagError> {
        match self.lock().overrides.remove(&(flag_id, user_id)) {
            Some(_) => Ok(()),
            None => Err(FlagError::override_not_found(flag_id, user_id)),
        }
    }

    async fn list_overrides(&self, flag_id: Uuid) -> Result<Vec<Override>, FlagError> {
        let mut overrides: Vec<Override> = self
            .lock()
            .overrides
            .values()
            .filter(|o| o.flag_id == flag_id)
            .cloned()
            .collect();
        overrides.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then(a.user_id.cmp(&b.user_id))
        });
        Ok(overrides)
    }

    async fn list_user_overrides(
        &self,
        owner: &OwnerScope,
        user_id: Uuid,
    ) -> Result<Vec<Override>, FlagError> {
        let state = self.lock();
        Ok(state
            .overrides
            .values()
            .filter(|o| {
                o.user_id == user_id
                    && state
                        .flags
                        .get(&o.flag_id)
                        .is_some_and(|f| &f.owner == owner)
            })
            .cloned()
            .collect())
    }
}

#[async_trait]
impl AuditLog for MemoryFlagStore {
    async fn append_audit_entry(&self, entry: NewAuditEntry) -> Result<AuditLogEntry, FlagError> {
        let mut state = self.lock();
        if state.fail_audit_writes {
            return Err(FlagError::Internal("audit log is not writable".to_string()));
        }
        let stored = AuditLogEntry::new(entry, Uuid::now_v7(), Utc::now());
        state.audit_log.push(stored.clone());
        Ok(stored)
    }

    async fn list_audit_entries(&self, flag_id: Uuid) -> Result<Vec<AuditLogEntry>, FlagError> {
        Ok(self
            .lock()
            .audit_log
            .iter()
            .filter(|entry| entry.flag_id() == flag_id)
            .cloned()
            .collect())
    }
}
