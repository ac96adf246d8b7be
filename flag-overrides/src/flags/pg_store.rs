use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::instrument;
use uuid::Uuid;

use crate::api::errors::FlagError;
use crate::audit::audit_models::{AuditLogEntry, AuditLogRow, NewAuditEntry};
use crate::audit::recorder::AuditLog;
use crate::flags::flag_models::{Flag, FlagRow, FlagUpdate, NewFlag, OwnerScope};
use crate::flags::flag_store::FlagStore;
use crate::flags::override_models::{validate_override_value, Override};

const FLAG_COLUMNS: &str = "id, key, flag_type, default_value, description, owner_user_id, owner_organization_id, created_at, updated_at";

/// Column and id that select a single owner. The column name comes from this fixed
/// pair, never from input, so it is safe to format into queries.
fn owner_filter(owner: &OwnerScope) -> (&'static str, Uuid) {
    match owner {
        OwnerScope::Personal { user_id } => ("owner_user_id", *user_id),
        OwnerScope::Organization { organization_id } => ("owner_organization_id", *organization_id),
    }
}

/// Flag store backed by the `flags`, `flag_overrides` and `flag_audit_log` tables.
#[derive(Clone)]
pub struct PgFlagStore {
    pool: PgPool,
}

impl PgFlagStore {
    pub async fn new(
        url: &str,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> Result<Self, FlagError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .test_before_acquire(true)
            .connect(url)
            .await
            .map_err(|e| FlagError::from_sqlx(e, "connect"))?;

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn run_migrations(&self) -> Result<(), FlagError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| FlagError::Internal(format!("failed to run migrations: {e}")))
    }

    pub async fn is_ready(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }

    async fn flag_exists(&self, flag_id: Uuid) -> Result<bool, FlagError> {
        let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM flags WHERE id = $1)")
            .bind(flag_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| FlagError::from_sqlx(e, "check flag exists"))?;
        Ok(exists)
    }
}

#[async_trait]
impl FlagStore for PgFlagStore {
    #[instrument(skip_all, fields(key = %new_flag.key, owner = %new_flag.owner))]
    async fn create_flag(&self, new_flag: NewFlag) -> Result<Flag, FlagError> {
        new_flag.validate()?;

        if self
            .get_flag_by_key(&new_flag.key, &new_flag.owner)
            .await?
            .is_some()
        {
            return Err(FlagError::Conflict(format!(
                "flag key {} already exists for {}",
                new_flag.key, new_flag.owner
            )));
        }

        let query = format!(
            r#"
INSERT INTO flags
    (id, key, flag_type, default_value, description, owner_user_id, owner_organization_id, created_at, updated_at)
VALUES
    ($1, $2, $3, $4, $5, $6, $7, NOW(), NOW())
RETURNING {FLAG_COLUMNS}
            "#
        );
        let conflict_context = format!(
            "flag key {} already exists for {}",
            new_flag.key, new_flag.owner
        );

        let row: FlagRow = sqlx::query_as(&query)
            .bind(Uuid::now_v7())
            .bind(&new_flag.key)
            .bind(new_flag.flag_type.as_str())
            .bind(&new_flag.default_value)
            .bind(&new_flag.description)
            .bind(new_flag.owner.owner_user_id())
            .bind(new_flag.owner.owner_organization_id())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| FlagError::from_sqlx(e, &conflict_context))?;

        row.try_into()
    }

    #[instrument(skip(self))]
    async fn get_flag(&self, id: Uuid) -> Result<Option<Flag>, FlagError> {
        let query = format!("SELECT {FLAG_COLUMNS} FROM flags WHERE id = $1");
        let row: Option<FlagRow> = sqlx::query_as(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| FlagError::from_sqlx(e, "fetch flag"))?;

        row.map(Flag::try_from).transpose()
    }

    #[instrument(skip(self))]
    async fn get_flag_by_key(
        &self,
        key: &str,
        owner: &OwnerScope,
    ) -> Result<Option<Flag>, FlagError> {
        let (owner_column, owner_id) = owner_filter(owner);
        let query =
            format!("SELECT {FLAG_COLUMNS} FROM flags WHERE key = $1 AND {owner_column} = $2");
        let row: Option<FlagRow> = sqlx::query_as(&query)
            .bind(key)
            .bind(owner_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| FlagError::from_sqlx(e, "fetch flag by key"))?;

        row.map(Flag::try_from).transpose()
    }

    #[instrument(skip(self))]
    async fn list_flags(&self, owner: &OwnerScope) -> Result<Vec<Flag>, FlagError> {
        let (owner_column, owner_id) = owner_filter(owner);
        let query = format!(
            "SELECT {FLAG_COLUMNS} FROM flags WHERE {owner_column} = $1 ORDER BY created_at, id"
        );
        let rows: Vec<FlagRow> = sqlx::query_as(&query)
            .bind(owner_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| FlagError::from_sqlx(e, "list flags"))?;

        rows.into_iter().map(Flag::try_from).collect()
    }

    #[instrument(skip(self, update), fields(key = %update.key))]
    async fn update_flag(&self, id: Uuid, update: FlagUpdate) -> Result<Flag, FlagError> {
        update.validate()?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| FlagError::from_sqlx(e, "begin update"))?;

        let query = format!("SELECT {FLAG_COLUMNS} FROM flags WHERE id = $1 FOR UPDATE");
        let current: Flag = sqlx::query_as::<_, FlagRow>(&query)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| FlagError::from_sqlx(e, "lock flag"))?
            .ok_or_else(|| FlagError::flag_not_found(id))?
            .try_into()?;

        let conflict_context = format!(
            "flag key {} already exists for {}",
            update.key, current.owner
        );

        if current.key != update.key {
            let (owner_column, owner_id) = owner_filter(&current.owner);
            let taken_query = format!(
                "SELECT EXISTS(SELECT 1 FROM flags WHERE key = $1 AND {owner_column} = $2 AND id <> $3)"
            );
            let taken: bool = sqlx::query_scalar(&taken_query)
                .bind(&update.key)
                .bind(owner_id)
                .bind(id)
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| FlagError::from_sqlx(e, "check key uniqueness"))?;
            if taken {
                return Err(FlagError::Conflict(conflict_context));
            }
        }

        let query = format!(
            r#"
UPDATE flags
SET key = $2, flag_type = $3, default_value = $4, description = $5, updated_at = NOW()
WHERE id = $1
RETURNING {FLAG_COLUMNS}
            "#
        );
        let row: FlagRow = sqlx::query_as(&query)
            .bind(id)
            .bind(&update.key)
            .bind(update.flag_type.as_str())
            .bind(&update.default_value)
            .bind(&update.description)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| FlagError::from_sqlx(e, &conflict_context))?;

        tx.commit()
            .await
            .map_err(|e| FlagError::from_sqlx(e, "commit update"))?;

        row.try_into()
    }

    #[instrument(skip(self))]
    async fn delete_flag(&self, id: Uuid) -> Result<(), FlagError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| FlagError::from_sqlx(e, "begin delete"))?;

        // Dependents first, then the flag itself. Dropping the transaction on any
        // error rolls all three back.
        sqlx::query("DELETE FROM flag_overrides WHERE flag_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| FlagError::from_sqlx(e, "delete overrides"))?;

        sqlx::query("DELETE FROM flag_audit_log WHERE flag_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| FlagError::from_sqlx(e, "delete audit entries"))?;

        let deleted = sqlx::query("DELETE FROM flags WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| FlagError::from_sqlx(e, "delete flag"))?;

        if deleted.rows_affected() == 0 {
            return Err(FlagError::flag_not_found(id));
        }

        tx.commit()
            .await
            .map_err(|e| FlagError::from_sqlx(e, "commit delete"))
    }

    #[instrument(skip(self, value))]
    async fn set_override(
        &self,
        flag_id: Uuid,
        user_id: Uuid,
        value: String,
    ) -> Result<Override, FlagError> {
        validate_override_value(&value)?;
        if !self.flag_exists(flag_id).await? {
            return Err(FlagError::flag_not_found(flag_id));
        }

        sqlx::query_as(
            r#"
INSERT INTO flag_overrides (flag_id, user_id, value, created_at, updated_at)
VALUES ($1, $2, $3, NOW(), NOW())
ON CONFLICT (flag_id, user_id) DO UPDATE
SET value = EXCLUDED.value, updated_at = NOW()
RETURNING flag_id, user_id, value, created_at, updated_at
            "#,
        )
        .bind(flag_id)
        .bind(user_id)
        .bind(&value)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| FlagError::from_sqlx(e, "upsert override"))
    }

    #[instrument(skip(self, value))]
    async fn create_override(
        &self,
        flag_id: Uuid,
        user_id: Uuid,
        value: String,
    ) -> Result<Override, FlagError> {
        validate_override_value(&value)?;
        if !self.flag_exists(flag_id).await? {
            return Err(FlagError::flag_not_found(flag_id));
        }

        sqlx::query_as(
            r#"
INSERT INTO flag_overrides (flag_id, user_id, value, created_at, updated_at)
VALUES ($1, $2, $3, NOW(), NOW())
RETURNING flag_id, user_id, value, created_at, updated_at
            "#,
        )
        .bind(flag_id)
        .bind(user_id)
        .bind(&value)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            FlagError::from_sqlx(
                e,
                &format!("user {user_id} already has an override for flag {flag_id}"),
            )
        })
    }

    #[instrument(skip(self))]
    async fn delete_override(&self, flag_id: Uuid, user_id: Uuid) -> Result<(), FlagError> {
        let deleted = sqlx::query("DELETE FROM flag_overrides WHERE flag_id = $1 AND user_id = $2")
            .bind(flag_id)
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(|e| FlagError::from_sqlx(e, "delete override"))?;

        if deleted.rows_affected() == 0 {
            return Err(FlagError::override_not_found(flag_id, user_id));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_overrides(&self, flag_id: Uuid) -> Result<Vec<Override>, FlagError> {
        sqlx::query_as(
            r#"
SELECT flag_id, user_id, value, created_at, updated_at
FROM flag_overrides
WHERE flag_id = $1
ORDER BY created_at, user_id
            "#,
        )
        .bind(flag_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| FlagError::from_sqlx(e, "list overrides"))
    }

    #[instrument(skip(self))]
    async fn list_user_overrides(
        &self,
        owner: &OwnerScope,
        user_id: Uuid,
    ) -> Result<Vec<Override>, FlagError> {
        let (owner_column, owner_id) = owner_filter(owner);
        let query = format!(
            r#"
SELECT o.flag_id, o.user_id, o.value, o.created_at, o.updated_at
FROM flag_overrides o
JOIN flags f ON f.id = o.flag_id
WHERE o.user_id = $1 AND f.{owner_column} = $2
            "#
        );
        sqlx::query_as(&query)
            .bind(user_id)
            .bind(owner_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| FlagError::from_sqlx(e, "list user overrides"))
    }
}

#[async_trait]
impl AuditLog for PgFlagStore {
    #[instrument(skip_all, fields(flag_id = %entry.flag_id, entry_type = %entry.entry_type))]
    async fn append_audit_entry(&self, entry: NewAuditEntry) -> Result<AuditLogEntry, FlagError> {
        let row: AuditLogRow = sqlx::query_as(
            r#"
INSERT INTO flag_audit_log (id, entry_type, message, flag_id, user_id, created_at)
VALUES ($1, $2, $3, $4, $5, NOW())
RETURNING id, entry_type, message, flag_id, user_id, created_at
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(entry.entry_type.as_str())
        .bind(&entry.message)
        .bind(entry.flag_id)
        .bind(entry.user_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| FlagError::from_sqlx(e, "append audit entry"))?;

        row.try_into()
    }

    #[instrument(skip(self))]
    async fn list_audit_entries(&self, flag_id: Uuid) -> Result<Vec<AuditLogEntry>, FlagError> {
        let rows: Vec<AuditLogRow> = sqlx::query_as(
            r#"
SELECT id, entry_type, message, flag_id, user_id, created_at
FROM flag_audit_log
WHERE flag_id = $1
ORDER BY created_at, id
            "#,
        )
        .bind(flag_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| FlagError::from_sqlx(e, "list audit entries"))?;

        rows.into_iter().map(AuditLogEntry::try_from).collect()
    }
}
