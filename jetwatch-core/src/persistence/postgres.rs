//! Postgres-backed `Persistence`. Queries are hand-built
//! with `sqlx::query` + `.bind()` + `Row::try_get()`, not the `query!`
//! macro — this workspace has no `DATABASE_URL` available at build time to
//! check the macro against.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::{
    BackfillState, ChangeCandidate, ChangeRecord, ChangeType, IgnoredDid, InsertOutcome,
    MonitoredFollow,
};
use crate::error::{EngineError, Result};
use crate::persistence::traits::Persistence;
use crate::types::{Did, Handle};

const MAX_RETRY_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY_MS: u64 = 200;

/// Embedded migrator for the five tables this crate owns. Shared between
/// `PostgresPersistence::migrate` at boot and `#[sqlx::test(migrator =
/// "jetwatch_core::persistence::postgres::MIGRATOR")]` fixtures.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("../migrations");

#[derive(Clone)]
pub struct PostgresPersistence {
    pool: PgPool,
}

impl PostgresPersistence {
    pub async fn connect(database_url: &str) -> Result<Self> {
        info!("connecting to postgres");
        let pool = PgPoolOptions::new()
            .max_connections(20)
            .connect(database_url)
            .await?;
        info!("postgres pool established");
        Ok(Self { pool })
    }

    /// Wraps an already-established pool, used by `sqlx::test` fixtures
    /// that hand out a pre-migrated per-test database.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<()> {
        MIGRATOR
            .run(&self.pool)
            .await
            .map_err(|err| EngineError::Internal(format!("migration failed: {err}")))
    }

    /// Retries a transient DB operation up to `MAX_RETRY_ATTEMPTS` with
    /// `RETRY_BASE_DELAY_MS * 2^(n-1)` backoff.
    async fn with_retry<T, F, Fut>(&self, op_name: &str, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = sqlx::Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match f().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < MAX_RETRY_ATTEMPTS => {
                    let delay_ms = RETRY_BASE_DELAY_MS * 2u64.pow(attempt - 1);
                    warn!(op_name, attempt, delay_ms, %err, "transient db error, retrying");
                    tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
                }
                Err(err) => {
                    warn!(op_name, attempt, %err, "db operation failed permanently");
                    return Err(EngineError::Database(err));
                }
            }
        }
    }

    fn row_to_change_record(row: &sqlx::postgres::PgRow) -> sqlx::Result<ChangeRecord> {
        let change_type_str: String = row.try_get("change_type")?;
        let change_type = match change_type_str.as_str() {
            "handle" => ChangeType::Handle,
            "combined" => ChangeType::Combined,
            _ => ChangeType::Profile,
        };
        Ok(ChangeRecord {
            id: row.try_get("id")?,
            did: row.try_get("did")?,
            handle: row.try_get("handle")?,
            old_handle: row.try_get("old_handle")?,
            new_handle: row.try_get("new_handle")?,
            old_display_name: row.try_get("old_display_name")?,
            new_display_name: row.try_get("new_display_name")?,
            old_avatar: row.try_get("old_avatar")?,
            new_avatar: row.try_get("new_avatar")?,
            change_type,
            changed_at: row.try_get("changed_at")?,
        })
    }

    async fn find_duplicate_row(
        &self,
        candidate: &ChangeCandidate,
    ) -> Result<Option<ChangeRecord>> {
        let row = self
            .with_retry("find_duplicate", || {
                let candidate = candidate.clone();
                async move {
                    sqlx::query(
                        r#"
                        SELECT id, did, handle, old_handle, new_handle,
                               old_display_name, new_display_name, old_avatar, new_avatar,
                               change_type, changed_at
                        FROM profile_changes
                        WHERE did = $1
                          AND old_handle IS NOT DISTINCT FROM $2
                          AND new_handle IS NOT DISTINCT FROM $3
                          AND old_display_name IS NOT DISTINCT FROM $4
                          AND new_display_name IS NOT DISTINCT FROM $5
                          AND old_avatar IS NOT DISTINCT FROM $6
                          AND new_avatar IS NOT DISTINCT FROM $7
                        LIMIT 1
                        "#,
                    )
                    .bind(candidate.did.as_str())
                    .bind(&candidate.old_handle)
                    .bind(&candidate.new_handle)
                    .bind(&candidate.old_display_name)
                    .bind(&candidate.new_display_name)
                    .bind(&candidate.old_avatar)
                    .bind(&candidate.new_avatar)
                    .fetch_optional(&self.pool)
                    .await
                }
            })
            .await?;

        Ok(row.as_ref().map(Self::row_to_change_record).transpose()?)
    }
}

#[async_trait]
impl Persistence for PostgresPersistence {
    async fn is_ignored(&self, did: &Did) -> Result<bool> {
        let did = did.clone();
        let row = self
            .with_retry("is_ignored", || {
                let did = did.clone();
                async move {
                    sqlx::query("SELECT 1 FROM ignored_users WHERE did = $1")
                        .bind(did.as_str())
                        .fetch_optional(&self.pool)
                        .await
                }
            })
            .await?;
        Ok(row.is_some())
    }

    async fn find_duplicate(&self, candidate: &ChangeCandidate) -> Result<Option<InsertOutcome>> {
        let existing = self.find_duplicate_row(candidate).await?;
        Ok(existing.map(InsertOutcome::Duplicate))
    }

    async fn insert(&self, candidate: ChangeCandidate) -> Result<InsertOutcome> {
        if self.is_ignored(&candidate.did).await? {
            debug!(did = %candidate.did, "insert skipped, did is ignored");
            return Ok(InsertOutcome::Ignored);
        }

        if let Some(existing) = self.find_duplicate_row(&candidate).await? {
            debug!(did = %candidate.did, "duplicate change candidate, returning stored row");
            return Ok(InsertOutcome::Duplicate(existing));
        }

        let change_type = ChangeType::classify(&candidate);
        let change_type_str = match change_type {
            ChangeType::Handle => "handle",
            ChangeType::Profile => "profile",
            ChangeType::Combined => "combined",
        };
        let id = Uuid::now_v7();
        let changed_at = Utc::now();

        let row = self
            .with_retry("insert_change", || {
                let candidate = candidate.clone();
                async move {
                    sqlx::query(
                        r#"
                        INSERT INTO profile_changes
                            (id, did, handle, old_handle, new_handle,
                             old_display_name, new_display_name, old_avatar, new_avatar,
                             change_type, changed_at)
                        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                        RETURNING id, did, handle, old_handle, new_handle,
                                  old_display_name, new_display_name, old_avatar, new_avatar,
                                  change_type, changed_at
                        "#,
                    )
                    .bind(id)
                    .bind(candidate.did.as_str())
                    .bind(&candidate.handle)
                    .bind(&candidate.old_handle)
                    .bind(&candidate.new_handle)
                    .bind(&candidate.old_display_name)
                    .bind(&candidate.new_display_name)
                    .bind(&candidate.old_avatar)
                    .bind(&candidate.new_avatar)
                    .bind(change_type_str)
                    .bind(changed_at)
                    .fetch_one(&self.pool)
                    .await
                }
            })
            .await?;

        let record = Self::row_to_change_record(&row)?;
        Ok(InsertOutcome::Inserted(record))
    }

    async fn last_known_handle(&self, did: &Did) -> Result<Option<Handle>> {
        let did = did.clone();
        let row = self
            .with_retry("last_known_handle", || {
                let did = did.clone();
                async move {
                    sqlx::query(
                        r#"
                        SELECT COALESCE(new_handle, handle) AS handle
                        FROM profile_changes
                        WHERE did = $1 AND COALESCE(new_handle, handle) IS NOT NULL
                        ORDER BY changed_at DESC
                        LIMIT 1
                        "#,
                    )
                    .bind(did.as_str())
                    .fetch_optional(&self.pool)
                    .await
                }
            })
            .await?;

        Ok(row
            .map(|r| r.try_get::<Option<String>, _>("handle"))
            .transpose()?
            .flatten()
            .map(Handle::from))
    }

    async fn add_ignored(&self, did: &Did) -> Result<()> {
        let did = did.clone();
        let added_at = Utc::now();
        self.with_retry("add_ignored", || {
            let did = did.clone();
            async move {
                sqlx::query(
                    r#"
                    INSERT INTO ignored_users (did, added_at)
                    VALUES ($1, $2)
                    ON CONFLICT (did) DO NOTHING
                    "#,
                )
                .bind(did.as_str())
                .bind(added_at)
                .execute(&self.pool)
                .await
            }
        })
        .await?;
        Ok(())
    }

    async fn remove_ignored(&self, did: &Did) -> Result<()> {
        let did = did.clone();
        self.with_retry("remove_ignored", || {
            let did = did.clone();
            async move {
                sqlx::query("DELETE FROM ignored_users WHERE did = $1")
                    .bind(did.as_str())
                    .execute(&self.pool)
                    .await
            }
        })
        .await?;
        Ok(())
    }

    async fn list_ignored(&self) -> Result<Vec<IgnoredDid>> {
        let rows = self
            .with_retry("list_ignored", || async move {
                sqlx::query("SELECT did, added_at FROM ignored_users")
                    .fetch_all(&self.pool)
                    .await
            })
            .await?;
        rows.into_iter()
            .map(|row| {
                Ok(IgnoredDid {
                    did: row.try_get("did")?,
                    added_at: row.try_get("added_at")?,
                })
            })
            .collect()
    }

    async fn upsert_follows(&self, follows: &[MonitoredFollow]) -> Result<()> {
        if follows.is_empty() {
            return Ok(());
        }
        let follows = follows.to_vec();
        self.with_retry("upsert_follows", || {
            let follows = follows.clone();
            async move {
                let mut tx = self.pool.begin().await?;
                for follow in &follows {
                    sqlx::query(
                        r#"
                        INSERT INTO monitored_follows (user_did, follow_did, follow_handle, rkey, added_at)
                        VALUES ($1, $2, $3, $4, $5)
                        ON CONFLICT (user_did, follow_did) DO UPDATE
                        SET follow_handle = EXCLUDED.follow_handle, rkey = EXCLUDED.rkey
                        "#,
                    )
                    .bind(&follow.user_did)
                    .bind(&follow.follow_did)
                    .bind(&follow.follow_handle)
                    .bind(&follow.record_key)
                    .bind(follow.added_at)
                    .execute(&mut *tx)
                    .await?;
                }
                tx.commit().await
            }
        })
        .await?;
        Ok(())
    }

    async fn remove_follow(&self, user_did: &Did, follow_did: &Did) -> Result<()> {
        let user_did = user_did.clone();
        let follow_did = follow_did.clone();
        self.with_retry("remove_follow", || {
            let user_did = user_did.clone();
            let follow_did = follow_did.clone();
            async move {
                sqlx::query("DELETE FROM monitored_follows WHERE user_did = $1 AND follow_did = $2")
                    .bind(user_did.as_str())
                    .bind(follow_did.as_str())
                    .execute(&self.pool)
                    .await
            }
        })
        .await?;
        Ok(())
    }

    async fn follow_by_rkey(&self, user_did: &Did, rkey: &str) -> Result<Option<MonitoredFollow>> {
        let user_did = user_did.clone();
        let rkey = rkey.to_string();
        let row = self
            .with_retry("follow_by_rkey", || {
                let user_did = user_did.clone();
                let rkey = rkey.clone();
                async move {
                    sqlx::query(
                        "SELECT user_did, follow_did, follow_handle, rkey, added_at \
                         FROM monitored_follows WHERE user_did = $1 AND rkey = $2",
                    )
                    .bind(user_did.as_str())
                    .bind(rkey)
                    .fetch_optional(&self.pool)
                    .await
                }
            })
            .await?;
        Ok(row
            .map(|r| {
                Ok::<_, sqlx::Error>(MonitoredFollow {
                    user_did: r.try_get("user_did")?,
                    follow_did: r.try_get("follow_did")?,
                    follow_handle: r.try_get("follow_handle")?,
                    record_key: r.try_get("rkey")?,
                    added_at: r.try_get("added_at")?,
                })
            })
            .transpose()?)
    }

    async fn follows_for_user(&self, user_did: &Did) -> Result<Vec<MonitoredFollow>> {
        let user_did = user_did.clone();
        let rows = self
            .with_retry("follows_for_user", || {
                let user_did = user_did.clone();
                async move {
                    sqlx::query(
                        "SELECT user_did, follow_did, follow_handle, rkey, added_at \
                         FROM monitored_follows WHERE user_did = $1",
                    )
                    .bind(user_did.as_str())
                    .fetch_all(&self.pool)
                    .await
                }
            })
            .await?;
        rows.into_iter()
            .map(|r| {
                Ok(MonitoredFollow {
                    user_did: r.try_get("user_did")?,
                    follow_did: r.try_get("follow_did")?,
                    follow_handle: r.try_get("follow_handle")?,
                    record_key: r.try_get("rkey")?,
                    added_at: r.try_get("added_at")?,
                })
            })
            .collect()
    }

    async fn followers_of(&self, follow_did: &Did) -> Result<Vec<MonitoredFollow>> {
        let follow_did = follow_did.clone();
        let rows = self
            .with_retry("followers_of", || {
                let follow_did = follow_did.clone();
                async move {
                    sqlx::query(
                        "SELECT user_did, follow_did, follow_handle, rkey, added_at \
                         FROM monitored_follows WHERE follow_did = $1",
                    )
                    .bind(follow_did.as_str())
                    .fetch_all(&self.pool)
                    .await
                }
            })
            .await?;
        rows.into_iter()
            .map(|r| {
                Ok(MonitoredFollow {
                    user_did: r.try_get("user_did")?,
                    follow_did: r.try_get("follow_did")?,
                    follow_handle: r.try_get("follow_handle")?,
                    record_key: r.try_get("rkey")?,
                    added_at: r.try_get("added_at")?,
                })
            })
            .collect()
    }

    async fn purge_user(&self, user_did: &Did) -> Result<()> {
        let user_did = user_did.clone();
        self.with_retry("purge_user", || {
            let user_did = user_did.clone();
            async move {
                sqlx::query("DELETE FROM monitored_follows WHERE user_did = $1")
                    .bind(user_did.as_str())
                    .execute(&self.pool)
                    .await
            }
        })
        .await?;
        Ok(())
    }

    async fn backfill_state(&self, user_did: &Did) -> Result<Option<BackfillState>> {
        let user_did = user_did.clone();
        let row = self
            .with_retry("backfill_state", || {
                let user_did = user_did.clone();
                async move {
                    sqlx::query(
                        "SELECT user_did, last_started_at, last_completed_at, updated_at \
                         FROM monitoring_backfill_state WHERE user_did = $1",
                    )
                    .bind(user_did.as_str())
                    .fetch_optional(&self.pool)
                    .await
                }
            })
            .await?;
        Ok(row
            .map(|r| {
                Ok::<_, sqlx::Error>(BackfillState {
                    user_did: r.try_get("user_did")?,
                    last_started_at: r.try_get("last_started_at")?,
                    last_completed_at: r.try_get("last_completed_at")?,
                    updated_at: r.try_get("updated_at")?,
                })
            })
            .transpose()?)
    }

    async fn list_backfill_states(&self) -> Result<Vec<BackfillState>> {
        let rows = self
            .with_retry("list_backfill_states", || async move {
                sqlx::query(
                    "SELECT user_did, last_started_at, last_completed_at, updated_at FROM monitoring_backfill_state",
                )
                .fetch_all(&self.pool)
                .await
            })
            .await?;
        rows.into_iter()
            .map(|r| {
                Ok(BackfillState {
                    user_did: r.try_get("user_did")?,
                    last_started_at: r.try_get("last_started_at")?,
                    last_completed_at: r.try_get("last_completed_at")?,
                    updated_at: r.try_get("updated_at")?,
                })
            })
            .collect()
    }

    async fn mark_backfill_started(&self, user_did: &Did, at: DateTime<Utc>) -> Result<()> {
        let user_did = user_did.clone();
        self.with_retry("mark_backfill_started", || {
            let user_did = user_did.clone();
            async move {
                sqlx::query(
                    r#"
                    INSERT INTO monitoring_backfill_state (user_did, last_started_at, last_completed_at, updated_at)
                    VALUES ($1, $2, NULL, $2)
                    ON CONFLICT (user_did) DO UPDATE
                    SET last_started_at = EXCLUDED.last_started_at,
                        last_completed_at = NULL,
                        updated_at = EXCLUDED.updated_at
                    "#,
                )
                .bind(user_did.as_str())
                .bind(at)
                .execute(&self.pool)
                .await
            }
        })
        .await?;
        Ok(())
    }

    async fn mark_backfill_completed(&self, user_did: &Did, at: DateTime<Utc>) -> Result<()> {
        let user_did = user_did.clone();
        self.with_retry("mark_backfill_completed", || {
            let user_did = user_did.clone();
            async move {
                sqlx::query(
                    r#"
                    UPDATE monitoring_backfill_state
                    SET last_completed_at = $2, updated_at = $2
                    WHERE user_did = $1
                    "#,
                )
                .bind(user_did.as_str())
                .bind(at)
                .execute(&self.pool)
                .await
            }
        })
        .await?;
        Ok(())
    }

    async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let key = key.to_string();
        let row = self
            .with_retry("get_setting", || {
                let key = key.clone();
                async move {
                    sqlx::query("SELECT value FROM system_settings WHERE key = $1")
                        .bind(key)
                        .fetch_optional(&self.pool)
                        .await
                }
            })
            .await?;
        row.map(|r| r.try_get::<String, _>("value"))
            .transpose()
            .map_err(EngineError::from)
    }

    async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let key = key.to_string();
        let value = value.to_string();
        self.with_retry("set_setting", || {
            let key = key.clone();
            let value = value.clone();
            async move {
                sqlx::query(
                    r#"
                    INSERT INTO system_settings (key, value, updated_at)
                    VALUES ($1, $2, NOW())
                    ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, updated_at = NOW()
                    "#,
                )
                .bind(key)
                .bind(value)
                .execute(&self.pool)
                .await
            }
        })
        .await?;
        Ok(())
    }
}
