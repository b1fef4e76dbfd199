//! Postgres-backed pull event ledger.
//!
//! This module is feature-gated behind `postgres`.

#![cfg(feature = "postgres")]

use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, postgres::PgRow, PgPool, Row};

use crate::config::{is_valid_schema_ident, DatabaseConfig};
use crate::error::{map_driver_err, PullEventError};

use super::models::{LineageKey, NewPullEvent, PullEvent, PullEventId};
use super::repository::{dt_to_ms, PullEventRepository, PullEventRow};
use super::status::{validate_transition, PullEventStatus};

fn new_db_runtime() -> Result<Arc<tokio::runtime::Runtime>, String> {
    static DB_RT: OnceLock<Result<Arc<tokio::runtime::Runtime>, String>> = OnceLock::new();
    DB_RT
        .get_or_init(|| {
            tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .worker_threads(1)
                .thread_name("gitpull-ledger-pg")
                .build()
                .map(Arc::new)
                .map_err(|e| e.to_string())
        })
        .clone()
}

fn read_row(row: &PgRow) -> PullEventRow {
    PullEventRow {
        id: row.get(0),
        provider: row.get(1),
        repository_owner: row.get(2),
        repository_name: row.get(3),
        branch: row.get(4),
        commit: row.get(5),
        status: row.get(6),
        pushed_at_ms: row.get(7),
        created_at_ms: row.get(8),
        updated_at_ms: row.get(9),
    }
}

fn into_events(rows: Vec<PgRow>) -> Result<Vec<PullEvent>, PullEventError> {
    rows.iter().map(|r| read_row(r).into_event()).collect()
}

fn to_i64(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[derive(Clone)]
pub struct PostgresPullEventRepository {
    pool: Option<PgPool>,
    schema: String,
    init_error: Option<String>,
    db_runtime: Option<Arc<tokio::runtime::Runtime>>,
    schema_ready: OnceLock<Result<(), String>>,
}

impl PostgresPullEventRepository {
    /// Builds a lazily connecting repository; nothing touches the network until
    /// the first call.
    pub fn new(database_url: impl Into<String>) -> Self {
        let database_url = database_url.into();
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect_lazy(&database_url)
            .ok();
        let init_error = if pool.is_some() {
            None
        } else {
            Some("failed to initialize lazy postgres ledger pool".to_string())
        };
        let db_runtime = new_db_runtime().ok();

        Self {
            pool,
            schema: "public".to_string(),
            init_error,
            db_runtime,
            schema_ready: OnceLock::new(),
        }
    }

    pub fn with_pool(pool: PgPool) -> Self {
        Self {
            pool: Some(pool),
            schema: "public".to_string(),
            init_error: None,
            db_runtime: new_db_runtime().ok(),
            schema_ready: OnceLock::new(),
        }
    }

    /// Builds a repository from the `[database]` section, after env overrides.
    pub fn from_config(config: &DatabaseConfig) -> Result<Self, PullEventError> {
        let Some(url) = config.url.as_deref() else {
            return Err(PullEventError::Config("database.url is not set".to_string()));
        };
        if !is_valid_schema_ident(&config.schema) {
            return Err(PullEventError::Config(format!(
                "invalid database schema: {}",
                config.schema
            )));
        }
        Ok(Self::new(url).with_schema(config.schema.clone()))
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }

    fn runtime(&self) -> Result<&tokio::runtime::Runtime, PullEventError> {
        if let Some(err) = &self.init_error {
            return Err(map_driver_err("postgres init error", err));
        }
        self.db_runtime
            .as_deref()
            .ok_or_else(|| map_driver_err("runtime not available", "no db runtime"))
    }

    fn pool(&self) -> Result<&PgPool, PullEventError> {
        self.pool
            .as_ref()
            .ok_or_else(|| map_driver_err("pool not available", "no postgres pool"))
    }

    fn ensure_schema(&self) -> Result<(), PullEventError> {
        if !is_valid_schema_ident(&self.schema) {
            return Err(map_driver_err("invalid schema", &self.schema));
        }

        let result = self.schema_ready.get_or_init(|| {
            let schema = self.schema.clone();
            let sql_schema = format!("CREATE SCHEMA IF NOT EXISTS \"{}\"", schema);
            let sql_events = format!(
                "CREATE TABLE IF NOT EXISTS \"{}\".pull_events (
                    id BIGSERIAL PRIMARY KEY,
                    provider TEXT NOT NULL,
                    repository_owner TEXT NOT NULL,
                    repository_name TEXT NOT NULL,
                    branch TEXT NOT NULL,
                    commit_sha TEXT NOT NULL,
                    status TEXT NOT NULL,
                    pushed_at_ms BIGINT NOT NULL,
                    created_at_ms BIGINT NOT NULL,
                    updated_at_ms BIGINT NOT NULL
                )",
                schema
            );
            let sql_lineage_idx = format!(
                "CREATE INDEX IF NOT EXISTS idx_pull_events_lineage_pushed
                 ON \"{}\".pull_events(provider, repository_owner, repository_name, branch, pushed_at_ms DESC, id DESC)",
                schema
            );
            let sql_ready_idx = format!(
                "CREATE INDEX IF NOT EXISTS idx_pull_events_status_pushed
                 ON \"{}\".pull_events(status, pushed_at_ms DESC)",
                schema
            );
            let sql_stale_idx = format!(
                "CREATE INDEX IF NOT EXISTS idx_pull_events_status_updated
                 ON \"{}\".pull_events(status, updated_at_ms)",
                schema
            );

            let pool = match self.pool() {
                Ok(p) => p.clone(),
                Err(e) => return Err(e.to_string()),
            };
            let rt = match self.runtime() {
                Ok(r) => r,
                Err(e) => return Err(e.to_string()),
            };

            rt.block_on(async {
                sqlx::query(&sql_schema).execute(&pool).await?;
                sqlx::query(&sql_events).execute(&pool).await?;
                sqlx::query(&sql_lineage_idx).execute(&pool).await?;
                sqlx::query(&sql_ready_idx).execute(&pool).await?;
                sqlx::query(&sql_stale_idx).execute(&pool).await?;
                Ok::<(), sqlx::Error>(())
            })
            .map_err(|e| e.to_string())
        });

        result
            .clone()
            .map_err(|e| map_driver_err("schema bootstrap", e))
    }
}

impl PullEventRepository for PostgresPullEventRepository {
    fn append(&self, event: &NewPullEvent) -> Result<PullEvent, PullEventError> {
        self.ensure_schema()?;

        let pool = self.pool()?.clone();
        let rt = self.runtime()?;
        let schema = self.schema.clone();
        let lineage = event.lineage().clone();
        let commit = event.commit().to_string();
        let pushed_at_ms = dt_to_ms(event.pushed_at());
        let now_ms = dt_to_ms(Utc::now());
        rt.block_on(async move {
            let sql = format!(
                "INSERT INTO \"{}\".pull_events
                 (provider, repository_owner, repository_name, branch, commit_sha, status,
                  pushed_at_ms, created_at_ms, updated_at_ms)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8)
                 RETURNING {}",
                schema,
                PullEventRow::COLUMNS
            );
            let row = sqlx::query(&sql)
                .bind(&lineage.provider)
                .bind(&lineage.repository_owner)
                .bind(&lineage.repository_name)
                .bind(&lineage.branch)
                .bind(&commit)
                .bind(PullEventStatus::Pending.as_str())
                .bind(pushed_at_ms)
                .bind(now_ms)
                .fetch_one(&pool)
                .await
                .map_err(|e| map_driver_err("append pull event", e))?;
            read_row(&row).into_event()
        })
    }

    fn set_status(
        &self,
        id: PullEventId,
        status: PullEventStatus,
    ) -> Result<PullEvent, PullEventError> {
        self.ensure_schema()?;

        let pool = self.pool()?.clone();
        let rt = self.runtime()?;
        let schema = self.schema.clone();
        let now_ms = dt_to_ms(Utc::now());

        rt.block_on(async move {
            let mut tx = pool
                .begin()
                .await
                .map_err(|e| map_driver_err("begin set status tx", e))?;

            let select_sql = format!(
                "SELECT status FROM \"{}\".pull_events WHERE id = $1 FOR UPDATE",
                schema
            );
            let current: Option<String> = sqlx::query_scalar(&select_sql)
                .bind(id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| map_driver_err("read pull event status", e))?;
            let current = current.ok_or(PullEventError::NotFound(id))?;
            let current = PullEventStatus::parse(&current).ok_or_else(|| {
                PullEventError::Persistence(format!(
                    "unknown status {current:?} stored for pull event {id}"
                ))
            })?;
            validate_transition(id, current, status)?;

            let update_sql = format!(
                "UPDATE \"{}\".pull_events
                 SET status = $2, updated_at_ms = $3
                 WHERE id = $1 AND status = $4
                 RETURNING {}",
                schema,
                PullEventRow::COLUMNS
            );
            let row = sqlx::query(&update_sql)
                .bind(id)
                .bind(status.as_str())
                .bind(now_ms)
                .bind(current.as_str())
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| map_driver_err("update pull event status", e))?;
            let Some(row) = row else {
                return Err(PullEventError::InvalidTransition {
                    id,
                    from: current,
                    to: status,
                });
            };

            tx.commit()
                .await
                .map_err(|e| map_driver_err("commit set status tx", e))?;
            read_row(&row).into_event()
        })
    }

    fn most_recent_ready(
        &self,
        lineage: Option<&LineageKey>,
    ) -> Result<Option<PullEvent>, PullEventError> {
        self.ensure_schema()?;

        let pool = self.pool()?.clone();
        let rt = self.runtime()?;
        let schema = self.schema.clone();
        let lineage = lineage.cloned();
        rt.block_on(async move {
            let row = match lineage {
                Some(l) => {
                    let sql = format!(
                        "SELECT {} FROM \"{}\".pull_events
                         WHERE provider = $1 AND repository_owner = $2
                           AND repository_name = $3 AND branch = $4 AND status = $5
                         ORDER BY pushed_at_ms DESC, id DESC
                         LIMIT 1",
                        PullEventRow::COLUMNS,
                        schema
                    );
                    sqlx::query(&sql)
                        .bind(&l.provider)
                        .bind(&l.repository_owner)
                        .bind(&l.repository_name)
                        .bind(&l.branch)
                        .bind(PullEventStatus::Ready.as_str())
                        .fetch_optional(&pool)
                        .await
                }
                None => {
                    let sql = format!(
                        "SELECT {} FROM \"{}\".pull_events
                         WHERE status = $1
                         ORDER BY pushed_at_ms DESC, id DESC
                         LIMIT 1",
                        PullEventRow::COLUMNS,
                        schema
                    );
                    sqlx::query(&sql)
                        .bind(PullEventStatus::Ready.as_str())
                        .fetch_optional(&pool)
                        .await
                }
            }
            .map_err(|e| map_driver_err("most recent ready", e))?;
            row.map(|r| read_row(&r).into_event()).transpose()
        })
    }

    fn find_before(
        &self,
        lineage: &LineageKey,
        before: DateTime<Utc>,
        skip: usize,
    ) -> Result<Option<PullEvent>, PullEventError> {
        self.ensure_schema()?;

        let pool = self.pool()?.clone();
        let rt = self.runtime()?;
        let schema = self.schema.clone();
        let lineage = lineage.clone();
        let before_ms = dt_to_ms(before);
        rt.block_on(async move {
            let sql = format!(
                "SELECT {} FROM \"{}\".pull_events
                 WHERE provider = $1 AND repository_owner = $2
                   AND repository_name = $3 AND branch = $4 AND pushed_at_ms < $5
                 ORDER BY pushed_at_ms DESC, id DESC
                 LIMIT 1 OFFSET $6",
                PullEventRow::COLUMNS,
                schema
            );
            let row = sqlx::query(&sql)
                .bind(&lineage.provider)
                .bind(&lineage.repository_owner)
                .bind(&lineage.repository_name)
                .bind(&lineage.branch)
                .bind(before_ms)
                .bind(to_i64(skip))
                .fetch_optional(&pool)
                .await
                .map_err(|e| map_driver_err("find event before", e))?;
            row.map(|r| read_row(&r).into_event()).transpose()
        })
    }

    fn get(&self, id: PullEventId) -> Result<Option<PullEvent>, PullEventError> {
        self.ensure_schema()?;

        let pool = self.pool()?.clone();
        let rt = self.runtime()?;
        let schema = self.schema.clone();
        rt.block_on(async move {
            let sql = format!(
                "SELECT {} FROM \"{}\".pull_events WHERE id = $1",
                PullEventRow::COLUMNS,
                schema
            );
            let row = sqlx::query(&sql)
                .bind(id)
                .fetch_optional(&pool)
                .await
                .map_err(|e| map_driver_err("get pull event", e))?;
            row.map(|r| read_row(&r).into_event()).transpose()
        })
    }

    fn list_lineage(
        &self,
        lineage: &LineageKey,
        limit: usize,
    ) -> Result<Vec<PullEvent>, PullEventError> {
        self.ensure_schema()?;

        let pool = self.pool()?.clone();
        let rt = self.runtime()?;
        let schema = self.schema.clone();
        let lineage = lineage.clone();
        rt.block_on(async move {
            let sql = format!(
                "SELECT {} FROM \"{}\".pull_events
                 WHERE provider = $1 AND repository_owner = $2
                   AND repository_name = $3 AND branch = $4
                 ORDER BY pushed_at_ms DESC, id DESC
                 LIMIT $5",
                PullEventRow::COLUMNS,
                schema
            );
            let rows = sqlx::query(&sql)
                .bind(&lineage.provider)
                .bind(&lineage.repository_owner)
                .bind(&lineage.repository_name)
                .bind(&lineage.branch)
                .bind(to_i64(limit))
                .fetch_all(&pool)
                .await
                .map_err(|e| map_driver_err("list lineage", e))?;
            into_events(rows)
        })
    }

    fn list_stale_running(
        &self,
        updated_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PullEvent>, PullEventError> {
        self.ensure_schema()?;

        let pool = self.pool()?.clone();
        let rt = self.runtime()?;
        let schema = self.schema.clone();
        let updated_before_ms = dt_to_ms(updated_before);
        rt.block_on(async move {
            let sql = format!(
                "SELECT {} FROM \"{}\".pull_events
                 WHERE status = $1 AND updated_at_ms < $2
                 ORDER BY updated_at_ms ASC, id ASC
                 LIMIT $3",
                PullEventRow::COLUMNS,
                schema
            );
            let rows = sqlx::query(&sql)
                .bind(PullEventStatus::Running.as_str())
                .bind(updated_before_ms)
                .bind(to_i64(limit))
                .fetch_all(&pool)
                .await
                .map_err(|e| map_driver_err("list stale running", e))?;
            into_events(rows)
        })
    }
}
