//! SQLite-backed pull event ledger.
//!
//! This module is feature-gated behind `sqlite-persistence`.

#![cfg(feature = "sqlite-persistence")]

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::{map_driver_err, PullEventError};

use super::models::{LineageKey, NewPullEvent, PullEvent, PullEventId};
use super::repository::{dt_to_ms, PullEventRepository, PullEventRow};
use super::status::{validate_transition, PullEventStatus};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS pull_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    provider TEXT NOT NULL,
    repository_owner TEXT NOT NULL,
    repository_name TEXT NOT NULL,
    branch TEXT NOT NULL,
    commit_sha TEXT NOT NULL,
    status TEXT NOT NULL,
    pushed_at_ms INTEGER NOT NULL,
    created_at_ms INTEGER NOT NULL,
    updated_at_ms INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_pull_events_lineage_pushed
    ON pull_events(provider, repository_owner, repository_name, branch, pushed_at_ms DESC, id DESC);
CREATE INDEX IF NOT EXISTS idx_pull_events_status_pushed
    ON pull_events(status, pushed_at_ms DESC);
CREATE INDEX IF NOT EXISTS idx_pull_events_status_updated
    ON pull_events(status, updated_at_ms);
";

const LINEAGE_FILTER: &str =
    "provider = ?1 AND repository_owner = ?2 AND repository_name = ?3 AND branch = ?4";

fn read_row(row: &Row<'_>) -> rusqlite::Result<PullEventRow> {
    Ok(PullEventRow {
        id: row.get(0)?,
        provider: row.get(1)?,
        repository_owner: row.get(2)?,
        repository_name: row.get(3)?,
        branch: row.get(4)?,
        commit: row.get(5)?,
        status: row.get(6)?,
        pushed_at_ms: row.get(7)?,
        created_at_ms: row.get(8)?,
        updated_at_ms: row.get(9)?,
    })
}

fn to_i64(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

pub struct SqlitePullEventRepository {
    conn: Mutex<Connection>,
}

impl SqlitePullEventRepository {
    /// Opens (or creates) the ledger at `path`. `":memory:"` gives a private
    /// in-process database.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, PullEventError> {
        let conn = Connection::open(path).map_err(|e| map_driver_err("open sqlite ledger", e))?;
        Self::with_connection(conn)
    }

    pub fn with_connection(conn: Connection) -> Result<Self, PullEventError> {
        conn.busy_timeout(std::time::Duration::from_millis(5_000))
            .map_err(|e| map_driver_err("configure sqlite busy timeout", e))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| map_driver_err("schema bootstrap", e))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, PullEventError> {
        self.conn
            .lock()
            .map_err(|e| PullEventError::Persistence(format!("sqlite lock poisoned: {e}")))
    }

    fn fetch_by_id(conn: &Connection, id: PullEventId) -> Result<Option<PullEvent>, PullEventError> {
        let sql = format!("SELECT {} FROM pull_events WHERE id = ?1", PullEventRow::COLUMNS);
        conn.query_row(&sql, params![id], read_row)
            .optional()
            .map_err(|e| map_driver_err("get pull event", e))?
            .map(PullEventRow::into_event)
            .transpose()
    }

    fn fetch_many(
        &self,
        label: &str,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<PullEvent>, PullEventError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql).map_err(|e| map_driver_err(label, e))?;
        let rows = stmt
            .query_map(params, read_row)
            .map_err(|e| map_driver_err(label, e))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| map_driver_err(label, e))?;
        rows.into_iter().map(PullEventRow::into_event).collect()
    }
}

impl PullEventRepository for SqlitePullEventRepository {
    fn append(&self, event: &NewPullEvent) -> Result<PullEvent, PullEventError> {
        let conn = self.conn()?;
        let now_ms = dt_to_ms(Utc::now());
        let lineage = event.lineage();
        conn.execute(
            "INSERT INTO pull_events
             (provider, repository_owner, repository_name, branch, commit_sha, status,
              pushed_at_ms, created_at_ms, updated_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
            params![
                lineage.provider,
                lineage.repository_owner,
                lineage.repository_name,
                lineage.branch,
                event.commit(),
                PullEventStatus::Pending.as_str(),
                dt_to_ms(event.pushed_at()),
                now_ms,
            ],
        )
        .map_err(|e| map_driver_err("append pull event", e))?;
        let id = conn.last_insert_rowid();
        Self::fetch_by_id(&conn, id)?
            .ok_or_else(|| PullEventError::Persistence(format!("appended pull event {id} vanished")))
    }

    fn set_status(
        &self,
        id: PullEventId,
        status: PullEventStatus,
    ) -> Result<PullEvent, PullEventError> {
        let conn = self.conn()?;
        let current = Self::fetch_by_id(&conn, id)?.ok_or(PullEventError::NotFound(id))?;
        validate_transition(id, current.status, status)?;

        // Another process may share the file; keep the write conditional.
        let updated = conn
            .execute(
                "UPDATE pull_events SET status = ?1, updated_at_ms = ?2
                 WHERE id = ?3 AND status = ?4",
                params![
                    status.as_str(),
                    dt_to_ms(Utc::now()),
                    id,
                    current.status.as_str()
                ],
            )
            .map_err(|e| map_driver_err("update pull event status", e))?;
        if updated == 0 {
            let actual = Self::fetch_by_id(&conn, id)?.ok_or(PullEventError::NotFound(id))?;
            return Err(PullEventError::InvalidTransition {
                id,
                from: actual.status,
                to: status,
            });
        }
        Self::fetch_by_id(&conn, id)?.ok_or(PullEventError::NotFound(id))
    }

    fn most_recent_ready(
        &self,
        lineage: Option<&LineageKey>,
    ) -> Result<Option<PullEvent>, PullEventError> {
        let ready = PullEventStatus::Ready.as_str();
        let rows = match lineage {
            Some(l) => {
                let sql = format!(
                    "SELECT {} FROM pull_events
                     WHERE {LINEAGE_FILTER} AND status = ?5
                     ORDER BY pushed_at_ms DESC, id DESC LIMIT 1",
                    PullEventRow::COLUMNS
                );
                self.fetch_many(
                    "most recent ready",
                    &sql,
                    params![
                        l.provider,
                        l.repository_owner,
                        l.repository_name,
                        l.branch,
                        ready
                    ],
                )?
            }
            None => {
                let sql = format!(
                    "SELECT {} FROM pull_events WHERE status = ?1
                     ORDER BY pushed_at_ms DESC, id DESC LIMIT 1",
                    PullEventRow::COLUMNS
                );
                self.fetch_many("most recent ready", &sql, params![ready])?
            }
        };
        Ok(rows.into_iter().next())
    }

    fn find_before(
        &self,
        lineage: &LineageKey,
        before: DateTime<Utc>,
        skip: usize,
    ) -> Result<Option<PullEvent>, PullEventError> {
        let sql = format!(
            "SELECT {} FROM pull_events
             WHERE {LINEAGE_FILTER} AND pushed_at_ms < ?5
             ORDER BY pushed_at_ms DESC, id DESC LIMIT 1 OFFSET ?6",
            PullEventRow::COLUMNS
        );
        let rows = self.fetch_many(
            "find event before",
            &sql,
            params![
                lineage.provider,
                lineage.repository_owner,
                lineage.repository_name,
                lineage.branch,
                dt_to_ms(before),
                to_i64(skip)
            ],
        )?;
        Ok(rows.into_iter().next())
    }

    fn get(&self, id: PullEventId) -> Result<Option<PullEvent>, PullEventError> {
        let conn = self.conn()?;
        Self::fetch_by_id(&conn, id)
    }

    fn list_lineage(
        &self,
        lineage: &LineageKey,
        limit: usize,
    ) -> Result<Vec<PullEvent>, PullEventError> {
        let sql = format!(
            "SELECT {} FROM pull_events
             WHERE {LINEAGE_FILTER}
             ORDER BY pushed_at_ms DESC, id DESC LIMIT ?5",
            PullEventRow::COLUMNS
        );
        self.fetch_many(
            "list lineage",
            &sql,
            params![
                lineage.provider,
                lineage.repository_owner,
                lineage.repository_name,
                lineage.branch,
                to_i64(limit)
            ],
        )
    }

    fn list_stale_running(
        &self,
        updated_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PullEvent>, PullEventError> {
        let sql = format!(
            "SELECT {} FROM pull_events
             WHERE status = ?1 AND updated_at_ms < ?2
             ORDER BY updated_at_ms ASC, id ASC LIMIT ?3",
            PullEventRow::COLUMNS
        );
        self.fetch_many(
            "list stale running",
            &sql,
            params![
                PullEventStatus::Running.as_str(),
                dt_to_ms(updated_before),
                to_i64(limit)
            ],
        )
    }
}
