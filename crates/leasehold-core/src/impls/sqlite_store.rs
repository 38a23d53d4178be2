//! SQLite-backed `TaskStore` (sqlx).
//!
//! Several processes can share one database file. Every conditional update
//! is a single `UPDATE tasks SET ... WHERE id = ? AND <expect>`, and SQLite
//! serializes writers, so `rows_affected()` is an honest answer to "did I
//! win?".
//!
//! Storage layout:
//! - timestamps are epoch milliseconds (`INTEGER`)
//! - `dependencies` is a JSON array of ids (`TEXT`)
//! - `seq` is the insertion order, used to break `created_at` ties

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite};
use tracing::info;

use crate::domain::{
    AttemptsExpect, Expect, FieldChange, LeaseExpect, Patch, StoreError, Task, TaskId, TaskStatus,
    WorkerId,
};
use crate::ports::{ListOrder, StatusCounts, TaskStore};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tasks (
    seq          INTEGER PRIMARY KEY AUTOINCREMENT,
    id           TEXT    NOT NULL UNIQUE,
    duration_ms  INTEGER NOT NULL,
    status       TEXT    NOT NULL,
    dependencies TEXT    NOT NULL DEFAULT '[]',
    attempts     INTEGER NOT NULL DEFAULT 0,
    max_attempts INTEGER NOT NULL,
    created_at   INTEGER NOT NULL,
    started_at   INTEGER,
    completed_at INTEGER,
    failed_at    INTEGER,
    run_after    INTEGER,
    last_error   TEXT,
    locked_by    TEXT,
    locked_until INTEGER,
    version      INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks (status);
CREATE INDEX IF NOT EXISTS idx_tasks_created_at ON tasks (created_at);
CREATE INDEX IF NOT EXISTS idx_tasks_lease ON tasks (locked_by, locked_until);
"#;

const COLUMNS: &str = "id, duration_ms, status, dependencies, attempts, max_attempts, \
     created_at, started_at, completed_at, failed_at, run_after, last_error, \
     locked_by, locked_until, version";

pub struct SqliteTaskStore {
    pool: SqlitePool,
}

impl SqliteTaskStore {
    /// Open (creating if missing) the database at `url`, e.g.
    /// `sqlite://tasks.db`, and apply the schema.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        info!(url, "sqlite task store opened");
        Ok(store)
    }

    /// Private in-memory database.
    ///
    /// Each SQLite connection to `:memory:` is its own database, so the pool
    /// is pinned to one long-lived connection.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    async fn fetch_tasks(
        &self,
        mut query: QueryBuilder<'static, Sqlite>,
    ) -> Result<Vec<Task>, StoreError> {
        let rows = query.build().fetch_all(&self.pool).await?;
        rows.iter().map(task_from_row).collect()
    }
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn create(&self, task: Task) -> Result<Task, StoreError> {
        let dependencies = serde_json::to_string(&task.dependencies).map_err(|e| StoreError::Corrupt {
            id: task.id.to_string(),
            reason: e.to_string(),
        })?;

        let mut query = QueryBuilder::<Sqlite>::new(format!("INSERT INTO tasks ({COLUMNS}) VALUES ("));
        let mut values = query.separated(", ");
        values
            .push_bind(task.id.to_string())
            .push_bind(millis_of_duration(task.duration))
            .push_bind(task.status.as_str())
            .push_bind(dependencies)
            .push_bind(i64::from(task.attempts))
            .push_bind(i64::from(task.max_attempts))
            .push_bind(task.created_at.timestamp_millis())
            .push_bind(task.started_at.map(|t| t.timestamp_millis()))
            .push_bind(task.completed_at.map(|t| t.timestamp_millis()))
            .push_bind(task.failed_at.map(|t| t.timestamp_millis()))
            .push_bind(task.run_after.map(|t| t.timestamp_millis()))
            .push_bind(task.last_error.clone())
            .push_bind(task.locked_by.as_ref().map(|w| w.to_string()))
            .push_bind(task.locked_until.map(|t| t.timestamp_millis()))
            .push_bind(version_to_i64(task.version));
        query.push(")");

        match query.build().execute(&self.pool).await {
            Ok(_) => Ok(task),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(StoreError::DuplicateId(task.id))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, id: &TaskId) -> Result<Option<Task>, StoreError> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM tasks WHERE id = ?"))
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(task_from_row).transpose()
    }

    async fn list(&self, order: ListOrder, limit: usize) -> Result<Vec<Task>, StoreError> {
        let direction = match order {
            ListOrder::CreatedAsc => "ASC",
            ListOrder::CreatedDesc => "DESC",
        };
        let mut query = QueryBuilder::new(format!(
            "SELECT {COLUMNS} FROM tasks ORDER BY created_at {direction}, seq {direction} LIMIT "
        ));
        query.push_bind(limit_to_i64(limit));
        self.fetch_tasks(query).await
    }

    async fn list_by_status(
        &self,
        status: TaskStatus,
        limit: usize,
    ) -> Result<Vec<Task>, StoreError> {
        let mut query = QueryBuilder::new(format!("SELECT {COLUMNS} FROM tasks WHERE status = "));
        query
            .push_bind(status.as_str())
            .push(" ORDER BY created_at ASC, seq ASC LIMIT ")
            .push_bind(limit_to_i64(limit));
        self.fetch_tasks(query).await
    }

    async fn conditional_update(
        &self,
        id: &TaskId,
        expect: &Expect,
        patch: &Patch,
    ) -> Result<u64, StoreError> {
        let mut query = QueryBuilder::new("UPDATE tasks SET ");
        push_patch(&mut query, patch);
        query.push(" WHERE id = ").push_bind(id.to_string());
        push_expect(&mut query, expect);
        let result = query.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn update_matching(&self, expect: &Expect, patch: &Patch) -> Result<u64, StoreError> {
        let mut query = QueryBuilder::new("UPDATE tasks SET ");
        push_patch(&mut query, patch);
        query.push(" WHERE 1 = 1");
        push_expect(&mut query, expect);
        let result = query.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn query_ready(
        &self,
        worker: &WorkerId,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Task>, StoreError> {
        let mut query = QueryBuilder::new(format!("SELECT {COLUMNS} FROM tasks WHERE 1 = 1"));
        let expect = Expect::status_in(&[TaskStatus::Queued, TaskStatus::Pending]).lease(
            LeaseExpect::Available {
                worker: worker.clone(),
                now,
            },
        );
        push_expect(&mut query, &expect);
        query
            .push(" AND (run_after IS NULL OR run_after <= ")
            .push_bind(now.timestamp_millis())
            .push(")")
            .push(" ORDER BY CASE status WHEN 'QUEUED' THEN 1 WHEN 'PENDING' THEN 2 ELSE 3 END,")
            .push(" created_at ASC, seq ASC LIMIT ")
            .push_bind(limit_to_i64(limit));
        self.fetch_tasks(query).await
    }

    async fn counts_by_status(&self) -> Result<StatusCounts, StoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM tasks GROUP BY status")
            .fetch_all(&self.pool)
            .await?;
        let mut counts = StatusCounts::default();
        for row in rows {
            let status: String = row.try_get("status")?;
            let n: i64 = row.try_get("n")?;
            let status = status.parse::<TaskStatus>().map_err(|e| StoreError::Corrupt {
                id: "<counts>".to_string(),
                reason: e.to_string(),
            })?;
            counts.add(status, usize::try_from(n).unwrap_or(0));
        }
        Ok(counts)
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

// ========================================
// Expect / Patch -> SQL
// ========================================

fn push_expect(query: &mut QueryBuilder<'static, Sqlite>, expect: &Expect) {
    if !expect.status_in.is_empty() {
        query.push(" AND status IN (");
        let mut statuses = query.separated(", ");
        for status in &expect.status_in {
            statuses.push_bind(status.as_str());
        }
        query.push(")");
    }

    match &expect.lease {
        LeaseExpect::Any => {}
        LeaseExpect::Available { worker, now } => {
            query
                .push(" AND (locked_by IS NULL OR locked_by = ")
                .push_bind(worker.to_string())
                .push(" OR locked_until IS NULL OR locked_until < ")
                .push_bind(now.timestamp_millis())
                .push(")");
        }
        LeaseExpect::HeldBy(worker) => {
            query.push(" AND locked_by = ").push_bind(worker.to_string());
        }
        LeaseExpect::HeldByOrFree(worker) => {
            query
                .push(" AND (locked_by IS NULL OR locked_by = ")
                .push_bind(worker.to_string())
                .push(")");
        }
        LeaseExpect::Stale { now } => {
            query
                .push(" AND (locked_by IS NULL OR locked_until IS NULL OR locked_until < ")
                .push_bind(now.timestamp_millis())
                .push(")");
        }
        LeaseExpect::Expired { now } => {
            query
                .push(" AND locked_by IS NOT NULL AND locked_until < ")
                .push_bind(now.timestamp_millis());
        }
    }

    match expect.attempts {
        Some(AttemptsExpect::Remaining) => {
            query.push(" AND attempts < max_attempts");
        }
        Some(AttemptsExpect::Exhausted) => {
            query.push(" AND attempts >= max_attempts");
        }
        None => {}
    }

    if let Some(version) = expect.version {
        query.push(" AND version = ").push_bind(version_to_i64(version));
    }
}

fn push_patch(query: &mut QueryBuilder<'static, Sqlite>, patch: &Patch) {
    // version は常に進める。SET 句が空にならない保証も兼ねる
    let mut sets = query.separated(", ");
    sets.push("version = version + 1");

    if let Some(status) = patch.status {
        sets.push("status = ").push_bind_unseparated(status.as_str());
    }
    if patch.increment_attempts {
        sets.push("attempts = attempts + 1");
    }
    if let Some(at) = patch.started_at_if_unset {
        sets.push("started_at = COALESCE(started_at, ")
            .push_bind_unseparated(at.timestamp_millis())
            .push_unseparated(")");
    }
    if let Some(at) = patch.completed_at {
        sets.push("completed_at = ").push_bind_unseparated(at.timestamp_millis());
    }
    if let Some(at) = patch.failed_at {
        sets.push("failed_at = ").push_bind_unseparated(at.timestamp_millis());
    }
    match &patch.run_after {
        FieldChange::Keep => {}
        FieldChange::Set(at) => {
            sets.push("run_after = ").push_bind_unseparated(at.timestamp_millis());
        }
        FieldChange::Clear => {
            sets.push("run_after = NULL");
        }
    }
    match &patch.last_error {
        FieldChange::Keep => {}
        FieldChange::Set(error) => {
            sets.push("last_error = ").push_bind_unseparated(error.clone());
        }
        FieldChange::Clear => {
            sets.push("last_error = NULL");
        }
    }
    match &patch.lease {
        FieldChange::Keep => {}
        FieldChange::Set(lease) => {
            sets.push("locked_by = ").push_bind_unseparated(lease.holder.to_string());
            sets.push("locked_until = ")
                .push_bind_unseparated(lease.expires_at.timestamp_millis());
        }
        FieldChange::Clear => {
            sets.push("locked_by = NULL");
            sets.push("locked_until = NULL");
        }
    }
}

// ========================================
// Row mapping
// ========================================

fn task_from_row(row: &SqliteRow) -> Result<Task, StoreError> {
    let id: String = row.try_get("id")?;
    let corrupt = |reason: String| StoreError::Corrupt {
        id: id.clone(),
        reason,
    };

    let status: String = row.try_get("status")?;
    let status = status.parse::<TaskStatus>().map_err(|e| corrupt(e.to_string()))?;

    let dependencies: String = row.try_get("dependencies")?;
    let dependencies: Vec<TaskId> =
        serde_json::from_str(&dependencies).map_err(|e| corrupt(format!("dependencies: {e}")))?;

    let duration_ms: i64 = row.try_get("duration_ms")?;
    let attempts: i64 = row.try_get("attempts")?;
    let max_attempts: i64 = row.try_get("max_attempts")?;
    let version: i64 = row.try_get("version")?;

    let timestamp = |column: &str| -> Result<Option<DateTime<Utc>>, StoreError> {
        let millis: Option<i64> = row.try_get(column)?;
        millis
            .map(|ms| {
                DateTime::from_timestamp_millis(ms)
                    .ok_or_else(|| corrupt(format!("{column} out of range: {ms}")))
            })
            .transpose()
    };

    let created_at = timestamp("created_at")?.ok_or_else(|| corrupt("created_at is null".to_string()))?;
    let locked_by: Option<String> = row.try_get("locked_by")?;

    Ok(Task {
        duration: Duration::from_millis(u64::try_from(duration_ms).unwrap_or(0)),
        status,
        dependencies,
        attempts: u32::try_from(attempts).map_err(|e| corrupt(format!("attempts: {e}")))?,
        max_attempts: u32::try_from(max_attempts)
            .map_err(|e| corrupt(format!("max_attempts: {e}")))?,
        created_at,
        started_at: timestamp("started_at")?,
        completed_at: timestamp("completed_at")?,
        failed_at: timestamp("failed_at")?,
        run_after: timestamp("run_after")?,
        last_error: row.try_get("last_error")?,
        locked_by: locked_by.map(WorkerId::new),
        locked_until: timestamp("locked_until")?,
        version: u64::try_from(version).map_err(|e| corrupt(format!("version: {e}")))?,
        id: TaskId::new(id.clone()),
    })
}

fn millis_of_duration(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

fn limit_to_i64(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn version_to_i64(version: u64) -> i64 {
    i64::try_from(version).unwrap_or(i64::MAX)
}
