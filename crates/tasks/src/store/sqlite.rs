//! SQLite task store.
//!
//! One database file with two tables:
//! - `tasks`: one row per detected task, `ticket_id` and
//!   `source_message_id` both unique
//! - `ticket_counter`: a single row holding the last issued sequence number
//!
//! The counter increment is a single `UPDATE … RETURNING` statement, so two
//! callers can never observe the same value.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use taskmind_core::error::StoreError;
use taskmind_core::message::UserId;
use taskmind_core::task::{Priority, Task, TaskStatus, TaskStore, UpsertOutcome};
use tracing::{debug, info};

/// SQLite result codes for a locked database (`SQLITE_BUSY`, `SQLITE_LOCKED`)
/// and their extended variants.
const BUSY_CODES: &[&str] = &["5", "6", "261", "262", "517"];

pub struct SqliteTaskStore {
    pool: SqlitePool,
}

impl SqliteTaskStore {
    /// Open (creating if needed) the database at `path`.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Unavailable(format!("{}: {e}", parent.display())))?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_millis(250));
        let store = Self::connect(options, 4).await?;
        info!("SQLite task store initialized at {}", path.display());
        Ok(store)
    }

    /// Ephemeral database for tests. A single connection, since each
    /// `:memory:` connection would otherwise see its own database.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(":memory:")
            .map_err(|e| StoreError::Storage(format!("Invalid SQLite options: {e}")))?;
        Self::connect(options, 1).await
    }

    async fn connect(options: SqliteConnectOptions, max_connections: u32) -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Unavailable(format!("Failed to open SQLite: {e}")))?;
        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id                TEXT PRIMARY KEY,
                ticket_id         TEXT UNIQUE NOT NULL,
                title             TEXT NOT NULL,
                description       TEXT NOT NULL DEFAULT '',
                due_date          TEXT,
                priority          TEXT NOT NULL,
                status            TEXT NOT NULL,
                owner             TEXT NOT NULL,
                source_message_id TEXT UNIQUE NOT NULL,
                created_at        TEXT NOT NULL,
                updated_at        TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::MigrationFailed(format!("tasks table: {e}")))?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_owner_status ON tasks(owner, status)")
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::MigrationFailed(format!("owner index: {e}")))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ticket_counter (
                id         INTEGER PRIMARY KEY CHECK (id = 1),
                last_value INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::MigrationFailed(format!("ticket_counter table: {e}")))?;

        sqlx::query("INSERT OR IGNORE INTO ticket_counter (id, last_value) VALUES (1, 0)")
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::MigrationFailed(format!("ticket_counter row: {e}")))?;

        debug!("SQLite migrations complete");
        Ok(())
    }

    /// Move the counter forward to at least `last_issued`. Never moves it back.
    pub async fn seed_sequence(&self, last_issued: u64) -> Result<u64, StoreError> {
        let row = sqlx::query(
            "UPDATE ticket_counter SET last_value = MAX(last_value, ?1) WHERE id = 1 RETURNING last_value",
        )
        .bind(last_issued as i64)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| classify("seed counter", e))?;
        read_sequence(&row)
    }

    fn row_to_task(row: &sqlx::sqlite::SqliteRow) -> Result<Task, StoreError> {
        let column = |name: &str, e: sqlx::Error| StoreError::Storage(format!("{name} column: {e}"));
        let get = |name: &str| -> Result<String, StoreError> {
            row.try_get::<String, _>(name).map_err(|e| column(name, e))
        };

        let due_date: Option<String> = row.try_get("due_date").map_err(|e| column("due_date", e))?;
        let due_date = due_date
            .map(|s| {
                NaiveDate::parse_from_str(&s, "%Y-%m-%d")
                    .map_err(|e| StoreError::Storage(format!("due_date {s:?}: {e}")))
            })
            .transpose()?;
        let priority = get("priority")?;
        let status = get("status")?;

        Ok(Task {
            id: get("id")?,
            ticket_id: get("ticket_id")?,
            title: get("title")?,
            description: get("description")?,
            due_date,
            priority: Priority::parse(&priority)
                .ok_or_else(|| StoreError::Storage(format!("unknown priority {priority:?}")))?,
            status: TaskStatus::parse(&status)
                .ok_or_else(|| StoreError::Storage(format!("unknown status {status:?}")))?,
            owner: UserId(get("owner")?),
            source_message_id: get("source_message_id")?,
            created_at: parse_timestamp(&get("created_at")?)?,
            updated_at: parse_timestamp(&get("updated_at")?)?,
        })
    }
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Storage(format!("timestamp {s:?}: {e}")))
}

fn read_sequence(row: &sqlx::sqlite::SqliteRow) -> Result<u64, StoreError> {
    let value: i64 = row
        .try_get("last_value")
        .map_err(|e| StoreError::Storage(format!("last_value column: {e}")))?;
    u64::try_from(value).map_err(|_| StoreError::Storage(format!("negative counter {value}")))
}

/// Map a driver error onto the store taxonomy.
fn classify(context: &str, e: sqlx::Error) -> StoreError {
    match &e {
        sqlx::Error::Database(db)
            if db.code().is_some_and(|c| BUSY_CODES.contains(&c.as_ref()))
                || db.message().contains("database is locked") =>
        {
            StoreError::Conflict(format!("{context}: {e}"))
        }
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            StoreError::Unavailable(format!("{context}: {e}"))
        }
        _ => StoreError::Storage(format!("{context}: {e}")),
    }
}

const SELECT_TASK: &str = "SELECT id, ticket_id, title, description, due_date, priority, status, \
                           owner, source_message_id, created_at, updated_at FROM tasks";

#[async_trait]
impl TaskStore for SqliteTaskStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn upsert_task(&self, task: Task) -> Result<UpsertOutcome, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO tasks (id, ticket_id, title, description, due_date, priority, status,
                               owner, source_message_id, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ON CONFLICT(source_message_id) DO NOTHING
            "#,
        )
        .bind(&task.id)
        .bind(&task.ticket_id)
        .bind(&task.title)
        .bind(&task.description)
        .bind(task.due_date.map(|d| d.format("%Y-%m-%d").to_string()))
        .bind(task.priority.as_str())
        .bind(task.status.as_str())
        .bind(task.owner.as_str())
        .bind(&task.source_message_id)
        .bind(task.created_at.to_rfc3339())
        .bind(task.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| classify("INSERT task", e))?;

        if result.rows_affected() == 1 {
            debug!(ticket = %task.ticket_id, source = %task.source_message_id, "Task inserted");
            return Ok(UpsertOutcome {
                task,
                inserted: true,
            });
        }

        let existing = self
            .find_by_source(&task.source_message_id)
            .await?
            .ok_or_else(|| StoreError::Storage(format!("task for {} vanished", task.source_message_id)))?;
        debug!(ticket = %existing.ticket_id, source = %existing.source_message_id, "Task already exists");
        Ok(UpsertOutcome {
            task: existing,
            inserted: false,
        })
    }

    async fn get_next_sequence(&self) -> Result<u64, StoreError> {
        let row = sqlx::query(
            "UPDATE ticket_counter SET last_value = last_value + 1 WHERE id = 1 RETURNING last_value",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|e| classify("increment counter", e))?;
        read_sequence(&row)
    }

    async fn current_sequence(&self) -> Result<u64, StoreError> {
        let row = sqlx::query("SELECT last_value FROM ticket_counter WHERE id = 1")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| classify("read counter", e))?;
        read_sequence(&row)
    }

    async fn find_by_source(&self, source_message_id: &str) -> Result<Option<Task>, StoreError> {
        let row = sqlx::query(&format!("{SELECT_TASK} WHERE source_message_id = ?1"))
            .bind(source_message_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| classify("find by source", e))?;
        row.as_ref().map(Self::row_to_task).transpose()
    }

    async fn get_by_ticket(&self, ticket_id: &str) -> Result<Option<Task>, StoreError> {
        let row = sqlx::query(&format!("{SELECT_TASK} WHERE ticket_id = ?1"))
            .bind(ticket_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| classify("get by ticket", e))?;
        row.as_ref().map(Self::row_to_task).transpose()
    }

    async fn list_tasks(
        &self,
        owner: &UserId,
        status: Option<TaskStatus>,
    ) -> Result<Vec<Task>, StoreError> {
        let rows = match status {
            Some(status) => {
                sqlx::query(&format!("{SELECT_TASK} WHERE owner = ?1 AND status = ?2"))
                    .bind(owner.as_str())
                    .bind(status.as_str())
                    .fetch_all(&self.pool)
                    .await
            }
            None => {
                sqlx::query(&format!("{SELECT_TASK} WHERE owner = ?1"))
                    .bind(owner.as_str())
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(|e| classify("list tasks", e))?;

        let mut tasks = rows.iter().map(Self::row_to_task).collect::<Result<Vec<_>, _>>()?;
        tasks.sort_by(Task::listing_order);
        Ok(tasks)
    }

    async fn update_status(&self, ticket_id: &str, status: TaskStatus) -> Result<Task, StoreError> {
        let result = sqlx::query("UPDATE tasks SET status = ?1, updated_at = ?2 WHERE ticket_id = ?3")
            .bind(status.as_str())
            .bind(Utc::now().to_rfc3339())
            .bind(ticket_id)
            .execute(&self.pool)
            .await
            .map_err(|e| classify("update status", e))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("ticket {ticket_id}")));
        }
        self.get_by_ticket(ticket_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("ticket {ticket_id}")))
    }

    async fn delete_owner(&self, owner: &UserId) -> Result<usize, StoreError> {
        let result = sqlx::query("DELETE FROM tasks WHERE owner = ?1")
            .bind(owner.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| classify("delete owner", e))?;
        let removed = result.rows_affected() as usize;
        info!(owner = %owner, removed, "Deleted tasks");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn task(ticket: &str, source: &str) -> Task {
        Task::new(ticket, UserId::from("alice"), source, format!("task {ticket}"), "details")
    }

    #[tokio::test]
    async fn roundtrips_every_field() {
        let store = SqliteTaskStore::in_memory().await.unwrap();
        let mut t = task("000001", "msg-1");
        t.priority = Priority::High;
        t.due_date = NaiveDate::from_ymd_opt(2026, 3, 6);
        store.upsert_task(t.clone()).await.unwrap();

        let loaded = store.get_by_ticket("000001").await.unwrap().unwrap();
        assert_eq!(loaded.id, t.id);
        assert_eq!(loaded.priority, Priority::High);
        assert_eq!(loaded.due_date, t.due_date);
        assert_eq!(loaded.status, TaskStatus::Open);
        assert_eq!(loaded.owner, t.owner);
        assert_eq!(loaded.created_at.timestamp_millis(), t.created_at.timestamp_millis());
    }

    #[tokio::test]
    async fn duplicate_source_keeps_first_task() {
        let store = SqliteTaskStore::in_memory().await.unwrap();
        assert!(store.upsert_task(task("000001", "msg-1")).await.unwrap().inserted);

        let replay = store.upsert_task(task("000002", "msg-1")).await.unwrap();
        assert!(!replay.inserted);
        assert_eq!(replay.task.ticket_id, "000001");
        assert!(store.get_by_ticket("000002").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_ticket_is_rejected() {
        let store = SqliteTaskStore::in_memory().await.unwrap();
        store.upsert_task(task("000001", "msg-1")).await.unwrap();
        assert!(store.upsert_task(task("000001", "msg-2")).await.is_err());
    }

    #[tokio::test]
    async fn counter_is_monotonic_and_seedable() {
        let store = SqliteTaskStore::in_memory().await.unwrap();
        assert_eq!(store.current_sequence().await.unwrap(), 0);
        assert_eq!(store.get_next_sequence().await.unwrap(), 1);
        assert_eq!(store.seed_sequence(42).await.unwrap(), 42);
        // Seeding backwards is ignored
        assert_eq!(store.seed_sequence(10).await.unwrap(), 42);
        assert_eq!(store.get_next_sequence().await.unwrap(), 43);
    }

    #[tokio::test]
    async fn concurrent_increments_on_disk_are_unique() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteTaskStore::open(&dir.path().join("tasks.sqlite")).await.unwrap());
        let handles: Vec<_> = (0..40)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move {
                    loop {
                        match store.get_next_sequence().await {
                            Ok(n) => return n,
                            Err(StoreError::Conflict(_)) => tokio::task::yield_now().await,
                            Err(e) => panic!("{e}"),
                        }
                    }
                })
            })
            .collect();
        let mut seen = HashSet::new();
        for h in handles {
            assert!(seen.insert(h.await.unwrap()));
        }
        assert_eq!(seen.len(), 40);
        assert_eq!(store.current_sequence().await.unwrap(), 40);
    }

    #[tokio::test]
    async fn data_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("tasks.sqlite");
        {
            let store = SqliteTaskStore::open(&path).await.unwrap();
            store.get_next_sequence().await.unwrap();
            store.upsert_task(task("000001", "msg-1")).await.unwrap();
        }
        let store = SqliteTaskStore::open(&path).await.unwrap();
        assert_eq!(store.current_sequence().await.unwrap(), 1);
        assert!(store.find_by_source("msg-1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn listing_filters_and_orders() {
        let store = SqliteTaskStore::in_memory().await.unwrap();
        let alice = UserId::from("alice");
        let mut low = task("000001", "m1");
        low.priority = Priority::Low;
        let mut high = task("000002", "m2");
        high.priority = Priority::High;
        let mut other = task("000003", "m3");
        other.owner = UserId::from("bob");
        for t in [low, high, other] {
            store.upsert_task(t).await.unwrap();
        }

        let all = store.list_tasks(&alice, None).await.unwrap();
        let tickets: Vec<_> = all.iter().map(|t| t.ticket_id.as_str()).collect();
        assert_eq!(tickets, vec!["000002", "000001"]);

        store.update_status("000002", TaskStatus::Done).await.unwrap();
        let open = store.list_tasks(&alice, Some(TaskStatus::Open)).await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(store.next_task(&alice).await.unwrap().unwrap().ticket_id, "000001");

        assert!(matches!(
            store.update_status("424242", TaskStatus::Done).await,
            Err(StoreError::NotFound(_))
        ));
        assert_eq!(store.delete_owner(&alice).await.unwrap(), 2);
        assert_eq!(store.list_tasks(&UserId::from("bob"), None).await.unwrap().len(), 1);
    }
}
