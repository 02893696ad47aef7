//! SQLite alarm store
//!
//! Records and notes live in two tables. Identifiers are stored as hyphenated
//! text and timestamps as Unix milliseconds so ordering matches the memory
//! backend exactly.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    QueryBuilder, Row, Sqlite, SqlitePool,
};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use crate::cursor::{AlarmCursor, Cursor, NoteCursor};
use crate::error::{Result, StoreError};
use crate::query::{AckFilter, AlarmFilter, AlarmQuery, OpenFilter};
use crate::record::{now_millis, AlarmRecord, AlarmState, Handle, Note};
use crate::traits::AlarmStore;

const RECORD_COLUMNS: &str = "uuid, source_path, alarm_class, alarm_watch, created_time, \
     alarm_type, normal_time, ack_time, ack_user, message, ack_required";

const OPEN_CONDITION: &str = "(normal_time IS NULL OR (ack_required = 1 AND ack_time IS NULL))";

/// SQLite-backed alarm store
pub struct SqliteAlarmStore {
    pool: SqlitePool,
    url: String,
    external_access: AtomicBool,
}

impl SqliteAlarmStore {
    /// Open a pool for `url` (`sqlite://path/to/alarms.db` or `sqlite::memory:`).
    ///
    /// The pool holds a single long-lived connection so an in-memory database
    /// survives for the life of the store and locking pragmas apply to every
    /// statement.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        Ok(Self {
            pool,
            url: url.to_string(),
            external_access: AtomicBool::new(false),
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn apply_locking_mode(&self, external: bool) -> Result<()> {
        let mode = if external { "NORMAL" } else { "EXCLUSIVE" };
        sqlx::query(&format!("PRAGMA locking_mode = {}", mode))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn record_exists(&self, uuid: Uuid) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM alarm_records WHERE uuid = ?")
            .bind(uuid.to_string())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }
}

fn to_millis(time: DateTime<Utc>) -> i64 {
    time.timestamp_millis()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StoreError::Serialization(format!("timestamp out of range: {}", ms)))
}

fn parse_uuid(text: &str) -> Result<Uuid> {
    Uuid::parse_str(text).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn hydrate_record(row: SqliteRow) -> Result<AlarmRecord> {
    let uuid: String = row.try_get("uuid")?;
    let alarm_class: Option<i64> = row.try_get("alarm_class")?;
    let alarm_watch: Option<i64> = row.try_get("alarm_watch")?;
    let created_time: i64 = row.try_get("created_time")?;
    let alarm_type: String = row.try_get("alarm_type")?;
    let normal_time: Option<i64> = row.try_get("normal_time")?;
    let ack_time: Option<i64> = row.try_get("ack_time")?;
    let ack_user: Option<String> = row.try_get("ack_user")?;
    let ack_required: bool = row.try_get("ack_required")?;

    let mut builder = AlarmRecord::builder()
        .uuid(parse_uuid(&uuid)?)
        .source_path(row.try_get::<String, _>("source_path")?)
        .alarm_class(alarm_class.map(|h| Handle(h as u32)))
        .alarm_watch(alarm_watch.map(|h| Handle(h as u32)))
        .created_time(from_millis(created_time)?)
        .alarm_type(
            alarm_type
                .parse::<AlarmState>()
                .map_err(|e| StoreError::Serialization(e.to_string()))?,
        )
        .normal_time(normal_time.map(from_millis).transpose()?)
        .message(row.try_get::<String, _>("message")?)
        .ack_required(ack_required);
    if let Some(ms) = ack_time {
        builder = builder.acknowledged(ack_user.unwrap_or_default(), from_millis(ms)?);
    }
    builder.build()
}

fn push_filters(qb: &mut QueryBuilder<'_, Sqlite>, query: &AlarmQuery) {
    if let Some(class) = query.alarm_class {
        qb.push(" AND alarm_class = ").push_bind(i64::from(class.0));
    }
    if let Some(from) = query.from {
        qb.push(" AND created_time >= ").push_bind(to_millis(from));
    }
    if let Some(to) = query.to {
        qb.push(" AND created_time < ").push_bind(to_millis(to));
    }
    match query.ack {
        AckFilter::Any => {}
        AckFilter::Acked => {
            qb.push(" AND ack_time IS NOT NULL");
        }
        AckFilter::Unacked => {
            qb.push(" AND ack_time IS NULL");
        }
    }
    match query.alarm {
        AlarmFilter::Any => {}
        AlarmFilter::Normal => {
            qb.push(" AND normal_time IS NOT NULL");
        }
        AlarmFilter::Alarm => {
            qb.push(" AND normal_time IS NULL");
        }
        AlarmFilter::Only(state) => {
            qb.push(" AND normal_time IS NULL AND alarm_type = ")
                .push_bind(state.as_str());
        }
    }
    match query.open {
        OpenFilter::Any => {}
        OpenFilter::Open => {
            qb.push(" AND ").push(OPEN_CONDITION);
        }
        OpenFilter::Closed => {
            qb.push(" AND NOT ").push(OPEN_CONDITION);
        }
    }
}

#[async_trait]
impl AlarmStore for SqliteAlarmStore {
    async fn start(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS alarm_records (
                uuid TEXT PRIMARY KEY,
                source_path TEXT NOT NULL,
                alarm_class INTEGER,
                alarm_watch INTEGER,
                created_time INTEGER NOT NULL,
                alarm_type TEXT NOT NULL,
                normal_time INTEGER,
                ack_time INTEGER,
                ack_user TEXT,
                message TEXT NOT NULL,
                ack_required INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_alarm_records_created ON alarm_records(created_time)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS alarm_notes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                uuid TEXT NOT NULL,
                created_time INTEGER NOT NULL,
                author TEXT NOT NULL,
                body TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_alarm_notes_uuid ON alarm_notes(uuid)")
            .execute(&self.pool)
            .await?;

        self.apply_locking_mode(self.external_access_enabled())
            .await?;

        info!("SQLite alarm store started: {}", self.url);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.pool.close().await;
        info!("SQLite alarm store stopped: {}", self.url);
        Ok(())
    }

    async fn set_external_access(&self, enabled: bool) -> Result<()> {
        self.apply_locking_mode(enabled).await?;
        self.external_access.store(enabled, Ordering::SeqCst);
        debug!("External access {}", if enabled { "enabled" } else { "disabled" });
        Ok(())
    }

    fn external_access_enabled(&self) -> bool {
        self.external_access.load(Ordering::SeqCst)
    }

    async fn add_record(&self, record: &AlarmRecord) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO alarm_records (
                uuid, source_path, alarm_class, alarm_watch, created_time,
                alarm_type, normal_time, ack_time, ack_user, message, ack_required
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.uuid().to_string())
        .bind(record.source_path())
        .bind(record.alarm_class().map(|h| i64::from(h.0)))
        .bind(record.alarm_watch().map(|h| i64::from(h.0)))
        .bind(to_millis(record.created_time()))
        .bind(record.alarm_type().as_str())
        .bind(record.normal_time().map(to_millis))
        .bind(record.ack_time().map(to_millis))
        .bind(record.ack_user())
        .bind(record.message())
        .bind(record.is_ack_required())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(StoreError::Duplicate(record.uuid()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_record(&self, uuid: Uuid) -> Result<AlarmRecord> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM alarm_records WHERE uuid = ?",
            RECORD_COLUMNS
        ))
        .bind(uuid.to_string())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => hydrate_record(row),
            None => Err(StoreError::NotFound(uuid)),
        }
    }

    async fn acknowledge(&self, uuid: Uuid, user: &str) -> Result<AlarmRecord> {
        sqlx::query(
            r#"
            UPDATE alarm_records
            SET ack_time = ?, ack_user = ?
            WHERE uuid = ? AND ack_time IS NULL
            "#,
        )
        .bind(to_millis(now_millis()))
        .bind(user)
        .bind(uuid.to_string())
        .execute(&self.pool)
        .await?;

        self.get_record(uuid).await
    }

    async fn add_note(&self, uuid: Uuid, user: &str, text: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let exists = sqlx::query("SELECT 1 FROM alarm_records WHERE uuid = ?")
            .bind(uuid.to_string())
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            return Err(StoreError::NotFound(uuid));
        }

        sqlx::query(
            r#"
            INSERT INTO alarm_notes (uuid, created_time, author, body)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(uuid.to_string())
        .bind(to_millis(now_millis()))
        .bind(user)
        .bind(text)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn return_to_normal(&self, uuid: Uuid) -> Result<AlarmRecord> {
        sqlx::query(
            r#"
            UPDATE alarm_records
            SET normal_time = ?
            WHERE uuid = ? AND normal_time IS NULL
            "#,
        )
        .bind(to_millis(now_millis()))
        .bind(uuid.to_string())
        .execute(&self.pool)
        .await?;

        self.get_record(uuid).await
    }

    async fn delete_record(&self, uuid: Uuid) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM alarm_notes WHERE uuid = ?")
            .bind(uuid.to_string())
            .execute(&mut *tx)
            .await?;

        let result = sqlx::query("DELETE FROM alarm_records WHERE uuid = ?")
            .bind(uuid.to_string())
            .execute(&mut *tx)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(uuid));
        }

        tx.commit().await?;
        Ok(())
    }

    async fn delete_all_records(&self) -> Result<u64> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM alarm_notes")
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM alarm_records")
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(result.rows_affected())
    }

    async fn query_alarms(&self, query: &AlarmQuery) -> Result<AlarmCursor> {
        let mut qb = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {} FROM alarm_records WHERE 1 = 1",
            RECORD_COLUMNS
        ));
        push_filters(&mut qb, query);

        let direction = if query.ascending { "ASC" } else { "DESC" };
        qb.push(format!(
            " ORDER BY {col} {dir}, created_time {dir}, uuid {dir}",
            col = query.sort_by.column(),
            dir = direction
        ));

        let rows = qb.build().fetch_all(&self.pool).await?;
        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            records.push(hydrate_record(row)?);
        }
        Ok(Cursor::new(records))
    }

    async fn get_notes(&self, uuid: Uuid) -> Result<NoteCursor> {
        if !self.record_exists(uuid).await? {
            return Err(StoreError::NotFound(uuid));
        }

        let rows = sqlx::query(
            r#"
            SELECT created_time, author, body
            FROM alarm_notes
            WHERE uuid = ?
            ORDER BY id ASC
            "#,
        )
        .bind(uuid.to_string())
        .fetch_all(&self.pool)
        .await?;

        let mut notes = Vec::with_capacity(rows.len());
        for row in rows {
            notes.push(Note {
                timestamp: from_millis(row.try_get("created_time")?)?,
                user: row.try_get("author")?,
                text: row.try_get("body")?,
            });
        }
        Ok(Cursor::new(notes))
    }

    async fn count_alarms(&self, query: &AlarmQuery) -> Result<usize> {
        let mut qb =
            QueryBuilder::<Sqlite>::new("SELECT COUNT(*) AS total FROM alarm_records WHERE 1 = 1");
        push_filters(&mut qb, query);

        let row = qb.build().fetch_one(&self.pool).await?;
        let total: i64 = row.try_get("total")?;
        Ok(total as usize)
    }
}
