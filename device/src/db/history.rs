//! Sync history: one row per exported or imported bundle.

use serde::Serialize;
use sqlx::{sqlite::SqliteRow, Row, SqliteConnection, SqlitePool};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMethod {
    Export,
    Import,
}

impl SyncMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMethod::Export => "export",
            SyncMethod::Import => "import",
        }
    }
}

/// `partial` when some operations of an import were malformed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Success,
    Partial,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Success => "success",
            SyncStatus::Partial => "partial",
        }
    }
}

/// A history row to be written.
#[derive(Debug, Clone)]
pub struct NewSyncHistory {
    pub bundle_id: String,
    pub method: SyncMethod,
    pub file_name: Option<String>,
    pub peer_device_id: Option<String>,
    pub peer_device_name: Option<String>,
    pub op_count: usize,
    pub applied: usize,
    pub skipped: usize,
    pub conflicts: usize,
    pub status: SyncStatus,
}

/// A stored history row.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncHistoryEntry {
    pub id: i64,
    pub bundle_id: String,
    pub method: String,
    pub file_name: Option<String>,
    pub peer_device_id: Option<String>,
    pub peer_device_name: Option<String>,
    pub op_count: i64,
    pub applied: i64,
    pub skipped: i64,
    pub conflicts: i64,
    pub status: String,
    pub created_at: String,
}

impl<'r> sqlx::FromRow<'r, SqliteRow> for SyncHistoryEntry {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(SyncHistoryEntry {
            id: row.try_get("id")?,
            bundle_id: row.try_get("bundle_id")?,
            method: row.try_get("method")?,
            file_name: row.try_get("file_name")?,
            peer_device_id: row.try_get("peer_device_id")?,
            peer_device_name: row.try_get("peer_device_name")?,
            op_count: row.try_get("op_count")?,
            applied: row.try_get("applied")?,
            skipped: row.try_get("skipped")?,
            conflicts: row.try_get("conflicts")?,
            status: row.try_get("status")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl fmt::Display for SyncHistoryEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}  {:<6}  {}  ops={} applied={} skipped={} conflicts={} [{}]",
            self.created_at,
            self.method,
            self.file_name.as_deref().unwrap_or(&self.bundle_id),
            self.op_count,
            self.applied,
            self.skipped,
            self.conflicts,
            self.status
        )
    }
}

/// Record an export or import.
pub async fn insert_history(
    conn: &mut SqliteConnection,
    entry: &NewSyncHistory,
) -> Result<i64, sqlx::Error> {
    let result = sqlx::query(
        r#"
        INSERT INTO sync_history (
            bundle_id, method, file_name, peer_device_id, peer_device_name,
            op_count, applied, skipped, conflicts, status, created_at
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
        "#,
    )
    .bind(&entry.bundle_id)
    .bind(entry.method.as_str())
    .bind(entry.file_name.as_deref())
    .bind(entry.peer_device_id.as_deref())
    .bind(entry.peer_device_name.as_deref())
    .bind(entry.op_count as i64)
    .bind(entry.applied as i64)
    .bind(entry.skipped as i64)
    .bind(entry.conflicts as i64)
    .bind(entry.status.as_str())
    .bind(chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true))
    .execute(&mut *conn)
    .await?;

    Ok(result.last_insert_rowid())
}

/// Most recent history rows first.
pub async fn list_history(pool: &SqlitePool, limit: i64) -> Result<Vec<SyncHistoryEntry>, sqlx::Error> {
    sqlx::query_as::<_, SyncHistoryEntry>(
        r#"
        SELECT id, bundle_id, method, file_name, peer_device_id, peer_device_name,
               op_count, applied, skipped, conflicts, status, created_at
        FROM sync_history
        ORDER BY id DESC
        LIMIT ?1
        "#,
    )
    .bind(limit)
    .fetch_all(pool)
    .await
}

/// The latest export or import, if any.
pub async fn last_sync(pool: &SqlitePool) -> Result<Option<SyncHistoryEntry>, sqlx::Error> {
    Ok(list_history(pool, 1).await?.into_iter().next())
}
