//! Persisted engine state.
//!
//! The snapshot is stored without its operation log, which lives in the
//! `operations` table; [`load_snapshot`] joins the two back together.

use super::load_operations;
use crate::error::Result;
use msync_engine::StoreSnapshot;
use sqlx::{SqliteConnection, SqlitePool};

/// Load the last saved engine state with its operation log.
pub async fn load_snapshot(pool: &SqlitePool) -> Result<Option<StoreSnapshot>> {
    let row: Option<(String,)> =
        sqlx::query_as(r#"SELECT snapshot FROM engine_state WHERE singleton = 1"#)
            .fetch_optional(pool)
            .await?;

    let Some((json,)) = row else {
        return Ok(None);
    };
    let mut snapshot = StoreSnapshot::from_json(&json)?;

    snapshot.ops = load_operations(pool).await?;

    Ok(Some(snapshot))
}

/// Save the engine state, leaving the operation log out.
pub async fn save_snapshot(conn: &mut SqliteConnection, mut snapshot: StoreSnapshot) -> Result<()> {
    snapshot.ops = Vec::new();
    let json = snapshot.to_json()?;

    sqlx::query(
        r#"
        INSERT INTO engine_state (singleton, snapshot, updated_at)
        VALUES (1, ?1, ?2)
        ON CONFLICT (singleton) DO UPDATE SET
            snapshot = excluded.snapshot,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(json)
    .bind(chrono::Utc::now().to_rfc3339())
    .execute(&mut *conn)
    .await?;

    Ok(())
}
