//! Database operations for the operations table.

use crate::error::Result;
use msync_engine::Operation;
use sqlx::{SqliteConnection, SqlitePool};

/// Append operations to the log. Operations already stored are ignored.
///
/// Returns how many rows were inserted.
pub async fn insert_operations<'a, I>(
    conn: &mut SqliteConnection,
    ops: I,
) -> std::result::Result<u64, sqlx::Error>
where
    I: IntoIterator<Item = &'a Operation>,
{
    let mut inserted = 0;
    for op in ops {
        let body = serde_json::to_string(op).map_err(|e| sqlx::Error::Encode(Box::new(e)))?;
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO operations (
                op_id, entity_type, entity_id, op_type, field, hlc, device_id, body
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(&op.id)
        .bind(op.entity_type.as_str())
        .bind(&op.entity_id)
        .bind(op.op_type.as_str())
        .bind(op.field.as_deref())
        .bind(op.hlc.to_string())
        .bind(&op.device_id)
        .bind(body)
        .execute(&mut *conn)
        .await?;
        inserted += result.rows_affected();
    }
    Ok(inserted)
}

/// Load the whole log in append order.
pub async fn load_operations(pool: &SqlitePool) -> Result<Vec<Operation>> {
    let rows: Vec<(String,)> = sqlx::query_as(
        r#"
        SELECT body
        FROM operations
        ORDER BY seq ASC
        "#,
    )
    .fetch_all(pool)
    .await?;

    let ops = rows
        .iter()
        .map(|(body,)| serde_json::from_str(body))
        .collect::<std::result::Result<_, _>>()?;
    Ok(ops)
}
