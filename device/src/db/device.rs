//! The local device row.

use msync_engine::LocalDevice;
use sqlx::SqlitePool;

/// Load this install's device, creating it on first use.
///
/// The id is generated once and never changes; `name` is only used when
/// the row is created.
pub async fn get_or_create_device(pool: &SqlitePool, name: &str) -> Result<LocalDevice, sqlx::Error> {
    if let Some(device) = get_device(pool).await? {
        return Ok(device);
    }

    let device = LocalDevice::new(
        uuid::Uuid::new_v4().to_string(),
        name,
        chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
    );

    // A concurrent first start may have won the race; keep its row.
    sqlx::query(
        r#"
        INSERT OR IGNORE INTO device (singleton, id, name, created_at)
        VALUES (1, ?1, ?2, ?3)
        "#,
    )
    .bind(&device.id)
    .bind(&device.name)
    .bind(&device.created_at)
    .execute(pool)
    .await?;

    tracing::info!(device_id = %device.id, name = %device.name, "device created");
    match get_device(pool).await? {
        Some(stored) => Ok(stored),
        None => Err(sqlx::Error::RowNotFound),
    }
}

/// Load this install's device, if it was set up.
pub async fn get_device(pool: &SqlitePool) -> Result<Option<LocalDevice>, sqlx::Error> {
    let row: Option<(String, String, String)> =
        sqlx::query_as(r#"SELECT id, name, created_at FROM device WHERE singleton = 1"#)
            .fetch_optional(pool)
            .await?;

    Ok(row.map(|(id, name, created_at)| LocalDevice::new(id, name, created_at)))
}
