//! Per-zone key/value metadata, including the stop and delay reasons
//! that explain why a zone is not advancing.

use chrono::{DateTime, Utc};
use sqlx::{Row, SqliteConnection};

use super::zones::require_zone;
use super::{from_unix, FsmStatus, Store, DELAY_REASON, STOP_REASON};
use crate::errors::MusicResult;

/// One metadata entry
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Metadata {
    pub key: String,
    pub value: String,
    pub time: DateTime<Utc>,
}

pub(crate) async fn upsert(
    conn: &mut SqliteConnection,
    zone: &str,
    key: &str,
    value: &str,
    time: DateTime<Utc>,
) -> MusicResult<()> {
    sqlx::query(
        r#"
        INSERT INTO metadata (zone, key, time, value) VALUES (?, ?, ?, ?)
        ON CONFLICT (zone, key) DO UPDATE SET time = excluded.time, value = excluded.value
        "#,
    )
    .bind(zone)
    .bind(key)
    .bind(time.timestamp())
    .bind(value)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn delete_key(conn: &mut SqliteConnection, zone: &str, key: &str) -> MusicResult<()> {
    sqlx::query("DELETE FROM metadata WHERE zone = ? AND key = ?")
        .bind(zone)
        .bind(key)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub(crate) async fn clear_reasons(conn: &mut SqliteConnection, zone: &str) -> MusicResult<()> {
    sqlx::query("DELETE FROM metadata WHERE zone = ? AND key IN (?, ?)")
        .bind(zone)
        .bind(STOP_REASON)
        .bind(DELAY_REASON)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub(crate) async fn write_stop_reason(conn: &mut SqliteConnection, zone: &str, reason: &str) -> MusicResult<()> {
    upsert(conn, zone, STOP_REASON, reason, Utc::now()).await?;
    delete_key(conn, zone, DELAY_REASON).await?;
    sqlx::query("UPDATE zones SET fsmstatus = ? WHERE name = ?")
        .bind(FsmStatus::Blocked.as_str())
        .bind(zone)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub(crate) async fn write_delay_reason(
    conn: &mut SqliteConnection,
    zone: &str,
    reason: &str,
    until: DateTime<Utc>,
) -> MusicResult<()> {
    upsert(conn, zone, DELAY_REASON, reason, until).await?;
    delete_key(conn, zone, STOP_REASON).await?;
    sqlx::query("UPDATE zones SET fsmstatus = ? WHERE name = ?")
        .bind(FsmStatus::Delayed.as_str())
        .bind(zone)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

impl Store {
    /// Sets a metadata value on an existing zone.
    pub async fn set_metadata(
        &self,
        conn: Option<&mut SqliteConnection>,
        zone: &str,
        key: &str,
        value: &str,
    ) -> MusicResult<()> {
        let mut tx = self.tx(conn).await?;
        require_zone(tx.conn(), zone).await?;
        upsert(tx.conn(), zone, key, value, Utc::now()).await?;
        tx.commit().await
    }

    pub async fn get_metadata(
        &self,
        conn: Option<&mut SqliteConnection>,
        zone: &str,
        key: &str,
    ) -> MusicResult<Option<Metadata>> {
        let mut tx = self.tx(conn).await?;
        let row = sqlx::query("SELECT key, value, time FROM metadata WHERE zone = ? AND key = ?")
            .bind(zone)
            .bind(key)
            .fetch_optional(tx.conn())
            .await?;
        tx.commit().await?;

        match row {
            Some(row) => Ok(Some(Metadata {
                key: row.try_get("key")?,
                value: row.try_get("value")?,
                time: from_unix(row.try_get("time")?),
            })),
            None => Ok(None),
        }
    }

    pub async fn list_metadata(&self, conn: Option<&mut SqliteConnection>, zone: &str) -> MusicResult<Vec<Metadata>> {
        let mut tx = self.tx(conn).await?;
        let rows = sqlx::query("SELECT key, value, time FROM metadata WHERE zone = ? ORDER BY key")
            .bind(zone)
            .fetch_all(tx.conn())
            .await?;
        tx.commit().await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(Metadata {
                key: row.try_get("key")?,
                value: row.try_get("value")?,
                time: from_unix(row.try_get("time")?),
            });
        }
        Ok(out)
    }

    pub async fn delete_metadata(&self, conn: Option<&mut SqliteConnection>, zone: &str, key: &str) -> MusicResult<()> {
        let mut tx = self.tx(conn).await?;
        sqlx::query("DELETE FROM metadata WHERE zone = ? AND key = ?")
            .bind(zone)
            .bind(key)
            .execute(tx.conn())
            .await?;
        tx.commit().await
    }

    /// Records why the zone cannot advance and marks it blocked.
    pub async fn set_stop_reason(&self, conn: Option<&mut SqliteConnection>, zone: &str, reason: &str) -> MusicResult<()> {
        let mut tx = self.tx(conn).await?;
        write_stop_reason(tx.conn(), zone, reason).await?;
        tx.commit().await
    }

    /// Records a wall-clock deadline before which the zone must not be
    /// stepped and marks it delayed.
    pub async fn set_delay_reason(
        &self,
        conn: Option<&mut SqliteConnection>,
        zone: &str,
        reason: &str,
        until: DateTime<Utc>,
    ) -> MusicResult<()> {
        let mut tx = self.tx(conn).await?;
        write_delay_reason(tx.conn(), zone, reason, until).await?;
        tx.commit().await
    }

    /// Removes both reasons and resets the status.
    pub async fn clear_stop_reason(&self, conn: Option<&mut SqliteConnection>, zone: &str) -> MusicResult<()> {
        let mut tx = self.tx(conn).await?;
        clear_reasons(tx.conn(), zone).await?;
        sqlx::query("UPDATE zones SET fsmstatus = '' WHERE name = ?")
            .bind(zone)
            .execute(tx.conn())
            .await?;
        tx.commit().await
    }
}
