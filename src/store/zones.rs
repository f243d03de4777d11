//! Zone rows and the process attachment fields

use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};

use super::metadata::clear_reasons;
use super::{from_unix, FsmMode, FsmStatus, Store, Zone, ZoneType, DELAY_REASON, STOP_REASON};
use crate::dns::protocol::fqdn;
use crate::errors::{MusicError, MusicResult};

const ZONE_SELECT: &str = r#"
    SELECT z.name, z.zonetype, z.state, z.statestamp, z.fsm, z.fsmsigner,
           z.fsmmode, z.fsmstatus, z.sgroup,
           COALESCE((SELECT value FROM metadata m WHERE m.zone = z.name AND m.key = ?1), '') AS stop_reason,
           COALESCE((SELECT value FROM metadata m WHERE m.zone = z.name AND m.key = ?2), '') AS delay_reason,
           (SELECT time FROM metadata m WHERE m.zone = z.name AND m.key = ?2) AS delay_until
    FROM zones z
"#;

fn zone_from_row(row: &SqliteRow) -> MusicResult<Zone> {
    let delay_until: Option<i64> = row.try_get("delay_until")?;
    Ok(Zone {
        name: row.try_get("name")?,
        zonetype: row.try_get::<String, _>("zonetype")?.parse()?,
        state: row.try_get("state")?,
        statestamp: from_unix(row.try_get("statestamp")?),
        fsm: row.try_get("fsm")?,
        fsmsigner: row.try_get("fsmsigner")?,
        fsmmode: row.try_get::<String, _>("fsmmode")?.parse()?,
        fsmstatus: FsmStatus::parse(&row.try_get::<String, _>("fsmstatus")?),
        sgroup: row.try_get("sgroup")?,
        stop_reason: row.try_get("stop_reason")?,
        delay_reason: row.try_get("delay_reason")?,
        delay_until: delay_until.map(from_unix),
    })
}

pub(crate) async fn fetch_zone(conn: &mut SqliteConnection, name: &str) -> MusicResult<Option<Zone>> {
    let sql = format!("{} WHERE z.name = ?3", ZONE_SELECT);
    let row = sqlx::query(&sql)
        .bind(STOP_REASON)
        .bind(DELAY_REASON)
        .bind(name)
        .fetch_optional(&mut *conn)
        .await?;
    row.as_ref().map(zone_from_row).transpose()
}

pub(crate) async fn require_zone(conn: &mut SqliteConnection, name: &str) -> MusicResult<Zone> {
    fetch_zone(conn, name)
        .await?
        .ok_or_else(|| MusicError::validation(format!("zone {} is unknown", name)))
}

async fn fetch_zones(conn: &mut SqliteConnection, filter: &str, arg: Option<&str>) -> MusicResult<Vec<Zone>> {
    let sql = format!("{} {} ORDER BY z.name", ZONE_SELECT, filter);
    let mut query = sqlx::query(&sql).bind(STOP_REASON).bind(DELAY_REASON);
    if let Some(arg) = arg {
        query = query.bind(arg);
    }
    let rows = query.fetch_all(&mut *conn).await?;
    rows.iter().map(zone_from_row).collect()
}

pub(crate) async fn group_zones(conn: &mut SqliteConnection, group: &str) -> MusicResult<Vec<Zone>> {
    fetch_zones(conn, "WHERE z.sgroup = ?3", Some(group)).await
}

impl Store {
    /// Adds a zone. Names are stored in lowercase FQDN form.
    pub async fn add_zone(
        &self,
        conn: Option<&mut SqliteConnection>,
        name: &str,
        zonetype: ZoneType,
        fsmmode: FsmMode,
    ) -> MusicResult<String> {
        let name = fqdn(name);
        let mut tx = self.tx(conn).await?;

        if fetch_zone(tx.conn(), &name).await?.is_some() {
            return Err(MusicError::validation(format!("zone {} already exists", name)));
        }

        sqlx::query(
            "INSERT INTO zones (name, zonetype, fsmmode, statestamp) VALUES (?, ?, ?, ?)",
        )
        .bind(&name)
        .bind(zonetype.as_str())
        .bind(fsmmode.as_str())
        .bind(Utc::now().timestamp())
        .execute(tx.conn())
        .await?;

        tx.commit().await?;
        log::info!("Zone {} added", name);
        Ok(format!("Zone {} added", name))
    }

    /// Deletes a zone with its metadata, cached RRsets and key origins.
    /// A zone executing a process cannot be deleted.
    pub async fn delete_zone(&self, conn: Option<&mut SqliteConnection>, name: &str) -> MusicResult<String> {
        let name = fqdn(name);
        let mut tx = self.tx(conn).await?;

        let zone = require_zone(tx.conn(), &name).await?;
        if zone.in_process() {
            return Err(MusicError::invariant(format!(
                "zone {} is executing process {} and cannot be deleted",
                name, zone.fsm
            )));
        }

        for statement in [
            "DELETE FROM zones WHERE name = ?",
            "DELETE FROM metadata WHERE zone = ?",
            "DELETE FROM records WHERE zone = ?",
            "DELETE FROM zone_dnskeys WHERE zone = ?",
            "DELETE FROM zone_nses WHERE zone = ?",
        ] {
            sqlx::query(statement).bind(&name).execute(tx.conn()).await?;
        }

        tx.commit().await?;
        log::info!("Zone {} deleted", name);
        Ok(format!("Zone {} deleted", name))
    }

    pub async fn get_zone(&self, conn: Option<&mut SqliteConnection>, name: &str) -> MusicResult<Zone> {
        let mut tx = self.tx(conn).await?;
        let zone = require_zone(tx.conn(), &fqdn(name)).await?;
        tx.commit().await?;
        Ok(zone)
    }

    pub async fn list_zones(&self, conn: Option<&mut SqliteConnection>) -> MusicResult<Vec<Zone>> {
        let mut tx = self.tx(conn).await?;
        let zones = fetch_zones(tx.conn(), "", None).await?;
        tx.commit().await?;
        Ok(zones)
    }

    pub async fn zones_in_group(&self, conn: Option<&mut SqliteConnection>, group: &str) -> MusicResult<Vec<Zone>> {
        let mut tx = self.tx(conn).await?;
        let zones = group_zones(tx.conn(), group).await?;
        tx.commit().await?;
        Ok(zones)
    }

    /// Zones the scheduler may step: auto mode, attached to a process and,
    /// unless `include_blocked`, not blocked.
    pub async fn schedulable_zones(
        &self,
        conn: Option<&mut SqliteConnection>,
        include_blocked: bool,
    ) -> MusicResult<Vec<Zone>> {
        let filter = if include_blocked {
            "WHERE z.fsmmode = 'auto' AND z.fsm != ''"
        } else {
            "WHERE z.fsmmode = 'auto' AND z.fsm != '' AND z.fsmstatus != 'blocked'"
        };
        let mut tx = self.tx(conn).await?;
        let zones = fetch_zones(tx.conn(), filter, None).await?;
        tx.commit().await?;
        Ok(zones)
    }

    /// Changes the zone type and/or the fsm mode.
    pub async fn update_zone(
        &self,
        conn: Option<&mut SqliteConnection>,
        name: &str,
        zonetype: Option<ZoneType>,
        fsmmode: Option<FsmMode>,
    ) -> MusicResult<String> {
        let name = fqdn(name);
        let mut tx = self.tx(conn).await?;
        let zone = require_zone(tx.conn(), &name).await?;

        let zonetype = zonetype.unwrap_or(zone.zonetype);
        let fsmmode = fsmmode.unwrap_or(zone.fsmmode);
        sqlx::query("UPDATE zones SET zonetype = ?, fsmmode = ? WHERE name = ?")
            .bind(zonetype.as_str())
            .bind(fsmmode.as_str())
            .bind(&name)
            .execute(tx.conn())
            .await?;

        tx.commit().await?;
        Ok(format!(
            "Zone {} updated: type {}, mode {}",
            name, zonetype, fsmmode
        ))
    }

    /// Sets (or, with an empty group, clears) the zone's signer group.
    pub async fn set_zone_group(
        &self,
        conn: Option<&mut SqliteConnection>,
        zone: &str,
        group: &str,
    ) -> MusicResult<()> {
        let mut tx = self.tx(conn).await?;
        sqlx::query("UPDATE zones SET sgroup = ? WHERE name = ?")
            .bind(group)
            .bind(zone)
            .execute(tx.conn())
            .await?;
        tx.commit().await
    }

    /// Attaches a process: records its name, the initial state and the
    /// focus signer, and starts the state clock.
    pub async fn set_zone_fsm(
        &self,
        conn: Option<&mut SqliteConnection>,
        zone: &str,
        fsm: &str,
        state: &str,
        fsmsigner: &str,
    ) -> MusicResult<()> {
        let mut tx = self.tx(conn).await?;
        sqlx::query(
            "UPDATE zones SET fsm = ?, state = ?, fsmsigner = ?, fsmstatus = '', statestamp = ? WHERE name = ?",
        )
        .bind(fsm)
        .bind(state)
        .bind(fsmsigner)
        .bind(Utc::now().timestamp())
        .bind(zone)
        .execute(tx.conn())
        .await?;
        clear_reasons(tx.conn(), zone).await?;
        tx.commit().await
    }

    /// Commits a transition: new state, fresh state clock, no stop or
    /// delay reason.
    pub async fn set_zone_state(
        &self,
        conn: Option<&mut SqliteConnection>,
        zone: &str,
        state: &str,
    ) -> MusicResult<()> {
        let mut tx = self.tx(conn).await?;
        sqlx::query("UPDATE zones SET state = ?, fsmstatus = '', statestamp = ? WHERE name = ?")
            .bind(state)
            .bind(Utc::now().timestamp())
            .bind(zone)
            .execute(tx.conn())
            .await?;
        clear_reasons(tx.conn(), zone).await?;
        tx.commit().await
    }

    pub async fn set_zone_status(
        &self,
        conn: Option<&mut SqliteConnection>,
        zone: &str,
        status: FsmStatus,
    ) -> MusicResult<()> {
        let mut tx = self.tx(conn).await?;
        sqlx::query("UPDATE zones SET fsmstatus = ? WHERE name = ?")
            .bind(status.as_str())
            .bind(zone)
            .execute(tx.conn())
            .await?;
        tx.commit().await
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::temp_store;
    use super::*;

    #[tokio::test]
    async fn test_zone_lifecycle() {
        let store = temp_store().await;

        store
            .add_zone(None, "Example.COM", ZoneType::Normal, FsmMode::Auto)
            .await
            .unwrap();
        assert!(store
            .add_zone(None, "example.com.", ZoneType::Normal, FsmMode::Auto)
            .await
            .is_err());

        let zone = store.get_zone(None, "example.com").await.unwrap();
        assert_eq!(zone.name, "example.com.");
        assert_eq!(zone.fsm, "");
        assert_eq!(zone.fsmstatus, FsmStatus::Ok);

        store
            .update_zone(None, "example.com.", Some(ZoneType::Debug), Some(FsmMode::Manual))
            .await
            .unwrap();
        let zone = store.get_zone(None, "example.com.").await.unwrap();
        assert_eq!(zone.zonetype, ZoneType::Debug);
        assert_eq!(zone.fsmmode, FsmMode::Manual);

        store.delete_zone(None, "example.com.").await.unwrap();
        assert!(matches!(
            store.get_zone(None, "example.com.").await,
            Err(MusicError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_zone_in_process_cannot_be_deleted() {
        let store = temp_store().await;
        store
            .add_zone(None, "example.com.", ZoneType::Normal, FsmMode::Auto)
            .await
            .unwrap();
        store
            .set_zone_fsm(None, "example.com.", "add-signer", "signers-unsynced", "s2")
            .await
            .unwrap();

        assert!(matches!(
            store.delete_zone(None, "example.com.").await,
            Err(MusicError::Invariant(_))
        ));
    }

    #[tokio::test]
    async fn test_schedulable_zones() {
        let store = temp_store().await;
        for name in &["a.example.", "b.example.", "c.example."] {
            store
                .add_zone(None, name, ZoneType::Normal, FsmMode::Auto)
                .await
                .unwrap();
            store
                .set_zone_fsm(None, name, "add-signer", "signers-unsynced", "s2")
                .await
                .unwrap();
        }
        store
            .set_stop_reason(None, "b.example.", "parent DS missing")
            .await
            .unwrap();
        store
            .update_zone(None, "c.example.", None, Some(FsmMode::Manual))
            .await
            .unwrap();

        let zones = store.schedulable_zones(None, false).await.unwrap();
        assert_eq!(zones.len(), 1);
        assert_eq!(zones[0].name, "a.example.");

        let zones = store.schedulable_zones(None, true).await.unwrap();
        assert_eq!(zones.len(), 2);
        let blocked = zones.iter().find(|z| z.name == "b.example.").unwrap();
        assert_eq!(blocked.fsmstatus, FsmStatus::Blocked);
        assert_eq!(blocked.stop_reason, "parent DS missing");
    }
}
