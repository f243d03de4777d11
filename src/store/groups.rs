//! Signer groups, their membership and the group-wide process lock

use sqlx::{Row, SqliteConnection};

use super::signers::require_signer;
use super::{db_bool, SignerGroup, Store};
use crate::errors::{MusicError, MusicResult};

pub(crate) async fn fetch_group(conn: &mut SqliteConnection, name: &str) -> MusicResult<Option<SignerGroup>> {
    let row = sqlx::query(
        "SELECT name, locked, curprocess, pendadd, pendremove FROM signergroups WHERE name = ?",
    )
    .bind(name)
    .fetch_optional(&mut *conn)
    .await?;

    let row = match row {
        Some(row) => row,
        None => return Ok(None),
    };

    let mut group = SignerGroup {
        name: row.try_get("name")?,
        locked: db_bool(row.try_get("locked")?),
        curprocess: row.try_get("curprocess")?,
        pendadd: row.try_get("pendadd")?,
        pendremove: row.try_get("pendremove")?,
        signers: Vec::new(),
        numzones: 0,
        numprocesszones: 0,
    };

    let members = sqlx::query("SELECT signer FROM group_signers WHERE name = ? ORDER BY signer")
        .bind(name)
        .fetch_all(&mut *conn)
        .await?;
    for member in members {
        let signer_name: String = member.try_get("signer")?;
        group.signers.push(require_signer(conn, &signer_name).await?);
    }

    group.numzones = sqlx::query("SELECT COUNT(*) AS n FROM zones WHERE sgroup = ?")
        .bind(name)
        .fetch_one(&mut *conn)
        .await?
        .try_get("n")?;

    if !group.curprocess.is_empty() {
        group.numprocesszones = process_zone_count(conn, name, &group.curprocess).await?;
    }

    Ok(Some(group))
}

pub(crate) async fn require_group(conn: &mut SqliteConnection, name: &str) -> MusicResult<SignerGroup> {
    fetch_group(conn, name)
        .await?
        .ok_or_else(|| MusicError::validation(format!("signer group {} is unknown", name)))
}

/// Number of zones of the group still executing `process`.
pub(crate) async fn process_zone_count(conn: &mut SqliteConnection, group: &str, process: &str) -> MusicResult<i64> {
    let count = sqlx::query("SELECT COUNT(*) AS n FROM zones WHERE sgroup = ? AND fsm = ?")
        .bind(group)
        .bind(process)
        .fetch_one(&mut *conn)
        .await?
        .try_get("n")?;
    Ok(count)
}

impl Store {
    pub async fn add_group(&self, conn: Option<&mut SqliteConnection>, name: &str) -> MusicResult<String> {
        if name.is_empty() {
            return Err(MusicError::validation("signer group name must not be empty"));
        }
        let mut tx = self.tx(conn).await?;
        if fetch_group(tx.conn(), name).await?.is_some() {
            return Err(MusicError::validation(format!("signer group {} already exists", name)));
        }
        sqlx::query("INSERT INTO signergroups (name) VALUES (?)")
            .bind(name)
            .execute(tx.conn())
            .await?;
        tx.commit().await?;
        log::info!("Signer group {} added", name);
        Ok(format!("Signer group {} added", name))
    }

    /// Deletes an unlocked group that has no zones. Memberships go with it.
    pub async fn delete_group(&self, conn: Option<&mut SqliteConnection>, name: &str) -> MusicResult<String> {
        let mut tx = self.tx(conn).await?;
        let group = require_group(tx.conn(), name).await?;

        if group.locked {
            return Err(MusicError::invariant(format!(
                "signer group {} is locked by process {}",
                name, group.curprocess
            )));
        }
        if group.numzones > 0 {
            return Err(MusicError::invariant(format!(
                "signer group {} still has {} zone(s)",
                name, group.numzones
            )));
        }

        sqlx::query("DELETE FROM group_signers WHERE name = ?")
            .bind(name)
            .execute(tx.conn())
            .await?;
        sqlx::query("DELETE FROM signergroups WHERE name = ?")
            .bind(name)
            .execute(tx.conn())
            .await?;
        tx.commit().await?;
        log::info!("Signer group {} deleted", name);
        Ok(format!("Signer group {} deleted", name))
    }

    pub async fn get_group(&self, conn: Option<&mut SqliteConnection>, name: &str) -> MusicResult<SignerGroup> {
        let mut tx = self.tx(conn).await?;
        let group = require_group(tx.conn(), name).await?;
        tx.commit().await?;
        Ok(group)
    }

    pub async fn list_groups(&self, conn: Option<&mut SqliteConnection>) -> MusicResult<Vec<SignerGroup>> {
        let mut tx = self.tx(conn).await?;
        let rows = sqlx::query("SELECT name FROM signergroups ORDER BY name")
            .fetch_all(tx.conn())
            .await?;
        let mut groups = Vec::with_capacity(rows.len());
        for row in rows {
            let name: String = row.try_get("name")?;
            groups.push(require_group(tx.conn(), &name).await?);
        }
        tx.commit().await?;
        Ok(groups)
    }

    /// Inserts a membership row. Lock and pending checks belong to the
    /// group lifecycle; this only refuses duplicates.
    pub async fn add_group_member(
        &self,
        conn: Option<&mut SqliteConnection>,
        group: &str,
        signer: &str,
    ) -> MusicResult<()> {
        let mut tx = self.tx(conn).await?;
        let g = require_group(tx.conn(), group).await?;
        require_signer(tx.conn(), signer).await?;
        if g.has_member(signer) {
            return Err(MusicError::invariant(format!(
                "signer {} is already a member of signer group {}",
                signer, group
            )));
        }
        sqlx::query("INSERT INTO group_signers (name, signer) VALUES (?, ?)")
            .bind(group)
            .bind(signer)
            .execute(tx.conn())
            .await?;
        tx.commit().await
    }

    pub async fn remove_group_member(
        &self,
        conn: Option<&mut SqliteConnection>,
        group: &str,
        signer: &str,
    ) -> MusicResult<()> {
        let mut tx = self.tx(conn).await?;
        sqlx::query("DELETE FROM group_signers WHERE name = ? AND signer = ?")
            .bind(group)
            .bind(signer)
            .execute(tx.conn())
            .await?;
        tx.commit().await
    }

    /// Locks the group for `process` with the given pending signer.
    pub async fn set_group_process(
        &self,
        conn: Option<&mut SqliteConnection>,
        group: &str,
        process: &str,
        pendadd: &str,
        pendremove: &str,
    ) -> MusicResult<()> {
        let mut tx = self.tx(conn).await?;
        sqlx::query(
            "UPDATE signergroups SET locked = 1, curprocess = ?, pendadd = ?, pendremove = ? WHERE name = ?",
        )
        .bind(process)
        .bind(pendadd)
        .bind(pendremove)
        .bind(group)
        .execute(tx.conn())
        .await?;
        tx.commit().await
    }

    /// Unlocks the group and forgets the pending signer.
    pub async fn clear_group_process(&self, conn: Option<&mut SqliteConnection>, group: &str) -> MusicResult<()> {
        let mut tx = self.tx(conn).await?;
        sqlx::query(
            "UPDATE signergroups SET locked = 0, curprocess = '', pendadd = '', pendremove = '' WHERE name = ?",
        )
        .bind(group)
        .execute(tx.conn())
        .await?;
        tx.commit().await
    }

    pub async fn count_process_zones(
        &self,
        conn: Option<&mut SqliteConnection>,
        group: &str,
        process: &str,
    ) -> MusicResult<i64> {
        let mut tx = self.tx(conn).await?;
        let count = process_zone_count(tx.conn(), group, process).await?;
        tx.commit().await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::temp_store;
    use super::super::{FsmMode, Signer, ZoneType};
    use super::*;

    fn signer(name: &str) -> Signer {
        Signer {
            name: name.to_string(),
            method: "memory".to_string(),
            auth: String::new(),
            address: "192.0.2.1".to_string(),
            port: 53,
            usetcp: true,
            usetsig: false,
        }
    }

    #[tokio::test]
    async fn test_group_lock_fields() {
        let store = temp_store().await;
        store.add_group(None, "gA").await.unwrap();
        store.add_signer(None, &signer("s1")).await.unwrap();
        store.add_group_member(None, "gA", "s1").await.unwrap();

        let g = store.get_group(None, "gA").await.unwrap();
        assert_eq!(g.signer_names(), vec!["s1".to_string()]);
        assert!(!g.locked);
        assert_eq!(g.curprocess, "");

        store
            .set_group_process(None, "gA", "add-signer", "s2", "")
            .await
            .unwrap();
        let g = store.get_group(None, "gA").await.unwrap();
        assert!(g.locked);
        assert_eq!(g.curprocess, "add-signer");
        assert_eq!(g.pendadd, "s2");

        assert!(matches!(
            store.delete_group(None, "gA").await,
            Err(MusicError::Invariant(_))
        ));

        store.clear_group_process(None, "gA").await.unwrap();
        let g = store.get_group(None, "gA").await.unwrap();
        assert!(!g.locked);
        assert_eq!(g.pendadd, "");
    }

    #[tokio::test]
    async fn test_group_with_zones_cannot_be_deleted() {
        let store = temp_store().await;
        store.add_group(None, "gA").await.unwrap();
        store
            .add_zone(None, "example.com.", ZoneType::Normal, FsmMode::Auto)
            .await
            .unwrap();
        store.set_zone_group(None, "example.com.", "gA").await.unwrap();

        let g = store.get_group(None, "gA").await.unwrap();
        assert_eq!(g.numzones, 1);
        assert!(store.delete_group(None, "gA").await.is_err());

        store.set_zone_group(None, "example.com.", "").await.unwrap();
        store.delete_group(None, "gA").await.unwrap();
        assert!(store.list_groups(None).await.unwrap().is_empty());
    }
}
