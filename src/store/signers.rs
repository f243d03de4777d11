//! Signer rows

use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};

use super::{db_bool, Signer, Store};
use crate::errors::{MusicError, MusicResult};

fn signer_from_row(row: &SqliteRow) -> MusicResult<Signer> {
    let port: i64 = row.try_get("port")?;
    Ok(Signer {
        name: row.try_get("name")?,
        method: row.try_get("method")?,
        auth: row.try_get("auth")?,
        address: row.try_get("address")?,
        port: port as u16,
        usetcp: db_bool(row.try_get("usetcp")?),
        usetsig: db_bool(row.try_get("usetsig")?),
    })
}

const SIGNER_COLUMNS: &str = "name, method, auth, address, port, usetcp, usetsig";

pub(crate) async fn fetch_signer(conn: &mut SqliteConnection, name: &str) -> MusicResult<Option<Signer>> {
    let sql = format!("SELECT {} FROM signers WHERE name = ?", SIGNER_COLUMNS);
    let row = sqlx::query(&sql).bind(name).fetch_optional(&mut *conn).await?;
    row.as_ref().map(signer_from_row).transpose()
}

pub(crate) async fn require_signer(conn: &mut SqliteConnection, name: &str) -> MusicResult<Signer> {
    fetch_signer(conn, name)
        .await?
        .ok_or_else(|| MusicError::validation(format!("signer {} is unknown", name)))
}

pub(crate) async fn groups_of(conn: &mut SqliteConnection, signer: &str) -> MusicResult<Vec<String>> {
    let rows = sqlx::query("SELECT name FROM group_signers WHERE signer = ? ORDER BY name")
        .bind(signer)
        .fetch_all(&mut *conn)
        .await?;
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        out.push(row.try_get("name")?);
    }
    Ok(out)
}

/// Fields of a signer that may be changed after creation
#[derive(Debug, Clone, Default)]
pub struct SignerUpdate {
    pub method: Option<String>,
    pub auth: Option<String>,
    pub address: Option<String>,
    pub port: Option<u16>,
    pub usetcp: Option<bool>,
    pub usetsig: Option<bool>,
}

impl Store {
    pub async fn add_signer(&self, conn: Option<&mut SqliteConnection>, signer: &Signer) -> MusicResult<String> {
        if signer.name.is_empty() {
            return Err(MusicError::validation("signer name must not be empty"));
        }
        let mut tx = self.tx(conn).await?;
        if fetch_signer(tx.conn(), &signer.name).await?.is_some() {
            return Err(MusicError::validation(format!("signer {} already exists", signer.name)));
        }

        sqlx::query(
            "INSERT INTO signers (name, method, auth, address, port, usetcp, usetsig) VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&signer.name)
        .bind(&signer.method)
        .bind(&signer.auth)
        .bind(&signer.address)
        .bind(signer.port as i64)
        .bind(signer.usetcp)
        .bind(signer.usetsig)
        .execute(tx.conn())
        .await?;

        tx.commit().await?;
        log::info!("Signer {} ({}) added", signer.name, signer.method);
        Ok(format!("Signer {} added", signer.name))
    }

    /// Deletes a signer that is not a member of any group.
    pub async fn delete_signer(&self, conn: Option<&mut SqliteConnection>, name: &str) -> MusicResult<String> {
        let mut tx = self.tx(conn).await?;
        require_signer(tx.conn(), name).await?;

        let groups = groups_of(tx.conn(), name).await?;
        if !groups.is_empty() {
            return Err(MusicError::invariant(format!(
                "signer {} is a member of signer group(s) {}; leave them first",
                name,
                groups.join(", ")
            )));
        }

        sqlx::query("DELETE FROM signers WHERE name = ?")
            .bind(name)
            .execute(tx.conn())
            .await?;
        tx.commit().await?;
        log::info!("Signer {} deleted", name);
        Ok(format!("Signer {} deleted", name))
    }

    pub async fn update_signer(
        &self,
        conn: Option<&mut SqliteConnection>,
        name: &str,
        update: &SignerUpdate,
    ) -> MusicResult<String> {
        let mut tx = self.tx(conn).await?;
        let mut signer = require_signer(tx.conn(), name).await?;

        if let Some(ref method) = update.method {
            signer.method = method.clone();
        }
        if let Some(ref auth) = update.auth {
            signer.auth = auth.clone();
        }
        if let Some(ref address) = update.address {
            signer.address = address.clone();
        }
        if let Some(port) = update.port {
            signer.port = port;
        }
        if let Some(usetcp) = update.usetcp {
            signer.usetcp = usetcp;
        }
        if let Some(usetsig) = update.usetsig {
            signer.usetsig = usetsig;
        }

        sqlx::query(
            "UPDATE signers SET method = ?, auth = ?, address = ?, port = ?, usetcp = ?, usetsig = ? WHERE name = ?",
        )
        .bind(&signer.method)
        .bind(&signer.auth)
        .bind(&signer.address)
        .bind(signer.port as i64)
        .bind(signer.usetcp)
        .bind(signer.usetsig)
        .bind(name)
        .execute(tx.conn())
        .await?;

        tx.commit().await?;
        Ok(format!("Signer {} updated", name))
    }

    pub async fn get_signer(&self, conn: Option<&mut SqliteConnection>, name: &str) -> MusicResult<Signer> {
        let mut tx = self.tx(conn).await?;
        let signer = require_signer(tx.conn(), name).await?;
        tx.commit().await?;
        Ok(signer)
    }

    pub async fn list_signers(&self, conn: Option<&mut SqliteConnection>) -> MusicResult<Vec<Signer>> {
        let mut tx = self.tx(conn).await?;
        let sql = format!("SELECT {} FROM signers ORDER BY name", SIGNER_COLUMNS);
        let rows = sqlx::query(&sql).fetch_all(tx.conn()).await?;
        tx.commit().await?;
        rows.iter().map(signer_from_row).collect()
    }

    /// Names of the groups a signer belongs to.
    pub async fn signer_groups(&self, conn: Option<&mut SqliteConnection>, name: &str) -> MusicResult<Vec<String>> {
        let mut tx = self.tx(conn).await?;
        let groups = groups_of(tx.conn(), name).await?;
        tx.commit().await?;
        Ok(groups)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::temp_store;
    use super::*;

    fn s1() -> Signer {
        Signer {
            name: "s1".to_string(),
            method: "ddns".to_string(),
            auth: "hmac-sha256:k.:c2VjcmV0".to_string(),
            address: "198.51.100.10".to_string(),
            port: 53,
            usetcp: true,
            usetsig: true,
        }
    }

    #[tokio::test]
    async fn test_signer_crud() {
        let store = temp_store().await;
        store.add_signer(None, &s1()).await.unwrap();
        assert!(store.add_signer(None, &s1()).await.is_err());
        assert_eq!(store.get_signer(None, "s1").await.unwrap(), s1());

        let update = SignerUpdate {
            port: Some(5353),
            usetcp: Some(false),
            ..Default::default()
        };
        store.update_signer(None, "s1", &update).await.unwrap();
        let signer = store.get_signer(None, "s1").await.unwrap();
        assert_eq!(signer.port, 5353);
        assert!(!signer.usetcp);
        assert_eq!(signer.address, "198.51.100.10");

        store.delete_signer(None, "s1").await.unwrap();
        assert!(store.list_signers(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_member_cannot_be_deleted() {
        let store = temp_store().await;
        store.add_signer(None, &s1()).await.unwrap();
        store.add_group(None, "gA").await.unwrap();
        store.add_group_member(None, "gA", "s1").await.unwrap();

        assert!(matches!(
            store.delete_signer(None, "s1").await,
            Err(MusicError::Invariant(_))
        ));
        assert_eq!(store.signer_groups(None, "s1").await.unwrap(), vec!["gA".to_string()]);
    }
}
