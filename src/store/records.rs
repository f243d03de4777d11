//! RRset cache and the DNSKEY/NS origin tables
//!
//! The cache holds, per (zone, owner, signer, type), the records a signer
//! returned on its most recent fetch, stored in textual RR form. The
//! origin tables remember which signer first published each DNSKEY
//! (by fingerprint) and each NS name, so a leaving signer's data can be
//! withdrawn from its peers.

use std::collections::BTreeMap;

use sqlx::{Row, SqliteConnection};

use super::Store;
use crate::dns::protocol::{DnsRecord, QueryType};
use crate::errors::{MusicError, MusicResult};

/// Which origin table an entry lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OriginKind {
    Dnskey,
    Ns,
}

impl OriginKind {
    fn table(&self) -> &'static str {
        match self {
            OriginKind::Dnskey => "zone_dnskeys",
            OriginKind::Ns => "zone_nses",
        }
    }

    fn column(&self) -> &'static str {
        match self {
            OriginKind::Dnskey => "dnskey",
            OriginKind::Ns => "ns",
        }
    }
}

/// An item together with the signer that introduced it
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Origin {
    pub item: String,
    pub signer: String,
}

fn parse_cached(text: &str) -> MusicResult<DnsRecord> {
    text.parse::<DnsRecord>()
        .map_err(|e| MusicError::internal(format!("corrupt cached record '{}': {}", text, e)))
}

pub(crate) async fn cached(
    conn: &mut SqliteConnection,
    zone: &str,
    owner: &str,
    signer: &str,
    rrtype: QueryType,
) -> MusicResult<Vec<DnsRecord>> {
    let rows = sqlx::query(
        "SELECT rdata FROM records WHERE zone = ? AND owner = ? AND signer = ? AND rrtype = ? ORDER BY id",
    )
    .bind(zone)
    .bind(owner)
    .bind(signer)
    .bind(rrtype.to_num() as i64)
    .fetch_all(&mut *conn)
    .await?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let text: String = row.try_get("rdata")?;
        out.push(parse_cached(&text)?);
    }
    Ok(out)
}

pub(crate) async fn record_origin(
    conn: &mut SqliteConnection,
    kind: OriginKind,
    zone: &str,
    item: &str,
    signer: &str,
) -> MusicResult<bool> {
    let sql = format!(
        "INSERT OR IGNORE INTO {} (zone, {}, signer) VALUES (?, ?, ?)",
        kind.table(),
        kind.column()
    );
    let result = sqlx::query(&sql)
        .bind(zone)
        .bind(item)
        .bind(signer)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub(crate) async fn origins(conn: &mut SqliteConnection, kind: OriginKind, zone: &str) -> MusicResult<Vec<Origin>> {
    let sql = format!(
        "SELECT {col} AS item, signer FROM {table} WHERE zone = ? ORDER BY signer, {col}",
        col = kind.column(),
        table = kind.table()
    );
    let rows = sqlx::query(&sql).bind(zone).fetch_all(&mut *conn).await?;
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        out.push(Origin {
            item: row.try_get("item")?,
            signer: row.try_get("signer")?,
        });
    }
    Ok(out)
}

pub(crate) async fn delete_signer_origins(conn: &mut SqliteConnection, zone: &str, signer: &str) -> MusicResult<()> {
    for kind in [OriginKind::Dnskey, OriginKind::Ns] {
        let sql = format!("DELETE FROM {} WHERE zone = ? AND signer = ?", kind.table());
        sqlx::query(&sql)
            .bind(zone)
            .bind(signer)
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

impl Store {
    /// Replaces the cached RRset of one signer with `records`.
    ///
    /// Runs in its own transaction under the cache lock so concurrent
    /// fetches of the same key cannot interleave their delete and insert.
    pub async fn replace_rrset_cache(
        &self,
        zone: &str,
        owner: &str,
        signer: &str,
        rrtype: QueryType,
        records: &[DnsRecord],
    ) -> MusicResult<()> {
        let _guard = self.cache_lock.lock().await;
        let mut tx = self.tx(None).await?;

        sqlx::query("DELETE FROM records WHERE zone = ? AND owner = ? AND signer = ? AND rrtype = ?")
            .bind(zone)
            .bind(owner)
            .bind(signer)
            .bind(rrtype.to_num() as i64)
            .execute(tx.conn())
            .await?;

        for record in records {
            sqlx::query("INSERT INTO records (zone, owner, signer, rrtype, rdata) VALUES (?, ?, ?, ?, ?)")
                .bind(zone)
                .bind(owner)
                .bind(signer)
                .bind(rrtype.to_num() as i64)
                .bind(record.to_string())
                .execute(tx.conn())
                .await?;
        }

        tx.commit().await
    }

    /// The records cached by the last fetch of this key.
    pub async fn cached_rrset(
        &self,
        conn: Option<&mut SqliteConnection>,
        zone: &str,
        owner: &str,
        signer: &str,
        rrtype: QueryType,
    ) -> MusicResult<Vec<DnsRecord>> {
        let mut tx = self.tx(conn).await?;
        let records = cached(tx.conn(), zone, owner, signer, rrtype).await?;
        tx.commit().await?;
        Ok(records)
    }

    /// Cached records of every signer for one owner and type.
    pub async fn list_rrset(
        &self,
        conn: Option<&mut SqliteConnection>,
        zone: &str,
        owner: &str,
        rrtype: QueryType,
    ) -> MusicResult<BTreeMap<String, Vec<DnsRecord>>> {
        let mut tx = self.tx(conn).await?;
        let rows = sqlx::query(
            "SELECT signer, rdata FROM records WHERE zone = ? AND owner = ? AND rrtype = ? ORDER BY signer, id",
        )
        .bind(zone)
        .bind(owner)
        .bind(rrtype.to_num() as i64)
        .fetch_all(tx.conn())
        .await?;
        tx.commit().await?;

        let mut out: BTreeMap<String, Vec<DnsRecord>> = BTreeMap::new();
        for row in rows {
            let signer: String = row.try_get("signer")?;
            let text: String = row.try_get("rdata")?;
            out.entry(signer).or_default().push(parse_cached(&text)?);
        }
        Ok(out)
    }

    /// Remembers that `signer` introduced the DNSKEY with `fingerprint`.
    /// The first signer to claim a key keeps it.
    pub async fn record_dnskey_origin(
        &self,
        conn: Option<&mut SqliteConnection>,
        zone: &str,
        fingerprint: &str,
        signer: &str,
    ) -> MusicResult<bool> {
        let mut tx = self.tx(conn).await?;
        let inserted = record_origin(tx.conn(), OriginKind::Dnskey, zone, fingerprint, signer).await?;
        tx.commit().await?;
        Ok(inserted)
    }

    pub async fn record_ns_origin(
        &self,
        conn: Option<&mut SqliteConnection>,
        zone: &str,
        ns: &str,
        signer: &str,
    ) -> MusicResult<bool> {
        let mut tx = self.tx(conn).await?;
        let inserted = record_origin(tx.conn(), OriginKind::Ns, zone, ns, signer).await?;
        tx.commit().await?;
        Ok(inserted)
    }

    pub async fn list_origins(
        &self,
        conn: Option<&mut SqliteConnection>,
        kind: OriginKind,
        zone: &str,
    ) -> MusicResult<Vec<Origin>> {
        let mut tx = self.tx(conn).await?;
        let out = origins(tx.conn(), kind, zone).await?;
        tx.commit().await?;
        Ok(out)
    }

    /// Items of `kind` that originated with `signer`.
    pub async fn signer_origins(
        &self,
        conn: Option<&mut SqliteConnection>,
        kind: OriginKind,
        zone: &str,
        signer: &str,
    ) -> MusicResult<Vec<String>> {
        let all = self.list_origins(conn, kind, zone).await?;
        Ok(all
            .into_iter()
            .filter(|o| o.signer == signer)
            .map(|o| o.item)
            .collect())
    }

    pub async fn delete_origins_of_signer(
        &self,
        conn: Option<&mut SqliteConnection>,
        zone: &str,
        signer: &str,
    ) -> MusicResult<()> {
        let mut tx = self.tx(conn).await?;
        delete_signer_origins(tx.conn(), zone, signer).await?;
        tx.commit().await
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::temp_store;
    use super::*;

    fn ns(host: &str) -> DnsRecord {
        format!("example.com.\t3600\tIN\tNS\t{}", host).parse().unwrap()
    }

    #[tokio::test]
    async fn test_cache_holds_exactly_last_fetch() {
        let store = temp_store().await;
        let first = vec![ns("ns1.s1.net."), ns("ns2.s1.net.")];
        store
            .replace_rrset_cache("example.com.", "example.com.", "s1", QueryType::Ns, &first)
            .await
            .unwrap();

        let second = vec![ns("ns3.s1.net.")];
        store
            .replace_rrset_cache("example.com.", "example.com.", "s1", QueryType::Ns, &second)
            .await
            .unwrap();

        let cached = store
            .cached_rrset(None, "example.com.", "example.com.", "s1", QueryType::Ns)
            .await
            .unwrap();
        assert_eq!(cached, second);
        assert_eq!(cached[0].get_ttl(), 3600);

        store
            .replace_rrset_cache("example.com.", "example.com.", "s2", QueryType::Ns, &first)
            .await
            .unwrap();
        let all = store
            .list_rrset(None, "example.com.", "example.com.", QueryType::Ns)
            .await
            .unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all["s2"].len(), 2);
    }

    #[tokio::test]
    async fn test_origins_first_claim_wins() {
        let store = temp_store().await;
        assert!(store
            .record_dnskey_origin(None, "example.com.", "3-13-AAAA", "s1")
            .await
            .unwrap());
        assert!(!store
            .record_dnskey_origin(None, "example.com.", "3-13-AAAA", "s2")
            .await
            .unwrap());
        store
            .record_ns_origin(None, "example.com.", "ns1.s2.net.", "s2")
            .await
            .unwrap();

        let keys = store
            .signer_origins(None, OriginKind::Dnskey, "example.com.", "s1")
            .await
            .unwrap();
        assert_eq!(keys, vec!["3-13-AAAA".to_string()]);

        store
            .delete_origins_of_signer(None, "example.com.", "s2")
            .await
            .unwrap();
        assert!(store
            .list_origins(None, OriginKind::Ns, "example.com.")
            .await
            .unwrap()
            .is_empty());
        assert_eq!(
            store
                .list_origins(None, OriginKind::Dnskey, "example.com.")
                .await
                .unwrap()
                .len(),
            1
        );
    }
}
