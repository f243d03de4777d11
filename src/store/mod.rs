//! Persistent model: zones, signers, signer groups, the RRset cache,
//! zone metadata and the key origin tables, kept in one SQLite file.
//!
//! Every public operation takes an optional open connection. Passing
//! `None` makes the operation open (and commit) its own transaction;
//! passing the connection of an enclosing [`StoreTx`] lets callers
//! compose several operations into one transaction without nesting.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Sqlite, SqliteConnection, SqlitePool, Transaction};

use crate::errors::{MusicError, MusicResult};

pub mod groups;
pub mod metadata;
pub mod records;
pub mod signers;
pub mod tokens;
pub mod zones;

pub use tokens::ApiToken;

pub const STOP_REASON: &str = "stop-reason";
pub const DELAY_REASON: &str = "delay-reason";
pub const PARENT_ADDR: &str = "parentaddr";

/// A transaction that is either owned by the current operation or
/// borrowed from a caller that already opened one.
pub enum StoreTx<'a> {
    Owned(Transaction<'static, Sqlite>),
    Borrowed(&'a mut SqliteConnection),
}

impl<'a> StoreTx<'a> {
    pub fn conn(&mut self) -> &mut SqliteConnection {
        match self {
            StoreTx::Owned(tx) => &mut *tx,
            StoreTx::Borrowed(conn) => &mut **conn,
        }
    }

    /// Commits an owned transaction. A borrowed one is left for its
    /// owner to commit.
    pub async fn commit(self) -> MusicResult<()> {
        match self {
            StoreTx::Owned(tx) => tx.commit().await.map_err(MusicError::from),
            StoreTx::Borrowed(_) => Ok(()),
        }
    }
}

/// Record store
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
    /// Serializes RRset cache rewrites coming from the gateway
    cache_lock: Arc<tokio::sync::Mutex<()>>,
}

pub(crate) fn unix(ts: &DateTime<Utc>) -> i64 {
    ts.timestamp()
}

pub(crate) fn from_unix(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_default()
}

pub(crate) fn db_bool(v: i64) -> bool {
    v != 0
}

impl Store {
    /// Opens (or creates) the database file and makes sure every table
    /// exists.
    pub async fn open(path: &str) -> MusicResult<Store> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Store {
            pool,
            cache_lock: Arc::new(tokio::sync::Mutex::new(())),
        };
        store.initialize_schema().await?;
        log::info!("Opened record store {}", path);
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Borrows `outer` when given, otherwise begins a new transaction.
    pub async fn tx<'a>(&self, outer: Option<&'a mut SqliteConnection>) -> MusicResult<StoreTx<'a>> {
        match outer {
            Some(conn) => Ok(StoreTx::Borrowed(conn)),
            None => Ok(StoreTx::Owned(self.pool.begin().await?)),
        }
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Initialize database schema
    async fn initialize_schema(&self) -> MusicResult<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS zones (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                zonetype TEXT NOT NULL DEFAULT 'normal',
                state TEXT NOT NULL DEFAULT '',
                statestamp INTEGER NOT NULL DEFAULT 0,
                fsm TEXT NOT NULL DEFAULT '',
                fsmsigner TEXT NOT NULL DEFAULT '',
                fsmmode TEXT NOT NULL DEFAULT 'auto',
                fsmstatus TEXT NOT NULL DEFAULT '',
                sgroup TEXT NOT NULL DEFAULT '',
                UNIQUE (name)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS signers (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                method TEXT NOT NULL,
                auth TEXT NOT NULL DEFAULT '',
                address TEXT NOT NULL DEFAULT '',
                port INTEGER NOT NULL DEFAULT 53,
                usetcp INTEGER NOT NULL DEFAULT 1,
                usetsig INTEGER NOT NULL DEFAULT 1
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS signergroups (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                locked INTEGER NOT NULL DEFAULT 0,
                curprocess TEXT NOT NULL DEFAULT '',
                pendadd TEXT NOT NULL DEFAULT '',
                pendremove TEXT NOT NULL DEFAULT ''
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS group_signers (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                signer TEXT NOT NULL,
                UNIQUE (name, signer)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS zone_dnskeys (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                zone TEXT NOT NULL,
                dnskey TEXT NOT NULL,
                signer TEXT NOT NULL,
                UNIQUE (zone, dnskey)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS zone_nses (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                zone TEXT NOT NULL,
                ns TEXT NOT NULL,
                signer TEXT NOT NULL,
                UNIQUE (zone, ns)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                zone TEXT NOT NULL,
                owner TEXT NOT NULL,
                signer TEXT NOT NULL,
                rrtype INTEGER NOT NULL,
                rdata TEXT NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_records_key ON records(zone, owner, signer, rrtype)",
            r#"
            CREATE TABLE IF NOT EXISTS metadata (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                zone TEXT NOT NULL,
                key TEXT NOT NULL,
                time INTEGER NOT NULL DEFAULT 0,
                value TEXT NOT NULL DEFAULT '',
                UNIQUE (zone, key)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS apitokens (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                backend TEXT NOT NULL UNIQUE,
                token TEXT NOT NULL,
                created INTEGER NOT NULL,
                touched INTEGER NOT NULL,
                maxunused INTEGER NOT NULL,
                maxage INTEGER NOT NULL
            )
            "#,
        ];

        for statement in statements.iter() {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        Ok(())
    }
}

/// Zone type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ZoneType {
    Normal,
    Debug,
}

impl ZoneType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ZoneType::Normal => "normal",
            ZoneType::Debug => "debug",
        }
    }
}

impl FromStr for ZoneType {
    type Err = MusicError;

    fn from_str(s: &str) -> MusicResult<ZoneType> {
        match s {
            "" | "normal" => Ok(ZoneType::Normal),
            "debug" => Ok(ZoneType::Debug),
            _ => Err(MusicError::validation(format!("unknown zone type '{}'", s))),
        }
    }
}

impl fmt::Display for ZoneType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether the scheduler advances a zone on its own
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FsmMode {
    Auto,
    Manual,
}

impl FsmMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FsmMode::Auto => "auto",
            FsmMode::Manual => "manual",
        }
    }
}

impl FromStr for FsmMode {
    type Err = MusicError;

    fn from_str(s: &str) -> MusicResult<FsmMode> {
        match s {
            "" | "auto" => Ok(FsmMode::Auto),
            "manual" => Ok(FsmMode::Manual),
            _ => Err(MusicError::validation(format!("unknown fsm mode '{}'", s))),
        }
    }
}

impl fmt::Display for FsmMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a zone is not advancing, if it is not
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FsmStatus {
    #[serde(rename = "")]
    Ok,
    Blocked,
    Delayed,
}

impl FsmStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FsmStatus::Ok => "",
            FsmStatus::Blocked => "blocked",
            FsmStatus::Delayed => "delayed",
        }
    }

    pub fn parse(s: &str) -> FsmStatus {
        match s {
            "blocked" => FsmStatus::Blocked,
            "delayed" => FsmStatus::Delayed,
            _ => FsmStatus::Ok,
        }
    }
}

impl fmt::Display for FsmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A zone as loaded for one operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Zone {
    pub name: String,
    pub zonetype: ZoneType,
    pub state: String,
    pub statestamp: DateTime<Utc>,
    pub fsm: String,
    pub fsmsigner: String,
    pub fsmmode: FsmMode,
    pub fsmstatus: FsmStatus,
    pub sgroup: String,
    pub stop_reason: String,
    pub delay_reason: String,
    pub delay_until: Option<DateTime<Utc>>,
}

impl Zone {
    pub fn in_process(&self) -> bool {
        !self.fsm.is_empty()
    }
}

/// A signer as configured
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signer {
    pub name: String,
    pub method: String,
    pub auth: String,
    pub address: String,
    pub port: u16,
    pub usetcp: bool,
    pub usetsig: bool,
}

/// A signer group with its members
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignerGroup {
    pub name: String,
    pub locked: bool,
    pub curprocess: String,
    pub pendadd: String,
    pub pendremove: String,
    pub signers: Vec<Signer>,
    pub numzones: i64,
    pub numprocesszones: i64,
}

impl SignerGroup {
    pub fn signer_names(&self) -> Vec<String> {
        self.signers.iter().map(|s| s.name.clone()).collect()
    }

    pub fn has_member(&self, signer: &str) -> bool {
        self.signers.iter().any(|s| s.name == signer)
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::Store;

    pub async fn temp_store() -> Store {
        let path = std::env::temp_dir().join(format!("music-test-{}.db", uuid::Uuid::new_v4()));
        Store::open(&path.to_string_lossy()).await.unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::temp_store;
    use super::*;

    #[tokio::test]
    async fn test_open_is_idempotent() {
        let path = std::env::temp_dir().join(format!("music-test-{}.db", uuid::Uuid::new_v4()));
        let path = path.to_string_lossy().to_string();
        let store = Store::open(&path).await.unwrap();
        store.close().await;
        let store = Store::open(&path).await.unwrap();
        assert!(store.list_zones(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_borrowed_tx_is_not_committed_by_callee() {
        let store = temp_store().await;

        let mut tx = store.tx(None).await.unwrap();
        store
            .add_zone(Some(tx.conn()), "example.com.", ZoneType::Normal, FsmMode::Auto)
            .await
            .unwrap();
        // dropping the owned transaction rolls it back
        drop(tx);

        assert!(store.get_zone(None, "example.com.").await.is_err());
    }

    #[test]
    fn test_status_strings() {
        assert_eq!(FsmStatus::parse("blocked"), FsmStatus::Blocked);
        assert_eq!(FsmStatus::parse(""), FsmStatus::Ok);
        assert_eq!(FsmStatus::Delayed.to_string(), "delayed");
        assert!("sideways".parse::<FsmMode>().is_err());
    }
}
