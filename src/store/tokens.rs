//! Persisted hosted-API tokens

use chrono::{DateTime, Duration, Utc};
use sqlx::{Row, SqliteConnection};

use super::{from_unix, unix, Store};
use crate::errors::MusicResult;

/// Margin before `max_unused` expiry at which a token is refreshed
pub const REFRESH_MARGIN_SECS: i64 = 120;

/// A bearer token with its validity windows
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiToken {
    pub token: String,
    pub created: DateTime<Utc>,
    pub touched: DateTime<Utc>,
    pub max_unused: Duration,
    pub max_age: Duration,
}

impl ApiToken {
    /// True when the token must be replaced before the next call: it
    /// is about to go stale from disuse or about to reach its maximum age.
    pub fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        let margin = Duration::seconds(REFRESH_MARGIN_SECS);
        if self.token.is_empty() {
            return true;
        }
        if now > self.touched + self.max_unused - margin {
            return true;
        }
        self.max_age > Duration::zero() && now > self.created + self.max_age - margin
    }
}

impl Store {
    pub async fn save_token(
        &self,
        conn: Option<&mut SqliteConnection>,
        backend: &str,
        token: &ApiToken,
    ) -> MusicResult<()> {
        let mut tx = self.tx(conn).await?;
        sqlx::query(
            r#"
            INSERT INTO apitokens (backend, token, created, touched, maxunused, maxage)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (backend) DO UPDATE SET
                token = excluded.token, created = excluded.created, touched = excluded.touched,
                maxunused = excluded.maxunused, maxage = excluded.maxage
            "#,
        )
        .bind(backend)
        .bind(&token.token)
        .bind(unix(&token.created))
        .bind(unix(&token.touched))
        .bind(token.max_unused.num_seconds())
        .bind(token.max_age.num_seconds())
        .execute(tx.conn())
        .await?;
        tx.commit().await
    }

    pub async fn load_token(&self, conn: Option<&mut SqliteConnection>, backend: &str) -> MusicResult<Option<ApiToken>> {
        let mut tx = self.tx(conn).await?;
        let row = sqlx::query(
            "SELECT token, created, touched, maxunused, maxage FROM apitokens WHERE backend = ?",
        )
        .bind(backend)
        .fetch_optional(tx.conn())
        .await?;
        tx.commit().await?;

        match row {
            Some(row) => Ok(Some(ApiToken {
                token: row.try_get("token")?,
                created: from_unix(row.try_get("created")?),
                touched: from_unix(row.try_get("touched")?),
                max_unused: Duration::seconds(row.try_get("maxunused")?),
                max_age: Duration::seconds(row.try_get("maxage")?),
            })),
            None => Ok(None),
        }
    }

    /// Marks the token as used now.
    pub async fn touch_token(&self, conn: Option<&mut SqliteConnection>, backend: &str) -> MusicResult<()> {
        let mut tx = self.tx(conn).await?;
        sqlx::query("UPDATE apitokens SET touched = ? WHERE backend = ?")
            .bind(Utc::now().timestamp())
            .bind(backend)
            .execute(tx.conn())
            .await?;
        tx.commit().await
    }

    pub async fn clear_token(&self, conn: Option<&mut SqliteConnection>, backend: &str) -> MusicResult<()> {
        let mut tx = self.tx(conn).await?;
        sqlx::query("DELETE FROM apitokens WHERE backend = ?")
            .bind(backend)
            .execute(tx.conn())
            .await?;
        tx.commit().await
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::temp_store;
    use super::*;

    fn token(now: DateTime<Utc>) -> ApiToken {
        ApiToken {
            token: "abc".to_string(),
            created: now,
            touched: now,
            max_unused: Duration::hours(1),
            max_age: Duration::days(7),
        }
    }

    #[test]
    fn test_needs_refresh() {
        let now = Utc::now();
        let t = token(now);
        assert!(!t.needs_refresh(now));
        assert!(!t.needs_refresh(now + Duration::minutes(57)));
        assert!(t.needs_refresh(now + Duration::minutes(59)));

        let mut aged = token(now - Duration::days(7));
        aged.touched = now;
        assert!(aged.needs_refresh(now));

        let empty = ApiToken {
            token: String::new(),
            ..token(now)
        };
        assert!(empty.needs_refresh(now));
    }

    #[tokio::test]
    async fn test_token_persistence() {
        let store = temp_store().await;
        let now = from_unix(Utc::now().timestamp());
        assert!(store.load_token(None, "hosted").await.unwrap().is_none());

        store.save_token(None, "hosted", &token(now)).await.unwrap();
        let loaded = store.load_token(None, "hosted").await.unwrap().unwrap();
        assert_eq!(loaded, token(now));

        store.clear_token(None, "hosted").await.unwrap();
        assert!(store.load_token(None, "hosted").await.unwrap().is_none());
    }
}
