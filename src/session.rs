use log::{error, trace};
use sqlx::{FromRow, Pool, Sqlite};

use crate::auth::SessionId;
use crate::Timestamp;

type Result<T> = std::result::Result<T, ()>;

/// The identity snapshot taken at login. The access guard re-checks
/// the user row before trusting it for a memo operation.
#[derive(Debug, Clone)]
pub struct SessionIdentity {
    pub user_id: i64,
    pub username: String,
}

#[derive(FromRow)]
struct SessionRow {
    user_id: i64,
    username: String,
    last_seen: Timestamp,
}

/// Constructed once at startup and handed to every request by
/// reference - session state is never ambient.
pub struct SessionManager {
    db: Pool<Sqlite>,
    ttl_seconds: i64,
}

impl SessionManager {
    pub fn new(db: Pool<Sqlite>, ttl_seconds: i64) -> Self {
        Self { db, ttl_seconds }
    }

    pub async fn create(&self, user_id: i64, username: &str) -> Result<SessionId> {
        let id = SessionId::new();
        let now = Timestamp::now()?;

        sqlx::query(
            "
            INSERT INTO sessions
            (token, user_id, username, created, last_seen)
            VALUES
            (?, ?, ?, ?, ?)
            ",
        )
        .bind(id.to_string())
        .bind(user_id)
        .bind(username)
        .bind(now)
        .bind(now)
        .execute(&self.db)
        .await
        .map_err(|e| {
            error!("error inserting session: {e:?}");
        })?;

        Ok(id)
    }

    /// Unknown, invalidated and expired tokens all come back as
    /// Ok(None). A live session has its inactivity window slid
    /// forward.
    pub async fn resolve(&self, id: &SessionId) -> Result<Option<SessionIdentity>> {
        let token = id.to_string();
        let now = Timestamp::now()?;

        let row = sqlx::query_as::<_, SessionRow>(
            "
            SELECT user_id, username, last_seen
            FROM sessions
            WHERE token = ?
            ",
        )
        .bind(&token)
        .fetch_optional(&self.db)
        .await
        .map_err(|e| {
            error!("error selecting session: {e:?}");
        })?;

        let Some(row) = row else {
            return Ok(None);
        };

        if now.seconds_since(row.last_seen) > self.ttl_seconds {
            trace!("session {id} expired, last seen {}", row.last_seen);
            self.invalidate(id).await?;
            return Ok(None);
        }

        sqlx::query(
            "
            UPDATE sessions
            SET last_seen = ?
            WHERE token = ?
            ",
        )
        .bind(now)
        .bind(&token)
        .execute(&self.db)
        .await
        .map_err(|e| {
            error!("error touching session: {e:?}");
        })?;

        Ok(Some(SessionIdentity {
            user_id: row.user_id,
            username: row.username,
        }))
    }

    /// Idempotent: deleting an absent token is a no-op.
    pub async fn invalidate(&self, id: &SessionId) -> Result<()> {
        sqlx::query(
            "
            DELETE FROM sessions
            WHERE token = ?
            ",
        )
        .bind(id.to_string())
        .execute(&self.db)
        .await
        .map(|_| ())
        .map_err(|e| {
            error!("error deleting session: {e:?}");
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::backend;

    const TTL: i64 = 60 * 60;

    async fn create_manager() -> SessionManager {
        SessionManager::new(backend::test::create_db().await, TTL)
    }

    #[tokio::test]
    async fn resolve_round_trips() {
        let sessions = create_manager().await;

        let id = sessions.create(7, "alice").await.unwrap();

        let identity = sessions.resolve(&id).await.unwrap().unwrap();
        assert_eq!(identity.user_id, 7);
        assert_eq!(identity.username, "alice");

        assert!(sessions.resolve(&SessionId::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn invalidate_is_idempotent() {
        let sessions = create_manager().await;

        let id = sessions.create(7, "alice").await.unwrap();

        sessions.invalidate(&id).await.unwrap();
        assert!(sessions.resolve(&id).await.unwrap().is_none());

        // again, and for a token that never existed
        sessions.invalidate(&id).await.unwrap();
        sessions.invalidate(&SessionId::new()).await.unwrap();
    }

    #[tokio::test]
    async fn inactivity_expires_sessions() {
        let sessions = create_manager().await;

        let id = sessions.create(7, "alice").await.unwrap();

        // backdate the session beyond the ttl
        sqlx::query("UPDATE sessions SET last_seen = last_seen - ?")
            .bind(TTL + 1)
            .execute(&sessions.db)
            .await
            .unwrap();

        assert!(sessions.resolve(&id).await.unwrap().is_none());

        // and the row itself is gone
        let remaining = sqlx::query("SELECT token FROM sessions")
            .fetch_all(&sessions.db)
            .await
            .unwrap();
        assert!(remaining.is_empty());
    }

    #[tokio::test]
    async fn resolve_slides_the_window() {
        let sessions = create_manager().await;

        let id = sessions.create(7, "alice").await.unwrap();

        // nearly expired..
        sqlx::query("UPDATE sessions SET last_seen = last_seen - ?")
            .bind(TTL - 10)
            .execute(&sessions.db)
            .await
            .unwrap();

        // ..but a resolve refreshes the window
        assert!(sessions.resolve(&id).await.unwrap().is_some());

        sqlx::query("UPDATE sessions SET last_seen = last_seen - ?")
            .bind(TTL - 10)
            .execute(&sessions.db)
            .await
            .unwrap();

        assert!(sessions.resolve(&id).await.unwrap().is_some());
    }
}
