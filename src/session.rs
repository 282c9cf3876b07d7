//! Session Store: persisted platform sessions per (user, account role).
use crate::db::{self, Pool};
use crate::model::{AccountRole, Session};
use anyhow::Result;
use chrono::Utc;
use tracing::{info, instrument};

#[derive(Debug, Clone)]
pub struct SessionStore {
    pool: Pool,
}

impl SessionStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// The usable session for `(user_id, role)`. Missing, invalidated and
    /// expired sessions all come back as `None`, meaning "needs re-login".
    #[instrument(skip(self))]
    pub async fn get(&self, user_id: i64, role: AccountRole) -> Result<Option<Session>> {
        let session = db::fetch_session(&self.pool, user_id, role).await?;
        Ok(session.filter(|s| s.is_usable(Utc::now())))
    }

    #[instrument(skip(self, session))]
    pub async fn put(&self, user_id: i64, role: AccountRole, session: &Session) -> Result<()> {
        db::upsert_session(&self.pool, user_id, role, session).await
    }

    #[instrument(skip(self))]
    pub async fn invalidate(&self, user_id: i64, role: AccountRole) -> Result<()> {
        if db::invalidate_session(&self.pool, user_id, role).await? {
            info!(user_id, role = role.as_str(), "session invalidated");
        }
        Ok(())
    }
}
