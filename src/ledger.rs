//! Dedup Ledger: durable record of media already handled per pairing.
use crate::db::{self, Pool};
use anyhow::Result;
use tracing::{debug, info, instrument};

#[derive(Debug, Clone)]
pub struct DedupLedger {
    pool: Pool,
}

impl DedupLedger {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub async fn has(&self, pairing_id: i64, media_id: &str) -> Result<bool> {
        db::dedup_has(&self.pool, pairing_id, media_id).await
    }

    /// Record `media_id` as handled. Only call after a confirmed publish or a
    /// deliberate skip.
    #[instrument(skip(self))]
    pub async fn mark(&self, pairing_id: i64, media_id: &str) -> Result<()> {
        db::dedup_mark(&self.pool, pairing_id, media_id).await?;
        debug!(pairing_id, media_id, "ledger marked");
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn purge(&self, pairing_id: i64) -> Result<u64> {
        let removed = db::dedup_purge(&self.pool, pairing_id).await?;
        info!(pairing_id, removed, "ledger purged");
        Ok(removed)
    }

    pub async fn media_ids(&self, pairing_id: i64) -> Result<Vec<String>> {
        db::dedup_media_ids(&self.pool, pairing_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config;
    use crate::model::PairingOptions;
    use tempfile::TempDir;

    #[tokio::test]
    async fn mark_is_idempotent_and_purge_is_per_pairing() {
        let td = TempDir::new().unwrap();
        let url = format!("sqlite://{}", td.path().join("l.db").display());
        let pool = db::init_pool(&url).await.unwrap();
        db::run_migrations(&pool).await.unwrap();
        let cfg: config::Config = serde_yaml::from_str(config::example()).unwrap();
        let opts = PairingOptions::with_defaults(&cfg.scheduler);
        let uid = db::get_or_create_user(&pool, 3, None).await.unwrap();
        let p1 = db::insert_pairing(&pool, uid, "a", "x", &opts).await.unwrap();
        let p2 = db::insert_pairing(&pool, uid, "b", "x", &opts).await.unwrap();

        let ledger = DedupLedger::new(pool);
        assert!(!ledger.has(p1, "m1").await.unwrap());
        ledger.mark(p1, "m1").await.unwrap();
        ledger.mark(p1, "m1").await.unwrap();
        ledger.mark(p2, "m1").await.unwrap();
        assert!(ledger.has(p1, "m1").await.unwrap());
        assert_eq!(ledger.media_ids(p1).await.unwrap(), vec!["m1".to_string()]);

        assert_eq!(ledger.purge(p1).await.unwrap(), 1);
        assert!(!ledger.has(p1, "m1").await.unwrap());
        assert!(ledger.has(p2, "m1").await.unwrap());
    }
}
