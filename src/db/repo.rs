use super::model::RunRecord;
use crate::model::{AccountRole, Pairing, PairingOptions, RunOutcome, RunSummary, Session};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous};
use sqlx::Row;
use sqlx::SqlitePool;
use std::str::FromStr;
use tracing::instrument;

pub type Pool = SqlitePool;

const PAIRING_SELECT: &str = "SELECT p.id, p.user_id, u.tg_user_id, p.source_account, \
     p.destination_account, p.options, p.paused, p.auth_suspended, u.paused AS user_paused \
     FROM pairings p JOIN users u ON u.id = p.user_id";

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    // WAL with full sync: the ledger must survive a crash right after a publish.
    let options = SqliteConnectOptions::from_str(&normalized)
        .with_context(|| format!("invalid database URL {}", normalized))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full)
        .foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await
        .context("failed to open SQLite database")?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched. Returns possibly-updated URL.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// users

#[instrument(skip_all)]
pub async fn get_or_create_user(pool: &Pool, tg_user_id: i64, username: Option<&str>) -> Result<i64> {
    if let Some(id) = find_user_id(pool, tg_user_id).await? {
        return Ok(id);
    }
    let mut tx = pool.begin().await?;
    let id: i64 = sqlx::query(
        "INSERT INTO users (tg_user_id, username, paused, created_at) VALUES (?, ?, 0, ?) RETURNING id",
    )
    .bind(tg_user_id)
    .bind(username)
    .bind(Utc::now())
    .fetch_one(&mut *tx)
    .await?
    .get("id");
    tx.commit().await?;
    Ok(id)
}

#[instrument(skip_all)]
pub async fn find_user_id(pool: &Pool, tg_user_id: i64) -> Result<Option<i64>> {
    let id = sqlx::query_scalar::<_, i64>("SELECT id FROM users WHERE tg_user_id = ?")
        .bind(tg_user_id)
        .fetch_optional(pool)
        .await?;
    Ok(id)
}

#[instrument(skip_all)]
pub async fn set_user_paused(pool: &Pool, user_id: i64, paused: bool) -> Result<()> {
    sqlx::query("UPDATE users SET paused = ? WHERE id = ?")
        .bind(paused)
        .bind(user_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Delete a user; pairings, sessions and ledger rows cascade.
#[instrument(skip_all)]
pub async fn delete_user(pool: &Pool, user_id: i64) -> Result<()> {
    sqlx::query("DELETE FROM users WHERE id = ?")
        .bind(user_id)
        .execute(pool)
        .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// pairings

fn pairing_from_row(row: &SqliteRow) -> Result<Pairing> {
    let raw: String = row.get("options");
    let options: PairingOptions =
        serde_json::from_str(&raw).context("corrupt pairing options column")?;
    Ok(Pairing {
        id: row.get("id"),
        user_id: row.get("user_id"),
        tg_user_id: row.get("tg_user_id"),
        source_account: row.get("source_account"),
        destination_account: row.get("destination_account"),
        options,
        paused: row.get("paused"),
        auth_suspended: row.get("auth_suspended"),
        user_paused: row.get("user_paused"),
    })
}

#[instrument(skip_all)]
pub async fn find_pairing_id(
    pool: &Pool,
    user_id: i64,
    source_account: &str,
    destination_account: &str,
) -> Result<Option<i64>> {
    let id = sqlx::query_scalar::<_, i64>(
        "SELECT id FROM pairings WHERE user_id = ? AND source_account = ? AND destination_account = ?",
    )
    .bind(user_id)
    .bind(source_account)
    .bind(destination_account)
    .fetch_optional(pool)
    .await?;
    Ok(id)
}

#[instrument(skip_all)]
pub async fn insert_pairing(
    pool: &Pool,
    user_id: i64,
    source_account: &str,
    destination_account: &str,
    options: &PairingOptions,
) -> Result<i64> {
    let now = Utc::now();
    let mut tx = pool.begin().await?;
    let id: i64 = sqlx::query(
        "INSERT INTO pairings (user_id, source_account, destination_account, options, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(user_id)
    .bind(source_account)
    .bind(destination_account)
    .bind(serde_json::to_string(options)?)
    .bind(now)
    .bind(now)
    .fetch_one(&mut *tx)
    .await?
    .get("id");
    tx.commit().await?;
    Ok(id)
}

#[instrument(skip_all)]
pub async fn fetch_pairing(pool: &Pool, pairing_id: i64) -> Result<Option<Pairing>> {
    let row = sqlx::query(&format!("{} WHERE p.id = ?", PAIRING_SELECT))
        .bind(pairing_id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(pairing_from_row).transpose()
}

#[instrument(skip_all)]
pub async fn list_pairings_for_user(pool: &Pool, user_id: i64) -> Result<Vec<Pairing>> {
    let rows = sqlx::query(&format!("{} WHERE p.user_id = ? ORDER BY p.id", PAIRING_SELECT))
        .bind(user_id)
        .fetch_all(pool)
        .await?;
    rows.iter().map(pairing_from_row).collect()
}

#[instrument(skip_all)]
pub async fn list_all_pairings(pool: &Pool) -> Result<Vec<Pairing>> {
    let rows = sqlx::query(&format!("{} ORDER BY p.id", PAIRING_SELECT))
        .fetch_all(pool)
        .await?;
    rows.iter().map(pairing_from_row).collect()
}

#[instrument(skip_all)]
pub async fn update_pairing_options(pool: &Pool, pairing_id: i64, options: &PairingOptions) -> Result<()> {
    sqlx::query("UPDATE pairings SET options = ?, updated_at = ? WHERE id = ?")
        .bind(serde_json::to_string(options)?)
        .bind(Utc::now())
        .bind(pairing_id)
        .execute(pool)
        .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn set_pairing_paused(pool: &Pool, pairing_id: i64, paused: bool) -> Result<()> {
    sqlx::query("UPDATE pairings SET paused = ?, updated_at = ? WHERE id = ?")
        .bind(paused)
        .bind(Utc::now())
        .bind(pairing_id)
        .execute(pool)
        .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn set_auth_suspended(pool: &Pool, pairing_id: i64, suspended: bool) -> Result<()> {
    sqlx::query("UPDATE pairings SET auth_suspended = ?, updated_at = ? WHERE id = ?")
        .bind(suspended)
        .bind(Utc::now())
        .bind(pairing_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Clear the auth-suspended flag on all of a user's pairings.
#[instrument(skip_all)]
pub async fn clear_auth_suspended_for_user(pool: &Pool, user_id: i64) -> Result<u64> {
    let res = sqlx::query(
        "UPDATE pairings SET auth_suspended = 0, updated_at = ? WHERE user_id = ? AND auth_suspended = 1",
    )
    .bind(Utc::now())
    .bind(user_id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected())
}

#[instrument(skip_all)]
pub async fn record_run(
    pool: &Pool,
    pairing_id: i64,
    summary: &RunSummary,
    reposted_at: Option<DateTime<Utc>>,
) -> Result<()> {
    sqlx::query(
        "UPDATE pairings SET last_run_id = ?, last_run_at = ?, last_outcome = ?, last_error = ?, \
         last_published = ?, last_skipped = ?, last_reposted_at = COALESCE(?, last_reposted_at) \
         WHERE id = ?",
    )
    .bind(&summary.run_id)
    .bind(summary.finished_at)
    .bind(summary.outcome.as_str())
    .bind(summary.error.as_deref())
    .bind(i64::from(summary.published))
    .bind(i64::from(summary.skipped))
    .bind(reposted_at)
    .bind(pairing_id)
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn fetch_run_record(pool: &Pool, pairing_id: i64) -> Result<Option<RunRecord>> {
    let row = sqlx::query(
        "SELECT last_run_id, last_run_at, last_outcome, last_error, last_published, last_skipped, \
         last_reposted_at FROM pairings WHERE id = ?",
    )
    .bind(pairing_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|row| {
        let outcome: Option<String> = row.get("last_outcome");
        RunRecord {
            last_run_id: row.get("last_run_id"),
            last_run_at: row.get("last_run_at"),
            last_outcome: outcome.as_deref().and_then(RunOutcome::parse),
            last_error: row.get("last_error"),
            last_published: row.get("last_published"),
            last_skipped: row.get("last_skipped"),
            last_reposted_at: row.get("last_reposted_at"),
        }
    }))
}

#[instrument(skip_all)]
pub async fn delete_pairing(pool: &Pool, pairing_id: i64) -> Result<()> {
    sqlx::query("DELETE FROM pairings WHERE id = ?")
        .bind(pairing_id)
        .execute(pool)
        .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// sessions

#[instrument(skip_all)]
pub async fn upsert_session(pool: &Pool, user_id: i64, role: AccountRole, session: &Session) -> Result<()> {
    sqlx::query(
        "INSERT INTO sessions (user_id, role, account, token, expires_at, valid, proxy, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT(user_id, role) DO UPDATE SET account = excluded.account, token = excluded.token, \
         expires_at = excluded.expires_at, valid = excluded.valid, proxy = excluded.proxy, \
         updated_at = excluded.updated_at",
    )
    .bind(user_id)
    .bind(role.as_str())
    .bind(&session.account)
    .bind(&session.token)
    .bind(session.expires_at)
    .bind(session.valid)
    .bind(&session.proxy)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn fetch_session(pool: &Pool, user_id: i64, role: AccountRole) -> Result<Option<Session>> {
    let row = sqlx::query(
        "SELECT account, token, expires_at, valid, proxy FROM sessions WHERE user_id = ? AND role = ?",
    )
    .bind(user_id)
    .bind(role.as_str())
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|row| Session {
        account: row.get("account"),
        token: row.get("token"),
        expires_at: row.get("expires_at"),
        valid: row.get("valid"),
        proxy: row.get("proxy"),
    }))
}

/// Returns true when a session row existed.
#[instrument(skip_all)]
pub async fn invalidate_session(pool: &Pool, user_id: i64, role: AccountRole) -> Result<bool> {
    let res = sqlx::query("UPDATE sessions SET valid = 0, updated_at = ? WHERE user_id = ? AND role = ?")
        .bind(Utc::now())
        .bind(user_id)
        .bind(role.as_str())
        .execute(pool)
        .await?;
    Ok(res.rows_affected() > 0)
}

// ---------------------------------------------------------------------------
// dedup ledger

#[instrument(skip_all)]
pub async fn dedup_has(pool: &Pool, pairing_id: i64, media_id: &str) -> Result<bool> {
    let hit = sqlx::query_scalar::<_, i64>(
        "SELECT 1 FROM dedup_records WHERE pairing_id = ? AND media_id = ?",
    )
    .bind(pairing_id)
    .bind(media_id)
    .fetch_optional(pool)
    .await?;
    Ok(hit.is_some())
}

/// Idempotent: marking an id twice keeps a single record.
#[instrument(skip_all)]
pub async fn dedup_mark(pool: &Pool, pairing_id: i64, media_id: &str) -> Result<()> {
    sqlx::query("INSERT OR IGNORE INTO dedup_records (pairing_id, media_id, marked_at) VALUES (?, ?, ?)")
        .bind(pairing_id)
        .bind(media_id)
        .bind(Utc::now())
        .execute(pool)
        .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn dedup_purge(pool: &Pool, pairing_id: i64) -> Result<u64> {
    let res = sqlx::query("DELETE FROM dedup_records WHERE pairing_id = ?")
        .bind(pairing_id)
        .execute(pool)
        .await?;
    Ok(res.rows_affected())
}

#[instrument(skip_all)]
pub async fn dedup_media_ids(pool: &Pool, pairing_id: i64) -> Result<Vec<String>> {
    let ids = sqlx::query_scalar::<_, String>(
        "SELECT media_id FROM dedup_records WHERE pairing_id = ? ORDER BY media_id",
    )
    .bind(pairing_id)
    .fetch_all(pool)
    .await?;
    Ok(ids)
}
