//! Inbound interface used by the chat front end.
//!
//! Every call is scoped to the chat identity (`tg_user_id`) that issued it;
//! pairings owned by someone else are reported as not found.
use crate::config::{self, Config};
use crate::db::{self, Pool};
use crate::error::{ConfigurationError, ServiceError};
use crate::instagram::InstagramService;
use crate::model::{AccountRole, Credentials, Pairing, PairingOptions, RunSummary};
use crate::scheduler::{JobState, Scheduler};
use chrono::{DateTime, Utc};
use reqwest::Url;
use std::sync::Arc;
use tracing::{info, instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingState {
    Scheduled(JobState),
    Paused,
    UserPaused,
    AuthSuspended,
    /// Schedulable but not in the registry yet (e.g. before `restore`).
    Inactive,
}

/// Last-run summary and schedule of one pairing.
#[derive(Debug, Clone)]
pub struct PairingStatus {
    pub pairing_id: i64,
    pub source_account: String,
    pub destination_account: String,
    pub options: PairingOptions,
    pub state: PairingState,
    pub next_run_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub last_run: Option<RunSummary>,
    pub last_reposted_at: Option<DateTime<Utc>>,
}

pub struct RepostService {
    pool: Pool,
    api: Arc<dyn InstagramService>,
    scheduler: Scheduler,
    policy: config::Scheduler,
}

fn normalize_account(raw: &str) -> Result<String, ConfigurationError> {
    let name = raw.trim().trim_start_matches('@').trim();
    if name.is_empty() {
        return Err(ConfigurationError::EmptyAccount);
    }
    Ok(name.to_string())
}

fn normalize_proxy(raw: Option<&str>) -> Result<Option<String>, ConfigurationError> {
    let Some(proxy) = raw.map(str::trim).filter(|p| !p.is_empty()) else {
        return Ok(None);
    };
    match Url::parse(proxy) {
        Ok(url) if matches!(url.scheme(), "http" | "https") && url.host().is_some() => {
            Ok(Some(proxy.to_string()))
        }
        _ => Err(ConfigurationError::InvalidProxy),
    }
}

impl RepostService {
    pub fn new(
        pool: Pool,
        api: Arc<dyn InstagramService>,
        scheduler: Scheduler,
        cfg: &Config,
    ) -> Self {
        Self {
            pool,
            api,
            scheduler,
            policy: cfg.scheduler.clone(),
        }
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    async fn user_id(&self, tg_user_id: i64) -> Result<i64, ServiceError> {
        db::find_user_id(&self.pool, tg_user_id)
            .await?
            .ok_or(ServiceError::UserNotFound(tg_user_id))
    }

    async fn owned_pairing(&self, tg_user_id: i64, pairing_id: i64) -> Result<Pairing, ServiceError> {
        let user_id = self.user_id(tg_user_id).await?;
        match db::fetch_pairing(&self.pool, pairing_id).await? {
            Some(p) if p.user_id == user_id => Ok(p),
            _ => Err(ServiceError::PairingNotFound(pairing_id)),
        }
    }

    /// Log in once, through the user's proxy when one is given, and store the
    /// session under both roles.
    async fn store_sessions(&self, user_id: i64, credentials: &Credentials) -> Result<(), ServiceError> {
        let credentials = Credentials {
            proxy: normalize_proxy(credentials.proxy.as_deref())?,
            ..credentials.clone()
        };
        let session = self
            .api
            .login(&credentials)
            .await
            .map_err(ServiceError::Login)?;
        let sessions = self.scheduler.sessions();
        sessions.put(user_id, AccountRole::Destination, &session).await?;
        sessions.put(user_id, AccountRole::Source, &session).await?;
        Ok(())
    }

    /// Log in, create the pairing and schedule its first run right away.
    #[instrument(skip(self, credentials, options))]
    pub async fn register_account(
        &self,
        tg_user_id: i64,
        username: Option<&str>,
        source: &str,
        destination: &str,
        credentials: &Credentials,
        options: Option<PairingOptions>,
    ) -> Result<i64, ServiceError> {
        let source = normalize_account(source)?;
        let destination = normalize_account(destination)?;
        if source.eq_ignore_ascii_case(&destination) {
            return Err(ConfigurationError::SameAccount.into());
        }
        let options = options.unwrap_or_else(|| PairingOptions::with_defaults(&self.policy));
        options.validate(&self.policy)?;

        let user_id = db::get_or_create_user(&self.pool, tg_user_id, username).await?;
        if db::find_pairing_id(&self.pool, user_id, &source, &destination)
            .await?
            .is_some()
        {
            return Err(ServiceError::DuplicatePairing {
                source_account: source,
                destination_account: destination,
            });
        }

        self.store_sessions(user_id, credentials).await?;
        let pairing_id =
            db::insert_pairing(&self.pool, user_id, &source, &destination, &options).await?;
        if let Some(pairing) = db::fetch_pairing(&self.pool, pairing_id).await? {
            if pairing.is_schedulable() {
                self.scheduler.activate(pairing_id, Utc::now()).await;
            }
        }
        info!(tg_user_id, pairing_id, %source, %destination, "pairing registered");
        Ok(pairing_id)
    }

    #[instrument(skip(self, options))]
    pub async fn update_options(
        &self,
        tg_user_id: i64,
        pairing_id: i64,
        options: PairingOptions,
    ) -> Result<(), ServiceError> {
        options.validate(&self.policy)?;
        let pairing = self.owned_pairing(tg_user_id, pairing_id).await?;
        db::update_pairing_options(&self.pool, pairing.id, &options).await?;
        if options.interval_minutes != pairing.options.interval_minutes {
            self.scheduler.reschedule(pairing.id, options.interval()).await;
        }
        Ok(())
    }

    /// Stop scheduling the pairing. A run in progress is allowed to finish.
    #[instrument(skip(self))]
    pub async fn pause(&self, tg_user_id: i64, pairing_id: i64) -> Result<(), ServiceError> {
        let pairing = self.owned_pairing(tg_user_id, pairing_id).await?;
        db::set_pairing_paused(&self.pool, pairing.id, true).await?;
        self.scheduler.cancel(pairing.id).await;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn resume(&self, tg_user_id: i64, pairing_id: i64) -> Result<(), ServiceError> {
        let pairing = self.owned_pairing(tg_user_id, pairing_id).await?;
        db::set_pairing_paused(&self.pool, pairing.id, false).await?;
        if !pairing.auth_suspended && !pairing.user_paused {
            self.scheduler.activate(pairing.id, Utc::now()).await;
        }
        Ok(())
    }

    /// Remove the pairing and its ledger once any in-flight run has ended.
    #[instrument(skip(self))]
    pub async fn delete(&self, tg_user_id: i64, pairing_id: i64) -> Result<(), ServiceError> {
        let pairing = self.owned_pairing(tg_user_id, pairing_id).await?;
        self.scheduler.cancel_and_wait(pairing.id).await;
        self.scheduler.ledger().purge(pairing.id).await?;
        db::delete_pairing(&self.pool, pairing.id).await?;
        info!(tg_user_id, pairing_id, "pairing deleted");
        Ok(())
    }

    pub async fn get_status(
        &self,
        tg_user_id: i64,
        pairing_id: i64,
    ) -> Result<PairingStatus, ServiceError> {
        let pairing = self.owned_pairing(tg_user_id, pairing_id).await?;
        self.status_of(pairing).await
    }

    pub async fn list_pairings(&self, tg_user_id: i64) -> Result<Vec<PairingStatus>, ServiceError> {
        let user_id = self.user_id(tg_user_id).await?;
        let mut out = Vec::new();
        for pairing in db::list_pairings_for_user(&self.pool, user_id).await? {
            out.push(self.status_of(pairing).await?);
        }
        Ok(out)
    }

    async fn status_of(&self, pairing: Pairing) -> Result<PairingStatus, ServiceError> {
        let job = self.scheduler.job(pairing.id).await;
        let record = db::fetch_run_record(&self.pool, pairing.id)
            .await?
            .unwrap_or_default();
        let state = if pairing.auth_suspended {
            PairingState::AuthSuspended
        } else if pairing.paused {
            PairingState::Paused
        } else if pairing.user_paused {
            PairingState::UserPaused
        } else {
            job.as_ref()
                .map_or(PairingState::Inactive, |j| PairingState::Scheduled(j.state))
        };
        Ok(PairingStatus {
            pairing_id: pairing.id,
            source_account: pairing.source_account,
            destination_account: pairing.destination_account,
            options: pairing.options,
            state,
            next_run_at: job.as_ref().map(|j| j.next_run_at),
            consecutive_failures: job.as_ref().map_or(0, |j| j.consecutive_failures),
            last_run: job
                .and_then(|j| j.last_run)
                .or_else(|| record.summary()),
            last_reposted_at: record.last_reposted_at,
        })
    }

    /// Global auto-repost switch for all of a user's pairings.
    #[instrument(skip(self))]
    pub async fn pause_user(&self, tg_user_id: i64) -> Result<(), ServiceError> {
        let user_id = self.user_id(tg_user_id).await?;
        db::set_user_paused(&self.pool, user_id, true).await?;
        for pairing in db::list_pairings_for_user(&self.pool, user_id).await? {
            self.scheduler.cancel(pairing.id).await;
        }
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn resume_user(&self, tg_user_id: i64) -> Result<usize, ServiceError> {
        let user_id = self.user_id(tg_user_id).await?;
        db::set_user_paused(&self.pool, user_id, false).await?;
        self.activate_schedulable(user_id).await
    }

    /// The re-login event: store fresh sessions and bring auth-suspended
    /// pairings back onto the schedule. Returns the number of active jobs
    /// (re)started for the user.
    #[instrument(skip(self, credentials))]
    pub async fn reauthenticate(
        &self,
        tg_user_id: i64,
        credentials: &Credentials,
    ) -> Result<usize, ServiceError> {
        let user_id = self.user_id(tg_user_id).await?;
        self.store_sessions(user_id, credentials).await?;
        let cleared = db::clear_auth_suspended_for_user(&self.pool, user_id).await?;
        info!(tg_user_id, cleared, "sessions renewed");
        self.activate_schedulable(user_id).await
    }

    async fn activate_schedulable(&self, user_id: i64) -> Result<usize, ServiceError> {
        let now = Utc::now();
        let mut activated = 0;
        for pairing in db::list_pairings_for_user(&self.pool, user_id).await? {
            if pairing.is_schedulable() && self.scheduler.job(pairing.id).await.is_none() {
                self.scheduler.activate(pairing.id, now).await;
                activated += 1;
            }
        }
        Ok(activated)
    }

    /// Forget a user entirely: jobs, pairings, ledgers and sessions.
    #[instrument(skip(self))]
    pub async fn delete_user(&self, tg_user_id: i64) -> Result<(), ServiceError> {
        let user_id = self.user_id(tg_user_id).await?;
        for pairing in db::list_pairings_for_user(&self.pool, user_id).await? {
            self.scheduler.cancel_and_wait(pairing.id).await;
            self.scheduler.ledger().purge(pairing.id).await?;
        }
        db::delete_user(&self.pool, user_id).await?;
        info!(tg_user_id, "user deleted");
        Ok(())
    }
}
