//! Job Scheduler and the process-wide job registry.
//!
//! One job exists per active pairing. A job moves
//! `Idle -> Due -> Running -> (Success | Failed | AuthSuspended) -> Idle`;
//! auth-suspended jobs leave the registry until the user logs in again.
//! Each run holds the pairing's run lock for its whole duration, and a global
//! semaphore bounds how many pairings run at once.
use crate::config::Config;
use crate::db::{self, Pool};
use crate::error::PlatformError;
use crate::executor::RepostExecutor;
use crate::fetcher::Fetcher;
use crate::instagram::InstagramService;
use crate::ledger::DedupLedger;
use crate::model::{AccountRole, Pairing, RunOutcome, RunSummary};
use crate::notify::{Notification, Notifier};
use crate::retry::RetryPolicy;
use crate::session::SessionStore;
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Idle,
    Due,
    Running,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Idle => "IDLE",
            JobState::Due => "DUE",
            JobState::Running => "RUNNING",
        }
    }
}

/// In-memory schedule entry for one pairing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub pairing_id: i64,
    pub state: JobState,
    pub next_run_at: DateTime<Utc>,
    pub consecutive_failures: u32,
    pub last_run: Option<RunSummary>,
    /// Paused or deleted while running; dropped once the run ends.
    pub cancelled: bool,
}

impl Job {
    fn new(pairing_id: i64, next_run_at: DateTime<Utc>) -> Self {
        Self {
            pairing_id,
            state: JobState::Idle,
            next_run_at,
            consecutive_failures: 0,
            last_run: None,
            cancelled: false,
        }
    }
}

/// What a trigger did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    Completed(RunSummary),
    /// Another run of the same pairing holds the run lock.
    AlreadyRunning,
    /// No active job for the pairing (paused, suspended, deleted or unknown).
    NotScheduled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulePolicy {
    pub fetch_limit: usize,
    pub backoff_base: Duration,
    pub max_backoff: Duration,
    pub publish_delay: Duration,
    pub restart_grace: Duration,
    pub warn_after_failures: u32,
    pub auto_pause_after_failures: Option<u32>,
    pub max_concurrent_jobs: usize,
}

impl SchedulePolicy {
    pub fn from_config(cfg: &Config) -> Self {
        let s = &cfg.scheduler;
        Self {
            fetch_limit: s.fetch_limit,
            backoff_base: Duration::from_secs(s.backoff_base_seconds),
            max_backoff: Duration::from_secs(s.max_backoff_seconds),
            publish_delay: Duration::from_secs(s.publish_delay_seconds),
            restart_grace: Duration::from_secs(s.restart_grace_seconds),
            warn_after_failures: s.warn_after_failures,
            auto_pause_after_failures: s.auto_pause_after_failures,
            max_concurrent_jobs: cfg.app.max_concurrent_jobs,
        }
    }

    /// `backoff(n) = min(base * 2^n, max)`.
    pub fn backoff(&self, failures: u32) -> Duration {
        let factor = 1_u64 << failures.min(20);
        let secs = self.backoff_base.as_secs().saturating_mul(factor);
        Duration::from_secs(secs).min(self.max_backoff)
    }

    /// Delay after a failed run; a platform retry hint can only lengthen it.
    pub fn failure_delay(&self, failures: u32, retry_after: Option<Duration>) -> Duration {
        let delay = self.backoff(failures);
        match retry_after {
            Some(hint) if hint > delay => hint.min(self.max_backoff),
            _ => delay,
        }
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(365))
}

enum CycleEnd {
    Success,
    Failed {
        error: String,
        retry_after: Option<Duration>,
    },
    AuthSuspended {
        role: AccountRole,
        error: String,
    },
}

struct CycleReport {
    end: CycleEnd,
    published: u32,
    skipped: u32,
    last_reposted_at: Option<DateTime<Utc>>,
}

impl CycleReport {
    fn new() -> Self {
        Self {
            end: CycleEnd::Success,
            published: 0,
            skipped: 0,
            last_reposted_at: None,
        }
    }

    fn end(mut self, end: CycleEnd) -> Self {
        self.end = end;
        self
    }

    fn from_platform_error(self, err: PlatformError, role: AccountRole) -> Self {
        let end = match err {
            PlatformError::Auth(msg) => CycleEnd::AuthSuspended { role, error: msg },
            PlatformError::RateLimited { retry_after } => CycleEnd::Failed {
                error: "rate limited by platform".to_string(),
                retry_after,
            },
            other => CycleEnd::Failed {
                error: other.to_string(),
                retry_after: None,
            },
        };
        self.end(end)
    }
}

struct Inner {
    pool: Pool,
    sessions: SessionStore,
    ledger: DedupLedger,
    fetcher: Fetcher,
    executor: RepostExecutor,
    notifier: Arc<dyn Notifier>,
    policy: SchedulePolicy,
    registry: Mutex<HashMap<i64, Job>>,
    /// One run lock per pairing. Outlives cancel and re-activation so a run
    /// still waiting for a permit excludes runs of the re-activated job.
    run_locks: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
    permits: Arc<Semaphore>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(
        pool: Pool,
        api: Arc<dyn InstagramService>,
        notifier: Arc<dyn Notifier>,
        cfg: &Config,
    ) -> Self {
        let retry = RetryPolicy::from_config(&cfg.scheduler);
        let policy = SchedulePolicy::from_config(cfg);
        let permits = Arc::new(Semaphore::new(policy.max_concurrent_jobs.max(1)));
        Self {
            inner: Arc::new(Inner {
                sessions: SessionStore::new(pool.clone()),
                ledger: DedupLedger::new(pool.clone()),
                fetcher: Fetcher::new(api.clone(), retry),
                executor: RepostExecutor::new(api, retry),
                pool,
                notifier,
                policy,
                registry: Mutex::new(HashMap::new()),
                run_locks: Mutex::new(HashMap::new()),
                permits,
                handles: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.inner.sessions
    }

    pub fn ledger(&self) -> &DedupLedger {
        &self.inner.ledger
    }

    pub fn policy(&self) -> &SchedulePolicy {
        &self.inner.policy
    }

    /// Rebuild the registry from persisted pairings. Paused and
    /// auth-suspended pairings stay out.
    #[instrument(skip(self))]
    pub async fn restore(&self, now: DateTime<Utc>) -> Result<usize> {
        let pairings = db::list_all_pairings(&self.inner.pool).await?;
        let first_run = now + to_chrono(self.inner.policy.restart_grace);
        let mut registry = self.inner.registry.lock().await;
        let mut restored = 0;
        for pairing in pairings.iter().filter(|p| p.is_schedulable()) {
            registry.entry(pairing.id).or_insert_with(|| {
                restored += 1;
                Job::new(pairing.id, first_run)
            });
        }
        info!(restored, total = pairings.len(), "job registry restored");
        Ok(restored)
    }

    /// Add a job for `pairing_id`, or reset an existing one, due at `next_run_at`.
    pub async fn activate(&self, pairing_id: i64, next_run_at: DateTime<Utc>) {
        let mut registry = self.inner.registry.lock().await;
        let job = registry
            .entry(pairing_id)
            .or_insert_with(|| Job::new(pairing_id, next_run_at));
        job.cancelled = false;
        job.consecutive_failures = 0;
        job.next_run_at = next_run_at;
        debug!(pairing_id, %next_run_at, "job activated");
    }

    /// Cancel the next run. A running job finishes and is then dropped.
    /// Returns false when no job existed.
    pub async fn cancel(&self, pairing_id: i64) -> bool {
        let mut registry = self.inner.registry.lock().await;
        let running = match registry.get_mut(&pairing_id) {
            None => return false,
            Some(job) if job.state == JobState::Running => {
                job.cancelled = true;
                true
            }
            Some(_) => false,
        };
        if !running {
            registry.remove(&pairing_id);
        }
        debug!(pairing_id, running, "job cancelled");
        true
    }

    /// Cancel and wait until any in-flight run of the pairing has finished,
    /// then forget the pairing's run lock. Used when a pairing is deleted.
    pub async fn cancel_and_wait(&self, pairing_id: i64) {
        let lock = self.inner.run_lock(pairing_id).await;
        self.cancel(pairing_id).await;
        let _guard = lock.lock().await;
        self.inner.registry.lock().await.remove(&pairing_id);
        self.inner.run_locks.lock().await.remove(&pairing_id);
    }

    /// Move an idle job's next run to `last run + interval` after an
    /// interval change.
    pub async fn reschedule(&self, pairing_id: i64, interval: chrono::Duration) {
        let mut registry = self.inner.registry.lock().await;
        if let Some(job) = registry.get_mut(&pairing_id) {
            if job.state == JobState::Idle && job.consecutive_failures == 0 {
                if let Some(last) = &job.last_run {
                    job.next_run_at = last.finished_at + interval;
                }
            }
        }
    }

    pub async fn job(&self, pairing_id: i64) -> Option<Job> {
        let registry = self.inner.registry.lock().await;
        registry.get(&pairing_id).cloned()
    }

    pub async fn active_jobs(&self) -> usize {
        self.inner.registry.lock().await.len()
    }

    /// Spawn a run for every idle job whose time has come.
    #[instrument(skip(self))]
    pub async fn dispatch_due(&self, now: DateTime<Utc>) -> usize {
        let due: Vec<i64> = {
            let mut registry = self.inner.registry.lock().await;
            registry
                .values_mut()
                .filter(|job| job.state == JobState::Idle && job.next_run_at <= now)
                .map(|job| {
                    job.state = JobState::Due;
                    job.pairing_id
                })
                .collect()
        };

        let mut handles = self.inner.handles.lock().await;
        handles.retain(|h| !h.is_finished());
        for pairing_id in &due {
            let inner = self.inner.clone();
            let pairing_id = *pairing_id;
            handles.push(tokio::spawn(async move {
                match inner.execute(pairing_id).await {
                    Ok(trigger) => debug!(pairing_id, ?trigger, "job run finished"),
                    Err(err) => {
                        error!(?err, pairing_id, "job run aborted");
                        inner.recover_after_error(pairing_id, &err).await;
                    }
                }
            }));
        }
        due.len()
    }

    /// Run the pairing's job immediately, ignoring its next-run time but
    /// honouring the run lock and the concurrency limit.
    pub async fn run_now(&self, pairing_id: i64) -> Result<Trigger> {
        match self.inner.execute(pairing_id).await {
            Ok(trigger) => Ok(trigger),
            Err(err) => {
                self.inner.recover_after_error(pairing_id, &err).await;
                Err(err)
            }
        }
    }

    /// Tick until `shutdown` resolves, then wait for in-flight runs.
    pub async fn run<F>(&self, tick: Duration, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);
        info!(?tick, "scheduler started");
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = interval.tick() => {
                    let spawned = self.dispatch_due(Utc::now()).await;
                    if spawned > 0 {
                        debug!(spawned, "dispatched due jobs");
                    }
                }
            }
        }
        self.drain().await;
    }

    /// Wait for every spawned run to finish. Runs are never aborted.
    pub async fn drain(&self) {
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.inner.handles.lock().await);
        let pending = handles.len();
        for res in futures::future::join_all(handles).await {
            if let Err(err) = res {
                error!(?err, "job task panicked");
            }
        }
        info!(pending, "scheduler drained");
    }
}

impl Inner {
    async fn run_lock(&self, pairing_id: i64) -> Arc<Mutex<()>> {
        self.run_locks
            .lock()
            .await
            .entry(pairing_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn execute(self: &Arc<Self>, pairing_id: i64) -> Result<Trigger> {
        if !self.registry.lock().await.contains_key(&pairing_id) {
            return Ok(Trigger::NotScheduled);
        }
        let lock = self.run_lock(pairing_id).await;
        let Ok(_run_guard) = lock.try_lock_owned() else {
            debug!(pairing_id, "run lock held; skipping");
            self.settle_skipped(pairing_id).await;
            return Ok(Trigger::AlreadyRunning);
        };
        let _permit = self.permits.clone().acquire_owned().await?;

        let pairing = match db::fetch_pairing(&self.pool, pairing_id).await? {
            Some(p) if p.is_schedulable() => p,
            _ => {
                self.registry.lock().await.remove(&pairing_id);
                return Ok(Trigger::NotScheduled);
            }
        };

        {
            let mut registry = self.registry.lock().await;
            match registry.get_mut(&pairing_id) {
                Some(job) if !job.cancelled => job.state = JobState::Running,
                Some(_) => {
                    registry.remove(&pairing_id);
                    return Ok(Trigger::NotScheduled);
                }
                None => return Ok(Trigger::NotScheduled),
            }
        }

        let run_id = Uuid::new_v4().to_string();
        info!(pairing_id, %run_id, source = %pairing.source_account, "job running");
        let report = match self.cycle(&pairing).await {
            Ok(report) => report,
            Err(err) => {
                warn!(?err, pairing_id, "storage error during run");
                CycleReport::new().end(CycleEnd::Failed {
                    error: format!("storage error: {}", err),
                    retry_after: None,
                })
            }
        };
        let summary = self.finish(&pairing, run_id, report).await?;
        Ok(Trigger::Completed(summary))
    }

    /// One fetch, filter, publish pass. Platform errors end the pass and are
    /// reported in the returned report; only storage errors escape.
    async fn cycle(&self, pairing: &Pairing) -> Result<CycleReport> {
        let mut report = CycleReport::new();

        let Some(reader) = self.sessions.get(pairing.user_id, AccountRole::Source).await? else {
            return Ok(report.end(CycleEnd::AuthSuspended {
                role: AccountRole::Source,
                error: "no usable source session".to_string(),
            }));
        };

        let items = match self
            .fetcher
            .list_recent(&reader, &pairing.source_account, self.policy.fetch_limit)
            .await
        {
            Ok(items) => items,
            Err(err) => return Ok(report.from_platform_error(err, AccountRole::Source)),
        };

        // Oldest first, so an interrupted run leaves a contiguous prefix marked.
        let mut unseen = Vec::with_capacity(items.len());
        for item in items.into_iter().rev() {
            if !self.ledger.has(pairing.id, &item.id).await? {
                unseen.push(item);
            }
        }
        debug!(pairing_id = pairing.id, unseen = unseen.len(), "filtered against ledger");

        let mut attempted = 0_u32;
        for item in &unseen {
            if !pairing.options.content.allows(item.kind) {
                debug!(pairing_id = pairing.id, media_id = %item.id, kind = item.kind.as_str(), "content type disabled; skipping");
                self.ledger.mark(pairing.id, &item.id).await?;
                report.skipped += 1;
                continue;
            }

            let Some(writer) = self
                .sessions
                .get(pairing.user_id, AccountRole::Destination)
                .await?
            else {
                return Ok(report.end(CycleEnd::AuthSuspended {
                    role: AccountRole::Destination,
                    error: "no usable destination session".to_string(),
                }));
            };

            if attempted > 0 && !self.policy.publish_delay.is_zero() {
                tokio::time::sleep(self.policy.publish_delay).await;
            }
            attempted += 1;

            match self
                .executor
                .publish(
                    &writer,
                    &pairing.destination_account,
                    item,
                    &pairing.options,
                    &pairing.source_account,
                )
                .await
            {
                Ok(_) => {
                    self.ledger.mark(pairing.id, &item.id).await?;
                    report.published += 1;
                    report.last_reposted_at = Some(Utc::now());
                }
                Err(PlatformError::UnsupportedMedia(reason)) => {
                    warn!(pairing_id = pairing.id, media_id = %item.id, %reason, "unsupported media; marking seen");
                    self.ledger.mark(pairing.id, &item.id).await?;
                    report.skipped += 1;
                }
                Err(err) => return Ok(report.from_platform_error(err, AccountRole::Destination)),
            }
        }
        Ok(report)
    }

    /// Apply the run's outcome to the job, persist the summary and notify.
    async fn finish(
        &self,
        pairing: &Pairing,
        run_id: String,
        report: CycleReport,
    ) -> Result<RunSummary> {
        let now = Utc::now();
        let (outcome, error) = match &report.end {
            CycleEnd::Success => (RunOutcome::Success, None),
            CycleEnd::Failed { error, .. } => (RunOutcome::Failed, Some(error.clone())),
            CycleEnd::AuthSuspended { error, .. } => {
                (RunOutcome::AuthSuspended, Some(error.clone()))
            }
        };
        let summary = RunSummary {
            run_id,
            finished_at: now,
            outcome,
            published: report.published,
            skipped: report.skipped,
            error,
        };

        let mut notifications = Vec::new();
        let mut auto_pause = false;
        {
            let mut registry = self.registry.lock().await;
            let mut drop_job = false;
            if let Some(job) = registry.get_mut(&pairing.id) {
                job.state = JobState::Idle;
                job.last_run = Some(summary.clone());
                match &report.end {
                    CycleEnd::Success => {
                        job.consecutive_failures = 0;
                        job.next_run_at = now + pairing.options.interval();
                    }
                    CycleEnd::Failed { error, retry_after } => {
                        let delay = self
                            .policy
                            .failure_delay(job.consecutive_failures, *retry_after);
                        job.next_run_at = now + to_chrono(delay);
                        job.consecutive_failures += 1;
                        let failures = job.consecutive_failures;
                        if failures == self.policy.warn_after_failures {
                            notifications.push(Notification::SustainedFailure {
                                pairing_id: pairing.id,
                                source: pairing.source_account.clone(),
                                failures,
                                last_error: error.clone(),
                            });
                        }
                        if let Some(limit) = self.policy.auto_pause_after_failures {
                            if failures >= limit {
                                auto_pause = true;
                                drop_job = true;
                                notifications.push(Notification::AutoPaused {
                                    pairing_id: pairing.id,
                                    source: pairing.source_account.clone(),
                                    failures,
                                });
                            }
                        }
                        info!(pairing_id = pairing.id, failures, next_run_at = %job.next_run_at, "job failed; backing off");
                    }
                    CycleEnd::AuthSuspended { .. } => drop_job = true,
                }
                if job.cancelled {
                    drop_job = true;
                }
            }
            if drop_job {
                registry.remove(&pairing.id);
            }
        }

        if let CycleEnd::AuthSuspended { role, error } = &report.end {
            warn!(pairing_id = pairing.id, role = role.as_str(), %error, "job auth-suspended");
            self.sessions.invalidate(pairing.user_id, *role).await?;
            db::set_auth_suspended(&self.pool, pairing.id, true).await?;
            notifications.push(Notification::ReloginRequired {
                pairing_id: pairing.id,
                source: pairing.source_account.clone(),
                destination: pairing.destination_account.clone(),
            });
        }
        if auto_pause {
            warn!(pairing_id = pairing.id, "pairing auto-paused");
            db::set_pairing_paused(&self.pool, pairing.id, true).await?;
        }

        db::record_run(&self.pool, pairing.id, &summary, report.last_reposted_at).await?;

        for notification in notifications {
            if let Err(err) = self.notifier.notify(pairing.tg_user_id, notification).await {
                warn!(?err, pairing_id = pairing.id, "failed to deliver notification");
            }
        }
        info!(
            pairing_id = pairing.id,
            outcome = summary.outcome.as_str(),
            published = summary.published,
            skipped = summary.skipped,
            "job run complete"
        );
        Ok(summary)
    }

    /// A dispatched job that found its run lock taken goes back to idle.
    async fn settle_skipped(&self, pairing_id: i64) {
        let mut registry = self.registry.lock().await;
        if let Some(job) = registry.get_mut(&pairing_id) {
            if job.state == JobState::Due {
                job.state = JobState::Idle;
            }
        }
    }

    /// A run aborted by a storage error before or after the cycle: count it
    /// as a failure so the job is not left stuck in `Due` or `Running`.
    async fn recover_after_error(&self, pairing_id: i64, err: &anyhow::Error) {
        let now = Utc::now();
        let mut registry = self.registry.lock().await;
        if let Some(job) = registry.get_mut(&pairing_id) {
            if job.cancelled {
                registry.remove(&pairing_id);
                return;
            }
            job.state = JobState::Idle;
            job.next_run_at = now + to_chrono(self.policy.backoff(job.consecutive_failures));
            job.consecutive_failures += 1;
            warn!(pairing_id, error = %err, next_run_at = %job.next_run_at, "job rescheduled after error");
        }
    }
}
