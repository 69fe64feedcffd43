//! Status poller
//!
//! Tracks in-flight jobs on sites that cannot push status and asks their
//! run capability for the current state. Each tracked job polls on its own
//! cadence: the interval resets to the base whenever the observed status
//! changes and grows by the base each quiet cycle, up to the ceiling, so a
//! long-queued batch job costs one probe every few minutes instead of one
//! every few seconds.
//!
//! Observed events go through the hub like every other event; the poller
//! stops tracking a job once its status is terminal.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, error, warn};
use uuid::Uuid;

use gantry_core::domain::job::JobContext;
use gantry_core::domain::status::JobStatus;
use gantry_site::registry::SiteRegistry;

use crate::hub::StatusHub;

struct TrackedJob {
    context: JobContext,
    last_status: JobStatus,
    interval: Duration,
    next_poll: Instant,
}

pub struct StatusPoller {
    registry: Arc<SiteRegistry>,
    hub: Arc<StatusHub>,
    base_interval: Duration,
    max_interval: Duration,
    tracked: Mutex<HashMap<Uuid, TrackedJob>>,
}

impl StatusPoller {
    pub fn new(
        registry: Arc<SiteRegistry>,
        hub: Arc<StatusHub>,
        base_interval: Duration,
        max_interval: Duration,
    ) -> Self {
        Self {
            registry,
            hub,
            base_interval,
            max_interval,
            tracked: Mutex::new(HashMap::new()),
        }
    }

    /// Start polling a job. Tracking an already tracked job changes nothing.
    pub async fn track(&self, context: JobContext) {
        let mut tracked = self.tracked.lock().await;
        tracked.entry(context.job_id).or_insert_with(|| {
            debug!(job_id = %context.job_id, site = %context.site_name, "tracking job");
            TrackedJob {
                context,
                last_status: JobStatus::Unknown,
                interval: self.base_interval,
                next_poll: Instant::now(),
            }
        });
    }

    pub async fn untrack(&self, job_id: Uuid) {
        if self.tracked.lock().await.remove(&job_id).is_some() {
            debug!(%job_id, "stopped tracking job");
        }
    }

    pub async fn tracked_count(&self) -> usize {
        self.tracked.lock().await.len()
    }

    /// Poll every job whose next probe is due. Returns how many were polled.
    ///
    /// Each due job is probed in its own task, so one stalled remote command
    /// delays only its own job's observation.
    pub async fn poll_due(self: &Arc<Self>) -> usize {
        let now = Instant::now();
        let due: Vec<JobContext> = {
            let tracked = self.tracked.lock().await;
            tracked
                .values()
                .filter(|job| job.next_poll <= now)
                .map(|job| job.context.clone())
                .collect()
        };

        let mut probes = tokio::task::JoinSet::new();
        for context in due.iter().cloned() {
            let poller = self.clone();
            probes.spawn(async move { poller.poll_one(&context, now).await });
        }
        while probes.join_next().await.is_some() {}
        due.len()
    }

    async fn poll_one(&self, context: &JobContext, now: Instant) {
        let Some(site) = self.registry.lookup(&context.site_name).await else {
            warn!(site = %context.site_name, "tracked job's site is not registered");
            self.delay(context.job_id, now).await;
            return;
        };

        match site.run().job_status(context).await {
            Ok(event) => {
                let status = event.status;
                if let Err(e) = self.hub.emit(event).await {
                    error!("failed to record polled status: {}", e);
                }

                let mut tracked = self.tracked.lock().await;
                if status.is_terminal() {
                    tracked.remove(&context.job_id);
                    debug!(job_id = %context.job_id, %status, "job reached terminal status");
                    return;
                }
                if let Some(job) = tracked.get_mut(&context.job_id) {
                    job.interval = if status != job.last_status {
                        self.base_interval
                    } else {
                        (job.interval + self.base_interval).min(self.max_interval)
                    };
                    job.last_status = status;
                    job.next_poll = now + job.interval;
                }
            }
            Err(e) if e.is_unsupported() => {
                // the site cannot answer; polling again will not help
                warn!(
                    job_id = %context.job_id,
                    site = %context.site_name,
                    "site does not support status queries, dropping job from poller"
                );
                self.untrack(context.job_id).await;
            }
            Err(e) => {
                warn!(job_id = %context.job_id, "status poll failed: {}", e);
                self.delay(context.job_id, now).await;
            }
        }
    }

    /// Back the job's next probe off without a status observation.
    async fn delay(&self, job_id: Uuid, now: Instant) {
        let mut tracked = self.tracked.lock().await;
        if let Some(job) = tracked.get_mut(&job_id) {
            job.interval = (job.interval + self.base_interval).min(self.max_interval);
            job.next_poll = now + job.interval;
        }
    }

    pub fn run(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = time::interval(self.base_interval);
            ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.poll_due().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory_pool;
    use crate::store::status_store;
    use async_trait::async_trait;
    use gantry_core::domain::job::JobDefn;
    use gantry_core::domain::status::StatusEvent;
    use gantry_core::error::{SiteError, SiteResult};
    use gantry_site::capability::{Site, SiteAuth, SiteRun, UnsupportedRepo, UnsupportedSpin};
    use std::collections::VecDeque;

    struct StubAuth;

    #[async_trait]
    impl SiteAuth for StubAuth {
        async fn login(&self, _force: bool) -> SiteResult<bool> {
            Ok(true)
        }

        async fn is_auth_current(&self) -> SiteResult<bool> {
            Ok(true)
        }
    }

    struct ScriptedRun {
        statuses: std::sync::Mutex<VecDeque<SiteResult<JobStatus>>>,
    }

    #[async_trait]
    impl SiteRun for ScriptedRun {
        async fn submit_job(
            &self,
            _defn: &JobDefn,
            _context: JobContext,
        ) -> SiteResult<StatusEvent> {
            Err(SiteError::unsupported("run.submit_job"))
        }

        async fn job_status(&self, context: &JobContext) -> SiteResult<StatusEvent> {
            match self.statuses.lock().unwrap().pop_front() {
                Some(Ok(status)) => Ok(StatusEvent::new(context.clone(), status)),
                Some(Err(e)) => Err(e),
                None => Ok(StatusEvent::new(context.clone(), JobStatus::Unknown)),
            }
        }
    }

    async fn poller_with(
        script: Vec<SiteResult<JobStatus>>,
        base: Duration,
        max: Duration,
    ) -> (Arc<StatusPoller>, sqlx::SqlitePool) {
        let registry = Arc::new(SiteRegistry::new());
        registry
            .register(
                Site::new(
                    "batch",
                    Arc::new(StubAuth),
                    Arc::new(ScriptedRun {
                        statuses: std::sync::Mutex::new(script.into()),
                    }),
                    Arc::new(UnsupportedRepo),
                    Arc::new(UnsupportedSpin),
                )
                .with_status_polling(),
            )
            .await;

        let pool = memory_pool().await;
        let hub = Arc::new(StatusHub::new(pool.clone(), 16));
        let poller = Arc::new(StatusPoller::new(registry, hub, base, max));
        (poller, pool)
    }

    #[tokio::test]
    async fn polls_until_terminal_then_untracks() {
        let (poller, pool) = poller_with(
            vec![
                Ok(JobStatus::Pending),
                Ok(JobStatus::Running),
                Ok(JobStatus::Complete),
            ],
            Duration::from_millis(1),
            Duration::from_millis(5),
        )
        .await;

        let ctx = JobContext::new("batch");
        poller.track(ctx.clone()).await;

        for _ in 0..3 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            poller.poll_due().await;
        }

        assert_eq!(poller.tracked_count().await, 0);
        let history = status_store::history(&pool, ctx.job_id).await.unwrap();
        let statuses: Vec<_> = history.iter().map(|e| e.status).collect();
        assert_eq!(
            statuses,
            vec![JobStatus::Pending, JobStatus::Running, JobStatus::Complete]
        );
    }

    #[tokio::test]
    async fn interval_backs_off_while_unchanged_and_resets_on_change() {
        let base = Duration::from_millis(10);
        let max = Duration::from_millis(25);
        let (poller, _pool) = poller_with(
            vec![
                Ok(JobStatus::Running),
                Ok(JobStatus::Running),
                Ok(JobStatus::Running),
                Ok(JobStatus::Finishing),
            ],
            base,
            max,
        )
        .await;

        let ctx = JobContext::new("batch");
        poller.track(ctx.clone()).await;

        // Unknown -> Running is a change, back to base
        poller.poll_due().await;
        assert_eq!(interval_of(&poller, ctx.job_id).await, base);

        // two quiet polls grow the interval, capped at the ceiling
        tokio::time::sleep(Duration::from_millis(30)).await;
        poller.poll_due().await;
        assert_eq!(interval_of(&poller, ctx.job_id).await, Duration::from_millis(20));

        tokio::time::sleep(Duration::from_millis(30)).await;
        poller.poll_due().await;
        assert_eq!(interval_of(&poller, ctx.job_id).await, max);

        // Running -> Finishing resets the cadence
        tokio::time::sleep(Duration::from_millis(30)).await;
        poller.poll_due().await;
        assert_eq!(interval_of(&poller, ctx.job_id).await, base);
    }

    #[tokio::test]
    async fn a_stalled_probe_does_not_delay_other_jobs() {
        struct StalledRun;

        #[async_trait]
        impl SiteRun for StalledRun {
            async fn submit_job(
                &self,
                _defn: &JobDefn,
                _context: JobContext,
            ) -> SiteResult<StatusEvent> {
                Err(SiteError::unsupported("run.submit_job"))
            }

            async fn job_status(&self, context: &JobContext) -> SiteResult<StatusEvent> {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(StatusEvent::new(context.clone(), JobStatus::Unknown))
            }
        }

        let registry = Arc::new(SiteRegistry::new());
        registry
            .register(
                Site::new(
                    "batch",
                    Arc::new(StubAuth),
                    Arc::new(ScriptedRun {
                        statuses: std::sync::Mutex::new(
                            vec![Ok(JobStatus::Running)].into(),
                        ),
                    }),
                    Arc::new(UnsupportedRepo),
                    Arc::new(UnsupportedSpin),
                )
                .with_status_polling(),
            )
            .await;
        registry
            .register(
                Site::new(
                    "stuck",
                    Arc::new(StubAuth),
                    Arc::new(StalledRun),
                    Arc::new(UnsupportedRepo),
                    Arc::new(UnsupportedSpin),
                )
                .with_status_polling(),
            )
            .await;

        let pool = memory_pool().await;
        let hub = Arc::new(StatusHub::new(pool.clone(), 16));
        let poller = Arc::new(StatusPoller::new(
            registry,
            hub,
            Duration::from_millis(1),
            Duration::from_millis(5),
        ));

        let stalled = JobContext::new("stuck");
        let quick = JobContext::new("batch");
        poller.track(stalled.clone()).await;
        poller.track(quick.clone()).await;

        let probing = {
            let poller = poller.clone();
            tokio::spawn(async move { poller.poll_due().await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        // the quick job's observation landed while the stalled probe hangs
        let history = status_store::history(&pool, quick.job_id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, JobStatus::Running);
        assert!(
            status_store::history(&pool, stalled.job_id)
                .await
                .unwrap()
                .is_empty()
        );
        probing.abort();
    }

    #[tokio::test]
    async fn jobs_not_yet_due_are_skipped() {
        let (poller, _pool) = poller_with(
            vec![Ok(JobStatus::Running), Ok(JobStatus::Running)],
            Duration::from_secs(60),
            Duration::from_secs(300),
        )
        .await;

        let ctx = JobContext::new("batch");
        poller.track(ctx.clone()).await;

        assert_eq!(poller.poll_due().await, 1);
        // next probe is a minute out
        assert_eq!(poller.poll_due().await, 0);
    }

    #[tokio::test]
    async fn transient_errors_keep_the_job_tracked() {
        let (poller, _pool) = poller_with(
            vec![Err(SiteError::TransientConnection("lost".into()))],
            Duration::from_millis(1),
            Duration::from_millis(5),
        )
        .await;

        let ctx = JobContext::new("batch");
        poller.track(ctx.clone()).await;
        poller.poll_due().await;
        assert_eq!(poller.tracked_count().await, 1);
    }

    #[tokio::test]
    async fn unsupported_status_queries_drop_the_job() {
        let (poller, _pool) = poller_with(
            vec![Err(SiteError::unsupported("run.job_status"))],
            Duration::from_millis(1),
            Duration::from_millis(5),
        )
        .await;

        let ctx = JobContext::new("batch");
        poller.track(ctx.clone()).await;
        poller.poll_due().await;
        assert_eq!(poller.tracked_count().await, 0);
    }

    async fn interval_of(poller: &StatusPoller, job_id: Uuid) -> Duration {
        poller
            .tracked
            .lock()
            .await
            .get(&job_id)
            .map(|job| job.interval)
            .unwrap()
    }
}
