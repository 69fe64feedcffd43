//! Site capability traits
//!
//! A site is polymorphic over four independently-optional capability groups:
//! Auth, Run, Repo and Spin. Verbs a site's native system has no counterpart
//! for default to [`SiteError::Unsupported`], a permanent outcome callers
//! branch on without exception-style control flow. A driver therefore
//! implements only the verbs its site actually has.
//!
//! All traits are async and object-safe; the [`Site`] bundle holds one
//! implementation per group behind `Arc<dyn _>`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use gantry_core::domain::event::JobEventHandler;
use gantry_core::domain::job::{JobContext, JobDefn};
use gantry_core::domain::status::StatusEvent;
use gantry_core::error::{SiteError, SiteResult};

/// Login and credential state for one site.
#[async_trait]
pub trait SiteAuth: Send + Sync {
    /// Establish (or with `force`, re-establish) the site's authenticated
    /// state. Returns whether login succeeded.
    async fn login(&self, force: bool) -> SiteResult<bool>;

    /// Whether the current credential/session is still valid.
    async fn is_auth_current(&self) -> SiteResult<bool>;
}

/// Job submission and tracking for one site.
///
/// `submit_job` never blocks until completion: it issues the native
/// submission and returns an immediate `Pending` event (or a terminal
/// `Failed` one carrying diagnostics). A push-capable driver also sends the
/// initial event down its status channel, ahead of the lifecycle events its
/// watcher will push, and the engine records only the channel copy; for a
/// poll-based driver the returned event is the one the engine records.
#[async_trait]
pub trait SiteRun: Send + Sync {
    /// Submit the definition under an already-derived context. The driver
    /// records the site-assigned native id on the context inside the
    /// returned event.
    async fn submit_job(&self, defn: &JobDefn, context: JobContext) -> SiteResult<StatusEvent>;

    /// Query the site's native system for the job's current status,
    /// normalized through the driver's status map.
    async fn job_status(&self, context: &JobContext) -> SiteResult<StatusEvent>;

    /// Best-effort cancellation. True means the native system accepted the
    /// request, not that the job is already `Cancelled`.
    async fn cancel_job(&self, _context: &JobContext) -> SiteResult<bool> {
        Err(SiteError::unsupported("run.cancel_job"))
    }

    /// Resource classes this site can run on (queues, partitions).
    async fn compute_types(&self) -> SiteResult<Vec<String>> {
        Err(SiteError::unsupported("run.compute_types"))
    }

    /// Native job ids known to the site within the window.
    async fn job_list(
        &self,
        _start: DateTime<Utc>,
        _end: DateTime<Utc>,
    ) -> SiteResult<Vec<String>> {
        Err(SiteError::unsupported("run.job_list"))
    }

    /// Push a trigger rule down to the site's native scheduler. Sites without
    /// native trigger support leave this to the engine.
    async fn set_event_handler(&self, _handler: JobEventHandler) -> SiteResult<JobEventHandler> {
        Err(SiteError::unsupported("run.set_event_handler"))
    }

    /// Remove a natively-registered trigger rule.
    async fn unset_event_handler(&self, _handler_id: Uuid) -> SiteResult<bool> {
        Err(SiteError::unsupported("run.unset_event_handler"))
    }

    /// Enumerate natively-registered trigger rules.
    async fn event_handlers(&self) -> SiteResult<Vec<JobEventHandler>> {
        Err(SiteError::unsupported("run.event_handlers"))
    }
}

/// Data movement between the caller and the site's storage.
#[async_trait]
pub trait SiteRepo: Send + Sync {
    /// Copy a local file to a site reference; returns the site reference the
    /// data landed at.
    async fn put(&self, local: &Path, site_ref: &str, context: &JobContext)
    -> SiteResult<String>;

    /// Copy a site reference to a local path; returns the local path the
    /// data landed at.
    async fn get(&self, site_ref: &str, local: &Path, context: &JobContext)
    -> SiteResult<PathBuf>;

    /// Site references matching a pattern.
    async fn find(&self, _pattern: &str) -> SiteResult<Vec<String>> {
        Err(SiteError::unsupported("repo.find"))
    }
}

/// Compute-resource lifecycle for sites that can create capacity on demand.
#[async_trait]
pub trait SiteSpin: Send + Sync {
    async fn list_instances(&self) -> SiteResult<Vec<String>> {
        Err(SiteError::unsupported("spin.list_instances"))
    }

    async fn create_instance(&self, _compute_type: &str) -> SiteResult<String> {
        Err(SiteError::unsupported("spin.create_instance"))
    }

    async fn destroy_instance(&self, _instance_id: &str) -> SiteResult<bool> {
        Err(SiteError::unsupported("spin.destroy_instance"))
    }
}

/// Stand-in Repo group for sites without storage verbs.
pub struct UnsupportedRepo;

#[async_trait]
impl SiteRepo for UnsupportedRepo {
    async fn put(
        &self,
        _local: &Path,
        _site_ref: &str,
        _context: &JobContext,
    ) -> SiteResult<String> {
        Err(SiteError::unsupported("repo.put"))
    }

    async fn get(
        &self,
        _site_ref: &str,
        _local: &Path,
        _context: &JobContext,
    ) -> SiteResult<PathBuf> {
        Err(SiteError::unsupported("repo.get"))
    }
}

/// Stand-in Spin group; every verb reports unsupported.
pub struct UnsupportedSpin;

#[async_trait]
impl SiteSpin for UnsupportedSpin {}

/// A named site bundling one implementation per capability group.
#[derive(Clone)]
pub struct Site {
    name: String,
    auth: Arc<dyn SiteAuth>,
    run: Arc<dyn SiteRun>,
    repo: Arc<dyn SiteRepo>,
    spin: Arc<dyn SiteSpin>,
    poll_status: bool,
}

impl Site {
    pub fn new(
        name: impl Into<String>,
        auth: Arc<dyn SiteAuth>,
        run: Arc<dyn SiteRun>,
        repo: Arc<dyn SiteRepo>,
        spin: Arc<dyn SiteSpin>,
    ) -> Self {
        Self {
            name: name.into(),
            auth,
            run,
            repo,
            spin,
            poll_status: false,
        }
    }

    /// Mark this site as poll-based: it does not push status events, so the
    /// engine's poller must track its submitted jobs until terminal.
    pub fn with_status_polling(mut self) -> Self {
        self.poll_status = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn auth(&self) -> &Arc<dyn SiteAuth> {
        &self.auth
    }

    pub fn run(&self) -> &Arc<dyn SiteRun> {
        &self.run
    }

    pub fn repo(&self) -> &Arc<dyn SiteRepo> {
        &self.repo
    }

    pub fn spin(&self) -> &Arc<dyn SiteSpin> {
        &self.spin
    }

    pub fn polls_status(&self) -> bool {
        self.poll_status
    }
}

impl std::fmt::Debug for Site {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Site")
            .field("name", &self.name)
            .field("poll_status", &self.poll_status)
            .finish()
    }
}
