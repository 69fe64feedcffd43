//! Engine facade
//!
//! [`Gantry`] assembles the whole middleware and is the one handle callers
//! hold: submission, status queries, cancellation, trigger registration,
//! data movement and thread queries all go through it. Internally it wires
//! the site registry, status hub, trigger engine and poller together over
//! channels:
//!
//! - push-capable drivers send lifecycle events into the hub's ingest
//!   channel; the poller feeds the hub for pull-only sites
//! - the trigger engine evaluates the hub's fan-out and hands fired actions
//!   to the dispatch loop, which performs the chained submissions
//!
//! Restarting the process and calling [`Gantry::start`] against the same
//! database resumes where the last run stopped: unfired handlers reload and
//! in-flight jobs go back under status tracking.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::SqlitePool;
use thiserror::Error;
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use gantry_core::domain::event::{
    EventFilter, EventSelector, FiringMode, JobEventHandler, TriggerAction,
};
use gantry_core::domain::job::{JobContext, JobDefn};
use gantry_core::domain::status::StatusEvent;
use gantry_core::domain::workflow::Workflow;
use gantry_core::error::SiteError;
use gantry_site::capability::Site;
use gantry_site::config::{ConfigError, SitesFile};
use gantry_site::metadata::{LocalMetadata, MetadataClient, MetadataError};
use gantry_site::registry::{DriverDeps, SiteRegistry};

use crate::config::EngineConfig;
use crate::db;
use crate::hub::StatusHub;
use crate::poller::StatusPoller;
use crate::store::data::DataRecord;
use crate::store::job::JobRecord;
use crate::store::{data_store, job_store, status_store, workflow_store};
use crate::trigger::{FiredAction, TriggerEngine, TriggerError};

/// Errors surfaced by facade operations.
#[derive(Debug, Error)]
pub enum GantryError {
    #[error("no job recorded under id {0}")]
    JobNotFound(Uuid),

    #[error("no site registered under '{0}'")]
    UnknownSite(String),

    #[error("site error: {0}")]
    Site(#[from] SiteError),

    #[error("trigger error: {0}")]
    Trigger(#[from] TriggerError),

    #[error("metadata error: {0}")]
    Metadata(#[from] MetadataError),

    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// The assembled middleware.
pub struct Gantry {
    pool: SqlitePool,
    registry: Arc<SiteRegistry>,
    hub: Arc<StatusHub>,
    triggers: Arc<TriggerEngine>,
    poller: Arc<StatusPoller>,
    metadata: Arc<dyn MetadataClient>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Gantry {
    /// Open the store, build every configured site, start the background
    /// loops and reconcile persisted state.
    pub async fn start(
        config: &EngineConfig,
        sites: &SitesFile,
    ) -> Result<Arc<Self>, GantryError> {
        let pool = db::create_pool(&config.database_url).await?;
        db::run_migrations(&pool).await?;

        let (status_tx, status_rx) = mpsc::unbounded_channel();
        let (actions_tx, actions_rx) = mpsc::unbounded_channel();
        let metadata: Arc<dyn MetadataClient> = Arc::new(LocalMetadata::new());

        let deps = DriverDeps {
            status_tx,
            metadata: metadata.clone(),
        };
        let registry = Arc::new(SiteRegistry::from_config(sites, &deps)?);

        let hub = Arc::new(StatusHub::new(pool.clone(), config.event_capacity));
        let triggers = Arc::new(TriggerEngine::new(pool.clone(), registry.clone(), actions_tx));
        let poller = Arc::new(StatusPoller::new(
            registry.clone(),
            hub.clone(),
            config.poll_interval,
            config.poll_interval_max,
        ));

        let gantry = Arc::new(Self {
            pool,
            registry,
            hub,
            triggers,
            poller,
            metadata,
            tasks: Mutex::new(Vec::new()),
        });

        // subscribed before any event can flow, so evaluation misses nothing
        let eval_rx = gantry.hub.subscribe();
        let tasks = vec![
            gantry.hub.clone().run_ingest(status_rx),
            gantry.triggers.clone().run_eval(eval_rx),
            gantry.clone().run_dispatch(actions_rx),
            gantry.poller.clone().run(),
        ];
        *gantry.tasks.lock().await = tasks;

        gantry.reconcile().await?;
        info!(sites = gantry.registry.names().await.len(), "engine started");
        Ok(gantry)
    }

    /// Abort the background loops. The store is left as-is for the next
    /// [`Gantry::start`] to reconcile against.
    pub async fn shutdown(&self) {
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        info!("engine stopped");
    }

    /// A live view of every accepted status event.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.hub.subscribe()
    }

    /// Names of the registered sites.
    pub async fn sites(&self) -> Vec<String> {
        self.registry.names().await
    }

    /// Register a site built outside the configuration file.
    pub async fn register_site(&self, site: Site) {
        self.registry.register(site).await;
    }

    /// Direct handle to a registered site's capability groups.
    pub async fn site(&self, name: &str) -> Result<Arc<Site>, GantryError> {
        self.require_site(name).await
    }

    // ===== Submission =====

    /// Submit a definition to a site as a fresh root job.
    pub async fn submit_job(
        &self,
        site_name: &str,
        defn: JobDefn,
    ) -> Result<StatusEvent, GantryError> {
        let context = JobContext::new(site_name);
        self.submit_with_context(&defn, context).await
    }

    /// Submit a job causally downstream of an existing one.
    pub async fn submit_child(
        &self,
        parent_id: Uuid,
        site_name: &str,
        defn: JobDefn,
    ) -> Result<StatusEvent, GantryError> {
        let parent = self.require_job(parent_id).await?;
        let context = JobContext::child_of(&parent.context, site_name);
        self.submit_with_context(&defn, context).await
    }

    /// Submit a fresh root job under an existing workflow id.
    pub async fn submit_in_workflow(
        &self,
        site_name: &str,
        defn: JobDefn,
        workflow_id: Uuid,
    ) -> Result<StatusEvent, GantryError> {
        let context = JobContext::new(site_name).with_workflow(workflow_id);
        self.submit_with_context(&defn, context).await
    }

    async fn submit_with_context(
        &self,
        defn: &JobDefn,
        context: JobContext,
    ) -> Result<StatusEvent, GantryError> {
        let site = self.require_site(&context.site_name).await?;
        // a failed login leaves no trace of the attempt
        self.ensure_login(&site).await?;

        // The row goes in before the site sees the submission, so every
        // event lands against a recorded job and a chained child row can
        // never precede its parent's.
        job_store::record(&self.pool, &context, defn).await?;

        let event = match site.run().submit_job(defn, context.clone()).await {
            Ok(event) => event,
            Err(err) => {
                warn!(
                    job_id = %context.job_id,
                    site = %context.site_name,
                    error = %err,
                    "submission failed"
                );
                let failed = StatusEvent::failed(context, err.to_string());
                if let Err(store_err) = self.hub.emit(failed).await {
                    error!("could not record failed submission: {}", store_err);
                }
                return Err(err.into());
            }
        };

        if event.context.native_id().is_some() {
            job_store::update_context(&self.pool, &event.context).await?;
        }

        info!(
            job_id = %event.context.job_id,
            site = %event.context.site_name,
            native_id = ?event.context.native_id(),
            "job submitted"
        );

        if site.polls_status() {
            // pull-only drivers hand the initial event back; push drivers
            // already sent theirs down the status channel
            match self.hub.emit(event.clone()).await? {
                Some(accepted) => {
                    if !accepted.status.is_terminal() {
                        self.poller.track(accepted.context.clone()).await;
                    }
                    return Ok(accepted);
                }
                None => return Ok(event),
            }
        }
        Ok(event)
    }

    // ===== Status =====

    /// The most recent recorded event for a job.
    pub async fn latest_status(&self, job_id: Uuid) -> Result<StatusEvent, GantryError> {
        status_store::latest(&self.pool, job_id)
            .await?
            .ok_or(GantryError::JobNotFound(job_id))
    }

    /// A job's full event history, oldest first.
    pub async fn status_history(&self, job_id: Uuid) -> Result<Vec<StatusEvent>, GantryError> {
        self.require_job(job_id).await?;
        Ok(status_store::history(&self.pool, job_id).await?)
    }

    /// Query the destination site live and record what it reports.
    ///
    /// When the recorded history has already reached a terminal status the
    /// live observation is dropped and the recorded event is returned.
    pub async fn refresh_status(&self, job_id: Uuid) -> Result<StatusEvent, GantryError> {
        let record = self.require_job(job_id).await?;
        let site = self.require_site(&record.context.site_name).await?;

        let event = site.run().job_status(&record.context).await?;
        match self.hub.emit(event).await? {
            Some(accepted) => Ok(accepted),
            None => self.latest_status(job_id).await,
        }
    }

    /// Ask the destination site to cancel a job.
    ///
    /// True means the site accepted the request. `Cancelled` lands in the
    /// history only once it is actually observed.
    pub async fn cancel_job(&self, job_id: Uuid) -> Result<bool, GantryError> {
        let record = self.require_job(job_id).await?;
        let site = self.require_site(&record.context.site_name).await?;

        let accepted = site.run().cancel_job(&record.context).await?;
        info!(%job_id, accepted, "cancellation requested");
        Ok(accepted)
    }

    /// Resource classes a site can run on.
    pub async fn compute_types(&self, site_name: &str) -> Result<Vec<String>, GantryError> {
        let site = self.require_site(site_name).await?;
        Ok(site.run().compute_types().await?)
    }

    /// Native job ids a site itself reports for the window.
    pub async fn site_job_list(
        &self,
        site_name: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<String>, GantryError> {
        let site = self.require_site(site_name).await?;
        self.ensure_login(&site).await?;
        Ok(site.run().job_list(start, end).await?)
    }

    // ===== Triggers =====

    /// Register a trigger rule; it is persisted before it becomes active.
    pub async fn set_handler(
        &self,
        selector: EventSelector,
        filter: EventFilter,
        action: TriggerAction,
        mode: FiringMode,
    ) -> Result<JobEventHandler, GantryError> {
        Ok(self.triggers.register(selector, filter, action, mode).await?)
    }

    /// Remove a trigger rule before it fires.
    pub async fn unset_handler(&self, handler_id: Uuid) -> Result<bool, GantryError> {
        Ok(self.triggers.unregister(handler_id).await?)
    }

    /// The active trigger rules, in registration order.
    pub async fn handlers(&self) -> Vec<JobEventHandler> {
        self.triggers.handlers().await
    }

    // ===== Data movement =====

    /// Copy a local file to the job's site; the movement is notated and
    /// surfaces as an `Info` event on the job's stream.
    pub async fn put_data(
        &self,
        job_id: Uuid,
        local: &Path,
        site_ref: &str,
    ) -> Result<String, GantryError> {
        let record = self.require_job(job_id).await?;
        let site = self.require_site(&record.context.site_name).await?;
        self.ensure_login(&site).await?;
        Ok(site.repo().put(local, site_ref, &record.context).await?)
    }

    /// Copy a site reference down to a local path.
    pub async fn get_data(
        &self,
        job_id: Uuid,
        site_ref: &str,
        local: &Path,
    ) -> Result<PathBuf, GantryError> {
        let record = self.require_job(job_id).await?;
        let site = self.require_site(&record.context.site_name).await?;
        self.ensure_login(&site).await?;
        Ok(site.repo().get(site_ref, local, &record.context).await?)
    }

    /// Site references matching a pattern on a named site.
    pub async fn find_data(
        &self,
        site_name: &str,
        pattern: &str,
    ) -> Result<Vec<String>, GantryError> {
        let site = self.require_site(site_name).await?;
        Ok(site.repo().find(pattern).await?)
    }

    /// Every recorded movement of a site reference, oldest first.
    pub async fn data_history(&self, site_ref: &str) -> Result<Vec<DataRecord>, GantryError> {
        Ok(data_store::find_by_site_ref(&self.pool, site_ref).await?)
    }

    /// Every movement recorded under a job.
    pub async fn job_data(&self, job_id: Uuid) -> Result<Vec<DataRecord>, GantryError> {
        Ok(data_store::find_by_job(&self.pool, job_id).await?)
    }

    // ===== Thread queries =====

    /// Look up a recorded job.
    pub async fn find_job(&self, job_id: Uuid) -> Result<Option<JobRecord>, GantryError> {
        Ok(job_store::find_by_id(&self.pool, job_id).await?)
    }

    /// All jobs recorded under a workflow, parents before children.
    pub async fn workflow_jobs(&self, workflow_id: Uuid) -> Result<Vec<JobRecord>, GantryError> {
        Ok(job_store::find_by_workflow(&self.pool, workflow_id).await?)
    }

    /// The chain of jobs that led to this one, origin first.
    pub async fn causal_chain(&self, job_id: Uuid) -> Result<Vec<JobRecord>, GantryError> {
        Ok(job_store::causal_chain(&self.pool, job_id).await?)
    }

    /// Jobs recorded within the time window, oldest first.
    pub async fn jobs_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<JobRecord>, GantryError> {
        Ok(job_store::find_by_created_range(&self.pool, start, end).await?)
    }

    // ===== Workflows =====

    /// Create and record a named workflow.
    pub async fn create_workflow(
        &self,
        name: Option<String>,
        description: Option<String>,
    ) -> Result<Workflow, GantryError> {
        let workflow = Workflow::new(name, description);
        workflow_store::put(&self.pool, &workflow).await?;
        info!(workflow_id = %workflow.id, "workflow created");
        Ok(workflow)
    }

    /// Look up a recorded workflow.
    pub async fn workflow(&self, id: Uuid) -> Result<Option<Workflow>, GantryError> {
        Ok(workflow_store::find_by_id(&self.pool, id).await?)
    }

    /// All recorded workflows, oldest first.
    pub async fn workflows(&self) -> Result<Vec<Workflow>, GantryError> {
        Ok(workflow_store::list_all(&self.pool).await?)
    }

    // ===== Metadata =====

    /// Store a free-form document with the metadata collaborator.
    pub async fn notate(&self, doc: Value) -> Result<String, GantryError> {
        Ok(self.metadata.notate(doc).await?)
    }

    /// Documents whose top-level fields contain every filter pair.
    pub async fn find_metadata(
        &self,
        filters: &HashMap<String, String>,
    ) -> Result<Vec<Value>, GantryError> {
        Ok(self.metadata.find(filters).await?)
    }

    /// Merge fields into an existing metadata document.
    pub async fn update_metadata(&self, doc_id: &str, fields: Value) -> Result<(), GantryError> {
        Ok(self.metadata.update(doc_id, fields).await?)
    }

    // ===== Recovery =====

    /// Restore engine state from the store.
    ///
    /// Unfired handlers become active again. Jobs whose recorded status is
    /// non-terminal go back under polling; for push-driven sites, whose
    /// watchers died with the previous process, the site is asked once and
    /// any change is recorded.
    pub async fn reconcile(&self) -> Result<(), GantryError> {
        self.triggers.load().await?;

        let mut resumed = 0usize;
        for event in status_store::latest_per_job(&self.pool).await? {
            if event.status.is_terminal() {
                continue;
            }
            let Some(site) = self.registry.lookup(&event.context.site_name).await else {
                warn!(
                    job_id = %event.job_id(),
                    site = %event.context.site_name,
                    "job references an unregistered site, not resuming"
                );
                continue;
            };

            if site.polls_status() {
                self.poller.track(event.context.clone()).await;
                resumed += 1;
                continue;
            }
            match site.run().job_status(&event.context).await {
                Ok(live) if live.status != event.status => {
                    self.hub.emit(live).await?;
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(
                        job_id = %event.job_id(),
                        error = %err,
                        "status refresh failed during reconcile"
                    );
                }
            }
        }
        if resumed > 0 {
            info!(jobs = resumed, "resumed status polling");
        }
        Ok(())
    }

    // ===== Dispatch loop =====

    /// Perform the chained submission for every fired trigger action.
    ///
    /// Each submission runs in its own task: one slow destination never
    /// holds up the next firing.
    fn run_dispatch(
        self: Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<FiredAction>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(fired) = rx.recv().await {
                let engine = self.clone();
                tokio::spawn(async move {
                    let context = match fired.action.context.clone() {
                        Some(context) => context,
                        None => {
                            JobContext::child_of(&fired.cause.context, &fired.action.site_name)
                        }
                    };
                    // fire-and-forget: the chained job's outcome is its own
                    // history, never the handler's
                    if let Err(err) =
                        engine.submit_with_context(&fired.action.defn, context).await
                    {
                        warn!(
                            handler_id = %fired.handler_id,
                            error = %err,
                            "chained submission failed"
                        );
                    }
                });
            }
            debug!("action dispatch stopped");
        })
    }

    // ===== Helper Functions =====

    async fn require_site(&self, name: &str) -> Result<Arc<Site>, GantryError> {
        self.registry
            .lookup(name)
            .await
            .ok_or_else(|| GantryError::UnknownSite(name.to_string()))
    }

    async fn require_job(&self, job_id: Uuid) -> Result<JobRecord, GantryError> {
        job_store::find_by_id(&self.pool, job_id)
            .await?
            .ok_or(GantryError::JobNotFound(job_id))
    }

    async fn ensure_login(&self, site: &Site) -> Result<(), GantryError> {
        if site.auth().login(false).await? {
            Ok(())
        } else {
            Err(GantryError::Site(SiteError::authentication(
                site.name(),
                "login was declined",
            )))
        }
    }
}
