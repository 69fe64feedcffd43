//! Trigger rule types
//!
//! A [`JobEventHandler`] waits for a status or data condition on one job (or
//! any job in a workflow) and, on match, submits a new job definition to a
//! destination site. The engine owns registration, matching and firing; these
//! types only decide whether an event matches.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::job::{JobContext, JobDefn};
use crate::domain::status::{JobStatus, StatusEvent};

/// Which job(s) a handler watches.
///
/// Exact-job selection is the default; watching a whole workflow is a
/// deliberately separate variant so over-broad firing is always a visible
/// choice at the registration site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventSelector {
    Job(Uuid),
    Workflow(Uuid),
}

impl EventSelector {
    pub fn matches(&self, context: &JobContext) -> bool {
        match self {
            EventSelector::Job(id) => context.job_id == *id,
            EventSelector::Workflow(id) => context.workflow_id == *id,
        }
    }
}

/// What must be observed for a handler to fire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventFilter {
    /// The event's canonical status equals this value.
    Status(JobStatus),
    /// The event is `Info` and its signature contains every listed key/value
    /// pair (subset match).
    Data(HashMap<String, String>),
}

impl EventFilter {
    pub fn accepts(&self, event: &StatusEvent) -> bool {
        match self {
            EventFilter::Status(wanted) => event.status == *wanted,
            EventFilter::Data(signature) => {
                if event.status != JobStatus::Info {
                    return false;
                }
                match &event.info {
                    Some(info) => signature
                        .iter()
                        .all(|(key, value)| info.get(key) == Some(value)),
                    None => false,
                }
            }
        }
    }

    /// Registration-time validity. An empty data signature would match every
    /// `Info` event, so it is rejected as malformed.
    pub fn is_well_formed(&self) -> bool {
        match self {
            EventFilter::Status(_) => true,
            EventFilter::Data(signature) => !signature.is_empty(),
        }
    }
}

/// Whether a handler survives its first firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FiringMode {
    OneShot,
    Recurring,
}

/// The submission a handler performs when it fires.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerAction {
    pub defn: JobDefn,
    pub site_name: String,
    /// Pre-built context for the new job. When absent, the engine derives a
    /// child of the triggering job's context at fire time.
    pub context: Option<JobContext>,
}

impl TriggerAction {
    pub fn new(defn: JobDefn, site_name: impl Into<String>) -> Self {
        Self {
            defn,
            site_name: site_name.into(),
            context: None,
        }
    }

    pub fn with_context(mut self, context: JobContext) -> Self {
        self.context = Some(context);
        self
    }
}

/// A registered trigger rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEventHandler {
    pub id: Uuid,
    pub selector: EventSelector,
    pub filter: EventFilter,
    pub action: TriggerAction,
    pub mode: FiringMode,
    /// Set once a one-shot handler has fired; persisted so restarts do not
    /// re-fire.
    pub fired: bool,
    pub registered_at: DateTime<Utc>,
}

impl JobEventHandler {
    pub fn new(
        selector: EventSelector,
        filter: EventFilter,
        action: TriggerAction,
        mode: FiringMode,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            selector,
            filter,
            action,
            mode,
            fired: false,
            registered_at: Utc::now(),
        }
    }

    pub fn matches(&self, event: &StatusEvent) -> bool {
        self.selector.matches(&event.context) && self.filter.accepts(event)
    }
}
