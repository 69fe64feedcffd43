//! Canonical job status machine
//!
//! Every site reports job state in its own vocabulary; drivers translate it
//! into the canonical set below through a per-site [`StatusMap`]. A native
//! string with no mapping resolves to [`JobStatus::Unknown`], never to an
//! error. Observed statuses are packaged as [`StatusEvent`] records, which are
//! append-only: a job's history is the ordered list of events emitted for it.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::job::JobContext;

/// Canonical job states shared by every site.
///
/// `Info` is non-terminal and side-channel: it carries a key/value signature
/// (data movement, calibration results) rather than progress. The terminal
/// states `Complete`, `Failed` and `Cancelled` are absorbing; the emitter
/// rejects anything published after them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    Unknown,
    Pending,
    Running,
    Info,
    Finishing,
    Complete,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Whether this status ends a job's lifecycle.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Complete | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Unknown => "UNKNOWN",
            JobStatus::Pending => "PENDING",
            JobStatus::Running => "RUNNING",
            JobStatus::Info => "INFO",
            JobStatus::Finishing => "FINISHING",
            JobStatus::Complete => "COMPLETE",
            JobStatus::Failed => "FAILED",
            JobStatus::Cancelled => "CANCELLED",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "UNKNOWN" => Ok(JobStatus::Unknown),
            "PENDING" => Ok(JobStatus::Pending),
            "RUNNING" => Ok(JobStatus::Running),
            "INFO" => Ok(JobStatus::Info),
            "FINISHING" => Ok(JobStatus::Finishing),
            "COMPLETE" => Ok(JobStatus::Complete),
            "FAILED" => Ok(JobStatus::Failed),
            "CANCELLED" => Ok(JobStatus::Cancelled),
            other => Err(format!("unknown job status: {}", other)),
        }
    }
}

/// Native-to-canonical status vocabulary for one site.
///
/// Each driver owns one of these. Lookups never fail: an unmapped native
/// string is reported as [`JobStatus::Unknown`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusMap {
    entries: HashMap<String, JobStatus>,
}

impl StatusMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// A map that recognizes the canonical names themselves, for sites whose
    /// native vocabulary is already canonical (the local driver).
    pub fn identity() -> Self {
        let mut map = Self::new();
        for status in [
            JobStatus::Unknown,
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Info,
            JobStatus::Finishing,
            JobStatus::Complete,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            map.insert(status.to_string(), status);
        }
        map
    }

    pub fn insert(&mut self, native: impl Into<String>, status: JobStatus) {
        self.entries.insert(native.into(), status);
    }

    /// Builder form of [`insert`](Self::insert).
    pub fn with(mut self, native: impl Into<String>, status: JobStatus) -> Self {
        self.insert(native, status);
        self
    }

    /// Translate a native status string, falling back to `Unknown`.
    pub fn canonical(&self, native: &str) -> JobStatus {
        self.entries.get(native).copied().unwrap_or(JobStatus::Unknown)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// One observed status for one job.
///
/// Events are created at observation time and never mutated; corrections are
/// further events. `emit_time` is assigned when the emitter accepts the event
/// and is non-decreasing within a job's history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusEvent {
    pub context: JobContext,
    pub status: JobStatus,
    /// Raw site status string, absent when a driver reports canonically.
    pub native_status: Option<String>,
    pub emit_time: DateTime<Utc>,
    /// Key/value signature for `Info` events; `Failed` events carry their
    /// diagnostic text here under the `error` key.
    pub info: Option<HashMap<String, String>>,
}

impl StatusEvent {
    pub fn new(context: JobContext, status: JobStatus) -> Self {
        Self {
            context,
            status,
            native_status: None,
            emit_time: Utc::now(),
            info: None,
        }
    }

    /// Build an event from a site's native status string, recording both the
    /// canonical translation and the raw value.
    pub fn from_native(context: JobContext, map: &StatusMap, native: &str) -> Self {
        let mut event = Self::new(context, map.canonical(native));
        event.native_status = Some(native.to_string());
        event
    }

    /// An `Info` event carrying a data/metadata signature.
    pub fn info(context: JobContext, signature: HashMap<String, String>) -> Self {
        let mut event = Self::new(context, JobStatus::Info);
        event.info = Some(signature);
        event
    }

    /// A terminal `Failed` event with diagnostic text attached.
    pub fn failed(context: JobContext, diagnostic: impl Into<String>) -> Self {
        let mut event = Self::new(context, JobStatus::Failed);
        let mut info = HashMap::new();
        info.insert("error".to_string(), diagnostic.into());
        event.info = Some(info);
        event
    }

    /// Signature attached to the `Info` event emitted by repo put/get, so data
    /// movement is visible on the status stream and matchable by data
    /// triggers.
    pub fn repo_signature(op: &str, local: &str, remote: &str) -> HashMap<String, String> {
        let mut sig = HashMap::new();
        sig.insert("op".to_string(), op.to_string());
        sig.insert("local".to_string(), local.to_string());
        sig.insert("remote".to_string(), remote.to_string());
        sig
    }

    pub fn job_id(&self) -> Uuid {
        self.context.job_id
    }

    pub fn emit_millis(&self) -> i64 {
        self.emit_time.timestamp_millis()
    }
}
