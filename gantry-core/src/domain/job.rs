//! Job identity and definition types

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What to run, independent of where.
///
/// The entry point is handed to the destination site verbatim; the local and
/// remote-shell drivers pass it to the system shell with the arguments
/// appended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDefn {
    pub name: Option<String>,
    pub entry_point: String,
    pub args: Vec<String>,
    /// Site-specific resource class (queue, partition, instance type).
    pub compute_type: Option<String>,
}

impl JobDefn {
    pub fn new(entry_point: impl Into<String>) -> Self {
        Self {
            name: None,
            entry_point: entry_point.into(),
            args: Vec::new(),
            compute_type: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_compute_type(mut self, compute_type: impl Into<String>) -> Self {
        self.compute_type = Some(compute_type.into());
        self
    }

    /// The shell command line: entry point followed by arguments.
    pub fn command_line(&self) -> String {
        if self.args.is_empty() {
            return self.entry_point.clone();
        }
        let mut cmd = self.entry_point.clone();
        for arg in &self.args {
            cmd.push(' ');
            cmd.push_str(arg);
        }
        cmd
    }
}

/// Identity of one job within the digital thread.
///
/// Created at submission time. All fields are fixed at creation except
/// `native_id`, which the destination site assigns exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobContext {
    pub job_id: Uuid,
    /// Job whose trigger (or explicit chaining) created this one.
    pub parent_job_id: Option<Uuid>,
    /// Root of this job's causal chain.
    pub origin_job_id: Uuid,
    /// Groups related jobs, possibly across sites. Inherited from the parent
    /// unless explicitly overridden.
    pub workflow_id: Uuid,
    pub site_name: String,
    native_id: Option<String>,
}

impl JobContext {
    /// A fresh root context: its own origin, a fresh workflow.
    pub fn new(site_name: impl Into<String>) -> Self {
        let job_id = Uuid::new_v4();
        Self {
            job_id,
            parent_job_id: None,
            origin_job_id: job_id,
            workflow_id: Uuid::new_v4(),
            site_name: site_name.into(),
            native_id: None,
        }
    }

    /// A context causally downstream of `parent`: same origin, inherited
    /// workflow, `parent_job_id` set.
    pub fn child_of(parent: &JobContext, site_name: impl Into<String>) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            parent_job_id: Some(parent.job_id),
            origin_job_id: parent.origin_job_id,
            workflow_id: parent.workflow_id,
            site_name: site_name.into(),
            native_id: None,
        }
    }

    /// Override the inherited workflow id (builder form, pre-submission).
    pub fn with_workflow(mut self, workflow_id: Uuid) -> Self {
        self.workflow_id = workflow_id;
        self
    }

    pub fn native_id(&self) -> Option<&str> {
        self.native_id.as_deref()
    }

    /// Record the site-assigned identifier. Returns false (and changes
    /// nothing) if one was already set.
    pub fn set_native_id(&mut self, native_id: impl Into<String>) -> bool {
        if self.native_id.is_some() {
            return false;
        }
        self.native_id = Some(native_id.into());
        true
    }
}
