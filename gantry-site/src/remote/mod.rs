//! Remote-shell site driver
//!
//! One driver parameterized by [`RemoteShellConfig`] covers a whole family of
//! machines: host, login command, submission/status/cancel templates and the
//! native status vocabulary are all configuration. Commands run through the
//! per-machine [`SessionManager`], which supplies the shared session,
//! keepalive and the one-relogin-one-retry policy.
//!
//! Submission semantics follow batch schedulers that print the assigned job
//! id in angle brackets (`Job <4471> is submitted`): the native id is parsed
//! from stdout, and any stderr output marks the submission `Failed` with the
//! captured text as diagnostics and no native id recorded.

pub mod session;
pub mod transport;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use gantry_core::domain::job::{JobContext, JobDefn};
use gantry_core::domain::status::{JobStatus, StatusEvent, StatusMap};
use gantry_core::error::{SiteError, SiteResult};

use crate::capability::{Site, SiteAuth, SiteRun, UnsupportedRepo, UnsupportedSpin};
use crate::config::{ConfigError, RemoteShellConfig};
use session::SessionManager;

/// Assemble a remote-shell site from its configuration.
///
/// The returned site is poll-based: it never pushes status events, so the
/// engine's poller tracks its jobs until terminal.
pub fn remote_shell_site(
    name: impl Into<String>,
    config: RemoteShellConfig,
) -> Result<Site, ConfigError> {
    config.validate()?;
    let name = name.into();
    let status_map = config.parsed_status_map()?;
    let machine = config.machine();
    let sessions = Arc::new(SessionManager::new(&name, &config));

    let auth = RemoteAuth {
        machine: machine.clone(),
        sessions: sessions.clone(),
    };
    let run = RemoteRun {
        site_name: name.clone(),
        machine,
        config,
        status_map,
        sessions,
    };

    Ok(Site::new(
        name,
        Arc::new(auth),
        Arc::new(run),
        Arc::new(UnsupportedRepo),
        Arc::new(UnsupportedSpin),
    )
    .with_status_polling())
}

/// Auth group: login means holding a live session to the machine.
pub struct RemoteAuth {
    machine: String,
    sessions: Arc<SessionManager>,
}

#[async_trait]
impl SiteAuth for RemoteAuth {
    async fn login(&self, force: bool) -> SiteResult<bool> {
        if force {
            self.sessions.invalidate_machine(&self.machine).await;
        }
        self.sessions.session(&self.machine).await?;
        Ok(true)
    }

    async fn is_auth_current(&self) -> SiteResult<bool> {
        Ok(self.sessions.has_session(&self.machine).await)
    }
}

/// Run group: submission, status and cancel through configured templates.
pub struct RemoteRun {
    site_name: String,
    machine: String,
    config: RemoteShellConfig,
    status_map: StatusMap,
    sessions: Arc<SessionManager>,
}

/// First `<`-`>` delimited token in the submission output.
fn parse_native_id(stdout: &str) -> Option<String> {
    let start = stdout.find('<')? + 1;
    let rest = &stdout[start..];
    let end = rest.find('>')?;
    let id = rest[..end].trim();
    if id.is_empty() {
        None
    } else {
        Some(id.to_string())
    }
}

#[async_trait]
impl SiteRun for RemoteRun {
    async fn submit_job(&self, defn: &JobDefn, mut context: JobContext) -> SiteResult<StatusEvent> {
        let command = match &self.config.submit_cmd {
            Some(prefix) => format!("{} {}", prefix, defn.command_line()),
            None => defn.command_line(),
        };

        let output = self.sessions.run(&self.machine, &command).await?;

        if !output.stderr.trim().is_empty() {
            warn!(
                site = %self.site_name,
                job_id = %context.job_id,
                stderr = %output.stderr.trim(),
                "remote submission failed"
            );
            return Ok(StatusEvent::failed(context, output.stderr.trim()));
        }
        if !output.success() {
            return Ok(StatusEvent::failed(
                context,
                format!("submission exited with code {}", output.exit_code),
            ));
        }

        match parse_native_id(&output.stdout) {
            Some(native) => {
                context.set_native_id(native);
            }
            None => {
                debug!(
                    site = %self.site_name,
                    job_id = %context.job_id,
                    "no native id in submission output"
                );
            }
        }

        info!(
            site = %self.site_name,
            job_id = %context.job_id,
            native_id = ?context.native_id(),
            "remote job submitted"
        );
        Ok(StatusEvent::new(context, JobStatus::Pending))
    }

    async fn job_status(&self, context: &JobContext) -> SiteResult<StatusEvent> {
        let Some(template) = &self.config.status_cmd else {
            return Err(SiteError::unsupported("run.job_status"));
        };
        let Some(native_id) = context.native_id() else {
            // submission never yielded a native id; nothing to ask the site
            return Ok(StatusEvent::new(context.clone(), JobStatus::Unknown));
        };

        let command = template.replace("{id}", native_id);
        let output = self.sessions.run(&self.machine, &command).await?;
        if !output.success() {
            return Err(SiteError::RemoteExecution(format!(
                "status query for {} failed: {}",
                native_id,
                output.stderr.trim()
            )));
        }

        match output.stdout.split_whitespace().next() {
            Some(native_status) => Ok(StatusEvent::from_native(
                context.clone(),
                &self.status_map,
                native_status,
            )),
            None => Ok(StatusEvent::new(context.clone(), JobStatus::Unknown)),
        }
    }

    async fn cancel_job(&self, context: &JobContext) -> SiteResult<bool> {
        let Some(template) = &self.config.cancel_cmd else {
            return Err(SiteError::unsupported("run.cancel_job"));
        };
        let Some(native_id) = context.native_id() else {
            return Ok(false);
        };

        let command = template.replace("{id}", native_id);
        let output = self.sessions.run(&self.machine, &command).await?;
        // cancellation is confirmed by a later observed CANCELLED status,
        // never assumed from the request being accepted
        Ok(output.success())
    }

    async fn compute_types(&self) -> SiteResult<Vec<String>> {
        Ok(self.config.compute_types.clone())
    }

    async fn job_list(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> SiteResult<Vec<String>> {
        let Some(template) = &self.config.list_cmd else {
            return Err(SiteError::unsupported("run.job_list"));
        };

        let command = template
            .replace("{start}", &start.timestamp().to_string())
            .replace("{end}", &end.timestamp().to_string());
        let output = self.sessions.run(&self.machine, &command).await?;
        Ok(output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }
}
