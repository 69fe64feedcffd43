//! Local site driver
//!
//! Runs jobs on this machine through the system shell. Submission spawns the
//! process, pushes `Pending` onto the driver's status channel and returns
//! the same event; a watcher task pushes the rest of the lifecycle
//! (`Running`, then `Finishing` and `Complete`, or `Failed` with captured
//! stderr). Pushing every event through the one channel keeps the lifecycle
//! in order end to end. Repo verbs are filesystem copies that notate the
//! metadata collaborator and surface an `Info` event so data movement is
//! visible on the status stream.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{info, warn};
use uuid::Uuid;

use gantry_core::domain::job::{JobContext, JobDefn};
use gantry_core::domain::status::{JobStatus, StatusEvent};
use gantry_core::error::SiteResult;

use crate::capability::{Site, SiteAuth, SiteRepo, SiteRun, UnsupportedSpin};
use crate::metadata::MetadataClient;

/// Environment variable carrying the job id into the child process.
pub const JOB_ID_ENV: &str = "GANTRY_JOB_ID";

/// Assemble the local site under the given registry name.
pub fn local_site(
    name: impl Into<String>,
    status_tx: mpsc::UnboundedSender<StatusEvent>,
    metadata: Arc<dyn MetadataClient>,
) -> Site {
    let name = name.into();
    Site::new(
        name,
        Arc::new(LocalAuth),
        Arc::new(LocalRun::new(status_tx.clone())),
        Arc::new(LocalRepo::new(status_tx, metadata)),
        Arc::new(UnsupportedSpin),
    )
}

/// The user on this machine is already themselves; login always holds.
pub struct LocalAuth;

#[async_trait]
impl SiteAuth for LocalAuth {
    async fn login(&self, _force: bool) -> SiteResult<bool> {
        Ok(true)
    }

    async fn is_auth_current(&self) -> SiteResult<bool> {
        Ok(true)
    }
}

/// Run capability backed by `sh -c` subprocesses.
pub struct LocalRun {
    status_tx: mpsc::UnboundedSender<StatusEvent>,
    /// Cancel handles for jobs still in flight.
    running: Arc<Mutex<HashMap<Uuid, oneshot::Sender<()>>>>,
}

impl LocalRun {
    pub fn new(status_tx: mpsc::UnboundedSender<StatusEvent>) -> Self {
        Self {
            status_tx,
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

#[async_trait]
impl SiteRun for LocalRun {
    async fn submit_job(&self, defn: &JobDefn, mut context: JobContext) -> SiteResult<StatusEvent> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(defn.command_line())
            .env(JOB_ID_ENV, context.job_id.to_string())
            .stdin(Stdio::null())
            // jobs communicate through files and statuses; stdout is discarded
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => {
                warn!(job_id = %context.job_id, error = %err, "local spawn failed");
                let failed = StatusEvent::failed(context, err.to_string());
                let _ = self.status_tx.send(failed.clone());
                return Ok(failed);
            }
        };

        if let Some(pid) = child.id() {
            context.set_native_id(pid.to_string());
        }

        let (cancel_tx, mut cancel_rx) = oneshot::channel();
        self.running.lock().await.insert(context.job_id, cancel_tx);

        // Pending goes onto the channel before the watcher starts, so it
        // always precedes the watcher's Running.
        let pending = StatusEvent::new(context.clone(), JobStatus::Pending);
        let _ = self.status_tx.send(pending.clone());

        let ctx = context.clone();
        let tx = self.status_tx.clone();
        let running = self.running.clone();
        tokio::spawn(async move {
            let _ = tx.send(StatusEvent::new(ctx.clone(), JobStatus::Running));

            // Drain stderr concurrently so the pipe can never fill up.
            let stderr = child.stderr.take();
            let drain = tokio::spawn(async move {
                let mut buf = String::new();
                if let Some(mut pipe) = stderr {
                    let _ = pipe.read_to_string(&mut buf).await;
                }
                buf
            });

            let waited = tokio::select! {
                status = child.wait() => Some(status),
                _ = &mut cancel_rx => None,
            };

            match waited {
                Some(Ok(status)) if status.success() => {
                    let _ = tx.send(StatusEvent::new(ctx.clone(), JobStatus::Finishing));
                    let _ = tx.send(StatusEvent::new(ctx.clone(), JobStatus::Complete));
                }
                Some(Ok(status)) => {
                    let stderr_text = drain.await.unwrap_or_default();
                    let diagnostic = if stderr_text.trim().is_empty() {
                        format!("exit code {}", status.code().unwrap_or(-1))
                    } else {
                        stderr_text.trim().to_string()
                    };
                    let _ = tx.send(StatusEvent::failed(ctx.clone(), diagnostic));
                }
                Some(Err(err)) => {
                    let _ = tx.send(StatusEvent::failed(ctx.clone(), err.to_string()));
                }
                None => {
                    if let Err(err) = child.kill().await {
                        warn!(job_id = %ctx.job_id, error = %err, "kill failed");
                    }
                    let _ = tx.send(StatusEvent::new(ctx.clone(), JobStatus::Cancelled));
                }
            }

            running.lock().await.remove(&ctx.job_id);
        });

        info!(job_id = %context.job_id, native_id = ?context.native_id(), "local job submitted");
        Ok(pending)
    }

    async fn job_status(&self, context: &JobContext) -> SiteResult<StatusEvent> {
        let status = if self.running.lock().await.contains_key(&context.job_id) {
            JobStatus::Running
        } else {
            // the driver keeps no history; terminal state lives in the store
            JobStatus::Unknown
        };
        Ok(StatusEvent::new(context.clone(), status))
    }

    async fn cancel_job(&self, context: &JobContext) -> SiteResult<bool> {
        match self.running.lock().await.remove(&context.job_id) {
            Some(cancel) => Ok(cancel.send(()).is_ok()),
            None => Ok(false),
        }
    }

    async fn compute_types(&self) -> SiteResult<Vec<String>> {
        Ok(vec!["default".to_string()])
    }
}

/// Repo capability backed by filesystem copies.
pub struct LocalRepo {
    status_tx: mpsc::UnboundedSender<StatusEvent>,
    metadata: Arc<dyn MetadataClient>,
}

impl LocalRepo {
    pub fn new(
        status_tx: mpsc::UnboundedSender<StatusEvent>,
        metadata: Arc<dyn MetadataClient>,
    ) -> Self {
        Self {
            status_tx,
            metadata,
        }
    }

    async fn notate_movement(&self, op: &str, local: &str, remote: &str, context: &JobContext) {
        let doc = json!({
            "op": op,
            "local": local,
            "remote": remote,
            "site": context.site_name,
            "job_id": context.job_id.to_string(),
        });
        if let Err(err) = self.metadata.notate(doc).await {
            warn!(job_id = %context.job_id, error = %err, "metadata notate failed");
        }
        let signature = StatusEvent::repo_signature(op, local, remote);
        let _ = self
            .status_tx
            .send(StatusEvent::info(context.clone(), signature));
    }
}

#[async_trait]
impl SiteRepo for LocalRepo {
    async fn put(
        &self,
        local: &Path,
        site_ref: &str,
        context: &JobContext,
    ) -> SiteResult<String> {
        tokio::fs::copy(local, site_ref).await?;
        self.notate_movement("put", &local.display().to_string(), site_ref, context)
            .await;
        Ok(site_ref.to_string())
    }

    async fn get(
        &self,
        site_ref: &str,
        local: &Path,
        context: &JobContext,
    ) -> SiteResult<PathBuf> {
        tokio::fs::copy(site_ref, local).await?;
        self.notate_movement("get", &local.display().to_string(), site_ref, context)
            .await;
        Ok(local.to_path_buf())
    }

    /// Pattern is a path prefix: entries of the parent directory whose names
    /// start with the final component.
    async fn find(&self, pattern: &str) -> SiteResult<Vec<String>> {
        let path = Path::new(pattern);
        let (dir, prefix) = match (path.parent(), path.file_name()) {
            (Some(dir), Some(name)) if !dir.as_os_str().is_empty() => {
                (dir.to_path_buf(), name.to_string_lossy().to_string())
            }
            _ => (PathBuf::from("."), pattern.to_string()),
        };

        let mut matches = Vec::new();
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with(&prefix) {
                matches.push(dir.join(name).display().to_string());
            }
        }
        matches.sort();
        Ok(matches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::LocalMetadata;
    use std::time::Duration;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(10);

    fn driver() -> (LocalRun, mpsc::UnboundedReceiver<StatusEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (LocalRun::new(tx), rx)
    }

    async fn next_status(rx: &mut mpsc::UnboundedReceiver<StatusEvent>) -> StatusEvent {
        timeout(WAIT, rx.recv())
            .await
            .expect("status event in time")
            .expect("channel open")
    }

    #[tokio::test]
    async fn successful_job_runs_to_complete() {
        let (run, mut rx) = driver();
        let pending = run
            .submit_job(&JobDefn::new("true"), JobContext::new("local"))
            .await
            .unwrap();
        assert_eq!(pending.status, JobStatus::Pending);
        assert!(pending.context.native_id().is_some());

        assert_eq!(next_status(&mut rx).await.status, JobStatus::Pending);
        assert_eq!(next_status(&mut rx).await.status, JobStatus::Running);
        assert_eq!(next_status(&mut rx).await.status, JobStatus::Finishing);
        let done = next_status(&mut rx).await;
        assert_eq!(done.status, JobStatus::Complete);
        assert_eq!(done.context.job_id, pending.context.job_id);
    }

    #[tokio::test]
    async fn failing_job_reports_diagnostics() {
        let (run, mut rx) = driver();
        run.submit_job(
            &JobDefn::new("echo boom >&2; exit 3"),
            JobContext::new("local"),
        )
        .await
        .unwrap();

        assert_eq!(next_status(&mut rx).await.status, JobStatus::Pending);
        assert_eq!(next_status(&mut rx).await.status, JobStatus::Running);
        let failed = next_status(&mut rx).await;
        assert_eq!(failed.status, JobStatus::Failed);
        let info = failed.info.unwrap();
        assert!(info.get("error").unwrap().contains("boom"));
    }

    #[tokio::test]
    async fn cancel_kills_running_job() {
        let (run, mut rx) = driver();
        let pending = run
            .submit_job(&JobDefn::new("sleep 30"), JobContext::new("local"))
            .await
            .unwrap();

        assert_eq!(next_status(&mut rx).await.status, JobStatus::Pending);
        assert_eq!(next_status(&mut rx).await.status, JobStatus::Running);
        assert!(run.cancel_job(&pending.context).await.unwrap());
        assert_eq!(next_status(&mut rx).await.status, JobStatus::Cancelled);

        // a second cancel finds nothing to kill
        assert!(!run.cancel_job(&pending.context).await.unwrap());
    }

    #[tokio::test]
    async fn repo_put_copies_notates_and_emits_info() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("in.dat");
        let dst = dir.path().join("out.dat");
        tokio::fs::write(&src, b"payload").await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let metadata = Arc::new(LocalMetadata::new());
        let repo = LocalRepo::new(tx, metadata.clone());
        let ctx = JobContext::new("local");

        let site_ref = repo
            .put(&src, &dst.display().to_string(), &ctx)
            .await
            .unwrap();
        assert_eq!(tokio::fs::read(&dst).await.unwrap(), b"payload");

        let event = rx.recv().await.unwrap();
        assert_eq!(event.status, JobStatus::Info);
        let sig = event.info.unwrap();
        assert_eq!(sig.get("op").unwrap(), "put");
        assert_eq!(sig.get("remote").unwrap(), &site_ref);

        let filters: HashMap<_, _> = [("op".to_string(), "put".to_string())].into();
        assert_eq!(metadata.find(&filters).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn repo_find_matches_prefix() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["run7_a.dat", "run7_b.dat", "run8.dat"] {
            tokio::fs::write(dir.path().join(name), b"x").await.unwrap();
        }

        let (tx, _rx) = mpsc::unbounded_channel();
        let repo = LocalRepo::new(tx, Arc::new(LocalMetadata::new()));
        let pattern = dir.path().join("run7").display().to_string();
        let found = repo.find(&pattern).await.unwrap();
        assert_eq!(found.len(), 2);
        assert!(found.iter().all(|p| p.contains("run7")));
    }
}
