//! Remote session manager
//!
//! At most one live authenticated session exists per machine, held in a
//! registry of per-machine slots with create-if-absent semantics: the first
//! caller logs in while holding the machine's slot lock, concurrent callers
//! for that machine block on it and reuse the result, and callers for other
//! machines are unaffected. Each session owns a keepalive task issuing a
//! no-op on a fixed interval; the task handle is aborted when the session is
//! torn down.
//!
//! The retry policy lives in [`SessionManager::run`]: on a channel failure
//! the shared session is invalidated (every holder re-acquires), one re-login
//! happens lazily on the next acquire, and the command is retried once.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use gantry_core::error::{SiteError, SiteResult};

use crate::config::RemoteShellConfig;
use crate::remote::transport::{ProcessTransport, ShellOutput, ShellTransport};

/// Builds a transport for a machine. Injected so tests can script failures.
pub type TransportFactory = Box<dyn Fn(&str) -> Arc<dyn ShellTransport> + Send + Sync>;

/// One live authenticated session to one machine.
pub struct RemoteSession {
    machine: String,
    transport: Arc<dyn ShellTransport>,
    keepalive: JoinHandle<()>,
}

impl RemoteSession {
    fn start(
        machine: String,
        transport: Arc<dyn ShellTransport>,
        interval: Duration,
        noop: String,
    ) -> Arc<Self> {
        let keepalive = {
            let transport = transport.clone();
            let machine = machine.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                // the login probe just ran; skip the immediate first tick
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    if let Err(err) = transport.exec(&noop).await {
                        warn!(machine = %machine, error = %err, "keepalive no-op failed");
                    }
                }
            })
        };
        Arc::new(Self {
            machine,
            transport,
            keepalive,
        })
    }

    pub async fn run(&self, command: &str) -> SiteResult<ShellOutput> {
        self.transport.exec(command).await
    }

    pub fn machine(&self) -> &str {
        &self.machine
    }

    /// Stop the keepalive task.
    pub fn teardown(&self) {
        self.keepalive.abort();
    }
}

impl Drop for RemoteSession {
    fn drop(&mut self) {
        self.keepalive.abort();
    }
}

/// One machine's session slot. The slot lock serializes login for that
/// machine only; the registry lock is held just long enough to find or
/// create the slot.
type MachineSlot = Arc<Mutex<Option<Arc<RemoteSession>>>>;

/// Machine-keyed registry of shared sessions for one site.
pub struct SessionManager {
    site_name: String,
    keepalive_interval: Duration,
    keepalive_cmd: String,
    login_probe: String,
    factory: TransportFactory,
    sessions: Mutex<HashMap<String, MachineSlot>>,
    relogins: AtomicU64,
}

impl SessionManager {
    pub fn new(site_name: impl Into<String>, config: &RemoteShellConfig) -> Self {
        let prefix = config.shell_prefix.clone();
        let factory: TransportFactory = Box::new(move |machine| {
            Arc::new(ProcessTransport::for_machine(&prefix, machine)) as Arc<dyn ShellTransport>
        });
        Self::with_transport_factory(site_name, config, factory)
    }

    pub fn with_transport_factory(
        site_name: impl Into<String>,
        config: &RemoteShellConfig,
        factory: TransportFactory,
    ) -> Self {
        Self {
            site_name: site_name.into(),
            keepalive_interval: config.keepalive_interval(),
            keepalive_cmd: config.keepalive_cmd.clone(),
            login_probe: config.login_probe.clone(),
            factory,
            sessions: Mutex::new(HashMap::new()),
            relogins: AtomicU64::new(0),
        }
    }

    /// Times a shared session was force-refreshed after a channel failure.
    pub fn relogin_count(&self) -> u64 {
        self.relogins.load(Ordering::Relaxed)
    }

    pub async fn has_session(&self, machine: &str) -> bool {
        let slot = self.sessions.lock().await.get(machine).cloned();
        match slot {
            Some(slot) => slot.lock().await.is_some(),
            None => false,
        }
    }

    /// The machine's slot, created empty if absent.
    async fn slot(&self, machine: &str) -> MachineSlot {
        self.sessions
            .lock()
            .await
            .entry(machine.to_string())
            .or_default()
            .clone()
    }

    /// The live session for `machine`, logging in first if none exists.
    /// Creation holds the machine's slot lock, so exactly one login happens
    /// no matter how many callers race here, and callers targeting other
    /// machines are never held up by it.
    pub async fn session(&self, machine: &str) -> SiteResult<Arc<RemoteSession>> {
        let slot = self.slot(machine).await;
        let mut guard = slot.lock().await;
        if let Some(session) = guard.as_ref() {
            return Ok(session.clone());
        }

        let transport = (self.factory)(machine);
        transport.exec(&self.login_probe).await.map_err(|err| {
            SiteError::authentication(
                &self.site_name,
                format!("login to {} failed: {}", machine, err),
            )
        })?;
        info!(site = %self.site_name, machine = %machine, "remote session established");

        let session = RemoteSession::start(
            machine.to_string(),
            transport,
            self.keepalive_interval,
            self.keepalive_cmd.clone(),
        );
        *guard = Some(session.clone());
        Ok(session)
    }

    /// Drop `session` from its slot so every holder re-acquires. A newer
    /// session already registered under the same machine is left alone.
    pub async fn invalidate(&self, session: &Arc<RemoteSession>) {
        let slot = self.slot(session.machine()).await;
        let mut guard = slot.lock().await;
        if let Some(current) = guard.as_ref() {
            if Arc::ptr_eq(current, session) {
                *guard = None;
            }
        }
        session.teardown();
    }

    /// Tear down whatever session is registered for `machine`.
    pub async fn invalidate_machine(&self, machine: &str) {
        let slot = self.sessions.lock().await.get(machine).cloned();
        if let Some(slot) = slot {
            if let Some(session) = slot.lock().await.take() {
                session.teardown();
            }
        }
    }

    /// Run a command on `machine`: on a channel failure, force exactly one
    /// re-login and retry once, then surface the error.
    pub async fn run(&self, machine: &str, command: &str) -> SiteResult<ShellOutput> {
        let mut refreshed = false;
        loop {
            let session = self.session(machine).await?;
            match session.run(command).await {
                Ok(output) => return Ok(output),
                Err(err) if err.is_transient() && !refreshed => {
                    warn!(machine = %machine, error = %err, "channel failure, forcing re-login");
                    self.invalidate(&session).await;
                    self.relogins.fetch_add(1, Ordering::Relaxed);
                    refreshed = true;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Service shutdown: tear down every live session.
    pub async fn teardown_all(&self) {
        let slots: Vec<MachineSlot> = self.sessions.lock().await.drain().map(|(_, s)| s).collect();
        for slot in slots {
            if let Some(session) = slot.lock().await.take() {
                session.teardown();
            }
        }
    }
}
