//! Site registry configuration
//!
//! A deployment describes its sites in a TOML file read once at startup
//! (path in `GANTRY_SITES`); each entry names a driver kind and its
//! parameters. Adding a machine to a remote-shell site family means adding a
//! configuration record here, not writing a driver.
//!
//! ```toml
//! [[sites]]
//! name = "local"
//! driver = "local"
//!
//! [[sites]]
//! name = "cluster"
//! driver = "remote-shell"
//!
//! [sites.remote]
//! host = "hpc.example.gov"
//! user = "jdoe"
//! submit_cmd = "bsub"
//! status_cmd = "bjobs -noheader -o stat {id}"
//! cancel_cmd = "bkill {id}"
//!
//! [sites.remote.status_map]
//! PEND = "PENDING"
//! RUN = "RUNNING"
//! DONE = "COMPLETE"
//! EXIT = "FAILED"
//! ```

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use gantry_core::domain::status::{JobStatus, StatusMap};

/// Environment variable naming the sites file.
pub const SITES_FILE_ENV: &str = "GANTRY_SITES";

const DEFAULT_KEEPALIVE_SECS: u64 = 300;

/// Errors raised while loading or validating site configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read sites file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse sites file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid site configuration: {0}")]
    Invalid(String),
}

/// The whole sites file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SitesFile {
    #[serde(default)]
    pub sites: Vec<SiteConfig>,
}

/// One site entry.
#[derive(Debug, Clone, Deserialize)]
pub struct SiteConfig {
    pub name: String,
    pub driver: DriverKind,
    /// Remote-shell parameters; required when `driver = "remote-shell"`.
    #[serde(default)]
    pub remote: Option<RemoteShellConfig>,
}

/// Which driver implementation backs a site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DriverKind {
    Local,
    RemoteShell,
}

/// Parameters for one remote-shell site.
///
/// Command templates use `{id}` for the native job id and `{start}`/`{end}`
/// for time bounds. `shell_prefix` is the argv that reaches the remote shell;
/// the machine (`user@host`) and then the command are appended to it.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteShellConfig {
    pub host: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default = "default_shell_prefix")]
    pub shell_prefix: Vec<String>,
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
    /// No-op issued on the keepalive interval to hold the session open.
    #[serde(default = "default_noop_cmd")]
    pub keepalive_cmd: String,
    /// Command run to establish/verify the authenticated session.
    #[serde(default = "default_noop_cmd")]
    pub login_probe: String,
    /// Submission prefix (e.g. `bsub`); absent means the job's command line
    /// runs as-is.
    #[serde(default)]
    pub submit_cmd: Option<String>,
    #[serde(default)]
    pub status_cmd: Option<String>,
    #[serde(default)]
    pub cancel_cmd: Option<String>,
    #[serde(default)]
    pub list_cmd: Option<String>,
    #[serde(default)]
    pub compute_types: Vec<String>,
    /// Native status vocabulary, values being canonical status names.
    #[serde(default)]
    pub status_map: HashMap<String, String>,
}

fn default_shell_prefix() -> Vec<String> {
    vec!["ssh".to_string(), "-T".to_string()]
}

fn default_keepalive_secs() -> u64 {
    DEFAULT_KEEPALIVE_SECS
}

fn default_noop_cmd() -> String {
    "true".to_string()
}

impl RemoteShellConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            user: None,
            shell_prefix: default_shell_prefix(),
            keepalive_secs: DEFAULT_KEEPALIVE_SECS,
            keepalive_cmd: default_noop_cmd(),
            login_probe: default_noop_cmd(),
            submit_cmd: None,
            status_cmd: None,
            cancel_cmd: None,
            list_cmd: None,
            compute_types: Vec::new(),
            status_map: HashMap::new(),
        }
    }

    /// Session registry key for this endpoint.
    pub fn machine(&self) -> String {
        match &self.user {
            Some(user) => format!("{}@{}", user, self.host),
            None => self.host.clone(),
        }
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }

    /// Parse the configured native vocabulary into a [`StatusMap`].
    pub fn parsed_status_map(&self) -> Result<StatusMap, ConfigError> {
        let mut map = StatusMap::new();
        for (native, canonical) in &self.status_map {
            let status = JobStatus::from_str(canonical).map_err(|_| {
                ConfigError::Invalid(format!(
                    "status_map entry {:?} maps to unknown canonical status {:?}",
                    native, canonical
                ))
            })?;
            map.insert(native.clone(), status);
        }
        Ok(map)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.is_empty() {
            return Err(ConfigError::Invalid("remote host cannot be empty".into()));
        }
        if self.shell_prefix.is_empty() {
            return Err(ConfigError::Invalid(
                "shell_prefix cannot be empty".into(),
            ));
        }
        if self.keepalive_secs == 0 {
            return Err(ConfigError::Invalid(
                "keepalive_secs must be greater than 0".into(),
            ));
        }
        for (field, template) in [("status_cmd", &self.status_cmd), ("cancel_cmd", &self.cancel_cmd)]
        {
            if let Some(t) = template {
                if !t.contains("{id}") {
                    return Err(ConfigError::Invalid(format!(
                        "{} template must contain {{id}}",
                        field
                    )));
                }
            }
        }
        self.parsed_status_map()?;
        Ok(())
    }
}

impl SiteConfig {
    /// A local-driver entry.
    pub fn local(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            driver: DriverKind::Local,
            remote: None,
        }
    }

    /// A remote-shell entry.
    pub fn remote_shell(name: impl Into<String>, remote: RemoteShellConfig) -> Self {
        Self {
            name: name.into(),
            driver: DriverKind::RemoteShell,
            remote: Some(remote),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::Invalid("site name cannot be empty".into()));
        }
        match self.driver {
            DriverKind::Local => Ok(()),
            DriverKind::RemoteShell => match &self.remote {
                Some(remote) => remote.validate(),
                None => Err(ConfigError::Invalid(format!(
                    "site {:?} uses the remote-shell driver but has no [sites.remote] table",
                    self.name
                ))),
            },
        }
    }
}

impl SitesFile {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let file: SitesFile = toml::from_str(s)?;
        file.validate()?;
        Ok(file)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Load from the path in `GANTRY_SITES`, or fall back to a single local
    /// site.
    pub fn from_env() -> Result<Self, ConfigError> {
        match std::env::var(SITES_FILE_ENV) {
            Ok(path) => Self::load(Path::new(&path)),
            Err(_) => Ok(Self::local_only()),
        }
    }

    /// The fallback registry: one local site named "local".
    pub fn local_only() -> Self {
        Self {
            sites: vec![SiteConfig::local("local")],
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for site in &self.sites {
            site.validate()?;
            if !seen.insert(site.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate site name {:?}",
                    site.name
                )));
            }
        }
        Ok(())
    }
}
