//! Site registry
//!
//! Maps registered site names to live [`Site`] handles. Lookup is by the name
//! a site was registered under, which is also the name job contexts carry, so
//! a trigger firing long after registration still resolves to the same
//! driver instance and its shared sessions.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, mpsc};
use tracing::info;

use gantry_core::domain::status::StatusEvent;

use crate::capability::Site;
use crate::config::{ConfigError, DriverKind, SitesFile};
use crate::local::local_site;
use crate::metadata::MetadataClient;
use crate::remote::remote_shell_site;

/// Shared services every driver is wired with at construction.
pub struct DriverDeps {
    /// Where push-capable drivers emit lifecycle events.
    pub status_tx: mpsc::UnboundedSender<StatusEvent>,
    /// Metadata sink used by repo operations.
    pub metadata: Arc<dyn MetadataClient>,
}

/// Name-keyed collection of live sites.
#[derive(Default)]
pub struct SiteRegistry {
    sites: RwLock<HashMap<String, Arc<Site>>>,
}

impl std::fmt::Debug for SiteRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SiteRegistry").finish_non_exhaustive()
    }
}

impl SiteRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry with one driver per configured site.
    pub fn from_config(config: &SitesFile, deps: &DriverDeps) -> Result<Self, ConfigError> {
        config.validate()?;
        let mut sites = HashMap::new();
        for site_config in &config.sites {
            let site = match site_config.driver {
                DriverKind::Local => local_site(
                    &site_config.name,
                    deps.status_tx.clone(),
                    deps.metadata.clone(),
                ),
                DriverKind::RemoteShell => {
                    let remote = site_config.remote.clone().ok_or_else(|| {
                        ConfigError::Invalid(format!(
                            "site '{}' uses the remote-shell driver but has no [sites.remote] table",
                            site_config.name
                        ))
                    })?;
                    remote_shell_site(&site_config.name, remote)?
                }
            };
            info!(site = %site.name(), "site registered");
            sites.insert(site.name().to_string(), Arc::new(site));
        }
        Ok(Self {
            sites: RwLock::new(sites),
        })
    }

    pub async fn register(&self, site: Site) {
        info!(site = %site.name(), "site registered");
        self.sites
            .write()
            .await
            .insert(site.name().to_string(), Arc::new(site));
    }

    pub async fn lookup(&self, name: &str) -> Option<Arc<Site>> {
        self.sites.read().await.get(name).cloned()
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.sites.read().await.contains_key(name)
    }

    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sites.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::LocalMetadata;

    fn deps() -> (DriverDeps, mpsc::UnboundedReceiver<StatusEvent>) {
        let (status_tx, status_rx) = mpsc::unbounded_channel();
        (
            DriverDeps {
                status_tx,
                metadata: Arc::new(LocalMetadata::new()),
            },
            status_rx,
        )
    }

    #[tokio::test]
    async fn builds_sites_from_config() {
        let toml = r#"
            [[sites]]
            name = "local"
            driver = "local"

            [[sites]]
            name = "cluster"
            driver = "remote-shell"

            [sites.remote]
            host = "hpc.example.gov"
            user = "svc"
            submit_cmd = "bsub"
        "#;
        let config = SitesFile::from_toml_str(toml).unwrap();
        let (deps, _rx) = deps();
        let registry = SiteRegistry::from_config(&config, &deps).unwrap();

        assert!(registry.contains("local").await);
        assert!(registry.contains("cluster").await);
        assert_eq!(registry.names().await, vec!["cluster", "local"]);

        let local = registry.lookup("local").await.unwrap();
        assert!(!local.polls_status());
        let cluster = registry.lookup("cluster").await.unwrap();
        assert!(cluster.polls_status());
    }

    #[tokio::test]
    async fn remote_driver_requires_remote_table() {
        // built by hand: from_toml_str would already reject this file
        let config = SitesFile {
            sites: vec![crate::config::SiteConfig {
                name: "cluster".into(),
                driver: DriverKind::RemoteShell,
                remote: None,
            }],
        };
        let (deps, _rx) = deps();
        let err = SiteRegistry::from_config(&config, &deps).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[tokio::test]
    async fn lookup_misses_unregistered_names() {
        let registry = SiteRegistry::new();
        assert!(registry.lookup("nowhere").await.is_none());
        assert!(!registry.contains("nowhere").await);
    }
}
