//! Gantry Site
//!
//! The site capability layer: the four-verb-group abstraction every compute
//! site satisfies, the site registry and its configuration, and the two
//! shipped drivers.
//!
//! - [`capability`]: Auth/Run/Repo/Spin traits and the [`capability::Site`]
//!   bundle
//! - [`registry`]: name-to-site lookup built from configuration at startup
//! - [`local`]: driver running jobs on this machine via the system shell
//! - [`remote`]: config-parameterized remote-shell driver with the shared
//!   session, keepalive and retry-on-reset behavior
//! - [`metadata`]: the opaque notate/find/update collaborator contract

pub mod capability;
pub mod config;
pub mod local;
pub mod metadata;
pub mod registry;
pub mod remote;
