//! Gantry Core
//!
//! Domain types for the gantry workflow middleware.
//!
//! This crate contains:
//! - Domain types: canonical status machine, job identity, trigger rules
//! - The site-facing error enum shared by drivers and the engine
//!
//! No IO or async code lives here; the site and engine crates build on these
//! types.

pub mod domain;
pub mod error;
