//! Gantry Engine
//!
//! The in-process middleware that turns individual site drivers into a
//! digital thread. It owns the canonical status stream, the trigger engine
//! that chains jobs off observed events, the poller that tracks jobs on
//! sites that cannot push, and the append-only provenance store behind all
//! of it.
//!
//! Layering:
//! - `store`: append-only persistence for jobs, statuses, handlers, data
//!   lineage and workflows
//! - `hub`: single ingestion point for status events; enforces terminal
//!   absorption and monotonic emit times, then fans events out
//! - `trigger`: handler registration and event matching
//! - `poller`: adaptive status polling for pull-only sites
//! - `service`: the facade workflows call

pub mod config;
pub mod db;
pub mod hub;
pub mod poller;
pub mod service;
pub mod store;
pub mod trigger;
