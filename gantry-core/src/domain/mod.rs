//! Core domain types
//!
//! This module contains the domain structures shared across gantry crates.
//! Site drivers produce them, the engine persists and reacts to them.

pub mod event;
pub mod job;
pub mod status;
pub mod workflow;
