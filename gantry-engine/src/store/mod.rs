//! Store Module
//!
//! Append-only persistence for the digital thread. Each store handles
//! database operations for one record kind. Status rows are never updated in
//! place; the only in-place writes are the native-id fold-in on a job row
//! and the fired mark on trigger handlers.

pub mod data;
pub mod handler;
pub mod job;
pub mod status;
pub mod workflow;

// Re-export for convenience
pub use data as data_store;
pub use handler as handler_store;
pub use job as job_store;
pub use status as status_store;
pub use workflow as workflow_store;
