//! Workflow record

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A named grouping of related jobs, potentially spanning sites.
///
/// Registration is optional: the workflow id on a [`JobContext`] groups jobs
/// whether or not a record exists for it.
///
/// [`JobContext`]: crate::domain::job::JobContext
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: Uuid,
    pub name: Option<String>,
    pub description: Option<String>,
    pub props: HashMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl Workflow {
    pub fn new(name: Option<String>, description: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name,
            description,
            props: HashMap::new(),
            created_at: Utc::now(),
        }
    }
}
