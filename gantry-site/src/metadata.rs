//! Metadata collaborator contract
//!
//! The metadata notation/retrieval subsystem is an external collaborator; the
//! middleware consumes it only through this opaque contract. Repo drivers
//! notate data movement through it and the engine facade passes find/update
//! through. [`LocalMetadata`] is the process-local stand-in used by tests and
//! single-node deployments.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Result type alias for metadata collaborator calls
pub type MetadataResult<T> = std::result::Result<T, MetadataError>;

/// Errors surfaced by the metadata collaborator
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("metadata document not found: {0}")]
    NotFound(String),

    #[error("metadata service unavailable: {0}")]
    Unavailable(String),
}

/// The opaque notate/find/update contract.
///
/// Documents are free-form JSON addressed by id; `find` matches documents
/// whose top-level fields contain every filter key/value pair.
#[async_trait]
pub trait MetadataClient: Send + Sync {
    /// Store a document, returning its assigned id.
    async fn notate(&self, doc: Value) -> MetadataResult<String>;

    /// Documents whose top-level fields contain every filter pair.
    async fn find(&self, filters: &HashMap<String, String>) -> MetadataResult<Vec<Value>>;

    /// Merge fields into an existing document.
    async fn update(&self, doc_id: &str, fields: Value) -> MetadataResult<()>;
}

/// Process-local implementation of [`MetadataClient`].
#[derive(Default)]
pub struct LocalMetadata {
    docs: RwLock<HashMap<String, Value>>,
}

impl LocalMetadata {
    pub fn new() -> Self {
        Self::default()
    }
}

fn field_matches(doc: &Value, key: &str, expected: &str) -> bool {
    match doc.get(key) {
        Some(Value::String(s)) => s == expected,
        Some(other) => other.to_string() == expected,
        None => false,
    }
}

#[async_trait]
impl MetadataClient for LocalMetadata {
    async fn notate(&self, doc: Value) -> MetadataResult<String> {
        let id = Uuid::new_v4().to_string();
        self.docs.write().await.insert(id.clone(), doc);
        Ok(id)
    }

    async fn find(&self, filters: &HashMap<String, String>) -> MetadataResult<Vec<Value>> {
        let docs = self.docs.read().await;
        Ok(docs
            .values()
            .filter(|doc| {
                filters
                    .iter()
                    .all(|(key, expected)| field_matches(doc, key, expected))
            })
            .cloned()
            .collect())
    }

    async fn update(&self, doc_id: &str, fields: Value) -> MetadataResult<()> {
        let mut docs = self.docs.write().await;
        let doc = docs
            .get_mut(doc_id)
            .ok_or_else(|| MetadataError::NotFound(doc_id.to_string()))?;
        if let (Value::Object(target), Value::Object(updates)) = (doc, fields) {
            for (key, value) in updates {
                target.insert(key, value);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn notate_then_find_by_field() {
        let meta = LocalMetadata::new();
        meta.notate(json!({"site": "local", "kind": "output"}))
            .await
            .unwrap();
        meta.notate(json!({"site": "cluster", "kind": "output"}))
            .await
            .unwrap();

        let filters: HashMap<_, _> = [("site".to_string(), "local".to_string())].into();
        let found = meta.find(&filters).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0]["site"], "local");
    }

    #[tokio::test]
    async fn update_merges_fields() {
        let meta = LocalMetadata::new();
        let id = meta.notate(json!({"site": "local"})).await.unwrap();
        meta.update(&id, json!({"checked": "yes"})).await.unwrap();

        let filters: HashMap<_, _> = [("checked".to_string(), "yes".to_string())].into();
        assert_eq!(meta.find(&filters).await.unwrap().len(), 1);

        let missing = meta.update("no-such-id", json!({})).await;
        assert!(matches!(missing, Err(MetadataError::NotFound(_))));
    }
}
