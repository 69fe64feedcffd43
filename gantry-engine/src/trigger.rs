//! Trigger engine
//!
//! Holds the registered [`JobEventHandler`] rules, watches the status
//! stream and, when an event matches, hands the handler's action to the
//! dispatcher. Matching walks handlers in registration order. A one-shot
//! handler is consumed in memory and marked fired in the store before its
//! action is dispatched, so a duplicate delivery of the same event fires
//! nothing.
//!
//! Firing is fire-and-forget: the outcome of the chained submission is its
//! own job's history and never reported back through the handler.

use std::sync::Arc;

use sqlx::SqlitePool;
use thiserror::Error;
use tokio::sync::{RwLock, broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use gantry_core::domain::event::{
    EventFilter, EventSelector, FiringMode, JobEventHandler, TriggerAction,
};
use gantry_core::domain::status::StatusEvent;
use gantry_site::registry::SiteRegistry;

use crate::store::handler_store;

#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("malformed filter: {0}")]
    MalformedFilter(String),
    #[error("unknown destination site '{0}'")]
    UnknownSite(String),
    #[error("handler store error: {0}")]
    Store(#[from] sqlx::Error),
}

/// A handler that matched, ready for its chained submission.
#[derive(Debug)]
pub struct FiredAction {
    pub handler_id: Uuid,
    pub action: TriggerAction,
    /// The event that fired the handler; the chained job's context is
    /// derived from its context unless the action carries one.
    pub cause: StatusEvent,
}

pub struct TriggerEngine {
    pool: SqlitePool,
    registry: Arc<SiteRegistry>,
    handlers: RwLock<Vec<JobEventHandler>>,
    actions_tx: mpsc::UnboundedSender<FiredAction>,
}

impl TriggerEngine {
    pub fn new(
        pool: SqlitePool,
        registry: Arc<SiteRegistry>,
        actions_tx: mpsc::UnboundedSender<FiredAction>,
    ) -> Self {
        Self {
            pool,
            registry,
            handlers: RwLock::new(Vec::new()),
            actions_tx,
        }
    }

    /// Reload unfired handlers from the store, replacing the in-memory set.
    pub async fn load(&self) -> Result<usize, TriggerError> {
        let loaded = handler_store::list_unfired(&self.pool).await?;
        let count = loaded.len();
        *self.handlers.write().await = loaded;
        if count > 0 {
            info!(handlers = count, "restored trigger handlers");
        }
        Ok(count)
    }

    /// Register a new trigger rule.
    ///
    /// The rule is persisted before it becomes active, so a crash between
    /// registration and firing cannot lose it.
    pub async fn register(
        &self,
        selector: EventSelector,
        filter: EventFilter,
        action: TriggerAction,
        mode: FiringMode,
    ) -> Result<JobEventHandler, TriggerError> {
        if !filter.is_well_formed() {
            return Err(TriggerError::MalformedFilter(
                "a data filter needs at least one key/value pair".to_string(),
            ));
        }
        if !self.registry.contains(&action.site_name).await {
            return Err(TriggerError::UnknownSite(action.site_name.clone()));
        }

        let handler = JobEventHandler::new(selector, filter, action, mode);
        handler_store::put(&self.pool, &handler).await?;
        self.handlers.write().await.push(handler.clone());

        info!(
            handler_id = %handler.id,
            site = %handler.action.site_name,
            "trigger handler registered"
        );
        Ok(handler)
    }

    /// Remove a rule before it fires.
    pub async fn unregister(&self, handler_id: Uuid) -> Result<bool, TriggerError> {
        let mut handlers = self.handlers.write().await;
        let before = handlers.len();
        handlers.retain(|h| h.id != handler_id);
        let removed = handlers.len() < before;
        drop(handlers);

        let deleted = handler_store::delete(&self.pool, handler_id).await?;
        Ok(removed || deleted)
    }

    /// Snapshot of the active rules, in registration order.
    pub async fn handlers(&self) -> Vec<JobEventHandler> {
        self.handlers.read().await.clone()
    }

    /// Match one event against the active rules and dispatch what fires.
    ///
    /// Returns how many handlers fired.
    pub async fn observe(&self, event: &StatusEvent) -> Result<usize, TriggerError> {
        // matching takes only the read lock, so evaluations of unrelated
        // events proceed concurrently
        let matched: Vec<JobEventHandler> = {
            let handlers = self.handlers.read().await;
            handlers
                .iter()
                .filter(|h| h.matches(event))
                .cloned()
                .collect()
        };
        if matched.is_empty() {
            return Ok(0);
        }

        if matched.iter().any(|h| h.mode == FiringMode::OneShot) {
            // one-shots are consumed by matching, not by dispatch outcome
            let mut handlers = self.handlers.write().await;
            handlers.retain(|h| {
                h.mode != FiringMode::OneShot || !matched.iter().any(|m| m.id == h.id)
            });
        }

        let mut fired = 0;
        for handler in matched {
            if handler.mode == FiringMode::OneShot
                && !handler_store::mark_fired(&self.pool, handler.id).await?
            {
                // a concurrent or earlier delivery already consumed it; the
                // store's fired mark is what keeps the firing single
                warn!(handler_id = %handler.id, "handler already fired, skipping");
                continue;
            }

            info!(
                handler_id = %handler.id,
                cause_job = %event.job_id(),
                site = %handler.action.site_name,
                "trigger fired"
            );
            let sent = self.actions_tx.send(FiredAction {
                handler_id: handler.id,
                action: handler.action,
                cause: event.clone(),
            });
            if sent.is_err() {
                warn!("action dispatcher is gone, dropping fired action");
                break;
            }
            fired += 1;
        }
        Ok(fired)
    }

    /// Evaluate every event on the hub's stream until it closes.
    pub fn run_eval(
        self: Arc<Self>,
        mut rx: broadcast::Receiver<StatusEvent>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if let Err(e) = self.observe(&event).await {
                            error!("trigger evaluation failed: {}", e);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "trigger evaluation lagged behind the status stream");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("trigger evaluation stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory_pool;
    use gantry_core::domain::job::{JobContext, JobDefn};
    use gantry_core::domain::status::JobStatus;
    use gantry_site::local::local_site;
    use gantry_site::metadata::LocalMetadata;
    use std::collections::HashMap;

    async fn engine() -> (TriggerEngine, mpsc::UnboundedReceiver<FiredAction>) {
        let pool = memory_pool().await;
        let registry = Arc::new(SiteRegistry::new());
        let (status_tx, _status_rx) = mpsc::unbounded_channel();
        registry
            .register(local_site("local", status_tx, Arc::new(LocalMetadata::new())))
            .await;

        let (actions_tx, actions_rx) = mpsc::unbounded_channel();
        (TriggerEngine::new(pool, registry, actions_tx), actions_rx)
    }

    fn complete_action() -> TriggerAction {
        TriggerAction::new(JobDefn::new("echo chained"), "local")
    }

    #[tokio::test]
    async fn register_rejects_empty_data_signature() {
        let (engine, _rx) = engine().await;
        let err = engine
            .register(
                EventSelector::Job(Uuid::new_v4()),
                EventFilter::Data(HashMap::new()),
                complete_action(),
                FiringMode::OneShot,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TriggerError::MalformedFilter(_)));
    }

    #[tokio::test]
    async fn register_rejects_unknown_destination_site() {
        let (engine, _rx) = engine().await;
        let err = engine
            .register(
                EventSelector::Job(Uuid::new_v4()),
                EventFilter::Status(JobStatus::Complete),
                TriggerAction::new(JobDefn::new("echo chained"), "nowhere"),
                FiringMode::OneShot,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TriggerError::UnknownSite(_)));
    }

    #[tokio::test]
    async fn one_shot_fires_once_under_duplicate_delivery() {
        let (engine, mut rx) = engine().await;
        let watched = JobContext::new("local");
        engine
            .register(
                EventSelector::Job(watched.job_id),
                EventFilter::Status(JobStatus::Complete),
                complete_action(),
                FiringMode::OneShot,
            )
            .await
            .unwrap();

        let event = StatusEvent::new(watched, JobStatus::Complete);
        assert_eq!(engine.observe(&event).await.unwrap(), 1);
        assert_eq!(engine.observe(&event).await.unwrap(), 0);

        let fired = rx.try_recv().unwrap();
        assert_eq!(fired.cause.job_id(), event.job_id());
        assert!(rx.try_recv().is_err());
        assert!(engine.handlers().await.is_empty());
    }

    #[tokio::test]
    async fn concurrent_duplicate_deliveries_fire_a_one_shot_once() {
        let (engine, mut rx) = engine().await;
        let engine = Arc::new(engine);
        let watched = JobContext::new("local");
        engine
            .register(
                EventSelector::Job(watched.job_id),
                EventFilter::Status(JobStatus::Complete),
                complete_action(),
                FiringMode::OneShot,
            )
            .await
            .unwrap();

        let event = StatusEvent::new(watched, JobStatus::Complete);
        let first = {
            let engine = engine.clone();
            let event = event.clone();
            tokio::spawn(async move { engine.observe(&event).await.unwrap() })
        };
        let second = {
            let engine = engine.clone();
            let event = event.clone();
            tokio::spawn(async move { engine.observe(&event).await.unwrap() })
        };

        assert_eq!(first.await.unwrap() + second.await.unwrap(), 1);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
        assert!(engine.handlers().await.is_empty());
    }

    #[tokio::test]
    async fn recurring_fires_every_match() {
        let (engine, mut rx) = engine().await;
        let watched = JobContext::new("local");
        engine
            .register(
                EventSelector::Job(watched.job_id),
                EventFilter::Status(JobStatus::Info),
                complete_action(),
                FiringMode::Recurring,
            )
            .await
            .unwrap();

        let event = StatusEvent::info(
            watched,
            [("tick".to_string(), "1".to_string())].into(),
        );
        assert_eq!(engine.observe(&event).await.unwrap(), 1);
        assert_eq!(engine.observe(&event).await.unwrap(), 1);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_ok());
        assert_eq!(engine.handlers().await.len(), 1);
    }

    #[tokio::test]
    async fn firing_walks_handlers_in_registration_order() {
        let (engine, mut rx) = engine().await;
        let watched = JobContext::new("local");

        let first = engine
            .register(
                EventSelector::Job(watched.job_id),
                EventFilter::Status(JobStatus::Complete),
                complete_action(),
                FiringMode::OneShot,
            )
            .await
            .unwrap();
        let second = engine
            .register(
                EventSelector::Workflow(watched.workflow_id),
                EventFilter::Status(JobStatus::Complete),
                complete_action(),
                FiringMode::OneShot,
            )
            .await
            .unwrap();

        let event = StatusEvent::new(watched, JobStatus::Complete);
        assert_eq!(engine.observe(&event).await.unwrap(), 2);

        assert_eq!(rx.try_recv().unwrap().handler_id, first.id);
        assert_eq!(rx.try_recv().unwrap().handler_id, second.id);
    }

    #[tokio::test]
    async fn unrelated_events_fire_nothing() {
        let (engine, mut rx) = engine().await;
        let watched = JobContext::new("local");
        engine
            .register(
                EventSelector::Job(watched.job_id),
                EventFilter::Status(JobStatus::Complete),
                complete_action(),
                FiringMode::OneShot,
            )
            .await
            .unwrap();

        let other = JobContext::new("local");
        let fired = engine
            .observe(&StatusEvent::new(other, JobStatus::Complete))
            .await
            .unwrap();
        assert_eq!(fired, 0);
        assert!(rx.try_recv().is_err());
        assert_eq!(engine.handlers().await.len(), 1);
    }

    #[tokio::test]
    async fn load_restores_only_unfired_handlers() {
        let (engine, _rx) = engine().await;
        let watched = JobContext::new("local");

        let pending = engine
            .register(
                EventSelector::Job(watched.job_id),
                EventFilter::Status(JobStatus::Complete),
                complete_action(),
                FiringMode::OneShot,
            )
            .await
            .unwrap();
        let spent = engine
            .register(
                EventSelector::Job(Uuid::new_v4()),
                EventFilter::Status(JobStatus::Complete),
                complete_action(),
                FiringMode::OneShot,
            )
            .await
            .unwrap();
        handler_store::mark_fired(&engine.pool, spent.id).await.unwrap();

        let restored = engine.load().await.unwrap();
        assert_eq!(restored, 1);
        let handlers = engine.handlers().await;
        assert_eq!(handlers.len(), 1);
        assert_eq!(handlers[0].id, pending.id);
    }

    #[tokio::test]
    async fn unregister_covers_memory_and_store() {
        let (engine, _rx) = engine().await;
        let handler = engine
            .register(
                EventSelector::Job(Uuid::new_v4()),
                EventFilter::Status(JobStatus::Complete),
                complete_action(),
                FiringMode::Recurring,
            )
            .await
            .unwrap();

        assert!(engine.unregister(handler.id).await.unwrap());
        assert!(engine.handlers().await.is_empty());
        assert!(!engine.unregister(handler.id).await.unwrap());
        assert!(handler_store::list_unfired(&engine.pool).await.unwrap().is_empty());
    }
}
