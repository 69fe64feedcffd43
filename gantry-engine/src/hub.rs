//! Status hub
//!
//! Every status event, whether pushed by a driver, observed by the poller
//! or emitted by the engine itself, passes through [`StatusHub::emit`].
//! Emits are serialized internally, so the stream invariants hold no matter
//! how many tasks are emitting:
//!
//! - a job whose recorded status is terminal accepts no further events
//! - emit times never decrease within one job's history; a late-arriving
//!   event is clamped to the latest recorded time
//!
//! Accepted events are appended to the store, mined for data lineage and
//! fanned out to subscribers (the trigger engine among them).

use std::sync::Arc;

use sqlx::SqlitePool;
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use gantry_core::domain::status::StatusEvent;

use crate::store::data::DataRecord;
use crate::store::{data_store, status_store};

pub struct StatusHub {
    pool: SqlitePool,
    bus: broadcast::Sender<StatusEvent>,
    /// Serializes the latest-check, append and publish: events arrive
    /// concurrently from ingest, the poller and direct facade calls, and
    /// the absorption rule only holds if they go through one at a time.
    emit_lock: Mutex<()>,
}

impl StatusHub {
    pub fn new(pool: SqlitePool, capacity: usize) -> Self {
        let (bus, _) = broadcast::channel(capacity);
        Self {
            pool,
            bus,
            emit_lock: Mutex::new(()),
        }
    }

    /// A live view of every event the hub accepts.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.bus.subscribe()
    }

    /// Accept one event into the thread.
    ///
    /// Returns the event as recorded (its emit time may have been adjusted),
    /// or `None` when the job's history is already terminal and the event
    /// was dropped.
    pub async fn emit(&self, mut event: StatusEvent) -> Result<Option<StatusEvent>, sqlx::Error> {
        let _serialized = self.emit_lock.lock().await;

        if let Some(prev) = status_store::latest(&self.pool, event.job_id()).await? {
            if prev.status.is_terminal() {
                warn!(
                    job_id = %event.job_id(),
                    dropped = %event.status,
                    terminal = %prev.status,
                    "event after terminal status dropped"
                );
                return Ok(None);
            }
            if event.emit_time < prev.emit_time {
                event.emit_time = prev.emit_time;
            }
        }

        status_store::append(&self.pool, &event).await?;

        if let Some(data) = DataRecord::from_event(&event) {
            data_store::record(&self.pool, &data).await?;
            debug!(
                job_id = %data.job_id,
                op = %data.op,
                site_ref = %data.site_ref,
                "data movement recorded"
            );
        }

        info!(
            job_id = %event.job_id(),
            site = %event.context.site_name,
            status = %event.status,
            "status"
        );

        // nobody listening is fine
        let _ = self.bus.send(event.clone());
        Ok(Some(event))
    }

    /// Drain driver-pushed events into the hub until all senders drop.
    pub fn run_ingest(
        self: Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<StatusEvent>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Err(e) = self.emit(event).await {
                    error!("failed to record status event: {}", e);
                }
            }
            debug!("status ingest stopped");
        })
    }
}
