//! The snapshot store: one atomically replaceable, reference-counted
//! snapshot shared by every request handler.
//!
//! Reads are wait-free (`ArcSwap` load); a handle obtained via `current()`
//! keeps its snapshot alive for the reader's lifetime even if a replacement
//! happens mid-request. Writers (file watcher, push client) serialize behind
//! a single mutex.

use crate::metrics_defs::CONFIG_RELOADS;
use crate::model::ConfigDocument;
use crate::snapshot::{ConfigError, ConfigSource, Snapshot};
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::broadcast;

const EVENT_CHANNEL_CAPACITY: usize = 16;

/// Emitted after every successful replacement so per-placement runtime state
/// (health, circuit, admission) can reconcile against the new membership.
#[derive(Clone, Debug)]
pub struct ReplacementEvent {
    pub old_version: String,
    pub new_version: String,
    pub source: ConfigSource,
}

pub struct ConfigStore {
    active: ArcSwap<Snapshot>,
    write_lock: Mutex<()>,
    events: broadcast::Sender<ReplacementEvent>,
}

impl ConfigStore {
    pub fn new(initial: Snapshot) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            active: ArcSwap::from_pointee(initial),
            write_lock: Mutex::new(()),
            events,
        }
    }

    /// The active snapshot. Never blocks.
    pub fn current(&self) -> Arc<Snapshot> {
        self.active.load_full()
    }

    /// Validates `document` and, if it passes, publishes it atomically.
    /// In-flight readers keep the snapshot they already hold; the next
    /// `current()` returns the new one. On failure the active snapshot is
    /// untouched and the reason is returned.
    pub fn try_replace(
        &self,
        document: ConfigDocument,
        source: ConfigSource,
    ) -> Result<ReplacementEvent, ConfigError> {
        let candidate = match Snapshot::from_document(document, source) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                metrics::counter!(
                    CONFIG_RELOADS.name,
                    "source" => source.as_str(),
                    "outcome" => "rejected",
                )
                .increment(1);
                return Err(err);
            }
        };

        let event = {
            let _writer = self.write_lock.lock();
            let old = self.active.load();
            let event = ReplacementEvent {
                old_version: old.version.clone(),
                new_version: candidate.version.clone(),
                source,
            };
            self.active.store(Arc::new(candidate));
            event
        };

        tracing::info!(
            old_version = %event.old_version,
            new_version = %event.new_version,
            source = %event.source,
            "config snapshot replaced"
        );
        metrics::counter!(
            CONFIG_RELOADS.name,
            "source" => source.as_str(),
            "outcome" => "applied",
        )
        .increment(1);

        // Nobody listening is fine; components subscribe at startup.
        let _ = self.events.send(event.clone());
        Ok(event)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReplacementEvent> {
        self.events.subscribe()
    }
}
