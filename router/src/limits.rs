//! Admission control: per-placement concurrency slots and request-body size
//! caps. Zero or absent limits mean unlimited.

use confsync::snapshot::Snapshot;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Slot held for the lifetime of one admitted request. Dropping the guard
/// releases the slot, so every exit path (normal, error, cancel, panic)
/// releases exactly once.
#[derive(Debug)]
pub struct SlotGuard {
    _permit: Option<OwnedSemaphorePermit>,
}

struct PlacementLimits {
    concurrency_limit: Option<u32>,
    slots: Option<Arc<Semaphore>>,
    max_body_bytes: Option<u64>,
}

pub struct AdmissionController {
    placements: RwLock<HashMap<String, PlacementLimits>>,
}

impl AdmissionController {
    pub fn new() -> Self {
        Self {
            placements: RwLock::new(HashMap::new()),
        }
    }

    /// Reconciles limits against a newly published snapshot. The semaphore is
    /// kept when the limit is unchanged so slots held by in-flight requests
    /// stay valid; a changed limit gets a fresh semaphore.
    pub fn apply(&self, snapshot: &Snapshot) {
        let mut placements = self.placements.write();
        placements.retain(|key, _| snapshot.placement(key).is_some());

        for (key, placement) in &snapshot.placements {
            let entry = placements
                .entry(key.clone())
                .or_insert_with(|| PlacementLimits {
                    concurrency_limit: None,
                    slots: None,
                    max_body_bytes: None,
                });
            entry.max_body_bytes = placement.max_request_body_bytes;
            if entry.concurrency_limit != placement.concurrency_limit {
                entry.concurrency_limit = placement.concurrency_limit;
                entry.slots = placement
                    .concurrency_limit
                    .map(|limit| Arc::new(Semaphore::new(limit as usize)));
            }
        }
    }

    /// Non-blocking. `None` means the placement is at its concurrency limit.
    pub fn try_acquire(&self, placement: &str) -> Option<SlotGuard> {
        let slots = self
            .placements
            .read()
            .get(placement)
            .and_then(|limits| limits.slots.clone());

        match slots {
            None => Some(SlotGuard { _permit: None }),
            Some(semaphore) => semaphore
                .try_acquire_owned()
                .ok()
                .map(|permit| SlotGuard {
                    _permit: Some(permit),
                }),
        }
    }

    pub fn check_body_size(&self, placement: &str, content_length: u64) -> bool {
        match self
            .placements
            .read()
            .get(placement)
            .and_then(|limits| limits.max_body_bytes)
        {
            None => true,
            Some(max) => content_length <= max,
        }
    }
}

impl Default for AdmissionController {
    fn default() -> Self {
        Self::new()
    }
}
