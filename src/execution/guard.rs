use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type Slots = Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>;

/// Per-user "attempt in flight" marker.
///
/// Advisory only: it collapses overlapping work inside one process
/// (two polls sweeping the same user, parallel creations racing the same
/// quota row). It is not what keeps settlement or quota correct; the
/// store's conditional updates do that, across processes too.
#[derive(Clone, Default)]
pub struct UserGuard {
    slots: Slots,
}

/// Held for the duration of one creation or one sweep. Releases on drop.
pub struct InFlight {
    key: String,
    slots: Slots,
    _permit: Option<OwnedMutexGuard<()>>,
}

impl UserGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the user's slot.
    pub async fn lock(&self, key: &str) -> InFlight {
        let slot = self.slot(key);
        let permit = slot.lock_owned().await;
        InFlight {
            key: key.to_string(),
            slots: self.slots.clone(),
            _permit: Some(permit),
        }
    }

    /// Take the user's slot only if nobody holds it.
    pub fn try_lock(&self, key: &str) -> Option<InFlight> {
        let slot = self.slot(key);
        let permit = slot.try_lock_owned().ok()?;
        Some(InFlight {
            key: key.to_string(),
            slots: self.slots.clone(),
            _permit: Some(permit),
        })
    }

    /// True while someone holds the key's slot.
    pub fn is_held(&self, key: &str) -> bool {
        let slots = lock_slots(&self.slots);
        slots.get(key).is_some_and(|s| s.try_lock().is_err())
    }

    /// Number of keys with a live slot. Slots are dropped once unused.
    #[cfg(test)]
    fn tracked(&self) -> usize {
        lock_slots(&self.slots).len()
    }

    fn slot(&self, key: &str) -> Arc<AsyncMutex<()>> {
        let mut slots = lock_slots(&self.slots);
        slots
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        // Release the permit first so the strong count below only sees
        // the map's handle plus anyone queued on the slot.
        self._permit.take();
        let mut slots = lock_slots(&self.slots);
        if let Some(slot) = slots.get(&self.key) {
            if Arc::strong_count(slot) == 1 {
                slots.remove(&self.key);
            }
        }
    }
}

fn lock_slots(slots: &Slots) -> std::sync::MutexGuard<'_, HashMap<String, Arc<AsyncMutex<()>>>> {
    match slots.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
