//! Heartbeat store and per-unit heartbeat emitters.
//!
//! Every monitored unit owns one slot in a shared [`HeartbeatStore`]. The
//! unit writes "alive at T" plus its ambient state; the supervisor only
//! reads.
//!
//! ```text
//! monitored unit (event loop)          supervisor thread
//!   HeartbeatEmitter tick                 tick
//!     ├── handle.publish(ambient)           └── store.last_seen_all()
//!     └── handle.beat()  ──► UnitSlot ◄──────── store.ambient(id)
//! ```
//!
//! Writes never block: the timestamp is an atomic, and the ambient swap uses
//! `try_write` on a lock private to the slot and is skipped on contention.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace};

use crate::clock::{Clock, MonotonicClock};
use crate::config::duration_ms;
use crate::unit::{AmbientState, UnitId};

#[derive(Debug)]
struct UnitSlot {
    name: String,
    /// Clock milliseconds of the last heartbeat.
    last_seen_ms: AtomicU64,
    ambient: RwLock<Arc<AmbientState>>,
}

/// Shared per-unit heartbeat timestamps and ambient snapshots.
#[derive(Debug)]
pub struct HeartbeatStore {
    clock: Arc<dyn Clock>,
    slots: RwLock<BTreeMap<UnitId, Arc<UnitSlot>>>,
}

impl Default for HeartbeatStore {
    fn default() -> Self {
        Self::new(Arc::new(MonotonicClock::new()))
    }
}

impl HeartbeatStore {
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            slots: RwLock::new(BTreeMap::new()),
        }
    }

    #[must_use]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Current time on the store's clock.
    #[must_use]
    pub fn now(&self) -> Duration {
        self.clock.now()
    }

    /// Register a unit and record its first heartbeat.
    ///
    /// Registering an id again replaces its slot; handles to the old slot
    /// keep writing to a slot nobody reads.
    pub fn register(&self, id: UnitId, name: impl Into<String>) -> HeartbeatHandle {
        let slot = Arc::new(UnitSlot {
            name: name.into(),
            last_seen_ms: AtomicU64::new(duration_ms(self.clock.now())),
            ambient: RwLock::new(Arc::new(AmbientState::default())),
        });
        debug!(unit_id = %id, name = %slot.name, "Registered monitored unit");
        self.slots.write().insert(id, Arc::clone(&slot));
        HeartbeatHandle {
            id,
            slot,
            clock: Arc::clone(&self.clock),
        }
    }

    /// Drop a unit's slot. Returns whether it existed.
    pub fn forget(&self, id: UnitId) -> bool {
        self.slots.write().remove(&id).is_some()
    }

    /// Last heartbeat of every unit, ascending by id.
    #[must_use]
    pub fn last_seen_all(&self) -> Vec<(UnitId, Duration)> {
        self.slots
            .read()
            .iter()
            .map(|(id, slot)| (*id, slot.last_seen()))
            .collect()
    }

    #[must_use]
    pub fn last_seen(&self, id: UnitId) -> Option<Duration> {
        self.slots.read().get(&id).map(|slot| slot.last_seen())
    }

    /// Copy of the unit's last published ambient state.
    #[must_use]
    pub fn ambient(&self, id: UnitId) -> Option<Arc<AmbientState>> {
        let slot = self.slots.read().get(&id).cloned()?;
        let ambient = slot.ambient.read().clone();
        Some(ambient)
    }

    /// Human label of a unit.
    #[must_use]
    pub fn name(&self, id: UnitId) -> Option<String> {
        self.slots.read().get(&id).map(|slot| slot.name.clone())
    }

    #[must_use]
    pub fn units(&self) -> Vec<UnitId> {
        self.slots.read().keys().copied().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.read().is_empty()
    }
}

impl UnitSlot {
    fn last_seen(&self) -> Duration {
        Duration::from_millis(self.last_seen_ms.load(Ordering::SeqCst))
    }
}

/// Write side of one unit's slot, held by the unit itself.
#[derive(Debug, Clone)]
pub struct HeartbeatHandle {
    id: UnitId,
    slot: Arc<UnitSlot>,
    clock: Arc<dyn Clock>,
}

impl HeartbeatHandle {
    #[must_use]
    pub fn id(&self) -> UnitId {
        self.id
    }

    /// Record "alive now".
    pub fn beat(&self) {
        self.slot
            .last_seen_ms
            .store(duration_ms(self.clock.now()), Ordering::SeqCst);
    }

    /// Publish a new ambient snapshot. Returns `false` if the slot was
    /// being read and the swap was skipped.
    pub fn publish(&self, ambient: Arc<AmbientState>) -> bool {
        match self.slot.ambient.try_write() {
            Some(mut guard) => {
                *guard = ambient;
                true
            }
            None => false,
        }
    }

    /// Publish ambient state and beat in one call.
    pub fn beat_with(&self, ambient: Arc<AmbientState>) {
        self.publish(ambient);
        self.beat();
    }
}

/// Periodic heartbeat task running on the monitored unit's runtime.
///
/// Spawn it on the runtime whose liveness should be tracked: if that
/// runtime's thread blocks, the task stops ticking and the heartbeat goes
/// stale. The task is aborted when the emitter is dropped and never keeps
/// the runtime alive on its own.
#[derive(Debug)]
pub struct HeartbeatEmitter {
    task: JoinHandle<()>,
}

impl HeartbeatEmitter {
    /// Spawn on the current tokio runtime.
    ///
    /// `ambient` is called every tick and should return a cheap reference
    /// copy of the unit's current state.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn spawn<F>(handle: HeartbeatHandle, interval: Duration, ambient: F) -> Self
    where
        F: Fn() -> Arc<AmbientState> + Send + Sync + 'static,
    {
        let period = interval.max(Duration::from_millis(1));
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if !handle.publish(ambient()) {
                    trace!(unit_id = %handle.id(), "Ambient swap skipped (slot busy)");
                }
                handle.beat();
            }
        });
        Self { task }
    }

    /// Spawn with an empty ambient state.
    pub fn spawn_plain(handle: HeartbeatHandle, interval: Duration) -> Self {
        let empty = Arc::new(AmbientState::default());
        Self::spawn(handle, interval, move || Arc::clone(&empty))
    }

    /// Stop heartbeating.
    pub fn stop(self) {
        drop(self);
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for HeartbeatEmitter {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::unit::Session;

    fn manual_store() -> (Arc<ManualClock>, HeartbeatStore) {
        let clock = Arc::new(ManualClock::new());
        let store = HeartbeatStore::new(Arc::clone(&clock) as Arc<dyn Clock>);
        (clock, store)
    }

    #[test]
    fn register_records_initial_heartbeat() {
        let (clock, store) = manual_store();
        clock.advance(Duration::from_millis(40));
        let handle = store.register(UnitId::MAIN, "main");
        assert_eq!(handle.id(), UnitId::MAIN);
        assert_eq!(store.last_seen(UnitId::MAIN), Some(Duration::from_millis(40)));
        assert_eq!(store.name(UnitId::MAIN).as_deref(), Some("main"));
    }

    #[test]
    fn beat_updates_last_seen() {
        let (clock, store) = manual_store();
        let handle = store.register(UnitId(1), "worker");
        clock.advance(Duration::from_millis(250));
        handle.beat();
        assert_eq!(store.last_seen(UnitId(1)), Some(Duration::from_millis(250)));
    }

    #[test]
    fn last_seen_all_is_sorted_by_id() {
        let (_clock, store) = manual_store();
        store.register(UnitId(3), "c");
        store.register(UnitId::MAIN, "main");
        store.register(UnitId(1), "a");
        let ids: Vec<UnitId> = store.last_seen_all().into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec![UnitId(0), UnitId(1), UnitId(3)]);
    }

    #[test]
    fn publish_replaces_ambient_state() {
        let (_clock, store) = manual_store();
        let handle = store.register(UnitId::MAIN, "main");
        assert!(store.ambient(UnitId::MAIN).unwrap().session.is_none());

        let session = Session::new();
        let ambient = Arc::new(AmbientState::default().with_session(session.clone()));
        assert!(handle.publish(ambient));
        assert_eq!(
            store.ambient(UnitId::MAIN).unwrap().session.as_ref().map(|s| s.sid),
            Some(session.sid)
        );
    }

    #[test]
    fn publish_skips_when_slot_is_read_locked() {
        let (_clock, store) = manual_store();
        let handle = store.register(UnitId::MAIN, "main");
        let slot = Arc::clone(&handle.slot);
        let _reader = slot.ambient.read();
        assert!(!handle.publish(Arc::new(AmbientState::default())));
    }

    #[test]
    fn forget_removes_slot() {
        let (_clock, store) = manual_store();
        store.register(UnitId(5), "gone");
        assert!(store.forget(UnitId(5)));
        assert!(!store.forget(UnitId(5)));
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn emitter_beats_on_interval() {
        let store = Arc::new(HeartbeatStore::default());
        let handle = store.register(UnitId::MAIN, "main");
        let session = Session::new();
        let ambient = Arc::new(AmbientState::default().with_session(session.clone()));
        let emitter = HeartbeatEmitter::spawn(handle, Duration::from_millis(20), move || {
            Arc::clone(&ambient)
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        let published = store.ambient(UnitId::MAIN).unwrap();
        assert_eq!(published.session.as_ref().map(|s| s.sid), Some(session.sid));
        assert!(!emitter.is_finished());
        emitter.stop();
    }
}
