//! Shared fakes for blockwatch-core integration tests.
//!
//! Import from integration test files with:
//! ```ignore
//! mod common;
//! use common::{RecordingExit, RecordingTransport, ScriptedCapture};
//! ```

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use blockwatch_core::capture::{CapturedStack, RawFrame, StackCapture};
use blockwatch_core::clock::{Clock, ManualClock};
use blockwatch_core::emitter::ProcessController;
use blockwatch_core::error::TransportError;
use blockwatch_core::event::DiagnosticEvent;
use blockwatch_core::heartbeat::HeartbeatStore;
use blockwatch_core::transport::{Envelope, Transport};
use blockwatch_core::unit::{Session, UnitId};

/// Capture facility returning a fixed stack per unit.
#[derive(Default)]
pub struct ScriptedCapture {
    stacks: Mutex<BTreeMap<UnitId, Vec<RawFrame>>>,
    calls: AtomicUsize,
}

impl ScriptedCapture {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Give `unit` a two-frame stack under `/srv/app`.
    pub fn with_unit(self: Arc<Self>, unit: UnitId) -> Arc<Self> {
        self.stacks.lock().insert(
            unit,
            vec![
                RawFrame::new(
                    &format!("app::unit{unit}::spin"),
                    &format!("/srv/app/src/unit{unit}.rs"),
                    42,
                ),
                RawFrame::new("app::main", "/srv/app/src/main.rs", 7),
            ],
        );
        self
    }

    pub fn remove_unit(&self, unit: UnitId) {
        self.stacks.lock().remove(&unit);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl StackCapture for ScriptedCapture {
    fn register_self(&self, unit: UnitId) {
        self.stacks.lock().entry(unit).or_default();
    }

    fn capture_stacks(&self) -> BTreeMap<UnitId, CapturedStack> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.stacks
            .lock()
            .iter()
            .map(|(id, frames)| {
                (
                    *id,
                    CapturedStack {
                        frames: frames.clone(),
                        ambient: None,
                    },
                )
            })
            .collect()
    }
}

/// Transport that keeps every envelope; can be switched to fail or to park
/// event sends.
#[derive(Default)]
pub struct RecordingTransport {
    envelopes: Mutex<Vec<Envelope>>,
    fail: AtomicBool,
    fail_sessions: AtomicBool,
    hold_events: AtomicBool,
    held_sends: AtomicUsize,
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Reject session envelopes only.
    pub fn set_failing_sessions(&self, fail: bool) {
        self.fail_sessions.store(fail, Ordering::SeqCst);
    }

    /// Park event sends until [`Self::release_events`].
    pub fn hold_events(&self) {
        self.hold_events.store(true, Ordering::SeqCst);
    }

    pub fn release_events(&self) {
        self.hold_events.store(false, Ordering::SeqCst);
    }

    /// Event sends that had to wait for release.
    pub fn held_sends(&self) -> usize {
        self.held_sends.load(Ordering::SeqCst)
    }

    pub fn events(&self) -> Vec<DiagnosticEvent> {
        self.envelopes
            .lock()
            .iter()
            .filter_map(|e| match e {
                Envelope::Event(event) => Some((**event).clone()),
                Envelope::Session(_) => None,
            })
            .collect()
    }

    pub fn sessions(&self) -> Vec<Session> {
        self.envelopes
            .lock()
            .iter()
            .filter_map(|e| match e {
                Envelope::Session(session) => Some(session.clone()),
                Envelope::Event(_) => None,
            })
            .collect()
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.envelopes.lock().iter().map(Envelope::kind).collect()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send(&self, envelope: Envelope) -> Result<(), TransportError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(TransportError::Rejected("scripted failure".to_string()));
        }
        if matches!(envelope, Envelope::Session(_)) && self.fail_sessions.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        if matches!(envelope, Envelope::Event(_)) && self.hold_events.load(Ordering::SeqCst) {
            self.held_sends.fetch_add(1, Ordering::SeqCst);
            while self.hold_events.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }
        self.envelopes.lock().push(envelope);
        Ok(())
    }

    async fn flush(&self, _timeout: Duration) -> Result<bool, TransportError> {
        Ok(true)
    }
}

/// Exit policy that only records requests.
#[derive(Default)]
pub struct RecordingExit {
    requests: Mutex<Vec<Duration>>,
}

impl RecordingExit {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn requests(&self) -> Vec<Duration> {
        self.requests.lock().clone()
    }
}

impl ProcessController for RecordingExit {
    fn schedule_exit(&self, delay: Duration) {
        self.requests.lock().push(delay);
    }
}

/// Store driven by a manual clock.
pub fn manual_store() -> (Arc<ManualClock>, Arc<HeartbeatStore>) {
    let clock = Arc::new(ManualClock::new());
    let store = Arc::new(HeartbeatStore::new(Arc::clone(&clock) as Arc<dyn Clock>));
    (clock, store)
}

/// Poll `condition` until it holds or `timeout` passes.
pub async fn wait_until<F>(timeout: Duration, condition: F) -> bool
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
