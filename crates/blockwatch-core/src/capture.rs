//! Out-of-band stack capture seam.
//!
//! Capturing another thread's stack without its cooperation needs a native
//! facility (signal-driven sampling, ptrace, platform debug APIs). The
//! watchdog only depends on the [`StackCapture`] trait; implementations
//! live with the embedder.
//!
//! [`RegistryCapture`] is the fallback: it reports every registered unit
//! with an empty stack, so events still carry the thread listing and
//! ambient state.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::heartbeat::HeartbeatStore;
use crate::unit::{AmbientState, UnitId};

/// One captured frame, innermost first within a stack.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawFrame {
    pub function: Option<String>,
    /// Absolute source path as reported by the capture facility.
    pub filename: Option<String>,
    pub lineno: Option<u32>,
    pub colno: Option<u32>,
}

impl RawFrame {
    #[must_use]
    pub fn new(function: &str, filename: &str, lineno: u32) -> Self {
        Self {
            function: Some(function.to_string()),
            filename: Some(filename.to_string()),
            lineno: Some(lineno),
            colno: None,
        }
    }
}

/// Stack and state captured for one unit.
#[derive(Debug, Clone, Default)]
pub struct CapturedStack {
    /// Innermost frame first.
    pub frames: Vec<RawFrame>,
    /// Ambient state observed at capture time, when the facility has it.
    pub ambient: Option<Arc<AmbientState>>,
}

/// Native stack-capture facility.
pub trait StackCapture: Send + Sync {
    /// Make the calling thread capturable as `unit`.
    fn register_self(&self, unit: UnitId);

    /// Capture every registered unit in one pass.
    ///
    /// May block; the supervisor calls it off its tick loop.
    fn capture_stacks(&self) -> BTreeMap<UnitId, CapturedStack>;
}

/// [`StackCapture`] that lists heartbeat-store units without frames.
#[derive(Debug, Clone)]
pub struct RegistryCapture {
    store: Arc<HeartbeatStore>,
}

impl RegistryCapture {
    #[must_use]
    pub fn new(store: Arc<HeartbeatStore>) -> Self {
        Self { store }
    }
}

impl StackCapture for RegistryCapture {
    fn register_self(&self, unit: UnitId) {
        trace!(unit_id = %unit, "Registry capture needs no per-thread registration");
    }

    fn capture_stacks(&self) -> BTreeMap<UnitId, CapturedStack> {
        self.store
            .units()
            .into_iter()
            .map(|id| {
                let stack = CapturedStack {
                    frames: Vec::new(),
                    ambient: self.store.ambient(id),
                };
                (id, stack)
            })
            .collect()
    }
}

/// Parse the `Display` output of [`std::backtrace::Backtrace`] into frames.
///
/// Capture facilities built on `Backtrace::force_capture()` in a signal
/// handler hand back this text form. Lines look like:
///
/// ```text
///    4: my_app::worker::spin
///              at /srv/app/src/worker.rs:88:13
/// ```
#[must_use]
pub fn parse_std_backtrace(text: &str) -> Vec<RawFrame> {
    let mut frames: Vec<RawFrame> = Vec::new();

    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        if let Some(location) = trimmed.strip_prefix("at ") {
            if let Some(frame) = frames.last_mut() {
                if frame.filename.is_none() {
                    let (file, lineno, colno) = split_location(location);
                    frame.filename = Some(file.to_string());
                    frame.lineno = lineno;
                    frame.colno = colno;
                }
            }
            continue;
        }

        if let Some((index, function)) = trimmed.split_once(": ") {
            if !index.is_empty() && index.chars().all(|c| c.is_ascii_digit()) {
                frames.push(RawFrame {
                    function: Some(function.trim().to_string()),
                    ..RawFrame::default()
                });
            }
        }
    }

    frames
}

fn split_location(location: &str) -> (&str, Option<u32>, Option<u32>) {
    let mut parts = location.rsplitn(3, ':');
    let last = parts.next();
    let middle = parts.next();
    let rest = parts.next();

    match (rest, middle, last) {
        (Some(file), Some(line), Some(col)) => match (line.parse(), col.parse()) {
            (Ok(line), Ok(col)) => (file, Some(line), Some(col)),
            _ => (location, None, None),
        },
        (None, Some(file), Some(line)) => match line.parse() {
            Ok(line) => (file, Some(line), None),
            Err(_) => (location, None, None),
        },
        _ => (location, None, None),
    }
}
