//! Diagnostic event model and assembly.
//!
//! One event per detection episode: the blocked unit's stack is the
//! exception, every other captured unit is listed as a context thread, and
//! frame paths are cross-referenced with the units' debug-id maps.
//!
//! # Frame processing
//!
//! Capture facilities report frames innermost first. The builder:
//!
//! 1. reverses them into call order (outermost first),
//! 2. strips capture/runtime machinery ([`is_internal_frame`]),
//! 3. marks `in_app` for paths outside the toolchain and Cargo caches,
//! 4. rewrites paths under `app_root` to `app:///<relative>`.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::capture::{CapturedStack, RawFrame};
use crate::config::WatchdogConfig;
use crate::heartbeat::HeartbeatStore;
use crate::unit::{AmbientState, Session, UnitId};

/// Exception type of every blocked-unit event.
pub const EXCEPTION_TYPE: &str = "ThreadBlocked";
/// Mechanism recorded on the exception.
pub const MECHANISM_TYPE: &str = "thread_blocked";
/// Mechanism recorded on sessions ended by a block.
pub const ABNORMAL_MECHANISM: &str = "anr_foreground";

/// Function-name fragments of frames that belong to the capture machinery
/// or the runtime rather than the blocked code.
const INTERNAL_FRAME_MARKERS: &[&str] = &[
    "std::backtrace",
    "backtrace::",
    "backtrace_rs",
    "std::sys",
    "std::rt::",
    "std::panicking",
    "std::panic::",
    "core::ops::function",
    "__rust_begin_short_backtrace",
    "__rust_end_short_backtrace",
    "__pthread",
    "pthread_kill",
    "_sigtramp",
    "__restore_rt",
    "signal_handler",
    "sigprof_handler",
    "<unknown>",
];

/// Path fragments of code that is not the application's own.
const NON_APP_PATH_MARKERS: &[&str] = &[
    "/rustc/",
    "/.cargo/registry/",
    "/.cargo/git/",
    "/lib/rustlib/",
    "\\.cargo\\registry\\",
    "\\.cargo\\git\\",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    Warning,
    Error,
    Fatal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
    /// Normalized path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    /// Path as captured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abs_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lineno: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub colno: Option<u32>,
    pub in_app: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stacktrace {
    /// Outermost call first.
    pub frames: Vec<StackFrame>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mechanism {
    #[serde(rename = "type")]
    pub kind: String,
    pub handled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionRecord {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
    pub thread_id: UnitId,
    pub mechanism: Mechanism,
    pub stacktrace: Stacktrace,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadEntry {
    pub id: UnitId,
    pub name: String,
    /// The blocked unit.
    pub crashed: bool,
    pub current: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stacktrace: Option<Stacktrace>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebugImage {
    #[serde(rename = "type")]
    pub kind: String,
    pub code_file: String,
    pub debug_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebugMeta {
    pub images: Vec<DebugImage>,
}

/// Structured report of one blocked-unit episode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticEvent {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub level: Level,
    pub platform: String,
    pub exception: ExceptionRecord,
    /// Every captured unit, ascending by id.
    pub threads: Vec<ThreadEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dist: Option<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub debug_meta: DebugMeta,
}

impl DiagnosticEvent {
    /// The unit this event reports as blocked.
    #[must_use]
    pub fn blocked_unit(&self) -> UnitId {
        self.exception.thread_id
    }

    /// Threads other than the blocked one.
    pub fn context_threads(&self) -> impl Iterator<Item = &ThreadEntry> {
        self.threads.iter().filter(|t| !t.crashed)
    }
}

/// Assembles [`DiagnosticEvent`]s from a capture snapshot.
#[derive(Debug, Clone)]
pub struct EventBuilder {
    config: Arc<WatchdogConfig>,
}

impl EventBuilder {
    #[must_use]
    pub fn new(config: Arc<WatchdogConfig>) -> Self {
        Self { config }
    }

    /// Session update to send before the event, if the blocked unit had an
    /// active session.
    #[must_use]
    pub fn session_transition(ambient: &AmbientState) -> Option<Session> {
        ambient
            .session
            .as_ref()
            .map(|session| session.to_abnormal(ABNORMAL_MECHANISM))
    }

    /// Build the event for `blocked`. `None` when the capture has no entry
    /// for it.
    #[must_use]
    pub fn build(
        &self,
        blocked: UnitId,
        captured: &BTreeMap<UnitId, CapturedStack>,
        store: &HeartbeatStore,
    ) -> Option<DiagnosticEvent> {
        let primary = captured.get(&blocked)?;
        let blocked_name = unit_name(store, blocked);

        let exception = ExceptionRecord {
            kind: EXCEPTION_TYPE.to_string(),
            value: format!(
                "Thread '{blocked_name}' blocked for at least {} ms",
                self.config.blocked_threshold_ms
            ),
            thread_id: blocked,
            mechanism: Mechanism {
                kind: MECHANISM_TYPE.to_string(),
                handled: false,
            },
            stacktrace: Stacktrace {
                frames: self.process_frames(&primary.frames),
            },
        };

        let threads: Vec<ThreadEntry> = captured
            .iter()
            .map(|(id, stack)| {
                let is_blocked = *id == blocked;
                let stacktrace = if is_blocked {
                    None
                } else {
                    let frames = self.process_frames(&stack.frames);
                    (!frames.is_empty()).then_some(Stacktrace { frames })
                };
                ThreadEntry {
                    id: *id,
                    name: if is_blocked {
                        blocked_name.clone()
                    } else {
                        unit_name(store, *id)
                    },
                    crashed: is_blocked,
                    current: is_blocked,
                    stacktrace,
                }
            })
            .collect();

        let debug_ids = merged_debug_ids(captured, store);
        let images = debug_images(&debug_ids, &exception, &threads);

        Some(DiagnosticEvent {
            event_id: Uuid::new_v4().simple().to_string(),
            timestamp: Utc::now(),
            level: Level::Error,
            platform: "rust".to_string(),
            exception,
            threads,
            environment: self.config.environment.clone(),
            release: self.config.release.clone(),
            dist: self.config.dist.clone(),
            tags: self.config.static_tags.clone(),
            debug_meta: DebugMeta { images },
        })
    }

    /// Reverse into call order, drop internal frames, classify and
    /// normalize.
    #[must_use]
    pub fn process_frames(&self, raw: &[RawFrame]) -> Vec<StackFrame> {
        raw.iter()
            .rev()
            .filter(|frame| !is_internal_frame(frame))
            .map(|frame| self.normalize_frame(frame))
            .collect()
    }

    fn normalize_frame(&self, raw: &RawFrame) -> StackFrame {
        let filename = raw
            .filename
            .as_deref()
            .map(|path| normalize_path(path, self.config.app_root.as_deref()));
        StackFrame {
            function: raw.function.clone(),
            filename,
            abs_path: raw.filename.clone(),
            lineno: raw.lineno,
            colno: raw.colno,
            in_app: raw.filename.as_deref().is_some_and(is_in_app_path),
        }
    }
}

/// Whether a frame belongs to capture machinery or the runtime.
#[must_use]
pub fn is_internal_frame(frame: &RawFrame) -> bool {
    match (&frame.function, &frame.filename) {
        (None, None) => true,
        (Some(function), _) => INTERNAL_FRAME_MARKERS
            .iter()
            .any(|marker| function.contains(marker)),
        (None, Some(_)) => false,
    }
}

/// Whether a source path is application code.
#[must_use]
pub fn is_in_app_path(path: &str) -> bool {
    !NON_APP_PATH_MARKERS
        .iter()
        .any(|marker| path.contains(marker))
}

/// Rewrite `path` relative to `app_root` as `app:///<relative>`.
#[must_use]
pub fn normalize_path(path: &str, app_root: Option<&Path>) -> String {
    let Some(root) = app_root else {
        return path.to_string();
    };
    match Path::new(path).strip_prefix(root) {
        Ok(relative) => {
            let relative: Vec<String> = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect();
            format!("app:///{}", relative.join("/"))
        }
        Err(_) => path.to_string(),
    }
}

fn unit_name(store: &HeartbeatStore, id: UnitId) -> String {
    store.name(id).unwrap_or_else(|| {
        if id.is_main() {
            "main".to_string()
        } else {
            format!("unit-{id}")
        }
    })
}

/// One path → debug-id lookup across every unit's ambient state.
fn merged_debug_ids(
    captured: &BTreeMap<UnitId, CapturedStack>,
    store: &HeartbeatStore,
) -> BTreeMap<String, String> {
    let mut merged = BTreeMap::new();
    for (id, stack) in captured {
        let ambient = stack.ambient.clone().or_else(|| store.ambient(*id));
        if let Some(ambient) = ambient {
            for (path, debug_id) in ambient.debug_ids.iter() {
                merged
                    .entry(path.clone())
                    .or_insert_with(|| debug_id.clone());
            }
        }
    }
    merged
}

/// Single pass over every frame of the event; one image per matched path.
fn debug_images(
    debug_ids: &BTreeMap<String, String>,
    exception: &ExceptionRecord,
    threads: &[ThreadEntry],
) -> Vec<DebugImage> {
    if debug_ids.is_empty() {
        return Vec::new();
    }

    let frames = exception.stacktrace.frames.iter().chain(
        threads
            .iter()
            .filter_map(|t| t.stacktrace.as_ref())
            .flat_map(|s| s.frames.iter()),
    );

    let mut seen = BTreeSet::new();
    let mut images = Vec::new();
    for frame in frames {
        let Some(abs_path) = frame.abs_path.as_deref() else {
            continue;
        };
        let Some(debug_id) = debug_ids.get(abs_path) else {
            continue;
        };
        let code_file = frame.filename.clone().unwrap_or_else(|| abs_path.to_string());
        if seen.insert(code_file.clone()) {
            images.push(DebugImage {
                kind: "sourcemap".to_string(),
                code_file,
                debug_id: debug_id.clone(),
            });
        }
    }
    images.sort_by(|a, b| a.code_file.cmp(&b.code_file));
    images
}
