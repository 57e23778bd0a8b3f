//! blockwatch-core: cross-thread liveness watchdog
//!
//! Detects execution units (threads, event loops) that stop making progress,
//! without their cooperation, and reports them as structured diagnostic
//! events.
//!
//! # Architecture
//!
//! ```text
//! monitored unit                         supervisor thread
//!   HeartbeatEmitter ──► HeartbeatStore ◄── Supervisor tick (Detector)
//!                                                │ breach
//!                                                ▼
//!                      StackCapture ◄── DetectionPipeline ──► EventBuilder
//!                                                │
//!                                                ▼
//!                          BoundedEmitter ──► Transport
//!                                │ budget exhausted
//!                                ▼
//!                        ProcessController
//! ```
//!
//! # Modules
//!
//! - `clock`: Monotonic time sources
//! - `unit`: Unit ids, sessions and ambient state
//! - `heartbeat`: Heartbeat store and per-unit emitters
//! - `capture`: Stack-capture seam
//! - `event`: Diagnostic event model and builder
//! - `transport`: Envelope delivery seam
//! - `emitter`: Event budget and exit policy
//! - `detector`: Staleness evaluation
//! - `supervisor`: Supervisor thread and detection pipeline
//! - `lifecycle`: Start/stop and suspended spans
//! - `config`: Configuration management
//! - `logging`: Tracing subscriber setup
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod capture;
pub mod clock;
pub mod config;
pub mod detector;
pub mod emitter;
pub mod error;
pub mod event;
pub mod heartbeat;
pub mod lifecycle;
pub mod logging;
pub mod supervisor;
pub mod transport;
pub mod unit;

pub use capture::{CapturedStack, RawFrame, RegistryCapture, StackCapture};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::{Config, LogFormat, WatchdogConfig};
pub use detector::{Breach, Detector};
pub use emitter::{BoundedEmitter, EmitOutcome, ExitProcess, ProcessController};
pub use error::{ConfigError, Error, Result, SupervisorError, TransportError};
pub use event::{DiagnosticEvent, EventBuilder};
pub use heartbeat::{HeartbeatEmitter, HeartbeatHandle, HeartbeatStore};
pub use lifecycle::{LifecycleController, SuspendGuard};
pub use supervisor::{
    DetectionPipeline, EpisodeOutcome, Supervisor, SupervisorBuilder, SupervisorState,
    WatchdogStatus,
};
pub use transport::{Envelope, JsonLinesTransport, Transport};
pub use unit::{AmbientState, Session, SessionStatus, UnitId};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
