//! Monitored-unit identity and the ambient state units publish with their
//! heartbeats.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of a monitored execution unit.
///
/// Ids order the supervisor's per-tick processing (ascending).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnitId(pub u64);

impl UnitId {
    /// Reserved for the program's primary thread.
    pub const MAIN: Self = Self(0);

    #[must_use]
    pub const fn is_main(self) -> bool {
        self.0 == 0
    }
}

impl From<u64> for UnitId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for UnitId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle status of a logical session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Ok,
    Exited,
    Crashed,
    /// Ended by the watchdog: the owning unit stopped responding.
    Abnormal,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::Exited => write!(f, "exited"),
            Self::Crashed => write!(f, "crashed"),
            Self::Abnormal => write!(f, "abnormal"),
        }
    }
}

/// A logical user/application session active on a unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub sid: Uuid,
    pub status: SessionStatus,
    pub started: DateTime<Utc>,
    pub errors: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abnormal_mechanism: Option<String>,
}

impl Session {
    /// Start a fresh session now.
    #[must_use]
    pub fn new() -> Self {
        Self {
            sid: Uuid::new_v4(),
            status: SessionStatus::Ok,
            started: Utc::now(),
            errors: 0,
            abnormal_mechanism: None,
        }
    }

    /// Copy of this session ended abnormally through `mechanism`.
    #[must_use]
    pub fn to_abnormal(&self, mechanism: &str) -> Self {
        Self {
            status: SessionStatus::Abnormal,
            abnormal_mechanism: Some(mechanism.to_string()),
            ..self.clone()
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot a unit publishes with its heartbeat.
///
/// Published as `Arc<AmbientState>` so that both publishing and reading are
/// pointer copies.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AmbientState {
    /// Session active on the unit, if any.
    pub session: Option<Session>,
    /// Absolute source path to debug id.
    pub debug_ids: Arc<BTreeMap<String, String>>,
}

impl AmbientState {
    #[must_use]
    pub fn with_session(mut self, session: Session) -> Self {
        self.session = Some(session);
        self
    }

    #[must_use]
    pub fn with_debug_ids(mut self, debug_ids: BTreeMap<String, String>) -> Self {
        self.debug_ids = Arc::new(debug_ids);
        self
    }
}
