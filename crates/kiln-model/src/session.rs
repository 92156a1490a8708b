//! Session records and their status vocabulary.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::languages::LanguageId;

/// The three kinds of session the broker manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    /// One-shot or reusable code-execution workspace.
    Execution,
    /// Web-IDE workspace served by a helper process.
    Vscode,
    /// Headless-browser automation workspace.
    Playwright,
}

impl SessionKind {
    /// Wire token for this kind.
    pub const fn as_str(self) -> &'static str {
        match self {
            SessionKind::Execution => "execution",
            SessionKind::Vscode => "vscode",
            SessionKind::Playwright => "playwright",
        }
    }
}

/// Session lifecycle status.
///
/// `creating → running` on successful provisioning, `creating → error` on
/// failure, `running → stopped` on destroy or cleanup. `stopped` and `error`
/// are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Being provisioned; not yet usable.
    Creating,
    /// Provisioned and usable.
    Running,
    /// Destroyed or cleaned up. Terminal.
    Stopped,
    /// Provisioning or runtime failure. Terminal.
    Error,
}

impl SessionStatus {
    /// Wire token for this status.
    pub const fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Creating => "creating",
            SessionStatus::Running => "running",
            SessionStatus::Stopped => "stopped",
            SessionStatus::Error => "error",
        }
    }

    /// Whether no further transitions are possible.
    pub const fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Stopped | SessionStatus::Error)
    }

    /// Whether the status machine permits moving to `next` from here.
    pub const fn can_transition_to(self, next: SessionStatus) -> bool {
        matches!(
            (self, next),
            (SessionStatus::Creating, SessionStatus::Running)
                | (SessionStatus::Creating, SessionStatus::Error)
                | (SessionStatus::Creating, SessionStatus::Stopped)
                | (SessionStatus::Running, SessionStatus::Stopped)
                | (SessionStatus::Running, SessionStatus::Error)
        )
    }
}

/// A session record. One per session id across every store tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Globally unique id (uuid v4, simple form).
    pub id: String,
    /// Kind of workspace this session fronts.
    pub kind: SessionKind,
    /// Language bound to the session, when it has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<LanguageId>,
    /// Lifecycle status.
    pub status: SessionStatus,
    /// Memory budget label, e.g. "1g", "2g", "4g", "8g".
    pub memory_budget: String,
    /// The session's workspace directory.
    pub workspace_dir: PathBuf,
    /// Helper child handle (pid rendered as a string), when one is running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    /// Symbolic name → URL for out-of-band access to helper programs.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub endpoints: BTreeMap<String, String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last time a caller touched the session. Monotonically non-decreasing.
    pub last_accessed_at: DateTime<Utc>,
    /// Identity of the owning caller.
    pub owner_client_id: String,
    /// TCP port held by this session, when one is bound.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bound_port: Option<u16>,
}

impl Session {
    /// Create a fresh record in `creating` status with a random id.
    pub fn new(
        kind: SessionKind,
        language: Option<LanguageId>,
        memory_budget: impl Into<String>,
        workspace_dir: PathBuf,
        owner_client_id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            kind,
            language,
            status: SessionStatus::Creating,
            memory_budget: memory_budget.into(),
            workspace_dir,
            container_id: None,
            endpoints: BTreeMap::new(),
            created_at: now,
            last_accessed_at: now,
            owner_client_id: owner_client_id.into(),
            bound_port: None,
        }
    }

    /// Refresh `last_accessed_at`, never moving it backwards.
    pub fn touch(&mut self) {
        let now = Utc::now();
        if now > self.last_accessed_at {
            self.last_accessed_at = now;
        }
    }
}
