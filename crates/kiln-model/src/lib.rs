#![warn(missing_docs)]

//! # kiln-model
//!
//! Shared data model for the Kiln execution broker.
//!
//! Holds the static language registry, the session record and its status
//! machine vocabulary, and the execution request/result types. Everything in
//! this crate is plain data: no I/O, no async, no policy.

pub mod languages;
pub mod session;

pub use languages::{LanguageId, LanguageSpec, Recipe};
pub use session::{Session, SessionKind, SessionStatus};

use serde::{Deserialize, Serialize};

/// Default per-stream capture cap: 10 MiB.
pub const OUTPUT_CAP_BYTES: usize = 10 * 1024 * 1024;

/// Marker appended to a stream that crossed its capture cap.
pub const TRUNCATION_MARKER: &str = "\n[output truncated]";

/// Minimum accepted execution timeout.
pub const MIN_TIMEOUT_MS: u64 = 1_000;
/// Maximum accepted execution timeout.
pub const MAX_TIMEOUT_MS: u64 = 300_000;
/// Timeout applied when the caller does not specify one.
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Exit code reported when an execution is killed on timeout.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// A single code-execution request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecRequest {
    /// Language to run the code in.
    pub language: LanguageId,
    /// The source text. Must be non-empty.
    pub code: String,
    /// Existing session to run in; a transient session is used when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Text fed to the child's stdin, written once and closed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdin: Option<String>,
    /// Wall-clock budget in milliseconds, clamped to
    /// [`MIN_TIMEOUT_MS`]..=[`MAX_TIMEOUT_MS`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl ExecRequest {
    /// The effective timeout: the caller's value clamped into range, or the
    /// default when unset.
    pub fn effective_timeout_ms(&self) -> u64 {
        self.timeout_ms
            .unwrap_or(DEFAULT_TIMEOUT_MS)
            .clamp(MIN_TIMEOUT_MS, MAX_TIMEOUT_MS)
    }
}

/// The outcome of one execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecOutcome {
    /// Captured stdout, capped at [`OUTPUT_CAP_BYTES`].
    pub stdout: String,
    /// Captured stderr, capped at [`OUTPUT_CAP_BYTES`] with a marker on
    /// truncation.
    pub stderr: String,
    /// The child's exit code; [`TIMEOUT_EXIT_CODE`] when a timeout fired.
    pub exit_code: i32,
    /// Wall time from spawn to reap, in milliseconds.
    pub wall_time_ms: u64,
    /// Peak resident memory in MiB, when the platform exposes it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peak_memory_mib: Option<u64>,
}

impl ExecOutcome {
    /// Whether the child exited normally with code zero.
    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }

    /// Whether this outcome was produced by a timeout kill.
    pub fn timed_out(&self) -> bool {
        self.exit_code == TIMEOUT_EXIT_CODE
    }
}

/// The accept/reject decision of the policy screener on a (language, code)
/// pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    /// True when no deny pattern matched.
    pub valid: bool,
    /// Name of the pattern that matched, when invalid.
    pub reason: Option<&'static str>,
}

impl Verdict {
    /// An accepting verdict.
    pub const fn ok() -> Self {
        Self {
            valid: true,
            reason: None,
        }
    }

    /// A rejecting verdict naming the matched pattern.
    pub const fn rejected(pattern: &'static str) -> Self {
        Self {
            valid: false,
            reason: Some(pattern),
        }
    }
}
