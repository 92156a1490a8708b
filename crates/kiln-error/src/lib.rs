#![warn(missing_docs)]

//! Typed error surface for the Kiln execution broker.
//!
//! Provides [`BrokerError`] — the canonical error type every caller-facing
//! operation returns. Each variant maps to one of the stable error codes the
//! tool surface reports, carries enough context to render a useful text
//! report, and knows whether a retry could help.

use thiserror::Error;

/// Canonical error type for broker operations.
///
/// All variants are `#[non_exhaustive]` to allow future additions without
/// breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BrokerError {
    /// The request failed schema validation before any work was done.
    #[error("bad request: {reason}")]
    BadRequest {
        /// What was wrong with the request.
        reason: String,
    },

    /// The policy screener denied the submitted code.
    #[error("code rejected by policy: {reason}")]
    PolicyRejected {
        /// Name of the pattern that matched.
        reason: String,
    },

    /// The referenced session does not exist or is already terminal.
    #[error("session not found: {session_id}")]
    NotFound {
        /// The session id that could not be resolved.
        session_id: String,
    },

    /// The language id is not in the registry.
    #[error("unsupported language: {language}")]
    Unsupported {
        /// The language id the caller sent.
        language: String,
    },

    /// The admission controller refused the caller.
    #[error("rate limit exceeded, retry in {retry_after_secs}s")]
    RateLimited {
        /// Seconds until the caller's block expires.
        retry_after_secs: u64,
    },

    /// A dependency's circuit breaker is open.
    #[error("circuit breaker open for dependency: {dependency}")]
    CircuitOpen {
        /// Name of the failing dependency.
        dependency: String,
    },

    /// The request waited in the execution queue longer than allowed.
    #[error("queued for {waited_ms}ms without an execution slot")]
    QueueTimeout {
        /// How long the request waited before being dropped.
        waited_ms: u64,
    },

    /// Execution exceeded its wall-clock budget.
    #[error("execution timed out after {timeout_ms}ms")]
    Timeout {
        /// The configured timeout in milliseconds.
        timeout_ms: u64,
    },

    /// Stdout crossed the capture cap and the run was aborted.
    #[error("output size limit exceeded ({cap_bytes} bytes)")]
    OutputOverflow {
        /// The configured capture cap in bytes.
        cap_bytes: usize,
    },

    /// The child process could not be started.
    #[error("failed to spawn process: {source}")]
    SpawnFailed {
        /// The OS error from the spawn attempt.
        #[source]
        source: std::io::Error,
    },

    /// Any other unexpected failure, tagged with a correlation id.
    #[error("internal error [{correlation_id}]: {source}")]
    Internal {
        /// Correlation id for log lookup.
        correlation_id: String,
        /// The underlying cause.
        #[source]
        source: anyhow::Error,
    },
}

impl BrokerError {
    /// Wrap an unexpected error with a fresh correlation id.
    pub fn internal(source: anyhow::Error) -> Self {
        Self::Internal {
            correlation_id: uuid::Uuid::new_v4().simple().to_string(),
            source,
        }
    }

    /// Returns the stable error code string for programmatic matching.
    pub fn code(&self) -> &'static str {
        match self {
            Self::BadRequest { .. } => "BAD_REQUEST",
            Self::PolicyRejected { .. } => "POLICY_REJECTED",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Unsupported { .. } => "UNSUPPORTED",
            Self::RateLimited { .. } => "RATE_LIMITED",
            Self::CircuitOpen { .. } => "CIRCUIT_OPEN",
            Self::QueueTimeout { .. } => "QUEUE_TIMEOUT",
            Self::Timeout { .. } => "TIMEOUT",
            Self::OutputOverflow { .. } => "OUTPUT_OVERFLOW",
            Self::SpawnFailed { .. } => "SPAWN_FAILED",
            Self::Internal { .. } => "INTERNAL",
        }
    }

    /// Returns whether the operation that produced this error may succeed if retried.
    pub fn retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. } => true,
            Self::CircuitOpen { .. } => true,
            Self::QueueTimeout { .. } => true,
            Self::Timeout { .. } => true,
            Self::BadRequest { .. } => false,
            Self::PolicyRejected { .. } => false,
            Self::NotFound { .. } => false,
            Self::Unsupported { .. } => false,
            Self::OutputOverflow { .. } => false,
            Self::SpawnFailed { .. } => false,
            Self::Internal { .. } => false,
        }
    }

    /// Convert to a structured JSON error for machine consumption.
    ///
    /// Returns an object with `error`, `code`, `message`, `retryable`, and
    /// optionally `suggested_fix` (populated by fuzzy matching when
    /// `known_languages` is provided for `Unsupported` errors).
    pub fn to_structured(&self, known_languages: Option<&[&str]>) -> serde_json::Value {
        let suggested_fix = match self {
            Self::Unsupported { language } => {
                known_languages.and_then(|ids| find_similar_language(language, ids))
            }
            Self::RateLimited { retry_after_secs } => {
                Some(format!("Retry after {retry_after_secs}s"))
            }
            Self::CircuitOpen { .. } => Some("Retry after a delay".to_string()),
            Self::Timeout { .. } => Some("Increase timeoutMs or simplify the code".to_string()),
            Self::QueueTimeout { .. } => Some("Retry when the broker is less busy".to_string()),
            _ => None,
        };

        let mut obj = serde_json::json!({
            "error": true,
            "code": self.code(),
            "message": self.to_string(),
            "retryable": self.retryable(),
        });

        if let Some(fix) = suggested_fix {
            obj["suggested_fix"] = serde_json::Value::String(fix);
        }

        obj
    }
}

/// Find the closest matching language id using Levenshtein distance.
///
/// Returns a suggestion string if an id within edit distance 3 is found.
fn find_similar_language(language: &str, known: &[&str]) -> Option<String> {
    let mut best: Option<(usize, &str)> = None;

    for &id in known {
        let dist = strsim::levenshtein(language, id);
        if dist <= 3 && best.is_none_or(|(d, _)| dist < d) {
            best = Some((dist, id));
        }
    }

    best.map(|(_, id)| format!("Did you mean '{id}'?"))
}

// Compile-time assertion: BrokerError must be Send + Sync + 'static
const _: fn() = || {
    fn assert_bounds<T: Send + Sync + 'static>() {}
    assert_bounds::<BrokerError>();
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_policy_rejected() {
        let err = BrokerError::PolicyRejected {
            reason: "python-os-system".into(),
        };
        assert_eq!(err.to_string(), "code rejected by policy: python-os-system");
    }

    #[test]
    fn display_not_found() {
        let err = BrokerError::NotFound {
            session_id: "abc123".into(),
        };
        assert_eq!(err.to_string(), "session not found: abc123");
    }

    #[test]
    fn display_timeout() {
        let err = BrokerError::Timeout { timeout_ms: 2000 };
        assert_eq!(err.to_string(), "execution timed out after 2000ms");
    }

    #[test]
    fn display_rate_limited() {
        let err = BrokerError::RateLimited {
            retry_after_secs: 300,
        };
        assert_eq!(err.to_string(), "rate limit exceeded, retry in 300s");
    }

    #[test]
    fn code_exhaustive() {
        let cases: Vec<(BrokerError, &str)> = vec![
            (
                BrokerError::BadRequest { reason: "x".into() },
                "BAD_REQUEST",
            ),
            (
                BrokerError::PolicyRejected { reason: "p".into() },
                "POLICY_REJECTED",
            ),
            (
                BrokerError::NotFound {
                    session_id: "s".into(),
                },
                "NOT_FOUND",
            ),
            (
                BrokerError::Unsupported {
                    language: "l".into(),
                },
                "UNSUPPORTED",
            ),
            (
                BrokerError::RateLimited {
                    retry_after_secs: 1,
                },
                "RATE_LIMITED",
            ),
            (
                BrokerError::CircuitOpen {
                    dependency: "redis".into(),
                },
                "CIRCUIT_OPEN",
            ),
            (BrokerError::QueueTimeout { waited_ms: 1 }, "QUEUE_TIMEOUT"),
            (BrokerError::Timeout { timeout_ms: 1 }, "TIMEOUT"),
            (
                BrokerError::OutputOverflow { cap_bytes: 1 },
                "OUTPUT_OVERFLOW",
            ),
            (
                BrokerError::SpawnFailed {
                    source: std::io::Error::other("boom"),
                },
                "SPAWN_FAILED",
            ),
            (
                BrokerError::internal(anyhow::anyhow!("x")),
                "INTERNAL",
            ),
        ];
        for (err, expected_code) in &cases {
            assert_eq!(err.code(), *expected_code, "wrong code for {err}");
        }
    }

    #[test]
    fn retryable_true_cases() {
        assert!(BrokerError::RateLimited {
            retry_after_secs: 1
        }
        .retryable());
        assert!(BrokerError::CircuitOpen {
            dependency: "redis".into()
        }
        .retryable());
        assert!(BrokerError::Timeout { timeout_ms: 1 }.retryable());
        assert!(BrokerError::QueueTimeout { waited_ms: 1 }.retryable());
    }

    #[test]
    fn retryable_false_cases() {
        assert!(!BrokerError::BadRequest { reason: "r".into() }.retryable());
        assert!(!BrokerError::PolicyRejected { reason: "p".into() }.retryable());
        assert!(!BrokerError::Unsupported {
            language: "x".into()
        }
        .retryable());
        assert!(!BrokerError::internal(anyhow::anyhow!("x")).retryable());
    }

    #[test]
    fn internal_carries_correlation_id() {
        let err = BrokerError::internal(anyhow::anyhow!("root cause"));
        let BrokerError::Internal { correlation_id, .. } = &err else {
            panic!("expected Internal");
        };
        assert_eq!(correlation_id.len(), 32);
        assert!(err.to_string().contains(correlation_id));
        assert!(err.to_string().contains("root cause"));
    }

    #[test]
    fn structured_error_basic_fields() {
        let err = BrokerError::NotFound {
            session_id: "sess-1".into(),
        };
        let json = err.to_structured(None);
        assert_eq!(json["error"], true);
        assert_eq!(json["code"], "NOT_FOUND");
        assert_eq!(json["retryable"], false);
        assert!(json["message"].as_str().unwrap().contains("sess-1"));
    }

    #[test]
    fn structured_error_unsupported_with_suggestion() {
        let err = BrokerError::Unsupported {
            language: "pythn".into(),
        };
        let known = ["python", "javascript", "rust"];
        let json = err.to_structured(Some(&known));
        let fix = json["suggested_fix"].as_str().unwrap();
        assert!(fix.contains("python"), "expected suggestion, got: {fix}");
    }

    #[test]
    fn structured_error_unsupported_no_match() {
        let err = BrokerError::Unsupported {
            language: "brainfuck".into(),
        };
        let known = ["python", "javascript"];
        let json = err.to_structured(Some(&known));
        assert!(json.get("suggested_fix").is_none());
    }

    #[test]
    fn structured_error_rate_limited_reports_block() {
        let err = BrokerError::RateLimited {
            retry_after_secs: 42,
        };
        let json = err.to_structured(None);
        assert_eq!(json["retryable"], true);
        assert!(json["suggested_fix"].as_str().unwrap().contains("42"));
    }

    #[test]
    fn fuzzy_match_close_language() {
        let result = find_similar_language("javascrip", &["javascript", "java"]);
        assert!(result.unwrap().contains("javascript"));
    }

    #[test]
    fn fuzzy_match_beyond_threshold() {
        assert!(find_similar_language("zzzzzzzz", &["python", "rust"]).is_none());
    }
}
