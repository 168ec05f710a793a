//! Health status types.
//!
//! [`HealthStatus`] is what a single client reports from a probe;
//! [`HealthRecord`] is the registry's per-server snapshot of it, replaced
//! wholesale on every probe.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::config::TransportKind;
use super::errors::{FailureReason, McpError, Phase};
use super::framing::Framing;

/// Result of a client-level liveness probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    pub ok: bool,
    pub reason: Option<FailureReason>,
    pub phase: Option<Phase>,
    pub framing: Option<Framing>,
    pub error: Option<String>,
}

impl HealthStatus {
    pub fn healthy(framing: Option<Framing>) -> Self {
        Self {
            ok: true,
            reason: None,
            phase: None,
            framing,
            error: None,
        }
    }

    pub fn failed(err: &McpError, framing: Option<Framing>) -> Self {
        Self {
            ok: false,
            reason: Some(err.reason),
            phase: Some(err.phase),
            framing,
            error: Some(err.to_string()),
        }
    }
}

/// The registry's view of one configured server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthRecord {
    pub name: String,
    pub transport: TransportKind,
    pub ok: bool,
    pub reason: Option<FailureReason>,
    pub error: Option<String>,
    pub phase: Option<Phase>,
    pub framing: Option<Framing>,
    pub last_checked_at: DateTime<Utc>,
}

impl HealthRecord {
    pub fn from_status(name: &str, transport: TransportKind, status: HealthStatus) -> Self {
        Self {
            name: name.to_string(),
            transport,
            ok: status.ok,
            reason: status.reason,
            error: status.error,
            phase: status.phase,
            framing: status.framing,
            last_checked_at: Utc::now(),
        }
    }

    pub fn from_error(name: &str, transport: TransportKind, err: &McpError) -> Self {
        Self::from_status(name, transport, HealthStatus::failed(err, None))
    }

    /// A configured-but-disabled server: not ok, but not failing either.
    pub fn disabled(name: &str, transport: TransportKind) -> Self {
        Self {
            name: name.to_string(),
            transport,
            ok: false,
            reason: None,
            error: Some("disabled".into()),
            phase: None,
            framing: None,
            last_checked_at: Utc::now(),
        }
    }

    /// Whether replacing `previous` with `self` is a health transition.
    pub fn is_transition_from(&self, previous: Option<&HealthRecord>) -> bool {
        match previous {
            None => true,
            Some(prev) => prev.ok != self.ok || prev.reason != self.reason,
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn crash() -> McpError {
        McpError::new(
            FailureReason::ServerCrash,
            "git",
            "ping",
            Phase::Request,
            "exited",
        )
    }

    #[test]
    fn test_failed_status_carries_reason_and_phase() {
        let status = HealthStatus::failed(&crash(), Some(Framing::Newline));
        assert!(!status.ok);
        assert_eq!(status.reason, Some(FailureReason::ServerCrash));
        assert_eq!(status.phase, Some(Phase::Request));
        assert!(status.error.unwrap().contains("exited"));
    }

    #[test]
    fn test_transition_detection() {
        let ok = HealthRecord::from_status(
            "git",
            TransportKind::Stdio,
            HealthStatus::healthy(Some(Framing::Newline)),
        );
        assert!(ok.is_transition_from(None));
        assert!(!ok.clone().is_transition_from(Some(&ok)));

        let bad = HealthRecord::from_error("git", TransportKind::Stdio, &crash());
        assert!(bad.is_transition_from(Some(&ok)));
        assert!(!bad.is_transition_from(Some(&bad)));
    }

    #[test]
    fn test_record_serializes_camel_case() {
        let rec = HealthRecord::disabled("docs", TransportKind::Http);
        let json = serde_json::to_value(&rec).unwrap();
        assert_eq!(json["name"], "docs");
        assert_eq!(json["transport"], "http");
        assert_eq!(json["ok"], false);
        assert!(json.get("lastCheckedAt").is_some());
    }
}
