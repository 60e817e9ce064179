//! Session lifecycle state and transition events

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of the single connection owned by a `ConnectionManager`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Disconnected,
    Connecting,
    Authenticating,
    /// Connected and accepting operations
    Ready,
    /// Connected, but keep-alives are failing
    Degraded,
    /// Tearing down a stale session and establishing a new one
    Reconnecting,
}

impl SessionState {
    /// Whether a session handle is expected to exist in this state.
    pub fn is_connected(self) -> bool {
        matches!(self, Self::Ready | Self::Degraded)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Authenticating => "authenticating",
            Self::Ready => "ready",
            Self::Degraded => "degraded",
            Self::Reconnecting => "reconnecting",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured state transition, broadcast to subscribers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateEvent {
    pub previous: SessionState,
    pub state: SessionState,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl StateEvent {
    pub fn new(previous: SessionState, state: SessionState, detail: Option<String>) -> Self {
        Self {
            previous,
            state,
            timestamp: Utc::now(),
            detail,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = StateEvent::new(
            SessionState::Ready,
            SessionState::Reconnecting,
            Some("idle for 1805s".into()),
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["previous"], "ready");
        assert_eq!(json["state"], "reconnecting");
        assert_eq!(json["detail"], "idle for 1805s");

        let quiet = StateEvent::new(SessionState::Connecting, SessionState::Authenticating, None);
        let json = serde_json::to_value(&quiet).unwrap();
        assert!(json.get("detail").is_none());
    }

    #[test]
    fn test_connected_states() {
        assert!(SessionState::Ready.is_connected());
        assert!(SessionState::Degraded.is_connected());
        assert!(!SessionState::Reconnecting.is_connected());
        assert_eq!(SessionState::default(), SessionState::Disconnected);
    }
}
