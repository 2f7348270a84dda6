//! Call session models
//!
//! A call session tracks one voice/video call between exactly two peers
//! from initiation to a terminal state. Offer/answer/ICE payloads are
//! opaque strings relayed verbatim, never parsed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::id::{CallId, UserId};

/// Media type of a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallType {
    Voice,
    Video,
}

/// Call session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    Ringing,
    Active,
    Ended,
}

/// Why a call reached its terminal state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    Rejected,
    Hangup,
    Timeout,
    PeerDisconnected,
}

/// One call's lifecycle record. Exists only while state is Ringing or
/// Active; removed from the store on any terminal transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallSession {
    pub call_id: CallId,
    pub caller_id: UserId,
    pub callee_id: UserId,
    pub call_type: CallType,
    pub state: CallState,
    pub offer: String,
    pub answer: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub end_reason: Option<EndReason>,
}

impl CallSession {
    pub fn new(caller_id: UserId, callee_id: UserId, call_type: CallType, offer: String) -> Self {
        Self {
            call_id: CallId::new(),
            caller_id,
            callee_id,
            call_type,
            state: CallState::Ringing,
            offer,
            answer: None,
            started_at: Utc::now(),
            ended_at: None,
            end_reason: None,
        }
    }

    /// The other participant of the session
    pub fn peer_of(&self, user_id: &UserId) -> Option<&UserId> {
        if &self.caller_id == user_id {
            Some(&self.callee_id)
        } else if &self.callee_id == user_id {
            Some(&self.caller_id)
        } else {
            None
        }
    }

    pub fn involves(&self, user_id: &UserId) -> bool {
        &self.caller_id == user_id || &self.callee_id == user_id
    }
}

/// A signaling frame delivered to one peer of a call.
///
/// `sdp` and `candidate` payloads are opaque to this subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CallSignal {
    /// Incoming call (delivered to the callee with the caller's offer)
    Incoming {
        call_id: CallId,
        caller_id: UserId,
        call_type: CallType,
        offer: String,
    },
    /// Callee answered (delivered to the caller)
    Answered { call_id: CallId, answer: String },
    /// ICE candidate relayed verbatim to the other peer
    IceCandidate { call_id: CallId, candidate: String },
    /// Terminal notification (delivered to one or both peers)
    Ended { call_id: CallId, reason: EndReason },
}

impl CallSignal {
    #[must_use]
    pub const fn signal_type(&self) -> &'static str {
        match self {
            Self::Incoming { .. } => "incoming",
            Self::Answered { .. } => "answered",
            Self::IceCandidate { .. } => "ice_candidate",
            Self::Ended { .. } => "ended",
        }
    }

    #[must_use]
    pub const fn call_id(&self) -> &CallId {
        match self {
            Self::Incoming { call_id, .. }
            | Self::Answered { call_id, .. }
            | Self::IceCandidate { call_id, .. }
            | Self::Ended { call_id, .. } => call_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_of() {
        let session = CallSession::new(
            UserId::from_string("alice".to_string()),
            UserId::from_string("bob".to_string()),
            CallType::Video,
            "offer-sdp".to_string(),
        );
        let alice = UserId::from_string("alice".to_string());
        let bob = UserId::from_string("bob".to_string());
        let carol = UserId::from_string("carol".to_string());

        assert_eq!(session.peer_of(&alice), Some(&bob));
        assert_eq!(session.peer_of(&bob), Some(&alice));
        assert_eq!(session.peer_of(&carol), None);
        assert!(session.involves(&alice));
        assert!(!session.involves(&carol));
    }

    #[test]
    fn test_signal_serialization() {
        let signal = CallSignal::Ended {
            call_id: CallId::from_string("call1".to_string()),
            reason: EndReason::Timeout,
        };
        let json = serde_json::to_string(&signal).unwrap();
        assert!(json.contains("ended"));
        assert!(json.contains("timeout"));

        let back: CallSignal = serde_json::from_str(&json).unwrap();
        assert_eq!(back.signal_type(), "ended");
    }
}
