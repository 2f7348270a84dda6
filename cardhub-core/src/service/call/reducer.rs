//! Call state machine reducer
//!
//! Pure transition logic: `(session, event) -> effects`. The coordinator
//! executes effects (signal delivery, timer cancellation, store
//! mutation); nothing here touches I/O, which keeps every transition
//! unit-testable.
//!
//! States: `Ringing -> Active -> Ended`, with `Ended` terminal. Initiate
//! is handled by the store's atomic check-and-set, not here.

use crate::models::{CallSession, CallSignal, CallState, EndReason, UserId};
use crate::{Error, Result};

/// Events applied to an existing session
#[derive(Debug, Clone)]
pub enum CallEvent {
    Answer { by: UserId, answer: String },
    Reject { by: UserId },
    Hangup { by: UserId },
    IceCandidate { from: UserId, candidate: String },
    RingTimeout,
    PeerDisconnected { user_id: UserId },
}

impl CallEvent {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Answer { .. } => "answer",
            Self::Reject { .. } => "reject",
            Self::Hangup { .. } => "hangup",
            Self::IceCandidate { .. } => "ice_candidate",
            Self::RingTimeout => "ring_timeout",
            Self::PeerDisconnected { .. } => "peer_disconnected",
        }
    }
}

/// Side effects the coordinator must execute, in order
#[derive(Debug, Clone)]
pub enum Effect {
    CancelRingTimer,
    /// Ringing -> Active in the store
    SetActive { answer: String },
    /// Delete the session; terminal transition
    RemoveSession { reason: EndReason },
    /// Deliver a signaling frame to one peer
    Signal { to: UserId, signal: CallSignal },
}

/// Compute the effects of applying `event` to `session`.
///
/// Invalid transitions (wrong state, wrong participant) return an error
/// and imply no state change.
pub fn reduce(session: &CallSession, event: &CallEvent) -> Result<Vec<Effect>> {
    match event {
        CallEvent::Answer { by, answer } => {
            require_state(session, CallState::Ringing, "answer")?;
            if by != &session.callee_id {
                return Err(Error::InvalidInput(
                    "Only the callee can answer a call".to_string(),
                ));
            }
            Ok(vec![
                Effect::CancelRingTimer,
                Effect::SetActive {
                    answer: answer.clone(),
                },
                Effect::Signal {
                    to: session.caller_id.clone(),
                    signal: CallSignal::Answered {
                        call_id: session.call_id.clone(),
                        answer: answer.clone(),
                    },
                },
            ])
        }

        CallEvent::Reject { by } => {
            require_state(session, CallState::Ringing, "reject")?;
            if by != &session.callee_id {
                return Err(Error::InvalidInput(
                    "Only the callee can reject a call".to_string(),
                ));
            }
            Ok(vec![
                Effect::CancelRingTimer,
                Effect::RemoveSession {
                    reason: EndReason::Rejected,
                },
                Effect::Signal {
                    to: session.caller_id.clone(),
                    signal: ended(session, EndReason::Rejected),
                },
            ])
        }

        CallEvent::Hangup { by } => {
            require_live(session, "end")?;
            let peer = session
                .peer_of(by)
                .ok_or_else(|| Error::InvalidInput("Not a participant of this call".to_string()))?
                .clone();
            Ok(vec![
                Effect::CancelRingTimer,
                Effect::RemoveSession {
                    reason: EndReason::Hangup,
                },
                Effect::Signal {
                    to: by.clone(),
                    signal: ended(session, EndReason::Hangup),
                },
                Effect::Signal {
                    to: peer,
                    signal: ended(session, EndReason::Hangup),
                },
            ])
        }

        CallEvent::IceCandidate { from, candidate } => {
            require_live(session, "ice candidate")?;
            let peer = session
                .peer_of(from)
                .ok_or_else(|| Error::InvalidInput("Not a participant of this call".to_string()))?
                .clone();
            // Candidate payload is opaque, relayed verbatim
            Ok(vec![Effect::Signal {
                to: peer,
                signal: CallSignal::IceCandidate {
                    call_id: session.call_id.clone(),
                    candidate: candidate.clone(),
                },
            }])
        }

        CallEvent::RingTimeout => {
            require_state(session, CallState::Ringing, "timeout")?;
            Ok(vec![
                Effect::RemoveSession {
                    reason: EndReason::Timeout,
                },
                Effect::Signal {
                    to: session.caller_id.clone(),
                    signal: ended(session, EndReason::Timeout),
                },
                Effect::Signal {
                    to: session.callee_id.clone(),
                    signal: ended(session, EndReason::Timeout),
                },
            ])
        }

        CallEvent::PeerDisconnected { user_id } => {
            require_live(session, "peer disconnect")?;
            let remaining = session
                .peer_of(user_id)
                .ok_or_else(|| Error::InvalidInput("Not a participant of this call".to_string()))?
                .clone();
            Ok(vec![
                Effect::CancelRingTimer,
                Effect::RemoveSession {
                    reason: EndReason::PeerDisconnected,
                },
                Effect::Signal {
                    to: remaining,
                    signal: ended(session, EndReason::PeerDisconnected),
                },
            ])
        }
    }
}

fn ended(session: &CallSession, reason: EndReason) -> CallSignal {
    CallSignal::Ended {
        call_id: session.call_id.clone(),
        reason,
    }
}

fn require_state(session: &CallSession, state: CallState, action: &str) -> Result<()> {
    if session.state == state {
        Ok(())
    } else {
        Err(Error::InvalidInput(format!(
            "Cannot {action}: call {} is in state {:?}",
            session.call_id, session.state
        )))
    }
}

fn require_live(session: &CallSession, action: &str) -> Result<()> {
    if matches!(session.state, CallState::Ringing | CallState::Active) {
        Ok(())
    } else {
        Err(Error::InvalidInput(format!(
            "Cannot {action}: call {} already ended",
            session.call_id
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CallType;

    fn ringing_session() -> CallSession {
        CallSession::new(
            UserId::from_string("alice".to_string()),
            UserId::from_string("bob".to_string()),
            CallType::Video,
            "offer".to_string(),
        )
    }

    fn active_session() -> CallSession {
        let mut session = ringing_session();
        session.state = CallState::Active;
        session.answer = Some("answer".to_string());
        session
    }

    fn bob() -> UserId {
        UserId::from_string("bob".to_string())
    }

    fn alice() -> UserId {
        UserId::from_string("alice".to_string())
    }

    #[test]
    fn test_answer_from_callee_activates_and_notifies_caller() {
        let session = ringing_session();
        let effects = reduce(
            &session,
            &CallEvent::Answer {
                by: bob(),
                answer: "answer-sdp".to_string(),
            },
        )
        .unwrap();

        assert!(matches!(effects[0], Effect::CancelRingTimer));
        assert!(matches!(effects[1], Effect::SetActive { .. }));
        match &effects[2] {
            Effect::Signal { to, signal } => {
                assert_eq!(to, &alice());
                assert!(matches!(signal, CallSignal::Answered { .. }));
            }
            other => panic!("Expected Signal effect, got {other:?}"),
        }
    }

    #[test]
    fn test_answer_from_caller_rejected() {
        let session = ringing_session();
        let result = reduce(
            &session,
            &CallEvent::Answer {
                by: alice(),
                answer: "sdp".to_string(),
            },
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_answer_on_active_session_rejected() {
        let session = active_session();
        let result = reduce(
            &session,
            &CallEvent::Answer {
                by: bob(),
                answer: "sdp".to_string(),
            },
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_reject_ends_with_rejected_and_notifies_caller_only() {
        let session = ringing_session();
        let effects = reduce(&session, &CallEvent::Reject { by: bob() }).unwrap();

        assert!(matches!(
            effects[1],
            Effect::RemoveSession {
                reason: EndReason::Rejected
            }
        ));
        let signals: Vec<_> = effects
            .iter()
            .filter(|e| matches!(e, Effect::Signal { .. }))
            .collect();
        assert_eq!(signals.len(), 1);
    }

    #[test]
    fn test_hangup_notifies_both_peers() {
        let session = active_session();
        let effects = reduce(&session, &CallEvent::Hangup { by: alice() }).unwrap();

        let recipients: Vec<&UserId> = effects
            .iter()
            .filter_map(|e| match e {
                Effect::Signal { to, .. } => Some(to),
                _ => None,
            })
            .collect();
        assert_eq!(recipients.len(), 2);
        assert!(recipients.contains(&&alice()));
        assert!(recipients.contains(&&bob()));
    }

    #[test]
    fn test_ice_relays_verbatim_to_peer() {
        for session in [ringing_session(), active_session()] {
            let effects = reduce(
                &session,
                &CallEvent::IceCandidate {
                    from: alice(),
                    candidate: "candidate:0 1 UDP ...".to_string(),
                },
            )
            .unwrap();

            assert_eq!(effects.len(), 1);
            match &effects[0] {
                Effect::Signal { to, signal } => {
                    assert_eq!(to, &bob());
                    match signal {
                        CallSignal::IceCandidate { candidate, .. } => {
                            assert_eq!(candidate, "candidate:0 1 UDP ...");
                        }
                        other => panic!("Expected IceCandidate, got {other:?}"),
                    }
                }
                other => panic!("Expected Signal effect, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_ice_from_outsider_rejected() {
        let session = active_session();
        let result = reduce(
            &session,
            &CallEvent::IceCandidate {
                from: UserId::from_string("carol".to_string()),
                candidate: "c".to_string(),
            },
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_ring_timeout_notifies_both_peers() {
        let session = ringing_session();
        let effects = reduce(&session, &CallEvent::RingTimeout).unwrap();

        assert!(matches!(
            effects[0],
            Effect::RemoveSession {
                reason: EndReason::Timeout
            }
        ));
        let signals = effects
            .iter()
            .filter(|e| matches!(e, Effect::Signal { .. }))
            .count();
        assert_eq!(signals, 2);
    }

    #[test]
    fn test_ring_timeout_on_active_session_rejected() {
        // A late timer firing after answer must be a no-op
        let session = active_session();
        assert!(reduce(&session, &CallEvent::RingTimeout).is_err());
    }

    #[test]
    fn test_peer_disconnect_notifies_remaining_peer() {
        let session = active_session();
        let effects = reduce(
            &session,
            &CallEvent::PeerDisconnected { user_id: alice() },
        )
        .unwrap();

        assert!(matches!(
            effects[1],
            Effect::RemoveSession {
                reason: EndReason::PeerDisconnected
            }
        ));
        match &effects[2] {
            Effect::Signal { to, .. } => assert_eq!(to, &bob()),
            other => panic!("Expected Signal effect, got {other:?}"),
        }
    }
}
