//! Call signaling coordinator
//!
//! Owns the call lifecycle: atomic session creation, ring timeout
//! scheduling, and effect execution for every transition computed by the
//! reducer. Signaling failures are synchronous (`Error::Busy` and
//! friends); delivery of frames to peers is fire-and-forget through the
//! injected `SignalSink`.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::reducer::{reduce, CallEvent, Effect};
use super::store::CallSessionStore;
use crate::metrics;
use crate::models::{CallId, CallSession, CallSignal, CallState, CallType, UserId};
use crate::{Error, Result};

/// Outbound signaling delivery seam, implemented over the fanout bus
#[async_trait]
pub trait SignalSink: Send + Sync {
    async fn deliver(&self, to: &UserId, signal: CallSignal);
}

#[derive(Clone)]
pub struct CallCoordinator {
    store: Arc<dyn CallSessionStore>,
    sink: Arc<dyn SignalSink>,
    ring_timeout: Duration,
    /// Pending ring timers keyed by call; cancelled on every terminal
    /// transition so a late timer cannot fire against an ended session.
    timers: Arc<DashMap<CallId, CancellationToken>>,
}

impl CallCoordinator {
    pub fn new(
        store: Arc<dyn CallSessionStore>,
        sink: Arc<dyn SignalSink>,
        ring_timeout: Duration,
    ) -> Self {
        Self {
            store,
            sink,
            ring_timeout,
            timers: Arc::new(DashMap::new()),
        }
    }

    /// Start a call. Fails synchronously with `Error::Busy` if either
    /// peer already has a live session; the existing session is left
    /// untouched.
    pub async fn initiate(
        &self,
        caller_id: UserId,
        callee_id: UserId,
        call_type: CallType,
        offer: String,
    ) -> Result<CallSession> {
        if caller_id == callee_id {
            return Err(Error::InvalidInput("Cannot call yourself".to_string()));
        }
        if offer.is_empty() {
            return Err(Error::InvalidInput("Offer must not be empty".to_string()));
        }

        let session = CallSession::new(caller_id, callee_id, call_type, offer);
        self.store.try_create(session.clone()).await?;
        metrics::CALLS_RINGING.inc();

        self.schedule_ring_timeout(session.call_id.clone());

        info!(
            call_id = %session.call_id,
            caller_id = %session.caller_id,
            callee_id = %session.callee_id,
            call_type = ?session.call_type,
            "Call initiated"
        );

        self.sink
            .deliver(
                &session.callee_id,
                CallSignal::Incoming {
                    call_id: session.call_id.clone(),
                    caller_id: session.caller_id.clone(),
                    call_type: session.call_type,
                    offer: session.offer.clone(),
                },
            )
            .await;

        Ok(session)
    }

    pub async fn answer(&self, call_id: &CallId, by: UserId, answer: String) -> Result<()> {
        if answer.is_empty() {
            return Err(Error::InvalidInput("Answer must not be empty".to_string()));
        }
        self.apply(call_id, CallEvent::Answer { by, answer }).await
    }

    pub async fn reject(&self, call_id: &CallId, by: UserId) -> Result<()> {
        self.apply(call_id, CallEvent::Reject { by }).await
    }

    pub async fn end(&self, call_id: &CallId, by: UserId) -> Result<()> {
        self.apply(call_id, CallEvent::Hangup { by }).await
    }

    pub async fn ice_candidate(
        &self,
        call_id: &CallId,
        from: UserId,
        candidate: String,
    ) -> Result<()> {
        self.apply(call_id, CallEvent::IceCandidate { from, candidate })
            .await
    }

    /// The user's live session, if any (`call:get-active`)
    pub async fn active_call(&self, user_id: &UserId) -> Option<CallSession> {
        self.store.find_by_user(user_id).await
    }

    /// Presence dropped to zero for this user: end their session, if any,
    /// and notify the remaining peer.
    pub async fn on_user_offline(&self, user_id: &UserId) {
        let Some(session) = self.store.find_by_user(user_id).await else {
            return;
        };
        if let Err(e) = self
            .apply(
                &session.call_id,
                CallEvent::PeerDisconnected {
                    user_id: user_id.clone(),
                },
            )
            .await
        {
            debug!(
                call_id = %session.call_id,
                user_id = %user_id,
                error = %e,
                "Peer disconnect raced a terminal transition"
            );
        }
    }

    async fn apply(&self, call_id: &CallId, event: CallEvent) -> Result<()> {
        let session = self
            .store
            .get(call_id)
            .await
            .ok_or_else(|| Error::NotFound(format!("Call {call_id} not found")))?;

        let effects = reduce(&session, &event)?;
        debug!(
            call_id = %call_id,
            event = event.name(),
            effects = effects.len(),
            "Applying call event"
        );

        for effect in effects {
            match effect {
                Effect::CancelRingTimer => {
                    if let Some((_, token)) = self.timers.remove(call_id) {
                        token.cancel();
                    }
                }
                Effect::SetActive { answer } => {
                    self.store.set_active(call_id, answer).await?;
                    metrics::CALLS_RINGING.dec();
                    metrics::CALLS_ACTIVE.inc();
                }
                Effect::RemoveSession { reason } => {
                    if let Some(removed) = self.store.remove(call_id).await {
                        match removed.state {
                            CallState::Ringing => metrics::CALLS_RINGING.dec(),
                            CallState::Active => metrics::CALLS_ACTIVE.dec(),
                            CallState::Ended => {}
                        }
                        info!(
                            call_id = %call_id,
                            reason = ?reason,
                            "Call ended"
                        );
                    }
                }
                Effect::Signal { to, signal } => {
                    self.sink.deliver(&to, signal).await;
                }
            }
        }

        Ok(())
    }

    fn schedule_ring_timeout(&self, call_id: CallId) {
        let token = CancellationToken::new();
        self.timers.insert(call_id.clone(), token.clone());

        let coordinator = self.clone();
        let ring_timeout = self.ring_timeout;
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(ring_timeout) => {
                    coordinator.timers.remove(&call_id);
                    if let Err(e) = coordinator.apply(&call_id, CallEvent::RingTimeout).await {
                        // Session answered or ended in the meantime
                        debug!(call_id = %call_id, error = %e, "Ring timeout was stale");
                    } else {
                        warn!(call_id = %call_id, "Call timed out unanswered");
                    }
                }
            }
        });
    }
}
