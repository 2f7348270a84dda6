//! Call session store
//!
//! The per-user session index and the session map mutate together inside
//! one critical section: "does this peer already have a session" and
//! "create the session" are a single indivisible operation, so two
//! simultaneous initiates against the same callee cannot both succeed.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;

use crate::models::{CallId, CallSession, CallState, UserId};
use crate::{Error, Result};

/// Session store seam; in-memory here, distributed behind the same
/// interface for multi-instance deployments.
#[async_trait]
pub trait CallSessionStore: Send + Sync {
    /// Atomic check-and-set: fails with `Error::Busy` if either peer
    /// already has a live session.
    async fn try_create(&self, session: CallSession) -> Result<()>;

    async fn get(&self, call_id: &CallId) -> Option<CallSession>;

    async fn find_by_user(&self, user_id: &UserId) -> Option<CallSession>;

    /// Ringing -> Active transition, recording the answer. Fails if the
    /// session is missing or not ringing.
    async fn set_active(&self, call_id: &CallId, answer: String) -> Result<CallSession>;

    /// Remove the session and both user-index entries.
    async fn remove(&self, call_id: &CallId) -> Option<CallSession>;

    async fn len(&self) -> usize;
}

#[derive(Default)]
struct StoreInner {
    sessions: HashMap<CallId, CallSession>,
    by_user: HashMap<UserId, CallId>,
}

/// Single-process implementation backed by one mutex
#[derive(Default)]
pub struct InMemoryCallSessionStore {
    inner: Mutex<StoreInner>,
}

impl InMemoryCallSessionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CallSessionStore for InMemoryCallSessionStore {
    async fn try_create(&self, session: CallSession) -> Result<()> {
        let mut inner = self.inner.lock();

        if inner.by_user.contains_key(&session.callee_id) {
            return Err(Error::Busy(format!(
                "User {} is already in a call",
                session.callee_id
            )));
        }
        if inner.by_user.contains_key(&session.caller_id) {
            return Err(Error::Busy(format!(
                "User {} is already in a call",
                session.caller_id
            )));
        }

        inner
            .by_user
            .insert(session.caller_id.clone(), session.call_id.clone());
        inner
            .by_user
            .insert(session.callee_id.clone(), session.call_id.clone());
        inner.sessions.insert(session.call_id.clone(), session);
        Ok(())
    }

    async fn get(&self, call_id: &CallId) -> Option<CallSession> {
        self.inner.lock().sessions.get(call_id).cloned()
    }

    async fn find_by_user(&self, user_id: &UserId) -> Option<CallSession> {
        let inner = self.inner.lock();
        let call_id = inner.by_user.get(user_id)?;
        inner.sessions.get(call_id).cloned()
    }

    async fn set_active(&self, call_id: &CallId, answer: String) -> Result<CallSession> {
        let mut inner = self.inner.lock();
        let session = inner
            .sessions
            .get_mut(call_id)
            .ok_or_else(|| Error::NotFound(format!("Call {call_id} not found")))?;
        if session.state != CallState::Ringing {
            return Err(Error::InvalidInput(format!(
                "Call {call_id} is not ringing"
            )));
        }
        session.state = CallState::Active;
        session.answer = Some(answer);
        Ok(session.clone())
    }

    async fn remove(&self, call_id: &CallId) -> Option<CallSession> {
        let mut inner = self.inner.lock();
        let session = inner.sessions.remove(call_id)?;
        inner.by_user.remove(&session.caller_id);
        inner.by_user.remove(&session.callee_id);
        Some(session)
    }

    async fn len(&self) -> usize {
        self.inner.lock().sessions.len()
    }
}
