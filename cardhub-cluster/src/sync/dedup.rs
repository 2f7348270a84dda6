//! Windowed event deduplication
//!
//! The bus is at-least-once: reconnects and overlapping subscriptions can
//! hand an instance the same event twice. Events are remembered by their
//! identity for a short window and repeats inside it are dropped.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use super::events::FanoutEvent;

/// Identity of an event for duplicate detection
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct DedupKey {
    pub event_type: String,
    pub subject: String,
    pub timestamp_ms: i64,
}

impl DedupKey {
    #[must_use]
    pub fn from_event(event: &FanoutEvent) -> Self {
        // Presence events need the instance and direction in the key:
        // "node1 says alice online" and "node2 says alice online" are
        // distinct events.
        let subject = match event {
            FanoutEvent::PresenceChanged {
                user_id,
                instance_id,
                online,
                ..
            } => format!("{user_id}:{instance_id}:{online}"),
            other => other
                .recipient_id()
                .map(|id| id.as_str().to_string())
                .unwrap_or_default(),
        };
        Self {
            event_type: event.event_type().to_string(),
            subject,
            timestamp_ms: event.timestamp().timestamp_millis(),
        }
    }
}

/// Remembers recently seen events, expiring them in the background
#[derive(Clone)]
pub struct EventDeduplicator {
    seen: Arc<DashMap<DedupKey, Instant>>,
    window: Duration,
    cancel: CancellationToken,
}

impl EventDeduplicator {
    pub fn new(window: Duration, cleanup_interval: Duration) -> Self {
        let dedup = Self {
            seen: Arc::new(DashMap::new()),
            window,
            cancel: CancellationToken::new(),
        };

        let sweeper = dedup.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(cleanup_interval);
            loop {
                tokio::select! {
                    _ = sweeper.cancel.cancelled() => return,
                    _ = interval.tick() => {
                        let now = Instant::now();
                        sweeper.seen.retain(|_, expires_at| *expires_at > now);
                    }
                }
            }
        });

        dedup
    }

    /// 5-second window, swept every 30 seconds
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(Duration::from_secs(5), Duration::from_secs(30))
    }

    /// True exactly once per key per window
    #[must_use]
    pub fn should_process(&self, key: &DedupKey) -> bool {
        let now = Instant::now();
        match self.seen.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                if *entry.get() > now {
                    return false;
                }
                entry.insert(now + self.window);
                true
            }
            Entry::Vacant(entry) => {
                entry.insert(now + self.window);
                true
            }
        }
    }

    /// Stop the background sweeper
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    /// Forget everything (tests)
    pub fn clear(&self) {
        self.seen.clear();
    }
}
