//! Call signaling wiring
//!
//! Bridges the coordinator to the fanout bus (signal delivery to peers on
//! any instance) and to the registry's status feed (ending calls when a
//! peer's presence fully drops).

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

use cardhub_cluster::{ConnectionRegistry, FanoutBus, FanoutEvent};
use cardhub_core::models::{CallSignal, UserId};
use cardhub_core::service::call::{CallCoordinator, SignalSink};

/// Delivers call signals through the fanout bus, reaching peers on any
/// instance. Best-effort: a peer with no live connection simply misses
/// the frame, which the ring timeout and presence feed then reconcile.
pub struct FanoutSignalSink {
    bus: Arc<FanoutBus>,
}

impl FanoutSignalSink {
    #[must_use]
    pub fn new(bus: Arc<FanoutBus>) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl SignalSink for FanoutSignalSink {
    async fn deliver(&self, to: &UserId, signal: CallSignal) {
        self.bus.publish(FanoutEvent::CallSignal {
            recipient_id: to.clone(),
            signal,
            timestamp: chrono::Utc::now(),
        });
    }
}

/// Watch the merged presence feed and end calls whose peer went fully
/// offline (all devices). A single device closing while another stays
/// online does not end the call.
pub fn spawn_presence_watcher(registry: Arc<ConnectionRegistry>, coordinator: CallCoordinator) {
    let mut status_rx = registry.subscribe_status();

    tokio::spawn(async move {
        loop {
            match status_rx.recv().await {
                Ok(update) => {
                    if !update.online {
                        coordinator.on_user_offline(&update.user_id).await;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    // Missed transitions; stale sessions are still bounded
                    // by the ring timeout and explicit hangups
                    warn!(missed = missed, "Presence watcher lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    info!("Presence feed closed, call watcher exiting");
                    return;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use cardhub_cluster::{ConnectionLimits, FanoutConfig};
    use cardhub_core::models::{CallId, EndReason};
    use cardhub_core::service::call::InMemoryCallSessionStore;
    use std::time::Duration;

    #[tokio::test]
    async fn test_sink_routes_signal_to_recipient_connections() {
        let registry = Arc::new(ConnectionRegistry::new(
            "test_node".to_string(),
            ConnectionLimits::default(),
        ));
        let bus = Arc::new(
            FanoutBus::new(
                FanoutConfig {
                    redis_url: String::new(),
                    dedup_window: Duration::from_secs(1),
                    cleanup_interval: Duration::from_secs(1),
                },
                registry,
            )
            .await
            .unwrap(),
        );

        let bob = UserId::from_string("bob".to_string());
        let mut rx = bus.subscribe(bob.clone(), "conn1".to_string());

        let sink = FanoutSignalSink::new(bus.clone());
        sink.deliver(
            &bob,
            CallSignal::Ended {
                call_id: CallId::from_string("call1".to_string()),
                reason: EndReason::Hangup,
            },
        )
        .await;

        let event = tokio::time::timeout(Duration::from_millis(200), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.event_type(), "call_signal");
    }

    #[tokio::test]
    async fn test_presence_watcher_ends_call_on_full_offline() {
        let registry = Arc::new(ConnectionRegistry::new(
            "test_node".to_string(),
            ConnectionLimits::default(),
        ));
        let bus = Arc::new(
            FanoutBus::new(
                FanoutConfig {
                    redis_url: String::new(),
                    dedup_window: Duration::from_secs(1),
                    cleanup_interval: Duration::from_secs(1),
                },
                registry.clone(),
            )
            .await
            .unwrap(),
        );

        let coordinator = CallCoordinator::new(
            Arc::new(InMemoryCallSessionStore::new()),
            Arc::new(FanoutSignalSink::new(bus.clone())),
            Duration::from_secs(30),
        );
        spawn_presence_watcher(registry.clone(), coordinator.clone());

        let alice = UserId::from_string("alice".to_string());
        let bob = UserId::from_string("bob".to_string());

        // Alice on two devices, both in a call with bob
        registry.register("a1".to_string(), alice.clone()).unwrap();
        registry.register("a2".to_string(), alice.clone()).unwrap();
        registry.register("b1".to_string(), bob.clone()).unwrap();

        let session = coordinator
            .initiate(
                alice.clone(),
                bob.clone(),
                cardhub_core::models::CallType::Video,
                "sdp".to_string(),
            )
            .await
            .unwrap();
        coordinator
            .answer(&session.call_id, bob.clone(), "answer".to_string())
            .await
            .unwrap();

        // One device drops: call survives
        registry.deregister("a1");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(coordinator.active_call(&bob).await.is_some());

        // Last device drops: call ends
        registry.deregister("a2");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(coordinator.active_call(&bob).await.is_none());
    }
}
