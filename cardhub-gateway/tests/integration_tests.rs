//! End-to-end scenarios over the wired subsystem (single node unless a
//! test says otherwise; cross-instance coverage needs a local Redis and
//! is ignored by default).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use cardhub_cluster::{
    ConnectionLimits, ConnectionRegistry, FanoutBus, FanoutConfig, FanoutEvent, SweepConfig,
};
use cardhub_core::models::{
    message::SendMessageRequest, CallSignal, CallType, ConversationId, EndReason, JobKind,
    NotificationKind, UserId,
};
use cardhub_core::repository::{
    InMemoryMessageStore, InMemoryNotificationStore, InMemoryPreferenceStore, InMemoryUserDirectory,
    MessageStore,
};
use cardhub_core::service::call::{CallCoordinator, InMemoryCallSessionStore};
use cardhub_core::service::delivery::{DeliveryHandler, DeliveryQueue, QueueConfig};
use cardhub_core::service::email::{EmailError, Mailer};
use cardhub_gateway::calls::{spawn_presence_watcher, FanoutSignalSink};
use cardhub_gateway::orchestrator::{delivery_handlers, MessageOrchestrator};

struct RecordingMailer {
    sent: parking_lot::Mutex<Vec<(String, String)>>,
}

#[async_trait::async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, to: &str, subject: &str, _body: &str) -> Result<(), EmailError> {
        self.sent.lock().push((to.to_string(), subject.to_string()));
        Ok(())
    }
}

struct Stack {
    registry: Arc<ConnectionRegistry>,
    bus: Arc<FanoutBus>,
    queue: DeliveryQueue,
    orchestrator: MessageOrchestrator,
    coordinator: CallCoordinator,
    messages: Arc<InMemoryMessageStore>,
    notifications: Arc<InMemoryNotificationStore>,
    preferences: Arc<InMemoryPreferenceStore>,
    mailer: Arc<RecordingMailer>,
}

async fn build_stack(instance_id: &str, redis_url: &str) -> Stack {
    let registry = Arc::new(ConnectionRegistry::new(
        instance_id.to_string(),
        ConnectionLimits::default(),
    ));
    let bus = Arc::new(
        FanoutBus::new(
            FanoutConfig {
                redis_url: redis_url.to_string(),
                dedup_window: Duration::from_millis(500),
                cleanup_interval: Duration::from_secs(1),
            },
            registry.clone(),
        )
        .await
        .expect("fanout bus"),
    );

    let messages = Arc::new(InMemoryMessageStore::new());
    let notifications = Arc::new(InMemoryNotificationStore::new());
    let preferences = Arc::new(InMemoryPreferenceStore::new());
    let users = Arc::new(InMemoryUserDirectory::new());
    for name in ["alice", "bob", "carol"] {
        users.add(UserId::from_string(name.to_string()));
    }

    let queue = DeliveryQueue::new(QueueConfig {
        max_attempts: 3,
        backoff_base: Duration::from_millis(10),
        workers_per_kind: 2,
        queue_capacity: 256,
    });

    let mailer = Arc::new(RecordingMailer {
        sent: parking_lot::Mutex::new(Vec::new()),
    });
    let mailer_dyn: Arc<dyn Mailer> = mailer.clone();

    queue
        .start(delivery_handlers(
            messages.clone(),
            notifications.clone(),
            preferences.clone(),
            queue.clone(),
            bus.clone(),
            Some(mailer_dyn),
        ))
        .await;

    let coordinator = CallCoordinator::new(
        Arc::new(InMemoryCallSessionStore::new()),
        Arc::new(FanoutSignalSink::new(bus.clone())),
        Duration::from_millis(300),
    );
    spawn_presence_watcher(registry.clone(), coordinator.clone());

    let orchestrator = MessageOrchestrator::new(
        messages.clone(),
        notifications.clone(),
        users,
        queue.clone(),
        bus.clone(),
    );

    Stack {
        registry,
        bus,
        queue,
        orchestrator,
        coordinator,
        messages,
        notifications,
        preferences,
        mailer,
    }
}

fn user(name: &str) -> UserId {
    UserId::from_string(name.to_string())
}

fn send_req(recipient: &str, content: &str) -> SendMessageRequest {
    SendMessageRequest {
        conversation_id: ConversationId::from_string("conv1".to_string()),
        recipient_id: user(recipient),
        content: content.to_string(),
    }
}

/// Scenario A: alice online, bob offline; alice sends "hi" to bob.
/// The message is persisted, exactly one notification record is created
/// for bob, and no online push is attempted.
#[tokio::test]
async fn scenario_a_offline_recipient() {
    let stack = build_stack("node1", "").await;

    stack
        .registry
        .register("alice_conn".to_string(), user("alice"))
        .unwrap();

    let ack = stack
        .orchestrator
        .send_message(user("alice"), send_req("bob", "hi"))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;

    let stored = stack.messages.get(&ack.id).await.unwrap();
    assert!(stored.delivered_at.is_none(), "no online push attempted");

    let records = stack.notifications.records_for(&user("bob"));
    assert_eq!(records.len(), 1, "exactly one notification record");
    assert_eq!(records[0].kind, NotificationKind::Message);

    // Preference flag off: no email job was produced
    assert!(stack.mailer.sent.lock().is_empty());
    assert_eq!(stack.queue.queue_depth()[&JobKind::Email], 0);
}

/// Offline recipient with email opt-in enabled: at most one email fires.
#[tokio::test]
async fn scenario_a_with_email_opt_in() {
    let stack = build_stack("node1", "").await;
    stack
        .preferences
        .set_email_enabled(user("bob"), NotificationKind::Message, true);
    stack
        .preferences
        .set_email_address(user("bob"), "bob@example.com".to_string());

    stack
        .orchestrator
        .send_message(user("alice"), send_req("bob", "hi"))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;

    let sent = stack.mailer.sent.lock().clone();
    assert_eq!(sent.len(), 1, "at most one email per offline message");
    assert_eq!(sent[0].0, "bob@example.com");
}

/// Online delivery: the push goes to every one of the recipient's
/// connections and the message is stamped delivered.
#[tokio::test]
async fn online_recipient_multi_device_push() {
    let stack = build_stack("node1", "").await;

    stack
        .registry
        .register("bob_1".to_string(), user("bob"))
        .unwrap();
    stack
        .registry
        .register("bob_2".to_string(), user("bob"))
        .unwrap();
    let mut rx1 = stack.bus.subscribe(user("bob"), "bob_1".to_string());
    let mut rx2 = stack.bus.subscribe(user("bob"), "bob_2".to_string());

    let ack = stack
        .orchestrator
        .send_message(user("alice"), send_req("bob", "hi"))
        .await
        .unwrap();

    for rx in [&mut rx1, &mut rx2] {
        let event = tokio::time::timeout(Duration::from_millis(500), rx.recv())
            .await
            .expect("push within bound")
            .expect("open subscription");
        match event {
            FanoutEvent::DirectMessage { message, .. } => {
                assert_eq!(message.id.as_str(), ack.id.as_str());
            }
            other => panic!("Expected DirectMessage, got {other:?}"),
        }
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(stack.messages.get(&ack.id).await.unwrap().delivered_at.is_some());
    assert!(stack.notifications.records_for(&user("bob")).is_empty());
}

/// Presence invariant: isOnline tracks the open-connection count, and the
/// sweep heals a silently dropped channel within one interval.
#[tokio::test]
async fn presence_refcount_and_sweep() {
    let stack = build_stack("node1", "").await;

    stack
        .registry
        .register("bob_1".to_string(), user("bob"))
        .unwrap();
    stack
        .registry
        .register("bob_2".to_string(), user("bob"))
        .unwrap();
    assert!(stack.registry.is_online(&user("bob")));

    stack.registry.deregister("bob_1");
    assert!(stack.registry.is_online(&user("bob")), "second device stays");

    stack.bus.spawn_sweeper(SweepConfig {
        sweep_interval: Duration::from_millis(40),
        heartbeat_timeout: Duration::from_millis(60),
        remote_max_age: Duration::from_secs(300),
    });

    // bob_2 goes silent; the sweep force-deregisters it
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(!stack.registry.is_online(&user("bob")));
}

/// Scenario C: alice calls bob (video), bob answers, alice's presence
/// drops; bob receives `call:ended` with PEER_DISCONNECTED, the session
/// is removed, and a new initiate is not blocked by a stale BUSY.
#[tokio::test]
async fn scenario_c_peer_disconnect_during_active_call() {
    let stack = build_stack("node1", "").await;

    stack
        .registry
        .register("alice_conn".to_string(), user("alice"))
        .unwrap();
    stack
        .registry
        .register("bob_conn".to_string(), user("bob"))
        .unwrap();
    let mut bob_rx = stack.bus.subscribe(user("bob"), "bob_conn".to_string());

    let session = stack
        .coordinator
        .initiate(user("alice"), user("bob"), CallType::Video, "offer".to_string())
        .await
        .unwrap();

    // Bob sees the incoming offer
    let incoming = tokio::time::timeout(Duration::from_millis(500), bob_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(
        incoming,
        FanoutEvent::CallSignal {
            signal: CallSignal::Incoming { .. },
            ..
        }
    ));

    stack
        .coordinator
        .answer(&session.call_id, user("bob"), "answer".to_string())
        .await
        .unwrap();

    // Alice's connection drops entirely
    stack.registry.deregister("alice_conn");

    let ended = tokio::time::timeout(Duration::from_millis(500), async {
        loop {
            match bob_rx.recv().await {
                Some(FanoutEvent::CallSignal {
                    signal: CallSignal::Ended { reason, .. },
                    ..
                }) => return reason,
                Some(_) => continue,
                None => panic!("subscription closed"),
            }
        }
    })
    .await
    .expect("termination notification within bound");
    assert_eq!(ended, EndReason::PeerDisconnected);

    assert!(stack.coordinator.active_call(&user("bob")).await.is_none());

    // No stale BUSY: a fresh call succeeds immediately
    stack
        .registry
        .register("alice_conn2".to_string(), user("alice"))
        .unwrap();
    stack
        .coordinator
        .initiate(user("alice"), user("bob"), CallType::Video, "offer2".to_string())
        .await
        .unwrap();
}

/// BUSY is synchronous and leaves the existing session untouched.
#[tokio::test]
async fn busy_callee_rejected_synchronously() {
    let stack = build_stack("node1", "").await;

    let first = stack
        .coordinator
        .initiate(user("alice"), user("bob"), CallType::Voice, "offer".to_string())
        .await
        .unwrap();

    let result = stack
        .coordinator
        .initiate(user("carol"), user("bob"), CallType::Voice, "offer".to_string())
        .await;
    assert!(matches!(result, Err(cardhub_core::Error::Busy(_))));

    let existing = stack.coordinator.active_call(&user("bob")).await.unwrap();
    assert_eq!(existing.call_id.as_str(), first.call_id.as_str());
}

/// A ringing call no one answers times out and both peers get exactly
/// one termination notification.
#[tokio::test]
async fn ring_timeout_notifies_both_peers_once() {
    let stack = build_stack("node1", "").await;

    stack
        .registry
        .register("alice_conn".to_string(), user("alice"))
        .unwrap();
    stack
        .registry
        .register("bob_conn".to_string(), user("bob"))
        .unwrap();
    let mut alice_rx = stack.bus.subscribe(user("alice"), "alice_conn".to_string());
    let mut bob_rx = stack.bus.subscribe(user("bob"), "bob_conn".to_string());

    stack
        .coordinator
        .initiate(user("alice"), user("bob"), CallType::Voice, "offer".to_string())
        .await
        .unwrap();

    // Ring timeout in the test stack is 300ms
    tokio::time::sleep(Duration::from_millis(600)).await;

    let count_timeouts = |events: &mut Vec<FanoutEvent>| {
        events
            .iter()
            .filter(|e| {
                matches!(
                    e,
                    FanoutEvent::CallSignal {
                        signal: CallSignal::Ended {
                            reason: EndReason::Timeout,
                            ..
                        },
                        ..
                    }
                )
            })
            .count()
    };

    let mut alice_events = Vec::new();
    while let Ok(event) = alice_rx.try_recv() {
        alice_events.push(event);
    }
    let mut bob_events = Vec::new();
    while let Ok(event) = bob_rx.try_recv() {
        bob_events.push(event);
    }

    assert_eq!(count_timeouts(&mut alice_events), 1);
    assert_eq!(count_timeouts(&mut bob_events), 1);
    assert!(stack.coordinator.active_call(&user("alice")).await.is_none());
}

/// A transiently failing job is attempted at most max_attempts times and
/// then retained as dead, observable through the admin surface.
#[tokio::test]
async fn failing_jobs_respect_attempt_cap_and_dead_letter() {
    struct AlwaysTransient;

    #[async_trait::async_trait]
    impl DeliveryHandler for AlwaysTransient {
        async fn run(
            &self,
            _job: &cardhub_core::models::DeliveryJob,
        ) -> Result<(), cardhub_core::service::delivery::DeliveryError> {
            Err(cardhub_core::service::delivery::DeliveryError::Transient(
                "smtp 421".to_string(),
            ))
        }
    }

    let queue = DeliveryQueue::new(QueueConfig {
        max_attempts: 3,
        backoff_base: Duration::from_millis(10),
        workers_per_kind: 1,
        queue_capacity: 16,
    });
    let mut handlers: HashMap<JobKind, Arc<dyn DeliveryHandler>> = HashMap::new();
    handlers.insert(JobKind::Email, Arc::new(AlwaysTransient));
    queue.start(handlers).await;

    queue
        .enqueue(JobKind::Email, serde_json::json!({"to": "x@example.com"}))
        .unwrap();

    tokio::time::sleep(Duration::from_millis(400)).await;

    let dead = queue.dead_letters();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].attempt, 3);
    assert!(queue.failure_rate() > 0.99);

    assert_eq!(queue.clear_dead_letters(), 1);
    assert!(queue.dead_letters().is_empty());
}

/// Scenario B: alice and bob connected to different instances sharing a
/// Redis bus; a message sent on alice's instance reaches bob's within a
/// bounded interval.
#[tokio::test]
#[ignore = "Requires Redis server"]
async fn scenario_b_cross_instance_delivery() {
    let redis_url = "redis://127.0.0.1:6379";
    let node_a = build_stack("node_a", redis_url).await;
    let node_b = build_stack("node_b", redis_url).await;

    // Give both subscribers time to connect
    tokio::time::sleep(Duration::from_millis(500)).await;

    node_a
        .registry
        .register("alice_conn".to_string(), user("alice"))
        .unwrap();
    node_b
        .registry
        .register("bob_conn".to_string(), user("bob"))
        .unwrap();
    node_b.bus.publish_presence(user("bob"), true);
    let mut bob_rx = node_b.bus.subscribe(user("bob"), "bob_conn".to_string());

    // Wait for the presence fanout so node_a sees bob online
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(node_a.registry.is_online(&user("bob")));

    node_a
        .orchestrator
        .send_message(user("alice"), send_req("bob", "cross-instance hi"))
        .await
        .unwrap();

    let event = tokio::time::timeout(Duration::from_secs(1), bob_rx.recv())
        .await
        .expect("delivery within 1s")
        .expect("open subscription");
    match event {
        FanoutEvent::DirectMessage { message, .. } => {
            assert_eq!(message.content, "cross-instance hi");
        }
        other => panic!("Expected DirectMessage, got {other:?}"),
    }
}
