//! End-to-end tests of the session stack against scripted capability fakes.

use std::sync::atomic::{
    AtomicUsize,
    Ordering,
};
use std::sync::Arc;
use std::time::Duration;

use seclink_commons::{
    ConnectId,
    NetworkEvent,
    NetworkFailure,
    ServiceType,
    SystemState,
};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::pending::PendingRequestStore;
use crate::protocol::{
    ProtocolSystem,
    ProtocolSystemFactory,
    DEFAULT_ONE_TIME_PREKEYS,
};
use crate::retry::RetryStrategy;
use crate::storage::SecureStateStorage;
use crate::testkit::{
    build_stack,
    collector,
    establish_channel,
    make_err,
    settle_until,
    test_instance,
    ErrKind,
    InvokeScript,
    NoopHooks,
    TestStack,
};
use crate::transport::RestoreOutcome;

fn drain_events(rx: &mut broadcast::Receiver<NetworkEvent>) -> Vec<NetworkEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn sentinel_pending(stack: &TestStack) -> Arc<AtomicUsize> {
    let counter = Arc::new(AtomicUsize::new(0));
    let replays = counter.clone();
    stack.pending.register(
        9_999,
        Arc::new(move || {
            let replays = replays.clone();
            Box::pin(async move {
                replays.fetch_add(1, Ordering::SeqCst);
            })
        }),
    );
    counter
}

// ---------------------------------------------------------------------------
// Session manager
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn initiate_is_idempotent() {
    let stack = build_stack();
    let connect_id = ConnectId::from_raw(42);
    let session = stack.runtime.session();

    session.initiate(test_instance(), connect_id).await.unwrap();
    let first = session.channel(connect_id).unwrap();

    session.initiate(test_instance(), connect_id).await.unwrap();
    let second = session.channel(connect_id).unwrap();

    assert!(Arc::ptr_eq(&first, &second), "the first registration wins");
    assert_eq!(stack.factory.created.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn clear_then_initiate_builds_an_unrelated_channel() {
    let stack = build_stack();
    let connect_id = establish_channel(&stack, 42).await;
    let session = stack.runtime.session();
    let original = session.channel(connect_id).unwrap();

    session.clear(connect_id).await;
    assert!(session.channel(connect_id).is_none());
    assert!(original.is_disposed());

    session.initiate(test_instance(), connect_id).await.unwrap();
    let fresh = session.channel(connect_id).unwrap();
    assert!(!Arc::ptr_eq(&original, &fresh));
    assert_eq!(stack.factory.created.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn establish_persists_state_and_publishes_events() {
    let stack = build_stack();
    let mut events = stack.runtime.events().subscribe_network();

    let connect_id = establish_channel(&stack, 42).await;

    assert!(stack.runtime.session().is_healthy(connect_id));
    assert!(
        stack
            .storage
            .load(&connect_id.state_key())
            .await
            .unwrap()
            .is_some(),
        "channel state must be persisted"
    );
    let timestamp = stack
        .storage
        .load(&connect_id.timestamp_key())
        .await
        .unwrap()
        .expect("timestamp must be persisted");
    assert_eq!(timestamp.len(), 8);

    let seen = drain_events(&mut events);
    assert_eq!(
        seen,
        vec![
            NetworkEvent::DataCenterConnecting(connect_id),
            NetworkEvent::DataCenterConnected(connect_id),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn restore_declined_returns_false_without_registering() {
    let stack = build_stack();
    let connect_id = establish_channel(&stack, 42).await;
    let state_bytes = stack
        .storage
        .load(&connect_id.state_key())
        .await
        .unwrap()
        .unwrap();
    let state = seclink_commons::ChannelState::from_bytes(&state_bytes).unwrap();

    stack.runtime.session().clear(connect_id).await;
    stack.transport.script_restore(Ok(RestoreOutcome::Declined {
        status: "SessionNotFound".to_string(),
    }));

    let restored = stack
        .runtime
        .session()
        .restore(state, &test_instance())
        .await
        .unwrap();
    assert!(!restored);
    assert!(stack.runtime.session().channel(connect_id).is_none());
}

#[tokio::test(start_paused = true)]
async fn try_restore_without_persisted_state_is_false() {
    let stack = build_stack();
    let restored = stack
        .runtime
        .session()
        .try_restore(ConnectId::from_raw(7))
        .await
        .unwrap();
    assert!(!restored);
    assert_eq!(stack.transport.restores.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn concurrent_try_restore_is_single_flight() {
    let stack = Arc::new(build_stack());
    let connect_id = establish_channel(&stack, 42).await;

    let mut handles = Vec::new();
    for _ in 0..4 {
        let stack = stack.clone();
        handles.push(tokio::spawn(async move {
            stack.runtime.session().try_restore(connect_id).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(
        stack.transport.max_concurrent_restores.load(Ordering::SeqCst),
        1,
        "restore attempts for one channel must never overlap"
    );
}

#[tokio::test(start_paused = true)]
async fn persisted_state_restores_an_equivalent_ratchet() {
    let factory = crate::testkit::FakeProtocolFactory::new();
    let hooks: Arc<dyn crate::protocol::ProtocolEventHandler> = Arc::new(NoopHooks);
    let connect_id = ConnectId::from_raw(42);

    let mut original = factory
        .create(connect_id, DEFAULT_ONE_TIME_PREKEYS, hooks.clone())
        .unwrap();
    original.produce_outbound(b"first").unwrap();

    let state = original.to_state().unwrap();
    let mut restored = factory.from_state(&state, hooks).unwrap();

    let next_original = original.produce_outbound(b"second").unwrap();
    let next_restored = restored.produce_outbound(b"second").unwrap();
    assert_eq!(
        next_original, next_restored,
        "a restored ratchet must produce the same next ciphertext"
    );
}

#[tokio::test(start_paused = true)]
async fn disposed_channel_rejects_cryptographic_calls() {
    let stack = build_stack();
    let connect_id = establish_channel(&stack, 42).await;
    let channel = stack.runtime.session().channel(connect_id).unwrap();

    channel.dispose().await;
    channel.dispose().await;

    let result = channel.produce_outbound(b"payload").await;
    assert!(matches!(result, Err(NetworkFailure::ObjectDisposed(_))));
}

#[tokio::test(start_paused = true)]
async fn shutdown_disposes_every_channel() {
    let stack = build_stack();
    let first = establish_channel(&stack, 1).await;
    let second = establish_channel(&stack, 2).await;

    stack.runtime.shutdown().await;

    assert!(stack.runtime.session().channel(first).is_none());
    assert!(stack.runtime.session().channel(second).is_none());
}

// ---------------------------------------------------------------------------
// Request pipeline
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn happy_path_unary_round_trip() {
    let stack = build_stack();
    let connect_id = establish_channel(&stack, 42).await;
    let mut events = stack.runtime.events().subscribe_network();

    stack
        .transport
        .script_invoke(InvokeScript::Unary(b"resp:+14155551212-verified".to_vec()));
    let (on_completed, completions) = collector();

    stack
        .runtime
        .pipeline()
        .execute_unary(
            connect_id,
            ServiceType::ValidatePhoneNumber,
            b"+14155551212".to_vec(),
            on_completed,
            false,
            false,
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(stack.transport.invokes.load(Ordering::SeqCst), 1);
    assert_eq!(
        *completions.lock().unwrap(),
        vec![b"+14155551212-verified".to_vec()]
    );
    assert!(
        drain_events(&mut events).is_empty(),
        "a clean round trip publishes nothing"
    );
}

#[tokio::test(start_paused = true)]
async fn duplicate_requests_are_suppressed_while_in_flight() {
    let stack = Arc::new(build_stack());
    let connect_id = establish_channel(&stack, 42).await;

    stack.transport.script_invoke(InvokeScript::UnaryDelayed(
        Duration::from_millis(50),
        b"resp:first".to_vec(),
    ));
    stack
        .transport
        .script_invoke(InvokeScript::Unary(b"resp:third".to_vec()));

    let (on_completed, completions) = collector();
    let first = {
        let stack = stack.clone();
        let on_completed = on_completed.clone();
        tokio::spawn(async move {
            stack
                .runtime
                .pipeline()
                .execute_unary(
                    connect_id,
                    ServiceType::VerifyOtp,
                    b"000000".to_vec(),
                    on_completed,
                    false,
                    true,
                    CancellationToken::new(),
                )
                .await
        })
    };
    tokio::task::yield_now().await;

    let second = stack
        .runtime
        .pipeline()
        .execute_unary(
            connect_id,
            ServiceType::VerifyOtp,
            b"000000".to_vec(),
            on_completed.clone(),
            false,
            true,
            CancellationToken::new(),
        )
        .await;
    assert!(
        matches!(second, Err(NetworkFailure::InvalidRequestType(msg)) if msg == "duplicate"),
        "identical concurrent request must be rejected"
    );

    first.await.unwrap().unwrap();

    // The in-flight entry is gone, so an identical request now passes.
    stack
        .runtime
        .pipeline()
        .execute_unary(
            connect_id,
            ServiceType::VerifyOtp,
            b"000000".to_vec(),
            on_completed,
            false,
            true,
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(
        *completions.lock().unwrap(),
        vec![b"first".to_vec(), b"third".to_vec()]
    );
}

#[tokio::test(start_paused = true)]
async fn rapid_repeats_are_debounced() {
    let stack = build_stack();
    let connect_id = establish_channel(&stack, 42).await;
    let (on_completed, _) = collector();

    stack
        .runtime
        .pipeline()
        .execute_unary(
            connect_id,
            ServiceType::ValidatePhoneNumber,
            b"+14155551212".to_vec(),
            on_completed.clone(),
            false,
            false,
            CancellationToken::new(),
        )
        .await
        .unwrap();

    let repeat = stack
        .runtime
        .pipeline()
        .execute_unary(
            connect_id,
            ServiceType::ValidatePhoneNumber,
            b"+14155551212".to_vec(),
            on_completed,
            false,
            false,
            CancellationToken::new(),
        )
        .await;
    assert!(
        matches!(repeat, Err(NetworkFailure::InvalidRequestType(msg)) if msg == "too frequent")
    );
}

#[tokio::test(start_paused = true)]
async fn reserved_flows_fail_explicitly() {
    let stack = build_stack();
    let connect_id = establish_channel(&stack, 42).await;

    let send = stack
        .runtime
        .pipeline()
        .execute_send_stream(connect_id, ServiceType::VerifyOtp)
        .await;
    assert!(
        matches!(send, Err(NetworkFailure::InvalidRequestType(msg)) if msg == "not implemented")
    );

    let bidi = stack
        .runtime
        .pipeline()
        .execute_bidi_stream(connect_id, ServiceType::VerifyOtp)
        .await;
    assert!(
        matches!(bidi, Err(NetworkFailure::InvalidRequestType(msg)) if msg == "not implemented")
    );
}

#[tokio::test(start_paused = true)]
async fn inbound_stream_skips_failed_items() {
    let stack = build_stack();
    let connect_id = establish_channel(&stack, 42).await;

    stack.transport.script_invoke(InvokeScript::Stream(vec![
        Ok(b"resp:item-1".to_vec()),
        Err(ErrKind::Timeout),
        Ok(b"garbage-frame".to_vec()),
        Ok(b"resp:item-2".to_vec()),
    ]));
    let (on_item, items) = collector();

    stack
        .runtime
        .pipeline()
        .execute_receive_stream(
            connect_id,
            ServiceType::InitiateVerification,
            b"subscribe".to_vec(),
            on_item,
            false,
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(
        *items.lock().unwrap(),
        vec![b"item-1".to_vec(), b"item-2".to_vec()],
        "transport and decryption failures are skipped, the stream continues"
    );
}

#[tokio::test(start_paused = true)]
async fn server_shutdown_enters_outage_and_replays_from_plaintext() {
    let stack = Arc::new(build_stack());
    let connect_id = establish_channel(&stack, 42).await;
    let mut events = stack.runtime.events().subscribe_network();

    // First attempt dies with a shutdown-class failure; the recovery loop
    // fails twice before the peer resumes the session; the replay then gets
    // a clean response.
    stack
        .transport
        .script_invoke(InvokeScript::ResponseErr(ErrKind::Shutdown));
    stack
        .transport
        .script_invoke(InvokeScript::Unary(b"resp:hello-response".to_vec()));
    stack.transport.script_restore(Err(ErrKind::NotResponding));
    stack.transport.script_restore(Err(ErrKind::NotResponding));

    let (on_completed, completions) = collector();
    stack
        .runtime
        .pipeline()
        .execute_unary(
            connect_id,
            ServiceType::VerifyOtp,
            b"hello".to_vec(),
            on_completed,
            false,
            true,
            CancellationToken::new(),
        )
        .await
        .expect("waiting caller resolves once recovery completes");

    settle_until(|| completions.lock().unwrap().len() == 1).await;
    assert_eq!(*completions.lock().unwrap(), vec![b"hello-response".to_vec()]);

    settle_until(|| !stack.runtime.recovery().outage().is_active()).await;
    assert_eq!(stack.runtime.events().system_state(), SystemState::Running);
    assert_eq!(stack.pending.pending_count(), 0);
    assert!(stack.transport.restores.load(Ordering::SeqCst) >= 3);

    let seen = drain_events(&mut events);
    assert!(seen.contains(&NetworkEvent::ServerShutdown(connect_id)));
    assert!(seen.contains(&NetworkEvent::ConnectionRecovering(connect_id)));
    assert_eq!(seen.last(), Some(&NetworkEvent::ConnectionRestored(connect_id)));

    // The replay rebuilt against the advanced ratchet: its request id moved
    // past the original.
    let req_ids = stack.transport.seen_req_ids();
    assert_eq!(req_ids.len(), 2);
    assert_ne!(req_ids[0], req_ids[1]);
}

#[tokio::test(start_paused = true)]
async fn crypto_desync_recovery_is_throttled_per_connection() {
    let stack = build_stack();
    let connect_id = establish_channel(&stack, 42).await;
    let (on_completed, _) = collector();

    stack
        .transport
        .script_invoke(InvokeScript::ResponseErr(ErrKind::Desync));
    let first = stack
        .runtime
        .pipeline()
        .execute_unary(
            connect_id,
            ServiceType::VerifyOtp,
            b"000000".to_vec(),
            on_completed.clone(),
            false,
            false,
            CancellationToken::new(),
        )
        .await;
    assert!(matches!(first, Err(NetworkFailure::CryptoDesync(_))));

    settle_until(|| stack.transport.restores.load(Ordering::SeqCst) == 1).await;
    assert_eq!(stack.transport.restores.load(Ordering::SeqCst), 1);

    // Second desync within the 10 s window: no extra recovery is spawned.
    tokio::time::advance(Duration::from_millis(600)).await;
    stack
        .transport
        .script_invoke(InvokeScript::ResponseErr(ErrKind::Desync));
    let second = stack
        .runtime
        .pipeline()
        .execute_unary(
            connect_id,
            ServiceType::VerifyOtp,
            b"000000".to_vec(),
            on_completed,
            false,
            false,
            CancellationToken::new(),
        )
        .await;
    assert!(matches!(second, Err(NetworkFailure::CryptoDesync(_))));

    settle_until(|| false).await;
    assert_eq!(
        stack.transport.restores.load(Ordering::SeqCst),
        1,
        "recovery within the throttle window must be suppressed"
    );
}

#[tokio::test(start_paused = true)]
async fn chain_rotation_mismatch_resyncs_the_protocol() {
    let stack = build_stack();
    let connect_id = establish_channel(&stack, 42).await;
    let replays = sentinel_pending(&stack);
    let (on_completed, _) = collector();

    stack
        .transport
        .script_invoke(InvokeScript::ResponseErr(ErrKind::Rotation));
    let result = stack
        .runtime
        .pipeline()
        .execute_unary(
            connect_id,
            ServiceType::VerifyOtp,
            b"000000".to_vec(),
            on_completed,
            false,
            false,
            CancellationToken::new(),
        )
        .await;
    assert!(matches!(
        result,
        Err(NetworkFailure::ChainRotationMismatch(_))
    ));

    settle_until(|| replays.load(Ordering::SeqCst) == 1).await;
    assert_eq!(
        stack.factory.created.load(Ordering::SeqCst),
        2,
        "resync must initiate a brand-new protocol instance"
    );
    assert_eq!(stack.transport.establishes.load(Ordering::SeqCst), 2);
    assert!(
        stack
            .storage
            .load(&connect_id.state_key())
            .await
            .unwrap()
            .is_some(),
        "the fresh establishment re-persists state"
    );
    assert!(stack.runtime.session().is_healthy(connect_id));
}

#[tokio::test(start_paused = true)]
async fn force_fresh_clears_exhaustion_and_recovers() {
    let stack = build_stack();
    let connect_id = establish_channel(&stack, 42).await;
    let mut events = stack.runtime.events().subscribe_network();

    // Exhaust the retry strategy, then enter an outage: the recovery loop
    // must stop with RetriesExhausted and leave the outage active.
    let failing: crate::retry::RetryOperation = Arc::new(|| {
        Box::pin(async { Err(make_err(ErrKind::Timeout)) })
    });
    let _ = stack
        .retry
        .execute(failing, "VerifyOtp", connect_id, 1, CancellationToken::new())
        .await;
    assert!(stack.retry.has_exhausted_operations());

    stack
        .runtime
        .recovery()
        .enter_outage("server draining", connect_id);
    settle_until(|| {
        drain_events(&mut events).contains(&NetworkEvent::RetriesExhausted(connect_id))
    })
    .await;
    assert!(stack.runtime.recovery().outage().is_active());

    // Manual reset: immediate restore succeeds, outage clears, pending
    // drains.
    let replays = sentinel_pending(&stack);
    stack
        .runtime
        .recovery()
        .force_fresh(connect_id)
        .await
        .unwrap();

    assert!(!stack.retry.has_exhausted_operations());
    assert!(!stack.runtime.recovery().outage().is_active());
    assert_eq!(replays.load(Ordering::SeqCst), 1);
    let seen = drain_events(&mut events);
    assert!(seen.contains(&NetworkEvent::ConnectionRestored(connect_id)));
    assert!(stack.runtime.session().is_healthy(connect_id));
}

#[tokio::test(start_paused = true)]
async fn outage_gates_non_waiting_user_traffic() {
    let stack = build_stack();
    let connect_id = establish_channel(&stack, 42).await;
    stack
        .runtime
        .recovery()
        .enter_outage("server draining", connect_id);

    let (on_completed, _) = collector();
    let result = stack
        .runtime
        .pipeline()
        .execute_unary(
            connect_id,
            ServiceType::ValidatePhoneNumber,
            b"+14155551212".to_vec(),
            on_completed,
            false,
            false,
            CancellationToken::new(),
        )
        .await;
    assert!(
        matches!(result, Err(NetworkFailure::DataCenterNotResponding(msg)) if msg == "recovering")
    );
}

#[tokio::test(start_paused = true)]
async fn entering_outage_cancels_in_flight_requests() {
    let stack = Arc::new(build_stack());
    let connect_id = establish_channel(&stack, 42).await;

    stack.transport.script_invoke(InvokeScript::UnaryDelayed(
        Duration::from_secs(60),
        b"resp:late".to_vec(),
    ));
    let (on_completed, completions) = collector();
    let in_flight = {
        let stack = stack.clone();
        tokio::spawn(async move {
            stack
                .runtime
                .pipeline()
                .execute_unary(
                    connect_id,
                    ServiceType::VerifyOtp,
                    b"000000".to_vec(),
                    on_completed,
                    false,
                    false,
                    CancellationToken::new(),
                )
                .await
        })
    };
    tokio::task::yield_now().await;

    stack
        .runtime
        .recovery()
        .enter_outage("server draining", connect_id);

    let result = in_flight.await.unwrap();
    assert!(
        matches!(result, Err(NetworkFailure::DataCenterNotResponding(msg)) if msg.contains("cancelled")),
        "in-flight user requests must be cancelled on outage entry"
    );
    assert!(completions.lock().unwrap().is_empty());
}
