use super::*;
use broker_runtime::clock::VirtualClock;
use broker_runtime::entity::{EntityOptions, QueueEntity};
use broker_runtime::hooks::NoopHooks;
use broker_runtime::message::Message;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

fn session_queue(clock: SharedClock) -> Arc<QueueEntity> {
    Arc::new(QueueEntity::new(
        "workflows".to_string(),
        EntityOptions::with_sessions(),
        clock,
        Arc::new(NoopHooks),
    ))
}

fn session_id(id: &str) -> SessionId {
    SessionId::new(id.to_string()).unwrap()
}

async fn accept_in_session(entity: &Arc<QueueEntity>, session: &str, body: &'static [u8]) {
    entity
        .accept(Message::new(Bytes::from_static(body)).with_session_id(session_id(session)))
        .await
        .unwrap();
}

fn fast_options() -> SessionProcessorOptions {
    SessionProcessorOptions {
        max_concurrent_sessions: 2,
        max_concurrent_calls_per_session: 1,
        session_ids: Vec::new(),
        session_idle_timeout: chrono::Duration::seconds(30),
        auto_complete: true,
        receive_wait: StdDuration::from_millis(20),
    }
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(StdDuration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn test_processes_sessions_in_parallel() {
    let clock = VirtualClock::shared();
    let entity = session_queue(clock.clone());
    accept_in_session(&entity, "alpha", b"a1").await;
    accept_in_session(&entity, "alpha", b"a2").await;
    accept_in_session(&entity, "beta", b"b1").await;
    accept_in_session(&entity, "beta", b"b2").await;

    let processor = SessionProcessor::new(entity.clone(), fast_options());

    let log: Arc<Mutex<HashMap<SessionId, Vec<Bytes>>>> = Arc::new(Mutex::new(HashMap::new()));
    let sink = log.clone();
    processor
        .set_message_handler(Arc::new(move |session, message| {
            let sink = sink.clone();
            Box::pin(async move {
                sink.lock()
                    .unwrap()
                    .entry(session)
                    .or_default()
                    .push(message.body.clone());
                Ok(())
            })
        }))
        .unwrap();

    let inits = Arc::new(AtomicUsize::new(0));
    let init_counter = inits.clone();
    processor
        .set_session_init_handler(Arc::new(move |_session| {
            let init_counter = init_counter.clone();
            Box::pin(async move {
                init_counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        }))
        .unwrap();

    let closes = Arc::new(AtomicUsize::new(0));
    let close_counter = closes.clone();
    processor
        .set_session_close_handler(Arc::new(move |_session| {
            let close_counter = close_counter.clone();
            Box::pin(async move {
                close_counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        }))
        .unwrap();

    let cancel = CancellationToken::new();
    processor.start(&cancel).await.unwrap();

    {
        let log = log.clone();
        wait_for(move || log.lock().unwrap().values().map(Vec::len).sum::<usize>() == 4).await;
    }
    assert_eq!(inits.load(Ordering::SeqCst), 2);

    // Sessions only close when the processor stops; the clock never moves
    // so the idle timeout cannot fire.
    processor.stop().await.unwrap();
    assert_eq!(closes.load(Ordering::SeqCst), 2);

    let log = log.lock().unwrap();
    assert_eq!(
        log[&session_id("alpha")],
        vec![Bytes::from_static(b"a1"), Bytes::from_static(b"a2")]
    );
    assert_eq!(
        log[&session_id("beta")],
        vec![Bytes::from_static(b"b1"), Bytes::from_static(b"b2")]
    );
    drop(log);
    assert_eq!(entity.total_count().await, 0);
}

#[tokio::test]
async fn test_idle_session_is_released_and_reacquired() {
    let clock = VirtualClock::shared();
    let entity = session_queue(clock.clone());
    accept_in_session(&entity, "alpha", b"first").await;

    let options = SessionProcessorOptions {
        session_idle_timeout: chrono::Duration::seconds(5),
        ..fast_options()
    };
    let processor = SessionProcessor::new(entity.clone(), options);

    let processed = Arc::new(AtomicUsize::new(0));
    let counter = processed.clone();
    processor
        .set_message_handler(Arc::new(move |_session, _message| {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        }))
        .unwrap();

    let closes = Arc::new(AtomicUsize::new(0));
    let close_counter = closes.clone();
    processor
        .set_session_close_handler(Arc::new(move |_session| {
            let close_counter = close_counter.clone();
            Box::pin(async move {
                close_counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        }))
        .unwrap();

    let cancel = CancellationToken::new();
    processor.start(&cancel).await.unwrap();

    wait_for(|| processed.load(Ordering::SeqCst) == 1).await;

    // Fast-forward past the idle timeout; the session task notices on its
    // next loop iteration, closes, and releases the lock.
    clock.advance(chrono::Duration::seconds(10));
    {
        let closes = closes.clone();
        wait_for(move || closes.load(Ordering::SeqCst) == 1).await;
    }

    // New traffic on the same session is picked up by a fresh acceptance.
    accept_in_session(&entity, "alpha", b"second").await;
    wait_for(|| processed.load(Ordering::SeqCst) == 2).await;

    processor.stop().await.unwrap();
    assert_eq!(closes.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_configured_session_ids_bound_the_pool() {
    let clock = VirtualClock::shared();
    let entity = session_queue(clock.clone());
    accept_in_session(&entity, "wanted", b"yes").await;
    accept_in_session(&entity, "other", b"no").await;

    let options = SessionProcessorOptions {
        max_concurrent_sessions: 1,
        session_ids: vec![session_id("wanted")],
        ..fast_options()
    };
    let processor = SessionProcessor::new(entity.clone(), options);

    let seen: Arc<Mutex<Vec<SessionId>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    processor
        .set_message_handler(Arc::new(move |session, _message| {
            let sink = sink.clone();
            Box::pin(async move {
                sink.lock().unwrap().push(session);
                Ok(())
            })
        }))
        .unwrap();

    let cancel = CancellationToken::new();
    processor.start(&cancel).await.unwrap();

    {
        let seen = seen.clone();
        wait_for(move || !seen.lock().unwrap().is_empty()).await;
    }
    tokio::time::sleep(StdDuration::from_millis(100)).await;
    processor.stop().await.unwrap();

    let seen = seen.lock().unwrap();
    assert_eq!(seen.as_slice(), &[session_id("wanted")]);
    drop(seen);
    // The unconfigured session's message is untouched.
    assert_eq!(entity.total_count().await, 1);
}

#[tokio::test]
async fn test_failed_handler_abandons_within_session() {
    let clock = VirtualClock::shared();
    let entity = session_queue(clock.clone());
    accept_in_session(&entity, "alpha", b"flaky").await;

    let processor = SessionProcessor::new(entity.clone(), fast_options());

    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    processor
        .set_message_handler(Arc::new(move |_session, message| {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                if message.delivery_count == 1 {
                    Err(anyhow::anyhow!("transient failure"))
                } else {
                    Ok(())
                }
            })
        }))
        .unwrap();

    let errors = Arc::new(AtomicUsize::new(0));
    let error_counter = errors.clone();
    processor
        .set_error_handler(Arc::new(move |_error| {
            let error_counter = error_counter.clone();
            Box::pin(async move {
                error_counter.fetch_add(1, Ordering::SeqCst);
            })
        }))
        .unwrap();

    let cancel = CancellationToken::new();
    processor.start(&cancel).await.unwrap();

    // The abandon keeps the message in the locked session, so the same
    // session task redelivers it.
    wait_for(|| attempts.load(Ordering::SeqCst) == 2).await;
    wait_for(|| errors.load(Ordering::SeqCst) == 1).await;

    processor.stop().await.unwrap();
    assert_eq!(entity.total_count().await, 0);
}

#[tokio::test]
async fn test_callback_slots_are_single_assignment() {
    let clock = VirtualClock::shared();
    let entity = session_queue(clock.clone());
    let processor = SessionProcessor::new(entity, fast_options());

    let on_message: SessionMessageHandler =
        Arc::new(|_session, _message| Box::pin(async { Ok(()) }));
    processor.set_message_handler(on_message.clone()).unwrap();
    assert!(matches!(
        processor.set_message_handler(on_message),
        Err(BrokerError::NotSupported { .. })
    ));

    let lifecycle: SessionLifecycleHandler = Arc::new(|_session| Box::pin(async { Ok(()) }));
    processor
        .set_session_init_handler(lifecycle.clone())
        .unwrap();
    assert!(matches!(
        processor.set_session_init_handler(lifecycle.clone()),
        Err(BrokerError::NotSupported { .. })
    ));
    processor
        .set_session_close_handler(lifecycle.clone())
        .unwrap();
    assert!(matches!(
        processor.set_session_close_handler(lifecycle),
        Err(BrokerError::NotSupported { .. })
    ));
}

#[tokio::test]
async fn test_stop_racing_start_is_not_overwritten() {
    let clock = VirtualClock::shared();
    let entity = session_queue(clock.clone());
    let processor = SessionProcessor::new(entity, fast_options());

    // A stop can land between spawning the pump and promoting the state;
    // its transition wins and the fresh pump gets cancelled.
    *processor.state.lock().unwrap() = ProcessorState::Stopping;
    let token = CancellationToken::new();
    processor.finish_start(&token);
    assert_eq!(processor.state(), ProcessorState::Stopping);
    assert!(token.is_cancelled());

    *processor.state.lock().unwrap() = ProcessorState::Starting;
    let token = CancellationToken::new();
    processor.finish_start(&token);
    assert_eq!(processor.state(), ProcessorState::Running);
    assert!(!token.is_cancelled());
}

#[tokio::test]
async fn test_start_requires_message_handler() {
    let clock = VirtualClock::shared();
    let entity = session_queue(clock.clone());
    let processor = SessionProcessor::new(entity, fast_options());

    let result = processor.start(&CancellationToken::new()).await;
    assert!(matches!(result, Err(BrokerError::Validation(_))));

    processor.close().await.unwrap();
    assert!(matches!(
        processor.start(&CancellationToken::new()).await,
        Err(BrokerError::Disposed)
    ));
}
