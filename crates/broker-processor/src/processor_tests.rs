use super::*;
use broker_runtime::clock::VirtualClock;
use broker_runtime::entity::{EntityOptions, QueueEntity};
use broker_runtime::hooks::NoopHooks;
use broker_runtime::message::{Message, ReceiveMode};
use broker_runtime::receiver::QueueReceiver;
use bytes::Bytes;
use std::sync::atomic::{AtomicUsize, Ordering};

fn queue() -> Arc<QueueEntity> {
    Arc::new(QueueEntity::new(
        "orders".to_string(),
        EntityOptions::default(),
        VirtualClock::shared(),
        Arc::new(NoopHooks),
    ))
}

fn processor(entity: &Arc<QueueEntity>, options: ProcessorOptions) -> MessageProcessor {
    let receiver = Arc::new(QueueReceiver::new(entity.clone(), ReceiveMode::PeekLock));
    MessageProcessor::new(receiver, options)
}

fn fast_options(max_concurrent_calls: usize) -> ProcessorOptions {
    ProcessorOptions {
        max_concurrent_calls,
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
async fn test_processes_and_completes_messages() {
    let entity = queue();
    for i in 0..4u8 {
        entity
            .accept(Message::new(Bytes::from(vec![i])))
            .await
            .unwrap();
    }

    let processor = processor(&entity, fast_options(2));
    let processed = Arc::new(AtomicUsize::new(0));
    let counter = processed.clone();
    processor
        .set_message_handler(Arc::new(move |_message| {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        }))
        .unwrap();

    let cancel = CancellationToken::new();
    processor.start(&cancel).await.unwrap();
    assert!(processor.is_processing());

    wait_for(|| processed.load(Ordering::SeqCst) == 4).await;
    // Auto-complete removes each message from the store.
    wait_for_drained(&entity).await;

    processor.stop().await.unwrap();
    assert!(!processor.is_processing());
    assert_eq!(processor.state(), ProcessorState::Stopped);
}

async fn wait_for_drained(entity: &Arc<QueueEntity>) {
    for _ in 0..400 {
        if entity.total_count().await == 0 {
            return;
        }
        tokio::time::sleep(StdDuration::from_millis(5)).await;
    }
    panic!("entity never drained");
}

#[tokio::test]
async fn test_failed_handler_abandons_and_redelivers() {
    let entity = queue();
    entity
        .accept(Message::new(Bytes::from_static(b"flaky")))
        .await
        .unwrap();

    let processor = processor(&entity, fast_options(1));
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    processor
        .set_message_handler(Arc::new(move |message| {
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

    // First delivery fails and is abandoned; the redelivery succeeds.
    wait_for(|| attempts.load(Ordering::SeqCst) == 2).await;
    wait_for_drained(&entity).await;
    assert_eq!(errors.load(Ordering::SeqCst), 1);

    processor.stop().await.unwrap();
}

#[tokio::test]
async fn test_handler_slots_are_single_assignment() {
    let entity = queue();
    let processor = processor(&entity, fast_options(1));

    let noop: MessageHandler = Arc::new(|_message| Box::pin(async { Ok(()) }));
    processor.set_message_handler(noop.clone()).unwrap();
    let result = processor.set_message_handler(noop);
    assert!(matches!(result, Err(BrokerError::NotSupported { .. })));

    let errors: ErrorHandler = Arc::new(|_error| Box::pin(async {}));
    processor.set_error_handler(errors.clone()).unwrap();
    let result = processor.set_error_handler(errors);
    assert!(matches!(result, Err(BrokerError::NotSupported { .. })));
}

#[tokio::test]
async fn test_start_requires_message_handler() {
    let entity = queue();
    let processor = processor(&entity, fast_options(1));

    let result = processor.start(&CancellationToken::new()).await;
    assert!(matches!(result, Err(BrokerError::Validation(_))));
    assert_eq!(processor.state(), ProcessorState::Stopped);
}

#[tokio::test]
async fn test_start_twice_fails_and_stop_is_idempotent() {
    let entity = queue();
    let processor = processor(&entity, fast_options(1));
    processor
        .set_message_handler(Arc::new(|_message| Box::pin(async { Ok(()) })))
        .unwrap();

    let cancel = CancellationToken::new();
    processor.start(&cancel).await.unwrap();
    let result = processor.start(&cancel).await;
    assert!(matches!(result, Err(BrokerError::AlreadyRunning)));

    processor.stop().await.unwrap();
    // Stopping again is a no-op.
    processor.stop().await.unwrap();
    assert_eq!(processor.state(), ProcessorState::Stopped);
}

#[tokio::test]
async fn test_stop_racing_start_is_not_overwritten() {
    let entity = queue();
    let processor = processor(&entity, fast_options(1));

    // A stop can land between spawning the pump and promoting the state;
    // its transition wins and the fresh pump gets cancelled.
    *processor.state.lock().unwrap() = ProcessorState::Stopping;
    let token = CancellationToken::new();
    processor.finish_start(&token);
    assert_eq!(processor.state(), ProcessorState::Stopping);
    assert!(token.is_cancelled());

    // The undisturbed path still promotes.
    *processor.state.lock().unwrap() = ProcessorState::Starting;
    let token = CancellationToken::new();
    processor.finish_start(&token);
    assert_eq!(processor.state(), ProcessorState::Running);
    assert!(!token.is_cancelled());
}

#[tokio::test]
async fn test_close_disposes_processor() {
    let entity = queue();
    let processor = processor(&entity, fast_options(1));
    processor
        .set_message_handler(Arc::new(|_message| Box::pin(async { Ok(()) })))
        .unwrap();

    let cancel = CancellationToken::new();
    processor.start(&cancel).await.unwrap();
    processor.close().await.unwrap();
    assert_eq!(processor.state(), ProcessorState::Disposed);

    let result = processor.start(&cancel).await;
    assert!(matches!(result, Err(BrokerError::Disposed)));
}

#[tokio::test]
async fn test_stop_waits_for_inflight_handler() {
    let entity = queue();
    entity
        .accept(Message::new(Bytes::from_static(b"slow")))
        .await
        .unwrap();

    let processor = Arc::new(processor(&entity, fast_options(1)));
    let entered = Arc::new(AtomicUsize::new(0));
    let completed = Arc::new(AtomicUsize::new(0));
    let gate = Arc::new(tokio::sync::Semaphore::new(0));

    let entered_counter = entered.clone();
    let completed_counter = completed.clone();
    let handler_gate = gate.clone();
    processor
        .set_message_handler(Arc::new(move |_message| {
            let entered_counter = entered_counter.clone();
            let completed_counter = completed_counter.clone();
            let handler_gate = handler_gate.clone();
            Box::pin(async move {
                entered_counter.fetch_add(1, Ordering::SeqCst);
                let _permit = handler_gate.acquire().await;
                completed_counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        }))
        .unwrap();

    let cancel = CancellationToken::new();
    processor.start(&cancel).await.unwrap();
    wait_for(|| entered.load(Ordering::SeqCst) == 1).await;

    let stopper = processor.clone();
    let stop_task = tokio::spawn(async move { stopper.stop().await });

    // The handler is still blocked on the gate, so stop must not finish.
    tokio::time::sleep(StdDuration::from_millis(50)).await;
    assert!(!stop_task.is_finished());
    assert_eq!(completed.load(Ordering::SeqCst), 0);

    gate.add_permits(1);
    stop_task.await.unwrap().unwrap();
    assert_eq!(completed.load(Ordering::SeqCst), 1);
    assert!(!processor.is_processing());
    // The callback ran to completion and the message was settled.
    assert_eq!(entity.total_count().await, 0);
}

#[tokio::test]
async fn test_external_cancellation_halts_pump() {
    let entity = queue();
    let processor = processor(&entity, fast_options(1));
    let processed = Arc::new(AtomicUsize::new(0));
    let counter = processed.clone();
    processor
        .set_message_handler(Arc::new(move |_message| {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        }))
        .unwrap();

    let cancel = CancellationToken::new();
    processor.start(&cancel).await.unwrap();
    cancel.cancel();
    tokio::time::sleep(StdDuration::from_millis(50)).await;

    // Messages accepted after cancellation are never dispatched.
    entity
        .accept(Message::new(Bytes::from_static(b"late")))
        .await
        .unwrap();
    tokio::time::sleep(StdDuration::from_millis(50)).await;
    assert_eq!(processed.load(Ordering::SeqCst), 0);

    processor.stop().await.unwrap();
    assert_eq!(processor.state(), ProcessorState::Stopped);
}
