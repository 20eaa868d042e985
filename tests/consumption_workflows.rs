//! Integration tests for consumer-group consumption.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tandem::prelude::*;
use tandem::tandem_messaging::{
    ConsumerSession, ErrorStream, MessagePosition, MessageStream, NotificationStream,
    RebalanceEvent, TopicPartition,
};
use tandem::{LoopState, MemoryLog, consume};

fn config() -> MessagingConfig {
    MessagingConfig::new(["memory"], ["orders"], "billing").from_beginning()
}

async fn wait_for_marks(log: &MemoryLog, count: usize) {
    while log.marks().len() < count {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

fn noop() -> Arc<dyn MessageHandler> {
    Arc::new(FnHandler(|_msg: Message| async { Ok::<_, MessagingError>(()) }))
}

// =============================================================================
// Delivery and marking
// =============================================================================

#[tokio::test]
async fn test_hundred_messages_over_two_partitions() {
    let log = MemoryLog::new(2);
    for i in 0..100u32 {
        log.publish_to("orders", (i % 2) as i32, None, i.to_be_bytes().to_vec());
    }

    let handled = Arc::new(AtomicUsize::new(0));
    let counter = handled.clone();
    let consumer = ConsumptionLoop::new(
        log.clone(),
        config(),
        Arc::new(FnHandler(move |_msg: Message| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, MessagingError>(())
            }
        })),
    );
    let (stop, signal) = stop_signal();

    let (summary, ()) = tokio::join!(consumer.run(signal), async {
        wait_for_marks(&log, 100).await;
        stop.stop();
    });

    let summary = summary.unwrap();
    assert_eq!(summary.dispatched, 100);
    assert_eq!(summary.completed, 100);
    assert_eq!(handled.load(Ordering::SeqCst), 100);
    assert_eq!(log.committed("billing", "orders", 0), Some(50));
    assert_eq!(log.committed("billing", "orders", 1), Some(50));
    assert_eq!(log.close_count(), 1);
    assert_eq!(*consumer.state().borrow(), LoopState::Stopped);
}

#[tokio::test]
async fn test_immediate_stop_closes_once_and_returns() {
    let log = MemoryLog::new(2);
    for i in 0..1_000u32 {
        log.publish("orders", None, i.to_be_bytes().to_vec());
    }

    let (stop, signal) = stop_signal();
    stop.stop();

    let summary = tokio::time::timeout(
        Duration::from_secs(1),
        consume(log.clone(), config(), FnHandler(|_msg: Message| async {
            Ok::<_, MessagingError>(())
        }), signal),
    )
    .await
    .expect("loop should return promptly")
    .unwrap();

    assert_eq!(summary.dispatched, 0);
    assert_eq!(log.connect_count(), 1);
    assert_eq!(log.close_count(), 1);
    assert_eq!(log.live_sessions(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_completion_order_differs_from_arrival_order() {
    let log = MemoryLog::new(1);
    for i in 0..10u8 {
        log.publish_to("orders", 0, None, vec![i]);
    }

    // Earlier offsets take longer, so they finish last.
    let consumer = ConsumptionLoop::new(
        log.clone(),
        config(),
        Arc::new(FnHandler(|msg: Message| async move {
            let delay = (10 - msg.offset) as u64 * 10;
            tokio::time::sleep(Duration::from_millis(delay)).await;
            Ok::<_, MessagingError>(())
        })),
    );
    let (stop, signal) = stop_signal();

    let (summary, ()) = tokio::join!(consumer.run(signal), async {
        wait_for_marks(&log, 10).await;
        stop.stop();
    });
    summary.unwrap();

    let marked: Vec<i64> = log.marks().iter().map(|p| p.offset).collect();
    assert_eq!(marked, (0..10).rev().collect::<Vec<i64>>());
    assert_eq!(log.committed("billing", "orders", 0), Some(10));
}

#[tokio::test]
async fn test_keyed_messages_dispatch_in_partition_order() {
    let log = MemoryLog::new(3);
    for i in 0..30u32 {
        let key = format!("user-{}", i % 5);
        log.send("orders", &key, &i.to_be_bytes()).await.unwrap();
    }

    let arrivals: Arc<Mutex<HashMap<String, Vec<i64>>>> = Arc::default();
    let record = arrivals.clone();
    let consumer = ConsumptionLoop::new(
        log.clone(),
        config(),
        Arc::new(FnHandler(move |msg: Message| {
            let record = record.clone();
            async move {
                let key = msg.key_str().unwrap_or_default().to_string();
                record.lock().entry(key).or_default().push(msg.offset);
                Ok::<_, MessagingError>(())
            }
        })),
    );
    let (stop, signal) = stop_signal();

    let (summary, ()) = tokio::join!(consumer.run(signal), async {
        wait_for_marks(&log, 30).await;
        stop.stop();
    });
    assert_eq!(summary.unwrap().completed, 30);

    let arrivals = arrivals.lock();
    assert_eq!(arrivals.len(), 5);
    for offsets in arrivals.values() {
        assert_eq!(offsets.len(), 6);
        assert!(offsets.windows(2).all(|pair| pair[0] < pair[1]));
    }
}

// =============================================================================
// Failure handling
// =============================================================================

#[tokio::test]
async fn test_connect_failure_never_closes() {
    let log = MemoryLog::new(1);
    log.fail_next_connect();
    let (_stop, signal) = stop_signal();

    let consumer = ConsumptionLoop::new(log.clone(), config(), noop());
    let result = consumer.run(signal).await;

    assert!(matches!(result, Err(MessagingError::Connection(_))));
    assert_eq!(log.close_count(), 0);
    assert_eq!(*consumer.state().borrow(), LoopState::Stopped);
}

#[tokio::test]
async fn test_errors_and_rebalances_are_not_fatal() {
    let log = MemoryLog::new(1);
    let consumer = ConsumptionLoop::new(log.clone(), config(), noop());
    let mut state = consumer.state();
    let (stop, signal) = stop_signal();

    let (result, ()) = tokio::join!(consumer.run(signal), async {
        state
            .wait_for(|s| *s == LoopState::Running)
            .await
            .unwrap();

        log.inject_error(MessagingError::BrokerError("broker 1 unreachable".into()));
        log.inject_rebalance(RebalanceEvent::Revoked(vec![TopicPartition::new("orders", 0)]));
        log.inject_rebalance(RebalanceEvent::Failed("generation mismatch".into()));
        log.publish("orders", None, b"after".to_vec());

        wait_for_marks(&log, 1).await;
        stop.stop();
    });

    let summary = result.unwrap();
    assert_eq!(summary.completed, 1);
    assert_eq!(log.close_count(), 1);
}

#[tokio::test]
async fn test_handler_panic_is_contained() {
    let log = MemoryLog::new(1);
    log.publish_to("orders", 0, None, b"boom".to_vec());
    log.publish_to("orders", 0, None, b"fine".to_vec());

    let consumer = ConsumptionLoop::new(
        log.clone(),
        config(),
        Arc::new(FnHandler(|msg: Message| async move {
            if msg.value == b"boom" {
                panic!("handler bug");
            }
            Ok::<_, MessagingError>(())
        })),
    );
    let (stop, signal) = stop_signal();

    let (summary, ()) = tokio::join!(consumer.run(signal), async {
        wait_for_marks(&log, 1).await;
        stop.stop();
    });

    let summary = summary.unwrap();
    assert_eq!(summary.dispatched, 2);
    assert_eq!(summary.completed, 1);
    assert_eq!(summary.panicked, 1);
    assert_eq!(log.marks()[0].offset, 1);
}

#[tokio::test]
async fn test_cancelled_run_still_closes_session() {
    let log = MemoryLog::new(1);
    log.publish_to("orders", 0, None, b"slow".to_vec());

    let consumer = ConsumptionLoop::new(
        log.clone(),
        config(),
        Arc::new(FnHandler(|_msg: Message| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, MessagingError>(())
        })),
    );
    let (_stop, signal) = stop_signal();

    let result = tokio::time::timeout(Duration::from_millis(50), consumer.run(signal)).await;
    assert!(result.is_err());
    assert_eq!(*consumer.state().borrow(), LoopState::Stopped);

    tokio::time::timeout(Duration::from_secs(1), async {
        while log.close_count() == 0 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("session should be closed after cancellation");

    assert_eq!(log.close_count(), 1);
    assert_eq!(log.live_sessions(), 0);
    assert!(log.marks().is_empty());
}

// =============================================================================
// Concurrency bound
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_max_in_flight_is_respected() {
    let log = MemoryLog::new(2);
    for i in 0..20u8 {
        log.publish("orders", None, vec![i]);
    }

    let inside = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (inside_h, peak_h) = (inside.clone(), peak.clone());

    let consumer = ConsumptionLoop::new(
        log.clone(),
        config().with_max_in_flight(3),
        Arc::new(FnHandler(move |_msg: Message| {
            let inside = inside_h.clone();
            let peak = peak_h.clone();
            async move {
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, MessagingError>(())
            }
        })),
    );
    let (stop, signal) = stop_signal();

    let (summary, ()) = tokio::join!(consumer.run(signal), async {
        wait_for_marks(&log, 20).await;
        stop.stop();
    });

    assert_eq!(summary.unwrap().completed, 20);
    assert_eq!(peak.load(Ordering::SeqCst), 3);
}

// =============================================================================
// Stream end
// =============================================================================

/// Client whose sessions deliver a fixed batch and then end the stream.
struct FiniteLog {
    batch: Vec<Message>,
    marks: Arc<Mutex<Vec<MessagePosition>>>,
    closes: Arc<AtomicUsize>,
}

struct FiniteSession {
    messages: Mutex<Option<MessageStream>>,
    marks: Arc<Mutex<Vec<MessagePosition>>>,
    closes: Arc<AtomicUsize>,
}

#[async_trait]
impl LogClient for FiniteLog {
    type Session = FiniteSession;

    async fn connect(&self, _config: &MessagingConfig) -> Result<FiniteSession, MessagingError> {
        let stream: MessageStream = Box::pin(tokio_stream::iter(self.batch.clone()));
        Ok(FiniteSession {
            messages: Mutex::new(Some(stream)),
            marks: self.marks.clone(),
            closes: self.closes.clone(),
        })
    }
}

#[async_trait]
impl ConsumerSession for FiniteSession {
    fn messages(&mut self) -> Option<MessageStream> {
        self.messages.get_mut().take()
    }

    fn errors(&mut self) -> Option<ErrorStream> {
        None
    }

    fn notifications(&mut self) -> Option<NotificationStream> {
        None
    }

    async fn mark_processed(&self, position: &MessagePosition) -> Result<(), MessagingError> {
        self.marks.lock().push(position.clone());
        Ok(())
    }

    async fn close(&self) -> Result<(), MessagingError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn test_stream_end_drains_then_reports_closed() {
    let batch: Vec<Message> = (0..5)
        .map(|offset| Message::new("orders", 0, offset, None, b"x".to_vec()))
        .collect();
    let client = FiniteLog {
        batch,
        marks: Arc::default(),
        closes: Arc::default(),
    };
    let marks = client.marks.clone();
    let closes = client.closes.clone();

    let (_stop, signal) = stop_signal();
    let result = consume(
        client,
        config(),
        FnHandler(|_msg: Message| async {
            tokio::task::yield_now().await;
            Ok::<_, MessagingError>(())
        }),
        signal,
    )
    .await;

    assert!(matches!(result, Err(MessagingError::ChannelClosed(_))));
    assert_eq!(marks.lock().len(), 5);
    assert_eq!(closes.load(Ordering::SeqCst), 1);
}
