//! Consumer-group consumption loop.
//!
//! One session per run. Every delivered message is handed to the handler on
//! its own task; once the handler returns (or fails, or times out) the
//! message's offset is marked processed. Marks can therefore happen out of
//! arrival order, and the group's committed offset only moves forward.
//!
//! Errors and rebalance notices from the client are logged and never end
//! the loop. The loop ends when the stop signal fires or the message stream
//! closes; in-flight handlers then get `drain_timeout` to finish and the
//! session is closed exactly once.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, watch};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{Instrument, Span, debug, error, info, info_span, warn};

use crate::config::MessagingConfig;
use crate::error::MessagingError;
use crate::message::Message;
use crate::stop::StopSignal;
use crate::traits::{ConsumerSession, ErrorStream, LogClient, MessageHandler, MessageStream, NotificationStream};

/// Lifecycle of a [`ConsumptionLoop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// Validating settings and joining the group
    Starting,
    /// Dispatching messages
    Running,
    /// Stop requested; waiting for in-flight handlers
    Draining,
    /// Not running (initial and final state)
    Stopped,
}

/// Counters reported when a run ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Messages handed to the handler
    pub dispatched: u64,
    /// Handler tasks that finished and marked their offset
    pub completed: u64,
    /// Handler tasks cancelled because the drain deadline passed
    pub aborted: u64,
    /// Handler tasks that panicked; their offsets were not marked
    pub panicked: u64,
}

impl RunSummary {
    fn record(&mut self, joined: Result<(), JoinError>) {
        match joined {
            Ok(()) => self.completed += 1,
            Err(e) if e.is_panic() => {
                error!(error = %e, "Handler task panicked");
                self.panicked += 1;
            }
            Err(_) => self.aborted += 1,
        }
    }
}

/// Drives one consumer-group session from connect to close.
pub struct ConsumptionLoop<C: LogClient> {
    client: C,
    config: MessagingConfig,
    handler: Arc<dyn MessageHandler>,
    span: Span,
    state: watch::Sender<LoopState>,
}

/// Closes the session when `run` is dropped before closing it itself.
struct SessionGuard<'a, S: ConsumerSession> {
    session: Arc<S>,
    state: &'a watch::Sender<LoopState>,
    closing: bool,
}

impl<'a, S: ConsumerSession> SessionGuard<'a, S> {
    fn new(session: S, state: &'a watch::Sender<LoopState>) -> Self {
        Self {
            session: Arc::new(session),
            state,
            closing: false,
        }
    }

    async fn close(mut self) -> Result<(), MessagingError> {
        self.closing = true;
        let closed = self.session.close().await;
        self.state.send_replace(LoopState::Stopped);
        closed
    }
}

impl<S: ConsumerSession> Drop for SessionGuard<'_, S> {
    fn drop(&mut self) {
        self.state.send_replace(LoopState::Stopped);
        if self.closing {
            return;
        }

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("Consumer dropped outside a runtime; session not closed");
            return;
        };
        let session = Arc::clone(&self.session);
        warn!("Consumer cancelled; closing session in the background");
        handle.spawn(
            async move {
                if let Err(e) = session.close().await {
                    warn!(error = %e, "Close after cancellation failed");
                }
            }
            .instrument(Span::current()),
        );
    }
}

/// Observer tasks, aborted together when dropped.
struct Observers(Vec<JoinHandle<()>>);

impl Drop for Observers {
    fn drop(&mut self) {
        for observer in &self.0 {
            observer.abort();
        }
    }
}

struct Streams {
    messages: MessageStream,
    errors: Option<ErrorStream>,
    notifications: Option<NotificationStream>,
}

impl<C: LogClient> ConsumptionLoop<C> {
    pub fn new(client: C, config: MessagingConfig, handler: Arc<dyn MessageHandler>) -> Self {
        let span = info_span!("consumer", group_id = %config.group_id);
        let (state, _) = watch::channel(LoopState::Stopped);
        Self {
            client,
            config,
            handler,
            span,
            state,
        }
    }

    /// Run under `span` instead of the default `consumer` span.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn config(&self) -> &MessagingConfig {
        &self.config
    }

    /// Watch the loop's lifecycle.
    pub fn state(&self) -> watch::Receiver<LoopState> {
        self.state.subscribe()
    }

    /// Consume until `stop` fires or the message stream ends.
    ///
    /// Returns the connect error if the session could not be created, in
    /// which case nothing is closed. A message stream that ends without a
    /// stop request yields [`MessagingError::ChannelClosed`] after draining.
    pub async fn run(&self, mut stop: StopSignal) -> Result<RunSummary, MessagingError> {
        let span = self.span.clone();
        async move {
            self.state.send_replace(LoopState::Starting);

            if let Err(e) = self.config.validate() {
                error!(error = %e, "Invalid consumer settings");
                self.state.send_replace(LoopState::Stopped);
                return Err(e);
            }
            self.config.describe("consumer");

            let mut session = match self.client.connect(&self.config).await {
                Ok(session) => session,
                Err(e) => {
                    error!(
                        endpoints = ?self.config.endpoints,
                        topics = ?self.config.topics,
                        group_id = %self.config.group_id,
                        error = %e,
                        "Failed to create consumer"
                    );
                    self.state.send_replace(LoopState::Stopped);
                    return Err(e);
                }
            };

            let streams = match session.messages() {
                Some(messages) => Ok(Streams {
                    messages,
                    errors: session.errors(),
                    notifications: session.notifications(),
                }),
                None => Err(MessagingError::Subscribe(
                    "session message stream already taken".to_string(),
                )),
            };

            let guard = SessionGuard::new(session, &self.state);
            let outcome = match streams {
                Ok(streams) => self.drive(&guard.session, streams, &mut stop).await,
                Err(e) => Err(e),
            };

            let closed = guard.close().await;

            match (outcome, closed) {
                (Ok(summary), Ok(())) => {
                    info!(
                        dispatched = summary.dispatched,
                        completed = summary.completed,
                        aborted = summary.aborted,
                        panicked = summary.panicked,
                        "Consumer stopped"
                    );
                    Ok(summary)
                }
                (Ok(_), Err(e)) => {
                    error!(error = %e, "Failed to close consumer session");
                    Err(e)
                }
                (Err(e), closed) => {
                    if let Err(close_err) = closed {
                        warn!(error = %close_err, "Failed to close consumer session");
                    }
                    error!(error = %e, "Consumer ended");
                    Err(e)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn drive(
        &self,
        session: &Arc<C::Session>,
        streams: Streams,
        stop: &mut StopSignal,
    ) -> Result<RunSummary, MessagingError> {
        let observers = self.spawn_observers(streams.errors, streams.notifications);
        let limiter = self.config.max_in_flight.map(|n| Arc::new(Semaphore::new(n)));
        let mut messages = streams.messages;
        let mut tasks = JoinSet::new();
        let mut summary = RunSummary::default();

        self.state.send_replace(LoopState::Running);
        info!(topics = ?self.config.topics, "Consumer running");

        let outcome = loop {
            tokio::select! {
                biased;
                _ = stop.stopped() => break Ok(()),
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => summary.record(joined),
                next = messages.next() => {
                    let Some(message) = next else {
                        break Err(MessagingError::ChannelClosed(
                            "message stream ended".to_string(),
                        ));
                    };

                    let permit = match &limiter {
                        Some(limiter) => tokio::select! {
                            biased;
                            _ = stop.stopped() => break Ok(()),
                            permit = limiter.clone().acquire_owned() => match permit {
                                Ok(permit) => Some(permit),
                                Err(_) => break Err(MessagingError::ChannelClosed(
                                    "dispatch limiter closed".to_string(),
                                )),
                            },
                        },
                        None => None,
                    };

                    summary.dispatched += 1;
                    self.dispatch(&mut tasks, session, message, permit);
                }
            }
        };

        self.state.send_replace(LoopState::Draining);
        drop(observers);
        self.drain(&mut tasks, &mut summary).await;

        outcome.map(|()| summary)
    }

    fn dispatch(
        &self,
        tasks: &mut JoinSet<()>,
        session: &Arc<C::Session>,
        message: Message,
        permit: Option<OwnedSemaphorePermit>,
    ) {
        let handler = Arc::clone(&self.handler);
        let session = Arc::clone(session);
        let timeout = self.config.handler_timeout();
        let position = message.position();
        let span = info_span!(
            parent: &self.span,
            "handle",
            topic = %position.topic,
            partition = position.partition,
            offset = position.offset
        );

        tasks.spawn(
            async move {
                let _permit = permit;
                invoke(handler.as_ref(), message, timeout).await;
                if let Err(e) = session.mark_processed(&position).await {
                    error!(error = %e, "Failed to mark offset");
                }
            }
            .instrument(span),
        );
    }

    async fn drain(&self, tasks: &mut JoinSet<()>, summary: &mut RunSummary) {
        if tasks.is_empty() {
            return;
        }

        let deadline = self.config.drain_timeout();
        debug!(in_flight = tasks.len(), ?deadline, "Draining handlers");

        let drained = tokio::time::timeout(deadline, async {
            while let Some(joined) = tasks.join_next().await {
                summary.record(joined);
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                in_flight = tasks.len(),
                "Drain deadline passed; aborting remaining handlers"
            );
            tasks.abort_all();
            while let Some(joined) = tasks.join_next().await {
                summary.record(joined);
            }
        }
    }

    fn spawn_observers(
        &self,
        errors: Option<ErrorStream>,
        notifications: Option<NotificationStream>,
    ) -> Observers {
        let mut observers = Vec::with_capacity(2);

        if let Some(mut errors) = errors {
            let endpoints = self.config.endpoints.clone();
            let topics = self.config.topics.clone();
            let group_id = self.config.group_id.clone();
            observers.push(tokio::spawn(
                async move {
                    while let Some(e) = errors.next().await {
                        error!(
                            endpoints = ?endpoints,
                            topics = ?topics,
                            group_id = %group_id,
                            error = %e,
                            "Consume error"
                        );
                    }
                }
                .instrument(self.span.clone()),
            ));
        }

        if let Some(mut notifications) = notifications {
            observers.push(tokio::spawn(
                async move {
                    while let Some(event) = notifications.next().await {
                        info!(event = %event, "Consumer group rebalanced");
                    }
                }
                .instrument(self.span.clone()),
            ));
        }

        Observers(observers)
    }
}

async fn invoke(handler: &dyn MessageHandler, message: Message, timeout: Option<Duration>) {
    let result = match timeout {
        Some(limit) => match tokio::time::timeout(limit, handler.handle(message)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(timeout_ms = limit.as_millis() as u64, "Handler timed out");
                return;
            }
        },
        None => handler.handle(message).await,
    };

    if let Err(e) = result {
        warn!(error = %e, "Handler failed");
    }
}

/// Build a [`ConsumptionLoop`] and run it to completion.
pub async fn consume<C, H>(
    client: C,
    config: MessagingConfig,
    handler: H,
    stop: StopSignal,
) -> Result<RunSummary, MessagingError>
where
    C: LogClient,
    H: MessageHandler,
{
    ConsumptionLoop::new(client, config, Arc::new(handler))
        .run(stop)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryLog;
    use crate::stop::stop_signal;
    use crate::traits::FnHandler;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config() -> MessagingConfig {
        MessagingConfig::new(["memory"], ["orders"], "billing").from_beginning()
    }

    async fn wait_for_marks(log: &MemoryLog, count: usize) {
        while log.marks().len() < count {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    #[tokio::test]
    async fn test_marks_every_message_then_stops() {
        let log = MemoryLog::new(2);
        for i in 0..10u8 {
            log.publish("orders", None, vec![i]);
        }

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
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
        let (handle, signal) = stop_signal();

        let (summary, ()) = tokio::join!(consumer.run(signal), async {
            wait_for_marks(&log, 10).await;
            handle.stop();
        });

        let summary = summary.unwrap();
        assert_eq!(summary.dispatched, 10);
        assert_eq!(summary.completed, 10);
        assert_eq!(seen.load(Ordering::SeqCst), 10);
        assert_eq!(log.committed("billing", "orders", 0), Some(5));
        assert_eq!(log.committed("billing", "orders", 1), Some(5));
        assert_eq!(log.close_count(), 1);
    }

    #[tokio::test]
    async fn test_handler_error_still_marks() {
        let log = MemoryLog::new(1);
        log.publish("orders", None, b"poison".to_vec());

        let (handle, signal) = stop_signal();
        let (summary, ()) = tokio::join!(
            consume(
                log.clone(),
                config(),
                FnHandler(|_msg: Message| async {
                    Err::<(), _>(MessagingError::Handler("bad payload".to_string()))
                }),
                signal,
            ),
            async {
                wait_for_marks(&log, 1).await;
                handle.stop();
            }
        );

        assert_eq!(summary.unwrap().completed, 1);
        assert_eq!(log.committed("billing", "orders", 0), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_handler_timeout_still_marks() {
        let log = MemoryLog::new(1);
        log.publish("orders", None, b"slow".to_vec());

        let consumer = ConsumptionLoop::new(
            log.clone(),
            config().with_handler_timeout(Duration::from_millis(50)),
            Arc::new(FnHandler(|_msg: Message| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok::<_, MessagingError>(())
            })),
        );
        let (handle, signal) = stop_signal();

        let started = tokio::time::Instant::now();
        let (summary, ()) = tokio::join!(consumer.run(signal), async {
            wait_for_marks(&log, 1).await;
            handle.stop();
        });

        assert_eq!(summary.unwrap().completed, 1);
        assert!(started.elapsed() < Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_deadline_aborts_stuck_handlers() {
        let log = MemoryLog::new(1);
        log.publish("orders", None, b"stuck".to_vec());

        let entered = Arc::new(tokio::sync::Notify::new());
        let notify = entered.clone();
        let consumer = ConsumptionLoop::new(
            log.clone(),
            config().with_drain_timeout(Duration::from_millis(100)),
            Arc::new(FnHandler(move |_msg: Message| {
                let notify = notify.clone();
                async move {
                    notify.notify_one();
                    std::future::pending::<()>().await;
                    Ok::<_, MessagingError>(())
                }
            })),
        );
        let (handle, signal) = stop_signal();

        let (summary, ()) = tokio::join!(consumer.run(signal), async {
            entered.notified().await;
            handle.stop();
        });

        let summary = summary.unwrap();
        assert_eq!(summary.dispatched, 1);
        assert_eq!(summary.aborted, 1);
        assert!(log.marks().is_empty());
        assert_eq!(log.close_count(), 1);
    }

    #[tokio::test]
    async fn test_state_transitions() {
        let log = MemoryLog::new(1);
        let consumer = ConsumptionLoop::new(
            log.clone(),
            config(),
            Arc::new(FnHandler(|_msg: Message| async { Ok::<_, MessagingError>(()) })),
        );
        let mut state = consumer.state();
        assert_eq!(*state.borrow(), LoopState::Stopped);

        let (handle, signal) = stop_signal();
        let (result, ()) = tokio::join!(consumer.run(signal), async {
            state
                .wait_for(|s| *s == LoopState::Running)
                .await
                .unwrap();
            handle.stop();
        });

        assert!(result.is_ok());
        assert_eq!(*consumer.state().borrow(), LoopState::Stopped);
    }

    #[tokio::test]
    async fn test_invalid_config_never_connects() {
        let log = MemoryLog::new(1);
        let (_handle, signal) = stop_signal();

        let result = consume(
            log.clone(),
            MessagingConfig::new(["memory"], ["orders"], ""),
            FnHandler(|_msg: Message| async { Ok::<_, MessagingError>(()) }),
            signal,
        )
        .await;

        assert!(matches!(result, Err(MessagingError::Configuration(_))));
        assert_eq!(log.connect_count(), 0);
        assert_eq!(log.close_count(), 0);
    }
}
