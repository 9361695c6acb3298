//! Delivery of a run's events to its caller.
//!
//! The executor task pushes events into a bounded channel and reports the
//! outcome separately once the channel is closed. The channel closing is
//! the "no more events" signal. A failed outcome is the error signal.

use futures::Stream;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::error::RunError;
use crate::normalized::RunEvent;
use crate::orchestrator::domain::RunStatus;

/// Chosen per execution request, not per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Only the final run id and status are reported.
    Buffered,
    /// Every event is relayed in production order.
    Incremental,
}

impl DeliveryMode {
    pub fn from_stream_flag(stream: bool) -> Self {
        if stream {
            Self::Incremental
        } else {
            Self::Buffered
        }
    }

    pub fn is_incremental(self) -> bool {
        self == Self::Incremental
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub status: RunStatus,
}

pub(crate) type Outcome = Result<RunStatus, RunError>;

/// The caller's handle on one execution. Dropping it counts as a
/// disconnect and cancels the run.
#[derive(Debug)]
pub struct RunEvents {
    run_id: String,
    mode: DeliveryMode,
    events: mpsc::Receiver<RunEvent>,
    outcome: oneshot::Receiver<Outcome>,
}

impl RunEvents {
    pub(crate) fn new(
        run_id: String,
        mode: DeliveryMode,
        events: mpsc::Receiver<RunEvent>,
        outcome: oneshot::Receiver<Outcome>,
    ) -> Self {
        Self {
            run_id,
            mode,
            events,
            outcome,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn mode(&self) -> DeliveryMode {
        self.mode
    }

    /// Next event, or `None` once the run has produced its last one.
    pub async fn next_event(&mut self) -> Option<RunEvent> {
        self.events.recv().await
    }

    /// Buffered consumption: discard events, wait for the terminal status.
    pub async fn finish(mut self) -> Result<RunSummary, RunError> {
        while self.events.recv().await.is_some() {}
        let status = resolve(self.outcome.await)?;
        Ok(RunSummary {
            run_id: self.run_id,
            status,
        })
    }

    /// Incremental consumption: every event, then `Err` if the run failed.
    pub fn into_stream(self) -> impl Stream<Item = Result<RunEvent, RunError>> + Send + 'static {
        let Self {
            mut events,
            outcome,
            ..
        } = self;
        async_stream::stream! {
            while let Some(event) = events.recv().await {
                yield Ok(event);
            }
            if let Err(e) = resolve(outcome.await) {
                yield Err(e);
            }
        }
    }
}

fn resolve(outcome: Result<Outcome, oneshot::error::RecvError>) -> Outcome {
    outcome.unwrap_or_else(|_| Err(RunError::Execution("run task ended without an outcome".into())))
}

/// Caller disconnected or cancellation requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Interrupted;

/// Executor-side end of the channel.
#[derive(Debug)]
pub(crate) struct EventSink {
    tx: mpsc::Sender<RunEvent>,
    mode: DeliveryMode,
    observers: Option<broadcast::Sender<RunEvent>>,
    cancel: CancellationToken,
}

impl EventSink {
    pub(crate) fn new(
        tx: mpsc::Sender<RunEvent>,
        mode: DeliveryMode,
        observers: Option<broadcast::Sender<RunEvent>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            tx,
            mode,
            observers,
            cancel,
        }
    }

    pub(crate) fn mode(&self) -> DeliveryMode {
        self.mode
    }

    pub(crate) fn is_interrupted(&self) -> bool {
        self.cancel.is_cancelled() || self.tx.is_closed()
    }

    /// Resolves on cancellation or when the caller drops its handle.
    pub(crate) async fn interrupted(&self) {
        tokio::select! {
            () = self.cancel.cancelled() => {}
            () = self.tx.closed() => {}
        }
    }

    /// Observers always get the event; the caller only in incremental mode.
    /// Waits for channel capacity, so a slow caller applies backpressure.
    pub(crate) async fn emit(&self, event: RunEvent) -> Result<(), Interrupted> {
        if let Some(observers) = &self.observers {
            // No receivers is fine.
            let _ = observers.send(event.clone());
        }
        if !self.mode.is_incremental() {
            return if self.is_interrupted() {
                Err(Interrupted)
            } else {
                Ok(())
            };
        }
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(Interrupted),
            sent = self.tx.send(event) => sent.map_err(|_| Interrupted),
        }
    }

    /// Terminal event of a committed run. Cancellation can no longer change
    /// the outcome, so only a vanished caller stops delivery.
    pub(crate) async fn deliver(&self, event: RunEvent) {
        if let Some(observers) = &self.observers {
            let _ = observers.send(event.clone());
        }
        if self.mode.is_incremental() {
            let _ = self.tx.send(event).await;
        }
    }

    /// Best-effort delivery of a final event after cancellation.
    pub(crate) fn notify(&self, event: RunEvent) {
        if let Some(observers) = &self.observers {
            let _ = observers.send(event.clone());
        }
        if self.mode.is_incremental() {
            let _ = self.tx.try_send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delta(s: &str) -> RunEvent {
        RunEvent::ModelDelta { delta: s.into() }
    }

    #[tokio::test]
    async fn buffered_sink_sends_nothing_but_feeds_observers() {
        let (tx, mut rx) = mpsc::channel(4);
        let (obs_tx, mut obs_rx) = broadcast::channel(4);
        let sink = EventSink::new(tx, DeliveryMode::Buffered, Some(obs_tx), CancellationToken::new());

        sink.emit(delta("a")).await.unwrap();
        drop(sink);

        assert!(rx.recv().await.is_none());
        assert_eq!(obs_rx.recv().await.unwrap(), delta("a"));
    }

    #[tokio::test]
    async fn dropped_receiver_interrupts_emit() {
        let (tx, rx) = mpsc::channel(1);
        let sink = EventSink::new(tx, DeliveryMode::Incremental, None, CancellationToken::new());
        drop(rx);
        assert!(sink.is_interrupted());
        assert_eq!(sink.emit(delta("a")).await, Err(Interrupted));
    }

    #[tokio::test]
    async fn cancellation_unblocks_a_full_channel() {
        let (tx, _rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let sink = EventSink::new(tx, DeliveryMode::Incremental, None, cancel.clone());
        sink.emit(delta("fills the buffer")).await.unwrap();

        cancel.cancel();
        assert_eq!(sink.emit(delta("blocked")).await, Err(Interrupted));
    }

    #[tokio::test]
    async fn terminal_event_survives_late_cancellation() {
        let (tx, mut rx) = mpsc::channel(4);
        let (obs_tx, mut obs_rx) = broadcast::channel(4);
        let cancel = CancellationToken::new();
        let sink = EventSink::new(tx, DeliveryMode::Incremental, Some(obs_tx), cancel.clone());

        cancel.cancel();
        let done = RunEvent::RunCompleted {
            run_id: "r1".into(),
            message: "Hello".into(),
        };
        sink.deliver(done.clone()).await;
        drop(sink);

        assert_eq!(rx.recv().await, Some(done.clone()));
        assert!(rx.recv().await.is_none());
        assert_eq!(obs_rx.recv().await.unwrap(), done);
    }

    #[tokio::test]
    async fn finish_reports_outcome_after_events() {
        let (tx, rx) = mpsc::channel(4);
        let (out_tx, out_rx) = oneshot::channel();
        let events = RunEvents::new("r1".into(), DeliveryMode::Incremental, rx, out_rx);

        tx.send(delta("x")).await.unwrap();
        drop(tx);
        out_tx.send(Ok(RunStatus::Completed)).unwrap();

        let summary = events.finish().await.unwrap();
        assert_eq!(
            summary,
            RunSummary {
                run_id: "r1".into(),
                status: RunStatus::Completed
            }
        );
    }

    #[tokio::test]
    async fn stream_ends_with_error_on_failure() {
        use futures::StreamExt;

        let (tx, rx) = mpsc::channel(4);
        let (out_tx, out_rx) = oneshot::channel();
        let events = RunEvents::new("r1".into(), DeliveryMode::Incremental, rx, out_rx);

        tx.send(delta("x")).await.unwrap();
        drop(tx);
        out_tx
            .send(Err(RunError::AgentNotFound("ghost".into())))
            .unwrap();

        let items: Vec<_> = events.into_stream().collect().await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0], Ok(delta("x")));
        assert_eq!(items[1], Err(RunError::AgentNotFound("ghost".into())));
    }

    #[tokio::test]
    async fn lost_task_is_an_execution_error() {
        let (tx, rx) = mpsc::channel::<RunEvent>(1);
        let (out_tx, out_rx) = oneshot::channel::<Outcome>();
        drop(tx);
        drop(out_tx);
        let err = RunEvents::new("r1".into(), DeliveryMode::Buffered, rx, out_rx)
            .finish()
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::Execution(_)));
    }
}
