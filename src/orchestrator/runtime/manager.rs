use std::{collections::HashMap, pin::Pin, sync::Arc};

use futures::{Stream, StreamExt, future};
use tokio::sync::{RwLock, broadcast};
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use super::error::RunError;
use super::executor::RunExecutor;
use super::stream::{DeliveryMode, RunEvents};
use crate::normalized::RunEvent;
use crate::orchestrator::domain::{Run, RunStatus};
use crate::orchestrator::persistence::RunStore;

const OBSERVER_CAPACITY: usize = 256;

pub type ObserverStream = Pin<Box<dyn Stream<Item = RunEvent> + Send>>;

#[derive(Debug, Clone)]
struct ActiveRun {
    cancel: CancellationToken,
    observers: broadcast::Sender<RunEvent>,
}

/// Result of a cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The executing task was told to stop; it settles the run itself.
    Signalled,
    /// Nothing was executing the run, so it was closed directly.
    Cancelled,
}

/// Tracks in-flight runs so they can be cancelled or observed.
#[derive(Debug, Clone)]
pub struct RunManager {
    executor: RunExecutor,
    store: Arc<dyn RunStore>,
    // run_id -> cancellation handle and observer fan-out
    active_runs: Arc<RwLock<HashMap<String, ActiveRun>>>,
}

impl RunManager {
    pub fn new(executor: RunExecutor, store: Arc<dyn RunStore>) -> Self {
        Self {
            executor,
            store,
            active_runs: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn executor(&self) -> &RunExecutor {
        &self.executor
    }

    /// Create a queued run in an existing conversation.
    #[instrument(skip(self, metadata))]
    pub async fn submit(
        &self,
        conversation_id: &str,
        agent_id: &str,
        metadata: serde_json::Value,
    ) -> Result<Run, RunError> {
        let exists = self
            .store
            .get_conversation(conversation_id)
            .await
            .map_err(|e| RunError::execution(&e))?
            .is_some();
        if !exists {
            return Err(RunError::ConversationNotFound(conversation_id.to_string()));
        }

        let run = Run::queued(conversation_id, agent_id, metadata);
        self.store
            .create_run(&run)
            .await
            .map_err(|e| RunError::execution(&e))?;
        tracing::info!(name: "run.queued", run_id = %run.id, "Run queued");
        Ok(run)
    }

    /// Execute a queued run and register it until its task finishes.
    #[instrument(skip(self, run), fields(run_id = %run.id))]
    pub async fn start(&self, run: Run, mode: DeliveryMode) -> RunEvents {
        let cancel = CancellationToken::new();
        let (observers, _) = broadcast::channel(OBSERVER_CAPACITY);
        let run_id = run.id.clone();

        self.active_runs.write().await.insert(
            run_id.clone(),
            ActiveRun {
                cancel: cancel.clone(),
                observers: observers.clone(),
            },
        );

        let (events, handle) = self.executor.launch(run, mode, cancel, Some(observers));

        let active_runs = Arc::clone(&self.active_runs);
        tokio::spawn(async move {
            if let Err(e) = handle.await {
                tracing::error!(name: "run.task_panicked", run_id = %run_id, error = %e, "Run task ended abnormally");
            }
            active_runs.write().await.remove(&run_id);
        });

        events
    }

    pub async fn is_active(&self, run_id: &str) -> bool {
        self.active_runs.read().await.contains_key(run_id)
    }

    /// Cancel a run. Active runs are signalled; queued or orphaned running
    /// runs are closed here. Terminal runs are left untouched.
    #[instrument(skip(self))]
    pub async fn cancel(&self, run_id: &str) -> Result<CancelOutcome, RunError> {
        let mut run = self
            .store
            .get_run(run_id)
            .await
            .map_err(|e| RunError::execution(&e))?
            .ok_or_else(|| RunError::RunNotFound(run_id.to_string()))?;

        // Checked before signalling: a finished task stays registered until
        // its cleanup runs.
        if run.status.is_terminal() {
            return Err(RunError::InvalidState {
                run_id: run.id,
                status: run.status,
            });
        }

        if let Some(active) = self.active_runs.read().await.get(run_id) {
            active.cancel.cancel();
            tracing::info!(name: "run.cancel_requested", "Cancellation signalled");
            return Ok(CancelOutcome::Signalled);
        }

        run.cancel()
            .map_err(|e| RunError::Execution(e.to_string()))?;
        self.store
            .commit_terminal(&run, None)
            .await
            .map_err(|e| RunError::execution(&e))?;
        tracing::info!(name: "run.cancelled", "Idle run cancelled");
        Ok(CancelOutcome::Cancelled)
    }

    /// Follow an active run's events from now on. Observers that fall
    /// behind are disconnected rather than shown a gap.
    pub async fn subscribe(&self, run_id: &str) -> Option<ObserverStream> {
        let rx = self.active_runs.read().await.get(run_id)?.observers.subscribe();
        Some(Box::pin(
            BroadcastStream::new(rx)
                .take_while(|item| future::ready(item.is_ok()))
                .filter_map(|item| future::ready(item.ok())),
        ))
    }

    /// Current persisted status, for callers that only hold an id.
    pub async fn status(&self, run_id: &str) -> Result<RunStatus, RunError> {
        self.store
            .get_run(run_id)
            .await
            .map_err(|e| RunError::execution(&e))?
            .map(|run| run.status)
            .ok_or_else(|| RunError::RunNotFound(run_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{
        CompletionProvider, CompletionRequest, Fragment, FragmentStream, LocalProvider, ProviderError,
    };
    use crate::mcp::ToolGateway;
    use crate::orchestrator::catalog::AgentCatalog;
    use crate::orchestrator::defaults::default_agents;
    use crate::orchestrator::domain::Conversation;
    use crate::orchestrator::persistence::SqliteStore;
    use async_trait::async_trait;
    use serde_json::json;

    #[derive(Debug)]
    struct Silent;

    #[async_trait]
    impl CompletionProvider for Silent {
        fn name(&self) -> &'static str {
            "silent"
        }

        async fn complete(&self, _request: CompletionRequest) -> Result<FragmentStream, ProviderError> {
            Ok(Box::pin(futures::stream::pending::<Result<Fragment, ProviderError>>()))
        }
    }

    async fn manager(provider: Arc<dyn CompletionProvider>) -> (RunManager, Arc<SqliteStore>, Conversation) {
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        let catalog = Arc::new(AgentCatalog::from_agents(default_agents(), "gpt-4").unwrap());
        let tools = Arc::new(ToolGateway::with_builtin(Arc::clone(&catalog)));
        let executor = RunExecutor::new(catalog, provider, store.clone(), tools);
        let conv = Conversation::new(json!({}));
        store.create_conversation(&conv).await.unwrap();
        (RunManager::new(executor, store.clone()), store, conv)
    }

    #[tokio::test]
    async fn submit_requires_conversation() {
        let (manager, _store, _conv) = manager(Arc::new(LocalProvider)).await;
        let err = manager.submit("missing", "router", json!({})).await.unwrap_err();
        assert_eq!(err, RunError::ConversationNotFound("missing".into()));
    }

    #[tokio::test]
    async fn queued_run_cancels_directly() {
        let (manager, store, conv) = manager(Arc::new(LocalProvider)).await;
        let run = manager.submit(&conv.id, "router", json!({})).await.unwrap();

        assert_eq!(manager.cancel(&run.id).await.unwrap(), CancelOutcome::Cancelled);
        let stored = store.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Cancelled);

        let again = manager.cancel(&run.id).await.unwrap_err();
        assert!(matches!(again, RunError::InvalidState { status: RunStatus::Cancelled, .. }));
    }

    #[tokio::test]
    async fn cancel_unknown_run() {
        let (manager, _store, _conv) = manager(Arc::new(LocalProvider)).await;
        assert_eq!(
            manager.cancel("nope").await.unwrap_err(),
            RunError::RunNotFound("nope".into())
        );
    }

    #[tokio::test]
    async fn active_run_is_signalled_and_unregistered() {
        let (manager, store, conv) = manager(Arc::new(Silent)).await;
        let run = manager.submit(&conv.id, "assistant", json!({})).await.unwrap();
        let mut events = manager.start(run.clone(), DeliveryMode::Incremental).await;

        // Wait until the provider call is in flight.
        while let Some(event) = events.next_event().await {
            if event.name() == "step.started" {
                break;
            }
        }
        assert!(manager.is_active(&run.id).await);
        assert_eq!(manager.cancel(&run.id).await.unwrap(), CancelOutcome::Signalled);
        assert_eq!(events.finish().await.unwrap().status, RunStatus::Cancelled);

        for _ in 0..50 {
            if !manager.is_active(&run.id).await {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(!manager.is_active(&run.id).await);
        assert_eq!(manager.status(&run.id).await.unwrap(), RunStatus::Cancelled);
        assert_eq!(
            store.get_run(&run.id).await.unwrap().unwrap().status,
            RunStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn observers_see_live_events() {
        let (manager, _store, conv) = manager(Arc::new(Silent)).await;
        let run = manager.submit(&conv.id, "assistant", json!({})).await.unwrap();
        let mut events = manager.start(run.clone(), DeliveryMode::Buffered).await;

        let observer = manager.subscribe(&run.id).await.expect("run is active");
        manager.cancel(&run.id).await.unwrap();
        while events.next_event().await.is_some() {}

        let seen: Vec<_> = observer.collect().await;
        assert_eq!(
            seen.last(),
            Some(&RunEvent::RunCancelled { run_id: run.id.clone() })
        );
    }

    #[tokio::test]
    async fn finished_run_still_registered_is_not_signalled() {
        let (manager, _store, conv) = manager(Arc::new(LocalProvider)).await;
        let run = manager.submit(&conv.id, "router", json!({})).await.unwrap();
        manager
            .start(run.clone(), DeliveryMode::Buffered)
            .await
            .finish()
            .await
            .unwrap();

        // Keep the entry alive regardless of when cleanup runs.
        let cancel = CancellationToken::new();
        let (observers, _) = broadcast::channel(1);
        manager.active_runs.write().await.insert(
            run.id.clone(),
            ActiveRun {
                cancel: cancel.clone(),
                observers,
            },
        );

        let err = manager.cancel(&run.id).await.unwrap_err();
        assert!(matches!(err, RunError::InvalidState { status: RunStatus::Completed, .. }));
        assert!(!cancel.is_cancelled());
    }

    #[tokio::test]
    async fn completed_runs_have_no_observers() {
        let (manager, _store, conv) = manager(Arc::new(LocalProvider)).await;
        let run = manager.submit(&conv.id, "router", json!({})).await.unwrap();
        let summary = manager
            .start(run.clone(), DeliveryMode::Buffered)
            .await
            .finish()
            .await
            .unwrap();
        assert_eq!(summary.status, RunStatus::Completed);
        for _ in 0..50 {
            if !manager.is_active(&run.id).await {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(manager.subscribe(&run.id).await.is_none());
    }
}
