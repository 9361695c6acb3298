//! Strategy selection and remote failure containment.

use async_trait::async_trait;
use futures::StreamExt;
use std::sync::Arc;

use super::{
    CompletionProvider, CompletionRequest, Fragment, FragmentStream, LlmSettings, LocalProvider,
    ProviderError, RemoteProvider,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Remote,
    Local,
}

/// Remote only when an endpoint is configured and a credential is present.
pub fn select_strategy(remote_configured: bool, credential_present: bool) -> Strategy {
    if remote_configured && credential_present {
        Strategy::Remote
    } else {
        Strategy::Local
    }
}

/// Build the provider handed to the run executor.
pub fn build_provider(settings: &LlmSettings) -> Result<Arc<dyn CompletionProvider>, ProviderError> {
    let strategy = select_strategy(settings.remote_configured(), settings.has_credential());
    tracing::info!(
        name: "llm.strategy",
        strategy = ?strategy,
        base_url = %settings.base_url,
        default_model = %settings.default_model,
        "Completion provider selected"
    );
    Ok(match strategy {
        Strategy::Remote => {
            let remote = RemoteProvider::new(settings.clone())?;
            Arc::new(FallbackProvider::new(Arc::new(remote)))
        }
        Strategy::Local => Arc::new(LocalProvider),
    })
}

/// Text yielded in place of the remote output once it fails.
pub fn diagnostic_fragment(err: &ProviderError) -> String {
    format!("[Remote provider unavailable: {err}] ")
}

/// Wraps a primary provider. Any error from it, at call time or mid-stream,
/// becomes a [`Fragment::Restart`] carrying the diagnostic, followed by the
/// local reply. Text the primary produced before failing is delivered but
/// dropped from the final content.
///
/// Timeouts are passed through untouched: the run budget is spent and the
/// executor fails the run.
#[derive(Debug, Clone)]
pub struct FallbackProvider {
    primary: Arc<dyn CompletionProvider>,
}

impl FallbackProvider {
    pub fn new(primary: Arc<dyn CompletionProvider>) -> Self {
        Self { primary }
    }
}

#[async_trait]
impl CompletionProvider for FallbackProvider {
    fn name(&self) -> &'static str {
        self.primary.name()
    }

    async fn complete(&self, req: CompletionRequest) -> Result<FragmentStream, ProviderError> {
        let primary = Arc::clone(&self.primary);
        let agent = req.agent.clone();
        let stream = req.stream;

        let out = async_stream::stream! {
            let failure = match primary.complete(req).await {
                Ok(mut fragments) => {
                    let mut failure = None;
                    while let Some(item) = fragments.next().await {
                        match item {
                            Ok(fragment) => yield Ok::<_, ProviderError>(fragment),
                            Err(e) => {
                                failure = Some(e);
                                break;
                            }
                        }
                    }
                    failure
                }
                Err(e) => Some(e),
            };

            if let Some(err) = failure {
                if err.is_timeout() {
                    yield Err(err);
                    return;
                }
                tracing::warn!(
                    name: "llm.fallback",
                    agent_id = %agent.id,
                    error = %err,
                    "Remote provider failed; continuing with local reply"
                );
                yield Ok(Fragment::Restart(diagnostic_fragment(&err)));
                for fragment in LocalProvider::fragments(&agent, stream) {
                    yield Ok(Fragment::Text(fragment));
                }
            }
        };

        Ok(Box::pin(out))
    }
}
