//! OpenAI-compatible chat completions strategy.
//!
//! Streams `choices[0].delta.content` out of the SSE body, or yields the
//! whole `choices[0].message.content` as a single fragment when the request
//! is not streaming.

use futures::StreamExt;

use std::time::Duration;

use super::{
    CompletionProvider, CompletionRequest, Fragment, FragmentStream, LlmSettings, ProviderError,
};

/// Added to the run budget for the HTTP client's own timeout, so the
/// executor's deadline always fires first.
const TRANSPORT_GRACE: Duration = Duration::from_secs(5);

/// Remote strategy. Construction fails without a credential.
#[derive(Clone)]
pub struct RemoteProvider {
    http: reqwest::Client,
    settings: LlmSettings,
    api_key: String,
}

impl std::fmt::Debug for RemoteProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteProvider")
            .field("settings", &self.settings)
            .finish()
    }
}

impl RemoteProvider {
    pub fn new(settings: LlmSettings) -> Result<Self, ProviderError> {
        let api_key = settings
            .api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .ok_or(ProviderError::MissingCredential)?;
        let http = reqwest::Client::builder()
            .timeout(settings.request_timeout + TRANSPORT_GRACE)
            .build()?;
        Ok(Self {
            http,
            settings,
            api_key,
        })
    }

    fn request_body(&self, req: &CompletionRequest) -> serde_json::Value {
        let model = if req.agent.model.trim().is_empty() {
            self.settings.default_model.as_str()
        } else {
            req.agent.model.as_str()
        };
        let mut body = serde_json::json!({
            "model": model,
            "messages": req.messages,
            "temperature": self.settings.temperature,
            "stream": req.stream,
        });
        if let Some(max_tokens) = self.settings.max_tokens {
            body["max_tokens"] = max_tokens.into();
        }
        body
    }
}

#[async_trait::async_trait]
impl CompletionProvider for RemoteProvider {
    fn name(&self) -> &'static str {
        "remote"
    }

    async fn complete(&self, req: CompletionRequest) -> Result<FragmentStream, ProviderError> {
        let url = self.settings.provider.build_chat_url(&self.settings.base_url);
        let body = self.request_body(&req);

        tracing::debug!(
            name: "llm.remote.request",
            url = %url,
            model = %body["model"],
            stream = req.stream,
            messages = req.messages.len(),
            "Calling chat completions"
        );

        let rb = self.http.post(&url).json(&body);
        let resp = self.settings.provider.authorize(rb, &self.api_key).send().await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::Status { status, body });
        }

        if !req.stream {
            let v: serde_json::Value = resp.json().await?;
            let content = v["choices"][0]["message"]["content"]
                .as_str()
                .unwrap_or_default()
                .to_string();
            let fragments: Vec<Result<Fragment, ProviderError>> = if content.is_empty() {
                Vec::new()
            } else {
                vec![Ok(Fragment::Text(content))]
            };
            return Ok(Box::pin(futures::stream::iter(fragments)));
        }

        let byte_stream = resp.bytes_stream();
        let out = async_stream::try_stream! {
            let mut buf = Vec::<u8>::new();

            futures::pin_mut!(byte_stream);
            'frames: while let Some(chunk) = byte_stream.next().await {
                let chunk = chunk?;
                buf.extend_from_slice(&chunk);

                while let Some(pos) = find_double_newline(&buf) {
                    let frame = buf.drain(..pos + 2).collect::<Vec<_>>();
                    let text = String::from_utf8_lossy(&frame);

                    for line in text.lines() {
                        let line = line.trim();
                        if !line.starts_with("data:") {
                            continue;
                        }
                        let data = line.trim_start_matches("data:").trim();
                        if data == "[DONE]" {
                            break 'frames;
                        }

                        let v: serde_json::Value = serde_json::from_str(data)
                            .map_err(|e| ProviderError::Decode(e.to_string()))?;
                        if let Some(err) = v.get("error") {
                            Err::<(), _>(ProviderError::Decode(err.to_string()))?;
                        }
                        if let Some(s) = v["choices"][0]["delta"]["content"].as_str() {
                            if !s.is_empty() {
                                yield Fragment::Text(s.to_string());
                            }
                        }
                    }
                }
            }
        };

        Ok(Box::pin(out))
    }
}

/// Find the position of a double newline in the buffer.
fn find_double_newline(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ChatMessage, Provider};
    use crate::orchestrator::domain::{AgentConfig, AgentRole};
    use axum::{Json, Router, http::StatusCode, response::IntoResponse, routing::post};
    use futures::TryStreamExt;
    use std::sync::{Arc, Mutex};

    fn settings(base_url: String, key: Option<&str>) -> LlmSettings {
        LlmSettings {
            provider: Provider::detect_from_url(&base_url),
            base_url,
            api_key: key.map(str::to_string),
            default_model: "gpt-4".into(),
            temperature: 0.7,
            max_tokens: None,
            request_timeout: Duration::from_secs(5),
        }
    }

    fn request(stream: bool) -> CompletionRequest {
        let agent = AgentConfig {
            id: "assistant".into(),
            name: "General Assistant".into(),
            role: AgentRole::Assistant,
            system_prompt: "Be brief.".into(),
            model: "gpt-4o-mini".into(),
            allowed_tools: vec![],
        };
        CompletionRequest {
            agent,
            messages: vec![ChatMessage::user("hi")],
            stream,
        }
    }

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[test]
    fn construction_requires_credential() {
        let err = RemoteProvider::new(settings("https://api.openai.com".into(), None)).unwrap_err();
        assert!(matches!(err, ProviderError::MissingCredential));
        let err =
            RemoteProvider::new(settings("https://api.openai.com".into(), Some("  "))).unwrap_err();
        assert!(matches!(err, ProviderError::MissingCredential));
    }

    #[test]
    fn max_tokens_only_sent_when_configured() {
        let mut s = settings("https://api.openai.com".into(), Some("sk-test"));
        let provider = RemoteProvider::new(s.clone()).unwrap();
        let body = provider.request_body(&request(true));
        assert!(body.get("max_tokens").is_none());
        assert_eq!(body["model"], "gpt-4o-mini");
        assert_eq!(body["stream"], true);

        s.max_tokens = Some(256);
        let provider = RemoteProvider::new(s).unwrap();
        let body = provider.request_body(&request(false));
        assert_eq!(body["max_tokens"], 256);
    }

    #[tokio::test]
    async fn streams_content_deltas_until_done() {
        let seen = Arc::new(Mutex::new(None::<serde_json::Value>));
        let seen_in = Arc::clone(&seen);
        let router = Router::new().route(
            "/v1/chat/completions",
            post(move |Json(body): Json<serde_json::Value>| {
                let seen = Arc::clone(&seen_in);
                async move {
                    *seen.lock().unwrap() = Some(body);
                    let sse = concat!(
                        "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
                        "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
                        "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n",
                        "data: [DONE]\n\n",
                        "data: {\"choices\":[{\"delta\":{\"content\":\"ignored\"}}]}\n\n",
                    );
                    ([("content-type", "text/event-stream")], sse).into_response()
                }
            }),
        );
        let base = serve(router).await;

        let provider = RemoteProvider::new(settings(base, Some("sk-test"))).unwrap();
        let fragments: Vec<Fragment> = provider
            .complete(request(true))
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();

        assert_eq!(fragments, [Fragment::from("Hel"), Fragment::from("lo")]);
        let body = seen.lock().unwrap().clone().unwrap();
        assert_eq!(body["messages"][0]["role"], "user");
        assert!((body["temperature"].as_f64().unwrap() - 0.7).abs() < 1e-9);
    }

    #[tokio::test]
    async fn non_streaming_yields_single_fragment() {
        let router = Router::new().route(
            "/v1/chat/completions",
            post(|| async {
                Json(serde_json::json!({
                    "choices": [{"message": {"role": "assistant", "content": "Hello there."}}]
                }))
            }),
        );
        let base = serve(router).await;

        let provider = RemoteProvider::new(settings(base, Some("sk-test"))).unwrap();
        let fragments: Vec<Fragment> = provider
            .complete(request(false))
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(fragments, [Fragment::from("Hello there.")]);
    }

    #[tokio::test]
    async fn non_success_status_is_an_error() {
        let router = Router::new().route(
            "/v1/chat/completions",
            post(|| async { (StatusCode::UNAUTHORIZED, "bad key") }),
        );
        let base = serve(router).await;

        let provider = RemoteProvider::new(settings(base, Some("sk-test"))).unwrap();
        let err = provider.complete(request(true)).await.err().unwrap();
        match err {
            ProviderError::Status { status, body } => {
                assert_eq!(status, reqwest::StatusCode::UNAUTHORIZED);
                assert_eq!(body, "bad key");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
