//! OpenAI-compatible chat completions provider.
//!
//! Works against any endpoint that speaks the `/chat/completions` streaming
//! protocol (DeepSeek, OpenAI, vLLM, ...).

use super::sse::{SseDecoder, DONE_SENTINEL};
use super::{
    FinishReason, GenerationParams, ProviderError, ProviderStream, StreamChunk, TextProvider,
};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::de::IgnoredAny;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// OpenAI-compatible provider configuration.
#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub api_base: String,
    pub api_key: String,
    pub model: String,
}

/// Streaming chat completions provider.
pub struct OpenAiTextProvider {
    config: OpenAiConfig,
    client: Client,
}

impl OpenAiTextProvider {
    pub fn new(config: OpenAiConfig) -> Self {
        // Streams can legitimately run for minutes; the relay owns the overall budget.
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .expect("Failed to create HTTP client");

        Self { config, client }
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}/{}", self.config.api_base.trim_end_matches('/'), path)
    }

    fn build_request<'a>(&'a self, prompt: &'a str, params: &'a GenerationParams) -> ChatRequest<'a> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = params.system_prompt.as_deref() {
            messages.push(ChatMessage {
                role: "system",
                content: system,
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: prompt,
        });

        ChatRequest {
            model: &self.config.model,
            messages,
            stream: true,
            temperature: params.temperature,
            max_tokens: params.max_tokens,
        }
    }
}

#[async_trait]
impl TextProvider for OpenAiTextProvider {
    fn name(&self) -> &'static str {
        "openai"
    }

    async fn generate_stream(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<ProviderStream, ProviderError> {
        let request = self.build_request(prompt, params);

        tracing::debug!(
            model = %self.config.model,
            prompt_len = prompt.len(),
            "Starting streaming request to chat completions API"
        );

        let response = self
            .client
            .post(self.api_url("chat/completions"))
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| ProviderError::NetworkError(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status, &error_text, "chat completions"));
        }

        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(pump_events(response, tx));

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn health_check(&self) -> Result<(), ProviderError> {
        let response = self
            .client
            .get(self.api_url("models"))
            .bearer_auth(&self.config.api_key)
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(|e| ProviderError::NetworkError(e.to_string()))?;

        if response.status().is_success() {
            Ok(())
        } else {
            let status = response.status();
            Err(ProviderError::from_status(status, "", "models"))
        }
    }
}

/// Decode the response body into chunks until `[DONE]`, an error, or the
/// receiver going away. Dropping `response` on return closes the connection.
async fn pump_events(
    response: reqwest::Response,
    tx: mpsc::Sender<Result<StreamChunk, ProviderError>>,
) {
    let mut body = response.bytes_stream();
    let mut decoder = SseDecoder::new();
    let mut finish_reason = FinishReason::Complete;

    loop {
        // A stalled upstream must not outlive the reader.
        let next = tokio::select! {
            _ = tx.closed() => {
                tracing::debug!("Stream receiver dropped, closing upstream connection");
                return;
            }
            next = body.next() => next,
        };
        let Some(next) = next else { break };

        let bytes = match next {
            Ok(bytes) => bytes,
            Err(e) => {
                let _ = tx.send(Err(ProviderError::NetworkError(e.to_string()))).await;
                return;
            }
        };

        for data in decoder.push(&bytes) {
            match handle_event(&data, &mut finish_reason) {
                EventAction::Emit(text) => {
                    if tx.send(Ok(StreamChunk::Text(text))).await.is_err() {
                        return;
                    }
                }
                EventAction::Skip => {}
                EventAction::Finish => {
                    let _ = tx.send(Ok(StreamChunk::Complete { finish_reason })).await;
                    return;
                }
                EventAction::Fail(err) => {
                    let _ = tx.send(Err(err)).await;
                    return;
                }
            }
        }
    }

    if let Some(data) = decoder.finish() {
        match handle_event(&data, &mut finish_reason) {
            EventAction::Emit(text) => {
                if tx.send(Ok(StreamChunk::Text(text))).await.is_err() {
                    return;
                }
            }
            EventAction::Fail(err) => {
                let _ = tx.send(Err(err)).await;
                return;
            }
            EventAction::Skip | EventAction::Finish => {}
        }
    }

    // Body ended without [DONE]; some compatible servers do this.
    let _ = tx.send(Ok(StreamChunk::Complete { finish_reason })).await;
}

#[derive(Debug)]
enum EventAction {
    Emit(String),
    Skip,
    Finish,
    Fail(ProviderError),
}

fn handle_event(data: &str, finish_reason: &mut FinishReason) -> EventAction {
    let data = data.trim();
    if data.is_empty() {
        return EventAction::Skip;
    }
    if data == DONE_SENTINEL {
        return EventAction::Finish;
    }

    let payload: StreamPayload = match serde_json::from_str(data) {
        Ok(payload) => payload,
        Err(e) => {
            tracing::warn!(error = %e, "Skipping undecodable stream event");
            return EventAction::Skip;
        }
    };

    if let Some(error) = payload.error {
        return EventAction::Fail(ProviderError::ApiError(error.message));
    }

    let Some(choice) = payload.choices.into_iter().next() else {
        return EventAction::Skip;
    };
    if let Some(reason) = choice.finish_reason.as_deref() {
        *finish_reason = FinishReason::from_api(reason);
        if *finish_reason == FinishReason::ContentFilter {
            return EventAction::Fail(ProviderError::ContentFiltered);
        }
    }

    let text = choice
        .delta
        .and_then(|delta| delta.content)
        .map(DeltaContent::into_text)
        .unwrap_or_default();

    if text.is_empty() {
        EventAction::Skip
    } else {
        EventAction::Emit(text)
    }
}

// Request types

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

// Response types

#[derive(Debug, Deserialize)]
struct StreamPayload {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    error: Option<ApiErrorBody>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Option<Delta>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<DeltaContent>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    message: String,
}

/// Fragment content as sent by different compatible servers: a plain string,
/// a list of typed parts, or something else entirely.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum DeltaContent {
    Text(String),
    Parts(Vec<ContentPart>),
    Other(serde_json::Value),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ContentPart {
    Typed { text: String },
    Plain(String),
    Other(IgnoredAny),
}

impl DeltaContent {
    fn into_text(self) -> String {
        match self {
            DeltaContent::Text(text) => text,
            DeltaContent::Parts(parts) => parts
                .into_iter()
                .filter_map(|part| match part {
                    ContentPart::Typed { text } | ContentPart::Plain(text) => Some(text),
                    ContentPart::Other(_) => None,
                })
                .collect(),
            DeltaContent::Other(value) => value
                .get("text")
                .and_then(|t| t.as_str())
                .map(str::to_string)
                .unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider_for(api_base: String) -> OpenAiTextProvider {
        OpenAiTextProvider::new(OpenAiConfig {
            api_base,
            api_key: "test-key".to_string(),
            model: "deepseek-chat".to_string(),
        })
    }

    async fn mount_stream(server: &MockServer, body: &str) {
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer test-key"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(body.to_string()),
            )
            .mount(server)
            .await;
    }

    async fn collect(stream: ProviderStream) -> Vec<Result<StreamChunk, ProviderError>> {
        stream.collect().await
    }

    fn handle(data: &str) -> EventAction {
        let mut reason = FinishReason::Complete;
        handle_event(data, &mut reason)
    }

    #[test]
    fn test_string_delta() {
        assert!(matches!(
            handle(r#"{"choices":[{"delta":{"content":"Hel"}}]}"#),
            EventAction::Emit(text) if text == "Hel"
        ));
    }

    #[test]
    fn test_part_list_delta_is_flattened() {
        assert!(matches!(
            handle(r#"{"choices":[{"delta":{"content":[{"type":"text","text":"a"},"b",{"x":1}]}}]}"#),
            EventAction::Emit(text) if text == "ab"
        ));
    }

    #[test]
    fn test_role_only_and_null_content_are_skipped() {
        assert!(matches!(
            handle(r#"{"choices":[{"delta":{"role":"assistant"}}]}"#),
            EventAction::Skip
        ));
        assert!(matches!(
            handle(r#"{"choices":[{"delta":{"content":null}}]}"#),
            EventAction::Skip
        ));
        assert!(matches!(handle("not json"), EventAction::Skip));
    }

    #[test]
    fn test_done_and_error_events() {
        assert!(matches!(handle("[DONE]"), EventAction::Finish));
        assert!(matches!(
            handle(r#"{"error":{"message":"quota exceeded"}}"#),
            EventAction::Fail(ProviderError::ApiError(msg)) if msg == "quota exceeded"
        ));
    }

    #[test]
    fn test_finish_reason_is_recorded() {
        let mut reason = FinishReason::Complete;
        let action = handle_event(
            r#"{"choices":[{"delta":{"content":"!"},"finish_reason":"length"}]}"#,
            &mut reason,
        );
        assert!(matches!(action, EventAction::Emit(text) if text == "!"));
        assert_eq!(reason, FinishReason::Length);
    }

    #[test]
    fn test_request_includes_system_prompt() {
        let provider = OpenAiTextProvider::new(OpenAiConfig {
            api_base: "http://localhost/v1/".to_string(),
            api_key: "k".to_string(),
            model: "deepseek-chat".to_string(),
        });
        let params = GenerationParams {
            temperature: Some(0.7),
            max_tokens: Some(100),
            system_prompt: Some("be brief".to_string()),
        };
        let json = serde_json::to_value(provider.build_request("hi", &params)).unwrap();

        assert_eq!(provider.api_url("chat/completions"), "http://localhost/v1/chat/completions");
        assert_eq!(json["stream"], true);
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["messages"][1]["content"], "hi");
        assert_eq!(json["max_tokens"], 100);
    }

    #[tokio::test]
    async fn test_stream_against_server() {
        let server = MockServer::start().await;
        mount_stream(
            &server,
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n\
             data: {\"choices\":[{\"delta\":{\"content\":\"lo\"},\"finish_reason\":\"stop\"}]}\n\n\
             data: [DONE]\n\n",
        )
        .await;

        let provider = provider_for(format!("{}/v1", server.uri()));
        let stream = provider
            .generate_stream("hi", &GenerationParams::default())
            .await
            .unwrap();
        let chunks: Vec<StreamChunk> = collect(stream)
            .await
            .into_iter()
            .map(Result::unwrap)
            .collect();

        assert_eq!(
            chunks,
            vec![
                StreamChunk::Text("Hel".to_string()),
                StreamChunk::Text("lo".to_string()),
                StreamChunk::Complete {
                    finish_reason: FinishReason::Complete
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_body_without_done_still_completes() {
        let server = MockServer::start().await;
        mount_stream(
            &server,
            "data: {\"choices\":[{\"delta\":{\"content\":\"partial\"},\"finish_reason\":\"length\"}]}",
        )
        .await;

        let provider = provider_for(format!("{}/v1", server.uri()));
        let stream = provider
            .generate_stream("hi", &GenerationParams::default())
            .await
            .unwrap();
        let chunks = collect(stream).await;

        assert_eq!(chunks.len(), 2);
        assert!(matches!(&chunks[0], Ok(StreamChunk::Text(t)) if t == "partial"));
        assert!(matches!(
            &chunks[1],
            Ok(StreamChunk::Complete {
                finish_reason: FinishReason::Length
            })
        ));
    }

    #[tokio::test]
    async fn test_error_event_mid_body_ends_stream() {
        let server = MockServer::start().await;
        mount_stream(
            &server,
            "data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n\n\
             data: {\"error\":{\"message\":\"overloaded\"}}\n\n\
             data: {\"choices\":[{\"delta\":{\"content\":\"never\"}}]}\n\n",
        )
        .await;

        let provider = provider_for(format!("{}/v1", server.uri()));
        let stream = provider
            .generate_stream("hi", &GenerationParams::default())
            .await
            .unwrap();
        let chunks = collect(stream).await;

        assert_eq!(chunks.len(), 2);
        assert!(matches!(&chunks[0], Ok(StreamChunk::Text(t)) if t == "a"));
        assert!(matches!(&chunks[1], Err(ProviderError::ApiError(msg)) if msg == "overloaded"));
    }

    #[tokio::test]
    async fn test_non_success_status_is_classified() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let provider = provider_for(format!("{}/v1", server.uri()));
        let result = provider
            .generate_stream("hi", &GenerationParams::default())
            .await;

        assert!(matches!(result, Err(ProviderError::RateLimited)));
    }

    #[tokio::test]
    async fn test_dropping_stream_closes_stalled_upstream() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (closed_tx, closed_rx) = tokio::sync::oneshot::channel();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let _ = socket.read(&mut buf).await;
            socket
                .write_all(
                    b"HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\n\r\n\
                      data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n\n",
                )
                .await
                .unwrap();

            // Never send anything else; wait for the client to hang up.
            loop {
                match socket.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => continue,
                }
            }
            let _ = closed_tx.send(());
        });

        let provider = provider_for(format!("http://{}/v1", addr));
        let mut stream = provider
            .generate_stream("hi", &GenerationParams::default())
            .await
            .unwrap();

        let first = stream.next().await;
        assert!(matches!(first, Some(Ok(StreamChunk::Text(t))) if t == "Hi"));

        drop(stream);
        let closed = tokio::time::timeout(Duration::from_secs(3), closed_rx).await;
        assert!(closed.is_ok(), "upstream connection was not closed");
    }
}
