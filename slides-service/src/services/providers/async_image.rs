//! Submit-then-poll image generation API client.
//!
//! `submit` posts the prompt to `{api_base}/imageGenerationAsync` and gets an
//! operation id back; `poll` reads `{operations_base}/{id}` once.

use super::{Credentials, ImageProvider, OperationStatus, ProviderError};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct AsyncImageConfig {
    pub api_base: String,
    pub operations_base: String,
    pub model_uri: String,
}

pub struct AsyncImageProvider {
    config: AsyncImageConfig,
    client: Client,
}

impl AsyncImageProvider {
    pub fn new(config: AsyncImageConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to create HTTP client");

        Self { config, client }
    }

    fn submit_body<'a>(&'a self, prompt: &'a str) -> SubmitRequest<'a> {
        SubmitRequest {
            model_uri: &self.config.model_uri,
            generation_options: GenerationOptions {
                seed: uuid::Uuid::new_v4().as_u128() as u32,
                aspect_ratio: AspectRatio {
                    width_ratio: 16,
                    height_ratio: 9,
                },
            },
            messages: vec![PromptMessage {
                weight: "1",
                text: prompt,
            }],
        }
    }
}

#[async_trait]
impl ImageProvider for AsyncImageProvider {
    fn name(&self) -> &'static str {
        "async-image"
    }

    async fn submit(
        &self,
        prompt: &str,
        credentials: &Credentials,
    ) -> Result<String, ProviderError> {
        let url = format!(
            "{}/imageGenerationAsync",
            self.config.api_base.trim_end_matches('/')
        );

        tracing::debug!(prompt_len = prompt.len(), "Submitting image generation");

        let response = credentials
            .apply(self.client.post(&url))
            .json(&self.submit_body(prompt))
            .send()
            .await
            .map_err(|e| ProviderError::NetworkError(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status, &error_text, "image generation"));
        }

        let operation: Operation = response
            .json()
            .await
            .map_err(|e| ProviderError::MalformedResponse(e.to_string()))?;

        if operation.id.is_empty() {
            return Err(ProviderError::MalformedResponse(
                "submit response has no operation id".to_string(),
            ));
        }
        Ok(operation.id)
    }

    async fn poll(
        &self,
        operation_id: &str,
        credentials: &Credentials,
    ) -> Result<OperationStatus, ProviderError> {
        let url = format!(
            "{}/{}",
            self.config.operations_base.trim_end_matches('/'),
            operation_id
        );

        let response = credentials
            .apply(self.client.get(&url))
            .send()
            .await
            .map_err(|e| ProviderError::NetworkError(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status, &error_text, "operations"));
        }

        let operation: Operation = response
            .json()
            .await
            .map_err(|e| ProviderError::MalformedResponse(e.to_string()))?;

        Ok(operation.into_status())
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SubmitRequest<'a> {
    model_uri: &'a str,
    generation_options: GenerationOptions,
    messages: Vec<PromptMessage<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationOptions {
    seed: u32,
    aspect_ratio: AspectRatio,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AspectRatio {
    width_ratio: u32,
    height_ratio: u32,
}

#[derive(Debug, Serialize)]
struct PromptMessage<'a> {
    weight: &'a str,
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct Operation {
    #[serde(default)]
    id: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    response: Option<OperationResponse>,
    #[serde(default)]
    error: Option<OperationError>,
}

#[derive(Debug, Deserialize)]
struct OperationResponse {
    #[serde(default)]
    image: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OperationError {
    #[serde(default)]
    code: Option<i64>,
    #[serde(default)]
    message: String,
}

impl Operation {
    fn into_status(self) -> OperationStatus {
        if !self.done {
            return OperationStatus::Pending;
        }
        if let Some(error) = self.error {
            let message = match error.code {
                Some(code) => format!("{} (code {})", error.message, code),
                None => error.message,
            };
            return OperationStatus::Failed { message };
        }
        match self.response.and_then(|r| r.image) {
            Some(image_base64) if !image_base64.is_empty() => OperationStatus::Done { image_base64 },
            _ => OperationStatus::Failed {
                message: "operation finished without an image".to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider_for(server: &MockServer) -> AsyncImageProvider {
        AsyncImageProvider::new(AsyncImageConfig {
            api_base: format!("{}/foundationModels/v1", server.uri()),
            operations_base: format!("{}/operations", server.uri()),
            model_uri: "art://folder/yandex-art/latest".to_string(),
        })
    }

    fn status(json: &str) -> OperationStatus {
        serde_json::from_str::<Operation>(json).unwrap().into_status()
    }

    #[test]
    fn test_operation_states() {
        assert_eq!(status(r#"{"id":"op1","done":false}"#), OperationStatus::Pending);
        assert_eq!(
            status(r#"{"id":"op1","done":true,"response":{"image":"aGk="}}"#),
            OperationStatus::Done {
                image_base64: "aGk=".to_string()
            }
        );
        assert_eq!(
            status(r#"{"id":"op1","done":true,"error":{"code":3,"message":"bad prompt"}}"#),
            OperationStatus::Failed {
                message: "bad prompt (code 3)".to_string()
            }
        );
        assert!(matches!(
            status(r#"{"id":"op1","done":true,"response":{}}"#),
            OperationStatus::Failed { .. }
        ));
    }

    #[test]
    fn test_submit_body_shape() {
        let provider = AsyncImageProvider::new(AsyncImageConfig {
            api_base: "http://img".to_string(),
            operations_base: "http://ops".to_string(),
            model_uri: "art://folder/yandex-art/latest".to_string(),
        });
        let json = serde_json::to_value(provider.submit_body("a cat")).unwrap();

        assert_eq!(json["modelUri"], "art://folder/yandex-art/latest");
        assert_eq!(json["messages"][0]["text"], "a cat");
        assert_eq!(json["generationOptions"]["aspectRatio"]["widthRatio"], 16);
    }

    #[tokio::test]
    async fn test_submit_returns_operation_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/foundationModels/v1/imageGenerationAsync"))
            .and(header("authorization", "Api-Key secret"))
            .and(body_partial_json(serde_json::json!({
                "modelUri": "art://folder/yandex-art/latest",
                "messages": [{"weight": "1", "text": "a cat"}]
            })))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({
                    "id": "op-42",
                    "done": false
                })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let id = provider_for(&server)
            .submit("a cat", &Credentials::ApiKey("secret".to_string()))
            .await
            .unwrap();

        assert_eq!(id, "op-42");
    }

    #[tokio::test]
    async fn test_submit_without_id_is_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/foundationModels/v1/imageGenerationAsync"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(&server)
            .await;

        let result = provider_for(&server).submit("a cat", &Credentials::None).await;

        assert!(matches!(result, Err(ProviderError::MalformedResponse(_))));
    }

    #[tokio::test]
    async fn test_submit_status_classification() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/foundationModels/v1/imageGenerationAsync"))
            .and(body_partial_json(serde_json::json!({
                "messages": [{"weight": "1", "text": "forbidden"}]
            })))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/foundationModels/v1/imageGenerationAsync"))
            .and(body_partial_json(serde_json::json!({
                "messages": [{"weight": "1", "text": "bad"}]
            })))
            .respond_with(ResponseTemplate::new(400).set_body_string("prompt too long"))
            .mount(&server)
            .await;

        let provider = provider_for(&server);

        assert!(matches!(
            provider.submit("forbidden", &Credentials::None).await,
            Err(ProviderError::Unauthorized(_))
        ));
        assert!(matches!(
            provider.submit("bad", &Credentials::None).await,
            Err(ProviderError::InvalidRequest(msg)) if msg.contains("prompt too long")
        ));
    }

    #[tokio::test]
    async fn test_poll_reads_operation_state() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/operations/op-pending"))
            .and(header("authorization", "Bearer iam-token"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"id": "op-pending", "done": false})),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/operations/op-done"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "op-done",
                "done": true,
                "response": {"image": "aGk="}
            })))
            .mount(&server)
            .await;

        let provider = provider_for(&server);
        let credentials = Credentials::IamToken("iam-token".to_string());

        assert_eq!(
            provider.poll("op-pending", &credentials).await.unwrap(),
            OperationStatus::Pending
        );
        assert_eq!(
            provider.poll("op-done", &credentials).await.unwrap(),
            OperationStatus::Done {
                image_base64: "aGk=".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_poll_server_error_is_api_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/operations/op-1"))
            .respond_with(ResponseTemplate::new(503).set_body_string("try later"))
            .mount(&server)
            .await;

        let result = provider_for(&server).poll("op-1", &Credentials::None).await;

        assert!(matches!(
            result,
            Err(ProviderError::ApiError(msg)) if msg.contains("503") && msg.contains("try later")
        ));
    }
}
