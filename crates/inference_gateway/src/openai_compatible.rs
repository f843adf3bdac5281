use std::time::Duration;

use serde::{Deserialize, Serialize};

use pipeline_domain::ports::{GenerateOptions, LlmGateway, LlmGatewayError};

/// HTTP client for any provider implementing the OpenAI `/chat/completions`
/// shape. Mirrors the teacher's `OpenAiCompatibleBackend` client
/// construction (bounded connect/idle timeouts, bearer auth header) but
/// drops the streaming/SSE machinery the Responder never needs.
pub struct OpenAiCompatibleLlmGateway {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    timeout: Duration,
}

impl OpenAiCompatibleLlmGateway {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .expect("failed to build reqwest client");
        Self { client, base_url: base_url.into(), api_key: api_key.into(), timeout }
    }
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    stop: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatCompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChoice {
    message: ChatCompletionMessage,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct ModelsResponse {
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
}

#[async_trait::async_trait]
impl LlmGateway for OpenAiCompatibleLlmGateway {
    async fn generate(&self, prompt: &str, options: &GenerateOptions) -> Result<String, LlmGatewayError> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let request = ChatCompletionRequest {
            model: &options.model,
            messages: vec![ChatMessage { role: "user", content: prompt }],
            temperature: options.temperature,
            max_tokens: options.max_tokens,
            stop: options.stop.clone(),
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .timeout(self.timeout)
            .json(&request)
            .send()
            .await
            .map_err(classify_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status_error(status, &body, &options.model));
        }

        let parsed: ChatCompletionResponse = response.json().await.map_err(|err| {
            LlmGatewayError::ServerError(format!("malformed completion response: {err}"))
        })?;

        Ok(parsed
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .unwrap_or_default())
    }

    async fn health(&self) -> Result<(), LlmGatewayError> {
        let url = format!("{}/models", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.api_key)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(classify_transport_error)?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(LlmGatewayError::ServerError(format!("health check returned {}", response.status())))
        }
    }

    async fn list_models(&self) -> Result<Vec<String>, LlmGatewayError> {
        let url = format!("{}/models", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.api_key)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(classify_transport_error)?;
        if !response.status().is_success() {
            return Err(LlmGatewayError::ServerError(format!("list_models returned {}", response.status())));
        }
        let parsed: ModelsResponse = response
            .json()
            .await
            .map_err(|err| LlmGatewayError::ServerError(format!("malformed models response: {err}")))?;
        Ok(parsed.data.into_iter().map(|m| m.id).collect())
    }
}

fn classify_transport_error(err: reqwest::Error) -> LlmGatewayError {
    if err.is_timeout() {
        LlmGatewayError::Timeout
    } else {
        LlmGatewayError::Network(err.to_string())
    }
}

fn classify_status_error(status: reqwest::StatusCode, body: &str, model: &str) -> LlmGatewayError {
    if status.as_u16() == 404 && body.to_lowercase().contains("model") {
        return LlmGatewayError::ModelNotFound(model.to_string());
    }
    if status.is_server_error() {
        LlmGatewayError::ServerError(format!("{status}: {body}"))
    } else {
        LlmGatewayError::ClientError(format!("{status}: {body}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_model_not_found() {
        let err = classify_status_error(reqwest::StatusCode::NOT_FOUND, "model 'x' not found", "x");
        assert!(matches!(err, LlmGatewayError::ModelNotFound(_)));
    }

    #[test]
    fn classifies_server_error_as_transient() {
        let err = classify_status_error(reqwest::StatusCode::SERVICE_UNAVAILABLE, "oops", "x");
        assert!(err.is_transient());
    }

    #[test]
    fn classifies_client_error_as_permanent() {
        let err = classify_status_error(reqwest::StatusCode::BAD_REQUEST, "bad request", "x");
        assert!(!err.is_transient());
    }
}
