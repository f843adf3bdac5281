use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use pipeline_domain::ports::{GenerateOptions, LlmGateway, LlmGatewayError};

/// Offline stand-in for a real LLM provider, used by stage tests and local
/// development without network access. Grounded on the teacher's
/// `inference_providers::mock::MockProvider` request/response recording
/// idea, trimmed to the single non-streaming contract this gateway needs.
pub struct MockLlmGateway {
    fixed_response: Option<String>,
    calls: Mutex<Vec<String>>,
    fail_next: AtomicUsize,
}

impl MockLlmGateway {
    pub fn new() -> Self {
        Self { fixed_response: None, calls: Mutex::new(Vec::new()), fail_next: AtomicUsize::new(0) }
    }

    pub fn with_fixed_response(response: impl Into<String>) -> Self {
        Self { fixed_response: Some(response.into()), ..Self::new() }
    }

    /// The next `n` calls to `generate` return a transient timeout error,
    /// for exercising retry/dead-letter behavior in stage tests.
    pub fn fail_next_calls(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn recorded_prompts(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl Default for MockLlmGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl LlmGateway for MockLlmGateway {
    async fn generate(&self, prompt: &str, _options: &GenerateOptions) -> Result<String, LlmGatewayError> {
        self.calls.lock().unwrap().push(prompt.to_string());

        let remaining = self.fail_next.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_next.store(remaining - 1, Ordering::SeqCst);
            return Err(LlmGatewayError::Timeout);
        }

        if let Some(response) = &self.fixed_response {
            return Ok(response.clone());
        }

        Ok(format!("Mock answer to: {prompt}"))
    }

    async fn health(&self) -> Result<(), LlmGatewayError> {
        Ok(())
    }

    async fn list_models(&self) -> Result<Vec<String>, LlmGatewayError> {
        Ok(vec!["mock-model".to_string()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts() -> GenerateOptions {
        GenerateOptions { model: "mock-model".to_string(), temperature: 0.7, max_tokens: 100, stop: vec![] }
    }

    #[tokio::test]
    async fn returns_fixed_response_when_configured() {
        let gateway = MockLlmGateway::with_fixed_response("fixed");
        let out = gateway.generate("hi", &opts()).await.unwrap();
        assert_eq!(out, "fixed");
    }

    #[tokio::test]
    async fn fail_next_calls_injects_transient_errors() {
        let gateway = MockLlmGateway::new();
        gateway.fail_next_calls(2);
        assert!(gateway.generate("q", &opts()).await.is_err());
        assert!(gateway.generate("q", &opts()).await.is_err());
        assert!(gateway.generate("q", &opts()).await.is_ok());
    }

    #[tokio::test]
    async fn records_prompts() {
        let gateway = MockLlmGateway::new();
        gateway.generate("first", &opts()).await.unwrap();
        gateway.generate("second", &opts()).await.unwrap();
        assert_eq!(gateway.recorded_prompts(), vec!["first", "second"]);
    }
}
