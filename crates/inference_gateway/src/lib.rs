//! [`pipeline_domain::LlmGateway`] implementations used by the Responder
//! (§4.2, §6). `OpenAiCompatibleLlmGateway` talks to any provider
//! implementing the OpenAI chat-completions shape (vLLM, Ollama's
//! OpenAI-compat endpoint, OpenAI itself) — the non-streaming subset of
//! the teacher's `inference_providers::OpenAiCompatibleBackend`, since the
//! Responder only ever needs one completion string, never a token stream.
//! `MockLlmGateway` is the offline stand-in used in stage tests, grounded
//! on the teacher's `inference_providers::mock::MockProvider`.

mod mock;
mod openai_compatible;

pub use mock::MockLlmGateway;
pub use openai_compatible::OpenAiCompatibleLlmGateway;
