use crate::config::ModelConfig;
use crate::history::Turn;
use crate::openai::OpenAiBackend;
use async_trait::async_trait;
use parley_core::ParleyResult;
use std::sync::Arc;

/// Produces the automated reply for one conversation turn.
///
/// To add a provider with a different wire format, implement this trait
/// and select it in [`backend_from_config`].
#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// `system` carries the persona and the active training content;
    /// `history` is oldest first and excludes `user_message`.
    async fn complete(
        &self,
        system: &str,
        history: &[Turn],
        user_message: &str,
    ) -> ParleyResult<String>;
}

/// Every supported provider speaks the OpenAI chat completions API.
pub fn backend_from_config(config: ModelConfig) -> ParleyResult<Arc<dyn LlmBackend>> {
    config.validate()?;
    Ok(Arc::new(OpenAiBackend::new(config)?))
}
