use crate::schema::{CanonicalRequest, ChatCompletion, EmbeddingRequest, ResponseFragment};
use crate::upstream::UpstreamCallError;
use async_trait::async_trait;
use futures_util::Stream;
use serde_json::Value;
use std::pin::Pin;

pub type FragmentStream =
    Pin<Box<dyn Stream<Item = Result<ResponseFragment, UpstreamCallError>> + Send>>;

/// The downstream model-invocation layer. Implementations return provider
/// answers already shaped as OpenAI chat completions or fragments of one.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn chat(&self, req: &CanonicalRequest) -> Result<ChatCompletion, UpstreamCallError>;

    /// Opens a streamed completion. The returned stream yields fragments in
    /// arrival order and ends when the provider is done.
    async fn chat_stream(
        &self,
        req: &CanonicalRequest,
    ) -> Result<FragmentStream, UpstreamCallError>;

    async fn embeddings(&self, req: &EmbeddingRequest) -> Result<Value, UpstreamCallError>;
}
