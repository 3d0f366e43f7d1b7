use futures::future::BoxFuture;
use futures::stream::BoxStream;

use crate::error::Result;
use crate::template::Template;
use crate::types::{CompletionRequest, ModelProfile, StreamChunk};

/// A streaming completion source.
///
/// The stream yields `StreamChunk::Delta` items and ends with a single
/// `StreamChunk::Done` carrying the aggregated response. Adapters should
/// stop promptly once `request.signal` is cancelled.
pub trait ProviderAdapter: Send + Sync + 'static {
    fn complete_stream(
        &self,
        request: CompletionRequest,
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<StreamChunk>>>>;
}

/// Loads prompt templates by id.
pub trait TemplateStore: Send + Sync + 'static {
    fn load_template(&self, id: &str) -> BoxFuture<'_, Result<Template>>;
}

/// Loads model profiles by id.
pub trait ProfileStore: Send + Sync + 'static {
    fn load_profile(&self, id: &str) -> BoxFuture<'_, Result<ModelProfile>>;
}
