use std::collections::VecDeque;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::{self, BoxStream, StreamExt};
use tracing::debug;

use plait_core::error::{PlaitError, Result};
use plait_core::traits::ProviderAdapter;
use plait_core::types::{CompletionRequest, CompletionResponse, FinishReason, Role, StreamChunk};

/// Offline provider that replays canned replies.
///
/// Replies are consumed in order. Once they run out, the adapter echoes the
/// last user message back. Each reply streams word by word.
pub struct CannedAdapter {
    replies: Mutex<VecDeque<String>>,
    delay: Duration,
}

impl CannedAdapter {
    pub fn new(replies: impl IntoIterator<Item = String>, delay: Duration) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().collect()),
            delay,
        }
    }

    /// Load replies from a JSON array of strings.
    pub fn from_file(path: &Path, delay: Duration) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let replies: Vec<String> = serde_json::from_str(&content)
            .map_err(|e| anyhow::anyhow!("{}: expected a JSON array of strings: {e}", path.display()))?;
        Ok(Self::new(replies, delay))
    }

    fn next_reply(&self, request: &CompletionRequest) -> String {
        let canned = self
            .replies
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .pop_front();
        canned.unwrap_or_else(|| {
            request
                .messages
                .iter()
                .rev()
                .find(|m| m.role == Role::User)
                .map(|m| m.content.clone())
                .unwrap_or_default()
        })
    }
}

impl ProviderAdapter for CannedAdapter {
    fn complete_stream(
        &self,
        request: CompletionRequest,
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<StreamChunk>>>> {
        Box::pin(async move {
            let reply = self.next_reply(&request);
            debug!(model = %request.model, chars = reply.len(), "Canned reply");

            let mut items: Vec<Result<StreamChunk>> = reply
                .split_inclusive(' ')
                .map(|word| Ok(StreamChunk::Delta(word.to_string())))
                .collect();
            items.push(Ok(StreamChunk::Done(CompletionResponse {
                content: Some(reply),
                finish_reason: FinishReason::Stop,
            })));

            let delay = self.delay;
            let signal = request.signal;
            let stream = stream::iter(items).then(move |item| {
                let signal = signal.clone();
                async move {
                    if !delay.is_zero() {
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = signal.cancelled() => return Err(PlaitError::Cancelled),
                        }
                    }
                    item
                }
            });
            Ok(stream.boxed())
        })
    }
}
