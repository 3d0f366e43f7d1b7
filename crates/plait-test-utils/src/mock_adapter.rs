use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::{self, BoxStream, StreamExt};

use plait_core::error::{PlaitError, Result};
use plait_core::traits::ProviderAdapter;
use plait_core::types::{CompletionRequest, CompletionResponse, FinishReason, StreamChunk};

/// One scripted adapter reply.
#[derive(Debug, Clone)]
pub struct ScriptedResponse {
    pub chunks: Vec<String>,
    /// Content reported with the final `Done` chunk. Defaults to the
    /// concatenated chunks.
    pub final_content: Option<String>,
    pub report_final: bool,
    /// Fail the request before any stream is returned.
    pub request_error: Option<String>,
    /// Fail the stream after this many deltas.
    pub stream_error: Option<(usize, String)>,
}

impl ScriptedResponse {
    /// Stream `text` as a few word-sized deltas.
    pub fn text(text: impl Into<String>) -> Self {
        let text = text.into();
        let mut chunks = Vec::new();
        let mut current = String::new();
        for c in text.chars() {
            current.push(c);
            if c == ' ' {
                chunks.push(std::mem::take(&mut current));
            }
        }
        if !current.is_empty() {
            chunks.push(current);
        }
        Self::chunks(chunks)
    }

    pub fn chunks<S: Into<String>>(chunks: impl IntoIterator<Item = S>) -> Self {
        Self {
            chunks: chunks.into_iter().map(Into::into).collect(),
            final_content: None,
            report_final: true,
            request_error: None,
            stream_error: None,
        }
    }

    pub fn request_error(message: impl Into<String>) -> Self {
        Self {
            request_error: Some(message.into()),
            ..Self::chunks(Vec::<String>::new())
        }
    }

    /// Report a final message that differs from the streamed deltas.
    pub fn with_final(mut self, content: impl Into<String>) -> Self {
        self.final_content = Some(content.into());
        self
    }

    /// End the stream without final content.
    pub fn without_final(mut self) -> Self {
        self.report_final = false;
        self
    }

    pub fn with_stream_error(mut self, after: usize, message: impl Into<String>) -> Self {
        self.stream_error = Some((after, message.into()));
        self
    }
}

/// Scripted [`ProviderAdapter`] for tests.
///
/// Replies are consumed in order; once the script runs out every call gets
/// the default reply. Every request is recorded.
pub struct MockAdapter {
    script: Mutex<VecDeque<ScriptedResponse>>,
    default_response: ScriptedResponse,
    chunk_delay: Duration,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl Default for MockAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl MockAdapter {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            default_response: ScriptedResponse::text("mock response"),
            chunk_delay: Duration::ZERO,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn with_response(self, response: ScriptedResponse) -> Self {
        self.script.lock().unwrap().push_back(response);
        self
    }

    pub fn with_responses(self, responses: impl IntoIterator<Item = ScriptedResponse>) -> Self {
        self.script.lock().unwrap().extend(responses);
        self
    }

    pub fn with_default(mut self, response: ScriptedResponse) -> Self {
        self.default_response = response;
        self
    }

    /// Sleep before each chunk. The sleep ends early on cancellation.
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

impl ProviderAdapter for MockAdapter {
    fn complete_stream(
        &self,
        request: CompletionRequest,
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<StreamChunk>>>> {
        Box::pin(async move {
            let signal = request.signal.clone();
            self.requests.lock().unwrap().push(request);
            let response = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| self.default_response.clone());

            if let Some(message) = response.request_error {
                return Err(PlaitError::Provider(message));
            }

            let joined = response.chunks.concat();
            let mut items: Vec<Result<StreamChunk>> = response
                .chunks
                .into_iter()
                .map(|c| Ok(StreamChunk::Delta(c)))
                .collect();
            match response.stream_error {
                Some((after, message)) => {
                    items.truncate(after);
                    items.push(Err(PlaitError::ProviderStream(message)));
                }
                None => {
                    let content = if response.report_final {
                        Some(response.final_content.unwrap_or(joined))
                    } else {
                        None
                    };
                    items.push(Ok(StreamChunk::Done(CompletionResponse {
                        content,
                        finish_reason: FinishReason::Stop,
                    })));
                }
            }

            let delay = self.chunk_delay;
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
