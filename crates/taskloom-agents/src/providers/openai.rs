use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use taskloom_common::{Error, Result};
use tracing::{debug, warn};

use crate::providers::{ChatRole, ChunkFeed, LlmProvider, LlmRequest, chunk_feed_from_deltas};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Streaming client for OpenAI-compatible chat completion APIs.
#[derive(Clone)]
pub struct OpenAiProvider {
    client: Client,
    api_key: String,
    base_url: String,
}

impl OpenAiProvider {
    pub fn new(api_key: String, base_url: Option<String>) -> Self {
        let base_url = base_url
            .map(|url| url.trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        Self {
            client: Client::new(),
            api_key,
            base_url,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn convert_request(&self, request: &LlmRequest) -> OpenAiRequest {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if let Some(system) = &request.system {
            messages.push(OpenAiMessage {
                role: "system",
                content: system.clone(),
            });
        }
        for message in &request.messages {
            let role = match message.role {
                ChatRole::System => "system",
                ChatRole::User => "user",
                ChatRole::Assistant => "assistant",
            };
            messages.push(OpenAiMessage {
                role,
                content: message.content.clone(),
            });
        }
        OpenAiRequest {
            model: request.model.clone(),
            messages,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            stream: true,
        }
    }
}

fn status_error(status: StatusCode, body: &str) -> Error {
    let detail = body.trim();
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Error::Authentication(format!(
            "OpenAI API rejected the credentials (status={}): {detail}",
            status.as_u16()
        )),
        _ => Error::Provider(format!(
            "OpenAI API error (status={}): {detail}",
            status.as_u16()
        )),
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn provider_id(&self) -> &str {
        "openai"
    }

    async fn stream(&self, request: &LlmRequest) -> Result<ChunkFeed> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.convert_request(request);
        debug!(model = %body.model, messages = body.messages.len(), "starting completion stream");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Provider(format!("OpenAI request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(status_error(status, &text));
        }

        let deltas = SseParser::new(response.bytes_stream()).boxed();
        Ok(chunk_feed_from_deltas(deltas))
    }

    async fn health_check(&self) -> Result<bool> {
        let url = format!("{}/models", self.base_url);
        let response = self.client.get(&url).bearer_auth(&self.api_key).send().await;

        match response {
            Ok(resp) => Ok(resp.status().is_success()),
            Err(e) => {
                warn!("OpenAI health check failed: {e}");
                Ok(false)
            }
        }
    }
}

#[derive(Serialize)]
struct OpenAiRequest {
    model: String,
    messages: Vec<OpenAiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    stream: bool,
}

#[derive(Serialize)]
struct OpenAiMessage {
    role: &'static str,
    content: String,
}

#[derive(Deserialize)]
struct OpenAiStreamChunk {
    #[serde(default)]
    choices: Vec<OpenAiStreamChoice>,
    error: Option<OpenAiStreamError>,
}

#[derive(Deserialize)]
struct OpenAiStreamChoice {
    delta: OpenAiStreamDelta,
}

#[derive(Deserialize)]
struct OpenAiStreamDelta {
    content: Option<String>,
}

#[derive(Deserialize)]
struct OpenAiStreamError {
    message: String,
}

/// Splits a server-sent event byte stream into content deltas.
struct SseParser {
    stream: Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>,
    buffer: Vec<u8>,
    queue: VecDeque<Result<String>>,
    done: bool,
}

impl SseParser {
    fn new(stream: impl Stream<Item = reqwest::Result<Bytes>> + Send + 'static) -> Self {
        Self {
            stream: Box::pin(stream),
            buffer: Vec::new(),
            queue: VecDeque::new(),
            done: false,
        }
    }

    fn next_event(&mut self) -> Option<Vec<u8>> {
        let (pos, len) = if let Some(p) = self.buffer.windows(2).position(|w| w == b"\n\n") {
            (p, 2)
        } else if let Some(p) = self.buffer.windows(4).position(|w| w == b"\r\n\r\n") {
            (p, 4)
        } else {
            return None;
        };
        let event = self.buffer.drain(..pos).collect();
        self.buffer.drain(..len);
        Some(event)
    }

    fn handle_event(&mut self, event: &[u8]) {
        let text = String::from_utf8_lossy(event);
        for line in text.lines() {
            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };
            let data = data.trim();
            if data == "[DONE]" {
                self.done = true;
                return;
            }
            match serde_json::from_str::<OpenAiStreamChunk>(data) {
                Ok(chunk) => {
                    if let Some(error) = chunk.error {
                        self.queue.push_back(Err(Error::Provider(format!(
                            "OpenAI stream error: {}",
                            error.message
                        ))));
                        self.done = true;
                        return;
                    }
                    for choice in chunk.choices {
                        if let Some(content) = choice.delta.content
                            && !content.is_empty()
                        {
                            self.queue.push_back(Ok(content));
                        }
                    }
                }
                Err(e) => {
                    self.queue.push_back(Err(Error::Serialization(format!(
                        "invalid stream chunk: {e}"
                    ))));
                    self.done = true;
                    return;
                }
            }
        }
    }
}

impl Stream for SseParser {
    type Item = Result<String>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if let Some(item) = self.queue.pop_front() {
                return Poll::Ready(Some(item));
            }
            if self.done {
                return Poll::Ready(None);
            }

            match self.stream.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    self.buffer.extend_from_slice(&bytes);
                    while !self.done
                        && let Some(event) = self.next_event()
                    {
                        self.handle_event(&event);
                    }
                }
                Poll::Ready(Some(Err(e))) => {
                    self.done = true;
                    return Poll::Ready(Some(Err(Error::Provider(format!(
                        "stream interrupted: {e}"
                    )))));
                }
                Poll::Ready(None) => {
                    let rest = std::mem::take(&mut self.buffer);
                    if !rest.is_empty() {
                        self.handle_event(&rest);
                    }
                    self.done = true;
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
