use std::collections::VecDeque;
use std::time::Duration;

use eventsource_stream::{Event, EventStreamError, Eventsource};
use futures::stream::{self, BoxStream, Stream, StreamExt, TryStreamExt};
use reqwest::Client;
use reqwest::header::{AUTHORIZATION, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ollama::{OllamaStream, is_ollama_server};
use crate::chat::{ConversationMessage, LlmEvent, LlmStream, ToolCall, ToolDefinition};
use crate::config::LlmConfig;
use crate::error::{Error, Result};
use crate::text::strip_emoji;

const DEFAULT_POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ConversationMessage],
    stream: bool,
    temperature: f32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    think: Option<bool>,
}

#[derive(Deserialize)]
struct ModelList {
    #[serde(default)]
    data: Vec<ModelEntry>,
}

#[derive(Deserialize)]
struct ModelEntry {
    id: String,
}

#[derive(Deserialize)]
struct ChunkPayload {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    error: Option<Value>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: Option<ChunkDelta>,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Default)]
struct ChunkDelta {
    content: Option<String>,
    tool_calls: Option<Vec<ToolCallFragment>>,
}

#[derive(Deserialize)]
struct ToolCallFragment {
    #[serde(default)]
    index: usize,
    id: Option<String>,
    function: Option<FunctionFragment>,
}

#[derive(Deserialize)]
struct FunctionFragment {
    name: Option<String>,
    arguments: Option<String>,
}

/// In-progress tool call being assembled from streamed fragments.
#[derive(Default)]
struct PendingToolCall {
    id: String,
    name: String,
    arguments: String,
}

/// Turns the `data` payloads of a streamed chat completion into [`LlmEvent`]s.
#[derive(Default)]
pub(crate) struct ChunkDecoder {
    pending: Vec<PendingToolCall>,
    done: bool,
}

impl ChunkDecoder {
    /// Decode the data of one server-sent event.
    pub(crate) fn decode(&mut self, data: &str) -> Vec<Result<LlmEvent>> {
        let mut events = Vec::new();
        let data = data.trim();
        if self.done || data.is_empty() {
            return events;
        }
        if data == "[DONE]" {
            self.done = true;
            self.flush_tool_calls(&mut events);
            return events;
        }

        let chunk: ChunkPayload = match serde_json::from_str(data) {
            Ok(chunk) => chunk,
            Err(e) => {
                tracing::warn!("Skipping unparsable completion chunk: {e}");
                return events;
            }
        };
        if let Some(error) = chunk.error {
            events.push(Err(Error::Llm(error.to_string())));
            return events;
        }

        for choice in chunk.choices {
            let delta = choice.delta.unwrap_or_default();
            if let Some(content) = delta.content.filter(|c| !c.is_empty()) {
                if let Some(cleaned) = clean_content(&content) {
                    events.push(Ok(LlmEvent::Content(cleaned)));
                }
            }
            for fragment in delta.tool_calls.unwrap_or_default() {
                self.accumulate(fragment);
            }
            if choice.finish_reason.as_deref() == Some("tool_calls") {
                self.flush_tool_calls(&mut events);
            }
        }
        events
    }

    /// Flush tool calls still pending when the body ends without `[DONE]`.
    pub(crate) fn finish(&mut self) -> Vec<Result<LlmEvent>> {
        let mut events = Vec::new();
        self.flush_tool_calls(&mut events);
        events
    }

    pub(crate) const fn is_done(&self) -> bool {
        self.done
    }

    fn accumulate(&mut self, fragment: ToolCallFragment) {
        if fragment.index >= self.pending.len() {
            self.pending
                .resize_with(fragment.index + 1, PendingToolCall::default);
        }
        let pending = &mut self.pending[fragment.index];
        if let Some(id) = fragment.id {
            pending.id = id;
        }
        if let Some(function) = fragment.function {
            if let Some(name) = function.name {
                pending.name.push_str(&name);
            }
            if let Some(arguments) = function.arguments {
                pending.arguments.push_str(&arguments);
            }
        }
    }

    fn flush_tool_calls(&mut self, events: &mut Vec<Result<LlmEvent>>) {
        let calls: Vec<ToolCall> = self
            .pending
            .drain(..)
            .filter(|p| !p.name.is_empty())
            .map(|p| ToolCall::from_raw(p.id, p.name, &p.arguments))
            .collect();
        if !calls.is_empty() {
            tracing::debug!(count = calls.len(), "Model requested tools");
            events.push(Ok(LlmEvent::ToolCalls(calls)));
        }
    }
}

/// Strip emoji from a content delta; `None` if nothing speakable is left.
pub(crate) fn clean_content(content: &str) -> Option<String> {
    let cleaned = strip_emoji(content);
    if cleaned != content {
        tracing::debug!(raw = %content, %cleaned, "Removed emoji from completion");
    }
    (!cleaned.is_empty()).then_some(cleaned)
}

struct EventState<S> {
    events: S,
    decoder: ChunkDecoder,
    ready: VecDeque<Result<LlmEvent>>,
    finished: bool,
}

/// Adapt a server-sent event stream into completion events.
fn decode_events<S, E>(events: S) -> impl Stream<Item = Result<LlmEvent>>
where
    S: Stream<Item = std::result::Result<Event, EventStreamError<E>>> + Unpin,
    E: std::fmt::Display,
{
    let state = EventState {
        events,
        decoder: ChunkDecoder::default(),
        ready: VecDeque::new(),
        finished: false,
    };
    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(event) = state.ready.pop_front() {
                return Some((event, state));
            }
            if state.finished {
                return None;
            }
            match state.events.next().await {
                Some(Ok(event)) => {
                    tracing::trace!(data = %event.data, "Completion event");
                    state.ready.extend(state.decoder.decode(&event.data));
                    state.finished = state.decoder.is_done();
                }
                Some(Err(e)) => {
                    state.finished = true;
                    state
                        .ready
                        .push_back(Err(Error::Llm(format!("completion stream failed: {e}"))));
                }
                None => {
                    state.finished = true;
                    state.ready.extend(state.decoder.finish());
                }
            }
        }
    })
}

/// Build the HTTP client shared by the completion backends.
#[allow(clippy::result_large_err)]
pub(crate) fn http_client(config: &LlmConfig) -> Result<Client> {
    Ok(Client::builder()
        .connect_timeout(config.timeout)
        .pool_idle_timeout(DEFAULT_POOL_IDLE_TIMEOUT)
        .build()?)
}

/// Streams completions from an OpenAI-compatible `/v1/chat/completions` server.
#[derive(Clone, Debug)]
pub struct OpenAiCompatStream {
    client: Client,
    auth_header: HeaderValue,
    base_url: String,
    model: String,
    temperature: f32,
    think: bool,
}

impl OpenAiCompatStream {
    /// Create a backend for an explicit model.
    ///
    /// # Errors
    /// Returns an error if the API key results in an invalid header or client build fails.
    #[allow(clippy::result_large_err)]
    pub fn new(config: &LlmConfig, model: impl Into<String>) -> Result<Self> {
        let client = http_client(config)?;
        let auth_header = HeaderValue::from_str(&format!("Bearer {}", config.api_key))?;

        Ok(Self {
            client,
            auth_header,
            base_url: config.server_url.trim_end_matches('/').to_string(),
            model: model.into(),
            temperature: config.temperature,
            think: config.think,
        })
    }

    /// Create a backend for the configured model, or the only model the server serves.
    ///
    /// # Errors
    /// Returns an error if no model is configured and the server does not serve exactly one.
    pub async fn connect(config: &LlmConfig) -> Result<Self> {
        if let Some(model) = &config.model {
            return Self::new(config, model.clone());
        }
        let mut backend = Self::new(config, String::new())?;
        let mut models = backend.list_models().await?;
        if models.len() != 1 {
            return Err(Error::Config(format!(
                "server offers {} models, set one explicitly",
                models.len()
            )));
        }
        backend.model = models.remove(0);
        tracing::info!(model = %backend.model, "Auto-selected model");
        Ok(backend)
    }

    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }

    /// List the model ids the server offers.
    ///
    /// # Errors
    /// Returns an error if the HTTP request fails.
    pub async fn list_models(&self) -> Result<Vec<String>> {
        let res = self
            .client
            .get(format!("{}/v1/models", self.base_url))
            .header(AUTHORIZATION, &self.auth_header)
            .send()
            .await?
            .error_for_status()?;
        let list: ModelList = res.json().await?;
        Ok(list.data.into_iter().map(|m| m.id).collect())
    }

    fn request_body(&self, messages: &[ConversationMessage], tools: &[ToolDefinition]) -> Result<Value> {
        let request = ChatRequest {
            model: &self.model,
            messages,
            stream: true,
            temperature: self.temperature,
            tools: tools.iter().map(ToolDefinition::to_function).collect(),
            think: (!self.think).then_some(false),
        };
        Ok(serde_json::to_value(request)?)
    }

    fn events(
        &self,
        messages: Vec<ConversationMessage>,
        tools: Vec<ToolDefinition>,
    ) -> BoxStream<'_, Result<LlmEvent>> {
        let response = async move {
            let body = self.request_body(&messages, &tools)?;
            tracing::debug!(
                model = %self.model,
                messages = messages.len(),
                tools = tools.len(),
                "Requesting completion"
            );
            let res = self
                .client
                .post(format!("{}/v1/chat/completions", self.base_url))
                .header(AUTHORIZATION, &self.auth_header)
                .json(&body)
                .send()
                .await?
                .error_for_status()?;
            Ok::<_, Error>(decode_events(Box::pin(res.bytes_stream().eventsource())))
        };
        stream::once(response).try_flatten().boxed()
    }
}

impl LlmStream for OpenAiCompatStream {
    fn chat_completion(&self, messages: Vec<ConversationMessage>) -> BoxStream<'_, Result<String>> {
        self.events(messages, Vec::new())
            .try_filter_map(|event| async move {
                Ok(match event {
                    LlmEvent::Content(text) => Some(text),
                    LlmEvent::ToolCalls(_) => None,
                })
            })
            .boxed()
    }

    fn chat_completion_with_tools(
        &self,
        messages: Vec<ConversationMessage>,
        tools: Vec<ToolDefinition>,
    ) -> BoxStream<'_, Result<LlmEvent>> {
        self.events(messages, tools)
    }
}

/// Connect the backend that fits `config.server_url`: the native Ollama API when
/// the server answers `/api/tags`, the OpenAI-compatible API otherwise.
///
/// # Errors
/// Returns an error if the chosen backend cannot be created.
pub async fn connect_llm(config: &LlmConfig) -> Result<Box<dyn LlmStream>> {
    if is_ollama_server(config).await {
        let backend = OllamaStream::connect(config).await?;
        tracing::info!(backend = "ollama", model = %backend.model(), "LLM backend selected");
        Ok(Box::new(backend))
    } else {
        let backend = OpenAiCompatStream::connect(config).await?;
        tracing::info!(backend = "openai", model = %backend.model(), "LLM backend selected");
        Ok(Box::new(backend))
    }
}
