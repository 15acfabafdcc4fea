//! Native Ollama chat backend (`/api/chat`, newline-delimited JSON).
//!
//! Unlike the OpenAI-compatible endpoint, the native API accepts `think` at the
//! request root and `keep_alive`, so the model stays loaded between turns.

use std::collections::VecDeque;
use std::time::Duration;

use futures::stream::{self, BoxStream, Stream, StreamExt, TryStreamExt};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::io::StreamReader;

use super::llm::{clean_content, http_client};
use crate::chat::{ConversationMessage, LlmEvent, LlmStream, ToolCall, ToolDefinition};
use crate::config::LlmConfig;
use crate::error::{Error, Result};

const DETECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Deserialize)]
struct TagList {
    #[serde(default)]
    models: Vec<TagEntry>,
}

#[derive(Deserialize)]
struct TagEntry {
    name: String,
}

#[derive(Deserialize)]
struct ChatLine {
    message: Option<LineMessage>,
    #[serde(default)]
    done: bool,
    error: Option<String>,
}

#[derive(Deserialize)]
struct LineMessage {
    #[serde(default)]
    content: String,
    tool_calls: Option<Vec<LineToolCall>>,
}

#[derive(Deserialize)]
struct LineToolCall {
    function: LineFunction,
}

#[derive(Deserialize)]
struct LineFunction {
    name: String,
    #[serde(default)]
    arguments: Value,
}

/// Decode one NDJSON line. Returns the events it carries and whether the reply is complete.
fn decode_line(line: &str) -> (Vec<Result<LlmEvent>>, bool) {
    let mut events = Vec::new();
    if line.trim().is_empty() {
        return (events, false);
    }
    let parsed: ChatLine = match serde_json::from_str(line) {
        Ok(parsed) => parsed,
        Err(e) => {
            tracing::warn!("Skipping unparsable chat line: {e}");
            return (events, false);
        }
    };
    if let Some(error) = parsed.error {
        events.push(Err(Error::Llm(error)));
        return (events, true);
    }
    if let Some(message) = parsed.message {
        if let Some(cleaned) = clean_content(&message.content) {
            events.push(Ok(LlmEvent::Content(cleaned)));
        }
        let calls: Vec<ToolCall> = message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|call| ToolCall {
                id: String::new(),
                name: call.function.name,
                arguments: call.function.arguments,
            })
            .collect();
        if !calls.is_empty() {
            tracing::debug!(count = calls.len(), "Model requested tools");
            events.push(Ok(LlmEvent::ToolCalls(calls)));
        }
    }
    (events, parsed.done)
}

struct LineState<S> {
    lines: S,
    ready: VecDeque<Result<LlmEvent>>,
    finished: bool,
}

fn decode_lines<S>(lines: S) -> impl Stream<Item = Result<LlmEvent>>
where
    S: Stream<Item = std::result::Result<String, LinesCodecError>> + Unpin,
{
    let state = LineState {
        lines,
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
            match state.lines.next().await {
                Some(Ok(line)) => {
                    let (events, done) = decode_line(&line);
                    state.ready.extend(events);
                    state.finished = done;
                }
                Some(Err(e)) => {
                    state.finished = true;
                    state
                        .ready
                        .push_back(Err(Error::Llm(format!("chat stream failed: {e}"))));
                }
                None => state.finished = true,
            }
        }
    })
}

/// Message shape of the native API: tool arguments are objects, not JSON text.
fn native_message(message: &ConversationMessage) -> Value {
    let mut value = json!({"role": message.role, "content": message.content});
    if let Some(calls) = &message.tool_calls {
        value["tool_calls"] = calls
            .iter()
            .map(|call| json!({"function": {"name": call.name, "arguments": call.arguments}}))
            .collect();
    }
    value
}

/// Streams completions from Ollama's native chat API.
#[derive(Clone, Debug)]
pub struct OllamaStream {
    client: Client,
    base_url: String,
    model: String,
    temperature: f32,
    think: bool,
}

impl OllamaStream {
    /// Create a backend for an explicit model.
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot be built.
    #[allow(clippy::result_large_err)]
    pub fn new(config: &LlmConfig, model: impl Into<String>) -> Result<Self> {
        Ok(Self {
            client: http_client(config)?,
            base_url: config.server_url.trim_end_matches('/').to_string(),
            model: model.into(),
            temperature: config.temperature,
            think: config.think,
        })
    }

    /// Create a backend for the configured model, or the only model the server has pulled.
    ///
    /// # Errors
    /// Returns an error if the tag list cannot be fetched or does not hold exactly one model.
    pub async fn connect(config: &LlmConfig) -> Result<Self> {
        if let Some(model) = &config.model {
            return Self::new(config, model.clone());
        }
        let mut backend = Self::new(config, String::new())?;
        let mut models = backend.list_models().await?;
        match models.len() {
            0 => return Err(Error::Config("Ollama server has no models".to_string())),
            1 => {}
            n => {
                return Err(Error::Config(format!(
                    "Ollama server has {n} models, set one explicitly"
                )));
            }
        }
        backend.model = models.remove(0);
        tracing::info!(model = %backend.model, "Auto-selected Ollama model");
        Ok(backend)
    }

    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Names of the models pulled on the server (`/api/tags`).
    ///
    /// # Errors
    /// Returns an error if the HTTP request fails.
    pub async fn list_models(&self) -> Result<Vec<String>> {
        let tags: TagList = self
            .client
            .get(format!("{}/api/tags", self.base_url))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }

    fn request_body(&self, messages: &[ConversationMessage], tools: &[ToolDefinition]) -> Value {
        let mut body = json!({
            "model": self.model,
            "messages": messages.iter().map(native_message).collect::<Vec<_>>(),
            "stream": true,
            "keep_alive": -1,
            "options": {"temperature": self.temperature},
        });
        if !self.think {
            body["think"] = Value::Bool(false);
        }
        if !tools.is_empty() {
            body["tools"] = tools.iter().map(ToolDefinition::to_function).collect();
        }
        body
    }

    fn events(
        &self,
        messages: Vec<ConversationMessage>,
        tools: Vec<ToolDefinition>,
    ) -> BoxStream<'_, Result<LlmEvent>> {
        let response = async move {
            let body = self.request_body(&messages, &tools);
            tracing::debug!(
                model = %self.model,
                messages = messages.len(),
                tools = tools.len(),
                "Requesting native completion"
            );
            let res = self
                .client
                .post(format!("{}/api/chat", self.base_url))
                .json(&body)
                .send()
                .await?
                .error_for_status()?;
            let reader = StreamReader::new(Box::pin(
                res.bytes_stream().map_err(std::io::Error::other),
            ));
            Ok::<_, Error>(decode_lines(FramedRead::new(reader, LinesCodec::new())))
        };
        stream::once(response).try_flatten().boxed()
    }
}

impl LlmStream for OllamaStream {
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

/// Whether `server_url` is an Ollama server, judged by its `/api/tags` listing.
pub async fn is_ollama_server(config: &LlmConfig) -> bool {
    let url = format!("{}/api/tags", config.server_url.trim_end_matches('/'));
    let Ok(client) = Client::builder().timeout(DETECT_TIMEOUT).build() else {
        return false;
    };
    let Ok(res) = client.get(url).send().await.and_then(reqwest::Response::error_for_status)
    else {
        return false;
    };
    res.json::<Value>()
        .await
        .is_ok_and(|body| body.get("models").is_some())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn decode_all(chunks: &[&'static str]) -> Vec<Result<LlmEvent>> {
        let body: Vec<std::io::Result<&'static [u8]>> =
            chunks.iter().map(|c| Ok(c.as_bytes())).collect();
        let reader = StreamReader::new(stream::iter(body));
        decode_lines(FramedRead::new(reader, LinesCodec::new()))
            .collect()
            .await
    }

    fn contents(events: Vec<Result<LlmEvent>>) -> Vec<LlmEvent> {
        events.into_iter().map(Result::unwrap).collect()
    }

    #[tokio::test]
    async fn lines_split_anywhere_are_decoded_until_done() {
        let events = decode_all(&[
            "{\"message\":{\"role\":\"assistant\",\"content\":\"Hel",
            "lo\"},\"done\":false}\n\n{\"message\":{\"content\":\" there 😀\"},\"done\":false}\n",
            "{\"message\":{\"content\":\"\"},\"done\":true}\n",
            "{\"message\":{\"content\":\"late\"},\"done\":false}\n",
        ])
        .await;
        assert_eq!(
            contents(events),
            vec![LlmEvent::Content("Hello".into()), LlmEvent::Content(" there ".into())]
        );
    }

    #[tokio::test]
    async fn unterminated_last_line_and_garbage() {
        let events = decode_all(&["not json\n", "{\"message\":{\"content\":\"ok\"}}"]).await;
        assert_eq!(contents(events), vec![LlmEvent::Content("ok".into())]);
    }

    #[tokio::test]
    async fn tool_calls_arrive_as_one_batch() {
        let events = decode_all(&[
            "{\"message\":{\"content\":\"\",\"tool_calls\":[{\"function\":{\"name\":\"calculate\",\"arguments\":{\"expression\":\"2+2\"}}}]},\"done\":false}\n",
        ])
        .await;
        let events = contents(events);
        let [LlmEvent::ToolCalls(calls)] = events.as_slice() else {
            panic!("expected one tool batch, got {events:?}");
        };
        assert_eq!(calls[0].name, "calculate");
        assert_eq!(calls[0].arguments, json!({"expression": "2+2"}));
        assert!(calls[0].id.is_empty());
    }

    #[tokio::test]
    async fn server_error_ends_stream() {
        let events = decode_all(&["{\"error\":\"model 'x' not found\"}\n"]).await;
        assert!(matches!(events.as_slice(), [Err(Error::Llm(msg))] if msg.contains("not found")));
    }

    #[test]
    fn request_body_uses_native_options() {
        let backend = OllamaStream::new(&LlmConfig::default().temperature(0.5), "qwen3").unwrap();
        let request = ConversationMessage::tool_request(vec![ToolCall::from_raw(
            "c1",
            "calculate",
            "{\"expression\":\"1+1\"}",
        )]);
        let body = backend.request_body(&[ConversationMessage::user("hi"), request], &[]);
        assert_eq!(body["model"], "qwen3");
        assert_eq!(body["keep_alive"], -1);
        assert_eq!(body["options"]["temperature"], 0.5);
        assert_eq!(body["think"], false);
        assert!(body.get("tools").is_none());
        assert_eq!(body["messages"][0], json!({"role": "user", "content": "hi"}));
        assert_eq!(
            body["messages"][1]["tool_calls"][0]["function"]["arguments"],
            json!({"expression": "1+1"})
        );
    }

    #[test]
    fn thinking_flag_is_omitted_when_enabled() {
        let config = LlmConfig {
            think: true,
            ..LlmConfig::default()
        };
        let backend = OllamaStream::new(&config, "qwen3").unwrap();
        assert!(backend.request_body(&[], &[]).get("think").is_none());
    }

    #[tokio::test]
    async fn unreachable_server_is_not_ollama() {
        let config = LlmConfig {
            server_url: "http://127.0.0.1:9".to_string(),
            ..LlmConfig::default()
        };
        assert!(!is_ollama_server(&config).await);
    }
}
