//! Endpoint, session and model configuration.
//!
//! Every struct has sensible defaults matching a local speech server; use the
//! chained setters or [`VoiceConfig::from_env`] to override them.

use std::time::Duration;

use url::Url;

use crate::{Error, Result};

const DEFAULT_SPEECH_URL: &str = "ws://localhost:8080";
const DEFAULT_LLM_URL: &str = "http://localhost:11434";
const DEFAULT_API_KEY: &str = "public_token";
const DEFAULT_AUTH_HEADER: &str = "kyutai-api-key";

/// Where a duplex speech endpoint lives and how to authenticate against it.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    pub base_url: String,
    pub api_key: String,
    pub auth_header: String,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_SPEECH_URL.to_string(),
            api_key: DEFAULT_API_KEY.to_string(),
            auth_header: DEFAULT_AUTH_HEADER.to_string(),
        }
    }
}

impl EndpointConfig {
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = key.into();
        self
    }

    #[must_use]
    pub fn auth_header(mut self, header: impl Into<String>) -> Self {
        self.auth_header = header.into();
        self
    }

    /// Build the websocket URL for `path` with the given query parameters.
    ///
    /// # Errors
    /// Returns an error if the base URL does not parse.
    #[allow(clippy::result_large_err)]
    pub fn url(&self, path: &str, query: &[(&str, String)]) -> Result<Url> {
        let mut url = Url::parse(self.base_url.trim_end_matches('/'))?.join(path)?;
        if !query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in query {
                pairs.append_pair(key, value);
            }
        }
        Ok(url)
    }
}

/// Bounds for discarding residual frames left by a previous use of the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PurgeConfig {
    pub max_frames: usize,
    pub read_timeout: Duration,
}

impl Default for PurgeConfig {
    fn default() -> Self {
        Self {
            max_frames: 10,
            read_timeout: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SynthesisConfig {
    pub path: String,
    pub voice: Option<String>,
    pub format: String,
    pub cfg_alpha: f32,
    /// Delay between words, mimicking real-time LLM output.
    pub word_delay: Duration,
    pub max_frames: usize,
    pub purge: PurgeConfig,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            path: "/api/tts_streaming".to_string(),
            voice: None,
            format: "PcmMessagePack".to_string(),
            cfg_alpha: 1.5,
            word_delay: Duration::from_millis(100),
            max_frames: 500,
            purge: PurgeConfig::default(),
        }
    }
}

impl SynthesisConfig {
    #[must_use]
    pub fn voice(mut self, voice: impl Into<String>) -> Self {
        self.voice = Some(voice.into());
        self
    }

    #[must_use]
    pub const fn word_delay(mut self, delay: Duration) -> Self {
        self.word_delay = delay;
        self
    }

    #[must_use]
    pub const fn max_frames(mut self, max_frames: usize) -> Self {
        self.max_frames = max_frames;
        self
    }

    #[must_use]
    pub const fn purge(mut self, purge: PurgeConfig) -> Self {
        self.purge = purge;
        self
    }

    pub(crate) fn query(&self, api_key: &str) -> Vec<(&'static str, String)> {
        let mut query = vec![
            ("format", self.format.clone()),
            ("auth_id", api_key.to_string()),
            ("cfg_alpha", self.cfg_alpha.to_string()),
        ];
        if let Some(voice) = &self.voice {
            query.push(("voice", voice.clone()));
        }
        query
    }
}

#[derive(Debug, Clone)]
pub struct RecognitionConfig {
    pub path: String,
    /// Id of the marker frame that closes the stream once echoed back.
    pub marker_id: i64,
    /// All-zero frames sent after the marker to flush the recognizer.
    pub silence_frames: usize,
    pub silence_delay: Duration,
    /// Pace audio at real time (one frame per frame duration).
    pub realtime: bool,
    pub max_frames: usize,
    pub purge: PurgeConfig,
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            path: "/api/asr-streaming".to_string(),
            marker_id: 999,
            silence_frames: 25,
            silence_delay: Duration::from_millis(10),
            realtime: true,
            max_frames: 10_000,
            purge: PurgeConfig::default(),
        }
    }
}

impl RecognitionConfig {
    #[must_use]
    pub const fn marker_id(mut self, id: i64) -> Self {
        self.marker_id = id;
        self
    }

    #[must_use]
    pub const fn silence_frames(mut self, count: usize) -> Self {
        self.silence_frames = count;
        self
    }

    #[must_use]
    pub const fn realtime(mut self, realtime: bool) -> Self {
        self.realtime = realtime;
        self
    }

    #[must_use]
    pub const fn max_frames(mut self, max_frames: usize) -> Self {
        self.max_frames = max_frames;
        self
    }

    #[must_use]
    pub const fn purge(mut self, purge: PurgeConfig) -> Self {
        self.purge = purge;
        self
    }
}

/// OpenAI-compatible chat completion server.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub server_url: String,
    pub api_key: String,
    /// `None` selects the only model the server serves.
    pub model: Option<String>,
    pub temperature: f32,
    /// Allow "thinking" output on servers that support the switch.
    pub think: bool,
    pub timeout: Duration,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_LLM_URL.to_string(),
            api_key: "EMPTY".to_string(),
            model: None,
            temperature: 1.0,
            think: false,
            timeout: Duration::from_secs(60),
        }
    }
}

impl LlmConfig {
    #[must_use]
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    #[must_use]
    pub const fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToolLoopConfig {
    pub max_rounds: usize,
}

impl Default for ToolLoopConfig {
    fn default() -> Self {
        Self { max_rounds: 8 }
    }
}

/// Everything needed to run a voice turn.
#[derive(Debug, Clone, Default)]
pub struct VoiceConfig {
    pub stt: EndpointConfig,
    pub tts: EndpointConfig,
    pub synthesis: SynthesisConfig,
    pub recognition: RecognitionConfig,
    pub llm: LlmConfig,
    pub tool_loop: ToolLoopConfig,
}

impl VoiceConfig {
    /// Load configuration from `VOICE_*` environment variables, falling back to defaults.
    ///
    /// # Errors
    /// Returns [`Error::Config`] if a variable holds an unparsable value.
    #[allow(clippy::result_large_err)]
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    #[allow(clippy::result_large_err)]
    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        let api_key = lookup("VOICE_API_KEY");
        if let Some(url) = lookup("VOICE_STT_URL") {
            config.stt.base_url = url;
        }
        if let Some(url) = lookup("VOICE_TTS_URL") {
            config.tts.base_url = url;
        }
        if let Some(key) = api_key {
            config.stt.api_key.clone_from(&key);
            config.tts.api_key = key;
        }
        config.synthesis.voice = lookup("VOICE_TTS_VOICE");
        if let Some(url) = lookup("VOICE_LLM_URL") {
            config.llm.server_url = url;
        }
        if let Some(key) = lookup("VOICE_LLM_API_KEY") {
            config.llm.api_key = key;
        }
        config.llm.model = lookup("VOICE_LLM_MODEL");
        if let Some(raw) = lookup("VOICE_LLM_THINK") {
            config.llm.think = parse_bool("VOICE_LLM_THINK", &raw)?;
        }
        if let Some(raw) = lookup("VOICE_TOOL_MAX_ROUNDS") {
            config.tool_loop.max_rounds = raw
                .trim()
                .parse()
                .map_err(|_| Error::Config(format!("VOICE_TOOL_MAX_ROUNDS: not a number: {raw}")))?;
        }
        Ok(config)
    }
}

#[allow(clippy::result_large_err)]
fn parse_bool(key: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::Config(format!("{key}: expected a boolean, got {raw}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn synthesis_url_carries_query_params() {
        let endpoint = EndpointConfig::new("ws://tts:8080/");
        let config = SynthesisConfig::default().voice("voices/a b.wav");
        let url = endpoint.url(&config.path, &config.query(&endpoint.api_key)).unwrap();
        assert_eq!(url.path(), "/api/tts_streaming");
        let pairs: HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(pairs["format"], "PcmMessagePack");
        assert_eq!(pairs["auth_id"], "public_token");
        assert_eq!(pairs["cfg_alpha"], "1.5");
        assert_eq!(pairs["voice"], "voices/a b.wav");
    }

    #[test]
    fn url_without_query_has_none() {
        let endpoint = EndpointConfig::new("ws://stt:8080");
        let url = endpoint.url("/api/asr-streaming", &[]).unwrap();
        assert_eq!(url.as_str(), "ws://stt:8080/api/asr-streaming");
    }

    #[test]
    fn env_overrides_defaults() {
        let config = VoiceConfig::from_lookup(lookup_from(&[
            ("VOICE_TTS_URL", "wss://example.org"),
            ("VOICE_API_KEY", "secret"),
            ("VOICE_LLM_MODEL", "gemma"),
            ("VOICE_LLM_THINK", "yes"),
            ("VOICE_TOOL_MAX_ROUNDS", "3"),
        ]))
        .unwrap();
        assert_eq!(config.tts.base_url, "wss://example.org");
        assert_eq!(config.stt.base_url, DEFAULT_SPEECH_URL);
        assert_eq!(config.stt.api_key, "secret");
        assert_eq!(config.tts.api_key, "secret");
        assert_eq!(config.llm.model.as_deref(), Some("gemma"));
        assert!(config.llm.think);
        assert_eq!(config.tool_loop.max_rounds, 3);
    }

    #[test]
    fn malformed_bool_is_config_error() {
        let err = VoiceConfig::from_lookup(lookup_from(&[("VOICE_LLM_THINK", "maybe")])).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn defaults_match_local_server() {
        let config = VoiceConfig::default();
        assert_eq!(config.synthesis.max_frames, 500);
        assert_eq!(config.recognition.marker_id, 999);
        assert_eq!(config.recognition.silence_frames, 25);
        assert_eq!(config.synthesis.purge.max_frames, 10);
        assert_eq!(config.tool_loop.max_rounds, 8);
    }
}
