#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::multiple_crate_versions)]

pub mod chat;
pub mod config;
pub mod error;
pub mod protocol;
pub mod session;
pub mod text;
pub mod transport;

pub use chat::{
    Conversation, ConversationMessage, ConversationState, Instructions, LlmEvent, LlmStream,
    Role, Tool, ToolCall, ToolDefinition, ToolLoopOutcome, ToolRegistry,
};
pub use config::{
    EndpointConfig, LlmConfig, PurgeConfig, RecognitionConfig, SynthesisConfig, ToolLoopConfig,
    VoiceConfig,
};
pub use error::{Error, Result};
pub use protocol::{ClientFrame, SAMPLE_RATE, SAMPLES_PER_FRAME, ServerFrame};
pub use session::{
    FrameSink, FrameSource, RecognitionOutcome, RecognitionSession, SessionState,
    SynthesisOutcome, SynthesisSession, Termination,
};
pub use text::{TextSanitizer, WordRechunker, rechunk_to_words};
pub use transport::llm::{OpenAiCompatStream, connect_llm};
pub use transport::ollama::{OllamaStream, is_ollama_server};

use futures::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::tungstenite::protocol::Message;
use transport::ws::WsStream;
use url::Url;

const TRACE_LOG_MAX_BYTES: usize = 256;
const TRACE_TRUNCATE_SUFFIX: &str = "... (truncated)";

/// Low-level client for one duplex speech channel.
///
/// Thread safety: `StreamingClient` is `Send` but not `Sync` because the underlying
/// WebSocket stream is not `Sync`.
#[must_use]
pub struct StreamingClient {
    stream: WsStream,
}

impl StreamingClient {
    /// Connect to a speech endpoint.
    ///
    /// # Errors
    /// Returns an error if the connection fails or the auth header is invalid.
    pub async fn connect(url: &Url, endpoint: &EndpointConfig) -> Result<Self> {
        let stream = transport::ws::connect(url, endpoint).await?;
        Ok(Self { stream })
    }

    /// Send a frame to the endpoint.
    ///
    /// # Errors
    /// Returns an error if the frame is invalid, encoding fails or the WebSocket send fails.
    pub async fn send(&mut self, frame: ClientFrame) -> Result<()> {
        let bytes = prepare_frame(&frame)?;
        tracing::trace!(frame = %describe(&frame), bytes = bytes.len(), "Sending frame");
        self.stream
            .send(Message::Binary(bytes.into()))
            .await
            .map_err(write_error)
    }

    /// Receive the next frame.
    ///
    /// # Errors
    /// Returns [`Error::InvalidFrame`] for an undecodable frame (the channel stays usable)
    /// or a WebSocket error if the connection fails.
    pub async fn next_frame(&mut self) -> Result<Option<ServerFrame>> {
        while let Some(msg) = self.stream.next().await {
            match classify(msg?)? {
                Incoming::Frame(frame) => return Ok(Some(frame)),
                Incoming::Closed => return Ok(None),
                Incoming::Skip => {}
            }
        }
        Ok(None)
    }

    /// Split the client into a sender and a receiver for concurrent usage.
    pub fn split(self) -> (FrameSender, FrameReceiver) {
        let (write, read) = self.stream.split();
        (FrameSender { write }, FrameReceiver { read })
    }
}

enum Incoming {
    Frame(ServerFrame),
    Skip,
    Closed,
}

fn classify(msg: Message) -> Result<Incoming> {
    match msg {
        Message::Binary(bytes) => {
            let frame = protocol::decode_frame(&bytes)?;
            tracing::trace!(kind = frame.kind(), bytes = bytes.len(), "Received frame");
            Ok(Incoming::Frame(frame))
        }
        Message::Text(text) => {
            tracing::debug!(
                "Ignoring text message: {}",
                safe_truncate(&text, TRACE_LOG_MAX_BYTES)
            );
            Ok(Incoming::Skip)
        }
        Message::Close(_) => {
            tracing::info!("WebSocket connection closed by server");
            Ok(Incoming::Closed)
        }
        _ => Ok(Incoming::Skip),
    }
}

/// A write on a channel the peer already closed is reported as [`Error::ConnectionClosed`].
fn write_error(e: WsError) -> Error {
    match e {
        WsError::ConnectionClosed | WsError::AlreadyClosed => Error::ConnectionClosed,
        other => Error::WebSocket(other),
    }
}

fn describe(frame: &ClientFrame) -> String {
    match frame {
        ClientFrame::Text { text } => format!("Text({})", safe_truncate(text, TRACE_LOG_MAX_BYTES)),
        ClientFrame::Eos => "Eos".to_string(),
        ClientFrame::Audio { pcm } => format!("Audio({} samples)", pcm.len()),
        ClientFrame::Marker { id } => format!("Marker({id})"),
    }
}

fn safe_truncate(s: &str, max_bytes: usize) -> std::borrow::Cow<'_, str> {
    if s.len() <= max_bytes {
        return std::borrow::Cow::Borrowed(s);
    }

    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    std::borrow::Cow::Owned(format!(
        "{} {} {} bytes",
        &s[..end],
        TRACE_TRUNCATE_SUFFIX,
        s.len() - end
    ))
}

#[allow(clippy::result_large_err)]
fn prepare_frame(frame: &ClientFrame) -> Result<Vec<u8>> {
    validate_client_frame(frame)?;
    protocol::encode_frame(frame)
}

#[allow(clippy::result_large_err)]
fn validate_client_frame(frame: &ClientFrame) -> Result<()> {
    match frame {
        ClientFrame::Text { text } if text.trim().is_empty() => Err(Error::InvalidFrame(
            "Text frame must carry a non-blank word".to_string(),
        )),
        ClientFrame::Audio { pcm } if pcm.len() != SAMPLES_PER_FRAME => {
            Err(Error::InvalidFrame(format!(
                "Audio frame must hold {SAMPLES_PER_FRAME} samples, got {}",
                pcm.len()
            )))
        }
        ClientFrame::Audio { pcm } if pcm.iter().any(|s| !s.is_finite()) => Err(
            Error::InvalidFrame("Audio frame contains non-finite samples".to_string()),
        ),
        _ => Ok(()),
    }
}

/// The sending half of a split `StreamingClient`.
pub struct FrameSender {
    write: futures::stream::SplitSink<WsStream, Message>,
}

impl FrameSender {
    /// Send a frame.
    ///
    /// # Errors
    /// Returns an error if validation, encoding or sending fails.
    pub async fn send(&mut self, frame: ClientFrame) -> Result<()> {
        let bytes = prepare_frame(&frame)?;
        tracing::trace!(frame = %describe(&frame), bytes = bytes.len(), "Sending frame (split)");
        self.write
            .send(Message::Binary(bytes.into()))
            .await
            .map_err(write_error)
    }

    /// Send a close frame and flush.
    ///
    /// # Errors
    /// Returns an error if the close handshake cannot be written.
    pub async fn close(&mut self) -> Result<()> {
        self.write.close().await?;
        Ok(())
    }
}

/// The receiving half of a split `StreamingClient`.
pub struct FrameReceiver {
    read: futures::stream::SplitStream<WsStream>,
}

impl FrameReceiver {
    /// Receive the next frame; `Ok(None)` once the channel has closed.
    ///
    /// # Errors
    /// Returns [`Error::InvalidFrame`] for an undecodable frame (the channel stays usable)
    /// or a WebSocket error if the connection fails.
    pub async fn next_frame(&mut self) -> Result<Option<ServerFrame>> {
        while let Some(msg) = self.read.next().await {
            match classify(msg?)? {
                Incoming::Frame(frame) => return Ok(Some(frame)),
                Incoming::Closed => return Ok(None),
                Incoming::Skip => {}
            }
        }
        Ok(None)
    }
}
