use std::path::Path;

use futures::stream::{self, Stream, StreamExt};
use tokio::sync::oneshot;

use super::{
    FrameHandler, FrameSink, FrameSource, Limits, SessionState, Termination, armed, release,
    run_duplex,
};
use crate::config::{EndpointConfig, SynthesisConfig};
use crate::protocol::{ClientFrame, ServerFrame, audio};
use crate::{Result, StreamingClient};

/// A word the synthesizer aligned against its audio output.
#[derive(Debug, Clone, PartialEq)]
pub struct TimedText {
    pub text: String,
    pub start_s: f64,
    pub stop_s: f64,
}

/// Result of one synthesis session.
#[derive(Debug, Clone)]
pub struct SynthesisOutcome {
    pub success: bool,
    pub termination: Termination,
    /// Concatenated PCM in arrival order.
    pub pcm: Vec<f32>,
    pub timings: Vec<TimedText>,
    pub frames_received: usize,
}

impl SynthesisOutcome {
    fn connect_failed(reason: String) -> Self {
        tracing::error!("Synthesis connection failed: {reason}");
        Self {
            success: false,
            termination: Termination::ConnectFailed(reason),
            pcm: Vec::new(),
            timings: Vec::new(),
            frames_received: 0,
        }
    }

    #[must_use]
    pub fn duration_secs(&self) -> f64 {
        audio::duration_secs(&self.pcm)
    }

    /// Write the synthesized audio as a 24 kHz mono WAV file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be written.
    pub fn write_wav(&self, path: impl AsRef<Path>) -> Result<()> {
        audio::write_wav(path, &self.pcm)
    }
}

#[derive(Default)]
struct SynthesisHandler {
    pcm: Vec<f32>,
    timings: Vec<TimedText>,
}

impl FrameHandler for SynthesisHandler {
    fn on_frame(&mut self, frame: ServerFrame) -> Option<Termination> {
        if frame.is_end_of_synthesis() {
            return Some(Termination::Sentinel);
        }
        match frame {
            ServerFrame::Audio { pcm } => self.pcm.extend_from_slice(&pcm),
            ServerFrame::Text { text, start_s, stop_s } => {
                tracing::trace!(%text, start_s, stop_s, "Aligned word");
                self.timings.push(TimedText { text, start_s, stop_s });
            }
            ServerFrame::Unknown { kind } => tracing::warn!(%kind, "Unknown frame type"),
            other => tracing::debug!(kind = other.kind(), "Ignoring frame"),
        }
        None
    }
}

/// Streams words to the synthesis endpoint and collects the audio it returns.
#[derive(Debug, Clone)]
pub struct SynthesisSession {
    endpoint: EndpointConfig,
    config: SynthesisConfig,
}

impl SynthesisSession {
    #[must_use]
    pub const fn new(endpoint: EndpointConfig, config: SynthesisConfig) -> Self {
        Self { endpoint, config }
    }

    /// Synthesize `text`, sending it word by word.
    pub async fn run(&self, text: &str) -> SynthesisOutcome {
        let words: Vec<String> = text.split_whitespace().map(str::to_string).collect();
        self.run_stream(stream::iter(words)).await
    }

    /// Synthesize words as they arrive, e.g. from [`crate::rechunk_to_words`].
    pub async fn run_stream<W>(&self, words: W) -> SynthesisOutcome
    where
        W: Stream<Item = String> + Send + Unpin,
    {
        let url = match self
            .endpoint
            .url(&self.config.path, &self.config.query(&self.endpoint.api_key))
        {
            Ok(url) => url,
            Err(e) => return SynthesisOutcome::connect_failed(e.to_string()),
        };
        tracing::debug!(state = ?SessionState::Connecting, path = %url.path(), "Opening synthesis channel");
        let client = match StreamingClient::connect(&url, &self.endpoint).await {
            Ok(client) => client,
            Err(e) => return SynthesisOutcome::connect_failed(e.to_string()),
        };
        let (mut sink, mut source) = client.split();
        self.run_with(&mut sink, &mut source, words).await
    }

    /// Run the session over an already-open channel. The sink is closed on return.
    pub async fn run_with<W>(
        &self,
        sink: &mut dyn FrameSink,
        source: &mut dyn FrameSource,
        words: W,
    ) -> SynthesisOutcome
    where
        W: Stream<Item = String> + Send + Unpin,
    {
        let limits = Limits {
            purge: self.config.purge,
            max_frames: self.config.max_frames,
        };
        let (ready_tx, ready_rx) = oneshot::channel();
        let mut handler = SynthesisHandler::default();
        let sender = send_words(&mut *sink, ready_rx, words, self.config.word_delay);
        let report = run_duplex(source, &mut handler, limits, ready_tx, sender).await;
        release(sink).await;

        tracing::info!(
            samples = handler.pcm.len(),
            seconds = audio::duration_secs(&handler.pcm),
            words = handler.timings.len(),
            "Synthesis complete"
        );
        SynthesisOutcome {
            success: report.termination.is_success(),
            termination: report.termination,
            pcm: handler.pcm,
            timings: handler.timings,
            frames_received: report.frames_received,
        }
    }
}

async fn send_words<W>(
    sink: &mut dyn FrameSink,
    ready: oneshot::Receiver<()>,
    mut words: W,
    delay: std::time::Duration,
) -> Result<()>
where
    W: Stream<Item = String> + Send + Unpin,
{
    if !armed(ready).await {
        return Ok(());
    }
    let mut sent = 0usize;
    while let Some(word) = words.next().await {
        if word.trim().is_empty() {
            continue;
        }
        tracing::trace!(%word, "Sending word");
        sink.send(ClientFrame::Text { text: word }).await?;
        sent += 1;
        tokio::time::sleep(delay).await;
    }
    sink.send(ClientFrame::Eos).await?;
    tracing::debug!(words = sent, "End of stream sent");
    Ok(())
}
