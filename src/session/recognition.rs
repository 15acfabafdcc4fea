use std::time::Duration;

use futures::stream::{self, Stream, StreamExt};
use tokio::sync::oneshot;

use super::{
    FrameHandler, FrameSink, FrameSource, Limits, SessionState, Termination, armed, release,
    run_duplex,
};
use crate::config::{EndpointConfig, RecognitionConfig};
use crate::protocol::{ClientFrame, SAMPLES_PER_FRAME, ServerFrame, audio};
use crate::{Result, StreamingClient};

#[derive(Debug, Clone, PartialEq)]
pub struct RecognizedWord {
    pub text: String,
    pub start_time: f64,
    /// Set once the matching `EndWord` arrives.
    pub stop_time: Option<f64>,
}

/// Result of one recognition session.
#[derive(Debug, Clone)]
pub struct RecognitionOutcome {
    pub success: bool,
    pub termination: Termination,
    /// Recognized words in arrival order.
    pub words: Vec<RecognizedWord>,
    pub frames_received: usize,
    pub last_step: Option<u64>,
}

impl RecognitionOutcome {
    fn connect_failed(reason: String) -> Self {
        tracing::error!("Recognition connection failed: {reason}");
        Self {
            success: false,
            termination: Termination::ConnectFailed(reason),
            words: Vec::new(),
            frames_received: 0,
            last_step: None,
        }
    }

    /// The recognized words joined by single spaces.
    #[must_use]
    pub fn transcript(&self) -> String {
        self.words
            .iter()
            .map(|w| w.text.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

struct RecognitionHandler {
    marker_id: i64,
    words: Vec<RecognizedWord>,
    last_step: Option<u64>,
}

impl FrameHandler for RecognitionHandler {
    fn on_frame(&mut self, frame: ServerFrame) -> Option<Termination> {
        match frame {
            ServerFrame::Word { text, start_time } => {
                tracing::debug!(%text, start_time, "Word");
                self.words.push(RecognizedWord { text, start_time, stop_time: None });
            }
            ServerFrame::EndWord { stop_time } => {
                if let Some(word) = self.words.iter_mut().rev().find(|w| w.stop_time.is_none()) {
                    word.stop_time = Some(stop_time);
                }
            }
            ServerFrame::Step { step_idx } => self.last_step = Some(step_idx),
            ServerFrame::Marker { id } if id == self.marker_id => {
                tracing::debug!(id, "Marker echoed, transcript complete");
                return Some(Termination::Sentinel);
            }
            ServerFrame::Marker { id } => tracing::debug!(id, "Ignoring foreign marker"),
            ServerFrame::Unknown { kind } => tracing::warn!(%kind, "Unknown frame type"),
            other => tracing::debug!(kind = other.kind(), "Ignoring frame"),
        }
        None
    }
}

/// Streams PCM to the recognition endpoint and collects the transcript.
#[derive(Debug, Clone)]
pub struct RecognitionSession {
    endpoint: EndpointConfig,
    config: RecognitionConfig,
}

impl RecognitionSession {
    #[must_use]
    pub const fn new(endpoint: EndpointConfig, config: RecognitionConfig) -> Self {
        Self { endpoint, config }
    }

    /// Transcribe a complete 24 kHz mono buffer.
    pub async fn run(&self, pcm: &[f32]) -> RecognitionOutcome {
        self.run_stream(stream::iter(vec![pcm.to_vec()])).await
    }

    /// Transcribe audio arriving as chunks of any size.
    pub async fn run_stream<A>(&self, chunks: A) -> RecognitionOutcome
    where
        A: Stream<Item = Vec<f32>> + Send + Unpin,
    {
        let url = match self
            .endpoint
            .url(&self.config.path, &[("auth_id", self.endpoint.api_key.clone())])
        {
            Ok(url) => url,
            Err(e) => return RecognitionOutcome::connect_failed(e.to_string()),
        };
        tracing::debug!(state = ?SessionState::Connecting, path = %url.path(), "Opening recognition channel");
        let client = match StreamingClient::connect(&url, &self.endpoint).await {
            Ok(client) => client,
            Err(e) => return RecognitionOutcome::connect_failed(e.to_string()),
        };
        let (mut sink, mut source) = client.split();
        self.run_with(&mut sink, &mut source, chunks).await
    }

    /// Run the session over an already-open channel. The sink is closed on return.
    pub async fn run_with<A>(
        &self,
        sink: &mut dyn FrameSink,
        source: &mut dyn FrameSource,
        chunks: A,
    ) -> RecognitionOutcome
    where
        A: Stream<Item = Vec<f32>> + Send + Unpin,
    {
        let limits = Limits {
            purge: self.config.purge,
            max_frames: self.config.max_frames,
        };
        let (ready_tx, ready_rx) = oneshot::channel();
        let mut handler = RecognitionHandler {
            marker_id: self.config.marker_id,
            words: Vec::new(),
            last_step: None,
        };
        let sender = send_audio(&mut *sink, ready_rx, chunks, &self.config);
        let report = run_duplex(source, &mut handler, limits, ready_tx, sender).await;
        release(sink).await;

        let outcome = RecognitionOutcome {
            success: report.termination.is_success(),
            termination: report.termination,
            words: handler.words,
            frames_received: report.frames_received,
            last_step: handler.last_step,
        };
        tracing::info!(words = outcome.words.len(), transcript = %outcome.transcript(), "Recognition complete");
        outcome
    }
}

/// Regroups arbitrary chunks into fixed-size frames.
#[derive(Default)]
struct Framer {
    pending: Vec<f32>,
}

impl Framer {
    fn push(&mut self, chunk: &[f32]) -> Vec<Vec<f32>> {
        self.pending.extend_from_slice(chunk);
        let full = self.pending.len() / SAMPLES_PER_FRAME * SAMPLES_PER_FRAME;
        let frames = self.pending[..full]
            .chunks(SAMPLES_PER_FRAME)
            .map(<[f32]>::to_vec)
            .collect();
        self.pending.drain(..full);
        frames
    }

    fn finish(self) -> Option<Vec<f32>> {
        audio::frames(&self.pending).pop()
    }
}

async fn send_frame(sink: &mut dyn FrameSink, pcm: Vec<f32>, pace: Option<Duration>) -> Result<()> {
    sink.send(ClientFrame::Audio { pcm }).await?;
    if let Some(pace) = pace {
        tokio::time::sleep(pace).await;
    }
    Ok(())
}

async fn send_audio<A>(
    sink: &mut dyn FrameSink,
    ready: oneshot::Receiver<()>,
    mut chunks: A,
    config: &RecognitionConfig,
) -> Result<()>
where
    A: Stream<Item = Vec<f32>> + Send + Unpin,
{
    if !armed(ready).await {
        return Ok(());
    }
    let pace = config.realtime.then(audio::frame_duration);
    let mut framer = Framer::default();
    let mut sent = 0usize;
    while let Some(chunk) = chunks.next().await {
        for frame in framer.push(&chunk) {
            send_frame(sink, frame, pace).await?;
            sent += 1;
        }
    }
    if let Some(tail) = framer.finish() {
        send_frame(sink, tail, pace).await?;
        sent += 1;
    }
    tracing::debug!(frames = sent, "Audio sent, flushing with marker");

    sink.send(ClientFrame::Marker { id: config.marker_id }).await?;
    for _ in 0..config.silence_frames {
        send_frame(sink, audio::silence_frame(), Some(config.silence_delay)).await?;
    }
    Ok(())
}
