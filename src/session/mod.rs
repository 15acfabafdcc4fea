//! Duplex streaming sessions against the speech endpoints.
//!
//! A session owns one channel. After connecting it purges residual frames,
//! waits for the remote `Ready` handshake and then runs a sender and a
//! receiver concurrently: the sender owns the write half, the receiver owns
//! the read half, and the only thing passed between them is the one-shot
//! ready signal. Whichever side reaches a terminal condition first cancels
//! the other; output accumulated so far is always kept.

mod recognition;
mod synthesis;
mod transport;

pub use recognition::{RecognitionOutcome, RecognitionSession, RecognizedWord};
pub use synthesis::{SynthesisOutcome, SynthesisSession, TimedText};
pub use transport::{BoxFuture, FrameSink, FrameSource};

use std::future::Future;

use tokio::sync::oneshot;
use tokio::time::timeout;

use crate::Result;
use crate::config::PurgeConfig;
use crate::protocol::ServerFrame;

/// Lifecycle of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    /// Discarding frames left over from a previous use of the channel.
    Purging,
    AwaitingReady,
    Streaming,
    Closed,
}

/// Why a session stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// The direction-specific end marker arrived.
    Sentinel,
    /// The safety cap on received frames was reached.
    FrameCap,
    /// The endpoint reported an error frame.
    RemoteError(String),
    /// The channel closed before the session finished.
    ConnectionClosed,
    /// Opening the channel failed.
    ConnectFailed(String),
    /// Writing to the channel failed.
    SenderFailed(String),
    /// Reading from the channel failed.
    ReceiverFailed(String),
}

impl Termination {
    /// Sentinel and frame-cap endings are graceful; everything else is a failure.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Sentinel | Self::FrameCap)
    }
}

/// Direction-specific handling of streamed frames.
///
/// `Ready` and `Error` frames are handled by the session itself and never reach the handler.
pub(crate) trait FrameHandler: Send {
    /// Consume one frame; `Some` ends the session.
    fn on_frame(&mut self, frame: ServerFrame) -> Option<Termination>;
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Limits {
    pub purge: PurgeConfig,
    pub max_frames: usize,
}

pub(crate) struct Report {
    pub termination: Termination,
    pub frames_received: usize,
}

struct Progress {
    state: SessionState,
    frames: usize,
}

impl Progress {
    fn enter(&mut self, state: SessionState) {
        tracing::debug!(from = ?self.state, to = ?state, "Session state change");
        self.state = state;
    }
}

/// Run the handshake and the concurrent streaming phase on an open channel.
///
/// The caller has already connected, so the first logged transition is
/// `Connecting -> Purging`.
///
/// `sender` must wait on the ready receiver paired with `ready` before writing anything.
pub(crate) async fn run_duplex<H, F>(
    source: &mut dyn FrameSource,
    handler: &mut H,
    limits: Limits,
    ready: oneshot::Sender<()>,
    sender: F,
) -> Report
where
    H: FrameHandler,
    F: Future<Output = Result<()>> + Send,
{
    let mut progress = Progress {
        state: SessionState::Connecting,
        frames: 0,
    };

    let termination = {
        let receiver = receive(source, handler, limits, ready, &mut progress);
        tokio::pin!(receiver);
        tokio::pin!(sender);
        let mut sender_done = false;
        loop {
            tokio::select! {
                termination = &mut receiver => break termination,
                sent = &mut sender, if !sender_done => {
                    sender_done = true;
                    match sent {
                        Ok(()) => tracing::debug!("Sender finished, waiting for the receiver"),
                        Err(e) => break Termination::SenderFailed(e.to_string()),
                    }
                }
            }
        }
    };

    progress.enter(SessionState::Closed);
    if termination.is_success() {
        tracing::info!(frames = progress.frames, ?termination, "Session finished");
    } else {
        tracing::warn!(frames = progress.frames, ?termination, "Session failed");
    }
    Report {
        termination,
        frames_received: progress.frames,
    }
}

async fn receive<H: FrameHandler>(
    source: &mut dyn FrameSource,
    handler: &mut H,
    limits: Limits,
    ready: oneshot::Sender<()>,
    progress: &mut Progress,
) -> Termination {
    progress.enter(SessionState::Purging);
    let mut got_ready = false;
    for _ in 0..limits.purge.max_frames {
        match timeout(limits.purge.read_timeout, source.next_frame()).await {
            Err(_elapsed) => break,
            Ok(Ok(Some(ServerFrame::Ready))) => {
                got_ready = true;
                break;
            }
            Ok(Ok(Some(ServerFrame::Error { message }))) => {
                return Termination::RemoteError(message);
            }
            Ok(Ok(Some(frame))) => tracing::debug!(kind = frame.kind(), "Purged residual frame"),
            Ok(Ok(None)) => return Termination::ConnectionClosed,
            Ok(Err(e)) if e.is_recoverable() => tracing::debug!("Purged undecodable frame: {e}"),
            Ok(Err(e)) => return Termination::ReceiverFailed(e.to_string()),
        }
    }

    if !got_ready {
        progress.enter(SessionState::AwaitingReady);
        loop {
            match source.next_frame().await {
                Ok(Some(ServerFrame::Ready)) => break,
                Ok(Some(ServerFrame::Error { message })) => {
                    return Termination::RemoteError(message);
                }
                Ok(Some(frame)) => {
                    tracing::debug!(kind = frame.kind(), "Discarding frame before Ready");
                }
                Ok(None) => return Termination::ConnectionClosed,
                Err(e) if e.is_recoverable() => {
                    tracing::warn!("Undecodable frame before Ready: {e}");
                }
                Err(e) => return Termination::ReceiverFailed(e.to_string()),
            }
        }
    }

    progress.enter(SessionState::Streaming);
    if ready.send(()).is_err() {
        tracing::debug!("Sender already gone when Ready arrived");
    }

    loop {
        let next = source.next_frame().await;
        match next {
            Ok(Some(ServerFrame::Error { message })) => {
                progress.frames += 1;
                return Termination::RemoteError(message);
            }
            Ok(Some(ServerFrame::Ready)) => {
                progress.frames += 1;
                tracing::debug!("Ignoring repeated Ready");
            }
            Ok(Some(frame)) => {
                progress.frames += 1;
                if let Some(termination) = handler.on_frame(frame) {
                    return termination;
                }
            }
            Ok(None) => return Termination::ConnectionClosed,
            Err(e) if e.is_recoverable() => {
                progress.frames += 1;
                tracing::warn!("Skipping undecodable frame: {e}");
            }
            Err(e) => return Termination::ReceiverFailed(e.to_string()),
        }
        if progress.frames >= limits.max_frames {
            tracing::warn!(
                reason = "frame_cap",
                max_frames = limits.max_frames,
                "Frame cap reached, ending session"
            );
            return Termination::FrameCap;
        }
    }
}

/// Close the write half, logging rather than failing: the outcome is already decided.
pub(crate) async fn release(sink: &mut dyn FrameSink) {
    if let Err(e) = sink.close().await {
        tracing::debug!("Error closing channel: {e}");
    }
}

/// Wait for the receiver to see `Ready`; `false` if it never will.
pub(crate) async fn armed(ready: oneshot::Receiver<()>) -> bool {
    ready.await.is_ok()
}


#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::mock::channel;
    use super::*;
    use crate::Error;

    #[derive(Default)]
    struct Collect {
        kinds: Vec<String>,
    }

    impl FrameHandler for Collect {
        fn on_frame(&mut self, frame: ServerFrame) -> Option<Termination> {
            if matches!(frame, ServerFrame::Marker { .. }) {
                return Some(Termination::Sentinel);
            }
            self.kinds.push(frame.kind().to_string());
            None
        }
    }

    fn limits(max_frames: usize) -> Limits {
        Limits {
            purge: PurgeConfig::default(),
            max_frames,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn residual_frames_are_purged_before_streaming() {
        let (_sink, mut source, remote) = channel();
        remote.push(ServerFrame::Audio { pcm: vec![0.5] });
        remote.push(ServerFrame::Step { step_idx: 1 });
        remote.push(ServerFrame::Ready);
        remote.push(ServerFrame::Word { text: "hi".into(), start_time: 0.0 });
        remote.push(ServerFrame::Marker { id: 1 });

        let (ready_tx, ready_rx) = oneshot::channel();
        let mut handler = Collect::default();
        let report = run_duplex(&mut source, &mut handler, limits(100), ready_tx, async {
            assert!(armed(ready_rx).await);
            Ok(())
        })
        .await;

        assert_eq!(report.termination, Termination::Sentinel);
        assert_eq!(handler.kinds, vec!["Word"]);
        assert_eq!(report.frames_received, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn ready_after_purge_window_is_awaited() {
        let (_sink, mut source, remote) = channel();
        let server = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            remote.push(ServerFrame::Ready);
            remote.push(ServerFrame::Marker { id: 1 });
            remote
        });

        let (ready_tx, ready_rx) = oneshot::channel();
        let report = run_duplex(&mut source, &mut Collect::default(), limits(100), ready_tx, async {
            armed(ready_rx).await;
            Ok(())
        })
        .await;
        assert_eq!(report.termination, Termination::Sentinel);
        drop(server.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn error_during_handshake_never_arms_sender() {
        let (_sink, mut source, remote) = channel();
        remote.push(ServerFrame::Error { message: "no voice".into() });

        let (ready_tx, ready_rx) = oneshot::channel();
        let report = run_duplex(&mut source, &mut Collect::default(), limits(100), ready_tx, async {
            assert!(!armed(ready_rx).await);
            Ok(())
        })
        .await;
        assert_eq!(report.termination, Termination::RemoteError("no voice".into()));
        assert!(!report.termination.is_success());
    }

    #[tokio::test(start_paused = true)]
    async fn frame_cap_ends_session_gracefully() {
        let (_sink, mut source, remote) = channel();
        remote.push(ServerFrame::Ready);
        for i in 0..10 {
            remote.push(ServerFrame::Step { step_idx: i });
        }

        let (ready_tx, _ready_rx) = oneshot::channel();
        let report =
            run_duplex(&mut source, &mut Collect::default(), limits(5), ready_tx, async { Ok(()) })
                .await;
        assert_eq!(report.termination, Termination::FrameCap);
        assert!(report.termination.is_success());
        assert_eq!(report.frames_received, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn undecodable_frames_are_skipped() {
        let (_sink, mut source, remote) = channel();
        remote.push(ServerFrame::Ready);
        let _ = remote.frames.send(Err(Error::InvalidFrame("garbage".into())));
        remote.push(ServerFrame::Word { text: "ok".into(), start_time: 0.1 });
        remote.push(ServerFrame::Marker { id: 1 });

        let (ready_tx, _ready_rx) = oneshot::channel();
        let mut handler = Collect::default();
        let report =
            run_duplex(&mut source, &mut handler, limits(100), ready_tx, async { Ok(()) }).await;
        assert_eq!(report.termination, Termination::Sentinel);
        assert_eq!(handler.kinds, vec!["Word"]);
    }

    #[tokio::test(start_paused = true)]
    async fn sender_failure_cancels_receiver() {
        let (_sink, mut source, remote) = channel();
        remote.push(ServerFrame::Ready);

        let (ready_tx, ready_rx) = oneshot::channel();
        let report = run_duplex(&mut source, &mut Collect::default(), limits(100), ready_tx, async {
            armed(ready_rx).await;
            Err(Error::ConnectionClosed)
        })
        .await;
        assert!(matches!(report.termination, Termination::SenderFailed(_)));
        drop(remote);
    }

    #[tokio::test(start_paused = true)]
    async fn closed_channel_is_a_failure() {
        let (_sink, mut source, remote) = channel();
        remote.push(ServerFrame::Ready);
        drop(remote);

        let (ready_tx, _ready_rx) = oneshot::channel();
        let report =
            run_duplex(&mut source, &mut Collect::default(), limits(100), ready_tx, async { Ok(()) })
                .await;
        assert_eq!(report.termination, Termination::ConnectionClosed);
    }
}
