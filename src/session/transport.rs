use std::future::Future;
use std::pin::Pin;

use crate::protocol::{ClientFrame, ServerFrame};
use crate::{FrameReceiver, FrameSender, Result};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// The write half of a duplex speech channel. Owned by exactly one sender.
pub trait FrameSink: Send {
    fn send(&mut self, frame: ClientFrame) -> BoxFuture<'_, Result<()>>;
    fn close(&mut self) -> BoxFuture<'_, Result<()>>;
}

/// The read half of a duplex speech channel. Owned by exactly one receiver.
///
/// `next_frame` must be cancel-safe: the purge phase abandons reads that time out.
pub trait FrameSource: Send {
    fn next_frame(&mut self) -> BoxFuture<'_, Result<Option<ServerFrame>>>;
}

impl FrameSink for FrameSender {
    fn send(&mut self, frame: ClientFrame) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move { Self::send(self, frame).await })
    }

    fn close(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move { Self::close(self).await })
    }
}

impl FrameSource for FrameReceiver {
    fn next_frame(&mut self) -> BoxFuture<'_, Result<Option<ServerFrame>>> {
        Box::pin(async move { Self::next_frame(self).await })
    }
}
