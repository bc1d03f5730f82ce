use std::convert::Infallible;
use std::future::Future;

use bytes::Bytes;
use tokio::sync::mpsc;

/// The client stopped accepting fragments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkClosed;

/// Forward-only client output channel.
///
/// Bytes written are never taken back. [`close`](FragmentSink::close)
/// consumes the sink, so it cannot run twice.
pub trait FragmentSink: Send + 'static {
    /// Write one fragment, waiting until the client side accepts it.
    fn send(&mut self, fragment: Bytes) -> impl Future<Output = Result<(), SinkClosed>> + Send;

    /// Resolves once the client side has gone away.
    fn closed(&self) -> impl Future<Output = ()> + Send;

    /// Terminate the output.  Nothing can be written afterwards.
    fn close(self) -> impl Future<Output = ()> + Send;
}

/// The HTTP response body reads from the receiving half of this channel.
impl FragmentSink for mpsc::Sender<Result<Bytes, Infallible>> {
    async fn send(&mut self, fragment: Bytes) -> Result<(), SinkClosed> {
        mpsc::Sender::send(self, Ok(fragment)).await.map_err(|_| SinkClosed)
    }

    async fn closed(&self) {
        mpsc::Sender::closed(self).await
    }

    async fn close(self) {
        drop(self);
    }
}
