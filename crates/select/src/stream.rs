use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;

/// Values pushed on every refresh. Ends after the facade unsubscribes and
/// already delivered values are drained.
pub struct ResultsStream<V> {
    rx: mpsc::UnboundedReceiver<V>,
}

impl<V> ResultsStream<V> {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<V>) -> Self { Self { rx } }

    /// Next value without waiting, if one was already delivered.
    pub fn try_next(&mut self) -> Option<V> { self.rx.try_recv().ok() }
}

impl<V> Stream for ResultsStream<V> {
    type Item = V;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<V>> { self.rx.poll_recv(cx) }
}
