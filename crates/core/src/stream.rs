//! Change stream: an ordered observer registry for [`ChangeEvent`]s.
//!
//! Events are dispatched synchronously, in registration order, outside the
//! registry lock. The first listener registered on a bus (the paginator) has
//! therefore applied an event before any later waiter or stream observes it.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};

use tokio::sync::oneshot;
use tracing::trace;

use crate::{ChangeEvent, RequestSeq};

type Listener<T> = Arc<dyn Fn(&ChangeEvent<T>) + Send + Sync>;

fn lock<V>(m: &Mutex<V>) -> MutexGuard<'_, V> { m.lock().unwrap_or_else(PoisonError::into_inner) }

struct Registry<T> {
    listeners: Mutex<Vec<(u64, Listener<T>)>>,
    next_id: AtomicU64,
}

trait Detach: Send + Sync {
    fn detach(&self, id: u64);
}

impl<T: 'static> Detach for Registry<T> {
    fn detach(&self, id: u64) { lock(&self.listeners).retain(|(i, _)| *i != id); }
}

/// Handle detaching one listener. Dropping it does not detach; call [`Subscription::unsubscribe`].
pub struct Subscription {
    registry: Weak<dyn Detach>,
    id: u64,
    active: AtomicBool,
}

impl Subscription {
    /// Detach the listener. Safe to call repeatedly.
    pub fn unsubscribe(&self) {
        if self.active.swap(false, Ordering::AcqRel) {
            if let Some(reg) = self.registry.upgrade() {
                reg.detach(self.id);
            }
            trace!(id = self.id, "change stream: listener detached");
        }
    }

    pub fn is_active(&self) -> bool { self.active.load(Ordering::Acquire) && self.registry.strong_count() > 0 }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).field("active", &self.is_active()).finish()
    }
}

/// Observer hub owned by a bus. Also allocates request sequence numbers.
pub struct ChangeStream<T> {
    registry: Arc<Registry<T>>,
    seq: AtomicU64,
}

impl<T: Send + Sync + 'static> ChangeStream<T> {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Registry { listeners: Mutex::new(Vec::new()), next_id: AtomicU64::new(1) }),
            seq: AtomicU64::new(0),
        }
    }

    /// Allocate the next request sequence number (starts at 1).
    pub fn next_seq(&self) -> RequestSeq { self.seq.fetch_add(1, Ordering::AcqRel) + 1 }

    /// Highest sequence number allocated so far.
    pub fn last_seq(&self) -> RequestSeq { self.seq.load(Ordering::Acquire) }

    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&ChangeEvent<T>) + Send + Sync + 'static,
    {
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.registry.listeners).push((id, Arc::new(listener)));
        let registry: Weak<dyn Detach> = Arc::downgrade(&self.registry) as Weak<dyn Detach>;
        trace!(id, "change stream: listener attached");
        Subscription { registry, id, active: AtomicBool::new(true) }
    }

    /// Deliver an event to every listener registered at the time of the call.
    pub fn publish(&self, event: &ChangeEvent<T>) {
        let snapshot: Vec<Listener<T>> = lock(&self.registry.listeners).iter().map(|(_, l)| Arc::clone(l)).collect();
        trace!(listeners = snapshot.len(), seq = ?event.seq, refresh = event.is_refresh(), "change stream: publish");
        for listener in snapshot {
            listener(event);
        }
    }

    /// Future resolving with the first refresh event that answers request `seq`.
    ///
    /// An event matches when it carries `results` and either has no sequence
    /// number or one at least `seq`. Acknowledgments never match.
    pub fn wait_for_results(&self, seq: RequestSeq) -> ResultsWaiter<T> {
        let (tx, rx) = oneshot::channel();
        let slot = Mutex::new(Some(tx));
        let sub = self.subscribe(move |ev: &ChangeEvent<T>| {
            if !ev.is_refresh() || ev.seq.map_or(false, |s| s < seq) {
                return;
            }
            if let Some(tx) = lock(&slot).take() {
                let _ = tx.send(ev.clone());
            }
        });
        ResultsWaiter { rx, sub }
    }

    /// Future resolving with the next refresh event, whatever request caused it.
    pub fn wait_for_next_results(&self) -> ResultsWaiter<T> { self.wait_for_results(0) }

    pub fn listener_count(&self) -> usize { lock(&self.registry.listeners).len() }
}

impl<T: Send + Sync + 'static> Default for ChangeStream<T> {
    fn default() -> Self { Self::new() }
}

/// One-shot wait over a [`ChangeStream`]. Resolves `None` if the stream is torn
/// down first. Detaches its listener once resolved or dropped.
pub struct ResultsWaiter<T> {
    rx: oneshot::Receiver<ChangeEvent<T>>,
    sub: Subscription,
}

impl<T> Future for ResultsWaiter<T> {
    type Output = Option<ChangeEvent<T>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(res) => {
                self.sub.unsubscribe();
                Poll::Ready(res.ok())
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T> Drop for ResultsWaiter<T> {
    fn drop(&mut self) { self.sub.unsubscribe(); }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ChangeRequest, Entity, IdentityKey};
    use futures::FutureExt;

    fn refresh(seq: Option<RequestSeq>) -> ChangeEvent<u32> {
        let e = Arc::new(Entity::new(IdentityKey::from("a"), 1u32));
        ChangeEvent::refreshed(seq, vec![e.clone()], vec![e], 1)
    }

    #[test]
    fn listeners_run_in_registration_order() {
        let stream: ChangeStream<u32> = ChangeStream::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (a, b) = (seen.clone(), seen.clone());
        let _s1 = stream.subscribe(move |_| lock(&a).push(1));
        let _s2 = stream.subscribe(move |_| lock(&b).push(2));
        stream.publish(&refresh(None));
        assert_eq!(*lock(&seen), vec![1, 2]);
    }

    #[test]
    fn unsubscribe_is_idempotent() {
        let stream: ChangeStream<u32> = ChangeStream::new();
        let sub = stream.subscribe(|_| {});
        assert_eq!(stream.listener_count(), 1);
        sub.unsubscribe();
        sub.unsubscribe();
        assert_eq!(stream.listener_count(), 0);
        assert!(!sub.is_active());
    }

    #[test]
    fn waiter_ignores_acks_and_older_sequences() {
        let stream: ChangeStream<u32> = ChangeStream::new();
        let first = stream.next_seq();
        let mine = stream.next_seq();
        let mut waiter = stream.wait_for_results(mine);

        stream.publish(&ChangeEvent::ack(&ChangeRequest::new(mine)));
        assert!((&mut waiter).now_or_never().is_none());

        stream.publish(&refresh(Some(first)));
        assert!((&mut waiter).now_or_never().is_none());

        stream.publish(&refresh(Some(mine)));
        let ev = waiter.now_or_never().flatten().expect("resolved");
        assert_eq!(ev.seq, Some(mine));
        assert_eq!(stream.listener_count(), 0);
    }

    #[test]
    fn waiter_accepts_uncorrelated_refresh() {
        let stream: ChangeStream<u32> = ChangeStream::new();
        let seq = stream.next_seq();
        let waiter = stream.wait_for_results(seq);
        stream.publish(&refresh(None));
        assert!(waiter.now_or_never().flatten().is_some());
    }

    #[test]
    fn waiter_resolves_none_when_stream_dropped() {
        let stream: ChangeStream<u32> = ChangeStream::new();
        let waiter = stream.wait_for_next_results();
        drop(stream);
        assert_eq!(waiter.now_or_never().map(|r| r.is_none()), Some(true));
    }

    #[test]
    fn dropped_waiter_detaches() {
        let stream: ChangeStream<u32> = ChangeStream::new();
        let waiter = stream.wait_for_next_results();
        assert_eq!(stream.listener_count(), 1);
        drop(waiter);
        assert_eq!(stream.listener_count(), 0);
    }

    #[test]
    fn sequence_numbers_are_monotonic() {
        let stream: ChangeStream<u32> = ChangeStream::new();
        assert_eq!(stream.next_seq(), 1);
        assert_eq!(stream.next_seq(), 2);
        assert_eq!(stream.last_seq(), 2);
    }
}
