//! Quire select: the consumer facade over a bus and its paginator.
//!
//! Results are exposed three ways: a synchronous read of the current window,
//! a future that re-runs the query and resolves on the next refresh, and
//! streams that push the window on every refresh. Streams and paginator
//! watchers stay attached until [`Select::unsubscribe`].

#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::{BoxFuture, FutureExt};
use quire_core::{
    strip_internal_fields, ChangeBus, ChangeEvent, CreateData, Entity, IdentityKey, RepositoryError, ResultsWaiter,
    Subscription,
};
use quire_paginator::Paginator;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info};

mod dispatch;
mod stream;

pub use dispatch::{Dispatcher, Inline, Job, JobQueue, QueueDispatcher};
pub use stream::ResultsStream;

#[derive(Debug, thiserror::Error)]
pub enum SelectError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error("serialize: {0}")]
    Serialize(#[from] serde_json::Error),
}

fn lock<V>(m: &Mutex<V>) -> MutexGuard<'_, V> { m.lock().unwrap_or_else(PoisonError::into_inner) }

/// Plain JSON array of `items`, with `__`-prefixed keys removed.
pub fn plain_json<T: Serialize>(items: &[Arc<Entity<T>>]) -> Result<String, serde_json::Error> {
    let mut out = Vec::with_capacity(items.len());
    for e in items {
        let mut plain = e.to_plain()?;
        strip_internal_fields(&mut plain);
        out.push(Value::Object(plain));
    }
    serde_json::to_string(&out)
}

type Release = Box<dyn FnOnce() + Send>;

/// A listener on the bus, plus whatever closes the stream it feeds.
struct Tracked {
    sub: Subscription,
    release: Option<Release>,
}

/// Sender shared between a stream's listener and its queued deliveries.
/// Cleared on release, so jobs still queued in a dispatcher send nothing.
type SenderSlot<V> = Arc<Mutex<Option<mpsc::UnboundedSender<V>>>>;

pub struct Select<T: Send + Sync + 'static> {
    bus: Arc<dyn ChangeBus<T>>,
    paginator: Paginator<T>,
    dispatcher: Arc<dyn Dispatcher>,
    subscriptions: Mutex<Vec<Tracked>>,
}

impl<T: Send + Sync + 'static> Select<T> {
    /// `paginator` must be attached to `bus`.
    pub fn new(bus: Arc<dyn ChangeBus<T>>, paginator: Paginator<T>) -> Self {
        Self { bus, paginator, dispatcher: Arc::new(Inline), subscriptions: Mutex::new(Vec::new()) }
    }

    pub fn with_dispatcher(mut self, dispatcher: Arc<dyn Dispatcher>) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    pub fn paginator(&self) -> &Paginator<T> { &self.paginator }

    /// Call `f` with the paginator after every refresh, through the dispatcher.
    pub fn watch_paginator<F>(&self, f: F) -> &Paginator<T>
    where
        F: Fn(&Paginator<T>) + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let weak = self.paginator.downgrade();
        let dispatcher = Arc::clone(&self.dispatcher);
        let sub = self.bus.change_stream().subscribe(move |ev: &ChangeEvent<T>| {
            if !ev.is_refresh() {
                return;
            }
            let Some(p) = weak.upgrade() else { return };
            let f = Arc::clone(&f);
            dispatcher.dispatch(Box::new(move || f(&p)));
        });
        self.track(sub, None);
        &self.paginator
    }

    /// Current visible window.
    pub fn results(&self) -> Vec<Arc<Entity<T>>> { self.paginator.results() }

    /// Re-run the bus's query and resolve with the window once it refreshes.
    pub fn results_as_promise(&self) -> BoxFuture<'static, Vec<Arc<Entity<T>>>> {
        let waiter = self.execute_and_wait();
        let p = self.paginator.clone();
        async move {
            waiter.await;
            p.results()
        }
        .boxed()
    }

    pub fn results_as_observable(&self) -> ResultsStream<Vec<Arc<Entity<T>>>> { self.observe(|p| p.results()) }

    /// Release every stream and watcher this facade created. Idempotent.
    pub fn unsubscribe(&self) {
        let tracked: Vec<Tracked> = lock(&self.subscriptions).drain(..).collect();
        if tracked.is_empty() {
            return;
        }
        let released = tracked.len();
        for t in tracked {
            t.sub.unsubscribe();
            if let Some(release) = t.release {
                release();
            }
        }
        debug!(released, "select: unsubscribed");
    }

    /// Live subscriptions held by this facade.
    pub fn subscription_count(&self) -> usize { lock(&self.subscriptions).iter().filter(|t| t.sub.is_active()).count() }

    /// Create through the bus's repository, seeded with the query's create
    /// context, then re-run the query and return once it refreshes.
    pub async fn create(&self, data: Option<CreateData>, id: Option<IdentityKey>) -> Result<Arc<Entity<T>>, SelectError> {
        let query = self.bus.query();
        let context = self.bus.parsed_create_context(&query);
        let created = self.bus.repository().create(data, id, Some(context)).await?;
        info!(id = %created.identity(), "select: created");
        self.execute_and_wait().await;
        Ok(created)
    }

    fn execute_and_wait(&self) -> ResultsWaiter<T> {
        let stream = self.bus.change_stream();
        let seq = stream.next_seq();
        let waiter = stream.wait_for_results(seq);
        debug!(seq, "select: execute");
        self.bus.execute(&self.bus.query(), seq);
        waiter
    }

    fn observe<V, F>(&self, project: F) -> ResultsStream<V>
    where
        V: Send + 'static,
        F: Fn(&Paginator<T>) -> V + Send + Sync + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let slot: SenderSlot<V> = Arc::new(Mutex::new(Some(tx)));
        let weak = self.paginator.downgrade();
        let dispatcher = Arc::clone(&self.dispatcher);
        let listener_slot = Arc::clone(&slot);
        let sub = self.bus.change_stream().subscribe(move |ev: &ChangeEvent<T>| {
            if !ev.is_refresh() || lock(&listener_slot).is_none() {
                return;
            }
            let Some(p) = weak.upgrade() else { return };
            let value = project(&p);
            let slot = Arc::clone(&listener_slot);
            dispatcher.dispatch(Box::new(move || {
                if let Some(tx) = lock(&slot).as_ref() {
                    let _ = tx.send(value);
                }
            }));
        });
        self.track(sub, Some(Box::new(move || drop(lock(&slot).take()))));
        ResultsStream::new(rx)
    }

    fn track(&self, sub: Subscription, release: Option<Release>) { lock(&self.subscriptions).push(Tracked { sub, release }); }
}

impl<T: Clone + Send + Sync + 'static> Select<T> {
    /// Current visible window as owned models.
    pub fn models(&self) -> Vec<T> { self.results().iter().map(|e| e.model().clone()).collect() }

    pub fn read_only_results_as_observable(&self) -> ResultsStream<Vec<T>> {
        self.observe(|p| p.results().iter().map(|e| e.model().clone()).collect())
    }
}

impl<T: Serialize + Send + Sync + 'static> Select<T> {
    /// Re-run the query and serialize the refreshed window as plain JSON.
    pub fn to_json(&self) -> BoxFuture<'static, Result<String, SelectError>> {
        let waiter = self.execute_and_wait();
        let p = self.paginator.clone();
        async move {
            waiter.await;
            plain_json(&p.results()).map_err(SelectError::from)
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quire_core::ManualBus;

    #[derive(Serialize)]
    struct Person {
        name: String,
        age: u32,
    }

    #[test]
    fn plain_json_drops_internal_keys_in_order() {
        let e = Arc::new(Entity::new(IdentityKey::from("x1"), Person { name: "A".into(), age: 3 }));
        assert_eq!(plain_json(&[e]).unwrap(), r#"[{"name":"A","age":3}]"#);
    }

    #[test]
    fn unsubscribe_twice_is_harmless() {
        let bus = Arc::new(ManualBus::<u32>::new());
        let p = Paginator::<u32>::new(bus.clone());
        let s = Select::new(bus.clone(), p);
        let _a = s.results_as_observable();
        let _b = s.results_as_observable();
        assert_eq!(s.subscription_count(), 2);
        assert_eq!(bus.change_stream().listener_count(), 3);
        s.unsubscribe();
        s.unsubscribe();
        assert_eq!(s.subscription_count(), 0);
        assert_eq!(bus.change_stream().listener_count(), 1);
    }
}
