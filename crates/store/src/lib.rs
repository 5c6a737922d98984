//! Quire store: in-memory repository and a change bus executing queries over it.
//!
//! Writers go through a mutex; readers take lock-free snapshots (`ArcSwap`).
//! Executions run on one task per bus; requests queued while a run is in
//! flight are coalesced into a single run echoing the highest sequence number.

#![forbid(unsafe_code)]

use std::cmp::Ordering;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use arc_swap::ArcSwap;
use metrics::{counter, histogram};
use quire_core::{
    ChangeBus, ChangeEvent, ChangeRequest, ChangeStream, CreateContext, CreateData, Entity, IdentityKey, PageSort,
    Query, Repository, RepositoryError, RequestSeq, SortDirection, IDENTITY_FIELD, INTERNAL_FIELD_MARKER,
};
use rustc_hash::FxHashSet;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Number, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("plain conversion: {0}")]
    Plain(#[from] serde_json::Error),
    #[error("invalid record: {0}")]
    InvalidRecord(String),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error("no tokio runtime: {0}")]
    NoRuntime(#[from] tokio::runtime::TryCurrentError),
}

fn lock<V>(m: &Mutex<V>) -> MutexGuard<'_, V> { m.lock().unwrap_or_else(PoisonError::into_inner) }

/// In-memory entity repository keyed by identity, in insertion order.
pub struct MemoryRepository<T> {
    records: ArcSwap<Vec<Arc<Entity<T>>>>,
    ids: Mutex<FxHashSet<IdentityKey>>,
}

impl<T: Send + Sync + 'static> MemoryRepository<T> {
    pub fn new() -> Self { Self { records: ArcSwap::from_pointee(Vec::new()), ids: Mutex::new(FxHashSet::default()) } }

    pub fn snapshot(&self) -> Arc<Vec<Arc<Entity<T>>>> { self.records.load_full() }
    pub fn len(&self) -> usize { self.records.load().len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Store a model under `id`, or a generated identity when `None`.
    pub fn insert(&self, id: Option<IdentityKey>, model: T) -> Result<Arc<Entity<T>>, RepositoryError> {
        let id = id.unwrap_or_else(IdentityKey::generate);
        let mut ids = lock(&self.ids);
        if ids.contains(&id) {
            return Err(RepositoryError::Conflict(id));
        }
        ids.insert(id.clone());
        let entity = Arc::new(Entity::new(id, model));
        let mut next = (*self.records.load_full()).clone();
        next.push(Arc::clone(&entity));
        self.records.store(Arc::new(next));
        Ok(entity)
    }

    pub fn remove(&self, id: &IdentityKey) -> bool {
        let mut ids = lock(&self.ids);
        if !ids.remove(id) {
            return false;
        }
        let mut next = (*self.records.load_full()).clone();
        next.retain(|e| e.identity() != id);
        self.records.store(Arc::new(next));
        true
    }
}

impl<T: DeserializeOwned + Send + Sync + 'static> MemoryRepository<T> {
    /// Insert one plain object; a string `__uuid` key becomes the identity.
    pub fn insert_plain(&self, mut plain: Map<String, Value>) -> Result<Arc<Entity<T>>, StoreError> {
        let id = match plain.remove(IDENTITY_FIELD) {
            Some(Value::String(s)) => Some(IdentityKey::new(s)),
            Some(other) => return Err(StoreError::InvalidRecord(format!("{} must be a string, got {}", IDENTITY_FIELD, other))),
            None => None,
        };
        let model: T = serde_json::from_value(Value::Object(plain))?;
        Ok(self.insert(id, model)?)
    }

    /// Seed from a JSON array of objects.
    pub fn load_plain(&self, doc: Value) -> Result<usize, StoreError> {
        let items = match doc {
            Value::Array(items) => items,
            _ => return Err(StoreError::InvalidRecord("expected a JSON array of objects".into())),
        };
        let mut n = 0usize;
        for (i, item) in items.into_iter().enumerate() {
            match item {
                Value::Object(map) => {
                    self.insert_plain(map)?;
                    n += 1;
                }
                _ => return Err(StoreError::InvalidRecord(format!("item {} is not an object", i))),
            }
        }
        info!(records = n, "store: seeded");
        Ok(n)
    }
}

impl<T: Send + Sync + 'static> Default for MemoryRepository<T> {
    fn default() -> Self { Self::new() }
}

#[async_trait::async_trait]
impl<T> Repository<T> for MemoryRepository<T>
where
    T: Serialize + DeserializeOwned + Default + Send + Sync + 'static,
{
    /// Start from `T::default()`, apply the create context, then `data`
    /// (internal keys ignored). Explicit data wins over context defaults.
    async fn create(
        &self,
        data: Option<CreateData>,
        id: Option<IdentityKey>,
        context: Option<CreateContext>,
    ) -> Result<Arc<Entity<T>>, RepositoryError> {
        let mut fields = match serde_json::to_value(T::default())? {
            Value::Object(m) => m,
            _ => return Err(RepositoryError::Validation("model default is not an object".into())),
        };
        if let Some(ctx) = context {
            fields.extend(ctx.defaults);
        }
        if let Some(data) = data {
            fields.extend(data.into_iter().filter(|(k, _)| !k.starts_with(INTERNAL_FIELD_MARKER)));
        }
        let model: T = serde_json::from_value(Value::Object(fields))?;
        let entity = self.insert(id, model)?;
        counter!("quire_creates_total", 1u64);
        debug!(id = %entity.identity(), "store: created");
        Ok(entity)
    }
}

/// Page window and sort a [`MemoryBus`] applies to each execution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageWindow {
    pub index: usize,
    /// Zero means unpaginated.
    pub size: usize,
    pub sort: PageSort,
}

impl PageWindow {
    fn merge(&mut self, req: &ChangeRequest) {
        if let Some(i) = req.page_index { self.index = i; }
        if let Some(s) = req.page_size { self.size = s; }
        if let Some(sort) = &req.page_sort { self.sort = sort.clone(); }
    }

    fn slice<E: Clone>(&self, all: &[E]) -> Vec<E> {
        if self.size == 0 {
            return all.to_vec();
        }
        let start = self.index.saturating_mul(self.size);
        if start >= all.len() {
            return Vec::new();
        }
        let end = start.saturating_add(self.size).min(all.len());
        all[start..end].to_vec()
    }
}

/// Total order over plain values: missing/null < bool < number < string < other.
fn cmp_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    fn rank(v: Option<&Value>) -> u8 {
        match v {
            None | Some(Value::Null) => 0,
            Some(Value::Bool(_)) => 1,
            Some(Value::Number(_)) => 2,
            Some(Value::String(_)) => 3,
            Some(Value::Array(_)) => 4,
            Some(Value::Object(_)) => 5,
        }
    }
    match (a, b) {
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(Value::Number(x)), Some(Value::Number(y))) => cmp_numbers(x, y),
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}

/// Integers compare exactly; floats fall back to `f64`.
fn cmp_numbers(x: &Number, y: &Number) -> Ordering {
    fn int(n: &Number) -> Option<i128> { n.as_i64().map(i128::from).or_else(|| n.as_u64().map(i128::from)) }
    match (int(x), int(y)) {
        (Some(a), Some(b)) => a.cmp(&b),
        _ => x.as_f64().unwrap_or(0.0).partial_cmp(&y.as_f64().unwrap_or(0.0)).unwrap_or(Ordering::Equal),
    }
}

struct Shared<T> {
    stream: ChangeStream<T>,
    repo: Arc<MemoryRepository<T>>,
    query: Mutex<Query>,
    window: Mutex<PageWindow>,
}

impl<T: Serialize + Send + Sync + 'static> Shared<T> {
    fn run(&self, seq: RequestSeq) -> Result<ChangeEvent<T>, StoreError> {
        let started = Instant::now();
        let query = lock(&self.query).clone();
        let window = lock(&self.window).clone();
        let snapshot = self.repo.snapshot();

        let mut rows: Vec<(Map<String, Value>, Arc<Entity<T>>)> = Vec::with_capacity(snapshot.len());
        for e in snapshot.iter() {
            let plain = e.to_plain()?;
            if query.matches(&plain) {
                rows.push((plain, Arc::clone(e)));
            }
        }
        if !window.sort.is_unsorted() {
            let field = window.sort.active.as_str();
            rows.sort_by(|(a, _), (b, _)| {
                let ord = cmp_values(a.get(field), b.get(field));
                match window.sort.direction {
                    SortDirection::Asc => ord,
                    SortDirection::Desc => ord.reverse(),
                }
            });
        }
        let all: Vec<Arc<Entity<T>>> = rows.into_iter().map(|(_, e)| e).collect();
        let visible = window.slice(&all);
        let count = all.len();

        histogram!("quire_exec_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("quire_executions_total", 1u64);
        debug!(seq, count, visible = visible.len(), page_index = window.index, page_size = window.size, "memory bus: executed");
        Ok(ChangeEvent::refreshed(Some(seq), visible, all, count))
    }
}

/// Change bus over a [`MemoryRepository`]. Its executor runs on the tokio
/// runtime current at construction.
pub struct MemoryBus<T: Send + Sync + 'static> {
    shared: Arc<Shared<T>>,
    exec_tx: mpsc::UnboundedSender<RequestSeq>,
}

impl<T: Serialize + Send + Sync + 'static> MemoryBus<T> {
    pub fn new(repo: Arc<MemoryRepository<T>>, query: Query) -> Result<Self, StoreError> {
        let runtime = tokio::runtime::Handle::try_current()?;
        let shared = Arc::new(Shared {
            stream: ChangeStream::new(),
            repo,
            query: Mutex::new(query),
            window: Mutex::new(PageWindow::default()),
        });
        let (exec_tx, mut exec_rx) = mpsc::unbounded_channel::<RequestSeq>();
        let worker = Arc::clone(&shared);
        runtime.spawn(async move {
            while let Some(seq) = exec_rx.recv().await {
                let mut latest = seq;
                let mut coalesced = 0u64;
                while let Ok(next) = exec_rx.try_recv() {
                    latest = latest.max(next);
                    coalesced += 1;
                }
                if coalesced > 0 {
                    counter!("quire_exec_coalesced_total", coalesced);
                    debug!(coalesced, seq = latest, "memory bus: coalesced executions");
                }
                match worker.run(latest) {
                    Ok(event) => worker.stream.publish(&event),
                    Err(e) => warn!(seq = latest, error = %e, "memory bus: execution failed"),
                }
            }
            debug!("memory bus: executor stopped");
        });
        Ok(Self { shared, exec_tx })
    }

    pub fn window(&self) -> PageWindow { lock(&self.shared.window).clone() }

    pub fn memory_repository(&self) -> Arc<MemoryRepository<T>> { Arc::clone(&self.shared.repo) }

    fn enqueue(&self, seq: RequestSeq) {
        if self.exec_tx.send(seq).is_err() {
            warn!(seq, "memory bus: executor gone; request dropped");
        }
    }
}

impl<T> ChangeBus<T> for MemoryBus<T>
where
    T: Serialize + DeserializeOwned + Default + Send + Sync + 'static,
{
    fn update_change_request(&self, request: ChangeRequest) {
        lock(&self.shared.window).merge(&request);
        debug!(seq = request.seq, page_index = ?request.page_index, page_size = ?request.page_size, "memory bus: change request");
        self.shared.stream.publish(&ChangeEvent::ack(&request));
        self.enqueue(request.seq);
    }

    fn change_stream(&self) -> &ChangeStream<T> { &self.shared.stream }

    fn execute(&self, query: &Query, seq: RequestSeq) {
        *lock(&self.shared.query) = query.clone();
        self.enqueue(seq);
    }

    fn query(&self) -> Query { lock(&self.shared.query).clone() }

    fn parsed_create_context(&self, query: &Query) -> CreateContext { query.create_context() }

    fn repository(&self) -> Arc<dyn Repository<T>> { Arc::clone(&self.shared.repo) as Arc<dyn Repository<T>> }
}
