//! Bus and repository contracts consumed by the paginator and the facade,
//! plus [`ManualBus`], a hand-driven bus for tests.

use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::{ChangeEvent, ChangeRequest, ChangeStream, Entity, IdentityKey, RequestSeq};

/// Partial record used to create an entity.
pub type CreateData = Map<String, Value>;

/// Equality constraint on a plain field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Filter {
    pub field: String,
    pub value: Value,
}

impl FromStr for Filter {
    type Err = String;

    /// Parses `field=value`; the value is read as JSON when possible, else as a string.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (field, raw) = s.split_once('=').ok_or_else(|| format!("invalid filter: {} (expect field=value)", s))?;
        let field = field.trim();
        if field.is_empty() {
            return Err(format!("invalid filter: {} (empty field)", s));
        }
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        Ok(Filter { field: field.to_string(), value })
    }
}

/// Query handed to a bus. The engine treats it as opaque; buses interpret the filters.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Query {
    pub filters: Vec<Filter>,
}

impl Query {
    pub fn new() -> Self { Self::default() }

    pub fn filter(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push(Filter { field: field.into(), value: value.into() });
        self
    }

    /// True when every filter holds on the plain record.
    pub fn matches(&self, plain: &Map<String, Value>) -> bool {
        self.filters.iter().all(|f| plain.get(&f.field) == Some(&f.value))
    }

    /// Field defaults a created record needs to satisfy this query.
    pub fn create_context(&self) -> CreateContext {
        let mut defaults = Map::new();
        for f in &self.filters {
            defaults.insert(f.field.clone(), f.value.clone());
        }
        CreateContext { defaults }
    }
}

/// Insert context derived from a parsed query.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CreateContext {
    pub defaults: Map<String, Value>,
}

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("conflict: identity {0} already exists")]
    Conflict(IdentityKey),
    #[error("validation: {0}")]
    Validation(String),
    #[error("serialization: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("unavailable: {0}")]
    Unavailable(String),
}

/// Entity factory behind a bus.
#[async_trait::async_trait]
pub trait Repository<T>: Send + Sync {
    async fn create(
        &self,
        data: Option<CreateData>,
        id: Option<IdentityKey>,
        context: Option<CreateContext>,
    ) -> Result<Arc<Entity<T>>, RepositoryError>;
}

/// Query executor and change notifier shared by a paginator and a facade.
pub trait ChangeBus<T: Send + Sync + 'static>: Send + Sync {
    /// Apply a partial page/sort change and re-run the query.
    fn update_change_request(&self, request: ChangeRequest);

    fn change_stream(&self) -> &ChangeStream<T>;

    /// Run `query`; the resulting refresh echoes `seq`.
    fn execute(&self, query: &Query, seq: RequestSeq);

    fn query(&self) -> Query;

    fn parsed_create_context(&self, query: &Query) -> CreateContext;

    fn repository(&self) -> Arc<dyn Repository<T>>;
}

fn lock<V>(m: &Mutex<V>) -> MutexGuard<'_, V> { m.lock().unwrap_or_else(PoisonError::into_inner) }

struct NoRepository;

#[async_trait::async_trait]
impl<T: Send + Sync + 'static> Repository<T> for NoRepository {
    async fn create(
        &self,
        _data: Option<CreateData>,
        _id: Option<IdentityKey>,
        _context: Option<CreateContext>,
    ) -> Result<Arc<Entity<T>>, RepositoryError> {
        Err(RepositoryError::Unavailable("no repository configured".into()))
    }
}

/// Bus driven by hand: records requests and executions, acknowledges change
/// requests synchronously, and publishes refreshes only when told to.
pub struct ManualBus<T: Send + Sync + 'static> {
    stream: ChangeStream<T>,
    query: Mutex<Query>,
    requests: Mutex<Vec<ChangeRequest>>,
    executions: Mutex<Vec<(Query, RequestSeq)>>,
    repository: Option<Arc<dyn Repository<T>>>,
}

impl<T: Send + Sync + 'static> ManualBus<T> {
    pub fn new() -> Self {
        Self {
            stream: ChangeStream::new(),
            query: Mutex::new(Query::default()),
            requests: Mutex::new(Vec::new()),
            executions: Mutex::new(Vec::new()),
            repository: None,
        }
    }

    pub fn with_query(self, query: Query) -> Self {
        *lock(&self.query) = query;
        self
    }

    pub fn with_repository(mut self, repository: Arc<dyn Repository<T>>) -> Self {
        self.repository = Some(repository);
        self
    }

    pub fn emit(&self, event: ChangeEvent<T>) { self.stream.publish(&event); }

    /// Publish an uncorrelated refresh with `count = all.len()`.
    pub fn emit_results(&self, results: Vec<Arc<Entity<T>>>, all: Vec<Arc<Entity<T>>>) {
        let count = all.len();
        self.emit(ChangeEvent::refreshed(None, results, all, count));
    }

    pub fn requests(&self) -> Vec<ChangeRequest> { lock(&self.requests).clone() }
    pub fn executions(&self) -> Vec<(Query, RequestSeq)> { lock(&self.executions).clone() }
}

impl<T: Send + Sync + 'static> Default for ManualBus<T> {
    fn default() -> Self { Self::new() }
}

impl<T: Send + Sync + 'static> ChangeBus<T> for ManualBus<T> {
    fn update_change_request(&self, request: ChangeRequest) {
        debug!(seq = request.seq, "manual bus: change request");
        lock(&self.requests).push(request.clone());
        self.stream.publish(&ChangeEvent::ack(&request));
    }

    fn change_stream(&self) -> &ChangeStream<T> { &self.stream }

    fn execute(&self, query: &Query, seq: RequestSeq) {
        debug!(seq, "manual bus: execute");
        lock(&self.executions).push((query.clone(), seq));
    }

    fn query(&self) -> Query { lock(&self.query).clone() }

    fn parsed_create_context(&self, query: &Query) -> CreateContext { query.create_context() }

    fn repository(&self) -> Arc<dyn Repository<T>> {
        match &self.repository {
            Some(r) => Arc::clone(r),
            None => Arc::new(NoRepository),
        }
    }
}
