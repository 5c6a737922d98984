//! Quire core types: entities, identity keys and change records shared by the
//! paginator, the consumer facade and bus implementations.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

mod bus;
mod stream;

pub use bus::{ChangeBus, CreateContext, CreateData, Filter, ManualBus, Query, Repository, RepositoryError};
pub use stream::{ChangeStream, ResultsWaiter, Subscription};

/// Prefix marking bookkeeping keys in an entity's plain form.
pub const INTERNAL_FIELD_MARKER: &str = "__";

/// Key under which the identity is written by [`Entity::to_plain`].
pub const IDENTITY_FIELD: &str = "__uuid";

/// Monotonic sequence number of a change request, echoed by buses that correlate.
pub type RequestSeq = u64;

/// Opaque per-entity token; the only key used for selection and equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityKey(String);

impl IdentityKey {
    pub fn new(raw: impl Into<String>) -> Self { Self(raw.into()) }

    /// Fresh random key (UUID v4).
    pub fn generate() -> Self { Self(uuid::Uuid::new_v4().to_string()) }

    pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

impl From<&str> for IdentityKey {
    fn from(v: &str) -> Self { Self(v.to_string()) }
}

impl From<String> for IdentityKey {
    fn from(v: String) -> Self { Self(v) }
}

/// A domain model with an out-of-band identity.
///
/// `selected_view` is a presentation annotation written by the paginator when
/// it computes the selected subset; it is not part of the selection state.
#[derive(Debug)]
pub struct Entity<T> {
    id: IdentityKey,
    model: T,
    selected_view: AtomicBool,
}

impl<T> Entity<T> {
    pub fn new(id: IdentityKey, model: T) -> Self {
        Self { id, model, selected_view: AtomicBool::new(false) }
    }

    pub fn identity(&self) -> &IdentityKey { &self.id }
    pub fn model(&self) -> &T { &self.model }

    pub fn selected_view(&self) -> bool { self.selected_view.load(Ordering::Relaxed) }
    pub fn mark_selected_view(&self, selected: bool) { self.selected_view.store(selected, Ordering::Relaxed) }
}

impl<T: Serialize> Entity<T> {
    /// Plain object form: the model's fields followed by the identity under [`IDENTITY_FIELD`].
    pub fn to_plain(&self) -> Result<Map<String, Value>, serde_json::Error> {
        match serde_json::to_value(&self.model)? {
            Value::Object(mut map) => {
                map.insert(IDENTITY_FIELD.to_string(), Value::String(self.id.0.clone()));
                Ok(map)
            }
            other => Err(<serde_json::Error as serde::ser::Error>::custom(format!(
                "entity {} model is not an object (got {})",
                self.id,
                kind_of(&other)
            ))),
        }
    }
}

impl<T> PartialEq for Entity<T> {
    fn eq(&self, other: &Self) -> bool { self.id == other.id }
}

impl<T> Eq for Entity<T> {}

/// Drop every key carrying the internal marker; remaining keys keep their order.
pub fn strip_internal_fields(map: &mut Map<String, Value>) {
    map.retain(|k, _| !k.starts_with(INTERNAL_FIELD_MARKER));
}

fn kind_of(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

impl SortDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        }
    }
}

impl fmt::Display for SortDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl FromStr for SortDirection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "asc" => Ok(SortDirection::Asc),
            "desc" => Ok(SortDirection::Desc),
            _ => Err(format!("invalid sort direction: {} (expect asc or desc)", s)),
        }
    }
}

/// Active sort field and direction. An empty `active` means unsorted.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PageSort {
    pub active: String,
    pub direction: SortDirection,
}

impl PageSort {
    pub fn new(active: impl Into<String>, direction: SortDirection) -> Self {
        Self { active: active.into(), direction }
    }

    pub fn is_unsorted(&self) -> bool { self.active.is_empty() }
}

impl FromStr for PageSort {
    type Err = String;

    /// Parses `field` or `field:asc|desc`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((field, dir)) => Ok(PageSort::new(field.trim(), dir.trim().parse()?)),
            None => Ok(PageSort::new(s.trim(), SortDirection::Asc)),
        }
    }
}

/// Partial page/sort change sent to a bus.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChangeRequest {
    pub seq: RequestSeq,
    pub page_index: Option<usize>,
    pub page_size: Option<usize>,
    pub page_sort: Option<PageSort>,
}

impl ChangeRequest {
    pub fn new(seq: RequestSeq) -> Self { Self { seq, ..Self::default() } }

    /// True when no page or sort field is carried.
    pub fn is_empty(&self) -> bool {
        self.page_index.is_none() && self.page_size.is_none() && self.page_sort.is_none()
    }
}

/// Message emitted by a bus: either an acknowledgment of a change request
/// (page/sort fields only) or a completed refresh (carries `results`).
#[derive(Debug)]
pub struct ChangeEvent<T> {
    pub seq: Option<RequestSeq>,
    pub page_index: Option<usize>,
    pub page_size: Option<usize>,
    pub page_sort: Option<PageSort>,
    pub results: Option<Vec<std::sync::Arc<Entity<T>>>>,
    pub results_all: Option<Vec<std::sync::Arc<Entity<T>>>>,
    pub count: Option<usize>,
}

impl<T> ChangeEvent<T> {
    /// Acknowledgment echoing a change request.
    pub fn ack(request: &ChangeRequest) -> Self {
        Self {
            seq: Some(request.seq),
            page_index: request.page_index,
            page_size: request.page_size,
            page_sort: request.page_sort.clone(),
            ..Self::default()
        }
    }

    /// Completed refresh carrying the visible window, the full result set and the total count.
    pub fn refreshed(
        seq: Option<RequestSeq>,
        results: Vec<std::sync::Arc<Entity<T>>>,
        results_all: Vec<std::sync::Arc<Entity<T>>>,
        count: usize,
    ) -> Self {
        Self { seq, results: Some(results), results_all: Some(results_all), count: Some(count), ..Self::default() }
    }

    pub fn is_refresh(&self) -> bool { self.results.is_some() }
}

impl<T> Default for ChangeEvent<T> {
    fn default() -> Self {
        Self { seq: None, page_index: None, page_size: None, page_sort: None, results: None, results_all: None, count: None }
    }
}

impl<T> Clone for ChangeEvent<T> {
    fn clone(&self) -> Self {
        Self {
            seq: self.seq,
            page_index: self.page_index,
            page_size: self.page_size,
            page_sort: self.page_sort.clone(),
            results: self.results.clone(),
            results_all: self.results_all.clone(),
            count: self.count,
        }
    }
}

pub mod prelude {
    pub use super::{
        ChangeBus, ChangeEvent, ChangeRequest, ChangeStream, CreateData, Entity, Filter, IdentityKey, PageSort, Query,
        Repository, RequestSeq, SortDirection, Subscription,
    };
}
