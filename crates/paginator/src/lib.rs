//! Quire paginator: page/sort state, the materialized result window and the
//! selection over it, kept in sync with a [`ChangeBus`].
//!
//! The paginator is the only writer of the result window and the selection.
//! It subscribes to the bus's change stream at construction; because the
//! stream dispatches in registration order, anything woken by a refresh
//! afterwards sees the paginator's updated state.

#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use futures::future::{self, BoxFuture, FutureExt};
use metrics::counter;
use quire_core::{ChangeBus, ChangeEvent, ChangeRequest, Entity, PageSort, SortDirection, Subscription};
use smallvec::SmallVec;
use tokio::sync::watch;
use tracing::{debug, trace};

mod cell;
mod defaults;
mod selection;

pub use cell::StateCell;
pub use defaults::PaginatorDefaults;
pub use selection::{ResultWindow, SelectionTracker};

/// Requested page change; `None` fields are left as they are.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageEvent {
    pub page_index: Option<usize>,
    pub page_size: Option<usize>,
}

impl PageEvent {
    pub fn index(i: usize) -> Self { Self { page_index: Some(i), page_size: None } }
    pub fn size(s: usize) -> Self { Self { page_index: None, page_size: Some(s) } }
}

struct PageState<T> {
    page_index: usize,
    page_size: usize,
    page_size_options: SmallVec<[usize; 8]>,
    page_sort: PageSort,
    has_page_size_changes: bool,
    window: ResultWindow<T>,
    selection: SelectionTracker,
}

struct Inner<T: Send + Sync + 'static> {
    bus: Arc<dyn ChangeBus<T>>,
    state: Mutex<PageState<T>>,
    selected_all: StateCell<bool>,
    selected_count: StateCell<usize>,
    listener: Mutex<Option<Subscription>>,
}

fn lock<V>(m: &Mutex<V>) -> MutexGuard<'_, V> { m.lock().unwrap_or_else(PoisonError::into_inner) }

fn insert_option(options: &mut SmallVec<[usize; 8]>, size: usize) {
    if size == 0 {
        return;
    }
    if let Err(pos) = options.binary_search(&size) {
        options.insert(pos, size);
    }
}

impl<T: Send + Sync + 'static> Inner<T> {
    fn state(&self) -> MutexGuard<'_, PageState<T>> { lock(&self.state) }

    fn publish_selection(&self, st: &PageState<T>) {
        self.selected_all.set(st.selection.is_select_all());
        self.selected_count.set(st.selection.count());
    }

    fn apply(&self, ev: &ChangeEvent<T>) {
        let mut st = self.state();
        if let Some(count) = ev.count {
            st.window.length = count;
        }
        if let (Some(results), Some(all)) = (&ev.results, &ev.results_all) {
            let PageState { window, selection, .. } = &mut *st;
            selection.refresh(window, results.clone(), all.clone());
            self.publish_selection(&st);
            trace!(seq = ?ev.seq, visible = st.window.visible.len(), length = st.window.length, selected = st.selection.count(), "paginator: refreshed");
        }
    }

    fn detach(&self) {
        if let Some(sub) = lock(&self.listener).take() {
            sub.unsubscribe();
        }
    }
}

impl<T: Send + Sync + 'static> Drop for Inner<T> {
    fn drop(&mut self) { self.detach(); }
}

/// Page, sort and selection state for one query. Cheap to clone; clones share state.
pub struct Paginator<T: Send + Sync + 'static> {
    inner: Arc<Inner<T>>,
}

impl<T: Send + Sync + 'static> Clone for Paginator<T> {
    fn clone(&self) -> Self { Self { inner: Arc::clone(&self.inner) } }
}

/// Non-owning handle; lets bus listeners reach a paginator without keeping it alive.
pub struct WeakPaginator<T: Send + Sync + 'static> {
    inner: Weak<Inner<T>>,
}

impl<T: Send + Sync + 'static> WeakPaginator<T> {
    pub fn upgrade(&self) -> Option<Paginator<T>> { self.inner.upgrade().map(|inner| Paginator { inner }) }
}

impl<T: Send + Sync + 'static> Clone for WeakPaginator<T> {
    fn clone(&self) -> Self { Self { inner: Weak::clone(&self.inner) } }
}

impl<T: Send + Sync + 'static> Paginator<T> {
    pub fn new(bus: Arc<dyn ChangeBus<T>>) -> Self { Self::with_defaults(bus, PaginatorDefaults::default()) }

    /// Seed page size, options and sort. A non-passive default is sent to the
    /// bus once, without waiting for the refresh.
    pub fn with_defaults(bus: Arc<dyn ChangeBus<T>>, defaults: PaginatorDefaults) -> Self {
        let mut options: SmallVec<[usize; 8]> = SmallVec::new();
        for size in defaults.page_size_options.iter().copied().chain(std::iter::once(defaults.page_size)) {
            insert_option(&mut options, size);
        }
        let inner = Arc::new(Inner {
            bus,
            state: Mutex::new(PageState {
                page_index: 0,
                page_size: defaults.page_size,
                page_size_options: options,
                page_sort: defaults.page_sort.clone().unwrap_or_default(),
                has_page_size_changes: false,
                window: ResultWindow::default(),
                selection: SelectionTracker::new(),
            }),
            selected_all: StateCell::new(false),
            selected_count: StateCell::new(0),
            listener: Mutex::new(None),
        });
        let weak = Arc::downgrade(&inner);
        let sub = inner.bus.change_stream().subscribe(move |ev: &ChangeEvent<T>| {
            if let Some(inner) = weak.upgrade() {
                inner.apply(ev);
            }
        });
        *lock(&inner.listener) = Some(sub);

        let me = Self { inner };
        if !defaults.is_passive() {
            let mut req = ChangeRequest::new(me.inner.bus.change_stream().next_seq());
            if defaults.page_size > 0 {
                req.page_size = Some(defaults.page_size);
            }
            req.page_sort = defaults.page_sort;
            me.send(req);
        }
        me
    }

    pub fn downgrade(&self) -> WeakPaginator<T> { WeakPaginator { inner: Arc::downgrade(&self.inner) } }

    fn send(&self, req: ChangeRequest) {
        counter!("quire_change_requests_total", 1u64);
        debug!(seq = req.seq, page_index = ?req.page_index, page_size = ?req.page_size, sort = ?req.page_sort.as_ref().map(|s| &s.active), "paginator: change request");
        self.inner.bus.update_change_request(req);
    }

    /// Send `req` and resolve once the refresh answering it lands. Resolves
    /// `false` only if the bus's change stream is torn down first.
    fn send_and_wait(&self, mut req: ChangeRequest) -> BoxFuture<'static, bool> {
        let stream = self.inner.bus.change_stream();
        req.seq = stream.next_seq();
        let waiter = stream.wait_for_results(req.seq);
        self.send(req);
        async move { waiter.await.is_some() }.boxed()
    }

    /// Change page index and/or size. Unchanged values are ignored; when
    /// nothing changes no request is sent and the future is already resolved.
    pub fn set_page(&self, event: PageEvent) -> BoxFuture<'static, bool> {
        let mut req = ChangeRequest::default();
        {
            let mut st = self.inner.state();
            let (cur_index, cur_size) = (st.page_index, st.page_size);
            if let Some(i) = event.page_index.filter(|i| *i != cur_index) {
                st.page_index = i;
                req.page_index = Some(i);
            }
            if let Some(s) = event.page_size.filter(|s| *s != cur_size) {
                st.page_size = s;
                st.has_page_size_changes = true;
                req.page_size = Some(s);
            }
        }
        if req.is_empty() {
            trace!("paginator: set_page no-op");
            return future::ready(true).boxed();
        }
        self.send_and_wait(req)
    }

    /// Fire-and-forget index change.
    pub fn set_page_index(&self, page_index: usize) {
        self.inner.state().page_index = page_index;
        let mut req = ChangeRequest::new(self.inner.bus.change_stream().next_seq());
        req.page_index = Some(page_index);
        self.send(req);
    }

    /// Fire-and-forget sort change.
    pub fn set_page_sort(&self, page_sort: PageSort) {
        self.inner.state().page_sort = page_sort.clone();
        let mut req = ChangeRequest::new(self.inner.bus.change_stream().next_seq());
        req.page_sort = Some(page_sort);
        self.send(req);
    }

    /// Change page size. With `skip_notify` only local state changes and the
    /// future is already resolved.
    pub fn set_page_size(&self, size: usize, skip_notify: bool) -> BoxFuture<'static, bool> {
        {
            let mut st = self.inner.state();
            st.page_size = size;
            if skip_notify {
                return future::ready(true).boxed();
            }
            st.has_page_size_changes = true;
        }
        let req = ChangeRequest { page_size: Some(size), ..ChangeRequest::default() };
        self.send_and_wait(req)
    }

    pub fn add_page_size_option(&self, size: usize) { insert_option(&mut self.inner.state().page_size_options, size); }

    /// Replace the options; the result is sorted and deduplicated.
    pub fn set_page_size_options(&self, options: impl IntoIterator<Item = usize>) {
        let mut next: SmallVec<[usize; 8]> = SmallVec::new();
        for size in options {
            insert_option(&mut next, size);
        }
        self.inner.state().page_size_options = next;
    }

    /// Toggle one item, or everything when `item` is `None`.
    pub fn toggle_selection(&self, item: Option<&Entity<T>>) {
        let mut st = self.inner.state();
        let PageState { window, selection, .. } = &mut *st;
        match item {
            Some(e) => selection.toggle(e.identity(), window),
            None => selection.toggle_all(window),
        }
        self.inner.publish_selection(&st);
        counter!("quire_selection_toggles_total", 1u64);
        debug!(bulk = item.is_none(), select_all = st.selection.is_select_all(), selected = st.selection.count(), "paginator: selection toggled");
    }

    pub fn selected(&self) -> Vec<Arc<Entity<T>>> {
        let st = self.inner.state();
        st.selection.selected(&st.window)
    }

    pub fn is_selected(&self, item: &Entity<T>) -> bool { self.inner.state().selection.is_selected(item.identity()) }

    pub fn is_selected_all(&self) -> watch::Receiver<bool> { self.inner.selected_all.subscribe() }
    pub fn is_selected_all_now(&self) -> bool { self.inner.selected_all.get() }
    pub fn selected_count(&self) -> watch::Receiver<usize> { self.inner.selected_count.subscribe() }
    pub fn selected_count_now(&self) -> usize { self.inner.selected_count.get() }

    /// Visible window as of the last refresh.
    pub fn results(&self) -> Vec<Arc<Entity<T>>> { self.inner.state().window.visible.clone() }

    pub fn page_index(&self) -> usize { self.inner.state().page_index }
    pub fn page_size(&self) -> usize { self.inner.state().page_size }
    pub fn page_size_options(&self) -> Vec<usize> { self.inner.state().page_size_options.to_vec() }
    pub fn length(&self) -> usize { self.inner.state().window.length }
    pub fn page_sort(&self) -> PageSort { self.inner.state().page_sort.clone() }
    pub fn page_sort_property(&self) -> String { self.inner.state().page_sort.active.clone() }
    pub fn page_sort_direction(&self) -> SortDirection { self.inner.state().page_sort.direction }
    pub fn has_page_size_changes(&self) -> bool { self.inner.state().has_page_size_changes }

    /// Detach from the bus. Later events are no longer applied. Idempotent.
    pub fn dispose(&self) {
        self.inner.detach();
        debug!("paginator: disposed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quire_core::{IdentityKey, ManualBus};

    fn bus() -> Arc<ManualBus<u32>> { Arc::new(ManualBus::new()) }

    #[test]
    fn options_stay_sorted_and_unique() {
        let p = Paginator::<u32>::new(bus());
        p.add_page_size_option(25);
        p.add_page_size_option(10);
        p.add_page_size_option(25);
        assert_eq!(p.page_size_options(), vec![10, 25]);
        p.set_page_size_options([50, 5, 50, 0]);
        assert_eq!(p.page_size_options(), vec![5, 50]);
    }

    #[test]
    fn passive_defaults_send_nothing() {
        let b = bus();
        let _p = Paginator::<u32>::new(b.clone());
        assert!(b.requests().is_empty());
    }

    #[test]
    fn defaults_seed_state_and_notify_once() {
        let b = bus();
        let defaults = PaginatorDefaults {
            page_size_options: vec![50, 10],
            page_size: 25,
            page_sort: Some(PageSort::new("name", SortDirection::Desc)),
        };
        let p = Paginator::<u32>::with_defaults(b.clone(), defaults);
        assert_eq!(p.page_size(), 25);
        assert_eq!(p.page_size_options(), vec![10, 25, 50]);
        assert_eq!(p.page_sort_property(), "name");
        assert_eq!(p.page_sort_direction(), SortDirection::Desc);
        let reqs = b.requests();
        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs[0].page_size, Some(25));
        assert!(!p.has_page_size_changes());
    }

    #[test]
    fn count_without_results_only_updates_length() {
        let b = bus();
        let p = Paginator::<u32>::new(b.clone());
        b.emit(ChangeEvent { count: Some(12), ..ChangeEvent::default() });
        assert_eq!(p.length(), 12);
        assert!(p.results().is_empty());
    }

    #[test]
    fn dispose_stops_applying_events() {
        let b = bus();
        let p = Paginator::<u32>::new(b.clone());
        assert_eq!(b.change_stream().listener_count(), 1);
        p.dispose();
        p.dispose();
        assert_eq!(b.change_stream().listener_count(), 0);
        let e = Arc::new(Entity::new(IdentityKey::from("a"), 1u32));
        b.emit_results(vec![e.clone()], vec![e]);
        assert_eq!(p.length(), 0);
    }

    #[test]
    fn dropping_last_handle_detaches() {
        let b = bus();
        let p = Paginator::<u32>::new(b.clone());
        let p2 = p.clone();
        let weak = p.downgrade();
        drop(p);
        assert!(weak.upgrade().is_some());
        assert_eq!(b.change_stream().listener_count(), 1);
        drop(p2);
        assert!(weak.upgrade().is_none());
        assert_eq!(b.change_stream().listener_count(), 0);
    }
}
