//! Selection bookkeeping over a result window.
//!
//! Outside select-all mode the count only covers identities in the visible
//! window; identities selected on other pages are remembered in `per_item`
//! but not counted until they are visible again.

use std::sync::Arc;

use quire_core::{Entity, IdentityKey};
use rustc_hash::FxHashMap;

/// Materialized results as of the last refresh.
#[derive(Debug)]
pub struct ResultWindow<T> {
    pub visible: Vec<Arc<Entity<T>>>,
    pub all: Vec<Arc<Entity<T>>>,
    /// Total count reported by the bus; independent of page size.
    pub length: usize,
}

impl<T> Default for ResultWindow<T> {
    fn default() -> Self { Self { visible: Vec::new(), all: Vec::new(), length: 0 } }
}

#[derive(Debug, Default)]
pub struct SelectionTracker {
    per_item: FxHashMap<IdentityKey, bool>,
    select_all: bool,
    count: usize,
}

impl SelectionTracker {
    pub fn new() -> Self { Self::default() }

    pub fn is_select_all(&self) -> bool { self.select_all }
    pub fn count(&self) -> usize { self.count }

    pub fn is_selected(&self, id: &IdentityKey) -> bool { self.per_item.get(id).copied().unwrap_or(false) }

    /// Flip one identity, then re-derive select-all from `count == length`.
    pub fn toggle<T>(&mut self, id: &IdentityKey, window: &ResultWindow<T>) {
        let flipped = !self.is_selected(id);
        self.per_item.insert(id.clone(), flipped);
        self.select_all = false;
        self.count = self.count_selected(window);
        self.select_all = window.length == self.count;
        self.count = self.count_selected(window);
    }

    /// Bulk toggle: deselect everything when in select-all mode with a
    /// selection, otherwise select every identity in `all`.
    pub fn toggle_all<T>(&mut self, window: &ResultWindow<T>) {
        self.count = self.count_selected(window);
        if self.count > 0 && self.select_all {
            self.per_item.values_mut().for_each(|v| *v = false);
            self.select_all = false;
        } else {
            for e in &window.all {
                self.per_item.insert(e.identity().clone(), true);
            }
            self.select_all = true;
        }
        self.count = self.count_selected(window);
    }

    /// Apply refreshed results. `window.length` must already hold the new count.
    pub fn refresh<T>(&mut self, window: &mut ResultWindow<T>, results: Vec<Arc<Entity<T>>>, results_all: Vec<Arc<Entity<T>>>) {
        self.select_all = window.length == self.count && self.count > 0;
        self.assimilate(&results);
        window.visible = results;
        window.all = results_all;
        self.count = self.count_selected(window);
    }

    /// Selected subset: `all` in select-all mode, else the selected visible
    /// items. Visited items get their `selected_view` flag updated.
    pub fn selected<T>(&self, window: &ResultWindow<T>) -> Vec<Arc<Entity<T>>> {
        if self.select_all {
            return window.all.clone();
        }
        let mut out = Vec::new();
        for e in &window.visible {
            let on = self.is_selected(e.identity());
            e.mark_selected_view(on);
            if on {
                out.push(Arc::clone(e));
            }
        }
        out
    }

    fn assimilate<T>(&mut self, visible: &[Arc<Entity<T>>]) {
        for e in visible {
            self.per_item.entry(e.identity().clone()).or_insert(self.select_all);
        }
    }

    fn count_selected<T>(&self, window: &ResultWindow<T>) -> usize {
        if self.select_all {
            return window.all.len();
        }
        window.visible.iter().filter(|e| self.is_selected(e.identity())).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ents(ids: &[&str]) -> Vec<Arc<Entity<()>>> {
        ids.iter().map(|id| Arc::new(Entity::new(IdentityKey::from(*id), ()))).collect()
    }

    fn window(visible: &[&str], all: &[&str]) -> ResultWindow<()> {
        ResultWindow { visible: ents(visible), all: ents(all), length: all.len() }
    }

    #[test]
    fn toggle_counts_only_visible_identities() {
        let w = window(&["a", "b"], &["a", "b", "c", "d"]);
        let mut s = SelectionTracker::new();
        s.toggle(&IdentityKey::from("a"), &w);
        assert_eq!(s.count(), 1);
        s.toggle(&IdentityKey::from("c"), &w);
        assert!(s.is_selected(&IdentityKey::from("c")));
        assert_eq!(s.count(), 1);
        s.toggle(&IdentityKey::from("a"), &w);
        assert_eq!(s.count(), 0);
        assert!(!s.is_select_all());
    }

    #[test]
    fn toggling_every_item_enters_select_all() {
        let w = window(&["a", "b"], &["a", "b"]);
        let mut s = SelectionTracker::new();
        s.toggle(&IdentityKey::from("a"), &w);
        assert!(!s.is_select_all());
        s.toggle(&IdentityKey::from("b"), &w);
        assert!(s.is_select_all());
        assert_eq!(s.count(), 2);
    }

    #[test]
    fn bulk_toggle_selects_then_clears() {
        let w = window(&["a"], &["a", "b", "c"]);
        let mut s = SelectionTracker::new();
        s.toggle_all(&w);
        assert!(s.is_select_all());
        assert_eq!(s.count(), 3);
        assert_eq!(s.selected(&w).len(), 3);

        s.toggle_all(&w);
        assert!(!s.is_select_all());
        assert_eq!(s.count(), 0);
        assert!(!s.is_selected(&IdentityKey::from("b")));
    }

    #[test]
    fn bulk_toggle_with_partial_selection_selects_all() {
        let w = window(&["a", "b"], &["a", "b", "c"]);
        let mut s = SelectionTracker::new();
        s.toggle(&IdentityKey::from("a"), &w);
        s.toggle_all(&w);
        assert!(s.is_select_all());
        assert_eq!(s.count(), 3);
    }

    #[test]
    fn refresh_initializes_new_identities_from_select_all() {
        let mut w = window(&["a"], &["a", "b"]);
        let mut s = SelectionTracker::new();
        s.toggle_all(&w);
        // next page arrives while select-all holds
        w.length = 2;
        s.refresh(&mut w, ents(&["b"]), ents(&["a", "b"]));
        assert!(s.is_select_all());
        assert!(s.is_selected(&IdentityKey::from("b")));
        assert_eq!(s.count(), 2);
    }

    #[test]
    fn refresh_drops_select_all_when_length_grows() {
        let mut w = window(&["a", "b"], &["a", "b"]);
        let mut s = SelectionTracker::new();
        s.toggle_all(&w);
        w.length = 3;
        s.refresh(&mut w, ents(&["a", "b", "c"]), ents(&["a", "b", "c"]));
        assert!(!s.is_select_all());
        assert!(!s.is_selected(&IdentityKey::from("c")));
        assert_eq!(s.count(), 2);
    }

    #[test]
    fn selected_marks_visited_items() {
        let w = window(&["a", "b"], &["a", "b", "c"]);
        let mut s = SelectionTracker::new();
        s.toggle(&IdentityKey::from("b"), &w);
        let sel = s.selected(&w);
        assert_eq!(sel.len(), 1);
        assert!(!w.visible[0].selected_view());
        assert!(w.visible[1].selected_view());
    }
}
