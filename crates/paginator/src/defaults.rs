use quire_core::PageSort;
use serde::{Deserialize, Serialize};

/// Initial page state for a paginator.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PaginatorDefaults {
    pub page_size_options: Vec<usize>,
    /// Zero means unpaginated.
    pub page_size: usize,
    pub page_sort: Option<PageSort>,
}

impl PaginatorDefaults {
    /// Read `QUIRE_PAGE_SIZE`, `QUIRE_PAGE_SIZE_OPTIONS` (comma separated) and
    /// `QUIRE_PAGE_SORT` (`field` or `field:asc|desc`). Unparsable values are ignored.
    pub fn from_env() -> Self { Self::from_lookup(|k| std::env::var(k).ok()) }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let page_size = get("QUIRE_PAGE_SIZE").and_then(|s| s.trim().parse::<usize>().ok()).unwrap_or(0);
        let page_size_options = get("QUIRE_PAGE_SIZE_OPTIONS")
            .map(|s| s.split(',').filter_map(|p| p.trim().parse::<usize>().ok()).collect())
            .unwrap_or_default();
        let page_sort = get("QUIRE_PAGE_SORT").and_then(|s| s.parse::<PageSort>().ok()).filter(|s| !s.is_unsorted());
        Self { page_size_options, page_size, page_sort }
    }

    /// True when nothing needs to be sent to the bus at construction.
    pub fn is_passive(&self) -> bool { self.page_size == 0 && self.page_sort.is_none() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quire_core::SortDirection;

    #[test]
    fn lookup_parses_and_skips_garbage() {
        let d = PaginatorDefaults::from_lookup(|k| match k {
            "QUIRE_PAGE_SIZE" => Some("25".into()),
            "QUIRE_PAGE_SIZE_OPTIONS" => Some("10, x, 50".into()),
            "QUIRE_PAGE_SORT" => Some("name:desc".into()),
            _ => None,
        });
        assert_eq!(d.page_size, 25);
        assert_eq!(d.page_size_options, vec![10, 50]);
        assert_eq!(d.page_sort, Some(PageSort::new("name", SortDirection::Desc)));
        assert!(!d.is_passive());
        assert!(PaginatorDefaults::from_lookup(|_| None).is_passive());
    }
}
