//! Pagination types for history queries.
//!
//! Transaction history is served with cursor pagination: stable under
//! concurrent inserts, which page/offset pagination is not once the
//! synchronizer starts appending rows mid-scroll.

/// Opaque cursor for pagination.
///
/// The cursor value is implementation-specific and should be treated
/// as an opaque token by clients.
#[derive(Debug, Clone)]
pub struct Cursor {
    pub value: String,
}

/// Forward pagination parameters for list queries.
#[derive(Debug, Clone, Default)]
pub struct Pagination {
    /// Number of items to fetch.
    pub first: Option<i32>,
    /// Cursor to start after.
    pub after: Option<Cursor>,
}

impl Pagination {
    /// Fetch the first `n` items.
    pub fn first(n: i32) -> Self {
        Self {
            first: Some(n),
            after: None,
        }
    }
}

/// Paginated result set with edges and page info.
#[derive(Debug, Clone)]
pub struct Connection<T> {
    /// List of edges (node + cursor pairs).
    pub edges: Vec<Edge<T>>,
    /// Information about the current page.
    pub page_info: PageInfo,
    /// Total count of items (optional, expensive to compute).
    pub total_count: Option<i64>,
}

impl<T> Connection<T> {
    /// Consume the connection, yielding the nodes in order.
    pub fn into_nodes(self) -> Vec<T> {
        self.edges.into_iter().map(|e| e.node).collect()
    }
}

/// A single item in a paginated result.
#[derive(Debug, Clone)]
pub struct Edge<T> {
    /// The actual item.
    pub node: T,
    /// Cursor for this item (used for pagination).
    pub cursor: Cursor,
}

/// Information about the current page in a paginated result.
#[derive(Debug, Clone)]
pub struct PageInfo {
    /// Whether there are more items after this page.
    pub has_next_page: bool,
    /// Whether there are items before this page.
    pub has_previous_page: bool,
    /// Cursor of the first item in this page.
    pub start_cursor: Option<Cursor>,
    /// Cursor of the last item in this page.
    pub end_cursor: Option<Cursor>,
}

/// Ordering direction for sorted queries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OrderDirection {
    /// Ascending order (oldest first).
    Asc,
    /// Descending order (newest first) - the history default.
    #[default]
    Desc,
}
