//! Pagination state shared by all provider connectors
//!
//! Supports the two paging styles providers use:
//! - Cursor: opaque continuation token (`NextToken`, `nextLink`)
//! - Offset: numeric start index advanced by the page size
//!
//! Includes a page budget (`max_pages`) so a provider that keeps returning a
//! continuation token can never drive an unbounded ingestion loop.

use std::fmt;

/// Default number of items requested per page
pub const DEFAULT_PAGE_SIZE: u32 = 100;

/// Largest page size any connector may request
pub const MAX_PAGE_SIZE: u32 = 10_000;

/// Default page budget per logical fetch
pub const DEFAULT_MAX_PAGES: u32 = 1_000;

/// Pagination errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PaginationError {
    /// Advancing a cursor page before the provider supplied the next cursor
    #[error("no next cursor recorded for page {page}")]
    MissingCursor {
        /// Pages fetched so far
        page: u32,
    },

    /// The page budget is spent
    #[error("page budget exhausted after {max_pages} pages")]
    BudgetExhausted {
        /// Configured budget
        max_pages: u32,
    },
}

/// Position within a paged result set; exactly one style is active
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PagePosition {
    /// Opaque cursor; `None` on the first page
    Cursor(Option<String>),
    /// Zero-based item offset
    Offset(u64),
}

/// Stateful page iterator
#[derive(Debug, Clone)]
pub struct PaginationCursor {
    position: PagePosition,
    next_cursor: Option<String>,
    page_size: u32,
    pages_fetched: u32,
    items_fetched: u64,
    max_pages: u32,
    exhausted: bool,
}

impl PaginationCursor {
    /// Cursor-mode pagination
    pub fn cursor(page_size: u32, max_pages: u32) -> Self {
        Self::new(PagePosition::Cursor(None), page_size, max_pages)
    }

    /// Offset-mode pagination starting at zero
    pub fn offset(page_size: u32, max_pages: u32) -> Self {
        Self::new(PagePosition::Offset(0), page_size, max_pages)
    }

    fn new(position: PagePosition, page_size: u32, max_pages: u32) -> Self {
        let page_size = if page_size == 0 {
            DEFAULT_PAGE_SIZE
        } else {
            page_size.min(MAX_PAGE_SIZE)
        };
        let max_pages = if max_pages == 0 {
            DEFAULT_MAX_PAGES
        } else {
            max_pages
        };

        Self {
            position,
            next_cursor: None,
            page_size,
            pages_fetched: 0,
            items_fetched: 0,
            max_pages,
            exhausted: false,
        }
    }

    /// Current position to request
    pub fn position(&self) -> &PagePosition {
        &self.position
    }

    /// Cursor to send with the next request, if in cursor mode and past page one
    pub fn current_cursor(&self) -> Option<&str> {
        match &self.position {
            PagePosition::Cursor(cursor) => cursor.as_deref(),
            PagePosition::Offset(_) => None,
        }
    }

    /// Offset to send with the next request (zero in cursor mode)
    pub fn current_offset(&self) -> u64 {
        match self.position {
            PagePosition::Offset(offset) => offset,
            PagePosition::Cursor(_) => 0,
        }
    }

    /// Items requested per page
    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    /// Pages recorded so far
    pub fn pages_fetched(&self) -> u32 {
        self.pages_fetched
    }

    /// Items recorded so far
    pub fn items_fetched(&self) -> u64 {
        self.items_fetched
    }

    /// Page budget
    pub fn max_pages(&self) -> u32 {
        self.max_pages
    }

    /// Error if issuing another request would exceed the page budget
    pub fn check_budget(&self) -> Result<(), PaginationError> {
        if self.pages_fetched >= self.max_pages {
            return Err(PaginationError::BudgetExhausted {
                max_pages: self.max_pages,
            });
        }
        Ok(())
    }

    /// Record a fetched page.
    ///
    /// In cursor mode `next_cursor` is the provider's continuation token; an
    /// absent or empty token marks the end. In offset mode a page shorter than
    /// `page_size` marks the end and `next_cursor` is ignored.
    pub fn record_page(&mut self, items: usize, next_cursor: Option<String>) {
        self.pages_fetched += 1;
        self.items_fetched += items as u64;

        match self.position {
            PagePosition::Cursor(_) => {
                self.next_cursor = next_cursor.filter(|c| !c.is_empty());
                if self.next_cursor.is_none() {
                    self.exhausted = true;
                }
            }
            PagePosition::Offset(_) => {
                if items < self.page_size as usize {
                    self.exhausted = true;
                }
            }
        }
    }

    /// Mark the result set as finished regardless of mode
    pub fn mark_exhausted(&mut self) {
        self.exhausted = true;
    }

    /// Move to the next page.
    ///
    /// Cursor mode requires a cursor from [`record_page`](Self::record_page);
    /// offset mode advances by `page_size` unconditionally.
    pub fn advance_page(&mut self) -> Result<(), PaginationError> {
        match &mut self.position {
            PagePosition::Cursor(current) => {
                let next = self.next_cursor.take().ok_or(PaginationError::MissingCursor {
                    page: self.pages_fetched,
                })?;
                *current = Some(next);
            }
            PagePosition::Offset(offset) => {
                *offset += u64::from(self.page_size);
            }
        }
        Ok(())
    }

    /// True when the provider signalled the end or the page budget is spent
    pub fn is_done(&self) -> bool {
        self.exhausted || self.pages_fetched >= self.max_pages
    }

    /// True when the loop stopped because of the budget rather than the provider
    pub fn hit_page_budget(&self) -> bool {
        !self.exhausted && self.pages_fetched >= self.max_pages
    }

    /// One-line summary for logs
    pub fn summary(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for PaginationCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = match self.position {
            PagePosition::Cursor(_) => "cursor",
            PagePosition::Offset(_) => "offset",
        };
        write!(
            f,
            "mode={} pages={}/{} items={} page_size={} done={}",
            mode,
            self.pages_fetched,
            self.max_pages,
            self.items_fetched,
            self.page_size,
            self.is_done()
        )
    }
}
