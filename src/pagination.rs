//! Cursor state for backfilling older history.
//!
//! ```text
//! Initializing ──initial_loaded──► Idle | Exhausted
//!      └─────────fail_initial────► Idle
//!
//! Idle ──begin_older──► Loading ──complete_older──► Idle | Exhausted
//!                          └─────fail_older──────► Idle
//! ```
//!
//! Refreshes never touch this state; only initial loads reset it. No older
//! page is requested until the first page of the current load has landed.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    /// First page requested, not applied yet
    Initializing,
    Idle,
    Loading,
    Exhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    /// 1-based page number, page 1 being the most recent messages
    pub page: u32,
    pub page_size: u32,
}

/// Scroll compensation after older messages were prepended.
///
/// The item that was at `anchor_index_before` is now at
/// `anchor_index_before + prepended_count`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PrependDelta {
    pub prepended_count: usize,
    pub anchor_index_before: usize,
}

#[derive(Debug, Clone)]
pub struct PaginationController {
    current_page: u32,
    page_size: u32,
    has_more: bool,
    state: PageState,
}

impl PaginationController {
    pub fn new(page_size: u32) -> Self {
        Self {
            current_page: 1,
            page_size: page_size.max(1),
            has_more: true,
            state: PageState::Initializing,
        }
    }

    pub fn current_page(&self) -> u32 {
        self.current_page
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub fn has_more(&self) -> bool {
        self.has_more
    }

    pub fn state(&self) -> PageState {
        self.state
    }

    /// Start over from the newest page. Any older-page request in flight is
    /// forgotten, and backfill stays blocked until the first page is recorded.
    pub fn reset(&mut self) -> PageRequest {
        self.current_page = 1;
        self.has_more = true;
        self.state = PageState::Initializing;
        PageRequest {
            page: 1,
            page_size: self.page_size,
        }
    }

    /// Request used by refreshes. Does not move the cursor.
    pub fn recent(&self) -> PageRequest {
        PageRequest {
            page: 1,
            page_size: self.page_size,
        }
    }

    /// Record the size of the first page.
    pub fn initial_loaded(&mut self, returned: usize, has_more_hint: Option<bool>) {
        self.has_more = self.more_after(returned, has_more_hint);
        self.state = if self.has_more {
            PageState::Idle
        } else {
            PageState::Exhausted
        };
    }

    /// The first page could not be fetched. Backfill from page 2 is allowed
    /// again so locally stored history can still be extended.
    pub fn fail_initial(&mut self) {
        if self.state == PageState::Initializing {
            self.state = PageState::Idle;
        }
    }

    /// Claim the next older page. `None` while loading or once exhausted.
    pub fn begin_older(&mut self) -> Option<PageRequest> {
        if self.state != PageState::Idle || !self.has_more {
            return None;
        }
        self.state = PageState::Loading;
        Some(PageRequest {
            page: self.current_page + 1,
            page_size: self.page_size,
        })
    }

    pub fn complete_older(&mut self, returned: usize, has_more_hint: Option<bool>) {
        self.current_page += 1;
        self.initial_loaded(returned, has_more_hint);
    }

    /// The older-page fetch failed; the same page will be requested next time.
    pub fn fail_older(&mut self) {
        if self.state == PageState::Loading {
            self.state = PageState::Idle;
        }
    }

    fn more_after(&self, returned: usize, has_more_hint: Option<bool>) -> bool {
        returned >= self.page_size as usize && has_more_hint != Some(false)
    }
}
