//! Paging parameters for job listings.

use serde::{Deserialize, Serialize};

use crate::stats::JobStats;

pub const DEFAULT_PAGE_SIZE: u32 = 20;
pub const MAX_PAGE_SIZE: u32 = 100;

/// Offset paging over a sorted index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageQuery {
    /// 1-based page number.
    pub page_number: u32,
    pub page_size: u32,
    /// Skip executions that already finished.
    pub non_stopped_only: bool,
}

impl Default for PageQuery {
    fn default() -> Self {
        Self {
            page_number: 1,
            page_size: DEFAULT_PAGE_SIZE,
            non_stopped_only: false,
        }
    }
}

impl PageQuery {
    /// Clamp caller-supplied values into the accepted ranges.
    pub fn new(page_number: Option<u32>, page_size: Option<u32>, non_stopped_only: bool) -> Self {
        Self {
            page_number: page_number.filter(|n| *n > 0).unwrap_or(1),
            page_size: page_size
                .filter(|n| *n > 0)
                .unwrap_or(DEFAULT_PAGE_SIZE)
                .min(MAX_PAGE_SIZE),
            non_stopped_only,
        }
    }

    pub fn offset(&self) -> usize {
        (self.page_number.saturating_sub(1) as usize) * self.page_size as usize
    }

    pub fn limit(&self) -> usize {
        self.page_size as usize
    }
}

/// One page of jobs plus the size of the whole listing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobPage {
    pub jobs: Vec<JobStats>,
    pub total: u64,
}

/// One batch of a cursor walk over all jobs. A `next_cursor` of 0 ends the walk.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobCursorPage {
    pub jobs: Vec<JobStats>,
    pub next_cursor: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_and_clamping() {
        let q = PageQuery::new(None, None, false);
        assert_eq!((q.page_number, q.page_size), (1, DEFAULT_PAGE_SIZE));

        let q = PageQuery::new(Some(0), Some(1000), true);
        assert_eq!((q.page_number, q.page_size), (1, MAX_PAGE_SIZE));
        assert!(q.non_stopped_only);
    }

    #[test]
    fn offset_is_zero_based() {
        let q = PageQuery::new(Some(3), Some(10), false);
        assert_eq!(q.offset(), 20);
        assert_eq!(q.limit(), 10);
    }
}
