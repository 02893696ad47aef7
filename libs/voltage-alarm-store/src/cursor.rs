//! Forward-only result cursors
//!
//! A cursor owns the rows it was opened with, so iterating it never observes
//! writes made after the query ran and never holds a lock on the store.

use tracing::trace;

use crate::record::{AlarmRecord, Note};

/// Forward-only, pageable sequence of query results
///
/// Call [`Cursor::advance`] before reading the first row. Paging slices the
/// filtered and sorted rows and can be set until the first advance.
#[derive(Debug)]
pub struct Cursor<T> {
    rows: Vec<T>,
    page: usize,
    page_size: usize,
    start: usize,
    end: usize,
    position: Option<usize>,
    closed: bool,
}

/// Cursor over alarm records
pub type AlarmCursor = Cursor<AlarmRecord>;

/// Cursor over the notes of one record
pub type NoteCursor = Cursor<Note>;

impl<T> Cursor<T> {
    pub fn new(rows: Vec<T>) -> Self {
        let end = rows.len();
        Self {
            rows,
            page: 0,
            page_size: 0,
            start: 0,
            end,
            position: None,
            closed: false,
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    /// Restrict the cursor to `page` (zero based) of `page_size` rows.
    /// A page size of zero disables paging.
    ///
    /// Ignored once iteration has started.
    pub fn set_paging(&mut self, page: usize, page_size: usize) {
        if self.position.is_some() {
            return;
        }
        self.page = page;
        self.page_size = page_size;
        if page_size == 0 {
            self.start = 0;
            self.end = self.rows.len();
        } else {
            self.start = page.saturating_mul(page_size).min(self.rows.len());
            self.end = self.start.saturating_add(page_size).min(self.rows.len());
        }
    }

    pub fn page(&self) -> usize {
        self.page
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Rows matched by the query, ignoring paging
    pub fn total(&self) -> usize {
        self.rows.len()
    }

    /// Rows this cursor will yield with the current paging
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Move to the next row. Returns false at exhaustion or after close.
    pub fn advance(&mut self) -> bool {
        if self.closed {
            return false;
        }
        let next = match self.position {
            None => self.start,
            Some(pos) => pos + 1,
        };
        if next < self.end {
            self.position = Some(next);
            true
        } else {
            self.position = Some(self.end);
            false
        }
    }

    /// The row the cursor is positioned on
    pub fn record(&self) -> Option<&T> {
        if self.closed {
            return None;
        }
        self.position.and_then(|pos| {
            if pos < self.end {
                self.rows.get(pos)
            } else {
                None
            }
        })
    }

    /// Release the rows held by this cursor
    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !self.closed {
            self.closed = true;
            trace!("Cursor closed after {} rows", self.rows.len());
            self.rows.clear();
            self.start = 0;
            self.end = 0;
        }
    }
}

impl<T: Clone> Cursor<T> {
    /// Drain the remaining rows into a vector and close the cursor.
    pub fn collect_remaining(mut self) -> Vec<T> {
        let mut out = Vec::with_capacity(self.len());
        while self.advance() {
            if let Some(row) = self.record() {
                out.push(row.clone());
            }
        }
        self.release();
        out
    }
}

impl<T> Drop for Cursor<T> {
    fn drop(&mut self) {
        self.release();
    }
}

impl<T: Clone> Iterator for Cursor<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        if self.advance() {
            self.record().cloned()
        } else {
            None
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_advance_before_read() {
        let mut cursor = Cursor::new(vec![1, 2, 3]);
        assert!(cursor.record().is_none());
        assert!(cursor.advance());
        assert_eq!(cursor.record(), Some(&1));
        assert!(cursor.advance());
        assert!(cursor.advance());
        assert_eq!(cursor.record(), Some(&3));
        assert!(!cursor.advance());
        assert!(cursor.record().is_none());
        assert!(!cursor.advance());
    }

    #[test]
    fn test_paging_slices_are_contiguous() {
        let rows: Vec<u32> = (0..7).collect();

        let mut first = Cursor::new(rows.clone());
        first.set_paging(0, 3);
        let mut second = Cursor::new(rows.clone());
        second.set_paging(1, 3);
        let mut third = Cursor::new(rows.clone());
        third.set_paging(2, 3);

        assert_eq!(first.total(), 7);
        assert_eq!(third.len(), 1);

        let mut joined = first.collect_remaining();
        joined.extend(second.collect_remaining());
        joined.extend(third.collect_remaining());
        assert_eq!(joined, rows);
    }

    #[test]
    fn test_page_past_end_is_empty() {
        let mut cursor = Cursor::new(vec![1, 2]);
        cursor.set_paging(5, 10);
        assert!(cursor.is_empty());
        assert!(!cursor.advance());
    }

    #[test]
    fn test_zero_page_size_disables_paging() {
        let mut cursor = Cursor::new(vec![1, 2, 3]);
        cursor.set_paging(1, 2);
        cursor.set_paging(0, 0);
        assert_eq!(cursor.collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[test]
    fn test_paging_ignored_after_first_advance() {
        let mut cursor = Cursor::new(vec![1, 2, 3]);
        assert!(cursor.advance());
        cursor.set_paging(1, 1);
        assert_eq!(cursor.page_size(), 0);
        assert_eq!(cursor.len(), 3);
    }

    #[test]
    fn test_closed_cursor_yields_nothing() {
        let mut cursor = Cursor::new(vec![1]);
        cursor.release();
        assert!(!cursor.advance());
        assert!(cursor.record().is_none());
        assert_eq!(cursor.total(), 0);
    }
}
