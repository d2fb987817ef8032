use std::{
    collections::{BTreeMap, VecDeque},
    path::PathBuf,
};

use crate::catalog::FolderId;

/// Where a document scan picks up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumePoint {
    Start,
    /// Byte offset into a plain-text file.
    Byte(u64),
    /// Zero-based page index into a PDF.
    Page(usize),
}

/// Transient scan state for one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanCursor {
    pub folder_id: FolderId,
    pub path: PathBuf,
    pub size: u64,
    pub resume: ResumePoint,
    /// Set once part of the document has been chunked.
    pub currently_processing: bool,
}

impl ScanCursor {
    pub fn new(folder_id: FolderId, path: PathBuf, size: u64) -> Self {
        Self {
            folder_id,
            path,
            size,
            resume: ResumePoint::Start,
            currently_processing: false,
        }
    }

    /// The same document, continued from `resume`.
    pub fn continued(mut self, resume: ResumePoint) -> Self {
        self.resume = resume;
        self.currently_processing = true;
        self
    }
}

/// One FIFO of pending documents per folder. Folders are drained in id
/// order; a partially processed document goes back to the front of its
/// folder's queue.
#[derive(Debug, Default)]
pub struct ScanQueue {
    queues: BTreeMap<FolderId, VecDeque<ScanCursor>>,
}

impl ScanQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_back(&mut self, cursor: ScanCursor) {
        self.queues
            .entry(cursor.folder_id)
            .or_default()
            .push_back(cursor);
    }

    pub fn push_front(&mut self, cursor: ScanCursor) {
        self.queues
            .entry(cursor.folder_id)
            .or_default()
            .push_front(cursor);
    }

    /// Next cursor from the lowest-numbered folder with work.
    pub fn pop(&mut self) -> Option<ScanCursor> {
        let mut entry = self.queues.first_entry()?;
        let cursor = entry.get_mut().pop_front();
        if entry.get().is_empty() {
            entry.remove();
        }
        cursor
    }

    /// Drop all pending work for a folder, returning how much was dropped.
    pub fn remove_folder(&mut self, folder_id: FolderId) -> usize {
        self.queues.remove(&folder_id).map_or(0, |q| q.len())
    }

    pub fn count(&self, folder_id: FolderId) -> usize {
        self.queues.get(&folder_id).map_or(0, VecDeque::len)
    }

    pub fn bytes(&self, folder_id: FolderId) -> u64 {
        self.queues
            .get(&folder_id)
            .map_or(0, |q| q.iter().map(|c| c.size).sum())
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queues.values().map(VecDeque::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cursor(folder_id: FolderId, name: &str) -> ScanCursor {
        ScanCursor::new(folder_id, PathBuf::from(name), 10)
    }

    #[test]
    fn drains_lowest_folder_first_in_fifo_order() {
        let mut queue = ScanQueue::new();
        queue.push_back(cursor(2, "b1"));
        queue.push_back(cursor(1, "a1"));
        queue.push_back(cursor(1, "a2"));

        let order: Vec<_> = std::iter::from_fn(|| queue.pop())
            .map(|c| c.path.to_string_lossy().to_string())
            .collect();
        assert_eq!(order, ["a1", "a2", "b1"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn continuation_goes_to_the_front() {
        let mut queue = ScanQueue::new();
        queue.push_back(cursor(1, "a1"));
        queue.push_back(cursor(1, "a2"));

        let first = queue.pop().unwrap();
        queue.push_front(first.continued(ResumePoint::Byte(42)));

        let again = queue.pop().unwrap();
        assert_eq!(again.path, PathBuf::from("a1"));
        assert_eq!(again.resume, ResumePoint::Byte(42));
        assert!(again.currently_processing);
    }

    #[test]
    fn counts_and_removal() {
        let mut queue = ScanQueue::new();
        queue.push_back(cursor(1, "a1"));
        queue.push_back(cursor(1, "a2"));
        queue.push_back(cursor(3, "c1"));

        assert_eq!(queue.count(1), 2);
        assert_eq!(queue.bytes(1), 20);
        assert_eq!(queue.len(), 3);

        assert_eq!(queue.remove_folder(1), 2);
        assert_eq!(queue.count(1), 0);
        assert_eq!(queue.remove_folder(1), 0);
        assert_eq!(queue.pop().unwrap().folder_id, 3);
    }
}
