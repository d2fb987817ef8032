//! Outbound progress and state notifications.
//!
//! The indexer never calls into a presentation layer. It keeps one
//! [`FolderProgress`] per folder and publishes every change as an
//! [`IndexEvent`] on an unbounded channel; whoever holds the receiver
//! (a progress bar, the status command, a GUI) decides what to show.

use std::collections::HashMap;

use serde::Serialize;
use tokio::sync::mpsc;

use crate::catalog::{CollectionFolder, FolderId};

pub type EventSender = mpsc::UnboundedSender<IndexEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<IndexEvent>;

/// Indexing state of one folder.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FolderProgress {
    pub folder_id: FolderId,
    pub folder_path: String,
    pub indexing: bool,
    pub installed: bool,
    pub force_indexing: bool,
    pub error: Option<String>,
    pub current_docs_to_index: usize,
    pub total_docs_to_index: usize,
    pub current_bytes_to_index: u64,
    pub total_bytes_to_index: u64,
    pub current_embeddings_to_index: usize,
    pub total_embeddings_to_index: usize,
    pub file_currently_processing: Option<String>,
    pub total_docs: usize,
    pub total_words: u64,
    pub total_tokens: u64,
    pub embedding_model: Option<String>,
    /// Milliseconds since the Unix epoch.
    pub last_update: Option<i64>,
}

impl FolderProgress {
    pub fn is_busy(&self) -> bool {
        self.indexing || self.current_embeddings_to_index > 0
    }
}

/// One collection/folder link as shown to users.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CollectionEntry {
    pub collection: String,
    pub folder_id: FolderId,
    pub folder_path: String,
    pub embedding_model: Option<String>,
    pub force_indexing: bool,
    pub last_update: Option<i64>,
}

impl From<&CollectionFolder> for CollectionEntry {
    fn from(row: &CollectionFolder) -> Self {
        Self {
            collection: row.collection.name.clone(),
            folder_id: row.folder_id,
            folder_path: row.folder_path.clone(),
            embedding_model: row.collection.embedding_model.clone(),
            force_indexing: row.collection.needs_force_indexing(),
            last_update: row.collection.last_update_time,
        }
    }
}

/// A collection/folder link together with that folder's progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CollectionStatus {
    #[serde(flatten)]
    pub entry: CollectionEntry,
    pub progress: FolderProgress,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexEvent {
    FolderUpdated(FolderProgress),
    FolderAdded(CollectionEntry),
    FolderRemoved {
        collection: String,
        folder_id: FolderId,
    },
    CollectionListUpdated(Vec<CollectionEntry>),
    /// The vector store could not be loaded; the engine will not modify
    /// anything until restarted.
    DatabaseInvalid,
}

/// Per-folder progress table that publishes every change.
#[derive(Debug, Default)]
pub struct ProgressBoard {
    folders: HashMap<FolderId, FolderProgress>,
    events: Option<EventSender>,
}

impl ProgressBoard {
    pub fn new(events: Option<EventSender>) -> Self {
        Self {
            folders: HashMap::new(),
            events,
        }
    }

    pub fn emit(&self, event: IndexEvent) {
        if let Some(events) = &self.events {
            // A dropped receiver only means nobody is watching.
            let _ = events.send(event);
        }
    }

    pub fn get(&self, folder_id: FolderId) -> Option<&FolderProgress> {
        self.folders.get(&folder_id)
    }

    /// Apply a change to a folder's progress and publish the result.
    pub fn update(
        &mut self,
        folder_id: FolderId,
        change: impl FnOnce(&mut FolderProgress),
    ) {
        let progress =
            self.folders
                .entry(folder_id)
                .or_insert_with(|| FolderProgress {
                    folder_id,
                    ..Default::default()
                });
        change(progress);
        let snapshot = progress.clone();
        self.emit(IndexEvent::FolderUpdated(snapshot));
    }

    /// Register a folder link, keeping counters if the folder is known.
    pub fn add(&mut self, entry: CollectionEntry) {
        let progress =
            self.folders
                .entry(entry.folder_id)
                .or_insert_with(|| FolderProgress {
                    folder_id: entry.folder_id,
                    ..Default::default()
                });
        progress.folder_path = entry.folder_path.clone();
        progress.embedding_model = entry.embedding_model.clone();
        progress.force_indexing = entry.force_indexing;
        progress.last_update = entry.last_update;
        self.emit(IndexEvent::FolderAdded(entry));
    }

    /// Replace the known folder list, as done at startup.
    pub fn reset(&mut self, entries: Vec<CollectionEntry>) {
        for entry in &entries {
            let progress = self
                .folders
                .entry(entry.folder_id)
                .or_insert_with(|| FolderProgress {
                    folder_id: entry.folder_id,
                    ..Default::default()
                });
            progress.folder_path = entry.folder_path.clone();
            progress.embedding_model = entry.embedding_model.clone();
            progress.force_indexing = entry.force_indexing;
            progress.last_update = entry.last_update;
        }
        self.emit(IndexEvent::CollectionListUpdated(entries));
    }

    pub fn remove_link(&mut self, collection: &str, folder_id: FolderId) {
        self.emit(IndexEvent::FolderRemoved {
            collection: collection.to_string(),
            folder_id,
        });
    }

    /// Forget a folder entirely.
    pub fn forget(&mut self, folder_id: FolderId) {
        self.folders.remove(&folder_id);
    }

    pub fn snapshot(&self) -> Vec<FolderProgress> {
        let mut all: Vec<_> = self.folders.values().cloned().collect();
        all.sort_by_key(|p| p.folder_id);
        all
    }

    pub fn any_busy(&self) -> bool {
        self.folders.values().any(FolderProgress::is_busy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_publishes_snapshot() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut board = ProgressBoard::new(Some(tx));

        board.update(7, |p| {
            p.indexing = true;
            p.current_docs_to_index = 3;
        });

        match rx.try_recv().unwrap() {
            IndexEvent::FolderUpdated(p) => {
                assert_eq!(p.folder_id, 7);
                assert!(p.indexing);
                assert_eq!(p.current_docs_to_index, 3);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(board.any_busy());
    }

    #[test]
    fn works_without_a_receiver() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let mut board = ProgressBoard::new(Some(tx));
        board.update(1, |p| p.installed = true);
        assert!(board.get(1).unwrap().installed);

        let mut silent = ProgressBoard::new(None);
        silent.update(2, |p| p.indexing = true);
        assert_eq!(silent.snapshot().len(), 1);
    }

    #[test]
    fn add_keeps_counters() {
        let mut board = ProgressBoard::new(None);
        board.update(1, |p| p.total_docs = 5);
        board.add(CollectionEntry {
            collection: "notes".into(),
            folder_id: 1,
            folder_path: "/notes".into(),
            embedding_model: Some("m".into()),
            force_indexing: false,
            last_update: None,
        });

        let progress = board.get(1).unwrap();
        assert_eq!(progress.total_docs, 5);
        assert_eq!(progress.folder_path, "/notes");

        board.forget(1);
        assert!(board.get(1).is_none());
    }
}
