use crate::catalog::{FolderId, PendingEmbedding};

pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Accumulates chunks waiting for embeddings into single-folder batches.
#[derive(Debug)]
pub struct EmbeddingBatcher {
    batch_size: usize,
    pending: Vec<PendingEmbedding>,
}

impl Default for EmbeddingBatcher {
    fn default() -> Self {
        Self::new(DEFAULT_BATCH_SIZE)
    }
}

impl EmbeddingBatcher {
    pub fn new(batch_size: usize) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            batch_size,
            pending: Vec::with_capacity(batch_size),
        }
    }

    /// Buffer one chunk. Returns the batches that are ready to submit: the
    /// partial batch of a previous folder, and a full batch if this chunk
    /// filled one.
    pub fn push(&mut self, item: PendingEmbedding) -> Vec<Vec<PendingEmbedding>> {
        let mut ready = Vec::new();
        if self
            .pending
            .first()
            .is_some_and(|first| first.folder_id != item.folder_id)
        {
            ready.extend(self.flush());
        }

        self.pending.push(item);
        if self.pending.len() >= self.batch_size {
            ready.extend(self.flush());
        }
        ready
    }

    /// Take whatever is buffered.
    pub fn flush(&mut self) -> Option<Vec<PendingEmbedding>> {
        if self.pending.is_empty() {
            return None;
        }
        Some(std::mem::replace(
            &mut self.pending,
            Vec::with_capacity(self.batch_size),
        ))
    }

    /// Discard the chunks buffered for a folder that left the index.
    /// Returns how many were dropped.
    pub fn remove_folder(&mut self, folder_id: FolderId) -> usize {
        let before = self.pending.len();
        self.pending.retain(|p| p.folder_id != folder_id);
        before - self.pending.len()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(folder_id: u64, chunk_id: u64) -> PendingEmbedding {
        PendingEmbedding {
            folder_id,
            chunk_id,
            text: format!("chunk {chunk_id}"),
        }
    }

    #[test]
    fn full_batch_is_released() {
        let mut batcher = EmbeddingBatcher::new(3);
        assert!(batcher.push(item(1, 1)).is_empty());
        assert!(batcher.push(item(1, 2)).is_empty());

        let ready = batcher.push(item(1, 3));
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].len(), 3);
        assert!(batcher.is_empty());
    }

    #[test]
    fn folder_change_flushes_partial_batch() {
        let mut batcher = EmbeddingBatcher::new(10);
        batcher.push(item(1, 1));
        batcher.push(item(1, 2));

        let ready = batcher.push(item(2, 3));
        assert_eq!(ready.len(), 1);
        assert!(ready[0].iter().all(|p| p.folder_id == 1));
        assert_eq!(batcher.len(), 1);

        let rest = batcher.flush().unwrap();
        assert_eq!(rest[0].folder_id, 2);
        assert!(batcher.flush().is_none());
    }

    #[test]
    fn removed_folder_leaves_the_buffer() {
        let mut batcher = EmbeddingBatcher::new(10);
        batcher.push(item(1, 1));
        batcher.push(item(1, 2));

        assert_eq!(batcher.remove_folder(2), 0);
        assert_eq!(batcher.len(), 2);
        assert_eq!(batcher.remove_folder(1), 2);
        assert!(batcher.is_empty());
        assert!(batcher.flush().is_none());
    }

    #[test]
    fn batch_size_of_one_releases_every_item() {
        let mut batcher = EmbeddingBatcher::new(1);
        assert_eq!(batcher.push(item(1, 1)).len(), 1);
        assert_eq!(batcher.push(item(2, 2)).len(), 1);
        assert_eq!(batcher.batch_size(), 1);
    }
}
