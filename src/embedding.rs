use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    thread,
};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::{
    catalog::{ChunkId, FolderId, PendingEmbedding},
    error::Result,
};

/// Produces one vector per text.
pub trait Embedder: Send + Sync {
    /// Identifier recorded on collections indexed with this embedder.
    fn model_name(&self) -> &str;

    /// Embed a search query.
    fn embed_query(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed a batch of chunk texts, one vector per input, in order.
    fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingResult {
    pub folder_id: FolderId,
    pub chunk_id: ChunkId,
    pub vector: Vec<f32>,
}

/// What the embedding worker reports back to the catalog thread.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    Embedded(Vec<EmbeddingResult>),
    Failed { folder_id: FolderId, message: String },
}

/// Hands full batches to whatever generates embeddings.
pub trait BatchSubmitter: Send {
    /// Returns `false` when the batch could not be queued. No result will
    /// ever arrive for it.
    fn submit(&mut self, batch: Vec<PendingEmbedding>) -> bool;
}

/// Sending half of an [`EmbeddingWorker`].
#[derive(Debug, Clone)]
pub struct EmbeddingQueue {
    tx: mpsc::UnboundedSender<Vec<PendingEmbedding>>,
}

impl BatchSubmitter for EmbeddingQueue {
    fn submit(&mut self, batch: Vec<PendingEmbedding>) -> bool {
        if batch.is_empty() {
            return false;
        }
        if self.tx.send(batch).is_err() {
            warn!("Embedding worker has stopped; dropping batch");
            return false;
        }
        true
    }
}

/// Background thread that turns batches into vectors.
///
/// The worker only computes. Results travel back over `results` and are
/// applied to the catalog and vector store by the catalog thread.
pub struct EmbeddingWorker {
    queue: EmbeddingQueue,
    handle: thread::JoinHandle<()>,
}

impl EmbeddingWorker {
    pub fn spawn(
        embedder: Arc<dyn Embedder>,
        results: mpsc::UnboundedSender<WorkerEvent>,
    ) -> Result<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<PendingEmbedding>>();

        let handle = thread::Builder::new()
            .name("embedding".to_string())
            .spawn(move || {
                while let Some(batch) = rx.blocking_recv() {
                    let event = embed_batch(embedder.as_ref(), batch);
                    if results.send(event).is_err() {
                        break;
                    }
                }
                debug!("Embedding worker exiting");
            })?;

        Ok(Self {
            queue: EmbeddingQueue { tx },
            handle,
        })
    }

    pub fn queue(&self) -> EmbeddingQueue {
        self.queue.clone()
    }

    /// Close the queue and wait for in-flight batches to finish.
    pub fn shutdown(self) {
        drop(self.queue);
        if self.handle.join().is_err() {
            warn!("Embedding worker panicked");
        }
    }
}

/// Embed one batch. Every result carries the folder of the batch it came
/// from. A panicking embedder is reported as a failed batch.
pub fn embed_batch(
    embedder: &dyn Embedder,
    batch: Vec<PendingEmbedding>,
) -> WorkerEvent {
    let folder_id = batch.first().map_or(0, |p| p.folder_id);
    let texts: Vec<String> = batch.iter().map(|p| p.text.clone()).collect();

    let embedded = panic::catch_unwind(AssertUnwindSafe(|| {
        embedder.embed_documents(&texts)
    }));
    let embedded = match embedded {
        Ok(embedded) => embedded,
        Err(payload) => {
            let reason = panic_message(payload.as_ref());
            let message = format!("embedder panicked: {reason}");
            warn!(folder_id, error = %message, "Embedding batch aborted");
            return WorkerEvent::Failed { folder_id, message };
        }
    };

    match embedded {
        Ok(vectors) if vectors.len() == batch.len() => WorkerEvent::Embedded(
            batch
                .into_iter()
                .zip(vectors)
                .map(|(p, vector)| EmbeddingResult {
                    folder_id: p.folder_id,
                    chunk_id: p.chunk_id,
                    vector,
                })
                .collect(),
        ),
        Ok(vectors) => WorkerEvent::Failed {
            folder_id,
            message: format!(
                "embedder returned {} vectors for {} texts",
                vectors.len(),
                batch.len()
            ),
        },
        Err(e) => WorkerEvent::Failed {
            folder_id,
            message: e.to_string(),
        },
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    struct LengthEmbedder;

    impl Embedder for LengthEmbedder {
        fn model_name(&self) -> &str {
            "length"
        }

        fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
            Ok(vec![text.len() as f32, 1.0])
        }

        fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            if texts.iter().any(|t| t == "boom") {
                return Err(Error::Embedding("model exploded".into()));
            }
            if texts.iter().any(|t| t == "panic") {
                panic!("tensor shape mismatch");
            }
            texts.iter().map(|t| self.embed_query(t)).collect()
        }
    }

    fn pending(folder_id: u64, chunk_id: u64, text: &str) -> PendingEmbedding {
        PendingEmbedding {
            folder_id,
            chunk_id,
            text: text.to_string(),
        }
    }

    #[test]
    fn embed_batch_pairs_results_with_chunks() {
        let event = embed_batch(
            &LengthEmbedder,
            vec![pending(3, 10, "ab"), pending(3, 11, "abcd")],
        );
        let WorkerEvent::Embedded(results) = event else {
            panic!("expected results");
        };
        assert_eq!(results.len(), 2);
        assert_eq!(results[1].chunk_id, 11);
        assert_eq!(results[1].folder_id, 3);
        assert_eq!(results[1].vector, vec![4.0, 1.0]);
    }

    #[test]
    fn embed_batch_reports_failure_for_folder() {
        let event = embed_batch(&LengthEmbedder, vec![pending(5, 1, "boom")]);
        match event {
            WorkerEvent::Failed { folder_id, message } => {
                assert_eq!(folder_id, 5);
                assert!(message.contains("model exploded"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn worker_delivers_results_over_channel() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let worker = EmbeddingWorker::spawn(Arc::new(LengthEmbedder), tx).unwrap();

        let mut queue = worker.queue();
        assert!(queue.submit(vec![pending(1, 1, "hello")]));
        assert!(!queue.submit(Vec::new()));
        drop(queue);
        worker.shutdown();

        let event = rx.blocking_recv().unwrap();
        assert!(matches!(event, WorkerEvent::Embedded(ref r) if r.len() == 1));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn embed_batch_turns_a_panic_into_failure() {
        let event = embed_batch(&LengthEmbedder, vec![pending(7, 1, "panic")]);
        match event {
            WorkerEvent::Failed { folder_id, message } => {
                assert_eq!(folder_id, 7);
                assert!(message.contains("tensor shape mismatch"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn worker_survives_a_panicking_embedder() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let worker = EmbeddingWorker::spawn(Arc::new(LengthEmbedder), tx).unwrap();

        let mut queue = worker.queue();
        assert!(queue.submit(vec![pending(2, 1, "panic")]));
        assert!(queue.submit(vec![pending(2, 2, "after")]));
        drop(queue);
        worker.shutdown();

        assert!(matches!(
            rx.blocking_recv().unwrap(),
            WorkerEvent::Failed { folder_id: 2, .. }
        ));
        assert!(matches!(
            rx.blocking_recv().unwrap(),
            WorkerEvent::Embedded(ref r) if r[0].chunk_id == 2
        ));
    }

    #[test]
    fn stopped_worker_rejects_batches() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let mut queue = EmbeddingQueue { tx };

        assert!(!queue.submit(vec![pending(1, 1, "late")]));
    }
}
