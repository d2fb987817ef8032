//! The catalog thread.
//!
//! [`IndexService::spawn`] starts one dedicated thread that owns the
//! [`Indexer`] and serializes everything that touches it: requests from
//! [`IndexerHandle`]s, embedding results from the worker, directory
//! changes from the watcher, and the scan timer. Nothing else ever sees
//! the catalog or the vector store.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    thread,
};

use tokio::{
    sync::{mpsc, oneshot},
    time::MissedTickBehavior,
};
use tracing::{debug, info, warn};

use crate::{
    data_dir::DataDir,
    embedding::{Embedder, EmbeddingWorker, WorkerEvent},
    error::{Error, Result},
    events::{CollectionStatus, EventSender},
    indexer::{Indexer, IndexerConfig, SCAN_TICK},
    pdf::PdfLoader,
    retrieval::RetrievalResult,
    schema::{self, SchemaVersion},
    settings::SettingsDb,
    vector_store::RedbVectorStore,
    watcher::NotifyWatch,
};

type Reply<T> = oneshot::Sender<Result<T>>;

enum Request {
    AddFolder {
        collection: String,
        path: PathBuf,
        reply: Reply<bool>,
    },
    RemoveFolder {
        collection: String,
        path: PathBuf,
        reply: Reply<()>,
    },
    ForceIndexing {
        collection: String,
        reply: Reply<()>,
    },
    Retrieve {
        collections: Vec<String>,
        query: String,
        k: usize,
        reply: Reply<Vec<RetrievalResult>>,
    },
    ChangeChunkSize {
        chunk_size: usize,
        reply: Reply<bool>,
    },
    ChangeFileExtensions {
        extensions: Vec<String>,
        reply: Reply<()>,
    },
    Collections {
        reply: Reply<Vec<CollectionStatus>>,
    },
    WaitIdle {
        reply: oneshot::Sender<()>,
    },
    Shutdown,
}

/// Everything the catalog thread needs to start.
pub struct ServiceOptions {
    pub data_dir: DataDir,
    pub embedder: Arc<dyn Embedder>,
    /// Watch indexed folders for changes.
    pub watch: bool,
    pub pdf_loader: Option<Box<dyn PdfLoader>>,
    pub events: Option<EventSender>,
}

impl ServiceOptions {
    pub fn new(data_dir: DataDir, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            data_dir,
            embedder,
            watch: false,
            pdf_loader: None,
            events: None,
        }
    }
}

/// Cloneable, async front end to the catalog thread.
#[derive(Debug, Clone)]
pub struct IndexerHandle {
    tx: mpsc::UnboundedSender<Request>,
}

impl IndexerHandle {
    async fn call<T>(&self, request: impl FnOnce(Reply<T>) -> Request) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(request(reply))
            .map_err(|_| Error::ServiceStopped)?;
        rx.await.map_err(|_| Error::ServiceStopped)?
    }

    /// Link a folder into a collection using the service's embedding
    /// model. Returns `false` if it was already linked.
    pub async fn add_folder(&self, collection: &str, path: &Path) -> Result<bool> {
        self.call(|reply| Request::AddFolder {
            collection: collection.to_string(),
            path: path.to_path_buf(),
            reply,
        })
        .await
    }

    pub async fn remove_folder(&self, collection: &str, path: &Path) -> Result<()> {
        self.call(|reply| Request::RemoveFolder {
            collection: collection.to_string(),
            path: path.to_path_buf(),
            reply,
        })
        .await
    }

    /// Re-index a collection with the service's embedding model.
    pub async fn force_indexing(&self, collection: &str) -> Result<()> {
        self.call(|reply| Request::ForceIndexing {
            collection: collection.to_string(),
            reply,
        })
        .await
    }

    pub async fn retrieve(
        &self,
        collections: Vec<String>,
        query: &str,
        k: usize,
    ) -> Result<Vec<RetrievalResult>> {
        self.call(|reply| Request::Retrieve {
            collections,
            query: query.to_string(),
            k,
            reply,
        })
        .await
    }

    /// Persist a new chunk size and re-chunk everything.
    pub async fn change_chunk_size(&self, chunk_size: usize) -> Result<bool> {
        self.call(|reply| Request::ChangeChunkSize { chunk_size, reply })
            .await
    }

    /// Persist a new extension list, sweep, and rescan.
    pub async fn change_file_extensions(
        &self,
        extensions: Vec<String>,
    ) -> Result<()> {
        self.call(|reply| Request::ChangeFileExtensions { extensions, reply })
            .await
    }

    pub async fn collections(&self) -> Result<Vec<CollectionStatus>> {
        self.call(|reply| Request::Collections { reply }).await
    }

    /// Resolve once no scans, batches or embeddings are outstanding.
    pub async fn wait_idle(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Request::WaitIdle { reply })
            .map_err(|_| Error::ServiceStopped)?;
        rx.await.map_err(|_| Error::ServiceStopped)
    }
}

/// A running catalog thread.
pub struct IndexService {
    handle: IndexerHandle,
    thread: thread::JoinHandle<()>,
}

impl IndexService {
    /// Open the data directory and start the catalog thread. Resolves
    /// once startup (migration, vector load, sweep) has finished.
    pub async fn spawn(options: ServiceOptions) -> Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();

        let thread = thread::Builder::new()
            .name("catalog".to_string())
            .spawn(move || run(options, rx, ready_tx))?;

        match ready_rx.await {
            Ok(Ok(())) => Ok(Self {
                handle: IndexerHandle { tx },
                thread,
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::ServiceStopped),
        }
    }

    pub fn handle(&self) -> IndexerHandle {
        self.handle.clone()
    }

    /// Stop the catalog thread after its current unit of work and wait for
    /// it to exit.
    pub async fn shutdown(self) {
        let _ = self.handle.tx.send(Request::Shutdown);
        let thread = self.thread;
        let joined = tokio::task::spawn_blocking(move || thread.join()).await;
        if !matches!(joined, Ok(Ok(()))) {
            warn!("Catalog thread did not exit cleanly");
        }
    }
}

impl std::fmt::Debug for IndexService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexService").finish_non_exhaustive()
    }
}

fn run(
    options: ServiceOptions,
    requests: mpsc::UnboundedReceiver<Request>,
    ready: oneshot::Sender<Result<()>>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            let _ = ready.send(Err(e.into()));
            return;
        }
    };

    runtime.block_on(async move {
        let (mut state, worker) = match CatalogThread::open(options) {
            Ok(opened) => opened,
            Err(e) => {
                let _ = ready.send(Err(e));
                return;
            }
        };
        let _ = ready.send(Ok(()));

        state.run(requests).await;
        drop(state);
        worker.shutdown();
        debug!("Catalog thread exiting");
    });
}

struct CatalogThread {
    indexer: Indexer,
    settings: SettingsDb,
    worker_events: mpsc::UnboundedReceiver<WorkerEvent>,
    changes: Option<mpsc::UnboundedReceiver<PathBuf>>,
    idle_waiters: Vec<oneshot::Sender<()>>,
}

impl CatalogThread {
    fn open(options: ServiceOptions) -> Result<(Self, EmbeddingWorker)> {
        let data_dir = options.data_dir;
        let settings = SettingsDb::open(&data_dir.settings_db())?;
        let config = IndexerConfig {
            chunk_size: settings.chunk_size()?,
            file_extensions: settings.file_extensions()?,
            ..Default::default()
        };

        let (catalog, legacy) = schema::open_latest(&data_dir)?;
        for item in &legacy {
            info!(
                collection = %item.name,
                folder = %item.folder_path,
                "Collection needs `reindex` before it is searchable"
            );
        }
        let vectors = RedbVectorStore::new(
            &data_dir.embeddings_db(SchemaVersion::CURRENT),
        );

        let (results_tx, worker_events) = mpsc::unbounded_channel();
        let worker =
            EmbeddingWorker::spawn(options.embedder.clone(), results_tx)?;

        let mut indexer = Indexer::new(
            catalog,
            Box::new(vectors),
            options.embedder,
            Box::new(worker.queue()),
            config,
        )?;

        let changes = if options.watch {
            let (changes_tx, changes_rx) = mpsc::unbounded_channel();
            indexer = indexer.with_watch(Box::new(NotifyWatch::new(changes_tx)?));
            Some(changes_rx)
        } else {
            None
        };
        if let Some(loader) = options.pdf_loader {
            indexer = indexer.with_pdf_loader(loader);
        }
        if let Some(events) = options.events {
            indexer = indexer.with_events(events);
        }

        indexer.start()?;
        info!(
            data_dir = %data_dir.root().display(),
            model = indexer.model_name(),
            "Index service started"
        );

        Ok((
            Self {
                indexer,
                settings,
                worker_events,
                changes,
                idle_waiters: Vec::new(),
            },
            worker,
        ))
    }

    async fn run(&mut self, mut requests: mpsc::UnboundedReceiver<Request>) {
        let mut ticker = tokio::time::interval(SCAN_TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let scanning = self.indexer.has_pending_scans();
            tokio::select! {
                request = requests.recv() => match request {
                    Some(Request::Shutdown) | None => break,
                    Some(request) => self.handle(request),
                },
                Some(event) = self.worker_events.recv() => {
                    if let Err(e) = self.indexer.handle_worker_event(event) {
                        warn!(error = %e, "Failed to apply embedding results");
                    }
                }
                Some(first) = next_change(&mut self.changes) => {
                    let paths = self.drain_changes(first);
                    if let Err(e) = self.indexer.directories_changed(&paths) {
                        warn!(error = %e, "Failed to handle directory changes");
                    }
                }
                _ = ticker.tick(), if scanning => {
                    if let Err(e) = self.indexer.scan_batch() {
                        warn!(error = %e, "Scan cycle failed");
                    }
                }
            }

            if self.indexer.is_idle() {
                for waiter in self.idle_waiters.drain(..) {
                    let _ = waiter.send(());
                }
            }
        }
    }

    /// Collect every change already queued behind `first`, deduplicated.
    fn drain_changes(&mut self, first: PathBuf) -> Vec<PathBuf> {
        let mut paths = vec![first];
        if let Some(changes) = &mut self.changes {
            while let Ok(path) = changes.try_recv() {
                if !paths.contains(&path) {
                    paths.push(path);
                }
            }
        }
        paths
    }

    fn handle(&mut self, request: Request) {
        match request {
            Request::AddFolder {
                collection,
                path,
                reply,
            } => {
                let model = self.indexer.model_name().to_string();
                let _ =
                    reply.send(self.indexer.add_folder(&collection, &path, &model));
            }
            Request::RemoveFolder {
                collection,
                path,
                reply,
            } => {
                let _ = reply.send(self.indexer.remove_folder(&collection, &path));
            }
            Request::ForceIndexing { collection, reply } => {
                let model = self.indexer.model_name().to_string();
                let _ = reply.send(self.indexer.force_indexing(&collection, &model));
            }
            Request::Retrieve {
                collections,
                query,
                k,
                reply,
            } => {
                let _ = reply.send(self.indexer.retrieve(&collections, &query, k));
            }
            Request::ChangeChunkSize { chunk_size, reply } => {
                let result = self
                    .indexer
                    .change_chunk_size(chunk_size)
                    .and_then(|changed| {
                        self.settings.set_chunk_size(chunk_size)?;
                        Ok(changed)
                    });
                let _ = reply.send(result);
            }
            Request::ChangeFileExtensions { extensions, reply } => {
                let result = self
                    .settings
                    .set_file_extensions(&extensions)
                    .and_then(|()| self.settings.file_extensions())
                    .and_then(|normalized| {
                        self.indexer.change_file_extensions(&normalized)
                    });
                let _ = reply.send(result);
            }
            Request::Collections { reply } => {
                let _ = reply.send(self.indexer.list_collections());
            }
            Request::WaitIdle { reply } => {
                if self.indexer.is_idle() {
                    let _ = reply.send(());
                } else {
                    self.idle_waiters.push(reply);
                }
            }
            // Handled by the loop.
            Request::Shutdown => {}
        }
    }
}

async fn next_change(
    changes: &mut Option<mpsc::UnboundedReceiver<PathBuf>>,
) -> Option<PathBuf> {
    match changes {
        Some(changes) => changes.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingEmbedder;

    impl Embedder for CountingEmbedder {
        fn model_name(&self) -> &str {
            "counting"
        }

        fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
            Ok(vec![text.len() as f32, 1.0])
        }

        fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            texts.iter().map(|t| self.embed_query(t)).collect()
        }
    }

    async fn test_service() -> (tempfile::TempDir, IndexService) {
        let tmp = tempfile::tempdir().unwrap();
        let data_dir = DataDir::resolve(Some(&tmp.path().join("data"))).unwrap();
        let service = IndexService::spawn(ServiceOptions::new(
            data_dir,
            Arc::new(CountingEmbedder),
        ))
        .await
        .unwrap();
        (tmp, service)
    }

    #[tokio::test]
    async fn indexes_and_lists_a_folder() {
        let (tmp, service) = test_service().await;
        let docs = tmp.path().join("docs");
        std::fs::create_dir_all(&docs).unwrap();
        std::fs::write(docs.join("a.txt"), "alpha beta gamma").unwrap();

        let handle = service.handle();
        assert!(handle.add_folder("notes", &docs).await.unwrap());
        assert!(!handle.add_folder("notes", &docs).await.unwrap());
        handle.wait_idle().await.unwrap();

        let collections = handle.collections().await.unwrap();
        assert_eq!(collections.len(), 1);
        assert_eq!(collections[0].entry.collection, "notes");
        assert_eq!(
            collections[0].entry.embedding_model.as_deref(),
            Some("counting")
        );
        assert_eq!(collections[0].progress.total_docs, 1);
        assert!(collections[0].progress.installed);

        let results = handle
            .retrieve(vec!["notes".into()], "alpha", 5)
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].file, "a.txt");

        service.shutdown().await;
    }

    #[tokio::test]
    async fn handle_fails_after_shutdown() {
        let (_tmp, service) = test_service().await;
        let handle = service.handle();
        service.shutdown().await;

        assert!(matches!(
            handle.collections().await,
            Err(Error::ServiceStopped)
        ));
    }

    #[tokio::test]
    async fn chunk_size_change_is_persisted() {
        let (tmp, service) = test_service().await;
        let handle = service.handle();
        assert!(handle.change_chunk_size(64).await.unwrap());
        assert!(!handle.change_chunk_size(64).await.unwrap());
        service.shutdown().await;

        let settings =
            SettingsDb::open(&tmp.path().join("data").join("settings.redb"))
                .unwrap();
        assert_eq!(settings.chunk_size().unwrap(), 64);
    }
}
