//! The catalog thread's state machine.
//!
//! [`Indexer`] owns the catalog, the vector store and the scan queues and
//! is the only thing that mutates them. It is synchronous:
//! [`crate::service`] drives it from one dedicated thread, and tests drive
//! it directly.
//!
//! Ordering rules that every operation follows:
//!
//! - A scan cycle is one catalog transaction. Chunks inserted during the
//!   cycle only reach the embedding batcher after that transaction
//!   commits.
//! - Vectors of deleted chunks are removed from the vector store after the
//!   deleting transaction commits, followed by a single save.
//! - Chunks are marked as embedded only after the vector store save that
//!   covers them has succeeded.

use std::{
    collections::HashSet,
    fs::{self, File},
    io,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};

use tracing::{debug, error, info, warn};

use crate::{
    batcher::{DEFAULT_BATCH_SIZE, EmbeddingBatcher},
    catalog::{
        Catalog,
        CatalogTxn,
        ChunkId,
        ChunkMetadata,
        CollectionFolder,
        DocumentId,
        FolderId,
        NO_PAGE,
        NewChunk,
        PendingEmbedding,
        UNKNOWN_LINE,
    },
    chunking::{ChunkBuilder, ChunkText},
    embedding::{BatchSubmitter, Embedder, EmbeddingResult, WorkerEvent},
    error::{Error, Result},
    events::{
        CollectionEntry,
        CollectionStatus,
        EventSender,
        FolderProgress,
        IndexEvent,
        ProgressBoard,
    },
    pdf::{PdfField, PdfLoader, is_pdf},
    retrieval::{self, RetrievalResult},
    scan_queue::{ResumePoint, ScanCursor, ScanQueue},
    settings::{DEFAULT_CHUNK_SIZE, DEFAULT_FILE_EXTENSIONS},
    text_reader::{WordReader, is_binary_content},
    vector_store::VectorStore,
    walker::{self, ExtensionFilter},
    watcher::{FolderWatch, NoWatch},
};

/// Wall-clock budget of one scan cycle.
pub const SCAN_SLICE: Duration = Duration::from_millis(100);

/// How often the service checks for scan work.
pub const SCAN_TICK: Duration = Duration::from_millis(10);

/// Chunks cut from one plain-text document per cycle before it goes back
/// to the front of its queue.
pub const MAX_CHUNKS_PER_SCAN: usize = 100;

#[derive(Debug, Clone)]
pub struct IndexerConfig {
    /// Chunk length limit in characters.
    pub chunk_size: usize,
    pub file_extensions: Vec<String>,
    pub batch_size: usize,
    pub scan_slice: Duration,
    pub max_chunks_per_scan: usize,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            file_extensions: DEFAULT_FILE_EXTENSIONS
                .iter()
                .map(|ext| ext.to_string())
                .collect(),
            batch_size: DEFAULT_BATCH_SIZE,
            scan_slice: SCAN_SLICE,
            max_chunks_per_scan: MAX_CHUNKS_PER_SCAN,
        }
    }
}

/// How one visit to a document ended.
#[derive(Debug)]
enum ScanOutcome {
    Completed,
    Unchanged,
    /// Missing, unreadable, or of a type nobody can extract.
    Skipped,
    BinarySkipped,
    /// More work remains; the cursor goes back to the front of its queue.
    Continue(ScanCursor),
}

/// Side effects a scan cycle defers until its transaction commits.
#[derive(Debug, Default)]
struct ScanCycle {
    pending: Vec<PendingEmbedding>,
    removed: Vec<ChunkId>,
    drained: Vec<FolderId>,
    statistics_stale: bool,
}

/// The document chunks are being cut from.
#[derive(Debug)]
struct DocumentContext {
    folder_id: FolderId,
    document_id: DocumentId,
    metadata: ChunkMetadata,
}

#[derive(Debug, Default)]
struct ChunkRun {
    chunks: usize,
    words: u64,
    /// Stopped because the per-cycle chunk cap was hit.
    capped: bool,
}

/// A committed unlink whose in-memory side effects are still due.
#[derive(Debug)]
struct FolderUnlink {
    collection: String,
    folder_id: FolderId,
    folder_path: String,
    last_link: bool,
    pruned: Vec<String>,
}

/// Incremental indexer over a set of collections.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
///
/// use localdocs::{
///     Catalog, ColbertEmbedder, Indexer, IndexerConfig, RedbVectorStore,
///     embedding::BatchSubmitter, catalog::PendingEmbedding,
/// };
///
/// struct Discard;
/// impl BatchSubmitter for Discard {
///     fn submit(&mut self, _batch: Vec<PendingEmbedding>) -> bool {
///         true
///     }
/// }
///
/// let catalog = Catalog::open("catalog.redb".as_ref()).unwrap();
/// let vectors = RedbVectorStore::new("vectors.redb".as_ref());
/// let mut indexer = Indexer::new(
///     catalog,
///     Box::new(vectors),
///     Arc::new(ColbertEmbedder::new(None)),
///     Box::new(Discard),
///     IndexerConfig::default(),
/// )
/// .unwrap();
///
/// indexer.start().unwrap();
/// indexer
///     .add_folder("notes", "/home/me/notes".as_ref(), "my-model")
///     .unwrap();
/// while indexer.scan_batch().unwrap() {}
/// ```
pub struct Indexer {
    catalog: Catalog,
    vectors: Box<dyn VectorStore>,
    embedder: Arc<dyn Embedder>,
    submitter: Box<dyn BatchSubmitter>,
    watch: Box<dyn FolderWatch>,
    pdf: Option<Box<dyn PdfLoader>>,
    queue: ScanQueue,
    batcher: EmbeddingBatcher,
    progress: ProgressBoard,
    config: IndexerConfig,
    filter: ExtensionFilter,
    in_flight: usize,
    valid: bool,
}

impl Indexer {
    pub fn new(
        catalog: Catalog,
        vectors: Box<dyn VectorStore>,
        embedder: Arc<dyn Embedder>,
        submitter: Box<dyn BatchSubmitter>,
        config: IndexerConfig,
    ) -> Result<Self> {
        if config.chunk_size == 0 {
            return Err(Error::Config("chunk size must be positive".into()));
        }
        let filter = ExtensionFilter::new(&config.file_extensions)?;
        Ok(Self {
            catalog,
            vectors,
            embedder,
            submitter,
            watch: Box::new(NoWatch),
            pdf: None,
            queue: ScanQueue::new(),
            batcher: EmbeddingBatcher::new(config.batch_size),
            progress: ProgressBoard::new(None),
            config,
            filter,
            in_flight: 0,
            valid: true,
        })
    }

    pub fn with_watch(mut self, watch: Box<dyn FolderWatch>) -> Self {
        self.watch = watch;
        self
    }

    pub fn with_pdf_loader(mut self, loader: Box<dyn PdfLoader>) -> Self {
        self.pdf = Some(loader);
        self
    }

    pub fn with_events(mut self, events: EventSender) -> Self {
        self.progress = ProgressBoard::new(Some(events));
        self
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn config(&self) -> &IndexerConfig {
        &self.config
    }

    pub fn model_name(&self) -> &str {
        self.embedder.model_name()
    }

    pub fn progress(&self, folder_id: FolderId) -> Option<&FolderProgress> {
        self.progress.get(folder_id)
    }

    /// `false` once the vector store failed to load. Every mutating
    /// operation then fails with [`Error::DatabaseInvalid`].
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn has_pending_scans(&self) -> bool {
        !self.queue.is_empty()
    }

    /// Nothing queued, nothing buffered, no batch awaiting its vectors.
    pub fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.batcher.is_empty() && self.in_flight == 0
    }

    fn ensure_valid(&self) -> Result<()> {
        if self.valid {
            Ok(())
        } else {
            Err(Error::DatabaseInvalid)
        }
    }

    // -- Startup --

    /// Load the vector store, sweep stale entries, then resume every
    /// folder that is not waiting for a forced re-index.
    pub fn start(&mut self) -> Result<()> {
        if self.vectors.file_exists()
            && let Err(e) = self.vectors.load()
        {
            error!(error = %e, "Failed to load the vector store");
            self.valid = false;
            self.progress.emit(IndexEvent::DatabaseInvalid);
            return Err(Error::DatabaseInvalid);
        }

        if let Err(e) = self.sweep() {
            warn!(error = %e, "Consistency sweep failed");
        }
        self.add_current_folders()
    }

    fn add_current_folders(&mut self) -> Result<()> {
        let rows = self.catalog.read()?.select_all_collections()?;
        self.progress
            .reset(rows.iter().map(CollectionEntry::from).collect());

        let mut seen = HashSet::new();
        for row in &rows {
            if row.collection.needs_force_indexing()
                || !seen.insert(row.folder_id)
            {
                continue;
            }
            if let Err(e) = self.resubmit_uncompleted(row.folder_id) {
                warn!(
                    folder = %row.folder_path,
                    error = %e,
                    "Failed to resubmit chunks without embeddings"
                );
            }
            let path = PathBuf::from(&row.folder_path);
            self.watch.watch(&path);
            self.scan_folder(row.folder_id, &path);
        }
        self.update_statistics()
    }

    /// Submit every chunk of a folder that has no embedding yet. Returns
    /// how many were submitted.
    pub fn resubmit_uncompleted(&mut self, folder_id: FolderId) -> Result<usize> {
        let (pending, total) = {
            let txn = self.catalog.begin()?;
            (
                txn.select_uncompleted_chunks(folder_id)?,
                txn.count_chunks(folder_id)?,
            )
        };
        if pending.is_empty() {
            return Ok(0);
        }

        let count = pending.len();
        info!(folder_id, count, "Resubmitting chunks without embeddings");
        self.progress.update(folder_id, |p| {
            p.total_embeddings_to_index = total;
            p.current_embeddings_to_index = count;
        });
        for batch in pending.chunks(self.batcher.batch_size()) {
            self.submit(batch.to_vec());
        }
        Ok(count)
    }

    fn submit(&mut self, batch: Vec<PendingEmbedding>) {
        if batch.is_empty() {
            return;
        }
        let folder_id = batch[0].folder_id;
        debug!(folder_id, chunks = batch.len(), "Submitting embedding batch");
        if self.submitter.submit(batch) {
            self.in_flight += 1;
            return;
        }
        warn!(folder_id, "Embedding worker unavailable; batch not submitted");
        self.progress.update(folder_id, |p| {
            p.error = Some("embedding worker is not running".to_string());
        });
    }

    // -- Scanning --

    /// Enqueue every eligible file below `path` for `folder_id`, and watch
    /// every directory found on the way.
    fn scan_folder(&mut self, folder_id: FolderId, path: &Path) {
        let scan = match walker::discover_files(path, &self.filter) {
            Ok(scan) => scan,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to walk folder");
                return;
            }
        };
        for dir in &scan.directories {
            self.watch.watch(dir);
        }
        if scan.files.is_empty() {
            return;
        }

        let found = scan.files.len();
        for file in scan.files {
            self.queue
                .push_back(ScanCursor::new(folder_id, file.path, file.size));
        }
        let count = self.queue.count(folder_id);
        let bytes = self.queue.bytes(folder_id);
        debug!(folder_id, found, queued = count, "Enqueued documents");
        self.progress.update(folder_id, |p| {
            p.indexing = true;
            p.current_docs_to_index = count;
            p.total_docs_to_index = count;
            p.current_bytes_to_index = bytes;
            p.total_bytes_to_index = bytes;
        });
    }

    /// Run one time-bounded scan cycle. Returns whether work remains.
    pub fn scan_batch(&mut self) -> Result<bool> {
        self.ensure_valid()?;
        if self.queue.is_empty() {
            return Ok(false);
        }

        let started = Instant::now();
        let txn = self.catalog.begin()?;
        let mut cycle = ScanCycle::default();
        while started.elapsed() < self.config.scan_slice {
            let Some(cursor) = self.queue.pop() else {
                break;
            };
            self.scan_next(&txn, cursor, &mut cycle);
        }

        if let Err(e) = txn.commit() {
            warn!(error = %e, "Scan cycle rolled back");
            return Err(e);
        }

        self.apply_removals(&cycle.removed);
        for item in cycle.pending {
            for batch in self.batcher.push(item) {
                self.submit(batch);
            }
        }
        if (!cycle.drained.is_empty() || self.queue.is_empty())
            && let Some(batch) = self.batcher.flush()
        {
            self.submit(batch);
        }
        for folder_id in &cycle.drained {
            info!(folder_id, "Folder scan complete");
        }
        if cycle.statistics_stale || !cycle.drained.is_empty() {
            self.update_statistics()?;
        }
        Ok(!self.queue.is_empty())
    }

    fn scan_next(
        &mut self,
        txn: &CatalogTxn,
        cursor: ScanCursor,
        cycle: &mut ScanCycle,
    ) {
        let folder_id = cursor.folder_id;
        let path = cursor.path.clone();
        let untouched_bytes =
            (cursor.resume == ResumePoint::Start).then_some(cursor.size);

        let mut produced = Vec::new();
        match self.scan_document(txn, cursor, &mut produced, cycle) {
            Ok(ScanOutcome::Continue(next)) => self.queue.push_front(next),
            Ok(ScanOutcome::Completed) => {}
            Ok(outcome) => {
                debug!(path = %path.display(), ?outcome, "Document not chunked");
                self.release_bytes(folder_id, untouched_bytes.unwrap_or(0));
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to scan document");
                self.release_bytes(folder_id, untouched_bytes.unwrap_or(0));
            }
        }
        cycle.pending.append(&mut produced);
        self.schedule_next(txn, folder_id, cycle);
    }

    fn release_bytes(&mut self, folder_id: FolderId, bytes: u64) {
        if bytes == 0 {
            return;
        }
        self.progress.update(folder_id, |p| {
            p.current_bytes_to_index =
                p.current_bytes_to_index.saturating_sub(bytes);
        });
    }

    /// Publish the folder's remaining count; finish the folder when its
    /// queue is empty.
    fn schedule_next(
        &mut self,
        txn: &CatalogTxn,
        folder_id: FolderId,
        cycle: &mut ScanCycle,
    ) {
        let remaining = self.queue.count(folder_id);
        if remaining > 0 {
            self.progress
                .update(folder_id, |p| p.current_docs_to_index = remaining);
            return;
        }

        let now = now_millis();
        match txn.collections_for_folder(folder_id) {
            Ok(collections) => {
                for collection in collections {
                    if let Err(e) =
                        txn.set_collection_last_update(collection.id, now)
                    {
                        warn!(collection = %collection.name, error = %e, "Failed to record update time");
                    }
                }
            }
            Err(e) => {
                warn!(folder_id, error = %e, "Failed to look up collections")
            }
        }

        self.progress.update(folder_id, |p| {
            p.current_docs_to_index = 0;
            p.current_bytes_to_index = 0;
            p.indexing = false;
            p.installed = true;
            p.last_update = Some(now);
        });
        cycle.drained.push(folder_id);
    }

    fn scan_document(
        &mut self,
        txn: &CatalogTxn,
        cursor: ScanCursor,
        produced: &mut Vec<PendingEmbedding>,
        cycle: &mut ScanCycle,
    ) -> Result<ScanOutcome> {
        let Ok(metadata) = fs::metadata(&cursor.path) else {
            return Ok(ScanOutcome::Skipped);
        };
        if !metadata.is_file() || File::open(&cursor.path).is_err() {
            return Ok(ScanOutcome::Skipped);
        }
        let pdf = is_pdf(&cursor.path);
        if pdf && self.pdf.is_none() {
            return Ok(ScanOutcome::Skipped);
        }

        let document_time = walker::modified_millis(&metadata);
        let document_path = cursor.path.to_string_lossy().into_owned();
        let (document_id, folder_id) = match txn
            .select_document(&document_path)?
        {
            Some(doc) if cursor.currently_processing => (doc.id, doc.folder_id),
            Some(doc) if doc.mod_time == document_time => {
                return Ok(ScanOutcome::Unchanged);
            }
            Some(doc) => {
                debug!(path = %document_path, "Document changed; re-chunking");
                cycle
                    .removed
                    .extend(txn.delete_chunks_for_document(doc.id)?);
                cycle.statistics_stale = true;
                txn.update_document_time(doc.id, document_time)?;
                (doc.id, doc.folder_id)
            }
            // Deleted while partially processed.
            None if cursor.currently_processing => {
                return Ok(ScanOutcome::Skipped);
            }
            None => {
                let id = txn.insert_document(
                    cursor.folder_id,
                    document_time,
                    &document_path,
                )?;
                self.progress.update(cursor.folder_id, |p| p.total_docs += 1);
                (id, cursor.folder_id)
            }
        };

        let file = cursor
            .path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let document = DocumentContext {
            folder_id,
            document_id,
            metadata: ChunkMetadata {
                file,
                page: NO_PAGE,
                ..Default::default()
            },
        };

        if pdf {
            self.scan_pdf_page(txn, cursor, document, produced)
        } else {
            self.scan_text(txn, cursor, &document, produced, cycle)
        }
    }

    fn scan_text(
        &mut self,
        txn: &CatalogTxn,
        cursor: ScanCursor,
        document: &DocumentContext,
        produced: &mut Vec<PendingEmbedding>,
        cycle: &mut ScanCycle,
    ) -> Result<ScanOutcome> {
        let start = match cursor.resume {
            ResumePoint::Byte(offset) => offset,
            _ => 0,
        };
        let mut reader = WordReader::open(File::open(&cursor.path)?, start)?;
        let max_chunks = Some(self.config.max_chunks_per_scan);

        let result = chunk_words(
            txn,
            document,
            self.config.chunk_size,
            max_chunks,
            produced,
            || reader.next_word(),
        )
        .and_then(|run| {
            let finished = !run.capped || reader.at_end()?;
            Ok((run, finished))
        });

        let (run, finished) = match result {
            Ok(done) => done,
            Err(Error::Io(e)) if is_binary_content(&e) => {
                info!(path = %cursor.path.display(), "Ignoring file with binary data");
                cycle
                    .removed
                    .extend(txn.delete_chunks_for_document(document.document_id)?);
                produced.clear();
                cycle.statistics_stale = true;
                self.release_bytes(
                    cursor.folder_id,
                    cursor.size.saturating_sub(start),
                );
                return Ok(ScanOutcome::BinarySkipped);
            }
            Err(e) => return Err(e),
        };

        let position = reader.position();
        self.record_run(
            cursor.folder_id,
            document.folder_id,
            &run,
            position.saturating_sub(start),
        );
        if finished {
            Ok(ScanOutcome::Completed)
        } else {
            Ok(ScanOutcome::Continue(
                cursor.continued(ResumePoint::Byte(position)),
            ))
        }
    }

    fn scan_pdf_page(
        &mut self,
        txn: &CatalogTxn,
        cursor: ScanCursor,
        mut document: DocumentContext,
        produced: &mut Vec<PendingEmbedding>,
    ) -> Result<ScanOutcome> {
        let Some(loader) = &self.pdf else {
            return Ok(ScanOutcome::Skipped);
        };
        let pdf = loader.open(&cursor.path)?;

        let page_count = pdf.page_count();
        let page = match cursor.resume {
            ResumePoint::Page(page) => page,
            _ => 0,
        };
        if page >= page_count {
            if page_count == 0 {
                self.release_bytes(cursor.folder_id, cursor.size);
            }
            return Ok(ScanOutcome::Completed);
        }

        document.metadata.title = pdf.metadata(PdfField::Title);
        document.metadata.author = pdf.metadata(PdfField::Author);
        document.metadata.subject = pdf.metadata(PdfField::Subject);
        document.metadata.keywords = pdf.metadata(PdfField::Keywords);
        document.metadata.page = i32::try_from(page + 1).unwrap_or(i32::MAX);

        let text = pdf.page_text(page)?;
        let mut words = text.split_whitespace();
        let run = chunk_words(
            txn,
            &document,
            self.config.chunk_size,
            None,
            produced,
            || Ok(words.next().map(str::to_owned)),
        )?;

        let last = page + 1 >= page_count;
        let consumed = page_share(cursor.size, page, page_count);
        self.record_run(cursor.folder_id, document.folder_id, &run, consumed);

        if last {
            Ok(ScanOutcome::Completed)
        } else {
            Ok(ScanOutcome::Continue(
                cursor.continued(ResumePoint::Page(page + 1)),
            ))
        }
    }

    fn record_run(
        &mut self,
        scan_folder: FolderId,
        document_folder: FolderId,
        run: &ChunkRun,
        bytes: u64,
    ) {
        self.release_bytes(scan_folder, bytes);
        if run.chunks == 0 {
            return;
        }
        self.progress.update(document_folder, |p| {
            p.current_embeddings_to_index += run.chunks;
            p.total_embeddings_to_index += run.chunks;
            p.total_words += run.words;
        });
    }

    // -- Embedding results --

    pub fn handle_worker_event(&mut self, event: WorkerEvent) -> Result<usize> {
        match event {
            WorkerEvent::Embedded(results) => self.handle_embeddings(results),
            WorkerEvent::Failed { folder_id, message } => {
                self.handle_embedding_error(folder_id, message);
                Ok(0)
            }
        }
    }

    /// Reconcile one batch of vectors. Returns how many chunks were marked
    /// as embedded.
    pub fn handle_embeddings(
        &mut self,
        results: Vec<EmbeddingResult>,
    ) -> Result<usize> {
        self.in_flight = self.in_flight.saturating_sub(1);
        self.ensure_valid()?;
        let Some(folder_id) = results.first().map(|r| r.folder_id) else {
            return Ok(0);
        };
        if let Some(stray) = results.iter().find(|r| r.folder_id != folder_id)
        {
            error!(
                expected = folder_id,
                found = stray.folder_id,
                "Embedding batch spans more than one folder"
            );
            return Err(Error::MixedFolderBatch {
                expected: folder_id,
                found: stray.folder_id,
            });
        }

        let mut embedded = Vec::with_capacity(results.len());
        let mut last_file = None;
        {
            let reader = self.catalog.read()?;
            for result in &results {
                let Some(chunk) = reader.get_chunk(result.chunk_id)? else {
                    debug!(chunk_id = result.chunk_id, "Chunk deleted before its embedding arrived");
                    continue;
                };
                match self.vectors.add(&result.vector, result.chunk_id) {
                    Ok(()) => embedded.push(result.chunk_id),
                    Err(e) => warn!(
                        chunk_id = result.chunk_id,
                        error = %e,
                        "Failed to add embedding"
                    ),
                }
                last_file = Some(chunk.metadata.file);
            }
        }

        if self.progress.get(folder_id).is_some() {
            let delivered = results.len();
            self.progress.update(folder_id, |p| {
                p.current_embeddings_to_index =
                    p.current_embeddings_to_index.saturating_sub(delivered);
                if last_file.is_some() {
                    p.file_currently_processing = last_file;
                }
            });
        }
        if embedded.is_empty() {
            return Ok(0);
        }

        if let Err(e) = self.vectors.save() {
            warn!(folder_id, error = %e, "Vector store save failed; batch left unmarked");
            if self.progress.get(folder_id).is_some() {
                let message = e.to_string();
                self.progress.update(folder_id, |p| p.error = Some(message));
            }
            return Err(e);
        }

        let txn = self.catalog.begin()?;
        for chunk_id in &embedded {
            txn.mark_embedded(*chunk_id)?;
        }
        txn.commit()?;
        if self.progress.get(folder_id).is_some_and(|p| p.error.is_some()) {
            self.progress.update(folder_id, |p| p.error = None);
        }
        debug!(folder_id, chunks = embedded.len(), "Embeddings recorded");
        Ok(embedded.len())
    }

    pub fn handle_embedding_error(&mut self, folder_id: FolderId, message: String) {
        self.in_flight = self.in_flight.saturating_sub(1);
        warn!(folder_id, error = %message, "Embedding batch failed");
        self.progress.update(folder_id, |p| p.error = Some(message));
    }

    // -- Collections and folders --

    /// Link `path` into `collection`, creating either as needed. A new
    /// collection records `embedding_model`; an existing one keeps its
    /// own. Returns `false` when the link already existed.
    pub fn add_folder(
        &mut self,
        collection: &str,
        path: &Path,
        embedding_model: &str,
    ) -> Result<bool> {
        self.ensure_valid()?;
        let folder = path
            .canonicalize()
            .ok()
            .filter(|p| is_readable_dir(p))
            .ok_or_else(|| {
                warn!(path = %path.display(), "Folder does not exist or is not readable");
                Error::NotFound {
                    kind: "folder",
                    name: path.display().to_string(),
                }
            })?;
        let folder_path = folder.to_string_lossy().into_owned();

        let txn = self.catalog.begin()?;
        let folder_id = match txn.select_folder(&folder_path)? {
            Some(id) => id,
            None => txn.insert_folder(&folder_path)?,
        };
        let record = match txn.select_collection_by_name(collection)? {
            Some(existing) => existing,
            None => txn.insert_collection(collection, None, Some(embedding_model))?,
        };
        let linked = txn.insert_collection_item(record.id, folder_id)?;
        txn.commit()?;

        if !linked {
            debug!(collection, folder = %folder_path, "Folder already linked");
            return Ok(false);
        }

        let row = CollectionFolder {
            collection: record,
            folder_id,
            folder_path,
        };
        info!(collection, folder = %row.folder_path, "Added folder");
        self.progress.add(CollectionEntry::from(&row));
        if !row.collection.needs_force_indexing() {
            self.watch.watch(&folder);
            self.scan_folder(folder_id, &folder);
        }
        Ok(true)
    }

    /// Unlink `path` from `collection`. The folder's documents, chunks and
    /// vectors are only dropped when no other collection links it.
    pub fn remove_folder(&mut self, collection: &str, path: &Path) -> Result<()> {
        self.ensure_valid()?;
        let txn = self.catalog.begin()?;
        let raw = path.to_string_lossy().into_owned();
        let canonical = path
            .canonicalize()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|_| raw.clone());
        let folder = match txn.select_folder(&canonical)? {
            Some(id) => Some((id, canonical)),
            None => txn.select_folder(&raw)?.map(|id| (id, raw)),
        };
        let Some((folder_id, folder_path)) = folder else {
            warn!(collection, path = %path.display(), "Folder is not indexed");
            return Err(Error::NotFound {
                kind: "folder",
                name: path.display().to_string(),
            });
        };

        let mut removed = Vec::new();
        let unlink =
            unlink_folder(&txn, collection, folder_id, &folder_path, &mut removed)?;
        txn.commit()?;

        self.finish_unlink(unlink);
        self.apply_removals(&removed);
        self.update_statistics()
    }

    fn finish_unlink(&mut self, unlink: FolderUnlink) {
        self.progress.remove_link(&unlink.collection, unlink.folder_id);
        for name in &unlink.pruned {
            info!(collection = %name, "Removed empty collection");
        }
        if !unlink.last_link {
            return;
        }

        let dropped = self.queue.remove_folder(unlink.folder_id);
        let unsent = self.batcher.remove_folder(unlink.folder_id);
        self.progress.forget(unlink.folder_id);
        let root = PathBuf::from(&unlink.folder_path);
        let mut watched = walker::subdirectories(&root);
        watched.push(root);
        self.watch.unwatch(&watched);
        info!(
            folder = %unlink.folder_path,
            dropped,
            unsent,
            "Folder removed from index"
        );
    }

    /// Remove staged chunk vectors and persist the store once.
    fn apply_removals(&mut self, removed: &[ChunkId]) {
        if removed.is_empty() {
            return;
        }
        for chunk_id in removed {
            self.vectors.remove(*chunk_id);
        }
        if let Err(e) = self.vectors.save() {
            warn!(chunks = removed.len(), error = %e, "Failed to save vector store after removals");
        }
    }

    /// Assign an embedding model to a collection carried over from an older
    /// catalog and start indexing its folders.
    pub fn force_indexing(
        &mut self,
        collection: &str,
        embedding_model: &str,
    ) -> Result<()> {
        self.ensure_valid()?;
        let txn = self.catalog.begin()?;
        if txn.select_collection_by_name(collection)?.is_none() {
            return Err(Error::NotFound {
                kind: "collection",
                name: collection.to_string(),
            });
        }
        let folders = txn.folders_for_collection(collection)?;
        txn.set_collection_embedding_model(collection, embedding_model)?;
        txn.commit()?;

        info!(collection, model = embedding_model, "Forcing re-index");
        for (folder_id, folder_path) in folders {
            let model = embedding_model.to_string();
            self.progress.update(folder_id, |p| {
                p.embedding_model = Some(model);
                p.force_indexing = false;
            });
            let path = PathBuf::from(&folder_path);
            self.watch.watch(&path);
            self.scan_folder(folder_id, &path);
        }
        Ok(())
    }

    // -- Maintenance --

    /// Drop folders that disappeared and documents that vanished, became
    /// unreadable, or no longer match the extension set.
    pub fn sweep(&mut self) -> Result<()> {
        self.ensure_valid()?;
        let txn = self.catalog.begin()?;
        let mut removed = Vec::new();

        let mut unlinks = Vec::new();
        for row in txn.select_all_collections()? {
            if is_readable_dir(Path::new(&row.folder_path)) {
                continue;
            }
            info!(
                collection = %row.collection.name,
                folder = %row.folder_path,
                "Folder is gone; removing"
            );
            unlinks.push(unlink_folder(
                &txn,
                &row.collection.name,
                row.folder_id,
                &row.folder_path,
                &mut removed,
            )?);
        }

        let mut stale = 0;
        for document in txn.all_documents()? {
            let path = Path::new(&document.path);
            if is_readable_file(path) && self.filter.matches(path) {
                continue;
            }
            removed.extend(txn.delete_chunks_for_document(document.id)?);
            txn.delete_document(document.id)?;
            stale += 1;
        }
        txn.commit()?;

        let folders = unlinks.len();
        for unlink in unlinks {
            self.finish_unlink(unlink);
        }
        self.apply_removals(&removed);
        if folders > 0 || stale > 0 {
            info!(
                folders,
                documents = stale,
                chunks = removed.len(),
                "Consistency sweep removed stale entries"
            );
        }
        self.update_statistics()
    }

    /// Re-chunk everything with a new size limit. Returns `false` when the
    /// size is unchanged.
    pub fn change_chunk_size(&mut self, chunk_size: usize) -> Result<bool> {
        self.ensure_valid()?;
        if chunk_size == 0 {
            return Err(Error::Config("chunk size must be positive".into()));
        }
        if chunk_size == self.config.chunk_size {
            return Ok(false);
        }

        let txn = self.catalog.begin()?;
        let mut removed = Vec::new();
        for document in txn.all_documents()? {
            removed.extend(txn.delete_chunks_for_document(document.id)?);
            txn.delete_document(document.id)?;
        }
        txn.commit()?;
        self.apply_removals(&removed);
        self.batcher.flush();

        info!(chunk_size, "Chunk size changed; re-indexing every folder");
        self.config.chunk_size = chunk_size;
        self.add_current_folders()?;
        Ok(true)
    }

    pub fn change_file_extensions(&mut self, extensions: &[String]) -> Result<()> {
        self.ensure_valid()?;
        self.filter = ExtensionFilter::new(extensions)?;
        self.config.file_extensions = extensions.to_vec();
        info!(extensions = ?extensions, "File extensions changed");

        self.sweep()?;
        let rows = self.catalog.read()?.select_all_collections()?;
        let mut seen = HashSet::new();
        for row in rows {
            if row.collection.needs_force_indexing()
                || !seen.insert(row.folder_id)
            {
                continue;
            }
            self.scan_folder(row.folder_id, Path::new(&row.folder_path));
        }
        Ok(())
    }

    /// React to filesystem changes in `paths`: sweep once, then rescan
    /// each changed directory under the folder that owns it.
    pub fn directories_changed(&mut self, paths: &[PathBuf]) -> Result<()> {
        self.ensure_valid()?;
        let owners = {
            let txn = self.catalog.begin()?;
            let mut owners = Vec::new();
            for path in paths {
                for dir in path.ancestors() {
                    if let Some(folder_id) =
                        txn.select_folder(&dir.to_string_lossy())?
                    {
                        owners.push((folder_id, path.clone()));
                        break;
                    }
                }
            }
            owners
        };

        self.sweep()?;
        for (folder_id, path) in owners {
            if path.is_dir() {
                debug!(folder_id, path = %path.display(), "Rescanning changed directory");
                self.scan_folder(folder_id, &path);
            }
        }
        Ok(())
    }

    // -- Queries --

    pub fn retrieve(
        &self,
        collections: &[String],
        query: &str,
        k: usize,
    ) -> Result<Vec<RetrievalResult>> {
        retrieval::retrieve(
            &self.catalog,
            self.vectors.as_ref(),
            self.embedder.as_ref(),
            collections,
            query,
            k,
        )
    }

    /// Every collection/folder link with the folder's current progress.
    pub fn list_collections(&self) -> Result<Vec<CollectionStatus>> {
        let rows = self.catalog.read()?.select_all_collections()?;
        Ok(rows
            .iter()
            .map(|row| CollectionStatus {
                entry: CollectionEntry::from(row),
                progress: self.progress.get(row.folder_id).cloned().unwrap_or_else(
                    || FolderProgress {
                        folder_id: row.folder_id,
                        folder_path: row.folder_path.clone(),
                        ..Default::default()
                    },
                ),
            })
            .collect())
    }

    fn update_statistics(&mut self) -> Result<()> {
        let reader = self.catalog.read()?;
        let mut seen = HashSet::new();
        for row in reader.select_all_collections()? {
            if !seen.insert(row.folder_id) {
                continue;
            }
            let stats = reader.folder_statistics(row.folder_id)?;
            self.progress.update(row.folder_id, |p| {
                p.folder_path = row.folder_path;
                p.total_docs = stats.total_docs;
                p.total_words = stats.total_words;
                p.total_tokens = stats.total_tokens;
            });
        }
        Ok(())
    }
}

impl std::fmt::Debug for Indexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Indexer")
            .field("catalog", &self.catalog)
            .field("queued", &self.queue.len())
            .field("in_flight", &self.in_flight)
            .field("valid", &self.valid)
            .finish_non_exhaustive()
    }
}

/// Delete one collection/folder link inside `txn`, cascading to the
/// folder's documents and chunks when it was the last link.
fn unlink_folder(
    txn: &CatalogTxn,
    collection: &str,
    folder_id: FolderId,
    folder_path: &str,
    removed: &mut Vec<ChunkId>,
) -> Result<FolderUnlink> {
    let remaining = txn.delete_collection_item(collection, folder_id)?;
    let pruned = txn.prune_collections()?;
    let last_link = remaining == 0;
    if last_link {
        for document_id in txn.documents_in_folder(folder_id)? {
            removed.extend(txn.delete_chunks_for_document(document_id)?);
            txn.delete_document(document_id)?;
        }
        txn.delete_folder(folder_id)?;
    }
    Ok(FolderUnlink {
        collection: collection.to_string(),
        folder_id,
        folder_path: folder_path.to_string(),
        last_link,
        pruned,
    })
}

/// Cut chunks from a word stream and insert them, stopping at the end of
/// the stream or after `max_chunks`.
fn chunk_words(
    txn: &CatalogTxn,
    document: &DocumentContext,
    chunk_size: usize,
    max_chunks: Option<usize>,
    produced: &mut Vec<PendingEmbedding>,
    mut next_word: impl FnMut() -> io::Result<Option<String>>,
) -> Result<ChunkRun> {
    let mut builder = ChunkBuilder::new(chunk_size);
    let mut run = ChunkRun::default();
    loop {
        let word = next_word()?;
        let closed = match &word {
            Some(word) => builder.push(word),
            None => builder.finish(),
        };
        if let Some(chunk) = closed {
            run.words += u64::from(chunk.words);
            store_chunk(txn, document, chunk, produced)?;
            run.chunks += 1;
        }
        if word.is_none() {
            break;
        }
        if max_chunks.is_some_and(|max| run.chunks >= max) {
            run.capped = true;
            break;
        }
    }
    Ok(run)
}

fn store_chunk(
    txn: &CatalogTxn,
    document: &DocumentContext,
    chunk: ChunkText,
    produced: &mut Vec<PendingEmbedding>,
) -> Result<()> {
    let chunk_id = txn.insert_chunk(&NewChunk {
        document_id: document.document_id,
        text: &chunk.text,
        metadata: &document.metadata,
        line_from: UNKNOWN_LINE,
        line_to: UNKNOWN_LINE,
        words: chunk.words,
    })?;
    produced.push(PendingEmbedding {
        folder_id: document.folder_id,
        chunk_id,
        text: chunk.text,
    });
    Ok(())
}

/// Bytes of a `size`-byte PDF attributed to one page. Pages share the size
/// evenly and the last page takes the remainder.
fn page_share(size: u64, page: usize, page_count: usize) -> u64 {
    let pages = page_count.max(1) as u64;
    let even = size / pages;
    if page + 1 >= page_count {
        size - even * (pages - 1)
    } else {
        even
    }
}

fn is_readable_dir(path: &Path) -> bool {
    fs::read_dir(path).is_ok()
}

fn is_readable_file(path: &Path) -> bool {
    path.is_file() && File::open(path).is_ok()
}

/// Milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
