//! Relational catalog of collections, folders, documents and chunks.
//!
//! The catalog is the durable source of truth for what has been indexed.
//! It lives in a single redb file; every relation from the conceptual
//! schema gets a primary table plus the secondary index tables needed to
//! enforce uniqueness and walk ownership edges:
//!
//! ```text
//! collections(id) -> {name, last_update_time, embedding_model}
//! collection_names(name) -> id                      UNIQUE(name)
//! folders(id) -> folder_path
//! folder_paths(folder_path) -> id                   UNIQUE(folder_path)
//! collection_items(collection_id, folder_id)        UNIQUE pair
//! folder_collections(folder_id, collection_id)      reverse edge
//! documents(id) -> {folder_id, document_time, document_path}
//! document_paths(document_path) -> id               UNIQUE(document_path)
//! folder_documents(folder_id, document_id)
//! chunks(id) -> {document_id, chunk_text, file, ..., has_embedding}
//! document_chunks(document_id, chunk_id)
//! ```
//!
//! All mutation goes through [`CatalogTxn`], which wraps one redb write
//! transaction. Dropping a `CatalogTxn` without calling
//! [`CatalogTxn::commit`] rolls every change back.

use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
};

use redb::{
    Database,
    ReadTransaction,
    ReadableDatabase,
    ReadableTable,
    TableDefinition,
    WriteTransaction,
};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::{
    error::{Error, Result},
    schema::SchemaVersion,
};

pub type CollectionId = u64;
pub type FolderId = u64;
pub type DocumentId = u64;
pub type ChunkId = u64;

const META: TableDefinition<&str, u64> = TableDefinition::new("meta");
const COLLECTIONS: TableDefinition<u64, &[u8]> =
    TableDefinition::new("collections");
const COLLECTION_NAMES: TableDefinition<&str, u64> =
    TableDefinition::new("collection_names");
const FOLDERS: TableDefinition<u64, &str> = TableDefinition::new("folders");
const FOLDER_PATHS: TableDefinition<&str, u64> =
    TableDefinition::new("folder_paths");
const COLLECTION_ITEMS: TableDefinition<(u64, u64), ()> =
    TableDefinition::new("collection_items");
const FOLDER_COLLECTIONS: TableDefinition<(u64, u64), ()> =
    TableDefinition::new("folder_collections");
const DOCUMENTS: TableDefinition<u64, &[u8]> =
    TableDefinition::new("documents");
const DOCUMENT_PATHS: TableDefinition<&str, u64> =
    TableDefinition::new("document_paths");
const FOLDER_DOCUMENTS: TableDefinition<(u64, u64), ()> =
    TableDefinition::new("folder_documents");
pub(crate) const CHUNKS: TableDefinition<u64, &[u8]> =
    TableDefinition::new("chunks");
const DOCUMENT_CHUNKS: TableDefinition<(u64, u64), ()> =
    TableDefinition::new("document_chunks");

const SCHEMA_VERSION_KEY: &str = "schema_version";

/// Line numbers are not tracked yet; chunks report this for both bounds.
pub const UNKNOWN_LINE: i32 = -1;

/// Page value for documents without pages (plain text).
pub const NO_PAGE: i32 = -1;

/// A named group of folders sharing one embedding model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Collection {
    pub id: CollectionId,
    pub name: String,
    /// Milliseconds since the Unix epoch.
    pub last_update_time: Option<i64>,
    /// `None` means the collection is waiting for a forced re-index.
    pub embedding_model: Option<String>,
}

impl Collection {
    pub fn needs_force_indexing(&self) -> bool {
        self.embedding_model.is_none()
    }
}

/// One row of the collection/folder join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionFolder {
    pub collection: Collection,
    pub folder_id: FolderId,
    pub folder_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub id: DocumentId,
    pub folder_id: FolderId,
    pub path: String,
    /// Modification time in milliseconds since the Unix epoch.
    pub mod_time: i64,
}

/// Provenance attached to every chunk cut from a document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub file: String,
    pub title: String,
    pub author: String,
    pub subject: String,
    pub keywords: String,
    /// One-based page number, or [`NO_PAGE`].
    pub page: i32,
}

/// A chunk about to be inserted.
#[derive(Debug, Clone)]
pub struct NewChunk<'a> {
    pub document_id: DocumentId,
    pub text: &'a str,
    pub metadata: &'a ChunkMetadata,
    pub line_from: i32,
    pub line_to: i32,
    pub words: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: ChunkId,
    pub document_id: DocumentId,
    pub text: String,
    #[serde(flatten)]
    pub metadata: ChunkMetadata,
    pub line_from: i32,
    pub line_to: i32,
    pub words: u32,
    pub tokens: u32,
    pub has_embedding: bool,
}

/// A chunk that still needs an embedding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEmbedding {
    pub folder_id: FolderId,
    pub chunk_id: ChunkId,
    pub text: String,
}

/// Document and word totals for one folder.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FolderStatistics {
    pub total_docs: usize,
    pub total_words: u64,
    pub total_tokens: u64,
}

/// A chunk joined with its owning document, as returned to retrieval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrievedChunk {
    pub chunk_id: ChunkId,
    pub document_time: i64,
    pub text: String,
    pub file: String,
    pub title: String,
    pub author: String,
    pub page: i32,
    pub line_from: i32,
    pub line_to: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CollectionRow {
    name: String,
    last_update_time: Option<i64>,
    embedding_model: Option<String>,
}

impl CollectionRow {
    fn into_collection(self, id: CollectionId) -> Collection {
        Collection {
            id,
            name: self.name,
            last_update_time: self.last_update_time,
            embedding_model: self.embedding_model,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DocumentRow {
    folder_id: FolderId,
    document_time: i64,
    document_path: String,
}

impl DocumentRow {
    fn into_document(self, id: DocumentId) -> Document {
        Document {
            id,
            folder_id: self.folder_id,
            path: self.document_path,
            mod_time: self.document_time,
        }
    }
}

/// Handle to the catalog database file.
pub struct Catalog {
    db: Database,
    path: PathBuf,
}

impl Catalog {
    /// Open or create a catalog at the current schema version.
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::create(path)?;

        let txn = db.begin_write()?;
        {
            let mut meta = txn.open_table(META)?;
            if meta.get(SCHEMA_VERSION_KEY)?.is_none() {
                meta.insert(
                    SCHEMA_VERSION_KEY,
                    SchemaVersion::CURRENT.number(),
                )?;
            }
        }
        txn.open_table(COLLECTIONS)?;
        txn.open_table(COLLECTION_NAMES)?;
        txn.open_table(FOLDERS)?;
        txn.open_table(FOLDER_PATHS)?;
        txn.open_table(COLLECTION_ITEMS)?;
        txn.open_table(FOLDER_COLLECTIONS)?;
        txn.open_table(DOCUMENTS)?;
        txn.open_table(DOCUMENT_PATHS)?;
        txn.open_table(FOLDER_DOCUMENTS)?;
        txn.open_table(CHUNKS)?;
        txn.open_table(DOCUMENT_CHUNKS)?;
        txn.commit()?;

        Ok(Self {
            db,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Start a write transaction. Uncommitted changes roll back on drop.
    pub fn begin(&self) -> Result<CatalogTxn> {
        Ok(CatalogTxn {
            txn: self.db.begin_write()?,
        })
    }

    /// Start a read-only snapshot.
    pub fn read(&self) -> Result<CatalogReader> {
        Ok(CatalogReader {
            txn: self.db.begin_read()?,
        })
    }
}

impl std::fmt::Debug for Catalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Catalog")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

/// A read-only view of the catalog.
pub struct CatalogReader {
    txn: ReadTransaction,
}

impl CatalogReader {
    /// Every collection/folder link, ordered by collection name then path.
    pub fn select_all_collections(&self) -> Result<Vec<CollectionFolder>> {
        collect_collection_folders(
            &self.txn.open_table(COLLECTIONS)?,
            &self.txn.open_table(COLLECTION_ITEMS)?,
            &self.txn.open_table(FOLDERS)?,
        )
    }

    pub fn folder_statistics(
        &self,
        folder_id: FolderId,
    ) -> Result<FolderStatistics> {
        compute_folder_statistics(
            &self.txn.open_table(FOLDER_DOCUMENTS)?,
            &self.txn.open_table(DOCUMENT_CHUNKS)?,
            &self.txn.open_table(CHUNKS)?,
            folder_id,
        )
    }

    pub fn get_chunk(&self, chunk_id: ChunkId) -> Result<Option<Chunk>> {
        read_json(&self.txn.open_table(CHUNKS)?, chunk_id)
    }

    /// Join candidate chunk ids against the catalog, keeping only chunks
    /// whose folder belongs to one of `collection_names`. Output order
    /// follows chunk id, not the order of `chunk_ids`.
    pub fn select_chunks(
        &self,
        chunk_ids: &[ChunkId],
        collection_names: &[String],
    ) -> Result<Vec<RetrievedChunk>> {
        let chunks = self.txn.open_table(CHUNKS)?;
        let documents = self.txn.open_table(DOCUMENTS)?;
        let folder_collections = self.txn.open_table(FOLDER_COLLECTIONS)?;
        let collections = self.txn.open_table(COLLECTIONS)?;

        let wanted: HashSet<&str> =
            collection_names.iter().map(String::as_str).collect();
        let mut allowed_folders: HashMap<FolderId, bool> = HashMap::new();

        let mut ids = chunk_ids.to_vec();
        ids.sort_unstable();
        ids.dedup();

        let mut rows = Vec::new();
        for chunk_id in ids {
            let Some(chunk) = read_json::<Chunk>(&chunks, chunk_id)? else {
                continue;
            };
            let Some(document) =
                read_json::<DocumentRow>(&documents, chunk.document_id)?
            else {
                continue;
            };

            let allowed = match allowed_folders.get(&document.folder_id) {
                Some(allowed) => *allowed,
                None => {
                    let mut allowed = false;
                    for collection_id in
                        second_keys(&folder_collections, document.folder_id)?
                    {
                        if let Some(row) = read_json::<CollectionRow>(
                            &collections,
                            collection_id,
                        )? && wanted.contains(row.name.as_str())
                        {
                            allowed = true;
                            break;
                        }
                    }
                    allowed_folders.insert(document.folder_id, allowed);
                    allowed
                }
            };
            if !allowed {
                continue;
            }

            rows.push(RetrievedChunk {
                chunk_id,
                document_time: document.document_time,
                text: chunk.text,
                file: chunk.metadata.file,
                title: chunk.metadata.title,
                author: chunk.metadata.author,
                page: chunk.metadata.page,
                line_from: chunk.line_from,
                line_to: chunk.line_to,
            });
        }

        Ok(rows)
    }
}

/// One write transaction over the catalog.
pub struct CatalogTxn {
    txn: WriteTransaction,
}

impl CatalogTxn {
    pub fn commit(self) -> Result<()> {
        self.txn.commit()?;
        Ok(())
    }

    pub fn abort(self) -> Result<()> {
        self.txn.abort()?;
        Ok(())
    }

    fn next_id(&self, sequence: &str) -> Result<u64> {
        let mut meta = self.txn.open_table(META)?;
        let next = meta.get(sequence)?.map(|v| v.value()).unwrap_or(0) + 1;
        meta.insert(sequence, next)?;
        Ok(next)
    }

    // -- Folders --

    pub fn select_folder(&self, folder_path: &str) -> Result<Option<FolderId>> {
        let table = self.txn.open_table(FOLDER_PATHS)?;
        Ok(table.get(folder_path)?.map(|v| v.value()))
    }

    pub fn folder_path(&self, folder_id: FolderId) -> Result<Option<String>> {
        let table = self.txn.open_table(FOLDERS)?;
        Ok(table.get(folder_id)?.map(|v| v.value().to_string()))
    }

    pub fn insert_folder(&self, folder_path: &str) -> Result<FolderId> {
        if self.select_folder(folder_path)?.is_some() {
            return Err(Error::Config(format!(
                "folder already exists: {folder_path}"
            )));
        }
        let id = self.next_id("seq:folders")?;
        self.txn.open_table(FOLDERS)?.insert(id, folder_path)?;
        self.txn.open_table(FOLDER_PATHS)?.insert(folder_path, id)?;
        Ok(id)
    }

    pub fn delete_folder(&self, folder_id: FolderId) -> Result<bool> {
        let removed = {
            let mut folders = self.txn.open_table(FOLDERS)?;
            folders.remove(folder_id)?.map(|v| v.value().to_string())
        };
        let Some(path) = removed else {
            return Ok(false);
        };
        self.txn.open_table(FOLDER_PATHS)?.remove(path.as_str())?;
        Ok(true)
    }

    pub fn all_folders(&self) -> Result<Vec<(FolderId, String)>> {
        let table = self.txn.open_table(FOLDERS)?;
        let mut result = Vec::new();
        for entry in table.iter()? {
            let (k, v) = entry?;
            result.push((k.value(), v.value().to_string()));
        }
        Ok(result)
    }

    // -- Collections --

    pub fn select_collection_by_name(
        &self,
        name: &str,
    ) -> Result<Option<Collection>> {
        let id = {
            let names = self.txn.open_table(COLLECTION_NAMES)?;
            names.get(name)?.map(|v| v.value())
        };
        let Some(id) = id else {
            return Ok(None);
        };
        let collections = self.txn.open_table(COLLECTIONS)?;
        Ok(read_json::<CollectionRow>(&collections, id)?
            .map(|row| row.into_collection(id)))
    }

    pub fn insert_collection(
        &self,
        name: &str,
        last_update_time: Option<i64>,
        embedding_model: Option<&str>,
    ) -> Result<Collection> {
        if self.select_collection_by_name(name)?.is_some() {
            return Err(Error::Config(format!(
                "collection already exists: {name}"
            )));
        }
        let id = self.next_id("seq:collections")?;
        let row = CollectionRow {
            name: name.to_string(),
            last_update_time,
            embedding_model: embedding_model.map(str::to_string),
        };
        write_json(&mut self.txn.open_table(COLLECTIONS)?, id, &row)?;
        self.txn.open_table(COLLECTION_NAMES)?.insert(name, id)?;
        Ok(row.into_collection(id))
    }

    pub fn set_collection_embedding_model(
        &self,
        name: &str,
        embedding_model: &str,
    ) -> Result<()> {
        self.update_collection(name, |row| {
            row.embedding_model = Some(embedding_model.to_string());
        })
    }

    pub fn set_collection_last_update(
        &self,
        collection_id: CollectionId,
        time: i64,
    ) -> Result<()> {
        let mut table = self.txn.open_table(COLLECTIONS)?;
        let Some(mut row) = read_json::<CollectionRow>(&table, collection_id)?
        else {
            return Ok(());
        };
        row.last_update_time = Some(time);
        write_json(&mut table, collection_id, &row)
    }

    fn update_collection(
        &self,
        name: &str,
        update: impl FnOnce(&mut CollectionRow),
    ) -> Result<()> {
        let collection =
            self.select_collection_by_name(name)?.ok_or_else(|| {
                Error::NotFound {
                    kind: "collection",
                    name: name.to_string(),
                }
            })?;
        let mut table = self.txn.open_table(COLLECTIONS)?;
        let Some(mut row) = read_json::<CollectionRow>(&table, collection.id)?
        else {
            return Ok(());
        };
        update(&mut row);
        write_json(&mut table, collection.id, &row)
    }

    /// Link a folder to a collection. Returns `false` if the link already
    /// existed (insert-or-ignore).
    pub fn insert_collection_item(
        &self,
        collection_id: CollectionId,
        folder_id: FolderId,
    ) -> Result<bool> {
        let existed = self
            .txn
            .open_table(COLLECTION_ITEMS)?
            .insert((collection_id, folder_id), ())?
            .is_some();
        self.txn
            .open_table(FOLDER_COLLECTIONS)?
            .insert((folder_id, collection_id), ())?;
        Ok(!existed)
    }

    /// Unlink a folder from the named collection and return how many links
    /// to the folder remain.
    pub fn delete_collection_item(
        &self,
        collection_name: &str,
        folder_id: FolderId,
    ) -> Result<usize> {
        let not_linked = || Error::NotFound {
            kind: "collection folder",
            name: format!("{collection_name}:{folder_id}"),
        };
        let collection = self
            .select_collection_by_name(collection_name)?
            .ok_or_else(not_linked)?;

        let removed = self
            .txn
            .open_table(COLLECTION_ITEMS)?
            .remove((collection.id, folder_id))?
            .is_some();
        if !removed {
            return Err(not_linked());
        }
        let mut reverse = self.txn.open_table(FOLDER_COLLECTIONS)?;
        reverse.remove((folder_id, collection.id))?;
        Ok(second_keys(&reverse, folder_id)?.len())
    }

    /// Delete every collection that has no folder left. Returns the names
    /// of the pruned collections.
    pub fn prune_collections(&self) -> Result<Vec<String>> {
        let orphans = {
            let collections = self.txn.open_table(COLLECTIONS)?;
            let items = self.txn.open_table(COLLECTION_ITEMS)?;
            let mut orphans = Vec::new();
            for entry in collections.iter()? {
                let (k, v) = entry?;
                let id = k.value();
                if second_keys(&items, id)?.is_empty() {
                    let row: CollectionRow =
                        serde_json::from_slice(v.value())?;
                    orphans.push((id, row.name));
                }
            }
            orphans
        };

        let mut collections = self.txn.open_table(COLLECTIONS)?;
        let mut names = self.txn.open_table(COLLECTION_NAMES)?;
        for (id, name) in &orphans {
            collections.remove(*id)?;
            names.remove(name.as_str())?;
        }
        Ok(orphans.into_iter().map(|(_, name)| name).collect())
    }

    pub fn collections_for_folder(
        &self,
        folder_id: FolderId,
    ) -> Result<Vec<Collection>> {
        let reverse = self.txn.open_table(FOLDER_COLLECTIONS)?;
        let collections = self.txn.open_table(COLLECTIONS)?;
        let mut result = Vec::new();
        for id in second_keys(&reverse, folder_id)? {
            if let Some(row) = read_json::<CollectionRow>(&collections, id)? {
                result.push(row.into_collection(id));
            }
        }
        Ok(result)
    }

    pub fn folders_for_collection(
        &self,
        collection_name: &str,
    ) -> Result<Vec<(FolderId, String)>> {
        let Some(collection) =
            self.select_collection_by_name(collection_name)?
        else {
            return Ok(Vec::new());
        };
        let items = self.txn.open_table(COLLECTION_ITEMS)?;
        let folders = self.txn.open_table(FOLDERS)?;
        let mut result = Vec::new();
        for folder_id in second_keys(&items, collection.id)? {
            if let Some(path) = folders.get(folder_id)? {
                result.push((folder_id, path.value().to_string()));
            }
        }
        Ok(result)
    }

    pub fn select_all_collections(&self) -> Result<Vec<CollectionFolder>> {
        collect_collection_folders(
            &self.txn.open_table(COLLECTIONS)?,
            &self.txn.open_table(COLLECTION_ITEMS)?,
            &self.txn.open_table(FOLDERS)?,
        )
    }

    // -- Documents --

    pub fn select_document(&self, path: &str) -> Result<Option<Document>> {
        let id = {
            let paths = self.txn.open_table(DOCUMENT_PATHS)?;
            paths.get(path)?.map(|v| v.value())
        };
        let Some(id) = id else {
            return Ok(None);
        };
        let documents = self.txn.open_table(DOCUMENTS)?;
        Ok(read_json::<DocumentRow>(&documents, id)?
            .map(|row| row.into_document(id)))
    }

    pub fn insert_document(
        &self,
        folder_id: FolderId,
        document_time: i64,
        path: &str,
    ) -> Result<DocumentId> {
        if self.select_document(path)?.is_some() {
            return Err(Error::Config(format!(
                "document already exists: {path}"
            )));
        }
        let id = self.next_id("seq:documents")?;
        let row = DocumentRow {
            folder_id,
            document_time,
            document_path: path.to_string(),
        };
        write_json(&mut self.txn.open_table(DOCUMENTS)?, id, &row)?;
        self.txn.open_table(DOCUMENT_PATHS)?.insert(path, id)?;
        self.txn
            .open_table(FOLDER_DOCUMENTS)?
            .insert((folder_id, id), ())?;
        Ok(id)
    }

    pub fn update_document_time(
        &self,
        document_id: DocumentId,
        document_time: i64,
    ) -> Result<()> {
        let mut table = self.txn.open_table(DOCUMENTS)?;
        let mut row = read_json::<DocumentRow>(&table, document_id)?
            .ok_or_else(|| Error::NotFound {
                kind: "document",
                name: document_id.to_string(),
            })?;
        row.document_time = document_time;
        write_json(&mut table, document_id, &row)
    }

    /// Delete a document row. Its chunks must already be gone.
    pub fn delete_document(&self, document_id: DocumentId) -> Result<bool> {
        let row = {
            let mut table = self.txn.open_table(DOCUMENTS)?;
            let removed = table.remove(document_id)?;
            match removed {
                Some(bytes) => Some(serde_json::from_slice::<DocumentRow>(
                    bytes.value(),
                )?),
                None => None,
            }
        };
        let Some(row) = row else {
            return Ok(false);
        };
        self.txn
            .open_table(DOCUMENT_PATHS)?
            .remove(row.document_path.as_str())?;
        self.txn
            .open_table(FOLDER_DOCUMENTS)?
            .remove((row.folder_id, document_id))?;
        Ok(true)
    }

    pub fn documents_in_folder(
        &self,
        folder_id: FolderId,
    ) -> Result<Vec<DocumentId>> {
        second_keys(&self.txn.open_table(FOLDER_DOCUMENTS)?, folder_id)
    }

    pub fn all_documents(&self) -> Result<Vec<Document>> {
        let table = self.txn.open_table(DOCUMENTS)?;
        let mut result = Vec::new();
        for entry in table.iter()? {
            let (k, v) = entry?;
            let row: DocumentRow = serde_json::from_slice(v.value())?;
            result.push(row.into_document(k.value()));
        }
        Ok(result)
    }

    // -- Chunks --

    pub fn insert_chunk(&self, chunk: &NewChunk<'_>) -> Result<ChunkId> {
        let id = self.next_id("seq:chunks")?;
        let row = Chunk {
            id,
            document_id: chunk.document_id,
            text: chunk.text.to_string(),
            metadata: chunk.metadata.clone(),
            line_from: chunk.line_from,
            line_to: chunk.line_to,
            words: chunk.words,
            tokens: 0,
            has_embedding: false,
        };
        write_json(&mut self.txn.open_table(CHUNKS)?, id, &row)?;
        self.txn
            .open_table(DOCUMENT_CHUNKS)?
            .insert((chunk.document_id, id), ())?;
        Ok(id)
    }

    pub fn get_chunk(&self, chunk_id: ChunkId) -> Result<Option<Chunk>> {
        read_json(&self.txn.open_table(CHUNKS)?, chunk_id)
    }

    pub fn chunk_ids_for_document(
        &self,
        document_id: DocumentId,
    ) -> Result<Vec<ChunkId>> {
        second_keys(&self.txn.open_table(DOCUMENT_CHUNKS)?, document_id)
    }

    /// Delete every chunk of a document, returning the removed ids so the
    /// caller can drop their vectors once the transaction commits.
    pub fn delete_chunks_for_document(
        &self,
        document_id: DocumentId,
    ) -> Result<Vec<ChunkId>> {
        let ids = self.chunk_ids_for_document(document_id)?;
        let mut chunks = self.txn.open_table(CHUNKS)?;
        let mut edges = self.txn.open_table(DOCUMENT_CHUNKS)?;
        for &id in &ids {
            chunks.remove(id)?;
            edges.remove((document_id, id))?;
        }
        Ok(ids)
    }

    /// The `file` column of a chunk, or `None` once the chunk is gone.
    pub fn chunk_file(&self, chunk_id: ChunkId) -> Result<Option<String>> {
        Ok(self.get_chunk(chunk_id)?.map(|c| c.metadata.file))
    }

    /// Set `has_embedding` on a chunk. Missing chunks are ignored.
    pub fn mark_embedded(&self, chunk_id: ChunkId) -> Result<bool> {
        let mut table = self.txn.open_table(CHUNKS)?;
        let Some(mut chunk) = read_json::<Chunk>(&table, chunk_id)? else {
            return Ok(false);
        };
        if !chunk.has_embedding {
            chunk.has_embedding = true;
            write_json(&mut table, chunk_id, &chunk)?;
        }
        Ok(true)
    }

    /// Chunks of a folder whose embedding was never recorded, in id order.
    pub fn select_uncompleted_chunks(
        &self,
        folder_id: FolderId,
    ) -> Result<Vec<PendingEmbedding>> {
        let folder_documents = self.txn.open_table(FOLDER_DOCUMENTS)?;
        let document_chunks = self.txn.open_table(DOCUMENT_CHUNKS)?;
        let chunks = self.txn.open_table(CHUNKS)?;

        let mut pending = Vec::new();
        for document_id in second_keys(&folder_documents, folder_id)? {
            for chunk_id in second_keys(&document_chunks, document_id)? {
                if let Some(chunk) = read_json::<Chunk>(&chunks, chunk_id)?
                    && !chunk.has_embedding
                {
                    pending.push(PendingEmbedding {
                        folder_id,
                        chunk_id,
                        text: chunk.text,
                    });
                }
            }
        }
        pending.sort_by_key(|p| p.chunk_id);
        Ok(pending)
    }

    pub fn count_chunks(&self, folder_id: FolderId) -> Result<usize> {
        let folder_documents = self.txn.open_table(FOLDER_DOCUMENTS)?;
        let document_chunks = self.txn.open_table(DOCUMENT_CHUNKS)?;
        let mut count = 0;
        for document_id in second_keys(&folder_documents, folder_id)? {
            count += second_keys(&document_chunks, document_id)?.len();
        }
        Ok(count)
    }

    pub fn folder_statistics(
        &self,
        folder_id: FolderId,
    ) -> Result<FolderStatistics> {
        compute_folder_statistics(
            &self.txn.open_table(FOLDER_DOCUMENTS)?,
            &self.txn.open_table(DOCUMENT_CHUNKS)?,
            &self.txn.open_table(CHUNKS)?,
            folder_id,
        )
    }
}

fn read_json<T: DeserializeOwned>(
    table: &impl ReadableTable<u64, &'static [u8]>,
    id: u64,
) -> Result<Option<T>> {
    match table.get(id)? {
        Some(bytes) => Ok(Some(serde_json::from_slice(bytes.value())?)),
        None => Ok(None),
    }
}

fn write_json<T: Serialize>(
    table: &mut redb::Table<'_, u64, &'static [u8]>,
    id: u64,
    value: &T,
) -> Result<()> {
    let bytes = serde_json::to_vec(value)?;
    table.insert(id, bytes.as_slice())?;
    Ok(())
}

/// All `b` such that `(first, b)` is a key of an edge table.
fn second_keys(
    table: &impl ReadableTable<(u64, u64), ()>,
    first: u64,
) -> Result<Vec<u64>> {
    let mut result = Vec::new();
    for entry in table.range((first, 0)..=(first, u64::MAX))? {
        let (k, _) = entry?;
        result.push(k.value().1);
    }
    Ok(result)
}

fn collect_collection_folders(
    collections: &impl ReadableTable<u64, &'static [u8]>,
    items: &impl ReadableTable<(u64, u64), ()>,
    folders: &impl ReadableTable<u64, &'static str>,
) -> Result<Vec<CollectionFolder>> {
    let mut result = Vec::new();
    for entry in collections.iter()? {
        let (k, v) = entry?;
        let id = k.value();
        let row: CollectionRow = serde_json::from_slice(v.value())?;
        let collection = row.into_collection(id);
        for folder_id in second_keys(items, id)? {
            if let Some(path) = folders.get(folder_id)? {
                result.push(CollectionFolder {
                    collection: collection.clone(),
                    folder_id,
                    folder_path: path.value().to_string(),
                });
            }
        }
    }
    result.sort_by(|a, b| {
        a.collection
            .name
            .cmp(&b.collection.name)
            .then_with(|| a.folder_path.cmp(&b.folder_path))
    });
    Ok(result)
}

fn compute_folder_statistics(
    folder_documents: &impl ReadableTable<(u64, u64), ()>,
    document_chunks: &impl ReadableTable<(u64, u64), ()>,
    chunks: &impl ReadableTable<u64, &'static [u8]>,
    folder_id: FolderId,
) -> Result<FolderStatistics> {
    let mut stats = FolderStatistics::default();
    for document_id in second_keys(folder_documents, folder_id)? {
        stats.total_docs += 1;
        for chunk_id in second_keys(document_chunks, document_id)? {
            if let Some(chunk) = read_json::<Chunk>(chunks, chunk_id)? {
                stats.total_words += u64::from(chunk.words);
                stats.total_tokens += u64::from(chunk.tokens);
            }
        }
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_catalog() -> (tempfile::TempDir, Catalog) {
        let tmp = tempfile::tempdir().unwrap();
        let catalog = Catalog::open(&tmp.path().join("catalog.redb")).unwrap();
        (tmp, catalog)
    }

    fn meta(file: &str) -> ChunkMetadata {
        ChunkMetadata {
            file: file.to_string(),
            page: NO_PAGE,
            ..Default::default()
        }
    }

    fn add_chunk(txn: &CatalogTxn, document_id: DocumentId, text: &str) -> u64 {
        txn.insert_chunk(&NewChunk {
            document_id,
            text,
            metadata: &meta("a.txt"),
            line_from: UNKNOWN_LINE,
            line_to: UNKNOWN_LINE,
            words: text.split_whitespace().count() as u32,
        })
        .unwrap()
    }

    #[test]
    fn folder_paths_are_unique() {
        let (_tmp, catalog) = test_catalog();
        let txn = catalog.begin().unwrap();

        let id = txn.insert_folder("/docs").unwrap();
        assert_eq!(txn.select_folder("/docs").unwrap(), Some(id));
        assert_eq!(txn.folder_path(id).unwrap().as_deref(), Some("/docs"));
        assert!(txn.insert_folder("/docs").is_err());

        assert!(txn.delete_folder(id).unwrap());
        assert_eq!(txn.select_folder("/docs").unwrap(), None);
        assert!(!txn.delete_folder(id).unwrap());
    }

    #[test]
    fn collection_links_are_insert_or_ignore() {
        let (_tmp, catalog) = test_catalog();
        let txn = catalog.begin().unwrap();

        let folder = txn.insert_folder("/docs").unwrap();
        let collection =
            txn.insert_collection("notes", None, Some("model")).unwrap();

        assert!(txn.insert_collection_item(collection.id, folder).unwrap());
        assert!(!txn.insert_collection_item(collection.id, folder).unwrap());

        let all = txn.select_all_collections().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].folder_path, "/docs");
        assert_eq!(all[0].collection.name, "notes");
    }

    #[test]
    fn unlink_reports_remaining_references_and_prunes() {
        let (_tmp, catalog) = test_catalog();
        let txn = catalog.begin().unwrap();

        let folder = txn.insert_folder("/docs").unwrap();
        let a = txn.insert_collection("a", None, Some("m")).unwrap();
        let b = txn.insert_collection("b", None, Some("m")).unwrap();
        txn.insert_collection_item(a.id, folder).unwrap();
        txn.insert_collection_item(b.id, folder).unwrap();

        assert_eq!(txn.delete_collection_item("a", folder).unwrap(), 1);
        assert_eq!(txn.prune_collections().unwrap(), vec!["a".to_string()]);
        assert!(txn.select_collection_by_name("a").unwrap().is_none());
        assert!(txn.select_collection_by_name("b").unwrap().is_some());

        assert_eq!(txn.delete_collection_item("b", folder).unwrap(), 0);
        assert!(txn.delete_collection_item("b", folder).is_err());
    }

    #[test]
    fn chunks_follow_their_document() {
        let (_tmp, catalog) = test_catalog();
        let txn = catalog.begin().unwrap();

        let folder = txn.insert_folder("/docs").unwrap();
        let doc = txn.insert_document(folder, 10, "/docs/a.txt").unwrap();
        let c1 = add_chunk(&txn, doc, "hello world");
        let c2 = add_chunk(&txn, doc, "second chunk here");
        assert!(c2 > c1);

        assert_eq!(txn.chunk_ids_for_document(doc).unwrap(), vec![c1, c2]);
        assert_eq!(txn.chunk_file(c1).unwrap().as_deref(), Some("a.txt"));

        let stats = txn.folder_statistics(folder).unwrap();
        assert_eq!(stats.total_docs, 1);
        assert_eq!(stats.total_words, 5);

        assert_eq!(txn.delete_chunks_for_document(doc).unwrap(), vec![c1, c2]);
        assert!(txn.chunk_ids_for_document(doc).unwrap().is_empty());
        assert_eq!(txn.chunk_file(c1).unwrap(), None);

        assert!(txn.delete_document(doc).unwrap());
        assert!(txn.select_document("/docs/a.txt").unwrap().is_none());
        assert!(txn.documents_in_folder(folder).unwrap().is_empty());
    }

    #[test]
    fn uncompleted_chunks_exclude_embedded_ones() {
        let (_tmp, catalog) = test_catalog();
        let txn = catalog.begin().unwrap();

        let folder = txn.insert_folder("/docs").unwrap();
        let doc = txn.insert_document(folder, 10, "/docs/a.txt").unwrap();
        let c1 = add_chunk(&txn, doc, "one");
        let c2 = add_chunk(&txn, doc, "two");

        assert!(txn.mark_embedded(c1).unwrap());
        assert!(!txn.mark_embedded(999).unwrap());

        let pending = txn.select_uncompleted_chunks(folder).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].chunk_id, c2);
        assert_eq!(pending[0].folder_id, folder);
        assert_eq!(pending[0].text, "two");
        assert_eq!(txn.count_chunks(folder).unwrap(), 2);
    }

    #[test]
    fn dropped_transaction_rolls_back() {
        let (_tmp, catalog) = test_catalog();
        {
            let txn = catalog.begin().unwrap();
            txn.insert_folder("/docs").unwrap();
            // dropped without commit
        }
        let txn = catalog.begin().unwrap();
        assert_eq!(txn.select_folder("/docs").unwrap(), None);
    }

    #[test]
    fn select_chunks_filters_by_collection() {
        let (_tmp, catalog) = test_catalog();
        let txn = catalog.begin().unwrap();

        let f1 = txn.insert_folder("/one").unwrap();
        let f2 = txn.insert_folder("/two").unwrap();
        let a = txn.insert_collection("a", None, Some("m")).unwrap();
        let b = txn.insert_collection("b", None, Some("m")).unwrap();
        txn.insert_collection_item(a.id, f1).unwrap();
        txn.insert_collection_item(b.id, f2).unwrap();

        let d1 = txn.insert_document(f1, 1, "/one/x.txt").unwrap();
        let d2 = txn.insert_document(f2, 2, "/two/y.txt").unwrap();
        let c1 = add_chunk(&txn, d1, "from one");
        let c2 = add_chunk(&txn, d2, "from two");
        txn.commit().unwrap();

        let reader = catalog.read().unwrap();
        let rows = reader
            .select_chunks(&[c2, c1, 4242], &["a".to_string()])
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].chunk_id, c1);
        assert_eq!(rows[0].text, "from one");
        assert_eq!(rows[0].document_time, 1);
    }

    #[test]
    fn reopen_preserves_data() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("catalog.redb");

        {
            let catalog = Catalog::open(&path).unwrap();
            let txn = catalog.begin().unwrap();
            txn.insert_folder("/docs").unwrap();
            txn.commit().unwrap();
        }

        {
            let catalog = Catalog::open(&path).unwrap();
            let txn = catalog.begin().unwrap();
            assert!(txn.select_folder("/docs").unwrap().is_some());
            // sequences survive reopen
            assert_eq!(txn.insert_folder("/other").unwrap(), 2);
        }
    }
}
