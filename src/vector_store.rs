use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
};

use rayon::prelude::*;
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};

use crate::{
    catalog::ChunkId,
    error::{Error, Result},
};

const VECTORS: TableDefinition<u64, &[u8]> = TableDefinition::new("vectors");

/// Nearest-neighbour index over chunk embeddings.
///
/// Mutations are staged in memory and only become durable on
/// [`VectorStore::save`].
pub trait VectorStore: Send {
    fn add(&mut self, vector: &[f32], chunk_id: ChunkId) -> Result<()>;

    fn remove(&mut self, chunk_id: ChunkId);

    /// Chunk ids of the `k` nearest vectors, best first.
    fn search(&self, query: &[f32], k: usize) -> Result<Vec<ChunkId>>;

    fn save(&mut self) -> Result<()>;

    fn load(&mut self) -> Result<()>;

    fn is_loaded(&self) -> bool;

    fn file_exists(&self) -> bool;
}

/// Exact cosine-similarity index kept in memory and persisted to redb.
///
/// Stored format per entry: the vector's f32 values, little endian,
/// keyed by chunk id.
pub struct RedbVectorStore {
    path: PathBuf,
    db: Option<Database>,
    vectors: HashMap<ChunkId, Vec<f32>>,
    dimension: Option<usize>,
    staged_adds: HashSet<ChunkId>,
    staged_removes: HashSet<ChunkId>,
}

impl RedbVectorStore {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            db: None,
            vectors: HashMap::new(),
            dimension: None,
            staged_adds: HashSet::new(),
            staged_removes: HashSet::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    pub fn contains(&self, chunk_id: ChunkId) -> bool {
        self.vectors.contains_key(&chunk_id)
    }

    fn open_db(&mut self) -> Result<()> {
        if self.db.is_none() {
            self.db = Some(create_db(&self.path)?);
        }
        Ok(())
    }

    fn db(&self) -> Result<&Database> {
        self.db
            .as_ref()
            .ok_or_else(|| Error::VectorStore("vector store is not open".into()))
    }
}

impl VectorStore for RedbVectorStore {
    fn add(&mut self, vector: &[f32], chunk_id: ChunkId) -> Result<()> {
        if vector.is_empty() {
            return Err(Error::VectorStore("empty vector".into()));
        }
        match self.dimension {
            Some(dim) if dim != vector.len() => {
                return Err(Error::VectorStore(format!(
                    "dimension mismatch: index has {dim}, got {}",
                    vector.len()
                )));
            }
            Some(_) => {}
            None => self.dimension = Some(vector.len()),
        }
        self.open_db()?;

        self.vectors.insert(chunk_id, vector.to_vec());
        self.staged_removes.remove(&chunk_id);
        self.staged_adds.insert(chunk_id);
        Ok(())
    }

    fn remove(&mut self, chunk_id: ChunkId) {
        self.vectors.remove(&chunk_id);
        self.staged_adds.remove(&chunk_id);
        self.staged_removes.insert(chunk_id);
    }

    fn search(&self, query: &[f32], k: usize) -> Result<Vec<ChunkId>> {
        if !self.is_loaded() {
            return Err(Error::VectorStore("vector store is not loaded".into()));
        }
        if k == 0 || self.vectors.is_empty() {
            return Ok(Vec::new());
        }
        if self.dimension.is_some_and(|dim| dim != query.len()) {
            return Err(Error::VectorStore(format!(
                "query has dimension {}, index has {:?}",
                query.len(),
                self.dimension
            )));
        }

        let query_norm = norm(query);
        let mut scored: Vec<(ChunkId, f32)> = self
            .vectors
            .par_iter()
            .map(|(&id, v)| (id, cosine(query, query_norm, v)))
            .collect();

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });
        scored.truncate(k);
        Ok(scored.into_iter().map(|(id, _)| id).collect())
    }

    fn save(&mut self) -> Result<()> {
        if self.staged_adds.is_empty() && self.staged_removes.is_empty() {
            return Ok(());
        }
        self.open_db()?;
        let txn = self.db()?.begin_write()?;
        {
            let mut table = txn.open_table(VECTORS)?;
            for id in &self.staged_removes {
                table.remove(*id)?;
            }
            for id in &self.staged_adds {
                if let Some(vector) = self.vectors.get(id) {
                    let bytes: &[u8] = bytemuck::cast_slice(vector);
                    table.insert(*id, bytes)?;
                }
            }
        }
        txn.commit()?;

        self.staged_adds.clear();
        self.staged_removes.clear();
        Ok(())
    }

    fn load(&mut self) -> Result<()> {
        self.db = None;
        let db = create_db(&self.path)?;
        let (vectors, dimension) = read_vectors(&db)?;

        self.vectors = vectors;
        self.dimension = dimension;
        self.staged_adds.clear();
        self.staged_removes.clear();
        self.db = Some(db);
        Ok(())
    }

    fn is_loaded(&self) -> bool {
        self.db.is_some()
    }

    fn file_exists(&self) -> bool {
        self.path.exists()
    }
}

impl std::fmt::Debug for RedbVectorStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbVectorStore")
            .field("path", &self.path)
            .field("len", &self.vectors.len())
            .finish_non_exhaustive()
    }
}

fn create_db(path: &Path) -> Result<Database> {
    let db = Database::create(path)?;
    let txn = db.begin_write()?;
    txn.open_table(VECTORS)?;
    txn.commit()?;
    Ok(db)
}

type LoadedVectors = (HashMap<ChunkId, Vec<f32>>, Option<usize>);

fn read_vectors(db: &Database) -> Result<LoadedVectors> {
    let txn = db.begin_read()?;
    let table = txn.open_table(VECTORS)?;

    let mut vectors = HashMap::new();
    let mut dimension = None;
    for entry in table.iter()? {
        let (k, v) = entry?;
        let bytes = v.value();
        if bytes.is_empty() || bytes.len() % 4 != 0 {
            return Err(Error::VectorStore(format!(
                "corrupt vector for chunk {}",
                k.value()
            )));
        }
        let vector: Vec<f32> = bytemuck::pod_collect_to_vec(bytes);
        match dimension {
            None => dimension = Some(vector.len()),
            Some(dim) if dim != vector.len() => {
                return Err(Error::VectorStore(format!(
                    "mixed dimensions in vector store: {dim} and {}",
                    vector.len()
                )));
            }
            Some(_) => {}
        }
        vectors.insert(k.value(), vector);
    }
    Ok((vectors, dimension))
}

fn norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

fn cosine(query: &[f32], query_norm: f32, v: &[f32]) -> f32 {
    let denom = query_norm * norm(v);
    if denom == 0.0 {
        return 0.0;
    }
    let dot: f32 = query.iter().zip(v).map(|(a, b)| a * b).sum();
    dot / denom
}
