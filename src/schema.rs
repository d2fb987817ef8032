//! On-disk catalog versions and the upgrade path between them.
//!
//! Each schema version lives in its own file (`localdocs_v<N>.redb`). At
//! startup the newest file that holds content wins. Older files are only
//! ever read: their collections are carried into a fresh catalog at the
//! current version with no embedding model, so they wait for a forced
//! re-index before anything is scanned.

use std::path::Path;

use redb::{
    Database,
    ReadableDatabase,
    ReadableTable,
    TableDefinition,
    TableHandle,
};
use tracing::info;

use crate::{
    catalog::{CHUNKS, Catalog},
    data_dir::DataDir,
    error::Result,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SchemaVersion {
    V1,
    V2,
}

impl SchemaVersion {
    pub const CURRENT: SchemaVersion = SchemaVersion::V2;

    /// Oldest version first.
    pub const ALL: [SchemaVersion; 2] = [SchemaVersion::V1, SchemaVersion::V2];

    pub fn number(self) -> u64 {
        match self {
            SchemaVersion::V1 => 1,
            SchemaVersion::V2 => 2,
        }
    }
}

/// A collection/folder pair read from an older catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyCollection {
    pub name: String,
    pub folder_path: String,
}

type SelectOldCollections = fn(&Database) -> Result<Vec<LegacyCollection>>;

/// Versions we can upgrade from, with the query that reads their
/// collections.
const MIGRATIONS: &[(SchemaVersion, SelectOldCollections)] =
    &[(SchemaVersion::V1, select_v1_collections)];

// Version 1 stored collections as bare (name, folder_id) pairs.
const V1_COLLECTIONS: TableDefinition<(&str, u64), ()> =
    TableDefinition::new("collections");
const V1_FOLDERS: TableDefinition<u64, &str> = TableDefinition::new("folders");

fn select_v1_collections(db: &Database) -> Result<Vec<LegacyCollection>> {
    let txn = db.begin_read()?;
    let collections = txn.open_table(V1_COLLECTIONS)?;
    let folders = txn.open_table(V1_FOLDERS)?;

    let mut result = Vec::new();
    for entry in collections.iter()? {
        let (key, _) = entry?;
        let (name, folder_id) = key.value();
        if let Some(path) = folders.get(folder_id)? {
            result.push(LegacyCollection {
                name: name.to_string(),
                folder_path: path.value().to_string(),
            });
        }
    }
    Ok(result)
}

/// Whether a catalog file exists and holds the chunk table.
fn has_content(path: &Path) -> Result<bool> {
    if !path.exists() {
        return Ok(false);
    }
    let db = Database::open(path)?;
    let txn = db.begin_read()?;
    let found = txn.list_tables()?.any(|t| t.name() == CHUNKS.name());
    Ok(found)
}

/// Newest version with an existing, non-empty catalog file.
pub fn probe(data_dir: &DataDir) -> Result<Option<SchemaVersion>> {
    for version in SchemaVersion::ALL.into_iter().rev() {
        if has_content(&data_dir.catalog_db(version))? {
            return Ok(Some(version));
        }
    }
    Ok(None)
}

/// Open the current catalog, upgrading from an older version if that is
/// the newest one on disk. Returns the carried-over collections, which are
/// registered without an embedding model.
pub fn open_latest(
    data_dir: &DataDir,
) -> Result<(Catalog, Vec<LegacyCollection>)> {
    let found = probe(data_dir)?;

    let legacy = match found {
        Some(version) if version < SchemaVersion::CURRENT => {
            read_legacy(version, &data_dir.catalog_db(version))?
        }
        _ => Vec::new(),
    };

    let catalog = Catalog::open(&data_dir.catalog_db(SchemaVersion::CURRENT))?;
    if !legacy.is_empty() {
        register_legacy(&catalog, &legacy)?;
        info!(
            from = found.map(SchemaVersion::number),
            collections = legacy.len(),
            "Carried collections over from an older catalog"
        );
    }
    Ok((catalog, legacy))
}

fn read_legacy(
    version: SchemaVersion,
    path: &Path,
) -> Result<Vec<LegacyCollection>> {
    let Some((_, select)) = MIGRATIONS.iter().find(|(v, _)| *v == version)
    else {
        return Ok(Vec::new());
    };
    let db = Database::open(path)?;
    select(&db)
}

fn register_legacy(catalog: &Catalog, legacy: &[LegacyCollection]) -> Result<()> {
    let txn = catalog.begin()?;
    for item in legacy {
        let folder_id = match txn.select_folder(&item.folder_path)? {
            Some(id) => id,
            None => txn.insert_folder(&item.folder_path)?,
        };
        let collection = match txn.select_collection_by_name(&item.name)? {
            Some(c) => c,
            None => txn.insert_collection(&item.name, None, None)?,
        };
        txn.insert_collection_item(collection.id, folder_id)?;
    }
    txn.commit()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_v1(path: &Path, rows: &[(&str, u64, &str)]) {
        let db = Database::create(path).unwrap();
        let txn = db.begin_write().unwrap();
        {
            let mut collections = txn.open_table(V1_COLLECTIONS).unwrap();
            let mut folders = txn.open_table(V1_FOLDERS).unwrap();
            for (name, folder_id, path) in rows {
                collections.insert((*name, *folder_id), ()).unwrap();
                folders.insert(*folder_id, *path).unwrap();
            }
            txn.open_table(CHUNKS).unwrap();
        }
        txn.commit().unwrap();
    }

    #[test]
    fn versions_are_ordered() {
        assert!(SchemaVersion::V1 < SchemaVersion::CURRENT);
        assert_eq!(SchemaVersion::ALL.last(), Some(&SchemaVersion::CURRENT));
        assert_eq!(SchemaVersion::V1.number(), 1);
    }

    #[test]
    fn fresh_directory_opens_current_without_legacy() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = DataDir::resolve(Some(tmp.path())).unwrap();

        assert_eq!(probe(&dir).unwrap(), None);
        let (_catalog, legacy) = open_latest(&dir).unwrap();
        assert!(legacy.is_empty());
        assert_eq!(probe(&dir).unwrap(), Some(SchemaVersion::CURRENT));
    }

    #[test]
    fn upgrades_v1_collections_without_model() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = DataDir::resolve(Some(tmp.path())).unwrap();
        write_v1(
            &dir.catalog_db(SchemaVersion::V1),
            &[("notes", 1, "/home/u/notes"), ("work", 2, "/home/u/work")],
        );

        assert_eq!(probe(&dir).unwrap(), Some(SchemaVersion::V1));
        let (catalog, legacy) = open_latest(&dir).unwrap();
        assert_eq!(legacy.len(), 2);

        let reader = catalog.read().unwrap();
        let all = reader.select_all_collections().unwrap();
        assert_eq!(all.len(), 2);
        assert!(all.iter().all(|c| c.collection.needs_force_indexing()));
        assert_eq!(all[0].collection.name, "notes");
        assert_eq!(all[0].folder_path, "/home/u/notes");

        // The old file is left in place, untouched.
        assert!(dir.catalog_db(SchemaVersion::V1).exists());
    }

    #[test]
    fn current_version_wins_over_older_files() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = DataDir::resolve(Some(tmp.path())).unwrap();
        write_v1(&dir.catalog_db(SchemaVersion::V1), &[("old", 1, "/old")]);
        drop(Catalog::open(&dir.catalog_db(SchemaVersion::CURRENT)).unwrap());

        let (catalog, legacy) = open_latest(&dir).unwrap();
        assert!(legacy.is_empty());
        let reader = catalog.read().unwrap();
        assert!(reader.select_all_collections().unwrap().is_empty());
    }
}
