use std::path::Path;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};

use crate::error::{Error, Result};

const SETTINGS: TableDefinition<&str, &str> = TableDefinition::new("settings");

pub const DEFAULT_CHUNK_SIZE: usize = 512;
pub const DEFAULT_FILE_EXTENSIONS: &[&str] = &["txt", "md", "rst"];
pub const DEFAULT_EMBEDDING_MODEL: &str = "lightonai/GTE-ModernColBERT-v1";

const CHUNK_SIZE_KEY: &str = "chunk_size";
const FILE_EXTENSIONS_KEY: &str = "file_extensions";
const EMBEDDING_MODEL_KEY: &str = "embedding_model";

/// Persisted user settings, one string value per key.
pub struct SettingsDb {
    db: Database,
}

impl SettingsDb {
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::create(path)?;

        let txn = db.begin_write()?;
        txn.open_table(SETTINGS)?;
        txn.commit()?;

        Ok(Self { db })
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(SETTINGS)?;
            table.insert(key, value)?;
        }
        txn.commit()?;
        Ok(())
    }

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(SETTINGS)?;
        Ok(table.get(key)?.map(|v| v.value().to_string()))
    }

    /// Get a setting, returning the default if not set.
    pub fn get_setting_or(&self, key: &str, default: &str) -> Result<String> {
        Ok(self
            .get_setting(key)?
            .unwrap_or_else(|| default.to_string()))
    }

    // -- Typed accessors --

    /// Chunk size limit in characters.
    pub fn chunk_size(&self) -> Result<usize> {
        match self.get_setting(CHUNK_SIZE_KEY)? {
            Some(raw) => raw.parse().map_err(|_| {
                Error::Config(format!("invalid chunk_size setting: {raw}"))
            }),
            None => Ok(DEFAULT_CHUNK_SIZE),
        }
    }

    pub fn set_chunk_size(&self, size: usize) -> Result<()> {
        if size == 0 {
            return Err(Error::Config("chunk size must be positive".into()));
        }
        self.set_setting(CHUNK_SIZE_KEY, &size.to_string())
    }

    /// Watched file extensions, lowercase, without the leading dot.
    pub fn file_extensions(&self) -> Result<Vec<String>> {
        match self.get_setting(FILE_EXTENSIONS_KEY)? {
            Some(raw) => Ok(parse_extensions(&raw)),
            None => Ok(DEFAULT_FILE_EXTENSIONS
                .iter()
                .map(|s| s.to_string())
                .collect()),
        }
    }

    pub fn set_file_extensions(&self, extensions: &[String]) -> Result<()> {
        let normalized = normalize_extensions(extensions);
        if normalized.is_empty() {
            return Err(Error::Config(
                "at least one file extension is required".into(),
            ));
        }
        self.set_setting(FILE_EXTENSIONS_KEY, &normalized.join(","))
    }

    pub fn embedding_model(&self) -> Result<String> {
        self.get_setting_or(EMBEDDING_MODEL_KEY, DEFAULT_EMBEDDING_MODEL)
    }

    pub fn set_embedding_model(&self, model: &str) -> Result<()> {
        self.set_setting(EMBEDDING_MODEL_KEY, model)
    }
}

impl std::fmt::Debug for SettingsDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SettingsDb").finish_non_exhaustive()
    }
}

/// Split a comma-separated extension list, as typed by a user.
pub fn parse_extensions(raw: &str) -> Vec<String> {
    normalize_extensions(
        &raw.split(',').map(str::to_string).collect::<Vec<_>>(),
    )
}

fn normalize_extensions(extensions: &[String]) -> Vec<String> {
    let mut result: Vec<String> = Vec::new();
    for ext in extensions {
        let ext = ext.trim().trim_start_matches('.').to_ascii_lowercase();
        if !ext.is_empty() && !result.contains(&ext) {
            result.push(ext);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> (tempfile::TempDir, SettingsDb) {
        let tmp = tempfile::tempdir().unwrap();
        let db = SettingsDb::open(&tmp.path().join("settings.redb")).unwrap();
        (tmp, db)
    }

    #[test]
    fn settings_crud() {
        let (_tmp, db) = test_db();

        assert_eq!(db.get_setting("model_name").unwrap(), None);
        assert_eq!(
            db.get_setting_or("model_name", "default-model").unwrap(),
            "default-model"
        );

        db.set_setting("model_name", "custom-model").unwrap();
        assert_eq!(
            db.get_setting("model_name").unwrap(),
            Some("custom-model".to_string())
        );
    }

    #[test]
    fn defaults_when_unset() {
        let (_tmp, db) = test_db();

        assert_eq!(db.chunk_size().unwrap(), DEFAULT_CHUNK_SIZE);
        assert_eq!(db.file_extensions().unwrap(), vec!["txt", "md", "rst"]);
        assert_eq!(db.embedding_model().unwrap(), DEFAULT_EMBEDDING_MODEL);
    }

    #[test]
    fn chunk_size_roundtrip_and_validation() {
        let (_tmp, db) = test_db();

        db.set_chunk_size(256).unwrap();
        assert_eq!(db.chunk_size().unwrap(), 256);
        assert!(db.set_chunk_size(0).is_err());

        db.set_setting(CHUNK_SIZE_KEY, "lots").unwrap();
        assert!(db.chunk_size().is_err());
    }

    #[test]
    fn extensions_are_normalized() {
        let (_tmp, db) = test_db();

        db.set_file_extensions(&[
            ".TXT".to_string(),
            " md ".to_string(),
            "txt".to_string(),
        ])
        .unwrap();
        assert_eq!(db.file_extensions().unwrap(), vec!["txt", "md"]);

        assert!(db.set_file_extensions(&[" ".to_string()]).is_err());
        assert_eq!(parse_extensions("pdf, .Rst,,"), vec!["pdf", "rst"]);
    }

    #[test]
    fn reopen_preserves_data() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("settings.redb");

        {
            let db = SettingsDb::open(&path).unwrap();
            db.set_chunk_size(100).unwrap();
        }

        {
            let db = SettingsDb::open(&path).unwrap();
            assert_eq!(db.chunk_size().unwrap(), 100);
        }
    }
}
