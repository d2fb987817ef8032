use std::path::{Path, PathBuf};

use crate::{
    error::{Error, Result},
    schema::SchemaVersion,
};

#[derive(Debug, Clone)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    /// Resolve the data directory from, in order of priority:
    /// 1. An explicit path (from --data-dir)
    /// 2. The LOCALDOCS_DATA_DIR environment variable
    /// 3. The XDG data directory (~/.local/share/localdocs/)
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        let root = if let Some(path) = explicit {
            path.to_path_buf()
        } else if let Ok(val) = std::env::var("LOCALDOCS_DATA_DIR") {
            PathBuf::from(val)
        } else {
            xdg::BaseDirectories::with_prefix("localdocs")
                .get_data_home()
                .ok_or_else(|| {
                    Error::Config(
                        "could not determine XDG data home directory".into(),
                    )
                })?
        };

        std::fs::create_dir_all(&root)
            .map_err(|_| Error::DataDir(root.clone()))?;

        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Catalog file for one schema version: `localdocs_v<N>.redb`.
    pub fn catalog_db(&self, version: SchemaVersion) -> PathBuf {
        self.root
            .join(format!("localdocs_v{}.redb", version.number()))
    }

    /// Vector store file, versioned alongside the catalog.
    pub fn embeddings_db(&self, version: SchemaVersion) -> PathBuf {
        self.root
            .join(format!("embeddings_v{}.redb", version.number()))
    }

    pub fn settings_db(&self) -> PathBuf {
        self.root.join("settings.redb")
    }
}
