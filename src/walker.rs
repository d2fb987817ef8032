use std::{
    fs::Metadata,
    path::{Path, PathBuf},
    time::SystemTime,
};

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};

use crate::error::{Error, Result};

/// A discovered document file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredFile {
    /// Canonical absolute path.
    pub path: PathBuf,
    /// Size in bytes.
    pub size: u64,
    /// Last modification time in milliseconds since the Unix epoch.
    pub mtime: i64,
}

/// Everything a folder walk turned up.
#[derive(Debug, Clone, Default)]
pub struct FolderScan {
    pub files: Vec<DiscoveredFile>,
    /// Every subdirectory below the root, for watching.
    pub directories: Vec<PathBuf>,
}

/// Case-insensitive match on a set of file extensions.
#[derive(Debug, Clone)]
pub struct ExtensionFilter {
    set: GlobSet,
    extensions: Vec<String>,
}

impl ExtensionFilter {
    pub fn new(extensions: &[String]) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        for ext in extensions.iter().filter(|e| !e.trim().is_empty()) {
            let glob = GlobBuilder::new(&format!("*.{}", ext.trim()))
                .case_insensitive(true)
                .build()
                .map_err(|e| {
                    Error::Config(format!("invalid extension `{ext}`: {e}"))
                })?;
            builder.add(glob);
        }
        let set = builder.build().map_err(|e| {
            Error::Config(format!("invalid extension set: {e}"))
        })?;
        Ok(Self {
            set,
            extensions: extensions.to_vec(),
        })
    }

    pub fn extensions(&self) -> &[String] {
        &self.extensions
    }

    pub fn matches(&self, path: &Path) -> bool {
        path.file_name().is_some_and(|name| self.set.is_match(name))
    }
}

/// Modification time of a file in milliseconds since the Unix epoch.
pub fn modified_millis(metadata: &Metadata) -> i64 {
    metadata
        .modified()
        .unwrap_or(SystemTime::UNIX_EPOCH)
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Recursively walk a folder and collect eligible documents plus every
/// subdirectory.
///
/// Hidden files and directories (names starting with `.`) are skipped.
pub fn discover_files(
    root: &Path,
    filter: &ExtensionFilter,
) -> Result<FolderScan> {
    let canonical_root = root.canonicalize()?;
    let mut scan = FolderScan::default();
    walk_dir(&canonical_root, &canonical_root, Some(filter), &mut scan)?;
    scan.files.sort_by(|a, b| a.path.cmp(&b.path));
    scan.directories.sort();
    Ok(scan)
}

/// All non-hidden subdirectories below `root`, without reading files.
pub fn subdirectories(root: &Path) -> Vec<PathBuf> {
    let Ok(canonical_root) = root.canonicalize() else {
        return Vec::new();
    };
    let mut scan = FolderScan::default();
    // Unreadable subtrees are simply not listed.
    let _ = walk_dir(&canonical_root, &canonical_root, None, &mut scan);
    scan.directories.sort();
    scan.directories
}

fn walk_dir(
    root: &Path,
    current: &Path,
    filter: Option<&ExtensionFilter>,
    scan: &mut FolderScan,
) -> Result<()> {
    let entries = std::fs::read_dir(current)?;

    for entry in entries {
        let entry = entry?;
        let file_name = entry.file_name();
        let name = file_name.to_string_lossy();

        if name.starts_with('.') {
            continue;
        }

        let file_type = entry.file_type()?;

        if file_type.is_dir() {
            scan.directories.push(entry.path());
            if let Err(e) = walk_dir(root, &entry.path(), filter, scan) {
                tracing::debug!(
                    path = %entry.path().display(),
                    error = %e,
                    "Skipping unreadable directory"
                );
            }
        } else if file_type.is_symlink() {
            let Ok(resolved) = entry.path().canonicalize() else {
                continue; // broken symlink
            };
            // Cycle prevention: never follow a link back into the tree.
            if resolved.is_dir() {
                continue;
            }
            if let Some(filter) = filter
                && resolved.is_file()
                && filter.matches(&entry.path())
            {
                push_file(&resolved, scan)?;
            }
        } else if let Some(filter) = filter
            && file_type.is_file()
            && filter.matches(&entry.path())
        {
            push_file(&entry.path().canonicalize()?, scan)?;
        }
    }

    Ok(())
}

fn push_file(path: &Path, scan: &mut FolderScan) -> Result<()> {
    let metadata = std::fs::metadata(path)?;
    scan.files.push(DiscoveredFile {
        path: path.to_path_buf(),
        size: metadata.len(),
        mtime: modified_millis(&metadata),
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(exts: &[&str]) -> ExtensionFilter {
        ExtensionFilter::new(
            &exts.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
        )
        .unwrap()
    }

    fn names(scan: &FolderScan, root: &Path) -> Vec<String> {
        let root = root.canonicalize().unwrap();
        scan.files
            .iter()
            .map(|f| {
                f.path
                    .strip_prefix(&root)
                    .unwrap()
                    .to_string_lossy()
                    .to_string()
            })
            .collect()
    }

    #[test]
    fn filters_by_extension_case_insensitively() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("note.md"), "# Hello").unwrap();
        std::fs::write(tmp.path().join("README.TXT"), "Hello").unwrap();
        std::fs::write(tmp.path().join("image.png"), "binary").unwrap();

        let scan = discover_files(tmp.path(), &filter(&["txt", "md"])).unwrap();
        assert_eq!(names(&scan, tmp.path()), vec!["README.TXT", "note.md"]);
    }

    #[test]
    fn skips_hidden_files_and_directories() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join(".hidden.md"), "secret").unwrap();
        let hidden = tmp.path().join(".git");
        std::fs::create_dir(&hidden).unwrap();
        std::fs::write(hidden.join("config.md"), "git config").unwrap();
        std::fs::write(tmp.path().join("visible.md"), "hello").unwrap();

        let scan = discover_files(tmp.path(), &filter(&["md"])).unwrap();
        assert_eq!(names(&scan, tmp.path()), vec!["visible.md"]);
        assert!(scan.directories.is_empty());
    }

    #[test]
    fn recurses_and_lists_subdirectories() {
        let tmp = tempfile::tempdir().unwrap();
        let sub = tmp.path().join("subdir");
        let deeper = sub.join("deeper");
        std::fs::create_dir_all(&deeper).unwrap();
        std::fs::write(deeper.join("deep.md"), "deep").unwrap();
        std::fs::write(tmp.path().join("top.md"), "top").unwrap();

        let scan = discover_files(tmp.path(), &filter(&["md"])).unwrap();
        assert_eq!(
            names(&scan, tmp.path()),
            vec!["subdir/deeper/deep.md", "top.md"]
        );
        assert_eq!(scan.directories.len(), 2);
        assert_eq!(subdirectories(tmp.path()), scan.directories);
    }

    #[test]
    fn records_size_and_mtime() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("file.md"), "content").unwrap();

        let scan = discover_files(tmp.path(), &filter(&["md"])).unwrap();
        assert_eq!(scan.files.len(), 1);
        assert_eq!(scan.files[0].size, 7);
        assert!(scan.files[0].mtime > 0);
    }

    #[test]
    fn extension_filter_matches_file_names() {
        let f = filter(&["rst"]);
        assert!(f.matches(Path::new("/a/b/index.rst")));
        assert!(f.matches(Path::new("/a/b/INDEX.RST")));
        assert!(!f.matches(Path::new("/a/b.rst/index.txt")));
        assert_eq!(f.extensions(), ["rst"]);
    }

    #[test]
    fn missing_root_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(
            discover_files(&tmp.path().join("nope"), &filter(&["md"])).is_err()
        );
        assert!(subdirectories(&tmp.path().join("nope")).is_empty());
    }
}
