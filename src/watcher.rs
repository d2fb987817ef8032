use std::{
    collections::HashSet,
    path::{Path, PathBuf},
};

use notify::{Event, EventKind, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::Result;

/// Directory-level change notification.
///
/// Every directory of an indexed folder is watched on its own, without
/// recursion, so that a change can be traced back to the directory it
/// happened in.
pub trait FolderWatch: Send {
    fn watch(&mut self, path: &Path);

    fn unwatch(&mut self, paths: &[PathBuf]);
}

/// Watch that ignores every request, for one-shot indexing runs.
#[derive(Debug, Default)]
pub struct NoWatch;

impl FolderWatch for NoWatch {
    fn watch(&mut self, _path: &Path) {}

    fn unwatch(&mut self, _paths: &[PathBuf]) {}
}

/// [`FolderWatch`] over the platform's recommended notify backend.
///
/// Changed directories are sent on `changes`; the receiver is expected to
/// live on the catalog thread.
pub struct NotifyWatch {
    watcher: notify::RecommendedWatcher,
    watched: HashSet<PathBuf>,
}

impl NotifyWatch {
    pub fn new(changes: mpsc::UnboundedSender<PathBuf>) -> Result<Self> {
        let watcher =
            notify::recommended_watcher(move |res: notify::Result<Event>| {
                match res {
                    Ok(event) => {
                        for dir in changed_directories(&event) {
                            let _ = changes.send(dir);
                        }
                    }
                    Err(e) => warn!(error = %e, "Filesystem watch error"),
                }
            })?;

        Ok(Self {
            watcher,
            watched: HashSet::new(),
        })
    }

    pub fn watched(&self) -> &HashSet<PathBuf> {
        &self.watched
    }
}

impl FolderWatch for NotifyWatch {
    fn watch(&mut self, path: &Path) {
        if self.watched.contains(path) {
            return;
        }
        debug!(path = %path.display(), "Watching directory");
        if let Err(e) = self.watcher.watch(path, RecursiveMode::NonRecursive) {
            warn!(path = %path.display(), error = %e, "Failed to watch");
        }
        // Recorded even on failure so the warning is not repeated.
        self.watched.insert(path.to_path_buf());
    }

    fn unwatch(&mut self, paths: &[PathBuf]) {
        for path in paths {
            if self.watched.remove(path) {
                debug!(path = %path.display(), "Unwatching directory");
                let _ = self.watcher.unwatch(path);
            }
        }
    }
}

/// Directories affected by a notify event. Access-only events are ignored.
fn changed_directories(event: &Event) -> Vec<PathBuf> {
    match event.kind {
        EventKind::Create(_)
        | EventKind::Modify(_)
        | EventKind::Remove(_)
        | EventKind::Any => {}
        _ => return Vec::new(),
    }

    let mut dirs: Vec<PathBuf> = Vec::new();
    for path in &event.paths {
        let dir = path.parent().unwrap_or(path).to_path_buf();
        if !dirs.contains(&dir) {
            dirs.push(dir);
        }
    }
    dirs
}

#[cfg(test)]
mod tests {
    use notify::event::{AccessKind, CreateKind, ModifyKind};

    use super::*;

    #[test]
    fn maps_file_events_to_parent_directories() {
        let event = Event::new(EventKind::Create(CreateKind::File))
            .add_path(PathBuf::from("/docs/a.txt"))
            .add_path(PathBuf::from("/docs/b.txt"))
            .add_path(PathBuf::from("/docs/sub/c.txt"));

        assert_eq!(
            changed_directories(&event),
            vec![PathBuf::from("/docs"), PathBuf::from("/docs/sub")]
        );
    }

    #[test]
    fn ignores_access_events() {
        let event = Event::new(EventKind::Access(AccessKind::Any))
            .add_path(PathBuf::from("/docs/a.txt"));
        assert!(changed_directories(&event).is_empty());

        let modify = Event::new(EventKind::Modify(ModifyKind::Any))
            .add_path(PathBuf::from("/docs/a.txt"));
        assert_eq!(changed_directories(&modify), vec![PathBuf::from("/docs")]);
    }

    #[test]
    fn watch_set_tracks_paths() {
        let tmp = tempfile::tempdir().unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut watch = NotifyWatch::new(tx).unwrap();

        watch.watch(tmp.path());
        watch.watch(tmp.path());
        assert_eq!(watch.watched().len(), 1);

        watch.unwatch(&[tmp.path().to_path_buf()]);
        assert!(watch.watched().is_empty());
    }
}
