//! Early wake-ups for the component loader.
//!
//! The loader scans on a fixed interval regardless; [`PackageWatcher`]
//! only shortens the wait. It watches the components directory itself
//! (not recursively, since extracted bundle directories churn during
//! extraction) and fires its callback when a package file directly inside
//! it is created, modified, renamed or removed.

use std::io;
use std::path::{Path, PathBuf};

use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};

use crate::error::{Error, Result};
use crate::loader::archive::package_name;

/// Classification of a file system event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileEventKind {
    /// A file or directory was created.
    Create,
    /// Content or metadata changed.
    Modify,
    /// Renamed or moved.
    Rename,
    /// Deleted.
    Delete,
    /// Access and watcher-internal events.
    Other,
}

impl FileEventKind {
    fn classify(kind: &notify::EventKind) -> Self {
        match kind {
            notify::EventKind::Create(_) => Self::Create,
            notify::EventKind::Modify(notify::event::ModifyKind::Name(_)) => Self::Rename,
            notify::EventKind::Modify(_) => Self::Modify,
            notify::EventKind::Remove(_) => Self::Delete,
            _ => Self::Other,
        }
    }
}

/// Watches one components directory for package changes.
pub struct PackageWatcher {
    root: PathBuf,
    _watcher: RecommendedWatcher,
}

impl std::fmt::Debug for PackageWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackageWatcher")
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

impl PackageWatcher {
    /// Start watching `root`, calling `on_change` for every relevant event.
    ///
    /// `on_change` runs on the watcher's own thread and should only signal.
    ///
    /// # Errors
    ///
    /// Fails if the OS watcher cannot be created or `root` cannot be
    /// watched (for example, it does not exist).
    pub fn new<F>(root: &Path, on_change: F) -> Result<Self>
    where
        F: Fn() + Send + 'static,
    {
        // Events carry canonical paths on some platforms.
        let watched = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                if is_package_event(&watched, &event) {
                    on_change();
                }
            }
            Err(e) => log::warn!("[Loader] File watcher error: {e}"),
        })
        .map_err(watch_error)?;

        watcher
            .watch(root, RecursiveMode::NonRecursive)
            .map_err(watch_error)?;

        log::info!("[Loader] Watching {} for packages", root.display());
        Ok(Self {
            root: root.to_path_buf(),
            _watcher: watcher,
        })
    }

    /// Directory being watched.
    pub fn root(&self) -> &Path {
        &self.root
    }
}

fn watch_error(e: notify::Error) -> Error {
    Error::Io(io::Error::other(e))
}

/// Whether `event` touches a package file directly inside `root`.
fn is_package_event(root: &Path, event: &Event) -> bool {
    if FileEventKind::classify(&event.kind) == FileEventKind::Other {
        return false;
    }
    event
        .paths
        .iter()
        .any(|path| path.parent() == Some(root) && package_name(path).is_some())
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{AccessKind, CreateKind, DataChange, ModifyKind, RemoveKind, RenameMode};
    use notify::EventKind;
    use std::sync::mpsc;
    use std::time::Duration;

    fn event(kind: EventKind, path: &Path) -> Event {
        Event::new(kind).add_path(path.to_path_buf())
    }

    #[test]
    fn test_classify() {
        assert_eq!(
            FileEventKind::classify(&EventKind::Create(CreateKind::File)),
            FileEventKind::Create
        );
        assert_eq!(
            FileEventKind::classify(&EventKind::Modify(ModifyKind::Data(DataChange::Content))),
            FileEventKind::Modify
        );
        assert_eq!(
            FileEventKind::classify(&EventKind::Modify(ModifyKind::Name(RenameMode::Both))),
            FileEventKind::Rename
        );
        assert_eq!(
            FileEventKind::classify(&EventKind::Remove(RemoveKind::File)),
            FileEventKind::Delete
        );
        assert_eq!(
            FileEventKind::classify(&EventKind::Access(AccessKind::Read)),
            FileEventKind::Other
        );
    }

    #[test]
    fn test_only_packages_in_root_count() {
        let root = Path::new("/srv/whack/components");
        let create = EventKind::Create(CreateKind::File);

        assert!(is_package_event(root, &event(create, &root.join("echo.jar"))));
        assert!(is_package_event(
            root,
            &event(EventKind::Remove(RemoveKind::File), &root.join("echo.zip"))
        ));
        assert!(!is_package_event(root, &event(create, &root.join("echo/component.xml"))));
        assert!(!is_package_event(root, &event(create, &root.join("readme.txt"))));
        assert!(!is_package_event(
            root,
            &event(EventKind::Access(AccessKind::Read), &root.join("echo.jar"))
        ));
    }

    #[test]
    fn test_watch_missing_directory_fails() {
        let result = PackageWatcher::new(Path::new("/nonexistent/whack/components"), || {});
        assert!(result.is_err());
    }

    #[test]
    fn test_new_package_fires_callback() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = mpsc::channel();
        let watcher = PackageWatcher::new(dir.path(), move || {
            let _ = tx.send(());
        })
        .unwrap();
        assert_eq!(watcher.root(), dir.path());

        std::fs::write(dir.path().join("echo.jar"), b"x").unwrap();
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
    }
}
