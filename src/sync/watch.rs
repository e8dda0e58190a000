use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use notify::event::ModifyKind;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::util;

/// Watches the config file for changes. Both the file and its parent
/// directory are watched: orchestrators frequently rotate mounted configs by
/// swapping out the parent directory. When watching is disabled, the event
/// stream simply never fires.
pub struct ConfigWatcher {
    watcher: Option<RecommendedWatcher>,
    rx: mpsc::UnboundedReceiver<Event>,
    path: PathBuf,
    parent: PathBuf,
    sha1: Vec<u8>,
}

impl ConfigWatcher {
    pub fn new(path: &Path, enabled: bool, sha1: Vec<u8>) -> Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();

        if !enabled {
            return Ok(Self {
                watcher: None,
                rx,
                path: path.to_path_buf(),
                parent: PathBuf::new(),
                sha1,
            });
        }

        // resolve symlinks and absolutise, so rotated mounts are detected on
        // their real paths
        let path = std::fs::canonicalize(path)
            .with_context(|| format!("cannot resolve config path '{}'", path.display()))?;
        let parent = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("/"));

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            match res {
                Ok(event) => {
                    let _ = tx.send(event);
                }
                Err(e) => warn!("config watch error: {}", e),
            }
        })
        .context("cannot create config watcher")?;

        watcher
            .watch(&path, RecursiveMode::NonRecursive)
            .with_context(|| format!("cannot watch config file '{}'", path.display()))?;
        watcher
            .watch(&parent, RecursiveMode::NonRecursive)
            .with_context(|| format!("cannot watch config directory '{}'", parent.display()))?;

        debug!(file = %path.display(), dir = %parent.display(), "watching for config changes");

        Ok(Self {
            watcher: Some(watcher),
            rx,
            path,
            parent,
            sha1,
        })
    }

    /// The next filesystem event; pends forever when watching is disabled.
    pub async fn next(&mut self) -> Event {
        if self.watcher.is_none() {
            return futures::future::pending().await;
        }
        match self.rx.recv().await {
            Some(event) => event,
            // the watcher owns the sender, so this only happens on
            // teardown; just stop firing
            None => futures::future::pending().await,
        }
    }

    /// Whether an event amounts to a config change. Removal of the file or
    /// its parent always does; a metadata-only change counts only when the
    /// file content actually differs from what was loaded; anything else
    /// touching the file or a sibling is treated as a change.
    pub fn is_changed(&self, event: &Event) -> bool {
        let on_file = event.paths.iter().any(|p| *p == self.path);
        let on_parent = event.paths.iter().any(|p| *p == self.parent);
        let in_parent = event
            .paths
            .iter()
            .any(|p| p.parent() == Some(self.parent.as_path()));

        match event.kind {
            EventKind::Remove(_) => on_file || on_parent,
            EventKind::Modify(ModifyKind::Metadata(_)) if on_file => {
                match util::compute_sha1(&self.path) {
                    Ok(digest) => digest != self.sha1,
                    Err(_) => true,
                }
            }
            _ => on_file || in_parent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, DataChange, MetadataKind, RemoveKind};
    use std::io::Write;
    use tempfile::TempDir;

    fn watcher_for(dir: &TempDir, content: &str) -> (ConfigWatcher, PathBuf) {
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, content).unwrap();
        let sha1 = util::compute_sha1(&path).unwrap();
        let w = ConfigWatcher::new(&path, true, sha1).unwrap();
        let canon = std::fs::canonicalize(&path).unwrap();
        (w, canon)
    }

    #[test]
    fn test_remove_is_a_change() {
        let dir = TempDir::new().unwrap();
        let (w, path) = watcher_for(&dir, "relay: skopeo\n");

        let evt = Event::new(EventKind::Remove(RemoveKind::File)).add_path(path);
        assert!(w.is_changed(&evt));

        let evt = Event::new(EventKind::Remove(RemoveKind::Folder)).add_path(w.parent.clone());
        assert!(w.is_changed(&evt));
    }

    #[test]
    fn test_chmod_without_content_change_is_ignored() {
        let dir = TempDir::new().unwrap();
        let (w, path) = watcher_for(&dir, "relay: skopeo\n");

        let evt =
            Event::new(EventKind::Modify(ModifyKind::Metadata(MetadataKind::Permissions)))
                .add_path(path);
        assert!(!w.is_changed(&evt));
    }

    #[test]
    fn test_chmod_with_content_change_is_detected() {
        let dir = TempDir::new().unwrap();
        let (w, path) = watcher_for(&dir, "relay: skopeo\n");

        let mut f = std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .unwrap();
        writeln!(f, "watch: true").unwrap();

        let evt =
            Event::new(EventKind::Modify(ModifyKind::Metadata(MetadataKind::Permissions)))
                .add_path(path);
        assert!(w.is_changed(&evt));
    }

    #[test]
    fn test_write_is_a_change() {
        let dir = TempDir::new().unwrap();
        let (w, path) = watcher_for(&dir, "relay: skopeo\n");

        let evt = Event::new(EventKind::Modify(ModifyKind::Data(DataChange::Content)))
            .add_path(path);
        assert!(w.is_changed(&evt));
    }

    #[test]
    fn test_sibling_event_is_a_change() {
        let dir = TempDir::new().unwrap();
        let (w, _) = watcher_for(&dir, "relay: skopeo\n");

        let sibling = w.parent.join("..data");
        let evt = Event::new(EventKind::Create(CreateKind::File)).add_path(sibling);
        assert!(w.is_changed(&evt));
    }

    #[test]
    fn test_unrelated_event_is_not_a_change() {
        let dir = TempDir::new().unwrap();
        let (w, _) = watcher_for(&dir, "relay: skopeo\n");

        let evt = Event::new(EventKind::Create(CreateKind::File))
            .add_path(PathBuf::from("/somewhere/else/file"));
        assert!(!w.is_changed(&evt));
    }

    #[tokio::test]
    async fn test_disabled_watcher_never_fires() {
        let mut w =
            ConfigWatcher::new(Path::new("/no/such/file"), false, Vec::new()).unwrap();
        let fired = tokio::time::timeout(std::time::Duration::from_millis(50), w.next()).await;
        assert!(fired.is_err());
    }
}
