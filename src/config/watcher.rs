use crate::error::{DevServeError, Result};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Directory names never worth rebuilding for.
const IGNORED_DIR_NAMES: [&str; 3] = ["node_modules", ".git", crate::bundler::STATE_DIR];

/// Outcome of one watch-triggered build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildEvent {
    BundleStart,
    BundleEnd,
    Error(String),
}

/// Recursive file watcher over the application sources.
///
/// Raw notifications are coalesced: a change is reported once no further
/// events arrive within the debounce window.
pub struct SourceWatcher {
    roots: Vec<PathBuf>,
    ignored: Vec<PathBuf>,
    debounce: Duration,
    watcher: Option<RecommendedWatcher>,
    event_receiver: Option<mpsc::Receiver<std::result::Result<Event, notify::Error>>>,
}

impl SourceWatcher {
    pub fn new(roots: Vec<PathBuf>, ignored: Vec<PathBuf>, debounce: Duration) -> Self {
        Self {
            roots,
            ignored,
            debounce,
            watcher: None,
            event_receiver: None,
        }
    }

    /// Start the file watcher
    pub fn start(&mut self) -> Result<()> {
        let (tx, rx) = mpsc::channel::<std::result::Result<Event, notify::Error>>(256);

        let mut watcher = RecommendedWatcher::new(
            move |res| {
                if let Err(e) = tx.blocking_send(res) {
                    debug!("Dropping file system event: {}", e);
                }
            },
            Config::default(),
        )
        .map_err(|e| DevServeError::WatchError(format!("Failed to create file watcher: {e}")))?;

        for root in &self.roots {
            watcher.watch(root, RecursiveMode::Recursive).map_err(|e| {
                DevServeError::WatchError(format!("Failed to watch {}: {e}", root.display()))
            })?;
            debug!("Watching {}", root.display());
        }

        self.watcher = Some(watcher);
        self.event_receiver = Some(rx);

        info!("Watching {} source roots for changes", self.roots.len());
        Ok(())
    }

    /// Stop the file watcher
    pub fn stop(&mut self) {
        if self.watcher.take().is_some() {
            info!("File watcher stopped");
        }
        self.event_receiver = None;
    }

    pub fn is_running(&self) -> bool {
        self.watcher.is_some()
    }

    /// Whether a changed path should trigger a rebuild.
    pub fn is_relevant(&self, path: &Path) -> bool {
        if self.ignored.iter().any(|dir| path.starts_with(dir)) {
            return false;
        }
        !path.components().any(|c| match c {
            Component::Normal(name) => name
                .to_str()
                .is_some_and(|n| IGNORED_DIR_NAMES.contains(&n)),
            _ => false,
        })
    }

    fn relevant_paths(&self, event: Event) -> Vec<PathBuf> {
        match event.kind {
            EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_) => event
                .paths
                .into_iter()
                .filter(|p| self.is_relevant(p))
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Wait for the next settled batch of changed paths. Returns `None` once
    /// the watcher is stopped.
    pub async fn next_change(&mut self) -> Option<Vec<PathBuf>> {
        let mut changed = BTreeSet::new();

        loop {
            let receiver = self.event_receiver.as_mut()?;
            let next = if changed.is_empty() {
                receiver.recv().await
            } else {
                match tokio::time::timeout(self.debounce, receiver.recv()).await {
                    Ok(event) => event,
                    Err(_) => return Some(changed.into_iter().collect()),
                }
            };

            match next {
                Some(Ok(event)) => changed.extend(self.relevant_paths(event)),
                Some(Err(e)) => error!("File watcher error: {}", e),
                None => {
                    warn!("File watcher channel closed");
                    self.event_receiver = None;
                    return (!changed.is_empty()).then(|| changed.into_iter().collect());
                }
            }
        }
    }

    /// Feed a raw event, as the notify backend would.
    #[cfg(test)]
    fn sender(&mut self) -> mpsc::Sender<std::result::Result<Event, notify::Error>> {
        let (tx, rx) = mpsc::channel(16);
        self.event_receiver = Some(rx);
        tx
    }
}

impl Drop for SourceWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}
