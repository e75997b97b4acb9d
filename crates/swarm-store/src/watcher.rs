//! File-system change notification for the dispatcher
//!
//! Wraps a `notify` watcher over the inbox and journal. Events are coalesced
//! into a single wake-up signal; the dispatcher re-reads the journal itself,
//! so losing the detail of individual events is fine.

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::{debug, error};

use swarm_core::{Result, SwarmError};

/// Coalescing file-system watcher
pub struct ChangeWatcher {
    _watcher: RecommendedWatcher,
    rx: mpsc::Receiver<()>,
}

impl ChangeWatcher {
    /// Watch the given paths (directories recursively); missing paths are created
    pub fn watch(paths: &[PathBuf]) -> Result<Self> {
        // Capacity 1: a pending wake-up already covers any later events
        let (tx, rx) = mpsc::channel(1);

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    debug!("fs event: {:?} {:?}", event.kind, event.paths);
                    let _ = tx.try_send(());
                }
                Err(e) => error!("File watcher error: {}", e),
            },
            Config::default(),
        )
        .map_err(|e| SwarmError::Watcher(e.to_string()))?;

        for path in paths {
            if !path.exists() {
                std::fs::create_dir_all(path)?;
            }
            watcher
                .watch(path, RecursiveMode::Recursive)
                .map_err(|e| SwarmError::Watcher(format!("{}: {}", path.display(), e)))?;
            debug!("Watching {}", path.display());
        }

        Ok(Self {
            _watcher: watcher,
            rx,
        })
    }

    /// Wait for the next change; `false` once the watcher has shut down
    pub async fn changed(&mut self) -> bool {
        self.rx.recv().await.is_some()
    }
}
