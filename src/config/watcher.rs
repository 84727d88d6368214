//! Configuration file watcher for hot reload.

use std::path::{Path, PathBuf};
use std::time::Duration;
use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use crate::config::loader::load_config;
use crate::config::schema::BalancerConfig;

/// Watches the configuration file and emits every version that loads and
/// validates cleanly. Invalid edits are logged and skipped; the running
/// configuration stays in place.
pub struct ConfigWatcher {
    path: PathBuf,
    update_tx: mpsc::UnboundedSender<BalancerConfig>,
}

impl ConfigWatcher {
    /// Returns the watcher and a receiver for configuration updates.
    pub fn new(path: &Path) -> (Self, mpsc::UnboundedReceiver<BalancerConfig>) {
        let (update_tx, update_rx) = mpsc::unbounded_channel();
        (Self { path: path.to_path_buf(), update_tx }, update_rx)
    }

    /// Start watching. Keep the returned handle alive for as long as reloads
    /// should be delivered.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        let tx = self.update_tx;
        let path = self.path.clone();
        let file_name = self.path.file_name().map(|n| n.to_os_string());

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| {
                let event = match res {
                    Ok(event) => event,
                    Err(e) => {
                        tracing::error!(error = %e, "Config watch error");
                        return;
                    }
                };
                if !(event.kind.is_modify() || event.kind.is_create()) {
                    return;
                }
                // Editors often write a sibling temp file first; only react to ours.
                let ours = event
                    .paths
                    .iter()
                    .any(|p| p.file_name().map(|n| n.to_os_string()) == file_name);
                if !ours {
                    return;
                }

                match load_config(&path) {
                    Ok(config) => {
                        tracing::info!(path = %path.display(), "Configuration change detected");
                        if tx.send(config).is_err() {
                            tracing::debug!("Config update receiver dropped");
                        }
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to reload config, keeping current configuration");
                    }
                }
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;

        // Watch the directory so atomic-rename saves are still seen.
        let target = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        watcher.watch(target, RecursiveMode::NonRecursive)?;

        tracing::info!(path = %self.path.display(), "Config watcher started");
        Ok(watcher)
    }
}
