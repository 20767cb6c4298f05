//! Configuration file watcher for hot reload of rate limit rules.

use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::config::loader::load_config;
use crate::config::schema::SecurityConfig;

/// Watches the configuration file and forwards every validated reload.
///
/// Invalid files are logged and dropped; subscribers only ever see configs
/// that passed validation.
pub struct ConfigWatcher {
    path: PathBuf,
    update_tx: mpsc::UnboundedSender<SecurityConfig>,
}

impl ConfigWatcher {
    /// Returns the watcher and a receiver for configuration updates.
    pub fn new(path: &Path) -> (Self, mpsc::UnboundedReceiver<SecurityConfig>) {
        let (update_tx, update_rx) = mpsc::unbounded_channel();
        (
            Self {
                path: path.to_path_buf(),
                update_tx,
            },
            update_rx,
        )
    }

    /// Start watching. The returned watcher must be kept alive.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        let tx = self.update_tx.clone();
        let path = self.path.clone();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) if event.kind.is_modify() || event.kind.is_create() => {
                    reload(&path, &tx);
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "Config watch error"),
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;

        watcher.watch(&self.path, RecursiveMode::NonRecursive)?;
        tracing::info!(path = %self.path.display(), "Config watcher started");
        Ok(watcher)
    }
}

fn reload(path: &Path, tx: &mpsc::UnboundedSender<SecurityConfig>) {
    match load_config(path) {
        Ok(config) => {
            tracing::info!(
                path = %path.display(),
                rules = config.rate_limit.rules.len(),
                "Config file changed, forwarding reload"
            );
            if tx.send(config).is_err() {
                tracing::debug!("Config receiver dropped, ignoring reload");
            }
        }
        Err(e) => {
            tracing::error!(path = %path.display(), error = %e, "Failed to reload config, keeping current rules");
        }
    }
}
