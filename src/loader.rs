//! Configuration loading and hot reload.
//!
//! Holds the current snapshot and notifies subscribers through a watch
//! channel whenever a new one is published. Reloads can be triggered by a
//! file watcher (mtime polling) or by SIGHUP.

use crate::config::ProxyConfig;
use crate::engine::ConfigSource;
use arc_swap::ArcSwapOption;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Current configuration snapshot plus change notification.
#[derive(Debug)]
pub struct ConfigLoader {
    path: Option<PathBuf>,
    current: ArcSwapOption<ProxyConfig>,
    notify: watch::Sender<u64>,
}

impl ConfigLoader {
    /// A loader with no file and no snapshot.
    pub fn empty() -> Self {
        let (notify, _) = watch::channel(0);
        Self {
            path: None,
            current: ArcSwapOption::empty(),
            notify,
        }
    }

    /// A loader bound to `path`; nothing is read until [`reload_from_disk`].
    ///
    /// [`reload_from_disk`]: ConfigLoader::reload_from_disk
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Self::empty()
        }
    }

    /// Bind to `path` and load it immediately.
    pub fn from_file(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let loader = Self::new(path);
        loader.reload_from_disk()?;
        Ok(loader)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Publish a new snapshot and return its version.
    pub fn store(&self, config: ProxyConfig) -> u64 {
        self.current.store(Some(Arc::new(config)));
        let mut version = 0;
        self.notify.send_modify(|v| {
            *v += 1;
            version = *v;
        });
        debug!(version, "Published configuration");
        version
    }

    /// Re-read the bound file and publish it.
    ///
    /// A file that fails to parse leaves the current snapshot untouched.
    pub fn reload_from_disk(&self) -> anyhow::Result<u64> {
        let path = self
            .path
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("config loader has no file to reload"))?;

        let config = ProxyConfig::from_file(path)
            .map_err(|e| anyhow::anyhow!("Failed to load {}: {}", path.display(), e))?;
        let rules = config.rules.len();
        let version = self.store(config);
        info!(path = %path.display(), version, rules, "Configuration loaded");
        Ok(version)
    }

    /// Poll the bound file's mtime every `interval` and reload on change.
    pub fn spawn_file_watcher(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let Some(path) = self.path.clone() else {
                warn!("File watcher started without a config file, exiting");
                return;
            };

            let mut last_modified = modified_at(&path).await;
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let modified = modified_at(&path).await;
                if modified.is_none() || modified == last_modified {
                    continue;
                }
                last_modified = modified;

                info!(path = %path.display(), "Config file changed, reloading");
                if let Err(e) = self.reload_from_disk() {
                    error!(error = %e, "Config reload failed, keeping previous config");
                }
            }
        })
    }

    /// Reload from disk on every SIGHUP.
    #[cfg(unix)]
    pub fn spawn_signal_handler(self: Arc<Self>) -> JoinHandle<()> {
        use tokio::signal::unix::{signal, SignalKind};

        tokio::spawn(async move {
            let mut sighup = match signal(SignalKind::hangup()) {
                Ok(s) => s,
                Err(e) => {
                    error!(error = %e, "Failed to install SIGHUP handler");
                    return;
                }
            };

            while sighup.recv().await.is_some() {
                info!("Received SIGHUP, reloading configuration");
                if let Err(e) = self.reload_from_disk() {
                    error!(error = %e, "Config reload failed, keeping previous config");
                }
            }
        })
    }

    #[cfg(not(unix))]
    pub fn spawn_signal_handler(self: Arc<Self>) -> JoinHandle<()> {
        warn!("SIGHUP config reload not supported on this platform");
        tokio::spawn(async {})
    }
}

async fn modified_at(path: &Path) -> Option<SystemTime> {
    tokio::fs::metadata(path).await.ok()?.modified().ok()
}

impl ConfigSource for ConfigLoader {
    fn current(&self) -> Option<Arc<ProxyConfig>> {
        self.current.load_full()
    }

    fn subscribe(&self) -> watch::Receiver<u64> {
        self.notify.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const CONFIG: &str = r#"
listener: { address: "127.0.0.1:50051" }
backend: { address: "127.0.0.1:50052" }
rules:
  - name: slow
    match: { service: "svc" }
    action:
      delay: { min_ms: 10, max_ms: 20 }
"#;

    fn write_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_empty_has_no_snapshot() {
        let loader = ConfigLoader::empty();
        assert!(loader.current().is_none());
        assert!(loader.reload_from_disk().is_err());
    }

    #[test]
    fn test_from_file() {
        let file = write_config(CONFIG);
        let loader = ConfigLoader::from_file(file.path()).unwrap();
        assert_eq!(loader.path(), Some(file.path()));

        let config = loader.current().unwrap();
        assert_eq!(config.listener.address, "127.0.0.1:50051");
        assert_eq!(config.rules.len(), 1);
        assert_eq!(*loader.subscribe().borrow(), 1);
    }

    #[test]
    fn test_missing_file() {
        assert!(ConfigLoader::from_file("/nonexistent/chaos.yaml").is_err());
    }

    #[test]
    fn test_bad_file_keeps_snapshot() {
        let file = write_config(CONFIG);
        let loader = ConfigLoader::from_file(file.path()).unwrap();

        std::fs::write(file.path(), "rules: [ not yaml").unwrap();

        assert!(loader.reload_from_disk().is_err());
        assert_eq!(loader.current().unwrap().rules[0].name, "slow");
    }

    #[tokio::test]
    async fn test_store_notifies_subscribers() {
        let loader = ConfigLoader::empty();
        let mut rx = loader.subscribe();

        let version = loader.store(ProxyConfig::default());
        assert_eq!(version, 1);

        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), 1);
        assert!(loader.current().is_some());
    }

    #[tokio::test]
    async fn test_file_watcher_reloads_on_change() {
        let file = write_config(CONFIG);
        let loader = Arc::new(ConfigLoader::from_file(file.path()).unwrap());
        let mut rx = loader.subscribe();
        let watcher = loader.clone().spawn_file_watcher(Duration::from_millis(20));

        // Let the watcher record the initial mtime, then make sure the
        // rewrite lands on a later timestamp.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let later = SystemTime::now() + Duration::from_secs(5);
        std::fs::write(file.path(), CONFIG.replace("slow", "renamed")).unwrap();
        std::fs::File::options()
            .write(true)
            .open(file.path())
            .unwrap()
            .set_modified(later)
            .unwrap();

        tokio::time::timeout(Duration::from_secs(2), rx.changed())
            .await
            .expect("watcher did not reload")
            .unwrap();
        assert_eq!(loader.current().unwrap().rules[0].name, "renamed");
        watcher.abort();
    }
}
