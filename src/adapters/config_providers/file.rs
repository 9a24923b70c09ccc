use std::{
    path::{Path, PathBuf},
    sync::Mutex,
};

use async_trait::async_trait;
use eyre::{Context, Result};
use notify::{RecursiveMode, Watcher};
use tokio::sync::mpsc;

use super::take_receiver;
use crate::{
    config::{loader::load_config_sync, models::ServerConfig},
    ports::config_provider::ConfigProvider,
};

/// Loads channels from a local file and signals when the file changes.
pub struct FileConfigProvider {
    path: PathBuf,
    // Dropping the watcher stops the notifications
    _watcher: notify::RecommendedWatcher,
    update_rx: Mutex<Option<mpsc::Receiver<()>>>,
}

impl FileConfigProvider {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let (tx, rx) = mpsc::channel(1);
        let watcher = Self::watch_file(&path, tx)?;

        Ok(Self {
            path,
            _watcher: watcher,
            update_rx: Mutex::new(Some(rx)),
        })
    }

    // Editors often replace the file rather than write it in place, so the parent directory
    // is watched and events are filtered by file name.
    fn watch_file(path: &Path, tx: mpsc::Sender<()>) -> Result<notify::RecommendedWatcher> {
        let config_filename = path
            .file_name()
            .ok_or_else(|| eyre::eyre!("Invalid config path: {}", path.display()))?
            .to_owned();

        let mut watcher =
            notify::recommended_watcher(move |res: Result<notify::Event, notify::Error>| {
                match res {
                    Ok(event) => {
                        if (event.kind.is_modify()
                            || event.kind.is_create()
                            || event.kind.is_remove())
                            && event
                                .paths
                                .iter()
                                .any(|p| p.file_name() == Some(&config_filename))
                        {
                            tracing::debug!(kind = ?event.kind, "Config file changed");
                            // A pending signal already covers this change
                            let _ = tx.try_send(());
                        }
                    }
                    Err(e) => tracing::error!(error = ?e, "File watch error"),
                }
            })?;

        let watch_dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        watcher
            .watch(watch_dir, RecursiveMode::NonRecursive)
            .wrap_err("Failed to watch config directory")?;

        Ok(watcher)
    }
}

#[async_trait]
impl ConfigProvider for FileConfigProvider {
    async fn load_config(&self) -> Result<ServerConfig> {
        let path_str = self
            .path
            .to_str()
            .ok_or_else(|| eyre::eyre!("Invalid path: {}", self.path.display()))?;
        load_config_sync(path_str)
    }

    fn watch(&self) -> mpsc::Receiver<()> {
        take_receiver(&self.update_rx)
    }

    fn describe(&self) -> String {
        format!("file {}", self.path.display())
    }
}

#[cfg(test)]
mod tests {
    use std::{fs::File, io::Write};

    use tempfile::tempdir;
    use tokio::time::{Duration, sleep};

    use super::*;

    fn document(listen_addr: &str) -> String {
        format!(
            r#"
            listen_addr = "{listen_addr}"

            [[channels]]
            name = "lab"
            url_pattern = "^/lab"

            [[channels.routes]]
            name = "lis"
            host = "lis.local"
            port = 8080
            primary = true
        "#
        )
    }

    #[tokio::test]
    async fn test_file_config_provider() -> Result<()> {
        let dir = tempdir()?;
        let file_path = dir.path().join("interlink.toml");

        {
            let mut file = File::create(&file_path)?;
            file.write_all(document("127.0.0.1:5001").as_bytes())?;
        }

        let provider = FileConfigProvider::new(&file_path)?;
        let config = provider.load_config().await?;
        assert_eq!(config.listen_addr, "127.0.0.1:5001");
        assert_eq!(config.channels[0].routes[0].name, "lis");
        assert!(provider.describe().contains("interlink.toml"));

        let mut rx = provider.watch();

        // Let the watcher settle before the write
        sleep(Duration::from_millis(100)).await;

        {
            let mut file = File::create(&file_path)?;
            file.write_all(document("127.0.0.1:5002").as_bytes())?;
        }

        let notification = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await;
        assert!(notification.is_ok(), "Timed out waiting for config update");
        assert!(notification.unwrap().is_some(), "Channel closed unexpectedly");

        let config = provider.load_config().await?;
        assert_eq!(config.listen_addr, "127.0.0.1:5002");

        Ok(())
    }

    #[tokio::test]
    async fn test_second_watch_is_closed() -> Result<()> {
        let dir = tempdir()?;
        let file_path = dir.path().join("interlink.yaml");
        std::fs::write(&file_path, "listen_addr: 127.0.0.1:5001\n")?;

        let provider = FileConfigProvider::new(&file_path)?;
        let _first = provider.watch();
        let mut second = provider.watch();
        assert!(second.recv().await.is_none());
        Ok(())
    }
}
