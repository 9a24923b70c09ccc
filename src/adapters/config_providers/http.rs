use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
    sync::Mutex,
    time::Duration,
};

use async_trait::async_trait;
use eyre::{Context, Result};
use reqwest::{Client, StatusCode, header};
use tokio::{sync::mpsc, task::JoinHandle};

use super::take_receiver;
use crate::{config::models::ServerConfig, ports::config_provider::ConfigProvider};

/// Fetches the configuration document from the administrative API and polls it for changes.
pub struct HttpConfigProvider {
    url: String,
    client: Client,
    update_rx: Mutex<Option<mpsc::Receiver<()>>>,
    poller: JoinHandle<()>,
}

/// What the poller remembers about the last document it saw.
#[derive(Debug, Default, PartialEq, Eq)]
enum Revision {
    #[default]
    Unknown,
    ETag(String),
    Hash(u64),
}

impl HttpConfigProvider {
    /// Must be called inside a tokio runtime; the poller is spawned immediately.
    pub fn new(url: String, poll_interval: Duration) -> Self {
        let (tx, rx) = mpsc::channel(1);
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();

        let poller = tokio::spawn(Self::poll(client.clone(), url.clone(), poll_interval, tx));

        Self {
            url,
            client,
            update_rx: Mutex::new(Some(rx)),
            poller,
        }
    }

    async fn poll(client: Client, url: String, poll_interval: Duration, tx: mpsc::Sender<()>) {
        let mut revision = Revision::Unknown;
        let mut interval = tokio::time::interval(poll_interval);

        loop {
            interval.tick().await;

            match Self::fetch_revision(&client, &url, &revision).await {
                Ok(None) => {}
                Ok(Some(next)) => {
                    if revision != Revision::Unknown {
                        tracing::info!(url = %url, "Remote configuration changed");
                        let _ = tx.try_send(());
                    }
                    revision = next;
                }
                Err(e) => tracing::warn!(url = %url, error = %e, "Failed to poll remote config"),
            }
        }
    }

    /// `Ok(None)` when the document is unchanged since `current`.
    async fn fetch_revision(
        client: &Client,
        url: &str,
        current: &Revision,
    ) -> Result<Option<Revision>> {
        let mut request = client.get(url);
        if let Revision::ETag(tag) = current {
            request = request.header(header::IF_NONE_MATCH, tag);
        }

        let resp = request.send().await.context("Failed to send request")?;
        if resp.status() == StatusCode::NOT_MODIFIED {
            return Ok(None);
        }
        let resp = resp.error_for_status().context("Config endpoint returned an error")?;

        let etag = resp
            .headers()
            .get(header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let next = match etag {
            Some(tag) => Revision::ETag(tag),
            None => {
                let body = resp.bytes().await.context("Failed to read config body")?;
                let mut hasher = DefaultHasher::new();
                body.hash(&mut hasher);
                Revision::Hash(hasher.finish())
            }
        };

        Ok((next != *current).then_some(next))
    }

    async fn fetch_config(client: &Client, url: &str) -> Result<ServerConfig> {
        client
            .get(url)
            .send()
            .await
            .context("Failed to send request")?
            .error_for_status()
            .context("Config endpoint returned an error")?
            .json::<ServerConfig>()
            .await
            .context("Failed to parse JSON config")
    }
}

impl Drop for HttpConfigProvider {
    fn drop(&mut self) {
        self.poller.abort();
    }
}

#[async_trait]
impl ConfigProvider for HttpConfigProvider {
    async fn load_config(&self) -> Result<ServerConfig> {
        Self::fetch_config(&self.client, &self.url).await
    }

    fn watch(&self) -> mpsc::Receiver<()> {
        take_receiver(&self.update_rx)
    }

    fn describe(&self) -> String {
        format!("url {}", self.url)
    }
}
