//! One measurement run: caller info, nearest server, timed download, timed upload.

use std::fmt::Display;
use std::sync::Arc;

use anyhow::{Context, anyhow};
use log::{debug, info, warn};
use tokio::sync::Mutex;
use url::Url;

use crate::cache::{BlobStore, InvalidationSignal, ServerCache, Source};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::feed::MarkupFeed;
use crate::geo::{ClientInfo, NearestServer, ServerRecord};
use crate::meter::{DownloadMeter, TransferRate, UploadMeter};
use crate::transfer::{DownloadClient, UploadClient};

const DIVIDER: &str = "==========================================";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Config,
    Servers,
    Download,
    Upload,
}

impl Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Phase::Config => "config",
            Phase::Servers => "servers",
            Phase::Download => "download",
            Phase::Upload => "upload",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Clone)]
pub struct Report {
    pub client: ClientInfo,
    /// `None` when the fallback host was measured against
    pub server: Option<ServerRecord>,
    pub servers_from: Source,
    /// Base URL the test resources were resolved against
    pub target: Url,
    pub download: TransferRate,
    pub upload: TransferRate,
}

impl Display for Report {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{DIVIDER}")?;
        writeln!(f, "{}", self.client)?;
        writeln!(f, "{DIVIDER}")?;
        match &self.server {
            Some(server) => writeln!(f, "{server}")?,
            None => writeln!(f, "No server selected, using {}", self.target)?,
        }
        let source = match self.servers_from {
            Source::Cache => "cache",
            Source::Network => "network",
        };
        writeln!(f, "Server list     : from {source}")?;
        writeln!(f, "{DIVIDER}")?;
        writeln!(f, "Download: {}", self.download)?;
        writeln!(f, "Upload: {}", self.upload)?;
        write!(f, "{DIVIDER}")
    }
}

pub struct Speedtest {
    config: Config,
    downloader: DownloadClient,
    uploader: UploadClient,
    cache: ServerCache,
    invalidation: InvalidationSignal,
}

impl Speedtest {
    /// Spawns both transfer workers; they are reused by every run.
    pub fn new(config: Config, store: Arc<dyn BlobStore>, invalidation: InvalidationSignal) -> Self {
        let cache = ServerCache::new(store, config.cache_name.clone(), config.servers_url.clone());
        Self {
            config,
            downloader: DownloadClient::spawn(),
            uploader: UploadClient::spawn(),
            cache,
            invalidation,
        }
    }

    pub async fn run(&mut self) -> anyhow::Result<Report> {
        let client = self
            .client_info()
            .await
            .with_context(|| format!("{} phase failed", Phase::Config))?;
        info!("caller {} at {}", client.ip, client.coordinates());

        let (server, servers_from) = self
            .nearest_server(&client)
            .await
            .with_context(|| format!("{} phase failed", Phase::Servers))?;

        let target = self
            .target(server.as_ref())
            .with_context(|| format!("{} phase failed", Phase::Download))?;
        info!("measuring against {target}");

        let download = self
            .measure_download(&target)
            .await
            .with_context(|| format!("{} phase failed", Phase::Download))?;
        let upload = self
            .measure_upload(&target)
            .await
            .with_context(|| format!("{} phase failed", Phase::Upload))?;

        Ok(Report {
            client,
            server,
            servers_from,
            target,
            download,
            upload,
        })
    }

    pub async fn shutdown(self) {
        self.downloader.shutdown().await;
        self.uploader.shutdown().await;
    }

    async fn client_info(&mut self) -> Result<ClientInfo> {
        let feed = Arc::new(Mutex::new(MarkupFeed::new(ClientInfo::default())));
        self.downloader
            .fetch(&self.config.config_url, &self.config.secure, feed.clone())
            .await?;
        let client = feed.lock().await.sink().clone();
        Ok(client)
    }

    async fn nearest_server(&mut self, client: &ClientInfo) -> Result<(Option<ServerRecord>, Source)> {
        if self.invalidation.take() {
            self.cache.invalidate().await?;
        }
        let (selector, source) = self
            .cache
            .load_or_fetch(
                &mut self.downloader,
                &self.config.secure,
                NearestServer::new(client.coordinates()),
                self.config.max_retries,
            )
            .await?;
        match selector.best() {
            Some(best) => debug!(
                "{} server records compared, closest {} at {:.1} km",
                selector.evaluated(),
                best.url,
                best.distance
            ),
            None => debug!("{} server records compared, none complete", selector.evaluated()),
        }
        Ok((selector.into_best(), source))
    }

    fn target(&self, server: Option<&ServerRecord>) -> anyhow::Result<Url> {
        if let Some(server) = server {
            match Url::parse(&server.url) {
                Ok(url) if url.has_host() => return Ok(url),
                Ok(_) => warn!("server url {:?} has no host", server.url),
                Err(err) => warn!("unusable server url {:?}: {err}", server.url),
            }
        }
        let host = self
            .config
            .fallback_host
            .as_deref()
            .ok_or_else(|| anyhow!("no measurement server available"))?;
        let url = Url::parse(&format!("http://{host}/speedtest/upload.php"))?;
        Ok(url)
    }

    async fn measure_download(&mut self, target: &Url) -> anyhow::Result<TransferRate> {
        let url = target.join(&self.config.download_resource)?;
        let meter = Arc::new(Mutex::new(DownloadMeter::new(
            self.config.transfer_size,
            self.config.max_retries,
        )));

        self.downloader.connect(url.as_str(), &self.config.plain).await?;
        meter.lock().await.start();
        let outcome = match self.downloader.start(url.as_str(), 0, meter.clone()).await {
            Ok(()) => self.downloader.wait().await,
            Err(err) => Err(err),
        };
        self.downloader.disconnect().await;
        let outcome = outcome?;
        debug!(
            "download ended with {outcome:?} after {} bytes, client {:?}",
            outcome.progress().transferred,
            self.downloader.state()
        );

        let rate = meter.lock().await.rate();
        rate.ok_or_else(|| anyhow!("download ended without a measurement"))
    }

    async fn measure_upload(&mut self, target: &Url) -> anyhow::Result<TransferRate> {
        let url = target.join(&self.config.upload_resource)?;
        let meter = Arc::new(Mutex::new(UploadMeter::new(
            self.config.transfer_size,
            self.config.upload_fragment,
            self.config.upload_fill,
        )));
        let size = meter.lock().await.size();

        self.uploader.connect(url.as_str(), &self.config.plain).await?;
        meter.lock().await.start();
        let outcome = match self.uploader.start(url.as_str(), size, meter.clone()).await {
            Ok(()) => self.uploader.wait().await,
            Err(err) => Err(err),
        };
        self.uploader.disconnect().await;
        let outcome = outcome?;
        debug!(
            "upload ended with {outcome:?}, client {:?} at {:?}",
            self.uploader.state(),
            self.uploader.progress()
        );

        let rate = meter.lock().await.rate();
        rate.ok_or_else(|| anyhow!("upload ended without a measurement"))
    }
}

/// Converts a transfer failure into the code shown to the user.
pub fn error_code(err: &anyhow::Error) -> Option<i32> {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<Error>())
        .and_then(Error::code)
}
