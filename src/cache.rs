//! Persistent copy of the server list.
//!
//! The list is read from the blob store when present. Otherwise it is downloaded, written
//! through to the store fragment by fragment and parsed on the fly. A blob is only visible once
//! the download completed, so a failed fetch leaves no partial copy behind.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::sync::{Mutex, mpsc};

use crate::error::{Error, Result};
use crate::feed::MarkupFeed;
use crate::geo::NearestServer;
use crate::transfer::{DownloadClient, DownloadHandler, Flow, Progress, Recovery, TransferConfig};

pub type BlobReader = Box<dyn AsyncRead + Send + Unpin>;

/// Named byte blobs with all or nothing visibility.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Opens a committed blob, `None` when there is none.
    async fn open(&self, name: &str) -> io::Result<Option<BlobReader>>;

    /// Starts writing a blob that replaces `name` once committed.
    async fn create(&self, name: &str) -> io::Result<Box<dyn BlobWriter>>;

    /// Removes the blob along with any uncommitted write.
    async fn erase(&self, name: &str) -> io::Result<()>;
}

#[async_trait]
pub trait BlobWriter: Send {
    async fn write(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Makes the written bytes durable and visible.
    async fn commit(&mut self) -> io::Result<()>;

    async fn discard(&mut self) -> io::Result<()>;
}

/// Stores each blob as a file in one directory. Writes go to `<name>.part`, renamed on commit.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    dir: PathBuf,
}

impl FsBlobStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    fn part_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.part"))
    }
}

async fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path).await {
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        result => result,
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn open(&self, name: &str) -> io::Result<Option<BlobReader>> {
        match File::open(self.path(name)).await {
            Ok(file) => Ok(Some(Box::new(file))),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn create(&self, name: &str) -> io::Result<Box<dyn BlobWriter>> {
        fs::create_dir_all(&self.dir).await?;
        let part = self.part_path(name);
        let file = File::create(&part).await?;
        Ok(Box::new(FsBlobWriter {
            file: Some(file),
            part,
            path: self.path(name),
        }))
    }

    async fn erase(&self, name: &str) -> io::Result<()> {
        remove_if_present(&self.path(name)).await?;
        remove_if_present(&self.part_path(name)).await
    }
}

struct FsBlobWriter {
    file: Option<File>,
    part: PathBuf,
    path: PathBuf,
}

impl FsBlobWriter {
    fn file(&mut self) -> io::Result<&mut File> {
        self.file
            .as_mut()
            .ok_or_else(|| io::Error::other("blob already closed"))
    }
}

#[async_trait]
impl BlobWriter for FsBlobWriter {
    async fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.file()?.write_all(bytes).await
    }

    async fn commit(&mut self) -> io::Result<()> {
        let file = self.file()?;
        file.flush().await?;
        file.sync_all().await?;
        self.file = None;
        fs::rename(&self.part, &self.path).await
    }

    async fn discard(&mut self) -> io::Result<()> {
        self.file = None;
        remove_if_present(&self.part).await
    }
}

/// Writes every fragment of the server list to the store before parsing it.
struct CachingFeed {
    writer: Box<dyn BlobWriter>,
    feed: MarkupFeed<NearestServer>,
    retries_left: usize,
}

#[async_trait]
impl DownloadHandler for CachingFeed {
    async fn on_fragment(&mut self, _progress: &Progress, fragment: &[u8]) -> Flow {
        if let Err(err) = self.writer.write(fragment).await {
            return Flow::Fail(Error::Storage(err));
        }
        self.feed.feed(fragment);
        Flow::Continue
    }

    async fn on_error(&mut self, progress: &Progress, error: &Error) -> Recovery {
        if !error.is_retryable() || self.retries_left == 0 {
            return Recovery::GiveUp;
        }
        self.retries_left -= 1;
        warn!(
            "server list download failed at {} bytes ({error}), resuming",
            progress.transferred
        );
        Recovery::Retry
    }

    async fn on_done(&mut self, _progress: &Progress) -> Result<()> {
        self.writer.commit().await.map_err(Error::Storage)?;
        self.feed.finish();
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Cache,
    Network,
}

pub struct ServerCache {
    store: Arc<dyn BlobStore>,
    name: String,
    url: String,
}

impl ServerCache {
    pub fn new(store: Arc<dyn BlobStore>, name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            store,
            name: name.into(),
            url: url.into(),
        }
    }

    pub async fn invalidate(&self) -> Result<()> {
        info!("erasing cached server list {}", self.name);
        self.store.erase(&self.name).await.map_err(Error::Storage)
    }

    /// Streams the server list through `selector`, from the store when a copy exists and from
    /// the network otherwise.
    pub async fn load_or_fetch(
        &self,
        downloader: &mut DownloadClient,
        config: &TransferConfig,
        selector: NearestServer,
        max_retries: usize,
    ) -> Result<(NearestServer, Source)> {
        if let Some(mut reader) = self.store.open(&self.name).await.map_err(Error::Storage)? {
            let mut feed = MarkupFeed::new(selector);
            let read = feed.read_from(&mut reader).await?;
            info!("read {read} bytes of server list from {}", self.name);
            return Ok((feed.into_sink(), Source::Cache));
        }

        info!("fetching server list from {}", self.url);
        let writer = self.store.create(&self.name).await.map_err(Error::Storage)?;
        let handler = Arc::new(Mutex::new(CachingFeed {
            writer,
            feed: MarkupFeed::new(selector),
            retries_left: max_retries,
        }));
        let outcome = downloader.fetch(&self.url, config, handler.clone()).await;

        let mut caching = handler.lock().await;
        if let Err(err) = outcome {
            if let Err(discard_err) = caching.writer.discard().await {
                warn!("unable to discard partial server list: {discard_err}");
            }
            return Err(err);
        }
        let feed = std::mem::take(&mut caching.feed);
        debug!(
            "server list parsed, {} malformed tags, {} lines dropped",
            feed.malformed(),
            feed.dropped_lines()
        );
        Ok((feed.into_sink(), Source::Network))
    }
}

/// Requests erasure of the cached server list from outside the measurement run.
#[derive(Debug, Clone)]
pub struct InvalidationTrigger(mpsc::Sender<()>);

impl InvalidationTrigger {
    pub fn trigger(&self) {
        if self.0.try_send(()).is_err() {
            debug!("cache invalidation already requested");
        }
    }
}

#[derive(Debug)]
pub struct InvalidationSignal(mpsc::Receiver<()>);

impl InvalidationSignal {
    /// Consumes a pending request, if any.
    pub fn take(&mut self) -> bool {
        let mut requested = false;
        while self.0.try_recv().is_ok() {
            requested = true;
        }
        requested
    }
}

pub fn invalidation_channel() -> (InvalidationTrigger, InvalidationSignal) {
    let (tx, rx) = mpsc::channel(1);
    (InvalidationTrigger(tx), InvalidationSignal(rx))
}
