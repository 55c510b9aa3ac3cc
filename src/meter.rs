use std::fmt::Display;
use std::time::Duration;

use async_trait::async_trait;
use log::{info, warn};
use size::Size;
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::transfer::{DownloadHandler, Flow, Progress, Pull, Recovery, UploadSource};

/// Bytes moved over an elapsed time.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
pub struct TransferRate(pub Size, pub Duration);

impl TransferRate {
    /// Elapsed milliseconds, never less than one.
    pub fn millis(&self) -> u64 {
        self.1.as_millis().max(1) as u64
    }

    pub fn bytes_per_second(&self) -> f64 {
        (self.0.bytes() as f64 / self.millis() as f64) * 1000.0
    }
}

impl Display for TransferRate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let per_second = Size::from_bytes(self.bytes_per_second());
        write!(f, "{} ms @ {}/s, total {} bytes", self.millis(), per_second, self.0.bytes())
    }
}

/// Counts downloaded bytes until the ceiling is reached, then stops the transfer.
#[derive(Debug)]
pub struct DownloadMeter {
    ceiling: u64,
    downloaded: u64,
    started: Option<Instant>,
    rate: Option<TransferRate>,
    retries_left: usize,
}

impl DownloadMeter {
    pub fn new(ceiling: Size, max_retries: usize) -> Self {
        Self {
            ceiling: ceiling.bytes().max(0) as u64,
            downloaded: 0,
            started: None,
            rate: None,
            retries_left: max_retries,
        }
    }

    /// Starts the clock; call right before the transfer is started.
    pub fn start(&mut self) {
        self.started = Some(Instant::now());
    }

    pub fn rate(&self) -> Option<TransferRate> {
        self.rate
    }

    fn record(&mut self) {
        let elapsed = self.started.map(|started| started.elapsed()).unwrap_or_default();
        let bytes = self.downloaded.min(self.ceiling);
        let rate = TransferRate(Size::from_bytes(bytes), elapsed);
        info!("download: {rate}");
        self.rate = Some(rate);
    }
}

#[async_trait]
impl DownloadHandler for DownloadMeter {
    async fn on_fragment(&mut self, _progress: &Progress, fragment: &[u8]) -> Flow {
        self.downloaded += fragment.len() as u64;
        if self.downloaded >= self.ceiling {
            self.record();
            return Flow::Stop;
        }
        Flow::Continue
    }

    async fn on_error(&mut self, progress: &Progress, error: &Error) -> Recovery {
        if !error.is_retryable() || self.retries_left == 0 {
            return Recovery::GiveUp;
        }
        self.retries_left -= 1;
        warn!(
            "download failed at {} bytes ({error}), {} retries left",
            progress.transferred, self.retries_left
        );
        Recovery::Retry
    }

    /// The resource ended below the ceiling.
    async fn on_done(&mut self, _progress: &Progress) -> Result<()> {
        self.record();
        Ok(())
    }
}

/// Produces a fixed size body of filler bytes and times its upload.
#[derive(Debug)]
pub struct UploadMeter {
    size: u64,
    fragment: usize,
    fill: u8,
    started: Option<Instant>,
    rate: Option<TransferRate>,
}

impl UploadMeter {
    pub fn new(size: Size, fragment: usize, fill: u8) -> Self {
        Self {
            size: size.bytes().max(0) as u64,
            fragment,
            fill,
            started: None,
            rate: None,
        }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn start(&mut self) {
        self.started = Some(Instant::now());
    }

    pub fn rate(&self) -> Option<TransferRate> {
        self.rate
    }
}

#[async_trait]
impl UploadSource for UploadMeter {
    async fn next_fragment(&mut self, progress: &Progress, buf: &mut [u8]) -> Pull {
        let remaining = self.size.saturating_sub(progress.transferred);
        if remaining == 0 {
            return Pull::Finished;
        }
        let len = self.fragment.min(buf.len()).min(remaining as usize);
        buf[..len].fill(self.fill);
        Pull::Data(len)
    }

    async fn on_done(&mut self, progress: &Progress) -> Result<()> {
        let elapsed = self.started.map(|started| started.elapsed()).unwrap_or_default();
        let rate = TransferRate(Size::from_bytes(progress.transferred), elapsed);
        info!("upload: {rate}");
        self.rate = Some(rate);
        Ok(())
    }
}
