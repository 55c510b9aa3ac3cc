//! Line oriented markup feeds.
//!
//! Bytes arrive in arbitrary chunks, from the network or from a stored blob. A [`LineFeeder`]
//! reassembles them into lines within a fixed capacity, and a [`MarkupFeed`] scans each line for
//! tags and reports their attributes to an [`AttributeSink`].

pub mod markup;

use async_trait::async_trait;
use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Error, Result};
use crate::transfer::{DEFAULT_FRAGMENT_SIZE, DownloadHandler, Flow, Progress};
use markup::Event;

pub const LINE_CAPACITY: usize = 512;

/// Splits a chunked byte stream into `\n` terminated lines. A line longer than the capacity is
/// dropped as a whole and feeding resumes after its terminator.
#[derive(Debug)]
pub struct LineFeeder {
    line: Vec<u8>,
    capacity: usize,
    overflowed: bool,
    dropped: usize,
}

impl Default for LineFeeder {
    fn default() -> Self {
        Self::new(LINE_CAPACITY)
    }
}

impl LineFeeder {
    pub fn new(capacity: usize) -> Self {
        Self {
            line: Vec::with_capacity(capacity),
            capacity,
            overflowed: false,
            dropped: 0,
        }
    }

    /// Lines dropped for exceeding the capacity so far.
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    /// Passes every line completed by `chunk` to `on_line`, without its terminator. An
    /// unterminated tail is kept for the next chunk.
    pub fn feed(&mut self, chunk: &[u8], mut on_line: impl FnMut(&[u8])) {
        for segment in chunk.split_inclusive(|&b| b == b'\n') {
            let (content, terminated) = match segment.split_last() {
                Some((b'\n', content)) => (content, true),
                _ => (segment, false),
            };

            if !self.overflowed {
                if self.line.len() + content.len() > self.capacity {
                    warn!("dropping line longer than {} bytes", self.capacity);
                    self.overflowed = true;
                    self.dropped += 1;
                    self.line.clear();
                } else {
                    self.line.extend_from_slice(content);
                }
            }

            if terminated {
                if !self.overflowed {
                    on_line(&self.line);
                }
                self.line.clear();
                self.overflowed = false;
            }
        }
    }

    /// Flushes a last line that was never terminated.
    pub fn finish(&mut self, mut on_line: impl FnMut(&[u8])) {
        if !self.overflowed && !self.line.is_empty() {
            on_line(&self.line);
        }
        self.line.clear();
        self.overflowed = false;
    }
}

/// Receiver of markup attributes, in document order.
pub trait AttributeSink {
    /// Called for every opening tag, before its attributes.
    fn element_start(&mut self, _name: &str) {}

    fn attribute(&mut self, name: &str, value: &str);
}

#[derive(Debug, Default)]
pub struct MarkupFeed<S> {
    lines: LineFeeder,
    sink: S,
    malformed: usize,
}

impl<S: AttributeSink> MarkupFeed<S> {
    pub fn new(sink: S) -> Self {
        Self {
            lines: LineFeeder::default(),
            sink,
            malformed: 0,
        }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    /// Malformed tags skipped so far.
    pub fn malformed(&self) -> usize {
        self.malformed
    }

    pub fn dropped_lines(&self) -> usize {
        self.lines.dropped()
    }

    pub fn feed(&mut self, chunk: &[u8]) {
        let Self {
            lines,
            sink,
            malformed,
        } = self;
        lines.feed(chunk, |line| dispatch(line, sink, malformed));
    }

    pub fn finish(&mut self) {
        let Self {
            lines,
            sink,
            malformed,
        } = self;
        lines.finish(|line| dispatch(line, sink, malformed));
    }

    /// Feeds a whole stored blob, refilling one fragment sized buffer at a time.
    pub async fn read_from<R>(&mut self, reader: &mut R) -> Result<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut buf = vec![0; DEFAULT_FRAGMENT_SIZE];
        let mut total = 0;
        loop {
            let read = reader.read(&mut buf).await.map_err(Error::Storage)?;
            if read == 0 {
                break;
            }
            self.feed(&buf[..read]);
            total += read as u64;
        }
        self.finish();
        Ok(total)
    }
}

fn dispatch<S: AttributeSink>(line: &[u8], sink: &mut S, malformed: &mut usize) {
    let line = String::from_utf8_lossy(line);
    markup::scan(&line, |event| match event {
        Event::ElementStart(name) => sink.element_start(name),
        Event::Attribute(name, value) => sink.attribute(name, &value),
        Event::ElementEnd(_) => {}
        Event::Error(text) => {
            *malformed += 1;
            debug!("skipping malformed markup {text:?}");
        }
    });
}

#[async_trait]
impl<S: AttributeSink + Send> DownloadHandler for MarkupFeed<S> {
    async fn on_fragment(&mut self, _progress: &Progress, fragment: &[u8]) -> Flow {
        self.feed(fragment);
        Flow::Continue
    }

    async fn on_done(&mut self, _progress: &Progress) -> Result<()> {
        self.finish();
        Ok(())
    }
}
