//! Resumable fragment transfer engine.
//!
//! A [`TransferClient`] owns one background worker task for its whole life. The worker idles on
//! a job queue, runs one transfer at a time and hands the result back through a single-slot
//! completion channel, then goes back to waiting for the next `start`. Download and upload
//! clients share this lifecycle and differ only in the direction fragments flow through the
//! application handler.

mod download;
mod http;
mod socket;
mod tls;
mod upload;

use std::marker::PhantomData;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc::error::SendError;
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::uri::{self, PATH_CAPACITY};

pub use download::DownloadHandler;
pub use socket::Endpoint;
pub use tls::PeerVerify;
pub use upload::{Pull, UploadSource};

pub const DEFAULT_FRAGMENT_SIZE: usize = 2048;

/// Per-connection transport settings.
#[derive(Clone, Debug)]
pub struct TransferConfig {
    /// Network interface (access point) the socket is bound to
    pub access_network: Option<String>,
    /// PEM files with the certificates trusted for secure transport; empty disables security
    pub trust: Vec<PathBuf>,
    pub verify: PeerVerify,
    /// Fragment buffer size, 0 selects [`DEFAULT_FRAGMENT_SIZE`]
    pub fragment_size_override: usize,
    /// Resolve to IPv6 first and fall back to IPv4, instead of the other way around
    pub prefer_ipv6: bool,
    /// A receive waiting longer than this fails the transfer
    pub receive_timeout: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            access_network: None,
            trust: Vec::new(),
            verify: PeerVerify::Required,
            fragment_size_override: 0,
            prefer_ipv6: false,
            receive_timeout: Duration::from_millis(4000),
        }
    }
}

impl TransferConfig {
    pub fn with_trust(mut self, trust: Vec<PathBuf>) -> Self {
        self.trust = trust;
        self
    }

    pub fn with_verify(mut self, verify: PeerVerify) -> Self {
        self.verify = verify;
        self
    }

    pub fn with_access_network(mut self, network: impl Into<String>) -> Self {
        self.access_network = Some(network.into());
        self
    }

    pub fn with_fragment_size(mut self, size: usize) -> Self {
        self.fragment_size_override = size;
        self
    }

    pub fn with_prefer_ipv6(mut self, prefer_ipv6: bool) -> Self {
        self.prefer_ipv6 = prefer_ipv6;
        self
    }

    pub fn with_receive_timeout(mut self, receive_timeout: Duration) -> Self {
        self.receive_timeout = receive_timeout;
        self
    }

    pub fn fragment_size(&self) -> usize {
        match self.fragment_size_override {
            0 => DEFAULT_FRAGMENT_SIZE,
            size => size,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    Connecting,
    Connected,
    RequestSent,
    Transferring,
    PullingFragments,
    PostambleSent,
    Done,
    Error,
}

/// Position of the running transfer, handed to every handler call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Progress {
    /// Bytes acknowledged so far, counted from the start of the resource
    pub transferred: u64,
    /// Target size for uploads, size announced by the server for downloads
    pub file_size: Option<u64>,
}

/// Verdict of a handler on a fragment.
#[derive(Debug)]
pub enum Flow {
    Continue,
    /// Halt the transfer; this is not a failure
    Stop,
    Fail(Error),
}

/// Verdict of a handler on a retryable error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Reconnect and resume from the last acknowledged offset
    Retry,
    GiveUp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Done(Progress),
    /// The handler elected to stop
    Stopped(Progress),
}

impl Outcome {
    pub fn progress(&self) -> Progress {
        match self {
            Outcome::Done(progress) | Outcome::Stopped(progress) => *progress,
        }
    }
}

/// Everything that belongs to one connection: socket, fragment buffer and progress.
struct Session {
    endpoint: Endpoint,
    config: TransferConfig,
    stream: Option<Box<dyn socket::Stream>>,
    buf: Vec<u8>,
    /// Bytes of `buf` holding a partially received response header
    filled: usize,
    path: String,
    progress: u64,
    file_size: Option<u64>,
    header_processed: bool,
    peer_closed: bool,
}

impl Session {
    fn new(endpoint: Endpoint, config: TransferConfig, stream: Box<dyn socket::Stream>) -> Self {
        let buf = vec![0; config.fragment_size()];
        Self {
            endpoint,
            config,
            stream: Some(stream),
            buf,
            filled: 0,
            path: String::new(),
            progress: 0,
            file_size: None,
            header_processed: false,
            peer_closed: false,
        }
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn begin(&mut self, resource: &str, offset: u64, file_size: Option<u64>) -> Result<()> {
        self.path = uri::parse_path(resource, PATH_CAPACITY)?.to_string();
        self.progress = offset;
        self.file_size = file_size;
        self.filled = 0;
        self.header_processed = false;
        self.peer_closed = false;
        Ok(())
    }

    fn is_complete(&self) -> bool {
        self.header_processed && self.file_size.is_some_and(|size| self.progress >= size)
    }

    fn progress(&self) -> Progress {
        Progress {
            transferred: self.progress,
            file_size: self.file_size,
        }
    }

    async fn reconnect(&mut self) -> Result<()> {
        self.close().await;
        self.stream = Some(socket::connect(&self.endpoint, &self.config).await?);
        self.filled = 0;
        self.header_processed = false;
        self.peer_closed = false;
        Ok(())
    }

    async fn send(&mut self, bytes: &[u8]) -> Result<()> {
        let stream = self.stream.as_mut().ok_or_else(Error::not_connected)?;
        stream.write_all(bytes).await.map_err(Error::TransferIo)?;
        stream.flush().await.map_err(Error::TransferIo)
    }

    async fn send_fragment(&mut self, len: usize) -> Result<()> {
        let stream = self.stream.as_mut().ok_or_else(Error::not_connected)?;
        stream
            .write_all(&self.buf[..len])
            .await
            .map_err(Error::TransferIo)?;
        stream.flush().await.map_err(Error::TransferIo)
    }

    /// Reads into the free part of the fragment buffer.
    async fn receive(&mut self) -> Result<usize> {
        let stream = self.stream.as_mut().ok_or_else(Error::not_connected)?;
        let read = stream.read(&mut self.buf[self.filled..]);
        match timeout(self.config.receive_timeout, read).await {
            Ok(result) => result.map_err(Error::TransferIo),
            Err(_) => Err(Error::TransferIo(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "receive timed out",
            ))),
        }
    }

    async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(err) = stream.shutdown().await {
                debug!("error while closing connection to {}: {}", self.endpoint.host, err);
            }
        }
    }
}

enum Task {
    Download(Arc<Mutex<dyn DownloadHandler>>),
    Upload(Arc<Mutex<dyn UploadSource>>),
}

struct Job {
    session: Session,
    task: Task,
    done: oneshot::Sender<Completion>,
}

struct Completion {
    session: Session,
    result: Result<Outcome>,
}

/// Marker for clients moving fragments from the server into the application.
#[derive(Debug)]
pub struct Download;

/// Marker for clients pulling fragments from the application towards the server.
#[derive(Debug)]
pub struct Upload;

pub type DownloadClient = TransferClient<Download>;
pub type UploadClient = TransferClient<Upload>;

pub struct TransferClient<D> {
    session: Option<Session>,
    pending: Option<oneshot::Receiver<Completion>>,
    jobs: mpsc::Sender<Job>,
    /// `true` while fragment delivery is paused
    gate: watch::Sender<bool>,
    state: Arc<watch::Sender<State>>,
    cancellation_token: CancellationToken,
    join_handle: JoinHandle<()>,
    direction: PhantomData<D>,
}

impl<D> TransferClient<D> {
    /// Spawns the worker task, which stays suspended until the first `start`.
    pub fn spawn() -> Self {
        let (jobs, rx) = mpsc::channel(1);
        let (gate, gate_rx) = watch::channel(true);
        let (state, _) = watch::channel(State::Idle);
        let state = Arc::new(state);
        let cancellation_token = CancellationToken::new();
        let join_handle = tokio::spawn(work(
            rx,
            gate_rx,
            Arc::clone(&state),
            cancellation_token.clone(),
        ));
        Self {
            session: None,
            pending: None,
            jobs,
            gate,
            state,
            cancellation_token,
            join_handle,
            direction: PhantomData,
        }
    }

    pub fn state(&self) -> State {
        *self.state.borrow()
    }

    /// Progress of the last transfer, unavailable while one is running.
    pub fn progress(&self) -> Option<Progress> {
        self.session.as_ref().map(Session::progress)
    }

    pub async fn connect(&mut self, url: &str, config: &TransferConfig) -> Result<()> {
        if self.pending.is_some() {
            return Err(Error::Protocol("a transfer is still running".to_string()));
        }
        let endpoint = Endpoint::parse(url, config)?;
        if let Some(session) = self.session.as_mut() {
            if session.is_connected() && session.endpoint == endpoint {
                debug!("already connected to {}:{}", endpoint.host, endpoint.port);
                return Ok(());
            }
            debug!(
                "leaving {}:{} for {}:{}",
                session.endpoint.host, session.endpoint.port, endpoint.host, endpoint.port
            );
            session.close().await;
        }
        self.session = None;

        self.state.send_replace(State::Connecting);
        let session: Result<Session> = async {
            let stream = socket::connect(&endpoint, config).await?;
            Ok(Session::new(endpoint, config.clone(), stream))
        }
        .await;
        match session {
            Ok(session) => {
                self.session = Some(session);
                self.state.send_replace(State::Connected);
                Ok(())
            }
            Err(err) => {
                self.state.send_replace(State::Idle);
                Err(err)
            }
        }
    }

    /// Blocks until the running transfer completes, then returns its result.
    pub async fn wait(&mut self) -> Result<Outcome> {
        let pending = self
            .pending
            .take()
            .ok_or_else(|| Error::Protocol("no transfer was started".to_string()))?;
        let Completion { session, result } = pending
            .await
            .map_err(|_| Error::Protocol("transfer worker has stopped".to_string()))?;
        self.session = Some(session);
        result
    }

    #[allow(dead_code)]
    pub fn pause(&self) {
        self.gate.send_replace(true);
    }

    pub fn resume(&self) {
        self.gate.send_replace(false);
    }

    pub async fn disconnect(&mut self) {
        if self.pending.is_some() {
            warn!("cannot disconnect while a transfer is running");
            return;
        }
        if let Some(mut session) = self.session.take() {
            session.close().await;
        }
        self.state.send_replace(State::Idle);
    }

    /// Stops the worker task. The client cannot be used afterwards.
    pub async fn shutdown(mut self) {
        self.disconnect().await;
        self.cancellation_token.cancel();
        if let Err(err) = self.join_handle.await {
            warn!("transfer worker ended abnormally: {}", err);
        }
    }

    /// Session of the last `connect`, reopened if a previous transfer closed its stream.
    async fn session_mut(&mut self) -> Result<&mut Session> {
        if self.pending.is_some() {
            return Err(Error::Protocol("a transfer is still running".to_string()));
        }
        let session = self.session.as_mut().ok_or_else(Error::not_connected)?;
        if !session.is_connected() {
            debug!("reopening connection to {}", session.endpoint.host);
            session.reconnect().await?;
            self.state.send_replace(State::Connected);
        }
        Ok(session)
    }

    /// Moves the session to the worker and lets it run.
    async fn dispatch(&mut self, task: Task) -> Result<()> {
        let session = self.session.take().ok_or_else(Error::not_connected)?;
        let (done, pending) = oneshot::channel();
        self.resume();
        if let Err(SendError(job)) = self.jobs.send(Job { session, task, done }).await {
            self.session = Some(job.session);
            return Err(Error::Protocol("transfer worker has stopped".to_string()));
        }
        self.pending = Some(pending);
        Ok(())
    }
}

async fn work(
    mut jobs: mpsc::Receiver<Job>,
    mut gate: watch::Receiver<bool>,
    state: Arc<watch::Sender<State>>,
    cancellation_token: CancellationToken,
) {
    loop {
        let job = tokio::select! {
            job = jobs.recv() => match job {
                Some(job) => job,
                None => break,
            },
            _ = cancellation_token.cancelled() => break,
        };

        let Job {
            mut session,
            task,
            done,
        } = job;
        let result = match task {
            Task::Download(handler) => {
                download::run(&mut session, handler.as_ref(), &mut gate, &state).await
            }
            Task::Upload(source) => {
                upload::run(&mut session, source.as_ref(), &mut gate, &state).await
            }
        };
        state.send_replace(if result.is_ok() {
            State::Done
        } else {
            State::Error
        });
        if done.send(Completion { session, result }).is_err() {
            warn!("transfer completed but nobody is waiting for it");
        }
    }
    debug!("transfer worker stopped");
}

/// Holds fragment delivery while the client is paused.
async fn wait_for_gate(gate: &mut watch::Receiver<bool>) {
    while *gate.borrow_and_update() {
        if gate.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
pub mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    use super::*;

    /// Download handler keeping every received byte, optionally stopping after `stop_after`.
    #[derive(Debug, Default)]
    pub struct Collect {
        pub data: Vec<u8>,
        pub fragments: usize,
        pub errors: usize,
        pub retries_left: usize,
        pub stop_after: Option<usize>,
        pub done: Option<Progress>,
    }

    #[async_trait]
    impl DownloadHandler for Collect {
        async fn on_fragment(&mut self, _progress: &Progress, fragment: &[u8]) -> Flow {
            self.data.extend_from_slice(fragment);
            self.fragments += 1;
            match self.stop_after {
                Some(limit) if self.data.len() >= limit => Flow::Stop,
                _ => Flow::Continue,
            }
        }

        async fn on_error(&mut self, _progress: &Progress, _error: &Error) -> Recovery {
            self.errors += 1;
            if self.retries_left > 0 {
                self.retries_left -= 1;
                Recovery::Retry
            } else {
                Recovery::GiveUp
            }
        }

        async fn on_done(&mut self, progress: &Progress) -> Result<()> {
            self.done = Some(*progress);
            Ok(())
        }
    }

    pub fn http_response(body: &[u8]) -> Vec<u8> {
        let mut response = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nContent-Type: application/octet-stream\r\n\r\n",
            body.len()
        )
        .into_bytes();
        response.extend_from_slice(body);
        response
    }

    /// Reads one request header from a raw connection.
    pub async fn read_request<S: AsyncRead + Unpin>(socket: &mut S) -> String {
        let mut request = Vec::new();
        let mut byte = [0; 1];
        while !request.ends_with(b"\r\n\r\n") {
            if socket.read(&mut byte).await.unwrap() == 0 {
                break;
            }
            request.push(byte[0]);
        }
        String::from_utf8(request).unwrap()
    }

    #[test]
    fn fragment_size_override() {
        assert_eq!(TransferConfig::default().fragment_size(), DEFAULT_FRAGMENT_SIZE);
        assert_eq!(TransferConfig::default().with_fragment_size(512).fragment_size(), 512);
    }

    #[tokio::test]
    async fn lifecycle_states() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/file.bin", listener.local_addr().unwrap());
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            read_request(&mut socket).await;
            socket.write_all(&http_response(b"hello")).await.unwrap();
            // keep the connection open until the client hangs up
            let mut rest = Vec::new();
            let _ = socket.read_to_end(&mut rest).await;
        });

        let mut client = DownloadClient::spawn();
        assert_eq!(client.state(), State::Idle);
        client.connect(&url, &TransferConfig::default()).await.unwrap();
        assert_eq!(client.state(), State::Connected);

        let handler = Arc::new(Mutex::new(Collect::default()));
        client.start(&url, 0, handler.clone()).await.unwrap();
        let outcome = client.wait().await.unwrap();
        assert_eq!(client.state(), State::Done);
        assert_eq!(
            outcome,
            Outcome::Done(Progress {
                transferred: 5,
                file_size: Some(5)
            })
        );

        client.disconnect().await;
        assert_eq!(client.state(), State::Idle);
        // disconnecting twice is harmless
        client.disconnect().await;
        assert_eq!(client.state(), State::Idle);
        client.shutdown().await;
    }

    #[tokio::test]
    async fn start_requires_connection() {
        let mut client = DownloadClient::spawn();
        let handler = Arc::new(Mutex::new(Collect::default()));
        let result = client.start("http://127.0.0.1/file.bin", 0, handler).await;
        assert!(matches!(result, Err(Error::TransferIo(_))));
        assert!(matches!(client.wait().await, Err(Error::Protocol(_))));
    }

    #[tokio::test]
    async fn failed_connect_returns_to_idle() {
        let mut client = UploadClient::spawn();
        let result = client
            .connect("https://127.0.0.1:1/upload.php", &TransferConfig::default())
            .await;
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
        assert_eq!(client.state(), State::Idle);
        assert!(client.progress().is_none());
    }

    #[tokio::test]
    async fn paused_client_holds_fragments() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/file.bin", listener.local_addr().unwrap());
        let (send_body, body_wanted) = oneshot::channel::<()>();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            read_request(&mut socket).await;
            let _ = body_wanted.await;
            socket.write_all(&http_response(&[7; 100])).await.unwrap();
            let mut rest = Vec::new();
            let _ = socket.read_to_end(&mut rest).await;
        });

        let mut client = DownloadClient::spawn();
        client.connect(&url, &TransferConfig::default()).await.unwrap();
        let handler = Arc::new(Mutex::new(Collect::default()));
        client.start(&url, 0, handler.clone()).await.unwrap();
        // the worker is now blocked in a receive
        tokio::time::sleep(Duration::from_millis(50)).await;
        client.pause();
        send_body.send(()).unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert!(handler.lock().await.data.is_empty());
        assert_eq!(handler.lock().await.fragments, 0);
        assert_eq!(client.state(), State::Transferring);

        client.resume();
        assert!(matches!(client.wait().await, Ok(Outcome::Done(_))));
        assert_eq!(handler.lock().await.data, vec![7; 100]);
    }

    #[tokio::test]
    async fn connect_to_another_host_replaces_the_session() {
        let first = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let first_url = format!("http://{}/file.bin", first.local_addr().unwrap());
        let second = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let second_url = format!("http://{}/file.bin", second.local_addr().unwrap());
        tokio::spawn(async move {
            let (mut socket, _) = first.accept().await.unwrap();
            let mut rest = Vec::new();
            let _ = socket.read_to_end(&mut rest).await;
        });
        tokio::spawn(async move {
            let (mut socket, _) = second.accept().await.unwrap();
            read_request(&mut socket).await;
            socket.write_all(&http_response(b"second")).await.unwrap();
            let mut rest = Vec::new();
            let _ = socket.read_to_end(&mut rest).await;
        });

        let mut client = DownloadClient::spawn();
        client.connect(&first_url, &TransferConfig::default()).await.unwrap();
        // same endpoint keeps the open connection
        client.connect(&first_url, &TransferConfig::default()).await.unwrap();
        client.connect(&second_url, &TransferConfig::default()).await.unwrap();

        let handler = Arc::new(Mutex::new(Collect::default()));
        client.start(&second_url, 0, handler.clone()).await.unwrap();
        assert!(matches!(client.wait().await, Ok(Outcome::Done(_))));
        assert_eq!(handler.lock().await.data, b"second");
        client.shutdown().await;
    }
}
