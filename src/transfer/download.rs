use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::sync::{Mutex, watch};

use crate::error::{Error, Result};
use crate::transfer::{
    Download, Flow, Outcome, Progress, Recovery, Session, State, Task, TransferClient,
    TransferConfig, http, wait_for_gate,
};

/// Consumer of downloaded fragments.
#[async_trait]
pub trait DownloadHandler: Send {
    /// Receives the next slice of the response body. `progress` is the offset of the slice.
    async fn on_fragment(&mut self, progress: &Progress, fragment: &[u8]) -> Flow;

    /// Decides whether a failed transfer is resumed. Only I/O errors can be resumed; the verdict
    /// on any other error is ignored.
    async fn on_error(&mut self, _progress: &Progress, _error: &Error) -> Recovery {
        Recovery::GiveUp
    }

    async fn on_done(&mut self, _progress: &Progress) -> Result<()> {
        Ok(())
    }
}

impl TransferClient<Download> {
    /// Requests `resource` from the connected host starting at byte `offset` and hands the
    /// transfer to the worker. Use [`TransferClient::wait`] for the result.
    pub async fn start<H>(&mut self, resource: &str, offset: u64, handler: Arc<Mutex<H>>) -> Result<()>
    where
        H: DownloadHandler + 'static,
    {
        let session = self.session_mut().await?;
        session.begin(resource, offset, None)?;
        send_request(session).await?;
        self.state.send_replace(State::RequestSent);
        self.dispatch(Task::Download(handler)).await
    }

    /// Connects, downloads `url` from its first byte and disconnects again, whatever the outcome.
    pub async fn fetch<H>(
        &mut self,
        url: &str,
        config: &TransferConfig,
        handler: Arc<Mutex<H>>,
    ) -> Result<Outcome>
    where
        H: DownloadHandler + 'static,
    {
        self.connect(url, config).await?;
        let outcome = match self.start(url, 0, handler).await {
            Ok(()) => self.wait().await,
            Err(err) => Err(err),
        };
        self.disconnect().await;
        outcome
    }
}

async fn send_request(session: &mut Session) -> Result<()> {
    let range_from = (session.endpoint.is_secure() || session.progress > 0).then_some(session.progress);
    let request = http::get_request(&session.path, &session.endpoint.host, range_from);
    http::ensure_fits(&request, session.buf.len())?;
    debug!(
        "requesting /{} from {} (offset {})",
        session.path, session.endpoint.host, session.progress
    );
    session.send(request.as_bytes()).await
}

pub(super) async fn run(
    session: &mut Session,
    handler: &Mutex<dyn DownloadHandler>,
    gate: &mut watch::Receiver<bool>,
    state: &watch::Sender<State>,
) -> Result<Outcome> {
    loop {
        match attempt(session, handler, gate, state).await {
            Ok(Outcome::Done(progress)) => {
                info!("downloaded {} bytes from {}", progress.transferred, session.endpoint.host);
                handler.lock().await.on_done(&progress).await?;
                return Ok(Outcome::Done(progress));
            }
            Ok(Outcome::Stopped(progress)) => {
                debug!("download stopped by handler at {} bytes", progress.transferred);
                // the rest of the response is still in flight
                if !session.peer_closed {
                    session.close().await;
                }
                return Ok(Outcome::Stopped(progress));
            }
            Err(err) => {
                let progress = session.progress();
                let recovery = handler.lock().await.on_error(&progress, &err).await;
                if err.is_retryable() && recovery == Recovery::Retry {
                    warn!(
                        "download interrupted at {} bytes: {}, resuming",
                        progress.transferred, err
                    );
                    session.close().await;
                    continue;
                }
                return Err(err);
            }
        }
    }
}

async fn attempt(
    session: &mut Session,
    handler: &Mutex<dyn DownloadHandler>,
    gate: &mut watch::Receiver<bool>,
    state: &watch::Sender<State>,
) -> Result<Outcome> {
    if !session.is_connected() {
        session.reconnect().await?;
        send_request(session).await?;
        state.send_replace(State::RequestSent);
    }
    state.send_replace(State::Transferring);

    loop {
        if session.is_complete() {
            return Ok(Outcome::Done(session.progress()));
        }
        wait_for_gate(gate).await;

        let read = session.receive().await?;
        if read == 0 {
            session.peer_closed = true;
            if session.header_processed && session.file_size.is_none() {
                return Ok(Outcome::Done(session.progress()));
            }
            return Err(Error::TransferIo(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before the transfer completed",
            )));
        }

        let body_start = if session.header_processed {
            session.filled = read;
            0
        } else {
            session.filled += read;
            match http::header_end(&session.buf[..session.filled]) {
                Some(end) => {
                    process_header(session, end)?;
                    end
                }
                None if session.filled == session.buf.len() => {
                    return Err(Error::Protocol(format!(
                        "response header exceeds {} bytes",
                        session.buf.len()
                    )));
                }
                None => continue,
            }
        };

        let mut body_end = session.filled;
        session.filled = 0;
        if let Some(size) = session.file_size {
            let remaining = size.saturating_sub(session.progress);
            body_end = body_end.min(body_start + remaining.min(usize::MAX as u64) as usize);
        }
        if body_end == body_start {
            continue;
        }

        wait_for_gate(gate).await;
        let progress = session.progress();
        let flow = handler
            .lock()
            .await
            .on_fragment(&progress, &session.buf[body_start..body_end])
            .await;
        session.progress += (body_end - body_start) as u64;
        match flow {
            Flow::Continue => {}
            Flow::Stop => return Ok(Outcome::Stopped(session.progress())),
            Flow::Fail(err) => return Err(err),
        }
    }
}

fn process_header(session: &mut Session, head_len: usize) -> Result<()> {
    let head = http::parse_head(&session.buf[..head_len])?;
    debug!(
        "response {} from {}, content length {:?}",
        head.status, session.endpoint.host, head.content_length
    );
    session.file_size = match head.status {
        206 => head
            .total_size
            .or_else(|| head.content_length.map(|len| session.progress + len)),
        200..=299 if session.progress > 0 => {
            return Err(Error::Protocol(format!(
                "{} ignored the range request at offset {}",
                session.endpoint.host, session.progress
            )));
        }
        200..=299 => head.content_length,
        status => {
            return Err(Error::Protocol(format!(
                "{} answered with status {status}",
                session.endpoint.host
            )));
        }
    };
    session.header_processed = true;
    Ok(())
}
