use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info};
use tokio::sync::{Mutex, watch};

use crate::error::{Error, Result};
use crate::transfer::{
    Outcome, Progress, Session, State, Task, TransferClient, Upload, http, wait_for_gate,
};

/// Answer of an [`UploadSource`] asked for the next fragment.
#[derive(Debug)]
pub enum Pull {
    /// The first `n` bytes of the buffer hold the next fragment
    Data(usize),
    /// No more data; the body is complete
    Finished,
    #[allow(dead_code)]
    Fail(Error),
}

/// Producer of upload fragments. Uploads cannot be resumed, so errors are only reported.
#[async_trait]
pub trait UploadSource: Send {
    async fn next_fragment(&mut self, progress: &Progress, buf: &mut [u8]) -> Pull;

    async fn on_error(&mut self, _progress: &Progress, _error: &Error) {}

    async fn on_done(&mut self, _progress: &Progress) -> Result<()> {
        Ok(())
    }
}

impl TransferClient<Upload> {
    /// Posts a multipart body of exactly `size` bytes to `resource`, pulling it from `source`.
    pub async fn start<S>(&mut self, resource: &str, size: u64, source: Arc<Mutex<S>>) -> Result<()>
    where
        S: UploadSource + 'static,
    {
        let session = self.session_mut().await?;
        session.begin(resource, 0, Some(size))?;
        send_request(session).await?;
        self.state.send_replace(State::RequestSent);
        self.dispatch(Task::Upload(source)).await
    }
}

async fn send_request(session: &mut Session) -> Result<()> {
    let size = session.file_size.unwrap_or_default();
    let preamble = http::post_preamble(&session.path, &session.endpoint.host, size);
    let midamble = http::midamble();
    http::ensure_fits(&preamble, session.buf.len())?;
    http::ensure_fits(&midamble, session.buf.len())?;
    debug!("posting {size} bytes to /{} on {}", session.path, session.endpoint.host);
    session.send(preamble.as_bytes()).await?;
    session.send(midamble.as_bytes()).await
}

pub(super) async fn run(
    session: &mut Session,
    source: &Mutex<dyn UploadSource>,
    gate: &mut watch::Receiver<bool>,
    state: &watch::Sender<State>,
) -> Result<Outcome> {
    match pull(session, source, gate, state).await {
        Ok(progress) => {
            info!("uploaded {} bytes to {}", progress.transferred, session.endpoint.host);
            source.lock().await.on_done(&progress).await?;
            Ok(Outcome::Done(progress))
        }
        Err(err) => {
            source.lock().await.on_error(&session.progress(), &err).await;
            Err(err)
        }
    }
}

async fn pull(
    session: &mut Session,
    source: &Mutex<dyn UploadSource>,
    gate: &mut watch::Receiver<bool>,
    state: &watch::Sender<State>,
) -> Result<Progress> {
    let size = session.file_size.unwrap_or_default();
    state.send_replace(State::PullingFragments);
    loop {
        wait_for_gate(gate).await;
        let progress = session.progress();
        let pulled = source
            .lock()
            .await
            .next_fragment(&progress, &mut session.buf[..])
            .await;
        match pulled {
            Pull::Data(len) if len > session.buf.len() => {
                return Err(Error::Protocol(format!(
                    "fragment of {len} bytes exceeds the {} byte buffer",
                    session.buf.len()
                )));
            }
            Pull::Data(len) if session.progress + len as u64 > size => {
                return Err(Error::Protocol(format!(
                    "fragment at offset {} overruns the declared size of {size} bytes",
                    session.progress
                )));
            }
            Pull::Data(0) => {
                return Err(Error::Protocol(format!(
                    "empty fragment at offset {}",
                    session.progress
                )));
            }
            Pull::Data(len) => {
                wait_for_gate(gate).await;
                session.send_fragment(len).await?;
                session.progress += len as u64;
            }
            Pull::Finished => break,
            Pull::Fail(err) => return Err(err),
        }
    }

    if session.progress != size {
        return Err(Error::Protocol(format!(
            "body ended after {} of {size} declared bytes",
            session.progress
        )));
    }
    session.send(http::postamble().as_bytes()).await?;
    state.send_replace(State::PostambleSent);
    Ok(session.progress())
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    use super::*;
    use crate::transfer::{TransferConfig, UploadClient};

    /// Hands out `data` in fragments of at most `chunk` bytes.
    struct Chunks {
        data: Vec<u8>,
        chunk: usize,
        errors: usize,
        done: Option<Progress>,
    }

    impl Chunks {
        fn new(data: Vec<u8>, chunk: usize) -> Self {
            Self {
                data,
                chunk,
                errors: 0,
                done: None,
            }
        }
    }

    #[async_trait]
    impl UploadSource for Chunks {
        async fn next_fragment(&mut self, progress: &Progress, buf: &mut [u8]) -> Pull {
            let offset = progress.transferred as usize;
            if offset >= self.data.len() {
                return Pull::Finished;
            }
            let len = self.chunk.min(self.data.len() - offset);
            buf[..len].copy_from_slice(&self.data[offset..offset + len]);
            Pull::Data(len)
        }

        async fn on_error(&mut self, _progress: &Progress, _error: &Error) {
            self.errors += 1;
        }

        async fn on_done(&mut self, progress: &Progress) -> Result<()> {
            self.done = Some(*progress);
            Ok(())
        }
    }

    /// Accepts one connection and returns everything sent on it.
    async fn capture() -> (String, oneshot::Receiver<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/speedtest/upload.php", listener.local_addr().unwrap());
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            socket.read_to_end(&mut received).await.unwrap();
            let _ = tx.send(received);
        });
        (url, rx)
    }

    async fn upload(url: &str, size: u64, source: Arc<Mutex<Chunks>>) -> (UploadClient, Result<Outcome>) {
        let mut client = UploadClient::spawn();
        client.connect(url, &TransferConfig::default()).await.unwrap();
        client.start(url, size, source).await.unwrap();
        let outcome = client.wait().await;
        (client, outcome)
    }

    #[tokio::test]
    async fn sends_exact_multipart_body() {
        let (url, received) = capture().await;
        let body: Vec<u8> = (0..2500).map(|i| (i % 7) as u8).collect();
        let source = Arc::new(Mutex::new(Chunks::new(body.clone(), 1000)));

        let (mut client, outcome) = upload(&url, 2500, source.clone()).await;
        let expected_progress = Progress {
            transferred: 2500,
            file_size: Some(2500),
        };
        assert_eq!(outcome.unwrap(), Outcome::Done(expected_progress));
        assert_eq!(client.state(), State::Done);
        assert_eq!(source.lock().await.done, Some(expected_progress));
        client.disconnect().await;

        let mut expected = http::post_preamble("speedtest/upload.php", "127.0.0.1", 2500).into_bytes();
        expected.extend_from_slice(http::midamble().as_bytes());
        expected.extend_from_slice(&body);
        expected.extend_from_slice(http::postamble().as_bytes());
        assert_eq!(received.await.unwrap(), expected);
    }

    #[tokio::test]
    async fn body_shorter_than_declared() {
        let (url, _received) = capture().await;
        let source = Arc::new(Mutex::new(Chunks::new(vec![0x5A; 100], 64)));

        let (client, outcome) = upload(&url, 200, source.clone()).await;
        assert!(matches!(outcome, Err(Error::Protocol(_))));
        assert_eq!(client.state(), State::Error);
        assert_eq!(source.lock().await.errors, 1);
        assert!(source.lock().await.done.is_none());
    }

    #[tokio::test]
    async fn body_longer_than_declared() {
        let (url, _received) = capture().await;
        let source = Arc::new(Mutex::new(Chunks::new(vec![0x5A; 300], 128)));

        let (client, outcome) = upload(&url, 200, source).await;
        assert!(matches!(outcome, Err(Error::Protocol(_))));
        assert_eq!(client.progress().map(|p| p.transferred), Some(128));
    }

    #[tokio::test]
    async fn empty_fragment_is_rejected() {
        let (url, _received) = capture().await;
        let source = Arc::new(Mutex::new(Chunks::new(vec![0x5A; 100], 0)));

        let (client, outcome) = upload(&url, 100, source.clone()).await;
        assert!(matches!(outcome, Err(Error::Protocol(_))));
        assert_eq!(client.state(), State::Error);
        assert_eq!(source.lock().await.errors, 1);
    }
}
