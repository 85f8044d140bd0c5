//! Dialog transport
//!
//! A transport opens one bidirectional stream per turn. The stream is split
//! into a request writer, a response reader and a finisher so the outbound
//! audio and the inbound responses can be driven from different tasks.

use std::io::ErrorKind;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::protocol::{DialogRequest, DialogResponse, StreamStatus};
use crate::{Error, Result};

/// Default dialog service address
pub const DEFAULT_ENDPOINT: &str = "127.0.0.1:7878";

/// Buffered frames per direction
const STREAM_BUFFER: usize = 64;

/// Opens dialog streams
#[async_trait]
pub trait DialogTransport: Send + Sync {
    /// Open a stream for one turn
    ///
    /// # Errors
    ///
    /// Returns error if the service cannot be reached
    async fn open(&self) -> Result<DialogStream>;
}

/// An open dialog stream
///
/// The driver task moves frames between the channels and the wire; its
/// result is the stream's final status.
pub struct DialogStream {
    requests: mpsc::Sender<DialogRequest>,
    responses: mpsc::Receiver<DialogResponse>,
    driver: JoinHandle<Result<()>>,
}

impl DialogStream {
    /// Assemble a stream from its channels and driver task
    #[must_use]
    pub const fn new(
        requests: mpsc::Sender<DialogRequest>,
        responses: mpsc::Receiver<DialogResponse>,
        driver: JoinHandle<Result<()>>,
    ) -> Self {
        Self {
            requests,
            responses,
            driver,
        }
    }

    /// Split into writer, reader and finisher
    #[must_use]
    pub fn into_parts(self) -> (RequestSender, ResponseReceiver, StreamFinisher) {
        (
            RequestSender { tx: self.requests },
            ResponseReceiver { rx: self.responses },
            StreamFinisher {
                driver: self.driver,
            },
        )
    }
}

/// Outbound half of a dialog stream
#[derive(Debug)]
pub struct RequestSender {
    tx: mpsc::Sender<DialogRequest>,
}

impl RequestSender {
    /// Queue a request frame
    ///
    /// # Errors
    ///
    /// Returns error if the stream is no longer accepting requests
    pub async fn write(&self, request: DialogRequest) -> Result<()> {
        self.tx
            .send(request)
            .await
            .map_err(|_| Error::Transport("request stream closed".to_string()))
    }

    /// Signal that no more requests will be sent
    pub fn close_send(self) {
        tracing::debug!("request stream half-closed");
    }
}

/// Inbound half of a dialog stream
#[derive(Debug)]
pub struct ResponseReceiver {
    rx: mpsc::Receiver<DialogResponse>,
}

impl ResponseReceiver {
    /// Next response, or `None` once the peer has closed the stream
    pub async fn read(&mut self) -> Option<DialogResponse> {
        self.rx.recv().await
    }
}

/// Waits for a stream to finish and reports its status
#[derive(Debug)]
pub struct StreamFinisher {
    driver: JoinHandle<Result<()>>,
}

impl StreamFinisher {
    /// Wait for the stream driver to exit
    ///
    /// # Errors
    ///
    /// Returns the stream's failure status
    pub async fn finish(self) -> Result<()> {
        self.driver
            .await
            .map_err(|e| Error::Transport(format!("stream driver failed: {e}")))?
    }
}

/// Newline-delimited JSON over TCP
///
/// The service may end a turn with a `status` frame; otherwise a clean close
/// of its side of the connection counts as success.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    endpoint: String,
    connect_timeout: Duration,
}

impl TcpTransport {
    /// Create a transport for `host:port`
    #[must_use]
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            connect_timeout: Duration::from_secs(5),
        }
    }

    /// Override the connect timeout
    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Service address
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl DialogTransport for TcpTransport {
    async fn open(&self) -> Result<DialogStream> {
        let socket = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.endpoint))
            .await
            .map_err(|_| Error::Transport(format!("connect to {} timed out", self.endpoint)))?
            .map_err(|e| Error::Transport(format!("connect to {}: {e}", self.endpoint)))?;
        socket.set_nodelay(true)?;

        tracing::debug!(endpoint = %self.endpoint, "dialog stream connected");

        let (read_half, write_half) = socket.into_split();
        let (request_tx, request_rx) = mpsc::channel(STREAM_BUFFER);
        let (response_tx, response_rx) = mpsc::channel(STREAM_BUFFER);

        let driver = tokio::spawn(async move {
            let (written, read) = tokio::join!(
                write_requests(write_half, request_rx),
                read_responses(read_half, response_tx)
            );
            stream_status(written, read)
        });

        Ok(DialogStream::new(request_tx, response_rx, driver))
    }
}

/// How the request side of a stream ended
#[derive(Debug)]
enum WriteEnd {
    /// Every request written, then half-closed
    Flushed,
    /// The peer stopped reading; remaining requests were discarded
    PeerClosed(std::io::Error),
}

/// How the response side of a stream ended
#[derive(Debug)]
enum ReadEnd {
    /// The peer closed without a status frame
    Eof,
    /// The peer sent its end-of-turn status
    Status(StreamStatus),
}

/// Combine both halves into the stream's final status
///
/// A status frame settles the turn. Without one, a clean end of input means
/// the service answered in full, even if it hung up before reading all of
/// our audio.
fn stream_status(written: Result<WriteEnd>, read: Result<ReadEnd>) -> Result<()> {
    match read? {
        ReadEnd::Status(status) if status.is_ok() => Ok(()),
        ReadEnd::Status(status) => Err(Error::Transport(format!(
            "turn failed with status {}: {}",
            status.code, status.message
        ))),
        ReadEnd::Eof => match written? {
            WriteEnd::Flushed => Ok(()),
            WriteEnd::PeerClosed(e) => {
                tracing::debug!(error = %e, "service closed before reading all audio");
                Ok(())
            }
        },
    }
}

fn is_peer_closed(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::BrokenPipe
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
    )
}

async fn write_requests(
    mut writer: OwnedWriteHalf,
    mut requests: mpsc::Receiver<DialogRequest>,
) -> Result<WriteEnd> {
    let mut frames = 0usize;
    while let Some(request) = requests.recv().await {
        let mut line = serde_json::to_vec(&request)?;
        line.push(b'\n');
        if let Err(e) = writer.write_all(&line).await {
            return discard_requests(e, &mut requests).await;
        }
        frames += 1;
    }

    // All senders dropped: half-close so the peer sees end of input
    if let Err(e) = writer.shutdown().await {
        return discard_requests(e, &mut requests).await;
    }
    tracing::debug!(frames, "request stream finished");
    Ok(WriteEnd::Flushed)
}

/// After a failed write, keep accepting requests so the uplink can wind down
async fn discard_requests(
    e: std::io::Error,
    requests: &mut mpsc::Receiver<DialogRequest>,
) -> Result<WriteEnd> {
    if !is_peer_closed(&e) {
        return Err(Error::Transport(format!("write failed: {e}")));
    }

    tracing::debug!(error = %e, "service stopped reading requests");
    let mut discarded = 0usize;
    while requests.recv().await.is_some() {
        discarded += 1;
    }
    tracing::debug!(discarded, "request stream abandoned");
    Ok(WriteEnd::PeerClosed(e))
}

async fn read_responses(
    reader: OwnedReadHalf,
    responses: mpsc::Sender<DialogResponse>,
) -> Result<ReadEnd> {
    let mut lines = BufReader::new(reader).lines();
    let mut frames = 0usize;

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => return Err(Error::Transport(format!("read failed: {e}"))),
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let mut response: DialogResponse = serde_json::from_str(line)
            .map_err(|e| Error::Protocol(format!("malformed response frame: {e}")))?;
        frames += 1;

        let status = response.status.take();
        if !response.is_empty() && responses.send(response).await.is_err() {
            tracing::debug!("response reader dropped, abandoning stream");
            break;
        }

        // The status frame is the last one; whatever follows is ignored
        if let Some(status) = status {
            tracing::debug!(frames, code = status.code, "response stream finished with status");
            return Ok(ReadEnd::Status(status));
        }
    }

    tracing::debug!(frames, "response stream finished");
    Ok(ReadEnd::Eof)
}
