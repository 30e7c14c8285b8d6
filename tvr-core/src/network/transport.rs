use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::debug;

use crate::codec::LineCodec;
use crate::config::ProtocolConfig;
use crate::error::RemoteError;

/// Any bidirectional byte stream a connection can run over.
pub trait DuplexStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> DuplexStream for T {}

pub type BoxedStream = Box<dyn DuplexStream>;

type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// Split a stream into a line reader and a line writer.
pub fn split<S: DuplexStream>(stream: S, config: &ProtocolConfig) -> (LineReader, LineWriter) {
    let (read_half, write_half) = tokio::io::split(stream);
    let reader = LineReader::spawn(read_half, config.line_queue_capacity, config.max_line_length);
    let writer = LineWriter::new(write_half);
    (reader, writer)
}

// ── LineReader ───────────────────────────────────────────────────

/// Reads lines on a background task into a bounded queue.
///
/// When the queue is full the background task stops pulling bytes off the
/// stream until the consumer catches up.
pub struct LineReader {
    rx: mpsc::Receiver<String>,
    death: Arc<Mutex<Option<RemoteError>>>,
    task: JoinHandle<()>,
}

impl LineReader {
    pub fn spawn<R>(reader: R, capacity: usize, max_line_length: usize) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let death = Arc::new(Mutex::new(None));
        let framed = FramedRead::new(
            Box::new(reader) as BoxedRead,
            LineCodec::with_max_length(max_line_length),
        );
        let task = tokio::spawn(read_loop(framed, tx, Arc::clone(&death)));
        Self { rx, death, task }
    }

    /// Next line, `Ok(None)` if nothing arrived within `timeout`, or the
    /// stored death cause once the stream has ended.
    ///
    /// Lines buffered before the stream died are still delivered first.
    pub async fn next_line(&mut self, timeout: Duration) -> Result<Option<String>, RemoteError> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(line)) => {
                debug!("<< {line}");
                Ok(Some(line))
            }
            Ok(None) => Err(self.death_cause()),
            Err(_) => Ok(None),
        }
    }

    /// Whether the background reader has stopped.
    pub fn is_dead(&self) -> bool {
        self.death.lock().is_some()
    }

    /// Why the reader stopped (`ConnectionClosed` if it has not).
    pub fn death_cause(&self) -> RemoteError {
        self.death
            .lock()
            .clone()
            .unwrap_or(RemoteError::ConnectionClosed)
    }

    /// Stop reading. Further reads fail with the death cause.
    pub fn close(&mut self) {
        self.task.abort();
        self.rx.close();
        let mut death = self.death.lock();
        if death.is_none() {
            *death = Some(RemoteError::ConnectionClosed);
        }
    }
}

impl Drop for LineReader {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn read_loop(
    mut framed: FramedRead<BoxedRead, LineCodec>,
    tx: mpsc::Sender<String>,
    death: Arc<Mutex<Option<RemoteError>>>,
) {
    let cause = loop {
        match framed.next().await {
            Some(Ok(line)) => {
                if tx.send(line).await.is_err() {
                    // Consumer went away.
                    break RemoteError::ConnectionClosed;
                }
            }
            Some(Err(e)) => break e,
            None => break RemoteError::Eof,
        }
    };
    debug!("line reader stopped: {cause}");
    let mut slot = death.lock();
    if slot.is_none() {
        *slot = Some(cause);
    }
    // `tx` drops after the cause is stored, waking the consumer.
}

// ── LineWriter ───────────────────────────────────────────────────

/// Writes one line per call and flushes immediately.
pub struct LineWriter {
    sink: FramedWrite<BoxedWrite, LineCodec>,
}

impl LineWriter {
    pub fn new<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            sink: FramedWrite::new(Box::new(writer) as BoxedWrite, LineCodec::new()),
        }
    }

    pub async fn send_line(&mut self, line: &str) -> Result<(), RemoteError> {
        debug!(">> {line}");
        self.sink.send(line.to_string()).await
    }

    /// Flush and shut down the write half.
    pub async fn close(&mut self) -> Result<(), RemoteError> {
        SinkExt::close(&mut self.sink).await
    }
}

// ── Tests ────────────────────────────────────────────────────────
