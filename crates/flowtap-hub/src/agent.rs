use std::io;
use std::path::Path;
use std::sync::Arc;

use flowtap_core::{decode_chunk, ConnectionKey, DEFAULT_MAX_RECORD_BYTES};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::dispatch;
use crate::registry::ObserverRegistry;

pub const POLL_QUEUE_CAPACITY: usize = 64;
pub const READ_CHUNK_BYTES: usize = 64 * 1024;

/// Write side of the single connection to the tracing agent. Poll requests
/// from every poll loop are serialized through a queue into one writer
/// task; the key bytes go out raw, one write per poll, with no framing.
#[derive(Clone)]
pub struct AgentLink {
    poll_tx: mpsc::Sender<String>,
}

impl AgentLink {
    pub async fn connect(path: &Path) -> io::Result<(Self, OwnedReadHalf)> {
        let stream = UnixStream::connect(path).await?;
        info!(event = "trace_agent_connected", socket = %path.display());
        Ok(Self::from_stream(stream))
    }

    /// Splits an already-connected stream. The tests use this with a
    /// socketpair instead of a filesystem socket.
    pub fn from_stream(stream: UnixStream) -> (Self, OwnedReadHalf) {
        let (read_half, write_half) = stream.into_split();
        let (poll_tx, poll_rx) = mpsc::channel(POLL_QUEUE_CAPACITY);
        tokio::spawn(writer_loop(write_half, poll_rx));
        (Self { poll_tx }, read_half)
    }

    /// Asks the agent for one connection's current stats. Returns false
    /// once the writer task has died; callers log and move on, replies for
    /// earlier polls may still be in flight on the read side.
    pub async fn request_poll(&self, key: &ConnectionKey) -> bool {
        self.poll_tx.send(key.to_string()).await.is_ok()
    }
}

async fn writer_loop(mut writer: OwnedWriteHalf, mut poll_rx: mpsc::Receiver<String>) {
    while let Some(request) = poll_rx.recv().await {
        let send = async {
            writer.write_all(request.as_bytes()).await?;
            writer.flush().await
        };
        if let Err(err) = send.await {
            warn!(event = "trace_poll_write_error", error = %err);
            return;
        }
    }
}

/// Reads the agent stream in raw chunks and pushes each chunk's records
/// through the dispatcher. Malformed lines are logged and skipped. Ends
/// quietly on EOF or a read error; nothing reconnects, observers simply
/// stop hearing updates.
pub async fn run_reader(mut reader: OwnedReadHalf, registry: Arc<ObserverRegistry>) {
    let mut buf = vec![0u8; READ_CHUNK_BYTES];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => {
                warn!(event = "trace_stream_closed");
                return;
            }
            Ok(n) => n,
            Err(err) => {
                warn!(event = "trace_read_error", error = %err);
                return;
            }
        };
        let report = decode_chunk(&buf[..n], DEFAULT_MAX_RECORD_BYTES);
        for err in &report.errors {
            warn!(event = "trace_record_invalid", error = %err);
        }
        if !report.records.is_empty() {
            dispatch::dispatch_records(&registry, report.records).await;
        }
    }
}
