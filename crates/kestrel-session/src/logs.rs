//! Log-stream pump: a read-only pipe from the cluster to a local sink.
//!
//! Without a prefix, bytes are copied through as they arrive, partial lines
//! included. With a prefix the pump frames by line: each complete line is
//! written with its `[prefix] ` tag, and an unterminated last line is
//! terminated at end of stream so the next tagged line starts cleanly.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::{info, warn};

use kestrel_core::LogStream;
use kestrel_core::cancel::{self, CancelSignal};

use crate::registry::{Lease, ProcessState};

const CHUNK: usize = 8 * 1024;

/// Destination shared by every log session of a manager. Each chunk is
/// written under the lock, so tagged lines of concurrent tails never
/// interleave.
pub type LogSink = Arc<Mutex<Box<dyn AsyncWrite + Send + Unpin>>>;

/// A sink writing to the process's stdout.
pub fn stdout_sink() -> LogSink {
    let stdout: Box<dyn AsyncWrite + Send + Unpin> = Box::new(tokio::io::stdout());
    Arc::new(Mutex::new(stdout))
}

pub(crate) async fn run(
    stream: LogStream,
    prefix: Option<String>,
    sink: LogSink,
    mut cancel: CancelSignal,
    lease: Lease,
) {
    lease.set_state(ProcessState::Streaming);
    let session = lease.id();
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::with_capacity(CHUNK);
    let mut bytes = 0u64;

    let reason = loop {
        buf.clear();
        let read = tokio::select! {
            _ = cancel::cancelled(&mut cancel) => break "cancelled".to_string(),
            r = read_next(&mut reader, prefix.is_some(), &mut buf) => r,
        };
        match read {
            Ok(0) => break "end of stream".to_string(),
            Ok(n) => {
                if prefix.is_some() && !buf.ends_with(b"\n") {
                    buf.push(b'\n');
                }
                if let Err(e) = write_chunk(&sink, prefix.as_deref(), &buf).await {
                    break format!("sink closed: {e}");
                }
                bytes += n as u64;
            }
            Err(e) => {
                warn!(%session, error = %e, "log stream read failed");
                break format!("read failed: {e}");
            }
        }
    };

    lease.set_state(ProcessState::Closing);
    info!(%session, bytes, %reason, "log stream ended");
}

/// One line when framing, otherwise whatever is available.
async fn read_next(
    reader: &mut BufReader<LogStream>,
    by_line: bool,
    buf: &mut Vec<u8>,
) -> std::io::Result<usize> {
    if by_line {
        reader.read_until(b'\n', buf).await
    } else {
        buf.resize(CHUNK, 0);
        let n = reader.read(&mut buf[..]).await?;
        buf.truncate(n);
        Ok(n)
    }
}

async fn write_chunk(sink: &LogSink, prefix: Option<&str>, chunk: &[u8]) -> std::io::Result<()> {
    let mut out = sink.lock().await;
    if let Some(prefix) = prefix {
        out.write_all(format!("[{prefix}] ").as_bytes()).await?;
    }
    out.write_all(chunk).await?;
    out.flush().await
}
