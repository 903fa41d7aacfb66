//! Port-forward pump.
//!
//! ```text
//!  local client ──TCP──▶ listener ──accept──▶ pipe ──open_forward──▶ remote
//!                                              ▲ copy local → remote │
//!                                              └─ copy remote → local┘
//! ```
//!
//! Each accepted connection gets its own remote stream and its own pipe
//! task. Both copy loops of a pipe are raced. When either direction sees
//! EOF or an error, the pipe drops both halves and the whole session ends,
//! along with any other connection still open on it. Cancel and listener
//! failure end the session too.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use kestrel_core::cancel::{self, CancelSignal};
use kestrel_core::{ClientError, ClusterClient, ForwardTarget};

use crate::registry::{Lease, ProcessState};

pub(crate) async fn run(
    listener: TcpListener,
    client: Arc<dyn ClusterClient>,
    target: ForwardTarget,
    mut cancel: CancelSignal,
    lease: Lease,
) {
    lease.set_state(ProcessState::Streaming);
    let session = lease.id();
    let mut pipes: JoinSet<Result<&'static str, ClientError>> = JoinSet::new();

    let reason = loop {
        tokio::select! {
            _ = cancel::cancelled(&mut cancel) => break "cancelled".to_string(),
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%session, %peer, "forward connection accepted");
                    pipes.spawn(pipe(stream, peer, client.clone(), target.clone()));
                }
                Err(e) => break format!("listener failed: {e}"),
            },
            Some(joined) = pipes.join_next() => break match joined {
                Ok(Ok(closed)) => format!("{closed} stream closed"),
                Ok(Err(e)) if e.is_transport() || e.is_not_found() => {
                    format!("remote unavailable: {e}")
                }
                Ok(Err(e)) => {
                    warn!(%session, error = %e, "forward connection failed");
                    format!("remote open failed: {e}")
                }
                Err(e) => {
                    warn!(%session, error = %e, "forward connection task failed");
                    format!("connection task failed: {e}")
                }
            },
        }
    };

    lease.set_state(ProcessState::Closing);
    pipes.shutdown().await;
    drop(listener);
    info!(%session, %target, %reason, "port-forward ended");
}

async fn pipe(
    mut local: TcpStream,
    peer: SocketAddr,
    client: Arc<dyn ClusterClient>,
    target: ForwardTarget,
) -> Result<&'static str, ClientError> {
    let remote = match client.open_forward(&target).await {
        Ok(remote) => remote,
        Err(e) => {
            let _ = local.shutdown().await;
            return Err(e);
        }
    };

    let (mut local_rx, mut local_tx) = local.split();
    let (mut remote_rx, mut remote_tx) = tokio::io::split(remote);

    let closed = tokio::select! {
        r = tokio::io::copy(&mut local_rx, &mut remote_tx) => {
            debug!(%peer, result = ?r, "local side finished");
            "local"
        }
        r = tokio::io::copy(&mut remote_rx, &mut local_tx) => {
            debug!(%peer, result = ?r, "remote side finished");
            "remote"
        }
    };
    Ok(closed)
}
