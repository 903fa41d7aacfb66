//! Session manager — opens, tracks, and tears down ephemeral sessions.
//!
//! One manager is constructed per process and passed to whatever opens
//! sessions. It owns the registry and the port allocation policy. A
//! cleanup routine installed once at start closes every live session on
//! interrupt.

use std::collections::HashSet;
use std::future::Future;
use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

use kestrel_core::config::SessionsConfig;
use kestrel_core::{ClusterClient, ForwardTarget, LogOptions, LogSource};

use crate::error::{SessionError, SessionResult};
use crate::forward;
use crate::logs::{self, LogSink};
use crate::registry::{
    Lease, PortChoice, ProcessState, Registry, Reserved, SessionId, SessionInfo, SessionTarget,
};

/// A request to open one session.
#[derive(Debug, Clone)]
pub enum OpenRequest {
    /// Tail logs into the manager's sink. `prefix` tags every line.
    LogStream {
        source: LogSource,
        options: LogOptions,
        prefix: Option<String>,
    },
    /// Forward a local port to `target`. Without `local_port`, the first
    /// free port of the configured range is used.
    PortForward {
        target: ForwardTarget,
        local_port: Option<u16>,
    },
}

/// Handle to an opened session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub id: SessionId,
    pub local_port: Option<u16>,
    state: watch::Receiver<ProcessState>,
}

impl SessionHandle {
    /// Current lifecycle state.
    pub fn state(&self) -> ProcessState {
        *self.state.borrow()
    }

    /// Wait until the session has been cleaned up.
    pub async fn closed(&mut self) {
        let _ = self.state.wait_for(|s| *s == ProcessState::Closed).await;
    }
}

struct Inner {
    client: Arc<dyn ClusterClient>,
    registry: Registry,
    base_port: u16,
    port_range: u16,
    sink: LogSink,
    interrupt_installed: AtomicBool,
}

/// Opens and tracks log-stream and port-forward sessions.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    /// Create a manager that scans `port_range` ports starting at
    /// `base_port` when no local port is requested. Logs go to stdout.
    pub fn new(client: Arc<dyn ClusterClient>, base_port: u16, port_range: u16) -> Self {
        Self::with_log_sink(client, base_port, port_range, logs::stdout_sink())
    }

    pub fn from_config(client: Arc<dyn ClusterClient>, config: &SessionsConfig) -> Self {
        Self::new(client, config.base_port, config.port_range)
    }

    /// Like [`new`](Self::new), writing log lines to `sink`.
    pub fn with_log_sink(
        client: Arc<dyn ClusterClient>,
        base_port: u16,
        port_range: u16,
        sink: LogSink,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                client,
                registry: Registry::default(),
                base_port,
                port_range,
                sink,
                interrupt_installed: AtomicBool::new(false),
            }),
        }
    }

    /// Open a session.
    pub async fn open(&self, request: OpenRequest) -> SessionResult<SessionHandle> {
        match request {
            OpenRequest::LogStream {
                source,
                options,
                prefix,
            } => self.open_log_stream(source, options, prefix).await,
            OpenRequest::PortForward { target, local_port } => {
                self.open_port_forward(target, local_port).await
            }
        }
    }

    /// Open a log tail. Fails if the stream cannot be opened.
    pub async fn open_log_stream(
        &self,
        source: LogSource,
        options: LogOptions,
        prefix: Option<String>,
    ) -> SessionResult<SessionHandle> {
        let (lease, cancel) = self
            .inner
            .registry
            .register(SessionTarget::LogStream(source.clone()));
        // On error the lease drops here and the entry goes with it.
        let stream = self.inner.client.open_log_stream(&source, &options).await?;

        let handle = SessionHandle {
            id: lease.id(),
            local_port: None,
            state: lease.subscribe(),
        };
        info!(session = %handle.id, %source, follow = options.follow, "log stream opened");
        tokio::spawn(logs::run(
            stream,
            prefix,
            self.inner.sink.clone(),
            cancel,
            lease,
        ));
        Ok(handle)
    }

    /// Bind a local port and forward every connection on it to `target`.
    pub async fn open_port_forward(
        &self,
        target: ForwardTarget,
        local_port: Option<u16>,
    ) -> SessionResult<SessionHandle> {
        let (lease, cancel) = self
            .inner
            .registry
            .register(SessionTarget::PortForward(target.clone()));
        let (listener, port) = self.bind(&lease, local_port).await?;

        let handle = SessionHandle {
            id: lease.id(),
            local_port: Some(port),
            state: lease.subscribe(),
        };
        info!(session = %handle.id, %target, local_port = port, "port-forward opened");
        tokio::spawn(forward::run(
            listener,
            self.inner.client.clone(),
            target,
            cancel,
            lease,
        ));
        Ok(handle)
    }

    /// Reserve a port for `lease` and bind it. The reservation is made
    /// under the registry lock; the bind happens outside it.
    async fn bind(
        &self,
        lease: &Lease,
        requested: Option<u16>,
    ) -> SessionResult<(TcpListener, u16)> {
        let choice = match requested {
            Some(0) => return Err(SessionError::ZeroPort),
            Some(port) => PortChoice::Exact(port),
            None => PortChoice::Scan {
                base: self.inner.base_port,
                count: self.inner.port_range,
            },
        };
        let mut failed = HashSet::new();

        loop {
            let port = match self.inner.registry.reserve_port(lease.id(), choice, &failed) {
                Reserved::Port(port) => port,
                Reserved::Taken(port) => return Err(SessionError::PortInUse(port)),
                Reserved::Exhausted => {
                    return Err(SessionError::NoAvailablePort {
                        base: self.inner.base_port,
                        count: self.inner.port_range,
                    });
                }
            };

            let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
            match TcpListener::bind(addr).await {
                Ok(listener) => return Ok((listener, port)),
                Err(e) if e.kind() == ErrorKind::AddrInUse => {
                    if requested.is_some() {
                        return Err(SessionError::PortInUse(port));
                    }
                    failed.insert(port);
                }
                Err(e) => return Err(SessionError::Bind { port, source: e }),
            }
        }
    }

    /// Close one session and wait for its cleanup to finish.
    pub async fn close(&self, id: SessionId) -> SessionResult<()> {
        let mut state = self
            .inner
            .registry
            .request_close(id)
            .ok_or(SessionError::NotFound(id))?;
        let _ = state.wait_for(|s| *s == ProcessState::Closed).await;
        Ok(())
    }

    /// Close every live session and wait for all of them.
    pub async fn close_all(&self) {
        let pending: Vec<_> = self
            .inner
            .registry
            .ids()
            .into_iter()
            .filter_map(|id| self.inner.registry.request_close(id))
            .collect();
        if pending.is_empty() {
            return;
        }
        info!(sessions = pending.len(), "closing all sessions");
        for mut state in pending {
            let _ = state.wait_for(|s| *s == ProcessState::Closed).await;
        }
    }

    /// Snapshot of live sessions, ordered by id.
    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.inner.registry.snapshot()
    }

    /// Close every session once `trigger` resolves. Runs in the background.
    pub fn close_all_on<F>(&self, trigger: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let manager = self.clone();
        tokio::spawn(async move {
            trigger.await;
            manager.close_all().await;
        });
    }

    /// Close every session on Ctrl-C. Installed at most once per manager;
    /// returns `false` if already installed.
    pub fn install_interrupt_handler(&self) -> bool {
        if self.inner.interrupt_installed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.close_all_on(async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("interrupt received"),
                Err(e) => {
                    warn!(error = %e, "failed to listen for interrupt");
                    std::future::pending::<()>().await;
                }
            }
        });
        true
    }
}
