//! Restartable TCP listener
//!
//! A [`ManagedListener`] moves between three states:
//!
//! ```text
//!            start()              close()
//!  Stopped ───────────▶ Started ──────────▶ Closed
//!     ▲                    │                  ▲
//!     └──────  stop() ─────┘                  │
//!     └─────────────────── close() ───────────┘
//! ```
//!
//! The bound socket is published through a [`ValueGate`]. `accept` waits on
//! the gate, so callers parked while the listener is stopped simply resume
//! once it is started again. Stopping closes the socket out from under any
//! in-flight accept; the resulting closed-socket error is swallowed unless the
//! listener has been closed for good.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::value_gate::ValueGate;

/// How long `stop` waits for in-flight accepts to release the socket
const SOCKET_RELEASE_TIMEOUT: Duration = Duration::from_secs(5);

/// Lifecycle state of a [`ManagedListener`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    /// Not accepting; `start` binds again
    Stopped,
    /// Bound and accepting
    Started,
    /// Terminal
    Closed,
}

/// Errors returned from listener transitions
#[derive(Debug, Error)]
pub enum ListenerError {
    /// `start` on a started listener
    #[error("listener already started")]
    AlreadyStarted,

    /// `stop` on a stopped listener
    #[error("listener already stopped")]
    AlreadyStopped,

    /// Any transition other than `close` after `close`
    #[error("listener is closed")]
    Closed,

    /// Binding the address failed
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address that was being bound
        addr: SocketAddr,
        /// Underlying error
        #[source]
        source: io::Error,
    },
}

/// Marker carried inside the `io::Error` returned when the socket was closed
#[derive(Debug)]
struct ListenerClosed;

impl fmt::Display for ListenerClosed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("use of closed network connection")
    }
}

impl std::error::Error for ListenerClosed {}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, ListenerClosed)
}

/// Whether an accept error was caused by the listener's socket being closed
pub fn is_listener_closed(err: &io::Error) -> bool {
    err.get_ref()
        .is_some_and(|inner| inner.is::<ListenerClosed>())
}

/// A bound socket as published through the gate
///
/// Field order matters: the listener is dropped (closing the descriptor)
/// before `released` fires.
struct Socket {
    listener: Option<TcpListener>,
    closed: CancellationToken,
    _released: Option<oneshot::Sender<()>>,
}

impl Socket {
    fn bound(listener: TcpListener, released: oneshot::Sender<()>) -> Self {
        Self {
            listener: Some(listener),
            closed: CancellationToken::new(),
            _released: Some(released),
        }
    }

    /// Placeholder published after `close` so parked accepts wake and fail
    fn tombstone() -> Self {
        let closed = CancellationToken::new();
        closed.cancel();
        Self {
            listener: None,
            closed,
            _released: None,
        }
    }

    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        let Some(listener) = &self.listener else {
            return Err(closed_error());
        };
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(closed_error()),
            accepted = listener.accept() => accepted,
        }
    }
}

struct Inner {
    state: ListenerState,
    local_addr: Option<SocketAddr>,
    released: Option<oneshot::Receiver<()>>,
}

/// TCP listener that can be stopped and restarted on the same address
pub struct ManagedListener {
    addr: SocketAddr,
    gate: ValueGate<Arc<Socket>>,
    inner: Mutex<Inner>,
}

impl ManagedListener {
    /// New listener in the `Stopped` state; nothing is bound yet
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            gate: ValueGate::new(),
            inner: Mutex::new(Inner {
                state: ListenerState::Stopped,
                local_addr: None,
                released: None,
            }),
        }
    }

    /// Configured bind address, regardless of state
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Address actually bound while started (differs from `addr` for port 0)
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.lock().await.local_addr
    }

    /// Current lifecycle state
    pub async fn state(&self) -> ListenerState {
        self.inner.lock().await.state
    }

    /// Whether `close` has been called
    pub async fn is_closed(&self) -> bool {
        self.state().await == ListenerState::Closed
    }

    /// Bind the address and begin accepting
    pub async fn start(&self) -> Result<(), ListenerError> {
        let mut inner = self.inner.lock().await;
        match inner.state {
            ListenerState::Started => return Err(ListenerError::AlreadyStarted),
            ListenerState::Closed => return Err(ListenerError::Closed),
            ListenerState::Stopped => {}
        }

        let listener = TcpListener::bind(self.addr)
            .await
            .map_err(|source| ListenerError::Bind {
                addr: self.addr,
                source,
            })?;
        let local_addr = listener.local_addr().ok();
        let (released_tx, released_rx) = oneshot::channel();
        self.gate
            .set(Arc::new(Socket::bound(listener, released_tx)));

        inner.state = ListenerState::Started;
        inner.local_addr = local_addr;
        inner.released = Some(released_rx);
        info!(addr = %self.addr, local_addr = ?local_addr, "listener started");
        Ok(())
    }

    /// Close the socket and stop accepting until the next `start`
    ///
    /// Accept calls in flight are not failed; they wait for the restart.
    pub async fn stop(&self) -> Result<(), ListenerError> {
        let mut inner = self.inner.lock().await;
        match inner.state {
            ListenerState::Stopped => return Err(ListenerError::AlreadyStopped),
            ListenerState::Closed => return Err(ListenerError::Closed),
            ListenerState::Started => {}
        }

        inner.state = ListenerState::Stopped;
        self.release_socket(&mut inner).await;
        info!(addr = %self.addr, "listener stopped");
        Ok(())
    }

    /// Close permanently; pending and future accepts fail
    ///
    /// Closing an already closed listener is a no-op.
    pub async fn close(&self) -> Result<(), ListenerError> {
        let mut inner = self.inner.lock().await;
        match inner.state {
            ListenerState::Closed => return Ok(()),
            ListenerState::Started => {
                inner.state = ListenerState::Closed;
                self.release_socket(&mut inner).await;
            }
            ListenerState::Stopped => {
                inner.state = ListenerState::Closed;
            }
        }
        self.gate.set(Arc::new(Socket::tombstone()));
        info!(addr = %self.addr, "listener closed");
        Ok(())
    }

    /// Wait for the next inbound connection
    ///
    /// Blocks while the listener is stopped. Only fails once the listener is
    /// closed, or on accept errors unrelated to stopping.
    pub async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        loop {
            let socket = self.gate.load().await;
            let result = socket.accept().await;
            // Must not hold the socket while waiting on the state lock, `stop`
            // holds that lock until every reference is gone
            drop(socket);

            match result {
                Ok(conn) => return Ok(conn),
                Err(e) if is_listener_closed(&e) => {
                    if self.inner.lock().await.state == ListenerState::Closed {
                        return Err(e);
                    }
                    debug!(addr = %self.addr, "accept interrupted by stop, waiting for restart");
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn release_socket(&self, inner: &mut Inner) {
        if let Some(socket) = self.gate.unset() {
            socket.closed.cancel();
        }
        inner.local_addr = None;
        if let Some(released) = inner.released.take() {
            if tokio::time::timeout(SOCKET_RELEASE_TIMEOUT, released)
                .await
                .is_err()
            {
                warn!(addr = %self.addr, "timed out waiting for in-flight accepts to release the socket");
            }
        }
    }
}

impl fmt::Debug for ManagedListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedListener")
            .field("addr", &self.addr)
            .finish_non_exhaustive()
    }
}
