use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error as ThisError;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};
use uuid::Uuid;

use crate::config::Config;
use crate::handler::{ConnContext, Handler, HandlerError};

/// Consecutive accept timeouts tolerated before the error is returned.
const MAX_ACCEPT_RETRIES: u32 = 5;

#[derive(Debug, ThisError)]
pub enum ServerError {
    #[error("server already stopped")]
    Stopped,
    #[error("invalid listener: {0}")]
    InvalidListener(#[source] io::Error),
    #[error("unsupported protocol: {0}")]
    UnsupportedProtocol(Transport),
    #[error("server closed connection timeout")]
    ShutdownTimeout,
    #[error("failed to close {} handler(s): {}", .0.len(), join_errors(.0))]
    Close(Vec<HandlerError>),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("accept failed: {0}")]
    Io(#[from] io::Error),
}

fn join_errors(errors: &[HandlerError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Transport family of a listener. Only `Tcp` is served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tcp,
    Unix,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Tcp => write!(f, "tcp"),
            Transport::Unix => write!(f, "unix"),
        }
    }
}

/// A source of connections. Dropping the listener closes it.
pub trait Listener: Send + 'static {
    type Conn: Send + 'static;

    fn transport(&self) -> Transport;

    fn local_addr(&self) -> io::Result<String>;

    /// Waits for the next connection and returns it with the peer address.
    fn accept(&mut self) -> impl Future<Output = io::Result<(Self::Conn, String)>> + Send;
}

impl Listener for TcpListener {
    type Conn = TcpStream;

    fn transport(&self) -> Transport {
        Transport::Tcp
    }

    fn local_addr(&self) -> io::Result<String> {
        TcpListener::local_addr(self).map(|addr| addr.to_string())
    }

    fn accept(&mut self) -> impl Future<Output = io::Result<(TcpStream, String)>> + Send {
        async move {
            let (stream, addr) = TcpListener::accept(self).await?;
            Ok((stream, addr.to_string()))
        }
    }
}

#[cfg(unix)]
impl Listener for tokio::net::UnixListener {
    type Conn = tokio::net::UnixStream;

    fn transport(&self) -> Transport {
        Transport::Unix
    }

    fn local_addr(&self) -> io::Result<String> {
        tokio::net::UnixListener::local_addr(self).map(|addr| format!("{:?}", addr))
    }

    fn accept(
        &mut self,
    ) -> impl Future<Output = io::Result<(tokio::net::UnixStream, String)>> + Send {
        async move {
            let (stream, addr) = tokio::net::UnixListener::accept(self).await?;
            Ok((stream, format!("{:?}", addr)))
        }
    }
}

type CloseFn = Box<dyn FnOnce() -> Result<(), HandlerError> + Send>;

struct Registration {
    addr: String,
    /// Cancelling it makes the accept loop drop its listener and exit.
    stop: CancellationToken,
    /// Taken by `shutdown`, so a handler registered once is closed at most once.
    close: Option<CloseFn>,
}

struct State {
    next_id: u64,
    registrations: HashMap<u64, Registration>,
    connections: usize,
}

struct Shared {
    state: Mutex<State>,
    shutdown: AtomicBool,
    /// Parent of every connection's cancellation token.
    token: CancellationToken,
    /// Number of accept loops still running.
    active_loops: watch::Sender<usize>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Runs accept loops for any number of (listener, handler) pairs and shuts them all down
/// together.
///
/// Cloning is cheap; clones drive the same server.
#[derive(Clone)]
pub struct Server {
    config: Config,
    shutdown_timeout: Duration,
    shared: Arc<Shared>,
}

impl Server {
    pub fn new(config: Config) -> Result<Server, ServerError> {
        Self::with_token(config, CancellationToken::new())
    }

    /// Like [`Server::new`], with connection tokens derived from `token`. Cancelling it cancels
    /// every connection without shutting the listeners down.
    pub fn with_token(config: Config, token: CancellationToken) -> Result<Server, ServerError> {
        let (config, shutdown_timeout) = config.normalize().map_err(ServerError::Config)?;
        let (active_loops, _) = watch::channel(0);

        let state = State {
            next_id: 0,
            registrations: HashMap::new(),
            connections: 0,
        };

        Ok(Server {
            config,
            shutdown_timeout,
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                shutdown: AtomicBool::new(false),
                token,
                active_loops,
            }),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.shutdown.load(Ordering::SeqCst)
    }

    /// Live connections across all listeners.
    pub fn connections(&self) -> usize {
        self.shared.lock().connections
    }

    /// Accept loops currently registered.
    pub fn listeners(&self) -> usize {
        self.shared.lock().registrations.len()
    }

    /// Accepts connections from `listener` and hands each one to `handler` on its own task.
    ///
    /// Runs until the listener fails or the server shuts down, in which case it returns
    /// `ServerError::Stopped`. Accept timeouts are retried up to five times in a row.
    #[instrument(name = "serve", skip_all, fields(registration_id, addr))]
    pub async fn serve<L, H>(&self, listener: L, handler: Arc<H>) -> Result<(), ServerError>
    where
        L: Listener,
        H: Handler<L::Conn>,
    {
        let addr = listener
            .local_addr()
            .map_err(ServerError::InvalidListener)?;

        let transport = listener.transport();
        if transport != Transport::Tcp {
            if let Err(err) = handler.close() {
                debug!(error = %err, "failed to close handler of rejected listener");
            }
            drop(listener);
            return Err(ServerError::UnsupportedProtocol(transport));
        }

        let close_handler = Arc::clone(&handler);
        let (id, stop) = self.register(&addr, Box::new(move || close_handler.close()))?;
        let registration = RegistrationGuard {
            shared: Arc::clone(&self.shared),
            id,
        };

        tracing::Span::current()
            .record("registration_id", id)
            .record("addr", addr.as_str());
        info!("server is listening on {}", addr);

        let mut listener = listener;
        let result = self.accept_loop(&mut listener, &handler, &stop).await;

        // Close the listener before the loop is reported as finished.
        drop(listener);
        drop(registration);

        match &result {
            Err(ServerError::Stopped) => info!("accept loop stopped"),
            Err(err) => error!(error = %err, "accept loop failed"),
            Ok(()) => {}
        }

        result
    }

    fn register(
        &self,
        addr: &str,
        close: CloseFn,
    ) -> Result<(u64, CancellationToken), ServerError> {
        let mut state = self.shared.lock();

        // Checked under the lock: `shutdown` raises the flag before taking it, so nothing can
        // register after shutdown has walked the registry.
        if self.is_shutdown() {
            return Err(ServerError::Stopped);
        }

        let id = state.next_id;
        state.next_id += 1;

        let stop = CancellationToken::new();
        state.registrations.insert(
            id,
            Registration {
                addr: addr.to_string(),
                stop: stop.clone(),
                close: Some(close),
            },
        );
        self.shared
            .active_loops
            .send_replace(state.registrations.len());

        Ok((id, stop))
    }

    async fn accept_loop<L, H>(
        &self,
        listener: &mut L,
        handler: &Arc<H>,
        stop: &CancellationToken,
    ) -> Result<(), ServerError>
    where
        L: Listener,
        H: Handler<L::Conn>,
    {
        let mut timeouts = 0;

        loop {
            let accepted = tokio::select! {
                biased;
                _ = stop.cancelled() => return Err(ServerError::Stopped),
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((conn, peer)) => {
                    timeouts = 0;
                    self.dispatch(conn, peer, handler);
                }
                // The listener fails as soon as it is closed by a shutdown.
                Err(_) if self.is_shutdown() => return Err(ServerError::Stopped),
                Err(err)
                    if err.kind() == io::ErrorKind::TimedOut && timeouts < MAX_ACCEPT_RETRIES =>
                {
                    timeouts += 1;
                    warn!(
                        attempt = timeouts,
                        "accept timed out, retrying in {:?}", self.config.retry_delay
                    );
                    tokio::select! {
                        _ = stop.cancelled() => return Err(ServerError::Stopped),
                        _ = time::sleep(self.config.retry_delay) => {}
                    }
                }
                Err(err) => return Err(ServerError::Io(err)),
            }
        }
    }

    fn dispatch<C, H>(&self, conn: C, peer: String, handler: &Arc<H>)
    where
        C: Send + 'static,
        H: Handler<C>,
    {
        let connections = {
            let mut state = self.shared.lock();
            if state.connections >= self.config.max_connections {
                let connections = state.connections;
                drop(state);
                warn!(
                    peer = %peer,
                    connections,
                    "connection limit reached, refusing connection"
                );
                return;
            }
            state.connections += 1;
            state.connections
        };

        let ctx = ConnContext {
            id: Uuid::new_v4(),
            peer,
            token: self.shared.token.child_token(),
            timeout: self.config.timeout,
            max_frame_size: self.config.max_frame_size,
        };
        info!(
            connections,
            "[{}] connection established: {}", ctx.id, ctx.peer
        );

        let span = info_span!("connection", connection_id = %ctx.id, peer = %ctx.peer);
        let guard = ConnectionGuard {
            shared: Arc::clone(&self.shared),
        };
        let handler = Arc::clone(handler);

        tokio::spawn(
            async move {
                // Released even if the handler panics.
                let _guard = guard;
                handler.handle(ctx, conn).await;
            }
            .instrument(span),
        );
    }

    /// Stops every accept loop and asks every handler to close its connections.
    ///
    /// Handler close errors are collected into `ServerError::Close`. If the accept loops have not
    /// all exited within the shutdown timeout, `ServerError::ShutdownTimeout` is returned instead:
    /// the shutdown was requested but its completion is unconfirmed. A second call returns
    /// `ServerError::Stopped`.
    pub async fn shutdown(&self) -> Result<(), ServerError> {
        if self.shared.shutdown.swap(true, Ordering::SeqCst) {
            return Err(ServerError::Stopped);
        }

        let errors = self.close_registrations();

        let mut active_loops = self.shared.active_loops.subscribe();
        let finished = matches!(
            time::timeout(self.shutdown_timeout, active_loops.wait_for(|n| *n == 0)).await,
            Ok(Ok(_))
        );

        self.shared.token.cancel();

        if !finished {
            warn!(
                "accept loops did not exit within {:?}",
                self.shutdown_timeout
            );
            return Err(ServerError::ShutdownTimeout);
        }

        info!("server stopped");
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ServerError::Close(errors))
        }
    }

    fn close_registrations(&self) -> Vec<HandlerError> {
        let mut state = self.shared.lock();
        info!(listeners = state.registrations.len(), "shutting down");

        let mut errors = Vec::new();
        for (id, registration) in state.registrations.iter_mut() {
            // Refuse new connections first.
            registration.stop.cancel();

            // How the existing connections are closed is up to the handler.
            if let Some(close) = registration.close.take() {
                if let Err(err) = close() {
                    warn!(
                        registration_id = id,
                        addr = %registration.addr,
                        error = %err,
                        "failed to close handler"
                    );
                    errors.push(err);
                }
            }
        }

        errors
    }
}

struct RegistrationGuard {
    shared: Arc<Shared>,
    id: u64,
}

impl Drop for RegistrationGuard {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        state.registrations.remove(&self.id);
        self.shared
            .active_loops
            .send_replace(state.registrations.len());
    }
}

struct ConnectionGuard {
    shared: Arc<Shared>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        state.connections = state.connections.saturating_sub(1);
    }
}
