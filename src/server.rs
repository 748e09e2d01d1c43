//! TCP server for edge device connections.
//!
//! Registers the model, accepts connections, and runs one task per
//! connection. Each task owns a fresh [`Session`] and processes that
//! connection's frames strictly in arrival order.

use crate::config::Config;
use crate::protocol::{decode_frame, Frame, FrameError};
use crate::service::{ModelService, ServiceError};
use crate::session::{Session, SessionConfig};
use bytes::{Buf, BytesMut};
use futures::FutureExt;
use std::future::Future;
use std::io;
use std::panic::AssertUnwindSafe;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

/// Read buffer size
const BUFFER_SIZE: usize = 4 * 1024;

/// Listen backlog
const BACKLOG: i32 = 1024;

/// Errors that prevent the server from starting
#[derive(Debug)]
pub enum StartupError {
    /// The model service refused or could not create the model
    Register(ServiceError),
    /// The listen address did not resolve
    InvalidAddress(String),
    /// The listening socket could not be set up
    Bind(SocketAddr, io::Error),
}

impl std::fmt::Display for StartupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StartupError::Register(e) => write!(f, "Failed to register model: {}", e),
            StartupError::InvalidAddress(addr) => write!(f, "Invalid listen address '{}'", addr),
            StartupError::Bind(addr, e) => write!(f, "Failed to bind {}: {}", addr, e),
        }
    }
}

impl std::error::Error for StartupError {}

/// Errors that end a single connection
#[derive(Debug)]
pub enum ConnectionError {
    Io(io::Error),
    /// Peer hung up in the middle of a frame
    Frame(FrameError),
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionError::Io(e) => write!(f, "I/O error: {}", e),
            ConnectionError::Frame(e) => write!(f, "Framing error: {}", e),
        }
    }
}

impl std::error::Error for ConnectionError {}

impl From<io::Error> for ConnectionError {
    fn from(e: io::Error) -> Self {
        ConnectionError::Io(e)
    }
}

/// Server instance
pub struct Server {
    listener: TcpListener,
    service: Arc<dyn ModelService>,
    session: SessionConfig,
    connection_limit: Arc<Semaphore>,
    max_connections: usize,
    shutdown_grace: Duration,
}

impl Server {
    /// Register the model and bind the listening socket.
    ///
    /// Nothing is bound if registration fails.
    pub async fn start(
        config: &Config,
        service: Arc<dyn ModelService>,
    ) -> Result<Self, StartupError> {
        service
            .register_model(&config.model)
            .await
            .map_err(StartupError::Register)?;
        info!(
            name = %config.model.name,
            algorithm = %config.model.algorithm,
            dimension = config.model.dimension,
            index = config.model.index,
            "Model registered"
        );

        let addr = tokio::net::lookup_host(&config.listen)
            .await
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or_else(|| StartupError::InvalidAddress(config.listen.clone()))?;
        let listener = create_listener(addr).map_err(|e| StartupError::Bind(addr, e))?;

        Ok(Server {
            listener,
            service,
            session: config.session(),
            connection_limit: Arc::new(Semaphore::new(config.max_connections)),
            max_connections: config.max_connections,
            shutdown_grace: config.shutdown_grace,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `shutdown` resolves.
    ///
    /// On shutdown the listener is closed and in-flight connections get the
    /// configured grace period to finish.
    pub async fn run<F>(self, shutdown: F) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
    where
        F: Future<Output = ()>,
    {
        info!(
            address = %self.listener.local_addr()?,
            train_samples = self.session.train_target,
            test_samples = self.session.test_target,
            "Server listening"
        );
        tokio::pin!(shutdown);

        loop {
            // Wait for a connection slot
            let permit = tokio::select! {
                _ = &mut shutdown => break,
                permit = self.connection_limit.clone().acquire_owned() => permit?,
            };

            let (stream, peer) = tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                        continue;
                    }
                },
            };

            info!(peer = %peer, "New connection");
            let session = Session::new(&self.session, Arc::clone(&self.service));

            tokio::spawn(
                async move {
                    match handle_connection(stream, session).await {
                        Ok(()) => info!("Connection closed"),
                        Err(e) => warn!(error = %e, "Connection closed"),
                    }
                    drop(permit);
                }
                .instrument(info_span!("conn", peer = %peer)),
            );
        }

        drop(self.listener);
        info!("Stopped accepting connections");

        let in_flight = self.max_connections - self.connection_limit.available_permits();
        if in_flight > 0 {
            info!(in_flight, "Waiting for connections to finish");
            let all = u32::try_from(self.max_connections).unwrap_or(u32::MAX);
            match tokio::time::timeout(self.shutdown_grace, self.connection_limit.acquire_many(all))
                .await
            {
                Ok(_) => info!("All connections finished"),
                Err(_) => warn!(
                    remaining = self.max_connections - self.connection_limit.available_permits(),
                    "Shutdown grace period elapsed"
                ),
            }
        }

        Ok(())
    }
}

/// Create a TCP listener with SO_REUSEADDR so restarts can rebind at once.
fn create_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(BACKLOG)?;

    TcpListener::from_std(socket.into())
}

/// Handle a single device connection.
///
/// Returns `Ok` when the peer closes cleanly between frames. A peer that
/// hangs up mid-frame is a framing error; nothing is sent back for it.
/// A panic while processing a frame is answered with an error frame and the
/// connection carries on. Only socket I/O failures end it early.
pub(crate) async fn handle_connection<S>(
    mut stream: S,
    mut session: Session,
) -> Result<(), ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buffer = BytesMut::with_capacity(BUFFER_SIZE);
    let mut output = BytesMut::with_capacity(BUFFER_SIZE);

    loop {
        // Process every complete frame before reading again
        let pending = loop {
            match decode_frame(&buffer) {
                Ok((frame, consumed)) => {
                    buffer.advance(consumed);
                    trace!(
                        message_type = frame.message_type(),
                        length = frame.payload().len(),
                        "Frame received"
                    );

                    match AssertUnwindSafe(session.handle(&frame)).catch_unwind().await {
                        Ok(responses) => {
                            for response in responses {
                                response.encode_into(&mut output);
                            }
                        }
                        Err(_) => {
                            error!(
                                message_type = frame.message_type(),
                                "Panic while processing message"
                            );
                            Frame::error("Internal error processing message")
                                .encode_into(&mut output);
                        }
                    }
                    stream.write_all(&output).await?;
                    output.clear();
                }
                Err(e) => break e,
            }
        };

        let n = stream.read_buf(&mut buffer).await?;
        if n == 0 {
            if buffer.is_empty() {
                debug!(
                    samples = session.samples_seen(),
                    phase = ?session.phase(),
                    "Connection closed by client"
                );
                return Ok(());
            }
            return Err(ConnectionError::Frame(pending));
        }
    }
}
