//! TCP server loop.
//!
//! One reader and one writer per connection. The reader decodes frames and
//! submits them to the arbiter service through the connection's
//! [`SessionGuard`]; the writer drains the session's outbound channel onto
//! the socket. When the reader ends for any reason the guard drops and the
//! session's capacity is reclaimed.

use std::net::SocketAddr;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::info;

use crate::bridge::codec::{JsonCodec, ValidatingCodec};
use crate::bridge::protocol::{ClientMessage, ServerMessage, SessionId};
use crate::config::QuotaConfig;
use crate::service::{ArbiterHandle, SessionGuard, spawn_arbiter};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 4000,
        }
    }
}

/// Bind, serve until SIGINT/SIGTERM or `shutdown_rx` flips to true, then stop.
pub async fn serve(
    config: ServerConfig,
    quotas: QuotaConfig,
    shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let listener = TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    info!("Starting arbiter on {}", actual_addr);

    let (handle, arbiter_task) = spawn_arbiter(quotas);
    serve_listener(listener, handle, shutdown_signal(shutdown_rx)).await;

    info!("Server shutdown complete");

    // Connections are gone once serve_listener returns; the task drains and exits.
    if let Err(e) = arbiter_task.await {
        tracing::error!(error = %e, "Arbiter task failed");
    }

    Ok(())
}

/// Accept on an already-bound listener until `shutdown` completes.
///
/// Open connections are aborted on shutdown; their session guards drop and
/// release whatever they held.
pub async fn serve_listener(
    listener: TcpListener,
    handle: ArbiterHandle,
    shutdown: impl std::future::Future<Output = ()>,
) {
    let mut connections = tokio::task::JoinSet::new();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let handle = handle.clone();
                        connections.spawn(async move {
                            handle_connection(stream, peer, handle).await;
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to accept connection");
                    }
                }
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    info!(open = connections.len(), "Closing connections");
    connections.shutdown().await;
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, handle: ArbiterHandle) {
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(%peer, error = %e, "Failed to set TCP_NODELAY");
    }

    let (guard, outbound_rx) = match handle.open_session() {
        Ok(session) => session,
        Err(e) => {
            tracing::warn!(%peer, error = %e, "Refusing connection");
            return;
        }
    };
    let session = guard.id();
    tracing::debug!(%peer, %session, "Connection accepted");

    let (read_half, write_half) = stream.into_split();
    let writer = tokio::spawn(write_loop(
        FramedWrite::new(write_half, JsonCodec::<ServerMessage>::new()),
        outbound_rx,
        session,
    ));

    read_loop(
        FramedRead::new(read_half, ValidatingCodec::<ClientMessage>::new()),
        &guard,
    )
    .await;

    // Disconnect first so the arbiter drops our outbound sender and the writer finishes.
    drop(guard);
    if let Err(e) = writer.await {
        tracing::debug!(%session, error = %e, "Writer task ended abnormally");
    }
    tracing::debug!(%peer, %session, "Connection closed");
}

async fn read_loop(
    mut reader: FramedRead<tokio::net::tcp::OwnedReadHalf, ValidatingCodec<ClientMessage>>,
    guard: &SessionGuard,
) {
    let session = guard.id();
    while let Some(frame) = reader.next().await {
        let submitted = match frame {
            Ok(Ok(message)) => guard.submit(message),
            Ok(Err(malformed)) => guard.reject(malformed),
            Err(e) => {
                tracing::warn!(%session, error = %e, "Frame error, closing connection");
                return;
            }
        };
        if submitted.is_err() {
            tracing::warn!(%session, "Arbiter stopped, closing connection");
            return;
        }
    }
}

async fn write_loop(
    mut writer: FramedWrite<tokio::net::tcp::OwnedWriteHalf, JsonCodec<ServerMessage>>,
    mut outbound_rx: mpsc::UnboundedReceiver<ServerMessage>,
    session: SessionId,
) {
    while let Some(message) = outbound_rx.recv().await {
        if let Err(e) = writer.send(message).await {
            tracing::debug!(%session, error = %e, "Write failed");
            return;
        }
    }
}

/// Wait for SIGINT, SIGTERM, or an explicit shutdown request.
///
/// # Panics
///
/// Panics if signal handlers cannot be installed. That only happens when the
/// tokio runtime is misconfigured, which should fail fast at startup.
pub async fn shutdown_signal(mut shutdown_rx: watch::Receiver<bool>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler - is tokio runtime configured correctly?");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler - is tokio runtime configured correctly?")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let explicit_shutdown = async {
        while !*shutdown_rx.borrow() {
            if shutdown_rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT, shutting down...");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down...");
        }
        _ = explicit_shutdown => {
            info!("Shutdown requested...");
        }
    }
}
