//! Client stub for application code.
//!
//! ```ignore
//! let client = ArbiterClient::connect("arbiter:4000").await?;
//! let permit = client.acquire("10.0.0.5:8000", "read").await?;
//! // ... talk to the backend ...
//! permit.release().await?;
//! ```
//!
//! One TCP connection per client, shared by clones. Each request registers a
//! oneshot waiter keyed by its request id; the connection's reader task wakes
//! it when the matching response arrives. Dropping an unfinished acquire (for
//! example on timeout) cancels it on the server, and a grant that arrives
//! after the caller gave up is released straight away.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::JsonCodec;
use crate::bridge::protocol::{
    ClientMessage, EntryStats, ErrorKind, OperationClass, RequestId, ResourceKey, ServerMessage,
    UNIT_WEIGHT,
};
use crate::config::QuotaConfig;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("arbiter connection failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection to arbiter lost")]
    Disconnected,

    #[error("timed out waiting for {resource}/{class}")]
    Timeout {
        resource: ResourceKey,
        class: OperationClass,
    },

    #[error("arbiter rejected request ({kind}): {message}")]
    Rejected { kind: ErrorKind, message: String },

    #[error("arbiter client is disabled")]
    Disabled,

    #[error("unexpected response from arbiter: {0}")]
    Unexpected(String),
}

fn into_error(message: ServerMessage) -> ClientError {
    match message {
        ServerMessage::Error { kind, message, .. } => ClientError::Rejected { kind, message },
        other => ClientError::Unexpected(format!("{other:?}")),
    }
}

struct Connection {
    outbound: mpsc::UnboundedSender<ClientMessage>,
    waiters: DashMap<RequestId, oneshot::Sender<ServerMessage>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl Connection {
    fn next_request_id(&self) -> RequestId {
        RequestId::new(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn send(&self, message: ClientMessage) -> Result<(), ClientError> {
        self.outbound
            .send(message)
            .map_err(|_| ClientError::Disconnected)
    }

    /// Register a waiter before the request goes out so the response can't race it.
    fn register(
        self: &Arc<Self>,
        request_id: RequestId,
        acquire: bool,
    ) -> Result<Waiter, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(request_id, tx);
        if self.closed.load(Ordering::SeqCst) {
            self.waiters.remove(&request_id);
            return Err(ClientError::Disconnected);
        }
        Ok(Waiter {
            conn: Arc::clone(self),
            request_id,
            rx,
            acquire,
            settled: false,
        })
    }

    fn dispatch(&self, message: ServerMessage) {
        let Some(request_id) = message.request_id() else {
            tracing::warn!(?message, "Arbiter error without a request id");
            return;
        };

        let message = match self.waiters.remove(&request_id) {
            Some((_, waiter)) => match waiter.send(message) {
                Ok(()) => return,
                // Caller went away between our lookup and the send.
                Err(message) => message,
            },
            None => message,
        };

        if let ServerMessage::Grant { request_id } = message {
            tracing::debug!(%request_id, "Releasing grant nobody is waiting for");
            let _ = self.send(ClientMessage::Release { request_id });
        } else {
            tracing::trace!(%request_id, "Response without a waiter");
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        // Dropping the senders wakes every waiter with an error.
        self.waiters.clear();
    }
}

/// A registered request awaiting its response.
struct Waiter {
    conn: Arc<Connection>,
    request_id: RequestId,
    rx: oneshot::Receiver<ServerMessage>,
    acquire: bool,
    settled: bool,
}

impl Waiter {
    async fn wait(mut self) -> Result<ServerMessage, ClientError> {
        let result = (&mut self.rx).await;
        self.settled = true;
        result.map_err(|_| ClientError::Disconnected)
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        if self.conn.waiters.remove(&self.request_id).is_some() {
            if self.acquire {
                let _ = self.conn.send(ClientMessage::Cancel {
                    request_id: self.request_id,
                });
            }
        } else if self.acquire
            && let Ok(ServerMessage::Grant { request_id }) = self.rx.try_recv()
        {
            let _ = self.conn.send(ClientMessage::Release { request_id });
        }
    }
}

/// Handle for acquiring capacity from an arbiter.
///
/// Cloning shares the underlying connection.
#[derive(Clone)]
pub struct ArbiterClient {
    conn: Option<Arc<Connection>>,
}

impl ArbiterClient {
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let conn = Arc::new(Connection {
            outbound,
            waiters: DashMap::new(),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        });

        tokio::spawn(write_loop(
            FramedWrite::new(write_half, JsonCodec::<ClientMessage>::new()),
            outbound_rx,
        ));
        tokio::spawn(read_loop(
            FramedRead::new(read_half, JsonCodec::<ServerMessage>::new()),
            Arc::downgrade(&conn),
        ));

        Ok(Self { conn: Some(conn) })
    }

    /// A client that grants everything locally, for running without an arbiter.
    pub fn disabled() -> Self {
        Self { conn: None }
    }

    /// Connect to `addr`, or fall back to a disabled client when it is empty.
    pub async fn from_address(addr: &str) -> Result<Self, ClientError> {
        if addr.trim().is_empty() {
            tracing::info!("No arbiter address configured, running unthrottled");
            return Ok(Self::disabled());
        }
        Self::connect(addr).await
    }

    pub fn is_disabled(&self) -> bool {
        self.conn.is_none()
    }

    /// Wait until the arbiter grants one unit of `class` on `resource`.
    pub async fn acquire(
        &self,
        resource: impl Into<ResourceKey>,
        class: impl Into<OperationClass>,
    ) -> Result<AccessPermit, ClientError> {
        self.acquire_weighted(resource, class, UNIT_WEIGHT).await
    }

    /// Wait until the arbiter grants `weight` units of `class` on `resource`,
    /// e.g. a byte count against a data-volume class.
    ///
    /// Fails with [`ErrorKind::Unsatisfiable`] when `weight` exceeds the limit.
    pub async fn acquire_weighted(
        &self,
        resource: impl Into<ResourceKey>,
        class: impl Into<OperationClass>,
        weight: NonZeroU32,
    ) -> Result<AccessPermit, ClientError> {
        let resource = resource.into();
        let class = class.into();
        let Some(conn) = &self.conn else {
            return Ok(AccessPermit {
                request_id: None,
                resource,
                class,
                weight,
                conn: None,
            });
        };

        let request_id = conn.next_request_id();
        let waiter = conn.register(request_id, true)?;
        conn.send(ClientMessage::Acquire {
            request_id,
            resource: resource.clone(),
            class: class.clone(),
            weight,
        })?;

        match waiter.wait().await? {
            ServerMessage::Grant { .. } => Ok(AccessPermit {
                request_id: Some(request_id),
                resource,
                class,
                weight,
                conn: Some(Arc::clone(conn)),
            }),
            other => Err(into_error(other)),
        }
    }

    /// Like [`acquire`](Self::acquire), but give up after `timeout`.
    ///
    /// Giving up cancels the request on the arbiter; a grant that crosses the
    /// cancel on the wire is released immediately.
    pub async fn acquire_timeout(
        &self,
        resource: impl Into<ResourceKey>,
        class: impl Into<OperationClass>,
        timeout: Duration,
    ) -> Result<AccessPermit, ClientError> {
        let resource = resource.into();
        let class = class.into();
        match tokio::time::timeout(timeout, self.acquire(resource.clone(), class.clone())).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::Timeout { resource, class }),
        }
    }

    pub async fn read_config(&self) -> Result<QuotaConfig, ClientError> {
        match self
            .call(|request_id| ClientMessage::ReadConfig { request_id })
            .await?
        {
            ServerMessage::Config { config, .. } => Ok(config),
            other => Err(into_error(other)),
        }
    }

    /// Replace the arbiter's quota table. Returns the table now in effect.
    pub async fn configure(&self, config: QuotaConfig) -> Result<QuotaConfig, ClientError> {
        match self
            .call(|request_id| ClientMessage::Configure { request_id, config })
            .await?
        {
            ServerMessage::Config { config, .. } => Ok(config),
            other => Err(into_error(other)),
        }
    }

    pub async fn stats(&self) -> Result<Vec<EntryStats>, ClientError> {
        match self
            .call(|request_id| ClientMessage::Stats { request_id })
            .await?
        {
            ServerMessage::Stats { entries, .. } => Ok(entries),
            other => Err(into_error(other)),
        }
    }

    async fn call(
        &self,
        build: impl FnOnce(RequestId) -> ClientMessage,
    ) -> Result<ServerMessage, ClientError> {
        let conn = self.conn.as_ref().ok_or(ClientError::Disabled)?;
        let request_id = conn.next_request_id();
        let waiter = conn.register(request_id, false)?;
        conn.send(build(request_id))?;
        waiter.wait().await
    }
}

/// Granted capacity. Released on drop if not released explicitly.
#[must_use = "the grant is released as soon as the permit is dropped"]
pub struct AccessPermit {
    /// None for permits from a disabled client.
    request_id: Option<RequestId>,
    resource: ResourceKey,
    class: OperationClass,
    weight: NonZeroU32,
    conn: Option<Arc<Connection>>,
}

impl AccessPermit {
    pub fn resource(&self) -> &ResourceKey {
        &self.resource
    }

    pub fn class(&self) -> &OperationClass {
        &self.class
    }

    pub fn weight(&self) -> NonZeroU32 {
        self.weight
    }

    pub fn request_id(&self) -> Option<RequestId> {
        self.request_id
    }

    /// Release and wait for the arbiter to confirm.
    pub async fn release(mut self) -> Result<(), ClientError> {
        let (Some(conn), Some(request_id)) = (self.conn.take(), self.request_id) else {
            return Ok(());
        };

        let waiter = conn.register(request_id, false)?;
        conn.send(ClientMessage::Release { request_id })?;
        match waiter.wait().await? {
            ServerMessage::Ack { .. } => Ok(()),
            other => Err(into_error(other)),
        }
    }
}

impl Drop for AccessPermit {
    fn drop(&mut self) {
        if let (Some(conn), Some(request_id)) = (self.conn.take(), self.request_id) {
            tracing::trace!(%request_id, resource = %self.resource, class = %self.class, "Releasing on drop");
            let _ = conn.send(ClientMessage::Release { request_id });
        }
    }
}

impl std::fmt::Debug for AccessPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessPermit")
            .field("request_id", &self.request_id)
            .field("resource", &self.resource)
            .field("class", &self.class)
            .field("weight", &self.weight)
            .finish()
    }
}

async fn write_loop(
    mut writer: FramedWrite<tokio::net::tcp::OwnedWriteHalf, JsonCodec<ClientMessage>>,
    mut outbound_rx: mpsc::UnboundedReceiver<ClientMessage>,
) {
    while let Some(message) = outbound_rx.recv().await {
        if let Err(e) = writer.send(message).await {
            tracing::warn!(error = %e, "Failed to write to arbiter");
            return;
        }
    }
}

async fn read_loop(
    mut reader: FramedRead<tokio::net::tcp::OwnedReadHalf, JsonCodec<ServerMessage>>,
    conn: Weak<Connection>,
) {
    while let Some(frame) = reader.next().await {
        let message = match frame {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read from arbiter");
                break;
            }
        };
        let Some(conn) = conn.upgrade() else {
            return;
        };
        conn.dispatch(message);
    }

    if let Some(conn) = conn.upgrade() {
        tracing::warn!("Arbiter connection closed");
        conn.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{ArbiterHandle, spawn_arbiter};
    use crate::transport::serve_listener;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;
    use tokio::sync::watch;

    struct TestServer {
        addr: SocketAddr,
        handle: ArbiterHandle,
        shutdown: watch::Sender<bool>,
    }

    async fn start(quotas: QuotaConfig) -> TestServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (handle, _task) = spawn_arbiter(quotas);
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let server_handle = handle.clone();
        tokio::spawn(async move {
            let stop = async move {
                let _ = shutdown_rx.wait_for(|stop| *stop).await;
            };
            serve_listener(listener, server_handle, stop).await;
        });
        TestServer {
            addr,
            handle,
            shutdown,
        }
    }

    fn limits(read: u32, write: u32) -> QuotaConfig {
        QuotaConfig::default()
            .with_limit(ResourceKey::new("hostA"), OperationClass::read(), read)
            .with_limit(ResourceKey::new("hostA"), OperationClass::write(), write)
    }

    /// Poll the arbiter until `check` holds for hostA's entries.
    async fn eventually(handle: &ArbiterHandle, check: impl Fn(&[EntryStats]) -> bool) {
        for _ in 0..200 {
            let stats = handle.stats().await.unwrap();
            if check(&stats) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached: {:?}", handle.stats().await.unwrap());
    }

    fn detached_connection() -> (Arc<Connection>, mpsc::UnboundedReceiver<ClientMessage>) {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let conn = Arc::new(Connection {
            outbound,
            waiters: DashMap::new(),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        });
        (conn, outbound_rx)
    }

    #[test]
    fn grant_delivered_to_abandoned_waiter_is_released() {
        let (conn, mut sent) = detached_connection();
        let request_id = RequestId::new(1);

        let waiter = conn.register(request_id, true).unwrap();
        conn.dispatch(ServerMessage::Grant { request_id });
        assert!(sent.try_recv().is_err());

        // The grant sits in the oneshot; the caller gives up before reading it.
        drop(waiter);
        assert_eq!(sent.try_recv().unwrap(), ClientMessage::Release { request_id });
        assert!(sent.try_recv().is_err());
        assert!(conn.waiters.is_empty());
    }

    #[test]
    fn grant_crossing_a_cancel_is_released_on_arrival() {
        let (conn, mut sent) = detached_connection();
        let request_id = RequestId::new(2);

        drop(conn.register(request_id, true).unwrap());
        assert_eq!(sent.try_recv().unwrap(), ClientMessage::Cancel { request_id });

        conn.dispatch(ServerMessage::Grant { request_id });
        assert_eq!(sent.try_recv().unwrap(), ClientMessage::Release { request_id });
        assert!(sent.try_recv().is_err());
    }

    #[test]
    fn abandoned_non_acquire_waiter_sends_nothing() {
        let (conn, mut sent) = detached_connection();
        let request_id = RequestId::new(3);

        drop(conn.register(request_id, false).unwrap());
        conn.dispatch(ServerMessage::Ack { request_id });
        assert!(sent.try_recv().is_err());
    }

    #[test]
    fn closed_connection_refuses_new_waiters() {
        let (conn, _sent) = detached_connection();
        conn.close();
        assert!(matches!(
            conn.register(RequestId::new(4), true),
            Err(ClientError::Disconnected)
        ));
        assert!(conn.waiters.is_empty());
    }

    #[tokio::test]
    async fn exclusive_access_waits_for_release() {
        let server = start(limits(1, 1)).await;
        let first = ArbiterClient::connect(server.addr).await.unwrap();
        let second = ArbiterClient::connect(server.addr).await.unwrap();

        let held = first.acquire("hostA", "write").await.unwrap();

        let mut waiting = tokio::spawn(async move { second.acquire("hostA", "write").await });
        assert!(
            tokio::time::timeout(Duration::from_millis(100), &mut waiting)
                .await
                .is_err(),
            "second writer admitted while first holds the only slot"
        );

        held.release().await.unwrap();
        let permit = tokio::time::timeout(Duration::from_secs(5), waiting)
            .await
            .expect("second writer never admitted")
            .unwrap()
            .unwrap();
        assert_eq!(permit.class(), &OperationClass::write());
    }

    #[tokio::test]
    async fn reads_and_writes_do_not_block_each_other() {
        let server = start(limits(1, 1)).await;
        let client = ArbiterClient::connect(server.addr).await.unwrap();

        let read = client
            .acquire_timeout("hostA", "read", Duration::from_secs(1))
            .await
            .unwrap();
        let write = client
            .acquire_timeout("hostA", "write", Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(read.resource().as_str(), "hostA");
        assert_eq!(write.resource().as_str(), "hostA");
    }

    #[tokio::test]
    async fn timeout_cancels_queued_request() {
        let server = start(limits(1, 1)).await;
        let holder = ArbiterClient::connect(server.addr).await.unwrap();
        let impatient = ArbiterClient::connect(server.addr).await.unwrap();

        let held = holder.acquire("hostA", "read").await.unwrap();
        let err = impatient
            .acquire_timeout("hostA", "read", Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Timeout { .. }), "{err}");

        eventually(&server.handle, |stats| {
            stats.len() == 1 && stats[0].queued == 0 && stats[0].in_flight == 1
        })
        .await;

        held.release().await.unwrap();
        eventually(&server.handle, |stats| stats.is_empty()).await;

        let permit = impatient
            .acquire_timeout("hostA", "read", Duration::from_secs(1))
            .await
            .unwrap();
        drop(permit);
    }

    #[tokio::test]
    async fn dropping_permit_releases_it() {
        let server = start(limits(1, 1)).await;
        let client = ArbiterClient::connect(server.addr).await.unwrap();

        let permit = client.acquire("hostA", "read").await.unwrap();
        drop(permit);

        client
            .acquire_timeout("hostA", "read", Duration::from_secs(1))
            .await
            .unwrap()
            .release()
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn dropping_client_releases_everything() {
        let server = start(limits(2, 1)).await;
        let client = ArbiterClient::connect(server.addr).await.unwrap();

        let a = client.acquire("hostA", "read").await.unwrap();
        let b = client.acquire("hostA", "read").await.unwrap();
        let c = client.acquire("hostA", "write").await.unwrap();
        eventually(&server.handle, |stats| stats.len() == 2).await;

        drop((a, b, c, client));
        eventually(&server.handle, |stats| stats.is_empty()).await;
    }

    #[tokio::test]
    async fn server_shutdown_fails_pending_acquire() {
        let server = start(limits(1, 1)).await;
        let client = ArbiterClient::connect(server.addr).await.unwrap();

        let _held = client.acquire("hostA", "read").await.unwrap();
        let pending = {
            let client = client.clone();
            tokio::spawn(async move { client.acquire("hostA", "read").await })
        };
        eventually(&server.handle, |stats| {
            stats.first().is_some_and(|entry| entry.queued == 1)
        })
        .await;

        server.shutdown.send(true).unwrap();

        let err = tokio::time::timeout(Duration::from_secs(5), pending)
            .await
            .expect("pending acquire never failed")
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, ClientError::Disconnected), "{err}");
    }

    #[tokio::test]
    async fn configure_and_read_back() {
        let server = start(QuotaConfig::builtin()).await;
        let client = ArbiterClient::connect(server.addr).await.unwrap();

        assert_eq!(client.read_config().await.unwrap(), QuotaConfig::builtin());

        let config = limits(3, 1);
        assert_eq!(client.configure(config.clone()).await.unwrap(), config);
        assert_eq!(client.read_config().await.unwrap(), config);
    }

    #[tokio::test]
    async fn stats_over_the_wire() {
        let server = start(limits(2, 1)).await;
        let client = ArbiterClient::connect(server.addr).await.unwrap();

        let _permit = client.acquire("hostA", "read").await.unwrap();
        let stats = client.stats().await.unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].limit, 2);
        assert_eq!(stats[0].in_flight, 1);
    }

    #[tokio::test]
    async fn weighted_acquire_over_the_wire() {
        let server = start(limits(4, 1)).await;
        let client = ArbiterClient::connect(server.addr).await.unwrap();

        let permit = client
            .acquire_weighted("hostA", "read", NonZeroU32::new(3).unwrap())
            .await
            .unwrap();
        assert_eq!(permit.weight().get(), 3);
        eventually(&server.handle, |stats| {
            stats.first().is_some_and(|entry| entry.in_flight == 3)
        })
        .await;

        let err = client
            .acquire_weighted("hostA", "read", NonZeroU32::new(5).unwrap())
            .await
            .unwrap_err();
        assert!(
            matches!(
                err,
                ClientError::Rejected {
                    kind: ErrorKind::Unsatisfiable,
                    ..
                }
            ),
            "{err}"
        );

        permit.release().await.unwrap();
        eventually(&server.handle, |stats| stats.is_empty()).await;
    }

    #[tokio::test]
    async fn disabled_client_grants_locally() {
        let client = ArbiterClient::disabled();
        assert!(client.is_disabled());

        let permits: Vec<AccessPermit> = {
            let mut permits = Vec::new();
            for _ in 0..10 {
                permits.push(client.acquire("hostA", "write").await.unwrap());
            }
            permits
        };
        assert!(permits.iter().all(|p| p.request_id().is_none()));
        for permit in permits {
            permit.release().await.unwrap();
        }

        assert!(matches!(client.stats().await, Err(ClientError::Disabled)));
    }

    #[tokio::test]
    async fn empty_address_means_disabled() {
        let client = ArbiterClient::from_address("  ").await.unwrap();
        assert!(client.is_disabled());
    }
}
