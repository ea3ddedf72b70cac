//! `ReverbServer` builder, accept loop and sync loop.
//!
//! The server owns the authoritative object registry. Once started it
//! runs three kinds of tasks:
//! - one accept loop, registering each new connection in the live set
//!   and spawning its read loop;
//! - one sync loop, broadcasting a snapshot of every object each tick;
//! - one dispatch task, running event handlers (including the built-in
//!   remote-invocation and `client_disconnection` handlers).

use std::collections::HashMap;
use std::mem;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use reverb_object::{ObjectError, ObjectRegistry, Replicate, Side, TypeRegistry};
use reverb_protocol::{
    ClientDisconnection, DEFAULT_MAX_FRAME_LEN, ObjectId, PacketCodec, events,
};
use reverb_tick::{TickConfig, TickScheduler};
use reverb_transport::{ConnectionHandle, ConnectionLimits, ConnectionReader, TcpTransport};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};

use crate::handler::{Inbound, InboundSender, dispatch_loop, read_loop};
use crate::router::{EventContext, EventRouter, HandlerResult};
use crate::{ReverbError, invoke, read_lock, sync, write_lock};

/// Server settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to listen on. Default: `127.0.0.1:4444`.
    pub bind_addr: String,
    /// Snapshot broadcast rate. Default: 10 Hz.
    pub sync: TickConfig,
    /// Largest frame body accepted or sent. Default: 16 MiB.
    pub max_frame_len: usize,
    /// Send `server_stop` to every client before closing. Default: on.
    pub notify_on_stop: bool,
    /// When a client that stops reading gets dropped.
    pub connection: ConnectionLimits,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:4444".to_string(),
            sync: TickConfig::default(),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            notify_on_stop: true,
            connection: ConnectionLimits::default(),
        }
    }
}

/// Builder for configuring a Reverb server.
///
/// # Example
///
/// ```rust,ignore
/// use reverb::prelude::*;
///
/// let server = ReverbServer::builder()
///     .bind("0.0.0.0:4444")
///     .sync_rate(20)
///     .build();
/// server.start().await?;
/// ```
pub struct ReverbServerBuilder {
    config: ServerConfig,
}

impl ReverbServerBuilder {
    pub fn new() -> Self {
        Self {
            config: ServerConfig::default(),
        }
    }

    /// Sets the address to bind the server to.
    pub fn bind(mut self, addr: &str) -> Self {
        self.config.bind_addr = addr.to_string();
        self
    }

    /// Sets the snapshot rate in Hz (clamped to `1..=128`).
    pub fn sync_rate(mut self, hz: u32) -> Self {
        self.config.sync.tick_rate_hz = hz;
        self
    }

    /// Replaces the whole tick configuration.
    pub fn sync_config(mut self, config: TickConfig) -> Self {
        self.config.sync = config;
        self
    }

    pub fn max_frame_len(mut self, len: usize) -> Self {
        self.config.max_frame_len = len;
        self
    }

    pub fn connection_limits(mut self, limits: ConnectionLimits) -> Self {
        self.config.connection = limits;
        self
    }

    pub fn notify_on_stop(mut self, notify: bool) -> Self {
        self.config.notify_on_stop = notify;
        self
    }

    /// Replaces the whole configuration.
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Builds the server. Nothing is bound until [`ReverbServer::start`].
    pub fn build(self) -> ReverbServer {
        ReverbServer::new(self.config)
    }
}

impl Default for ReverbServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

type Peers = Arc<Mutex<HashMap<SocketAddr, ConnectionHandle>>>;

enum Lifecycle {
    Idle,
    Running(Running),
    Stopped,
}

/// Handles on the tasks of a started server.
struct Running {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    accept_task: JoinHandle<TcpTransport>,
    sync_task: JoinHandle<()>,
}

struct ServerShared {
    config: ServerConfig,
    codec: PacketCodec,
    router: EventRouter,
    types: Arc<RwLock<TypeRegistry>>,
    objects: Arc<RwLock<ObjectRegistry>>,
    peers: Peers,
    lifecycle: Mutex<Lifecycle>,
}

/// The authoritative side of a replication session.
///
/// Cheap to clone; clones drive the same server, so one can be moved
/// into event handlers.
#[derive(Clone)]
pub struct ReverbServer {
    shared: Arc<ServerShared>,
}

impl ReverbServer {
    pub fn builder() -> ReverbServerBuilder {
        ReverbServerBuilder::new()
    }

    pub fn new(config: ServerConfig) -> Self {
        let codec = PacketCodec::new(config.max_frame_len);
        let shared = Arc::new(ServerShared {
            config,
            codec,
            router: EventRouter::new(),
            types: Arc::new(RwLock::new(TypeRegistry::new())),
            objects: Arc::new(RwLock::new(ObjectRegistry::new(Side::Server))),
            peers: Arc::new(Mutex::new(HashMap::new())),
            lifecycle: Mutex::new(Lifecycle::Idle),
        });
        let server = Self { shared };
        server.install_builtin_handlers();
        server
    }

    fn install_builtin_handlers(&self) {
        let shared = &self.shared;

        let types = Arc::clone(&shared.types);
        let objects = Arc::clone(&shared.objects);
        shared.router.on(events::CALLING_SERVER_COMPUTING, move |ctx, payload| {
            let outcome = {
                let types = read_lock(&types);
                let mut objects = write_lock(&objects);
                invoke::execute(&mut objects, &types, payload)
            };
            if let Err(rejected) = outcome {
                tracing::warn!(
                    peer = ?ctx.peer_addr(),
                    object_id = %rejected.object_id,
                    method = %rejected.method,
                    reason = %rejected.reason,
                    "remote invocation rejected"
                );
                ctx.reply(events::INVOKE_REJECTED, &rejected)?;
            }
            Ok(())
        });

        shared.router.on(events::CLIENT_DISCONNECTION, |ctx, payload| {
            let addr = serde_json::from_value::<ClientDisconnection>(payload.clone())
                .map(|notice| notice.addr)
                .unwrap_or_default();
            tracing::info!(peer = ?ctx.peer_addr(), %addr, "client announced disconnection");
            if let Some(connection) = ctx.connection() {
                connection.close();
            }
            Ok(())
        });
    }

    /// Binds the listener and starts the accept, sync and dispatch tasks.
    ///
    /// Returns the bound address (useful with port 0).
    ///
    /// # Errors
    /// [`ReverbError::AlreadyStarted`] if the server is running or was
    /// stopped; transport errors if the address can't be bound.
    pub async fn start(&self) -> Result<SocketAddr, ReverbError> {
        if !matches!(*self.lifecycle(), Lifecycle::Idle) {
            return Err(ReverbError::AlreadyStarted);
        }

        let shared = &self.shared;
        let transport = TcpTransport::bind(&shared.config.bind_addr)
            .await?
            .with_limits(shared.config.connection);
        let local_addr = transport.local_addr()?;

        let mut lifecycle = self.lifecycle();
        if !matches!(*lifecycle, Lifecycle::Idle) {
            // Another start() won the race; dropping `transport` unbinds.
            return Err(ReverbError::AlreadyStarted);
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        tokio::spawn(dispatch_loop(inbound_rx, shared.router.clone(), shared.codec));
        let accept_task = tokio::spawn(accept_loop(
            transport,
            Arc::clone(&shared.peers),
            shared.codec,
            inbound_tx,
            shutdown_rx.clone(),
        ));
        let sync_task = tokio::spawn(sync_loop(
            Arc::clone(&shared.objects),
            Arc::clone(&shared.peers),
            shared.codec,
            shared.config.sync.clone(),
            shutdown_rx,
        ));

        *lifecycle = Lifecycle::Running(Running {
            local_addr,
            shutdown,
            accept_task,
            sync_task,
        });
        tracing::info!(%local_addr, rate_hz = shared.config.sync.tick_rate_hz, "Reverb server running");
        Ok(local_addr)
    }

    /// Stops the server: no more accepts or snapshots, `server_stop` to
    /// every client (unless disabled), every connection flushed and
    /// closed, then the listening socket closed. A second call, or a call
    /// before `start`, does nothing.
    pub async fn stop(&self) {
        let running = {
            let mut lifecycle = self.lifecycle();
            match mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
                Lifecycle::Running(running) => running,
                other => {
                    *lifecycle = other;
                    return;
                }
            }
        };

        running.shutdown.send_replace(true);
        // The listener stays bound until every peer is closed.
        let listener = running.accept_task.await.ok();
        let _ = running.sync_task.await;

        let peers: Vec<ConnectionHandle> = {
            let mut peers = self.shared.peers.lock().unwrap_or_else(PoisonError::into_inner);
            peers.drain().map(|(_, connection)| connection).collect()
        };

        if self.shared.config.notify_on_stop {
            match self.shared.codec.encode(events::SERVER_STOP, &Value::Null) {
                Ok(frame) => {
                    for connection in &peers {
                        let _ = connection.send(frame.clone());
                    }
                }
                Err(e) => tracing::warn!(error = %e, "failed to encode server_stop"),
            }
        }
        // Peers flush concurrently: total wait is bounded by one flush timeout.
        let mut flushes = JoinSet::new();
        for connection in peers.iter().cloned() {
            flushes.spawn(async move { connection.close_and_flush().await });
        }
        while flushes.join_next().await.is_some() {}
        drop(listener);

        tracing::info!(
            local_addr = %running.local_addr,
            closed = peers.len(),
            "Reverb server stopped"
        );
    }

    /// The bound address while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &*self.lifecycle() {
            Lifecycle::Running(running) => Some(running.local_addr),
            _ => None,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.lifecycle(), Lifecycle::Running(_))
    }

    /// Adds a handler for `event`. See [`EventRouter::on`].
    pub fn on<F>(&self, event: &str, handler: F)
    where
        F: Fn(&EventContext, &Value) -> HandlerResult + Send + Sync + 'static,
    {
        self.shared.router.on(event, handler);
    }

    /// The server's event router.
    pub fn router(&self) -> &EventRouter {
        &self.shared.router
    }

    /// Registers `T` so it can be invoked remotely. Idempotent, and done
    /// automatically by [`create_object`](Self::create_object).
    pub fn register_type<T: Replicate>(&self) -> bool {
        write_lock(&self.shared.types).register::<T>()
    }

    /// Registers a new authoritative object and returns its fresh id. It
    /// is included in every snapshot from the next tick on.
    pub fn create_object<T: Replicate>(&self, object: T) -> Result<ObjectId, ReverbError> {
        self.register_type::<T>();
        let id = write_lock(&self.shared.objects).register(Box::new(object))?;
        Ok(id)
    }

    /// Runs `f` on the object, which must be a `T`.
    pub fn with_object<T: Replicate, R>(
        &self,
        id: &ObjectId,
        f: impl FnOnce(&T) -> R,
    ) -> Result<R, ReverbError> {
        let objects = read_lock(&self.shared.objects);
        let object = objects
            .get(id)
            .ok_or_else(|| ObjectError::ObjectNotFound(id.clone()))?;
        let typed = object
            .as_any()
            .downcast_ref::<T>()
            .ok_or_else(|| ObjectError::TypeMismatch {
                expected: T::TYPE_NAME.to_string(),
                actual: object.type_name().to_string(),
            })?;
        Ok(f(typed))
    }

    /// Runs `f` on the object with write access. Changes go out with the
    /// next snapshot.
    pub fn with_object_mut<T: Replicate, R>(
        &self,
        id: &ObjectId,
        f: impl FnOnce(&mut T) -> R,
    ) -> Result<R, ReverbError> {
        let mut objects = write_lock(&self.shared.objects);
        let object = objects
            .get_mut(id)
            .ok_or_else(|| ObjectError::ObjectNotFound(id.clone()))?;
        let actual = object.type_name();
        let typed = object
            .as_any_mut()
            .downcast_mut::<T>()
            .ok_or_else(|| ObjectError::TypeMismatch {
                expected: T::TYPE_NAME.to_string(),
                actual: actual.to_string(),
            })?;
        Ok(f(typed))
    }

    /// Drops an object from the registry. Clients keep their mirror;
    /// removal is not replicated.
    pub fn remove_object(&self, id: &ObjectId) -> bool {
        write_lock(&self.shared.objects).remove(id).is_some()
    }

    pub fn object_ids(&self) -> Vec<ObjectId> {
        read_lock(&self.shared.objects).ids()
    }

    /// Sends an event to one client.
    ///
    /// # Errors
    /// [`ReverbError::PeerNotFound`] if no live connection comes from
    /// `peer`, or encode/send failures.
    pub fn send_to<T: Serialize + ?Sized>(
        &self,
        peer: SocketAddr,
        event: &str,
        payload: &T,
    ) -> Result<(), ReverbError> {
        let connection = self
            .shared
            .peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&peer)
            .cloned()
            .ok_or(ReverbError::PeerNotFound(peer))?;
        let frame = self.shared.codec.encode(event, payload)?;
        connection.send(frame)?;
        Ok(())
    }

    /// Sends an event to every live client. Returns how many it was
    /// queued for.
    pub fn broadcast<T: Serialize + ?Sized>(
        &self,
        event: &str,
        payload: &T,
    ) -> Result<usize, ReverbError> {
        let frame = self.shared.codec.encode(event, payload)?;
        Ok(broadcast_frame(&self.shared.peers, &frame))
    }

    /// Broadcasts a snapshot right away, outside the tick schedule.
    pub fn sync_now(&self) -> Result<usize, ReverbError> {
        let frame = sync::snapshot_frame(&read_lock(&self.shared.objects), &self.shared.codec)?;
        Ok(broadcast_frame(&self.shared.peers, &frame))
    }

    /// Addresses of the live client connections, sorted.
    pub fn connected_peers(&self) -> Vec<SocketAddr> {
        let peers = self.shared.peers.lock().unwrap_or_else(PoisonError::into_inner);
        let mut addrs: Vec<SocketAddr> = peers.keys().copied().collect();
        addrs.sort_unstable();
        addrs
    }

    fn lifecycle(&self) -> std::sync::MutexGuard<'_, Lifecycle> {
        self.shared.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Queues `frame` on every live connection.
fn broadcast_frame(peers: &Mutex<HashMap<SocketAddr, ConnectionHandle>>, frame: &[u8]) -> usize {
    let targets: Vec<ConnectionHandle> = peers
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .values()
        .cloned()
        .collect();

    let mut queued = 0;
    for connection in targets {
        match connection.send(frame.to_vec()) {
            Ok(()) => queued += 1,
            Err(e) => tracing::debug!(conn_id = %connection.id(), error = %e, "broadcast skipped"),
        }
    }
    queued
}

/// Accepts connections until shutdown, then hands the listener back so
/// the caller decides when the socket closes.
async fn accept_loop(
    transport: TcpTransport,
    peers: Peers,
    codec: PacketCodec,
    inbound: InboundSender,
    mut shutdown: watch::Receiver<bool>,
) -> TcpTransport {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = transport.accept() => match accepted {
                Ok((connection, reader)) => {
                    let peer = connection.peer_addr();
                    peers
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .insert(peer, connection.clone());
                    tracing::info!(conn_id = %connection.id(), %peer, "client connected");
                    tokio::spawn(serve_connection(
                        connection,
                        reader,
                        codec,
                        inbound.clone(),
                        Arc::clone(&peers),
                    ));
                }
                Err(e) => {
                    tracing::error!(error = %e, "accept failed");
                }
            },
        }
    }
    tracing::debug!("accept loop stopped");
    transport
}

/// Runs one client's read loop, then takes it out of the live set.
async fn serve_connection(
    connection: ConnectionHandle,
    reader: ConnectionReader,
    codec: PacketCodec,
    inbound: InboundSender,
    peers: Peers,
) {
    let _ = inbound.send(Inbound::Connected(connection.clone()));
    read_loop(reader, &connection, codec, &inbound).await;
    connection.close();

    {
        let mut peers = peers.lock().unwrap_or_else(PoisonError::into_inner);
        let peer = connection.peer_addr();
        if peers.get(&peer).is_some_and(|live| live.id() == connection.id()) {
            peers.remove(&peer);
        }
    }
    tracing::info!(conn_id = %connection.id(), peer = %connection.peer_addr(), "client disconnected");
    let _ = inbound.send(Inbound::Disconnected(connection));
}

/// Broadcasts a snapshot every tick until shutdown.
async fn sync_loop(
    objects: Arc<RwLock<ObjectRegistry>>,
    peers: Peers,
    codec: PacketCodec,
    config: TickConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut scheduler = TickScheduler::new(config);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            info = scheduler.wait_for_tick() => {
                let frame = sync::snapshot_frame(&read_lock(&objects), &codec);
                match frame {
                    Ok(frame) => {
                        let sent = broadcast_frame(&peers, &frame);
                        tracing::trace!(tick = info.tick, peers = sent, "snapshot broadcast");
                    }
                    Err(e) => tracing::warn!(tick = info.tick, error = %e, "snapshot encode failed"),
                }
                scheduler.record_tick_end();
            }
        }
    }
    tracing::debug!(ticks = scheduler.tick_count(), "sync loop stopped");
}
