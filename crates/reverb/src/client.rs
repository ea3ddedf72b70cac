//! `ReverbClient`: connects to a server and keeps mirrors of its objects.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use reverb_object::{ObjectError, ObjectRegistry, Replicate, ReplicatedObject, Side, TypeRegistry};
use reverb_protocol::{
    ClientDisconnection, DEFAULT_MAX_FRAME_LEN, InvokeRejected, ObjectId, PacketCodec, events,
};
use reverb_transport::{ConnectionHandle, ConnectionLimits, ConnectionReader};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::handler::{Inbound, InboundSender, dispatch_loop, read_loop};
use crate::router::{EventContext, EventRouter, HandlerResult};
use crate::{ReverbError, invoke, read_lock, sync, write_lock};

/// Client settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Largest frame body accepted or sent. Default: 16 MiB.
    pub max_frame_len: usize,
    /// When a server that stops reading gets dropped.
    pub connection: ConnectionLimits,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            connection: ConnectionLimits::default(),
        }
    }
}

type Link = Arc<Mutex<Option<ConnectionHandle>>>;

struct ClientShared {
    codec: PacketCodec,
    limits: ConnectionLimits,
    router: EventRouter,
    types: Arc<RwLock<TypeRegistry>>,
    objects: Arc<RwLock<ObjectRegistry>>,
    link: Link,
}

/// The mirroring side of a replication session.
///
/// Incoming `server_sync` snapshots are reconciled into the local
/// registry by a built-in handler; application handlers registered with
/// [`on`](Self::on) for the same event run after it.
///
/// Cheap to clone; clones share the connection and the mirrors.
#[derive(Clone)]
pub struct ReverbClient {
    shared: Arc<ClientShared>,
}

impl ReverbClient {
    pub fn new(config: ClientConfig) -> Self {
        let shared = Arc::new(ClientShared {
            codec: PacketCodec::new(config.max_frame_len),
            limits: config.connection,
            router: EventRouter::new(),
            types: Arc::new(RwLock::new(TypeRegistry::new())),
            objects: Arc::new(RwLock::new(ObjectRegistry::new(Side::Client))),
            link: Arc::new(Mutex::new(None)),
        });
        let client = Self { shared };
        client.install_builtin_handlers();
        client
    }

    fn install_builtin_handlers(&self) {
        let router = &self.shared.router;

        let types = Arc::clone(&self.shared.types);
        let objects = Arc::clone(&self.shared.objects);
        router.on(events::SERVER_SYNC, move |_, payload| {
            let report = {
                let types = read_lock(&types);
                let mut objects = write_lock(&objects);
                sync::reconcile(&mut objects, &types, payload)?
            };
            for (id, error) in &report.failures {
                tracing::warn!(%id, %error, "snapshot record skipped");
            }
            tracing::trace!(
                updated = report.updated.len(),
                created = report.created.len(),
                "snapshot applied"
            );
            Ok(())
        });

        router.on(events::INVOKE_REJECTED, |_, payload| {
            let rejected: InvokeRejected = serde_json::from_value(payload.clone())?;
            tracing::warn!(
                object_id = %rejected.object_id,
                method = %rejected.method,
                reason = %rejected.reason,
                "server rejected remote invocation"
            );
            Ok(())
        });

        router.on(events::SERVER_STOP, |ctx, _| {
            tracing::info!(peer = ?ctx.peer_addr(), "server is stopping");
            if let Some(connection) = ctx.connection() {
                connection.close();
            }
            Ok(())
        });
    }

    /// Connects to a server and starts receiving snapshots. Fires the
    /// local `connection` event.
    ///
    /// # Errors
    /// [`ReverbError::AlreadyConnected`] while a connection is live, or
    /// the transport error if the server can't be reached.
    pub async fn connect(&self, addr: &str) -> Result<SocketAddr, ReverbError> {
        if let Some(live) = self.live_connection() {
            return Err(ReverbError::AlreadyConnected(live.peer_addr()));
        }

        let (connection, reader) =
            reverb_transport::connect_with_limits(addr, self.shared.limits).await?;
        let peer = connection.peer_addr();
        {
            let mut link = self.link();
            if let Some(live) = link.as_ref().filter(|live| live.is_alive()) {
                // Lost a race with another connect(); keep the first one.
                let live_addr = live.peer_addr();
                connection.close();
                return Err(ReverbError::AlreadyConnected(live_addr));
            }
            *link = Some(connection.clone());
        }

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        tokio::spawn(dispatch_loop(
            inbound_rx,
            self.shared.router.clone(),
            self.shared.codec,
        ));
        tokio::spawn(run_connection(
            connection,
            reader,
            self.shared.codec,
            inbound_tx,
            Arc::clone(&self.shared.link),
        ));

        tracing::info!(%peer, "connected to server");
        Ok(peer)
    }

    /// Tells the server we're leaving, then closes the connection. The
    /// local `disconnection` event fires once the read loop has ended.
    ///
    /// Waits at most [`ConnectionLimits::flush_timeout`] for queued
    /// frames to reach a server that stopped reading.
    ///
    /// Returns `false` if there was nothing to disconnect.
    pub async fn disconnect(&self) -> bool {
        let Some(connection) = self.link().take() else {
            return false;
        };
        if !connection.is_alive() {
            return false;
        }

        let notice = ClientDisconnection {
            addr: connection.peer_addr().to_string(),
        };
        match self.shared.codec.encode(events::CLIENT_DISCONNECTION, &notice) {
            Ok(frame) => {
                let _ = connection.send(frame);
            }
            Err(e) => tracing::warn!(error = %e, "failed to encode client_disconnection"),
        }
        connection.close_and_flush().await;
        tracing::info!(peer = %connection.peer_addr(), "disconnected from server");
        true
    }

    pub fn is_connected(&self) -> bool {
        self.live_connection().is_some()
    }

    /// Address of the server while connected.
    pub fn server_addr(&self) -> Option<SocketAddr> {
        self.live_connection().map(|connection| connection.peer_addr())
    }

    /// Adds a handler for `event`. See [`EventRouter::on`].
    pub fn on<F>(&self, event: &str, handler: F)
    where
        F: Fn(&EventContext, &Value) -> HandlerResult + Send + Sync + 'static,
    {
        self.shared.router.on(event, handler);
    }

    /// The client's event router.
    pub fn router(&self) -> &EventRouter {
        &self.shared.router
    }

    /// Registers a variant so snapshots can create mirrors of it.
    /// Idempotent.
    pub fn register_type<T: Replicate>(&self) -> bool {
        write_lock(&self.shared.types).register::<T>()
    }

    /// Sends an application event to the server.
    pub fn send<T: Serialize + ?Sized>(&self, event: &str, payload: &T) -> Result<(), ReverbError> {
        let connection = self.live_connection().ok_or(ReverbError::NotConnected)?;
        let frame = self.shared.codec.encode(event, payload)?;
        connection.send(frame)?;
        Ok(())
    }

    /// Asks the server to run `method` on the object `id`, with `args`
    /// serialized as positional JSON arguments.
    ///
    /// Fire-and-forget: the effect shows up in a later snapshot, and a
    /// refusal arrives as an `invoke_rejected` event.
    ///
    /// # Errors
    /// [`ObjectError::ObjectNotFound`] if there's no local mirror with
    /// this id, [`ObjectError::BadArguments`] if `args` isn't array-like,
    /// [`ReverbError::NotConnected`] or a send failure.
    pub fn invoke_on_server<A: Serialize + ?Sized>(
        &self,
        id: &ObjectId,
        method: &str,
        args: &A,
    ) -> Result<(), ReverbError> {
        if !read_lock(&self.shared.objects).contains(id) {
            return Err(ObjectError::ObjectNotFound(id.clone()).into());
        }
        self.send_invoke(id, method, args)
    }

    /// Like [`invoke_on_server`](Self::invoke_on_server), addressed by a
    /// mirror instead of its id. Safe to call from inside
    /// [`with_object`](Self::with_object).
    ///
    /// # Errors
    /// [`ObjectError::UnassignedId`] for an object that never came from a
    /// snapshot.
    pub fn invoke_on<A: Serialize + ?Sized>(
        &self,
        object: &dyn ReplicatedObject,
        method: &str,
        args: &A,
    ) -> Result<(), ReverbError> {
        let id = object.require_id()?;
        self.send_invoke(id, method, args)
    }

    fn send_invoke<A: Serialize + ?Sized>(
        &self,
        id: &ObjectId,
        method: &str,
        args: &A,
    ) -> Result<(), ReverbError> {
        let request = invoke::request(id, method, args)?;
        self.send(events::CALLING_SERVER_COMPUTING, &request)
    }

    /// Runs `f` on the mirror, which must be a `T`.
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

    /// Ids of every local mirror, sorted.
    pub fn object_ids(&self) -> Vec<ObjectId> {
        read_lock(&self.shared.objects).ids()
    }

    fn link(&self) -> std::sync::MutexGuard<'_, Option<ConnectionHandle>> {
        self.shared.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn live_connection(&self) -> Option<ConnectionHandle> {
        self.link().as_ref().filter(|c| c.is_alive()).cloned()
    }
}

impl Default for ReverbClient {
    fn default() -> Self {
        Self::new(ClientConfig::default())
    }
}

/// Drives one server connection: `connection` event, read loop, then
/// cleanup and `disconnection`.
async fn run_connection(
    connection: ConnectionHandle,
    reader: ConnectionReader,
    codec: PacketCodec,
    inbound: InboundSender,
    link: Link,
) {
    let _ = inbound.send(Inbound::Connected(connection.clone()));
    read_loop(reader, &connection, codec, &inbound).await;
    connection.close();

    {
        let mut link = link.lock().unwrap_or_else(PoisonError::into_inner);
        if link.as_ref().is_some_and(|live| live.id() == connection.id()) {
            *link = None;
        }
    }
    tracing::debug!(peer = %connection.peer_addr(), "server connection ended");
    let _ = inbound.send(Inbound::Disconnected(connection));
}
