//! # Host Router
//!
//! The host end of every guest connection. Each connection gets a pump task
//! that reads frames off its transport and dispatches them:
//!
//! - `send` frames go to listeners, scoped first and then root.
//! - `invoke` and `sync` frames go to exactly one handler, scoped first and
//!   then root, and are always answered with `resolve` or `reject`.
//! - `resolve` and `reject` frames complete the host's own pending invokes.
//!
//! Dispatch on one connection is sequential. Listeners run inline in the pump.
//! An invoke handler's future is spawned and the pump waits for its first poll
//! to return, so every handler runs to its first suspension point before the
//! next frame is read. While suspended it does not hold up other channels. A
//! `sync` handler is awaited before the pump moves on, since the guest is
//! blocked on it anyway.
//!
//! Handlers for one channel never execute at the same time, across all
//! connections: each poll holds that channel's lock. They may still interleave
//! at their suspension points.

use std::future::Future;
use std::pin::Pin;
use std::task::Context;
use std::task::Poll;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Weak;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio::task::JoinError;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use duopack::ErrorValue;
use duopack::Value;

use crate::config::RouterConfig;
use crate::emitter::Emitter;
use crate::emitter::Listener;
use crate::emitter::ListenerId;
use crate::emitter::MessageChannel;
use crate::error::error_value_of;
use crate::error::Error;
use crate::error::Result;
use crate::message::error_envelope;
use crate::message::ConnectionId;
use crate::message::Message;
use crate::message::MessageKind;
use crate::pending::Completion;
use crate::pending::PendingTable;
use crate::transport::Transport;

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// An invoke handler. The closure runs on the pump; the future is spawned.
pub type Handler = Arc<dyn Fn(InvokeEvent, Vec<Value>) -> BoxFuture<anyhow::Result<Value>> + Send + Sync>;

type DisconnectHook = Arc<dyn Fn(ConnectionId) + Send + Sync>;

/// Context handed to listeners of `send` messages.
#[derive(Clone)]
pub struct MessageEvent {
    pub connection: ConnectionId,
    pub channel: String,
    router: Router,
}

impl MessageEvent {
    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Sends a message back to the connection this one came from.
    ///
    /// Listeners are synchronous, so the send happens on a spawned task.
    pub fn reply(&self, channel: &str, args: Vec<Value>) {
        let router = self.router.clone();
        let connection = self.connection;
        let channel = channel.to_string();
        tokio::spawn(async move {
            if let Err(e) = router.send(connection, &channel, args).await {
                warn!(%connection, %channel, error = %e, "reply from listener failed");
            }
        });
    }
}

/// Context handed to invoke handlers.
#[derive(Clone)]
pub struct InvokeEvent {
    pub connection: ConnectionId,
    pub channel: String,
    pub correlation_id: u64,
    router: Router,
}

impl InvokeEvent {
    pub fn router(&self) -> &Router {
        &self.router
    }
}

struct HandlerEntry {
    handler: Handler,
    once: bool,
}

#[derive(Default)]
struct Scope {
    handlers: DashMap<String, HandlerEntry>,
    listeners: Emitter<MessageEvent>,
}

struct Connection {
    transport: Arc<dyn Transport>,
    pump: Option<AbortHandle>,
}

struct RouterInner {
    config: RouterConfig,
    next_connection: AtomicU64,
    connections: DashMap<ConnectionId, Connection>,
    pending: PendingTable,
    handlers: DashMap<String, HandlerEntry>,
    listeners: Emitter<MessageEvent>,
    scopes: DashMap<ConnectionId, Arc<Scope>>,
    channel_locks: DashMap<String, Arc<Mutex<()>>>,
    disconnect_hooks: Mutex<Vec<DisconnectHook>>,
}

/// The host-side message router. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Router {
    inner: Arc<RouterInner>,
}

impl Default for Router {
    fn default() -> Self {
        Self::new(RouterConfig::default())
    }
}

impl Router {
    pub fn new(config: RouterConfig) -> Self {
        let pending = PendingTable::new(config.marker_ttl);
        Self {
            inner: Arc::new(RouterInner {
                config,
                next_connection: AtomicU64::new(1),
                connections: DashMap::new(),
                pending,
                handlers: DashMap::new(),
                listeners: Emitter::new(),
                scopes: DashMap::new(),
                channel_locks: DashMap::new(),
                disconnect_hooks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.inner.config
    }

    // ------------------------------------------------------------------
    //  Connections
    // ------------------------------------------------------------------

    /// Adopts a transport as a new connection and starts its pump.
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect<T: Transport>(&self, transport: T) -> ConnectionId {
        let id = ConnectionId(self.inner.next_connection.fetch_add(1, Ordering::Relaxed));
        let transport: Arc<dyn Transport> = Arc::new(transport);

        self.inner.connections.insert(
            id,
            Connection {
                transport: Arc::clone(&transport),
                pump: None,
            },
        );

        let task = tokio::spawn(pump(Arc::downgrade(&self.inner), id, transport));
        if let Some(mut connection) = self.inner.connections.get_mut(&id) {
            connection.pump = Some(task.abort_handle());
        }

        info!(connection = %id, "connection opened");
        id
    }

    pub fn is_connected(&self, connection: ConnectionId) -> bool {
        self.inner.connections.contains_key(&connection)
    }

    pub fn connections(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self.inner.connections.iter().map(|c| *c.key()).collect();
        ids.sort();
        ids
    }

    /// Tears a connection down. Returns `false` if it was already gone.
    ///
    /// Disconnect hooks run exactly once per connection, whether teardown
    /// starts here or from the transport closing.
    pub fn disconnect(&self, connection: ConnectionId) -> bool {
        match self.teardown(connection) {
            Some(closed) => {
                if let Some(pump) = closed.pump {
                    pump.abort();
                }
                true
            }
            None => false,
        }
    }

    /// Registers a callback for connection teardown.
    pub fn on_disconnect<F>(&self, hook: F)
    where
        F: Fn(ConnectionId) + Send + Sync + 'static,
    {
        if let Ok(mut hooks) = self.inner.disconnect_hooks.lock() {
            hooks.push(Arc::new(hook));
        }
    }

    fn teardown(&self, connection: ConnectionId) -> Option<Connection> {
        let (_, closed) = self.inner.connections.remove(&connection)?;
        self.inner.scopes.remove(&connection);
        let failed = self.inner.pending.fail_connection(connection, Error::ConnectionClosed);
        info!(%connection, failed_invokes = failed, "connection closed");

        let hooks: Vec<DisconnectHook> = match self.inner.disconnect_hooks.lock() {
            Ok(hooks) => hooks.clone(),
            Err(_) => Vec::new(),
        };
        for hook in hooks {
            hook(connection);
        }
        Some(closed)
    }

    // ------------------------------------------------------------------
    //  Outgoing
    // ------------------------------------------------------------------

    /// Fire-and-forget message to one connection.
    pub async fn send(&self, connection: ConnectionId, channel: &str, args: Vec<Value>) -> Result<()> {
        let payload = duopack::encode_all(&args)?;
        self.transmit(connection, &Message::send(channel, payload)).await
    }

    /// Invokes a guest handler and waits for its reply, using the configured
    /// default deadline.
    pub async fn invoke(&self, connection: ConnectionId, channel: &str, args: Vec<Value>) -> Result<Value> {
        self.invoke_with_timeout(connection, channel, args, self.inner.config.invoke_timeout)
            .await
    }

    /// Invokes a guest handler with an explicit deadline (`None` waits forever).
    ///
    /// On expiry the request is cancelled and a late reply is discarded.
    pub async fn invoke_with_timeout(
        &self,
        connection: ConnectionId,
        channel: &str,
        args: Vec<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let payload = duopack::encode_all(&args)?;
        let (id, rx) = self.inner.pending.allocate(channel, Some(connection));
        let message = Message::request(MessageKind::Invoke, channel, id, payload);

        if let Err(e) = self.transmit(connection, &message).await {
            self.inner.pending.forget(id);
            return Err(e);
        }
        debug!(%connection, channel, correlation_id = id, "invoke sent");

        let received = match timeout {
            Some(after) => match tokio::time::timeout(after, rx).await {
                Ok(received) => received,
                Err(_) => {
                    self.inner.pending.cancel(id);
                    warn!(%connection, channel, correlation_id = id, "invoke timed out");
                    return Err(Error::Timeout {
                        channel: channel.to_string(),
                        after,
                    });
                }
            },
            None => rx.await,
        };

        match received {
            Ok(outcome) => outcome,
            Err(_) => Err(Error::ConnectionClosed),
        }
    }

    /// Number of invokes still waiting for a reply.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    async fn transmit(&self, connection: ConnectionId, message: &Message) -> Result<()> {
        let transport = self
            .inner
            .connections
            .get(&connection)
            .map(|c| Arc::clone(&c.transport))
            .ok_or(Error::UnknownConnection(connection))?;
        let bytes = message.to_bytes()?;
        transport.send(&bytes).await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    //  Handlers
    // ------------------------------------------------------------------

    /// Registers the handler for `channel`. A second registration fails with
    /// [`Error::DuplicateHandler`].
    pub fn handle<F, Fut>(&self, channel: &str, handler: F) -> Result<()>
    where
        F: Fn(InvokeEvent, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        insert_handler(&self.inner.handlers, channel, boxed(handler), false)
    }

    /// Like [`Router::handle`], but the handler removes itself after the
    /// first invocation.
    pub fn handle_once<F, Fut>(&self, channel: &str, handler: F) -> Result<()>
    where
        F: Fn(InvokeEvent, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        insert_handler(&self.inner.handlers, channel, boxed(handler), true)
    }

    pub fn remove_handler(&self, channel: &str) -> bool {
        self.inner.handlers.remove(channel).is_some()
    }

    pub fn has_handler(&self, channel: &str) -> bool {
        self.inner.handlers.contains_key(channel)
    }

    /// Handlers and listeners that apply only to messages from `connection`.
    pub fn scope(&self, connection: ConnectionId) -> ScopedRouter {
        // A scope for a connection that is already gone is never stored.
        let scope = if self.is_connected(connection) {
            Arc::clone(self.inner.scopes.entry(connection).or_default().value())
        } else {
            Arc::new(Scope::default())
        };
        ScopedRouter {
            router: self.clone(),
            connection,
            scope,
        }
    }

    fn scope_of(&self, connection: ConnectionId) -> Option<Arc<Scope>> {
        self.inner.scopes.get(&connection).map(|s| Arc::clone(s.value()))
    }

    // ------------------------------------------------------------------
    //  Dispatch
    // ------------------------------------------------------------------

    async fn dispatch(&self, connection: ConnectionId, frame: &[u8]) {
        let message = match Message::from_bytes(frame) {
            Ok(message) => message,
            Err(e) => {
                warn!(%connection, error = %e, "dropping unreadable frame");
                return;
            }
        };

        if let Some(claimed) = message.connection_id {
            if claimed != connection {
                warn!(
                    %connection,
                    %claimed,
                    channel = %message.channel,
                    "dropping message stamped with another connection"
                );
                return;
            }
        }

        match message.kind {
            MessageKind::Resolve | MessageKind::Reject => self.complete(connection, &message),
            MessageKind::Send => self.deliver(connection, &message),
            MessageKind::Invoke => self.answer(connection, message, false).await,
            MessageKind::Sync => self.answer(connection, message, true).await,
        }
    }

    fn complete(&self, connection: ConnectionId, message: &Message) {
        let Some(id) = message.correlation_id else {
            warn!(%connection, channel = %message.channel, "reply without correlation id");
            return;
        };

        match self.inner.pending.complete(id, &message.channel, Some(connection), message.outcome()) {
            Completion::Delivered => {}
            Completion::Cancelled => {
                debug!(%connection, channel = %message.channel, correlation_id = id, "discarding late reply");
            }
            Completion::ChannelMismatch => {
                warn!(%connection, channel = %message.channel, correlation_id = id, "reply channel does not match request");
            }
            Completion::WrongConnection => {
                warn!(%connection, channel = %message.channel, correlation_id = id, "reply from a connection the request was not sent to");
            }
            Completion::Unknown => {
                warn!(%connection, channel = %message.channel, correlation_id = id, "reply for unknown request");
            }
        }
    }

    fn deliver(&self, connection: ConnectionId, message: &Message) {
        let args = match duopack::decode_all(&message.payload) {
            Ok(args) => args,
            Err(e) => {
                warn!(%connection, channel = %message.channel, error = %e, "dropping undecodable message");
                return;
            }
        };

        let event = MessageEvent {
            connection,
            channel: message.channel.clone(),
            router: self.clone(),
        };

        let mut delivered = 0;
        if let Some(scope) = self.scope_of(connection) {
            delivered += scope.listeners.emit(&message.channel, &event, &args);
        }
        delivered += self.inner.listeners.emit(&message.channel, &event, &args);

        if delivered == 0 {
            debug!(%connection, channel = %message.channel, "no listener for message");
        }
    }

    fn find_handler(&self, connection: ConnectionId, channel: &str) -> Option<Handler> {
        if let Some(scope) = self.scope_of(connection) {
            if let Some(handler) = take_handler(&scope.handlers, channel) {
                return Some(handler);
            }
        }
        take_handler(&self.inner.handlers, channel)
    }

    async fn answer(&self, connection: ConnectionId, message: Message, blocking: bool) {
        let Some(id) = message.correlation_id else {
            warn!(%connection, channel = %message.channel, "request without correlation id");
            return;
        };
        let channel = message.channel;

        // Decoded first so a malformed payload cannot use up a `handle_once`.
        let args = match duopack::decode_all(&message.payload) {
            Ok(args) => args,
            Err(e) => {
                self.reply(connection, &channel, id, Err(ErrorValue::from_error(&e))).await;
                return;
            }
        };

        let Some(handler) = self.find_handler(connection, &channel) else {
            let error = ErrorValue::generic(format!("No handler registered for '{}'", channel));
            self.reply(connection, &channel, id, Err(error)).await;
            return;
        };

        let event = InvokeEvent {
            connection,
            channel: channel.clone(),
            correlation_id: id,
            router: self.clone(),
        };
        let (started, first_poll) = oneshot::channel();
        let task = tokio::spawn(Exclusive {
            lock: self.channel_lock(&channel),
            started: Some(started),
            future: handler(event, args),
        });

        if blocking {
            let outcome = settle(&channel, task.await);
            self.reply(connection, &channel, id, outcome).await;
        } else {
            // Errs if the first poll panicked; `settle` still answers.
            let _ = first_poll.await;
            let router = self.clone();
            tokio::spawn(async move {
                let outcome = settle(&channel, task.await);
                router.reply(connection, &channel, id, outcome).await;
            });
        }
    }

    fn channel_lock(&self, channel: &str) -> Arc<Mutex<()>> {
        Arc::clone(self.inner.channel_locks.entry(channel.to_string()).or_default().value())
    }

    async fn reply(
        &self,
        connection: ConnectionId,
        channel: &str,
        correlation_id: u64,
        outcome: std::result::Result<Value, ErrorValue>,
    ) {
        let message = match outcome {
            Ok(value) => match duopack::encode(&value) {
                Ok(envelope) => Message::resolve(channel, correlation_id, envelope),
                Err(e) => Message::reject(channel, correlation_id, error_envelope(&ErrorValue::from_error(&e))),
            },
            Err(error) => Message::reject(channel, correlation_id, error_envelope(&error)),
        };

        if let Err(e) = self.transmit(connection, &message).await {
            warn!(%connection, channel, correlation_id, error = %e, "could not deliver reply");
        }
    }
}

impl MessageChannel for Router {
    type Event = MessageEvent;

    fn on(&self, channel: &str, listener: Listener<MessageEvent>) -> ListenerId {
        self.inner.listeners.on(channel, listener)
    }

    fn once(&self, channel: &str, listener: Listener<MessageEvent>) -> ListenerId {
        self.inner.listeners.once(channel, listener)
    }

    fn off(&self, channel: &str, id: ListenerId) -> bool {
        self.inner.listeners.off(channel, id)
    }

    fn emit(&self, channel: &str, event: &MessageEvent, args: &[Value]) -> usize {
        self.inner.listeners.emit(channel, event, args)
    }
}

/// A per-connection view of a [`Router`].
///
/// Handlers and listeners registered here see only messages from this
/// connection and take precedence over the root ones. They are dropped when
/// the connection closes.
#[derive(Clone)]
pub struct ScopedRouter {
    router: Router,
    connection: ConnectionId,
    scope: Arc<Scope>,
}

impl ScopedRouter {
    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn handle<F, Fut>(&self, channel: &str, handler: F) -> Result<()>
    where
        F: Fn(InvokeEvent, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        insert_handler(&self.scope.handlers, channel, boxed(handler), false)
    }

    pub fn handle_once<F, Fut>(&self, channel: &str, handler: F) -> Result<()>
    where
        F: Fn(InvokeEvent, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        insert_handler(&self.scope.handlers, channel, boxed(handler), true)
    }

    pub fn remove_handler(&self, channel: &str) -> bool {
        self.scope.handlers.remove(channel).is_some()
    }

    pub async fn send(&self, channel: &str, args: Vec<Value>) -> Result<()> {
        self.router.send(self.connection, channel, args).await
    }

    pub async fn invoke(&self, channel: &str, args: Vec<Value>) -> Result<Value> {
        self.router.invoke(self.connection, channel, args).await
    }
}

impl MessageChannel for ScopedRouter {
    type Event = MessageEvent;

    fn on(&self, channel: &str, listener: Listener<MessageEvent>) -> ListenerId {
        self.scope.listeners.on(channel, listener)
    }

    fn once(&self, channel: &str, listener: Listener<MessageEvent>) -> ListenerId {
        self.scope.listeners.once(channel, listener)
    }

    fn off(&self, channel: &str, id: ListenerId) -> bool {
        self.scope.listeners.off(channel, id)
    }

    fn emit(&self, channel: &str, event: &MessageEvent, args: &[Value]) -> usize {
        self.scope.listeners.emit(channel, event, args)
    }
}

/// Reads frames off one connection until it closes, then tears it down.
async fn pump(router: Weak<RouterInner>, connection: ConnectionId, transport: Arc<dyn Transport>) {
    loop {
        let frame = match transport.recv().await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                debug!(%connection, "transport closed");
                break;
            }
            Err(e) => {
                warn!(%connection, error = %e, "transport failed");
                break;
            }
        };

        let Some(inner) = router.upgrade() else {
            return;
        };
        Router { inner }.dispatch(connection, &frame).await;
    }

    if let Some(inner) = router.upgrade() {
        Router { inner }.teardown(connection);
    }
}

/// A handler future that holds its channel's lock while it is polled, and
/// reports once its first poll has returned.
struct Exclusive {
    lock: Arc<Mutex<()>>,
    started: Option<oneshot::Sender<()>>,
    future: BoxFuture<anyhow::Result<Value>>,
}

impl Future for Exclusive {
    type Output = anyhow::Result<Value>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        let polled = {
            let _held = this.lock.lock().unwrap_or_else(|e| e.into_inner());
            this.future.as_mut().poll(cx)
        };
        if let Some(started) = this.started.take() {
            let _ = started.send(());
        }
        polled
    }
}

fn boxed<F, Fut>(handler: F) -> Handler
where
    F: Fn(InvokeEvent, Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    Arc::new(move |event: InvokeEvent, args: Vec<Value>| -> BoxFuture<anyhow::Result<Value>> {
        Box::pin(handler(event, args))
    })
}

fn insert_handler(
    handlers: &DashMap<String, HandlerEntry>,
    channel: &str,
    handler: Handler,
    once: bool,
) -> Result<()> {
    match handlers.entry(channel.to_string()) {
        Entry::Occupied(_) => Err(Error::DuplicateHandler(channel.to_string())),
        Entry::Vacant(slot) => {
            slot.insert(HandlerEntry { handler, once });
            Ok(())
        }
    }
}

/// Looks a handler up, removing it if it was registered with `handle_once`.
fn take_handler(handlers: &DashMap<String, HandlerEntry>, channel: &str) -> Option<Handler> {
    if let Some((_, entry)) = handlers.remove_if(channel, |_, entry| entry.once) {
        return Some(entry.handler);
    }
    handlers.get(channel).map(|entry| Arc::clone(&entry.handler))
}

fn settle(
    channel: &str,
    joined: std::result::Result<anyhow::Result<Value>, JoinError>,
) -> std::result::Result<Value, ErrorValue> {
    match joined {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => {
            error!(channel, error = %e, "Error occurred in handler for '{}'", channel);
            Err(error_value_of(&e))
        }
        Err(e) => {
            error!(channel, error = %e, "handler for '{}' ended without a result", channel);
            Err(ErrorValue::generic("reply was never sent"))
        }
    }
}
