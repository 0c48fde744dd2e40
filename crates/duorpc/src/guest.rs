//! # Guest Port
//!
//! The guest end of a connection. A guest is one thread running untrusted
//! code, so everything here is blocking and nothing runs unless the guest
//! asks for it: messages are dispatched only inside [`GuestPort::poll`] (and
//! [`Invocation::wait`], which polls).
//!
//! [`GuestPort::send_sync`] is the one reentrant path. While it waits it reads
//! the transport itself, returns on the single frame that answers it, and
//! queues every other frame unexecuted for the next `poll`.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;
use tracing::debug;
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
use crate::message::reply_channel;
use crate::message::ConnectionId;
use crate::message::Message;
use crate::message::MessageKind;
use crate::pending::Completion;
use crate::pending::PendingTable;
use crate::transport::BlockingTransport;

/// A guest-side handler for host invokes.
pub type GuestHandler = Arc<dyn Fn(&GuestEvent, Vec<Value>) -> anyhow::Result<Value> + Send + Sync>;

/// Context handed to guest listeners and handlers.
#[derive(Clone, Debug)]
pub struct GuestEvent {
    pub channel: String,
    pub correlation_id: Option<u64>,
}

pub struct GuestPort {
    connection: ConnectionId,
    transport: Box<dyn BlockingTransport>,
    config: RouterConfig,
    pending: PendingTable,
    handlers: Mutex<HashMap<String, GuestHandler>>,
    listeners: Emitter<GuestEvent>,
    deferred: Mutex<VecDeque<Message>>,
}

impl GuestPort {
    pub fn new<T: BlockingTransport>(connection: ConnectionId, transport: T) -> Self {
        Self::with_config(connection, transport, RouterConfig::default())
    }

    pub fn with_config<T: BlockingTransport>(connection: ConnectionId, transport: T, config: RouterConfig) -> Self {
        Self {
            connection,
            transport: Box::new(transport),
            pending: PendingTable::new(config.marker_ttl),
            config,
            handlers: Mutex::new(HashMap::new()),
            listeners: Emitter::new(),
            deferred: Mutex::new(VecDeque::new()),
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection
    }

    /// Fire-and-forget message to the host.
    pub fn send(&self, channel: &str, args: Vec<Value>) -> Result<()> {
        let payload = duopack::encode_all(&args)?;
        self.transmit(&Message::send(channel, payload))
    }

    /// Sends `args` and blocks until the host answers.
    ///
    /// Frames that are not the answer are queued, not executed. They are
    /// dispatched by the next [`GuestPort::poll`].
    pub fn send_sync(&self, channel: &str, args: Vec<Value>) -> Result<Value> {
        let payload = duopack::encode_all(&args)?;
        let (id, _rx) = self.pending.allocate(channel, None);
        if let Err(e) = self.transmit(&Message::request(MessageKind::Sync, channel, id, payload)) {
            self.pending.forget(id);
            return Err(e);
        }

        let expected = reply_channel(channel, id);
        let deadline = self.config.sync_timeout.map(|t| Instant::now() + t);

        loop {
            let wait = remaining(deadline);
            if wait == Some(Duration::ZERO) {
                self.pending.cancel(id);
                return Err(Error::Timeout {
                    channel: channel.to_string(),
                    after: self.config.sync_timeout.unwrap_or_default(),
                });
            }

            let frame = match self.transport.recv_timeout(wait) {
                Ok(Some(frame)) => frame,
                Ok(None) => continue,
                Err(e) => {
                    self.pending.forget(id);
                    return Err(e.into());
                }
            };

            let message = match Message::from_bytes(&frame) {
                Ok(message) => message,
                Err(e) => {
                    warn!(connection = %self.connection, error = %e, "dropping unreadable frame");
                    continue;
                }
            };

            if message.kind.is_reply() && message.correlation_id == Some(id) && message.channel == expected {
                self.pending.forget(id);
                return message.outcome();
            }

            debug!(connection = %self.connection, channel = %message.channel, "deferring frame during send_sync");
            if let Ok(mut deferred) = self.deferred.lock() {
                deferred.push_back(message);
            }
        }
    }

    /// Sends a correlated request. Use [`Invocation::wait`] to get the reply.
    pub fn invoke(&self, channel: &str, args: Vec<Value>) -> Result<Invocation> {
        let payload = duopack::encode_all(&args)?;
        let (id, rx) = self.pending.allocate(channel, None);
        if let Err(e) = self.transmit(&Message::request(MessageKind::Invoke, channel, id, payload)) {
            self.pending.forget(id);
            return Err(e);
        }
        Ok(Invocation {
            id,
            channel: channel.to_string(),
            rx,
        })
    }

    /// Registers the handler for host invokes on `channel`.
    pub fn handle<F>(&self, channel: &str, handler: F) -> Result<()>
    where
        F: Fn(&GuestEvent, Vec<Value>) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        let mut handlers = self
            .handlers
            .lock()
            .map_err(|_| Error::Protocol("handler table poisoned".into()))?;
        if handlers.contains_key(channel) {
            return Err(Error::DuplicateHandler(channel.to_string()));
        }
        handlers.insert(channel.to_string(), Arc::new(handler));
        Ok(())
    }

    pub fn remove_handler(&self, channel: &str) -> bool {
        self.handlers
            .lock()
            .map(|mut h| h.remove(channel).is_some())
            .unwrap_or(false)
    }

    /// Number of frames queued by `send_sync` and not yet dispatched.
    pub fn deferred_count(&self) -> usize {
        self.deferred.lock().map(|d| d.len()).unwrap_or(0)
    }

    /// Dispatches queued frames, then waits up to `timeout` (forever when
    /// `None`) for more. Returns how many frames were dispatched.
    pub fn poll(&self, timeout: Option<Duration>) -> Result<usize> {
        let mut handled = self.drain_deferred();
        let mut wait = if handled == 0 { timeout } else { Some(Duration::ZERO) };

        while let Some(frame) = self.transport.recv_timeout(wait)? {
            match Message::from_bytes(&frame) {
                Ok(message) => self.dispatch(message),
                Err(e) => warn!(connection = %self.connection, error = %e, "dropping unreadable frame"),
            }
            handled += 1;
            // A handler that called send_sync may have queued frames.
            handled += self.drain_deferred();
            wait = Some(Duration::ZERO);
        }
        Ok(handled)
    }

    fn drain_deferred(&self) -> usize {
        let mut handled = 0;
        loop {
            let next = match self.deferred.lock() {
                Ok(mut deferred) => deferred.pop_front(),
                Err(_) => None,
            };
            let Some(message) = next else {
                return handled;
            };
            self.dispatch(message);
            handled += 1;
        }
    }

    fn dispatch(&self, message: Message) {
        match message.kind {
            MessageKind::Resolve | MessageKind::Reject => {
                let Some(id) = message.correlation_id else {
                    warn!(connection = %self.connection, channel = %message.channel, "reply without correlation id");
                    return;
                };
                match self.pending.complete(id, &message.channel, None, message.outcome()) {
                    Completion::Delivered => {}
                    Completion::Cancelled => {
                        debug!(channel = %message.channel, correlation_id = id, "discarding late reply")
                    }
                    other => {
                        warn!(channel = %message.channel, correlation_id = id, outcome = ?other, "unmatched reply")
                    }
                }
            }
            MessageKind::Send => {
                let args = match duopack::decode_all(&message.payload) {
                    Ok(args) => args,
                    Err(e) => {
                        warn!(channel = %message.channel, error = %e, "dropping undecodable message");
                        return;
                    }
                };
                let event = GuestEvent {
                    channel: message.channel.clone(),
                    correlation_id: None,
                };
                if self.listeners.emit(&message.channel, &event, &args) == 0 {
                    debug!(channel = %message.channel, "no listener for message");
                }
            }
            MessageKind::Invoke | MessageKind::Sync => self.answer(message),
        }
    }

    fn answer(&self, message: Message) {
        let Some(id) = message.correlation_id else {
            warn!(channel = %message.channel, "request without correlation id");
            return;
        };
        let channel = message.channel;

        let handler = self
            .handlers
            .lock()
            .ok()
            .and_then(|h| h.get(&channel).cloned());

        let outcome = match handler {
            None => Err(ErrorValue::generic(format!("No handler registered for '{}'", channel))),
            Some(handler) => match duopack::decode_all(&message.payload) {
                Err(e) => Err(ErrorValue::from_error(&e)),
                Ok(args) => {
                    let event = GuestEvent {
                        channel: channel.clone(),
                        correlation_id: Some(id),
                    };
                    handler(&event, args).map_err(|e| error_value_of(&e))
                }
            },
        };

        let reply = match outcome.and_then(|value| duopack::encode(&value).map_err(|e| ErrorValue::from_error(&e))) {
            Ok(envelope) => Message::resolve(&channel, id, envelope),
            Err(error) => Message::reject(&channel, id, error_envelope(&error)),
        };
        if let Err(e) = self.transmit(&reply) {
            warn!(channel = %channel, correlation_id = id, error = %e, "could not deliver reply");
        }
    }

    fn transmit(&self, message: &Message) -> Result<()> {
        let stamped = message.clone().from_connection(self.connection);
        self.transport.send(&stamped.to_bytes()?)?;
        Ok(())
    }
}

impl MessageChannel for GuestPort {
    type Event = GuestEvent;

    fn on(&self, channel: &str, listener: Listener<GuestEvent>) -> ListenerId {
        self.listeners.on(channel, listener)
    }

    fn once(&self, channel: &str, listener: Listener<GuestEvent>) -> ListenerId {
        self.listeners.once(channel, listener)
    }

    fn off(&self, channel: &str, id: ListenerId) -> bool {
        self.listeners.off(channel, id)
    }

    fn emit(&self, channel: &str, event: &GuestEvent, args: &[Value]) -> usize {
        self.listeners.emit(channel, event, args)
    }
}

/// An invoke in flight from a guest.
pub struct Invocation {
    id: u64,
    channel: String,
    rx: oneshot::Receiver<Result<Value>>,
}

impl Invocation {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns the reply if it has already been dispatched.
    pub fn try_result(&mut self) -> Option<Result<Value>> {
        match self.rx.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Closed) => Some(Err(Error::ConnectionClosed)),
        }
    }

    /// Polls `port` until the reply arrives or `timeout` passes.
    ///
    /// Other frames that arrive meanwhile are dispatched normally.
    pub fn wait(mut self, port: &GuestPort, timeout: Option<Duration>) -> Result<Value> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if let Some(outcome) = self.try_result() {
                return outcome;
            }
            let wait = remaining(deadline);
            if wait == Some(Duration::ZERO) {
                port.pending.cancel(self.id);
                return Err(Error::Timeout {
                    channel: self.channel,
                    after: timeout.unwrap_or_default(),
                });
            }
            port.poll(wait)?;
        }
    }
}

fn remaining(deadline: Option<Instant>) -> Option<Duration> {
    deadline.map(|d| d.saturating_duration_since(Instant::now()))
}
