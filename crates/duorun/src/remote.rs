//! # Remote Object Server
//!
//! Lets guests reach host objects through handles.
//!
//! Every request names the calling connection implicitly: handles a guest
//! receives are held on its behalf and released when it dereferences them,
//! asks for a context release, or disconnects.
//!
//! Values cross in both directions through two rewrites:
//!
//! - **export**: host objects inside a result become `Remote(object)` handles
//!   held by the caller. A guest's own callback goes back to it as the same
//!   `Remote(callback)` it sent; any other function is held like an object
//!   and called with `REMOTE_MEMBER_CALL(handle, "call", args...)`.
//! - **import**: `Remote(object)` handles inside arguments become the live
//!   objects again; `Remote(callback)` handles become proxies that send
//!   `REMOTE_CALLBACK` back to the guest that owns the function.

use std::sync::Arc;

use anyhow::Context;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;
use tracing::warn;

use duopack::ErrorValue;
use duopack::Handle;
use duopack::HandleTarget;
use duopack::RemoteRef;
use duopack::Value;
use duorpc::error_value_of;
use duorpc::ConnectionId;
use duorpc::InvokeEvent;
use duorpc::Router;

use crate::callbacks::function_value;
use crate::callbacks::CallbackRegistry;
use crate::callbacks::GuestFunction;
use crate::callbacks::GuestFunctionRef;
use crate::error::Error;
use crate::objects::object_value;
use crate::objects::HostObject;
use crate::objects::ObjectRegistry;
use crate::objects::RemoteObject;

pub const REMOTE_REQUIRE: &str = "REMOTE_REQUIRE";
pub const REMOTE_MEMBER_GET: &str = "REMOTE_MEMBER_GET";
pub const REMOTE_MEMBER_SET: &str = "REMOTE_MEMBER_SET";
pub const REMOTE_MEMBER_CALL: &str = "REMOTE_MEMBER_CALL";
pub const REMOTE_DEREFERENCE: &str = "REMOTE_DEREFERENCE";
pub const REMOTE_CONTEXT_RELEASE: &str = "REMOTE_CONTEXT_RELEASE";
/// Host to guest: `[callback handle, args...]`.
pub const REMOTE_CALLBACK: &str = "REMOTE_CALLBACK";

struct ServerInner {
    router: Router,
    objects: Arc<ObjectRegistry>,
    callbacks: Arc<CallbackRegistry>,
    modules: DashMap<String, HostObject>,
    /// Callback registry handle of the proxy for each guest function.
    proxies: DashMap<(ConnectionId, u64), Handle>,
}

#[derive(Clone)]
pub struct RemoteServer {
    inner: Arc<ServerInner>,
}

impl RemoteServer {
    pub fn new(router: Router, objects: Arc<ObjectRegistry>, callbacks: Arc<CallbackRegistry>) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                router,
                objects,
                callbacks,
                modules: DashMap::new(),
                proxies: DashMap::new(),
            }),
        }
    }

    /// Makes `object` available to `REMOTE_REQUIRE` under `name`.
    pub fn expose(&self, name: &str, object: HostObject) {
        self.inner.modules.insert(name.to_string(), object);
    }

    pub fn exposed(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.modules.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Registers the `REMOTE_*` handlers on the router.
    pub fn install(&self) -> duorpc::Result<()> {
        self.install_handler(REMOTE_REQUIRE, Self::require)?;
        self.install_handler(REMOTE_MEMBER_GET, Self::member_get)?;
        self.install_handler(REMOTE_MEMBER_SET, Self::member_set)?;
        self.install_handler(REMOTE_MEMBER_CALL, Self::member_call)?;
        self.install_handler(REMOTE_DEREFERENCE, Self::dereference)?;
        self.install_handler(REMOTE_CONTEXT_RELEASE, Self::context_release)?;
        Ok(())
    }

    fn install_handler(
        &self,
        channel: &str,
        op: fn(&RemoteServer, ConnectionId, Vec<Value>) -> anyhow::Result<Value>,
    ) -> duorpc::Result<()> {
        let server = self.clone();
        self.inner.router.handle(channel, move |event: InvokeEvent, args| {
            let result = op(&server, event.connection, args);
            async move { result }
        })
    }

    /// Drops the callback proxies of a connection that went away.
    pub fn release_connection(&self, connection: ConnectionId) -> usize {
        let keys: Vec<(ConnectionId, u64)> = self
            .inner
            .proxies
            .iter()
            .filter(|e| e.key().0 == connection)
            .map(|e| *e.key())
            .collect();
        let mut released = 0;
        for key in keys {
            if let Some((_, handle)) = self.inner.proxies.remove(&key) {
                self.inner.callbacks.remove(handle);
                released += 1;
            }
        }
        if released > 0 {
            debug!(%connection, released, "callback proxies released");
        }
        released
    }

    // ------------------------------------------------------------------
    //  Operations
    // ------------------------------------------------------------------

    fn require(&self, connection: ConnectionId, args: Vec<Value>) -> anyhow::Result<Value> {
        let name = str_arg(&args, 0, "module name")?;
        let object = self
            .inner
            .modules
            .get(name)
            .map(|m| Arc::clone(m.value()))
            .ok_or_else(|| Error::ModuleNotFound(name.to_string()))?;
        Ok(export_value(&self.inner.objects, connection, object_value(object)))
    }

    fn member_get(&self, connection: ConnectionId, args: Vec<Value>) -> anyhow::Result<Value> {
        let handle = handle_arg(&args, 0)?;
        let name = str_arg(&args, 1, "property name")?;
        let object = self.inner.objects.get(handle).map_err(|_| {
            anyhow::anyhow!("Cannot get property '{}' on missing remote object {}", name, handle.0)
        })?;
        let value = object.get(name)?;
        Ok(export_value(&self.inner.objects, connection, value))
    }

    fn member_set(&self, connection: ConnectionId, mut args: Vec<Value>) -> anyhow::Result<Value> {
        let handle = handle_arg(&args, 0)?;
        let name = str_arg(&args, 1, "property name")?.to_string();
        let object = self.inner.objects.get(handle).map_err(|_| {
            anyhow::anyhow!("Cannot set property '{}' on missing remote object {}", name, handle.0)
        })?;
        let value = if args.len() > 2 { args.swap_remove(2) } else { Value::Null };
        let value = self.import_value(connection, value)?;
        object.set(&name, value)?;
        Ok(Value::Null)
    }

    fn member_call(&self, connection: ConnectionId, args: Vec<Value>) -> anyhow::Result<Value> {
        let handle = handle_arg(&args, 0)?;
        let method = str_arg(&args, 1, "method name")?.to_string();
        let object = self.inner.objects.get(handle).map_err(|_| {
            anyhow::anyhow!("Cannot call method '{}' on missing remote object {}", method, handle.0)
        })?;

        let call_args = args
            .into_iter()
            .skip(2)
            .map(|a| self.import_value(connection, a))
            .collect::<anyhow::Result<Vec<Value>>>()?;

        match object.call(&method, call_args) {
            Ok(value) => Ok(export_value(&self.inner.objects, connection, value)),
            Err(e) => {
                let wrapped = ErrorValue::generic(format!(
                    "Could not call remote method '{}'. Check that the method signature is correct. Underlying error: {}",
                    method, e
                ))
                .with_cause(error_value_of(&e));
                Err(wrapped.into())
            }
        }
    }

    fn dereference(&self, connection: ConnectionId, args: Vec<Value>) -> anyhow::Result<Value> {
        let handle = handle_arg(&args, 0)?;
        Ok(Value::Bool(self.inner.objects.remove(connection, handle)))
    }

    fn context_release(&self, connection: ConnectionId, _: Vec<Value>) -> anyhow::Result<Value> {
        let released = self.inner.objects.clear(connection);
        self.release_connection(connection);
        Ok(Value::from(released as u64))
    }

    /// Replaces handles in a guest-supplied value with what they stand for.
    pub fn import_value(&self, connection: ConnectionId, value: Value) -> anyhow::Result<Value> {
        Ok(match value {
            Value::Remote(RemoteRef { target: HandleTarget::Object, handle }) => {
                let object = self
                    .inner
                    .objects
                    .get(handle)
                    .with_context(|| format!("argument refers to missing remote object {}", handle.0))?;
                object_value(object)
            }
            Value::Remote(RemoteRef { target: HandleTarget::Callback, handle }) => {
                self.callback_proxy(connection, handle.0)
            }
            Value::List(items) => Value::List(
                items
                    .into_iter()
                    .map(|v| self.import_value(connection, v))
                    .collect::<anyhow::Result<_>>()?,
            ),
            Value::Map(map) => Value::Map(
                map.into_iter()
                    .map(|(k, v)| -> anyhow::Result<(String, Value)> { Ok((k, self.import_value(connection, v)?)) })
                    .collect::<anyhow::Result<_>>()?,
            ),
            other => other,
        })
    }

    fn callback_proxy(&self, connection: ConnectionId, guest_id: u64) -> Value {
        // Held across registration so concurrent imports share one proxy.
        match self.inner.proxies.entry((connection, guest_id)) {
            Entry::Occupied(mut slot) => {
                let handle = *slot.get();
                if let Some(entry) = self.inner.callbacks.resolve(handle) {
                    return function_value(entry.callback);
                }
                let (proxy, handle) = self.new_proxy(connection, guest_id);
                slot.insert(handle);
                function_value(proxy)
            }
            Entry::Vacant(slot) => {
                let (proxy, handle) = self.new_proxy(connection, guest_id);
                slot.insert(handle);
                function_value(proxy)
            }
        }
    }

    fn new_proxy(&self, connection: ConnectionId, guest_id: u64) -> (GuestFunctionRef, Handle) {
        let proxy: GuestFunctionRef = Arc::new(RemoteCallback {
            router: self.inner.router.clone(),
            objects: Arc::clone(&self.inner.objects),
            connection,
            guest_id,
        });
        let handle = self.inner.callbacks.register(Arc::clone(&proxy));
        (proxy, handle)
    }

    /// Number of live callback proxies.
    pub fn proxy_count(&self) -> usize {
        self.inner.proxies.len()
    }
}

/// Replaces host objects in a host value with handles held by `connection`.
pub fn export_value(objects: &ObjectRegistry, connection: ConnectionId, value: Value) -> Value {
    match value {
        Value::Opaque(opaque) => {
            if let Some(object) = opaque.downcast::<HostObject>() {
                return Value::Remote(RemoteRef::object(objects.add(connection, Arc::clone(&*object))));
            }
            if let Some(function) = opaque.downcast::<GuestFunctionRef>() {
                return match function.guest_owner() {
                    Some((owner, guest_id)) if owner == connection => {
                        Value::Remote(RemoteRef::callback(Handle(guest_id)))
                    }
                    _ => {
                        let object: HostObject = Arc::new(FunctionObject(Arc::clone(&*function)));
                        Value::Remote(RemoteRef::object(objects.add(connection, object)))
                    }
                };
            }
            // Left for the codec to refuse.
            debug!(type_name = opaque.type_name(), "opaque value is not a host object");
            Value::Opaque(opaque)
        }
        Value::List(items) => Value::List(
            items
                .into_iter()
                .map(|v| export_value(objects, connection, v))
                .collect(),
        ),
        Value::Map(map) => Value::Map(
            map.into_iter()
                .map(|(k, v)| (k, export_value(objects, connection, v)))
                .collect(),
        ),
        other => other,
    }
}

/// A function handed to a guest that does not own it.
struct FunctionObject(GuestFunctionRef);

impl RemoteObject for FunctionObject {
    fn type_name(&self) -> &str {
        "Function"
    }

    fn get(&self, _: &str) -> anyhow::Result<Value> {
        Ok(Value::Null)
    }

    fn set(&self, name: &str, _: Value) -> anyhow::Result<()> {
        anyhow::bail!("cannot set property '{}' on a function", name)
    }

    fn call(&self, method: &str, args: Vec<Value>) -> anyhow::Result<Value> {
        match method {
            "call" => self.0.call(args),
            other => anyhow::bail!("Function has no method '{}'", other),
        }
    }
}

fn handle_arg(args: &[Value], index: usize) -> anyhow::Result<Handle> {
    match args.get(index) {
        Some(Value::Remote(r)) if r.target == HandleTarget::Object => Ok(r.handle),
        Some(v) => v
            .as_u64()
            .map(Handle)
            .with_context(|| format!("argument {} must be an object handle, got {}", index, v.kind_name())),
        None => anyhow::bail!("missing object handle argument"),
    }
}

fn str_arg<'a>(args: &'a [Value], index: usize, what: &str) -> anyhow::Result<&'a str> {
    args.get(index)
        .and_then(Value::as_str)
        .with_context(|| format!("missing {} argument", what))
}

/// A guest function, called by sending `REMOTE_CALLBACK` to its owner.
///
/// Calls are fire-and-forget and always return `Null`.
pub struct RemoteCallback {
    router: Router,
    objects: Arc<ObjectRegistry>,
    connection: ConnectionId,
    guest_id: u64,
}

impl RemoteCallback {
    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    pub fn guest_id(&self) -> u64 {
        self.guest_id
    }
}

impl GuestFunction for RemoteCallback {
    fn call(&self, args: Vec<Value>) -> anyhow::Result<Value> {
        if !self.router.is_connected(self.connection) {
            warn!(
                location = %self.location().unwrap_or_default(),
                "callback invoked after its guest went away"
            );
            return Ok(Value::Null);
        }

        let runtime = tokio::runtime::Handle::try_current()
            .context("guest callbacks can only be called inside a tokio runtime")?;

        let mut payload = Vec::with_capacity(args.len() + 1);
        payload.push(Value::Remote(RemoteRef::callback(Handle(self.guest_id))));
        payload.extend(
            args.into_iter()
                .map(|a| export_value(&self.objects, self.connection, a)),
        );

        let router = self.router.clone();
        let connection = self.connection;
        let guest_id = self.guest_id;
        runtime.spawn(async move {
            if let Err(e) = router.send(connection, REMOTE_CALLBACK, payload).await {
                warn!(%connection, guest_id, error = %e, "guest callback could not be delivered");
            }
        });
        Ok(Value::Null)
    }

    fn location(&self) -> Option<String> {
        Some(format!("guest {} callback {}", self.connection, self.guest_id))
    }

    fn guest_owner(&self) -> Option<(ConnectionId, u64)> {
        Some((self.connection, self.guest_id))
    }
}
