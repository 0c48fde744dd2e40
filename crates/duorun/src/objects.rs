//! # Object Registry
//!
//! Host objects handed to guests by handle.
//!
//! Each entry counts the distinct connections that hold its handle. Each
//! connection additionally counts how many times it was handed the handle, so
//! a guest that received the same object twice has to release it twice. An
//! entry dies when its last holding connection lets go.
//!
//! Deduplication goes through an identity side table keyed by the object's
//! address. The table keeps a weak reference, so an address reused by a new
//! allocation never inherits a stale handle.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::Weak;

use tracing::debug;

use duopack::Handle;
use duopack::Opaque;
use duopack::Value;
use duorpc::ConnectionId;

use crate::error::Error;
use crate::error::Result;

/// A host-side object reachable from guests through a handle.
pub trait RemoteObject: Send + Sync + 'static {
    fn type_name(&self) -> &str;

    fn get(&self, name: &str) -> anyhow::Result<Value>;

    fn set(&self, name: &str, value: Value) -> anyhow::Result<()>;

    fn call(&self, method: &str, args: Vec<Value>) -> anyhow::Result<Value>;
}

pub type HostObject = Arc<dyn RemoteObject>;

/// Wraps a host object so it can travel inside a [`Value`] on the host side.
pub fn object_value(object: HostObject) -> Value {
    Value::Opaque(Opaque::new(Arc::new(object)))
}

/// The host object inside a value built by [`object_value`], if any.
pub fn as_host_object(value: &Value) -> Option<HostObject> {
    match value {
        Value::Opaque(opaque) => opaque.downcast::<HostObject>().map(|o| Arc::clone(&*o)),
        _ => None,
    }
}

type Method = Arc<dyn Fn(&PlainObject, Vec<Value>) -> anyhow::Result<Value> + Send + Sync>;

/// A keyed mapping with optional methods.
pub struct PlainObject {
    type_name: String,
    fields: Mutex<BTreeMap<String, Value>>,
    methods: HashMap<String, Method>,
}

impl PlainObject {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            fields: Mutex::new(BTreeMap::new()),
            methods: HashMap::new(),
        }
    }

    pub fn with_field(self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields().insert(name.into(), value.into());
        self
    }

    pub fn with_method<F>(mut self, name: impl Into<String>, method: F) -> Self
    where
        F: Fn(&PlainObject, Vec<Value>) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.methods.insert(name.into(), Arc::new(method));
        self
    }

    /// Locks the field table.
    pub fn fields(&self) -> MutexGuard<'_, BTreeMap<String, Value>> {
        self.fields.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn into_object(self) -> HostObject {
        Arc::new(self)
    }
}

impl RemoteObject for PlainObject {
    fn type_name(&self) -> &str {
        &self.type_name
    }

    fn get(&self, name: &str) -> anyhow::Result<Value> {
        Ok(self.fields().get(name).cloned().unwrap_or_default())
    }

    fn set(&self, name: &str, value: Value) -> anyhow::Result<()> {
        self.fields().insert(name.to_string(), value);
        Ok(())
    }

    fn call(&self, method: &str, args: Vec<Value>) -> anyhow::Result<Value> {
        match self.methods.get(method) {
            Some(method) => method(self, args),
            None => anyhow::bail!("{} has no method '{}'", self.type_name, method),
        }
    }
}

struct ObjectEntry {
    object: HostObject,
    refcount: u32,
}

struct IdentityTag {
    object: Weak<dyn RemoteObject>,
    handle: Handle,
}

#[derive(Default)]
struct Tables {
    next_id: u64,
    entries: HashMap<Handle, ObjectEntry>,
    identity: HashMap<usize, IdentityTag>,
    holds: HashMap<ConnectionId, HashMap<Handle, u32>>,
}

impl Tables {
    /// Drops one connection's interest in `handle` entirely.
    fn release(&mut self, handle: Handle) {
        let Some(entry) = self.entries.get_mut(&handle) else {
            return;
        };
        entry.refcount = entry.refcount.saturating_sub(1);
        if entry.refcount == 0 {
            if let Some(entry) = self.entries.remove(&handle) {
                self.identity.remove(&identity_key(&entry.object));
            }
        }
    }
}

fn identity_key(object: &HostObject) -> usize {
    Arc::as_ptr(object) as *const () as usize
}

pub struct ObjectRegistry {
    tables: Mutex<Tables>,
}

impl Default for ObjectRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectRegistry {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables {
                next_id: 1,
                ..Tables::default()
            }),
        }
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Grants `connection` a handle to `object`, reusing the existing handle
    /// if the object is already registered.
    pub fn add(&self, connection: ConnectionId, object: HostObject) -> Handle {
        let key = identity_key(&object);
        let mut t = self.tables();

        let existing = t
            .identity
            .get(&key)
            .filter(|tag| tag.object.upgrade().is_some())
            .map(|tag| tag.handle)
            .filter(|handle| t.entries.contains_key(handle));

        let handle = match existing {
            Some(handle) => handle,
            None => {
                let handle = Handle(t.next_id);
                t.next_id += 1;
                t.identity.insert(
                    key,
                    IdentityTag {
                        object: Arc::downgrade(&object),
                        handle,
                    },
                );
                t.entries.insert(handle, ObjectEntry { object, refcount: 0 });
                handle
            }
        };

        let holds = t.holds.entry(connection).or_default().entry(handle).or_insert(0);
        *holds += 1;
        let first_hold = *holds == 1;
        if first_hold {
            if let Some(entry) = t.entries.get_mut(&handle) {
                entry.refcount += 1;
            }
        }

        debug!(%connection, %handle, first_hold, "object handle granted");
        handle
    }

    pub fn get(&self, handle: Handle) -> Result<HostObject> {
        self.tables()
            .entries
            .get(&handle)
            .map(|e| Arc::clone(&e.object))
            .ok_or(Error::NotFound(handle))
    }

    /// Drops one of `connection`'s holds on `handle`. A connection that does
    /// not hold the handle is ignored.
    pub fn remove(&self, connection: ConnectionId, handle: Handle) -> bool {
        let mut t = self.tables();
        let Some(held) = t.holds.get_mut(&connection) else {
            return false;
        };
        let Some(count) = held.get_mut(&handle) else {
            return false;
        };

        *count -= 1;
        if *count == 0 {
            held.remove(&handle);
            if held.is_empty() {
                t.holds.remove(&connection);
            }
            t.release(handle);
        }
        debug!(%connection, %handle, "object handle released");
        true
    }

    /// Releases every handle `connection` holds. Safe to call repeatedly.
    pub fn clear(&self, connection: ConnectionId) -> usize {
        let mut t = self.tables();
        let Some(held) = t.holds.remove(&connection) else {
            return 0;
        };
        for handle in held.keys() {
            t.release(*handle);
        }
        debug!(%connection, released = held.len(), "connection handles cleared");
        held.len()
    }

    /// Number of distinct connections holding `handle`.
    pub fn refcount(&self, handle: Handle) -> Option<u32> {
        self.tables().entries.get(&handle).map(|e| e.refcount)
    }

    /// How many times `connection` was handed `handle` without releasing it.
    pub fn holds(&self, connection: ConnectionId, handle: Handle) -> u32 {
        self.tables()
            .holds
            .get(&connection)
            .and_then(|h| h.get(&handle).copied())
            .unwrap_or(0)
    }

    /// Handles currently held by `connection`, in ascending order.
    pub fn handles_of(&self, connection: ConnectionId) -> Vec<Handle> {
        let mut handles: Vec<Handle> = self
            .tables()
            .holds
            .get(&connection)
            .map(|h| h.keys().copied().collect())
            .unwrap_or_default();
        handles.sort();
        handles
    }

    pub fn len(&self) -> usize {
        self.tables().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables().entries.is_empty()
    }
}
