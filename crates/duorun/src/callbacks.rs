//! # Callback Registry
//!
//! Guest functions the host can call back into, addressed by handle.
//!
//! Registering the same function twice yields the same handle. Invoking a
//! handle that is no longer registered is a quiet no-op returning `Null`:
//! guests routinely drop callbacks while the host still holds their handle.

use std::collections::HashMap;
use std::panic::Location;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::Weak;

use tracing::debug;
use tracing::trace;

use duopack::Handle;
use duopack::Opaque;
use duopack::Value;
use duorpc::ConnectionId;

/// A function owned by a guest.
pub trait GuestFunction: Send + Sync + 'static {
    fn call(&self, args: Vec<Value>) -> anyhow::Result<Value>;

    /// Where the function was defined, when known.
    fn location(&self) -> Option<String> {
        None
    }

    /// The connection and guest-side id this function stands in for, if it
    /// is a proxy for a guest's own function.
    fn guest_owner(&self) -> Option<(ConnectionId, u64)> {
        None
    }
}

impl<F> GuestFunction for F
where
    F: Fn(Vec<Value>) -> anyhow::Result<Value> + Send + Sync + 'static,
{
    fn call(&self, args: Vec<Value>) -> anyhow::Result<Value> {
        self(args)
    }
}

pub type GuestFunctionRef = Arc<dyn GuestFunction>;

pub fn function_value(callback: GuestFunctionRef) -> Value {
    Value::Opaque(Opaque::new(Arc::new(callback)))
}

pub fn as_guest_function(value: &Value) -> Option<GuestFunctionRef> {
    match value {
        Value::Opaque(opaque) => opaque
            .downcast::<GuestFunctionRef>()
            .map(|f| Arc::clone(&*f)),
        _ => None,
    }
}

#[derive(Clone)]
pub struct CallbackEntry {
    pub callback: GuestFunctionRef,
    pub debug_location: Option<String>,
}

impl std::fmt::Debug for CallbackEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackEntry")
            .field("debug_location", &self.debug_location)
            .finish_non_exhaustive()
    }
}

struct IdentityTag {
    callback: Weak<dyn GuestFunction>,
    handle: Handle,
}

#[derive(Default)]
struct Tables {
    next_id: u64,
    entries: HashMap<Handle, CallbackEntry>,
    identity: HashMap<usize, IdentityTag>,
}

fn identity_key(callback: &GuestFunctionRef) -> usize {
    Arc::as_ptr(callback) as *const () as usize
}

/// Call sites inside the messaging core say nothing about who made the
/// callback, so they are not recorded.
fn is_internal(file: &str) -> bool {
    let file = file.replace('\\', "/");
    file.contains("duorun/src/") || file.contains("duorpc/src/")
}

pub struct CallbackRegistry {
    tables: Mutex<Tables>,
}

impl Default for CallbackRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CallbackRegistry {
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

    #[track_caller]
    pub fn register(&self, callback: GuestFunctionRef) -> Handle {
        let caller = Location::caller();
        let key = identity_key(&callback);

        let mut t = self.tables();
        if let Some(tag) = t.identity.get(&key) {
            if tag.callback.upgrade().is_some() && t.entries.contains_key(&tag.handle) {
                return tag.handle;
            }
        }

        let debug_location = callback.location().or_else(|| {
            (!is_internal(caller.file()))
                .then(|| format!("{}:{}:{}", caller.file(), caller.line(), caller.column()))
        });

        let handle = Handle(t.next_id);
        t.next_id += 1;
        t.identity.insert(
            key,
            IdentityTag {
                callback: Arc::downgrade(&callback),
                handle,
            },
        );
        debug!(%handle, location = ?debug_location, "callback registered");
        t.entries.insert(
            handle,
            CallbackEntry {
                callback,
                debug_location,
            },
        );
        handle
    }

    pub fn resolve(&self, handle: Handle) -> Option<CallbackEntry> {
        self.tables().entries.get(&handle).cloned()
    }

    /// The handle `callback` is registered under, if any.
    pub fn handle_of(&self, callback: &GuestFunctionRef) -> Option<Handle> {
        let t = self.tables();
        t.identity
            .get(&identity_key(callback))
            .filter(|tag| tag.callback.upgrade().is_some())
            .map(|tag| tag.handle)
            .filter(|handle| t.entries.contains_key(handle))
    }

    pub fn invoke(&self, handle: Handle, args: Vec<Value>) -> anyhow::Result<Value> {
        // Resolve first so the lock is released before guest code runs.
        match self.resolve(handle) {
            Some(entry) => entry.callback.call(args),
            None => {
                trace!(%handle, "invoke on released callback ignored");
                Ok(Value::Null)
            }
        }
    }

    pub fn remove(&self, handle: Handle) -> bool {
        let mut t = self.tables();
        match t.entries.remove(&handle) {
            Some(entry) => {
                t.identity.remove(&identity_key(&entry.callback));
                debug!(%handle, "callback removed");
                true
            }
            None => false,
        }
    }

    /// Registered callbacks with where they came from, oldest first.
    pub fn outstanding(&self) -> Vec<(Handle, Option<String>)> {
        let mut out: Vec<_> = self
            .tables()
            .entries
            .iter()
            .map(|(h, e)| (*h, e.debug_location.clone()))
            .collect();
        out.sort_by_key(|(h, _)| *h);
        out
    }

    pub fn len(&self) -> usize {
        self.tables().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables().entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Located;

    impl GuestFunction for Located {
        fn call(&self, _: Vec<Value>) -> anyhow::Result<Value> {
            Ok(Value::from("located"))
        }

        fn location(&self) -> Option<String> {
            Some("preload.wat:12".into())
        }
    }

    fn echo() -> GuestFunctionRef {
        Arc::new(|args: Vec<Value>| -> anyhow::Result<Value> { Ok(Value::List(args)) })
    }

    #[test]
    fn test_register_is_idempotent() {
        let registry = CallbackRegistry::new();
        let f = echo();

        let a = registry.register(Arc::clone(&f));
        let b = registry.register(Arc::clone(&f));
        assert_eq!(a, b);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.handle_of(&f), Some(a));

        let g = echo();
        assert_ne!(registry.register(g), a);
    }

    #[test]
    fn test_invoke_calls_through() {
        let registry = CallbackRegistry::new();
        let handle = registry.register(echo());
        let result = registry.invoke(handle, vec![Value::from(1)]).unwrap();
        assert_eq!(result, Value::List(vec![Value::from(1)]));
    }

    #[test]
    fn test_invoke_missing_is_null() {
        let registry = CallbackRegistry::new();
        assert_eq!(registry.invoke(Handle(99), vec![]).unwrap(), Value::Null);
    }

    #[test]
    fn test_remove_allows_fresh_registration() {
        let registry = CallbackRegistry::new();
        let f = echo();
        let first = registry.register(Arc::clone(&f));

        assert!(registry.remove(first));
        assert!(!registry.remove(first));
        assert!(registry.resolve(first).is_none());
        assert_eq!(registry.handle_of(&f), None);

        let second = registry.register(f);
        assert!(second > first);
    }

    #[test]
    fn test_internal_call_site_is_not_recorded() {
        let registry = CallbackRegistry::new();
        let handle = registry.register(echo());
        assert_eq!(registry.resolve(handle).unwrap().debug_location, None);
    }

    #[test]
    fn test_own_location_wins() {
        let registry = CallbackRegistry::new();
        let handle = registry.register(Arc::new(Located));
        assert_eq!(
            registry.outstanding(),
            vec![(handle, Some("preload.wat:12".to_string()))]
        );
    }

    #[test]
    fn test_function_value_roundtrip() {
        let f = echo();
        let value = function_value(Arc::clone(&f));
        assert!(Arc::ptr_eq(&as_guest_function(&value).unwrap(), &f));
        assert!(as_guest_function(&Value::Null).is_none());
    }
}
