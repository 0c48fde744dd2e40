//! # Module map
//!
//! The closed set of modules a script may import. Eager modules exist from
//! the start; lazy ones are built by their factory on first `require` and
//! memoized. Any other name is `ModuleNotFound`.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::OnceLock;

use tracing::debug;
use wasmtime::Linker;

use crate::error::Error;
use crate::error::Result;
use crate::loader::bindings::Bridge;
use crate::loader::bindings::BufferModule;
use crate::loader::bindings::Console;
use crate::loader::bindings::Process;
use crate::loader::bindings::ScriptCtx;

/// A capability module scripts import by name.
pub trait HostModule: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Defines the module's functions under its name.
    fn install(&self, linker: &mut Linker<ScriptCtx>) -> Result<()>;
}

type Factory = Box<dyn Fn() -> Arc<dyn HostModule> + Send + Sync>;

struct LazyModule {
    factory: Factory,
    built: OnceLock<Arc<dyn HostModule>>,
}

#[derive(Default)]
pub struct ModuleMap {
    eager: HashMap<String, Arc<dyn HostModule>>,
    lazy: HashMap<String, LazyModule>,
}

impl ModuleMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// `bridge`, `process` and `console` eagerly, `buffer` lazily.
    pub fn with_builtins() -> Self {
        let mut map = Self::new();
        map.add_eager(Arc::new(Bridge));
        map.add_eager(Arc::new(Process));
        map.add_eager(Arc::new(Console));
        map.add_lazy("buffer", || Arc::new(BufferModule));
        map
    }

    pub fn add_eager(&mut self, module: Arc<dyn HostModule>) {
        let name = module.name().to_string();
        self.lazy.remove(&name);
        self.eager.insert(name, module);
    }

    pub fn add_lazy<F>(&mut self, name: &str, factory: F)
    where
        F: Fn() -> Arc<dyn HostModule> + Send + Sync + 'static,
    {
        self.eager.remove(name);
        self.lazy.insert(
            name.to_string(),
            LazyModule {
                factory: Box::new(factory),
                built: OnceLock::new(),
            },
        );
    }

    pub fn require(&self, name: &str) -> Result<Arc<dyn HostModule>> {
        if let Some(module) = self.eager.get(name) {
            return Ok(Arc::clone(module));
        }
        if let Some(lazy) = self.lazy.get(name) {
            let module = lazy.built.get_or_init(|| {
                debug!(module = name, "building lazy module");
                (lazy.factory)()
            });
            return Ok(Arc::clone(module));
        }
        Err(Error::ModuleNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.eager.contains_key(name) || self.lazy.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.eager.keys().chain(self.lazy.keys()).cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    use super::*;

    struct Named(&'static str);

    impl HostModule for Named {
        fn name(&self) -> &str {
            self.0
        }

        fn install(&self, _: &mut Linker<ScriptCtx>) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_builtins() {
        let map = ModuleMap::with_builtins();
        assert_eq!(map.names(), vec!["bridge", "buffer", "console", "process"]);
        assert_eq!(map.require("bridge").unwrap().name(), "bridge");
        assert_eq!(map.require("buffer").unwrap().name(), "buffer");
    }

    #[test]
    fn test_unknown_module() {
        let map = ModuleMap::with_builtins();
        assert!(!map.contains("fs"));
        match map.require("fs") {
            Err(Error::ModuleNotFound(name)) => assert_eq!(name, "fs"),
            _ => panic!("expected ModuleNotFound"),
        }
    }

    #[test]
    fn test_lazy_factory_runs_once() {
        let built = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&built);

        let mut map = ModuleMap::new();
        map.add_lazy("timers", move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Arc::new(Named("timers"))
        });
        assert_eq!(built.load(Ordering::SeqCst), 0);

        let first = map.require("timers").unwrap();
        let second = map.require("timers").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(built.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_eager_replaces_lazy() {
        let mut map = ModuleMap::with_builtins();
        map.add_eager(Arc::new(Named("buffer")));
        assert_eq!(map.names().iter().filter(|n| *n == "buffer").count(), 1);
        assert!(map.require("buffer").is_ok());
    }
}
