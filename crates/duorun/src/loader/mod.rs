//! # Script Loader
//!
//! Runs preload scripts inside a guest context before any other guest code.
//!
//! ## Philosophy
//!
//! - **Closed World**: a script sees only the modules it imports, and every
//!   import goes through [`ModuleMap::require`]. There is no ambient host.
//! - **One Scope Per Script**: each script gets its own store and linker, so
//!   nothing one script defines is visible to the next.
//! - **Fail Alone**: a script that fails is logged, reported on the error
//!   channel with its path, and skipped. The rest still run.
//!
//! A script is a WebAssembly module (text or binary) exporting `main: () -> ()`
//! and, if it calls any built-in that takes pointers, its `memory`.

pub mod bindings;
pub mod modules;

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::debug;
use tracing::error;
use tracing::info;
use wasmtime::Engine;
use wasmtime::Linker;
use wasmtime::Module;
use wasmtime::Store;
use wasmtime::Trap;

use duopack::Origin;
use duopack::Value;
use duorpc::GuestPort;

use crate::config::LoaderConfig;
use crate::error::Error;
use crate::error::Result;

pub use bindings::ScriptCtx;
pub use modules::HostModule;
pub use modules::ModuleMap;

/// One preload script as handed over by the script provider.
#[derive(Clone, Debug, Default)]
pub struct ScriptSource {
    pub path: String,
    pub source_text: Option<String>,
    pub source_binary: Option<Vec<u8>>,
    /// Why the provider could not read the script.
    pub load_error: Option<String>,
}

impl ScriptSource {
    /// A script in WebAssembly text form.
    pub fn text(path: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            source_text: Some(source.into()),
            ..Self::default()
        }
    }

    pub fn binary(path: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            path: path.into(),
            source_binary: Some(bytes),
            ..Self::default()
        }
    }

    /// A script the provider failed to read.
    pub fn unavailable(path: impl Into<String>, load_error: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            load_error: Some(load_error.into()),
            ..Self::default()
        }
    }

    fn bytes(&self) -> Result<&[u8]> {
        if let Some(text) = &self.source_text {
            return Ok(text.as_bytes());
        }
        if let Some(bytes) = &self.source_binary {
            return Ok(bytes);
        }
        Err(Error::SourceUnavailable(
            self.load_error.clone().unwrap_or_else(|| "no source provided".to_string()),
        ))
    }
}

/// What happened to each script of one load.
#[derive(Debug, Default)]
pub struct LoadReport {
    /// Paths whose `main` returned normally, in load order.
    pub ran: Vec<String>,
    pub failed: Vec<(String, Error)>,
}

impl LoadReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct ScriptLoader {
    engine: Engine,
    modules: ModuleMap,
    config: LoaderConfig,
}

impl ScriptLoader {
    /// A loader with the built-in modules.
    pub fn new(config: LoaderConfig) -> Result<Self> {
        Self::with_modules(config, ModuleMap::with_builtins())
    }

    pub fn with_modules(config: LoaderConfig, modules: ModuleMap) -> Result<Self> {
        let mut engine_config = wasmtime::Config::new();
        engine_config.consume_fuel(config.fuel.is_some());
        let engine = Engine::new(&engine_config).map_err(|e| Error::Link(format!("{:#}", e)))?;
        Ok(Self {
            engine,
            modules,
            config,
        })
    }

    pub fn modules(&self) -> &ModuleMap {
        &self.modules
    }

    pub fn modules_mut(&mut self) -> &mut ModuleMap {
        &mut self.modules
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// Runs `scripts` in order on the calling thread.
    ///
    /// Blocks while scripts call `send_sync`, so call it from the guest's own
    /// thread, never from inside an async task.
    pub fn load(&self, port: &Arc<GuestPort>, scripts: &[ScriptSource]) -> LoadReport {
        let mut report = LoadReport::default();

        for script in scripts {
            match self.run(port, script) {
                Ok(()) => {
                    info!(script = %script.path, "preload script ran");
                    report.ran.push(script.path.clone());
                }
                Err(e) => {
                    error!(script = %script.path, error = %e, "preload script failed");
                    self.report(port, &script.path, &e);
                    report.failed.push((script.path.clone(), e));
                }
            }
        }

        report
    }

    fn run(&self, port: &Arc<GuestPort>, script: &ScriptSource) -> Result<()> {
        if script.source_text.is_some() || script.source_binary.is_some() {
            if let Some(load_error) = &script.load_error {
                debug!(script = %script.path, %load_error, "running script despite provider error");
            }
        }
        let module = Module::new(&self.engine, script.bytes()?).map_err(|e| Error::Compile(format!("{:#}", e)))?;

        // Each imported module name once, in a stable order.
        let wanted: BTreeSet<String> = module.imports().map(|i| i.module().to_string()).collect();
        let mut linker: Linker<ScriptCtx> = Linker::new(&self.engine);
        for name in &wanted {
            self.modules.require(name)?.install(&mut linker)?;
        }

        let mut store = Store::new(
            &self.engine,
            ScriptCtx {
                port: Arc::clone(port),
                path: script.path.clone(),
                platform: self.config.platform.clone(),
                is_main_frame: self.config.is_main_frame,
            },
        );
        if let Some(fuel) = self.config.fuel {
            store.set_fuel(fuel).map_err(|e| Error::Link(format!("{:#}", e)))?;
        }

        let instance = linker.instantiate(&mut store, &module).map_err(|e| match e.downcast_ref::<Trap>() {
            Some(_) => execution_error(&e),
            None => Error::Link(format!("{:#}", e)),
        })?;
        let main = instance
            .get_typed_func::<(), ()>(&mut store, "main")
            .map_err(|_| Error::MissingEntryPoint)?;

        debug!(script = %script.path, imports = ?wanted, "running preload script");
        main.call(&mut store, ()).map_err(|e| execution_error(&e))
    }

    fn report(&self, port: &GuestPort, path: &str, error: &Error) {
        let value = error.to_error_value().with_origin(Origin::Guest);
        if let Err(e) = port.send(&self.config.error_channel, vec![Value::from(path), Value::Error(value)]) {
            error!(script = path, error = %e, "could not report preload failure");
        }
    }
}

fn execution_error(e: &wasmtime::Error) -> Error {
    match e.downcast_ref::<Trap>() {
        Some(Trap::OutOfFuel) => Error::ScriptExecution("script ran out of fuel".to_string()),
        _ => Error::ScriptExecution(format!("{:#}", e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_bytes() {
        assert_eq!(ScriptSource::text("a.wat", "(module)").bytes().unwrap(), b"(module)");
        assert_eq!(ScriptSource::binary("a.wasm", vec![0, 97]).bytes().unwrap(), &[0u8, 97]);

        match ScriptSource::unavailable("b.wat", "permission denied").bytes() {
            Err(Error::SourceUnavailable(msg)) => assert_eq!(msg, "permission denied"),
            other => panic!("expected SourceUnavailable, got {:?}", other),
        }
    }

    #[test]
    fn test_fuel_toggles_engine_metering() {
        assert!(ScriptLoader::new(LoaderConfig::default()).is_ok());
        assert!(ScriptLoader::new(LoaderConfig::default().with_fuel(Some(1_000))).is_ok());
    }
}
