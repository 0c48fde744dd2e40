//! # Host
//!
//! Owns everything one host process needs: the router, both handle
//! registries and the remote object server. Nothing is global; embedders
//! construct a [`Host`] and hand out clones.

use std::sync::Arc;
use std::sync::Mutex;

use tracing::error;

use duopack::ErrorValue;
use duopack::Value;
use duorpc::ConnectionId;
use duorpc::GuestPort;
use duorpc::LocalTransport;
use duorpc::MessageChannel;
use duorpc::MessageEvent;
use duorpc::Router;

use crate::callbacks::CallbackRegistry;
use crate::config::HostConfig;
use crate::error::Result;
use crate::loader::ScriptLoader;
use crate::objects::HostObject;
use crate::objects::ObjectRegistry;
use crate::remote::RemoteServer;

/// A preload failure reported by a guest.
#[derive(Clone, Debug, PartialEq)]
pub struct PreloadError {
    pub connection: ConnectionId,
    pub script_path: String,
    pub error: ErrorValue,
}

#[derive(Clone)]
pub struct Host {
    config: HostConfig,
    router: Router,
    objects: Arc<ObjectRegistry>,
    callbacks: Arc<CallbackRegistry>,
    remote: RemoteServer,
    preload_errors: Arc<Mutex<Vec<PreloadError>>>,
}

impl Host {
    pub fn new(config: HostConfig) -> Result<Self> {
        let router = Router::new(config.router.clone());
        let objects = Arc::new(ObjectRegistry::new());
        let callbacks = Arc::new(CallbackRegistry::new());
        let remote = RemoteServer::new(router.clone(), Arc::clone(&objects), Arc::clone(&callbacks));
        remote.install()?;

        {
            let objects = Arc::clone(&objects);
            let remote = remote.clone();
            router.on_disconnect(move |connection| {
                objects.clear(connection);
                remote.release_connection(connection);
            });
        }

        let preload_errors = Arc::new(Mutex::new(Vec::new()));
        {
            let sink = Arc::clone(&preload_errors);
            router.on(
                &config.loader.error_channel,
                Arc::new(move |event: &MessageEvent, args: &[Value]| {
                    let report = preload_error(event.connection, args);
                    error!(
                        connection = %report.connection,
                        script = %report.script_path,
                        error = %report.error,
                        "preload script failed in guest"
                    );
                    if let Ok(mut errors) = sink.lock() {
                        errors.push(report);
                    }
                }),
            );
        }

        Ok(Self {
            config,
            router,
            objects,
            callbacks,
            remote,
            preload_errors,
        })
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn objects(&self) -> &Arc<ObjectRegistry> {
        &self.objects
    }

    pub fn callbacks(&self) -> &Arc<CallbackRegistry> {
        &self.callbacks
    }

    pub fn remote(&self) -> &RemoteServer {
        &self.remote
    }

    /// Shorthand for [`RemoteServer::expose`].
    pub fn expose(&self, name: &str, object: HostObject) {
        self.remote.expose(name, object);
    }

    /// Opens an in-process guest connection.
    ///
    /// Must be called from within a tokio runtime.
    pub fn attach(&self) -> (ConnectionId, GuestPort) {
        let (host_end, guest_end) = LocalTransport::pair();
        let connection = self.router.connect(host_end);
        let port = GuestPort::with_config(connection, guest_end, self.config.router.clone());
        (connection, port)
    }

    /// A script loader configured like this host.
    pub fn loader(&self) -> Result<ScriptLoader> {
        ScriptLoader::new(self.config.loader.clone())
    }

    /// Every preload failure reported so far.
    pub fn preload_errors(&self) -> Vec<PreloadError> {
        self.preload_errors
            .lock()
            .map(|errors| errors.clone())
            .unwrap_or_default()
    }
}

fn preload_error(connection: ConnectionId, args: &[Value]) -> PreloadError {
    let script_path = args
        .first()
        .and_then(Value::as_str)
        .unwrap_or("<unknown script>")
        .to_string();
    let error = match args.get(1) {
        Some(Value::Error(e)) => e.clone(),
        Some(other) => ErrorValue::generic(format!("non-error failure report: {}", other.kind_name())),
        None => ErrorValue::generic("failure report without error"),
    };
    PreloadError {
        connection,
        script_path,
        error,
    }
}
