//! # duorun
//!
//! The host runtime on top of `duorpc`: handle registries for host objects and
//! guest callbacks, the remote object server, and the sandboxed loader that
//! runs preload scripts in a fresh guest context.
//!
//! ## Philosophy
//!
//! - **Handles, Not References**: a guest only ever holds integers. What they
//!   point to lives in a registry the host owns, and goes away with the last
//!   connection holding it.
//! - **Injected, Not Global**: registries are built by [`Host`] and passed to
//!   whatever needs them.
//! - **Closed World Scripts**: preload code can only import the modules the
//!   loader was given.

pub mod callbacks;
pub mod config;
pub mod error;
pub mod host;
pub mod loader;
pub mod logging;
pub mod objects;
pub mod remote;

pub use callbacks::CallbackEntry;
pub use callbacks::CallbackRegistry;
pub use callbacks::GuestFunction;
pub use callbacks::GuestFunctionRef;
pub use config::HostConfig;
pub use config::LoaderConfig;
pub use config::PRELOAD_ERROR;
pub use error::Error;
pub use error::Result;
pub use host::Host;
pub use host::PreloadError;
pub use loader::HostModule;
pub use loader::LoadReport;
pub use loader::ModuleMap;
pub use loader::ScriptCtx;
pub use loader::ScriptLoader;
pub use loader::ScriptSource;
pub use objects::HostObject;
pub use objects::ObjectRegistry;
pub use objects::PlainObject;
pub use objects::RemoteObject;
pub use remote::RemoteCallback;
pub use remote::RemoteServer;
