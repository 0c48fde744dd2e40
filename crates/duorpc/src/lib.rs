//! # duorpc
//!
//! Channels, correlated invokes and connection lifecycles for the host/guest
//! boundary.
//!
//! ## Philosophy
//!
//! - **One Frame Type**: everything on the wire is a [`Message`]; replies are
//!   ordinary messages on a derived `<channel>_RESPONSE_<id>` channel.
//! - **Host Is Async, Guest Blocks**: the [`Router`] pumps every connection on
//!   tokio. A [`GuestPort`] is driven by its own thread and only dispatches when
//!   polled.
//! - **Loud Registration**: a second handler on a channel is an error the
//!   caller must see.

pub mod config;
pub mod emitter;
pub mod error;
pub mod guest;
pub mod message;
pub mod pending;
pub mod router;
pub mod transport;

pub use config::RouterConfig;
pub use emitter::Emitter;
pub use emitter::Listener;
pub use emitter::ListenerId;
pub use emitter::MessageChannel;
pub use error::error_value_of;
pub use error::Error;
pub use error::Result;
pub use guest::GuestEvent;
pub use guest::GuestHandler;
pub use guest::GuestPort;
pub use guest::Invocation;
pub use message::reply_channel;
pub use message::ConnectionId;
pub use message::Message;
pub use message::MessageKind;
pub use router::BoxFuture;
pub use router::Handler;
pub use router::InvokeEvent;
pub use router::MessageEvent;
pub use router::Router;
pub use router::ScopedRouter;
pub use transport::BlockingTransport;
pub use transport::ChannelTransport;
pub use transport::GuestEnd;
pub use transport::HostEnd;
pub use transport::LocalTransport;
pub use transport::Transport;
pub use transport::TransportError;
