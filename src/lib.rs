//! Reactor-driven client handle for a message broker.
//!
//! A [`Handle`] multiplexes requests, responses, events and service traffic
//! over one connection, driven by a single-threaded event loop that also
//! watches timers, signals and file descriptors.
//!
//! # Architecture
//!
//! - **Handle**: façade owning the connection, reactor, watchers and futures
//! - **Connection**: framed stream socket to the broker with a pluggable [`Codec`]
//! - **Reactor**: `poll(2)` loop with reference counting, nesting and interruption
//! - **Watcher**: message, timer, signal and fd event sources with callbacks
//! - **Future**: match-tag correlated responses, waited on or continued
//! - **HandleBuilder**: fluent builder for handle configuration
//!
//! # Example
//! ```no_run
//! use broker_handle::{Handle, RunFlags};
//!
//! let handle = Handle::open("local:///run/broker/local")?;
//! handle.event_subscribe("job.*", |handle, _watcher, event| {
//!     println!("{event:?}");
//!     handle.reactor_stop();
//!     Ok(())
//! })?;
//! handle.run_reactor(RunFlags::NONE)?;
//! # Ok::<(), broker_handle::Error>(())
//! ```

mod builder;
pub mod codec;
pub mod connection;
pub mod error;
mod future;
mod handle;
mod reactor;
mod service;
mod timer;
mod utils;
mod watcher;

pub use builder::{DEFAULT_MAX_REACTOR_DEPTH, HandleBuilder};
pub use codec::{BinaryCodec, Codec, Message, MessageType, TypeMask};
pub use connection::{Connection, ConnectionState};
pub use error::{
    ConnectError, Error, FutureError, ReactorError, Result, SendError, WatcherError,
};
pub use future::{Future, FutureState, RpcFlags, Timeout};
pub use handle::Handle;
pub use reactor::event::Interest;
pub use reactor::{RunFlags, RunOutcome};
pub use service::ServiceState;
pub use watcher::{
    Callback, MessageFilter, TopicGlob, Watcher, WatcherEvent, WatcherGuard, WatcherId,
    WatcherKind, WatcherState,
};
