//! Multi-client chat server over a Unix-domain stream socket.
//!
//! A single acceptor thread multiplexes every client connection, parses
//! framed, typed messages and feeds a shared work queue drained by a pool
//! of worker threads. Workers run each operation against a SQLite-backed
//! state repository (users, chats, group memberships, messages, counters)
//! behind a readers/writer gate, and reply through a per-descriptor write
//! serializer so frames never interleave on a stream.
//!
//! ```no_run
//! use chatd::{Config, Server};
//!
//! let server = Server::new(Config::new().workers(4))?;
//! let shutdown = server.shutdown_handle();
//! // hand `shutdown` to a signal handler, then:
//! server.run()?;
//! # Ok::<(), std::io::Error>(())
//! ```

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub use crate::server::BackgroundServer;
pub use crate::server::Config;
pub use crate::server::MAX_WORKERS;
pub use crate::server::Server;
pub use crate::server::Shutdown;
pub use crate::server::StatsReporter;
pub use crate::stats::Stats;

pub mod ll;

mod conn;
mod dispatcher;
mod queue;
mod server;
mod slots;
mod stats;
mod store;
mod worker;
