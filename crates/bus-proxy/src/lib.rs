//! Filtering message-bus proxy.
//!
//! Sits between a sandboxed client and a real message bus, enforcing a
//! name-oriented access policy (spec §3, §4.2) on every frame that
//! crosses it. Nothing here is shared across connections: each accepted
//! client gets its own [`Session`](session::Session) and its own task.

pub use self::error::{CliError, ProxyError, Result};
mod error;

pub use self::policy::{Filter, FilterType, PolicyLevel, PolicyStore, BUS_NAME};
mod policy;

mod name_tracker;
mod reply_tracker;
mod frame;
mod builder;
mod body;
mod creds;
mod fds;
mod session;
mod router;

pub use self::cli::{Cli, ProxySpec};
pub mod cli;

pub mod connection;
