//! tether: detachable expect-style sessions on a pseudo-terminal.
//!
//! A server owns one child process on a PTY and keeps its output; short
//! lived client commands connect over a Unix socket to send input, wait
//! for patterns, interact, or collect the exit status.

// Error documentation is deferred - the errors are self-explanatory from types
#![allow(clippy::missing_errors_doc)]

pub mod cli;
pub mod client;
pub mod codec;
pub mod daemon;
pub mod escape;
pub mod glob;
pub mod interact;
pub mod protocol;
pub mod pty;
pub mod server;
pub mod testing;
pub mod transport;

pub use cli::{Cli, Command};
pub use client::{Client, ClientError, Completion, default_socket_path};
pub use interact::{InteractConfig, InteractError, run_interact};
pub use protocol::{ErrorCode, Reply, Request};
pub use server::{Server, ServerError, Session};
pub use testing::{Outcome, TestError, TestSession};
