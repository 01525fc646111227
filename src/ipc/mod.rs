// ABOUTME: Local IPC between the CLI and the daemon over a Unix domain socket.
// ABOUTME: Newline-delimited JSON requests and replies; see protocol.rs for the message types.

pub mod client;
pub mod protocol;
pub mod server;

pub use client::DaemonClient;
pub use protocol::{Reply, Request, SessionEntry};
pub use server::DaemonServer;
