// ABOUTME: Library root for llamasup: re-exports all modules for integration testing.
// ABOUTME: The binary entry point is in main.rs, which uses this crate as a library.

pub mod catalog;
pub mod cli;
pub mod config;
pub mod error;
pub mod ipc;
pub mod session;
pub mod supervisor;

pub use error::{Result, SessionError};
