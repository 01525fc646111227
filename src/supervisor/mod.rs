// ABOUTME: Supervisor module: spawning, monitoring, and stopping model subprocesses.
// ABOUTME: Process creation sits behind the Launcher trait so tests can use a fake process.

#[cfg(any(test, feature = "test-util"))]
pub mod fake;
pub mod launcher;
pub mod process;

pub use launcher::{CommandLauncher, ExitInfo, LaunchedProcess, Launcher, ProcessControl};
pub use process::{OutputStream, ProcessState, ProcessSupervisor};
