// ABOUTME: Launcher capability: how a model subprocess is created and controlled.
// ABOUTME: CommandLauncher spawns real executables via tokio::process; tests swap in a fake.

use std::io;
use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};

use crate::catalog::ModelDescriptor;

pub type ProcessInput = Box<dyn AsyncWrite + Send + Unpin>;
pub type ProcessOutput = Box<dyn AsyncRead + Send + Unpin>;

/// How a process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitInfo {
    /// `None` when the process was ended by a signal.
    pub code: Option<i32>,
    pub success: bool,
}

impl std::fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.code {
            Some(code) => write!(f, "exit code {code}"),
            None => write!(f, "terminated by signal"),
        }
    }
}

/// Control over a running process: signal it, kill it, wait for it.
#[async_trait]
pub trait ProcessControl: Send {
    fn pid(&self) -> Option<u32>;

    /// Politely ask the process to exit (SIGTERM for real processes).
    fn terminate(&mut self) -> io::Result<()>;

    /// Force the process down.
    async fn kill(&mut self) -> io::Result<()>;

    /// Wait for the process to exit.
    async fn wait(&mut self) -> io::Result<ExitInfo>;
}

/// A freshly spawned process with its pipes split out.
pub struct LaunchedProcess {
    pub stdin: ProcessInput,
    pub stdout: ProcessOutput,
    pub stderr: Option<ProcessOutput>,
    pub control: Box<dyn ProcessControl>,
}

/// Capability to create model processes.
#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(&self, model: &ModelDescriptor, args: &[String]) -> io::Result<LaunchedProcess>;
}

/// Spawns the configured executable as a real child process.
#[derive(Debug, Default, Clone, Copy)]
pub struct CommandLauncher;

#[async_trait]
impl Launcher for CommandLauncher {
    async fn launch(
        &self,
        model: &ModelDescriptor,
        args: &[String],
    ) -> io::Result<LaunchedProcess> {
        check_executable(&model.executable)?;

        let mut child = Command::new(&model.executable)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::other("child stdin was not captured"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("child stdout was not captured"))?;
        let stderr = child.stderr.take();

        Ok(LaunchedProcess {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: stderr.map(|s| Box::new(s) as ProcessOutput),
            control: Box::new(ChildControl { child }),
        })
    }
}

/// Fail early with a readable error when the executable is missing or not runnable.
pub fn check_executable(path: &Path) -> io::Result<()> {
    let metadata = std::fs::metadata(path).map_err(|e| {
        io::Error::new(
            e.kind(),
            format!("executable {} not accessible: {e}", path.display()),
        )
    })?;
    if !metadata.is_file() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("executable {} is not a regular file", path.display()),
        ));
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if metadata.permissions().mode() & 0o111 == 0 {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("executable {} is not executable", path.display()),
            ));
        }
    }
    Ok(())
}

struct ChildControl {
    child: Child,
}

#[async_trait]
impl ProcessControl for ChildControl {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    #[cfg(unix)]
    fn terminate(&mut self) -> io::Result<()> {
        let Some(pid) = self.child.id() else {
            return Ok(());
        };
        // SAFETY: kill(2) has no memory-safety preconditions; pid came from our own child.
        let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) -> io::Result<()> {
        self.child.start_kill()
    }

    async fn kill(&mut self) -> io::Result<()> {
        self.child.kill().await
    }

    async fn wait(&mut self) -> io::Result<ExitInfo> {
        let status = self.child.wait().await?;
        Ok(ExitInfo {
            code: status.code(),
            success: status.success(),
        })
    }
}
