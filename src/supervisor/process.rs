// ABOUTME: ProcessSupervisor: owns one model subprocess from spawn to exit.
// ABOUTME: Exposes byte-level input/output and a bounded, idempotent stop.

use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{Mutex as TokioMutex, mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use crate::catalog::ModelDescriptor;
use crate::config::SessionSettings;
use crate::error::{Result, SessionError};
use crate::supervisor::launcher::{
    ExitInfo, Launcher, ProcessControl, ProcessInput, ProcessOutput,
};

/// Lifecycle of a supervised process. `Exited` and `Killed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    NotStarted,
    Starting,
    Running,
    /// The process ended on its own.
    Exited,
    /// The process ended because a stop was requested.
    Killed,
}

impl ProcessState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Exited | Self::Killed)
    }
}

/// Byte chunks read from the process stdout.
pub type OutputStream = ReceiverStream<Vec<u8>>;

const READ_CHUNK: usize = 4096;
const OUTPUT_CHANNEL_DEPTH: usize = 64;

/// Owns exactly one subprocess and its pipes.
pub struct ProcessSupervisor {
    model: String,
    pid: Option<u32>,
    state_tx: Arc<watch::Sender<ProcessState>>,
    exit: Arc<OnceLock<ExitInfo>>,
    stdin: TokioMutex<Option<ProcessInput>>,
    output: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
    stop_tx: mpsc::UnboundedSender<Duration>,
}

impl ProcessSupervisor {
    /// Spawn the model process and wait out the startup check window.
    ///
    /// Fails with `SpawnError` if the launcher refuses, or if the process exits
    /// before the window closes.
    pub async fn start(
        launcher: &dyn Launcher,
        model: &ModelDescriptor,
        settings: &SessionSettings,
    ) -> Result<Self> {
        let args = model.build_args(settings.threads);
        info!(
            model = %model.name,
            executable = %model.executable.display(),
            ?args,
            "spawning model process"
        );

        let launched = launcher
            .launch(model, &args)
            .await
            .map_err(|e| SessionError::spawn(&model.name, e.to_string()))?;

        let pid = launched.control.pid();
        let state_tx = Arc::new(watch::Sender::new(ProcessState::Starting));
        let exit = Arc::new(OnceLock::new());

        let (out_tx, out_rx) = mpsc::channel(OUTPUT_CHANNEL_DEPTH);
        tokio::spawn(pump_stdout(launched.stdout, out_tx, model.name.clone()));
        if let Some(stderr) = launched.stderr {
            tokio::spawn(forward_stderr(stderr, model.name.clone()));
        }

        let (stop_tx, stop_rx) = mpsc::unbounded_channel();
        tokio::spawn(monitor(
            launched.control,
            state_tx.clone(),
            stop_rx,
            exit.clone(),
            model.name.clone(),
        ));

        let supervisor = Self {
            model: model.name.clone(),
            pid,
            state_tx,
            exit,
            stdin: TokioMutex::new(Some(launched.stdin)),
            output: Mutex::new(Some(out_rx)),
            stop_tx,
        };
        supervisor.await_startup(settings.startup_check).await?;
        info!(model = %supervisor.model, pid = ?supervisor.pid, "model process running");
        Ok(supervisor)
    }

    async fn await_startup(&self, window: Duration) -> Result<()> {
        let mut rx = self.state_tx.subscribe();
        let exited_early = tokio::time::timeout(window, rx.wait_for(|s| s.is_terminal()))
            .await
            .is_ok();

        let promoted = self.state_tx.send_if_modified(|state| {
            if *state == ProcessState::Starting {
                *state = ProcessState::Running;
                true
            } else {
                false
            }
        });

        if exited_early || !promoted {
            let how = self
                .exit_info()
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown status".to_string());
            return Err(SessionError::spawn(
                &self.model,
                format!("process exited during startup ({how})"),
            ));
        }
        Ok(())
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn state(&self) -> ProcessState {
        *self.state_tx.borrow()
    }

    pub fn exit_info(&self) -> Option<ExitInfo> {
        self.exit.get().copied()
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<ProcessState> {
        self.state_tx.subscribe()
    }

    /// Write bytes to the process stdin and flush.
    pub async fn write_input(&self, bytes: &[u8]) -> Result<()> {
        if self.state().is_terminal() {
            return Err(SessionError::closed(format!(
                "process for '{}' has ended",
                self.model
            )));
        }
        let mut guard = self.stdin.lock().await;
        let Some(stdin) = guard.as_mut() else {
            return Err(SessionError::closed(format!(
                "input for '{}' is closed",
                self.model
            )));
        };
        let written: std::io::Result<()> = async {
            stdin.write_all(bytes).await?;
            stdin.flush().await
        }
        .await;
        if let Err(e) = written {
            *guard = None;
            return Err(SessionError::closed(format!(
                "write to '{}' failed: {e}",
                self.model
            )));
        }
        Ok(())
    }

    /// Take the output stream. Only one reader may ever hold it.
    pub fn read_output(&self) -> Result<OutputStream> {
        self.output
            .lock()
            .expect("output lock poisoned")
            .take()
            .map(ReceiverStream::new)
            .ok_or_else(|| {
                SessionError::closed(format!("output of '{}' already taken", self.model))
            })
    }

    /// Terminate the process: SIGTERM, then kill after `grace`, then close stdin.
    ///
    /// Safe to call repeatedly and after the process has already exited.
    pub async fn stop(&self, grace: Duration) -> ProcessState {
        if !self.state().is_terminal() {
            // The monitor drops its receiver once it finishes; a failed send
            // means the process is already down.
            let _ = self.stop_tx.send(grace);
        }
        let state = self.wait_terminal().await;
        self.stdin.lock().await.take();
        state
    }

    /// Wait until the process reaches a terminal state.
    pub async fn wait_terminal(&self) -> ProcessState {
        let mut rx = self.state_tx.subscribe();
        match rx.wait_for(|s| s.is_terminal()).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        }
    }
}

/// Owns the process control handle; waits for exit or a stop request.
async fn monitor(
    mut control: Box<dyn ProcessControl>,
    state_tx: Arc<watch::Sender<ProcessState>>,
    mut stop_rx: mpsc::UnboundedReceiver<Duration>,
    exit: Arc<OnceLock<ExitInfo>>,
    model: String,
) {
    let grace = tokio::select! {
        status = control.wait() => {
            match status {
                Ok(info) => {
                    info!(model = %model, status = %info, "model process exited");
                    let _ = exit.set(info);
                }
                Err(e) => warn!(model = %model, error = %e, "failed to wait for model process"),
            }
            state_tx.send_replace(ProcessState::Exited);
            return;
        }
        // A closed channel means the supervisor was dropped: stop without grace.
        request = stop_rx.recv() => request.unwrap_or(Duration::ZERO),
    };

    info!(model = %model, grace_ms = grace.as_millis() as u64, "stopping model process");
    if let Err(e) = control.terminate() {
        debug!(model = %model, error = %e, "terminate signal failed");
    }

    let status = match tokio::time::timeout(grace, control.wait()).await {
        Ok(status) => status,
        Err(_) => {
            warn!(model = %model, "model process ignored termination; killing");
            if let Err(e) = control.kill().await {
                warn!(model = %model, error = %e, "kill failed");
            }
            control.wait().await
        }
    };
    match status {
        Ok(info) => {
            let _ = exit.set(info);
        }
        Err(e) => warn!(model = %model, error = %e, "failed to reap model process"),
    }
    state_tx.send_replace(ProcessState::Killed);
}

/// Copy stdout into the output channel until EOF.
async fn pump_stdout(mut stdout: ProcessOutput, tx: mpsc::Sender<Vec<u8>>, model: String) {
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match stdout.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(buf[..n].to_vec()).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!(model = %model, error = %e, "stdout read failed");
                break;
            }
        }
    }
    debug!(model = %model, "stdout closed");
}

/// Relay the model's stderr (load logs, warnings) into our log.
async fn forward_stderr(stderr: ProcessOutput, model: String) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(model = %model, "{line}");
    }
}
