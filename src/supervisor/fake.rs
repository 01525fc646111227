// ABOUTME: In-memory fake model process for tests: no executable involved.
// ABOUTME: Speaks the same sentinel/prompt-marker convention as an interactive llama.cpp session.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::watch;

use crate::catalog::ModelDescriptor;
use crate::supervisor::launcher::{ExitInfo, LaunchedProcess, Launcher, ProcessControl};

/// How a fake model responds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeBehavior {
    /// Reply `echo: <text>` followed by the prompt marker.
    Echo,
    /// Reply `echo: <text>` with no marker, so framing falls back to idle timeout.
    EchoNoMarker,
    /// Read input but never write anything.
    Silent,
    /// Write `partial: <text>` and then die with exit code 139.
    CrashMidResponse,
    /// Refuse to launch at all.
    FailSpawn,
    /// Launch, then exit straight away with the given code.
    ExitImmediately(i32),
}

const PIPE_CAPACITY: usize = 64 * 1024;

/// Exit codes the fake reports, mirroring 128 + signal number.
const SIGTERM_EXIT: i32 = 143;
const SIGKILL_EXIT: i32 = 137;
const CRASH_EXIT: i32 = 139;

/// Launcher double that counts spawns and lets tests crash processes externally.
pub struct FakeLauncher {
    default_behavior: FakeBehavior,
    behaviors: HashMap<String, FakeBehavior>,
    reply_delay: Duration,
    spawn_delay: Duration,
    ignore_sigterm: bool,
    spawns: AtomicUsize,
    next_pid: AtomicU32,
    live: Mutex<Vec<(String, Arc<watch::Sender<Option<i32>>>)>>,
}

impl Default for FakeLauncher {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeLauncher {
    pub fn new() -> Self {
        Self {
            default_behavior: FakeBehavior::Echo,
            behaviors: HashMap::new(),
            reply_delay: Duration::ZERO,
            spawn_delay: Duration::ZERO,
            ignore_sigterm: false,
            spawns: AtomicUsize::new(0),
            next_pid: AtomicU32::new(40_000),
            live: Mutex::new(Vec::new()),
        }
    }

    /// Use `behavior` for the model called `name`.
    pub fn with_behavior(mut self, name: &str, behavior: FakeBehavior) -> Self {
        self.behaviors.insert(name.to_string(), behavior);
        self
    }

    /// Use `behavior` for every model without an explicit entry.
    pub fn with_default_behavior(mut self, behavior: FakeBehavior) -> Self {
        self.default_behavior = behavior;
        self
    }

    /// Delay before each reply is written.
    pub fn with_reply_delay(mut self, delay: Duration) -> Self {
        self.reply_delay = delay;
        self
    }

    /// Delay inside `launch`, widening the window for concurrent creation races.
    pub fn with_spawn_delay(mut self, delay: Duration) -> Self {
        self.spawn_delay = delay;
        self
    }

    /// Processes ignore SIGTERM and only die on kill.
    pub fn ignoring_sigterm(mut self) -> Self {
        self.ignore_sigterm = true;
        self
    }

    /// Number of launch attempts that produced a process.
    pub fn spawn_count(&self) -> usize {
        self.spawns.load(Ordering::SeqCst)
    }

    /// Kill every live process for `name` from the outside, as `kill -9` would.
    pub fn crash(&self, name: &str) {
        let live = self.live.lock().expect("live lock poisoned");
        for (model, kill_tx) in live.iter().filter(|(model, _)| model == name) {
            tracing::debug!(model = %model, "fake process crashed externally");
            kill_tx.send_replace(Some(SIGKILL_EXIT));
        }
    }

    fn behavior_for(&self, name: &str) -> FakeBehavior {
        self.behaviors
            .get(name)
            .copied()
            .unwrap_or(self.default_behavior)
    }
}

#[async_trait]
impl Launcher for FakeLauncher {
    async fn launch(
        &self,
        model: &ModelDescriptor,
        _args: &[String],
    ) -> io::Result<LaunchedProcess> {
        if !self.spawn_delay.is_zero() {
            tokio::time::sleep(self.spawn_delay).await;
        }
        let behavior = self.behavior_for(&model.name);
        if behavior == FakeBehavior::FailSpawn {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("executable {} not accessible", model.executable.display()),
            ));
        }
        self.spawns.fetch_add(1, Ordering::SeqCst);

        let (stdin_ours, stdin_theirs) = tokio::io::duplex(PIPE_CAPACITY);
        let (stdout_theirs, stdout_ours) = tokio::io::duplex(PIPE_CAPACITY);
        let kill_tx = Arc::new(watch::Sender::new(None));
        let (exit_tx, exit_rx) = watch::channel(None);

        self.live
            .lock()
            .expect("live lock poisoned")
            .push((model.name.clone(), kill_tx.clone()));

        tokio::spawn(run_fake_model(
            FakeScript {
                behavior,
                reply_delay: self.reply_delay,
                sentinel: model.submit_sentinel.clone().into_bytes(),
                marker: model.prompt_marker.clone(),
            },
            stdin_theirs,
            stdout_theirs,
            kill_tx.subscribe(),
            exit_tx,
        ));

        Ok(LaunchedProcess {
            stdin: Box::new(stdin_ours),
            stdout: Box::new(stdout_ours),
            stderr: None,
            control: Box::new(FakeControl {
                pid: self.next_pid.fetch_add(1, Ordering::SeqCst),
                kill_tx,
                exit_rx,
                ignore_sigterm: self.ignore_sigterm,
            }),
        })
    }
}

struct FakeScript {
    behavior: FakeBehavior,
    reply_delay: Duration,
    sentinel: Vec<u8>,
    marker: String,
}

async fn run_fake_model(
    script: FakeScript,
    mut input: DuplexStream,
    mut output: DuplexStream,
    mut kill_rx: watch::Receiver<Option<i32>>,
    exit_tx: watch::Sender<Option<ExitInfo>>,
) {
    let code = async {
        if let FakeBehavior::ExitImmediately(code) = script.behavior {
            return code;
        }
        // Interactive mode prints a banner and a first prompt before any input.
        if script.behavior != FakeBehavior::Silent {
            let _ = output
                .write_all(format!("== Running in interactive mode =={}", script.marker).as_bytes())
                .await;
        }

        let mut pending: Vec<u8> = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            tokio::select! {
                changed = kill_rx.changed() => {
                    if changed.is_err() {
                        return 0;
                    }
                    if let Some(code) = *kill_rx.borrow() {
                        return code;
                    }
                }
                read = input.read(&mut buf) => {
                    match read {
                        Ok(0) | Err(_) => return 0,
                        Ok(n) => pending.extend_from_slice(&buf[..n]),
                    }
                    while let Some(pos) = find(&pending, &script.sentinel) {
                        let text = String::from_utf8_lossy(&pending[..pos]).to_string();
                        pending.drain(..pos + script.sentinel.len());
                        if !script.reply_delay.is_zero() {
                            tokio::time::sleep(script.reply_delay).await;
                        }
                        let reply = match script.behavior {
                            FakeBehavior::Echo => format!("echo: {text}{}", script.marker),
                            FakeBehavior::EchoNoMarker => format!("echo: {text}"),
                            FakeBehavior::CrashMidResponse => format!("partial: {text}"),
                            _ => String::new(),
                        };
                        if !reply.is_empty() {
                            let _ = output.write_all(reply.as_bytes()).await;
                        }
                        if script.behavior == FakeBehavior::CrashMidResponse {
                            return CRASH_EXIT;
                        }
                    }
                }
            }
        }
    }
    .await;

    drop(output);
    exit_tx.send_replace(Some(ExitInfo {
        code: Some(code),
        success: code == 0,
    }));
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

struct FakeControl {
    pid: u32,
    kill_tx: Arc<watch::Sender<Option<i32>>>,
    exit_rx: watch::Receiver<Option<ExitInfo>>,
    ignore_sigterm: bool,
}

#[async_trait]
impl ProcessControl for FakeControl {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn terminate(&mut self) -> io::Result<()> {
        if !self.ignore_sigterm {
            self.kill_tx.send_replace(Some(SIGTERM_EXIT));
        }
        Ok(())
    }

    async fn kill(&mut self) -> io::Result<()> {
        self.kill_tx.send_replace(Some(SIGKILL_EXIT));
        Ok(())
    }

    async fn wait(&mut self) -> io::Result<ExitInfo> {
        let exit = *self
            .exit_rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| io::Error::other("fake process vanished"))?;
        exit.ok_or_else(|| io::Error::other("fake process vanished"))
    }
}
