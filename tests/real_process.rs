// ABOUTME: Integration tests that drive real child processes through the CommandLauncher.
// ABOUTME: A small shell script stands in for llama.cpp's interactive mode.
#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use llamasup::catalog::ModelDescriptor;
use llamasup::config::Config;
use llamasup::session::SessionRegistry;
use llamasup::supervisor::{CommandLauncher, ProcessState};
use llamasup::SessionError;

/// Prints a banner and prompt, then answers each `text/` line with `got:text`.
const FAKE_LLAMA: &str = r#"#!/bin/sh
echo "loading model $4 with $2 threads" >&2
printf '== Running in interactive mode ==\n> '
while IFS= read -r line; do
  printf 'got:%s\n> ' "${line%/}"
done
"#;

fn write_script(dir: &Path, name: &str, body: &str, mode: u32) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode)).unwrap();
    path
}

fn registry_for(models: Vec<ModelDescriptor>) -> SessionRegistry {
    let config = Config {
        idle_timeout_ms: 500,
        first_output_timeout_ms: 5_000,
        stop_grace_ms: 500,
        startup_check_ms: 300,
        threads: Some(1),
        models,
        ..Config::default()
    };
    SessionRegistry::new(config, Arc::new(CommandLauncher)).unwrap()
}

#[tokio::test]
async fn shell_model_answers_and_stops() {
    let dir = tempfile::tempdir().unwrap();
    let exe = write_script(dir.path(), "fake-llama", FAKE_LLAMA, 0o755);
    let registry = registry_for(vec![ModelDescriptor::new("sh", &exe, "/dev/null")]);

    let session = registry.start("sh").await.unwrap();
    assert!(session.supervisor().pid().is_some());

    let first = session.query("hello").await.unwrap();
    assert_eq!(first.text, "got:hello");
    let second = session.query("second line").await.unwrap();
    assert_eq!(second.text, "got:second line");

    registry.terminate("sh").await.unwrap();
    assert_eq!(session.supervisor().state(), ProcessState::Killed);
    assert!(matches!(
        registry.get_or_create("sh").await,
        Err(SessionError::ClosedChannel(_))
    ));
}

#[tokio::test]
async fn missing_executable_is_spawn_error() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry_for(vec![ModelDescriptor::new(
        "ghost",
        dir.path().join("does-not-exist"),
        "/dev/null",
    )]);

    match registry.start("ghost").await {
        Err(SessionError::SpawnError { model, message }) => {
            assert_eq!(model, "ghost");
            assert!(message.contains("not accessible"), "{message}");
        }
        Err(other) => panic!("expected SpawnError, got {other:?}"),
        Ok(_) => panic!("expected SpawnError, got a session"),
    }
    assert!(registry.list_all().is_empty());
}

#[tokio::test]
async fn non_executable_file_is_spawn_error() {
    let dir = tempfile::tempdir().unwrap();
    let exe = write_script(dir.path(), "plain", FAKE_LLAMA, 0o644);
    let registry = registry_for(vec![ModelDescriptor::new("plain", &exe, "/dev/null")]);

    let err = registry.start("plain").await.err().unwrap();
    assert!(matches!(err, SessionError::SpawnError { .. }));
    assert_eq!(err.exit_code(), 3);
}

#[tokio::test]
async fn directory_is_spawn_error() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry_for(vec![ModelDescriptor::new("dir", dir.path(), "/dev/null")]);
    assert!(matches!(
        registry.start("dir").await,
        Err(SessionError::SpawnError { .. })
    ));
}

#[tokio::test]
async fn immediate_failure_is_spawn_error() {
    let dir = tempfile::tempdir().unwrap();
    let exe = write_script(
        dir.path(),
        "broken",
        "#!/bin/sh\necho 'error: failed to load model' >&2\nexit 1\n",
        0o755,
    );
    let registry = registry_for(vec![ModelDescriptor::new("broken", &exe, "/dev/null")]);

    let started = std::time::Instant::now();
    match registry.start("broken").await {
        Err(SessionError::SpawnError { message, .. }) => {
            assert!(message.contains("exit code 1"), "{message}");
        }
        Err(other) => panic!("expected SpawnError, got {other:?}"),
        Ok(_) => panic!("expected SpawnError, got a session"),
    }
    assert!(started.elapsed() < Duration::from_secs(5));
}
