// ABOUTME: Command-line interface: clap definitions and the dispatch for each subcommand.
// ABOUTME: `serve` runs the daemon in-process; every other command (except `models`) talks to it over IPC.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::io::AsyncReadExt;
use tracing::info;

use crate::config::Config;
use crate::error::SessionError;
use crate::ipc::client::unexpected;
use crate::ipc::{DaemonClient, DaemonServer, Reply, Request};
use crate::session::{SessionRegistry, SessionStatus};
use crate::supervisor::CommandLauncher;

/// Exit code when no daemon answers on the socket.
pub const EXIT_UNREACHABLE: u8 = 8;

/// llamasup - keep local llama.cpp models warm and query them from the shell
#[derive(Parser, Debug)]
#[command(name = "llamasup")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Config file (default: $LLAMASUP_CONFIG or ~/.llamasup/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Daemon socket (overrides the config file)
    #[arg(long, global = true)]
    pub socket: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the session daemon in the foreground
    Serve,

    /// Start a session for a model
    Start {
        #[arg(long, short)]
        model: String,
    },

    /// Send a query and print the response
    Query {
        #[arg(long, short)]
        model: String,

        /// Query text; read from stdin when omitted
        #[arg(long, short)]
        text: Option<String>,

        /// Print the assigned query id to stderr
        #[arg(long)]
        show_id: bool,
    },

    /// Stop a model's session
    Stop {
        #[arg(long, short)]
        model: String,
    },

    /// List running sessions
    List {
        /// Include terminated and starting sessions with their state
        #[arg(long)]
        all: bool,
    },

    /// Show a session's state
    Status {
        #[arg(long, short)]
        model: String,
    },

    /// Cancel a query that has not been sent to the model yet
    Cancel {
        #[arg(long, short)]
        model: String,

        #[arg(long)]
        query_id: u64,
    },

    /// List configured models
    Models,
}

/// Run one CLI invocation to completion.
pub async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let config = Config::load(cli.config.as_deref())?;
    let socket = cli.socket.clone().unwrap_or_else(|| config.socket_path());

    match cli.command {
        Commands::Serve => serve(config, &socket).await,
        Commands::Models => {
            let catalog = config.catalog()?;
            for name in catalog.names() {
                println!("{name}");
            }
            Ok(ExitCode::SUCCESS)
        }
        command => {
            let mut client = match DaemonClient::connect(&socket).await {
                Ok(client) => client,
                Err(e) => {
                    eprintln!(
                        "llamasup: cannot reach daemon at {} ({e}); run `llamasup serve`",
                        socket.display()
                    );
                    return Ok(ExitCode::from(EXIT_UNREACHABLE));
                }
            };
            Ok(match execute(&mut client, command).await {
                Ok(code) => code,
                Err(e) => fail(&e),
            })
        }
    }
}

async fn serve(config: Config, socket: &Path) -> anyhow::Result<ExitCode> {
    let registry = SessionRegistry::new(config, Arc::new(CommandLauncher))
        .context("building model catalog")?;
    info!(models = ?registry.catalog().names(), "catalog loaded");
    let server = DaemonServer::new(Arc::new(registry), socket);
    let listener = server.bind().await?;
    server.run(listener, shutdown_signal()).await;
    Ok(ExitCode::SUCCESS)
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

async fn execute(client: &mut DaemonClient, command: Commands) -> crate::error::Result<ExitCode> {
    match command {
        Commands::Start { model } => match client.call(&Request::Start { model }).await? {
            Reply::Started { model, session_id } => {
                info!(model = %model, session_id = %session_id, "session started");
                Ok(ExitCode::SUCCESS)
            }
            other => Err(into_error(other)),
        },
        Commands::Query {
            model,
            text,
            show_id,
        } => {
            let text = match text {
                Some(text) => text,
                None => read_stdin().await?,
            };
            let response = client
                .query(&model, &text, |query_id| {
                    if show_id {
                        eprintln!("query_id={query_id}");
                    }
                })
                .await?;
            println!("{}", response.text);
            if response.truncated {
                eprintln!("llamasup: response truncated; the process for '{model}' ended");
                return Ok(ExitCode::from(
                    SessionError::ProcessTerminated(model).exit_code(),
                ));
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Stop { model } => match client.call(&Request::Stop { model }).await? {
            Reply::Stopped { .. } => Ok(ExitCode::SUCCESS),
            other => Err(into_error(other)),
        },
        Commands::List { all } => match client.call(&Request::List { all }).await? {
            Reply::Sessions { names } => {
                for name in names {
                    println!("{name}");
                }
                Ok(ExitCode::SUCCESS)
            }
            Reply::SessionStates { sessions } => {
                for entry in sessions {
                    println!("{}\t{}", entry.name, entry.state);
                }
                Ok(ExitCode::SUCCESS)
            }
            other => Err(into_error(other)),
        },
        Commands::Status { model } => {
            let request = Request::Status {
                model: model.clone(),
            };
            match client.call(&request).await? {
                Reply::Status {
                    status: Some(status),
                } => {
                    print!("{}", format_status(&status));
                    Ok(ExitCode::SUCCESS)
                }
                Reply::Status { status: None } => {
                    println!("{model}: no session");
                    Ok(ExitCode::SUCCESS)
                }
                other => Err(into_error(other)),
            }
        }
        Commands::Cancel { model, query_id } => {
            match client.call(&Request::Cancel { model, query_id }).await? {
                Reply::Cancelled {
                    cancelled: true, ..
                } => Ok(ExitCode::SUCCESS),
                Reply::Cancelled { query_id, .. } => {
                    eprintln!("llamasup: query {query_id} is not queued (already sent or unknown)");
                    Ok(ExitCode::from(1))
                }
                other => Err(into_error(other)),
            }
        }
        // `run` handles both locally and never opens a connection for them.
        Commands::Serve | Commands::Models => unreachable!("local command sent to the daemon"),
    }
}

async fn read_stdin() -> crate::error::Result<String> {
    let mut text = String::new();
    tokio::io::stdin().read_to_string(&mut text).await?;
    Ok(text.trim_end_matches(['\r', '\n']).to_string())
}

fn into_error(reply: Reply) -> SessionError {
    match reply {
        Reply::Error { error } => error,
        other => unexpected(&other),
    }
}

fn fail(err: &SessionError) -> ExitCode {
    eprintln!("llamasup: {err}");
    ExitCode::from(err.exit_code())
}

/// Human-readable `status` output, one `key: value` per line.
pub fn format_status(status: &SessionStatus) -> String {
    let mut out = format!("model: {}\nstate: {}\n", status.name, status.state);
    if let Some(id) = &status.session_id {
        out.push_str(&format!("session: {id}\n"));
    }
    if let Some(pid) = status.pid {
        out.push_str(&format!("pid: {pid}\n"));
    }
    out.push_str(&format!("process: {:?}\n", status.process));
    if let Some(started) = status.started_at {
        out.push_str(&format!("started: {}\n", started.to_rfc3339()));
    }
    out.push_str(&format!("queued: {}\n", status.queued));
    if let Some(id) = status.in_flight {
        out.push_str(&format!("in flight: {id}\n"));
    }
    out.push_str(&format!("served: {}\n", status.served));
    if let Some(exit) = status.exit {
        out.push_str(&format!("exit: {exit}\n"));
    }
    out
}
