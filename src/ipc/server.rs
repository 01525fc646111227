// ABOUTME: Daemon side of the local IPC: a Unix socket accept loop in front of the session registry.
// ABOUTME: Each connection runs in its own task and reads JSON-line requests until EOF.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};

use crate::error::{Result, SessionError};
use crate::ipc::protocol::{Reply, Request, SessionEntry, decode_line, encode_line};
use crate::session::SessionRegistry;

type RequestLines = Lines<BufReader<OwnedReadHalf>>;

/// Serves registry operations over a Unix domain socket.
pub struct DaemonServer {
    registry: Arc<SessionRegistry>,
    socket: PathBuf,
}

impl DaemonServer {
    pub fn new(registry: Arc<SessionRegistry>, socket: impl Into<PathBuf>) -> Self {
        Self {
            registry,
            socket: socket.into(),
        }
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    /// Bind the socket, clearing a stale file left by a previous daemon.
    ///
    /// Fails if another daemon is still answering on the path.
    pub async fn bind(&self) -> Result<UnixListener> {
        if let Some(parent) = self.socket.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        if self.socket.exists() {
            if UnixStream::connect(&self.socket).await.is_ok() {
                return Err(SessionError::Io(format!(
                    "a daemon is already listening on {}",
                    self.socket.display()
                )));
            }
            debug!(socket = %self.socket.display(), "removing stale socket");
            std::fs::remove_file(&self.socket)?;
        }
        let listener = UnixListener::bind(&self.socket)?;
        info!(socket = %self.socket.display(), "daemon listening");
        Ok(listener)
    }

    /// Accept connections until `shutdown` resolves, then stop every session
    /// and remove the socket file.
    pub async fn run(self, listener: UnixListener, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let registry = self.registry.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(registry, stream).await {
                                debug!(error = %e, "connection ended with error");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                },
            }
        }
        self.registry.shutdown_all().await;
        if let Err(e) = std::fs::remove_file(&self.socket) {
            debug!(error = %e, "could not remove socket file");
        }
    }
}

async fn send(writer: &mut OwnedWriteHalf, reply: &Reply) -> Result<()> {
    let line = encode_line(reply)?;
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

async fn handle_connection(registry: Arc<SessionRegistry>, stream: UnixStream) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let request: Request = match decode_line(&line) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "rejecting malformed request");
                send(&mut writer, &Reply::error(e)).await?;
                continue;
            }
        };
        debug!(?request, "request");
        match request {
            Request::Query { model, text } => {
                let keep_open =
                    handle_query(&registry, &model, &text, &mut lines, &mut writer).await?;
                if !keep_open {
                    break;
                }
            }
            other => {
                let reply = dispatch(&registry, other).await;
                send(&mut writer, &reply).await?;
            }
        }
    }
    Ok(())
}

/// Run one query. Returns false if the client went away while waiting.
async fn handle_query(
    registry: &SessionRegistry,
    model: &str,
    text: &str,
    lines: &mut RequestLines,
    writer: &mut OwnedWriteHalf,
) -> Result<bool> {
    let submitted = match registry.get_or_create(model).await {
        Ok(session) => session.submit(text).map(|ticket| (session, ticket)),
        Err(e) => Err(e),
    };
    let (session, ticket) = match submitted {
        Ok(submitted) => submitted,
        Err(e) => {
            send(writer, &Reply::error(e)).await?;
            return Ok(true);
        }
    };
    let query_id = ticket.id();
    send(writer, &Reply::Queued { query_id }).await?;

    let response = ticket.response();
    tokio::pin!(response);
    let result = loop {
        tokio::select! {
            result = &mut response => break result,
            line = lines.next_line() => match line {
                Ok(Some(extra)) => {
                    debug!(line = %extra, "ignoring request sent while a query is pending");
                }
                Ok(None) | Err(_) => {
                    if session.cancel(query_id) {
                        info!(model = %model, query_id, "client disconnected; query cancelled");
                    } else {
                        debug!(model = %model, query_id, "client disconnected after query was written");
                    }
                    return Ok(false);
                }
            },
        }
    };

    let reply = match result {
        Ok(response) => Reply::Response { response },
        Err(e) => Reply::error(e),
    };
    send(writer, &reply).await?;
    Ok(true)
}

async fn dispatch(registry: &SessionRegistry, request: Request) -> Reply {
    execute(registry, request).await.unwrap_or_else(Reply::error)
}

async fn execute(registry: &SessionRegistry, request: Request) -> Result<Reply> {
    Ok(match request {
        Request::Start { model } => {
            let session = registry.start(&model).await?;
            Reply::Started {
                model,
                session_id: session.id().to_string(),
            }
        }
        Request::Stop { model } => {
            registry.terminate(&model).await?;
            Reply::Stopped { model }
        }
        Request::List { all: false } => Reply::Sessions {
            names: registry.list_active(),
        },
        Request::List { all: true } => Reply::SessionStates {
            sessions: registry
                .list_all()
                .into_iter()
                .map(|(name, state)| SessionEntry { name, state })
                .collect(),
        },
        Request::Status { model } => Reply::Status {
            status: registry.status(&model)?,
        },
        Request::Cancel { model, query_id } => {
            registry.catalog().resolve(&model)?;
            let cancelled = registry
                .get(&model)
                .is_some_and(|session| session.cancel(query_id));
            Reply::Cancelled {
                query_id,
                cancelled,
            }
        }
        Request::Ping => Reply::Pong,
        Request::Query { .. } => {
            return Err(SessionError::Io(
                "query must be handled by the connection".into(),
            ));
        }
    })
}
