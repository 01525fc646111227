// ABOUTME: CLI side of the local IPC: connects to the daemon socket and exchanges JSON lines.
// ABOUTME: One connection per CLI invocation; a query reads the queued ack and then the final reply.

use std::path::Path;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};

use crate::error::{Result, SessionError};
use crate::ipc::protocol::{Reply, Request, decode_line, encode_line};
use crate::session::Response;

pub struct DaemonClient {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl DaemonClient {
    /// Connect to a running daemon. The raw I/O error is returned so callers
    /// can tell "daemon not running" apart from request failures.
    pub async fn connect(socket: &Path) -> std::io::Result<Self> {
        let stream = UnixStream::connect(socket).await?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            lines: BufReader::new(reader).lines(),
            writer,
        })
    }

    pub async fn send(&mut self, request: &Request) -> Result<()> {
        let line = encode_line(request)?;
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Next reply line from the daemon.
    pub async fn recv(&mut self) -> Result<Reply> {
        loop {
            match self.lines.next_line().await? {
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => return decode_line(&line),
                None => return Err(SessionError::Io("daemon closed the connection".into())),
            }
        }
    }

    /// Send one request and wait for its single reply.
    pub async fn call(&mut self, request: &Request) -> Result<Reply> {
        self.send(request).await?;
        self.recv().await
    }

    /// Submit a query and wait for its response. `on_queued` sees the query
    /// id as soon as the daemon has accepted it.
    pub async fn query(
        &mut self,
        model: &str,
        text: &str,
        on_queued: impl FnOnce(u64),
    ) -> Result<Response> {
        self.send(&Request::Query {
            model: model.to_string(),
            text: text.to_string(),
        })
        .await?;
        match self.recv().await? {
            Reply::Queued { query_id } => on_queued(query_id),
            Reply::Error { error } => return Err(error),
            other => return Err(unexpected(&other)),
        }
        match self.recv().await? {
            Reply::Response { response } => Ok(response),
            Reply::Error { error } => Err(error),
            other => Err(unexpected(&other)),
        }
    }
}

/// Error for a reply that does not fit the request.
pub fn unexpected(reply: &Reply) -> SessionError {
    SessionError::Io(format!("unexpected reply from daemon: {reply:?}"))
}
