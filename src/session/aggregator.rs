// ABOUTME: Output aggregator: turns the unstructured stdout byte stream into framed responses.
// ABOUTME: Frames by prompt marker or idle timeout and pairs each frame FIFO with the oldest query.

//! Framing is a heuristic. An interactive model process has no structured
//! response delimiter, so a response is considered complete when the output
//! ends with the prompt marker the process prints before reading more input,
//! or when no byte has arrived for the idle timeout. A response that happens
//! to end with the marker text, or a model that pauses longer than the idle
//! timeout mid-generation, will be split early.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{Result, SessionError};
use crate::session::types::{Query, Response, SessionEvent};
use crate::supervisor::OutputStream;

/// A query handed to the aggregator just before its bytes are written.
pub(crate) struct Turn {
    pub query: Query,
    pub responder: oneshot::Sender<Result<Response>>,
    /// Fired once the turn is resolved, whatever the outcome.
    pub done: oneshot::Sender<()>,
}

pub(crate) enum TurnMessage {
    Begin(Turn),
    /// The write for this query failed; resolve it with `error`.
    Abort { query_id: u64, error: SessionError },
}

/// Timing and marker policy for one session.
#[derive(Debug, Clone)]
pub(crate) struct Framing {
    pub idle_timeout: Duration,
    pub first_output_timeout: Duration,
    pub prompt_marker: Option<String>,
}

/// Byte accumulator that recognises the prompt marker.
#[derive(Debug, Default)]
pub struct Framer {
    buf: Vec<u8>,
    marker: Option<Vec<u8>>,
}

impl Framer {
    pub fn new(marker: Option<&str>) -> Self {
        Self {
            buf: Vec::new(),
            marker: marker.filter(|m| !m.is_empty()).map(|m| m.as_bytes().to_vec()),
        }
    }

    /// Append a chunk; returns the frame text (marker stripped) if the buffer now ends with the marker.
    pub fn push(&mut self, chunk: &[u8]) -> Option<String> {
        self.buf.extend_from_slice(chunk);
        let marker = self.marker.as_ref()?;
        if !self.buf.ends_with(marker) {
            return None;
        }
        let end = self.buf.len() - marker.len();
        let text = String::from_utf8_lossy(&self.buf[..end]).into_owned();
        self.buf.clear();
        Some(text)
    }

    /// Take everything buffered so far.
    pub fn flush(&mut self) -> String {
        let text = String::from_utf8_lossy(&self.buf).into_owned();
        self.buf.clear();
        text
    }

    /// Drop buffered bytes, returning how many were dropped.
    pub fn discard(&mut self) -> usize {
        let n = self.buf.len();
        self.buf.clear();
        n
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn has_marker(&self) -> bool {
        self.marker.is_some()
    }
}

struct ActiveTurn {
    turn: Turn,
    /// When this turn became the oldest outstanding one.
    since: Instant,
    last_byte: Option<Instant>,
}

impl ActiveTurn {
    fn resolve(self, result: Result<Response>) {
        let _ = self.turn.responder.send(result);
        let _ = self.turn.done.send(());
    }
}

/// A timed-out turn whose reply may still arrive. Its `done` is held, so the
/// writer stays blocked until the process is back at its prompt.
struct Recovery {
    query_id: u64,
    done: oneshot::Sender<()>,
    since: Instant,
    last_byte: Option<Instant>,
    /// The process stayed silent for the whole window and is being retired.
    abandoned: bool,
}

impl Recovery {
    fn new(query_id: u64, done: oneshot::Sender<()>) -> Self {
        Self {
            query_id,
            done,
            since: Instant::now(),
            last_byte: None,
            abandoned: false,
        }
    }

    fn bound(&self, framing: &Framing) -> Instant {
        self.since + framing.first_output_timeout
    }

    /// When late output counts as finished, if that falls inside the bound.
    fn quiet_at(&self, framing: &Framing) -> Option<Instant> {
        self.last_byte
            .map(|last| last + framing.idle_timeout)
            .filter(|&at| at < self.bound(framing))
    }

    fn deadline(&self, framing: &Framing) -> Option<Instant> {
        if self.abandoned {
            return None;
        }
        Some(self.quiet_at(framing).unwrap_or_else(|| self.bound(framing)))
    }

    fn release(self, model: &str, framer: &mut Framer, how: &str) {
        let dropped = framer.discard();
        info!(
            model = %model,
            query_id = self.query_id,
            late_bytes = dropped,
            "timed-out reply drained ({how}); resuming writes"
        );
        let _ = self.done.send(());
    }
}

fn response(query_id: u64, text: String, truncated: bool) -> Response {
    Response {
        query_id,
        text,
        completed_at: Utc::now(),
        truncated,
    }
}

/// Reader loop for one session. Runs until the process output ends, then
/// fails every later turn with `ProcessTerminated`.
pub(crate) async fn run_aggregator(
    model: String,
    mut output: OutputStream,
    mut turns: mpsc::UnboundedReceiver<TurnMessage>,
    framing: Framing,
    ready_tx: oneshot::Sender<()>,
    events: mpsc::UnboundedSender<SessionEvent>,
) {
    let mut framer = Framer::new(framing.prompt_marker.as_deref());
    let mut ready_tx = Some(ready_tx);
    let started = Instant::now();
    let mut outstanding: VecDeque<ActiveTurn> = VecDeque::new();
    let mut last_unsolicited: Option<Instant> = None;
    let mut recovery: Option<Recovery> = None;

    loop {
        let deadline = match &recovery {
            Some(recovery) => recovery.deadline(&framing),
            None => next_deadline(
                &framing,
                framer.has_marker(),
                outstanding.front(),
                ready_tx.is_some(),
                started,
                last_unsolicited,
                framer.is_empty(),
            ),
        };

        tokio::select! {
            biased;

            message = turns.recv() => match message {
                Some(TurnMessage::Begin(turn)) => {
                    if outstanding.is_empty() {
                        let stale = framer.discard();
                        if stale > 0 {
                            debug!(model = %model, bytes = stale, "discarding output received between queries");
                        }
                        last_unsolicited = None;
                    }
                    let _ = events.send(SessionEvent::TurnStarted(turn.query.id));
                    outstanding.push_back(ActiveTurn {
                        turn,
                        since: Instant::now(),
                        last_byte: None,
                    });
                }
                Some(TurnMessage::Abort { query_id, error }) => {
                    if let Some(pos) = outstanding.iter().position(|t| t.turn.query.id == query_id) {
                        if let Some(active) = outstanding.remove(pos) {
                            finish(&events, active, Err(error), &mut outstanding);
                        }
                    }
                }
                // The router is gone; the session was dropped.
                None => break,
            },

            chunk = output.next() => match chunk {
                Some(bytes) => {
                    let now = Instant::now();
                    let frame = framer.push(&bytes);
                    if let Some(pending) = recovery.as_mut() {
                        pending.last_byte = Some(now);
                        if pending.abandoned {
                            framer.discard();
                        } else if frame.is_some() {
                            if let Some(pending) = recovery.take() {
                                pending.release(&model, &mut framer, "prompt marker");
                            }
                        }
                        continue;
                    }
                    match outstanding.front_mut() {
                        Some(front) => {
                            front.last_byte = Some(now);
                            if let Some(text) = frame {
                                if let Some(active) = outstanding.pop_front() {
                                    let id = active.turn.query.id;
                                    debug!(model = %model, query_id = id, "response framed by prompt marker");
                                    finish(&events, active, Ok(response(id, text, false)), &mut outstanding);
                                }
                            }
                        }
                        None => {
                            last_unsolicited = Some(now);
                            if frame.is_some() {
                                last_unsolicited = None;
                                if let Some(tx) = ready_tx.take() {
                                    info!(model = %model, "model prompt seen; session ready");
                                    let _ = events.send(SessionEvent::Ready);
                                    let _ = tx.send(());
                                } else {
                                    debug!(model = %model, "discarding unsolicited prompt");
                                }
                            }
                        }
                    }
                }
                None => {
                    info!(model = %model, "model output closed");
                    let _ = events.send(SessionEvent::Terminated);
                    recovery = None;
                    if let Some(active) = outstanding.pop_front() {
                        let id = active.turn.query.id;
                        let result = if active.last_byte.is_some() {
                            warn!(model = %model, query_id = id, "process ended mid-response");
                            Ok(response(id, framer.flush(), true))
                        } else {
                            Err(SessionError::ProcessTerminated(model.clone()))
                        };
                        active.resolve(result);
                    }
                    for active in outstanding.drain(..) {
                        active.resolve(Err(SessionError::ProcessTerminated(model.clone())));
                    }
                    break;
                }
            },

            _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                if let Some(pending) = recovery.as_mut() {
                    if pending.quiet_at(&framing).is_some() {
                        if let Some(pending) = recovery.take() {
                            pending.release(&model, &mut framer, "idle timeout");
                        }
                    } else {
                        warn!(
                            model = %model,
                            query_id = pending.query_id,
                            "model never returned to its prompt after a timeout; retiring it"
                        );
                        pending.abandoned = true;
                        framer.discard();
                        let _ = events.send(SessionEvent::Unresponsive);
                    }
                } else if let Some(active) = outstanding.pop_front() {
                    let id = active.turn.query.id;
                    if active.last_byte.is_some() {
                        debug!(model = %model, query_id = id, "response framed by idle timeout");
                        let text = framer.flush();
                        finish(&events, active, Ok(response(id, text, false)), &mut outstanding);
                    } else {
                        warn!(model = %model, query_id = id, "no output before first-output timeout");
                        let _ = events.send(SessionEvent::TurnFinished(id));
                        let Turn { responder, done, .. } = active.turn;
                        let _ = responder.send(Err(SessionError::Timeout {
                            model: model.clone(),
                            waited_ms: framing.first_output_timeout.as_millis() as u64,
                        }));
                        recovery = Some(Recovery::new(id, done));
                    }
                } else if let Some(tx) = ready_tx.take() {
                    if framer.has_marker() {
                        warn!(model = %model, "no prompt marker seen during startup; proceeding");
                    }
                    let dropped = framer.discard();
                    info!(model = %model, preamble_bytes = dropped, "session ready");
                    last_unsolicited = None;
                    let _ = events.send(SessionEvent::Ready);
                    let _ = tx.send(());
                } else {
                    let dropped = framer.discard();
                    debug!(model = %model, bytes = dropped, "discarding unsolicited output");
                    last_unsolicited = None;
                }
            }
        }
    }

    // Anything arriving after the process is gone fails straight away.
    turns.close();
    while let Some(message) = turns.recv().await {
        if let TurnMessage::Begin(turn) = message {
            let _ = turn
                .responder
                .send(Err(SessionError::ProcessTerminated(model.clone())));
            let _ = turn.done.send(());
        }
    }
}

/// Resolve a turn, report it, and restart the clock for the next one in line.
fn finish(
    events: &mpsc::UnboundedSender<SessionEvent>,
    active: ActiveTurn,
    result: Result<Response>,
    outstanding: &mut VecDeque<ActiveTurn>,
) {
    let _ = events.send(SessionEvent::TurnFinished(active.turn.query.id));
    active.resolve(result);
    if let Some(next) = outstanding.front_mut() {
        next.since = Instant::now();
    }
}

/// When the aggregator next needs to act without new input, if ever.
fn next_deadline(
    framing: &Framing,
    has_marker: bool,
    front: Option<&ActiveTurn>,
    warming_up: bool,
    started: Instant,
    last_unsolicited: Option<Instant>,
    buffer_empty: bool,
) -> Option<Instant> {
    if let Some(front) = front {
        return Some(match front.last_byte {
            Some(last) => last + framing.idle_timeout,
            None => front.since + framing.first_output_timeout,
        });
    }
    if warming_up {
        return Some(if has_marker {
            started + framing.first_output_timeout
        } else {
            last_unsolicited.unwrap_or(started) + framing.idle_timeout
        });
    }
    if buffer_empty {
        return None;
    }
    last_unsolicited.map(|last| last + framing.idle_timeout)
}
