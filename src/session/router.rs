// ABOUTME: Input router: serializes queries into one model process in submission order.
// ABOUTME: A single writer task drains the FIFO and writes the next query only after the previous one resolves.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::{Notify, mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::error::{Result, SessionError};
use crate::session::aggregator::{Turn, TurnMessage};
use crate::session::types::{Query, Response};
use crate::supervisor::ProcessSupervisor;

struct Pending {
    query: Query,
    responder: oneshot::Sender<Result<Response>>,
}

#[derive(Default)]
struct RouterQueue {
    items: VecDeque<Pending>,
    /// Set once; every later submit fails with this error.
    closed: Option<SessionError>,
}

#[derive(Default)]
struct RouterShared {
    queue: Mutex<RouterQueue>,
    notify: Notify,
}

impl RouterShared {
    fn lock(&self) -> std::sync::MutexGuard<'_, RouterQueue> {
        self.queue.lock().expect("router queue lock poisoned")
    }

    /// Next query to write, or None once the router is closed.
    async fn next(&self) -> Option<Pending> {
        loop {
            let notified = self.notify.notified();
            {
                let mut queue = self.lock();
                if let Some(pending) = queue.items.pop_front() {
                    return Some(pending);
                }
                if queue.closed.is_some() {
                    return None;
                }
            }
            notified.await;
        }
    }

    fn close(&self, reason: SessionError) {
        let (reason, drained) = {
            let mut queue = self.lock();
            let reason = queue.closed.get_or_insert(reason).clone();
            let drained: Vec<Pending> = queue.items.drain(..).collect();
            (reason, drained)
        };
        for pending in drained {
            let _ = pending.responder.send(Err(reason.clone()));
        }
        self.notify.notify_one();
    }
}

/// Handle for one submitted query.
#[derive(Debug)]
pub struct QueryTicket {
    query: Query,
    rx: oneshot::Receiver<Result<Response>>,
}

impl QueryTicket {
    pub fn id(&self) -> u64 {
        self.query.id
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    /// Wait for the framed response (or the error that ended the query).
    pub async fn response(self) -> Result<Response> {
        self.rx.await.unwrap_or_else(|_| {
            Err(SessionError::closed(format!(
                "query {} was dropped before it resolved",
                self.query.id
            )))
        })
    }
}

/// Per-session submission queue plus its writer task.
pub struct InputRouter {
    model: String,
    session_id: String,
    sentinel: String,
    next_id: AtomicU64,
    shared: Arc<RouterShared>,
}

impl InputRouter {
    /// Create the router and start its writer.
    ///
    /// The writer holds back until `ready` fires, then writes each query
    /// followed by `sentinel` and waits for the aggregator to resolve it.
    pub(crate) fn spawn(
        model: &str,
        session_id: &str,
        supervisor: Arc<ProcessSupervisor>,
        turns: mpsc::UnboundedSender<TurnMessage>,
        ready: oneshot::Receiver<()>,
        sentinel: String,
    ) -> Self {
        let shared = Arc::new(RouterShared::default());
        tokio::spawn(run_writer(
            model.to_string(),
            supervisor,
            shared.clone(),
            turns,
            ready,
            sentinel.clone(),
        ));
        Self {
            model: model.to_string(),
            session_id: session_id.to_string(),
            sentinel,
            next_id: AtomicU64::new(1),
            shared,
        }
    }

    /// Enqueue `text`. Never blocks on the process.
    ///
    /// Text the process would read as more than one submission is rejected
    /// with `InvalidInput`.
    pub fn submit(&self, text: &str) -> Result<QueryTicket> {
        if !submits_once(text, &self.sentinel) {
            return Err(SessionError::InvalidInput(format!(
                "query text for '{}' contains the submit sentinel {:?}",
                self.model, self.sentinel
            )));
        }
        let (responder, rx) = oneshot::channel();
        let query = {
            let mut queue = self.shared.lock();
            if let Some(reason) = &queue.closed {
                return Err(reason.clone());
            }
            let query = Query {
                id: self.next_id.fetch_add(1, Ordering::SeqCst),
                session_id: self.session_id.clone(),
                text: text.to_string(),
                submitted_at: Utc::now(),
            };
            queue.items.push_back(Pending {
                query: query.clone(),
                responder,
            });
            query
        };
        debug!(model = %self.model, query_id = query.id, "query queued");
        self.shared.notify.notify_one();
        Ok(QueryTicket { query, rx })
    }

    /// Withdraw a query that has not been written yet. Returns false if it
    /// was already written, resolved, or never existed.
    pub fn cancel(&self, query_id: u64) -> bool {
        let pending = {
            let mut queue = self.shared.lock();
            let pos = queue.items.iter().position(|p| p.query.id == query_id);
            pos.and_then(|pos| queue.items.remove(pos))
        };
        match pending {
            Some(pending) => {
                info!(model = %self.model, query_id, "query cancelled");
                let _ = pending.responder.send(Err(SessionError::Cancelled(query_id)));
                true
            }
            None => false,
        }
    }

    /// Stop accepting queries and fail everything still queued with `reason`.
    /// The first reason given sticks.
    pub fn close(&self, reason: SessionError) {
        self.shared.close(reason);
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed.is_some()
    }

    /// Queries waiting to be written.
    pub fn queued(&self) -> usize {
        self.shared.lock().items.len()
    }
}

impl Drop for InputRouter {
    fn drop(&mut self) {
        self.shared
            .close(SessionError::closed(format!("session '{}' dropped", self.model)));
    }
}

/// True when `text` followed by `sentinel` ends the input exactly once, at the end.
fn submits_once(text: &str, sentinel: &str) -> bool {
    let framed = format!("{text}{sentinel}");
    framed.find(sentinel) == Some(text.len())
}

async fn run_writer(
    model: String,
    supervisor: Arc<ProcessSupervisor>,
    shared: Arc<RouterShared>,
    turns: mpsc::UnboundedSender<TurnMessage>,
    ready: oneshot::Receiver<()>,
    sentinel: String,
) {
    let mut process = supervisor.subscribe();
    let terminated = || SessionError::ProcessTerminated(model.clone());

    let warmed = tokio::select! {
        biased;
        _ = process.wait_for(|s| s.is_terminal()) => false,
        ready = ready => ready.is_ok(),
    };
    if !warmed {
        warn!(model = %model, "process ended before it was ready");
        shared.close(terminated());
        return;
    }

    loop {
        let next = tokio::select! {
            biased;
            _ = process.wait_for(|s| s.is_terminal()) => {
                shared.close(terminated());
                break;
            }
            next = shared.next() => next,
        };
        let Some(pending) = next else {
            break;
        };

        let query_id = pending.query.id;
        let mut bytes = pending.query.text.clone().into_bytes();
        bytes.extend_from_slice(sentinel.as_bytes());

        let (done_tx, done_rx) = oneshot::channel();
        let turn = Turn {
            query: pending.query,
            responder: pending.responder,
            done: done_tx,
        };
        if let Err(mpsc::error::SendError(message)) = turns.send(TurnMessage::Begin(turn)) {
            if let TurnMessage::Begin(turn) = message {
                let _ = turn.responder.send(Err(terminated()));
            }
            shared.close(terminated());
            break;
        }

        debug!(model = %model, query_id, bytes = bytes.len(), "writing query");
        if let Err(error) = supervisor.write_input(&bytes).await {
            warn!(model = %model, query_id, error = %error, "write failed");
            shared.close(error.clone());
            let _ = turns.send(TurnMessage::Abort { query_id, error });
        }
        let _ = done_rx.await;
    }
    debug!(model = %model, "writer finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionSettings;
    use crate::catalog::ModelDescriptor;
    use crate::session::aggregator::{Framing, run_aggregator};
    use crate::supervisor::fake::FakeLauncher;
    use std::time::Duration;

    async fn router_with(launcher: FakeLauncher) -> (InputRouter, Arc<ProcessSupervisor>) {
        let model = ModelDescriptor::new("m", "/opt/fake/main", "/models/m.gguf");
        let settings = SessionSettings {
            threads: 1,
            idle_timeout: Duration::from_millis(500),
            first_output_timeout: Duration::from_secs(2),
            startup_check: Duration::from_millis(10),
            prompt_marker: Some("\n> ".to_string()),
            submit_sentinel: "/\n".to_string(),
        };
        let supervisor = Arc::new(
            ProcessSupervisor::start(&launcher, &model, &settings)
                .await
                .unwrap(),
        );
        let (turn_tx, turn_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_aggregator(
            "m".to_string(),
            supervisor.read_output().unwrap(),
            turn_rx,
            Framing {
                idle_timeout: settings.idle_timeout,
                first_output_timeout: settings.first_output_timeout,
                prompt_marker: settings.prompt_marker.clone(),
            },
            ready_tx,
            events_tx,
        ));
        let router = InputRouter::spawn(
            "m",
            "session-1",
            supervisor.clone(),
            turn_tx,
            ready_rx,
            "/\n".to_string(),
        );
        (router, supervisor)
    }

    #[tokio::test]
    async fn responses_follow_submission_order() {
        let (router, _sup) = router_with(FakeLauncher::new()).await;
        let tickets: Vec<QueryTicket> = (0..5)
            .map(|i| router.submit(&format!("q{i}")).unwrap())
            .collect();
        let ids: Vec<u64> = tickets.iter().map(QueryTicket::id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);

        for (i, ticket) in tickets.into_iter().enumerate() {
            let id = ticket.id();
            let resp = ticket.response().await.unwrap();
            assert_eq!(resp.query_id, id);
            assert_eq!(resp.text, format!("echo: q{i}"));
        }
    }

    #[tokio::test]
    async fn cancel_removes_queued_query() {
        let launcher = FakeLauncher::new().with_reply_delay(Duration::from_millis(200));
        let (router, _sup) = router_with(launcher).await;
        let first = router.submit("first").unwrap();
        let second = router.submit("second").unwrap();
        let third = router.submit("third").unwrap();

        assert!(router.cancel(second.id()));
        assert!(!router.cancel(second.id()));
        assert_eq!(second.response().await, Err(SessionError::Cancelled(2)));

        assert_eq!(first.response().await.unwrap().text, "echo: first");
        assert_eq!(third.response().await.unwrap().text, "echo: third");
    }

    #[tokio::test]
    async fn closed_router_rejects_submissions() {
        let launcher = FakeLauncher::new().with_reply_delay(Duration::from_millis(200));
        let (router, _sup) = router_with(launcher).await;
        let _first = router.submit("first").unwrap();
        let queued = router.submit("second").unwrap();

        router.close(SessionError::closed("stopped"));
        router.close(SessionError::closed("ignored"));
        assert!(router.is_closed());
        assert_eq!(queued.response().await, Err(SessionError::closed("stopped")));
        assert_eq!(
            router.submit("late").unwrap_err(),
            SessionError::closed("stopped")
        );
    }

    #[test]
    fn sentinel_inside_text_is_a_second_submission() {
        assert!(submits_once("plain question", "/\n"));
        assert!(submits_once("ends with a slash/", "/\n"));
        assert!(submits_once("two\nlines", "/\n"));
        assert!(!submits_once("see http://x.com/\nthanks", "/\n"));
        assert!(!submits_once("two\nlines", "\n"));
        assert!(!submits_once("a", "aa"));
    }

    #[tokio::test]
    async fn text_containing_sentinel_is_rejected() {
        let (router, _sup) = router_with(FakeLauncher::new()).await;
        let err = router.submit("see http://x.com/\nthanks").unwrap_err();
        assert!(matches!(err, SessionError::InvalidInput(_)));
        assert_eq!(router.queued(), 0);

        // The rejected text never reached the process, so pairing is intact.
        let ok = router.submit("see http://x.com/ thanks").unwrap();
        assert_eq!(ok.id(), 1);
        assert_eq!(ok.response().await.unwrap().text, "echo: see http://x.com/ thanks");
    }

    #[tokio::test]
    async fn process_exit_closes_router() {
        let launcher = FakeLauncher::new();
        let (router, sup) = router_with(launcher).await;
        sup.stop(Duration::from_millis(100)).await;

        let mut tries = 0;
        while !router.is_closed() && tries < 100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            tries += 1;
        }
        assert!(matches!(
            router.submit("after"),
            Err(SessionError::ProcessTerminated(_))
        ));
    }
}
