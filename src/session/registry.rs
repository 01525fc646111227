// ABOUTME: Session registry: the single owner of model-name → session mappings.
// ABOUTME: Creates sessions lazily or explicitly, deduplicates concurrent creation, and tears them down.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared, join_all};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::catalog::{ModelCatalog, ModelDescriptor};
use crate::config::{Config, SessionSettings};
use crate::error::{Result, SessionError};
use crate::session::aggregator::{Framing, run_aggregator};
use crate::session::router::{InputRouter, QueryTicket};
use crate::session::types::{Response, SessionEvent, SessionState, SessionStatus};
use crate::supervisor::{Launcher, ProcessState, ProcessSupervisor};

/// One live model process with its router and aggregator.
pub struct Session {
    id: String,
    descriptor: ModelDescriptor,
    settings: SessionSettings,
    started_at: DateTime<Utc>,
    supervisor: Arc<ProcessSupervisor>,
    router: InputRouter,
    state: watch::Sender<SessionState>,
    /// Id of the query currently being answered; 0 when idle.
    in_flight: AtomicU64,
    served: AtomicU64,
}

impl Session {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn descriptor(&self) -> &ModelDescriptor {
        &self.descriptor
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Watch session state changes.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn is_terminated(&self) -> bool {
        self.state() == SessionState::Terminated
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    /// Queue a query; the ticket resolves with its response.
    pub fn submit(&self, text: &str) -> Result<QueryTicket> {
        self.router.submit(text)
    }

    /// Submit and wait for the response.
    pub async fn query(&self, text: &str) -> Result<Response> {
        self.submit(text)?.response().await
    }

    /// Cancel a query that has not been written yet.
    pub fn cancel(&self, query_id: u64) -> bool {
        self.router.cancel(query_id)
    }

    pub fn status(&self) -> SessionStatus {
        let in_flight = self.in_flight.load(Ordering::SeqCst);
        SessionStatus {
            name: self.descriptor.name.clone(),
            session_id: Some(self.id.clone()),
            state: self.state(),
            process: self.supervisor.state(),
            pid: self.supervisor.pid(),
            started_at: Some(self.started_at),
            queued: self.router.queued(),
            in_flight: (in_flight != 0).then_some(in_flight),
            served: self.served.load(Ordering::SeqCst),
            exit: self.supervisor.exit_info(),
        }
    }

    fn apply(&self, event: SessionEvent) {
        match event {
            SessionEvent::Ready => {
                let changed = self.transition(|s| s == SessionState::Starting, SessionState::Ready);
                if changed {
                    info!(model = %self.name(), session_id = %self.id, "session ready");
                }
            }
            SessionEvent::TurnStarted(query_id) => {
                self.in_flight.store(query_id, Ordering::SeqCst);
                self.transition(
                    |s| matches!(s, SessionState::Starting | SessionState::Ready),
                    SessionState::Busy,
                );
            }
            SessionEvent::TurnFinished(query_id) => {
                let _ = self.in_flight.compare_exchange(
                    query_id,
                    0,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                );
                self.served.fetch_add(1, Ordering::SeqCst);
                self.transition(|s| s == SessionState::Busy, SessionState::Ready);
            }
            SessionEvent::Unresponsive | SessionEvent::Terminated => self.mark_terminated(),
        }
    }

    fn transition(&self, from: impl Fn(SessionState) -> bool, to: SessionState) -> bool {
        self.state.send_if_modified(|state| {
            if from(*state) {
                *state = to;
                true
            } else {
                false
            }
        })
    }

    fn mark_terminated(&self) {
        self.router
            .close(SessionError::ProcessTerminated(self.descriptor.name.clone()));
        self.in_flight.store(0, Ordering::SeqCst);
        let changed = self.transition(|s| s != SessionState::Terminated, SessionState::Terminated);
        if changed {
            warn!(
                model = %self.name(),
                session_id = %self.id,
                exit = ?self.supervisor.exit_info(),
                "session terminated"
            );
        }
    }

    /// Close the router, mark terminated, and stop the process.
    async fn shutdown(&self, grace: Duration) {
        self.router.close(SessionError::closed(format!(
            "session '{}' was stopped",
            self.descriptor.name
        )));
        self.state.send_replace(SessionState::Terminated);
        let state = self.supervisor.stop(grace).await;
        info!(model = %self.name(), session_id = %self.id, process = ?state, "session stopped");
    }
}

/// Apply router/aggregator events and process exit to session state.
/// An unresponsive process is stopped here, with `grace` before the kill.
async fn apply_events(
    session: Weak<Session>,
    mut events: mpsc::UnboundedReceiver<SessionEvent>,
    mut process: watch::Receiver<ProcessState>,
    grace: Duration,
) {
    let mut exited = false;
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                let Some(session) = session.upgrade() else { break };
                let retire = event == SessionEvent::Unresponsive;
                session.apply(event);
                if retire {
                    let state = session.supervisor.stop(grace).await;
                    info!(model = %session.name(), process = ?state, "unresponsive model stopped");
                }
            }
            _ = async { let _ = process.wait_for(|s| s.is_terminal()).await; }, if !exited => {
                exited = true;
                let Some(session) = session.upgrade() else { break };
                session.mark_terminated();
            }
        }
    }
}

/// Builds fully wired sessions.
#[derive(Clone)]
pub struct SessionFactory {
    launcher: Arc<dyn Launcher>,
    config: Arc<Config>,
}

impl SessionFactory {
    pub fn new(launcher: Arc<dyn Launcher>, config: Arc<Config>) -> Self {
        Self { launcher, config }
    }

    /// Spawn the process and wire up its writer, aggregator, and state events.
    pub async fn create(&self, descriptor: ModelDescriptor) -> Result<Arc<Session>> {
        let settings = self.config.session_settings(&descriptor);
        let supervisor = Arc::new(
            ProcessSupervisor::start(self.launcher.as_ref(), &descriptor, &settings).await?,
        );
        let output = supervisor.read_output()?;
        let id = Uuid::new_v4().to_string();

        let (turn_tx, turn_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        tokio::spawn(run_aggregator(
            descriptor.name.clone(),
            output,
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
            &descriptor.name,
            &id,
            supervisor.clone(),
            turn_tx,
            ready_rx,
            settings.submit_sentinel.clone(),
        );

        let process = supervisor.subscribe();
        let session = Arc::new(Session {
            id,
            descriptor,
            settings,
            started_at: Utc::now(),
            supervisor,
            router,
            state: watch::Sender::new(SessionState::Starting),
            in_flight: AtomicU64::new(0),
            served: AtomicU64::new(0),
        });
        tokio::spawn(apply_events(
            Arc::downgrade(&session),
            events_rx,
            process,
            self.config.stop_grace(),
        ));
        info!(model = %session.name(), session_id = %session.id, "session created");
        Ok(session)
    }
}

type Creation = Shared<BoxFuture<'static, Result<Arc<Session>>>>;

enum Slot {
    /// A spawn is in progress; every caller awaits the same future.
    Creating(Creation),
    Live(Arc<Session>),
    /// Explicitly stopped; only `start` brings it back.
    Stopped,
}

/// Owns every session. All registry methods are safe to call concurrently.
pub struct SessionRegistry {
    catalog: ModelCatalog,
    factory: SessionFactory,
    stop_grace: Duration,
    slots: Mutex<HashMap<String, Slot>>,
}

impl SessionRegistry {
    pub fn new(config: Config, launcher: Arc<dyn Launcher>) -> Result<Self> {
        let catalog = ModelCatalog::new(config.models.clone())?;
        let stop_grace = config.stop_grace();
        Ok(Self {
            catalog,
            factory: SessionFactory::new(launcher, Arc::new(config)),
            stop_grace,
            slots: Mutex::new(HashMap::new()),
        })
    }

    pub fn catalog(&self) -> &ModelCatalog {
        &self.catalog
    }

    fn slots(&self) -> std::sync::MutexGuard<'_, HashMap<String, Slot>> {
        self.slots.lock().expect("session slots lock poisoned")
    }

    /// Return the session for `name`, spawning it on first use.
    ///
    /// A stopped name fails with `ClosedChannel`; a crashed session is
    /// returned as is and rejects queries with `ProcessTerminated`.
    pub async fn get_or_create(&self, name: &str) -> Result<Arc<Session>> {
        let descriptor = self.catalog.resolve(name)?;
        let creation = {
            let mut slots = self.slots();
            match slots.get(name) {
                Some(Slot::Live(session)) => return Ok(session.clone()),
                Some(Slot::Stopped) => {
                    return Err(SessionError::closed(format!(
                        "session '{name}' was stopped; start it explicitly"
                    )));
                }
                Some(Slot::Creating(creation)) => creation.clone(),
                None => self.begin_creation(&mut slots, descriptor),
            }
        };
        self.finish_creation(name, creation).await
    }

    /// Explicitly start `name`. Returns a live session unchanged, and replaces
    /// a terminated or stopped one.
    pub async fn start(&self, name: &str) -> Result<Arc<Session>> {
        let descriptor = self.catalog.resolve(name)?;
        let creation = {
            let mut slots = self.slots();
            match slots.get(name) {
                Some(Slot::Live(session)) if !session.is_terminated() => {
                    debug!(model = %name, "start requested for running session");
                    return Ok(session.clone());
                }
                Some(Slot::Creating(creation)) => creation.clone(),
                _ => self.begin_creation(&mut slots, descriptor),
            }
        };
        self.finish_creation(name, creation).await
    }

    fn begin_creation(
        &self,
        slots: &mut HashMap<String, Slot>,
        descriptor: ModelDescriptor,
    ) -> Creation {
        let name = descriptor.name.clone();
        info!(model = %name, "creating session");
        let factory = self.factory.clone();
        // Spawned so creation finishes even if every caller goes away.
        let handle = tokio::spawn(async move { factory.create(descriptor).await });
        let model = name.clone();
        let creation = async move {
            handle.await.unwrap_or_else(|e| {
                Err(SessionError::spawn(model, format!("session creation task failed: {e}")))
            })
        }
        .boxed()
        .shared();
        slots.insert(name, Slot::Creating(creation.clone()));
        creation
    }

    async fn finish_creation(&self, name: &str, creation: Creation) -> Result<Arc<Session>> {
        let result = creation.clone().await;
        let installed = {
            let mut slots = self.slots();
            let ours = matches!(
                slots.get(name),
                Some(Slot::Creating(current)) if current.ptr_eq(&creation)
            );
            if ours {
                match &result {
                    Ok(session) => {
                        slots.insert(name.to_string(), Slot::Live(session.clone()));
                    }
                    Err(e) => {
                        warn!(model = %name, error = %e, "session creation failed");
                        slots.remove(name);
                    }
                }
                true
            } else {
                match (slots.get(name), &result) {
                    // Another waiter on the same creation installed it first.
                    (Some(Slot::Live(live)), Ok(session)) => Arc::ptr_eq(live, session),
                    (_, result) => result.is_err(),
                }
            }
        };
        if installed {
            return result;
        }
        // Stopped while the process was still starting.
        if let Ok(session) = result {
            session.shutdown(self.stop_grace).await;
        }
        Err(SessionError::closed(format!(
            "session '{name}' was stopped while starting"
        )))
    }

    /// Stop `name` and leave a tombstone. Succeeds if nothing is running.
    pub async fn terminate(&self, name: &str) -> Result<()> {
        if self.catalog.resolve(name).is_err() {
            warn!(model = %name, "stop requested for unknown model");
            return Ok(());
        }
        let previous = self.slots().insert(name.to_string(), Slot::Stopped);
        match previous {
            Some(Slot::Live(session)) => session.shutdown(self.stop_grace).await,
            Some(Slot::Creating(creation)) => {
                if let Ok(session) = creation.await {
                    session.shutdown(self.stop_grace).await;
                }
            }
            Some(Slot::Stopped) | None => {
                info!(model = %name, "stop requested; no session running");
            }
        }
        Ok(())
    }

    /// Names of sessions that are not terminated, sorted.
    pub fn list_active(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .slots()
            .iter()
            .filter_map(|(name, slot)| match slot {
                Slot::Live(session) if !session.is_terminated() => Some(name.clone()),
                _ => None,
            })
            .collect();
        names.sort();
        names
    }

    /// Every registered session with its state, sorted by name.
    pub fn list_all(&self) -> Vec<(String, SessionState)> {
        let mut all: Vec<(String, SessionState)> = self
            .slots()
            .iter()
            .filter_map(|(name, slot)| match slot {
                Slot::Live(session) => Some((name.clone(), session.state())),
                Slot::Creating(_) => Some((name.clone(), SessionState::Starting)),
                Slot::Stopped => None,
            })
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    /// Snapshot for `name`; `None` if no session is registered.
    pub fn status(&self, name: &str) -> Result<Option<SessionStatus>> {
        self.catalog.resolve(name)?;
        Ok(match self.slots().get(name) {
            Some(Slot::Live(session)) => Some(session.status()),
            Some(Slot::Creating(_)) => Some(SessionStatus::starting(name)),
            Some(Slot::Stopped) | None => None,
        })
    }

    /// Live session for `name` without creating one.
    pub fn get(&self, name: &str) -> Option<Arc<Session>> {
        match self.slots().get(name) {
            Some(Slot::Live(session)) => Some(session.clone()),
            _ => None,
        }
    }

    /// Stop every session. Used on daemon shutdown.
    pub async fn shutdown_all(&self) {
        let sessions: Vec<Arc<Session>> = self
            .slots()
            .drain()
            .filter_map(|(_, slot)| match slot {
                Slot::Live(session) => Some(session),
                _ => None,
            })
            .collect();
        info!(count = sessions.len(), "stopping all sessions");
        join_all(sessions.iter().map(|s| s.shutdown(self.stop_grace))).await;
    }
}
