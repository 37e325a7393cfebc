use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tonic::Status;
use uuid::Uuid;

use super::AgentError;
use super::proto::{
    AgentTask, DataType, StreamClose, StreamData, StreamMessage, StreamOperation, StreamResize,
    stream_message,
};
use super::store;
use crate::config::AgentConfig;
use crate::metrics::Metrics;
use crate::store::pool::Db;

/// Which multiplexed stream a sub-session rides on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Docker,
    Terminal,
}

/// Agent connection lifecycle:
/// Disconnected → Authenticating → Registered → Streaming → (Draining →) Disconnected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Authenticating,
    Registered,
    Streaming,
    Draining,
}

/// Event flowing from an agent sub-session toward its orchestrator.
#[derive(Debug)]
pub enum SessionEvent {
    /// Agent attached the sub-session and is ready for traffic.
    Ready,
    Data {
        data: Vec<u8>,
        data_type: DataType,
    },
    Closed {
        reason: String,
    },
    Error {
        message: String,
    },
}

type OutboundTx = mpsc::Sender<Result<StreamMessage, Status>>;

struct QueuedTask {
    task: AgentTask,
    enqueued_at: Instant,
}

pub struct AgentEntry {
    pub uuid: String,
    agent_id: Mutex<String>,
    state: Mutex<ConnState>,
    tasks: Mutex<VecDeque<QueuedTask>>,
    streams: Mutex<HashMap<StreamKind, OutboundTx>>,
    cancel: Mutex<CancellationToken>,
    epoch: AtomicU64,
}

impl AgentEntry {
    fn new(uuid: &str) -> Self {
        Self {
            uuid: uuid.to_owned(),
            agent_id: Mutex::new(String::new()),
            state: Mutex::new(ConnState::Disconnected),
            tasks: Mutex::new(VecDeque::new()),
            streams: Mutex::new(HashMap::new()),
            cancel: Mutex::new(CancellationToken::new()),
            epoch: AtomicU64::new(0),
        }
    }

    pub fn agent_id(&self) -> String {
        self.agent_id.lock().expect("agent_id lock").clone()
    }

    pub fn state(&self) -> ConnState {
        *self.state.lock().expect("state lock")
    }

    fn set_state(&self, next: ConnState) {
        let mut state = self.state.lock().expect("state lock");
        if *state != next {
            tracing::debug!(uuid = %self.uuid, from = ?*state, to = ?next, "agent state transition");
            *state = next;
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.lock().expect("cancel lock").clone()
    }
}

struct SubSession {
    agent_uuid: String,
    kind: StreamKind,
    to_client: mpsc::Sender<SessionEvent>,
}

/// The set of live agents and sub-sessions. One instance per server; shared
/// by the gRPC service, the terminal orchestrator, and the HTTP surface.
pub struct AgentRegistry {
    db: Db,
    cfg: AgentConfig,
    metrics: Arc<Metrics>,
    agents: DashMap<String, Arc<AgentEntry>>,
    sessions: DashMap<String, SubSession>,
}

impl AgentRegistry {
    pub fn new(db: Db, cfg: AgentConfig, metrics: Arc<Metrics>) -> Arc<Self> {
        Arc::new(Self {
            db,
            cfg,
            metrics,
            agents: DashMap::new(),
            sessions: DashMap::new(),
        })
    }

    pub fn config(&self) -> &AgentConfig {
        &self.cfg
    }

    fn entry(&self, uuid: &str) -> Option<Arc<AgentEntry>> {
        self.agents.get(uuid).map(|e| Arc::clone(&e))
    }

    fn entry_or_create(&self, uuid: &str) -> Arc<AgentEntry> {
        Arc::clone(
            &self
                .agents
                .entry(uuid.to_owned())
                .or_insert_with(|| Arc::new(AgentEntry::new(uuid))),
        )
    }

    /// Lifecycle hook: successful `RegisterAgent`.
    pub fn mark_registered(&self, uuid: &str, agent_id: &str) {
        let entry = self.entry_or_create(uuid);
        *entry.agent_id.lock().expect("agent_id lock") = agent_id.to_owned();
        entry.set_state(ConnState::Registered);
    }

    /// Lifecycle hook: `ReportState` stream opened. Returns the entry and the
    /// connection epoch used to match the eventual disconnect.
    pub fn connected(&self, uuid: &str, agent_id: &str) -> (Arc<AgentEntry>, u64) {
        let entry = self.entry_or_create(uuid);
        *entry.agent_id.lock().expect("agent_id lock") = agent_id.to_owned();

        // A lingering previous connection is cancelled before the fresh one
        // takes over.
        let old = {
            let mut cancel = entry.cancel.lock().expect("cancel lock");
            std::mem::replace(&mut *cancel, CancellationToken::new())
        };
        old.cancel();

        let was_online = entry.state() == ConnState::Streaming;
        entry.set_state(ConnState::Streaming);
        if !was_online {
            self.metrics.agents_online.inc();
        }
        let epoch = entry.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::info!(%uuid, epoch, "agent connected");
        (entry, epoch)
    }

    /// Lifecycle hook: the `ReportState` stream ended. Ignored when a newer
    /// connection has already superseded this epoch.
    pub async fn disconnected(&self, uuid: &str, epoch: u64) {
        let Some(entry) = self.entry(uuid) else {
            return;
        };
        if entry.epoch.load(Ordering::SeqCst) != epoch {
            return;
        }

        entry.set_state(ConnState::Disconnected);
        entry.streams.lock().expect("streams lock").clear();
        self.metrics.agents_online.dec();
        tracing::info!(%uuid, "agent disconnected");

        self.terminate_sessions(|s| s.agent_uuid == uuid, "agent_unreachable")
            .await;
    }

    /// Register the outbound half of a multiplexed stream.
    pub fn attach_stream(&self, uuid: &str, kind: StreamKind, tx: OutboundTx) {
        let entry = self.entry_or_create(uuid);
        entry.streams.lock().expect("streams lock").insert(kind, tx);
    }

    /// One multiplexed stream closed; `ReportState` and the other stream are
    /// unaffected, but sub-sessions riding the closed stream are torn down.
    pub async fn stream_closed(&self, uuid: &str, kind: StreamKind) {
        if let Some(entry) = self.entry(uuid) {
            entry.streams.lock().expect("streams lock").remove(&kind);
        }
        self.terminate_sessions(|s| s.agent_uuid == uuid && s.kind == kind, "stream_closed")
            .await;
    }

    async fn terminate_sessions<F: Fn(&SubSession) -> bool>(&self, predicate: F, reason: &str) {
        let doomed: Vec<(String, mpsc::Sender<SessionEvent>)> = self
            .sessions
            .iter()
            .filter(|item| predicate(item.value()))
            .map(|item| (item.key().clone(), item.value().to_client.clone()))
            .collect();

        for (session_id, tx) in doomed {
            self.sessions.remove(&session_id);
            let _ = tx
                .send(SessionEvent::Error {
                    message: reason.to_owned(),
                })
                .await;
        }
    }

    /// Queue a task for an agent (bounded per-agent FIFO). The task is also
    /// persisted for history; the queue itself is in-memory and lost on
    /// server restart.
    pub async fn enqueue_task(&self, uuid: &str, task: AgentTask) -> Result<(), AgentError> {
        // Offline agents keep their queue: a registered-but-disconnected
        // agent gets an entry on demand and drains it after reconnecting.
        let entry = match self.entry(uuid) {
            Some(entry) => entry,
            None => {
                let agent = store::find_by_uuid(&self.db, uuid)
                    .await
                    .map_err(AgentError::Internal)?
                    .ok_or_else(|| AgentError::Unreachable(uuid.to_owned()))?;
                let entry = self.entry_or_create(uuid);
                *entry.agent_id.lock().expect("agent_id lock") = agent.id;
                entry
            }
        };

        let agent_id = entry.agent_id();
        store::create_task(
            &self.db,
            &task.task_id,
            &agent_id,
            &task.task_type,
            &task.params,
            &task.payload,
        )
        .await
        .map_err(AgentError::Internal)?;

        let mut tasks = entry.tasks.lock().expect("tasks lock");
        if tasks.len() >= self.cfg.max_pending_tasks {
            return Err(AgentError::QueueFull);
        }
        tasks.push_back(QueuedTask {
            task,
            enqueued_at: Instant::now(),
        });
        Ok(())
    }

    /// Drain up to `dispatch_batch` tasks in FIFO order, dropping any whose
    /// TTL has lapsed. Returns `(tasks, expired_ids)`.
    pub fn drain_tasks(&self, uuid: &str) -> (Vec<AgentTask>, Vec<String>) {
        let Some(entry) = self.entry(uuid) else {
            return (Vec::new(), Vec::new());
        };
        let ttl = Duration::from_secs(self.cfg.task_ttl_secs);
        let mut drained = Vec::new();
        let mut expired = Vec::new();

        let mut tasks = entry.tasks.lock().expect("tasks lock");
        while drained.len() < self.cfg.dispatch_batch {
            let Some(queued) = tasks.pop_front() else {
                break;
            };
            if queued.enqueued_at.elapsed() > ttl {
                expired.push(queued.task.task_id);
            } else {
                drained.push(queued.task);
            }
        }
        (drained, expired)
    }

    pub fn pending_tasks(&self, uuid: &str) -> usize {
        self.entry(uuid)
            .map_or(0, |e| e.tasks.lock().expect("tasks lock").len())
    }

    /// Open a sub-session: allocate a session id, queue the carrying task,
    /// and hand back the orchestrator's handle. The agent attaches by sending
    /// `Init{session_id, ready}` on the matching stream.
    pub async fn open_session(
        self: &Arc<Self>,
        agent_uuid: &str,
        operation: StreamOperation,
        container_id: Option<&str>,
        image_name: Option<&str>,
        mut params: HashMap<String, String>,
    ) -> Result<SessionHandle, AgentError> {
        let session_id = Uuid::new_v4().to_string();
        let kind = match operation {
            StreamOperation::Terminal => StreamKind::Terminal,
            _ => StreamKind::Docker,
        };
        let task_type = match kind {
            StreamKind::Terminal => "terminal",
            StreamKind::Docker => "docker_op",
        };

        params.insert("stream_id".into(), session_id.clone());
        params.insert("operation".into(), operation.as_str_name().to_lowercase());
        if let Some(c) = container_id {
            params.insert("container_id".into(), c.to_owned());
        }
        if let Some(i) = image_name {
            params.insert("image_name".into(), i.to_owned());
        }

        let (tx, rx) = mpsc::channel(256);
        self.sessions.insert(
            session_id.clone(),
            SubSession {
                agent_uuid: agent_uuid.to_owned(),
                kind,
                to_client: tx,
            },
        );

        let task = AgentTask {
            task_id: Uuid::new_v4().to_string(),
            task_type: task_type.to_owned(),
            params,
            payload: Vec::new(),
        };
        if let Err(e) = self.enqueue_task(agent_uuid, task).await {
            self.sessions.remove(&session_id);
            return Err(e);
        }

        Ok(SessionHandle {
            session_id,
            agent_uuid: agent_uuid.to_owned(),
            kind,
            events: rx,
            registry: Arc::clone(self),
            closed: false,
        })
    }

    /// Route an event from the agent to the owning orchestrator. Unknown
    /// session ids are answered with a `Close` so the agent can reap the
    /// process on its side.
    pub async fn deliver(&self, session_id: &str, event: SessionEvent) {
        let target = self
            .sessions
            .get(session_id)
            .map(|s| (s.agent_uuid.clone(), s.kind, s.to_client.clone()));

        match target {
            Some((agent_uuid, kind, tx)) => {
                let terminal = matches!(event, SessionEvent::Closed { .. } | SessionEvent::Error { .. });
                if tx.send(event).await.is_err() {
                    // Orchestrator went away; tell the agent to stop.
                    self.sessions.remove(session_id);
                    let _ = self.send_to_agent(
                        &agent_uuid,
                        kind,
                        stream_message::Msg::Close(StreamClose {
                            session_id: session_id.to_owned(),
                            reason: "client_gone".into(),
                        }),
                    );
                } else if terminal {
                    self.sessions.remove(session_id);
                }
            }
            None => {
                tracing::debug!(session_id, "frame for unknown sub-session");
            }
        }
    }

    /// Send a frame to an agent over a multiplexed stream. A full outbound
    /// queue drops the whole agent connection (`ResourceExhausted`), forcing
    /// a clean reconnect.
    pub fn send_to_agent(
        &self,
        uuid: &str,
        kind: StreamKind,
        msg: stream_message::Msg,
    ) -> Result<(), AgentError> {
        let entry = self
            .entry(uuid)
            .ok_or_else(|| AgentError::Unreachable(uuid.to_owned()))?;

        let tx = {
            let streams = entry.streams.lock().expect("streams lock");
            streams.get(&kind).cloned()
        }
        .ok_or(AgentError::StreamClosed)?;

        match tx.try_send(Ok(StreamMessage { msg: Some(msg) })) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(%uuid, "outbound queue full; dropping agent");
                entry.set_state(ConnState::Draining);
                entry.cancel_token().cancel();
                Err(AgentError::Backpressure)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                entry.streams.lock().expect("streams lock").remove(&kind);
                Err(AgentError::StreamClosed)
            }
        }
    }

    pub fn remove_session(&self, session_id: &str) {
        self.sessions.remove(session_id);
    }

    pub fn session_exists(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    pub fn entry_token(&self, uuid: &str) -> Option<CancellationToken> {
        self.entry(uuid).map(|e| e.cancel_token())
    }

    pub fn entry_agent_id(&self, uuid: &str) -> Option<String> {
        self.entry(uuid).map(|e| e.agent_id())
    }

    pub fn is_online(&self, uuid: &str) -> bool {
        self.entry(uuid)
            .is_some_and(|e| e.state() == ConnState::Streaming)
    }

    pub fn online_count(&self) -> usize {
        self.agents
            .iter()
            .filter(|e| e.state() == ConnState::Streaming)
            .count()
    }
}

/// Orchestrator-side handle to one sub-session. Dropping it releases the
/// registry slot and asks the agent to terminate the remote process.
pub struct SessionHandle {
    pub session_id: String,
    agent_uuid: String,
    kind: StreamKind,
    events: mpsc::Receiver<SessionEvent>,
    registry: Arc<AgentRegistry>,
    closed: bool,
}

impl SessionHandle {
    /// Wait for the agent's `Init{ready}` within the dial timeout.
    pub async fn wait_ready(&mut self, timeout: Duration) -> Result<(), AgentError> {
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                event = self.events.recv() => match event {
                    Some(SessionEvent::Ready) => return Ok(()),
                    Some(SessionEvent::Data { .. }) => continue,
                    Some(SessionEvent::Closed { .. } | SessionEvent::Error { .. }) | None => {
                        return Err(AgentError::StreamClosed);
                    }
                },
                () = &mut deadline => {
                    self.close("dial_timeout");
                    return Err(AgentError::DialTimeout);
                }
            }
        }
    }

    pub async fn recv(&mut self) -> Option<SessionEvent> {
        self.events.recv().await
    }

    pub fn send_input(&self, data: &[u8]) -> Result<(), AgentError> {
        self.registry.send_to_agent(
            &self.agent_uuid,
            self.kind,
            stream_message::Msg::Data(StreamData {
                session_id: self.session_id.clone(),
                data: data.to_vec(),
                data_type: DataType::Stdin as i32,
            }),
        )
    }

    pub fn resize(&self, width: u32, height: u32) -> Result<(), AgentError> {
        self.registry.send_to_agent(
            &self.agent_uuid,
            self.kind,
            stream_message::Msg::Resize(StreamResize {
                session_id: self.session_id.clone(),
                width,
                height,
            }),
        )
    }

    /// Close the sub-session: notify the agent, then release the slot.
    pub fn close(&mut self, reason: &str) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.registry.send_to_agent(
            &self.agent_uuid,
            self.kind,
            stream_message::Msg::Close(StreamClose {
                session_id: self.session_id.clone(),
                reason: reason.to_owned(),
            }),
        );
        self.registry.remove_session(&self.session_id);
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.close("handle_dropped");
    }
}
