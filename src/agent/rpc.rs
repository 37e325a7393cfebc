use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use futures_util::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status, Streaming};

use super::proto::host_monitor_server::{HostMonitor, HostMonitorServer};
use super::proto::{
    DataType, RegisterAgentRequest, RegisterAgentResponse, ReportStateRequest,
    ReportStateResponse, StreamClose, StreamMessage, stream_message,
};
use super::registry::{AgentRegistry, SessionEvent, StreamKind};
use super::store;
use crate::auth::token::hash_token;
use crate::metrics::Metrics;
use crate::store::pool::Db;

pub struct HostMonitorService {
    db: Db,
    registry: Arc<AgentRegistry>,
    metrics: Arc<Metrics>,
    report_interval_seconds: u32,
}

impl HostMonitorService {
    pub fn new(
        db: Db,
        registry: Arc<AgentRegistry>,
        metrics: Arc<Metrics>,
        report_interval_seconds: u32,
    ) -> Self {
        Self {
            db,
            registry,
            metrics,
            report_interval_seconds: report_interval_seconds.clamp(5, 300),
        }
    }

    pub fn into_server(self) -> HostMonitorServer<Self> {
        HostMonitorServer::new(self)
    }
}

type ResponseStream<T> = Pin<Box<dyn Stream<Item = Result<T, Status>> + Send + 'static>>;

#[tonic::async_trait]
impl HostMonitor for HostMonitorService {
    async fn register_agent(
        &self,
        req: Request<RegisterAgentRequest>,
    ) -> Result<Response<RegisterAgentResponse>, Status> {
        let req = req.into_inner();
        if req.uuid.is_empty() || req.secret_key.is_empty() {
            return Err(Status::invalid_argument("uuid and secret_key are required"));
        }
        let info = req
            .host_info
            .ok_or_else(|| Status::invalid_argument("host_info is required"))?;

        let presented = hash_token(&req.secret_key);
        match store::find_secret_hash(&self.db, &req.uuid).await {
            Ok(Some(stored)) if stored != presented => {
                tracing::warn!(uuid = %req.uuid, "agent authentication failed");
                return Err(Status::unauthenticated("invalid secret key"));
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!(error = %e, "agent lookup failed");
                return Err(Status::internal("agent lookup failed"));
            }
        }

        let agent_id = store::upsert_registration(&self.db, &req.uuid, &presented, &info)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "agent registration failed");
                Status::internal("registration failed")
            })?;

        self.registry.mark_registered(&req.uuid, &agent_id);
        tracing::info!(uuid = %req.uuid, platform = %info.platform, "agent registered");

        Ok(Response::new(RegisterAgentResponse {
            success: true,
            message: "registered".into(),
            report_interval_seconds: self.report_interval_seconds,
        }))
    }

    type ReportStateStream = ResponseStream<ReportStateResponse>;

    /// Heartbeat stream: every request updates the inventory row and the
    /// state time series; every response carries the agent's drained task
    /// queue, strict per-agent FIFO.
    async fn report_state(
        &self,
        req: Request<Streaming<ReportStateRequest>>,
    ) -> Result<Response<Self::ReportStateStream>, Status> {
        let mut inbound = req.into_inner();
        let (tx, rx) = mpsc::channel(self.registry.config().max_outbound.max(1));

        let db = self.db.clone();
        let registry = Arc::clone(&self.registry);
        let metrics = Arc::clone(&self.metrics);

        tokio::spawn(async move {
            let mut conn: Option<(String, String, u64)> = None;

            loop {
                let cancelled = async {
                    match &conn {
                        Some((uuid, _, _)) => match registry_entry_token(&registry, uuid) {
                            Some(token) => token.cancelled().await,
                            None => std::future::pending().await,
                        },
                        None => std::future::pending().await,
                    }
                };

                let msg = tokio::select! {
                    m = inbound.message() => m,
                    () = cancelled => {
                        let _ = tx
                            .send(Err(Status::resource_exhausted("connection dropped by server")))
                            .await;
                        break;
                    }
                };

                match msg {
                    Ok(Some(report)) => {
                        if conn.is_none() {
                            // The stream authenticates by uuid: the agent must
                            // have registered before reporting.
                            let agent = match store::find_by_uuid(&db, &report.uuid).await {
                                Ok(Some(agent)) => agent,
                                Ok(None) => {
                                    let _ = tx
                                        .send(Err(Status::unauthenticated("unknown agent uuid")))
                                        .await;
                                    break;
                                }
                                Err(e) => {
                                    tracing::error!(error = %e, "agent lookup failed");
                                    let _ = tx.send(Err(Status::internal("lookup failed"))).await;
                                    break;
                                }
                            };
                            let (_, epoch) = registry.connected(&report.uuid, &agent.id);
                            conn = Some((report.uuid.clone(), agent.id, epoch));
                        }

                        let Some((uuid, agent_id, _)) = &conn else { break };

                        for result in &report.results {
                            let err = (!result.error.is_empty()).then_some(result.error.as_str());
                            if let Err(e) =
                                store::mark_result(&db, &result.task_id, result.success, err).await
                            {
                                tracing::warn!(error = %e, task_id = %result.task_id, "task result not recorded");
                            }
                        }

                        if let Err(e) = store::record_heartbeat(&db, uuid).await {
                            tracing::warn!(error = %e, "heartbeat not recorded");
                        }
                        if let Some(state) = &report.state {
                            if let Err(e) = store::insert_state(&db, agent_id, state).await {
                                tracing::warn!(error = %e, "state sample not recorded");
                            }
                        }

                        let (tasks, expired) = registry.drain_tasks(uuid);
                        if !expired.is_empty() {
                            metrics.tasks_expired_total.inc_by(expired.len() as u64);
                            let _ = store::mark_expired(&db, &expired).await;
                        }
                        if !tasks.is_empty() {
                            metrics.tasks_dispatched_total.inc_by(tasks.len() as u64);
                            let ids: Vec<String> =
                                tasks.iter().map(|t| t.task_id.clone()).collect();
                            let _ = store::mark_dispatched(&db, &ids).await;
                        }

                        let response = ReportStateResponse {
                            success: true,
                            message: String::new(),
                            tasks,
                        };
                        // Backpressure: a slow agent that cannot keep up with
                        // its own heartbeat responses is dropped.
                        match tx.try_send(Ok(response)) {
                            Ok(()) => {}
                            Err(mpsc::error::TrySendError::Full(_)) => {
                                tracing::warn!(%uuid, "report-state outbound full; dropping agent");
                                break;
                            }
                            Err(mpsc::error::TrySendError::Closed(_)) => break,
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        if let Some((uuid, _, _)) = &conn {
                            tracing::warn!(%uuid, error = %e, "report stream error");
                        }
                        break;
                    }
                }
            }

            if let Some((uuid, _, epoch)) = conn {
                registry.disconnected(&uuid, epoch).await;
            }
        });

        Ok(Response::new(
            Box::pin(ReceiverStream::new(rx)) as Self::ReportStateStream
        ))
    }

    type DockerStreamStream = ResponseStream<StreamMessage>;

    async fn docker_stream(
        &self,
        req: Request<Streaming<StreamMessage>>,
    ) -> Result<Response<Self::DockerStreamStream>, Status> {
        Ok(Response::new(self.mux_stream(req.into_inner(), StreamKind::Docker)))
    }

    type TerminalStreamStream = ResponseStream<StreamMessage>;

    async fn terminal_stream(
        &self,
        req: Request<Streaming<StreamMessage>>,
    ) -> Result<Response<Self::TerminalStreamStream>, Status> {
        Ok(Response::new(self.mux_stream(req.into_inner(), StreamKind::Terminal)))
    }
}

impl HostMonitorService {
    /// Shared pump for the two multiplexed streams. Frames are routed by
    /// `session_id`; the first `Init` names the agent and registers the
    /// outbound half with the registry.
    fn mux_stream(
        &self,
        mut inbound: Streaming<StreamMessage>,
        kind: StreamKind,
    ) -> ResponseStream<StreamMessage> {
        let (tx, rx) = mpsc::channel(self.registry.config().max_outbound.max(1));
        let registry = Arc::clone(&self.registry);

        tokio::spawn(async move {
            let mut agent_uuid: Option<String> = None;

            loop {
                let cancelled = async {
                    match &agent_uuid {
                        Some(uuid) => match registry_entry_token(&registry, uuid) {
                            Some(token) => token.cancelled().await,
                            None => std::future::pending().await,
                        },
                        None => std::future::pending().await,
                    }
                };

                let msg = tokio::select! {
                    m = inbound.message() => m,
                    () = cancelled => {
                        let _ = tx
                            .send(Err(Status::resource_exhausted("connection dropped by server")))
                            .await;
                        break;
                    }
                };

                match msg {
                    Ok(Some(frame)) => match frame.msg {
                        Some(stream_message::Msg::Init(init)) => {
                            if agent_uuid.is_none() && !init.agent_uuid.is_empty() {
                                registry.attach_stream(&init.agent_uuid, kind, tx.clone());
                                agent_uuid = Some(init.agent_uuid.clone());
                            }
                            if registry.session_exists(&init.session_id) {
                                if init.ready {
                                    registry.deliver(&init.session_id, SessionEvent::Ready).await;
                                }
                            } else {
                                // Unknown session: tell the agent to reap it.
                                let _ = tx
                                    .send(Ok(StreamMessage {
                                        msg: Some(stream_message::Msg::Close(StreamClose {
                                            session_id: init.session_id.clone(),
                                            reason: "unknown_session".into(),
                                        })),
                                    }))
                                    .await;
                            }
                        }
                        Some(stream_message::Msg::Data(data)) => {
                            let data_type = DataType::try_from(data.data_type)
                                .unwrap_or(DataType::Unspecified);
                            registry
                                .deliver(
                                    &data.session_id,
                                    SessionEvent::Data {
                                        data: data.data,
                                        data_type,
                                    },
                                )
                                .await;
                        }
                        Some(stream_message::Msg::Close(close)) => {
                            registry
                                .deliver(
                                    &close.session_id,
                                    SessionEvent::Closed {
                                        reason: close.reason,
                                    },
                                )
                                .await;
                        }
                        Some(stream_message::Msg::Error(err)) => {
                            registry
                                .deliver(
                                    &err.session_id,
                                    SessionEvent::Error { message: err.error },
                                )
                                .await;
                        }
                        // Resize only travels server → agent.
                        Some(stream_message::Msg::Resize(_)) | None => {}
                    },
                    Ok(None) => break,
                    Err(e) => {
                        if let Some(uuid) = &agent_uuid {
                            tracing::warn!(%uuid, error = %e, ?kind, "mux stream error");
                        }
                        break;
                    }
                }
            }

            if let Some(uuid) = agent_uuid {
                registry.stream_closed(&uuid, kind).await;
            }
        });

        Box::pin(ReceiverStream::new(rx))
    }
}

fn registry_entry_token(registry: &AgentRegistry, uuid: &str) -> Option<CancellationToken> {
    registry.entry_token(uuid)
}

/// Run the gRPC server until the token is cancelled.
pub async fn serve(
    service: HostMonitorService,
    addr: SocketAddr,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    tracing::info!(%addr, "starting gRPC server");
    tonic::transport::Server::builder()
        .http2_keepalive_interval(Some(std::time::Duration::from_secs(30)))
        .http2_keepalive_timeout(Some(std::time::Duration::from_secs(20)))
        .tcp_keepalive(Some(std::time::Duration::from_secs(30)))
        .add_service(service.into_server())
        .serve_with_shutdown(addr, shutdown.cancelled())
        .await?;
    Ok(())
}

/// Variant taking a pre-bound listener; used when the caller needs the
/// ephemeral port (integration tests).
pub async fn serve_with_listener(
    service: HostMonitorService,
    listener: tokio::net::TcpListener,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    tonic::transport::Server::builder()
        .add_service(service.into_server())
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown.cancelled())
        .await?;
    Ok(())
}
