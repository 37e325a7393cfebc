pub mod k8s;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use serde::{Deserialize, Serialize};

use crate::agent::proto::StreamOperation;
use crate::agent::registry::{SessionEvent, SessionHandle};
use crate::auth::middleware::AuthUser;
use crate::recording::sink::{AsciinemaRecorder, SinkLimits};
use crate::recording::{cast_path, store as recording_store};
use crate::store::AppState;

pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_UNAUTHENTICATED: u16 = 4401;
pub const CLOSE_FORBIDDEN: u16 = 4403;
pub const CLOSE_IDLE_TIMEOUT: u16 = 4408;
pub const CLOSE_BACKEND_GATEWAY: u16 = 4504;

/// Where a terminal session terminates.
#[derive(Debug, Clone)]
pub enum TerminalOrigin {
    Docker {
        agent_uuid: String,
        container_id: String,
    },
    WebSsh {
        agent_uuid: String,
    },
    K8sPod {
        namespace: String,
        pod: String,
        container: Option<String>,
    },
}

impl TerminalOrigin {
    pub fn recording_type(&self) -> &'static str {
        match self {
            Self::Docker { .. } => "docker",
            Self::WebSsh { .. } => "webssh",
            Self::K8sPod { .. } => "k8s_pod",
        }
    }

    fn type_metadata(&self) -> serde_json::Value {
        match self {
            Self::Docker {
                agent_uuid,
                container_id,
            } => serde_json::json!({ "agent_uuid": agent_uuid, "container_id": container_id }),
            Self::WebSsh { agent_uuid } => serde_json::json!({ "agent_uuid": agent_uuid }),
            Self::K8sPod {
                namespace,
                pod,
                container,
            } => serde_json::json!({ "namespace": namespace, "pod": pod, "container": container }),
        }
    }
}

/// Client → server frames on the terminal WebSocket.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientFrame {
    Input { data: String },
    Resize { rows: u32, cols: u32 },
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerFrame<'a> {
    Output { data: &'a str },
    Error { code: u16, message: &'a str },
}

/// Event shape shared by every backend.
#[derive(Debug)]
pub enum TermEvent {
    Output(Vec<u8>),
    Closed(String),
    Errored(String),
}

/// Backend handle: an agent sub-session or a kube exec attach.
enum Backend {
    Agent(SessionHandle),
    K8s(k8s::K8sTerminal),
}

impl Backend {
    async fn send_input(&mut self, data: &[u8]) -> anyhow::Result<()> {
        match self {
            Self::Agent(h) => h.send_input(data).map_err(Into::into),
            Self::K8s(t) => t.send_input(data).await,
        }
    }

    async fn resize(&mut self, cols: u32, rows: u32) -> anyhow::Result<()> {
        match self {
            Self::Agent(h) => h.resize(cols, rows).map_err(Into::into),
            Self::K8s(t) => t.resize(cols, rows).await,
        }
    }

    async fn recv(&mut self) -> Option<TermEvent> {
        match self {
            Self::Agent(h) => loop {
                match h.recv().await? {
                    SessionEvent::Ready => continue,
                    SessionEvent::Data { data, .. } => return Some(TermEvent::Output(data)),
                    SessionEvent::Closed { reason } => return Some(TermEvent::Closed(reason)),
                    SessionEvent::Error { message } => return Some(TermEvent::Errored(message)),
                }
            },
            Self::K8s(t) => t.recv().await,
        }
    }

    async fn close(&mut self, reason: &str) {
        match self {
            Self::Agent(h) => h.close(reason),
            Self::K8s(t) => t.close().await,
        }
    }
}

/// Bind an authenticated operator WebSocket to a backend terminal, recording
/// every frame unless the recording was explicitly suppressed.
#[tracing::instrument(skip(state, socket, user), fields(user = %user.username))]
pub async fn run_session(
    state: AppState,
    mut socket: WebSocket,
    user: AuthUser,
    origin: TerminalOrigin,
    rows: u32,
    cols: u32,
    record: bool,
) {
    let rows = rows.clamp(10, 200);
    let cols = cols.clamp(40, 300);
    let shell = "/bin/sh";

    let mut backend = match open_backend(&state, &origin, rows, cols, shell).await {
        Ok(b) => b,
        Err(e) => {
            tracing::warn!(error = %e, "terminal backend unavailable");
            close_with(&mut socket, CLOSE_BACKEND_GATEWAY, "backend unavailable").await;
            return;
        }
    };

    let recorder = if record {
        match start_recording(&state, &user, &origin, rows, cols, shell).await {
            Ok(pair) => Some(pair),
            Err(e) => {
                tracing::error!(error = %e, "recording setup failed");
                backend.close("recording_failed").await;
                close_with(&mut socket, CLOSE_BACKEND_GATEWAY, "recording unavailable").await;
                return;
            }
        }
    } else {
        None
    };

    state.metrics.recordings_active.inc();
    let close = pump(&state, &mut socket, &mut backend, recorder.as_ref()).await;
    state.metrics.recordings_active.dec();

    backend.close("session_closed").await;
    if let Some((recording_id, recorder)) = recorder {
        finish_recording(&state, &recording_id, &recorder).await;
    }
    close_with(&mut socket, close.0, &close.1).await;
}

async fn open_backend(
    state: &AppState,
    origin: &TerminalOrigin,
    rows: u32,
    cols: u32,
    shell: &str,
) -> anyhow::Result<Backend> {
    let dial = Duration::from_secs(state.config.agent.dial_timeout_secs);
    match origin {
        TerminalOrigin::WebSsh { agent_uuid } => {
            let mut params = HashMap::new();
            params.insert("shell".into(), shell.to_owned());
            params.insert("rows".into(), rows.to_string());
            params.insert("cols".into(), cols.to_string());
            let mut handle = state
                .registry
                .open_session(agent_uuid, StreamOperation::Terminal, None, None, params)
                .await?;
            handle.wait_ready(dial).await?;
            Ok(Backend::Agent(handle))
        }
        TerminalOrigin::Docker {
            agent_uuid,
            container_id,
        } => {
            let mut params = HashMap::new();
            params.insert("rows".into(), rows.to_string());
            params.insert("cols".into(), cols.to_string());
            let mut handle = state
                .registry
                .open_session(
                    agent_uuid,
                    StreamOperation::ExecContainer,
                    Some(container_id),
                    None,
                    params,
                )
                .await?;
            handle.wait_ready(dial).await?;
            Ok(Backend::Agent(handle))
        }
        TerminalOrigin::K8sPod {
            namespace,
            pod,
            container,
        } => {
            let client = state
                .kube
                .clone()
                .ok_or_else(|| anyhow::anyhow!("kubernetes is not configured"))?;
            let term =
                k8s::attach_pod(client, namespace, pod, container.as_deref(), shell).await?;
            Ok(Backend::K8s(term))
        }
    }
}

async fn start_recording(
    state: &AppState,
    user: &AuthUser,
    origin: &TerminalOrigin,
    rows: u32,
    cols: u32,
    shell: &str,
) -> anyhow::Result<(String, AsciinemaRecorder)> {
    let session_id = uuid::Uuid::new_v4().to_string();
    // Reserve the row first so the path lands in the DB before any bytes hit
    // storage; the id doubles as the cast file stem.
    let recording_id = recording_store::create(
        &state.db,
        &recording_store::NewRecording {
            session_id: &session_id,
            user_id: &user.user_id,
            username: &user.username,
            recording_type: origin.recording_type(),
            type_metadata: origin.type_metadata(),
            storage_type: &state.config.recording.storage_type,
            storage_path: "",
            rows: i64::from(rows),
            cols: i64::from(cols),
            shell,
            client_ip: user.ip_addr.as_deref(),
            tags: &[],
        },
    )
    .await?;

    let rel_path = cast_path(&recording_id);
    sqlx::query(&state.db.sql("UPDATE terminal_recordings SET storage_path = $1 WHERE id = $2"))
        .bind(&rel_path)
        .bind(&recording_id)
        .execute(&state.db.pool)
        .await?;

    let limits = SinkLimits {
        max_bytes: state.config.recording.max_recording_size_bytes,
        max_duration: Duration::from_secs(state.config.recording.max_duration_secs),
        ..SinkLimits::default()
    };
    let recorder = AsciinemaRecorder::new(
        rel_path,
        Arc::clone(&state.storage),
        Arc::clone(&state.metrics),
        limits,
        cols,
        rows,
        shell,
    );
    Ok((recording_id, recorder))
}

async fn finish_recording(state: &AppState, recording_id: &str, recorder: &AsciinemaRecorder) {
    match recorder.finalize().await {
        Ok(summary) => {
            if let Err(e) = recording_store::finish(
                &state.db,
                recording_id,
                summary.duration_seconds,
                summary.file_size_bytes,
            )
            .await
            {
                tracing::error!(error = %e, recording_id, "recording row not finalized");
            }
        }
        Err(e) => {
            tracing::error!(error = %e, recording_id, "recording finalize failed");
        }
    }
}

/// Main bridge loop. Returns the WebSocket close code and reason.
async fn pump(
    state: &AppState,
    socket: &mut WebSocket,
    backend: &mut Backend,
    recorder: Option<&(String, AsciinemaRecorder)>,
) -> (u16, String) {
    let idle_timeout = Duration::from_secs(state.config.recording.idle_timeout_secs.max(1));
    let mut last_activity = Instant::now();

    loop {
        let idle_deadline = tokio::time::sleep_until((last_activity + idle_timeout).into());
        tokio::pin!(idle_deadline);

        tokio::select! {
            msg = socket.recv() => match msg {
                Some(Ok(Message::Text(text))) => {
                    last_activity = Instant::now();
                    match serde_json::from_str::<ClientFrame>(&text) {
                        Ok(ClientFrame::Input { data }) => {
                            if let Some((_, rec)) = recorder {
                                let _ = rec.record_input(data.as_bytes()).await;
                            }
                            if backend.send_input(data.as_bytes()).await.is_err() {
                                return (CLOSE_BACKEND_GATEWAY, "backend write failed".into());
                            }
                        }
                        // Resize never touches the recorder, so a storm of
                        // resizes cannot stall frame capture.
                        Ok(ClientFrame::Resize { rows, cols }) => {
                            let _ = backend.resize(cols.clamp(40, 300), rows.clamp(10, 200)).await;
                        }
                        Err(_) => {
                            tracing::debug!("ignoring malformed client frame");
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    return (CLOSE_NORMAL, "client closed".into());
                }
                Some(Ok(_)) => {} // ping/pong/binary
                Some(Err(_)) => {
                    return (CLOSE_NORMAL, "client gone".into());
                }
            },
            event = backend.recv() => match event {
                Some(TermEvent::Output(data)) => {
                    last_activity = Instant::now();
                    if let Some((_, rec)) = recorder {
                        let _ = rec.record_output(&data).await;
                    }
                    let text = String::from_utf8_lossy(&data);
                    let frame = ServerFrame::Output { data: &text };
                    let payload = serde_json::to_string(&frame).unwrap_or_default();
                    if socket.send(Message::Text(payload.into())).await.is_err() {
                        return (CLOSE_NORMAL, "client gone".into());
                    }
                }
                Some(TermEvent::Closed(reason)) => {
                    return (CLOSE_NORMAL, reason);
                }
                Some(TermEvent::Errored(message)) => {
                    send_error(socket, CLOSE_BACKEND_GATEWAY, &message).await;
                    return (CLOSE_BACKEND_GATEWAY, message);
                }
                None => {
                    return (CLOSE_BACKEND_GATEWAY, "backend stream ended".into());
                }
            },
            () = &mut idle_deadline => {
                send_error(socket, CLOSE_IDLE_TIMEOUT, "idle timeout").await;
                return (CLOSE_IDLE_TIMEOUT, "idle timeout".into());
            }
        }
    }
}

async fn send_error(socket: &mut WebSocket, code: u16, message: &str) {
    let frame = ServerFrame::Error { code, message };
    if let Ok(payload) = serde_json::to_string(&frame) {
        let _ = socket.send(Message::Text(payload.into())).await;
    }
}

pub async fn close_with(socket: &mut WebSocket, code: u16, reason: &str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.to_owned().into(),
        })))
        .await;
}

/// Re-exported for API handlers that must emit a terminal-style error before
/// the session even opens (auth failures on the upgrade path).
pub async fn reject(mut socket: WebSocket, code: u16, message: &str) {
    send_error(&mut socket, code, message).await;
    close_with(&mut socket, code, message).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_frames_parse() {
        let input: ClientFrame = serde_json::from_str(r#"{"type":"input","data":"ls\n"}"#).unwrap();
        assert!(matches!(input, ClientFrame::Input { data } if data == "ls\n"));

        let resize: ClientFrame =
            serde_json::from_str(r#"{"type":"resize","rows":50,"cols":120}"#).unwrap();
        assert!(matches!(resize, ClientFrame::Resize { rows: 50, cols: 120 }));
    }

    #[test]
    fn server_output_frame_shape() {
        let frame = ServerFrame::Output { data: "hi\n" };
        let json = serde_json::to_string(&frame).unwrap();
        assert_eq!(json, r#"{"type":"output","data":"hi\n"}"#);
    }

    #[test]
    fn origin_metadata_by_type() {
        let origin = TerminalOrigin::Docker {
            agent_uuid: "u1".into(),
            container_id: "c1".into(),
        };
        assert_eq!(origin.recording_type(), "docker");
        assert_eq!(origin.type_metadata()["container_id"], "c1");

        let origin = TerminalOrigin::K8sPod {
            namespace: "default".into(),
            pod: "web-0".into(),
            container: None,
        };
        assert_eq!(origin.recording_type(), "k8s_pod");
        assert_eq!(origin.type_metadata()["pod"], "web-0");
    }
}
