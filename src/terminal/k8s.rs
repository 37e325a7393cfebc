use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, AttachParams, AttachedProcess, TerminalSize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use futures_util::SinkExt;
use tokio::sync::mpsc;

use super::TermEvent;

/// One attached kubectl-exec style session. The kube SDK surface stays
/// opaque: this wrapper only exposes the stdin/stdout/resize shape the
/// orchestrator needs.
pub struct K8sTerminal {
    stdin: Box<dyn tokio::io::AsyncWrite + Send + Unpin>,
    size_tx: Option<futures_channel::mpsc::Sender<TerminalSize>>,
    events: mpsc::Receiver<TermEvent>,
    attached: Option<AttachedProcess>,
}

/// Attach an interactive shell to a pod.
#[tracing::instrument(skip(client), err)]
pub async fn attach_pod(
    client: kube::Client,
    namespace: &str,
    pod: &str,
    container: Option<&str>,
    shell: &str,
) -> anyhow::Result<K8sTerminal> {
    let pods: Api<Pod> = Api::namespaced(client, namespace);

    let mut params = AttachParams::interactive_tty();
    if let Some(c) = container {
        params = params.container(c);
    }

    let mut attached = pods.exec(pod, vec![shell], &params).await?;

    let stdin = attached
        .stdin()
        .ok_or_else(|| anyhow::anyhow!("exec attach has no stdin"))?;
    let mut stdout = attached
        .stdout()
        .ok_or_else(|| anyhow::anyhow!("exec attach has no stdout"))?;
    let size_tx = attached.terminal_size();

    let (events_tx, events) = mpsc::channel(256);
    tokio::spawn(async move {
        let mut buf = [0u8; 4096];
        loop {
            match stdout.read(&mut buf).await {
                Ok(0) => {
                    let _ = events_tx.send(TermEvent::Closed("process exited".into())).await;
                    break;
                }
                Ok(n) => {
                    if events_tx
                        .send(TermEvent::Output(buf[..n].to_vec()))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Err(e) => {
                    let _ = events_tx.send(TermEvent::Errored(e.to_string())).await;
                    break;
                }
            }
        }
    });

    Ok(K8sTerminal {
        stdin: Box::new(stdin),
        size_tx,
        events,
        attached: Some(attached),
    })
}

impl K8sTerminal {
    pub async fn send_input(&mut self, data: &[u8]) -> anyhow::Result<()> {
        self.stdin.write_all(data).await?;
        self.stdin.flush().await?;
        Ok(())
    }

    pub async fn resize(&mut self, cols: u32, rows: u32) -> anyhow::Result<()> {
        if let Some(tx) = &mut self.size_tx {
            let size = TerminalSize {
                width: u16::try_from(cols).unwrap_or(u16::MAX),
                height: u16::try_from(rows).unwrap_or(u16::MAX),
            };
            tx.send(size).await.map_err(|_| anyhow::anyhow!("resize channel closed"))?;
        }
        Ok(())
    }

    pub async fn recv(&mut self) -> Option<TermEvent> {
        self.events.recv().await
    }

    pub async fn close(&mut self) {
        let _ = self.stdin.shutdown().await;
        if let Some(attached) = self.attached.take() {
            // Reap the remote exec; errors here only mean it already died.
            let _ = attached.join().await;
        }
    }
}
