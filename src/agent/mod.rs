pub mod registry;
pub mod rpc;
pub mod store;

/// Generated gRPC types for the `HostMonitor` service.
pub mod proto {
    tonic::include_proto!("hostmonitor.v1");
}

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("agent unreachable: {0}")]
    Unreachable(String),

    #[error("agent task queue full")]
    QueueFull,

    #[error("stream closed")]
    StreamClosed,

    #[error("agent did not attach the sub-session in time")]
    DialTimeout,

    #[error("outbound queue full, agent dropped")]
    Backpressure,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}
