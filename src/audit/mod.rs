pub mod store;
pub mod writer;

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use uuid::Uuid;

use crate::metrics::Metrics;
use crate::store::now_ms;

/// Origin of an audit event, closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subsystem {
    Database,
    K8s,
    Host,
    Docker,
    Auth,
}

impl Subsystem {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Database => "database",
            Self::K8s => "k8s",
            Self::Host => "host",
            Self::Docker => "docker",
            Self::Auth => "auth",
        }
    }
}

impl FromStr for Subsystem {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "database" => Ok(Self::Database),
            "k8s" => Ok(Self::K8s),
            "host" => Ok(Self::Host),
            "docker" => Ok(Self::Docker),
            "auth" => Ok(Self::Auth),
            other => Err(anyhow::anyhow!("unknown audit subsystem: {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub subsystem: Subsystem,
    pub operator: String,
    pub action: String,
    pub resource_type: String,
    pub resource_name: String,
    pub success: bool,
    pub error: Option<String>,
    pub client_ip: Option<String>,
    pub instance_id: Option<String>,
    pub cluster_id: Option<String>,
    pub details: serde_json::Value,
}

impl AuditEntry {
    pub fn new(subsystem: Subsystem, operator: &str, action: &str) -> Self {
        Self {
            subsystem,
            operator: operator.to_owned(),
            action: action.to_owned(),
            resource_type: String::new(),
            resource_name: String::new(),
            success: true,
            error: None,
            client_ip: None,
            instance_id: None,
            cluster_id: None,
            details: serde_json::Value::Null,
        }
    }

    pub fn resource(mut self, resource_type: &str, resource_name: &str) -> Self {
        self.resource_type = resource_type.to_owned();
        self.resource_name = resource_name.to_owned();
        self
    }

    pub fn failed(mut self, error: &str) -> Self {
        self.success = false;
        self.error = Some(error.to_owned());
        self
    }

    pub fn client_ip(mut self, ip: Option<&str>) -> Self {
        self.client_ip = ip.map(ToOwned::to_owned);
        self
    }

    pub fn instance(mut self, instance_id: &str) -> Self {
        self.instance_id = Some(instance_id.to_owned());
        self
    }

    pub fn details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

/// An entry stamped with id + timestamp at enqueue time; what travels through
/// the channel and lands in the store.
#[derive(Debug)]
pub struct AuditRecord {
    pub id: String,
    pub ts: i64,
    pub entry: AuditEntry,
}

#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    /// The bounded channel stayed full past the offer timeout; the entry was
    /// dropped. Callers log this but never fail their own operation over it.
    #[error("audit channel overflow, entry dropped")]
    BufferOverflow,

    #[error("audit pipeline is shut down")]
    Closed,
}

/// Non-blocking producer handle. Cloned freely; the workers own the receiver.
#[derive(Clone)]
pub struct AuditLogger {
    tx: mpsc::Sender<AuditRecord>,
    offer_timeout: Duration,
    metrics: Arc<Metrics>,
}

impl AuditLogger {
    pub(crate) fn new(
        tx: mpsc::Sender<AuditRecord>,
        offer_timeout: Duration,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            tx,
            offer_timeout,
            metrics,
        }
    }

    /// Offer an entry to the pipeline, waiting at most the configured offer
    /// timeout. Overflow drops the entry and reports `BufferOverflow`.
    pub async fn log(&self, entry: AuditEntry) -> Result<(), AuditError> {
        let record = AuditRecord {
            id: Uuid::new_v4().to_string(),
            ts: now_ms(),
            entry,
        };
        match self.tx.send_timeout(record, self.offer_timeout).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(record)) => {
                self.metrics.audit_overflow_total.inc();
                tracing::warn!(
                    action = %record.entry.action,
                    subsystem = record.entry.subsystem.as_str(),
                    "audit channel full, entry dropped"
                );
                Err(AuditError::BufferOverflow)
            }
            Err(SendTimeoutError::Closed(record)) => {
                tracing::warn!(action = %record.entry.action, "audit pipeline closed, entry dropped");
                Err(AuditError::Closed)
            }
        }
    }

    /// Fire-and-forget variant for write paths: the overflow error is
    /// swallowed here so callers cannot accidentally propagate it.
    pub async fn emit(&self, entry: AuditEntry) {
        let _ = self.log(entry).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subsystem_roundtrip() {
        for s in [
            Subsystem::Database,
            Subsystem::K8s,
            Subsystem::Host,
            Subsystem::Docker,
            Subsystem::Auth,
        ] {
            assert_eq!(s.as_str().parse::<Subsystem>().unwrap(), s);
        }
        assert!("network".parse::<Subsystem>().is_err());
    }

    #[test]
    fn entry_builder() {
        let e = AuditEntry::new(Subsystem::Database, "alice", "query")
            .resource("instance", "orders-db")
            .failed("DROP rejected")
            .client_ip(Some("10.0.0.9"))
            .instance("i-123");
        assert_eq!(e.operator, "alice");
        assert!(!e.success);
        assert_eq!(e.error.as_deref(), Some("DROP rejected"));
        assert_eq!(e.client_ip.as_deref(), Some("10.0.0.9"));
        assert_eq!(e.instance_id.as_deref(), Some("i-123"));
    }
}
