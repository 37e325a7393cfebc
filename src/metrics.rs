use prometheus::{IntCounter, IntGauge, Opts, Registry, TextEncoder};

/// Process-wide counters and gauges. One instance is created at startup and
/// shared by reference; subsystems never register their own collectors.
pub struct Metrics {
    pub registry: Registry,

    pub agents_online: IntGauge,
    pub tasks_dispatched_total: IntCounter,
    pub tasks_expired_total: IntCounter,

    pub audit_written_total: IntCounter,
    pub audit_overflow_total: IntCounter,

    pub recordings_active: IntGauge,
    pub recording_bytes_total: IntCounter,

    pub cleanup_invalid_total: IntCounter,
    pub cleanup_expired_total: IntCounter,
    pub cleanup_orphan_total: IntCounter,
    pub cleanup_missing_total: IntCounter,
    pub cleanup_bytes_freed_total: IntCounter,

    pub queries_executed_total: IntCounter,
    pub queries_rejected_total: IntCounter,
}

fn counter(registry: &Registry, name: &str, help: &str) -> anyhow::Result<IntCounter> {
    let c = IntCounter::with_opts(Opts::new(name, help))?;
    registry.register(Box::new(c.clone()))?;
    Ok(c)
}

fn gauge(registry: &Registry, name: &str, help: &str) -> anyhow::Result<IntGauge> {
    let g = IntGauge::with_opts(Opts::new(name, help))?;
    registry.register(Box::new(g.clone()))?;
    Ok(g)
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();
        Ok(Self {
            agents_online: gauge(&registry, "agents_online", "Connected agents")?,
            tasks_dispatched_total: counter(
                &registry,
                "tasks_dispatched_total",
                "Tasks handed to agents over ReportState",
            )?,
            tasks_expired_total: counter(
                &registry,
                "tasks_expired_total",
                "Queued tasks dropped after exceeding their TTL",
            )?,
            audit_written_total: counter(
                &registry,
                "audit_written_total",
                "Audit events persisted",
            )?,
            audit_overflow_total: counter(
                &registry,
                "audit_overflow_total",
                "Audit events dropped because the channel was full",
            )?,
            recordings_active: gauge(&registry, "recordings_active", "Open recording sessions")?,
            recording_bytes_total: counter(
                &registry,
                "recording_bytes_total",
                "Bytes written to recording storage",
            )?,
            cleanup_invalid_total: counter(
                &registry,
                "cleanup_invalid_total",
                "Invalid recordings removed by the sweeper",
            )?,
            cleanup_expired_total: counter(
                &registry,
                "cleanup_expired_total",
                "Expired recordings removed by the sweeper",
            )?,
            cleanup_orphan_total: counter(
                &registry,
                "cleanup_orphan_total",
                "Orphan cast files removed by the sweeper",
            )?,
            cleanup_missing_total: counter(
                &registry,
                "cleanup_missing_total",
                "Recording rows removed because their file is gone",
            )?,
            cleanup_bytes_freed_total: counter(
                &registry,
                "cleanup_bytes_freed_total",
                "Bytes freed by the sweeper",
            )?,
            queries_executed_total: counter(
                &registry,
                "queries_executed_total",
                "Interactive queries executed",
            )?,
            queries_rejected_total: counter(
                &registry,
                "queries_rejected_total",
                "Interactive queries rejected by the safety filter",
            )?,
            registry,
        })
    }

    /// Render the registry in the Prometheus text format.
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        encoder
            .encode_to_string(&self.registry.gather())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_register_and_render() {
        let m = Metrics::new().unwrap();
        m.audit_overflow_total.inc();
        m.agents_online.set(3);
        let out = m.render();
        assert!(out.contains("audit_overflow_total 1"));
        assert!(out.contains("agents_online 3"));
    }
}
