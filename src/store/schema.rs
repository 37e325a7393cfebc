use super::pool::Db;

/// Portable DDL: VARCHAR for keyed/indexed columns (MySQL cannot index bare
/// TEXT), BIGINT unix-milliseconds for timestamps, TEXT for JSON bodies,
/// SMALLINT 0/1 for booleans.
const TABLES: &[&str] = &[
    r"CREATE TABLE IF NOT EXISTS users (
        id VARCHAR(36) PRIMARY KEY,
        username VARCHAR(255) NOT NULL,
        password_hash VARCHAR(255) NOT NULL,
        role VARCHAR(32) NOT NULL,
        is_active SMALLINT NOT NULL DEFAULT 1,
        created_at BIGINT NOT NULL
    )",
    r"CREATE TABLE IF NOT EXISTS agents (
        id VARCHAR(36) PRIMARY KEY,
        uuid VARCHAR(36) NOT NULL,
        secret_hash VARCHAR(255) NOT NULL,
        platform VARCHAR(64) NOT NULL,
        arch VARCHAR(64) NOT NULL,
        cpu_model VARCHAR(255) NOT NULL,
        cpu_cores BIGINT NOT NULL,
        mem_total BIGINT NOT NULL,
        disk_total BIGINT NOT NULL,
        boot_time BIGINT NOT NULL,
        agent_version VARCHAR(64) NOT NULL,
        ssh_enabled SMALLINT NOT NULL DEFAULT 1,
        group_name VARCHAR(255) NOT NULL,
        disabled SMALLINT NOT NULL DEFAULT 0,
        last_seen_at BIGINT,
        created_at BIGINT NOT NULL
    )",
    r"CREATE TABLE IF NOT EXISTS agent_states (
        agent_id VARCHAR(36) NOT NULL,
        ts BIGINT NOT NULL,
        cpu_percent DOUBLE PRECISION NOT NULL,
        load1 DOUBLE PRECISION NOT NULL,
        load5 DOUBLE PRECISION NOT NULL,
        load15 DOUBLE PRECISION NOT NULL,
        mem_used BIGINT NOT NULL,
        disk_used BIGINT NOT NULL,
        net_in_bytes BIGINT NOT NULL,
        net_out_bytes BIGINT NOT NULL,
        traffic_sent_delta BIGINT NOT NULL,
        traffic_recv_delta BIGINT NOT NULL,
        tcp_conn_count BIGINT NOT NULL,
        udp_conn_count BIGINT NOT NULL,
        process_count BIGINT NOT NULL,
        uptime_seconds BIGINT NOT NULL
    )",
    r"CREATE TABLE IF NOT EXISTS scheduled_tasks (
        id VARCHAR(36) PRIMARY KEY,
        agent_id VARCHAR(36) NOT NULL,
        task_type VARCHAR(32) NOT NULL,
        params TEXT NOT NULL,
        payload TEXT NOT NULL,
        created_at BIGINT NOT NULL,
        dispatched_at BIGINT,
        result_at BIGINT,
        success SMALLINT,
        error TEXT
    )",
    r"CREATE TABLE IF NOT EXISTS terminal_recordings (
        id VARCHAR(36) PRIMARY KEY,
        session_id VARCHAR(64) NOT NULL,
        user_id VARCHAR(36) NOT NULL,
        username VARCHAR(255) NOT NULL,
        recording_type VARCHAR(32) NOT NULL,
        type_metadata TEXT NOT NULL,
        storage_type VARCHAR(16) NOT NULL,
        storage_path TEXT NOT NULL,
        format VARCHAR(32) NOT NULL,
        started_at BIGINT NOT NULL,
        ended_at BIGINT,
        duration_seconds BIGINT NOT NULL DEFAULT 0,
        file_size_bytes BIGINT NOT NULL DEFAULT 0,
        term_rows BIGINT NOT NULL,
        term_cols BIGINT NOT NULL,
        shell VARCHAR(255) NOT NULL,
        client_ip VARCHAR(64),
        tags TEXT NOT NULL
    )",
    r"CREATE TABLE IF NOT EXISTS audit_events (
        id VARCHAR(36) PRIMARY KEY,
        ts BIGINT NOT NULL,
        subsystem VARCHAR(32) NOT NULL,
        operator VARCHAR(255) NOT NULL,
        action VARCHAR(255) NOT NULL,
        resource_type VARCHAR(255) NOT NULL,
        resource_name VARCHAR(255) NOT NULL,
        cluster_id VARCHAR(36),
        instance_id VARCHAR(36),
        success SMALLINT NOT NULL,
        error_message TEXT,
        client_ip VARCHAR(64),
        details TEXT NOT NULL
    )",
    r"CREATE TABLE IF NOT EXISTS database_instances (
        id VARCHAR(36) PRIMARY KEY,
        name VARCHAR(255) NOT NULL,
        db_type VARCHAR(16) NOT NULL,
        host VARCHAR(255) NOT NULL,
        port BIGINT NOT NULL,
        username VARCHAR(255) NOT NULL,
        password_cipher TEXT NOT NULL,
        ssl_mode VARCHAR(32) NOT NULL,
        allow_risky_filters SMALLINT NOT NULL DEFAULT 0,
        status VARCHAR(16) NOT NULL,
        last_check_at BIGINT,
        created_at BIGINT NOT NULL
    )",
    r"CREATE TABLE IF NOT EXISTS query_sessions (
        id VARCHAR(36) PRIMARY KEY,
        instance_id VARCHAR(36) NOT NULL,
        executed_by VARCHAR(255) NOT NULL,
        database_name VARCHAR(255) NOT NULL,
        query_text TEXT NOT NULL,
        query_type VARCHAR(32) NOT NULL,
        started_at BIGINT NOT NULL,
        completed_at BIGINT,
        duration_ms BIGINT NOT NULL DEFAULT 0,
        row_count BIGINT NOT NULL DEFAULT 0,
        bytes_returned BIGINT NOT NULL DEFAULT 0,
        status VARCHAR(16) NOT NULL,
        error_message TEXT,
        client_ip VARCHAR(64)
    )",
    r"CREATE TABLE IF NOT EXISTS auth_sessions (
        id VARCHAR(36) PRIMARY KEY,
        user_id VARCHAR(36) NOT NULL,
        token_hash VARCHAR(64) NOT NULL,
        refresh_hash VARCHAR(64) NOT NULL,
        issued_at BIGINT NOT NULL,
        expires_at BIGINT NOT NULL,
        last_activity_at BIGINT NOT NULL,
        is_active SMALLINT NOT NULL DEFAULT 1,
        ip VARCHAR(64),
        user_agent TEXT
    )",
];

const INDEXES: &[&str] = &[
    "CREATE UNIQUE INDEX idx_users_username ON users (username)",
    "CREATE UNIQUE INDEX idx_agents_uuid ON agents (uuid)",
    "CREATE INDEX idx_agent_states_agent_ts ON agent_states (agent_id, ts)",
    "CREATE INDEX idx_tasks_agent ON scheduled_tasks (agent_id, created_at)",
    "CREATE UNIQUE INDEX idx_recordings_session ON terminal_recordings (session_id)",
    "CREATE INDEX idx_recordings_ended ON terminal_recordings (ended_at)",
    "CREATE INDEX idx_recordings_user ON terminal_recordings (user_id, started_at)",
    "CREATE INDEX idx_audit_subsystem_ts ON audit_events (subsystem, ts)",
    "CREATE INDEX idx_audit_operator ON audit_events (operator, ts)",
    "CREATE UNIQUE INDEX idx_instances_name ON database_instances (name)",
    "CREATE INDEX idx_query_sessions_instance ON query_sessions (instance_id, started_at)",
    "CREATE INDEX idx_auth_sessions_user ON auth_sessions (user_id)",
    "CREATE INDEX idx_auth_sessions_token ON auth_sessions (token_hash)",
];

/// Create tables and indexes. Safe to run on every startup: tables use
/// `IF NOT EXISTS`; index statements that collide with an existing index are
/// ignored (MySQL has no `IF NOT EXISTS` for indexes).
#[tracing::instrument(skip(db), err)]
pub async fn migrate(db: &Db) -> anyhow::Result<()> {
    for ddl in TABLES {
        sqlx::query(ddl).execute(&db.pool).await?;
    }
    for ddl in INDEXES {
        if let Err(e) = sqlx::query(ddl).execute(&db.pool).await {
            tracing::debug!(error = %e, "index creation skipped");
        }
    }
    tracing::info!("schema ready");
    Ok(())
}
