use std::collections::BTreeMap;
use std::env;
use std::path::Path;

use base64::Engine;
use serde::Deserialize;

/// Passwords that must never be accepted as a JWT secret, checked
/// case-insensitively against the whole secret.
const WEAK_SECRETS: &[&str] = &[
    "password",
    "passw0rd",
    "12345678",
    "123456789",
    "1234567890",
    "qwertyuiop",
    "letmein",
    "changeme",
    "secret",
    "admin123",
    "root1234",
    "opshub-secret",
];

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub jwt: JwtConfig,
    pub security: SecurityConfig,
    pub recording: RecordingConfig,
    pub audit: AuditConfig,
    pub agent: AgentConfig,
    pub query: QueryConfig,
    pub auth: AuthConfig,
    pub prometheus: PrometheusConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub http_port: u16,
    pub grpc_port: u16,
    pub bind: String,
    pub trust_proxy_headers: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// One of `sqlite`, `mysql`, `postgres`.
    #[serde(rename = "type")]
    pub db_type: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub name: String,
    pub ssl_mode: String,
    /// Path for the sqlite backend; ignored otherwise.
    pub path: String,
    pub max_open_conns: u32,
    pub max_idle_conns: u32,
    pub conn_max_lifetime_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct JwtConfig {
    pub secret: String,
    pub expires_in_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// 44 base64 characters decoding to exactly 32 bytes.
    pub encryption_key: String,
    pub bcrypt_cost: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    /// `local` or `object`.
    pub storage_type: String,
    pub base_path: String,
    pub retention_days: i64,
    pub cleanup_schedule: String,
    pub cleanup_batch_size: i64,
    pub cleanup_max_per_run: i64,
    pub cleanup_workers: usize,
    pub max_recording_size_bytes: u64,
    pub max_duration_secs: u64,
    pub idle_timeout_secs: u64,
    /// Object-store settings, used when `storage_type = "object"`.
    pub object_endpoint: String,
    pub object_bucket: String,
    pub object_region: String,
    pub object_access_key: String,
    pub object_secret_key: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub channel_buffer: usize,
    pub batch_size: usize,
    pub flush_period_secs: u64,
    pub worker_count: usize,
    pub offer_timeout_ms: u64,
    pub shutdown_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub report_interval_seconds: u32,
    pub max_pending_tasks: usize,
    pub max_outbound: usize,
    pub task_ttl_secs: u64,
    /// Max tasks handed out per heartbeat tick.
    pub dispatch_batch: usize,
    pub dial_timeout_secs: u64,
    pub disable_webssh: bool,
    pub disable_docker_report: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    pub timeout_secs: u64,
    pub max_rows: usize,
    /// Concurrent interactive query connections, independent of the pool.
    pub max_connections: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub max_concurrent_sessions: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PrometheusConfig {
    pub auto_discovery: bool,
    pub discovery_timeout_secs: u64,
    pub cluster_urls: BTreeMap<String, String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            grpc_port: 50051,
            bind: "0.0.0.0".into(),
            trust_proxy_headers: false,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            db_type: "sqlite".into(),
            host: "localhost".into(),
            port: 5432,
            user: "opshub".into(),
            password: String::new(),
            name: "opshub".into(),
            ssl_mode: "prefer".into(),
            path: "opshub.db".into(),
            max_open_conns: 20,
            max_idle_conns: 5,
            conn_max_lifetime_secs: 1800,
        }
    }
}

impl Default for JwtConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            expires_in_secs: 24 * 3600,
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            encryption_key: String::new(),
            bcrypt_cost: 10,
        }
    }
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            storage_type: "local".into(),
            base_path: "recordings".into(),
            retention_days: 90,
            cleanup_schedule: "0 4 * * *".into(),
            cleanup_batch_size: 1000,
            cleanup_max_per_run: 5000,
            cleanup_workers: 10,
            max_recording_size_bytes: 500 * 1024 * 1024,
            max_duration_secs: 2 * 3600,
            idle_timeout_secs: 1800,
            object_endpoint: String::new(),
            object_bucket: "opshub-recordings".into(),
            object_region: "us-east-1".into(),
            object_access_key: String::new(),
            object_secret_key: String::new(),
        }
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            channel_buffer: 1000,
            batch_size: 50,
            flush_period_secs: 5,
            worker_count: 2,
            offer_timeout_ms: 100,
            shutdown_timeout_secs: 10,
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            report_interval_seconds: 30,
            max_pending_tasks: 1024,
            max_outbound: 256,
            task_ttl_secs: 300,
            dispatch_batch: 16,
            dial_timeout_secs: 15,
            disable_webssh: false,
            disable_docker_report: false,
        }
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            max_rows: 1000,
            max_connections: 16,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            max_concurrent_sessions: 5,
        }
    }
}

impl Default for PrometheusConfig {
    fn default() -> Self {
        Self {
            auto_discovery: false,
            discovery_timeout_secs: 30,
            cluster_urls: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Load configuration: defaults, then the TOML file (if any), then
    /// environment overrides for deployment-sensitive values.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut cfg = match path {
            Some(p) => {
                let raw = std::fs::read_to_string(p)
                    .map_err(|e| anyhow::anyhow!("cannot read config file {}: {e}", p.display()))?;
                toml::from_str(&raw)
                    .map_err(|e| anyhow::anyhow!("invalid config file {}: {e}", p.display()))?
            }
            None => Self::default(),
        };
        cfg.apply_env();
        Ok(cfg)
    }

    fn apply_env(&mut self) {
        if let Ok(v) = env::var("OPSHUB_HTTP_PORT")
            && let Ok(port) = v.parse()
        {
            self.server.http_port = port;
        }
        if let Ok(v) = env::var("OPSHUB_GRPC_PORT")
            && let Ok(port) = v.parse()
        {
            self.server.grpc_port = port;
        }
        if let Ok(v) = env::var("OPSHUB_DATABASE_TYPE") {
            self.database.db_type = v;
        }
        if let Ok(v) = env::var("OPSHUB_DATABASE_HOST") {
            self.database.host = v;
        }
        if let Ok(v) = env::var("OPSHUB_DATABASE_PASSWORD") {
            self.database.password = v;
        }
        if let Ok(v) = env::var("OPSHUB_JWT_SECRET") {
            self.jwt.secret = v;
        }
        if let Ok(v) = env::var("OPSHUB_ENCRYPTION_KEY") {
            self.security.encryption_key = v;
        }
        if let Ok(v) = env::var("OPSHUB_RECORDING_BASE_PATH") {
            self.recording.base_path = v;
        }
    }

    /// Validate startup-critical settings and normalize out-of-range values.
    /// A hard failure here must abort the process with exit code 1.
    pub fn validate(&mut self) -> anyhow::Result<()> {
        validate_jwt_secret(&self.jwt.secret)?;
        decode_master_key(&self.security.encryption_key)?;

        if !(4..=31).contains(&self.security.bcrypt_cost) {
            anyhow::bail!(
                "security.bcrypt_cost must be between 4 and 31 (got {})",
                self.security.bcrypt_cost
            );
        }

        match self.database.db_type.as_str() {
            "sqlite" | "mysql" | "postgres" | "postgresql" => {}
            other => anyhow::bail!("database.type must be sqlite, mysql, or postgres (got {other})"),
        }

        match self.recording.storage_type.as_str() {
            "local" | "object" => {}
            other => anyhow::bail!("recording.storage_type must be local or object (got {other})"),
        }

        let clamped = self.agent.report_interval_seconds.clamp(5, 300);
        if clamped != self.agent.report_interval_seconds {
            tracing::warn!(
                configured = self.agent.report_interval_seconds,
                clamped,
                "agent.report_interval_seconds outside [5, 300]; clamped"
            );
            self.agent.report_interval_seconds = clamped;
        }

        if self.audit.worker_count == 0 {
            anyhow::bail!("audit.worker_count must be at least 1");
        }

        parse_cron(&self.recording.cleanup_schedule).map_err(|e| {
            anyhow::anyhow!("recording.cleanup_schedule is not a valid cron expression: {e}")
        })?;

        Ok(())
    }

    /// Connection URL for the server's own store.
    pub fn database_url(&self) -> String {
        let d = &self.database;
        match d.db_type.as_str() {
            "sqlite" => format!("sqlite://{}?mode=rwc", d.path),
            "mysql" => format!(
                "mysql://{}:{}@{}:{}/{}",
                d.user, d.password, d.host, d.port, d.name
            ),
            _ => format!(
                "postgres://{}:{}@{}:{}/{}?sslmode={}",
                d.user, d.password, d.host, d.port, d.name, d.ssl_mode
            ),
        }
    }

    /// Decode the configured AES-256-GCM master key.
    pub fn master_key(&self) -> anyhow::Result<[u8; 32]> {
        decode_master_key(&self.security.encryption_key)
    }
}

fn validate_jwt_secret(secret: &str) -> anyhow::Result<()> {
    if secret.is_empty() {
        anyhow::bail!("jwt.secret is not set; generate one with: openssl rand -base64 48");
    }
    if secret.len() < 32 {
        anyhow::bail!(
            "jwt.secret must be at least 32 characters (got {}); generate one with: openssl rand -base64 48",
            secret.len()
        );
    }
    let lowered = secret.to_lowercase();
    if WEAK_SECRETS.iter().any(|w| lowered.contains(w)) {
        anyhow::bail!(
            "jwt.secret contains a well-known weak password; generate one with: openssl rand -base64 48"
        );
    }
    if is_low_entropy(secret) {
        anyhow::bail!("jwt.secret has too little entropy; generate one with: openssl rand -base64 48");
    }
    Ok(())
}

/// Fewer than 8 distinct characters, or any single character accounting for
/// more than 60% of the secret.
fn is_low_entropy(secret: &str) -> bool {
    let mut counts: BTreeMap<char, usize> = BTreeMap::new();
    for c in secret.chars() {
        *counts.entry(c).or_default() += 1;
    }
    if counts.len() < 8 {
        return true;
    }
    let total = secret.chars().count();
    counts.values().any(|&n| n * 100 > total * 60)
}

/// Parse a standard 5-field cron expression (minute, hour, day-of-month,
/// month, day-of-week), interpreted in UTC. The `cron` crate wants a seconds
/// field, so one is prepended; 6- and 7-field expressions pass through.
pub fn parse_cron(expr: &str) -> anyhow::Result<cron::Schedule> {
    let trimmed = expr.trim();
    let fields = trimmed.split_whitespace().count();
    let normalized = if fields == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_owned()
    };
    normalized
        .parse::<cron::Schedule>()
        .map_err(|e| anyhow::anyhow!("{e}"))
}

pub fn decode_master_key(key: &str) -> anyhow::Result<[u8; 32]> {
    if key.is_empty() {
        anyhow::bail!(
            "security.encryption_key is not set; generate one with: openssl rand -base64 32"
        );
    }
    if key.len() != 44 {
        anyhow::bail!(
            "security.encryption_key must be 44 base64 characters (32 bytes), got {} characters",
            key.len()
        );
    }
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(key)
        .map_err(|e| anyhow::anyhow!("security.encryption_key is not valid base64: {e}"))?;
    let key: [u8; 32] = bytes
        .try_into()
        .map_err(|v: Vec<u8>| anyhow::anyhow!("encryption key must be 32 bytes, got {}", v.len()))?;
    Ok(key)
}
