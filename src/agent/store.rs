use std::collections::HashMap;

use base64::Engine;
use serde::Serialize;
use sqlx::Row;
use uuid::Uuid;

use super::proto::{AgentStateFrame, HostInfo};
use crate::store::now_ms;
use crate::store::pool::Db;

#[derive(Debug, Clone, Serialize)]
pub struct AgentRow {
    pub id: String,
    pub uuid: String,
    pub platform: String,
    pub arch: String,
    pub cpu_model: String,
    pub cpu_cores: i64,
    pub mem_total: i64,
    pub disk_total: i64,
    pub boot_time: i64,
    pub agent_version: String,
    pub ssh_enabled: bool,
    pub group_name: String,
    pub disabled: bool,
    pub last_seen_at: Option<i64>,
    pub created_at: i64,
}

fn clamp_u64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

fn row_to_agent(row: &sqlx::any::AnyRow) -> Result<AgentRow, sqlx::Error> {
    Ok(AgentRow {
        id: row.try_get("id")?,
        uuid: row.try_get("uuid")?,
        platform: row.try_get("platform")?,
        arch: row.try_get("arch")?,
        cpu_model: row.try_get("cpu_model")?,
        cpu_cores: row.try_get("cpu_cores")?,
        mem_total: row.try_get("mem_total")?,
        disk_total: row.try_get("disk_total")?,
        boot_time: row.try_get("boot_time")?,
        agent_version: row.try_get("agent_version")?,
        ssh_enabled: row.try_get::<i64, _>("ssh_enabled")? != 0,
        group_name: row.try_get("group_name")?,
        disabled: row.try_get::<i64, _>("disabled")? != 0,
        last_seen_at: row.try_get("last_seen_at")?,
        created_at: row.try_get("created_at")?,
    })
}

const AGENT_COLUMNS: &str = "id, uuid, platform, arch, cpu_model, cpu_cores, mem_total, \
     disk_total, boot_time, agent_version, ssh_enabled, group_name, disabled, \
     last_seen_at, created_at";

/// Stored secret hash for an agent uuid, if the agent is known.
pub async fn find_secret_hash(db: &Db, uuid: &str) -> anyhow::Result<Option<String>> {
    let row = sqlx::query(&db.sql("SELECT secret_hash FROM agents WHERE uuid = $1"))
        .bind(uuid)
        .fetch_optional(&db.pool)
        .await?;
    Ok(row.map(|r| r.try_get("secret_hash")).transpose()?)
}

pub async fn find_by_uuid(db: &Db, uuid: &str) -> anyhow::Result<Option<AgentRow>> {
    let row = sqlx::query(&db.sql(&format!(
        "SELECT {AGENT_COLUMNS} FROM agents WHERE uuid = $1"
    )))
    .bind(uuid)
    .fetch_optional(&db.pool)
    .await?;
    row.as_ref().map(row_to_agent).transpose().map_err(Into::into)
}

/// Upsert the inventory row on a successful registration. First contact
/// creates the row with the presented secret's hash; later registrations
/// refresh the host facts. Returns the row id.
pub async fn upsert_registration(
    db: &Db,
    uuid: &str,
    secret_hash: &str,
    info: &HostInfo,
) -> anyhow::Result<String> {
    if let Some(existing) = find_by_uuid(db, uuid).await? {
        sqlx::query(&db.sql(
            "UPDATE agents SET platform = $1, arch = $2, cpu_model = $3, cpu_cores = $4,
                mem_total = $5, disk_total = $6, boot_time = $7, agent_version = $8,
                ssh_enabled = $9, last_seen_at = $10
             WHERE uuid = $11",
        ))
        .bind(&info.platform)
        .bind(&info.arch)
        .bind(&info.cpu_model)
        .bind(i64::from(info.cpu_cores))
        .bind(clamp_u64(info.mem_total))
        .bind(clamp_u64(info.disk_total))
        .bind(info.boot_time)
        .bind(&info.agent_version)
        .bind(i64::from(info.ssh_enabled))
        .bind(now_ms())
        .bind(uuid)
        .execute(&db.pool)
        .await?;
        return Ok(existing.id);
    }

    let id = Uuid::new_v4().to_string();
    sqlx::query(&db.sql(
        "INSERT INTO agents
            (id, uuid, secret_hash, platform, arch, cpu_model, cpu_cores, mem_total,
             disk_total, boot_time, agent_version, ssh_enabled, group_name, disabled,
             last_seen_at, created_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, 0, $14, $15)",
    ))
    .bind(&id)
    .bind(uuid)
    .bind(secret_hash)
    .bind(&info.platform)
    .bind(&info.arch)
    .bind(&info.cpu_model)
    .bind(i64::from(info.cpu_cores))
    .bind(clamp_u64(info.mem_total))
    .bind(clamp_u64(info.disk_total))
    .bind(info.boot_time)
    .bind(&info.agent_version)
    .bind(i64::from(info.ssh_enabled))
    .bind("default")
    .bind(now_ms())
    .bind(now_ms())
    .execute(&db.pool)
    .await?;
    Ok(id)
}

pub async fn record_heartbeat(db: &Db, uuid: &str) -> anyhow::Result<()> {
    sqlx::query(&db.sql("UPDATE agents SET last_seen_at = $1 WHERE uuid = $2"))
        .bind(now_ms())
        .bind(uuid)
        .execute(&db.pool)
        .await?;
    Ok(())
}

/// Append one time-series sample.
pub async fn insert_state(db: &Db, agent_id: &str, frame: &AgentStateFrame) -> anyhow::Result<()> {
    sqlx::query(&db.sql(
        "INSERT INTO agent_states
            (agent_id, ts, cpu_percent, load1, load5, load15, mem_used, disk_used,
             net_in_bytes, net_out_bytes, traffic_sent_delta, traffic_recv_delta,
             tcp_conn_count, udp_conn_count, process_count, uptime_seconds)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)",
    ))
    .bind(agent_id)
    .bind(now_ms())
    .bind(frame.cpu_percent)
    .bind(frame.load1)
    .bind(frame.load5)
    .bind(frame.load15)
    .bind(clamp_u64(frame.mem_used))
    .bind(clamp_u64(frame.disk_used))
    .bind(clamp_u64(frame.net_in_bytes))
    .bind(clamp_u64(frame.net_out_bytes))
    .bind(clamp_u64(frame.traffic_sent_delta))
    .bind(clamp_u64(frame.traffic_recv_delta))
    .bind(i64::from(frame.tcp_conn_count))
    .bind(i64::from(frame.udp_conn_count))
    .bind(i64::from(frame.process_count))
    .bind(clamp_u64(frame.uptime_seconds))
    .execute(&db.pool)
    .await?;
    Ok(())
}

#[derive(Debug, Serialize)]
pub struct StateSample {
    pub ts: i64,
    pub cpu_percent: f64,
    pub load1: f64,
    pub load5: f64,
    pub load15: f64,
    pub mem_used: i64,
    pub disk_used: i64,
    pub net_in_bytes: i64,
    pub net_out_bytes: i64,
    pub process_count: i64,
    pub uptime_seconds: i64,
}

pub async fn state_series(
    db: &Db,
    agent_id: &str,
    from_ms: i64,
    to_ms: i64,
    limit: i64,
) -> anyhow::Result<Vec<StateSample>> {
    let rows = sqlx::query(&db.sql(
        "SELECT ts, cpu_percent, load1, load5, load15, mem_used, disk_used,
                net_in_bytes, net_out_bytes, process_count, uptime_seconds
         FROM agent_states
         WHERE agent_id = $1 AND ts >= $2 AND ts <= $3
         ORDER BY ts DESC LIMIT $4",
    ))
    .bind(agent_id)
    .bind(from_ms)
    .bind(to_ms)
    .bind(limit.clamp(1, 10_000))
    .fetch_all(&db.pool)
    .await?;

    let mut samples = Vec::with_capacity(rows.len());
    for row in &rows {
        samples.push(StateSample {
            ts: row.try_get("ts")?,
            cpu_percent: row.try_get("cpu_percent")?,
            load1: row.try_get("load1")?,
            load5: row.try_get("load5")?,
            load15: row.try_get("load15")?,
            mem_used: row.try_get("mem_used")?,
            disk_used: row.try_get("disk_used")?,
            net_in_bytes: row.try_get("net_in_bytes")?,
            net_out_bytes: row.try_get("net_out_bytes")?,
            process_count: row.try_get("process_count")?,
            uptime_seconds: row.try_get("uptime_seconds")?,
        });
    }
    Ok(samples)
}

pub async fn list_agents(db: &Db) -> anyhow::Result<Vec<AgentRow>> {
    let rows = sqlx::query(&db.sql(&format!(
        "SELECT {AGENT_COLUMNS} FROM agents ORDER BY group_name, uuid"
    )))
    .fetch_all(&db.pool)
    .await?;
    rows.iter().map(row_to_agent).collect::<Result<_, _>>().map_err(Into::into)
}

/// Persist a scheduled task. The in-memory queue is authoritative for
/// dispatch; rows exist for history and result tracking, and are lost
/// semantics-wise only if the server restarts before dispatch.
pub async fn create_task(
    db: &Db,
    task_id: &str,
    agent_id: &str,
    task_type: &str,
    params: &HashMap<String, String>,
    payload: &[u8],
) -> anyhow::Result<()> {
    sqlx::query(&db.sql(
        "INSERT INTO scheduled_tasks (id, agent_id, task_type, params, payload, created_at)
         VALUES ($1, $2, $3, $4, $5, $6)",
    ))
    .bind(task_id)
    .bind(agent_id)
    .bind(task_type)
    .bind(serde_json::to_string(params)?)
    .bind(base64::engine::general_purpose::STANDARD.encode(payload))
    .bind(now_ms())
    .execute(&db.pool)
    .await?;
    Ok(())
}

pub async fn mark_dispatched(db: &Db, task_ids: &[String]) -> anyhow::Result<()> {
    let now = now_ms();
    for id in task_ids {
        sqlx::query(&db.sql("UPDATE scheduled_tasks SET dispatched_at = $1 WHERE id = $2"))
            .bind(now)
            .bind(id)
            .execute(&db.pool)
            .await?;
    }
    Ok(())
}

pub async fn mark_result(
    db: &Db,
    task_id: &str,
    success: bool,
    error: Option<&str>,
) -> anyhow::Result<()> {
    sqlx::query(&db.sql(
        "UPDATE scheduled_tasks SET result_at = $1, success = $2, error = $3 WHERE id = $4",
    ))
    .bind(now_ms())
    .bind(i64::from(success))
    .bind(error)
    .bind(task_id)
    .execute(&db.pool)
    .await?;
    Ok(())
}

pub async fn mark_expired(db: &Db, task_ids: &[String]) -> anyhow::Result<()> {
    let now = now_ms();
    for id in task_ids {
        sqlx::query(&db.sql(
            "UPDATE scheduled_tasks SET result_at = $1, success = 0, error = 'expired' WHERE id = $2",
        ))
        .bind(now)
        .bind(id)
        .execute(&db.pool)
        .await?;
    }
    Ok(())
}
