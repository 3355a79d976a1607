use anyhow::{Context, Result};
use libsql::Connection;
use tracing::{debug, info, instrument, warn};

/// Base tables (§6 persistence shape). JSON-bearing columns
/// (`secondary_macs`, `tags`, `open_ports`) are stored as TEXT.
const BASE_TABLES: &[(&str, &str)] = &[
    ("aggregated_hosts", r#"
        CREATE TABLE IF NOT EXISTS aggregated_hosts (
            id TEXT PRIMARY KEY,
            node_id TEXT NOT NULL,
            name TEXT NOT NULL,
            location TEXT NOT NULL,
            primary_mac TEXT NOT NULL,
            secondary_macs TEXT NOT NULL DEFAULT '[]',
            ip TEXT,
            status TEXT NOT NULL DEFAULT 'asleep',
            last_seen_at TEXT NOT NULL,
            discovered INTEGER NOT NULL DEFAULT 0,
            ping_responsive INTEGER,
            notes TEXT,
            tags TEXT NOT NULL DEFAULT '[]',
            power_control TEXT,
            open_ports TEXT,
            port_scanned_at TEXT,
            port_scan_expire_at TEXT
        );
    "#),
    ("host_status_history", r#"
        CREATE TABLE IF NOT EXISTS host_status_history (
            id TEXT PRIMARY KEY,
            host_fqn TEXT NOT NULL,
            old_status TEXT NOT NULL,
            new_status TEXT NOT NULL,
            changed_at TEXT NOT NULL
        );
    "#),
    ("commands", r#"
        CREATE TABLE IF NOT EXISTS commands (
            command_id TEXT PRIMARY KEY,
            command_type TEXT NOT NULL,
            node_id TEXT NOT NULL,
            target TEXT NOT NULL,
            payload TEXT NOT NULL,
            state TEXT NOT NULL,
            correlation_id TEXT NOT NULL,
            idempotency_key TEXT,
            queued_at TEXT NOT NULL,
            sent_at TEXT,
            resolved_at TEXT,
            outcome TEXT,
            error TEXT
        );
    "#),
    ("webhooks", r#"
        CREATE TABLE IF NOT EXISTS webhooks (
            id TEXT PRIMARY KEY,
            url TEXT NOT NULL,
            events TEXT NOT NULL DEFAULT '[]',
            secret TEXT
        );
    "#),
    ("webhook_deliveries", r#"
        CREATE TABLE IF NOT EXISTS webhook_deliveries (
            id TEXT PRIMARY KEY,
            webhook_id TEXT NOT NULL,
            event_type TEXT NOT NULL,
            attempt INTEGER NOT NULL,
            status TEXT NOT NULL,
            response_status INTEGER,
            requested_at TEXT NOT NULL
        );
    "#),
    ("host_schedules", r#"
        CREATE TABLE IF NOT EXISTS host_schedules (
            id TEXT PRIMARY KEY,
            host_fqn TEXT NOT NULL,
            host_name TEXT NOT NULL,
            host_mac TEXT NOT NULL,
            scheduled_time TEXT NOT NULL,
            frequency TEXT NOT NULL,
            enabled INTEGER NOT NULL DEFAULT 1,
            notify_on_wake INTEGER NOT NULL DEFAULT 0,
            timezone TEXT NOT NULL,
            last_triggered TEXT,
            next_trigger TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
    "#),
    ("schedule_execution_attempts", r#"
        CREATE TABLE IF NOT EXISTS schedule_execution_attempts (
            id TEXT PRIMARY KEY,
            schedule_id TEXT NOT NULL,
            attempted_at TEXT NOT NULL,
            correlation_id TEXT NOT NULL,
            dispatch_outcome TEXT NOT NULL
        );
    "#),
];

const INDEXES: &[(&str, &str)] = &[
    ("idx_hosts_node", "CREATE INDEX IF NOT EXISTS idx_hosts_node ON aggregated_hosts(node_id);"),
    ("idx_hosts_node_mac", "CREATE INDEX IF NOT EXISTS idx_hosts_node_mac ON aggregated_hosts(node_id, primary_mac);"),
    ("idx_hosts_node_name", "CREATE INDEX IF NOT EXISTS idx_hosts_node_name ON aggregated_hosts(node_id, name);"),
    ("idx_history_fqn", "CREATE INDEX IF NOT EXISTS idx_history_fqn ON host_status_history(host_fqn, changed_at);"),
    ("idx_commands_state", "CREATE INDEX IF NOT EXISTS idx_commands_state ON commands(state);"),
    ("idx_commands_dedup", "CREATE INDEX IF NOT EXISTS idx_commands_dedup ON commands(node_id, command_type, target, idempotency_key);"),
    ("idx_deliveries_webhook", "CREATE INDEX IF NOT EXISTS idx_deliveries_webhook ON webhook_deliveries(webhook_id);"),
    ("idx_schedules_due", "CREATE INDEX IF NOT EXISTS idx_schedules_due ON host_schedules(enabled, next_trigger);"),
];

/// Mutating column additions for rolling schema evolution. `duplicate
/// column name` errors are expected and swallowed; anything else is
/// logged as a warning since the startup sequence cannot tell whether
/// the miss is benign without inspecting the live schema.
const EVOLUTIONS: &[(&str, &str)] = &[];

#[instrument(skip(connection))]
pub async fn apply_schema(connection: &Connection) -> Result<()> {
    info!("applying database schema");
    solidify(connection).await?;
    evolve(connection).await?;
    harden(connection).await?;
    Ok(())
}

async fn solidify(db: &Connection) -> Result<()> {
    for (name, sql) in BASE_TABLES {
        debug!(table = name, "creating table if missing");
        db.execute(sql, ()).await.with_context(|| format!("failed to create table {name}"))?;
    }
    Ok(())
}

async fn evolve(db: &Connection) -> Result<()> {
    for (name, sql) in EVOLUTIONS {
        match db.execute(sql, ()).await {
            Ok(_) => info!(column = name, "applied schema evolution"),
            Err(e) if e.to_string().contains("duplicate column name") => {
                debug!(column = name, "schema evolution already applied");
            }
            Err(e) => warn!(column = name, error = %e, "schema evolution failed"),
        }
    }
    Ok(())
}

async fn harden(db: &Connection) -> Result<()> {
    for (name, sql) in INDEXES {
        debug!(index = name, "creating index if missing");
        db.execute(sql, ()).await.with_context(|| format!("failed to create index {name}"))?;
    }
    Ok(())
}
