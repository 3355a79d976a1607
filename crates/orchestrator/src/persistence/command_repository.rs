use crate::persistence::client::DbClient;
use crate::persistence::errors::DbError;
use chrono::{DateTime, Utc};
use cnc_models::command::{Command, CommandState, CommandType};
use libsql::{params, Row};
use tracing::instrument;

pub struct CommandRepository {
    db: DbClient,
}

impl CommandRepository {
    pub fn new(db: DbClient) -> Self {
        Self { db }
    }

    #[instrument(skip(self, command))]
    pub async fn insert(&self, command: &Command) -> Result<(), DbError> {
        let conn = self.db.connection()?;
        conn.execute(
            r#"
            INSERT INTO commands (
                command_id, command_type, node_id, target, payload, state,
                correlation_id, idempotency_key, queued_at, sent_at, resolved_at, outcome, error
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            "#,
            params![
                command.command_id.clone(),
                type_str(command.command_type).to_string(),
                command.node_id.clone(),
                command.target.clone(),
                command.payload.to_string(),
                state_str(command.state).to_string(),
                command.correlation_id.clone(),
                command.idempotency_key.clone(),
                command.queued_at.to_rfc3339(),
                command.sent_at.map(|t| t.to_rfc3339()),
                command.resolved_at.map(|t| t.to_rfc3339()),
                command.outcome.as_ref().map(|v| v.to_string()),
                command.error.clone(),
            ],
        )
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn mark_sent(&self, command_id: &str, sent_at: DateTime<Utc>) -> Result<(), DbError> {
        let conn = self.db.connection()?;
        conn.execute(
            "UPDATE commands SET state = 'sent', sent_at = ?1 WHERE command_id = ?2",
            params![sent_at.to_rfc3339(), command_id],
        )
        .await?;
        Ok(())
    }

    #[instrument(skip(self, outcome))]
    pub async fn resolve(
        &self,
        command_id: &str,
        state: CommandState,
        resolved_at: DateTime<Utc>,
        outcome: Option<serde_json::Value>,
        error: Option<String>,
    ) -> Result<(), DbError> {
        let conn = self.db.connection()?;
        conn.execute(
            "UPDATE commands SET state = ?1, resolved_at = ?2, outcome = ?3, error = ?4 WHERE command_id = ?5",
            params![
                state_str(state).to_string(),
                resolved_at.to_rfc3339(),
                outcome.map(|v| v.to_string()),
                error,
                command_id,
            ],
        )
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn find_active_by_dedup_key(
        &self,
        node_id: &str,
        command_type: CommandType,
        target: &str,
        idempotency_key: &str,
    ) -> Result<Option<Command>, DbError> {
        let conn = self.db.connection()?;
        let mut rows = conn
            .query(
                "SELECT * FROM commands WHERE node_id = ?1 AND command_type = ?2 AND target = ?3 AND idempotency_key = ?4 \
                 ORDER BY queued_at DESC LIMIT 1",
                params![node_id, type_str(command_type).to_string(), target, idempotency_key],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_command(&row)?)),
            None => Ok(None),
        }
    }

    #[instrument(skip(self))]
    pub async fn get(&self, command_id: &str) -> Result<Option<Command>, DbError> {
        let conn = self.db.connection()?;
        let mut rows = conn.query("SELECT * FROM commands WHERE command_id = ?1", params![command_id]).await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_command(&row)?)),
            None => Ok(None),
        }
    }

    /// Mutating commands in progress for `(node_id, target)`; used by the
    /// router's per-host serialization check (§4.2 ordering & tie-break).
    #[instrument(skip(self))]
    pub async fn find_non_terminal_mutating_for_target(&self, node_id: &str, target: &str) -> Result<Vec<Command>, DbError> {
        let conn = self.db.connection()?;
        let mut rows = conn
            .query(
                "SELECT * FROM commands WHERE node_id = ?1 AND target = ?2 AND state IN ('queued', 'sent')",
                params![node_id, target],
            )
            .await?;
        let mut commands = Vec::new();
        while let Some(row) = rows.next().await? {
            let command = row_to_command(&row)?;
            if command.command_type.is_mutating() {
                commands.push(command);
            }
        }
        Ok(commands)
    }

    /// Non-terminal commands of one specific type for `(node_id, target)`,
    /// used by commands with a type-scoped rather than host-wide
    /// concurrency limit (scan-host-ports: only one at a time per host).
    #[instrument(skip(self))]
    pub async fn find_non_terminal_of_type_for_target(
        &self,
        node_id: &str,
        target: &str,
        command_type: CommandType,
    ) -> Result<Vec<Command>, DbError> {
        let conn = self.db.connection()?;
        let mut rows = conn
            .query(
                "SELECT * FROM commands WHERE node_id = ?1 AND target = ?2 AND command_type = ?3 AND state IN ('queued', 'sent')",
                params![node_id, target, type_str(command_type).to_string()],
            )
            .await?;
        let mut commands = Vec::new();
        while let Some(row) = rows.next().await? {
            commands.push(row_to_command(&row)?);
        }
        Ok(commands)
    }

    /// Startup reconciliation (§4.5): every row in {queued, sent} becomes
    /// `timed_out`. Returns the affected command ids.
    #[instrument(skip(self))]
    pub async fn reconcile_on_startup(&self) -> Result<Vec<String>, DbError> {
        let conn = self.db.connection()?;
        let mut rows = conn.query("SELECT command_id FROM commands WHERE state IN ('queued', 'sent')", ()).await?;
        let mut ids = Vec::new();
        while let Some(row) = rows.next().await? {
            ids.push(row.get::<String>(0)?);
        }
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "UPDATE commands SET state = 'timed_out', resolved_at = ?1, error = 'reconciled-on-restart' WHERE state IN ('queued', 'sent')",
            params![now],
        )
        .await?;
        Ok(ids)
    }

    #[instrument(skip(self))]
    pub async fn prune_older_than(&self, retention_days: i64) -> Result<u64, DbError> {
        let cutoff = Utc::now() - chrono::Duration::days(retention_days);
        let conn = self.db.connection()?;
        let changed = conn
            .execute(
                "DELETE FROM commands WHERE state IN ('acknowledged', 'failed', 'timed_out') AND queued_at < ?1",
                params![cutoff.to_rfc3339()],
            )
            .await?;
        Ok(changed)
    }
}

fn type_str(t: CommandType) -> &'static str {
    match t {
        CommandType::Wake => "wake",
        CommandType::SleepHost => "sleep-host",
        CommandType::ShutdownHost => "shutdown-host",
        CommandType::Scan => "scan",
        CommandType::ScanHostPorts => "scan-host-ports",
        CommandType::PingHost => "ping-host",
        CommandType::UpdateHost => "update-host",
        CommandType::DeleteHost => "delete-host",
    }
}

fn parse_type(raw: &str) -> Result<CommandType, DbError> {
    Ok(match raw {
        "wake" => CommandType::Wake,
        "sleep-host" => CommandType::SleepHost,
        "shutdown-host" => CommandType::ShutdownHost,
        "scan" => CommandType::Scan,
        "scan-host-ports" => CommandType::ScanHostPorts,
        "ping-host" => CommandType::PingHost,
        "update-host" => CommandType::UpdateHost,
        "delete-host" => CommandType::DeleteHost,
        other => return Err(DbError::Mapping(format!("unknown command type '{other}'"))),
    })
}

fn state_str(s: CommandState) -> &'static str {
    match s {
        CommandState::Queued => "queued",
        CommandState::Sent => "sent",
        CommandState::Acknowledged => "acknowledged",
        CommandState::Failed => "failed",
        CommandState::TimedOut => "timed_out",
    }
}

fn parse_state(raw: &str) -> Result<CommandState, DbError> {
    Ok(match raw {
        "queued" => CommandState::Queued,
        "sent" => CommandState::Sent,
        "acknowledged" => CommandState::Acknowledged,
        "failed" => CommandState::Failed,
        "timed_out" => CommandState::TimedOut,
        other => return Err(DbError::Mapping(format!("unknown command state '{other}'"))),
    })
}

fn row_to_command(row: &Row) -> Result<Command, DbError> {
    let payload_raw: String = row.get(4)?;
    let outcome_raw: Option<String> = row.get(11)?;
    Ok(Command {
        command_id: row.get(0)?,
        command_type: parse_type(&row.get::<String>(1)?)?,
        node_id: row.get(2)?,
        target: row.get(3)?,
        payload: serde_json::from_str(&payload_raw).map_err(|e| DbError::Mapping(e.to_string()))?,
        state: parse_state(&row.get::<String>(5)?)?,
        correlation_id: row.get(6)?,
        idempotency_key: row.get(7)?,
        queued_at: parse_ts(row.get(8)?)?,
        sent_at: row.get::<Option<String>>(9)?.map(parse_ts).transpose()?,
        resolved_at: row.get::<Option<String>>(10)?.map(parse_ts).transpose()?,
        outcome: outcome_raw.map(|raw| serde_json::from_str(&raw)).transpose().map_err(|e| DbError::Mapping(e.to_string()))?,
        error: row.get(12)?,
    })
}

fn parse_ts(raw: String) -> Result<DateTime<Utc>, DbError> {
    DateTime::parse_from_rfc3339(&raw).map(|dt| dt.with_timezone(&Utc)).map_err(|e| DbError::Mapping(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn sample_command(state: CommandState) -> Command {
        let mut command = Command::new(CommandType::Wake, "node-1", "host-1", Value::Null, "corr-1".into(), None);
        command.state = state;
        command
    }

    /// S4 — startup reconciliation: queued/sent rows left over from a prior
    /// process are flipped to `timed_out` on boot, and ids of the affected
    /// rows are returned so the inflight table can be confirmed empty of
    /// stale entries.
    #[tokio::test]
    async fn reconcile_on_startup_times_out_queued_and_sent_rows() {
        let db = DbClient::connect(":memory:", None).await.unwrap();
        let repo = CommandRepository::new(db);

        let queued = sample_command(CommandState::Queued);
        let sent = sample_command(CommandState::Sent);
        let acknowledged = sample_command(CommandState::Acknowledged);
        repo.insert(&queued).await.unwrap();
        repo.insert(&sent).await.unwrap();
        repo.insert(&acknowledged).await.unwrap();

        let mut reconciled = repo.reconcile_on_startup().await.unwrap();
        reconciled.sort();
        let mut expected = vec![queued.command_id.clone(), sent.command_id.clone()];
        expected.sort();
        assert_eq!(reconciled, expected);

        assert_eq!(repo.get(&queued.command_id).await.unwrap().unwrap().state, CommandState::TimedOut);
        assert_eq!(repo.get(&sent.command_id).await.unwrap().unwrap().state, CommandState::TimedOut);
        assert_eq!(repo.get(&acknowledged.command_id).await.unwrap().unwrap().state, CommandState::Acknowledged);
    }
}
