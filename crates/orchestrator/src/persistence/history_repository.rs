use crate::persistence::client::DbClient;
use crate::persistence::errors::DbError;
use chrono::{DateTime, Utc};
use cnc_models::host::{HostStatus, HostStatusHistoryEntry};
use libsql::params;
use tracing::instrument;
use uuid::Uuid;

pub struct HistoryRepository {
    db: DbClient,
}

impl HistoryRepository {
    pub fn new(db: DbClient) -> Self {
        Self { db }
    }

    #[instrument(skip(self))]
    pub async fn record_transition(&self, entry: &HostStatusHistoryEntry) -> Result<(), DbError> {
        let conn = self.db.connection()?;
        conn.execute(
            "INSERT INTO host_status_history (id, host_fqn, old_status, new_status, changed_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                Uuid::new_v4().to_string(),
                entry.host_fqn.clone(),
                status_str(entry.old_status),
                status_str(entry.new_status),
                entry.changed_at.to_rfc3339(),
            ],
        )
        .await?;
        Ok(())
    }

    /// Entries in `[window_start, window_end]` plus the single prior
    /// transition needed to establish the opening status (§4.3 uptime
    /// summary).
    #[instrument(skip(self))]
    pub async fn window_with_opening_state(
        &self,
        host_fqn: &str,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Result<Vec<HostStatusHistoryEntry>, DbError> {
        let conn = self.db.connection()?;
        let mut entries = Vec::new();

        let mut prior_rows = conn
            .query(
                "SELECT host_fqn, old_status, new_status, changed_at FROM host_status_history \
                 WHERE host_fqn = ?1 AND changed_at < ?2 ORDER BY changed_at DESC LIMIT 1",
                params![host_fqn, window_start.to_rfc3339()],
            )
            .await?;
        if let Some(row) = prior_rows.next().await? {
            entries.push(HostStatusHistoryEntry {
                host_fqn: row.get(0)?,
                old_status: parse_status(row.get::<String>(1)?),
                new_status: parse_status(row.get::<String>(2)?),
                changed_at: parse_ts(row.get(3)?)?,
            });
        }

        let mut rows = conn
            .query(
                "SELECT host_fqn, old_status, new_status, changed_at FROM host_status_history \
                 WHERE host_fqn = ?1 AND changed_at >= ?2 AND changed_at <= ?3 ORDER BY changed_at ASC",
                params![host_fqn, window_start.to_rfc3339(), window_end.to_rfc3339()],
            )
            .await?;
        while let Some(row) = rows.next().await? {
            entries.push(HostStatusHistoryEntry {
                host_fqn: row.get(0)?,
                old_status: parse_status(row.get::<String>(1)?),
                new_status: parse_status(row.get::<String>(2)?),
                changed_at: parse_ts(row.get(3)?)?,
            });
        }
        Ok(entries)
    }

    #[instrument(skip(self))]
    pub async fn prune_older_than(&self, retention_days: i64) -> Result<u64, DbError> {
        let cutoff = Utc::now() - chrono::Duration::days(retention_days);
        let conn = self.db.connection()?;
        let changed = conn
            .execute("DELETE FROM host_status_history WHERE changed_at < ?1", params![cutoff.to_rfc3339()])
            .await?;
        Ok(changed)
    }
}

fn status_str(status: HostStatus) -> &'static str {
    match status {
        HostStatus::Awake => "awake",
        HostStatus::Asleep => "asleep",
    }
}

fn parse_status(raw: String) -> HostStatus {
    if raw == "awake" {
        HostStatus::Awake
    } else {
        HostStatus::Asleep
    }
}

fn parse_ts(raw: String) -> Result<DateTime<Utc>, DbError> {
    DateTime::parse_from_rfc3339(&raw).map(|dt| dt.with_timezone(&Utc)).map_err(|e| DbError::Mapping(e.to_string()))
}
