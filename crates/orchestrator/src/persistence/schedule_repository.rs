use crate::persistence::client::DbClient;
use crate::persistence::errors::DbError;
use chrono::{DateTime, Utc};
use cnc_models::schedule::{ScheduleExecutionAttempt, ScheduleFrequency, WakeSchedule};
use libsql::{params, Row};
use tracing::instrument;
use uuid::Uuid;

pub struct ScheduleRepository {
    db: DbClient,
}

impl ScheduleRepository {
    pub fn new(db: DbClient) -> Self {
        Self { db }
    }

    /// Due schedules (`enabled=true`, `next_trigger <= now`), ordered
    /// deterministically, bounded to `batch_size` (§4.6).
    #[instrument(skip(self))]
    pub async fn fetch_due(&self, now: DateTime<Utc>, batch_size: usize) -> Result<Vec<WakeSchedule>, DbError> {
        let conn = self.db.connection()?;
        let mut rows = conn
            .query(
                "SELECT * FROM host_schedules WHERE enabled = 1 AND next_trigger <= ?1 ORDER BY id ASC LIMIT ?2",
                params![now.to_rfc3339(), batch_size as i64],
            )
            .await?;
        let mut schedules = Vec::new();
        while let Some(row) = rows.next().await? {
            schedules.push(row_to_schedule(&row)?);
        }
        Ok(schedules)
    }

    #[instrument(skip(self, schedule))]
    pub async fn update(&self, schedule: &WakeSchedule) -> Result<(), DbError> {
        let conn = self.db.connection()?;
        conn.execute(
            "UPDATE host_schedules SET enabled = ?1, last_triggered = ?2, next_trigger = ?3, updated_at = ?4 WHERE id = ?5",
            params![
                schedule.enabled as i64,
                schedule.last_triggered.map(|t| t.to_rfc3339()),
                schedule.next_trigger.to_rfc3339(),
                schedule.updated_at.to_rfc3339(),
                schedule.id.clone(),
            ],
        )
        .await?;
        Ok(())
    }

    #[instrument(skip(self, schedule))]
    pub async fn create(&self, schedule: &WakeSchedule) -> Result<(), DbError> {
        let conn = self.db.connection()?;
        conn.execute(
            r#"
            INSERT INTO host_schedules (
                id, host_fqn, host_name, host_mac, scheduled_time, frequency, enabled,
                notify_on_wake, timezone, last_triggered, next_trigger, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            "#,
            params![
                schedule.id.clone(),
                schedule.host_fqn.clone(),
                schedule.host_name.clone(),
                schedule.host_mac.clone(),
                schedule.scheduled_time.format("%H:%M:%S").to_string(),
                frequency_str(schedule.frequency).to_string(),
                schedule.enabled as i64,
                schedule.notify_on_wake as i64,
                schedule.timezone.clone(),
                schedule.last_triggered.map(|t| t.to_rfc3339()),
                schedule.next_trigger.to_rfc3339(),
                schedule.created_at.to_rfc3339(),
                schedule.updated_at.to_rfc3339(),
            ],
        )
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn record_execution_attempt(&self, attempt: &ScheduleExecutionAttempt) -> Result<(), DbError> {
        let conn = self.db.connection()?;
        conn.execute(
            "INSERT INTO schedule_execution_attempts (id, schedule_id, attempted_at, correlation_id, dispatch_outcome) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                Uuid::new_v4().to_string(),
                attempt.schedule_id.clone(),
                attempt.attempted_at.to_rfc3339(),
                attempt.correlation_id.clone(),
                attempt.dispatch_outcome.clone(),
            ],
        )
        .await?;
        Ok(())
    }
}

fn frequency_str(f: ScheduleFrequency) -> &'static str {
    match f {
        ScheduleFrequency::Once => "once",
        ScheduleFrequency::Daily => "daily",
        ScheduleFrequency::Weekly => "weekly",
    }
}

fn parse_frequency(raw: &str) -> Result<ScheduleFrequency, DbError> {
    Ok(match raw {
        "once" => ScheduleFrequency::Once,
        "daily" => ScheduleFrequency::Daily,
        "weekly" => ScheduleFrequency::Weekly,
        other => return Err(DbError::Mapping(format!("unknown schedule frequency '{other}'"))),
    })
}

fn row_to_schedule(row: &Row) -> Result<WakeSchedule, DbError> {
    let scheduled_time_raw: String = row.get(4)?;
    Ok(WakeSchedule {
        id: row.get(0)?,
        host_fqn: row.get(1)?,
        host_name: row.get(2)?,
        host_mac: row.get(3)?,
        scheduled_time: chrono::NaiveTime::parse_from_str(&scheduled_time_raw, "%H:%M:%S")
            .map_err(|e| DbError::Mapping(e.to_string()))?,
        frequency: parse_frequency(&row.get::<String>(5)?)?,
        enabled: row.get::<i64>(6)? != 0,
        notify_on_wake: row.get::<i64>(7)? != 0,
        timezone: row.get(8)?,
        last_triggered: row.get::<Option<String>>(9)?.map(parse_ts).transpose()?,
        next_trigger: parse_ts(row.get(10)?)?,
        created_at: parse_ts(row.get(11)?)?,
        updated_at: parse_ts(row.get(12)?)?,
    })
}

fn parse_ts(raw: String) -> Result<DateTime<Utc>, DbError> {
    DateTime::parse_from_rfc3339(&raw).map(|dt| dt.with_timezone(&Utc)).map_err(|e| DbError::Mapping(e.to_string()))
}
