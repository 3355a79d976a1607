use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleFrequency {
    Once,
    Daily,
    Weekly,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WakeSchedule {
    pub id: String,
    pub host_fqn: String,
    pub host_name: String,
    pub host_mac: String,
    pub scheduled_time: chrono::NaiveTime,
    pub frequency: ScheduleFrequency,
    pub enabled: bool,
    pub notify_on_wake: bool,
    pub timezone: String,
    pub last_triggered: Option<chrono::DateTime<chrono::Utc>>,
    pub next_trigger: chrono::DateTime<chrono::Utc>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl WakeSchedule {
    pub fn is_due(&self, now: chrono::DateTime<chrono::Utc>) -> bool {
        self.enabled && self.next_trigger <= now
    }

    /// Recompute `next_trigger` after an execution attempt. `Once` schedules
    /// disable themselves; `Daily`/`Weekly` roll forward by their period.
    /// This is the model-specific contract spec §9 leaves open: the core
    /// only requires that the model updates `next_trigger` after
    /// `record_execution_attempt`, which this satisfies.
    pub fn recompute_next_trigger(&mut self, now: chrono::DateTime<chrono::Utc>) {
        self.last_triggered = Some(now);
        self.updated_at = now;
        match self.frequency {
            ScheduleFrequency::Once => {
                self.enabled = false;
            }
            ScheduleFrequency::Daily => {
                self.next_trigger += chrono::Duration::days(1);
                if self.next_trigger <= now {
                    self.next_trigger = now + chrono::Duration::days(1);
                }
            }
            ScheduleFrequency::Weekly => {
                self.next_trigger += chrono::Duration::weeks(1);
                if self.next_trigger <= now {
                    self.next_trigger = now + chrono::Duration::weeks(1);
                }
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleExecutionAttempt {
    pub schedule_id: String,
    pub attempted_at: chrono::DateTime<chrono::Utc>,
    pub correlation_id: String,
    pub dispatch_outcome: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(freq: ScheduleFrequency) -> WakeSchedule {
        let now = chrono::Utc::now();
        WakeSchedule {
            id: "s1".into(),
            host_fqn: "desktop@lab".into(),
            host_name: "desktop".into(),
            host_mac: "AA:BB:CC:DD:EE:FF".into(),
            scheduled_time: chrono::NaiveTime::from_hms_opt(7, 0, 0).unwrap(),
            frequency: freq,
            enabled: true,
            notify_on_wake: false,
            timezone: "UTC".into(),
            last_triggered: None,
            next_trigger: now,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn once_disables_after_trigger() {
        let mut s = sample(ScheduleFrequency::Once);
        let now = chrono::Utc::now();
        s.recompute_next_trigger(now);
        assert!(!s.enabled);
        assert_eq!(s.last_triggered, Some(now));
    }

    #[test]
    fn daily_rolls_forward_at_least_one_day() {
        let mut s = sample(ScheduleFrequency::Daily);
        let now = chrono::Utc::now();
        s.recompute_next_trigger(now);
        assert!(s.next_trigger > now);
        assert!(s.enabled);
    }

    #[test]
    fn due_check_respects_enabled_flag() {
        let mut s = sample(ScheduleFrequency::Daily);
        let now = chrono::Utc::now();
        assert!(s.is_due(now));
        s.enabled = false;
        assert!(!s.is_due(now));
    }
}
