//! Polls due wake schedules and dispatches them through the command router
//! (§4.6).

use crate::persistence::ScheduleRepository;
use crate::services::command_router::{CommandRouter, WakeOptions};
use chrono::Utc;
use cnc_models::schedule::ScheduleExecutionAttempt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, instrument, warn};

pub struct ScheduleWorker {
    schedules: Arc<ScheduleRepository>,
    router: Arc<CommandRouter>,
    batch_size: usize,
    running: AtomicBool,
}

impl ScheduleWorker {
    pub fn new(schedules: Arc<ScheduleRepository>, router: Arc<CommandRouter>, batch_size: usize) -> Self {
        Self { schedules, router, batch_size, running: AtomicBool::new(false) }
    }

    pub fn spawn(self: Arc<Self>, poll_interval: std::time::Duration) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(poll_interval);
            loop {
                interval.tick().await;
                self.clone().run_tick().await;
            }
        });
    }

    /// A tick never overlaps a still-running one: ticks always fire from
    /// the same sequential loop, but this guard keeps the invariant
    /// explicit against any future caller that spawns `run_tick` directly.
    #[instrument(skip(self))]
    async fn run_tick(self: Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("schedule tick skipped: previous tick still running");
            return;
        }

        let now = Utc::now();
        match self.schedules.fetch_due(now, self.batch_size).await {
            Ok(due) => {
                if !due.is_empty() {
                    info!(count = due.len(), "dispatching due wake schedules");
                }
                for mut schedule in due {
                    let correlation_id = format!("schedule:{}:{}", schedule.id, now.timestamp_millis());
                    let outcome = self
                        .router
                        .route_wake(
                            &schedule.host_fqn,
                            WakeOptions {
                                idempotency_key: None,
                                correlation_id: Some(correlation_id.clone()),
                                verify: schedule.notify_on_wake,
                                wol_port: None,
                            },
                        )
                        .await;

                    let dispatch_outcome = match &outcome {
                        Ok(_) => "dispatched".to_string(),
                        Err(err) => err.to_string(),
                    };
                    if let Err(err) = outcome {
                        warn!(schedule_id = %schedule.id, %err, "scheduled wake dispatch failed");
                    }

                    let attempt = ScheduleExecutionAttempt {
                        schedule_id: schedule.id.clone(),
                        attempted_at: now,
                        correlation_id,
                        dispatch_outcome,
                    };
                    if let Err(err) = self.schedules.record_execution_attempt(&attempt).await {
                        warn!(%err, "failed to record schedule execution attempt");
                    }

                    schedule.recompute_next_trigger(now);
                    if let Err(err) = self.schedules.update(&schedule).await {
                        warn!(%err, "failed to persist schedule after execution");
                    }
                }
            }
            Err(err) => warn!(%err, "failed to fetch due wake schedules"),
        }

        self.running.store(false, Ordering::SeqCst);
    }
}
