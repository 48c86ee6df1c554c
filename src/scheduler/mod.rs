//! Cron scheduler: recurring prompts delivered to minions.
//!
//! [`ScheduleStore`] owns schedule state and persistence
//! (`legions/<id>/schedules.json` plus the append-only
//! `schedule_history.jsonl`); [`SchedulerService`] is the background
//! tick loop that fires due schedules by enqueuing the formatted prompt
//! into the owning minion's message queue. The store stands alone so
//! disposal paths can cancel a minion's schedules without touching the
//! tick service.

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::coordinator::SessionCoordinator;
use crate::error::{LegionError, Result};
use crate::storage;
use crate::utils::unix_timestamp;

/// Status of a schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleStatus {
    Active,
    Paused,
    Cancelled,
}

/// A recurring cron trigger bound to one minion.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Schedule {
    pub schedule_id: String,
    pub legion_id: String,
    pub minion_id: String,
    /// Captured at creation; survives renames
    pub minion_name: String,
    pub name: String,
    /// Standard 5-field expression (min hour dom mon dow)
    pub cron_expression: String,
    pub prompt: String,
    pub status: ScheduleStatus,
    pub reset_session: bool,
    pub max_retries: u32,
    pub timeout_seconds: u64,
    pub created_at: f64,
    pub updated_at: f64,
    pub next_run: Option<f64>,
    pub last_run: Option<f64>,
    pub last_status: Option<String>,
    pub execution_count: u64,
    pub failure_count: u32,
}

impl Default for Schedule {
    fn default() -> Self {
        let now = unix_timestamp();
        Self {
            schedule_id: Uuid::new_v4().to_string(),
            legion_id: String::new(),
            minion_id: String::new(),
            minion_name: String::new(),
            name: String::new(),
            cron_expression: String::new(),
            prompt: String::new(),
            status: ScheduleStatus::Active,
            reset_session: false,
            max_retries: 3,
            timeout_seconds: 3600,
            created_at: now,
            updated_at: now,
            next_run: None,
            last_run: None,
            last_status: None,
            execution_count: 0,
            failure_count: 0,
        }
    }
}

/// One execution attempt, appended to `schedule_history.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleExecution {
    pub execution_id: String,
    pub schedule_id: String,
    pub scheduled_time: f64,
    pub actual_time: f64,
    /// "queued" | "failed" | "timeout" | "retry"
    pub status: String,
    /// Minion session state at fire time
    pub minion_state: String,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub retry_number: u32,
    /// Queue item created for this execution
    #[serde(default)]
    pub queue_id: Option<String>,
}

impl ScheduleExecution {
    /// Deserialize one history record, migrating the legacy `comm_id`
    /// key to `queue_id`.
    fn from_record(mut value: serde_json::Value) -> Option<Self> {
        if let Some(obj) = value.as_object_mut() {
            if let Some(comm_id) = obj.remove("comm_id") {
                obj.entry("queue_id").or_insert(comm_id);
            }
        }
        serde_json::from_value(value).ok()
    }
}

/// Validate a 5-field cron expression.
pub fn validate_cron_expression(expression: &str) -> bool {
    expression.split_whitespace().count() == 5
        && cron::Schedule::from_str(&format!("0 {}", expression)).is_ok()
}

/// Next fire time for a 5-field expression, strictly after `base`.
pub fn next_run_after(expression: &str, base: f64) -> Result<f64> {
    let schedule = cron::Schedule::from_str(&format!("0 {}", expression)).map_err(|e| {
        LegionError::validation(format!("invalid cron expression '{}': {}", expression, e))
    })?;
    let base_dt: DateTime<Utc> = Utc
        .timestamp_opt(base as i64, ((base.fract()) * 1e9) as u32)
        .single()
        .unwrap_or_else(Utc::now);
    let next = schedule
        .after(&base_dt)
        .next()
        .ok_or_else(|| LegionError::validation("cron expression never fires"))?;
    Ok(next.timestamp() as f64)
}

/// Owns schedule state and persistence.
pub struct ScheduleStore {
    data_dir: PathBuf,
    schedules: RwLock<HashMap<String, Schedule>>,
}

impl ScheduleStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            schedules: RwLock::new(HashMap::new()),
        }
    }

    fn legion_dir(&self, legion_id: &str) -> PathBuf {
        self.data_dir.join("legions").join(legion_id)
    }

    /// Create and persist a new active schedule.
    #[allow(clippy::too_many_arguments)]
    pub async fn create_schedule(
        &self,
        legion_id: &str,
        minion_id: &str,
        minion_name: &str,
        name: &str,
        cron_expression: &str,
        prompt: &str,
        reset_session: bool,
        max_retries: u32,
        timeout_seconds: u64,
    ) -> Result<Schedule> {
        if !validate_cron_expression(cron_expression) {
            return Err(LegionError::validation(format!(
                "invalid cron expression: {}",
                cron_expression
            )));
        }

        let schedule = Schedule {
            legion_id: legion_id.to_string(),
            minion_id: minion_id.to_string(),
            minion_name: minion_name.to_string(),
            name: name.to_string(),
            cron_expression: cron_expression.to_string(),
            prompt: prompt.to_string(),
            reset_session,
            max_retries,
            timeout_seconds,
            next_run: Some(next_run_after(cron_expression, unix_timestamp())?),
            ..Schedule::default()
        };
        self.schedules
            .write()
            .await
            .insert(schedule.schedule_id.clone(), schedule.clone());
        self.persist_legion(legion_id).await?;
        info!(target: "scheduler", "schedule created: {} '{}' for minion {} in legion {}", schedule.schedule_id, name, minion_id, legion_id);
        Ok(schedule)
    }

    pub async fn get_schedule(&self, schedule_id: &str) -> Option<Schedule> {
        self.schedules.read().await.get(schedule_id).cloned()
    }

    /// Schedules for a legion, newest first, optionally filtered.
    pub async fn list_schedules(
        &self,
        legion_id: &str,
        minion_id: Option<&str>,
        status: Option<ScheduleStatus>,
    ) -> Vec<Schedule> {
        let mut results: Vec<Schedule> = self
            .schedules
            .read()
            .await
            .values()
            .filter(|s| s.legion_id == legion_id)
            .filter(|s| minion_id.map(|m| s.minion_id == m).unwrap_or(true))
            .filter(|s| status.map(|st| s.status == st).unwrap_or(true))
            .cloned()
            .collect();
        results.sort_by(|a, b| b.created_at.total_cmp(&a.created_at));
        results
    }

    /// Update mutable fields. Changing the cron of an active schedule
    /// recomputes its next run.
    pub async fn update_schedule(
        &self,
        schedule_id: &str,
        name: Option<String>,
        cron_expression: Option<String>,
        prompt: Option<String>,
        max_retries: Option<u32>,
        timeout_seconds: Option<u64>,
    ) -> Result<Schedule> {
        if let Some(expr) = &cron_expression {
            if !validate_cron_expression(expr) {
                return Err(LegionError::validation(format!(
                    "invalid cron expression: {}",
                    expr
                )));
            }
        }

        let updated = {
            let mut schedules = self.schedules.write().await;
            let schedule = schedules.get_mut(schedule_id).ok_or_else(|| {
                LegionError::validation(format!("schedule {} not found", schedule_id))
            })?;
            if let Some(name) = name {
                schedule.name = name;
            }
            if let Some(prompt) = prompt {
                schedule.prompt = prompt;
            }
            if let Some(max_retries) = max_retries {
                schedule.max_retries = max_retries;
            }
            if let Some(timeout_seconds) = timeout_seconds {
                schedule.timeout_seconds = timeout_seconds;
            }
            if let Some(expr) = cron_expression {
                schedule.cron_expression = expr;
                if schedule.status == ScheduleStatus::Active {
                    schedule.next_run =
                        Some(next_run_after(&schedule.cron_expression, unix_timestamp())?);
                }
            }
            schedule.updated_at = unix_timestamp();
            schedule.clone()
        };
        self.persist_legion(&updated.legion_id).await?;
        Ok(updated)
    }

    /// Pause an active schedule. The cron expression is preserved.
    pub async fn pause_schedule(&self, schedule_id: &str) -> Result<Schedule> {
        let updated = {
            let mut schedules = self.schedules.write().await;
            let schedule = schedules.get_mut(schedule_id).ok_or_else(|| {
                LegionError::validation(format!("schedule {} not found", schedule_id))
            })?;
            if schedule.status != ScheduleStatus::Active {
                return Err(LegionError::validation(format!(
                    "schedule {} is not active",
                    schedule_id
                )));
            }
            schedule.status = ScheduleStatus::Paused;
            schedule.updated_at = unix_timestamp();
            schedule.clone()
        };
        self.persist_legion(&updated.legion_id).await?;
        info!(target: "scheduler", "schedule paused: {}", schedule_id);
        Ok(updated)
    }

    /// Resume a paused schedule: clears the failure counter and
    /// recomputes the next run.
    pub async fn resume_schedule(&self, schedule_id: &str) -> Result<Schedule> {
        let updated = {
            let mut schedules = self.schedules.write().await;
            let schedule = schedules.get_mut(schedule_id).ok_or_else(|| {
                LegionError::validation(format!("schedule {} not found", schedule_id))
            })?;
            if schedule.status != ScheduleStatus::Paused {
                return Err(LegionError::validation(format!(
                    "schedule {} is not paused",
                    schedule_id
                )));
            }
            schedule.status = ScheduleStatus::Active;
            schedule.failure_count = 0;
            schedule.next_run = Some(next_run_after(&schedule.cron_expression, unix_timestamp())?);
            schedule.updated_at = unix_timestamp();
            schedule.clone()
        };
        self.persist_legion(&updated.legion_id).await?;
        info!(target: "scheduler", "schedule resumed: {}", schedule_id);
        Ok(updated)
    }

    /// Cancel a schedule permanently.
    pub async fn cancel_schedule(&self, schedule_id: &str) -> Result<Schedule> {
        let updated = {
            let mut schedules = self.schedules.write().await;
            let schedule = schedules.get_mut(schedule_id).ok_or_else(|| {
                LegionError::validation(format!("schedule {} not found", schedule_id))
            })?;
            if schedule.status == ScheduleStatus::Cancelled {
                return Err(LegionError::validation(format!(
                    "schedule {} is already cancelled",
                    schedule_id
                )));
            }
            schedule.status = ScheduleStatus::Cancelled;
            schedule.next_run = None;
            schedule.updated_at = unix_timestamp();
            schedule.clone()
        };
        self.persist_legion(&updated.legion_id).await?;
        info!(target: "scheduler", "schedule cancelled: {}", schedule_id);
        Ok(updated)
    }

    /// Remove a schedule entirely.
    pub async fn delete_schedule(&self, schedule_id: &str) -> Result<Schedule> {
        let removed = {
            let mut schedules = self.schedules.write().await;
            schedules.remove(schedule_id).ok_or_else(|| {
                LegionError::validation(format!("schedule {} not found", schedule_id))
            })?
        };
        self.persist_legion(&removed.legion_id).await?;
        info!(target: "scheduler", "schedule deleted: {}", schedule_id);
        Ok(removed)
    }

    /// Cancel every non-cancelled schedule owned by a minion (disposal
    /// path). Returns the number cancelled.
    pub async fn cancel_schedules_for_minion(&self, minion_id: &str) -> Result<usize> {
        let mut affected_legions = Vec::new();
        let cancelled = {
            let mut schedules = self.schedules.write().await;
            let mut count = 0;
            for schedule in schedules.values_mut() {
                if schedule.minion_id != minion_id
                    || schedule.status == ScheduleStatus::Cancelled
                {
                    continue;
                }
                schedule.status = ScheduleStatus::Cancelled;
                schedule.next_run = None;
                schedule.updated_at = unix_timestamp();
                if !affected_legions.contains(&schedule.legion_id) {
                    affected_legions.push(schedule.legion_id.clone());
                }
                count += 1;
            }
            count
        };
        for legion_id in affected_legions {
            self.persist_legion(&legion_id).await?;
        }
        if cancelled > 0 {
            info!(target: "scheduler", "cancelled {} schedules for disposed minion {}", cancelled, minion_id);
        }
        Ok(cancelled)
    }

    /// Apply a mutation to one schedule and persist its legion.
    pub async fn apply<F>(&self, schedule_id: &str, mutate: F) -> Result<Schedule>
    where
        F: FnOnce(&mut Schedule),
    {
        let updated = {
            let mut schedules = self.schedules.write().await;
            let schedule = schedules.get_mut(schedule_id).ok_or_else(|| {
                LegionError::validation(format!("schedule {} not found", schedule_id))
            })?;
            mutate(schedule);
            schedule.updated_at = unix_timestamp();
            schedule.clone()
        };
        self.persist_legion(&updated.legion_id).await?;
        Ok(updated)
    }

    /// Schedules due at or before `now`.
    pub async fn due_schedules(&self, now: f64) -> Vec<Schedule> {
        self.schedules
            .read()
            .await
            .values()
            .filter(|s| s.status == ScheduleStatus::Active)
            .filter(|s| s.next_run.map(|t| now >= t).unwrap_or(false))
            .cloned()
            .collect()
    }

    /// Load schedules from every legion. Active schedules get their
    /// next run recomputed from now; with `catch_up` a missed window
    /// instead fires once immediately.
    pub async fn load_all(&self, catch_up: bool) -> Result<()> {
        let legions_dir = self.data_dir.join("legions");
        if !tokio::fs::try_exists(&legions_dir).await? {
            return Ok(());
        }
        let now = unix_timestamp();
        let mut entries = tokio::fs::read_dir(&legions_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let schedules_file = entry.path().join("schedules.json");
            let loaded: Option<Vec<Schedule>> = storage::read_json(&schedules_file).await?;
            let Some(loaded) = loaded else { continue };

            let mut schedules = self.schedules.write().await;
            for mut schedule in loaded {
                if schedule.status == ScheduleStatus::Active {
                    let missed = schedule.next_run.map(|t| t <= now).unwrap_or(false);
                    if missed && catch_up {
                        schedule.next_run = Some(now);
                    } else {
                        match next_run_after(&schedule.cron_expression, now) {
                            Ok(next) => schedule.next_run = Some(next),
                            Err(e) => {
                                warn!(target: "scheduler", "schedule {} has unusable cron: {}", schedule.schedule_id, e);
                                schedule.next_run = None;
                            }
                        }
                    }
                }
                schedules.insert(schedule.schedule_id.clone(), schedule);
            }
        }

        let schedules = self.schedules.read().await;
        let active = schedules
            .values()
            .filter(|s| s.status == ScheduleStatus::Active)
            .count();
        info!(target: "scheduler", "loaded {} schedules ({} active) from all legions", schedules.len(), active);
        Ok(())
    }

    /// Append an execution record to the legion's history log.
    pub async fn append_execution(
        &self,
        legion_id: &str,
        execution: &ScheduleExecution,
    ) -> Result<()> {
        let history_file = self.legion_dir(legion_id).join("schedule_history.jsonl");
        storage::append_jsonl(&history_file, execution).await
    }

    /// Read execution history, newest first, with pagination.
    pub async fn get_history(
        &self,
        legion_id: &str,
        schedule_id: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ScheduleExecution>> {
        let history_file = self.legion_dir(legion_id).join("schedule_history.jsonl");
        let records = storage::read_jsonl(&history_file).await?;
        let mut executions: Vec<ScheduleExecution> = records
            .into_iter()
            .filter_map(ScheduleExecution::from_record)
            .filter(|e| schedule_id.map(|id| e.schedule_id == id).unwrap_or(true))
            .collect();
        executions.reverse();
        Ok(executions.into_iter().skip(offset).take(limit).collect())
    }

    async fn persist_legion(&self, legion_id: &str) -> Result<()> {
        let schedules: Vec<Schedule> = self
            .schedules
            .read()
            .await
            .values()
            .filter(|s| s.legion_id == legion_id)
            .cloned()
            .collect();
        let schedules_file = self.legion_dir(legion_id).join("schedules.json");
        storage::write_json(&schedules_file, &schedules).await
    }
}

/// Background loop that fires due schedules.
pub struct SchedulerService {
    store: Arc<ScheduleStore>,
    coordinator: Arc<SessionCoordinator>,
    tick_interval: Duration,
    shutdown_tx: watch::Sender<bool>,
}

impl SchedulerService {
    pub fn new(
        store: Arc<ScheduleStore>,
        coordinator: Arc<SessionCoordinator>,
        tick_secs: u64,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            store,
            coordinator,
            tick_interval: Duration::from_secs(tick_secs.max(1)),
            shutdown_tx,
        }
    }

    /// Spawn the tick loop.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let service = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            info!(target: "scheduler", "scheduler service started");
            let mut ticker = tokio::time::interval(service.tick_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        service.tick().await;
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            info!(target: "scheduler", "scheduler service stopped");
        })
    }

    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Evaluate all active schedules and fire any that are due.
    pub async fn tick(&self) {
        let now = unix_timestamp();
        for schedule in self.store.due_schedules(now).await {
            if let Err(e) = self.fire_schedule(schedule, now).await {
                error!(target: "scheduler", "scheduler tick error: {}", e);
            }
        }
    }

    async fn fire_schedule(&self, schedule: Schedule, now: f64) -> Result<()> {
        info!(target: "scheduler", "firing schedule {} '{}' for minion {}", schedule.schedule_id, schedule.name, schedule.minion_id);

        let minion_state = match self.coordinator.sessions().get_session(&schedule.minion_id).await
        {
            Some(info) => info.state.to_string(),
            None => "unknown".to_string(),
        };

        let formatted_prompt = format!("**[Scheduled Task: {}]**\n\n{}", schedule.name, schedule.prompt);
        let mut execution = ScheduleExecution {
            execution_id: Uuid::new_v4().to_string(),
            schedule_id: schedule.schedule_id.clone(),
            scheduled_time: schedule.next_run.unwrap_or(now),
            actual_time: now,
            status: "queued".to_string(),
            minion_state,
            error_message: None,
            retry_number: schedule.failure_count,
            queue_id: None,
        };

        let enqueue_result = self
            .coordinator
            .enqueue_message(
                &schedule.minion_id,
                &formatted_prompt,
                schedule.reset_session,
                Some(json!({
                    "source": "cron",
                    "schedule_id": schedule.schedule_id.clone(),
                    "schedule_name": schedule.name.clone(),
                    "trigger_time": now,
                })),
            )
            .await;

        let updated = match enqueue_result {
            Ok(item) => {
                execution.queue_id = Some(item.queue_id.clone());
                execution.status = "queued".to_string();
                let next = next_run_after(&schedule.cron_expression, now).ok();
                self.store
                    .apply(&schedule.schedule_id, |s| {
                        s.last_run = Some(now);
                        s.last_status = Some("queued".to_string());
                        s.execution_count += 1;
                        s.failure_count = 0;
                        s.next_run = next;
                    })
                    .await?
            }
            Err(e) => {
                error!(target: "scheduler", "schedule {} fire failed: {}", schedule.schedule_id, e);
                execution.error_message = Some(e.to_string());
                let failure_count = schedule.failure_count + 1;
                if failure_count <= schedule.max_retries {
                    // Exponential backoff: 60s, 120s, 240s, ...
                    let backoff = 60.0 * f64::powi(2.0, failure_count as i32 - 1);
                    execution.status = "retry".to_string();
                    execution.retry_number = failure_count;
                    info!(target: "scheduler", "schedule {} retry #{} in {}s", schedule.schedule_id, failure_count, backoff);
                    self.store
                        .apply(&schedule.schedule_id, |s| {
                            s.failure_count = failure_count;
                            s.last_status = Some("failed".to_string());
                            s.next_run = Some(now + backoff);
                        })
                        .await?
                } else {
                    warn!(target: "scheduler", "schedule {} exceeded max retries ({}), pausing", schedule.schedule_id, schedule.max_retries);
                    execution.status = "failed".to_string();
                    self.store
                        .apply(&schedule.schedule_id, |s| {
                            s.failure_count = failure_count;
                            s.last_status = Some("failed".to_string());
                            s.status = ScheduleStatus::Paused;
                            s.next_run = None;
                        })
                        .await?
                }
            }
        };

        self.store
            .append_execution(&schedule.legion_id, &execution)
            .await?;
        self.coordinator.broadcaster().broadcast_control(
            "schedule_updated",
            json!({"schedule": serde_json::to_value(&updated)?, "deleted": false}),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_validate_cron_expression() {
        assert!(validate_cron_expression("* * * * *"));
        assert!(validate_cron_expression("*/5 9-17 * * 1-5"));
        assert!(!validate_cron_expression("* * * *"));
        assert!(!validate_cron_expression("not a cron"));
        assert!(!validate_cron_expression("* * * * * *"));
    }

    #[test]
    fn test_next_run_after_every_minute() {
        let base = 1_700_000_000.0;
        let next = next_run_after("* * * * *", base).unwrap();
        assert!(next > base);
        assert!(next - base <= 60.0);
    }

    async fn store_with_schedule(dir: &TempDir) -> (ScheduleStore, String) {
        let store = ScheduleStore::new(dir.path());
        let schedule = store
            .create_schedule(
                "legion1",
                "minion1",
                "alpha",
                "status check",
                "* * * * *",
                "status?",
                false,
                3,
                3600,
            )
            .await
            .unwrap();
        (store, schedule.schedule_id)
    }

    #[tokio::test]
    async fn test_create_and_reload() {
        let dir = TempDir::new().unwrap();
        let (_, schedule_id) = store_with_schedule(&dir).await;

        let store2 = ScheduleStore::new(dir.path());
        store2.load_all(false).await.unwrap();
        let loaded = store2.get_schedule(&schedule_id).await.unwrap();
        assert_eq!(loaded.name, "status check");
        assert_eq!(loaded.status, ScheduleStatus::Active);
        // Recomputed from now on load.
        assert!(loaded.next_run.unwrap() > unix_timestamp() - 1.0);
    }

    #[tokio::test]
    async fn test_pause_resume_cancel_transitions() {
        let dir = TempDir::new().unwrap();
        let (store, schedule_id) = store_with_schedule(&dir).await;

        store.pause_schedule(&schedule_id).await.unwrap();
        // Pausing a paused schedule is an error.
        assert!(store.pause_schedule(&schedule_id).await.is_err());

        let resumed = store.resume_schedule(&schedule_id).await.unwrap();
        assert_eq!(resumed.failure_count, 0);
        assert!(resumed.next_run.is_some());

        store.cancel_schedule(&schedule_id).await.unwrap();
        // Cancelling twice is an error.
        assert!(store.cancel_schedule(&schedule_id).await.is_err());
    }

    #[tokio::test]
    async fn test_cancel_for_minion() {
        let dir = TempDir::new().unwrap();
        let (store, schedule_id) = store_with_schedule(&dir).await;
        store
            .create_schedule(
                "legion1", "minion2", "beta", "other", "* * * * *", "x", false, 3, 3600,
            )
            .await
            .unwrap();

        let cancelled = store.cancel_schedules_for_minion("minion1").await.unwrap();
        assert_eq!(cancelled, 1);
        assert_eq!(
            store.get_schedule(&schedule_id).await.unwrap().status,
            ScheduleStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn test_due_schedules() {
        let dir = TempDir::new().unwrap();
        let (store, schedule_id) = store_with_schedule(&dir).await;

        // Not due yet relative to its own next_run.
        let schedule = store.get_schedule(&schedule_id).await.unwrap();
        let before = schedule.next_run.unwrap() - 1.0;
        assert!(store.due_schedules(before).await.is_empty());

        let after = schedule.next_run.unwrap() + 1.0;
        let due = store.due_schedules(after).await;
        assert_eq!(due.len(), 1);
    }

    #[tokio::test]
    async fn test_history_migrates_comm_id() {
        let dir = TempDir::new().unwrap();
        let store = ScheduleStore::new(dir.path());

        // Hand-write a legacy record carrying comm_id.
        let history_file = dir
            .path()
            .join("legions")
            .join("legion1")
            .join("schedule_history.jsonl");
        storage::append_jsonl(
            &history_file,
            &json!({
                "execution_id": "e1",
                "schedule_id": "s1",
                "scheduled_time": 1.0,
                "actual_time": 2.0,
                "status": "queued",
                "minion_state": "active",
                "comm_id": "q-legacy",
            }),
        )
        .await
        .unwrap();

        let history = store.get_history("legion1", None, 10, 0).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].queue_id.as_deref(), Some("q-legacy"));
    }

    #[tokio::test]
    async fn test_update_recomputes_next_run() {
        let dir = TempDir::new().unwrap();
        let (store, schedule_id) = store_with_schedule(&dir).await;
        let updated = store
            .update_schedule(
                &schedule_id,
                None,
                Some("0 0 * * *".to_string()),
                None,
                None,
                None,
            )
            .await
            .unwrap();
        assert_eq!(updated.cron_expression, "0 0 * * *");
        assert!(updated.next_run.is_some());

        assert!(store
            .update_schedule(&schedule_id, None, Some("bad".to_string()), None, None, None)
            .await
            .is_err());
    }
}
