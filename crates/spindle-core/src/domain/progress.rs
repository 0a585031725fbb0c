//! Progress - タスクごとの進捗

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::state::TaskState;

/// Progress of one task.
///
/// Written by the pool context running the task on the worker and mirrored
/// to the coordinator through `TASK_PROGRESS` messages. Unit counts never go
/// backwards within a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub state: TaskState,

    /// Units done in the current step (frames for video, seconds for audio).
    pub units: u64,

    /// Units expected per step.
    pub units_total: u64,

    /// Last throughput sample, units per second.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,

    /// 1-based index of the current step (pass).
    pub current_step: u32,
    pub step_count: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Progress {
    pub fn new(units_total: u64, step_count: u32) -> Self {
        Self {
            state: TaskState::Todo,
            units: 0,
            units_total,
            speed: None,
            current_step: 1,
            step_count: step_count.max(1),
            started_at: None,
            updated_at: None,
        }
    }

    /// Put the record back to a fresh TODO, keeping totals.
    pub fn reset(&mut self) {
        self.state = TaskState::Todo;
        self.units = 0;
        self.speed = None;
        self.current_step = 1;
        self.started_at = None;
        self.updated_at = None;
    }

    pub fn start(&mut self) {
        let now = Utc::now();
        self.state = TaskState::Running;
        self.started_at.get_or_insert(now);
        self.updated_at = Some(now);
    }

    /// Record a new unit position. Smaller values than the current one are
    /// ignored.
    pub fn update(&mut self, units: u64) {
        if units > self.units {
            self.units = units;
        }
        self.updated_at = Some(Utc::now());
    }

    pub fn update_with_speed(&mut self, units: u64, speed: f64) {
        self.update(units);
        if speed.is_finite() && speed >= 0.0 {
            self.speed = Some(speed);
        }
    }

    /// Finish the current step and move to the next one.
    pub fn complete_step(&mut self) {
        if self.current_step < self.step_count {
            self.current_step += 1;
            self.units = 0;
        } else {
            self.units = self.units_total.max(self.units);
        }
        self.updated_at = Some(Utc::now());
    }

    pub fn complete(&mut self) {
        self.state = TaskState::Completed;
        self.current_step = self.step_count;
        self.units = self.units_total.max(self.units);
        self.updated_at = Some(Utc::now());
    }

    pub fn fail(&mut self) {
        self.state = TaskState::Failed;
        self.updated_at = Some(Utc::now());
    }

    /// Merge a report coming from the node running the task.
    ///
    /// Stale reports (earlier step, or fewer units in the same step) do not
    /// move the record backwards. State is owned by the coordinator and is
    /// not taken from the report.
    pub fn merge_report(&mut self, reported: &Progress) {
        if reported.current_step > self.current_step {
            self.current_step = reported.current_step.min(self.step_count);
            self.units = reported.units;
        } else if reported.current_step == self.current_step {
            self.units = self.units.max(reported.units);
        } else {
            return;
        }
        if reported.speed.is_some() {
            self.speed = reported.speed;
        }
        self.updated_at = Some(Utc::now());
    }

    /// Overall completion in [0, 100], all steps weighted equally.
    pub fn percent(&self) -> f64 {
        if self.state == TaskState::Completed {
            return 100.0;
        }
        if self.units_total == 0 {
            return 0.0;
        }
        let per_step = 100.0 / f64::from(self.step_count);
        let done_steps = f64::from(self.current_step.saturating_sub(1)) * per_step;
        let ratio = (self.units as f64 / self.units_total as f64).min(1.0);
        (done_steps + ratio * per_step).min(100.0)
    }
}
