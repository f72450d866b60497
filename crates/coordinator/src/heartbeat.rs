//! Per-task progress heartbeats
//!
//! Only a material change (a new percent or a new note) counts as progress.
//! A worker that keeps echoing the same state accumulates
//! `no_progress_count` and eventually crosses the stuck threshold.

use ai_agent_common::TaskId;
use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

#[derive(Debug, Clone, PartialEq)]
pub struct HeartbeatRecord {
    pub started_at: Instant,
    pub last_progress_at: Instant,
    pub last_percent: Option<u8>,
    pub last_note: Option<String>,
    /// Consecutive reports without a material change
    pub no_progress_count: u32,
    pub reports: u64,
}

impl HeartbeatRecord {
    fn new(now: Instant) -> Self {
        Self {
            started_at: now,
            last_progress_at: now,
            last_percent: None,
            last_note: None,
            no_progress_count: 0,
            reports: 0,
        }
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_progress_at)
    }
}

pub struct HeartbeatMonitor {
    records: DashMap<TaskId, HeartbeatRecord>,
    stuck_threshold: Duration,
}

impl HeartbeatMonitor {
    pub fn new(stuck_threshold: Duration) -> Self {
        Self {
            records: DashMap::new(),
            stuck_threshold,
        }
    }

    /// Begin (or restart) tracking `task` from a clean record
    pub fn start(&self, task: &TaskId) {
        self.records
            .insert(task.clone(), HeartbeatRecord::new(Instant::now()));
    }

    /// Apply one progress report.
    ///
    /// Returns `Some(true)` on material progress, `Some(false)` for a stale
    /// repeat and `None` when the task is not tracked.
    pub fn report(&self, task: &TaskId, percent: Option<u8>, note: Option<&str>) -> Option<bool> {
        let mut record = self.records.get_mut(task)?;
        let percent = percent.map(|p| p.min(100));

        let percent_changed = percent.is_some() && percent != record.last_percent;
        let note_changed = note.is_some() && note != record.last_note.as_deref();

        record.reports += 1;
        if percent_changed || note_changed {
            if percent_changed {
                record.last_percent = percent;
            }
            if let Some(note) = note.filter(|_| note_changed) {
                record.last_note = Some(note.to_string());
            }
            record.last_progress_at = Instant::now();
            record.no_progress_count = 0;
            trace!("{} progress: {:?} {:?}", task, record.last_percent, record.last_note);
            Some(true)
        } else {
            record.no_progress_count += 1;
            Some(false)
        }
    }

    pub fn get(&self, task: &TaskId) -> Option<HeartbeatRecord> {
        self.records.get(task).map(|r| r.clone())
    }

    pub fn last_note(&self, task: &TaskId) -> Option<String> {
        self.records.get(task).and_then(|r| r.last_note.clone())
    }

    pub fn idle_for(&self, task: &TaskId) -> Option<Duration> {
        let now = Instant::now();
        self.records.get(task).map(|r| r.idle_for(now))
    }

    pub fn is_stuck(&self, task: &TaskId) -> bool {
        self.idle_for(task)
            .map_or(false, |idle| idle >= self.stuck_threshold)
    }

    /// Tracked tasks idle for at least the stuck threshold
    pub fn stuck_tasks(&self) -> Vec<TaskId> {
        let now = Instant::now();
        let mut stuck: Vec<TaskId> = self
            .records
            .iter()
            .filter(|r| r.idle_for(now) >= self.stuck_threshold)
            .map(|r| r.key().clone())
            .collect();
        stuck.sort();
        stuck
    }

    pub fn remove(&self, task: &TaskId) -> Option<HeartbeatRecord> {
        self.records.remove(task).map(|(_, r)| r)
    }

    pub fn stuck_threshold(&self) -> Duration {
        self.stuck_threshold
    }
}
