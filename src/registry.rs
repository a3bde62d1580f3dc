//! In-process registry of crawl tasks.
//!
//! The registry caches what this process knows about each crawl job; the
//! crawl service stays the authority on true job state. Every mutation goes
//! through [`TaskRegistry::upsert`] or [`TaskRegistry::update`], which apply
//! a [`TaskPatch`] under the per-key lock of a [`DashMap`] entry, so a
//! progress update and a pause request on the same task can never overwrite
//! each other.
//!
//! Terminal statuses are sticky: once a task is `completed`, `stopped` or
//! `error`, later patches may still adjust counters but cannot move it back
//! to `running` or `paused`, nor replace its terminal status.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::sync::Arc;

use crate::models::{CrawlTask, TaskStatus};

/// A partial update to a [`CrawlTask`]. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskPatch {
    pub url: Option<String>,
    pub namespace: Option<String>,
    pub status: Option<TaskStatus>,
    pub pages_processed: Option<u64>,
    pub pages_total: Option<u64>,
    pub current_url: Option<String>,
    pub last_error: Option<String>,
    pub pages_indexed_delta: u64,
    pub ingestion_failures_delta: u64,
}

impl TaskPatch {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn progress(
        processed: Option<u64>,
        total: Option<u64>,
        current_url: Option<String>,
    ) -> Self {
        Self {
            pages_processed: processed,
            pages_total: total.filter(|t| *t > 0),
            current_url,
            ..Default::default()
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            last_error: Some(message.into()),
            ..Default::default()
        }
    }

    fn apply(self, task: &mut CrawlTask) {
        if let Some(url) = self.url {
            task.url = url;
        }
        if let Some(namespace) = self.namespace {
            task.namespace = namespace;
        }
        if let Some(processed) = self.pages_processed {
            // Progress events can arrive out of order relative to control calls.
            task.pages_processed = task.pages_processed.max(processed);
        }
        if self.pages_total.is_some() {
            task.pages_total = self.pages_total;
        }
        if self.current_url.is_some() {
            task.current_url = self.current_url;
        }
        if self.last_error.is_some() {
            task.last_error = self.last_error;
        }
        task.pages_indexed += self.pages_indexed_delta;
        task.ingestion_failures += self.ingestion_failures_delta;

        if let Some(status) = self.status {
            if !task.status.is_terminal() {
                task.status = status;
                if status.is_terminal() {
                    task.ended_at = Some(Utc::now());
                }
            }
        }
    }
}

/// Shared, cloneable task registry. Clones share the same storage.
#[derive(Debug, Clone, Default)]
pub struct TaskRegistry {
    tasks: Arc<DashMap<String, CrawlTask>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges `patch` into the task, creating it first if needed.
    /// Returns the snapshot after the update.
    pub fn upsert(&self, task_id: &str, patch: TaskPatch) -> CrawlTask {
        let mut entry = self
            .tasks
            .entry(task_id.to_string())
            .or_insert_with(|| CrawlTask::new(task_id));
        patch.apply(entry.value_mut());
        entry.value().clone()
    }

    /// Merges `patch` into an existing task. Unknown ids are left alone.
    pub fn update(&self, task_id: &str, patch: TaskPatch) -> Option<CrawlTask> {
        let mut task = self.tasks.get_mut(task_id)?;
        patch.apply(task.value_mut());
        Some(task.value().clone())
    }

    pub fn get(&self, task_id: &str) -> Option<CrawlTask> {
        self.tasks.get(task_id).map(|t| t.value().clone())
    }

    /// Tasks that are `running` or `paused`, oldest first.
    pub fn list_active(&self) -> Vec<CrawlTask> {
        let mut active: Vec<CrawlTask> = self
            .tasks
            .iter()
            .filter(|t| t.status.is_active())
            .map(|t| t.value().clone())
            .collect();
        active.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        active
    }

    /// Marks every active task with `status`, returning the affected ids.
    pub fn mark_all_active(&self, status: TaskStatus) -> Vec<String> {
        let mut affected = Vec::new();
        for mut task in self.tasks.iter_mut() {
            if task.status.is_active() {
                TaskPatch::status(status).apply(task.value_mut());
                affected.push(task.task_id.clone());
            }
        }
        affected
    }

    /// Drops terminal tasks that ended before `now - retention`.
    pub fn prune_finished(&self, retention: Duration) -> usize {
        self.prune_finished_before(Utc::now() - retention)
    }

    fn prune_finished_before(&self, cutoff: DateTime<Utc>) -> usize {
        let before = self.tasks.len();
        self.tasks.retain(|_, task| match task.ended_at {
            Some(ended) if task.status.is_terminal() => ended >= cutoff,
            _ => true,
        });
        before - self.tasks.len()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
