use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

use crate::model::TaskInstance;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskGroup {
    pub id: i32,
    #[serde(default)]
    pub name: String,
    pub capacity: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireResult {
    Granted,
    Queued,
    /// The task does not belong to a registered task group.
    NotRequired,
}

/// A slot handed to a waiter by [`TaskGroupCoordinator::release`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotGrant {
    pub task_group_id: i32,
    pub task_instance_id: i64,
    pub workflow_instance_id: i64,
}

#[derive(Debug)]
struct Waiter {
    task_instance_id: i64,
    workflow_instance_id: i64,
    group_priority: Option<i32>,
    first_submit_time: DateTime<Utc>,
    seq: u64,
}

impl Waiter {
    /// Higher group priority first (absent is lowest), then older, then FIFO.
    fn sort_key(&self) -> (Reverse<Option<i32>>, DateTime<Utc>, u64) {
        (Reverse(self.group_priority), self.first_submit_time, self.seq)
    }
}

#[derive(Debug)]
struct Slot {
    name: String,
    capacity: usize,
    holders: HashSet<i64>,
    waiters: Vec<Waiter>,
}

impl Slot {
    fn check_invariants(&self, id: i32) {
        assert!(
            self.holders.len() <= self.capacity,
            "task group {} holds {} slots with capacity {}",
            id,
            self.holders.len(),
            self.capacity
        );
    }

    fn grant_next(&mut self, id: i32) -> Option<SlotGrant> {
        if self.holders.len() >= self.capacity {
            return None;
        }
        let index = self
            .waiters
            .iter()
            .enumerate()
            .min_by_key(|(_, w)| w.sort_key())
            .map(|(i, _)| i)?;
        let waiter = self.waiters.remove(index);
        assert!(
            self.holders.insert(waiter.task_instance_id),
            "waiter {} of task group {} already holds a slot",
            waiter.task_instance_id,
            id
        );
        self.check_invariants(id);
        Some(SlotGrant {
            task_group_id: id,
            task_instance_id: waiter.task_instance_id,
            workflow_instance_id: waiter.workflow_instance_id,
        })
    }
}

/// Bounds how many task instances of one task group hold a slot at the same time.
/// Acquire never blocks: callers that get [`AcquireResult::Queued`] are told about
/// their slot later through the [`SlotGrant`] returned by a release.
pub struct TaskGroupCoordinator {
    groups: Mutex<HashMap<i32, Slot>>,
    seq: AtomicU64,
}

impl Default for TaskGroupCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskGroupCoordinator {
    pub fn new() -> Self {
        Self {
            groups: Mutex::new(HashMap::new()),
            seq: AtomicU64::new(0),
        }
    }

    /// Registers a group, or changes the capacity of an existing one. Existing holders keep
    /// their slots; waiters that fit into added capacity are returned as grants.
    pub fn register_task_group(&self, group: TaskGroup) -> Vec<SlotGrant> {
        let mut groups = self.groups.lock();
        let slot = groups.entry(group.id).or_insert_with(|| Slot {
            name: group.name.clone(),
            capacity: group.capacity,
            holders: HashSet::new(),
            waiters: Vec::new(),
        });
        slot.name = group.name;
        if group.capacity < slot.holders.len() {
            warn!(
                task_group_id = group.id,
                requested = group.capacity,
                held = slot.holders.len(),
                "Capacity below current holders, keeping it at the held count"
            );
        }
        slot.capacity = group.capacity.max(slot.holders.len());
        info!(task_group_id = group.id, name = %slot.name, capacity = slot.capacity, "Task group registered");

        let mut grants = Vec::new();
        while let Some(grant) = slot.grant_next(group.id) {
            grants.push(grant);
        }
        grants
    }

    pub fn acquire(&self, task: &TaskInstance) -> AcquireResult {
        let Some(group_id) = task.task_group_id else {
            return AcquireResult::NotRequired;
        };
        let mut groups = self.groups.lock();
        let Some(slot) = groups.get_mut(&group_id) else {
            warn!(task_group_id = group_id, task_instance_id = task.id, "Unknown task group, dispatching without a slot");
            return AcquireResult::NotRequired;
        };

        if slot.holders.contains(&task.id) {
            return AcquireResult::Granted;
        }
        if slot.waiters.iter().any(|w| w.task_instance_id == task.id) {
            return AcquireResult::Queued;
        }

        if slot.holders.len() < slot.capacity {
            slot.holders.insert(task.id);
            slot.check_invariants(group_id);
            debug!(task_group_id = group_id, task_instance_id = task.id, held = slot.holders.len(), "Task group slot granted");
            AcquireResult::Granted
        } else {
            slot.waiters.push(Waiter {
                task_instance_id: task.id,
                workflow_instance_id: task.workflow_instance_id,
                group_priority: task.task_group_priority,
                first_submit_time: task.first_submit_time,
                seq: self.seq.fetch_add(1, Ordering::Relaxed),
            });
            info!(
                task_group_id = group_id,
                task_instance_id = task.id,
                waiting = slot.waiters.len(),
                "Task group full, task queued for a slot"
            );
            AcquireResult::Queued
        }
    }

    /// Frees the slot held by `task` and hands it to at most one waiter. Releasing a slot
    /// that is not held is a no-op.
    pub fn release(&self, task: &TaskInstance) -> Option<SlotGrant> {
        self.release_slot(task.task_group_id?, task.id)
    }

    /// Same as [`Self::release`], for callers that only know the ids.
    pub fn release_slot(&self, group_id: i32, task_instance_id: i64) -> Option<SlotGrant> {
        let mut groups = self.groups.lock();
        let slot = groups.get_mut(&group_id)?;

        if !slot.holders.remove(&task_instance_id) {
            return None;
        }
        debug!(task_group_id = group_id, task_instance_id, "Task group slot released");

        let grant = slot.grant_next(group_id);
        if let Some(grant) = &grant {
            info!(
                task_group_id = group_id,
                task_instance_id = grant.task_instance_id,
                workflow_instance_id = grant.workflow_instance_id,
                "Task group slot handed to waiter"
            );
        }
        grant
    }

    /// Drops `task` from the wait list, or releases its slot if it holds one.
    pub fn forget(&self, task: &TaskInstance) -> Option<SlotGrant> {
        let group_id = task.task_group_id?;
        {
            let mut groups = self.groups.lock();
            let slot = groups.get_mut(&group_id)?;
            let before = slot.waiters.len();
            slot.waiters.retain(|w| w.task_instance_id != task.id);
            if slot.waiters.len() != before {
                return None;
            }
        }
        self.release(task)
    }

    pub fn held_count(&self, group_id: i32) -> usize {
        self.groups
            .lock()
            .get(&group_id)
            .map(|s| s.holders.len())
            .unwrap_or(0)
    }

    pub fn waiting_count(&self, group_id: i32) -> usize {
        self.groups
            .lock()
            .get(&group_id)
            .map(|s| s.waiters.len())
            .unwrap_or(0)
    }

    pub fn is_holder(&self, group_id: i32, task_instance_id: i64) -> bool {
        self.groups
            .lock()
            .get(&group_id)
            .map(|s| s.holders.contains(&task_instance_id))
            .unwrap_or(false)
    }
}
