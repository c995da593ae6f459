//! Read-only view of pipeline activity
//!
//! Everything here is read from atomics the queue and workers update, so
//! taking a snapshot never waits on a lock.

use crate::queue::QueueCounters;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

/// Lifecycle state of one worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum WorkerState {
    Idle = 0,
    Claimed = 1,
    Processing = 2,
    Committing = 3,
    Retrying = 4,
    Stopped = 5,
}

impl WorkerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => WorkerState::Idle,
            1 => WorkerState::Claimed,
            2 => WorkerState::Processing,
            3 => WorkerState::Committing,
            4 => WorkerState::Retrying,
            _ => WorkerState::Stopped,
        }
    }

    pub fn is_busy(&self) -> bool {
        !matches!(self, WorkerState::Idle | WorkerState::Stopped)
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkerState::Idle => "idle",
            WorkerState::Claimed => "claimed",
            WorkerState::Processing => "processing",
            WorkerState::Committing => "committing",
            WorkerState::Retrying => "retrying",
            WorkerState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Shared worker state slots plus the pool's running flag
#[derive(Debug)]
pub struct WorkerBoard {
    slots: Vec<AtomicU8>,
    running: AtomicBool,
}

impl WorkerBoard {
    pub fn new(workers: usize) -> Self {
        Self {
            slots: (0..workers)
                .map(|_| AtomicU8::new(WorkerState::Stopped as u8))
                .collect(),
            running: AtomicBool::new(false),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn set(&self, worker: usize, state: WorkerState) {
        if let Some(slot) = self.slots.get(worker) {
            slot.store(state as u8, Ordering::Release);
        }
    }

    pub fn get(&self, worker: usize) -> Option<WorkerState> {
        self.slots
            .get(worker)
            .map(|slot| WorkerState::from_u8(slot.load(Ordering::Acquire)))
    }

    pub fn states(&self) -> Vec<WorkerState> {
        self.slots
            .iter()
            .map(|slot| WorkerState::from_u8(slot.load(Ordering::Acquire)))
            .collect()
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

/// Coarse state for dashboards
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisplayState {
    Idle,
    Processing,
}

/// Point-in-time pipeline status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub queued_count: usize,
    pub processing_count: usize,
    pub failed_count: usize,
    pub is_running: bool,
    pub workers: Vec<WorkerState>,
}

impl StatusSnapshot {
    /// `Processing` while anything is queued or in flight
    pub fn display_state(&self) -> DisplayState {
        if self.queued_count > 0 || self.processing_count > 0 {
            DisplayState::Processing
        } else {
            DisplayState::Idle
        }
    }

    /// The failure log is not empty
    pub fn has_warning(&self) -> bool {
        self.failed_count > 0
    }
}

/// Builds status snapshots
#[derive(Debug, Clone)]
pub struct StatusReporter {
    counters: Arc<QueueCounters>,
    board: Arc<WorkerBoard>,
}

impl StatusReporter {
    pub fn new(counters: Arc<QueueCounters>, board: Arc<WorkerBoard>) -> Self {
        Self { counters, board }
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            queued_count: self.counters.queued(),
            processing_count: self.counters.claimed(),
            failed_count: self.counters.failed(),
            is_running: self.board.is_running(),
            workers: self.board.states(),
        }
    }
}
