//! Single priority-queue scheduler driving choke cycling, throttle ticks, tracker timeouts and
//! per-connection keep-alives as one mechanism. A binary heap keyed by tick, with one scheduled
//! entry per task and `is_scheduled` semantics: rescheduling is idempotent (erase-then-insert).

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum TaskKind {
    ChokeCycle,
    ThrottleTick,
    TrackerTimeout,
    KeepAlive(u64),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct Entry {
    tick: u64,
    task: TaskKind,
}

impl Ord for Entry {
    fn cmp(&self, other: &Entry) -> std::cmp::Ordering {
        self.tick.cmp(&other.tick)
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Entry) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Time-ordered task queue. Time is injected as a `u64` microsecond tick rather than
/// `Instant`/`SystemTime`, so the whole scheduler is deterministically testable.
pub struct Scheduler {
    heap: BinaryHeap<Reverse<Entry>>,
    scheduled: HashMap<TaskKind, u64>,
}

impl Scheduler {
    pub fn new() -> Scheduler {
        Scheduler {
            heap: BinaryHeap::new(),
            scheduled: HashMap::new(),
        }
    }

    pub fn is_scheduled(&self, task: TaskKind) -> bool {
        self.scheduled.contains_key(&task)
    }

    /// Schedule `task` to fire at `tick`. Idempotent: rescheduling an already-scheduled task
    /// replaces its previous entry (erase-then-insert) rather than adding a duplicate.
    pub fn schedule(&mut self, task: TaskKind, tick: u64) {
        self.scheduled.insert(task, tick);
        self.heap.push(Reverse(Entry { tick, task }));
    }

    pub fn cancel(&mut self, task: TaskKind) {
        self.scheduled.remove(&task);
    }

    /// Pop every task whose scheduled tick is `<= now`, skipping stale heap entries left behind
    /// by a reschedule or cancellation.
    pub fn drain_due(&mut self, now: u64) -> Vec<TaskKind> {
        let mut due = Vec::new();
        while let Some(&Reverse(entry)) = self.heap.peek() {
            if entry.tick > now {
                break;
            }
            self.heap.pop();
            match self.scheduled.get(&entry.task) {
                Some(&current_tick) if current_tick == entry.tick => {
                    self.scheduled.remove(&entry.task);
                    due.push(entry.task);
                }
                _ => continue,
            }
        }
        due
    }
}

impl Default for Scheduler {
    fn default() -> Scheduler {
        Scheduler::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tasks_fire_in_tick_order() {
        let mut scheduler = Scheduler::new();
        scheduler.schedule(TaskKind::ThrottleTick, 100);
        scheduler.schedule(TaskKind::ChokeCycle, 50);
        let due = scheduler.drain_due(100);
        assert_eq!(due, vec![TaskKind::ChokeCycle, TaskKind::ThrottleTick]);
    }

    #[test]
    fn reschedule_is_idempotent() {
        let mut scheduler = Scheduler::new();
        scheduler.schedule(TaskKind::ChokeCycle, 10);
        scheduler.schedule(TaskKind::ChokeCycle, 20);
        let due_early = scheduler.drain_due(10);
        assert!(due_early.is_empty());
        let due_late = scheduler.drain_due(20);
        assert_eq!(due_late, vec![TaskKind::ChokeCycle]);
    }

    #[test]
    fn cancel_prevents_firing() {
        let mut scheduler = Scheduler::new();
        scheduler.schedule(TaskKind::TrackerTimeout, 10);
        scheduler.cancel(TaskKind::TrackerTimeout);
        assert!(scheduler.drain_due(10).is_empty());
    }
}
