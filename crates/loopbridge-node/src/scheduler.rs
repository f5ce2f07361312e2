//! Delivery scheduler -- uniform artificial one-way delay.
//!
//! Every node delivers remote traffic at `sent_at + delay` on the shared
//! [`SyncClock`], so all participants see the same latency whatever path the
//! bytes actually took. Real transit time is topped up, never reduced.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::clock::SyncClock;

pub type Task = Box<dyn FnOnce() + Send + 'static>;

struct Scheduled {
    target_ms: i64,
    seq: u64,
    task: Task,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.target_ms == other.target_ms && self.seq == other.seq
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    // Reversed so the max-heap pops the earliest (target, seq) first.
    fn cmp(&self, other: &Self) -> Ordering {
        (other.target_ms, other.seq).cmp(&(self.target_ms, self.seq))
    }
}

#[derive(Default)]
struct Queue {
    heap: BinaryHeap<Scheduled>,
    next_seq: u64,
    polling: bool,
    /// Some caller is running due tasks; everyone else leaves them to it.
    draining: bool,
}

impl Queue {
    fn push(&mut self, target_ms: i64, task: Task) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Scheduled {
            target_ms,
            seq,
            task,
        });
    }

    fn pop_next_due(&mut self, now_ms: i64) -> Option<Task> {
        if self.heap.peek().is_some_and(|s| s.target_ms <= now_ms) {
            self.heap.pop().map(|s| s.task)
        } else {
            None
        }
    }
}

/// Time-ordered delayed execution. Cheap to clone; clones share one queue.
///
/// At most one caller runs tasks at a time, so tasks run strictly in
/// `(target, enqueue order)` whichever thread enqueued them.
#[derive(Clone)]
pub struct Scheduler {
    clock: SyncClock,
    tick: Duration,
    queue: Arc<Mutex<Queue>>,
}

impl Scheduler {
    pub fn new(clock: SyncClock, tick: Duration) -> Self {
        Self {
            clock,
            tick,
            queue: Arc::new(Mutex::new(Queue::default())),
        }
    }

    pub fn clock(&self) -> &SyncClock {
        &self.clock
    }

    pub fn tick(&self) -> Duration {
        self.tick
    }

    /// Tasks still waiting to run.
    pub fn pending(&self) -> usize {
        self.lock().heap.len()
    }

    /// Run `task` at `target_ms`. A task whose time has already come runs
    /// before this returns, after any earlier task that is also due. If
    /// another caller is already running due tasks, that caller runs it
    /// instead, still in order.
    ///
    /// Tasks may enqueue further tasks. Must be called from within a tokio
    /// runtime when `target_ms` lies in the future.
    pub fn enqueue<F>(&self, target_ms: i64, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let now = self.clock.now_ms();
        let mut queue = self.lock();
        queue.push(target_ms, Box::new(task));

        if target_ms <= now {
            if queue.draining {
                return;
            }
            queue.draining = true;
            drop(queue);
            self.drain();
            return;
        }

        if !queue.polling {
            queue.polling = true;
            drop(queue);
            self.spawn_poller();
        }
    }

    /// Run due tasks one at a time until none is due. The caller must have
    /// set `draining`; it is cleared under the same lock that finds the
    /// queue has nothing due, so no due task is ever left behind.
    fn drain(&self) {
        loop {
            let task = {
                let mut queue = self.lock();
                match queue.pop_next_due(self.clock.now_ms()) {
                    Some(task) => task,
                    None => {
                        queue.draining = false;
                        return;
                    }
                }
            };
            task();
        }
    }

    /// Claim the right to drain. `false` when someone else holds it.
    fn begin_drain(&self) -> bool {
        let mut queue = self.lock();
        !std::mem::replace(&mut queue.draining, true)
    }

    fn spawn_poller(&self) {
        let scheduler = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(scheduler.tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if scheduler.begin_drain() {
                    scheduler.drain();
                }
                let mut queue = scheduler.lock();
                if queue.heap.is_empty() && !queue.draining {
                    queue.polling = false;
                    tracing::trace!("scheduler: queue drained, poller stopping");
                    return;
                }
            }
        });
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
