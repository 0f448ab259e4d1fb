// Condition variable built on the scheduler's block/wake primitives
use alloc::collections::VecDeque;
use spin::Mutex;

use crate::process::scheduler::{Scheduler, ThreadId};

/// Queue of execution contexts waiting for a condition guarded by some
/// other `spin::Mutex`.
///
/// A waiter registers itself while still holding the guarding lock and the
/// notifier changes the condition under that same lock before notifying, so
/// a notification can never slip in between the check and the block.
#[derive(Debug, Default)]
pub struct Condvar {
    wait_queue: Mutex<VecDeque<ThreadId>>,
}

impl Condvar {
    pub const fn new() -> Self {
        Self {
            wait_queue: Mutex::new(VecDeque::new()),
        }
    }

    /// Block until `cond` yields `Some`, evaluating it under `lock` each time
    /// the caller is woken.
    pub fn wait_until<T, R, F>(&self, lock: &Mutex<T>, scheduler: &dyn Scheduler, mut cond: F) -> R
    where
        F: FnMut(&mut T) -> Option<R>,
    {
        let me = scheduler.current();
        loop {
            let mut guarded = lock.lock();
            if let Some(res) = cond(&mut *guarded) {
                return res;
            }
            {
                let mut queue = self.wait_queue.lock();
                if !queue.contains(&me) {
                    queue.push_back(me);
                }
            }
            drop(guarded);
            scheduler.block_current();
        }
    }

    /// Wake every waiting context. Returns how many were woken.
    pub fn notify_all(&self, scheduler: &dyn Scheduler) -> usize {
        let waiters: VecDeque<ThreadId> = core::mem::take(&mut *self.wait_queue.lock());
        let count = waiters.len();
        for thread in waiters {
            scheduler.wake(thread);
        }
        count
    }

    pub fn waiter_count(&self) -> usize {
        self.wait_queue.lock().len()
    }
}
