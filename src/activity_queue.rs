//! Per-thread deferred-work queues.
//!
//! The activity callback runs on a runtime-owned worker thread, but the
//! sink writers are not reentrant across threads, so completed device
//! operations must be emitted on the thread that issued the originating
//! host call. The worker packages each emission as a closure and appends it
//! to the originating thread's queue; that thread drains its own queue at
//! every host-call boundary. Unload performs one final drain of every queue
//! so that completions delivered after application exit still reach the
//! sinks.

use std::cell::Cell;
use std::sync::{Arc, LazyLock};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

pub use crate::correlation::Tid;

type Task = Box<dyn FnOnce() + Send>;

pub struct TaskQueue {
    tasks: Mutex<Vec<Task>>,
}

impl TaskQueue {
    fn new() -> TaskQueue {
        TaskQueue {
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, task: Task) {
        self.tasks.lock().push(task);
    }

    /// Moves the queue out under the lock and runs every closure outside
    /// it, in FIFO order.
    pub fn drain(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            task();
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.tasks.lock().len()
    }
}

static QUEUES: LazyLock<Mutex<FxHashMap<Tid, Arc<TaskQueue>>>> =
    LazyLock::new(|| Mutex::new(FxHashMap::default()));

thread_local! {
    static CURRENT_TID: Cell<Tid> = const { Cell::new(0) };
}

pub fn current_tid() -> Tid {
    CURRENT_TID.with(|cached| {
        let mut tid = cached.get();
        if tid == 0 {
            tid = nix::unistd::gettid().as_raw();
            cached.set(tid);
        }
        tid
    })
}

pub fn queue_for(tid: Tid) -> Arc<TaskQueue> {
    QUEUES.lock().entry(tid).or_insert_with(|| Arc::new(TaskQueue::new())).clone()
}

/// Drains the calling thread's queue.
pub fn drain_current() {
    let queue = {
        let queues = QUEUES.lock();
        queues.get(&current_tid()).cloned()
    };
    if let Some(queue) = queue {
        queue.drain();
    }
}

/// Drains every registered queue on the calling thread. Used at unload,
/// after the issuing threads may already be gone.
pub fn drain_all() {
    let queues: Vec<Arc<TaskQueue>> = QUEUES.lock().values().cloned().collect();
    for queue in queues {
        queue.drain();
    }
}
