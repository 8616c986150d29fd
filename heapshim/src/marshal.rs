//! Cross-thread marshalling onto the isolate's owning thread.
//!
//! All heap mutation happens on the owning thread. Other threads hand work
//! over as queued tasks: `run_async` enqueues and returns, `run_sync`
//! enqueues and blocks on a per-call condition variable until the owner has
//! drained past the task. At most one wake notification is outstanding at a
//! time; the owner clears the flag when its queue runs dry.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, ThreadId};

use log::trace;
use parking_lot::{Condvar, Mutex};

use crate::isolate::Isolate;

pub type Task = Box<dyn FnOnce(&mut Isolate) + Send>;
pub type Waker = Box<dyn Fn() + Send + Sync>;

struct DoneSignal {
    done: Mutex<bool>,
    cond: Condvar,
}

struct QueuedTask {
    run: Task,
    signal: Option<Arc<DoneSignal>>,
}

struct QueueState {
    tasks: VecDeque<QueuedTask>,
    wake_posted: bool,
}

pub struct TaskQueue {
    owner: ThreadId,
    state: Mutex<QueueState>,
    waker: Mutex<Option<Waker>>,
}

impl TaskQueue {
    pub(crate) fn new() -> Arc<TaskQueue> {
        Arc::new(TaskQueue {
            owner: thread::current().id(),
            state: Mutex::new(QueueState {
                tasks: VecDeque::new(),
                wake_posted: false,
            }),
            waker: Mutex::new(None),
        })
    }

    #[inline]
    pub fn is_owner_thread(&self) -> bool {
        thread::current().id() == self.owner
    }

    /// Install the callback used to nudge the owning thread's run loop when
    /// work arrives. Replaces any previous waker.
    pub fn set_waker(&self, waker: Waker) {
        *self.waker.lock() = Some(waker);
    }

    fn enqueue(&self, task: QueuedTask) {
        let post = {
            let mut state = self.state.lock();
            state.tasks.push_back(task);
            !std::mem::replace(&mut state.wake_posted, true)
        };
        if post {
            if let Some(waker) = &*self.waker.lock() {
                waker();
            }
        }
    }

    /// Enqueue without blocking; the task runs on the next drain.
    pub fn run_async(&self, task: Task) {
        self.enqueue(QueuedTask {
            run: task,
            signal: None,
        });
    }

    /// Enqueue and block until the owning thread has run the task. Calling
    /// this on the owning thread would deadlock; owner-thread callers run
    /// inline through [`Isolate::run_sync`].
    pub fn run_sync(&self, task: Task) {
        assert!(
            !self.is_owner_thread(),
            "synchronous marshalling from the owning thread"
        );
        let signal = Arc::new(DoneSignal {
            done: Mutex::new(false),
            cond: Condvar::new(),
        });
        self.enqueue(QueuedTask {
            run: task,
            signal: Some(Arc::clone(&signal)),
        });
        let mut done = signal.done.lock();
        while !*done {
            signal.cond.wait(&mut done);
        }
    }

    pub(crate) fn drain(&self, isolate: &mut Isolate) {
        assert!(self.is_owner_thread(), "draining off the owning thread");
        loop {
            let task = {
                let mut state = self.state.lock();
                match state.tasks.pop_front() {
                    Some(task) => task,
                    None => {
                        state.wake_posted = false;
                        break;
                    }
                }
            };
            (task.run)(isolate);
            if let Some(signal) = task.signal {
                *signal.done.lock() = true;
                signal.cond.notify_one();
            }
        }
        trace!("isolate {}: task queue drained", isolate.id());
    }
}

impl Isolate {
    /// Execute `f` with the isolate, inline. The owning thread is the only
    /// place an exclusive isolate reference can exist, so this asserts
    /// thread affinity and runs directly.
    pub fn run_sync<R>(&mut self, f: impl FnOnce(&mut Isolate) -> R) -> R {
        assert!(
            self.queue.is_owner_thread(),
            "isolate touched off its owning thread"
        );
        f(self)
    }

    /// Run every queued task FIFO, then honor any collection request a task
    /// left behind.
    pub fn drain_tasks(&mut self) {
        let queue = self.queue_handle();
        queue.drain(self);
        if self.pending_gc {
            self.pending_gc = false;
            self.collect_garbage();
        }
    }
}
