use std::collections::VecDeque;
use std::io;
use std::sync::mpsc;
use std::sync::{Arc, Weak};
use std::thread::ThreadId;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tokio::runtime::Runtime;

use crate::{panic_payload_to_str, CancellationToken, TaskError};

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Low,
    Normal,
    High,
}

#[derive(Default)]
struct Queue {
    high: VecDeque<Job>,
    normal: VecDeque<Job>,
    low: VecDeque<Job>,
    /// Delayed jobs whose timer has not fired yet.
    delayed: usize,
    closed: bool,
    terminated: bool,
}

impl Queue {
    fn pop(&mut self) -> Option<Job> {
        self.high
            .pop_front()
            .or_else(|| self.normal.pop_front())
            .or_else(|| self.low.pop_front())
    }

    fn clear(&mut self) -> usize {
        let dropped = self.high.len() + self.normal.len() + self.low.len() + self.delayed;
        self.high.clear();
        self.normal.clear();
        self.low.clear();
        self.delayed = 0;
        dropped
    }
}

struct Shared {
    name: String,
    queue: Mutex<Queue>,
    available: Condvar,
    terminated: Condvar,
    thread_id: Mutex<Option<ThreadId>>,
    /// Drives delayed jobs. Taken on shutdown, which drops pending timers.
    timer: Mutex<Option<Runtime>>,
}

impl Shared {
    fn push(&self, priority: Priority, job: Job) -> Result<(), TaskError> {
        let mut queue = self.queue.lock();
        if queue.closed {
            return Err(TaskError::Closed);
        }
        match priority {
            Priority::High => queue.high.push_back(job),
            Priority::Normal => queue.normal.push_back(job),
            Priority::Low => queue.low.push_back(job),
        }
        self.available.notify_one();
        Ok(())
    }

    /// A delayed job's timer fired or was cancelled. Returns `false` once the
    /// executor is closed.
    fn settle_delayed(&self) -> bool {
        let mut queue = self.queue.lock();
        queue.delayed = queue.delayed.saturating_sub(1);
        !queue.closed
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.get_mut().take() {
            timer.shutdown_background();
        }
    }
}

fn build_timer(name: &str) -> io::Result<Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .enable_time()
        .thread_name(format!("{name}-timer"))
        .build()
}

/// A single named worker thread draining a priority queue.
///
/// Jobs run one at a time in priority order (`High`, then `Normal`, then
/// `Low`), FIFO within a priority. Delayed jobs are timed on a tokio runtime
/// owned by the executor and join the `Normal` queue once due. A panicking
/// job is logged and does not take the thread down.
#[derive(Clone)]
pub struct SerialExecutor {
    shared: Arc<Shared>,
}

impl SerialExecutor {
    pub fn spawn(name: impl Into<String>) -> io::Result<Self> {
        let name = name.into();
        let timer = build_timer(&name)?;
        let shared = Arc::new(Shared {
            name: name.clone(),
            queue: Mutex::new(Queue::default()),
            available: Condvar::new(),
            terminated: Condvar::new(),
            thread_id: Mutex::new(None),
            timer: Mutex::new(Some(timer)),
        });

        let worker = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name(name)
            .spawn(move || run(worker))?;
        *shared.thread_id.lock() = Some(handle.thread().id());

        Ok(Self { shared })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// `true` when called from this executor's worker thread.
    pub fn is_current(&self) -> bool {
        *self.shared.thread_id.lock() == Some(std::thread::current().id())
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.queue.lock().closed
    }

    pub fn schedule<F>(&self, priority: Priority, job: F) -> Result<(), TaskError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.push(priority, Box::new(job))
    }

    /// Schedule `job` on the `Normal` queue once `delay` has elapsed.
    pub fn schedule_after<F>(&self, delay: Duration, job: F) -> Result<(), TaskError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule_after_unless_cancelled(delay, CancellationToken::new(), job)
    }

    /// Like [`SerialExecutor::schedule_after`], but the job is dropped if
    /// `token` is cancelled before it is due.
    pub fn schedule_after_unless_cancelled<F>(
        &self,
        delay: Duration,
        token: CancellationToken,
        job: F,
    ) -> Result<(), TaskError>
    where
        F: FnOnce() + Send + 'static,
    {
        if token.is_cancelled() {
            return Ok(());
        }
        if delay.is_zero() {
            return self.schedule(Priority::Normal, job);
        }

        let timer = self.shared.timer.lock();
        let Some(timer) = timer.as_ref() else {
            return Err(TaskError::Closed);
        };
        {
            let mut queue = self.shared.queue.lock();
            if queue.closed {
                return Err(TaskError::Closed);
            }
            queue.delayed += 1;
        }

        let shared: Weak<Shared> = Arc::downgrade(&self.shared);
        timer.spawn(async move {
            let due = tokio::select! {
                _ = token.cancelled() => false,
                _ = tokio::time::sleep(delay) => true,
            };
            let Some(shared) = shared.upgrade() else {
                return;
            };
            if shared.settle_delayed() && due {
                let _ = shared.push(Priority::Normal, Box::new(job));
            }
        });
        Ok(())
    }

    /// Run `f` on the executor thread and wait for its result.
    ///
    /// Runs inline when already on the executor thread. With a `timeout`, the
    /// job keeps running after the deadline but the caller stops waiting.
    pub fn invoke_and_wait<T, F>(
        &self,
        priority: Priority,
        timeout: Option<Duration>,
        f: F,
    ) -> Result<T, TaskError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        if self.is_current() {
            return catch(&self.shared.name, f);
        }

        let (tx, rx) = mpsc::channel();
        let name = self.shared.name.clone();
        self.schedule(priority, move || {
            let _ = tx.send(catch(&name, f));
        })?;

        match timeout {
            Some(timeout) => match rx.recv_timeout(timeout) {
                Ok(result) => result,
                Err(mpsc::RecvTimeoutError::Timeout) => Err(TaskError::DeadlineExceeded(timeout)),
                Err(mpsc::RecvTimeoutError::Disconnected) => Err(TaskError::Closed),
            },
            None => rx.recv().unwrap_or(Err(TaskError::Closed)),
        }
    }

    /// Wait until every job queued before this call (delayed jobs excepted)
    /// has run.
    pub fn flush(&self) {
        if self.is_current() {
            return;
        }
        let _ = self.invoke_and_wait(Priority::Low, None, || ());
    }

    /// Stop accepting work and drop everything still queued, delayed jobs
    /// included. The job that is currently running, if any, completes.
    pub fn shutdown(&self) {
        {
            let mut queue = self.shared.queue.lock();
            if queue.closed {
                return;
            }
            queue.closed = true;
            let dropped = queue.clear();
            tracing::debug!(
                target: "tether.scheduler",
                executor = %self.shared.name,
                dropped,
                "executor shut down"
            );
            self.shared.available.notify_all();
        }
        if let Some(timer) = self.shared.timer.lock().take() {
            timer.shutdown_background();
        }
    }

    /// Wait for the worker thread to exit after [`SerialExecutor::shutdown`].
    pub fn await_termination(&self, timeout: Duration) -> bool {
        if self.is_current() {
            return false;
        }
        let deadline = Instant::now() + timeout;
        let mut queue = self.shared.queue.lock();
        while !queue.terminated {
            if self
                .shared
                .terminated
                .wait_until(&mut queue, deadline)
                .timed_out()
            {
                return queue.terminated;
            }
        }
        true
    }
}

impl std::fmt::Debug for SerialExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialExecutor")
            .field("name", &self.shared.name)
            .finish_non_exhaustive()
    }
}

fn catch<T, F>(executor: &str, f: F) -> Result<T, TaskError>
where
    F: FnOnce() -> T,
{
    std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)).map_err(|panic| {
        let message = panic_payload_to_str(&*panic);
        tracing::error!(
            target: "tether.scheduler",
            executor,
            panic = %message,
            "task panicked"
        );
        TaskError::Panicked
    })
}

fn run(shared: Arc<Shared>) {
    loop {
        let job = {
            let mut queue = shared.queue.lock();
            loop {
                if queue.closed {
                    break None;
                }
                if let Some(job) = queue.pop() {
                    break Some(job);
                }
                shared.available.wait(&mut queue);
            }
        };

        let Some(job) = job else {
            break;
        };
        let _ = catch(&shared.name, job);
    }

    let mut queue = shared.queue.lock();
    queue.clear();
    queue.terminated = true;
    shared.terminated.notify_all();
}
