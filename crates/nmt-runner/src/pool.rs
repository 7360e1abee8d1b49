use crate::work::{CancelFlag, TaskContext, WorkError};
use crossbeam_channel::{select, unbounded, Receiver, Sender};
use std::any::Any;
use std::fmt;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle};
use std::time::Instant;
use thiserror::Error;

pub type Task = Box<dyn FnOnce(&TaskContext<'_>) -> Result<(), WorkError> + Send + 'static>;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("worker pool is closed for submission")]
    Closed,
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] io::Error),
}

/// A task that returned an error or panicked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    pub worker: String,
    pub message: String,
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on {}", self.message, self.worker)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AwaitOutcome {
    Completed,
    TimedOut,
    Interrupted,
    Failed(TaskFailure),
}

enum WorkerEvent {
    Failed(TaskFailure),
    Exited,
}

/// Fixed set of named worker threads draining one shared task queue.
pub struct WorkerPool {
    sender: Option<Sender<Task>>,
    queue: Receiver<Task>,
    events: Receiver<WorkerEvent>,
    cancel: CancelFlag,
    handles: Vec<JoinHandle<()>>,
    live_workers: usize,
}

impl WorkerPool {
    pub fn new(worker_count: usize) -> Result<Self, PoolError> {
        let (task_tx, task_rx) = unbounded::<Task>();
        let (event_tx, event_rx) = unbounded::<WorkerEvent>();
        let cancel = CancelFlag::new();
        let mut handles = Vec::with_capacity(worker_count);
        for idx in 0..worker_count {
            let name = format!("nmt-worker-{}", idx);
            let tasks = task_rx.clone();
            let events = event_tx.clone();
            let worker_cancel = cancel.clone();
            let thread_name = name.clone();
            let handle = thread::Builder::new()
                .name(thread_name)
                .spawn(move || worker_loop(&name, tasks, events, worker_cancel))
                .map_err(PoolError::Spawn)?;
            handles.push(handle);
        }
        Ok(Self {
            sender: Some(task_tx),
            queue: task_rx,
            events: event_rx,
            cancel,
            live_workers: handles.len(),
            handles,
        })
    }

    pub fn submit<F>(&self, task: F) -> Result<(), PoolError>
    where
        F: FnOnce(&TaskContext<'_>) -> Result<(), WorkError> + Send + 'static,
    {
        let sender = self.sender.as_ref().ok_or(PoolError::Closed)?;
        sender
            .send(Box::new(task))
            .map_err(|_| PoolError::Closed)
    }

    /// Stops accepting tasks. Queued tasks still run.
    pub fn close_for_submission(&mut self) {
        self.sender.take();
    }

    /// Tasks queued but not yet picked up by a worker.
    #[cfg(test)]
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    #[cfg(test)]
    pub fn await_completion(&mut self, timeout: std::time::Duration, interrupt: &Receiver<()>) -> AwaitOutcome {
        self.await_until(Instant::now() + timeout, interrupt)
    }

    /// Blocks until every worker has drained the queue and exited, the
    /// deadline passes, a task fails, or `interrupt` fires. Workers only exit
    /// once the pool is closed for submission.
    pub fn await_until(&mut self, deadline: Instant, interrupt: &Receiver<()>) -> AwaitOutcome {
        let timer = crossbeam_channel::at(deadline);
        let disconnected = crossbeam_channel::never();
        let mut interrupt_open = true;
        loop {
            if self.live_workers == 0 {
                return AwaitOutcome::Completed;
            }
            let source = if interrupt_open {
                interrupt
            } else {
                &disconnected
            };
            select! {
                recv(self.events) -> event => match event {
                    Ok(WorkerEvent::Exited) => self.live_workers -= 1,
                    Ok(WorkerEvent::Failed(failure)) => return AwaitOutcome::Failed(failure),
                    Err(_) => self.live_workers = 0,
                },
                recv(source) -> signal => match signal {
                    Ok(()) => return AwaitOutcome::Interrupted,
                    Err(_) => interrupt_open = false,
                },
                recv(timer) -> _ => return AwaitOutcome::TimedOut,
            }
        }
    }

    /// Signals in-flight tasks to stop and discards queued ones. Returns the
    /// number of discarded tasks. Tasks already running may still finish.
    pub fn force_cancel_remaining(&mut self) -> usize {
        self.sender.take();
        let discarded = self.queue.try_iter().count();
        self.cancel.cancel();
        discarded
    }

    #[cfg(test)]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Reaps worker threads. Only meaningful after [`AwaitOutcome::Completed`];
    /// otherwise this blocks on whatever the workers are still doing.
    pub fn join(self) {
        for handle in self.handles {
            let _ = handle.join();
        }
    }
}

fn worker_loop(name: &str, tasks: Receiver<Task>, events: Sender<WorkerEvent>, cancel: CancelFlag) {
    let ctx = TaskContext {
        worker: name,
        cancel: &cancel,
    };
    for task in tasks.iter() {
        if cancel.is_cancelled() {
            break;
        }
        let failure = match panic::catch_unwind(AssertUnwindSafe(|| task(&ctx))) {
            Ok(Ok(())) | Ok(Err(WorkError::Cancelled)) => None,
            Ok(Err(err)) => Some(err.to_string()),
            Err(payload) => Some(format!("task panicked: {}", panic_message(payload.as_ref()))),
        };
        if let Some(message) = failure {
            let _ = events.send(WorkerEvent::Failed(TaskFailure {
                worker: name.to_string(),
                message,
            }));
        }
    }
    let _ = events.send(WorkerEvent::Exited);
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    const GENEROUS: Duration = Duration::from_secs(30);

    #[test]
    fn runs_every_submitted_task() {
        let mut pool = WorkerPool::new(4).expect("pool");
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..50 {
            let done = Arc::clone(&done);
            pool.submit(move |_ctx: &TaskContext<'_>| {
                done.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .expect("submit");
        }
        pool.close_for_submission();
        let outcome = pool.await_completion(GENEROUS, &crossbeam_channel::never());
        assert_eq!(outcome, AwaitOutcome::Completed);
        assert_eq!(done.load(Ordering::SeqCst), 50);
        pool.join();
    }

    #[test]
    fn concurrency_is_bounded_by_worker_count() {
        let mut pool = WorkerPool::new(3).expect("pool");
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let names = Arc::new(Mutex::new(HashSet::new()));
        for _ in 0..30 {
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            let names = Arc::clone(&names);
            pool.submit(move |ctx: &TaskContext<'_>| {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                names.lock().expect("names").insert(ctx.worker.to_string());
                thread::sleep(Duration::from_millis(5));
                active.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            })
            .expect("submit");
        }
        pool.close_for_submission();
        assert_eq!(
            pool.await_completion(GENEROUS, &crossbeam_channel::never()),
            AwaitOutcome::Completed
        );
        assert!(peak.load(Ordering::SeqCst) <= 3);
        let names = names.lock().expect("names");
        assert!(names.iter().all(|n| n.starts_with("nmt-worker-")), "{:?}", names);
        pool.join();
    }

    #[test]
    fn submit_after_close_is_rejected() {
        let mut pool = WorkerPool::new(1).expect("pool");
        pool.close_for_submission();
        let err = pool
            .submit(|_ctx: &TaskContext<'_>| Ok(()))
            .expect_err("closed");
        assert!(matches!(err, PoolError::Closed));
    }

    #[test]
    fn failure_is_reported_and_other_tasks_still_run() {
        let mut pool = WorkerPool::new(2).expect("pool");
        let done = Arc::new(AtomicUsize::new(0));
        pool.submit(|_ctx: &TaskContext<'_>| Err(WorkError::Failed("bad frame".to_string())))
            .expect("submit");
        pool.submit(|_ctx: &TaskContext<'_>| panic!("native crash"))
            .expect("submit");
        for _ in 0..10 {
            let done = Arc::clone(&done);
            pool.submit(move |_ctx: &TaskContext<'_>| {
                done.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .expect("submit");
        }
        pool.close_for_submission();

        let never = crossbeam_channel::never();
        let mut failures = Vec::new();
        loop {
            match pool.await_completion(GENEROUS, &never) {
                AwaitOutcome::Failed(failure) => failures.push(failure.message),
                AwaitOutcome::Completed => break,
                other => panic!("unexpected outcome {:?}", other),
            }
        }
        failures.sort();
        assert_eq!(failures.len(), 2);
        assert_eq!(failures[0], "bad frame");
        assert_eq!(failures[1], "task panicked: native crash");
        assert_eq!(done.load(Ordering::SeqCst), 10);
        pool.join();
    }

    #[test]
    fn cancelled_outcome_is_not_a_failure() {
        let mut pool = WorkerPool::new(1).expect("pool");
        pool.submit(|_ctx: &TaskContext<'_>| Err(WorkError::Cancelled))
            .expect("submit");
        pool.close_for_submission();
        assert_eq!(
            pool.await_completion(GENEROUS, &crossbeam_channel::never()),
            AwaitOutcome::Completed
        );
    }

    #[test]
    fn timeout_then_force_cancel_discards_queue() {
        let mut pool = WorkerPool::new(1).expect("pool");
        let started = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let started = Arc::clone(&started);
            pool.submit(move |ctx: &TaskContext<'_>| {
                started.fetch_add(1, Ordering::SeqCst);
                while !ctx.cancel.is_cancelled() {
                    thread::sleep(Duration::from_millis(2));
                }
                ctx.check_cancelled()
            })
            .expect("submit");
        }
        pool.close_for_submission();
        let outcome = pool.await_completion(Duration::from_millis(50), &crossbeam_channel::never());
        assert_eq!(outcome, AwaitOutcome::TimedOut);
        let discarded = pool.force_cancel_remaining();
        assert_eq!(discarded, 4);
        assert!(pool.is_cancelled());
        assert_eq!(pool.pending(), 0);
        assert_eq!(
            pool.await_completion(GENEROUS, &crossbeam_channel::never()),
            AwaitOutcome::Completed
        );
        assert_eq!(started.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn interrupt_wakes_the_waiter() {
        let mut pool = WorkerPool::new(1).expect("pool");
        pool.submit(|ctx: &TaskContext<'_>| {
            while !ctx.cancel.is_cancelled() {
                thread::sleep(Duration::from_millis(2));
            }
            Err(WorkError::Cancelled)
        })
        .expect("submit");
        pool.close_for_submission();
        let (tx, rx) = crossbeam_channel::bounded(1);
        tx.send(()).expect("interrupt");
        assert_eq!(pool.await_completion(GENEROUS, &rx), AwaitOutcome::Interrupted);
        pool.force_cancel_remaining();
    }

    #[test]
    fn dropped_interrupt_source_is_ignored() {
        let mut pool = WorkerPool::new(2).expect("pool");
        pool.submit(|_ctx: &TaskContext<'_>| {
            thread::sleep(Duration::from_millis(20));
            Ok(())
        })
        .expect("submit");
        pool.close_for_submission();
        let (tx, rx) = crossbeam_channel::bounded::<()>(1);
        drop(tx);
        assert_eq!(pool.await_completion(GENEROUS, &rx), AwaitOutcome::Completed);
    }
}
