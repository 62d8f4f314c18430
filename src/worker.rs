//! Worker threads draining the shared job queue.

use crate::task::Task;
use crossbeam_channel::{Receiver, Sender, select};
use std::{
    fmt, panic,
    sync::Arc,
    thread::{self, JoinHandle},
};

/// A queued processing demand: `count` items from the given task.
#[derive(Debug)]
pub(crate) struct Job<T> {
    pub(crate) task: Arc<Task<T>>,
    pub(crate) count: usize,
}

/// ID identifying worker threads in a pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct WorkerId(pub(crate) u64);

/// A worker thread bound to a shared job queue. The worker keeps pulling
/// and running jobs until it is stopped or the queue is disconnected.
#[derive(Debug)]
pub(crate) struct Worker {
    id: WorkerId,
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

impl<T: Send + 'static> Job<T> {
    /// Runs the job. Transform failures are captured by the task itself;
    /// only structural failures surface here, and are logged.
    pub(crate) fn run(&self) {
        if let Err(error) = self.task.process(self.count) {
            log::error!("Processing job of {} items failed: {error}", self.count);
        }
    }
}

impl Worker {
    /// Spawns a new worker thread pulling jobs from the given queue.
    pub(crate) fn spawn<T: Send + 'static>(id: WorkerId, jobs: Receiver<Job<T>>) -> Self {
        let (stop, stop_receiver) = crossbeam_channel::bounded(1);
        let handle = thread::spawn(move || {
            log::trace!("Worker {id} spawned");
            loop {
                // A pending stop request takes precedence over queued jobs
                if stop_receiver.try_recv().is_ok() {
                    break;
                }
                select! {
                    recv(jobs) -> job => match job {
                        Ok(job) => {
                            if let Err(cause) =
                                panic::catch_unwind(panic::AssertUnwindSafe(|| job.run()))
                            {
                                log::error!("Job panicked: {cause:?}");
                            }
                        }
                        Err(_) => break,
                    },
                    recv(stop_receiver) -> _ => break,
                }
            }
            log::trace!("Worker {id} terminating");
        });
        Self { id, stop, handle }
    }

    /// Stops the worker after its current job, if any, and joins the thread.
    pub(crate) fn stop_and_join(self) {
        // The worker may already have exited on queue disconnect
        let _ = self.stop.send(());
        if let Err(error) = self.handle.join() {
            log::error!("Worker {} failed to join: {error:?}", self.id);
        }
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
