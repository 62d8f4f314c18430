//! Task nodes coupling an input stream, a transform and an output stream.

use crate::{
    channel::{ReadEnd, WriteEnd},
    pool::{PoolReadChannel, PoolShared},
};
use parking_lot::Mutex;
use std::{
    fmt, io,
    num::NonZeroUsize,
    sync::{
        Arc, OnceLock, Weak,
        atomic::{AtomicUsize, Ordering},
    },
};

/// The type of error produced by failing task transforms.
pub type TaskError = anyhow::Error;

/// ID identifying tasks registered in a [`Pool`](crate::pool::Pool).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub(crate) u64);

/// A unit of work that can be registered in a [`Pool`](crate::pool::Pool):
/// items read from the input stream are passed through the transform and the
/// results are written to an output stream allocated at registration.
///
/// Scheduling knobs (`min_count`, `max_chunksize`) are configured on the
/// owned task before it is handed to
/// [`Pool::add_task`](crate::pool::Pool::add_task).
#[derive(Debug)]
pub struct Task<T> {
    input: TaskInput<T>,
    transform: Mutex<Transform<T>>,
    min_count: Option<NonZeroUsize>,
    max_chunksize: usize,
    output: OnceLock<WriteEnd<T>>,
    error: Mutex<Option<Arc<TaskError>>>,
    registration: OnceLock<Registration<T>>,
    external_consumers: AtomicUsize,
}

/// The input a [`Task`] reads from: either an external stream or the output
/// of another task, obtained from a pool.
#[derive(Debug)]
pub enum TaskInput<T> {
    /// A plain stream read-end not managed by any pool.
    Channel(ReadEnd<T>),
    /// The read handle of a task registered in a pool. If that pool is the
    /// one this task gets registered in, the producing task becomes an input
    /// dependency of this one.
    Pool(PoolReadChannel<T>),
}

/// How a [`Task`] applies its processing function to a batch of input items.
pub enum Transform<T> {
    /// The function is applied to each item in the batch, and every result
    /// is written to the output individually.
    PerItem(Box<dyn FnMut(T) -> Result<T, TaskError> + Send>),
    /// The function is applied to the batch as a whole, and its single
    /// result is written to the output.
    Batched(Box<dyn FnMut(Vec<T>) -> Result<T, TaskError> + Send>),
}

/// Identity and pool membership assigned to a task when it is registered.
#[derive(Debug)]
struct Registration<T> {
    id: TaskId,
    pool: Weak<PoolShared<T>>,
}

impl<T> Task<T> {
    /// Creates a new task reading from the given input and processing items
    /// with the given transform. The task does nothing until registered in a
    /// pool.
    pub fn new(input: impl Into<TaskInput<T>>, transform: Transform<T>) -> Self {
        Self {
            input: input.into(),
            transform: Mutex::new(transform),
            min_count: None,
            max_chunksize: 0,
            output: OnceLock::new(),
            error: Mutex::new(None),
            registration: OnceLock::new(),
            external_consumers: AtomicUsize::new(0),
        }
    }

    /// Sets the minimum number of items the scheduler will demand from this
    /// task whenever it schedules it, even if the downstream consumer asked
    /// for fewer. `None` removes the floor.
    pub fn set_min_count(&mut self, min_count: Option<NonZeroUsize>) {
        self.min_count = min_count;
    }

    /// Sets the maximum number of items a single processing job for this
    /// task may cover; larger demands are split into multiple jobs. Zero
    /// (the default) disables splitting.
    pub fn set_max_chunksize(&mut self, max_chunksize: usize) {
        self.max_chunksize = max_chunksize;
    }

    /// The scheduling demand floor, if any.
    pub fn min_count(&self) -> Option<NonZeroUsize> {
        self.min_count
    }

    /// The job splitting threshold (zero = unchunked).
    pub fn max_chunksize(&self) -> usize {
        self.max_chunksize
    }

    /// The ID assigned at registration, or `None` for an unregistered task.
    pub fn id(&self) -> Option<TaskId> {
        self.registration.get().map(|registration| registration.id)
    }

    /// Whether this task has finished processing. A finished task has closed
    /// its output stream; downstream readers observe end-of-stream once the
    /// buffered items are drained.
    pub fn is_done(&self) -> bool {
        self.output.get().is_some_and(WriteEnd::closed)
    }

    /// Marks this task as finished, closing its output stream. No further
    /// items will be produced.
    pub fn set_done(&self) {
        if let Some(output) = self.output.get() {
            output.close();
        }
    }

    /// The error captured during processing, or `None` if no transform
    /// failure has occurred.
    pub fn error(&self) -> Option<Arc<TaskError>> {
        self.error.lock().clone()
    }

    /// Reads up to `count` items from the input (all remaining items if
    /// `count` is zero), applies the transform and writes the results to the
    /// output stream.
    ///
    /// Transform failures never propagate: they are captured for
    /// [`error`](Self::error) and finish the task. The task is also finished
    /// when the input yields fewer items than demanded (the input is
    /// depleted), and always when `count` is zero.
    ///
    /// # Errors
    /// Returns an error if the task has not been registered in a pool.
    pub(crate) fn process(&self, count: usize) -> io::Result<()> {
        let Some(output) = self.output.get() else {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "cannot process an unregistered task",
            ));
        };
        if output.closed() {
            return Ok(());
        }

        // Holding the transform lock for the whole call keeps processing
        // serialized per task and output order equal to input order
        let mut transform = self.transform.lock();

        let items = self.read_input(count);
        let n_read = items.len();

        let failure = match &mut *transform {
            Transform::PerItem(fun) => {
                let mut failure = None;
                for item in items {
                    match fun(item) {
                        Ok(item) => {
                            if output.write(item).is_err() {
                                break;
                            }
                        }
                        Err(error) => {
                            failure = Some(error);
                            break;
                        }
                    }
                }
                failure
            }
            Transform::Batched(fun) => match fun(items) {
                Ok(item) => {
                    let _ = output.write(item);
                    None
                }
                Err(error) => Some(error),
            },
        };

        if let Some(error) = failure {
            *self.error.lock() = Some(Arc::new(error));
            self.set_done();
        }

        // Getting fewer items than demanded means the input is depleted; a
        // zero-count demand drains the input and completes unconditionally
        if n_read < count || count == 0 {
            self.set_done();
        }

        Ok(())
    }

    /// Performs the raw input read for [`process`](Self::process).
    ///
    /// An input handle belonging to this task's own pool is read directly,
    /// bypassing demand propagation: the scheduler has already arranged
    /// upstream production by the time this task runs, and re-entering it
    /// here would deadlock on the pool lock.
    fn read_input(&self, count: usize) -> Vec<T> {
        match &self.input {
            TaskInput::Channel(reader) => reader.read(count, true, None),
            TaskInput::Pool(handle) => {
                if self.shares_pool_with(handle) {
                    handle.read_raw(count, true, None)
                } else {
                    handle.read(count, true, None).unwrap_or_else(|error| {
                        log::error!("Reading task input from foreign pool failed: {error}");
                        Vec::new()
                    })
                }
            }
        }
    }

    fn shares_pool_with(&self, handle: &PoolReadChannel<T>) -> bool {
        self.registration
            .get()
            .is_some_and(|registration| handle.is_of_pool(&registration.pool))
    }

    /// Binds the output stream and pool membership to this task. Called
    /// exactly once, by [`Pool::add_task`](crate::pool::Pool::add_task).
    pub(crate) fn register(&self, id: TaskId, output: WriteEnd<T>, pool: Weak<PoolShared<T>>) {
        assert!(
            self.registration.set(Registration { id, pool }).is_ok(),
            "Task registered multiple times"
        );
        assert!(
            self.output.set(output).is_ok(),
            "Task output bound multiple times"
        );
    }

    pub(crate) fn input(&self) -> &TaskInput<T> {
        &self.input
    }

    /// The number of items buffered in the output stream, awaiting
    /// downstream consumption.
    pub(crate) fn buffered_output(&self) -> usize {
        self.output.get().map_or(0, WriteEnd::size)
    }

    /// The demand to schedule for this task given the downstream request:
    /// `min_count` only ever raises the floor.
    pub(crate) fn effective_count(&self, count: usize) -> usize {
        match self.min_count {
            Some(min_count) => count.max(min_count.get()),
            None => count,
        }
    }

    pub(crate) fn add_external_consumer(&self) {
        self.external_consumers.fetch_add(1, Ordering::AcqRel);
    }

    /// Decrements the external-consumer count and returns the new value.
    ///
    /// # Panics
    /// If the count is attempted to be decremented below zero.
    pub(crate) fn remove_external_consumer(&self) -> usize {
        let previous = self.external_consumers.fetch_sub(1, Ordering::AcqRel);
        assert!(previous > 0, "Unbalanced external-consumer count decrement");
        previous - 1
    }

    pub(crate) fn external_consumer_count(&self) -> usize {
        self.external_consumers.load(Ordering::Acquire)
    }
}

impl<T> Transform<T> {
    /// Creates a transform applying the given function to each input item
    /// individually.
    pub fn per_item<F>(fun: F) -> Self
    where
        F: FnMut(T) -> Result<T, TaskError> + Send + 'static,
    {
        Self::PerItem(Box::new(fun))
    }

    /// Creates a transform applying the given function to each input batch
    /// as a whole, producing one output item per batch.
    pub fn batched<F>(fun: F) -> Self
    where
        F: FnMut(Vec<T>) -> Result<T, TaskError> + Send + 'static,
    {
        Self::Batched(Box::new(fun))
    }

    /// Whether this transform is applied to single items rather than whole
    /// batches.
    pub fn applies_singly(&self) -> bool {
        matches!(self, Self::PerItem(_))
    }
}

impl<T> fmt::Debug for Transform<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::PerItem(_) => "PerItem",
            Self::Batched(_) => "Batched",
        };
        f.debug_tuple(name).finish()
    }
}

impl<T> From<ReadEnd<T>> for TaskInput<T> {
    fn from(reader: ReadEnd<T>) -> Self {
        Self::Channel(reader)
    }
}

impl<T> From<PoolReadChannel<T>> for TaskInput<T> {
    fn from(handle: PoolReadChannel<T>) -> Self {
        Self::Pool(handle)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::channel;
    use anyhow::anyhow;

    fn registered_task(
        items: &[i32],
        transform: Transform<i32>,
    ) -> (Task<i32>, WriteEnd<i32>, ReadEnd<i32>) {
        let (in_wc, in_rc) = channel();
        for &item in items {
            in_wc.write(item).unwrap();
        }
        let task = Task::new(in_rc, transform);
        let (out_wc, out_rc) = channel();
        task.register(TaskId(0), out_wc, Weak::new());
        (task, in_wc, out_rc)
    }

    fn doubling() -> Transform<i32> {
        Transform::per_item(|item| Ok(item * 2))
    }

    #[test]
    fn processing_unregistered_task_fails() {
        let (_in_wc, in_rc) = channel::<i32>();
        let task = Task::new(in_rc, doubling());
        let error = task.process(1).unwrap_err();
        assert_eq!(error.kind(), io::ErrorKind::NotConnected);
    }

    #[test]
    fn per_item_transform_writes_each_result_in_order() {
        let (task, _in_wc, out_rc) = registered_task(&[1, 2, 3], doubling());
        task.process(3).unwrap();
        assert_eq!(out_rc.read(3, false, None), vec![2, 4, 6]);
        assert!(!task.is_done());
    }

    #[test]
    fn batched_transform_writes_single_item() {
        let transform = Transform::batched(|batch: Vec<i32>| Ok(batch.into_iter().sum()));
        assert!(!transform.applies_singly());
        let (task, _in_wc, out_rc) = registered_task(&[1, 2, 3, 4, 5], transform);
        task.process(5).unwrap();
        assert_eq!(out_rc.read(5, false, None), vec![15]);
    }

    #[test]
    fn short_read_marks_task_done() {
        let (task, in_wc, out_rc) = registered_task(&[1, 2], doubling());
        in_wc.close();
        task.process(4).unwrap();
        assert_eq!(out_rc.read(4, false, None), vec![2, 4]);
        assert!(task.is_done());
        assert!(task.error().is_none());
    }

    #[test]
    fn zero_count_processing_drains_input_and_completes() {
        let (task, in_wc, out_rc) = registered_task(&[1, 2, 3], doubling());
        in_wc.close();
        task.process(0).unwrap();
        assert_eq!(out_rc.read(0, false, None), vec![2, 4, 6]);
        assert!(task.is_done());
    }

    #[test]
    fn failing_transform_captures_error_and_completes() {
        let transform = Transform::per_item(|item| {
            if item == 3 {
                Err(anyhow!("unlucky item"))
            } else {
                Ok(item * 2)
            }
        });
        let (task, in_wc, out_rc) = registered_task(&[1, 2, 3, 4], transform);
        in_wc.close();
        task.process(4).unwrap();
        assert_eq!(out_rc.read(4, false, None), vec![2, 4]);
        assert!(task.is_done());
        assert_eq!(task.error().unwrap().to_string(), "unlucky item");
    }

    #[test]
    fn processing_after_done_is_a_noop() {
        let n_calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&n_calls);
        let transform = Transform::per_item(move |item| {
            counter.fetch_add(1, Ordering::Relaxed);
            Ok(item)
        });
        let (task, _in_wc, out_rc) = registered_task(&[1, 2], transform);
        task.set_done();
        task.process(2).unwrap();
        assert_eq!(n_calls.load(Ordering::Relaxed), 0);
        assert_eq!(out_rc.read(2, false, None), Vec::<i32>::new());
    }

    #[test]
    fn effective_count_honors_min_count() {
        let (_in_wc, in_rc) = channel::<i32>();
        let mut task = Task::new(in_rc, doubling());
        assert_eq!(task.effective_count(3), 3);
        task.set_min_count(NonZeroUsize::new(5));
        assert_eq!(task.effective_count(3), 5);
        assert_eq!(task.effective_count(8), 8);
    }

    #[test]
    fn external_consumer_count_is_balanced() {
        let (_in_wc, in_rc) = channel::<i32>();
        let task = Task::new(in_rc, doubling());
        task.add_external_consumer();
        task.add_external_consumer();
        assert_eq!(task.external_consumer_count(), 2);
        assert_eq!(task.remove_external_consumer(), 1);
        assert_eq!(task.remove_external_consumer(), 0);
    }
}
