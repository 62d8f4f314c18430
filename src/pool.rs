//! Demand-driven scheduling of task graphs onto a worker pool.

use crate::{
    channel::{self, ReadEnd},
    graph::TaskGraph,
    task::{Task, TaskError, TaskId, TaskInput},
    worker::{Job, Worker, WorkerId},
};
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    fmt, mem,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

/// A pool of tasks wired into a dependency graph by their input streams,
/// evaluated lazily: a task only processes items when a downstream read
/// demands them. Production runs on a set of worker threads, or inline on
/// the reading thread when the pool size is zero (serial mode).
///
/// # Examples
/// ```
/// use lazypool::{Pool, Task, Transform, channel};
///
/// let (producer, consumer) = channel();
/// for item in [1, 2, 3] {
///     producer.write(item).unwrap();
/// }
/// producer.close();
///
/// let pool = Pool::new(0);
/// let doubled = pool.add_task(Task::new(
///     consumer,
///     Transform::per_item(|item: i32| Ok(item * 2)),
/// ));
///
/// assert_eq!(doubled.read(3, false, None).unwrap(), vec![2, 4, 6]);
/// ```
#[derive(Debug)]
pub struct Pool<T> {
    shared: Arc<PoolShared<T>>,
}

/// A read handle for the output of a task registered in a [`Pool`].
///
/// Each read first propagates its demand through the pool so that the task
/// (and its upstream dependencies) produce enough items, then reads from
/// the underlying stream. Dropping the last handle for a task orphans the
/// task: the pool deletes it and, transitively, any upstream task that was
/// producing solely for it.
pub struct PoolReadChannel<T> {
    task: Arc<Task<T>>,
    pool: Weak<PoolShared<T>>,
    reader: ReadEnd<T>,
    pre_cb: Mutex<Option<PreReadCallback>>,
    post_cb: Mutex<Option<PostReadCallback<T>>>,
    detached: AtomicBool,
}

/// A callback invoked with the demanded item count before a
/// [`PoolReadChannel`] read schedules or reads anything.
pub type PreReadCallback = Box<dyn FnMut(usize) -> Result<(), TaskError> + Send>;

/// A callback invoked with the items a [`PoolReadChannel`] read obtained,
/// returning the (possibly rewritten) items to hand to the caller.
pub type PostReadCallback<T> = Box<dyn FnMut(Vec<T>) -> Result<Vec<T>, TaskError> + Send>;

/// The error returned when a [`PoolReadChannel`] read fails.
#[derive(Debug)]
pub enum ReadError {
    /// The installed pre-read callback failed; nothing was scheduled or
    /// read.
    PreRead(TaskError),
    /// The installed post-read callback failed; the read items were
    /// consumed but not delivered.
    PostRead(TaskError),
    /// The owning pool has been torn down.
    PoolTerminated,
}

/// The state shared between a [`Pool`], its read handles and its tasks.
#[derive(Debug)]
pub(crate) struct PoolShared<T> {
    state: Mutex<PoolState<T>>,
    job_sender: Sender<Job<T>>,
    job_receiver: Receiver<Job<T>>,
    next_task_id: AtomicU64,
    next_worker_id: AtomicU64,
}

#[derive(Debug)]
struct PoolState<T> {
    graph: TaskGraph,
    tasks: HashMap<TaskId, Arc<Task<T>>>,
    consumed: Vec<Arc<Task<T>>>,
    workers: Vec<Worker>,
}

impl<T: Send + 'static> Pool<T> {
    /// Creates a new pool with the given number of worker threads. A size
    /// of zero yields a serial pool in which all processing happens inline
    /// on the reading thread.
    pub fn new(size: usize) -> Self {
        let (job_sender, job_receiver) = crossbeam_channel::unbounded();
        let pool = Self {
            shared: Arc::new(PoolShared {
                state: Mutex::new(PoolState {
                    graph: TaskGraph::new(),
                    tasks: HashMap::new(),
                    consumed: Vec::new(),
                    workers: Vec::new(),
                }),
                job_sender,
                job_receiver,
                next_task_id: AtomicU64::new(0),
                next_worker_id: AtomicU64::new(0),
            }),
        };
        pool.set_pool_size(size);
        pool
    }

    /// Registers the given task: allocates its output stream, inserts it
    /// into the task graph (recording the input dependency if the task
    /// reads from another task of this pool) and returns the read handle
    /// for its output.
    ///
    /// The returned handle is the task's only external consumer; once it
    /// (and every handle derived from the task's output) is gone, the task
    /// is deleted.
    pub fn add_task(&self, task: Task<T>) -> PoolReadChannel<T> {
        let (output, reader) = channel::channel();
        let id = TaskId(self.shared.next_task_id.fetch_add(1, Ordering::Relaxed));
        task.register(id, output, Arc::downgrade(&self.shared));
        let task = Arc::new(task);

        let mut state = self.shared.state.lock();
        state.graph.add_node(id);
        if let TaskInput::Pool(input) = task.input() {
            if input.is_of(&self.shared) {
                let producer = input.task_id();
                if state.graph.contains_node(producer) {
                    state.graph.add_edge(producer, id);
                }
            }
        }
        state.tasks.insert(id, Arc::clone(&task));
        drop(state);

        log::trace!("Added task {id}");
        PoolReadChannel::new(task, reader, Arc::downgrade(&self.shared))
    }

    /// Deletes the task with the given ID from the pool: the task is set
    /// done (closing its output and unblocking pending readers with
    /// end-of-stream) and removed from the graph, after which every task
    /// that was feeding it is deleted as well if it has no consumer left.
    /// Unknown IDs are ignored.
    pub fn del_task(&self, id: TaskId) -> &Self {
        let mut state = self.shared.state.lock();
        if let Some(task) = state.tasks.get(&id).cloned() {
            self.shared.del_task_locked(&mut state, &task);
        }
        self
    }

    /// Sets the number of worker threads. Growing spawns additional
    /// workers; shrinking stops and joins the excess ones, which may block
    /// until they finish their current job. After a resize to zero, any
    /// jobs still queued are run inline on the calling thread.
    pub fn set_pool_size(&self, size: usize) -> &Self {
        self.shared.set_pool_size(size);
        self
    }

    /// The current number of worker threads.
    pub fn n_workers(&self) -> usize {
        self.shared.state.lock().workers.len()
    }

    /// The current number of registered tasks.
    pub fn n_tasks(&self) -> usize {
        self.shared.state.lock().tasks.len()
    }

    /// Whether a task with the given ID is registered in the pool.
    pub fn has_task(&self, id: TaskId) -> bool {
        self.shared.state.lock().tasks.contains_key(&id)
    }
}

impl<T> Drop for Pool<T> {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        let workers: Vec<_> = state.workers.drain(..).collect();
        let mut tasks: Vec<_> = state.tasks.drain().map(|(_, task)| task).collect();
        tasks.append(&mut state.consumed);
        state.graph.clear();
        drop(state);

        for worker in workers {
            worker.stop_and_join();
        }

        // Jobs that never ran are discarded
        while self.shared.job_receiver.try_recv().is_ok() {}

        // Close every output so pending readers observe end-of-stream
        for task in &tasks {
            task.set_done();
        }
    }
}

impl<T> PoolShared<T> {
    /// Translates a downstream demand for `count` items from the given task
    /// into processing of the task and its upstream dependencies.
    ///
    /// The task's input closure is walked depth-first, dependencies before
    /// their consumers. Tasks that are done or have failed are swept out of
    /// the pool at the end of the walk. For every other visited task the
    /// demand (raised to the task's `min_count` floor) is either already
    /// buffered in its output, or turned into processing jobs — split per
    /// the task's `max_chunksize` — on the worker queue; with no workers,
    /// the task is processed inline right away.
    pub(crate) fn prepare_processing(&self, task_id: TaskId, count: usize) {
        let mut state = self.state.lock();
        for id in state.graph.visit_inputs_inclusive(task_id) {
            let Some(task) = state.tasks.get(&id).cloned() else {
                continue;
            };
            if task.is_done() || task.error().is_some() {
                state.consumed.push(task);
                continue;
            }
            let eff_count = task.effective_count(count);
            if state.workers.is_empty() {
                if let Err(error) = task.process(eff_count) {
                    log::error!("Task {id} could not be processed: {error}");
                }
            } else if eff_count < 1 || task.buffered_output() < eff_count {
                // A sub-one demand becomes a single "drain until done" job
                for chunk in chunk_counts(eff_count, task.max_chunksize()) {
                    let job = Job {
                        task: Arc::clone(&task),
                        count: chunk,
                    };
                    let _ = self.job_sender.send(job);
                }
            }
        }

        let consumed = mem::take(&mut state.consumed);
        for task in &consumed {
            self.del_task_locked(&mut state, task);
        }
    }

    /// Deletes the given task while holding the pool lock, cascading to
    /// upstream tasks left without any consumer.
    fn del_task_locked(&self, state: &mut PoolState<T>, task: &Arc<Task<T>>) {
        let Some(id) = task.id() else {
            return;
        };
        if state.tasks.remove(&id).is_none() {
            return;
        }
        log::trace!("Deleting task {id}");

        let inputs = state.graph.input_neighbors(id);
        task.set_done();
        state.graph.del_node(id);

        // Sever the task's own hold on its upstream producer here; the
        // handle's drop must stay inert, as the pool lock is already held
        if let TaskInput::Pool(input) = task.input() {
            if input.is_of(self) {
                input.detach();
            }
        }

        for input_id in inputs {
            if let Some(upstream) = state.tasks.get(&input_id).cloned() {
                if upstream.external_consumer_count() == 0 {
                    self.del_task_locked(state, &upstream);
                }
            }
        }
    }

    /// Deletes the given task if no external consumer of its output is
    /// left. Called from read handle drops.
    pub(crate) fn del_task_if_orphaned(&self, task: &Arc<Task<T>>) {
        let mut state = self.state.lock();
        if task.external_consumer_count() == 0 {
            self.del_task_locked(&mut state, task);
        }
    }
}

impl<T: Send + 'static> PoolShared<T> {
    fn set_pool_size(&self, size: usize) {
        let mut state = self.state.lock();
        let current = state.workers.len();
        if current < size {
            for _ in 0..size - current {
                let id = WorkerId(self.next_worker_id.fetch_add(1, Ordering::Relaxed));
                state
                    .workers
                    .push(Worker::spawn(id, self.job_receiver.clone()));
            }
        } else if current > size {
            // May block until each stopped worker finishes its current job
            let excess: Vec<_> = state.workers.drain(..current - size).collect();
            for worker in excess {
                worker.stop_and_join();
            }
        }

        if size == 0 {
            // Serial mode from here on: run whatever is still queued inline
            while let Ok(job) = self.job_receiver.try_recv() {
                job.run();
            }
        }
    }
}

/// The job sizes a demand of `count` items is split into under the given
/// chunking threshold: `count / max_chunksize` chunks of `max_chunksize`
/// items plus a remainder chunk, or the demand as-is when unchunked (or
/// when there is nothing to split).
fn chunk_counts(count: usize, max_chunksize: usize) -> Vec<usize> {
    if count == 0 || max_chunksize == 0 {
        return vec![count];
    }
    let mut counts = vec![max_chunksize; count / max_chunksize];
    let remainder = count % max_chunksize;
    if remainder != 0 {
        counts.push(remainder);
    }
    counts
}

impl<T> PoolReadChannel<T> {
    fn new(task: Arc<Task<T>>, reader: ReadEnd<T>, pool: Weak<PoolShared<T>>) -> Self {
        task.add_external_consumer();
        Self {
            task,
            pool,
            reader,
            pre_cb: Mutex::new(None),
            post_cb: Mutex::new(None),
            detached: AtomicBool::new(false),
        }
    }

    /// Reads up to `count` items produced by the task, first propagating
    /// the demand through the pool so that production is scheduled (and, in
    /// serial mode, performed). `count`, `block` and `timeout` follow
    /// [`ReadEnd::read`](crate::channel::ReadEnd::read).
    ///
    /// # Errors
    /// Returns an error if an installed callback fails or if the pool has
    /// been torn down.
    pub fn read(
        &self,
        count: usize,
        block: bool,
        timeout: Option<Duration>,
    ) -> Result<Vec<T>, ReadError> {
        if let Some(pre_cb) = &mut *self.pre_cb.lock() {
            pre_cb(count).map_err(ReadError::PreRead)?;
        }

        let pool = self.pool.upgrade().ok_or(ReadError::PoolTerminated)?;
        pool.prepare_processing(self.task_id(), count);

        let items = self.reader.read(count, block, timeout);

        if let Some(post_cb) = &mut *self.post_cb.lock() {
            return post_cb(items).map_err(ReadError::PostRead);
        }
        Ok(items)
    }

    /// Installs a callback invoked with the demanded count before each read
    /// schedules anything; a failing callback aborts the read. Passing
    /// `None` uninstalls.
    pub fn set_pre_cb(&self, pre_cb: Option<PreReadCallback>) {
        *self.pre_cb.lock() = pre_cb;
    }

    /// Installs a callback that each read passes its items through,
    /// returning the items to deliver. Passing `None` uninstalls.
    pub fn set_post_cb(&self, post_cb: Option<PostReadCallback<T>>) {
        *self.post_cb.lock() = post_cb;
    }

    /// The task this handle reads from.
    pub fn task(&self) -> &Task<T> {
        &self.task
    }

    /// The ID of the task this handle reads from.
    pub fn task_id(&self) -> TaskId {
        self.task
            .id()
            .expect("Pool read handle exists for unregistered task")
    }

    /// Reads directly from the underlying stream, without triggering the
    /// pool. Used by task processing, where demand propagation has already
    /// happened.
    pub(crate) fn read_raw(&self, count: usize, block: bool, timeout: Option<Duration>) -> Vec<T> {
        self.reader.read(count, block, timeout)
    }

    pub(crate) fn is_of_pool(&self, pool: &Weak<PoolShared<T>>) -> bool {
        Weak::ptr_eq(&self.pool, pool)
    }

    fn is_of(&self, shared: &PoolShared<T>) -> bool {
        std::ptr::eq(self.pool.as_ptr(), shared)
    }

    /// Gives up this handle's consumer registration on behalf of the pool,
    /// leaving the eventual drop with nothing to do.
    fn detach(&self) {
        if !self.detached.swap(true, Ordering::AcqRel) {
            self.task.remove_external_consumer();
        }
    }
}

impl<T> Drop for PoolReadChannel<T> {
    fn drop(&mut self) {
        if self.detached.swap(true, Ordering::AcqRel) {
            return;
        }
        let remaining = self.task.remove_external_consumer();
        if remaining == 0 {
            if let Some(pool) = self.pool.upgrade() {
                pool.del_task_if_orphaned(&self.task);
            }
        }
    }
}

impl<T> fmt::Debug for PoolReadChannel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolReadChannel")
            .field("task_id", &self.task.id())
            .finish_non_exhaustive()
    }
}

impl fmt::Display for ReadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PreRead(error) => write!(f, "Pre-read callback failed: {error}"),
            Self::PostRead(error) => write!(f, "Post-read callback failed: {error}"),
            Self::PoolTerminated => write!(f, "Pool was torn down"),
        }
    }
}

impl std::error::Error for ReadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::PreRead(error) | Self::PostRead(error) => Some(&**error),
            Self::PoolTerminated => None,
        }
    }
}
