//! Lazy, channel-wired execution of task graphs on a worker pool.
//!
//! Units of work ([`Task`]s) are nodes of a directed acyclic dependency
//! graph, connected by thread-safe item streams: a task reading its input
//! from another task's [`PoolReadChannel`] becomes a downstream consumer of
//! that task. Evaluation is demand-driven — nothing is processed until a
//! read on a leaf handle pulls items through the graph, at which point the
//! [`Pool`] schedules exactly enough upstream production to satisfy the
//! demand, on its worker threads or (for a zero-sized pool) inline on the
//! reading thread.
//!
//! Tasks whose consumers have all gone away are deleted automatically,
//! cascading upstream, so abandoned pipelines do not keep producing.

pub mod channel;
mod graph;
pub mod pool;
pub mod task;
mod worker;

pub use channel::{ReadEnd, WriteEnd, channel};
pub use pool::{Pool, PoolReadChannel, PostReadCallback, PreReadCallback, ReadError};
pub use task::{Task, TaskError, TaskId, TaskInput, Transform};
