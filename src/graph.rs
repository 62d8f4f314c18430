//! Dependency graph linking tasks through their input streams.

use crate::task::TaskId;
use petgraph::{
    Direction,
    graphmap::DiGraphMap,
    visit::{DfsPostOrder, Reversed},
};

/// A directed acyclic graph of registered tasks. An edge `A → B` means task
/// B reads its input from task A's output.
#[derive(Debug, Default)]
pub(crate) struct TaskGraph {
    graph: DiGraphMap<TaskId, ()>,
}

impl TaskGraph {
    pub(crate) fn new() -> Self {
        Self {
            graph: DiGraphMap::new(),
        }
    }

    pub(crate) fn add_node(&mut self, id: TaskId) {
        self.graph.add_node(id);
    }

    pub(crate) fn add_edge(&mut self, producer: TaskId, consumer: TaskId) {
        self.graph.add_edge(producer, consumer, ());
    }

    pub(crate) fn del_node(&mut self, id: TaskId) {
        self.graph.remove_node(id);
    }

    pub(crate) fn contains_node(&self, id: TaskId) -> bool {
        self.graph.contains_node(id)
    }

    pub(crate) fn clear(&mut self) {
        self.graph = DiGraphMap::new();
    }

    /// The tasks whose outputs feed directly into the given task.
    pub(crate) fn input_neighbors(&self, id: TaskId) -> Vec<TaskId> {
        if !self.graph.contains_node(id) {
            return Vec::new();
        }
        self.graph
            .neighbors_directed(id, Direction::Incoming)
            .collect()
    }

    /// Visits the given task and every task reachable from it via input
    /// edges, depth-first, returning the visited IDs with input dependencies
    /// ordered before their consumers (the start node comes last).
    pub(crate) fn visit_inputs_inclusive(&self, start: TaskId) -> Vec<TaskId> {
        if !self.graph.contains_node(start) {
            return Vec::new();
        }
        // Post-order over the reversed graph finishes a task's inputs before
        // the task itself
        let reversed = Reversed(&self.graph);
        let mut visit = DfsPostOrder::new(reversed, start);
        let mut order = Vec::new();
        while let Some(id) = visit.next(reversed) {
            order.push(id);
        }
        order
    }
}
