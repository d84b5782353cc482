//! WaitList - binary min-heap of tasks keyed on `exec_time`, with an id index
//! so any entry can be removed in O(log n).
//!
//! `std::collections::BinaryHeap` has no positional removal, so the heap is
//! kept by hand: a `Vec` plus sift up/down, with `index` updated on every
//! swap.

use std::collections::HashMap;

use crate::domain::{Task, TaskId};

#[derive(Debug, Default)]
pub struct WaitList {
    heap: Vec<Task>,

    /// task id -> position in `heap`
    index: HashMap<TaskId, usize>,
}

impl WaitList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            heap: Vec::with_capacity(capacity),
            index: HashMap::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.index.contains_key(&id)
    }

    pub fn peek(&self) -> Option<&Task> {
        self.heap.first()
    }

    /// Insert `task`. An entry with the same id is replaced.
    pub fn push(&mut self, task: Task) {
        if let Some(&pos) = self.index.get(&task.id()) {
            self.heap[pos] = task;
            self.restore(pos);
            return;
        }

        let pos = self.heap.len();
        self.heap.push(task);
        self.index.insert(task.id(), pos);
        self.sift_up(pos);
    }

    /// Remove and return the earliest task.
    pub fn pop(&mut self) -> Option<Task> {
        self.remove_at(0)
    }

    /// Remove the task with `id`, if present.
    pub fn remove(&mut self, id: TaskId) -> Option<Task> {
        let pos = *self.index.get(&id)?;
        self.remove_at(pos)
    }

    fn remove_at(&mut self, pos: usize) -> Option<Task> {
        let last = self.heap.len().checked_sub(1)?;
        self.swap(pos, last);
        let removed = self.heap.pop()?;
        self.index.remove(&removed.id());
        if pos < self.heap.len() {
            self.restore(pos);
        }
        Some(removed)
    }

    fn restore(&mut self, pos: usize) {
        let pos = self.sift_up(pos);
        self.sift_down(pos);
    }

    fn sift_up(&mut self, mut pos: usize) -> usize {
        while pos > 0 {
            let parent = (pos - 1) / 2;
            if self.heap[pos].exec_time() >= self.heap[parent].exec_time() {
                break;
            }
            self.swap(pos, parent);
            pos = parent;
        }
        pos
    }

    fn sift_down(&mut self, mut pos: usize) {
        let len = self.heap.len();
        loop {
            let left = 2 * pos + 1;
            let right = left + 1;
            let mut smallest = pos;

            if left < len && self.heap[left].exec_time() < self.heap[smallest].exec_time() {
                smallest = left;
            }
            if right < len && self.heap[right].exec_time() < self.heap[smallest].exec_time() {
                smallest = right;
            }
            if smallest == pos {
                return;
            }
            self.swap(pos, smallest);
            pos = smallest;
        }
    }

    fn swap(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }
        self.heap.swap(a, b);
        self.index.insert(self.heap[a].id(), a);
        self.index.insert(self.heap[b].id(), b);
    }
}
