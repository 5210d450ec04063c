//! Deferred application work.
//!
//! A protocol role never runs a route handler itself. It returns a
//! [`WorkItem`], the connection pushes it here, and a worker thread runs it.
//! Reading stops until the item's reply is written, so at most one item per
//! connection is ever in flight.

use std::collections::VecDeque;
use std::fmt;

use parking_lot::Mutex;

use crate::protocol::Reply;

pub struct WorkItem(Box<dyn FnOnce() -> Reply + Send>);

impl WorkItem {
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce() -> Reply + Send + 'static,
    {
        Self(Box::new(f))
    }

    pub fn run(self) -> Reply {
        (self.0)()
    }
}

impl fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WorkItem")
    }
}

#[derive(Debug, Default)]
pub struct WorkQueue {
    items: Mutex<VecDeque<WorkItem>>,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, item: WorkItem) {
        self.items.lock().push_back(item);
    }

    pub fn pop(&self) -> Option<WorkItem> {
        self.items.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}
