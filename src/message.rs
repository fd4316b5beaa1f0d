//! Message types carried by shard queues

use crate::shard::ShardId;
use std::fmt;

/// Trait for values that can cross from one shard to another
///
/// Anything handed to another shard must be Send + 'static so it can be
/// moved between threads without sharing references.
pub trait Message: Send + 'static {}

// Blanket implementation for all types that meet the requirements
impl<T: Send + 'static> Message for T {}

/// A unit of work executed on the receiving shard's event loop
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// A task addressed to a shard, tagged with where it came from
pub struct Envelope {
    /// The work itself
    pub task: Task,

    /// Shard that submitted the task (None for non-shard threads)
    pub source: Option<ShardId>,

    /// Shard that must run the task
    pub target: ShardId,
}

impl Envelope {
    /// Wrap a task for `target`, recording the submitting shard
    pub fn new(target: ShardId, task: Task) -> Self {
        Self {
            task,
            source: crate::shard::current_shard(),
            target,
        }
    }
}

impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Envelope")
            .field("source", &self.source)
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

/// Everything a shard's inbound queue can carry
#[derive(Debug)]
pub enum ShardMessage {
    /// Run a task on the shard
    Run(Envelope),

    /// Exit the event loop once every earlier message has been handled
    Stop,
}
