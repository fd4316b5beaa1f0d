//! Shards: isolated, single-threaded execution units
//!
//! Each shard is one OS thread running a cooperative event loop. It owns its
//! memory and never shares it; other threads reach it only by sending
//! messages to its inbound queue. A shard can also defer work to itself with
//! [`spawn_local`], which accepts non-`Send` closures because they never
//! leave the thread.

use crate::channel::{self, Receiver, Sender};
use crate::error::{Error, Result};
use crate::message::ShardMessage;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info};

/// Index of a shard within its runtime (0-based)
pub type ShardId = usize;

type LocalTask = Box<dyn FnOnce() + 'static>;

thread_local! {
    static CURRENT: Cell<Option<ShardId>> = const { Cell::new(None) };
    static INBOX: RefCell<Option<Sender<ShardMessage>>> = const { RefCell::new(None) };
    static LOCAL_TASKS: RefCell<VecDeque<LocalTask>> = const { RefCell::new(VecDeque::new()) };
}

/// Shard the calling thread belongs to, if any
pub fn current_shard() -> Option<ShardId> {
    CURRENT.with(|c| c.get())
}

/// Queue sender of the calling shard
pub(crate) fn current_inbox() -> Option<Sender<ShardMessage>> {
    INBOX.with(|inbox| inbox.borrow().clone())
}

/// Defer `task` to the calling shard's event loop
///
/// The task runs after the current message has been handled, interleaved
/// with inbound messages. Fails with [`Error::NotOnShard`] off-shard.
pub fn spawn_local<F>(task: F) -> Result<()>
where
    F: FnOnce() + 'static,
{
    if current_shard().is_none() {
        return Err(Error::NotOnShard);
    }
    LOCAL_TASKS.with(|q| q.borrow_mut().push_back(Box::new(task)));
    Ok(())
}

fn has_local_tasks() -> bool {
    LOCAL_TASKS.with(|q| !q.borrow().is_empty())
}

fn run_one_local(id: ShardId) {
    // pop outside the borrow: the task may spawn more local work
    let task = LOCAL_TASKS.with(|q| q.borrow_mut().pop_front());
    if let Some(task) = task {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
            error!(shard = id, "local task panicked: {}", panic_message(&*payload));
        }
    }
}

/// Extract a printable message from a panic payload
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Shard configuration
#[derive(Debug, Clone)]
pub struct ShardConfig {
    /// Name suffix for the shard thread (for debugging/monitoring)
    pub name: Option<String>,

    /// CPU core to pin this shard to (None = no pinning)
    pub cpu_affinity: Option<usize>,

    /// Inbound queue capacity (None = unbounded)
    pub queue_capacity: Option<usize>,

    /// Stack size for the shard thread (None = default)
    pub stack_size: Option<usize>,
}

impl Default for ShardConfig {
    fn default() -> Self {
        Self {
            name: None,
            cpu_affinity: None,
            queue_capacity: Some(1024),
            stack_size: None,
        }
    }
}

impl ShardConfig {
    /// Create a new shard configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the shard name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set CPU affinity
    pub fn with_cpu_affinity(mut self, cpu: usize) -> Self {
        self.cpu_affinity = Some(cpu);
        self
    }

    /// Set queue capacity
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = Some(capacity);
        self
    }

    /// Let the inbound queue grow without bound
    pub fn with_unbounded_queue(mut self) -> Self {
        self.queue_capacity = None;
        self
    }

    /// Set stack size
    pub fn with_stack_size(mut self, size: usize) -> Self {
        self.stack_size = Some(size);
        self
    }
}

/// Handle for managing a running shard
pub struct ShardHandle {
    id: ShardId,

    config: ShardConfig,

    inbox: Sender<ShardMessage>,

    thread_handle: Option<JoinHandle<()>>,

    running: Arc<AtomicBool>,
}

impl ShardHandle {
    /// Get the shard ID
    pub fn id(&self) -> ShardId {
        self.id
    }

    /// Get the shard name
    pub fn name(&self) -> Option<&str> {
        self.config.name.as_deref()
    }

    /// Sender feeding this shard's queue
    pub fn inbox(&self) -> &Sender<ShardMessage> {
        &self.inbox
    }

    /// Check if the shard's event loop is still running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Ask the shard to exit once everything already queued has run
    pub fn request_stop(&self) {
        // a shard that already exited has dropped its receiver
        let _ = self.inbox.send(ShardMessage::Stop);
    }

    /// Stop the shard and wait for its thread to exit
    pub fn stop(&mut self) -> Result<()> {
        let Some(handle) = self.thread_handle.take() else {
            return Ok(());
        };

        self.request_stop();

        handle.join().map_err(|payload| Error::TaskPanicked {
            shard: self.id,
            message: panic_message(&*payload),
        })
    }
}

/// Spawn shard `id` with the given configuration
pub fn spawn(id: ShardId, config: ShardConfig) -> Result<ShardHandle> {
    let (inbox, rx) = match config.queue_capacity {
        Some(capacity) => channel::bounded(id, capacity),
        None => channel::unbounded(id),
    };

    let running = Arc::new(AtomicBool::new(true));
    let running_clone = Arc::clone(&running);

    let shard_config = config.clone();
    let shard_inbox = inbox.clone();

    let mut thread_builder = thread::Builder::new();

    if let Some(name) = &config.name {
        thread_builder = thread_builder.name(format!("shard-{}-{}", id, name));
    } else {
        thread_builder = thread_builder.name(format!("shard-{}", id));
    }

    if let Some(stack_size) = config.stack_size {
        thread_builder = thread_builder.stack_size(stack_size);
    }

    let thread_handle = thread_builder
        .spawn(move || {
            if let Some(cpu) = shard_config.cpu_affinity {
                if let Some(core_ids) = core_affinity::get_core_ids() {
                    if cpu < core_ids.len() {
                        core_affinity::set_for_current(core_ids[cpu]);
                    }
                }
            }

            CURRENT.with(|c| c.set(Some(id)));
            INBOX.with(|inbox| *inbox.borrow_mut() = Some(shard_inbox));

            info!(shard = id, cpu = ?shard_config.cpu_affinity, "shard started");
            run_loop(id, &rx);

            // pending local work holds shard-local references; release them here
            let abandoned = LOCAL_TASKS.with(|q| std::mem::take(&mut *q.borrow_mut()));
            if !abandoned.is_empty() {
                debug!(shard = id, tasks = abandoned.len(), "dropping pending local tasks");
            }
            drop(abandoned);

            INBOX.with(|inbox| inbox.borrow_mut().take());
            running_clone.store(false, Ordering::Release);
            info!(
                shard = id,
                received = rx.stats().received(),
                "shard stopped"
            );
        })
        .map_err(|source| Error::SpawnFailed { shard: id, source })?;

    Ok(ShardHandle {
        id,
        config,
        inbox,
        thread_handle: Some(thread_handle),
        running,
    })
}

/// Empty inbox polls a shard makes between local tasks before backing off
const SPIN_LIMIT: u32 = 64;

/// Longest a backed-off shard waits for a message before its next local task
const IDLE_BACKOFF: Duration = Duration::from_micros(100);

fn run_loop(id: ShardId, rx: &Receiver<ShardMessage>) {
    // local tasks that keep rescheduling themselves would otherwise spin a core
    let mut idle_polls = 0u32;
    loop {
        let next = if !has_local_tasks() {
            rx.recv().map(Some)
        } else if idle_polls < SPIN_LIMIT {
            rx.try_recv()
        } else {
            rx.recv_timeout(IDLE_BACKOFF)
        };

        match next {
            Ok(Some(ShardMessage::Run(envelope))) => {
                idle_polls = 0;
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(envelope.task)) {
                    error!(
                        shard = id,
                        source = ?envelope.source,
                        "task panicked: {}",
                        panic_message(&*payload)
                    );
                }
            }
            Ok(Some(ShardMessage::Stop)) => break,
            Ok(None) => idle_polls = idle_polls.saturating_add(1),
            Err(_) => break,
        }

        run_one_local(id);
    }
}
