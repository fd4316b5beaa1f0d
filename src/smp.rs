//! Multi-shard runtime
//!
//! [`Smp`] owns one shard per execution unit and is the only way to move
//! work between them: [`Smp::submit_to`] ships a closure to a shard and
//! returns a [`ShardFuture`] for its result. Handles are cheap to clone and
//! may be used from any thread, including from inside a shard.

use crate::channel::Sender;
use crate::error::{Error, Result};
use crate::message::{Envelope, Message, ShardMessage};
use crate::shard::{self, current_shard, panic_message, ShardConfig, ShardHandle, ShardId};
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{info, warn};

/// Runtime configuration
#[derive(Debug, Clone)]
pub struct SmpConfig {
    /// Number of shards
    pub num_shards: usize,

    /// Configuration template for shards
    pub shard_config: ShardConfig,

    /// Whether to pin shard `i` to core `i`
    pub enable_cpu_affinity: bool,
}

impl Default for SmpConfig {
    fn default() -> Self {
        Self {
            num_shards: num_cpus::get(),
            shard_config: ShardConfig::default(),
            enable_cpu_affinity: false,
        }
    }
}

impl SmpConfig {
    /// Create a new runtime configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of shards
    pub fn with_num_shards(mut self, num: usize) -> Self {
        self.num_shards = num;
        self
    }

    /// Set the shard configuration template
    pub fn with_shard_config(mut self, config: ShardConfig) -> Self {
        self.shard_config = config;
        self
    }

    /// Enable CPU affinity pinning
    pub fn with_cpu_affinity(mut self, enable: bool) -> Self {
        self.enable_cpu_affinity = enable;
        self
    }
}

struct SmpInner {
    inboxes: Vec<Sender<ShardMessage>>,
    handles: Mutex<Vec<ShardHandle>>,
}

impl Drop for SmpInner {
    fn drop(&mut self) {
        stop_shards(&mut self.handles.lock());
    }
}

/// Handle to a set of running shards
#[derive(Clone)]
pub struct Smp {
    inner: Arc<SmpInner>,
}

impl Smp {
    /// Spawn the shards described by `config`
    pub fn new(config: SmpConfig) -> Result<Self> {
        if config.num_shards == 0 {
            return Err(Error::InvalidConfig("at least one shard is required".to_string()));
        }

        let mut handles = Vec::with_capacity(config.num_shards);
        for id in 0..config.num_shards {
            let mut shard_config = config.shard_config.clone();
            if config.enable_cpu_affinity {
                shard_config.cpu_affinity = Some(id % num_cpus::get());
            }

            match shard::spawn(id, shard_config) {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    stop_shards(&mut handles);
                    return Err(e);
                }
            }
        }

        info!(shards = config.num_shards, pinned = config.enable_cpu_affinity, "smp started");

        let inboxes = handles.iter().map(|h| h.inbox().clone()).collect();
        Ok(Self {
            inner: Arc::new(SmpInner {
                inboxes,
                handles: Mutex::new(handles),
            }),
        })
    }

    /// Number of shards
    pub fn count(&self) -> usize {
        self.inner.inboxes.len()
    }

    /// The last shard index
    pub fn last_shard(&self) -> ShardId {
        self.count() - 1
    }

    /// Run `func` on `shard` and deliver its return value
    pub fn submit_to<F, R>(&self, shard: ShardId, func: F) -> ShardFuture<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Message,
    {
        self.try_submit_to(shard, move || Ok(func()))
    }

    /// Like [`Smp::submit_to`] for functions that can fail on the shard
    pub fn try_submit_to<F, R>(&self, shard: ShardId, func: F) -> ShardFuture<R>
    where
        F: FnOnce() -> Result<R> + Send + 'static,
        R: Message,
    {
        match self.inner.inboxes.get(shard) {
            Some(inbox) => submit_via(inbox, func),
            None => ShardFuture::ready(shard, Err(Error::ShardNotFound(shard))),
        }
    }

    /// Stop every shard and join its thread
    ///
    /// Messages queued before the call still run. Further submissions fail
    /// with [`Error::ShardStopped`].
    pub fn shutdown(&self) {
        stop_shards(&mut self.inner.handles.lock());
    }

    /// Whether every shard's event loop is still running
    pub fn all_running(&self) -> bool {
        self.inner.handles.lock().iter().all(|h| h.is_running())
    }
}

fn stop_shards(handles: &mut Vec<ShardHandle>) {
    if handles.is_empty() {
        return;
    }
    for handle in handles.iter() {
        handle.request_stop();
    }
    if let Some(me) = current_shard() {
        // joining our own thread would never return
        warn!(shard = me, "smp shutdown requested from inside a shard; not joining");
        return;
    }
    for handle in handles.iter_mut() {
        if let Err(e) = handle.stop() {
            warn!(shard = handle.id(), "failed to stop shard: {}", e);
        }
    }
    handles.clear();
    info!("smp stopped");
}

/// Ship `func` through `inbox` and hand back the future of its result
pub(crate) fn submit_via<F, R>(inbox: &Sender<ShardMessage>, func: F) -> ShardFuture<R>
where
    F: FnOnce() -> Result<R> + Send + 'static,
    R: Message,
{
    let shard = inbox.shard();
    let (tx, rx) = flume::bounded(1);
    let task = Box::new(move || {
        let result = panic::catch_unwind(AssertUnwindSafe(func)).unwrap_or_else(|payload| {
            Err(Error::TaskPanicked {
                shard,
                message: panic_message(&*payload),
            })
        });
        // the caller may have stopped waiting
        let _ = tx.send(result);
    });

    match inbox.send(ShardMessage::Run(Envelope::new(shard, task))) {
        Ok(()) => ShardFuture { shard, rx },
        Err(_) => ShardFuture::ready(shard, Err(Error::ShardStopped(shard))),
    }
}

/// Pending result of work submitted to a shard
#[must_use = "a ShardFuture does nothing unless waited on"]
pub struct ShardFuture<T> {
    shard: ShardId,
    rx: flume::Receiver<Result<T>>,
}

impl<T> ShardFuture<T> {
    /// A future that is already complete
    pub(crate) fn ready(shard: ShardId, result: Result<T>) -> Self {
        let (tx, rx) = flume::bounded(1);
        let _ = tx.send(result);
        Self { shard, rx }
    }

    /// Shard producing the result
    pub fn shard(&self) -> ShardId {
        self.shard
    }

    /// Block the calling thread until the result arrives
    ///
    /// A shard cannot wait for its own queued work: that returns
    /// [`Error::SelfWait`] unless the result is already there.
    pub fn wait(self) -> Result<T> {
        match self.rx.try_recv() {
            Ok(result) => return result,
            Err(flume::TryRecvError::Disconnected) => return Err(Error::ShardStopped(self.shard)),
            Err(flume::TryRecvError::Empty) => {}
        }
        if current_shard() == Some(self.shard) {
            return Err(Error::SelfWait(self.shard));
        }
        self.rx
            .recv()
            .unwrap_or(Err(Error::ShardStopped(self.shard)))
    }

    /// Await the result from async code
    pub async fn recv(self) -> Result<T> {
        let shard = self.shard;
        self.rx
            .into_recv_async()
            .await
            .unwrap_or(Err(Error::ShardStopped(shard)))
    }

    /// Take the result if it has arrived
    pub fn try_take(&self) -> Option<Result<T>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(flume::TryRecvError::Empty) => None,
            Err(flume::TryRecvError::Disconnected) => Some(Err(Error::ShardStopped(self.shard))),
        }
    }
}

/// Wait for every future, keeping results in submission order
pub(crate) fn wait_all<T>(futures: Vec<ShardFuture<T>>) -> Vec<Result<T>> {
    futures.into_iter().map(ShardFuture::wait).collect()
}
