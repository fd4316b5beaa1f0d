//! Shard queues with per-queue statistics
//!
//! Every shard owns one inbound queue. Senders are cloned freely to any
//! thread; the receiver stays with the shard's event loop.

use crate::error::{Error, Result};
use crate::shard::ShardId;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Cache line size for padding (typically 64 bytes on x86-64)
const CACHE_LINE_SIZE: usize = 64;

/// Statistics for queue monitoring
#[repr(align(64))] // Align to cache line
#[derive(Debug)]
pub struct ChannelStats {
    /// Number of messages sent
    pub messages_sent: AtomicU64,

    /// Number of messages received
    pub messages_received: AtomicU64,

    /// Number of sends that found the receiver gone
    pub send_errors: AtomicU64,

    _padding: [u8; CACHE_LINE_SIZE - 24],
}

impl Default for ChannelStats {
    fn default() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            send_errors: AtomicU64::new(0),
            _padding: [0; CACHE_LINE_SIZE - 24],
        }
    }
}

impl ChannelStats {
    /// Get the number of messages sent
    pub fn sent(&self) -> u64 {
        self.messages_sent.load(Ordering::Relaxed)
    }

    /// Get the number of messages received
    pub fn received(&self) -> u64 {
        self.messages_received.load(Ordering::Relaxed)
    }

    /// Get the number of failed sends
    pub fn send_errors(&self) -> u64 {
        self.send_errors.load(Ordering::Relaxed)
    }
}

/// Sender half of a shard queue
pub struct Sender<T> {
    inner: flume::Sender<T>,
    stats: Arc<ChannelStats>,
    shard: ShardId,
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            stats: Arc::clone(&self.stats),
            shard: self.shard,
        }
    }
}

impl<T> Sender<T> {
    /// Send a message to the shard
    ///
    /// On failure the message is handed back so the caller decides where it
    /// gets dropped.
    pub fn send(&self, msg: T) -> std::result::Result<(), T> {
        match self.inner.send(msg) {
            Ok(()) => {
                self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(flume::SendError(msg)) => {
                self.stats.send_errors.fetch_add(1, Ordering::Relaxed);
                Err(msg)
            }
        }
    }

    /// Shard this queue feeds
    pub fn shard(&self) -> ShardId {
        self.shard
    }

    /// Get channel statistics
    pub fn stats(&self) -> Arc<ChannelStats> {
        Arc::clone(&self.stats)
    }
}

/// Receiver half of a shard queue
pub struct Receiver<T> {
    inner: flume::Receiver<T>,
    stats: Arc<ChannelStats>,
    shard: ShardId,
}

impl<T> Receiver<T> {
    /// Block until a message arrives
    pub fn recv(&self) -> Result<T> {
        let msg = self
            .inner
            .recv()
            .map_err(|_| Error::ShardStopped(self.shard))?;
        self.stats.messages_received.fetch_add(1, Ordering::Relaxed);
        Ok(msg)
    }

    /// Take a message if one is queued
    ///
    /// `Ok(None)` means the queue is empty but still connected.
    pub fn try_recv(&self) -> Result<Option<T>> {
        match self.inner.try_recv() {
            Ok(msg) => {
                self.stats.messages_received.fetch_add(1, Ordering::Relaxed);
                Ok(Some(msg))
            }
            Err(flume::TryRecvError::Empty) => Ok(None),
            Err(flume::TryRecvError::Disconnected) => Err(Error::ShardStopped(self.shard)),
        }
    }

    /// Wait up to `timeout` for a message
    ///
    /// `Ok(None)` means nothing arrived in time.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<T>> {
        match self.inner.recv_timeout(timeout) {
            Ok(msg) => {
                self.stats.messages_received.fetch_add(1, Ordering::Relaxed);
                Ok(Some(msg))
            }
            Err(flume::RecvTimeoutError::Timeout) => Ok(None),
            Err(flume::RecvTimeoutError::Disconnected) => Err(Error::ShardStopped(self.shard)),
        }
    }

    /// Number of messages waiting
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Whether the queue is empty
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Get channel statistics
    pub fn stats(&self) -> Arc<ChannelStats> {
        Arc::clone(&self.stats)
    }
}

/// Create a bounded queue feeding `shard`
pub fn bounded<T>(shard: ShardId, capacity: usize) -> (Sender<T>, Receiver<T>) {
    wrap(shard, flume::bounded(capacity))
}

/// Create an unbounded queue feeding `shard`
pub fn unbounded<T>(shard: ShardId) -> (Sender<T>, Receiver<T>) {
    wrap(shard, flume::unbounded())
}

fn wrap<T>(
    shard: ShardId,
    (tx, rx): (flume::Sender<T>, flume::Receiver<T>),
) -> (Sender<T>, Receiver<T>) {
    let stats = Arc::new(ChannelStats::default());
    (
        Sender {
            inner: tx,
            stats: Arc::clone(&stats),
            shard,
        },
        Receiver {
            inner: rx,
            stats,
            shard,
        },
    )
}
