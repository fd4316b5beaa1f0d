//! Values whose destruction belongs to the shard that created them
//!
//! Shard-local data is allocated and torn down on its own shard. A
//! [`ForeignPtr`] lets such a value travel to another shard (or a non-shard
//! thread) for reading; when the handle is dropped away from home, the value
//! is shipped back and dropped on its origin shard instead.

use crate::channel::Sender;
use crate::error::{Error, Result};
use crate::message::{Envelope, Message, ShardMessage};
use crate::shard::{current_inbox, current_shard, ShardId};
use crate::smp::submit_via;
use parking_lot::Mutex;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use tracing::warn;

/// Move-only wrapper that returns its value to the origin shard on drop
pub struct ForeignPtr<P: Message> {
    value: Option<P>,
    home: Option<Sender<ShardMessage>>,
}

impl<P: Message> ForeignPtr<P> {
    /// Wrap `value`, remembering the calling shard as its origin
    ///
    /// Values wrapped outside any shard have no origin and are dropped
    /// wherever the handle is dropped.
    pub fn new(value: P) -> Self {
        Self {
            value: Some(value),
            home: current_inbox(),
        }
    }

    /// Shard the value belongs to
    pub fn origin(&self) -> Option<ShardId> {
        self.home.as_ref().map(Sender::shard)
    }

    /// Whether the calling thread is the value's origin
    pub fn on_origin(&self) -> bool {
        self.origin() == current_shard()
    }

    /// Whether the handle still holds a value
    pub fn is_empty(&self) -> bool {
        self.value.is_none()
    }

    /// Borrow the wrapped value
    pub fn get(&self) -> Option<&P> {
        self.value.as_ref()
    }

    /// Clone the value on its origin shard and wrap the clone there
    ///
    /// The value is lent to the origin for the duration of the call and is
    /// back in this handle whether or not the origin could be reached.
    pub fn copy(&mut self) -> Result<ForeignPtr<P>>
    where
        P: Clone,
    {
        let home = match &self.home {
            Some(home) if !self.on_origin() => home.clone(),
            _ => {
                // already home, or homeless: clone in place
                let value = self.value.clone().ok_or(Error::EmptyForeign)?;
                return Ok(ForeignPtr {
                    value: Some(value),
                    home: self.home.clone(),
                });
            }
        };

        let value = self.value.take().ok_or(Error::EmptyForeign)?;
        let slot = Arc::new(Mutex::new(Some(value)));
        let lent = Arc::clone(&slot);
        let copy = submit_via(&home, move || {
            let value = lent.lock().as_ref().cloned().ok_or(Error::EmptyForeign)?;
            Ok(ForeignPtr::new(value))
        })
        .wait();

        self.value = slot.lock().take();
        copy
    }
}

impl<P> Deref for ForeignPtr<P>
where
    P: Message + Deref,
{
    type Target = P::Target;

    fn deref(&self) -> &Self::Target {
        match &self.value {
            Some(value) => value.deref(),
            None => panic!("dereferenced an empty ForeignPtr"),
        }
    }
}

impl<P: Message> Drop for ForeignPtr<P> {
    fn drop(&mut self) {
        let Some(value) = self.value.take() else {
            return;
        };
        let Some(home) = self.home.as_ref() else {
            return;
        };
        if current_shard() == Some(home.shard()) {
            return;
        }

        let task = Box::new(move || drop(value));
        if home.send(ShardMessage::Run(Envelope::new(home.shard(), task))).is_err() {
            // the envelope, and the value in it, is dropped right here
            warn!(origin = home.shard(), "origin shard is gone; dropping foreign value in place");
        }
    }
}

impl<P: Message + fmt::Debug> fmt::Debug for ForeignPtr<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForeignPtr")
            .field("value", &self.value)
            .field("origin", &self.origin())
            .finish()
    }
}
