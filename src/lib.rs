//! # Shard Seckill
//!
//! A shard-per-core runtime and a flash-sale order ledger built on it.
//!
//! Each shard is a single-threaded event loop that owns its memory. Work
//! moves between shards only as messages, and a [`Directory`] places one
//! instance of a service on each shard it is started on. The order
//! [`Ledger`] is such a service, started on a single writer shard: every
//! admission runs there, one at a time, which is what keeps stock and
//! balances from ever going negative.
//!
//! ## Key Features
//!
//! - **Shard-confined state**: service instances live behind `Rc` on their shard
//! - **Message passing**: `submit_to` / `invoke_on` return a [`ShardFuture`]
//! - **Two-phase stop**: [`Directory::stop`] waits for the last outstanding reference
//! - **Foreign pointers**: values dropped away from home are freed on their origin shard
//! - **Write-ahead log**: every admitted order is logged before it is published
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   invoke_on(writer)  ┌──────────────────┐
//! │  Shard 0    │ ───────────────────> │  Shard N-1       │
//! │  (request)  │                      │  Ledger + WAL    │
//! │             │ <─────────────────── │  (single writer) │
//! └─────────────┘   Reply / ForeignPtr └──────────────────┘
//!                                               │
//!                                               ▼
//!                                        ┌─────────────┐
//!                                        │   log.txt   │
//!                                        └─────────────┘
//! ```

#![warn(missing_docs, rust_2018_idioms)]

pub mod channel;
pub mod directory;
pub mod dispatch;
pub mod error;
pub mod foreign;
pub mod ledger;
pub mod message;
pub mod shard;
pub mod smp;

// Re-exports
pub use channel::{Receiver, Sender};
pub use directory::{Directory, Local, Service};
pub use dispatch::{Dispatcher, Reply, Request};
pub use error::{Error, Result};
pub use foreign::ForeignPtr;
pub use ledger::{Admission, Ledger, Money};
pub use message::Message;
pub use shard::{current_shard, spawn_local, ShardConfig, ShardId};
pub use smp::{ShardFuture, Smp, SmpConfig};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::directory::{Directory, Local, Service};
    pub use crate::error::{Error, Result};
    pub use crate::foreign::ForeignPtr;
    pub use crate::message::Message;
    pub use crate::shard::{current_shard, spawn_local, ShardId};
    pub use crate::smp::{ShardFuture, Smp, SmpConfig};
}
