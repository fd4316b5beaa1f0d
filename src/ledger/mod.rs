//! Single-writer order ledger
//!
//! The ledger holds every account, every commodity and the order history.
//! It lives on exactly one shard and is only reached through that shard's
//! [`Directory`](crate::directory::Directory), so admission is a plain
//! check-then-mutate sequence: there is never a second thread of control to
//! race with.
//!
//! Accounts and items are derived state. The durable record is the
//! [`Wal`]; [`recover`] rebuilds the ledger by replaying it over the seed
//! snapshot.

mod recovery;
mod types;
mod wal;

pub use recovery::{recover, Seed};
pub use types::{check_id, Account, Admission, Item, Money, Order, OrderId, ParseMoneyError};
pub use wal::Wal;

use crate::directory::Service;
use crate::error::Result;
use ahash::AHashMap;
use std::cell::RefCell;
use std::fs::File;
use std::io::Write;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::info;

/// Accounts, inventory and orders
#[derive(Debug, Default)]
pub(crate) struct LedgerState {
    accounts: AHashMap<String, Account>,
    items: AHashMap<String, Item>,
    orders: Vec<Order>,
}

impl LedgerState {
    pub(crate) fn from_seed(seed: Seed) -> Self {
        Self {
            accounts: seed.accounts.into_iter().collect(),
            items: seed.items.into_iter().collect(),
            orders: Vec::new(),
        }
    }

    /// Sell one unit of `order.commodity_id` to `order.user_id` if stock
    /// and balance allow
    ///
    /// Unknown ids read as zero-valued and are never inserted, so a
    /// rejection leaves the state exactly as it was. `log` runs after the
    /// check and before any change; if it fails nothing is applied.
    pub(crate) fn apply<F>(&mut self, order: Order, log: F) -> Result<Admission>
    where
        F: FnOnce(&Order) -> Result<()>,
    {
        let Some(item) = self.items.get_mut(&order.commodity_id) else {
            return Ok(Admission::Rejected);
        };
        let balance = self
            .accounts
            .get(&order.user_id)
            .map_or(Money::ZERO, |account| account.balance);
        if item.quantity <= 0 || balance < item.unit_price {
            return Ok(Admission::Rejected);
        }

        log(&order)?;
        item.quantity -= 1;
        // a free item can go to a user the seed never named
        let account = self.accounts.entry(order.user_id.clone()).or_default();
        account.balance = account.balance - item.unit_price;
        self.orders.push(order);
        Ok(Admission::Accepted(self.orders.len() as OrderId))
    }
}

/// The order ledger service
///
/// Interior mutability is plain `RefCell`: the ledger never leaves the shard
/// it was built on.
#[derive(Debug)]
pub struct Ledger<W: Write + 'static = File> {
    state: RefCell<LedgerState>,
    wal: RefCell<Wal<W>>,
}

impl<W: Write + 'static> Ledger<W> {
    /// Ledger over `seed` with no orders yet, logging to `wal`
    pub fn new(seed: Seed, wal: Wal<W>) -> Self {
        Self::from_state(LedgerState::from_seed(seed), wal)
    }

    pub(crate) fn from_state(state: LedgerState, wal: Wal<W>) -> Self {
        Self {
            state: RefCell::new(state),
            wal: RefCell::new(wal),
        }
    }

    /// Try to sell one `commodity_id` to `user_id`, stamped with the current time
    pub fn admit(&self, user_id: &str, commodity_id: &str) -> Result<Admission> {
        self.admit_at(user_id, commodity_id, unix_now())
    }

    /// Try to sell one `commodity_id` to `user_id` at `timestamp`
    ///
    /// A rejection changes nothing. An acceptance is logged first; if the
    /// log append fails the error is returned and the ledger is untouched.
    /// Ids containing a comma or a line break are refused with
    /// [`Error::BadRequest`](crate::Error::BadRequest).
    pub fn admit_at(&self, user_id: &str, commodity_id: &str, timestamp: i64) -> Result<Admission> {
        check_id("user_id", user_id)?;
        check_id("commodity_id", commodity_id)?;

        let order = Order {
            user_id: user_id.to_owned(),
            commodity_id: commodity_id.to_owned(),
            timestamp,
        };
        let mut state = self.state.borrow_mut();
        let mut wal = self.wal.borrow_mut();
        state.apply(order, |order| wal.append(order))
    }

    /// Account for `user_id`, zero-valued if unknown
    pub fn get_account(&self, user_id: &str) -> Account {
        self.state.borrow().accounts.get(user_id).cloned().unwrap_or_default()
    }

    /// Item for `commodity_id`, zero-valued if unknown
    pub fn get_item(&self, commodity_id: &str) -> Item {
        self.state.borrow().items.get(commodity_id).cloned().unwrap_or_default()
    }

    /// Order number `order_id`, zero-valued if out of range
    pub fn get_order(&self, order_id: i64) -> Order {
        let state = self.state.borrow();
        usize::try_from(order_id)
            .ok()
            .and_then(|id| id.checked_sub(1))
            .and_then(|index| state.orders.get(index))
            .cloned()
            .unwrap_or_default()
    }

    /// Every account, sorted by user id
    pub fn list_accounts(&self) -> Vec<(String, Account)> {
        let mut accounts: Vec<_> = self
            .state
            .borrow()
            .accounts
            .iter()
            .map(|(id, account)| (id.clone(), account.clone()))
            .collect();
        accounts.sort_unstable_by(|a, b| a.0.cmp(&b.0));
        accounts
    }

    /// Every item, sorted by commodity id
    pub fn list_items(&self) -> Vec<(String, Item)> {
        let mut items: Vec<_> = self
            .state
            .borrow()
            .items
            .iter()
            .map(|(id, item)| (id.clone(), item.clone()))
            .collect();
        items.sort_unstable_by(|a, b| a.0.cmp(&b.0));
        items
    }

    /// Every order with its id, in id order
    pub fn list_orders(&self) -> Vec<(OrderId, Order)> {
        self.state
            .borrow()
            .orders
            .iter()
            .enumerate()
            .map(|(index, order)| (index as OrderId + 1, order.clone()))
            .collect()
    }

    /// Number of admitted orders
    pub fn order_count(&self) -> usize {
        self.state.borrow().orders.len()
    }

    /// Records appended to the log since this ledger was built
    pub fn wal_appended(&self) -> u64 {
        self.wal.borrow().appended()
    }
}

impl<W: Write + 'static> Service for Ledger<W> {
    const TRACK_DELETION: bool = true;

    fn stop(&self) -> Result<()> {
        {
            let state = self.state.borrow();
            info!(
                accounts = state.accounts.len(),
                items = state.items.len(),
                orders = state.orders.len(),
                appended = self.wal_appended(),
                "ledger stopping"
            );
        }
        self.wal.borrow_mut().flush()
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or(0)
}
