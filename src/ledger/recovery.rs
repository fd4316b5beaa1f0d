//! Seed snapshot loading and WAL replay
//!
//! Seed layout:
//!
//! ```text
//! <account count>
//! <user_id>,<name>,<balance>
//! ...
//! <item count>
//! <commodity_id>,<name>,<quantity>,<unit_price>
//! ...
//! ```
//!
//! Any line that does not parse stops recovery; there is no partial mode.

use super::types::{Account, Item, Money, Order};
use super::{Ledger, LedgerState, Wal};
use crate::error::{Error, Result};
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use tracing::info;

/// Initial accounts and inventory
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Seed {
    /// `(user_id, account)` in file order
    pub accounts: Vec<(String, Account)>,
    /// `(commodity_id, item)` in file order
    pub items: Vec<(String, Item)>,
}

struct Lines<R> {
    inner: io::Lines<R>,
    path: PathBuf,
    line: usize,
}

impl<R: BufRead> Lines<R> {
    fn new(reader: R, path: &Path) -> Self {
        Self {
            inner: reader.lines(),
            path: path.to_path_buf(),
            line: 0,
        }
    }

    fn next_line(&mut self) -> Result<Option<String>> {
        // `lines()` already strips "\n" and "\r\n"
        let line = self.inner.next().transpose()?;
        if line.is_some() {
            self.line += 1;
        }
        Ok(line)
    }

    fn expect_line(&mut self, what: &str) -> Result<String> {
        self.next_line()?
            .ok_or_else(|| Error::recovery(&self.path, self.line + 1, format!("missing {}", what)))
    }

    fn error(&self, reason: impl Into<String>) -> Error {
        Error::recovery(&self.path, self.line, reason)
    }

    fn count(&mut self, what: &str) -> Result<usize> {
        let text = self.expect_line(what)?;
        text.trim()
            .parse()
            .map_err(|_| self.error(format!("bad {} {:?}", what, text)))
    }

    fn fields<'a, const N: usize>(&self, text: &'a str) -> Result<[&'a str; N]> {
        let parts: Vec<&str> = text.splitn(N, ',').collect();
        parts
            .try_into()
            .map_err(|_| self.error(format!("expected {} comma-separated fields", N)))
    }

    fn money(&self, text: &str) -> Result<Money> {
        text.parse().map_err(|e| self.error(format!("{}", e)))
    }
}

impl Seed {
    /// Read the seed snapshot at `path`
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        Self::parse(BufReader::new(file), path)
    }

    /// Parse a seed snapshot; `path` is only used in error messages
    pub fn parse<R: BufRead>(reader: R, path: &Path) -> Result<Self> {
        let mut lines = Lines::new(reader, path);
        let mut seed = Seed::default();

        let users = lines.count("account count")?;
        for _ in 0..users {
            let text = lines.expect_line("account line")?;
            let [user_id, name, balance] = lines.fields::<3>(&text)?;
            let balance = lines.money(balance)?;
            seed.accounts.push((
                user_id.to_string(),
                Account {
                    name: name.to_string(),
                    balance,
                },
            ));
        }

        let commodities = lines.count("item count")?;
        for _ in 0..commodities {
            let text = lines.expect_line("item line")?;
            let [commodity_id, name, quantity, unit_price] = lines.fields::<4>(&text)?;
            let quantity: i64 = quantity
                .trim()
                .parse()
                .map_err(|_| lines.error(format!("bad quantity {:?}", quantity)))?;
            if quantity < 0 {
                return Err(lines.error("quantity must not be negative"));
            }
            let unit_price = lines.money(unit_price)?;
            seed.items.push((
                commodity_id.to_string(),
                Item {
                    name: name.to_string(),
                    quantity,
                    unit_price,
                },
            ));
        }

        Ok(seed)
    }
}

/// Apply every order in the log to `state`, in file order
///
/// Returns the number of orders replayed.
pub(crate) fn replay<R: BufRead>(state: &mut LedgerState, reader: R, path: &Path) -> Result<usize> {
    let mut lines = Lines::new(reader, path);
    let mut replayed = 0;

    while let Some(text) = lines.next_line()? {
        let [user_id, commodity_id, timestamp] = lines.fields::<3>(&text)?;
        let timestamp: i64 = timestamp
            .trim()
            .parse()
            .map_err(|_| lines.error(format!("bad timestamp {:?}", timestamp)))?;

        let order = Order {
            user_id: user_id.to_string(),
            commodity_id: commodity_id.to_string(),
            timestamp,
        };
        if !state.apply(order, |_| Ok(()))?.is_accepted() {
            return Err(lines.error(format!(
                "logged order {},{} is not admissible against the seed",
                user_id, commodity_id
            )));
        }
        replayed += 1;
    }

    Ok(replayed)
}

/// Rebuild the ledger from the seed at `seed_path` and the log at `wal_path`
///
/// A missing log means no orders yet. The log is then reopened for append.
pub fn recover(seed_path: impl AsRef<Path>, wal_path: impl AsRef<Path>) -> Result<Ledger> {
    let (seed_path, wal_path) = (seed_path.as_ref(), wal_path.as_ref());

    let seed = Seed::load(seed_path)?;
    info!(
        path = %seed_path.display(),
        accounts = seed.accounts.len(),
        items = seed.items.len(),
        "seed loaded"
    );

    let mut state = LedgerState::from_seed(seed);
    let replayed = match File::open(wal_path) {
        Ok(file) => replay(&mut state, BufReader::new(file), wal_path)?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => 0,
        Err(e) => return Err(e.into()),
    };
    info!(path = %wal_path.display(), orders = replayed, "WAL replayed");

    Ok(Ledger::from_state(state, Wal::open(wal_path)?))
}
