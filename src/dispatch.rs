//! Request dispatch to the writer shard
//!
//! Every request, read or write, runs on the shard that owns the ledger.
//! Reads therefore always observe every earlier admission.

use crate::directory::Directory;
use crate::error::{Error, Result};
use crate::foreign::ForeignPtr;
use crate::ledger::{check_id, Account, Admission, Item, Ledger, Money, Order, OrderId};
use crate::shard::ShardId;
use crate::smp::ShardFuture;
use serde::Serialize;
use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::sync::Arc;

/// A ledger request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Buy one unit
    Seckill {
        /// Buyer
        user_id: String,
        /// What to buy
        commodity_id: String,
    },
    /// Look up one account
    GetUser {
        /// Account to read
        user_id: String,
    },
    /// Look up one commodity
    GetCommodity {
        /// Commodity to read
        commodity_id: String,
    },
    /// Look up one order
    GetOrder {
        /// 1-based order id
        order_id: i64,
    },
    /// Every account
    ListUsers,
    /// Every commodity
    ListCommodities,
    /// Every order
    ListOrders,
}

impl Request {
    /// Endpoint names accepted by [`Request::from_route`]
    pub const ROUTES: [&'static str; 7] = [
        "seckill",
        "getUserById",
        "getCommodityById",
        "getOrderById",
        "getUserAll",
        "getCommodityAll",
        "getOrderAll",
    ];

    /// Build a request from an endpoint name and its query parameters
    pub fn from_route(route: &str, params: &HashMap<String, String>) -> Result<Self> {
        let param = |name: &str| {
            params
                .get(name)
                .cloned()
                .ok_or_else(|| Error::BadRequest(format!("missing query parameter {}", name)))
        };
        let id = |name: &str| -> Result<String> {
            let value = param(name)?;
            check_id(name, &value)?;
            Ok(value)
        };

        match route {
            "seckill" => Ok(Request::Seckill {
                user_id: id("user_id")?,
                commodity_id: id("commodity_id")?,
            }),
            "getUserById" => Ok(Request::GetUser {
                user_id: id("user_id")?,
            }),
            "getCommodityById" => Ok(Request::GetCommodity {
                commodity_id: id("commodity_id")?,
            }),
            "getOrderById" => {
                let raw = param("order_id")?;
                let order_id = raw
                    .trim()
                    .parse()
                    .map_err(|_| Error::BadRequest(format!("order_id {:?} is not an integer", raw)))?;
                Ok(Request::GetOrder { order_id })
            }
            "getUserAll" => Ok(Request::ListUsers),
            "getCommodityAll" => Ok(Request::ListCommodities),
            "getOrderAll" => Ok(Request::ListOrders),
            other => Err(Error::BadRequest(format!("unknown endpoint {}", other))),
        }
    }
}

/// Result of a dispatched request
///
/// Listings are built on the writer shard and handed out as foreign
/// pointers, so their buffers go back there to be freed.
#[derive(Debug)]
pub enum Reply {
    /// Outcome of a purchase
    Seckill {
        /// Buyer
        user_id: String,
        /// What was asked for
        commodity_id: String,
        /// Accepted with an order id, or rejected
        admission: Admission,
    },
    /// One account
    User {
        /// Requested id
        user_id: String,
        /// Zero-valued if unknown
        account: Account,
    },
    /// One commodity
    Commodity {
        /// Requested id
        commodity_id: String,
        /// Zero-valued if unknown
        item: Item,
    },
    /// One order
    Order {
        /// Requested id
        order_id: i64,
        /// Zero-valued if out of range
        order: Order,
    },
    /// Every account, sorted by id
    Users(ForeignPtr<Vec<(String, Account)>>),
    /// Every commodity, sorted by id
    Commodities(ForeignPtr<Vec<(String, Item)>>),
    /// Every order, in id order
    Orders(ForeignPtr<Vec<(OrderId, Order)>>),
}

#[derive(Serialize)]
struct SeckillView<'a> {
    result: u8,
    order_id: i64,
    user_id: &'a str,
    commodity_id: &'a str,
}

#[derive(Serialize)]
struct UserView<'a> {
    user_id: &'a str,
    name: &'a str,
    account_balance: Money,
}

impl<'a> UserView<'a> {
    fn new(user_id: &'a str, account: &'a Account) -> Self {
        Self {
            user_id,
            name: &account.name,
            account_balance: account.balance,
        }
    }
}

#[derive(Serialize)]
struct CommodityView<'a> {
    commodity_id: &'a str,
    name: &'a str,
    quantity: i64,
    unit_price: Money,
}

#[derive(Serialize)]
struct CommodityBrief<'a> {
    commodity_id: &'a str,
    name: &'a str,
    unit_price: Money,
}

#[derive(Serialize)]
struct OrderView<'a> {
    order_id: i64,
    user_id: &'a str,
    commodity_id: &'a str,
    timestamp: i64,
}

impl<'a> OrderView<'a> {
    fn new(order_id: i64, order: &'a Order) -> Self {
        Self {
            order_id,
            user_id: &order.user_id,
            commodity_id: &order.commodity_id,
            timestamp: order.timestamp,
        }
    }
}

impl Reply {
    /// Render the JSON response body
    pub fn render(&self) -> Result<String> {
        let body = match self {
            Reply::Seckill {
                user_id,
                commodity_id,
                admission,
            } => serde_json::to_string(&SeckillView {
                result: u8::from(admission.is_accepted()),
                order_id: admission.order_id(),
                user_id,
                commodity_id,
            })?,
            Reply::User { user_id, account } => serde_json::to_string(&UserView::new(user_id, account))?,
            Reply::Commodity { commodity_id, item } => serde_json::to_string(&CommodityView {
                commodity_id,
                name: &item.name,
                quantity: item.quantity,
                unit_price: item.unit_price,
            })?,
            Reply::Order { order_id, order } => serde_json::to_string(&OrderView::new(*order_id, order))?,
            Reply::Users(users) => {
                let views: Vec<_> = users.iter().map(|(id, account)| UserView::new(id, account)).collect();
                serde_json::to_string(&views)?
            }
            Reply::Commodities(items) => {
                let views: Vec<_> = items
                    .iter()
                    .map(|(id, item)| CommodityBrief {
                        commodity_id: id,
                        name: &item.name,
                        unit_price: item.unit_price,
                    })
                    .collect();
                serde_json::to_string(&views)?
            }
            Reply::Orders(orders) => {
                let views: Vec<_> = orders
                    .iter()
                    .map(|(id, order)| OrderView::new(*id as i64, order))
                    .collect();
                serde_json::to_string(&views)?
            }
        };
        Ok(body)
    }
}

/// Routes requests to the ledger on the writer shard
pub struct Dispatcher<W: Write + 'static = File> {
    ledger: Arc<Directory<Ledger<W>>>,
    writer: ShardId,
}

impl<W: Write + 'static> Clone for Dispatcher<W> {
    fn clone(&self) -> Self {
        Self {
            ledger: Arc::clone(&self.ledger),
            writer: self.writer,
        }
    }
}

impl<W: Write + 'static> Dispatcher<W> {
    /// Dispatch through `ledger`, whose instance lives on `writer`
    pub fn new(ledger: Arc<Directory<Ledger<W>>>, writer: ShardId) -> Self {
        Self { ledger, writer }
    }

    /// Shard every request is sent to
    pub fn writer(&self) -> ShardId {
        self.writer
    }

    /// Send `request` to the writer shard
    pub fn dispatch(&self, request: Request) -> ShardFuture<Reply> {
        match request {
            Request::Seckill {
                user_id,
                commodity_id,
            } => self.ledger.try_invoke_on(self.writer, move |ledger| {
                let admission = ledger.admit(&user_id, &commodity_id)?;
                Ok(Reply::Seckill {
                    user_id,
                    commodity_id,
                    admission,
                })
            }),
            Request::GetUser { user_id } => self.ledger.invoke_on(self.writer, move |ledger| {
                let account = ledger.get_account(&user_id);
                Reply::User { user_id, account }
            }),
            Request::GetCommodity { commodity_id } => self.ledger.invoke_on(self.writer, move |ledger| {
                let item = ledger.get_item(&commodity_id);
                Reply::Commodity { commodity_id, item }
            }),
            Request::GetOrder { order_id } => self.ledger.invoke_on(self.writer, move |ledger| Reply::Order {
                order_id,
                order: ledger.get_order(order_id),
            }),
            Request::ListUsers => self
                .ledger
                .invoke_on(self.writer, |ledger| Reply::Users(ForeignPtr::new(ledger.list_accounts()))),
            Request::ListCommodities => self
                .ledger
                .invoke_on(self.writer, |ledger| Reply::Commodities(ForeignPtr::new(ledger.list_items()))),
            Request::ListOrders => self
                .ledger
                .invoke_on(self.writer, |ledger| Reply::Orders(ForeignPtr::new(ledger.list_orders()))),
        }
    }
}
