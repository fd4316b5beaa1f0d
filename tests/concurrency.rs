use shard_seckill::ledger::{Account, Item, Ledger, Money, Seed, Wal};
use shard_seckill::{Admission, Directory, Dispatcher, Reply, Request, Smp, SmpConfig};
use std::sync::Arc;
use std::thread;

const SHARDS: usize = 4;
const WRITER: usize = SHARDS - 1;

fn account(name: &str, minor: i64) -> Account {
    Account {
        name: name.to_string(),
        balance: Money::from_minor(minor),
    }
}

fn item(name: &str, quantity: i64, minor: i64) -> Item {
    Item {
        name: name.to_string(),
        quantity,
        unit_price: Money::from_minor(minor),
    }
}

fn start(seed: Seed) -> (Smp, Dispatcher<Vec<u8>>) {
    let smp = Smp::new(SmpConfig::new().with_num_shards(SHARDS)).unwrap();
    let mut ledger = Directory::new(&smp);
    ledger
        .start_single(WRITER, move |_| Ok(Ledger::new(seed.clone(), Wal::from_writer(Vec::new()))))
        .unwrap();
    (smp, Dispatcher::new(Arc::new(ledger), WRITER))
}

fn seckill(dispatcher: &Dispatcher<Vec<u8>>, user: &str, commodity: &str) -> Admission {
    let request = Request::Seckill {
        user_id: user.to_string(),
        commodity_id: commodity.to_string(),
    };
    match dispatcher.dispatch(request).wait().unwrap() {
        Reply::Seckill { admission, .. } => admission,
        other => panic!("unexpected reply {other:?}"),
    }
}

fn account_of(dispatcher: &Dispatcher<Vec<u8>>, user: &str) -> Account {
    let request = Request::GetUser {
        user_id: user.to_string(),
    };
    match dispatcher.dispatch(request).wait().unwrap() {
        Reply::User { account, .. } => account,
        other => panic!("unexpected reply {other:?}"),
    }
}

fn item_of(dispatcher: &Dispatcher<Vec<u8>>, commodity: &str) -> Item {
    let request = Request::GetCommodity {
        commodity_id: commodity.to_string(),
    };
    match dispatcher.dispatch(request).wait().unwrap() {
        Reply::Commodity { item, .. } => item,
        other => panic!("unexpected reply {other:?}"),
    }
}

/// Fire `attempts` seckills at once, half from plain threads and half from
/// inside the shards
fn storm(
    smp: &Smp,
    dispatcher: &Dispatcher<Vec<u8>>,
    attempts: usize,
    user: impl Fn(usize) -> String,
) -> Vec<Admission> {
    let mut from_threads = Vec::new();
    let mut from_shards = Vec::new();

    for i in 0..attempts {
        let dispatcher = dispatcher.clone();
        let user = user(i);
        if i % 2 == 0 {
            from_threads.push(thread::spawn(move || seckill(&dispatcher, &user, "c1")));
        } else {
            from_shards.push(smp.submit_to(i % SHARDS, move || {
                dispatcher.dispatch(Request::Seckill {
                    user_id: user,
                    commodity_id: "c1".to_string(),
                })
            }));
        }
    }

    let mut outcomes: Vec<Admission> = from_threads.into_iter().map(|h| h.join().unwrap()).collect();
    for pending in from_shards {
        match pending.wait().unwrap().wait().unwrap() {
            Reply::Seckill { admission, .. } => outcomes.push(admission),
            other => panic!("unexpected reply {other:?}"),
        }
    }
    outcomes
}

#[test]
fn test_single_unit_is_sold_exactly_once() {
    let seed = Seed {
        accounts: (0..32).map(|i| (format!("u{i}"), account("buyer", 1_000))).collect(),
        items: vec![("c1".to_string(), item("last one", 1, 500))],
    };
    let (smp, dispatcher) = start(seed);

    let outcomes = storm(&smp, &dispatcher, 32, |i| format!("u{i}"));
    let accepted: Vec<_> = outcomes.iter().filter(|a| a.is_accepted()).collect();
    assert_eq!(accepted.len(), 1);
    assert_eq!(*accepted[0], Admission::Accepted(1));
    assert_eq!(outcomes.iter().filter(|a| a.order_id() == -1).count(), 31);
    assert_eq!(item_of(&dispatcher, "c1").quantity, 0);
}

#[test]
fn test_two_buyers_one_phone() {
    let seed = Seed {
        accounts: vec![("u1".to_string(), account("alice", 50_000))],
        items: vec![("c1".to_string(), item("phone", 1, 30_000))],
    };
    let (smp, dispatcher) = start(seed);

    let mut outcomes = storm(&smp, &dispatcher, 2, |_| "u1".to_string());
    outcomes.sort_by_key(Admission::order_id);
    assert_eq!(outcomes, vec![Admission::Rejected, Admission::Accepted(1)]);

    assert_eq!(account_of(&dispatcher, "u1").balance, Money::from_minor(20_000));
    assert_eq!(item_of(&dispatcher, "c1").quantity, 0);
}

#[test]
fn test_no_oversell_and_no_overdraft_under_contention() {
    // 20 buyers who can each afford two units, competing for ten
    let seed = Seed {
        accounts: (0..20).map(|i| (format!("u{i}"), account("buyer", 250))).collect(),
        items: vec![("c1".to_string(), item("widget", 10, 100))],
    };
    let (smp, dispatcher) = start(seed);

    let outcomes = storm(&smp, &dispatcher, 200, |i| format!("u{}", i % 20));

    let mut ids: Vec<i64> = outcomes.iter().filter(|a| a.is_accepted()).map(Admission::order_id).collect();
    ids.sort_unstable();
    assert_eq!(ids, (1..=10).collect::<Vec<_>>());
    assert_eq!(item_of(&dispatcher, "c1").quantity, 0);

    let mut spent = 0;
    for i in 0..20 {
        let balance = account_of(&dispatcher, &format!("u{i}")).balance.minor();
        assert!(balance >= 0, "u{i} overdrawn: {balance}");
        assert!(balance >= 50, "u{i} bought more than they could afford");
        spent += 250 - balance;
    }
    assert_eq!(spent, 10 * 100);

    match dispatcher.dispatch(Request::ListOrders).wait().unwrap() {
        Reply::Orders(orders) => {
            let listed: Vec<u64> = orders.iter().map(|(id, _)| *id).collect();
            assert_eq!(listed, (1..=10).collect::<Vec<_>>());
        }
        other => panic!("unexpected reply {other:?}"),
    }
}

#[test]
fn test_unknown_commodity_always_rejects() {
    let seed = Seed {
        accounts: vec![("u1".to_string(), account("alice", 1_000_000))],
        items: Vec::new(),
    };
    let (smp, dispatcher) = start(seed);

    let outcomes = storm(&smp, &dispatcher, 8, |_| "u1".to_string());
    assert!(outcomes.iter().all(|a| *a == Admission::Rejected));
    assert_eq!(account_of(&dispatcher, "u1").balance, Money::from_minor(1_000_000));
}
