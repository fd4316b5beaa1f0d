//! Shard directory: one service instance per shard
//!
//! A [`Directory`] constructs an instance of a [`Service`] on each target
//! shard and afterwards only reaches it by message passing. The instance
//! itself lives in the shard's thread-local registry behind a non-atomic
//! `Rc`; other shards never touch it.
//!
//! Stopping is two-phase. The directory first drops its own reference and
//! runs the service's stop hook on the owning shard, then waits until the
//! instance is actually freed. Services that defer work holding a
//! [`Local`] reference opt into that wait with [`Service::TRACK_DELETION`].

use crate::error::{Error, Result};
use crate::message::Message;
use crate::shard::{current_shard, ShardId};
use crate::smp::{wait_all, ShardFuture, Smp};
use ahash::AHashMap;
use std::any::{type_name, Any};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::marker::PhantomData;
use std::ops::Deref;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Global directory ID counter
static DIRECTORY_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

thread_local! {
    static INSTANCES: RefCell<AHashMap<u64, Box<dyn Any>>> = RefCell::new(AHashMap::new());
}

/// A stateful service hosted by a [`Directory`]
pub trait Service: 'static {
    /// Make [`Directory::stop`] wait until the last [`Local`] reference to
    /// the instance is released, not just until the stop hook returns.
    const TRACK_DELETION: bool = false;

    /// Called on the owning shard once the directory has let go
    fn stop(&self) -> Result<()> {
        Ok(())
    }
}

struct Instance<S> {
    service: S,
    freed: Cell<Option<flume::Sender<()>>>,
}

impl<S> Drop for Instance<S> {
    fn drop(&mut self) {
        if let Some(freed) = self.freed.take() {
            let _ = freed.send(());
        }
    }
}

/// Shard-local shared reference to a service instance
///
/// Cloning is a plain, non-atomic reference count bump. A `Local` never
/// leaves its shard.
pub struct Local<S> {
    instance: Rc<Instance<S>>,
}

impl<S> Local<S> {
    fn new(service: S) -> Self {
        Self {
            instance: Rc::new(Instance {
                service,
                freed: Cell::new(None),
            }),
        }
    }

    /// Number of live references to the instance
    pub fn ref_count(this: &Self) -> usize {
        Rc::strong_count(&this.instance)
    }
}

impl<S> Clone for Local<S> {
    fn clone(&self) -> Self {
        Self {
            instance: Rc::clone(&self.instance),
        }
    }
}

impl<S> Deref for Local<S> {
    type Target = S;

    fn deref(&self) -> &S {
        &self.instance.service
    }
}

fn lookup<S: Service>(directory: u64) -> Option<Local<S>> {
    INSTANCES.with(|instances| {
        instances
            .borrow()
            .get(&directory)
            .and_then(|boxed| boxed.downcast_ref::<Local<S>>())
            .cloned()
    })
}

fn install<S: Service>(directory: u64, local: Local<S>) {
    let previous = INSTANCES.with(|instances| instances.borrow_mut().insert(directory, Box::new(local)));
    // dropped outside the borrow
    drop(previous);
}

fn remove<S: Service>(directory: u64) -> Option<Local<S>> {
    INSTANCES
        .with(|instances| instances.borrow_mut().remove(&directory))
        .and_then(|boxed| boxed.downcast::<Local<S>>().ok())
        .map(|boxed| *boxed)
}

/// Outcome of the first stop phase on one shard
struct Released {
    freed: flume::Receiver<()>,
    hook: Result<()>,
}

fn release_local<S: Service>(directory: u64) -> Option<Released> {
    let local = remove::<S>(directory)?;

    let (tx, freed) = flume::bounded(1);
    if S::TRACK_DELETION {
        local.instance.freed.set(Some(tx));
    } else {
        let _ = tx.send(());
    }

    let hook = local.stop();
    debug!(
        directory,
        refs = Local::ref_count(&local),
        "released {}",
        type_name::<S>()
    );
    drop(local);

    Some(Released { freed, hook })
}

/// One instance of `S` per shard, reachable only by message passing
pub struct Directory<S: Service> {
    id: u64,
    smp: Smp,
    shards: Vec<ShardId>,
    _service: PhantomData<fn() -> S>,
}

impl<S: Service> Directory<S> {
    /// Create an empty directory over the shards of `smp`
    pub fn new(smp: &Smp) -> Self {
        Self {
            id: DIRECTORY_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
            smp: smp.clone(),
            shards: Vec::new(),
            _service: PhantomData,
        }
    }

    /// Shards currently holding an instance, in ascending order
    pub fn shards(&self) -> &[ShardId] {
        &self.shards
    }

    /// Whether any instance is started
    pub fn is_started(&self) -> bool {
        !self.shards.is_empty()
    }

    /// Construct an instance on every shard
    ///
    /// `factory` runs on each target shard with that shard's id.
    pub fn start<F>(&mut self, factory: F) -> Result<()>
    where
        F: Fn(ShardId) -> Result<S> + Send + Sync + 'static,
    {
        let shards = (0..self.smp.count()).collect();
        self.start_on(shards, factory)
    }

    /// Construct an instance on every shard except shard 0
    pub fn start_reserved<F>(&mut self, factory: F) -> Result<()>
    where
        F: Fn(ShardId) -> Result<S> + Send + Sync + 'static,
    {
        if self.smp.count() < 2 {
            return Err(Error::InvalidConfig(
                "start_reserved needs at least two shards".to_string(),
            ));
        }
        let shards = (1..self.smp.count()).collect();
        self.start_on(shards, factory)
    }

    /// Construct a single instance on `shard`
    pub fn start_single<F>(&mut self, shard: ShardId, factory: F) -> Result<()>
    where
        F: Fn(ShardId) -> Result<S> + Send + Sync + 'static,
    {
        if shard >= self.smp.count() {
            return Err(Error::ShardNotFound(shard));
        }
        self.start_on(vec![shard], factory)
    }

    fn start_on<F>(&mut self, shards: Vec<ShardId>, factory: F) -> Result<()>
    where
        F: Fn(ShardId) -> Result<S> + Send + Sync + 'static,
    {
        if self.is_started() {
            return Err(Error::AlreadyStarted);
        }

        let id = self.id;
        let factory = Arc::new(factory);
        let futures: Vec<_> = shards
            .iter()
            .map(|&shard| {
                let factory = Arc::clone(&factory);
                self.smp.try_submit_to(shard, move || {
                    install(id, Local::new(factory(shard)?));
                    Ok(())
                })
            })
            .collect();

        self.shards = shards;
        let failure = wait_all(futures).into_iter().find_map(Result::err);

        match failure {
            None => {
                info!(
                    directory = id,
                    shards = ?self.shards,
                    "started {}",
                    type_name::<S>()
                );
                Ok(())
            }
            Some(e) => {
                warn!(directory = id, "start failed, rolling back: {}", e);
                if let Err(stop_err) = self.stop() {
                    warn!(directory = id, "rollback stop failed: {}", stop_err);
                }
                Err(e)
            }
        }
    }

    /// Stop and destroy every instance
    ///
    /// Returns once every instance is freed. The first stop hook error, if
    /// any, is returned after all shards have drained.
    pub fn stop(&mut self) -> Result<()> {
        let shards = std::mem::take(&mut self.shards);
        if shards.is_empty() {
            return Ok(());
        }

        let id = self.id;
        let futures: Vec<_> = shards
            .iter()
            .map(|&shard| self.smp.submit_to(shard, move || release_local::<S>(id)))
            .collect();

        let mut first_error = None;
        for (&shard, released) in shards.iter().zip(wait_all(futures)) {
            let drained = match released {
                Ok(Some(Released { freed, hook })) => freed
                    .recv()
                    .map_err(|_| Error::ShardStopped(shard))
                    .and(hook),
                Ok(None) => Ok(()),
                Err(e) => Err(e),
            };
            if let Err(e) = drained {
                warn!(directory = id, shard, "stop: {}", e);
                first_error.get_or_insert(e);
            }
        }

        info!(directory = id, "stopped {}", type_name::<S>());
        first_error.map_or(Ok(()), Err)
    }

    /// Run `func` against the instance on `shard`
    pub fn invoke_on<F, R>(&self, shard: ShardId, func: F) -> ShardFuture<R>
    where
        F: FnOnce(&Local<S>) -> R + Send + 'static,
        R: Message,
    {
        self.try_invoke_on(shard, move |local| Ok(func(local)))
    }

    /// Like [`Directory::invoke_on`] for operations that can fail
    pub fn try_invoke_on<F, R>(&self, shard: ShardId, func: F) -> ShardFuture<R>
    where
        F: FnOnce(&Local<S>) -> Result<R> + Send + 'static,
        R: Message,
    {
        let id = self.id;
        self.smp.try_submit_to(shard, move || {
            let local = lookup::<S>(id).ok_or(Error::NoInstance(shard))?;
            func(&local)
        })
    }

    fn fan_out<F, R>(&self, func: F) -> Vec<Result<R>>
    where
        F: Fn(&Local<S>) -> R + Send + Sync + 'static,
        R: Message,
    {
        let func = Arc::new(func);
        let futures: Vec<_> = self
            .shards
            .iter()
            .map(|&shard| {
                let func = Arc::clone(&func);
                self.invoke_on(shard, move |local| func(local))
            })
            .collect();
        wait_all(futures)
    }

    /// Run `func` on every instance in parallel
    ///
    /// Waits for all shards, then reports the first failure.
    pub fn invoke_on_all<F>(&self, func: F) -> Result<()>
    where
        F: Fn(&Local<S>) -> Result<()> + Send + Sync + 'static,
    {
        self.fan_out(func)
            .into_iter()
            .map(|result| result.and_then(|inner| inner))
            .find_map(Result::err)
            .map_or(Ok(()), Err)
    }

    /// Run `mapper` on every instance; results are in shard order
    pub fn map<F, R>(&self, mapper: F) -> Result<Vec<R>>
    where
        F: Fn(&Local<S>) -> R + Send + Sync + 'static,
        R: Message,
    {
        self.fan_out(mapper).into_iter().collect()
    }

    /// Run `mapper` on every instance and fold the results with `reducer`
    ///
    /// `reducer` must be associative; shards execute in no particular order.
    pub fn map_reduce<F, R, I, Red>(&self, mapper: F, initial: I, mut reducer: Red) -> Result<I>
    where
        F: Fn(&Local<S>) -> R + Send + Sync + 'static,
        R: Message,
        Red: FnMut(I, R) -> I,
    {
        let mut acc = initial;
        for result in self.fan_out(mapper) {
            acc = reducer(acc, result?);
        }
        Ok(acc)
    }

    /// Whether the calling shard holds an instance
    pub fn local_is_initialized(&self) -> bool {
        current_shard().is_some() && lookup::<S>(self.id).is_some()
    }

    /// Run `func` against the calling shard's instance
    pub fn with_local<F, R>(&self, func: F) -> Result<R>
    where
        F: FnOnce(&S) -> R,
    {
        let local = self.local_shared()?;
        Ok(func(&local))
    }

    /// Shared reference to the calling shard's instance
    pub fn local_shared(&self) -> Result<Local<S>> {
        let shard = current_shard().ok_or(Error::NotOnShard)?;
        lookup::<S>(self.id).ok_or(Error::NoInstance(shard))
    }
}

impl<S: Service> Drop for Directory<S> {
    fn drop(&mut self) {
        if self.is_started() {
            warn!(directory = self.id, "directory dropped while started; stopping");
            let _ = self.stop();
        }
    }
}

impl<S: Service> fmt::Debug for Directory<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Directory")
            .field("id", &self.id)
            .field("service", &type_name::<S>())
            .field("shards", &self.shards)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shard::spawn_local;
    use crate::smp::SmpConfig;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Duration;

    struct Counter {
        shard: ShardId,
        hits: Cell<u64>,
        stops: Arc<AtomicUsize>,
    }

    impl Service for Counter {
        fn stop(&self) -> Result<()> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn counter_factory(stops: &Arc<AtomicUsize>) -> impl Fn(ShardId) -> Result<Counter> + Send + Sync + 'static {
        let stops = Arc::clone(stops);
        move |shard| {
            Ok(Counter {
                shard,
                hits: Cell::new(0),
                stops: Arc::clone(&stops),
            })
        }
    }

    fn smp(n: usize) -> Smp {
        Smp::new(SmpConfig::new().with_num_shards(n)).unwrap()
    }

    #[test]
    fn test_start_map_and_stop() {
        let smp = smp(4);
        let stops = Arc::new(AtomicUsize::new(0));
        let mut dir = Directory::new(&smp);
        dir.start(counter_factory(&stops)).unwrap();
        assert_eq!(dir.shards(), &[0, 1, 2, 3]);

        let owners = dir.map(|c| (c.shard, current_shard())).unwrap();
        assert_eq!(
            owners,
            (0..4).map(|s| (s, Some(s))).collect::<Vec<_>>()
        );

        dir.invoke_on_all(|c| {
            c.hits.set(c.hits.get() + 10);
            Ok(())
        })
        .unwrap();
        dir.invoke_on(2, |c| c.hits.set(c.hits.get() + 1)).wait().unwrap();

        let total = dir.map_reduce(|c| c.hits.get(), 0u64, |acc, h| acc + h).unwrap();
        assert_eq!(total, 41);

        dir.stop().unwrap();
        assert_eq!(stops.load(Ordering::SeqCst), 4);
        assert!(!dir.is_started());
    }

    #[test]
    fn test_invoke_without_instance() {
        let smp = smp(3);
        let stops = Arc::new(AtomicUsize::new(0));
        let mut dir = Directory::new(&smp);
        dir.start_single(2, counter_factory(&stops)).unwrap();

        assert!(matches!(dir.invoke_on(0, |c| c.shard).wait(), Err(Error::NoInstance(0))));
        assert_eq!(dir.invoke_on(2, |c| c.shard).wait().unwrap(), 2);
        assert!(matches!(dir.invoke_on(7, |c| c.shard).wait(), Err(Error::ShardNotFound(7))));

        dir.stop().unwrap();
        assert!(matches!(dir.invoke_on(2, |c| c.shard).wait(), Err(Error::NoInstance(2))));
    }

    #[test]
    fn test_start_reserved_skips_shard_zero() {
        let smp = smp(3);
        let stops = Arc::new(AtomicUsize::new(0));
        let mut dir = Directory::new(&smp);
        dir.start_reserved(counter_factory(&stops)).unwrap();

        assert_eq!(dir.map(|c| c.shard).unwrap(), vec![1, 2]);
        assert!(matches!(dir.invoke_on(0, |c| c.shard).wait(), Err(Error::NoInstance(0))));
        dir.stop().unwrap();
    }

    #[test]
    fn test_start_twice_is_rejected() {
        let smp = smp(1);
        let stops = Arc::new(AtomicUsize::new(0));
        let mut dir = Directory::new(&smp);
        dir.start(counter_factory(&stops)).unwrap();
        assert!(matches!(dir.start(counter_factory(&stops)), Err(Error::AlreadyStarted)));
        dir.stop().unwrap();
    }

    #[test]
    fn test_failed_start_rolls_back() {
        let smp = smp(4);
        let stops = Arc::new(AtomicUsize::new(0));
        let make = counter_factory(&stops);
        let mut dir = Directory::new(&smp);

        let err = dir
            .start(move |shard| {
                if shard == 2 {
                    Err(Error::InvalidConfig("shard 2 refuses".to_string()))
                } else {
                    make(shard)
                }
            })
            .unwrap_err();

        assert!(matches!(err, Error::InvalidConfig(_)));
        assert!(!dir.is_started());
        // the three instances that were built got their stop hook
        assert_eq!(stops.load(Ordering::SeqCst), 3);
        assert!(matches!(dir.invoke_on(0, |c| c.shard).wait(), Err(Error::NoInstance(0))));
    }

    #[test]
    fn test_invoke_on_all_reports_failure_after_all_shards_ran() {
        let smp = smp(3);
        let stops = Arc::new(AtomicUsize::new(0));
        let mut dir = Directory::new(&smp);
        dir.start(counter_factory(&stops)).unwrap();

        let err = dir
            .invoke_on_all(|c| {
                c.hits.set(1);
                if c.shard == 1 {
                    Err(Error::InvalidConfig("no".to_string()))
                } else {
                    Ok(())
                }
            })
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
        assert_eq!(dir.map(|c| c.hits.get()).unwrap(), vec![1, 1, 1]);
        dir.stop().unwrap();
    }

    #[test]
    fn test_local_access_is_shard_confined() {
        let smp = smp(2);
        let stops = Arc::new(AtomicUsize::new(0));
        let mut dir = Directory::new(&smp);
        dir.start_single(1, counter_factory(&stops)).unwrap();
        assert!(matches!(dir.local_shared(), Err(Error::NotOnShard)));
        assert!(!dir.local_is_initialized());

        let dir = Arc::new(dir);
        let on_1 = Arc::clone(&dir);
        let found = smp
            .submit_to(1, move || on_1.with_local(|c| c.shard).ok())
            .wait()
            .unwrap();
        assert_eq!(found, Some(1));

        let on_0 = Arc::clone(&dir);
        let missing = smp
            .submit_to(0, move || matches!(on_0.local_shared(), Err(Error::NoInstance(0))))
            .wait()
            .unwrap();
        assert!(missing);

        let mut dir = Arc::try_unwrap(dir).unwrap();
        dir.stop().unwrap();
    }

    struct Tracked;

    impl Service for Tracked {
        const TRACK_DELETION: bool = true;
    }

    struct Untracked;

    impl Service for Untracked {}

    /// Keeps `held` alive on its shard until `gate` fires
    fn hold_until<S: Service>(held: Local<S>, gate: flume::Receiver<()>) {
        if gate.try_recv().is_ok() {
            drop(held);
            return;
        }
        spawn_local(move || hold_until(held, gate)).unwrap();
    }

    fn stop_in_background<S: Service>(mut dir: Directory<S>) -> flume::Receiver<Result<()>> {
        let (done_tx, done_rx) = flume::bounded(1);
        thread::spawn(move || {
            let _ = done_tx.send(dir.stop());
        });
        done_rx
    }

    #[test]
    fn test_stop_waits_for_outstanding_reference() {
        let smp = smp(2);
        let mut dir = Directory::new(&smp);
        dir.start(|_| Ok(Tracked)).unwrap();

        let (gate_tx, gate_rx) = flume::bounded(1);
        dir.invoke_on(0, move |local| hold_until(local.clone(), gate_rx))
            .wait()
            .unwrap();

        let done = stop_in_background(dir);
        thread::sleep(Duration::from_millis(100));
        assert!(done.try_recv().is_err(), "stop returned while a reference was held");

        gate_tx.send(()).unwrap();
        done.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
    }

    #[test]
    fn test_untracked_stop_does_not_wait_for_references() {
        let smp = smp(1);
        let mut dir = Directory::new(&smp);
        dir.start(|_| Ok(Untracked)).unwrap();

        let (gate_tx, gate_rx) = flume::bounded(1);
        dir.invoke_on(0, move |local| hold_until(local.clone(), gate_rx))
            .wait()
            .unwrap();

        let done = stop_in_background(dir);
        done.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
        gate_tx.send(()).unwrap();
    }
}
