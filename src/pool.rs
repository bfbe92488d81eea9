//! Pooled execution: a bounded set of worker ids handed out with a take/put
//! discipline, plus a caching variant that stores closure-like functions on
//! the workers the first time they run there.
//!
//! A pool is addressable cluster-wide: it embeds a [`RemoteChannel`] whose
//! identity keys a weak registry on the owning process. Serializing a pool
//! sends that anchor; a non-owner copy forwards every operation to the owner
//! over RPC, an owner copy binds back to the original pool object.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, Weak};
use std::thread;

use anyhow::Error;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::cluster::{ProcessGroup, ProcessId};
use crate::error::ClusterError;
use crate::proto::{Payload, RefId, RemoteFunc};
use crate::refs::{Future, RemoteChannel};
use crate::rpc::{ExecFromCacheArgs, PoolRidArgs, PoolWorkerArgs};
use crate::vchannel::BoundedChannel;

/// The owner-side state of a pool: the queue of available ids and the member
/// set.
pub(crate) struct PoolInner {
    queue: BoundedChannel<ProcessId>,
    members: Mutex<BTreeSet<ProcessId>>,
    is_default: bool,
}

impl PoolInner {
    fn new(is_default: bool) -> PoolInner {
        PoolInner {
            queue: BoundedChannel::unbounded(),
            members: Mutex::new(BTreeSet::new()),
            is_default,
        }
    }

    /// Take an available worker, blocking until one is released. Ids that
    /// left the cluster are dropped from the pool instead of being handed
    /// out. The default pool substitutes this process when it has no members.
    pub(crate) fn take(&self, group: &Arc<ProcessGroup>) -> Result<ProcessId, Error> {
        if self.is_default && self.members.lock().unwrap().is_empty() {
            return Ok(group.myid());
        }
        loop {
            let pid = self
                .queue
                .take()
                .map_err(|_| ClusterError::Pool("the pool is closed".into()))?;
            if pid == group.myid() || group.id_in_procs(pid) {
                return Ok(pid);
            }
            debug!("Dropping worker {} from the pool: no longer in the cluster", pid);
            self.members.lock().unwrap().remove(&pid);
        }
    }

    /// Release a worker back to the queue; ids that are no longer members
    /// are returned but not requeued.
    pub(crate) fn put(&self, pid: ProcessId) -> Result<ProcessId, Error> {
        if self.members.lock().unwrap().contains(&pid) {
            self.queue
                .put(pid)
                .map_err(|_| ClusterError::Pool("the pool is closed".into()))?;
        }
        Ok(pid)
    }

    /// Add a new member to the pool and make it available.
    pub(crate) fn push(&self, pid: ProcessId) -> Result<(), Error> {
        self.members.lock().unwrap().insert(pid);
        self.queue
            .put(pid)
            .map_err(|_| ClusterError::Pool("the pool is closed".into()))?;
        Ok(())
    }

    /// How many workers are available right now.
    pub(crate) fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether a take would not block.
    pub(crate) fn is_ready(&self) -> bool {
        self.queue.is_ready()
    }

    /// The members of the pool, available or not.
    pub(crate) fn workers(&self) -> Vec<ProcessId> {
        self.members.lock().unwrap().iter().copied().collect()
    }
}

/// Find a pool owned by this process by the id of its anchor channel.
pub(crate) fn lookup_pool(
    group: &Arc<ProcessGroup>,
    rid: RefId,
) -> Result<Arc<PoolInner>, Error> {
    let mut pools = group.pools.lock().unwrap();
    match pools.get(&rid).and_then(Weak::upgrade) {
        Some(pool) => Ok(pool),
        None => {
            pools.remove(&rid);
            Err(ClusterError::Pool(format!("no pool registered for {}", rid)).into())
        }
    }
}

enum PoolImpl {
    /// This process owns the pool state.
    Owned {
        inner: Arc<PoolInner>,
        anchor: RemoteChannel<()>,
    },
    /// The pool lives elsewhere; operations forward to the owner.
    Remote {
        anchor: RemoteChannel<()>,
        is_default: bool,
    },
}

/// A pool of worker ids with a take/put discipline.
///
/// `remotecall`-style helpers take a worker, dispatch the call and release
/// the worker when the computation is done, so a pooled worker never runs two
/// pooled computations at once.
pub struct WorkerPool {
    imp: PoolImpl,
}

impl WorkerPool {
    /// A pool owned by this process with the given members.
    pub fn new(group: &Arc<ProcessGroup>, workers: &[ProcessId]) -> Result<WorkerPool, Error> {
        WorkerPool::new_with(group, workers, false)
    }

    fn new_with(
        group: &Arc<ProcessGroup>,
        workers: &[ProcessId],
        is_default: bool,
    ) -> Result<WorkerPool, Error> {
        let anchor = RemoteChannel::new(group, group.myid())?;
        let inner = Arc::new(PoolInner::new(is_default));
        for &pid in workers {
            inner.push(pid)?;
        }
        group
            .pools
            .lock()
            .unwrap()
            .insert(anchor.id(), Arc::downgrade(&inner));
        Ok(WorkerPool {
            imp: PoolImpl::Owned { inner, anchor },
        })
    }

    fn anchor(&self) -> &RemoteChannel<()> {
        match &self.imp {
            PoolImpl::Owned { anchor, .. } => anchor,
            PoolImpl::Remote { anchor, .. } => anchor,
        }
    }

    pub(crate) fn group(&self) -> Result<Arc<ProcessGroup>, Error> {
        self.anchor().group()
    }

    /// Take an available worker, blocking until one is released.
    pub fn take(&self) -> Result<ProcessId, Error> {
        let group = self.group()?;
        match &self.imp {
            PoolImpl::Owned { inner, .. } => inner.take(&group),
            PoolImpl::Remote { anchor, .. } => {
                let payload = group.call_on_owner(
                    "pool_take",
                    anchor.owner(),
                    &PoolRidArgs { rid: anchor.id() },
                )?;
                group.decode(&payload)
            }
        }
    }

    /// Release a worker back to the pool. The id is requeued only if it is
    /// still a member; it is returned either way.
    pub fn put(&self, pid: ProcessId) -> Result<ProcessId, Error> {
        let group = self.group()?;
        match &self.imp {
            PoolImpl::Owned { inner, .. } => inner.put(pid),
            PoolImpl::Remote { anchor, .. } => {
                let payload = group.call_on_owner(
                    "pool_put",
                    anchor.owner(),
                    &PoolWorkerArgs {
                        rid: anchor.id(),
                        worker: pid,
                    },
                )?;
                group.decode(&payload)
            }
        }
    }

    /// Add a new member to the pool and make it available.
    pub fn push(&self, pid: ProcessId) -> Result<(), Error> {
        let group = self.group()?;
        match &self.imp {
            PoolImpl::Owned { inner, .. } => inner.push(pid),
            PoolImpl::Remote { anchor, .. } => {
                group.call_on_owner(
                    "pool_push",
                    anchor.owner(),
                    &PoolWorkerArgs {
                        rid: anchor.id(),
                        worker: pid,
                    },
                )?;
                Ok(())
            }
        }
    }

    /// How many workers are available right now.
    pub fn len(&self) -> Result<usize, Error> {
        let group = self.group()?;
        match &self.imp {
            PoolImpl::Owned { inner, .. } => Ok(inner.len()),
            PoolImpl::Remote { anchor, .. } => {
                let payload = group.call_on_owner(
                    "pool_len",
                    anchor.owner(),
                    &PoolRidArgs { rid: anchor.id() },
                )?;
                group.decode(&payload)
            }
        }
    }

    /// Whether a take would not block.
    pub fn is_ready(&self) -> Result<bool, Error> {
        let group = self.group()?;
        match &self.imp {
            PoolImpl::Owned { inner, .. } => Ok(inner.is_ready()),
            PoolImpl::Remote { anchor, .. } => {
                let payload = group.call_on_owner(
                    "pool_ready",
                    anchor.owner(),
                    &PoolRidArgs { rid: anchor.id() },
                )?;
                group.decode(&payload)
            }
        }
    }

    /// The members of the pool, available or not.
    pub fn workers(&self) -> Result<Vec<ProcessId>, Error> {
        let group = self.group()?;
        match &self.imp {
            PoolImpl::Owned { inner, .. } => Ok(inner.workers()),
            PoolImpl::Remote { anchor, .. } => {
                let payload = group.call_on_owner(
                    "pool_workers",
                    anchor.owner(),
                    &PoolRidArgs { rid: anchor.id() },
                )?;
                group.decode(&payload)
            }
        }
    }

    /// Take a worker, dispatch `remotecall` on it, and release it after the
    /// returned future completes (a background thread waits for it). A
    /// submission failure releases the worker immediately and rethrows.
    pub fn remotecall<A, R>(&self, func: &RemoteFunc, args: &A) -> Result<Future<R>, Error>
    where
        A: Serialize,
    {
        let group = self.group()?;
        let worker = self.take()?;
        match group.remotecall(func, worker, args) {
            Ok(fut) => {
                self.release_after(worker, &fut);
                Ok(fut)
            }
            Err(e) => {
                let _ = self.put(worker);
                Err(e)
            }
        }
    }

    fn release_after<R>(&self, worker: ProcessId, fut: &Future<R>) {
        // the untyped view keeps the thread free of the caller's result type
        let fut = fut.untyped();
        let pool = self.clone();
        thread::Builder::new()
            .name(format!("Pool release for worker {}", worker))
            .spawn(move || {
                let _ = fut.wait();
                let _ = pool.put(worker);
            })
            .expect("Failed to spawn pool release thread");
    }

    /// Take a worker, run `remotecall_fetch` on it, release it.
    pub fn remotecall_fetch<A, R>(&self, func: &RemoteFunc, args: &A) -> Result<R, Error>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let group = self.group()?;
        let worker = self.take()?;
        defer! {
            let _ = self.put(worker);
        }
        group.remotecall_fetch(func, worker, args)
    }

    /// Take a worker, run `remotecall_wait` on it, release it once the
    /// computation completed.
    pub fn remotecall_wait<A, R>(&self, func: &RemoteFunc, args: &A) -> Result<Future<R>, Error>
    where
        A: Serialize,
    {
        let group = self.group()?;
        let worker = self.take()?;
        defer! {
            let _ = self.put(worker);
        }
        group.remotecall_wait(func, worker, args)
    }

    /// Take a worker, fire `remote_do` on it, release it right away.
    pub fn remote_do<A>(&self, func: &RemoteFunc, args: &A) -> Result<(), Error>
    where
        A: Serialize,
    {
        let group = self.group()?;
        let worker = self.take()?;
        defer! {
            let _ = self.put(worker);
        }
        group.remote_do(func, worker, args)
    }
}

impl Clone for WorkerPool {
    fn clone(&self) -> WorkerPool {
        WorkerPool {
            imp: match &self.imp {
                PoolImpl::Owned { inner, anchor } => PoolImpl::Owned {
                    inner: inner.clone(),
                    anchor: anchor.clone(),
                },
                PoolImpl::Remote { anchor, is_default } => PoolImpl::Remote {
                    anchor: anchor.clone(),
                    is_default: *is_default,
                },
            },
        }
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match &self.imp {
            PoolImpl::Owned { inner, anchor } => write!(
                f,
                "WorkerPool(owned, {}, workers: {:?})",
                anchor.id(),
                inner.workers()
            ),
            PoolImpl::Remote { anchor, .. } => {
                write!(f, "WorkerPool(on worker {}, {})", anchor.owner(), anchor.id())
            }
        }
    }
}

#[derive(Serialize, Deserialize)]
struct PoolWire {
    anchor: RemoteChannel<()>,
    is_default: bool,
}

impl Serialize for WorkerPool {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let is_default = match &self.imp {
            PoolImpl::Owned { inner, .. } => inner.is_default,
            PoolImpl::Remote { is_default, .. } => *is_default,
        };
        PoolWire {
            anchor: self.anchor().clone(),
            is_default,
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for WorkerPool {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<WorkerPool, D::Error> {
        let wire = PoolWire::deserialize(deserializer)?;
        let group = wire.anchor.group().map_err(serde::de::Error::custom)?;
        if wire.anchor.owner() == group.myid() {
            // back on the owner: bind to the original pool object
            if let Ok(inner) = lookup_pool(&group, wire.anchor.id()) {
                return Ok(WorkerPool {
                    imp: PoolImpl::Owned {
                        inner,
                        anchor: wire.anchor,
                    },
                });
            }
        }
        Ok(WorkerPool {
            imp: PoolImpl::Remote {
                anchor: wire.anchor,
                is_default: wire.is_default,
            },
        })
    }
}

impl ProcessGroup {
    /// The default worker pool of the cluster. Created lazily on the master
    /// with every current worker as a member; workers fetch it from the
    /// master on first access. When it has no members, its take substitutes
    /// the master itself.
    pub fn default_worker_pool(self: &Arc<Self>) -> Result<WorkerPool, Error> {
        if let Some(pool) = self.default_pool.lock().unwrap().clone() {
            return Ok(pool);
        }
        let pool = if self.is_master() {
            WorkerPool::new_with(self, &self.workers(), true)?
        } else {
            let payload = self.call_on_owner("default_pool", 1, &())?;
            self.decode(&payload)?
        };
        let mut slot = self.default_pool.lock().unwrap();
        if slot.is_none() {
            *slot = Some(pool.clone());
        }
        Ok(slot.clone().unwrap())
    }
}

/// A worker pool that caches closure-like functions on the workers.
///
/// The first time a function is dispatched to a worker, it travels together
/// with a fresh [`RemoteChannel`] owned by that worker, and the worker stores
/// the function in it. Every later dispatch of the same function to the same
/// worker sends only the channel reference: the worker fetches the function
/// locally instead of receiving it over the wire again. [`clear`]
/// (CachingPool::clear) drops the channels, evicting the remote copies.
pub struct CachingPool {
    pool: WorkerPool,
    map: Mutex<HashMap<(ProcessId, String, Payload), RemoteChannel<RemoteFunc>>>,
}

impl CachingPool {
    /// A caching pool owned by this process with the given members.
    pub fn new(group: &Arc<ProcessGroup>, workers: &[ProcessId]) -> Result<CachingPool, Error> {
        Ok(CachingPool::from_pool(WorkerPool::new(group, workers)?))
    }

    /// Wrap an existing pool with a function cache.
    pub fn from_pool(pool: WorkerPool) -> CachingPool {
        CachingPool {
            pool,
            map: Mutex::new(HashMap::new()),
        }
    }

    /// The wrapped pool.
    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// How many `(worker, function)` pairs are cached.
    pub fn cached_len(&self) -> usize {
        self.map.lock().unwrap().len()
    }

    /// Drop every cached channel, evicting the remote function copies.
    pub fn clear(&self) {
        self.map.lock().unwrap().clear();
    }

    /// The channel caching `func` on `worker`, plus the function itself when
    /// this is its first dispatch there.
    fn cached(
        &self,
        group: &Arc<ProcessGroup>,
        worker: ProcessId,
        func: &RemoteFunc,
    ) -> Result<(Option<RemoteFunc>, RemoteChannel<RemoteFunc>), Error> {
        let key = (worker, func.name.clone(), func.env.clone());
        if let Some(chan) = self.map.lock().unwrap().get(&key) {
            return Ok((None, chan.clone()));
        }
        // created outside the lock, it needs a round trip to the worker
        let chan = RemoteChannel::new(group, worker)?;
        let chan = self
            .map
            .lock()
            .unwrap()
            .entry(key)
            .or_insert(chan)
            .clone();
        Ok((Some(func.clone()), chan))
    }

    fn exec_args<A: Serialize>(
        &self,
        group: &Arc<ProcessGroup>,
        worker: ProcessId,
        func: &RemoteFunc,
        args: &A,
    ) -> Result<ExecFromCacheArgs, Error> {
        let (prime, chan) = self.cached(group, worker, func)?;
        Ok(ExecFromCacheArgs {
            prime,
            chan,
            args: group.encode_for(worker, args)?,
        })
    }

    /// Pooled `remotecall` through the function cache.
    pub fn remotecall<A, R>(&self, func: &RemoteFunc, args: &A) -> Result<Future<R>, Error>
    where
        A: Serialize,
    {
        let group = self.pool.group()?;
        let worker = self.pool.take()?;
        let submit = self
            .exec_args(&group, worker, func, args)
            .and_then(|exec| group.remotecall(&RemoteFunc::new("exec_from_cache"), worker, &exec));
        match submit {
            Ok(fut) => {
                self.pool.release_after(worker, &fut);
                Ok(fut)
            }
            Err(e) => {
                let _ = self.pool.put(worker);
                Err(e)
            }
        }
    }

    /// Pooled `remotecall_fetch` through the function cache.
    pub fn remotecall_fetch<A, R>(&self, func: &RemoteFunc, args: &A) -> Result<R, Error>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let group = self.pool.group()?;
        let worker = self.pool.take()?;
        defer! {
            let _ = self.pool.put(worker);
        }
        let exec = self.exec_args(&group, worker, func, args)?;
        group.remotecall_fetch(&RemoteFunc::new("exec_from_cache"), worker, &exec)
    }

    /// Pooled `remotecall_wait` through the function cache.
    pub fn remotecall_wait<A, R>(&self, func: &RemoteFunc, args: &A) -> Result<Future<R>, Error>
    where
        A: Serialize,
    {
        let group = self.pool.group()?;
        let worker = self.pool.take()?;
        defer! {
            let _ = self.pool.put(worker);
        }
        let exec = self.exec_args(&group, worker, func, args)?;
        group.remotecall_wait(&RemoteFunc::new("exec_from_cache"), worker, &exec)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_local_pool_take_put() {
        let group = ProcessGroup::standalone(1);
        let pool = WorkerPool::new(&group, &[]).unwrap();
        // only this process is in the cluster, so only it can be pooled
        pool.push(1).unwrap();
        assert_eq!(pool.len().unwrap(), 1);
        let w = pool.take().unwrap();
        assert_eq!(w, 1);
        assert_eq!(pool.len().unwrap(), 0);
        assert!(!pool.is_ready().unwrap());
        pool.put(w).unwrap();
        assert_eq!(pool.len().unwrap(), 1);
        group.shutdown();
    }

    #[test]
    fn test_put_of_non_member_is_not_requeued() {
        let group = ProcessGroup::standalone(1);
        let pool = WorkerPool::new(&group, &[]).unwrap();
        pool.put(7).unwrap();
        assert_eq!(pool.len().unwrap(), 0);
        group.shutdown();
    }

    #[test]
    fn test_default_pool_substitutes_self() {
        let group = ProcessGroup::standalone(1);
        group.register("whoami_stub", |(): ()| Ok(0i64));
        let pool = group.default_worker_pool().unwrap();
        // no workers: the master itself is handed out
        assert_eq!(pool.take().unwrap(), 1);
        // and pooled calls run locally
        let res: i64 = pool
            .remotecall_fetch(&RemoteFunc::new("whoami_stub"), &())
            .unwrap();
        assert_eq!(res, 0);
        group.shutdown();
    }

    #[test]
    fn test_caching_pool_runs_locally() {
        let group = ProcessGroup::standalone(1);
        group.register_with_env("add_base", |base: i64, x: i64| Ok(base + x));
        let pool = CachingPool::new(&group, &[1]).unwrap();
        let func = RemoteFunc::with_env("add_base", &10i64).unwrap();
        let a: i64 = pool.remotecall_fetch(&func, &5i64).unwrap();
        let b: i64 = pool.remotecall_fetch(&func, &7i64).unwrap();
        assert_eq!((a, b), (15, 17));
        assert_eq!(pool.cached_len(), 1);
        pool.clear();
        assert_eq!(pool.cached_len(), 0);
        group.shutdown();
    }
}
