//! Client-side remote references: write-once futures and channel handles.
//!
//! A handle names a cell on its owner node. Handles are canonicalized per
//! process: deserializing a reference whose identity is already known yields
//! the pre-existing object, so equality, the local value cache and the
//! drop-driven client tracking all work on one object per identity. The last
//! handle to drop emits exactly one del-client towards the owner.
//!
//! Serialization is context-sensitive: while a payload is encoded for a
//! destination, serializing an uncached handle buffers an add-client for that
//! destination towards the owner, so the receiver is accounted for before it
//! can possibly use the reference. Decoding runs inside a matching context
//! naming the receiving group.

use std::cell::RefCell;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::{Duration, Instant};

use anyhow::Error;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::cluster::{ProcessGroup, ProcessId};
use crate::error::{is_channel_closed, ClusterError, ReferenceError};
use crate::proto::{Outcome, RefId};
use crate::refstore::ChannelSpec;
use crate::rpc::{MakeChannelArgs, PutFutureArgs, PutRefArgs, RefArgs};

thread_local! {
    static ENCODE_CTX: RefCell<Vec<(Arc<ProcessGroup>, ProcessId)>> =
        const { RefCell::new(Vec::new()) };
    static DECODE_CTX: RefCell<Vec<Arc<ProcessGroup>>> = const { RefCell::new(Vec::new()) };
}

/// Scope during which serialized handles are accounted towards a destination
/// node. Entered by `ProcessGroup::encode_for`.
pub(crate) struct EncodeCtx;

impl EncodeCtx {
    pub(crate) fn enter(group: Arc<ProcessGroup>, dest: ProcessId) -> EncodeCtxGuard {
        ENCODE_CTX.with(|ctx| ctx.borrow_mut().push((group, dest)));
        EncodeCtxGuard
    }

    fn current() -> Option<(Arc<ProcessGroup>, ProcessId)> {
        ENCODE_CTX.with(|ctx| ctx.borrow().last().cloned())
    }
}

pub(crate) struct EncodeCtxGuard;

impl Drop for EncodeCtxGuard {
    fn drop(&mut self) {
        ENCODE_CTX.with(|ctx| ctx.borrow_mut().pop());
    }
}

/// Scope during which decoded handles canonicalize against a group. Entered
/// by `ProcessGroup::decode`.
pub(crate) struct DecodeCtx;

impl DecodeCtx {
    pub(crate) fn enter(group: Arc<ProcessGroup>) -> DecodeCtxGuard {
        DECODE_CTX.with(|ctx| ctx.borrow_mut().push(group));
        DecodeCtxGuard
    }

    fn current() -> Option<Arc<ProcessGroup>> {
        DECODE_CTX.with(|ctx| ctx.borrow().last().cloned())
    }
}

pub(crate) struct DecodeCtxGuard;

impl Drop for DecodeCtxGuard {
    fn drop(&mut self) {
        DECODE_CTX.with(|ctx| ctx.borrow_mut().pop());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RefKind {
    Future,
    Channel,
}

/// The per-identity state shared by every copy of a handle in this process.
pub(crate) struct RefState {
    pub(crate) rid: RefId,
    pub(crate) owner: ProcessId,
    kind: RefKind,
    group: Weak<ProcessGroup>,
    /// Local value cache, written at most once. Futures only.
    cache: OnceLock<Outcome>,
    /// Serializes the local put/fetch transitions of a future.
    lock: Mutex<()>,
}

impl RefState {
    /// Register a brand new reference created in this process.
    pub(crate) fn create(
        group: &Arc<ProcessGroup>,
        rid: RefId,
        owner: ProcessId,
        kind: RefKind,
    ) -> Arc<RefState> {
        let state = Arc::new(RefState {
            rid,
            owner,
            kind,
            group: Arc::downgrade(group),
            cache: OnceLock::new(),
            lock: Mutex::new(()),
        });
        group
            .client_refs
            .lock()
            .unwrap()
            .insert(rid, Arc::downgrade(&state));
        state
    }

    /// Canonicalize a deserialized reference: return the existing object for
    /// a known identity, registering a fresh one otherwise. When the incoming
    /// copy carries a cached value the existing handle lacks, the cache is
    /// merged and the usual del-on-cache-set bookkeeping fires.
    fn canonicalize(
        group: &Arc<ProcessGroup>,
        rid: RefId,
        owner: ProcessId,
        kind: RefKind,
        incoming_cache: Option<Outcome>,
    ) -> Arc<RefState> {
        let mut refs = group.client_refs.lock().unwrap();
        if let Some(existing) = refs.get(&rid).and_then(Weak::upgrade) {
            drop(refs);
            if let Some(value) = incoming_cache {
                if existing.cache.get().is_none() {
                    let _guard = existing.lock.lock().unwrap();
                    if existing.cache.set(value).is_ok() {
                        // the handle has its value now, release its slot in
                        // the owner's clientset
                        group.send_del_client(rid, existing.owner, group.myid());
                    }
                }
            }
            return existing;
        }
        let state = Arc::new(RefState {
            rid,
            owner,
            kind,
            group: Arc::downgrade(group),
            cache: OnceLock::new(),
            lock: Mutex::new(()),
        });
        if let Some(value) = incoming_cache {
            let _ = state.cache.set(value);
        }
        refs.insert(rid, Arc::downgrade(&state));
        drop(refs);
        // The sender does not account us on the owner when we are the owner:
        // register the local handle directly. Cached futures never touch the
        // cell again, so they stay out of the clientset.
        if owner == group.myid() && state.cache.get().is_none() {
            group.refstore.add_client(rid, group.myid());
        }
        state
    }

    pub(crate) fn group(&self) -> Result<Arc<ProcessGroup>, Error> {
        self.group
            .upgrade()
            .ok_or_else(|| ClusterError::Protocol("the process group is gone".into()).into())
    }

    /// Bookkeeping run while a handle is serialized into a payload: an
    /// uncached handle headed to a node other than the owner buffers an
    /// add-client for the destination.
    fn note_serialized(&self) {
        let Some((group, dest)) = EncodeCtx::current() else {
            return;
        };
        if dest == 0 || dest == group.myid() || dest == self.owner {
            return;
        }
        if self.kind == RefKind::Future && self.cache.get().is_some() {
            // the receiver gets the value merged into its copy, it will never
            // need the cell
            return;
        }
        group.send_add_client(self.rid, self.owner, dest);
    }
}

impl Drop for RefState {
    fn drop(&mut self) {
        let Some(group) = self.group.upgrade() else {
            return;
        };
        {
            let mut refs = match group.client_refs.lock() {
                Ok(refs) => refs,
                Err(_) => return, // may happen if the thread panicked
            };
            // a dead weak entry is ours; a live one belongs to a newer
            // canonical handle for the same identity
            if let Some(weak) = refs.get(&self.rid) {
                if weak.strong_count() == 0 {
                    refs.remove(&self.rid);
                }
            }
        }
        let send_del = match self.kind {
            RefKind::Channel => true,
            // a cached future already released its slot when the cache was
            // written
            RefKind::Future => self.cache.get().is_none(),
        };
        if send_del {
            group.send_del_client(self.rid, self.owner, group.myid());
        }
    }
}

impl std::fmt::Debug for RefState {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("RefState")
            .field("rid", &self.rid)
            .field("owner", &self.owner)
            .field("kind", &self.kind)
            .field("cached", &self.cache.get().is_some())
            .finish()
    }
}

/// A write-once remote value: the result slot of a `remotecall` or an
/// explicitly created single-assignment cell.
///
/// Futures cache the value locally after the first successful `fetch` or
/// `put`, so later fetches are free and the owner can drop this node from the
/// cell's clientset early. `T` is a compile-time convenience: the wire
/// carries no type, a mismatched `T` surfaces as a decode error.
pub struct Future<T> {
    state: Arc<RefState>,
    _value: PhantomData<fn() -> T>,
}

impl<T> Future<T> {
    /// Create a future whose backing cell will live on `pid`.
    pub fn new(group: &Arc<ProcessGroup>, pid: ProcessId) -> Future<T> {
        let rid = group.next_ref_id();
        Future::from_state(RefState::create(group, rid, pid, RefKind::Future))
    }

    pub(crate) fn from_state(state: Arc<RefState>) -> Future<T> {
        Future {
            state,
            _value: PhantomData,
        }
    }

    /// The same reference without the element type, for callers that only
    /// wait on completion.
    pub(crate) fn untyped(&self) -> Future<()> {
        Future::from_state(self.state.clone())
    }

    /// The cluster-wide identity of this reference.
    pub fn id(&self) -> RefId {
        self.state.rid
    }

    /// The node owning the backing cell.
    pub fn owner(&self) -> ProcessId {
        self.state.owner
    }

    /// Whether the value is already known locally, without blocking or
    /// touching the network.
    pub fn is_cached(&self) -> bool {
        self.state.cache.get().is_some()
    }

    pub(crate) fn fetch_outcome(&self) -> Result<Outcome, Error> {
        if let Some(out) = self.state.cache.get() {
            return Ok(out.clone());
        }
        let group = self.state.group()?;
        let out: Outcome = if self.state.owner == group.myid() {
            {
                // cache observed under the handle lock so a local put!
                // finishing concurrently is not read twice
                let _guard = self.state.lock.lock().unwrap();
                if let Some(out) = self.state.cache.get() {
                    return Ok(out.clone());
                }
            }
            let rv = group
                .refstore
                .lookup_or_create(self.state.rid, ChannelSpec::unbounded());
            match rv.channel().fetch() {
                Ok(out) => out,
                Err(e) => return Err(ClusterError::from(e).into()),
            }
        } else {
            match group.call_on_owner("fetch_ref", self.state.owner, &RefArgs { rid: self.state.rid })
            {
                Ok(payload) => Ok(payload),
                Err(e) => match e.downcast::<ClusterError>() {
                    // a remote failure is the outcome of the future and is
                    // cached like a value
                    Ok(ClusterError::Remote(remote)) => Err(remote),
                    Ok(other) => return Err(other.into()),
                    Err(e) => return Err(e),
                },
            }
        };
        if self.state.cache.set(out).is_ok() {
            // winner of the cache race releases this node's slot on the owner
            group.send_del_client(self.state.rid, self.state.owner, group.myid());
        }
        Ok(self.state.cache.get().cloned().unwrap())
    }

    /// Wait for the value and return it. A failure captured on the producing
    /// worker is unwrapped and returned as an error, again and again on every
    /// fetch. The first successful fetch caches: later calls answer locally.
    pub fn fetch(&self) -> Result<T, Error>
    where
        T: DeserializeOwned,
    {
        match self.fetch_outcome()? {
            Ok(payload) => self.state.group()?.decode(&payload),
            Err(remote) => Err(ClusterError::Remote(remote).into()),
        }
    }

    /// Wait until the future has completed, successfully or not.
    pub fn wait(&self) -> Result<(), Error> {
        self.fetch_outcome().map(|_| ())
    }

    /// Wait until the future has completed, giving up after `timeout`.
    /// Returns whether the future completed. Readiness is polled, the way
    /// timed waits are built on top of the runtime.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<bool, Error> {
        const POLL_INTERVAL: Duration = Duration::from_millis(10);
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_ready()? {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            std::thread::sleep(POLL_INTERVAL.min(deadline.saturating_duration_since(Instant::now())));
        }
    }

    /// Whether the value is already available, locally or on the owner.
    pub fn is_ready(&self) -> Result<bool, Error> {
        if self.state.cache.get().is_some() {
            return Ok(true);
        }
        let group = self.state.group()?;
        if self.state.owner == group.myid() {
            let rv = group
                .refstore
                .lookup_or_create(self.state.rid, ChannelSpec::unbounded());
            Ok(rv.channel().is_ready())
        } else {
            let payload =
                group.call_on_owner("isready_ref", self.state.owner, &RefArgs { rid: self.state.rid })?;
            group.decode(&payload)
        }
    }

    /// Set the value of the future. Fails with a reference-kind error if the
    /// future was already set, here or anywhere else in the cluster.
    pub fn put(&self, value: &T) -> Result<(), Error>
    where
        T: Serialize,
    {
        let group = self.state.group()?;
        let payload = group.encode_for(self.state.owner, value)?;
        let _guard = self.state.lock.lock().unwrap();
        if self.state.cache.get().is_some() {
            return Err(ClusterError::Reference(ReferenceError::AlreadySet).into());
        }
        if self.state.owner == group.myid() {
            let rv = group
                .refstore
                .lookup_or_create(self.state.rid, ChannelSpec::unbounded());
            rv.try_put_once(Ok(payload.clone()))
                .map_err(ClusterError::from)?;
            // holding the handle lock across the cell put and the cache write
            // means a local fetcher woken by the put always finds the cache
            let _ = self.state.cache.set(Ok(payload));
            group.refstore.del_client(self.state.rid, group.myid());
        } else {
            group.call_on_owner(
                "put_future",
                self.state.owner,
                &PutFutureArgs {
                    rid: self.state.rid,
                    value: payload.clone(),
                    caller: group.myid(),
                },
            )?;
            let _ = self.state.cache.set(Ok(payload));
        }
        Ok(())
    }
}

impl<T> Clone for Future<T> {
    fn clone(&self) -> Future<T> {
        Future {
            state: self.state.clone(),
            _value: PhantomData,
        }
    }
}

impl<T> PartialEq for Future<T> {
    fn eq(&self, other: &Future<T>) -> bool {
        self.state.rid == other.state.rid
    }
}

impl<T> Eq for Future<T> {}

impl<T> std::hash::Hash for Future<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.state.rid.hash(state);
    }
}

impl<T> std::fmt::Debug for Future<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "Future({}, {}, cached: {})",
            self.state.owner,
            self.state.rid,
            self.state.cache.get().is_some()
        )
    }
}

#[derive(Serialize, Deserialize)]
struct FutureWire {
    where_: ProcessId,
    whence: ProcessId,
    id: i64,
    value: Option<Outcome>,
}

impl<T> Serialize for Future<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.state.note_serialized();
        FutureWire {
            where_: self.state.owner,
            whence: self.state.rid.whence,
            id: self.state.rid.id,
            value: self.state.cache.get().cloned(),
        }
        .serialize(serializer)
    }
}

impl<'de, T> Deserialize<'de> for Future<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Future<T>, D::Error> {
        let wire = FutureWire::deserialize(deserializer)?;
        let group = DecodeCtx::current().ok_or_else(|| {
            serde::de::Error::custom("deserializing a remote reference outside a cluster context")
        })?;
        let rid = RefId {
            whence: wire.whence,
            id: wire.id,
        };
        let state = RefState::canonicalize(&group, rid, wire.where_, RefKind::Future, wire.value);
        Ok(Future::from_state(state))
    }
}

/// A reference to a value channel living on some node of the cluster.
///
/// All operations forward to the owner; there is no local cache, values are
/// not single-assignment. The element type is a compile-time convenience, the
/// wire carries no type.
pub struct RemoteChannel<T> {
    state: Arc<RefState>,
    _value: PhantomData<fn() -> T>,
}

impl<T> RemoteChannel<T> {
    /// Create an unbounded channel whose backing cell lives on `pid`.
    pub fn new(group: &Arc<ProcessGroup>, pid: ProcessId) -> Result<RemoteChannel<T>, Error> {
        RemoteChannel::with_spec(group, pid, ChannelSpec::unbounded())
    }

    /// Create a channel buffering at most `capacity` values on `pid`.
    /// Capacity `0` makes a rendezvous channel: a put blocks until a take
    /// picked the value up.
    pub fn new_bounded(
        group: &Arc<ProcessGroup>,
        pid: ProcessId,
        capacity: u64,
    ) -> Result<RemoteChannel<T>, Error> {
        RemoteChannel::with_spec(group, pid, ChannelSpec::bounded(capacity))
    }

    fn with_spec(
        group: &Arc<ProcessGroup>,
        pid: ProcessId,
        spec: ChannelSpec,
    ) -> Result<RemoteChannel<T>, Error> {
        let rid = group.next_ref_id();
        // the cell is created eagerly so its channel gets the right shape
        if pid == group.myid() {
            group.refstore.lookup_or_create(rid, spec);
        } else {
            group.call_on_owner("make_channel", pid, &MakeChannelArgs { rid, spec })?;
        }
        Ok(RemoteChannel {
            state: RefState::create(group, rid, pid, RefKind::Channel),
            _value: PhantomData,
        })
    }

    pub(crate) fn from_state(state: Arc<RefState>) -> RemoteChannel<T> {
        RemoteChannel {
            state,
            _value: PhantomData,
        }
    }

    pub(crate) fn group(&self) -> Result<Arc<ProcessGroup>, Error> {
        self.state.group()
    }

    /// The cluster-wide identity of this reference.
    pub fn id(&self) -> RefId {
        self.state.rid
    }

    /// The node owning the backing cell.
    pub fn owner(&self) -> ProcessId {
        self.state.owner
    }

    /// Append a value to the channel. Blocks while a bounded channel is full;
    /// on a rendezvous channel, returns once a taker has the value.
    pub fn put(&self, value: &T) -> Result<(), Error>
    where
        T: Serialize,
    {
        let group = self.state.group()?;
        let payload = group.encode_for(self.state.owner, value)?;
        if self.state.owner == group.myid() {
            let rv = group
                .refstore
                .lookup_or_create(self.state.rid, ChannelSpec::unbounded());
            rv.channel().put(Ok(payload)).map_err(ClusterError::from)?;
            // a rendezvous value picked up by a remote take is not safe until
            // the take has been serialized out
            rv.sync_barrier();
            Ok(())
        } else {
            group.call_on_owner(
                "put_ref",
                self.state.owner,
                &PutRefArgs {
                    rid: self.state.rid,
                    value: payload,
                },
            )?;
            Ok(())
        }
    }

    /// Remove and return the oldest value, blocking while the channel is
    /// empty and open.
    pub fn take(&self) -> Result<T, Error>
    where
        T: DeserializeOwned,
    {
        let group = self.state.group()?;
        if self.state.owner == group.myid() {
            let rv = group
                .refstore
                .lookup_or_create(self.state.rid, ChannelSpec::unbounded());
            match rv.channel().take().map_err(ClusterError::from)? {
                Ok(payload) => group.decode(&payload),
                Err(remote) => Err(ClusterError::Remote(remote).into()),
            }
        } else {
            let payload =
                group.call_on_owner("take_ref", self.state.owner, &RefArgs { rid: self.state.rid })?;
            group.decode(&payload)
        }
    }

    /// Return a copy of the oldest value without removing it, blocking while
    /// the channel is empty and open.
    pub fn fetch(&self) -> Result<T, Error>
    where
        T: DeserializeOwned,
    {
        let group = self.state.group()?;
        if self.state.owner == group.myid() {
            let rv = group
                .refstore
                .lookup_or_create(self.state.rid, ChannelSpec::unbounded());
            match rv.channel().fetch().map_err(ClusterError::from)? {
                Ok(payload) => group.decode(&payload),
                Err(remote) => Err(ClusterError::Remote(remote).into()),
            }
        } else {
            let payload =
                group.call_on_owner("fetch_ref", self.state.owner, &RefArgs { rid: self.state.rid })?;
            group.decode(&payload)
        }
    }

    fn predicate(&self, func: &str) -> Result<bool, Error> {
        let group = self.state.group()?;
        let payload = group.call_on_owner(func, self.state.owner, &RefArgs { rid: self.state.rid })?;
        group.decode(&payload)
    }

    /// Whether a value is immediately available.
    pub fn is_ready(&self) -> Result<bool, Error> {
        self.predicate("isready_ref")
    }

    /// Whether the channel has not been closed.
    pub fn is_open(&self) -> Result<bool, Error> {
        self.predicate("isopen_ref")
    }

    /// Whether no value is buffered.
    pub fn is_empty(&self) -> Result<bool, Error> {
        self.predicate("isempty_ref")
    }

    /// Close the channel on the owner. Buffered values can still be drained;
    /// every other operation fails from now on.
    pub fn close(&self) -> Result<(), Error> {
        let group = self.state.group()?;
        group.call_on_owner("close_ref", self.state.owner, &RefArgs { rid: self.state.rid })?;
        Ok(())
    }

    /// Iterate over the values of the channel, ending cleanly when the
    /// channel is closed and drained.
    pub fn iter(&self) -> RemoteChannelIter<T> {
        RemoteChannelIter {
            chan: self.clone(),
        }
    }
}

impl<T> Clone for RemoteChannel<T> {
    fn clone(&self) -> RemoteChannel<T> {
        RemoteChannel {
            state: self.state.clone(),
            _value: PhantomData,
        }
    }
}

impl<T> PartialEq for RemoteChannel<T> {
    fn eq(&self, other: &RemoteChannel<T>) -> bool {
        self.state.rid == other.state.rid
    }
}

impl<T> Eq for RemoteChannel<T> {}

impl<T> std::hash::Hash for RemoteChannel<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.state.rid.hash(state);
    }
}

impl<T> std::fmt::Debug for RemoteChannel<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "RemoteChannel({}, {})", self.state.owner, self.state.rid)
    }
}

#[derive(Serialize, Deserialize)]
struct ChannelWire {
    where_: ProcessId,
    whence: ProcessId,
    id: i64,
}

impl<T> Serialize for RemoteChannel<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.state.note_serialized();
        ChannelWire {
            where_: self.state.owner,
            whence: self.state.rid.whence,
            id: self.state.rid.id,
        }
        .serialize(serializer)
    }
}

impl<'de, T> Deserialize<'de> for RemoteChannel<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<RemoteChannel<T>, D::Error> {
        let wire = ChannelWire::deserialize(deserializer)?;
        let group = DecodeCtx::current().ok_or_else(|| {
            serde::de::Error::custom("deserializing a remote reference outside a cluster context")
        })?;
        let rid = RefId {
            whence: wire.whence,
            id: wire.id,
        };
        let state = RefState::canonicalize(&group, rid, wire.where_, RefKind::Channel, None);
        Ok(RemoteChannel::from_state(state))
    }
}

/// Iterator over the values of a [`RemoteChannel`].
pub struct RemoteChannelIter<T> {
    chan: RemoteChannel<T>,
}

impl<T> Iterator for RemoteChannelIter<T>
where
    T: DeserializeOwned,
{
    type Item = T;

    fn next(&mut self) -> Option<T> {
        loop {
            let open = self.chan.is_open().unwrap_or(false);
            let ready = self.chan.is_ready().unwrap_or(false);
            if !open && !ready {
                return None;
            }
            match self.chan.take() {
                Ok(v) => return Some(v),
                Err(e) if is_channel_closed(&e) => return None,
                Err(e) => {
                    warn!("Channel iteration aborted: {:?}", e);
                    return None;
                }
            }
        }
    }
}
