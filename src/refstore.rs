//! The owner-side table of remote-value cells.
//!
//! Every remote reference is backed by a cell on its owner node: a channel
//! holding the produced values, the set of nodes known to hold a handle to it
//! (the clientset), and bookkeeping for in-flight responses. The whole table
//! sits behind a single registry lock; only the channel operations themselves
//! run outside it, so the lock is never held while user code runs or a value
//! is awaited.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::cluster::ProcessId;
use crate::error::ReferenceError;
use crate::proto::{Outcome, RefId};
use crate::vchannel::{BoundedChannel, ValueChannel};

/// Channel shape of a cell, fixed at creation and serializable so a channel
/// creator can describe the cell to a remote owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSpec {
    /// `None` for an unbounded channel, `Some(0)` for a rendezvous channel,
    /// `Some(n)` for a buffer of `n` values.
    pub capacity: Option<u64>,
}

impl ChannelSpec {
    /// An unbounded channel, the default cell shape.
    pub fn unbounded() -> ChannelSpec {
        ChannelSpec { capacity: None }
    }

    /// A channel buffering at most `capacity` values; `0` makes a rendezvous
    /// channel.
    pub fn bounded(capacity: u64) -> ChannelSpec {
        ChannelSpec {
            capacity: Some(capacity),
        }
    }
}

/// The owner-side storage backing a remote reference: the value channel plus
/// the rendezvous synchronization used by remote takes.
pub struct RemoteValue {
    chan: Box<dyn ValueChannel>,
    /// Serializes the write-once check of future cells: a put may come from
    /// the owner's own thread or from a `put_future` call thread, and both
    /// must agree on who was first.
    put_once: Mutex<()>,
    /// Present on rendezvous cells only: held by a remote take from before
    /// the value leaves the channel until the response has been written out,
    /// and passed through by local putters so they cannot outrun the
    /// serialization of the value they handed over.
    synctake: Option<Mutex<()>>,
}

impl RemoteValue {
    /// Build the cell storage for a channel shape.
    pub fn from_spec(spec: ChannelSpec) -> RemoteValue {
        let chan: Box<dyn ValueChannel> = match spec.capacity {
            None => Box::new(BoundedChannel::unbounded()),
            Some(cap) => Box::new(BoundedChannel::bounded(cap as usize)),
        };
        RemoteValue {
            chan,
            put_once: Mutex::new(()),
            synctake: (spec.capacity == Some(0)).then(|| Mutex::new(())),
        }
    }

    /// The backing channel.
    pub fn channel(&self) -> &dyn ValueChannel {
        &*self.chan
    }

    /// Deliver the value of a write-once cell. The ready-check and the
    /// enqueue happen under one lock, so of any number of concurrent writers
    /// exactly one succeeds; the rest fail with
    /// [`ReferenceError::AlreadySet`].
    pub fn try_put_once(&self, v: Outcome) -> Result<(), ReferenceError> {
        let _guard = self.put_once.lock().unwrap();
        if self.chan.is_ready() {
            return Err(ReferenceError::AlreadySet);
        }
        self.chan.put(v)
    }

    /// The synctake mutex, present on rendezvous cells.
    pub fn synctake(&self) -> Option<&Mutex<()>> {
        self.synctake.as_ref()
    }

    /// Barrier used by putters on rendezvous cells: returns once no remote
    /// take is between taking the value and serializing it out.
    pub fn sync_barrier(&self) {
        if let Some(m) = &self.synctake {
            drop(m.lock().unwrap());
        }
    }
}

struct CellEntry {
    value: Arc<RemoteValue>,
    clientset: HashSet<ProcessId>,
    /// Node currently awaiting a response through this cell, 0 if none. A
    /// cell with a pending response survives an empty clientset.
    waiting_for: ProcessId,
}

/// The remote-value table of a process group.
pub struct RefStore {
    cells: Mutex<HashMap<RefId, CellEntry>>,
}

impl RefStore {
    /// An empty table.
    pub fn new() -> RefStore {
        RefStore {
            cells: Mutex::new(HashMap::new()),
        }
    }

    /// The cell backing `rid`, created lazily with the given channel shape if
    /// absent. A fresh cell starts with the creating node in its clientset.
    pub fn lookup_or_create(&self, rid: RefId, spec: ChannelSpec) -> Arc<RemoteValue> {
        let mut cells = self.cells.lock().unwrap();
        let entry = cells.entry(rid).or_insert_with(|| {
            trace!("Creating cell for {}", rid);
            let mut clientset = HashSet::new();
            clientset.insert(rid.whence);
            CellEntry {
                value: Arc::new(RemoteValue::from_spec(spec)),
                clientset,
                waiting_for: 0,
            }
        });
        entry.value.clone()
    }

    /// The cell backing `rid`, failing if it does not exist (anymore).
    pub fn lookup(&self, rid: RefId) -> Result<Arc<RemoteValue>, ReferenceError> {
        self.cells
            .lock()
            .unwrap()
            .get(&rid)
            .map(|entry| entry.value.clone())
            .ok_or(ReferenceError::Destroyed(rid))
    }

    /// Record that `pid` holds a handle to `rid`, creating the cell if it is
    /// not born yet.
    pub fn add_client(&self, rid: RefId, pid: ProcessId) {
        let mut cells = self.cells.lock().unwrap();
        let entry = cells.entry(rid).or_insert_with(|| {
            let mut clientset = HashSet::new();
            clientset.insert(rid.whence);
            CellEntry {
                value: Arc::new(RemoteValue::from_spec(ChannelSpec::unbounded())),
                clientset,
                waiting_for: 0,
            }
        });
        entry.clientset.insert(pid);
    }

    /// Record that `pid` no longer holds a handle to `rid`; the cell is
    /// destroyed when its clientset empties and no response is pending.
    pub fn del_client(&self, rid: RefId, pid: ProcessId) {
        let mut cells = self.cells.lock().unwrap();
        let Some(entry) = cells.get_mut(&rid) else {
            trace!("del_client for unknown cell {}", rid);
            return;
        };
        entry.clientset.remove(&pid);
        if entry.clientset.is_empty() && entry.waiting_for == 0 {
            let entry = cells.remove(&rid).unwrap();
            trace!("Cell {} has no clients left, destroying it", rid);
            // wake anybody still blocked on the dead cell
            entry.value.channel().close();
        }
    }

    /// Mark `pid` as awaiting a response through `rid`.
    pub fn set_waiting(&self, rid: RefId, pid: ProcessId) {
        if let Some(entry) = self.cells.lock().unwrap().get_mut(&rid) {
            entry.waiting_for = pid;
        }
    }

    /// The response pending on `rid` has been delivered; destroy the cell if
    /// nothing else keeps it alive.
    pub fn clear_waiting(&self, rid: RefId) {
        let mut cells = self.cells.lock().unwrap();
        if let Some(entry) = cells.get_mut(&rid) {
            entry.waiting_for = 0;
            if entry.clientset.is_empty() {
                let entry = cells.remove(&rid).unwrap();
                entry.value.channel().close();
            }
        }
    }

    /// Drop a cell outright, regardless of clients. Used for the transient
    /// response cells of fetching calls once their value arrived.
    pub fn remove(&self, rid: RefId) {
        if let Some(entry) = self.cells.lock().unwrap().remove(&rid) {
            entry.value.channel().close();
        }
    }

    /// Deliver an outcome into the cell backing `rid`, failing if the cell
    /// does not exist. Used for routing incoming `Result` messages.
    pub fn deliver(&self, rid: RefId, value: Outcome) -> Result<(), ReferenceError> {
        let cell = self.lookup(rid)?;
        cell.channel().put(value)
    }

    /// How many cells are alive. Exposed for diagnostics and tests.
    pub fn len(&self) -> usize {
        self.cells.lock().unwrap().len()
    }

    /// Whether the table holds no cell.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the cell backing `rid` exists.
    pub fn contains(&self, rid: RefId) -> bool {
        self.cells.lock().unwrap().contains_key(&rid)
    }
}

impl Default for RefStore {
    fn default() -> RefStore {
        RefStore::new()
    }
}
