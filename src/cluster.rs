//! Process identity and the role-keyed process-group registry.
//!
//! A [`ProcessGroup`] is one cluster as seen from one process: the links to
//! the peers, the table of owned remote-value cells, the canonicalized
//! client-side handles and the function registry. The master of a group has
//! id 1; workers get dense ids assigned at join time.
//!
//! Clusters compose: a worker of one group may itself master a subordinate
//! group ("multiscale" clusters). A [`Node`] holds both views of such a
//! process and resolves a [`Role`] to the group it addresses. `Role::Default`
//! follows the ambient context: code running on behalf of an incoming remote
//! call addresses the group the call arrived on, everything else falls back
//! to the group this process is a member of.

use std::cell::RefCell;
use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::thread;
use std::thread::JoinHandle;

use anyhow::{ensure, Context, Error};
use itertools::Itertools;
use serde::de::DeserializeOwned;
use serde::Serialize;

use procmesh_channel::{connect_channel, ChannelServer, FrameReceiver, FrameSender};

use crate::dispatch;
use crate::error::ClusterError;
use crate::gc::{spawn_gc_pump, GcSignal};
use crate::link::{LinkState, WorkerLink};
use crate::pool::{PoolInner, WorkerPool};
use crate::proto::{
    IdentifyMsg, JoinCompleteMsg, JoinPgrpMsg, Message, MsgHeader, Payload, RefId, RemoteFunc,
};
use crate::refs::{DecodeCtx, EncodeCtx, Future, RefState};
use crate::refstore::RefStore;
use crate::rpc::FuncRegistry;

/// Cluster-unique integer id of a participating process. The master of a
/// group is id 1; 0 is never a valid id.
pub type ProcessId = i64;

/// Which process-group view an operation addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Role {
    /// The group implied by the ambient context: the group an incoming call
    /// arrived on while handling it, otherwise the group this process is a
    /// member of (falling back to the mastered group on a top-level master).
    #[default]
    Default,
    /// The subordinate group this process masters.
    Master,
    /// The group this process is a worker of.
    Worker,
}

/// Settings shared by all members of a cluster.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Shared secret validated during the connection preamble.
    pub cookie: String,
}

impl ClusterConfig {
    /// A config with the given cookie.
    pub fn new<S: Into<String>>(cookie: S) -> ClusterConfig {
        ClusterConfig {
            cookie: cookie.into(),
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> ClusterConfig {
        ClusterConfig::new("procmesh")
    }
}

thread_local! {
    static AMBIENT: RefCell<Vec<Arc<ProcessGroup>>> = const { RefCell::new(Vec::new()) };
}

/// Mark the current thread as running on behalf of `group` (an incoming
/// remote call); `Role::Default` resolves to it for the duration.
pub(crate) fn enter_ambient(group: Arc<ProcessGroup>) -> AmbientGuard {
    AMBIENT.with(|a| a.borrow_mut().push(group));
    AmbientGuard
}

pub(crate) struct AmbientGuard;

impl Drop for AmbientGuard {
    fn drop(&mut self) {
        AMBIENT.with(|a| {
            a.borrow_mut().pop();
        });
    }
}

fn ambient_group() -> Option<Arc<ProcessGroup>> {
    AMBIENT.with(|a| a.borrow().last().cloned())
}

/// One cluster as seen from one process.
pub struct ProcessGroup {
    myid: AtomicI64,
    pub(crate) config: ClusterConfig,
    workers: Mutex<HashMap<ProcessId, Arc<WorkerLink>>>,
    /// The owned remote-value cells.
    pub(crate) refstore: RefStore,
    next_ref: AtomicI64,
    /// Canonicalization table of the client-side handles alive in this
    /// process.
    pub(crate) client_refs: Mutex<HashMap<RefId, Weak<RefState>>>,
    /// The functions invokable by remote calls.
    pub(crate) funcs: FuncRegistry,
    pub(crate) gc_signal: Arc<GcSignal>,
    gc_pump: Mutex<Option<JoinHandle<()>>>,
    /// Pools owned by this process, addressable by the id of their anchor
    /// channel.
    pub(crate) pools: Mutex<HashMap<RefId, Weak<PoolInner>>>,
    pub(crate) default_pool: Mutex<Option<WorkerPool>>,
    /// Next id handed to a joining worker (master only).
    next_pid: AtomicI64,
    shutdown: AtomicBool,
}

impl ProcessGroup {
    fn build(config: ClusterConfig, myid: ProcessId) -> Arc<ProcessGroup> {
        let group = Arc::new(ProcessGroup {
            myid: AtomicI64::new(myid),
            config,
            workers: Mutex::new(HashMap::new()),
            refstore: RefStore::new(),
            next_ref: AtomicI64::new(1),
            client_refs: Mutex::new(HashMap::new()),
            funcs: FuncRegistry::new(),
            gc_signal: Arc::new(GcSignal::new()),
            gc_pump: Mutex::new(None),
            pools: Mutex::new(HashMap::new()),
            default_pool: Mutex::new(None),
            next_pid: AtomicI64::new(2),
            shutdown: AtomicBool::new(false),
        });
        crate::rpc::register_builtins(&group.funcs);
        *group.gc_pump.lock().unwrap() = Some(spawn_gc_pump(&group));
        group
    }

    /// Create the master-side view of a new cluster: this process is id 1.
    pub fn new_master(config: ClusterConfig) -> Arc<ProcessGroup> {
        ProcessGroup::build(config, 1)
    }

    /// Create the view of a process that will join a cluster as a worker; the
    /// id is assigned by the master during [`join_cluster`](Self::join_cluster).
    pub fn new_member(config: ClusterConfig) -> Arc<ProcessGroup> {
        ProcessGroup::build(config, 0)
    }

    /// A group with a preassigned id and no connections, for in-process
    /// meshes wired by hand (see `test_utils`).
    pub fn standalone(myid: ProcessId) -> Arc<ProcessGroup> {
        ProcessGroup::build(ClusterConfig::default(), myid)
    }

    /// This process' id within the group.
    pub fn myid(&self) -> ProcessId {
        self.myid.load(Ordering::Acquire)
    }

    pub(crate) fn set_myid(&self, pid: ProcessId) {
        self.myid.store(pid, Ordering::Release);
    }

    /// Whether this process is the master of the group.
    pub fn is_master(&self) -> bool {
        self.myid() == 1
    }

    /// The ids of the connected peers, sorted.
    pub fn workers(&self) -> Vec<ProcessId> {
        let mut pids: Vec<_> = self.workers.lock().unwrap().keys().copied().collect();
        pids.sort_unstable();
        pids
    }

    /// The link to a peer.
    pub fn worker_from_id(&self, pid: ProcessId) -> Result<Arc<WorkerLink>, Error> {
        self.workers
            .lock()
            .unwrap()
            .get(&pid)
            .cloned()
            .ok_or_else(|| {
                ClusterError::Transport {
                    pid,
                    reason: "no connection to this worker".into(),
                }
                .into()
            })
    }

    /// Whether `pid` is this process or a connected peer.
    pub fn id_in_procs(&self, pid: ProcessId) -> bool {
        pid == self.myid() || self.workers.lock().unwrap().contains_key(&pid)
    }

    /// Snapshot of the links.
    pub(crate) fn links(&self) -> Vec<Arc<WorkerLink>> {
        self.workers.lock().unwrap().values().cloned().collect()
    }

    /// The table of remote-value cells owned by this process.
    pub fn refs(&self) -> &RefStore {
        &self.refstore
    }

    /// A fresh reference id minted by this process.
    pub fn next_ref_id(&self) -> RefId {
        RefId {
            whence: self.myid(),
            id: self.next_ref.fetch_add(1, Ordering::SeqCst),
        }
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Register the channel pair to a peer and start reading from it.
    pub fn install_link(
        self: &Arc<Self>,
        pid: ProcessId,
        sender: FrameSender<Message>,
        receiver: FrameReceiver<Message>,
        connected: bool,
    ) -> Arc<WorkerLink> {
        let state = if connected {
            LinkState::Connected
        } else {
            LinkState::Created
        };
        let link = Arc::new(WorkerLink::new(pid, sender, state));
        if let Some(old) = self
            .workers
            .lock()
            .unwrap()
            .insert(pid, link.clone())
        {
            warn!("Replacing existing link to worker {}", pid);
            old.terminate();
        }
        let group = self.clone();
        let reader_link = link.clone();
        thread::Builder::new()
            .name(format!("Reader for worker {}", pid))
            .spawn(move || dispatch::reader_loop(group, reader_link, receiver))
            .expect("Failed to spawn link reader thread");
        link
    }

    /// Send a message to a peer.
    pub(crate) fn send_msg(
        &self,
        pid: ProcessId,
        header: MsgHeader,
        msg: &Message,
        now: bool,
    ) -> Result<(), Error> {
        self.worker_from_id(pid)?.send_msg(header, msg, now)
    }

    /// Account `client` as holding a handle to `rid` on its owner: directly
    /// when this process is the owner, through the coalescing buffers
    /// otherwise.
    pub(crate) fn send_add_client(&self, rid: RefId, owner: ProcessId, client: ProcessId) {
        if owner == self.myid() {
            self.refstore.add_client(rid, client);
        } else if let Ok(link) = self.worker_from_id(owner) {
            link.push_add_client(rid, client);
            self.gc_signal.notify();
        } else {
            debug!("Dropping add_client for {}: owner {} is gone", rid, owner);
        }
    }

    /// Remove `client` from the clientset of `rid` on its owner, directly or
    /// through the coalescing buffers.
    pub(crate) fn send_del_client(&self, rid: RefId, owner: ProcessId, client: ProcessId) {
        if owner == self.myid() {
            self.refstore.del_client(rid, client);
        } else if let Ok(link) = self.worker_from_id(owner) {
            link.push_del_client(rid, client);
            self.gc_signal.notify();
        } else {
            debug!("Dropping del_client for {}: owner {} is gone", rid, owner);
        }
    }

    /// Serialize a value for a destination node. While the encoding runs,
    /// remote references inside the value register the destination with
    /// their owner.
    pub fn encode_for<T: Serialize>(
        self: &Arc<Self>,
        dest: ProcessId,
        value: &T,
    ) -> Result<Payload, Error> {
        let _guard = EncodeCtx::enter(self.clone(), dest);
        Ok(bincode::serialize(value).context("Failed to serialize value")?)
    }

    /// Deserialize a payload received by this group. While the decoding runs,
    /// remote references inside the value canonicalize against this group.
    pub fn decode<T: DeserializeOwned>(self: &Arc<Self>, payload: &[u8]) -> Result<T, Error> {
        let _guard = DecodeCtx::enter(self.clone());
        Ok(bincode::deserialize(payload).context("Failed to deserialize value")?)
    }

    /// Disconnect a worker: terminate the link, discard its pending GC
    /// buffers and fail every request in flight on it.
    pub fn remove_worker(&self, pid: ProcessId) {
        let link = self.workers.lock().unwrap().remove(&pid);
        let Some(link) = link else {
            return;
        };
        debug!("Removing worker {}", pid);
        link.terminate();
        for rid in link.take_pending() {
            // wake the callers blocked on responses that will never come
            if let Ok(rv) = self.refstore.lookup(rid) {
                rv.channel().close();
            }
        }
    }

    /// Called by a link reader when the connection dies.
    pub(crate) fn handle_link_failure(&self, link: &Arc<WorkerLink>) {
        if self.is_shutdown() {
            return;
        }
        self.remove_worker(link.pid());
    }

    /// Tear the whole group down: every link is terminated (draining nothing:
    /// their GC buffers die with them) and the GC pump stops.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("Shutting down process group (myid {})", self.myid());
        self.gc_signal.shutdown();
        for pid in self.workers() {
            self.remove_worker(pid);
        }
        if let Some(pump) = self.gc_pump.lock().unwrap().take() {
            let _ = pump.join();
        }
    }

    /// Accept joining workers on `addr`: each one gets the next id, the list
    /// of current peers to connect to, and a fresh link. Returns the bound
    /// address and the listener thread handle.
    pub fn serve_master(
        self: &Arc<Self>,
        addr: impl ToSocketAddrs,
    ) -> Result<(SocketAddr, JoinHandle<()>), Error> {
        ensure!(self.is_master(), "only the master accepts joining workers");
        let server = ChannelServer::bind(addr, &self.config.cookie)
            .context("Failed to bind the worker listener")?;
        let local_addr = server.local_addr()?;
        info!("Accepting worker connections at tcp://{}", local_addr);
        let group = self.clone();
        let handle = thread::Builder::new()
            .name("Worker listener".into())
            .spawn(move || {
                for (sender, receiver, addr) in server {
                    if group.is_shutdown() {
                        break;
                    }
                    let pid = group.next_pid.fetch_add(1, Ordering::SeqCst);
                    let peers: Vec<(ProcessId, String)> = group
                        .links()
                        .iter()
                        .filter_map(|l| l.listen_addr().map(|a| (l.pid(), a)))
                        .collect();
                    info!(
                        "Worker connected from {}, assigning id {} (peers: {})",
                        addr,
                        pid,
                        peers.iter().map(|(p, _)| p.to_string()).join(", ")
                    );
                    let link = group.install_link(pid, sender, receiver, false);
                    let join = Message::JoinPgrp(JoinPgrpMsg {
                        pid,
                        peers: peers.clone(),
                    });
                    if let Err(e) = link.send_msg(MsgHeader::default(), &join, true) {
                        warn!("Failed to welcome worker {}: {:?}", pid, e);
                        group.remove_worker(pid);
                        continue;
                    }
                    link.mark_connected();
                }
            })
            .expect("Failed to spawn the worker listener");
        Ok((local_addr, handle))
    }

    /// Join the cluster at `master_addr` as a worker. With `listen_addr` set,
    /// a peer listener is started there so later joiners can connect; without
    /// it this worker is only reachable through peers that dial first.
    pub fn join_cluster(
        self: &Arc<Self>,
        master_addr: impl ToSocketAddrs,
        listen_addr: Option<&str>,
    ) -> Result<(), Error> {
        let peer_listen_addr = match listen_addr {
            Some(addr) => Some(self.spawn_peer_listener(addr)?),
            None => None,
        };
        let (sender, mut receiver) =
            connect_channel(master_addr, &self.config.cookie).context("Failed to reach the master")?;
        let (_, body) = receiver
            .recv()
            .map_err(|e| ClusterError::Transport {
                pid: 1,
                reason: e.to_string(),
            })?;
        let (pid, peers) = match body {
            Ok(Message::JoinPgrp(join)) => (join.pid, join.peers),
            Ok(other) => {
                return Err(ClusterError::Protocol(format!(
                    "expected JoinPgrp from the master, got tag {}",
                    other.tag()
                ))
                .into())
            }
            Err(e) => return Err(ClusterError::Protocol(e.to_string()).into()),
        };
        self.set_myid(pid);
        info!("Joined the cluster as worker {}", pid);
        let master = self.install_link(1, sender, receiver, true);
        for (peer_pid, peer_addr) in &peers {
            let (peer_sender, peer_receiver) =
                connect_channel(peer_addr, &self.config.cookie)
                    .with_context(|| format!("Failed to connect to peer {}", peer_pid))?;
            let link = self.install_link(*peer_pid, peer_sender, peer_receiver, false);
            link.send_msg(
                MsgHeader::default(),
                &Message::IdentifySocket(IdentifyMsg { from_pid: pid }),
                true,
            )?;
            // the link unblocks when the peer's IdentifySocketAck arrives
        }
        master.send_msg(
            MsgHeader::default(),
            &Message::JoinComplete(JoinCompleteMsg {
                listen_addr: peer_listen_addr,
                nworkers: peers.len(),
            }),
            true,
        )?;
        Ok(())
    }

    /// Bind the listener other workers use to reach this one; returns the
    /// address to advertise.
    fn spawn_peer_listener(self: &Arc<Self>, addr: &str) -> Result<String, Error> {
        let server = ChannelServer::bind(addr, &self.config.cookie)
            .context("Failed to bind the peer listener")?;
        let local_addr = server.local_addr()?;
        let group = self.clone();
        thread::Builder::new()
            .name("Peer listener".into())
            .spawn(move || {
                for (sender, mut receiver, addr) in server {
                    if group.is_shutdown() {
                        break;
                    }
                    let from_pid = match receiver.recv() {
                        Ok((_, Ok(Message::IdentifySocket(identify)))) => identify.from_pid,
                        other => {
                            warn!("Peer from {} did not identify: {:?}", addr, other.is_ok());
                            continue;
                        }
                    };
                    debug!("Worker {} connected from {}", from_pid, addr);
                    let link = group.install_link(from_pid, sender, receiver, false);
                    let _ = link.send_msg(MsgHeader::default(), &Message::IdentifySocketAck, true);
                    link.mark_connected();
                }
            })
            .expect("Failed to spawn the peer listener");
        Ok(local_addr.to_string())
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.gc_signal.shutdown();
    }
}

impl std::fmt::Debug for ProcessGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("ProcessGroup")
            .field("myid", &self.myid())
            .field("workers", &self.workers())
            .field("refs", &self.refstore.len())
            .finish()
    }
}

/// The process-level view over the (up to two) groups this process belongs
/// to: the one it is a member of and the one it masters.
#[derive(Default)]
pub struct Node {
    member: RwLock<Option<Arc<ProcessGroup>>>,
    mastered: RwLock<Option<Arc<ProcessGroup>>>,
}

impl Node {
    /// A node belonging to no group yet.
    pub fn new() -> Node {
        Node::default()
    }

    /// Set the group this process is a worker of.
    pub fn set_member(&self, group: Arc<ProcessGroup>) {
        *self.member.write().unwrap() = Some(group);
    }

    /// Set the subordinate group this process masters.
    pub fn set_mastered(&self, group: Arc<ProcessGroup>) {
        *self.mastered.write().unwrap() = Some(group);
    }

    /// Resolve a role to the process group it addresses.
    pub fn pgrp(&self, role: Role) -> Result<Arc<ProcessGroup>, Error> {
        let group = match role {
            Role::Master => self.mastered.read().unwrap().clone(),
            Role::Worker => self.member.read().unwrap().clone(),
            Role::Default => ambient_group()
                .or_else(|| self.member.read().unwrap().clone())
                .or_else(|| self.mastered.read().unwrap().clone()),
        };
        group.ok_or_else(|| {
            ClusterError::Protocol(format!("no process group for role {:?}", role)).into()
        })
    }

    /// This process' id within the group selected by `role`.
    pub fn my_id(&self, role: Role) -> Result<ProcessId, Error> {
        Ok(self.pgrp(role)?.myid())
    }

    /// The ids of the peers in the group selected by `role`.
    pub fn workers(&self, role: Role) -> Result<Vec<ProcessId>, Error> {
        Ok(self.pgrp(role)?.workers())
    }

    /// `remotecall` addressed through the group selected by `role`.
    pub fn remotecall<A, R>(
        &self,
        role: Role,
        func: &RemoteFunc,
        pid: ProcessId,
        args: &A,
    ) -> Result<Future<R>, Error>
    where
        A: Serialize,
    {
        self.pgrp(role)?.remotecall(func, pid, args)
    }

    /// `remotecall_fetch` addressed through the group selected by `role`.
    pub fn remotecall_fetch<A, R>(
        &self,
        role: Role,
        func: &RemoteFunc,
        pid: ProcessId,
        args: &A,
    ) -> Result<R, Error>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        self.pgrp(role)?.remotecall_fetch(func, pid, args)
    }

    /// `remotecall_wait` addressed through the group selected by `role`.
    pub fn remotecall_wait<A, R>(
        &self,
        role: Role,
        func: &RemoteFunc,
        pid: ProcessId,
        args: &A,
    ) -> Result<Future<R>, Error>
    where
        A: Serialize,
    {
        self.pgrp(role)?.remotecall_wait(func, pid, args)
    }

    /// `remote_do` addressed through the group selected by `role`.
    pub fn remote_do<A>(
        &self,
        role: Role,
        func: &RemoteFunc,
        pid: ProcessId,
        args: &A,
    ) -> Result<(), Error>
    where
        A: Serialize,
    {
        self.pgrp(role)?.remote_do(func, pid, args)
    }

    /// The default worker pool of the group selected by `role`.
    pub fn default_pool(&self, role: Role) -> Result<WorkerPool, Error> {
        self.pgrp(role)?.default_worker_pool()
    }
}
