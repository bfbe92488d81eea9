//! Cluster runtime with remote references, distributed reference GC and
//! pooled execution over peer worker processes.
//!
//! A cluster is a set of processes connected pairwise by framed
//! bidirectional streams (see `procmesh_channel`). The master has id 1 and
//! admits workers, which then connect to each other so every pair of
//! processes shares a link. On top of the links this crate offers:
//!
//! - **Remote invocation**: [`ProcessGroup::remotecall`] and friends invoke
//!   registered functions on a peer, returning a [`Future`] for the result,
//!   the value itself, or nothing.
//! - **Remote references**: [`Future`] (write-once) and [`RemoteChannel`]
//!   (a value channel living on some node). References serialize freely
//!   inside call arguments and results; each node canonicalizes the handles
//!   it sees and the owners track which nodes hold one.
//! - **Distributed reference GC**: dropping the last local handle buffers a
//!   del-client towards the owner; a background pump coalesces and flushes
//!   these, and the owner destroys a cell once no node references it.
//! - **Pooled execution**: [`WorkerPool`] hands workers out with a take/put
//!   discipline, [`CachingPool`] additionally caches closure-like functions
//!   on the workers.
//!
//! Clusters compose: a worker may itself master a subordinate cluster, and a
//! [`Node`] resolves a [`Role`] (default, master, worker) to the group an
//! operation addresses.
//!
//! ## Components
//!
//! - `cluster`: process identity, the role-keyed group registry, join and
//!   handshake;
//! - `link`: the per-peer connection state machine, send path and GC
//!   buffers;
//! - `proto`: the wire messages;
//! - `refstore` / `vchannel`: the owner-side cells and their backing
//!   channels;
//! - `refs`: the client-side handles and their serialization;
//! - `gc`: the pump flushing coalesced client-tracking traffic;
//! - `rpc` / `dispatch`: the calling primitives and the owner-side
//!   execution;
//! - `pool`: worker pools.

#![deny(missing_docs)]
#![allow(clippy::len_without_is_empty)]

#[macro_use]
extern crate log;
#[macro_use(defer)]
extern crate scopeguard;

mod cluster;
mod dispatch;
mod error;
mod gc;
mod link;
mod pool;
mod proto;
mod refs;
mod refstore;
mod rpc;
pub mod test_utils;
mod vchannel;

pub use cluster::{ClusterConfig, Node, ProcessGroup, ProcessId, Role};
pub use error::{is_channel_closed, ClusterError, ReferenceError, RemoteException};
pub use link::{LinkState, LinkStats, WorkerLink};
pub use pool::{CachingPool, WorkerPool};
pub use proto::{Message, MsgHeader, Outcome, Payload, RefId, RemoteFunc};
pub use refs::{Future, RemoteChannel, RemoteChannelIter};
pub use refstore::{ChannelSpec, RefStore, RemoteValue};
pub use rpc::{CallContext, FuncRegistry, Reply};
pub use vchannel::{BoundedChannel, ValueChannel};
