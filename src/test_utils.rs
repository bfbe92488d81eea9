//! Utilities for tests: an in-process mesh of process groups wired over
//! local framed channels, plus small helpers the integration tests share.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Error;
use serde::de::DeserializeOwned;
use serde::Serialize;

use procmesh_channel::new_local_channel;

use crate::cluster::{ProcessGroup, ProcessId};
use crate::proto::MsgHeader;

/// A full mesh of `n` process groups living in this very process, connected
/// pairwise by in-memory framed channels. Group `i` has id `i + 1`; id 1 is
/// the master. Dropping the mesh shuts every group down.
pub struct LocalMesh {
    groups: Vec<Arc<ProcessGroup>>,
}

impl LocalMesh {
    /// Build a connected mesh of `n` nodes.
    pub fn new(n: usize) -> LocalMesh {
        let groups: Vec<_> = (1..=n as ProcessId).map(ProcessGroup::standalone).collect();
        for i in 0..n {
            for j in (i + 1)..n {
                // one framed pipe per direction
                let (i_to_j_tx, i_to_j_rx) = new_local_channel();
                let (j_to_i_tx, j_to_i_rx) = new_local_channel();
                groups[i].install_link(groups[j].myid(), i_to_j_tx, j_to_i_rx, true);
                groups[j].install_link(groups[i].myid(), j_to_i_tx, i_to_j_rx, true);
            }
        }
        LocalMesh { groups }
    }

    /// The group with the given id.
    pub fn group(&self, pid: ProcessId) -> &Arc<ProcessGroup> {
        &self.groups[(pid - 1) as usize]
    }

    /// All the groups of the mesh, in id order.
    pub fn groups(&self) -> &[Arc<ProcessGroup>] {
        &self.groups
    }

    /// Register the same function on every node of the mesh.
    pub fn register_all<A, R, F>(&self, name: &str, f: F)
    where
        A: DeserializeOwned,
        R: Serialize,
        F: Fn(A) -> Result<R, Error> + Clone + Send + Sync + 'static,
    {
        for group in &self.groups {
            group.register(name, f.clone());
        }
    }

    /// Register the same environment-taking function on every node.
    pub fn register_with_env_all<E, A, R, F>(&self, name: &str, f: F)
    where
        E: DeserializeOwned,
        A: DeserializeOwned,
        R: Serialize,
        F: Fn(E, A) -> Result<R, Error> + Clone + Send + Sync + 'static,
    {
        for group in &self.groups {
            group.register_with_env(name, f.clone());
        }
    }

    /// Tear the whole mesh down.
    pub fn shutdown(&self) {
        for group in &self.groups {
            group.shutdown();
        }
    }
}

impl Drop for LocalMesh {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Write a raw frame on the link from `from` towards `pid`, bypassing
/// serialization. Used to inject malformed bodies in protocol tests.
pub fn inject_raw_frame(
    from: &Arc<ProcessGroup>,
    pid: ProcessId,
    header: MsgHeader,
    body: &[u8],
) -> Result<(), Error> {
    from.worker_from_id(pid)?.send_raw(header, body)
}

/// Poll `cond` until it holds or `timeout` expires; returns whether it held.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}
