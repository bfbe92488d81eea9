//! The link to one peer of the group: connection state, the locked write
//! half, and the buffers of coalesced GC traffic.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};

use anyhow::Error;
use procmesh_channel::FrameSender;

use crate::cluster::ProcessId;
use crate::error::ClusterError;
use crate::proto::{CallMsg, Message, MsgHeader, RefId, RemoteFunc};

/// Connection state of a worker link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// The transport exists but the peer has not been identified yet. Only
    /// identification messages may be sent.
    Created,
    /// The identification exchange completed; all traffic flows.
    Connected,
    /// The connection is gone. Every send fails immediately.
    Terminated,
}

/// Deferred client-tracking messages awaiting a flush towards this peer.
#[derive(Default)]
struct GcBuffers {
    add_msgs: Vec<(RefId, ProcessId)>,
    del_msgs: Vec<(RefId, ProcessId)>,
}

/// Traffic counters of a link.
#[derive(Default)]
pub struct LinkStats {
    frames_sent: AtomicU64,
    frames_recv: AtomicU64,
    bytes_sent: AtomicU64,
    gc_batches: AtomicU64,
}

impl LinkStats {
    /// Frames written to this link.
    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }

    /// Frames read from this link.
    pub fn frames_recv(&self) -> u64 {
        self.frames_recv.load(Ordering::Relaxed)
    }

    /// Bytes written to this link.
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    /// Coalesced GC batches flushed on this link.
    pub fn gc_batches(&self) -> u64 {
        self.gc_batches.load(Ordering::Relaxed)
    }

    pub(crate) fn note_recv(&self) {
        self.frames_recv.fetch_add(1, Ordering::Relaxed);
    }

    fn note_sent(&self, bytes: usize) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }
}

/// The link to one peer: a state machine gating traffic, the write half of
/// the framed channel, and the per-peer GC buffers.
pub struct WorkerLink {
    pid: ProcessId,
    state: Mutex<LinkState>,
    state_cv: Condvar,
    sender: Mutex<Option<FrameSender<Message>>>,
    gc: Mutex<GcBuffers>,
    gcflag: AtomicBool,
    stats: LinkStats,
    /// Transient response cells with a request in flight on this link; failed
    /// over when the connection dies.
    pending: Mutex<HashSet<RefId>>,
    /// Where this peer accepts peer connections, learned from JoinComplete.
    listen_addr: Mutex<Option<String>>,
}

impl WorkerLink {
    /// Wrap the write half of a channel into a link in the given state.
    pub fn new(pid: ProcessId, sender: FrameSender<Message>, state: LinkState) -> WorkerLink {
        WorkerLink {
            pid,
            state: Mutex::new(state),
            state_cv: Condvar::new(),
            sender: Mutex::new(Some(sender)),
            gc: Mutex::new(GcBuffers::default()),
            gcflag: AtomicBool::new(false),
            stats: LinkStats::default(),
            pending: Mutex::new(HashSet::new()),
            listen_addr: Mutex::new(None),
        }
    }

    /// The peer this link talks to.
    pub fn pid(&self) -> ProcessId {
        self.pid
    }

    /// Current connection state.
    pub fn state(&self) -> LinkState {
        *self.state.lock().unwrap()
    }

    /// Traffic counters.
    pub fn stats(&self) -> &LinkStats {
        &self.stats
    }

    /// The identification exchange completed: unblock the waiting writers.
    pub fn mark_connected(&self) {
        let mut state = self.state.lock().unwrap();
        if *state == LinkState::Created {
            *state = LinkState::Connected;
        }
        self.state_cv.notify_all();
    }

    /// Tear the link down: fail current and future senders and drop the write
    /// half, waking up the peer's reader. The GC buffers are discarded, there
    /// is nobody left to tell.
    pub fn terminate(&self) {
        {
            let mut state = self.state.lock().unwrap();
            *state = LinkState::Terminated;
            self.state_cv.notify_all();
        }
        if let Some(mut sender) = self.sender.lock().unwrap().take() {
            sender.shutdown();
        }
        let mut gc = self.gc.lock().unwrap();
        gc.add_msgs.clear();
        gc.del_msgs.clear();
    }

    fn wait_connected(&self) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        while *state == LinkState::Created {
            state = self.state_cv.wait(state).unwrap();
        }
        match *state {
            LinkState::Connected => Ok(()),
            _ => Err(self.transport_error("link terminated")),
        }
    }

    fn transport_error(&self, reason: &str) -> Error {
        ClusterError::Transport {
            pid: self.pid,
            reason: reason.into(),
        }
        .into()
    }

    /// Write a message on the link.
    ///
    /// Non-identity messages block until the peer has been identified. With
    /// `now` the frame is flushed immediately; otherwise pending GC batches
    /// for this peer are written behind it before the flush, amortizing their
    /// cost on traffic that was leaving anyway.
    pub fn send_msg(&self, header: MsgHeader, msg: &Message, now: bool) -> Result<(), Error> {
        if !msg.is_identity() {
            self.wait_connected()?;
        } else if self.state() == LinkState::Terminated {
            return Err(self.transport_error("link terminated"));
        }
        let mut guard = self.sender.lock().unwrap();
        let sender = guard
            .as_mut()
            .ok_or_else(|| self.transport_error("link terminated"))?;
        let bytes = sender.send(header.to_frame(), msg)?;
        self.stats.note_sent(bytes);
        if !now && self.gcflag.load(Ordering::Acquire) {
            let (adds, dels) = self.drain_gc();
            self.write_gc_frames(sender, adds, dels)?;
        }
        sender.flush()?;
        Ok(())
    }

    /// Write a raw frame on the link, bypassing serialization. Meant for
    /// protocol tests that need to inject malformed bodies.
    pub fn send_raw(&self, header: MsgHeader, body: &[u8]) -> Result<(), Error> {
        let mut guard = self.sender.lock().unwrap();
        let sender = guard
            .as_mut()
            .ok_or_else(|| self.transport_error("link terminated"))?;
        let bytes = sender.send_raw(header.to_frame(), body)?;
        self.stats.note_sent(bytes);
        sender.flush()?;
        Ok(())
    }

    /// Buffer an add-client pair towards this peer.
    pub fn push_add_client(&self, rid: RefId, client: ProcessId) {
        if self.state() == LinkState::Terminated {
            return;
        }
        self.gc.lock().unwrap().add_msgs.push((rid, client));
        self.gcflag.store(true, Ordering::Release);
    }

    /// Buffer a del-client pair towards this peer.
    pub fn push_del_client(&self, rid: RefId, client: ProcessId) {
        if self.state() == LinkState::Terminated {
            return;
        }
        self.gc.lock().unwrap().del_msgs.push((rid, client));
        self.gcflag.store(true, Ordering::Release);
    }

    /// Whether GC traffic is waiting to be flushed.
    pub fn has_gc_pending(&self) -> bool {
        self.gcflag.load(Ordering::Acquire)
    }

    fn drain_gc(&self) -> (Vec<(RefId, ProcessId)>, Vec<(RefId, ProcessId)>) {
        self.gcflag.store(false, Ordering::Release);
        let mut gc = self.gc.lock().unwrap();
        (
            std::mem::take(&mut gc.add_msgs),
            std::mem::take(&mut gc.del_msgs),
        )
    }

    fn write_gc_frames(
        &self,
        sender: &mut FrameSender<Message>,
        adds: Vec<(RefId, ProcessId)>,
        dels: Vec<(RefId, ProcessId)>,
    ) -> Result<(), Error> {
        for (name, pairs) in [("add_clients", adds), ("del_clients", dels)] {
            if pairs.is_empty() {
                continue;
            }
            trace!("Flushing {} {} pairs to worker {}", pairs.len(), name, self.pid);
            let msg = Message::RemoteDo(CallMsg {
                func: RemoteFunc::new(name),
                args: bincode::serialize(&pairs)?,
            });
            let bytes = sender.send(MsgHeader::default().to_frame(), &msg)?;
            self.stats.note_sent(bytes);
            self.stats.gc_batches.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Flush the pending GC batches of this link, if any. Called by the GC
    /// pump.
    pub fn flush_gc(&self) -> Result<(), Error> {
        if !self.gcflag.load(Ordering::Acquire) {
            return Ok(());
        }
        if self.state() != LinkState::Connected {
            return Ok(());
        }
        let (adds, dels) = self.drain_gc();
        let mut guard = self.sender.lock().unwrap();
        let sender = guard
            .as_mut()
            .ok_or_else(|| self.transport_error("link terminated"))?;
        self.write_gc_frames(sender, adds, dels)?;
        sender.flush()?;
        Ok(())
    }

    /// Track a transient response cell awaiting a reply on this link.
    pub fn track_pending(&self, rid: RefId) {
        self.pending.lock().unwrap().insert(rid);
    }

    /// The reply for `rid` arrived (or the request was abandoned).
    pub fn untrack_pending(&self, rid: RefId) {
        self.pending.lock().unwrap().remove(&rid);
    }

    /// Drain the transient cells still awaiting a reply; used when the
    /// connection dies to fail them over.
    pub fn take_pending(&self) -> Vec<RefId> {
        self.pending.lock().unwrap().drain().collect()
    }

    /// Record where this peer accepts peer connections.
    pub fn set_listen_addr(&self, addr: Option<String>) {
        *self.listen_addr.lock().unwrap() = addr;
    }

    /// Where this peer accepts peer connections, if known.
    pub fn listen_addr(&self) -> Option<String> {
        self.listen_addr.lock().unwrap().clone()
    }
}

impl std::fmt::Debug for WorkerLink {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("WorkerLink")
            .field("pid", &self.pid)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use procmesh_channel::new_local_channel;

    use super::*;

    #[test]
    fn test_identity_messages_skip_the_gate() {
        let (tx, mut rx) = new_local_channel();
        let link = WorkerLink::new(2, tx, LinkState::Created);
        link.send_msg(
            MsgHeader::default(),
            &Message::IdentifySocket(crate::proto::IdentifyMsg { from_pid: 1 }),
            true,
        )
        .unwrap();
        let (_, msg) = rx.recv().unwrap();
        assert!(matches!(msg.unwrap(), Message::IdentifySocket(_)));
    }

    #[test]
    fn test_writers_block_until_connected() {
        let (tx, mut rx) = new_local_channel();
        let link = Arc::new(WorkerLink::new(2, tx, LinkState::Created));
        let link2 = link.clone();
        let writer = thread::spawn(move || {
            link2.send_msg(
                MsgHeader::default(),
                &Message::Result(crate::proto::ResultMsg { value: Ok(vec![]) }),
                true,
            )
        });
        thread::sleep(Duration::from_millis(50));
        assert!(!writer.is_finished());
        link.mark_connected();
        writer.join().unwrap().unwrap();
        let (_, msg) = rx.recv().unwrap();
        assert!(matches!(msg.unwrap(), Message::Result(_)));
    }

    #[test]
    fn test_gc_piggybacks_on_outbound_traffic() {
        let (tx, mut rx) = new_local_channel();
        let link = WorkerLink::new(2, tx, LinkState::Connected);
        let rid = RefId { whence: 1, id: 1 };
        link.push_del_client(rid, 1);
        link.send_msg(
            MsgHeader::default(),
            &Message::Result(crate::proto::ResultMsg { value: Ok(vec![]) }),
            false,
        )
        .unwrap();
        let (_, first) = rx.recv().unwrap();
        assert!(matches!(first.unwrap(), Message::Result(_)));
        let (_, second) = rx.recv().unwrap();
        match second.unwrap() {
            Message::RemoteDo(call) => {
                assert_eq!(call.func.name, "del_clients");
                let pairs: Vec<(RefId, ProcessId)> = bincode::deserialize(&call.args).unwrap();
                assert_eq!(pairs, vec![(rid, 1)]);
            }
            other => panic!("wrong message: {:?}", other),
        }
        assert!(!link.has_gc_pending());
        assert_eq!(link.stats().gc_batches(), 1);
    }

    #[test]
    fn test_terminated_link_fails_sends() {
        let (tx, _rx) = new_local_channel();
        let link = WorkerLink::new(2, tx, LinkState::Connected);
        link.terminate();
        let err = link
            .send_msg(
                MsgHeader::default(),
                &Message::Result(crate::proto::ResultMsg { value: Ok(vec![]) }),
                true,
            )
            .unwrap_err();
        let err = err.downcast::<ClusterError>().unwrap();
        assert!(matches!(err, ClusterError::Transport { pid: 2, .. }));
    }
}
