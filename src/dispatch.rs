//! The per-link reader: decodes incoming frames, recovers from malformed
//! bodies, and schedules the owner-side execution of calls.
//!
//! Calls are scheduled in arrival order (one thread per call, spawned as the
//! frames come in) so per-link FIFO holds for scheduling; completion order is
//! up to the functions themselves. Result messages route into local cells
//! directly on the reader thread.

use std::sync::Arc;
use std::thread;

use procmesh_channel::FrameReceiver;

use crate::cluster::ProcessGroup;
use crate::error::RemoteException;
use crate::link::WorkerLink;
use crate::proto::{CallMsg, Message, MsgHeader, Outcome, RefId, ResultMsg};
use crate::refstore::ChannelSpec;
use crate::rpc::run_call;

/// Where the outcome of an incoming call goes.
enum CallKind {
    /// Into a cell on this node (the callee): `Call`.
    Store,
    /// Back to the caller as a `Result`: `CallFetch`.
    Fetch,
    /// Into a local cell, plus a completion `Result` to the caller's notify
    /// cell: `CallWait`.
    Wait { notify: RefId },
}

/// Read frames from a link until it dies.
pub(crate) fn reader_loop(
    group: Arc<ProcessGroup>,
    link: Arc<WorkerLink>,
    mut receiver: FrameReceiver<Message>,
) {
    loop {
        match receiver.recv() {
            Err(e) => {
                if !group.is_shutdown() {
                    debug!("Connection to worker {} lost: {}", link.pid(), e);
                }
                group.handle_link_failure(&link);
                break;
            }
            Ok((frame, body)) => {
                link.stats().note_recv();
                let header = MsgHeader::from_frame(frame);
                match body {
                    Ok(msg) => handle_msg(&group, &link, header, msg),
                    Err(e) => {
                        // the stream already resynchronized past the frame
                        // boundary; report the failure where the response was
                        // expected
                        warn!(
                            "Failed to deserialize a message from worker {}: {}",
                            link.pid(),
                            e
                        );
                        if !header.response.is_null() {
                            let exception = RemoteException {
                                pid: group.myid(),
                                reference: None,
                                exception: e.to_string(),
                                backtrace: String::new(),
                            };
                            let result = Message::Result(ResultMsg {
                                value: Err(exception),
                            });
                            if let Err(e) =
                                link.send_msg(MsgHeader::new(header.response), &result, true)
                            {
                                debug!("Failed to report the decode error: {:?}", e);
                            }
                        }
                    }
                }
            }
        }
    }
}

fn handle_msg(group: &Arc<ProcessGroup>, link: &Arc<WorkerLink>, header: MsgHeader, msg: Message) {
    match msg {
        Message::Call(call) => schedule_call(group, link, header.response, call, CallKind::Store),
        Message::CallFetch(call) => {
            schedule_call(group, link, header.response, call, CallKind::Fetch)
        }
        Message::CallWait(call) => schedule_call(
            group,
            link,
            header.response,
            call,
            CallKind::Wait {
                notify: header.notify,
            },
        ),
        Message::RemoteDo(call) => schedule_do(group, link, call),
        Message::Result(result) => deliver_result(group, header.response, result.value),
        Message::IdentifySocketAck => link.mark_connected(),
        Message::JoinComplete(join) => {
            debug!(
                "Worker {} completed the join ({} peers)",
                link.pid(),
                join.nworkers
            );
            link.set_listen_addr(join.listen_addr);
        }
        Message::IdentifySocket(_) | Message::JoinPgrp(_) => {
            warn!(
                "Unexpected identification message on the established link to worker {}",
                link.pid()
            );
        }
    }
}

/// Schedule the execution of an incoming call. The response cell is created
/// and marked on the reader thread, in arrival order; the function itself
/// runs on a thread of its own.
fn schedule_call(
    group: &Arc<ProcessGroup>,
    link: &Arc<WorkerLink>,
    response: RefId,
    call: CallMsg,
    kind: CallKind,
) {
    let rv = match kind {
        CallKind::Store | CallKind::Wait { .. } => {
            let rv = group.refstore.lookup_or_create(response, ChannelSpec::unbounded());
            group.refstore.set_waiting(response, link.pid());
            Some(rv)
        }
        CallKind::Fetch => None,
    };
    let group = group.clone();
    let link = link.clone();
    thread::Builder::new()
        .name(format!("Call thunk {}", call.func.name))
        .spawn(move || {
            let can_respond = matches!(kind, CallKind::Fetch);
            let out = run_call(&group, Some(&link), response, &call, can_respond);
            match kind {
                CallKind::Store => {
                    if let Some(out) = out {
                        if let Err(e) = rv.unwrap().channel().put(out) {
                            debug!("Result cell {} rejected the value: {:?}", response, e);
                        }
                    }
                    group.refstore.clear_waiting(response);
                }
                CallKind::Fetch => {
                    if let Some(value) = out {
                        let result = Message::Result(ResultMsg { value });
                        if let Err(e) = link.send_msg(MsgHeader::new(response), &result, false) {
                            debug!("Failed to deliver the result of {}: {:?}", call.func.name, e);
                        }
                    }
                }
                CallKind::Wait { notify } => {
                    if let Some(out) = out {
                        if let Err(e) = rv.unwrap().channel().put(out.clone()) {
                            debug!("Result cell {} rejected the value: {:?}", response, e);
                        }
                        let result = Message::Result(ResultMsg { value: out });
                        if let Err(e) = link.send_msg(MsgHeader::new(notify), &result, false) {
                            debug!("Failed to notify completion of {}: {:?}", call.func.name, e);
                        }
                    }
                    group.refstore.clear_waiting(response);
                }
            }
        })
        .expect("Failed to spawn call thread");
}

/// Schedule a fire-and-forget call: failures are logged here and lost.
fn schedule_do(group: &Arc<ProcessGroup>, link: &Arc<WorkerLink>, call: CallMsg) {
    let group = group.clone();
    let link = link.clone();
    thread::Builder::new()
        .name(format!("Remote do {}", call.func.name))
        .spawn(move || {
            if let Some(Err(e)) = run_call(&group, Some(&link), RefId::NULL, &call, false) {
                error!(
                    "Error in remote_do({}) from worker {}: {}",
                    call.func.name,
                    link.pid(),
                    e
                );
            }
        })
        .expect("Failed to spawn remote_do thread");
}

/// Route an incoming result into the local cell it is addressed to. A result
/// for a cell that is already gone (an abandoned fetch, a late reply) is
/// dropped.
fn deliver_result(group: &Arc<ProcessGroup>, response: RefId, value: Outcome) {
    if response.is_null() {
        debug!("Dropping a result with no destination");
        return;
    }
    if let Err(e) = group.refstore.deliver(response, value) {
        debug!("Dropping a result for {}: {:?}", response, e);
    }
}
