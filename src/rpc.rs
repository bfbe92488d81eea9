//! Remote procedure invocation: the function registry, the owner-side
//! builtins every handle operation lands on, and the four calling
//! primitives.
//!
//! Functions cross the wire by registry name; the callee resolves the name
//! and runs the handler on a thread of its own, in arrival order per link.
//! The primitives differ in where the result goes:
//!
//! - [`ProcessGroup::remotecall`] stores it in a callee-side cell and hands
//!   the caller a [`Future`] naming it;
//! - [`ProcessGroup::remotecall_fetch`] sends it back to a transient
//!   caller-side cell that is awaited and deleted;
//! - [`ProcessGroup::remotecall_wait`] stores it on the callee and
//!   additionally notifies a caller-side cell on completion;
//! - [`ProcessGroup::remote_do`] discards it.
//!
//! Calls targeting this very process skip the wire and run on a local
//! thread, with identical semantics.

use std::cell::Cell;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::thread;

use anyhow::Error;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::cluster::{enter_ambient, ProcessGroup, ProcessId};
use crate::error::{ClusterError, RemoteException};
use crate::link::WorkerLink;
use crate::proto::{CallMsg, Message, MsgHeader, Outcome, Payload, RefId, RemoteFunc, ResultMsg};
use crate::refs::{Future, RefKind, RefState, RemoteChannel};
use crate::refstore::ChannelSpec;

/// What a handler produced.
pub enum Reply {
    /// A serialized return value, delivered by the dispatcher according to
    /// the calling mode.
    Value(Payload),
    /// The handler already sent the response itself (see `take_ref`); the
    /// dispatcher must not deliver anything.
    Sent,
}

/// The environment a handler runs in: the group the call arrived on and the
/// way back to the caller.
pub struct CallContext<'a> {
    group: &'a Arc<ProcessGroup>,
    caller: ProcessId,
    responder: Option<(&'a Arc<WorkerLink>, RefId)>,
    responded: Cell<bool>,
}

impl<'a> CallContext<'a> {
    /// The group the call arrived on.
    pub fn group(&self) -> &Arc<ProcessGroup> {
        self.group
    }

    /// The id of the calling process, 0 for a local call.
    pub fn caller(&self) -> ProcessId {
        self.caller
    }

    /// Whether the call came over a link rather than from this process.
    pub fn is_remote(&self) -> bool {
        self.caller != 0
    }

    /// Decode a payload inside this group's decode context, so remote
    /// references in it canonicalize properly.
    pub fn decode_args<T: DeserializeOwned>(&self, payload: &[u8]) -> Result<T, Error> {
        self.group.decode(payload)
    }

    /// Encode a return value for the caller.
    pub fn encode<T: Serialize>(&self, value: &T) -> Result<Payload, Error> {
        self.group.encode_for(self.caller, value)
    }

    /// Whether the handler may deliver the response itself.
    pub(crate) fn can_respond(&self) -> bool {
        self.responder.is_some()
    }

    /// Deliver the response now, instead of letting the dispatcher do it
    /// after the handler returns. Only meaningful for fetching calls.
    pub(crate) fn respond(&self, value: Outcome) -> Result<(), Error> {
        let (link, response) = self
            .responder
            .ok_or_else(|| ClusterError::Protocol("this call takes no response".into()))?;
        link.send_msg(
            MsgHeader::new(response),
            &Message::Result(ResultMsg { value }),
            false,
        )?;
        self.responded.set(true);
        Ok(())
    }
}

type Handler = dyn Fn(&CallContext, &[u8], &[u8]) -> Result<Reply, Error> + Send + Sync;

/// The functions a group can invoke on behalf of its peers.
pub struct FuncRegistry {
    map: RwLock<HashMap<String, Arc<Handler>>>,
}

impl FuncRegistry {
    pub(crate) fn new() -> FuncRegistry {
        FuncRegistry {
            map: RwLock::new(HashMap::new()),
        }
    }

    pub(crate) fn register_raw<F>(&self, name: &str, f: F)
    where
        F: Fn(&CallContext, &[u8], &[u8]) -> Result<Reply, Error> + Send + Sync + 'static,
    {
        self.map
            .write()
            .unwrap()
            .insert(name.to_string(), Arc::new(f));
    }

    pub(crate) fn get(&self, name: &str) -> Option<Arc<Handler>> {
        self.map.read().unwrap().get(name).cloned()
    }
}

/// Resolve and run the function of a call, capturing failures into the wire
/// envelope. Returns `None` when the handler delivered the response itself.
pub(crate) fn run_call(
    group: &Arc<ProcessGroup>,
    link: Option<&Arc<WorkerLink>>,
    response: RefId,
    call: &CallMsg,
    can_respond: bool,
) -> Option<Outcome> {
    let _ambient = enter_ambient(group.clone());
    let ctx = CallContext {
        group,
        caller: link.map(|l| l.pid()).unwrap_or(0),
        responder: match (link, can_respond) {
            (Some(link), true) if !response.is_null() => Some((link, response)),
            _ => None,
        },
        responded: Cell::new(false),
    };
    let result = match group.funcs.get(&call.func.name) {
        Some(handler) => (*handler)(&ctx, &call.func.env, &call.args),
        None => Err(ClusterError::Protocol(format!(
            "unknown remote function '{}'",
            call.func.name
        ))
        .into()),
    };
    match result {
        Ok(Reply::Value(payload)) => Some(Ok(payload)),
        Ok(Reply::Sent) => None,
        Err(e) => Some(Err(RemoteException::capture(group.myid(), &e))),
    }
}

#[derive(Serialize, Deserialize)]
pub(crate) struct RefArgs {
    pub rid: RefId,
}

#[derive(Serialize, Deserialize)]
pub(crate) struct PutFutureArgs {
    pub rid: RefId,
    pub value: Payload,
    pub caller: ProcessId,
}

#[derive(Serialize, Deserialize)]
pub(crate) struct PutRefArgs {
    pub rid: RefId,
    pub value: Payload,
}

#[derive(Serialize, Deserialize)]
pub(crate) struct MakeChannelArgs {
    pub rid: RefId,
    pub spec: ChannelSpec,
}

#[derive(Serialize, Deserialize)]
pub(crate) struct ExecFromCacheArgs {
    /// The function itself, present only the first time it runs on this
    /// worker; it is stored into `chan` for the calls that follow.
    pub prime: Option<RemoteFunc>,
    /// The worker-local channel caching the function.
    pub chan: RemoteChannel<RemoteFunc>,
    /// The serialized arguments of the actual call.
    pub args: Payload,
}

#[derive(Serialize, Deserialize)]
pub(crate) struct PoolRidArgs {
    pub rid: RefId,
}

#[derive(Serialize, Deserialize)]
pub(crate) struct PoolWorkerArgs {
    pub rid: RefId,
    pub worker: ProcessId,
}

fn unwrap_outcome(out: Outcome) -> Result<Reply, Error> {
    match out {
        Ok(payload) => Ok(Reply::Value(payload)),
        Err(remote) => Err(ClusterError::Remote(remote).into()),
    }
}

/// Register the owner-side functions every group answers: handle operations,
/// client tracking, the closure cache and pool forwarding.
pub(crate) fn register_builtins(funcs: &FuncRegistry) {
    funcs.register_raw("put_future", |ctx, _env, args| {
        let PutFutureArgs { rid, value, caller } = ctx.decode_args(args)?;
        let rv = ctx
            .group()
            .refstore
            .lookup_or_create(rid, ChannelSpec::unbounded());
        rv.try_put_once(Ok(value)).map_err(ClusterError::from)?;
        // the caller holds the value in its cache now, its handle no longer
        // needs the cell
        if caller != 0 {
            ctx.group().refstore.del_client(rid, caller);
        }
        Ok(Reply::Value(ctx.encode(&())?))
    });

    funcs.register_raw("put_ref", |ctx, _env, args| {
        let PutRefArgs { rid, value } = ctx.decode_args(args)?;
        let rv = ctx
            .group()
            .refstore
            .lookup_or_create(rid, ChannelSpec::unbounded());
        rv.channel().put(Ok(value)).map_err(ClusterError::from)?;
        // do not let the remote putter return while a remote take is still
        // serializing the value out
        rv.sync_barrier();
        Ok(Reply::Value(ctx.encode(&())?))
    });

    funcs.register_raw("take_ref", |ctx, _env, args| {
        let RefArgs { rid } = ctx.decode_args(args)?;
        let rv = ctx
            .group()
            .refstore
            .lookup_or_create(rid, ChannelSpec::unbounded());
        if ctx.is_remote() && ctx.can_respond() {
            if let Some(synctake) = rv.synctake() {
                // held from before the take until the response frame is
                // written: the local putter cannot observe its put complete
                // and garbage-collect before the value is safely out
                let _guard = synctake.lock().unwrap();
                let out = rv.channel().take().map_err(ClusterError::from)?;
                ctx.respond(out)?;
                return Ok(Reply::Sent);
            }
        }
        unwrap_outcome(rv.channel().take().map_err(ClusterError::from)?)
    });

    funcs.register_raw("fetch_ref", |ctx, _env, args| {
        let RefArgs { rid } = ctx.decode_args(args)?;
        let rv = ctx
            .group()
            .refstore
            .lookup_or_create(rid, ChannelSpec::unbounded());
        unwrap_outcome(rv.channel().fetch().map_err(ClusterError::from)?)
    });

    funcs.register_raw("isready_ref", |ctx, _env, args| {
        let RefArgs { rid } = ctx.decode_args(args)?;
        let rv = ctx
            .group()
            .refstore
            .lookup_or_create(rid, ChannelSpec::unbounded());
        Ok(Reply::Value(ctx.encode(&rv.channel().is_ready())?))
    });

    funcs.register_raw("isopen_ref", |ctx, _env, args| {
        let RefArgs { rid } = ctx.decode_args(args)?;
        let rv = ctx
            .group()
            .refstore
            .lookup_or_create(rid, ChannelSpec::unbounded());
        Ok(Reply::Value(ctx.encode(&rv.channel().is_open())?))
    });

    funcs.register_raw("isempty_ref", |ctx, _env, args| {
        let RefArgs { rid } = ctx.decode_args(args)?;
        let rv = ctx
            .group()
            .refstore
            .lookup_or_create(rid, ChannelSpec::unbounded());
        Ok(Reply::Value(ctx.encode(&rv.channel().is_empty())?))
    });

    funcs.register_raw("close_ref", |ctx, _env, args| {
        let RefArgs { rid } = ctx.decode_args(args)?;
        let rv = ctx
            .group()
            .refstore
            .lookup_or_create(rid, ChannelSpec::unbounded());
        rv.channel().close();
        Ok(Reply::Value(ctx.encode(&())?))
    });

    funcs.register_raw("make_channel", |ctx, _env, args| {
        let MakeChannelArgs { rid, spec } = ctx.decode_args(args)?;
        ctx.group().refstore.lookup_or_create(rid, spec);
        Ok(Reply::Value(ctx.encode(&())?))
    });

    funcs.register_raw("add_clients", |ctx, _env, args| {
        let pairs: Vec<(RefId, ProcessId)> = ctx.decode_args(args)?;
        trace!("Adding {} clients", pairs.len());
        for (rid, pid) in pairs {
            ctx.group().refstore.add_client(rid, pid);
        }
        Ok(Reply::Value(ctx.encode(&())?))
    });

    funcs.register_raw("del_clients", |ctx, _env, args| {
        let pairs: Vec<(RefId, ProcessId)> = ctx.decode_args(args)?;
        trace!("Deleting {} clients", pairs.len());
        for (rid, pid) in pairs {
            ctx.group().refstore.del_client(rid, pid);
        }
        Ok(Reply::Value(ctx.encode(&())?))
    });

    funcs.register_raw("exec_from_cache", |ctx, env, args| {
        debug_assert!(env.is_empty());
        let exec: ExecFromCacheArgs = ctx.decode_args(args)?;
        let func = match exec.prime {
            Some(func) => {
                // first use on this worker: store the function locally
                exec.chan.put(&func)?;
                func
            }
            None => exec.chan.fetch()?,
        };
        let handler = ctx.group().funcs.get(&func.name).ok_or_else(|| {
            ClusterError::Protocol(format!("unknown remote function '{}'", func.name))
        })?;
        (*handler)(ctx, &func.env, &exec.args)
    });

    funcs.register_raw("pool_take", |ctx, _env, args| {
        let PoolRidArgs { rid } = ctx.decode_args(args)?;
        let pool = crate::pool::lookup_pool(ctx.group(), rid)?;
        let worker = pool.take(ctx.group())?;
        Ok(Reply::Value(ctx.encode(&worker)?))
    });

    funcs.register_raw("pool_put", |ctx, _env, args| {
        let PoolWorkerArgs { rid, worker } = ctx.decode_args(args)?;
        let pool = crate::pool::lookup_pool(ctx.group(), rid)?;
        Ok(Reply::Value(ctx.encode(&pool.put(worker)?)?))
    });

    funcs.register_raw("pool_push", |ctx, _env, args| {
        let PoolWorkerArgs { rid, worker } = ctx.decode_args(args)?;
        let pool = crate::pool::lookup_pool(ctx.group(), rid)?;
        pool.push(worker)?;
        Ok(Reply::Value(ctx.encode(&())?))
    });

    funcs.register_raw("pool_len", |ctx, _env, args| {
        let PoolRidArgs { rid } = ctx.decode_args(args)?;
        let pool = crate::pool::lookup_pool(ctx.group(), rid)?;
        Ok(Reply::Value(ctx.encode(&pool.len())?))
    });

    funcs.register_raw("pool_ready", |ctx, _env, args| {
        let PoolRidArgs { rid } = ctx.decode_args(args)?;
        let pool = crate::pool::lookup_pool(ctx.group(), rid)?;
        Ok(Reply::Value(ctx.encode(&pool.is_ready())?))
    });

    funcs.register_raw("pool_workers", |ctx, _env, args| {
        let PoolRidArgs { rid } = ctx.decode_args(args)?;
        let pool = crate::pool::lookup_pool(ctx.group(), rid)?;
        Ok(Reply::Value(ctx.encode(&pool.workers())?))
    });

    funcs.register_raw("default_pool", |ctx, _env, _args| {
        let pool = ctx.group().default_worker_pool()?;
        Ok(Reply::Value(ctx.encode(&pool)?))
    });
}

impl ProcessGroup {
    /// Register a function invokable by the peers of this group. The
    /// argument and return types travel serialized; remote references inside
    /// them are tracked and canonicalized automatically.
    pub fn register<A, R, F>(&self, name: &str, f: F)
    where
        A: DeserializeOwned,
        R: Serialize,
        F: Fn(A) -> Result<R, Error> + Send + Sync + 'static,
    {
        self.funcs.register_raw(name, move |ctx, _env, args| {
            let args: A = ctx.decode_args(args)?;
            Ok(Reply::Value(ctx.encode(&f(args)?)?))
        });
    }

    /// Register a closure-like function taking a serialized environment
    /// (see [`RemoteFunc::with_env`]) in addition to its arguments.
    pub fn register_with_env<E, A, R, F>(&self, name: &str, f: F)
    where
        E: DeserializeOwned,
        A: DeserializeOwned,
        R: Serialize,
        F: Fn(E, A) -> Result<R, Error> + Send + Sync + 'static,
    {
        self.funcs.register_raw(name, move |ctx, env, args| {
            let env: E = ctx.decode_args(env)?;
            let args: A = ctx.decode_args(args)?;
            Ok(Reply::Value(ctx.encode(&f(env, args)?)?))
        });
    }

    /// Register a function that needs the full [`CallContext`] (caller id,
    /// raw payloads, ambient group).
    pub fn register_ctx<F>(&self, name: &str, f: F)
    where
        F: Fn(&CallContext, &[u8], &[u8]) -> Result<Reply, Error> + Send + Sync + 'static,
    {
        self.funcs.register_raw(name, f);
    }

    /// Invoke `func` on worker `pid`, returning immediately with a [`Future`]
    /// for the result. The result cell lives on the callee.
    pub fn remotecall<A, R>(
        self: &Arc<Self>,
        func: &RemoteFunc,
        pid: ProcessId,
        args: &A,
    ) -> Result<Future<R>, Error>
    where
        A: Serialize,
    {
        let payload = self.encode_for(pid, args)?;
        let state = self.remotecall_raw(func.clone(), pid, payload)?;
        Ok(Future::from_state(state))
    }

    pub(crate) fn remotecall_raw(
        self: &Arc<Self>,
        func: RemoteFunc,
        pid: ProcessId,
        args: Payload,
    ) -> Result<Arc<RefState>, Error> {
        let rid = self.next_ref_id();
        let state = RefState::create(self, rid, pid, RefKind::Future);
        if pid == self.myid() {
            let rv = self.refstore.lookup_or_create(rid, ChannelSpec::unbounded());
            let group = self.clone();
            let call = CallMsg { func, args };
            thread::Builder::new()
                .name(format!("Local call {}", call.func.name))
                .spawn(move || {
                    if let Some(out) = run_call(&group, None, RefId::NULL, &call, false) {
                        let _ = rv.channel().put(out);
                    }
                })
                .expect("Failed to spawn local call thread");
        } else {
            self.send_msg(
                pid,
                MsgHeader::new(rid),
                &Message::Call(CallMsg { func, args }),
                false,
            )?;
        }
        Ok(state)
    }

    /// Invoke `func` on worker `pid` and wait for its value. A failure on the
    /// worker is unwrapped and returned as an error.
    pub fn remotecall_fetch<A, R>(
        self: &Arc<Self>,
        func: &RemoteFunc,
        pid: ProcessId,
        args: &A,
    ) -> Result<R, Error>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let payload = self.encode_for(pid, args)?;
        let out = self.remotecall_fetch_raw(func.clone(), pid, payload)?;
        self.decode(&out)
    }

    pub(crate) fn remotecall_fetch_raw(
        self: &Arc<Self>,
        func: RemoteFunc,
        pid: ProcessId,
        args: Payload,
    ) -> Result<Payload, Error> {
        if pid == self.myid() {
            let call = CallMsg { func, args };
            let out = run_call(self, None, RefId::NULL, &call, false)
                .expect("a local call cannot deliver its own response");
            return match out {
                Ok(payload) => Ok(payload),
                Err(remote) => Err(ClusterError::Remote(remote).into()),
            };
        }
        let rid = self.next_ref_id();
        let rv = self.refstore.lookup_or_create(rid, ChannelSpec::unbounded());
        let link = self.worker_from_id(pid)?;
        link.track_pending(rid);
        if let Err(e) = link.send_msg(
            MsgHeader::new(rid),
            &Message::CallFetch(CallMsg { func, args }),
            false,
        ) {
            link.untrack_pending(rid);
            self.refstore.remove(rid);
            return Err(e);
        }
        let out = rv.channel().take();
        link.untrack_pending(rid);
        // the transient response cell served its purpose
        self.refstore.remove(rid);
        match out {
            Ok(Ok(payload)) => Ok(payload),
            Ok(Err(remote)) => Err(ClusterError::Remote(remote).into()),
            Err(_) => Err(ClusterError::Transport {
                pid,
                reason: "connection lost while awaiting the result".into(),
            }
            .into()),
        }
    }

    /// Invoke `func` on worker `pid` and wait for the call to complete,
    /// returning a [`Future`] that is already fulfilled on the callee. A
    /// failure on the worker surfaces here instead of at the first fetch.
    pub fn remotecall_wait<A, R>(
        self: &Arc<Self>,
        func: &RemoteFunc,
        pid: ProcessId,
        args: &A,
    ) -> Result<Future<R>, Error>
    where
        A: Serialize,
    {
        let payload = self.encode_for(pid, args)?;
        if pid == self.myid() {
            let state = self.remotecall_raw(func.clone(), pid, payload)?;
            let fut = Future::<R>::from_state(state);
            return match fut.fetch_outcome()? {
                Ok(_) => Ok(fut),
                Err(remote) => Err(ClusterError::Remote(remote).into()),
            };
        }
        let notify = self.next_ref_id();
        let nrv = self.refstore.lookup_or_create(notify, ChannelSpec::unbounded());
        let rid = self.next_ref_id();
        let state = RefState::create(self, rid, pid, RefKind::Future);
        let link = self.worker_from_id(pid)?;
        link.track_pending(notify);
        let msg = Message::CallWait(CallMsg {
            func: func.clone(),
            args: payload,
        });
        if let Err(e) = link.send_msg(MsgHeader::with_notify(rid, notify), &msg, false) {
            link.untrack_pending(notify);
            self.refstore.remove(notify);
            return Err(e);
        }
        let out = nrv.channel().take();
        link.untrack_pending(notify);
        self.refstore.remove(notify);
        match out {
            Ok(Ok(_)) => Ok(Future::from_state(state)),
            Ok(Err(remote)) => Err(ClusterError::Remote(remote).into()),
            Err(_) => Err(ClusterError::Transport {
                pid,
                reason: "connection lost while awaiting completion".into(),
            }
            .into()),
        }
    }

    /// Invoke `func` on worker `pid` discarding the result. No delivery
    /// guarantee beyond submission order on the link; failures are logged on
    /// the worker and lost.
    pub fn remote_do<A>(self: &Arc<Self>, func: &RemoteFunc, pid: ProcessId, args: &A) -> Result<(), Error>
    where
        A: Serialize,
    {
        let payload = self.encode_for(pid, args)?;
        if pid == self.myid() {
            let group = self.clone();
            let call = CallMsg {
                func: func.clone(),
                args: payload,
            };
            thread::Builder::new()
                .name(format!("Remote do {}", call.func.name))
                .spawn(move || {
                    if let Some(Err(e)) = run_call(&group, None, RefId::NULL, &call, false) {
                        error!("Error in remote_do({}) on worker {}: {}", call.func.name, group.myid(), e);
                    }
                })
                .expect("Failed to spawn remote_do thread");
            return Ok(());
        }
        self.send_msg(
            pid,
            MsgHeader::default(),
            &Message::RemoteDo(CallMsg {
                func: func.clone(),
                args: payload,
            }),
            false,
        )
    }

    /// Invoke `func` on its owner's table: the call runs locally when this
    /// process is the owner, remotely otherwise.
    pub(crate) fn call_on_owner<A: Serialize>(
        self: &Arc<Self>,
        func: &str,
        owner: ProcessId,
        args: &A,
    ) -> Result<Payload, Error> {
        let payload = self.encode_for(owner, args)?;
        self.remotecall_fetch_raw(RemoteFunc::new(func), owner, payload)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_local_remotecall_fetch() {
        let group = ProcessGroup::standalone(1);
        group.register("double", |x: i64| Ok(x * 2));
        let res: i64 = group
            .remotecall_fetch(&RemoteFunc::new("double"), 1, &21i64)
            .unwrap();
        assert_eq!(res, 42);
        group.shutdown();
    }

    #[test]
    fn test_local_remotecall_future() {
        let group = ProcessGroup::standalone(1);
        group.register("concat", |(a, b): (String, String)| Ok(a + &b));
        let fut: Future<String> = group
            .remotecall(
                &RemoteFunc::new("concat"),
                1,
                &("foo".to_string(), "bar".to_string()),
            )
            .unwrap();
        assert_eq!(fut.fetch().unwrap(), "foobar");
        // cached: a second fetch answers without the cell
        assert_eq!(fut.fetch().unwrap(), "foobar");
        group.shutdown();
    }

    #[test]
    fn test_local_call_unwraps_user_error() {
        let group = ProcessGroup::standalone(1);
        group.register("fail", |(): ()| -> Result<(), Error> {
            Err(anyhow::anyhow!("boom"))
        });
        let err = group
            .remotecall_fetch::<_, ()>(&RemoteFunc::new("fail"), 1, &())
            .unwrap_err();
        let err = err.downcast::<ClusterError>().unwrap();
        match err {
            ClusterError::Remote(remote) => {
                assert_eq!(remote.pid, 1);
                assert!(remote.exception.contains("boom"));
            }
            other => panic!("wrong error: {:?}", other),
        }
        group.shutdown();
    }

    #[test]
    fn test_unknown_function() {
        let group = ProcessGroup::standalone(1);
        let err = group
            .remotecall_fetch::<_, ()>(&RemoteFunc::new("nope"), 1, &())
            .unwrap_err();
        let err = err.downcast::<ClusterError>().unwrap();
        match err {
            ClusterError::Remote(remote) => assert!(remote.exception.contains("nope")),
            other => panic!("wrong error: {:?}", other),
        }
        group.shutdown();
    }

    #[test]
    fn test_closure_env_reaches_handler() {
        let group = ProcessGroup::standalone(1);
        group.register_with_env("offset_sum", |base: i64, xs: Vec<i64>| {
            Ok(base + xs.iter().sum::<i64>())
        });
        let func = RemoteFunc::with_env("offset_sum", &100i64).unwrap();
        let res: i64 = group
            .remotecall_fetch(&func, 1, &vec![1i64, 2, 3])
            .unwrap();
        assert_eq!(res, 106);
        group.shutdown();
    }
}
