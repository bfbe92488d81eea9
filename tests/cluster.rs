//! End-to-end tests over an in-process mesh: three nodes (1 is the master,
//! 2 and 3 are workers) connected pairwise by in-memory framed channels.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use pretty_assertions::assert_eq;

use procmesh::test_utils::{inject_raw_frame, wait_until, LocalMesh};
use procmesh::{
    CachingPool, ClusterError, Future, MsgHeader, Node, ReferenceError, RemoteChannel, RemoteFunc,
    Role, WorkerPool,
};

fn setup() -> LocalMesh {
    let _ = env_logger::builder().is_test(true).try_init();
    let mesh = LocalMesh::new(3);
    mesh.register_all("echo", |x: Vec<u8>| Ok(x));
    mesh.register_all("add", |(a, b): (i64, i64)| Ok(a + b));
    mesh
}

#[test]
fn test_remotecall_fetch_identity() {
    let mesh = setup();
    mesh.register_all("identity", |x: (Vec<u8>, String, Option<i64>)| Ok(x));
    let payload = (vec![1u8, 2, 3], "hello".to_string(), Some(42i64));
    let back: (Vec<u8>, String, Option<i64>) = mesh
        .group(1)
        .remotecall_fetch(&RemoteFunc::new("identity"), 2, &payload)
        .unwrap();
    assert_eq!(back, payload);
}

#[test]
fn test_remotecall_future_roundtrip() {
    let mesh = setup();
    let fut: Future<i64> = mesh
        .group(1)
        .remotecall(&RemoteFunc::new("add"), 2, &(19i64, 23i64))
        .unwrap();
    assert_eq!(fut.fetch().unwrap(), 42);
}

#[test]
fn test_remotecall_wait_completes_before_returning() {
    let mesh = setup();
    let fut: Future<i64> = mesh
        .group(1)
        .remotecall_wait(&RemoteFunc::new("add"), 3, &(1i64, 2i64))
        .unwrap();
    // the computation is already done on the worker: the result cell is ready
    assert!(fut.is_ready().unwrap());
    assert_eq!(fut.fetch().unwrap(), 3);
}

#[test]
fn test_remotecall_wait_surfaces_failures() {
    let mesh = setup();
    mesh.register_all("boom", |(): ()| -> anyhow::Result<()> {
        anyhow::bail!("exploded")
    });
    let err = mesh
        .group(1)
        .remotecall_wait::<_, ()>(&RemoteFunc::new("boom"), 2, &())
        .unwrap_err();
    let err = err.downcast::<ClusterError>().unwrap();
    match err {
        ClusterError::Remote(remote) => {
            assert_eq!(remote.pid, 2);
            assert!(remote.exception.contains("exploded"));
        }
        other => panic!("wrong error: {:?}", other),
    }
}

#[test]
fn test_remote_do_fire_and_forget() {
    let mesh = setup();
    let chan = RemoteChannel::<i64>::new(mesh.group(1), 1).unwrap();
    mesh.register_all("announce", move |(chan, v): (RemoteChannel<i64>, i64)| {
        chan.put(&v)?;
        Ok(())
    });
    mesh.group(1)
        .remote_do(&RemoteFunc::new("announce"), 2, &(chan.clone(), 7i64))
        .unwrap();
    assert_eq!(chan.take().unwrap(), 7);
}

/// Scenario: cross-worker put/take through a rendezvous channel owned by a
/// third node. Exercises the synctake discipline in both directions.
#[test]
fn test_cross_worker_put_take_rendezvous() {
    let mesh = setup();
    mesh.register_all("putter", |(chan, v): (RemoteChannel<i64>, i64)| {
        chan.put(&v)?;
        Ok(())
    });
    mesh.register_all("taker", |chan: RemoteChannel<i64>| chan.take());
    for (putter_pid, taker_pid) in [(2, 3), (3, 2)] {
        let chan = RemoteChannel::<i64>::new_bounded(mesh.group(1), 1, 0).unwrap();
        let put_fut: Future<()> = mesh
            .group(1)
            .remotecall(&RemoteFunc::new("putter"), putter_pid, &(chan.clone(), 99i64))
            .unwrap();
        let take_fut: Future<i64> = mesh
            .group(1)
            .remotecall(&RemoteFunc::new("taker"), taker_pid, &chan.clone())
            .unwrap();
        assert_eq!(take_fut.fetch().unwrap(), 99);
        put_fut.fetch().unwrap();
    }
}

/// Scenario: a future can be set exactly once, and a fetched future answers
/// from its cache without touching the network again.
#[test]
fn test_future_single_set_and_cached_fetch() {
    let mesh = setup();
    // explicit put path
    let fut: Future<i64> = Future::new(mesh.group(1), 2);
    fut.put(&7).unwrap();
    let err = fut.put(&8).unwrap_err();
    let err = err.downcast::<ClusterError>().unwrap();
    assert_eq!(err.reference_kind(), Some(&ReferenceError::AlreadySet));
    assert_eq!(fut.fetch().unwrap(), 7);

    // a second writer with its own handle to the same cell also fails
    mesh.register_all("put_into", |(fut, v): (Future<i64>, i64)| {
        match fut.put(&v) {
            Ok(()) => Ok(true),
            Err(e) => {
                let e = e.downcast::<ClusterError>()?;
                if e.reference_kind() == Some(&ReferenceError::AlreadySet) {
                    Ok(false)
                } else {
                    Err(e.into())
                }
            }
        }
    });
    let uncached: Future<i64> = Future::new(mesh.group(1), 2);
    let stored: bool = mesh
        .group(1)
        .remotecall_fetch(&RemoteFunc::new("put_into"), 3, &(uncached.clone(), 5i64))
        .unwrap();
    assert!(stored);
    let stored_again: bool = mesh
        .group(1)
        .remotecall_fetch(&RemoteFunc::new("put_into"), 3, &(uncached.clone(), 6i64))
        .unwrap();
    assert!(!stored_again);

    // fetch-created cache: the second fetch sends nothing
    let fut: Future<i64> = mesh
        .group(1)
        .remotecall(&RemoteFunc::new("add"), 2, &(2i64, 3i64))
        .unwrap();
    assert_eq!(fut.fetch().unwrap(), 5);
    // let the deferred GC traffic from the cache-set drain before counting
    let link = mesh.group(1).worker_from_id(2).unwrap();
    let frames_after_first = loop {
        let frames = link.stats().frames_sent();
        thread::sleep(Duration::from_millis(100));
        if link.stats().frames_sent() == frames && !link.has_gc_pending() {
            break frames;
        }
    };
    assert_eq!(fut.fetch().unwrap(), 5);
    assert_eq!(link.stats().frames_sent(), frames_after_first);
}

/// Scenario: four pooled calls over workers 2 and 3 run two each, and the
/// pool refills once they complete.
#[test]
fn test_worker_pool_fairness() {
    let mesh = setup();
    for group in mesh.groups() {
        let me = group.clone();
        group.register("sleep_then_id", move |(): ()| {
            thread::sleep(Duration::from_millis(100));
            Ok(me.myid())
        });
    }
    let pool = WorkerPool::new(mesh.group(1), &[2, 3]).unwrap();
    let futs: Vec<Future<i64>> = (0..4)
        .map(|_| pool.remotecall(&RemoteFunc::new("sleep_then_id"), &()).unwrap())
        .collect();
    let mut counts: HashMap<i64, usize> = HashMap::new();
    for fut in &futs {
        *counts.entry(fut.fetch().unwrap()).or_default() += 1;
    }
    assert_eq!(counts.get(&2), Some(&2));
    assert_eq!(counts.get(&3), Some(&2));
    assert!(wait_until(Duration::from_secs(5), || pool.len().unwrap() == 2));
}

#[test]
fn test_worker_pool_forwards_across_nodes() {
    let mesh = setup();
    let pool = WorkerPool::new(mesh.group(1), &[2, 3]).unwrap();
    mesh.register_all("pool_probe", |pool: WorkerPool| {
        // this copy lives on another node and forwards to the owner
        let w = pool.take()?;
        pool.put(w)?;
        Ok(w)
    });
    let w: i64 = mesh
        .group(1)
        .remotecall_fetch(&RemoteFunc::new("pool_probe"), 2, &pool)
        .unwrap();
    assert!(w == 2 || w == 3);
    assert_eq!(pool.len().unwrap(), 2);
}

/// Scenario: a caching pool ships the captured environment to each worker at
/// most once; clearing the pool evicts the cached copies.
#[test]
fn test_caching_pool_sends_closure_once() {
    let mesh = setup();
    mesh.register_with_env_all("len_plus", |env: Vec<u8>, i: i64| {
        Ok(env.len() as i64 + i)
    });
    let big = vec![0u8; 1_000_000];
    let func = RemoteFunc::with_env("len_plus", &big).unwrap();
    let pool = CachingPool::new(mesh.group(1), &[2, 3]).unwrap();

    // sequential calls alternate workers deterministically: the first two
    // prime them, the rest hit the cache
    for i in 0..4i64 {
        let res: i64 = pool.remotecall_fetch(&func, &i).unwrap();
        assert_eq!(res, 1_000_000 + i);
    }
    assert_eq!(pool.cached_len(), 2);
    let link2 = mesh.group(1).worker_from_id(2).unwrap();
    let link3 = mesh.group(1).worker_from_id(3).unwrap();
    let bytes_before = (link2.stats().bytes_sent(), link3.stats().bytes_sent());
    assert!(bytes_before.0 > 1_000_000);
    assert!(bytes_before.1 > 1_000_000);
    for i in 4..8i64 {
        let res: i64 = pool.remotecall_fetch(&func, &i).unwrap();
        assert_eq!(res, 1_000_000 + i);
    }
    // the environment did not cross the wire again
    assert!(link2.stats().bytes_sent() - bytes_before.0 < 100_000);
    assert!(link3.stats().bytes_sent() - bytes_before.1 < 100_000);

    // clearing drops the worker-side copies
    let refs2_before = mesh.group(2).refs().len();
    pool.clear();
    assert_eq!(pool.cached_len(), 0);
    assert!(wait_until(Duration::from_secs(5), || {
        mesh.group(2).refs().len() < refs2_before
    }));
}

/// Scenario: a thousand dropped futures reach the owner as a handful of
/// coalesced del-client batches, and its table returns to its prior size.
#[test]
fn test_gc_coalescing() {
    let mesh = setup();
    mesh.register_all("nop", |(): ()| Ok(0i64));
    let group1 = mesh.group(1);
    let baseline = mesh.group(2).refs().len();
    let futures: Vec<Future<i64>> = (0..1000)
        .map(|_| group1.remotecall(&RemoteFunc::new("nop"), 2, &()).unwrap())
        .collect();
    // every call left a result cell on worker 2
    assert!(wait_until(Duration::from_secs(5), || {
        mesh.group(2).refs().len() >= baseline + 1000
    }));
    let link = group1.worker_from_id(2).unwrap();
    let frames_before_drop = link.stats().frames_sent();
    drop(futures);
    assert!(wait_until(Duration::from_secs(5), || {
        mesh.group(2).refs().len() == baseline
    }));
    let frames_used = link.stats().frames_sent() - frames_before_drop;
    assert!(
        frames_used < 100,
        "dropping 1000 futures took {} frames",
        frames_used
    );
    assert!(link.stats().gc_batches() > 0);
}

/// Scenario: a body that fails to decode is reported to the response cell
/// and the link keeps working afterwards.
#[test]
fn test_decode_error_recovery() {
    let mesh = setup();
    let group1 = mesh.group(1);
    let rid = group1.next_ref_id();
    let rv = group1
        .refs()
        .lookup_or_create(rid, procmesh::ChannelSpec::unbounded());
    // tag 255 does not exist: worker 2 cannot decode this body
    inject_raw_frame(group1, 2, MsgHeader::new(rid), &[0xff, 0xee, 0xdd]).unwrap();
    let out = rv.channel().take().unwrap();
    let remote = out.unwrap_err();
    assert_eq!(remote.pid, 2);
    assert!(remote.exception.contains("unknown message tag"));
    group1.refs().remove(rid);
    // the link resynchronized: ordinary traffic flows
    let sum: i64 = group1
        .remotecall_fetch(&RemoteFunc::new("add"), 2, &(20i64, 22i64))
        .unwrap();
    assert_eq!(sum, 42);
}

#[test]
fn test_handle_identity_and_canonicalization() {
    let mesh = setup();
    let group1 = mesh.group(1);
    let chan = RemoteChannel::<i64>::new(group1, 2).unwrap();
    // two deserialized copies of the same reference are the same handle
    mesh.register_all(
        "compare",
        |(a, b): (RemoteChannel<i64>, RemoteChannel<i64>)| Ok(a == b),
    );
    let same: bool = group1
        .remotecall_fetch(
            &RemoteFunc::new("compare"),
            3,
            &(chan.clone(), chan.clone()),
        )
        .unwrap();
    assert!(same);
    // locally, decoding yields the canonical handle back
    let payload = group1.encode_for(1, &chan).unwrap();
    let copy: RemoteChannel<i64> = group1.decode(&payload).unwrap();
    assert_eq!(copy, chan);
    assert_eq!(copy.id(), chan.id());
}

#[test]
fn test_channel_close_drains_then_stops() {
    let mesh = setup();
    let group1 = mesh.group(1);
    let chan = RemoteChannel::<i64>::new(group1, 2).unwrap();
    for v in [1i64, 2, 3] {
        chan.put(&v).unwrap();
    }
    chan.close().unwrap();
    assert!(!chan.is_open().unwrap());
    // buffered values survive the close, then iteration ends cleanly
    let drained: Vec<i64> = chan.iter().collect();
    assert_eq!(drained, vec![1, 2, 3]);
    let err = chan.take().unwrap_err();
    assert!(procmesh::is_channel_closed(&err));
}

#[test]
fn test_channel_iteration_across_workers() {
    let mesh = setup();
    mesh.register_all("fill_and_close", |chan: RemoteChannel<i64>| {
        for v in 0..5i64 {
            chan.put(&v)?;
        }
        chan.close()?;
        Ok(())
    });
    mesh.register_all("drain", |chan: RemoteChannel<i64>| {
        Ok(chan.iter().collect::<Vec<i64>>())
    });
    let chan = RemoteChannel::<i64>::new(mesh.group(1), 1).unwrap();
    let fill: Future<()> = mesh
        .group(1)
        .remotecall(&RemoteFunc::new("fill_and_close"), 2, &chan.clone())
        .unwrap();
    let drain: Future<Vec<i64>> = mesh
        .group(1)
        .remotecall(&RemoteFunc::new("drain"), 3, &chan.clone())
        .unwrap();
    fill.fetch().unwrap();
    assert_eq!(drain.fetch().unwrap(), vec![0, 1, 2, 3, 4]);
}

#[test]
fn test_transport_failure_surfaces_to_waiters() {
    let mesh = setup();
    mesh.register_all("sleep_forever", |(): ()| {
        thread::sleep(Duration::from_secs(3600));
        Ok(())
    });
    let group1 = mesh.group(1).clone();
    let waiter = thread::spawn(move || {
        group1.remotecall_fetch::<_, ()>(&RemoteFunc::new("sleep_forever"), 2, &())
    });
    thread::sleep(Duration::from_millis(100));
    mesh.group(1).remove_worker(2);
    let err = waiter.join().unwrap().unwrap_err();
    let err = err.downcast::<ClusterError>().unwrap();
    assert!(matches!(err, ClusterError::Transport { pid: 2, .. }));
    // the worker is gone for later calls too
    let err = mesh
        .group(1)
        .remotecall_fetch::<_, Vec<u8>>(&RemoteFunc::new("echo"), 2, &vec![1u8])
        .unwrap_err();
    let err = err.downcast::<ClusterError>().unwrap();
    assert!(matches!(err, ClusterError::Transport { pid: 2, .. }));
}

/// A worker of one cluster mastering another: roles resolve per group, and
/// incoming calls run with the ambient role of the group they arrived on.
#[test]
fn test_multiscale_roles() {
    let _ = env_logger::builder().is_test(true).try_init();
    let outer = LocalMesh::new(2);
    let sub = LocalMesh::new(2);
    // the process playing outer-worker 2 also masters the sub cluster
    let node = Arc::new(Node::new());
    node.set_member(outer.group(2).clone());
    node.set_mastered(sub.group(1).clone());

    let report = {
        let node = node.clone();
        move |(): ()| -> anyhow::Result<(i64, i64, i64)> {
            Ok((
                node.my_id(Role::Default)?,
                node.my_id(Role::Master)?,
                node.my_id(Role::Worker)?,
            ))
        }
    };
    outer.group(2).register("report_roles", report.clone());
    sub.group(1).register("report_roles", report.clone());

    // user code on the node: Default picks the member group
    assert_eq!(node.my_id(Role::Default).unwrap(), 2);

    // a call arriving from the outer master runs with the outer-group view
    let (default_id, master_id, worker_id): (i64, i64, i64) = outer
        .group(1)
        .remotecall_fetch(&RemoteFunc::new("report_roles"), 2, &())
        .unwrap();
    assert_eq!((default_id, master_id, worker_id), (2, 1, 2));

    // a call arriving from the sub cluster runs with the mastered-group view
    let sub_report = sub
        .group(2)
        .remotecall_fetch::<_, (i64, i64, i64)>(&RemoteFunc::new("report_roles"), 1, &())
        .unwrap();
    assert_eq!(sub_report, (1, 1, 2));

    // explicit roles address the two clusters from the node itself
    sub.group(2).register("double", |x: i64| Ok(x * 2));
    outer.group(1).register("double", |x: i64| Ok(x * 3));
    let via_sub: i64 = node
        .remotecall_fetch(Role::Master, &RemoteFunc::new("double"), 2, &21i64)
        .unwrap();
    assert_eq!(via_sub, 42);
    let via_outer: i64 = node
        .remotecall_fetch(Role::Worker, &RemoteFunc::new("double"), 1, &21i64)
        .unwrap();
    assert_eq!(via_outer, 63);
}

#[test]
fn test_default_pool_fetched_from_master() {
    let mesh = setup();
    // the master materializes the default pool with its current workers
    let master_pool = mesh.group(1).default_worker_pool().unwrap();
    assert_eq!(master_pool.workers().unwrap(), vec![2, 3]);
    // a worker fetches it remotely and operates on the same pool
    let worker_pool = mesh.group(2).default_worker_pool().unwrap();
    let w = worker_pool.take().unwrap();
    assert!(w == 2 || w == 3);
    worker_pool.put(w).unwrap();
    assert_eq!(master_pool.len().unwrap(), 2);
}

#[test]
fn test_future_wait_timeout() {
    let mesh = setup();
    mesh.register_all("slowish", |(): ()| {
        thread::sleep(Duration::from_millis(200));
        Ok(1i64)
    });
    let fut: Future<i64> = mesh
        .group(1)
        .remotecall(&RemoteFunc::new("slowish"), 2, &())
        .unwrap();
    assert!(!fut.wait_timeout(Duration::from_millis(20)).unwrap());
    assert!(fut.wait_timeout(Duration::from_secs(5)).unwrap());
    assert_eq!(fut.fetch().unwrap(), 1);
}
