//! Cluster formation over real TCP loopback: a master accepting joiners, two
//! workers joining and connecting to each other through the identify
//! handshake.

use std::time::Duration;

use pretty_assertions::assert_eq;

use procmesh::test_utils::wait_until;
use procmesh::{ClusterConfig, Future, ProcessGroup, RemoteFunc};

#[test]
fn test_tcp_cluster_bootstrap() {
    let _ = env_logger::builder().is_test(true).try_init();
    let config = ClusterConfig::new("tcp-test-cookie");

    let master = ProcessGroup::new_master(config.clone());
    let (master_addr, _listener) = master.serve_master("127.0.0.1:0").unwrap();

    let worker2 = ProcessGroup::new_member(config.clone());
    worker2
        .join_cluster(master_addr, Some("127.0.0.1:0"))
        .unwrap();
    assert_eq!(worker2.myid(), 2);
    // the master learns the worker's peer address from its JoinComplete
    // before the next joiner is told about it
    assert!(wait_until(Duration::from_secs(5), || {
        master
            .worker_from_id(2)
            .map(|l| l.listen_addr().is_some())
            .unwrap_or(false)
    }));

    let worker3 = ProcessGroup::new_member(config.clone());
    worker3
        .join_cluster(master_addr, Some("127.0.0.1:0"))
        .unwrap();
    assert_eq!(worker3.myid(), 3);
    assert!(wait_until(Duration::from_secs(5), || {
        worker3.workers().contains(&2) && worker2.workers().contains(&3)
    }));
    assert_eq!(master.workers(), vec![2, 3]);

    for group in [&master, &worker2, &worker3] {
        let me = group.clone();
        group.register("whoami", move |(): ()| Ok(me.myid()));
        group.register("add", |(a, b): (i64, i64)| Ok(a + b));
    }

    // master to worker
    let sum: i64 = master
        .remotecall_fetch(&RemoteFunc::new("add"), 2, &(40i64, 2i64))
        .unwrap();
    assert_eq!(sum, 42);

    // worker to worker, across the identify-handshake link
    let who: i64 = worker2
        .remotecall_fetch(&RemoteFunc::new("whoami"), 3, &())
        .unwrap();
    assert_eq!(who, 3);

    // worker to master
    let fut: Future<i64> = worker3
        .remotecall(&RemoteFunc::new("whoami"), 1, &())
        .unwrap();
    assert_eq!(fut.fetch().unwrap(), 1);

    worker3.shutdown();
    worker2.shutdown();
    master.shutdown();
}
