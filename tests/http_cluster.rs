//! A real three-node cluster on loopback: TCP between nodes, HTTP to clients,
//! logs on disk.

use std::collections::HashMap;
use std::net::{SocketAddr, TcpListener};
use std::thread;
use std::time::Duration;

use tempfile::TempDir;

use atomic_raft::server::{Config, Server};
use atomic_raft::{AtomicValueClient, ClientConfig, NodeId};

struct TestCluster {
    clients: Vec<(NodeId, String)>,
    _dirs: Vec<TempDir>,
}

fn free_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

fn start_cluster(size: u64) -> TestCluster {
    let raft: HashMap<u64, SocketAddr> = (1..=size).map(|id| (id, free_addr())).collect();
    let http: HashMap<u64, SocketAddr> = (1..=size).map(|id| (id, free_addr())).collect();
    let mut dirs = Vec::new();

    for id in 1..=size {
        let dir = TempDir::new().unwrap();
        let mut config = Config::new(id, raft[&id].to_string(), dir.path());
        config.client_addr = Some(http[&id].to_string());
        config.peers = raft
            .iter()
            .filter(|(peer, _)| **peer != id)
            .map(|(peer, addr)| (peer.to_string(), addr.to_string()))
            .collect();
        dirs.push(dir);

        thread::spawn(move || {
            let mut server = Server::start(config).expect("server starts");
            server.run()
        });
    }

    TestCluster {
        clients: (1..=size)
            .map(|id| (NodeId::from(id), format!("http://{}", http[&id])))
            .collect(),
        _dirs: dirs,
    }
}

fn client(cluster: &TestCluster) -> AtomicValueClient {
    AtomicValueClient::new(
        cluster.clients.clone(),
        ClientConfig {
            retry_window: Duration::from_secs(10),
            ..ClientConfig::default()
        },
    )
    .unwrap()
}

#[tokio::test]
async fn get_set_and_compare_and_set_over_http() {
    let cluster = start_cluster(3);
    let mut c = client(&cluster);

    assert_eq!(c.get("value").await.unwrap(), None);

    assert_eq!(c.set("value", b"v0".to_vec()).await.unwrap(), None);
    assert_eq!(c.get("value").await.unwrap(), Some(b"v0".to_vec()));

    assert!(!c
        .compare_and_set("value", Some(b"v1"), b"v2".to_vec())
        .await
        .unwrap());
    assert_eq!(c.get("value").await.unwrap(), Some(b"v0".to_vec()));

    assert!(c
        .compare_and_set("value", Some(b"v0"), b"v1".to_vec())
        .await
        .unwrap());
    assert_eq!(c.get("value").await.unwrap(), Some(b"v1".to_vec()));

    // Primitives are independent.
    assert!(c.compare_and_set("other", None, b"x".to_vec()).await.unwrap());
    assert_eq!(c.get("value").await.unwrap(), Some(b"v1".to_vec()));
}

#[tokio::test]
async fn clients_see_each_others_writes() {
    let cluster = start_cluster(3);
    let mut writer = client(&cluster);
    let mut reader = client(&cluster);

    for i in 0..5u8 {
        writer.set("counter", vec![i]).await.unwrap();
        assert_eq!(reader.get("counter").await.unwrap(), Some(vec![i]));
    }
}

#[tokio::test]
async fn nodes_agree_on_the_leader() {
    let cluster = start_cluster(3);
    let mut c = client(&cluster);
    c.set("value", b"v".to_vec()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let mut statuses = Vec::new();
    for (id, _) in &cluster.clients {
        statuses.push(c.status(*id).await.unwrap());
    }

    let leader = statuses[0].leader.expect("leader known");
    assert!(statuses.iter().all(|s| s.leader == Some(leader)));
    assert_eq!(statuses.iter().filter(|s| s.role == "leader").count(), 1);
    assert!(statuses.iter().all(|s| s.commit_index.get() >= 2));
}
