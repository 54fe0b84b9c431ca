//! Multi-node scenarios over real sockets on localhost.

use dht_node::storage::{immutable_target, sha1};
use dht_node::{Config, Dht, MutableUpdate, SigningKey, StorageItem};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

fn local_config(bootstrap: Vec<SocketAddr>) -> Config {
    Config {
        address: SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0),
        bootstrap,
        query_timeout: Duration::from_millis(500),
        ..Config::default()
    }
}

async fn spawn_cluster(size: usize) -> Vec<Dht> {
    let _ = pretty_env_logger::try_init();
    let mut nodes = Vec::with_capacity(size);

    let seed = Dht::listen(local_config(Vec::new())).await.unwrap();
    let bootstrap = vec![SocketAddr::V4(seed.local_addr())];
    nodes.push(seed);

    for _ in 1..size {
        nodes.push(Dht::listen(local_config(bootstrap.clone())).await.unwrap());
    }

    // A second self-lookup over the denser mesh so every table converges.
    for node in &nodes {
        node.find_node(*node.id()).await;
    }

    nodes
}

#[tokio::test]
async fn get_peers_before_any_announce_is_empty() {
    let nodes = spawn_cluster(8).await;
    let target = sha1(b"no-peers-target");

    let peers = nodes[3].get_peers(target).await;

    assert!(peers.is_empty());
}

#[tokio::test]
async fn announced_peers_are_returned_to_other_nodes() {
    let nodes = spawn_cluster(20).await;
    let target = sha1(b"announced");

    let accepted_a = nodes[2].announce_peer(target, Some(1234)).await;
    let accepted_b = nodes[14].announce_peer(target, Some(5678)).await;

    assert_eq!(accepted_a, 8);
    assert_eq!(accepted_b, 8);

    let peers = nodes[7].get_peers(target).await;
    let mut ports: Vec<u16> = peers.iter().map(|peer| peer.port()).collect();
    ports.sort_unstable();

    assert_eq!(ports, vec![1234, 5678]);
    for peer in &peers {
        assert_eq!(*peer.ip(), Ipv4Addr::LOCALHOST);
    }
}

#[tokio::test]
async fn exactly_the_eight_closest_nodes_hold_the_announcements() {
    let nodes = spawn_cluster(20).await;
    let target = sha1(b"announced");

    nodes[2].announce_peer(target, Some(1234)).await;
    nodes[14].announce_peer(target, Some(5678)).await;

    // Probe every node's get_peers handler directly and count which of
    // them answer with stored values.
    let probe = tokio_krpc::RecvTransport::bind("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    let (_queries, _handle) = probe.serve();
    let send = probe.send_transport(Duration::from_millis(500));
    let probe_id = dht_node::NodeID::random();

    let mut holders = 0;
    for node in &nodes {
        let response = send
            .get_peers(probe_id, SocketAddr::V4(node.local_addr()), target)
            .await
            .unwrap();

        if response.values.map(|values| !values.is_empty()).unwrap_or(false) {
            holders += 1;
        }
    }

    assert_eq!(holders, 8);
}

#[tokio::test]
async fn immutable_values_survive_a_put_get_round_trip() {
    let nodes = spawn_cluster(12).await;

    let target = nodes[1]
        .put_immutable(b"test-immutable".to_vec())
        .await
        .unwrap();

    assert_eq!(target, immutable_target(b"test-immutable"));

    let fetched = nodes[9].get(target).await;

    match fetched {
        Some(StorageItem::Immutable { value }) => assert_eq!(value, b"test-immutable"),
        other => panic!("expected the immutable value back, got {:?}", other),
    }
}

#[tokio::test]
async fn oversize_immutable_values_never_leave_the_node() {
    let nodes = spawn_cluster(4).await;

    let result = nodes[1].put_immutable(vec![0u8; 1001]).await;

    assert!(result.is_err());
}

#[tokio::test]
async fn mutable_values_update_through_sequence_numbers() {
    let nodes = spawn_cluster(12).await;
    let signing_key = SigningKey::from_bytes(&[7u8; 32]);
    let public_key = signing_key.verifying_key().to_bytes();

    nodes[3]
        .put_mutable(&signing_key, None, |previous| {
            assert!(previous.is_none());
            MutableUpdate {
                value: b"test-mutable".to_vec(),
                seq: 0,
            }
        })
        .await
        .unwrap();

    let first = nodes[11].get_mutable(&public_key, None).await.unwrap();
    match first {
        Some(StorageItem::Mutable(item)) => {
            assert_eq!(item.value, b"test-mutable");
            assert_eq!(item.seq, 0);
        }
        other => panic!("expected the mutable value back, got {:?}", other),
    }

    nodes[3]
        .put_mutable(&signing_key, None, |previous| {
            let previous = previous.expect("the first write should be visible");
            assert_eq!(previous.seq, 0);
            MutableUpdate {
                value: b"v2".to_vec(),
                seq: previous.seq + 1,
            }
        })
        .await
        .unwrap();

    let second = nodes[8].get_mutable(&public_key, None).await.unwrap();
    match second {
        Some(StorageItem::Mutable(item)) => {
            assert_eq!(item.value, b"v2");
            assert_eq!(item.seq, 1);
        }
        other => panic!("expected the updated value back, got {:?}", other),
    }
}

#[tokio::test]
async fn stale_sequence_numbers_are_rejected_by_receivers() {
    let nodes = spawn_cluster(12).await;
    let signing_key = SigningKey::from_bytes(&[9u8; 32]);
    let public_key = signing_key.verifying_key().to_bytes();

    nodes[2]
        .put_mutable(&signing_key, None, |_| MutableUpdate {
            value: b"current".to_vec(),
            seq: 5,
        })
        .await
        .unwrap();

    // A writer ignoring the observed record and reusing an old sequence
    // number is turned away by every storing node.
    nodes[4]
        .put_mutable(&signing_key, None, |_| MutableUpdate {
            value: b"stale".to_vec(),
            seq: 1,
        })
        .await
        .unwrap();

    let fetched = nodes[10].get_mutable(&public_key, None).await.unwrap();
    match fetched {
        Some(StorageItem::Mutable(item)) => {
            assert_eq!(item.value, b"current");
            assert_eq!(item.seq, 5);
        }
        other => panic!("expected the newer value to survive, got {:?}", other),
    }
}

#[tokio::test]
async fn salted_and_unsalted_writes_do_not_collide() {
    let nodes = spawn_cluster(10).await;
    let signing_key = SigningKey::from_bytes(&[11u8; 32]);
    let public_key = signing_key.verifying_key().to_bytes();

    nodes[1]
        .put_mutable(&signing_key, None, |_| MutableUpdate {
            value: b"plain".to_vec(),
            seq: 0,
        })
        .await
        .unwrap();
    nodes[2]
        .put_mutable(&signing_key, Some(b"foobar".to_vec()), |_| MutableUpdate {
            value: b"salted".to_vec(),
            seq: 0,
        })
        .await
        .unwrap();

    let plain = nodes[5].get_mutable(&public_key, None).await.unwrap();
    let salted = nodes[6]
        .get_mutable(&public_key, Some(b"foobar".to_vec()))
        .await
        .unwrap();

    assert_eq!(plain.unwrap().value(), b"plain");
    assert_eq!(salted.unwrap().value(), b"salted");
}

#[tokio::test]
async fn state_survives_a_save_load_round_trip() {
    let nodes = spawn_cluster(6).await;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dht.json");
    nodes[0].save(&path).await.unwrap();

    let standalone = Dht::listen(local_config(Vec::new())).await.unwrap();
    assert!(standalone.closest_nodes(*standalone.id(), None).await.is_empty());

    let restored = standalone.load(&path).await.unwrap();

    assert!(restored > 0);
    assert!(!standalone.closest_nodes(*standalone.id(), None).await.is_empty());
}

#[tokio::test]
async fn dispose_tears_the_node_down() {
    let node = Dht::listen(local_config(Vec::new())).await.unwrap();
    let address = SocketAddr::V4(node.local_addr());

    node.dispose().await;

    // A fresh node querying the disposed address only sees silence.
    let prober = Dht::listen(local_config(Vec::new())).await.unwrap();
    assert!(prober.ping(address).await.is_err());
}
