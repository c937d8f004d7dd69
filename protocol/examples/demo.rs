//! Interactive CLI demo of the full SHOAL substrate lifecycle.
//!
//! Spins up a tracker and two gossiping peers inside one process, shares
//! a file from the first peer, downloads it from the second, and shows
//! the registry converging along the way.
//!
//! Run with:
//!   cargo run --example demo

use std::io::Write as _;
use std::sync::Arc;
use std::time::Duration;

use shoal_protocol::config::{AntiEntropyConfig, GossipConfig, PeerConfig, TrackerConfig};
use shoal_protocol::gossip::GossipTransport;
use shoal_protocol::peer::{download, PeerRuntime, SharedFiles};
use shoal_protocol::registry::{
    ConflictPolicy, ConflictResolver, DistributedRegistry, ServiceDirectory,
};
use shoal_protocol::tracker::{TrackerClient, TrackerServer};

const RESET: &str = "\x1b[0m";
const BOLD: &str = "\x1b[1m";
const GREEN: &str = "\x1b[32m";
const CYAN: &str = "\x1b[36m";

fn step(n: u32, what: &str) {
    println!();
    println!("{BOLD}{CYAN}[{n}] {what}{RESET}");
}

fn ok(what: &str) {
    println!("    {GREEN}✓{RESET} {what}");
}

async fn gossip_node(peer_id: &str) -> (Arc<GossipTransport>, Arc<DistributedRegistry>) {
    let cfg = GossipConfig {
        port: 0,
        interval_ms: 200,
        ..GossipConfig::default()
    };
    let transport = GossipTransport::new(cfg.clone());
    transport.start().await.expect("transport start");
    let registry = DistributedRegistry::new(
        peer_id,
        ConflictResolver::new(ConflictPolicy::Composite),
        Arc::clone(&transport),
        cfg,
        AntiEntropyConfig {
            interval_ms: 400,
            peers: 3,
        },
    );
    registry.start();
    (transport, registry)
}

#[tokio::main]
async fn main() {
    println!();
    println!("{BOLD}  SHOAL — peer-to-peer file sharing, end to end{RESET}");

    step(1, "Start the tracker");
    let tracker = TrackerServer::new(
        TrackerConfig {
            port: 0,
            ..TrackerConfig::default()
        },
        None,
    );
    let tracker_addr = tracker.start().await.expect("tracker start");
    let tracker_endpoint = format!("127.0.0.1:{}", tracker_addr.port());
    ok(&format!("tracker listening on {tracker_endpoint}"));

    step(2, "Start two gossiping peers");
    let (transport_a, registry_a) = gossip_node("peer-a").await;
    let (transport_b, registry_b) = gossip_node("peer-b").await;
    transport_a
        .add_peer(&transport_b.self_addr())
        .expect("wire a->b");
    transport_b
        .add_peer(&transport_a.self_addr())
        .expect("wire b->a");
    ok(&format!(
        "gossip mesh: {} ↔ {}",
        transport_a.self_addr(),
        transport_b.self_addr()
    ));

    step(3, "Peer A shares a file and joins the network");
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("manifesto.txt");
    std::fs::File::create(&path)
        .expect("create")
        .write_all(b"files want to be shared\n")
        .expect("write");

    let files = Arc::new(SharedFiles::new());
    files.add(&path).expect("share");

    let peer_a = PeerRuntime::new(
        "peer-a",
        PeerConfig {
            port: 0,
            ..PeerConfig::default()
        },
        &tracker_endpoint,
        Arc::clone(&files),
        Some(Arc::clone(&registry_a) as Arc<dyn ServiceDirectory>),
    );
    let peer_a_addr = peer_a.start().await.expect("peer start");
    peer_a.wait_ready().await;
    ok(&format!(
        "peer-a running on 127.0.0.1:{}, sharing manifesto.txt",
        peer_a_addr.port()
    ));

    step(4, "Registry converges to peer B over gossip");
    for _ in 0..50 {
        if !registry_b.discover_services("peer").is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    let discovered = registry_b.discover_services("peer");
    let announced = discovered.first().expect("peer-a never reached peer-b");
    ok(&format!(
        "peer-b discovered {} at {} (capabilities: {})",
        announced.service_id,
        announced.address(),
        announced
            .metadata
            .get("capabilities")
            .map(String::as_str)
            .unwrap_or("?")
    ));

    step(5, "Tracker sees the heartbeating peer");
    let client = TrackerClient::new(&tracker_endpoint, 5_000);
    let alive = client.is_peer_alive("peer-a").await.expect("liveness");
    ok(&format!("IS_PEER_ALIVE peer-a → {}", if alive { "ALIVE" } else { "NOT_ALIVE" }));

    step(6, "Download the file from peer A, verifying the checksum");
    let dest = tempfile::tempdir().expect("tempdir");
    let fetched = download(&announced.address(), "manifesto.txt", dest.path())
        .await
        .expect("download");
    ok(&format!(
        "{} bytes, sha-256 {}",
        fetched.size,
        &fetched.checksum[..16]
    ));
    ok(&format!(
        "content: {:?}",
        String::from_utf8_lossy(&std::fs::read(&fetched.path).expect("read")).trim_end()
    ));

    step(7, "Tear everything down");
    peer_a.stop().await;
    registry_a.stop();
    registry_b.stop();
    transport_a.stop();
    transport_b.stop();
    tracker.stop();
    ok("all components stopped");
    println!();
}
