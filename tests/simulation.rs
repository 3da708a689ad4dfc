//! End-to-end simulation tests.
//!
//! These create namespaces, links and processes, so they need CAP_NET_ADMIN
//! and CAP_SYS_ADMIN: `cargo test --features sudo-tests` as root.

#![cfg(feature = "sudo-tests")]

use std::path::PathBuf;
use std::process::Command;

use nsnetsim::{Error, RouterKind, Topology};

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("nsnetsim=debug")
        .try_init();
}

fn has_binary(name: &str) -> bool {
    Command::new("which")
        .arg(name)
        .output()
        .map(|out| out.status.success())
        .unwrap_or(false)
}

/// Run a command inside a router's namespace through the standard tooling.
fn in_netns(ns: &str, args: &[&str]) -> std::process::Output {
    Command::new("ip")
        .args(["netns", "exec", ns])
        .args(args)
        .output()
        .expect("failed to run command in namespace")
}

fn netns_exists(name: &str) -> bool {
    PathBuf::from("/run/netns").join(name).exists()
}

fn link_exists(name: &str) -> bool {
    Command::new("ip")
        .args(["link", "show", name])
        .output()
        .map(|out| out.status.success())
        .unwrap_or(false)
}

/// Two plain routers joined by a switch can ping each other, and destroy
/// removes every minted object.
#[tokio::test(flavor = "multi_thread")]
async fn two_routers_reach_each_other_over_a_switch() {
    init_logging();
    let mut topology = Topology::new();

    topology.add_switch("nst1-s1").unwrap();
    topology
        .add_router("nst1-r1", RouterKind::Plain, None)
        .unwrap();
    topology
        .add_router("nst1-r2", RouterKind::Plain, None)
        .unwrap();
    topology
        .add_interface("nst1-r1", "eth0", None, Some("nst1-s1"))
        .unwrap();
    topology
        .add_interface("nst1-r2", "eth0", None, Some("nst1-s1"))
        .unwrap();
    topology
        .add_address("nst1-r1", "eth0", "10.101.0.1", 24)
        .unwrap();
    topology
        .add_address("nst1-r2", "eth0", "10.101.0.2", 24)
        .unwrap();

    topology.run().await.unwrap();

    assert!(netns_exists("nst1-r1"));
    assert!(netns_exists("nst1-r2"));
    assert!(link_exists("nst1-s1"));

    let ping = in_netns("nst1-r1", &["ping", "-c", "1", "-W", "2", "10.101.0.2"]);
    assert!(
        ping.status.success(),
        "ping failed: {}",
        String::from_utf8_lossy(&ping.stdout)
    );

    topology.destroy().await.unwrap();
    assert!(!netns_exists("nst1-r1"));
    assert!(!netns_exists("nst1-r2"));
    assert!(!link_exists("nst1-s1"));
    assert!(!link_exists("nst1-r1-eth0"));
    assert!(!PathBuf::from("/run/nsnetsim/nst1-r1").exists());
}

/// A router with a fixed MAC and a zero-interface router both come up and
/// tear down cleanly.
#[tokio::test(flavor = "multi_thread")]
async fn macs_are_applied_and_empty_routers_work() {
    init_logging();
    let mut topology = Topology::new();

    topology
        .add_router("nst2-r1", RouterKind::Plain, None)
        .unwrap();
    topology
        .add_router("nst2-r2", RouterKind::Plain, None)
        .unwrap();
    topology
        .add_interface("nst2-r1", "eth0", Some("02:aa:00:00:00:01"), None)
        .unwrap();

    topology.run().await.unwrap();

    let shown = in_netns("nst2-r1", &["ip", "link", "show", "eth0"]);
    let text = String::from_utf8_lossy(&shown.stdout).to_lowercase();
    assert!(text.contains("02:aa:00:00:00:01"), "link output: {text}");

    topology.destroy().await.unwrap();
    assert!(!netns_exists("nst2-r1"));
    assert!(!netns_exists("nst2-r2"));
}

/// A mid-run kernel failure (here: a route whose next-hop is unreachable)
/// unwinds everything that was already up.
#[tokio::test(flavor = "multi_thread")]
async fn mid_run_failure_leaves_no_residue() {
    init_logging();
    let mut topology = Topology::new();

    topology.add_switch("nst3-s1").unwrap();
    topology
        .add_router("nst3-r1", RouterKind::Plain, None)
        .unwrap();
    topology
        .add_router("nst3-r2", RouterKind::Plain, None)
        .unwrap();
    topology
        .add_interface("nst3-r1", "eth0", None, Some("nst3-s1"))
        .unwrap();
    topology
        .add_address("nst3-r1", "eth0", "10.103.0.1", 24)
        .unwrap();
    // r2 has no interface towards this gateway, so the kernel refuses it
    // after r1 is already fully up.
    topology
        .add_route("nst3-r2", "192.0.2.0/24", "10.103.0.254")
        .unwrap();

    let err = topology.run().await.unwrap_err();
    assert!(
        matches!(err, Error::ExternalFailure { .. }),
        "expected ExternalFailure, got {err}"
    );

    assert!(!netns_exists("nst3-r1"));
    assert!(!netns_exists("nst3-r2"));
    assert!(!link_exists("nst3-s1"));
    assert!(!link_exists("nst3-r1-eth0"));
}

/// A pre-existing bridge with one of our minted names fails the run before
/// anything is mutated.
#[tokio::test(flavor = "multi_thread")]
async fn preexisting_bridge_collides_before_any_mutation() {
    init_logging();

    let made = Command::new("ip")
        .args(["link", "add", "nst4-s1", "type", "bridge"])
        .output()
        .unwrap();
    assert!(made.status.success(), "could not create collision bridge");

    let mut topology = Topology::new();
    topology.add_switch("nst4-s1").unwrap();
    topology
        .add_router("nst4-r1", RouterKind::Plain, None)
        .unwrap();

    let err = topology.run().await.unwrap_err();
    assert!(
        matches!(err, Error::NameCollision { ref object } if object.contains("nst4-s1")),
        "expected NameCollision naming the bridge, got {err}"
    );
    // Nothing of ours was created.
    assert!(!netns_exists("nst4-r1"));

    let _ = Command::new("ip").args(["link", "del", "nst4-s1"]).output();
}

/// BIRD comes up inside the namespace, answers over its control socket, and
/// is gone after destroy.
#[tokio::test(flavor = "multi_thread")]
async fn bird_router_answers_control_queries() {
    init_logging();
    if !has_binary("bird") {
        eprintln!("skipping: bird not installed");
        return;
    }

    let config = std::env::temp_dir().join("nsnetsim-nst5-bird.conf");
    std::fs::write(
        &config,
        "log stderr all;\nrouter id 10.105.0.1;\nprotocol device {}\n",
    )
    .unwrap();

    let mut topology = Topology::new();
    topology
        .add_router("nst5-r1", RouterKind::Bird, Some(&config))
        .unwrap();
    topology
        .add_interface("nst5-r1", "eth0", None, None)
        .unwrap();
    topology
        .add_address("nst5-r1", "eth0", "10.105.0.1", 24)
        .unwrap();

    topology.run().await.unwrap();

    let response = topology.query("nst5-r1", b"show status").await.unwrap();
    let text = String::from_utf8_lossy(&response);
    assert!(text.contains("BIRD"), "unexpected response: {text}");

    // Raw responses are proxied for any query the daemon understands.
    let response = topology.query("nst5-r1", b"show protocols").await.unwrap();
    assert!(!response.is_empty());

    topology.destroy().await.unwrap();
    assert!(!netns_exists("nst5-r1"));
    assert!(!PathBuf::from("/run/nsnetsim/nst5-r1").exists());

    let _ = std::fs::remove_file(&config);
}

/// Querying a plain router is unsupported; querying an unknown node is not
/// found. Neither disturbs the running topology.
#[tokio::test(flavor = "multi_thread")]
async fn query_errors_leave_the_topology_running() {
    init_logging();
    let mut topology = Topology::new();
    topology
        .add_router("nst6-r1", RouterKind::Plain, None)
        .unwrap();

    topology.run().await.unwrap();

    assert!(matches!(
        topology.query("nst6-r1", b"show status").await,
        Err(Error::Unsupported { .. })
    ));
    assert!(matches!(
        topology.query("nst6-missing", b"show status").await,
        Err(Error::NotFound { .. })
    ));

    topology.destroy().await.unwrap();
    assert!(!netns_exists("nst6-r1"));
}
