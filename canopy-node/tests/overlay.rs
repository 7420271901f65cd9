//! Loopback overlays built from real nodes in one process.

use std::io::{self, Write};
use std::net::{Ipv4Addr, SocketAddrV4, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use canopy_core::{Level, Logger, ModuleState};
use canopy_node::socket;
use canopy_node::{BootstrapError, Node, NodeConfig, NodeError, NodeStatus};

const START_ONLY: &str = r#"(module (func (export "_start")))"#;

type Lines = Arc<Mutex<Vec<(Level, String)>>>;

fn capture() -> (Logger, Lines) {
    let lines: Lines = Arc::default();
    let sink = lines.clone();
    let log = Logger::new(move |level: Level, message: &str| {
        sink.lock().unwrap().push((level, message.to_owned()));
    });
    (log, lines)
}

fn logged(lines: &Lines, needle: &str) -> bool {
    lines.lock().unwrap().iter().any(|(_, m)| m.contains(needle))
}

fn config(branching_limit: usize) -> NodeConfig {
    NodeConfig {
        bind_address: Ipv4Addr::LOCALHOST,
        listen_port: 0,
        branching_limit,
        handshake_timeout_ms: 5_000,
        disconnect_timeout_ms: 1_000,
        ..NodeConfig::default()
    }
}

fn start_root(branching_limit: usize, log: Logger) -> (Node, SocketAddrV4) {
    let root = Node::root(config(branching_limit), log);
    let endpoint = root.initialize().unwrap();
    root.begin_execution().unwrap();
    (root, endpoint)
}

fn start_joiner(seed: SocketAddrV4, log: Logger) -> (Node, SocketAddrV4) {
    let node = Node::joiner(seed, config(2), log);
    let endpoint = node.initialize().unwrap();
    node.begin_execution().unwrap();
    (node, endpoint)
}

fn wait_for(node: &Node, what: &str, pred: impl Fn(&NodeStatus) -> bool) -> NodeStatus {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let status = node.status().unwrap();
        if pred(&status) {
            return status;
        }
        assert!(Instant::now() < deadline, "timed out waiting for {what}: {status:?}");
        thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn joiner_attaches_to_root() {
    let (root, root_addr) = start_root(2, Logger::tracing());
    let (joiner, joiner_addr) = start_joiner(root_addr, Logger::tracing());

    let status = joiner.status().unwrap();
    assert_eq!(status.peers.len(), 1);
    let parent = status.parent().expect("parent link");
    assert_eq!(parent.endpoint, root_addr);

    let status = wait_for(&root, "child", |s| s.peers.len() == 1);
    assert!(status.parent().is_none());
    assert_eq!(status.peers[0].endpoint, joiner_addr);
    assert!(!status.peers[0].is_parent);

    drop(joiner);
    wait_for(&root, "child to leave", |s| s.peers.is_empty());
}

#[test]
fn full_root_redirects_to_a_child() {
    let (root, root_addr) = start_root(2, Logger::tracing());
    let (first, first_addr) = start_joiner(root_addr, Logger::tracing());
    let (second, second_addr) = start_joiner(root_addr, Logger::tracing());
    wait_for(&root, "two children", |s| s.peers.len() == 2);

    let (log, lines) = capture();
    let (third, _) = start_joiner(root_addr, log);

    let parent = third.status().unwrap().parent().unwrap().endpoint;
    assert!(parent == first_addr || parent == second_addr, "{parent}");
    assert!(logged(&lines, &format!("Redirect to {parent}")));

    let adopter = if parent == first_addr { &first } else { &second };
    wait_for(adopter, "grandchild", |s| s.children().count() == 1);
    assert_eq!(root.status().unwrap().peers.len(), 2);

    drop(third);
    drop(second);
    drop(first);
}

#[test]
fn code_floods_two_hops_and_runs() {
    let (root_log, root_lines) = capture();
    let (root, root_addr) = start_root(1, root_log);
    let (child, child_addr) = start_joiner(root_addr, Logger::tracing());
    wait_for(&root, "child", |s| s.peers.len() == 1);
    let (grandchild, _) = start_joiner(root_addr, Logger::tracing());
    assert_eq!(
        grandchild.status().unwrap().parent().unwrap().endpoint,
        child_addr
    );
    wait_for(&child, "grandchild", |s| s.children().count() == 1);

    let image = wat::parse_str(START_ONLY).unwrap();
    let id = canopy_core::sandbox::module_id(&image);
    root.upload_code(image).unwrap();

    for node in [&child, &grandchild] {
        let status = wait_for(node, "invocation", |s| s.invocations == 1);
        assert_eq!(status.module, ModuleState::Loaded);
        assert_eq!(status.module_id.as_deref(), Some(id.as_str()));
    }
    let deadline = Instant::now() + Duration::from_secs(5);
    while !logged(&root_lines, &format!("loaded {id}")) {
        assert!(Instant::now() < deadline, "root never saw Okay");
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(root.status().unwrap().module, ModuleState::Empty);

    drop(grandchild);
    drop(child);
}

#[test]
fn invoke_without_module_reports_no_image() {
    let (root_log, root_lines) = capture();
    let (root, root_addr) = start_root(2, root_log);
    let (child_log, child_lines) = capture();
    let (child, _) = start_joiner(root_addr, child_log);
    wait_for(&root, "child", |s| s.peers.len() == 1);

    root.invoke().unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while !logged(&root_lines, "reported NoImage") {
        assert!(Instant::now() < deadline, "root never saw NoImage");
        thread::sleep(Duration::from_millis(10));
    }
    assert!(logged(&child_lines, "no image loaded"));
    let status = child.status().unwrap();
    assert_eq!(status.invocations, 0);
    assert_eq!(status.module, ModuleState::Empty);
}

#[test]
fn parent_shutdown_detaches_children() {
    let (root, root_addr) = start_root(2, Logger::tracing());
    let (child_log, child_lines) = capture();
    let (child, _) = start_joiner(root_addr, child_log);
    wait_for(&root, "child", |s| s.peers.len() == 1);

    root.shutdown();
    wait_for(&child, "parent to leave", |s| s.peers.is_empty());
    assert!(logged(&child_lines, "is leaving"));
}

#[test]
fn middle_node_shutdown_points_grandchild_at_root() {
    let (root, root_addr) = start_root(1, Logger::tracing());
    let (child, child_addr) = start_joiner(root_addr, Logger::tracing());
    wait_for(&root, "child", |s| s.peers.len() == 1);
    let (grand_log, grand_lines) = capture();
    let (grandchild, _) = start_joiner(root_addr, grand_log);
    assert_eq!(
        grandchild.status().unwrap().parent().unwrap().endpoint,
        child_addr
    );
    wait_for(&child, "grandchild", |s| s.children().count() == 1);

    child.shutdown();

    wait_for(&grandchild, "parent to leave", |s| s.peers.is_empty());
    assert!(logged(
        &grand_lines,
        &format!("requests redirection to {root_addr}")
    ));
    assert!(logged(&grand_lines, &format!("Re-parenting to {root_addr}")));
    wait_for(&root, "child to leave", |s| s.peers.is_empty());
}

#[test]
fn silent_candidate_does_not_stall_the_loop() {
    let (root, root_addr) = start_root(2, Logger::tracing());
    let silent = TcpStream::connect(root_addr).unwrap();
    wait_for(&root, "pending candidate", |s| s.pending == 1);

    let asked = Instant::now();
    let status = root.status().unwrap();
    assert!(asked.elapsed() < Duration::from_millis(500), "{:?}", asked.elapsed());
    assert_eq!(status.pending, 1);
    assert!(status.peers.is_empty());

    let (joiner, joiner_addr) = start_joiner(root_addr, Logger::tracing());
    let status = wait_for(&root, "child", |s| s.peers.len() == 1);
    assert_eq!(status.peers[0].endpoint, joiner_addr);
    assert_eq!(status.pending, 1);

    drop(silent);
    wait_for(&root, "silent candidate to go", |s| s.pending == 0);
    drop(joiner);
}

#[test]
fn version_mismatch_fails_initialize() {
    let listener = socket::listen(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)).unwrap();
    let addr = socket::v4(listener.local_addr().unwrap()).unwrap();
    let server = thread::spawn(move || {
        let (mut client, _) = listener.accept().unwrap();
        client.write_all(&[0, 0, 0, 1, 1]).unwrap();
        let _ = io::copy(&mut client, &mut io::sink());
    });

    let (log, lines) = capture();
    let node = Node::joiner(addr, config(2), log);
    let err = node.initialize().unwrap_err();
    assert!(matches!(
        err,
        NodeError::Bootstrap(BootstrapError::VersionMismatch { .. })
    ));
    assert!(lines
        .lock()
        .unwrap()
        .iter()
        .any(|(level, m)| *level == Level::Fail && m.contains("Version mismatched")));
    assert!(matches!(node.begin_execution(), Err(NodeError::NotInitialized)));
    server.join().unwrap();
}

#[test]
fn cancelled_joiner_never_dials() {
    let node = Node::joiner(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 9), config(2), Logger::tracing());
    node.cancel();
    assert!(matches!(
        node.initialize(),
        Err(NodeError::Bootstrap(BootstrapError::Cancelled))
    ));
}
