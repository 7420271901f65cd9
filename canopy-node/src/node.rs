//! Overlay topology manager: owns the listener and the peer set, runs the poll loop on a
//! background thread, and decides between attaching and redirecting each joiner. Joiners
//! are admitted by `bootstrap::Admission` steps interleaved with peer updates, so a slow
//! or silent candidate never stalls the loop.
//!
//! The peer set is only touched by whoever holds the `Overlay`: the caller's thread before
//! `begin_execution`, the poll thread while running. Front-end requests made while the
//! loop runs travel over a command channel.

use std::io;
use std::net::{SocketAddrV4, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use canopy_core::wire::MAX_PAYLOAD_LEN;
use canopy_core::{Action, Connection, Logger, ModuleState, Op, Sandbox};
use rand::seq::SliceRandom;
use rand::Rng;
use tokio::sync::{mpsc, oneshot};

use crate::bootstrap::{self, Admission, Admitted};
use crate::config::NodeConfig;
use crate::error::NodeError;
use crate::socket;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// No parent; listens on the configured port.
    Root,
    /// Discovers its parent starting from `seed`.
    Joiner { seed: SocketAddrV4 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub endpoint: SocketAddrV4,
    pub is_parent: bool,
    /// Bytes waiting in the outbound queue.
    pub queued: usize,
}

#[derive(Debug, Clone)]
pub struct NodeStatus {
    pub endpoint: SocketAddrV4,
    /// In attach order.
    pub peers: Vec<PeerInfo>,
    pub module: ModuleState,
    pub module_id: Option<String>,
    pub invocations: u64,
    /// Invocation threads that have not returned yet.
    pub running: usize,
    /// Candidates still in the listener-side handshake.
    pub pending: usize,
}

impl NodeStatus {
    pub fn parent(&self) -> Option<&PeerInfo> {
        self.peers.iter().find(|p| p.is_parent)
    }

    pub fn children(&self) -> impl Iterator<Item = &PeerInfo> {
        self.peers.iter().filter(|p| !p.is_parent)
    }
}

enum Command {
    Upload(Arc<[u8]>),
    Invoke,
    Status(oneshot::Sender<NodeStatus>),
}

struct Running {
    endpoint: SocketAddrV4,
    stop: Arc<AtomicBool>,
    commands: mpsc::UnboundedSender<Command>,
    handle: JoinHandle<Overlay>,
}

enum Stage {
    Created,
    Ready(Overlay),
    Running(Running),
    Disposed,
}

/// One overlay participant. All methods take `&self`; a single mutex guards the
/// start/stop transitions.
pub struct Node {
    role: Role,
    config: NodeConfig,
    log: Logger,
    cancel: AtomicBool,
    stage: Mutex<Stage>,
}

impl Node {
    pub fn new(role: Role, config: NodeConfig, log: Logger) -> Self {
        Self {
            role,
            config,
            log,
            cancel: AtomicBool::new(false),
            stage: Mutex::new(Stage::Created),
        }
    }

    pub fn root(config: NodeConfig, log: Logger) -> Self {
        Self::new(Role::Root, config, log)
    }

    pub fn joiner(seed: SocketAddrV4, config: NodeConfig, log: Logger) -> Self {
        Self::new(Role::Joiner { seed }, config, log)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    fn stage(&self) -> MutexGuard<'_, Stage> {
        self.stage.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Open the listener (root) or run the bootstrap handshake (joiner). Blocks.
    /// Returns the endpoint the node listens on. A failed attempt may be retried.
    pub fn initialize(&self) -> Result<SocketAddrV4, NodeError> {
        let mut stage = self.stage();
        if !matches!(*stage, Stage::Created) {
            return Err(NodeError::AlreadyInitialized);
        }
        let overlay = match self.role {
            Role::Root => {
                let bind = SocketAddrV4::new(self.config.bind_address, self.config.listen_port);
                let listener = socket::listen(bind)?;
                let local = socket::v4(listener.local_addr()?)?;
                self.log.info(format!("Listening on {local}"));
                Overlay::new(listener, local, Vec::new(), &self.config, &self.log)?
            }
            Role::Joiner { seed } => {
                let link = bootstrap::join(seed, &self.config, &self.log, &self.cancel)?;
                let parent = Connection::new(link.stream, link.parent, true, self.log.clone())
                    .with_timeout(self.config.frame_timeout());
                Overlay::new(link.listener, link.local, vec![parent], &self.config, &self.log)?
            }
        };
        let endpoint = overlay.local;
        *stage = Stage::Ready(overlay);
        Ok(endpoint)
    }

    /// Abort a redirect chase in progress. Takes effect before the next hop.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Release);
    }

    /// Start the poll loop thread.
    pub fn begin_execution(&self) -> Result<(), NodeError> {
        let mut stage = self.stage();
        let overlay = match std::mem::replace(&mut *stage, Stage::Disposed) {
            Stage::Ready(overlay) => overlay,
            Stage::Created => {
                *stage = Stage::Created;
                return Err(NodeError::NotInitialized);
            }
            other @ Stage::Running(_) => {
                *stage = other;
                return Err(NodeError::AlreadyRunning);
            }
            Stage::Disposed => return Err(NodeError::NotInitialized),
        };

        let endpoint = overlay.local;
        let stop = Arc::new(AtomicBool::new(false));
        let (commands, inbox) = mpsc::unbounded_channel();
        let flag = stop.clone();
        let handle = thread::Builder::new()
            .name("canopy-poll".into())
            .spawn(move || overlay.run(&flag, inbox))?;
        self.log.info("Poll loop started");
        *stage = Stage::Running(Running {
            endpoint,
            stop,
            commands,
            handle,
        });
        Ok(())
    }

    /// Stop the poll loop and wait for it. No socket activity happens after this returns.
    pub fn end_execution(&self) -> Result<(), NodeError> {
        let mut stage = self.stage();
        let running = match std::mem::replace(&mut *stage, Stage::Disposed) {
            Stage::Running(running) => running,
            other => {
                *stage = other;
                return Err(NodeError::NotRunning);
            }
        };
        running.stop.store(true, Ordering::Release);
        let overlay = running.handle.join().map_err(|_| NodeError::LoopGone)?;
        self.log.info("Poll loop stopped");
        *stage = Stage::Ready(overlay);
        Ok(())
    }

    /// Queue `Code` then `Invoke` to every child; each child loads, runs and floods onward.
    pub fn upload_code(&self, image: Vec<u8>) -> Result<(), NodeError> {
        if image.len() > MAX_PAYLOAD_LEN as usize {
            return Err(NodeError::ModuleTooLarge {
                len: image.len(),
                max: MAX_PAYLOAD_LEN,
            });
        }
        self.send(Command::Upload(image.into()))
    }

    /// Ask every child to run the module it already holds.
    pub fn invoke(&self) -> Result<(), NodeError> {
        self.send(Command::Invoke)
    }

    fn send(&self, command: Command) -> Result<(), NodeError> {
        match &*self.stage() {
            Stage::Running(running) => running
                .commands
                .send(command)
                .map_err(|_| NodeError::LoopGone),
            _ => Err(NodeError::NotRunning),
        }
    }

    /// Snapshot of peers and sandbox. While running this waits for the poll thread, so it
    /// must not be called from inside an async runtime.
    pub fn status(&self) -> Result<NodeStatus, NodeError> {
        let reply = {
            let stage = self.stage();
            match &*stage {
                Stage::Ready(overlay) => return Ok(overlay.status()),
                Stage::Running(running) => {
                    let (tx, rx) = oneshot::channel();
                    running
                        .commands
                        .send(Command::Status(tx))
                        .map_err(|_| NodeError::LoopGone)?;
                    rx
                }
                Stage::Created | Stage::Disposed => return Err(NodeError::NotInitialized),
            }
        };
        reply.blocking_recv().map_err(|_| NodeError::LoopGone)
    }

    pub fn listen_endpoint(&self) -> Option<SocketAddrV4> {
        match &*self.stage() {
            Stage::Ready(overlay) => Some(overlay.local),
            Stage::Running(running) => Some(running.endpoint),
            Stage::Created | Stage::Disposed => None,
        }
    }

    /// Stop the loop if it runs, disconnect every peer and close the listener.
    /// Idempotent; also runs on drop.
    pub fn shutdown(&self) {
        match self.end_execution() {
            Ok(()) | Err(NodeError::NotRunning) => {}
            Err(e) => self.log.fail(format!("Poll loop did not stop cleanly: {e}")),
        }
        let stage = std::mem::replace(&mut *self.stage(), Stage::Disposed);
        if let Stage::Ready(overlay) = stage {
            overlay.dispose();
        }
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Candidates in the listener-side handshake at once; later ones wait in the backlog.
const MAX_ADMISSIONS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placement {
    Accept,
    Redirect(SocketAddrV4),
    /// Every slot is held by a pending accept and there is no child to point at yet.
    Defer,
}

/// Where the next joiner goes. Accepts still in their handshake hold a slot.
fn place<R: Rng + ?Sized>(
    children: &[SocketAddrV4],
    accepting: usize,
    limit: usize,
    rng: &mut R,
) -> Placement {
    if children.len() + accepting < limit {
        return Placement::Accept;
    }
    match children.choose(rng) {
        Some(&target) => Placement::Redirect(target),
        None => Placement::Defer,
    }
}

struct Overlay {
    listener: TcpListener,
    local: SocketAddrV4,
    peers: Vec<Connection<TcpStream>>,
    admissions: Vec<Admission>,
    sandbox: Sandbox,
    config: NodeConfig,
    log: Logger,
}

impl Overlay {
    fn new(
        listener: TcpListener,
        local: SocketAddrV4,
        peers: Vec<Connection<TcpStream>>,
        config: &NodeConfig,
        log: &Logger,
    ) -> Result<Self, NodeError> {
        listener.set_nonblocking(true)?;
        Ok(Self {
            listener,
            local,
            peers,
            admissions: Vec::new(),
            sandbox: Sandbox::new(),
            config: config.clone(),
            log: log.clone(),
        })
    }

    fn run(mut self, stop: &AtomicBool, mut commands: mpsc::UnboundedReceiver<Command>) -> Self {
        while !stop.load(Ordering::Acquire) {
            self.drain_commands(&mut commands);
            self.service_listener();
            self.service_admissions(Instant::now());
            self.service_peers();
            thread::sleep(self.config.idle_backoff());
        }
        self
    }

    fn drain_commands(&mut self, commands: &mut mpsc::UnboundedReceiver<Command>) {
        while let Ok(command) = commands.try_recv() {
            match command {
                Command::Upload(image) => {
                    let children = self.broadcast(Op::Code, image.clone());
                    self.broadcast(Op::Invoke, Arc::from(&[][..]));
                    self.log.info(format!(
                        "Code module ({:.3}KB) queued to {children} peer(s)",
                        image.len() as f64 / 1024.0
                    ));
                }
                Command::Invoke => {
                    let children = self.broadcast(Op::Invoke, Arc::from(&[][..]));
                    self.log.info(format!("Invocation queued to {children} peer(s)"));
                }
                Command::Status(reply) => {
                    let _ = reply.send(self.status());
                }
            }
        }
    }

    /// Queue a frame to every non-parent peer. Returns how many got it.
    fn broadcast(&mut self, op: Op, payload: Arc<[u8]>) -> usize {
        let mut n = 0;
        for peer in self.peers.iter_mut().filter(|p| !p.is_parent()) {
            peer.queue(op, payload.clone());
            n += 1;
        }
        n
    }

    fn service_listener(&mut self) {
        while self.admissions.len() < MAX_ADMISSIONS {
            let placement = self.placement();
            if placement == Placement::Defer {
                return;
            }
            match self.listener.accept() {
                Ok((stream, addr)) => self.admit(stream, addr, placement),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.log.warn(format!("Accept failed: {e}"));
                    return;
                }
            }
        }
    }

    fn placement(&self) -> Placement {
        let children: Vec<SocketAddrV4> = self
            .peers
            .iter()
            .filter(|p| !p.is_parent())
            .map(|p| p.remote())
            .collect();
        let accepting = self.admissions.iter().filter(|a| !a.is_redirect()).count();
        place(
            &children,
            accepting,
            self.config.branching_limit,
            &mut rand::thread_rng(),
        )
    }

    fn admit(&mut self, stream: TcpStream, addr: std::net::SocketAddr, placement: Placement) {
        self.log.info(format!("Incoming connection from {addr}"));
        let redirect = match placement {
            Placement::Redirect(target) => Some(target),
            Placement::Accept | Placement::Defer => None,
        };
        match Admission::new(stream, redirect, &self.config, Instant::now()) {
            Ok(admission) => self.admissions.push(admission),
            Err(e) => self.log.fail(format!("Candidate {addr} abandoned: {e}")),
        }
    }

    /// Advance every candidate handshake one non-blocking step.
    fn service_admissions(&mut self, now: Instant) {
        let mut i = 0;
        while i < self.admissions.len() {
            let remote = self.admissions[i].remote();
            match self.admissions[i].poll(now) {
                Ok(Admitted::Pending) => {
                    i += 1;
                    continue;
                }
                Ok(Admitted::Redirected(target)) => {
                    self.log.info(format!("{remote} redirected to {target}"));
                }
                Ok(Admitted::Attached(stream)) => {
                    self.log.info(format!("{remote} attached as child"));
                    self.peers.push(
                        Connection::new(stream, remote, false, self.log.clone())
                            .with_timeout(self.config.frame_timeout()),
                    );
                }
                Err(e) => self.log.fail(format!("Candidate {remote} abandoned: {e}")),
            }
            self.admissions.swap_remove(i);
        }
    }

    fn service_peers(&mut self) {
        let now = Instant::now();
        let mut i = 0;
        while i < self.peers.len() {
            let actions = match self.peers[i].update(now, &mut self.sandbox) {
                Ok(actions) => actions,
                Err(e) => {
                    let peer = self.peers.remove(i);
                    self.log
                        .fail(format!("Connection to {} dropped: {e}", peer.remote()));
                    continue;
                }
            };

            let mut closed = false;
            for action in actions {
                match action {
                    Action::Flood { op, payload } => self.flood(i, op, payload),
                    Action::Reparent(target) => self.log.warn(format!(
                        "Re-parenting to {target} is not supported; staying detached"
                    )),
                    Action::Close => closed = true,
                }
            }
            if closed {
                let peer = self.peers.remove(i);
                self.log.info(format!("{} disconnected", peer.remote()));
                continue;
            }
            i += 1;
        }
    }

    /// Queue to every non-parent peer other than `from`.
    fn flood(&mut self, from: usize, op: Op, payload: Arc<[u8]>) {
        for (j, peer) in self.peers.iter_mut().enumerate() {
            if j != from && !peer.is_parent() {
                peer.queue(op, payload.clone());
            }
        }
    }

    fn status(&self) -> NodeStatus {
        NodeStatus {
            endpoint: self.local,
            peers: self
                .peers
                .iter()
                .map(|p| PeerInfo {
                    endpoint: p.remote(),
                    is_parent: p.is_parent(),
                    queued: p.queued_bytes(),
                })
                .collect(),
            module: self.sandbox.state(),
            module_id: self.sandbox.module_id().map(str::to_owned),
            invocations: self.sandbox.invocations(),
            running: self.sandbox.running(),
            pending: self.admissions.len(),
        }
    }

    /// Children are pointed at our parent when there is one; the listener closes last.
    fn dispose(mut self) {
        self.admissions.clear();
        let parent = self.peers.iter().find(|p| p.is_parent()).map(|p| p.remote());
        let wait = self.config.disconnect_timeout();
        for mut peer in self.peers.drain(..) {
            let redirect = if peer.is_parent() { None } else { parent };
            if let Err(e) = peer.disconnect(redirect, wait) {
                self.log
                    .warn(format!("Disconnect from {} incomplete: {e}", peer.remote()));
            }
        }
        drop(self.listener);
        self.log.info("Node disposed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::net::Ipv4Addr;

    fn endpoint(port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), port)
    }

    fn loopback_config() -> NodeConfig {
        NodeConfig {
            bind_address: Ipv4Addr::LOCALHOST,
            listen_port: 0,
            ..NodeConfig::default()
        }
    }

    #[test]
    fn accepts_below_limit() {
        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(place(&[], 0, 2, &mut rng), Placement::Accept);
        assert_eq!(place(&[endpoint(1)], 0, 2, &mut rng), Placement::Accept);
        assert_eq!(place(&[], 1, 2, &mut rng), Placement::Accept);
    }

    #[test]
    fn pending_accepts_hold_slots() {
        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(
            place(&[endpoint(1)], 1, 2, &mut rng),
            Placement::Redirect(endpoint(1))
        );
        assert_eq!(place(&[], 2, 2, &mut rng), Placement::Defer);
    }

    #[test]
    fn redirects_only_to_attached_children() {
        let children = [endpoint(1), endpoint(2)];
        let mut rng = StdRng::seed_from_u64(7);
        let mut seen = Vec::new();
        for _ in 0..64 {
            let target = match place(&children, 0, 2, &mut rng) {
                Placement::Redirect(target) => target,
                other => panic!("expected redirect, got {other:?}"),
            };
            assert!(children.contains(&target));
            if !seen.contains(&target) {
                seen.push(target);
            }
        }
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn lifecycle_guards() {
        let node = Node::root(loopback_config(), Logger::tracing());
        assert!(matches!(node.begin_execution(), Err(NodeError::NotInitialized)));
        assert!(matches!(node.upload_code(vec![0]), Err(NodeError::NotRunning)));
        assert!(node.listen_endpoint().is_none());

        let endpoint = node.initialize().unwrap();
        assert_ne!(endpoint.port(), 0);
        assert!(matches!(node.initialize(), Err(NodeError::AlreadyInitialized)));
        assert!(matches!(node.end_execution(), Err(NodeError::NotRunning)));

        node.begin_execution().unwrap();
        assert!(matches!(node.begin_execution(), Err(NodeError::AlreadyRunning)));
        assert_eq!(node.listen_endpoint(), Some(endpoint));

        node.end_execution().unwrap();
        node.begin_execution().unwrap();
        node.shutdown();
        assert!(node.listen_endpoint().is_none());
        assert!(matches!(node.invoke(), Err(NodeError::NotRunning)));
    }

    #[test]
    fn status_answered_by_poll_loop() {
        let node = Node::root(loopback_config(), Logger::tracing());
        let endpoint = node.initialize().unwrap();

        let idle = node.status().unwrap();
        assert_eq!(idle.endpoint, endpoint);
        assert!(idle.peers.is_empty());
        assert_eq!(idle.module, ModuleState::Empty);

        node.begin_execution().unwrap();
        let running = node.status().unwrap();
        assert!(running.parent().is_none());
        assert_eq!(running.children().count(), 0);
        assert_eq!(running.invocations, 0);
        assert_eq!(running.running, 0);
        assert_eq!(running.pending, 0);
    }

    #[test]
    fn oversized_upload_rejected_before_queueing() {
        let node = Node::root(loopback_config(), Logger::tracing());
        node.initialize().unwrap();
        node.begin_execution().unwrap();
        let image = vec![0u8; MAX_PAYLOAD_LEN as usize + 1];
        assert!(matches!(
            node.upload_code(image),
            Err(NodeError::ModuleTooLarge { .. })
        ));
        node.upload_code(vec![0u8; 8]).unwrap();
    }
}
