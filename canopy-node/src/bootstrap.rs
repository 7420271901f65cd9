//! Bootstrap handshake: version check, redirect chase, and the NAT hairpin that flips the
//! parent link's direction while keeping the joiner's outbound mapping.
//!
//! The listener side always lets the joiner close first, and the joiner closes with RST, so
//! neither end holds the 4-tuple in TIME_WAIT when the parent dials back. It never blocks:
//! each candidate is an `Admission` the poll loop advances alongside its peers.

use std::io::{self, Read, Write};
use std::net::{SocketAddrV4, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use canopy_core::protocol::{
    Version, PROTOCOL_VERSION, SESSION_SECRET_LEN, STATUS_ACCEPT, STATUS_REDIRECT,
};
use canopy_core::wire::{check_redirect_address_len, decode_endpoint, encode_redirect, ENDPOINT_LEN};
use canopy_core::Logger;
use socket2::Socket;

use crate::config::NodeConfig;
use crate::error::BootstrapError;
use crate::socket;

const ACCEPT_POLL: Duration = Duration::from_millis(5);

/// Result of a successful join: the parent connection plus the listener the node keeps.
pub struct ParentLink {
    /// Non-blocking stream the parent dialed back on.
    pub stream: TcpStream,
    pub parent: SocketAddrV4,
    /// Bound to the local port used to reach the parent; serves children afterwards.
    pub listener: TcpListener,
    pub local: SocketAddrV4,
}

/// Joiner side. Chases redirects from `seed` until some node accepts, then waits for the
/// hairpin connection and checks the session secret.
pub fn join(
    seed: SocketAddrV4,
    config: &NodeConfig,
    log: &Logger,
    cancel: &AtomicBool,
) -> Result<ParentLink, BootstrapError> {
    let timeout = config.handshake_timeout();
    let mut target = seed;
    loop {
        if cancel.load(Ordering::Acquire) {
            return Err(BootstrapError::Cancelled);
        }

        log.info(format!("Connect to {target}..."));
        let mut stream = socket::connect(target, timeout)?;
        socket::set_handshake_mode(&stream, timeout)?;
        let local = socket::v4(stream.local_addr()?)?;
        let remote = socket::v4(stream.peer_addr()?)?;
        log.info("Connection established");

        let mut version = [0u8; 4];
        stream.read_exact(&mut version)?;
        let theirs = Version::from_bytes(version);
        if theirs != PROTOCOL_VERSION {
            log.fail(format!("Version mismatched with {remote}"));
            socket::abort(stream);
            return Err(BootstrapError::VersionMismatch {
                ours: PROTOCOL_VERSION,
                theirs,
            });
        }

        let mut status = [0u8; 1];
        stream.read_exact(&mut status)?;
        match status[0] {
            STATUS_REDIRECT => {
                log.info("Redirection requested");
                let mut len = [0u8; 1];
                stream.read_exact(&mut len)?;
                check_redirect_address_len(len[0])?;
                let mut endpoint = [0u8; ENDPOINT_LEN];
                stream.read_exact(&mut endpoint)?;
                target = decode_endpoint(&endpoint)?;
                log.info(format!("Redirect to {target}"));
                socket::abort(stream);
            }
            STATUS_ACCEPT => {
                let mut secret = [0u8; SESSION_SECRET_LEN];
                stream.read_exact(&mut secret)?;
                socket::abort(stream);
                return accept_parent(local, remote, secret, timeout, log);
            }
            other => {
                socket::abort(stream);
                return Err(BootstrapError::UnexpectedStatus(other));
            }
        }
    }
}

fn accept_parent(
    local: SocketAddrV4,
    expected: SocketAddrV4,
    secret: [u8; SESSION_SECRET_LEN],
    timeout: Duration,
    log: &Logger,
) -> Result<ParentLink, BootstrapError> {
    let listener = socket::listen(local)?;
    listener.set_nonblocking(true)?;
    log.info(format!("Listen on {local}"));

    let deadline = Instant::now() + timeout;
    let (mut stream, addr) = loop {
        match listener.accept() {
            Ok(pair) => break pair,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    return Err(BootstrapError::AcceptTimeout(timeout));
                }
                thread::sleep(ACCEPT_POLL);
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    };

    let actual = socket::v4(addr)?;
    if actual != expected {
        socket::abort(stream);
        return Err(BootstrapError::UnexpectedParent { expected, actual });
    }

    socket::set_handshake_mode(&stream, timeout)?;
    let mut challenge = [0u8; SESSION_SECRET_LEN];
    stream.read_exact(&mut challenge)?;
    if challenge != secret {
        log.fail(format!("Session secret incorrect (from {actual})"));
        socket::abort(stream);
        return Err(BootstrapError::SecretMismatch);
    }

    socket::set_poll_mode(&stream)?;
    log.info(format!("{actual} connected as parent"));
    Ok(ParentLink {
        stream,
        parent: actual,
        listener,
        local,
    })
}

/// Progress of one candidate after a `poll`.
#[derive(Debug)]
pub enum Admitted {
    Pending,
    /// The candidate was pointed at another node and closed.
    Redirected(SocketAddrV4),
    /// Hairpin link established and the challenge written. The stream is non-blocking.
    Attached(TcpStream),
}

enum Step {
    /// Writing the version and the accept or redirect response.
    Greet { stream: TcpStream, sent: usize },
    /// Waiting for the joiner to close its end.
    AwaitClose { stream: TcpStream },
    Backoff { until: Instant },
    Dial { socket: Socket },
    /// Writing the session secret over the hairpin link.
    Challenge { stream: TcpStream, sent: usize },
    Finished,
}

/// Listener side for one inbound candidate. With a redirect target the candidate is pointed
/// there; otherwise it is accepted, dialed back from the accepting port once it has closed,
/// and sent the session secret as the challenge.
///
/// Every step has `handshake_timeout` to make progress. Hairpin dials that are refused or
/// reset are retried up to `connect_attempts` times, `connect_retry_delay` apart.
pub struct Admission {
    step: Step,
    remote: SocketAddrV4,
    local: SocketAddrV4,
    redirect: Option<SocketAddrV4>,
    greeting: Vec<u8>,
    secret: [u8; SESSION_SECRET_LEN],
    attempts: u32,
    max_attempts: u32,
    retry_delay: Duration,
    timeout: Duration,
    deadline: Instant,
}

impl Admission {
    pub fn new(
        client: TcpStream,
        redirect: Option<SocketAddrV4>,
        config: &NodeConfig,
        now: Instant,
    ) -> Result<Self, BootstrapError> {
        client.set_nonblocking(true)?;
        let remote = socket::v4(client.peer_addr()?)?;
        let local = socket::v4(client.local_addr()?)?;
        let secret = uuid::Uuid::new_v4().into_bytes();

        let mut greeting = PROTOCOL_VERSION.to_bytes().to_vec();
        match redirect {
            Some(target) => greeting.extend_from_slice(&encode_redirect(target)),
            None => {
                greeting.push(STATUS_ACCEPT);
                greeting.extend_from_slice(&secret);
            }
        }

        let timeout = config.handshake_timeout();
        Ok(Self {
            step: Step::Greet {
                stream: client,
                sent: 0,
            },
            remote,
            local,
            redirect,
            greeting,
            secret,
            attempts: 0,
            max_attempts: config.connect_attempts,
            retry_delay: config.connect_retry_delay(),
            timeout,
            deadline: now + timeout,
        })
    }

    pub fn remote(&self) -> SocketAddrV4 {
        self.remote
    }

    pub fn is_redirect(&self) -> bool {
        self.redirect.is_some()
    }

    /// Advance as far as the sockets allow without blocking. Anything but `Pending` ends the
    /// admission; so does an error.
    pub fn poll(&mut self, now: Instant) -> Result<Admitted, BootstrapError> {
        loop {
            match std::mem::replace(&mut self.step, Step::Finished) {
                Step::Greet { mut stream, sent } => {
                    let sent = sent + write_some(&mut stream, &self.greeting[sent..])?;
                    if sent < self.greeting.len() {
                        self.step = Step::Greet { stream, sent };
                        return self.pending(now);
                    }
                    self.step = Step::AwaitClose { stream };
                }
                Step::AwaitClose { mut stream } => {
                    if !peer_closed(&mut stream)? {
                        self.step = Step::AwaitClose { stream };
                        return self.pending(now);
                    }
                    drop(stream);
                    if let Some(target) = self.redirect {
                        return Ok(Admitted::Redirected(target));
                    }
                    self.step = self.dial(now)?;
                }
                Step::Backoff { until } => {
                    if now < until {
                        self.step = Step::Backoff { until };
                        return Ok(Admitted::Pending);
                    }
                    self.step = self.dial(now)?;
                }
                Step::Dial { socket } => match socket::poll_connect(&socket) {
                    Ok(true) => {
                        let stream: TcpStream = socket.into();
                        self.deadline = now + self.timeout;
                        self.step = Step::Challenge { stream, sent: 0 };
                    }
                    Ok(false) => {
                        self.step = Step::Dial { socket };
                        return self.pending(now);
                    }
                    Err(e) if retryable(&e) => self.step = self.retry(now)?,
                    Err(e) => return Err(e.into()),
                },
                Step::Challenge { mut stream, sent } => {
                    let sent = sent + write_some(&mut stream, &self.secret[sent..])?;
                    if sent < SESSION_SECRET_LEN {
                        self.step = Step::Challenge { stream, sent };
                        return self.pending(now);
                    }
                    socket::set_poll_mode(&stream)?;
                    return Ok(Admitted::Attached(stream));
                }
                // Polled again after completing or failing.
                Step::Finished => return Err(io::Error::from(io::ErrorKind::NotConnected).into()),
            }
        }
    }

    fn pending(&self, now: Instant) -> Result<Admitted, BootstrapError> {
        if now >= self.deadline {
            return Err(BootstrapError::Stalled(self.timeout));
        }
        Ok(Admitted::Pending)
    }

    /// Start the next hairpin attempt from the accepting port.
    fn dial(&mut self, now: Instant) -> Result<Step, BootstrapError> {
        self.attempts += 1;
        match socket::start_connect(self.local, self.remote) {
            Ok(socket) => {
                self.deadline = now + self.timeout;
                Ok(Step::Dial { socket })
            }
            Err(e) if retryable(&e) => self.retry(now),
            Err(e) => Err(e.into()),
        }
    }

    fn retry(&self, now: Instant) -> Result<Step, BootstrapError> {
        if self.attempts >= self.max_attempts {
            return Err(BootstrapError::NatTraversal {
                remote: self.remote,
                attempts: self.attempts,
            });
        }
        Ok(Step::Backoff {
            until: now + self.retry_delay,
        })
    }
}

/// The joiner is not listening yet, or its mapping was just torn down.
fn retryable(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset
    )
}

fn write_some(stream: &mut TcpStream, bytes: &[u8]) -> io::Result<usize> {
    match stream.write(bytes) {
        Ok(0) => Err(io::ErrorKind::WriteZero.into()),
        Ok(n) => Ok(n),
        Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => {
            Ok(0)
        }
        Err(e) => Err(e),
    }
}

/// Discard whatever is readable; `true` once the peer closed or reset.
fn peer_closed(stream: &mut TcpStream) -> io::Result<bool> {
    let mut scratch = [0u8; 64];
    loop {
        match stream.read(&mut scratch) {
            Ok(0) => return Ok(true),
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted
                ) =>
            {
                return Ok(true)
            }
            Err(e) => return Err(e),
        }
    }
}
