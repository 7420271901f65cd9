//! Per-peer connection state machine: queued non-blocking sends, partial-frame
//! reassembly with a timeout, and opcode dispatch.
//!
//! The stream must be non-blocking: `WouldBlock` means "nothing right now". A read of
//! zero bytes means the peer went away.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::SocketAddrV4;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::log::Logger;
use crate::protocol::{Op, DISCONNECT_ACK, FRAME_TIMEOUT};
use crate::sandbox::Sandbox;
use crate::wire::{self, decode_endpoint, encode_endpoint, encode_header, HEADER_LEN, MAX_PAYLOAD_LEN};

const READ_CHUNK: usize = 16 * 1024;
const BLOCKING_POLL: Duration = Duration::from_millis(1);

/// Queued outbound buffer. `offset` marks what a partial write already sent.
struct Outgoing {
    bytes: Arc<[u8]>,
    offset: usize,
}

/// Header seen, payload still arriving.
#[derive(Debug, Clone, Copy)]
struct PartialFrame {
    op: Op,
    len: u32,
    since: Instant,
}

/// What the owning node must do after an `update`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Queue this frame to every other non-parent peer.
    Flood { op: Op, payload: Arc<[u8]> },
    /// The parent asked us to re-attach elsewhere.
    Reparent(SocketAddrV4),
    /// The connection ended cleanly; remove it.
    Close,
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("frame {op} ({len}B) incomplete after {timeout:?}")]
    Timeout { op: Op, len: u32, timeout: Duration },
    #[error("unexpected connection reset")]
    Reset,
    #[error("unknown opcode 0x{0:02X}")]
    UnknownOp(u8),
    #[error("message size({len}B) of {op} cannot be less than required size({required}B)")]
    Undersized { op: Op, len: u32, required: u32 },
    #[error("message size({len}B) of {op} exceeds the {max}B limit")]
    Oversized { op: Op, len: u32, max: u32 },
    #[error("no disconnect acknowledgement within {0:?}")]
    AckTimeout(Duration),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Endpoint(#[from] wire::EndpointError),
    #[error(transparent)]
    Encode(#[from] wire::FrameEncodeError),
}

pub struct Connection<S> {
    stream: S,
    remote: SocketAddrV4,
    is_parent: bool,
    outbound: VecDeque<Outgoing>,
    inbound: Vec<u8>,
    partial: Option<PartialFrame>,
    timeout: Duration,
    log: Logger,
}

impl<S: Read + Write> Connection<S> {
    pub fn new(stream: S, remote: SocketAddrV4, is_parent: bool, log: Logger) -> Self {
        Self {
            stream,
            remote,
            is_parent,
            outbound: VecDeque::new(),
            inbound: Vec::new(),
            partial: None,
            timeout: FRAME_TIMEOUT,
            log,
        }
    }

    /// Override the partial-frame timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn remote(&self) -> SocketAddrV4 {
        self.remote
    }

    pub fn is_parent(&self) -> bool {
        self.is_parent
    }

    /// Bytes still waiting in the outbound queue.
    pub fn queued_bytes(&self) -> usize {
        self.outbound
            .iter()
            .map(|o| o.bytes.len() - o.offset)
            .sum()
    }

    /// Append a frame to the outbound queue: header buffer, then payload if non-empty.
    pub fn queue(&mut self, op: Op, payload: Arc<[u8]>) {
        let header = encode_header(op, payload.len() as u32);
        self.outbound.push_back(Outgoing {
            bytes: Arc::from(&header[..]),
            offset: 0,
        });
        if !payload.is_empty() {
            self.outbound.push_back(Outgoing {
                bytes: payload,
                offset: 0,
            });
        }
    }

    /// One poll-loop step. `Err` means the connection is dead and must be dropped.
    ///
    /// Readable bytes are taken in before the partial-frame deadline is checked, so a frame
    /// whose tail already sits in the socket buffer completes even after a slow cycle.
    pub fn update(
        &mut self,
        now: Instant,
        sandbox: &mut Sandbox,
    ) -> Result<Vec<Action>, ConnectionError> {
        self.flush()?;

        let mut actions = Vec::new();
        if self.fill()? {
            while let Some((op, payload)) = self.next_frame(now)? {
                self.dispatch(op, payload, sandbox, &mut actions)?;
                if actions.contains(&Action::Close) {
                    return Ok(actions);
                }
            }
        }

        if let Some(partial) = self.partial {
            if now.saturating_duration_since(partial.since) > self.timeout {
                return Err(ConnectionError::Timeout {
                    op: partial.op,
                    len: partial.len,
                    timeout: self.timeout,
                });
            }
        }
        Ok(actions)
    }

    /// Write queued buffers until the queue drains, a write comes up short, or the socket would block.
    fn flush(&mut self) -> Result<(), ConnectionError> {
        while let Some(head) = self.outbound.front_mut() {
            match self.stream.write(&head.bytes[head.offset..]) {
                Ok(0) => return Err(ConnectionError::Reset),
                Ok(n) => {
                    head.offset += n;
                    if head.offset < head.bytes.len() {
                        break;
                    }
                    self.outbound.pop_front();
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Drain readable bytes into the inbound buffer. Returns false when nothing was ready.
    fn fill(&mut self) -> Result<bool, ConnectionError> {
        let mut chunk = [0u8; READ_CHUNK];
        let mut received = false;
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    if received {
                        // Frames already buffered are handled first; EOF shows up again next cycle.
                        return Ok(true);
                    }
                    return Err(ConnectionError::Reset);
                }
                Ok(n) => {
                    self.inbound.extend_from_slice(&chunk[..n]);
                    received = true;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(received),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Pop the next complete frame, opening a partial-frame record when only the header is in.
    fn next_frame(&mut self, now: Instant) -> Result<Option<(Op, Vec<u8>)>, ConnectionError> {
        let partial = match self.partial {
            Some(partial) => partial,
            None => {
                let header = match wire::decode_header(&self.inbound) {
                    Ok(header) => header,
                    Err(wire::FrameDecodeError::NeedMore) => return Ok(None),
                };
                let op = Op::from_byte(header.op).ok_or(ConnectionError::UnknownOp(header.op))?;
                let required = op.min_payload_len(self.is_parent);
                // A parent's plain disconnect (no redirect) is empty; anything between is malformed.
                let plain_disconnect = op == Op::Disconnect && header.len == 0;
                if header.len < required && !plain_disconnect {
                    return Err(ConnectionError::Undersized {
                        op,
                        len: header.len,
                        required,
                    });
                }
                if header.len > MAX_PAYLOAD_LEN {
                    return Err(ConnectionError::Oversized {
                        op,
                        len: header.len,
                        max: MAX_PAYLOAD_LEN,
                    });
                }
                self.inbound.drain(..HEADER_LEN);
                let partial = PartialFrame {
                    op,
                    len: header.len,
                    since: now,
                };
                self.partial = Some(partial);
                partial
            }
        };

        let len = partial.len as usize;
        if self.inbound.len() < len {
            return Ok(None);
        }
        let payload: Vec<u8> = self.inbound.drain(..len).collect();
        self.partial = None;
        Ok(Some((partial.op, payload)))
    }

    fn dispatch(
        &mut self,
        op: Op,
        payload: Vec<u8>,
        sandbox: &mut Sandbox,
        actions: &mut Vec<Action>,
    ) -> Result<(), ConnectionError> {
        match op {
            Op::Code => self.on_code(payload, sandbox, actions),
            Op::Invoke => self.on_invoke(sandbox, actions),
            Op::Disconnect => {
                self.on_disconnect(&payload, actions)?;
            }
            ack => self.on_ack(ack, &payload),
        }
        Ok(())
    }

    /// `Okay` and error replies end an exchange; nothing is sent back.
    fn on_ack(&self, op: Op, payload: &[u8]) {
        let text = String::from_utf8_lossy(payload);
        if op.is_error() {
            self.log.warn(format!("{} reported {op}: {text}", self.remote));
        } else {
            self.log.info(format!("{} loaded {text}", self.remote));
        }
    }

    fn on_code(&mut self, payload: Vec<u8>, sandbox: &mut Sandbox, actions: &mut Vec<Action>) {
        if !self.is_parent {
            self.log.fail(format!(
                "A child node {} requests loading a code module",
                self.remote
            ));
            self.queue(Op::InvalidFlow, Arc::from(&[][..]));
            return;
        }

        self.log.info(format!(
            "Loading code module ({:.3}KB) from {}...",
            payload.len() as f64 / 1024.0,
            self.remote
        ));
        let payload: Arc<[u8]> = payload.into();
        actions.push(Action::Flood {
            op: Op::Code,
            payload: payload.clone(),
        });

        match sandbox.load(&payload) {
            Ok(ids) => {
                let ids = ids.join(", ");
                self.log.info(format!("{ids} loaded"));
                self.queue(Op::Okay, ids.into_bytes().into());
            }
            Err(e) => {
                self.log.fail(format!("Code module from {} rejected: {e}", self.remote));
                self.queue(e.op(), e.to_string().into_bytes().into());
            }
        }
    }

    fn on_invoke(&mut self, sandbox: &mut Sandbox, actions: &mut Vec<Action>) {
        if !self.is_parent {
            self.log.fail(format!(
                "A child node {} requests invoking the loaded module",
                self.remote
            ));
            self.queue(Op::InvalidFlow, Arc::from(&[][..]));
            return;
        }

        match sandbox.invoke(&self.log) {
            Ok(seq) => {
                self.log.info(format!("Invocation #{seq} started by {}", self.remote));
                actions.push(Action::Flood {
                    op: Op::Invoke,
                    payload: Arc::from(&[][..]),
                });
            }
            Err(e) => {
                self.log.fail(format!(
                    "{} requests invoking the module; but {e}",
                    self.remote
                ));
                self.queue(e.op(), Arc::from(&[][..]));
            }
        }
    }

    fn on_disconnect(
        &mut self,
        payload: &[u8],
        actions: &mut Vec<Action>,
    ) -> Result<(), ConnectionError> {
        if self.is_parent && !payload.is_empty() {
            let target = decode_endpoint(payload)?;
            self.log.warn(format!(
                "Parent node {} requests redirection to {target}",
                self.remote
            ));
            actions.push(Action::Reparent(target));
        } else if self.is_parent {
            self.log.warn(format!("Parent node {} is leaving", self.remote));
        } else {
            self.log.warn(format!("{} requests disconnecting...", self.remote));
        }

        let deadline = Instant::now() + self.timeout;
        self.write_blocking(&[DISCONNECT_ACK], deadline, self.timeout)?;
        actions.push(Action::Close);
        Ok(())
    }

    /// Node-initiated disconnect: drain the queue, send `Disconnect` (optionally carrying a
    /// redirect endpoint) and wait for the one-byte acknowledgement.
    pub fn disconnect(
        &mut self,
        redirect: Option<SocketAddrV4>,
        wait: Duration,
    ) -> Result<(), ConnectionError> {
        self.log.info(format!("Disconnection request to {}", self.remote));
        let deadline = Instant::now() + wait;

        while let Some(head) = self.outbound.pop_front() {
            self.write_blocking(&head.bytes[head.offset..], deadline, wait)?;
        }

        let frame = match redirect {
            Some(target) => wire::encode_frame(Op::Disconnect, &encode_endpoint(target))?,
            None => wire::encode_frame(Op::Disconnect, &[])?,
        };
        self.write_blocking(&frame, deadline, wait)?;

        self.log.info(format!("Waiting for response by {}", self.remote));
        let mut ack = [0u8; 1];
        loop {
            match self.stream.read(&mut ack) {
                // Any byte, or the peer closing, ends the exchange.
                Ok(_) => return Ok(()),
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::Interrupted =>
                {
                    if Instant::now() >= deadline {
                        return Err(ConnectionError::AckTimeout(wait));
                    }
                    thread::sleep(BLOCKING_POLL);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Write all of `bytes` before `deadline`; `wait` is the budget reported on timeout.
    fn write_blocking(
        &mut self,
        mut bytes: &[u8],
        deadline: Instant,
        wait: Duration,
    ) -> Result<(), ConnectionError> {
        while !bytes.is_empty() {
            match self.stream.write(bytes) {
                Ok(0) => return Err(ConnectionError::Reset),
                Ok(n) => bytes = &bytes[n..],
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::Interrupted =>
                {
                    if Instant::now() >= deadline {
                        return Err(ConnectionError::AckTimeout(wait));
                    }
                    thread::sleep(BLOCKING_POLL);
                }
                Err(e) => return Err(e.into()),
            }
        }
        self.stream.flush()?;
        Ok(())
    }
}
