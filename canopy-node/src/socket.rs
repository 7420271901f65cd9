//! TCP socket setup. Every socket reuses its address so a joiner can listen on the port it
//! dialed from and a parent can dial back from the port it accepted on.

use std::io;
use std::net::{SocketAddr, SocketAddrV4, TcpListener, TcpStream};
use std::time::Duration;

use socket2::{Domain, Protocol, SockRef, Socket, Type};

const BACKLOG: i32 = 128;

fn tcp_socket() -> io::Result<Socket> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_nodelay(true)?;
    Ok(socket)
}

pub fn listen(addr: SocketAddrV4) -> io::Result<TcpListener> {
    let socket = tcp_socket()?;
    socket.bind(&SocketAddr::V4(addr).into())?;
    socket.listen(BACKLOG)?;
    Ok(socket.into())
}

/// Blocking dial from an ephemeral port.
pub fn connect(remote: SocketAddrV4, timeout: Duration) -> io::Result<TcpStream> {
    let socket = tcp_socket()?;
    socket.connect_timeout(&SocketAddr::V4(remote).into(), timeout)?;
    Ok(socket.into())
}

#[cfg(any(target_os = "linux", target_os = "android"))]
const EINPROGRESS: i32 = 115;
#[cfg(all(unix, not(any(target_os = "linux", target_os = "android"))))]
const EINPROGRESS: i32 = 36;

#[cfg(unix)]
fn in_progress(e: &io::Error) -> bool {
    e.raw_os_error() == Some(EINPROGRESS) || e.kind() == io::ErrorKind::WouldBlock
}

#[cfg(not(unix))]
fn in_progress(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
}

/// Begin a non-blocking dial from the fixed endpoint `local`. The socket may still be
/// connecting when this returns; drive it with `poll_connect`.
pub fn start_connect(local: SocketAddrV4, remote: SocketAddrV4) -> io::Result<Socket> {
    let socket = tcp_socket()?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddr::V4(local).into())?;
    match socket.connect(&SocketAddr::V4(remote).into()) {
        Ok(()) => Ok(socket),
        Err(e) if in_progress(&e) => Ok(socket),
        Err(e) => Err(e),
    }
}

/// `Ok(true)` once a `start_connect` socket is established, `Ok(false)` while in flight.
pub fn poll_connect(socket: &Socket) -> io::Result<bool> {
    if let Some(e) = socket.take_error()? {
        return Err(e);
    }
    match socket.peer_addr() {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(false),
        Err(e) => Err(e),
    }
}

/// Close with RST so neither side keeps the 4-tuple in TIME_WAIT.
pub fn abort(stream: TcpStream) {
    let _ = SockRef::from(&stream).set_linger(Some(Duration::ZERO));
    drop(stream);
}

/// Blocking mode with bounded reads and writes, for handshake traffic.
pub fn set_handshake_mode(stream: &TcpStream, timeout: Duration) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;
    stream.set_nodelay(true)
}

/// Non-blocking mode for the poll loop.
pub fn set_poll_mode(stream: &TcpStream) -> io::Result<()> {
    stream.set_read_timeout(None)?;
    stream.set_write_timeout(None)?;
    stream.set_nonblocking(true)
}

pub fn v4(addr: SocketAddr) -> io::Result<SocketAddrV4> {
    match addr {
        SocketAddr::V4(v4) => Ok(v4),
        SocketAddr::V6(v6) => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("{v6} is not an IPv4 endpoint"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::Ipv4Addr;
    use std::thread;
    use std::time::Instant;

    fn loopback(port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)
    }

    fn free_port() -> SocketAddrV4 {
        let spare = listen(loopback(0)).unwrap();
        v4(spare.local_addr().unwrap()).unwrap()
    }

    /// Drive a non-blocking dial to completion or failure.
    fn finish(socket: &Socket) -> io::Result<()> {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !poll_connect(socket)? {
            assert!(Instant::now() < deadline, "dial never settled");
            thread::sleep(Duration::from_millis(1));
        }
        Ok(())
    }

    #[test]
    fn dial_from_fixed_local_port() {
        let server = listen(loopback(0)).unwrap();
        let server_addr = v4(server.local_addr().unwrap()).unwrap();
        let local = free_port();

        let socket = start_connect(local, server_addr).unwrap();
        finish(&socket).unwrap();
        let (_, seen) = server.accept().unwrap();
        assert_eq!(v4(seen).unwrap(), local);
        let stream: TcpStream = socket.into();
        assert_eq!(v4(stream.local_addr().unwrap()).unwrap(), local);
    }

    #[test]
    fn dial_to_closed_port_is_refused() {
        let dead = free_port();
        let local = free_port();
        let err = match start_connect(local, dead) {
            Ok(socket) => finish(&socket).unwrap_err(),
            Err(e) => e,
        };
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
    }

    #[test]
    fn listener_can_reuse_port_of_aborted_connection() {
        let server = listen(loopback(0)).unwrap();
        let server_addr = v4(server.local_addr().unwrap()).unwrap();
        let client = connect(server_addr, Duration::from_secs(2)).unwrap();
        let local = v4(client.local_addr().unwrap()).unwrap();
        let (mut accepted, _) = server.accept().unwrap();
        abort(client);
        let _ = accepted.read(&mut [0u8; 1]);

        let reused = listen(local).unwrap();
        assert_eq!(v4(reused.local_addr().unwrap()).unwrap(), local);
    }

    #[test]
    fn rejects_ipv6() {
        let addr: SocketAddr = "[::1]:80".parse().unwrap();
        assert!(v4(addr).is_err());
    }
}
