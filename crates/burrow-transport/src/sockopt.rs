//! Socket tuning applied to tunnel and forwarded sockets, plus listener
//! construction with an explicit backlog.

use socket2::{Domain, SockRef, Socket, TcpKeepalive, Type};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::warn;

/// Adjust an established TCP socket: keepalive always, `TCP_NODELAY`
/// when the relevant turbo flag is set. Best effort; failures are logged
/// and ignored.
pub fn tune_stream(stream: &TcpStream, turbo: bool) {
    let sock = SockRef::from(stream);

    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(60))
        .with_interval(Duration::from_secs(5));
    #[cfg(not(target_os = "windows"))]
    let keepalive = keepalive.with_retries(3);
    if let Err(error) = sock.set_tcp_keepalive(&keepalive) {
        warn!(%error, "failed to set TCP keepalive");
    }

    if turbo {
        if let Err(error) = sock.set_nodelay(true) {
            warn!(%error, "failed to set TCP_NODELAY");
        }
    }
}

/// Bind a TCP listener with the configured accept backlog.
pub fn bind_listener(addr: SocketAddr, backlog: u32) -> std::io::Result<TcpListener> {
    let domain = match addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    };
    let socket = Socket::new(domain, Type::STREAM, Some(socket2::Protocol::TCP))?;
    #[cfg(not(target_os = "windows"))]
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog.min(i32::MAX as u32) as i32)?;
    TcpListener::from_std(socket.into())
}
