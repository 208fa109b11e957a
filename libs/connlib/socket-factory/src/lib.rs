//! Socket construction for the signaling client and the ICE layer.
//!
//! On Android, every socket the agent opens — including the ones the ICE agent
//! opens internally for STUN/TURN/data-channel candidates — must be handed to the
//! VPN service's `protect()` call before use, or the OS routes its traffic back
//! through the tunnel it belongs to, deadlocking the connection. [`SocketProtector`]
//! is the hook for that; everything else here is a thin wrapper around `socket2`.

use std::io;
use std::net::SocketAddr;

/// Exempts a raw socket from the device's own VPN routing (Android's
/// `VpnService.protect`). A no-op implementation is correct on every other platform.
pub trait SocketProtector: Send + Sync + 'static {
    fn protect(&self, fd: RawFd) -> bool;
}

#[cfg(any(target_os = "linux", target_os = "android"))]
pub type RawFd = std::os::fd::RawFd;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub type RawFd = i32;

/// The protector used when no platform-specific one is configured.
pub struct NoopProtector;

impl SocketProtector for NoopProtector {
    fn protect(&self, _fd: RawFd) -> bool {
        true
    }
}

pub trait SocketFactory<S>: Send + Sync + 'static {
    fn bind(&self, local: SocketAddr) -> io::Result<S>;
}

impl<F, S> SocketFactory<S> for F
where
    F: Fn(SocketAddr) -> io::Result<S> + Send + Sync + 'static,
{
    fn bind(&self, local: SocketAddr) -> io::Result<S> {
        (self)(local)
    }
}

/// Builds a TCP socket bound to `local` (commonly `0.0.0.0:0`), suitable for dialing
/// the signaling relay's WebSocket endpoint. `mark`, if given, is applied as
/// `SO_MARK` on Linux so the kernel's routing policy can exclude signaling traffic
/// from the tunnel's own routes (avoiding a routing loop).
pub fn tcp(local: SocketAddr, mark: Option<u32>, protector: &dyn SocketProtector) -> io::Result<tokio::net::TcpSocket> {
    let domain = if local.is_ipv4() {
        socket2::Domain::IPV4
    } else {
        socket2::Domain::IPV6
    };
    let socket = socket2::Socket::new(domain, socket2::Type::STREAM, Some(socket2::Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    socket.bind(&local.into())?;

    apply_mark(&socket, mark)?;

    if !protector.protect(raw_fd(&socket)) {
        tracing::warn!("SocketProtector declined to protect signaling TCP socket");
    }

    let socket = tokio::net::TcpSocket::from_std(socket.into())?;
    socket.set_nodelay(true)?;

    Ok(socket)
}

/// Builds a UDP socket for the ICE agent's host candidates, applying the same
/// mark/protect treatment as [`tcp`].
pub fn udp(local: SocketAddr, mark: Option<u32>, protector: &dyn SocketProtector) -> io::Result<tokio::net::UdpSocket> {
    let domain = if local.is_ipv4() {
        socket2::Domain::IPV4
    } else {
        socket2::Domain::IPV6
    };
    let socket = socket2::Socket::new(domain, socket2::Type::DGRAM, Some(socket2::Protocol::UDP))?;
    socket.set_nonblocking(true)?;
    socket.bind(&local.into())?;

    apply_mark(&socket, mark)?;

    if !protector.protect(raw_fd(&socket)) {
        tracing::warn!("SocketProtector declined to protect ICE UDP socket");
    }

    tokio::net::UdpSocket::from_std(socket.into())
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn raw_fd(socket: &socket2::Socket) -> RawFd {
    use std::os::fd::AsRawFd as _;
    socket.as_raw_fd()
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn raw_fd(_socket: &socket2::Socket) -> RawFd {
    0
}

#[cfg(target_os = "linux")]
fn apply_mark(socket: &socket2::Socket, mark: Option<u32>) -> io::Result<()> {
    use std::os::fd::AsRawFd as _;

    let Some(mark) = mark else {
        return Ok(());
    };

    // SAFETY: `socket` owns a valid fd for the duration of this call and `mark` is a
    // plain `u32` value matching `SO_MARK`'s expected option length.
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_MARK,
            &mark as *const u32 as *const libc::c_void,
            std::mem::size_of::<u32>() as libc::socklen_t,
        )
    };

    if ret != 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn apply_mark(_socket: &socket2::Socket, _mark: Option<u32>) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_protector_always_succeeds() {
        assert!(NoopProtector.protect(0));
    }

    #[test]
    fn tcp_binds_ephemeral_port() {
        let socket = tcp("127.0.0.1:0".parse().unwrap(), None, &NoopProtector).unwrap();

        assert!(socket.local_addr().unwrap().port() > 0);
    }

    #[test]
    fn udp_binds_ephemeral_port() {
        let socket = udp("127.0.0.1:0".parse().unwrap(), None, &NoopProtector).unwrap();

        assert!(socket.local_addr().unwrap().port() > 0);
    }
}
