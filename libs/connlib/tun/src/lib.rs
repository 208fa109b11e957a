//! The [`TunDevice`] trait abstracts over the platform-specific virtual network
//! interface that carries decrypted WireGuard traffic to and from the host's IP
//! stack. Creating the interface (and wiring it into the rest of the host's
//! networking) is out of scope here; this crate only reads and writes packets.

use std::io;

#[cfg(target_os = "linux")]
pub mod linux;

#[cfg(target_os = "linux")]
pub use linux::LinuxTun;

/// A state change on the TUN device worth reacting to, e.g. re-reading MTU or
/// re-applying addresses after the interface bounced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunEvent {
    Up,
    Down,
}

/// Blocking packet I/O against a virtual network interface.
///
/// Implementations are driven by the WireGuard device's own worker thread(s), not by
/// the agent directly — the agent only creates the device and hands it off.
pub trait TunDevice: Send + Sync + 'static {
    /// The OS-assigned interface name, e.g. `tun-meshtun`.
    fn name(&self) -> &str;

    fn mtu(&self) -> usize;

    /// Reads up to `bufs.len()` packets, each written starting at `offset` bytes into
    /// the corresponding buffer (some platforms prepend a packet-info header that the
    /// caller reserves room for). On return, `sizes[i]` holds the length of the
    /// payload written into `bufs[i]` for `i < returned count`. Blocks until at least
    /// one packet is available.
    fn read(&self, bufs: &mut [&mut [u8]], sizes: &mut [usize], offset: usize) -> io::Result<usize>;

    /// Writes one packet per buffer, each starting at `offset` bytes in. Returns the
    /// number of buffers written (short writes are treated as fatal by callers).
    fn write(&self, bufs: &[&[u8]], offset: usize) -> io::Result<usize>;

    /// A receiver for interface state changes. Cloning the device must not duplicate
    /// events onto independent channels — all handles observe the same stream.
    fn events(&self) -> tokio::sync::watch::Receiver<TunEvent>;

    fn close(&self) -> io::Result<()>;
}
