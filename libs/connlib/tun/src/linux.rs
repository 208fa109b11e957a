use crate::{TunDevice, TunEvent};
use std::ffi::CStr;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use tokio::sync::watch;

const TUNSETIFF: libc::c_ulong = 0x4004_54ca;
const IFF_TUN: libc::c_short = 0x0001;
const IFF_NO_PI: libc::c_short = 0x1000;
const TUN_FILE: &CStr = c"/dev/net/tun";

/// `ifreq` as used by `TUNSETIFF`; we only ever populate `ifr_name` and `ifr_flags`.
#[repr(C)]
struct IfReq {
    name: [libc::c_char; libc::IF_NAMESIZE],
    flags: libc::c_short,
    _pad: [u8; 22],
}

pub struct LinuxTun {
    fd: OwnedFd,
    name: String,
    mtu: usize,
    events_tx: watch::Sender<TunEvent>,
    events_rx: watch::Receiver<TunEvent>,
}

impl LinuxTun {
    pub const IFACE_NAME: &'static str = "tun-meshtun";

    /// Opens `/dev/net/tun` and attaches it to [`Self::IFACE_NAME`], creating the
    /// interface if it does not already exist. The caller (a `NetworkManager`
    /// collaborator) is responsible for assigning an address and bringing the link
    /// up afterwards.
    pub fn new(mtu: usize) -> io::Result<Self> {
        let fd = open_clone_dev()?;

        let mut req = IfReq {
            name: [0; libc::IF_NAMESIZE],
            flags: IFF_TUN | IFF_NO_PI,
            _pad: [0; 22],
        };
        copy_name(&mut req.name, Self::IFACE_NAME);

        // SAFETY: `fd` is a valid, open file descriptor and `req` is a valid `ifreq`
        // for the duration of this call.
        let ret = unsafe { libc::ioctl(fd.as_raw_fd(), TUNSETIFF, &req) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        set_nonblocking(fd.as_raw_fd())?;

        let (events_tx, events_rx) = watch::channel(TunEvent::Up);

        Ok(Self {
            fd,
            name: Self::IFACE_NAME.to_owned(),
            mtu,
            events_tx,
            events_rx,
        })
    }

    /// Notifies all [`TunEvent`] subscribers of a link state change observed by the
    /// owning `NetworkManager` (e.g. a netlink `RTM_NEWLINK` carrying `IFF_RUNNING`).
    pub fn notify(&self, event: TunEvent) {
        let _ = self.events_tx.send(event);
    }
}

impl TunDevice for LinuxTun {
    fn name(&self) -> &str {
        &self.name
    }

    fn mtu(&self) -> usize {
        self.mtu
    }

    fn read(&self, bufs: &mut [&mut [u8]], sizes: &mut [usize], offset: usize) -> io::Result<usize> {
        let mut count = 0;

        wait_readable(self.fd.as_raw_fd())?;

        for (buf, size) in bufs.iter_mut().zip(sizes.iter_mut()) {
            let dst = &mut buf[offset..];

            // SAFETY: `dst` is a valid, writable slice for the duration of this call.
            let n = unsafe {
                libc::read(
                    self.fd.as_raw_fd(),
                    dst.as_mut_ptr() as *mut libc::c_void,
                    dst.len(),
                )
            };

            if n < 0 {
                let err = io::Error::last_os_error();

                if count > 0 && err.kind() == io::ErrorKind::WouldBlock {
                    break;
                }
                if count > 0 {
                    break;
                }

                return Err(err);
            }

            *size = n as usize;
            count += 1;
        }

        Ok(count)
    }

    fn write(&self, bufs: &[&[u8]], offset: usize) -> io::Result<usize> {
        let mut count = 0;

        for buf in bufs {
            let src = &buf[offset..];

            // SAFETY: `src` is a valid, readable slice for the duration of this call.
            let n = unsafe {
                libc::write(
                    self.fd.as_raw_fd(),
                    src.as_ptr() as *const libc::c_void,
                    src.len(),
                )
            };

            if n < 0 {
                return Err(io::Error::last_os_error());
            }
            if n as usize != src.len() {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "short write to tun device",
                ));
            }

            count += 1;
        }

        Ok(count)
    }

    fn events(&self) -> watch::Receiver<TunEvent> {
        self.events_rx.clone()
    }

    fn close(&self) -> io::Result<()> {
        // SAFETY: closing our own fd; subsequent syscalls against it will fail, which
        // `read`/`write` above surface as `io::Error` to their callers.
        let ret = unsafe { libc::close(self.fd.as_raw_fd()) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(())
    }
}

/// Blocks until the fd has data ready, using a single-fd `poll(2)` with no timeout.
fn wait_readable(fd: RawFd) -> io::Result<()> {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };

    // SAFETY: `pfd` points to one valid `pollfd` on the stack.
    let ret = unsafe { libc::poll(&mut pfd, 1, -1) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

fn open_clone_dev() -> io::Result<OwnedFd> {
    // SAFETY: `TUN_FILE` is a valid, NUL-terminated path.
    let fd = unsafe { libc::open(TUN_FILE.as_ptr(), libc::O_RDWR) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }

    // SAFETY: `fd` was just returned by a successful `open`.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    // SAFETY: `fd` is a valid, open file descriptor.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }

    // SAFETY: `fd` is a valid, open file descriptor.
    let ret = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

fn copy_name(dst: &mut [libc::c_char; libc::IF_NAMESIZE], name: &str) {
    for (slot, byte) in dst.iter_mut().zip(name.as_bytes()) {
        *slot = *byte as libc::c_char;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copies_name_into_ifreq_buffer() {
        let mut buf = [0 as libc::c_char; libc::IF_NAMESIZE];
        copy_name(&mut buf, LinuxTun::IFACE_NAME);

        let copied: String = buf
            .iter()
            .take_while(|c| **c != 0)
            .map(|c| *c as u8 as char)
            .collect();

        assert_eq!(copied, LinuxTun::IFACE_NAME);
    }
}
