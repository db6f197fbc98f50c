//! Raw AF_BLUETOOTH RFCOMM sockets.
//!
//! There is no std coverage for Bluetooth sockets, so this is a thin
//! libc layer: `socket(AF_BLUETOOTH, SOCK_STREAM, BTPROTO_RFCOMM)` and
//! the `sockaddr_rc` layout (family u16, bdaddr 6 bytes, channel u8),
//! stable across Linux kernels. `accept` blocks at the OS level and is
//! therefore always run on the blocking executor; accepted sockets are
//! switched to non-blocking for the short-window poll loop.

use std::io;
use std::mem;
use std::os::fd::RawFd;

const BTPROTO_RFCOMM: libc::c_int = 3;

#[repr(C, packed)]
#[derive(Clone, Copy)]
struct SockaddrRc {
    rc_family: libc::sa_family_t,
    rc_bdaddr: [u8; 6],
    rc_channel: u8,
}

fn last_err() -> io::Error {
    io::Error::last_os_error()
}

/// bdaddr_t is stored little-endian; render it the way every Bluetooth
/// tool prints it.
fn format_bdaddr(b: &[u8; 6]) -> String {
    format!(
        "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
        b[5], b[4], b[3], b[2], b[1], b[0]
    )
}

pub struct RfcommListener {
    fd: RawFd,
    pub channel: u8,
}

impl RfcommListener {
    /// Bind `(BDADDR_ANY, channel)` and listen with backlog 5.
    pub fn bind(channel: u8) -> io::Result<Self> {
        let fd = unsafe {
            libc::socket(
                libc::AF_BLUETOOTH,
                libc::SOCK_STREAM | libc::SOCK_CLOEXEC,
                BTPROTO_RFCOMM,
            )
        };
        if fd < 0 {
            return Err(last_err());
        }

        let reuse: libc::c_int = 1;
        let rc = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                &reuse as *const _ as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            let e = last_err();
            unsafe { libc::close(fd) };
            return Err(e);
        }

        let addr = SockaddrRc {
            rc_family: libc::AF_BLUETOOTH as libc::sa_family_t,
            rc_bdaddr: [0u8; 6], // BDADDR_ANY
            rc_channel: channel,
        };
        let rc = unsafe {
            libc::bind(
                fd,
                &addr as *const _ as *const libc::sockaddr,
                mem::size_of::<SockaddrRc>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            let e = last_err();
            unsafe { libc::close(fd) };
            return Err(e);
        }

        let rc = unsafe { libc::listen(fd, 5) };
        if rc < 0 {
            let e = last_err();
            unsafe { libc::close(fd) };
            return Err(e);
        }

        Ok(Self { fd, channel })
    }

    /// Wait for the next peer. The blocking `accept(2)` runs on a
    /// blocking-executor slot, never on the cooperative pool.
    pub async fn accept(&self) -> io::Result<RfcommStream> {
        let fd = self.fd;
        tokio::task::spawn_blocking(move || {
            let mut addr: SockaddrRc = unsafe { mem::zeroed() };
            let mut len = mem::size_of::<SockaddrRc>() as libc::socklen_t;
            let client = unsafe {
                libc::accept(fd, &mut addr as *mut _ as *mut libc::sockaddr, &mut len)
            };
            if client < 0 {
                return Err(last_err());
            }

            // non-blocking from here on; the session loop polls in
            // 100 ms windows instead of parking a thread
            let flags = unsafe { libc::fcntl(client, libc::F_GETFL) };
            if flags < 0
                || unsafe { libc::fcntl(client, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0
            {
                let e = last_err();
                unsafe { libc::close(client) };
                return Err(e);
            }

            let bdaddr = addr.rc_bdaddr;
            Ok(RfcommStream {
                fd: client,
                peer: format_bdaddr(&bdaddr),
            })
        })
        .await
        .map_err(|e| io::Error::other(format!("accept task failed: {e}")))?
    }

    /// Unblock a pending `accept` (shutdown, not close: the fd stays
    /// valid until drop).
    pub fn shutdown(&self) {
        unsafe { libc::shutdown(self.fd, libc::SHUT_RDWR) };
    }
}

impl Drop for RfcommListener {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

pub struct RfcommStream {
    fd: RawFd,
    pub peer: String,
}

impl RfcommStream {
    /// Non-blocking read. `Ok(None)` means nothing pending right now;
    /// an orderly peer close surfaces as `UnexpectedEof`.
    pub fn try_recv(&self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        let n = unsafe {
            libc::recv(
                self.fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
            )
        };
        if n > 0 {
            return Ok(Some(n as usize));
        }
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "peer closed the RFCOMM link",
            ));
        }
        let e = last_err();
        match e.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => Ok(None),
            _ => Err(e),
        }
    }

    /// Write the whole buffer. A full transport buffer surfaces as
    /// `WouldBlock` so the caller can apply its one-retry policy.
    pub fn send_all(&self, data: &[u8]) -> io::Result<()> {
        let mut sent = 0;
        while sent < data.len() {
            let n = unsafe {
                libc::send(
                    self.fd,
                    data[sent..].as_ptr() as *const libc::c_void,
                    data.len() - sent,
                    libc::MSG_NOSIGNAL,
                )
            };
            if n < 0 {
                let e = last_err();
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e);
            }
            sent += n as usize;
        }
        Ok(())
    }
}

impl Drop for RfcommStream {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sockaddr_rc_layout_matches_the_kernel() {
        // family(2) + bdaddr(6) + channel(1), packed
        assert_eq!(mem::size_of::<SockaddrRc>(), 9);
    }

    #[test]
    fn bdaddr_renders_reversed() {
        let raw = [0x12, 0xEF, 0xCD, 0xAB, 0x34, 0xDC];
        assert_eq!(format_bdaddr(&raw), "DC:34:AB:CD:EF:12");
    }
}
