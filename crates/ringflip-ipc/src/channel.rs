//! Unix-datagram transport for control messages.
//!
//! One receiver socket per endpoint (daemon or client), bound to a
//! filesystem path derived from the session identifier. Delivery within one
//! session is ordered; losses are tolerated by the protocol. The sender pid
//! rides along as `SCM_CREDENTIALS` ancillary data rather than in the
//! payload, so the daemon keys sessions by a pid the kernel vouches for.

use crate::error::WireError;
use crate::message::{ControlMessage, MAX_MESSAGE_BYTES};
use std::io;
use std::mem;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONNECT_RETRIES: u32 = 5;
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(5);

/// Receiving end of a control channel.
///
/// Owns the socket file; the path is unlinked again on drop.
pub struct Receiver {
    sock: UnixDatagram,
    path: PathBuf,
}

impl Receiver {
    /// Binds the receiver, replacing any stale socket file at `path`.
    pub fn bind(path: impl Into<PathBuf>) -> Result<Self, WireError> {
        let path = path.into();
        if path.exists() {
            let _ = std::fs::remove_file(&path);
        }
        let sock = UnixDatagram::bind(&path)?;

        // Ask the kernel to attach sender credentials to every datagram.
        let enable: libc::c_int = 1;
        // Safety: valid fd, valid option buffer.
        let rc = unsafe {
            libc::setsockopt(
                sock.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_PASSCRED,
                std::ptr::addr_of!(enable).cast(),
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(WireError::Io(io::Error::last_os_error()));
        }

        Ok(Self { sock, path })
    }

    /// Periodic wake-up so receive loops can observe stop flags.
    pub fn set_poll_interval(&self, interval: Duration) -> Result<(), WireError> {
        self.sock.set_read_timeout(Some(interval))?;
        Ok(())
    }

    /// Receives one message with the sender's pid.
    ///
    /// Returns `Ok(None)` when the poll interval elapsed without traffic.
    /// Undecodable datagrams and datagrams without sender credentials
    /// surface as errors; the caller logs and keeps receiving.
    pub fn recv(&self) -> Result<Option<(ControlMessage, u32)>, WireError> {
        let mut buf = [0u8; MAX_MESSAGE_BYTES];
        match recv_with_creds(&self.sock, &mut buf) {
            Ok(Some((len, Some(pid)))) => Ok(Some((ControlMessage::decode(&buf[..len])?, pid))),
            Ok(Some((_, None))) => Err(WireError::MissingCredentials),
            Ok(None) => Ok(None),
            Err(err) => Err(WireError::Io(err)),
        }
    }

    /// Path the receiver is bound to.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for Receiver {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Sending end of a control channel, connected to one peer receiver.
pub struct Sender {
    sock: UnixDatagram,
}

impl Sender {
    /// Connects to the peer's receiver socket, retrying briefly: the peer
    /// may still be between creating its region and binding its receiver.
    pub fn connect(path: impl AsRef<Path>) -> Result<Self, WireError> {
        let path = path.as_ref();
        let mut last = None;
        for attempt in 0..CONNECT_RETRIES {
            if attempt > 0 {
                std::thread::sleep(CONNECT_RETRY_DELAY);
            }
            let sock = UnixDatagram::unbound()?;
            match sock.connect(path) {
                Ok(()) => return Ok(Self { sock }),
                Err(err) => last = Some(err),
            }
        }
        Err(last.map_or(WireError::PeerClosed, WireError::Io))
    }

    /// Sends one message; any failure means the peer is gone.
    pub fn send(&self, message: &ControlMessage) -> Result<(), WireError> {
        let mut buf = [0u8; MAX_MESSAGE_BYTES];
        let len = message.encode(&mut buf);
        match self.sock.send(&buf[..len]) {
            Ok(_) => Ok(()),
            Err(_) => Err(WireError::PeerClosed),
        }
    }
}

/// `recvmsg` with an `SCM_CREDENTIALS` control buffer.
///
/// The pid is `None` when the kernel attached no credentials; the caller
/// decides how loudly to reject the datagram.
fn recv_with_creds(
    sock: &UnixDatagram,
    buf: &mut [u8],
) -> io::Result<Option<(usize, Option<u32>)>> {
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr().cast(),
        iov_len: buf.len(),
    };
    // u64 backing keeps the control buffer aligned for cmsghdr.
    let mut control = [0u64; 8];

    // Safety: zeroed msghdr is a valid initial state.
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr().cast();
    msg.msg_controllen = mem::size_of_val(&control);

    // Safety: fd is valid, msghdr points at live buffers.
    let received = unsafe { libc::recvmsg(sock.as_raw_fd(), &mut msg, 0) };
    if received < 0 {
        let err = io::Error::last_os_error();
        return match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted => {
                Ok(None)
            }
            _ => Err(err),
        };
    }

    // Safety: the kernel filled msg_control up to msg_controllen.
    let pid = unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        let mut pid = None;
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_CREDENTIALS
            {
                let mut creds: libc::ucred = mem::zeroed();
                std::ptr::copy_nonoverlapping(
                    libc::CMSG_DATA(cmsg),
                    std::ptr::addr_of_mut!(creds).cast(),
                    mem::size_of::<libc::ucred>(),
                );
                pid = Some(creds.pid as u32);
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
        pid
    };

    Ok(Some((received as usize, pid)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{app_id_bytes, ConnectMessage};

    #[test]
    fn send_recv_carries_pid() {
        let dir = tempfile::tempdir().unwrap();
        let receiver = Receiver::bind(dir.path().join("recv")).unwrap();

        let sender = Sender::connect(receiver.path()).unwrap();
        let msg = ControlMessage::Connect(ConnectMessage {
            app_id: app_id_bytes("AP"),
            uid: 7,
            use_dynamic_id: false,
            random_suffix: [0; 6],
        });
        sender.send(&msg).unwrap();

        let (received, pid) = receiver.recv().unwrap().expect("one datagram");
        assert_eq!(received, msg);
        assert_eq!(pid, std::process::id());
    }

    #[test]
    fn poll_interval_returns_none_when_idle() {
        let dir = tempfile::tempdir().unwrap();
        let receiver = Receiver::bind(dir.path().join("recv")).unwrap();
        receiver
            .set_poll_interval(Duration::from_millis(10))
            .unwrap();
        assert!(receiver.recv().unwrap().is_none());
    }

    #[test]
    fn send_to_dropped_receiver_reports_peer_closed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("recv");
        let receiver = Receiver::bind(&path).unwrap();
        let sender = Sender::connect(&path).unwrap();
        drop(receiver);

        let err = sender.send(&ControlMessage::AcquireRequest).unwrap_err();
        assert!(err.is_peer_closed());
    }

    #[test]
    fn connect_to_missing_peer_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Sender::connect(dir.path().join("nobody")).is_err());
    }

    #[test]
    fn receiver_unlinks_socket_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("recv");
        let receiver = Receiver::bind(&path).unwrap();
        assert!(path.exists());
        drop(receiver);
        assert!(!path.exists());
    }
}
