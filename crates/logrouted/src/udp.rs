//! UDP output socket with vectored and batched send.

use std::io;
use std::mem;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::os::unix::io::AsRawFd;

/// A bound, connected UDP socket owned by one channel for its lifetime.
pub struct UdpOutput {
    sock: UdpSocket,
}

impl UdpOutput {
    /// Binds the source address once and connects to the destination.
    ///
    /// `multicast_interface` is the local interface address to use for
    /// multicast destinations.
    pub fn open(
        src: SocketAddr,
        dst: SocketAddr,
        multicast_interface: Option<Ipv4Addr>,
    ) -> io::Result<Self> {
        let sock = UdpSocket::bind(src)?;
        if let Some(interface) = multicast_interface {
            let addr = libc::in_addr {
                s_addr: u32::from_ne_bytes(interface.octets()),
            };
            // Safety: valid fd, valid option buffer.
            let rc = unsafe {
                libc::setsockopt(
                    sock.as_raw_fd(),
                    libc::IPPROTO_IP,
                    libc::IP_MULTICAST_IF,
                    std::ptr::addr_of!(addr).cast(),
                    mem::size_of::<libc::in_addr>() as libc::socklen_t,
                )
            };
            if rc != 0 {
                return Err(io::Error::last_os_error());
            }
        }
        sock.connect(dst)?;
        Ok(Self { sock })
    }

    /// The locally bound address (useful with an ephemeral source port).
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.sock.local_addr()
    }

    /// Sends one datagram gathered from up to two parts (header + payload).
    pub fn send_vectored(&self, parts: &[&[u8]]) -> io::Result<()> {
        let mut iov: [libc::iovec; 2] = unsafe { mem::zeroed() };
        for (vec, part) in iov.iter_mut().zip(parts) {
            vec.iov_base = part.as_ptr() as *mut libc::c_void;
            vec.iov_len = part.len();
        }

        // Safety: zeroed msghdr plus live iovecs; the socket is connected,
        // so no destination address is needed.
        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_iov = iov.as_mut_ptr();
        msg.msg_iovlen = parts.len().min(iov.len());

        let rc = unsafe { libc::sendmsg(self.sock.as_raw_fd(), &msg, 0) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Sends each buffer as its own datagram in one syscall.
    pub fn send_batch(&self, datagrams: &[&[u8]]) -> io::Result<()> {
        const MAX_BATCH: usize = 4;
        debug_assert!(datagrams.len() <= MAX_BATCH);

        let mut iov: [libc::iovec; MAX_BATCH] = unsafe { mem::zeroed() };
        let mut headers: [libc::mmsghdr; MAX_BATCH] = unsafe { mem::zeroed() };
        let count = datagrams.len().min(MAX_BATCH);

        for i in 0..count {
            iov[i].iov_base = datagrams[i].as_ptr() as *mut libc::c_void;
            iov[i].iov_len = datagrams[i].len();
            headers[i].msg_hdr.msg_iov = &mut iov[i];
            headers[i].msg_hdr.msg_iovlen = 1;
        }

        // Safety: headers/iovecs are live for the duration of the call.
        let rc = unsafe {
            libc::sendmmsg(
                self.sock.as_raw_fd(),
                headers.as_mut_ptr(),
                count as libc::c_uint,
                0,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listener() -> (UdpSocket, SocketAddr) {
        let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = sock.local_addr().unwrap();
        (sock, addr)
    }

    #[test]
    fn vectored_send_arrives_as_one_datagram() {
        let (listener, addr) = listener();
        let out = UdpOutput::open("127.0.0.1:0".parse().unwrap(), addr, None).unwrap();

        out.send_vectored(&[b"head", b"body"]).unwrap();

        let mut buf = [0u8; 64];
        let n = listener.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"headbody");
    }

    #[test]
    fn batch_send_emits_one_datagram_per_buffer() {
        let (listener, addr) = listener();
        let out = UdpOutput::open("127.0.0.1:0".parse().unwrap(), addr, None).unwrap();

        out.send_batch(&[b"one", b"two", b"three"]).unwrap();

        let mut buf = [0u8; 64];
        let mut seen = Vec::new();
        for _ in 0..3 {
            let n = listener.recv(&mut buf).unwrap();
            seen.push(buf[..n].to_vec());
        }
        assert_eq!(seen, vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]);
    }
}
