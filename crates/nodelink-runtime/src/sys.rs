//! Socket syscalls used by the reactor
//!
//! Thin wrappers over libc/nix that return `SocketError` and hand back
//! `OwnedFd`s. Every socket created here is non-blocking and close-on-exec.
//! Only the reactor thread calls these, except listener binding at node
//! start and [`resolve`], which runs on short-lived resolver threads.

use nix::sys::socket::{self, sockopt, AddressFamily, SockFlag, SockType};
use nodelink_core::SocketError;
use std::mem;
use std::net::{Ipv4Addr, Shutdown, SocketAddr, ToSocketAddrs};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

/// Result of a non-blocking transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transfer {
    /// Bytes moved; 0 from a read means end of stream
    Done(usize),
    WouldBlock,
}

fn last_error() -> SocketError {
    SocketError::last_os_error()
}

fn errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        const ATOMIC_SOCK_FLAGS: bool = true;
        const SOCK_STREAM_FLAGS: libc::c_int = libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC;
        const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
        const PAIR_FLAGS: SockFlag = SockFlag::SOCK_NONBLOCK.union(SockFlag::SOCK_CLOEXEC);

        unsafe fn accept_raw(fd: RawFd, addr: *mut libc::sockaddr, len: *mut libc::socklen_t) -> RawFd {
            libc::accept4(fd, addr, len, libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC)
        }
    } else {
        const ATOMIC_SOCK_FLAGS: bool = false;
        const SOCK_STREAM_FLAGS: libc::c_int = libc::SOCK_STREAM;
        const SEND_FLAGS: libc::c_int = 0;
        const PAIR_FLAGS: SockFlag = SockFlag::empty();

        unsafe fn accept_raw(fd: RawFd, addr: *mut libc::sockaddr, len: *mut libc::socklen_t) -> RawFd {
            libc::accept(fd, addr, len)
        }
    }
}

fn sockaddr_in(ip: Ipv4Addr, port: u16) -> libc::sockaddr_in {
    let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
    addr.sin_family = libc::AF_INET as libc::sa_family_t;
    addr.sin_port = port.to_be();
    addr.sin_addr.s_addr = u32::from(ip).to_be();
    addr
}

fn from_sockaddr_in(addr: &libc::sockaddr_in) -> (Ipv4Addr, u16) {
    (
        Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr)),
        u16::from_be(addr.sin_port),
    )
}

fn set_nonblocking(fd: RawFd) -> Result<(), SocketError> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(last_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(last_error());
    }
    Ok(())
}

fn tcp_socket() -> Result<OwnedFd, SocketError> {
    let fd = unsafe { libc::socket(libc::AF_INET, SOCK_STREAM_FLAGS, 0) };
    if fd < 0 {
        return Err(last_error());
    }
    let owned = unsafe { OwnedFd::from_raw_fd(fd) };
    if !ATOMIC_SOCK_FLAGS {
        set_nonblocking(fd)?;
        unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) };
    }
    Ok(owned)
}

fn set_nodelay(fd: &OwnedFd) {
    // best effort; not all stream sockets are TCP
    let _ = socket::setsockopt(fd, sockopt::TcpNoDelay, &true);
}

/// Bind and listen; returns the socket and the bound port
pub fn bind_listener(ip: Ipv4Addr, port: u16, backlog: i32) -> Result<(OwnedFd, u16), SocketError> {
    let fd = tcp_socket()?;
    socket::setsockopt(&fd, sockopt::ReuseAddr, &true).map_err(|e| SocketError::from_errno(e as i32))?;

    let addr = sockaddr_in(ip, port);
    let ret = unsafe {
        libc::bind(
            fd.as_raw_fd(),
            &addr as *const _ as *const libc::sockaddr,
            mem::size_of_val(&addr) as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(last_error());
    }
    if unsafe { libc::listen(fd.as_raw_fd(), backlog) } != 0 {
        return Err(last_error());
    }

    let mut bound: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut len = mem::size_of_val(&bound) as libc::socklen_t;
    let ret = unsafe {
        libc::getsockname(
            fd.as_raw_fd(),
            &mut bound as *mut _ as *mut libc::sockaddr,
            &mut len,
        )
    };
    if ret != 0 {
        return Err(last_error());
    }
    Ok((fd, from_sockaddr_in(&bound).1))
}

/// Start a non-blocking connect, from `local_port` if given
///
/// Success means the attempt is in flight (EINPROGRESS, or an immediate
/// connect, which completion checking treats the same way).
pub fn connect_nonblocking(ip: Ipv4Addr, port: u16, local_port: Option<u16>) -> Result<OwnedFd, SocketError> {
    let fd = tcp_socket()?;
    set_nodelay(&fd);
    if let Some(local) = local_port {
        socket::setsockopt(&fd, sockopt::ReuseAddr, &true).map_err(|e| SocketError::from_errno(e as i32))?;
        let addr = sockaddr_in(Ipv4Addr::UNSPECIFIED, local);
        let ret = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &addr as *const _ as *const libc::sockaddr,
                mem::size_of_val(&addr) as libc::socklen_t,
            )
        };
        if ret != 0 {
            return Err(last_error());
        }
    }
    let addr = sockaddr_in(ip, port);
    let ret = unsafe {
        libc::connect(
            fd.as_raw_fd(),
            &addr as *const _ as *const libc::sockaddr,
            mem::size_of_val(&addr) as libc::socklen_t,
        )
    };
    if ret != 0 {
        let err = errno();
        if err != libc::EINPROGRESS {
            return Err(SocketError::from_errno(err));
        }
    }
    Ok(fd)
}

/// The local port is held by someone else
pub fn port_unusable(err: &SocketError) -> bool {
    err.errno == libc::EADDRINUSE
}

/// Outcome of an asynchronous connect, read from SO_ERROR
pub fn take_socket_error(fd: &OwnedFd) -> Result<(), SocketError> {
    match socket::getsockopt(fd, sockopt::SocketError) {
        Ok(0) => Ok(()),
        Ok(err) => Err(SocketError::from_errno(err)),
        Err(e) => Err(SocketError::from_errno(e as i32)),
    }
}

/// Accept one pending connection, `None` if there is none
pub fn accept(listener: &OwnedFd) -> Result<Option<(OwnedFd, Ipv4Addr, u16)>, SocketError> {
    let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut len = mem::size_of_val(&addr) as libc::socklen_t;
    let fd = loop {
        let fd = unsafe {
            accept_raw(
                listener.as_raw_fd(),
                &mut addr as *mut _ as *mut libc::sockaddr,
                &mut len,
            )
        };
        if fd >= 0 {
            break fd;
        }
        match errno() {
            libc::EINTR => continue,
            e if e == libc::EAGAIN || e == libc::EWOULDBLOCK || e == libc::ECONNABORTED => {
                return Ok(None)
            }
            e => return Err(SocketError::from_errno(e)),
        }
    };
    let owned = unsafe { OwnedFd::from_raw_fd(fd) };
    if !ATOMIC_SOCK_FLAGS {
        set_nonblocking(fd)?;
    }
    set_nodelay(&owned);
    let (ip, port) = from_sockaddr_in(&addr);
    Ok(Some((owned, ip, port)))
}

/// Connected pair of local stream sockets
pub fn socketpair() -> Result<(OwnedFd, OwnedFd), SocketError> {
    let (a, b) = socket::socketpair(AddressFamily::Unix, SockType::Stream, None, PAIR_FLAGS)
        .map_err(|e| SocketError::from_errno(e as i32))?;
    if !ATOMIC_SOCK_FLAGS {
        set_nonblocking(a.as_raw_fd())?;
        set_nonblocking(b.as_raw_fd())?;
    }
    Ok((a, b))
}

/// Non-blocking read into `buf`
pub fn read(fd: &OwnedFd, buf: &mut [u8]) -> Result<Transfer, SocketError> {
    loop {
        let n = unsafe { libc::read(fd.as_raw_fd(), buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n >= 0 {
            return Ok(Transfer::Done(n as usize));
        }
        match errno() {
            libc::EINTR => continue,
            e if e == libc::EAGAIN || e == libc::EWOULDBLOCK => return Ok(Transfer::WouldBlock),
            e => return Err(SocketError::from_errno(e)),
        }
    }
}

/// Non-blocking send; never raises SIGPIPE
pub fn send(fd: &OwnedFd, buf: &[u8]) -> Result<Transfer, SocketError> {
    loop {
        let n = unsafe {
            libc::send(fd.as_raw_fd(), buf.as_ptr() as *const libc::c_void, buf.len(), SEND_FLAGS)
        };
        if n >= 0 {
            return Ok(Transfer::Done(n as usize));
        }
        match errno() {
            libc::EINTR => continue,
            e if e == libc::EAGAIN || e == libc::EWOULDBLOCK => return Ok(Transfer::WouldBlock),
            e => return Err(SocketError::from_errno(e)),
        }
    }
}

/// Half-close; errors (e.g. ENOTCONN after a reset) are ignored
pub fn shutdown(fd: &OwnedFd, how: Shutdown) {
    let side = match how {
        Shutdown::Read => socket::Shutdown::Read,
        Shutdown::Write => socket::Shutdown::Write,
        Shutdown::Both => socket::Shutdown::Both,
    };
    if let Err(e) = socket::shutdown(fd.as_raw_fd(), side) {
        tracing::trace!("shutdown({:?}) on fd {}: {}", how, fd.as_raw_fd(), e);
    }
}

/// poll(2) over `fds`; EINTR counts as a timeout
pub fn poll(fds: &mut [libc::pollfd], timeout_ms: i32) -> Result<usize, SocketError> {
    let n = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
    if n < 0 {
        if errno() == libc::EINTR {
            return Ok(0);
        }
        return Err(last_error());
    }
    Ok(n as usize)
}

/// Resolve a hostname (or dotted quad) to an IPv4 address
///
/// Name lookups block, so the reactor never calls this for a name.
pub fn resolve(hostname: &str, port: u16) -> Result<Ipv4Addr, SocketError> {
    if let Ok(ip) = hostname.parse::<Ipv4Addr>() {
        return Ok(ip);
    }
    let addrs = (hostname, port).to_socket_addrs().map_err(SocketError::from)?;
    for addr in addrs {
        if let SocketAddr::V4(v4) = addr {
            return Ok(*v4.ip());
        }
    }
    Err(SocketError::new(
        libc::EHOSTUNREACH,
        format!("{}: no IPv4 address", hostname),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::time::Duration;

    fn wait_writable(fd: &OwnedFd) {
        let mut pfd = [libc::pollfd { fd: fd.as_raw_fd(), events: libc::POLLOUT, revents: 0 }];
        poll(&mut pfd, 2000).unwrap();
    }

    #[test]
    fn test_listen_connect_accept() {
        let (listener, port) = bind_listener(Ipv4Addr::LOCALHOST, 0, 10).unwrap();
        assert_ne!(port, 0);
        let client = connect_nonblocking(Ipv4Addr::LOCALHOST, port, None).unwrap();
        wait_writable(&client);
        take_socket_error(&client).unwrap();

        let mut accepted = None;
        for _ in 0..100 {
            if let Some(a) = accept(&listener).unwrap() {
                accepted = Some(a);
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        let (server, ip, _) = accepted.expect("no inbound connection");
        assert_eq!(ip, Ipv4Addr::LOCALHOST);

        assert_eq!(send(&client, b"hello").unwrap(), Transfer::Done(5));
        let mut buf = [0u8; 16];
        let mut got = 0;
        for _ in 0..100 {
            if let Transfer::Done(n) = read(&server, &mut buf[got..]).unwrap() {
                got += n;
                if got == 5 {
                    break;
                }
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(&buf[..5], b"hello");
    }

    #[test]
    fn test_connect_from_client_port() {
        let (listener, port) = bind_listener(Ipv4Addr::LOCALHOST, 0, 10).unwrap();
        let local = {
            let (_spare, local) = bind_listener(Ipv4Addr::LOCALHOST, 0, 1).unwrap();
            local
        };
        let client = connect_nonblocking(Ipv4Addr::LOCALHOST, port, Some(local)).unwrap();
        wait_writable(&client);
        take_socket_error(&client).unwrap();

        let mut accepted = None;
        for _ in 0..100 {
            if let Some(a) = accept(&listener).unwrap() {
                accepted = Some(a);
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        let (_server, _, from) = accepted.expect("no inbound connection");
        assert_eq!(from, local);
    }

    #[test]
    fn test_accept_without_pending() {
        let (listener, _) = bind_listener(Ipv4Addr::LOCALHOST, 0, 10).unwrap();
        assert!(accept(&listener).unwrap().is_none());
    }

    #[test]
    fn test_connect_refused() {
        // Grab a free port, then close it so nothing listens there.
        let port = {
            let (_l, port) = bind_listener(Ipv4Addr::LOCALHOST, 0, 1).unwrap();
            port
        };
        let fd = connect_nonblocking(Ipv4Addr::LOCALHOST, port, None);
        let failed = match fd {
            Err(_) => true,
            Ok(fd) => {
                wait_writable(&fd);
                take_socket_error(&fd).is_err()
            }
        };
        assert!(failed);
    }

    #[test]
    fn test_socketpair_half_close() {
        let (a, b) = socketpair().unwrap();
        assert_eq!(read(&b, &mut [0u8; 4]).unwrap(), Transfer::WouldBlock);
        send(&a, b"x").unwrap();
        shutdown(&a, Shutdown::Write);
        let mut buf = [0u8; 4];
        assert_eq!(read(&b, &mut buf).unwrap(), Transfer::Done(1));
        assert_eq!(read(&b, &mut buf).unwrap(), Transfer::Done(0));
    }

    #[test]
    fn test_resolve() {
        assert_eq!(resolve("10.1.2.3", 80).unwrap(), Ipv4Addr::new(10, 1, 2, 3));
        assert_eq!(resolve("localhost", 80).unwrap(), Ipv4Addr::LOCALHOST);
    }

    #[test]
    fn test_bound_listener_is_reachable_by_std() {
        let (_listener, port) = bind_listener(Ipv4Addr::LOCALHOST, 0, 10).unwrap();
        let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        stream.set_read_timeout(Some(Duration::from_millis(20))).unwrap();
        stream.write_all(b"x").unwrap();
        let mut buf = [0u8; 1];
        assert!(stream.read(&mut buf).is_err());
    }
}
