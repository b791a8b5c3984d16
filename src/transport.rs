//! Transport abstraction
//!
//! The session engine owns PDU framing and only needs a byte stream from its
//! transport. TCP is the only production implementation; tests plug in an
//! in-memory transport through the same trait.

use crate::error::{IscsiError, IscsiResult};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::time::Duration;

/// Default iSCSI port
pub const ISCSI_PORT: u16 = 3260;

/// Readiness the engine wants from the caller's event loop
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Interest {
    pub read: bool,
    pub write: bool,
}

impl Interest {
    pub const NONE: Interest = Interest {
        read: false,
        write: false,
    };
    pub const READ: Interest = Interest {
        read: true,
        write: false,
    };
    pub const WRITE: Interest = Interest {
        read: false,
        write: true,
    };
    pub const READ_WRITE: Interest = Interest {
        read: true,
        write: true,
    };

    pub fn is_empty(&self) -> bool {
        !self.read && !self.write
    }

    /// `poll(2)` event mask
    pub fn to_poll_events(self) -> libc::c_short {
        let mut events = 0;
        if self.read {
            events |= libc::POLLIN;
        }
        if self.write {
            events |= libc::POLLOUT;
        }
        events
    }
}

/// Readiness reported back to [`crate::IscsiContext::service`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
    pub hangup: bool,
}

impl Readiness {
    pub const NONE: Readiness = Readiness {
        readable: false,
        writable: false,
        error: false,
        hangup: false,
    };
    pub const READABLE: Readiness = Readiness {
        readable: true,
        writable: false,
        error: false,
        hangup: false,
    };
    pub const WRITABLE: Readiness = Readiness {
        readable: false,
        writable: true,
        error: false,
        hangup: false,
    };
    pub const READ_WRITE: Readiness = Readiness {
        readable: true,
        writable: true,
        error: false,
        hangup: false,
    };

    /// Translate `poll(2)` revents
    pub fn from_poll_events(revents: libc::c_short) -> Self {
        Readiness {
            readable: revents & libc::POLLIN != 0,
            writable: revents & libc::POLLOUT != 0,
            error: revents & (libc::POLLERR | libc::POLLNVAL) != 0,
            hangup: revents & libc::POLLHUP != 0,
        }
    }
}

/// A byte-stream transport for one iSCSI connection.
///
/// `read` and `write` must not block: they return `WouldBlock` when no
/// progress can be made. Connection completion is reported through
/// writability, mirroring a non-blocking `connect(2)`.
pub trait Transport {
    /// Start connecting to `portal` (`host[:port][,tpgt]`)
    fn connect(&mut self, portal: &str) -> io::Result<()>;

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Longest a connect may stay in progress before it is abandoned
    fn connect_timeout(&self) -> Option<Duration> {
        None
    }

    /// Pending socket error, checked when a connect completes
    fn take_error(&mut self) -> io::Result<Option<io::Error>> {
        Ok(None)
    }

    /// Close the connection. Must be safe to call when not connected.
    fn disconnect(&mut self);

    /// File descriptor for external event loops
    fn raw_fd(&self) -> Option<RawFd>;

    /// Block until the transport is ready for `interest` or `timeout` expires
    fn wait(&mut self, interest: Interest, timeout: Duration) -> io::Result<Readiness> {
        match self.raw_fd() {
            Some(fd) => poll_fd(fd, interest, timeout),
            None => {
                std::thread::sleep(timeout);
                Ok(Readiness::NONE)
            }
        }
    }
}

/// Single `poll(2)` on one descriptor
pub fn poll_fd(fd: RawFd, interest: Interest, timeout: Duration) -> io::Result<Readiness> {
    let mut pfd = libc::pollfd {
        fd,
        events: interest.to_poll_events(),
        revents: 0,
    };
    let timeout_ms = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;

    // SAFETY: pfd is a valid pollfd for the duration of the call and nfds is 1.
    let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
    if rc < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(Readiness::NONE);
        }
        return Err(err);
    }
    Ok(Readiness::from_poll_events(pfd.revents))
}

/// Resolve a portal string into socket addresses.
///
/// Accepts `host`, `host:port`, `[v6]`, `[v6]:port`, each optionally followed
/// by a `,tpgt` suffix as returned by SendTargets.
pub fn resolve_portal(portal: &str) -> IscsiResult<Vec<SocketAddr>> {
    let portal = portal.split(',').next().unwrap_or(portal).trim();
    if portal.is_empty() {
        return Err(IscsiError::Config("empty portal address".to_string()));
    }

    let (host, port) = if let Some(rest) = portal.strip_prefix('[') {
        let end = rest
            .find(']')
            .ok_or_else(|| IscsiError::Config(format!("unterminated IPv6 address in '{}'", portal)))?;
        let host = &rest[..end];
        let port = match rest[end + 1..].strip_prefix(':') {
            Some(p) => parse_port(p, portal)?,
            None => ISCSI_PORT,
        };
        (host.to_string(), port)
    } else if portal.matches(':').count() > 1 {
        // bare IPv6 literal without port
        (portal.to_string(), ISCSI_PORT)
    } else {
        match portal.rsplit_once(':') {
            Some((host, port)) => (host.to_string(), parse_port(port, portal)?),
            None => (portal.to_string(), ISCSI_PORT),
        }
    };

    let addrs: Vec<SocketAddr> = (host.as_str(), port)
        .to_socket_addrs()
        .map_err(|e| IscsiError::Config(format!("cannot resolve portal '{}': {}", portal, e)))?
        .collect();
    if addrs.is_empty() {
        return Err(IscsiError::Config(format!("portal '{}' resolved to no addresses", portal)));
    }
    Ok(addrs)
}

fn parse_port(port: &str, portal: &str) -> IscsiResult<u16> {
    port.parse::<u16>()
        .map_err(|_| IscsiError::Config(format!("invalid port in portal '{}'", portal)))
}

/// TCP socket options applied on connect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpOptions {
    /// Keepalive probes before the connection is declared dead
    pub keepalive_count: u32,
    /// Seconds between keepalive probes
    pub keepalive_interval: u32,
    /// Idle seconds before the first keepalive probe
    pub keepalive_idle: u32,
    /// SYN retransmits (Linux only)
    pub syn_count: Option<u32>,
    /// Upper bound on establishing the TCP connection
    pub connect_timeout: Duration,
}

impl Default for TcpOptions {
    fn default() -> Self {
        TcpOptions {
            keepalive_count: 3,
            keepalive_interval: 30,
            keepalive_idle: 30,
            syn_count: None,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl TcpOptions {
    /// Defaults overridden by `ISCSI_TCP_KEEPCNT`, `ISCSI_TCP_KEEPINTVL`,
    /// `ISCSI_TCP_KEEPIDLE` and `ISCSI_TCP_SYNCNT`
    pub fn from_env() -> Self {
        let mut opts = TcpOptions::default();
        let var = |name: &str| std::env::var(name).ok().and_then(|v| v.trim().parse::<u32>().ok());
        if let Some(v) = var("ISCSI_TCP_KEEPCNT") {
            opts.keepalive_count = v;
        }
        if let Some(v) = var("ISCSI_TCP_KEEPINTVL") {
            opts.keepalive_interval = v;
        }
        if let Some(v) = var("ISCSI_TCP_KEEPIDLE") {
            opts.keepalive_idle = v;
        }
        if let Some(v) = var("ISCSI_TCP_SYNCNT") {
            opts.syn_count = Some(v);
        }
        opts
    }
}

/// TCP transport
#[derive(Debug, Default)]
pub struct TcpTransport {
    stream: Option<TcpStream>,
    options: TcpOptions,
}

impl TcpTransport {
    pub fn new(options: TcpOptions) -> Self {
        TcpTransport {
            stream: None,
            options,
        }
    }

    fn stream(&mut self) -> io::Result<&mut TcpStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "transport is not connected"))
    }

    fn apply_options(&self, stream: &TcpStream) -> io::Result<()> {
        stream.set_nodelay(true)?;
        let fd = stream.as_raw_fd();
        set_sockopt(fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, 1)?;
        #[cfg(target_os = "linux")]
        {
            set_sockopt(fd, libc::IPPROTO_TCP, libc::TCP_KEEPCNT, self.options.keepalive_count)?;
            set_sockopt(fd, libc::IPPROTO_TCP, libc::TCP_KEEPINTVL, self.options.keepalive_interval)?;
            set_sockopt(fd, libc::IPPROTO_TCP, libc::TCP_KEEPIDLE, self.options.keepalive_idle)?;
            if let Some(syn_count) = self.options.syn_count {
                set_sockopt(fd, libc::IPPROTO_TCP, libc::TCP_SYNCNT, syn_count)?;
            }
        }
        Ok(())
    }
}

fn set_sockopt(fd: RawFd, level: libc::c_int, name: libc::c_int, value: u32) -> io::Result<()> {
    let value = value.min(libc::c_int::MAX as u32) as libc::c_int;
    // SAFETY: value lives across the call and the length matches its type.
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &value as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Unconnected stream socket for `addr`'s family
fn new_socket(addr: &SocketAddr) -> io::Result<TcpStream> {
    let domain = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };
    // SAFETY: plain socket(2) call; the descriptor is owned by the TcpStream below.
    let fd = unsafe { libc::socket(domain, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: fd is a freshly created socket nobody else owns.
    let stream = unsafe { TcpStream::from_raw_fd(fd) };
    // SAFETY: fd is valid; FD_CLOEXEC is a plain flag update.
    unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) };
    Ok(stream)
}

fn sockaddr_of(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    // SAFETY: all-zero is a valid sockaddr_storage.
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(v4) => {
            // SAFETY: sockaddr_storage is large enough and suitably aligned for sockaddr_in.
            let sin = unsafe { &mut *(&mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_in) };
            sin.sin_family = libc::AF_INET as libc::sa_family_t;
            sin.sin_port = v4.port().to_be();
            sin.sin_addr = libc::in_addr {
                s_addr: u32::from_ne_bytes(v4.ip().octets()),
            };
            std::mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(v6) => {
            // SAFETY: sockaddr_storage is large enough and suitably aligned for sockaddr_in6.
            let sin6 = unsafe { &mut *(&mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_in6) };
            sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sin6.sin6_port = v6.port().to_be();
            sin6.sin6_flowinfo = v6.flowinfo();
            sin6.sin6_addr = libc::in6_addr {
                s6_addr: v6.ip().octets(),
            };
            sin6.sin6_scope_id = v6.scope_id();
            std::mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as libc::socklen_t)
}

impl Transport for TcpTransport {
    /// Start a non-blocking connect to the first address of `portal`.
    ///
    /// Returns once the SYN is on its way; completion shows up as
    /// writability and is checked with [`Transport::take_error`].
    fn connect(&mut self, portal: &str) -> io::Result<()> {
        self.disconnect();
        let addrs = resolve_portal(portal)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
        let addr = addrs[0];

        let stream = new_socket(&addr)?;
        stream.set_nonblocking(true)?;
        // SYNCNT has to be in place before the SYN goes out
        if let Err(e) = self.apply_options(&stream) {
            log::warn!("Failed to set socket options for {}: {}", addr, e);
        }

        let (storage, len) = sockaddr_of(&addr);
        // SAFETY: storage holds a sockaddr of `len` bytes matching addr's family.
        let rc = unsafe {
            libc::connect(
                stream.as_raw_fd(),
                &storage as *const libc::sockaddr_storage as *const libc::sockaddr,
                len,
            )
        };
        if rc != 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINPROGRESS) {
                log::debug!("TCP connect to {} failed: {}", addr, err);
                return Err(err);
            }
        }
        log::debug!("TCP connect to {} in progress", addr);
        self.stream = Some(stream);
        Ok(())
    }

    fn connect_timeout(&self) -> Option<Duration> {
        Some(self.options.connect_timeout)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream()?.read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream()?.write(buf)
    }

    fn take_error(&mut self) -> io::Result<Option<io::Error>> {
        match self.stream.as_ref() {
            Some(stream) => stream.take_error(),
            None => Ok(None),
        }
    }

    fn disconnect(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    fn raw_fd(&self) -> Option<RawFd> {
        self.stream.as_ref().map(|s| s.as_raw_fd())
    }
}
