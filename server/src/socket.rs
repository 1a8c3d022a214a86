//! Non-blocking socket wrappers driven once per reactor tick.
//!
//! Nothing in here awaits. Every call is a single `try_*` attempt against a
//! tokio socket; a would-block result simply means "try again next tick".
//! Errors latch on the wrapper and are never retried in place.

use crate::address::{self, Family};
use log::{debug, warn};
use socket2::{Domain, Protocol, SockAddr, SockRef, Socket, TcpKeepalive, Type};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::net::{TcpStream, UdpSocket as TokioUdpSocket};

/// Bytes pulled from the kernel per receive attempt.
const RECV_CHUNK: usize = 8192;
/// Datagrams larger than this are truncated.
pub const UDP_BUFFER_SIZE: usize = 1024;
pub const KEEPALIVE_TIME: Duration = Duration::from_secs(180);
pub const LISTEN_BACKLOG: i32 = 8;

static NEXT_SOCKET_ID: AtomicU64 = AtomicU64::new(1);

/// Latched transport failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketError {
    pub kind: io::ErrorKind,
    pub message: String,
}

impl From<&io::Error> for SocketError {
    fn from(e: &io::Error) -> Self {
        Self {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

fn would_block(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
}

fn apply_stream_options(socket: SockRef<'_>) {
    let keepalive = TcpKeepalive::new().with_time(KEEPALIVE_TIME);
    if let Err(e) = socket.set_tcp_keepalive(&keepalive) {
        debug!("set_tcp_keepalive: {}", e);
    }
    if let Err(e) = socket.set_nodelay(true) {
        debug!("set_nodelay: {}", e);
    }
}

/// A connected TCP stream with buffered receive and send sides.
#[derive(Debug)]
pub struct StreamIoSocket {
    id: u64,
    stream: Option<TcpStream>,
    remote: SocketAddr,
    local_port: u16,
    recv_buffer: Vec<u8>,
    send_buffer: Vec<u8>,
    last_recv: Instant,
    error: Option<SocketError>,
    has_fin: bool,
    log_errors: bool,
}

impl StreamIoSocket {
    /// Wraps an already-connected stream. `local_port` names the listener.
    pub fn new(stream: TcpStream, remote: SocketAddr, local_port: u16) -> Self {
        Self {
            id: NEXT_SOCKET_ID.fetch_add(1, Ordering::Relaxed),
            stream: Some(stream),
            remote: address::normalize(remote),
            local_port,
            recv_buffer: Vec::new(),
            send_buffer: Vec::new(),
            last_recv: Instant::now(),
            error: None,
            has_fin: false,
            log_errors: false,
        }
    }

    /// Identity that survives every ownership transfer.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn port_bytes(&self) -> [u8; 2] {
        address::port_bytes(self.local_port)
    }

    pub fn set_log_errors(&mut self, on: bool) {
        self.log_errors = on;
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some() && self.error.is_none() && !self.has_fin
    }

    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn has_fin(&self) -> bool {
        self.has_fin
    }

    pub fn error_string(&self) -> String {
        match &self.error {
            Some(e) => e.message.clone(),
            None if self.has_fin => "connection closed by peer".to_string(),
            None => "no error".to_string(),
        }
    }

    pub fn last_recv(&self) -> Instant {
        self.last_recv
    }

    fn latch(&mut self, e: &io::Error) {
        if self.log_errors {
            warn!("[SOCKET] {} error: {}", self.remote, e);
        } else {
            debug!("[SOCKET] {} error: {}", self.remote, e);
        }
        self.error = Some(SocketError::from(e));
    }

    /// One receive attempt. Returns whether any bytes arrived.
    pub fn do_recv(&mut self) -> bool {
        if !self.is_connected() {
            return false;
        }
        let Some(stream) = self.stream.as_ref() else {
            return false;
        };
        let mut chunk = [0u8; RECV_CHUNK];
        match stream.try_read(&mut chunk) {
            Ok(0) => {
                self.has_fin = true;
                false
            }
            Ok(n) => {
                self.recv_buffer.extend_from_slice(&chunk[..n]);
                self.last_recv = Instant::now();
                true
            }
            Err(e) if would_block(&e) => false,
            Err(e) => {
                self.latch(&e);
                false
            }
        }
    }

    /// Flushes as much of the send buffer as the kernel takes in one call.
    pub fn do_send(&mut self) {
        if self.send_buffer.is_empty() || !self.is_connected() {
            return;
        }
        let Some(stream) = self.stream.as_ref() else {
            return;
        };
        match stream.try_write(&self.send_buffer) {
            Ok(n) => {
                self.send_buffer.drain(..n);
            }
            Err(e) if would_block(&e) => {}
            Err(e) => self.latch(&e),
        }
    }

    /// Reads and drops one chunk. Used while draining kicked sockets.
    pub fn discard(&mut self) {
        if !self.is_connected() {
            return;
        }
        let Some(stream) = self.stream.as_ref() else {
            return;
        };
        let mut chunk = [0u8; RECV_CHUNK];
        match stream.try_read(&mut chunk) {
            Ok(0) => self.has_fin = true,
            Ok(_) => self.last_recv = Instant::now(),
            Err(e) if would_block(&e) => {}
            Err(e) => self.latch(&e),
        }
    }

    /// Queues bytes for the next [`StreamIoSocket::do_send`].
    pub fn put_bytes(&mut self, data: &[u8]) {
        self.send_buffer.extend_from_slice(data);
    }

    pub fn recv_buffer(&self) -> &[u8] {
        &self.recv_buffer
    }

    pub fn send_buffer_is_empty(&self) -> bool {
        self.send_buffer.is_empty()
    }

    /// Moves the receive buffer out so it can be parsed while the socket
    /// itself stays mutably borrowable.
    pub fn take_recv_buffer(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.recv_buffer)
    }

    /// Puts unparsed bytes back in front of anything received since.
    pub fn restore_recv_buffer(&mut self, mut unparsed: Vec<u8>) {
        unparsed.append(&mut self.recv_buffer);
        self.recv_buffer = unparsed;
    }

    pub fn clear_recv_buffer(&mut self) {
        self.recv_buffer.clear();
    }

    /// Drops the OS handle and both buffers.
    pub fn close(&mut self) {
        self.stream = None;
        self.recv_buffer.clear();
        self.send_buffer.clear();
    }
}

/// Listening socket for one game host port.
///
/// The listener stays a plain non-blocking std socket; accepted streams are
/// handed to tokio.
#[derive(Debug)]
pub struct TcpServer {
    listener: std::net::TcpListener,
    port: u16,
}

impl TcpServer {
    /// Binds with backlog 8. Port `0` is resolved through `getsockname`.
    pub fn listen(bind: IpAddr, port: u16) -> io::Result<Self> {
        let addr = SocketAddr::new(bind, port);
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        if addr.is_ipv6() {
            socket.set_only_v6(false)?;
        }
        socket.bind(&SockAddr::from(addr))?;
        socket.listen(LISTEN_BACKLOG)?;
        socket.set_nonblocking(true)?;
        let listener = std::net::TcpListener::from(socket);
        let port = listener.local_addr()?.port();
        Ok(Self { listener, port })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn port_bytes(&self) -> [u8; 2] {
        address::port_bytes(self.port)
    }

    /// One accept attempt.
    pub fn accept(&self) -> Option<StreamIoSocket> {
        match self.listener.accept() {
            Ok((stream, remote)) => {
                if let Err(e) = stream.set_nonblocking(true) {
                    debug!("[TCP {}] set_nonblocking: {}", self.port, e);
                    return None;
                }
                apply_stream_options(SockRef::from(&stream));
                match TcpStream::from_std(stream) {
                    Ok(stream) => Some(StreamIoSocket::new(stream, remote, self.port)),
                    Err(e) => {
                        warn!("[TCP {}] failed to register stream: {}", self.port, e);
                        None
                    }
                }
            }
            Err(e) if would_block(&e) => None,
            Err(e) => {
                debug!("[TCP {}] accept: {}", self.port, e);
                None
            }
        }
    }
}

/// Progress of an outbound connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectProgress {
    Pending,
    Connected,
    Failed(SocketError),
}

fn connect_in_progress(e: &io::Error) -> bool {
    #[cfg(unix)]
    {
        if e.raw_os_error() == Some(libc::EINPROGRESS) {
            return true;
        }
    }
    would_block(e)
}

/// Outbound stream whose connect completes over later ticks.
#[derive(Debug)]
pub struct TcpClient {
    target: SocketAddr,
    pending: Option<TcpStream>,
    socket: Option<StreamIoSocket>,
    error: Option<SocketError>,
}

impl TcpClient {
    /// Starts a non-blocking connect. Immediate failures latch.
    pub fn connect(target: SocketAddr) -> Self {
        let mut client = Self {
            target,
            pending: None,
            socket: None,
            error: None,
        };
        match Self::start_connect(target) {
            Ok(stream) => client.pending = Some(stream),
            Err(e) => client.error = Some(SocketError::from(&e)),
        }
        client
    }

    fn start_connect(target: SocketAddr) -> io::Result<TcpStream> {
        let socket = Socket::new(Domain::for_address(target), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nonblocking(true)?;
        apply_stream_options(SockRef::from(&socket));
        match socket.connect(&SockAddr::from(target)) {
            Ok(()) => {}
            Err(e) if connect_in_progress(&e) => {}
            Err(e) => return Err(e),
        }
        TcpStream::from_std(std::net::TcpStream::from(socket))
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }

    /// Polls the connect. Once connected the stream becomes a
    /// [`StreamIoSocket`] reachable through [`TcpClient::socket_mut`].
    pub fn check_connect(&mut self) -> ConnectProgress {
        if let Some(error) = &self.error {
            return ConnectProgress::Failed(error.clone());
        }
        if self.socket.is_some() {
            return ConnectProgress::Connected;
        }
        let Some(stream) = self.pending.as_ref() else {
            return ConnectProgress::Pending;
        };
        let failure = match stream.take_error() {
            Ok(Some(e)) | Err(e) => Some(e),
            Ok(None) => None,
        };
        if let Some(e) = failure {
            self.pending = None;
            let error = SocketError::from(&e);
            self.error = Some(error.clone());
            return ConnectProgress::Failed(error);
        }
        match stream.peer_addr() {
            Ok(_) => {
                let local_port = stream.local_addr().map(|a| a.port()).unwrap_or(0);
                if let Some(stream) = self.pending.take() {
                    self.socket = Some(StreamIoSocket::new(stream, self.target, local_port));
                }
                ConnectProgress::Connected
            }
            Err(e) if e.kind() == io::ErrorKind::NotConnected => ConnectProgress::Pending,
            Err(e) => {
                self.pending = None;
                let error = SocketError::from(&e);
                self.error = Some(error.clone());
                ConnectProgress::Failed(error)
            }
        }
    }

    pub fn socket_mut(&mut self) -> Option<&mut StreamIoSocket> {
        self.socket.as_mut()
    }

    pub fn take_socket(&mut self) -> Option<StreamIoSocket> {
        self.socket.take()
    }

    pub fn close(&mut self) {
        self.pending = None;
        self.socket = None;
    }

    /// Closes and starts a fresh connect to the same target.
    pub fn reset(&mut self) {
        *self = Self::connect(self.target);
    }
}

/// One received datagram. Never retained past a single dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpPkt {
    pub sender: SocketAddr,
    pub data: Vec<u8>,
}

/// UDP socket used for LAN discovery, relaying and broadcast.
#[derive(Debug)]
pub struct UdpSocket {
    socket: TokioUdpSocket,
    family: Family,
    port: u16,
}

impl UdpSocket {
    pub fn bind(addr: SocketAddr, broadcast: bool) -> io::Result<Self> {
        let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        if addr.is_ipv6() {
            socket.set_only_v6(false)?;
        }
        if broadcast {
            socket.set_broadcast(true)?;
        }
        socket.bind(&SockAddr::from(addr))?;
        socket.set_nonblocking(true)?;
        let socket = TokioUdpSocket::from_std(std::net::UdpSocket::from(socket))?;
        let port = socket.local_addr()?.port();
        Ok(Self {
            socket,
            family: Family::of(&addr),
            port,
        })
    }

    pub fn family(&self) -> Family {
        self.family
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn port_bytes(&self) -> [u8; 2] {
        address::port_bytes(self.port)
    }

    /// Sends one datagram, translating between IPv4 and IPv4-mapped IPv6
    /// when the destination family differs from the socket's.
    pub fn send_to(&self, dest: SocketAddr, data: &[u8]) -> bool {
        let Some(dest) = address::translate_for(self.family, dest) else {
            debug!("[UDP {}] cannot reach {} from this family", self.port, dest);
            return false;
        };
        match self.socket.try_send_to(data, dest) {
            Ok(_) => true,
            Err(e) => {
                debug!("[UDP {}] send to {} failed: {}", self.port, dest, e);
                false
            }
        }
    }

    pub fn broadcast(&self, target: Ipv4Addr, port: u16, data: &[u8]) -> bool {
        self.send_to(SocketAddr::new(IpAddr::V4(target), port), data)
    }

    /// One receive attempt.
    pub fn recv(&self) -> Option<UdpPkt> {
        let mut buf = [0u8; UDP_BUFFER_SIZE];
        match self.socket.try_recv_from(&mut buf) {
            Ok((n, sender)) => Some(UdpPkt {
                sender,
                data: buf[..n].to_vec(),
            }),
            Err(e) if would_block(&e) => None,
            Err(e) => {
                debug!("[UDP {}] recv failed: {}", self.port, e);
                None
            }
        }
    }

    /// Bypasses routing tables so LAN announcements stay on the interface.
    #[cfg(unix)]
    pub fn set_dont_route(&self, on: bool) -> io::Result<()> {
        use std::os::fd::AsRawFd;
        let value: libc::c_int = on as libc::c_int;
        let rc = unsafe {
            libc::setsockopt(
                self.socket.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_DONTROUTE,
                &value as *const libc::c_int as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(not(unix))]
    pub fn set_dont_route(&self, _on: bool) -> io::Result<()> {
        Ok(())
    }
}
