//! Transport connections between participants.
//!
//! This module provides a blocking [`Listener`] with bounded-time accepts,
//! a framed [`Connection`] to one peer, and [`receive_any`], which waits for
//! the first of many connections to become readable.

use std::fmt;
use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use tracing::{debug, info, warn};

use meshconf_protocol::{Endpoint, FrameReader, FrameWriter, Message};

use crate::error::{EngineResult, Error};
use crate::secure::{SecureChannel, SecureStream};
use crate::sync::lock;

const LISTENER_TOKEN: Token = Token(0);

/// A connected stream socket, TCP or local.
#[derive(Debug)]
pub enum Socket {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Socket {
    pub fn try_clone(&self) -> io::Result<Self> {
        Ok(match self {
            Self::Tcp(s) => Self::Tcp(s.try_clone()?),
            Self::Unix(s) => Self::Unix(s.try_clone()?),
        })
    }

    /// Applies to every clone of this socket.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        match self {
            Self::Tcp(s) => s.set_read_timeout(timeout),
            Self::Unix(s) => s.set_read_timeout(timeout),
        }
    }

    pub fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        match self {
            Self::Tcp(s) => s.set_write_timeout(timeout),
            Self::Unix(s) => s.set_write_timeout(timeout),
        }
    }

    /// Shuts down both directions. Blocked readers on any clone see EOF.
    pub fn shutdown(&self) -> io::Result<()> {
        match self {
            Self::Tcp(s) => s.shutdown(Shutdown::Both),
            Self::Unix(s) => s.shutdown(Shutdown::Both),
        }
    }

    fn describe_peer(&self) -> String {
        match self {
            Self::Tcp(s) => s
                .peer_addr()
                .map(|addr| addr.to_string())
                .unwrap_or_else(|_| "tcp:unknown".to_string()),
            Self::Unix(s) => s
                .peer_addr()
                .ok()
                .and_then(|addr| addr.as_pathname().map(|p| format!("file://{}", p.display())))
                .unwrap_or_else(|| "local".to_string()),
        }
    }
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            Self::Tcp(s) => s.as_raw_fd(),
            Self::Unix(s) => s.as_raw_fd(),
        }
    }
}

impl Read for Socket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(s) => s.read(buf),
            Self::Unix(s) => s.read(buf),
        }
    }
}

impl Write for Socket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(s) => s.write(buf),
            Self::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Tcp(s) => s.flush(),
            Self::Unix(s) => s.flush(),
        }
    }
}

enum ListenerKind {
    Tcp(TcpListener),
    Unix(UnixListener),
}

/// Listening socket with bounded-time accepts.
pub struct Listener {
    kind: ListenerKind,
    endpoint: Endpoint,
    poll: Poll,
    events: Events,
    /// Socket file to remove on drop.
    socket_path: Option<PathBuf>,
}

impl Listener {
    /// Binds `endpoint`.
    ///
    /// For local sockets, a leftover socket file nobody answers on is removed
    /// first when `cleanup_stale_socket` is set. TCP port 0 binds an
    /// ephemeral port; [`Listener::endpoint`] reports the real one.
    pub fn bind(endpoint: &Endpoint, cleanup_stale_socket: bool) -> EngineResult<Self> {
        let (kind, endpoint, socket_path) = match endpoint {
            Endpoint::Local(path) => {
                if let Some(parent) = path.parent()
                    && !parent.as_os_str().is_empty()
                    && !parent.exists()
                {
                    return Err(Error::InvalidAddress(format!(
                        "socket directory {} does not exist",
                        parent.display()
                    )));
                }

                if path.exists() {
                    if !cleanup_stale_socket {
                        return Err(Error::connection(format!(
                            "socket path already in use: {}",
                            path.display()
                        )));
                    }
                    if UnixStream::connect(path).is_ok() {
                        return Err(Error::connection(format!(
                            "another participant is listening on {}",
                            path.display()
                        )));
                    }
                    info!(path = %path.display(), "Removing stale socket");
                    std::fs::remove_file(path)?;
                }

                let listener = UnixListener::bind(path)?;
                (ListenerKind::Unix(listener), endpoint.clone(), Some(path.clone()))
            }
            ip => {
                let addr = ip
                    .socket_addr()
                    .ok_or_else(|| Error::InvalidAddress(ip.to_string()))?;
                let listener = TcpListener::bind(addr)?;
                let bound = Endpoint::from(listener.local_addr()?);
                (ListenerKind::Tcp(listener), bound, None)
            }
        };

        let poll = Poll::new()?;
        let fd = match &kind {
            ListenerKind::Tcp(l) => {
                l.set_nonblocking(true)?;
                l.as_raw_fd()
            }
            ListenerKind::Unix(l) => {
                l.set_nonblocking(true)?;
                l.as_raw_fd()
            }
        };
        poll.registry()
            .register(&mut SourceFd(&fd), LISTENER_TOKEN, Interest::READABLE)?;

        info!(%endpoint, "Listening for participants");
        Ok(Self {
            kind,
            endpoint,
            poll,
            events: Events::with_capacity(8),
            socket_path,
        })
    }

    /// The endpoint actually bound.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn try_accept(&self) -> EngineResult<Option<Socket>> {
        let accepted = match &self.kind {
            ListenerKind::Tcp(l) => l.accept().and_then(|(s, _)| {
                s.set_nonblocking(false)?;
                s.set_nodelay(true)?;
                Ok(Socket::Tcp(s))
            }),
            ListenerKind::Unix(l) => l.accept().and_then(|(s, _)| {
                s.set_nonblocking(false)?;
                Ok(Socket::Unix(s))
            }),
        };
        match accepted {
            Ok(socket) => Ok(Some(socket)),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Waits up to `timeout` for one inbound connection.
    ///
    /// Returns [`Error::ConnectionTimeout`] if nobody connected in time.
    pub fn accept(&mut self, timeout: Duration) -> EngineResult<Socket> {
        // readiness is edge-triggered: drain before waiting
        if let Some(socket) = self.try_accept()? {
            return Ok(socket);
        }
        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::Interrupted => return Err(Error::ConnectionTimeout),
            Err(e) => return Err(e.into()),
        }
        self.try_accept()?.ok_or(Error::ConnectionTimeout)
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Some(path) = &self.socket_path
            && path.exists()
        {
            if let Err(e) = std::fs::remove_file(path) {
                warn!(path = %path.display(), error = %e, "Failed to remove socket file");
            } else {
                debug!(path = %path.display(), "Removed socket file");
            }
        }
    }
}

/// Framed link to one peer.
///
/// Sending and receiving take `&self`; each direction has its own lock so
/// a broadcast never waits for a blocked reader.
pub struct Connection {
    socket: Socket,
    peer: String,
    io_timeout: Duration,
    reader: Mutex<FrameReader<Box<dyn Read + Send>>>,
    writer: Mutex<FrameWriter<Box<dyn Write + Send>>>,
    closed: AtomicBool,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl Connection {
    /// Connects to `endpoint` and wraps the socket as a client.
    pub fn connect(
        endpoint: &Endpoint,
        io_timeout: Duration,
        secure: &dyn SecureChannel,
    ) -> EngineResult<Self> {
        let socket = match endpoint {
            Endpoint::Local(path) => Socket::Unix(UnixStream::connect(path)?),
            ip => {
                let addr = ip
                    .socket_addr()
                    .ok_or_else(|| Error::InvalidAddress(ip.to_string()))?;
                let stream = TcpStream::connect_timeout(&addr, io_timeout)?;
                stream.set_nodelay(true)?;
                Socket::Tcp(stream)
            }
        };
        let halves = secure.wrap_client(&socket)?;
        debug!(%endpoint, "Connected");
        Self::establish(socket, halves, io_timeout)
    }

    /// Wraps an accepted socket as a server.
    pub fn accept(socket: Socket, io_timeout: Duration, secure: &dyn SecureChannel) -> EngineResult<Self> {
        let halves = secure.wrap_server(&socket)?;
        Self::establish(socket, halves, io_timeout)
    }

    fn establish(socket: Socket, halves: SecureStream, io_timeout: Duration) -> EngineResult<Self> {
        socket.set_read_timeout(Some(io_timeout))?;
        socket.set_write_timeout(Some(io_timeout))?;
        Ok(Self {
            peer: socket.describe_peer(),
            socket,
            io_timeout,
            reader: Mutex::new(FrameReader::new(halves.reader)),
            writer: Mutex::new(FrameWriter::new(halves.writer)),
            closed: AtomicBool::new(false),
        })
    }

    /// Human-readable peer address for logs.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Sends one message. The caller keeps ownership of `message`.
    pub fn send(&self, message: &Message) -> EngineResult<()> {
        let frame = message.encode()?;
        self.send_frame(&frame)
    }

    /// Sends a frame that was already encoded.
    pub(crate) fn send_frame(&self, frame: &[u8]) -> EngineResult<()> {
        lock(&self.writer).write_frame(frame)?;
        Ok(())
    }

    /// Reads one message, blocking up to the IO timeout.
    ///
    /// A clean end of stream is [`Error::ConnectionHangup`]; a stream ending
    /// inside a frame is [`Error::Connection`].
    pub fn receive(&self) -> EngineResult<Message> {
        match lock(&self.reader).read_message()? {
            Some(message) => Ok(message),
            None => Err(Error::ConnectionHangup),
        }
    }

    /// Like [`Connection::receive`] with a one-off timeout.
    pub fn receive_timeout(&self, timeout: Duration) -> EngineResult<Message> {
        self.socket.set_read_timeout(Some(timeout))?;
        let result = self.receive();
        self.socket.set_read_timeout(Some(self.io_timeout))?;
        result
    }

    /// Shuts the link down. Idempotent.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            // the peer may already be gone
            let _ = self.socket.shutdown();
            debug!(peer = %self.peer, "Connection closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

/// Outcome of [`receive_any`].
#[derive(Debug)]
pub enum Ready {
    /// A message arrived on `connections[index]`.
    Message { index: usize, message: Message },
    /// `connections[index]` was closed by the peer.
    Hangup { index: usize },
    /// Reading `connections[index]` failed.
    Failed { index: usize, error: Error },
    /// Nothing happened before the timeout.
    Timeout,
}

/// Waits up to `timeout` for any connection to become readable or closed
/// and reads one message from it.
///
/// `None` entries are skipped. A connection whose peer closed is reported as
/// [`Ready::Hangup`] ahead of readable ones, unless a complete message is
/// still queued on it: that message is delivered first.
///
/// # Errors
///
/// [`Error::NoValidConnections`] if every entry is `None`.
pub fn receive_any(connections: &[Option<Arc<Connection>>], timeout: Duration) -> EngineResult<Ready> {
    if connections.iter().all(Option::is_none) {
        return Err(Error::NoValidConnections);
    }

    let mut poll = Poll::new()?;
    for (index, connection) in connections.iter().enumerate() {
        if let Some(connection) = connection {
            let fd = connection.raw_fd();
            poll.registry()
                .register(&mut SourceFd(&fd), Token(index), Interest::READABLE)?;
        }
    }

    let mut events = Events::with_capacity(connections.len());
    match poll.poll(&mut events, Some(timeout)) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::Interrupted => return Ok(Ready::Timeout),
        Err(e) => return Err(e.into()),
    }

    let mut chosen = None;
    for event in events.iter() {
        let index = event.token().0;
        if event.is_read_closed() || event.is_error() {
            chosen = Some(index);
            break;
        }
        chosen.get_or_insert(index);
    }
    let Some(index) = chosen else {
        return Ok(Ready::Timeout);
    };
    let Some(connection) = connections.get(index).and_then(Option::as_ref) else {
        return Ok(Ready::Timeout);
    };

    Ok(match connection.receive() {
        Ok(message) => Ready::Message { index, message },
        Err(Error::ConnectionHangup) => Ready::Hangup { index },
        Err(error) => Ready::Failed { index, error },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secure::PlainChannel;
    use meshconf_protocol::{Reenter, Text};
    use std::thread;
    use std::time::Instant;

    fn pair() -> (Arc<Connection>, Arc<Connection>) {
        let (a, b) = UnixStream::pair().unwrap();
        let timeout = Duration::from_secs(2);
        (
            Arc::new(Connection::accept(Socket::Unix(a), timeout, &PlainChannel).unwrap()),
            Arc::new(Connection::accept(Socket::Unix(b), timeout, &PlainChannel).unwrap()),
        )
    }

    fn text(s: &str) -> Message {
        Message::Text(Text {
            part_id: 1,
            text: s.into(),
        })
    }

    #[test]
    fn send_receive() {
        let (a, b) = pair();
        let message = Message::Reenter(Reenter {
            conf_id: 1,
            part_id: 2,
        });
        a.send(&message).unwrap();
        assert_eq!(b.receive().unwrap(), message);
    }

    #[test]
    fn receive_after_close_is_hangup() {
        let (a, b) = pair();
        a.close();
        assert!(a.is_closed());
        assert!(matches!(b.receive(), Err(Error::ConnectionHangup)));
    }

    #[test]
    fn receive_timeout_expires() {
        let (_a, b) = pair();
        let started = Instant::now();
        assert!(matches!(
            b.receive_timeout(Duration::from_millis(50)),
            Err(Error::ConnectionTimeout)
        ));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn receive_any_requires_a_connection() {
        assert!(matches!(
            receive_any(&[None, None], Duration::from_millis(10)),
            Err(Error::NoValidConnections)
        ));
    }

    #[test]
    fn receive_any_times_out() {
        let (_a, b) = pair();
        let ready = receive_any(&[Some(b)], Duration::from_millis(20)).unwrap();
        assert!(matches!(ready, Ready::Timeout));
    }

    #[test]
    fn receive_any_skips_none_and_reports_index() {
        let (a1, b1) = pair();
        let (a2, b2) = pair();
        a2.send(&text("second")).unwrap();
        let ready = receive_any(&[None, Some(b1), Some(b2)], Duration::from_secs(1)).unwrap();
        match ready {
            Ready::Message { index, message } => {
                assert_eq!(index, 2);
                assert_eq!(message, text("second"));
            }
            other => panic!("unexpected {other:?}"),
        }
        drop(a1);
    }

    #[test]
    fn receive_any_delivers_last_message_before_hangup() {
        let (a, b) = pair();
        a.send(&text("bye")).unwrap();
        a.close();
        let conns = [Some(b)];
        let first = receive_any(&conns, Duration::from_secs(1)).unwrap();
        assert!(matches!(first, Ready::Message { index: 0, .. }));
        let second = receive_any(&conns, Duration::from_secs(1)).unwrap();
        assert!(matches!(second, Ready::Hangup { index: 0 }));
    }

    #[test]
    fn receive_any_prefers_hangup() {
        let (a1, b1) = pair();
        let (a2, b2) = pair();
        a1.send(&text("still here")).unwrap();
        drop(a2);
        let ready = receive_any(&[Some(b1), Some(b2)], Duration::from_secs(1)).unwrap();
        assert!(matches!(ready, Ready::Hangup { index: 1 }));
        drop(a1);
    }

    #[test]
    fn partial_frame_is_an_error_not_a_hangup() {
        let (a, b) = UnixStream::pair().unwrap();
        let b = Connection::accept(Socket::Unix(b), Duration::from_secs(1), &PlainChannel).unwrap();
        let frame = text("cut short").encode().unwrap();
        let mut raw = a;
        raw.write_all(&frame[..frame.len() - 3]).unwrap();
        drop(raw);
        assert!(matches!(b.receive(), Err(Error::Connection(_))));
    }

    #[test]
    fn local_listener_accepts_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("l.sock");
        let endpoint = Endpoint::local(&path);
        let mut listener = Listener::bind(&endpoint, true).unwrap();
        assert!(path.exists());

        assert!(matches!(
            listener.accept(Duration::from_millis(20)),
            Err(Error::ConnectionTimeout)
        ));

        let client_endpoint = endpoint.clone();
        let client = thread::spawn(move || {
            let conn = Connection::connect(&client_endpoint, Duration::from_secs(1), &PlainChannel).unwrap();
            conn.send(&text("hello")).unwrap();
            conn
        });
        let socket = listener.accept(Duration::from_secs(2)).unwrap();
        let server = Connection::accept(socket, Duration::from_secs(1), &PlainChannel).unwrap();
        assert_eq!(server.receive().unwrap(), text("hello"));
        drop(client.join().unwrap());

        drop(listener);
        assert!(!path.exists());
    }

    #[test]
    fn stale_socket_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stale.sock");
        {
            let _dead = UnixListener::bind(&path).unwrap();
        }
        assert!(path.exists());
        let listener = Listener::bind(&Endpoint::local(&path), true).unwrap();
        assert!(path.exists());

        assert!(Listener::bind(&Endpoint::local(&path), true).is_err());
        drop(listener);
    }

    #[test]
    fn existing_socket_without_cleanup_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keep.sock");
        std::fs::write(&path, b"").unwrap();
        assert!(matches!(
            Listener::bind(&Endpoint::local(&path), false),
            Err(Error::Connection(_))
        ));
    }

    #[test]
    fn tcp_ephemeral_port() {
        let mut listener = Listener::bind(&"127.0.0.1:0".parse().unwrap(), true).unwrap();
        let endpoint = listener.endpoint().clone();
        assert_ne!(endpoint.socket_addr().unwrap().port(), 0);

        let client = Connection::connect(&endpoint, Duration::from_secs(1), &PlainChannel).unwrap();
        client.send(&text("over tcp")).unwrap();
        let socket = listener.accept(Duration::from_secs(2)).unwrap();
        let server = Connection::accept(socket, Duration::from_secs(1), &PlainChannel).unwrap();
        assert_eq!(server.receive().unwrap(), text("over tcp"));
    }
}
