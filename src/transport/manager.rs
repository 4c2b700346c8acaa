//! Connection manager: one `mio` poll cycle per tick
//!
//! ```text
//!   close pass -> compact -> interest -> poll -> accept -> transfer
//!                                                             |
//!                              close pass -> compact  <-------+
//! ```
//!
//! Readiness from `mio` is edge triggered, so every connection remembers
//! whether its socket was last seen readable or writable. The flags are only
//! cleared when a read or write hits `WouldBlock`.

use super::{is_disconnect, TransportError};
use crate::tunnel::{ConnFlags, Connection, MAX_CONNECTIONS, TUNNEL_BUFFER_MULTIPLIER};
use mio::net::{TcpListener, TcpStream};
use mio::event::Source;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

const LISTENER: Token = Token(0);
const WAKER: Token = Token(1);
const FIRST_CONNECTION_TOKEN: usize = 2;

const EVENTS_CAPACITY: usize = 1024;

/// Bind a listening socket with `SO_REUSEADDR` and an explicit backlog
pub fn bind_listener(addr: SocketAddr, backlog: u32) -> Result<std::net::TcpListener, TransportError> {
    let bind_err = |e: io::Error| TransportError::Bind(format!("{}: {}", addr, e));

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(bind_err)?;
    socket.set_reuse_address(true).map_err(bind_err)?;
    socket.bind(&addr.into()).map_err(bind_err)?;
    socket
        .listen(i32::try_from(backlog).unwrap_or(i32::MAX))
        .map_err(bind_err)?;
    Ok(socket.into())
}

/// Owner of every socket in one controller
pub struct Manager {
    poll: Poll,
    events: Events,
    waker: Arc<Waker>,
    listener: Option<TcpListener>,
    accept_ready: bool,
    /// Tunnel first (once registered), then logical connections
    conns: Vec<Connection>,
    next_token: usize,
    buffer_size: usize,
}

impl Manager {
    /// Create a manager, optionally owning a listening socket for
    /// application clients.
    pub fn new(
        listener: Option<std::net::TcpListener>,
        buffer_size: usize,
    ) -> Result<Self, TransportError> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);

        let listener = match listener {
            Some(listener) => {
                listener.set_nonblocking(true)?;
                let mut listener = TcpListener::from_std(listener);
                poll.registry()
                    .register(&mut listener, LISTENER, Interest::READABLE)?;
                Some(listener)
            }
            None => None,
        };

        Ok(Self {
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            waker,
            listener,
            accept_ready: false,
            conns: Vec::new(),
            next_token: FIRST_CONNECTION_TOKEN,
            buffer_size,
        })
    }

    /// Handle for interrupting a blocked poll from another thread
    pub fn waker(&self) -> Arc<Waker> {
        Arc::clone(&self.waker)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    pub fn connections(&self) -> &[Connection] {
        &self.conns
    }

    pub fn connections_mut(&mut self) -> &mut [Connection] {
        &mut self.conns
    }

    /// Open a connection to `addr` and register it under `id`.
    ///
    /// The connect itself blocks for at most `timeout`. `None` registers the
    /// tunnel link (ID 0).
    pub fn connect(
        &mut self,
        addr: SocketAddr,
        id: Option<u8>,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        if self.conns.len() >= MAX_CONNECTIONS {
            return Err(TransportError::TableFull);
        }
        let stream = std::net::TcpStream::connect_timeout(&addr, timeout)
            .map_err(|e| TransportError::ConnectionFailed(format!("{}: {}", addr, e)))?;
        self.add_stream(stream, id)
    }

    /// Register an established socket under `id`, `None` meaning the tunnel
    pub fn add_stream(
        &mut self,
        stream: std::net::TcpStream,
        id: Option<u8>,
    ) -> Result<(), TransportError> {
        if self.conns.len() >= MAX_CONNECTIONS {
            return Err(TransportError::TableFull);
        }
        if id.is_none() && self.conns.first().map_or(false, |c| c.id() == Some(0)) {
            return Err(TransportError::TunnelExists);
        }

        let tunnel_size = self
            .buffer_size
            .checked_mul(TUNNEL_BUFFER_MULTIPLIER)
            .ok_or(TransportError::BufferTooLarge(self.buffer_size))?;

        let peer = stream.peer_addr()?;
        stream.set_nonblocking(true)?;
        // Interactive traffic is multiplexed; don't let Nagle hold frames back.
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
        }
        let socket = TcpStream::from_std(stream);
        let token = self.allocate_token();

        match id {
            None => {
                info!("Tunnel established with {}", peer);
                self.conns
                    .insert(0, Connection::new(socket, peer, token, Some(0), tunnel_size));
            }
            Some(id) => {
                debug!("Connection {} established with {}", id, peer);
                self.conns
                    .push(Connection::new(socket, peer, token, Some(id), self.buffer_size));
            }
        }
        Ok(())
    }

    fn allocate_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    /// Run one poll cycle. Only registration or poll failures are errors;
    /// per-socket I/O problems are recorded in the connection flags.
    pub fn poll(&mut self) -> Result<(), TransportError> {
        // State changed since the last tick (commands from the peer) must
        // reach the controller without waiting for socket activity.
        let changed = self.close_pass();
        self.compact();
        self.update_interest()?;
        self.wait(changed)?;
        self.accept();
        self.transfer();
        self.close_pass();
        self.compact();
        Ok(())
    }

    /// Shut down or close sockets according to the connection flags.
    /// Returns whether anything was shut down.
    fn close_pass(&mut self) -> bool {
        let registry = self.poll.registry();
        let mut changed = false;
        for conn in self.conns.iter_mut() {
            if conn.is_closed() {
                continue;
            }

            if conn.should_close_socket() {
                if let Some(mut socket) = conn.socket.take() {
                    if conn.interest.take().is_some() {
                        deregister(registry, &mut socket);
                    }
                    debug!("Closed socket to {} (id {:?})", conn.peer(), conn.id());
                }
                conn.state.insert(ConnFlags::CLOSED);
                conn.inbound.insert(ConnFlags::CLOSED);
                conn.outbound.insert(ConnFlags::CLOSED);
                changed = true;
                continue;
            }

            if conn.inbound_finished() && !conn.inbound.contains(ConnFlags::CLOSED) {
                if let Some(socket) = conn.socket.as_ref() {
                    shutdown(socket, Shutdown::Read);
                }
                debug!("Shut down read side of {} (id {:?})", conn.peer(), conn.id());
                conn.inbound.insert(ConnFlags::CLOSED);
                changed = true;
            }
            if conn.outbound_finished() && !conn.outbound.contains(ConnFlags::CLOSED) {
                if let Some(socket) = conn.socket.as_ref() {
                    shutdown(socket, Shutdown::Write);
                }
                debug!("Shut down write side of {} (id {:?})", conn.peer(), conn.id());
                conn.outbound.insert(ConnFlags::CLOSED);
                changed = true;
            }
        }
        changed
    }

    /// Drop connections that are closed and marked for deletion
    fn compact(&mut self) {
        self.conns.retain(|conn| {
            if conn.should_delete() {
                info!("Removed connection to {} (id {:?})", conn.peer(), conn.id());
                false
            } else {
                true
            }
        });
    }

    /// Bring each registration in line with what the connection wants
    fn update_interest(&mut self) -> Result<(), TransportError> {
        let registry = self.poll.registry();
        for conn in self.conns.iter_mut() {
            let wanted = conn.wanted_interest();
            if wanted == conn.interest {
                continue;
            }
            let socket = match conn.socket.as_mut() {
                Some(socket) => socket,
                None => continue,
            };
            match (conn.interest, wanted) {
                (None, Some(interest)) => registry.register(socket, conn.token, interest)?,
                (Some(_), Some(interest)) => registry.reregister(socket, conn.token, interest)?,
                (Some(_), None) => registry.deregister(socket)?,
                (None, None) => {}
            }
            conn.interest = wanted;
        }
        Ok(())
    }

    /// Block until something is ready, unless work is already known
    fn wait(&mut self, busy: bool) -> Result<(), TransportError> {
        let busy =
            busy || self.accept_ready || self.conns.iter().any(Connection::has_pending_io);
        let timeout = if busy { Some(Duration::ZERO) } else { None };

        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        for event in self.events.iter() {
            match event.token() {
                LISTENER => self.accept_ready = true,
                WAKER => trace!("Poll woken"),
                token => {
                    let conn = match self.conns.iter_mut().find(|c| c.token == token) {
                        Some(conn) => conn,
                        None => continue,
                    };
                    if event.is_readable() || event.is_read_closed() || event.is_error() {
                        conn.readable = true;
                    }
                    if event.is_writable() || event.is_write_closed() || event.is_error() {
                        conn.writable = true;
                    }
                }
            }
        }
        Ok(())
    }

    /// Accept at most one application connection
    fn accept(&mut self) {
        if !self.accept_ready {
            return;
        }
        let listener = match self.listener.as_ref() {
            Some(listener) => listener,
            None => return,
        };

        match listener.accept() {
            Ok((socket, peer)) => {
                if self.conns.len() >= MAX_CONNECTIONS {
                    warn!("Connection table full, dropping {}", peer);
                    return;
                }
                if let Err(e) = socket.set_nodelay(true) {
                    debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
                }
                let token = Token(self.next_token);
                self.next_token += 1;
                let mut conn = Connection::new(socket, peer, token, None, self.buffer_size);
                conn.state.insert(ConnFlags::NEW);
                self.conns.push(conn);
                info!("Accepted connection from {}", peer);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => self.accept_ready = false,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                warn!("Accept failed: {}", e);
                self.accept_ready = false;
            }
        }
    }

    /// One read and one write per connection
    fn transfer(&mut self) {
        for conn in self.conns.iter_mut() {
            if conn.readable && conn.can_receive() {
                receive(conn);
            }
            if conn.writable && conn.can_transmit() {
                transmit(conn);
            }
        }
    }

    /// Close every socket. The manager is empty afterwards.
    pub fn close_all(&mut self) {
        let registry = self.poll.registry();
        let count = self.conns.len();
        for conn in self.conns.iter_mut() {
            if let Some(mut socket) = conn.socket.take() {
                if conn.interest.take().is_some() {
                    deregister(registry, &mut socket);
                }
            }
        }
        self.conns.clear();
        if let Some(mut listener) = self.listener.take() {
            deregister(registry, &mut listener);
        }
        info!("Closed {} connections", count);
    }
}

/// Dropping the socket releases the registration anyway
fn deregister(registry: &Registry, source: &mut impl Source) {
    if let Err(e) = registry.deregister(source) {
        debug!("Deregister failed: {}", e);
    }
}

fn shutdown(socket: &TcpStream, how: Shutdown) {
    if let Err(e) = socket.shutdown(how) {
        if e.kind() != io::ErrorKind::NotConnected {
            warn!("Shutdown({:?}) failed: {}", how, e);
        }
    }
}

fn receive(conn: &mut Connection) {
    let socket = match conn.socket.as_mut() {
        Some(socket) => socket,
        None => return,
    };
    match conn.inbound_buf.read_from(socket) {
        Ok(0) => {
            debug!("End of stream from {} (id {:?})", conn.peer(), conn.id());
            conn.inbound.insert(ConnFlags::EOF);
        }
        Ok(n) => trace!("Read {} bytes from {}", n, conn.peer()),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => conn.readable = false,
        Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
        Err(e) if is_disconnect(&e) => {
            debug!("Read from {} ended: {}", conn.peer(), e);
            conn.inbound.insert(ConnFlags::EOF);
        }
        Err(e) => {
            warn!("Read from {} failed: {}", conn.peer(), e);
            conn.inbound.insert(ConnFlags::EOF);
        }
    }
}

fn transmit(conn: &mut Connection) {
    let socket = match conn.socket.as_mut() {
        Some(socket) => socket,
        None => return,
    };
    match conn.outbound_buf.write_to(socket) {
        Ok(0) => {
            debug!("Write to {} made no progress", conn.peer());
            conn.fail_outbound();
        }
        Ok(n) => trace!("Wrote {} bytes to {}", n, conn.peer()),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => conn.writable = false,
        Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
        Err(e) if is_disconnect(&e) => {
            debug!("Write to {} ended: {}", conn.peer(), e);
            conn.fail_outbound();
        }
        Err(e) => {
            warn!("Write to {} failed: {}", conn.peer(), e);
            conn.fail_outbound();
        }
    }
}
