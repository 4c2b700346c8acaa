//! Logical connection state
//!
//! Every forwarded stream (and the tunnel link itself) is a [`Connection`]:
//! a socket, one ring buffer per direction and three flag sets. The inbound
//! half moves bytes from the local socket towards the peer, the outbound half
//! moves bytes from the peer into the local socket.
//!
//! Each half walks `open -> finished -> shut down`:
//! - finished: `EOF` (transport ended) or `DELETE` (peer asked us to stop)
//! - shut down: `CLOSED`, the socket direction is shut or the socket is gone

use super::RingBuffer;
use bitflags::bitflags;
use mio::net::TcpStream;
use mio::{Interest, Token};
use std::net::SocketAddr;

bitflags! {
    /// State flags carried by a connection and by each of its halves
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ConnFlags: u8 {
        /// Accepted but not yet announced to the peer
        const NEW     = 0b0000_0001;
        /// The transport reported end of stream or an error
        const EOF     = 0b0000_0010;
        /// Socket (or socket direction) is shut down
        const CLOSED  = 0b0000_0100;
        /// Finished at the protocol level; for the whole connection, remove it once closed
        const DELETE  = 0b0000_1000;
        /// Waiting for the peer to acknowledge a NEW command
        const STOPPED = 0b0001_0000;
    }
}

impl ConnFlags {
    /// No end-of-stream, close or delete recorded
    pub fn is_alive(self) -> bool {
        !self.intersects(Self::EOF | Self::CLOSED | Self::DELETE)
    }
}

/// A socket plus its two directional buffers
pub struct Connection {
    id: Option<u8>,
    peer: SocketAddr,
    pub(crate) socket: Option<TcpStream>,
    pub(crate) token: Token,
    pub(crate) interest: Option<Interest>,
    pub(crate) readable: bool,
    pub(crate) writable: bool,
    /// Whole-connection flags
    pub state: ConnFlags,
    /// Local socket -> peer
    pub inbound: ConnFlags,
    /// Peer -> local socket
    pub outbound: ConnFlags,
    /// Bytes read from the socket, waiting to be framed
    pub inbound_buf: RingBuffer,
    /// Bytes decoded from the tunnel, waiting to be written to the socket
    pub outbound_buf: RingBuffer,
}

impl Connection {
    pub(crate) fn new(
        socket: TcpStream,
        peer: SocketAddr,
        token: Token,
        id: Option<u8>,
        buffer_size: usize,
    ) -> Self {
        Self {
            id,
            peer,
            socket: Some(socket),
            token,
            interest: None,
            readable: false,
            writable: false,
            state: ConnFlags::empty(),
            inbound: ConnFlags::empty(),
            outbound: ConnFlags::empty(),
            inbound_buf: RingBuffer::new(buffer_size),
            outbound_buf: RingBuffer::new(buffer_size),
        }
    }

    /// Connection without a socket, for exercising the protocol layer
    #[cfg(test)]
    pub(crate) fn detached(id: u8, buffer_size: usize) -> Self {
        Self {
            id: Some(id),
            peer: SocketAddr::from(([127, 0, 0, 1], 0)),
            socket: None,
            token: Token(usize::from(id)),
            interest: None,
            readable: false,
            writable: false,
            state: ConnFlags::empty(),
            inbound: ConnFlags::empty(),
            outbound: ConnFlags::empty(),
            inbound_buf: RingBuffer::new(buffer_size),
            outbound_buf: RingBuffer::new(buffer_size),
        }
    }

    /// Logical ID; `None` until one is assigned, or after the peer closed it
    pub fn id(&self) -> Option<u8> {
        self.id
    }

    pub(crate) fn set_id(&mut self, id: u8) {
        self.id = Some(id);
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_stopped(&self) -> bool {
        self.state.contains(ConnFlags::STOPPED)
    }

    pub fn is_closed(&self) -> bool {
        self.state.contains(ConnFlags::CLOSED)
    }

    /// Reading from the socket is over
    pub fn inbound_finished(&self) -> bool {
        self.inbound.intersects(ConnFlags::EOF | ConnFlags::DELETE)
    }

    /// Writing to the socket is over: it failed, or the peer is done and
    /// everything it sent has been flushed
    pub fn outbound_finished(&self) -> bool {
        self.outbound.contains(ConnFlags::EOF)
            || (self.outbound.contains(ConnFlags::DELETE) && self.outbound_buf.is_empty())
    }

    /// The socket should be closed on the next close pass
    pub(crate) fn should_close_socket(&self) -> bool {
        if self.is_closed() {
            return false;
        }
        let flushed = self.outbound_buf.is_empty()
            || self.outbound.intersects(ConnFlags::EOF | ConnFlags::CLOSED);
        (self.state.contains(ConnFlags::DELETE) && flushed)
            || (self.inbound_finished() && self.outbound_finished())
    }

    /// Closed and marked for removal
    pub(crate) fn should_delete(&self) -> bool {
        self.state.contains(ConnFlags::CLOSED | ConnFlags::DELETE)
    }

    /// Socket can take another read this tick
    pub(crate) fn can_receive(&self) -> bool {
        self.socket.is_some()
            && self.inbound.is_alive()
            && !self.is_stopped()
            && !self.inbound_buf.is_full()
    }

    /// Socket can take another write this tick
    pub(crate) fn can_transmit(&self) -> bool {
        self.socket.is_some()
            && !self.outbound.intersects(ConnFlags::EOF | ConnFlags::CLOSED)
            && !self.is_stopped()
            && !self.outbound_buf.is_empty()
    }

    /// Poll interest matching the current half states
    pub(crate) fn wanted_interest(&self) -> Option<Interest> {
        let read = self.inbound.is_alive() && !self.inbound_buf.is_full();
        let write = !self.outbound_buf.is_empty()
            && !self.outbound.intersects(ConnFlags::EOF | ConnFlags::CLOSED);
        match (read, write) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }

    /// Known readiness with work to do, so the next poll must not block
    pub(crate) fn has_pending_io(&self) -> bool {
        (self.readable && self.can_receive()) || (self.writable && self.can_transmit())
    }

    /// Inbound data may be framed into the tunnel
    pub fn can_mux(&self) -> bool {
        !self.state.intersects(ConnFlags::STOPPED | ConnFlags::DELETE)
            && !self.inbound.contains(ConnFlags::DELETE)
            && !self.inbound_buf.is_empty()
    }

    /// Decoded tunnel data may be stored for this connection
    pub fn accepts_data(&self) -> bool {
        !self.state.intersects(ConnFlags::STOPPED | ConnFlags::DELETE)
            && !self.outbound.intersects(ConnFlags::EOF | ConnFlags::CLOSED)
    }

    /// Socket closed and both buffers drained: announce CLOSE
    pub fn ready_to_close(&self) -> bool {
        self.is_closed()
            && !self.state.contains(ConnFlags::DELETE)
            && self.inbound_buf.is_empty()
            && self.outbound_buf.is_empty()
    }

    /// Reading is shut and everything read was framed: announce CLOSE-INBOUND
    pub fn inbound_drained(&self) -> bool {
        self.inbound.contains(ConnFlags::CLOSED)
            && !self.inbound.contains(ConnFlags::DELETE)
            && self.inbound_buf.is_empty()
    }

    /// Writing is shut: announce CLOSE-OUTBOUND
    pub fn outbound_drained(&self) -> bool {
        self.outbound.contains(ConnFlags::CLOSED)
            && !self.outbound.contains(ConnFlags::DELETE)
            && self.outbound_buf.is_empty()
    }

    /// The peer closed the whole connection. The connection flushes what
    /// it still holds for the socket and is then removed; its ID is free for
    /// reuse immediately.
    pub(crate) fn detach(&mut self) {
        self.id = None;
        self.state.insert(ConnFlags::DELETE);
        self.state.remove(ConnFlags::NEW | ConnFlags::STOPPED);
        self.stop_inbound();
        self.outbound.insert(ConnFlags::DELETE);
    }

    /// The peer cannot deliver anything more we read
    pub(crate) fn stop_inbound(&mut self) {
        self.inbound.insert(ConnFlags::DELETE);
        self.inbound_buf.clear();
    }

    /// Record a transport failure or end of stream on the outbound half.
    /// Undeliverable bytes are dropped.
    pub(crate) fn fail_outbound(&mut self) {
        self.outbound.insert(ConnFlags::EOF);
        self.outbound_buf.clear();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("state", &self.state)
            .field("inbound", &self.inbound)
            .field("outbound", &self.outbound)
            .field("inbound_buf", &self.inbound_buf.len())
            .field("outbound_buf", &self.outbound_buf.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_half_close_from_read_eof() {
        let mut conn = Connection::detached(1, 16);
        conn.inbound_buf.write_slice(b"tail");
        conn.inbound.insert(ConnFlags::EOF);

        assert!(conn.inbound_finished());
        assert!(!conn.outbound_finished());
        assert!(!conn.should_close_socket());

        // Close pass shuts the read side; the tail must be framed first.
        conn.inbound.insert(ConnFlags::CLOSED);
        assert!(conn.can_mux());
        assert!(!conn.inbound_drained());

        conn.inbound_buf.clear();
        assert!(conn.inbound_drained());
        conn.inbound.insert(ConnFlags::DELETE);
        assert!(!conn.inbound_drained());
    }

    #[test]
    fn test_outbound_flushes_before_finish() {
        let mut conn = Connection::detached(2, 16);
        conn.outbound_buf.write_slice(b"pending");
        conn.outbound.insert(ConnFlags::DELETE);
        assert!(!conn.outbound_finished());

        conn.outbound_buf.clear();
        assert!(conn.outbound_finished());
    }

    #[test]
    fn test_socket_closes_when_both_halves_finish() {
        let mut conn = Connection::detached(3, 16);
        conn.inbound.insert(ConnFlags::EOF);
        conn.outbound.insert(ConnFlags::DELETE);
        assert!(conn.should_close_socket());

        conn.state.insert(ConnFlags::CLOSED);
        assert!(!conn.should_close_socket());
        assert!(!conn.should_delete());
        assert!(conn.ready_to_close());
    }

    #[test]
    fn test_detach_waits_for_flush() {
        let mut conn = Connection::detached(4, 16);
        conn.inbound_buf.write_slice(b"never sent");
        conn.outbound_buf.write_slice(b"still owed");
        conn.detach();

        assert_eq!(conn.id(), None);
        assert!(conn.inbound_buf.is_empty());
        assert!(!conn.can_mux());
        assert!(!conn.should_close_socket());

        conn.outbound_buf.clear();
        assert!(conn.should_close_socket());
        conn.state.insert(ConnFlags::CLOSED);
        assert!(conn.should_delete());
        assert!(!conn.ready_to_close());
    }

    #[test]
    fn test_stopped_connection_is_frozen() {
        let mut conn = Connection::detached(5, 16);
        conn.state.insert(ConnFlags::STOPPED);
        conn.inbound_buf.write_slice(b"x");
        assert!(!conn.can_mux());
        assert!(!conn.accepts_data());

        conn.state.remove(ConnFlags::STOPPED);
        assert!(conn.can_mux());
        assert!(conn.accepts_data());
    }

    #[test]
    fn test_interest_follows_halves() {
        let mut conn = Connection::detached(6, 16);
        assert_eq!(conn.wanted_interest(), Some(Interest::READABLE));

        conn.outbound_buf.write_slice(b"out");
        assert_eq!(
            conn.wanted_interest(),
            Some(Interest::READABLE | Interest::WRITABLE)
        );

        conn.inbound_buf.write_slice(&[0u8; 16]);
        assert_eq!(conn.wanted_interest(), Some(Interest::WRITABLE));
        conn.inbound_buf.clear();

        conn.inbound.insert(ConnFlags::EOF);
        assert_eq!(conn.wanted_interest(), Some(Interest::WRITABLE));

        conn.fail_outbound();
        assert_eq!(conn.wanted_interest(), None);
    }
}
