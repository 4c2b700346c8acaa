//! Controller - one end of the tunnel
//!
//! ```text
//!          ┌──────────────────────── update() ─────────────────────────┐
//!          │                                                           │
//!  poll ──►│ assign IDs ─► index ─► tunnel check ─► announce changes   │
//!          │                                            │              │
//!          │            ┌── dispatch ◄── demux ◄────────┘              │
//!          │            └──────────────► demux ...  ─► mux             │
//!          └───────────────────────────────────────────────────────────┘
//! ```
//!
//! The originator hands out logical IDs for accepted clients and announces
//! them with NEW. The terminator opens a connection to its target for every
//! NEW and answers ACK, or CLOSE if the connect fails. Half closes and full
//! closes are mirrored to the peer as they are observed locally.

mod ids;

pub use ids::FreeIds;

use crate::config::{Mode, TunnelConfig};
use crate::protocol::{Command, CommandKind, CONTROL_ID, MAX_LOGICAL_ID};
use crate::transport::{bind_listener, Manager};
use crate::tunnel::{
    ConnFlags, Connection, Pump, SlotTable, TunnelError, COMMAND_QUEUE_CAPACITY,
};
use crate::Result;
use mio::Waker;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Stops a running controller from any thread
#[derive(Clone)]
pub struct Shutdown {
    flag: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl Shutdown {
    /// Request termination and interrupt a blocked poll
    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
        if let Err(e) = self.waker.wake() {
            warn!("Failed to wake controller: {}", e);
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// The raw flag, for signal handlers
    pub fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.flag)
    }
}

impl std::fmt::Debug for Shutdown {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shutdown")
            .field("triggered", &self.is_triggered())
            .finish()
    }
}

/// Event loop state for one tunnel endpoint
pub struct Controller {
    mode: Mode,
    target: SocketAddr,
    connect_timeout: Duration,
    manager: Manager,
    pump: Pump,
    /// Originator only
    ids: Option<FreeIds>,
    shutdown: Arc<AtomicBool>,
}

impl Controller {
    /// Listen for application clients and open the tunnel to the terminator
    pub fn originator(config: &TunnelConfig) -> Result<Self> {
        config.validate()?;
        let listen = config.listen_addr()?;
        let target = config.target_addr()?;

        let listener = bind_listener(listen, config.backlog)?;
        let mut manager = Manager::new(Some(listener), config.buffer_size)?;
        if let Some(addr) = manager.local_addr() {
            info!("Listening for clients on {}", addr);
        }
        manager.connect(target, None, config.connect_timeout())?;

        Ok(Self::with_manager(Mode::Originator, target, config, manager))
    }

    /// Bind the tunnel address and wait for the originator
    pub fn terminator(config: &TunnelConfig) -> Result<Self> {
        config.validate()?;
        let listener = bind_listener(config.listen_addr()?, config.backlog)?;
        Self::terminator_from_listener(listener, config)
    }

    /// Accept exactly one tunnel connection on `listener`, then close it.
    /// Blocks until the originator connects.
    pub fn terminator_from_listener(
        listener: std::net::TcpListener,
        config: &TunnelConfig,
    ) -> Result<Self> {
        let target = config.target_addr()?;
        info!("Waiting for tunnel on {}", listener.local_addr()?);
        let (stream, _) = listener.accept()?;
        drop(listener);

        let mut manager = Manager::new(None, config.buffer_size)?;
        manager.add_stream(stream, None)?;

        Ok(Self::with_manager(Mode::Terminator, target, config, manager))
    }

    fn with_manager(mode: Mode, target: SocketAddr, config: &TunnelConfig, manager: Manager) -> Self {
        Self {
            mode,
            target,
            connect_timeout: config.connect_timeout(),
            manager,
            pump: Pump::new(COMMAND_QUEUE_CAPACITY),
            ids: match mode {
                Mode::Originator => Some(FreeIds::new()),
                Mode::Terminator => None,
            },
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Address application clients connect to (originator)
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.manager.local_addr()
    }

    pub fn connections(&self) -> &[Connection] {
        self.manager.connections()
    }

    pub fn shutdown_handle(&self) -> Shutdown {
        Shutdown {
            flag: Arc::clone(&self.shutdown),
            waker: self.manager.waker(),
        }
    }

    /// Tick until termination is requested or the session fails.
    /// Every socket is closed on the way out.
    pub fn run(&mut self) -> Result<()> {
        info!("Running as {}", self.mode);
        let result = loop {
            if self.shutdown.load(Ordering::SeqCst) {
                info!("Termination requested");
                break Ok(());
            }
            if let Err(e) = self.update() {
                error!("Session failed: {}", e);
                break Err(e);
            }
        };
        self.manager.close_all();
        result
    }

    /// One tick: poll, react to state changes, move frames
    pub fn update(&mut self) -> Result<()> {
        self.manager.poll()?;
        self.assign_ids()?;

        let mut table = self.index()?;
        self.check_tunnel(&table)?;
        self.announce_changes(&mut table)?;

        while let Some(cmd) = self.pump.demux(self.manager.connections_mut(), &table)? {
            self.on_command(cmd, &table)?;
            table = self.index()?;
        }
        self.pump.mux(self.manager.connections_mut(), &table);
        Ok(())
    }

    fn index(&self) -> Result<SlotTable> {
        SlotTable::build(self.manager.connections())
            .map_err(|id| TunnelError::IdCollision(id).into())
    }

    /// Give every freshly accepted client an ID
    fn assign_ids(&mut self) -> Result<()> {
        let ids = match self.ids.as_mut() {
            Some(ids) => ids,
            None => return Ok(()),
        };
        for conn in self.manager.connections_mut() {
            if conn.id().is_some() || !conn.state.contains(ConnFlags::NEW) {
                continue;
            }
            if ids.is_empty() {
                // Only a connection still flushing after CLOSE can hold
                // the table slot; retry once it is gone.
                break;
            }
            let id = ids.pop()?;
            self.pump.revive(id);
            conn.set_id(id);
            debug!("Assigned id {} to {}", id, conn.peer());
        }
        Ok(())
    }

    fn check_tunnel(&self, table: &SlotTable) -> Result<()> {
        let tunnel = table
            .get(CONTROL_ID)
            .filter(|&idx| idx == 0)
            .and_then(|idx| self.manager.connections().get(idx));
        match tunnel {
            Some(t) if !(t.state | t.inbound | t.outbound).contains(ConnFlags::CLOSED) => Ok(()),
            _ => Err(TunnelError::TunnelLost.into()),
        }
    }

    /// Turn local state changes into commands for the peer.
    ///
    /// Stops at the first command that does not fit in the queue; the scan
    /// picks up from the same state next tick.
    fn announce_changes(&mut self, table: &mut SlotTable) -> Result<()> {
        let conns = self.manager.connections_mut();
        for id in 1..=MAX_LOGICAL_ID {
            let conn = match table.get(id) {
                Some(idx) => &mut conns[idx],
                None => continue,
            };

            if conn.state.contains(ConnFlags::NEW) {
                if !self.pump.send_command(Command::new(CommandKind::New, id)) {
                    return Ok(());
                }
                conn.state.remove(ConnFlags::NEW);
                conn.state.insert(ConnFlags::STOPPED);
                info!("Opening connection {} for {}", id, conn.peer());
                continue;
            }

            if conn.ready_to_close() {
                if !self.pump.send_command(Command::new(CommandKind::Close, id)) {
                    return Ok(());
                }
                conn.state.insert(ConnFlags::DELETE);
                table.remove(id);
                self.pump.retire(id);
                if let Some(ids) = self.ids.as_mut() {
                    ids.release(id)?;
                }
                info!("Connection {} closed", id);
                continue;
            }

            if conn.inbound_drained() {
                if !self.pump.send_command(Command::new(CommandKind::CloseInbound, id)) {
                    return Ok(());
                }
                conn.inbound.insert(ConnFlags::DELETE);
                debug!("Connection {} finished sending", id);
            }
            if conn.outbound_drained() {
                if !self.pump.send_command(Command::new(CommandKind::CloseOutbound, id)) {
                    return Ok(());
                }
                conn.outbound.insert(ConnFlags::DELETE);
                debug!("Connection {} stopped receiving", id);
            }
        }
        Ok(())
    }

    fn on_command(&mut self, cmd: Command, table: &SlotTable) -> Result<()> {
        debug!("Received {}", cmd);
        let id = cmd.id;
        if id == CONTROL_ID {
            warn!("Ignoring {} addressed to the tunnel", cmd);
            return Ok(());
        }

        if cmd.kind == CommandKind::New {
            return self.open(id, table);
        }

        let conn = match table.get(id) {
            Some(idx) => &mut self.manager.connections_mut()[idx],
            None => {
                debug!("Ignoring {} for a connection that is gone", cmd);
                return Ok(());
            }
        };

        match cmd.kind {
            CommandKind::Close => {
                conn.detach();
                if let Some(ids) = self.ids.as_mut() {
                    ids.release(id)?;
                }
                info!("Connection {} closed by peer", id);
            }
            CommandKind::CloseInbound => conn.outbound.insert(ConnFlags::DELETE),
            CommandKind::CloseOutbound => conn.stop_inbound(),
            CommandKind::Ack => {
                conn.state.remove(ConnFlags::STOPPED);
                debug!("Connection {} acknowledged", id);
            }
            CommandKind::New => {}
        }
        Ok(())
    }

    /// Connect to the target for a NEW from the originator
    fn open(&mut self, id: u8, table: &SlotTable) -> Result<()> {
        if self.mode == Mode::Originator {
            warn!("Ignoring NEW {} on the originator", id);
            return Ok(());
        }
        if table.get(id).is_some() {
            warn!("Connection {} is already open, ignoring NEW", id);
            return Ok(());
        }

        self.pump.revive(id);
        let reply = match self.manager.connect(self.target, Some(id), self.connect_timeout) {
            Ok(()) => {
                info!("Connection {} opened to {}", id, self.target);
                CommandKind::Ack
            }
            Err(e) => {
                warn!("Connection {} to {} failed: {}", id, self.target, e);
                self.pump.retire(id);
                CommandKind::Close
            }
        };
        if !self.pump.send_command(Command::new(reply, id)) {
            warn!("Command queue full, dropped reply for connection {}", id);
        }
        Ok(())
    }
}
