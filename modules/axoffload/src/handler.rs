//! Offload request handler.
//!
//! Turns socket-layer requests into slot table updates and module commands.
//! Every table access happens under the interface's protection mutex;
//! connect and blocking accept drop it while the module works.

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};

use axsock::{
    InterfaceId, Ipv4Address, NetPacket, NetStack, OffloadError, OffloadResult, Protocol,
    SocketHandle, TransportError, TransportResult, WifiTransport,
};
use log::{debug, warn};
use spin::Mutex;

use crate::config::{OffloadConfig, DEFAULT_SLOTS};
use crate::driver::STATE_UNINITIALIZED;
use crate::slot::{ConnectionSlot, SlotTable};
use crate::time::{send_timeout_ms, ticks_to_ms};

/// A send that did not complete. The packet goes back to the caller, who
/// decides whether to retry or release it.
#[derive(Debug, PartialEq)]
pub struct SendFailure<P> {
    pub error: OffloadError,
    pub packet: P,
}

/// Error half of [`Offload::handle`].
#[derive(Debug, PartialEq)]
pub struct Rejected<P> {
    pub error: OffloadError,
    /// Packet of a failed send request.
    pub packet: Option<P>,
}

impl<P> From<OffloadError> for Rejected<P> {
    fn from(error: OffloadError) -> Self {
        Self { error, packet: None }
    }
}

impl<P> From<SendFailure<P>> for Rejected<P> {
    fn from(failure: SendFailure<P>) -> Self {
        Self {
            error: failure.error,
            packet: Some(failure.packet),
        }
    }
}

/// The closed set of operations the stack delegates to the module.
pub enum OffloadRequest<P> {
    TcpClientConnect {
        socket: SocketHandle,
        remote_ip: Ipv4Address,
        remote_port: u16,
        local_port: u16,
    },
    TcpServerListen {
        socket: SocketHandle,
        local_port: u16,
    },
    TcpServerAccept {
        socket: SocketHandle,
        wait_ticks: u32,
    },
    TcpServerUnlisten {
        local_port: u16,
    },
    TcpDisconnect {
        socket: SocketHandle,
    },
    UdpBind {
        socket: SocketHandle,
        local_port: u16,
    },
    UdpUnbind {
        socket: SocketHandle,
    },
    UdpSend {
        socket: SocketHandle,
        packet: P,
        local_ip: Ipv4Address,
        remote_ip: Ipv4Address,
        remote_port: u16,
        wait_ticks: u32,
    },
    TcpSend {
        socket: SocketHandle,
        packet: P,
        wait_ticks: u32,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OffloadReply {
    Done,
    /// Slot bound to the socket.
    Slot(usize),
    /// Peer of an accepted connection.
    Peer(Ipv4Address, u16),
    /// Bytes handed to the module.
    Sent(usize),
}

/// Offload state for one network interface.
pub struct Offload<T, S, const N: usize = DEFAULT_SLOTS> {
    pub(crate) table: Mutex<SlotTable<N>>,
    pub(crate) transport: T,
    pub(crate) stack: S,
    pub(crate) config: OffloadConfig,
    pub(crate) interface: InterfaceId,
    pub(crate) state: AtomicU8,
    pub(crate) poller_priority: AtomicU32,
    pub(crate) wake: AtomicBool,
}

impl<T: WifiTransport, S: NetStack, const N: usize> Offload<T, S, N> {
    pub fn new(transport: T, stack: S, interface: InterfaceId, config: OffloadConfig) -> Self {
        Self {
            table: Mutex::new(SlotTable::new()),
            transport,
            stack,
            config,
            interface,
            state: AtomicU8::new(STATE_UNINITIALIZED),
            poller_priority: AtomicU32::new(0),
            wake: AtomicBool::new(false),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn stack(&self) -> &S {
        &self.stack
    }

    pub fn config(&self) -> &OffloadConfig {
        &self.config
    }

    /// Copy of one slot, for diagnostics.
    pub fn slot(&self, index: usize) -> Option<ConnectionSlot> {
        self.table.lock().slot(index).copied()
    }

    pub fn active_slots(&self) -> usize {
        self.table.lock().active()
    }

    /// Data-ready interrupt from the module; the poller skips its next sleep.
    pub fn notify_data_ready(&self) {
        self.wake.store(true, Ordering::Release);
    }

    fn ensure_enabled(&self) -> OffloadResult<()> {
        if self.link_up() {
            Ok(())
        } else {
            Err(OffloadError::NotEnabled)
        }
    }

    /// Dispatch one socket-layer request.
    pub fn handle(&self, request: OffloadRequest<S::Packet>) -> Result<OffloadReply, Rejected<S::Packet>> {
        match request {
            OffloadRequest::TcpClientConnect {
                socket,
                remote_ip,
                remote_port,
                local_port,
            } => self
                .tcp_client_connect(socket, remote_ip, remote_port, local_port)
                .map(OffloadReply::Slot)
                .map_err(Rejected::from),
            OffloadRequest::TcpServerListen { socket, local_port } => self
                .tcp_server_listen(socket, local_port)
                .map(OffloadReply::Slot)
                .map_err(Rejected::from),
            OffloadRequest::TcpServerAccept { socket, wait_ticks } => self
                .tcp_server_accept(socket, wait_ticks)
                .map(|(ip, port)| OffloadReply::Peer(ip, port))
                .map_err(Rejected::from),
            OffloadRequest::TcpServerUnlisten { local_port } => self
                .tcp_server_unlisten(local_port)
                .map(|()| OffloadReply::Done)
                .map_err(Rejected::from),
            OffloadRequest::TcpDisconnect { socket } => self
                .tcp_disconnect(socket)
                .map(|()| OffloadReply::Done)
                .map_err(Rejected::from),
            OffloadRequest::UdpBind { socket, local_port } => self
                .udp_bind(socket, local_port)
                .map(OffloadReply::Slot)
                .map_err(Rejected::from),
            OffloadRequest::UdpUnbind { socket } => self
                .udp_unbind(socket)
                .map(|()| OffloadReply::Done)
                .map_err(Rejected::from),
            OffloadRequest::UdpSend {
                socket,
                packet,
                local_ip,
                remote_ip,
                remote_port,
                wait_ticks,
            } => self
                .udp_send(socket, packet, local_ip, remote_ip, remote_port, wait_ticks)
                .map(OffloadReply::Sent)
                .map_err(Rejected::from),
            OffloadRequest::TcpSend {
                socket,
                packet,
                wait_ticks,
            } => self
                .tcp_send(socket, packet, wait_ticks)
                .map(OffloadReply::Sent)
                .map_err(Rejected::from),
        }
    }

    /// Open an outbound TCP connection on a fresh slot. The slot is released
    /// again if the module refuses.
    pub fn tcp_client_connect(
        &self,
        socket: SocketHandle,
        remote_ip: Ipv4Address,
        remote_port: u16,
        local_port: u16,
    ) -> OffloadResult<usize> {
        self.ensure_enabled()?;
        let index = {
            let mut table = self.table.lock();
            if table.find(socket).is_some() {
                return Err(OffloadError::AlreadyBound);
            }
            if local_port != 0 && table.find_by_port(local_port, Protocol::Tcp).is_some() {
                return Err(OffloadError::PortUnavailable);
            }
            let index = table.find_or_allocate(socket, true)?;
            table[index].is_client = true;
            index
        };

        // The handshake runs on the module; the table stays usable meanwhile.
        let opened = self.transport.open_client_connection(
            index,
            Protocol::Tcp,
            remote_ip.0,
            remote_port,
            local_port,
        );

        let mut table = self.table.lock();
        let owned = table[index].socket == Some(socket);
        if let Err(err) = opened {
            warn!("tcp slot {} connect to {}:{} failed: {}", index, remote_ip, remote_port, err);
            if owned {
                table.release(index);
            }
            return Err(OffloadError::NotSuccessful);
        }
        if !owned {
            warn!("tcp slot {} released while connecting", index);
            if let Err(err) = self.transport.close_client_connection(index) {
                warn!("tcp slot {} close after lost race failed: {}", index, err);
            }
            return Err(OffloadError::NotSuccessful);
        }
        let slot = &mut table[index];
        slot.remote_ip = remote_ip;
        slot.remote_port = remote_port;
        slot.local_port = local_port;
        slot.connected = true;
        debug!("tcp slot {} connected to {}:{}", index, remote_ip, remote_port);
        Ok(index)
    }

    /// Start a listening slot. Only one slot listens per TCP port: a stale
    /// listener is handed to the new socket, a connected one is kept.
    pub fn tcp_server_listen(&self, socket: SocketHandle, local_port: u16) -> OffloadResult<usize> {
        self.ensure_enabled()?;
        if local_port == 0 {
            return Err(OffloadError::PortUnavailable);
        }
        let mut table = self.table.lock();
        let owned = table.find(socket);
        if let Some(index) = table.find_by_port(local_port, Protocol::Tcp) {
            if table[index].connected {
                return Err(OffloadError::NotSupported);
            }
            if owned.is_some_and(|owned| owned != index) {
                return Err(OffloadError::AlreadyBound);
            }
            table[index].socket = Some(socket);
            debug!("tcp slot {} keeps listening on port {}", index, local_port);
            return Ok(index);
        }
        if owned.is_some() {
            return Err(OffloadError::AlreadyBound);
        }

        let index = table.find_or_allocate(socket, true)?;
        if let Err(err) = self
            .transport
            .start_server(index, Protocol::Tcp, self.config.backlog, local_port)
        {
            warn!("tcp slot {} listen on port {} failed: {}", index, local_port, err);
            table.release(index);
            return Err(OffloadError::NotSuccessful);
        }
        let slot = &mut table[index];
        slot.local_port = local_port;
        slot.is_client = false;
        slot.connected = false;
        debug!("tcp slot {} listening on port {}", index, local_port);
        Ok(index)
    }

    /// Wait for a client on the socket's listening slot. A zero wait polls
    /// once; [`OffloadError::Timeout`] means no client yet.
    pub fn tcp_server_accept(
        &self,
        socket: SocketHandle,
        wait_ticks: u32,
    ) -> OffloadResult<(Ipv4Address, u16)> {
        self.ensure_enabled()?;
        let timeout_ms = ticks_to_ms(wait_ticks, self.config.tick_hz);
        let mut table = self.table.lock();
        let index = table.find(socket).ok_or(OffloadError::NotSuccessful)?;
        let slot = table[index];
        if !slot.is_server() {
            return Err(OffloadError::NotSupported);
        }
        if slot.connected {
            return Ok((slot.remote_ip, slot.remote_port));
        }
        if timeout_ms == 0 {
            return self.accept_locked(&mut table, index);
        }
        drop(table);

        let accepted = self.transport.wait_server_connection(index, timeout_ms);

        let mut table = self.table.lock();
        let slot = table[index];
        if slot.socket != Some(socket) {
            if accepted.is_ok() {
                if let Err(err) = self.transport.close_server_connection(index) {
                    warn!("tcp slot {} close after lost race failed: {}", index, err);
                }
            }
            return Err(OffloadError::NotSuccessful);
        }
        if slot.connected {
            // The receive poller picked the client up first.
            return Ok((slot.remote_ip, slot.remote_port));
        }
        Self::record_accept(&mut table, index, accepted)
    }

    /// One non-blocking accept with the protection lock already held.
    pub(crate) fn accept_locked(
        &self,
        table: &mut SlotTable<N>,
        index: usize,
    ) -> OffloadResult<(Ipv4Address, u16)> {
        let accepted = self.transport.wait_server_connection(index, 0);
        Self::record_accept(table, index, accepted)
    }

    fn record_accept(
        table: &mut SlotTable<N>,
        index: usize,
        accepted: TransportResult<([u8; 4], u16)>,
    ) -> OffloadResult<(Ipv4Address, u16)> {
        match accepted {
            Ok((ip, port)) => {
                let remote_ip = Ipv4Address(ip);
                let slot = &mut table[index];
                slot.remote_ip = remote_ip;
                slot.remote_port = port;
                slot.connected = true;
                debug!("tcp slot {} accepted {}:{}", index, remote_ip, port);
                Ok((remote_ip, port))
            }
            Err(TransportError::Timeout) => Err(OffloadError::Timeout),
            Err(err) => {
                debug!("tcp slot {} accept failed: {}", index, err);
                Err(OffloadError::NotSuccessful)
            }
        }
    }

    /// Stop the listener on `local_port` and free its slot.
    pub fn tcp_server_unlisten(&self, local_port: u16) -> OffloadResult<()> {
        self.ensure_enabled()?;
        let mut table = self.table.lock();
        let index = table
            .find_by_port(local_port, Protocol::Tcp)
            .ok_or(OffloadError::NotSuccessful)?;
        if table[index].connected {
            if let Err(err) = self.transport.close_server_connection(index) {
                warn!("tcp slot {} close on unlisten failed: {}", index, err);
            }
        }
        if let Err(err) = self.transport.stop_server(index) {
            warn!("tcp slot {} stop server failed: {}", index, err);
        }
        table.release(index);
        debug!("tcp slot {} unlisten port {}", index, local_port);
        Ok(())
    }

    /// Close a TCP connection. Client slots are freed; server slots return to
    /// listening and are only freed by unlisten.
    pub fn tcp_disconnect(&self, socket: SocketHandle) -> OffloadResult<()> {
        self.ensure_enabled()?;
        let mut table = self.table.lock();
        let index = table.find(socket).ok_or(OffloadError::NotSuccessful)?;
        let slot = table[index];
        if slot.protocol != Protocol::Tcp {
            return Err(OffloadError::NotSupported);
        }

        if slot.is_client {
            let closed = if slot.connected {
                self.transport.close_client_connection(index)
            } else {
                Ok(())
            };
            table.release(index);
            debug!("tcp client slot {} disconnected", index);
            return closed.map_err(|err| {
                warn!("tcp slot {} close failed: {}", index, err);
                OffloadError::NotSuccessful
            });
        }

        if !slot.connected {
            return Ok(());
        }
        let closed = self.transport.close_server_connection(index);
        let slot = &mut table[index];
        slot.connected = false;
        slot.remote_ip = Ipv4Address::UNSPECIFIED;
        slot.remote_port = 0;
        debug!("tcp server slot {} disconnected, still listening", index);
        closed.map_err(|err| {
            warn!("tcp slot {} close failed: {}", index, err);
            OffloadError::NotSuccessful
        })
    }

    /// Reserve a slot for a UDP socket. The module has no bind command, so
    /// the pseudo-connection is opened on first send.
    pub fn udp_bind(&self, socket: SocketHandle, local_port: u16) -> OffloadResult<usize> {
        self.ensure_enabled()?;
        let mut table = self.table.lock();
        if table.find(socket).is_some() {
            return Err(OffloadError::AlreadyBound);
        }
        let index = table.find_or_allocate(socket, true)?;
        let slot = &mut table[index];
        slot.protocol = Protocol::Udp;
        slot.local_port = local_port;
        slot.remote_port = 0;
        debug!("udp slot {} bound to port {}", index, local_port);
        Ok(index)
    }

    pub fn udp_unbind(&self, socket: SocketHandle) -> OffloadResult<()> {
        self.ensure_enabled()?;
        let mut table = self.table.lock();
        let index = table.find(socket).ok_or(OffloadError::NotSuccessful)?;
        if table[index].remote_port != 0 {
            if let Err(err) = self.transport.close_client_connection(index) {
                warn!("udp slot {} close failed: {}", index, err);
            }
        }
        debug!("udp slot {} unbound from port {}", index, table[index].local_port);
        table.release(index);
        Ok(())
    }

    /// Send one datagram. The first send fixes the peer: the module keeps a
    /// single pseudo-connection per slot and later destinations reuse it.
    pub fn udp_send(
        &self,
        socket: SocketHandle,
        packet: S::Packet,
        local_ip: Ipv4Address,
        remote_ip: Ipv4Address,
        remote_port: u16,
        wait_ticks: u32,
    ) -> Result<usize, SendFailure<S::Packet>> {
        if let Err(error) = self.ensure_enabled() {
            return Err(SendFailure { error, packet });
        }
        let mut table = self.table.lock();
        let Some(index) = table.find(socket) else {
            return Err(SendFailure {
                error: OffloadError::NotSuccessful,
                packet,
            });
        };
        let slot = table[index];
        if slot.protocol != Protocol::Udp {
            return Err(SendFailure {
                error: OffloadError::NotSupported,
                packet,
            });
        }
        if packet.len() > self.config.payload_size || packet.is_chained() {
            warn!("udp slot {} datagram of {} bytes does not fit one module frame", index, packet.len());
            return Err(SendFailure {
                error: OffloadError::NotSuccessful,
                packet,
            });
        }

        if slot.remote_port == 0 {
            if let Err(err) = self.transport.open_client_connection(
                index,
                Protocol::Udp,
                remote_ip.0,
                remote_port,
                slot.local_port,
            ) {
                warn!("udp slot {} connect to {}:{} failed: {}", index, remote_ip, remote_port, err);
                return Err(SendFailure {
                    error: OffloadError::NotSuccessful,
                    packet,
                });
            }
            let slot = &mut table[index];
            slot.local_ip = local_ip;
            slot.remote_ip = remote_ip;
            slot.remote_port = remote_port;
            slot.is_client = true;
            slot.connected = true;
            debug!("udp slot {} connected to {}:{}", index, remote_ip, remote_port);
        } else if slot.remote_ip != remote_ip || slot.remote_port != remote_port {
            debug!(
                "udp slot {} stays on {}:{}, ignoring {}:{}",
                index, slot.remote_ip, slot.remote_port, remote_ip, remote_port
            );
        }

        let timeout_ms = send_timeout_ms(wait_ticks, self.config.tick_hz, self.config.send_timeout_max_ms);
        let outcome = {
            let data = packet.segment(0).unwrap_or(&[]);
            self.transport
                .send_data(index, data, timeout_ms)
                .map(|sent| (sent, data.len()))
        };
        match outcome {
            Ok((sent, expected)) if sent == expected => {
                drop(table);
                self.stack.packet_transmit_release(packet);
                Ok(sent)
            }
            Ok((sent, expected)) => {
                warn!("udp slot {} module took {} of {} bytes", index, sent, expected);
                Err(SendFailure {
                    error: OffloadError::NotSuccessful,
                    packet,
                })
            }
            Err(err) => {
                warn!("udp slot {} send failed: {}", index, err);
                Err(SendFailure {
                    error: OffloadError::NotSuccessful,
                    packet,
                })
            }
        }
    }

    /// Send a packet chain on a connected TCP slot, chunked to the module's
    /// frame size. The packet is released only once every byte went out.
    pub fn tcp_send(
        &self,
        socket: SocketHandle,
        packet: S::Packet,
        wait_ticks: u32,
    ) -> Result<usize, SendFailure<S::Packet>> {
        if let Err(error) = self.ensure_enabled() {
            return Err(SendFailure { error, packet });
        }
        let table = self.table.lock();
        let Some(index) = table.find(socket) else {
            return Err(SendFailure {
                error: OffloadError::NotSuccessful,
                packet,
            });
        };
        let slot = table[index];
        if slot.protocol != Protocol::Tcp {
            return Err(SendFailure {
                error: OffloadError::NotSupported,
                packet,
            });
        }
        if !slot.connected {
            return Err(SendFailure {
                error: OffloadError::NotSuccessful,
                packet,
            });
        }

        let timeout_ms = send_timeout_ms(wait_ticks, self.config.tick_hz, self.config.send_timeout_max_ms);
        match self.send_chain(index, &packet, timeout_ms) {
            Ok(sent) => {
                drop(table);
                self.stack.packet_transmit_release(packet);
                Ok(sent)
            }
            Err(error) => Err(SendFailure { error, packet }),
        }
    }

    fn send_chain(&self, index: usize, packet: &S::Packet, timeout_ms: u32) -> OffloadResult<usize> {
        let frame = self.config.payload_size.max(1);
        let mut total = 0;
        let mut segment_index = 0;
        let mut offset = 0;
        while let Some(segment) = packet.segment(segment_index) {
            if offset >= segment.len() {
                segment_index += 1;
                offset = 0;
                continue;
            }
            let end = segment.len().min(offset + frame);
            let chunk = &segment[offset..end];
            match self.transport.send_data(index, chunk, timeout_ms) {
                // A short send retries the rest of the same buffer.
                Ok(sent) if sent > 0 && sent <= chunk.len() => {
                    offset += sent;
                    total += sent;
                }
                Ok(sent) => {
                    warn!("tcp slot {} module took {} of {} bytes", index, sent, chunk.len());
                    return Err(OffloadError::NotSuccessful);
                }
                Err(err) => {
                    warn!("tcp slot {} send failed: {}", index, err);
                    return Err(OffloadError::NotSuccessful);
                }
            }
        }
        Ok(total)
    }
}
