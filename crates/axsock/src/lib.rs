#![no_std]

// Contracts shared by the offload shim, the TCP/IP stack above it and the WiFi
// module driver below it. Plain handles and traits only, no allocator use.

use core::fmt;

pub use smoltcp::wire::Ipv4Address;

/// Status codes returned to the stack's socket layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OffloadError {
    NotSuccessful,
    NoMoreEntries,
    NotSupported,
    AlreadyBound,
    AlreadyEnabled,
    PortUnavailable,
    /// The operation timed out; the caller may retry.
    Timeout,
    /// The link is not enabled, so no handler is attached.
    NotEnabled,
}

pub type OffloadResult<T> = core::result::Result<T, OffloadError>;

impl fmt::Display for OffloadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::NotSuccessful => "not successful",
            Self::NoMoreEntries => "no more entries",
            Self::NotSupported => "not supported",
            Self::AlreadyBound => "already bound",
            Self::AlreadyEnabled => "already enabled",
            Self::PortUnavailable => "port unavailable",
            Self::Timeout => "timed out",
            Self::NotEnabled => "link not enabled",
        };
        f.write_str(text)
    }
}

/// Failures reported by the WiFi module driver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportError {
    Timeout,
    /// The peer or the module closed the connection.
    Closed,
    Failed,
}

pub type TransportResult<T> = core::result::Result<T, TransportError>;

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Timeout => "transport timeout",
            Self::Closed => "connection closed",
            Self::Failed => "transport failure",
        };
        f.write_str(text)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

/// Non-owning reference to a socket object owned by the stack.
///
/// The value is an index into the stack's own socket table; the shim never
/// dereferences or frees it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SocketHandle(u32);

impl SocketHandle {
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    pub const fn index(self) -> u32 {
        self.0
    }
}

/// Identifies the stack interface a received packet arrived on.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InterfaceId(pub u8);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PacketKind {
    Tcp,
    Udp,
}

impl From<Protocol> for PacketKind {
    fn from(protocol: Protocol) -> Self {
        match protocol {
            Protocol::Tcp => PacketKind::Tcp,
            Protocol::Udp => PacketKind::Udp,
        }
    }
}

/// Snapshot of the stack's receive packet pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolStatus {
    pub available: usize,
    pub payload_size: usize,
}

/// Addressing handed to the stack along with a received UDP datagram.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UdpPeer {
    pub local_ip: Ipv4Address,
    pub remote_ip: Ipv4Address,
    pub remote_port: u16,
}

/// Wait option meaning "do not block".
pub const NO_WAIT: u32 = 0;
/// Wait option meaning "block until done".
pub const WAIT_FOREVER: u32 = u32::MAX;

/// A stack-native packet, possibly a chain of buffers.
pub trait NetPacket {
    /// Total payload length across the whole chain.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Payload of the `index`-th buffer in the chain.
    fn segment(&self, index: usize) -> Option<&[u8]>;

    fn is_chained(&self) -> bool {
        self.segment(1).is_some()
    }

    /// Writable payload area of a freshly allocated packet.
    fn payload_mut(&mut self) -> &mut [u8];

    /// Set the payload length after a receive and tag the arrival interface.
    fn commit(&mut self, len: usize, interface: InterfaceId);
}

/// Services the TCP/IP stack offers to the shim.
pub trait NetStack {
    type Packet: NetPacket;

    fn packet_allocate(&self, kind: PacketKind) -> OffloadResult<Self::Packet>;
    /// Return a receive packet that was never delivered.
    fn packet_release(&self, packet: Self::Packet);
    /// Return a packet whose payload has been fully transmitted.
    fn packet_transmit_release(&self, packet: Self::Packet);
    fn pool_status(&self) -> PoolStatus;

    /// Queue a received TCP packet; `None` signals connection loss.
    fn tcp_socket_packet_receive(&self, socket: SocketHandle, packet: Option<Self::Packet>);
    /// Queue a received UDP datagram; `None` signals connection loss.
    fn udp_socket_packet_receive(
        &self,
        socket: SocketHandle,
        packet: Option<Self::Packet>,
        peer: Option<UdpPeer>,
    );
    /// A listening socket picked up a client in the background.
    fn tcp_socket_established(&self, socket: SocketHandle, remote_ip: Ipv4Address, remote_port: u16);
}

/// Command interface of an offloading WiFi module.
///
/// `slot` is the module's own connection id. Implementations serialize
/// access to the module bus themselves, so every method takes `&self`.
pub trait WifiTransport {
    fn open_client_connection(
        &self,
        slot: usize,
        protocol: Protocol,
        remote_ip: [u8; 4],
        remote_port: u16,
        local_port: u16,
    ) -> TransportResult<()>;
    fn close_client_connection(&self, slot: usize) -> TransportResult<()>;
    fn start_server(
        &self,
        slot: usize,
        protocol: Protocol,
        backlog: u16,
        local_port: u16,
    ) -> TransportResult<()>;
    fn stop_server(&self, slot: usize) -> TransportResult<()>;
    /// Wait for a client on a listening slot and return its address.
    fn wait_server_connection(&self, slot: usize, timeout_ms: u32) -> TransportResult<([u8; 4], u16)>;
    fn close_server_connection(&self, slot: usize) -> TransportResult<()>;
    /// Returns the number of bytes the module accepted.
    fn send_data(&self, slot: usize, data: &[u8], timeout_ms: u32) -> TransportResult<usize>;
    /// Returns the number of bytes read; zero means nothing pending.
    fn receive_data(&self, slot: usize, buf: &mut [u8], timeout_ms: u32) -> TransportResult<usize>;
}

#[cfg(test)]
extern crate std;
