#![no_std]
//! TCP/IP offload shim for WiFi modules that run the connections themselves.
//!
//! The stack's sockets are multiplexed onto the module's fixed connection
//! slots. Outbound requests go through [`Offload::handle`]; inbound data is
//! pulled by [`Offload::run_poller`] on a dedicated thread.

#[cfg(test)]
extern crate std;

pub mod config;
mod driver;
mod handler;
mod poller;
mod slot;
mod socket;
mod time;

#[cfg(test)]
mod testutil;

pub use config::OffloadConfig;
pub use driver::{Capabilities, LinkState};
pub use handler::{Offload, OffloadReply, OffloadRequest, Rejected, SendFailure};
pub use poller::{PassReport, Sleeper};
pub use slot::{ConnectionSlot, SlotTable};
pub use socket::{
    tcp_client_socket_connect, tcp_server_socket_accept, tcp_server_socket_listen,
    tcp_server_socket_unlisten, tcp_socket_disconnect, tcp_socket_send, udp_socket_bind,
    udp_socket_send, udp_socket_unbind,
};
pub use time::{send_timeout_ms, ticks_to_ms};

pub use axsock::{
    InterfaceId, Ipv4Address, NetPacket, NetStack, OffloadError, OffloadResult, PacketKind,
    PoolStatus, Protocol, SocketHandle, TransportError, TransportResult, UdpPeer, WifiTransport,
    NO_WAIT, WAIT_FOREVER,
};
