//! Minimal stack side: a counted packet pool and per-socket inboxes.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use axsock::{
    InterfaceId, Ipv4Address, NetPacket, NetStack, OffloadError, OffloadResult, PacketKind,
    PoolStatus, SocketHandle, UdpPeer,
};
use log::{debug, info};
use spin::Mutex;

pub struct SimPacket {
    parts: Vec<Vec<u8>>,
}

impl SimPacket {
    pub fn from_bytes(data: &[u8]) -> Self {
        Self {
            parts: vec![data.to_vec()],
        }
    }

    /// Split `data` into a chain of `chunk`-sized buffers.
    pub fn chain(data: &[u8], chunk: usize) -> Self {
        Self {
            parts: data.chunks(chunk.max(1)).map(<[u8]>::to_vec).collect(),
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.parts.concat()
    }
}

impl NetPacket for SimPacket {
    fn len(&self) -> usize {
        self.parts.iter().map(Vec::len).sum()
    }

    fn segment(&self, index: usize) -> Option<&[u8]> {
        self.parts.get(index).map(Vec::as_slice)
    }

    fn payload_mut(&mut self) -> &mut [u8] {
        match self.parts.first_mut() {
            Some(part) => part.as_mut_slice(),
            None => &mut [],
        }
    }

    fn commit(&mut self, len: usize, _interface: InterfaceId) {
        if let Some(part) = self.parts.first_mut() {
            part.truncate(len);
        }
    }
}

/// Something the shim handed to a socket.
#[derive(Debug)]
pub enum Inbound {
    Data(Vec<u8>),
    Datagram(Vec<u8>, UdpPeer),
    Closed,
    Established(Ipv4Address, u16),
}

pub struct SimStack {
    payload_size: usize,
    available: AtomicUsize,
    inbox: Mutex<VecDeque<(SocketHandle, Inbound)>>,
}

impl SimStack {
    pub fn new(packets: usize, payload_size: usize) -> Self {
        Self {
            payload_size,
            available: AtomicUsize::new(packets),
            inbox: Mutex::new(VecDeque::new()),
        }
    }

    /// Oldest event queued for `socket`.
    pub fn take(&self, socket: SocketHandle) -> Option<Inbound> {
        let mut inbox = self.inbox.lock();
        let position = inbox.iter().position(|(owner, _)| *owner == socket)?;
        inbox.remove(position).map(|(_, event)| event)
    }

    fn push(&self, socket: SocketHandle, event: Inbound) {
        debug!("socket {} <- {:?}", socket.index(), event);
        self.inbox.lock().push_back((socket, event));
    }

    fn recycle(&self) {
        self.available.fetch_add(1, Ordering::AcqRel);
    }
}

impl NetStack for SimStack {
    type Packet = SimPacket;

    fn packet_allocate(&self, _kind: PacketKind) -> OffloadResult<SimPacket> {
        self.available
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |free| free.checked_sub(1))
            .map_err(|_| OffloadError::NoMoreEntries)?;
        Ok(SimPacket {
            parts: vec![vec![0; self.payload_size]],
        })
    }

    fn packet_release(&self, _packet: SimPacket) {
        self.recycle();
    }

    fn packet_transmit_release(&self, packet: SimPacket) {
        debug!("transmitted {} bytes", packet.len());
    }

    fn pool_status(&self) -> PoolStatus {
        PoolStatus {
            available: self.available.load(Ordering::Acquire),
            payload_size: self.payload_size,
        }
    }

    fn tcp_socket_packet_receive(&self, socket: SocketHandle, packet: Option<SimPacket>) {
        let event = match packet {
            Some(packet) => {
                // The application copies the payload out, so the buffer goes
                // straight back to the pool.
                self.recycle();
                Inbound::Data(packet.into_bytes())
            }
            None => Inbound::Closed,
        };
        self.push(socket, event);
    }

    fn udp_socket_packet_receive(
        &self,
        socket: SocketHandle,
        packet: Option<SimPacket>,
        peer: Option<UdpPeer>,
    ) {
        let event = match (packet, peer) {
            (Some(packet), Some(peer)) => {
                self.recycle();
                Inbound::Datagram(packet.into_bytes(), peer)
            }
            (Some(_), None) => {
                self.recycle();
                Inbound::Closed
            }
            (None, _) => Inbound::Closed,
        };
        self.push(socket, event);
    }

    fn tcp_socket_established(&self, socket: SocketHandle, remote_ip: Ipv4Address, remote_port: u16) {
        info!("socket {} accepted {}:{}", socket.index(), remote_ip, remote_port);
        self.push(socket, Inbound::Established(remote_ip, remote_port));
    }
}
