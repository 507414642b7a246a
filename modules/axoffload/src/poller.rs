//! Deferred receive poller.
//!
//! The module never pushes data, so a background thread, one priority level
//! below the stack's IP thread, scans the slot table, drains whatever the
//! module buffered and injects stack packets. The protection lock is held for
//! the whole pass, module commands included.

use core::sync::atomic::{AtomicBool, Ordering};

use axsock::{
    NetPacket, NetStack, PacketKind, Protocol, SocketHandle, TransportError, UdpPeer,
    WifiTransport,
};
use log::{debug, warn};

use crate::handler::Offload;
use crate::slot::{ConnectionSlot, SlotTable};
use crate::time::ticks_to_ms;

/// Sleep primitive of the thread running the poller.
pub trait Sleeper {
    /// Sleep for up to `ms`, returning early once `wake` is raised.
    fn sleep_ms(&self, ms: u32, wake: &AtomicBool);
}

/// What one receive pass did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PassReport {
    pub delivered: usize,
    pub accepted: usize,
    /// Slots whose connection was reported lost.
    pub lost: usize,
    /// A listening slot had no client waiting.
    pub accept_pending: bool,
    /// Receiving stopped because the packet pool ran low.
    pub starved: bool,
}

impl<T: WifiTransport, S: NetStack, const N: usize> Offload<T, S, N> {
    /// Run receive passes until the link is disabled.
    pub fn run_poller<Z: Sleeper>(&self, sleeper: &Z) {
        let interval_ms = ticks_to_ms(self.config.poll_interval_ticks, self.config.tick_hz);
        debug!("receive poller running every {} ms", interval_ms);
        while self.link_up() {
            let report = self.poll_pass();
            if report.accept_pending || !self.wake.swap(false, Ordering::AcqRel) {
                sleeper.sleep_ms(interval_ms, &self.wake);
            }
        }
        debug!("receive poller stopped");
    }

    /// One scan over every slot in ascending order.
    pub fn poll_pass(&self) -> PassReport {
        let mut report = PassReport::default();
        let mut table = self.table.lock();
        for index in 0..N {
            let slot = table[index];
            let Some(socket) = slot.socket else {
                continue;
            };
            if slot.local_port == 0 && slot.remote_port == 0 {
                continue;
            }

            if slot.is_server() && !slot.connected {
                match self.accept_locked(&mut table, index) {
                    Ok((remote_ip, remote_port)) => {
                        self.stack.tcp_socket_established(socket, remote_ip, remote_port);
                        report.accepted += 1;
                    }
                    Err(_) => {
                        report.accept_pending = true;
                        if self.config.accept_blocks_pass {
                            break;
                        }
                        continue;
                    }
                }
            } else if slot.protocol == Protocol::Tcp && !slot.connected {
                // Client lost its connection.
                continue;
            }

            self.drain_slot(&mut table, index, socket, &mut report);
        }
        report
    }

    fn pool_has_headroom(&self) -> bool {
        let pool = self.stack.pool_status();
        let needed = self.config.payload_size + self.config.reserved_packets * pool.payload_size;
        pool.available.saturating_mul(pool.payload_size) >= needed
    }

    fn drain_slot(
        &self,
        table: &mut SlotTable<N>,
        index: usize,
        socket: SocketHandle,
        report: &mut PassReport,
    ) {
        let protocol = table[index].protocol;
        loop {
            if !self.pool_has_headroom() {
                report.starved = true;
                break;
            }
            let Ok(mut packet) = self.stack.packet_allocate(PacketKind::from(protocol)) else {
                report.starved = true;
                break;
            };

            let received = {
                let buf = packet.payload_mut();
                let cap = buf.len().min(self.config.payload_size);
                self.transport
                    .receive_data(index, &mut buf[..cap], 0)
                    .map(|len| len.min(cap))
            };
            match received {
                Ok(0) | Err(TransportError::Timeout) => {
                    self.stack.packet_release(packet);
                    break;
                }
                Ok(len) => {
                    packet.commit(len, self.interface);
                    self.deliver(&table[index], socket, Some(packet));
                    report.delivered += 1;
                }
                Err(err) => {
                    warn!("slot {} receive failed: {}", index, err);
                    self.stack.packet_release(packet);
                    self.deliver(&table[index], socket, None);
                    // UDP keeps its pseudo-connection and stays polled.
                    if protocol == Protocol::Tcp {
                        table[index].connected = false;
                    }
                    report.lost += 1;
                    break;
                }
            }
        }
    }

    fn deliver(&self, slot: &ConnectionSlot, socket: SocketHandle, packet: Option<S::Packet>) {
        match slot.protocol {
            Protocol::Tcp => self.stack.tcp_socket_packet_receive(socket, packet),
            Protocol::Udp => {
                let peer = packet.as_ref().map(|_| UdpPeer {
                    local_ip: slot.local_ip,
                    remote_ip: slot.remote_ip,
                    remote_port: slot.remote_port,
                });
                self.stack.udp_socket_packet_receive(socket, packet, peer);
            }
        }
    }
}
