//! In-memory module and stack doubles shared by the unit tests.

use core::cell::{Cell, RefCell};
use core::sync::atomic::AtomicBool;
use std::collections::{BTreeMap, VecDeque};
use std::vec;
use std::vec::Vec;

use axsock::{
    InterfaceId, Ipv4Address, NetPacket, NetStack, OffloadError, OffloadResult, PacketKind,
    PoolStatus, Protocol, SocketHandle, TransportError, TransportResult, UdpPeer, WifiTransport,
};

use crate::config::OffloadConfig;
use crate::handler::Offload;
use crate::poller::Sleeper;

pub type TestOffload = Offload<MockChip, MockStack, 4>;

pub fn sock(id: u32) -> SocketHandle {
    SocketHandle::new(id)
}

/// Enabled interface with 16 free 1536-byte pool packets.
pub fn offload() -> TestOffload {
    offload_with(OffloadConfig::new(), 16)
}

pub fn offload_with(config: OffloadConfig, available: usize) -> TestOffload {
    let off = TestOffload::new(
        MockChip::default(),
        MockStack::new(available, 1536),
        InterfaceId(1),
        config,
    );
    off.initialize(0).unwrap();
    off.enable().unwrap();
    off
}

/// Initialized interface whose link was never enabled.
pub fn offload_disabled() -> TestOffload {
    let off = TestOffload::new(
        MockChip::default(),
        MockStack::new(16, 1536),
        InterfaceId(1),
        OffloadConfig::new(),
    );
    off.initialize(0).unwrap();
    off
}

/// Number of recorded module commands matching `pred`.
pub fn chip_call(off: &TestOffload, pred: impl Fn(&ChipCall) -> bool) -> usize {
    off.transport().calls().iter().filter(|call| pred(call)).count()
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TestPacket {
    parts: Vec<Vec<u8>>,
    interface: Option<InterfaceId>,
}

impl TestPacket {
    pub fn from_parts(parts: &[&[u8]]) -> Self {
        Self {
            parts: parts.iter().map(|part| part.to_vec()).collect(),
            interface: None,
        }
    }

    /// Chain of buffers with the given sizes, filled with a running pattern.
    pub fn filled(sizes: &[usize]) -> Self {
        let mut next = 0u32;
        let parts: Vec<Vec<u8>> = sizes
            .iter()
            .map(|&size| {
                (0..size)
                    .map(|_| {
                        next += 1;
                        (next % 251) as u8
                    })
                    .collect()
            })
            .collect();
        Self { parts, interface: None }
    }

    fn receive_buffer(size: usize) -> Self {
        Self {
            parts: vec![vec![0; size]],
            interface: None,
        }
    }

    pub fn bytes(&self) -> Vec<u8> {
        self.parts.concat()
    }
}

impl NetPacket for TestPacket {
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

    fn commit(&mut self, len: usize, interface: InterfaceId) {
        if let Some(part) = self.parts.first_mut() {
            part.truncate(len);
        }
        self.interface = Some(interface);
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChipCall {
    Open {
        slot: usize,
        protocol: Protocol,
        ip: [u8; 4],
        port: u16,
        local_port: u16,
    },
    CloseClient { slot: usize },
    StartServer { slot: usize, backlog: u16, port: u16 },
    StopServer { slot: usize },
    WaitServer { slot: usize, timeout_ms: u32 },
    CloseServer { slot: usize },
    Send { slot: usize, len: usize, timeout_ms: u32 },
}

#[derive(Default)]
struct ChipState {
    calls: Vec<ChipCall>,
    open_error: Option<TransportError>,
    start_server_fails: bool,
    clients: VecDeque<([u8; 4], u16)>,
    send_limit: Option<usize>,
    sends_before_failure: Option<usize>,
    sent: BTreeMap<usize, Vec<u8>>,
    rx: BTreeMap<usize, VecDeque<TransportResult<Vec<u8>>>>,
    receive_calls: usize,
}

/// Scripted WiFi module.
#[derive(Default)]
pub struct MockChip {
    state: RefCell<ChipState>,
}

impl MockChip {
    pub fn calls(&self) -> Vec<ChipCall> {
        self.state.borrow().calls.clone()
    }

    /// Fail the next open command.
    pub fn fail_open(&self, err: TransportError) {
        self.state.borrow_mut().open_error = Some(err);
    }

    /// Fail the next start-server command.
    pub fn fail_start_server(&self) {
        self.state.borrow_mut().start_server_fails = true;
    }

    /// Queue a client for the next accept on any listening slot.
    pub fn queue_client(&self, ip: [u8; 4], port: u16) {
        self.state.borrow_mut().clients.push_back((ip, port));
    }

    /// Accept at most `max` bytes per send command.
    pub fn limit_send(&self, max: usize) {
        self.state.borrow_mut().send_limit = Some(max);
    }

    /// Let `count` send commands succeed, then fail the rest.
    pub fn fail_send_after(&self, count: usize) {
        self.state.borrow_mut().sends_before_failure = Some(count);
    }

    pub fn sent_bytes(&self, slot: usize) -> Vec<u8> {
        self.state.borrow().sent.get(&slot).cloned().unwrap_or_default()
    }

    pub fn push_rx(&self, slot: usize, data: &[u8]) {
        self.state
            .borrow_mut()
            .rx
            .entry(slot)
            .or_default()
            .push_back(Ok(data.to_vec()));
    }

    pub fn push_rx_error(&self, slot: usize, err: TransportError) {
        self.state.borrow_mut().rx.entry(slot).or_default().push_back(Err(err));
    }

    pub fn receive_calls(&self) -> usize {
        self.state.borrow().receive_calls
    }
}

impl WifiTransport for MockChip {
    fn open_client_connection(
        &self,
        slot: usize,
        protocol: Protocol,
        remote_ip: [u8; 4],
        remote_port: u16,
        local_port: u16,
    ) -> TransportResult<()> {
        let mut state = self.state.borrow_mut();
        state.calls.push(ChipCall::Open {
            slot,
            protocol,
            ip: remote_ip,
            port: remote_port,
            local_port,
        });
        match state.open_error.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn close_client_connection(&self, slot: usize) -> TransportResult<()> {
        self.state.borrow_mut().calls.push(ChipCall::CloseClient { slot });
        Ok(())
    }

    fn start_server(
        &self,
        slot: usize,
        _protocol: Protocol,
        backlog: u16,
        local_port: u16,
    ) -> TransportResult<()> {
        let mut state = self.state.borrow_mut();
        state.calls.push(ChipCall::StartServer {
            slot,
            backlog,
            port: local_port,
        });
        if core::mem::take(&mut state.start_server_fails) {
            return Err(TransportError::Failed);
        }
        Ok(())
    }

    fn stop_server(&self, slot: usize) -> TransportResult<()> {
        self.state.borrow_mut().calls.push(ChipCall::StopServer { slot });
        Ok(())
    }

    fn wait_server_connection(&self, slot: usize, timeout_ms: u32) -> TransportResult<([u8; 4], u16)> {
        let mut state = self.state.borrow_mut();
        state.calls.push(ChipCall::WaitServer { slot, timeout_ms });
        state.clients.pop_front().ok_or(TransportError::Timeout)
    }

    fn close_server_connection(&self, slot: usize) -> TransportResult<()> {
        self.state.borrow_mut().calls.push(ChipCall::CloseServer { slot });
        Ok(())
    }

    fn send_data(&self, slot: usize, data: &[u8], timeout_ms: u32) -> TransportResult<usize> {
        let mut state = self.state.borrow_mut();
        state.calls.push(ChipCall::Send {
            slot,
            len: data.len(),
            timeout_ms,
        });
        if let Some(left) = state.sends_before_failure.as_mut() {
            if *left == 0 {
                return Err(TransportError::Failed);
            }
            *left -= 1;
        }
        let taken = state.send_limit.map_or(data.len(), |max| data.len().min(max));
        state
            .sent
            .entry(slot)
            .or_default()
            .extend_from_slice(&data[..taken]);
        Ok(taken)
    }

    fn receive_data(&self, slot: usize, buf: &mut [u8], _timeout_ms: u32) -> TransportResult<usize> {
        let mut state = self.state.borrow_mut();
        state.receive_calls += 1;
        let Some(queue) = state.rx.get_mut(&slot) else {
            return Ok(0);
        };
        match queue.pop_front() {
            None => Ok(0),
            Some(Err(err)) => Err(err),
            Some(Ok(mut data)) => {
                let len = data.len().min(buf.len());
                buf[..len].copy_from_slice(&data[..len]);
                if len < data.len() {
                    queue.push_front(Ok(data.split_off(len)));
                }
                Ok(len)
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Delivery {
    Tcp {
        socket: SocketHandle,
        data: Option<Vec<u8>>,
        interface: Option<InterfaceId>,
    },
    Udp {
        socket: SocketHandle,
        data: Option<Vec<u8>>,
        peer: Option<UdpPeer>,
    },
    Established {
        socket: SocketHandle,
        remote_ip: Ipv4Address,
        remote_port: u16,
    },
}

struct StackState {
    available: usize,
    allocated: usize,
    released: usize,
    transmit_released: usize,
    deliveries: Vec<Delivery>,
}

/// Stack side: a counted packet pool and a log of everything delivered.
pub struct MockStack {
    payload_size: usize,
    state: RefCell<StackState>,
}

impl MockStack {
    pub fn new(available: usize, payload_size: usize) -> Self {
        Self {
            payload_size,
            state: RefCell::new(StackState {
                available,
                allocated: 0,
                released: 0,
                transmit_released: 0,
                deliveries: Vec::new(),
            }),
        }
    }

    pub fn deliveries(&self) -> Vec<Delivery> {
        self.state.borrow().deliveries.clone()
    }

    /// Receive packets handed back undelivered.
    pub fn released(&self) -> usize {
        self.state.borrow().released
    }

    pub fn allocated(&self) -> usize {
        self.state.borrow().allocated
    }

    pub fn transmit_released(&self) -> usize {
        self.state.borrow().transmit_released
    }
}

impl NetStack for MockStack {
    type Packet = TestPacket;

    fn packet_allocate(&self, _kind: PacketKind) -> OffloadResult<TestPacket> {
        let mut state = self.state.borrow_mut();
        if state.available == 0 {
            return Err(OffloadError::NoMoreEntries);
        }
        state.available -= 1;
        state.allocated += 1;
        Ok(TestPacket::receive_buffer(self.payload_size))
    }

    fn packet_release(&self, _packet: TestPacket) {
        let mut state = self.state.borrow_mut();
        state.available += 1;
        state.released += 1;
    }

    fn packet_transmit_release(&self, _packet: TestPacket) {
        self.state.borrow_mut().transmit_released += 1;
    }

    fn pool_status(&self) -> PoolStatus {
        PoolStatus {
            available: self.state.borrow().available,
            payload_size: self.payload_size,
        }
    }

    fn tcp_socket_packet_receive(&self, socket: SocketHandle, packet: Option<TestPacket>) {
        let delivery = Delivery::Tcp {
            socket,
            interface: packet.as_ref().and_then(|packet| packet.interface),
            data: packet.map(|packet| packet.bytes()),
        };
        self.state.borrow_mut().deliveries.push(delivery);
    }

    fn udp_socket_packet_receive(
        &self,
        socket: SocketHandle,
        packet: Option<TestPacket>,
        peer: Option<UdpPeer>,
    ) {
        let delivery = Delivery::Udp {
            socket,
            data: packet.map(|packet| packet.bytes()),
            peer,
        };
        self.state.borrow_mut().deliveries.push(delivery);
    }

    fn tcp_socket_established(&self, socket: SocketHandle, remote_ip: Ipv4Address, remote_port: u16) {
        self.state.borrow_mut().deliveries.push(Delivery::Established {
            socket,
            remote_ip,
            remote_port,
        });
    }
}

/// Records naps and takes the link down after a fixed number of them.
pub struct TestSleeper<'a> {
    off: &'a TestOffload,
    remaining: Cell<usize>,
    naps: RefCell<Vec<u32>>,
}

impl<'a> TestSleeper<'a> {
    pub fn new(off: &'a TestOffload, naps_before_disable: usize) -> Self {
        Self {
            off,
            remaining: Cell::new(naps_before_disable),
            naps: RefCell::new(Vec::new()),
        }
    }

    pub fn naps(&self) -> Vec<u32> {
        self.naps.borrow().clone()
    }
}

impl Sleeper for TestSleeper<'_> {
    fn sleep_ms(&self, ms: u32, _wake: &AtomicBool) {
        self.naps.borrow_mut().push(ms);
        let left = self.remaining.get().saturating_sub(1);
        self.remaining.set(left);
        if left == 0 {
            let _ = self.off.disable();
        }
    }
}
