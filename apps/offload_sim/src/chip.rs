//! Simulated offloading WiFi module.
//!
//! Client connections talk to an echo peer: whatever is sent comes back on
//! the same connection id. Listening slots pick up clients queued with
//! [`SimChip::queue_client`], each of which sends one greeting.

use std::collections::VecDeque;
use std::thread;
use std::time::{Duration, Instant};

use axsock::{Protocol, TransportError, TransportResult, WifiTransport};
use log::trace;
use spin::Mutex;

#[derive(Default)]
struct SimConn {
    open: bool,
    listening: bool,
    local_port: u16,
    rx: VecDeque<Vec<u8>>,
    /// Bytes the remote end received.
    delivered: Vec<u8>,
}

struct PendingClient {
    port: u16,
    peer: ([u8; 4], u16),
    greeting: Vec<u8>,
}

pub struct SimChip {
    conns: Mutex<Vec<SimConn>>,
    clients: Mutex<VecDeque<PendingClient>>,
}

impl SimChip {
    pub fn new(slots: usize) -> Self {
        Self {
            conns: Mutex::new((0..slots).map(|_| SimConn::default()).collect()),
            clients: Mutex::new(VecDeque::new()),
        }
    }

    /// A remote client that will connect to `port` and send `greeting`.
    pub fn queue_client(&self, port: u16, peer: ([u8; 4], u16), greeting: &[u8]) {
        self.clients.lock().push_back(PendingClient {
            port,
            peer,
            greeting: greeting.to_vec(),
        });
    }

    /// What the remote side of `slot` has received so far.
    pub fn delivered(&self, slot: usize) -> Vec<u8> {
        self.conns
            .lock()
            .get(slot)
            .map(|conn| conn.delivered.clone())
            .unwrap_or_default()
    }

    fn with_conn<R>(
        &self,
        slot: usize,
        f: impl FnOnce(&mut SimConn) -> TransportResult<R>,
    ) -> TransportResult<R> {
        let mut conns = self.conns.lock();
        let conn = conns.get_mut(slot).ok_or(TransportError::Failed)?;
        f(conn)
    }

    fn try_accept(&self, slot: usize) -> TransportResult<([u8; 4], u16)> {
        let mut conns = self.conns.lock();
        let conn = conns.get_mut(slot).ok_or(TransportError::Failed)?;
        if !conn.listening {
            return Err(TransportError::Failed);
        }
        if conn.open {
            return Err(TransportError::Timeout);
        }
        let mut clients = self.clients.lock();
        let position = clients
            .iter()
            .position(|client| client.port == conn.local_port)
            .ok_or(TransportError::Timeout)?;
        let client = clients.remove(position).ok_or(TransportError::Timeout)?;
        conn.open = true;
        conn.rx.push_back(client.greeting);
        Ok(client.peer)
    }
}

impl WifiTransport for SimChip {
    fn open_client_connection(
        &self,
        slot: usize,
        protocol: Protocol,
        remote_ip: [u8; 4],
        remote_port: u16,
        local_port: u16,
    ) -> TransportResult<()> {
        trace!(
            "chip: open {:?} #{} to {:?}:{} from port {}",
            protocol, slot, remote_ip, remote_port, local_port
        );
        self.with_conn(slot, |conn| {
            if conn.open || conn.listening {
                return Err(TransportError::Failed);
            }
            *conn = SimConn {
                open: true,
                local_port,
                ..SimConn::default()
            };
            Ok(())
        })
    }

    fn close_client_connection(&self, slot: usize) -> TransportResult<()> {
        trace!("chip: close #{}", slot);
        self.with_conn(slot, |conn| {
            *conn = SimConn::default();
            Ok(())
        })
    }

    fn start_server(
        &self,
        slot: usize,
        protocol: Protocol,
        backlog: u16,
        local_port: u16,
    ) -> TransportResult<()> {
        trace!("chip: {:?} server #{} on port {}, backlog {}", protocol, slot, local_port, backlog);
        self.with_conn(slot, |conn| {
            *conn = SimConn {
                listening: true,
                local_port,
                ..SimConn::default()
            };
            Ok(())
        })
    }

    fn stop_server(&self, slot: usize) -> TransportResult<()> {
        trace!("chip: stop server #{}", slot);
        self.with_conn(slot, |conn| {
            *conn = SimConn::default();
            Ok(())
        })
    }

    fn wait_server_connection(&self, slot: usize, timeout_ms: u32) -> TransportResult<([u8; 4], u16)> {
        let deadline = Instant::now() + Duration::from_millis(u64::from(timeout_ms));
        loop {
            match self.try_accept(slot) {
                Err(TransportError::Timeout) if Instant::now() < deadline => {
                    thread::sleep(Duration::from_millis(5));
                }
                other => return other,
            }
        }
    }

    fn close_server_connection(&self, slot: usize) -> TransportResult<()> {
        trace!("chip: drop client on #{}", slot);
        self.with_conn(slot, |conn| {
            conn.open = false;
            conn.rx.clear();
            Ok(())
        })
    }

    fn send_data(&self, slot: usize, data: &[u8], _timeout_ms: u32) -> TransportResult<usize> {
        self.with_conn(slot, |conn| {
            if !conn.open {
                return Err(TransportError::Closed);
            }
            conn.delivered.extend_from_slice(data);
            if !conn.listening {
                conn.rx.push_back(data.to_vec());
            }
            Ok(data.len())
        })
    }

    fn receive_data(&self, slot: usize, buf: &mut [u8], _timeout_ms: u32) -> TransportResult<usize> {
        self.with_conn(slot, |conn| {
            // A bound UDP id with no peer yet has nothing pending.
            if !conn.open {
                return Ok(0);
            }
            let Some(mut data) = conn.rx.pop_front() else {
                return Ok(0);
            };
            let len = data.len().min(buf.len());
            buf[..len].copy_from_slice(&data[..len]);
            if len < data.len() {
                conn.rx.push_front(data.split_off(len));
            }
            Ok(len)
        })
    }
}
