//! Host-side run of the offload shim against a simulated WiFi module.
//!
//! Brings the link up, starts the receive poller on its own thread and walks
//! one TCP client, one UDP socket and one TCP server through a full session.

mod chip;
mod stack;

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use axoffload::{
    tcp_client_socket_connect, tcp_server_socket_listen, tcp_server_socket_unlisten,
    tcp_socket_disconnect, tcp_socket_send, udp_socket_bind, udp_socket_send, udp_socket_unbind,
    InterfaceId, Ipv4Address, Offload, OffloadConfig, OffloadError, OffloadResult, Sleeper,
    SocketHandle, NO_WAIT,
};
use log::{error, info};

use chip::SimChip;
use stack::{Inbound, SimPacket, SimStack};

const SLOTS: usize = 4;
const IP_THREAD_PRIORITY: u32 = 3;
const POOL_PACKETS: usize = 32;
const POOL_PAYLOAD: usize = 1536;
const LOCAL_IP: Ipv4Address = Ipv4Address([10, 0, 0, 2]);
const ECHO_PEER: Ipv4Address = Ipv4Address([10, 0, 0, 1]);
const ECHO_PORT: u16 = 7;
const SERVER_PORT: u16 = 8080;
const SESSION_TIMEOUT: Duration = Duration::from_secs(2);
const NAP_SLICE: Duration = Duration::from_millis(5);

type SimOffload = Offload<SimChip, SimStack, SLOTS>;

/// Sleeps in short slices so a data-ready wake cuts the nap short.
struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep_ms(&self, ms: u32, wake: &AtomicBool) {
        let deadline = Instant::now() + Duration::from_millis(u64::from(ms));
        while !wake.load(Ordering::Acquire) {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep((deadline - now).min(NAP_SLICE));
        }
    }
}

fn wait_for<R>(mut probe: impl FnMut() -> Option<R>) -> OffloadResult<R> {
    let deadline = Instant::now() + SESSION_TIMEOUT;
    loop {
        if let Some(found) = probe() {
            return Ok(found);
        }
        if Instant::now() >= deadline {
            return Err(OffloadError::Timeout);
        }
        thread::sleep(NAP_SLICE);
    }
}

fn slot_of(offload: &SimOffload, socket: SocketHandle) -> OffloadResult<usize> {
    (0..SLOTS)
        .find(|&index| offload.slot(index).and_then(|slot| slot.socket) == Some(socket))
        .ok_or(OffloadError::NotSuccessful)
}

fn tcp_echo(offload: &SimOffload) -> OffloadResult<()> {
    let socket = SocketHandle::new(1);
    tcp_client_socket_connect(offload, socket, ECHO_PEER, ECHO_PORT, 0)?;

    let payload: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
    let sent = tcp_socket_send(offload, socket, SimPacket::chain(&payload, 1000), NO_WAIT)
        .map_err(|rejected| rejected.error)?;
    offload.notify_data_ready();

    let mut echoed = Vec::new();
    while echoed.len() < payload.len() {
        match wait_for(|| offload.stack().take(socket))? {
            Inbound::Data(data) => echoed.extend_from_slice(&data),
            other => {
                error!("tcp echo: unexpected {:?}", other);
                return Err(OffloadError::NotSuccessful);
            }
        }
    }
    if echoed != payload {
        error!("tcp echo: payload mismatch");
        return Err(OffloadError::NotSuccessful);
    }
    info!("tcp echo: {} bytes out, {} back", sent, echoed.len());
    tcp_socket_disconnect(offload, socket)
}

fn udp_echo(offload: &SimOffload) -> OffloadResult<()> {
    let socket = SocketHandle::new(2);
    udp_socket_bind(offload, socket, 5000)?;
    udp_socket_send(
        offload,
        socket,
        SimPacket::from_bytes(b"ping"),
        LOCAL_IP,
        ECHO_PEER,
        ECHO_PORT,
        NO_WAIT,
    )
    .map_err(|rejected| rejected.error)?;
    offload.notify_data_ready();

    match wait_for(|| offload.stack().take(socket))? {
        Inbound::Datagram(data, peer) if data == b"ping" => {
            info!("udp echo: reply from {}:{}", peer.remote_ip, peer.remote_port);
        }
        other => {
            error!("udp echo: unexpected {:?}", other);
            return Err(OffloadError::NotSuccessful);
        }
    }
    udp_socket_unbind(offload, socket)
}

fn tcp_server(offload: &SimOffload) -> OffloadResult<()> {
    let socket = SocketHandle::new(3);
    tcp_server_socket_listen(offload, socket, SERVER_PORT)?;
    let slot = slot_of(offload, socket)?;
    offload
        .transport()
        .queue_client(SERVER_PORT, ([10, 0, 0, 42], 51000), b"GET /status");
    offload.notify_data_ready();

    let mut greeted = false;
    let mut peer = None;
    while !(greeted && peer.is_some()) {
        match wait_for(|| offload.stack().take(socket))? {
            Inbound::Established(ip, port) => peer = Some((ip, port)),
            Inbound::Data(data) => {
                info!("tcp server: request {:?}", String::from_utf8_lossy(&data));
                greeted = true;
            }
            other => {
                error!("tcp server: unexpected {:?}", other);
                return Err(OffloadError::NotSuccessful);
            }
        }
    }
    tcp_socket_send(offload, socket, SimPacket::from_bytes(b"200 OK"), NO_WAIT)
        .map_err(|rejected| rejected.error)?;
    info!(
        "tcp server: client got {:?}",
        String::from_utf8_lossy(&offload.transport().delivered(slot))
    );

    tcp_socket_disconnect(offload, socket)?;
    tcp_server_socket_unlisten(offload, SERVER_PORT)
}

fn session(offload: &SimOffload) -> OffloadResult<()> {
    tcp_echo(offload)?;
    udp_echo(offload)?;
    tcp_server(offload)?;
    info!("session done, {} slots in use", offload.active_slots());
    Ok(())
}

fn main() -> Result<(), OffloadError> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = OffloadConfig::new().with_poll_interval_ticks(5);
    let offload = SimOffload::new(
        SimChip::new(SLOTS),
        SimStack::new(POOL_PACKETS, POOL_PAYLOAD),
        InterfaceId(0),
        config,
    );
    let priority = offload.initialize(IP_THREAD_PRIORITY)?;
    info!("receive poller would run at priority {}", priority);
    offload.enable()?;

    thread::scope(|scope| {
        let poller = scope.spawn(|| offload.run_poller(&ThreadSleeper));
        let outcome = session(&offload);
        let down = offload.disable();
        if poller.join().is_err() {
            error!("receive poller panicked");
        }
        outcome.and(down)
    })
}
