//! Socket-layer entry points.
//!
//! One function per socket operation. Each packs its arguments into an
//! [`OffloadRequest`] and goes through [`Offload::handle`], so the stack side
//! only ever talks to the dispatcher.

use axsock::{Ipv4Address, NetStack, OffloadError, OffloadResult, SocketHandle, WifiTransport};

use crate::handler::{Offload, OffloadReply, OffloadRequest, Rejected};

fn expect_done<P>(reply: Result<OffloadReply, Rejected<P>>) -> OffloadResult<()> {
    match reply {
        Ok(OffloadReply::Done | OffloadReply::Slot(_)) => Ok(()),
        Ok(_) => Err(OffloadError::NotSuccessful),
        Err(rejected) => Err(rejected.error),
    }
}

pub fn tcp_client_socket_connect<T: WifiTransport, S: NetStack, const N: usize>(
    offload: &Offload<T, S, N>,
    socket: SocketHandle,
    remote_ip: Ipv4Address,
    remote_port: u16,
    local_port: u16,
) -> OffloadResult<()> {
    expect_done(offload.handle(OffloadRequest::TcpClientConnect {
        socket,
        remote_ip,
        remote_port,
        local_port,
    }))
}

pub fn tcp_server_socket_listen<T: WifiTransport, S: NetStack, const N: usize>(
    offload: &Offload<T, S, N>,
    socket: SocketHandle,
    local_port: u16,
) -> OffloadResult<()> {
    expect_done(offload.handle(OffloadRequest::TcpServerListen { socket, local_port }))
}

/// Returns the peer address once a client is attached to the listener.
pub fn tcp_server_socket_accept<T: WifiTransport, S: NetStack, const N: usize>(
    offload: &Offload<T, S, N>,
    socket: SocketHandle,
    wait_ticks: u32,
) -> OffloadResult<(Ipv4Address, u16)> {
    match offload.handle(OffloadRequest::TcpServerAccept { socket, wait_ticks }) {
        Ok(OffloadReply::Peer(ip, port)) => Ok((ip, port)),
        Ok(_) => Err(OffloadError::NotSuccessful),
        Err(rejected) => Err(rejected.error),
    }
}

pub fn tcp_server_socket_unlisten<T: WifiTransport, S: NetStack, const N: usize>(
    offload: &Offload<T, S, N>,
    local_port: u16,
) -> OffloadResult<()> {
    expect_done(offload.handle(OffloadRequest::TcpServerUnlisten { local_port }))
}

pub fn tcp_socket_disconnect<T: WifiTransport, S: NetStack, const N: usize>(
    offload: &Offload<T, S, N>,
    socket: SocketHandle,
) -> OffloadResult<()> {
    expect_done(offload.handle(OffloadRequest::TcpDisconnect { socket }))
}

/// Queue `packet` on a connected TCP socket. On error the packet comes back
/// inside the rejection.
pub fn tcp_socket_send<T: WifiTransport, S: NetStack, const N: usize>(
    offload: &Offload<T, S, N>,
    socket: SocketHandle,
    packet: S::Packet,
    wait_ticks: u32,
) -> Result<usize, Rejected<S::Packet>> {
    match offload.handle(OffloadRequest::TcpSend {
        socket,
        packet,
        wait_ticks,
    })? {
        OffloadReply::Sent(sent) => Ok(sent),
        _ => Err(OffloadError::NotSuccessful.into()),
    }
}

pub fn udp_socket_bind<T: WifiTransport, S: NetStack, const N: usize>(
    offload: &Offload<T, S, N>,
    socket: SocketHandle,
    local_port: u16,
) -> OffloadResult<()> {
    expect_done(offload.handle(OffloadRequest::UdpBind { socket, local_port }))
}

pub fn udp_socket_unbind<T: WifiTransport, S: NetStack, const N: usize>(
    offload: &Offload<T, S, N>,
    socket: SocketHandle,
) -> OffloadResult<()> {
    expect_done(offload.handle(OffloadRequest::UdpUnbind { socket }))
}

pub fn udp_socket_send<T: WifiTransport, S: NetStack, const N: usize>(
    offload: &Offload<T, S, N>,
    socket: SocketHandle,
    packet: S::Packet,
    local_ip: Ipv4Address,
    remote_ip: Ipv4Address,
    remote_port: u16,
    wait_ticks: u32,
) -> Result<usize, Rejected<S::Packet>> {
    match offload.handle(OffloadRequest::UdpSend {
        socket,
        packet,
        local_ip,
        remote_ip,
        remote_port,
        wait_ticks,
    })? {
        OffloadReply::Sent(sent) => Ok(sent),
        _ => Err(OffloadError::NotSuccessful.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{chip_call, offload, offload_disabled, sock, ChipCall, TestPacket};
    use axsock::{NetPacket, NO_WAIT};
    use std::vec;
    use std::vec::Vec;

    fn peer() -> Ipv4Address {
        Ipv4Address::new(192, 168, 1, 20)
    }

    fn local() -> Ipv4Address {
        Ipv4Address::new(192, 168, 1, 5)
    }

    #[test]
    fn four_slots_then_no_more_entries() {
        let off = offload();
        for id in 0..4 {
            tcp_client_socket_connect(&off, sock(id), peer(), 80, 0).unwrap();
        }
        let before: Vec<_> = (0..4).map(|index| off.slot(index)).collect();
        assert_eq!(
            tcp_client_socket_connect(&off, sock(4), peer(), 80, 0),
            Err(OffloadError::NoMoreEntries)
        );
        let after: Vec<_> = (0..4).map(|index| off.slot(index)).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn udp_port_is_not_exclusive() {
        let off = offload();
        udp_socket_bind(&off, sock(1), 5000).unwrap();
        udp_socket_bind(&off, sock(2), 5000).unwrap();
        assert_eq!(off.active_slots(), 2);
        assert_eq!(off.slot(0).unwrap().local_port, 5000);
        assert_eq!(off.slot(1).unwrap().local_port, 5000);
    }

    #[test]
    fn server_slot_is_reused_across_clients() {
        let off = offload();
        tcp_server_socket_listen(&off, sock(1), 80).unwrap();
        off.transport().queue_client([10, 0, 0, 7], 40000);
        tcp_server_socket_accept(&off, sock(1), NO_WAIT).unwrap();
        assert!(off.slot(0).unwrap().connected);

        tcp_socket_disconnect(&off, sock(1)).unwrap();
        let slot = off.slot(0).unwrap();
        assert_eq!(slot.socket, Some(sock(1)));
        assert_eq!(slot.local_port, 80);
        assert!(!slot.connected);

        off.transport().queue_client([10, 0, 0, 8], 40001);
        assert_eq!(
            tcp_server_socket_accept(&off, sock(1), NO_WAIT),
            Ok((Ipv4Address::new(10, 0, 0, 8), 40001))
        );
        assert_eq!(off.active_slots(), 1);
        assert_eq!(chip_call(&off, |call| matches!(call, ChipCall::StartServer { .. })), 1);

        tcp_server_socket_unlisten(&off, 80).unwrap();
        assert_eq!(off.active_slots(), 0);
    }

    #[test]
    fn tcp_chain_goes_out_in_frames() {
        let off = offload();
        tcp_client_socket_connect(&off, sock(1), peer(), 80, 0).unwrap();
        let packet = TestPacket::filled(&[3000]);
        let expected = packet.bytes();
        assert_eq!(tcp_socket_send(&off, sock(1), packet, NO_WAIT).ok(), Some(3000));
        let sends: Vec<usize> = off
            .transport()
            .calls()
            .iter()
            .filter_map(|call| match call {
                ChipCall::Send { len, .. } => Some(*len),
                _ => None,
            })
            .collect();
        assert_eq!(sends, vec![1200, 1200, 600]);
        assert_eq!(off.transport().sent_bytes(0), expected);
    }

    #[test]
    fn udp_second_peer_reuses_first_connection() {
        let off = offload();
        udp_socket_bind(&off, sock(3), 5000).unwrap();
        let x = Ipv4Address::new(10, 0, 0, 10);
        let y = Ipv4Address::new(10, 0, 0, 11);
        udp_socket_send(&off, sock(3), TestPacket::from_parts(&[b"to x"]), local(), x, 7000, NO_WAIT)
            .unwrap();
        udp_socket_send(&off, sock(3), TestPacket::from_parts(&[b"to y"]), local(), y, 7001, NO_WAIT)
            .unwrap();
        assert_eq!(chip_call(&off, |call| matches!(call, ChipCall::Open { .. })), 1);
        let slot = off.slot(0).unwrap();
        assert_eq!((slot.remote_ip, slot.remote_port), (x, 7000));
        assert_eq!(off.transport().sent_bytes(0), b"to xto y".to_vec());

        udp_socket_unbind(&off, sock(3)).unwrap();
        assert_eq!(chip_call(&off, |call| matches!(call, ChipCall::CloseClient { slot: 0 })), 1);
    }

    #[test]
    fn rejected_send_hands_packet_back() {
        let off = offload();
        udp_socket_bind(&off, sock(1), 5000).unwrap();
        let rejected = udp_socket_send(
            &off,
            sock(1),
            TestPacket::filled(&[600, 600]),
            local(),
            peer(),
            7000,
            NO_WAIT,
        )
        .unwrap_err();
        assert_eq!(rejected.error, OffloadError::NotSuccessful);
        assert_eq!(rejected.packet.map(|packet| packet.len()), Some(1200));

        let rejected = tcp_socket_send(&off, sock(1), TestPacket::filled(&[8]), NO_WAIT).unwrap_err();
        assert_eq!(rejected.error, OffloadError::NotSupported);
        assert!(rejected.packet.is_some());
    }

    #[test]
    fn link_down_refuses_every_request() {
        let off = offload_disabled();
        assert_eq!(tcp_client_socket_connect(&off, sock(1), peer(), 80, 0), Err(OffloadError::NotEnabled));
        assert_eq!(tcp_server_socket_listen(&off, sock(1), 80), Err(OffloadError::NotEnabled));
        assert_eq!(tcp_server_socket_accept(&off, sock(1), NO_WAIT), Err(OffloadError::NotEnabled));
        assert_eq!(tcp_server_socket_unlisten(&off, 80), Err(OffloadError::NotEnabled));
        assert_eq!(tcp_socket_disconnect(&off, sock(1)), Err(OffloadError::NotEnabled));
        assert_eq!(udp_socket_bind(&off, sock(1), 5000), Err(OffloadError::NotEnabled));
        assert_eq!(udp_socket_unbind(&off, sock(1)), Err(OffloadError::NotEnabled));
        assert!(off.transport().calls().is_empty());
    }
}
