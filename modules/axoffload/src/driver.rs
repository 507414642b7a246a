//! Link-level driver requests: initialize, enable, disable, status.
//!
//! Enabling the link attaches the offload handler; the socket layer sees
//! `NotEnabled` until then. Disabling closes every module connection.

use core::sync::atomic::Ordering;

use axsock::{NetStack, OffloadError, OffloadResult, Protocol, WifiTransport};
use log::{info, warn};

use crate::handler::Offload;

pub(crate) const STATE_UNINITIALIZED: u8 = 0;
const STATE_INITIALIZED: u8 = 1;
const STATE_LINK_ENABLED: u8 = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkState {
    Uninitialized,
    Initialized,
    LinkEnabled,
}

/// Interface capability bits reported to the stack.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Capabilities(u32);

impl Capabilities {
    pub const TCPIP_OFFLOAD: Self = Self(1 << 0);

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl<T: WifiTransport, S: NetStack, const N: usize> Offload<T, S, N> {
    /// Prepare the interface. Returns the priority the poller thread must run
    /// at: one level below the IP thread (numerically higher).
    pub fn initialize(&self, ip_thread_priority: u32) -> OffloadResult<u32> {
        let priority = ip_thread_priority.saturating_add(1);
        if self
            .state
            .compare_exchange(
                STATE_UNINITIALIZED,
                STATE_INITIALIZED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            self.poller_priority.store(priority, Ordering::Release);
            info!("offload interface {} initialized, {} slots", self.interface.0, N);
        }
        Ok(self.poller_priority())
    }

    pub fn enable(&self) -> OffloadResult<()> {
        match self.state.compare_exchange(
            STATE_INITIALIZED,
            STATE_LINK_ENABLED,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                info!("offload interface {} link up", self.interface.0);
                Ok(())
            }
            Err(STATE_LINK_ENABLED) => Err(OffloadError::AlreadyEnabled),
            Err(_) => Err(OffloadError::NotSuccessful),
        }
    }

    /// Take the link down, closing and freeing every slot. The poller loop
    /// returns after its current pass.
    pub fn disable(&self) -> OffloadResult<()> {
        let mut table = self.table.lock();
        if self
            .state
            .compare_exchange(
                STATE_LINK_ENABLED,
                STATE_INITIALIZED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Err(OffloadError::NotSuccessful);
        }
        for index in 0..N {
            let slot = table[index];
            if slot.is_free() {
                continue;
            }
            let closed = match slot.protocol {
                Protocol::Tcp if !slot.is_client => {
                    if slot.connected {
                        if let Err(err) = self.transport.close_server_connection(index) {
                            warn!("slot {} client close on link down failed: {}", index, err);
                        }
                    }
                    self.transport.stop_server(index)
                }
                Protocol::Tcp if slot.connected => self.transport.close_client_connection(index),
                Protocol::Udp if slot.remote_port != 0 => self.transport.close_client_connection(index),
                _ => Ok(()),
            };
            if let Err(err) = closed {
                warn!("slot {} close on link down failed: {}", index, err);
            }
            table.release(index);
        }
        info!("offload interface {} link down", self.interface.0);
        Ok(())
    }

    pub fn link_state(&self) -> LinkState {
        match self.state.load(Ordering::Acquire) {
            STATE_UNINITIALIZED => LinkState::Uninitialized,
            STATE_INITIALIZED => LinkState::Initialized,
            _ => LinkState::LinkEnabled,
        }
    }

    pub fn link_up(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_LINK_ENABLED
    }

    pub fn poller_priority(&self) -> u32 {
        self.poller_priority.load(Ordering::Acquire)
    }

    pub fn capabilities(&self) -> Capabilities {
        Capabilities::TCPIP_OFFLOAD
    }
}
