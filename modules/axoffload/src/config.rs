//! Offload shim configuration constants.

/// Simultaneous connections supported by the WiFi module.
pub const DEFAULT_SLOTS: usize = 4;
/// Largest payload the module moves in one command.
pub const HW_PAYLOAD_SIZE: usize = 1200;
/// Upper bound for a single send command, in milliseconds.
pub const SEND_TIMEOUT_MAX_MS: u32 = 3000;
/// Pending connections queued by the module for a listening slot.
pub const SERVER_BACKLOG: u16 = 1;
/// Scheduler ticks per second.
pub const TICK_HZ: u32 = 100;
/// Ticks between two receive passes.
pub const POLL_INTERVAL_TICKS: u32 = TICK_HZ;
/// Pool packets left untouched by the receive poller.
pub const RESERVED_PACKETS: usize = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OffloadConfig {
    pub payload_size: usize,
    pub send_timeout_max_ms: u32,
    pub backlog: u16,
    pub tick_hz: u32,
    pub poll_interval_ticks: u32,
    pub reserved_packets: usize,
    /// A listening slot without a client ends the receive pass early.
    pub accept_blocks_pass: bool,
}

impl OffloadConfig {
    pub const fn new() -> Self {
        Self {
            payload_size: HW_PAYLOAD_SIZE,
            send_timeout_max_ms: SEND_TIMEOUT_MAX_MS,
            backlog: SERVER_BACKLOG,
            tick_hz: TICK_HZ,
            poll_interval_ticks: POLL_INTERVAL_TICKS,
            reserved_packets: RESERVED_PACKETS,
            accept_blocks_pass: true,
        }
    }

    pub const fn with_payload_size(mut self, payload_size: usize) -> Self {
        self.payload_size = payload_size;
        self
    }

    pub const fn with_tick_hz(mut self, tick_hz: u32) -> Self {
        self.tick_hz = tick_hz;
        self
    }

    pub const fn with_poll_interval_ticks(mut self, ticks: u32) -> Self {
        self.poll_interval_ticks = ticks;
        self
    }

    pub const fn with_reserved_packets(mut self, reserved: usize) -> Self {
        self.reserved_packets = reserved;
        self
    }

    pub const fn with_accept_blocks_pass(mut self, blocks: bool) -> Self {
        self.accept_blocks_pass = blocks;
        self
    }
}

impl Default for OffloadConfig {
    fn default() -> Self {
        Self::new()
    }
}
