use axsock::WAIT_FOREVER;

// Wait options arrive in scheduler ticks; the module driver wants milliseconds.

pub const fn ticks_to_ms(ticks: u32, tick_hz: u32) -> u32 {
    if ticks == WAIT_FOREVER {
        return u32::MAX;
    }
    if tick_hz == 0 {
        return 0;
    }
    let ms = ticks as u64 * 1000 / tick_hz as u64;
    if ms > u32::MAX as u64 {
        u32::MAX
    } else {
        ms as u32
    }
}

/// Convert a send wait option, capped at `max_ms`.
pub const fn send_timeout_ms(ticks: u32, tick_hz: u32, max_ms: u32) -> u32 {
    let ms = ticks_to_ms(ticks, tick_hz);
    if ms > max_ms {
        max_ms
    } else {
        ms
    }
}
