//! Fixed table of module connection slots.
//!
//! The slot index doubles as the module's connection id. The table has no
//! lock of its own: it lives inside the interface's protection mutex and
//! every find + allocate sequence runs under that guard.

use core::ops::{Index, IndexMut};

use axsock::{Ipv4Address, OffloadError, OffloadResult, Protocol, SocketHandle};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnectionSlot {
    /// Owning socket; `None` marks a free slot.
    pub socket: Option<SocketHandle>,
    pub protocol: Protocol,
    pub local_ip: Ipv4Address,
    pub remote_ip: Ipv4Address,
    pub local_port: u16,
    pub remote_port: u16,
    pub connected: bool,
    pub is_client: bool,
}

impl ConnectionSlot {
    pub const EMPTY: Self = Self {
        socket: None,
        protocol: Protocol::Tcp,
        local_ip: Ipv4Address::UNSPECIFIED,
        remote_ip: Ipv4Address::UNSPECIFIED,
        local_port: 0,
        remote_port: 0,
        connected: false,
        is_client: false,
    };

    pub fn is_free(&self) -> bool {
        self.socket.is_none()
    }

    /// A TCP slot serving a listen request rather than an outbound connect.
    pub fn is_server(&self) -> bool {
        self.protocol == Protocol::Tcp && !self.is_client
    }
}

pub struct SlotTable<const N: usize> {
    slots: [ConnectionSlot; N],
    active: usize,
}

impl<const N: usize> SlotTable<N> {
    pub const fn new() -> Self {
        Self {
            slots: [ConnectionSlot::EMPTY; N],
            active: 0,
        }
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    /// Number of allocated slots.
    pub fn active(&self) -> usize {
        self.active
    }

    pub fn slot(&self, index: usize) -> Option<&ConnectionSlot> {
        self.slots.get(index)
    }

    pub fn slot_mut(&mut self, index: usize) -> Option<&mut ConnectionSlot> {
        self.slots.get_mut(index)
    }

    /// Slot currently owned by `socket`.
    pub fn find(&self, socket: SocketHandle) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| slot.socket == Some(socket))
    }

    /// Slot owned by `socket`, or with `allow_new` the lowest free slot bound
    /// to it. Exhaustion leaves the table untouched.
    pub fn find_or_allocate(&mut self, socket: SocketHandle, allow_new: bool) -> OffloadResult<usize> {
        if let Some(index) = self.find(socket) {
            return Ok(index);
        }
        if !allow_new {
            return Err(OffloadError::NotSuccessful);
        }
        let index = self
            .slots
            .iter()
            .position(ConnectionSlot::is_free)
            .ok_or(OffloadError::NoMoreEntries)?;
        self.slots[index] = ConnectionSlot {
            socket: Some(socket),
            ..ConnectionSlot::EMPTY
        };
        self.active += 1;
        Ok(index)
    }

    /// Listening slot bound to `(local_port, protocol)`.
    pub fn find_by_port(&self, local_port: u16, protocol: Protocol) -> Option<usize> {
        self.slots.iter().position(|slot| {
            !slot.is_free()
                && !slot.is_client
                && slot.protocol == protocol
                && slot.local_port == local_port
        })
    }

    /// Zero the slot and return it to the free pool. Freeing a free slot is a
    /// no-op.
    pub fn release(&mut self, index: usize) {
        let Some(slot) = self.slots.get_mut(index) else {
            return;
        };
        if slot.is_free() {
            return;
        }
        *slot = ConnectionSlot::EMPTY;
        self.active -= 1;
    }

    /// Indices of allocated slots, ascending.
    pub fn allocated(&self) -> impl Iterator<Item = usize> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| !slot.is_free())
            .map(|(index, _)| index)
    }
}

impl<const N: usize> Default for SlotTable<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> Index<usize> for SlotTable<N> {
    type Output = ConnectionSlot;

    fn index(&self, index: usize) -> &ConnectionSlot {
        &self.slots[index]
    }
}

impl<const N: usize> IndexMut<usize> for SlotTable<N> {
    fn index_mut(&mut self, index: usize) -> &mut ConnectionSlot {
        &mut self.slots[index]
    }
}
