//! Connection slots and the user-facing connection handle.

use core::net::Ipv4Addr;
use core::sync::atomic::{AtomicU8, Ordering};

use alloc::vec::Vec;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::mutex::Mutex;

use crate::config::ESP_MAX_CONNS;
use crate::error::EspResult;
use crate::modem::{ConnKind, Esp};
use crate::pbuf::Pbuf;

/// Slot reserved for an outbound CIPSTART that has not connected yet.
pub(crate) const F_CLAIMED: u8 = 1 << 0;
pub(crate) const F_ACTIVE: u8 = 1 << 1;
pub(crate) const F_CLIENT: u8 = 1 << 2;
pub(crate) const F_DATA_RECEIVED: u8 = 1 << 3;
pub(crate) const F_IN_CLOSE: u8 = 1 << 4;

/// Mutable per-connection state behind the slot mutex. The flag word is
/// read lock-free; everything else is lock-guarded.
#[derive(Default)]
pub(crate) struct ConnInner {
    pub kind: Option<ConnKind>,
    pub remote: Option<(Ipv4Addr, u16)>,
    /// Inbound chain, +IPD frames in arrival order.
    pub rx: Pbuf,
    /// Write-side staging buffer, flushed as one CIPSEND.
    pub staging: Vec<u8>,
    pub bytes_sent: usize,
    pub bytes_to_send: usize,
}

pub(crate) struct ConnSlot {
    pub flags: AtomicU8,
    pub inner: Mutex<CriticalSectionRawMutex, ConnInner>,
}

pub(crate) struct ConnTable {
    slots: [ConnSlot; ESP_MAX_CONNS],
}

impl ConnTable {
    pub fn new() -> Self {
        Self {
            slots: core::array::from_fn(|_| ConnSlot {
                flags: AtomicU8::new(0),
                inner: Mutex::new(ConnInner::default()),
            }),
        }
    }

    pub fn slot(&self, id: u8) -> Option<&ConnSlot> {
        self.slots.get(id as usize)
    }

    pub fn flags(&self, id: u8) -> u8 {
        self.slot(id).map_or(0, |s| s.flags.load(Ordering::Acquire))
    }

    pub fn is_active(&self, id: u8) -> bool {
        self.flags(id) & F_ACTIVE != 0
    }

    pub fn set_flag(&self, id: u8, flag: u8) {
        if let Some(slot) = self.slot(id) {
            slot.flags.fetch_or(flag, Ordering::AcqRel);
        }
    }

    pub fn clear_flag(&self, id: u8, flag: u8) {
        if let Some(slot) = self.slot(id) {
            slot.flags.fetch_and(!flag, Ordering::AcqRel);
        }
    }

    /// Reserves a free slot for an outbound connection.
    pub fn claim(&self) -> Option<u8> {
        for (i, slot) in self.slots.iter().enumerate() {
            if slot
                .flags
                .compare_exchange(0, F_CLAIMED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(i as u8);
            }
        }
        None
    }

    pub fn release_claim(&self, id: u8) {
        if let Some(slot) = self.slot(id) {
            let _ = slot.flags.compare_exchange(
                F_CLAIMED,
                0,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        }
    }

    /// `<id>,CONNECT` arrived. Returns whether this is a client connection
    /// (a claim was pending on the slot).
    pub async fn on_connect(&self, id: u8) -> bool {
        let Some(slot) = self.slot(id) else {
            return false;
        };
        let claimed = slot.flags.load(Ordering::Acquire) & F_CLAIMED != 0;
        if !claimed {
            // Inbound server connection: the slot may hold leftovers from
            // its previous life.
            *slot.inner.lock().await = ConnInner::default();
        }
        let flags = F_ACTIVE | if claimed { F_CLIENT } else { 0 };
        slot.flags.store(flags, Ordering::Release);
        claimed
    }

    /// `<id>,CLOSED` arrived. Returns `Some(forced)` if the slot was in
    /// use, `None` for a spurious close.
    pub fn on_closed(&self, id: u8) -> Option<bool> {
        let slot = self.slot(id)?;
        let flags = slot.flags.swap(0, Ordering::AcqRel);
        if flags & (F_ACTIVE | F_CLAIMED) == 0 {
            return None;
        }
        Some(flags & F_IN_CLOSE == 0)
    }

    pub fn active_ids(&self) -> heapless::Vec<u8, ESP_MAX_CONNS> {
        let mut out = heapless::Vec::new();
        for (i, slot) in self.slots.iter().enumerate() {
            if slot.flags.load(Ordering::Acquire) & F_ACTIVE != 0 {
                let _ = out.push(i as u8);
            }
        }
        out
    }

    /// Appends one received frame to the slot's inbound chain.
    pub async fn push_rx(&self, id: u8, data: Pbuf) {
        if let Some(slot) = self.slot(id) {
            slot.inner.lock().await.rx.concat(data);
            slot.flags.fetch_or(F_DATA_RECEIVED, Ordering::AcqRel);
        }
    }

    /// Lock-free: whether the slot holds undrained inbound data.
    pub fn has_data(&self, id: u8) -> bool {
        self.flags(id) & F_DATA_RECEIVED != 0
    }

    /// Takes everything received so far. The flag word keeps the common
    /// nothing-pending case off the slot mutex.
    pub async fn take_rx(&self, id: u8) -> Pbuf {
        let Some(slot) = self.slot(id) else {
            return Pbuf::default();
        };
        if slot.flags.load(Ordering::Acquire) & F_DATA_RECEIVED == 0 {
            return Pbuf::default();
        }
        slot.flags.fetch_and(!F_DATA_RECEIVED, Ordering::AcqRel);
        core::mem::take(&mut slot.inner.lock().await.rx)
    }
}

/// Handle to one logical connection. Cheap to clone; all I/O goes through
/// the driver's command pipeline.
#[derive(Clone)]
pub struct Conn {
    pub(crate) esp: Esp,
    pub(crate) id: u8,
}

impl Conn {
    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn is_active(&self) -> bool {
        self.esp.conn_is_active(self.id)
    }

    /// Sends `data` now, splitting it into CIPSEND-sized exchanges.
    pub async fn send(&self, data: &[u8]) -> EspResult<usize> {
        self.esp.conn_send(self.id, data).await
    }

    /// Appends to the staging buffer, flushing full buffers along the way.
    pub async fn write(&self, data: &[u8]) -> EspResult<usize> {
        self.esp.conn_write(self.id, data).await
    }

    /// Pushes out whatever sits in the staging buffer.
    pub async fn flush(&self) -> EspResult<()> {
        self.esp.conn_flush(self.id).await
    }

    /// Takes the bytes received so far as one chain.
    pub async fn recv(&self) -> Pbuf {
        self.esp.conn_recv(self.id).await
    }

    /// Whether [`recv`](Self::recv) currently has anything to hand out.
    pub fn has_data(&self) -> bool {
        self.esp.conn_has_data(self.id)
    }

    /// Free space in the staging buffer.
    pub async fn mem_available(&self) -> usize {
        self.esp.conn_mem_available(self.id).await
    }

    /// `(bytes_sent, bytes_to_send)`: bytes acknowledged by the modem and
    /// bytes still queued towards it.
    pub async fn counters(&self) -> (usize, usize) {
        self.esp.conn_counters(self.id).await
    }

    /// Transport and remote endpoint, when known.
    pub async fn info(&self) -> (Option<ConnKind>, Option<(Ipv4Addr, u16)>) {
        self.esp.conn_info(self.id).await
    }

    pub async fn close(&self) -> EspResult<()> {
        self.esp.conn_close(self.id).await
    }
}

impl core::fmt::Debug for Conn {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Conn {{ id: {} }}", self.id)
    }
}
