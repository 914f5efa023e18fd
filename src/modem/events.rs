//! Driver events and the user dispatch trait.

use crate::pbuf::Pbuf;
use alloc::boxed::Box;

/// Everything the driver reports outside the command/response path, in
/// parse order. Per-connection events are serialised: all events for one
/// slot are dispatched by the single event loop in the order the modem
/// produced them.
#[derive(Debug, Clone)]
pub enum Event {
    /// The modem finished booting (`ready`).
    DeviceReady,
    WifiConnected,
    WifiGotIp,
    WifiDisconnected,
    /// A connection became active. `client` is true for connections this
    /// driver opened, false for inbound server connections.
    ConnActive { id: u8, client: bool },
    /// Payload of one `+IPD` frame, also appended to the slot's inbound
    /// chain.
    ConnDataRecv { id: u8, data: Pbuf },
    /// A send finished. `available` is the free space in the slot's
    /// staging buffer at this moment.
    ConnDataSent { id: u8, sent: usize, available: usize },
    ConnDataSendErr { id: u8 },
    /// The connection is gone. `forced` is true when the remote side or
    /// the modem closed it rather than this driver.
    ConnClosed { id: u8, forced: bool },
    /// Periodic tick for every active connection.
    ConnPoll { id: u8 },
}

/// User event sink, driven by [`Runner::run`](crate::Runner::run).
///
/// Dispatch happens outside the command pipeline: a slow handler delays
/// further events but never blocks command traffic or the parser.
#[async_trait::async_trait]
pub trait EspEvents: Send {
    async fn on_event(&mut self, event: Event);
}
