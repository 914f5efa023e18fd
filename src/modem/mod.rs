//! The driver facade: a cloneable [`Esp`] handle backed by the command
//! pipeline, and the [`Runner`] that owns the serial link.

mod command;
mod events;
mod parser;
mod pipeline;

use core::str::FromStr;

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use embassy_futures::join::join3;
use embassy_time::Duration;
use embedded_io_async::{Read, Write};

pub use command::{AccessPoint, ConnKind, IpInfo, Mac, Response, WifiMode};
pub use events::{Event, EspEvents};

use crate::config::{Config, CONN_MAX_DATA_LEN};
use crate::conn::{Conn, ConnInner, F_IN_CLOSE};
use crate::error::{EspError, EspResult};
use crate::pbuf::Pbuf;
use command::Command;
use pipeline::{CmdResult, Message, Shared, ST_IP, ST_READY, ST_WIFI};

/// Builds a driver over a serial link split into its two halves.
///
/// The returned [`Runner`] must be spawned (or otherwise polled) for any
/// [`Esp`] call to make progress.
pub fn new<RX, TX>(config: Config, rx: RX, tx: TX) -> (Esp, Runner<RX, TX>)
where
    RX: Read,
    TX: Write,
{
    let shared = Arc::new(Shared::new());
    let esp = Esp {
        shared: shared.clone(),
    };
    let runner = Runner {
        shared,
        rx,
        tx,
        poll_interval: config.poll_interval,
    };
    (esp, runner)
}

/// Owns the serial link and drives the three pipeline loops. Obtained from
/// [`new`]; never returns.
pub struct Runner<RX, TX> {
    shared: Arc<Shared>,
    rx: RX,
    tx: TX,
    poll_interval: Duration,
}

impl<RX: Read, TX: Write> Runner<RX, TX> {
    pub async fn run<H: EspEvents>(self, handler: H) -> ! {
        let Self {
            shared,
            rx,
            tx,
            poll_interval,
        } = self;
        let _ = join3(
            pipeline::read_loop(shared.clone(), rx),
            pipeline::command_loop(shared.clone(), tx),
            pipeline::event_loop(shared, poll_interval, handler),
        )
        .await;
        unreachable!("pipeline loops never finish")
    }
}

/// Handle to the modem. Clones share one pipeline; calls await their
/// command's terminal line under the per-command hard timeout.
#[derive(Clone)]
pub struct Esp {
    shared: Arc<Shared>,
}

impl Esp {
    async fn exec(&self, cmd: Command) -> CmdResult {
        let done = Arc::new(embassy_sync::signal::Signal::new());
        self.shared
            .cmd_q
            .send(Message {
                cmd,
                done: done.clone(),
            })
            .await;
        done.wait().await
    }

    async fn exec_ok(&self, cmd: Command) -> EspResult<()> {
        self.exec(cmd).await.map(|_| ())
    }

    /// Brings the modem to a known state: reset, echo off, station mode
    /// selection, multiplexing on, remote-endpoint reporting on, and a
    /// connection-table sync.
    pub async fn init(&self, mode: WifiMode) -> EspResult<()> {
        self.exec_ok(Command::Reset).await?;
        self.exec_ok(Command::EchoOff).await?;
        self.exec_ok(Command::Version).await?;
        self.exec_ok(Command::WifiMode {
            mode,
            persistent: false,
        })
        .await?;
        self.exec_ok(Command::Mux { enable: true }).await?;
        self.exec_ok(Command::Dinfo { enable: true }).await?;
        self.exec_ok(Command::Status).await?;
        Ok(())
    }

    /// `AT+RST`, resolved by the modem's `ready` banner.
    pub async fn reset(&self) -> EspResult<()> {
        self.exec_ok(Command::Reset).await
    }

    /// `AT+GMR` firmware banner, newline separated.
    pub async fn firmware_version(&self) -> EspResult<String> {
        match self.exec(Command::Version).await? {
            Response::Version(v) => Ok(v),
            _ => Ok(String::new()),
        }
    }

    pub async fn set_wifi_mode(&self, mode: WifiMode, persistent: bool) -> EspResult<()> {
        self.exec_ok(Command::WifiMode { mode, persistent }).await
    }

    /// Joins an access point as station. `mac` pins a specific BSSID.
    pub async fn sta_join(
        &self,
        ssid: &str,
        pass: &str,
        mac: Option<Mac>,
        persistent: bool,
    ) -> EspResult<()> {
        let ssid = heapless::String::from_str(ssid).map_err(|_| EspError::ParamErr)?;
        let pass = heapless::String::from_str(pass).map_err(|_| EspError::ParamErr)?;
        self.exec_ok(Command::Join {
            ssid,
            pass,
            mac,
            persistent,
        })
        .await
    }

    pub async fn sta_quit(&self) -> EspResult<()> {
        self.exec_ok(Command::Quit).await
    }

    /// Scans for access points (`AT+CWLAP`).
    pub async fn sta_list_ap(&self) -> EspResult<Vec<AccessPoint>> {
        match self.exec(Command::ListAps).await? {
            Response::Aps(list) => Ok(list),
            _ => Ok(Vec::new()),
        }
    }

    pub async fn sta_get_ip(&self) -> EspResult<IpInfo> {
        self.get_ip(Command::StaIpGet).await
    }

    pub async fn sta_set_ip(&self, info: IpInfo, persistent: bool) -> EspResult<()> {
        if info.ip.is_none() {
            return Err(EspError::ParamErr);
        }
        self.exec_ok(Command::StaIpSet { info, persistent }).await
    }

    pub async fn ap_get_ip(&self) -> EspResult<IpInfo> {
        self.get_ip(Command::ApIpGet).await
    }

    pub async fn ap_set_ip(&self, info: IpInfo, persistent: bool) -> EspResult<()> {
        if info.ip.is_none() {
            return Err(EspError::ParamErr);
        }
        self.exec_ok(Command::ApIpSet { info, persistent }).await
    }

    async fn get_ip(&self, cmd: Command) -> EspResult<IpInfo> {
        match self.exec(cmd).await? {
            Response::Ip(info) => Ok(info),
            _ => Err(EspError::Err),
        }
    }

    pub async fn sta_get_mac(&self) -> EspResult<Mac> {
        self.get_mac(Command::StaMacGet).await
    }

    pub async fn sta_set_mac(&self, mac: Mac, persistent: bool) -> EspResult<()> {
        self.exec_ok(Command::StaMacSet { mac, persistent }).await
    }

    pub async fn ap_get_mac(&self) -> EspResult<Mac> {
        self.get_mac(Command::ApMacGet).await
    }

    pub async fn ap_set_mac(&self, mac: Mac, persistent: bool) -> EspResult<()> {
        self.exec_ok(Command::ApMacSet { mac, persistent }).await
    }

    async fn get_mac(&self, cmd: Command) -> EspResult<Mac> {
        match self.exec(cmd).await? {
            Response::Mac(mac) => Ok(mac),
            _ => Err(EspError::Err),
        }
    }

    pub async fn set_mux(&self, enable: bool) -> EspResult<()> {
        self.exec_ok(Command::Mux { enable }).await
    }

    pub async fn set_dinfo(&self, enable: bool) -> EspResult<()> {
        self.exec_ok(Command::Dinfo { enable }).await
    }

    /// Starts or stops the modem-side TCP server. `max_conn` and
    /// `timeout_s` tune the modem's accept limit and inactivity close.
    pub async fn set_server(
        &self,
        port: u16,
        max_conn: Option<u8>,
        timeout_s: Option<u16>,
        enable: bool,
    ) -> EspResult<()> {
        if !enable {
            return self.exec_ok(Command::Server {
                enable: false,
                port,
            })
            .await;
        }
        if let Some(max_conn) = max_conn {
            self.exec_ok(Command::ServerMaxConn { max_conn }).await?;
        }
        self.exec_ok(Command::Server { enable: true, port }).await?;
        if let Some(timeout_s) = timeout_s {
            self.exec_ok(Command::ServerTimeout { timeout_s }).await?;
        }
        Ok(())
    }

    /// `AT+CIPSSLSIZE`: size of the modem's single SSL buffer.
    pub async fn set_ssl_buffer_size(&self, size: u32) -> EspResult<()> {
        self.exec_ok(Command::SslSize { size }).await
    }

    /// Reconfigures the modem's UART. The serial driver on this side must
    /// be switched by the caller afterwards.
    pub async fn set_baudrate(&self, baudrate: u32, persistent: bool) -> EspResult<()> {
        self.exec_ok(Command::Uart {
            baudrate,
            persistent,
        })
        .await
    }

    /// Opens an outbound connection. The slot is claimed before CIPSTART
    /// goes out so the id on the wire equals the table index.
    pub async fn conn_start(&self, kind: ConnKind, host: &str, port: u16) -> EspResult<Conn> {
        let id = self.shared.conns.claim().ok_or(EspError::NoMem)?;

        let host = match heapless::String::from_str(host) {
            Ok(h) => h,
            Err(_) => {
                self.shared.conns.release_claim(id);
                return Err(EspError::ParamErr);
            }
        };

        if let Some(slot) = self.shared.conns.slot(id) {
            let mut inner = slot.inner.lock().await;
            *inner = ConnInner::default();
            inner.kind = Some(kind);
        }

        match self
            .exec(Command::Start {
                id,
                kind,
                host,
                port,
            })
            .await
        {
            Ok(_) => Ok(Conn {
                esp: self.clone(),
                id,
            }),
            Err(err) => {
                self.shared.conns.release_claim(id);
                Err(err)
            }
        }
    }

    pub async fn conn_close(&self, id: u8) -> EspResult<()> {
        if !self.conn_is_active(id) {
            return Err(EspError::Closed);
        }
        self.shared.conns.set_flag(id, F_IN_CLOSE);
        self.exec_ok(Command::Close { id }).await
    }

    /// Sends `data` as one or more CIPSEND exchanges, in order.
    pub async fn conn_send(&self, id: u8, data: &[u8]) -> EspResult<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let mut total = 0;
        for chunk in data.chunks(CONN_MAX_DATA_LEN) {
            if !self.conn_is_active(id) {
                return if total > 0 { Ok(total) } else { Err(EspError::Closed) };
            }
            if let Some(slot) = self.shared.conns.slot(id) {
                slot.inner.lock().await.bytes_to_send += chunk.len();
            }
            self.exec_ok(Command::Send {
                id,
                data: chunk.to_vec(),
            })
            .await?;
            total += chunk.len();
        }
        Ok(total)
    }

    /// Buffered variant of [`conn_send`](Self::conn_send): appends to the
    /// slot's staging buffer and flushes whenever it fills.
    pub async fn conn_write(&self, id: u8, data: &[u8]) -> EspResult<usize> {
        let mut written = 0;
        while written < data.len() {
            if !self.conn_is_active(id) {
                return Err(EspError::Closed);
            }
            let full = {
                let Some(slot) = self.shared.conns.slot(id) else {
                    return Err(EspError::ParamErr);
                };
                let mut inner = slot.inner.lock().await;
                let space = CONN_MAX_DATA_LEN - inner.staging.len();
                let n = space.min(data.len() - written);
                inner.staging.extend_from_slice(&data[written..written + n]);
                written += n;
                inner.staging.len() == CONN_MAX_DATA_LEN
            };
            if full {
                self.conn_flush(id).await?;
            }
        }
        Ok(written)
    }

    /// Pushes staged bytes out as one CIPSEND.
    pub async fn conn_flush(&self, id: u8) -> EspResult<()> {
        let data = {
            let Some(slot) = self.shared.conns.slot(id) else {
                return Err(EspError::ParamErr);
            };
            let mut inner = slot.inner.lock().await;
            let data = core::mem::take(&mut inner.staging);
            inner.bytes_to_send += data.len();
            data
        };
        if data.is_empty() {
            return Ok(());
        }
        self.exec_ok(Command::Send { id, data }).await
    }

    /// Takes everything connection `id` has received so far.
    pub async fn conn_recv(&self, id: u8) -> Pbuf {
        self.shared.conns.take_rx(id).await
    }

    /// Lock-free check for undrained inbound data on the slot.
    pub fn conn_has_data(&self, id: u8) -> bool {
        self.shared.conns.has_data(id)
    }

    pub fn conn_is_active(&self, id: u8) -> bool {
        self.shared.conns.is_active(id)
    }

    /// Transport and remote endpoint of the slot, as far as they are
    /// known (the remote side of inbound connections arrives with the
    /// first +IPD once CIPDINFO is on).
    pub async fn conn_info(
        &self,
        id: u8,
    ) -> (Option<ConnKind>, Option<(core::net::Ipv4Addr, u16)>) {
        match self.shared.conns.slot(id) {
            Some(slot) => {
                let inner = slot.inner.lock().await;
                (inner.kind, inner.remote)
            }
            None => (None, None),
        }
    }

    /// `(bytes_sent, bytes_to_send)` counters for the slot.
    pub async fn conn_counters(&self, id: u8) -> (usize, usize) {
        match self.shared.conns.slot(id) {
            Some(slot) => {
                let inner = slot.inner.lock().await;
                (inner.bytes_sent, inner.bytes_to_send)
            }
            None => (0, 0),
        }
    }

    /// Free space in the slot's staging buffer; the most a response pump
    /// should write before yielding.
    pub async fn conn_mem_available(&self, id: u8) -> usize {
        if !self.conn_is_active(id) {
            return 0;
        }
        match self.shared.conns.slot(id) {
            Some(slot) => CONN_MAX_DATA_LEN - slot.inner.lock().await.staging.len(),
            None => 0,
        }
    }

    pub fn is_device_ready(&self) -> bool {
        self.shared.status_has(ST_READY)
    }

    pub fn is_wifi_connected(&self) -> bool {
        self.shared.status_has(ST_WIFI)
    }

    pub fn has_ip(&self) -> bool {
        self.shared.status_has(ST_IP)
    }
}
