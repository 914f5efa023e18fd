//! The producer/consumer pipeline around the single in-flight command.
//!
//! Three loops run inside [`Runner::run`](crate::Runner::run): the command
//! loop drains the producer queue and owns the serial write half, the read
//! loop feeds the decoder and resolves the in-flight exchange, and the
//! event loop hands parsed events to the user. Commands are strictly
//! serial; at most one is in flight with the modem at any time.

use core::sync::atomic::{AtomicU8, Ordering};

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use embassy_futures::select::{select, Either};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_sync::mutex::Mutex;
use embassy_sync::signal::Signal;
use embassy_time::{Duration, Ticker, WithTimeout};
use embedded_io_async::{Read, Write};
use log::{debug, error, warn};

use crate::byte_buffer::ByteBuffer;
use crate::config::{CMD_QUEUE_LEN, CONN_MAX_DATA_LEN, EVT_QUEUE_LEN, RX_BUFFER_SIZE};
use crate::conn::{ConnTable, F_ACTIVE, F_IN_CLOSE};
use crate::error::EspError;
use crate::modem::command::{CmdKind, Command, IpInfo, Response};
use crate::modem::events::{Event, EspEvents};
use crate::modem::parser::{
    classify, parse_cipstatus, parse_cwlap, parse_ip_line, parse_mac_line, parse_u32, Decoder,
    LineClass, Token,
};
use crate::pbuf::Pbuf;

type RawMutex = CriticalSectionRawMutex;

pub(crate) type CmdResult = Result<Response, EspError>;

/// Modem booted (`ready` seen).
pub(crate) const ST_READY: u8 = 1 << 0;
pub(crate) const ST_WIFI: u8 = 1 << 1;
pub(crate) const ST_IP: u8 = 1 << 2;

const PROMPT_TIMEOUT: Duration = Duration::from_secs(10);

/// One queued AT operation.
pub(crate) struct Message {
    pub cmd: Command,
    pub done: Arc<Signal<RawMutex, CmdResult>>,
}

/// The command currently awaiting its terminal line, plus whatever state
/// lines accumulated for it so far.
pub(crate) struct InFlight {
    pub kind: CmdKind,
    pub resp: Response,
    pub err: Option<EspError>,
}

pub(crate) struct Shared {
    pub cmd_q: Channel<RawMutex, Message, CMD_QUEUE_LEN>,
    pub evt_q: Channel<RawMutex, Event, EVT_QUEUE_LEN>,
    pub inflight: Mutex<RawMutex, Option<InFlight>>,
    /// Terminal resolution for the in-flight command.
    pub done: Signal<RawMutex, CmdResult>,
    /// The `>` payload prompt during CIPSEND.
    pub prompt: Signal<RawMutex, ()>,
    pub conns: ConnTable,
    pub status: AtomicU8,
}

impl Shared {
    pub fn new() -> Self {
        Self {
            cmd_q: Channel::new(),
            evt_q: Channel::new(),
            inflight: Mutex::new(None),
            done: Signal::new(),
            prompt: Signal::new(),
            conns: ConnTable::new(),
            status: AtomicU8::new(0),
        }
    }

    /// Queues an event for dispatch. The parser must never block on the
    /// event loop, so a full queue drops the event instead.
    pub fn post(&self, event: Event) {
        if self.evt_q.try_send(event).is_err() {
            warn!("event queue full, dropping event");
        }
    }

    pub fn status_has(&self, bit: u8) -> bool {
        self.status.load(Ordering::Acquire) & bit != 0
    }
}

/// Drains the producer queue, one exchange at a time.
pub(crate) async fn command_loop<TX: Write>(shared: Arc<Shared>, mut tx: TX) {
    loop {
        let msg = shared.cmd_q.receive().await;
        let result = exchange(&shared, &mut tx, &msg.cmd).await;
        finalize(&shared, &msg.cmd, &result).await;
        msg.done.signal(result);
    }
}

async fn exchange<TX: Write>(shared: &Shared, tx: &mut TX, cmd: &Command) -> CmdResult {
    shared.done.reset();
    shared.prompt.reset();
    *shared.inflight.lock().await = Some(InFlight {
        kind: cmd.kind(),
        resp: Response::None,
        err: None,
    });

    let line = cmd.encode();
    debug!("--> {}", line.trim_end());
    if write_all(tx, line.as_bytes()).await.is_err() {
        shared.inflight.lock().await.take();
        return Err(EspError::NoDevice);
    }

    if let Command::Send { data, .. } = cmd {
        if shared
            .prompt
            .wait()
            .with_timeout(PROMPT_TIMEOUT)
            .await
            .is_err()
        {
            shared.inflight.lock().await.take();
            return Err(EspError::Timeout);
        }
        if write_all(tx, data).await.is_err() {
            shared.inflight.lock().await.take();
            return Err(EspError::NoDevice);
        }
    }

    match shared.done.wait().with_timeout(cmd.timeout()).await {
        Ok(result) => result,
        Err(_) => {
            // Reclaim the slot; a terminal that still shows up later finds
            // no in-flight command and is dropped.
            shared.inflight.lock().await.take();
            Err(EspError::Timeout)
        }
    }
}

/// Side effects of a finished command that belong to the pipeline rather
/// than the caller: connection bookkeeping and data-sent events.
async fn finalize(shared: &Shared, cmd: &Command, result: &CmdResult) {
    match cmd {
        Command::Send { id, data } => {
            let Some(slot) = shared.conns.slot(*id) else {
                return;
            };
            let available = {
                let mut inner = slot.inner.lock().await;
                inner.bytes_to_send = inner.bytes_to_send.saturating_sub(data.len());
                if result.is_ok() {
                    inner.bytes_sent += data.len();
                }
                CONN_MAX_DATA_LEN - inner.staging.len()
            };
            match result {
                Ok(_) => shared.post(Event::ConnDataSent {
                    id: *id,
                    sent: data.len(),
                    available,
                }),
                Err(_) => shared.post(Event::ConnDataSendErr { id: *id }),
            }
        }
        Command::Close { id } => {
            if result.is_err() {
                // The close never went through; a later modem-side close is
                // a forced one again.
                shared.conns.clear_flag(*id, F_IN_CLOSE);
            }
        }
        _ => {}
    }
}

async fn write_all<TX: Write>(tx: &mut TX, bytes: &[u8]) -> Result<(), ()> {
    tx.write_all(bytes).await.map_err(|_| ())?;
    tx.flush().await.map_err(|_| ())
}

/// Feeds serial bytes through the decoder and applies every unit.
pub(crate) async fn read_loop<RX: Read>(shared: Arc<Shared>, mut rx: RX) {
    let mut buf = ByteBuffer::<RX_BUFFER_SIZE>::new();
    let mut decoder = Decoder::new();
    // Payload of the +IPD frame currently being collected.
    let mut ipd: Option<(u8, Vec<u8>)> = None;

    loop {
        buf.shift_back();
        if buf.remaining_capacity() == 0 && !decoder.in_binary_mode() {
            // A line longer than the whole window can never complete.
            warn!("rx window wedged, dropping {} buffered bytes", buf.len());
            buf.clear();
        }
        match rx.read(buf.remaining_space_mut()).await {
            Ok(0) | Err(_) => {
                error!("serial link is gone, parser stopping");
                core::future::pending::<()>().await;
            }
            Ok(n) => buf.claim(n),
        }

        while let Some(token) = decoder.pop(&mut buf) {
            handle_token(&shared, &mut ipd, token).await;
        }
    }
}

async fn handle_token(shared: &Shared, ipd: &mut Option<(u8, Vec<u8>)>, token: Token<'_>) {
    match token {
        Token::Prompt => shared.prompt.signal(()),
        Token::IpdStart { id, len, remote } => {
            if let (Some((ip, port)), Some(slot)) = (remote, shared.conns.slot(id)) {
                slot.inner.lock().await.remote = Some((ip, port));
            }
            if len > 0 {
                *ipd = Some((id, Vec::with_capacity(len)));
            }
        }
        Token::IpdChunk { id, data, last } => {
            if let Some((aid, acc)) = ipd.as_mut() {
                if *aid == id {
                    acc.extend_from_slice(data);
                }
            }
            if last {
                if let Some((id, acc)) = ipd.take() {
                    let data = Pbuf::from_vec(acc);
                    shared.conns.push_rx(id, data.clone()).await;
                    shared.post(Event::ConnDataRecv { id, data });
                }
            }
        }
        Token::Line(line) => handle_line(shared, line).await,
    }
}

async fn handle_line(shared: &Shared, line: &[u8]) {
    match classify(line) {
        LineClass::Echo | LineClass::RecvBytes => {}

        LineClass::Ok | LineClass::NoChange => resolve(shared, Ok(())).await,
        LineClass::Error => resolve(shared, Err(EspError::Err)).await,
        LineClass::Fail => resolve(shared, Err(EspError::ConnFail)).await,
        LineClass::SendOk => resolve(shared, Ok(())).await,
        LineClass::SendFail => resolve(shared, Err(EspError::Err)).await,
        LineClass::Busy | LineClass::AlreadyConnected => {
            resolve(shared, Err(EspError::InProg)).await
        }
        LineClass::LinkInvalid => resolve(shared, Err(EspError::Closed)).await,

        LineClass::Ready => {
            shared.status.fetch_or(ST_READY, Ordering::AcqRel);
            let mut slot = shared.inflight.lock().await;
            match slot.as_ref().map(|f| f.kind) {
                // `ready` is the terminal of AT+RST.
                Some(CmdKind::Reset) => {
                    let inflight = slot.take().expect("checked");
                    drop(slot);
                    shared.done.signal(Ok(inflight.resp));
                }
                // On its own it announces an unexpected reboot.
                _ => {
                    drop(slot);
                    shared.post(Event::DeviceReady);
                }
            }
        }

        LineClass::ConnConnect(id) => {
            let client = shared.conns.on_connect(id).await;
            shared.post(Event::ConnActive { id, client });
        }
        LineClass::ConnClosed(id) => {
            if let Some(forced) = shared.conns.on_closed(id) {
                shared.post(Event::ConnClosed { id, forced });
            }
        }
        LineClass::ConnConnectFail(id) => {
            let mut slot = shared.inflight.lock().await;
            if let Some(f) = slot.as_mut() {
                if f.kind == (CmdKind::Start { id }) {
                    f.err = Some(EspError::ConnFail);
                }
            }
        }

        LineClass::WifiConnected => {
            shared.status.fetch_or(ST_WIFI, Ordering::AcqRel);
            shared.post(Event::WifiConnected);
        }
        LineClass::WifiDisconnect => {
            shared
                .status
                .fetch_and(!(ST_WIFI | ST_IP), Ordering::AcqRel);
            shared.post(Event::WifiDisconnected);
        }
        LineClass::WifiGotIp => {
            shared.status.fetch_or(ST_IP, Ordering::AcqRel);
            shared.post(Event::WifiGotIp);
        }

        LineClass::Status(line) => apply_status(shared, line).await,

        LineClass::Unknown(line) => {
            let mut slot = shared.inflight.lock().await;
            match slot.as_mut() {
                // AT+GMR answers in raw text lines.
                Some(f) if f.kind == CmdKind::Version => {
                    let text = match &mut f.resp {
                        Response::Version(text) => text,
                        _ => {
                            f.resp = Response::Version(String::new());
                            match &mut f.resp {
                                Response::Version(text) => text,
                                _ => unreachable!(),
                            }
                        }
                    };
                    if let Ok(s) = core::str::from_utf8(line) {
                        text.push_str(s);
                        text.push('\n');
                    }
                }
                _ => debug!("dropping line: {:?}", core::str::from_utf8(line)),
            }
        }
    }
}

/// A terminal line resolves the in-flight command with `outcome`, unless a
/// command-specific state line already recorded a more precise error.
async fn resolve(shared: &Shared, outcome: Result<(), EspError>) {
    let mut slot = shared.inflight.lock().await;
    let Some(f) = slot.as_ref() else {
        return;
    };
    // AT+RST replies OK first and finishes with `ready`.
    if f.kind == CmdKind::Reset && outcome.is_ok() {
        return;
    }
    let f = slot.take().expect("checked");
    drop(slot);

    let result = match outcome {
        Ok(()) => match f.err {
            Some(err) => Err(err),
            None => Ok(f.resp),
        },
        Err(err) => Err(f.err.unwrap_or(err)),
    };
    shared.done.signal(result);
}

/// Applies a `+...`/`STATUS:` state line to the in-flight command. Lines
/// that mean nothing for the current command are dropped silently.
async fn apply_status(shared: &Shared, line: &[u8]) {
    let mut slot = shared.inflight.lock().await;
    let Some(f) = slot.as_mut() else {
        return;
    };
    match f.kind {
        CmdKind::Join => {
            if let Some(code) = line.strip_prefix(b"+CWJAP:") {
                // 1: timeout, 2: wrong password, 3: AP not found, 4: failed.
                f.err = Some(match parse_u32(code) {
                    Some(1) => EspError::Timeout,
                    _ => EspError::ConnFail,
                });
            }
        }
        CmdKind::ListAps => {
            if let Some(ap) = parse_cwlap(line) {
                match &mut f.resp {
                    Response::Aps(list) => list.push(ap),
                    _ => f.resp = Response::Aps(vec![ap]),
                }
            }
        }
        CmdKind::StaIp => apply_ip(f, line, b"+CIPSTA_CUR:", b"+CIPSTA:"),
        CmdKind::ApIp => apply_ip(f, line, b"+CIPAP_CUR:", b"+CIPAP:"),
        CmdKind::StaMac => apply_mac(f, line, b"+CIPSTAMAC_CUR:", b"+CIPSTAMAC:"),
        CmdKind::ApMac => apply_mac(f, line, b"+CIPAPMAC_CUR:", b"+CIPAPMAC:"),
        CmdKind::Status => {
            if let Some((id, ip, port)) = parse_cipstatus(line) {
                drop(slot);
                sync_conn_status(shared, id, ip, port).await;
            }
        }
        _ => {}
    }
}

fn apply_ip(f: &mut InFlight, line: &[u8], cur: &[u8], plain: &[u8]) {
    let parsed = parse_ip_line(line, cur).or_else(|| parse_ip_line(line, plain));
    let Some((field, addr)) = parsed else {
        return;
    };
    let info = match &mut f.resp {
        Response::Ip(info) => info,
        _ => {
            f.resp = Response::Ip(IpInfo::default());
            match &mut f.resp {
                Response::Ip(info) => info,
                _ => unreachable!(),
            }
        }
    };
    match field {
        b"ip" => info.ip = Some(addr),
        b"gateway" => info.gateway = Some(addr),
        b"netmask" => info.netmask = Some(addr),
        _ => {}
    }
}

fn apply_mac(f: &mut InFlight, line: &[u8], cur: &[u8], plain: &[u8]) {
    if let Some(mac) = parse_mac_line(line, cur).or_else(|| parse_mac_line(line, plain)) {
        f.resp = Response::Mac(mac);
    }
}

/// CIPSTATUS reported an active connection the table does not know about
/// (driver restart against a live modem).
async fn sync_conn_status(shared: &Shared, id: u8, ip: core::net::Ipv4Addr, port: u16) {
    let Some(slot) = shared.conns.slot(id) else {
        return;
    };
    slot.inner.lock().await.remote = Some((ip, port));
    slot.flags.fetch_or(F_ACTIVE, Ordering::AcqRel);
}

/// Dispatches events to the user handler and generates the periodic
/// per-connection poll ticks.
pub(crate) async fn event_loop<H: EspEvents>(
    shared: Arc<Shared>,
    poll_interval: Duration,
    mut handler: H,
) {
    let mut ticker = Ticker::every(poll_interval);
    loop {
        match select(shared.evt_q.receive(), ticker.next()).await {
            Either::First(event) => handler.on_event(event).await,
            Either::Second(()) => {
                for id in shared.conns.active_ids() {
                    handler.on_event(Event::ConnPoll { id }).await;
                }
            }
        }
    }
}
