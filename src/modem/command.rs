//! AT command codes, their parameters, and wire encoding.

use core::fmt::{self, Display};

use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;
use embassy_time::Duration;

use crate::config::{CMD_TIMEOUT_CIPSTART, CMD_TIMEOUT_DEFAULT};

/// Wi-Fi operating mode (`AT+CWMODE`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WifiMode {
    Station = 1,
    AccessPoint = 2,
    StationAccessPoint = 3,
}

/// Transport of a logical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnKind {
    Tcp,
    Udp,
    Ssl,
}

impl ConnKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnKind::Tcp => "TCP",
            ConnKind::Udp => "UDP",
            ConnKind::Ssl => "SSL",
        }
    }
}

/// 48-bit hardware address, printed the way the modem quotes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Mac(pub [u8; 6]);

impl Display for Mac {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            m[0], m[1], m[2], m[3], m[4], m[5]
        )
    }
}

/// Station or soft-AP addressing as reported by `+CIPSTA`/`+CIPAP`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IpInfo {
    pub ip: Option<core::net::Ipv4Addr>,
    pub gateway: Option<core::net::Ipv4Addr>,
    pub netmask: Option<core::net::Ipv4Addr>,
}

/// One `+CWLAP` listing entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessPoint {
    pub ecn: u8,
    pub ssid: heapless::String<32>,
    pub rssi: i16,
    pub mac: Mac,
    pub channel: u8,
}

/// One AT operation queued to the producer loop.
#[derive(Debug, Clone)]
pub enum Command {
    Reset,
    EchoOff,
    Version,
    WifiMode {
        mode: WifiMode,
        persistent: bool,
    },
    Join {
        ssid: heapless::String<32>,
        pass: heapless::String<64>,
        mac: Option<Mac>,
        persistent: bool,
    },
    Quit,
    ListAps,
    StaIpGet,
    StaIpSet {
        info: IpInfo,
        persistent: bool,
    },
    ApIpGet,
    ApIpSet {
        info: IpInfo,
        persistent: bool,
    },
    StaMacGet,
    StaMacSet {
        mac: Mac,
        persistent: bool,
    },
    ApMacGet,
    ApMacSet {
        mac: Mac,
        persistent: bool,
    },
    Mux {
        enable: bool,
    },
    Dinfo {
        enable: bool,
    },
    Server {
        enable: bool,
        port: u16,
    },
    ServerMaxConn {
        max_conn: u8,
    },
    ServerTimeout {
        timeout_s: u16,
    },
    Start {
        id: u8,
        kind: ConnKind,
        host: heapless::String<64>,
        port: u16,
    },
    Close {
        id: u8,
    },
    Send {
        id: u8,
        data: Vec<u8>,
    },
    Status,
    SslSize {
        size: u32,
    },
    Uart {
        baudrate: u32,
        persistent: bool,
    },
}

/// Discriminant plus the context the parser needs to interpret state lines
/// for the in-flight command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CmdKind {
    Reset,
    Version,
    Join,
    ListAps,
    StaIp,
    ApIp,
    StaMac,
    ApMac,
    Start { id: u8 },
    Close { id: u8 },
    Send { id: u8 },
    Status,
    Other,
}

fn cur_def(persistent: bool) -> &'static str {
    if persistent {
        "_DEF"
    } else {
        "_CUR"
    }
}

/// Escapes `"`, `,` and `\` the way the AT dialect requires inside quoted
/// string arguments.
fn escape_into(out: &mut String, s: &str) {
    for c in s.chars() {
        if matches!(c, '"' | ',' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
}

impl Command {
    pub(crate) fn kind(&self) -> CmdKind {
        match self {
            Command::Reset => CmdKind::Reset,
            Command::Version => CmdKind::Version,
            Command::Join { .. } => CmdKind::Join,
            Command::ListAps => CmdKind::ListAps,
            Command::StaIpGet | Command::StaIpSet { .. } => CmdKind::StaIp,
            Command::ApIpGet | Command::ApIpSet { .. } => CmdKind::ApIp,
            Command::StaMacGet | Command::StaMacSet { .. } => CmdKind::StaMac,
            Command::ApMacGet | Command::ApMacSet { .. } => CmdKind::ApMac,
            Command::Start { id, .. } => CmdKind::Start { id: *id },
            Command::Close { id } => CmdKind::Close { id: *id },
            Command::Send { id, .. } => CmdKind::Send { id: *id },
            Command::Status => CmdKind::Status,
            _ => CmdKind::Other,
        }
    }

    /// Hard deadline for the whole exchange with the modem.
    pub(crate) fn timeout(&self) -> Duration {
        match self {
            Command::Start { .. } => CMD_TIMEOUT_CIPSTART,
            // Scale with the payload: the modem acknowledges byte by byte.
            Command::Send { data, .. } => {
                Duration::from_secs(10) + Duration::from_millis(data.len() as u64)
            }
            _ => CMD_TIMEOUT_DEFAULT,
        }
    }

    /// The full command line, CRLF included.
    pub(crate) fn encode(&self) -> String {
        let mut out = String::new();
        match self {
            Command::Reset => out.push_str("AT+RST"),
            Command::EchoOff => out.push_str("ATE0"),
            Command::Version => out.push_str("AT+GMR"),
            Command::WifiMode { mode, persistent } => {
                out = format!("AT+CWMODE{}={}", cur_def(*persistent), *mode as u8);
            }
            Command::Join {
                ssid,
                pass,
                mac,
                persistent,
            } => {
                out = format!("AT+CWJAP{}=\"", cur_def(*persistent));
                escape_into(&mut out, ssid);
                out.push_str("\",\"");
                escape_into(&mut out, pass);
                out.push('"');
                if let Some(mac) = mac {
                    out.push_str(&format!(",\"{}\"", mac));
                }
            }
            Command::Quit => out.push_str("AT+CWQAP"),
            Command::ListAps => out.push_str("AT+CWLAP"),
            Command::StaIpGet => out.push_str("AT+CIPSTA_CUR?"),
            Command::StaIpSet { info, persistent } => {
                out = encode_ip_set("AT+CIPSTA", info, *persistent);
            }
            Command::ApIpGet => out.push_str("AT+CIPAP_CUR?"),
            Command::ApIpSet { info, persistent } => {
                out = encode_ip_set("AT+CIPAP", info, *persistent);
            }
            Command::StaMacGet => out.push_str("AT+CIPSTAMAC_CUR?"),
            Command::StaMacSet { mac, persistent } => {
                out = format!("AT+CIPSTAMAC{}=\"{}\"", cur_def(*persistent), mac);
            }
            Command::ApMacGet => out.push_str("AT+CIPAPMAC_CUR?"),
            Command::ApMacSet { mac, persistent } => {
                out = format!("AT+CIPAPMAC{}=\"{}\"", cur_def(*persistent), mac);
            }
            Command::Mux { enable } => {
                out = format!("AT+CIPMUX={}", *enable as u8);
            }
            Command::Dinfo { enable } => {
                out = format!("AT+CIPDINFO={}", *enable as u8);
            }
            Command::Server { enable, port } => {
                out = format!("AT+CIPSERVER={},{}", *enable as u8, port);
            }
            Command::ServerMaxConn { max_conn } => {
                out = format!("AT+CIPSERVERMAXCONN={}", max_conn);
            }
            Command::ServerTimeout { timeout_s } => {
                out = format!("AT+CIPSTO={}", timeout_s);
            }
            Command::Start {
                id,
                kind,
                host,
                port,
            } => {
                out = format!("AT+CIPSTART={},\"{}\",\"", id, kind.as_str());
                escape_into(&mut out, host);
                out.push_str(&format!("\",{}", port));
            }
            Command::Close { id } => {
                out = format!("AT+CIPCLOSE={}", id);
            }
            Command::Send { id, data } => {
                out = format!("AT+CIPSEND={},{}", id, data.len());
            }
            Command::Status => out.push_str("AT+CIPSTATUS"),
            Command::SslSize { size } => {
                out = format!("AT+CIPSSLSIZE={}", size);
            }
            Command::Uart { baudrate, persistent } => {
                out = format!("AT+UART{}={},8,1,0,0", cur_def(*persistent), baudrate);
            }
        }
        out.push_str("\r\n");
        out
    }
}

fn encode_ip_set(name: &str, info: &IpInfo, persistent: bool) -> String {
    let mut out = format!(
        "{}{}=\"{}\"",
        name,
        cur_def(persistent),
        info.ip.unwrap_or(core::net::Ipv4Addr::UNSPECIFIED)
    );
    if let Some(gw) = info.gateway {
        out.push_str(&format!(",\"{}\"", gw));
        if let Some(mask) = info.netmask {
            out.push_str(&format!(",\"{}\"", mask));
        }
    }
    out
}

/// Data carried back to the caller by a finished command.
#[derive(Debug, Clone, Default)]
pub enum Response {
    #[default]
    None,
    Version(String),
    Ip(IpInfo),
    Mac(Mac),
    Aps(Vec<AccessPoint>),
}
