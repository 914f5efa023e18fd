use core::fmt::{self, Display};

pub type EspResult<T> = Result<T, EspError>;

/// Failure kinds surfaced by every driver operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EspError {
    /// Generic failure reported by the modem or the pipeline.
    Err,
    /// An argument did not pass validation before anything was sent.
    ParamErr,
    /// Allocation failed or a bounded buffer was full.
    NoMem,
    /// The hard per-command deadline expired before a terminal line.
    Timeout,
    /// More data is needed before the operation can make progress.
    Cont,
    /// The connection is closed or was closed underneath the caller.
    Closed,
    /// Another exchange for the same resource is still in progress.
    InProg,
    /// The requested feature is compiled out or not switched on.
    NotEnabled,
    /// The serial link failed or the modem never answered.
    NoDevice,
    /// The access point rejected the join or the TCP handshake failed.
    ConnFail,
}

impl Display for EspError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EspError::Err => "generic error",
            EspError::ParamErr => "invalid parameter",
            EspError::NoMem => "out of memory",
            EspError::Timeout => "timeout",
            EspError::Cont => "awaiting more data",
            EspError::Closed => "connection closed",
            EspError::InProg => "operation in progress",
            EspError::NotEnabled => "feature not enabled",
            EspError::NoDevice => "no device",
            EspError::ConnFail => "connection failed",
        };
        write!(f, "{}", s)
    }
}
