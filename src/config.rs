use embassy_time::Duration;

/// Number of logical connection slots the modem multiplexes (`AT+CIPMUX=1`).
pub const ESP_MAX_CONNS: usize = 5;

/// Largest payload carried by a single `AT+CIPSEND`.
pub const CONN_MAX_DATA_LEN: usize = 2048;

/// Receive window between the serial link and the parser.
pub const RX_BUFFER_SIZE: usize = 1024;

/// Outbound command queue depth.
pub const CMD_QUEUE_LEN: usize = 8;

/// Event queue depth between the parser and the dispatch loop.
pub const EVT_QUEUE_LEN: usize = 32;

/// Hard ceiling on the request-line URI, query string included.
pub const HTTP_MAX_URI_LEN: usize = 256;

/// Most `(name, value)` pairs extracted from a query string.
pub const HTTP_MAX_PARAMS: usize = 16;

pub const HTTP_SSI_TAG_START: &[u8] = b"<!--#";
pub const HTTP_SSI_TAG_END: &[u8] = b"-->";

/// Longest SSI tag name; anything longer is flushed verbatim.
pub const HTTP_SSI_TAG_MAX_LEN: usize = 48;

/// Hard timeout applied to a command that does not carry its own.
pub const CMD_TIMEOUT_DEFAULT: Duration = Duration::from_secs(60);

/// `AT+CIPSTART` waits for the remote end, so it gets a longer leash.
pub const CMD_TIMEOUT_CIPSTART: Duration = Duration::from_secs(180);

/// Runtime knobs for the driver. The compile-time sizing lives in the
/// constants above.
#[derive(Debug, Clone)]
pub struct Config {
    /// Cadence of `ConnPoll` events for every active connection.
    pub poll_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
        }
    }
}
