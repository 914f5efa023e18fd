//! Embedded HTTP server running on the driver's connection events.
//!
//! One [`HttpServer`] owns a per-slot request/response state machine and
//! implements [`EspEvents`]; hand it to [`Runner::run`](crate::Runner::run)
//! and enable the modem-side listener with [`Esp::set_server`]. Files come
//! from an [`FsProvider`]; dynamic content hooks in through CGI handlers,
//! SSI tags, and the POST callbacks on [`HttpApp`].

mod fs;
mod ssi;

pub use fs::{FileChunk, FsProvider, HttpFile, StaticFs};

use alloc::boxed::Box;
use alloc::vec::Vec;

use log::{debug, warn};

use crate::config::{CONN_MAX_DATA_LEN, ESP_MAX_CONNS, HTTP_MAX_PARAMS, HTTP_MAX_URI_LEN};
use crate::modem::{Esp, EspEvents, Event};
use crate::pbuf::{Pbuf, PBUF_NOT_FOUND};
use ssi::SsiEngine;

/// Files probed, in order, for `/` requests.
const INDEX_FILES: &[&str] = &[
    "/index.shtml",
    "/index.shtm",
    "/index.ssi",
    "/index.html",
    "/index.htm",
];

/// Files probed, in order, when nothing else resolves.
const NOT_FOUND_FILES: &[&str] = &["/404.shtml", "/404.shtm", "/404.ssi", "/404.html", "/404.htm"];

/// Suffixes that switch a response into SSI processing.
const SSI_SUFFIXES: &[&str] = &[".shtml", ".shtm", ".ssi"];

#[cfg(all(feature = "method-not-allowed", feature = "http-post"))]
const RESP_405: &[u8] =
    b"HTTP/1.0 405 Method Not Allowed\r\nAllow: GET, POST\r\nConnection: close\r\n\r\n";
#[cfg(all(feature = "method-not-allowed", not(feature = "http-post")))]
const RESP_405: &[u8] =
    b"HTTP/1.0 405 Method Not Allowed\r\nAllow: GET\r\nConnection: close\r\n\r\n";

/// One query-string pair, borrowed from the request's URI scratch.
#[derive(Debug, Clone, Copy)]
pub struct QueryParam<'a> {
    pub name: &'a str,
    pub value: &'a str,
}

/// URI-keyed handler that rewrites the request to the file it should
/// serve.
pub struct CgiEntry {
    pub uri: &'static str,
    pub handler: fn(&[QueryParam<'_>]) -> &'static str,
}

/// Application hooks: SSI tag resolution and POST streaming.
pub trait HttpApp: Send {
    /// Appends the replacement bytes for SSI tag `name`.
    fn ssi_tag(&mut self, _name: &str, _out: &mut Vec<u8>) {}

    #[cfg(feature = "http-post")]
    fn post_start(&mut self, _uri: &str, _content_length: usize) {}
    #[cfg(feature = "http-post")]
    fn post_data(&mut self, _data: &Pbuf) {}
    #[cfg(feature = "http-post")]
    fn post_end(&mut self) {}
}

/// App serving static files only.
pub struct NoApp;

impl HttpApp for NoApp {}

/// Everything the server needs at construction.
pub struct HttpInit {
    pub fs: Box<dyn FsProvider>,
    pub app: Box<dyn HttpApp>,
    pub cgi: &'static [CgiEntry],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Method {
    Get,
    #[cfg(feature = "http-post")]
    Post,
    NotAllowed,
}

/// Buffered file data on its way out.
enum RespBuf {
    Empty,
    Static { data: &'static [u8], pos: usize },
    Owned { data: Vec<u8>, pos: usize },
}

impl RespBuf {
    fn is_empty(&self) -> bool {
        match self {
            RespBuf::Empty => true,
            RespBuf::Static { data, pos } => *pos >= data.len(),
            RespBuf::Owned { data, pos } => *pos >= data.len(),
        }
    }

    fn pending(&self) -> &[u8] {
        match self {
            RespBuf::Empty => &[],
            RespBuf::Static { data, pos } => &data[*pos..],
            RespBuf::Owned { data, pos } => &data[*pos..],
        }
    }

    fn consume(&mut self, n: usize) {
        match self {
            RespBuf::Empty => {}
            RespBuf::Static { pos, .. } | RespBuf::Owned { pos, .. } => *pos += n,
        }
        if self.is_empty() {
            *self = RespBuf::Empty;
        }
    }
}

/// Per-connection request/response state.
struct HttpState {
    method: Method,
    /// Request bytes until the header terminator shows up.
    req: Pbuf,
    headers_received: bool,
    uri: heapless::Vec<u8, HTTP_MAX_URI_LEN>,

    #[cfg(feature = "http-post")]
    content_length: usize,
    #[cfg(feature = "http-post")]
    content_received: usize,
    #[cfg(feature = "http-post")]
    post_started: bool,
    #[cfg(feature = "http-post")]
    post_done: bool,

    /// The request is fully taken in; the pump may emit.
    process_resp: bool,
    /// A close was initiated; ignore further work for this slot.
    closing: bool,

    resp_file: Option<HttpFile>,
    is_ssi: bool,
    ssi: SsiEngine,

    /// Generated output (SSI expansion, the 405 template) drained under
    /// transmit credit.
    out: Vec<u8>,
    out_pos: usize,
    /// Plain file data drained under transmit credit.
    buf: RespBuf,

    written_total: usize,
    sent_total: usize,
}

impl HttpState {
    fn new() -> Self {
        Self {
            method: Method::NotAllowed,
            req: Pbuf::default(),
            headers_received: false,
            uri: heapless::Vec::new(),
            #[cfg(feature = "http-post")]
            content_length: 0,
            #[cfg(feature = "http-post")]
            content_received: 0,
            #[cfg(feature = "http-post")]
            post_started: false,
            #[cfg(feature = "http-post")]
            post_done: false,
            process_resp: false,
            closing: false,
            resp_file: None,
            is_ssi: false,
            ssi: SsiEngine::new(),
            out: Vec::new(),
            out_pos: 0,
            buf: RespBuf::Empty,
            written_total: 0,
            sent_total: 0,
        }
    }

    fn has_pending(&self) -> bool {
        self.out_pos < self.out.len() || !self.buf.is_empty()
    }

    fn pending_slice(&self, limit: usize) -> &[u8] {
        let src = if self.out_pos < self.out.len() {
            &self.out[self.out_pos..]
        } else {
            self.buf.pending()
        };
        &src[..src.len().min(limit)]
    }

    fn consume_pending(&mut self, n: usize) {
        if self.out_pos < self.out.len() {
            self.out_pos += n;
            if self.out_pos >= self.out.len() {
                self.out.clear();
                self.out_pos = 0;
            }
        } else {
            self.buf.consume(n);
        }
    }

    /// Feeds one received pbuf into the request state machine. Returns
    /// true when `process_resp` just turned on.
    fn on_data(
        &mut self,
        data: Pbuf,
        app: &mut dyn HttpApp,
        fs: &mut dyn FsProvider,
        cgi: &[CgiEntry],
    ) -> bool {
        if self.process_resp || self.closing {
            return false;
        }

        if self.headers_received {
            #[cfg(feature = "http-post")]
            if self.method == Method::Post && !self.post_done {
                self.content_received += data.len();
                app.post_data(&data);
                if self.content_received >= self.content_length {
                    self.finish_post(app);
                    self.prepare_response(fs, cgi);
                    return true;
                }
            }
            return false;
        }

        self.req.concat(data);
        let headers_end = self.req.strfind(b"\r\n\r\n", 0);
        if headers_end == PBUF_NOT_FOUND {
            return false;
        }
        self.headers_received = true;
        self.parse_request_line();

        match self.method {
            Method::Get => {
                self.req = Pbuf::default();
                self.prepare_response(fs, cgi);
            }
            Method::NotAllowed => {
                self.req = Pbuf::default();
                self.prepare_405();
            }
            #[cfg(feature = "http-post")]
            Method::Post => self.start_post(headers_end, app, fs, cgi),
        }
        self.process_resp
    }

    /// `GET /uri HTTP/x.y` — method and URI out of the first line. The
    /// URI lands in the bounded scratch; anything longer is cut there.
    fn parse_request_line(&mut self) {
        let mut prefix = [0u8; 5];
        let got = self.req.copy(&mut prefix, 0);

        let uri_from = if got >= 4 && &prefix[..4] == b"GET " {
            self.method = Method::Get;
            4
        } else if got >= 5 && &prefix[..5] == b"POST " {
            #[cfg(feature = "http-post")]
            {
                self.method = Method::Post;
            }
            #[cfg(not(feature = "http-post"))]
            {
                self.method = Method::NotAllowed;
            }
            5
        } else {
            self.method = Method::NotAllowed;
            return;
        };

        self.uri.clear();
        let mut i = uri_from;
        while let Some(b) = self.req.get_at(i) {
            if b == b' ' || b == b'\r' || b == b'\n' {
                break;
            }
            if self.uri.push(b).is_err() {
                break;
            }
            i += 1;
        }
    }

    #[cfg(feature = "http-post")]
    fn start_post(
        &mut self,
        headers_end: usize,
        app: &mut dyn HttpApp,
        fs: &mut dyn FsProvider,
        cgi: &[CgiEntry],
    ) {
        self.content_length = find_content_length(&self.req, headers_end).unwrap_or(0);
        if self.content_length == 0 {
            self.req = Pbuf::default();
            self.prepare_response(fs, cgi);
            return;
        }

        let uri = core::str::from_utf8(&self.uri).unwrap_or("");
        let path_len = uri.find('?').unwrap_or(uri.len());
        app.post_start(&uri[..path_len], self.content_length);
        self.post_started = true;

        // Body bytes that arrived inside the header pbuf.
        let mut body = self.req.clone();
        body.advance(headers_end + 4);
        self.req = Pbuf::default();
        if !body.is_empty() {
            self.content_received += body.len();
            app.post_data(&body);
        }
        if self.content_received >= self.content_length {
            self.finish_post(app);
            self.prepare_response(fs, cgi);
        }
    }

    #[cfg(feature = "http-post")]
    fn finish_post(&mut self, app: &mut dyn HttpApp) {
        if self.post_started && !self.post_done {
            app.post_end();
        }
        self.post_done = true;
    }

    /// Resolves the URI to a response file per the probing rules, then
    /// arms the pump.
    fn prepare_response(&mut self, fs: &mut dyn FsProvider, cgi: &[CgiEntry]) {
        self.process_resp = true;

        let uri = self.uri.clone();
        let mut opened: Option<(HttpFile, &str)> = None;

        if uri.as_slice() == b"/" || uri.starts_with(b"/?") {
            for &cand in INDEX_FILES {
                if let Some(file) = fs.open(cand) {
                    opened = Some((file, cand));
                    break;
                }
            }
        } else if let Ok(uri) = core::str::from_utf8(&uri) {
            let (path, query) = match uri.split_once('?') {
                Some((p, q)) => (p, q),
                None => (uri, ""),
            };

            let mut target = path;
            if let Some(entry) = cgi.iter().find(|e| e.uri == path) {
                let mut params: heapless::Vec<QueryParam<'_>, HTTP_MAX_PARAMS> =
                    heapless::Vec::new();
                parse_query(query, &mut params);
                target = (entry.handler)(&params);
            }

            if let Some(file) = fs.open(target) {
                opened = Some((file, target));
            }
        }

        if opened.is_none() {
            for &cand in NOT_FOUND_FILES {
                if let Some(file) = fs.open(cand) {
                    opened = Some((file, cand));
                    break;
                }
            }
        }

        match opened {
            Some((file, path)) => {
                self.is_ssi = is_ssi_path(path);
                self.resp_file = Some(file);
            }
            None => {
                debug!("http: nothing to serve for {:?}", core::str::from_utf8(&uri));
            }
        }
    }

    fn prepare_405(&mut self) {
        #[cfg(feature = "method-not-allowed")]
        self.out.extend_from_slice(RESP_405);
        self.process_resp = true;
    }

    /// Reads the next chunk of the response file into the pending buffers,
    /// running it through SSI when armed. False means an unrecoverable
    /// allocation failure.
    fn fill_from_file(&mut self, fs: &mut dyn FsProvider, app: &mut dyn HttpApp) -> bool {
        let Some(file) = self.resp_file.as_mut() else {
            return true;
        };
        let want = file.remaining.min(CONN_MAX_DATA_LEN);

        if file.is_static {
            let FileChunk::Static(data) = fs.read(file, want, &mut []) else {
                return false;
            };
            if self.is_ssi {
                let ssi = &mut self.ssi;
                ssi.process(data, &mut self.out, &mut |name, out| app.ssi_tag(name, out));
            } else {
                self.buf = RespBuf::Static { data, pos: 0 };
            }
            return true;
        }

        // Dynamic read buffer: start at the chunk ceiling and halve down
        // to the 64-byte floor before giving up.
        let mut size = want;
        let mut data = loop {
            match try_alloc(size) {
                Some(v) => break v,
                None if size <= 64 => return false,
                None => size = (size / 2).max(64),
            }
        };
        let n = match fs.read(file, size.min(want), &mut data) {
            FileChunk::Copied(n) => n,
            FileChunk::Static(s) => {
                data.clear();
                data.extend_from_slice(s);
                s.len()
            }
        };
        data.truncate(n);
        if self.is_ssi {
            let ssi = &mut self.ssi;
            ssi.process(&data, &mut self.out, &mut |name, out| app.ssi_tag(name, out));
        } else {
            self.buf = RespBuf::Owned { data, pos: 0 };
        }
        true
    }
}

fn try_alloc(n: usize) -> Option<Vec<u8>> {
    let mut v = Vec::new();
    v.try_reserve_exact(n).ok()?;
    v.resize(n, 0);
    Some(v)
}

fn is_ssi_path(path: &str) -> bool {
    SSI_SUFFIXES.iter().any(|suffix| {
        path.len() >= suffix.len()
            && path[path.len() - suffix.len()..].eq_ignore_ascii_case(suffix)
    })
}

fn parse_query<'a>(query: &'a str, params: &mut heapless::Vec<QueryParam<'a>, HTTP_MAX_PARAMS>) {
    for pair in query.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (name, value) = match pair.split_once('=') {
            Some((n, v)) => (n, v),
            None => (pair, ""),
        };
        if params.push(QueryParam { name, value }).is_err() {
            break;
        }
    }
}

/// `Content-Length:` / `content-length:` inside the header block.
#[cfg(feature = "http-post")]
fn find_content_length(req: &Pbuf, headers_end: usize) -> Option<usize> {
    let upper = req.strfind(b"Content-Length:", 0);
    let lower = req.strfind(b"content-length:", 0);
    let pos = match (upper, lower) {
        (PBUF_NOT_FOUND, p) | (p, PBUF_NOT_FOUND) => p,
        (a, b) => a.min(b),
    };
    if pos == PBUF_NOT_FOUND || pos >= headers_end {
        return None;
    }

    let mut i = pos + b"Content-Length:".len();
    while req.get_at(i) == Some(b' ') {
        i += 1;
    }
    let mut value: usize = 0;
    let mut any = false;
    while let Some(b) = req.get_at(i) {
        if !b.is_ascii_digit() {
            break;
        }
        value = value.checked_mul(10)?.checked_add((b - b'0') as usize)?;
        any = true;
        i += 1;
    }
    any.then_some(value)
}

/// The HTTP server itself: install it as the event handler for the runner.
pub struct HttpServer {
    esp: Esp,
    fs: Box<dyn FsProvider>,
    app: Box<dyn HttpApp>,
    cgi: &'static [CgiEntry],
    states: [Option<HttpState>; ESP_MAX_CONNS],
}

impl HttpServer {
    pub fn new(esp: Esp, init: HttpInit) -> Self {
        Self {
            esp,
            fs: init.fs,
            app: init.app,
            cgi: init.cgi,
            states: core::array::from_fn(|_| None),
        }
    }

    fn state_mut(&mut self, id: u8) -> Option<&mut HttpState> {
        self.states.get_mut(id as usize).and_then(Option::as_mut)
    }

    async fn data_recv(&mut self, id: u8, data: Pbuf) {
        let Self {
            states, fs, app, cgi, ..
        } = self;
        let Some(state) = states.get_mut(id as usize).and_then(Option::as_mut) else {
            return;
        };
        if state.on_data(data, app.as_mut(), fs.as_mut(), cgi) {
            self.pump(id).await;
        }
    }

    /// The response pump: runs on `ConnDataSent`, `ConnPoll`, and the
    /// `process_resp` transition. Refuses to emit while bytes are still in
    /// flight, writes at most the available transmit credit, and closes
    /// the connection once everything went out.
    async fn pump(&mut self, id: u8) {
        let esp = self.esp.clone();
        let Self {
            states, fs, app, ..
        } = self;
        let Some(state) = states.get_mut(id as usize).and_then(Option::as_mut) else {
            return;
        };
        if state.closing || !state.process_resp {
            return;
        }
        if state.written_total != state.sent_total {
            // Bytes still in flight. The slot's queue counter is the
            // authority, so a dropped ConnDataSent cannot wedge the
            // response: poll ticks land here and re-sync.
            let (_, queued) = esp.conn_counters(id).await;
            if queued != 0 {
                return;
            }
            state.sent_total = state.written_total;
        }

        while !state.has_pending() {
            match state.resp_file.as_ref().map(|f| f.remaining) {
                None => {
                    state.closing = true;
                    let _ = esp.conn_close(id).await;
                    return;
                }
                Some(0) => {
                    let file = state.resp_file.take().expect("checked");
                    fs.close(file);
                    if state.is_ssi {
                        state.ssi.finish(&mut state.out);
                    }
                }
                Some(_) => {
                    if !state.fill_from_file(fs.as_mut(), app.as_mut()) {
                        warn!("http: response buffer allocation failed, closing {}", id);
                        state.closing = true;
                        let _ = esp.conn_close(id).await;
                        return;
                    }
                }
            }
        }

        let available = esp.conn_mem_available(id).await;
        if available == 0 {
            return;
        }
        let chunk = state.pending_slice(available);
        let n = chunk.len();
        let write = esp.conn_write(id, chunk).await;
        let flush = match write {
            Ok(_) => esp.conn_flush(id).await,
            Err(e) => Err(e),
        };
        match flush {
            Ok(()) => {
                state.consume_pending(n);
                state.written_total += n;
            }
            Err(_) => {
                state.closing = true;
                let _ = esp.conn_close(id).await;
            }
        }
    }

    async fn fail(&mut self, id: u8) {
        let esp = self.esp.clone();
        if let Some(state) = self.state_mut(id) {
            if !state.closing {
                state.closing = true;
                let _ = esp.conn_close(id).await;
            }
        }
    }

    /// The slot is gone: run the POST epilogue if one was cut short, close
    /// the response file, and free the state.
    fn closed(&mut self, id: u8) {
        let Self {
            states, fs, app, ..
        } = self;
        let Some(mut state) = states.get_mut(id as usize).and_then(Option::take) else {
            return;
        };
        #[cfg(feature = "http-post")]
        state.finish_post(app.as_mut());
        #[cfg(not(feature = "http-post"))]
        let _ = app;
        if let Some(file) = state.resp_file.take() {
            fs.close(file);
        }
    }
}

#[async_trait::async_trait]
impl EspEvents for HttpServer {
    async fn on_event(&mut self, event: Event) {
        match event {
            Event::ConnActive { id, client: false } => {
                if (id as usize) < ESP_MAX_CONNS {
                    self.states[id as usize] = Some(HttpState::new());
                }
            }
            Event::ConnDataRecv { id, data } => self.data_recv(id, data).await,
            Event::ConnDataSent { id, sent, .. } => {
                if let Some(state) = self.state_mut(id) {
                    // Clamped so the poll-path re-sync cannot double-count.
                    state.sent_total = (state.sent_total + sent).min(state.written_total);
                }
                self.pump(id).await;
            }
            Event::ConnDataSendErr { id } => self.fail(id).await,
            Event::ConnPoll { id } => self.pump(id).await,
            Event::ConnClosed { id, .. } => self.closed(id),
            _ => {}
        }
    }
}
