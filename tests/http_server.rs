//! HTTP server scenarios: the server runs as the event handler against a
//! scripted modem, clients arrive as inbound connections with +IPD
//! request bytes.

#![cfg(feature = "http-server")]

mod common;

use std::sync::{Arc, Mutex};

use common::{drive, wait_until, Wire};
use esp_at_modem::http::{CgiEntry, HttpApp, HttpInit, HttpServer, NoApp, QueryParam, StaticFs};
use esp_at_modem::{Config, Esp, Pbuf};

fn server_with(
    wire: &Wire,
    files: &'static [(&'static str, &'static [u8])],
    app: Box<dyn HttpApp>,
    cgi: &'static [CgiEntry],
) -> (Esp, impl core::future::Future) {
    let (rx, tx) = wire.split();
    let (esp, runner) = esp_at_modem::new(Config::default(), rx, tx);
    let server = HttpServer::new(
        esp.clone(),
        HttpInit {
            fs: Box::new(StaticFs::new(files)),
            app,
            cgi,
        },
    );
    (esp, runner.run(server))
}

/// `GET /` served from the first index candidate that opens.
#[test]
fn get_index_serves_the_file_and_closes() {
    static FILES: &[(&str, &[u8])] = &[("/index.html", b"<html/>")];

    let wire = Wire::new();
    wire.expect(b"AT+CIPSEND=0,7\r\n", b"> ");
    wire.expect(b"<html/>", b"Recv 7 bytes\r\nSEND OK\r\n");
    wire.expect(b"AT+CIPCLOSE=0\r\n", b"0,CLOSED\r\nOK\r\n");

    let (_esp, runner) = server_with(&wire, FILES, Box::new(NoApp), &[]);

    wire.inject(b"0,CONNECT\r\n");
    wire.inject(b"+IPD,0,18:GET / HTTP/1.0\r\n\r\n");

    drive(runner, async {
        wait_until(|| wire.script_done()).await;
    });

    // The client saw exactly the file body.
    let sent = wire.sent();
    let body_at = sent
        .windows(7)
        .position(|w| w == b"<html/>")
        .expect("body emitted");
    assert!(body_at > 0);
}

/// Two identical GETs produce byte-identical response streams.
#[test]
fn static_get_is_idempotent() {
    static FILES: &[(&str, &[u8])] = &[("/page.html", b"same-bytes")];

    let responses: Vec<Vec<u8>> = (0..2)
        .map(|_| {
            let wire = Wire::new();
            wire.expect(b"AT+CIPSEND=0,10\r\n", b"> ");
            wire.expect(b"same-bytes", b"SEND OK\r\n");
            wire.expect(b"AT+CIPCLOSE=0\r\n", b"0,CLOSED\r\nOK\r\n");

            let (_esp, runner) = server_with(&wire, FILES, Box::new(NoApp), &[]);
            wire.inject(b"0,CONNECT\r\n");
            wire.inject(b"+IPD,0,27:GET /page.html HTTP/1.0\r\n\r\n");
            drive(runner, async {
                wait_until(|| wire.script_done()).await;
            });
            wire.sent()
        })
        .collect();

    assert_eq!(responses[0], responses[1]);
}

#[test]
fn missing_file_falls_back_to_the_404_list() {
    static FILES: &[(&str, &[u8])] = &[("/404.html", b"nope")];

    let wire = Wire::new();
    wire.expect(b"AT+CIPSEND=0,4\r\n", b"> ");
    wire.expect(b"nope", b"SEND OK\r\n");
    wire.expect(b"AT+CIPCLOSE=0\r\n", b"0,CLOSED\r\nOK\r\n");

    let (_esp, runner) = server_with(&wire, FILES, Box::new(NoApp), &[]);
    wire.inject(b"0,CONNECT\r\n");
    wire.inject(b"+IPD,0,25:GET /missing HTTP/1.0\r\n\r\n");

    drive(runner, async {
        wait_until(|| wire.script_done()).await;
    });
}

#[test]
fn unresolvable_request_closes_without_a_body() {
    static FILES: &[(&str, &[u8])] = &[];

    let wire = Wire::new();
    wire.expect(b"AT+CIPCLOSE=0\r\n", b"0,CLOSED\r\nOK\r\n");

    let (_esp, runner) = server_with(&wire, FILES, Box::new(NoApp), &[]);
    wire.inject(b"0,CONNECT\r\n");
    wire.inject(b"+IPD,0,25:GET /missing HTTP/1.0\r\n\r\n");

    drive(runner, async {
        wait_until(|| wire.script_done()).await;
    });

    assert!(!wire.sent().windows(7).any(|w| w == b"CIPSEND"));
}

#[cfg(feature = "method-not-allowed")]
#[test]
fn disallowed_method_gets_a_405_with_allow_header() {
    static FILES: &[(&str, &[u8])] = &[("/index.html", b"x")];

    let wire = Wire::new();
    // Whatever length the template has, the prompt/ack dialogue is the same.
    wire.expect(b"AT+CIPSEND=0,", b"> ");
    wire.expect(b"\r\n\r\n", b"SEND OK\r\n");
    wire.expect(b"AT+CIPCLOSE=0\r\n", b"0,CLOSED\r\nOK\r\n");

    let (_esp, runner) = server_with(&wire, FILES, Box::new(NoApp), &[]);
    wire.inject(b"0,CONNECT\r\n");
    wire.inject(b"+IPD,0,22:DELETE /x HTTP/1.0\r\n\r\n");

    drive(runner, async {
        wait_until(|| wire.script_done()).await;
    });

    let sent = wire.sent();
    let text = String::from_utf8_lossy(&sent);
    assert!(text.contains("405 Method Not Allowed"));
    assert!(text.contains("Allow: GET"));
}

#[cfg(feature = "http-post")]
#[derive(Clone, Default)]
struct PostRecorder {
    log: Arc<Mutex<Vec<String>>>,
    body: Arc<Mutex<Vec<u8>>>,
}

#[cfg(feature = "http-post")]
impl HttpApp for PostRecorder {
    fn post_start(&mut self, uri: &str, content_length: usize) {
        self.log
            .lock()
            .unwrap()
            .push(format!("start {} {}", uri, content_length));
    }

    fn post_data(&mut self, data: &Pbuf) {
        let mut chunk = vec![0u8; data.len()];
        data.copy(&mut chunk, 0);
        self.body.lock().unwrap().extend_from_slice(&chunk);
        self.log.lock().unwrap().push(format!("data {}", data.len()));
    }

    fn post_end(&mut self) {
        self.log.lock().unwrap().push("end".into());
    }
}

/// POST body split across frames: one start, chunks that concatenate to
/// the stream, exactly one end.
#[cfg(feature = "http-post")]
#[test]
fn post_streams_the_body_to_the_app() {
    static FILES: &[(&str, &[u8])] = &[("/404.html", b"nope")];

    let wire = Wire::new();
    wire.expect(b"AT+CIPSEND=0,4\r\n", b"> ");
    wire.expect(b"nope", b"SEND OK\r\n");
    wire.expect(b"AT+CIPCLOSE=0\r\n", b"0,CLOSED\r\nOK\r\n");

    let app = PostRecorder::default();
    let log = app.log.clone();
    let body = app.body.clone();
    let (_esp, runner) = server_with(&wire, FILES, Box::new(app), &[]);

    wire.inject(b"0,CONNECT\r\n");
    // Headers plus the first three body bytes in one frame.
    wire.inject(b"+IPD,0,47:POST /upload HTTP/1.0\r\nContent-Length: 6\r\n\r\nABC");
    wire.inject(b"+IPD,0,3:DEF");

    drive(runner, async {
        wait_until(|| wire.script_done()).await;
    });

    assert_eq!(body.lock().unwrap().as_slice(), b"ABCDEF");
    let log = log.lock().unwrap().clone();
    assert_eq!(log.first().unwrap(), "start /upload 6");
    assert_eq!(log.iter().filter(|l| *l == "end").count(), 1);
    // end comes after every data chunk
    assert_eq!(log.last().unwrap(), "end");
}

/// The connection dying mid-POST still runs the epilogue exactly once.
#[cfg(feature = "http-post")]
#[test]
fn early_close_still_ends_the_post() {
    static FILES: &[(&str, &[u8])] = &[];

    let wire = Wire::new();
    let app = PostRecorder::default();
    let log = app.log.clone();
    let (_esp, runner) = server_with(&wire, FILES, Box::new(app), &[]);

    wire.inject(b"0,CONNECT\r\n");
    wire.inject(b"+IPD,0,47:POST /upload HTTP/1.0\r\nContent-Length: 9\r\n\r\nABC");
    wire.inject(b"0,CLOSED\r\n");

    drive(runner, async {
        wait_until(|| log.lock().unwrap().iter().any(|l| l == "end")).await;
    });

    let log = log.lock().unwrap().clone();
    assert_eq!(log.iter().filter(|l| *l == "end").count(), 1);
}

struct TagApp;

impl HttpApp for TagApp {
    fn ssi_tag(&mut self, name: &str, out: &mut Vec<u8>) {
        assert_eq!(name, "NAME");
        out.extend_from_slice(b"REPLACED");
    }
}

#[test]
fn ssi_tag_is_replaced_in_the_response() {
    static FILES: &[(&str, &[u8])] = &[("/index.shtml", b"a<!--#NAME-->b")];

    let wire = Wire::new();
    wire.expect(b"AT+CIPSEND=0,10\r\n", b"> ");
    wire.expect(b"aREPLACEDb", b"SEND OK\r\n");
    wire.expect(b"AT+CIPCLOSE=0\r\n", b"0,CLOSED\r\nOK\r\n");

    let (_esp, runner) = server_with(&wire, FILES, Box::new(TagApp), &[]);
    wire.inject(b"0,CONNECT\r\n");
    wire.inject(b"+IPD,0,18:GET / HTTP/1.0\r\n\r\n");

    drive(runner, async {
        wait_until(|| wire.script_done()).await;
    });
}

fn led_cgi(params: &[QueryParam<'_>]) -> &'static str {
    assert_eq!(params.len(), 1);
    assert_eq!(params[0].name, "on");
    assert_eq!(params[0].value, "1");
    "/led.html"
}

#[test]
fn cgi_rewrites_the_uri_before_opening() {
    static FILES: &[(&str, &[u8])] = &[("/led.html", b"led-page")];
    static CGI: &[CgiEntry] = &[CgiEntry {
        uri: "/led.cgi",
        handler: led_cgi,
    }];

    let wire = Wire::new();
    wire.expect(b"AT+CIPSEND=0,8\r\n", b"> ");
    wire.expect(b"led-page", b"SEND OK\r\n");
    wire.expect(b"AT+CIPCLOSE=0\r\n", b"0,CLOSED\r\nOK\r\n");

    let (_esp, runner) = server_with(&wire, FILES, Box::new(NoApp), CGI);
    wire.inject(b"0,CONNECT\r\n");
    wire.inject(b"+IPD,0,30:GET /led.cgi?on=1 HTTP/1.0\r\n\r\n");

    drive(runner, async {
        wait_until(|| wire.script_done()).await;
    });
}
