//! Scripted in-memory serial link for driving the full pipeline.
//!
//! Tests register `(expect, reply)` pairs: once the driver's accumulated
//! output contains `expect`, `reply` is queued on the read side. Everything
//! runs single-threaded under `block_on`.

use std::collections::VecDeque;
use std::future::poll_fn;
use std::sync::{Arc, Mutex};
use std::task::{Poll, Waker};

use embassy_futures::select::{select, Either};
use embedded_io_async::{Read, Write};

#[derive(Default)]
struct Inner {
    /// Bytes on their way to the driver.
    rx: VecDeque<u8>,
    /// Everything the driver wrote, in order.
    tx: Vec<u8>,
    /// How far `tx` has been consumed by script matching.
    matched: usize,
    script: VecDeque<(Vec<u8>, Vec<u8>)>,
    waker: Option<Waker>,
}

impl Inner {
    fn run_script(&mut self) {
        loop {
            let Some((expect, _)) = self.script.front() else {
                return;
            };
            let window = &self.tx[self.matched..];
            let Some(pos) = window
                .windows(expect.len())
                .position(|w| w == expect.as_slice())
            else {
                return;
            };
            self.matched += pos + expect.len();
            let (_, reply) = self.script.pop_front().expect("checked");
            self.rx.extend(reply);
            if let Some(waker) = self.waker.take() {
                waker.wake();
            }
        }
    }
}

#[derive(Clone, Default)]
pub struct Wire(Arc<Mutex<Inner>>);

impl Wire {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `reply` for when the driver has written `expect`.
    pub fn expect(&self, expect: &[u8], reply: &[u8]) {
        self.0
            .lock()
            .unwrap()
            .script
            .push_back((expect.to_vec(), reply.to_vec()));
    }

    /// Unsolicited bytes from the modem.
    pub fn inject(&self, bytes: &[u8]) {
        let mut inner = self.0.lock().unwrap();
        inner.rx.extend(bytes);
        if let Some(waker) = inner.waker.take() {
            waker.wake();
        }
    }

    /// Everything the driver wrote so far.
    pub fn sent(&self) -> Vec<u8> {
        self.0.lock().unwrap().tx.clone()
    }

    pub fn script_done(&self) -> bool {
        self.0.lock().unwrap().script.is_empty()
    }

    pub fn split(&self) -> (WireRx, WireTx) {
        (WireRx(self.clone()), WireTx(self.clone()))
    }
}

pub struct WireRx(Wire);
pub struct WireTx(Wire);

impl embedded_io::ErrorType for WireRx {
    type Error = core::convert::Infallible;
}

impl embedded_io::ErrorType for WireTx {
    type Error = core::convert::Infallible;
}

impl Read for WireRx {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        poll_fn(|cx| {
            let mut inner = self.0 .0.lock().unwrap();
            if inner.rx.is_empty() {
                inner.waker = Some(cx.waker().clone());
                return Poll::Pending;
            }
            let mut n = 0;
            while n < buf.len() {
                match inner.rx.pop_front() {
                    Some(b) => {
                        buf[n] = b;
                        n += 1;
                    }
                    None => break,
                }
            }
            Poll::Ready(Ok(n))
        })
        .await
    }
}

impl Write for WireTx {
    async fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        let mut inner = self.0 .0.lock().unwrap();
        inner.tx.extend_from_slice(buf);
        inner.run_script();
        Ok(buf.len())
    }

    async fn flush(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

/// Runs `test` against the runner until the test future finishes. A
/// five-second ceiling turns a wedged pipeline into a failure instead of a
/// hang.
pub fn drive<R, T>(runner: R, test: T) -> T::Output
where
    R: core::future::Future,
    T: core::future::Future,
{
    embassy_futures::block_on(async {
        let guarded = embassy_time::with_timeout(embassy_time::Duration::from_secs(5), test);
        match select(guarded, runner).await {
            Either::First(Ok(out)) => out,
            Either::First(Err(_)) => panic!("test timed out against the pipeline"),
            Either::Second(_) => unreachable!("runner never returns"),
        }
    })
}

/// Spin until `cond` holds, letting the pipeline make progress in between.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..1_000_000 {
        if cond() {
            return;
        }
        embassy_futures::yield_now().await;
    }
    panic!("condition never became true");
}
