//! Server-Side-Include tag substitution.
//!
//! A byte-at-a-time machine over the response stream. Output bytes land in
//! the caller's pending buffer; tag names are resolved through a callback
//! that appends the replacement. Anything that turns out not to be a
//! well-formed tag is emitted verbatim, including the marker bytes already
//! consumed.

use alloc::vec::Vec;

use crate::config::{HTTP_SSI_TAG_END, HTTP_SSI_TAG_MAX_LEN, HTTP_SSI_TAG_START};

/// Raw bytes held back while a candidate tag is in progress: both markers
/// plus the longest tag name.
const PENDING_MAX: usize = HTTP_SSI_TAG_MAX_LEN + 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SsiState {
    /// Plain bytes flow straight to the output.
    WaitBegin,
    /// Matching the rest of the start marker.
    Begin,
    /// Accumulating the tag name.
    Tag,
    /// Matching the rest of the end marker.
    End,
}

pub(crate) struct SsiEngine {
    state: SsiState,
    /// Marker/name bytes consumed since the candidate tag opened, kept for
    /// verbatim flushing on mismatch.
    held: heapless::Vec<u8, PENDING_MAX>,
    /// Bytes of the current marker matched so far.
    matched: usize,
    /// The tag name in progress.
    tag: heapless::Vec<u8, HTTP_SSI_TAG_MAX_LEN>,
}

impl SsiEngine {
    pub fn new() -> Self {
        Self {
            state: SsiState::WaitBegin,
            held: heapless::Vec::new(),
            matched: 0,
            tag: heapless::Vec::new(),
        }
    }

    /// Runs `input` through the machine. Non-tag bytes and flushed
    /// mismatches are appended to `out`; complete tags invoke `resolve`,
    /// which appends the replacement bytes.
    pub fn process(
        &mut self,
        input: &[u8],
        out: &mut Vec<u8>,
        resolve: &mut dyn FnMut(&str, &mut Vec<u8>),
    ) {
        for &b in input {
            self.step(b, out, resolve);
        }
    }

    /// End of the response file: a tag still in progress was malformed,
    /// emit it as it appeared.
    pub fn finish(&mut self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.held);
        self.reset();
    }

    fn step(&mut self, b: u8, out: &mut Vec<u8>, resolve: &mut dyn FnMut(&str, &mut Vec<u8>)) {
        match self.state {
            SsiState::WaitBegin => {
                if b == HTTP_SSI_TAG_START[0] {
                    self.hold(b);
                    self.matched = 1;
                    self.state = if HTTP_SSI_TAG_START.len() == 1 {
                        SsiState::Tag
                    } else {
                        SsiState::Begin
                    };
                } else {
                    out.push(b);
                }
            }
            SsiState::Begin => {
                if b == HTTP_SSI_TAG_START[self.matched] {
                    self.hold(b);
                    self.matched += 1;
                    if self.matched == HTTP_SSI_TAG_START.len() {
                        self.state = SsiState::Tag;
                        self.tag.clear();
                    }
                } else {
                    self.abort(b, out, resolve);
                }
            }
            SsiState::Tag => {
                if b == HTTP_SSI_TAG_END[0] {
                    self.hold(b);
                    self.matched = 1;
                    if HTTP_SSI_TAG_END.len() == 1 {
                        self.complete(out, resolve);
                    } else {
                        self.state = SsiState::End;
                    }
                } else if self.tag.push(b).is_err() {
                    // Name longer than the tag buffer: not a tag after all.
                    self.abort(b, out, resolve);
                } else {
                    self.hold(b);
                }
            }
            SsiState::End => {
                if b == HTTP_SSI_TAG_END[self.matched] {
                    self.hold(b);
                    self.matched += 1;
                    if self.matched == HTTP_SSI_TAG_END.len() {
                        self.complete(out, resolve);
                    }
                } else {
                    self.abort(b, out, resolve);
                }
            }
        }
    }

    fn hold(&mut self, b: u8) {
        // PENDING_MAX covers both markers plus the name, so this cannot
        // overflow while the states above enforce their limits.
        let _ = self.held.push(b);
    }

    /// Mismatch: everything held was ordinary content. Flush it and rerun
    /// the current byte from scratch.
    fn abort(&mut self, b: u8, out: &mut Vec<u8>, resolve: &mut dyn FnMut(&str, &mut Vec<u8>)) {
        out.extend_from_slice(&self.held);
        self.reset();
        self.step(b, out, resolve);
    }

    fn complete(&mut self, out: &mut Vec<u8>, resolve: &mut dyn FnMut(&str, &mut Vec<u8>)) {
        if let Ok(name) = core::str::from_utf8(&self.tag) {
            resolve(name, out);
        }
        self.reset();
    }

    fn reset(&mut self) {
        self.state = SsiState::WaitBegin;
        self.held.clear();
        self.matched = 0;
        self.tag.clear();
    }
}
