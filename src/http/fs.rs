//! File provider contract for the HTTP server, plus the built-in
//! read-only table provider.

/// An open file as the server tracks it. `token` is whatever the provider
/// needs to find its own bookkeeping again.
#[derive(Debug)]
pub struct HttpFile {
    pub size: usize,
    pub remaining: usize,
    /// Reads return borrowed read-only memory; the server never copies or
    /// frees the data.
    pub is_static: bool,
    pub(crate) token: usize,
}

/// One read's worth of file data.
#[derive(Debug)]
pub enum FileChunk {
    /// Borrowed from read-only storage.
    Static(&'static [u8]),
    /// This many bytes were copied into the caller's buffer.
    Copied(usize),
}

/// Backing storage for the HTTP server.
///
/// For non-static providers `buf` is at least `want` bytes and receives
/// the data; static providers ignore it and hand back a borrowed slice.
pub trait FsProvider: Send {
    fn open(&mut self, path: &str) -> Option<HttpFile>;
    fn read(&mut self, file: &mut HttpFile, want: usize, buf: &mut [u8]) -> FileChunk;
    fn close(&mut self, file: HttpFile);
}

/// In-flash file table: `(path, content)` pairs, the shape a
/// makefsdata-style generator produces. Everything it serves is static.
pub struct StaticFs {
    files: &'static [(&'static str, &'static [u8])],
}

impl StaticFs {
    pub const fn new(files: &'static [(&'static str, &'static [u8])]) -> Self {
        Self { files }
    }
}

impl FsProvider for StaticFs {
    fn open(&mut self, path: &str) -> Option<HttpFile> {
        let (token, (_, body)) = self
            .files
            .iter()
            .enumerate()
            .find(|(_, (name, _))| *name == path)?;
        Some(HttpFile {
            size: body.len(),
            remaining: body.len(),
            is_static: true,
            token,
        })
    }

    fn read(&mut self, file: &mut HttpFile, want: usize, _buf: &mut [u8]) -> FileChunk {
        let body = self.files[file.token].1;
        let offset = file.size - file.remaining;
        let n = want.min(file.remaining);
        file.remaining -= n;
        FileChunk::Static(&body[offset..offset + n])
    }

    fn close(&mut self, _file: HttpFile) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    static FILES: &[(&str, &[u8])] = &[
        ("/index.html", b"<html/>"),
        ("/404.html", b"nope"),
    ];

    #[test]
    fn open_read_close_roundtrip() {
        let mut fs = StaticFs::new(FILES);
        assert!(fs.open("/missing").is_none());

        let mut file = fs.open("/index.html").unwrap();
        assert!(file.is_static);
        assert_eq!(file.size, 7);

        let FileChunk::Static(chunk) = fs.read(&mut file, 4, &mut []) else {
            panic!("static provider must borrow");
        };
        assert_eq!(chunk, b"<htm");
        let FileChunk::Static(rest) = fs.read(&mut file, 64, &mut []) else {
            panic!("static provider must borrow");
        };
        assert_eq!(rest, b"l/>");
        assert_eq!(file.remaining, 0);
        fs.close(file);
    }
}
