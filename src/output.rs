//! Per-host output sink.
//!
//! Remote sessions interleave stdout and stderr arbitrarily; the sink frames
//! on newlines so two hosts can never tear each other's lines on the user's
//! terminal. The attached log file, when present, receives the exact bytes
//! for faithful replay.

use std::fs::File;
use std::io::{self, Write};
use std::sync::Mutex;

/// Line-buffered tee bound to one hostname prefix.
///
/// Writes go verbatim to the log file (if attached) and, line by line with a
/// `<host>:\t` prefix, to the terminal writer. Concurrent writers (the remote
/// stdout and stderr streams) are serialized internally.
pub struct Output {
    prefix: String,
    inner: Mutex<Inner>,
}

struct Inner {
    buf: Vec<u8>,
    terminal: Box<dyn Write + Send>,
    file: Option<File>,
}

impl Output {
    /// Creates a sink with the given prefix, without an underlying file,
    /// printing to stdout.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            inner: Mutex::new(Inner {
                buf: Vec::new(),
                terminal: Box::new(io::stdout()),
                file: None,
            }),
        }
    }

    /// Attaches `f` as the underlying log file.
    pub fn set_file(&self, f: File) {
        self.inner.lock().unwrap().file = Some(f);
    }

    /// Redirects prefixed lines to `w` instead of stdout.
    pub fn set_terminal(&self, w: Box<dyn Write + Send>) {
        self.inner.lock().unwrap().terminal = w;
    }

    /// Writes to the underlying file (if any) while buffering `p` until a
    /// newline arrives, then emits whole prefixed lines to the terminal.
    /// Returns the result of the file write.
    pub fn write(&self, p: &[u8]) -> io::Result<usize> {
        let mut inner = self.inner.lock().unwrap();

        let mut n = 0;
        let mut res = Ok(());
        if let Some(f) = inner.file.as_mut() {
            match f.write(p) {
                Ok(written) => n = written,
                Err(e) => res = Err(e),
            }
        }
        inner.buffer_out(&self.prefix, p);
        res.map(|_| n)
    }

    /// Emits any trailing partial line as if a newline had arrived.
    pub fn flush(&self) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.buf.is_empty() {
            inner.buffer_out(&self.prefix, b"\n");
        }
    }

    /// Closes the underlying file (if any). Idempotent.
    pub fn close(&self) {
        self.inner.lock().unwrap().file.take();
    }
}

impl Inner {
    fn buffer_out(&mut self, prefix: &str, mut p: &[u8]) {
        while let Some(i) = p.iter().position(|&b| b == b'\n') {
            self.buf.extend_from_slice(&p[..=i]);
            let _ = write!(self.terminal, "{}:\t", prefix);
            let _ = self.terminal.write_all(&self.buf);
            self.buf.clear();
            p = &p[i + 1..];
        }
        self.buf.extend_from_slice(p);
    }
}
