// Copyright 2022 jmjoy
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The response encoder.
//!
//! A two-state machine: headers are emitted in `Head`, the transition
//! to `Body` writes the blank line and drains the buffer, and from
//! then on only body writes are legal.  Body bytes may be gzipped on
//! the fly (CGI only: FastCGI imposes its own record framing that the
//! encoder must respect) and, over FastCGI, are split into `STDOUT`
//! records.

use crate::{
    Error, Result,
    ipc::Stream,
    record::{self, RecordType},
};
use flate2::{Compression, write::GzEncoder};
use std::io::{self, Write};

/// Default response buffer for CGI output.
pub(crate) const CGI_BUFSZ: usize = 8 * 1024;
/// Default response buffer for FastCGI output.
pub(crate) const FCGI_BUFSZ: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Head,
    Body,
}

/// Whatever ultimately receives encoded bytes.  A boxed writer so the
/// test suite can substitute a memory sink for a socket sink.
pub(crate) type Sink = Box<dyn Write>;

enum Wire {
    /// CGI: straight to the sink.
    Plain(Sink),
    /// CGI with compression enabled; headers bypass the encoder.
    Gzip(GzEncoder<Sink>),
    /// FastCGI: body bytes are framed into STDOUT records.
    Fcgi(Sink),
    /// Torn down.
    Done,
}

fn map_io(e: io::Error) -> Error {
    if e.kind() == io::ErrorKind::BrokenPipe {
        Error::Hup
    } else {
        Error::System(e)
    }
}

/// Response-scoped output state, shared between the request and any
/// writers handed out to emission front-ends.
pub(crate) struct OutputData {
    state: State,
    wire: Wire,
    buf: Vec<u8>,
    cap: usize,
    request_id: u16,
    /// FastCGI completion channel: the request id is acknowledged to
    /// control after the end-request records go out.
    control: Option<Stream>,
    pub(crate) disabled: bool,
}

impl OutputData {
    pub(crate) fn cgi(sink: Sink, cap: usize) -> Self {
        Self {
            state: State::Head,
            wire: Wire::Plain(sink),
            buf: Vec::with_capacity(cap),
            cap,
            request_id: 0,
            control: None,
            disabled: false,
        }
    }

    pub(crate) fn fcgi(sink: Sink, request_id: u16, cap: usize, control: Stream) -> Self {
        Self {
            state: State::Head,
            wire: Wire::Fcgi(sink),
            buf: Vec::with_capacity(cap),
            cap,
            request_id,
            control: Some(control),
            disabled: false,
        }
    }

    /// Push bytes past the buffer onto the wire.  Compression applies
    /// only to body parts; headers are never compressed.
    fn flush_wire(&mut self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        match &mut self.wire {
            Wire::Plain(w) => w.write_all(data).map_err(map_io),
            Wire::Gzip(gz) => {
                if self.state == State::Head {
                    gz.get_mut().write_all(data).map_err(map_io)
                } else {
                    gz.write_all(data).map_err(map_io)
                }
            }
            Wire::Fcgi(sock) => {
                record::write_stream(sock, RecordType::Stdout, self.request_id, data)
                    .map_err(map_io)
            }
            Wire::Done => Ok(()),
        }
    }

    /// Drain the response buffer to the wire.
    fn drain(&mut self) -> Result<()> {
        let data = std::mem::take(&mut self.buf);
        let res = self.flush_wire(&data);
        self.buf = data;
        self.buf.clear();
        res
    }

    /// Buffered write.  A write exceeding free space drains the buffer
    /// first; one larger than the whole buffer bypasses it entirely.
    pub(crate) fn write(&mut self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        if self.cap == 0 {
            return self.flush_wire(data);
        }
        if self.buf.len() + data.len() > self.cap {
            self.drain()?;
            if data.len() > self.cap {
                return self.flush_wire(data);
            }
        }
        self.buf.extend_from_slice(data);
        Ok(())
    }

    /// Emit one `Key: value` header line.  Only legal in head state.
    pub(crate) fn head(&mut self, key: &str, value: &str) -> Result<()> {
        if self.state != State::Head {
            return Err(Error::WriterMisuse);
        }
        self.write(key.as_bytes())?;
        self.write(b": ")?;
        self.write(value.as_bytes())?;
        self.write(b"\r\n")
    }

    /// A body write; only legal after [`OutputData::begin_body`].
    pub(crate) fn body_write(&mut self, data: &[u8]) -> Result<()> {
        if self.state != State::Body {
            return Err(Error::WriterMisuse);
        }
        self.write(data)
    }

    /// Try to enable gzip on the output.  Returns whether compression
    /// is actually on: FastCGI refuses, because the record framing
    /// must be applied after any compression the encoder cannot yet
    /// reorder.
    pub(crate) fn enable_compression(&mut self) -> Result<bool> {
        if self.state != State::Head {
            return Err(Error::WriterMisuse);
        }
        match std::mem::replace(&mut self.wire, Wire::Done) {
            Wire::Plain(w) => {
                self.wire = Wire::Gzip(GzEncoder::new(w, Compression::default()));
                Ok(true)
            }
            other => {
                self.wire = other;
                Ok(false)
            }
        }
    }

    /// End the headers: emit the blank line, drain, switch to body.
    /// Draining early costs a little chatter but gets the header
    /// block to the server as soon as it is complete.
    pub(crate) fn begin_body(&mut self) -> Result<()> {
        if self.state != State::Head {
            return Err(Error::WriterMisuse);
        }
        self.write(b"\r\n")?;
        self.drain()?;
        self.state = State::Body;
        Ok(())
    }

    /// Tear the response down.
    ///
    /// With `flush` the buffer is drained, the gzip stream finished
    /// and, over FastCGI, the closing zero-length `STDOUT` plus
    /// `END_REQUEST` records are emitted and the request id is
    /// acknowledged to control.  Without it nothing further reaches
    /// the wire: the post-fork application copy frees this way.
    pub(crate) fn free(&mut self, flush: bool) -> Result<()> {
        if !flush {
            self.buf.clear();
            match std::mem::replace(&mut self.wire, Wire::Done) {
                Wire::Gzip(gz) => {
                    // Dropping the encoder would flush a gzip trailer
                    // onto a response we promised not to touch.
                    std::mem::forget(gz);
                }
                other => drop(other),
            }
            return Ok(());
        }

        self.drain()?;
        match std::mem::replace(&mut self.wire, Wire::Done) {
            Wire::Plain(mut w) => w.flush().map_err(map_io)?,
            Wire::Gzip(gz) => {
                let mut w = gz.finish().map_err(map_io)?;
                w.flush().map_err(map_io)?;
            }
            Wire::Fcgi(mut sock) => {
                // The final data record is out; the standard still
                // wants a blank record to shut the stream down.
                record::write_stream(&mut sock, RecordType::Stdout, self.request_id, b"")
                    .map_err(map_io)?;
                record::write_end_request(&mut sock, self.request_id, 0).map_err(map_io)?;
                sock.flush().map_err(map_io)?;
                drop(sock);
                if let Some(control) = &mut self.control {
                    control.write_u16(self.request_id)?;
                }
            }
            Wire::Done => {}
        }
        Ok(())
    }
}

/// An opaque handle onto the response body for emission front-ends.
///
/// Front-ends (HTML, JSON, XML, template renderers) consume only the
/// writer; they never see the request.  Handles stay usable after
/// further handout is disabled.
pub struct Writer {
    data: std::rc::Rc<std::cell::RefCell<OutputData>>,
}

impl Writer {
    pub(crate) fn new(data: std::rc::Rc<std::cell::RefCell<OutputData>>) -> Self {
        Self { data }
    }

    /// Append raw bytes to the response body.
    pub fn write(&self, buf: &[u8]) -> Result<()> {
        self.data.borrow_mut().body_write(buf)
    }

    /// Append a string to the response body.
    pub fn puts(&self, s: &str) -> Result<()> {
        self.write(s.as_bytes())
    }

    /// Append a single byte to the response body.
    pub fn putc(&self, c: u8) -> Result<()> {
        self.write(&[c])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{HEADER_LEN, Header};
    use flate2::read::GzDecoder;
    use std::{cell::RefCell, io::Read, rc::Rc};

    /// Memory sink standing in for the socket sink.
    #[derive(Clone, Default)]
    struct Mem(Rc<RefCell<Vec<u8>>>);

    impl Write for Mem {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Mem {
        fn take(&self) -> Vec<u8> {
            std::mem::take(&mut self.0.borrow_mut())
        }
    }

    #[test]
    fn head_then_body() {
        let mem = Mem::default();
        let mut out = OutputData::cgi(Box::new(mem.clone()), CGI_BUFSZ);
        out.head("Status", "200 OK").unwrap();
        out.head("Content-Type", "text/plain").unwrap();
        out.begin_body().unwrap();
        out.body_write(b"hi").unwrap();
        out.free(true).unwrap();
        assert_eq!(
            mem.take(),
            b"Status: 200 OK\r\nContent-Type: text/plain\r\n\r\nhi"
        );
    }

    #[test]
    fn head_after_body_is_misuse() {
        let mem = Mem::default();
        let mut out = OutputData::cgi(Box::new(mem), CGI_BUFSZ);
        out.begin_body().unwrap();
        assert!(matches!(
            out.head("Status", "200 OK"),
            Err(Error::WriterMisuse)
        ));
    }

    #[test]
    fn body_write_before_body_is_misuse() {
        let mem = Mem::default();
        let mut out = OutputData::cgi(Box::new(mem), CGI_BUFSZ);
        assert!(matches!(out.body_write(b"x"), Err(Error::WriterMisuse)));
    }

    #[test]
    fn big_write_bypasses_buffer() {
        let mem = Mem::default();
        let mut out = OutputData::cgi(Box::new(mem.clone()), 8);
        out.begin_body().unwrap();
        out.body_write(b"0123").unwrap();
        assert!(mem.0.borrow().ends_with(b"\r\n"));
        out.body_write(&[b'x'; 32]).unwrap();
        assert!(mem.0.borrow().ends_with(&[b'x'; 32]));
        out.free(true).unwrap();
    }

    #[test]
    fn free_without_flush_discards_buffer() {
        let mem = Mem::default();
        let mut out = OutputData::cgi(Box::new(mem.clone()), CGI_BUFSZ);
        out.head("Status", "200 OK").unwrap();
        out.free(false).unwrap();
        assert!(mem.take().is_empty());
    }

    #[test]
    fn gzip_round_trips() {
        let mem = Mem::default();
        let mut out = OutputData::cgi(Box::new(mem.clone()), CGI_BUFSZ);
        assert!(out.enable_compression().unwrap());
        out.head("Content-Encoding", "gzip").unwrap();
        out.begin_body().unwrap();

        // A megabyte of cheap pseudo-random bytes.
        let mut state = 0x2545f491u64;
        let body: Vec<u8> = (0..1 << 20)
            .map(|_| {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
                (state >> 33) as u8
            })
            .collect();
        out.body_write(&body).unwrap();
        out.free(true).unwrap();

        let raw = mem.take();
        let headers_end = raw.windows(4).position(|w| w == b"\r\n\r\n").unwrap() + 4;
        assert!(raw[..headers_end].starts_with(b"Content-Encoding: gzip\r\n"));

        let mut plain = Vec::new();
        GzDecoder::new(&raw[headers_end..])
            .read_to_end(&mut plain)
            .unwrap();
        assert_eq!(plain, body);
    }

    #[test]
    fn fcgi_frames_and_ends() {
        let mem = Mem::default();
        let (a, _b) = crate::ipc::stream_pair().unwrap();
        let control = Stream::new(a).unwrap();
        let mut out = OutputData::fcgi(Box::new(mem.clone()), 9, FCGI_BUFSZ, control);

        assert!(!out.enable_compression().unwrap());
        out.head("Status", "200 OK").unwrap();
        out.begin_body().unwrap();
        out.body_write(&vec![b'y'; 100_000]).unwrap();
        out.free(true).unwrap();

        // Walk the record stream: STDOUT records carrying the payload,
        // one zero-length STDOUT, then END_REQUEST.
        let raw = mem.take();
        let mut pos = 0;
        let mut payload = Vec::new();
        let mut saw_close = false;
        let mut saw_end = false;
        while pos < raw.len() {
            let hdr = Header::parse(raw[pos..pos + HEADER_LEN].try_into().unwrap()).unwrap();
            pos += HEADER_LEN;
            assert_eq!(hdr.request_id, 9);
            let content = &raw[pos..pos + hdr.content_length as usize];
            pos += hdr.content_length as usize + hdr.padding_length as usize;
            match hdr.rtype {
                RecordType::Stdout if hdr.content_length == 0 => saw_close = true,
                RecordType::Stdout => payload.extend_from_slice(content),
                RecordType::EndRequest => saw_end = true,
                other => panic!("unexpected record {other:?}"),
            }
        }
        assert!(saw_close && saw_end);
        let text = String::from_utf8(payload).unwrap();
        assert!(text.starts_with("Status: 200 OK\r\n\r\n"));
        assert_eq!(text.len(), "Status: 200 OK\r\n\r\n".len() + 100_000);
    }
}
