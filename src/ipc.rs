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

//! Framing primitives for the private parent/child IPC protocol.
//!
//! All messages between the worker, control and responder processes
//! travel over non-blocking `SOCK_STREAM` unix socket pairs.  Three
//! primitives exist: fixed-size records, length-prefixed words, and
//! descriptor passing via `SCM_RIGHTS`.  Wire integers are host endian;
//! the processes share an address family and architecture.

use crate::{Error, Result};
use nix::{
    fcntl::{FcntlArg, OFlag, fcntl},
    poll::{PollFd, PollFlags, PollTimeout, poll},
    sys::socket::{
        AddressFamily, ControlMessage, ControlMessageOwned, MsgFlags, SockFlag, SockType, recvmsg,
        sendmsg, socketpair,
    },
    unistd,
};
use std::{
    io::{self, IoSlice, IoSliceMut, Write},
    os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd},
};
use tracing::warn;

/// Upper bound on a transmitted word length.  A sibling process never
/// legitimately sends more than a request body, and a corrupt length
/// must not drive an allocation.
const MAX_WORD: usize = 1 << 30;

/// Create a unix stream socket pair for parent/child communication.
pub(crate) fn stream_pair() -> Result<(OwnedFd, OwnedFd)> {
    let (a, b) = socketpair(
        AddressFamily::Unix,
        SockType::Stream,
        None,
        SockFlag::empty(),
    )?;
    Ok((a, b))
}

/// Put a descriptor into non-blocking mode, preserving other flags.
pub(crate) fn prepare(fd: BorrowedFd<'_>) -> Result<()> {
    let flags = fcntl(fd, FcntlArg::F_GETFL)?;
    let flags = OFlag::from_bits_retain(flags) | OFlag::O_NONBLOCK;
    fcntl(fd, FcntlArg::F_SETFL(flags))?;
    Ok(())
}

/// A non-blocking descriptor driven by `poll(2)`.
///
/// Reads and writes block in `poll` with an indefinite timeout; spurious
/// timeout returns retry.  `POLLHUP`/`POLLERR` surface as [`Error::Hup`]
/// where the caller can recover.
pub(crate) struct Stream {
    fd: OwnedFd,
}

impl Stream {
    /// Wrap a descriptor, switching it to non-blocking mode.
    pub(crate) fn new(fd: OwnedFd) -> Result<Self> {
        prepare(fd.as_fd())?;
        Ok(Self { fd })
    }

    pub(crate) fn raw(&self) -> i32 {
        self.fd.as_raw_fd()
    }

    /// Block until the descriptor is ready for `events`.
    fn wait(&self, events: PollFlags) -> Result<PollFlags> {
        loop {
            let mut fds = [PollFd::new(self.fd.as_fd(), events)];
            match poll(&mut fds, PollTimeout::NONE) {
                Ok(0) => {
                    warn!("poll: spurious timeout");
                    continue;
                }
                Ok(_) => return Ok(fds[0].revents().unwrap_or(PollFlags::empty())),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Read exactly `buf.len()` bytes.
    ///
    /// Returns `false` on EOF before the first byte, which is permitted
    /// only when `eof_ok` is set.  A short read after any byte, or an
    /// unexpected EOF, is a structural error.
    pub(crate) fn read_full(&mut self, buf: &mut [u8], eof_ok: bool) -> Result<bool> {
        let mut off = 0;
        while off < buf.len() {
            self.wait(PollFlags::POLLIN)?;
            match unistd::read(self.fd.as_fd(), &mut buf[off..]) {
                Ok(0) if off == 0 && eof_ok => return Ok(false),
                Ok(0) => {
                    warn!("ipc: unexpected eof");
                    return Err(Error::Malformed("short read on ipc stream"));
                }
                Ok(n) => off += n,
                Err(nix::errno::Errno::EAGAIN) | Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(true)
    }

    /// Write the entire buffer.  `EPIPE` maps to [`Error::Hup`].
    pub(crate) fn write_full(&mut self, buf: &[u8]) -> Result<()> {
        let mut off = 0;
        while off < buf.len() {
            let revents = self.wait(PollFlags::POLLOUT)?;
            if revents.intersects(PollFlags::POLLHUP | PollFlags::POLLERR)
                && !revents.contains(PollFlags::POLLOUT)
            {
                return Err(Error::Hup);
            }
            match unistd::write(self.fd.as_fd(), &buf[off..]) {
                Ok(n) => off += n,
                Err(nix::errno::Errno::EAGAIN) | Err(nix::errno::Errno::EINTR) => continue,
                Err(nix::errno::Errno::EPIPE) => return Err(Error::Hup),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Duplicate the underlying descriptor into a fresh stream.
    pub(crate) fn try_clone(&self) -> Result<Stream> {
        let fd = self.fd.try_clone().map_err(Error::System)?;
        Stream::new(fd)
    }

    /// One read of whatever is available; zero means EOF.
    pub(crate) fn read_some(&mut self, buf: &mut [u8]) -> Result<usize> {
        loop {
            self.wait(PollFlags::POLLIN)?;
            match unistd::read(self.fd.as_fd(), buf) {
                Ok(n) => return Ok(n),
                Err(nix::errno::Errno::EAGAIN) | Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Read up to `len` bytes, stopping early when the sender stops
    /// giving data.  Used for request bodies, whose reported length
    /// the peer is not obliged to honor.
    pub(crate) fn read_at_most(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        let mut sz = 0;
        while sz < len {
            let revents = self.wait(PollFlags::POLLIN)?;
            if !revents.contains(PollFlags::POLLIN) {
                break;
            }
            match unistd::read(self.fd.as_fd(), &mut buf[sz..]) {
                Ok(0) => break,
                Ok(n) => sz += n,
                Err(nix::errno::Errno::EAGAIN) | Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        buf.truncate(sz);
        Ok(buf)
    }

    pub(crate) fn read_usize(&mut self) -> Result<usize> {
        let mut b = [0u8; size_of::<usize>()];
        self.read_full(&mut b, false)?;
        Ok(usize::from_ne_bytes(b))
    }

    pub(crate) fn write_usize(&mut self, v: usize) -> Result<()> {
        self.write_full(&v.to_ne_bytes())
    }

    pub(crate) fn read_u32(&mut self) -> Result<u32> {
        let mut b = [0u8; 4];
        self.read_full(&mut b, false)?;
        Ok(u32::from_ne_bytes(b))
    }

    /// Like [`Stream::read_u32`], but a clean EOF yields `None`.
    pub(crate) fn read_u32_eof(&mut self) -> Result<Option<u32>> {
        let mut b = [0u8; 4];
        if !self.read_full(&mut b, true)? {
            return Ok(None);
        }
        Ok(Some(u32::from_ne_bytes(b)))
    }

    pub(crate) fn write_u32(&mut self, v: u32) -> Result<()> {
        self.write_full(&v.to_ne_bytes())
    }

    pub(crate) fn read_u16(&mut self) -> Result<u16> {
        let mut b = [0u8; 2];
        self.read_full(&mut b, false)?;
        Ok(u16::from_ne_bytes(b))
    }

    pub(crate) fn write_u16(&mut self, v: u16) -> Result<()> {
        self.write_full(&v.to_ne_bytes())
    }

    pub(crate) fn read_i64(&mut self) -> Result<i64> {
        let mut b = [0u8; 8];
        self.read_full(&mut b, false)?;
        Ok(i64::from_ne_bytes(b))
    }

    pub(crate) fn write_i64(&mut self, v: i64) -> Result<()> {
        self.write_full(&v.to_ne_bytes())
    }

    pub(crate) fn read_f64(&mut self) -> Result<f64> {
        let mut b = [0u8; 8];
        self.read_full(&mut b, false)?;
        Ok(f64::from_ne_bytes(b))
    }

    pub(crate) fn write_f64(&mut self, v: f64) -> Result<()> {
        self.write_full(&v.to_ne_bytes())
    }

    /// Read a word: a length followed by that many raw bytes.
    pub(crate) fn read_word_bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.read_usize()?;
        if len > MAX_WORD {
            return Err(Error::OutOfMemory);
        }
        let mut buf = vec![0u8; len];
        if len > 0 {
            self.read_full(&mut buf, false)?;
        }
        Ok(buf)
    }

    /// Read a word and require it to be UTF-8.
    pub(crate) fn read_word(&mut self) -> Result<String> {
        String::from_utf8(self.read_word_bytes()?)
            .map_err(|_| Error::Malformed("ipc word is not UTF-8"))
    }

    /// Write a word.  `None` serializes as length zero, exactly like an
    /// empty string.
    pub(crate) fn write_word(&mut self, word: Option<&str>) -> Result<()> {
        self.write_word_bytes(word.map(str::as_bytes).unwrap_or(b""))
    }

    pub(crate) fn write_word_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.write_usize(bytes.len())?;
        if !bytes.is_empty() {
            self.write_full(bytes)?;
        }
        Ok(())
    }

    /// Send a small payload with exactly one descriptor attached.
    pub(crate) fn send_fd(&mut self, fd: BorrowedFd<'_>, payload: &[u8]) -> Result<()> {
        assert!(!payload.is_empty() && payload.len() <= 256);
        let raw = [fd.as_raw_fd()];
        let cmsg = [ControlMessage::ScmRights(&raw)];
        let iov = [IoSlice::new(payload)];
        loop {
            self.wait(PollFlags::POLLOUT)?;
            match sendmsg::<()>(self.raw(), &iov, &cmsg, MsgFlags::empty(), None) {
                Ok(_) => return Ok(()),
                Err(nix::errno::Errno::EAGAIN) | Err(nix::errno::Errno::EINTR) => continue,
                Err(nix::errno::Errno::EPIPE) => return Err(Error::Hup),
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Receive a payload that may carry one descriptor.
    ///
    /// Returns the payload length and the descriptor, if any.  Length
    /// zero means the peer closed the channel.
    pub(crate) fn recv_fd(&mut self, payload: &mut [u8]) -> Result<(usize, Option<OwnedFd>)> {
        let mut space = nix::cmsg_space!([i32; 1]);
        loop {
            self.wait(PollFlags::POLLIN)?;
            let mut iov = [IoSliceMut::new(payload)];
            let msg = match recvmsg::<()>(
                self.fd.as_raw_fd(),
                &mut iov,
                Some(&mut space),
                MsgFlags::empty(),
            ) {
                Ok(msg) => msg,
                Err(nix::errno::Errno::EAGAIN) | Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            };
            let mut fd = None;
            for cmsg in msg.cmsgs()? {
                if let ControlMessageOwned::ScmRights(fds) = cmsg {
                    for raw in fds {
                        // Exactly one descriptor per message.
                        assert!(fd.is_none() && raw >= 0);
                        fd = Some(unsafe { OwnedFd::from_raw_fd(raw) });
                    }
                }
            }
            return Ok((msg.bytes, fd));
        }
    }

    /// Block until readable, with a bounded poll so a pending SIGTERM
    /// can be observed between rounds.  Returns `false` on hangup.
    pub(crate) fn wait_readable(&self, timeout_ms: u16) -> Result<Option<bool>> {
        let mut fds = [PollFd::new(self.fd.as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::from(timeout_ms)) {
            Ok(0) => Ok(None),
            Ok(_) => {
                let revents = fds[0].revents().unwrap_or(PollFlags::empty());
                if revents.contains(PollFlags::POLLIN) {
                    Ok(Some(true))
                } else if revents.intersects(PollFlags::POLLHUP | PollFlags::POLLERR) {
                    Ok(Some(false))
                } else {
                    Ok(None)
                }
            }
            Err(nix::errno::Errno::EINTR) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

impl AsFd for Stream {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

/// The output encoder and the gzip layer speak `std::io::Write`; map it
/// onto the poll-driven descriptor.
impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.write_full(buf) {
            Ok(()) => Ok(buf.len()),
            Err(Error::Hup) => Err(io::Error::from(io::ErrorKind::BrokenPipe)),
            Err(Error::System(e)) => Err(e),
            Err(e) => Err(io::Error::other(e.to_string())),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
