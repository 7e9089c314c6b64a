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

//! The FastCGI control process.
//!
//! Control sits between the webserver and the sandboxed worker.  It
//! accepts one connection at a time (classic mode: `accept(2)` on the
//! inherited listen socket; extended mode: descriptors passed by a
//! manager), pumps the raw bytes into the worker as length-prefixed
//! frames, and, once the worker confirms the request with the matching
//! cookie, hands the drained peer socket to the responder for output.
//! Requests are strictly serialized: the next connection is not taken
//! until the responder has acknowledged the previous one.

use crate::{Error, Result, ipc::Stream};
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use std::{
    io,
    os::{
        fd::{AsFd, BorrowedFd, OwnedFd},
        unix::net::UnixListener,
    },
};
use tracing::{debug, warn};

/// Read buffer for the webserver connection pump.
const PUMP_BUF: usize = 8192;

/// Poll two descriptors for input, retrying timeouts and EINTR.
fn poll2(a: BorrowedFd<'_>, b: BorrowedFd<'_>) -> Result<(PollFlags, PollFlags)> {
    loop {
        let mut fds = [
            PollFd::new(a, PollFlags::POLLIN),
            PollFd::new(b, PollFlags::POLLIN),
        ];
        match poll(&mut fds, PollTimeout::NONE) {
            Ok(0) => {
                warn!("poll: spurious timeout");
                continue;
            }
            Ok(_) => {
                return Ok((
                    fds[0].revents().unwrap_or(PollFlags::empty()),
                    fds[1].revents().unwrap_or(PollFlags::empty()),
                ));
            }
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

/// Where connections come from.
enum Source {
    /// Classic mode: the webserver's listen socket, inherited on
    /// standard input.
    Accept(UnixListener),
    /// Extended mode: a manager passes accepted sockets, each paired
    /// with an 8-byte token echoed back on completion.
    Filed(Stream),
}

impl Source {
    fn as_fd(&self) -> BorrowedFd<'_> {
        match self {
            Source::Accept(l) => l.as_fd(),
            Source::Filed(s) => s.as_fd(),
        }
    }
}

/// One accepted connection plus its manager token, if any.
enum Conn {
    Ready(OwnedFd, Option<u64>),
    /// Transient accept failure; try again.
    Retry,
    /// The source closed; control should exit.
    Closed,
}

fn next_conn(source: &mut Source) -> Result<Conn> {
    match source {
        Source::Accept(listener) => match listener.accept() {
            Ok((stream, _)) => Ok(Conn::Ready(stream.into(), None)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(Conn::Retry),
            Err(e) if e.raw_os_error() == Some(libc::EMFILE)
                || e.raw_os_error() == Some(libc::ENFILE) =>
            {
                Err(Error::TooManyFiles)
            }
            Err(e) => Err(e.into()),
        },
        Source::Filed(filed) => {
            let mut token = [0u8; 8];
            let (n, fd) = filed.recv_fd(&mut token)?;
            if n == 0 {
                return Ok(Conn::Closed);
            }
            let Some(fd) = fd else {
                warn!("FastCGI: manager message without descriptor");
                return Err(Error::Malformed("descriptor missing from manager"));
            };
            Ok(Conn::Ready(fd, Some(u64::from_ne_bytes(token))))
        }
    }
}

/// Pump raw connection bytes into the worker until the worker reports
/// completion or the peer disconnects.
///
/// Every chunk is framed as `{length; bytes}`.  A zero-length frame
/// tells the worker the connection closed; the trailing zero frame
/// after worker completion is the handshake it expects either way.
fn pump(conn: &mut Stream, work: &mut Stream) -> Result<()> {
    let mut buf = [0u8; PUMP_BUF];
    loop {
        let (conn_ev, work_ev) = poll2(conn.as_fd(), work.as_fd())?;

        // The worker responding means the full request was read and
        // parsed; finish with the empty handshake frame.
        if work_ev.contains(PollFlags::POLLIN) {
            work.write_usize(0)?;
            return Ok(());
        }

        if !conn_ev.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR) {
            continue;
        }

        let n = conn.read_some(&mut buf)?;
        work.write_usize(n)?;
        if n == 0 {
            // The worker sees the zero frame and abandons the request.
            warn!("FastCGI: connection closed while pumping");
            return Ok(());
        }
        work.write_full(&buf[..n])?;
    }
}

/// The control main loop.
///
/// `work` is the worker control channel; `resp` the responder channel
/// used for descriptor passing and completion acknowledgement.
/// Returns cleanly when the webserver socket, the manager, or the
/// responder goes away; protocol violations (a cookie or request-id
/// mismatch above all) are fatal errors.
pub(crate) fn run(
    work: &mut Stream,
    resp: &mut Stream,
    accept_fd: Option<OwnedFd>,
    filed: Option<Stream>,
) -> Result<()> {
    let mut source = match (accept_fd, filed) {
        (Some(fd), None) => {
            let listener = UnixListener::from(fd);
            listener.set_nonblocking(true).map_err(Error::System)?;
            Source::Accept(listener)
        }
        (None, Some(filed)) => Source::Filed(filed),
        _ => return Err(Error::Malformed("control needs exactly one socket source")),
    };

    loop {
        // Either the webserver/manager side or the responder going
        // away ends the loop; the caller checks child exit codes, so
        // which one it was does not matter here.
        let (our_ev, resp_ev) = poll2(source.as_fd(), resp.as_fd())?;
        if resp_ev.intersects(PollFlags::POLLHUP | PollFlags::POLLERR) {
            return Ok(());
        }
        if !our_ev.contains(PollFlags::POLLIN) {
            return Ok(());
        }

        let (conn, token) = match next_conn(&mut source)? {
            Conn::Ready(fd, token) => (fd, token),
            Conn::Retry => continue,
            Conn::Closed => return Ok(()),
        };
        // Match the CGI arrangement: the peer socket is non-blocking
        // from here on.
        let mut conn = Stream::new(conn)?;

        // This need not be of cryptographic quality; it guards
        // against cross-talk, not an adversary holding the sockets.
        let cookie: u32 = rand::random();
        debug!(cookie, "FastCGI: dispatching connection to worker");
        work.write_u32(cookie)?;

        pump(&mut conn, work)?;

        // The worker reports whether it parsed a full request.
        let rc = work.read_u32()?;
        if rc == 0 {
            warn!("FastCGI: worker abandoned request");
            // Let the responder observe the hangup: a bare request-id
            // zero with no descriptor attached.
            resp.write_u16(0)?;
        } else {
            let echoed = work.read_u32()?;
            if echoed != cookie {
                warn!("FastCGI: bad worker cookie");
                return Err(Error::Malformed("worker cookie mismatch"));
            }
            let rid = work.read_u16()?;

            // The socket has been drained of input; the responder
            // takes it over for output.
            resp.send_fd(conn.as_fd(), &rid.to_ne_bytes())?;

            // Wait until the application has finished writing, then
            // double-check the request id.
            let rtest = resp.read_u16()?;
            if rtest != rid {
                warn!("FastCGI: bad responder request ID");
                return Err(Error::Malformed("responder request id mismatch"));
            }
        }

        // In extended mode, give the manager its slot back.
        if let (Some(token), Source::Filed(filed)) = (token, &mut source) {
            filed.write_full(&token.to_ne_bytes())?;
        }
        drop(conn);
    }
}
