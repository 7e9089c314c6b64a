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

//! FastCGI context: process layout and the accept loop.
//!
//! `FcgiContext::init` forks the sandboxed worker and the control
//! process once; `accept` then yields one parsed [`Request`] per
//! webserver connection until termination is requested.  SIGTERM is
//! handled so a blocking accept wakes up and reports [`Error::Exit`]
//! instead of dying mid-request.

use crate::{
    Config, Error, Request, Result, control,
    field::FieldKey,
    ipc::{self, Stream},
    output::{FCGI_BUFSZ, OutputData},
    request, sandbox, worker,
};
use nix::{
    sys::{
        signal::{self, SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal},
        wait::waitpid,
    },
    unistd::{ForkResult, Pid, fork},
};
use std::{
    cell::RefCell,
    os::fd::{FromRawFd, OwnedFd},
    rc::Rc,
    sync::atomic::{AtomicBool, Ordering},
};
use tracing::warn;

/// Set by the SIGTERM handler; observed between polls.
static TERMINATED: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_sigterm(_: libc::c_int) {
    TERMINATED.store(true, Ordering::Relaxed);
}

/// Whether the process was started under a FastCGI arrangement:
/// either a manager advertises a descriptor-passing channel, or
/// standard input is an unconnected (listening) socket.
pub fn fcgi_test() -> bool {
    if filed_descriptor().is_some() {
        return true;
    }
    match nix::sys::socket::getpeername::<()>(0) {
        Ok(_) => false,
        Err(errno) => errno == nix::errno::Errno::ENOTCONN,
    }
}

/// The extended-mode descriptor named by the manager, if any.
fn filed_descriptor() -> Option<i32> {
    std::env::var("FCGI_LISTENSOCK_DESCRIPTORS")
        .ok()
        .and_then(|v| v.parse::<i32>().ok())
        .filter(|&fd| fd >= 0)
}

fn map_fork_err(errno: nix::errno::Errno) -> Error {
    if errno == nix::errno::Errno::EAGAIN {
        Error::ForkRetry
    } else {
        errno.into()
    }
}

/// Worker child body: sandbox, then loop over requests forever.
fn worker_main(dat: OwnedFd, ctl: OwnedFd, keys: &[FieldKey], mimes: &[&str]) -> i32 {
    if unsafe { signal::signal(Signal::SIGTERM, SigHandler::SigIgn) }.is_err() {
        return 1;
    }
    if sandbox::apply(sandbox::Role::Worker).is_err() {
        return 1;
    }
    let (Ok(mut dat), Ok(mut ctl)) = (Stream::new(dat), Stream::new(ctl)) else {
        return 1;
    };
    match worker::run_fcgi(&mut dat, &mut ctl, keys, mimes) {
        Ok(()) => 0,
        Err(e) => {
            warn!(error = %e, "FastCGI worker failed");
            1
        }
    }
}

/// Control child body.
fn control_main(
    work: OwnedFd,
    resp: OwnedFd,
    accept_fd: Option<OwnedFd>,
    filed: Option<OwnedFd>,
) -> i32 {
    if unsafe { signal::signal(Signal::SIGTERM, SigHandler::SigIgn) }.is_err() {
        return 1;
    }
    if sandbox::apply(sandbox::Role::Control).is_err() {
        return 1;
    }
    let (Ok(mut work), Ok(mut resp)) = (Stream::new(work), Stream::new(resp)) else {
        return 1;
    };
    let filed = match filed.map(Stream::new).transpose() {
        Ok(filed) => filed,
        Err(_) => return 1,
    };
    match control::run(&mut work, &mut resp, accept_fd, filed) {
        Ok(()) => 0,
        Err(e) => {
            warn!(error = %e, "FastCGI control failed");
            1
        }
    }
}

/// A FastCGI runtime: one worker and one control process, reused
/// across every request of the responder's lifetime.
pub struct FcgiContext<'a> {
    keys: &'a [FieldKey],
    pages: &'a [&'a str],
    default_page: usize,
    mimes: &'a [&'a str],
    default_mime: usize,
    suffixes: &'a [(&'a str, usize)],
    bufsz: usize,
    work_dat: Option<Stream>,
    sock_ctl: Option<Stream>,
    work_pid: Pid,
    sock_pid: Pid,
}

impl<'a> FcgiContext<'a> {
    /// Set up the process family.
    ///
    /// Must be called before any application state worth protecting is
    /// created: both children are forked here, sandboxed, and never
    /// return to application code.  The calling process itself comes
    /// back under the responder policy of [`crate::sandbox::Role`]
    /// (file access yes, fork and new sockets no), so sockets the
    /// application needs must exist before this call.
    pub fn init(cfg: &Config<'a>) -> Result<Self> {
        // Classic mode accepts on standard input; extended mode
        // receives descriptors from a manager.
        let filed = filed_descriptor();
        let accept_owned = match filed {
            Some(_) => None,
            None => Some(unsafe { OwnedFd::from_raw_fd(0) }),
        };
        let filed_owned = filed.map(|fd| unsafe { OwnedFd::from_raw_fd(fd) });

        // SIGTERM stays blocked except around the accept poll, so a
        // shutdown request cannot interrupt request handling halfway.
        TERMINATED.store(false, Ordering::Relaxed);
        let sa = SigAction::new(
            SigHandler::Handler(handle_sigterm),
            SaFlags::empty(),
            SigSet::empty(),
        );
        unsafe { signal::sigaction(Signal::SIGTERM, &sa) }?;
        let mut mask = SigSet::empty();
        mask.add(Signal::SIGTERM);
        signal::sigprocmask(SigmaskHow::SIG_BLOCK, Some(&mask), None)?;

        // Worker channels: control frames on one pair, the parsed
        // record stream on the other.
        let (work_ctl_our, work_ctl_child) = ipc::stream_pair()?;
        let (work_dat_our, work_dat_child) = ipc::stream_pair()?;

        let work_pid = match unsafe { fork() }.map_err(map_fork_err)? {
            ForkResult::Child => {
                drop(work_ctl_our);
                drop(work_dat_our);
                drop(accept_owned);
                drop(filed_owned);
                let code = worker_main(work_dat_child, work_ctl_child, cfg.keys, cfg.mimes);
                unsafe { libc::_exit(code) }
            }
            ForkResult::Parent { child } => child,
        };
        drop(work_ctl_child);
        drop(work_dat_child);

        // The responder channel toward control.
        let (sock_ctl_our, sock_ctl_child) = ipc::stream_pair()?;

        let sock_pid = match unsafe { fork() }.map_err(map_fork_err)? {
            ForkResult::Child => {
                drop(work_dat_our);
                drop(sock_ctl_our);
                let code = control_main(work_ctl_our, sock_ctl_child, accept_owned, filed_owned);
                unsafe { libc::_exit(code) }
            }
            ForkResult::Parent { child } => child,
        };
        drop(work_ctl_our);
        drop(sock_ctl_child);
        drop(accept_owned);
        drop(filed_owned);

        let work_dat = Stream::new(work_dat_our)?;
        let sock_ctl = Stream::new(sock_ctl_our)?;

        // The application half is confined too: conservative file
        // access and the IPC family, but no fork and no new sockets.
        sandbox::apply(sandbox::Role::Responder)?;

        Ok(Self {
            keys: cfg.keys,
            pages: cfg.pages,
            default_page: cfg.default_page,
            mimes: cfg.mimes,
            default_mime: cfg.default_mime,
            suffixes: cfg.suffixes,
            bufsz: cfg.opts.send_buffer_size.unwrap_or(FCGI_BUFSZ),
            work_dat: Some(work_dat),
            sock_ctl: Some(sock_ctl),
            work_pid,
            sock_pid,
        })
    }

    /// Wait for the next connection, observing SIGTERM between polls.
    fn wait_dispatch(&self) -> Result<()> {
        let sock = self.sock_ctl.as_ref().expect("context torn down");
        let mut mask = SigSet::empty();
        mask.add(Signal::SIGTERM);
        loop {
            signal::sigprocmask(SigmaskHow::SIG_UNBLOCK, Some(&mask), None)?;
            let ready = sock.wait_readable(1000);
            signal::sigprocmask(SigmaskHow::SIG_BLOCK, Some(&mask), None)?;

            if TERMINATED.load(Ordering::Relaxed) {
                return Err(Error::Exit);
            }
            match ready? {
                Some(true) => return Ok(()),
                Some(false) => return Err(Error::Exit),
                None => continue,
            }
        }
    }

    /// Accept and parse the next request.
    ///
    /// Blocks until control hands over a drained peer socket, then
    /// reads the typed record stream from the worker.  Returns
    /// [`Error::Exit`] when shutdown was requested or the channel
    /// closed, and [`Error::Hup`] when the client disconnected before
    /// its request was complete; the context stays usable after a
    /// hangup.
    pub fn accept(&mut self) -> Result<Request> {
        self.wait_dispatch()?;

        let sock_ctl = self.sock_ctl.as_mut().expect("context torn down");
        let mut payload = [0u8; 2];
        let (n, fd) = sock_ctl.recv_fd(&mut payload)?;
        if n == 0 {
            return Err(Error::Exit);
        }
        let Some(fd) = fd else {
            return Err(Error::Hup);
        };
        let rid = u16::from_ne_bytes(payload);

        let work_dat = self.work_dat.as_mut().expect("context torn down");
        let mut req = request::read_request(work_dat, self.keys.len(), self.mimes.len())?;
        req.resolve(
            self.pages,
            self.default_page,
            self.suffixes,
            self.default_mime,
            self.mimes.len(),
        );

        // The request owns the peer socket for output and a duplicate
        // of the control channel to acknowledge completion on.
        let sock = Stream::new(fd)?;
        let ack = self
            .sock_ctl
            .as_ref()
            .expect("context torn down")
            .try_clone()?;
        req.output = Some(Rc::new(RefCell::new(OutputData::fcgi(
            Box::new(sock),
            rid,
            self.bufsz,
            ack,
        ))));
        Ok(req)
    }
}

impl Drop for FcgiContext<'_> {
    /// Close the worker channels, then reap both children; they exit
    /// on end-of-file.
    fn drop(&mut self) {
        drop(self.sock_ctl.take());
        drop(self.work_dat.take());
        let _ = waitpid(self.work_pid, None);
        let _ = waitpid(self.sock_pid, None);
    }
}
