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

//! Plain CGI parsing (RFC 3875).
//!
//! One worker process is forked per request: it parses the inherited
//! environment and standard input inside the sandbox and streams the
//! typed records back; this process never touches a parser.

use crate::{
    Config, Error, Request, Result,
    field::FieldKey,
    ipc::{self, Stream},
    output::{CGI_BUFSZ, OutputData},
    request, sandbox, worker,
};
use nix::{
    sys::wait::{WaitStatus, waitpid},
    unistd::{ForkResult, fork},
};
use std::{
    cell::RefCell,
    os::fd::{BorrowedFd, FromRawFd, OwnedFd},
    rc::Rc,
};
use tracing::warn;

/// Worker child body for one CGI request.
fn worker_main(dat: OwnedFd) -> (Stream, Stream) {
    // Input is standard input; the typed records go to the parent.
    let stdin = unsafe { OwnedFd::from_raw_fd(0) };
    let input = Stream::new(stdin);
    let out = Stream::new(dat);
    match (input, out) {
        (Ok(input), Ok(out)) => (input, out),
        _ => unsafe { libc::_exit(1) },
    }
}

/// Parse one CGI request with the built-in MIME tables.
pub fn parse(keys: &[FieldKey], pages: &[&str], default_page: usize) -> Result<Request> {
    parse_ex(&Config::new(keys, pages, default_page))
}

/// Parse one CGI request.
///
/// Forks the sandboxed worker, confines the calling process under the
/// responder policy of [`crate::sandbox::Role`], reads the typed
/// record stream back, reaps the worker, and attaches the response
/// encoder to standard output.
pub fn parse_ex(cfg: &Config<'_>) -> Result<Request> {
    // The body reads are poll-driven, so standard input must not
    // block.
    ipc::prepare(unsafe { BorrowedFd::borrow_raw(0) })?;

    let (dat_our, dat_child) = ipc::stream_pair()?;

    let child = match unsafe { fork() } {
        Err(nix::errno::Errno::EAGAIN) => return Err(Error::ForkRetry),
        Err(e) => return Err(e.into()),
        Ok(ForkResult::Child) => {
            drop(dat_our);
            unsafe { libc::close(libc::STDOUT_FILENO) };
            let code = if sandbox::apply(sandbox::Role::Worker).is_err() {
                1
            } else {
                let (mut input, mut out) = worker_main(dat_child);
                match worker::run_cgi(&mut input, &mut out, cfg.keys, cfg.mimes) {
                    Ok(()) => 0,
                    Err(e) => {
                        warn!(error = %e, "CGI worker failed");
                        1
                    }
                }
            };
            unsafe { libc::_exit(code) }
        }
        Ok(ForkResult::Parent { child }) => child,
    };
    drop(dat_child);

    // The parent is the responder and runs confined from here on:
    // everything left is IPC reads, reaping the worker, file access
    // of its own, and response output.
    if let Err(e) = sandbox::apply(sandbox::Role::Responder) {
        let _ = waitpid(child, None);
        return Err(e);
    }

    let mut st = match Stream::new(dat_our) {
        Ok(st) => st,
        Err(e) => {
            let _ = waitpid(child, None);
            return Err(e);
        }
    };

    let req = request::read_request(&mut st, cfg.keys.len(), cfg.mimes.len());
    drop(st);
    let status = waitpid(child, None);

    let mut req = req?;
    if !matches!(status, Ok(WaitStatus::Exited(_, 0))) {
        warn!(?status, "CGI worker exited abnormally");
        return Err(Error::Malformed("worker failure"));
    }

    req.resolve(
        cfg.pages,
        cfg.default_page,
        cfg.suffixes,
        cfg.default_mime,
        cfg.mimes.len(),
    );

    // The responder owns standard output from here on.
    let stdout = unsafe { OwnedFd::from_raw_fd(libc::STDOUT_FILENO) };
    let out = OutputData::cgi(
        Box::new(Stream::new(stdout)?),
        cfg.opts.send_buffer_size.unwrap_or(CGI_BUFSZ),
    );
    req.output = Some(Rc::new(RefCell::new(out)));
    Ok(req)
}
