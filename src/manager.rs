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

//! The FastCGI pool supervisor.
//!
//! Runs as root: binds and owns the webserver socket, chroots, drops
//! privileges, then maintains a pool of responder processes.  In the
//! classic arrangement every child inherits the listen socket on
//! standard input and accepts for itself.  In the variable
//! arrangement the supervisor accepts and passes each connection to
//! an idle child over a per-child socket (advertised through
//! `FCGI_LISTENSOCK_DESCRIPTORS`), growing the pool on demand and
//! shrinking it after an idle grace period.
//!
//! SIGTERM drains and exits, SIGHUP drains and restarts the pool, and
//! a child death outside either is fatal.

use crate::{Error, Result, ipc::Stream};
use nix::{
    poll::{PollFd, PollFlags, PollTimeout, poll},
    sys::{
        signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal, kill},
        socket::{AddressFamily, Backlog, SockFlag, SockType, UnixAddr, bind, listen, socket},
        wait::{WaitPidFlag, WaitStatus, waitpid},
    },
    unistd::{
        ForkResult, Pid, User, chdir, chroot, daemon, dup2_stdin, execve, fork, geteuid, setgid,
        setgroups, setuid,
    },
};
use std::{
    ffi::CString,
    io,
    os::fd::{AsFd, AsRawFd, OwnedFd},
    os::unix::fs::PermissionsExt,
    os::unix::net::UnixListener,
    path::PathBuf,
    sync::atomic::{AtomicBool, Ordering},
    time::{Duration, Instant},
};
use tracing::{info, warn};

static TERM: AtomicBool = AtomicBool::new(false);
static RESTART: AtomicBool = AtomicBool::new(false);
static CHILD: AtomicBool = AtomicBool::new(false);

extern "C" fn on_term(_: libc::c_int) {
    TERM.store(true, Ordering::Relaxed);
}

extern "C" fn on_hup(_: libc::c_int) {
    RESTART.store(true, Ordering::Relaxed);
}

extern "C" fn on_chld(_: libc::c_int) {
    CHILD.store(true, Ordering::Relaxed);
}

/// Supervisor configuration, usually assembled from the command line.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Base pool size.
    pub workers: usize,
    /// Upper bound for the variable pool.
    pub max_workers: usize,
    /// Listen backlog.
    pub backlog: i32,
    /// Chroot directory; the responder binary path is resolved inside
    /// it.
    pub chroot: PathBuf,
    /// Webserver socket path, bound before chrooting.
    pub sockpath: PathBuf,
    /// Owner of the socket (the webserver user).
    pub sock_user: Option<String>,
    /// User the responders run as.
    pub proc_user: Option<String>,
    /// Use the variable pool (descriptor passing).
    pub variable: bool,
    /// Idle grace before the variable pool shrinks.
    pub idle_grace: Duration,
    /// Detach from the terminal.
    pub daemonize: bool,
    /// Responder program and arguments.
    pub argv: Vec<String>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 5,
            max_workers: 20,
            backlog: 10,
            chroot: PathBuf::from("/var/www"),
            sockpath: PathBuf::from("/var/www/run/httpd.sock"),
            sock_user: None,
            proc_user: None,
            variable: false,
            idle_grace: Duration::from_secs(60),
            daemonize: true,
            argv: Vec::new(),
        }
    }
}

fn lookup(name: &str) -> Result<User> {
    User::from_name(name)?
        .ok_or_else(|| Error::System(io::Error::other(format!("unknown user {name}"))))
}

/// One pooled responder (variable arrangement).
struct Slot {
    pid: Pid,
    chan: Stream,
    busy: bool,
    token: u64,
    idle_since: Instant,
}

fn install_signals() -> Result<()> {
    let term = SigAction::new(SigHandler::Handler(on_term), SaFlags::empty(), SigSet::empty());
    let hup = SigAction::new(SigHandler::Handler(on_hup), SaFlags::empty(), SigSet::empty());
    let chld = SigAction::new(SigHandler::Handler(on_chld), SaFlags::empty(), SigSet::empty());
    unsafe {
        signal::sigaction(Signal::SIGTERM, &term)?;
        signal::sigaction(Signal::SIGHUP, &hup)?;
        signal::sigaction(Signal::SIGCHLD, &chld)?;
        signal::signal(Signal::SIGPIPE, SigHandler::SigIgn)?;
    }
    Ok(())
}

/// Bind the webserver socket, fix its ownership and mode.
fn bind_socket(cfg: &PoolConfig) -> Result<OwnedFd> {
    let _ = std::fs::remove_file(&cfg.sockpath);
    let fd = socket(
        AddressFamily::Unix,
        SockType::Stream,
        SockFlag::empty(),
        None,
    )?;
    let addr = UnixAddr::new(&cfg.sockpath)?;
    bind(fd.as_raw_fd(), &addr)?;
    listen(&fd, Backlog::new(cfg.backlog)?)?;

    if let Some(name) = &cfg.sock_user {
        let user = lookup(name)?;
        nix::unistd::chown(&cfg.sockpath, Some(user.uid), Some(user.gid))?;
    }
    std::fs::set_permissions(&cfg.sockpath, std::fs::Permissions::from_mode(0o660))
        .map_err(Error::System)?;
    Ok(fd)
}

/// Chroot and drop to the responder user.
fn drop_privileges(cfg: &PoolConfig) -> Result<()> {
    chroot(&cfg.chroot)?;
    chdir("/")?;
    if let Some(name) = &cfg.proc_user {
        let user = lookup(name)?;
        setgroups(&[user.gid])?;
        setgid(user.gid)?;
        setuid(user.uid)?;
    }
    Ok(())
}

fn cstrings(argv: &[String]) -> Result<Vec<CString>> {
    argv.iter()
        .map(|a| CString::new(a.as_str()).map_err(|_| Error::Malformed("NUL in argument")))
        .collect()
}

/// Environment for an exec'd responder, with the descriptor-passing
/// variable replaced.
fn child_env(filed: Option<i32>) -> Vec<CString> {
    let mut env: Vec<CString> = std::env::vars()
        .filter(|(k, _)| k != "FCGI_LISTENSOCK_DESCRIPTORS")
        .filter_map(|(k, v)| CString::new(format!("{k}={v}")).ok())
        .collect();
    if let Some(fd) = filed {
        env.push(CString::new(format!("FCGI_LISTENSOCK_DESCRIPTORS={fd}")).expect("static"));
    }
    env
}

/// Fork and exec one classic responder with the listen socket on
/// standard input.
fn spawn_classic(listen_fd: &OwnedFd, argv: &[CString]) -> Result<Pid> {
    match unsafe { fork() }? {
        ForkResult::Child => {
            let rc = dup2_stdin(listen_fd.as_fd());
            if rc.is_ok() {
                let _ = execve(&argv[0], argv, &child_env(None));
            }
            unsafe { libc::_exit(1) }
        }
        ForkResult::Parent { child } => Ok(child),
    }
}

/// Fork and exec one variable-pool responder with a descriptor
/// channel instead of a listen socket.
fn spawn_variable(listen_fd: &OwnedFd, argv: &[CString]) -> Result<Slot> {
    let (ours, theirs) = crate::ipc::stream_pair()?;
    match unsafe { fork() }? {
        ForkResult::Child => {
            drop(ours);
            unsafe { libc::close(listen_fd.as_raw_fd()) };
            let _ = execve(&argv[0], argv, &child_env(Some(theirs.as_raw_fd())));
            unsafe { libc::_exit(1) }
        }
        ForkResult::Parent { child } => {
            drop(theirs);
            Ok(Slot {
                pid: child,
                chan: Stream::new(ours)?,
                busy: false,
                token: 0,
                idle_since: Instant::now(),
            })
        }
    }
}

fn kill_and_reap(pids: impl Iterator<Item = Pid>) {
    let pids: Vec<Pid> = pids.collect();
    for pid in &pids {
        let _ = kill(*pid, Signal::SIGTERM);
    }
    for pid in &pids {
        let _ = waitpid(*pid, None);
    }
}

/// Run the supervisor.  Returns when asked to exit; errors are fatal
/// configuration or pool failures.
pub fn run(cfg: &PoolConfig) -> Result<()> {
    if cfg.argv.is_empty() {
        return Err(Error::Malformed("no responder program given"));
    }
    if !geteuid().is_root() {
        return Err(Error::System(io::Error::other("must run as root")));
    }

    install_signals()?;
    let listen_fd = bind_socket(cfg)?;
    drop_privileges(cfg)?;

    if cfg.daemonize {
        daemon(false, false)?;
    }

    let argv = cstrings(&cfg.argv)?;
    loop {
        let restarted = if cfg.variable {
            run_variable(cfg, &listen_fd, &argv)?
        } else {
            run_fixed(cfg, &listen_fd, &argv)?
        };
        if !restarted {
            let _ = std::fs::remove_file(&cfg.sockpath);
            return Ok(());
        }
        info!("restarting responder pool");
        RESTART.store(false, Ordering::Relaxed);
    }
}

/// Classic pool: children accept for themselves; the supervisor only
/// watches for exits and signals.  Returns whether a restart was
/// requested.
fn run_fixed(cfg: &PoolConfig, listen_fd: &OwnedFd, argv: &[CString]) -> Result<bool> {
    let mut pids = Vec::with_capacity(cfg.workers);
    for _ in 0..cfg.workers {
        pids.push(spawn_classic(listen_fd, argv)?);
    }
    info!(workers = pids.len(), "responder pool running");

    loop {
        match waitpid(Pid::from_raw(-1), None) {
            Err(nix::errno::Errno::EINTR) => {}
            Err(e) => {
                kill_and_reap(pids.into_iter());
                return Err(e.into());
            }
            Ok(status) => {
                if !TERM.load(Ordering::Relaxed) && !RESTART.load(Ordering::Relaxed) {
                    warn!(?status, "responder died unexpectedly");
                    kill_and_reap(pids.into_iter());
                    return Err(Error::Malformed("unexpected responder termination"));
                }
                if let Some(pid) = status.pid() {
                    pids.retain(|p| *p != pid);
                }
            }
        }
        if TERM.load(Ordering::Relaxed) {
            kill_and_reap(pids.into_iter());
            return Ok(false);
        }
        if RESTART.load(Ordering::Relaxed) {
            kill_and_reap(pids.into_iter());
            return Ok(true);
        }
    }
}

/// Variable pool: the supervisor accepts and dispatches connections,
/// growing to `max_workers` and shrinking idle responders after the
/// grace period.  Returns whether a restart was requested.
fn run_variable(cfg: &PoolConfig, listen_fd: &OwnedFd, argv: &[CString]) -> Result<bool> {
    let listener = UnixListener::from(listen_fd.try_clone().map_err(Error::System)?);
    listener.set_nonblocking(true).map_err(Error::System)?;

    let mut slots = Vec::with_capacity(cfg.workers);
    for _ in 0..cfg.workers {
        slots.push(spawn_variable(listen_fd, argv)?);
    }
    info!(workers = slots.len(), "variable responder pool running");

    let grace_ms = cfg.idle_grace.as_millis().min(u16::MAX as u128) as u16;

    loop {
        if TERM.load(Ordering::Relaxed) {
            kill_and_reap(slots.into_iter().map(|s| s.pid));
            return Ok(false);
        }
        if RESTART.load(Ordering::Relaxed) {
            kill_and_reap(slots.into_iter().map(|s| s.pid));
            return Ok(true);
        }
        if CHILD.load(Ordering::Relaxed) {
            CHILD.store(false, Ordering::Relaxed);
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) | Err(nix::errno::Errno::ECHILD) => {}
                Ok(status) => {
                    warn!(?status, "responder died unexpectedly");
                    kill_and_reap(slots.into_iter().map(|s| s.pid));
                    return Err(Error::Malformed("unexpected responder termination"));
                }
                Err(nix::errno::Errno::EINTR) => {}
                Err(e) => return Err(e.into()),
            }
        }

        // Poll the listen socket and every busy child's channel.
        let mut fds = vec![PollFd::new(listener.as_fd(), PollFlags::POLLIN)];
        let busy: Vec<usize> = (0..slots.len()).filter(|&i| slots[i].busy).collect();
        for &i in &busy {
            fds.push(PollFd::new(slots[i].chan.as_fd(), PollFlags::POLLIN));
        }

        let n = match poll(&mut fds, PollTimeout::from(grace_ms)) {
            Ok(n) => n,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        };

        let listen_ready = fds[0]
            .revents()
            .unwrap_or(PollFlags::empty())
            .contains(PollFlags::POLLIN);
        let ready: Vec<usize> = busy
            .iter()
            .enumerate()
            .filter(|(k, _)| {
                fds[k + 1]
                    .revents()
                    .unwrap_or(PollFlags::empty())
                    .contains(PollFlags::POLLIN)
            })
            .map(|(_, &i)| i)
            .collect();
        drop(fds);

        // Completions: children echo their token when the request is
        // done.
        for i in ready {
            let slot = &mut slots[i];
            let mut echo = [0u8; 8];
            let ok = matches!(slot.chan.read_full(&mut echo, true), Ok(true))
                && u64::from_ne_bytes(echo) == slot.token;
            if !ok {
                warn!("responder channel failed or echoed a foreign token");
                kill_and_reap(slots.into_iter().map(|s| s.pid));
                return Err(Error::Malformed("responder completion failure"));
            }
            slot.busy = false;
            slot.idle_since = Instant::now();
        }

        if listen_ready {
            // Find an idle child, or grow the pool.
            let idle = slots.iter().position(|s| !s.busy);
            let idle = match idle {
                Some(i) => Some(i),
                None if slots.len() < cfg.max_workers => {
                    slots.push(spawn_variable(listen_fd, argv)?);
                    Some(slots.len() - 1)
                }
                // Saturated: leave the connection queued in the
                // kernel until a child comes free.
                None => None,
            };
            if let Some(i) = idle {
                match listener.accept() {
                    Ok((conn, _)) => {
                        let conn: OwnedFd = conn.into();
                        let slot = &mut slots[i];
                        slot.token = rand::random();
                        slot.chan.send_fd(conn.as_fd(), &slot.token.to_ne_bytes())?;
                        slot.busy = true;
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(e) => return Err(Error::System(e)),
                }
            }
        }

        // Shrink: idle children beyond the base size whose grace ran
        // out.
        if n == 0 && slots.len() > cfg.workers {
            let cutoff = cfg.idle_grace;
            let mut i = 0;
            while i < slots.len() && slots.len() > cfg.workers {
                if !slots[i].busy && slots[i].idle_since.elapsed() >= cutoff {
                    let slot = slots.remove(i);
                    let _ = kill(slot.pid, Signal::SIGTERM);
                    drop(slot.chan);
                    let _ = waitpid(slot.pid, None);
                } else {
                    i += 1;
                }
            }
        }
    }
}
