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

//! Per-role process sandboxing.
//!
//! Each process role declares the capabilities it needs; the runtime
//! applies the strictest enforcement the host provides.  On Linux that
//! is `PR_SET_NO_NEW_PRIVS` plus a seccomp BPF allow-list covering
//! only the IPC read/write/poll/memory family the role is entitled
//! to.  A process stepping outside its policy is killed by the kernel
//! and restarted by the supervisor.
//!
//! All three roles are confined by the runtime itself: the worker and
//! control policies go on in the forked children, the responder policy
//! in the application process once the children are set up.  The
//! policy must be applied after post-fork cleanup and before the first
//! untrusted byte is read.  Hosts without a supported mechanism refuse
//! to build unless the `unsandboxed` feature says otherwise.

use crate::Result;

#[cfg(not(any(
    all(
        target_os = "linux",
        any(target_arch = "x86_64", target_arch = "aarch64", target_arch = "riscv64")
    ),
    feature = "unsandboxed"
)))]
compile_error!(
    "no process sandbox is available on this target; \
     enable the `unsandboxed` feature to build anyway (not for production)"
);

/// The process roles of the runtime, in capability order.
///
/// | Role      | open files | fork/exec | new sockets | inherited fds | anon mmap |
/// |-----------|------------|-----------|-------------|---------------|-----------|
/// | Worker    | no         | no        | no          | yes           | yes       |
/// | Control   | no         | no        | no          | yes           | yes       |
/// | Responder | yes        | no        | no          | yes           | yes       |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The parser of untrusted bytes: IPC on inherited descriptors
    /// and anonymous memory, nothing else.
    Worker,
    /// The FastCGI demultiplexer: adds `accept` on the inherited
    /// listen socket.
    Control,
    /// The application: keeps filesystem access for files it opened
    /// (or will open) itself, and may reap its two children; still no
    /// fork or new sockets.
    Responder,
}

/// Apply the sandbox policy for `role` to the current process.
pub fn apply(role: Role) -> Result<()> {
    #[cfg(all(
        target_os = "linux",
        any(target_arch = "x86_64", target_arch = "aarch64", target_arch = "riscv64")
    ))]
    {
        linux::apply(role)?;
    }
    #[cfg(not(all(
        target_os = "linux",
        any(target_arch = "x86_64", target_arch = "aarch64", target_arch = "riscv64")
    )))]
    {
        tracing::warn!(?role, "no sandbox mechanism on this host; not enforcing");
    }
    Ok(())
}

#[cfg(all(
    target_os = "linux",
    any(target_arch = "x86_64", target_arch = "aarch64", target_arch = "riscv64")
))]
mod linux {
    use super::Role;
    use crate::Result;
    use std::io;

    // Classic BPF opcodes; libc carries no constants for these.
    const BPF_LD: u16 = 0x00;
    const BPF_W: u16 = 0x00;
    const BPF_ABS: u16 = 0x20;
    const BPF_JMP: u16 = 0x05;
    const BPF_JEQ: u16 = 0x10;
    const BPF_K: u16 = 0x00;
    const BPF_RET: u16 = 0x06;

    const SECCOMP_RET_ALLOW: u32 = 0x7fff_0000;
    const SECCOMP_RET_KILL_PROCESS: u32 = 0x8000_0000;

    /// Offsets of the syscall number and the audit architecture in
    /// `struct seccomp_data`.
    const SECCOMP_DATA_NR_OFFSET: u32 = 0;
    const SECCOMP_DATA_ARCH_OFFSET: u32 = 4;

    /// The audit architecture of the syscall convention this filter is
    /// built for.  Syscall numbers only mean anything relative to it:
    /// a call entering through a foreign ABI must die before the
    /// number comparisons, or an aliased number would slip through.
    #[cfg(target_arch = "x86_64")]
    const SECCOMP_AUDIT_ARCH: u32 = 0xc000_003e; // AUDIT_ARCH_X86_64
    #[cfg(target_arch = "aarch64")]
    const SECCOMP_AUDIT_ARCH: u32 = 0xc000_00b7; // AUDIT_ARCH_AARCH64
    #[cfg(target_arch = "riscv64")]
    const SECCOMP_AUDIT_ARCH: u32 = 0xc000_00f3; // AUDIT_ARCH_RISCV64

    /// Syscalls every role needs: IPC on inherited descriptors,
    /// polling, anonymous memory, clocks, exit.
    const COMMON: &[libc::c_long] = &[
        libc::SYS_read,
        libc::SYS_write,
        libc::SYS_readv,
        libc::SYS_writev,
        libc::SYS_close,
        libc::SYS_ppoll,
        libc::SYS_recvmsg,
        libc::SYS_sendmsg,
        libc::SYS_recvfrom,
        libc::SYS_sendto,
        libc::SYS_mmap,
        libc::SYS_munmap,
        libc::SYS_mremap,
        libc::SYS_madvise,
        libc::SYS_brk,
        libc::SYS_rt_sigreturn,
        libc::SYS_rt_sigaction,
        libc::SYS_rt_sigprocmask,
        libc::SYS_sigaltstack,
        libc::SYS_futex,
        libc::SYS_clock_gettime,
        libc::SYS_gettimeofday,
        libc::SYS_getpid,
        libc::SYS_getrandom,
        libc::SYS_exit,
        libc::SYS_exit_group,
        libc::SYS_fcntl,
    ];

    /// Control additionally accepts connections on the inherited
    /// listen socket.  `ioctl` covers the FIONBIO the standard
    /// library uses for non-blocking mode.
    const CONTROL_EXTRA: &[libc::c_long] = &[
        libc::SYS_accept,
        libc::SYS_accept4,
        libc::SYS_getsockname,
        libc::SYS_getpeername,
        libc::SYS_ioctl,
    ];

    /// The responder keeps conservative file access for its own files
    /// plus stat, and `wait4` to reap the worker and control children;
    /// it still cannot fork or create sockets.
    const RESPONDER_EXTRA: &[libc::c_long] = &[
        libc::SYS_openat,
        libc::SYS_lseek,
        libc::SYS_pread64,
        libc::SYS_pwrite64,
        libc::SYS_fstat,
        libc::SYS_newfstatat,
        libc::SYS_statx,
        libc::SYS_getdents64,
        libc::SYS_getcwd,
        libc::SYS_ioctl,
        libc::SYS_wait4,
    ];

    /// Legacy spellings glibc still reaches for on x86-64; absent on
    /// the newer syscall tables.
    #[cfg(target_arch = "x86_64")]
    const LEGACY_COMMON: &[libc::c_long] = &[libc::SYS_poll, libc::SYS_select];
    #[cfg(target_arch = "x86_64")]
    const LEGACY_RESPONDER: &[libc::c_long] =
        &[libc::SYS_open, libc::SYS_stat, libc::SYS_lstat, libc::SYS_access];

    pub(super) fn apply(role: Role) -> Result<()> {
        // No privilege escalation through setuid binaries, ever; this
        // is inherited and cannot be unset.
        if unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) } != 0 {
            return Err(io::Error::last_os_error().into());
        }

        let mut allowed: Vec<u32> = COMMON.iter().map(|&s| s as u32).collect();
        #[cfg(target_arch = "x86_64")]
        allowed.extend(LEGACY_COMMON.iter().map(|&s| s as u32));
        match role {
            Role::Worker => {}
            Role::Control => allowed.extend(CONTROL_EXTRA.iter().map(|&s| s as u32)),
            Role::Responder => {
                allowed.extend(RESPONDER_EXTRA.iter().map(|&s| s as u32));
                #[cfg(target_arch = "x86_64")]
                allowed.extend(LEGACY_RESPONDER.iter().map(|&s| s as u32));
            }
        }

        install_filter(&allowed)
    }

    /// Install a deny-by-default seccomp filter allowing exactly the
    /// given syscall numbers.  Violations kill the process.
    fn install_filter(allowed: &[u32]) -> Result<()> {
        let n = allowed.len();
        let mut prog: Vec<libc::sock_filter> = Vec::with_capacity(n + 6);

        // Ensure the syscall arch convention is as expected before
        // looking at any number: kill on a foreign audit arch.
        prog.push(libc::sock_filter {
            code: BPF_LD | BPF_W | BPF_ABS,
            jt: 0,
            jf: 0,
            k: SECCOMP_DATA_ARCH_OFFSET,
        });
        prog.push(libc::sock_filter {
            code: BPF_JMP | BPF_JEQ | BPF_K,
            jt: 1,
            jf: 0,
            k: SECCOMP_AUDIT_ARCH,
        });
        prog.push(libc::sock_filter {
            code: BPF_RET | BPF_K,
            jt: 0,
            jf: 0,
            k: SECCOMP_RET_KILL_PROCESS,
        });

        // Load the syscall number into the accumulator.
        prog.push(libc::sock_filter {
            code: BPF_LD | BPF_W | BPF_ABS,
            jt: 0,
            jf: 0,
            k: SECCOMP_DATA_NR_OFFSET,
        });

        // One JEQ per allowed syscall, jumping forward to the final
        // ALLOW instruction on match.
        for (i, &nr) in allowed.iter().enumerate() {
            prog.push(libc::sock_filter {
                code: BPF_JMP | BPF_JEQ | BPF_K,
                jt: (n - i) as u8,
                jf: 0,
                k: nr,
            });
        }

        // Default: kill.  Then: allow.
        prog.push(libc::sock_filter {
            code: BPF_RET | BPF_K,
            jt: 0,
            jf: 0,
            k: SECCOMP_RET_KILL_PROCESS,
        });
        prog.push(libc::sock_filter {
            code: BPF_RET | BPF_K,
            jt: 0,
            jf: 0,
            k: SECCOMP_RET_ALLOW,
        });

        let fprog = libc::sock_fprog {
            len: prog.len() as u16,
            filter: prog.as_mut_ptr(),
        };

        let rc = unsafe {
            libc::prctl(
                libc::PR_SET_SECCOMP,
                libc::SECCOMP_MODE_FILTER,
                &fprog as *const libc::sock_fprog,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(())
    }
}
