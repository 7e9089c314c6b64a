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

//! Error types and result type alias for the runtime.
//!
//! Parsers classify malformed input at field granularity and merely log
//! it; only structural violations (multipart framing, FastCGI framing,
//! the internal IPC protocol) surface here as [`Error::Malformed`].

use std::io;

/// Result type alias for runtime operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors reported by the parsing, transport and output layers.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Clean termination was requested (SIGTERM, or the manager closed
    /// the accept channel).  The caller should tear down and exit.
    #[error("termination requested")]
    Exit,

    /// The peer closed the connection.  Distinct from [`Error::System`]
    /// so callers may still free the request cleanly.
    #[error("peer closed connection")]
    Hup,

    /// An allocation was refused because a transmitted size was
    /// implausibly large.
    #[error("out of memory")]
    OutOfMemory,

    /// The process ran out of descriptors while accepting.
    #[error("too many open files")]
    TooManyFiles,

    /// Forking a child failed transiently; the caller may retry.
    #[error("failed to fork child, retry")]
    ForkRetry,

    /// Structural protocol or parser violation: FastCGI framing, the
    /// multipart grammar at a boundary, or the internal IPC stream.
    #[error("malformed input: {0}")]
    Malformed(&'static str),

    /// Opaque operating system error.
    #[error(transparent)]
    System(#[from] io::Error),

    /// Output misuse: a header after the body began, writing while
    /// still in the header state, or compressing over FastCGI.
    #[error("writer misuse")]
    WriterMisuse,
}

impl From<nix::errno::Errno> for Error {
    fn from(errno: nix::errno::Errno) -> Self {
        Error::System(io::Error::from_raw_os_error(errno as i32))
    }
}
