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

//! A privilege-separated CGI (RFC 3875) and FastCGI (v1.0) runtime.
//!
//! Every byte of untrusted input (query strings, form bodies, cookies,
//! authorization headers, FastCGI framing) is parsed inside a
//! sandboxed child process that exchanges only already-validated,
//! structured records with the application over a private binary IPC
//! protocol.  The application itself never runs a parser over
//! untrusted bytes.
//!
//! CGI applications call [`parse`] once per invocation; FastCGI
//! applications create one [`FcgiContext`] and call
//! [`FcgiContext::accept`] per connection.  Responses are emitted
//! through the request's head/body interface or a [`Writer`] handle,
//! with on-the-fly gzip for CGI and record framing for FastCGI.

#![warn(rust_2018_idioms)]
#![warn(clippy::dbg_macro, clippy::print_stdout)]

pub mod auth;
mod cgi;
mod config;
mod control;
pub mod env;
mod error;
mod fcgi;
mod field;
mod form;
mod ipc;
pub mod manager;
mod multipart;
mod output;
mod record;
mod request;
pub mod sandbox;
pub mod tables;
pub mod url;
pub mod validate;
mod worker;

pub use crate::{
    auth::{
        AuthCheck, AuthData, DigestAuth, HttpAuth, parse_authorization, validate_basic,
        validate_digest, validate_digest_hash,
    },
    cgi::{parse, parse_ex},
    config::{Config, Options},
    env::{Method, RequestHeader, Scheme},
    error::{Error, Result},
    fcgi::{FcgiContext, fcgi_test},
    field::{Field, FieldKey, FieldState, InputKind, Parsed},
    output::Writer,
    request::{AuthKind, HttpHeader, Request},
};
