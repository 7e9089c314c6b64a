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

//! Caller-supplied parsing and output configuration.

use crate::{field::FieldKey, tables};

/// Output tuning knobs.
#[derive(Debug, Clone, Copy, Default)]
pub struct Options {
    /// Response buffer size; `None` selects the per-transport default
    /// (8 KiB for CGI, 64 KiB for FastCGI).
    pub send_buffer_size: Option<usize>,
}

/// Everything the parser needs to know from the application: the key
/// table with validators, the page names, and the MIME tables fields
/// and suffixes resolve against.
pub struct Config<'a> {
    /// Recognized field keys and their validators.
    pub keys: &'a [FieldKey],
    /// Page names the first path component resolves against.
    pub pages: &'a [&'a str],
    /// Page index used when the path names no page.
    pub default_page: usize,
    /// MIME table for content types.
    pub mimes: &'a [&'a str],
    /// MIME index used when the suffix names none.
    pub default_mime: usize,
    /// Suffix to MIME index mapping.
    pub suffixes: &'a [(&'a str, usize)],
    /// Output options.
    pub opts: Options,
}

impl<'a> Config<'a> {
    /// A configuration over the built-in MIME tables.
    pub fn new(keys: &'a [FieldKey], pages: &'a [&'a str], default_page: usize) -> Self {
        Self {
            keys,
            pages,
            default_page,
            mimes: &tables::MIME_TYPES,
            default_mime: tables::MIME_TEXT_HTML,
            suffixes: &tables::SUFFIX_MAP,
            opts: Options::default(),
        }
    }
}
