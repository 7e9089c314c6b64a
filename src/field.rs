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

//! Parsed request fields.
//!
//! A field is one key/value occurrence from a cookie, the query string
//! or the request body, together with its multipart metadata and the
//! outcome of running the registered validator over it.

/// Where a field was parsed from.
///
/// Query-string and body fields share one collection in the request;
/// cookies live in their own (the same names do not collide).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum InputKind {
    /// `Cookie` request header
    Cookie = 0,
    /// `QUERY_STRING` parameters
    Query = 1,
    /// Request body (URL-encoded, multipart or plain)
    Form = 2,
}

impl InputKind {
    /// The stream terminator tag; never a field kind.
    pub(crate) const END: u32 = 3;

    pub(crate) fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(InputKind::Cookie),
            1 => Some(InputKind::Query),
            2 => Some(InputKind::Form),
            _ => None,
        }
    }
}

/// Validation state of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum FieldState {
    /// No validator was registered for the key.
    #[default]
    Unchecked = 0,
    /// The validator accepted the value; [`Field::parsed`] is set.
    Valid = 1,
    /// The validator rejected the value.
    Invalid = 2,
}

impl FieldState {
    pub(crate) fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(FieldState::Unchecked),
            1 => Some(FieldState::Valid),
            2 => Some(FieldState::Invalid),
            _ => None,
        }
    }
}

/// The typed form of a validated value.
///
/// A string payload is a byte offset into [`Field::val`], never an
/// owned copy; the value buffer owns the bytes.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Parsed {
    /// Not validated, or the validator set no typed form.
    #[default]
    None,
    /// Validated 64-bit integer.
    Int(i64),
    /// Validated double.
    Double(f64),
    /// Validated string: offset into the value buffer.
    Str(usize),
}

/// Wire tags for [`Parsed`]; `NONE` doubles as the "no payload" marker.
pub(crate) mod parsed_tag {
    pub(crate) const INT: u32 = 0;
    pub(crate) const STR: u32 = 1;
    pub(crate) const DOUBLE: u32 = 2;
    pub(crate) const NONE: u32 = 3;
}

/// One parsed key/value occurrence.
#[derive(Debug, Default)]
pub struct Field {
    /// Field key; empty for a body transmitted as a single value.
    pub key: String,
    /// Index into the caller's key table, or the table length if the
    /// key matched nothing.
    pub keypos: usize,
    /// Raw value bytes (binary safe).
    pub val: Vec<u8>,
    /// Multipart source filename, if any.
    pub file: Option<String>,
    /// Multipart content type, if any.
    pub ctype: Option<String>,
    /// Index of the content type in the caller's MIME table, or the
    /// table length if unrecognized.
    pub ctypepos: usize,
    /// Multipart content transfer encoding, if any.
    pub xcode: Option<String>,
    /// Validation state.
    pub state: FieldState,
    /// Typed form when [`FieldState::Valid`].
    pub parsed: Parsed,
}

impl Field {
    /// The value as UTF-8, if it is UTF-8.
    pub fn value_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.val).ok()
    }

    /// The validated string payload.
    pub fn parsed_str(&self) -> Option<&str> {
        match self.parsed {
            Parsed::Str(off) => std::str::from_utf8(self.val.get(off..)?).ok(),
            _ => None,
        }
    }

    /// The validated integer payload.
    pub fn parsed_int(&self) -> Option<i64> {
        match self.parsed {
            Parsed::Int(i) => Some(i),
            _ => None,
        }
    }

    /// The validated double payload.
    pub fn parsed_double(&self) -> Option<f64> {
        match self.parsed {
            Parsed::Double(d) => Some(d),
            _ => None,
        }
    }
}

/// A registered field key with its optional validator.
///
/// A validator that accepts the field must set [`Field::parsed`]; on
/// rejection the caller clears the parsed form and marks the field
/// invalid.
pub struct FieldKey {
    /// The key name matched against parsed fields.
    pub name: &'static str,
    /// Validation predicate, or `None` to accept untyped.
    pub validate: Option<fn(&mut Field) -> bool>,
}

impl FieldKey {
    /// A key with a validator.
    pub const fn new(name: &'static str, validate: fn(&mut Field) -> bool) -> Self {
        Self {
            name,
            validate: Some(validate),
        }
    }

    /// A key that accepts any value without typing it.
    pub const fn untyped(name: &'static str) -> Self {
        Self {
            name,
            validate: None,
        }
    }
}
