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

//! Built-in field validators.
//!
//! Each validator inspects the raw value and, on success, fills in the
//! typed form.  They run inside the sandboxed worker, so a validator
//! must never touch anything but the field it was handed.

use crate::field::{Field, Parsed};

/// Leading/trailing ASCII whitespace range of a value.
fn trimmed(val: &[u8]) -> (usize, usize) {
    let mut start = 0;
    let mut end = val.len();
    while start < end && val[start].is_ascii_whitespace() {
        start += 1;
    }
    while end > start && val[end - 1].is_ascii_whitespace() {
        end -= 1;
    }
    (start, end)
}

fn trimmed_str(field: &Field) -> Option<&str> {
    let (start, end) = trimmed(&field.val);
    std::str::from_utf8(&field.val[start..end]).ok()
}

/// Possibly-empty UTF-8 string.
pub fn valid_string(field: &mut Field) -> bool {
    if std::str::from_utf8(&field.val).is_err() {
        return false;
    }
    field.parsed = Parsed::Str(0);
    true
}

/// Non-empty UTF-8 string.
pub fn valid_stringne(field: &mut Field) -> bool {
    !field.val.is_empty() && valid_string(field)
}

/// Signed 64-bit integer, surrounding whitespace tolerated.
pub fn valid_int(field: &mut Field) -> bool {
    let Some(s) = trimmed_str(field) else {
        return false;
    };
    match s.parse::<i64>() {
        Ok(i) => {
            field.parsed = Parsed::Int(i);
            true
        }
        Err(_) => false,
    }
}

/// Unsigned integer (still carried as `i64`, so at most `i64::MAX`).
pub fn valid_uint(field: &mut Field) -> bool {
    valid_int(field) && field.parsed_int().is_some_and(|i| i >= 0)
}

/// Bit index: an unsigned integer no greater than 64.
pub fn valid_bit(field: &mut Field) -> bool {
    valid_uint(field) && field.parsed_int().is_some_and(|i| i <= 64)
}

/// Finite double, surrounding whitespace tolerated.
pub fn valid_double(field: &mut Field) -> bool {
    let Some(s) = trimmed_str(field) else {
        return false;
    };
    if s.is_empty() {
        return false;
    }
    match s.parse::<f64>() {
        Ok(d) if d.is_finite() => {
            field.parsed = Parsed::Double(d);
            true
        }
        _ => false,
    }
}

/// Double strictly greater than zero.
pub fn valid_udouble(field: &mut Field) -> bool {
    valid_double(field) && field.parsed_double().is_some_and(|d| d > 0.0)
}

/// Days from the civil epoch 1970-01-01 (proleptic Gregorian).
fn days_from_civil(y: i64, m: i64, d: i64) -> i64 {
    let y = if m <= 2 { y - 1 } else { y };
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = y - era * 400;
    let doy = (153 * (if m > 2 { m - 3 } else { m + 9 }) + 2) / 5 + d - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146097 + doe - 719468
}

fn date_check(year: i64, mon: i64, mday: i64) -> bool {
    const MDAYS: [i64; 12] = [31, 28, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31];
    if !(1..=12).contains(&mon) || mday < 1 {
        return false;
    }
    let leap = year % 4 == 0 && (year % 100 != 0 || year % 400 == 0);
    let max = if mon == 2 && leap {
        29
    } else {
        MDAYS[(mon - 1) as usize]
    };
    mday <= max
}

/// ISO date `YYYY-MM-DD`, calendar-correct; parses to the Unix epoch
/// second of its midnight.
pub fn valid_date(field: &mut Field) -> bool {
    let v = &field.val;
    if v.len() != 10 || v[4] != b'-' || v[7] != b'-' {
        return false;
    }
    for i in [0, 1, 2, 3, 5, 6, 8, 9] {
        if !v[i].is_ascii_digit() {
            return false;
        }
    }
    let num = |r: std::ops::Range<usize>| -> i64 {
        std::str::from_utf8(&v[r]).unwrap().parse().unwrap()
    };
    let (year, mon, mday) = (num(0..4), num(5..7), num(8..10));
    if !date_check(year, mon, mday) {
        return false;
    }
    field.parsed = Parsed::Int(days_from_civil(year, mon, mday) * 86400);
    true
}

/// Heuristic email address check, not a full RFC 5322 parser.
///
/// Accepts a total length of 5 to 254 characters, a local part of 1 to
/// 64 characters over the usual atom set, and a domain of 4 to 254
/// characters over `[A-Za-z0-9.-]`.  The stored value is rewritten to
/// its trimmed, lowercased form.
pub fn valid_email(field: &mut Field) -> bool {
    const LOCAL_EXTRA: &[u8] = b"!#$%&'*+-/=?^_`{|}~.";

    let (start, end) = trimmed(&field.val);
    let cp = &field.val[start..end];

    if cp.len() < 5 || cp.len() > 254 {
        return false;
    }
    let Some(at) = cp.iter().position(|&b| b == b'@') else {
        return false;
    };
    if at < 1 || at > 64 {
        return false;
    }
    if !cp[..at]
        .iter()
        .all(|&b| b.is_ascii_alphanumeric() || LOCAL_EXTRA.contains(&b))
    {
        return false;
    }
    let domain = &cp[at + 1..];
    if domain.len() < 4 || domain.len() > 254 {
        return false;
    }
    if !domain
        .iter()
        .all(|&b| b.is_ascii_alphanumeric() || b == b'-' || b == b'.')
    {
        return false;
    }

    let lowered: Vec<u8> = cp.iter().map(u8::to_ascii_lowercase).collect();
    field.val = lowered;
    field.parsed = Parsed::Str(0);
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(val: &[u8]) -> Field {
        Field {
            val: val.to_vec(),
            ..Field::default()
        }
    }

    #[test]
    fn ints() {
        let mut f = field(b" -42 ");
        assert!(valid_int(&mut f));
        assert_eq!(f.parsed_int(), Some(-42));

        assert!(!valid_int(&mut field(b"12x")));
        assert!(!valid_uint(&mut field(b"-1")));
        assert!(valid_bit(&mut field(b"64")));
        assert!(!valid_bit(&mut field(b"65")));
    }

    #[test]
    fn doubles() {
        let mut f = field(b"3.25");
        assert!(valid_double(&mut f));
        assert_eq!(f.parsed_double(), Some(3.25));
        assert!(!valid_double(&mut field(b"")));
        assert!(!valid_double(&mut field(b"1e999")));
        assert!(!valid_udouble(&mut field(b"-0.5")));
    }

    #[test]
    fn dates() {
        let mut f = field(b"2004-02-29");
        assert!(valid_date(&mut f));
        assert_eq!(f.parsed_int(), Some(1078012800));

        let mut f = field(b"1970-01-01");
        assert!(valid_date(&mut f));
        assert_eq!(f.parsed_int(), Some(0));

        assert!(!valid_date(&mut field(b"2003-02-29")));
        assert!(!valid_date(&mut field(b"2020-13-01")));
        assert!(!valid_date(&mut field(b"2020-1-01")));
    }

    #[test]
    fn strings() {
        let mut f = field(b"hi");
        assert!(valid_stringne(&mut f));
        assert_eq!(f.parsed_str(), Some("hi"));
        assert!(!valid_stringne(&mut field(b"")));
        assert!(valid_string(&mut field(b"")));
        assert!(!valid_string(&mut field(&[0xff, 0xfe])));
    }

    #[test]
    fn emails() {
        let mut f = field(b"  John.Doe@Example.COM ");
        assert!(valid_email(&mut f));
        assert_eq!(f.parsed_str(), Some("john.doe@example.com"));

        assert!(!valid_email(&mut field(b"a@b")));
        assert!(!valid_email(&mut field(b"no-at-sign.example.com")));
        assert!(!valid_email(&mut field(b"sp ace@example.com")));
    }
}
