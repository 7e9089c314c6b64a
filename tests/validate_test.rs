mod common;

use sepcgi::{
    Field,
    env::http_header_name,
    validate::{valid_bit, valid_date, valid_email, valid_int, valid_string, valid_uint},
};

fn field(val: &[u8]) -> Field {
    Field {
        val: val.to_vec(),
        ..Field::default()
    }
}

#[test]
fn integers_and_bits() {
    common::setup();

    let mut f = field(b"9223372036854775807");
    assert!(valid_int(&mut f));
    assert_eq!(f.parsed_int(), Some(i64::MAX));

    assert!(!valid_int(&mut field(b"9223372036854775808")));
    assert!(!valid_uint(&mut field(b"-3")));
    assert!(valid_bit(&mut field(b"0")));
    assert!(!valid_bit(&mut field(b"65")));
}

#[test]
fn calendar_correct_dates() {
    common::setup();

    let mut f = field(b"2000-02-29");
    assert!(valid_date(&mut f));

    // Not a leap year: centuries need division by 400.
    assert!(!valid_date(&mut field(b"1900-02-29")));
    assert!(!valid_date(&mut field(b"2021-04-31")));
    assert!(!valid_date(&mut field(b"2021-00-10")));

    let mut f = field(b"2038-01-19");
    assert!(valid_date(&mut f));
    assert_eq!(f.parsed_int(), Some(2147472000));
}

#[test]
fn emails_lowercase_in_place() {
    common::setup();

    let mut f = field(b"Admin+Tag@Example.ORG");
    assert!(valid_email(&mut f));
    assert_eq!(f.parsed_str(), Some("admin+tag@example.org"));
    assert_eq!(f.val, b"admin+tag@example.org");

    // Length bounds: total 5..=254, local 1..=64, domain 4..=254.
    assert!(!valid_email(&mut field(b"a@bc")));
    let long_local = [b"x".repeat(65), b"@example.org".to_vec()].concat();
    assert!(!valid_email(&mut field(&long_local)));
}

#[test]
fn binary_values_fail_string_validators() {
    common::setup();

    let mut f = field(&[0x80, 0x81]);
    assert!(!valid_string(&mut f));
}

#[test]
fn header_name_reconstruction() {
    common::setup();

    assert_eq!(http_header_name("IF_NONE_MATCH"), "If-None-Match");
    assert_eq!(http_header_name("X_FORWARDED_FOR"), "X-Forwarded-For");

    // Round-tripping a legally produced name through the CGI mangling
    // is idempotent.
    let name = http_header_name("SOME_ODD_HEADER");
    let cgi_again = name.to_ascii_uppercase().replace('-', "_");
    assert_eq!(http_header_name(&cgi_again), name);
}
