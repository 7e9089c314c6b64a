mod common;

use sepcgi::url::{urldecode, urlencode};

#[test]
fn decode_basics() {
    common::setup();

    assert_eq!(urldecode("%4e+foo").unwrap(), b"N foo");
    assert_eq!(urldecode("plain").unwrap(), b"plain");
    assert_eq!(urldecode("a%2fb%2Fc").unwrap(), b"a/b/c");
}

#[test]
fn decode_refuses_embedded_nul() {
    common::setup();

    // %00 would let a decoded value smuggle a string terminator past
    // downstream consumers.
    assert!(urldecode("abc%00def").is_err());
    assert!(urldecode("%00").is_err());
}

#[test]
fn decode_refuses_malformed_escapes() {
    common::setup();

    assert!(urldecode("%").is_err());
    assert!(urldecode("%a").is_err());
    assert!(urldecode("%gg").is_err());
    assert!(urldecode("ok%1").is_err());
}

#[test]
fn encode_is_reversible() {
    common::setup();

    // For any input free of '%' and '+', decoding the encoding gives
    // the input back.
    for s in [
        "hello world",
        "key=value&other;more",
        "päth/tö/thing",
        "~tilde_und.dash-",
        "",
    ] {
        assert_eq!(urldecode(&urlencode(s)).unwrap(), s.as_bytes());
    }
}

#[test]
fn encode_escapes_reserved() {
    common::setup();

    assert_eq!(urlencode("a b"), "a+b");
    assert_eq!(urlencode("a&b=c"), "a%26b%3dc");
    assert_eq!(urlencode("safe-._~AZaz09"), "safe-._~AZaz09");
}
