mod common;

use sepcgi::auth::{AuthData, HttpAlg, HttpQop, parse_authorization};

#[test]
fn no_header_no_auth() {
    common::setup();

    let auth = parse_authorization(None);
    assert!(!auth.authorised);
    assert!(matches!(auth.data, AuthData::None));

    let auth = parse_authorization(Some(""));
    assert!(matches!(auth.data, AuthData::None));
}

#[test]
fn basic_scheme_case_insensitive() {
    common::setup();

    for header in ["Basic Zm9vOmJhcg==", "basic Zm9vOmJhcg==", "BASIC Zm9vOmJhcg=="] {
        let auth = parse_authorization(Some(header));
        assert!(auth.authorised, "{header}");
        let AuthData::Basic { response } = auth.data else {
            panic!("not basic for {header}");
        };
        assert_eq!(response, "Zm9vOmJhcg==");
    }
}

#[test]
fn digest_minimum_components() {
    common::setup();

    // All five required directives present: authorised.
    let auth = parse_authorization(Some(
        "Digest username=\"u\", realm=\"r\", nonce=\"n\", uri=\"/p\", response=\"x\"",
    ));
    assert!(auth.authorised);

    // Each one missing in turn: not authorised.
    for broken in [
        "Digest realm=\"r\", nonce=\"n\", uri=\"/p\", response=\"x\"",
        "Digest username=\"u\", nonce=\"n\", uri=\"/p\", response=\"x\"",
        "Digest username=\"u\", realm=\"r\", uri=\"/p\", response=\"x\"",
        "Digest username=\"u\", realm=\"r\", nonce=\"n\", response=\"x\"",
        "Digest username=\"u\", realm=\"r\", nonce=\"n\", uri=\"/p\"",
    ] {
        assert!(!parse_authorization(Some(broken)).authorised, "{broken}");
    }
}

#[test]
fn digest_directives_parse() {
    common::setup();

    let auth = parse_authorization(Some(
        "Digest username=\"jane\", realm=\"wally world\", \
         nonce=\"abc\", cnonce=\"def\", uri=\"/index\", \
         response=\"123abc\", algorithm=MD5-sess, qop=auth, \
         nc=0000000a, opaque=\"tok\", unknown=\"skipped\"",
    ));
    let AuthData::Digest(d) = &auth.data else {
        panic!("not digest");
    };
    assert_eq!(d.user, "jane");
    assert_eq!(d.realm, "wally world");
    assert_eq!(d.alg, HttpAlg::Md5Sess);
    assert_eq!(d.qop, HttpQop::Auth);
    assert_eq!(d.count, 10);
    assert_eq!(d.opaque, "tok");
    assert!(auth.authorised);
}

#[test]
fn md5_sess_needs_cnonce() {
    common::setup();

    let auth = parse_authorization(Some(
        "Digest username=\"u\", realm=\"r\", nonce=\"n\", uri=\"/p\", \
         response=\"x\", algorithm=MD5-sess",
    ));
    assert!(!auth.authorised);
}

#[test]
fn unknown_scheme_is_carried() {
    common::setup();

    let auth = parse_authorization(Some("Bearer abcdef"));
    assert!(matches!(auth.data, AuthData::Unknown));
    assert!(!auth.authorised);
}
