//! Adversarial Property-Based Tests for the SIP Message Codec
//!
//! # Attack Plan
//!
//! 1. **Malformed Start Lines**: Wrong protocols, overflowing status codes,
//!    missing tokens, binary garbage - the parser must return errors, never
//!    panic.
//!
//! 2. **Unicode Position Confusion**: Multi-byte characters in header values
//!    must not break the slicing inside Via/address parsing.
//!
//! 3. **Header Injection via Builders**: Values interpolated into outbound
//!    messages must not open a path to extra headers when the inputs are
//!    ordinary identifiers.
//!
//! 4. **Truncated and Oversized Messages**: Datagrams cut anywhere, or with
//!    bodies much longer than Content-Length claims.
//!
//! 5. **Via Parameter Soup**: rport with and without values, unknown
//!    parameters, IPv6 brackets, missing ports.
//!
//! # Invariants
//!
//! - SipMessage::parse never panics on any input
//! - Parsed status codes come from the start line verbatim
//! - Builders always emit ASCII with exact Content-Length
//! - Messages missing a primary header are rejected, not half-parsed

use proptest::prelude::*;

use sipline::sip::message::{peek_status, split_host_port, SipMessage};
use sipline::sip::messages::{InviteParams, MessageFactory, RegisterParams};
use sipline::sip::TransmitMode;

fn factory() -> MessageFactory {
    MessageFactory::new("alice", "example.net", "10.0.0.1", 5060, "UUID-1")
}

// ============================================================================
// ADVERSARIAL GENERATORS
// ============================================================================

/// Strings aimed at the start-line parser
fn malformed_start_line() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("".to_string()),
        Just("SIP/2.0".to_string()),
        Just("SIP/2.0 ".to_string()),
        Just("200 OK".to_string()),
        Just("SIP/2.0 99999 Overflow".to_string()),
        Just("SIP/2.0 -1 Negative".to_string()),
        Just("SIP/2.0 abc NotANumber".to_string()),
        Just("SIP/2.0 12.5 Float".to_string()),
        Just("HTTP/1.1 200 OK".to_string()),
        Just("SIP/1.0 200 OK".to_string()),
        Just("sip/2.0 200 OK".to_string()),
        Just("INVITE".to_string()),
        Just("INVITE sip:a@h".to_string()),
        Just("INVITE sip:a@h HTTP/1.1".to_string()),
        Just("UNKNOWN sip:a@h SIP/2.0".to_string()),
        Just("SIP/2.0\t200\tOK".to_string()),
        Just("  SIP/2.0 200 OK".to_string()),
        Just("SIP/2.0 ２００ OK".to_string()),
        Just(format!("SIP/2.0 200 {}", "O".repeat(10000))),
    ]
}

/// Header values with multi-byte and control characters
fn hostile_header_value() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("İBM;tag=İ".to_string()),
        Just("ß<sip:ß@ß>".to_string()),
        Just("\u{200B}<sip:a@h>".to_string()),
        Just("\u{202E}reversed".to_string()),
        Just("日本語".repeat(100)),
        Just("a\tb".to_string()),
        Just(";;;;;;".to_string()),
        Just("=====".to_string()),
        "[ -~]{0,200}",
    ]
}

// ============================================================================
// PARSER PROPERTIES
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(512))]

    /// The parser survives arbitrary bytes
    #[test]
    fn parse_arbitrary_bytes_never_panics(data in proptest::collection::vec(any::<u8>(), 0..4096)) {
        let _ = SipMessage::parse(&data);
    }

    /// The parser survives malformed start lines with plausible headers
    #[test]
    fn parse_malformed_start_lines(start in malformed_start_line()) {
        let message = format!(
            "{}\r\nVia: SIP/2.0/UDP 10.0.0.1:5060\r\nFrom: <sip:a@h>;tag=t\r\n\
             To: <sip:b@h>\r\nCall-ID: x\r\nCSeq: 1 INVITE\r\nContent-Length: 0\r\n\r\n",
            start
        );
        let _ = SipMessage::parse(message.as_bytes());
    }

    /// Hostile header values never panic the per-header parsers
    #[test]
    fn parse_hostile_header_values(value in hostile_header_value()) {
        for name in ["Via", "From", "To", "Contact", "CSeq", "Event", "WWW-Authenticate"] {
            let message = format!(
                "SIP/2.0 200 OK\r\nVia: SIP/2.0/UDP 10.0.0.1:5060\r\nFrom: <sip:a@h>;tag=t\r\n\
                 To: <sip:b@h>\r\nCall-ID: x\r\nCSeq: 1 INVITE\r\n{}: {}\r\nContent-Length: 0\r\n\r\n",
                name, value
            );
            let _ = SipMessage::parse(message.as_bytes());
        }
    }

    /// Messages truncated at any byte never panic
    #[test]
    fn parse_truncated_messages(cut in 0usize..400) {
        let message: &[u8] = b"INVITE sip:bob@example.net SIP/2.0\r\n\
            Via: SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bKx;rport\r\n\
            From: \"Alice\" <sip:alice@example.net>;tag=ft\r\n\
            To: <sip:bob@example.net>\r\n\
            Call-ID: abc@10.0.0.1:5060\r\n\
            CSeq: 1 INVITE\r\n\
            Content-Type: application/sdp\r\n\
            Content-Length: 4\r\n\r\nv=0\r\n";
        let cut = cut.min(message.len());
        let _ = SipMessage::parse(&message[..cut]);
    }

    /// Valid status codes parse verbatim; peek agrees with full parse
    #[test]
    fn status_codes_roundtrip(code in 100u16..700u16) {
        let message = format!(
            "SIP/2.0 {} Something\r\nVia: SIP/2.0/UDP 10.0.0.1:5060\r\nFrom: <sip:a@h>;tag=t\r\n\
             To: <sip:b@h>\r\nCall-ID: x\r\nCSeq: 1 INVITE\r\nContent-Length: 0\r\n\r\n",
            code
        );
        let parsed = SipMessage::parse(message.as_bytes()).unwrap();
        prop_assert_eq!(parsed.status(), Some(code));
        prop_assert_eq!(peek_status(message.as_bytes()), Some(code));
    }

    /// split_host_port never panics and respects the 5060 default
    #[test]
    fn host_port_never_panics(input in "[ -~]{0,64}") {
        if let Ok((_, port)) = split_host_port(&input) {
            if !input.contains(':') {
                prop_assert_eq!(port, 5060);
            }
        }
    }

    /// Via parameter soup: rport variants and unknown params survive
    #[test]
    fn via_parameter_soup(
        rport in prop_oneof![
            Just("".to_string()),
            Just(";rport".to_string()),
            Just(";rport=40001".to_string()),
            Just(";rport=notaport".to_string()),
        ],
        extra in "[a-z0-9=;]{0,32}",
    ) {
        let message = format!(
            "SIP/2.0 200 OK\r\nVia: SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bKx{}{}\r\n\
             From: <sip:a@h>;tag=t\r\nTo: <sip:b@h>\r\nCall-ID: x\r\nCSeq: 1 INVITE\r\n\
             Content-Length: 0\r\n\r\n",
            rport, extra
        );
        let _ = SipMessage::parse(message.as_bytes());
    }
}

// ============================================================================
// BUILDER PROPERTIES
// ============================================================================

proptest! {
    /// Builders emit pure ASCII with CRLF terminators for ordinary inputs
    #[test]
    fn register_always_ascii_crlf(
        cseq in 1u32..100000u32,
        port in 1024u16..65535u16,
        expires in 0u32..86400u32,
    ) {
        let request = factory().register(&RegisterParams {
            branch: "z9hG4bKbranch",
            call_id: "cid@10.0.0.1:5060",
            cseq,
            tag: "regtag00",
            expires,
            contact_ip: "10.0.0.1",
            contact_port: port,
            authorization: None,
        });
        prop_assert!(request.is_ascii());
        prop_assert!(request.ends_with("\r\n\r\n"));
        prop_assert_eq!(request.matches("Content-Length:").count(), 1);
    }

    /// INVITE Content-Length is the exact body byte count for any offer
    #[test]
    fn invite_content_length_always_exact(
        port in 1024u16..65000u16,
        session_id in 1u32..1000000u32,
        number in "[0-9]{3,12}",
    ) {
        let media = sipline::rtp::default_offer(port);
        let request = factory().invite(&InviteParams {
            number: &number,
            session_id,
            media: &media,
            mode: TransmitMode::SendRecv,
            branch: "z9hG4bKb",
            call_id: "c",
            tag: "t",
            cseq: 1,
            contact_ip: "10.0.0.1",
            contact_port: 5060,
            authorization: None,
        });

        let body = request.split("\r\n\r\n").nth(1).unwrap();
        let declared: usize = request
            .lines()
            .find(|l| l.starts_with("Content-Length:"))
            .and_then(|l| l.split(": ").nth(1))
            .and_then(|v| v.parse().ok())
            .unwrap();
        prop_assert_eq!(declared, body.len());

        // And the result parses back through the codec
        let parsed = SipMessage::parse(request.as_bytes()).unwrap();
        prop_assert_eq!(parsed.cseq(), Some((1u32, "INVITE")));
        prop_assert!(parsed.body.is_some());
    }

    /// Ordinary identifiers cannot smuggle extra headers into a REGISTER
    #[test]
    fn no_header_injection_from_identifiers(tag in "[a-f0-9]{8}", call_id in "[a-f0-9@.:]{1,64}") {
        let request = factory().register(&RegisterParams {
            branch: "z9hG4bKb",
            call_id: &call_id,
            cseq: 1,
            tag: &tag,
            expires: 120,
            contact_ip: "10.0.0.1",
            contact_port: 5060,
            authorization: None,
        });
        // Exactly one of each primary header
        for header in ["Via:", "From:", "To:", "Call-ID:", "CSeq:"] {
            prop_assert_eq!(request.matches(header).count(), 1, "{} duplicated", header);
        }
    }
}

// ============================================================================
// TARGETED REGRESSIONS
// ============================================================================

#[test]
fn empty_datagram_is_an_error() {
    assert!(SipMessage::parse(b"").is_err());
    assert!(SipMessage::parse(b"\r\n\r\n").is_err());
}

#[test]
fn null_bytes_do_not_panic() {
    assert!(SipMessage::parse(b"\x00\x00\x00\x00").is_err());
    let _ = SipMessage::parse(b"INVITE sip:a\x00@h SIP/2.0\r\n\r\n");
}

#[test]
fn primary_header_missing_is_rejected() {
    // No From
    let message = b"SIP/2.0 200 OK\r\n\
        Via: SIP/2.0/UDP 10.0.0.1:5060\r\n\
        To: <sip:b@h>\r\n\
        Call-ID: x\r\n\
        CSeq: 1 INVITE\r\n\
        Content-Length: 0\r\n\r\n";
    assert!(matches!(
        SipMessage::parse(message),
        Err(sipline::ParseError::MissingHeader("From"))
    ));
}

#[test]
fn content_length_overflow_is_an_error_not_a_panic() {
    let message = b"SIP/2.0 200 OK\r\n\
        Via: SIP/2.0/UDP 10.0.0.1:5060\r\n\
        From: <sip:a@h>;tag=t\r\n\
        To: <sip:b@h>\r\n\
        Call-ID: x\r\n\
        CSeq: 1 INVITE\r\n\
        Content-Length: 99999999999999999999999999\r\n\r\n";
    assert!(SipMessage::parse(message).is_err());
}

#[test]
fn folded_header_lines_are_rejected_cleanly() {
    let message = b"SIP/2.0 200 OK\r\n\
        Via: SIP/2.0/UDP 10.0.0.1:5060\r\n\
        Subject: first\r\n continued\r\n\
        From: <sip:a@h>;tag=t\r\n\
        To: <sip:b@h>\r\n\
        Call-ID: x\r\n\
        CSeq: 1 INVITE\r\n\
        Content-Length: 0\r\n\r\n";
    // Folding is not supported; the continuation line has no name-value
    // separator and fails the parse without panicking
    assert!(SipMessage::parse(message).is_err());
}
