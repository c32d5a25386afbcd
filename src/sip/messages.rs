/// SIP message building utilities
/// Reference: RFC 3261 - SIP: Session Initiation Protocol
///
/// Every outbound message kind the client sends is built here, CRLF
/// terminated with an exact Content-Length. Header order is fixed per
/// message kind so captures stay reproducible.

use crate::error::ParseError;
use crate::rtp::{MediaMap, PayloadKind};
use crate::sip::message::{Rport, SipMessage};
use crate::sip::sdp::TransmitMode;
use crate::USER_AGENT;

/// Methods advertised in Allow headers.
pub const ALLOWED_METHODS: &str = "INVITE, ACK, BYE, CANCEL, NOTIFY";

/// Identity shared by all builders of one client.
#[derive(Debug, Clone)]
pub struct MessageFactory {
    username: String,
    server: String,
    local_ip: String,
    local_port: u16,
    urn_uuid: String,
}

pub struct RegisterParams<'a> {
    pub branch: &'a str,
    pub call_id: &'a str,
    pub cseq: u32,
    pub tag: &'a str,
    pub expires: u32,
    pub contact_ip: &'a str,
    pub contact_port: u16,
    pub authorization: Option<&'a str>,
}

pub struct SubscribeParams<'a> {
    pub branch: &'a str,
    pub call_id: &'a str,
    pub cseq: u32,
    pub tag: &'a str,
    pub expires: u32,
    pub contact_ip: &'a str,
    pub contact_port: u16,
}

pub struct InviteParams<'a> {
    pub number: &'a str,
    pub session_id: u32,
    pub media: &'a MediaMap,
    pub mode: TransmitMode,
    pub branch: &'a str,
    pub call_id: &'a str,
    pub tag: &'a str,
    pub cseq: u32,
    pub contact_ip: &'a str,
    pub contact_port: u16,
    pub authorization: Option<&'a str>,
}

impl MessageFactory {
    pub fn new(
        username: &str,
        server: &str,
        local_ip: &str,
        local_port: u16,
        urn_uuid: &str,
    ) -> Self {
        Self {
            username: username.to_string(),
            server: server.to_string(),
            local_ip: local_ip.to_string(),
            local_port,
            urn_uuid: urn_uuid.to_string(),
        }
    }

    fn via_line(&self, branch: &str) -> String {
        format!(
            "Via: SIP/2.0/UDP {}:{};branch={};rport\r\n",
            host_for_wire(&self.local_ip),
            self.local_port,
            branch
        )
    }

    fn account_address(&self) -> String {
        format!("sip:{}@{}", self.username, self.server)
    }

    fn instance_contact(&self, contact_ip: &str, contact_port: u16) -> String {
        format!(
            "Contact: <sip:{}@{}:{};transport=UDP>;+sip.instance=\"<urn:uuid:{}>\"\r\n",
            self.username,
            host_for_wire(contact_ip),
            contact_port,
            self.urn_uuid
        )
    }

    /// REGISTER request; `expires` of 0 deregisters, `authorization`
    /// carries digest credentials on the 401 retry.
    pub fn register(&self, p: &RegisterParams) -> String {
        let mut request = format!("REGISTER sip:{} SIP/2.0\r\n", self.server);
        request += &self.via_line(p.branch);
        request += &format!(
            "From: \"{}\" <{}>;tag={}\r\n",
            self.username,
            self.account_address(),
            p.tag
        );
        request += &format!("To: \"{}\" <{}>\r\n", self.username, self.account_address());
        request += &format!("Call-ID: {}\r\n", p.call_id);
        request += &format!("CSeq: {} REGISTER\r\n", p.cseq);
        request += &self.instance_contact(p.contact_ip, p.contact_port);
        request += &format!("Allow: {}\r\n", ALLOWED_METHODS);
        request += "Max-Forwards: 70\r\n";
        request += "Allow-Events: org.3gpp.nwinitdereg\r\n";
        request += &format!("User-Agent: {}\r\n", USER_AGENT);
        request += &format!("Expires: {}\r\n", p.expires);
        if let Some(auth) = p.authorization {
            request += &format!("Authorization: {}\r\n", auth);
        }
        request += "Content-Length: 0\r\n\r\n";
        request
    }

    /// One-shot SUBSCRIBE for voicemail-style message-summary events.
    pub fn subscribe(&self, p: &SubscribeParams) -> String {
        let mut request = format!("SUBSCRIBE {} SIP/2.0\r\n", self.account_address());
        request += &self.via_line(p.branch);
        request += &format!(
            "From: \"{}\" <{}>;tag={}\r\n",
            self.username,
            self.account_address(),
            p.tag
        );
        request += &format!("To: <{}>\r\n", self.account_address());
        request += &format!("Call-ID: {}\r\n", p.call_id);
        request += &format!("CSeq: {} SUBSCRIBE\r\n", p.cseq);
        request += &self.instance_contact(p.contact_ip, p.contact_port);
        request += "Max-Forwards: 70\r\n";
        request += &format!("User-Agent: {}\r\n", USER_AGENT);
        request += &format!("Expires: {}\r\n", p.expires);
        request += "Event: message-summary\r\n";
        request += "Accept: application/simple-message-summary\r\n";
        request += "Content-Length: 0\r\n\r\n";
        request
    }

    /// INVITE with SDP offer. The Authorization header, when present,
    /// sits immediately before Content-Length.
    pub fn invite(&self, p: &InviteParams) -> String {
        let body = self.sdp_body(p.session_id, p.media, p.mode, p.contact_ip);

        let mut request = format!("INVITE sip:{}@{} SIP/2.0\r\n", p.number, self.server);
        request += &format!(
            "Via: SIP/2.0/UDP {}:{};branch={}\r\n",
            host_for_wire(&self.local_ip),
            self.local_port,
            p.branch
        );
        request += "Max-Forwards: 70\r\n";
        request += &format!(
            "Contact: <sip:{}@{}:{}>\r\n",
            self.username,
            host_for_wire(p.contact_ip),
            p.contact_port
        );
        request += &format!("To: <sip:{}@{}>\r\n", p.number, self.server);
        request += &format!(
            "From: <sip:{}@{}>;tag={}\r\n",
            self.username,
            host_for_wire(&self.local_ip),
            p.tag
        );
        request += &format!("Call-ID: {}\r\n", p.call_id);
        request += &format!("CSeq: {} INVITE\r\n", p.cseq);
        request += &format!("Allow: {}\r\n", ALLOWED_METHODS);
        request += "Content-Type: application/sdp\r\n";
        request += &format!("User-Agent: {}\r\n", USER_AGENT);
        if let Some(auth) = p.authorization {
            request += &format!("Authorization: {}\r\n", auth);
        }
        request += &format!("Content-Length: {}\r\n\r\n", body.len());
        request += &body;
        request
    }

    /// ACK for a final response, echoing the response's Via stack and
    /// remote tag.
    pub fn ack(&self, response: &SipMessage, local_tag: &str) -> Result<String, ParseError> {
        let to = response
            .to_header()
            .ok_or(ParseError::MissingHeader("To"))?;
        let from = response
            .from_header()
            .ok_or(ParseError::MissingHeader("From"))?;
        let call_id = response
            .call_id()
            .ok_or(ParseError::MissingHeader("Call-ID"))?;
        let (cseq, _) = response.cseq().ok_or(ParseError::MissingHeader("CSeq"))?;

        let mut request = format!("ACK {} SIP/2.0\r\n", to.uri);
        request += &response_via(response);
        request += "Max-Forwards: 70\r\n";
        request += &format!("To: {}{}\r\n", to.raw, tag_suffix(to.tag.as_deref()));
        request += &format!("From: {};tag={}\r\n", from.raw, local_tag);
        request += &format!("Call-ID: {}\r\n", call_id);
        request += &format!("CSeq: {} ACK\r\n", cseq);
        request += &format!("User-Agent: {}\r\n", USER_AGENT);
        request += "Content-Length: 0\r\n\r\n";
        Ok(request)
    }

    /// In-dialog BYE built from the last message seen on the dialog.
    /// From/To orientation depends on which side the stored message
    /// came from.
    pub fn bye(
        &self,
        last: &SipMessage,
        local_tag: &str,
        contact_ip: &str,
        contact_port: u16,
    ) -> Result<String, ParseError> {
        let from = last.from_header().ok_or(ParseError::MissingHeader("From"))?;
        let to = last.to_header().ok_or(ParseError::MissingHeader("To"))?;
        let call_id = last.call_id().ok_or(ParseError::MissingHeader("Call-ID"))?;
        let (cseq, _) = last.cseq().ok_or(ParseError::MissingHeader("CSeq"))?;

        let we_are_from = from.tag.as_deref() == Some(local_tag);
        let target = match last.contact() {
            Some(contact) => contact.uri.clone(),
            None if we_are_from => to.uri.clone(),
            None => from.uri.clone(),
        };

        let mut request = format!("BYE {} SIP/2.0\r\n", target);
        request += &response_via(last);
        if we_are_from {
            request += &format!("From: {};tag={}\r\n", from.raw, local_tag);
            request += &format!("To: {}{}\r\n", to.raw, tag_suffix(to.tag.as_deref()));
        } else {
            request += &format!("To: {}{}\r\n", from.raw, tag_suffix(from.tag.as_deref()));
            request += &format!("From: {};tag={}\r\n", to.raw, local_tag);
        }
        request += &format!("Call-ID: {}\r\n", call_id);
        request += &format!("CSeq: {} BYE\r\n", cseq + 1);
        request += &format!(
            "Contact: <sip:{}@{}:{}>\r\n",
            self.username,
            host_for_wire(contact_ip),
            contact_port
        );
        request += &format!("User-Agent: {}\r\n", USER_AGENT);
        request += &format!("Allow: {}\r\n", ALLOWED_METHODS);
        request += "Content-Length: 0\r\n\r\n";
        Ok(request)
    }

    /// 180 Ringing for an inbound INVITE. `tag` becomes our dialog tag.
    pub fn ringing(&self, request: &SipMessage, tag: &str) -> Result<String, ParseError> {
        self.simple_response(request, "180 Ringing", tag, true)
    }

    /// 200 OK without body, for BYE and CANCEL requests.
    pub fn ok(&self, request: &SipMessage, tag: &str) -> Result<String, ParseError> {
        let from = request.from_header().ok_or(ParseError::MissingHeader("From"))?;
        let to = request.to_header().ok_or(ParseError::MissingHeader("To"))?;
        let call_id = request.call_id().ok_or(ParseError::MissingHeader("Call-ID"))?;
        let (cseq, method) = request.cseq().ok_or(ParseError::MissingHeader("CSeq"))?;

        let mut response = "SIP/2.0 200 OK\r\n".to_string();
        response += &response_via(request);
        response += &format!("From: {}{}\r\n", from.raw, tag_suffix(from.tag.as_deref()));
        response += &format!("To: {};tag={}\r\n", to.raw, tag);
        response += &format!("Call-ID: {}\r\n", call_id);
        response += &format!("CSeq: {} {}\r\n", cseq, method);
        response += &format!("User-Agent: {}\r\n", USER_AGENT);
        response += &format!("Allow: {}\r\n", ALLOWED_METHODS);
        response += "Content-Length: 0\r\n\r\n";
        Ok(response)
    }

    /// 200 OK acknowledging a NOTIFY, echoing its Event with the CSeq
    /// advanced by one.
    pub fn notify_ok(&self, request: &SipMessage) -> Result<String, ParseError> {
        let from = request.from_header().ok_or(ParseError::MissingHeader("From"))?;
        let to = request.to_header().ok_or(ParseError::MissingHeader("To"))?;
        let call_id = request.call_id().ok_or(ParseError::MissingHeader("Call-ID"))?;
        let (cseq, method) = request.cseq().ok_or(ParseError::MissingHeader("CSeq"))?;
        let event = request.event().unwrap_or_default();

        let mut response = "SIP/2.0 200 OK\r\n".to_string();
        response += &response_via(request);
        response += &format!("To: {}{}\r\n", to.raw, tag_suffix(to.tag.as_deref()));
        response += &format!("From: {}{}\r\n", from.raw, tag_suffix(from.tag.as_deref()));
        response += &format!("Call-ID: {}\r\n", call_id);
        response += &format!("CSeq: {} {}\r\n", cseq + 1, method);
        response += &format!("Event: {}\r\n", event);
        response += "Content-Length: 0\r\n\r\n";
        Ok(response)
    }

    /// 200 OK answering an INVITE with an SDP answer.
    pub fn answer_ok(
        &self,
        request: &SipMessage,
        tag: &str,
        session_id: u32,
        media: &MediaMap,
        mode: TransmitMode,
        contact_ip: &str,
        contact_port: u16,
    ) -> Result<String, ParseError> {
        let from = request.from_header().ok_or(ParseError::MissingHeader("From"))?;
        let to = request.to_header().ok_or(ParseError::MissingHeader("To"))?;
        let call_id = request.call_id().ok_or(ParseError::MissingHeader("Call-ID"))?;
        let (cseq, method) = request.cseq().ok_or(ParseError::MissingHeader("CSeq"))?;

        let body = self.sdp_body(session_id, media, mode, contact_ip);

        let mut response = "SIP/2.0 200 OK\r\n".to_string();
        response += &response_via(request);
        response += &format!("From: {}{}\r\n", from.raw, tag_suffix(from.tag.as_deref()));
        response += &format!("To: {};tag={}\r\n", to.raw, tag);
        response += &format!("Call-ID: {}\r\n", call_id);
        response += &format!("CSeq: {} {}\r\n", cseq, method);
        response += &format!(
            "Contact: <sip:{}@{}:{}>\r\n",
            self.username,
            host_for_wire(contact_ip),
            contact_port
        );
        response += &format!("User-Agent: {}\r\n", USER_AGENT);
        response += &format!("Allow: {}\r\n", ALLOWED_METHODS);
        response += "Content-Type: application/sdp\r\n";
        response += &format!("Content-Length: {}\r\n\r\n", body.len());
        response += &body;
        Ok(response)
    }

    /// 486 Busy Here with a fresh tag; sent when no handler will take
    /// an inbound call.
    pub fn busy(&self, request: &SipMessage, tag: &str) -> Result<String, ParseError> {
        self.simple_response(request, "486 Busy Here", tag, true)
    }

    /// 487 Request Terminated for an INVITE cancelled by the peer.
    pub fn request_terminated(
        &self,
        request: &SipMessage,
        tag: &str,
    ) -> Result<String, ParseError> {
        self.simple_response(request, "487 Request Terminated", tag, false)
    }

    fn simple_response(
        &self,
        request: &SipMessage,
        status_line: &str,
        tag: &str,
        warn: bool,
    ) -> Result<String, ParseError> {
        let from = request.from_header().ok_or(ParseError::MissingHeader("From"))?;
        let to = request.to_header().ok_or(ParseError::MissingHeader("To"))?;
        let call_id = request.call_id().ok_or(ParseError::MissingHeader("Call-ID"))?;
        let (cseq, method) = request.cseq().ok_or(ParseError::MissingHeader("CSeq"))?;

        let mut response = format!("SIP/2.0 {}\r\n", status_line);
        response += &response_via(request);
        response += &format!("From: {}{}\r\n", from.raw, tag_suffix(from.tag.as_deref()));
        response += &format!("To: {};tag={}\r\n", to.raw, tag);
        response += &format!("Call-ID: {}\r\n", call_id);
        response += &format!("CSeq: {} {}\r\n", cseq, method);
        if let Some(contact) = request.contact() {
            response += &format!("Contact: {}\r\n", contact.raw);
        }
        response += &format!("User-Agent: {}\r\n", USER_AGENT);
        if warn {
            response += "Warning: 399 GS \"Unable to accept call\"\r\n";
        }
        response += &format!("Allow: {}\r\n", ALLOWED_METHODS);
        response += "Content-Length: 0\r\n\r\n";
        Ok(response)
    }

    fn sdp_body(
        &self,
        session_id: u32,
        media: &MediaMap,
        mode: TransmitMode,
        contact_ip: &str,
    ) -> String {
        let addr_type = if contact_ip.contains(':') { "IP6" } else { "IP4" };

        let mut body = "v=0\r\n".to_string();
        body += &format!(
            "o={} {} {} IN {} {}\r\n",
            self.username,
            session_id,
            session_id + 2,
            addr_type,
            contact_ip
        );
        body += &format!("s={}\r\n", USER_AGENT);
        body += &format!("c=IN {} {}\r\n", addr_type, contact_ip);
        body += "t=0 0\r\n";
        for (port, codecs) in media {
            body += &format!("m=audio {} RTP/AVP", port);
            for pt in codecs.keys() {
                body += &format!(" {}", pt);
            }
            body += "\r\n";
        }
        for codecs in media.values() {
            for (pt, kind) in codecs {
                body += &format!("a=rtpmap:{} {}/{}\r\n", pt, kind.name(), kind.rate());
                if *kind == PayloadKind::TelephoneEvent {
                    body += &format!("a=fmtp:{} 0-15\r\n", pt);
                }
            }
        }
        body += "a=ptime:20\r\n";
        body += "a=maxptime:150\r\n";
        body += &format!("a={}\r\n", mode.as_str());
        body
    }
}

/// 505 SIP Version Not Supported, built by echoing the offending
/// datagram's primary header lines verbatim; the message itself did not
/// survive parsing.
pub fn version_not_supported(raw: &str, tag: &str) -> String {
    let mut response = "SIP/2.0 505 SIP Version Not Supported\r\n".to_string();
    for line in raw.lines() {
        if line.starts_with("Via:") || line.starts_with("From:") {
            response += line;
            response += "\r\n";
        }
    }
    for line in raw.lines() {
        if line.starts_with("To:") {
            response += &format!("{};tag={}\r\n", line, tag);
        }
    }
    for line in raw.lines() {
        if line.starts_with("Call-ID:") || line.starts_with("CSeq:") {
            response += line;
            response += "\r\n";
        }
    }
    response += &format!("User-Agent: {}\r\n", USER_AGENT);
    response += "Warning: 399 GS \"Unable to accept call\"\r\n";
    response += &format!("Allow: {}\r\n", ALLOWED_METHODS);
    response += "Content-Length: 0\r\n\r\n";
    response
}

/// Echo the full Via stack of a message, preserving branch, rport,
/// received, maddr and ttl.
fn response_via(message: &SipMessage) -> String {
    let mut via = String::new();
    for entry in message.via_entries() {
        let mut line = format!(
            "Via: {} {}:{}",
            entry.transport,
            host_for_wire(&entry.host),
            entry.port
        );
        if let Some(ref branch) = entry.branch {
            line += &format!(";branch={}", branch);
        }
        match entry.rport {
            Rport::Unset => {}
            Rport::Requested => line += ";rport",
            Rport::Value(port) => line += &format!(";rport={}", port),
        }
        if let Some(ref received) = entry.received {
            line += &format!(";received={}", received);
        }
        if let Some(ref maddr) = entry.maddr {
            line += &format!(";maddr={}", maddr);
        }
        if let Some(ttl) = entry.ttl {
            line += &format!(";ttl={}", ttl);
        }
        for (key, value) in &entry.params {
            match value {
                Some(v) => line += &format!(";{}={}", key, v),
                None => line += &format!(";{}", key),
            }
        }
        line += "\r\n";
        via += &line;
    }
    via
}

fn tag_suffix(tag: Option<&str>) -> String {
    match tag {
        Some(tag) => format!(";tag={}", tag),
        None => String::new(),
    }
}

/// Bracket IPv6 literals for host:port positions.
fn host_for_wire(host: &str) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]", host)
    } else {
        host.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn factory() -> MessageFactory {
        MessageFactory::new("alice", "example.net", "192.168.1.10", 5060, "ABCD-EF")
    }

    fn media_map(port: u16) -> MediaMap {
        let mut codecs = BTreeMap::new();
        codecs.insert(0, PayloadKind::Pcmu);
        codecs.insert(101, PayloadKind::TelephoneEvent);
        let mut map = BTreeMap::new();
        map.insert(port, codecs);
        map
    }

    fn inbound_invite() -> SipMessage {
        SipMessage::parse(
            b"INVITE sip:alice@example.net SIP/2.0\r\n\
              Via: SIP/2.0/UDP 203.0.113.9:5060;branch=z9hG4bKsrv;rport=5060;received=203.0.113.9\r\n\
              From: \"Bob\" <sip:bob@example.net>;tag=remote1\r\n\
              To: <sip:alice@example.net>\r\n\
              Call-ID: call1@203.0.113.9:5060\r\n\
              CSeq: 7 INVITE\r\n\
              Contact: <sip:bob@203.0.113.9:5060>\r\n\
              Content-Length: 0\r\n\r\n",
        )
        .unwrap()
    }

    #[test]
    fn test_register_contains_required_headers() {
        let request = factory().register(&RegisterParams {
            branch: "z9hG4bKreg",
            call_id: "cid@192.168.1.10:5060",
            cseq: 1,
            tag: "regtag00",
            expires: 120,
            contact_ip: "192.168.1.10",
            contact_port: 5060,
            authorization: None,
        });

        assert!(request.starts_with("REGISTER sip:example.net SIP/2.0\r\n"));
        assert!(request.contains("Via: SIP/2.0/UDP 192.168.1.10:5060;branch=z9hG4bKreg;rport\r\n"));
        assert!(request.contains("From: \"alice\" <sip:alice@example.net>;tag=regtag00\r\n"));
        assert!(request.contains("To: \"alice\" <sip:alice@example.net>\r\n"));
        assert!(request.contains("CSeq: 1 REGISTER\r\n"));
        assert!(request.contains("+sip.instance=\"<urn:uuid:ABCD-EF>\""));
        assert!(request.contains("Allow-Events: org.3gpp.nwinitdereg\r\n"));
        assert!(request.contains("Expires: 120\r\n"));
        assert!(request.ends_with("Content-Length: 0\r\n\r\n"));
        assert!(!request.contains("Authorization"));
    }

    #[test]
    fn test_register_with_authorization_before_content_length() {
        let request = factory().register(&RegisterParams {
            branch: "z9hG4bKreg",
            call_id: "cid",
            cseq: 2,
            tag: "regtag00",
            expires: 120,
            contact_ip: "192.168.1.10",
            contact_port: 5060,
            authorization: Some("Digest username=\"alice\",realm=\"r\""),
        });

        let auth_pos = request.find("Authorization:").unwrap();
        let length_pos = request.find("Content-Length:").unwrap();
        assert!(auth_pos < length_pos);
        assert!(request.contains("CSeq: 2 REGISTER\r\n"));
    }

    #[test]
    fn test_deregister_expires_zero() {
        let request = factory().register(&RegisterParams {
            branch: "z9hG4bKreg",
            call_id: "cid",
            cseq: 3,
            tag: "regtag00",
            expires: 0,
            contact_ip: "192.168.1.10",
            contact_port: 5060,
            authorization: None,
        });
        assert!(request.contains("Expires: 0\r\n"));
    }

    #[test]
    fn test_subscribe_separates_accept_and_content_length() {
        let request = factory().subscribe(&SubscribeParams {
            branch: "z9hG4bKsub",
            call_id: "cid",
            cseq: 1,
            tag: "subtag00",
            expires: 240,
            contact_ip: "192.168.1.10",
            contact_port: 5060,
        });

        assert!(request.starts_with("SUBSCRIBE sip:alice@example.net SIP/2.0\r\n"));
        assert!(request.contains("Event: message-summary\r\n"));
        assert!(request.contains("Accept: application/simple-message-summary\r\nContent-Length: 0\r\n"));
        assert!(request.contains("Expires: 240\r\n"));
    }

    #[test]
    fn test_invite_offer_and_content_length() {
        let media = media_map(10000);
        let request = factory().invite(&InviteParams {
            number: "1000",
            session_id: 1,
            media: &media,
            mode: TransmitMode::SendRecv,
            branch: "z9hG4bKinv",
            call_id: "cid",
            tag: "calltag0",
            cseq: 1,
            contact_ip: "192.168.1.10",
            contact_port: 5060,
            authorization: None,
        });

        assert!(request.starts_with("INVITE sip:1000@example.net SIP/2.0\r\n"));
        assert!(request.contains("Content-Type: application/sdp\r\n"));
        assert!(request.contains("m=audio 10000 RTP/AVP 0 101\r\n"));
        assert!(request.contains("a=rtpmap:0 PCMU/8000\r\n"));
        assert!(request.contains("a=rtpmap:101 telephone-event/8000\r\n"));
        assert!(request.contains("a=fmtp:101 0-15\r\n"));
        assert!(request.contains("a=ptime:20\r\n"));
        assert!(request.contains("a=sendrecv\r\n"));

        let body = request.split("\r\n\r\n").nth(1).unwrap();
        let declared: usize = request
            .lines()
            .find(|l| l.starts_with("Content-Length:"))
            .and_then(|l| l.split(": ").nth(1))
            .and_then(|v| v.parse().ok())
            .unwrap();
        assert_eq!(declared, body.len());
    }

    #[test]
    fn test_invite_authorization_sits_before_content_length() {
        let media = media_map(10000);
        let request = factory().invite(&InviteParams {
            number: "1000",
            session_id: 1,
            media: &media,
            mode: TransmitMode::SendRecv,
            branch: "z9hG4bKinv",
            call_id: "cid",
            tag: "calltag0",
            cseq: 2,
            contact_ip: "192.168.1.10",
            contact_port: 5060,
            authorization: Some("Digest username=\"alice\""),
        });

        let auth_pos = request.find("Authorization:").unwrap();
        let length_pos = request.find("Content-Length:").unwrap();
        assert!(auth_pos < length_pos);
        assert_eq!(request.matches("Authorization:").count(), 1);
    }

    #[test]
    fn test_ack_echoes_remote_tag_and_via() {
        let response = SipMessage::parse(
            b"SIP/2.0 200 OK\r\n\
              Via: SIP/2.0/UDP 192.168.1.10:5060;branch=z9hG4bKinv;received=203.0.113.5\r\n\
              From: <sip:alice@192.168.1.10>;tag=calltag0\r\n\
              To: <sip:1000@example.net>;tag=astag\r\n\
              Call-ID: cid\r\n\
              CSeq: 1 INVITE\r\n\
              Contact: <sip:1000@203.0.113.9:5060>\r\n\
              Content-Length: 0\r\n\r\n",
        )
        .unwrap();

        let ack = factory().ack(&response, "calltag0").unwrap();
        assert!(ack.starts_with("ACK sip:1000@example.net SIP/2.0\r\n"));
        assert!(ack.contains("branch=z9hG4bKinv"));
        assert!(ack.contains(";received=203.0.113.5"));
        assert!(ack.contains("To: <sip:1000@example.net>;tag=astag\r\n"));
        assert!(ack.contains("From: <sip:alice@192.168.1.10>;tag=calltag0\r\n"));
        assert!(ack.contains("CSeq: 1 ACK\r\n"));
        assert!(ack.ends_with("Content-Length: 0\r\n\r\n"));
    }

    #[test]
    fn test_bye_from_inbound_dialog_swaps_addresses() {
        let invite = inbound_invite();
        let bye = factory()
            .bye(&invite, "ourtag00", "192.168.1.10", 5060)
            .unwrap();

        // We answered, so our identity comes from the To side
        assert!(bye.starts_with("BYE sip:bob@203.0.113.9:5060 SIP/2.0\r\n"));
        assert!(bye.contains("From: <sip:alice@example.net>;tag=ourtag00\r\n"));
        assert!(bye.contains("To: \"Bob\" <sip:bob@example.net>;tag=remote1\r\n"));
        assert!(bye.contains("CSeq: 8 BYE\r\n"));
        assert!(bye.contains("Call-ID: call1@203.0.113.9:5060\r\n"));
    }

    #[test]
    fn test_bye_from_outbound_dialog_keeps_orientation() {
        let stored = SipMessage::parse(
            b"SIP/2.0 200 OK\r\n\
              Via: SIP/2.0/UDP 192.168.1.10:5060;branch=z9hG4bKinv\r\n\
              From: <sip:alice@192.168.1.10>;tag=ourtag00\r\n\
              To: <sip:1000@example.net>;tag=astag\r\n\
              Call-ID: cid\r\n\
              CSeq: 1 INVITE\r\n\
              Contact: <sip:1000@203.0.113.9:5060>\r\n\
              Content-Length: 0\r\n\r\n",
        )
        .unwrap();

        let bye = factory()
            .bye(&stored, "ourtag00", "192.168.1.10", 5060)
            .unwrap();
        assert!(bye.contains("From: <sip:alice@192.168.1.10>;tag=ourtag00\r\n"));
        assert!(bye.contains("To: <sip:1000@example.net>;tag=astag\r\n"));
        assert!(bye.contains("CSeq: 2 BYE\r\n"));
    }

    #[test]
    fn test_ringing_keeps_call_id_and_sets_tag() {
        let invite = inbound_invite();
        let response = factory().ringing(&invite, "ringtag0").unwrap();

        assert!(response.starts_with("SIP/2.0 180 Ringing\r\n"));
        assert!(response.contains("Call-ID: call1@203.0.113.9:5060\r\n"));
        assert!(response.contains("To: <sip:alice@example.net>;tag=ringtag0\r\n"));
        assert!(response.contains("From: \"Bob\" <sip:bob@example.net>;tag=remote1\r\n"));
        assert!(response.contains("CSeq: 7 INVITE\r\n"));
    }

    #[test]
    fn test_busy_has_fresh_tag_and_warning() {
        let invite = inbound_invite();
        let response = factory().busy(&invite, "busytag0").unwrap();

        assert!(response.starts_with("SIP/2.0 486 Busy Here\r\n"));
        assert!(response.contains(";tag=busytag0\r\n"));
        assert!(response.contains("Warning: 399 GS \"Unable to accept call\"\r\n"));
        assert!(response.contains("Call-ID: call1@203.0.113.9:5060\r\n"));
        // Response Via echoes the request's rport/received
        assert!(response.contains(";rport=5060;received=203.0.113.9"));
    }

    #[test]
    fn test_answer_ok_carries_selected_codec() {
        let invite = inbound_invite();
        let media = media_map(10002);
        let response = factory()
            .answer_ok(
                &invite,
                "anstag00",
                5,
                &media,
                TransmitMode::SendRecv,
                "192.168.1.10",
                5060,
            )
            .unwrap();

        assert!(response.starts_with("SIP/2.0 200 OK\r\n"));
        assert!(response.contains("Content-Type: application/sdp\r\n"));
        assert!(response.contains("m=audio 10002 RTP/AVP 0 101\r\n"));
        assert!(response.contains("a=ptime:20\r\n"));
        assert!(response.contains("o=alice 5 7 IN IP4 192.168.1.10\r\n"));

        let body = response.split("\r\n\r\n").nth(1).unwrap();
        let declared: usize = response
            .lines()
            .find(|l| l.starts_with("Content-Length:"))
            .and_then(|l| l.split(": ").nth(1))
            .and_then(|v| v.parse().ok())
            .unwrap();
        assert_eq!(declared, body.len());
    }

    #[test]
    fn test_notify_ok_echoes_event_and_advances_cseq() {
        let notify = SipMessage::parse(
            b"NOTIFY sip:alice@192.168.1.10:5060 SIP/2.0\r\n\
              Via: SIP/2.0/UDP 203.0.113.9:5060;branch=z9hG4bKnot\r\n\
              From: <sip:asterisk@example.net>;tag=srv1\r\n\
              To: <sip:alice@example.net>;tag=cli1\r\n\
              Call-ID: notify1\r\n\
              CSeq: 102 NOTIFY\r\n\
              Event: keep-alive\r\n\
              Content-Length: 0\r\n\r\n",
        )
        .unwrap();

        let response = factory().notify_ok(&notify).unwrap();
        assert!(response.starts_with("SIP/2.0 200 OK\r\n"));
        assert!(response.contains("Event: keep-alive\r\n"));
        assert!(response.contains("CSeq: 103 NOTIFY\r\n"));
        assert!(response.contains("To: <sip:alice@example.net>;tag=cli1\r\n"));
        assert!(response.contains("From: <sip:asterisk@example.net>;tag=srv1\r\n"));
    }

    #[test]
    fn test_version_not_supported_echoes_primaries() {
        let raw = "INVITE sip:alice@example.net SIP/3.0\r\n\
                   Via: SIP/2.0/UDP 203.0.113.9:5060;branch=z9hG4bKv\r\n\
                   From: <sip:bob@example.net>;tag=r1\r\n\
                   To: <sip:alice@example.net>\r\n\
                   Call-ID: vcall\r\n\
                   CSeq: 1 INVITE\r\n\
                   Content-Length: 0\r\n\r\n";
        let response = version_not_supported(raw, "newtag00");

        assert!(response.starts_with("SIP/2.0 505 SIP Version Not Supported\r\n"));
        assert!(response.contains("Via: SIP/2.0/UDP 203.0.113.9:5060;branch=z9hG4bKv\r\n"));
        assert!(response.contains("To: <sip:alice@example.net>;tag=newtag00\r\n"));
        assert!(response.contains("Call-ID: vcall\r\n"));
        assert!(response.contains("CSeq: 1 INVITE\r\n"));
    }

    #[test]
    fn test_ipv6_hosts_bracketed() {
        let factory = MessageFactory::new("alice", "example.net", "2001:db8::10", 5060, "U");
        let request = factory.register(&RegisterParams {
            branch: "z9hG4bKreg",
            call_id: "cid",
            cseq: 1,
            tag: "t",
            expires: 120,
            contact_ip: "2001:db8::10",
            contact_port: 5060,
            authorization: None,
        });
        assert!(request.contains("Via: SIP/2.0/UDP [2001:db8::10]:5060;"));
        assert!(request.contains("Contact: <sip:alice@[2001:db8::10]:5060;transport=UDP>"));
    }

    #[test]
    fn test_all_builders_crlf_terminated() {
        let invite = inbound_invite();
        let f = factory();
        let messages = vec![
            f.ringing(&invite, "t").unwrap(),
            f.busy(&invite, "t").unwrap(),
            f.ok(&invite, "t").unwrap(),
            f.request_terminated(&invite, "t").unwrap(),
        ];
        for m in messages {
            assert!(m.ends_with("\r\n\r\n"));
            assert!(m.is_ascii());
        }
    }
}
