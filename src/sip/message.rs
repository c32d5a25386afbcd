/// SIP message parsing - RFC 3261 request/response messages into typed form
///
/// Headers are parsed into tagged variants per kind. The header map is
/// ordered and first-wins, except Via which accumulates the full stack;
/// proxies on the return path inject secondary Vias and responses must
/// echo all of them.

use std::collections::HashMap;

use crate::error::ParseError;
use crate::sip::sdp::SdpBody;

pub const SIP_VERSION: &str = "SIP/2.0";

/// Methods this endpoint understands on the wire.
pub const SUPPORTED_METHODS: [&str; 8] = [
    "INVITE",
    "ACK",
    "BYE",
    "CANCEL",
    "NOTIFY",
    "REGISTER",
    "SUBSCRIBE",
    "OPTIONS",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SipMethod {
    Invite,
    Ack,
    Bye,
    Cancel,
    Notify,
    Register,
    Subscribe,
    Options,
}

impl SipMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            SipMethod::Invite => "INVITE",
            SipMethod::Ack => "ACK",
            SipMethod::Bye => "BYE",
            SipMethod::Cancel => "CANCEL",
            SipMethod::Notify => "NOTIFY",
            SipMethod::Register => "REGISTER",
            SipMethod::Subscribe => "SUBSCRIBE",
            SipMethod::Options => "OPTIONS",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "INVITE" => Some(SipMethod::Invite),
            "ACK" => Some(SipMethod::Ack),
            "BYE" => Some(SipMethod::Bye),
            "CANCEL" => Some(SipMethod::Cancel),
            "NOTIFY" => Some(SipMethod::Notify),
            "REGISTER" => Some(SipMethod::Register),
            "SUBSCRIBE" => Some(SipMethod::Subscribe),
            "OPTIONS" => Some(SipMethod::Options),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MessageKind {
    Request { method: SipMethod },
    Response { status: u16, reason: String },
}

/// Via rport parameter: unset, a valueless request marker, or the port the
/// server observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Rport {
    #[default]
    Unset,
    Requested,
    Value(u16),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ViaEntry {
    /// e.g. "SIP/2.0/UDP"
    pub transport: String,
    pub host: String,
    pub port: u16,
    pub branch: Option<String>,
    pub rport: Rport,
    pub received: Option<String>,
    pub maddr: Option<String>,
    pub ttl: Option<u8>,
    /// Parameters beyond the RFC 3261 20.7 set, in order
    pub params: Vec<(String, Option<String>)>,
}

/// From/To/Contact in either `"Display" <sip:user@host>` or bare
/// `sip:user@host` form.
#[derive(Debug, Clone, PartialEq)]
pub struct AddressHeader {
    /// The name-addr portion as received, without the tag parameter
    pub raw: String,
    pub display: Option<String>,
    /// Full URI including any URI parameters
    pub uri: String,
    pub user: Option<String>,
    pub host: String,
    pub tag: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Header {
    Via(Vec<ViaEntry>),
    Address(AddressHeader),
    CSeq { seq: u32, method: String },
    TokenList(Vec<String>),
    ContentLength(usize),
    Auth(HashMap<String, String>),
    Raw(String),
}

/// Ordered header map; first occurrence wins for everything but Via.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Headers {
    entries: Vec<(String, Header)>,
}

impl Headers {
    pub fn get(&self, name: &str) -> Option<&Header> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, h)| h)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Header)> {
        self.entries.iter().map(|(n, h)| (n.as_str(), h))
    }

    fn insert(&mut self, name: &str, header: Header) {
        if !self.contains(name) {
            self.entries.push((name.to_string(), header));
        }
    }

    fn push_via(&mut self, entry: ViaEntry) {
        match self.entries.iter_mut().find(|(n, _)| n == "Via") {
            Some((_, Header::Via(stack))) => stack.push(entry),
            _ => self.entries.push(("Via".to_string(), Header::Via(vec![entry]))),
        }
    }

    pub fn raw(&self, name: &str) -> Option<&str> {
        match self.get(name)? {
            Header::Raw(s) => Some(s.as_str()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SipMessage {
    pub kind: MessageKind,
    pub version: String,
    /// Request-URI for requests
    pub uri: Option<String>,
    pub headers: Headers,
    pub body: Option<SdpBody>,
    /// Parameters of WWW-Authenticate/Authorization, if present
    pub authentication: HashMap<String, String>,
    /// Original datagram image
    pub raw: Vec<u8>,
}

impl SipMessage {
    /// Parse a single datagram payload into a message.
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        let text = std::str::from_utf8(data)
            .map_err(|e| ParseError::malformed("datagram", e.to_string()))?;

        // Split at the first CRLFCRLF; a missing body separator is tolerated
        let (head, body) = match text.split_once("\r\n\r\n") {
            Some((head, body)) => (head, body),
            None => (text, ""),
        };

        let mut lines = head.split("\r\n");
        let start_line = lines
            .next()
            .filter(|l| !l.is_empty())
            .ok_or_else(|| ParseError::malformed("datagram", "empty message"))?;

        let (kind, version, uri) = Self::parse_start_line(start_line)?;

        let mut message = SipMessage {
            kind,
            version,
            uri,
            headers: Headers::default(),
            body: None,
            authentication: HashMap::new(),
            raw: data.to_vec(),
        };

        for line in lines {
            if line.is_empty() {
                continue;
            }
            let (name, value) = line
                .split_once(": ")
                .ok_or_else(|| ParseError::malformed("header line", line))?;
            message.parse_header(name, value)?;
        }

        message.require_primaries()?;
        message.parse_body(body)?;
        Ok(message)
    }

    fn parse_start_line(
        line: &str,
    ) -> Result<(MessageKind, String, Option<String>), ParseError> {
        let tokens: Vec<&str> = line.split(' ').collect();
        let first = tokens[0];

        if first == SIP_VERSION {
            // Response: SIP/2.0 <status> <reason...>
            let status = tokens
                .get(1)
                .and_then(|s| s.parse::<u16>().ok())
                .ok_or_else(|| ParseError::MalformedStartLine(line.to_string()))?;
            let reason = tokens.get(2..).map(|r| r.join(" ")).unwrap_or_default();
            Ok((
                MessageKind::Response { status, reason },
                first.to_string(),
                None,
            ))
        } else if first.starts_with("SIP/") {
            Err(ParseError::UnsupportedVersion(first.to_string()))
        } else if let Some(method) = SipMethod::parse(first) {
            // Request: <method> <uri> <version>
            let uri = tokens
                .get(1)
                .ok_or_else(|| ParseError::MalformedStartLine(line.to_string()))?;
            let version = tokens
                .get(2)
                .ok_or_else(|| ParseError::MalformedStartLine(line.to_string()))?;
            if *version != SIP_VERSION {
                return Err(ParseError::UnsupportedVersion(version.to_string()));
            }
            Ok((
                MessageKind::Request { method },
                version.to_string(),
                Some(uri.to_string()),
            ))
        } else {
            Err(ParseError::MalformedStartLine(line.to_string()))
        }
    }

    fn parse_header(&mut self, name: &str, value: &str) -> Result<(), ParseError> {
        // First occurrence wins for everything but Via; later duplicates
        // are not even parsed
        if name != "Via" && self.headers.contains(name) {
            return Ok(());
        }
        match name {
            "Via" => {
                let entry = parse_via(value)?;
                self.headers.push_via(entry);
            }
            "From" | "To" | "Contact" => {
                let address = parse_address(value)?;
                self.headers.insert(name, Header::Address(address));
            }
            "CSeq" => {
                let (seq, method) = value
                    .split_once(' ')
                    .ok_or_else(|| ParseError::malformed("CSeq", value))?;
                let seq = seq
                    .parse()
                    .map_err(|_| ParseError::malformed("CSeq", value))?;
                self.headers.insert(
                    name,
                    Header::CSeq {
                        seq,
                        method: method.to_string(),
                    },
                );
            }
            "Allow" | "Supported" => {
                let tokens = value.split(", ").map(|t| t.to_string()).collect();
                self.headers.insert(name, Header::TokenList(tokens));
            }
            "Content-Length" => {
                let length = value
                    .trim()
                    .parse()
                    .map_err(|_| ParseError::malformed("Content-Length", value))?;
                self.headers.insert(name, Header::ContentLength(length));
            }
            "WWW-Authenticate" | "Authorization" => {
                let params = parse_auth_params(value);
                if !self.headers.contains(name) {
                    self.authentication = params.clone();
                }
                self.headers.insert(name, Header::Auth(params));
            }
            _ => {
                self.headers.insert(name, Header::Raw(value.to_string()));
            }
        }
        Ok(())
    }

    fn require_primaries(&self) -> Result<(), ParseError> {
        for name in ["Via", "From", "To", "Call-ID", "CSeq"] {
            if !self.headers.contains(name) {
                return Err(ParseError::MissingHeader(name));
            }
        }
        Ok(())
    }

    fn parse_body(&mut self, body: &str) -> Result<(), ParseError> {
        if body.is_empty() {
            return Ok(());
        }
        if let Some(encoding) = self.headers.raw("Content-Encoding") {
            return Err(ParseError::EncodedBodyUnsupported(encoding.to_string()));
        }
        if self.headers.raw("Content-Type") == Some("application/sdp") {
            self.body = Some(SdpBody::parse(body)?);
        }
        Ok(())
    }

    // ---- accessors -------------------------------------------------------

    pub fn is_request(&self) -> bool {
        matches!(self.kind, MessageKind::Request { .. })
    }

    pub fn method(&self) -> Option<SipMethod> {
        match self.kind {
            MessageKind::Request { method } => Some(method),
            _ => None,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self.kind {
            MessageKind::Response { status, .. } => Some(status),
            _ => None,
        }
    }

    pub fn call_id(&self) -> Option<&str> {
        self.headers.raw("Call-ID")
    }

    pub fn cseq(&self) -> Option<(u32, &str)> {
        match self.headers.get("CSeq")? {
            Header::CSeq { seq, method } => Some((*seq, method.as_str())),
            _ => None,
        }
    }

    pub fn from_header(&self) -> Option<&AddressHeader> {
        match self.headers.get("From")? {
            Header::Address(a) => Some(a),
            _ => None,
        }
    }

    pub fn to_header(&self) -> Option<&AddressHeader> {
        match self.headers.get("To")? {
            Header::Address(a) => Some(a),
            _ => None,
        }
    }

    pub fn contact(&self) -> Option<&AddressHeader> {
        match self.headers.get("Contact")? {
            Header::Address(a) => Some(a),
            _ => None,
        }
    }

    pub fn via_entries(&self) -> &[ViaEntry] {
        match self.headers.get("Via") {
            Some(Header::Via(stack)) => stack,
            _ => &[],
        }
    }

    pub fn event(&self) -> Option<&str> {
        self.headers.raw("Event")
    }
}

/// Split `host[:port]` recognising `[v6]:port`, `v4:port` and bare hosts.
/// Port defaults to 5060 when absent.
pub fn split_host_port(address: &str) -> Result<(String, u16), ParseError> {
    if let Some(rest) = address.strip_prefix('[') {
        let end = rest
            .find(']')
            .ok_or_else(|| ParseError::malformed("IPv6 host", address))?;
        let host = rest[..end].to_string();
        let port = match rest[end + 1..].strip_prefix(':') {
            Some(p) => p
                .parse()
                .map_err(|_| ParseError::malformed("host port", address))?,
            None => 5060,
        };
        Ok((host, port))
    } else {
        match address.split_once(':') {
            Some((host, port)) => Ok((
                host.to_string(),
                port.parse()
                    .map_err(|_| ParseError::malformed("host port", address))?,
            )),
            None => Ok((address.to_string(), 5060)),
        }
    }
}

fn parse_via(value: &str) -> Result<ViaEntry, ParseError> {
    let mut fields = value.split([' ', ';']).filter(|f| !f.is_empty());
    let transport = fields
        .next()
        .ok_or_else(|| ParseError::malformed("Via", value))?
        .to_string();
    let address = fields
        .next()
        .ok_or_else(|| ParseError::malformed("Via", value))?;
    let (host, port) = split_host_port(address)?;

    let mut entry = ViaEntry {
        transport,
        host,
        port,
        branch: None,
        rport: Rport::Unset,
        received: None,
        maddr: None,
        ttl: None,
        params: Vec::new(),
    };

    // branch, maddr, ttl, received and rport per RFC 3261 20.7
    for field in fields {
        match field.split_once('=') {
            Some(("branch", v)) => entry.branch = Some(v.to_string()),
            Some(("received", v)) => entry.received = Some(v.to_string()),
            Some(("maddr", v)) => entry.maddr = Some(v.to_string()),
            Some(("ttl", v)) => entry.ttl = v.parse().ok(),
            Some(("rport", v)) => {
                entry.rport = v
                    .parse()
                    .map(Rport::Value)
                    .unwrap_or(Rport::Requested);
            }
            Some((k, v)) => entry.params.push((k.to_string(), Some(v.to_string()))),
            None if field == "rport" => entry.rport = Rport::Requested,
            None => entry.params.push((field.to_string(), None)),
        }
    }

    Ok(entry)
}

fn parse_address(value: &str) -> Result<AddressHeader, ParseError> {
    // Tag parameter, if any, trails the name-addr
    let (raw, tag) = match value.split_once(";tag=") {
        Some((raw, tag)) => {
            let tag = tag.split(';').next().unwrap_or(tag);
            (raw, Some(tag.to_string()))
        }
        None => (value, None),
    };

    // Tolerate both `"Display" <sip:user@host>` and bare `sip:user@host`
    let sip_pos = raw
        .find("sip:")
        .ok_or_else(|| ParseError::malformed("address header", value))?;
    let display = raw[..sip_pos]
        .trim()
        .trim_end_matches('<')
        .trim()
        .trim_matches(|c| c == '"' || c == '\'');
    let display = if display.is_empty() {
        None
    } else {
        Some(display.to_string())
    };

    let address = raw[sip_pos + 4..].trim_end().trim_end_matches('>');
    let uri = format!("sip:{}", address);

    // user@host, with URI parameters excluded from the host
    let core = address.split(';').next().unwrap_or(address);
    let (user, host) = match core.split_once('@') {
        Some((user, host)) => (Some(user.to_string()), host.to_string()),
        None => (None, core.to_string()),
    };

    Ok(AddressHeader {
        raw: raw.to_string(),
        display,
        uri,
        user,
        host,
        tag,
    })
}

fn parse_auth_params(value: &str) -> HashMap<String, String> {
    let stripped = value.strip_prefix("Digest").unwrap_or(value).trim();
    let mut params = HashMap::new();
    // Split on ", " with the space so qop="auth,auth-int" survives
    for item in stripped.split(", ") {
        if let Some((k, v)) = item.trim().split_once('=') {
            params.insert(k.to_string(), v.trim_matches('"').to_string());
        }
    }
    params
}

/// Peek the status code of a response datagram without a full parse.
pub fn peek_status(data: &[u8]) -> Option<u16> {
    let text = std::str::from_utf8(data).ok()?;
    let first_line = text.lines().next()?;
    let mut parts = first_line.split(' ');
    if parts.next()? != SIP_VERSION {
        return None;
    }
    parts.next()?.parse().ok()
}



/// Kani formal verification proofs
#[cfg(kani)]
mod kani_proofs {
    use super::*;

    #[kani::proof]
    fn peek_status_never_panics() {
        let data: [u8; 32] = kani::any();
        let _ = peek_status(&data);
    }
}
