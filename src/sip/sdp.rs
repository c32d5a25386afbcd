/// SDP body model and parser
/// Reference: RFC 4566 - SDP: Session Description Protocol
///
/// Media-level rtpmap/fmtp attributes attach to the media description that
/// offered the payload type; everything else lands in the session-level
/// attribute map.

use std::collections::HashMap;

use crate::error::ParseError;

/// Stream direction attribute (RFC 4566 6.0)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransmitMode {
    RecvOnly,
    SendOnly,
    SendRecv,
    Inactive,
}

impl TransmitMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransmitMode::RecvOnly => "recvonly",
            TransmitMode::SendOnly => "sendonly",
            TransmitMode::SendRecv => "sendrecv",
            TransmitMode::Inactive => "inactive",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "recvonly" => Some(TransmitMode::RecvOnly),
            "sendonly" => Some(TransmitMode::SendOnly),
            "sendrecv" => Some(TransmitMode::SendRecv),
            "inactive" => Some(TransmitMode::Inactive),
            _ => None,
        }
    }
}

/// o= origin line (RFC 4566 5.2)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    pub username: String,
    pub session_id: String,
    pub session_version: String,
    pub network_type: String,
    pub address_type: String,
    pub address: String,
}

/// c= connection line (RFC 4566 5.7). For IPv4 multicast the address may
/// carry /ttl/count suffixes; IPv6 has no TTL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub network_type: String,
    pub address_type: String,
    pub address: String,
    pub ttl: Option<u8>,
    pub address_count: u32,
}

/// a=rtpmap payload mapping (RFC 4566 6.0)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpMap {
    pub payload_type: String,
    pub name: String,
    pub clock_rate: String,
    pub encoding: Option<String>,
}

/// m= media description with its attached attributes (RFC 4566 5.14)
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MediaDescription {
    pub media: String,
    pub port: u16,
    pub port_count: u32,
    pub protocol: String,
    /// Payload type tokens in offer order
    pub formats: Vec<String>,
    pub rtpmap: HashMap<String, RtpMap>,
    pub fmtp: HashMap<String, String>,
}

impl MediaDescription {
    pub fn offers_format(&self, format: &str) -> bool {
        self.formats.iter().any(|f| f == format)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SdpBody {
    pub version: Option<i32>,
    pub origin: Option<Origin>,
    pub session_name: Option<String>,
    pub connections: Vec<Connection>,
    pub timing: Option<(String, String)>,
    pub media: Vec<MediaDescription>,
    /// Session-level a= attributes with values
    pub attributes: HashMap<String, String>,
    pub transmit: Option<TransmitMode>,
    /// Remaining line types kept raw (i=, u=, e=, p=, b=, k=, ...)
    pub other: HashMap<String, String>,
}

impl SdpBody {
    /// Parse an SDP body. Identical duplicate lines are collapsed first,
    /// preserving first-occurrence order.
    pub fn parse(body: &str) -> Result<Self, ParseError> {
        let mut sdp = SdpBody::default();

        let mut seen = std::collections::HashSet::new();
        let lines: Vec<&str> = body
            .split("\r\n")
            .filter(|l| !l.is_empty() && seen.insert(*l))
            .collect();

        for line in lines {
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| ParseError::malformed("SDP line", line))?;
            sdp.parse_line(key, value)?;
        }

        Ok(sdp)
    }

    fn parse_line(&mut self, key: &str, value: &str) -> Result<(), ParseError> {
        match key {
            "v" => {
                self.version = Some(
                    value
                        .trim()
                        .parse()
                        .map_err(|_| ParseError::malformed("SDP version", value))?,
                );
            }
            "o" => {
                // o=<username> <sess-id> <sess-version> <nettype> <addrtype> <unicast-address>
                let d: Vec<&str> = value.split(' ').collect();
                if d.len() < 6 {
                    return Err(ParseError::malformed("SDP origin", value));
                }
                self.origin = Some(Origin {
                    username: d[0].to_string(),
                    session_id: d[1].to_string(),
                    session_version: d[2].to_string(),
                    network_type: d[3].to_string(),
                    address_type: d[4].to_string(),
                    address: d[5].to_string(),
                });
            }
            "s" => self.session_name = Some(value.to_string()),
            "c" => self.parse_connection(value)?,
            "t" => {
                let (start, stop) = value
                    .split_once(' ')
                    .ok_or_else(|| ParseError::malformed("SDP timing", value))?;
                self.timing = Some((start.to_string(), stop.to_string()));
            }
            "m" => self.parse_media(value)?,
            "a" => self.parse_attribute(value),
            _ => {
                self.other.insert(key.to_string(), value.to_string());
            }
        }
        Ok(())
    }

    fn parse_connection(&mut self, value: &str) -> Result<(), ParseError> {
        // c=<nettype> <addrtype> <connection-address>[/ttl][/count]
        let d: Vec<&str> = value.split(' ').collect();
        if d.len() < 3 {
            return Err(ParseError::malformed("SDP connection", value));
        }

        let parts: Vec<&str> = d[2].split('/').collect();
        let address = parts[0].to_string();
        // IPv6 multicast has no TTL field, only an optional count
        let (ttl, address_count) = if d[1] == "IP6" {
            let count = parts.get(1).and_then(|c| c.parse().ok()).unwrap_or(1);
            (None, count)
        } else {
            let ttl = parts.get(1).and_then(|t| t.parse().ok());
            let count = parts.get(2).and_then(|c| c.parse().ok()).unwrap_or(1);
            (ttl, count)
        };

        self.connections.push(Connection {
            network_type: d[0].to_string(),
            address_type: d[1].to_string(),
            address,
            ttl,
            address_count,
        });
        Ok(())
    }

    fn parse_media(&mut self, value: &str) -> Result<(), ParseError> {
        // m=<media> <port>[/<number of ports>] <proto> <fmt> ...
        let d: Vec<&str> = value.split(' ').collect();
        if d.len() < 4 {
            return Err(ParseError::malformed("SDP media", value));
        }

        let (port_str, port_count) = match d[1].split_once('/') {
            Some((port, count)) => (
                port,
                count
                    .parse()
                    .map_err(|_| ParseError::malformed("SDP media port count", value))?,
            ),
            None => (d[1], 1),
        };
        let port = port_str
            .parse()
            .map_err(|_| ParseError::malformed("SDP media port", value))?;

        self.media.push(MediaDescription {
            media: d[0].to_string(),
            port,
            port_count,
            protocol: d[2].to_string(),
            formats: d[3..].iter().map(|f| f.to_string()).collect(),
            rtpmap: HashMap::new(),
            fmtp: HashMap::new(),
        });
        Ok(())
    }

    fn parse_attribute(&mut self, value: &str) {
        match value.split_once(':') {
            Some(("rtpmap", v)) => {
                // a=rtpmap:<payload type> <name>/<clock rate>[/<encoding>]
                let fields: Vec<&str> = v.split([' ', '/']).collect();
                if fields.len() < 3 {
                    return;
                }
                let entry = RtpMap {
                    payload_type: fields[0].to_string(),
                    name: fields[1].to_string(),
                    clock_rate: fields[2].to_string(),
                    encoding: fields.get(3).map(|e| e.to_string()),
                };
                if let Some(m) = self.media.iter_mut().find(|m| m.offers_format(fields[0])) {
                    m.rtpmap.insert(fields[0].to_string(), entry);
                }
            }
            Some(("fmtp", v)) => {
                // a=fmtp:<format> <format specific parameters>
                if let Some((format, settings)) = v.split_once(' ') {
                    if let Some(m) = self.media.iter_mut().find(|m| m.offers_format(format)) {
                        m.fmtp.insert(format.to_string(), settings.to_string());
                    }
                }
            }
            Some((attribute, v)) => {
                self.attributes
                    .insert(attribute.to_string(), v.to_string());
            }
            None => {
                if let Some(mode) = TransmitMode::parse(value) {
                    self.transmit = Some(mode);
                }
            }
        }
    }

    /// Address of the first connection line, if any
    pub fn connection_address(&self) -> Option<&str> {
        self.connections.first().map(|c| c.address.as_str())
    }

    /// First audio media description, if any
    pub fn first_audio(&self) -> Option<&MediaDescription> {
        self.media.iter().find(|m| m.media == "audio")
    }
}
