//! RTP media: G.711 codecs, jitter buffering and per-call sessions.

pub mod g711;
pub mod jitter;
pub mod session;

pub use g711::G711Codec;
pub use session::{allocate_ports, negotiate, MediaPorts, MediaSession, NegotiatedMedia};

use std::collections::BTreeMap;

/// Audio payloads this endpoint can negotiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    Pcmu,
    Pcma,
    /// RFC 4733 DTMF events, carried alongside the audio codec
    TelephoneEvent,
}

impl PayloadKind {
    /// Encoding name as it appears in a=rtpmap
    pub fn name(&self) -> &'static str {
        match self {
            PayloadKind::Pcmu => "PCMU",
            PayloadKind::Pcma => "PCMA",
            PayloadKind::TelephoneEvent => "telephone-event",
        }
    }

    pub fn rate(&self) -> u32 {
        8000
    }

    /// Static payload type, or the conventional dynamic one for events
    pub fn default_payload_type(&self) -> u8 {
        match self {
            PayloadKind::Pcmu => 0,
            PayloadKind::Pcma => 8,
            PayloadKind::TelephoneEvent => 101,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "PCMU" => Some(PayloadKind::Pcmu),
            "PCMA" => Some(PayloadKind::Pcma),
            "telephone-event" => Some(PayloadKind::TelephoneEvent),
            _ => None,
        }
    }

    pub fn is_audio(&self) -> bool {
        !matches!(self, PayloadKind::TelephoneEvent)
    }
}

/// SDP offer/answer shape: RTP port to the payload types carried on it.
pub type MediaMap = BTreeMap<u16, BTreeMap<u8, PayloadKind>>;

/// The standard offer for one media port: PCMU, PCMA and telephone-event.
pub fn default_offer(port: u16) -> MediaMap {
    let mut codecs = BTreeMap::new();
    codecs.insert(PayloadKind::Pcmu.default_payload_type(), PayloadKind::Pcmu);
    codecs.insert(PayloadKind::Pcma.default_payload_type(), PayloadKind::Pcma);
    codecs.insert(
        PayloadKind::TelephoneEvent.default_payload_type(),
        PayloadKind::TelephoneEvent,
    );
    let mut map = BTreeMap::new();
    map.insert(port, codecs);
    map
}

/// Samples per 20ms packet at 8kHz
pub const SAMPLES_PER_PACKET: usize = 160;
