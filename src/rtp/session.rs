/// RTP media session
///
/// One session per call: an even RTP port with the adjacent odd port
/// reserved for RTCP, a single negotiated G.711 payload, 20ms packetisation
/// driven by a tokio interval, and RFC 4733 telephone-events surfaced as
/// DTMF digits.

use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use rand::Rng;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::{ParseError, SipError};
use crate::rtp::g711::G711Codec;
use crate::rtp::jitter::{BufferedPacket, JitterBuffer, JitterConfig};
use crate::rtp::{PayloadKind, SAMPLES_PER_PACKET};
use crate::sip::sdp::{SdpBody, TransmitMode};

/// Cap on buffered decoded audio (30s at 8kHz); beyond it the oldest
/// samples fall off
const MAX_BUFFERED_SAMPLES: usize = 8000 * 30;

/// The RTP socket pair backing one session.
#[derive(Debug)]
pub struct MediaPorts {
    pub rtp: UdpSocket,
    /// Bound and held so nothing else claims the RTCP slot; unused
    pub rtcp: UdpSocket,
    pub port: u16,
}

/// Allocate an even RTP port in `[low, high]` together with its odd RTCP
/// sibling. Ports already in use are skipped.
pub async fn allocate_ports(low: u16, high: u16) -> Result<MediaPorts, SipError> {
    let start = low + (low % 2);
    let mut port = start;
    while port < high {
        match UdpSocket::bind(("0.0.0.0", port)).await {
            Ok(rtp) => match UdpSocket::bind(("0.0.0.0", port + 1)).await {
                Ok(rtcp) => {
                    debug!("Allocated RTP port {} (RTCP {})", port, port + 1);
                    return Ok(MediaPorts { rtp, rtcp, port });
                }
                Err(_) => {
                    trace!("RTCP port {} unavailable, skipping pair", port + 1);
                }
            },
            Err(_) => {
                trace!("RTP port {} unavailable", port);
            }
        }
        port += 2;
    }
    Err(SipError::Transport(format!(
        "no free RTP port pair in {}..{}",
        low, high
    )))
}

/// Outcome of SDP codec negotiation for one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiatedMedia {
    pub payload_type: u8,
    pub codec: G711Codec,
    pub dtmf_payload_type: Option<u8>,
    pub remote: SocketAddr,
}

/// Select the single common audio payload from an SDP offer, preferring the
/// peer's ordering, plus the telephone-event payload when offered.
pub fn negotiate(sdp: &SdpBody) -> Result<NegotiatedMedia, SipError> {
    let audio = sdp.first_audio().ok_or(SipError::NoCompatibleCodec)?;
    let address = sdp
        .connection_address()
        .ok_or_else(|| ParseError::malformed("SDP", "no connection address"))?;
    let ip: IpAddr = address
        .parse()
        .map_err(|_| ParseError::malformed("SDP connection address", address))?;

    let mut chosen: Option<(u8, G711Codec)> = None;
    let mut dtmf: Option<u8> = None;

    for format in &audio.formats {
        let pt: u8 = match format.parse() {
            Ok(pt) => pt,
            Err(_) => continue,
        };
        match audio.rtpmap.get(format) {
            Some(map) => match PayloadKind::from_name(&map.name) {
                Some(PayloadKind::TelephoneEvent) => {
                    dtmf.get_or_insert(pt);
                }
                Some(kind) if kind.is_audio() && chosen.is_none() => {
                    let codec = match kind {
                        PayloadKind::Pcmu => G711Codec::ULaw,
                        _ => G711Codec::ALaw,
                    };
                    chosen = Some((pt, codec));
                }
                _ => {}
            },
            // Static payload types may arrive without an rtpmap
            None => {
                if chosen.is_none() {
                    if let Some(codec) = G711Codec::from_payload_type(pt) {
                        chosen = Some((pt, codec));
                    }
                }
            }
        }
    }

    let (payload_type, codec) = chosen.ok_or(SipError::NoCompatibleCodec)?;
    Ok(NegotiatedMedia {
        payload_type,
        codec,
        dtmf_payload_type: dtmf,
        remote: SocketAddr::new(ip, audio.port),
    })
}

/// A running RTP session. Created on answer/200, torn down when the call
/// ends, however it ends.
#[derive(Debug)]
pub struct MediaSession {
    port: u16,
    negotiated: NegotiatedMedia,
    outgoing: Arc<Mutex<VecDeque<i16>>>,
    incoming: Arc<Mutex<VecDeque<i16>>>,
    dtmf: Arc<Mutex<VecDeque<char>>>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    _rtcp: UdpSocket,
}

impl MediaSession {
    /// Spin up the send/receive tasks for a negotiated session. The
    /// transmit clock runs at 20ms minus `delay_reduction` to counter
    /// scheduler jitter.
    pub fn start(
        ports: MediaPorts,
        negotiated: NegotiatedMedia,
        mode: TransmitMode,
        delay_reduction: Duration,
    ) -> Self {
        let socket = Arc::new(ports.rtp);
        let outgoing = Arc::new(Mutex::new(VecDeque::new()));
        let incoming = Arc::new(Mutex::new(VecDeque::new()));
        let dtmf = Arc::new(Mutex::new(VecDeque::new()));
        let cancel = CancellationToken::new();
        let mut tasks = Vec::new();

        let send_audio = matches!(mode, TransmitMode::SendRecv | TransmitMode::SendOnly);
        let recv_audio = matches!(mode, TransmitMode::SendRecv | TransmitMode::RecvOnly);

        if send_audio {
            tasks.push(tokio::spawn(send_loop(
                socket.clone(),
                negotiated,
                outgoing.clone(),
                cancel.clone(),
                delay_reduction,
            )));
        }
        if recv_audio {
            tasks.push(tokio::spawn(recv_loop(
                socket.clone(),
                negotiated,
                incoming.clone(),
                dtmf.clone(),
                cancel.clone(),
            )));
        }

        Self {
            port: ports.port,
            negotiated,
            outgoing,
            incoming,
            dtmf,
            cancel,
            tasks,
            _rtcp: ports.rtcp,
        }
    }

    pub fn local_port(&self) -> u16 {
        self.port
    }

    pub fn negotiated(&self) -> NegotiatedMedia {
        self.negotiated
    }

    /// Queue PCM samples for transmission on the 20ms clock.
    pub fn write_audio(&self, samples: &[i16]) {
        let mut outgoing = self.outgoing.lock().unwrap_or_else(|e| e.into_inner());
        outgoing.extend(samples);
    }

    /// Take up to `max` decoded PCM samples received from the peer.
    pub fn read_audio(&self, max: usize) -> Vec<i16> {
        let mut incoming = self.incoming.lock().unwrap_or_else(|e| e.into_inner());
        let take = max.min(incoming.len());
        incoming.drain(..take).collect()
    }

    /// Next DTMF digit received, if any.
    pub fn read_dtmf(&self) -> Option<char> {
        let mut dtmf = self.dtmf.lock().unwrap_or_else(|e| e.into_inner());
        dtmf.pop_front()
    }

    /// Stop the media tasks and release both sockets.
    pub fn stop(self) {
        self.cancel.cancel();
        for task in &self.tasks {
            task.abort();
        }
        debug!("Media session on port {} stopped", self.port);
    }
}

async fn send_loop(
    socket: Arc<UdpSocket>,
    negotiated: NegotiatedMedia,
    outgoing: Arc<Mutex<VecDeque<i16>>>,
    cancel: CancellationToken,
    delay_reduction: Duration,
) {
    let period = Duration::from_millis(20).saturating_sub(delay_reduction);
    let mut clock = tokio::time::interval(period.max(Duration::from_millis(1)));
    clock.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let mut sequence: u16 = rand::thread_rng().gen();
    let mut timestamp: u32 = rand::thread_rng().gen();
    let ssrc: u32 = rand::thread_rng().gen();
    let mut frame = [0i16; SAMPLES_PER_PACKET];

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = clock.tick() => {}
        }

        {
            let mut queue = outgoing.lock().unwrap_or_else(|e| e.into_inner());
            for slot in frame.iter_mut() {
                *slot = queue.pop_front().unwrap_or(0);
            }
        }

        let mut packet = BytesMut::with_capacity(12 + SAMPLES_PER_PACKET);
        packet.put_u8(0x80); // V=2, P=0, X=0, CC=0
        packet.put_u8(negotiated.payload_type & 0x7F);
        packet.put_u16(sequence);
        packet.put_u32(timestamp);
        packet.put_u32(ssrc);
        for &sample in &frame {
            packet.put_u8(negotiated.codec.encode_sample(sample));
        }

        if let Err(e) = socket.send_to(&packet, negotiated.remote).await {
            warn!("RTP send error: {}", e);
        }

        sequence = sequence.wrapping_add(1);
        timestamp = timestamp.wrapping_add(SAMPLES_PER_PACKET as u32);
    }
}

async fn recv_loop(
    socket: Arc<UdpSocket>,
    negotiated: NegotiatedMedia,
    incoming: Arc<Mutex<VecDeque<i16>>>,
    dtmf: Arc<Mutex<VecDeque<char>>>,
    cancel: CancellationToken,
) {
    let mut buf = [0u8; 2048];
    let mut jitter = JitterBuffer::new(JitterConfig::default());
    let mut decoded = Vec::with_capacity(SAMPLES_PER_PACKET * 4);
    let mut last_event_timestamp: Option<u32> = None;

    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            r = socket.recv_from(&mut buf) => r,
        };

        let len = match received {
            Ok((len, _addr)) => len,
            Err(e) => {
                warn!("RTP receive error: {}", e);
                continue;
            }
        };

        let Some((payload_type, sequence, timestamp, _ssrc, offset)) =
            parse_rtp_header(&buf[..len])
        else {
            continue;
        };
        if offset >= len {
            continue;
        }
        let payload = &buf[offset..len];

        if Some(payload_type) == negotiated.dtmf_payload_type {
            if let Some(digit) = parse_telephone_event(payload) {
                // End packets are retransmitted; report each event once
                if last_event_timestamp != Some(timestamp) {
                    last_event_timestamp = Some(timestamp);
                    trace!("DTMF digit received: {}", digit);
                    dtmf.lock().unwrap_or_else(|e| e.into_inner()).push_back(digit);
                }
            }
            continue;
        }

        if payload_type != negotiated.payload_type {
            trace!("Ignoring RTP payload type {}", payload_type);
            continue;
        }

        jitter.insert(BufferedPacket {
            sequence,
            timestamp,
            payload: payload.to_vec(),
        });

        decoded.clear();
        while let Some(packet) = jitter.pop() {
            negotiated.codec.decode_into(&packet.payload, &mut decoded);
        }
        if !decoded.is_empty() {
            let mut queue = incoming.lock().unwrap_or_else(|e| e.into_inner());
            queue.extend(decoded.iter().copied());
            while queue.len() > MAX_BUFFERED_SAMPLES {
                queue.pop_front();
            }
        }
    }
}

/// Parse an RTP header: (payload type, sequence, timestamp, ssrc, payload
/// offset). None for non-RTP datagrams.
pub fn parse_rtp_header(data: &[u8]) -> Option<(u8, u16, u32, u32, usize)> {
    if data.len() < 12 {
        return None;
    }
    let version = (data[0] >> 6) & 0x03;
    if version != 2 {
        return None;
    }

    let payload_type = data[1] & 0x7F;
    let sequence = u16::from_be_bytes([data[2], data[3]]);
    let timestamp = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
    let ssrc = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);

    let cc = data[0] & 0x0F;
    let has_extension = (data[0] & 0x10) != 0;
    let mut offset = 12 + (cc as usize * 4);
    if has_extension && data.len() > offset + 4 {
        let ext_length = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
        offset += 4 + (ext_length * 4);
    }

    Some((payload_type, sequence, timestamp, ssrc, offset))
}

/// Decode an RFC 4733 telephone-event payload into its digit once the end
/// bit is set.
fn parse_telephone_event(payload: &[u8]) -> Option<char> {
    if payload.len() < 4 {
        return None;
    }
    let event = payload[0];
    let end = payload[1] & 0x80 != 0;
    if !end {
        return None;
    }
    match event {
        0..=9 => Some((b'0' + event) as char),
        10 => Some('*'),
        11 => Some('#'),
        12..=15 => Some((b'A' + event - 12) as char),
        _ => None,
    }
}
