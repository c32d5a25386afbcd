/// RTP jitter buffer
///
/// Collects incoming RTP packets and releases them in sequence order with a
/// small buffering depth to absorb network jitter. Sequence numbers wrap at
/// 2^16; ordering comparisons are wraparound-aware.

use std::collections::BTreeMap;
use tracing::{debug, trace, warn};

/// Configuration for the jitter buffer
#[derive(Debug, Clone)]
pub struct JitterConfig {
    /// Packets buffered before the first release; more depth means more
    /// jitter tolerance at the cost of latency
    pub prime_depth: u16,
    /// Buffer size cap before the oldest packet is dropped
    pub max_size: u16,
    /// Sequence gap beyond which missing packets are declared lost and
    /// skipped
    pub max_gap: u16,
}

impl Default for JitterConfig {
    fn default() -> Self {
        Self {
            prime_depth: 3,
            max_size: 50,
            max_gap: 10,
        }
    }
}

/// A buffered RTP payload with its ordering metadata
#[derive(Debug, Clone)]
pub struct BufferedPacket {
    pub sequence: u16,
    pub timestamp: u32,
    pub payload: Vec<u8>,
}

#[derive(Debug)]
pub struct JitterBuffer {
    config: JitterConfig,
    packets: BTreeMap<u16, BufferedPacket>,
    /// Next sequence number to release
    next_seq: Option<u16>,
    released: u64,
    dropped: u64,
    lost: u64,
}

impl JitterBuffer {
    pub fn new(config: JitterConfig) -> Self {
        Self {
            config,
            packets: BTreeMap::new(),
            next_seq: None,
            released: 0,
            dropped: 0,
            lost: 0,
        }
    }

    /// Insert a packet. Returns false when the packet was discarded as a
    /// late arrival or duplicate.
    pub fn insert(&mut self, packet: BufferedPacket) -> bool {
        let seq = packet.sequence;

        let next_seq = *self.next_seq.get_or_insert_with(|| {
            debug!("Jitter buffer primed at sequence {}", seq);
            seq
        });

        if seq_before(seq, next_seq) {
            trace!("Dropping late packet: seq={} (expected >= {})", seq, next_seq);
            self.dropped += 1;
            return false;
        }

        if self.packets.contains_key(&seq) {
            trace!("Dropping duplicate packet: seq={}", seq);
            self.dropped += 1;
            return false;
        }

        self.packets.insert(seq, packet);

        while self.packets.len() > self.config.max_size as usize {
            if let Some((&oldest, _)) = self.packets.iter().next() {
                self.packets.remove(&oldest);
                self.dropped += 1;
                warn!("Jitter buffer overflow, dropped packet: seq={}", oldest);
            }
        }

        true
    }

    /// Release the next packet in sequence order. None while the buffer is
    /// still priming or the next packet has not arrived within the gap
    /// tolerance.
    pub fn pop(&mut self) -> Option<BufferedPacket> {
        let next_seq = self.next_seq?;

        if self.released == 0 && self.packets.len() < self.config.prime_depth as usize {
            return None;
        }

        if let Some(packet) = self.packets.remove(&next_seq) {
            self.next_seq = Some(next_seq.wrapping_add(1));
            self.released += 1;
            return Some(packet);
        }

        // The next packet is missing; skip forward only when the gap to the
        // first buffered packet exceeds the tolerance
        let (&available, _) = self.packets.iter().next()?;
        let gap = available.wrapping_sub(next_seq);
        if gap > self.config.max_gap {
            self.lost += gap as u64;
            debug!(
                "Skipping {} missing packets, jumping from {} to {}",
                gap, next_seq, available
            );
            let packet = self.packets.remove(&available);
            self.next_seq = Some(available.wrapping_add(1));
            self.released += 1;
            return packet;
        }

        None
    }

    /// Release everything left, in order, ignoring priming and gap rules.
    pub fn drain(&mut self) -> Vec<BufferedPacket> {
        let mut remaining: Vec<BufferedPacket> =
            std::mem::take(&mut self.packets).into_values().collect();
        // BTreeMap ordering is numeric; rotate so release order continues
        // from next_seq across a wraparound
        if let Some(next_seq) = self.next_seq {
            remaining.sort_by_key(|p| p.sequence.wrapping_sub(next_seq));
        }
        self.released += remaining.len() as u64;
        remaining
    }

    pub fn depth(&self) -> usize {
        self.packets.len()
    }

    pub fn released(&self) -> u64 {
        self.released
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn lost(&self) -> u64 {
        self.lost
    }
}

/// True when seq_a comes before seq_b in wraparound order
fn seq_before(seq_a: u16, seq_b: u16) -> bool {
    let diff = seq_b.wrapping_sub(seq_a);
    diff > 0 && diff < 0x8000
}
