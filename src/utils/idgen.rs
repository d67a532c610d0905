use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use uuid::Uuid;

/// 100ns ticks between 1582-10-15T00:00:00Z and the Unix epoch.
pub const GREGORIAN_TO_UNIX_TICKS: u64 = 122_192_928_000_000_000;

const TIMESTAMP_MASK: u64 = (1 << 60) - 1;

/// Time source for the identifier generator.
pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// 100ns ticks since the Gregorian epoch, truncated to 60 bits.
pub fn gregorian_ticks(t: SystemTime) -> u64 {
    let ticks = match t.duration_since(UNIX_EPOCH) {
        Ok(since) => GREGORIAN_TO_UNIX_TICKS + (since.as_nanos() / 100) as u64,
        Err(before) => {
            GREGORIAN_TO_UNIX_TICKS.saturating_sub((before.duration().as_nanos() / 100) as u64)
        }
    };
    ticks & TIMESTAMP_MASK
}

/// A 128-bit identifier in the version-1 UUID layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeOrderedId([u8; 16]);

impl TimeOrderedId {
    pub fn from_parts(timestamp: u64, clock_sequence: u32, node: [u8; 6]) -> Self {
        let mut b = [0u8; 16];
        b[0..4].copy_from_slice(&(timestamp as u32).to_be_bytes());
        b[4..6].copy_from_slice(&((timestamp >> 32) as u16).to_be_bytes());
        let hi = ((timestamp >> 48) as u16 & 0x0FFF) | 0x1000;
        b[6..8].copy_from_slice(&hi.to_be_bytes());
        let seq = (clock_sequence as u16 & 0x3FFF) | 0x8000;
        b[8..10].copy_from_slice(&seq.to_be_bytes());
        b[10..16].copy_from_slice(&node);
        Self(b)
    }

    pub fn timestamp(&self) -> u64 {
        let b = &self.0;
        let low = u32::from_be_bytes([b[0], b[1], b[2], b[3]]) as u64;
        let mid = u16::from_be_bytes([b[4], b[5]]) as u64;
        let hi = (u16::from_be_bytes([b[6], b[7]]) & 0x0FFF) as u64;
        (hi << 48) | (mid << 32) | low
    }

    pub fn version(&self) -> u8 {
        self.0[6] >> 4
    }

    /// The two high bits of byte 8; always `0b10`.
    pub fn variant(&self) -> u8 {
        self.0[8] >> 6
    }

    pub fn clock_sequence(&self) -> u16 {
        u16::from_be_bytes([self.0[8], self.0[9]]) & 0x3FFF
    }

    pub fn node(&self) -> [u8; 6] {
        let mut node = [0u8; 6];
        node.copy_from_slice(&self.0[10..16]);
        node
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn to_uuid(&self) -> Uuid {
        Uuid::from_bytes(self.0)
    }
}

impl fmt::Display for TimeOrderedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_uuid().hyphenated())
    }
}

#[derive(Debug)]
struct SequenceState {
    last_timestamp: u64,
    clock_sequence: u32,
}

/// Generator of time-ordered identifiers.
///
/// Create one per process and share it (`Arc<IdentifierGenerator>`); the node
/// value and the clock-sequence counter belong to the instance. The sequence
/// starts at a random value so a restarted process does not repeat
/// identifiers issued before the restart at the same timestamp.
///
/// Only the low 14 bits of the counter are encoded, so a stall while those
/// bits are `0x3FFF` wraps the visible clock sequence to 0.
pub struct IdentifierGenerator<C: Clock = SystemClock> {
    clock: C,
    node: [u8; 6],
    state: Mutex<SequenceState>,
}

impl IdentifierGenerator<SystemClock> {
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }
}

impl Default for IdentifierGenerator<SystemClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Clock> IdentifierGenerator<C> {
    pub fn with_clock(clock: C) -> Self {
        let mut node: [u8; 6] = rand::random();
        // Random node ids carry the multicast bit (RFC 4122, section 4.5).
        node[0] |= 0x01;
        Self::with_parts(clock, node, rand::random())
    }

    pub fn with_parts(clock: C, node: [u8; 6], initial_sequence: u32) -> Self {
        Self {
            clock,
            node,
            state: Mutex::new(SequenceState {
                last_timestamp: 0,
                clock_sequence: initial_sequence,
            }),
        }
    }

    pub fn node(&self) -> [u8; 6] {
        self.node
    }

    pub fn next(&self) -> TimeOrderedId {
        let timestamp = gregorian_ticks(self.clock.now());

        let seq = {
            let mut state = self.state.lock();
            if timestamp <= state.last_timestamp {
                state.clock_sequence = state.clock_sequence.wrapping_add(1);
            }
            state.last_timestamp = timestamp;
            state.clock_sequence
        };

        TimeOrderedId::from_parts(timestamp, seq, self.node)
    }
}

impl<C: Clock> fmt::Debug for IdentifierGenerator<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentifierGenerator")
            .field("node", &hex::encode(self.node))
            .finish_non_exhaustive()
    }
}
