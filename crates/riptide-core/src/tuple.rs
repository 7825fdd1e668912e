//! Market quote tuples, window results and the fixed-size wire codec.
//!
//! Tuples arrive over a single TCP connection as fixed 64-byte little-endian
//! records. Two key values are reserved: [`KEY_EOS`] terminates the stream and
//! [`KEY_SYNC`] is sent exactly once at connection start to establish a shared
//! time origin between the external feed and the pipeline.

/// Reserved key: end-of-stream sentinel.
pub const KEY_EOS: i32 = -1;

/// Reserved key: time-synchronization handshake, first record on the wire.
pub const KEY_SYNC: i32 = -10;

/// Size in bytes of one wire record.
pub const RECORD_SIZE: usize = 64;

/// In-band migration marks carried by signal tuples during a reconfiguration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Punctuation {
    #[default]
    None,
    /// The receiving worker must donate the window for this key.
    MovingOut,
    /// The receiving worker must claim the window for this key.
    MovingIn,
    /// Probe tuple, processed but never counted in results.
    Testing,
}

/// One market quote.
///
/// `id` is the per-key sequence number assigned by the feed; `timestamp` and
/// `internal_id` are stamped by the routing stage (microseconds since the sync
/// origin, and a per-key arrival counter).
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Tuple {
    pub id: i64,
    pub key: i32,
    pub bid_price: f32,
    pub bid_size: i32,
    pub ask_price: f32,
    pub ask_size: i32,
    pub original_timestamp: i64,
    pub timestamp: i64,
    pub internal_id: i64,
    pub punctuation: Punctuation,
}

impl Tuple {
    pub fn is_eos(&self) -> bool {
        self.key == KEY_EOS
    }

    pub fn is_sync(&self) -> bool {
        self.key == KEY_SYNC
    }

    /// Encode into one wire record. Routing metadata (`timestamp`,
    /// `internal_id`, `punctuation`) is pipeline-internal and not on the wire.
    pub fn to_bytes(&self) -> [u8; RECORD_SIZE] {
        let mut buf = [0u8; RECORD_SIZE];
        buf[0..8].copy_from_slice(&self.id.to_le_bytes());
        buf[8..12].copy_from_slice(&self.key.to_le_bytes());
        buf[12..16].copy_from_slice(&self.bid_price.to_le_bytes());
        buf[16..20].copy_from_slice(&self.bid_size.to_le_bytes());
        buf[20..24].copy_from_slice(&self.ask_price.to_le_bytes());
        buf[24..28].copy_from_slice(&self.ask_size.to_le_bytes());
        buf[28..36].copy_from_slice(&self.original_timestamp.to_le_bytes());
        buf[36..44].copy_from_slice(&self.timestamp.to_le_bytes());
        buf
    }

    /// Decode one wire record.
    pub fn from_bytes(buf: &[u8; RECORD_SIZE]) -> Self {
        let le64 = |r: std::ops::Range<usize>| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&buf[r]);
            i64::from_le_bytes(b)
        };
        let le32 = |r: std::ops::Range<usize>| {
            let mut b = [0u8; 4];
            b.copy_from_slice(&buf[r]);
            i32::from_le_bytes(b)
        };
        let lef32 = |r: std::ops::Range<usize>| {
            let mut b = [0u8; 4];
            b.copy_from_slice(&buf[r]);
            f32::from_le_bytes(b)
        };
        Tuple {
            id: le64(0..8),
            key: le32(8..12),
            bid_price: lef32(12..16),
            bid_size: le32(16..20),
            ask_price: lef32(20..24),
            ask_size: le32(24..28),
            original_timestamp: le64(28..36),
            timestamp: le64(36..44),
            internal_id: 0,
            punctuation: Punctuation::None,
        }
    }
}

/// OHLC summary of the quotes in one window slide.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Candle {
    pub open: f32,
    pub close: f32,
    pub high: f32,
    pub low: f32,
}

/// Result of one window computation for one key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WinResult {
    pub key: i32,
    /// Internal id of the triggering tuple; consecutive results for a key
    /// differ by the window slide.
    pub internal_id: i64,
    pub window_id: i64,
    /// Timestamp of the triggering tuple, base for latency accounting.
    pub timestamp: i64,
    pub fit_bid: [f64; 3],
    pub fit_ask: [f64; 3],
    pub candle_bid: Candle,
    pub candle_ask: Candle,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_roundtrip() {
        let t = Tuple {
            id: 42,
            key: 7,
            bid_price: 101.25,
            bid_size: 300,
            ask_price: 101.5,
            ask_size: 150,
            original_timestamp: 1_000_000,
            timestamp: 999,
            ..Default::default()
        };
        let decoded = Tuple::from_bytes(&t.to_bytes());
        assert_eq!(decoded.id, 42);
        assert_eq!(decoded.key, 7);
        assert_eq!(decoded.bid_price, 101.25);
        assert_eq!(decoded.ask_size, 150);
        assert_eq!(decoded.original_timestamp, 1_000_000);
        assert_eq!(decoded.punctuation, Punctuation::None);
    }

    #[test]
    fn test_sentinels() {
        let eos = Tuple {
            key: KEY_EOS,
            ..Default::default()
        };
        assert!(eos.is_eos());
        let sync = Tuple {
            key: KEY_SYNC,
            ..Default::default()
        };
        assert!(sync.is_sync());
        assert!(!sync.is_eos());
    }

    #[test]
    fn test_record_size_fixed() {
        let t = Tuple::default();
        assert_eq!(t.to_bytes().len(), RECORD_SIZE);
    }
}
