//! Hash slot routing and slot ranges.
//!
//! Service names are routed onto a fixed keyspace of 16384 slots using
//! CRC16 (XMODEM polynomial). Slots are numbered `1..=16384`; slot 0 is
//! reserved, so a name hashing to 0 is routed to slot 1.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Total number of hash slots in the cluster.
pub const SLOT_COUNT: u16 = 16384;

/// Lowest assignable slot. Slot 0 is never assigned.
pub const FIRST_SLOT: u16 = 1;

/// CRC16 lookup table from Redis source code (crc16.c).
/// Uses CCITT polynomial for Redis Cluster slot calculation.
#[rustfmt::skip]
static CRC16_TABLE: [u16; 256] = [
    0x0000, 0x1021, 0x2042, 0x3063, 0x4084, 0x50a5, 0x60c6, 0x70e7,
    0x8108, 0x9129, 0xa14a, 0xb16b, 0xc18c, 0xd1ad, 0xe1ce, 0xf1ef,
    0x1231, 0x0210, 0x3273, 0x2252, 0x52b5, 0x4294, 0x72f7, 0x62d6,
    0x9339, 0x8318, 0xb37b, 0xa35a, 0xd3bd, 0xc39c, 0xf3ff, 0xe3de,
    0x2462, 0x3443, 0x0420, 0x1401, 0x64e6, 0x74c7, 0x44a4, 0x5485,
    0xa56a, 0xb54b, 0x8528, 0x9509, 0xe5ee, 0xf5cf, 0xc5ac, 0xd58d,
    0x3653, 0x2672, 0x1611, 0x0630, 0x76d7, 0x66f6, 0x5695, 0x46b4,
    0xb75b, 0xa77a, 0x9719, 0x8738, 0xf7df, 0xe7fe, 0xd79d, 0xc7bc,
    0x48c4, 0x58e5, 0x6886, 0x78a7, 0x0840, 0x1861, 0x2802, 0x3823,
    0xc9cc, 0xd9ed, 0xe98e, 0xf9af, 0x8948, 0x9969, 0xa90a, 0xb92b,
    0x5af5, 0x4ad4, 0x7ab7, 0x6a96, 0x1a71, 0x0a50, 0x3a33, 0x2a12,
    0xdbfd, 0xcbdc, 0xfbbf, 0xeb9e, 0x9b79, 0x8b58, 0xbb3b, 0xab1a,
    0x6ca6, 0x7c87, 0x4ce4, 0x5cc5, 0x2c22, 0x3c03, 0x0c60, 0x1c41,
    0xedae, 0xfd8f, 0xcdec, 0xddcd, 0xad2a, 0xbd0b, 0x8d68, 0x9d49,
    0x7e97, 0x6eb6, 0x5ed5, 0x4ef4, 0x3e13, 0x2e32, 0x1e51, 0x0e70,
    0xff9f, 0xefbe, 0xdfdd, 0xcffc, 0xbf1b, 0xaf3a, 0x9f59, 0x8f78,
    0x9188, 0x81a9, 0xb1ca, 0xa1eb, 0xd10c, 0xc12d, 0xf14e, 0xe16f,
    0x1080, 0x00a1, 0x30c2, 0x20e3, 0x5004, 0x4025, 0x7046, 0x6067,
    0x83b9, 0x9398, 0xa3fb, 0xb3da, 0xc33d, 0xd31c, 0xe37f, 0xf35e,
    0x02b1, 0x1290, 0x22f3, 0x32d2, 0x4235, 0x5214, 0x6277, 0x7256,
    0xb5ea, 0xa5cb, 0x95a8, 0x8589, 0xf56e, 0xe54f, 0xd52c, 0xc50d,
    0x34e2, 0x24c3, 0x14a0, 0x0481, 0x7466, 0x6447, 0x5424, 0x4405,
    0xa7db, 0xb7fa, 0x8799, 0x97b8, 0xe75f, 0xf77e, 0xc71d, 0xd73c,
    0x26d3, 0x36f2, 0x0691, 0x16b0, 0x6657, 0x7676, 0x4615, 0x5634,
    0xd94c, 0xc96d, 0xf90e, 0xe92f, 0x99c8, 0x89e9, 0xb98a, 0xa9ab,
    0x5844, 0x4865, 0x7806, 0x6827, 0x18c0, 0x08e1, 0x3882, 0x28a3,
    0xcb7d, 0xdb5c, 0xeb3f, 0xfb1e, 0x8bf9, 0x9bd8, 0xabbb, 0xbb9a,
    0x4a75, 0x5a54, 0x6a37, 0x7a16, 0x0af1, 0x1ad0, 0x2ab3, 0x3a92,
    0xfd2e, 0xed0f, 0xdd6c, 0xcd4d, 0xbdaa, 0xad8b, 0x9de8, 0x8dc9,
    0x7c26, 0x6c07, 0x5c64, 0x4c45, 0x3ca2, 0x2c83, 0x1ce0, 0x0cc1,
    0xef1f, 0xff3e, 0xcf5d, 0xdf7c, 0xaf9b, 0xbfba, 0x8fd9, 0x9ff8,
    0x6e17, 0x7e36, 0x4e55, 0x5e74, 0x2e93, 0x3eb2, 0x0ed1, 0x1ef0,
];

/// Computes CRC16 checksum using XMODEM polynomial.
fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        let idx = ((crc >> 8) ^ (byte as u16)) as usize;
        crc = (crc << 8) ^ CRC16_TABLE[idx];
    }
    crc
}

/// Computes the slot a service name routes to.
///
/// Returns a value in the range [1, 16383]: `crc16(name) mod 16384`, with a
/// result of 0 remapped to 1.
pub fn route_slot(name: &str) -> u16 {
    match crc16(name.as_bytes()) % SLOT_COUNT {
        0 => FIRST_SLOT,
        slot => slot,
    }
}

/// A contiguous, inclusive range of slots.
///
/// # Invariants
///
/// `FIRST_SLOT <= start <= end <= SLOT_COUNT`. The textual form is
/// `"start,end"`, which is also how ranges travel inside table messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct SlotRange {
    pub start: u16,
    pub end: u16, // inclusive
}

impl SlotRange {
    /// Creates a new slot range (end is inclusive).
    ///
    /// # Panics
    ///
    /// Panics if the range is empty or falls outside `1..=16384`.
    pub fn new(start: u16, end: u16) -> Self {
        match Self::try_new(start, end) {
            Ok(range) => range,
            Err(e) => panic!("{e}"),
        }
    }

    /// Creates a new slot range with runtime validation.
    ///
    /// Use this for untrusted input (e.g. network-decoded data).
    pub fn try_new(start: u16, end: u16) -> Result<Self, std::io::Error> {
        if start > end {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("SlotRange requires start <= end, got {start},{end}"),
            ));
        }
        if start < FIRST_SLOT || end > SLOT_COUNT {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("slot range {start},{end} outside {FIRST_SLOT},{SLOT_COUNT}"),
            ));
        }
        Ok(Self { start, end })
    }

    /// The whole keyspace.
    pub fn full() -> Self {
        Self {
            start: FIRST_SLOT,
            end: SLOT_COUNT,
        }
    }

    /// Creates a range containing a single slot.
    pub fn single(slot: u16) -> Self {
        Self::new(slot, slot)
    }

    /// Returns the number of slots in this range (always >= 1).
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> u16 {
        self.end - self.start + 1
    }

    /// Returns true if this range contains the given slot.
    pub fn contains(&self, slot: u16) -> bool {
        slot >= self.start && slot <= self.end
    }

    /// Returns true if the two ranges share at least one slot.
    pub fn overlaps(&self, other: &SlotRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    /// Returns an iterator over all slots in this range.
    pub fn iter(&self) -> impl Iterator<Item = u16> {
        self.start..=self.end
    }
}

impl std::fmt::Display for SlotRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{},{}", self.start, self.end)
    }
}

impl FromStr for SlotRange {
    type Err = std::io::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("invalid slot range '{s}', expected 'start,end'"),
            )
        };
        let (start, end) = s.split_once(',').ok_or_else(invalid)?;
        let start = start.trim().parse::<u16>().map_err(|_| invalid())?;
        let end = end.trim().parse::<u16>().map_err(|_| invalid())?;
        Self::try_new(start, end)
    }
}

impl From<SlotRange> for String {
    fn from(range: SlotRange) -> Self {
        range.to_string()
    }
}

impl TryFrom<String> for SlotRange {
    type Error = std::io::Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// Collapses a set of slot numbers into the fewest ranges.
///
/// Consecutive slots are merged; the input need not be sorted and may
/// contain duplicates.
pub fn ranges_from_slots(slots: impl IntoIterator<Item = u16>) -> Vec<SlotRange> {
    let mut sorted: Vec<u16> = slots.into_iter().collect();
    sorted.sort_unstable();
    sorted.dedup();

    let mut ranges = Vec::new();
    let mut iter = sorted.into_iter();
    let Some(first) = iter.next() else {
        return ranges;
    };

    let mut range_start = first;
    let mut prev = first;
    for slot in iter {
        if slot != prev + 1 {
            ranges.push(SlotRange::new(range_start, prev));
            range_start = slot;
        }
        prev = slot;
    }
    ranges.push(SlotRange::new(range_start, prev));
    ranges
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc16_matches_xmodem() {
        // CRC16 CCITT/XMODEM of "123456789" is 0x31C3 = 12739
        assert_eq!(crc16(b"123456789"), 0x31C3);
        assert_eq!(route_slot("123456789"), 12739);
        assert_eq!(route_slot("foo"), 12182);
        assert_eq!(route_slot("bar"), 5061);
    }

    #[test]
    fn zero_hash_routes_to_first_slot() {
        assert_eq!(crc16(b""), 0);
        assert_eq!(route_slot(""), FIRST_SLOT);
    }

    #[test]
    fn routing_never_returns_zero() {
        for i in 0..50_000 {
            let name = format!("service-{i}");
            let slot = route_slot(&name);
            assert_ne!(slot, 0, "{name} routed to reserved slot 0");
            assert!(slot < SLOT_COUNT);
        }
    }

    #[test]
    fn routing_is_deterministic() {
        assert_eq!(route_slot("order-service"), route_slot("order-service"));
    }

    #[test]
    fn slot_range_basics() {
        let range = SlotRange::new(1, 5461);
        assert_eq!(range.len(), 5461);
        assert!(range.contains(1));
        assert!(range.contains(5461));
        assert!(!range.contains(5462));
        assert!(!range.contains(0));

        let single = SlotRange::single(100);
        assert_eq!(single.len(), 1);
        assert!(single.contains(100));
        assert!(!single.contains(99));
        assert_eq!(SlotRange::full().len(), SLOT_COUNT);
    }

    #[test]
    fn slot_range_text_form() {
        assert_eq!(SlotRange::new(10, 20).to_string(), "10,20");
        assert_eq!("10,20".parse::<SlotRange>().unwrap(), SlotRange::new(10, 20));
        assert_eq!(" 1 , 16384".parse::<SlotRange>().unwrap(), SlotRange::full());
        assert!("10-20".parse::<SlotRange>().is_err());
        assert!("a,b".parse::<SlotRange>().is_err());
    }

    #[test]
    fn slot_range_try_new_validates() {
        assert!(SlotRange::try_new(1, 5461).is_ok());
        assert!(SlotRange::try_new(16384, 16384).is_ok());
        // start > end
        assert!(SlotRange::try_new(5000, 100).is_err());
        // slot 0 is reserved
        assert!(SlotRange::try_new(0, 10).is_err());
        // beyond the keyspace
        assert!(SlotRange::try_new(1, 16385).is_err());
    }

    #[test]
    fn slot_range_serde_uses_text_form() {
        let json = serde_json::to_string(&vec![SlotRange::new(1, 5), SlotRange::new(9, 9)]).unwrap();
        assert_eq!(json, r#"["1,5","9,9"]"#);
        let back: Vec<SlotRange> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, vec![SlotRange::new(1, 5), SlotRange::new(9, 9)]);
        assert!(serde_json::from_str::<SlotRange>(r#""0,5""#).is_err());
    }

    #[test]
    fn overlap_detection() {
        let a = SlotRange::new(10, 20);
        assert!(a.overlaps(&SlotRange::new(20, 30)));
        assert!(a.overlaps(&SlotRange::new(1, 10)));
        assert!(a.overlaps(&SlotRange::new(12, 14)));
        assert!(!a.overlaps(&SlotRange::new(21, 30)));
    }

    #[test]
    fn merging_slots_into_ranges() {
        let ranges = ranges_from_slots([5, 1, 2, 3, 10, 11, 200, 3]);
        assert_eq!(
            ranges,
            vec![
                SlotRange::new(1, 3),
                SlotRange::new(5, 5),
                SlotRange::new(10, 11),
                SlotRange::new(200, 200),
            ]
        );
        assert!(ranges_from_slots(std::iter::empty()).is_empty());
    }
}
