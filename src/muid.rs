//! MUID — the 28-bit node identifier used throughout MIDI-CI.

use std::collections::hash_map::RandomState;
use std::fmt;
use std::hash::{BuildHasher, Hasher};
use std::time::{SystemTime, UNIX_EPOCH};

/// 28-bit MIDI-CI node identifier, transmitted on the wire as four 7-bit bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Muid(u32);

const MASK_28BIT: u32 = 0x0FFF_FFFF;

impl Muid {
    /// Reserved broadcast MUID — every node accepts frames addressed to it.
    pub const BROADCAST: Muid = Muid(MASK_28BIT);

    /// Builds a MUID from a raw value, masking to 28 bits.
    pub fn new(value: u32) -> Self {
        Muid(value & MASK_28BIT)
    }

    /// Generates a fresh MUID for a node coming online.
    ///
    /// Nodes regenerate their MUID on restart, so this just needs enough
    /// entropy to make collisions within a topology unlikely; it doesn't need
    /// to be cryptographically secure. `RandomState`'s per-process seed mixed
    /// with the current time and pid is enough for that and avoids pulling in
    /// a dedicated RNG dependency for a single call site.
    pub fn random() -> Self {
        let mut hasher = RandomState::new().build_hasher();
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        hasher.write_u64(nanos);
        hasher.write_u32(std::process::id());
        let candidate = (hasher.finish() as u32) & MASK_28BIT;
        // Broadcast is reserved; never hand it out as a node's own identity.
        if candidate == MASK_28BIT {
            Muid(candidate - 1)
        } else {
            Muid(candidate)
        }
    }

    pub fn value(&self) -> u32 {
        self.0
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Muid::BROADCAST
    }

    /// Encodes as four 7-bit bytes, LSB first.
    pub fn to_bytes(&self) -> [u8; 4] {
        [
            (self.0 & 0x7F) as u8,
            ((self.0 >> 7) & 0x7F) as u8,
            ((self.0 >> 14) & 0x7F) as u8,
            ((self.0 >> 21) & 0x7F) as u8,
        ]
    }

    /// Decodes from four 7-bit bytes, LSB first. Ignores the high bit of each
    /// byte rather than rejecting it, matching the codec's lenient-parse
    /// stance elsewhere.
    pub fn from_bytes(bytes: [u8; 4]) -> Self {
        let value = (bytes[0] as u32 & 0x7F)
            | ((bytes[1] as u32 & 0x7F) << 7)
            | ((bytes[2] as u32 & 0x7F) << 14)
            | ((bytes[3] as u32 & 0x7F) << 21);
        Muid(value)
    }
}

impl fmt::Display for Muid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

impl From<u32> for Muid {
    fn from(value: u32) -> Self {
        Muid::new(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_through_bytes() {
        let muid = Muid::new(0x0ABC_DEF1 & MASK_28BIT);
        let bytes = muid.to_bytes();
        assert_eq!(Muid::from_bytes(bytes), muid);
    }

    #[test]
    fn broadcast_is_all_ones() {
        assert_eq!(Muid::BROADCAST.value(), 0x0FFF_FFFF);
        assert!(Muid::BROADCAST.is_broadcast());
    }

    #[test]
    fn new_masks_to_28_bits() {
        let muid = Muid::new(0xFFFF_FFFF);
        assert_eq!(muid.value(), MASK_28BIT);
    }

    #[test]
    fn random_never_yields_broadcast() {
        for _ in 0..64 {
            assert_ne!(Muid::random(), Muid::BROADCAST);
        }
    }
}
