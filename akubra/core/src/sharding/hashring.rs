//! Consistent-Hash Ring
//!
//! Shard identifiers are hashed with 64-bit FNV-1a and placed on a circle;
//! a key resolves to the first shard clockwise from its own hash, wrapping
//! around at the end. One placement per shard keeps the ring exactly as
//! balanced as the weighted shard assignment that feeds it.

/// 64-bit FNV-1a.
pub(crate) fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash = 14_695_981_039_346_656_037_u64;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(1_099_511_628_211);
    }
    hash
}

/// Immutable consistent-hash ring over shard names.
pub struct HashRing {
    // Sorted by hash; lookup is a binary search.
    points: Vec<(u64, String)>,
}

impl HashRing {
    /// Place every shard on the ring. The ring is fixed afterwards.
    #[must_use]
    pub fn new(shards: impl IntoIterator<Item = String>) -> Self {
        let mut points: Vec<(u64, String)> = shards
            .into_iter()
            .map(|shard| (fnv1a(shard.as_bytes()), shard))
            .collect();
        points.sort_unstable();
        Self { points }
    }

    /// The shard owning `key`, or `None` on an empty ring.
    #[must_use]
    pub fn locate(&self, key: &str) -> Option<&str> {
        if self.points.is_empty() {
            return None;
        }
        let hash = fnv1a(key.as_bytes());
        let index = match self.points.binary_search_by(|(h, _)| h.cmp(&hash)) {
            Ok(i) => i,
            Err(i) if i == self.points.len() => 0,
            Err(i) => i,
        };
        Some(&self.points[index].1)
    }

    /// Number of shards on the ring.
    #[must_use]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// True when no shard has been placed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

// ============================================================================
// Tests
// ============================================================================
