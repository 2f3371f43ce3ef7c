//! Uniform-grid spatial indexes for separation queries.
//!
//! [`SpatialIndex`] buckets circles into square cells no smaller than the
//! largest radius, so a conflict query only scans the 3×3 block of buckets
//! around the query point. [`PartitionedIndex`] holds one `SpatialIndex` per
//! placement tile in a `DashMap`, letting tiles of the same phase insert
//! concurrently while reading their already-committed neighbours.

use dashmap::DashMap;
use hashbrown::HashMap;

/// A circle occupying space in an index.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SpatialEntry {
    pub x: f64,
    pub y: f64,
    pub radius: f64,
}

impl SpatialEntry {
    pub fn new(x: f64, y: f64, radius: f64) -> Self {
        Self { x, y, radius }
    }

    /// True when the two centres are closer than the larger radius.
    #[inline]
    pub fn conflicts_with(&self, other: &SpatialEntry) -> bool {
        let r = self.radius.max(other.radius);
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        dx * dx + dy * dy < r * r
    }
}

/// Single-writer grid index.
#[derive(Clone, Debug)]
pub struct SpatialIndex {
    bucket_size: f64,
    buckets: HashMap<(i64, i64), Vec<SpatialEntry>>,
    len: usize,
}

impl SpatialIndex {
    /// `bucket_size` should be at least the largest radius ever inserted or queried.
    pub fn new(bucket_size: f64) -> Self {
        Self {
            bucket_size: bucket_size.max(1.0),
            buckets: HashMap::new(),
            len: 0,
        }
    }

    fn bucket(&self, v: f64) -> i64 {
        (v / self.bucket_size).floor() as i64
    }

    pub fn insert(&mut self, entry: SpatialEntry) {
        let key = (self.bucket(entry.x), self.bucket(entry.y));
        self.buckets.entry(key).or_default().push(entry);
        self.len += 1;
    }

    /// Whether any stored circle conflicts with `candidate`.
    pub fn conflicts(&self, candidate: &SpatialEntry) -> bool {
        let reach = candidate.radius.max(self.bucket_size);
        let (x0, x1) = (self.bucket(candidate.x - reach), self.bucket(candidate.x + reach));
        let (y0, y1) = (self.bucket(candidate.y - reach), self.bucket(candidate.y + reach));
        for by in y0..=y1 {
            for bx in x0..=x1 {
                if let Some(entries) = self.buckets.get(&(bx, by)) {
                    if entries.iter().any(|e| e.conflicts_with(candidate)) {
                        return true;
                    }
                }
            }
        }
        false
    }

    /// Whether any stored centre lies strictly within `distance` of `(x, y)`.
    pub fn any_within(&self, x: f64, y: f64, distance: f64) -> bool {
        self.conflicts(&SpatialEntry::new(x, y, distance))
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Concurrent index partitioned by placement tile.
///
/// Each tile has exactly one writer; readers only ever hold one shard guard
/// at a time.
pub struct PartitionedIndex {
    tile_size: f64,
    bucket_size: f64,
    partitions: DashMap<(i64, i64), SpatialIndex>,
}

impl PartitionedIndex {
    pub fn new(tile_size: u32, bucket_size: f64) -> Self {
        Self {
            tile_size: tile_size.max(1) as f64,
            bucket_size,
            partitions: DashMap::new(),
        }
    }

    fn tile_of(&self, v: f64) -> i64 {
        (v / self.tile_size).floor() as i64
    }

    /// Insert into the partition of `tile`.
    pub fn insert(&self, tile: (i64, i64), entry: SpatialEntry) {
        self.partitions
            .entry(tile)
            .or_insert_with(|| SpatialIndex::new(self.bucket_size))
            .insert(entry);
    }

    /// Conflict query across every partition the candidate can reach.
    pub fn conflicts(&self, candidate: &SpatialEntry) -> bool {
        let reach = candidate.radius.max(self.bucket_size);
        let (tx0, tx1) = (self.tile_of(candidate.x - reach), self.tile_of(candidate.x + reach));
        let (ty0, ty1) = (self.tile_of(candidate.y - reach), self.tile_of(candidate.y + reach));
        for ty in ty0..=ty1 {
            for tx in tx0..=tx1 {
                let hit = self
                    .partitions
                    .get(&(tx, ty))
                    .is_some_and(|index| index.conflicts(candidate));
                if hit {
                    return true;
                }
            }
        }
        false
    }

    pub fn len(&self) -> usize {
        self.partitions.iter().map(|p| p.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
