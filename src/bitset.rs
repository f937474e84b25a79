//! Compressed set of epoch values backed by a [roaring bitmap][roaring].
//!
//! One `TimeSet` holds the values present within a single partition for one
//! (index, entity, granularity). Serialization uses the portable roaring
//! format, so blobs written by other runtimes deserialize unchanged.
//!
//! [roaring]: https://roaringbitmap.org

use croaring::{Bitmap, Portable};

use crate::error::{IndexError, Result};

#[derive(Debug, Clone)]
pub struct TimeSet {
    bitmap: Bitmap,
}

impl Default for TimeSet {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSet {
    pub fn new() -> Self {
        Self {
            bitmap: Bitmap::new(),
        }
    }

    pub fn contains(&self, value: u32) -> bool {
        self.bitmap.contains(value)
    }

    /// Adds a value. Idempotent.
    pub fn add(&mut self, value: u32) {
        self.bitmap.add(value);
    }

    pub fn add_all(&mut self, values: &[u32]) {
        self.bitmap.add_many(values);
    }

    /// Largest member strictly less than `value`.
    pub fn prev_of(&self, value: u32) -> Option<u32> {
        if value == 0 {
            return None;
        }
        let below = self.bitmap.rank(value - 1);
        if below == 0 {
            return None;
        }
        self.bitmap.select(below as u32 - 1)
    }

    /// Smallest member strictly greater than `value`.
    pub fn next_of(&self, value: u32) -> Option<u32> {
        let at_or_below = self.bitmap.rank(value);
        if at_or_below >= self.bitmap.cardinality() {
            return None;
        }
        self.bitmap.select(at_or_below as u32)
    }

    pub fn minimum(&self) -> Option<u32> {
        self.bitmap.minimum()
    }

    pub fn maximum(&self) -> Option<u32> {
        self.bitmap.maximum()
    }

    pub fn union_with(&mut self, other: &TimeSet) {
        self.bitmap.or_inplace(&other.bitmap);
    }

    pub fn cardinality(&self) -> u64 {
        self.bitmap.cardinality()
    }

    pub fn is_empty(&self) -> bool {
        self.bitmap.is_empty()
    }

    /// Approximate retained size of the compressed set.
    pub fn size_in_bytes(&self) -> usize {
        self.bitmap.get_serialized_size_in_bytes::<Portable>()
    }

    /// Members in ascending order.
    pub fn to_vec(&self) -> Vec<u32> {
        self.bitmap.to_vec()
    }

    pub fn serialize(&self) -> Vec<u8> {
        self.bitmap.serialize::<Portable>()
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        Bitmap::try_deserialize::<Portable>(bytes)
            .map(|bitmap| Self { bitmap })
            .ok_or_else(|| IndexError::Serialization("not a portable roaring bitmap".into()))
    }
}

impl FromIterator<u32> for TimeSet {
    fn from_iter<I: IntoIterator<Item = u32>>(iter: I) -> Self {
        Self {
            bitmap: Bitmap::from_iter(iter),
        }
    }
}
