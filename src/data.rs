//! Data items flowing through the array
//!
//! A [`DataItem`] is the unit of everything the simulator moves around:
//! feature-map fragments produced by a tile's computation, and control
//! records that broadcast an early-exit decision for one image. The two
//! kinds are modeled as tagged variants rather than a flat tuple with
//! sentinel fields, so the type system carries the distinction and the
//! size rule for each kind is explicit.
//!
//! Items are **value types**: identity is structural equality over the
//! fields, which is what the buffers use to match a delivered item against
//! a dependence's `wait`/`drop` sets.

use serde::{Deserialize, Serialize};

/// One item travelling between tiles.
///
/// `Payload` carries a rectangular fragment of a feature map; its size in
/// bits is `(end - start) * bit`. `Control` carries one image's early-exit
/// decision; its size is the explicit `length` in bits.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DataItem {
    /// A normal feature-map fragment.
    Payload {
        /// Row coordinate of the fragment.
        x: i64,
        /// Column coordinate of the fragment.
        y: i64,
        /// First channel (inclusive).
        start: u64,
        /// Last channel (exclusive).
        end: u64,
        /// Bits per element.
        bit: u64,
        /// Total element count of the full map (bookkeeping only).
        total: u64,
        /// Throughput index of the image this fragment belongs to.
        image_id: usize,
        /// Layer that produced the fragment.
        layer_id: i64,
        /// Input slot on the consuming side.
        in_id: i64,
        /// Behavior-level id of the producing tile.
        tile_id: i64,
    },
    /// An early-exit decision record.
    Control {
        /// Image the decision applies to.
        image_id: usize,
        /// True when the image exits early and downstream work is dropped.
        exit: bool,
        /// Record length in bits.
        length: u64,
        /// Behavior-level id of the deciding tile.
        tile_id: i64,
    },
}

impl DataItem {
    /// Size of the item in bits.
    #[inline]
    pub fn size_bits(&self) -> u64 {
        match self {
            DataItem::Payload { start, end, bit, .. } => {
                debug_assert!(end >= start, "payload channel range is inverted");
                (end - start) * bit
            }
            DataItem::Control { length, .. } => *length,
        }
    }

    /// Throughput index of the image this item belongs to.
    #[inline]
    pub fn image_id(&self) -> usize {
        match self {
            DataItem::Payload { image_id, .. } | DataItem::Control { image_id, .. } => *image_id,
        }
    }

    /// Behavior-level id of the tile that produced the item.
    #[inline]
    pub fn tile_id(&self) -> i64 {
        match self {
            DataItem::Payload { tile_id, .. } | DataItem::Control { tile_id, .. } => *tile_id,
        }
    }

    /// True for exit-decision records.
    #[inline]
    pub fn is_control(&self) -> bool {
        matches!(self, DataItem::Control { .. })
    }

    /// The same item re-stamped for another image of the workload.
    ///
    /// Behavior templates describe one pass; unrolling a pass for image `i`
    /// rewrites only this field.
    #[inline]
    pub fn with_image(&self, image: usize) -> Self {
        let mut item = self.clone();
        match &mut item {
            DataItem::Payload { image_id, .. } | DataItem::Control { image_id, .. } => {
                *image_id = image;
            }
        }
        item
    }
}

/// Total size of a batch of items in bits.
#[inline]
pub fn batch_bits(items: &[DataItem]) -> u64 {
    items.iter().map(DataItem::size_bits).sum()
}

/// Per-tile record of the early-exit decisions observed so far.
///
/// `watermark` is the image id of the latest decision (−1 before any
/// arrives); `table` lists the images that actually exited. Decisions must
/// arrive with strictly increasing image ids; the owning tile enforces
/// this. Buffers receive the table by reference when filtering, so there
/// is a single owner and no shared handles.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExitTable {
    /// Image id of the latest observed decision, −1 initially.
    pub watermark: i64,
    /// Images whose exit bit was set.
    pub table: Vec<usize>,
}

impl ExitTable {
    /// An empty table: no decision seen yet.
    pub fn new() -> Self {
        Self { watermark: -1, table: Vec::new() }
    }

    /// True iff `image` has been signalled as exited.
    #[inline]
    pub fn contains(&self, image: usize) -> bool {
        self.table.contains(&image)
    }
}

impl Default for ExitTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(image: usize) -> DataItem {
        DataItem::Payload {
            x: 1,
            y: 2,
            start: 0,
            end: 8,
            bit: 4,
            total: 64,
            image_id: image,
            layer_id: 0,
            in_id: 0,
            tile_id: 7,
        }
    }

    #[test]
    fn payload_size_is_channel_range_times_width() {
        assert_eq!(payload(0).size_bits(), 32);
    }

    #[test]
    fn control_size_is_explicit_length() {
        let c = DataItem::Control { image_id: 3, exit: true, length: 14, tile_id: 7 };
        assert_eq!(c.size_bits(), 14);
        assert!(c.is_control());
        assert_eq!(c.image_id(), 3);
    }

    #[test]
    fn with_image_rewrites_only_the_image_field() {
        let a = payload(0);
        let b = a.with_image(5);
        assert_eq!(b.image_id(), 5);
        assert_eq!(b.with_image(0), a);
        // identity is structural
        assert_ne!(a, b);
        assert_eq!(a, payload(0));
    }

    #[test]
    fn exit_table_starts_empty() {
        let t = ExitTable::new();
        assert_eq!(t.watermark, -1);
        assert!(!t.contains(0));
    }
}
