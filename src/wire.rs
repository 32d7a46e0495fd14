//! Physical links and the wire net
//!
//! The array's only shared resource is the set of wires between adjacent
//! grid cells. A [`WireNet`] owns every horizontal and vertical wire of an
//! R×C grid in one dense vector, addressed by [`WireId`]; segment-to-id
//! resolution is pure index arithmetic, no hashing on the hot path. The
//! canonical string form of a segment ([`map_key`]) is used only at the
//! reporting boundary, where paths are exchanged as stable keys.
//!
//! ### Transparent vs. opaque
//! In **opaque** mode a wire carries at most one active path at a time:
//! state queries report real occupancy and grants mark wires busy. In
//! **transparent** mode every query reports "free" and every set is a
//! no-op, which turns the same schedule into a conflict-free lower bound.
//! The mode is a property of the net, toggled between evaluation passes.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::data::{batch_bits, DataItem};
use crate::SimTime;

/// A cell position on the tile grid.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Position {
    /// Grid row.
    pub row: usize,
    /// Grid column.
    pub col: usize,
}

impl Position {
    /// Construct a position.
    #[inline]
    pub fn new(row: usize, col: usize) -> Self {
        Self { row, col }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.row, self.col)
    }
}

/// An ordered pair of adjacent positions identifying one wire.
///
/// Canonical form keeps the smaller endpoint first; [`canonical_segment`]
/// produces it and every lookup expects it.
pub type Segment = (Position, Position);

/// Dense index of a wire inside a [`WireNet`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WireId(pub usize);

impl WireId {
    /// Access the underlying index.
    #[inline]
    pub fn as_usize(self) -> usize {
        self.0
    }
}

/// Order a pair of endpoints into canonical form.
#[inline]
pub fn canonical_segment(a: Position, b: Position) -> Segment {
    if a <= b { (a, b) } else { (b, a) }
}

/// Stable string key of a segment, identical for path reporting and any
/// name-based lookup.
pub fn map_key(segment: &Segment) -> String {
    format!(
        "(({}, {}), ({}, {}))",
        segment.0.row, segment.0.col, segment.1.row, segment.1.col
    )
}

/// Errors raised by the wire net.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// A path referenced a pair of cells that no wire connects.
    #[error("no wire between {a} and {b}")]
    NotAdjacent {
        /// First endpoint.
        a: Position,
        /// Second endpoint.
        b: Position,
    },
    /// A wire was still occupied when the run finished.
    #[error("wire {key} still busy at finish")]
    Busy {
        /// Canonical key of the offending wire.
        key: String,
    },
}

/// One physical link between two adjacent cells.
#[derive(Clone, Debug)]
pub struct Wire {
    segment: Segment,
    band_width: f64,
    busy: bool,
}

impl Wire {
    /// Canonical segment of this wire.
    #[inline]
    pub fn segment(&self) -> &Segment {
        &self.segment
    }

    /// Time for `bits` to cross this wire.
    #[inline]
    fn transfer_time(&self, bits: u64) -> SimTime {
        bits as f64 / self.band_width
    }
}

/// All wires of an R×C grid, horizontal wires first, then vertical.
#[derive(Debug)]
pub struct WireNet {
    rows: usize,
    cols: usize,
    transparent: bool,
    wires: Vec<Wire>,
}

impl WireNet {
    /// Build the full net for a `(rows, cols)` grid with a uniform link
    /// bandwidth in bits per simulated time unit.
    pub fn new(shape: (usize, usize), band_width: f64) -> Self {
        let (rows, cols) = shape;
        let mut wires = Vec::with_capacity(rows * cols.saturating_sub(1) + cols * rows.saturating_sub(1));
        for i in 0..rows {
            for j in 0..cols.saturating_sub(1) {
                let segment = (Position::new(i, j), Position::new(i, j + 1));
                wires.push(Wire { segment, band_width, busy: false });
            }
        }
        for j in 0..cols {
            for i in 0..rows.saturating_sub(1) {
                let segment = (Position::new(i, j), Position::new(i + 1, j));
                wires.push(Wire { segment, band_width, busy: false });
            }
        }
        Self { rows, cols, transparent: false, wires }
    }

    /// Number of wires in the net.
    #[inline]
    pub fn wire_count(&self) -> usize {
        self.wires.len()
    }

    /// Switch between transparent (never blocking) and opaque mode.
    pub fn set_transparent_flag(&mut self, transparent: bool) {
        self.transparent = transparent;
    }

    /// Resolve a canonical segment to its dense id.
    pub fn wire_id(&self, segment: &Segment) -> Result<WireId, WireError> {
        let (a, b) = *segment;
        let horizontal_count = self.rows * self.cols.saturating_sub(1);
        if a.row == b.row && b.col == a.col + 1 && b.col < self.cols {
            return Ok(WireId(a.row * (self.cols - 1) + a.col));
        }
        if a.col == b.col && b.row == a.row + 1 && b.row < self.rows {
            return Ok(WireId(horizontal_count + a.col * (self.rows - 1) + a.row));
        }
        Err(WireError::NotAdjacent { a, b })
    }

    /// True iff every wire of the path is free. Always true in
    /// transparent mode.
    pub fn get_data_path_state(&self, path: &[WireId]) -> bool {
        if self.transparent {
            return true;
        }
        path.iter().all(|id| !self.wires[id.as_usize()].busy)
    }

    /// Mark every wire of the path busy or free. A no-op in transparent
    /// mode.
    pub fn set_data_path_state(&mut self, path: &[WireId], busy: bool) {
        if self.transparent {
            return;
        }
        for id in path {
            self.wires[id.as_usize()].busy = busy;
        }
    }

    /// Transfer duration for `items` along `path`: bits over bandwidth,
    /// summed per wire.
    pub fn get_wire_transfer_time(&self, path: &[WireId], items: &[DataItem]) -> SimTime {
        let bits = batch_bits(items);
        path.iter().map(|id| self.wires[id.as_usize()].transfer_time(bits)).sum()
    }

    /// At the end of a run no wire may be busy.
    pub fn check_finish(&self) -> Result<(), WireError> {
        for wire in &self.wires {
            if wire.busy {
                return Err(WireError::Busy { key: map_key(&wire.segment) });
            }
        }
        Ok(())
    }
}
