//! Tile-side buffers and the capacity/reservation discipline
//!
//! Every tile owns one [`InputBuffer`] and one [`OutputBuffer`]. The input
//! buffer is the interesting one: besides resident items it tracks
//! `transfer_data`: items that were *granted* a wire path but have not
//! finished crossing it. Reserved bits count against capacity, so a
//! scheduler can never grant a transfer that would overflow a consumer
//! whose earlier in-flight transfers are still pending. Delivery then
//! *consumes* the matching reservation; a delivery with no reservation is
//! a contract violation.
//!
//! Residency checks are memoized behind a monotone version counter: any
//! mutation bumps the version, so a stale memo can never be observed.
//!
//! Flags:
//! - `start_flag` marks a buffer backed by the environment (layer-0
//!   inputs): residency checks succeed, writes are rejected, deletes are
//!   no-ops.
//! - `end_flag` marks a terminal buffer: effective capacity is unbounded
//!   and, on the output side, items are never offered for transfer.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::data::{batch_bits, DataItem, ExitTable};

/// Errors raised by buffer operations. All of them are contract
/// violations: the simulator is deterministic, so they indicate a broken
/// workload description or scheduling bug, never a transient condition.
#[derive(Debug, thiserror::Error)]
pub enum BufferError {
    /// An item was deleted or delivered that is not present.
    #[error("no matching item for {op}: {item:?}")]
    MissingData {
        /// Operation that failed to find the item.
        op: &'static str,
        /// The item in question.
        item: DataItem,
    },
    /// An add would exceed the configured capacity.
    #[error("buffer overflow: need {need} bits, {remain} bits remain")]
    Overflow {
        /// Bits required by the rejected batch.
        need: u64,
        /// Bits currently available.
        remain: f64,
    },
    /// A delivery targeted an environment-backed (source) buffer.
    #[error("delivery into a source-backed input buffer")]
    SourceWrite,
    /// The buffer still holds items at the end of the run.
    #[error("buffer not drained at finish: {residual} item(s) left, head {head:?}")]
    NotDrained {
        /// Number of leftover items.
        residual: usize,
        /// First leftover item, for diagnostics.
        head: Option<DataItem>,
    },
}

fn batch_fingerprint(items: &[DataItem]) -> u64 {
    let mut h = DefaultHasher::new();
    items.hash(&mut h);
    h.finish()
}

// ============================================================================
// Input buffer
// ============================================================================

/// Consumer-side buffer: resident items plus in-flight reservations.
#[derive(Debug)]
pub struct InputBuffer {
    buffer_size: u64,
    data: Vec<DataItem>,
    used_bits: u64,
    transfer_data: Vec<DataItem>,
    transfer_bits: u64,
    /// Bumped on every mutation; guards the residency memo.
    version: u64,
    memo: Option<(u64, u64, bool)>,
    start_flag: bool,
    end_flag: bool,
}

impl InputBuffer {
    /// A new empty buffer with `buffer_size` bits of capacity.
    pub fn new(buffer_size: u64) -> Self {
        Self {
            buffer_size,
            data: Vec::new(),
            used_bits: 0,
            transfer_data: Vec::new(),
            transfer_bits: 0,
            version: 0,
            memo: None,
            start_flag: false,
            end_flag: false,
        }
    }

    /// Mark this buffer as environment-backed (layer-0 source).
    pub fn set_start(&mut self) {
        self.start_flag = true;
    }

    /// Mark this buffer as terminal: capacity becomes unbounded.
    pub fn set_end(&mut self) {
        self.end_flag = true;
    }

    /// Whether the buffer is environment-backed.
    #[inline]
    pub fn start_flag(&self) -> bool {
        self.start_flag
    }

    /// Remaining capacity in bits, counting in-flight reservations.
    pub fn remain_bits(&self) -> f64 {
        if self.end_flag {
            return f64::INFINITY;
        }
        self.buffer_size as f64 - self.used_bits as f64 - self.transfer_bits as f64
    }

    /// True iff `items` fit into the remaining capacity.
    pub fn check_enough_space(&self, items: &[DataItem]) -> bool {
        batch_bits(items) as f64 <= self.remain_bits()
    }

    /// Reserve capacity for items that were granted a path and are now
    /// crossing wires. The bits count against capacity until the matching
    /// [`InputBuffer::add`] consumes the reservation.
    pub fn add_transfer(&mut self, items: &[DataItem]) {
        for item in items {
            self.transfer_bits += item.size_bits();
            self.transfer_data.push(item.clone());
        }
    }

    /// Finalize a delivery.
    ///
    /// Every item must carry an earlier reservation, which this call
    /// consumes. Control records are never stored; neither are items whose
    /// image has already exited per `exit_table`. The rest become resident.
    pub fn add(
        &mut self,
        items: &[DataItem],
        exit_table: Option<&ExitTable>,
    ) -> Result<(), BufferError> {
        if self.start_flag {
            return Err(BufferError::SourceWrite);
        }
        for item in items {
            let pos = self
                .transfer_data
                .iter()
                .position(|t| t == item)
                .ok_or_else(|| BufferError::MissingData { op: "consume reservation", item: item.clone() })?;
            self.transfer_data.remove(pos);
            self.transfer_bits -= item.size_bits();
        }
        for item in items {
            if item.is_control() {
                continue;
            }
            if exit_table.map_or(false, |t| t.contains(item.image_id())) {
                continue;
            }
            self.used_bits += item.size_bits();
            self.data.push(item.clone());
        }
        self.version += 1;
        Ok(())
    }

    /// True iff every item in `items` is currently resident.
    ///
    /// Source-backed buffers always answer true. The answer is memoized
    /// against the buffer version and a fingerprint of the queried batch.
    pub fn check_data_already(&mut self, items: &[DataItem]) -> bool {
        if self.start_flag {
            return true;
        }
        let key = batch_fingerprint(items);
        if let Some((version, memo_key, result)) = self.memo {
            if version == self.version && memo_key == key {
                return result;
            }
        }
        let result = items.iter().all(|item| self.data.contains(item));
        self.memo = Some((self.version, key, result));
        result
    }

    /// Remove resident items. A no-op on source-backed buffers.
    pub fn delete(&mut self, items: &[DataItem]) -> Result<(), BufferError> {
        if self.start_flag {
            return Ok(());
        }
        for item in items {
            let pos = self
                .data
                .iter()
                .position(|d| d == item)
                .ok_or_else(|| BufferError::MissingData { op: "delete", item: item.clone() })?;
            self.data.remove(pos);
            self.used_bits -= item.size_bits();
        }
        self.version += 1;
        Ok(())
    }

    /// Drop every resident item whose image appears in the exit table.
    pub fn filter_exit_table(&mut self, exit_table: &ExitTable) {
        let before = self.data.len();
        let mut freed = 0;
        self.data.retain(|item| {
            if exit_table.contains(item.image_id()) {
                freed += item.size_bits();
                false
            } else {
                true
            }
        });
        if self.data.len() != before {
            self.used_bits -= freed;
            self.version += 1;
        }
    }

    /// Image id of the head item, if any. Used by the tile to skip passes
    /// whose inputs can no longer arrive.
    pub fn possible_image_id(&self) -> Option<usize> {
        if self.start_flag {
            return None;
        }
        self.data.first().map(DataItem::image_id)
    }

    /// Number of resident items.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True iff no items are resident.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Bits currently resident (reservations not included).
    #[inline]
    pub fn used_bits(&self) -> u64 {
        self.used_bits
    }

    /// Resident items, in arrival order.
    #[inline]
    pub fn items(&self) -> &[DataItem] {
        &self.data
    }

    /// At the end of a run the buffer must be drained.
    pub fn check_finish(&self) -> Result<(), BufferError> {
        if self.data.is_empty() {
            Ok(())
        } else {
            Err(BufferError::NotDrained {
                residual: self.data.len(),
                head: self.data.first().cloned(),
            })
        }
    }
}

// ============================================================================
// Output buffer
// ============================================================================

/// Producer-side buffer: items waiting to be carried away.
#[derive(Debug)]
pub struct OutputBuffer {
    buffer_size: u64,
    data: Vec<DataItem>,
    used_bits: u64,
    end_flag: bool,
}

impl OutputBuffer {
    /// A new empty buffer with `buffer_size` bits of capacity.
    pub fn new(buffer_size: u64) -> Self {
        Self { buffer_size, data: Vec::new(), used_bits: 0, end_flag: false }
    }

    /// Mark this buffer as terminal: unbounded capacity, nothing offered
    /// for transfer. Sink tiles accumulate their results here.
    pub fn set_end(&mut self) {
        self.end_flag = true;
    }

    /// Remaining capacity in bits.
    pub fn remain_bits(&self) -> f64 {
        if self.end_flag {
            return f64::INFINITY;
        }
        self.buffer_size as f64 - self.used_bits as f64
    }

    /// True iff `items` fit into the remaining capacity.
    pub fn check_enough_space(&self, items: &[DataItem]) -> bool {
        batch_bits(items) as f64 <= self.remain_bits()
    }

    /// Append freshly produced items. Capacity must have been checked when
    /// the producing pass started; a failure here is a contract violation.
    pub fn add(&mut self, items: &[DataItem]) -> Result<(), BufferError> {
        if !self.check_enough_space(items) {
            return Err(BufferError::Overflow { need: batch_bits(items), remain: self.remain_bits() });
        }
        for item in items {
            self.used_bits += item.size_bits();
            self.data.push(item.clone());
        }
        Ok(())
    }

    /// Remove items that finished crossing the wires.
    pub fn delete(&mut self, items: &[DataItem]) -> Result<(), BufferError> {
        for item in items {
            let pos = self
                .data
                .iter()
                .position(|d| d == item)
                .ok_or_else(|| BufferError::MissingData { op: "delete", item: item.clone() })?;
            self.data.remove(pos);
            self.used_bits -= item.size_bits();
        }
        Ok(())
    }

    /// The next transferable item, if any.
    ///
    /// Nothing is offered from a terminal buffer. On a tile whose drops are
    /// gated by exit decisions, the head is withheld while its image is
    /// beyond the decision watermark, unless the tile itself drives the
    /// exit signal (`to_exit`).
    pub fn next_transfer(
        &self,
        exit_table: Option<&ExitTable>,
        to_exit: bool,
    ) -> Option<DataItem> {
        if self.end_flag {
            return None;
        }
        let head = self.data.first()?;
        if let Some(table) = exit_table {
            if head.image_id() as i64 > table.watermark && !to_exit {
                return None;
            }
        }
        Some(head.clone())
    }

    /// Drop every item whose image appears in the exit table.
    pub fn filter_exit_table(&mut self, exit_table: &ExitTable) {
        let mut freed = 0;
        self.data.retain(|item| {
            if exit_table.contains(item.image_id()) {
                freed += item.size_bits();
                false
            } else {
                true
            }
        });
        self.used_bits -= freed;
    }

    /// Number of items waiting.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True iff nothing is waiting.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Bits currently held.
    #[inline]
    pub fn used_bits(&self) -> u64 {
        self.used_bits
    }

    /// Waiting items, in production order.
    #[inline]
    pub fn items(&self) -> &[DataItem] {
        &self.data
    }

    /// At the end of a run the buffer must be drained, terminal sinks
    /// excepted.
    pub fn check_finish(&self) -> Result<(), BufferError> {
        if self.end_flag || self.data.is_empty() {
            Ok(())
        } else {
            Err(BufferError::NotDrained {
                residual: self.data.len(),
                head: self.data.first().cloned(),
            })
        }
    }
}
