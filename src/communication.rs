//! Inter-tile communications
//!
//! A [`Communication`] binds one producer tile to one consumer tile
//! through a fixed route over the wire net. It is a two-state machine
//! (idle or transferring) with at most one payload reservation in flight:
//!
//! - **transferring → idle** inside [`Communication::update`], once the
//!   transfer end time is reached: the path is released, the items are
//!   delivered into the consumer's input buffer (consuming the capacity
//!   reservation made at grant time, and folding control records into the
//!   consumer's exit table), removed from the producer's output buffer,
//!   and the occupied `(start, end)` interval is recorded.
//! - **idle → transferring** only through [`Communication::start_transfer`]:
//!   the schedule strategy decides who gets to occupy a path, and this
//!   component never grabs wires on its own.
//!
//! The route is resolved once at construction: an XY walk (columns first,
//! then rows) from producer to consumer, stored both as canonical segments
//! for reporting and as dense wire ids for the hot path.

use crate::data::DataItem;
use crate::tile::{Tile, TileError, TileIdx};
use crate::wire::{canonical_segment, map_key, Position, Segment, WireError, WireId, WireNet};
use crate::SimTime;

/// Errors raised by communication construction and updates.
#[derive(Debug, thiserror::Error)]
pub enum CommError {
    /// Producer and consumer sit on the same cell; there is no route.
    #[error("communication {producer}->{consumer}: producer and consumer share a cell")]
    EmptyRoute {
        /// Producer behavior-level id.
        producer: i64,
        /// Consumer behavior-level id.
        consumer: i64,
    },
    /// The route referenced a wire that does not exist.
    #[error("communication {producer}->{consumer}: {source}")]
    Route {
        /// Producer behavior-level id.
        producer: i64,
        /// Consumer behavior-level id.
        consumer: i64,
        /// Underlying wire-net error.
        #[source]
        source: WireError,
    },
    /// A tile-side operation failed during delivery.
    #[error("communication {producer}->{consumer}: {source}")]
    Tile {
        /// Producer behavior-level id.
        producer: i64,
        /// Consumer behavior-level id.
        consumer: i64,
        /// Underlying tile error.
        #[source]
        source: TileError,
    },
    /// The communication was still transferring when the run finished.
    #[error("communication {producer}->{consumer}: still transferring at finish")]
    Unfinished {
        /// Producer behavior-level id.
        producer: i64,
        /// Consumer behavior-level id.
        consumer: i64,
    },
}

/// XY route between two cells: walk columns first, then rows.
fn route(from: Position, to: Position) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut cur = from;
    while cur.col != to.col {
        let next = if cur.col < to.col {
            Position::new(cur.row, cur.col + 1)
        } else {
            Position::new(cur.row, cur.col - 1)
        };
        segments.push(canonical_segment(cur, next));
        cur = next;
    }
    while cur.row != to.row {
        let next = if cur.row < to.row {
            Position::new(cur.row + 1, cur.col)
        } else {
            Position::new(cur.row - 1, cur.col)
        };
        segments.push(canonical_segment(cur, next));
        cur = next;
    }
    segments
}

/// The transfer currently occupying the path.
#[derive(Debug)]
struct Pending {
    items: Vec<DataItem>,
    start: SimTime,
    end: SimTime,
}

/// One producer→consumer binding with its routed path.
#[derive(Debug)]
pub struct Communication {
    producer: TileIdx,
    consumer: TileIdx,
    producer_tile_id: i64,
    consumer_tile_id: i64,
    path: Vec<Segment>,
    wire_ids: Vec<WireId>,
    layer_info: i64,
    amount: u64,
    pending: Option<Pending>,
    communication_range: Vec<(SimTime, SimTime)>,
}

impl Communication {
    /// Bind `producer_tile` to `consumer_tile` and resolve the route.
    ///
    /// `amount`, the per-pass byte count the analyzer weighs paths with,
    /// is taken from the producer's one-pass output traffic.
    pub fn new(
        producer: TileIdx,
        consumer: TileIdx,
        producer_tile: &Tile,
        consumer_tile: &Tile,
        wire_net: &WireNet,
    ) -> Result<Self, CommError> {
        let producer_tile_id = producer_tile.tile_id();
        let consumer_tile_id = consumer_tile.tile_id();
        if producer_tile.position() == consumer_tile.position() {
            return Err(CommError::EmptyRoute { producer: producer_tile_id, consumer: consumer_tile_id });
        }
        let path = route(producer_tile.position(), consumer_tile.position());
        let wire_ids = path
            .iter()
            .map(|segment| wire_net.wire_id(segment))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|source| CommError::Route {
                producer: producer_tile_id,
                consumer: consumer_tile_id,
                source,
            })?;
        Ok(Self {
            producer,
            consumer,
            producer_tile_id,
            consumer_tile_id,
            path,
            wire_ids,
            layer_info: producer_tile.layer_id(),
            amount: producer_tile.pass_output_bits(),
            pending: None,
            communication_range: Vec::new(),
        })
    }

    /// Arena index of the producer tile.
    #[inline]
    pub fn producer(&self) -> TileIdx {
        self.producer
    }

    /// Arena index of the consumer tile.
    #[inline]
    pub fn consumer(&self) -> TileIdx {
        self.consumer
    }

    /// True while no transfer occupies the path.
    #[inline]
    pub fn is_idle(&self) -> bool {
        self.pending.is_none()
    }

    /// Dense ids of the wires along the route.
    #[inline]
    pub fn wire_ids(&self) -> &[WireId] {
        &self.wire_ids
    }

    /// Canonical segments of the route.
    #[inline]
    pub fn get_path(&self) -> &[Segment] {
        &self.path
    }

    /// Canonical string keys of the route, for reporting.
    pub fn path_keys(&self) -> Vec<String> {
        self.path.iter().map(map_key).collect()
    }

    /// Per-pass byte count crossing this path.
    #[inline]
    pub fn get_communication_amount(&self) -> u64 {
        self.amount
    }

    /// Layer tag used by the analyzer's aggregation.
    #[inline]
    pub fn get_layer_info(&self) -> i64 {
        self.layer_info
    }

    /// Occupied intervals, pairwise disjoint and increasing.
    #[inline]
    pub fn get_communication_range(&self) -> &[(SimTime, SimTime)] {
        &self.communication_range
    }

    /// End time of the transfer in flight, or infinity when idle.
    #[inline]
    pub fn get_communication_end_time(&self) -> SimTime {
        self.pending.as_ref().map_or(f64::INFINITY, |p| p.end)
    }

    /// Advance the communication to `current_time`, completing a transfer
    /// whose end time has been reached.
    pub fn update(
        &mut self,
        current_time: SimTime,
        producer: &mut Tile,
        consumer: &mut Tile,
        wire_net: &mut WireNet,
    ) -> Result<(), CommError> {
        let done = self.pending.as_ref().map_or(false, |p| current_time >= p.end);
        if !done {
            return Ok(());
        }
        let Some(Pending { items, start, end }) = self.pending.take() else {
            return Ok(());
        };
        wire_net.set_data_path_state(&self.wire_ids, false);
        consumer.receive(&items).map_err(|source| self.tile_err(source))?;
        producer.finish_transfer_out(&items).map_err(|source| self.tile_err(source))?;
        debug_assert!(
            self.communication_range.last().map_or(true, |(_, prev_end)| start >= *prev_end),
            "occupancy intervals must be disjoint and increasing"
        );
        self.communication_range.push((start, end));
        Ok(())
    }

    /// Occupy the path with `items`, granted by the schedule strategy.
    ///
    /// Reserves consumer-side capacity, marks the wires busy and computes
    /// the transfer end time from the route's bandwidth.
    pub fn start_transfer(
        &mut self,
        current_time: SimTime,
        items: Vec<DataItem>,
        consumer: &mut Tile,
        wire_net: &mut WireNet,
    ) {
        debug_assert!(self.is_idle(), "a transferring communication cannot be granted again");
        let duration = wire_net.get_wire_transfer_time(&self.wire_ids, &items);
        consumer.reserve_incoming(&items);
        wire_net.set_data_path_state(&self.wire_ids, true);
        self.pending = Some(Pending { items, start: current_time, end: current_time + duration });
    }

    /// Verify no transfer is left in flight at the end of a run.
    pub fn check_finish(&self) -> Result<(), CommError> {
        if self.pending.is_some() {
            return Err(CommError::Unfinished {
                producer: self.producer_tile_id,
                consumer: self.consumer_tile_id,
            });
        }
        Ok(())
    }

    fn tile_err(&self, source: TileError) -> CommError {
        CommError::Tile {
            producer: self.producer_tile_id,
            consumer: self.consumer_tile_id,
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xy_route_walks_columns_then_rows() {
        let segments = route(Position::new(0, 2), Position::new(1, 0));
        assert_eq!(
            segments,
            vec![
                (Position::new(0, 1), Position::new(0, 2)),
                (Position::new(0, 0), Position::new(0, 1)),
                (Position::new(0, 0), Position::new(1, 0)),
            ]
        );
    }

    #[test]
    fn route_between_neighbors_is_one_segment() {
        let segments = route(Position::new(0, 0), Position::new(0, 1));
        assert_eq!(segments, vec![(Position::new(0, 0), Position::new(0, 1))]);
    }
}
