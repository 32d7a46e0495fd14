//! Schedule strategies
//!
//! Once per tick, after every module has caught up with the current time,
//! the schedule strategy decides which idle communications get to occupy
//! their paths. A grant mutates shared state (wires go busy and consumer
//! capacity is reserved), so later candidates within the same tick already
//! see the consequences of earlier grants; in opaque mode this makes
//! same-tick grants path-disjoint by construction.
//!
//! Strategies plug in behind a small trait so the engine never changes
//! when the conflict-resolution discipline does.

use crate::communication::{CommError, Communication};
use crate::tile::Tile;
use crate::wire::WireNet;
use crate::SimTime;

/// A per-tick path-allocation policy.
pub trait ScheduleStrategy {
    /// Grant transfers for the current tick.
    fn schedule(
        &mut self,
        current_time: SimTime,
        tiles: &mut [Tile],
        communications: &mut [Communication],
        wire_net: &mut WireNet,
    ) -> Result<(), CommError>;
}

/// First-come first-served in communication order: a candidate is granted
/// iff its producer offers data, its whole path is free and the consumer
/// can take the batch on top of its in-flight reservations.
#[derive(Debug, Default)]
pub struct NaiveSchedule;

impl ScheduleStrategy for NaiveSchedule {
    fn schedule(
        &mut self,
        current_time: SimTime,
        tiles: &mut [Tile],
        communications: &mut [Communication],
        wire_net: &mut WireNet,
    ) -> Result<(), CommError> {
        for communication in communications.iter_mut() {
            if !communication.is_idle() {
                continue;
            }
            let Some(items) = tiles[communication.producer().as_usize()].next_transfer() else {
                continue;
            };
            if !wire_net.get_data_path_state(communication.wire_ids()) {
                continue;
            }
            let consumer = &mut tiles[communication.consumer().as_usize()];
            if !consumer.can_accept(&items) {
                continue;
            }
            communication.start_transfer(current_time, items, consumer, wire_net);
        }
        Ok(())
    }
}

/// Look up a schedule strategy by its configured name.
pub fn by_name(name: &str) -> Option<Box<dyn ScheduleStrategy>> {
    match name {
        "naive" => Some(Box::new(NaiveSchedule)),
        _ => None,
    }
}
