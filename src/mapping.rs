//! Mapping strategies
//!
//! A mapping strategy turns the task behavior lists into a concrete
//! arrangement: tiles placed on the grid, the wire net, one communication
//! per (producer, consumer) edge, and the update order the engine walks
//! every tick. Strategies may propose several candidate arrangements; the
//! engine evaluates each one in both wire modes, so [`MappingStrategy::
//! mapping_net`] must hand out freshly built instances on every call.
//!
//! The update order is the consistency workhorse: for every tile in grid
//! order it emits the communications feeding that tile, then the tile,
//! then the communications it feeds, deduplicated by identity. Within a
//! tick a tile therefore always observes its incoming transfers already
//! delivered and never a half-updated buffer.

use tracing::warn;

use crate::communication::{CommError, Communication};
use crate::tile::{Tile, TileBehavior, TileError, TileIdx};
use crate::wire::{Position, WireNet};
use crate::SimConfig;

/// Errors raised while building a mapping.
#[derive(Debug, thiserror::Error)]
pub enum MappingError {
    /// More tiles than grid cells.
    #[error("grid too small: {need} tiles for {have} cells")]
    GridTooSmall {
        /// Tiles to place.
        need: usize,
        /// Cells available.
        have: usize,
    },
    /// The configured strategy name is not registered.
    #[error("unknown mapping strategy `{0}`")]
    UnknownStrategy(String),
    /// Tile construction failed.
    #[error(transparent)]
    Tile(#[from] TileError),
    /// Communication construction failed.
    #[error(transparent)]
    Communication(#[from] CommError),
}

/// One step of the per-tick update walk.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum UpdateStep {
    /// Update the communication at this index.
    Communication(usize),
    /// Update the tile at this index.
    Tile(usize),
}

/// A fully instantiated candidate arrangement.
#[derive(Debug)]
pub struct MappedNet {
    /// Mapping-time cost of the arrangement: Σ amount · path length.
    pub fitness: f64,
    /// Tiles in placement order.
    pub tiles: Vec<Tile>,
    /// All producer→consumer bindings.
    pub communications: Vec<Communication>,
    /// The shared wire resource.
    pub wire_net: WireNet,
    /// Per-tick walk over tiles and communications.
    pub update_order: Vec<UpdateStep>,
}

/// A placement policy producing candidate arrangements.
pub trait MappingStrategy {
    /// Build every candidate arrangement, freshly instantiated.
    fn mapping_net(&self) -> Result<Vec<MappedNet>, MappingError>;
}

/// Deterministic row-major fill: tiles are placed in task order, one cell
/// each, and each task's last tile is forced into a sink.
pub struct NaiveMapping {
    config: SimConfig,
}

impl NaiveMapping {
    /// A naive mapping over the given workload.
    pub fn new(config: SimConfig) -> Self {
        Self { config }
    }
}

impl MappingStrategy for NaiveMapping {
    fn mapping_net(&self) -> Result<Vec<MappedNet>, MappingError> {
        let cfg = &self.config;
        let (rows, cols) = cfg.tile_net_shape;
        let tile_count: usize = cfg.task_behavior_list.iter().map(Vec::len).sum();
        if tile_count > rows * cols {
            return Err(MappingError::GridTooSmall { need: tile_count, have: rows * cols });
        }

        let mut tiles = Vec::with_capacity(tile_count);
        let mut count = 0usize;
        for (task_id, task_behavior) in cfg.task_behavior_list.iter().enumerate() {
            for (slot, tile_behavior) in task_behavior.iter().enumerate() {
                let mut behavior: TileBehavior = tile_behavior.clone();
                behavior.task_id = task_id;
                if slot + 1 == task_behavior.len() {
                    behavior.target_tile_id = vec![-1];
                }
                check_fan(&behavior);
                let position = Position::new(count / cols, count % cols);
                count += 1;
                tiles.push(Tile::new(
                    position,
                    cfg.image_num,
                    cfg.buffer_size,
                    behavior,
                    &cfg.sample_list,
                )?);
            }
        }

        let wire_net = WireNet::new((rows, cols), cfg.band_width);

        let mut communications = Vec::new();
        for (p, producer) in tiles.iter().enumerate() {
            for (c, consumer) in tiles.iter().enumerate() {
                if consumer.task_id() == producer.task_id()
                    && producer.target_tile_id().contains(&consumer.tile_id())
                {
                    communications.push(Communication::new(
                        TileIdx(p),
                        TileIdx(c),
                        producer,
                        consumer,
                        &wire_net,
                    )?);
                }
            }
        }

        let fitness = communications
            .iter()
            .map(|comm| comm.get_communication_amount() as f64 * comm.get_path().len() as f64)
            .sum();
        let update_order = update_order(&tiles, &communications);

        Ok(vec![MappedNet { fitness, tiles, communications, wire_net, update_order }])
    }
}

/// Warn about behaviors outside the single-input single-output aggregation
/// case; the simulation proceeds, but head-of-queue competition between
/// multiple consumers is not modeled.
fn check_fan(behavior: &TileBehavior) {
    if behavior.exit_id.is_none() && behavior.target_tile_id.len() > 1 {
        warn!(
            tile_id = behavior.tile_id,
            targets = behavior.target_tile_id.len(),
            "fan-out beyond one data consumer is not modeled; transfers will compete for the head item"
        );
    }
    let data_sources = behavior
        .source_tile_id
        .iter()
        .filter(|id| **id != -1 && Some(**id) != behavior.control_tile_id)
        .count();
    if data_sources > 1 {
        warn!(
            tile_id = behavior.tile_id,
            sources = data_sources,
            "fan-in beyond one data producer is not modeled"
        );
    }
}

/// Writers-before-readers walk: feeding communications, the tile, fed
/// communications, per tile in placement order, each communication once.
pub fn update_order(tiles: &[Tile], communications: &[Communication]) -> Vec<UpdateStep> {
    let mut order = Vec::with_capacity(tiles.len() + communications.len());
    let mut emitted = vec![false; communications.len()];
    for (t, _) in tiles.iter().enumerate() {
        for (c, communication) in communications.iter().enumerate() {
            if !emitted[c] && communication.consumer().as_usize() == t {
                emitted[c] = true;
                order.push(UpdateStep::Communication(c));
            }
        }
        order.push(UpdateStep::Tile(t));
        for (c, communication) in communications.iter().enumerate() {
            if !emitted[c] && communication.producer().as_usize() == t {
                emitted[c] = true;
                order.push(UpdateStep::Communication(c));
            }
        }
    }
    order
}

/// Look up a mapping strategy by its configured name.
pub fn by_name(name: &str, config: &SimConfig) -> Option<Box<dyn MappingStrategy>> {
    match name {
        "naive" => Some(Box::new(NaiveMapping::new(config.clone()))),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::DataItem;
    use crate::tile::Dependence;

    fn item(from_tile: i64, bits: u64) -> DataItem {
        DataItem::Payload {
            x: 0,
            y: 0,
            start: 0,
            end: bits,
            bit: 1,
            total: 1,
            image_id: 0,
            layer_id: 0,
            in_id: 0,
            tile_id: from_tile,
        }
    }

    fn chain_config(tile_count: usize) -> SimConfig {
        let mut task = Vec::new();
        for k in 0..tile_count as i64 {
            task.push(TileBehavior {
                task_id: 0,
                tile_id: k,
                layer_id: k,
                target_tile_id: if k + 1 < tile_count as i64 { vec![k + 1] } else { vec![-1] },
                source_tile_id: if k == 0 { vec![-1] } else { vec![k - 1] },
                control_tile_id: None,
                exit_id: None,
                dependence: vec![Dependence {
                    wait: vec![item(k - 1, 8)],
                    output: vec![item(k, 8)],
                    drop: vec![item(k - 1, 8)],
                    latency: 10.0,
                }],
            });
        }
        SimConfig {
            task_behavior_list: vec![task],
            image_num: 1,
            tile_net_shape: (2, 2),
            buffer_size: (64, 64),
            band_width: 1.0,
            mapping_strategy: "naive".into(),
            schedule_strategy: "naive".into(),
            sample_list: Vec::new(),
        }
    }

    #[test]
    fn row_major_fill_and_forced_sink() {
        let mapping = NaiveMapping::new(chain_config(3));
        let net = mapping.mapping_net().unwrap().pop().unwrap();
        assert_eq!(net.tiles.len(), 3);
        assert_eq!(net.tiles[0].position(), Position::new(0, 0));
        assert_eq!(net.tiles[1].position(), Position::new(0, 1));
        assert_eq!(net.tiles[2].position(), Position::new(1, 0));
        assert_eq!(net.tiles[2].target_tile_id(), [-1]);
        assert_eq!(net.communications.len(), 2);
    }

    #[test]
    fn update_order_is_writers_before_readers() {
        let mapping = NaiveMapping::new(chain_config(3));
        let net = mapping.mapping_net().unwrap().pop().unwrap();
        assert_eq!(
            net.update_order,
            vec![
                UpdateStep::Tile(0),
                UpdateStep::Communication(0),
                UpdateStep::Tile(1),
                UpdateStep::Communication(1),
                UpdateStep::Tile(2),
            ]
        );
    }

    #[test]
    fn grid_too_small_is_rejected() {
        let mut cfg = chain_config(3);
        cfg.tile_net_shape = (1, 2);
        let err = NaiveMapping::new(cfg).mapping_net().unwrap_err();
        assert!(matches!(err, MappingError::GridTooSmall { need: 3, have: 2 }));
    }

    #[test]
    fn fitness_weighs_amount_by_path_length() {
        let mapping = NaiveMapping::new(chain_config(3));
        let net = mapping.mapping_net().unwrap().pop().unwrap();
        // 8 bits over 1 hop plus 8 bits over 2 hops ((0,1) -> (1,0))
        assert_eq!(net.fitness, 8.0 + 16.0);
    }
}
