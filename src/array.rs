//! The behavior-driven array engine
//!
//! [`BaseArray`] drives the whole evaluation. One pass over one
//! arrangement ([`BaseArray::run_single`]) is the discrete-event loop:
//!
//! ```text
//! loop:
//!     for module in update_order: module.update(current_time)
//!     schedule_strategy.schedule(current_time)
//!     next_time ← min(tile computation ends, communication ends)
//!     next_time > current_time or the run is stalled (hard error)
//!     if next_time = ∞: done
//! ```
//!
//! Time never sweeps: it jumps to the earliest moment any module would
//! change state. The update order makes incoming transfers land before
//! their consuming tile within a tick, and the scheduler runs strictly
//! after all updates so it decides on a globally consistent view.
//!
//! [`BaseArray::run`] evaluates every candidate arrangement twice: first
//! with transparent wires (a conflict-free oracle that yields the conflict
//! matrices), then with opaque wires (whose final time is the reported
//! latency). Both passes run on freshly built instances, so neither can
//! leak state into the other.

use tracing::info;

use crate::analysis;
use crate::communication::CommError;
use crate::mapping::{self, MappedNet, MappingError, MappingStrategy, UpdateStep};
use crate::report::{CommunicationInfo, ExperimentRecord};
use crate::schedule;
use crate::tile::{Tile, TileError};
use crate::wire::WireError;
use crate::{SimConfig, SimTime};

/// Errors surfaced by the engine. Everything here is fatal: the simulator
/// is deterministic, so re-running the same inputs reproduces the failure.
#[derive(Debug, thiserror::Error)]
pub enum SimError {
    /// No module produced a finite future event although work remains.
    #[error("simulation stalled at t={at}: no module advanced")]
    TimeStalled {
        /// Time at which progress stopped.
        at: SimTime,
    },
    /// The configured schedule strategy name is not registered.
    #[error("unknown schedule strategy `{0}`")]
    UnknownSchedule(String),
    /// A tile violated its contract.
    #[error(transparent)]
    Tile(#[from] TileError),
    /// A communication violated its contract.
    #[error(transparent)]
    Communication(#[from] CommError),
    /// A wire was left busy.
    #[error(transparent)]
    Wire(#[from] WireError),
    /// The mapping could not be built.
    #[error(transparent)]
    Mapping(#[from] MappingError),
}

/// Two mutable views into the tile arena, producer and consumer side.
fn tile_pair_mut(tiles: &mut [Tile], a: usize, b: usize) -> (&mut Tile, &mut Tile) {
    debug_assert_ne!(a, b, "a communication cannot loop back to its producer");
    if a < b {
        let (lo, hi) = tiles.split_at_mut(b);
        (&mut lo[a], &mut hi[0])
    } else {
        let (lo, hi) = tiles.split_at_mut(a);
        (&mut hi[0], &mut lo[b])
    }
}

/// The behavior-driven array: workload, strategies, and accumulated
/// results.
pub struct BaseArray {
    config: SimConfig,
    mapping: Box<dyn MappingStrategy>,
    /// Final opaque latency of each evaluated arrangement.
    pub latency_list: Vec<SimTime>,
    /// Mapping-time fitness of each evaluated arrangement.
    pub fitness_list: Vec<f64>,
    /// Raw byte-hop amount of each arrangement (transparent pass).
    pub r_communication_list: Vec<f64>,
    /// Equivalent communication amount of each arrangement.
    pub e_communication_list: Vec<f64>,
    experiment_list: Vec<ExperimentRecord>,
    result_tag: String,
}

impl BaseArray {
    /// Build the engine for a workload, resolving both strategy names.
    pub fn new(config: SimConfig) -> Result<Self, SimError> {
        info!("initializing the array");
        info!("    there are {} tasks", config.task_behavior_list.len());
        for (i, task_behavior) in config.task_behavior_list.iter().enumerate() {
            info!("        task {i} needs {} tiles", task_behavior.len());
        }
        info!("    the image number is {}", config.image_num);
        info!("    the tile net shape is {:?}", config.tile_net_shape);
        info!("    the buffer size is {:?}", config.buffer_size);
        info!("    the band width is {}", config.band_width);
        info!(
            "    strategies are {}, {}",
            config.mapping_strategy, config.schedule_strategy
        );
        log_behavior_counts(&config);

        let mapping = mapping::by_name(&config.mapping_strategy, &config)
            .ok_or_else(|| MappingError::UnknownStrategy(config.mapping_strategy.clone()))?;
        // fail fast on an unknown schedule name rather than mid-run
        if schedule::by_name(&config.schedule_strategy).is_none() {
            return Err(SimError::UnknownSchedule(config.schedule_strategy.clone()));
        }
        let result_tag = format!(
            "{}-{}-{}",
            config.mapping_strategy, config.schedule_strategy, config.image_num
        );
        Ok(Self {
            config,
            mapping,
            latency_list: Vec::new(),
            fitness_list: Vec::new(),
            r_communication_list: Vec::new(),
            e_communication_list: Vec::new(),
            experiment_list: Vec::new(),
            result_tag,
        })
    }

    /// Records accumulated by [`BaseArray::run`].
    pub fn experiments(&self) -> &[ExperimentRecord] {
        &self.experiment_list
    }

    /// Tag encoded into the result filename.
    pub fn result_tag(&self) -> &str {
        &self.result_tag
    }

    /// Drive one arrangement to completion and return the event times.
    ///
    /// The final entry is the pass latency. The arrangement is verified
    /// afterwards: every tile, communication and wire must have reached a
    /// legal terminal state.
    pub fn run_single(&self, net: &mut MappedNet) -> Result<Vec<SimTime>, SimError> {
        let mut schedule_strategy = schedule::by_name(&self.config.schedule_strategy)
            .ok_or_else(|| SimError::UnknownSchedule(self.config.schedule_strategy.clone()))?;
        let mut current_time: SimTime = 0.0;
        let mut time_points = Vec::new();
        loop {
            for step in &net.update_order {
                match *step {
                    UpdateStep::Tile(t) => net.tiles[t].update(current_time)?,
                    UpdateStep::Communication(c) => {
                        let communication = &mut net.communications[c];
                        let (producer, consumer) = tile_pair_mut(
                            &mut net.tiles,
                            communication.producer().as_usize(),
                            communication.consumer().as_usize(),
                        );
                        communication.update(current_time, producer, consumer, &mut net.wire_net)?;
                    }
                }
            }
            schedule_strategy.schedule(
                current_time,
                &mut net.tiles,
                &mut net.communications,
                &mut net.wire_net,
            )?;
            let next_time = next_event_time(net);
            if next_time <= current_time {
                return Err(SimError::TimeStalled { at: current_time });
            }
            current_time = next_time;
            if current_time.is_infinite() {
                break;
            }
            time_points.push(current_time);
        }
        check_finish(net)?;
        Ok(time_points)
    }

    /// Evaluate every arrangement: transparent pass first, then opaque.
    ///
    /// The transparent pass contributes conflict matrices, communication
    /// info and the equivalent-communication metrics; the opaque pass
    /// contributes the reported latency and the real occupancy intervals.
    pub fn run(&mut self) -> Result<&[ExperimentRecord], SimError> {
        self.experiment_list.clear();

        let mut variants = self.mapping.mapping_net()?;
        for (i, net) in variants.iter_mut().enumerate() {
            net.wire_net.set_transparent_flag(true);
            let time_points = self.run_single(net)?;
            let latency = time_points.last().copied().unwrap_or(0.0);
            info!(
                "transparent, for the {i}th: {}, {:.3}",
                net.fitness,
                latency / 1e6
            );
            let snapshots = analysis::snapshot(&net.communications);
            let (conflict_matrix, bool_matrix) = analysis::conflict_matrices(&snapshots);
            let (r_amount, e_amount) =
                analysis::equivalent_communication(&snapshots, &conflict_matrix);
            info!("    communication amounts: raw {r_amount}, equivalent {e_amount}");
            self.r_communication_list.push(r_amount);
            self.e_communication_list.push(e_amount);
            let communication_info_list = snapshots
                .into_iter()
                .map(|snap| CommunicationInfo {
                    amount: snap.amount,
                    range_t: snap.ranges,
                    range_o: Vec::new(),
                    path: snap.path,
                    layer: snap.layer,
                })
                .collect();
            self.experiment_list.push(ExperimentRecord {
                conflict_matrix,
                bool_matrix,
                communication_info_list,
                latency: 0.0,
                fitness: net.fitness,
            });
        }

        let mut variants = self.mapping.mapping_net()?;
        for (i, net) in variants.iter_mut().enumerate() {
            net.wire_net.set_transparent_flag(false);
            let time_points = self.run_single(net)?;
            let latency = time_points.last().copied().unwrap_or(0.0);
            info!(
                "origin, for the {i}th: {}, {:.3}",
                net.fitness,
                latency / 1e6
            );
            let record = &mut self.experiment_list[i];
            record.latency = latency;
            record.fitness = net.fitness;
            for (j, communication) in net.communications.iter().enumerate() {
                record.communication_info_list[j].range_o =
                    communication.get_communication_range().to_vec();
            }
            self.latency_list.push(latency);
            self.fitness_list.push(net.fitness);
        }

        Ok(&self.experiment_list)
    }

    /// Persist the accumulated records; returns the file written.
    pub fn save_records(&self) -> anyhow::Result<std::path::PathBuf> {
        crate::report::write_records(&self.result_tag, &self.experiment_list)
    }
}

/// The earliest future event over every tile and communication.
fn next_event_time(net: &MappedNet) -> SimTime {
    let tile_min = net
        .tiles
        .iter()
        .map(Tile::get_computation_end_time)
        .fold(f64::INFINITY, f64::min);
    let comm_min = net
        .communications
        .iter()
        .map(|c| c.get_communication_end_time())
        .fold(f64::INFINITY, f64::min);
    tile_min.min(comm_min)
}

/// Verify the terminal state of a finished pass.
fn check_finish(net: &MappedNet) -> Result<(), SimError> {
    for tile in &net.tiles {
        tile.check_finish()?;
    }
    for communication in &net.communications {
        communication.check_finish()?;
    }
    net.wire_net.check_finish()?;
    Ok(())
}

/// Log the tile/communication/behavior totals of the workload.
fn log_behavior_counts(config: &SimConfig) {
    let mut tile_number = Vec::new();
    let mut communication_number = Vec::new();
    let mut behavior_number = Vec::new();
    for task_behavior in &config.task_behavior_list {
        tile_number.push(task_behavior.len());
        let mut task_communications = 0usize;
        let mut task_behaviors = 0usize;
        for tile_behavior in task_behavior {
            let mut repeated = 1usize;
            if tile_behavior.target_tile_id != [-1] {
                task_communications += tile_behavior.target_tile_id.len();
                repeated += tile_behavior.target_tile_id.len();
            }
            task_behaviors += tile_behavior.dependence.len() * repeated;
        }
        communication_number.push(task_communications);
        behavior_number.push(task_behaviors);
    }
    info!(
        "in total, {} tiles, {} communications, {} behaviors",
        tile_number.iter().sum::<usize>(),
        communication_number.iter().sum::<usize>(),
        behavior_number.iter().sum::<usize>()
    );
    for i in 0..tile_number.len() {
        info!(
            "    task {i} has {} tiles, {} communications, {} behaviors",
            tile_number[i], communication_number[i], behavior_number[i]
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::DataItem;
    use crate::tile::{Dependence, TileBehavior};

    fn item(from_tile: i64, bits: u64) -> DataItem {
        DataItem::Payload {
            x: 0,
            y: 0,
            start: 0,
            end: bits,
            bit: 1,
            total: 1,
            image_id: 0,
            layer_id: from_tile,
            in_id: 0,
            tile_id: from_tile,
        }
    }

    fn tile_behavior(
        tile_id: i64,
        sources: Vec<i64>,
        targets: Vec<i64>,
        wait: Vec<DataItem>,
        output: Vec<DataItem>,
        latency: f64,
    ) -> TileBehavior {
        TileBehavior {
            task_id: 0,
            tile_id,
            layer_id: tile_id,
            target_tile_id: targets,
            source_tile_id: sources,
            control_tile_id: None,
            exit_id: None,
            dependence: vec![Dependence { wait: wait.clone(), output, drop: wait, latency }],
        }
    }

    /// producer → consumer over one wire; compute and transfer both take
    /// 10 time units.
    fn pipeline_config(image_num: usize, buffer_size: (u64, u64)) -> SimConfig {
        let external = item(-1, 10);
        let produced = item(0, 10);
        let consumed = item(1, 10);
        SimConfig {
            task_behavior_list: vec![vec![
                tile_behavior(0, vec![-1], vec![1], vec![external], vec![produced.clone()], 10.0),
                tile_behavior(1, vec![0], vec![-1], vec![produced], vec![consumed], 10.0),
            ]],
            image_num,
            tile_net_shape: (1, 2),
            buffer_size,
            band_width: 1.0,
            mapping_strategy: "naive".into(),
            schedule_strategy: "naive".into(),
            sample_list: Vec::new(),
        }
    }

    #[test]
    fn two_stage_pipeline_latency_and_conflict_matrix() {
        let mut array = BaseArray::new(pipeline_config(2, (1024, 1024))).unwrap();
        let records = array.run().unwrap();
        assert_eq!(records.len(), 1);
        // serialized chain: compute 0, [compute 1 ∥ transfer 0], then the
        // consumer overlaps the second transfer; 2·(10 + 10) total
        assert_eq!(records[0].latency, 40.0);
        assert_eq!(records[0].conflict_matrix, vec![vec![0.0]]);
        assert_eq!(records[0].bool_matrix, vec![vec![0]]);
        assert_eq!(records[0].communication_info_list.len(), 1);
        assert_eq!(records[0].communication_info_list[0].amount, 10.0);
        assert_eq!(records[0].communication_info_list[0].range_o.len(), 2);
    }

    #[test]
    fn forward_progress_yields_strictly_increasing_time_points() {
        let array = BaseArray::new(pipeline_config(3, (1024, 1024))).unwrap();
        let mut variants = array.mapping.mapping_net().unwrap();
        let points = array.run_single(&mut variants[0]).unwrap();
        assert!(points.windows(2).all(|w| w[0] < w[1]));
        assert!(points.iter().all(|t| t.is_finite()));
    }

    #[test]
    fn tiny_input_buffer_still_terminates() {
        // a middle tile whose input holds exactly one 10-bit item:
        // transfers serialize behind the drain but the run completes
        let external = item(-1, 10);
        let produced = item(0, 10);
        let relayed = item(1, 10);
        let sunk = item(2, 10);
        let config = SimConfig {
            task_behavior_list: vec![vec![
                tile_behavior(0, vec![-1], vec![1], vec![external], vec![produced.clone()], 10.0),
                tile_behavior(1, vec![0], vec![2], vec![produced], vec![relayed.clone()], 10.0),
                tile_behavior(2, vec![1], vec![-1], vec![relayed], vec![sunk], 10.0),
            ]],
            image_num: 3,
            tile_net_shape: (2, 2),
            buffer_size: (10, 30),
            band_width: 1.0,
            mapping_strategy: "naive".into(),
            schedule_strategy: "naive".into(),
            sample_list: Vec::new(),
        };
        let mut array = BaseArray::new(config).unwrap();
        let records = array.run().unwrap();
        assert!(records[0].latency > 0.0);
        // the middle tile's input capacity throttled the first hop: its
        // transfers can never overlap the middle tile's residency
        let info = &records[0].communication_info_list;
        assert_eq!(info.len(), 2);
    }

    #[test]
    fn zero_capacity_buffers_on_a_non_terminal_tile_are_rejected() {
        // the producer's output buffer cannot hold even one item
        let mut array = BaseArray::new(pipeline_config(2, (1024, 0))).unwrap();
        assert!(array.run().is_err());
    }

    #[test]
    fn zero_capacity_sink_still_completes() {
        // a lone source-and-sink tile: both buffers are terminal, so zero
        // configured capacity does not constrain anything
        let external = item(-1, 10);
        let result = item(0, 10);
        let config = SimConfig {
            task_behavior_list: vec![vec![tile_behavior(
                0,
                vec![-1],
                vec![-1],
                vec![external],
                vec![result],
                10.0,
            )]],
            image_num: 2,
            tile_net_shape: (1, 1),
            buffer_size: (0, 0),
            band_width: 1.0,
            mapping_strategy: "naive".into(),
            schedule_strategy: "naive".into(),
            sample_list: Vec::new(),
        };
        let mut array = BaseArray::new(config).unwrap();
        let records = array.run().unwrap();
        assert_eq!(records[0].latency, 20.0);
        assert!(records[0].communication_info_list.is_empty());
    }

    /// Two producer→consumer pairs whose XY routes share a wire.
    fn shared_wire_config() -> SimConfig {
        let external = item(-1, 10);
        let a_out = item(0, 10);
        let a_sink = item(1, 10);
        let b_out = item(2, 10);
        let b_sink = item(3, 10);
        SimConfig {
            task_behavior_list: vec![
                vec![
                    tile_behavior(0, vec![-1], vec![1], vec![external.clone()], vec![a_out.clone()], 10.0),
                    tile_behavior(1, vec![0], vec![-1], vec![a_out], vec![a_sink], 10.0),
                ],
                vec![
                    tile_behavior(2, vec![-1], vec![3], vec![external], vec![b_out.clone()], 10.0),
                    tile_behavior(3, vec![2], vec![-1], vec![b_out], vec![b_sink], 10.0),
                ],
            ],
            image_num: 2,
            tile_net_shape: (2, 3),
            buffer_size: (1024, 1024),
            band_width: 1.0,
            mapping_strategy: "naive".into(),
            schedule_strategy: "naive".into(),
            sample_list: Vec::new(),
        }
    }

    #[test]
    fn shared_wire_shows_up_in_the_conflict_matrix() {
        // task A: (0,0) -> (0,1); task B: (0,2) -> (1,0); B's XY route
        // crosses ((0,0),(0,1)), the same wire A uses
        let mut array = BaseArray::new(shared_wire_config()).unwrap();
        let records = array.run().unwrap();
        let record = &records[0];
        assert_eq!(record.bool_matrix[0][1], 1);
        assert_eq!(record.bool_matrix[1][0], 1);
        assert!(record.conflict_matrix[0][1] > 0.0);
        assert!(record.conflict_matrix[0][1] <= 1.0);
    }

    #[test]
    fn transparent_pass_is_a_lower_bound() {
        let array = BaseArray::new(shared_wire_config()).unwrap();

        let mut transparent = array.mapping.mapping_net().unwrap();
        transparent[0].wire_net.set_transparent_flag(true);
        let t_points = array.run_single(&mut transparent[0]).unwrap();

        let mut opaque = array.mapping.mapping_net().unwrap();
        let o_points = array.run_single(&mut opaque[0]).unwrap();

        let t_latency = t_points.last().copied().unwrap();
        let o_latency = o_points.last().copied().unwrap();
        // the shared wire serializes the two pipelines in opaque mode
        assert!(t_latency < o_latency, "{t_latency} !< {o_latency}");
    }

    /// source → controlled sink, with a separate exit-aggregating source
    /// signalling decisions for every image.
    fn exit_config(image_num: usize, exits: &[usize]) -> SimConfig {
        let external = item(-1, 10);
        let produced = item(0, 10);
        let consumed = item(1, 10);
        let sample_list: Vec<Vec<bool>> =
            (0..image_num).map(|i| vec![exits.contains(&i)]).collect();
        let mut exit_tile = tile_behavior(
            2,
            vec![-1],
            vec![1],
            vec![external.clone()],
            vec![item(2, 10)],
            1.0,
        );
        exit_tile.exit_id = Some(0);
        let mut controlled = tile_behavior(1, vec![0], vec![-1], vec![produced.clone()], vec![consumed], 10.0);
        controlled.control_tile_id = Some(2);
        SimConfig {
            task_behavior_list: vec![vec![
                tile_behavior(0, vec![-1], vec![1], vec![external], vec![produced], 10.0),
                exit_tile,
                controlled,
            ]],
            image_num,
            tile_net_shape: (2, 2),
            buffer_size: (1024, 1024),
            band_width: 1.0,
            mapping_strategy: "naive".into(),
            schedule_strategy: "naive".into(),
            sample_list,
        }
    }

    #[test]
    fn early_exit_drops_downstream_work() {
        let array = BaseArray::new(exit_config(6, &[2, 4])).unwrap();
        let mut variants = array.mapping.mapping_net().unwrap();
        let net = &mut variants[0];
        array.run_single(net).unwrap();
        // no exited image survives in the controlled tile's sink output,
        // whether its pass was skipped outright or committed before the
        // decision arrived and flushed afterwards
        let controlled = net.tiles.iter().find(|t| t.tile_id() == 1).unwrap();
        let surviving: Vec<usize> =
            controlled.output_buffer().items().iter().map(|item| item.image_id()).collect();
        assert!(!surviving.contains(&2) && !surviving.contains(&4));
        assert!(controlled.completed() < 6);
        // both sources ran every pass regardless
        for tile in net.tiles.iter().filter(|t| t.is_source()) {
            assert_eq!(tile.completed(), 6);
        }
    }
}
