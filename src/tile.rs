//! Compute tiles and their behavior state machine
//!
//! A [`Tile`] realizes a pre-computed behavior: a per-pass dependence
//! template (inputs to wait for, outputs to produce, inputs to drop, a
//! latency to elapse) repeated once per image of the workload. The tile is
//! a two-state machine, idle or running, and only [`Tile::update`]
//! changes that state:
//!
//! - **running → idle** once `computation_end_time` is reached: the pass is
//!   committed (drops deleted, outputs pushed), unless its image has been
//!   signalled as exited, in which case the outputs are discarded.
//! - **idle → running** once every `wait` item is resident and the output
//!   buffer can take the `output` set; the end time is `now + latency`.
//! - otherwise the tile reports an infinite end time and the engine will
//!   not visit it again until something changes.
//!
//! ### Streaming the dependence list
//! The computation list is *not* materialized `image_num` times. A
//! [`DependenceStream`] holds the one-pass template plus a cursor
//! `(image, step)` and instantiates the current pass on demand, rewriting
//! image ids as it goes. Skipping, whether from the head-of-buffer
//! image jumping ahead or from early-exit decisions, advances the cursor
//! instead of rewriting a list, so the completed-or-skipped prefix stays
//! contiguous by construction.
//!
//! ### Early exit
//! Tiles that aggregate an exit branch (`exit_id` set) replace each pass's
//! outputs with a single control record carrying the decision sampled for
//! that image. Tiles governed by such a tile (`control_tile_id` set) keep
//! an [`ExitTable`]: control records must arrive with strictly increasing
//! image ids, exited images are flushed from both buffers, and their
//! still-idle passes are skipped.

use serde::{Deserialize, Serialize};

use crate::buffer::{BufferError, InputBuffer, OutputBuffer};
use crate::data::{batch_bits, DataItem, ExitTable};
use crate::wire::Position;
use crate::SimTime;

/// Arena index of a tile inside the mapped array.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TileIdx(pub usize);

impl TileIdx {
    /// Access the underlying index.
    #[inline]
    pub fn as_usize(self) -> usize {
        self.0
    }
}

/// One computational step of a pass: what to wait for, what to produce,
/// what to drop afterwards, and how long it takes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Dependence {
    /// Items that must be resident in the input buffer before starting.
    pub wait: Vec<DataItem>,
    /// Items pushed to the output buffer on completion.
    pub output: Vec<DataItem>,
    /// Items removed from the input buffer on completion.
    pub drop: Vec<DataItem>,
    /// Simulated duration of the step; must be positive.
    pub latency: SimTime,
}

/// Behavior description of one tile, as produced by the upstream mapper.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TileBehavior {
    /// Task this tile belongs to (assigned by the mapping).
    #[serde(default)]
    pub task_id: usize,
    /// Behavior-level id of this tile, unique within the task.
    pub tile_id: i64,
    /// Layer of the network this tile computes.
    pub layer_id: i64,
    /// Tiles consuming this tile's outputs; `[-1]` marks a sink.
    pub target_tile_id: Vec<i64>,
    /// Tiles feeding this tile; `[-1]` marks an environment-fed source.
    pub source_tile_id: Vec<i64>,
    /// Tile whose control records gate this tile, if any.
    #[serde(default)]
    pub control_tile_id: Option<i64>,
    /// Exit branch this tile aggregates, if any.
    #[serde(default)]
    pub exit_id: Option<usize>,
    /// One-pass dependence template.
    pub dependence: Vec<Dependence>,
}

/// Errors raised by tile construction and updates.
#[derive(Debug, thiserror::Error)]
pub enum TileError {
    /// A pass declared a non-positive latency.
    #[error("tile {tile_id}: non-positive latency {latency} at image {image} step {step}")]
    NonPositiveLatency {
        /// Offending tile.
        tile_id: i64,
        /// Declared latency.
        latency: SimTime,
        /// Image of the pass.
        image: usize,
        /// Step within the pass.
        step: usize,
    },
    /// Control records must arrive with strictly increasing image ids.
    #[error("tile {tile_id}: exit signal for image {got} not beyond watermark {last}")]
    ExitNotMonotone {
        /// Offending tile.
        tile_id: i64,
        /// Watermark before the record.
        last: i64,
        /// Image id of the rejected record.
        got: usize,
    },
    /// A control record reached a tile with no exit table.
    #[error("tile {tile_id}: control record delivered to an uncontrolled tile")]
    NotControlled {
        /// Offending tile.
        tile_id: i64,
    },
    /// The tile was still mid-computation when the run finished.
    #[error("tile {tile_id}: still running at finish")]
    StillRunning {
        /// Offending tile.
        tile_id: i64,
    },
    /// An environment-fed tile must execute every pass.
    #[error("tile {tile_id}: source tile stopped after {completed} of {expected} passes")]
    SourceIncomplete {
        /// Offending tile.
        tile_id: i64,
        /// Passes actually committed.
        completed: usize,
        /// Passes required.
        expected: usize,
    },
    /// A buffer operation failed; the tile id localizes the fault.
    #[error("tile {tile_id}: {side} buffer: {source}")]
    Buffer {
        /// Offending tile.
        tile_id: i64,
        /// Which buffer ("input" or "output").
        side: &'static str,
        /// Underlying buffer error.
        #[source]
        source: BufferError,
    },
    /// A buffer cannot hold even a single pass of its traffic.
    #[error("tile {tile_id}: {side} buffer too small for one pass ({need} > {have} bits)")]
    BufferTooSmall {
        /// Offending tile.
        tile_id: i64,
        /// Which buffer ("input" or "output").
        side: &'static str,
        /// Bits required by one pass.
        need: u64,
        /// Configured capacity.
        have: u64,
    },
    /// The exit sample list does not cover every image of the workload.
    #[error("tile {tile_id}: exit sample list covers {have} images, workload has {need}")]
    MissingSample {
        /// Offending tile.
        tile_id: i64,
        /// Images covered by the sample list.
        have: usize,
        /// Images in the workload.
        need: usize,
    },
}

// ============================================================================
// Dependence stream
// ============================================================================

/// Extra state for tiles that aggregate an exit branch.
#[derive(Clone, Debug)]
struct ExitSpec {
    /// Per-image exit decision, sampled upstream.
    choices: Vec<bool>,
    /// Control record length in bits.
    control_len: u64,
    /// Behavior-level id stamped into emitted records.
    tile_id: i64,
}

/// Lazy view of the unrolled computation list.
///
/// Yields the template passes in `(image, step)` order without ever
/// materializing `image_num` copies; image ids inside the items are
/// rewritten on instantiation. The cursor only moves forward, so passes
/// before it are committed-or-skipped and passes at or after it are idle.
#[derive(Debug)]
pub struct DependenceStream {
    template: Vec<Dependence>,
    image_num: usize,
    exit: Option<ExitSpec>,
    image: usize,
    step: usize,
}

impl DependenceStream {
    fn new(template: Vec<Dependence>, image_num: usize, exit: Option<ExitSpec>) -> Self {
        Self { template, image_num, exit, image: 0, step: 0 }
    }

    /// Current cursor, or `None` once every pass was yielded.
    #[inline]
    pub fn cursor(&self) -> Option<(usize, usize)> {
        if self.template.is_empty() || self.image >= self.image_num {
            None
        } else {
            Some((self.image, self.step))
        }
    }

    /// True once no passes remain.
    #[inline]
    pub fn is_exhausted(&self) -> bool {
        self.cursor().is_none()
    }

    /// Whether the current pass waits on anything at all.
    #[inline]
    fn current_waits(&self) -> bool {
        self.cursor().map_or(false, |(_, step)| !self.template[step].wait.is_empty())
    }

    /// Materialize the pass `(image, step)` from the template.
    fn instantiate(&self, image: usize, step: usize) -> Dependence {
        let base = &self.template[step];
        let mut dep = Dependence {
            wait: base.wait.iter().map(|item| item.with_image(image)).collect(),
            output: base.output.iter().map(|item| item.with_image(image)).collect(),
            drop: base.drop.iter().map(|item| item.with_image(image)).collect(),
            latency: base.latency,
        };
        if let Some(exit) = &self.exit {
            dep.output = vec![DataItem::Control {
                image_id: image,
                exit: exit.choices[image],
                length: exit.control_len,
                tile_id: exit.tile_id,
            }];
        }
        dep
    }

    /// Move past the current pass.
    fn advance(&mut self) {
        self.step += 1;
        if self.step >= self.template.len() {
            self.step = 0;
            self.image += 1;
        }
    }

    /// Jump to the first pass of `image`, skipping idle passes in between.
    fn skip_to_image(&mut self, image: usize) {
        debug_assert!(
            image > self.image || (image == self.image && self.step == 0),
            "cursor may only move forward"
        );
        self.image = image;
        self.step = 0;
    }

    /// Skip the remaining passes of the current image.
    fn skip_image(&mut self) {
        self.image += 1;
        self.step = 0;
    }
}

// ============================================================================
// Tile
// ============================================================================

/// The pass currently occupying the tile.
#[derive(Debug)]
struct RunningPass {
    image: usize,
    dependence: Dependence,
}

/// A compute element at one grid position, executing its behavior list.
#[derive(Debug)]
pub struct Tile {
    position: Position,
    image_num: usize,
    behavior: TileBehavior,
    input_buffer: InputBuffer,
    output_buffer: OutputBuffer,
    exit_table: Option<ExitTable>,
    stream: DependenceStream,
    running: Option<RunningPass>,
    completed: usize,
    computation_end_time: SimTime,
    computation_range: Vec<(SimTime, SimTime)>,
}

impl Tile {
    /// Construct a tile at `position` from its behavior description.
    ///
    /// `buffer_size` is `(input_bits, output_bits)`. `sample_list` supplies
    /// the per-image exit decisions (`sample_list[image][exit_id]`) and is
    /// only consulted when `behavior.exit_id` is set.
    pub fn new(
        position: Position,
        image_num: usize,
        buffer_size: (u64, u64),
        mut behavior: TileBehavior,
        sample_list: &[Vec<bool>],
    ) -> Result<Self, TileError> {
        let is_source = behavior.source_tile_id == [-1];
        let is_sink = behavior.target_tile_id == [-1];

        let mut input_buffer = InputBuffer::new(buffer_size.0);
        let mut output_buffer = OutputBuffer::new(buffer_size.1);
        if is_source {
            input_buffer.set_start();
        }
        if is_sink {
            input_buffer.set_end();
            output_buffer.set_end();
        }

        let exit = match behavior.exit_id {
            Some(exit_id) => {
                if sample_list.len() < image_num
                    || sample_list.iter().take(image_num).any(|row| row.len() <= exit_id)
                {
                    return Err(TileError::MissingSample {
                        tile_id: behavior.tile_id,
                        have: sample_list.len(),
                        need: image_num,
                    });
                }
                let decision_bits =
                    if image_num > 1 { (image_num as f64).log2().ceil() as u64 } else { 0 };
                let control_len = decision_bits + 1 + 10;
                Some(ExitSpec {
                    choices: sample_list.iter().take(image_num).map(|row| row[exit_id]).collect(),
                    control_len,
                    tile_id: behavior.tile_id,
                })
            }
            None => None,
        };

        // one pass must fit; otherwise the tile can never start. Source
        // inputs and terminal buffers are unbounded and exempt.
        for dep in &behavior.dependence {
            let wait_bits = batch_bits(&dep.wait);
            if !is_source && !is_sink && wait_bits > buffer_size.0 {
                return Err(TileError::BufferTooSmall {
                    tile_id: behavior.tile_id,
                    side: "input",
                    need: wait_bits,
                    have: buffer_size.0,
                });
            }
            let output_bits = batch_bits(&dep.output);
            if !is_sink && exit.is_none() && output_bits > buffer_size.1 {
                return Err(TileError::BufferTooSmall {
                    tile_id: behavior.tile_id,
                    side: "output",
                    need: output_bits,
                    have: buffer_size.1,
                });
            }
        }

        let exit_table = behavior.control_tile_id.map(|control| {
            behavior.source_tile_id.push(control);
            ExitTable::new()
        });

        let stream = DependenceStream::new(behavior.dependence.clone(), image_num, exit);

        Ok(Self {
            position,
            image_num,
            behavior,
            input_buffer,
            output_buffer,
            exit_table,
            stream,
            running: None,
            completed: 0,
            computation_end_time: f64::INFINITY,
            computation_range: Vec::new(),
        })
    }

    /// Grid position of the tile.
    #[inline]
    pub fn position(&self) -> Position {
        self.position
    }

    /// Behavior-level id.
    #[inline]
    pub fn tile_id(&self) -> i64 {
        self.behavior.tile_id
    }

    /// Task the tile belongs to.
    #[inline]
    pub fn task_id(&self) -> usize {
        self.behavior.task_id
    }

    /// Layer the tile computes.
    #[inline]
    pub fn layer_id(&self) -> i64 {
        self.behavior.layer_id
    }

    /// Behavior-level ids of the tiles this one feeds.
    #[inline]
    pub fn target_tile_id(&self) -> &[i64] {
        &self.behavior.target_tile_id
    }

    /// Behavior-level ids of the tiles feeding this one.
    #[inline]
    pub fn source_tile_id(&self) -> &[i64] {
        &self.behavior.source_tile_id
    }

    /// True for environment-fed tiles.
    #[inline]
    pub fn is_source(&self) -> bool {
        self.input_buffer.start_flag()
    }

    /// True when this tile aggregates an exit branch and emits control
    /// records.
    #[inline]
    pub fn is_exit_driver(&self) -> bool {
        self.behavior.exit_id.is_some()
    }

    /// Passes committed so far.
    #[inline]
    pub fn completed(&self) -> usize {
        self.completed
    }

    /// Bits one pass pushes to the output buffer. This is the per-pass
    /// traffic the communications leaving this tile will carry.
    pub fn pass_output_bits(&self) -> u64 {
        (0..self.stream.template.len())
            .map(|step| batch_bits(&self.stream.instantiate(0, step).output))
            .sum()
    }

    /// End time of the pass in flight, or infinity when idle.
    #[inline]
    pub fn get_computation_end_time(&self) -> SimTime {
        if self.running.is_some() {
            self.computation_end_time
        } else {
            f64::INFINITY
        }
    }

    /// Every committed computation interval, in start order.
    #[inline]
    pub fn computation_range_time(&self) -> &[(SimTime, SimTime)] {
        &self.computation_range
    }

    /// Committed intervals grouped per image. Only meaningful when no pass
    /// was skipped, i.e. when every image ran every step.
    pub fn get_computation_range(&self) -> Vec<Vec<(SimTime, SimTime)>> {
        let steps = self.behavior.dependence.len().max(1);
        self.computation_range.chunks(steps).map(|chunk| chunk.to_vec()).collect()
    }

    /// Fraction of `[0, end_time]` this tile spent computing. Verifies the
    /// tile finished cleanly first.
    pub fn get_running_rate(&self, end_time: SimTime) -> Result<f64, TileError> {
        self.check_finish()?;
        let busy: f64 = self.computation_range.iter().map(|(s, e)| e - s).sum();
        Ok(busy / end_time)
    }

    /// Advance the tile to `current_time`.
    pub fn update(&mut self, current_time: SimTime) -> Result<(), TileError> {
        if self.running.is_some() {
            if current_time < self.computation_end_time {
                return Ok(());
            }
            // pass completes
            let Some(RunningPass { image, dependence }) = self.running.take() else {
                return Ok(());
            };
            self.completed += 1;
            self.stream.advance();
            let exited = self.exit_table.as_ref().map_or(false, |t| t.contains(image));
            if exited {
                debug_assert_eq!(
                    self.exit_table.as_ref().map(|t| t.watermark),
                    Some(image as i64),
                    "exited pass must be the one at the watermark"
                );
                // outputs are discarded; the drops were flushed when the
                // decision arrived
            } else {
                let tile_id = self.behavior.tile_id;
                self.input_buffer
                    .delete(&dependence.drop)
                    .map_err(|source| TileError::Buffer { tile_id, side: "input", source })?;
                self.output_buffer
                    .add(&dependence.output)
                    .map_err(|source| TileError::Buffer { tile_id, side: "output", source })?;
            }
        }

        debug_assert!(self.running.is_none(), "tile must be idle past this point");

        // settle the cursor: exited images are skipped outright, and if the
        // head of the input buffer has jumped ahead the idle passes in
        // between can never start.
        loop {
            while let Some((image, _)) = self.stream.cursor() {
                if self.exit_table.as_ref().map_or(false, |t| t.contains(image)) {
                    self.stream.skip_image();
                } else {
                    break;
                }
            }
            let Some((image, _)) = self.stream.cursor() else { break };
            if !self.stream.current_waits() {
                break;
            }
            match self.input_buffer.possible_image_id() {
                Some(possible) if possible > image => {
                    tracing::debug!(
                        tile_id = self.behavior.tile_id,
                        from = image,
                        to = possible,
                        "skipping passes whose inputs can no longer arrive"
                    );
                    self.stream.skip_to_image(possible);
                    // re-check exits at the new cursor
                    continue;
                }
                _ => break,
            }
        }

        let Some((image, step)) = self.stream.cursor() else {
            self.computation_end_time = f64::INFINITY;
            return Ok(());
        };
        let dependence = self.stream.instantiate(image, step);

        if self.input_buffer.check_data_already(&dependence.wait)
            && self.output_buffer.check_enough_space(&dependence.output)
        {
            if dependence.latency <= 0.0 {
                return Err(TileError::NonPositiveLatency {
                    tile_id: self.behavior.tile_id,
                    latency: dependence.latency,
                    image,
                    step,
                });
            }
            self.computation_end_time = current_time + dependence.latency;
            self.computation_range.push((current_time, self.computation_end_time));
            self.running = Some(RunningPass { image, dependence });
        } else {
            self.computation_end_time = f64::INFINITY;
        }
        Ok(())
    }

    /// Fold incoming control records into the exit table.
    ///
    /// Image ids must be strictly increasing. A set exit bit lists the
    /// image, both buffers are flushed of it, and its still-idle passes
    /// will be skipped by the next [`Tile::update`].
    pub fn update_exit_table(&mut self, exit_data: &[DataItem]) -> Result<(), TileError> {
        let tile_id = self.behavior.tile_id;
        let mut table = self.exit_table.take().ok_or(TileError::NotControlled { tile_id })?;
        for item in exit_data {
            let DataItem::Control { image_id, exit, .. } = item else { continue };
            if (*image_id as i64) <= table.watermark {
                let err = TileError::ExitNotMonotone { tile_id, last: table.watermark, got: *image_id };
                self.exit_table = Some(table);
                return Err(err);
            }
            if *exit {
                table.table.push(*image_id);
            }
            table.watermark = *image_id as i64;
            self.input_buffer.filter_exit_table(&table);
            self.output_buffer.filter_exit_table(&table);
        }
        self.exit_table = Some(table);
        Ok(())
    }

    /// Deliver transferred items: resident payloads plus any control
    /// records folded into the exit table.
    pub(crate) fn receive(&mut self, items: &[DataItem]) -> Result<(), TileError> {
        let tile_id = self.behavior.tile_id;
        self.input_buffer
            .add(items, self.exit_table.as_ref())
            .map_err(|source| TileError::Buffer { tile_id, side: "input", source })?;
        let controls: Vec<DataItem> = items.iter().filter(|i| i.is_control()).cloned().collect();
        if !controls.is_empty() {
            self.update_exit_table(&controls)?;
        }
        Ok(())
    }

    /// Reserve input capacity for items granted a path.
    pub(crate) fn reserve_incoming(&mut self, items: &[DataItem]) {
        self.input_buffer.add_transfer(items);
    }

    /// Whether the input buffer can take `items` on top of its current
    /// residents and reservations.
    pub(crate) fn can_accept(&self, items: &[DataItem]) -> bool {
        self.input_buffer.check_enough_space(items)
    }

    /// The next item the output buffer offers for transfer, as a
    /// single-item batch.
    pub(crate) fn next_transfer(&self) -> Option<Vec<DataItem>> {
        self.output_buffer
            .next_transfer(self.exit_table.as_ref(), self.is_exit_driver())
            .map(|item| vec![item])
    }

    /// Remove items that finished crossing the wires.
    pub(crate) fn finish_transfer_out(&mut self, items: &[DataItem]) -> Result<(), TileError> {
        let tile_id = self.behavior.tile_id;
        self.output_buffer
            .delete(items)
            .map_err(|source| TileError::Buffer { tile_id, side: "output", source })
    }

    /// Read access for tests and analysis.
    #[inline]
    pub fn input_buffer(&self) -> &InputBuffer {
        &self.input_buffer
    }

    /// Read access for tests and analysis.
    #[inline]
    pub fn output_buffer(&self) -> &OutputBuffer {
        &self.output_buffer
    }

    /// Verify the tile reached a legal terminal state.
    ///
    /// Source tiles must have run every pass. Other tiles may stop short
    /// when upstream early-exit drained their dependencies, but never
    /// mid-computation, and never with items left in a non-terminal buffer.
    pub fn check_finish(&self) -> Result<(), TileError> {
        let tile_id = self.behavior.tile_id;
        if self.running.is_some() {
            return Err(TileError::StillRunning { tile_id });
        }
        if self.is_source() && !self.stream.is_exhausted() {
            return Err(TileError::SourceIncomplete {
                tile_id,
                completed: self.completed,
                expected: self.image_num * self.behavior.dependence.len(),
            });
        }
        self.input_buffer
            .check_finish()
            .map_err(|source| TileError::Buffer { tile_id, side: "input", source })?;
        self.output_buffer
            .check_finish()
            .map_err(|source| TileError::Buffer { tile_id, side: "output", source })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(from_tile: i64, image: usize, bits: u64) -> DataItem {
        DataItem::Payload {
            x: 0,
            y: 0,
            start: 0,
            end: bits,
            bit: 1,
            total: 1,
            image_id: image,
            layer_id: 0,
            in_id: 0,
            tile_id: from_tile,
        }
    }

    fn behavior(tile_id: i64, sources: Vec<i64>, targets: Vec<i64>) -> TileBehavior {
        TileBehavior {
            task_id: 0,
            tile_id,
            layer_id: tile_id,
            target_tile_id: targets,
            source_tile_id: sources,
            control_tile_id: None,
            exit_id: None,
            dependence: vec![Dependence {
                wait: vec![payload(tile_id - 1, 0, 8)],
                output: vec![payload(tile_id, 0, 8)],
                drop: vec![payload(tile_id - 1, 0, 8)],
                latency: 10.0,
            }],
        }
    }

    fn pos() -> Position {
        Position::new(0, 0)
    }

    #[test]
    fn source_tile_runs_every_pass_back_to_back() {
        let mut tile =
            Tile::new(pos(), 2, (64, 64), behavior(0, vec![-1], vec![1]), &[]).unwrap();
        tile.update(0.0).unwrap();
        assert_eq!(tile.get_computation_end_time(), 10.0);
        tile.update(10.0).unwrap();
        assert_eq!(tile.completed(), 1);
        assert_eq!(tile.output_buffer().len(), 1);
        assert_eq!(tile.get_computation_end_time(), 20.0);
        tile.update(20.0).unwrap();
        assert_eq!(tile.completed(), 2);
        assert!(tile.get_computation_end_time().is_infinite());
        // sources never retain inputs, so only the output remains
        assert_eq!(tile.output_buffer().len(), 2);
    }

    #[test]
    fn tile_waits_for_inputs_and_output_space() {
        let mut tile = Tile::new(pos(), 1, (64, 8), behavior(1, vec![0], vec![-1]), &[]).unwrap();
        tile.update(0.0).unwrap();
        assert!(tile.get_computation_end_time().is_infinite());
        let input = payload(0, 0, 8);
        tile.reserve_incoming(std::slice::from_ref(&input));
        tile.receive(std::slice::from_ref(&input)).unwrap();
        tile.update(1.0).unwrap();
        assert_eq!(tile.get_computation_end_time(), 11.0);
        tile.update(11.0).unwrap();
        assert!(tile.input_buffer().is_empty());
        assert!(tile.check_finish().is_ok());
    }

    #[test]
    fn non_positive_latency_is_fatal() {
        let mut b = behavior(0, vec![-1], vec![1]);
        b.dependence[0].latency = 0.0;
        let mut tile = Tile::new(pos(), 1, (64, 64), b, &[]).unwrap();
        let err = tile.update(0.0).unwrap_err();
        assert!(matches!(err, TileError::NonPositiveLatency { .. }));
    }

    #[test]
    fn undersized_buffer_is_rejected_at_construction() {
        let err = Tile::new(pos(), 1, (4, 64), behavior(1, vec![0], vec![2]), &[]).unwrap_err();
        assert!(matches!(err, TileError::BufferTooSmall { side: "input", .. }));
    }

    #[test]
    fn skip_ahead_drops_unreachable_passes() {
        // 4 images; image 0 never arrives, image 2 is at the head
        let mut tile = Tile::new(pos(), 4, (64, 64), behavior(1, vec![0], vec![-1]), &[]).unwrap();
        let late = payload(0, 2, 8);
        tile.reserve_incoming(std::slice::from_ref(&late));
        tile.receive(std::slice::from_ref(&late)).unwrap();
        tile.update(0.0).unwrap();
        // the tile jumped straight to image 2 and started it
        assert_eq!(tile.get_computation_end_time(), 10.0);
        tile.update(10.0).unwrap();
        assert_eq!(tile.completed(), 1);
    }

    #[test]
    fn exit_driver_emits_control_records() {
        let mut b = behavior(0, vec![-1], vec![1]);
        b.exit_id = Some(0);
        let samples = vec![vec![false], vec![true]];
        let mut tile = Tile::new(pos(), 2, (64, 64), b, &samples).unwrap();
        tile.update(0.0).unwrap();
        tile.update(10.0).unwrap();
        tile.update(20.0).unwrap();
        assert_eq!(tile.completed(), 2);
        let head = tile.next_transfer().unwrap();
        // image_num = 2 -> ceil(log2(2)) + 1 + 10 = 12 bits
        assert_eq!(head, vec![DataItem::Control { image_id: 0, exit: false, length: 12, tile_id: 0 }]);
    }

    #[test]
    fn exit_table_rejects_stale_signals_and_skips_passes() {
        let mut b = behavior(1, vec![0], vec![-1]);
        b.control_tile_id = Some(9);
        let mut tile = Tile::new(pos(), 3, (64, 64), b, &[]).unwrap();

        let exit1 = DataItem::Control { image_id: 1, exit: true, length: 12, tile_id: 9 };
        tile.update_exit_table(std::slice::from_ref(&exit1)).unwrap();
        let stale = DataItem::Control { image_id: 0, exit: false, length: 12, tile_id: 9 };
        let err = tile.update_exit_table(std::slice::from_ref(&stale)).unwrap_err();
        assert!(matches!(err, TileError::ExitNotMonotone { last: 1, got: 0, .. }));

        // run image 0, then the cursor must skip exited image 1
        for image in [0usize, 2] {
            let input = payload(0, image, 8);
            tile.reserve_incoming(std::slice::from_ref(&input));
            tile.receive(std::slice::from_ref(&input)).unwrap();
        }
        tile.update(0.0).unwrap();
        tile.update(10.0).unwrap(); // image 0 done
        tile.update(10.0).unwrap();
        assert_eq!(tile.get_computation_end_time(), 20.0);
        tile.update(20.0).unwrap(); // image 2 done, image 1 skipped
        assert_eq!(tile.completed(), 2);
        assert!(tile.check_finish().is_ok());
    }

    #[test]
    fn exited_items_are_flushed_from_buffers() {
        let mut b = behavior(1, vec![0], vec![-1]);
        b.control_tile_id = Some(9);
        let mut tile = Tile::new(pos(), 2, (64, 64), b, &[]).unwrap();
        let doomed = payload(0, 0, 8);
        tile.reserve_incoming(std::slice::from_ref(&doomed));
        tile.receive(std::slice::from_ref(&doomed)).unwrap();
        assert_eq!(tile.input_buffer().len(), 1);
        let exit0 = DataItem::Control { image_id: 0, exit: true, length: 12, tile_id: 9 };
        tile.update_exit_table(std::slice::from_ref(&exit0)).unwrap();
        assert!(tile.input_buffer().is_empty());
    }

    #[test]
    fn source_tile_must_finish_all_passes() {
        let tile = Tile::new(pos(), 2, (64, 64), behavior(0, vec![-1], vec![1]), &[]).unwrap();
        let err = tile.check_finish().unwrap_err();
        assert!(matches!(err, TileError::SourceIncomplete { completed: 0, .. }));
    }

    #[test]
    fn stalled_non_source_tile_finishes_cleanly() {
        let tile = Tile::new(pos(), 2, (64, 64), behavior(1, vec![0], vec![-1]), &[]).unwrap();
        assert!(tile.check_finish().is_ok());
    }
}
