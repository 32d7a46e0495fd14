//! Crate root: public surface, core aliases, and simulator-wide invariants
//!
//! This crate is a behavior-driven discrete-event simulator for a
//! network-on-chip connecting an array of compute tiles that execute a
//! neural-network workload. Given per-tile behavior lists, a grid shape,
//! buffer sizes and a link bandwidth, it predicts the end-to-end latency
//! of the mapped workload and quantifies wire contention through a
//! conflict matrix and an equivalent-communication metric.
//!
//! ## Invariants (enforced across the submodules)
//!
//! - **Event-driven time.** Simulated time is an `f64` that only jumps to
//!   the earliest pending event; a tick that fails to move time forward is
//!   a hard error, and the only legal termination is "no finite event
//!   anywhere".
//! - **Single-threaded ticks.** There is no OS-level concurrency;
//!   simultaneity is modeled by timestamps. Within one tick the update
//!   order delivers incoming transfers before the consuming tile runs and
//!   the scheduler decides strictly after all updates.
//! - **Capacity discipline.** In-flight transfers reserve consumer-side
//!   buffer capacity at grant time and deliveries consume exactly those
//!   reservations, so no grant can overflow a buffer and no delivery can
//!   appear out of thin air.
//! - **Wires are the only shared resource.** In opaque mode the set of
//!   busy wires always equals the union of paths of in-flight transfers;
//!   transparent mode turns every wire query into "free" to produce a
//!   conflict-free lower bound.
//!
//! Violations surface as precise typed errors naming the offending tile or
//! communication; the simulator is deterministic, so a failing run fails
//! the same way every time.

#![forbid(unsafe_code)]
#![deny(missing_docs, rust_2018_idioms)]

use serde::{Deserialize, Serialize};

/// Post-run analysis: conflict matrices and equivalent communication.
pub mod analysis;
/// The event-loop engine driving transparent and opaque passes.
pub mod array;
/// Input/output buffers with the capacity and reservation discipline.
pub mod buffer;
/// Producer→consumer transfers over routed wire paths.
pub mod communication;
/// Data items and the early-exit table.
pub mod data;
/// Placement strategies: grid fill, communications, update order.
pub mod mapping;
/// Experiment records and result persistence.
pub mod report;
/// Per-tick path allocation strategies.
pub mod schedule;
/// Compute tiles and their behavior state machine.
pub mod tile;
/// Physical links and the shared wire net.
pub mod wire;

// ============================================================================
// Canonical aliases and root-level re-exports
// ============================================================================

/// Simulated time. Idle modules report [`f64::INFINITY`] as their next
/// event.
pub type SimTime = f64;

pub use crate::array::{BaseArray, SimError};
pub use crate::data::DataItem;
pub use crate::report::{CommunicationInfo, ExperimentRecord};
pub use crate::tile::{Dependence, TileBehavior, TileIdx};
pub use crate::wire::{Position, WireId};

// ============================================================================
// Top-level configuration
// ============================================================================

fn default_strategy() -> String {
    "naive".to_string()
}

/// Everything one evaluation needs: the workload, the array geometry and
/// the strategy selectors.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SimConfig {
    /// Per-task behavior lists, as produced by the upstream mapper.
    pub task_behavior_list: Vec<Vec<TileBehavior>>,
    /// Number of images (throughput passes) each tile executes.
    pub image_num: usize,
    /// Grid shape `(rows, cols)`.
    pub tile_net_shape: (usize, usize),
    /// Buffer capacities `(input_bits, output_bits)`, shared by all tiles.
    pub buffer_size: (u64, u64),
    /// Link bandwidth in bits per simulated time unit.
    pub band_width: f64,
    /// Placement strategy name.
    #[serde(default = "default_strategy")]
    pub mapping_strategy: String,
    /// Path-allocation strategy name.
    #[serde(default = "default_strategy")]
    pub schedule_strategy: String,
    /// Per-image exit decisions, `sample_list[image][exit_id]`.
    #[serde(default)]
    pub sample_list: Vec<Vec<bool>>,
}
