//! Experiment records and result persistence
//!
//! One [`ExperimentRecord`] per evaluated arrangement: the transparent
//! pass contributes the conflict matrices and per-communication info, the
//! opaque pass fills in the reported latency and the real occupancy
//! intervals. Records are serialized as one opaque JSON blob to a
//! collision-checked file whose name encodes the strategies, the image
//! count, the local wall-clock and a random suffix.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{Datelike, Local, Timelike};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::SimTime;

/// Per-communication slice of an experiment record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CommunicationInfo {
    /// Per-pass byte count.
    pub amount: f64,
    /// Occupancy intervals of the transparent pass.
    pub range_t: Vec<(SimTime, SimTime)>,
    /// Occupancy intervals of the opaque pass.
    pub range_o: Vec<(SimTime, SimTime)>,
    /// Canonical wire keys along the route.
    pub path: Vec<String>,
    /// Layer tag.
    pub layer: i64,
}

/// Everything the caller gets back for one arrangement.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExperimentRecord {
    /// Pairwise conflict rates from the transparent pass.
    pub conflict_matrix: Vec<Vec<f64>>,
    /// 1 where the conflict rate is positive.
    pub bool_matrix: Vec<Vec<u8>>,
    /// Per-communication details.
    pub communication_info_list: Vec<CommunicationInfo>,
    /// Final time of the opaque pass.
    pub latency: SimTime,
    /// Mapping-time cost of the arrangement.
    pub fitness: f64,
}

/// Write `records` next to the working directory under a unique name
/// `<tag>_<month>_<day>_(<hour>_<min>_<sec>)_<rand>.json` and return the
/// path.
pub fn write_records(tag: &str, records: &[ExperimentRecord]) -> anyhow::Result<PathBuf> {
    let now = Local::now();
    let mut rng = rand::thread_rng();
    loop {
        let filename = format!(
            "{}_{}_{}_({}_{}_{})_{}.json",
            tag,
            now.month(),
            now.day(),
            now.hour(),
            now.minute(),
            now.second(),
            rng.gen_range(0..100_000)
        );
        let path = PathBuf::from(filename);
        if path.exists() {
            continue;
        }
        let file = fs::File::create(&path)
            .map_err(|e| anyhow::anyhow!("create {}: {e}", path.display()))?;
        serde_json::to_writer(file, records)
            .map_err(|e| anyhow::anyhow!("serialize records: {e}"))?;
        return Ok(path);
    }
}

/// Read records back from a result file.
pub fn read_records(path: &Path) -> anyhow::Result<Vec<ExperimentRecord>> {
    let text = fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("open {}: {e}", path.display()))?;
    serde_json::from_str(&text).map_err(|e| anyhow::anyhow!("parse {}: {e}", path.display()))
}
