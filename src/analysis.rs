//! Post-run analysis: conflict matrices and equivalent communication
//!
//! Everything in this module is a pure function over per-communication
//! snapshots taken after a pass: occupancy intervals, path keys, per-pass
//! amount and layer tag. The engine snapshots once and hands the data
//! over; nothing here touches simulator state.
//!
//! ### Conflict rate
//! For two communications whose wire sets intersect, the conflict entry
//! `conflict[i][j]` is the total time their occupancy intervals overlap,
//! normalized by `i`'s own occupancy. The overlap sweep walks both
//! interval lists with two cursors, always advancing the side that ends
//! earlier, and stops as soon as either list is exhausted; intervals
//! remaining on the longer side past that point are not counted, which
//! slightly under-reports when the two lists have very different lengths.
//!
//! ### Equivalent communication
//! `r_amount` is the raw byte-hop sum `Σ amount · |path|`. Each
//! communication's effective amount is penalized by its **worst single**
//! pairwise conflict, `e = max_j tmp / (1 − 0.5 · conflict[i][j])`, and
//! the aggregate takes the maximum per layer before summing layers.

use std::collections::BTreeMap;

use crate::communication::Communication;
use crate::SimTime;

/// Immutable per-communication view the analysis runs on.
#[derive(Clone, Debug)]
pub struct CommSnapshot {
    /// Per-pass byte count.
    pub amount: f64,
    /// Occupied `(start, end)` intervals, disjoint and increasing.
    pub ranges: Vec<(SimTime, SimTime)>,
    /// Canonical wire keys along the route.
    pub path: Vec<String>,
    /// Layer tag for the per-layer aggregation.
    pub layer: i64,
}

/// Snapshot every communication of a finished pass.
pub fn snapshot(communications: &[Communication]) -> Vec<CommSnapshot> {
    communications
        .iter()
        .map(|comm| CommSnapshot {
            amount: comm.get_communication_amount() as f64,
            ranges: comm.get_communication_range().to_vec(),
            path: comm.path_keys(),
            layer: comm.get_layer_info(),
        })
        .collect()
}

fn paths_intersect(a: &[String], b: &[String]) -> bool {
    a.iter().any(|key| b.contains(key))
}

/// Total overlap between two interval lists, two-cursor sweep.
fn overlap_time(a: &[(SimTime, SimTime)], b: &[(SimTime, SimTime)]) -> SimTime {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let (mut i, mut j) = (0usize, 0usize);
    let mut common = 0.0;
    loop {
        common += (a[i].1.min(b[j].1) - a[i].0.max(b[j].0)).max(0.0);
        if a[i].1 <= b[j].0 {
            i += 1;
            if i >= a.len() {
                break;
            }
        } else {
            j += 1;
            if j >= b.len() {
                break;
            }
        }
    }
    common
}

/// The conflict-rate matrix and its boolean shadow.
///
/// `conflict[i][j]` is zero on the diagonal and for path-disjoint pairs;
/// `bool_matrix[i][j]` is 1 exactly where the overlap was positive.
pub fn conflict_matrices(snapshots: &[CommSnapshot]) -> (Vec<Vec<f64>>, Vec<Vec<u8>>) {
    let n = snapshots.len();
    let mut conflict = vec![vec![0.0; n]; n];
    let mut boolean = vec![vec![0u8; n]; n];
    for i in 0..n {
        let self_occupy: f64 = snapshots[i].ranges.iter().map(|(s, e)| e - s).sum();
        if self_occupy <= 0.0 {
            continue;
        }
        for j in 0..n {
            if i == j || !paths_intersect(&snapshots[i].path, &snapshots[j].path) {
                continue;
            }
            let common = overlap_time(&snapshots[i].ranges, &snapshots[j].ranges);
            conflict[i][j] = common / self_occupy;
            boolean[i][j] = u8::from(common > 0.0);
        }
    }
    (conflict, boolean)
}

/// Raw and equivalent communication amounts.
///
/// Returns `(r_amount, e_amount)`: the raw byte-hop sum and the
/// conflict-penalized aggregate (per-communication worst-pair penalty,
/// per-layer maximum, summed over layers).
pub fn equivalent_communication(
    snapshots: &[CommSnapshot],
    conflict: &[Vec<f64>],
) -> (f64, f64) {
    let n = snapshots.len();
    let mut r_amount = 0.0;
    let mut effective = vec![0.0; n];
    for i in 0..n {
        let tmp = snapshots[i].amount * snapshots[i].path.len() as f64;
        r_amount += tmp;
        let mut e = tmp;
        for j in 0..n {
            e = e.max(tmp / (1.0 - 0.5 * conflict[i][j]));
        }
        effective[i] = e;
    }
    let mut per_layer: BTreeMap<i64, f64> = BTreeMap::new();
    for i in 0..n {
        let entry = per_layer.entry(snapshots[i].layer).or_insert(0.0);
        *entry = entry.max(effective[i]);
    }
    let e_amount = per_layer.values().sum();
    (r_amount, e_amount)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(amount: f64, ranges: Vec<(f64, f64)>, path: &[&str], layer: i64) -> CommSnapshot {
        CommSnapshot {
            amount,
            ranges,
            path: path.iter().map(|s| s.to_string()).collect(),
            layer,
        }
    }

    #[test]
    fn single_communication_matrix_is_zero() {
        let snaps = vec![snap(8.0, vec![(0.0, 4.0)], &["w0"], 0)];
        let (conflict, boolean) = conflict_matrices(&snaps);
        assert_eq!(conflict, vec![vec![0.0]]);
        assert_eq!(boolean, vec![vec![0]]);
    }

    #[test]
    fn disjoint_paths_never_conflict() {
        let snaps = vec![
            snap(8.0, vec![(0.0, 4.0)], &["w0"], 0),
            snap(8.0, vec![(0.0, 4.0)], &["w1"], 1),
        ];
        let (conflict, boolean) = conflict_matrices(&snaps);
        assert_eq!(conflict[0][1], 0.0);
        assert_eq!(boolean[1][0], 0);
    }

    #[test]
    fn identical_ranges_and_paths_conflict_fully() {
        let ranges = vec![(0.0, 2.0), (5.0, 7.0)];
        let snaps = vec![
            snap(8.0, ranges.clone(), &["w0", "w1"], 0),
            snap(8.0, ranges, &["w1", "w2"], 1),
        ];
        let (conflict, boolean) = conflict_matrices(&snaps);
        assert_eq!(conflict[0][1], 1.0);
        assert_eq!(conflict[1][0], 1.0);
        assert_eq!(boolean[0][1], 1);
        // worst-pair penalty doubles the effective amount
        let (r_amount, e_amount) = equivalent_communication(&snaps, &conflict);
        assert_eq!(r_amount, 16.0 + 16.0);
        assert_eq!(e_amount, 32.0 + 32.0);
    }

    #[test]
    fn partial_overlap_is_normalized_by_own_occupancy() {
        let snaps = vec![
            snap(8.0, vec![(0.0, 4.0)], &["w0"], 0),
            snap(8.0, vec![(2.0, 4.0)], &["w0"], 1),
        ];
        let (conflict, boolean) = conflict_matrices(&snaps);
        assert_eq!(conflict[0][1], 0.5);
        assert_eq!(conflict[1][0], 1.0);
        assert_eq!(boolean[0][1], 1);
        assert_eq!(boolean[1][0], 1);
    }

    #[test]
    fn sweep_stops_when_either_side_runs_dry() {
        // the second interval of `a` overlaps nothing that `b` still has
        let a = vec![(0.0, 1.0), (10.0, 11.0)];
        let b = vec![(0.5, 1.0)];
        assert_eq!(overlap_time(&a, &b), 0.5);
        // truncation: b's later intervals are never visited once a is done
        let a = vec![(0.0, 1.0)];
        let b = vec![(0.5, 1.0), (0.9, 2.0), (10.0, 20.0)];
        assert_eq!(overlap_time(&a, &b), 0.5 + 0.1);
    }

    #[test]
    fn no_occupancy_means_no_conflict_row() {
        let snaps = vec![
            snap(8.0, vec![], &["w0"], 0),
            snap(8.0, vec![(0.0, 1.0)], &["w0"], 1),
        ];
        let (conflict, boolean) = conflict_matrices(&snaps);
        assert_eq!(conflict[0][1], 0.0);
        assert_eq!(boolean[1][0], 0);
    }

    #[test]
    fn layer_aggregation_takes_the_per_layer_maximum() {
        // two same-layer communications on disjoint paths: only the larger
        // effective amount survives aggregation
        let snaps = vec![
            snap(8.0, vec![(0.0, 4.0)], &["w0"], 3),
            snap(4.0, vec![(0.0, 4.0)], &["w1"], 3),
            snap(2.0, vec![(0.0, 4.0)], &["w2"], 5),
        ];
        let (conflict, _) = conflict_matrices(&snaps);
        let (r_amount, e_amount) = equivalent_communication(&snaps, &conflict);
        assert_eq!(r_amount, 8.0 + 4.0 + 2.0);
        assert_eq!(e_amount, 8.0 + 2.0);
    }

    #[test]
    fn e_amount_never_undershoots_raw_byte_hops_per_layer() {
        let snaps = vec![
            snap(8.0, vec![(0.0, 2.0)], &["w0", "w1"], 0),
            snap(6.0, vec![(1.0, 2.0)], &["w1"], 1),
        ];
        let (conflict, _) = conflict_matrices(&snaps);
        let (_, e_amount) = equivalent_communication(&snaps, &conflict);
        let per_layer_max = 16.0f64.max(6.0);
        assert!(e_amount >= per_layer_max);
    }
}
