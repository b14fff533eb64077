//! Bin consistency checking
//!
//! Pure validation, no mutation: callers decide whether a failure aborts the
//! combination or drops the offending bin.
//!
//! Edge values are literal numbers copied from the calibration input, never
//! computed, so every comparison here is exact floating-point equality.

use crate::analysis::Analysis;
use crate::bins::Bin;
use cf_core::{Error, Result};
use std::collections::{BTreeMap, BTreeSet};

/// The sorted, distinct bin intervals of one axis variable.
#[derive(Debug, Clone, PartialEq)]
pub struct AxisEdges {
    /// Axis variable name
    pub variable: String,
    /// Distinct `(low, high)` intervals, sorted by low edge
    pub intervals: Vec<(f64, f64)>,
}

impl AxisEdges {
    /// Lowest covered edge.
    pub fn min(&self) -> f64 {
        self.intervals.first().map(|&(lo, _)| lo).unwrap_or(f64::NAN)
    }

    /// Highest covered edge.
    pub fn max(&self) -> f64 {
        self.intervals.last().map(|&(_, hi)| hi).unwrap_or(f64::NAN)
    }

    /// All distinct edge values (lows and highs), sorted.
    pub fn edges(&self) -> Vec<f64> {
        let mut edges: Vec<f64> =
            self.intervals.iter().flat_map(|&(lo, hi)| [lo, hi]).collect();
        edges.sort_by(f64::total_cmp);
        edges.dedup();
        edges
    }
}

/// Bins that participate in the primary grid of an analysis.
///
/// Extrapolated bins are excluded when the analysis mixes binning types;
/// an all-extended analysis is checked as-is.
pub fn primary_bins(ana: &Analysis) -> Vec<&Bin> {
    let mixed = ana.bins.iter().any(|b| b.extended) && ana.bins.iter().any(|b| !b.extended);
    ana.bins.iter().filter(|b| !(mixed && b.extended)).collect()
}

/// Collect the per-axis sorted interval lists of an analysis's primary grid.
pub fn axis_edges(ana: &Analysis) -> Vec<AxisEdges> {
    let mut by_axis: BTreeMap<&str, Vec<(f64, f64)>> = BTreeMap::new();
    for bin in primary_bins(ana) {
        for b in bin.spec.boundaries() {
            by_axis.entry(&b.variable).or_default().push((b.low, b.high));
        }
    }
    by_axis
        .into_iter()
        .map(|(variable, mut intervals)| {
            intervals.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.total_cmp(&b.1)));
            intervals.dedup_by(|a, b| a.0 == b.0 && a.1 == b.1);
            AxisEdges { variable: variable.to_string(), intervals }
        })
        .collect()
}

/// Verify one axis's intervals tile the axis: each bin's upper edge must
/// exactly equal the next bin's lower edge.
pub fn check_tiling(axis: &AxisEdges) -> Result<()> {
    for pair in axis.intervals.windows(2) {
        let (_, prev_high) = pair[0];
        let (next_low, _) = pair[1];
        if prev_high < next_low {
            return Err(Error::BoundaryGap {
                variable: axis.variable.clone(),
                high: prev_high,
                low: next_low,
            });
        }
        if prev_high > next_low {
            return Err(Error::BoundaryOverlap {
                variable: axis.variable.clone(),
                high: prev_high,
                low: next_low,
            });
        }
    }
    Ok(())
}

/// Validate the internal binning of one analysis.
///
/// Checks for duplicate bin positions, mismatched axis sets between bins,
/// and per-axis tiling. Returns the per-axis edges on success so callers can
/// reuse them for cross-analysis checks.
pub fn check_analysis(ana: &Analysis) -> Result<Vec<AxisEdges>> {
    let bins = primary_bins(ana);

    let mut seen: BTreeSet<String> = BTreeSet::new();
    for bin in &bins {
        if !seen.insert(bin.name()) {
            return Err(Error::DuplicateBin { bin: bin.name(), analysis: ana.full_name() });
        }
    }

    if let Some(first) = bins.first() {
        let axes: Vec<&str> = first.spec.variables().collect();
        for bin in &bins[1..] {
            let other: Vec<&str> = bin.spec.variables().collect();
            if other != axes {
                return Err(Error::Validation(format!(
                    "mismatched axis sets in analysis `{}`: bin `{}` uses [{}], bin `{}` uses [{}]",
                    ana.full_name(),
                    first.name(),
                    axes.join(", "),
                    bin.name(),
                    other.join(", ")
                )));
            }
        }
    }

    let edges = axis_edges(ana);
    for axis in &edges {
        check_tiling(axis)?;
    }
    Ok(edges)
}

/// Verify two analyses' boundary sets are mutually non-contradictory.
///
/// For every axis variable present in both: each bin edge of one must either
/// exactly match an edge of the other or lie entirely outside the other's
/// covered range. An edge strictly inside a foreign bin is an error.
pub fn check_compatible(a: &[AxisEdges], b: &[AxisEdges]) -> Result<()> {
    for axis_a in a {
        let Some(axis_b) = b.iter().find(|x| x.variable == axis_a.variable) else {
            continue;
        };
        check_edges_against(axis_a, axis_b)?;
        check_edges_against(axis_b, axis_a)?;
    }
    Ok(())
}

fn check_edges_against(edges: &AxisEdges, target: &AxisEdges) -> Result<()> {
    for e in edges.edges() {
        for &(lo, hi) in &target.intervals {
            if lo < e && e < hi {
                return Err(Error::BoundaryStraddle {
                    variable: edges.variable.clone(),
                    edge: e,
                    low: lo,
                    high: hi,
                });
            }
        }
    }
    Ok(())
}

/// Verify that any systematic name used in more than one place in a group
/// carries the same `uncorrelated` flag everywhere.
pub fn check_systematic_flags(group: &[&Analysis]) -> Result<()> {
    let mut seen: BTreeMap<String, (bool, String)> = BTreeMap::new();
    for ana in group {
        for bin in &ana.bins {
            for sys in &bin.systematics {
                match seen.get(&sys.name) {
                    None => {
                        seen.insert(
                            sys.name.clone(),
                            (sys.uncorrelated, ana.full_name()),
                        );
                    }
                    Some((flag, first)) if *flag != sys.uncorrelated => {
                        return Err(Error::FlagMismatch {
                            systematic: sys.name.clone(),
                            first: first.clone(),
                            first_flag: *flag,
                            second: ana.full_name(),
                            second_flag: sys.uncorrelated,
                        });
                    }
                    Some(_) => {}
                }
            }
        }
    }
    Ok(())
}

/// Full validation of a combination group: each analysis internally, all
/// pairs mutually, and the systematic flags across the group.
pub fn check_group(group: &[&Analysis]) -> Result<()> {
    let mut all_edges = Vec::with_capacity(group.len());
    for ana in group {
        all_edges.push(check_analysis(ana)?);
    }
    for i in 0..all_edges.len() {
        for j in i + 1..all_edges.len() {
            check_compatible(&all_edges[i], &all_edges[j])?;
        }
    }
    check_systematic_flags(group)?;
    Ok(())
}
