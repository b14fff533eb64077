//! Rebinning onto a coarser template
//!
//! Maps an analysis onto a different binning: every template bin must be
//! exactly tiled by source bins (no gap, no double coverage, no source bin
//! split across template bins), and the sources falling inside each template
//! bin are combined into one.

use crate::combiner::combine_bins_into;
use cf_core::{Error, Result};
use cf_model::{Analysis, Bin, BinSpec};

/// Rebin `ana` onto `template`.
///
/// For each target bin, collects every source bin fully contained in it,
/// verifies the sources tile the target exactly, and combines them. The
/// returned analysis keeps the source analysis's identity and metadata.
pub fn rebin_analysis(template: &[BinSpec], ana: &Analysis) -> Result<Analysis> {
    let mut bins = Vec::with_capacity(template.len());
    for target in template {
        let sources: Vec<&Bin> =
            ana.bins.iter().filter(|b| target.contains(&b.spec)).collect();
        if sources.is_empty() {
            return Err(Error::Validation(format!(
                "template bin `{}` is not covered by any bin of analysis `{}`",
                target.name(),
                ana.full_name()
            )));
        }
        check_exact_tiling(target, &sources, ana)?;
        bins.push(combine_bins_into(target.clone(), &sources)?);
    }

    let mut rebinned = ana.clone();
    rebinned.bins = bins;
    Ok(rebinned)
}

/// Verify that `sources` tile `target` exactly.
///
/// The distinct source edges (plus the target's own edges) partition each
/// axis; every cell of the resulting product grid must be covered by exactly
/// one source bin. A cell with no owner is a gap, a cell with several is a
/// double coverage.
fn check_exact_tiling(target: &BinSpec, sources: &[&Bin], ana: &Analysis) -> Result<()> {
    // Per-axis sorted distinct edges, in the target's canonical axis order.
    let mut edges: Vec<Vec<f64>> = Vec::with_capacity(target.dimension());
    for boundary in target.boundaries() {
        let mut axis_edges = vec![boundary.low, boundary.high];
        for source in sources {
            // Same axis set is guaranteed by containment.
            let b = source
                .spec
                .boundary(&boundary.variable)
                .expect("contained bins share the target's axes");
            axis_edges.push(b.low);
            axis_edges.push(b.high);
        }
        axis_edges.sort_by(f64::total_cmp);
        axis_edges.dedup();
        edges.push(axis_edges);
    }

    let dims: Vec<usize> = edges.iter().map(|e| e.len() - 1).collect();
    let mut index = vec![0usize; dims.len()];
    loop {
        let cell: Vec<(f64, f64)> = index
            .iter()
            .zip(edges.iter())
            .map(|(&i, axis)| (axis[i], axis[i + 1]))
            .collect();

        let owners = sources
            .iter()
            .filter(|source| {
                target.boundaries().iter().zip(cell.iter()).all(|(boundary, &(lo, hi))| {
                    let b = source
                        .spec
                        .boundary(&boundary.variable)
                        .expect("contained bins share the target's axes");
                    b.low <= lo && hi <= b.high
                })
            })
            .count();
        if owners == 0 {
            return Err(Error::Validation(format!(
                "gap while rebinning `{}`: template bin `{}` is not fully covered",
                ana.full_name(),
                target.name()
            )));
        }
        if owners > 1 {
            return Err(Error::Validation(format!(
                "double coverage while rebinning `{}`: template bin `{}` is covered {} times",
                ana.full_name(),
                target.name(),
                owners
            )));
        }

        // Odometer increment over the cell grid.
        let mut axis = 0;
        loop {
            index[axis] += 1;
            if index[axis] < dims[axis] {
                break;
            }
            index[axis] = 0;
            axis += 1;
            if axis == dims.len() {
                return Ok(());
            }
        }
    }
}
