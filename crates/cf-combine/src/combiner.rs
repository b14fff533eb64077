//! Combination at the level of bins and whole analyses
//!
//! [`combine_bin`] merges bins at one position into a single bin.
//! [`combine_analyses`] groups a [`CalibrationInfo`]'s analyses by the
//! quantity they measure and combines each group, either bin by bin or as
//! one joint fit per group with cross-bin correlations honored.

use crate::context::{CombinationContext, MeasurementId, STATISTICAL};
use cf_core::{CombinedValue, Error, FitQuality, Result};
use cf_model::consistency;
use cf_model::{
    Analysis, AnalysisIdentity, Bin, BinSpec, CalibrationInfo, SystematicError,
};
use statrs::function::gamma::gamma_lr;
use std::collections::{BTreeMap, BTreeSet};

/// How a group of analyses is combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CombinationMode {
    /// One joint fit per group across all bins and analyses. Requires
    /// identical binning; cross-bin systematic correlations are honored.
    /// Analyses without a combination partner produce no output.
    ByFullAnalysis,
    /// An independent fit per bin position. Analyses without a partner pass
    /// through (combined with themselves only).
    BySingleBin,
}

/// Output of [`combine_analyses`].
#[derive(Debug, Clone)]
pub struct CombinedAnalyses {
    /// One combined analysis per identity group
    pub analyses: Vec<Analysis>,
    /// Accumulated goodness of fit over all groups
    pub quality: FitQuality,
}

/// Chi-square tail probability.
fn chi2_p_value(chi2: f64, ndof: usize) -> f64 {
    if ndof > 0 && chi2.is_finite() && chi2 >= 0.0 {
        1.0 - gamma_lr(ndof as f64 / 2.0, chi2 / 2.0)
    } else {
        f64::NAN
    }
}

/// Register one bin as a measurement of `what`.
///
/// Correlated systematics keep their name, so same-named errors in other
/// bins share a nuisance parameter. Uncorrelated systematics are wired under
/// a per-measurement unique name (`name{index}`) so nothing shares them; the
/// merged bin folds them back under the base name.
fn wire_bin(
    ctx: &mut CombinationContext,
    what: &str,
    measurement_name: &str,
    bin: &Bin,
    index: usize,
    wired: &mut BTreeMap<String, (String, bool)>,
) -> MeasurementId {
    let id = ctx.add_measurement(measurement_name, what, bin.central_value, bin.stat_error);
    for sys in &bin.systematics {
        let wired_name = if sys.uncorrelated {
            format!("{}{{{}}}", sys.name, index)
        } else {
            sys.name.clone()
        };
        wired.entry(wired_name.clone()).or_insert_with(|| (sys.name.clone(), sys.uncorrelated));
        ctx.measurement_mut(id).add_systematic(wired_name, sys.value);
    }
    id
}

/// Build the merged bin from a fit result, folding per-measurement
/// uncorrelated variants back under their base names.
fn assemble_bin(
    spec: BinSpec,
    combined: &CombinedValue,
    wired: &BTreeMap<String, (String, bool)>,
) -> Bin {
    let mut bin = Bin::new(spec, combined.central_value, combined.stat_error);
    let mut uncorrelated2: BTreeMap<String, f64> = BTreeMap::new();
    for (wired_name, contribution) in &combined.systematics {
        match wired.get(wired_name) {
            Some((base, true)) => {
                *uncorrelated2.entry(base.clone()).or_insert(0.0) +=
                    contribution * contribution;
            }
            Some((base, false)) => {
                bin.set_systematic(SystematicError::new(base.clone(), *contribution));
            }
            None => {
                bin.set_systematic(SystematicError::new(wired_name.clone(), *contribution));
            }
        }
    }
    for (base, sum2) in uncorrelated2 {
        bin.set_systematic(SystematicError::uncorrelated(base, sum2.sqrt()));
    }
    bin
}

/// Combine bins at one position into a single bin.
///
/// All inputs must share the same [`BinSpec`]; systematic errors with the
/// same name are treated as fully correlated across the inputs.
pub fn combine_bin(bins: &[&Bin]) -> Result<Bin> {
    let first = bins
        .first()
        .ok_or_else(|| Error::EmptyCombination("no bins to combine".into()))?;
    for bin in &bins[1..] {
        if bin.spec != first.spec {
            return Err(Error::BinSpecMismatch {
                expected: first.name(),
                found: bin.name(),
            });
        }
    }
    combine_bins_into(first.spec.clone(), bins)
}

/// Combine bins into a result carrying `spec`, without requiring the inputs
/// to share it. The rebinner uses this to merge sub-bins into a coarser
/// target position.
pub(crate) fn combine_bins_into(spec: BinSpec, bins: &[&Bin]) -> Result<Bin> {
    if bins.is_empty() {
        return Err(Error::EmptyCombination("no bins to combine".into()));
    }
    let what = spec.name();
    let mut ctx = CombinationContext::new();
    let mut wired = BTreeMap::new();
    for (index, bin) in bins.iter().enumerate() {
        wire_bin(&mut ctx, &what, &format!("m{index}"), bin, index, &mut wired);
    }
    let fit = ctx.fit()?;
    let combined = fit.results.get(&what).ok_or_else(|| {
        Error::Computation(format!("no fit result for bin `{what}`"))
    })?;
    let mut merged = assemble_bin(spec, combined, &wired);
    merged.extended = bins.iter().all(|b| b.extended);
    Ok(merged)
}

/// Apply declared statistical correlations for one bin position to the
/// measurements already wired into a context.
fn apply_declared_correlations(
    info: &CalibrationInfo,
    identity: &AnalysisIdentity,
    spec: &BinSpec,
    ids: &[(&str, MeasurementId)],
    ctx: &mut CombinationContext,
) -> Result<()> {
    for (a, &(name_a, id_a)) in ids.iter().enumerate() {
        for &(name_b, id_b) in &ids[a + 1..] {
            for corr in info.correlations_for(identity, name_a, name_b) {
                if let Some(rho) = corr.statistical_at(spec) {
                    ctx.add_correlation(STATISTICAL, id_a, id_b, rho)?;
                }
            }
        }
    }
    Ok(())
}

fn merged_analysis(
    info: &CalibrationInfo,
    identity: &AnalysisIdentity,
    group: &[&Analysis],
    bins: Vec<Bin>,
    quality: FitQuality,
) -> Analysis {
    let linage = group.iter().map(|a| a.name.clone()).collect::<Vec<_>>().join("+");
    let mut metadata = BTreeMap::new();
    metadata.insert("chi2".to_string(), vec![quality.chi2]);
    metadata.insert("ndof".to_string(), vec![quality.ndof as f64]);
    let mut metadata_s = BTreeMap::new();
    metadata_s.insert("linage".to_string(), linage);
    Analysis {
        name: info.combined_name.clone(),
        flavor: identity.flavor.clone(),
        tagger: identity.tagger.clone(),
        operating_point: identity.operating_point.clone(),
        jet_algorithm: identity.jet_algorithm.clone(),
        bins,
        metadata,
        metadata_s,
    }
}

/// Combine each bin position of a group independently.
fn combine_group_single_bin(
    info: &CalibrationInfo,
    identity: &AnalysisIdentity,
    group: &[&Analysis],
) -> Result<(Analysis, FitQuality)> {
    let positions: BTreeSet<&BinSpec> =
        group.iter().flat_map(|a| a.bins.iter().map(|b| &b.spec)).collect();

    let mut bins = Vec::new();
    let mut chi2 = 0.0;
    let mut ndof = 0;
    for spec in positions {
        let sources: Vec<(&Analysis, &Bin)> =
            group.iter().filter_map(|a| a.bin_at(spec).map(|b| (*a, b))).collect();

        let what = spec.name();
        let mut ctx = CombinationContext::new();
        let mut wired = BTreeMap::new();
        let mut ids: Vec<(&str, MeasurementId)> = Vec::with_capacity(sources.len());
        for (index, (ana, bin)) in sources.iter().enumerate() {
            let id = wire_bin(
                &mut ctx,
                &what,
                &format!("{}:{}", ana.full_name(), bin.name()),
                bin,
                index,
                &mut wired,
            );
            ids.push((ana.name.as_str(), id));
        }
        apply_declared_correlations(info, identity, spec, &ids, &mut ctx)?;

        let fit = ctx.fit()?;
        let combined = fit
            .results
            .get(&what)
            .ok_or_else(|| Error::Computation(format!("no fit result for bin `{what}`")))?;
        let mut merged = assemble_bin(spec.clone(), combined, &wired);
        merged.extended = sources.iter().all(|(_, b)| b.extended);
        for (ana, source) in &sources {
            for (key, value) in &source.metadata {
                merged
                    .metadata
                    .insert(format!("{}-{}-{}", key, ana.name, source.name()), *value);
            }
        }
        if fit.quality.chi2.is_finite() {
            chi2 += fit.quality.chi2;
            ndof += fit.quality.ndof;
        }
        bins.push(merged);
    }

    let quality = FitQuality { chi2, ndof, p_value: chi2_p_value(chi2, ndof) };
    Ok((merged_analysis(info, identity, group, bins, quality), quality))
}

/// Combine a group with one joint fit across all bins and analyses.
///
/// Systematic names shared between bins map onto one nuisance parameter
/// each, so cross-bin correlations are propagated exactly.
fn combine_group_full(
    info: &CalibrationInfo,
    identity: &AnalysisIdentity,
    group: &[&Analysis],
) -> Result<(Analysis, FitQuality)> {
    // Identical binning across the group is a precondition of the joint fit.
    let reference: BTreeSet<&BinSpec> = group[0].bins.iter().map(|b| &b.spec).collect();
    for ana in &group[1..] {
        let positions: BTreeSet<&BinSpec> = ana.bins.iter().map(|b| &b.spec).collect();
        if positions != reference {
            return Err(Error::Validation(format!(
                "analyses `{}` and `{}` do not share identical bin boundaries",
                group[0].full_name(),
                ana.full_name()
            )));
        }
    }

    let mut ctx = CombinationContext::new();
    let mut wired = BTreeMap::new();
    let mut index = 0;
    let mut ids_by_position: BTreeMap<&BinSpec, Vec<(&str, MeasurementId)>> = BTreeMap::new();
    for spec in &reference {
        let mut ids = Vec::with_capacity(group.len());
        let what = spec.name();
        for ana in group {
            let bin = ana.bin_at(spec).expect("identical binning verified above");
            let id = wire_bin(
                &mut ctx,
                &what,
                &format!("{}:{}", ana.full_name(), bin.name()),
                bin,
                index,
                &mut wired,
            );
            index += 1;
            ids.push((ana.name.as_str(), id));
        }
        ids_by_position.insert(*spec, ids);
    }
    for (spec, ids) in &ids_by_position {
        apply_declared_correlations(info, identity, spec, ids, &mut ctx)?;
    }

    let fit = ctx.fit()?;
    let mut bins = Vec::new();
    for spec in &reference {
        let what = spec.name();
        let combined = fit
            .results
            .get(&what)
            .ok_or_else(|| Error::Computation(format!("no fit result for bin `{what}`")))?;
        let mut merged = assemble_bin((*spec).clone(), combined, &wired);
        merged.extended = group.iter().all(|a| {
            a.bin_at(spec).map(|b| b.extended).unwrap_or(false)
        });
        bins.push(merged);
    }

    Ok((merged_analysis(info, identity, group, bins, fit.quality), fit.quality))
}

/// Combine every identity group of a calibration container.
///
/// Structural inconsistencies (boundary gaps/overlaps, straddling edges,
/// disagreeing correlation flags) abort with a typed error; degenerate
/// correlation configurations inside a fit degrade to excluding the weaker
/// measurement.
pub fn combine_analyses(
    info: &CalibrationInfo,
    mode: CombinationMode,
) -> Result<CombinedAnalyses> {
    let mut groups: BTreeMap<AnalysisIdentity, Vec<&Analysis>> = BTreeMap::new();
    for ana in &info.analyses {
        groups.entry(ana.identity()).or_default().push(ana);
    }

    let mut analyses = Vec::new();
    let mut chi2 = 0.0;
    let mut ndof = 0;
    for (identity, group) in &groups {
        consistency::check_group(group)?;
        let combined = match mode {
            CombinationMode::BySingleBin => {
                combine_group_single_bin(info, identity, group)?
            }
            CombinationMode::ByFullAnalysis => {
                if group.len() < 2 {
                    log::info!(
                        "analysis `{}` has no combination partner; skipping",
                        group[0].full_name()
                    );
                    continue;
                }
                combine_group_full(info, identity, group)?
            }
        };
        if combined.1.chi2.is_finite() {
            chi2 += combined.1.chi2;
            ndof += combined.1.ndof;
        }
        analyses.push(combined.0);
    }

    Ok(CombinedAnalyses {
        analyses,
        quality: FitQuality { chi2, ndof, p_value: chi2_p_value(chi2, ndof) },
    })
}
