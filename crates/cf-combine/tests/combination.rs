//! End-to-end combination scenarios.

use approx::assert_relative_eq;
use cf_combine::{combine_analyses, CombinationMode};
use cf_model::{
    Analysis, AnalysisCorrelation, Bin, BinBoundary, BinCorrelation, BinSpec, CalibrationInfo,
    SystematicError,
};
use std::collections::BTreeMap;

fn spec1d(var: &str, lo: f64, hi: f64) -> BinSpec {
    BinSpec::new(vec![BinBoundary::new(var, lo, hi)]).unwrap()
}

fn analysis(name: &str, bins: Vec<Bin>) -> Analysis {
    Analysis {
        name: name.to_string(),
        flavor: "B".to_string(),
        tagger: "MV1".to_string(),
        operating_point: "0.60".to_string(),
        jet_algorithm: "AntiKt4".to_string(),
        bins,
        metadata: BTreeMap::new(),
        metadata_s: BTreeMap::new(),
    }
}

fn info(analyses: Vec<Analysis>) -> CalibrationInfo {
    CalibrationInfo {
        analyses,
        correlations: Vec::new(),
        bin_by_bin: false,
        combined_name: "combined".to_string(),
        defaults: BTreeMap::new(),
        aliases: BTreeMap::new(),
    }
}

#[test]
fn two_analyses_single_bin_average() {
    // Two analyses, one [0, 2.5] eta bin each, central values 1.0 and 0.5,
    // equal statistical errors: the combination is the plain mean with the
    // error scaled down by sqrt(2).
    let a = analysis("ttbar", vec![Bin::new(spec1d("eta", 0.0, 2.5), 1.0, 0.1)]);
    let b = analysis("dijet", vec![Bin::new(spec1d("eta", 0.0, 2.5), 0.5, 0.1)]);
    let combined = combine_analyses(&info(vec![a, b]), CombinationMode::BySingleBin).unwrap();

    assert_eq!(combined.analyses.len(), 1);
    let out = &combined.analyses[0];
    assert_eq!(out.name, "combined");
    assert_eq!(out.bins.len(), 1);
    assert_relative_eq!(out.bins[0].central_value, 0.75, epsilon = 1e-5);
    assert_relative_eq!(out.bins[0].stat_error, 0.1 / 2.0_f64.sqrt(), epsilon = 1e-9);
    assert_eq!(out.metadata_s["linage"], "ttbar+dijet");
    assert_eq!(combined.quality.ndof, 1);
}

#[test]
fn single_analysis_round_trips_by_single_bin() {
    let mut bin = Bin::new(spec1d("eta", 0.0, 2.5), 0.95, 0.07);
    bin.set_systematic(SystematicError::new("jes", 0.03));
    let a = analysis("ttbar", vec![bin]);
    let combined =
        combine_analyses(&info(vec![a.clone()]), CombinationMode::BySingleBin).unwrap();

    assert_eq!(combined.analyses.len(), 1);
    let out = &combined.analyses[0].bins[0];
    assert_relative_eq!(out.central_value, 0.95, epsilon = 1e-6);
    assert_relative_eq!(out.stat_error, 0.07, epsilon = 1e-6);
    assert_relative_eq!(
        out.systematic("jes").unwrap().value.abs(),
        0.03,
        epsilon = 1e-4
    );
}

#[test]
fn unpartnered_analysis_produces_no_output_in_full_mode() {
    let a = analysis("ttbar", vec![Bin::new(spec1d("eta", 0.0, 2.5), 1.0, 0.1)]);
    let combined =
        combine_analyses(&info(vec![a]), CombinationMode::ByFullAnalysis).unwrap();
    assert!(combined.analyses.is_empty());
}

#[test]
fn full_mode_requires_identical_binning() {
    let a = analysis("ttbar", vec![Bin::new(spec1d("eta", 0.0, 2.5), 1.0, 0.1)]);
    let b = analysis(
        "dijet",
        vec![
            Bin::new(spec1d("eta", 0.0, 1.2), 0.9, 0.1),
            Bin::new(spec1d("eta", 1.2, 2.5), 1.1, 0.1),
        ],
    );
    assert!(combine_analyses(&info(vec![a, b]), CombinationMode::ByFullAnalysis).is_err());
}

#[test]
fn full_mode_combines_all_bins_jointly() {
    let bins_a = vec![
        Bin::new(spec1d("pt", 20.0, 30.0), 1.00, 0.06),
        Bin::new(spec1d("pt", 30.0, 60.0), 0.96, 0.05),
    ];
    let bins_b = vec![
        Bin::new(spec1d("pt", 20.0, 30.0), 0.92, 0.08),
        Bin::new(spec1d("pt", 30.0, 60.0), 1.02, 0.07),
    ];
    let a = analysis("ttbar", bins_a);
    let b = analysis("dijet", bins_b);
    let combined =
        combine_analyses(&info(vec![a, b]), CombinationMode::ByFullAnalysis).unwrap();

    assert_eq!(combined.analyses.len(), 1);
    let out = &combined.analyses[0];
    assert_eq!(out.bins.len(), 2);
    assert_eq!(out.metadata_s["linage"], "ttbar+dijet");
    // Per-bin inverse-variance means.
    let first = out.bins.iter().find(|b| b.spec == spec1d("pt", 20.0, 30.0)).unwrap();
    let w1 = 1.0 / (0.06_f64 * 0.06);
    let w2 = 1.0 / (0.08_f64 * 0.08);
    assert_relative_eq!(
        first.central_value,
        (w1 * 1.00 + w2 * 0.92) / (w1 + w2),
        epsilon = 1e-5
    );
    // 4 measurements, 2 fitted quantities.
    assert_eq!(combined.quality.ndof, 2);
}

#[test]
fn shared_systematics_correlate_across_bins_in_full_mode() {
    // In the joint fit the same "jes" nuisance moves both bins of both
    // analyses; its per-bin contribution must survive the combination
    // un-averaged.
    let with_jes = |spec: BinSpec, v: f64| {
        let mut bin = Bin::new(spec, v, 0.05);
        bin.set_systematic(SystematicError::new("jes", 0.04));
        bin
    };
    let a = analysis(
        "ttbar",
        vec![
            with_jes(spec1d("pt", 20.0, 30.0), 1.0),
            with_jes(spec1d("pt", 30.0, 60.0), 1.0),
        ],
    );
    let b = analysis(
        "dijet",
        vec![
            with_jes(spec1d("pt", 20.0, 30.0), 1.0),
            with_jes(spec1d("pt", 30.0, 60.0), 1.0),
        ],
    );
    let combined =
        combine_analyses(&info(vec![a, b]), CombinationMode::ByFullAnalysis).unwrap();
    for bin in &combined.analyses[0].bins {
        assert_relative_eq!(bin.systematic("jes").unwrap().value.abs(), 0.04, epsilon = 3e-3);
        assert_relative_eq!(bin.stat_error, 0.05 / 2.0_f64.sqrt(), epsilon = 1e-9);
    }
}

#[test]
fn declared_statistical_correlation_widens_the_combination() {
    let a = analysis("ttbar", vec![Bin::new(spec1d("eta", 0.0, 2.5), 1.0, 0.1)]);
    let b = analysis("dijet", vec![Bin::new(spec1d("eta", 0.0, 2.5), 0.9, 0.1)]);

    let mut uncorrelated_info = info(vec![a.clone(), b.clone()]);
    let uncorrelated =
        combine_analyses(&uncorrelated_info, CombinationMode::BySingleBin).unwrap();

    uncorrelated_info.correlations.push(AnalysisCorrelation {
        analysis1: "ttbar".to_string(),
        analysis2: "dijet".to_string(),
        flavor: "B".to_string(),
        tagger: "MV1".to_string(),
        operating_point: "0.60".to_string(),
        jet_algorithm: "AntiKt4".to_string(),
        bins: vec![BinCorrelation { spec: spec1d("eta", 0.0, 2.5), statistical: Some(0.5) }],
    });
    let correlated =
        combine_analyses(&uncorrelated_info, CombinationMode::BySingleBin).unwrap();

    let e_unc = uncorrelated.analyses[0].bins[0].stat_error;
    let e_cor = correlated.analyses[0].bins[0].stat_error;
    assert!(
        e_cor > e_unc,
        "correlated stat error {e_cor} should exceed uncorrelated {e_unc}"
    );
    // No synthetic bookkeeping leaks into the output.
    assert!(correlated.analyses[0].bins[0].systematics.is_empty());
}

#[test]
fn different_identities_are_not_combined() {
    let a = analysis("ttbar", vec![Bin::new(spec1d("eta", 0.0, 2.5), 1.0, 0.1)]);
    let mut b = analysis("dijet", vec![Bin::new(spec1d("eta", 0.0, 2.5), 0.5, 0.1)]);
    b.flavor = "C".to_string();
    let combined =
        combine_analyses(&info(vec![a, b]), CombinationMode::BySingleBin).unwrap();
    // Two identity groups, one output each, untouched central values.
    assert_eq!(combined.analyses.len(), 2);
    let values: Vec<f64> =
        combined.analyses.iter().map(|a| a.bins[0].central_value).collect();
    assert!(values.iter().any(|v| (v - 1.0).abs() < 1e-6));
    assert!(values.iter().any(|v| (v - 0.5).abs() < 1e-6));
}

#[test]
fn inconsistent_boundaries_abort_the_combination() {
    // Gap inside one analysis: [0,1] then [2,3].
    let a = analysis(
        "ttbar",
        vec![
            Bin::new(spec1d("eta", 0.0, 1.0), 1.0, 0.1),
            Bin::new(spec1d("eta", 2.0, 3.0), 0.9, 0.1),
        ],
    );
    assert!(combine_analyses(&info(vec![a]), CombinationMode::BySingleBin).is_err());
}

#[test]
fn straddling_edges_abort_the_combination() {
    let a = analysis(
        "ttbar",
        vec![
            Bin::new(spec1d("eta", 0.0, 1.0), 1.0, 0.1),
            Bin::new(spec1d("eta", 1.0, 2.0), 0.9, 0.1),
        ],
    );
    let b = analysis("dijet", vec![Bin::new(spec1d("eta", 0.0, 2.0), 0.95, 0.1)]);
    assert!(combine_analyses(&info(vec![a, b]), CombinationMode::BySingleBin).is_err());
}

#[test]
fn flag_mismatch_aborts_the_combination() {
    let mut bin_a = Bin::new(spec1d("eta", 0.0, 2.5), 1.0, 0.1);
    bin_a.set_systematic(SystematicError::new("jes", 0.02));
    let mut bin_b = Bin::new(spec1d("eta", 0.0, 2.5), 0.9, 0.1);
    bin_b.set_systematic(SystematicError::uncorrelated("jes", 0.03));
    let a = analysis("ttbar", vec![bin_a]);
    let b = analysis("dijet", vec![bin_b]);
    assert!(combine_analyses(&info(vec![a, b]), CombinationMode::BySingleBin).is_err());
}

#[test]
fn partial_bin_overlap_between_analyses_combines_the_common_bin() {
    // Analysis b only covers the first bin; the second bin's combination is
    // a's bin alone.
    let a = analysis(
        "ttbar",
        vec![
            Bin::new(spec1d("pt", 20.0, 30.0), 1.0, 0.1),
            Bin::new(spec1d("pt", 30.0, 60.0), 0.8, 0.1),
        ],
    );
    let b = analysis("dijet", vec![Bin::new(spec1d("pt", 20.0, 30.0), 0.5, 0.1)]);
    let combined =
        combine_analyses(&info(vec![a, b]), CombinationMode::BySingleBin).unwrap();
    let out = &combined.analyses[0];
    assert_eq!(out.bins.len(), 2);
    let first = out.bins.iter().find(|x| x.spec == spec1d("pt", 20.0, 30.0)).unwrap();
    let second = out.bins.iter().find(|x| x.spec == spec1d("pt", 30.0, 60.0)).unwrap();
    assert_relative_eq!(first.central_value, 0.75, epsilon = 1e-5);
    assert_relative_eq!(second.central_value, 0.8, epsilon = 1e-6);
    assert_relative_eq!(second.stat_error, 0.1, epsilon = 1e-6);
}

#[test]
fn per_bin_metadata_is_carried_with_suffixes() {
    let mut bin = Bin::new(spec1d("eta", 0.0, 2.5), 1.0, 0.1);
    bin.metadata.insert(
        "efficiency".to_string(),
        cf_model::MetaValue { value: 0.7, error: 0.01 },
    );
    let a = analysis("ttbar", vec![bin]);
    let combined =
        combine_analyses(&info(vec![a]), CombinationMode::BySingleBin).unwrap();
    let merged = &combined.analyses[0].bins[0];
    assert!(merged.metadata.contains_key("efficiency-ttbar-0-eta-2.5"));
}
