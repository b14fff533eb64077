//! Analyses, correlation declarations, and the top-level container
//!
//! An [`Analysis`] is one independent calibration measurement, partitioned
//! into bins. Analyses measuring the same physical quantity share an
//! [`AnalysisIdentity`] (flavor, tagger, operating point, jet algorithm);
//! the analysis name distinguishes independent measurements of it.

use crate::bins::{Bin, BinSpec};
use cf_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;

/// The physical quantity an analysis estimates.
///
/// Two analyses with equal identity are measurements of the same thing and
/// are candidates for combination.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AnalysisIdentity {
    /// Jet flavor (e.g. `"B"`, `"C"`, `"Light"`)
    pub flavor: String,
    /// Tagging algorithm name
    pub tagger: String,
    /// Operating point (e.g. a cut value)
    pub operating_point: String,
    /// Jet collection / algorithm
    pub jet_algorithm: String,
}

/// One independent calibration measurement, partitioned into bins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Analysis {
    /// Analysis name (e.g. `"ttbar_dilep"`); distinguishes independent
    /// measurements of the same quantity
    pub name: String,
    /// Jet flavor
    pub flavor: String,
    /// Tagging algorithm
    pub tagger: String,
    /// Operating point
    pub operating_point: String,
    /// Jet collection / algorithm
    pub jet_algorithm: String,
    /// The measured bins
    pub bins: Vec<Bin>,
    /// Numeric metadata carried through combination
    #[serde(default)]
    pub metadata: BTreeMap<String, Vec<f64>>,
    /// String metadata (e.g. linage)
    #[serde(default)]
    pub metadata_s: BTreeMap<String, String>,
}

impl Analysis {
    /// Identity of the quantity this analysis measures.
    pub fn identity(&self) -> AnalysisIdentity {
        AnalysisIdentity {
            flavor: self.flavor.clone(),
            tagger: self.tagger.clone(),
            operating_point: self.operating_point.clone(),
            jet_algorithm: self.jet_algorithm.clone(),
        }
    }

    /// Full analysis name:
    /// `"<name>-<flavor>-<tagger>-<operatingPoint>-<jetAlgorithm>"`.
    pub fn full_name(&self) -> String {
        format!(
            "{}-{}-{}-{}-{}",
            self.name, self.flavor, self.tagger, self.operating_point, self.jet_algorithm
        )
    }

    /// Ignore-list key for one bin of this analysis:
    /// `"<fullAnalysisName>:<binName>"`.
    pub fn ignore_key(&self, bin: &Bin) -> String {
        format!("{}:{}", self.full_name(), bin.name())
    }

    /// The bin at exactly this position, if any.
    pub fn bin_at(&self, spec: &BinSpec) -> Option<&Bin> {
        self.bins.iter().find(|b| &b.spec == spec)
    }

    /// Drop every bin whose ignore key appears in `keys`.
    ///
    /// Returns the number of bins removed.
    pub fn remove_ignored(&mut self, keys: &HashSet<String>) -> usize {
        let full = self.full_name();
        let before = self.bins.len();
        self.bins.retain(|b| !keys.contains(&format!("{}:{}", full, b.name())));
        before - self.bins.len()
    }

    /// Remove a systematic from every bin. Returns the number of bins touched.
    pub fn remove_systematic(&mut self, name: &str) -> usize {
        let mut touched = 0;
        for bin in &mut self.bins {
            if bin.remove_systematic(name) {
                touched += 1;
            }
        }
        touched
    }

    /// Mark a systematic as uncorrelated in every bin that carries it.
    pub fn decorrelate_systematic(&mut self, name: &str) -> usize {
        let mut touched = 0;
        for bin in &mut self.bins {
            if let Some(sys) = bin.systematics.iter_mut().find(|s| s.name == name) {
                sys.uncorrelated = true;
                touched += 1;
            }
        }
        touched
    }

    /// Verify every bin is serializable (no NaN/inf values).
    pub fn validate_finite(&self) -> Result<()> {
        for bin in &self.bins {
            bin.validate_finite().map_err(|e| match e {
                Error::NotFinite { context } => Error::NotFinite {
                    context: format!("{} in analysis `{}`", context, self.full_name()),
                },
                other => other,
            })?;
        }
        Ok(())
    }
}

/// Statistical correlation declared for one bin position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinCorrelation {
    /// Position the correlation applies to
    pub spec: BinSpec,
    /// Statistical correlation coefficient in [-1, 1]
    #[serde(default)]
    pub statistical: Option<f64>,
}

/// Declared statistical correlation between two analyses of one quantity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisCorrelation {
    /// First analysis name
    pub analysis1: String,
    /// Second analysis name
    pub analysis2: String,
    /// Jet flavor
    pub flavor: String,
    /// Tagging algorithm
    pub tagger: String,
    /// Operating point
    pub operating_point: String,
    /// Jet collection / algorithm
    pub jet_algorithm: String,
    /// Per-bin correlation coefficients
    pub bins: Vec<BinCorrelation>,
}

impl AnalysisCorrelation {
    /// Identity of the quantity this declaration refers to.
    pub fn identity(&self) -> AnalysisIdentity {
        AnalysisIdentity {
            flavor: self.flavor.clone(),
            tagger: self.tagger.clone(),
            operating_point: self.operating_point.clone(),
            jet_algorithm: self.jet_algorithm.clone(),
        }
    }

    /// Whether this declaration links the two named analyses (in either order).
    pub fn links(&self, a: &str, b: &str) -> bool {
        (self.analysis1 == a && self.analysis2 == b)
            || (self.analysis1 == b && self.analysis2 == a)
    }

    /// The declared statistical correlation at a bin position, if any.
    pub fn statistical_at(&self, spec: &BinSpec) -> Option<f64> {
        self.bins.iter().find(|b| &b.spec == spec).and_then(|b| b.statistical)
    }

    /// Validate coefficient ranges.
    pub fn validate(&self) -> Result<()> {
        for bin in &self.bins {
            if let Some(rho) = bin.statistical {
                if !(-1.0..=1.0).contains(&rho) {
                    return Err(Error::Validation(format!(
                        "statistical correlation {} for `{}`/`{}` at `{}` outside [-1, 1]",
                        rho,
                        self.analysis1,
                        self.analysis2,
                        bin.spec.name()
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Top-level calibration container: the unit handed to the combiner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationInfo {
    /// All analyses to combine
    pub analyses: Vec<Analysis>,
    /// Cross-analysis statistical correlation declarations
    #[serde(default)]
    pub correlations: Vec<AnalysisCorrelation>,
    /// Combine each bin independently instead of per-analysis joint fits
    #[serde(default)]
    pub bin_by_bin: bool,
    /// Name given to combined output analyses
    pub combined_name: String,
    /// Default values for parser collaborators
    #[serde(default)]
    pub defaults: BTreeMap<String, String>,
    /// Name aliases for parser collaborators
    #[serde(default)]
    pub aliases: BTreeMap<String, String>,
}

impl CalibrationInfo {
    /// Read a container from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Parse a container from JSON text and validate correlation ranges.
    pub fn from_json(text: &str) -> Result<Self> {
        let info: CalibrationInfo = serde_json::from_str(text)?;
        for corr in &info.correlations {
            corr.validate()?;
        }
        Ok(info)
    }

    /// Serialize to JSON text. Fails loudly if any stored value is NaN.
    pub fn to_json(&self) -> Result<String> {
        for ana in &self.analyses {
            ana.validate_finite()?;
        }
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Write the container to a JSON file (with the NaN guard).
    pub fn to_json_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let text = self.to_json()?;
        fs::write(path, text)?;
        Ok(())
    }

    /// Drop every bin matching an ignore key. Returns the number removed.
    pub fn apply_ignores(&mut self, keys: &HashSet<String>) -> usize {
        self.analyses.iter_mut().map(|a| a.remove_ignored(keys)).sum()
    }

    /// Correlation declarations applying to a quantity and a pair of
    /// analysis names, in either order.
    pub fn correlations_for(
        &self,
        identity: &AnalysisIdentity,
        a: &str,
        b: &str,
    ) -> Vec<&AnalysisCorrelation> {
        self.correlations
            .iter()
            .filter(|c| &c.identity() == identity && c.links(a, b))
            .collect()
    }
}
